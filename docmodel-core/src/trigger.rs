//! Change-feed triggers.
//!
//! A trigger registration opens a watch on one collection, scoped to a single
//! [`EventKind`], and spawns one task that decodes each event and hands it to the
//! caller's callback. Events of one registration are delivered strictly in arrival
//! order on that task; separate registrations are independent.
//!
//! Every registration made through one model handle observes the same
//! [`TriggerSignal`]. [`TriggerSignal::invalidate`] cancels all of them at once and arms
//! a fresh token, so registrations made afterwards open new watches.
//!
//! A watch ends when it is invalidated, when the store closes the stream, or when an
//! event cannot be decoded. Nothing is reported to the caller in any of these cases
//! besides a `tracing` event; the callback simply stops firing.

use bson::{Bson, Document};
use futures::StreamExt;
use parking_lot::Mutex;
use std::{fmt, sync::Arc};
use tokio::task::JoinHandle;
pub use tokio_util::sync::CancellationToken;

use crate::{
    backend::{Namespace, StoreBackend},
    entity::{Entity, EntityExt},
    error::{ModelError, ModelResult},
};

/// Change-event kinds a trigger can be scoped to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Insert,
    Update,
    Delete,
    Replace,
    Drop,
    Rename,
    Invalidate,
}

impl EventKind {
    /// The `operationType` value of this kind.
    pub fn operation_type(&self) -> &'static str {
        match self {
            EventKind::Insert => "insert",
            EventKind::Update => "update",
            EventKind::Delete => "delete",
            EventKind::Replace => "replace",
            EventKind::Drop => "drop",
            EventKind::Rename => "rename",
            EventKind::Invalidate => "invalidate",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.operation_type())
    }
}

/// A decoded change event.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent<E> {
    Insert(E),
    /// Carries the post-change document.
    Update(E),
    Replace(E),
    /// Carries the `_id` of the removed document.
    Delete(Bson),
    Drop,
    Rename,
    Invalidate,
}

/// Optional settings for a trigger registration.
#[derive(Debug, Clone, Default)]
pub struct TriggerOptions {
    /// Extra predicates on the event envelope, e.g. `{"fullDocument.role": "admin"}`.
    pub filter: Option<Document>,
    /// A caller-owned token; cancelling it closes this registration as well.
    pub token: Option<CancellationToken>,
}

impl TriggerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, filter: Document) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn token(mut self, token: CancellationToken) -> Self {
        self.token = Some(token);
        self
    }
}

/// The teardown signal shared by every trigger of one model handle.
#[derive(Debug, Clone, Default)]
pub struct TriggerSignal {
    current: Arc<Mutex<CancellationToken>>,
}

impl TriggerSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the token new registrations attach to.
    pub fn token(&self) -> CancellationToken {
        self.current.lock().clone()
    }

    /// Closes every watch attached so far.
    ///
    /// Calling it again with no registrations in between is a no-op.
    pub fn invalidate(&self) {
        let mut current = self.current.lock();
        current.cancel();
        *current = CancellationToken::new();
    }
}

/// Handle to a running trigger registration.
#[derive(Debug)]
pub struct Trigger {
    kind: EventKind,
    namespace: Namespace,
    task: JoinHandle<()>,
}

impl Trigger {
    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// Returns `true` once the watch task has ended.
    pub fn is_closed(&self) -> bool {
        self.task.is_finished()
    }

    /// Waits for the watch task to end.
    pub async fn closed(self) {
        if let Err(err) = self.task.await {
            tracing::warn!(namespace = %self.namespace, kind = %self.kind, error = %err, "trigger task failed");
        }
    }
}

/// Builds the watch pipeline: the caller's filter plus the mandatory
/// `operationType` equality.
pub fn watch_pipeline(kind: EventKind, filter: Option<Document>) -> Vec<Document> {
    let mut predicate = filter.unwrap_or_default();
    predicate.insert("operationType", kind.operation_type());

    let mut stage = Document::new();
    stage.insert("$match", predicate);
    vec![stage]
}

/// Decodes a raw change envelope into a typed event.
///
/// # Errors
///
/// Returns [`ModelError::Watch`] when the envelope lacks its payload and
/// [`ModelError::Serialization`] when the payload does not fit `E`.
pub fn decode_event<E: Entity>(kind: EventKind, mut envelope: Document) -> ModelResult<ChangeEvent<E>> {
    let full_document = |envelope: &mut Document| match envelope.remove("fullDocument") {
        Some(Bson::Document(document)) => E::from_document(document),
        _ => Err(ModelError::Watch(format!("{} event carries no fullDocument", kind))),
    };

    Ok(match kind {
        EventKind::Insert => ChangeEvent::Insert(full_document(&mut envelope)?),
        EventKind::Update => ChangeEvent::Update(full_document(&mut envelope)?),
        EventKind::Replace => ChangeEvent::Replace(full_document(&mut envelope)?),
        EventKind::Delete => {
            let key = match envelope.get("documentKey") {
                Some(Bson::Document(key)) => key.get("_id").cloned(),
                _ => None,
            };
            ChangeEvent::Delete(
                key.ok_or_else(|| ModelError::Watch("delete event carries no documentKey".into()))?,
            )
        }
        EventKind::Drop => ChangeEvent::Drop,
        EventKind::Rename => ChangeEvent::Rename,
        EventKind::Invalidate => ChangeEvent::Invalidate,
    })
}

/// Opens a watch and spawns its dispatch task.
///
/// # Errors
///
/// Returns an error if the store refuses to open the change stream.
pub(crate) async fn spawn<E, F>(
    backend: Arc<dyn StoreBackend>,
    namespace: Namespace,
    kind: EventKind,
    options: TriggerOptions,
    signal: CancellationToken,
    callback: F,
) -> ModelResult<Trigger>
where
    E: Entity,
    F: Fn(ChangeEvent<E>) + Send + Sync + 'static,
{
    let pipeline = watch_pipeline(kind, options.filter);
    let mut stream = backend.watch(&namespace, pipeline).await?;
    let extra = options.token.unwrap_or_default();
    let task_namespace = namespace.clone();

    tracing::debug!(namespace = %namespace, kind = %kind, "trigger registered");

    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                _ = signal.cancelled() => {
                    tracing::debug!(namespace = %task_namespace, kind = %kind, "trigger invalidated");
                    break;
                }
                _ = extra.cancelled() => {
                    tracing::debug!(namespace = %task_namespace, kind = %kind, "trigger cancelled");
                    break;
                }
                next = stream.next() => match next {
                    Some(Ok(envelope)) => match decode_event::<E>(kind, envelope) {
                        Ok(event) => callback(event),
                        Err(err) => {
                            tracing::warn!(namespace = %task_namespace, kind = %kind, error = %err, "closing watch on undecodable event");
                            break;
                        }
                    },
                    Some(Err(err)) => {
                        tracing::warn!(namespace = %task_namespace, kind = %kind, error = %err, "change stream failed");
                        break;
                    }
                    None => {
                        tracing::debug!(namespace = %task_namespace, kind = %kind, "change stream ended");
                        break;
                    }
                },
            }
        }
    });

    Ok(Trigger { kind, namespace, task })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Note {
        text: String,
    }

    impl Entity for Note {
        fn collection_name() -> &'static str {
            "notes"
        }
    }

    #[test]
    fn test_watch_pipeline_forces_operation_type() {
        let pipeline = watch_pipeline(
            EventKind::Update,
            Some(doc! { "operationType": "insert", "fullDocument.text": "x" }),
        );

        assert_eq!(
            pipeline,
            vec![doc! { "$match": { "operationType": "update", "fullDocument.text": "x" } }]
        );
    }

    #[test]
    fn test_decode_insert_and_delete() {
        let insert = decode_event::<Note>(
            EventKind::Insert,
            doc! { "operationType": "insert", "fullDocument": { "text": "hi" } },
        )
        .unwrap();
        assert_eq!(insert, ChangeEvent::Insert(Note { text: "hi".into() }));

        let delete = decode_event::<Note>(
            EventKind::Delete,
            doc! { "operationType": "delete", "documentKey": { "_id": 7 } },
        )
        .unwrap();
        assert_eq!(delete, ChangeEvent::Delete(Bson::Int32(7)));
    }

    #[test]
    fn test_decode_rejects_malformed_payload() {
        let missing = decode_event::<Note>(EventKind::Update, doc! { "operationType": "update" });
        assert!(matches!(missing, Err(ModelError::Watch(_))));

        let wrong_shape = decode_event::<Note>(
            EventKind::Insert,
            doc! { "fullDocument": { "text": 5 } },
        );
        assert!(matches!(wrong_shape, Err(ModelError::Serialization(_))));
    }

    #[test]
    fn test_invalidate_rearms_signal() {
        let signal = TriggerSignal::new();
        let first = signal.token();
        signal.invalidate();

        assert!(first.is_cancelled());
        assert!(!signal.token().is_cancelled());
    }
}
