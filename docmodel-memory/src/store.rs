//! In-memory storage implementation of the store command protocol.
//!
//! Collections are vectors of BSON documents kept in insertion order behind an
//! async-aware read-write lock. Every command works on a copy of the target
//! collection and swaps it in only once the command and the unique index checks
//! succeed, so a failing command never leaves a partial write behind.

use async_trait::async_trait;
use bson::{Bson, DateTime, Document, doc, oid::ObjectId};
use futures::{StreamExt, stream};
use mea::rwlock::RwLock;
use std::{
    any::Any,
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};
use tokio::sync::broadcast::{self, error::RecvError};

use docmodel_core::{
    backend::{
        ChangeStream, IndexDefinition, Namespace, ReturnDocument, StoreBackend, StoreBackendBuilder,
        StoreSession, UpdateOutcome,
    },
    error::{ModelError, ModelResult},
};

use crate::{
    aggregate::Aggregator,
    evaluator::{apply_update, is_update_document, matches, upsert_seed, value_at},
};

/// Default number of change events buffered per subscriber.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

type Collections = HashMap<Namespace, Vec<Document>>;
type ChangeRecord = (Namespace, Document);

#[derive(Debug, Default)]
struct State {
    collections: Collections,
    indexes: HashMap<Namespace, Vec<IndexDefinition>>,
}

/// A change produced by one command, turned into an envelope once the command
/// succeeds.
struct Change {
    operation: &'static str,
    key: Bson,
    full_document: Option<Document>,
}

impl Change {
    fn new(operation: &'static str, document: &Document) -> Self {
        Self {
            operation,
            key: document.get("_id").cloned().unwrap_or(Bson::Null),
            full_document: Some(document.clone()),
        }
    }

    fn delete(document: &Document) -> Self {
        Self {
            operation: "delete",
            key: document.get("_id").cloned().unwrap_or(Bson::Null),
            full_document: None,
        }
    }
}

/// Thread-safe in-memory document store.
///
/// Clones share the same data, change feed and sessions. Writes are visible to
/// readers immediately, including writes made inside a transaction; aborting a
/// transaction restores every collection it touched to its state before the first
/// write of the transaction.
///
/// # Example
///
/// ```ignore
/// use docmodel_memory::MemoryStore;
/// use docmodel_core::backend::{Namespace, StoreBackend, StoreBackendBuilder};
/// use bson::doc;
///
/// let store = MemoryStore::builder().build().await?;
/// let users = Namespace::new("app", "users");
///
/// store.insert_many(&users, vec![doc! { "name": "Alice" }], None).await?;
/// let rows = store.aggregate(&users, vec![doc! { "$match": { "name": "Alice" } }], None).await?;
/// assert_eq!(rows.len(), 1);
/// ```
#[derive(Clone, Debug)]
pub struct MemoryStore {
    state: Arc<RwLock<State>>,
    events: broadcast::Sender<ChangeRecord>,
    sequence: Arc<AtomicU64>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::with_event_capacity(DEFAULT_EVENT_CAPACITY)
    }
}

impl MemoryStore {
    /// Creates a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn with_event_capacity(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self {
            state: Arc::new(RwLock::new(State::default())),
            events,
            sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn builder() -> MemoryStoreBuilder {
        MemoryStoreBuilder::default()
    }

    /// Returns a copy of every document stored in `namespace`, in insertion order.
    pub async fn documents(&self, namespace: &Namespace) -> Vec<Document> {
        self.state
            .read()
            .await
            .collections
            .get(namespace)
            .cloned()
            .unwrap_or_default()
    }

    /// Lists the namespaces that currently hold a collection.
    pub async fn namespaces(&self) -> Vec<Namespace> {
        self.state.read().await.collections.keys().cloned().collect()
    }

    fn envelope(&self, namespace: &Namespace, change: Change) -> Document {
        let token = self.sequence.fetch_add(1, Ordering::SeqCst);
        let mut envelope = doc! {
            "_id": { "_data": format!("{:016x}", token) },
            "operationType": change.operation,
            "clusterTime": DateTime::now(),
            "ns": { "db": namespace.database.as_str(), "coll": namespace.collection.as_str() },
        };
        if change.operation != "drop" {
            envelope.insert("documentKey", doc! { "_id": change.key });
        }
        if let Some(full_document) = change.full_document {
            envelope.insert("fullDocument", full_document);
        }
        envelope
    }

    fn publish(&self, records: Vec<ChangeRecord>) {
        for record in records {
            // Sending only fails when nobody is subscribed.
            let _ = self.events.send(record);
        }
    }

    /// Recovers the concrete session of a command, if it has an open transaction.
    fn transaction<'s>(&self, session: Option<&'s mut dyn StoreSession>) -> ModelResult<Option<&'s mut MemorySession>> {
        let Some(session) = session else {
            return Ok(None);
        };
        let session = session
            .as_any_mut()
            .downcast_mut::<MemorySession>()
            .ok_or_else(|| ModelError::Session("session was not started by the in-memory store".into()))?;

        if !Arc::ptr_eq(&session.store.state, &self.state) {
            return Err(ModelError::Session("session belongs to another in-memory store".into()));
        }

        Ok(session.in_transaction.then_some(session))
    }

    /// Runs one write command against a copy of the collection in `namespace`.
    async fn write<R>(
        &self,
        namespace: &Namespace,
        session: Option<&mut dyn StoreSession>,
        command: impl FnOnce(&mut Vec<Document>) -> ModelResult<(R, Vec<Change>)>,
    ) -> ModelResult<R> {
        let transaction = self.transaction(session)?;

        let mut state = self.state.write().await;
        let State { collections, indexes } = &mut *state;
        let current = collections.get(namespace).cloned().unwrap_or_default();

        let mut working = current.clone();
        let (result, changes) = command(&mut working)?;
        if changes.is_empty() {
            return Ok(result);
        }
        check_unique(
            &working,
            indexes.get(namespace).map(Vec::as_slice).unwrap_or_default(),
        )?;

        collections.insert(namespace.clone(), working);
        drop(state);

        let records = changes
            .into_iter()
            .map(|change| (namespace.clone(), self.envelope(namespace, change)))
            .collect::<Vec<_>>();

        match transaction {
            Some(transaction) => {
                transaction
                    .snapshots
                    .entry(namespace.clone())
                    .or_insert(current);
                transaction.pending.extend(records);
            }
            None => self.publish(records),
        }

        Ok(result)
    }
}

/// Rejects duplicate `_id`s and duplicate keys of unique indexes.
fn check_unique(documents: &[Document], indexes: &[IndexDefinition]) -> ModelResult<()> {
    let id_index = IndexDefinition {
        keys: doc! { "_id": 1 },
        unique: true,
        sparse: false,
    };

    for index in std::iter::once(&id_index).chain(indexes.iter().filter(|index| index.unique)) {
        let mut seen: Vec<Vec<Bson>> = Vec::with_capacity(documents.len());
        for document in documents {
            let key: Vec<Bson> = index
                .keys
                .keys()
                .map(|path| value_at(document, path).cloned().unwrap_or(Bson::Null))
                .collect();
            if index.sparse && key.iter().all(|value| matches!(value, Bson::Null)) {
                continue;
            }
            if seen.contains(&key) {
                return Err(ModelError::Backend(format!(
                    "duplicate key error on index {}: {:?}",
                    index.keys, key
                )));
            }
            seen.push(key);
        }
    }

    Ok(())
}

fn ensure_id(document: &mut Document) -> Bson {
    match document.get("_id") {
        Some(id) => id.clone(),
        None => {
            let id = Bson::ObjectId(ObjectId::new());
            let mut with_id = doc! { "_id": id.clone() };
            for (key, value) in std::mem::take(document) {
                with_id.insert(key, value);
            }
            *document = with_id;
            id
        }
    }
}

fn position(documents: &[Document], filter: &Document) -> ModelResult<Option<usize>> {
    for (index, document) in documents.iter().enumerate() {
        if matches(document, filter)? {
            return Ok(Some(index));
        }
    }
    Ok(None)
}

fn positions(documents: &[Document], filter: &Document, multi: bool) -> ModelResult<Vec<usize>> {
    if !multi {
        return Ok(position(documents, filter)?.into_iter().collect());
    }
    let mut found = Vec::new();
    for (index, document) in documents.iter().enumerate() {
        if matches(document, filter)? {
            found.push(index);
        }
    }
    Ok(found)
}

/// Applies `update` to a copy of `document`, refusing to change its `_id`.
fn updated(document: &Document, update: &Document) -> ModelResult<Document> {
    let mut next = document.clone();
    apply_update(&mut next, update, false)?;
    if next.get("_id") != document.get("_id") {
        return Err(ModelError::Query("the `_id` field is immutable".into()));
    }
    Ok(next)
}

/// Builds the document replacing `document`, keeping its `_id`.
fn replaced(document: Option<&Document>, replacement: &Document) -> ModelResult<Document> {
    if replacement.keys().any(|key| key.starts_with('$')) {
        return Err(ModelError::Query("replacement document must not contain operators".into()));
    }

    let mut next = Document::new();
    match document.and_then(|document| document.get("_id")) {
        Some(id) => {
            if replacement.get("_id").is_some_and(|other| other != id) {
                return Err(ModelError::Query("the `_id` field is immutable".into()));
            }
            next.insert("_id", id.clone());
        }
        None => {
            next.insert("_id", replacement.get("_id").cloned().unwrap_or_else(|| Bson::ObjectId(ObjectId::new())));
        }
    }
    for (key, value) in replacement {
        if key != "_id" {
            next.insert(key.as_str(), value.clone());
        }
    }
    Ok(next)
}

fn upserted(filter: &Document, update: &Document) -> ModelResult<Document> {
    let mut document = upsert_seed(filter)?;
    apply_update(&mut document, update, true)?;
    ensure_id(&mut document);
    Ok(document)
}

fn upserted_replacement(filter: &Document, replacement: &Document) -> ModelResult<Document> {
    let mut document = upsert_seed(filter)?;
    for (key, value) in replacement {
        document.insert(key.as_str(), value.clone());
    }
    replaced(None, &document)
}

#[async_trait]
impl StoreBackend for MemoryStore {
    async fn ping(&self) -> ModelResult<()> {
        Ok(())
    }

    async fn aggregate(
        &self,
        namespace: &Namespace,
        pipeline: Vec<Document>,
        session: Option<&mut dyn StoreSession>,
    ) -> ModelResult<Vec<Document>> {
        self.transaction(session)?;

        let state = self.state.read().await;
        let documents = state.collections.get(namespace).cloned().unwrap_or_default();
        Aggregator::new(&state.collections, &namespace.database).run(documents, &pipeline)
    }

    async fn insert_many(
        &self,
        namespace: &Namespace,
        documents: Vec<Document>,
        session: Option<&mut dyn StoreSession>,
    ) -> ModelResult<Vec<Bson>> {
        self.write(namespace, session, |collection| {
            let mut ids = Vec::with_capacity(documents.len());
            let mut changes = Vec::with_capacity(documents.len());
            for mut document in documents {
                ids.push(ensure_id(&mut document));
                changes.push(Change::new("insert", &document));
                collection.push(document);
            }
            Ok((ids, changes))
        })
        .await
    }

    async fn update(
        &self,
        namespace: &Namespace,
        filter: Document,
        update: Document,
        multi: bool,
        upsert: bool,
        session: Option<&mut dyn StoreSession>,
    ) -> ModelResult<UpdateOutcome> {
        if !is_update_document(&update) {
            return Err(ModelError::Query("update document must only contain operators".into()));
        }

        self.write(namespace, session, |collection| {
            let mut outcome = UpdateOutcome::default();
            let mut changes = Vec::new();

            for index in positions(collection, &filter, multi)? {
                outcome.matched += 1;
                let next = updated(&collection[index], &update)?;
                if next != collection[index] {
                    outcome.modified += 1;
                    changes.push(Change::new("update", &next));
                    collection[index] = next;
                }
            }

            if outcome.matched == 0 && upsert {
                let document = upserted(&filter, &update)?;
                outcome.upserted_id = document.get("_id").cloned();
                changes.push(Change::new("insert", &document));
                collection.push(document);
            }

            Ok((outcome, changes))
        })
        .await
    }

    async fn replace_one(
        &self,
        namespace: &Namespace,
        filter: Document,
        replacement: Document,
        upsert: bool,
        session: Option<&mut dyn StoreSession>,
    ) -> ModelResult<UpdateOutcome> {
        self.write(namespace, session, |collection| {
            let mut outcome = UpdateOutcome::default();
            let mut changes = Vec::new();

            match position(collection, &filter)? {
                Some(index) => {
                    outcome.matched = 1;
                    let next = replaced(Some(&collection[index]), &replacement)?;
                    if next != collection[index] {
                        outcome.modified = 1;
                        changes.push(Change::new("replace", &next));
                        collection[index] = next;
                    }
                }
                None if upsert => {
                    let document = upserted_replacement(&filter, &replacement)?;
                    outcome.upserted_id = document.get("_id").cloned();
                    changes.push(Change::new("insert", &document));
                    collection.push(document);
                }
                None => {}
            }

            Ok((outcome, changes))
        })
        .await
    }

    async fn delete(
        &self,
        namespace: &Namespace,
        filter: Document,
        multi: bool,
        session: Option<&mut dyn StoreSession>,
    ) -> ModelResult<u64> {
        self.write(namespace, session, |collection| {
            let found = positions(collection, &filter, multi)?;
            let mut changes = Vec::with_capacity(found.len());
            for index in found.iter().rev() {
                let removed = collection.remove(*index);
                changes.push(Change::delete(&removed));
            }
            changes.reverse();
            Ok((found.len() as u64, changes))
        })
        .await
    }

    async fn find_one_and_update(
        &self,
        namespace: &Namespace,
        filter: Document,
        update: Document,
        return_document: ReturnDocument,
        upsert: bool,
        session: Option<&mut dyn StoreSession>,
    ) -> ModelResult<Option<Document>> {
        if !is_update_document(&update) {
            return Err(ModelError::Query("update document must only contain operators".into()));
        }

        self.write(namespace, session, |collection| match position(collection, &filter)? {
            Some(index) => {
                let before = collection[index].clone();
                let next = updated(&before, &update)?;
                let changes = if next != before {
                    vec![Change::new("update", &next)]
                } else {
                    Vec::new()
                };
                collection[index] = next.clone();
                let image = match return_document {
                    ReturnDocument::Before => before,
                    ReturnDocument::After => next,
                };
                Ok((Some(image), changes))
            }
            None if upsert => {
                let document = upserted(&filter, &update)?;
                let changes = vec![Change::new("insert", &document)];
                collection.push(document.clone());
                let image = match return_document {
                    ReturnDocument::Before => None,
                    ReturnDocument::After => Some(document),
                };
                Ok((image, changes))
            }
            None => Ok((None, Vec::new())),
        })
        .await
    }

    async fn find_one_and_replace(
        &self,
        namespace: &Namespace,
        filter: Document,
        replacement: Document,
        return_document: ReturnDocument,
        upsert: bool,
        session: Option<&mut dyn StoreSession>,
    ) -> ModelResult<Option<Document>> {
        self.write(namespace, session, |collection| match position(collection, &filter)? {
            Some(index) => {
                let before = collection[index].clone();
                let next = replaced(Some(&before), &replacement)?;
                let changes = if next != before {
                    vec![Change::new("replace", &next)]
                } else {
                    Vec::new()
                };
                collection[index] = next.clone();
                let image = match return_document {
                    ReturnDocument::Before => before,
                    ReturnDocument::After => next,
                };
                Ok((Some(image), changes))
            }
            None if upsert => {
                let document = upserted_replacement(&filter, &replacement)?;
                let changes = vec![Change::new("insert", &document)];
                collection.push(document.clone());
                let image = match return_document {
                    ReturnDocument::Before => None,
                    ReturnDocument::After => Some(document),
                };
                Ok((image, changes))
            }
            None => Ok((None, Vec::new())),
        })
        .await
    }

    async fn find_one_and_delete(
        &self,
        namespace: &Namespace,
        filter: Document,
        session: Option<&mut dyn StoreSession>,
    ) -> ModelResult<Option<Document>> {
        self.write(namespace, session, |collection| match position(collection, &filter)? {
            Some(index) => {
                let removed = collection.remove(index);
                let changes = vec![Change::delete(&removed)];
                Ok((Some(removed), changes))
            }
            None => Ok((None, Vec::new())),
        })
        .await
    }

    async fn watch(&self, namespace: &Namespace, pipeline: Vec<Document>) -> ModelResult<ChangeStream> {
        let receiver = self.events.subscribe();
        let namespace = namespace.clone();

        let stream = stream::unfold(
            (receiver, namespace, pipeline),
            |(mut receiver, namespace, pipeline)| async move {
                loop {
                    let (origin, envelope) = match receiver.recv().await {
                        Ok(record) => record,
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::warn!(namespace = %namespace, skipped, "change stream lagged behind");
                            continue;
                        }
                        Err(RecvError::Closed) => return None,
                    };
                    if origin != namespace {
                        continue;
                    }

                    let empty = Collections::new();
                    match Aggregator::new(&empty, &namespace.database).run(vec![envelope], &pipeline) {
                        Ok(rows) => match rows.into_iter().next() {
                            Some(row) => return Some((Ok(row), (receiver, namespace, pipeline))),
                            None => continue,
                        },
                        Err(err) => return Some((Err(err), (receiver, namespace, pipeline))),
                    }
                }
            },
        );

        Ok(stream.boxed())
    }

    async fn start_session(&self) -> ModelResult<Box<dyn StoreSession>> {
        Ok(Box::new(MemorySession::new(self.clone())))
    }

    async fn create_index(&self, namespace: &Namespace, index: IndexDefinition) -> ModelResult<()> {
        let mut state = self.state.write().await;
        if index.unique {
            let documents = state.collections.get(namespace).map(Vec::as_slice).unwrap_or_default();
            check_unique(documents, std::slice::from_ref(&index))?;
        }

        let indexes = state.indexes.entry(namespace.clone()).or_default();
        indexes.retain(|existing| existing.keys != index.keys);
        tracing::debug!(namespace = %namespace, keys = %index.keys, unique = index.unique, "index created");
        indexes.push(index);
        Ok(())
    }

    async fn drop_collection(&self, namespace: &Namespace) -> ModelResult<()> {
        let mut state = self.state.write().await;
        state.indexes.remove(namespace);
        if state.collections.remove(namespace).is_some() {
            drop(state);
            let change = Change {
                operation: "drop",
                key: Bson::Null,
                full_document: None,
            };
            self.publish(vec![(namespace.clone(), self.envelope(namespace, change))]);
        }
        Ok(())
    }
}

/// A session of the in-memory store.
///
/// While a transaction is open, change events are held back until commit and the
/// pre-transaction contents of every touched collection are remembered for abort.
#[derive(Debug)]
pub struct MemorySession {
    store: MemoryStore,
    in_transaction: bool,
    snapshots: HashMap<Namespace, Vec<Document>>,
    pending: Vec<ChangeRecord>,
}

impl MemorySession {
    fn new(store: MemoryStore) -> Self {
        Self {
            store,
            in_transaction: false,
            snapshots: HashMap::new(),
            pending: Vec::new(),
        }
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }
}

#[async_trait]
impl StoreSession for MemorySession {
    async fn start_transaction(&mut self) -> ModelResult<()> {
        if self.in_transaction {
            return Err(ModelError::Session("transaction already in progress".into()));
        }
        self.in_transaction = true;
        self.snapshots.clear();
        self.pending.clear();
        Ok(())
    }

    async fn commit_transaction(&mut self) -> ModelResult<()> {
        if !self.in_transaction {
            return Err(ModelError::Session("no transaction in progress".into()));
        }
        self.in_transaction = false;
        self.snapshots.clear();
        self.store.publish(std::mem::take(&mut self.pending));
        Ok(())
    }

    async fn abort_transaction(&mut self) -> ModelResult<()> {
        if !self.in_transaction {
            return Err(ModelError::Session("no transaction in progress".into()));
        }
        self.in_transaction = false;
        self.pending.clear();

        let mut state = self.store.state.write().await;
        for (namespace, documents) in self.snapshots.drain() {
            state.collections.insert(namespace, documents);
        }
        Ok(())
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Builder for constructing [`MemoryStore`] instances.
#[derive(Debug, Clone)]
pub struct MemoryStoreBuilder {
    event_capacity: usize,
}

impl Default for MemoryStoreBuilder {
    fn default() -> Self {
        Self {
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl MemoryStoreBuilder {
    /// Sets how many change events a slow watcher may fall behind before it starts
    /// skipping events.
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }
}

#[async_trait]
impl StoreBackendBuilder for MemoryStoreBuilder {
    type Backend = MemoryStore;

    async fn build(self) -> ModelResult<Self::Backend> {
        Ok(MemoryStore::with_event_capacity(self.event_capacity))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn users() -> Namespace {
        Namespace::new("app", "users")
    }

    async fn seeded() -> MemoryStore {
        let store = MemoryStore::new();
        store
            .insert_many(
                &users(),
                vec![
                    doc! { "_id": 1, "name": "ann", "age": 30 },
                    doc! { "_id": 2, "name": "bob", "age": 25 },
                    doc! { "_id": 3, "name": "cid", "age": 35 },
                ],
                None,
            )
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_insert_assigns_object_ids() {
        let store = MemoryStore::new();
        let ids = store
            .insert_many(&users(), vec![doc! { "name": "ann" }, doc! { "_id": 7, "name": "bob" }], None)
            .await
            .unwrap();

        assert!(matches!(ids[0], Bson::ObjectId(_)));
        assert_eq!(ids[1], Bson::Int32(7));
        assert_eq!(store.documents(&users()).await[0].keys().next().unwrap(), "_id");
    }

    #[tokio::test]
    async fn test_duplicate_id_leaves_collection_untouched() {
        let store = seeded().await;
        let err = store
            .insert_many(&users(), vec![doc! { "_id": 4 }, doc! { "_id": 1 }], None)
            .await
            .unwrap_err();

        assert!(matches!(err, ModelError::Backend(_)));
        assert_eq!(store.documents(&users()).await.len(), 3);
    }

    #[tokio::test]
    async fn test_unique_index_rejects_duplicates() {
        let store = seeded().await;
        store
            .create_index(
                &users(),
                IndexDefinition {
                    keys: doc! { "name": 1 },
                    unique: true,
                    sparse: false,
                },
            )
            .await
            .unwrap();

        let err = store
            .update(&users(), doc! { "_id": 2 }, doc! { "$set": { "name": "ann" } }, false, false, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ModelError::Backend(_)));
    }

    #[tokio::test]
    async fn test_update_counts_matched_and_modified() {
        let store = seeded().await;
        let outcome = store
            .update(&users(), doc! { "age": { "$gte": 30 } }, doc! { "$set": { "age": 30 } }, true, false, None)
            .await
            .unwrap();

        assert_eq!(outcome.matched, 2);
        assert_eq!(outcome.modified, 1);
        assert_eq!(outcome.upserted_id, None);
    }

    #[tokio::test]
    async fn test_upsert_seeds_from_filter() {
        let store = MemoryStore::new();
        let outcome = store
            .update(&users(), doc! { "email": "a@b.c" }, doc! { "$set": { "name": "ann" } }, false, true, None)
            .await
            .unwrap();

        assert!(outcome.upserted_id.is_some());
        let rows = store.documents(&users()).await;
        assert_eq!(rows[0].get_str("email").unwrap(), "a@b.c");
        assert_eq!(rows[0].get_str("name").unwrap(), "ann");
    }

    #[tokio::test]
    async fn test_replace_keeps_id() {
        let store = seeded().await;
        store
            .replace_one(&users(), doc! { "_id": 2 }, doc! { "name": "bea" }, false, None)
            .await
            .unwrap();

        let rows = store.documents(&users()).await;
        assert_eq!(rows[1], doc! { "_id": 2, "name": "bea" });
    }

    #[tokio::test]
    async fn test_find_one_and_update_images() {
        let store = seeded().await;
        let before = store
            .find_one_and_update(
                &users(),
                doc! { "_id": 1 },
                doc! { "$inc": { "age": 1 } },
                ReturnDocument::Before,
                false,
                None,
            )
            .await
            .unwrap()
            .unwrap();
        let after = store
            .find_one_and_update(
                &users(),
                doc! { "_id": 1 },
                doc! { "$inc": { "age": 1 } },
                ReturnDocument::After,
                false,
                None,
            )
            .await
            .unwrap()
            .unwrap();

        assert_eq!(before.get("age"), Some(&Bson::Int32(30)));
        assert_eq!(after.get("age"), Some(&Bson::Int32(32)));
    }

    #[tokio::test]
    async fn test_delete_one_and_many() {
        let store = seeded().await;
        assert_eq!(store.delete(&users(), doc! {}, false, None).await.unwrap(), 1);
        assert_eq!(store.delete(&users(), doc! {}, true, None).await.unwrap(), 2);
        assert!(store.documents(&users()).await.is_empty());
    }

    #[tokio::test]
    async fn test_abort_restores_touched_collections() {
        let store = seeded().await;
        let mut session = store.start_session().await.unwrap();
        session.start_transaction().await.unwrap();

        store
            .delete(&users(), doc! {}, true, Some(session.as_mut()))
            .await
            .unwrap();
        assert!(store.documents(&users()).await.is_empty());

        session.abort_transaction().await.unwrap();
        assert_eq!(store.documents(&users()).await.len(), 3);
    }

    #[tokio::test]
    async fn test_commit_publishes_held_events() {
        let store = MemoryStore::new();
        let mut stream = store
            .watch(&users(), vec![doc! { "$match": { "operationType": "insert" } }])
            .await
            .unwrap();
        let mut session = store.start_session().await.unwrap();
        session.start_transaction().await.unwrap();

        store
            .insert_many(&users(), vec![doc! { "_id": 1, "name": "ann" }], Some(session.as_mut()))
            .await
            .unwrap();
        let early = tokio::time::timeout(Duration::from_millis(50), stream.next()).await;
        assert!(early.is_err());

        session.commit_transaction().await.unwrap();
        let event = stream.next().await.unwrap().unwrap();
        assert_eq!(event.get_str("operationType").unwrap(), "insert");
        assert_eq!(
            event.get_document("fullDocument").unwrap(),
            &doc! { "_id": 1, "name": "ann" }
        );
    }

    #[tokio::test]
    async fn test_watch_filters_namespace_and_pipeline() {
        let store = seeded().await;
        let mut stream = store
            .watch(&users(), vec![doc! { "$match": { "operationType": "delete" } }])
            .await
            .unwrap();

        store
            .insert_many(&Namespace::new("app", "posts"), vec![doc! { "_id": 1 }], None)
            .await
            .unwrap();
        store
            .update(&users(), doc! { "_id": 1 }, doc! { "$set": { "age": 1 } }, false, false, None)
            .await
            .unwrap();
        store.delete(&users(), doc! { "_id": 2 }, false, None).await.unwrap();

        let event = stream.next().await.unwrap().unwrap();
        assert_eq!(event.get_str("operationType").unwrap(), "delete");
        assert_eq!(event.get_document("documentKey").unwrap(), &doc! { "_id": 2 });
        assert!(!event.contains_key("fullDocument"));
    }

    #[tokio::test]
    async fn test_foreign_session_is_rejected() {
        let store = seeded().await;
        let other = MemoryStore::new();
        let mut session = other.start_session().await.unwrap();
        session.start_transaction().await.unwrap();

        let err = store
            .delete(&users(), doc! {}, true, Some(session.as_mut()))
            .await
            .unwrap_err();
        assert!(matches!(err, ModelError::Session(_)));
    }
}
