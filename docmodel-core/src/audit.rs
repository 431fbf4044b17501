//! Audit trail written by post hooks.
//!
//! [`install`] attaches three groups of [`AuditHook`]s to a model's middleware, one per
//! [`AuditOperation`]. After a successful operation each hook writes one
//! [`AuditRecord`] per affected document into the audit collection of the database the
//! operation ran on, through the same connection. Operations running in a session write
//! their records in that session, so an aborted transaction leaves no records behind.

use async_trait::async_trait;
use bson::{Bson, DateTime, Document, doc, ser::serialize_to_document};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::{
    backend::{Namespace, StoreSession},
    middleware::{HookFlow, HookPoint, Middleware, PostContext, PostHook},
};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AuditOperation {
    Insert,
    Update,
    Delete,
}

impl AuditOperation {
    /// Hook points whose successful completion produces this kind of record.
    pub fn hook_points(&self) -> &'static [HookPoint] {
        match self {
            AuditOperation::Insert => &[HookPoint::Save],
            AuditOperation::Update => &[
                HookPoint::UpdateOne,
                HookPoint::UpdateMany,
                HookPoint::ReplaceOne,
                HookPoint::FindOneAndUpdate,
                HookPoint::FindOneAndReplace,
            ],
            AuditOperation::Delete => &[
                HookPoint::DeleteOne,
                HookPoint::DeleteMany,
                HookPoint::FindOneAndDelete,
            ],
        }
    }
}

/// One audited change.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AuditRecord {
    /// Catalog name of the audited entity.
    pub entity: String,
    pub operation: AuditOperation,
    /// The stored document, or the filter and update when the operation returns no
    /// document.
    pub document: Document,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    pub timestamp: DateTime,
}

/// Post hook writing [`AuditRecord`]s for one operation kind.
#[derive(Debug, Clone)]
pub struct AuditHook {
    operation: AuditOperation,
    collection: String,
}

impl AuditHook {
    pub fn new(operation: AuditOperation, collection: impl Into<String>) -> Self {
        Self {
            operation,
            collection: collection.into(),
        }
    }

    fn snapshots(&self, ctx: &PostContext<'_>) -> Vec<Document> {
        if !ctx.documents.is_empty() {
            return ctx.documents.to_vec();
        }

        let filter = ctx.filter.cloned().unwrap_or_default();
        match self.operation {
            AuditOperation::Insert => Vec::new(),
            AuditOperation::Update => vec![doc! {
                "filter": filter,
                "update": ctx.payload.first().cloned().map_or(Bson::Null, Bson::Document),
            }],
            AuditOperation::Delete => vec![doc! { "filter": filter }],
        }
    }
}

#[async_trait]
impl PostHook for AuditHook {
    async fn call(&self, ctx: &PostContext<'_>) -> HookFlow {
        if ctx.error.is_some() || (ctx.documents.is_empty() && ctx.affected == 0) {
            return HookFlow::Continue;
        }

        let timestamp = DateTime::now();
        let mut records = Vec::new();
        for document in self.snapshots(ctx) {
            let record = AuditRecord {
                entity: ctx.entity.to_string(),
                operation: self.operation,
                document,
                user: ctx.actor.map(str::to_string),
                timestamp,
            };
            match serialize_to_document(&record) {
                Ok(record) => records.push(record),
                Err(err) => tracing::warn!(entity = %ctx.entity, error = %err, "skipping unserializable audit record"),
            }
        }

        if records.is_empty() {
            return HookFlow::Continue;
        }

        let namespace = Namespace::new(ctx.namespace.database.clone(), self.collection.clone());
        let written = match ctx.session {
            Some(session) => {
                let mut guard = session.lock().await;
                let session: &mut dyn StoreSession = &mut **guard;
                ctx.backend.insert_many(&namespace, records, Some(session)).await
            }
            None => ctx.backend.insert_many(&namespace, records, None).await,
        };
        if let Err(err) = written {
            tracing::warn!(namespace = %namespace, entity = %ctx.entity, error = %err, "failed to write audit records");
        }

        HookFlow::Continue
    }
}

/// Registers audit hooks for every audited hook point.
pub fn install(middleware: &mut Middleware, collection: &str) {
    for operation in [AuditOperation::Insert, AuditOperation::Update, AuditOperation::Delete] {
        let hook: Arc<dyn PostHook> = Arc::new(AuditHook::new(operation, collection));
        for point in operation.hook_points() {
            middleware.add_post(*point, hook.clone());
        }
    }
}
