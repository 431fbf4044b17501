//! The shared state every model handle is bound to.

use std::sync::Arc;

use crate::{
    entity::Entity,
    error::ModelResult,
    model::Model,
    registry::ConnectionRegistry,
    scheduler::Scheduler,
    schema::SchemaCatalog,
};

/// Default collection audit records are written to.
pub const DEFAULT_AUDIT_COLLECTION: &str = "audit_logs";

/// Connection registry, schema catalog and scheduler, passed explicitly to whatever
/// needs them instead of living in process globals.
///
/// Cloning is cheap; clones share the same state.
///
/// # Example
///
/// ```ignore
/// let ctx = ModelContext::new();
/// ctx.registry().register("default", Arc::new(MemoryStore::new()), "app").await;
///
/// let users = ctx.model::<User>()?;
/// let adults = users.filter("age", FilterOp::Gte, 18).all().await?;
/// ```
#[derive(Debug, Clone)]
pub struct ModelContext {
    registry: Arc<ConnectionRegistry>,
    catalog: Arc<SchemaCatalog>,
    scheduler: Scheduler,
    audit_collection: Arc<str>,
}

impl Default for ModelContext {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelContext {
    pub fn new() -> Self {
        Self::with_registry(Arc::new(ConnectionRegistry::new()))
    }

    /// Creates a context around an existing registry.
    pub fn with_registry(registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            registry,
            catalog: Arc::new(SchemaCatalog::new()),
            scheduler: Scheduler::new(),
            audit_collection: Arc::from(DEFAULT_AUDIT_COLLECTION),
        }
    }

    /// Changes the collection audit records are written to.
    pub fn with_audit_collection(mut self, collection: impl AsRef<str>) -> Self {
        self.audit_collection = Arc::from(collection.as_ref());
        self
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn catalog(&self) -> &Arc<SchemaCatalog> {
        &self.catalog
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn audit_collection(&self) -> &str {
        &self.audit_collection
    }

    /// Returns a model handle for `E`, registering its schema on first use.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::Configuration`](crate::error::ModelError::Configuration)
    /// if the declared schema is invalid.
    pub fn model<E: Entity>(&self) -> ModelResult<Model<E>> {
        Model::new(self.clone())
    }

    /// Stops every schedule and closes every connection.
    pub async fn shutdown(&self) -> ModelResult<()> {
        self.scheduler.shutdown();
        self.registry.close_all().await
    }
}
