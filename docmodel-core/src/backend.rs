//! The narrow command protocol between the engine and a document store.
//!
//! The engine never talks to a database directly. Every read is an aggregation
//! pipeline and every write is one of a handful of CRUD commands, all addressed to a
//! [`Namespace`]. Implementations live in their own crates (`docmodel-memory`,
//! `docmodel-mongodb`) and are registered under an alias in the
//! [`ConnectionRegistry`](crate::registry::ConnectionRegistry).
//!
//! # Traits
//!
//! - [`StoreBackend`]: the command protocol itself, object safe so it can be shared as
//!   `Arc<dyn StoreBackend>`
//! - [`StoreSession`]: a client session able to run one transaction at a time
//! - [`StoreBackendBuilder`]: factory used by the registry when connecting
//!
//! # Sessions
//!
//! Every data command accepts an optional session. When one is given the command must
//! run inside that session's open transaction. Backends recover their concrete session
//! type through [`StoreSession::as_any_mut`].

use async_trait::async_trait;
use bson::{Bson, Document};
use futures::stream::BoxStream;
use std::{any::Any, fmt, fmt::Debug};

use crate::error::ModelResult;

/// A stream of raw change-event envelopes as produced by the store.
///
/// Each item is the full envelope (`operationType`, `documentKey`, `fullDocument`,
/// `ns`, ...). An `Err` item ends the stream from the consumer's point of view.
pub type ChangeStream = BoxStream<'static, ModelResult<Document>>;

/// Fully qualified collection address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Namespace {
    pub database: String,
    pub collection: String,
}

impl Namespace {
    pub fn new(database: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            collection: collection.into(),
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.collection)
    }
}

/// Result of an update or replace command.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateOutcome {
    /// Number of documents matched by the filter.
    pub matched: u64,
    /// Number of documents actually modified.
    pub modified: u64,
    /// Identifier of the document created by an upsert, if any.
    pub upserted_id: Option<Bson>,
}

/// Which image a find-one-and-* command returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReturnDocument {
    /// The document as it was before the modification.
    Before,
    /// The document as it is after the modification.
    #[default]
    After,
}

/// Index creation request.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexDefinition {
    /// Key specification, e.g. `{ "email": 1 }`.
    pub keys: Document,
    /// Reject duplicate keys.
    pub unique: bool,
    /// Skip documents that lack the indexed field.
    pub sparse: bool,
}

/// A client session capable of running one transaction at a time.
#[async_trait]
pub trait StoreSession: Send {
    /// Opens a transaction on this session.
    async fn start_transaction(&mut self) -> ModelResult<()>;

    /// Commits the open transaction.
    async fn commit_transaction(&mut self) -> ModelResult<()>;

    /// Aborts the open transaction, discarding its writes.
    async fn abort_transaction(&mut self) -> ModelResult<()>;

    /// Returns the session as `Any` so backends can recover their concrete type.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// The command protocol a document store must implement.
///
/// All implementations must be thread-safe; the registry shares one instance across
/// every model handle bound to the same alias.
#[async_trait]
pub trait StoreBackend: Send + Sync + Debug {
    /// Checks that the store is reachable.
    async fn ping(&self) -> ModelResult<()>;

    /// Runs an aggregation pipeline and returns every produced document.
    async fn aggregate(
        &self,
        namespace: &Namespace,
        pipeline: Vec<Document>,
        session: Option<&mut dyn StoreSession>,
    ) -> ModelResult<Vec<Document>>;

    /// Inserts documents, returning their identifiers in input order.
    ///
    /// Documents without an `_id` are assigned a fresh `ObjectId`.
    async fn insert_many(
        &self,
        namespace: &Namespace,
        documents: Vec<Document>,
        session: Option<&mut dyn StoreSession>,
    ) -> ModelResult<Vec<Bson>>;

    /// Applies an update document (operators such as `$set`) to one or all matching
    /// documents.
    async fn update(
        &self,
        namespace: &Namespace,
        filter: Document,
        update: Document,
        multi: bool,
        upsert: bool,
        session: Option<&mut dyn StoreSession>,
    ) -> ModelResult<UpdateOutcome>;

    /// Replaces the first matching document, keeping its `_id`.
    async fn replace_one(
        &self,
        namespace: &Namespace,
        filter: Document,
        replacement: Document,
        upsert: bool,
        session: Option<&mut dyn StoreSession>,
    ) -> ModelResult<UpdateOutcome>;

    /// Removes one or all matching documents and returns how many were removed.
    async fn delete(
        &self,
        namespace: &Namespace,
        filter: Document,
        multi: bool,
        session: Option<&mut dyn StoreSession>,
    ) -> ModelResult<u64>;

    /// Atomically updates the first matching document and returns one of its images.
    async fn find_one_and_update(
        &self,
        namespace: &Namespace,
        filter: Document,
        update: Document,
        return_document: ReturnDocument,
        upsert: bool,
        session: Option<&mut dyn StoreSession>,
    ) -> ModelResult<Option<Document>>;

    /// Atomically replaces the first matching document and returns one of its images.
    async fn find_one_and_replace(
        &self,
        namespace: &Namespace,
        filter: Document,
        replacement: Document,
        return_document: ReturnDocument,
        upsert: bool,
        session: Option<&mut dyn StoreSession>,
    ) -> ModelResult<Option<Document>>;

    /// Atomically removes the first matching document and returns it.
    async fn find_one_and_delete(
        &self,
        namespace: &Namespace,
        filter: Document,
        session: Option<&mut dyn StoreSession>,
    ) -> ModelResult<Option<Document>>;

    /// Opens a change stream on a collection.
    ///
    /// `pipeline` is applied to the event envelopes. Update events always carry the
    /// post-change `fullDocument`.
    async fn watch(&self, namespace: &Namespace, pipeline: Vec<Document>) -> ModelResult<ChangeStream>;

    /// Starts a new client session.
    async fn start_session(&self) -> ModelResult<Box<dyn StoreSession>>;

    /// Creates an index on a collection.
    async fn create_index(&self, namespace: &Namespace, index: IndexDefinition) -> ModelResult<()>;

    /// Drops a collection and all of its documents.
    async fn drop_collection(&self, namespace: &Namespace) -> ModelResult<()>;

    /// Releases every resource held by the backend.
    ///
    /// The default implementation is a no-op.
    async fn shutdown(&self) -> ModelResult<()> {
        Ok(())
    }
}

/// Factory for connecting a backend.
#[async_trait]
pub trait StoreBackendBuilder {
    type Backend: StoreBackend + 'static;

    async fn build(self) -> ModelResult<Self::Backend>;
}
