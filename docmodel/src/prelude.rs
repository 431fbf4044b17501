//! Convenient re-exports of commonly used types from docmodel.
//!
//! ```ignore
//! use docmodel::prelude::*;
//! ```

pub use bson::{Bson, Document, doc, oid::ObjectId};

pub use crate::Entity;
pub use docmodel_core::{
    audit::{AuditOperation, AuditRecord},
    backend::{Namespace, ReturnDocument, StoreBackend, StoreBackendBuilder, StoreSession},
    config::Config,
    context::ModelContext,
    entity::{Entity, EntityExt},
    error::{ModelError, ModelResult},
    executor::Outcome,
    middleware::{HookFlow, HookPoint, PostContext, PostHook, PreContext, PreHook},
    model::{Model, Populate},
    page::{Page, PaginationParams},
    pipeline::{FilterOp, SortOrder},
    registry::{ConnectOptions, ConnectionRegistry},
    schema::{FieldDef, FieldKind, Schema, SchemaBuilder},
    transaction::{BatchReport, SessionRef, TransactionBatch, with_transaction},
    trigger::{ChangeEvent, EventKind, Trigger, TriggerOptions},
};
pub use docmodel_qs::ParsedQuery;
