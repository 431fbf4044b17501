//! Typed document models over aggregation pipelines.
//!
//! This crate is the entry point of the docmodel project. It re-exports the engine from
//! `docmodel-core`, the bundled storage backends, the `Entity` derive and the
//! query-string plugin.
//!
//! # Features
//!
//! - **Deferred pipelines** - every chained call derives a new handle and nothing runs
//!   until a terminal call such as [`Model::all`](model::Model::all)
//! - **Schemas** - defaults, constraints and indexes declared per entity
//! - **Middleware** - ordered pre/post hooks around every write, plus an audit trail
//! - **Triggers** - typed callbacks fed by the store's change feed
//! - **Transactions** - single-session callbacks and multi-alias batches
//! - **Backends** - in-memory storage for tests, MongoDB behind the `mongodb` feature
//!
//! # Quick Start
//!
//! ```ignore
//! use docmodel::prelude::*;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Clone, Serialize, Deserialize, Entity)]
//! #[document(collection = "users", soft_delete)]
//! pub struct User {
//!     #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
//!     pub id: Option<ObjectId>,
//!     #[field(required)]
//!     pub name: String,
//!     #[field(default = 18, min = 0)]
//!     pub age: Option<i64>,
//! }
//!
//! #[tokio::main]
//! async fn main() -> ModelResult<()> {
//!     let ctx = ModelContext::new();
//!     docmodel::connect(&ctx, &Config::new("memory://local/app")).await?;
//!
//!     let users = ctx.model::<User>()?;
//!     users.create(&User { id: None, name: "Ann".into(), age: None }).await?;
//!
//!     let adults = users
//!         .filter("age", FilterOp::Gte, 18)
//!         .sort("name", SortOrder::Asc)
//!         .all()
//!         .await?;
//!     println!("{adults:?}");
//!
//!     ctx.shutdown().await
//! }
//! ```
//!
//! # Backends
//!
//! - [`memory`] - in-process storage with transactions and a change feed
//! - `mongodb` - MongoDB through the official driver (requires the `mongodb` feature)

pub mod prelude;

pub use docmodel_core::{
    audit, backend, config, context, entity, error, executor, middleware, model, page, pipeline, registry,
    scheduler, schema, transaction, trigger,
};
pub use docmodel_macros::Entity;

pub use async_trait::async_trait;
pub use bson;

use docmodel_core::{
    config::Config,
    context::ModelContext,
    error::{ModelError, ModelResult},
    registry::Connection,
};

/// In-memory storage backend.
pub mod memory {
    pub use docmodel_memory::{MemorySession, MemoryStore, MemoryStoreBuilder};
}

/// MongoDB storage backend.
///
/// This module is only available when the `mongodb` feature is enabled.
#[cfg(feature = "mongodb")]
pub mod mongodb {
    pub use docmodel_mongodb::{MongoSession, MongoStore, MongoStoreBuilder};
}

/// Query-string filters.
pub mod qs {
    pub use docmodel_qs::{DEFAULT_LIMIT, ParsedQuery, coerce};
}

/// Connects the data source described by `config` and registers it in the registry of
/// `ctx` under [`Config::alias`].
///
/// `memory://` connection strings open a fresh [`memory::MemoryStore`]; `mongodb://`
/// and `mongodb+srv://` need the `mongodb` feature.
///
/// # Errors
///
/// Returns [`ModelError::Configuration`] for an invalid config or a backend that was
/// not compiled in, and whatever connecting the backend returns.
pub async fn connect(ctx: &ModelContext, config: &Config) -> ModelResult<Connection> {
    config.validate()?;
    let options = config.connect_options()?;
    tracing::debug!(alias = %options.alias, database = %options.database, scheme = ?config.scheme(), "connecting");

    match config.scheme() {
        Some("memory://") => {
            ctx.registry()
                .connect(memory::MemoryStore::builder(), options)
                .await
        }
        #[cfg(feature = "mongodb")]
        Some(_) => {
            let builder = mongodb::MongoStoreBuilder::new(config.connection_string.trim())
                .with_connect_timeout(config.connect_timeout());
            ctx.registry().connect(builder, options).await
        }
        _ => Err(ModelError::Configuration(format!(
            "no backend available for `{}`; enable the `mongodb` feature",
            config.alias()
        ))),
    }
}
