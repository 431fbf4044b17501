//! A typed document-mapping query engine with deferred aggregation pipelines.
//!
//! This crate is the core of the docmodel project and provides:
//!
//! - **Entity traits** ([`entity`]) - Typed document shapes and their BSON conversions
//! - **Schemas** ([`schema`]) - Field descriptor tables, validation and the schema catalog
//! - **Pipeline assembly** ([`pipeline`]) - Stage-merging aggregation pipeline builder
//! - **Model handles** ([`model`], [`executor`]) - Chained query building and lazy execution
//! - **Middleware** ([`middleware`]) - Pre/post hooks around every operation
//! - **Triggers** ([`trigger`]) - Change-feed subscriptions with typed callbacks
//! - **Connections** ([`registry`], [`context`], [`config`]) - Alias-keyed store connections
//! - **Transactions** ([`transaction`]) - Single-session transactions and batches
//! - **Scheduling** ([`scheduler`]) - Cron-driven recurring executions
//! - **Auditing** ([`audit`]) - Audit records written by post hooks
//! - **Store protocol** ([`backend`]) - The command protocol store backends implement
//! - **Error handling** ([`error`]) - Error and result types
//!
//! # Example
//!
//! ```ignore
//! use docmodel::prelude::*;
//! use serde::{Serialize, Deserialize};
//!
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! pub struct User {
//!     pub name: String,
//!     pub age: Option<i64>,
//! }
//!
//! impl Entity for User {
//!     fn collection_name() -> &'static str {
//!         "users"
//!     }
//!
//!     fn schema() -> SchemaBuilder {
//!         Schema::builder()
//!             .field("name", FieldDef::string().required())
//!             .field("age", FieldDef::int().default(18).min(0.0))
//!     }
//! }
//!
//! let users = ctx.model::<User>()?;
//! let page = users
//!     .filter("age", FilterOp::Gte, 21)
//!     .sort("name", SortOrder::Asc)
//!     .paginate(1, 20)
//!     .page()
//!     .await?;
//! ```

#[allow(unused_extern_crates)]
extern crate self as docmodel_core;

pub mod audit;
pub mod backend;
pub mod config;
pub mod context;
pub mod entity;
pub mod error;
pub mod executor;
pub mod middleware;
pub mod model;
pub mod page;
pub mod pipeline;
pub mod registry;
pub mod scheduler;
pub mod schema;
pub mod transaction;
pub mod trigger;
