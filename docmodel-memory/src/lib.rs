//! In-memory document store backend for docmodel.
//!
//! This crate provides a thread-safe, in-memory implementation of the
//! [`StoreBackend`](docmodel_core::backend::StoreBackend) command protocol. It
//! interprets the aggregation stages and update operators the engine emits, keeps a
//! change feed for triggers, and supports sessions whose transactions can be
//! committed or aborted. It is meant for development, tests and small deployments.
//!
//! # Quick Start
//!
//! ```ignore
//! use docmodel::prelude::*;
//! use docmodel_memory::MemoryStore;
//!
//! let ctx = ModelContext::new();
//! ctx.registry()
//!     .connect(MemoryStore::builder(), ConnectOptions::new("app"))
//!     .await?;
//!
//! let users = ctx.model::<User>()?;
//! users.create(&User { name: "Alice".into(), age: None }).await?;
//! ```

#[allow(unused_extern_crates)]
extern crate self as docmodel_memory;

mod aggregate;
mod evaluator;
pub mod store;

pub use store::{MemorySession, MemoryStore, MemoryStoreBuilder};
