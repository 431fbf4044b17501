//! MongoDB backend implementation for docmodel.
//!
//! This crate implements the [`StoreBackend`](docmodel_core::backend::StoreBackend)
//! command protocol on top of the official MongoDB driver. Reads run as aggregation
//! pipelines, triggers use MongoDB change streams, and transactions use driver client
//! sessions (which require a replica set or a sharded cluster).
//!
//! To use this backend, include the `mongodb` feature in your `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! docmodel = { version = "x.y.z", features = ["mongodb"] }
//! ```
//!
//! # Example
//!
//! ```ignore
//! use docmodel::{prelude::*, mongodb::MongoStore};
//!
//! let ctx = ModelContext::new();
//! ctx.registry()
//!     .connect(MongoStore::builder("mongodb://localhost:27017"), ConnectOptions::new("app"))
//!     .await?;
//! ```

#[allow(unused_extern_crates)]
extern crate self as docmodel_mongodb;

pub mod store;

pub use store::{MongoSession, MongoStore, MongoStoreBuilder};
