//! Procedural macros for the docmodel project.
//!
//! # `Entity`
//!
//! Derives `docmodel::entity::Entity` for a struct with named fields, generating its
//! field descriptor table from the field types and `#[field(...)]` attributes.
//!
//! Container attribute `#[document(...)]`:
//!
//! - `collection = "..."` - collection name; defaults to the snake-cased type name
//!   with an `s` appended
//! - `name = "..."` - catalog name; defaults to the type name
//! - `database = "..."`, `connection = "..."` - database and connection alias overrides
//! - `audit`, `soft_delete`, `timestamps`, `skip_validation` - schema options
//!
//! Field attribute `#[field(...)]`:
//!
//! - `required`, `default = expr`, `min = expr`, `max = expr`, `max_length = expr`,
//!   `pattern = "..."` - constraints
//! - `index`, `unique` - index declarations
//! - `references = "Schema"`, `collection = "..."`, `ref_id` - reference fields
//! - `kind = "..."` - overrides the kind inferred from the Rust type
//! - `name = "..."` - stored name; `#[serde(rename = "...")]` is honoured too
//! - `skip` - leaves the field out of the table (as does `#[serde(skip)]`)
//!
//! The `_id` field is never part of the table.
//!
//! # Example
//!
//! ```ignore
//! use docmodel::prelude::*;
//! use serde::{Serialize, Deserialize};
//!
//! #[derive(Debug, Clone, Serialize, Deserialize, Entity)]
//! #[document(collection = "users", soft_delete, timestamps)]
//! pub struct User {
//!     #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
//!     pub id: Option<ObjectId>,
//!     #[field(required, max_length = 64)]
//!     pub name: String,
//!     #[field(default = 18, min = 0)]
//!     pub age: Option<i64>,
//!     #[field(references = "Team")]
//!     pub team: Option<ObjectId>,
//! }
//! ```

#[allow(unused_extern_crates)]
extern crate self as docmodel_macros;

mod entity;

use proc_macro::TokenStream;
use syn::{Data, DeriveInput, parse_macro_input};

use crate::entity::generate_entity_for_struct;

#[proc_macro_derive(Entity, attributes(document, field))]
pub fn derive_entity(input: TokenStream) -> TokenStream {
    let ast = parse_macro_input!(input as DeriveInput);

    let result = match &ast.data {
        Data::Struct(data) => generate_entity_for_struct(&ast, data),
        _ => Err(syn::Error::new_spanned(&ast, "Entity can only be derived for structs")),
    };

    result.unwrap_or_else(syn::Error::into_compile_error).into()
}
