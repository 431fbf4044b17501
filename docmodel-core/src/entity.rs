//! Core traits for typed document shapes.
//!
//! An [`Entity`] is a Rust type that maps onto one collection. It declares its
//! collection, its catalog name and its field descriptor table; [`EntityExt`] supplies
//! the conversions between the typed value and raw BSON documents.

use bson::{Document, de::deserialize_from_document, ser::serialize_to_document};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::{Value, from_value, to_value};

use crate::{
    error::ModelResult,
    schema::{Schema, SchemaBuilder},
};

/// Core trait every mapped document type implements.
///
/// Usually derived with `#[derive(Entity)]`, which generates the field table from
/// `#[field(...)]` attributes. A manual implementation looks like this:
///
/// ```ignore
/// use docmodel::prelude::*;
/// use bson::oid::ObjectId;
/// use serde::{Serialize, Deserialize};
///
/// #[derive(Debug, Clone, Serialize, Deserialize)]
/// pub struct User {
///     #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
///     pub id: Option<ObjectId>,
///     pub name: String,
///     #[serde(skip_serializing_if = "Option::is_none")]
///     pub age: Option<i64>,
/// }
///
/// impl Entity for User {
///     fn collection_name() -> &'static str {
///         "users"
///     }
///
///     fn schema() -> SchemaBuilder {
///         Schema::builder()
///             .field("name", FieldDef::string().required())
///             .field("age", FieldDef::int().default(18).min(0.0))
///     }
/// }
/// ```
pub trait Entity: Serialize + DeserializeOwned + Send + Sync + Clone + 'static {
    /// Returns the name of the collection this type is stored in.
    fn collection_name() -> &'static str;

    /// Returns the name the schema is registered under in the catalog.
    ///
    /// Defaults to the collection name.
    fn model_name() -> &'static str {
        Self::collection_name()
    }

    /// Returns the field descriptor table and schema options for this type.
    ///
    /// The collection option defaults to [`Entity::collection_name`] when unset.
    fn schema() -> SchemaBuilder {
        Schema::builder()
    }
}

/// Conversion helpers, implemented for every [`Entity`].
pub trait EntityExt: Entity {
    /// Converts this value to a BSON document.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails or the value is not a map.
    fn to_document(&self) -> ModelResult<Document>;

    /// Creates a value from a BSON document.
    ///
    /// # Errors
    ///
    /// Returns an error if the document does not match the shape of `Self`.
    fn from_document(document: Document) -> ModelResult<Self>;

    /// Converts this value to JSON.
    fn to_json(&self) -> ModelResult<Value>;

    /// Creates a value from JSON.
    fn from_json(value: Value) -> ModelResult<Self>;
}

impl<E: Entity> EntityExt for E {
    fn to_document(&self) -> ModelResult<Document> {
        Ok(serialize_to_document(self)?)
    }

    fn from_document(document: Document) -> ModelResult<Self> {
        Ok(deserialize_from_document(document)?)
    }

    fn to_json(&self) -> ModelResult<Value> {
        Ok(to_value(self)?)
    }

    fn from_json(value: Value) -> ModelResult<Self> {
        Ok(from_value(value)?)
    }
}
