//! Field descriptor tables and the schema catalog.
//!
//! A [`Schema`] is an ordered table of [`FieldDef`]s plus [`SchemaOptions`]. It is built
//! once, validated at build time (regexes compile, defaults match their kind) and then
//! shared immutably by every model handle derived from it.
//!
//! Enforcement is a single generic routine, [`Schema::apply`], that walks the table in
//! declaration order: defaults are filled in first, then required/type/bounds/length/
//! pattern checks run. The first violation is returned.

use bson::{Bson, Document, oid::ObjectId};
use parking_lot::RwLock;
use regex::Regex;
use std::{collections::HashMap, fmt, sync::Arc};

use crate::error::{ModelError, ModelResult};

/// Semantic type of a field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldKind {
    String,
    /// 32 or 64 bit integer.
    Int,
    /// Any number; integers are accepted.
    Float,
    Bool,
    DateTime,
    ObjectId,
    /// Homogeneous array of the inner kind.
    Array(Box<FieldKind>),
    /// Embedded document.
    Object,
    /// No type check.
    Any,
}

impl FieldKind {
    /// Returns true when `value` is acceptable for this kind. `Null` is handled by the
    /// caller and never reaches this check.
    pub fn matches(&self, value: &Bson) -> bool {
        match (self, value) {
            (FieldKind::Any, _) => true,
            (FieldKind::String, Bson::String(_)) => true,
            (FieldKind::Int, Bson::Int32(_) | Bson::Int64(_)) => true,
            (FieldKind::Float, Bson::Double(_) | Bson::Int32(_) | Bson::Int64(_)) => true,
            (FieldKind::Bool, Bson::Boolean(_)) => true,
            (FieldKind::DateTime, Bson::DateTime(_)) => true,
            (FieldKind::ObjectId, Bson::ObjectId(_)) => true,
            (FieldKind::Object, Bson::Document(_)) => true,
            (FieldKind::Array(inner), Bson::Array(items)) => items
                .iter()
                .all(|item| matches!(item, Bson::Null) || inner.matches(item)),
            _ => false,
        }
    }

    /// True for array kinds; a populate on such a field keeps the joined list.
    pub fn is_collection(&self) -> bool {
        matches!(self, FieldKind::Array(_))
    }
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldKind::String => write!(f, "string"),
            FieldKind::Int => write!(f, "int"),
            FieldKind::Float => write!(f, "float"),
            FieldKind::Bool => write!(f, "bool"),
            FieldKind::DateTime => write!(f, "datetime"),
            FieldKind::ObjectId => write!(f, "objectId"),
            FieldKind::Array(inner) => write!(f, "array<{}>", inner),
            FieldKind::Object => write!(f, "object"),
            FieldKind::Any => write!(f, "any"),
        }
    }
}

/// Target of a reference field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reference {
    /// Name of another schema in the catalog; resolved to its collection at populate time.
    Schema(String),
    /// Literal collection name.
    Collection(String),
}

/// Index declared on a field.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexSpec {
    pub unique: bool,
    pub sparse: bool,
    pub descending: bool,
}

/// Definition of one field of a schema.
#[derive(Debug, Clone)]
pub struct FieldDef {
    pub kind: FieldKind,
    pub required: bool,
    pub default: Option<Bson>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub max_length: Option<usize>,
    pub pattern: Option<String>,
    pub index: Option<IndexSpec>,
    pub reference: Option<Reference>,
    /// The field carries foreign ids; hex strings are coerced to `ObjectId` on create.
    pub ref_id: bool,
    regex: Option<Regex>,
}

impl FieldDef {
    pub fn new(kind: FieldKind) -> Self {
        Self {
            kind,
            required: false,
            default: None,
            min: None,
            max: None,
            max_length: None,
            pattern: None,
            index: None,
            reference: None,
            ref_id: false,
            regex: None,
        }
    }

    pub fn string() -> Self {
        Self::new(FieldKind::String)
    }

    pub fn int() -> Self {
        Self::new(FieldKind::Int)
    }

    pub fn float() -> Self {
        Self::new(FieldKind::Float)
    }

    pub fn bool() -> Self {
        Self::new(FieldKind::Bool)
    }

    pub fn datetime() -> Self {
        Self::new(FieldKind::DateTime)
    }

    pub fn object_id() -> Self {
        Self::new(FieldKind::ObjectId)
    }

    pub fn object() -> Self {
        Self::new(FieldKind::Object)
    }

    pub fn any() -> Self {
        Self::new(FieldKind::Any)
    }

    pub fn array(items: FieldKind) -> Self {
        Self::new(FieldKind::Array(Box::new(items)))
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn default(mut self, value: impl Into<Bson>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn min(mut self, min: f64) -> Self {
        self.min = Some(min);
        self
    }

    pub fn max(mut self, max: f64) -> Self {
        self.max = Some(max);
        self
    }

    pub fn max_length(mut self, len: usize) -> Self {
        self.max_length = Some(len);
        self
    }

    /// Constrains string values to a regular expression. Compiled by
    /// [`SchemaBuilder::build`].
    pub fn pattern(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = Some(pattern.into());
        self
    }

    pub fn index(mut self) -> Self {
        self.index.get_or_insert_with(IndexSpec::default);
        self
    }

    pub fn unique(mut self) -> Self {
        self.index.get_or_insert_with(IndexSpec::default).unique = true;
        self
    }

    pub fn index_spec(mut self, spec: IndexSpec) -> Self {
        self.index = Some(spec);
        self
    }

    /// References the collection of another registered schema.
    pub fn references(mut self, schema: impl Into<String>) -> Self {
        self.reference = Some(Reference::Schema(schema.into()));
        self
    }

    /// References a literal collection name.
    pub fn collection(mut self, collection: impl Into<String>) -> Self {
        self.reference = Some(Reference::Collection(collection.into()));
        self
    }

    pub fn ref_id(mut self) -> Self {
        self.ref_id = true;
        self
    }

    fn compile(&mut self, name: &str) -> ModelResult<()> {
        if let Some(pattern) = &self.pattern {
            self.regex = Some(Regex::new(pattern).map_err(|e| {
                ModelError::Configuration(format!("invalid pattern for field `{}`: {}", name, e))
            })?);
        }

        if let Some(default) = &self.default {
            if !matches!(default, Bson::Null) && !self.kind.matches(default) {
                return Err(ModelError::Configuration(format!(
                    "default for field `{}` is not of kind {}",
                    name, self.kind
                )));
            }
        }

        Ok(())
    }

    fn check(&self, name: &str, value: &Bson) -> ModelResult<()> {
        if !self.kind.matches(value) {
            return Err(ModelError::validation(
                name,
                format!("expected {}, got {:?}", self.kind, value.element_type()),
            ));
        }

        if let Some(number) = as_number(value) {
            if let Some(min) = self.min {
                if number < min {
                    return Err(ModelError::validation(name, format!("must be >= {}", min)));
                }
            }
            if let Some(max) = self.max {
                if number > max {
                    return Err(ModelError::validation(name, format!("must be <= {}", max)));
                }
            }
        }

        if let Some(max_length) = self.max_length {
            let length = match value {
                Bson::String(s) => Some(s.chars().count()),
                Bson::Array(items) => Some(items.len()),
                _ => None,
            };
            if length.is_some_and(|len| len > max_length) {
                return Err(ModelError::validation(
                    name,
                    format!("must be at most {} long", max_length),
                ));
            }
        }

        if let (Some(regex), Bson::String(s)) = (&self.regex, value) {
            if !regex.is_match(s) {
                return Err(ModelError::validation(
                    name,
                    format!("does not match pattern {}", regex.as_str()),
                ));
            }
        }

        Ok(())
    }
}

fn as_number(value: &Bson) -> Option<f64> {
    match value {
        Bson::Int32(v) => Some(*v as f64),
        Bson::Int64(v) => Some(*v as f64),
        Bson::Double(v) => Some(*v),
        _ => None,
    }
}

fn coerce_ref_id(name: &str, value: Bson) -> ModelResult<Bson> {
    match value {
        Bson::String(hex) => ObjectId::parse_str(&hex)
            .map(Bson::ObjectId)
            .map_err(|_| ModelError::validation(name, "is not a valid reference id")),
        Bson::Array(items) => Ok(Bson::Array(
            items
                .into_iter()
                .map(|item| coerce_ref_id(name, item))
                .collect::<ModelResult<Vec<_>>>()?,
        )),
        other => Ok(other),
    }
}

/// Options shared by every handle of a schema.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SchemaOptions {
    pub collection: String,
    /// Database override; the connection's default database is used when unset.
    pub database: Option<String>,
    /// Connection alias; `"default"` when unset.
    pub connection: Option<String>,
    /// Record inserts, updates and deletes in the audit collection.
    pub audit: bool,
    /// Skip field enforcement on create.
    pub skip_validation: bool,
    /// Rewrite deletes into `deletedAt` stamps and hide stamped rows from reads.
    pub soft_delete: bool,
    /// Maintain `createdAt`/`updatedAt`.
    pub timestamps: bool,
}

/// An immutable field descriptor table.
#[derive(Debug, Clone)]
pub struct Schema {
    fields: Vec<(String, FieldDef)>,
    options: SchemaOptions,
}

impl Schema {
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder::new()
    }

    pub fn options(&self) -> &SchemaOptions {
        &self.options
    }

    pub fn collection(&self) -> &str {
        &self.options.collection
    }

    /// Looks up a field by its stored (serialized) name.
    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields
            .iter()
            .find(|(field, _)| field == name)
            .map(|(_, def)| def)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &FieldDef)> {
        self.fields
            .iter()
            .map(|(name, def)| (name.as_str(), def))
    }

    /// Fills in defaults, coerces reference ids and enforces every constraint.
    ///
    /// Returns the first violation encountered, in field declaration order.
    pub fn apply(&self, document: &mut Document) -> ModelResult<()> {
        for (name, def) in &self.fields {
            let missing = matches!(document.get(name), None | Some(Bson::Null));

            if missing {
                if let Some(default) = &def.default {
                    document.insert(name.clone(), default.clone());
                } else if def.required && !self.options.skip_validation {
                    return Err(ModelError::validation(name, "is required"));
                }
                continue;
            }

            if def.ref_id {
                if let Some(value) = document.remove(name) {
                    document.insert(name.clone(), coerce_ref_id(name, value)?);
                }
            }

            if self.options.skip_validation {
                continue;
            }

            if let Some(value) = document.get(name) {
                def.check(name, value)?;
            }
        }

        Ok(())
    }

    /// Enforces every constraint without modifying the document.
    pub fn validate(&self, document: &Document) -> ModelResult<()> {
        let mut copy = document.clone();
        self.apply(&mut copy)
    }
}

/// Builder for [`Schema`].
#[derive(Debug, Clone, Default)]
pub struct SchemaBuilder {
    fields: Vec<(String, FieldDef)>,
    options: SchemaOptions,
}

impl SchemaBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, name: impl Into<String>, def: FieldDef) -> Self {
        self.fields.push((name.into(), def));
        self
    }

    pub fn collection(mut self, collection: impl Into<String>) -> Self {
        self.options.collection = collection.into();
        self
    }

    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.options.database = Some(database.into());
        self
    }

    pub fn connection(mut self, alias: impl Into<String>) -> Self {
        self.options.connection = Some(alias.into());
        self
    }

    pub fn audit(mut self, enabled: bool) -> Self {
        self.options.audit = enabled;
        self
    }

    pub fn skip_validation(mut self, enabled: bool) -> Self {
        self.options.skip_validation = enabled;
        self
    }

    pub fn soft_delete(mut self, enabled: bool) -> Self {
        self.options.soft_delete = enabled;
        self
    }

    pub fn timestamps(mut self, enabled: bool) -> Self {
        self.options.timestamps = enabled;
        self
    }

    pub(crate) fn has_collection(&self) -> bool {
        !self.options.collection.is_empty()
    }

    /// Compiles patterns, checks defaults against their kinds and freezes the table.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::Configuration`] for an empty collection name, a duplicate
    /// field, an invalid pattern or a default of the wrong kind.
    pub fn build(self) -> ModelResult<Schema> {
        if self.options.collection.is_empty() {
            return Err(ModelError::Configuration("schema has no collection name".to_string()));
        }

        let mut fields: Vec<(String, FieldDef)> = Vec::with_capacity(self.fields.len());
        for (name, mut def) in self.fields {
            if fields.iter().any(|(existing, _)| *existing == name) {
                return Err(ModelError::Configuration(format!("duplicate field `{}`", name)));
            }
            def.compile(&name)?;
            fields.push((name, def));
        }

        Ok(Schema { fields, options: self.options })
    }
}

/// Name-keyed cache of schemas.
///
/// Registration is idempotent: registering a name twice returns the schema stored the
/// first time.
#[derive(Debug, Default)]
pub struct SchemaCatalog {
    schemas: RwLock<HashMap<String, Arc<Schema>>>,
}

impl SchemaCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: &str, schema: Schema) -> Arc<Schema> {
        if let Some(existing) = self.schemas.read().get(name) {
            return existing.clone();
        }

        self.schemas
            .write()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(schema))
            .clone()
    }

    /// Registers the schema produced by `build` unless `name` is already present.
    pub fn register_with<F>(&self, name: &str, build: F) -> ModelResult<Arc<Schema>>
    where
        F: FnOnce() -> ModelResult<Schema>,
    {
        if let Some(existing) = self.get(name) {
            return Ok(existing);
        }

        Ok(self.register(name, build()?))
    }

    pub fn get(&self, name: &str) -> Option<Arc<Schema>> {
        self.schemas.read().get(name).cloned()
    }

    /// Resolves a reference to a collection name.
    pub fn resolve(&self, reference: &Reference) -> Option<String> {
        match reference {
            Reference::Collection(collection) => Some(collection.clone()),
            Reference::Schema(name) => self
                .get(name)
                .map(|schema| schema.collection().to_string()),
        }
    }
}
