//! Accumulating aggregation-pipeline builder.
//!
//! [`Pipeline`] turns chained predicate, sort, pagination and projection calls into a
//! minimal, valid aggregation pipeline. It keeps three positional invariants:
//!
//! - filter predicates accumulate in a single `$match` stage; a second predicate on the
//!   same field promotes the pair into an `$and` array, and an armed "or" context folds
//!   every existing top-level predicate into an `$or` array
//! - there is at most one `$skip` and one `$limit`, and `$skip` always precedes `$limit`
//!   whatever the call order
//! - `$match` and `$sort` stages created after pagination stages are placed before them
//!
//! # Example
//!
//! ```ignore
//! use docmodel::pipeline::{Pipeline, FilterOp, SortOrder};
//!
//! let mut pipeline = Pipeline::new();
//! pipeline.add_filter("age", FilterOp::Gte, 18.into());
//! pipeline.limit(10);
//! pipeline.skip(20);
//! pipeline.sort("name", SortOrder::Asc);
//! // [{$match: {age: {$gte: 18}}}, {$sort: {name: 1}}, {$skip: 20}, {$limit: 10}]
//! ```

use bson::{Bson, Document, doc};
use std::{fmt, str::FromStr};

use crate::error::{ModelError, ModelResult};

const MATCH: &str = "$match";
const SORT: &str = "$sort";
const SKIP: &str = "$skip";
const LIMIT: &str = "$limit";
const FACET: &str = "$facet";
const PROJECT: &str = "$project";

/// Comparison operators accepted by [`Pipeline::add_filter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    Nin,
    Regex,
    Exists,
}

impl FilterOp {
    /// The store operator this maps to.
    pub fn operator(&self) -> &'static str {
        match self {
            FilterOp::Eq => "$eq",
            FilterOp::Ne => "$ne",
            FilterOp::Gt => "$gt",
            FilterOp::Gte => "$gte",
            FilterOp::Lt => "$lt",
            FilterOp::Lte => "$lte",
            FilterOp::In => "$in",
            FilterOp::Nin => "$nin",
            FilterOp::Regex => "$regex",
            FilterOp::Exists => "$exists",
        }
    }
}

impl FromStr for FilterOp {
    type Err = ModelError;

    fn from_str(s: &str) -> ModelResult<Self> {
        Ok(match s {
            "eq" => FilterOp::Eq,
            "ne" => FilterOp::Ne,
            "gt" => FilterOp::Gt,
            "gte" => FilterOp::Gte,
            "lt" => FilterOp::Lt,
            "lte" => FilterOp::Lte,
            "in" => FilterOp::In,
            "nin" => FilterOp::Nin,
            "reg" | "regex" => FilterOp::Regex,
            "exists" => FilterOp::Exists,
            other => return Err(ModelError::Query(format!("unknown filter operator `{}`", other))),
        })
    }
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

impl SortOrder {
    pub fn as_i32(&self) -> i32 {
        match self {
            SortOrder::Asc => 1,
            SortOrder::Desc => -1,
        }
    }
}

impl FromStr for SortOrder {
    type Err = ModelError;

    fn from_str(s: &str) -> ModelResult<Self> {
        match s.to_ascii_lowercase().as_str() {
            "asc" | "1" => Ok(SortOrder::Asc),
            "desc" | "-1" => Ok(SortOrder::Desc),
            other => Err(ModelError::Query(format!("invalid sort direction `{}`", other))),
        }
    }
}

/// Parses a flat `field, direction, field, direction, ...` list.
///
/// # Errors
///
/// Returns [`ModelError::Query`] when the list is unpaired or a direction is invalid.
pub fn parse_sort_args<S: AsRef<str>>(args: &[S]) -> ModelResult<Vec<(String, SortOrder)>> {
    if args.len() % 2 != 0 {
        return Err(ModelError::Query(format!(
            "sort arguments must be field/direction pairs, got {} values",
            args.len()
        )));
    }

    args.chunks(2)
        .map(|pair| Ok((pair[0].as_ref().to_string(), pair[1].as_ref().parse()?)))
        .collect()
}

/// A `$lookup` join description.
#[derive(Debug, Clone, PartialEq)]
pub struct Lookup {
    pub from: String,
    pub local_field: String,
    pub foreign_field: String,
    pub as_field: String,
    /// Stages run on the joined documents.
    pub pipeline: Option<Vec<Document>>,
}

impl Lookup {
    fn into_stage(self) -> Document {
        let mut body = doc! {
            "from": self.from,
            "localField": self.local_field,
            "foreignField": self.foreign_field,
            "as": self.as_field,
        };
        if let Some(pipeline) = self.pipeline {
            body.insert("pipeline", pipeline);
        }
        doc! { "$lookup": body }
    }
}

/// BSON has no unsigned integer; counts beyond `i64::MAX` are capped.
fn clamp(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

/// Returns the operator name of a stage, e.g. `"$match"`.
pub fn stage_name(stage: &Document) -> Option<&str> {
    stage.keys().next().map(String::as_str)
}

fn predicate(field: &str, op: FilterOp, value: Bson) -> Bson {
    let mut inner = Document::new();
    inner.insert(op.operator(), value);
    let mut outer = Document::new();
    outer.insert(field, inner);
    Bson::Document(outer)
}

fn predicate_field(predicate: &Bson) -> Option<&str> {
    predicate
        .as_document()
        .and_then(|doc| doc.keys().next())
        .map(String::as_str)
}

/// An ordered, mergeable list of aggregation stages.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Pipeline {
    stages: Vec<Document>,
    or_next: bool,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_stages(stages: Vec<Document>) -> Self {
        Self { stages, or_next: false }
    }

    pub fn stages(&self) -> &[Document] {
        &self.stages
    }

    pub fn into_stages(self) -> Vec<Document> {
        self.stages
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.stages
            .iter()
            .position(|stage| stage_name(stage) == Some(name))
    }

    /// Where a newly created stage of kind `name` goes.
    fn insert_position(&self, name: &str) -> usize {
        match name {
            MATCH | SORT => self
                .stages
                .iter()
                .position(|stage| matches!(stage_name(stage), Some(SKIP | LIMIT | FACET)))
                .unwrap_or(self.stages.len()),
            _ => self.stages.len(),
        }
    }

    fn insert_stage(&mut self, name: &str, body: Bson) -> usize {
        let at = self.insert_position(name);
        let mut stage = Document::new();
        stage.insert(name, body);
        self.stages.insert(at, stage);
        at
    }

    /// Arms the "or" context: the next [`add_filter`](Self::add_filter) becomes
    /// disjunctive with every predicate already present.
    pub fn or(&mut self) {
        self.or_next = true;
    }

    /// Adds `{field: {op: value}}` to the single `$match` stage.
    pub fn add_filter(&mut self, field: &str, op: FilterOp, value: Bson) {
        let index = match self.position(MATCH) {
            Some(index) => index,
            None => self.insert_stage(MATCH, Bson::Document(Document::new())),
        };

        let new = predicate(field, op, value);
        let or_mode = std::mem::take(&mut self.or_next);
        let body = match self.stages[index].get_mut(MATCH) {
            Some(Bson::Document(body)) => body,
            _ => {
                self.stages[index] = doc! { MATCH: {} };
                match self.stages[index].get_mut(MATCH) {
                    Some(Bson::Document(body)) => body,
                    _ => return,
                }
            }
        };

        if or_mode {
            let mut disjuncts = match body.remove("$or") {
                Some(Bson::Array(items)) => items,
                _ => Vec::new(),
            };
            let existing = std::mem::take(body);
            for (key, value) in existing {
                let mut single = Document::new();
                single.insert(key, value);
                disjuncts.push(Bson::Document(single));
            }
            disjuncts.push(new);
            body.insert("$or", disjuncts);
            return;
        }

        if let Some(old) = body.remove(field) {
            let mut conjuncts = match body.remove("$and") {
                Some(Bson::Array(items)) => items,
                _ => Vec::new(),
            };
            let mut previous = Document::new();
            previous.insert(field, old);
            conjuncts.push(Bson::Document(previous));
            conjuncts.push(new);
            body.insert("$and", conjuncts);
            return;
        }

        if let Some(Bson::Array(conjuncts)) = body.get_mut("$and") {
            if conjuncts
                .iter()
                .any(|item| predicate_field(item) == Some(field))
            {
                conjuncts.push(new);
                return;
            }
        }

        if let Bson::Document(mut single) = new {
            if let Some(value) = single.remove(field) {
                body.insert(field, value);
            }
        }
    }

    /// Appends a separate `$match` stage without merging into the first one.
    ///
    /// Used for predicates that must run after a join.
    pub fn push_match(&mut self, filter: Document) {
        self.stages.push(doc! { MATCH: filter });
    }

    /// Sets `key` in the first `stage` entry, creating the stage if absent. An existing
    /// key is left untouched.
    pub fn add_stage_option(&mut self, stage: &str, key: &str, value: Bson) {
        if let Some(index) = self.position(stage) {
            if let Some(Bson::Document(body)) = self.stages[index].get_mut(stage) {
                if !body.contains_key(key) {
                    body.insert(key, value);
                }
                return;
            }
        }

        let mut body = Document::new();
        body.insert(key, value);
        self.insert_stage(stage, Bson::Document(body));
    }

    /// Appends an arbitrary stage.
    pub fn push(&mut self, stage: Document) {
        self.stages.push(stage);
    }

    /// Inserts a stage at the head of the pipeline.
    pub fn prepend(&mut self, stage: Document) {
        self.stages.insert(0, stage);
    }

    pub fn sort(&mut self, field: &str, order: SortOrder) {
        self.add_stage_option(SORT, field, Bson::Int32(order.as_i32()));
    }

    /// Adds every key of `projection` to the `$project` stage.
    pub fn project(&mut self, projection: &Document) {
        for (key, value) in projection {
            self.add_stage_option(PROJECT, key, value.clone());
        }
    }

    /// Sets the `$skip` stage, placing it before an existing `$limit`.
    pub fn skip(&mut self, n: u64) {
        let stage = doc! { SKIP: clamp(n) };
        if let Some(index) = self.position(SKIP) {
            self.stages[index] = stage;
        } else if let Some(index) = self.position(LIMIT) {
            self.stages.insert(index, stage);
        } else {
            self.stages.push(stage);
        }
    }

    /// Sets the `$limit` stage at the tail.
    pub fn limit(&mut self, n: u64) {
        self.stages
            .retain(|stage| stage_name(stage) != Some(LIMIT));
        self.stages.push(doc! { LIMIT: clamp(n) });
    }

    pub fn lookup(&mut self, lookup: Lookup) {
        self.stages.push(lookup.into_stage());
    }

    pub fn unwind(&mut self, path: &str, preserve_null_and_empty: bool) {
        self.stages.push(doc! {
            "$unwind": {
                "path": format!("${}", path),
                "preserveNullAndEmptyArrays": preserve_null_and_empty,
            }
        });
    }

    /// Applies skip/limit for a 1-based `page` and wraps the whole pipeline in one
    /// `$facet` stage with a `docs` branch and a `count` branch.
    ///
    /// The `count` branch counts the rows the pipeline selects before pagination.
    pub fn paginate(&mut self, page: u64, limit: u64) {
        let page = page.max(1);
        let limit = limit.max(1);

        let mut count: Vec<Document> = self
            .stages
            .iter()
            .filter(|stage| !matches!(stage_name(stage), Some(SKIP | LIMIT | SORT | PROJECT)))
            .cloned()
            .collect();
        count.push(doc! { "$count": "count" });

        self.skip((page - 1).saturating_mul(limit));
        self.limit(limit);

        let docs = std::mem::take(&mut self.stages);
        self.stages.push(doc! {
            FACET: {
                "docs": docs,
                "count": count,
            }
        });
    }

    /// Merges every `$match` body into one filter document.
    ///
    /// A key present in several stages is combined under `$and`.
    pub fn match_filter(&self) -> Document {
        let mut merged = Document::new();
        for stage in &self.stages {
            let Some(Bson::Document(body)) = stage.get(MATCH) else {
                continue;
            };
            for (key, value) in body {
                match merged.remove(key) {
                    Some(previous) => {
                        let mut conjuncts = match merged.remove("$and") {
                            Some(Bson::Array(items)) => items,
                            _ => Vec::new(),
                        };
                        let mut left = Document::new();
                        left.insert(key.clone(), previous);
                        let mut right = Document::new();
                        right.insert(key.clone(), value.clone());
                        conjuncts.push(Bson::Document(left));
                        conjuncts.push(Bson::Document(right));
                        merged.insert("$and", conjuncts);
                    }
                    None => {
                        merged.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        merged
    }
}

impl fmt::Display for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stages: Vec<String> = self
            .stages
            .iter()
            .map(|stage| stage.to_string())
            .collect();
        write!(f, "[{}]", stages.join(", "))
    }
}
