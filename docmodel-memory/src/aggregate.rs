//! Aggregation stage interpreter.
//!
//! Runs the pipeline stages the engine emits against documents held in memory:
//! `$match`, `$sort`, `$skip`, `$limit`, `$count`, `$project`, `$addFields`/`$set`,
//! `$unset`, `$unwind`, `$lookup` and `$facet`.

use bson::{Bson, Document};
use std::{cmp::Ordering, collections::HashMap};

use docmodel_core::{
    backend::Namespace,
    error::{ModelError, ModelResult},
};

use crate::evaluator::{Comparable, as_u64, matches, remove_path, set_path, value_at, values_at};

/// Evaluates pipelines against one database of a store snapshot.
pub(crate) struct Aggregator<'a> {
    collections: &'a HashMap<Namespace, Vec<Document>>,
    database: &'a str,
}

impl<'a> Aggregator<'a> {
    pub(crate) fn new(collections: &'a HashMap<Namespace, Vec<Document>>, database: &'a str) -> Self {
        Self { collections, database }
    }

    /// Runs `stages` in order over `documents`.
    pub(crate) fn run(&self, mut documents: Vec<Document>, stages: &[Document]) -> ModelResult<Vec<Document>> {
        for stage in stages {
            documents = self.stage(documents, stage)?;
        }
        Ok(documents)
    }

    fn stage(&self, documents: Vec<Document>, stage: &Document) -> ModelResult<Vec<Document>> {
        let mut entries = stage.iter();
        let (name, body) = match (entries.next(), entries.next()) {
            (Some(entry), None) => entry,
            _ => return Err(ModelError::Query(format!("a stage must have exactly one operator: {}", stage))),
        };

        match name.as_str() {
            "$match" => {
                let filter = expect_document(name, body)?;
                let mut selected = Vec::with_capacity(documents.len());
                for document in documents {
                    if matches(&document, filter)? {
                        selected.push(document);
                    }
                }
                Ok(selected)
            }
            "$sort" => sort(documents, expect_document(name, body)?),
            "$skip" => {
                let skip = expect_count(name, body)?;
                Ok(documents.into_iter().skip(skip).collect())
            }
            "$limit" => {
                let limit = expect_count(name, body)?;
                Ok(documents.into_iter().take(limit).collect())
            }
            "$count" => {
                let Bson::String(field) = body else {
                    return Err(ModelError::Query("`$count` expects a field name".into()));
                };
                if documents.is_empty() {
                    return Ok(Vec::new());
                }
                let mut counted = Document::new();
                counted.insert(field.as_str(), documents.len() as i64);
                Ok(vec![counted])
            }
            "$project" => {
                let projection = Projection::parse(expect_document(name, body)?)?;
                documents
                    .into_iter()
                    .map(|document| projection.apply(document))
                    .collect()
            }
            "$addFields" | "$set" => {
                let fields = expect_document(name, body)?;
                documents
                    .into_iter()
                    .map(|mut document| {
                        for (path, expression) in fields {
                            let value = evaluate(&document, expression);
                            set_path(&mut document, path, value)?;
                        }
                        Ok(document)
                    })
                    .collect()
            }
            "$unset" => {
                let paths: Vec<&str> = match body {
                    Bson::String(path) => vec![path.as_str()],
                    Bson::Array(items) => items.iter().filter_map(Bson::as_str).collect(),
                    _ => return Err(ModelError::Query("`$unset` expects a field name or an array".into())),
                };
                Ok(documents
                    .into_iter()
                    .map(|mut document| {
                        for path in &paths {
                            remove_path(&mut document, path);
                        }
                        document
                    })
                    .collect())
            }
            "$unwind" => unwind(documents, body),
            "$lookup" => self.lookup(documents, expect_document(name, body)?),
            "$facet" => {
                let branches = expect_document(name, body)?;
                let mut output = Document::new();
                for (branch, stages) in branches {
                    let stages = match stages {
                        Bson::Array(items) => items
                            .iter()
                            .map(|item| expect_document("$facet", item).cloned())
                            .collect::<ModelResult<Vec<_>>>()?,
                        _ => return Err(ModelError::Query(format!("facet branch `{}` must be an array", branch))),
                    };
                    let rows = self.run(documents.clone(), &stages)?;
                    output.insert(branch.as_str(), rows.into_iter().map(Bson::Document).collect::<Vec<_>>());
                }
                Ok(vec![output])
            }
            other => Err(ModelError::Query(format!("unsupported pipeline stage `{}`", other))),
        }
    }

    fn lookup(&self, documents: Vec<Document>, spec: &Document) -> ModelResult<Vec<Document>> {
        let from = spec
            .get_str("from")
            .map_err(|_| ModelError::Query("`$lookup` requires `from`".into()))?;
        let as_field = spec
            .get_str("as")
            .map_err(|_| ModelError::Query("`$lookup` requires `as`".into()))?;
        let join = match (spec.get_str("localField"), spec.get_str("foreignField")) {
            (Ok(local), Ok(foreign)) => Some((local, foreign)),
            _ => None,
        };
        let sub_pipeline = match spec.get("pipeline") {
            Some(Bson::Array(items)) => items
                .iter()
                .map(|item| expect_document("$lookup", item).cloned())
                .collect::<ModelResult<Vec<_>>>()?,
            Some(_) => return Err(ModelError::Query("`$lookup` pipeline must be an array".into())),
            None => Vec::new(),
        };

        let foreign = self
            .collections
            .get(&Namespace::new(self.database, from))
            .map(Vec::as_slice)
            .unwrap_or_default();

        documents
            .into_iter()
            .map(|mut document| {
                let joined: Vec<Document> = match join {
                    Some((local, foreign_field)) => {
                        let keys = join_keys(&document, local);
                        foreign
                            .iter()
                            .filter(|candidate| {
                                let values = join_keys(candidate, foreign_field);
                                keys.iter().any(|key| values.iter().any(|value| key == value))
                            })
                            .cloned()
                            .collect()
                    }
                    None => foreign.to_vec(),
                };
                let joined = self.run(joined, &sub_pipeline)?;
                set_path(
                    &mut document,
                    as_field,
                    Bson::Array(joined.into_iter().map(Bson::Document).collect()),
                )?;
                Ok(document)
            })
            .collect()
    }
}

/// Join keys of a document: the values at `path` with arrays flattened, or `null`
/// when the path is missing.
fn join_keys<'a>(document: &'a Document, path: &str) -> Vec<Comparable<'a>> {
    let mut keys = Vec::new();
    for value in values_at(document, path) {
        match value {
            Bson::Array(items) => keys.extend(items.iter().map(Comparable::from)),
            other => keys.push(Comparable::from(other)),
        }
    }
    if keys.is_empty() {
        keys.push(Comparable::Null);
    }
    keys
}

fn expect_document<'b>(stage: &str, body: &'b Bson) -> ModelResult<&'b Document> {
    body.as_document()
        .ok_or_else(|| ModelError::Query(format!("`{}` expects a document", stage)))
}

fn expect_count(stage: &str, body: &Bson) -> ModelResult<usize> {
    as_u64(body)
        .and_then(|n| usize::try_from(n).ok())
        .ok_or_else(|| ModelError::Query(format!("`{}` expects a non-negative integer", stage)))
}

fn sort(mut documents: Vec<Document>, keys: &Document) -> ModelResult<Vec<Document>> {
    let keys = keys
        .iter()
        .map(|(path, direction)| match direction {
            Bson::Int32(1) | Bson::Int64(1) => Ok((path.as_str(), false)),
            Bson::Int32(-1) | Bson::Int64(-1) => Ok((path.as_str(), true)),
            Bson::Double(d) if *d == 1.0 => Ok((path.as_str(), false)),
            Bson::Double(d) if *d == -1.0 => Ok((path.as_str(), true)),
            other => Err(ModelError::Query(format!("invalid sort direction for `{}`: {}", path, other))),
        })
        .collect::<ModelResult<Vec<_>>>()?;

    documents.sort_by(|a, b| {
        for (path, descending) in &keys {
            let left = value_at(a, path).map(Comparable::from).unwrap_or(Comparable::Null);
            let right = value_at(b, path).map(Comparable::from).unwrap_or(Comparable::Null);
            let ordering = if *descending {
                right.sort_cmp(&left)
            } else {
                left.sort_cmp(&right)
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });

    Ok(documents)
}

fn unwind(documents: Vec<Document>, body: &Bson) -> ModelResult<Vec<Document>> {
    let (path, preserve) = match body {
        Bson::String(path) => (path.as_str(), false),
        Bson::Document(spec) => (
            spec.get_str("path")
                .map_err(|_| ModelError::Query("`$unwind` requires `path`".into()))?,
            matches!(spec.get("preserveNullAndEmptyArrays"), Some(Bson::Boolean(true))),
        ),
        _ => return Err(ModelError::Query("`$unwind` expects a path or a document".into())),
    };
    let path = path
        .strip_prefix('$')
        .ok_or_else(|| ModelError::Query(format!("`$unwind` path must start with `$`: {}", path)))?;

    let mut output = Vec::with_capacity(documents.len());
    for document in documents {
        match value_at(&document, path).cloned() {
            Some(Bson::Array(items)) if !items.is_empty() => {
                for item in items {
                    let mut copy = document.clone();
                    set_path(&mut copy, path, item)?;
                    output.push(copy);
                }
            }
            Some(Bson::Array(_)) | None | Some(Bson::Null) => {
                if preserve {
                    let mut kept = document;
                    if matches!(value_at(&kept, path), Some(Bson::Array(_))) {
                        remove_path(&mut kept, path);
                    }
                    output.push(kept);
                }
            }
            Some(_) => output.push(document),
        }
    }

    Ok(output)
}

/// Resolves a `"$path"` field reference; any other expression is taken literally.
fn evaluate(document: &Document, expression: &Bson) -> Bson {
    match expression {
        Bson::String(reference) if reference.starts_with('$') => {
            value_at(document, &reference[1..]).cloned().unwrap_or(Bson::Null)
        }
        literal => literal.clone(),
    }
}

enum Projection {
    Include { fields: Vec<(String, Option<Bson>)>, keep_id: bool },
    Exclude { fields: Vec<String> },
}

impl Projection {
    fn parse(spec: &Document) -> ModelResult<Self> {
        let mut include = Vec::new();
        let mut exclude = Vec::new();
        let mut keep_id = true;

        for (path, value) in spec {
            let flag = match value {
                Bson::Boolean(flag) => Some(*flag),
                Bson::Int32(n) => Some(*n != 0),
                Bson::Int64(n) => Some(*n != 0),
                Bson::Double(n) => Some(*n != 0.0),
                _ => None,
            };
            match flag {
                Some(false) if path == "_id" => keep_id = false,
                Some(false) => exclude.push(path.clone()),
                Some(true) => include.push((path.clone(), None)),
                None => include.push((path.clone(), Some(value.clone()))),
            }
        }

        if !include.is_empty() && !exclude.is_empty() {
            return Err(ModelError::Query("cannot mix inclusion and exclusion in `$project`".into()));
        }

        if include.is_empty() {
            if !keep_id {
                exclude.push("_id".into());
            }
            Ok(Projection::Exclude { fields: exclude })
        } else {
            Ok(Projection::Include { fields: include, keep_id })
        }
    }

    fn apply(&self, mut document: Document) -> ModelResult<Document> {
        match self {
            Projection::Exclude { fields } => {
                for path in fields {
                    remove_path(&mut document, path);
                }
                Ok(document)
            }
            Projection::Include { fields, keep_id } => {
                let mut projected = Document::new();
                if *keep_id {
                    if let Some(id) = document.get("_id") {
                        projected.insert("_id", id.clone());
                    }
                }
                for (path, expression) in fields {
                    let value = match expression {
                        Some(expression) => Some(evaluate(&document, expression)),
                        None => value_at(&document, path).cloned(),
                    };
                    if let Some(value) = value {
                        set_path(&mut projected, path, value)?;
                    }
                }
                Ok(projected)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    fn store() -> HashMap<Namespace, Vec<Document>> {
        let mut collections = HashMap::new();
        collections.insert(
            Namespace::new("app", "users"),
            vec![
                doc! { "_id": 1, "name": "ann", "age": 30 },
                doc! { "_id": 2, "name": "bob", "age": 25 },
                doc! { "_id": 3, "name": "cid", "age": 35 },
            ],
        );
        collections.insert(
            Namespace::new("app", "posts"),
            vec![
                doc! { "_id": 10, "author": 1, "title": "a" },
                doc! { "_id": 11, "author": 1, "title": "b" },
                doc! { "_id": 12, "author": 2, "title": "c" },
            ],
        );
        collections
    }

    fn run(stages: Vec<Document>, collection: &str) -> ModelResult<Vec<Document>> {
        let collections = store();
        let documents = collections
            .get(&Namespace::new("app", collection))
            .cloned()
            .unwrap_or_default();
        Aggregator::new(&collections, "app").run(documents, &stages)
    }

    #[test]
    fn test_match_sort_skip_limit() {
        let rows = run(
            vec![
                doc! { "$match": { "age": { "$gte": 25 } } },
                doc! { "$sort": { "age": -1 } },
                doc! { "$skip": 1_i64 },
                doc! { "$limit": 1_i64 },
            ],
            "users",
        )
        .unwrap();

        assert_eq!(rows, vec![doc! { "_id": 1, "name": "ann", "age": 30 }]);
    }

    #[test]
    fn test_count_of_nothing_is_empty() {
        let rows = run(
            vec![doc! { "$match": { "age": 99 } }, doc! { "$count": "count" }],
            "users",
        )
        .unwrap();
        assert!(rows.is_empty());

        let rows = run(vec![doc! { "$count": "count" }], "users").unwrap();
        assert_eq!(rows, vec![doc! { "count": 3_i64 }]);
    }

    #[test]
    fn test_facet_branches_see_the_same_input() {
        let rows = run(
            vec![doc! { "$facet": {
                "docs": [{ "$skip": 2_i64 }],
                "count": [{ "$count": "count" }],
            } }],
            "users",
        )
        .unwrap();

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get_array("docs").unwrap().len(), 1);
        assert_eq!(
            rows[0].get_array("count").unwrap()[0],
            Bson::Document(doc! { "count": 3_i64 })
        );
    }

    #[test]
    fn test_lookup_with_sub_pipeline_and_unwind() {
        let rows = run(
            vec![
                doc! { "$match": { "_id": 10 } },
                doc! { "$lookup": {
                    "from": "users",
                    "localField": "author",
                    "foreignField": "_id",
                    "as": "author",
                    "pipeline": [{ "$project": { "name": 1 } }],
                } },
                doc! { "$unwind": { "path": "$author", "preserveNullAndEmptyArrays": true } },
            ],
            "posts",
        )
        .unwrap();

        assert_eq!(
            rows,
            vec![doc! { "_id": 10, "author": { "_id": 1, "name": "ann" }, "title": "a" }]
        );
    }

    #[test]
    fn test_lookup_to_many() {
        let rows = run(
            vec![
                doc! { "$match": { "_id": 1 } },
                doc! { "$lookup": { "from": "posts", "localField": "_id", "foreignField": "author", "as": "posts" } },
            ],
            "users",
        )
        .unwrap();

        assert_eq!(rows[0].get_array("posts").unwrap().len(), 2);
    }

    #[test]
    fn test_unwind_drops_empty_unless_preserved() {
        let rows = run(
            vec![
                doc! { "$lookup": { "from": "posts", "localField": "_id", "foreignField": "author", "as": "posts" } },
                doc! { "$unwind": "$posts" },
            ],
            "users",
        )
        .unwrap();
        assert_eq!(rows.len(), 3);

        let rows = run(
            vec![
                doc! { "$lookup": { "from": "posts", "localField": "_id", "foreignField": "author", "as": "posts" } },
                doc! { "$unwind": { "path": "$posts", "preserveNullAndEmptyArrays": true } },
            ],
            "users",
        )
        .unwrap();
        assert_eq!(rows.len(), 4);
        assert!(!rows.iter().find(|row| row.get("_id") == Some(&Bson::Int32(3))).unwrap().contains_key("posts"));
    }

    #[test]
    fn test_project_exclusion_and_mixing() {
        let rows = run(vec![doc! { "$project": { "age": 0, "_id": 0 } }], "users").unwrap();
        assert_eq!(rows[0], doc! { "name": "ann" });

        let err = run(vec![doc! { "$project": { "age": 0, "name": 1 } }], "users").unwrap_err();
        assert!(matches!(err, ModelError::Query(_)));
    }

    #[test]
    fn test_add_fields_resolves_references() {
        let rows = run(
            vec![doc! { "$match": { "_id": 2 } }, doc! { "$addFields": { "label": "$name", "kind": "user" } }],
            "users",
        )
        .unwrap();

        assert_eq!(rows[0].get_str("label").unwrap(), "bob");
        assert_eq!(rows[0].get_str("kind").unwrap(), "user");
    }

    #[test]
    fn test_unsupported_stage() {
        let err = run(vec![doc! { "$group": { "_id": "$age" } }], "users").unwrap_err();
        assert!(matches!(err, ModelError::Query(_)));
    }
}
