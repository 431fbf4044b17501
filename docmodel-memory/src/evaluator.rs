//! Filter and update evaluation for in-memory documents.
//!
//! This module interprets the subset of the store query language the engine emits:
//! field predicates with comparison, membership, existence and regular expression
//! operators, the `$and`/`$or`/`$nor` combinators, and the `$set`, `$unset`, `$inc`,
//! `$push` and `$setOnInsert` update operators. Dotted paths traverse embedded
//! documents and arrays.

use bson::{Bson, Document, datetime::DateTime, oid::ObjectId};
use regex::RegexBuilder;
use std::{cmp::Ordering, collections::HashMap};

use docmodel_core::error::{ModelError, ModelResult};

/// Type-erased, comparable representation of BSON values.
///
/// Numeric types are normalized to `f64` so that `Int32(1)`, `Int64(1)` and
/// `Double(1.0)` compare equal.
#[derive(Debug)]
pub(crate) enum Comparable<'a> {
    Null,
    Bool(bool),
    Number(f64),
    DateTime(DateTime),
    String(&'a str),
    ObjectId(ObjectId),
    Array(Vec<Comparable<'a>>),
    Map(HashMap<&'a str, Comparable<'a>>),
    /// Any other BSON type, compared structurally.
    Other(&'a Bson),
}

impl<'a> From<&'a Bson> for Comparable<'a> {
    fn from(bson: &'a Bson) -> Self {
        match bson {
            Bson::Null => Comparable::Null,
            Bson::Boolean(value) => Comparable::Bool(*value),
            Bson::Int32(value) => Comparable::Number(*value as f64),
            Bson::Int64(value) => Comparable::Number(*value as f64),
            Bson::Double(value) => Comparable::Number(*value),
            Bson::DateTime(value) => Comparable::DateTime(*value),
            Bson::String(value) => Comparable::String(value),
            Bson::ObjectId(value) => Comparable::ObjectId(*value),
            Bson::Array(arr) => Comparable::Array(arr.iter().map(Comparable::from).collect()),
            Bson::Document(doc) => Comparable::Map(
                doc.iter()
                    .map(|(k, v)| (k.as_str(), Comparable::from(v)))
                    .collect(),
            ),
            other => Comparable::Other(other),
        }
    }
}

impl<'a> Comparable<'a> {
    /// Canonical cross-type sort rank.
    fn rank(&self) -> u8 {
        match self {
            Comparable::Null => 0,
            Comparable::Number(_) => 1,
            Comparable::String(_) => 2,
            Comparable::Map(_) => 3,
            Comparable::Array(_) => 4,
            Comparable::ObjectId(_) => 5,
            Comparable::Bool(_) => 6,
            Comparable::DateTime(_) => 7,
            Comparable::Other(_) => 8,
        }
    }

    /// Total order used by `$sort`: values of different types order by type rank.
    pub(crate) fn sort_cmp(&self, other: &Self) -> Ordering {
        match self.rank().cmp(&other.rank()) {
            Ordering::Equal => self.partial_cmp(other).unwrap_or(Ordering::Equal),
            ordering => ordering,
        }
    }
}

impl<'a> PartialEq for Comparable<'a> {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Comparable::Null, Comparable::Null) => true,
            (Comparable::Bool(a), Comparable::Bool(b)) => a == b,
            (Comparable::Number(a), Comparable::Number(b)) => a == b,
            (Comparable::DateTime(a), Comparable::DateTime(b)) => a == b,
            (Comparable::String(a), Comparable::String(b)) => a == b,
            (Comparable::ObjectId(a), Comparable::ObjectId(b)) => a == b,
            (Comparable::Array(a), Comparable::Array(b)) => a == b,
            (Comparable::Map(a), Comparable::Map(b)) => a == b,
            (Comparable::Other(a), Comparable::Other(b)) => a == b,
            _ => false,
        }
    }
}

impl<'a> PartialOrd for Comparable<'a> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Comparable::Bool(a), Comparable::Bool(b)) => a.partial_cmp(b),
            (Comparable::Number(a), Comparable::Number(b)) => a.partial_cmp(b),
            (Comparable::DateTime(a), Comparable::DateTime(b)) => a.partial_cmp(b),
            (Comparable::String(a), Comparable::String(b)) => a.partial_cmp(b),
            (Comparable::ObjectId(a), Comparable::ObjectId(b)) => a.partial_cmp(b),
            _ => None,
        }
    }
}

/// Collects every value reachable through a dotted `path`.
///
/// Arrays met along the way are traversed element-wise, and a numeric segment
/// indexes into an array. A missing path yields no values.
pub(crate) fn values_at<'a>(document: &'a Document, path: &str) -> Vec<&'a Bson> {
    let mut segments = path.split('.');
    let mut current: Vec<&Bson> = match segments.next().and_then(|first| document.get(first)) {
        Some(value) => vec![value],
        None => return Vec::new(),
    };

    for segment in segments {
        let mut next = Vec::new();
        for value in current {
            match value {
                Bson::Document(inner) => next.extend(inner.get(segment)),
                Bson::Array(items) => match segment.parse::<usize>() {
                    Ok(index) => next.extend(items.get(index)),
                    Err(_) => next.extend(
                        items
                            .iter()
                            .filter_map(Bson::as_document)
                            .filter_map(|inner| inner.get(segment)),
                    ),
                },
                _ => {}
            }
        }
        current = next;
    }

    current
}

/// Returns the first value at `path`, if any.
pub(crate) fn value_at<'a>(document: &'a Document, path: &str) -> Option<&'a Bson> {
    values_at(document, path).into_iter().next()
}

/// Returns `true` if `document` satisfies `filter`.
///
/// # Errors
///
/// Returns [`ModelError::Query`] for unsupported operators or malformed operands.
pub(crate) fn matches(document: &Document, filter: &Document) -> ModelResult<bool> {
    for (key, condition) in filter {
        let satisfied = match key.as_str() {
            "$and" => {
                let mut all = true;
                for clause in clauses(key, condition)? {
                    if !matches(document, clause)? {
                        all = false;
                        break;
                    }
                }
                all
            }
            "$or" => {
                let mut any = false;
                for clause in clauses(key, condition)? {
                    if matches(document, clause)? {
                        any = true;
                        break;
                    }
                }
                any
            }
            "$nor" => {
                let mut none = true;
                for clause in clauses(key, condition)? {
                    if matches(document, clause)? {
                        none = false;
                        break;
                    }
                }
                none
            }
            operator if operator.starts_with('$') => {
                return Err(ModelError::Query(format!("unsupported query operator `{}`", operator)));
            }
            path => matches_field(&values_at(document, path), condition)?,
        };

        if !satisfied {
            return Ok(false);
        }
    }

    Ok(true)
}

fn clauses<'a>(operator: &str, condition: &'a Bson) -> ModelResult<Vec<&'a Document>> {
    match condition {
        Bson::Array(items) => items
            .iter()
            .map(|item| {
                item.as_document()
                    .ok_or_else(|| ModelError::Query(format!("`{}` expects an array of documents", operator)))
            })
            .collect(),
        _ => Err(ModelError::Query(format!("`{}` expects an array", operator))),
    }
}

fn is_operator_document(condition: &Bson) -> Option<&Document> {
    match condition {
        Bson::Document(body) if body.keys().next().is_some_and(|key| key.starts_with('$')) => Some(body),
        _ => None,
    }
}

fn matches_field(values: &[&Bson], condition: &Bson) -> ModelResult<bool> {
    let Some(operators) = is_operator_document(condition) else {
        return Ok(equals_any(values, condition));
    };

    for (operator, operand) in operators {
        let satisfied = match operator.as_str() {
            "$eq" => equals_any(values, operand),
            "$ne" => !equals_any(values, operand),
            "$gt" => compare_any(values, operand, |ordering| ordering == Ordering::Greater),
            "$gte" => compare_any(values, operand, |ordering| ordering != Ordering::Less),
            "$lt" => compare_any(values, operand, |ordering| ordering == Ordering::Less),
            "$lte" => compare_any(values, operand, |ordering| ordering != Ordering::Greater),
            "$in" => in_any(values, operator, operand)?,
            "$nin" => !in_any(values, operator, operand)?,
            "$exists" => truthy(operand) == !values.is_empty(),
            "$regex" => {
                let options = match operators.get("$options") {
                    Some(Bson::String(options)) => options.as_str(),
                    _ => "",
                };
                regex_any(values, operand, options)?
            }
            "$options" => true,
            "$not" => !matches_field(values, operand)?,
            "$size" => {
                let expected = as_u64(operand)
                    .ok_or_else(|| ModelError::Query("`$size` expects a non-negative number".into()))?;
                values.iter().any(|value| match value {
                    Bson::Array(items) => items.len() as u64 == expected,
                    _ => false,
                })
            }
            other => return Err(ModelError::Query(format!("unsupported field operator `{}`", other))),
        };

        if !satisfied {
            return Ok(false);
        }
    }

    Ok(true)
}

/// Candidate values a predicate is tested against: each value, and each element of
/// an array value.
fn candidates<'a>(values: &[&'a Bson]) -> Vec<&'a Bson> {
    let mut out = Vec::with_capacity(values.len());
    for value in values {
        out.push(*value);
        if let Bson::Array(items) = value {
            out.extend(items.iter());
        }
    }
    out
}

fn equals_any(values: &[&Bson], target: &Bson) -> bool {
    if matches!(target, Bson::Null) && values.is_empty() {
        return true;
    }

    let target = Comparable::from(target);
    candidates(values)
        .into_iter()
        .any(|value| Comparable::from(value) == target)
}

fn compare_any(values: &[&Bson], operand: &Bson, accept: impl Fn(Ordering) -> bool) -> bool {
    let operand = Comparable::from(operand);
    candidates(values).into_iter().any(|value| {
        Comparable::from(value)
            .partial_cmp(&operand)
            .is_some_and(&accept)
    })
}

fn in_any(values: &[&Bson], operator: &str, operand: &Bson) -> ModelResult<bool> {
    match operand {
        Bson::Array(items) => Ok(items.iter().any(|item| equals_any(values, item))),
        _ => Err(ModelError::Query(format!("`{}` expects an array", operator))),
    }
}

fn regex_any(values: &[&Bson], pattern: &Bson, options: &str) -> ModelResult<bool> {
    let Bson::String(pattern) = pattern else {
        return Err(ModelError::Query("`$regex` expects a string pattern".into()));
    };

    let regex = RegexBuilder::new(pattern)
        .case_insensitive(options.contains('i'))
        .multi_line(options.contains('m'))
        .dot_matches_new_line(options.contains('s'))
        .ignore_whitespace(options.contains('x'))
        .build()
        .map_err(|err| ModelError::Query(format!("invalid regular expression: {}", err)))?;

    Ok(candidates(values)
        .into_iter()
        .any(|value| matches!(value, Bson::String(text) if regex.is_match(text))))
}

fn truthy(value: &Bson) -> bool {
    match value {
        Bson::Boolean(flag) => *flag,
        Bson::Null => false,
        Bson::Int32(n) => *n != 0,
        Bson::Int64(n) => *n != 0,
        Bson::Double(n) => *n != 0.0,
        _ => true,
    }
}

/// Reads a non-negative integer from any numeric BSON value.
pub(crate) fn as_u64(value: &Bson) -> Option<u64> {
    match value {
        Bson::Int32(n) => u64::try_from(*n).ok(),
        Bson::Int64(n) => u64::try_from(*n).ok(),
        Bson::Double(n) if *n >= 0.0 && n.fract() == 0.0 => Some(*n as u64),
        _ => None,
    }
}

/// Sets `value` at a dotted `path`, creating intermediate documents.
pub(crate) fn set_path(document: &mut Document, path: &str, value: Bson) -> ModelResult<()> {
    match path.split_once('.') {
        None => {
            document.insert(path, value);
            Ok(())
        }
        Some((head, rest)) => {
            if !document.contains_key(head) {
                document.insert(head, Document::new());
            }
            match document.get_mut(head) {
                Some(Bson::Document(inner)) => set_path(inner, rest, value),
                _ => Err(ModelError::Query(format!("cannot traverse non-document field `{}`", head))),
            }
        }
    }
}

/// Removes the value at a dotted `path`, returning it.
pub(crate) fn remove_path(document: &mut Document, path: &str) -> Option<Bson> {
    match path.split_once('.') {
        None => document.remove(path),
        Some((head, rest)) => match document.get_mut(head) {
            Some(Bson::Document(inner)) => remove_path(inner, rest),
            _ => None,
        },
    }
}

fn get_path_mut<'a>(document: &'a mut Document, path: &str) -> Option<&'a mut Bson> {
    match path.split_once('.') {
        None => document.get_mut(path),
        Some((head, rest)) => match document.get_mut(head) {
            Some(Bson::Document(inner)) => get_path_mut(inner, rest),
            _ => None,
        },
    }
}

/// Returns `true` if the update document consists only of operators.
pub(crate) fn is_update_document(update: &Document) -> bool {
    !update.is_empty() && update.keys().all(|key| key.starts_with('$'))
}

/// Applies an operator update document in place.
///
/// `$setOnInsert` is honoured only when `inserting` is set.
///
/// # Errors
///
/// Returns [`ModelError::Query`] for unknown operators or operands of the wrong type.
pub(crate) fn apply_update(document: &mut Document, update: &Document, inserting: bool) -> ModelResult<()> {
    if !is_update_document(update) {
        return Err(ModelError::Query("update document must only contain operators".into()));
    }

    for (operator, fields) in update {
        let Bson::Document(fields) = fields else {
            return Err(ModelError::Query(format!("`{}` expects a document", operator)));
        };

        match operator.as_str() {
            "$set" => {
                for (path, value) in fields {
                    set_path(document, path, value.clone())?;
                }
            }
            "$setOnInsert" => {
                if inserting {
                    for (path, value) in fields {
                        set_path(document, path, value.clone())?;
                    }
                }
            }
            "$unset" => {
                for path in fields.keys() {
                    remove_path(document, path);
                }
            }
            "$inc" => {
                for (path, amount) in fields {
                    let incremented = match get_path_mut(document, path) {
                        None => amount.clone(),
                        Some(current) => add(current, amount)
                            .ok_or_else(|| ModelError::Query(format!("cannot increment non-numeric field `{}`", path)))?,
                    };
                    set_path(document, path, incremented)?;
                }
            }
            "$push" => {
                for (path, value) in fields {
                    let items: Vec<Bson> = match value {
                        Bson::Document(modifier) if modifier.contains_key("$each") => match modifier.get("$each") {
                            Some(Bson::Array(each)) => each.clone(),
                            _ => return Err(ModelError::Query("`$each` expects an array".into())),
                        },
                        single => vec![single.clone()],
                    };
                    match get_path_mut(document, path) {
                        None => set_path(document, path, Bson::Array(items))?,
                        Some(Bson::Array(existing)) => existing.extend(items),
                        Some(_) => return Err(ModelError::Query(format!("cannot push to non-array field `{}`", path))),
                    }
                }
            }
            other => return Err(ModelError::Query(format!("unsupported update operator `{}`", other))),
        }
    }

    Ok(())
}

fn add(current: &Bson, amount: &Bson) -> Option<Bson> {
    Some(match (current, amount) {
        (Bson::Int32(a), Bson::Int32(b)) => match a.checked_add(*b) {
            Some(sum) => Bson::Int32(sum),
            None => Bson::Int64(i64::from(*a) + i64::from(*b)),
        },
        (Bson::Int32(a), Bson::Int64(b)) => Bson::Int64(i64::from(*a).checked_add(*b)?),
        (Bson::Int64(a), Bson::Int32(b)) => Bson::Int64(a.checked_add(i64::from(*b))?),
        (Bson::Int64(a), Bson::Int64(b)) => Bson::Int64(a.checked_add(*b)?),
        (a, b) => Bson::Double(as_f64(a)? + as_f64(b)?),
    })
}

fn as_f64(value: &Bson) -> Option<f64> {
    match value {
        Bson::Int32(n) => Some(f64::from(*n)),
        Bson::Int64(n) => Some(*n as f64),
        Bson::Double(n) => Some(*n),
        _ => None,
    }
}

/// Builds the document an upsert starts from: the equality predicates of `filter`.
pub(crate) fn upsert_seed(filter: &Document) -> ModelResult<Document> {
    let mut seed = Document::new();
    for (key, condition) in filter {
        if key.starts_with('$') {
            continue;
        }
        match is_operator_document(condition) {
            None => set_path(&mut seed, key, condition.clone())?,
            Some(operators) => {
                if let Some(value) = operators.get("$eq") {
                    set_path(&mut seed, key, value.clone())?;
                }
            }
        }
    }
    Ok(seed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;
    use rstest::rstest;

    fn user() -> Document {
        doc! {
            "name": "ann",
            "age": 30,
            "score": 4.5,
            "tags": ["admin", "ops"],
            "address": { "city": "Oslo", "zip": "0150" },
            "pets": [{ "kind": "cat" }, { "kind": "dog" }],
            "deletedAt": Bson::Null,
        }
    }

    #[rstest]
    #[case(doc! { "name": "ann" }, true)]
    #[case(doc! { "age": { "$gte": 30, "$lt": 31 } }, true)]
    #[case(doc! { "age": { "$gt": 30 } }, false)]
    #[case(doc! { "age": 30_i64 }, true)]
    #[case(doc! { "score": { "$lte": 5 } }, true)]
    #[case(doc! { "tags": "ops" }, true)]
    #[case(doc! { "tags": { "$in": ["guest", "admin"] } }, true)]
    #[case(doc! { "tags": { "$nin": ["admin"] } }, false)]
    #[case(doc! { "address.city": "Oslo" }, true)]
    #[case(doc! { "pets.kind": "dog" }, true)]
    #[case(doc! { "pets.1.kind": "cat" }, false)]
    #[case(doc! { "missing": { "$exists": false } }, true)]
    #[case(doc! { "name": { "$exists": true } }, true)]
    #[case(doc! { "missing": Bson::Null }, true)]
    #[case(doc! { "deletedAt": Bson::Null }, true)]
    #[case(doc! { "name": { "$regex": "^A", "$options": "i" } }, true)]
    #[case(doc! { "name": { "$regex": "^A" } }, false)]
    #[case(doc! { "name": { "$not": { "$eq": "bob" } } }, true)]
    #[case(doc! { "tags": { "$size": 2 } }, true)]
    #[case(doc! { "$or": [{ "name": "bob" }, { "age": 30 }] }, true)]
    #[case(doc! { "$and": [{ "name": "ann" }, { "age": 31 }] }, false)]
    #[case(doc! { "$nor": [{ "name": "bob" }] }, true)]
    #[case(doc! { "name": { "$ne": "ann" } }, false)]
    fn test_matches(#[case] filter: Document, #[case] expected: bool) {
        assert_eq!(matches(&user(), &filter).unwrap(), expected);
    }

    #[test]
    fn test_unknown_operator_is_rejected() {
        let err = matches(&user(), &doc! { "age": { "$near": 1 } }).unwrap_err();
        assert!(matches!(err, ModelError::Query(_)));

        let err = matches(&user(), &doc! { "$where": "true" }).unwrap_err();
        assert!(matches!(err, ModelError::Query(_)));
    }

    #[test]
    fn test_cross_type_comparison_is_false() {
        assert!(!matches(&user(), &doc! { "name": { "$gt": 1 } }).unwrap());
    }

    #[test]
    fn test_apply_update_operators() {
        let mut document = user();
        apply_update(
            &mut document,
            &doc! {
                "$set": { "address.city": "Bergen", "active": true },
                "$unset": { "score": "" },
                "$inc": { "age": 1, "visits": 2 },
                "$push": { "tags": { "$each": ["dev"] } },
            },
            false,
        )
        .unwrap();

        assert_eq!(value_at(&document, "address.city"), Some(&Bson::String("Bergen".into())));
        assert_eq!(document.get("active"), Some(&Bson::Boolean(true)));
        assert!(!document.contains_key("score"));
        assert_eq!(document.get("age"), Some(&Bson::Int32(31)));
        assert_eq!(document.get("visits"), Some(&Bson::Int32(2)));
        assert_eq!(document.get_array("tags").unwrap().len(), 3);
    }

    #[test]
    fn test_set_on_insert_only_when_inserting() {
        let mut document = doc! { "a": 1 };
        apply_update(&mut document, &doc! { "$setOnInsert": { "b": 2 } }, false).unwrap();
        assert!(!document.contains_key("b"));

        apply_update(&mut document, &doc! { "$setOnInsert": { "b": 2 } }, true).unwrap();
        assert_eq!(document.get("b"), Some(&Bson::Int32(2)));
    }

    #[test]
    fn test_operatorless_update_is_rejected() {
        let err = apply_update(&mut user(), &doc! { "name": "bob" }, false).unwrap_err();
        assert!(matches!(err, ModelError::Query(_)));
    }

    #[test]
    fn test_upsert_seed_keeps_equalities() {
        let seed = upsert_seed(&doc! {
            "email": "a@b.c",
            "age": { "$gt": 3 },
            "role": { "$eq": "admin" },
            "$or": [{ "x": 1 }],
        })
        .unwrap();

        assert_eq!(seed, doc! { "email": "a@b.c", "role": "admin" });
    }

    #[test]
    fn test_sort_order_ranks_types() {
        let null = Bson::Null;
        let number = Bson::Int32(5);
        let text = Bson::String("a".into());

        assert_eq!(Comparable::from(&null).sort_cmp(&Comparable::from(&number)), Ordering::Less);
        assert_eq!(Comparable::from(&text).sort_cmp(&Comparable::from(&number)), Ordering::Greater);
    }
}
