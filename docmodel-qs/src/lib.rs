//! Query-string filters for docmodel.
//!
//! Turns URL query strings such as
//!
//! ```text
//! filter[age]=and(gte(18),lt(65))&filter[author.name]=reg(/^ann/i)&include=author&sort[age]=desc&page=2&limit=20
//! ```
//!
//! into a [`ParsedQuery`] that can be applied to any [`Model`] handle.
//!
//! # Grammar
//!
//! | Parameter | Meaning |
//! |-----------|---------|
//! | `filter[field]=op(value)` | One predicate, `op` is one of `eq ne gt gte lt lte in nin reg exists` |
//! | `filter[field]=value` | Shorthand for `eq(value)` |
//! | `filter[field]=and(op(..),op(..))` | Every predicate must hold |
//! | `filter[field]=or(op(..),op(..))` | At least one predicate must hold |
//! | `sort[field]=asc` (or `desc`, `1`, `-1`) | Sort key |
//! | `sort=field,-field` | Sort keys, `-` for descending |
//! | `include=a,b` | Reference fields to populate |
//! | `select=a,-b` | Projection |
//! | `page=N`, `limit=N` | Pagination |
//!
//! Operands are coerced to `true`/`false`, `null`, integers, floats, RFC 3339 timestamps
//! (or bare `YYYY-MM-DD` dates) and 24-digit hex object ids. Quote an operand (`eq('42')`)
//! to keep it a string. `reg` accepts either a bare pattern or `/pattern/flags`.
//!
//! Filters on a dotted path whose head is listed in `include` are *secondary*: they run
//! after the referenced documents have been joined. Every other filter is *primary*.
//!
//! # Example
//!
//! ```
//! use docmodel_qs::ParsedQuery;
//!
//! let query = ParsedQuery::parse("filter[age]=gte(18)&sort=-age&limit=5").unwrap();
//!
//! assert_eq!(query.limit, Some(5));
//! assert_eq!(query.primary.get_document("age").unwrap().get_i64("$gte").unwrap(), 18);
//! ```

use std::collections::HashSet;
use std::str::FromStr;

use bson::{Bson, Document, doc, oid::ObjectId};
use chrono::{NaiveDate, Utc};
use docmodel_core::entity::Entity;
use docmodel_core::error::{ModelError, ModelResult};
use docmodel_core::model::Model;
use docmodel_core::pipeline::{FilterOp, SortOrder};
use percent_encoding::percent_decode_str;

/// Page size used when `page` is given without `limit`.
pub const DEFAULT_LIMIT: u64 = 10;

/// The parsed form of a query string.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedQuery {
    /// Predicates on the entity's own fields, applied before any join.
    pub primary: Document,
    /// Predicates on populated references, applied after the joins.
    pub secondary: Document,
    /// Sort keys in the order they were given.
    pub sort: Vec<(String, SortOrder)>,
    /// Reference fields to populate.
    pub include: Vec<String>,
    /// Projection, `1` to keep a field and `0` to drop it.
    pub select: Document,
    pub page: Option<u64>,
    pub limit: Option<u64>,
}

impl ParsedQuery {
    /// Parses a raw, percent-encoded query string. A leading `?` is ignored.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::Query`] for an unknown operator, unbalanced parentheses,
    /// an invalid field name, sort direction or page number.
    pub fn parse(query: &str) -> ModelResult<Self> {
        let query = query.strip_prefix('?').unwrap_or(query);
        let pairs = query
            .split('&')
            .filter(|pair| !pair.is_empty())
            .map(|pair| {
                let mut parts = pair.splitn(2, '=');
                let key = parts.next().unwrap_or_default();
                let value = parts.next().unwrap_or_default();
                (decode(key), decode(value))
            });

        Self::from_pairs(pairs)
    }

    /// Builds a query from already decoded key/value pairs, e.g. the query map a web
    /// framework hands out. Unrecognized keys are ignored.
    ///
    /// # Errors
    ///
    /// Same as [`ParsedQuery::parse`].
    pub fn from_pairs<I, K, V>(pairs: I) -> ModelResult<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut parsed = ParsedQuery::default();
        let mut filters: Vec<(String, Document)> = Vec::new();

        for (key, value) in pairs {
            let (key, value) = (key.as_ref().trim(), value.as_ref().trim());

            if let Some(field) = bracketed(key, "filter") {
                let field = field_name(field)?;
                let filter = parse_expr(value)?.into_filter(field);
                filters.push((field.to_string(), filter));
            } else if let Some(field) = bracketed(key, "sort") {
                parsed.push_sort(field_name(field)?, value.parse()?);
            } else {
                match key {
                    "sort" => {
                        for item in list(value) {
                            match item.strip_prefix('-') {
                                Some(field) => parsed.push_sort(field_name(field)?, SortOrder::Desc),
                                None => parsed.push_sort(field_name(item)?, SortOrder::Asc),
                            }
                        }
                    }
                    "include" => {
                        for item in list(value) {
                            let path = field_name(item)?;
                            if !parsed.include.iter().any(|existing| existing == path) {
                                parsed.include.push(path.to_string());
                            }
                        }
                    }
                    "select" => {
                        for item in list(value) {
                            match item.strip_prefix('-') {
                                Some(field) => parsed.select.insert(field_name(field)?, 0),
                                None => parsed.select.insert(field_name(item)?, 1),
                            };
                        }
                    }
                    "page" => parsed.page = Some(number(key, value)?),
                    "limit" => parsed.limit = Some(number(key, value)?),
                    _ => tracing::debug!(key = %key, "query parameter ignored"),
                }
            }
        }

        let (secondary, primary): (Vec<_>, Vec<_>) = filters
            .into_iter()
            .partition(|(field, _)| parsed.is_secondary(field));
        parsed.primary = combine(primary.into_iter().map(|(_, filter)| filter).collect());
        parsed.secondary = combine(secondary.into_iter().map(|(_, filter)| filter).collect());

        Ok(parsed)
    }

    /// Returns `true` when nothing was parsed.
    pub fn is_empty(&self) -> bool {
        *self == ParsedQuery::default()
    }

    /// Applies this query to `model` and returns the derived handle.
    ///
    /// Primary filters go in front of the joins requested by `include`, secondary
    /// filters after them. `page` switches the handle to paginated reads, `limit`
    /// alone caps the result.
    pub fn apply<E: Entity>(&self, model: &Model<E>) -> Model<E> {
        let mut next = model.clone();

        if !self.primary.is_empty() {
            next = next.matching(self.primary.clone());
        }
        for path in &self.include {
            next = next.populate(path);
        }
        if !self.secondary.is_empty() {
            next = next.matching(self.secondary.clone());
        }
        for (field, order) in &self.sort {
            next = next.sort(field, *order);
        }
        if !self.select.is_empty() {
            next = next.project(&self.select);
        }

        match (self.page, self.limit) {
            (Some(page), limit) => next.paginate(page, limit.unwrap_or(DEFAULT_LIMIT)),
            (None, Some(limit)) => next.limit(limit),
            (None, None) => next,
        }
    }

    fn push_sort(&mut self, field: &str, order: SortOrder) {
        match self.sort.iter_mut().find(|(existing, _)| existing == field) {
            Some(entry) => entry.1 = order,
            None => self.sort.push((field.to_string(), order)),
        }
    }

    fn is_secondary(&self, field: &str) -> bool {
        field
            .split_once('.')
            .is_some_and(|(head, _)| self.include.iter().any(|path| path == head))
    }
}

impl FromStr for ParsedQuery {
    type Err = ModelError;

    fn from_str(s: &str) -> ModelResult<Self> {
        Self::parse(s)
    }
}

/// Coerces one operand to the BSON value it denotes.
///
/// Quoted operands always stay strings.
pub fn coerce(raw: &str) -> Bson {
    let raw = raw.trim();
    if let Some(text) = unquote(raw) {
        return Bson::String(text.to_string());
    }

    match raw {
        "true" => return Bson::Boolean(true),
        "false" => return Bson::Boolean(false),
        "null" => return Bson::Null,
        _ => {}
    }

    if raw.len() == 24 && raw.bytes().all(|b| b.is_ascii_hexdigit()) {
        if let Ok(id) = ObjectId::parse_str(raw) {
            return Bson::ObjectId(id);
        }
    }

    if looks_numeric(raw) {
        if let Ok(n) = raw.parse::<i64>() {
            return Bson::Int64(n);
        }
        if let Ok(x) = raw.parse::<f64>() {
            return Bson::Double(x);
        }
    }

    if let Ok(at) = chrono::DateTime::parse_from_rfc3339(raw) {
        return Bson::DateTime(bson::DateTime::from_chrono(at.with_timezone(&Utc)));
    }
    if let Some(midnight) = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|day| day.and_hms_opt(0, 0, 0))
    {
        return Bson::DateTime(bson::DateTime::from_chrono(midnight.and_utc()));
    }

    Bson::String(raw.to_string())
}

#[derive(Debug, Clone, PartialEq)]
struct Condition {
    op: FilterOp,
    value: Bson,
    options: Option<String>,
}

impl Condition {
    fn new(op: FilterOp, value: Bson) -> Self {
        Self { op, value, options: None }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Cond(Condition),
    And(Vec<Expr>),
    Or(Vec<Expr>),
}

impl Expr {
    fn into_filter(self, field: &str) -> Document {
        match self {
            Expr::Cond(condition) => {
                let mut body = Document::new();
                body.insert(condition.op.operator(), condition.value);
                if let Some(options) = condition.options {
                    body.insert("$options", options);
                }
                let mut filter = Document::new();
                filter.insert(field, body);
                filter
            }
            Expr::And(items) => doc! {
                "$and": items.into_iter().map(|item| item.into_filter(field)).collect::<Vec<_>>(),
            },
            Expr::Or(items) => doc! {
                "$or": items.into_iter().map(|item| item.into_filter(field)).collect::<Vec<_>>(),
            },
        }
    }
}

fn parse_expr(input: &str) -> ModelResult<Expr> {
    let input = input.trim();
    let Some((name, args)) = call(input)? else {
        return Ok(Expr::Cond(Condition::new(FilterOp::Eq, coerce(input))));
    };

    match name {
        "and" | "or" => {
            let items = split_args(args)?
                .into_iter()
                .map(parse_expr)
                .collect::<ModelResult<Vec<_>>>()?;
            if items.is_empty() {
                return Err(ModelError::Query(format!("`{}` needs at least one operand", name)));
            }
            Ok(if name == "and" { Expr::And(items) } else { Expr::Or(items) })
        }
        op => Ok(Expr::Cond(condition(op.parse()?, args)?)),
    }
}

fn condition(op: FilterOp, args: &str) -> ModelResult<Condition> {
    let args = args.trim();
    Ok(match op {
        FilterOp::In | FilterOp::Nin => {
            let values = split_args(args)?.into_iter().map(coerce).collect();
            Condition::new(op, Bson::Array(values))
        }
        FilterOp::Regex => regex_condition(args),
        FilterOp::Exists => {
            let flag = match coerce(args) {
                _ if args.is_empty() => true,
                Bson::Boolean(flag) => flag,
                Bson::Int64(n) => n != 0,
                other => {
                    return Err(ModelError::Query(format!("`exists` expects a boolean, got `{}`", other)));
                }
            };
            Condition::new(op, Bson::Boolean(flag))
        }
        _ => Condition::new(op, coerce(args)),
    })
}

fn regex_condition(args: &str) -> Condition {
    let pattern = unquote(args).unwrap_or(args);
    if let Some((body, flags)) = pattern.strip_prefix('/').and_then(|rest| rest.rsplit_once('/')) {
        if flags.chars().all(|c| matches!(c, 'i' | 'm' | 's' | 'x')) {
            return Condition {
                op: FilterOp::Regex,
                value: Bson::String(body.to_string()),
                options: (!flags.is_empty()).then(|| flags.to_string()),
            };
        }
    }
    Condition::new(FilterOp::Regex, Bson::String(pattern.to_string()))
}

/// Splits `name(args)` when `name` is purely alphabetic.
fn call(input: &str) -> ModelResult<Option<(&str, &str)>> {
    let Some(open) = input.find('(') else {
        return Ok(None);
    };
    let name = &input[..open];
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphabetic()) {
        return Ok(None);
    }
    match input[open + 1..].strip_suffix(')') {
        Some(args) => Ok(Some((name, args))),
        None => Err(ModelError::Query(format!("unbalanced expression `{}`", input))),
    }
}

/// Splits on commas outside parentheses and quotes.
fn split_args(input: &str) -> ModelResult<Vec<&str>> {
    let unbalanced = || ModelError::Query(format!("unbalanced expression `{}`", input));

    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut start = 0;

    for (i, c) in input.char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"') => quote = Some(c),
            (None, '(') => depth += 1,
            (None, ')') => depth = depth.checked_sub(1).ok_or_else(unbalanced)?,
            (None, ',') if depth == 0 => {
                parts.push(input[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    if depth != 0 || quote.is_some() {
        return Err(unbalanced());
    }

    let last = input[start..].trim();
    if !last.is_empty() || !parts.is_empty() {
        parts.push(last);
    }
    Ok(parts)
}

fn combine(clauses: Vec<Document>) -> Document {
    let mut seen = HashSet::new();
    let disjoint = clauses
        .iter()
        .flat_map(|clause| clause.keys())
        .all(|key| seen.insert(key.as_str()));

    if !disjoint {
        return doc! { "$and": clauses };
    }

    let mut merged = Document::new();
    for clause in clauses {
        for (key, value) in clause {
            merged.insert(key, value);
        }
    }
    merged
}

fn bracketed<'a>(key: &'a str, prefix: &str) -> Option<&'a str> {
    key.strip_prefix(prefix)?.strip_prefix('[')?.strip_suffix(']')
}

fn field_name(raw: &str) -> ModelResult<&str> {
    let field = raw.trim();
    let valid = !field.is_empty()
        && !field.starts_with('$')
        && field.split('.').all(|segment| !segment.is_empty());
    if valid {
        Ok(field)
    } else {
        Err(ModelError::Query(format!("invalid field name `{}`", raw)))
    }
}

fn list(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|item| !item.is_empty())
}

fn number(key: &str, value: &str) -> ModelResult<u64> {
    value
        .parse()
        .map_err(|_| ModelError::Query(format!("`{}` must be a non-negative integer, got `{}`", key, value)))
}

fn unquote(raw: &str) -> Option<&str> {
    ['\'', '"']
        .into_iter()
        .find_map(|q| raw.strip_prefix(q)?.strip_suffix(q))
}

fn looks_numeric(raw: &str) -> bool {
    let digits = raw.strip_prefix(['-', '+']).unwrap_or(raw);
    digits.starts_with(|c: char| c.is_ascii_digit())
        && digits
            .chars()
            .all(|c| c.is_ascii_digit() || matches!(c, '.' | 'e' | 'E' | '-' | '+'))
}

fn decode(component: &str) -> String {
    let component = component.replace('+', " ");
    percent_decode_str(&component).decode_utf8_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use docmodel_core::context::ModelContext;
    use docmodel_core::pipeline::stage_name;
    use docmodel_core::schema::{FieldDef, Schema, SchemaBuilder};
    use rstest::rstest;
    use serde::{Deserialize, Serialize};

    #[rstest]
    #[case("true", Bson::Boolean(true))]
    #[case("false", Bson::Boolean(false))]
    #[case("null", Bson::Null)]
    #[case("42", Bson::Int64(42))]
    #[case("-7", Bson::Int64(-7))]
    #[case("2.5", Bson::Double(2.5))]
    #[case("'42'", Bson::String("42".to_string()))]
    #[case("\"true\"", Bson::String("true".to_string()))]
    #[case("ann", Bson::String("ann".to_string()))]
    #[case("v1.2", Bson::String("v1.2".to_string()))]
    fn test_coerce_scalars(#[case] raw: &str, #[case] expected: Bson) {
        assert_eq!(coerce(raw), expected);
    }

    #[test]
    fn test_coerce_object_id() {
        let id = ObjectId::new();
        assert_eq!(coerce(&id.to_hex()), Bson::ObjectId(id));
    }

    #[test]
    fn test_coerce_dates() {
        let Bson::DateTime(at) = coerce("2024-03-01T12:00:00Z") else {
            panic!("expected a date");
        };
        assert_eq!(at.timestamp_millis(), 1_709_294_400_000);

        let Bson::DateTime(day) = coerce("2024-03-01") else {
            panic!("expected a date");
        };
        assert_eq!(day.timestamp_millis(), 1_709_251_200_000);
    }

    #[rstest]
    #[case("filter[name]=ann", doc! { "name": { "$eq": "ann" } })]
    #[case("filter[age]=gte(18)", doc! { "age": { "$gte": 18_i64 } })]
    #[case("filter[age]=ne(null)", doc! { "age": { "$ne": Bson::Null } })]
    #[case("filter[tags]=in(a,b,'3')", doc! { "tags": { "$in": ["a", "b", "3"] } })]
    #[case("filter[tags]=nin()", doc! { "tags": { "$nin": [] } })]
    #[case("filter[email]=exists()", doc! { "email": { "$exists": true } })]
    #[case("filter[email]=exists(false)", doc! { "email": { "$exists": false } })]
    #[case("filter[name]=reg(^an)", doc! { "name": { "$regex": "^an" } })]
    #[case("filter[name]=reg(/^an/i)", doc! { "name": { "$regex": "^an", "$options": "i" } })]
    #[case("filter%5Bname%5D=Ann%20Lee", doc! { "name": { "$eq": "Ann Lee" } })]
    #[case("filter[name]=Ann+Lee", doc! { "name": { "$eq": "Ann Lee" } })]
    fn test_single_filters(#[case] query: &str, #[case] expected: Document) {
        let parsed = ParsedQuery::parse(query).unwrap();
        assert_eq!(parsed.primary, expected);
        assert!(parsed.secondary.is_empty());
    }

    #[test]
    fn test_combinators() {
        let parsed = ParsedQuery::parse("filter[age]=and(gte(18),lt(65))").unwrap();
        assert_eq!(
            parsed.primary,
            doc! { "$and": [{ "age": { "$gte": 18_i64 } }, { "age": { "$lt": 65_i64 } }] }
        );

        let parsed = ParsedQuery::parse("filter[status]=or(eq(active),and(eq(pending),exists()))").unwrap();
        assert_eq!(
            parsed.primary,
            doc! { "$or": [
                { "status": { "$eq": "active" } },
                { "$and": [{ "status": { "$eq": "pending" } }, { "status": { "$exists": true } }] },
            ] }
        );
    }

    #[test]
    fn test_distinct_fields_merge_into_one_filter() {
        let parsed = ParsedQuery::parse("filter[name]=ann&filter[age]=gt(3)").unwrap();
        assert_eq!(
            parsed.primary,
            doc! { "name": { "$eq": "ann" }, "age": { "$gt": 3_i64 } }
        );
    }

    #[test]
    fn test_repeated_field_is_conjunctive() {
        let parsed = ParsedQuery::parse("filter[age]=gt(3)&filter[age]=lt(9)").unwrap();
        assert_eq!(
            parsed.primary,
            doc! { "$and": [{ "age": { "$gt": 3_i64 } }, { "age": { "$lt": 9_i64 } }] }
        );
    }

    #[test]
    fn test_secondary_filters_follow_includes() {
        let parsed =
            ParsedQuery::parse("filter[author.name]=ann&filter[meta.views]=gt(1)&include=author,author").unwrap();

        assert_eq!(parsed.include, vec!["author".to_string()]);
        assert_eq!(parsed.secondary, doc! { "author.name": { "$eq": "ann" } });
        assert_eq!(parsed.primary, doc! { "meta.views": { "$gt": 1_i64 } });
    }

    #[test]
    fn test_sort_select_and_paging() {
        let parsed = ParsedQuery::parse("?sort[age]=desc&sort=name,-created&sort[name]=-1&select=name,-_id&page=2&limit=5")
            .unwrap();

        assert_eq!(
            parsed.sort,
            vec![
                ("age".to_string(), SortOrder::Desc),
                ("name".to_string(), SortOrder::Desc),
                ("created".to_string(), SortOrder::Desc),
            ]
        );
        assert_eq!(parsed.select, doc! { "name": 1, "_id": 0 });
        assert_eq!(parsed.page, Some(2));
        assert_eq!(parsed.limit, Some(5));
    }

    #[test]
    fn test_unknown_keys_are_ignored() {
        let parsed = ParsedQuery::parse("utm_source=mail&&token").unwrap();
        assert!(parsed.is_empty());
    }

    #[test]
    fn test_from_pairs_takes_decoded_values() {
        let parsed = ParsedQuery::from_pairs([("filter[name]", "a+b"), ("limit", "3")]).unwrap();
        assert_eq!(parsed.primary, doc! { "name": { "$eq": "a+b" } });
        assert_eq!(parsed.limit, Some(3));
    }

    #[rstest]
    #[case("filter[age]=between(1,2)")]
    #[case("filter[age]=and(gt(1),lt(2)")]
    #[case("filter[age]=in(a,'b)")]
    #[case("filter[age]=and()")]
    #[case("filter[$where]=1")]
    #[case("filter[a..b]=1")]
    #[case("filter[]=1")]
    #[case("filter[email]=exists(maybe)")]
    #[case("sort[age]=up")]
    #[case("page=two")]
    #[case("limit=-1")]
    fn test_rejects_malformed_queries(#[case] query: &str) {
        assert!(matches!(ParsedQuery::parse(query), Err(ModelError::Query(_))));
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Author {
        name: String,
    }

    impl Entity for Author {
        fn collection_name() -> &'static str {
            "authors"
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Post {
        title: String,
    }

    impl Entity for Post {
        fn collection_name() -> &'static str {
            "posts"
        }

        fn schema() -> SchemaBuilder {
            Schema::builder()
                .field("title", FieldDef::string())
                .field("author", FieldDef::object_id().references("authors"))
        }
    }

    fn posts() -> Model<Post> {
        let ctx = ModelContext::new();
        ctx.model::<Author>().unwrap();
        ctx.model::<Post>().unwrap()
    }

    #[test]
    fn test_apply_orders_stages() {
        let parsed = ParsedQuery::parse(
            "filter[title]=hello&filter[author.name]=ann&include=author&sort[title]=asc&select=title,author",
        )
        .unwrap();
        let model = parsed.apply(&posts());
        let stages = model.pipeline().stages();

        let names: Vec<_> = stages.iter().filter_map(stage_name).collect();
        assert_eq!(names, ["$match", "$lookup", "$unwind", "$match", "$sort", "$project"]);
        assert_eq!(stages[0], doc! { "$match": { "title": { "$eq": "hello" } } });
        assert_eq!(stages[3], doc! { "$match": { "author.name": { "$eq": "ann" } } });
        assert_eq!(stages[4], doc! { "$sort": { "title": 1 } });
    }

    #[test]
    fn test_apply_limit_without_page() {
        let base = posts();
        let model = ParsedQuery::parse("limit=5").unwrap().apply(&base);

        assert_eq!(model.pipeline().stages(), &[doc! { "$limit": 5_i64 }]);
        assert!(base.pipeline().is_empty());
    }
}
