//! The per-entity query builder.
//!
//! A [`Model`] is bound to one [`Entity`] type and its registered [`Schema`]. Chain
//! methods take `&self` and return a new handle with an extended pipeline, so a handle
//! can be kept as a template and branched freely. Terminal methods (see
//! [`executor`](crate::executor)) consume the handle: per-call overrides such as
//! [`with_database`](Model::with_database) therefore apply to exactly one execution.
//!
//! # Example
//!
//! ```ignore
//! let users = ctx.model::<User>()?;
//! let adults = users.filter("age", FilterOp::Gte, 18);
//!
//! let first_page = adults.sort("name", SortOrder::Asc).paginate(1, 20).page().await?;
//! let archived = adults.with_database("archive").count().await?;
//! ```

use bson::{Bson, Document, doc};
use std::{fmt, marker::PhantomData, sync::Arc};

use crate::{
    audit,
    backend::ReturnDocument,
    context::ModelContext,
    entity::{Entity, EntityExt},
    error::{ModelError, ModelResult},
    executor::Action,
    middleware::{HookPoint, Middleware, PostContext, PostHook, PreContext, PreHook},
    page::PaginationParams,
    pipeline::{FilterOp, Lookup, Pipeline, SortOrder, parse_sort_args},
    schema::Schema,
    transaction::SessionRef,
    trigger::{self, ChangeEvent, EventKind, Trigger, TriggerOptions, TriggerSignal},
};

/// Field set on soft-deleted documents.
pub const DELETED_AT: &str = "deletedAt";
pub const CREATED_AT: &str = "createdAt";
pub const UPDATED_AT: &str = "updatedAt";

/// Overrides applied to the next execution only.
#[derive(Debug, Clone, Default)]
pub(crate) struct Overrides {
    pub(crate) connection: Option<String>,
    pub(crate) database: Option<String>,
    pub(crate) collection: Option<String>,
    pub(crate) actor: Option<String>,
    pub(crate) session: Option<SessionRef>,
}

/// Options shared by the write actions.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct WriteOptions {
    pub(crate) upsert: bool,
    pub(crate) return_document: ReturnDocument,
}

/// Settings for [`Model::populate_with`].
#[derive(Debug, Clone, Default)]
pub struct Populate {
    /// Projection applied to the joined documents, e.g. `{"name": 1}`.
    pub select: Option<Document>,
    /// Stages run on the joined documents. Takes precedence over `select`.
    pub pipeline: Option<Vec<Document>>,
}

impl Populate {
    pub fn select(projection: Document) -> Self {
        Self {
            select: Some(projection),
            pipeline: None,
        }
    }

    pub fn pipeline(stages: Vec<Document>) -> Self {
        Self {
            select: None,
            pipeline: Some(stages),
        }
    }
}

/// Query builder and executor for one entity type.
pub struct Model<E: Entity> {
    pub(crate) ctx: ModelContext,
    pub(crate) schema: Arc<Schema>,
    pub(crate) pipeline: Pipeline,
    pub(crate) action: Option<Action>,
    pub(crate) write: WriteOptions,
    pub(crate) overrides: Overrides,
    pub(crate) middleware: Arc<Middleware>,
    pub(crate) triggers: TriggerSignal,
    pub(crate) or_fail: Option<String>,
    pub(crate) with_deleted: bool,
    pub(crate) deferred: Option<ModelError>,
    _entity: PhantomData<fn() -> E>,
}

impl<E: Entity> Clone for Model<E> {
    fn clone(&self) -> Self {
        Self {
            ctx: self.ctx.clone(),
            schema: self.schema.clone(),
            pipeline: self.pipeline.clone(),
            action: self.action.clone(),
            write: self.write,
            overrides: self.overrides.clone(),
            middleware: self.middleware.clone(),
            triggers: self.triggers.clone(),
            or_fail: self.or_fail.clone(),
            with_deleted: self.with_deleted,
            deferred: self.deferred.clone(),
            _entity: PhantomData,
        }
    }
}

impl<E: Entity> fmt::Debug for Model<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Model")
            .field("entity", &E::model_name())
            .field("collection", &self.schema.collection())
            .field("pipeline", &self.pipeline)
            .field("action", &self.action)
            .field("overrides", &self.overrides)
            .finish_non_exhaustive()
    }
}

impl<E: Entity> Model<E> {
    /// Creates a handle for `E`, registering its schema under [`Entity::model_name`]
    /// unless a schema with that name already exists.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::Configuration`] if the declared schema is invalid.
    pub fn new(ctx: ModelContext) -> ModelResult<Self> {
        let schema = ctx.catalog().register_with(E::model_name(), || {
            let builder = E::schema();
            if builder.has_collection() {
                builder.build()
            } else {
                builder.collection(E::collection_name()).build()
            }
        })?;

        let mut middleware = Middleware::new();
        if schema.options().audit {
            audit::install(&mut middleware, ctx.audit_collection());
        }

        Ok(Self {
            ctx,
            schema,
            pipeline: Pipeline::new(),
            action: None,
            write: WriteOptions::default(),
            overrides: Overrides::default(),
            middleware: Arc::new(middleware),
            triggers: TriggerSignal::new(),
            or_fail: None,
            with_deleted: false,
            deferred: None,
            _entity: PhantomData,
        })
    }

    pub fn context(&self) -> &ModelContext {
        &self.ctx
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// The accumulated pipeline, before execution-time scoping.
    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    fn derive(&self, f: impl FnOnce(&mut Self)) -> Self {
        let mut next = self.clone();
        f(&mut next);
        next
    }

    fn defer(&mut self, err: ModelError) {
        if self.deferred.is_none() {
            self.deferred = Some(err);
        }
    }

    /// Adds `{field: {op: value}}` to the match stage.
    pub fn filter(&self, field: &str, op: FilterOp, value: impl Into<Bson>) -> Self {
        let value = value.into();
        self.derive(|next| next.pipeline.add_filter(field, op, value))
    }

    /// Shorthand for an equality filter.
    pub fn where_eq(&self, field: &str, value: impl Into<Bson>) -> Self {
        self.filter(field, FilterOp::Eq, value)
    }

    /// Makes the next filter disjunctive with every filter already present.
    pub fn or(&self) -> Self {
        self.derive(|next| next.pipeline.or())
    }

    /// Appends a separate `$match` stage, evaluated after any preceding join.
    pub fn matching(&self, filter: Document) -> Self {
        self.derive(|next| next.pipeline.push_match(filter))
    }

    /// Appends an arbitrary stage.
    pub fn stage(&self, stage: Document) -> Self {
        self.derive(|next| next.pipeline.push(stage))
    }

    pub fn sort(&self, field: &str, order: SortOrder) -> Self {
        self.derive(|next| next.pipeline.sort(field, order))
    }

    /// Sorts by a flat `field, direction, ...` list, e.g. `["name", "asc", "age", "-1"]`.
    ///
    /// An invalid list is reported by the terminal call.
    pub fn sort_by<S: AsRef<str>>(&self, args: &[S]) -> Self {
        self.derive(|next| match parse_sort_args(args) {
            Ok(pairs) => {
                for (field, order) in pairs {
                    next.pipeline.sort(&field, order);
                }
            }
            Err(err) => next.defer(err),
        })
    }

    pub fn skip(&self, n: u64) -> Self {
        self.derive(|next| next.pipeline.skip(n))
    }

    pub fn limit(&self, n: u64) -> Self {
        self.derive(|next| next.pipeline.limit(n))
    }

    pub fn project(&self, projection: &Document) -> Self {
        self.derive(|next| next.pipeline.project(projection))
    }

    /// Reads one page of results; use [`page`](Model::page) to execute.
    pub fn paginate(&self, page: u64, limit: u64) -> Self {
        self.derive(|next| next.action = Some(Action::Paginate { page: page.max(1), limit: limit.max(1) }))
    }

    pub fn paginate_with(&self, params: PaginationParams) -> Self {
        self.paginate(params.page, params.per_page)
    }

    /// Joins the documents referenced by the field `path`.
    pub fn populate(&self, path: &str) -> Self {
        self.populate_with(path, Populate::default())
    }

    /// Joins the documents referenced by the field `path`, optionally projecting or
    /// transforming them.
    ///
    /// A path that is not a declared reference field, or whose reference cannot be
    /// resolved to a collection, is logged and skipped.
    pub fn populate_with(&self, path: &str, options: Populate) -> Self {
        self.derive(|next| {
            let Some(field) = next.schema.field(path) else {
                tracing::warn!(entity = %E::model_name(), path = %path, "populate skipped: unknown field");
                return;
            };
            let Some(reference) = field.reference.as_ref() else {
                tracing::warn!(entity = %E::model_name(), path = %path, "populate skipped: field declares no reference");
                return;
            };
            let Some(from) = next.ctx.catalog().resolve(reference) else {
                tracing::warn!(entity = %E::model_name(), path = %path, reference = ?reference, "populate skipped: unresolved reference");
                return;
            };
            let to_many = field.kind.is_collection();

            let pipeline = match (options.pipeline, options.select) {
                (Some(stages), _) => Some(stages),
                (None, Some(select)) => Some(vec![doc! { "$project": select }]),
                (None, None) => None,
            };

            next.pipeline.lookup(Lookup {
                from,
                local_field: path.to_string(),
                foreign_field: "_id".to_string(),
                as_field: path.to_string(),
                pipeline,
            });
            if !to_many {
                next.pipeline.unwind(path, true);
            }
        })
    }

    /// Makes an empty read fail with [`ModelError::NotFound`].
    pub fn or_fail(&self) -> Self {
        self.derive(|next| next.or_fail = Some(format!("no {} document matched the query", E::model_name())))
    }

    /// Like [`or_fail`](Model::or_fail) with a custom message.
    pub fn or_fail_with(&self, message: impl Into<String>) -> Self {
        let message = message.into();
        self.derive(|next| next.or_fail = Some(message))
    }

    /// Includes soft-deleted documents.
    pub fn with_deleted(&self) -> Self {
        self.derive(|next| next.with_deleted = true)
    }

    pub fn with_connection(&self, alias: impl Into<String>) -> Self {
        let alias = alias.into();
        self.derive(|next| next.overrides.connection = Some(alias))
    }

    pub fn with_database(&self, database: impl Into<String>) -> Self {
        let database = database.into();
        self.derive(|next| next.overrides.database = Some(database))
    }

    pub fn with_collection(&self, collection: impl Into<String>) -> Self {
        let collection = collection.into();
        self.derive(|next| next.overrides.collection = Some(collection))
    }

    /// Attributes audit records of the next execution to `user`.
    pub fn as_user(&self, user: impl Into<String>) -> Self {
        let user = user.into();
        self.derive(|next| next.overrides.actor = Some(user))
    }

    /// Runs the next execution inside `session`'s transaction.
    pub fn with_session(&self, session: &SessionRef) -> Self {
        let session = session.clone();
        self.derive(|next| next.overrides.session = Some(session))
    }

    /// Inserts the document when an update or replace matches nothing.
    pub fn upsert(&self) -> Self {
        self.derive(|next| next.write.upsert = true)
    }

    /// Which image find-one-and-update/replace returns. Defaults to the updated one.
    pub fn return_document(&self, which: ReturnDocument) -> Self {
        self.derive(|next| next.write.return_document = which)
    }

    fn with_action(&self, action: Action) -> Self {
        self.derive(|next| next.action = Some(action))
    }

    fn replacement(&self, entity: &E) -> (Document, Option<ModelError>) {
        match entity.to_document() {
            Ok(document) => (document, None),
            Err(err) => (Document::new(), Some(err)),
        }
    }

    pub fn update_one(&self, filter: Document, update: Document) -> Self {
        self.with_action(Action::UpdateOne { filter, update })
    }

    pub fn update_many(&self, filter: Document, update: Document) -> Self {
        self.with_action(Action::UpdateMany { filter, update })
    }

    pub fn replace_one(&self, filter: Document, replacement: &E) -> Self {
        let (replacement, err) = self.replacement(replacement);
        let mut next = self.with_action(Action::ReplaceOne { filter, replacement });
        if let Some(err) = err {
            next.defer(err);
        }
        next
    }

    pub fn find_one_and_update(&self, filter: Document, update: Document) -> Self {
        self.with_action(Action::FindOneAndUpdate { filter, update })
    }

    pub fn find_one_and_replace(&self, filter: Document, replacement: &E) -> Self {
        let (replacement, err) = self.replacement(replacement);
        let mut next = self.with_action(Action::FindOneAndReplace { filter, replacement });
        if let Some(err) = err {
            next.defer(err);
        }
        next
    }

    pub fn find_one_and_delete(&self, filter: Document) -> Self {
        self.with_action(Action::FindOneAndDelete { filter })
    }

    pub fn delete_one(&self, filter: Document) -> Self {
        self.with_action(Action::DeleteOne { filter })
    }

    pub fn delete_many(&self, filter: Document) -> Self {
        self.with_action(Action::DeleteMany { filter })
    }

    /// Registers a closure run before `point`.
    pub fn pre<F>(&mut self, point: HookPoint, hook: F) -> &mut Self
    where
        F: Fn(&PreContext<'_>) -> bool + Send + Sync + 'static,
    {
        Arc::make_mut(&mut self.middleware).pre(point, hook);
        self
    }

    /// Registers a closure run after `point`.
    pub fn post<F>(&mut self, point: HookPoint, hook: F) -> &mut Self
    where
        F: Fn(&PostContext<'_>) -> bool + Send + Sync + 'static,
    {
        Arc::make_mut(&mut self.middleware).post(point, hook);
        self
    }

    pub fn add_pre(&mut self, point: HookPoint, hook: Arc<dyn PreHook>) -> &mut Self {
        Arc::make_mut(&mut self.middleware).add_pre(point, hook);
        self
    }

    pub fn add_post(&mut self, point: HookPoint, hook: Arc<dyn PostHook>) -> &mut Self {
        Arc::make_mut(&mut self.middleware).add_post(point, hook);
        self
    }

    /// Attaches the audit hooks if the schema did not already enable them.
    pub fn audit(&mut self) -> &mut Self {
        if !self.schema.options().audit {
            audit::install(Arc::make_mut(&mut self.middleware), self.ctx.audit_collection());
        }
        self
    }

    /// Watches `kind` events on this model's collection.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be resolved or the store refuses the
    /// watch.
    pub async fn on<F>(&self, kind: EventKind, callback: F) -> ModelResult<Trigger>
    where
        F: Fn(ChangeEvent<E>) + Send + Sync + 'static,
    {
        self.watch(kind, TriggerOptions::default(), callback).await
    }

    /// Watches `kind` events with extra envelope filters or a caller-owned token.
    pub async fn watch<F>(&self, kind: EventKind, options: TriggerOptions, callback: F) -> ModelResult<Trigger>
    where
        F: Fn(ChangeEvent<E>) + Send + Sync + 'static,
    {
        let target = self.resolve().await?;
        trigger::spawn(
            target.backend,
            target.namespace,
            kind,
            options,
            self.triggers.token(),
            callback,
        )
        .await
    }

    /// Closes every trigger registered through this handle or its copies.
    pub fn invalidate_triggers(&self) {
        self.triggers.invalidate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldDef, FieldKind, SchemaBuilder};
    use serde::{Deserialize, Serialize};

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
                .field("title", FieldDef::string().required())
                .field("author", FieldDef::object_id().references("authors"))
                .field("tags", FieldDef::array(FieldKind::ObjectId).collection("tags"))
                .field("editor", FieldDef::object_id().references("editors"))
        }
    }

    fn posts() -> Model<Post> {
        let ctx = ModelContext::new();
        ctx.model::<Author>().unwrap();
        ctx.model::<Post>().unwrap()
    }

    #[test]
    fn test_chain_leaves_template_untouched() {
        let base = posts().where_eq("title", "a");
        let sorted = base.sort("title", SortOrder::Asc).limit(5);

        assert_eq!(base.pipeline().len(), 1);
        assert_eq!(sorted.pipeline().len(), 3);
    }

    #[test]
    fn test_schema_is_registered_once() {
        let ctx = ModelContext::new();
        let first = ctx.model::<Post>().unwrap();
        let second = ctx.model::<Post>().unwrap();

        assert!(Arc::ptr_eq(first.schema(), second.schema()));
        assert_eq!(first.schema().collection(), "posts");
    }

    #[test]
    fn test_populate_to_one_emits_lookup_and_unwind() {
        let model = posts().populate_with("author", Populate::select(doc! { "name": 1 }));

        assert_eq!(
            model.pipeline().stages(),
            &[
                doc! { "$lookup": {
                    "from": "authors",
                    "localField": "author",
                    "foreignField": "_id",
                    "as": "author",
                    "pipeline": [{ "$project": { "name": 1 } }],
                } },
                doc! { "$unwind": { "path": "$author", "preserveNullAndEmptyArrays": true } },
            ]
        );
    }

    #[test]
    fn test_populate_to_many_skips_unwind() {
        let model = posts().populate("tags");

        assert_eq!(model.pipeline().len(), 1);
        assert_eq!(
            model.pipeline().stages()[0].get_document("$lookup").unwrap().get_str("from").unwrap(),
            "tags"
        );
    }

    #[test]
    fn test_unresolvable_populate_is_skipped() {
        let model = posts()
            .populate("editor")
            .populate("title")
            .populate("missing")
            .limit(1);

        assert_eq!(model.pipeline().stages(), &[doc! { "$limit": 1_i64 }]);
        assert!(model.deferred.is_none());
    }

    #[test]
    fn test_invalid_sort_is_deferred() {
        let model = posts().sort_by(&["title"]);
        assert!(matches!(model.deferred, Some(ModelError::Query(_))));
        assert!(model.pipeline().is_empty());
    }

    #[test]
    fn test_hooks_do_not_leak_into_clones_made_before() {
        let mut model = posts();
        let before = model.clone();
        model.pre(HookPoint::Save, |_| true);

        assert!(before.middleware.is_empty());
        assert!(!model.middleware.is_empty());
    }
}
