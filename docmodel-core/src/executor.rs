//! Terminal operations of a [`Model`].
//!
//! Chain methods only record what should happen. The store, database and collection
//! are resolved when a terminal method runs, in this order:
//!
//! 1. connection alias: per-call override, then the session's alias, then the schema's
//!    connection option, then [`DEFAULT_ALIAS`]
//! 2. database: per-call override, then the schema's database option, then the
//!    connection's default database
//! 3. collection: per-call override, then the schema's collection
//!
//! Mutating actions merge the accumulated `$match` predicates with their explicit
//! filter (explicit keys win), run the pre hooks, issue one store command and run the
//! post hooks with the result. Without an action the pipeline runs as a read.

use bson::{Bson, DateTime, Document, doc, oid::ObjectId};
use mea::mutex::MutexGuard;
use std::sync::Arc;

use crate::{
    backend::{IndexDefinition, Namespace, ReturnDocument, StoreBackend, StoreSession, UpdateOutcome},
    entity::{Entity, EntityExt},
    error::{ModelError, ModelResult},
    middleware::{HookPoint, PostContext, PreContext},
    model::{CREATED_AT, DELETED_AT, Model, UPDATED_AT},
    page::{Page, PaginationParams},
    registry::DEFAULT_ALIAS,
    scheduler::ScheduleId,
    transaction::SessionRef,
};

/// The terminal action a handle maps to.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Action {
    UpdateOne { filter: Document, update: Document },
    UpdateMany { filter: Document, update: Document },
    ReplaceOne { filter: Document, replacement: Document },
    FindOneAndUpdate { filter: Document, update: Document },
    FindOneAndReplace { filter: Document, replacement: Document },
    FindOneAndDelete { filter: Document },
    DeleteOne { filter: Document },
    DeleteMany { filter: Document },
    Paginate { page: u64, limit: u64 },
    Count,
}

impl Action {
    fn name(&self) -> &'static str {
        match self {
            Action::UpdateOne { .. } => "updateOne",
            Action::UpdateMany { .. } => "updateMany",
            Action::ReplaceOne { .. } => "replaceOne",
            Action::FindOneAndUpdate { .. } => "findOneAndUpdate",
            Action::FindOneAndReplace { .. } => "findOneAndReplace",
            Action::FindOneAndDelete { .. } => "findOneAndDelete",
            Action::DeleteOne { .. } => "deleteOne",
            Action::DeleteMany { .. } => "deleteMany",
            Action::Paginate { .. } => "paginate",
            Action::Count => "count",
        }
    }
}

/// Untyped result of [`Model::exec`].
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Rows of a read.
    Documents(Vec<Document>),
    /// Image returned by a find-one-and-* action.
    Document(Option<Document>),
    Page(Page<Document>),
    Updated(UpdateOutcome),
    /// Number of removed, or soft-deleted, documents.
    Deleted(u64),
    Count(u64),
}

impl Outcome {
    /// Returns the documents carried by this outcome.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::Query`] for outcomes that carry no documents.
    pub fn into_documents(self) -> ModelResult<Vec<Document>> {
        match self {
            Outcome::Documents(documents) => Ok(documents),
            Outcome::Document(document) => Ok(document.into_iter().collect()),
            Outcome::Page(page) => Ok(page.docs),
            other => Err(ModelError::Query(format!("{:?} carries no documents", other))),
        }
    }

    /// Decodes the carried documents into `E`.
    pub fn decode<E: Entity>(self) -> ModelResult<Vec<E>> {
        self.into_documents()?
            .into_iter()
            .map(E::from_document)
            .collect()
    }

    /// Rows matched, removed or counted, for outcomes that report one.
    pub fn affected(&self) -> Option<u64> {
        match self {
            Outcome::Updated(outcome) => Some(outcome.matched),
            Outcome::Deleted(n) | Outcome::Count(n) => Some(*n),
            _ => None,
        }
    }
}

/// Where an execution runs.
pub(crate) struct Target {
    pub(crate) alias: String,
    pub(crate) backend: Arc<dyn StoreBackend>,
    pub(crate) namespace: Namespace,
}

fn session_arg<'a>(guard: &'a mut SessionGuard<'_>) -> Option<&'a mut dyn StoreSession> {
    match guard {
        Some(guard) => {
            let session: &mut dyn StoreSession = &mut ***guard;
            Some(session)
        }
        None => None,
    }
}

fn as_u64(value: &Bson) -> Option<u64> {
    match value {
        Bson::Int32(n) => u64::try_from(*n).ok(),
        Bson::Int64(n) => u64::try_from(*n).ok(),
        Bson::Double(n) if *n >= 0.0 => Some(*n as u64),
        _ => None,
    }
}

fn decode_facet(rows: Vec<Document>, page: u64, limit: u64) -> ModelResult<Page<Document>> {
    let facet = rows.into_iter().next().unwrap_or_default();

    let docs = match facet.get("docs") {
        Some(Bson::Array(items)) => items
            .iter()
            .map(|item| match item {
                Bson::Document(document) => Ok(document.clone()),
                other => Err(ModelError::Query(format!("paginated row is not a document: {}", other))),
            })
            .collect::<ModelResult<Vec<_>>>()?,
        None => Vec::new(),
        Some(other) => return Err(ModelError::Query(format!("unexpected docs branch: {}", other))),
    };

    let total = match facet.get("count") {
        Some(Bson::Array(items)) => items
            .first()
            .and_then(Bson::as_document)
            .and_then(|count| count.get("count"))
            .and_then(as_u64)
            .unwrap_or(0),
        None => 0,
        Some(other) => return Err(ModelError::Query(format!("unexpected count branch: {}", other))),
    };

    Ok(Page::builder(docs)
        .with_total_docs(total)
        .with_page(page)
        .with_limit(limit)
        .build())
}

type SessionGuard<'a> = Option<MutexGuard<'a, Box<dyn StoreSession>>>;

struct Call<'a> {
    point: HookPoint,
    namespace: &'a Namespace,
    filter: Option<&'a Document>,
    payload: &'a [Document],
}

enum ReadShape {
    Rows,
    Count,
    Page { page: u64, limit: u64 },
}

impl<E: Entity> Model<E> {
    pub(crate) async fn resolve(&self) -> ModelResult<Target> {
        let session_alias = self.overrides.session.as_ref().map(SessionRef::alias);
        let alias = self
            .overrides
            .connection
            .as_deref()
            .or(session_alias)
            .or(self.schema.options().connection.as_deref())
            .unwrap_or(DEFAULT_ALIAS);

        if let Some(session_alias) = session_alias {
            if session_alias != alias {
                return Err(ModelError::Session(format!(
                    "session belongs to connection `{}` but the operation runs on `{}`",
                    session_alias, alias
                )));
            }
        }

        let connection = self.ctx.registry().get(alias).await?;
        let database = self
            .overrides
            .database
            .clone()
            .or_else(|| self.schema.options().database.clone())
            .unwrap_or_else(|| connection.database().to_string());
        let collection = self
            .overrides
            .collection
            .clone()
            .unwrap_or_else(|| self.schema.collection().to_string());

        Ok(Target {
            alias: alias.to_string(),
            backend: connection.backend().clone(),
            namespace: Namespace::new(database, collection),
        })
    }

    fn soft_delete_scoped(&self) -> bool {
        self.schema.options().soft_delete && !self.with_deleted
    }

    fn effective_filter(&self, explicit: Document) -> Document {
        let mut filter = self.pipeline.match_filter();
        for (key, value) in explicit {
            filter.insert(key, value);
        }
        if self.soft_delete_scoped() && !filter.contains_key(DELETED_AT) {
            filter.insert(DELETED_AT, Bson::Null);
        }
        filter
    }

    /// Wraps operator-less updates in `$set` and stamps `updatedAt` when timestamps
    /// are enabled.
    fn prepare_update(&self, update: Document) -> Document {
        let mut update = if update.keys().any(|key| key.starts_with('$')) {
            update
        } else {
            doc! { "$set": update }
        };

        if self.schema.options().timestamps {
            let now = Bson::DateTime(DateTime::now());
            match update.get_mut("$set") {
                Some(Bson::Document(set)) => {
                    if !set.contains_key(UPDATED_AT) {
                        set.insert(UPDATED_AT, now);
                    }
                }
                _ => {
                    let mut set = Document::new();
                    set.insert(UPDATED_AT, now);
                    update.insert("$set", set);
                }
            }
        }
        update
    }

    fn prepare_replacement(&self, mut replacement: Document) -> ModelResult<Document> {
        self.schema.apply(&mut replacement)?;
        if self.schema.options().timestamps {
            replacement.insert(UPDATED_AT, Bson::DateTime(DateTime::now()));
        }
        Ok(replacement)
    }

    fn soft_delete_update(&self) -> Document {
        let mut set = Document::new();
        set.insert(DELETED_AT, Bson::DateTime(DateTime::now()));
        self.prepare_update(doc! { "$set": set })
    }

    async fn before(&self, call: &Call<'_>) {
        let ctx = PreContext {
            point: call.point,
            entity: E::model_name(),
            namespace: call.namespace,
            filter: call.filter,
            payload: call.payload,
            actor: self.overrides.actor.as_deref(),
        };
        self.middleware.run_pre(&ctx).await;
    }

    /// Runs the post hooks. The session lock is released first so hooks can write
    /// through the same session.
    async fn after(
        &self,
        call: &Call<'_>,
        guard: &mut SessionGuard<'_>,
        backend: &dyn StoreBackend,
        documents: &[Document],
        affected: u64,
        error: Option<&ModelError>,
    ) {
        drop(guard.take());
        let ctx = PostContext {
            point: call.point,
            entity: E::model_name(),
            namespace: call.namespace,
            filter: call.filter,
            payload: call.payload,
            documents,
            affected,
            error,
            actor: self.overrides.actor.as_deref(),
            backend,
            session: self.overrides.session.as_ref(),
        };
        self.middleware.run_post(&ctx).await;
    }

    async fn after_image(
        &self,
        call: &Call<'_>,
        guard: &mut SessionGuard<'_>,
        backend: &dyn StoreBackend,
        result: &ModelResult<Option<Document>>,
    ) {
        let documents = match result {
            Ok(Some(document)) => std::slice::from_ref(document),
            _ => &[],
        };
        self.after(call, guard, backend, documents, documents.len() as u64, result.as_ref().err())
            .await;
    }

    /// Executes the handle and returns an untyped [`Outcome`].
    ///
    /// # Errors
    ///
    /// Returns a deferred builder error before touching the store, a
    /// [`ModelError::NotFound`] for an empty read in [`or_fail`](Model::or_fail) mode,
    /// or whatever the store reports.
    pub async fn exec(mut self) -> ModelResult<Outcome> {
        if let Some(err) = self.deferred.take() {
            return Err(err);
        }

        let action = self.action.take();
        let target = self.resolve().await?;

        tracing::debug!(
            entity = %E::model_name(),
            alias = %target.alias,
            namespace = %target.namespace,
            action = action.as_ref().map_or("find", Action::name),
            "executing"
        );

        let mut guard: SessionGuard<'_> = match &self.overrides.session {
            Some(session) => Some(session.lock().await),
            None => None,
        };

        let outcome = match action {
            None => self.read(&target, &mut guard, ReadShape::Rows).await?,
            Some(Action::Count) => self.read(&target, &mut guard, ReadShape::Count).await?,
            Some(Action::Paginate { page, limit }) => {
                self.read(&target, &mut guard, ReadShape::Page { page, limit }).await?
            }
            Some(action) => self.write(&target, &mut guard, action).await?,
        };

        let empty = match &outcome {
            Outcome::Documents(documents) => documents.is_empty(),
            Outcome::Page(page) => page.docs.is_empty(),
            Outcome::Document(document) => document.is_none(),
            _ => false,
        };
        match (&self.or_fail, empty) {
            (Some(message), true) => Err(ModelError::NotFound(message.clone())),
            _ => Ok(outcome),
        }
    }

    async fn read(&self, target: &Target, guard: &mut SessionGuard<'_>, shape: ReadShape) -> ModelResult<Outcome> {
        let backend = target.backend.as_ref();
        let namespace = &target.namespace;

        let mut pipeline = self.pipeline.clone();
        if self.soft_delete_scoped() {
            pipeline.prepend(doc! { "$match": { DELETED_AT: Bson::Null } });
        }
        match shape {
            ReadShape::Count => pipeline.push(doc! { "$count": "count" }),
            ReadShape::Page { page, limit } => pipeline.paginate(page, limit),
            ReadShape::Rows => {}
        }

        let filter = pipeline.match_filter();
        let stages = pipeline.into_stages();
        let call = Call {
            point: HookPoint::Find,
            namespace,
            filter: Some(&filter),
            payload: &stages,
        };

        self.before(&call).await;
        let result = backend
            .aggregate(namespace, stages.clone(), session_arg(guard))
            .await;
        let rows = result.as_deref().unwrap_or_default();
        self.after(&call, guard, backend, rows, rows.len() as u64, result.as_ref().err())
            .await;
        let rows = result?;

        Ok(match shape {
            ReadShape::Rows => Outcome::Documents(rows),
            ReadShape::Count => Outcome::Count(
                rows.first()
                    .and_then(|row| row.get("count"))
                    .and_then(as_u64)
                    .unwrap_or(0),
            ),
            ReadShape::Page { page, limit } => Outcome::Page(decode_facet(rows, page, limit)?),
        })
    }

    async fn write(&self, target: &Target, guard: &mut SessionGuard<'_>, action: Action) -> ModelResult<Outcome> {
        let backend = target.backend.as_ref();
        let namespace = &target.namespace;
        let upsert = self.write.upsert;
        let soft_delete = self.schema.options().soft_delete;

        match action {
            Action::UpdateOne { filter, update } => {
                self.update(target, guard, HookPoint::UpdateOne, filter, update, false).await
            }
            Action::UpdateMany { filter, update } => {
                self.update(target, guard, HookPoint::UpdateMany, filter, update, true).await
            }
            Action::ReplaceOne { filter, replacement } => {
                let filter = self.effective_filter(filter);
                let replacement = self.prepare_replacement(replacement)?;
                let call = Call {
                    point: HookPoint::ReplaceOne,
                    namespace,
                    filter: Some(&filter),
                    payload: std::slice::from_ref(&replacement),
                };

                self.before(&call).await;
                let result = backend
                    .replace_one(namespace, filter.clone(), replacement.clone(), upsert, session_arg(guard))
                    .await;
                self.after(&call, guard, backend, &[], result.as_ref().map_or(0, |o| o.matched), result.as_ref().err())
                    .await;
                Ok(Outcome::Updated(result?))
            }
            Action::FindOneAndUpdate { filter, update } => {
                let filter = self.effective_filter(filter);
                let update = self.prepare_update(update);
                let call = Call {
                    point: HookPoint::FindOneAndUpdate,
                    namespace,
                    filter: Some(&filter),
                    payload: std::slice::from_ref(&update),
                };

                self.before(&call).await;
                let result = backend
                    .find_one_and_update(
                        namespace,
                        filter.clone(),
                        update.clone(),
                        self.write.return_document,
                        upsert,
                        session_arg(guard),
                    )
                    .await;
                self.after_image(&call, guard, backend, &result).await;
                Ok(Outcome::Document(result?))
            }
            Action::FindOneAndReplace { filter, replacement } => {
                let filter = self.effective_filter(filter);
                let replacement = self.prepare_replacement(replacement)?;
                let call = Call {
                    point: HookPoint::FindOneAndReplace,
                    namespace,
                    filter: Some(&filter),
                    payload: std::slice::from_ref(&replacement),
                };

                self.before(&call).await;
                let result = backend
                    .find_one_and_replace(
                        namespace,
                        filter.clone(),
                        replacement.clone(),
                        self.write.return_document,
                        upsert,
                        session_arg(guard),
                    )
                    .await;
                self.after_image(&call, guard, backend, &result).await;
                Ok(Outcome::Document(result?))
            }
            Action::FindOneAndDelete { filter } => {
                let filter = self.effective_filter(filter);
                let call = Call {
                    point: HookPoint::FindOneAndDelete,
                    namespace,
                    filter: Some(&filter),
                    payload: &[],
                };

                self.before(&call).await;
                let result = if soft_delete {
                    backend
                        .find_one_and_update(
                            namespace,
                            filter.clone(),
                            self.soft_delete_update(),
                            ReturnDocument::After,
                            false,
                            session_arg(guard),
                        )
                        .await
                } else {
                    backend
                        .find_one_and_delete(namespace, filter.clone(), session_arg(guard))
                        .await
                };
                self.after_image(&call, guard, backend, &result).await;
                Ok(Outcome::Document(result?))
            }
            Action::DeleteOne { filter } => self.delete(target, guard, HookPoint::DeleteOne, filter, false).await,
            Action::DeleteMany { filter } => self.delete(target, guard, HookPoint::DeleteMany, filter, true).await,
            Action::Paginate { .. } | Action::Count => Err(ModelError::Query(format!(
                "`{}` is a read, not a write",
                action.name()
            ))),
        }
    }

    async fn update(
        &self,
        target: &Target,
        guard: &mut SessionGuard<'_>,
        point: HookPoint,
        filter: Document,
        update: Document,
        multi: bool,
    ) -> ModelResult<Outcome> {
        let backend = target.backend.as_ref();
        let namespace = &target.namespace;
        let filter = self.effective_filter(filter);
        let update = self.prepare_update(update);
        let call = Call {
            point,
            namespace,
            filter: Some(&filter),
            payload: std::slice::from_ref(&update),
        };

        self.before(&call).await;
        let result = backend
            .update(namespace, filter.clone(), update.clone(), multi, self.write.upsert, session_arg(guard))
            .await;
        self.after(&call, guard, backend, &[], result.as_ref().map_or(0, |o| o.matched), result.as_ref().err())
            .await;
        Ok(Outcome::Updated(result?))
    }

    /// Removes matching documents, or marks them deleted when soft delete is enabled.
    async fn delete(
        &self,
        target: &Target,
        guard: &mut SessionGuard<'_>,
        point: HookPoint,
        filter: Document,
        multi: bool,
    ) -> ModelResult<Outcome> {
        let backend = target.backend.as_ref();
        let namespace = &target.namespace;
        let filter = self.effective_filter(filter);
        let call = Call {
            point,
            namespace,
            filter: Some(&filter),
            payload: &[],
        };

        self.before(&call).await;
        let result = if self.schema.options().soft_delete {
            backend
                .update(namespace, filter.clone(), self.soft_delete_update(), multi, false, session_arg(guard))
                .await
                .map(|outcome| outcome.modified)
        } else {
            backend
                .delete(namespace, filter.clone(), multi, session_arg(guard))
                .await
        };
        self.after(&call, guard, backend, &[], *result.as_ref().unwrap_or(&0), result.as_ref().err())
            .await;
        Ok(Outcome::Deleted(result?))
    }

    /// Reads every matching document.
    pub async fn all(self) -> ModelResult<Vec<E>> {
        self.exec().await?.decode()
    }

    /// Reads the first matching document.
    pub async fn one(self) -> ModelResult<Option<E>> {
        let model = if self.action.is_none() { self.limit(1) } else { self };
        model
            .exec()
            .await?
            .into_documents()?
            .into_iter()
            .next()
            .map(E::from_document)
            .transpose()
    }

    /// Reads the document whose `_id` is `id`.
    ///
    /// A 24-character hex string is matched as an `ObjectId`.
    pub async fn find_by_id(self, id: impl Into<Bson>) -> ModelResult<Option<E>> {
        let id = match id.into() {
            Bson::String(hex) => match ObjectId::parse_str(&hex) {
                Ok(oid) => Bson::ObjectId(oid),
                Err(_) => Bson::String(hex),
            },
            other => other,
        };
        self.where_eq("_id", id).one().await
    }

    /// Counts the matching documents.
    pub async fn count(mut self) -> ModelResult<u64> {
        self.action = Some(Action::Count);
        match self.exec().await? {
            Outcome::Count(n) => Ok(n),
            other => Err(ModelError::Query(format!("expected a count, got {:?}", other))),
        }
    }

    /// Reads one page; without [`paginate`](Model::paginate) the first page of ten.
    pub async fn page(self) -> ModelResult<Page<E>> {
        let model = match self.action {
            Some(Action::Paginate { .. }) => self,
            _ => self.paginate_with(PaginationParams::default()),
        };
        match model.exec().await? {
            Outcome::Page(page) => page.try_map(E::from_document),
            other => Err(ModelError::Query(format!("expected a page, got {:?}", other))),
        }
    }

    /// Validates and inserts one entity, returning it as stored.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::Validation`] for the first schema violation.
    pub async fn create(self, entity: &E) -> ModelResult<E> {
        let mut stored = self.insert_documents(vec![entity.to_document()?]).await?;
        let document = stored
            .pop()
            .ok_or_else(|| ModelError::Backend("insert returned no document".into()))?;
        E::from_document(document)
    }

    /// Validates and inserts several entities in one command.
    pub async fn create_many(self, entities: &[E]) -> ModelResult<Vec<E>> {
        let documents = entities
            .iter()
            .map(EntityExt::to_document)
            .collect::<ModelResult<Vec<_>>>()?;
        self.insert_documents(documents)
            .await?
            .into_iter()
            .map(E::from_document)
            .collect()
    }

    /// Validates and inserts raw documents, returning them as stored.
    ///
    /// Defaults are applied, missing `_id`s are generated and, with timestamps
    /// enabled, `createdAt`/`updatedAt` are stamped. Nothing is written if any
    /// document fails validation.
    pub async fn insert_documents(mut self, mut documents: Vec<Document>) -> ModelResult<Vec<Document>> {
        if let Some(err) = self.deferred.take() {
            return Err(err);
        }

        let timestamps = self.schema.options().timestamps;
        let now = Bson::DateTime(DateTime::now());
        for document in &mut documents {
            self.schema.apply(document)?;
            if !document.contains_key("_id") {
                document.insert("_id", ObjectId::new());
            }
            if timestamps {
                for key in [CREATED_AT, UPDATED_AT] {
                    if !document.contains_key(key) {
                        document.insert(key, now.clone());
                    }
                }
            }
        }

        let target = self.resolve().await?;
        let backend = target.backend.as_ref();
        let namespace = &target.namespace;
        let mut guard: SessionGuard<'_> = match &self.overrides.session {
            Some(session) => Some(session.lock().await),
            None => None,
        };

        tracing::debug!(entity = %E::model_name(), namespace = %namespace, count = documents.len(), "inserting");

        let call = Call {
            point: HookPoint::Save,
            namespace,
            filter: None,
            payload: &documents,
        };
        self.before(&call).await;
        let result = backend
            .insert_many(namespace, documents.clone(), session_arg(&mut guard))
            .await;
        let stored: &[Document] = if result.is_ok() { &documents } else { &[] };
        self.after(&call, &mut guard, backend, stored, stored.len() as u64, result.as_ref().err())
            .await;
        result?;

        Ok(documents)
    }

    /// Creates every index declared in the schema and returns how many were created.
    pub async fn sync_indexes(self) -> ModelResult<usize> {
        let target = self.resolve().await?;
        let mut created = 0;

        for (name, field) in self.schema.fields() {
            let Some(spec) = field.index.as_ref() else {
                continue;
            };
            let mut keys = Document::new();
            keys.insert(name, if spec.descending { -1 } else { 1 });

            target
                .backend
                .create_index(
                    &target.namespace,
                    IndexDefinition {
                        keys,
                        unique: spec.unique,
                        sparse: spec.sparse,
                    },
                )
                .await?;
            created += 1;
        }

        tracing::debug!(entity = %E::model_name(), namespace = %target.namespace, created, "indexes synced");
        Ok(created)
    }

    /// Runs this execution every time the cron `expression` fires instead of now.
    ///
    /// Each run starts from a copy of this handle without its session. Failed runs are
    /// logged.
    ///
    /// # Errors
    ///
    /// Returns the deferred builder error, or [`ModelError::Schedule`] for an invalid
    /// expression.
    pub fn schedule(mut self, expression: &str) -> ModelResult<ScheduleId> {
        if let Some(err) = self.deferred.take() {
            return Err(err);
        }
        self.overrides.session = None;

        let scheduler = self.ctx.scheduler().clone();
        scheduler.schedule(expression, move || {
            let model = self.clone();
            async move { model.exec().await.map(|_| ()) }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_facet() {
        let rows = vec![doc! {
            "docs": [{ "n": 7 }],
            "count": [{ "count": 7 }],
        }];
        let page = decode_facet(rows, 4, 2).unwrap();

        assert_eq!(page.docs, vec![doc! { "n": 7 }]);
        assert_eq!(page.total_docs, 7);
        assert_eq!(page.total_pages, 4);
        assert!(!page.has_next);
    }

    #[test]
    fn test_decode_facet_without_matches() {
        let page = decode_facet(vec![doc! { "docs": [], "count": [] }], 1, 10).unwrap();
        assert_eq!(page.total_docs, 0);
        assert_eq!(page.total_pages, 0);

        let malformed = decode_facet(vec![doc! { "docs": [1, 2] }], 1, 10);
        assert!(matches!(malformed, Err(ModelError::Query(_))));
    }

    #[test]
    fn test_outcome_documents() {
        assert_eq!(
            Outcome::Document(Some(doc! { "a": 1 })).into_documents().unwrap(),
            vec![doc! { "a": 1 }]
        );
        assert!(Outcome::Document(None).into_documents().unwrap().is_empty());
        assert!(Outcome::Deleted(3).into_documents().is_err());
        assert_eq!(Outcome::Deleted(3).affected(), Some(3));
    }
}
