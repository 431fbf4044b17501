//! Sessions and transactions.
//!
//! [`with_transaction`] runs one callback inside one session and commits or aborts
//! depending on its result. [`TransactionBatch`] queues operations that may target
//! different connection aliases; each runs in its own session, and the batch either
//! commits every session or aborts every session. Sessions on different connections
//! are independent, so a batch is atomic per session only: a commit that fails after
//! others succeeded is reported, not undone.

use futures::future::BoxFuture;
use mea::mutex::{Mutex, MutexGuard};
use std::{fmt, future::Future, sync::Arc};

use crate::{
    backend::StoreSession,
    context::ModelContext,
    error::{ModelError, ModelResult},
    executor::Outcome,
};

/// A shared handle to a session with an open transaction.
///
/// Pass it to [`Model::with_session`](crate::model::Model::with_session) to run an
/// execution inside the transaction.
#[derive(Clone)]
pub struct SessionRef {
    alias: Arc<str>,
    inner: Arc<Mutex<Box<dyn StoreSession>>>,
}

impl SessionRef {
    pub fn new(alias: &str, session: Box<dyn StoreSession>) -> Self {
        Self {
            alias: Arc::from(alias),
            inner: Arc::new(Mutex::new(session)),
        }
    }

    /// Alias of the connection this session belongs to.
    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub(crate) async fn lock(&self) -> MutexGuard<'_, Box<dyn StoreSession>> {
        self.inner.lock().await
    }

    pub async fn commit(&self) -> ModelResult<()> {
        self.lock().await.commit_transaction().await
    }

    pub async fn abort(&self) -> ModelResult<()> {
        self.lock().await.abort_transaction().await
    }
}

impl fmt::Debug for SessionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionRef").field("alias", &self.alias).finish_non_exhaustive()
    }
}

/// Starts a session with an open transaction on `alias`.
pub async fn begin(ctx: &ModelContext, alias: &str) -> ModelResult<SessionRef> {
    let connection = ctx.registry().get(alias).await?;
    let mut session = connection.backend().start_session().await?;
    session.start_transaction().await?;
    tracing::debug!(alias = %alias, "transaction started");
    Ok(SessionRef::new(alias, session))
}

/// Runs `f` inside a transaction on `alias`.
///
/// The transaction is committed when `f` succeeds and aborted when it fails.
///
/// # Errors
///
/// Returns the error of `f`, or the error raised while starting or committing.
///
/// # Example
///
/// ```ignore
/// let created = with_transaction(&ctx, "default", |session| async move {
///     let user = users.with_session(&session).create(&alice).await?;
///     accounts.with_session(&session).create(&Account::for_user(&user)).await?;
///     Ok(user)
/// })
/// .await?;
/// ```
pub async fn with_transaction<F, Fut, T>(ctx: &ModelContext, alias: &str, f: F) -> ModelResult<T>
where
    F: FnOnce(SessionRef) -> Fut,
    Fut: Future<Output = ModelResult<T>>,
{
    let session = begin(ctx, alias).await?;

    match f(session.clone()).await {
        Ok(value) => {
            session.commit().await?;
            tracing::debug!(alias = %alias, "transaction committed");
            Ok(value)
        }
        Err(err) => {
            if let Err(abort_err) = session.abort().await {
                tracing::error!(alias = %alias, error = %abort_err, "failed to abort transaction");
            }
            tracing::debug!(alias = %alias, error = %err, "transaction aborted");
            Err(err)
        }
    }
}

type BatchOperation = Box<dyn FnOnce(SessionRef) -> BoxFuture<'static, ModelResult<Outcome>> + Send>;

/// Outcome of [`TransactionBatch::run`].
#[derive(Debug, Default)]
pub struct BatchReport {
    /// Results of the operations that completed before the first failure.
    pub results: Vec<Outcome>,
    /// The failure that stopped the batch, then any abort or commit failures.
    pub errors: Vec<ModelError>,
    /// `true` if every session was committed.
    pub committed: bool,
}

impl BatchReport {
    pub fn is_committed(&self) -> bool {
        self.committed
    }

    /// Converts the report into the results, or the first error.
    pub fn into_result(self) -> ModelResult<Vec<Outcome>> {
        match self.errors.into_iter().next() {
            Some(err) => Err(err),
            None => Ok(self.results),
        }
    }
}

/// Operations on possibly different aliases committed or rolled back together.
///
/// # Example
///
/// ```ignore
/// let report = TransactionBatch::new(&ctx)
///     .add("orders", move |s| orders.with_session(&s).update_one(filter, update).exec())
///     .add("billing", move |s| invoices.with_session(&s).delete_one(doc! { "_id": id }).exec())
///     .run()
///     .await;
/// ```
pub struct TransactionBatch {
    ctx: ModelContext,
    operations: Vec<(String, BatchOperation)>,
}

impl TransactionBatch {
    pub fn new(ctx: &ModelContext) -> Self {
        Self {
            ctx: ctx.clone(),
            operations: Vec::new(),
        }
    }

    /// Queues an operation to run in its own session on `alias`.
    pub fn add<F, Fut>(mut self, alias: impl Into<String>, operation: F) -> Self
    where
        F: FnOnce(SessionRef) -> Fut + Send + 'static,
        Fut: Future<Output = ModelResult<Outcome>> + Send + 'static,
    {
        self.operations
            .push((alias.into(), Box::new(move |session| Box::pin(operation(session)))));
        self
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Runs the queued operations in order.
    ///
    /// Stops at the first failing operation and aborts every session opened so far,
    /// newest first; otherwise commits every session.
    pub async fn run(self) -> BatchReport {
        let mut report = BatchReport::default();
        let mut sessions: Vec<SessionRef> = Vec::with_capacity(self.operations.len());

        for (alias, operation) in self.operations {
            let session = match begin(&self.ctx, &alias).await {
                Ok(session) => session,
                Err(err) => {
                    report.errors.push(err);
                    break;
                }
            };
            sessions.push(session.clone());

            match operation(session).await {
                Ok(outcome) => report.results.push(outcome),
                Err(err) => {
                    report.errors.push(err);
                    break;
                }
            }
        }

        if report.errors.is_empty() {
            for session in &sessions {
                if let Err(err) = session.commit().await {
                    tracing::error!(alias = %session.alias(), error = %err, "batch commit failed");
                    report.errors.push(err);
                }
            }
            report.committed = report.errors.is_empty();
        } else {
            // Later sessions may have snapshotted earlier sessions' writes.
            for session in sessions.iter().rev() {
                if let Err(err) = session.abort().await {
                    tracing::error!(alias = %session.alias(), error = %err, "batch rollback failed");
                    report.errors.push(err);
                }
            }
            tracing::debug!(sessions = sessions.len(), "transaction batch rolled back");
        }

        report
    }
}
