//! Cron-driven recurring executions.
//!
//! Expressions use the `cron` crate syntax, which includes a seconds field:
//! `"0 */5 * * * *"` fires every five minutes. Each entry runs on its own task and is
//! stopped with [`Scheduler::cancel`] or, together with every other entry,
//! [`Scheduler::shutdown`]. A failed run is logged and the entry keeps its schedule.
//! An entry whose expression has no upcoming run is removed.

use chrono::Utc;
use cron::Schedule as CronSchedule;
use parking_lot::Mutex;
use std::{collections::HashMap, fmt, future::Future, str::FromStr, sync::Arc, time::Duration};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{ModelError, ModelResult};

/// Identifier of a schedule entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScheduleId(Uuid);

impl fmt::Display for ScheduleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Shortest pause between two runs, so an expression matching every instant cannot
/// spin.
const MIN_SLEEP: Duration = Duration::from_millis(100);

struct Entry {
    expression: String,
    token: CancellationToken,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct Entries {
    entries: Mutex<HashMap<ScheduleId, Entry>>,
}

/// Owner of every recurring execution of a [`ModelContext`](crate::context::ModelContext).
///
/// Cloning is cheap; clones share the same entries.
#[derive(Clone, Default)]
pub struct Scheduler {
    inner: Arc<Entries>,
}

/// Parses a cron expression.
///
/// # Errors
///
/// Returns [`ModelError::Schedule`] if the expression is invalid.
pub fn parse_expression(expression: &str) -> ModelResult<CronSchedule> {
    CronSchedule::from_str(expression)
        .map_err(|err| ModelError::Schedule(format!("invalid cron expression `{}`: {}", expression, err)))
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `job` every time `expression` fires.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::Schedule`] if the expression is invalid.
    pub fn schedule<F, Fut>(&self, expression: &str, job: F) -> ModelResult<ScheduleId>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ModelResult<()>> + Send + 'static,
    {
        let schedule = parse_expression(expression)?;
        let id = ScheduleId(Uuid::new_v4());
        let token = CancellationToken::new();
        let task_token = token.clone();
        let inner = self.inner.clone();

        // Held until the entry is stored, so a task that ends at once finds it.
        let mut entries = self.inner.entries.lock();
        let task = tokio::spawn(async move {
            loop {
                let Some(next) = schedule.upcoming(Utc).next() else {
                    tracing::debug!(schedule = %id, "schedule has no upcoming run");
                    break;
                };
                let delay = (next - Utc::now()).to_std().unwrap_or(MIN_SLEEP).max(MIN_SLEEP);

                tokio::select! {
                    _ = task_token.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {
                        if let Err(err) = job().await {
                            tracing::error!(schedule = %id, error = %err, "scheduled execution failed");
                        }
                    }
                }
            }
            inner.entries.lock().remove(&id);
        });

        entries.insert(
            id,
            Entry {
                expression: expression.to_string(),
                token,
                task,
            },
        );
        drop(entries);
        tracing::debug!(schedule = %id, expression = %expression, "execution scheduled");

        Ok(id)
    }

    /// Stops one entry. Returns `false` if it was unknown.
    pub fn cancel(&self, id: ScheduleId) -> bool {
        match self.inner.entries.lock().remove(&id) {
            Some(entry) => {
                entry.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Stops every entry.
    pub fn shutdown(&self) {
        let drained: Vec<Entry> = self.inner.entries.lock().drain().map(|(_, entry)| entry).collect();
        for entry in drained {
            entry.token.cancel();
        }
    }

    pub fn contains(&self, id: ScheduleId) -> bool {
        self.inner
            .entries
            .lock()
            .get(&id)
            .is_some_and(|entry| !entry.task.is_finished())
    }

    /// Expression of an entry.
    pub fn expression(&self, id: ScheduleId) -> Option<String> {
        self.inner.entries.lock().get(&id).map(|entry| entry.expression.clone())
    }

    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler").field("entries", &self.len()).finish()
    }
}
