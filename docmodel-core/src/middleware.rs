//! Pre/post hook chains around document lifecycle operations.
//!
//! Every [`HookPoint`] has two ordered lists of hooks. Hooks in one phase run in
//! registration order until one returns [`HookFlow::Stop`]; the remaining hooks of that
//! phase are skipped. The operation itself always runs: a hook observes and validates,
//! it cannot veto.

use async_trait::async_trait;
use bson::Document;
use std::{collections::HashMap, fmt, sync::Arc};

use crate::{
    backend::{Namespace, StoreBackend},
    error::ModelError,
    transaction::SessionRef,
};

/// Operations a hook can be attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookPoint {
    Save,
    UpdateOne,
    UpdateMany,
    ReplaceOne,
    DeleteOne,
    DeleteMany,
    FindOneAndUpdate,
    FindOneAndReplace,
    FindOneAndDelete,
    Find,
}

impl HookPoint {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookPoint::Save => "save",
            HookPoint::UpdateOne => "updateOne",
            HookPoint::UpdateMany => "updateMany",
            HookPoint::ReplaceOne => "replaceOne",
            HookPoint::DeleteOne => "deleteOne",
            HookPoint::DeleteMany => "deleteMany",
            HookPoint::FindOneAndUpdate => "findOneAndUpdate",
            HookPoint::FindOneAndReplace => "findOneAndReplace",
            HookPoint::FindOneAndDelete => "findOneAndDelete",
            HookPoint::Find => "find",
        }
    }
}

impl fmt::Display for HookPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether the remaining hooks of a phase should run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookFlow {
    Continue,
    Stop,
}

impl From<bool> for HookFlow {
    fn from(proceed: bool) -> Self {
        if proceed { HookFlow::Continue } else { HookFlow::Stop }
    }
}

/// Arguments seen by a pre hook.
#[derive(Debug)]
pub struct PreContext<'a> {
    pub point: HookPoint,
    /// Catalog name of the entity.
    pub entity: &'a str,
    pub namespace: &'a Namespace,
    /// Effective filter, absent for saves.
    pub filter: Option<&'a Document>,
    /// Documents to save, the update or replacement document, or the read pipeline.
    pub payload: &'a [Document],
    pub actor: Option<&'a str>,
}

/// Arguments seen by a post hook.
pub struct PostContext<'a> {
    pub point: HookPoint,
    pub entity: &'a str,
    pub namespace: &'a Namespace,
    pub filter: Option<&'a Document>,
    pub payload: &'a [Document],
    /// Documents produced by the operation: saved documents, returned images or rows read.
    pub documents: &'a [Document],
    /// Number of rows matched or removed, where the operation reports one.
    pub affected: u64,
    /// The error the operation failed with, if it failed.
    pub error: Option<&'a ModelError>,
    pub actor: Option<&'a str>,
    /// Connection the operation ran on.
    pub backend: &'a dyn StoreBackend,
    /// Session the operation ran in. Writes made through it join its transaction.
    pub session: Option<&'a SessionRef>,
}

impl fmt::Debug for PostContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostContext")
            .field("point", &self.point)
            .field("entity", &self.entity)
            .field("namespace", &self.namespace)
            .field("affected", &self.affected)
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

/// A hook run before an operation.
#[async_trait]
pub trait PreHook: Send + Sync {
    async fn call(&self, ctx: &PreContext<'_>) -> HookFlow;
}

/// A hook run after an operation.
#[async_trait]
pub trait PostHook: Send + Sync {
    async fn call(&self, ctx: &PostContext<'_>) -> HookFlow;
}

/// Adapts a synchronous closure returning `bool` into a hook.
pub struct FnHook<F>(pub F);

#[async_trait]
impl<F> PreHook for FnHook<F>
where
    F: Fn(&PreContext<'_>) -> bool + Send + Sync,
{
    async fn call(&self, ctx: &PreContext<'_>) -> HookFlow {
        (self.0)(ctx).into()
    }
}

#[async_trait]
impl<F> PostHook for FnHook<F>
where
    F: Fn(&PostContext<'_>) -> bool + Send + Sync,
{
    async fn call(&self, ctx: &PostContext<'_>) -> HookFlow {
        (self.0)(ctx).into()
    }
}

/// The hook lists of one model handle.
#[derive(Clone, Default)]
pub struct Middleware {
    pre: HashMap<HookPoint, Vec<Arc<dyn PreHook>>>,
    post: HashMap<HookPoint, Vec<Arc<dyn PostHook>>>,
}

impl Middleware {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a closure as a pre hook.
    pub fn pre<F>(&mut self, point: HookPoint, hook: F)
    where
        F: Fn(&PreContext<'_>) -> bool + Send + Sync + 'static,
    {
        self.add_pre(point, Arc::new(FnHook(hook)));
    }

    /// Registers a closure as a post hook.
    pub fn post<F>(&mut self, point: HookPoint, hook: F)
    where
        F: Fn(&PostContext<'_>) -> bool + Send + Sync + 'static,
    {
        self.add_post(point, Arc::new(FnHook(hook)));
    }

    pub fn add_pre(&mut self, point: HookPoint, hook: Arc<dyn PreHook>) {
        self.pre.entry(point).or_default().push(hook);
    }

    pub fn add_post(&mut self, point: HookPoint, hook: Arc<dyn PostHook>) {
        self.post.entry(point).or_default().push(hook);
    }

    pub fn is_empty(&self) -> bool {
        self.pre.values().all(Vec::is_empty) && self.post.values().all(Vec::is_empty)
    }

    /// Runs the pre hooks of `ctx.point` and returns how many were called.
    pub async fn run_pre(&self, ctx: &PreContext<'_>) -> usize {
        let mut called = 0;
        for hook in self.pre.get(&ctx.point).into_iter().flatten() {
            called += 1;
            if hook.call(ctx).await == HookFlow::Stop {
                tracing::debug!(point = %ctx.point, called, "pre hook chain stopped");
                break;
            }
        }
        called
    }

    /// Runs the post hooks of `ctx.point` and returns how many were called.
    pub async fn run_post(&self, ctx: &PostContext<'_>) -> usize {
        let mut called = 0;
        for hook in self.post.get(&ctx.point).into_iter().flatten() {
            called += 1;
            if hook.call(ctx).await == HookFlow::Stop {
                tracing::debug!(point = %ctx.point, called, "post hook chain stopped");
                break;
            }
        }
        called
    }
}

impl fmt::Debug for Middleware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pre: HashMap<_, _> = self.pre.iter().map(|(k, v)| (k, v.len())).collect();
        let post: HashMap<_, _> = self.post.iter().map(|(k, v)| (k, v.len())).collect();
        f.debug_struct("Middleware")
            .field("pre", &pre)
            .field("post", &post)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter(middleware: &mut Middleware, hits: &Arc<AtomicUsize>, proceed: bool) {
        let hits = hits.clone();
        middleware.pre(HookPoint::Save, move |_| {
            hits.fetch_add(1, Ordering::SeqCst);
            proceed
        });
    }

    #[tokio::test]
    async fn test_pre_chain_stops_after_false() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut middleware = Middleware::new();
        counter(&mut middleware, &hits, true);
        counter(&mut middleware, &hits, false);
        counter(&mut middleware, &hits, true);

        let namespace = Namespace::new("db", "users");
        let ctx = PreContext {
            point: HookPoint::Save,
            entity: "users",
            namespace: &namespace,
            filter: None,
            payload: &[],
            actor: None,
        };

        assert_eq!(middleware.run_pre(&ctx).await, 2);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_hooks_are_scoped_to_their_point() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut middleware = Middleware::new();
        counter(&mut middleware, &hits, true);

        let namespace = Namespace::new("db", "users");
        let ctx = PreContext {
            point: HookPoint::DeleteOne,
            entity: "users",
            namespace: &namespace,
            filter: None,
            payload: &[],
            actor: None,
        };

        assert_eq!(middleware.run_pre(&ctx).await, 0);
        assert!(!middleware.is_empty());
    }

    #[test]
    fn test_flow_from_bool() {
        assert_eq!(HookFlow::from(true), HookFlow::Continue);
        assert_eq!(HookFlow::from(false), HookFlow::Stop);
    }
}
