//! The query engine: demand-driven `evaluate`, in-flight dedup over a
//! mutex-guarded map of shared futures, and the three-path state machine
//! (weak fast path / cached-valid path / recompute path) described by the
//! data model's validity lattice.

use std::any::Any;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;

use crate::error::EngineError;
use crate::graph::{ErasedResult, Graph};
use crate::handler::{EvalContext, HandlerRegistry};
use crate::observable::ChangeSubscription;
use crate::query::{Query, QueryId};
use crate::util::FxHashMap;
use crate::validity::Validity;

type PendingFuture = Shared<BoxFuture<'static, Result<Arc<dyn Any + Send + Sync>, EngineError>>>;

struct Inner {
    graph: Graph,
    handlers: HandlerRegistry,
    pending: Mutex<FxHashMap<QueryId, PendingFuture>>,
}

/// The demand-driven evaluator. Cheap to clone — every clone shares the
/// same graph, handler registry, and in-flight dedup map.
#[derive(Clone)]
pub struct QueryEngine {
    inner: Arc<Inner>,
}

impl QueryEngine {
    pub(crate) fn new(graph: Graph, handlers: HandlerRegistry) -> Self {
        QueryEngine {
            inner: Arc::new(Inner {
                graph,
                handlers,
                pending: Mutex::new(FxHashMap::default()),
            }),
        }
    }

    /// The backing graph, for callers that want to read validity/edges
    /// directly or hand it to a [`crate::serializer::Serializer`].
    pub fn graph(&self) -> &Graph {
        &self.inner.graph
    }

    /// Subscribes to a handler's change notifications and forwards every
    /// one into `graph.invalidate`. Requires a `tokio` runtime to be
    /// active, since it spawns a background task for the lifetime of the
    /// subscription.
    pub(crate) fn watch(&self, mut sub: ChangeSubscription) {
        let engine = self.clone();
        tokio::spawn(async move {
            while let Some(id) = sub.recv().await {
                engine.inner.graph.invalidate_id(&id);
            }
        });
    }

    /// Resolves `query`, memoizing the result and recording every nested
    /// `evaluate` call made by its handler as a dependency.
    pub async fn evaluate<Q: Query>(&self, query: Q) -> Result<Q::Value, EngineError> {
        let id = QueryId::new(query);
        let erased = self.dispatch(id).await?;
        let value = erased
            .downcast::<Q::Value>()
            .unwrap_or_else(|_| panic!("query class registered under the wrong Value type"));
        Ok((*value).clone())
    }

    /// Dedup layer: concurrent callers asking for the same query id share
    /// one in-flight future, the way gluon-salsa's `Slot::InProgress`
    /// shares one computation among waiters, generalized here to a plain
    /// `futures::future::Shared` since there is no per-query generated type.
    async fn dispatch(&self, id: QueryId) -> Result<Arc<dyn Any + Send + Sync>, EngineError> {
        let shared = {
            let mut pending = self.inner.pending.lock();
            if let Some(existing) = pending.get(&id) {
                existing.clone()
            } else {
                let engine = self.clone();
                let id_for_task = id.clone();
                let fut: BoxFuture<'static, Result<Arc<dyn Any + Send + Sync>, EngineError>> =
                    Box::pin(async move { engine.evaluate_uncached(id_for_task).await });
                let shared = fut.shared();
                pending.insert(id.clone(), shared.clone());
                shared
            }
        };
        let result = shared.await;
        // Idempotent: whichever caller finishes first removes the entry;
        // later callers landing here just no-op.
        self.inner.pending.lock().remove(&id);
        result
    }

    async fn evaluate_uncached(
        &self,
        id: QueryId,
    ) -> Result<Arc<dyn Any + Send + Sync>, EngineError> {
        // (a) weak fast path: a WEAKLY_INVALID node re-probes its direct
        // deps (dependency-probe errors are swallowed — the dependency's
        // own state update is what matters) and promotes back to VALID if
        // every dep settles on VALID.
        if self.inner.graph.validity_of(&id) == Validity::WeaklyInvalid {
            log::debug!("engine: weak fast path for {:?}", id);
            for dep in self.inner.graph.deps_of(&id) {
                let _ = self.dispatch(dep).await;
                if self.inner.graph.validity_of(&id) == Validity::StronglyInvalid {
                    break;
                }
            }
            if self.inner.graph.validate_weak_id(&id) {
                if let Some(result) = self.inner.graph.get_erased(&id) {
                    return Self::unwrap_cached(result);
                }
            }
        }

        // (b) cached-valid path.
        if self.inner.graph.validity_of(&id) == Validity::Valid {
            if let Some(result) = self.inner.graph.get_erased(&id) {
                return Self::unwrap_cached(result);
            }
        }

        // (c) recompute path.
        log::info!("engine: recomputing {:?}", id);
        let ctx = EvalContext::new(self);
        let outcome = match self.inner.handlers.lookup(id.class_id()) {
            Some(handler) => handler.handle(&id, &ctx).await,
            None => match id.self_handle_erased(&ctx) {
                Some(fut) => fut.await,
                None => Err(EngineError::QueryNotHandled(id.clone())),
            },
        };
        let deps = ctx.into_captured();
        match &outcome {
            Ok(value) => self.inner.graph.put_erased(
                id.clone(),
                ErasedResult::Success(value.clone()),
                deps,
                Validity::Valid,
            ),
            Err(err @ EngineError::Failed(_)) => self.inner.graph.put_erased(
                id.clone(),
                ErasedResult::Failure(err.clone()),
                deps,
                Validity::Valid,
            ),
            // `QueryNotHandled`/`MultipleHandlers`/`CyclicDependency` are
            // dispatch-time errors, not a handler result — nothing to cache.
            Err(_) => {}
        }
        outcome
    }

    fn unwrap_cached(result: ErasedResult) -> Result<Arc<dyn Any + Send + Sync>, EngineError> {
        match result {
            ErasedResult::Success(v) => Ok(v),
            ErasedResult::Failure(e) => Err(e),
        }
    }
}
