//! The handler registry: a `TypeId`-keyed map from query class to the
//! object that knows how to compute it, dispatched dynamically the way
//! `salsa-2022`'s `Ingredient::assert_type` dispatches by downcasting a
//! `dyn Any` behind a known `TypeId` check.

use std::any::{Any, TypeId};
use std::sync::Arc;

use async_trait::async_trait;

use crate::engine::QueryEngine;
use crate::error::{EngineError, HandlerError};
use crate::query::{Query, QueryId};
use crate::util::{FxHashMap, FxIndexSet};

/// The context a handler runs with. Every nested `evaluate` call made
/// through it is captured as a dependency of the query currently being
/// computed — this *is* how the engine discovers the dependency edges it
/// records in the graph.
pub struct EvalContext<'e> {
    engine: &'e QueryEngine,
    captured: parking_lot::Mutex<FxIndexSet<QueryId>>,
}

impl<'e> EvalContext<'e> {
    pub(crate) fn new(engine: &'e QueryEngine) -> Self {
        EvalContext {
            engine,
            captured: parking_lot::Mutex::new(FxIndexSet::default()),
        }
    }

    /// Evaluates a nested query, recording it as a dependency of whichever
    /// query this context belongs to.
    pub async fn evaluate<Q: Query>(&self, query: Q) -> Result<Q::Value, EngineError> {
        let id = QueryId::new(query.clone());
        self.captured.lock().insert(id);
        self.engine.evaluate(query).await
    }

    pub(crate) fn into_captured(self) -> FxIndexSet<QueryId> {
        self.captured.into_inner()
    }
}

/// Implemented by clients for each query class they want to serve results
/// for. Registered with [`EngineBuilder::with_handler`].
#[async_trait]
pub trait Handler<Q: Query>: Send + Sync {
    async fn handle(&self, query: &Q, ctx: &EvalContext<'_>) -> Result<Q::Value, HandlerError>;
}

/// A `Handler` registered via [`EngineBuilder::discover`] must also be
/// default-constructible; there is no runtime reflection in Rust, so
/// "discovery" here means "the caller names the query/handler pair and the
/// builder constructs it," rather than scanning annotations.
pub trait Canonical<Q: Query>: Handler<Q> + Default + 'static {}
impl<Q: Query, H: Handler<Q> + Default + 'static> Canonical<Q> for H {}

#[async_trait]
pub(crate) trait ErasedHandler: Send + Sync {
    async fn handle(
        &self,
        query: &QueryId,
        ctx: &EvalContext<'_>,
    ) -> Result<Arc<dyn Any + Send + Sync>, EngineError>;
}

struct HandlerAdapter<Q: Query, H> {
    handler: H,
    _marker: std::marker::PhantomData<fn() -> Q>,
}

#[async_trait]
impl<Q, H> ErasedHandler for HandlerAdapter<Q, H>
where
    Q: Query,
    H: Handler<Q>,
{
    async fn handle(
        &self,
        query: &QueryId,
        ctx: &EvalContext<'_>,
    ) -> Result<Arc<dyn Any + Send + Sync>, EngineError> {
        let typed = query
            .downcast_ref::<Q>()
            .expect("handler registry dispatched to the wrong handler; this is a bug");
        self.handler
            .handle(typed, ctx)
            .await
            .map(|v| Arc::new(v) as Arc<dyn Any + Send + Sync>)
            .map_err(EngineError::from)
    }
}

/// Owns one handler per registered query class.
pub(crate) struct HandlerRegistry {
    handlers: FxHashMap<TypeId, Box<dyn ErasedHandler>>,
}

impl HandlerRegistry {
    pub(crate) fn lookup(&self, class: TypeId) -> Option<&dyn ErasedHandler> {
        self.handlers.get(&class).map(|b| b.as_ref())
    }
}

/// Builds a [`QueryEngine`], rejecting a second handler for a class that
/// already has one (see [`EngineError::MultipleHandlers`]).
pub struct EngineBuilder {
    handlers: FxHashMap<TypeId, Box<dyn ErasedHandler>>,
    graph: Option<crate::graph::Graph>,
    observers: Vec<Box<dyn FnOnce(&QueryEngine) + Send>>,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineBuilder {
    pub fn new() -> Self {
        EngineBuilder {
            handlers: FxHashMap::default(),
            graph: None,
            observers: Vec::new(),
        }
    }

    pub fn with_graph(mut self, graph: crate::graph::Graph) -> Self {
        self.graph = Some(graph);
        self
    }

    pub fn with_handler<Q, H>(mut self, handler: H) -> Result<Self, EngineError>
    where
        Q: Query,
        H: Handler<Q> + 'static,
    {
        let class = TypeId::of::<Q>();
        if self.handlers.contains_key(&class) {
            return Err(EngineError::MultipleHandlers(std::any::type_name::<Q>()));
        }
        self.handlers.insert(
            class,
            Box::new(HandlerAdapter::<Q, H> {
                handler,
                _marker: std::marker::PhantomData,
            }),
        );
        Ok(self)
    }

    /// Registers `H`'s `Default` instance as the handler for `Q`, the
    /// closest Rust equivalent of an annotation-driven discovery pass.
    pub fn discover<Q, H>(self) -> Result<Self, EngineError>
    where
        Q: Query,
        H: Canonical<Q>,
    {
        self.with_handler::<Q, H>(H::default())
    }

    /// Registers a handler that also emits change notifications; once the
    /// engine is built, a background task forwards every change into
    /// `graph.invalidate`.
    pub fn with_observable_handler<Q, H>(mut self, handler: Arc<H>) -> Result<Self, EngineError>
    where
        Q: Query,
        H: Handler<Q> + crate::observable::Observable + 'static,
    {
        let class = TypeId::of::<Q>();
        if self.handlers.contains_key(&class) {
            return Err(EngineError::MultipleHandlers(std::any::type_name::<Q>()));
        }
        let for_handler = Arc::clone(&handler);
        self.handlers.insert(
            class,
            Box::new(ArcHandlerAdapter::<Q, H> {
                handler: for_handler,
                _marker: std::marker::PhantomData,
            }),
        );
        self.observers.push(Box::new(move |engine: &QueryEngine| {
            engine.watch(handler.changes());
        }));
        Ok(self)
    }

    pub fn build(self) -> QueryEngine {
        let registry = HandlerRegistry {
            handlers: self.handlers,
        };
        let graph = self.graph.unwrap_or_default();
        let engine = QueryEngine::new(graph, registry);
        for observer in self.observers {
            observer(&engine);
        }
        engine
    }
}

struct ArcHandlerAdapter<Q: Query, H> {
    handler: Arc<H>,
    _marker: std::marker::PhantomData<fn() -> Q>,
}

#[async_trait]
impl<Q, H> ErasedHandler for ArcHandlerAdapter<Q, H>
where
    Q: Query,
    H: Handler<Q>,
{
    async fn handle(
        &self,
        query: &QueryId,
        ctx: &EvalContext<'_>,
    ) -> Result<Arc<dyn Any + Send + Sync>, EngineError> {
        let typed = query
            .downcast_ref::<Q>()
            .expect("handler registry dispatched to the wrong handler; this is a bug");
        self.handler
            .handle(typed, ctx)
            .await
            .map(|v| Arc::new(v) as Arc<dyn Any + Send + Sync>)
            .map_err(EngineError::from)
    }
}

