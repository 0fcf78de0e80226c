//! Query identity: the structural key every node in the dependency graph is
//! addressed by, plus the type erasure that lets the graph and engine store
//! queries of unrelated concrete types in the same map.

use std::any::{Any, TypeId};
use std::fmt;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::pin::Pin;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::error::{EngineError, HandlerError};
use crate::handler::EvalContext;

/// A request for a memoized value, keyed structurally on its concrete type
/// and field values (its "runtime class" in the terms the graph reasons in).
///
/// Implementors are almost always small `#[derive(Clone, Debug, PartialEq,
/// Eq, Hash)]` structs; the trait carries no methods of its own beyond the
/// associated `Value` and the optional self-handling hook.
pub trait Query: fmt::Debug + Clone + Eq + Hash + Send + Sync + 'static {
    /// The value this query resolves to once evaluated.
    type Value: Clone + fmt::Debug + PartialEq + Send + Sync + 'static;

    /// Built-in handler consulted only when no handler has been registered
    /// for this query's class. Returning `None` (the default) means the
    /// engine falls through to `QueryNotHandled`.
    fn self_handle<'a>(
        &'a self,
        _ctx: &'a EvalContext<'a>,
    ) -> Option<Pin<Box<dyn Future<Output = Result<Self::Value, HandlerError>> + Send + 'a>>> {
        None
    }
}

/// Object-safe counterpart of [`Query`], implemented generically for every
/// `Q: Query` so a `Box<dyn ErasedQuery>` can live in a single map regardless
/// of which concrete query type it holds.
pub(crate) trait ErasedQuery: Any + fmt::Debug + Send + Sync {
    fn eq_erased(&self, other: &dyn ErasedQuery) -> bool;
    fn hash_erased(&self, state: &mut dyn Hasher);
    fn as_any(&self) -> &dyn Any;
    fn clone_erased(&self) -> Box<dyn ErasedQuery>;
    fn class_id(&self) -> TypeId;
    /// Compares two erased cached values as this query's `Value` type, used
    /// by the graph to decide whether a `put` actually changed anything.
    fn values_equal(&self, old: &dyn Any, new: &dyn Any) -> bool;
    /// Invokes this query's own [`Query::self_handle`], if it has one,
    /// erasing the result the same way a registered handler's result is
    /// erased.
    fn self_handle_erased<'a>(
        &'a self,
        ctx: &'a EvalContext<'a>,
    ) -> Option<BoxFuture<'a, Result<Arc<dyn Any + Send + Sync>, EngineError>>>;
}

impl<Q: Query> ErasedQuery for Q {
    fn eq_erased(&self, other: &dyn ErasedQuery) -> bool {
        other
            .as_any()
            .downcast_ref::<Q>()
            .map_or(false, |o| self == o)
    }

    fn hash_erased(&self, mut state: &mut dyn Hasher) {
        // `&mut dyn Hasher` implements `Hasher` via std's blanket impl for
        // `&mut H`, so this reborrow satisfies `Hash::hash`'s generic bound.
        TypeId::of::<Q>().hash(&mut state);
        Hash::hash(self, &mut state);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn clone_erased(&self) -> Box<dyn ErasedQuery> {
        Box::new(self.clone())
    }

    fn class_id(&self) -> TypeId {
        TypeId::of::<Q>()
    }

    fn values_equal(&self, old: &dyn Any, new: &dyn Any) -> bool {
        match (old.downcast_ref::<Q::Value>(), new.downcast_ref::<Q::Value>()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }

    fn self_handle_erased<'a>(
        &'a self,
        ctx: &'a EvalContext<'a>,
    ) -> Option<BoxFuture<'a, Result<Arc<dyn Any + Send + Sync>, EngineError>>> {
        let fut = Query::self_handle(self, ctx)?;
        Some(Box::pin(async move {
            fut.await
                .map(|v| Arc::new(v) as Arc<dyn Any + Send + Sync>)
                .map_err(EngineError::from)
        }))
    }
}

/// A type-erased, cheaply-cloneable query identity. This is the key type the
/// graph, engine, and serializer all index on.
#[derive(Clone)]
pub struct QueryId(pub(crate) Arc<dyn ErasedQuery>);

impl QueryId {
    pub fn new<Q: Query>(query: Q) -> Self {
        QueryId(Arc::new(query))
    }

    /// Recovers the concrete query if this id was built from a `Q`.
    pub fn downcast_ref<Q: Query>(&self) -> Option<&Q> {
        self.0.as_any().downcast_ref::<Q>()
    }

    /// The `TypeId` of the concrete query class, used for handler dispatch
    /// and serializer-codec lookup.
    pub fn class_id(&self) -> TypeId {
        self.0.class_id()
    }

    pub(crate) fn values_equal(&self, old: &dyn Any, new: &dyn Any) -> bool {
        self.0.values_equal(old, new)
    }

    pub(crate) fn self_handle_erased<'a>(
        &'a self,
        ctx: &'a EvalContext<'a>,
    ) -> Option<BoxFuture<'a, Result<Arc<dyn Any + Send + Sync>, EngineError>>> {
        self.0.self_handle_erased(ctx)
    }
}

impl PartialEq for QueryId {
    fn eq(&self, other: &Self) -> bool {
        self.0.eq_erased(&*other.0)
    }
}

impl Eq for QueryId {}

impl Hash for QueryId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash_erased(state)
    }
}

impl fmt::Debug for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}
