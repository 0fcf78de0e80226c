//! Error taxonomy for the engine. Hand-rolled `Display`/`std::error::Error`
//! impls, in the style of gluon-salsa's `CycleError<K>`, rather than a
//! `thiserror` derive — every variant carries exactly the context the
//! caller needs to decide what to do next.

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

use crate::query::QueryId;

/// A handler's own failure, captured once and cheaply clonable so the same
/// error can be memoized in the graph and replayed to every deduped waiter.
#[derive(Clone)]
pub struct HandlerError(Arc<dyn StdError + Send + Sync>);

impl HandlerError {
    pub fn new<E: StdError + Send + Sync + 'static>(err: E) -> Self {
        HandlerError(Arc::new(err))
    }

    pub fn from_arc(err: Arc<dyn StdError + Send + Sync>) -> Self {
        HandlerError(err)
    }

    pub fn inner(&self) -> &(dyn StdError + Send + Sync) {
        &*self.0
    }
}

impl fmt::Debug for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl StdError for HandlerError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.0.source()
    }
}

/// Everything that can go wrong evaluating, registering, or (de)serializing
/// a query graph.
#[derive(Clone)]
pub enum EngineError {
    /// No handler, and no self-handling fallback, claims this query's class.
    QueryNotHandled(QueryId),
    /// A second handler was registered for a class that already had one.
    MultipleHandlers(&'static str),
    /// The in-flight dedup map detected a query waiting on itself.
    CyclicDependency,
    /// The handler ran and returned an error.
    Failed(HandlerError),
    /// A dump/load pass failed at the (de)serialization boundary itself
    /// (malformed JSON, truncated bytes, bad hex), as opposed to the
    /// per-entry skip rules the serializer applies deliberately.
    Serialization(Arc<dyn StdError + Send + Sync>),
}

impl EngineError {
    pub(crate) fn serialization<E: StdError + Send + Sync + 'static>(err: E) -> Self {
        EngineError::Serialization(Arc::new(err))
    }
}

impl fmt::Debug for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::QueryNotHandled(id) => {
                write!(f, "no handler registered for query {:?}", id)
            }
            EngineError::MultipleHandlers(class) => {
                write!(f, "a handler is already registered for `{}`", class)
            }
            EngineError::CyclicDependency => {
                write!(f, "cyclic dependency detected among in-flight queries")
            }
            EngineError::Failed(err) => write!(f, "handler failed: {}", err),
            EngineError::Serialization(err) => write!(f, "serialization failed: {}", err),
        }
    }
}

impl StdError for EngineError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            EngineError::Failed(err) => Some(err),
            EngineError::Serialization(err) => Some(&**err),
            _ => None,
        }
    }
}

impl From<HandlerError> for EngineError {
    fn from(err: HandlerError) -> Self {
        EngineError::Failed(err)
    }
}
