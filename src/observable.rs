//! The observability hook: a minimal subscribe/emit interface a handler can
//! use to tell the engine "this query changed out from under you," wired
//! straight to `graph.invalidate`.

use crate::query::QueryId;

/// A small multi-producer/multi-consumer broadcast of changed query ids,
/// built on `tokio::sync::broadcast` the way the rest of the crate's async
/// surface leans on `tokio`/`futures` rather than a hand-rolled channel.
pub struct ChangeStream {
    tx: tokio::sync::broadcast::Sender<QueryId>,
}

impl ChangeStream {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = tokio::sync::broadcast::channel(capacity.max(1));
        ChangeStream { tx }
    }

    /// Announces that `query` changed; every current subscriber observes it.
    pub fn emit(&self, query: QueryId) {
        // A send with no subscribers is not an error: nothing is listening
        // yet, which is fine before the engine's watcher task is spawned.
        let _ = self.tx.send(query);
    }

    pub fn subscribe(&self) -> ChangeSubscription {
        ChangeSubscription(self.tx.subscribe())
    }
}

impl Default for ChangeStream {
    fn default() -> Self {
        Self::new(64)
    }
}

/// A single subscriber's view of a [`ChangeStream`].
pub struct ChangeSubscription(tokio::sync::broadcast::Receiver<QueryId>);

impl ChangeSubscription {
    /// Awaits the next change, or `None` once the stream's sender is gone.
    /// Lagging subscribers (the receiver fell behind and dropped messages)
    /// simply skip ahead rather than erroring, since a missed notification
    /// is always safe to paper over with a later `invalidate`.
    pub async fn recv(&mut self) -> Option<QueryId> {
        loop {
            match self.0.recv().await {
                Ok(id) => return Some(id),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Implemented by handlers that can tell the engine when one of their
/// queries has changed, rather than only answering `evaluate` on demand.
pub trait Observable: Send + Sync {
    fn changes(&self) -> ChangeSubscription;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug, PartialEq, Eq, Hash)]
    struct Noop;
    impl crate::query::Query for Noop {
        type Value = ();
    }

    #[tokio::test]
    async fn subscribers_observe_emitted_changes() {
        let stream = ChangeStream::new(8);
        let mut sub = stream.subscribe();
        stream.emit(QueryId::new(Noop));
        let seen = sub.recv().await;
        assert_eq!(seen, Some(QueryId::new(Noop)));
    }
}
