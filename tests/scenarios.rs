//! End-to-end scenarios: cache hit, concurrent dedup, changed/unchanged
//! invalidation, failure memoization, and a serializer round trip.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use flowquery::{EngineBuilder, EvalContext, Handler, HandlerError, Serializer};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
struct T(i64);
impl flowquery::Query for T {
    type Value = i64;
}

#[derive(Debug)]
struct Boom;
impl std::fmt::Display for Boom {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "boom")
    }
}
impl std::error::Error for Boom {}

struct CountingHandler {
    calls: Arc<AtomicUsize>,
    delay: Duration,
    fails: bool,
}

#[async_trait]
impl Handler<T> for CountingHandler {
    async fn handle(&self, query: &T, _ctx: &EvalContext<'_>) -> Result<i64, HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fails {
            return Err(HandlerError::new(Boom));
        }
        Ok(query.0 * 2)
    }
}

#[tokio::test]
async fn scenario_cache_hit_does_not_reinvoke_the_handler() {
    let calls = Arc::new(AtomicUsize::new(0));
    let engine = EngineBuilder::new()
        .with_handler::<T, _>(CountingHandler {
            calls: calls.clone(),
            delay: Duration::ZERO,
            fails: false,
        })
        .unwrap()
        .build();

    assert_eq!(engine.evaluate(T(1)).await.unwrap(), 2);
    assert_eq!(engine.evaluate(T(1)).await.unwrap(), 2);
    assert_eq!(engine.evaluate(T(1)).await.unwrap(), 2);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn scenario_concurrent_requests_dedup_to_a_single_call() {
    let calls = Arc::new(AtomicUsize::new(0));
    let engine = EngineBuilder::new()
        .with_handler::<T, _>(CountingHandler {
            calls: calls.clone(),
            delay: Duration::from_millis(50),
            fails: false,
        })
        .unwrap()
        .build();

    let start = Instant::now();
    let (a, b, c) = tokio::join!(
        engine.evaluate(T(2)),
        engine.evaluate(T(2)),
        engine.evaluate(T(2))
    );
    let elapsed = start.elapsed();

    assert_eq!(a.unwrap(), 4);
    assert_eq!(b.unwrap(), 4);
    assert_eq!(c.unwrap(), 4);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    // Three deduped waiters on a 50ms handler should finish close to 50ms,
    // not ~150ms — the handler only ever ran once.
    assert!(elapsed < Duration::from_millis(140), "elapsed={:?}", elapsed);
}

#[tokio::test]
async fn scenario_changed_value_strongly_invalidates_direct_dependents() {
    let engine = EngineBuilder::new().build();
    engine.graph().put(T(1), Ok(10i64), []);
    let mut deps = std::collections::HashSet::new();
    deps.insert(flowquery::QueryId::new(T(1)));
    engine
        .graph()
        .put(T(2), Ok(20i64), deps.into_iter().collect::<Vec<_>>());

    assert_eq!(engine.graph().validity(&T(2)), flowquery::Validity::Valid);

    engine.graph().put(T(1), Ok(99i64), []);
    assert_eq!(
        engine.graph().validity(&T(2)),
        flowquery::Validity::StronglyInvalid
    );
}

#[tokio::test]
async fn scenario_unchanged_value_does_not_invalidate_dependents() {
    let engine = EngineBuilder::new().build();
    engine.graph().put(T(1), Ok(10i64), []);
    engine
        .graph()
        .put(T(2), Ok(20i64), vec![flowquery::QueryId::new(T(1))]);

    // Re-`put`-ting the same value for T(1) must not be treated as a change.
    engine.graph().put(T(1), Ok(10i64), []);
    assert_eq!(engine.graph().validity(&T(2)), flowquery::Validity::Valid);
}

#[tokio::test]
async fn scenario_failures_are_memoized_and_rethrown_until_invalidated() {
    let calls = Arc::new(AtomicUsize::new(0));
    let engine = EngineBuilder::new()
        .with_handler::<T, _>(CountingHandler {
            calls: calls.clone(),
            delay: Duration::ZERO,
            fails: true,
        })
        .unwrap()
        .build();

    assert!(engine.evaluate(T(3)).await.is_err());
    assert!(engine.evaluate(T(3)).await.is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    engine.graph().invalidate(&T(3));
    assert!(engine.evaluate(T(3)).await.is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn scenario_serializer_round_trips_a_three_node_chain() {
    let graph = flowquery::Graph::new();
    graph.put(T(1), Ok(2i64), []);
    graph.put(T(2), Ok(4i64), vec![flowquery::QueryId::new(T(1))]);
    graph.put(T(3), Ok(8i64), vec![flowquery::QueryId::new(T(2))]);

    let mut serializer = Serializer::new();
    serializer.add_value_serializer::<T>("t").unwrap();

    let text = serializer.dump_text(&graph).unwrap();
    let reloaded = flowquery::Graph::new();
    serializer.load_text(&text, &reloaded).unwrap();

    assert_eq!(reloaded.get(&T(1)).unwrap().unwrap(), 2);
    assert_eq!(reloaded.get(&T(2)).unwrap().unwrap(), 4);
    assert_eq!(reloaded.get(&T(3)).unwrap().unwrap(), 8);
    assert_eq!(reloaded.validity(&T(3)), flowquery::Validity::Valid);
    assert_eq!(
        reloaded.deps(&T(3)),
        vec![flowquery::QueryId::new(T(2))]
    );
}
