use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rand::seq::SliceRandom;
use rand::Rng;

use flowquery::{EngineBuilder, EvalContext, Handler, HandlerError, Query, QueryEngine};

const N_MUTATOR_OPS: usize = 100;
const N_READER_OPS: usize = 50;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct AQuery(usize);
impl Query for AQuery {
    type Value = usize;
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct BQuery(usize);
impl Query for BQuery {
    type Value = usize;
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct CQuery(usize);
impl Query for CQuery {
    type Value = usize;
}

struct AHandler {
    store: Arc<Mutex<Vec<usize>>>,
}

#[async_trait]
impl Handler<AQuery> for AHandler {
    async fn handle(&self, query: &AQuery, _ctx: &EvalContext<'_>) -> Result<usize, HandlerError> {
        Ok(self.store.lock().unwrap()[query.0])
    }
}

struct BHandler;

#[async_trait]
impl Handler<BQuery> for BHandler {
    async fn handle(&self, query: &BQuery, ctx: &EvalContext<'_>) -> Result<usize, HandlerError> {
        ctx.evaluate(AQuery(query.0))
            .await
            .map_err(|e| HandlerError::new(StressError(e.to_string())))
    }
}

struct CHandler;

#[async_trait]
impl Handler<CQuery> for CHandler {
    async fn handle(&self, query: &CQuery, ctx: &EvalContext<'_>) -> Result<usize, HandlerError> {
        ctx.evaluate(BQuery(query.0))
            .await
            .map_err(|e| HandlerError::new(StressError(e.to_string())))
    }
}

#[derive(Debug)]
struct StressError(String);
impl std::fmt::Display for StressError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
impl std::error::Error for StressError {}

#[derive(Clone, Copy, Debug)]
enum QueryKind {
    A,
    B,
    C,
}

impl rand::distributions::Distribution<QueryKind> for rand::distributions::Standard {
    fn sample<R: rand::Rng + ?Sized>(&self, rng: &mut R) -> QueryKind {
        *[QueryKind::A, QueryKind::B, QueryKind::C]
            .choose(rng)
            .unwrap()
    }
}

enum MutatorOp {
    Write { key: usize, value: usize },
    LaunchReader { ops: Vec<(QueryKind, usize)> },
}

fn random_mutator_op(rng: &mut impl Rng) -> MutatorOp {
    if rng.gen_bool(0.5) {
        MutatorOp::Write {
            key: rng.gen_range(0..10),
            value: rng.gen_range(0..1000),
        }
    } else {
        let ops = (0..N_READER_OPS)
            .map(|_| (rng.gen::<QueryKind>(), rng.gen_range(0..10)))
            .collect();
        MutatorOp::LaunchReader { ops }
    }
}

fn run_reader(rt: &tokio::runtime::Runtime, engine: &QueryEngine, ops: Vec<(QueryKind, usize)>) {
    rt.block_on(async {
        for (kind, key) in ops {
            match kind {
                QueryKind::A => {
                    let _ = engine.evaluate(AQuery(key)).await;
                }
                QueryKind::B => {
                    let _ = engine.evaluate(BQuery(key)).await;
                }
                QueryKind::C => {
                    let _ = engine.evaluate(CQuery(key)).await;
                }
            }
        }
    });
}

/// Hammers the engine with concurrent reads (through all three query
/// layers) interleaved with writes that invalidate the bottom layer, the
/// way gluon-salsa's stress test interleaves `set_a` with reader snapshots
/// racing on `a`/`b`/`c`. There is nothing here to assert beyond "it
/// doesn't panic or deadlock, and the final values match the store" — the
/// value of this test is in running it under a race detector, not the
/// assertions below.
#[test]
fn stress_test() {
    let store = Arc::new(Mutex::new(vec![0usize; 10]));
    let engine = EngineBuilder::new()
        .with_handler::<AQuery, _>(AHandler {
            store: store.clone(),
        })
        .unwrap()
        .with_handler::<BQuery, _>(BHandler)
        .unwrap()
        .with_handler::<CQuery, _>(CHandler)
        .unwrap()
        .build();

    let rt = tokio::runtime::Runtime::new().unwrap();
    rt.block_on(async {
        for key in 0..10 {
            let _ = engine.evaluate(AQuery(key)).await;
        }
    });

    let mut rng = rand::thread_rng();
    let ops: Vec<MutatorOp> = (0..N_MUTATOR_OPS)
        .map(|_| random_mutator_op(&mut rng))
        .collect();

    let mut readers = Vec::new();
    for op in ops {
        match op {
            MutatorOp::Write { key, value } => {
                store.lock().unwrap()[key] = value;
                engine.graph().invalidate(&AQuery(key));
            }
            MutatorOp::LaunchReader { ops } => {
                let engine = engine.clone();
                readers.push(std::thread::spawn(move || {
                    let rt = tokio::runtime::Runtime::new().unwrap();
                    run_reader(&rt, &engine, ops);
                }));
            }
        }
    }

    for reader in readers {
        reader.join().unwrap();
    }

    rt.block_on(async {
        for key in 0..10 {
            let value = engine.evaluate(CQuery(key)).await.unwrap();
            assert_eq!(value, store.lock().unwrap()[key]);
        }
    });
}
