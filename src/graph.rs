//! The dependency graph: a node per query identity, its cached result and
//! validity, and the forward/reverse edge sets invariant (1) in the data
//! model requires (`x in deps(y) <=> y in rev(x)`).
//!
//! The whole map lives behind a single `parking_lot::Mutex`, matching the
//! "graph atomicity" requirement directly: every mutator below runs as one
//! critical section, so a `put`/`invalidate`/`remove`/`validate_weak` is
//! never observed half-applied. BFS traversals (`transitive_deps`,
//! `transitive_dependents`) hold the lock for their whole pass, the same way
//! pantsbuild's `Graph::walk` holds its `Arc<Mutex<InnerGraph>>` guard for
//! the duration of a `Walk`/`LeveledWalk` iteration.

use std::any::{Any, TypeId};
use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::EngineError;
use crate::query::{Query, QueryId};
use crate::util::{FxHashMap, FxHashSet, FxIndexSet};
use crate::validity::Validity;

/// A query's cached outcome, type-erased so the graph can store results for
/// unrelated query classes in one map.
#[derive(Clone)]
pub(crate) enum ErasedResult {
    Success(Arc<dyn Any + Send + Sync>),
    Failure(EngineError),
}

impl ErasedResult {
    fn is_success(&self) -> bool {
        matches!(self, ErasedResult::Success(_))
    }
}

#[derive(Clone)]
struct Node {
    result: Option<ErasedResult>,
    validity: Validity,
    deps: FxIndexSet<QueryId>,
    rev: FxIndexSet<QueryId>,
}

impl Node {
    fn empty() -> Self {
        Node {
            result: None,
            validity: Validity::StronglyInvalid,
            deps: FxIndexSet::default(),
            rev: FxIndexSet::default(),
        }
    }

    fn is_ghost(&self) -> bool {
        self.result.is_none() && self.deps.is_empty() && self.rev.is_empty()
    }
}

/// A read-only snapshot of one node, handed to the serializer so it never
/// has to reach back into the graph's lock while it works out the dump
/// order.
pub(crate) struct NodeSnapshot {
    pub(crate) result: Option<ErasedResult>,
    pub(crate) validity: Validity,
    pub(crate) deps: Vec<QueryId>,
}

/// The shared, mutable store of memoized query results and their
/// dependency edges.
#[derive(Clone)]
pub struct Graph {
    nodes: Arc<Mutex<FxHashMap<QueryId, Node>>>,
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

impl Graph {
    pub fn new() -> Self {
        Graph {
            nodes: Arc::new(Mutex::new(FxHashMap::default())),
        }
    }

    /// A deep copy: mutating the clone never affects `self`.
    pub fn deep_clone(&self) -> Graph {
        let nodes = self.nodes.lock();
        Graph {
            nodes: Arc::new(Mutex::new(nodes.clone())),
        }
    }

    // ---- typed read contract -------------------------------------------------

    pub fn get<Q: Query>(&self, query: &Q) -> Option<Result<Q::Value, EngineError>> {
        let id = QueryId::new(query.clone());
        self.get_erased(&id).map(|r| match r {
            ErasedResult::Success(v) => Ok((*v.downcast_ref::<Q::Value>().expect(
                "query class registered under two different Value types; this is a bug",
            ))
            .clone()),
            ErasedResult::Failure(e) => Err(e),
        })
    }

    pub fn validity<Q: Query>(&self, query: &Q) -> Validity {
        self.validity_of(&QueryId::new(query.clone()))
    }

    pub fn deps<Q: Query>(&self, query: &Q) -> Vec<QueryId> {
        self.deps_of(&QueryId::new(query.clone()))
    }

    pub fn rev<Q: Query>(&self, query: &Q) -> Vec<QueryId> {
        self.rev_of(&QueryId::new(query.clone()))
    }

    // ---- typed write contract ------------------------------------------------

    pub fn put<Q: Query>(
        &self,
        query: Q,
        result: Result<Q::Value, EngineError>,
        deps: impl IntoIterator<Item = QueryId>,
    ) {
        let id = QueryId::new(query);
        let erased = match result {
            Ok(v) => ErasedResult::Success(Arc::new(v)),
            Err(e) => ErasedResult::Failure(e),
        };
        self.put_erased(id, erased, deps.into_iter().collect(), Validity::Valid);
    }

    pub fn invalidate<Q: Query>(&self, query: &Q) {
        self.invalidate_id(&QueryId::new(query.clone()));
    }

    pub fn remove<Q: Query>(&self, query: &Q) {
        self.remove_id(&QueryId::new(query.clone()));
    }

    pub fn validate_weak<Q: Query>(&self, query: &Q) -> bool {
        self.validate_weak_id(&QueryId::new(query.clone()))
    }

    // ---- untyped core, used by the engine and serializer ---------------------

    pub(crate) fn validity_of(&self, id: &QueryId) -> Validity {
        let nodes = self.nodes.lock();
        nodes.get(id).map_or(Validity::StronglyInvalid, |n| n.validity)
    }

    pub(crate) fn get_erased(&self, id: &QueryId) -> Option<ErasedResult> {
        let nodes = self.nodes.lock();
        nodes.get(id).and_then(|n| n.result.clone())
    }

    pub(crate) fn deps_of(&self, id: &QueryId) -> Vec<QueryId> {
        let nodes = self.nodes.lock();
        nodes
            .get(id)
            .map(|n| n.deps.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub(crate) fn rev_of(&self, id: &QueryId) -> Vec<QueryId> {
        let nodes = self.nodes.lock();
        nodes
            .get(id)
            .map(|n| n.rev.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Reachability over `deps` (or `rev`, when `use_rev`), excluding the
    /// start node unless a cycle actually loops back to it. Tolerant of
    /// cycles via the `visited` guard, the way pantsbuild's `Walk` is.
    fn transitive(&self, start: &QueryId, use_rev: bool) -> FxHashSet<QueryId> {
        let nodes = self.nodes.lock();
        let edges_of = |id: &QueryId| -> Vec<QueryId> {
            nodes
                .get(id)
                .map(|n| {
                    if use_rev {
                        n.rev.iter().cloned().collect()
                    } else {
                        n.deps.iter().cloned().collect()
                    }
                })
                .unwrap_or_default()
        };
        let mut result = FxHashSet::default();
        let mut queue: VecDeque<QueryId> = edges_of(start).into();
        while let Some(id) = queue.pop_front() {
            if !result.insert(id.clone()) {
                continue;
            }
            queue.extend(edges_of(&id));
        }
        result
    }

    pub fn transitive_deps(&self, id: &QueryId) -> std::collections::HashSet<QueryId> {
        self.transitive(id, false).into_iter().collect()
    }

    pub fn transitive_dependents(&self, id: &QueryId) -> std::collections::HashSet<QueryId> {
        self.transitive(id, true).into_iter().collect()
    }

    /// A snapshot of every node currently in the graph, keyed by id. Used by
    /// the serializer; mutating the returned map does not affect `self`.
    pub(crate) fn snapshot(&self) -> FxHashMap<QueryId, NodeSnapshot> {
        let nodes = self.nodes.lock();
        nodes
            .iter()
            .filter(|(_, n)| !n.is_ghost())
            .map(|(id, n)| {
                (
                    id.clone(),
                    NodeSnapshot {
                        result: n.result.clone(),
                        validity: n.validity,
                        deps: n.deps.iter().cloned().collect(),
                    },
                )
            })
            .collect()
    }

    /// Direct dependents of `id`, demoted to at least `floor`, propagated
    /// further as `WeaklyInvalid` (never downgrading an existing
    /// `StronglyInvalid`). Shared by `put` (on a changed value),
    /// `invalidate`, and `remove`.
    fn propagate(nodes: &mut FxHashMap<QueryId, Node>, id: &QueryId, direct_floor: Validity) {
        let direct: Vec<QueryId> = nodes
            .get(id)
            .map(|n| n.rev.iter().cloned().collect())
            .unwrap_or_default();
        let mut frontier = direct;
        let mut floor = direct_floor;
        let mut visited: FxHashSet<QueryId> = FxHashSet::default();
        loop {
            let mut next = Vec::new();
            for dependent in &frontier {
                if !visited.insert(dependent.clone()) {
                    continue;
                }
                if let Some(node) = nodes.get_mut(dependent) {
                    node.validity = node.validity.demoted_to_at_least(floor);
                    next.extend(node.rev.iter().cloned());
                }
            }
            if next.is_empty() {
                break;
            }
            frontier = next;
            floor = Validity::WeaklyInvalid;
        }
    }

    pub(crate) fn put_erased(
        &self,
        id: QueryId,
        result: ErasedResult,
        deps: FxIndexSet<QueryId>,
        validity: Validity,
    ) {
        let mut nodes = self.nodes.lock();

        let changed = match nodes.get(&id).and_then(|n| n.result.as_ref()) {
            None => true,
            Some(old) => !Self::results_equal(&id, old, &result),
        };

        let old_deps: FxIndexSet<QueryId> = nodes
            .get(&id)
            .map(|n| n.deps.clone())
            .unwrap_or_default();
        for removed in old_deps.difference(&deps) {
            if let Some(dep_node) = nodes.get_mut(removed) {
                dep_node.rev.shift_remove(&id);
            }
        }
        for added in deps.difference(&old_deps) {
            nodes
                .entry(added.clone())
                .or_insert_with(Node::empty)
                .rev
                .insert(id.clone());
        }

        let entry = nodes.entry(id.clone()).or_insert_with(Node::empty);
        entry.result = Some(result);
        entry.deps = deps;
        entry.validity = validity;

        if changed {
            log::debug!("graph: put changed {:?}, propagating invalidation", id);
            Self::propagate(&mut nodes, &id, Validity::StronglyInvalid);
        }
    }

    /// Two failures are always treated as "changed" — there is no generic
    /// equality over boxed handler errors, and conservatively re-propagating
    /// on every failing recompute is always correct, if not maximally sparse.
    fn results_equal(id: &QueryId, a: &ErasedResult, b: &ErasedResult) -> bool {
        match (a, b) {
            (ErasedResult::Success(old), ErasedResult::Success(new)) => {
                id.values_equal(&**old, &**new)
            }
            _ => false,
        }
    }

    pub(crate) fn invalidate_id(&self, id: &QueryId) {
        let mut nodes = self.nodes.lock();
        log::debug!("graph: invalidate {:?}", id);
        nodes.entry(id.clone()).or_insert_with(Node::empty).validity = Validity::StronglyInvalid;
        Self::propagate(&mut nodes, id, Validity::StronglyInvalid);
    }

    pub(crate) fn remove_id(&self, id: &QueryId) {
        let mut nodes = self.nodes.lock();
        log::debug!("graph: remove {:?}", id);
        Self::propagate(&mut nodes, id, Validity::StronglyInvalid);
        if let Some(node) = nodes.remove(id) {
            for dep in &node.deps {
                if let Some(dep_node) = nodes.get_mut(dep) {
                    dep_node.rev.shift_remove(id);
                }
            }
        }
    }

    pub(crate) fn validate_weak_id(&self, id: &QueryId) -> bool {
        let mut nodes = self.nodes.lock();
        let Some(node) = nodes.get(id) else {
            return false;
        };
        if node.validity != Validity::WeaklyInvalid {
            return node.validity == Validity::Valid;
        }
        let all_deps_valid = node
            .deps
            .iter()
            .all(|d| nodes.get(d).map_or(false, |n| n.validity == Validity::Valid));
        if all_deps_valid {
            nodes.get_mut(id).unwrap().validity = Validity::Valid;
            log::debug!("graph: validate_weak promoted {:?} to Valid", id);
            true
        } else {
            false
        }
    }

    /// Registers an out-of-band dependency edge without touching a cached
    /// result or validity — used by the serializer's `load` when replaying
    /// edges for a node whose own `put` happens in the same pass.
    pub(crate) fn ensure_rev_edge(&self, dependency: &QueryId, dependent: &QueryId) {
        let mut nodes = self.nodes.lock();
        nodes
            .entry(dependency.clone())
            .or_insert_with(Node::empty)
            .rev
            .insert(dependent.clone());
    }
}

// Sanity: callers need `FxIndexSet`'s element type to match `TypeId` use
// sites; this keeps the alias import honest for doc purposes.
#[allow(dead_code)]
fn _type_id_is_used(_: TypeId) {}
