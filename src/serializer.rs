//! The graph serializer: a topological dump of the memo table and the
//! matching load, with the skip/demotion rules the data model requires for
//! entries whose dependencies (or own value) cannot be serialized.

use std::any::TypeId;
use std::collections::{BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::graph::{ErasedResult, Graph};
use crate::query::{Query, QueryId};
use crate::util::{FxHashMap, FxIndexSet};
use crate::validity::Validity;

/// A query or value encoded as a tagged JSON payload: `kind` names the
/// registered class, `data` is whatever `serde_json::to_value` produced for
/// the concrete type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Encoded {
    pub kind: String,
    pub data: serde_json::Value,
}

/// One emitted node: its query, its value, the validity it was demoted to
/// (if any of its dependencies couldn't also be emitted), the indices of
/// its dependencies already earlier in `Dump::ordered` (`local_deps`), and
/// any dependency that *is* serializable on its own but isn't being
/// emitted as a top-level entry (`transient_deps`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entry {
    pub query: Encoded,
    pub value: serde_json::Value,
    pub validity: Validity,
    pub local_deps: BTreeSet<usize>,
    pub transient_deps: Vec<Encoded>,
}

/// A topologically-ordered dump of a [`Graph`]'s memo table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Dump {
    pub ordered: Vec<Entry>,
}

trait QueryClass: Send + Sync {
    fn encode(&self, id: &QueryId) -> Option<serde_json::Value>;
    fn decode(&self, data: serde_json::Value) -> Option<QueryId>;
}

struct QueryClassImpl<Q>(std::marker::PhantomData<fn() -> Q>);

impl<Q: Query + Serialize + serde::de::DeserializeOwned> QueryClass for QueryClassImpl<Q> {
    fn encode(&self, id: &QueryId) -> Option<serde_json::Value> {
        serde_json::to_value(id.downcast_ref::<Q>()?).ok()
    }

    fn decode(&self, data: serde_json::Value) -> Option<QueryId> {
        serde_json::from_value::<Q>(data).ok().map(QueryId::new)
    }
}

trait ValueClass: Send + Sync {
    fn encode(&self, result: &ErasedResult) -> Option<serde_json::Value>;
    fn decode(&self, data: serde_json::Value) -> Option<std::sync::Arc<dyn std::any::Any + Send + Sync>>;
}

struct ValueClassImpl<Q>(std::marker::PhantomData<fn() -> Q>);

impl<Q: Query> ValueClass for ValueClassImpl<Q>
where
    Q::Value: Serialize + serde::de::DeserializeOwned,
{
    fn encode(&self, result: &ErasedResult) -> Option<serde_json::Value> {
        match result {
            ErasedResult::Success(v) => {
                serde_json::to_value(v.downcast_ref::<Q::Value>()?).ok()
            }
            ErasedResult::Failure(_) => None,
        }
    }

    fn decode(&self, data: serde_json::Value) -> Option<std::sync::Arc<dyn std::any::Any + Send + Sync>> {
        let value: Q::Value = serde_json::from_value(data).ok()?;
        Some(std::sync::Arc::new(value))
    }
}

/// Registers, for each query class that should survive a dump/load round
/// trip, how to encode/decode its queries (and, separately, its values).
pub struct Serializer {
    by_kind: FxHashMap<String, TypeId>,
    query_classes: FxHashMap<TypeId, Box<dyn QueryClass>>,
    value_classes: FxHashMap<TypeId, Box<dyn ValueClass>>,
}

impl Default for Serializer {
    fn default() -> Self {
        Self::new()
    }
}

impl Serializer {
    pub fn new() -> Self {
        Serializer {
            by_kind: FxHashMap::default(),
            query_classes: FxHashMap::default(),
            value_classes: FxHashMap::default(),
        }
    }

    /// Makes `Q`'s queries serializable (but not, on their own, its
    /// values — a query that only ever shows up as someone else's
    /// dependency can be registered this way alone).
    pub fn add_query_serializer<Q>(&mut self, kind: impl Into<String>) -> Result<(), EngineError>
    where
        Q: Query + Serialize + serde::de::DeserializeOwned,
    {
        let kind = kind.into();
        if self.by_kind.contains_key(&kind) {
            return Err(EngineError::MultipleHandlers("duplicate serializer kind"));
        }
        let type_id = TypeId::of::<Q>();
        self.by_kind.insert(kind, type_id);
        self.query_classes
            .insert(type_id, Box::new(QueryClassImpl::<Q>(std::marker::PhantomData)));
        Ok(())
    }

    /// Makes `Q`'s queries *and* values serializable, so `Q` nodes can be
    /// emitted as their own top-level [`Entry`].
    pub fn add_value_serializer<Q>(&mut self, kind: impl Into<String>) -> Result<(), EngineError>
    where
        Q: Query + Serialize + serde::de::DeserializeOwned,
        Q::Value: Serialize + serde::de::DeserializeOwned,
    {
        self.add_query_serializer::<Q>(kind)?;
        let type_id = TypeId::of::<Q>();
        self.value_classes
            .insert(type_id, Box::new(ValueClassImpl::<Q>(std::marker::PhantomData)));
        Ok(())
    }

    fn kind_of(&self, id: &QueryId) -> Option<&str> {
        self.by_kind
            .iter()
            .find(|(_, t)| **t == id.class_id())
            .map(|(k, _)| k.as_str())
    }

    fn has_query_codec(&self, id: &QueryId) -> bool {
        self.query_classes.contains_key(&id.class_id())
    }

    fn encode_query(&self, id: &QueryId) -> Option<Encoded> {
        let kind = self.kind_of(id)?.to_string();
        let data = self.query_classes.get(&id.class_id())?.encode(id)?;
        Some(Encoded { kind, data })
    }

    /// Builds a topologically-ordered [`Dump`] of `graph`'s current memo
    /// table. Returns [`EngineError::CyclicDependency`] if the eligible
    /// subset of nodes (those with a registered value-serializer and only
    /// query-serializable dependencies) cannot be fully ordered.
    pub fn dump(&self, graph: &Graph) -> Result<Dump, EngineError> {
        let snapshot = graph.snapshot();

        let eligible = |id: &QueryId| -> bool {
            let Some(node) = snapshot.get(id) else {
                return false;
            };
            let Some(ErasedResult::Success(_)) = &node.result else {
                return false;
            };
            if !self.value_classes.contains_key(&id.class_id()) {
                return false;
            }
            node.deps.iter().all(|d| self.has_query_codec(d))
        };

        let candidates: FxIndexSet<QueryId> = snapshot
            .keys()
            .filter(|id| eligible(id))
            .cloned()
            .collect();

        let mut remaining: FxHashMap<QueryId, usize> = FxHashMap::default();
        let mut dependents: FxHashMap<QueryId, Vec<QueryId>> = FxHashMap::default();
        for id in &candidates {
            let node = &snapshot[id];
            let in_candidate: Vec<QueryId> = node
                .deps
                .iter()
                .filter(|d| candidates.contains(*d))
                .cloned()
                .collect();
            remaining.insert(id.clone(), in_candidate.len());
            for dep in in_candidate {
                dependents.entry(dep).or_default().push(id.clone());
            }
        }

        let mut queue: VecDeque<QueryId> = remaining
            .iter()
            .filter(|(_, c)| **c == 0)
            .map(|(id, _)| id.clone())
            .collect();
        let mut order: Vec<QueryId> = Vec::new();
        let mut index_of: FxHashMap<QueryId, usize> = FxHashMap::default();
        while let Some(id) = queue.pop_front() {
            index_of.insert(id.clone(), order.len());
            order.push(id.clone());
            if let Some(deps) = dependents.get(&id) {
                for dependent in deps {
                    let r = remaining.get_mut(dependent).unwrap();
                    *r -= 1;
                    if *r == 0 {
                        queue.push_back(dependent.clone());
                    }
                }
            }
        }
        if order.len() != candidates.len() {
            log::debug!(
                "serializer: residual queue of {} nodes after toposort, reporting a cycle",
                candidates.len() - order.len()
            );
            return Err(EngineError::CyclicDependency);
        }

        let mut entries = Vec::with_capacity(order.len());
        for id in &order {
            let node = &snapshot[id];
            let query = self
                .encode_query(id)
                .expect("eligible node must have a query codec");
            let value = self.value_classes[&id.class_id()]
                .encode(node.result.as_ref().unwrap())
                .expect("eligible node must have a value codec and a success result");

            let mut local_deps = BTreeSet::new();
            let mut transient_deps = Vec::new();
            let mut any_transient = false;
            let mut any_demoted = false;
            for dep in &node.deps {
                if let Some(&idx) = index_of.get(dep) {
                    local_deps.insert(idx);
                    if snapshot[dep].validity != Validity::Valid {
                        any_demoted = true;
                    }
                } else {
                    any_transient = true;
                    transient_deps.push(
                        self.encode_query(dep)
                            .expect("eligibility requires every dep to have a query codec"),
                    );
                }
            }

            let mut validity = node.validity;
            if any_transient {
                validity = Validity::StronglyInvalid;
            } else if any_demoted && validity == Validity::Valid {
                validity = Validity::WeaklyInvalid;
            }

            entries.push(Entry {
                query,
                value,
                validity,
                local_deps,
                transient_deps,
            });
        }

        Ok(Dump { ordered: entries })
    }

    /// Replays a [`Dump`] into `graph`. Entries whose class has no
    /// registered codec are skipped; a skipped local dependency demotes
    /// the depending entry to `STRONGLY_INVALID` rather than failing the
    /// whole load.
    pub fn load(&self, dump: &Dump, graph: &Graph) -> Result<(), EngineError> {
        let mut decoded: Vec<Option<QueryId>> = Vec::with_capacity(dump.ordered.len());

        for entry in &dump.ordered {
            let Some(&type_id) = self.by_kind.get(&entry.query.kind) else {
                decoded.push(None);
                continue;
            };
            let Some(query_class) = self.query_classes.get(&type_id) else {
                decoded.push(None);
                continue;
            };
            let Some(id) = query_class.decode(entry.query.data.clone()) else {
                decoded.push(None);
                continue;
            };
            let Some(value_class) = self.value_classes.get(&type_id) else {
                decoded.push(None);
                continue;
            };
            let Some(value) = value_class.decode(entry.value.clone()) else {
                decoded.push(None);
                continue;
            };

            let mut deps = FxIndexSet::default();
            let mut validity = entry.validity;
            let mut dropped_a_dep = false;
            for &idx in &entry.local_deps {
                match decoded.get(idx).and_then(Clone::clone) {
                    Some(dep_id) => {
                        deps.insert(dep_id);
                    }
                    None => dropped_a_dep = true,
                }
            }
            for transient in &entry.transient_deps {
                if let Some(&t_type) = self.by_kind.get(&transient.kind) {
                    if let Some(qc) = self.query_classes.get(&t_type) {
                        if let Some(dep_id) = qc.decode(transient.data.clone()) {
                            deps.insert(dep_id);
                        }
                    }
                }
            }
            if dropped_a_dep {
                validity = Validity::StronglyInvalid;
            }

            graph.put_erased(id.clone(), ErasedResult::Success(value), deps, validity);
            decoded.push(Some(id));
        }

        Ok(())
    }

    pub fn dump_text(&self, graph: &Graph) -> Result<String, EngineError> {
        let dump = self.dump(graph)?;
        serde_json::to_string_pretty(&dump).map_err(EngineError::serialization)
    }

    pub fn load_text(&self, text: &str, graph: &Graph) -> Result<(), EngineError> {
        let dump: Dump = serde_json::from_str(text).map_err(EngineError::serialization)?;
        self.load(&dump, graph)
    }

    pub fn dump_binary(&self, graph: &Graph) -> Result<Vec<u8>, EngineError> {
        let dump = self.dump(graph)?;
        bincode::serialize(&dump).map_err(EngineError::serialization)
    }

    pub fn load_binary(&self, bytes: &[u8], graph: &Graph) -> Result<(), EngineError> {
        let dump: Dump = bincode::deserialize(bytes).map_err(EngineError::serialization)?;
        self.load(&dump, graph)
    }

    pub fn dump_hex(&self, graph: &Graph) -> Result<String, EngineError> {
        Ok(hex::encode(self.dump_binary(graph)?))
    }

    pub fn load_hex(&self, text: &str, graph: &Graph) -> Result<(), EngineError> {
        let bytes = hex::decode(text).map_err(EngineError::serialization)?;
        self.load_binary(&bytes, graph)
    }
}
