//! Small hashing aliases shared across the crate, mirroring the
//! `FxHashMap`/`FxIndexSet` aliases salsa keeps next to its runtime.

use rustc_hash::FxHasher;
use std::hash::BuildHasherDefault;

pub(crate) type FxIndexSet<K> = indexmap::IndexSet<K, BuildHasherDefault<FxHasher>>;
pub(crate) type FxIndexMap<K, V> = indexmap::IndexMap<K, V, BuildHasherDefault<FxHasher>>;
pub(crate) type FxHashMap<K, V> = rustc_hash::FxHashMap<K, V>;
pub(crate) type FxHashSet<K> = rustc_hash::FxHashSet<K>;
