//! The pretty printer is explicitly out of core scope: this crate exposes
//! only the trait a caller implements against the graph's read contract.
//! No DOT (or any other) rendering logic ships here, mirroring the way
//! pantsbuild's `Graph::visualize` is a concrete feature this crate defers
//! to rather than reimplements.

use std::fmt;

use crate::graph::Graph;

/// A caller-supplied renderer over a graph's read contract
/// (`get`/`validity`/`deps`/`rev`/`transitive_deps`/`transitive_dependents`).
pub trait GraphPrinter {
    fn write_dot(&self, graph: &Graph, out: &mut dyn fmt::Write) -> fmt::Result;
}
