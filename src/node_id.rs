//! Lightweight unique identifier for nodes within a [`Pipeline`](crate::pipeline::Pipeline).
//!
//! Each [`Node`](crate::node::Node) registered in the pipeline graph is assigned
//! a sequential `NodeId` drawn from an atomic counter. The id is the only key the
//! planner, the cache registry and the runner use to refer to a node; nodes refer
//! to their parents by id, never by ownership.
//!
//! Ids are small, `Copy`, hashable and totally ordered. Ordering matters: the
//! planner breaks topological ties by ascending id so plans are deterministic.

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FormatResult};

/// Unique numeric identifier for a node in a pipeline graph.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub struct NodeId(u64);

impl NodeId {
    /// Create a new `NodeId`.
    ///
    /// Pipelines assign ids themselves; constructing one by hand is mostly useful
    /// in tests or when addressing a node returned from a snapshot.
    #[must_use]
    pub const fn new(v: u64) -> Self {
        Self(v)
    }

    /// Return the underlying numeric value.
    #[must_use]
    pub const fn raw(&self) -> u64 {
        self.0
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> FormatResult {
        write!(f, "#{}", self.0)
    }
}
