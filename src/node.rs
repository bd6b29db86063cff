//! Graph vertices.
//!
//! A [`Node`] is one logical dataset. The variant set is closed: the planner and
//! executors match on it exhaustively. Nodes reference their parents by
//! [`NodeId`] only; the [`Pipeline`](crate::Pipeline) arena owns every node.

use crate::error::StageError;
use crate::io::{Source, Target, WriteMode};
use crate::node_id::NodeId;
use crate::type_token::{ElementType, Partition, TypeTag};
use std::fmt::{Debug, Formatter, Result as FormatResult};
use std::slice::from_ref;
use std::sync::Arc;

/// A type-erased operator applied to a partition.
pub trait DynOp: Send + Sync {
    /// Apply the operator to one partition.
    ///
    /// # Errors
    ///
    /// Returns a [`StageError`] (usually a data error) when the input does not
    /// decode as the expected type or the user function rejects an element.
    fn apply(&self, input: Partition) -> Result<Partition, StageError>;

    /// Element type this operator consumes; checked against the parent at
    /// construction.
    fn input_type(&self) -> TypeTag;

    /// Whether the operator can run independently on each partition.
    ///
    /// Barriers (grouping, combining, global aggregation) return `false` and see
    /// the whole input as a single partition.
    fn element_wise(&self) -> bool {
        true
    }
}

/// The transformation a [`Node::Transform`] performs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TransformKind {
    Map,
    FlatMap,
    Filter,
    GroupByKey,
    CombineValues,
}

impl TransformKind {
    /// Barriers need all of their input before producing output.
    #[must_use]
    pub fn is_barrier(self) -> bool {
        matches!(self, TransformKind::GroupByKey | TransformKind::CombineValues)
    }
}

#[derive(Clone)]
pub enum Node {
    /// Leaf reading external data.
    Source {
        source: Arc<dyn Source>,
        elem: ElementType,
    },
    /// One input, one output.
    Transform {
        parent: NodeId,
        kind: TransformKind,
        op: Arc<dyn DynOp>,
        output: ElementType,
        name: Option<String>,
    },
    /// Ordered concatenation of parents sharing one element type.
    Union {
        parents: Vec<NodeId>,
        elem: ElementType,
    },
    /// Global aggregation producing a new (usually single-element) collection.
    Aggregate {
        parent: NodeId,
        aggregator: Arc<dyn DynOp>,
        output: ElementType,
    },
    /// Sink writing the parent's data to a target; the data passes through.
    Materialize {
        parent: NodeId,
        target: Arc<dyn Target>,
        mode: WriteMode,
        elem: ElementType,
    },
}

impl Node {
    /// Parent ids in input order (empty for sources).
    #[must_use]
    pub fn parents(&self) -> &[NodeId] {
        match self {
            Node::Source { .. } => &[],
            Node::Transform { parent, .. }
            | Node::Aggregate { parent, .. }
            | Node::Materialize { parent, .. } => from_ref(parent),
            Node::Union { parents, .. } => parents,
        }
    }

    /// Element type of this node's output.
    #[must_use]
    pub fn element_type(&self) -> &ElementType {
        match self {
            Node::Source { elem, .. } | Node::Union { elem, .. } | Node::Materialize { elem, .. } => {
                elem
            }
            Node::Transform { output, .. } | Node::Aggregate { output, .. } => output,
        }
    }

    #[must_use]
    pub fn is_source(&self) -> bool {
        matches!(self, Node::Source { .. })
    }

    #[must_use]
    pub fn is_barrier(&self) -> bool {
        match self {
            Node::Transform { kind, .. } => kind.is_barrier(),
            Node::Aggregate { .. } => true,
            Node::Source { .. } | Node::Union { .. } | Node::Materialize { .. } => false,
        }
    }

    /// Short kind name, e.g. `"Filter"` or `"Union"`.
    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match self {
            Node::Source { .. } => "Source",
            Node::Transform { kind, .. } => match kind {
                TransformKind::Map => "Map",
                TransformKind::FlatMap => "FlatMap",
                TransformKind::Filter => "Filter",
                TransformKind::GroupByKey => "GroupByKey",
                TransformKind::CombineValues => "CombineValues",
            },
            Node::Union { .. } => "Union",
            Node::Aggregate { .. } => "Aggregate",
            Node::Materialize { .. } => "Materialize",
        }
    }

    /// Human-readable label: the user-supplied name when there is one.
    #[must_use]
    pub fn label(&self) -> String {
        match self {
            Node::Source { source, .. } => source.name(),
            Node::Transform {
                name: Some(name), ..
            } => name.clone(),
            Node::Materialize { target, mode, .. } => format!("{} ({mode:?})", target.name()),
            Node::Union { parents, .. } => format!("union of {}", parents.len()),
            _ => self.kind_name().to_string(),
        }
    }
}

impl Debug for Node {
    fn fmt(&self, f: &mut Formatter<'_>) -> FormatResult {
        write!(
            f,
            "{}[{}] -> {} <- {:?}",
            self.kind_name(),
            self.label(),
            self.element_type().name(),
            self.parents()
        )
    }
}
