//! Error types.
//!
//! Three layers, matching where a failure can happen:
//! - [`GraphError`]: construction and planning errors. These are programming
//!   errors; they surface immediately and are never retried.
//! - [`StageError`]: a single stage failed inside an executor, classified by
//!   [`FailureKind`] so the runner knows whether a retry makes sense.
//! - [`RunError`]: what callers of the fluent front-end see when a run (or the
//!   resolution of a deferred value) did not produce the requested data.

use crate::node_id::NodeId;
use crate::runner::RunFailure;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Construction and planning errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    /// An input's element type does not match what the node expects.
    #[error("type mismatch: expected `{expected}`, found `{found}`")]
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },

    /// A referenced node is not registered in this pipeline.
    #[error("unknown node {0} (not registered in this pipeline)")]
    UnknownParent(NodeId),

    /// A node has no path back to a source.
    #[error("disconnected graph: {0}")]
    DisconnectedGraph(String),

    /// Planning found a cycle among the listed nodes.
    #[error("cyclic dependency among nodes {0:?}")]
    CyclicDependency(Vec<NodeId>),

    /// A write with [`WriteMode::Default`](crate::io::WriteMode::Default) names a
    /// target that already exists.
    #[error("target `{0}` already exists")]
    TargetExists(String),
}

/// Classification of a stage failure reported by an executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    /// A worker went away or timed out; retrying the stage may succeed.
    TransientWorkerFailure,
    /// The data itself is bad. Fatal, never retried.
    DataError,
    /// The substrate is out of capacity. Surfaced with a backpressure hint;
    /// the caller may retry the whole run later.
    ResourceExhausted,
    /// The run was cancelled or its deadline passed.
    Cancelled,
}

impl FailureKind {
    /// Whether the runner may retry the failing stage in place.
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(self, FailureKind::TransientWorkerFailure)
    }
}

/// A failed stage execution.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind:?}: {message}")]
pub struct StageError {
    pub kind: FailureKind,
    pub message: String,
    /// Suggested wait before retrying, set for [`FailureKind::ResourceExhausted`].
    pub retry_after: Option<Duration>,
}

impl StageError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(FailureKind::TransientWorkerFailure, message)
    }

    pub fn data(message: impl Into<String>) -> Self {
        Self::new(FailureKind::DataError, message)
    }

    pub fn exhausted(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self {
            retry_after,
            ..Self::new(FailureKind::ResourceExhausted, message)
        }
    }

    #[must_use]
    pub fn cancelled() -> Self {
        Self::new(FailureKind::Cancelled, "cancelled")
    }
}

/// Failure of a run as seen by callers that asked for data.
#[derive(Debug, Clone, Error)]
pub enum RunError {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("{0}")]
    Stage(RunFailure),

    /// The run succeeded but its output could not be decoded into the requested value.
    #[error("could not resolve value for node {node}: {source}")]
    Resolve { node: NodeId, source: StageError },
}

impl RunError {
    /// The failure classification, when the error came from a stage.
    #[must_use]
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            RunError::Graph(_) => None,
            RunError::Stage(f) => Some(f.kind),
            RunError::Resolve { source, .. } => Some(source.kind),
        }
    }
}
