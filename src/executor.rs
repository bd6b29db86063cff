//! Stage execution.
//!
//! The runner hands every planned stage to an [`Executor`] as a [`StageWork`]: the
//! stage description, its resolved input handles and the fused chain of nodes to
//! apply. Executors block until the stage finishes and classify failures with a
//! [`FailureKind`](crate::error::FailureKind).
//!
//! [`LocalExecutor`] runs stages in-process:
//! - element-wise operators are applied per partition in parallel with rayon
//! - barriers (grouping, combining) concatenate the partitions first
//! - unions concatenate their inputs in parent order
//! - aggregates concatenate, then run the combiner once
//! - materializations write through their target and pass the data on; a
//!   replayed write only passes the data on

use crate::cancel::CancelToken;
use crate::error::StageError;
use crate::node::{DynOp, Node};
use crate::node_id::NodeId;
use crate::planner::Stage;
use crate::type_token::{DataHandle, ElementType, Partition};
use rayon::prelude::*;
use tracing::trace;

/// Everything an executor needs to run one stage.
#[derive(Clone, Debug)]
pub struct StageWork {
    pub stage: Stage,
    /// Data for each id in `stage.inputs`, in the same order.
    pub inputs: Vec<(NodeId, DataHandle)>,
    /// The stage's nodes, in execution order.
    pub chain: Vec<(NodeId, Node)>,
    /// Materialize nodes in `chain` whose write already completed; they only
    /// pass their input on.
    pub replayed_writes: Vec<NodeId>,
}

impl StageWork {
    /// The input handle produced by `id`.
    #[must_use]
    pub fn input(&self, id: NodeId) -> Option<&DataHandle> {
        self.inputs.iter().find(|(i, _)| *i == id).map(|(_, h)| h)
    }
}

/// The execution substrate.
pub trait Executor: Send + Sync {
    /// Run one stage to completion and return the data of its output node.
    ///
    /// Implementations should check `cancel` between units of work and return a
    /// [`FailureKind::Cancelled`](crate::error::FailureKind::Cancelled) error
    /// once it trips.
    ///
    /// # Errors
    ///
    /// A classified [`StageError`].
    fn submit(&self, work: StageWork, cancel: &CancelToken) -> Result<DataHandle, StageError>;
}

/// In-process executor backed by rayon's global pool.
#[derive(Clone, Debug)]
pub struct LocalExecutor {
    partitions: usize,
}

impl Default for LocalExecutor {
    fn default() -> Self {
        Self::new(2 * num_cpus::get().max(2))
    }
}

impl LocalExecutor {
    /// Executor splitting element-wise work into up to `partitions` chunks.
    #[must_use]
    pub fn new(partitions: usize) -> Self {
        Self {
            partitions: partitions.max(1),
        }
    }

    #[must_use]
    pub fn partitions(&self) -> usize {
        self.partitions
    }
}

/// Data flowing through a stage: either one whole handle or a set of partitions
/// still being worked on.
enum Flow {
    Whole(DataHandle),
    Parts(Vec<Partition>, ElementType),
}

impl Flow {
    fn into_handle(self) -> Result<DataHandle, StageError> {
        match self {
            Flow::Whole(h) => Ok(h),
            Flow::Parts(parts, elem) => {
                let joined = elem.ops().concat(parts).ok_or_else(|| {
                    StageError::data(format!("partitions do not decode as {}", elem.name()))
                })?;
                Ok(DataHandle::from_partition(joined, elem))
            }
        }
    }

    fn into_parts(self, n: usize) -> Result<Vec<Partition>, StageError> {
        match self {
            Flow::Parts(parts, _) => Ok(parts),
            Flow::Whole(h) => {
                let len = h.len().ok_or_else(|| unreadable(&h))?;
                h.split(n.min(len.max(1))).ok_or_else(|| unreadable(&h))
            }
        }
    }

    fn into_single(self) -> Result<Partition, StageError> {
        match self {
            Flow::Whole(h) => h.to_partition().ok_or_else(|| unreadable(&h)),
            Flow::Parts(parts, elem) => elem.ops().concat(parts).ok_or_else(|| {
                StageError::data(format!("partitions do not decode as {}", elem.name()))
            }),
        }
    }
}

fn unreadable(h: &DataHandle) -> StageError {
    StageError::data(format!(
        "input data does not decode as {}",
        h.element_type().name()
    ))
}

impl LocalExecutor {
    fn apply_op(&self, op: &dyn DynOp, flow: Flow, output: &ElementType) -> Result<Flow, StageError> {
        if op.element_wise() {
            let parts = flow.into_parts(self.partitions)?;
            let out = parts
                .into_par_iter()
                .map(|part| op.apply(part))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Flow::Parts(out, output.clone()))
        } else {
            let whole = flow.into_single()?;
            Ok(Flow::Parts(vec![op.apply(whole)?], output.clone()))
        }
    }

    fn input_of(work: &StageWork, id: NodeId) -> Result<DataHandle, StageError> {
        work.input(id)
            .cloned()
            .ok_or_else(|| StageError::data(format!("missing input {id} for stage {}", work.stage.index)))
    }
}

impl Executor for LocalExecutor {
    fn submit(&self, work: StageWork, cancel: &CancelToken) -> Result<DataHandle, StageError> {
        let mut flow: Option<Flow> = None;
        for (id, node) in &work.chain {
            if cancel.is_cancelled() {
                return Err(StageError::cancelled());
            }
            trace!(node = %id, kind = node.kind_name(), "applying");
            let input = |parent: NodeId, flow: &mut Option<Flow>| -> Result<Flow, StageError> {
                match flow.take() {
                    Some(f) => Ok(f),
                    None => Self::input_of(&work, parent).map(Flow::Whole),
                }
            };
            flow = Some(match node {
                Node::Source { source, elem } => {
                    let h = source.read()?;
                    if !h.element_type().is_compatible(elem) {
                        return Err(StageError::data(format!(
                            "source {} produced {}, expected {}",
                            source.name(),
                            h.element_type().name(),
                            elem.name()
                        )));
                    }
                    Flow::Whole(h)
                }
                Node::Transform {
                    parent, op, output, ..
                } => {
                    let f = input(*parent, &mut flow)?;
                    self.apply_op(op.as_ref(), f, output)?
                }
                Node::Union { parents, elem } => {
                    let mut parts = Vec::with_capacity(parents.len());
                    for parent in parents {
                        parts.push(Flow::Whole(Self::input_of(&work, *parent)?).into_single()?);
                    }
                    Flow::Parts(parts, elem.clone())
                }
                Node::Aggregate {
                    parent,
                    aggregator,
                    output,
                } => {
                    let whole = input(*parent, &mut flow)?.into_single()?;
                    Flow::Parts(vec![aggregator.apply(whole)?], output.clone())
                }
                Node::Materialize {
                    parent,
                    target,
                    mode,
                    ..
                } => {
                    let h = input(*parent, &mut flow)?.into_handle()?;
                    if work.replayed_writes.contains(id) {
                        trace!(node = %id, target = %target.name(), "write already done");
                    } else {
                        target.write(&h, *mode)?;
                    }
                    Flow::Whole(h)
                }
            });
        }
        flow.ok_or_else(|| StageError::data(format!("stage {} has no nodes", work.stage.index)))?
            .into_handle()
    }
}
