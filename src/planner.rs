//! Stage planning.
//!
//! The planner turns a set of target nodes into the minimal ordered list of
//! [`Stage`]s that realizes them:
//!
//! 1. **Closure** -- every ancestor of the targets (targets included).
//! 2. **Prune** -- nodes whose cached result is retained become synthetic leaves;
//!    their handles are captured in [`Plan::cache_hits`], and anything reachable
//!    only through them drops out of the plan.
//! 3. **Order** -- Kahn's algorithm, ties broken by ascending [`NodeId`] so the
//!    same graph always yields the same plan.
//! 4. **Fuse** -- a transform joins its parent's stage when that parent has a
//!    single consumer in the plan and is neither cached nor a target. Fan-out
//!    nodes, cached nodes and targets therefore end their stage, since their
//!    output has to be handed over once and shared. Sources, unions, aggregates
//!    and materializations always open a new stage.
//!
//! A materialize node whose write already completed in an earlier run is still
//! planned when something downstream needs its data, but only forwards that data
//! (see [`Plan::replayed_writes`]). It writes again only when it is a target of
//! the plan and its [`WriteMode`](crate::io::WriteMode) is repeatable.
//!
//! Stages are numbered in topological order of their first node, so every stage
//! comes after the stages it depends on.

use crate::error::GraphError;
use crate::node::Node;
use crate::node_id::NodeId;
use crate::pipeline::Pipeline;
use crate::type_token::DataHandle;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, HashMap};
use std::fmt::{Display, Formatter, Result as FormatResult};
use tracing::debug;

/// A fused, directly executable unit of work.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Stage {
    /// Position in [`Plan::stages`].
    pub index: usize,
    /// Nodes computed by this stage, in execution order.
    pub nodes: Vec<NodeId>,
    /// Nodes whose data the first node consumes (parents outside the stage).
    pub inputs: Vec<NodeId>,
    /// The node whose data this stage produces.
    pub output: NodeId,
    /// Indices of the stages producing `inputs`; inputs served from the cache
    /// have no producing stage.
    pub depends_on: Vec<usize>,
    /// Per-node labels, parallel to `nodes`.
    pub labels: Vec<String>,
    /// Whether any node in the stage is a barrier.
    pub barrier: bool,
}

impl Stage {
    #[must_use]
    pub fn head(&self) -> NodeId {
        self.nodes[0]
    }

    /// Whether this stage computes `id`.
    #[must_use]
    pub fn computes(&self, id: NodeId) -> bool {
        self.nodes.contains(&id)
    }
}

/// A finalized execution plan.
#[derive(Clone, Debug)]
pub struct Plan {
    pub targets: Vec<NodeId>,
    /// Stages in submission order.
    pub stages: Vec<Stage>,
    /// Cached results used instead of recomputation, keyed by node.
    pub cache_hits: BTreeMap<NodeId, DataHandle>,
    /// Materialize nodes that forward their input without writing it again.
    pub replayed_writes: BTreeSet<NodeId>,
}

impl Plan {
    /// The stage computing `id`, if any.
    #[must_use]
    pub fn stage_for(&self, id: NodeId) -> Option<&Stage> {
        self.stages.iter().find(|s| s.computes(id))
    }

    /// Number of nodes fused into a stage behind another node.
    #[must_use]
    pub fn fused_nodes(&self) -> usize {
        self.stages.iter().map(|s| s.nodes.len() - 1).sum()
    }

    /// Describe the plan for humans.
    #[must_use]
    pub fn explain(&self) -> PlanExplanation {
        PlanExplanation {
            targets: self.targets.clone(),
            stages: self
                .stages
                .iter()
                .map(|s| ExplainStage {
                    index: s.index,
                    steps: s
                        .nodes
                        .iter()
                        .zip(&s.labels)
                        .map(|(id, label)| format!("{id} {label}"))
                        .collect(),
                    depends_on: s.depends_on.clone(),
                    barrier: s.barrier,
                })
                .collect(),
            cache_hits: self.cache_hits.keys().copied().collect(),
            fused_nodes: self.fused_nodes(),
        }
    }
}

/// Human-readable rendering of a [`Plan`].
#[derive(Debug, Clone)]
pub struct PlanExplanation {
    pub targets: Vec<NodeId>,
    pub stages: Vec<ExplainStage>,
    pub cache_hits: Vec<NodeId>,
    pub fused_nodes: usize,
}

/// One stage in a [`PlanExplanation`].
#[derive(Debug, Clone)]
pub struct ExplainStage {
    pub index: usize,
    pub steps: Vec<String>,
    pub depends_on: Vec<usize>,
    pub barrier: bool,
}

impl Display for PlanExplanation {
    fn fmt(&self, f: &mut Formatter<'_>) -> FormatResult {
        writeln!(
            f,
            "╔═══════════════════════════════════════════════════════════════╗"
        )?;
        writeln!(
            f,
            "║              EXECUTION PLAN EXPLANATION                       ║"
        )?;
        writeln!(
            f,
            "╚═══════════════════════════════════════════════════════════════╝"
        )?;
        writeln!(f)?;
        writeln!(
            f,
            "┌─ SUMMARY ────────────────────────────────────────────────────┐"
        )?;
        writeln!(f, "│ Targets:           {:>10}", self.targets.len())?;
        writeln!(f, "│ Stages:            {:>10}", self.stages.len())?;
        writeln!(f, "│ Fused Nodes:       {:>10}", self.fused_nodes)?;
        writeln!(f, "│ Cache Hits:        {:>10}", self.cache_hits.len())?;
        writeln!(
            f,
            "└──────────────────────────────────────────────────────────────┘"
        )?;
        writeln!(f)?;
        writeln!(
            f,
            "┌─ STAGES ─────────────────────────────────────────────────────┐"
        )?;
        for stage in &self.stages {
            let barrier_marker = if stage.barrier { " [BARRIER]" } else { "" };
            writeln!(f, "│")?;
            writeln!(f, "│ Stage {}{}", stage.index, barrier_marker)?;
            if !stage.depends_on.is_empty() {
                writeln!(f, "│   after stages {:?}", stage.depends_on)?;
            }
            for step in &stage.steps {
                writeln!(f, "│   {step}")?;
            }
        }
        writeln!(f, "│")?;
        writeln!(
            f,
            "└──────────────────────────────────────────────────────────────┘"
        )?;
        if !self.cache_hits.is_empty() {
            writeln!(f)?;
            writeln!(
                f,
                "┌─ CACHE HITS ─────────────────────────────────────────────────┐"
            )?;
            for id in &self.cache_hits {
                writeln!(f, "│ • {id} served from cache")?;
            }
            writeln!(
                f,
                "└──────────────────────────────────────────────────────────────┘"
            )?;
        }
        Ok(())
    }
}

/// Plan the stages needed to realize `targets`.
///
/// # Errors
///
/// - [`GraphError::UnknownParent`] if a target is not registered
/// - [`GraphError::DisconnectedGraph`] if a planned node has no path to a source
/// - [`GraphError::CyclicDependency`] if the planned nodes contain a cycle
pub fn build_plan(p: &Pipeline, targets: &[NodeId]) -> Result<Plan, GraphError> {
    let (nodes, _) = p.snapshot();
    let mut target_list: Vec<NodeId> = targets.to_vec();
    target_list.sort_unstable();
    target_list.dedup();

    let closure = crate::pipeline::closure(&nodes, &target_list)?;

    let cache = p.cache();
    let cache_hits: BTreeMap<NodeId, DataHandle> = closure
        .iter()
        .filter_map(|id| cache.lookup(*id).map(|h| (*id, h)))
        .collect();

    let live = live_nodes(&nodes, &target_list, &cache_hits);
    check_connected(&nodes, &live)?;
    let order = topo_order(&nodes, &live)?;
    let replayed_writes = completed_writes(p, &nodes, &live, &target_list);

    // Consumers of each node among the live nodes.
    let mut consumers: HashMap<NodeId, usize> = HashMap::new();
    for id in &live {
        for parent in nodes[id].parents() {
            if live.contains(parent) {
                *consumers.entry(*parent).or_default() += 1;
            }
        }
    }

    let mut stages: Vec<Stage> = Vec::new();
    let mut stage_of: HashMap<NodeId, usize> = HashMap::new();
    for id in order {
        let node = &nodes[&id];
        let label = if replayed_writes.contains(&id) {
            format!("{} [written]", node.label())
        } else {
            node.label()
        };
        let fuse_into = match node {
            Node::Transform { parent, .. }
                if live.contains(parent)
                    && consumers.get(parent) == Some(&1)
                    && !cache.is_cached(*parent)
                    && target_list.binary_search(parent).is_err() =>
            {
                stage_of.get(parent).copied()
            }
            _ => None,
        };
        match fuse_into {
            Some(idx) => {
                let stage = &mut stages[idx];
                stage.nodes.push(id);
                stage.labels.push(label);
                stage.output = id;
                stage.barrier |= node.is_barrier();
                stage_of.insert(id, idx);
            }
            None => {
                let idx = stages.len();
                let mut inputs: Vec<NodeId> = Vec::new();
                for parent in node.parents() {
                    if !inputs.contains(parent) {
                        inputs.push(*parent);
                    }
                }
                let mut depends_on: Vec<usize> = inputs
                    .iter()
                    .filter(|i| !cache_hits.contains_key(i))
                    .filter_map(|i| stage_of.get(i).copied())
                    .collect();
                depends_on.sort_unstable();
                depends_on.dedup();
                stages.push(Stage {
                    index: idx,
                    nodes: vec![id],
                    inputs,
                    output: id,
                    depends_on,
                    labels: vec![label],
                    barrier: node.is_barrier(),
                });
                stage_of.insert(id, idx);
            }
        }
    }

    debug!(
        targets = target_list.len(),
        stages = stages.len(),
        cache_hits = cache_hits.len(),
        replayed_writes = replayed_writes.len(),
        "planned"
    );

    Ok(Plan {
        targets: target_list,
        stages,
        cache_hits,
        replayed_writes,
    })
}

/// Live materialize nodes whose completed write must not happen again.
fn completed_writes(
    p: &Pipeline,
    nodes: &HashMap<NodeId, Node>,
    live: &BTreeSet<NodeId>,
    targets: &[NodeId],
) -> BTreeSet<NodeId> {
    live.iter()
        .filter(|id| match &nodes[*id] {
            Node::Materialize { mode, .. } => {
                p.is_written(**id)
                    && !(mode.is_repeatable() && targets.binary_search(*id).is_ok())
            }
            _ => false,
        })
        .copied()
        .collect()
}

/// Nodes that must be computed: reachable from a target without passing
/// through a cache hit.
fn live_nodes(
    nodes: &HashMap<NodeId, Node>,
    targets: &[NodeId],
    cache_hits: &BTreeMap<NodeId, DataHandle>,
) -> BTreeSet<NodeId> {
    let mut live = BTreeSet::new();
    let mut stack: Vec<NodeId> = targets
        .iter()
        .filter(|t| !cache_hits.contains_key(t))
        .copied()
        .collect();
    while let Some(id) = stack.pop() {
        if !live.insert(id) {
            continue;
        }
        if let Some(node) = nodes.get(&id) {
            stack.extend(
                node.parents()
                    .iter()
                    .filter(|p| !cache_hits.contains_key(p) && !live.contains(p)),
            );
        }
    }
    live
}

fn check_connected(nodes: &HashMap<NodeId, Node>, live: &BTreeSet<NodeId>) -> Result<(), GraphError> {
    for id in live {
        let node = &nodes[id];
        if node.parents().is_empty() && !node.is_source() {
            return Err(GraphError::DisconnectedGraph(format!(
                "{} node {id} is not reachable from any source",
                node.kind_name()
            )));
        }
    }
    Ok(())
}

/// Kahn's algorithm over the live nodes; ready nodes leave in ascending id order.
fn topo_order(nodes: &HashMap<NodeId, Node>, live: &BTreeSet<NodeId>) -> Result<Vec<NodeId>, GraphError> {
    let mut indegree: HashMap<NodeId, usize> = live.iter().map(|id| (*id, 0)).collect();
    let mut children: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
    for id in live {
        for parent in nodes[id].parents() {
            if live.contains(parent) {
                *indegree.entry(*id).or_default() += 1;
                children.entry(*parent).or_default().push(*id);
            }
        }
    }

    let mut ready: BinaryHeap<Reverse<NodeId>> = indegree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(id, _)| Reverse(*id))
        .collect();
    let mut order = Vec::with_capacity(live.len());
    while let Some(Reverse(id)) = ready.pop() {
        order.push(id);
        for child in children.get(&id).into_iter().flatten() {
            if let Some(d) = indegree.get_mut(child) {
                *d -= 1;
                if *d == 0 {
                    ready.push(Reverse(*child));
                }
            }
        }
    }

    if order.len() < live.len() {
        let stuck: Vec<NodeId> = indegree
            .into_iter()
            .filter(|(_, d)| *d > 0)
            .map(|(id, _)| id)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        return Err(GraphError::CyclicDependency(stuck));
    }
    Ok(order)
}
