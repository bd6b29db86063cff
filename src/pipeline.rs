//! The pipeline graph.
//!
//! A [`Pipeline`] owns every node of one pipeline instance in an arena keyed by
//! [`NodeId`], together with the edge list, the [`CacheRegistry`], the set of
//! pending deferred values and the writes that already completed. Handles are
//! cheap clones of one shared `Arc`; the graph, its cached results and its
//! pending values are dropped together with the last handle.
//!
//! Construction is safe from many threads: ids come from an atomic counter and
//! every structural change happens under one lock, so a rejected node never
//! leaves a partial trace behind.

use crate::cache::{CacheRegistry, CachingOptions};
use crate::deferred::PendingValue;
use crate::error::GraphError;
use crate::node::Node;
use crate::node_id::NodeId;
use crate::type_token::{DataHandle, ElementType};
use crate::utils::lock;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tracing::debug;

/// Handle to one pipeline instance.
#[derive(Clone, Default)]
pub struct Pipeline {
    pub(crate) inner: Arc<PipelineInner>,
}

#[derive(Default)]
pub struct PipelineInner {
    next_id: AtomicU64,
    graph: Mutex<GraphState>,
    cache: CacheRegistry,
    deferred: Mutex<Vec<Weak<dyn PendingValue>>>,
    written: Mutex<BTreeSet<NodeId>>,
}

#[derive(Default)]
struct GraphState {
    nodes: HashMap<NodeId, Node>,
    edges: Vec<(NodeId, NodeId)>,
}

impl Pipeline {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and register a node, returning its new id.
    ///
    /// # Errors
    ///
    /// - [`GraphError::UnknownParent`] if a parent is not registered here
    /// - [`GraphError::DisconnectedGraph`] if a non-source node has no parent
    /// - [`GraphError::TypeMismatch`] if an input's element type does not fit
    ///
    /// On error the graph is unchanged.
    pub fn add_node(&self, node: Node) -> Result<NodeId, GraphError> {
        let mut g = lock(&self.inner.graph);
        validate(&g, &node)?;
        Ok(self.insert_locked(&mut g, node))
    }

    /// Register a node without validation.
    ///
    /// Used by the typed front-end, where parents come from the same pipeline and
    /// element types are enforced by the compiler.
    pub(crate) fn insert_node(&self, node: Node) -> NodeId {
        let mut g = lock(&self.inner.graph);
        self.insert_locked(&mut g, node)
    }

    fn insert_locked(&self, g: &mut GraphState, node: Node) -> NodeId {
        let id = NodeId::new(self.inner.next_id.fetch_add(1, Ordering::SeqCst));
        for parent in node.parents() {
            g.edges.push((*parent, id));
        }
        debug!(node = %id, kind = node.kind_name(), "registered node");
        g.nodes.insert(id, node);
        id
    }

    /// Whether both handles refer to the same pipeline instance.
    #[must_use]
    pub fn same_as(&self, other: &Pipeline) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Transitive closure of `targets` over parent edges, targets included.
    ///
    /// Every node is visited once, however many paths lead to it.
    ///
    /// # Errors
    ///
    /// [`GraphError::UnknownParent`] if a target is not registered.
    pub fn ancestors_of(&self, targets: &[NodeId]) -> Result<BTreeSet<NodeId>, GraphError> {
        let g = lock(&self.inner.graph);
        closure(&g.nodes, targets)
    }

    /// Direct consumers of `id`, in registration order.
    #[must_use]
    pub fn consumers_of(&self, id: NodeId) -> Vec<NodeId> {
        let g = lock(&self.inner.graph);
        let mut out: Vec<NodeId> = g
            .edges
            .iter()
            .filter(|(from, _)| *from == id)
            .map(|(_, to)| *to)
            .collect();
        out.dedup();
        out
    }

    /// A clone of the node registered under `id`.
    #[must_use]
    pub fn node(&self, id: NodeId) -> Option<Node> {
        lock(&self.inner.graph).nodes.get(&id).cloned()
    }

    #[must_use]
    pub fn element_type(&self, id: NodeId) -> Option<ElementType> {
        lock(&self.inner.graph)
            .nodes
            .get(&id)
            .map(|n| n.element_type().clone())
    }

    #[must_use]
    pub fn node_count(&self) -> usize {
        lock(&self.inner.graph).nodes.len()
    }

    /// Consistent copy of the nodes and edges.
    #[must_use]
    pub fn snapshot(&self) -> (HashMap<NodeId, Node>, Vec<(NodeId, NodeId)>) {
        let g = lock(&self.inner.graph);
        (g.nodes.clone(), g.edges.clone())
    }

    /// Every materialize node, in id order.
    #[must_use]
    pub fn write_nodes(&self) -> Vec<NodeId> {
        let g = lock(&self.inner.graph);
        let mut out: Vec<NodeId> = g
            .nodes
            .iter()
            .filter(|(_, n)| matches!(n, Node::Materialize { .. }))
            .map(|(id, _)| *id)
            .collect();
        out.sort_unstable();
        out
    }

    /// Whether a run has completed the write of materialize node `id`.
    #[must_use]
    pub fn is_written(&self, id: NodeId) -> bool {
        lock(&self.inner.written).contains(&id)
    }

    pub(crate) fn mark_written(&self, id: NodeId) {
        if lock(&self.inner.written).insert(id) {
            debug!(node = %id, "write completed");
        }
    }

    /// The cache registry of this pipeline instance.
    #[must_use]
    pub fn cache(&self) -> &CacheRegistry {
        &self.inner.cache
    }

    /// Mark a node for caching.
    ///
    /// # Errors
    ///
    /// [`GraphError::UnknownParent`] if `id` is not registered here.
    pub fn mark_cached(&self, id: NodeId, options: CachingOptions) -> Result<(), GraphError> {
        if !lock(&self.inner.graph).nodes.contains_key(&id) {
            return Err(GraphError::UnknownParent(id));
        }
        self.inner.cache.mark_cached(id, options);
        Ok(())
    }

    pub(crate) fn register_deferred(&self, pending: Weak<dyn PendingValue>) {
        lock(&self.inner.deferred).push(pending);
    }

    /// Offer run outputs to every pending deferred value depending on them.
    ///
    /// Dropped and resolved values are pruned from the list on the way.
    pub(crate) fn resolve_deferred(&self, outputs: &HashMap<NodeId, DataHandle>) -> usize {
        let live: Vec<Arc<dyn PendingValue>> = {
            let mut pending = lock(&self.inner.deferred);
            pending.retain(|w| w.upgrade().is_some_and(|v| !v.is_resolved()));
            pending.iter().filter_map(Weak::upgrade).collect()
        };
        let mut resolved = 0;
        for value in live {
            if let Some(handle) = outputs.get(&value.node())
                && value.offer(handle)
            {
                resolved += 1;
            }
        }
        resolved
    }
}

fn validate(g: &GraphState, node: &Node) -> Result<(), GraphError> {
    let parents = node.parents();
    if parents.is_empty() && !node.is_source() {
        return Err(GraphError::DisconnectedGraph(format!(
            "{} node has no parents",
            node.kind_name()
        )));
    }
    let mut parent_types = Vec::with_capacity(parents.len());
    for p in parents {
        let parent = g.nodes.get(p).ok_or(GraphError::UnknownParent(*p))?;
        parent_types.push(parent.element_type().tag());
    }
    let expected = match node {
        Node::Source { .. } => return Ok(()),
        Node::Transform { op, .. } => op.input_type(),
        Node::Aggregate { aggregator, .. } => aggregator.input_type(),
        Node::Union { elem, .. } | Node::Materialize { elem, .. } => elem.tag(),
    };
    match parent_types.into_iter().find(|t| *t != expected) {
        Some(found) => Err(GraphError::TypeMismatch {
            expected: expected.name,
            found: found.name,
        }),
        None => Ok(()),
    }
}

/// Iterative DFS over parent edges with a visited set.
pub(crate) fn closure(
    nodes: &HashMap<NodeId, Node>,
    targets: &[NodeId],
) -> Result<BTreeSet<NodeId>, GraphError> {
    let mut seen = BTreeSet::new();
    let mut stack: Vec<NodeId> = targets.to_vec();
    while let Some(id) = stack.pop() {
        if !seen.insert(id) {
            continue;
        }
        let node = nodes.get(&id).ok_or(GraphError::UnknownParent(id))?;
        stack.extend(node.parents().iter().filter(|p| !seen.contains(p)));
    }
    Ok(seen)
}
