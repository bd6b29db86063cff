use anyhow::Result;
use lazybeam::io::{MemoryTarget, VecSource, WriteMode};
use lazybeam::node::{DynOp, Node, TransformKind};
use lazybeam::testing::TestPipeline;
use lazybeam::type_token::{ElementType, Partition, TypeTag};
use lazybeam::{GraphError, NodeId, Pipeline, StageError, from_vec};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread;

/// Identity op over `Vec<u32>`.
struct PassU32;

impl DynOp for PassU32 {
    fn apply(&self, input: Partition) -> Result<Partition, StageError> {
        Ok(input)
    }

    fn input_type(&self) -> TypeTag {
        TypeTag::of::<u32>()
    }
}

fn source_u32(data: Vec<u32>) -> Node {
    Node::Source {
        source: Arc::new(VecSource::new(data)),
        elem: ElementType::of::<u32>(),
    }
}

fn pass(parent: NodeId) -> Node {
    Node::Transform {
        parent,
        kind: TransformKind::Map,
        op: Arc::new(PassU32),
        output: ElementType::of::<u32>(),
        name: None,
    }
}

#[test]
fn add_node_assigns_increasing_ids_and_edges() -> Result<()> {
    let p = TestPipeline::new();
    let a = p.add_node(source_u32(vec![1, 2]))?;
    let b = p.add_node(pass(a))?;
    let c = p.add_node(pass(b))?;

    assert!(a < b && b < c);
    assert_eq!(p.node_count(), 3);
    assert_eq!(p.edge_count(), 2);
    assert_eq!(p.consumers_of(a), vec![b]);
    assert_eq!(p.element_type(c), Some(ElementType::of::<u32>()));
    Ok(())
}

#[test]
fn unknown_parent_is_rejected_without_trace() {
    let p = TestPipeline::new();
    let err = p.add_node(pass(NodeId::new(99))).unwrap_err();
    assert_eq!(err, GraphError::UnknownParent(NodeId::new(99)));
    assert_eq!(p.node_count(), 0);
    assert_eq!(p.edge_count(), 0);
}

#[test]
fn parentless_union_is_disconnected() {
    let p = Pipeline::default();
    let err = p
        .add_node(Node::Union {
            parents: vec![],
            elem: ElementType::of::<u32>(),
        })
        .unwrap_err();
    assert!(matches!(err, GraphError::DisconnectedGraph(_)));
    assert_eq!(p.node_count(), 0);
}

#[test]
fn transform_input_type_is_checked() -> Result<()> {
    let p = TestPipeline::new();
    let strings = from_vec(&p, vec!["x".to_string()]);
    let before = p.node_count();

    let err = p.add_node(pass(strings.node_id())).unwrap_err();
    assert!(matches!(
        err,
        GraphError::TypeMismatch { expected, .. } if expected == "u32"
    ));
    assert_eq!(p.node_count(), before);
    Ok(())
}

#[test]
fn union_with_mismatched_types_leaves_graph_unchanged() -> Result<()> {
    let p = TestPipeline::new();
    let a = p.add_node(source_u32(vec![1]))?;
    let s = from_vec(&p, vec!["nope".to_string()]);
    let before = (p.node_count(), p.edge_count());

    let err = p
        .add_node(Node::Union {
            parents: vec![a, s.node_id()],
            elem: ElementType::of::<u32>(),
        })
        .unwrap_err();

    assert!(matches!(err, GraphError::TypeMismatch { .. }));
    assert_eq!((p.node_count(), p.edge_count()), before);
    Ok(())
}

#[test]
fn ancestors_visit_shared_nodes_once() -> Result<()> {
    let p = Pipeline::default();
    let a = from_vec(&p, vec![1u32, 2, 3]);
    let b = a.map(|x: &u32| x * 2);
    let c = b.map(|x: &u32| x + 1);
    let d = b.filter(|x: &u32| *x > 2);
    let u = c.union(&[&d])?;

    let closure = p.ancestors_of(&[u.node_id()])?;
    let expected: BTreeSet<NodeId> = [a, b, c, d, u.clone()]
        .iter()
        .map(|c| c.node_id())
        .collect();
    assert_eq!(closure, expected);

    let err = p.ancestors_of(&[NodeId::new(1_000)]).unwrap_err();
    assert_eq!(err, GraphError::UnknownParent(NodeId::new(1_000)));
    Ok(())
}

#[test]
fn concurrent_construction_yields_unique_ids() {
    let p = Pipeline::default();
    let root = from_vec(&p, (0..10u32).collect::<Vec<_>>());

    let ids: Vec<NodeId> = thread::scope(|s| {
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let root = root.clone();
                s.spawn(move || {
                    (0..25)
                        .map(|_| root.map(move |x: &u32| x + i).node_id())
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        handles
            .into_iter()
            .flat_map(|h| h.join().unwrap_or_default())
            .collect()
    });

    let unique: BTreeSet<NodeId> = ids.iter().copied().collect();
    assert_eq!(ids.len(), 200);
    assert_eq!(unique.len(), 200);
    assert_eq!(p.node_count(), 201);
}

#[test]
fn write_nodes_lists_materializations() -> Result<()> {
    let p = Pipeline::default();
    let a = from_vec(&p, vec![1u32]);
    let w1 = a.write(MemoryTarget::<u32>::new("one"), WriteMode::Overwrite)?;
    let w2 = a
        .map(|x: &u32| x + 1)
        .write(MemoryTarget::<u32>::new("two"), WriteMode::Overwrite)?;

    assert_eq!(p.write_nodes(), vec![w1.node_id(), w2.node_id()]);
    Ok(())
}
