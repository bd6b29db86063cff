use lazybeam::{NodeId, Pipeline, from_vec};
use std::collections::{BTreeSet, HashSet};

#[test]
fn test_node_id_creation() {
    let id1 = NodeId::new(1);
    let id2 = NodeId::new(2);

    assert_eq!(id1.raw(), 1);
    assert_eq!(id2.raw(), 2);
    assert_ne!(id1, id2);
}

#[test]
fn test_node_id_display_and_order() {
    let ids: BTreeSet<NodeId> = [NodeId::new(7), NodeId::new(2), NodeId::new(4)]
        .into_iter()
        .collect();
    let shown: Vec<String> = ids.iter().map(ToString::to_string).collect();
    assert_eq!(shown, vec!["#2", "#4", "#7"]);
}

#[test]
fn test_node_id_serde() -> anyhow::Result<()> {
    let id = NodeId::new(42);
    let json = serde_json::to_string(&id)?;
    let back: NodeId = serde_json::from_str(&json)?;
    assert_eq!(id, back);
    Ok(())
}

#[test]
fn test_ids_are_unique_and_increasing() {
    let p = Pipeline::default();
    let a = from_vec(&p, vec![1u32, 2, 3]);
    let b = a.map(|x: &u32| x + 1);
    let c = b.filter(|x: &u32| x % 2 == 0);

    let ids = [a.node_id(), b.node_id(), c.node_id()];
    assert!(ids.windows(2).all(|w| w[0] < w[1]));
    let set: HashSet<_> = ids.iter().collect();
    assert_eq!(set.len(), 3);
}
