use anyhow::Result;
use lazybeam::testing::RecordingExecutor;
use lazybeam::{
    GraphError, MemoryTarget, NodeId, Pipeline, Runner, WriteMode, build_plan, from_vec,
};
use std::sync::Arc;

#[test]
fn element_wise_chain_fuses_into_one_stage() -> Result<()> {
    let p = Pipeline::default();
    let out = from_vec(&p, vec!["a b".to_string(), "c".to_string()])
        .flat_map(|s: &String| s.split(' ').map(String::from).collect::<Vec<_>>())
        .map(|s: &String| s.len())
        .filter(|n: &usize| *n > 0);

    let plan = build_plan(&p, &[out.node_id()])?;
    assert_eq!(plan.stages.len(), 1);
    assert_eq!(plan.stages[0].nodes.len(), 4);
    assert_eq!(plan.stages[0].output, out.node_id());
    assert!(plan.stages[0].inputs.is_empty());
    assert_eq!(plan.fused_nodes(), 3);
    Ok(())
}

#[test]
fn diamond_shares_the_fan_out_node() -> Result<()> {
    let p = Pipeline::default();
    let a = from_vec(&p, vec![1u32, 2, 3, 4]);
    let b = a.map(|x: &u32| x * 10);
    let c = b.map(|x: &u32| x + 1);
    let d = b.filter(|x: &u32| *x > 15);

    let plan = build_plan(&p, &[c.node_id(), d.node_id()])?;
    assert_eq!(plan.stages.len(), 3);
    assert_eq!(plan.stages[0].nodes, vec![a.node_id(), b.node_id()]);
    assert_eq!(plan.stages[0].output, b.node_id());
    for stage in &plan.stages[1..] {
        assert_eq!(stage.inputs, vec![b.node_id()]);
        assert_eq!(stage.depends_on, vec![0]);
    }
    assert_eq!(plan.stage_for(c.node_id()).map(|s| s.index), Some(1));
    assert_eq!(plan.stage_for(d.node_id()).map(|s| s.index), Some(2));
    Ok(())
}

#[test]
fn targets_and_cached_nodes_end_their_stage() -> Result<()> {
    let p = Pipeline::default();
    let a = from_vec(&p, vec![1u32, 2, 3]);
    let b = a.map(|x: &u32| x + 1);
    let c = b.map(|x: &u32| x * 2).cache();
    let d = c.map(|x: &u32| x - 1);

    let plan = build_plan(&p, &[b.node_id(), d.node_id()])?;
    let outputs: Vec<NodeId> = plan.stages.iter().map(|s| s.output).collect();
    assert_eq!(outputs, vec![b.node_id(), c.node_id(), d.node_id()]);
    assert_eq!(plan.stages[1].depends_on, vec![0]);
    assert_eq!(plan.stages[2].depends_on, vec![1]);
    Ok(())
}

#[test]
fn barriers_fuse_but_are_flagged() -> Result<()> {
    let p = Pipeline::default();
    let grouped = from_vec(&p, vec![("a".to_string(), 1u32), ("b".to_string(), 2)])
        .map(|(k, v): &(String, u32)| (k.clone(), v * 2))
        .group_by_key();

    let plan = build_plan(&p, &[grouped.node_id()])?;
    assert_eq!(plan.stages.len(), 1);
    assert!(plan.stages[0].barrier);
    Ok(())
}

#[test]
fn union_and_aggregate_open_new_stages() -> Result<()> {
    let p = Pipeline::default();
    let a = from_vec(&p, vec![1u32, 2]);
    let b = from_vec(&p, vec![3u32]);
    let u = a.union(&[&b])?;
    let total = u.aggregate(lazybeam::Sum::<u32>::new());

    let plan = build_plan(&p, &[total.node_id()])?;
    assert_eq!(plan.stages.len(), 4);
    let union_stage = plan.stage_for(u.node_id()).expect("union stage");
    assert_eq!(union_stage.inputs, vec![a.node_id(), b.node_id()]);
    assert_eq!(union_stage.depends_on, vec![0, 1]);
    let agg_stage = plan.stage_for(total.node_id()).expect("aggregate stage");
    assert_eq!(agg_stage.depends_on, vec![union_stage.index]);
    assert!(agg_stage.barrier);
    Ok(())
}

#[test]
fn stages_come_after_their_dependencies() -> Result<()> {
    let p = Pipeline::default();
    let a = from_vec(&p, (0..20u32).collect::<Vec<_>>());
    let evens = a.filter(|x: &u32| x % 2 == 0);
    let odds = a.filter(|x: &u32| x % 2 == 1);
    let both = evens.union(&[&odds])?;
    let keyed = both.by(|x: &u32| x % 3).group_by_key();

    let plan = build_plan(&p, &[keyed.node_id(), odds.node_id()])?;
    for stage in &plan.stages {
        assert!(stage.depends_on.iter().all(|d| *d < stage.index));
    }
    Ok(())
}

#[test]
fn planning_is_deterministic() -> Result<()> {
    let p = Pipeline::default();
    let a = from_vec(&p, vec![1u32, 2, 3]);
    let b = a.map(|x: &u32| x + 1);
    let c = a.map(|x: &u32| x + 2);
    let u = b.union(&[&c])?;

    let first = build_plan(&p, &[u.node_id(), b.node_id()])?;
    let second = build_plan(&p, &[b.node_id(), u.node_id(), b.node_id()])?;
    assert_eq!(first.stages, second.stages);
    assert_eq!(first.targets, vec![b.node_id(), u.node_id()]);
    assert_eq!(second.targets, first.targets);
    Ok(())
}

#[test]
fn computed_cache_prunes_upstream_work() -> Result<()> {
    let p = Pipeline::default();
    let a = from_vec(&p, vec![1u32, 2, 3]);
    let b = a.map(|x: &u32| x * 10).cache();
    let c = b.map(|x: &u32| x + 1);
    let d = b.filter(|x: &u32| *x > 10);

    let before = build_plan(&p, &[c.node_id(), d.node_id()])?;
    assert_eq!(before.stages.len(), 3);
    assert!(before.cache_hits.is_empty());

    b.materialize()?;

    let after = build_plan(&p, &[c.node_id(), d.node_id()])?;
    assert_eq!(after.stages.len(), 2);
    assert!(after.cache_hits.contains_key(&b.node_id()));
    assert!(after.stage_for(a.node_id()).is_none());
    for stage in &after.stages {
        assert_eq!(stage.inputs, vec![b.node_id()]);
        assert!(stage.depends_on.is_empty());
    }

    // A plan for the cached node alone has nothing to compute.
    let only_b = build_plan(&p, &[b.node_id()])?;
    assert!(only_b.stages.is_empty());
    assert_eq!(only_b.cache_hits.len(), 1);
    Ok(())
}

#[test]
fn unknown_target_is_rejected() {
    let p = Pipeline::default();
    from_vec(&p, vec![1u32]);
    let err = build_plan(&p, &[NodeId::new(404)]).unwrap_err();
    assert_eq!(err, GraphError::UnknownParent(NodeId::new(404)));
}

#[test]
fn explanation_renders_stages_and_cache_hits() -> Result<()> {
    let p = Pipeline::default();
    let words = from_vec(&p, vec!["x".to_string(), "y".to_string(), "x".to_string()])
        .map_named("lowercase", |s: &String| s.to_lowercase())
        .cache();
    let counts = words.count_values();

    let fresh = counts.explain()?.to_string();
    assert!(fresh.contains("EXECUTION PLAN EXPLANATION"));
    assert!(fresh.contains("lowercase"));
    assert!(fresh.contains("[BARRIER]"));
    assert!(!fresh.contains("CACHE HITS"));

    let recorder = Arc::new(RecordingExecutor::new());
    words.materialize_with(&Runner::default().with_executor(recorder))?;

    let explained = counts.explain()?;
    assert_eq!(explained.cache_hits, vec![words.node_id()]);
    let rendered = explained.to_string();
    assert!(rendered.contains(&format!("{} served from cache", words.node_id())));
    assert!(!rendered.contains("lowercase"));
    Ok(())
}

#[test]
fn completed_writes_are_planned_as_pass_through() -> Result<()> {
    let p = Pipeline::default();
    let src = from_vec(&p, vec![1u32, 2]);
    let appended = src.write(MemoryTarget::<u32>::new("log"), WriteMode::Append)?;
    let replaced = src.write(MemoryTarget::<u32>::new("snapshot"), WriteMode::Overwrite)?;

    let first = build_plan(&p, &[appended.node_id(), replaced.node_id()])?;
    assert!(first.replayed_writes.is_empty());
    Runner::default().run_all(&p)?;

    // Only a repeatable write that is itself a target runs again.
    let again = build_plan(&p, &[appended.node_id(), replaced.node_id()])?;
    assert_eq!(
        again.replayed_writes.iter().copied().collect::<Vec<_>>(),
        vec![appended.node_id()]
    );

    let downstream = replaced.map(|x: &u32| x + 1);
    let plan = build_plan(&p, &[downstream.node_id()])?;
    assert!(plan.replayed_writes.contains(&replaced.node_id()));
    assert_eq!(
        plan.stage_for(replaced.node_id()).map(|s| s.output),
        Some(downstream.node_id())
    );
    assert!(plan.explain().to_string().contains("snapshot (Overwrite) [written]"));
    Ok(())
}
