use anyhow::Result;
use lazybeam::testing::{
    RecordingExecutor, assert_collections_unordered_equal, assert_run_succeeded,
    assert_stage_status,
};
use lazybeam::*;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

fn recording_runner(retry: RetryPolicy) -> (Runner, Arc<RecordingExecutor>) {
    let recorder = Arc::new(RecordingExecutor::new());
    let config = RunnerConfig {
        retry,
        ..RunnerConfig::default()
    };
    let runner = Runner::new(config).with_executor(recorder.clone());
    (runner, recorder)
}

fn quick_retries(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        backoff_ms: 1,
    }
}

#[test]
fn independent_branches_all_succeed() -> Result<()> {
    let p = Pipeline::default();
    let src = from_vec(&p, (1..=6u32).collect::<Vec<_>>());
    let evens = src.filter(|x: &u32| x % 2 == 0);
    let odds = src.filter(|x: &u32| x % 2 == 1);
    let (runner, recorder) = recording_runner(RetryPolicy::none());

    let result = runner.run(&p, &[evens.node_id(), odds.node_id()])?;
    assert_run_succeeded(&result);
    assert_eq!(result.status(), RunStatus::Succeeded);
    assert_eq!(result.stages.len(), 3);
    assert_eq!(recorder.total_submissions(), 3);
    assert_eq!(result.submitted_stages(), 3);

    let evens_out = result.output(evens.node_id()).and_then(|h| h.downcast_vec::<u32>());
    assert_eq!(evens_out, Some(&vec![2, 4, 6]));
    Ok(())
}

#[test]
fn failure_skips_only_dependents() -> Result<()> {
    let p = Pipeline::default();
    let src = from_vec(&p, vec![1u32, 2, 3]);
    let a = src.map(|x: &u32| x + 1);
    let c = a.map(|x: &u32| x * 2);
    let d = a.filter(|x: &u32| *x > 2);
    let b = src.map(|x: &u32| x * 100);

    let (runner, recorder) = recording_runner(quick_retries(3));
    recorder.fail_next(a.node_id(), StageError::data("corrupt row"));

    let result = runner.run(&p, &[c.node_id(), d.node_id(), b.node_id()])?;

    assert_stage_status(
        &result,
        a.node_id(),
        &StageStatus::Failed(StageError::data("corrupt row")),
    );
    assert_stage_status(&result, c.node_id(), &StageStatus::Skipped);
    assert_stage_status(&result, d.node_id(), &StageStatus::Skipped);
    assert_stage_status(&result, b.node_id(), &StageStatus::Succeeded);
    assert_eq!(result.status(), RunStatus::Partial);

    let failure = result.failure.clone().expect("run failure");
    assert_eq!(failure.output, a.node_id());
    assert_eq!(failure.stage, result.report_for(a.node_id()).map_or(0, |r| r.index));
    assert_eq!(failure.kind, FailureKind::DataError);
    assert_eq!(failure.unresolved, vec![c.node_id(), d.node_id()]);

    // Data errors are never retried.
    assert_eq!(recorder.submissions_for(a.node_id()), 1);
    assert_eq!(recorder.submissions_for(c.node_id()), 0);

    assert!(matches!(result.into_outputs(), Err(RunError::Stage(_))));
    Ok(())
}

#[test]
fn transient_failures_are_retried() -> Result<()> {
    let p = Pipeline::default();
    let out = from_vec(&p, vec![1u32, 2]).map(|x: &u32| x + 1);
    let (runner, recorder) = recording_runner(quick_retries(3));
    recorder.fail_times(out.node_id(), 2, StageError::transient("worker lost"));

    let result = runner.run(&p, &[out.node_id()])?;
    assert_run_succeeded(&result);
    assert_eq!(result.report_for(out.node_id()).map(|r| r.attempts), Some(3));
    assert_eq!(recorder.submissions_for(out.node_id()), 3);
    Ok(())
}

#[test]
fn retries_are_bounded() -> Result<()> {
    let p = Pipeline::default();
    let out = from_vec(&p, vec![1u32, 2]).map(|x: &u32| x + 1);
    let (runner, recorder) = recording_runner(quick_retries(3));
    recorder.fail_times(out.node_id(), 3, StageError::transient("worker lost"));

    let result = runner.run(&p, &[out.node_id()])?;
    assert_eq!(result.status(), RunStatus::Failed);
    let failure = result.failure.expect("run failure");
    assert_eq!(failure.kind, FailureKind::TransientWorkerFailure);
    assert_eq!(recorder.submissions_for(out.node_id()), 3);
    Ok(())
}

#[test]
fn resource_exhaustion_carries_backpressure_hint() -> Result<()> {
    let p = Pipeline::default();
    let out = from_vec(&p, vec![1u32]).map(|x: &u32| x + 1);
    let (runner, recorder) = recording_runner(quick_retries(5));
    recorder.fail_next(
        out.node_id(),
        StageError::exhausted("no free workers", Some(Duration::from_secs(2))),
    );

    let result = runner.run(&p, &[out.node_id()])?;
    let failure = result.failure.expect("run failure");
    assert_eq!(failure.kind, FailureKind::ResourceExhausted);
    assert_eq!(failure.retry_after, Some(Duration::from_secs(2)));
    assert_eq!(recorder.submissions_for(out.node_id()), 1);
    Ok(())
}

#[test]
fn cancelled_token_submits_nothing() -> Result<()> {
    let p = Pipeline::default();
    let src = from_vec(&p, vec![1u32, 2, 3]);
    let a = src.map(|x: &u32| x + 1);
    let b = src.map(|x: &u32| x + 2);
    let (runner, recorder) = recording_runner(RetryPolicy::none());

    let token = CancelToken::new();
    token.cancel();
    let result = runner.run_with_cancel(&p, &[a.node_id(), b.node_id()], &token)?;

    assert!(result.stages.iter().all(|r| r.status == StageStatus::Cancelled));
    assert_eq!(recorder.total_submissions(), 0);
    assert_eq!(result.status(), RunStatus::Failed);
    assert_eq!(
        result.failure.map(|f| f.kind),
        Some(FailureKind::Cancelled)
    );
    Ok(())
}

#[test]
fn cancellation_keeps_cached_progress() -> Result<()> {
    let p = Pipeline::default();
    let a = from_vec(&p, (0..100u32).collect::<Vec<_>>())
        .map(|x: &u32| x * 3)
        .cache();
    let b = a.map(|x: &u32| x + 1);
    let (runner, recorder) = recording_runner(RetryPolicy::none());
    recorder.delay(b.node_id(), Duration::from_secs(30));

    let token = CancelToken::with_timeout(Duration::from_millis(500));
    let result = runner.run_with_cancel(&p, &[b.node_id()], &token)?;

    assert_stage_status(&result, a.node_id(), &StageStatus::Succeeded);
    assert_stage_status(&result, b.node_id(), &StageStatus::Cancelled);
    assert!(p.cache().is_computed(a.node_id()));

    let replan = build_plan(&p, &[b.node_id()])?;
    assert_eq!(replan.stages.len(), 1);
    assert!(replan.cache_hits.contains_key(&a.node_id()));
    Ok(())
}

/// Holds the stage producing `node` until another run follows its flight.
struct HoldForFollower {
    pipeline: Pipeline,
    node: NodeId,
    inner: LocalExecutor,
    submissions: AtomicUsize,
}

impl Executor for HoldForFollower {
    fn submit(&self, work: StageWork, cancel: &CancelToken) -> Result<DataHandle, StageError> {
        if work.stage.output == self.node {
            self.submissions.fetch_add(1, Ordering::SeqCst);
            let give_up = Instant::now() + Duration::from_secs(10);
            while self.pipeline.cache().followers(self.node) == 0 && Instant::now() < give_up {
                thread::sleep(Duration::from_millis(5));
            }
        }
        self.inner.submit(work, cancel)
    }
}

#[test]
fn concurrent_runs_compute_a_cached_node_once() -> Result<()> {
    let p = Pipeline::default();
    let slow = from_vec(&p, (0..1_000u64).collect::<Vec<_>>())
        .map(|x: &u64| x * x)
        .cache();
    let gate = Arc::new(HoldForFollower {
        pipeline: p.clone(),
        node: slow.node_id(),
        inner: LocalExecutor::default(),
        submissions: AtomicUsize::new(0),
    });
    let runner = Runner::new(RunnerConfig {
        retry: RetryPolicy::none(),
        ..RunnerConfig::default()
    })
    .with_executor(gate.clone());

    let results: Vec<RunResult> = thread::scope(|s| {
        let handles: Vec<_> = (0..2)
            .map(|_| s.spawn(|| runner.run(&p, &[slow.node_id()])))
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("run thread panicked"))
            .collect::<Result<Vec<_>, _>>()
    })?;

    assert_eq!(gate.submissions.load(Ordering::SeqCst), 1);
    assert_eq!(p.cache().followers(slow.node_id()), 0);
    for result in &results {
        assert_run_succeeded(result);
    }

    // The leader holds its stage until the other run joins, so both runs plan it.
    let reports: Vec<&StageReport> = results
        .iter()
        .filter_map(|r| r.report_for(slow.node_id()))
        .collect();
    assert_eq!(reports.len(), 2);
    let leader = reports
        .iter()
        .find(|r| r.status == StageStatus::Succeeded)
        .expect("one run leads");
    let follower = reports
        .iter()
        .find(|r| r.status == StageStatus::Reused)
        .expect("one run follows");
    assert_eq!(leader.attempts, 1);
    assert_eq!(follower.attempts, 0);

    let first = results[0].output(slow.node_id()).expect("output");
    let second = results[1].output(slow.node_id()).expect("output");
    assert!(first.same_data(second));
    Ok(())
}

#[test]
fn unrepresentable_timeout_never_trips() -> Result<()> {
    let token = CancelToken::with_timeout(Duration::MAX);
    assert!(!token.is_cancelled());
    assert_eq!(token.remaining(), None);
    assert!(token.sleep(Duration::from_millis(1)));

    let p = Pipeline::default();
    let out = from_vec(&p, vec![1u32, 2]).map(|x: &u32| x * 3);
    let result = Runner::default().run_with_cancel(&p, &[out.node_id()], &token)?;
    assert_run_succeeded(&result);
    assert_eq!(
        result.output(out.node_id()).and_then(|h| h.downcast_vec::<u32>()),
        Some(&vec![3, 6])
    );

    let stopped = CancelToken::new();
    stopped.cancel();
    assert!(!stopped.sleep(Duration::MAX));
    Ok(())
}

#[test]
fn expired_cache_entries_are_recomputed() -> Result<()> {
    let p = Pipeline::default();
    let a = from_vec(&p, vec![1u32, 2, 3])
        .map(|x: &u32| x + 1)
        .cache_with(CachingOptions::default().expire_after(Duration::from_millis(50)));
    let (runner, recorder) = recording_runner(RetryPolicy::none());

    a.materialize_with(&runner)?;
    a.materialize_with(&runner)?;
    assert_eq!(recorder.submissions_for(a.node_id()), 1);

    thread::sleep(Duration::from_millis(120));
    let out = a.materialize_with(&runner)?;
    assert_eq!(out.to_vec(), vec![2, 3, 4]);
    assert_eq!(recorder.submissions_for(a.node_id()), 2);
    Ok(())
}

#[test]
fn unreadable_cache_entry_is_recomputed() -> Result<()> {
    let p = Pipeline::default();
    let a = from_vec(&p, vec![5u32, 6]).map(|x: &u32| x * 2).cache();
    let garbage = DataHandle::from_parts(Arc::new("garbage".to_string()), ElementType::of::<u32>());
    assert!(p.cache().record_computed(a.node_id(), garbage));

    let (runner, recorder) = recording_runner(RetryPolicy::none());
    let out = a.materialize_with(&runner)?;
    assert_eq!(out.to_vec(), vec![10, 12]);
    assert_eq!(recorder.submissions_for(a.node_id()), 1);
    assert!(p.cache().lookup(a.node_id()).is_some_and(|h| h.is_readable()));
    Ok(())
}

#[test]
fn run_all_executes_every_declared_write() -> Result<()> {
    let p = Pipeline::default();
    let src = from_vec(&p, vec![1u32, 2, 3]);
    let doubled = MemoryTarget::<u32>::new("doubled");
    let small = MemoryTarget::<u32>::new("small");
    let w1 = src.map(|x: &u32| x * 2).write(doubled.clone(), WriteMode::Overwrite)?;
    let w2 = src.filter(|x: &u32| *x < 3).write(small.clone(), WriteMode::Overwrite)?;
    assert_eq!(doubled.contents(), None);

    let result = Runner::default().run_all(&p)?;
    assert_run_succeeded(&result);
    assert_eq!(doubled.contents(), Some(vec![2, 4, 6]));
    assert_eq!(small.contents(), Some(vec![1, 2]));
    assert!(p.is_written(w1.node_id()) && p.is_written(w2.node_id()));

    let produced: Vec<NodeId> = result.into_outputs()?.into_keys().collect();
    assert_collections_unordered_equal(&produced, &[w1.node_id(), w2.node_id()]);
    Ok(())
}

#[test]
fn executor_returning_wrong_type_is_a_data_error() -> Result<()> {
    struct Liar;

    impl Executor for Liar {
        fn submit(&self, _work: StageWork, _cancel: &CancelToken) -> Result<DataHandle, StageError> {
            Ok(DataHandle::from_vec(vec!["not a number".to_string()]))
        }
    }

    let p = Pipeline::default();
    let out = from_vec(&p, vec![1u32]);
    let runner = Runner::default().with_executor(Arc::new(Liar));
    let result = runner.run(&p, &[out.node_id()])?;
    assert_eq!(result.failure.map(|f| f.kind), Some(FailureKind::DataError));
    Ok(())
}

#[test]
fn config_reads_overrides_and_ignores_garbage() {
    let cfg = RunnerConfig::from_lookup(|key| match key {
        "LAZYBEAM_MAX_PARALLEL_STAGES" => Some("3".to_string()),
        "LAZYBEAM_RETRY_ATTEMPTS" => Some(" 7 ".to_string()),
        "LAZYBEAM_RETRY_BACKOFF_MS" => Some("soon".to_string()),
        "LAZYBEAM_PARTITIONS" => Some("0".to_string()),
        _ => None,
    });
    assert_eq!(cfg.max_parallel_stages, 3);
    assert_eq!(cfg.retry.max_attempts, 7);
    assert_eq!(cfg.retry.backoff_ms, RetryPolicy::default().backoff_ms);
    assert_eq!(cfg.default_partitions, 1);
}

#[test]
fn config_deserializes_with_defaults() -> Result<()> {
    let cfg: RunnerConfig = serde_json::from_str(r#"{"max_parallel_stages": 2}"#)?;
    assert_eq!(cfg.max_parallel_stages, 2);
    assert_eq!(cfg.retry, RetryPolicy::default());
    assert_eq!(cfg.default_partitions, RunnerConfig::default().default_partitions);
    Ok(())
}
