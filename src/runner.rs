//! Materialization runner.
//!
//! [`Runner`] plans the requested targets, then executes the plan in waves: every
//! stage whose dependencies have all succeeded is submitted to the [`Executor`],
//! and the stages of one wave run concurrently on rayon's pool, at most
//! [`RunnerConfig::max_parallel_stages`] at a time. Waiting on another run's
//! in-flight computation never occupies a pool worker.
//!
//! - Stages producing a cached node go through
//!   [`CacheRegistry::claim`](crate::cache::CacheRegistry::claim), so concurrent
//!   runs of one pipeline compute a cached node at most once.
//! - Transient failures are retried per [`RetryPolicy`]; any other failure is final
//!   for its stage, and only that stage's dependents are skipped.
//! - Cancellation stops new submissions; results already recorded in the cache
//!   stay there.
//! - A write that completed is recorded in the pipeline; later runs reading
//!   through it forward its data without writing again.
//! - When the run ends, every pending [`DeferredValue`](crate::DeferredValue) whose
//!   node was produced is resolved.

use crate::cancel::CancelToken;
use crate::cache::{Claim, Flight, FlightGuard};
use crate::error::{FailureKind, GraphError, RunError, StageError};
use crate::executor::{Executor, LocalExecutor, StageWork};
use crate::node::Node;
use crate::node_id::NodeId;
use crate::pipeline::Pipeline;
use crate::planner::{Plan, Stage, build_plan};
use crate::type_token::DataHandle;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::{Display, Formatter, Result as FormatResult};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// How often a transiently failing stage is attempted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts per stage, including the first. `0` behaves like `1`.
    pub max_attempts: u32,
    /// Base delay; attempt `n` waits `n * backoff_ms` before the next try.
    pub backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: 50,
        }
    }
}

impl RetryPolicy {
    /// No retries at all.
    #[must_use]
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            backoff_ms: 0,
        }
    }

    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.backoff_ms.saturating_mul(u64::from(attempt)))
    }
}

/// Runner settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Upper bound on stages executing concurrently within one run.
    pub max_parallel_stages: usize,
    /// Partition count for the default [`LocalExecutor`].
    pub default_partitions: usize,
    pub retry: RetryPolicy,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_parallel_stages: num_cpus::get().max(1),
            default_partitions: 2 * num_cpus::get().max(2),
            retry: RetryPolicy::default(),
        }
    }
}

impl RunnerConfig {
    /// Defaults overridden by `LAZYBEAM_*` environment variables.
    ///
    /// | variable | field |
    /// |---|---|
    /// | `LAZYBEAM_MAX_PARALLEL_STAGES` | `max_parallel_stages` |
    /// | `LAZYBEAM_PARTITIONS` | `default_partitions` |
    /// | `LAZYBEAM_RETRY_ATTEMPTS` | `retry.max_attempts` |
    /// | `LAZYBEAM_RETRY_BACKOFF_MS` | `retry.backoff_ms` |
    ///
    /// Unparsable values are logged and ignored.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) with a custom variable lookup.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();
        apply(&lookup, "LAZYBEAM_MAX_PARALLEL_STAGES", &mut cfg.max_parallel_stages);
        apply(&lookup, "LAZYBEAM_PARTITIONS", &mut cfg.default_partitions);
        apply(&lookup, "LAZYBEAM_RETRY_ATTEMPTS", &mut cfg.retry.max_attempts);
        apply(&lookup, "LAZYBEAM_RETRY_BACKOFF_MS", &mut cfg.retry.backoff_ms);
        cfg.max_parallel_stages = cfg.max_parallel_stages.max(1);
        cfg.default_partitions = cfg.default_partitions.max(1);
        cfg
    }
}

fn apply<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) {
    if let Some(raw) = lookup(key) {
        match raw.trim().parse() {
            Ok(v) => *slot = v,
            Err(_) => warn!(key, value = %raw, "ignoring unparsable override"),
        }
    }
}

/// Outcome of one stage within a run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StageStatus {
    /// Executed successfully.
    Succeeded,
    /// Served from the cache or from another run's in-flight computation.
    Reused,
    Failed(StageError),
    /// Not attempted because a dependency did not succeed.
    Skipped,
    Cancelled,
}

impl StageStatus {
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, StageStatus::Succeeded | StageStatus::Reused)
    }
}

#[derive(Clone, Debug)]
pub struct StageReport {
    pub index: usize,
    pub output: NodeId,
    pub status: StageStatus,
    /// Executor submissions made for this stage (0 when reused or skipped).
    pub attempts: u32,
    pub elapsed: Duration,
}

/// Overall outcome of a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunStatus {
    Succeeded,
    /// Some targets were produced, others were not.
    Partial,
    Failed,
}

/// The first fatal failure of a run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunFailure {
    /// Index of the failing stage.
    pub stage: usize,
    /// Output node of the failing stage.
    pub output: NodeId,
    pub kind: FailureKind,
    pub message: String,
    /// Backpressure hint from the executor.
    pub retry_after: Option<Duration>,
    /// Targets the run did not produce.
    pub unresolved: Vec<NodeId>,
}

impl Display for RunFailure {
    fn fmt(&self, f: &mut Formatter<'_>) -> FormatResult {
        write!(
            f,
            "stage {} (output {}) failed with {:?}: {}",
            self.stage, self.output, self.kind, self.message
        )?;
        if !self.unresolved.is_empty() {
            write!(f, "; unresolved targets {:?}", self.unresolved)?;
        }
        Ok(())
    }
}

/// Everything a run produced.
#[derive(Clone, Debug)]
pub struct RunResult {
    /// One report per planned stage, by stage index.
    pub stages: Vec<StageReport>,
    /// Data of every stage output and cache hit of the run.
    pub outputs: HashMap<NodeId, DataHandle>,
    pub targets: Vec<NodeId>,
    pub failure: Option<RunFailure>,
}

impl RunResult {
    #[must_use]
    pub fn status(&self) -> RunStatus {
        let produced = self
            .targets
            .iter()
            .filter(|t| self.outputs.contains_key(t))
            .count();
        if self.failure.is_none() && produced == self.targets.len() {
            RunStatus::Succeeded
        } else if produced > 0 {
            RunStatus::Partial
        } else {
            RunStatus::Failed
        }
    }

    #[must_use]
    pub fn output(&self, id: NodeId) -> Option<&DataHandle> {
        self.outputs.get(&id)
    }

    /// The report of the stage producing `id`.
    #[must_use]
    pub fn report_for(&self, id: NodeId) -> Option<&StageReport> {
        self.stages.iter().find(|r| r.output == id)
    }

    /// Stages that reached the executor at least once.
    #[must_use]
    pub fn submitted_stages(&self) -> usize {
        self.stages.iter().filter(|r| r.attempts > 0).count()
    }

    /// Target outputs, or the run's failure.
    ///
    /// # Errors
    ///
    /// [`RunError::Stage`] if any stage failed or the run was cancelled.
    pub fn into_outputs(self) -> Result<HashMap<NodeId, DataHandle>, RunError> {
        if let Some(failure) = self.failure {
            return Err(RunError::Stage(failure));
        }
        let targets = self.targets;
        Ok(self
            .outputs
            .into_iter()
            .filter(|(id, _)| targets.contains(id))
            .collect())
    }
}

/// Executes plans against an [`Executor`].
#[derive(Clone)]
pub struct Runner {
    config: RunnerConfig,
    executor: Arc<dyn Executor>,
}

impl Default for Runner {
    fn default() -> Self {
        Self::new(RunnerConfig::default())
    }
}

impl Runner {
    /// Runner using a [`LocalExecutor`] sized from `config`.
    #[must_use]
    pub fn new(config: RunnerConfig) -> Self {
        let executor = Arc::new(LocalExecutor::new(config.default_partitions));
        Self { config, executor }
    }

    /// Replace the executor.
    #[must_use]
    pub fn with_executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = executor;
        self
    }

    #[must_use]
    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Plan and execute `targets`.
    ///
    /// # Errors
    ///
    /// Planning errors only; stage failures are reported in the [`RunResult`].
    pub fn run(&self, p: &Pipeline, targets: &[NodeId]) -> Result<RunResult, GraphError> {
        self.run_with_cancel(p, targets, &CancelToken::new())
    }

    /// Run every materialize node of the pipeline.
    ///
    /// # Errors
    ///
    /// See [`run`](Self::run).
    pub fn run_all(&self, p: &Pipeline) -> Result<RunResult, GraphError> {
        self.run(p, &p.write_nodes())
    }

    /// Plan and execute `targets`, stopping early once `cancel` trips.
    ///
    /// # Errors
    ///
    /// See [`run`](Self::run).
    pub fn run_with_cancel(
        &self,
        p: &Pipeline,
        targets: &[NodeId],
        cancel: &CancelToken,
    ) -> Result<RunResult, GraphError> {
        let plan = build_plan(p, targets)?;
        let (nodes, _) = p.snapshot();
        info!(
            targets = plan.targets.len(),
            stages = plan.stages.len(),
            cache_hits = plan.cache_hits.len(),
            "starting run"
        );

        let mut outputs: HashMap<NodeId, DataHandle> = plan
            .cache_hits
            .iter()
            .map(|(id, h)| (*id, h.clone()))
            .collect();
        let mut reports: Vec<Option<StageReport>> = vec![None; plan.stages.len()];
        let parallel = self.config.max_parallel_stages.max(1);

        loop {
            skip_blocked(&plan, &mut reports);
            let pending: Vec<&Stage> = plan
                .stages
                .iter()
                .filter(|s| reports[s.index].is_none())
                .collect();
            if pending.is_empty() {
                break;
            }
            if cancel.is_cancelled() {
                for stage in pending {
                    reports[stage.index] = Some(report(stage, StageStatus::Cancelled, 0, Duration::ZERO));
                }
                break;
            }
            let ready: Vec<&Stage> = pending
                .into_iter()
                .filter(|s| {
                    s.depends_on
                        .iter()
                        .all(|d| reports[*d].as_ref().is_some_and(|r| r.status.is_success()))
                })
                .collect();
            if ready.is_empty() {
                break;
            }
            debug!(stages = ready.len(), "submitting wave");
            for chunk in ready.chunks(parallel) {
                for (rep, handle) in self.execute_chunk(p, &nodes, &plan, chunk, &outputs, cancel) {
                    if let Some(h) = handle {
                        outputs.insert(rep.output, h);
                    }
                    if rep.status == StageStatus::Succeeded {
                        record_writes(p, &nodes, &plan.stages[rep.index]);
                    }
                    let idx = rep.index;
                    reports[idx] = Some(rep);
                }
            }
        }

        let stages: Vec<StageReport> = reports
            .into_iter()
            .zip(&plan.stages)
            .map(|(r, s)| r.unwrap_or_else(|| report(s, StageStatus::Skipped, 0, Duration::ZERO)))
            .collect();
        let failure = first_failure(&stages, &plan.targets, &outputs);
        let result = RunResult {
            stages,
            outputs,
            targets: plan.targets,
            failure,
        };

        let resolved = p.resolve_deferred(&result.outputs);
        match &result.failure {
            None => info!(resolved_values = resolved, "run succeeded"),
            Some(f) => warn!(status = ?result.status(), failure = %f, "run did not succeed"),
        }
        Ok(result)
    }

    /// Execute one chunk of ready stages.
    ///
    /// Cache claims are made on the calling thread. Only stages this run leads go
    /// to the rayon pool; waits on other runs' in-flight computations happen
    /// afterwards on the calling thread, so no pool worker ever blocks on a flight.
    fn execute_chunk(
        &self,
        p: &Pipeline,
        nodes: &HashMap<NodeId, Node>,
        plan: &Plan,
        chunk: &[&Stage],
        outputs: &HashMap<NodeId, DataHandle>,
        cancel: &CancelToken,
    ) -> Vec<(StageReport, Option<DataHandle>)> {
        let cache = p.cache();
        let mut done = Vec::with_capacity(chunk.len());
        let mut leaders: Vec<(&Stage, StageWork, Option<FlightGuard<'_>>)> = Vec::new();
        let mut followers: Vec<(&Stage, StageWork, Arc<Flight>)> = Vec::new();

        for &stage in chunk {
            let work = match stage_work(nodes, plan, stage, outputs) {
                Ok(w) => w,
                Err(e) => {
                    done.push(finish(stage, Err(e), 0, false, Duration::ZERO));
                    continue;
                }
            };
            if !cache.is_cached(stage.output) {
                leaders.push((stage, work, None));
                continue;
            }
            match cache.claim(stage.output) {
                Claim::Ready(h) => done.push(finish(stage, Ok(h), 0, true, Duration::ZERO)),
                Claim::Follower(flight) => followers.push((stage, work, flight)),
                Claim::Leader(guard) => leaders.push((stage, work, Some(guard))),
            }
        }

        let ran: Vec<(StageReport, Option<DataHandle>)> = leaders
            .into_par_iter()
            .map(|(stage, work, guard)| {
                let start = Instant::now();
                let (result, attempts) = self.submit_with_retry(work, cancel);
                let result = match guard {
                    Some(g) => g.complete(result),
                    None => result,
                };
                finish(stage, result, attempts, false, start.elapsed())
            })
            .collect();
        done.extend(ran);

        for (stage, work, mut flight) in followers {
            debug!(stage = stage.index, node = %stage.output, "waiting for in-flight computation");
            let start = Instant::now();
            let (result, attempts, reused) = loop {
                match flight.wait(cancel) {
                    // The leader's own run was cancelled; this run takes the node over.
                    Err(e) if e.kind == FailureKind::Cancelled && !cancel.is_cancelled() => {
                        match cache.claim(stage.output) {
                            Claim::Ready(h) => break (Ok(h), 0, true),
                            Claim::Follower(next) => flight = next,
                            Claim::Leader(guard) => {
                                let (r, attempts) = self.submit_with_retry(work, cancel);
                                break (guard.complete(r), attempts, false);
                            }
                        }
                    }
                    other => break (other, 0, true),
                }
            };
            done.push(finish(stage, result, attempts, reused, start.elapsed()));
        }
        done
    }

    fn submit_with_retry(&self, work: StageWork, cancel: &CancelToken) -> (Result<DataHandle, StageError>, u32) {
        let max_attempts = self.config.retry.max_attempts.max(1);
        let expected = work
            .chain
            .last()
            .map(|(_, n)| n.element_type().clone());
        let mut attempt = 0;
        loop {
            if cancel.is_cancelled() {
                return (Err(StageError::cancelled()), attempt);
            }
            attempt += 1;
            debug!(stage = work.stage.index, attempt, "submitting stage");
            let result = self.executor.submit(work.clone(), cancel).and_then(|h| match &expected {
                Some(e) if !h.element_type().is_compatible(e) => Err(StageError::data(format!(
                    "executor returned {} for stage {}, expected {}",
                    h.element_type().name(),
                    work.stage.index,
                    e.name()
                ))),
                _ => Ok(h),
            });
            match result {
                Err(e) if e.kind.is_retryable() && attempt < max_attempts => {
                    warn!(stage = work.stage.index, attempt, error = %e, "transient failure, retrying");
                    if !cancel.sleep(self.config.retry.backoff(attempt)) {
                        return (Err(StageError::cancelled()), attempt);
                    }
                }
                other => return (other, attempt),
            }
        }
    }
}

fn report(stage: &Stage, status: StageStatus, attempts: u32, elapsed: Duration) -> StageReport {
    StageReport {
        index: stage.index,
        output: stage.output,
        status,
        attempts,
        elapsed,
    }
}

fn finish(
    stage: &Stage,
    result: Result<DataHandle, StageError>,
    attempts: u32,
    reused: bool,
    elapsed: Duration,
) -> (StageReport, Option<DataHandle>) {
    match result {
        Ok(h) => {
            let status = if reused {
                StageStatus::Reused
            } else {
                StageStatus::Succeeded
            };
            debug!(stage = stage.index, ?status, ?elapsed, "stage finished");
            (report(stage, status, attempts, elapsed), Some(h))
        }
        Err(e) if e.kind == FailureKind::Cancelled => {
            (report(stage, StageStatus::Cancelled, attempts, elapsed), None)
        }
        Err(e) => {
            warn!(stage = stage.index, node = %stage.output, error = %e, "stage failed");
            (report(stage, StageStatus::Failed(e), attempts, elapsed), None)
        }
    }
}

fn stage_work(
    nodes: &HashMap<NodeId, Node>,
    plan: &Plan,
    stage: &Stage,
    outputs: &HashMap<NodeId, DataHandle>,
) -> Result<StageWork, StageError> {
    let inputs = stage
        .inputs
        .iter()
        .map(|id| {
            outputs
                .get(id)
                .map(|h| (*id, h.clone()))
                .ok_or_else(|| StageError::data(format!("input {id} was not produced")))
        })
        .collect::<Result<Vec<_>, _>>()?;
    let chain = stage
        .nodes
        .iter()
        .map(|id| {
            nodes
                .get(id)
                .map(|n| (*id, n.clone()))
                .ok_or_else(|| StageError::data(format!("node {id} missing from graph")))
        })
        .collect::<Result<Vec<_>, _>>()?;
    let replayed_writes = stage
        .nodes
        .iter()
        .filter(|id| plan.replayed_writes.contains(*id))
        .copied()
        .collect();
    Ok(StageWork {
        stage: stage.clone(),
        inputs,
        chain,
        replayed_writes,
    })
}

/// Remember the writes a successful stage performed, so later plans forward
/// their data instead of writing it again.
fn record_writes(p: &Pipeline, nodes: &HashMap<NodeId, Node>, stage: &Stage) {
    for id in &stage.nodes {
        if matches!(nodes.get(id), Some(Node::Materialize { .. })) {
            p.mark_written(*id);
        }
    }
}

/// Mark pending stages whose dependencies ended without success as skipped.
/// Stages are in topological order, so one pass covers transitive dependents.
fn skip_blocked(plan: &Plan, reports: &mut [Option<StageReport>]) {
    for stage in &plan.stages {
        if reports[stage.index].is_some() {
            continue;
        }
        let blocked = stage
            .depends_on
            .iter()
            .any(|d| reports[*d].as_ref().is_some_and(|r| !r.status.is_success()));
        if blocked {
            reports[stage.index] = Some(report(stage, StageStatus::Skipped, 0, Duration::ZERO));
        }
    }
}

fn first_failure(
    stages: &[StageReport],
    targets: &[NodeId],
    outputs: &HashMap<NodeId, DataHandle>,
) -> Option<RunFailure> {
    let unresolved: Vec<NodeId> = targets
        .iter()
        .filter(|t| !outputs.contains_key(t))
        .copied()
        .collect();
    let failed = stages
        .iter()
        .find(|r| matches!(r.status, StageStatus::Failed(_)))
        .or_else(|| stages.iter().find(|r| r.status == StageStatus::Cancelled))?;
    let (kind, message, retry_after) = match &failed.status {
        StageStatus::Failed(e) => (e.kind, e.message.clone(), e.retry_after),
        _ => (FailureKind::Cancelled, "cancelled".to_string(), None),
    };
    Some(RunFailure {
        stage: failed.index,
        output: failed.output,
        kind,
        message,
        retry_after,
        unresolved,
    })
}
