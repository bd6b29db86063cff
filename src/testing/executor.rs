//! An executor wrapper for observing and scripting stage execution.

use crate::cancel::CancelToken;
use crate::error::StageError;
use crate::executor::{Executor, LocalExecutor, StageWork};
use crate::node_id::NodeId;
use crate::type_token::DataHandle;
use crate::utils::lock;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Wraps another [`Executor`] (a [`LocalExecutor`] by default) and records every
/// submission by the output node of its stage.
///
/// Failures are scripted per output node and consumed one per submission, so
/// `fail_times(n, 2, ..)` makes the first two submissions for `n` fail and the
/// third reach the wrapped executor.
pub struct RecordingExecutor {
    inner: Arc<dyn Executor>,
    submissions: Mutex<Vec<NodeId>>,
    failures: Mutex<HashMap<NodeId, VecDeque<StageError>>>,
    delays: Mutex<HashMap<NodeId, Duration>>,
}

impl Default for RecordingExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingExecutor {
    #[must_use]
    pub fn new() -> Self {
        Self::wrapping(Arc::new(LocalExecutor::default()))
    }

    #[must_use]
    pub fn wrapping(inner: Arc<dyn Executor>) -> Self {
        Self {
            inner,
            submissions: Mutex::new(Vec::new()),
            failures: Mutex::new(HashMap::new()),
            delays: Mutex::new(HashMap::new()),
        }
    }

    /// Fail the next submission of the stage producing `output`.
    pub fn fail_next(&self, output: NodeId, error: StageError) {
        self.fail_times(output, 1, error);
    }

    /// Fail the next `times` submissions of the stage producing `output`.
    pub fn fail_times(&self, output: NodeId, times: usize, error: StageError) {
        lock(&self.failures)
            .entry(output)
            .or_default()
            .extend(std::iter::repeat_n(error, times));
    }

    /// Hold every submission of the stage producing `output` for `delay`.
    pub fn delay(&self, output: NodeId, delay: Duration) {
        lock(&self.delays).insert(output, delay);
    }

    /// Number of submissions for the stage producing `output`.
    #[must_use]
    pub fn submissions_for(&self, output: NodeId) -> usize {
        lock(&self.submissions)
            .iter()
            .filter(|id| **id == output)
            .count()
    }

    #[must_use]
    pub fn total_submissions(&self) -> usize {
        lock(&self.submissions).len()
    }

    /// Output nodes of all submissions, in submission order.
    #[must_use]
    pub fn submitted_outputs(&self) -> Vec<NodeId> {
        lock(&self.submissions).clone()
    }
}

impl Executor for RecordingExecutor {
    fn submit(&self, work: StageWork, cancel: &CancelToken) -> Result<DataHandle, StageError> {
        let output = work.stage.output;
        lock(&self.submissions).push(output);

        let delay = lock(&self.delays).get(&output).copied();
        if let Some(d) = delay
            && !cancel.sleep(d)
        {
            return Err(StageError::cancelled());
        }

        let scripted = lock(&self.failures)
            .get_mut(&output)
            .and_then(VecDeque::pop_front);
        if let Some(err) = scripted {
            return Err(err);
        }
        self.inner.submit(work, cancel)
    }
}
