//! Deferred scalar values.
//!
//! A [`DeferredValue`] stands for a value computed from one node's output (a
//! count, the first element, a maximum). Creating one runs nothing. The value
//! resolves the first time any run produces its node's output, whether that run
//! was started by [`DeferredValue::get`] or by something else entirely, and every
//! later read returns the same value without touching the graph again.

use crate::cancel::CancelToken;
use crate::error::{RunError, StageError};
use crate::node_id::NodeId;
use crate::pipeline::Pipeline;
use crate::runner::Runner;
use crate::type_token::DataHandle;
use std::fmt::{Debug, Formatter, Result as FormatResult};
use std::sync::{Arc, OnceLock};
use tracing::{debug, warn};

/// Type-erased view of a deferred cell, held weakly by its pipeline.
pub(crate) trait PendingValue: Send + Sync {
    fn node(&self) -> NodeId;

    /// Try to resolve from `handle`; returns whether this call set the value.
    fn offer(&self, handle: &DataHandle) -> bool;

    fn is_resolved(&self) -> bool;
}

type Resolver<T> = Box<dyn Fn(&DataHandle) -> Result<T, StageError> + Send + Sync>;

struct DeferredCell<T> {
    node: NodeId,
    resolver: Resolver<T>,
    value: OnceLock<T>,
}

impl<T> DeferredCell<T> {
    fn resolve(&self, handle: &DataHandle) -> Result<&T, StageError> {
        if let Some(v) = self.value.get() {
            return Ok(v);
        }
        let v = (self.resolver)(handle)?;
        // A racing resolver may have won; either way the stored value is returned.
        Ok(self.value.get_or_init(|| v))
    }
}

impl<T: Send + Sync> PendingValue for DeferredCell<T> {
    fn node(&self) -> NodeId {
        self.node
    }

    fn offer(&self, handle: &DataHandle) -> bool {
        if self.value.get().is_some() {
            return false;
        }
        match (self.resolver)(handle) {
            Ok(v) => self.value.set(v).is_ok(),
            Err(e) => {
                warn!(node = %self.node, error = %e, "deferred value could not be resolved");
                false
            }
        }
    }

    fn is_resolved(&self) -> bool {
        self.value.get().is_some()
    }
}

/// A value that becomes available once its node has been computed.
pub struct DeferredValue<T> {
    pipeline: Pipeline,
    cell: Arc<DeferredCell<T>>,
}

impl<T: Send + Sync + 'static> DeferredValue<T> {
    /// Register a deferred value over `node`, decoded from the node's output by
    /// `resolver`.
    pub fn new<F>(pipeline: &Pipeline, node: NodeId, resolver: F) -> Self
    where
        F: Fn(&DataHandle) -> Result<T, StageError> + Send + Sync + 'static,
    {
        let cell = Arc::new(DeferredCell {
            node,
            resolver: Box::new(resolver),
            value: OnceLock::new(),
        });
        let pending: Arc<dyn PendingValue> = cell.clone();
        pipeline.register_deferred(Arc::downgrade(&pending));
        Self {
            pipeline: pipeline.clone(),
            cell,
        }
    }

    /// The node whose output this value is computed from.
    #[must_use]
    pub fn node(&self) -> NodeId {
        self.cell.node
    }

    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.cell.value.get().is_some()
    }

    /// The value if it has already been resolved. Never runs anything.
    #[must_use]
    pub fn peek(&self) -> Option<&T> {
        self.cell.value.get()
    }

    /// Resolve with a default [`Runner`].
    ///
    /// # Errors
    ///
    /// See [`get_with_cancel`](Self::get_with_cancel).
    pub fn get(&self) -> Result<&T, RunError> {
        self.get_with(&Runner::default())
    }

    /// Resolve with `runner`.
    ///
    /// # Errors
    ///
    /// See [`get_with_cancel`](Self::get_with_cancel).
    pub fn get_with(&self, runner: &Runner) -> Result<&T, RunError> {
        self.get_with_cancel(runner, &CancelToken::new())
    }

    /// Resolve, running the node's plan if no value is available yet.
    ///
    /// Blocks until the run finishes or `cancel` trips. A value resolved once is
    /// returned as is on every later call.
    ///
    /// # Errors
    ///
    /// - [`RunError::Graph`] if the node cannot be planned
    /// - [`RunError::Stage`] if the run failed or was cancelled
    /// - [`RunError::Resolve`] if the node's output cannot be decoded
    pub fn get_with_cancel(&self, runner: &Runner, cancel: &CancelToken) -> Result<&T, RunError> {
        if let Some(v) = self.cell.value.get() {
            return Ok(v);
        }
        let node = self.cell.node;
        debug!(node = %node, "resolving deferred value");
        let result = runner.run_with_cancel(&self.pipeline, &[node], cancel)?;
        match (result.outputs.get(&node), result.failure) {
            // Already offered by the runner; resolving again only surfaces a
            // decode error that the offer logged.
            (Some(handle), _) => self
                .cell
                .resolve(handle)
                .map_err(|source| RunError::Resolve { node, source }),
            (None, Some(failure)) => Err(RunError::Stage(failure)),
            (None, None) => Err(RunError::Resolve {
                node,
                source: StageError::data("run produced no output for node"),
            }),
        }
    }
}

impl<T: Debug> Debug for DeferredValue<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> FormatResult {
        match self.cell.value.get() {
            Some(v) => write!(f, "DeferredValue({}: {v:?})", self.cell.node),
            None => write!(f, "DeferredValue({}: <pending>)", self.cell.node),
        }
    }
}
