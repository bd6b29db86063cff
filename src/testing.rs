//! Testing utilities for lazybeam pipelines.
//!
//! - **Assertions**: compare collection outputs and run results
//! - **[`RecordingExecutor`]**: an executor wrapper that counts submissions per
//!   stage output and injects scripted failures and delays
//! - **[`TestPipeline`]**: a [`Pipeline`] with graph inspection helpers
//!
//! # Quick Start
//!
//! ```
//! use lazybeam::*;
//! use lazybeam::testing::*;
//! use std::sync::Arc;
//!
//! # fn main() -> anyhow::Result<()> {
//! let p = TestPipeline::new();
//! let doubled = from_vec(&p, vec![1, 2, 3]).map(|x: &i32| x * 2).cache();
//!
//! let recorder = Arc::new(RecordingExecutor::new());
//! let runner = Runner::default().with_executor(recorder.clone());
//!
//! let out = doubled.materialize_with(&runner)?;
//! assert_collections_equal(out.as_slice(), &[2, 4, 6]);
//!
//! // The cached node is not computed again.
//! doubled.materialize_with(&runner)?;
//! assert_eq!(recorder.submissions_for(doubled.node_id()), 1);
//! # Ok(())
//! # }
//! ```

pub mod assertions;
pub mod executor;

pub use assertions::*;
pub use executor::*;

use crate::Pipeline;
use std::fmt::Write;

/// A [`Pipeline`] with inspection helpers for tests.
///
/// Dereferences to [`Pipeline`], so it can be passed wherever one is expected.
#[derive(Clone, Default)]
pub struct TestPipeline {
    pipeline: Pipeline,
}

impl TestPipeline {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn edge_count(&self) -> usize {
        let (_, edges) = self.pipeline.snapshot();
        edges.len()
    }

    /// One line per node, in id order: `#id Kind[label] <- [parents]`.
    #[must_use]
    pub fn describe_graph(&self) -> String {
        let (nodes, _) = self.pipeline.snapshot();
        let mut ids: Vec<_> = nodes.keys().copied().collect();
        ids.sort_unstable();
        let mut out = String::new();
        for id in ids {
            let node = &nodes[&id];
            let _ = writeln!(
                out,
                "{id} {}[{}] <- {:?}",
                node.kind_name(),
                node.label(),
                node.parents()
            );
        }
        out
    }
}

impl std::ops::Deref for TestPipeline {
    type Target = Pipeline;

    fn deref(&self) -> &Self::Target {
        &self.pipeline
    }
}

impl AsRef<Pipeline> for TestPipeline {
    fn as_ref(&self) -> &Pipeline {
        &self.pipeline
    }
}
