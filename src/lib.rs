//! # lazybeam
//!
//! Lazy, immutable collection graphs with cached stage planning and deferred values.
//!
//! Building a pipeline only records a dependency graph. Work happens when a
//! result is demanded, and then only the work that is actually missing:
//! cached nodes computed earlier are reused, chains of element-wise transforms
//! are fused into single stages, and independent stages run concurrently.
//!
//! ## Quick Start
//!
//! ```
//! use lazybeam::*;
//!
//! # fn main() -> anyhow::Result<()> {
//! let p = Pipeline::default();
//! let words = from_vec(&p, vec!["a b".to_string(), "b c b".to_string()])
//!     .flat_map(|line: &String| line.split_whitespace().map(String::from).collect::<Vec<_>>())
//!     .cache();
//!
//! // Nothing has run yet.
//! let total = words.count();
//! let counts = words.count_values();
//!
//! assert_eq!(*total.get()?, 5);
//! assert_eq!(
//!     counts.collect()?,
//!     vec![("a".to_string(), 1), ("b".to_string(), 3), ("c".to_string(), 1)]
//! );
//! # Ok(())
//! # }
//! ```
//!
//! ## Core Concepts
//!
//! ### Pipeline
//!
//! A [`Pipeline`] owns the graph of one pipeline instance: every node, its edges,
//! the [`CacheRegistry`] and the pending deferred values. Handles are cheap
//! clones; everything is dropped with the last one.
//!
//! ### PCollection
//!
//! A [`PCollection<T>`] is a typed handle to one node. Transformations create new
//! nodes and never modify existing ones:
//! - element-wise: [`map`](PCollection::map), [`filter`](PCollection::filter),
//!   [`flat_map`](PCollection::flat_map), [`by`](PCollection::by)
//! - barriers: [`group_by_key`](PCollection::group_by_key),
//!   [`combine_values`](PCollection::combine_values),
//!   [`aggregate`](PCollection::aggregate)
//! - structure: [`union`](PCollection::union), [`write`](PCollection::write)
//!
//! ### Results
//!
//! - [`materialize`](PCollection::materialize) runs the collection and returns a
//!   [`Materialized`] view of its data
//! - [`count`](PCollection::count), [`first`](PCollection::first),
//!   [`max`](PCollection::max), [`min`](PCollection::min) and
//!   [`as_collection`](PCollection::as_collection) return a [`DeferredValue`] that
//!   resolves once, the first time its node is produced by any run
//! - [`Runner::run_all`] executes every declared write
//!
//! ### Caching
//!
//! [`cache`](PCollection::cache) only marks a node. The first run that produces
//! it retains the data, and later plans against the same pipeline start from the
//! retained data instead of recomputing it. Concurrent runs needing the same
//! cached node compute it once.
//!
//! ## Architecture
//!
//! 1. [`pipeline`] records nodes and validates them as they are added
//! 2. [`planner`] prunes cached nodes, orders the rest and fuses them into stages
//! 3. [`runner`] submits stages wave by wave to an [`Executor`], with retries and
//!    cancellation, then resolves deferred values
//! 4. [`executor::LocalExecutor`] runs stages in-process with rayon
//!
//! ## Logging
//!
//! The crate logs through [`tracing`] and installs no subscriber.

pub mod cache;
pub mod cancel;
pub mod collection;
pub mod combiners;
pub mod deferred;
pub mod error;
pub mod executor;
pub mod io;
pub mod node;
pub mod node_id;
pub mod pipeline;
pub mod planner;
pub mod runner;
pub mod testing;
pub mod type_token;
pub mod utils;

// General re-exports
pub use cache::{CacheRegistry, CachingOptions, Expiration, StorageLevel};
pub use cancel::CancelToken;
pub use collection::{Materialized, PCollection, RFBound, from_source, from_vec};
pub use combiners::{CombineFn, Count, Max, Min, Sum};
pub use deferred::DeferredValue;
pub use error::{FailureKind, GraphError, RunError, StageError};
pub use executor::{Executor, LocalExecutor, StageWork};
pub use io::{MemoryTarget, Source, Target, VecSource, WriteMode};
pub use node_id::NodeId;
pub use pipeline::Pipeline;
pub use planner::{Plan, PlanExplanation, Stage, build_plan};
pub use runner::{
    RetryPolicy, RunFailure, RunResult, RunStatus, Runner, RunnerConfig, StageReport, StageStatus,
};
pub use type_token::{DataHandle, ElementType};

// Gated re-exports
#[cfg(feature = "io-jsonl")]
pub use collection::from_jsonl;
#[cfg(feature = "io-jsonl")]
pub use io::jsonl::{JsonlSource, JsonlTarget, read_jsonl_vec, write_jsonl_vec};
