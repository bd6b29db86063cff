//! Cache marks, retained results and single-flight execution.
//!
//! Caching is opt-in per node. A node marked with [`CachingOptions`] keeps its
//! computed data for the lifetime of its pipeline, and no later plan against the
//! same pipeline recomputes it. Retained data is only ever dropped when:
//! - its [`Expiration`] elapses,
//! - it is invalidated explicitly,
//! - the handle stops decoding as its element type (the next access treats the
//!   node as not computed, so it is recomputed rather than served corrupt),
//! - the pipeline itself is dropped.
//!
//! Concurrent runs that need the same cached node go through [`CacheRegistry::claim`]:
//! one caller becomes the leader and executes the stage, everyone else waits on
//! the leader's [`Flight`]. All per-node state lives behind a single lock, so the
//! claim decision and the record of its result are atomic.

use crate::cancel::CancelToken;
use crate::error::StageError;
use crate::node_id::NodeId;
use crate::type_token::DataHandle;
use crate::utils::lock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Where cached data should live. Executors may use it as a placement hint;
/// the registry itself keeps handles either way.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum StorageLevel {
    #[default]
    Memory,
    Durable,
}

/// When retained data stops being valid.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Expiration {
    #[default]
    Never,
    /// Valid for this long after it was recorded.
    After(Duration),
}

/// Cache policy attached to a node.
#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CachingOptions {
    /// Keep data in serialized form (a hint for executors with their own storage).
    pub serialized: bool,
    pub storage: StorageLevel,
    pub expiration: Expiration,
}

impl CachingOptions {
    #[must_use]
    pub fn with_storage(mut self, storage: StorageLevel) -> Self {
        self.storage = storage;
        self
    }

    #[must_use]
    pub fn with_serialized(mut self, serialized: bool) -> Self {
        self.serialized = serialized;
        self
    }

    #[must_use]
    pub fn expire_after(mut self, ttl: Duration) -> Self {
        self.expiration = Expiration::After(ttl);
        self
    }
}

struct Computed {
    handle: DataHandle,
    at: Instant,
}

struct CacheEntry {
    options: CachingOptions,
    computed: Option<Computed>,
}

impl CacheEntry {
    /// The retained handle if still valid; drops it otherwise.
    fn valid_handle(&mut self, id: NodeId) -> Option<DataHandle> {
        let computed = self.computed.as_ref()?;
        if let Expiration::After(ttl) = self.options.expiration
            && computed.at.elapsed() >= ttl
        {
            debug!(node = %id, "cached result expired");
            self.computed = None;
            return None;
        }
        if !computed.handle.is_readable() {
            warn!(node = %id, "cached result is unreadable, dropping it for recomputation");
            self.computed = None;
            return None;
        }
        Some(computed.handle.clone())
    }
}

#[derive(Default)]
struct RegistryState {
    entries: HashMap<NodeId, CacheEntry>,
    inflight: HashMap<NodeId, Arc<Flight>>,
}

/// Per-pipeline registry of cache marks and retained results.
#[derive(Default)]
pub struct CacheRegistry {
    state: Mutex<RegistryState>,
}

/// Outcome of [`CacheRegistry::claim`].
pub enum Claim<'a> {
    /// A valid result is already retained.
    Ready(DataHandle),
    /// The caller must execute the stage and complete the guard.
    Leader(FlightGuard<'a>),
    /// Another caller is executing; wait on the flight.
    Follower(Arc<Flight>),
}

impl CacheRegistry {
    /// Mark `id` for caching. Re-marking replaces the policy but keeps any
    /// retained result.
    pub fn mark_cached(&self, id: NodeId, options: CachingOptions) {
        let mut s = lock(&self.state);
        match s.entries.get_mut(&id) {
            Some(entry) => entry.options = options,
            None => {
                s.entries.insert(
                    id,
                    CacheEntry {
                        options,
                        computed: None,
                    },
                );
            }
        }
    }

    #[must_use]
    pub fn is_cached(&self, id: NodeId) -> bool {
        lock(&self.state).entries.contains_key(&id)
    }

    #[must_use]
    pub fn options(&self, id: NodeId) -> Option<CachingOptions> {
        lock(&self.state).entries.get(&id).map(|e| e.options.clone())
    }

    /// Whether a valid result is retained for `id`.
    #[must_use]
    pub fn is_computed(&self, id: NodeId) -> bool {
        self.lookup(id).is_some()
    }

    /// The retained result for `id`, evicting it first if it expired or became
    /// unreadable.
    #[must_use]
    pub fn lookup(&self, id: NodeId) -> Option<DataHandle> {
        lock(&self.state)
            .entries
            .get_mut(&id)
            .and_then(|e| e.valid_handle(id))
    }

    /// Retain `handle` as the result of `id`. Ignored (returns `false`) unless
    /// `id` is marked cached.
    pub fn record_computed(&self, id: NodeId, handle: DataHandle) -> bool {
        let mut s = lock(&self.state);
        record(&mut s, id, handle)
    }

    /// Drop the retained result of `id`, keeping the cache mark.
    pub fn invalidate(&self, id: NodeId) -> bool {
        let mut s = lock(&self.state);
        s.entries
            .get_mut(&id)
            .and_then(|e| e.computed.take())
            .is_some()
    }

    /// Drop every expired result; returns how many were dropped.
    pub fn evict_expired(&self) -> usize {
        let mut s = lock(&self.state);
        let mut evicted = 0;
        for entry in s.entries.values_mut() {
            if let (Expiration::After(ttl), Some(c)) = (entry.options.expiration, &entry.computed)
                && c.at.elapsed() >= ttl
            {
                entry.computed = None;
                evicted += 1;
            }
        }
        evicted
    }

    /// Ids with a retained result, expired or not, in ascending order.
    #[must_use]
    pub fn computed_nodes(&self) -> Vec<NodeId> {
        let s = lock(&self.state);
        let mut out: Vec<NodeId> = s
            .entries
            .iter()
            .filter(|(_, e)| e.computed.is_some())
            .map(|(id, _)| *id)
            .collect();
        out.sort_unstable();
        out
    }

    /// Decide who computes `id`.
    ///
    /// Exactly one caller at a time receives [`Claim::Leader`] for a node; the
    /// claim stays open until that guard is completed or dropped.
    pub fn claim(&self, id: NodeId) -> Claim<'_> {
        let mut s = lock(&self.state);
        if let Some(handle) = s.entries.get_mut(&id).and_then(|e| e.valid_handle(id)) {
            return Claim::Ready(handle);
        }
        if let Some(flight) = s.inflight.get(&id) {
            debug!(node = %id, "joining in-flight computation");
            flight.followers.fetch_add(1, Ordering::SeqCst);
            return Claim::Follower(Arc::clone(flight));
        }
        let flight = Arc::new(Flight::default());
        s.inflight.insert(id, Arc::clone(&flight));
        Claim::Leader(FlightGuard {
            registry: self,
            node: id,
            flight,
            finished: false,
        })
    }

    /// Callers that joined the in-flight computation of `id` as followers; `0`
    /// when nothing is in flight.
    #[must_use]
    pub fn followers(&self, id: NodeId) -> usize {
        lock(&self.state)
            .inflight
            .get(&id)
            .map_or(0, |f| f.followers.load(Ordering::SeqCst))
    }

    fn finish(&self, id: NodeId, flight: &Flight, result: &Result<DataHandle, StageError>) {
        {
            let mut s = lock(&self.state);
            if let Ok(handle) = result {
                record(&mut s, id, handle.clone());
            }
            s.inflight.remove(&id);
        }
        flight.complete(result.clone());
    }
}

fn record(s: &mut RegistryState, id: NodeId, handle: DataHandle) -> bool {
    match s.entries.get_mut(&id) {
        Some(entry) => {
            entry.computed = Some(Computed {
                handle,
                at: Instant::now(),
            });
            true
        }
        None => false,
    }
}

/// Completion signal of one in-flight computation.
#[derive(Default)]
pub struct Flight {
    result: Mutex<Option<Result<DataHandle, StageError>>>,
    done: Condvar,
    followers: AtomicUsize,
}

impl Flight {
    fn complete(&self, result: Result<DataHandle, StageError>) {
        *lock(&self.result) = Some(result);
        self.done.notify_all();
    }

    /// Block until the leader finishes or `cancel` trips.
    ///
    /// # Errors
    ///
    /// The leader's failure, or a `Cancelled` error if the token tripped first.
    pub fn wait(&self, cancel: &CancelToken) -> Result<DataHandle, StageError> {
        const POLL: Duration = Duration::from_millis(20);
        let mut slot = lock(&self.result);
        loop {
            if let Some(result) = slot.as_ref() {
                return result.clone();
            }
            if cancel.is_cancelled() {
                return Err(StageError::cancelled());
            }
            let slice = cancel.remaining().map_or(POLL, |r| r.min(POLL));
            slot = self
                .done
                .wait_timeout(slot, slice)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}

/// Leadership over one in-flight computation.
///
/// Dropping an uncompleted guard fails the flight so followers never hang.
pub struct FlightGuard<'a> {
    registry: &'a CacheRegistry,
    node: NodeId,
    flight: Arc<Flight>,
    finished: bool,
}

impl FlightGuard<'_> {
    /// Publish the result to followers, retaining it on success.
    pub fn complete(mut self, result: Result<DataHandle, StageError>) -> Result<DataHandle, StageError> {
        self.registry.finish(self.node, &self.flight, &result);
        self.finished = true;
        result
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.registry.finish(
                self.node,
                &self.flight,
                &Err(StageError::transient("leader abandoned the computation")),
            );
        }
    }
}
