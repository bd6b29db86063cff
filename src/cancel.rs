//! Cooperative cancellation.
//!
//! Every blocking operation in the crate (a run, a single-flight wait, a
//! deferred value resolution) takes a [`CancelToken`]. A token trips when
//! [`cancel`](CancelToken::cancel) is called on any clone of it, or when its
//! optional deadline passes. Executors receive the token too and are expected
//! to check it between units of work.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Shared cancellation flag with an optional deadline.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancelToken {
    /// A token that only trips when cancelled explicitly.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A token that also trips once `timeout` has elapsed from now.
    ///
    /// A timeout too large to be represented as an [`Instant`] means no deadline.
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => Self::with_deadline(deadline),
            None => Self::new(),
        }
    }

    #[must_use]
    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            deadline: Some(deadline),
        }
    }

    /// Signal cancellation to every clone of this token.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst) || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Time left before the deadline, if there is one.
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Sleep for up to `dur`, waking early if the token trips.
    ///
    /// Returns `false` if the token tripped.
    pub fn sleep(&self, dur: Duration) -> bool {
        const SLICE: Duration = Duration::from_millis(5);
        let until = Instant::now().checked_add(dur);
        loop {
            if self.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if until.is_some_and(|u| now >= u) {
                return true;
            }
            std::thread::sleep(until.map_or(SLICE, |u| (u - now).min(SLICE)));
        }
    }
}
