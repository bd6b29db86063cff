//! Small shared helpers.

use std::cmp::Ordering;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering the guard if a previous holder panicked.
///
/// Every structure guarded this way stays internally consistent across a panic
/// (all updates are single inserts/removes), so the poisoned state carries no
/// information worth propagating.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A wrapper around f64 that implements `Ord` by using `total_cmp`.
///
/// Lets floating point collections use the `Ord`-bound deferred values such as
/// [`PCollection::max`](crate::PCollection::max):
///
/// ```
/// use lazybeam::utils::OrdF64;
/// use lazybeam::{from_vec, Pipeline};
///
/// let p = Pipeline::default();
/// let top = from_vec(&p, vec![1.5f64, 3.25, 2.0]).map(|x: &f64| OrdF64(*x)).max();
/// assert_eq!(top.get().unwrap().map(f64::from), Some(3.25));
/// ```
#[derive(Clone, Copy, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct OrdF64(pub f64);

impl Eq for OrdF64 {}

impl PartialOrd for OrdF64 {
    #[inline]
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrdF64 {
    #[inline]
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl From<f64> for OrdF64 {
    fn from(value: f64) -> Self {
        Self(value)
    }
}

impl From<OrdF64> for f64 {
    fn from(value: OrdF64) -> Self {
        value.0
    }
}
