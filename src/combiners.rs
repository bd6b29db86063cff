//! Combiners for [`combine_values`](crate::PCollection::combine_values) and
//! [`aggregate`](crate::PCollection::aggregate).
//!
//! A [`CombineFn`] folds values into an accumulator, merges accumulators built
//! independently, and finishes an accumulator into the output value. Combining
//! an empty input yields `finish(create())`.

use crate::collection::RFBound;
use std::marker::PhantomData;
use std::mem::take;
use std::ops::Add;

/// An associative fold from values `V` through accumulator `A` to output `O`.
pub trait CombineFn<V, A, O>: Send + Sync + 'static {
    fn create(&self) -> A;

    fn add_input(&self, acc: &mut A, v: V);

    fn merge(&self, acc: &mut A, other: A);

    fn finish(&self, acc: A) -> O;

    /// Fold a whole slice; the default clones each value into `add_input`.
    fn fold_all(&self, values: &[V]) -> O
    where
        V: Clone,
    {
        let mut acc = self.create();
        for v in values {
            self.add_input(&mut acc, v.clone());
        }
        self.finish(acc)
    }
}

/* ===================== Sum<T> ===================== */

/// Sum of values. Requires `T: Add<Output = T> + Default`.
#[derive(Clone, Copy, Debug, Default)]
pub struct Sum<T>(PhantomData<fn(T)>);

impl<T> Sum<T> {
    #[must_use]
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> CombineFn<T, T, T> for Sum<T>
where
    T: RFBound + Add<Output = T> + Default,
{
    fn create(&self) -> T {
        T::default()
    }

    fn add_input(&self, acc: &mut T, v: T) {
        *acc = take(acc) + v;
    }

    fn merge(&self, acc: &mut T, other: T) {
        *acc = take(acc) + other;
    }

    fn finish(&self, acc: T) -> T {
        acc
    }
}

/* ===================== Min<T> / Max<T> ===================== */

/// Smallest value, `None` for empty input.
#[derive(Clone, Copy, Debug, Default)]
pub struct Min<T>(PhantomData<fn(T)>);

impl<T> Min<T> {
    #[must_use]
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> CombineFn<T, Option<T>, Option<T>> for Min<T>
where
    T: RFBound + Ord,
{
    fn create(&self) -> Option<T> {
        None
    }

    fn add_input(&self, acc: &mut Option<T>, v: T) {
        match acc {
            Some(cur) if v >= *cur => {}
            _ => *acc = Some(v),
        }
    }

    fn merge(&self, acc: &mut Option<T>, other: Option<T>) {
        if let Some(b) = other {
            self.add_input(acc, b);
        }
    }

    fn finish(&self, acc: Option<T>) -> Option<T> {
        acc
    }
}

/// Largest value, `None` for empty input.
#[derive(Clone, Copy, Debug, Default)]
pub struct Max<T>(PhantomData<fn(T)>);

impl<T> Max<T> {
    #[must_use]
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> CombineFn<T, Option<T>, Option<T>> for Max<T>
where
    T: RFBound + Ord,
{
    fn create(&self) -> Option<T> {
        None
    }

    fn add_input(&self, acc: &mut Option<T>, v: T) {
        match acc {
            Some(cur) if v <= *cur => {}
            _ => *acc = Some(v),
        }
    }

    fn merge(&self, acc: &mut Option<T>, other: Option<T>) {
        if let Some(b) = other {
            self.add_input(acc, b);
        }
    }

    fn finish(&self, acc: Option<T>) -> Option<T> {
        acc
    }
}

/* ===================== Count ===================== */

/// Number of values, whatever their type.
#[derive(Clone, Copy, Debug, Default)]
pub struct Count;

impl<V> CombineFn<V, u64, u64> for Count {
    fn create(&self) -> u64 {
        0
    }

    fn add_input(&self, acc: &mut u64, _v: V) {
        *acc += 1;
    }

    fn merge(&self, acc: &mut u64, other: u64) {
        *acc += other;
    }

    fn finish(&self, acc: u64) -> u64 {
        acc
    }

    fn fold_all(&self, values: &[V]) -> u64
    where
        V: Clone,
    {
        values.len() as u64
    }
}
