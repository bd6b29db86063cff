//! Assertion functions for collection outputs and run results.

use crate::node_id::NodeId;
use crate::runner::{RunResult, RunStatus, StageStatus};
use std::collections::HashSet;
use std::fmt::Debug;
use std::hash::Hash;

/// Assert that two collections are equal in order and content.
///
/// # Panics
///
/// Panics if the collections differ in length or content.
///
/// # Example
///
/// ```
/// use lazybeam::testing::assert_collections_equal;
///
/// assert_collections_equal(&[1, 2, 3], &[1, 2, 3]);
/// ```
pub fn assert_collections_equal<T: Debug + PartialEq>(actual: &[T], expected: &[T]) {
    assert_eq!(
        actual.len(),
        expected.len(),
        "Collection length mismatch:\n  Expected length: {}\n  Actual length: {}\n  Expected: {expected:?}\n  Actual: {actual:?}",
        expected.len(),
        actual.len()
    );

    for (i, (a, e)) in actual.iter().zip(expected.iter()).enumerate() {
        assert_eq!(
            a, e,
            "Collection mismatch at index {i}:\n  Expected: {e:?}\n  Actual: {a:?}\n  Full expected: {expected:?}\n  Full actual: {actual:?}"
        );
    }
}

/// Assert that two collections contain the same elements, ignoring order.
///
/// # Panics
///
/// Panics if the collections differ in length or content.
///
/// # Example
///
/// ```
/// use lazybeam::testing::assert_collections_unordered_equal;
///
/// assert_collections_unordered_equal(&[3, 1, 2], &[1, 2, 3]);
/// ```
pub fn assert_collections_unordered_equal<T: Debug + Eq + Hash>(actual: &[T], expected: &[T]) {
    assert_eq!(
        actual.len(),
        expected.len(),
        "Collection length mismatch:\n  Expected: {expected:?}\n  Actual: {actual:?}"
    );

    let actual_set: HashSet<_> = actual.iter().collect();
    let expected_set: HashSet<_> = expected.iter().collect();
    if actual_set != expected_set {
        let missing: Vec<_> = expected_set.difference(&actual_set).collect();
        let extra: Vec<_> = actual_set.difference(&expected_set).collect();
        panic!(
            "Collection content mismatch:\n  Missing elements: {missing:?}\n  Extra elements: {extra:?}"
        );
    }
}

/// Assert that two key-value collections are equal after sorting by key.
///
/// # Panics
///
/// Panics if the collections differ after sorting.
pub fn assert_kv_collections_equal<K, V>(mut actual: Vec<(K, V)>, mut expected: Vec<(K, V)>)
where
    K: Debug + Ord,
    V: Debug + PartialEq,
{
    actual.sort_by(|a, b| a.0.cmp(&b.0));
    expected.sort_by(|a, b| a.0.cmp(&b.0));
    assert_collections_equal(&actual, &expected);
}

/// Assert that every stage of a run succeeded or was reused.
///
/// # Panics
///
/// Panics with the failing stage reports otherwise.
pub fn assert_run_succeeded(result: &RunResult) {
    let bad: Vec<_> = result
        .stages
        .iter()
        .filter(|r| !r.status.is_success())
        .collect();
    assert!(
        result.status() == RunStatus::Succeeded && bad.is_empty(),
        "Run did not succeed:\n  Status: {:?}\n  Failure: {:?}\n  Unsuccessful stages: {bad:?}",
        result.status(),
        result.failure
    );
}

/// Assert the status of the stage producing `output`.
///
/// # Panics
///
/// Panics if no stage produced `output` or its status differs.
pub fn assert_stage_status(result: &RunResult, output: NodeId, expected: &StageStatus) {
    let report = result
        .report_for(output)
        .unwrap_or_else(|| panic!("No stage produced {output}:\n  Stages: {:?}", result.stages));
    assert_eq!(
        &report.status, expected,
        "Stage status mismatch for {output}:\n  Report: {report:?}"
    );
}
