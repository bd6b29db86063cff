//! The typed, fluent front-end.
//!
//! A [`PCollection<T>`] is a typed handle to one node of a [`Pipeline`]. Every
//! transformation registers a new node and returns a new handle; nothing runs
//! until a result is demanded through [`materialize`](PCollection::materialize),
//! [`collect`](PCollection::collect) or one of the deferred values
//! ([`count`](PCollection::count), [`first`](PCollection::first), ...).
//!
//! Handles are cheap to clone and may be consumed by several transformations,
//! which is how fan-out (and diamonds) are built.

use crate::cache::CachingOptions;
use crate::combiners::{CombineFn, Count};
use crate::deferred::DeferredValue;
use crate::error::{GraphError, RunError, StageError};
use crate::io::{Source, Target, VecSource, WriteMode};
use crate::node::{DynOp, Node, TransformKind};
use crate::node_id::NodeId;
use crate::pipeline::Pipeline;
use crate::planner::{PlanExplanation, build_plan};
use crate::runner::Runner;
use crate::type_token::{DataHandle, ElementType, Partition, TypeTag};
use serde::{Serialize, de::DeserializeOwned};
use std::any::type_name;
use std::collections::HashMap;
use std::fmt::{Debug, Formatter, Result as FormatResult};
use std::hash::Hash;
use std::marker::PhantomData;
use std::sync::Arc;

/// Bound shared by every element type flowing through a pipeline.
pub trait RFBound: 'static + Send + Sync + Clone + Serialize + DeserializeOwned {}
impl<T> RFBound for T where T: 'static + Send + Sync + Clone + Serialize + DeserializeOwned {}

/// A lazy, immutable collection of `T`.
pub struct PCollection<T> {
    pub(crate) pipeline: Pipeline,
    pub(crate) id: NodeId,
    _t: PhantomData<fn() -> T>,
}

impl<T> Clone for PCollection<T> {
    fn clone(&self) -> Self {
        Self {
            pipeline: self.pipeline.clone(),
            id: self.id,
            _t: PhantomData,
        }
    }
}

impl<T> Debug for PCollection<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> FormatResult {
        write!(f, "PCollection<{}>({})", type_name::<T>(), self.id)
    }
}

/// A collection backed by an in-memory vector.
pub fn from_vec<T>(p: &Pipeline, data: Vec<T>) -> PCollection<T>
where
    T: RFBound,
{
    let id = p.insert_node(Node::Source {
        source: Arc::new(VecSource::new(data)),
        elem: ElementType::of::<T>(),
    });
    PCollection::wrap(p, id)
}

/// A collection read from `source` when it is first needed.
///
/// # Errors
///
/// [`GraphError::TypeMismatch`] if the source does not produce `T`.
pub fn from_source<T, S>(p: &Pipeline, source: S) -> Result<PCollection<T>, GraphError>
where
    T: RFBound,
    S: Source + 'static,
{
    let elem = ElementType::of::<T>();
    let produced = source.element_type();
    if !produced.is_compatible(&elem) {
        return Err(GraphError::TypeMismatch {
            expected: elem.name(),
            found: produced.name(),
        });
    }
    let id = p.add_node(Node::Source {
        source: Arc::new(source),
        elem,
    })?;
    Ok(PCollection::wrap(p, id))
}

/// A collection read from a JSON Lines file when it is first needed.
#[cfg(feature = "io-jsonl")]
pub fn from_jsonl<T>(p: &Pipeline, path: impl Into<std::path::PathBuf>) -> PCollection<T>
where
    T: RFBound,
{
    let id = p.insert_node(Node::Source {
        source: Arc::new(crate::io::jsonl::JsonlSource::<T>::new(path)),
        elem: ElementType::of::<T>(),
    });
    PCollection::wrap(p, id)
}

fn take_input<T: 'static>(input: Partition, op: &str) -> Result<Vec<T>, StageError> {
    input.downcast::<Vec<T>>().map(|v| *v).map_err(|_| {
        StageError::data(format!("{op} expects a partition of {}", type_name::<T>()))
    })
}

/// ---- Element-wise DynOps ----
struct MapOp<I, O, F>(F, PhantomData<fn(I) -> O>);

impl<I, O, F> DynOp for MapOp<I, O, F>
where
    I: RFBound,
    O: RFBound,
    F: Send + Sync + Fn(&I) -> O + 'static,
{
    fn apply(&self, input: Partition) -> Result<Partition, StageError> {
        let v = take_input::<I>(input, "map")?;
        let out: Vec<O> = v.iter().map(|i| self.0(i)).collect();
        Ok(Box::new(out))
    }

    fn input_type(&self) -> TypeTag {
        TypeTag::of::<I>()
    }
}

struct FilterOp<T, P>(P, PhantomData<fn(T)>);

impl<T, P> DynOp for FilterOp<T, P>
where
    T: RFBound,
    P: Send + Sync + Fn(&T) -> bool + 'static,
{
    fn apply(&self, input: Partition) -> Result<Partition, StageError> {
        let v = take_input::<T>(input, "filter")?;
        Ok(Box::new(v.into_iter().filter(|t| self.0(t)).collect::<Vec<T>>()))
    }

    fn input_type(&self) -> TypeTag {
        TypeTag::of::<T>()
    }
}

struct FlatMapOp<I, O, F>(F, PhantomData<fn(I) -> O>);

impl<I, O, F> DynOp for FlatMapOp<I, O, F>
where
    I: RFBound,
    O: RFBound,
    F: Send + Sync + Fn(&I) -> Vec<O> + 'static,
{
    fn apply(&self, input: Partition) -> Result<Partition, StageError> {
        let v = take_input::<I>(input, "flat_map")?;
        let mut out: Vec<O> = Vec::new();
        for i in &v {
            out.extend(self.0(i));
        }
        Ok(Box::new(out))
    }

    fn input_type(&self) -> TypeTag {
        TypeTag::of::<I>()
    }
}

/// ---- Barrier DynOps ----
///
/// Grouping and combining emit keys in first-seen order, so results are
/// deterministic for a given input order.
struct GroupByKeyOp<K, V>(PhantomData<fn(K, V)>);

impl<K, V> DynOp for GroupByKeyOp<K, V>
where
    K: RFBound + Eq + Hash,
    V: RFBound,
{
    fn apply(&self, input: Partition) -> Result<Partition, StageError> {
        let kv = take_input::<(K, V)>(input, "group_by_key")?;
        let mut slots: HashMap<K, usize> = HashMap::new();
        let mut out: Vec<(K, Vec<V>)> = Vec::new();
        for (k, v) in kv {
            match slots.get(&k) {
                Some(&i) => out[i].1.push(v),
                None => {
                    slots.insert(k.clone(), out.len());
                    out.push((k, vec![v]));
                }
            }
        }
        Ok(Box::new(out))
    }

    fn input_type(&self) -> TypeTag {
        TypeTag::of::<(K, V)>()
    }

    fn element_wise(&self) -> bool {
        false
    }
}

struct CombineValuesOp<K, V, A, O, C> {
    comb: C,
    _t: PhantomData<fn(K, V, A) -> O>,
}

impl<K, V, A, O, C> DynOp for CombineValuesOp<K, V, A, O, C>
where
    K: RFBound + Eq + Hash,
    V: RFBound,
    A: 'static,
    O: RFBound,
    C: CombineFn<V, A, O>,
{
    fn apply(&self, input: Partition) -> Result<Partition, StageError> {
        let kv = take_input::<(K, V)>(input, "combine_values")?;
        let mut slots: HashMap<K, usize> = HashMap::new();
        let mut accs: Vec<(K, A)> = Vec::new();
        for (k, v) in kv {
            let i = match slots.get(&k) {
                Some(&i) => i,
                None => {
                    slots.insert(k.clone(), accs.len());
                    accs.push((k, self.comb.create()));
                    accs.len() - 1
                }
            };
            self.comb.add_input(&mut accs[i].1, v);
        }
        let out: Vec<(K, O)> = accs
            .into_iter()
            .map(|(k, a)| (k, self.comb.finish(a)))
            .collect();
        Ok(Box::new(out))
    }

    fn input_type(&self) -> TypeTag {
        TypeTag::of::<(K, V)>()
    }

    fn element_wise(&self) -> bool {
        false
    }
}

struct AggregateOp<V, A, O, C> {
    comb: C,
    _t: PhantomData<fn(V, A) -> O>,
}

impl<V, A, O, C> DynOp for AggregateOp<V, A, O, C>
where
    V: RFBound,
    A: 'static,
    O: RFBound,
    C: CombineFn<V, A, O>,
{
    fn apply(&self, input: Partition) -> Result<Partition, StageError> {
        let v = take_input::<V>(input, "aggregate")?;
        Ok(Box::new(vec![self.comb.fold_all(&v)]))
    }

    fn input_type(&self) -> TypeTag {
        TypeTag::of::<V>()
    }

    fn element_wise(&self) -> bool {
        false
    }
}

impl<T> PCollection<T> {
    fn wrap(p: &Pipeline, id: NodeId) -> Self {
        Self {
            pipeline: p.clone(),
            id,
            _t: PhantomData,
        }
    }

    #[must_use]
    pub fn node_id(&self) -> NodeId {
        self.id
    }

    #[must_use]
    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }
}

impl<T: RFBound> PCollection<T> {
    fn transform<O: RFBound>(
        &self,
        kind: TransformKind,
        op: Arc<dyn DynOp>,
        name: Option<String>,
    ) -> PCollection<O> {
        let id = self.pipeline.insert_node(Node::Transform {
            parent: self.id,
            kind,
            op,
            output: ElementType::of::<O>(),
            name,
        });
        PCollection::wrap(&self.pipeline, id)
    }

    pub fn map<O, F>(&self, f: F) -> PCollection<O>
    where
        O: RFBound,
        F: 'static + Send + Sync + Fn(&T) -> O,
    {
        self.transform(TransformKind::Map, Arc::new(MapOp::<T, O, F>(f, PhantomData)), None)
    }

    /// [`map`](Self::map) with a name shown in plans.
    pub fn map_named<O, F>(&self, name: impl Into<String>, f: F) -> PCollection<O>
    where
        O: RFBound,
        F: 'static + Send + Sync + Fn(&T) -> O,
    {
        self.transform(
            TransformKind::Map,
            Arc::new(MapOp::<T, O, F>(f, PhantomData)),
            Some(name.into()),
        )
    }

    pub fn filter<F>(&self, pred: F) -> PCollection<T>
    where
        F: 'static + Send + Sync + Fn(&T) -> bool,
    {
        self.transform(TransformKind::Filter, Arc::new(FilterOp::<T, F>(pred, PhantomData)), None)
    }

    pub fn filter_named<F>(&self, name: impl Into<String>, pred: F) -> PCollection<T>
    where
        F: 'static + Send + Sync + Fn(&T) -> bool,
    {
        self.transform(
            TransformKind::Filter,
            Arc::new(FilterOp::<T, F>(pred, PhantomData)),
            Some(name.into()),
        )
    }

    pub fn flat_map<O, F>(&self, f: F) -> PCollection<O>
    where
        O: RFBound,
        F: 'static + Send + Sync + Fn(&T) -> Vec<O>,
    {
        self.transform(TransformKind::FlatMap, Arc::new(FlatMapOp::<T, O, F>(f, PhantomData)), None)
    }

    pub fn flat_map_named<O, F>(&self, name: impl Into<String>, f: F) -> PCollection<O>
    where
        O: RFBound,
        F: 'static + Send + Sync + Fn(&T) -> Vec<O>,
    {
        self.transform(
            TransformKind::FlatMap,
            Arc::new(FlatMapOp::<T, O, F>(f, PhantomData)),
            Some(name.into()),
        )
    }

    /// Key every element by `key_fn`, keeping the element as the value.
    pub fn by<K, F>(&self, key_fn: F) -> PCollection<(K, T)>
    where
        K: RFBound,
        F: 'static + Send + Sync + Fn(&T) -> K,
    {
        self.map_named("by", move |t: &T| (key_fn(t), t.clone()))
    }

    /// Concatenate this collection with `others`, in argument order.
    ///
    /// # Errors
    ///
    /// [`GraphError::UnknownParent`] if a collection belongs to another pipeline.
    pub fn union(&self, others: &[&PCollection<T>]) -> Result<PCollection<T>, GraphError> {
        let mut parents = Vec::with_capacity(others.len() + 1);
        parents.push(self.id);
        for other in others {
            if !other.pipeline.same_as(&self.pipeline) {
                return Err(GraphError::UnknownParent(other.id));
            }
            parents.push(other.id);
        }
        let id = self.pipeline.add_node(Node::Union {
            parents,
            elem: ElementType::of::<T>(),
        })?;
        Ok(PCollection::wrap(&self.pipeline, id))
    }

    /// Global aggregation into a new collection holding the combined value.
    pub fn aggregate<C, A, O>(&self, comb: C) -> PCollection<O>
    where
        C: CombineFn<T, A, O>,
        A: 'static,
        O: RFBound,
    {
        let aggregator: Arc<dyn DynOp> = Arc::new(AggregateOp::<T, A, O, C> {
            comb,
            _t: PhantomData,
        });
        let id = self.pipeline.insert_node(Node::Aggregate {
            parent: self.id,
            aggregator,
            output: ElementType::of::<O>(),
        });
        PCollection::wrap(&self.pipeline, id)
    }

    /// Number of occurrences of each distinct element, in first-seen order.
    pub fn count_values(&self) -> PCollection<(T, u64)>
    where
        T: Eq + Hash,
    {
        self.by(T::clone).combine_values(Count)
    }

    /// Mark this node for caching with default options.
    #[must_use]
    pub fn cache(&self) -> Self {
        self.cache_with(CachingOptions::default())
    }

    /// Mark this node for caching. Caching runs nothing by itself.
    #[must_use]
    pub fn cache_with(&self, options: CachingOptions) -> Self {
        self.pipeline.cache().mark_cached(self.id, options);
        self.clone()
    }

    /// Declare a write of this collection to `target`.
    ///
    /// Returns the written collection (same elements), which can be consumed
    /// further. Nothing is written until a run includes the returned node, e.g.
    /// through [`Runner::run_all`].
    ///
    /// # Errors
    ///
    /// [`GraphError::TargetExists`] when `mode` is [`WriteMode::Default`] and the
    /// target already has output.
    pub fn write<Tg>(&self, target: Tg, mode: WriteMode) -> Result<PCollection<T>, GraphError>
    where
        Tg: Target + 'static,
    {
        if mode == WriteMode::Default && target.exists() {
            return Err(GraphError::TargetExists(target.name()));
        }
        let id = self.pipeline.add_node(Node::Materialize {
            parent: self.id,
            target: Arc::new(target),
            mode,
            elem: ElementType::of::<T>(),
        })?;
        Ok(PCollection::wrap(&self.pipeline, id))
    }

    /// Declare a write to a JSON Lines file.
    ///
    /// # Errors
    ///
    /// See [`write`](Self::write).
    #[cfg(feature = "io-jsonl")]
    pub fn write_jsonl(
        &self,
        path: impl Into<std::path::PathBuf>,
        mode: WriteMode,
    ) -> Result<PCollection<T>, GraphError> {
        self.write(crate::io::jsonl::JsonlTarget::<T>::new(path), mode)
    }

    /// Run this collection with a default [`Runner`] and return its data.
    ///
    /// # Errors
    ///
    /// See [`materialize_with`](Self::materialize_with).
    pub fn materialize(&self) -> Result<Materialized<T>, RunError> {
        self.materialize_with(&Runner::default())
    }

    /// Run this collection with `runner` and return its data.
    ///
    /// # Errors
    ///
    /// - [`RunError::Graph`] if the collection cannot be planned
    /// - [`RunError::Stage`] if the run failed
    pub fn materialize_with(&self, runner: &Runner) -> Result<Materialized<T>, RunError> {
        let mut outputs = runner.run(&self.pipeline, &[self.id])?.into_outputs()?;
        let handle = outputs.remove(&self.id).ok_or_else(|| RunError::Resolve {
            node: self.id,
            source: StageError::data("run produced no output for node"),
        })?;
        Materialized::from_handle(self.id, handle)
    }

    /// Run and copy the elements out.
    ///
    /// # Errors
    ///
    /// Any planning or run failure.
    pub fn collect(&self) -> anyhow::Result<Vec<T>> {
        Ok(self.materialize()?.to_vec())
    }

    /// Number of elements.
    #[must_use]
    pub fn count(&self) -> DeferredValue<u64> {
        DeferredValue::new(&self.pipeline, self.id, |h: &DataHandle| {
            h.len()
                .map(|n| n as u64)
                .ok_or_else(|| StageError::data("output does not decode"))
        })
    }

    /// The first element, if any.
    #[must_use]
    pub fn first(&self) -> DeferredValue<Option<T>> {
        DeferredValue::new(&self.pipeline, self.id, |h: &DataHandle| {
            decode::<T>(h).map(|v| v.first().cloned())
        })
    }

    /// All elements, as one value.
    #[must_use]
    pub fn as_collection(&self) -> DeferredValue<Vec<T>> {
        DeferredValue::new(&self.pipeline, self.id, |h: &DataHandle| {
            decode::<T>(h).map(<[T]>::to_vec)
        })
    }

    #[must_use]
    pub fn max(&self) -> DeferredValue<Option<T>>
    where
        T: Ord,
    {
        DeferredValue::new(&self.pipeline, self.id, |h: &DataHandle| {
            decode::<T>(h).map(|v| v.iter().max().cloned())
        })
    }

    #[must_use]
    pub fn min(&self) -> DeferredValue<Option<T>>
    where
        T: Ord,
    {
        DeferredValue::new(&self.pipeline, self.id, |h: &DataHandle| {
            decode::<T>(h).map(|v| v.iter().min().cloned())
        })
    }

    /// The plan a run of this collection would execute right now.
    ///
    /// # Errors
    ///
    /// Planning errors.
    pub fn explain(&self) -> Result<PlanExplanation, GraphError> {
        Ok(build_plan(&self.pipeline, &[self.id])?.explain())
    }

    /// The node's label: its transform name, source or target name, or kind.
    #[must_use]
    pub fn name(&self) -> String {
        self.pipeline
            .node(self.id)
            .map_or_else(|| self.id.to_string(), |n| n.label())
    }

    #[must_use]
    pub fn element_type(&self) -> ElementType {
        ElementType::of::<T>()
    }

    /// Element count when known without running: a retained cached result, a
    /// source that knows its length, or a chain of length-preserving nodes over
    /// one of those.
    #[must_use]
    pub fn size_hint(&self) -> Option<usize> {
        size_hint_of(&self.pipeline, self.id)
    }
}

fn size_hint_of(p: &Pipeline, id: NodeId) -> Option<usize> {
    if let Some(h) = p.cache().lookup(id) {
        return h.len();
    }
    match p.node(id)? {
        Node::Source { source, .. } => source.size_hint(),
        Node::Transform {
            parent,
            kind: TransformKind::Map,
            ..
        }
        | Node::Materialize { parent, .. } => size_hint_of(p, parent),
        Node::Union { parents, .. } => parents
            .iter()
            .map(|parent| size_hint_of(p, *parent))
            .sum(),
        Node::Transform { .. } | Node::Aggregate { .. } => None,
    }
}

fn decode<T: 'static>(h: &DataHandle) -> Result<&[T], StageError> {
    h.downcast_vec::<T>().map(Vec::as_slice).ok_or_else(|| {
        StageError::data(format!(
            "output of type {} does not decode as {}",
            h.element_type().name(),
            type_name::<T>()
        ))
    })
}

impl<K, V> PCollection<(K, V)>
where
    K: RFBound + Eq + Hash,
    V: RFBound,
{
    pub fn map_values<O, F>(&self, f: F) -> PCollection<(K, O)>
    where
        O: RFBound,
        F: 'static + Send + Sync + Fn(&V) -> O,
    {
        self.map(move |kv: &(K, V)| (kv.0.clone(), f(&kv.1)))
    }

    /// Group values by key. Keys appear in first-seen order, values in input order.
    pub fn group_by_key(&self) -> PCollection<(K, Vec<V>)> {
        self.transform(
            TransformKind::GroupByKey,
            Arc::new(GroupByKeyOp::<K, V>(PhantomData)),
            None,
        )
    }

    /// Combine the values of each key with `comb`.
    pub fn combine_values<C, A, O>(&self, comb: C) -> PCollection<(K, O)>
    where
        C: CombineFn<V, A, O>,
        A: 'static,
        O: RFBound,
    {
        self.transform(
            TransformKind::CombineValues,
            Arc::new(CombineValuesOp::<K, V, A, O, C> {
                comb,
                _t: PhantomData,
            }),
            None,
        )
    }
}

/// The data of one run of a collection.
///
/// Iteration is restartable and finite; elements are cloned as they are
/// yielded, the underlying data is shared with the run result (and the cache,
/// when the node is cached).
#[derive(Clone)]
pub struct Materialized<T> {
    node: NodeId,
    handle: DataHandle,
    _t: PhantomData<fn() -> T>,
}

impl<T: 'static> Materialized<T> {
    fn from_handle(node: NodeId, handle: DataHandle) -> Result<Self, RunError> {
        if let Err(source) = decode::<T>(&handle) {
            return Err(RunError::Resolve { node, source });
        }
        Ok(Self {
            node,
            handle,
            _t: PhantomData,
        })
    }

    #[must_use]
    pub fn node(&self) -> NodeId {
        self.node
    }

    #[must_use]
    pub fn handle(&self) -> &DataHandle {
        &self.handle
    }

    #[must_use]
    pub fn as_slice(&self) -> &[T] {
        decode::<T>(&self.handle).unwrap_or(&[])
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.as_slice().is_empty()
    }

    pub fn iter(&self) -> std::iter::Cloned<std::slice::Iter<'_, T>>
    where
        T: Clone,
    {
        self.as_slice().iter().cloned()
    }

    #[must_use]
    pub fn to_vec(&self) -> Vec<T>
    where
        T: Clone,
    {
        self.as_slice().to_vec()
    }
}

impl<'a, T: Clone + 'static> IntoIterator for &'a Materialized<T> {
    type Item = T;
    type IntoIter = std::iter::Cloned<std::slice::Iter<'a, T>>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<T: Debug + 'static> Debug for Materialized<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> FormatResult {
        f.debug_list().entries(self.as_slice()).finish()
    }
}
