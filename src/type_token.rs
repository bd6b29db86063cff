//! Element types, type-erased vector helpers and data handles.
//!
//! This module provides:
//! - [`TypeTag`]: a lightweight runtime type identifier used by the graph to check
//!   element-type compatibility across edges without carrying generic types.
//! - [`VecOps`]: a type-erased interface for the `Vec<T>` operations an executor
//!   needs (length, splitting, concatenation, cloning). Concrete implementations are
//!   produced via [`vec_ops_for`].
//! - [`ElementType`]: the per-node capability pairing a tag with its `VecOps`.
//! - [`DataHandle`]: an opaque, cheaply clonable handle to a computed dataset.
//!
//! The core never inspects elements. Graph construction compares tags; executors
//! move data through `VecOps`. All operations return `None` if the dynamic type
//! does not match the expected `Vec<T>`.

use std::any::{Any, TypeId, type_name};
use std::fmt::{Debug, Formatter, Result as FormatResult};
use std::marker::PhantomData;
use std::sync::Arc;

/// A partition buffer carried between operators at runtime.
///
/// Executors materialize intermediate results as opaque, type-erased partitions.
/// Operators downcast these to the expected `Vec<T>` when applying their work.
pub type Partition = Box<dyn Any + Send + Sync>;

/// A lightweight runtime type tag.
///
/// ```
/// use lazybeam::type_token::TypeTag;
/// let tag = TypeTag::of::<u32>();
/// assert_eq!(tag.name, "u32");
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TypeTag {
    /// Stable Rust type identifier.
    pub id: TypeId,
    /// Human-readable type name (best-effort).
    pub name: &'static str,
}

impl TypeTag {
    /// Construct a tag for `T`.
    #[must_use]
    pub fn of<T: 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: type_name::<T>(),
        }
    }
}

/// Type-erased helpers for `Vec<T>`.
///
/// Implementations must return `None` when the provided `data` does not match
/// the concrete `Vec<T>` the implementor expects.
pub trait VecOps: Send + Sync {
    /// Return the number of elements if `data` is a `Vec<T>`, otherwise `None`.
    fn len(&self, data: &dyn Any) -> Option<usize>;

    /// Split `data` (a `Vec<T>`) into up to `n` contiguous partitions.
    ///
    /// Small inputs or `n <= 1` yield a single chunk. Element order is preserved.
    fn split(&self, data: &dyn Any, n: usize) -> Option<Vec<Partition>>;

    /// Concatenate partitions (each a `Vec<T>`) in order into one `Vec<T>`.
    fn concat(&self, parts: Vec<Partition>) -> Option<Partition>;

    /// Clone the entire `Vec<T>` behind `data` and return it boxed as a [`Partition`].
    fn clone_any(&self, data: &dyn Any) -> Option<Partition>;
}

/// Concrete `VecOps` for a specific `T`.
pub struct VecOpsImpl<T: Clone + Send + Sync + 'static>(PhantomData<T>);

impl<T: Clone + Send + Sync + 'static> VecOps for VecOpsImpl<T> {
    fn len(&self, data: &dyn Any) -> Option<usize> {
        data.downcast_ref::<Vec<T>>().map(Vec::len)
    }

    fn split(&self, data: &dyn Any, n: usize) -> Option<Vec<Partition>> {
        let v = data.downcast_ref::<Vec<T>>()?;
        let len = v.len();

        if n <= 1 || len <= 1 {
            return Some(vec![Box::new(v.clone())]);
        }

        // Contiguous chunks of ~len/n each (last chunk may be shorter).
        let chunk = len.div_ceil(n);
        let parts = v
            .chunks(chunk)
            .map(|c| Box::new(c.to_vec()) as Partition)
            .collect();
        Some(parts)
    }

    fn concat(&self, parts: Vec<Partition>) -> Option<Partition> {
        let mut out = Vec::<T>::new();
        for part in parts {
            let v = part.downcast::<Vec<T>>().ok()?;
            if out.is_empty() {
                out = *v;
            } else {
                out.extend(*v);
            }
        }
        Some(Box::new(out))
    }

    fn clone_any(&self, data: &dyn Any) -> Option<Partition> {
        data.downcast_ref::<Vec<T>>()
            .map(|v| Box::new(v.clone()) as Partition)
    }
}

/// Create a type-erased `VecOps` for `Vec<T>`.
///
/// ```
/// use lazybeam::type_token::{vec_ops_for, VecOps};
/// use std::any::Any;
///
/// let ops: std::sync::Arc<dyn VecOps> = vec_ops_for::<i64>();
/// let data: Box<dyn Any + Send + Sync> = Box::new(vec![1i64, 2, 3]);
/// assert_eq!(ops.len(data.as_ref()), Some(3));
/// ```
#[must_use]
pub fn vec_ops_for<T: Clone + Send + Sync + 'static>() -> Arc<dyn VecOps> {
    Arc::new(VecOpsImpl::<T>(PhantomData))
}

/// The element type of a node: a tag for compatibility checks plus the
/// `VecOps` executors use to move the node's data around.
#[derive(Clone)]
pub struct ElementType {
    tag: TypeTag,
    ops: Arc<dyn VecOps>,
}

impl ElementType {
    /// Element type for collections of `T`.
    #[must_use]
    pub fn of<T: Clone + Send + Sync + 'static>() -> Self {
        Self {
            tag: TypeTag::of::<T>(),
            ops: vec_ops_for::<T>(),
        }
    }

    #[must_use]
    pub fn tag(&self) -> TypeTag {
        self.tag
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.tag.name
    }

    #[must_use]
    pub fn ops(&self) -> &dyn VecOps {
        self.ops.as_ref()
    }

    /// Whether data of `other` can flow into an edge expecting `self`.
    #[must_use]
    pub fn is_compatible(&self, other: &ElementType) -> bool {
        self.tag == other.tag
    }
}

impl Debug for ElementType {
    fn fmt(&self, f: &mut Formatter<'_>) -> FormatResult {
        write!(f, "ElementType({})", self.tag.name)
    }
}

impl PartialEq for ElementType {
    fn eq(&self, other: &Self) -> bool {
        self.tag == other.tag
    }
}

impl Eq for ElementType {}

/// Opaque handle to a dataset produced by a source or a stage.
///
/// Handles are reference counted: cloning never copies elements, and a handle
/// keeps its data alive for as long as any holder (a run result, the cache
/// registry, a [`Materialized`](crate::collection::Materialized)) retains it.
#[derive(Clone)]
pub struct DataHandle {
    data: Arc<dyn Any + Send + Sync>,
    elem: ElementType,
}

impl DataHandle {
    /// Wrap an owned vector.
    #[must_use]
    pub fn from_vec<T: Clone + Send + Sync + 'static>(data: Vec<T>) -> Self {
        Self::from_arc(Arc::new(data))
    }

    /// Wrap a shared vector without copying it.
    #[must_use]
    pub fn from_arc<T: Clone + Send + Sync + 'static>(data: Arc<Vec<T>>) -> Self {
        Self {
            data,
            elem: ElementType::of::<T>(),
        }
    }

    /// Wrap an arbitrary payload and the element type claimed for it.
    ///
    /// Nothing checks that the payload actually is a `Vec` of that type; a
    /// mismatched handle simply reports itself as unreadable.
    #[must_use]
    pub fn from_parts(data: Arc<dyn Any + Send + Sync>, elem: ElementType) -> Self {
        Self { data, elem }
    }

    pub(crate) fn from_partition(part: Partition, elem: ElementType) -> Self {
        Self {
            data: Arc::from(part),
            elem,
        }
    }

    #[must_use]
    pub fn element_type(&self) -> &ElementType {
        &self.elem
    }

    /// Number of elements, or `None` if the payload does not decode as its
    /// element type.
    #[must_use]
    pub fn len(&self) -> Option<usize> {
        self.elem.ops().len(self.data.as_ref())
    }

    /// A handle is readable when its payload still decodes as its element type.
    #[must_use]
    pub fn is_readable(&self) -> bool {
        self.len().is_some()
    }

    /// Borrow the payload as `Vec<T>`.
    #[must_use]
    pub fn downcast_vec<T: 'static>(&self) -> Option<&Vec<T>> {
        self.data.downcast_ref::<Vec<T>>()
    }

    pub(crate) fn split(&self, n: usize) -> Option<Vec<Partition>> {
        self.elem.ops().split(self.data.as_ref(), n)
    }

    pub(crate) fn to_partition(&self) -> Option<Partition> {
        self.elem.ops().clone_any(self.data.as_ref())
    }

    /// Whether both handles share the same underlying payload.
    #[must_use]
    pub fn same_data(&self, other: &DataHandle) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }
}

impl Debug for DataHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> FormatResult {
        match self.len() {
            Some(n) => write!(f, "DataHandle<{}>[{n}]", self.elem.name()),
            None => write!(f, "DataHandle<{}>[unreadable]", self.elem.name()),
        }
    }
}
