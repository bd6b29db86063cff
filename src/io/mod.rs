//! Source and target capabilities.
//!
//! The core never performs physical I/O itself. A [`Node::Source`](crate::node::Node)
//! holds a [`Source`] that produces a [`DataHandle`] when an executor runs it, and a
//! [`Node::Materialize`](crate::node::Node) holds a [`Target`] that consumes one.
//!
//! Built-in implementations:
//! - [`VecSource`]: an in-memory vector (what [`from_vec`](crate::from_vec) uses)
//! - [`MemoryTarget`]: an in-memory capture sink
//! - [`jsonl`]: JSON Lines files (feature `io-jsonl`)

#[cfg_attr(docsrs, doc(cfg(feature = "io-jsonl")))]
#[cfg(feature = "io-jsonl")]
pub mod jsonl;

use crate::error::StageError;
use crate::type_token::{DataHandle, ElementType};
use crate::utils::lock;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

/// How a [`Target`] treats output that already exists.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum WriteMode {
    /// Replace existing output.
    Overwrite,
    /// Add to existing output.
    Append,
    /// Write only if no output exists yet; existing output is kept as is.
    Checkpoint,
    /// Fail if output already exists. Checked when the write is declared.
    #[default]
    Default,
}

impl WriteMode {
    /// Whether writing the same data again leaves the target as one write would.
    #[must_use]
    pub fn is_repeatable(self) -> bool {
        matches!(self, WriteMode::Overwrite | WriteMode::Checkpoint)
    }
}

/// Producer of a source node's data.
pub trait Source: Send + Sync {
    /// Name used in plans and logs.
    fn name(&self) -> String;

    /// Element type of the produced data.
    fn element_type(&self) -> ElementType;

    /// Produce the data.
    ///
    /// # Errors
    ///
    /// Returns a [`StageError`] classified by the cause (unreadable data is a
    /// [`DataError`](crate::error::FailureKind::DataError)).
    fn read(&self) -> Result<DataHandle, StageError>;

    /// Number of elements, when known without reading.
    fn size_hint(&self) -> Option<usize> {
        None
    }
}

/// Consumer of a materialize node's data.
pub trait Target: Send + Sync {
    /// Name used in plans, logs and errors.
    fn name(&self) -> String;

    /// Whether output already exists at this target.
    fn exists(&self) -> bool;

    /// Write `data` according to `mode`.
    ///
    /// # Errors
    ///
    /// Returns a [`StageError`] if the data cannot be decoded or written.
    fn write(&self, data: &DataHandle, mode: WriteMode) -> Result<(), StageError>;
}

/// A source backed by an in-memory vector.
pub struct VecSource<T> {
    data: Arc<Vec<T>>,
}

impl<T> VecSource<T> {
    pub fn new(data: Vec<T>) -> Self {
        Self {
            data: Arc::new(data),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Source for VecSource<T> {
    fn name(&self) -> String {
        format!("vec<{}>", std::any::type_name::<T>())
    }

    fn element_type(&self) -> ElementType {
        ElementType::of::<T>()
    }

    fn read(&self) -> Result<DataHandle, StageError> {
        Ok(DataHandle::from_arc(Arc::clone(&self.data)))
    }

    fn size_hint(&self) -> Option<usize> {
        Some(self.data.len())
    }
}

/// In-memory capture target.
///
/// Clones share the captured rows, so a test can keep one clone and hand the
/// other to [`PCollection::write`](crate::PCollection::write).
pub struct MemoryTarget<T> {
    name: String,
    rows: Arc<Mutex<Option<Vec<T>>>>,
}

impl<T> Clone for MemoryTarget<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            rows: Arc::clone(&self.rows),
        }
    }
}

impl<T: Clone> MemoryTarget<T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rows: Arc::new(Mutex::new(None)),
        }
    }

    /// A target that already holds `rows`.
    pub fn with_rows(name: impl Into<String>, rows: Vec<T>) -> Self {
        Self {
            name: name.into(),
            rows: Arc::new(Mutex::new(Some(rows))),
        }
    }

    /// The captured rows, if anything has been written.
    #[must_use]
    pub fn contents(&self) -> Option<Vec<T>> {
        lock(&self.rows).clone()
    }
}

impl<T: Clone + Send + Sync + 'static> Target for MemoryTarget<T> {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn exists(&self) -> bool {
        lock(&self.rows).is_some()
    }

    fn write(&self, data: &DataHandle, mode: WriteMode) -> Result<(), StageError> {
        let rows = data.downcast_vec::<T>().ok_or_else(|| {
            StageError::data(format!(
                "target `{}` expects {}, got {}",
                self.name,
                std::any::type_name::<T>(),
                data.element_type().name()
            ))
        })?;
        let mut slot = lock(&self.rows);
        match (mode, slot.as_mut()) {
            (WriteMode::Checkpoint, Some(_)) => {}
            (WriteMode::Default, Some(_)) => {
                return Err(StageError::data(format!(
                    "target `{}` already exists",
                    self.name
                )));
            }
            (WriteMode::Append, Some(existing)) => existing.extend(rows.iter().cloned()),
            _ => *slot = Some(rows.clone()),
        }
        Ok(())
    }
}
