//! JSON Lines (JSONL) sources and targets.
//!
//! This module provides:
//! - **Typed vector I/O** with Serde: [`read_jsonl_vec`] and [`write_jsonl_vec`]
//! - [`JsonlSource`]: a [`Source`] reading one file
//! - [`JsonlTarget`]: a [`Target`] honouring every [`WriteMode`]
//!
//! # Notes
//! - Files are newline-delimited JSON; empty/whitespace-only lines are skipped on read.
//! - Parse and I/O failures surface as [`DataError`](crate::error::FailureKind::DataError)
//!   stage failures when they happen inside a run.

use crate::error::StageError;
use crate::io::{Source, Target, WriteMode};
use crate::type_token::{DataHandle, ElementType};
use anyhow::{Context, Result};
use serde::{Serialize, de::DeserializeOwned};
use std::fs::{File, OpenOptions, create_dir_all};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

/// Read a JSONL file into a typed `Vec<T>`.
///
/// # Errors
/// Returns an error if the file cannot be opened, read, or if any line fails
/// to parse into `T`. Errors include the line number.
pub fn read_jsonl_vec<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<Vec<T>> {
    let path = path.as_ref();
    let f = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let rdr = BufReader::new(f);
    let mut out = Vec::<T>::new();
    for (i, line) in rdr.lines().enumerate() {
        let line = line.with_context(|| format!("read line {} in {}", i + 1, path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        let v: T = serde_json::from_str(&line).with_context(|| {
            format!("parse JSONL line {} in {}: {}", i + 1, path.display(), line)
        })?;
        out.push(v);
    }
    Ok(out)
}

/// Write a typed slice as a JSONL file (one JSON value per line).
///
/// With `append` the rows are added after any existing content; otherwise the
/// file is truncated. Parent directories are created as needed.
///
/// # Returns
/// The number of items written (`data.len()`).
///
/// # Errors
/// Returns an error if the file/dirs cannot be created or any item fails to
/// serialize/flush.
pub fn write_jsonl_vec<T: Serialize>(path: impl AsRef<Path>, data: &[T], append: bool) -> Result<usize> {
    let path = path.as_ref();
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        create_dir_all(parent).with_context(|| format!("mkdir -p {}", parent.display()))?;
    }
    let f = OpenOptions::new()
        .create(true)
        .write(true)
        .append(append)
        .truncate(!append)
        .open(path)
        .with_context(|| format!("open {} for writing", path.display()))?;
    let mut w = BufWriter::new(f);
    for (i, item) in data.iter().enumerate() {
        serde_json::to_writer(&mut w, item)
            .with_context(|| format!("serialize item #{} to {}", i, path.display()))?;
        w.write_all(b"\n")?;
    }
    w.flush()?;
    Ok(data.len())
}

/// A [`Source`] that reads a whole JSONL file when its stage runs.
pub struct JsonlSource<T> {
    path: PathBuf,
    _t: PhantomData<fn() -> T>,
}

impl<T> JsonlSource<T> {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            _t: PhantomData,
        }
    }
}

impl<T> Source for JsonlSource<T>
where
    T: DeserializeOwned + Clone + Send + Sync + 'static,
{
    fn name(&self) -> String {
        format!("jsonl:{}", self.path.display())
    }

    fn element_type(&self) -> ElementType {
        ElementType::of::<T>()
    }

    fn read(&self) -> Result<DataHandle, StageError> {
        let rows = read_jsonl_vec::<T>(&self.path).map_err(|e| StageError::data(format!("{e:#}")))?;
        Ok(DataHandle::from_vec(rows))
    }
}

/// A [`Target`] writing JSONL to one file.
pub struct JsonlTarget<T> {
    path: PathBuf,
    _t: PhantomData<fn(T)>,
}

impl<T> JsonlTarget<T> {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            _t: PhantomData,
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl<T> Target for JsonlTarget<T>
where
    T: Serialize + Send + Sync + 'static,
{
    fn name(&self) -> String {
        format!("jsonl:{}", self.path.display())
    }

    fn exists(&self) -> bool {
        self.path.exists()
    }

    fn write(&self, data: &DataHandle, mode: WriteMode) -> Result<(), StageError> {
        let rows = data.downcast_vec::<T>().ok_or_else(|| {
            StageError::data(format!(
                "{} expects {}, got {}",
                self.name(),
                std::any::type_name::<T>(),
                data.element_type().name()
            ))
        })?;
        let append = match mode {
            WriteMode::Checkpoint if self.exists() => return Ok(()),
            WriteMode::Default if self.exists() => {
                return Err(StageError::data(format!("{} already exists", self.name())));
            }
            WriteMode::Append => true,
            _ => false,
        };
        write_jsonl_vec(&self.path, rows, append)
            .map(|_| ())
            .map_err(|e| StageError::data(format!("{e:#}")))
    }
}
