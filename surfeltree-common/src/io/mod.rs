//! Adapters for external point cloud formats.
//!
//! Every adapter streams: [PointFormat::read] pushes surfels into a callback, and
//! [PointFormat::write] pulls batches from a callback, so no adapter ever holds a
//! whole data set in memory.

use crate::geometry::surfel::Surfel;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

pub mod ascii;
pub mod binary;
pub mod converter;
pub mod provenance;

#[derive(Debug, Error, Clone)]
pub enum FormatError {
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: IoError,
    },

    #[error("{}:{line}: {message}", .path.display())]
    Parse {
        path: PathBuf,
        line: usize,
        message: String,
    },

    #[error("{} is truncated: {bytes} bytes is not a multiple of the record size {record_size}", .path.display())]
    Truncated {
        path: PathBuf,
        bytes: u64,
        record_size: usize,
    },

    #[error("Unknown point cloud format: '{0}'")]
    UnknownFormat(String),
}

impl FormatError {
    pub fn io(path: &Path, source: std::io::Error) -> Self {
        FormatError::Io {
            path: path.to_owned(),
            source: source.into(),
        }
    }
}

/// Wrapper around std::io::Error,
/// that allows it to be "cloned" by putting it inside of an Arc.
#[derive(Debug, Clone)]
pub struct IoError(pub Arc<std::io::Error>);

impl std::error::Error for IoError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}

impl std::fmt::Display for IoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl From<std::io::Error> for IoError {
    fn from(value: std::io::Error) -> Self {
        Self(Arc::new(value))
    }
}

/// Source of the next batch of surfels for [PointFormat::write].
/// `Ok(None)` signals the end of the stream.
pub type PullFn<'a> = dyn FnMut() -> Result<Option<Vec<Surfel>>, FormatError> + 'a;

pub trait PointFormat: Send + Sync {
    /// File extension (without the dot) this adapter is registered for.
    fn extension(&self) -> &'static str;

    /// Whether the format stores radius and normal.
    fn carries_attributes(&self) -> bool;

    /// Reads the file and passes every surfel to `emit`, in file order.
    /// Returns the number of surfels read.
    fn read(&self, path: &Path, emit: &mut dyn FnMut(Surfel)) -> Result<u64, FormatError>;

    /// Creates the file and writes every batch returned by `pull`, until it returns `None`.
    /// Returns the number of surfels written.
    fn write(&self, path: &Path, pull: &mut PullFn<'_>) -> Result<u64, FormatError>;
}

/// Lookup of format adapters by file extension.
pub struct FormatRegistry {
    formats: Vec<Box<dyn PointFormat>>,
}

impl FormatRegistry {
    pub fn empty() -> Self {
        FormatRegistry {
            formats: Vec::new(),
        }
    }

    /// Registry with all built-in adapters.
    pub fn with_defaults() -> Self {
        let mut registry = FormatRegistry::empty();
        registry.register(Box::new(ascii::AsciiFormat::Xyz));
        registry.register(Box::new(ascii::AsciiFormat::XyzAll));
        registry.register(Box::new(ascii::AsciiFormat::XyzGrey));
        registry.register(Box::new(binary::BinaryFormat::surfels()));
        registry.register(Box::new(binary::BinaryFormat::points()));
        registry
    }

    /// Adds an adapter. A later adapter for the same extension replaces the earlier one.
    pub fn register(&mut self, format: Box<dyn PointFormat>) {
        self.formats.retain(|f| f.extension() != format.extension());
        self.formats.push(format);
    }

    pub fn extensions(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.formats.iter().map(|f| f.extension())
    }

    pub fn by_extension(&self, extension: &str) -> Result<&dyn PointFormat, FormatError> {
        let extension = extension.trim_start_matches('.');
        self.formats
            .iter()
            .find(|f| f.extension().eq_ignore_ascii_case(extension))
            .map(|f| f.as_ref())
            .ok_or_else(|| FormatError::UnknownFormat(extension.to_string()))
    }

    pub fn for_path(&self, path: &Path) -> Result<&dyn PointFormat, FormatError> {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .ok_or_else(|| FormatError::UnknownFormat(path.display().to_string()))?;
        self.by_extension(extension)
    }
}

impl Default for FormatRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
