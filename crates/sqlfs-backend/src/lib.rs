//! # sqlfs-backend
//!
//! Persistence contract consumed by the SQLFS core.
//!
//! The core never talks to a relational engine directly; it goes through the
//! [`SqlBackend`] trait, which executes parameterized statements in a
//! restricted dialect and exposes a separate chunked streaming channel for
//! large binary blobs.
//!
//! ## Statement dialect
//!
//! ```text
//! SELECT col, col[$n], ... FROM table [WHERE col = $n]
//! INSERT INTO table (col, ...) VALUES ($1, ...)
//! UPDATE table SET col = $n, col[$n] = $n, ... [WHERE col = $n]
//! DELETE FROM table [WHERE col = $n]
//! ```
//!
//! Placeholders are 1-based `$n`. `col[$i]` addresses one slot of an array
//! column (0-based); assigning at index `len` appends, so the same statement
//! shape serves both slot reuse and growth.
//!
//! [`MemoryBackend`] is the in-memory reference implementation used by the
//! test suites and by embedders that do not need a real engine.

mod dialect;
mod memory;

pub use dialect::{Assignment, ColumnRef, Filter, Statement};
pub use memory::MemoryBackend;

use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by a persistence backend.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("malformed statement: {0}")]
    Statement(String),

    #[error("placeholder ${0} has no bound parameter")]
    MissingParam(usize),

    #[error("parameter ${0} has the wrong type for its position")]
    ParamType(usize),

    #[error("blob not found: {0}")]
    BlobNotFound(BlobRef),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BackendError>;

/// Handle of an independently streamed blob in the backing store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlobRef(pub Uuid);

impl BlobRef {
    /// Allocate a fresh blob handle.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for BlobRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// One cell of a row, or one bound parameter.
///
/// Array variants exist because the SQLFS schema packs sparse-file slots and
/// inline file children into array columns rather than one row per entry.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Int(i64),
    Real(f64),
    Text(String),
    Bytes(Vec<u8>),
    TextArray(Vec<String>),
    IntArray(Vec<i64>),
    BytesArray(Vec<Vec<u8>>),
    /// Array of text tuples; used for inline file children of a directory.
    TextMatrix(Vec<Vec<String>>),
}

impl Value {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Real(v) => Some(*v),
            Value::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_text_array(&self) -> Option<&[String]> {
        match self {
            Value::TextArray(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_int_array(&self) -> Option<&[i64]> {
        match self {
            Value::IntArray(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_text_matrix(&self) -> Option<&[Vec<String>]> {
        match self {
            Value::TextMatrix(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

/// One result row.
pub type Row = Vec<Value>;

/// Chunked writer for a large blob.
///
/// Chunking exists purely to cap peak memory; the blob is logically one
/// contiguous byte sequence.
pub trait BlobWrite: Send {
    fn write_chunk(&mut self, chunk: &[u8]) -> Result<()>;

    /// Flush and return the total number of bytes written.
    fn finish(&mut self) -> Result<u64>;
}

/// Chunked reader for a large blob. An empty chunk signals end of stream.
pub trait BlobRead: Send {
    fn read_chunk(&mut self, max: usize) -> Result<Vec<u8>>;
}

/// The narrow relational-execution capability the SQLFS core consumes.
pub trait SqlBackend: Send + Sync {
    /// Execute one parameterized statement, returning zero or more rows.
    fn execute(&self, statement: &str, params: &[Value]) -> Result<Vec<Row>>;

    /// Open a blob for chunked writing, creating or truncating it.
    fn open_blob_write(&self, blob: BlobRef) -> Result<Box<dyn BlobWrite>>;

    /// Open an existing blob for chunked reading.
    fn open_blob_read(&self, blob: BlobRef) -> Result<Box<dyn BlobRead>>;

    /// Remove a blob and its bytes.
    fn unlink_blob(&self, blob: BlobRef) -> Result<()>;
}
