//! Forwarding table errors.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Record decoding errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecordError {
    #[error("record is {actual} bytes, layout requires {expected}")]
    Length { expected: usize, actual: usize },

    #[error("non-zero padding at offset {0}")]
    Padding(usize),

    #[error("invalid IPv4 prefix length {0}")]
    PrefixLen(u8),

    #[error("unknown local device kind {0}")]
    DeviceKind(u32),
}

/// Table errors.
#[derive(Debug, Error)]
pub enum TableError {
    /// Lookup miss. Callers usually treat this as "absent", not as a failure.
    #[error("key not found in table {table}")]
    NotFound { table: String },

    /// Encoded record width does not match the table's declared width.
    #[error("{field} size mismatch on table {table}: declared {expected} bytes, got {actual}")]
    SizeMismatch {
        table: String,
        field: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("batch has {keys} keys but {values} values")]
    LengthMismatch { keys: usize, values: usize },

    #[error("table {table} is full ({capacity} entries)")]
    TableFull { table: String, capacity: u32 },

    #[error("invalid map name '{0}' (max 15 chars of [A-Za-z0-9_.])")]
    InvalidName(String),

    #[error("failed to create pin directory {path}: {source}")]
    PinDir { path: PathBuf, source: io::Error },

    #[error("failed to create map {name}: {source}")]
    Create { name: String, source: io::Error },

    #[error("failed to pin map at {path}: {source}")]
    Pin { path: PathBuf, source: io::Error },

    #[error("failed to open pinned map {path}: {source}")]
    Open {
        path: PathBuf,
        source: aya::maps::MapError,
    },

    #[error("corrupt record in table {table}: {source}")]
    Corrupt { table: String, source: RecordError },

    #[error("map operation failed: {0}")]
    Map(#[from] aya::maps::MapError),

    /// A best-effort batch stopped short of applying every entry.
    #[error("batch applied {applied} entries before failing: {source}")]
    PartialBatch {
        applied: usize,
        #[source]
        source: Box<TableError>,
    },
}

pub type Result<T> = std::result::Result<T, TableError>;
