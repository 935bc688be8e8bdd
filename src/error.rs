use std::path::PathBuf;

use thiserror::Error;

/// Crate-wide result alias, mirroring the `Result<T>` alias
/// `abstract_fs::fs::FsError` uses for its own component.
pub type Result<T> = std::result::Result<T, QueueError>;

/// Error taxonomy for the queue. Usage errors and schema/data errors are
/// always fatal to the caller; race-fatal I/O carries the syscall, path
/// and originating `io::Error` (whose `raw_os_error()` gives errno).
/// Race-benign conditions (`EEXIST` on create, `ENOENT` on delete of
/// something another participant may have reaped) never reach this type:
/// they are absorbed at the `fs_primitives` layer as sentinel values.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("invalid option: {0}")]
    InvalidOption(String),

    #[error("I/O error during '{syscall}' on '{path}': {source}")]
    Io {
        syscall: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("mandatory field '{0}' is missing")]
    MissingField(String),

    #[error("invalid field '{field}': {reason}")]
    InvalidField { field: String, reason: String },

    /// Named by spec §6/§7 as a possible `add` failure for an
    /// implementation where "schema-less" and "schema-bearing" queues
    /// are the same type. This crate splits that distinction into two
    /// separate types instead (`Queue` always holds a validated
    /// `Schema`; `SimpleQueue` has no schema concept at all), so no
    /// code path can ever construct this variant here. Kept in the
    /// enum to keep the public error taxonomy complete against spec §7
    /// rather than silently dropping a named error kind.
    #[error("queue has no schema")]
    NoSchema,

    #[error("invalid element name '{0}'")]
    InvalidName(String),

    #[error("unexpected filesystem state: {0}")]
    Unexpected(String),

    #[error("element '{0}' is not locked")]
    NotLocked(String),

    #[error("malformed table line: {0:?}")]
    MalformedTable(String),

    #[error("field '{0}' is not valid Unicode")]
    InvalidEncoding(String),
}

impl QueueError {
    pub(crate) fn io(syscall: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        QueueError::Io {
            syscall,
            path: path.into(),
            source,
        }
    }
}
