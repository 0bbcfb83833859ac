use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Why a raw line was rejected by the decoder.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeFault {
    #[error("empty line")]
    Empty,
    #[error("expected {expected} fields, got {actual}")]
    FieldCount { expected: usize, actual: usize },
    #[error("field `{field}` is not a number: {value:?}")]
    NotANumber { field: &'static str, value: String },
    #[error("no line terminator within {limit} bytes")]
    Oversized { limit: usize },
}

/// One malformed input line. Counted and discarded, never fatal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed line ({reason}): {raw_line:?}")]
pub struct DecodeError {
    pub reason: DecodeFault,
    pub raw_line: String,
}

impl DecodeError {
    pub fn new(reason: DecodeFault, raw_line: impl Into<String>) -> Self {
        Self {
            reason,
            raw_line: raw_line.into(),
        }
    }
}

/// The serial port could not be opened, or was lost mid-session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("serial port {port}: {reason}")]
pub struct ConnectionError {
    pub port: String,
    pub reason: String,
}

impl ConnectionError {
    pub fn new(port: impl Into<String>, reason: impl ToString) -> Self {
        Self {
            port: port.into(),
            reason: reason.to_string(),
        }
    }
}

/// The export destination could not be created, or a write/flush failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("export to {}: {message}", path.display())]
pub struct ExportError {
    pub path: PathBuf,
    pub kind: io::ErrorKind,
    pub message: String,
}

impl ExportError {
    pub fn from_io(path: impl Into<PathBuf>, err: &io::Error) -> Self {
        Self {
            path: path.into(),
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// An operation was requested in a session state that forbids it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StateError {
    #[error("acquisition is already running")]
    AlreadyAcquiring,
    #[error("acquisition is not running")]
    NotAcquiring,
    #[error("export requires an active acquisition")]
    ExportRequiresAcquisition,
    #[error("export is already running")]
    AlreadyExporting,
    #[error("export is not running")]
    NotExporting,
    #[error("reset is only allowed while the session is idle")]
    ResetRequiresIdle,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Everything the session controller can hand back to its caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Export(#[from] ExportError),
    #[error(transparent)]
    State(#[from] StateError),
}
