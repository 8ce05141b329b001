//! Error types for the NBD gateway.

use std::io;

use thiserror::Error;

use ballast_store::StoreError;

/// Block device result type
pub type BlockResult<T> = Result<T, BlockError>;

/// Errors raised while serving an export.
#[derive(Debug, Error)]
pub enum BlockError {
    /// Socket-level I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Malformed frame from the client; the connection is closed without a
    /// reply
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Command offset/length exceeds the export bounds
    #[error("request out of bounds: offset {offset} length {length} (export size {size})")]
    Range {
        /// Requested offset
        offset: u64,
        /// Requested length
        length: u32,
        /// Export size the request was checked against
        size: u64,
    },

    /// Command type outside the supported set
    #[error("unsupported command type: {0}")]
    UnsupportedCommand(u16),

    /// Object store failure that escaped the retry budget
    #[error("storage unavailable: {0}")]
    Storage(#[from] StoreError),

    /// Another holder owns the export's lease
    #[error("export '{0}' is locked by another client")]
    LeaseConflict(String),

    /// The session's lease expired or was taken over
    #[error("lease lost for export '{0}'")]
    LeaseLost(String),

    /// The server is terminating
    #[error("server shutting down")]
    ShuttingDown,
}

impl BlockError {
    /// Map to the errno carried in a simple reply.
    pub fn to_errno(&self) -> NbdErrno {
        match self {
            BlockError::Range { .. } | BlockError::UnsupportedCommand(_) => NbdErrno::Inval,
            _ => NbdErrno::Io,
        }
    }
}

/// Errno values carried in NBD simple replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum NbdErrno {
    /// Success
    Ok = 0,
    /// I/O error (EIO)
    Io = 5,
    /// Invalid argument (EINVAL)
    Inval = 22,
}

impl NbdErrno {
    /// Wire value
    pub fn code(&self) -> u32 {
        *self as u32
    }

    /// Check for success
    pub fn is_ok(&self) -> bool {
        matches!(self, NbdErrno::Ok)
    }
}
