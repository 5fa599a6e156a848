//! Generic status taxonomy shared between the engine and its host.
//!
//! Every operation ultimately resolves to either a payload or one of these
//! statuses. Remote errno values are folded into this taxonomy through
//! [`crate::proto::errno`]; policy errors (access denied, name collision,
//! directory not empty) are produced entirely by local checks.

use thiserror::Error;

/// Terminal status of a failed file-system operation.
///
/// "Expected" variants ([`NotFound`](Status::NotFound),
/// [`AccessDenied`](Status::AccessDenied),
/// [`NameCollision`](Status::NameCollision)) are part of normal control flow
/// and are not worth logging; the rest indicate something went wrong.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    #[error("object not found")]
    NotFound,
    #[error("access denied")]
    AccessDenied,
    #[error("an object with that name already exists")]
    NameCollision,
    #[error("directory not empty")]
    DirectoryNotEmpty,
    #[error("not a directory")]
    NotADirectory,
    #[error("is a directory")]
    IsADirectory,
    #[error("invalid parameter")]
    InvalidParameter,
    #[error("end of file")]
    EndOfFile,
    #[error("buffer too small")]
    BufferTooSmall,
    #[error("no space left on volume")]
    NoSpace,
    #[error("name too long")]
    NameTooLong,
    #[error("media is write protected")]
    WriteProtected,
    #[error("operation not supported")]
    NotSupported,
    #[error("request cancelled")]
    Cancelled,
    #[error("device not ready")]
    NotReady,
    #[error("i/o error")]
    IoError,
}

impl Status {
    /// Whether this status is part of normal control flow rather than a
    /// genuine failure. Unexpected statuses get logged at the dispatch
    /// boundary; expected ones do not.
    #[must_use]
    pub fn is_expected(self) -> bool {
        matches!(
            self,
            Status::NotFound
                | Status::AccessDenied
                | Status::NameCollision
                | Status::DirectoryNotEmpty
                | Status::EndOfFile
        )
    }
}

/// Transport-level protocol violations.
///
/// Always fatal to the request that hit them; a version mismatch is
/// additionally fatal to the whole session.
#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("message truncated: got {got} bytes, need at least {need}")]
    Truncated { got: usize, need: usize },
    #[error("unknown opcode {0}")]
    UnknownOpcode(u32),
    #[error("protocol major version mismatch: remote {remote}, local {local}")]
    VersionMismatch { remote: u32, local: u32 },
    #[error("declared length {declared} disagrees with buffer length {actual}")]
    BadLength { declared: u32, actual: usize },
}

impl From<ProtoError> for Status {
    fn from(err: ProtoError) -> Self {
        match err {
            ProtoError::VersionMismatch { .. } => Status::AccessDenied,
            _ => Status::IoError,
        }
    }
}
