//! # Error types for crashtrace
//!
//! Everything in this crate reports failures through [`TraceError`]. OS-level
//! errors keep their original errno, but [`TraceError::kind`] folds every
//! error into the small portable vocabulary of [`ErrorKind`] so that callers
//! do not have to reason about platform codes. Codes outside that vocabulary
//! come back as [`ErrorKind::Other`] and must be treated as raw platform
//! codes.

use thiserror::Error;

/// Result type used throughout this crate
pub type Result<T> = std::result::Result<T, TraceError>;

#[derive(Error, Debug)]
pub enum TraceError {
    #[error("os error: {0}")]
    Os(#[from] nix::Error),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("not a valid binary image: {0}")]
    InvalidFormat(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("unsupported machine (e_machine {0:#x})")]
    UnsupportedMachine(u16),
    #[error("this build cannot capture thread state on the host architecture")]
    UnsupportedHostArch,
    #[error("no thread with id {0} in the target process")]
    NoSuchThread(i32),
    #[error("a process cannot suspend itself and keep running")]
    SuspendSelf,
    #[error("range cannot be mapped, fall back to a plain read")]
    NotMappable,
    #[error("could not serialize report: {0}")]
    Json(#[from] serde_json::Error),
}

/// Portable classification of a [`TraceError`]
///
/// The first four values are the vocabulary every caller can rely on.
/// [`ErrorKind::Other`] carries the raw platform code unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    AccessDenied,
    OutOfMemory,
    InvalidArgument,
    InvalidFormat,
    Other(i32),
}

impl TraceError {
    /// Maps this error onto the portable [`ErrorKind`] vocabulary
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            TraceError::Os(errno) => match errno {
                nix::Error::ENOENT | nix::Error::ESRCH => ErrorKind::NotFound,
                nix::Error::EPERM | nix::Error::EACCES => ErrorKind::AccessDenied,
                nix::Error::ENOMEM => ErrorKind::OutOfMemory,
                nix::Error::EINVAL => ErrorKind::InvalidArgument,
                other => ErrorKind::Other(*other as i32),
            },
            TraceError::Io(e) => match e.kind() {
                std::io::ErrorKind::NotFound => ErrorKind::NotFound,
                std::io::ErrorKind::PermissionDenied => ErrorKind::AccessDenied,
                std::io::ErrorKind::InvalidInput => ErrorKind::InvalidArgument,
                _ => ErrorKind::Other(e.raw_os_error().unwrap_or(0)),
            },
            TraceError::NotFound(_) | TraceError::NoSuchThread(_) => ErrorKind::NotFound,
            TraceError::InvalidArgument(_) | TraceError::SuspendSelf => ErrorKind::InvalidArgument,
            TraceError::InvalidFormat(_)
            | TraceError::UnsupportedMachine(_)
            | TraceError::UnsupportedHostArch => ErrorKind::InvalidFormat,
            TraceError::NotMappable => ErrorKind::InvalidArgument,
            TraceError::Json(_) => ErrorKind::InvalidFormat,
        }
    }
}
