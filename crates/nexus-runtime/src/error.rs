use std::fmt;

use crate::handle::CommandId;

/// Coarse classification of every failure the runtime reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed size, out-of-range slot, non-positive launch geometry.
    InvalidArgument,
    /// Unresolved library path, unknown kernel, unknown property, bad device index.
    NotFound,
    /// Operation issued in the wrong lifecycle phase.
    InvalidState,
    /// Device or module failure during load or execution.
    RuntimeFailure,
    /// Capability or data type the backend cannot provide.
    Unsupported,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::InvalidArgument => write!(f, "invalid argument"),
            ErrorKind::NotFound => write!(f, "not found"),
            ErrorKind::InvalidState => write!(f, "invalid state"),
            ErrorKind::RuntimeFailure => write!(f, "runtime failure"),
            ErrorKind::Unsupported => write!(f, "unsupported"),
        }
    }
}

/// Errors returned by the Nexus runtime.
#[derive(Debug, thiserror::Error)]
pub enum NexusError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("runtime failure: {0}")]
    RuntimeFailure(String),

    #[error("command {index} ({command}, kernel '{kernel}') failed: {reason}")]
    CommandFailed {
        /// Position of the command in its schedule.
        index: usize,
        command: CommandId,
        kernel: String,
        reason: String,
    },

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl NexusError {
    /// Project onto the five-way error taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            NexusError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            NexusError::NotFound(_) => ErrorKind::NotFound,
            NexusError::InvalidState(_) => ErrorKind::InvalidState,
            NexusError::RuntimeFailure(_) | NexusError::CommandFailed { .. } => {
                ErrorKind::RuntimeFailure
            }
            NexusError::Unsupported(_) => ErrorKind::Unsupported,
            NexusError::Io(e) if e.kind() == std::io::ErrorKind::NotFound => ErrorKind::NotFound,
            NexusError::Io(_) => ErrorKind::RuntimeFailure,
        }
    }

    /// Schedule position of the failing command, if this is a command failure.
    pub fn failed_command(&self) -> Option<usize> {
        match self {
            NexusError::CommandFailed { index, .. } => Some(*index),
            _ => None,
        }
    }
}
