//! CSI error types.
//!
//! All errors in the `libcsi` crate are represented by the [`CsiError`] enum,
//! which derives [`thiserror::Error`] for ergonomic error handling and also
//! implements [`Serialize`]/[`Deserialize`] so errors can travel across the
//! socket transport inside a [`CsiMessage::Error`](crate::CsiMessage::Error).
//!
//! Each variant maps onto a gRPC-style status [`Code`] which tells the
//! orchestrator whether the call may be retried.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Unified error type for CSI operations.
#[derive(Debug, Error, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub enum CsiError {
    /// The caller supplied a malformed or incomplete request.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Another mutating call for the same volume is still in flight.
    #[error("volume {0} is already being processed")]
    VolumeBusy(String),

    /// A mount operation (or the mountpoint preparation around it) failed.
    #[error("mount failed at {path}: {reason}")]
    MountFailed {
        /// Filesystem path where the mount was attempted.
        path: String,
        /// Human-readable failure reason.
        reason: String,
    },

    /// An unmount operation failed.
    #[error("unmount failed at {path}: {reason}")]
    UnmountFailed {
        /// Filesystem path where the unmount was attempted.
        path: String,
        /// Human-readable failure reason.
        reason: String,
    },

    /// The mount state of a path could not be determined.
    #[error("failed to probe mountpoint {path}: {reason}")]
    ProbeFailed {
        /// Path that was probed.
        path: String,
        /// Human-readable failure reason.
        reason: String,
    },

    /// The RPC is not supported by this plugin.
    #[error("not implemented: {0}")]
    Unimplemented(String),

    /// A socket / framing error.
    #[error("transport error: {0}")]
    TransportError(String),

    /// An unclassified internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl CsiError {
    /// Create a [`CsiError::TransportError`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn transport<E: fmt::Display>(e: E) -> Self {
        Self::TransportError(e.to_string())
    }

    /// Create a [`CsiError::Internal`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn internal<E: fmt::Display>(e: E) -> Self {
        Self::Internal(e.to_string())
    }

    /// Create a [`CsiError::MountFailed`] for `path`.
    pub fn mount_failed<E: fmt::Display>(path: impl AsRef<std::path::Path>, e: E) -> Self {
        Self::MountFailed {
            path: path.as_ref().display().to_string(),
            reason: e.to_string(),
        }
    }

    /// Create a [`CsiError::UnmountFailed`] for `path`.
    pub fn unmount_failed<E: fmt::Display>(path: impl AsRef<std::path::Path>, e: E) -> Self {
        Self::UnmountFailed {
            path: path.as_ref().display().to_string(),
            reason: e.to_string(),
        }
    }

    /// Status code reported to the caller.
    pub fn code(&self) -> Code {
        match self {
            Self::InvalidArgument(_) => Code::InvalidArgument,
            Self::VolumeBusy(_) => Code::Aborted,
            Self::MountFailed { .. }
            | Self::UnmountFailed { .. }
            | Self::ProbeFailed { .. }
            | Self::Internal(_) => Code::Internal,
            Self::Unimplemented(_) => Code::Unimplemented,
            Self::TransportError(_) => Code::Unavailable,
        }
    }

    /// Whether resending the same request later may succeed.
    ///
    /// Validation failures and unimplemented RPCs never change outcome on
    /// retry; everything else may.
    pub fn is_retryable(&self) -> bool {
        !matches!(self.code(), Code::InvalidArgument | Code::Unimplemented)
    }
}

/// gRPC-style status codes used by the CSI lifecycle protocol.
///
/// Only the codes this plugin can actually produce are listed; the numeric
/// values match the gRPC status code specification.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Code {
    /// Client specified an invalid argument.
    InvalidArgument = 3,
    /// The operation was aborted; the caller should retry later.
    Aborted = 10,
    /// Operation is not implemented or not supported.
    Unimplemented = 12,
    /// Internal error.
    Internal = 13,
    /// The service is currently unavailable.
    Unavailable = 14,
}

impl Code {
    /// Get human-readable description of this code
    #[must_use]
    pub const fn description(&self) -> &'static str {
        match self {
            Code::InvalidArgument => "Client specified an invalid argument",
            Code::Aborted => "The operation was aborted",
            Code::Unimplemented => "Operation is not implemented or not supported",
            Code::Internal => "Internal error",
            Code::Unavailable => "The service is currently unavailable",
        }
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}
