// Copyright 2024 The Cairn Authors
// SPDX-License-Identifier: Apache-2.0

//! Error types for Cairn with errno-compatible error codes.
//!
//! Operations across the platform report failures drawn from the host
//! errno family, plus a small gateway-specific family (quotas, cache
//! revalidation, missing pools). The command-line tool turns these into
//! process exit codes via [`Error::errno`].

use thiserror::Error;

/// A specialized `Result` type for Cairn operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errno-compatible error codes used throughout the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// The object, image, snapshot or key does not exist (ENOENT).
    NotFound,
    /// An argument or name was malformed (EINVAL).
    InvalidArgument,
    /// The target already exists (EEXIST).
    Exists,
    /// The resource is held by someone else (EBUSY).
    Busy,
    /// The container still has dependents (ENOTEMPTY).
    NotEmpty,
    /// The operation did not complete in time (ETIMEDOUT).
    TimedOut,
    /// An optimistic update lost a race and should be retried (ECANCELED).
    Canceled,
    /// An unrecoverable I/O or internal failure (EIO).
    Io,
    /// Cached state is stale; re-resolve and retry (EAGAIN).
    Again,
    /// The caller is not permitted to perform the operation (EPERM).
    PermissionDenied,
    /// The requested attribute is not present (ENODATA).
    NoData,
    /// A value is outside the representable range (ERANGE).
    Range,
    /// The target is a directory-like object (EISDIR).
    IsDirectory,
    /// The operation is not supported by this build or format (ENOTSUP).
    NotSupported,
    /// An internal invariant was violated. Reported as an error rather than
    /// aborting the process.
    InvariantViolation,

    // Gateway-specific family.
    /// A pool quota (bytes or objects) would be exceeded.
    QuotaExceeded,
    /// A guarded precondition (snapshot, version) did not hold.
    PreconditionFailed,
    /// Cached state is still current; nothing was fetched.
    NotModified,
    /// The named pool does not exist.
    NoSuchPool,
}

impl ErrorCode {
    /// Returns the negative errno value for this code.
    ///
    /// Gateway-family codes map onto the closest errno so that shell callers
    /// always see a meaningful exit status.
    #[must_use]
    pub const fn errno(&self) -> i32 {
        match self {
            Self::NotFound | Self::NoSuchPool => -2,
            Self::PermissionDenied => -1,
            Self::Io => -5,
            Self::Again => -11,
            Self::Busy => -16,
            Self::Exists => -17,
            Self::IsDirectory => -21,
            Self::InvalidArgument | Self::InvariantViolation => -22,
            Self::Range => -34,
            Self::NotEmpty => -39,
            Self::NoData => -61,
            Self::NotSupported => -95,
            Self::TimedOut => -110,
            Self::Canceled => -125,
            Self::QuotaExceeded => -122,
            Self::PreconditionFailed => -22,
            Self::NotModified => 0,
        }
    }

    /// Returns the symbolic name for this code.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "NotFound",
            Self::InvalidArgument => "InvalidArgument",
            Self::Exists => "Exists",
            Self::Busy => "Busy",
            Self::NotEmpty => "NotEmpty",
            Self::TimedOut => "TimedOut",
            Self::Canceled => "Canceled",
            Self::Io => "Io",
            Self::Again => "Again",
            Self::PermissionDenied => "PermissionDenied",
            Self::NoData => "NoData",
            Self::Range => "Range",
            Self::IsDirectory => "IsDirectory",
            Self::NotSupported => "NotSupported",
            Self::InvariantViolation => "InvariantViolation",
            Self::QuotaExceeded => "QuotaExceeded",
            Self::PreconditionFailed => "PreconditionFailed",
            Self::NotModified => "NotModified",
            Self::NoSuchPool => "NoSuchPool",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Errors that can occur during Cairn operations.
#[derive(Debug, Error)]
pub enum Error {
    /// A platform error with a specific code.
    #[error("{code}: {message}")]
    Op {
        /// The error code.
        code: ErrorCode,
        /// A human-readable error message.
        message: String,
    },

    /// I/O error from the host filesystem.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or framing error.
    #[error("encoding error: {0}")]
    Encoding(String),
}

impl Error {
    /// Creates a new error with the given code.
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Op { code, message: message.into() }
    }

    /// Shorthand for a `NotFound` error.
    #[must_use]
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, what)
    }

    /// Shorthand for an `InvalidArgument` error.
    #[must_use]
    pub fn invalid(what: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidArgument, what)
    }

    /// Shorthand for an `InvariantViolation` error.
    #[must_use]
    pub fn invariant(what: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvariantViolation, what)
    }

    /// Returns the error code, if this is a coded error.
    #[must_use]
    pub const fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::Op { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Returns true if the error carries the given code.
    #[must_use]
    pub fn is(&self, code: ErrorCode) -> bool {
        self.code() == Some(code)
    }

    /// Returns the negative errno value for this error.
    #[must_use]
    pub fn errno(&self) -> i32 {
        match self {
            Self::Op { code, .. } => code.errno(),
            Self::Io(e) => -e.raw_os_error().unwrap_or(5),
            Self::Encoding(_) => ErrorCode::InvalidArgument.errno(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(ErrorCode::NotFound.errno(), -2);
        assert_eq!(ErrorCode::InvalidArgument.errno(), -22);
        assert_eq!(ErrorCode::Canceled.errno(), -125);
        assert_eq!(ErrorCode::TimedOut.errno(), -110);
        assert_eq!(ErrorCode::NoSuchPool.errno(), -2);
    }

    #[test]
    fn test_error_code_accessor() {
        let err = Error::new(ErrorCode::Busy, "image is locked");
        assert_eq!(err.code(), Some(ErrorCode::Busy));
        assert!(err.is(ErrorCode::Busy));
        assert!(!err.is(ErrorCode::NotFound));
        assert_eq!(err.errno(), -16);
    }

    #[test]
    fn test_error_display() {
        let err = Error::not_found("no such image: foo");
        assert_eq!(format!("{err}"), "NotFound: no such image: foo");
    }

    #[test]
    fn test_io_error_errno() {
        let io = std::io::Error::from_raw_os_error(13);
        let err = Error::from(io);
        assert_eq!(err.errno(), -13);
    }
}
