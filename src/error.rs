//! Crate-wide error type and wire error code mapping (RFC... no, just ours).
//!
//! Every fallible component operation returns [`CsapResult`]. The session
//! processor is the single place that turns a [`CsapError`] into an
//! `ERR <n> <NAME> <message>` wire line.

use num_derive::ToPrimitive;
use num_traits::ToPrimitive as _;
use std::fmt;

/// Convenience alias used throughout the crate.
pub type CsapResult<T> = Result<T, CsapError>;

/// Taxonomy of failures reported to clients.
#[derive(Debug, Clone, ToPrimitive)]
pub enum CsapError {
    /// Malformed command, unparsable octal, path overflow.
    Invalid(String),
    /// Target file/dir/metadata absent, unknown transfer id.
    NotFound(String),
    /// Login required, path outside sandbox, triad denies access.
    Perm(String),
    /// Exclusive create raced with an existing entry.
    Exists(String),
    /// Broker table full.
    Busy(String),
    /// Syscall failure; message carries the OS error text.
    Io(String),
    /// Unknown command verb.
    Unsupported(String),
    /// Rendezvous wait failure or other internal inconsistency.
    Internal(String),
}

impl CsapError {
    /// Numeric wire code sent in the `ERR <n> <NAME> <msg>` line.
    pub fn code(&self) -> u32 {
        self.to_u32().expect("CsapError always maps to a code")
    }

    /// Wire `NAME` token, matching the numeric code.
    pub fn code_name(&self) -> &'static str {
        match self {
            CsapError::Invalid(_) => "INVALID",
            CsapError::NotFound(_) => "NOT_FOUND",
            CsapError::Perm(_) => "PERM",
            CsapError::Exists(_) => "EXISTS",
            CsapError::Busy(_) => "BUSY",
            CsapError::Io(_) => "IO",
            CsapError::Unsupported(_) => "UNSUPPORTED",
            CsapError::Internal(_) => "INTERNAL",
        }
    }

    /// Human-readable message carried in the wire line.
    pub fn message(&self) -> &str {
        match self {
            CsapError::Invalid(m)
            | CsapError::NotFound(m)
            | CsapError::Perm(m)
            | CsapError::Exists(m)
            | CsapError::Busy(m)
            | CsapError::Io(m)
            | CsapError::Unsupported(m)
            | CsapError::Internal(m) => m,
        }
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        CsapError::Invalid(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        CsapError::NotFound(msg.into())
    }

    pub fn perm(msg: impl Into<String>) -> Self {
        CsapError::Perm(msg.into())
    }

    pub fn exists(msg: impl Into<String>) -> Self {
        CsapError::Exists(msg.into())
    }

    pub fn busy(msg: impl Into<String>) -> Self {
        CsapError::Busy(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        CsapError::Internal(msg.into())
    }
}

impl fmt::Display for CsapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ERR {} {} {}", self.code(), self.code_name(), self.message())
    }
}

impl std::error::Error for CsapError {}

/// Maps a host `io::Error` to the closest wire error, keeping the OS text.
impl From<std::io::Error> for CsapError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind::*;
        let text = err.to_string();
        match err.kind() {
            NotFound => CsapError::NotFound(text),
            PermissionDenied => CsapError::Perm(text),
            AlreadyExists => CsapError::Exists(text),
            _ => CsapError::Io(text),
        }
    }
}
