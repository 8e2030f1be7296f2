//! Error surface shared by every tracing tier.
//!
//! Ring buffers never report through this type: a full or empty ring is an
//! expected backpressure condition and is signalled with `None` instead.

use thiserror::Error;

/// Convenience result alias for fallible tracing operations.
pub type TraceResult<T, E = TraceError> = Result<T, E>;

/// Errors surfaced by locks, sessions, encoders and transports.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TraceError {
    /// A name was empty, a required pointer was missing, or a value was out of range.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// A registry lookup failed or there was no state to return.
    #[error("not found: {0}")]
    NotFound(String),

    /// The deadline expired before the operation completed.
    #[error("operation timed out")]
    TimedOut,

    /// Allocating a context or backing buffer failed.
    #[error("failed to allocate {requested} bytes")]
    NoMemory { requested: usize },

    /// The operation requires an `init` that has not happened yet.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// The implementation does not provide this optional capability.
    #[error("not supported: {0}")]
    NotSupported(&'static str),
}

impl TraceError {
    pub fn not_found(what: impl Into<String>) -> Self {
        TraceError::NotFound(what.into())
    }

    /// Returns true for [`TraceError::TimedOut`].
    pub fn is_timeout(&self) -> bool {
        matches!(self, TraceError::TimedOut)
    }
}

/// Allocates a zeroed backing buffer, reporting allocation failure instead of aborting.
pub fn alloc_buffer(len: usize) -> TraceResult<Box<[u8]>> {
    let mut storage = Vec::new();
    storage
        .try_reserve_exact(len)
        .map_err(|_| TraceError::NoMemory { requested: len })?;
    storage.resize(len, 0);
    Ok(storage.into_boxed_slice())
}
