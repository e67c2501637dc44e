//! Error types for tensorshm.

use crate::fingerprint::Fingerprint;
use std::time::Duration;
use thiserror::Error;

/// Result type alias using tensorshm's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for tensorshm operations.
#[derive(Error, Debug)]
pub enum Error {
    /// The tensor descriptor is malformed.
    #[error("invalid tensor descriptor: {0}")]
    InvalidDescriptor(String),

    /// Host memory or shared-memory quota is exhausted.
    #[error("shared memory allocation failed: {0}")]
    AllocationFailed(String),

    /// The segment vanished (or was replaced) between lookup and attach.
    #[error("failed to map segment {fingerprint}: {reason}")]
    MapFailed {
        /// Segment being attached.
        fingerprint: Fingerprint,
        /// What went wrong.
        reason: String,
    },

    /// The per-fingerprint lock could not be acquired in time.
    #[error("timed out after {waited:?} waiting for the lock on {fingerprint}")]
    LockTimeout {
        /// Segment whose lock was contended.
        fingerprint: Fingerprint,
        /// How long the caller waited.
        waited: Duration,
    },

    /// The caller's populate callback failed; the segment was rolled back.
    #[error("populating segment {fingerprint} failed: {source}")]
    PopulateFailed {
        /// Segment being created.
        fingerprint: Fingerprint,
        /// Underlying failure.
        #[source]
        source: std::io::Error,
    },

    /// Segment header is corrupt or inconsistent with the request.
    #[error("invalid segment: {0}")]
    InvalidSegment(String),

    /// The agent has been shut down.
    #[error("agent has been shut down")]
    ShutDown,

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Publishing an inventory report failed.
    #[error("inventory publish failed: {0}")]
    Publish(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// System call error (via rustix).
    #[error("system error: {0}")]
    System(#[from] rustix::io::Errno),
}

/// Recovery class of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Lost a race or hit contention; retry the whole resolve.
    Transient,
    /// Memory is exhausted; surface to the runtime, do not retry.
    ResourceExhausted,
    /// Bad input; never retry.
    InvalidInput,
    /// Anything else (I/O, corruption, shutdown, transport).
    Internal,
}

impl Error {
    /// Classify this error for retry decisions.
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::MapFailed { .. } | Error::LockTimeout { .. } => ErrorClass::Transient,
            Error::AllocationFailed(_) => ErrorClass::ResourceExhausted,
            Error::InvalidDescriptor(_) | Error::Config(_) => ErrorClass::InvalidInput,
            Error::PopulateFailed { .. }
            | Error::InvalidSegment(_)
            | Error::ShutDown
            | Error::Publish(_)
            | Error::Io(_)
            | Error::System(_) => ErrorClass::Internal,
        }
    }

    /// Whether retrying the whole resolve sequence can succeed.
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// Map an errno from sizing a segment to `AllocationFailed` where it means exhaustion.
    pub(crate) fn from_sizing(errno: rustix::io::Errno, what: &str) -> Self {
        use rustix::io::Errno;
        match errno {
            Errno::NOSPC | Errno::NOMEM | Errno::FBIG | Errno::DQUOT => {
                Error::AllocationFailed(format!("{what}: {errno}"))
            }
            other => Error::System(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classes() {
        let fp = Fingerprint::of_content(b"x");
        assert!(
            Error::MapFailed {
                fingerprint: fp,
                reason: "gone".into()
            }
            .is_retryable()
        );
        assert!(
            Error::LockTimeout {
                fingerprint: fp,
                waited: Duration::from_millis(5)
            }
            .is_retryable()
        );
        assert_eq!(
            Error::AllocationFailed("full".into()).class(),
            ErrorClass::ResourceExhausted
        );
        assert_eq!(
            Error::InvalidDescriptor("bad".into()).class(),
            ErrorClass::InvalidInput
        );
        assert!(!Error::ShutDown.is_retryable());
    }

    #[test]
    fn test_sizing_errno_mapping() {
        use rustix::io::Errno;
        assert!(matches!(
            Error::from_sizing(Errno::NOSPC, "fallocate"),
            Error::AllocationFailed(_)
        ));
        assert!(matches!(
            Error::from_sizing(Errno::NOMEM, "fallocate"),
            Error::AllocationFailed(_)
        ));
        assert!(matches!(
            Error::from_sizing(Errno::BADF, "fallocate"),
            Error::System(Errno::BADF)
        ));
    }
}
