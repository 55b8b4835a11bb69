//! Shared error types for the spine framework.

use std::fmt;
use thiserror::Error;

/// Which part of an operation ran out of time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Waiting on the registry or the discovery transport for an address.
    Resolve,
    /// Connecting, writing or reading a frame.
    Exchange,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Resolve => write!(f, "resolve"),
            Stage::Exchange => write!(f, "exchange"),
        }
    }
}

/// Top-level error type returned by every spine operation.
///
/// Variants fall into four families so callers can pick a retry policy:
/// discovery failures (retry after backoff), transport and framing failures
/// (the connection is gone, the registry entry has been evicted),
/// authentication failures (security events, never retried blindly) and
/// local errors (configuration, codec, cancellation).
#[derive(Error, Debug)]
pub enum SpineError {
    /// No record exists for the name and no deadline allowed a live lookup.
    #[error("Service not found: {0}")]
    NotFound(String),

    /// The caller's time budget elapsed before the operation finished.
    #[error("Deadline exceeded during {stage}")]
    DeadlineExceeded {
        /// Where the time ran out.
        stage: Stage,
    },

    /// The discovery transport failed to advertise, browse or resolve.
    #[error("Discovery failure: {0}")]
    Discovery(String),

    /// A header buffer did not have the fixed encoded size.
    #[error("Malformed header: expected {expected} bytes, got {actual}")]
    MalformedHeader {
        /// Required header size.
        expected: usize,
        /// Size of the buffer that was supplied.
        actual: usize,
    },

    /// The payload of a frame could not be processed.
    #[error("Corrupt payload: {0}")]
    CorruptPayload(String),

    /// A response was structurally unusable (e.g. shorter than its tag).
    #[error("Corrupt response: {0}")]
    CorruptResponse(String),

    /// A message authentication tag did not match, or decryption failed.
    #[error("Authentication failure: {0}")]
    AuthenticationFailure(String),

    /// The remote side answered with a non-OK status byte.
    #[error("Remote returned status {status}")]
    RemoteStatus {
        /// Raw status byte from the response header.
        status: u8,
    },

    /// Caller and callee disagree on the request/response layout.
    #[error("Layout mismatch: expected {expected}, found {found}")]
    LayoutMismatch {
        /// Layout the caller was compiled against.
        expected: String,
        /// Layout the service reported.
        found: String,
    },

    /// A frame declared a payload larger than the configured maximum.
    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge {
        /// Payload length, declared or actual.
        size: u64,
        /// Configured maximum.
        max: u32,
    },

    /// The peer closed the connection before a complete frame arrived.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The serialization codec rejected a value.
    #[error("Codec error: {0}")]
    Codec(String),

    /// A configuration value was missing or invalid.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The owning namespace (or component) was torn down.
    #[error("Cancelled")]
    Cancelled,

    /// An I/O error occurred.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SpineError {
    /// Whether the error came from name resolution rather than a peer.
    pub fn is_discovery(&self) -> bool {
        matches!(
            self,
            SpineError::NotFound(_)
                | SpineError::Discovery(_)
                | SpineError::DeadlineExceeded {
                    stage: Stage::Resolve
                }
        )
    }

    /// Whether the time budget ran out, at any stage.
    pub fn is_deadline(&self) -> bool {
        matches!(self, SpineError::DeadlineExceeded { .. })
    }

    /// Whether the error came from the connection or the wire protocol.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            SpineError::Io(_)
                | SpineError::ConnectionClosed
                | SpineError::MalformedHeader { .. }
                | SpineError::CorruptPayload(_)
                | SpineError::CorruptResponse(_)
                | SpineError::MessageTooLarge { .. }
                | SpineError::RemoteStatus { .. }
        )
    }

    /// Whether the error is a tag or decryption failure.
    pub fn is_authentication(&self) -> bool {
        matches!(self, SpineError::AuthenticationFailure(_))
    }
}

/// Alias for Result with SpineError.
pub type SpineResult<T> = Result<T, SpineError>;
