//! Error types for the coordination fabric

use thiserror::Error;

use crate::xa::XaCode;

/// Error kinds carried in replies across the system.
///
/// These are protocol values, not internal errors: a lookup answered
/// `absent` or a call answered `timeout` is a normal, first-class outcome
/// for the caller to branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ErrorKind {
    /// Requested resource is not known
    Absent,
    /// Service exists but has no live instance
    NoEntry,
    /// Deadline exceeded
    Timeout,
    /// Instance died mid-call; reply synthesized to preserve caller progress
    ServiceError,
    /// IPC or TCP peer gone
    CommunicationUnavailable,
    /// Gateway version negotiation failed
    ProtocolVersion,
    /// Internal invariant violated
    InvalidSemantics,
    /// XA driver return code
    Xa(XaCode),
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Absent => write!(f, "absent"),
            Self::NoEntry => write!(f, "no_entry"),
            Self::Timeout => write!(f, "timeout"),
            Self::ServiceError => write!(f, "service_error"),
            Self::CommunicationUnavailable => write!(f, "communication_unavailable"),
            Self::ProtocolVersion => write!(f, "protocol_version"),
            Self::InvalidSemantics => write!(f, "invalid_semantics"),
            Self::Xa(code) => write!(f, "xa: {code}"),
        }
    }
}

/// Top-level error for casual operations
#[derive(Error, Debug)]
pub enum CasualError {
    /// The peer device or socket is gone
    #[error("communication unavailable: {context}")]
    CommunicationUnavailable {
        /// What was being addressed when the peer vanished
        context: String,
    },

    /// A transport frame violated the framing contract
    #[error("transport protocol error: {reason}")]
    TransportProtocol {
        /// Why the frame was rejected
        reason: String,
    },

    /// Encoding or decoding of a message payload failed
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Persistent store failure (transaction log or queue store)
    #[error("storage error: {source}")]
    Storage {
        /// Underlying sqlx failure
        #[source]
        source: Box<sqlx::Error>,
    },

    /// Invalid configuration
    #[error("configuration error: {field} - {reason}")]
    Configuration {
        /// Offending configuration field
        field: String,
        /// Why it was rejected
        reason: String,
    },

    /// Internal invariant violated; the domain may escalate to shutdown
    #[error("invalid semantics: {reason}")]
    InvalidSemantics {
        /// Which invariant broke
        reason: String,
    },

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<sqlx::Error> for CasualError {
    fn from(source: sqlx::Error) -> Self {
        Self::Storage {
            source: Box::new(source),
        }
    }
}

/// Message encoding/decoding errors
#[derive(Error, Debug)]
pub enum CodecError {
    /// The buffer ended before the schema was satisfied
    #[error("unexpected end of payload: needed {needed} more bytes")]
    UnexpectedEnd {
        /// How many bytes the decoder still expected
        needed: usize,
    },

    /// An unknown message type tag was read
    #[error("unknown message type: {value}")]
    UnknownMessageType {
        /// The offending tag
        value: u64,
    },

    /// A decoded value failed domain validation
    #[error("invalid value for {field}: {reason}")]
    InvalidValue {
        /// Field being decoded
        field: &'static str,
        /// Validation failure
        reason: String,
    },

    /// Compact (intra-domain) layout failure
    #[error("ipc layout error: {0}")]
    Ipc(#[from] bincode::Error),
}

/// Result alias for casual operations
pub type Result<T> = std::result::Result<T, CasualError>;
