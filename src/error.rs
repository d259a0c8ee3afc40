//! JFAP error types.
//!
//! # Error Classification
//!
//! Every error has exactly one owner: it is either returned to the caller of
//! the operation that caused it, or delivered to the failure callback of the
//! conversation / multiplexer it killed. Nothing is swallowed and nothing is
//! retried internally.
//!
//! | Kind          | Variants                                        | Scope                      |
//! |---------------|-------------------------------------------------|----------------------------|
//! | `Transport`   | `ConnectionLost`, `Io`, `ExchangeTimeout`       | lost/io cascade; timeout fails the call |
//! | `Released`    | `AlreadyReleased`                               | local, no wire traffic     |
//! | `State`       | `InvalidState`, `InvalidPriority`               | local, synchronous         |
//! | `Negotiation` | `NoCompatibleVersion`, `MalformedCapabilities`, `NegotiationRejected`, `OptimizedTxNotNegotiated` | handshake only |
//! | `Framing`     | `Framing`, `UnknownField`, `Json`               | owning conversation        |
//! | `Internal`    | `Internal`                                      | peer could not serve a required request |
//! | `Usage`       | `Usage`, `Config`                               | caller bug / bad config    |

use std::time::Duration;

use thiserror::Error;

/// JFAP errors.
#[derive(Error, Debug)]
pub enum JfapError {
    /// No protocol version is supported by both sides.
    #[error("No compatible FAP version: {0}")]
    NoCompatibleVersion(String),

    /// Capability word received with reserved bits set.
    #[error("Malformed capabilities: 0x{0:04x} has reserved bits set")]
    MalformedCapabilities(u16),

    /// The acceptor refused the handshake.
    #[error("Handshake rejected by peer: {0}")]
    NegotiationRejected(String),

    /// Frame, chunk or handshake record could not be decoded.
    #[error("Framing error: {0}")]
    Framing(String),

    /// Handshake record carried a field id this protocol does not define.
    #[error("Unknown handshake field id 0x{0:04x}")]
    UnknownField(u16),

    /// Priority outside the range callers may use.
    #[error("Invalid priority {0}: callers may use 0-14")]
    InvalidPriority(u8),

    /// Operation not valid in the current state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Operation attempted on a closed or failed conversation/connection.
    #[error("Connection or conversation already released")]
    AlreadyReleased,

    /// The physical transport was lost (including heartbeat timeout).
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// No correlated reply arrived in time.
    #[error("Exchange timed out after {0:?}")]
    ExchangeTimeout(Duration),

    /// Accessor used on the wrong variant, or similar API misuse.
    #[error("Usage error: {0}")]
    Usage(String),

    /// Optimized transaction flags requested without the negotiated capability.
    #[error("Optimized transactions were not negotiated on this connection")]
    OptimizedTxNotNegotiated,

    /// The peer failed while serving a request it was required to answer.
    #[error("Internal error: {0}")]
    Internal(String),

    /// Configuration error.
    #[error("Config error: {0}")]
    Config(String),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for JFAP operations
pub type Result<T> = std::result::Result<T, JfapError>;

/// Coarse classification of [`JfapError`] variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Physical transport failure.
    Transport,
    /// Operation after close/failure.
    Released,
    /// Invalid operational state.
    State,
    /// Version or capability negotiation failure.
    Negotiation,
    /// Malformed frame or record.
    Framing,
    /// Catastrophic failure on the peer.
    Internal,
    /// API misuse or bad configuration.
    Usage,
}

impl JfapError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ConnectionLost(_) | Self::ExchangeTimeout(_) | Self::Io(_) => {
                ErrorKind::Transport
            },
            Self::AlreadyReleased => ErrorKind::Released,
            Self::InvalidState(_) | Self::InvalidPriority(_) => ErrorKind::State,
            Self::NoCompatibleVersion(_)
            | Self::MalformedCapabilities(_)
            | Self::NegotiationRejected(_)
            | Self::OptimizedTxNotNegotiated => ErrorKind::Negotiation,
            Self::Framing(_) | Self::UnknownField(_) | Self::Json(_) => ErrorKind::Framing,
            Self::Internal(_) => ErrorKind::Internal,
            Self::Usage(_) | Self::Config(_) => ErrorKind::Usage,
        }
    }

    /// Whether this error takes down every conversation on the connection.
    ///
    /// An exchange timeout only fails the waiting call; the heartbeat, not
    /// the exchange, decides whether the transport is dead.
    pub fn is_fatal_to_connection(&self) -> bool {
        matches!(self, Self::ConnectionLost(_) | Self::Io(_))
    }

    /// Build the error delivered to waiters and callbacks when a connection dies.
    pub(crate) fn lost(reason: impl std::fmt::Display) -> Self {
        Self::ConnectionLost(reason.to_string())
    }

    /// Copy of this error for the next owner in a failure cascade.
    ///
    /// Source errors that cannot be cloned keep their kind and message.
    pub(crate) fn duplicate(&self) -> Self {
        match self {
            Self::NoCompatibleVersion(s) => Self::NoCompatibleVersion(s.clone()),
            Self::MalformedCapabilities(b) => Self::MalformedCapabilities(*b),
            Self::NegotiationRejected(s) => Self::NegotiationRejected(s.clone()),
            Self::Framing(s) => Self::Framing(s.clone()),
            Self::UnknownField(id) => Self::UnknownField(*id),
            Self::InvalidPriority(p) => Self::InvalidPriority(*p),
            Self::InvalidState(s) => Self::InvalidState(s.clone()),
            Self::AlreadyReleased => Self::AlreadyReleased,
            Self::ConnectionLost(s) => Self::ConnectionLost(s.clone()),
            Self::ExchangeTimeout(d) => Self::ExchangeTimeout(*d),
            Self::Usage(s) => Self::Usage(s.clone()),
            Self::OptimizedTxNotNegotiated => Self::OptimizedTxNotNegotiated,
            Self::Internal(s) => Self::Internal(s.clone()),
            Self::Config(s) => Self::Config(s.clone()),
            Self::Json(e) => Self::Framing(e.to_string()),
            Self::Io(e) => Self::Io(std::io::Error::new(e.kind(), e.to_string())),
        }
    }
}

impl From<toml::de::Error> for JfapError {
    fn from(err: toml::de::Error) -> Self {
        JfapError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_errors_are_fatal() {
        assert!(JfapError::lost("peer went away").is_fatal_to_connection());
        assert!(!JfapError::ExchangeTimeout(Duration::from_secs(1)).is_fatal_to_connection());
        assert!(!JfapError::AlreadyReleased.is_fatal_to_connection());
        assert!(!JfapError::Framing("chunk".into()).is_fatal_to_connection());
    }

    #[test]
    fn test_kind_classification() {
        assert_eq!(JfapError::UnknownField(0x99).kind(), ErrorKind::Framing);
        assert_eq!(
            JfapError::MalformedCapabilities(0x8000).kind(),
            ErrorKind::Negotiation
        );
        assert_eq!(JfapError::Internal("boom".into()).kind(), ErrorKind::Internal);
        assert_eq!(JfapError::InvalidPriority(15).kind(), ErrorKind::State);
    }

    #[test]
    fn test_duplicate_keeps_kind() {
        let io = JfapError::Io(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            "pipe closed",
        ));
        let copy = io.duplicate();
        assert!(copy.is_fatal_to_connection());
        assert_eq!(copy.kind(), ErrorKind::Transport);
        assert!(copy.to_string().contains("pipe closed"));

        assert!(matches!(
            JfapError::MalformedCapabilities(0x0200).duplicate(),
            JfapError::MalformedCapabilities(0x0200)
        ));
    }

    #[test]
    fn test_display_messages() {
        assert_eq!(
            JfapError::MalformedCapabilities(0x0080).to_string(),
            "Malformed capabilities: 0x0080 has reserved bits set"
        );
        assert_eq!(
            JfapError::UnknownField(0x0042).to_string(),
            "Unknown handshake field id 0x0042"
        );
    }
}
