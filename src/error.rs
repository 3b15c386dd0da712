//! Error types for the message ring.
//!
//! One variant per failure family from the ring's error taxonomy, each with
//! a constructor helper and a `category()` used for metrics labeling.

/// Result type alias for ring operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors a [`crate::MessageRing`] can report.
///
/// Every variant other than [`Error::BufferTooSmall`] leaves the ring
/// broken: the caller must destroy it and is free to fall back to plain TCP.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// TCP read/write error, short stream EOF, or malformed record during
    /// the handshake.
    #[error("handshake failed: {message}")]
    HandshakeFailed {
        /// Descriptive error message.
        message: String,
    },

    /// I/O error underlying a `HandshakeFailed`.
    #[error("I/O error: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// A verbs call failed during queue-pair creation or state transition.
    #[error("RDMA setup failed: {message}")]
    RdmaSetupFailed {
        /// Descriptive error message.
        message: String,
    },

    /// The provider rejected a posted send work request.
    #[error("post_send failed: {message}")]
    PostSendFailed {
        /// Descriptive error message.
        message: String,
    },

    /// An error completion was observed, or the queue pair transitioned out
    /// of ready-to-send.
    #[error("connection lost: {message}")]
    ConnectionLost {
        /// Descriptive error message.
        message: String,
    },

    /// The caller's receive buffer is smaller than the next message's
    /// length. Retryable: the message remains unread.
    #[error("buffer too small: need {needed} bytes, have {available}")]
    BufferTooSmall {
        /// Bytes required to hold the next message.
        needed: usize,
        /// Bytes the caller provided.
        available: usize,
    },

    /// Invalid framing: an impossible length, or a torn footer that did not
    /// clear within the configured timeout.
    #[error("protocol error: {message}")]
    ProtocolError {
        /// Descriptive error message.
        message: String,
    },

    /// Ring configuration failed validation.
    #[error("configuration error: {message}")]
    Config {
        /// Descriptive error message.
        message: String,
    },
}

impl Error {
    /// Build a [`Error::HandshakeFailed`].
    pub fn handshake<S: Into<String>>(message: S) -> Self {
        Self::HandshakeFailed {
            message: message.into(),
        }
    }

    /// Build a [`Error::RdmaSetupFailed`].
    pub fn rdma_setup<S: Into<String>>(message: S) -> Self {
        Self::RdmaSetupFailed {
            message: message.into(),
        }
    }

    /// Build a [`Error::PostSendFailed`].
    pub fn post_send<S: Into<String>>(message: S) -> Self {
        Self::PostSendFailed {
            message: message.into(),
        }
    }

    /// Build a [`Error::ConnectionLost`].
    pub fn connection_lost<S: Into<String>>(message: S) -> Self {
        Self::ConnectionLost {
            message: message.into(),
        }
    }

    /// Build a [`Error::BufferTooSmall`].
    pub fn buffer_too_small(needed: usize, available: usize) -> Self {
        Self::BufferTooSmall { needed, available }
    }

    /// Build a [`Error::ProtocolError`].
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::ProtocolError {
            message: message.into(),
        }
    }

    /// Build a [`Error::Config`].
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Whether this error leaves the ring usable. Only [`Error::BufferTooSmall`]
    /// does; every other variant means the ring must be destroyed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::BufferTooSmall { .. })
    }

    /// Category label for metrics and logging.
    pub fn category(&self) -> &'static str {
        match self {
            Self::HandshakeFailed { .. } => "handshake_failed",
            Self::Io { .. } => "io",
            Self::RdmaSetupFailed { .. } => "rdma_setup_failed",
            Self::PostSendFailed { .. } => "post_send_failed",
            Self::ConnectionLost { .. } => "connection_lost",
            Self::BufferTooSmall { .. } => "buffer_too_small",
            Self::ProtocolError { .. } => "protocol_error",
            Self::Config { .. } => "config",
        }
    }
}
