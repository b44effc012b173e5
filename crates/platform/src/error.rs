//! Error types for Kestrel

use thiserror::Error;

/// Unified error type for all Kestrel operations.
///
/// Variants are grouped by scope: transport-fatal errors
/// ([`Protocol`](KestrelError::Protocol), [`Integrity`](KestrelError::Integrity),
/// [`Negotiation`](KestrelError::Negotiation),
/// [`HostKeyRejected`](KestrelError::HostKeyRejected)) terminate the
/// connection, while channel and SFTP errors only fail the operation that
/// raised them.
#[derive(Debug, Error)]
pub enum KestrelError {
    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed frame, unexpected message or bad state
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// MAC or AEAD tag verification failed
    #[error("Integrity check failed: {0}")]
    Integrity(String),

    /// No mutually supported algorithm in a mandatory category
    #[error("Algorithm negotiation failed: {0}")]
    Negotiation(String),

    /// Host key signature invalid or rejected by the trust callback
    #[error("Host key rejected: {0}")]
    HostKeyRejected(String),

    /// Cryptographic failure that is not an integrity failure (key setup, RNG)
    #[error("Security error: {0}")]
    Security(String),

    /// User authentication failed
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Peer refused a channel open
    #[error("Channel open failed (reason {reason}): {description}")]
    ChannelOpenFailure {
        /// RFC 4254 reason code
        reason: u32,
        /// Human-readable description sent by the peer
        description: String,
    },

    /// Channel was closed while an operation was pending
    #[error("Channel closed")]
    ChannelClosed,

    /// Connection was closed while an operation was pending
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    /// SFTP status returned by the server
    #[error("SFTP status {code}: {message}")]
    Sftp {
        /// SSH_FX_* status code
        code: u32,
        /// Status message
        message: String,
    },

    /// Other error
    #[error("Error: {0}")]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl KestrelError {
    /// Returns `true` if this error must terminate the connection.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            KestrelError::Protocol(_)
                | KestrelError::Integrity(_)
                | KestrelError::Negotiation(_)
                | KestrelError::HostKeyRejected(_)
                | KestrelError::Io(_)
        )
    }

    /// Returns `true` for cancellation errors (channel or connection closed).
    pub fn is_closed(&self) -> bool {
        matches!(
            self,
            KestrelError::ChannelClosed | KestrelError::ConnectionClosed(_)
        )
    }
}

/// Result type for Kestrel operations
pub type KestrelResult<T> = Result<T, KestrelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = KestrelError::Config("Invalid configuration".to_string());
        assert_eq!(
            err.to_string(),
            "Configuration error: Invalid configuration"
        );

        let err = KestrelError::ChannelOpenFailure {
            reason: 1,
            description: "prohibited".to_string(),
        };
        assert_eq!(err.to_string(), "Channel open failed (reason 1): prohibited");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: KestrelError = io_err.into();
        assert!(matches!(err, KestrelError::Io(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_fatal_classification() {
        assert!(KestrelError::Integrity("mac".into()).is_fatal());
        assert!(KestrelError::Negotiation("kex".into()).is_fatal());
        assert!(!KestrelError::ChannelClosed.is_fatal());
        assert!(!KestrelError::Sftp {
            code: 2,
            message: "no such file".into()
        }
        .is_fatal());
        assert!(KestrelError::ConnectionClosed("eof".into()).is_closed());
    }
}
