//! Error types for the transport.

use std::io;

use thiserror::Error;

/// Main error type for all transport operations.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The peer violated the wire protocol (e.g. a frame length above the
    /// configured cap). The connection is closed.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The peer closed the connection at a message boundary.
    #[error("connection closed by peer")]
    PeerClosed,

    /// A socket operation failed with a non-recoverable error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The TCP connection to the server could not be established.
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// A previous fatal error made the session permanently unusable.
    #[error("session is no longer usable: {0}")]
    SessionPoisoned(String),

    /// The RPC was cancelled by the caller before completion.
    #[error("RPC cancelled")]
    Canceled,

    /// A service locator could not be parsed or is missing options.
    #[error("bad service locator: {0}")]
    BadLocator(String),

    /// `server_recv` was called with no listening transport configured.
    #[error("no listening transport configured")]
    NoListeningTransport,
}

// A single connection failure is delivered to every RPC waiting on that
// connection, so the error must be duplicable. `io::Error` does not
// implement `Clone`; rebuild it from its kind and rendered message.
impl Clone for TransportError {
    fn clone(&self) -> Self {
        match self {
            TransportError::Protocol(msg) => TransportError::Protocol(msg.clone()),
            TransportError::PeerClosed => TransportError::PeerClosed,
            TransportError::Io(e) => TransportError::Io(io::Error::new(e.kind(), e.to_string())),
            TransportError::Connect { addr, source } => TransportError::Connect {
                addr: addr.clone(),
                source: io::Error::new(source.kind(), source.to_string()),
            },
            TransportError::SessionPoisoned(msg) => TransportError::SessionPoisoned(msg.clone()),
            TransportError::Canceled => TransportError::Canceled,
            TransportError::BadLocator(msg) => TransportError::BadLocator(msg.clone()),
            TransportError::NoListeningTransport => TransportError::NoListeningTransport,
        }
    }
}

/// Result type alias using TransportError.
pub type Result<T> = std::result::Result<T, TransportError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clone_preserves_io_kind() {
        let err = TransportError::Io(io::Error::new(io::ErrorKind::BrokenPipe, "pipe gone"));
        let copy = err.clone();
        match copy {
            TransportError::Io(e) => {
                assert_eq!(e.kind(), io::ErrorKind::BrokenPipe);
                assert!(e.to_string().contains("pipe gone"));
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn test_display_messages() {
        let err = TransportError::Protocol("len 9000000 exceeds cap".into());
        assert!(err.to_string().contains("protocol violation"));
        assert_eq!(
            TransportError::PeerClosed.to_string(),
            "connection closed by peer"
        );
    }
}
