use std::io;
use std::net::SocketAddr;
use thiserror::Error;

use crate::socket::ProtocolFamily;

/// Result type for UDP transport operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for UDP transport operations
#[derive(Error, Debug)]
pub enum Error {
    /// Failed to bind a listening socket. Fatal at startup: no partial
    /// listener set is left running.
    #[error("Failed to bind to {0}: {1}")]
    BindFailed(SocketAddr, io::Error),

    /// Failed to send to the specified destination
    #[error("Failed to send to {0}: {1}")]
    SendFailed(SocketAddr, io::Error),

    /// Requested protocol family does not match the socket's bound family
    #[error("Protocol mismatch: requested {requested}, socket is {bound}")]
    ProtocolMismatch {
        requested: ProtocolFamily,
        bound: ProtocolFamily,
    },

    /// Destination address could not be parsed
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// No usable socket for the requested family and destination
    #[error("No socket available")]
    NoSocket,

    /// Failed to get local address
    #[error("Failed to get local address: {0}")]
    LocalAddrFailed(io::Error),

    /// Query timed out
    #[error("Timeout")]
    Timeout,

    /// Manager command channel closed
    #[error("Channel closed")]
    ChannelClosed,

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
}

impl Error {
    /// Returns true for errors that abort manager startup rather than a
    /// single operation.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::BindFailed(..))
    }

    /// Returns true if the error is a query timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout)
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Error::ChannelClosed
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for Error {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        Error::ChannelClosed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categorization() {
        let addr: SocketAddr = "127.0.0.1:5060".parse().unwrap();
        let bind_err = Error::BindFailed(addr, io::Error::new(io::ErrorKind::AddrInUse, "in use"));
        assert!(bind_err.is_fatal());
        assert!(!bind_err.is_timeout());

        let timeout_err = Error::Timeout;
        assert!(timeout_err.is_timeout());
        assert!(!timeout_err.is_fatal());

        let mismatch = Error::ProtocolMismatch {
            requested: ProtocolFamily::V6,
            bound: ProtocolFamily::V4,
        };
        assert!(!mismatch.is_fatal());
    }

    #[test]
    fn test_error_display() {
        let mismatch = Error::ProtocolMismatch {
            requested: ProtocolFamily::V6,
            bound: ProtocolFamily::V4,
        };
        assert_eq!(
            mismatch.to_string(),
            "Protocol mismatch: requested UDPv6, socket is UDPv4"
        );
        assert_eq!(Error::NoSocket.to_string(), "No socket available");
    }
}
