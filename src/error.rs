use std::io;
use std::time::Duration;

use thiserror::Error as ThisError;

use crate::connection::ConnectionState;
use crate::frame::{self, Frame};

#[derive(Debug, ThisError)]
pub enum Error {
    /// The byte stream could not be framed. The connection is unusable afterwards.
    #[error("protocol error; {0}")]
    Protocol(String),
    #[error("connection lost; {0}")]
    ConnectionLost(String),
    /// An error reply sent by the server, e.g. `WRONGTYPE Operation against a key holding the
    /// wrong kind of value`.
    #[error("{0}")]
    Server(String),
    #[error("connection is {state}, {command} can not be sent")]
    NotReady {
        state: ConnectionState,
        command: String,
    },
    #[error("pipeline is full, {0} requests are already in flight")]
    Backpressure(usize),
    #[error("transaction aborted")]
    TransactionAborted,
    #[error("command timed out after {0:?}")]
    Timeout(Duration),
    #[error("failed to connect to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: io::Error,
    },
    #[error("invalid configuration; {0}")]
    Config(String),
    #[error("unexpected reply {0}")]
    UnexpectedReply(Frame),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[cfg(feature = "tls")]
    #[error(transparent)]
    Tls(#[from] tokio_native_tls::native_tls::Error),
}

impl Error {
    /// Errors that terminate every outstanding request of a connection.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            Error::Protocol(_) | Error::ConnectionLost(_) | Error::Io(_)
        )
    }

    /// Errors worth retrying on a fresh connection.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ConnectionLost(_) | Error::Io(_) | Error::Timeout(_) | Error::Connect { .. }
        )
    }

    /// The leading error code of a server error, such as `ERR`, `WRONGTYPE` or `MOVED`.
    pub fn server_code(&self) -> Option<&str> {
        match self {
            Error::Server(msg) => msg.split_whitespace().next(),
            _ => None,
        }
    }

    /// The error handed to each request still outstanding when the connection fails with `self`.
    pub(crate) fn for_outstanding(&self) -> Error {
        match self {
            Error::Protocol(msg) => Error::Protocol(msg.clone()),
            Error::ConnectionLost(msg) => Error::ConnectionLost(msg.clone()),
            err => Error::ConnectionLost(err.to_string()),
        }
    }
}

impl From<frame::Error> for Error {
    fn from(err: frame::Error) -> Self {
        Error::Protocol(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_code() {
        let err = Error::Server("WRONGTYPE Operation against a key".to_string());
        assert_eq!(err.server_code(), Some("WRONGTYPE"));
        assert_eq!(Error::TransactionAborted.server_code(), None);
    }

    #[test]
    fn outstanding_requests_see_connection_errors() {
        let err = Error::Io(io::Error::new(io::ErrorKind::BrokenPipe, "broken pipe"));
        assert!(matches!(err.for_outstanding(), Error::ConnectionLost(ref m) if m == "broken pipe"));

        let err = Error::Protocol("invalid frame data type: 64".to_string());
        assert!(matches!(err.for_outstanding(), Error::Protocol(_)));
    }

    #[test]
    fn classification() {
        assert!(Error::ConnectionLost("eof".to_string()).is_connection_fatal());
        assert!(!Error::Server("ERR".to_string()).is_connection_fatal());
        assert!(Error::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(!Error::TransactionAborted.is_retryable());
    }
}
