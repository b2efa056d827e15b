//! Error types for the TCP engine.
//!
//! Every variant carries a stable numeric [`code`](NetworkError::code) in the
//! negative net-error numbering used by the protocol peers this engine talks
//! to, so that reasons can be logged, compared and shown to users uniformly.

use std::fmt;
use std::io;

use tether_core::IoThreadError;

use crate::tcp::ConnectionId;

/// Numeric net-error codes.
pub mod codes {
    pub const OK: i32 = 0;
    pub const FAILED: i32 = -2;
    pub const ABORTED: i32 = -3;
    pub const INVALID_ARGUMENT: i32 = -4;
    pub const TIMED_OUT: i32 = -7;
    pub const UNEXPECTED: i32 = -9;
    pub const INSUFFICIENT_RESOURCES: i32 = -12;
    pub const FILE_NO_SPACE: i32 = -18;
    pub const CONNECTION_CLOSED: i32 = -100;
    pub const CONNECTION_RESET: i32 = -101;
    pub const CONNECTION_REFUSED: i32 = -102;
    pub const CONNECTION_ABORTED: i32 = -103;
    pub const NAME_NOT_RESOLVED: i32 = -105;
    pub const SSL_PROTOCOL_ERROR: i32 = -107;
    pub const ADDRESS_INVALID: i32 = -108;
    pub const ADDRESS_IN_USE: i32 = -147;
}

/// Errors produced by connections, listeners and session managers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    /// The peer closed the stream (EOF).
    ConnectionClosed,
    /// The peer reset the stream.
    ConnectionReset,
    /// Nothing was listening at the target.
    ConnectionRefused,
    /// The local stack aborted the connection.
    ConnectionAborted,
    /// A keepalive or transaction deadline passed.
    Timeout,
    /// DNS resolution failed.
    NameNotResolved(String),
    /// TLS handshake or record-layer failure.
    Tls(String),
    /// The configured address could not be parsed or used.
    AddressInvalid(String),
    /// The bind address is taken.
    AddressInUse(String),
    /// The read buffer reached its maximum size without the delegate consuming.
    ReadBufferExhausted {
        /// The buffer's maximum size.
        max: usize,
    },
    /// Queuing the payload would exceed the write buffer's maximum size.
    WriteBufferFull {
        /// Bytes the caller tried to queue.
        requested: usize,
        /// Bytes already queued.
        pending: usize,
        /// The buffer's maximum size.
        max: usize,
    },
    /// The operation was abandoned because its connection was closed.
    Cancelled,
    /// A caller-supplied argument was rejected.
    InvalidArgument(String),
    /// Other transport I/O failure.
    Io(String),
    /// Generic failure.
    Failed(String),
    /// `start` was called on a running session.
    AlreadyStarted,
    /// The session has not been started.
    NotStarted,
    /// An I/O-thread-only call was made elsewhere, or a foreign-thread-only
    /// call was made on the I/O thread.
    WrongThread,
    /// An empty payload was passed to a send call.
    EmptyPayload,
    /// A connection id was registered twice.
    DuplicateConnection(ConnectionId),
    /// A read layer is already bound on this connection.
    ReadLayerBusy,
    /// The delegate reported consuming more bytes than it was given.
    InvalidConsume {
        /// Bytes the delegate claimed.
        consumed: usize,
        /// Bytes it was handed.
        available: usize,
    },
    /// The I/O thread could not be created or reached.
    Runtime(String),
}

impl NetworkError {
    /// The numeric net-error code for this error.
    pub fn code(&self) -> i32 {
        match self {
            Self::ConnectionClosed => codes::CONNECTION_CLOSED,
            Self::ConnectionReset => codes::CONNECTION_RESET,
            Self::ConnectionRefused => codes::CONNECTION_REFUSED,
            Self::ConnectionAborted => codes::CONNECTION_ABORTED,
            Self::Timeout => codes::TIMED_OUT,
            Self::NameNotResolved(_) => codes::NAME_NOT_RESOLVED,
            Self::Tls(_) => codes::SSL_PROTOCOL_ERROR,
            Self::AddressInvalid(_) => codes::ADDRESS_INVALID,
            Self::AddressInUse(_) => codes::ADDRESS_IN_USE,
            Self::ReadBufferExhausted { .. } => codes::FILE_NO_SPACE,
            Self::WriteBufferFull { .. } => codes::INSUFFICIENT_RESOURCES,
            Self::Cancelled => codes::ABORTED,
            Self::InvalidArgument(_) | Self::EmptyPayload => codes::INVALID_ARGUMENT,
            Self::Io(_) | Self::Failed(_) | Self::Runtime(_) => codes::FAILED,
            Self::AlreadyStarted
            | Self::NotStarted
            | Self::WrongThread
            | Self::DuplicateConnection(_)
            | Self::ReadLayerBusy
            | Self::InvalidConsume { .. } => codes::UNEXPECTED,
        }
    }

    /// The user-visible failure line for a transaction, keyed by code.
    pub fn user_message(&self) -> String {
        format!("[{}] Error", self.code())
    }

    /// Whether this error reports caller misuse rather than a network event.
    pub fn is_programming_error(&self) -> bool {
        matches!(
            self,
            Self::AlreadyStarted
                | Self::NotStarted
                | Self::WrongThread
                | Self::EmptyPayload
                | Self::DuplicateConnection(_)
                | Self::ReadLayerBusy
                | Self::InvalidConsume { .. }
        )
    }
}

impl fmt::Display for NetworkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionClosed => write!(f, "Connection closed by peer"),
            Self::ConnectionReset => write!(f, "Connection reset"),
            Self::ConnectionRefused => write!(f, "Connection refused"),
            Self::ConnectionAborted => write!(f, "Connection aborted"),
            Self::Timeout => write!(f, "Operation timed out"),
            Self::NameNotResolved(msg) => write!(f, "Name not resolved: {msg}"),
            Self::Tls(msg) => write!(f, "TLS error: {msg}"),
            Self::AddressInvalid(msg) => write!(f, "Invalid address: {msg}"),
            Self::AddressInUse(msg) => write!(f, "Address in use: {msg}"),
            Self::ReadBufferExhausted { max } => {
                write!(f, "Read buffer exhausted at {max} bytes")
            }
            Self::WriteBufferFull {
                requested,
                pending,
                max,
            } => write!(
                f,
                "Write buffer full: {requested} bytes requested with {pending} of {max} queued"
            ),
            Self::Cancelled => write!(f, "Operation cancelled"),
            Self::InvalidArgument(msg) => write!(f, "Invalid argument: {msg}"),
            Self::Io(msg) => write!(f, "I/O error: {msg}"),
            Self::Failed(msg) => write!(f, "Failed: {msg}"),
            Self::AlreadyStarted => write!(f, "Session is already started"),
            Self::NotStarted => write!(f, "Session is not started"),
            Self::WrongThread => write!(f, "Called from the wrong thread"),
            Self::EmptyPayload => write!(f, "Payload is empty"),
            Self::DuplicateConnection(id) => write!(f, "Connection {id} is already registered"),
            Self::ReadLayerBusy => write!(f, "A read layer is already bound"),
            Self::InvalidConsume {
                consumed,
                available,
            } => write!(f, "Delegate consumed {consumed} of {available} bytes"),
            Self::Runtime(msg) => write!(f, "I/O thread error: {msg}"),
        }
    }
}

impl std::error::Error for NetworkError {}

impl From<io::Error> for NetworkError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof => Self::ConnectionClosed,
            io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe => Self::ConnectionReset,
            io::ErrorKind::ConnectionRefused => Self::ConnectionRefused,
            io::ErrorKind::ConnectionAborted => Self::ConnectionAborted,
            io::ErrorKind::TimedOut => Self::Timeout,
            io::ErrorKind::AddrInUse => Self::AddressInUse(err.to_string()),
            io::ErrorKind::AddrNotAvailable => Self::AddressInvalid(err.to_string()),
            io::ErrorKind::InvalidInput => Self::InvalidArgument(err.to_string()),
            _ => Self::Io(err.to_string()),
        }
    }
}

impl From<IoThreadError> for NetworkError {
    fn from(err: IoThreadError) -> Self {
        match err {
            IoThreadError::WouldDeadlock => Self::WrongThread,
            other => Self::Runtime(other.to_string()),
        }
    }
}

/// A specialized Result type for network operations.
pub type Result<T> = std::result::Result<T, NetworkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes() {
        assert_eq!(NetworkError::ConnectionClosed.code(), -100);
        assert_eq!(NetworkError::Timeout.code(), -7);
        assert_eq!(NetworkError::ReadBufferExhausted { max: 1 }.code(), -18);
        assert_eq!(NetworkError::Tls("bad".into()).code(), -107);
        assert_eq!(NetworkError::EmptyPayload.code(), codes::INVALID_ARGUMENT);
    }

    #[test]
    fn test_user_message() {
        assert_eq!(NetworkError::Timeout.user_message(), "[-7] Error");
        assert_eq!(NetworkError::ConnectionRefused.user_message(), "[-102] Error");
    }

    #[test]
    fn test_from_io_error() {
        let eof = io::Error::from(io::ErrorKind::UnexpectedEof);
        assert_eq!(NetworkError::from(eof), NetworkError::ConnectionClosed);

        let pipe = io::Error::from(io::ErrorKind::BrokenPipe);
        assert_eq!(NetworkError::from(pipe), NetworkError::ConnectionReset);

        let refused = io::Error::from(io::ErrorKind::ConnectionRefused);
        assert_eq!(NetworkError::from(refused).code(), codes::CONNECTION_REFUSED);

        let other = io::Error::other("boom");
        assert!(matches!(NetworkError::from(other), NetworkError::Io(_)));
    }

    #[test]
    fn test_from_io_thread_error() {
        assert_eq!(
            NetworkError::from(IoThreadError::WouldDeadlock),
            NetworkError::WrongThread
        );
        assert!(matches!(
            NetworkError::from(IoThreadError::Disconnected),
            NetworkError::Runtime(_)
        ));
    }

    #[test]
    fn test_programming_errors() {
        assert!(NetworkError::AlreadyStarted.is_programming_error());
        assert!(NetworkError::DuplicateConnection(ConnectionId::new(3)).is_programming_error());
        assert!(!NetworkError::ConnectionReset.is_programming_error());
    }

    #[test]
    fn test_display() {
        let err = NetworkError::WriteBufferFull {
            requested: 10,
            pending: 5,
            max: 12,
        };
        assert_eq!(
            err.to_string(),
            "Write buffer full: 10 bytes requested with 5 of 12 queued"
        );
    }
}
