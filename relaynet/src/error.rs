//! Error types.
//!
//! Two layers of errors exist in the socket core:
//! - [`Error`] is returned synchronously by fallible API calls
//!   (registration, binding a listener, building an engine),
//! - [`SocketError`] is the terminal condition delivered to a socket
//!   consumer through its `on_error` callback.

use std::io;
use std::os::fd::RawFd;

use thiserror::Error;

/// Terminal condition reported to a socket consumer.
///
/// Once a socket reports one of these it is dead: it is unregistered,
/// closed and must not be used for further reads or writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum SocketError {
    /// The remote end closed the connection.
    #[error("connection closed by peer")]
    Disconnected,

    /// An outbound connection did not complete before its deadline.
    #[error("connection timed out")]
    Timeout,

    /// The socket descriptor could not be created.
    #[error("could not create socket")]
    Socket,

    /// The outbound connection was refused or failed.
    #[error("connection refused")]
    Connect,

    /// The socket could not be bound to the requested local address.
    #[error("could not bind to local address")]
    Bind,

    /// Writing queued data failed, or the send queue limit was exceeded.
    #[error("write error")]
    Write,

    /// The process or the engine ran out of descriptors.
    #[error("no more file descriptors")]
    NoMoreFds,

    /// Any other failure.
    #[error("socket error")]
    Other,
}

impl SocketError {
    /// Classifies a failure of `socket(2)` or `accept(2)`.
    pub(crate) fn from_creation(err: &io::Error) -> Self {
        match err.raw_os_error() {
            Some(libc::EMFILE) | Some(libc::ENFILE) => SocketError::NoMoreFds,
            _ => SocketError::Socket,
        }
    }

    /// Classifies an error condition reported by the engine on a
    /// connected socket.
    pub(crate) fn from_errno(errno: i32) -> Self {
        match errno {
            libc::ECONNRESET | libc::EPIPE => SocketError::Disconnected,
            libc::ETIMEDOUT => SocketError::Timeout,
            libc::ECONNREFUSED => SocketError::Connect,
            _ => SocketError::Other,
        }
    }
}

/// Errors returned by the engine and socket constructors.
#[derive(Debug, Error)]
pub enum Error {
    /// The descriptor is already tracked by this engine.
    #[error("descriptor {0} is already registered")]
    AlreadyRegistered(RawFd),

    /// Registering another descriptor would eat into the reserved slot.
    #[error("descriptor limit reached ({limit} slots, one reserved)")]
    CapacityExceeded { limit: usize },

    /// The descriptor is not tracked by this engine.
    #[error("descriptor {0} is not registered")]
    NotRegistered(RawFd),

    /// Negative descriptors cannot be registered.
    #[error("invalid descriptor {0}")]
    InvalidDescriptor(RawFd),

    /// A socket system call failed while setting up a descriptor.
    #[error("{kind}: {source}")]
    Socket {
        kind: SocketError,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    pub(crate) fn socket(kind: SocketError, source: io::Error) -> Self {
        Error::Socket { kind, source }
    }
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_creation_errors_map_descriptor_exhaustion() {
        let err = io::Error::from_raw_os_error(libc::EMFILE);
        assert_eq!(SocketError::from_creation(&err), SocketError::NoMoreFds);

        let err = io::Error::from_raw_os_error(libc::EACCES);
        assert_eq!(SocketError::from_creation(&err), SocketError::Socket);
    }

    #[test]
    fn test_errno_classification() {
        assert_eq!(SocketError::from_errno(libc::ECONNRESET), SocketError::Disconnected);
        assert_eq!(SocketError::from_errno(libc::ECONNREFUSED), SocketError::Connect);
        assert_eq!(SocketError::from_errno(0), SocketError::Other);
    }

    #[test]
    fn test_socket_error_display_includes_kind() {
        let err = Error::socket(
            SocketError::Bind,
            io::Error::from_raw_os_error(libc::EADDRINUSE),
        );
        assert!(err.to_string().starts_with("could not bind to local address"));
    }
}
