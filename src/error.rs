//! Error kinds shared by every engine in the crate.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

/// Classified failures for socket operations.
///
/// The variant tells the caller how far the damage reaches: a [`NetError::Bind`]
/// is fatal to the server instance that tried to listen, a [`NetError::Connect`]
/// kills a single outbound attempt, and the stream variants are scoped to one
/// live connection. None of them are ever fatal to sibling connections, and the
/// library never terminates the process on any of them.
#[derive(Debug, Error)]
pub enum NetError {
    /// Binding the listening or datagram socket failed (address in use,
    /// permission denied, invalid address).
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// An outbound connection attempt failed (refused, unreachable, or the
    /// configured connect window elapsed).
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// Writing to a peer failed mid-stream.
    #[error("send failed: {0}")]
    Send(#[source] io::Error),

    /// Reading from a peer failed mid-stream.
    #[error("stream error: {0}")]
    Stream(#[source] io::Error),

    /// The idle window elapsed with no activity on the connection. Not a
    /// harder failure than a clean disconnect; the owning engine force-closes
    /// the handle.
    #[error("connection idle for longer than the configured timeout")]
    IdleTimeout,

    /// The tee file could not be opened or written. Engine-level, never
    /// fatal to the listening socket.
    #[error("out-file {}: {}", .path.display(), .source)]
    File {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The target host did not resolve to any address.
    #[error("could not resolve host {0:?}")]
    Resolve(String),
}

impl NetError {
    /// Whether this error ends the engine that observed it, as opposed to a
    /// single connection or attempt.
    #[must_use]
    pub fn is_fatal_to_engine(&self) -> bool {
        matches!(self, NetError::Bind { .. } | NetError::Resolve(_))
    }
}

#[cfg(test)]
mod tests {
    use super::NetError;
    use std::io;

    #[test]
    fn bind_is_engine_fatal() {
        let err = NetError::Bind {
            addr: "127.0.0.1:1".parse().unwrap(),
            source: io::Error::from(io::ErrorKind::AddrInUse),
        };
        assert!(err.is_fatal_to_engine());
    }

    #[test]
    fn connection_scoped_errors_are_not_engine_fatal() {
        let errs = [
            NetError::Connect {
                addr: "127.0.0.1:1".parse().unwrap(),
                source: io::Error::from(io::ErrorKind::ConnectionRefused),
            },
            NetError::Send(io::Error::from(io::ErrorKind::BrokenPipe)),
            NetError::Stream(io::Error::from(io::ErrorKind::ConnectionReset)),
            NetError::IdleTimeout,
        ];
        for err in errs {
            assert!(!err.is_fatal_to_engine(), "{err}");
        }
    }
}
