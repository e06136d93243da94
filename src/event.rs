//! Lifecycle notifications emitted by the engines.
//!
//! Engines hand out a receiver once via their `events()` method and push
//! notifications from wherever the work happens. Delivery order within one
//! connection matches the order bytes arrived; across connections nothing is
//! guaranteed. A caller that drops the receiver opts out of observing: the
//! engine keeps running and the notifications are discarded.

use std::net::SocketAddr;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::NetError;

/// Notifications from a [`Server`](crate::server::Server).
#[derive(Debug)]
pub enum ServerEvent {
    /// The socket is bound and accepting (or receiving datagrams).
    Listening { local: SocketAddr },
    /// A TCP client connected.
    Connection { peer: SocketAddr },
    /// A UDP datagram arrived. Connectionless sockets have no per-client
    /// handle, so the payload and its sender ride on the event itself.
    Message { peer: SocketAddr, payload: Bytes },
    /// A connection-scoped failure. Never tears down the listening socket.
    ClientError {
        peer: Option<SocketAddr>,
        error: NetError,
    },
    /// A connection sat idle past the configured window and was closed.
    ClientTimeout { peer: SocketAddr },
    /// An engine-level failure, e.g. the tee file could not be opened.
    Error(NetError),
    /// Terminal: the listening socket is closed. Emitted exactly once.
    Close,
}

/// Notifications from a [`Client`](crate::client::Client).
#[derive(Debug)]
pub enum ClientEvent {
    /// Connected (TCP) or bound and ready to send (UDP).
    Connected { peer: SocketAddr },
    /// A chunk of received data, in arrival order.
    Data(Bytes),
    /// The peer closed its end of the stream.
    End,
    /// The idle window elapsed; the engine force-closes the connection.
    Timeout,
    /// A transport-level failure, re-emitted at engine level.
    Error(NetError),
    /// Terminal: the connection is gone. Emitted exactly once.
    Close,
}

/// Sending half shared by an engine's spawned tasks.
#[derive(Debug)]
pub(crate) struct EventSender<E> {
    tx: mpsc::UnboundedSender<E>,
}

impl<E> Clone for EventSender<E> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<E> EventSender<E> {
    /// Pushes a notification, dropping it if nobody is listening.
    pub fn emit(&self, event: E) {
        let _ = self.tx.send(event);
    }
}

/// Builds the notification channel for one engine instance.
pub(crate) fn channel<E>() -> (EventSender<E>, mpsc::UnboundedReceiver<E>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSender { tx }, rx)
}
