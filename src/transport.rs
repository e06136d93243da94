//! Thin abstraction over the two socket variants the engines run on.
//!
//! A [`Protocol`] is chosen once when an engine is constructed and never
//! switched afterwards. Everything here returns [`NetError`] so callers can
//! tell a fatal bind failure apart from a single failed attempt.

use std::net::SocketAddr;
use std::time::Duration;

use clap::ValueEnum;
use log::debug;
use serde_derive::Deserialize;
use tokio::io::AsyncReadExt;
use tokio::net::{lookup_host, TcpListener, TcpStream, UdpSocket};
use tokio::time;

use crate::error::NetError;

/// Size of the read buffer used for one receive-stream chunk.
pub(crate) const CHUNK_SIZE: usize = 8 * 1024;

/// The socket variant an engine operates on.
///
/// `Tcp` is connection-oriented: listeners accept per-client streams and
/// clients hold one outbound stream. `Udp` is connectionless: every inbound
/// datagram carries its own sender address and there is no accept step.
#[derive(Deserialize, Debug, ValueEnum, Clone, Copy, Default, PartialEq, Eq)]
pub enum Protocol {
    /// Connection-oriented stream sockets.
    #[default]
    Tcp,
    /// Connectionless datagram sockets.
    Udp,
}

/// Resolves a host string to the first usable socket address.
///
/// Plain IP literals short-circuit; anything else goes through the system
/// resolver via `tokio::net::lookup_host`.
pub async fn resolve(host: &str, port: u16) -> Result<SocketAddr, NetError> {
    if let Ok(ip) = host.parse() {
        return Ok(SocketAddr::new(ip, port));
    }

    lookup_host((host, port))
        .await
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| NetError::Resolve(host.to_owned()))
}

/// Opens a TCP connection to `addr`, bounded by `limit` when one is set.
///
/// An elapsed window is reported as a [`NetError::Connect`] carrying
/// `io::ErrorKind::TimedOut`, the same shape as a refused or unreachable
/// target, so a scan probe can treat every failed attempt uniformly.
pub async fn connect(addr: SocketAddr, limit: Option<Duration>) -> Result<TcpStream, NetError> {
    let attempt = TcpStream::connect(addr);
    let result = match limit {
        Some(window) => match time::timeout(window, attempt).await {
            Ok(result) => result,
            Err(_) => Err(std::io::Error::from(std::io::ErrorKind::TimedOut)),
        },
        None => attempt.await,
    };

    result.map_err(|source| NetError::Connect { addr, source })
}

/// Binds a TCP listening socket.
pub async fn bind_tcp(addr: SocketAddr) -> Result<TcpListener, NetError> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| NetError::Bind { addr, source })?;
    debug!("listening socket bound on {addr}");
    Ok(listener)
}

/// Binds a UDP socket on `addr`.
pub async fn bind_udp(addr: SocketAddr) -> Result<UdpSocket, NetError> {
    let socket = UdpSocket::bind(addr)
        .await
        .map_err(|source| NetError::Bind { addr, source })?;
    debug!("datagram socket bound on {addr}");
    Ok(socket)
}

/// Binds an ephemeral UDP socket suited to talk to `remote` and connects it,
/// so plain `send`/`recv` exchange datagrams with that peer only.
///
/// The wildcard address family has to match the remote's.
pub async fn udp_ephemeral(remote: SocketAddr) -> Result<UdpSocket, NetError> {
    let local: SocketAddr = match remote {
        SocketAddr::V4(_) => "0.0.0.0:0".parse().unwrap(),
        SocketAddr::V6(_) => "[::]:0".parse().unwrap(),
    };

    let socket = bind_udp(local).await?;
    socket
        .connect(remote)
        .await
        .map_err(|source| NetError::Connect {
            addr: remote,
            source,
        })?;
    Ok(socket)
}

/// One observation of a connection's receive stream.
#[derive(Debug)]
pub enum Recv {
    /// `n` bytes landed at the front of the caller's buffer.
    Data(usize),
    /// The peer closed its end; the stream is finished.
    Closed,
    /// The idle window elapsed with no bytes. Only produced when a window
    /// was configured.
    Idle,
}

/// Reads the next chunk from `reader`, honoring an optional idle window.
///
/// This is the single suspension point of the receive stream: engines call
/// it in a loop until it yields [`Recv::Closed`], [`Recv::Idle`], or an
/// error. Chunks come back in the order the bytes arrived.
pub async fn recv_chunk<R>(
    reader: &mut R,
    buf: &mut [u8],
    idle: Option<Duration>,
) -> Result<Recv, NetError>
where
    R: AsyncReadExt + Unpin,
{
    let read = reader.read(buf);
    let result = match idle {
        Some(window) => match time::timeout(window, read).await {
            Ok(result) => result,
            Err(_) => return Ok(Recv::Idle),
        },
        None => read.await,
    };

    match result {
        Ok(0) => Ok(Recv::Closed),
        Ok(n) => Ok(Recv::Data(n)),
        Err(source) => Err(NetError::Stream(source)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn connect_refused_is_connect_error() {
        // Bind-then-drop to find a port nothing is listening on.
        let addr = {
            let listener = bind_tcp("127.0.0.1:0".parse().unwrap()).await.unwrap();
            listener.local_addr().unwrap()
        };

        let err = connect(addr, Some(Duration::from_millis(500)))
            .await
            .unwrap_err();
        assert!(matches!(err, NetError::Connect { .. }));
    }

    #[tokio::test]
    async fn recv_chunk_reports_idle() {
        let listener = bind_tcp("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (_held, mut stream) = tokio::join!(
            async { listener.accept().await.unwrap().0 },
            async { connect(addr, None).await.unwrap() },
        );

        let mut buf = [0u8; 16];
        let recv = recv_chunk(&mut stream, &mut buf, Some(Duration::from_millis(50)))
            .await
            .unwrap();
        assert!(matches!(recv, Recv::Idle));
    }

    #[tokio::test]
    async fn recv_chunk_sees_peer_close() {
        let listener = bind_tcp("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (accepted, mut stream) = tokio::join!(
            async { listener.accept().await.unwrap().0 },
            async { connect(addr, None).await.unwrap() },
        );
        drop(accepted);

        let mut buf = [0u8; 16];
        let recv = recv_chunk(&mut stream, &mut buf, None).await.unwrap();
        assert!(matches!(recv, Recv::Closed));
    }

    #[tokio::test]
    async fn resolve_ip_literal() {
        let addr = resolve("127.0.0.1", 9000).await.unwrap();
        assert_eq!(addr, "127.0.0.1:9000".parse().unwrap());
    }
}
