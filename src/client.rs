//! The outbound engine: one connection (or bound datagram socket) toward a
//! remote endpoint, with local input streamed out and received data emitted
//! as events.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use log::debug;
use tokio::io::{AsyncRead, AsyncWriteExt, Stdout};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::error::NetError;
use crate::event::{channel, ClientEvent, EventSender};
use crate::transport::{self, Protocol, Recv, CHUNK_SIZE};

/// Largest payload a single UDP datagram can carry.
const MAX_DATAGRAM: usize = 65_507;

/// Read-only snapshot for one client instance.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Socket variant, fixed for the lifetime of the engine.
    pub protocol: Protocol,
    /// Remote host to connect to.
    pub address: String,
    /// Remote port to connect to.
    pub port: u16,
    /// Skip forwarding received data to stdout.
    pub disable_stdout: bool,
    /// Bounds the connection attempt and, for TCP, arms the idle window.
    pub timeout: Option<Duration>,
}

impl ClientConfig {
    /// A TCP client toward `127.0.0.1:port` with stdout forwarding on.
    #[must_use]
    pub fn new(port: u16) -> Self {
        Self {
            protocol: Protocol::Tcp,
            address: String::from("127.0.0.1"),
            port,
            disable_stdout: false,
            timeout: None,
        }
    }
}

/// Lifecycle of a [`Client`].
///
/// TCP runs `Created → Connecting → Connected → Closed`. UDP has no
/// handshake, so it runs `Created → Bound → Closed`, where "bound" means the
/// local ephemeral socket is ready to send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Constructed, nothing on the wire yet.
    Created,
    /// TCP connection attempt in flight.
    Connecting,
    /// TCP connection established.
    Connected,
    /// UDP local socket bound and ready to send.
    Bound,
    /// The connection is gone; terminal.
    Closed,
}

/// Which write handle the engine holds, per variant.
#[derive(Debug)]
enum Writer {
    Tcp(tokio::net::tcp::OwnedWriteHalf),
    Udp(Arc<UdpSocket>),
}

/// An outbound engine over one socket variant.
///
/// `start()` establishes the connection and spawns the receive loop;
/// `send()` writes toward the peer; `forward()` pipes any reader (the
/// command line hands it stdin) to the peer. Transport failures after
/// `start()` surface as [`ClientEvent::Error`]; the engine never
/// terminates the process, and a caller that drops the event receiver
/// simply stops observing.
#[derive(Debug)]
pub struct Client {
    config: ClientConfig,
    events: EventSender<ClientEvent>,
    events_rx: Option<mpsc::UnboundedReceiver<ClientEvent>>,
    state_tx: Arc<watch::Sender<ClientState>>,
    state_rx: watch::Receiver<ClientState>,
    cancel: CancellationToken,
    writer: Option<Writer>,
    peer: Option<SocketAddr>,
}

impl Client {
    /// Builds the engine around its read-only configuration snapshot.
    #[must_use]
    pub fn new(config: ClientConfig) -> Self {
        let (events, events_rx) = channel();
        let (state_tx, state_rx) = watch::channel(ClientState::Created);
        Self {
            config,
            events,
            events_rx: Some(events_rx),
            state_tx: Arc::new(state_tx),
            state_rx,
            cancel: CancellationToken::new(),
            writer: None,
            peer: None,
        }
    }

    /// Takes the notification receiver. Yields `None` after the first call.
    pub fn events(&mut self) -> Option<mpsc::UnboundedReceiver<ClientEvent>> {
        self.events_rx.take()
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ClientState {
        *self.state_rx.borrow()
    }

    /// The remote endpoint, once resolved.
    #[must_use]
    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Establishes the connection (TCP) or binds the local socket (UDP),
    /// emits [`ClientEvent::Connected`] and spawns the receive loop.
    ///
    /// The configured timeout bounds the TCP connection attempt; a failed
    /// attempt is fatal to this instance only and comes back as
    /// [`NetError::Connect`].
    pub async fn start(&mut self) -> Result<(), NetError> {
        if self.state() != ClientState::Created {
            debug!("start() called twice, ignoring");
            return Ok(());
        }

        let addr = transport::resolve(&self.config.address, self.config.port).await?;
        self.peer = Some(addr);
        self.state_tx.send_replace(ClientState::Connecting);

        match self.config.protocol {
            Protocol::Tcp => {
                let stream = match transport::connect(addr, self.config.timeout).await {
                    Ok(stream) => stream,
                    Err(err) => {
                        self.state_tx.send_replace(ClientState::Closed);
                        return Err(err);
                    }
                };
                let (rd, wr) = stream.into_split();
                self.writer = Some(Writer::Tcp(wr));
                self.state_tx.send_replace(ClientState::Connected);
                self.events.emit(ClientEvent::Connected { peer: addr });
                debug!("connected to {addr}");

                tokio::spawn(stream_loop(
                    rd,
                    self.config.clone(),
                    self.events.clone(),
                    Arc::clone(&self.state_tx),
                    self.cancel.clone(),
                ));
            }
            Protocol::Udp => {
                let socket = match transport::udp_ephemeral(addr).await {
                    Ok(socket) => Arc::new(socket),
                    Err(err) => {
                        self.state_tx.send_replace(ClientState::Closed);
                        return Err(err);
                    }
                };
                self.writer = Some(Writer::Udp(Arc::clone(&socket)));
                self.state_tx.send_replace(ClientState::Bound);
                self.events.emit(ClientEvent::Connected { peer: addr });
                debug!("datagram socket ready toward {addr}");

                tokio::spawn(datagram_recv_loop(
                    socket,
                    self.config.clone(),
                    self.events.clone(),
                    Arc::clone(&self.state_tx),
                    self.cancel.clone(),
                ));
            }
        }

        Ok(())
    }

    /// Writes toward the peer: a stream write over TCP, one datagram per
    /// call over UDP.
    pub async fn send(&mut self, bytes: &[u8]) -> Result<(), NetError> {
        match self.writer.as_mut() {
            Some(Writer::Tcp(wr)) => wr.write_all(bytes).await.map_err(NetError::Send),
            Some(Writer::Udp(socket)) => {
                socket.send(bytes).await.map_err(NetError::Send)?;
                Ok(())
            }
            None => Err(NetError::Send(io::Error::new(
                io::ErrorKind::NotConnected,
                "client is not connected",
            ))),
        }
    }

    /// Streams `reader` to the peer until it ends or the engine stops:
    /// a continuous pipe over TCP, one datagram per chunk over UDP.
    pub async fn forward<R>(&mut self, mut reader: R) -> Result<(), NetError>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            match transport::recv_chunk(&mut reader, &mut buf, None).await? {
                Recv::Data(n) => self.send(&buf[..n]).await?,
                Recv::Closed => break,
                Recv::Idle => unreachable!("no idle window on local input"),
            }
        }
        Ok(())
    }

    /// Gracefully closes: finishes TCP writes with a shutdown, then cancels
    /// the receive loop. Idempotent; no duplicate terminal events.
    pub async fn stop(&mut self) {
        if let Some(writer) = self.writer.take() {
            if let Writer::Tcp(mut wr) = writer {
                let _ = wr.shutdown().await;
            }
        }
        self.cancel.cancel();
        self.state_tx.send_replace(ClientState::Closed);
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Receives stream chunks until the peer closes, the idle window fires, or
/// the engine stops. Emits the terminal `Close` exactly once, on exit.
async fn stream_loop(
    mut rd: OwnedReadHalf,
    config: ClientConfig,
    events: EventSender<ClientEvent>,
    state: Arc<watch::Sender<ClientState>>,
    cancel: CancellationToken,
) {
    let mut stdout = stdout_sink(&config);
    let mut buf = vec![0u8; CHUNK_SIZE];

    loop {
        let recv = tokio::select! {
            () = cancel.cancelled() => break,
            recv = transport::recv_chunk(&mut rd, &mut buf, config.timeout) => recv,
        };

        match recv {
            Ok(Recv::Data(n)) => {
                let chunk = Bytes::copy_from_slice(&buf[..n]);
                forward_stdout(&mut stdout, &chunk, &events).await;
                events.emit(ClientEvent::Data(chunk));
            }
            Ok(Recv::Closed) => {
                debug!("disconnected: connection closed by server");
                events.emit(ClientEvent::End);
                break;
            }
            Ok(Recv::Idle) => {
                debug!("idle window elapsed, force-closing");
                events.emit(ClientEvent::Timeout);
                break;
            }
            Err(error) => {
                events.emit(ClientEvent::Error(error));
                break;
            }
        }
    }

    drop(rd);
    state.send_replace(ClientState::Closed);
    events.emit(ClientEvent::Close);
}

/// Receives datagrams from the connected peer. UDP has no end-of-stream and
/// no idle policy; the loop runs until the engine stops.
async fn datagram_recv_loop(
    socket: Arc<UdpSocket>,
    config: ClientConfig,
    events: EventSender<ClientEvent>,
    state: Arc<watch::Sender<ClientState>>,
    cancel: CancellationToken,
) {
    let mut stdout = stdout_sink(&config);
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        let recv = tokio::select! {
            () = cancel.cancelled() => break,
            recv = socket.recv(&mut buf) => recv,
        };

        match recv {
            Ok(n) => {
                let chunk = Bytes::copy_from_slice(&buf[..n]);
                forward_stdout(&mut stdout, &chunk, &events).await;
                events.emit(ClientEvent::Data(chunk));
            }
            Err(e) => {
                events.emit(ClientEvent::Error(NetError::Stream(e)));
                break;
            }
        }
    }

    state.send_replace(ClientState::Closed);
    events.emit(ClientEvent::Close);
}

fn stdout_sink(config: &ClientConfig) -> Option<Stdout> {
    (!config.disable_stdout).then(tokio::io::stdout)
}

async fn forward_stdout(
    stdout: &mut Option<Stdout>,
    chunk: &Bytes,
    events: &EventSender<ClientEvent>,
) {
    if let Some(out) = stdout.as_mut() {
        let write = async {
            out.write_all(chunk).await?;
            out.flush().await
        };
        if let Err(e) = write.await {
            events.emit(ClientEvent::Error(NetError::Send(e)));
            *stdout = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connect_refused_reports_connect_error() {
        // Bind-then-drop to find a port nothing is listening on.
        let free_port = {
            let listener = transport::bind_tcp("127.0.0.1:0".parse().unwrap())
                .await
                .unwrap();
            listener.local_addr().unwrap().port()
        };

        let mut config = ClientConfig::new(free_port);
        config.timeout = Some(Duration::from_millis(500));
        config.disable_stdout = true;

        let mut client = Client::new(config);
        let err = client.start().await.unwrap_err();
        assert!(matches!(err, NetError::Connect { .. }));
        assert_eq!(client.state(), ClientState::Closed);
    }

    #[tokio::test]
    async fn send_before_start_is_an_error() {
        let mut client = Client::new(ClientConfig::new(9));
        let err = client.send(b"nope").await.unwrap_err();
        assert!(matches!(err, NetError::Send(_)));
    }

    #[tokio::test]
    async fn stop_before_start_is_safe() {
        let mut client = Client::new(ClientConfig::new(9));
        client.stop().await;
        client.stop().await;
        assert_eq!(client.state(), ClientState::Closed);
    }
}
