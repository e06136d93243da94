//! The listening engine: owns a bound socket and applies the configured
//! behaviors to everything it receives.
//!
//! Over TCP every accepted connection gets its own task running the behavior
//! chain (idle window, tee to file, echo, stdout). Over UDP there is no
//! per-client handle; each datagram triggers the same chain independently and
//! replies go to the sender address captured with that datagram.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use log::{debug, warn};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, Stdout};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::error::NetError;
use crate::event::{channel, EventSender, ServerEvent};
use crate::transport::{self, Protocol, Recv, CHUNK_SIZE};

/// Largest payload a single UDP datagram can carry.
const MAX_DATAGRAM: usize = 65_507;

/// Read-only behavior snapshot for one server instance. Consumed, never
/// mutated, by the engine.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket variant, fixed for the lifetime of the engine.
    pub protocol: Protocol,
    /// Address to bind.
    pub address: String,
    /// Port to bind.
    pub port: u16,
    /// Echo received data back to the sender, byte for byte.
    pub echo: bool,
    /// Append received data to this file, verbatim.
    pub out_file: Option<PathBuf>,
    /// Skip forwarding received data to stdout.
    pub disable_stdout: bool,
    /// Idle window per TCP connection; elapsing force-closes the connection.
    pub timeout: Option<Duration>,
}

impl ServerConfig {
    /// A TCP server on `127.0.0.1:port` with every behavior switched off.
    #[must_use]
    pub fn new(port: u16) -> Self {
        Self {
            protocol: Protocol::Tcp,
            address: String::from("127.0.0.1"),
            port,
            echo: false,
            out_file: None,
            disable_stdout: false,
            timeout: None,
        }
    }
}

/// Lifecycle of a [`Server`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Constructed, not yet bound.
    Created,
    /// Bind in progress.
    Starting,
    /// Bound and accepting connections or datagrams.
    Listening,
    /// The bound socket is closed.
    Stopped,
}

/// A listening engine over one socket variant.
///
/// `start()` binds the socket and spawns the accept/receive loop; `stop()` is
/// idempotent and safe to call at any point, including before `start()`.
/// Connection-scoped failures surface as [`ServerEvent::ClientError`] and
/// never tear down the listening socket; the engine itself never terminates
/// the process.
#[derive(Debug)]
pub struct Server {
    config: Arc<ServerConfig>,
    events: EventSender<ServerEvent>,
    events_rx: Option<mpsc::UnboundedReceiver<ServerEvent>>,
    state_tx: Arc<watch::Sender<ServerState>>,
    state_rx: watch::Receiver<ServerState>,
    cancel: CancellationToken,
    local_addr: Option<SocketAddr>,
}

impl Server {
    /// Builds the engine around its read-only configuration snapshot.
    #[must_use]
    pub fn new(config: ServerConfig) -> Self {
        let (events, events_rx) = channel();
        let (state_tx, state_rx) = watch::channel(ServerState::Created);
        Self {
            config: Arc::new(config),
            events,
            events_rx: Some(events_rx),
            state_tx: Arc::new(state_tx),
            state_rx,
            cancel: CancellationToken::new(),
            local_addr: None,
        }
    }

    /// Takes the notification receiver. Yields `None` after the first call;
    /// an engine without an observer simply drops its notifications.
    pub fn events(&mut self) -> Option<mpsc::UnboundedReceiver<ServerEvent>> {
        self.events_rx.take()
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ServerState {
        *self.state_rx.borrow()
    }

    /// The bound address, once listening. Useful with port 0.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Binds the socket and spawns the accept/receive loop.
    ///
    /// Returns once the socket is listening; a bind failure is fatal to this
    /// instance and comes back as [`NetError::Bind`].
    pub async fn start(&mut self) -> Result<(), NetError> {
        if self.state() != ServerState::Created {
            debug!("start() called twice, ignoring");
            return Ok(());
        }
        self.state_tx.send_replace(ServerState::Starting);

        let addr = transport::resolve(&self.config.address, self.config.port).await?;
        let config = Arc::clone(&self.config);
        let events = self.events.clone();
        let state = Arc::clone(&self.state_tx);
        let cancel = self.cancel.clone();

        match self.config.protocol {
            Protocol::Tcp => {
                let listener = match transport::bind_tcp(addr).await {
                    Ok(listener) => listener,
                    Err(err) => {
                        self.state_tx.send_replace(ServerState::Stopped);
                        return Err(err);
                    }
                };
                self.local_addr = listener.local_addr().ok();
                self.mark_listening();
                tokio::spawn(accept_loop(listener, config, events, state, cancel));
            }
            Protocol::Udp => {
                let socket = match transport::bind_udp(addr).await {
                    Ok(socket) => socket,
                    Err(err) => {
                        self.state_tx.send_replace(ServerState::Stopped);
                        return Err(err);
                    }
                };
                self.local_addr = socket.local_addr().ok();
                self.mark_listening();
                tokio::spawn(datagram_loop(socket, config, events, state, cancel));
            }
        }

        Ok(())
    }

    fn mark_listening(&self) {
        self.state_tx.send_replace(ServerState::Listening);
        if let Some(local) = self.local_addr {
            self.events.emit(ServerEvent::Listening { local });
        }
    }

    /// Closes the bound socket and cancels in-flight connection tasks.
    /// Idempotent; safe to call when not listening.
    pub fn stop(&self) {
        self.cancel.cancel();
        self.state_tx.send_replace(ServerState::Stopped);
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn accept_loop(
    listener: TcpListener,
    config: Arc<ServerConfig>,
    events: EventSender<ServerEvent>,
    state: Arc<watch::Sender<ServerState>>,
    cancel: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            () = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                debug!("client connected: {peer}");
                events.emit(ServerEvent::Connection { peer });
                tokio::spawn(serve_connection(
                    stream,
                    peer,
                    Arc::clone(&config),
                    events.clone(),
                    cancel.clone(),
                ));
            }
            Err(e) => {
                // Accept failures are transient; the listening socket stays up.
                warn!("accept failed: {e}");
                events.emit(ServerEvent::ClientError {
                    peer: None,
                    error: NetError::Stream(e),
                });
            }
        }
    }

    drop(listener);
    state.send_replace(ServerState::Stopped);
    events.emit(ServerEvent::Close);
    debug!("listening socket closed");
}

/// Runs the behavior chain for one accepted connection until the peer goes
/// away, the idle window fires, or the server stops.
async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    config: Arc<ServerConfig>,
    events: EventSender<ServerEvent>,
    cancel: CancellationToken,
) {
    let (mut rd, mut wr): (OwnedReadHalf, OwnedWriteHalf) = stream.into_split();
    let mut tee = open_tee(&config, &events).await;
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

                if let Some(file) = tee.as_mut() {
                    if let Err(e) = file.write_all(&chunk).await {
                        events.emit(ServerEvent::Error(tee_error(&config, e)));
                        tee = None;
                    }
                }

                if config.echo {
                    if let Err(e) = wr.write_all(&chunk).await {
                        events.emit(ServerEvent::ClientError {
                            peer: Some(peer),
                            error: NetError::Send(e),
                        });
                        break;
                    }
                }

                forward_stdout(&mut stdout, &chunk, &events).await;
            }
            Ok(Recv::Closed) => {
                debug!("client disconnected: {peer}");
                break;
            }
            Ok(Recv::Idle) => {
                warn!("client timeout: {peer}");
                events.emit(ServerEvent::ClientTimeout { peer });
                break;
            }
            Err(error) => {
                events.emit(ServerEvent::ClientError {
                    peer: Some(peer),
                    error,
                });
                break;
            }
        }
    }

    // Dropping the halves closes the connection; flush the tee first.
    if let Some(mut file) = tee {
        let _ = file.flush().await;
    }
}

/// Receives datagrams forever; every datagram independently runs the
/// tee/echo/stdout chain against its captured sender address.
async fn datagram_loop(
    socket: UdpSocket,
    config: Arc<ServerConfig>,
    events: EventSender<ServerEvent>,
    state: Arc<watch::Sender<ServerState>>,
    cancel: CancellationToken,
) {
    let mut stdout = stdout_sink(&config);
    let mut buf = vec![0u8; MAX_DATAGRAM];
    // The tee handle is opened on the first datagram and kept for the
    // lifetime of the socket; a failed open is not retried.
    let mut tee: Option<File> = None;
    let mut tee_failed = false;

    loop {
        let recv = tokio::select! {
            () = cancel.cancelled() => break,
            recv = socket.recv_from(&mut buf) => recv,
        };

        match recv {
            Ok((n, peer)) => {
                debug!("message received from {peer}");
                let payload = Bytes::copy_from_slice(&buf[..n]);

                if config.out_file.is_some() && tee.is_none() && !tee_failed {
                    tee = open_tee(&config, &events).await;
                    tee_failed = tee.is_none();
                }
                if let Some(file) = tee.as_mut() {
                    if let Err(e) = file.write_all(&payload).await {
                        events.emit(ServerEvent::Error(tee_error(&config, e)));
                        tee = None;
                        tee_failed = true;
                    } else {
                        let _ = file.flush().await;
                    }
                }

                if config.echo {
                    if let Err(e) = socket.send_to(&payload, peer).await {
                        events.emit(ServerEvent::ClientError {
                            peer: Some(peer),
                            error: NetError::Send(e),
                        });
                    }
                }

                forward_stdout(&mut stdout, &payload, &events).await;
                events.emit(ServerEvent::Message { peer, payload });
            }
            Err(e) => {
                // No per-client handle to scope this to; report and keep
                // receiving.
                events.emit(ServerEvent::ClientError {
                    peer: None,
                    error: NetError::Stream(e),
                });
            }
        }
    }

    if let Some(mut file) = tee {
        let _ = file.flush().await;
    }
    state.send_replace(ServerState::Stopped);
    events.emit(ServerEvent::Close);
    debug!("datagram socket closed");
}

fn stdout_sink(config: &ServerConfig) -> Option<Stdout> {
    (!config.disable_stdout).then(tokio::io::stdout)
}

async fn forward_stdout(
    stdout: &mut Option<Stdout>,
    chunk: &Bytes,
    events: &EventSender<ServerEvent>,
) {
    if let Some(out) = stdout.as_mut() {
        let write = async {
            out.write_all(chunk).await?;
            out.flush().await
        };
        if let Err(e) = write.await {
            events.emit(ServerEvent::Error(NetError::Send(e)));
            *stdout = None;
        }
    }
}

/// Opens the tee file in append mode, scoped to the calling task. A failed
/// open surfaces as an engine-level error and disables the tee; it never
/// affects the listening socket.
async fn open_tee(config: &ServerConfig, events: &EventSender<ServerEvent>) -> Option<File> {
    let path = config.out_file.as_ref()?;
    match OpenOptions::new()
        .append(true)
        .create(true)
        .open(path)
        .await
    {
        Ok(file) => Some(file),
        Err(e) => {
            events.emit(ServerEvent::Error(tee_error(config, e)));
            None
        }
    }
}

fn tee_error(config: &ServerConfig, source: std::io::Error) -> NetError {
    NetError::File {
        path: config
            .out_file
            .clone()
            .unwrap_or_default(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn starts_and_stops() {
        let mut server = Server::new(ServerConfig::new(0));
        assert_eq!(server.state(), ServerState::Created);

        server.start().await.unwrap();
        assert_eq!(server.state(), ServerState::Listening);
        assert!(server.local_addr().is_some());

        server.stop();
        assert_eq!(server.state(), ServerState::Stopped);
    }

    #[tokio::test]
    async fn stop_before_start_is_safe() {
        let server = Server::new(ServerConfig::new(0));
        server.stop();
        server.stop();
        assert_eq!(server.state(), ServerState::Stopped);
    }

    #[tokio::test]
    async fn bind_error_is_fatal_to_instance() {
        let mut first = Server::new(ServerConfig::new(0));
        first.start().await.unwrap();
        let taken = first.local_addr().unwrap().port();

        let mut second = Server::new(ServerConfig::new(taken));
        let err = second.start().await.unwrap_err();
        assert!(matches!(err, NetError::Bind { .. }));
        assert_eq!(second.state(), ServerState::Stopped);
    }

    #[tokio::test]
    async fn udp_server_binds_ephemeral() {
        let mut config = ServerConfig::new(0);
        config.protocol = Protocol::Udp;
        let mut server = Server::new(config);
        server.start().await.unwrap();
        assert_eq!(server.state(), ServerState::Listening);
        server.stop();
    }
}
