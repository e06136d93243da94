//! This crate exposes the internal functionality of the `netline` socket
//! utility.
//!
//! `netline` is a small TCP/UDP tool that can run as a listening server
//! which relays, echoes, or persists incoming data, as a client that
//! streams local input to a remote endpoint, and as a concurrent TCP port
//! scanner over a numeric range.
//!
//! ## Architecture Overview
//!
//! Three engines sit on one thin transport layer:
//!
//! 1. **Server** ([`server::Server`]): owns a bound socket; every accepted
//!    connection (TCP) or inbound datagram (UDP) runs the configured
//!    behavior chain (idle timeout, tee to file, echo, stdout forward).
//! 2. **Client** ([`client::Client`]): owns one outbound connection;
//!    streams local input to the peer and emits received data.
//! 3. **Scanner** ([`scanner::ScanJob`]): fans out one short-lived client
//!    probe per port, all running concurrently, and aggregates a
//!    partitioned open/errored result.
//!
//! Engines report lifecycle through channel-delivered events
//! ([`event::ServerEvent`], [`event::ClientEvent`]) and never terminate the
//! process; the `netline` binary is a thin adapter that maps top-level
//! error events to exit codes.
//!
//! ## Basic Usage Example
//!
//! An echo server and a client talking to it:
//!
//! ```no_run
//! use netline::client::{Client, ClientConfig};
//! use netline::event::ClientEvent;
//! use netline::server::{Server, ServerConfig};
//!
//! # async fn demo() -> Result<(), netline::error::NetError> {
//! let mut server = Server::new(ServerConfig {
//!     echo: true,
//!     disable_stdout: true,
//!     ..ServerConfig::new(9000)
//! });
//! server.start().await?;
//!
//! let mut client = Client::new(ClientConfig::new(9000));
//! let mut events = client.events().unwrap();
//! client.start().await?;
//! client.send(b"ping").await?;
//!
//! while let Some(event) = events.recv().await {
//!     if let ClientEvent::Data(payload) = event {
//!         assert_eq!(&payload[..], b"ping");
//!         break;
//!     }
//! }
//!
//! client.stop().await;
//! server.stop();
//! # Ok(())
//! # }
//! ```
//!
//! ## Scanning Example
//!
//! ```no_run
//! use netline::input::PortRange;
//! use netline::scanner::ScanJob;
//!
//! # async fn demo() {
//! let job = ScanJob::new(
//!     String::from("127.0.0.1"),
//!     PortRange { start: 9000, end: 9005 },
//!     None,   // 2000 ms per attempt
//!     4096,   // probes in flight at once
//! );
//! let report = job.run().await;
//! println!("{}", report.summary());
//! # }
//! ```
#![warn(missing_docs)]

pub mod client;

pub mod error;

pub mod event;

pub mod input;

pub mod scanner;

pub mod server;

pub mod transport;
