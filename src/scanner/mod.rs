//! Core functionality for concurrent port scanning behaviour.

use std::time::Duration;

use colored::Colorize;
use futures::stream::{self, StreamExt};
use log::debug;

use crate::client::{Client, ClientConfig};
use crate::input::PortRange;

/// Per-attempt connect window when none is configured.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(2000);

/// One port-range scan invocation.
///
/// Every port in the inclusive range gets its own short-lived client probe;
/// the probes are all initiated concurrently, with at most `batch_size` in
/// flight at once, so total latency tracks the slowest single probe rather
/// than the sum of all of them.
#[derive(Debug)]
pub struct ScanJob {
    host: String,
    range: PortRange,
    timeout: Duration,
    batch_size: u16,
}

/// The aggregated outcome of one scan, finalized exactly once when every
/// probe has settled.
///
/// Both lists are ordered by probe completion, not port number, and together
/// they partition the attempted range: `open.len() + errored.len()` equals
/// the range length.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScanReport {
    /// Ports that accepted a connection.
    pub open: Vec<u16>,
    /// Ports whose probe failed, was refused, or timed out.
    pub errored: Vec<u16>,
}

impl ScanReport {
    /// How many probes have settled.
    #[must_use]
    pub fn completed(&self) -> usize {
        self.open.len() + self.errored.len()
    }

    /// Human-readable summary: counts and the open-port list.
    #[must_use]
    pub fn summary(&self) -> String {
        let open = self
            .open
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");

        format!(
            "Number of open ports -> [{}]\nOpen ports: [{}]\n\nNumber of closed ports -> [{}]",
            self.open.len().to_string().green(),
            open.purple(),
            self.errored.len(),
        )
    }
}

impl ScanJob {
    /// Builds a scan over the inclusive `range` on `host`.
    ///
    /// `timeout` bounds each individual connection attempt and falls back to
    /// [`DEFAULT_PROBE_TIMEOUT`]; `batch_size` caps how many probes run at
    /// once (a full-range scan of a remote host can otherwise exhaust the
    /// open-file limit).
    #[must_use]
    pub fn new(host: String, range: PortRange, timeout: Option<Duration>, batch_size: u16) -> Self {
        Self {
            host,
            range,
            timeout: timeout.unwrap_or(DEFAULT_PROBE_TIMEOUT),
            batch_size: batch_size.max(1),
        }
    }

    /// The number of probes the scan will run.
    #[must_use]
    pub fn total_attempts(&self) -> usize {
        self.range.len()
    }

    /// Runs every probe and aggregates the partitioned result.
    ///
    /// This is the entry point used for scan mode. Aggregation happens only
    /// here, in the single loop consuming probe completions, so there is no
    /// shared counter to coordinate.
    pub async fn run(&self) -> ScanReport {
        let total = self.total_attempts();
        debug!(
            "scanning {} ports on {} with {} in flight, {:?} per attempt",
            total, self.host, self.batch_size, self.timeout
        );

        let mut probes = stream::iter(self.range.iter())
            .map(|port| self.probe(port))
            .buffer_unordered(usize::from(self.batch_size));

        let mut report = ScanReport::default();
        while let Some(outcome) = probes.next().await {
            match outcome {
                Ok(port) => report.open.push(port),
                Err(port) => report.errored.push(port),
            }
            debug!("{}/{} probes settled", report.completed(), total);
        }

        debug!("open ports: {:?}", report.open);
        report
    }

    /// One short-lived client attempt against a single port.
    ///
    /// A successful connect is immediately torn down again; any failure,
    /// timeouts included, converts the probe into an errored-port result and
    /// is never fatal to the scan.
    async fn probe(&self, port: u16) -> Result<u16, u16> {
        let config = ClientConfig {
            address: self.host.clone(),
            disable_stdout: true,
            timeout: Some(self.timeout),
            ..ClientConfig::new(port)
        };

        let mut client = Client::new(config);
        match client.start().await {
            Ok(()) => {
                client.stop().await;
                Ok(port)
            }
            Err(e) => {
                debug!("port {port} errored: {e}");
                Err(port)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{Server, ServerConfig};

    #[tokio::test]
    async fn scanner_runs() {
        // Makes sure the scan settles and doesn't panic against closed ports.
        let job = ScanJob::new(
            String::from("127.0.0.1"),
            PortRange {
                start: 49_700,
                end: 49_719,
            },
            Some(Duration::from_millis(100)),
            10,
        );
        let report = job.run().await;
        assert_eq!(report.completed(), 20);
    }

    #[tokio::test]
    async fn finds_the_single_listener() {
        let mut server = Server::new(ServerConfig {
            disable_stdout: true,
            ..ServerConfig::new(0)
        });
        server.start().await.unwrap();
        let port = server.local_addr().unwrap().port();

        // A window wide enough to cover the bound port on either side.
        let start = port.saturating_sub(2);
        let end = port.saturating_add(2);
        let job = ScanJob::new(
            String::from("127.0.0.1"),
            PortRange { start, end },
            Some(Duration::from_millis(500)),
            16,
        );

        let report = job.run().await;
        assert!(report.open.contains(&port));
        assert_eq!(
            report.completed(),
            usize::from(end - start) + 1,
            "every probe settles exactly once"
        );

        server.stop();
    }

    #[tokio::test]
    async fn total_attempts_counts_inclusive_range() {
        let job = ScanJob::new(
            String::from("127.0.0.1"),
            PortRange {
                start: 9000,
                end: 9005,
            },
            None,
            4096,
        );
        assert_eq!(job.total_attempts(), 6);
    }
}
