//! Scan-mode integration tests: completeness, partitioning, and timeout
//! behavior of the concurrent probes.

use std::time::Duration;

use netline::input::PortRange;
use netline::scanner::ScanJob;
use netline::server::{Server, ServerConfig};

async fn quiet_server() -> (Server, u16) {
    let mut server = Server::new(ServerConfig {
        disable_stdout: true,
        ..ServerConfig::new(0)
    });
    server.start().await.unwrap();
    let port = server.local_addr().unwrap().port();
    (server, port)
}

#[tokio::test]
async fn scan_finds_the_listener_and_settles_every_probe() {
    let (server, port) = quiet_server().await;

    let range = PortRange {
        start: port.saturating_sub(2),
        end: port.saturating_add(3),
    };
    let job = ScanJob::new(
        String::from("127.0.0.1"),
        range,
        Some(Duration::from_millis(500)),
        16,
    );
    assert_eq!(job.total_attempts(), range.len());

    let report = job.run().await;

    assert!(report.open.contains(&port), "the bound port must be open");
    assert_eq!(
        report.completed(),
        range.len(),
        "open and errored must partition the attempted range"
    );

    // No probe settles twice: the two lists are disjoint and within range.
    for p in report.open.iter().chain(report.errored.iter()) {
        assert!((range.start..=range.end).contains(p));
    }
    assert!(report.open.iter().all(|p| !report.errored.contains(p)));

    server.stop();
}

#[tokio::test]
async fn scan_reports_a_closed_port_as_errored() {
    // Bind-then-drop to get a port that was just proven free.
    let (server, port) = quiet_server().await;
    server.stop();
    drop(server);
    // Give the listener a moment to actually release the socket.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let job = ScanJob::new(
        String::from("127.0.0.1"),
        PortRange {
            start: port,
            end: port,
        },
        Some(Duration::from_millis(500)),
        1,
    );
    let report = job.run().await;

    assert_eq!(report.completed(), 1);
    assert!(report.errored.contains(&port));

    let summary = report.summary();
    assert!(summary.contains("Number of open ports"));
}

#[tokio::test]
async fn unreachable_host_converts_probes_into_errored_results() {
    // TEST-NET-1 is reserved; connects either get refused fast or hit the
    // per-attempt window. Both count as errored, never as a scan failure.
    let job = ScanJob::new(
        String::from("192.0.2.1"),
        PortRange {
            start: 9000,
            end: 9002,
        },
        Some(Duration::from_millis(200)),
        3,
    );
    let report = job.run().await;

    assert!(report.open.is_empty());
    let mut errored = report.errored.clone();
    errored.sort_unstable();
    assert_eq!(errored, vec![9000, 9001, 9002]);
}

#[tokio::test]
async fn batch_size_one_still_settles_the_whole_range() {
    let (server, port) = quiet_server().await;

    let range = PortRange {
        start: port.saturating_sub(1),
        end: port.saturating_add(1),
    };
    let job = ScanJob::new(
        String::from("127.0.0.1"),
        range,
        Some(Duration::from_millis(500)),
        1,
    );
    let report = job.run().await;

    assert_eq!(report.completed(), 3);
    assert!(report.open.contains(&port));

    server.stop();
}
