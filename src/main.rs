//! Command-line adapter for the `netline` engines.
//!
//! This layer owns every process-level decision the library refuses to
//! make: it prints, it picks exit codes, and it terminates on top-level
//! errors. Engines only emit events.

use std::process;
use std::time::Duration;

use anyhow::Result;
use log::debug;
use tokio::sync::mpsc::UnboundedReceiver;

use netline::client::{Client, ClientConfig};
use netline::event::{ClientEvent, ServerEvent};
use netline::input::{Config, Opts, PortRange, PortSpec};
use netline::scanner::ScanJob;
use netline::server::{Server, ServerConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let mut opts = Opts::read();

    let config = match Config::read(opts.config_path.clone()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}\nAborting.");
            process::exit(1);
        }
    };
    opts.merge(&config);

    init_logging(&opts);
    debug!("main() `opts` argument is {opts:?}");

    let Some(spec) = opts.port.clone() else {
        eprintln!("Port must be provided (--port <PORT>)");
        process::exit(1);
    };

    if opts.listen {
        let PortSpec::Single(port) = spec else {
            eprintln!("A listening server takes a single port, not a range");
            process::exit(1);
        };
        run_server(&opts, port).await
    } else {
        match spec {
            PortSpec::Range(range) => run_scan(&opts, range).await,
            PortSpec::Single(port) => run_client(&opts, port).await,
        }
    }
}

fn init_logging(opts: &Opts) {
    let default_level = if opts.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();
}

/// Runs the listening engine until it closes, mapping engine-level errors
/// to a non-zero exit. Connection-scoped failures only print.
async fn run_server(opts: &Opts, port: u16) -> Result<()> {
    let config = ServerConfig {
        protocol: opts.protocol,
        address: opts.address.clone(),
        echo: opts.echo,
        out_file: opts.out_file.clone(),
        disable_stdout: opts.disable_stdout,
        timeout: opts.timeout.map(Duration::from_millis),
        ..ServerConfig::new(port)
    };

    let mut server = Server::new(config);
    let mut events = server.events().expect("fresh engine has its receiver");

    if let Err(e) = server.start().await {
        eprintln!("{e}");
        process::exit(1);
    }

    loop {
        let event = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                server.stop();
                continue;
            }
            event = events.recv() => event,
        };
        let Some(event) = event else { break };

        match event {
            ServerEvent::Listening { local } => {
                if !opts.quiet {
                    println!("listening on {local}");
                }
            }
            ServerEvent::Connection { .. } | ServerEvent::Message { .. } => {}
            ServerEvent::ClientError { peer, error } => {
                if !opts.quiet {
                    match peer {
                        Some(peer) => eprintln!("client error ({peer}): {error}"),
                        None => eprintln!("client error: {error}"),
                    }
                }
            }
            ServerEvent::ClientTimeout { peer } => {
                if !opts.quiet {
                    eprintln!("client timeout: {peer}");
                }
            }
            ServerEvent::Error(error) => {
                eprintln!("{error}");
                process::exit(1);
            }
            ServerEvent::Close => break,
        }
    }

    Ok(())
}

/// Connects, pipes stdin to the peer, and lets the event stream decide the
/// exit code.
async fn run_client(opts: &Opts, port: u16) -> Result<()> {
    let config = ClientConfig {
        protocol: opts.protocol,
        address: opts.address.clone(),
        disable_stdout: opts.disable_stdout,
        timeout: opts.timeout.map(Duration::from_millis),
        ..ClientConfig::new(port)
    };

    if !opts.quiet {
        println!("connecting to {}:{}...", opts.address, port);
    }

    let mut client = Client::new(config);
    let mut events = client.events().expect("fresh engine has its receiver");

    if let Err(e) = client.start().await {
        eprintln!("Client error: {e}");
        process::exit(1);
    }

    let quiet = opts.quiet;
    let pump = async {
        let piped = client.forward(tokio::io::stdin()).await;
        client.stop().await;
        if let Err(e) = piped {
            if !quiet {
                eprintln!("Client error: {e}");
            }
        }
        // Keep the branch open; the engine's Close event ends the select.
        std::future::pending::<()>().await
    };

    let status = tokio::select! {
        () = pump => unreachable!(),
        status = drive_client_events(&mut events, quiet) => status,
    };

    // Exit outright: the blocked stdin reader must not hold the process up.
    process::exit(status);
}

async fn drive_client_events(events: &mut UnboundedReceiver<ClientEvent>, quiet: bool) -> i32 {
    while let Some(event) = events.recv().await {
        match event {
            ClientEvent::Connected { peer } => debug!("connected to {peer}"),
            ClientEvent::Data(_) | ClientEvent::End => {}
            ClientEvent::Timeout => {
                if !quiet {
                    eprintln!("connection timed out");
                }
            }
            ClientEvent::Error(error) => {
                if !quiet {
                    eprintln!("Client error: {error}");
                }
                return 1;
            }
            ClientEvent::Close => return 0,
        }
    }
    0
}

/// Scan mode: every port in the range is probed concurrently; the summary
/// prints once the last probe settles.
async fn run_scan(opts: &Opts, range: PortRange) -> Result<()> {
    let job = ScanJob::new(
        opts.address.clone(),
        range,
        opts.timeout.map(Duration::from_millis),
        opts.batch_size,
    );

    debug!("scanning {}-{} on {}", range.start, range.end, opts.address);
    let report = job.run().await;

    if !opts.quiet {
        println!("{}", report.summary());
    }
    Ok(())
}
