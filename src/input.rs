//! Provides a means to read, parse and hold configuration options.
use clap::Parser;
use serde_derive::Deserialize;
use std::fs;
use std::path::PathBuf;

use crate::transport::Protocol;

const LOWEST_PORT_NUMBER: u16 = 1;
const TOP_PORT_NUMBER: u16 = 65535;

/// Environment variable consulted when no port is given on the command line.
pub const PORT_ENV_VAR: &str = "NETLINE_PORT";

/// A contiguous, inclusive range of ports.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    /// First port of the range.
    pub start: u16,
    /// Last port of the range, included.
    pub end: u16,
}

impl PortRange {
    /// Number of ports the range covers, boundaries included.
    #[must_use]
    pub fn len(&self) -> usize {
        usize::from(self.end - self.start) + 1
    }

    /// A parsed range always covers at least one port.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        false
    }

    /// The ports in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = u16> {
        self.start..=self.end
    }
}

/// What the `--port` argument asked for: one endpoint, or a range to scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortSpec {
    /// Connect to or listen on exactly this port.
    Single(u16),
    /// Scan every port in the range.
    Range(PortRange),
}

/// Parses `"9000"` or `"9000-9005"` into a [`PortSpec`].
///
/// A hyphen selects scan mode. Both bounds are validated against the legal
/// port space and against each other.
pub fn parse_port_spec(input: &str) -> Result<PortSpec, String> {
    let input = input.trim();
    if input.contains('-') {
        parse_port_range(input).map(PortSpec::Range)
    } else {
        parse_single_port(input).map(PortSpec::Single)
    }
}

fn parse_port_range(range_str: &str) -> Result<PortRange, String> {
    let range_parts: Vec<&str> = range_str.split('-').collect();
    if range_parts.len() != 2 {
        return Err(format!(
            "Invalid range format '{range_str}'. Expected 'start-end'. Example: 9000-9005.",
        ));
    }

    let start: u16 = range_parts[0].parse().map_err(|_| {
        format!(
            "Invalid start port '{}' in range '{range_str}'",
            range_parts[0]
        )
    })?;
    let end: u16 = range_parts[1].parse().map_err(|_| {
        format!(
            "Invalid end port '{}' in range '{range_str}'",
            range_parts[1]
        )
    })?;

    if start > end {
        return Err(format!(
            "Start port {start} is greater than end port {end} in range '{range_str}'",
        ));
    }

    if start < LOWEST_PORT_NUMBER {
        return Err(format!(
            "Ports in range '{range_str}' must be between {LOWEST_PORT_NUMBER} and {TOP_PORT_NUMBER}",
        ));
    }

    Ok(PortRange { start, end })
}

fn parse_single_port(port_str: &str) -> Result<u16, String> {
    let port: u16 = port_str
        .parse()
        .map_err(|_| format!("Invalid port number '{port_str}'"))?;

    if port < LOWEST_PORT_NUMBER {
        return Err(format!(
            "Port {port} must be between {LOWEST_PORT_NUMBER} and {TOP_PORT_NUMBER}",
        ));
    }

    Ok(port)
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "netline",
    version = env!("CARGO_PKG_VERSION"),
    max_term_width = 120,
    help_template = "{bin} {version}\n{about}\n\nUSAGE:\n    {usage}\n\nOPTIONS:\n{options}",
)]
#[allow(clippy::struct_excessive_bools)]
/// TCP/UDP socket utility: listen, relay, echo, and scan ports.
/// Runs as a listening server with --listen, scans when the port argument
/// is a range like 9000-9005, and otherwise connects as a client that
/// streams stdin to the remote endpoint.
pub struct Opts {
    /// Run as a listening server instead of a client.
    #[arg(short, long)]
    pub listen: bool,

    /// The port to listen on or connect to, or a scan range. Examples: 9000 or 9000-9005.
    #[arg(short, long, value_parser = parse_port_spec)]
    pub port: Option<PortSpec>,

    /// The address to bind (server) or connect to (client).
    #[arg(short, long, default_value = "127.0.0.1")]
    pub address: String,

    /// The socket variant to use.
    #[arg(long, value_enum, ignore_case = true, default_value = "tcp")]
    pub protocol: Protocol,

    /// Echo received data back to the sender, byte for byte.
    #[arg(short, long)]
    pub echo: bool,

    /// Append received data to this file, verbatim.
    #[arg(short, long)]
    pub out_file: Option<PathBuf>,

    /// Do not forward received data to stdout.
    #[arg(long)]
    pub disable_stdout: bool,

    /// Idle timeout in milliseconds. Bounds connection attempts too; scan
    /// probes fall back to 2000 ms when unset.
    #[arg(short, long)]
    pub timeout: Option<u64>,

    /// How many scan probes may be in flight at once.
    #[arg(short, long, default_value = "4096")]
    pub batch_size: u16,

    /// Suppress informational output. Errors are still reported through
    /// the exit code.
    #[arg(short, long)]
    pub quiet: bool,

    /// Log connection lifecycle details.
    #[arg(short, long)]
    pub verbose: bool,

    /// Whether to ignore the configuration file or not.
    #[arg(short, long)]
    pub no_config: bool,

    /// Custom path to config file
    #[arg(short, long, value_parser)]
    pub config_path: Option<PathBuf>,
}

impl Opts {
    /// Reads the command line arguments, falling back to the
    /// `NETLINE_PORT` environment variable when no port was given.
    #[must_use]
    pub fn read() -> Self {
        let mut opts = Opts::parse();

        if opts.port.is_none() {
            if let Ok(raw) = std::env::var(PORT_ENV_VAR) {
                opts.port = parse_port_spec(&raw).ok();
            }
        }

        opts
    }

    /// Merges values found within the user configuration file into the
    /// command line arguments.
    pub fn merge(&mut self, config: &Config) {
        if !self.no_config {
            self.merge_required(config);
            self.merge_optional(config);
        }
    }

    fn merge_required(&mut self, config: &Config) {
        macro_rules! merge_required {
            ($($field: ident),+) => {
                $(
                    if let Some(e) = &config.$field {
                        self.$field = e.clone();
                    }
                )+
            }
        }

        merge_required!(
            listen,
            address,
            protocol,
            echo,
            disable_stdout,
            batch_size,
            quiet,
            verbose
        );
    }

    fn merge_optional(&mut self, config: &Config) {
        macro_rules! merge_optional {
            ($($field: ident),+) => {
                $(
                    if config.$field.is_some() {
                        self.$field = config.$field.clone();
                    }
                )+
            }
        }

        // The config file stores the port in the same textual form the
        // command line accepts, ranges included.
        if let Some(raw) = &config.port {
            if let Ok(spec) = parse_port_spec(raw) {
                self.port = Some(spec);
            }
        }

        merge_optional!(out_file, timeout);
    }
}

impl Default for Opts {
    fn default() -> Self {
        Self {
            listen: false,
            port: None,
            address: String::from("127.0.0.1"),
            protocol: Protocol::Tcp,
            echo: false,
            out_file: None,
            disable_stdout: false,
            timeout: None,
            batch_size: 4096,
            quiet: false,
            verbose: false,
            no_config: true,
            config_path: None,
        }
    }
}

/// Struct used to deserialize the options specified within our config file.
/// These will be further merged with our command line arguments in order to
/// generate the final Opts struct.
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    listen: Option<bool>,
    port: Option<String>,
    address: Option<String>,
    protocol: Option<Protocol>,
    echo: Option<bool>,
    out_file: Option<PathBuf>,
    disable_stdout: Option<bool>,
    timeout: Option<u64>,
    batch_size: Option<u16>,
    quiet: Option<bool>,
    verbose: Option<bool>,
}

impl Config {
    /// Reads the configuration file with TOML format and parses it into a
    /// Config struct. A missing file yields the empty config; a malformed
    /// one is reported to the caller rather than terminating the process.
    ///
    /// # Format
    ///
    /// address = "0.0.0.0"
    /// port = "9000"
    /// protocol = "Udp"
    /// echo = true
    /// out_file = "/var/log/netline.bin"
    pub fn read(custom_config_path: Option<PathBuf>) -> Result<Self, String> {
        let config_path = custom_config_path.unwrap_or_else(default_config_path);
        if !config_path.exists() {
            return Ok(Config::default());
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|e| format!("Could not read {}: {e}", config_path.display()))?;

        toml::from_str(&content).map_err(|e| format!("Found {e} in configuration file."))
    }
}

/// Constructs default path to config toml
#[must_use]
pub fn default_config_path() -> PathBuf {
    let Some(mut config_path) = dirs::home_dir() else {
        panic!("Could not infer config file path.");
    };
    config_path.push(".netline.toml");
    config_path
}

#[cfg(test)]
mod tests {
    use parameterized::parameterized;

    use super::{parse_port_spec, Config, Opts, PortRange, PortSpec};
    use crate::transport::Protocol;

    #[parameterized(input = {"1", "80", "9000", "65535"}, expected = {1, 80, 9000, 65535})]
    fn parses_single_ports(input: &str, expected: u16) {
        assert_eq!(parse_port_spec(input), Ok(PortSpec::Single(expected)));
    }

    #[test]
    fn parses_a_range() {
        assert_eq!(
            parse_port_spec("9000-9005"),
            Ok(PortSpec::Range(PortRange {
                start: 9000,
                end: 9005
            }))
        );
    }

    #[test]
    fn single_port_range_is_allowed() {
        let spec = parse_port_spec("443-443").unwrap();
        let PortSpec::Range(range) = spec else {
            panic!("expected a range");
        };
        assert_eq!(range.len(), 1);
    }

    #[parameterized(input = {"0", "65536", "abc", "", "-", "10-5", "1-2-3", "0-10"})]
    fn rejects_invalid_specs(input: &str) {
        assert!(parse_port_spec(input).is_err(), "{input:?} should not parse");
    }

    #[test]
    fn range_len_is_inclusive() {
        let range = PortRange {
            start: 9000,
            end: 9005,
        };
        assert_eq!(range.len(), 6);
        assert_eq!(range.iter().count(), 6);
    }

    #[test]
    fn config_file_overrides_defaults() {
        let config: Config = toml::from_str(
            r#"
            address = "0.0.0.0"
            port = "4000-4004"
            protocol = "Udp"
            echo = true
            timeout = 1500
            "#,
        )
        .unwrap();

        let mut opts = Opts {
            no_config: false,
            ..Opts::default()
        };
        opts.merge(&config);

        assert_eq!(opts.address, "0.0.0.0");
        assert_eq!(opts.protocol, Protocol::Udp);
        assert!(opts.echo);
        assert_eq!(opts.timeout, Some(1500));
        assert_eq!(
            opts.port,
            Some(PortSpec::Range(PortRange {
                start: 4000,
                end: 4004
            }))
        );
    }

    #[test]
    fn no_config_skips_merge() {
        let config: Config = toml::from_str(r#"address = "0.0.0.0""#).unwrap();
        let mut opts = Opts::default();
        opts.merge(&config);
        assert_eq!(opts.address, "127.0.0.1");
    }
}
