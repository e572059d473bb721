//! Command-line configuration.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;

/// Raw command-line flags.
///
/// All values can also come from environment variables, which keeps container
/// deployments free of wrapper scripts. The wrapped backend command and its
/// arguments follow a `--` separator; any `{{.Port}}` inside an argument is
/// replaced with the worker's port.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "stabilizer",
    version,
    about = "Stabilizes an unreliable HTTP server by running it as a pool of disposable worker subprocesses"
)]
pub struct CliArgs {
    /// HTTP address to listen on.
    #[arg(long, env = "STABILIZER_LISTEN", default_value = ":8080")]
    pub listen: String,

    /// Number of worker subprocesses to spawn.
    #[arg(long, env = "STABILIZER_WORKERS", default_value_t = 8)]
    pub workers: usize,

    /// Number of concurrent requests to allow per worker.
    #[arg(long, env = "STABILIZER_CONCURRENCY", default_value_t = 10)]
    pub concurrency: usize,

    /// If a request to a worker takes longer than this, the worker is
    /// killed and restarted.
    #[arg(
        long,
        env = "STABILIZER_TIMEOUT",
        default_value = "10s",
        value_parser = humantime::parse_duration
    )]
    pub timeout: Duration,

    /// Request header used to override the default timeout value; an empty
    /// string disables the override.
    #[arg(long, env = "STABILIZER_HEADER", default_value = "X-Stabilize-Timeout")]
    pub header: String,

    /// Publish Prometheus metrics on this address; an empty string disables
    /// the endpoint.
    #[arg(long, env = "STABILIZER_PROMETHEUS", default_value = ":6060")]
    pub prometheus: String,

    /// App name to prefix Prometheus metric names with.
    #[arg(long, env = "STABILIZER_PROMETHEUS_APP_NAME", default_value = "")]
    pub prometheus_app_name: String,

    /// Start an HTTP demo server that randomly wedges itself, for trying
    /// out the stabilizer.
    #[arg(long, default_value_t = false)]
    pub demo: bool,

    /// HTTP address for the demo server to listen on.
    #[arg(long, default_value = ":9700")]
    pub demo_listen: String,

    /// Worker command and its arguments.
    #[arg(last = true)]
    pub command: Vec<String>,
}

/// Validated runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddr,
    pub workers: usize,
    pub concurrency: usize,
    pub timeout: Duration,
    /// `None` disables the per-request override.
    pub timeout_header: Option<String>,
    /// `None` disables the metrics endpoint.
    pub prometheus: Option<SocketAddr>,
    pub prometheus_app_name: String,
    pub command: String,
    pub args: Vec<String>,
}

impl TryFrom<CliArgs> for Config {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> anyhow::Result<Self> {
        if args.workers == 0 {
            bail!("--workers must be greater than 0");
        }
        if args.concurrency == 0 {
            bail!("--concurrency must be greater than 0");
        }

        let mut command = args.command.into_iter();
        let Some(program) = command.next() else {
            bail!("missing worker command");
        };

        let prometheus = if args.prometheus.is_empty() {
            None
        } else {
            Some(parse_listen_addr(&args.prometheus)?)
        };

        Ok(Self {
            listen: parse_listen_addr(&args.listen)?,
            workers: args.workers,
            concurrency: args.concurrency,
            timeout: args.timeout,
            timeout_header: (!args.header.is_empty()).then_some(args.header),
            prometheus,
            prometheus_app_name: args.prometheus_app_name,
            command: program,
            args: command.collect(),
        })
    }
}

/// Parses a bind address, accepting the `:8080` shorthand for binding all
/// interfaces.
pub fn parse_listen_addr(addr: &str) -> anyhow::Result<SocketAddr> {
    let full = if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    };
    full.parse()
        .with_context(|| format!("invalid listen address {addr:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(argv: &[&str]) -> CliArgs {
        CliArgs::try_parse_from(argv).unwrap()
    }

    #[test]
    fn defaults_match_documented_values() {
        let config =
            Config::try_from(parse(&["stabilizer", "--", "backend", "-p", "{{.Port}}"])).unwrap();

        assert_eq!(config.listen, "0.0.0.0:8080".parse().unwrap());
        assert_eq!(config.workers, 8);
        assert_eq!(config.concurrency, 10);
        assert_eq!(config.timeout, Duration::from_secs(10));
        assert_eq!(config.timeout_header.as_deref(), Some("X-Stabilize-Timeout"));
        assert_eq!(config.prometheus, Some("0.0.0.0:6060".parse().unwrap()));
        assert_eq!(config.prometheus_app_name, "");
        assert_eq!(config.command, "backend");
        assert_eq!(config.args, vec!["-p".to_string(), "{{.Port}}".to_string()]);
    }

    #[test]
    fn timeout_accepts_humantime_values() {
        let args = parse(&["stabilizer", "--timeout", "500ms", "--", "backend"]);
        assert_eq!(args.timeout, Duration::from_millis(500));
    }

    #[test]
    fn empty_header_disables_override() {
        let config =
            Config::try_from(parse(&["stabilizer", "--header", "", "--", "backend"])).unwrap();
        assert!(config.timeout_header.is_none());
    }

    #[test]
    fn empty_prometheus_disables_endpoint() {
        let config =
            Config::try_from(parse(&["stabilizer", "--prometheus", "", "--", "backend"])).unwrap();
        assert!(config.prometheus.is_none());
    }

    #[test]
    fn missing_command_is_rejected() {
        let args = parse(&["stabilizer"]);
        assert!(args.command.is_empty());
        assert!(Config::try_from(args).is_err());
    }

    #[test]
    fn zero_workers_is_rejected() {
        let args = parse(&["stabilizer", "--workers", "0", "--", "backend"]);
        assert!(Config::try_from(args).is_err());
    }

    #[test]
    fn listen_shorthand_binds_all_interfaces() {
        assert_eq!(
            parse_listen_addr(":9700").unwrap(),
            "0.0.0.0:9700".parse().unwrap()
        );
        assert_eq!(
            parse_listen_addr("127.0.0.1:8080").unwrap(),
            "127.0.0.1:8080".parse().unwrap()
        );
        assert!(parse_listen_addr("not-an-address").is_err());
    }
}
