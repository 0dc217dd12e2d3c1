use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Subcommand};

use crate::exit::{io_error, CliError, CliResult, USAGE};
use crate::output::OutputFormat;

pub mod broker;
pub mod offer;
pub mod resolve;
pub mod status;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a broker until interrupted.
    Broker(BrokerArgs),
    /// Offer a value and serve it until someone resolves it.
    Offer(OfferArgs),
    /// Resolve an id and print the value.
    Resolve(ResolveArgs),
    /// Print how many peers a broker has.
    Status(StatusArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Broker(args) => broker::run(args, format),
        Command::Offer(args) => offer::run(args, format),
        Command::Resolve(args) => resolve::run(args, format),
        Command::Status(args) => status::run(args, format),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Args, Debug)]
pub struct BrokerArgs {
    /// Socket path to bind.
    pub path: PathBuf,
    /// Quiet time before a peer is pinged (e.g. 1s, 500ms).
    #[arg(long, default_value = "1s")]
    pub ping_interval: String,
    /// How long a pinged peer has to answer before it is evicted.
    #[arg(long, default_value = "60s")]
    pub dead_after: String,
    /// Upper bound on asking an owner for its value. Default: none.
    #[arg(long)]
    pub owner_timeout: Option<String>,
}

#[derive(Args, Debug)]
pub struct OfferArgs {
    /// Broker socket path.
    pub path: PathBuf,
    /// Id to offer the value under. Default: a generated id.
    #[arg(long)]
    pub id: Option<String>,
    /// JSON payload.
    #[arg(long, conflicts_with_all = ["data", "file"])]
    pub json: Option<String>,
    /// Raw string payload.
    #[arg(long, conflicts_with_all = ["json", "file"])]
    pub data: Option<String>,
    /// Read payload from file.
    #[arg(long, conflicts_with_all = ["json", "data"])]
    pub file: Option<PathBuf>,
    /// Stay connected after the value has been resolved, until interrupted.
    #[arg(long)]
    pub keep: bool,
}

#[derive(Args, Debug)]
pub struct ResolveArgs {
    /// Broker socket path.
    pub path: PathBuf,
    /// Id to resolve.
    pub id: String,
    /// Maximum time to wait for the value (e.g. 30s, 500ms).
    #[arg(long, default_value = "30s")]
    pub timeout: String,
}

#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Broker socket path.
    pub path: PathBuf,
    /// Maximum time to wait for the broker's announcement (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub timeout: String,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

/// Run `future` to completion on a fresh multi-threaded runtime.
pub(crate) fn block_on<F: Future>(future: F) -> CliResult<F::Output> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| io_error("runtime setup failed", err))?;
    Ok(runtime.block_on(future))
}

/// Resolves on Ctrl-C. If the handler cannot be installed it never resolves.
pub(crate) async fn interrupted() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "signal handler setup failed");
        std::future::pending::<()>().await;
    }
}

pub(crate) fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, unit) = if let Some(num) = input.strip_suffix("ms") {
        (num, "ms")
    } else if let Some(num) = input.strip_suffix('s') {
        (num, "s")
    } else {
        (input, "s")
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;

    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        _ => Err(CliError::new(
            USAGE,
            format!("unsupported duration unit: {unit}"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_duration_seconds_and_millis() {
        assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("150ms").unwrap(), Duration::from_millis(150));
        assert_eq!(parse_duration("3").unwrap(), Duration::from_secs(3));
    }

    #[test]
    fn parse_duration_rejects_invalid_values() {
        assert!(parse_duration("0s").is_err());
        assert!(parse_duration("bad").is_err());
        assert_eq!(parse_duration("").unwrap_err().code, USAGE);
    }
}
