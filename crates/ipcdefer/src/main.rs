mod cmd;
mod exit;
mod logging;
mod output;

use clap::Parser;

use crate::cmd::Command;
use crate::logging::{init_logging, LogFormat, LogLevel};
use crate::output::OutputFormat;

#[derive(Parser, Debug)]
#[command(name = "ipcdefer", version, about = "Deferred values over a local broker")]
struct Cli {
    /// Output format.
    #[arg(long, value_name = "FORMAT", global = true)]
    format: Option<OutputFormat>,

    /// Log output format (stderr).
    #[arg(long, value_name = "FORMAT", default_value = "text", global = true)]
    log_format: LogFormat,

    /// Minimum log level (stderr).
    #[arg(long, value_name = "LEVEL", default_value = "info", global = true)]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Command,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.log_format, cli.log_level);

    let format = cli.format.unwrap_or_else(OutputFormat::default_for_stdout);
    let result = cmd::run(cli.command, format);

    match result {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(err.code);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_offer_subcommand() {
        let cli = Cli::try_parse_from([
            "ipcdefer",
            "offer",
            "/tmp/test.sock",
            "--id",
            "k1",
            "--data",
            "hello",
        ])
        .expect("offer args should parse");

        assert!(matches!(cli.command, Command::Offer(_)));
    }

    #[test]
    fn rejects_conflicting_payload_args() {
        let err = Cli::try_parse_from([
            "ipcdefer",
            "offer",
            "/tmp/test.sock",
            "--json",
            "{\"x\":1}",
            "--data",
            "hello",
        ])
        .expect_err("conflicting args should fail");

        assert_eq!(err.kind(), clap::error::ErrorKind::ArgumentConflict);
    }

    #[test]
    fn parses_resolve_subcommand() {
        let cli = Cli::try_parse_from([
            "ipcdefer",
            "resolve",
            "/tmp/test.sock",
            "k1",
            "--timeout",
            "500ms",
        ])
        .expect("resolve args should parse");
        assert!(matches!(cli.command, Command::Resolve(_)));
    }

    #[test]
    fn broker_flags_are_optional() {
        let cli = Cli::try_parse_from(["ipcdefer", "broker", "/tmp/test.sock"])
            .expect("broker args should parse");
        let Command::Broker(args) = cli.command else {
            panic!("expected broker command");
        };
        assert_eq!(args.ping_interval, "1s");
        assert_eq!(args.dead_after, "60s");
        assert!(args.owner_timeout.is_none());
    }
}
