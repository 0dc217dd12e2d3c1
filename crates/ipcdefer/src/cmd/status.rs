use std::time::Duration;

use ipcdefer_broker::{ClientConfig, DeferredClient};

use crate::cmd::{block_on, parse_duration, StatusArgs};
use crate::exit::{broker_error, resolve_error, CliError, CliResult, SUCCESS, TIMEOUT};
use crate::output::{print_status, OutputFormat};

pub fn run(args: StatusArgs, format: OutputFormat) -> CliResult<i32> {
    let timeout = parse_duration(&args.timeout)?;
    block_on(status(args, timeout, format))?
}

async fn status(args: StatusArgs, timeout: Duration, format: OutputFormat) -> CliResult<i32> {
    let client = DeferredClient::connect(&args.path, ClientConfig::default())
        .await
        .map_err(|err| broker_error("connect failed", err))?;

    // The broker announces the count to every peer as it joins.
    let announced = tokio::time::timeout(timeout, client.wait_connection_count(|_| true)).await;
    client.disconnect().await;

    let count = announced
        .map_err(|_| {
            CliError::new(
                TIMEOUT,
                format!("no peer count announced within {timeout:?}"),
            )
        })?
        .map_err(|err| resolve_error("status failed", err))?;
    print_status(&args.path, count, format);
    Ok(SUCCESS)
}
