use ipcdefer_broker::{ClientConfig, DeferredClient};

use crate::cmd::{block_on, parse_duration, ResolveArgs};
use crate::exit::{broker_error, resolve_error, CliResult, SUCCESS};
use crate::output::{print_value, OutputFormat};

pub fn run(args: ResolveArgs, format: OutputFormat) -> CliResult<i32> {
    let config = ClientConfig {
        resolve_timeout: Some(parse_duration(&args.timeout)?),
        ..ClientConfig::default()
    };
    block_on(resolve(args, config, format))?
}

async fn resolve(args: ResolveArgs, config: ClientConfig, format: OutputFormat) -> CliResult<i32> {
    let client = DeferredClient::connect(&args.path, config)
        .await
        .map_err(|err| broker_error("connect failed", err))?;

    let outcome = client.resolve(&args.id).await;
    client.disconnect().await;

    let value = outcome.map_err(|err| resolve_error("resolve failed", err))?;
    print_value(&args.id, &value, format);
    Ok(SUCCESS)
}
