use ipcdefer_broker::{BrokerConfig, BrokerListener};
use ipcdefer_rpc::LivenessConfig;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::cmd::{block_on, interrupted, parse_duration, BrokerArgs};
use crate::exit::{broker_error, CliError, CliResult, SUCCESS, USAGE};
use crate::output::{print_listening, OutputFormat};

pub fn run(args: BrokerArgs, format: OutputFormat) -> CliResult<i32> {
    let config = broker_config(&args)?;
    block_on(serve(args, config, format))?
}

fn broker_config(args: &BrokerArgs) -> CliResult<BrokerConfig> {
    let liveness = LivenessConfig {
        ping_interval: parse_duration(&args.ping_interval)?,
        dead_after: parse_duration(&args.dead_after)?,
    };
    let owner_timeout = args
        .owner_timeout
        .as_deref()
        .map(parse_duration)
        .transpose()?;
    if liveness.dead_after < liveness.ping_interval {
        return Err(CliError::new(
            USAGE,
            "--dead-after must not be shorter than --ping-interval",
        ));
    }
    Ok(BrokerConfig {
        liveness: Some(liveness),
        owner_timeout,
        ..BrokerConfig::default()
    })
}

async fn serve(args: BrokerArgs, config: BrokerConfig, format: OutputFormat) -> CliResult<i32> {
    let listener = BrokerListener::bind(&args.path, config.clone())
        .map_err(|err| broker_error("bind failed", err))?;
    print_listening(listener.path(), &config, format);

    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        interrupted().await;
        info!("interrupt received");
        trigger.cancel();
    });

    listener
        .run(shutdown)
        .await
        .map_err(|err| broker_error("broker failed", err))?;
    Ok(SUCCESS)
}
