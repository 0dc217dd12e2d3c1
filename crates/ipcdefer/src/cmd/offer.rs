use std::fs;
use std::sync::Arc;

use bytes::Bytes;
use ipcdefer_broker::{generate_id, ClientConfig, DeferredClient, ResolveError};
use tokio::sync::Notify;
use tracing::{info, warn};

use crate::cmd::{block_on, interrupted, OfferArgs};
use crate::exit::{broker_error, io_error, resolve_error, CliError, CliResult, FAILURE, SUCCESS, USAGE};
use crate::output::{print_offer, OutputFormat};

pub fn run(args: OfferArgs, format: OutputFormat) -> CliResult<i32> {
    let payload = read_payload(&args)?;
    block_on(offer(args, payload, format))?
}

async fn offer(args: OfferArgs, payload: Bytes, format: OutputFormat) -> CliResult<i32> {
    let client = DeferredClient::connect(&args.path, ClientConfig::default())
        .await
        .map_err(|err| broker_error("connect failed", err))?;

    let id = args.id.clone().unwrap_or_else(generate_id);
    let served = Arc::new(Notify::new());
    let size = payload.len();
    client
        .register_deferred(id.clone(), {
            let served = served.clone();
            move || {
                let payload = payload.clone();
                let served = served.clone();
                async move {
                    served.notify_one();
                    Ok::<_, ResolveError>(payload)
                }
            }
        })
        .map_err(|err| resolve_error("offer failed", err))?;
    print_offer(&id, size, format);
    info!(%id, size, "value offered");

    let closed = client.multiplexer().sender().clone();
    tokio::select! {
        _ = served.notified() => {}
        _ = closed.closed() => {
            return Err(CliError::new(FAILURE, "broker closed the connection"));
        }
        _ = interrupted() => {
            warn!(%id, "interrupted before the value was resolved");
            client.disconnect().await;
            return Err(CliError::new(FAILURE, format!("interrupted before \"{id}\" was resolved")));
        }
    }

    // The response is queued once no request is being handled.
    client.multiplexer().idle().await;
    info!(%id, "value served");

    if args.keep {
        tokio::select! {
            _ = closed.closed() => return Ok(SUCCESS),
            _ = interrupted() => {}
        }
    }
    client.disconnect().await;
    Ok(SUCCESS)
}

fn read_payload(args: &OfferArgs) -> CliResult<Bytes> {
    if let Some(json) = &args.json {
        serde_json::from_str::<serde_json::Value>(json)
            .map_err(|err| CliError::new(USAGE, format!("--json is not valid JSON: {err}")))?;
        return Ok(Bytes::from(json.clone().into_bytes()));
    }
    if let Some(data) = &args.data {
        return Ok(Bytes::from(data.clone().into_bytes()));
    }
    if let Some(path) = &args.file {
        return fs::read(path).map(Bytes::from).map_err(|err| {
            io_error(&format!("failed reading {}", path.display()), err)
        });
    }
    Err(CliError::new(USAGE, "one of --data, --json or --file is required"))
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    fn args() -> OfferArgs {
        OfferArgs {
            path: PathBuf::from("/tmp/unused.sock"),
            id: None,
            json: None,
            data: None,
            file: None,
            keep: false,
        }
    }

    #[test]
    fn payload_comes_from_exactly_one_source() {
        let err = read_payload(&args()).unwrap_err();
        assert_eq!(err.code, USAGE);

        let data = OfferArgs {
            data: Some("hello".into()),
            ..args()
        };
        assert_eq!(read_payload(&data).unwrap(), Bytes::from_static(b"hello"));
    }

    #[test]
    fn json_payload_must_parse() {
        let bad = OfferArgs {
            json: Some("{nope".into()),
            ..args()
        };
        assert_eq!(read_payload(&bad).unwrap_err().code, USAGE);

        let good = OfferArgs {
            json: Some("{\"x\":1}".into()),
            ..args()
        };
        assert_eq!(read_payload(&good).unwrap(), Bytes::from_static(b"{\"x\":1}"));
    }
}
