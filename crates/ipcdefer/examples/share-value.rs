//! A broker and two peers in one process: one offers a value, the other
//! resolves it.
//!
//! ```sh
//! cargo run -p ipcdefer --example share-value
//! ```

use std::time::Duration;

use bytes::Bytes;
use ipcdefer::{generate_id, BrokerConfig, BrokerListener, ClientConfig, DeferredClient, ResolveError};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let dir = std::env::temp_dir().join(format!("ipcdefer-demo-{}", std::process::id()));
    std::fs::create_dir_all(&dir)?;
    let sock = dir.join("broker.sock");

    let listener = BrokerListener::bind(&sock, BrokerConfig::default())?;
    let broker = listener.broker().clone();
    let shutdown = CancellationToken::new();
    let server = tokio::spawn(listener.run(shutdown.clone()));

    let producer = DeferredClient::connect(&sock, ClientConfig::default()).await?;
    let consumer = DeferredClient::connect(&sock, ClientConfig::default()).await?;

    let id = generate_id();
    producer.register_deferred(id.clone(), || async {
        println!("producer: computing value");
        tokio::time::sleep(Duration::from_millis(100)).await;
        Ok::<_, ResolveError>(Bytes::from_static(b"expensive result"))
    })?;
    while !broker.is_registered(&id) {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let value = consumer.resolve(&id).await?;
    println!("consumer: {}", String::from_utf8_lossy(&value));

    match consumer.resolve(&id).await {
        Err(err) => println!("consumer: second resolve failed as expected: {err}"),
        Ok(_) => println!("consumer: unexpected second value"),
    }

    producer.disconnect().await;
    consumer.disconnect().await;
    shutdown.cancel();
    server.await??;
    let _ = std::fs::remove_dir_all(&dir);
    Ok(())
}
