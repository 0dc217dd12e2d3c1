use std::io::{IsTerminal, Write};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
    Raw,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

#[derive(Serialize)]
struct ListeningOutput<'a> {
    event: &'static str,
    path: String,
    ping_interval_ms: Option<u128>,
    dead_after_ms: Option<u128>,
    owner_timeout_ms: Option<u128>,
    timestamp: &'a str,
}

#[derive(Serialize)]
struct OfferOutput<'a> {
    event: &'static str,
    id: &'a str,
    size: usize,
    timestamp: &'a str,
}

#[derive(Serialize)]
struct ValueOutput<'a> {
    id: &'a str,
    size: usize,
    payload: String,
    timestamp: &'a str,
}

#[derive(Serialize)]
struct StatusOutput<'a> {
    path: String,
    connection_count: usize,
    timestamp: &'a str,
}

pub fn print_listening(path: &Path, config: &ipcdefer_broker::BrokerConfig, format: OutputFormat) {
    let ping_interval = config.liveness.map(|l| l.ping_interval.as_millis());
    let dead_after = config.liveness.map(|l| l.dead_after.as_millis());
    let owner_timeout = config.owner_timeout.map(|t| t.as_millis());
    match format {
        OutputFormat::Json => print_json(&ListeningOutput {
            event: "listening",
            path: path.display().to_string(),
            ping_interval_ms: ping_interval,
            dead_after_ms: dead_after,
            owner_timeout_ms: owner_timeout,
            timestamp: &now_unix_seconds(),
        }),
        OutputFormat::Table | OutputFormat::Pretty => {
            println!("Broker listening on {}", path.display());
            match (ping_interval, dead_after) {
                (Some(ping), Some(dead)) => {
                    println!("  Liveness:       ping every {ping}ms, dead after {dead}ms")
                }
                _ => println!("  Liveness:       off"),
            }
            match owner_timeout {
                Some(ms) => println!("  Owner timeout:  {ms}ms"),
                None => println!("  Owner timeout:  none"),
            }
        }
        OutputFormat::Raw => {}
    }
}

pub fn print_offer(id: &str, size: usize, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(&OfferOutput {
            event: "offered",
            id,
            size,
            timestamp: &now_unix_seconds(),
        }),
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["ID", "SIZE"])
                .add_row(vec![id.to_string(), size.to_string()]);
            println!("{table}");
        }
        OutputFormat::Pretty => println!("offered id={id} size={size}"),
        OutputFormat::Raw => println!("{id}"),
    }
    let _ = std::io::stdout().flush();
}

pub fn print_value(id: &str, payload: &[u8], format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(&ValueOutput {
            id,
            size: payload.len(),
            payload: payload_preview(payload),
            timestamp: &now_unix_seconds(),
        }),
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["ID", "SIZE", "PAYLOAD"])
                .add_row(vec![
                    id.to_string(),
                    payload.len().to_string(),
                    payload_preview(payload),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!(
                "id={} size={} payload={}",
                id,
                payload.len(),
                payload_preview(payload)
            );
        }
        OutputFormat::Raw => print_raw(payload),
    }
}

pub fn print_status(path: &Path, connection_count: usize, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(&StatusOutput {
            path: path.display().to_string(),
            connection_count,
            timestamp: &now_unix_seconds(),
        }),
        OutputFormat::Table | OutputFormat::Pretty => {
            println!("Broker Status:");
            println!("  Socket:           {}", path.display());
            println!("  Connected peers:  {connection_count} (including this one)");
        }
        OutputFormat::Raw => println!("{connection_count}"),
    }
}

pub fn print_raw(data: &[u8]) {
    let mut out = std::io::stdout();
    let _ = out.write_all(data);
    let _ = out.flush();
}

fn print_json<T: Serialize>(value: &T) {
    println!(
        "{}",
        serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string())
    );
    let _ = std::io::stdout().flush();
}

fn payload_preview(payload: &[u8]) -> String {
    match std::str::from_utf8(payload) {
        Ok(text) => text.to_string(),
        Err(_) => format!("<binary {} bytes>", payload.len()),
    }
}

fn now_unix_seconds() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .unwrap_or_else(|_| "0".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_payloads_are_summarized() {
        assert_eq!(payload_preview(b"hello"), "hello");
        assert_eq!(payload_preview(&[0xff, 0xfe]), "<binary 2 bytes>");
    }
}
