//! Trust Kernel Evaluation Binary
//!
//! Runs one turn over a table file and prints the evidence bundle as JSON.
//! Authorities are resolved; providers are not configured and stay silent.
//!
//! ## Configuration
//!
//! Environment variables:
//! - `TRUST_KERNEL_*`: engine limits (see `EngineConfig::from_env`)
//! - `RUST_LOG`: Log level filter (default: info)
//! - `LOG_FORMAT`: "json" for structured logs, "pretty" for development (default: json)
//!
//! ## Usage
//!
//! ```bash
//! cargo run --bin trust_eval -- table.jsonl "is the bridge safe?" [history.txt]
//! ```
//!
//! The optional history file is a transcript of `role: content` lines.

use std::process::ExitCode;
use std::time::Instant;

use tracing::{error, info};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use trust_kernel::{EngineConfig, HistoryMessage, TrustEngine, TruthTable, TurnRequest};

/// Initialize the tracing subscriber with JSON or pretty format.
///
/// Logs go to stderr so stdout carries only the bundle.
fn init_tracing() {
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "json".to_string());

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "trust_eval=info,trust_kernel=info".into());

    if log_format == "pretty" {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(true)
                    .with_span_events(FmtSpan::CLOSE),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_target(true)
                    .with_current_span(true)
                    .flatten_event(true),
            )
            .init();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    let mut args = std::env::args().skip(1);
    let (Some(path), Some(query)) = (args.next(), args.next()) else {
        eprintln!("usage: trust_eval <table.jsonl> <query> [history.txt]");
        return ExitCode::from(2);
    };

    let text = match tokio::fs::read_to_string(&path).await {
        Ok(text) => text,
        Err(e) => {
            error!(path = %path, error = %e, "failed to read table");
            return ExitCode::FAILURE;
        }
    };
    let table = match TruthTable::from_json_lines(&text) {
        Ok(table) => table,
        Err(e) => {
            error!(path = %path, error = %e, "failed to parse table");
            return ExitCode::FAILURE;
        }
    };

    let history = match args.next() {
        Some(history_path) => match tokio::fs::read_to_string(&history_path).await {
            Ok(text) => HistoryMessage::parse_transcript(&text),
            Err(e) => {
                error!(path = %history_path, error = %e, "failed to read history");
                return ExitCode::FAILURE;
            }
        },
        None => Vec::new(),
    };

    let config = EngineConfig::from_env();
    info!(
        version = env!("CARGO_PKG_VERSION"),
        config_hash = %config.params_hash(),
        entries = table.len(),
        history = history.len(),
        "Starting trust evaluation"
    );

    let engine = TrustEngine::builder(config).build();
    let start = Instant::now();
    let outcome = match engine.run(TurnRequest::new(table, query).with_history(history)).await {
        Ok(outcome) => outcome,
        Err(e) => {
            error!(error = %e, "turn failed");
            return ExitCode::FAILURE;
        }
    };
    info!(
        latency_ms = start.elapsed().as_millis() as u64,
        fingerprint = %outcome.bundle.fingerprint,
        selected = outcome.selected().len(),
        "Evaluation complete"
    );

    match serde_json::to_string_pretty(&outcome.bundle) {
        Ok(json) => {
            println!("{json}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "failed to serialize bundle");
            ExitCode::FAILURE
        }
    }
}
