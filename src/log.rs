//! Logging: tracing subscriber setup and auto-response log sinks.

use crate::protocol::AutoResponse;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::Mutex;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Log to stderr; stdout carries the agent's terminal output.
pub fn init_tracing(level: &str) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}

/// Receives every resolved auto-response, including discarded ones
pub trait ResponseLog: Send + Sync {
    fn record(&self, response: &AutoResponse);
}

/// Default sink: one tracing line per response
pub struct TracingResponseLog;

impl ResponseLog for TracingResponseLog {
    fn record(&self, response: &AutoResponse) {
        match &response.error {
            None => info!(
                "[auto-response] {:?} -> {:?} ({}ms)",
                response.prompt.prompt_text, response.response, response.latency_ms
            ),
            Some(error) => warn!(
                "[auto-response] {:?} failed: {} ({}ms)",
                response.prompt.prompt_text, error, response.latency_ms
            ),
        }
    }
}

/// Appends each response as one JSON line
pub struct JsonLinesResponseLog {
    file: Mutex<File>,
}

impl JsonLinesResponseLog {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        info!("Logging auto-responses to {}", path.display());
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

impl ResponseLog for JsonLinesResponseLog {
    fn record(&self, response: &AutoResponse) {
        let line = match serde_json::to_string(response) {
            Ok(line) => line,
            Err(e) => {
                warn!("Failed to serialize auto-response: {}", e);
                return;
            }
        };
        let mut file = self.file.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = writeln!(file, "{}", line) {
            warn!("Failed to write response log: {}", e);
        }
    }
}
