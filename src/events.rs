use std::io::{self, Write};

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tracing_subscriber::{fmt, EnvFilter};

/// Install the global subscriber. An unparsable level falls back to `info`.
pub fn init_logging(level: &str) -> Result<()> {
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(filter_for(level))
        .with_target(true)
        .with_writer(io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

fn filter_for(level: &str) -> EnvFilter {
    EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// JSON-lines event stream on stderr for machine consumers.
#[derive(Clone, Debug)]
pub struct EventEmitter {
    json_output: bool,
}

impl EventEmitter {
    pub fn new(json_output: bool) -> Self {
        Self { json_output }
    }

    pub fn emit<T: Serialize>(&self, event_type: &str, payload: T) {
        if !self.json_output {
            return;
        }

        let mut stderr = io::stderr().lock();
        let _ = writeln!(stderr, "{}", event_line(event_type, payload));
    }
}

fn event_line<T: Serialize>(event_type: &str, payload: T) -> serde_json::Value {
    json!({
        "ts": Utc::now().to_rfc3339(),
        "type": event_type,
        "payload": payload,
    })
}
