//! JSON lines output for GUI integration
//!
//! With `--json`, queue events and the final run summary are written to
//! stdout one JSON object per line; human output is suppressed.

use serde::Serialize;
use std::io::Write;
use std::sync::Mutex;

use crate::queue::{QueueEvent, QueueObserver};

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JsonMessage {
    /// Emitted once when `run` returns
    Summary {
        completed: usize,
        failed: usize,
        pending: usize,
        #[serde(rename = "durationSecs")]
        duration_secs: f64,
    },
}

impl JsonMessage {
    pub fn emit(&self) {
        emit_line(self);
    }

    pub fn summary(completed: usize, failed: usize, pending: usize, duration_secs: f64) {
        Self::Summary {
            completed,
            failed,
            pending,
            duration_secs,
        }
        .emit();
    }
}

fn emit_line<T: Serialize>(value: &T) {
    if let Ok(json) = serde_json::to_string(value) {
        println!("{}", json);
    }
}

/// Observer writing every queue event as a JSON line
///
/// Status updates are only written when they differ from the last one.
#[derive(Default)]
pub struct JsonLinesObserver {
    last_status: Mutex<Option<String>>,
}

impl QueueObserver for JsonLinesObserver {
    fn on_event(&self, event: &QueueEvent) {
        let Ok(json) = serde_json::to_string(event) else {
            return;
        };

        if matches!(event, QueueEvent::StatusChanged(_)) {
            let mut last = self.last_status.lock().unwrap_or_else(|e| e.into_inner());
            if last.as_deref() == Some(json.as_str()) {
                return;
            }
            *last = Some(json.clone());
        }

        let mut stdout = std::io::stdout().lock();
        let _ = writeln!(stdout, "{}", json);
        let _ = stdout.flush();
    }
}
