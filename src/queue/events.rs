use serde::Serialize;
use std::sync::{Arc, PoisonError, RwLock};
use strum_macros::Display;

use super::job::OutputPaths;

/// Summary of the job being processed right now
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentJob {
    pub id: String,
    pub group_label: String,
    pub base_name: String,
}

/// Counts and gates, published after every queue mutation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub has_api_key: bool,
    pub enabled: bool,
    pub is_processing: bool,
    pub current: Option<CurrentJob>,
}

impl QueueStatus {
    pub fn total(&self) -> usize {
        self.pending + self.processing + self.completed + self.failed
    }
}

/// Row of the failed-items listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedJob {
    pub id: String,
    pub group_label: String,
    pub base_name: String,
    pub error: Option<String>,
    pub retries: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum LogLevel {
    Info,
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueueEvent {
    StatusChanged(QueueStatus),
    Log {
        level: LogLevel,
        message: String,
    },
    JobCompleted {
        #[serde(rename = "jobId")]
        job_id: String,
        outputs: OutputPaths,
    },
}

/// Receives scheduler events
///
/// Called synchronously from the scheduler; implementations should return
/// quickly and never block on the queue itself.
pub trait QueueObserver: Send + Sync {
    fn on_event(&self, event: &QueueEvent);
}

impl<F> QueueObserver for F
where
    F: Fn(&QueueEvent) + Send + Sync,
{
    fn on_event(&self, event: &QueueEvent) {
        self(event)
    }
}

/// Fan-out to every subscribed observer
#[derive(Clone, Default)]
pub struct EventSink {
    observers: Arc<RwLock<Vec<Arc<dyn QueueObserver>>>>,
}

impl EventSink {
    pub fn subscribe(&self, observer: Arc<dyn QueueObserver>) {
        self.observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    pub fn emit(&self, event: &QueueEvent) {
        let observers = self.observers.read().unwrap_or_else(PoisonError::into_inner).clone();
        for observer in observers {
            observer.on_event(event);
        }
    }

    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.emit(&QueueEvent::Log {
            level,
            message: message.into(),
        });
    }
}

/// Forwards log events to `tracing`
pub struct TracingObserver;

impl QueueObserver for TracingObserver {
    fn on_event(&self, event: &QueueEvent) {
        match event {
            QueueEvent::Log { level: LogLevel::Error, message } => tracing::error!("{}", message),
            QueueEvent::Log { level: LogLevel::Warning, message } => tracing::warn!("{}", message),
            QueueEvent::Log { message, .. } => tracing::info!("{}", message),
            QueueEvent::StatusChanged(status) => tracing::debug!(
                pending = status.pending,
                processing = status.processing,
                completed = status.completed,
                failed = status.failed,
                "Queue status changed"
            ),
            QueueEvent::JobCompleted { job_id, outputs } => {
                tracing::info!(job_id = %job_id, outputs = outputs.len(), "Job completed")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_json_is_tagged() {
        let event = QueueEvent::Log {
            level: LogLevel::Warning,
            message: "retrying".to_string(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "log");
        assert_eq!(value["level"], "warning");

        let status = QueueEvent::StatusChanged(QueueStatus {
            pending: 1,
            ..QueueStatus::default()
        });
        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value["type"], "status_changed");
        assert_eq!(value["pending"], 1);
        assert_eq!(value["hasApiKey"], false);
    }

    #[test]
    fn test_sink_reaches_closures() {
        let seen = Arc::new(RwLock::new(Vec::new()));
        let sink = EventSink::default();
        let seen_clone = seen.clone();
        sink.subscribe(Arc::new(move |event: &QueueEvent| {
            if let QueueEvent::Log { message, .. } = event {
                seen_clone.write().unwrap().push(message.clone());
            }
        }));

        sink.log(LogLevel::Info, "first");
        sink.clone().log(LogLevel::Error, "second");
        assert_eq!(*seen.read().unwrap(), vec!["first".to_string(), "second".to_string()]);
    }
}
