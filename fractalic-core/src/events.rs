//! Progress events streamed during a run
//!
//! The engine publishes one event per notable step (operation dispatch,
//! tool call, LLM turn, snapshot). Consumers such as the HTTP façade's
//! streaming endpoint subscribe through the `ProgressSink` trait; the CLI
//! installs a logging sink.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

/// Execution stage an event belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Setup,
    Parse,
    Execute,
    LlmTurn,
    ToolCall,
    Snapshot,
    Complete,
    Failed,
}

/// One progress event, shaped for the streaming surface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub stage: Stage,
    /// 0.0 to 1.0, a coarse estimate of run completion
    pub progress: f64,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn new(stage: Stage, progress: f64, message: impl Into<String>) -> Self {
        Self {
            stage,
            progress: progress.clamp(0.0, 1.0),
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Consumer of progress events
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn publish(&self, event: ProgressEvent);
}

/// Sink that forwards events to tracing
#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait]
impl ProgressSink for LogSink {
    async fn publish(&self, event: ProgressEvent) {
        tracing::info!(
            stage = ?event.stage,
            progress = event.progress,
            "{}",
            event.message
        );
    }
}

/// Sink that drops every event
#[derive(Debug, Default)]
pub struct NullSink;

#[async_trait]
impl ProgressSink for NullSink {
    async fn publish(&self, _event: ProgressEvent) {}
}

/// Sink that buffers events in memory, used by tests and by consumers
/// that drain events on their own schedule
#[derive(Debug, Default)]
pub struct BufferSink {
    events: Mutex<Vec<ProgressEvent>>,
}

impl BufferSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn drain(&self) -> Vec<ProgressEvent> {
        self.events.lock().map(|mut e| e.split_off(0)).unwrap_or_default()
    }
}

#[async_trait]
impl ProgressSink for BufferSink {
    async fn publish(&self, event: ProgressEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
