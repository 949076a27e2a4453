//! Progress events for long-running commands
//!
//! Progress events are unsolicited updates about a command that is still in
//! flight. They share the command's id but never touch the pending request
//! table: a command can produce any number of progress events and, separately,
//! exactly one response.
//!
//! ## Architecture
//!
//! ```text
//! Router (progress_update / command_progress frames)
//!     │
//!     ├─► ProgressSink (any Fn(ProgressEvent) or the ProgressHub)
//!     │
//!     └─► ProgressHub (broadcast + latest state per command)
//!              │
//!              └─► subscribers (status lines, UIs, logs)
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Lifecycle stage reported by a progress event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    Started,
    InProgress,
    Completed,
    Error,
}

impl ProgressStatus {
    /// Whether no further events are expected for the command.
    pub fn is_terminal(self) -> bool {
        matches!(self, ProgressStatus::Completed | ProgressStatus::Error)
    }
}

/// One progress update, as carried in the `data` of a progress frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub command_id: String,
    #[serde(default)]
    pub command_type: String,
    pub status: ProgressStatus,
    /// Percentage, 0-100
    #[serde(default)]
    pub progress: u8,
    #[serde(default)]
    pub total_items: u64,
    #[serde(default)]
    pub processed_items: u64,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_chunk: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_chunks: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_size: Option<u32>,
    /// Optional command-specific detail
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    /// Milliseconds since the Unix epoch
    #[serde(default)]
    pub timestamp: i64,
}

impl ProgressEvent {
    /// Create an event stamped with the current time.
    ///
    /// `progress` is clamped to 100.
    pub fn new(
        command_id: impl Into<String>,
        command_type: impl Into<String>,
        status: ProgressStatus,
        progress: u8,
        message: impl Into<String>,
    ) -> Self {
        Self {
            command_id: command_id.into(),
            command_type: command_type.into(),
            status,
            progress: progress.min(100),
            total_items: 0,
            processed_items: 0,
            message: message.into(),
            current_chunk: None,
            total_chunks: None,
            chunk_size: None,
            payload: None,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn with_items(mut self, processed: u64, total: u64) -> Self {
        self.processed_items = processed;
        self.total_items = total;
        self
    }

    pub fn with_chunks(mut self, current: u32, total: u32, size: u32) -> Self {
        self.current_chunk = Some(current);
        self.total_chunks = Some(total);
        self.chunk_size = Some(size);
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

/// Receiver of progress events.
///
/// Delivery happens on the connection task, so implementations must not block.
pub trait ProgressSink: Send + Sync {
    fn deliver(&self, event: ProgressEvent);
}

impl<F> ProgressSink for F
where
    F: Fn(ProgressEvent) + Send + Sync,
{
    fn deliver(&self, event: ProgressEvent) {
        self(event)
    }
}

/// Configuration for the progress hub
#[derive(Debug, Clone)]
pub struct ProgressHubConfig {
    /// How long to retain finished commands (default: 5 minutes)
    pub retention: Duration,
    /// Broadcast channel capacity (default: 256)
    pub channel_capacity: usize,
}

impl Default for ProgressHubConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(300),
            channel_capacity: 256,
        }
    }
}

struct TrackedCommand {
    latest: ProgressEvent,
    finished_at: Option<Instant>,
}

/// Broadcasts progress to subscribers and keeps the latest event per command.
pub struct ProgressHub {
    config: ProgressHubConfig,
    progress_tx: broadcast::Sender<ProgressEvent>,
    commands: Arc<RwLock<HashMap<String, TrackedCommand>>>,
}

impl ProgressHub {
    pub fn new(config: ProgressHubConfig) -> Self {
        let (progress_tx, _) = broadcast::channel(config.channel_capacity.max(1));
        info!("ProgressHub initialized");
        Self {
            config,
            progress_tx,
            commands: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Subscribe to every future progress event
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.progress_tx.subscribe()
    }

    /// Latest event seen for a command, if it is still retained
    pub fn latest(&self, command_id: &str) -> Option<ProgressEvent> {
        let commands = self.commands.read().unwrap_or_else(|e| e.into_inner());
        commands.get(command_id).map(|c| c.latest.clone())
    }

    /// Latest events of commands that have not finished yet
    pub fn active(&self) -> Vec<ProgressEvent> {
        let commands = self.commands.read().unwrap_or_else(|e| e.into_inner());
        commands
            .values()
            .filter(|c| c.finished_at.is_none())
            .map(|c| c.latest.clone())
            .collect()
    }

    /// Drop finished commands older than the retention period.
    ///
    /// Returns the number removed.
    pub fn prune_expired(&self) -> usize {
        let retention = self.config.retention;
        let mut commands = self.commands.write().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let before = commands.len();
        commands.retain(|_, c| match c.finished_at {
            Some(finished) => now.duration_since(finished) < retention,
            None => true,
        });
        let removed = before - commands.len();
        if removed > 0 {
            debug!(removed = removed, "Pruned finished commands from ProgressHub");
        }
        removed
    }

    fn track(&self, event: &ProgressEvent) {
        let mut commands = self.commands.write().unwrap_or_else(|e| e.into_inner());
        let finished_at = event.status.is_terminal().then(Instant::now);
        commands.insert(
            event.command_id.clone(),
            TrackedCommand {
                latest: event.clone(),
                finished_at,
            },
        );
    }
}

impl ProgressSink for ProgressHub {
    fn deliver(&self, event: ProgressEvent) {
        self.prune_expired();
        self.track(&event);
        debug!(
            command_id = %event.command_id,
            status = ?event.status,
            progress = event.progress,
            "Progress event"
        );
        if self.progress_tx.receiver_count() > 0 {
            let _ = self.progress_tx.send(event);
        }
    }
}
