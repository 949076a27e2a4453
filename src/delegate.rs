//! Execution delegate boundary
//!
//! The channel never interprets commands. Inbound command frames are handed to
//! a [`CommandExecutor`] as an opaque name plus parameters, and whatever comes
//! back (a result, an error, or a panic) is relayed to the counterparty.
//!
//! [`CommandRegistry`] is the name→handler dispatch table most hosts want:
//!
//! ```ignore
//! let registry = CommandRegistry::new()
//!     .register("get_selection", |_ctx, _params| async move { Ok(json!([])) });
//! ```

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::progress::{ProgressEvent, ProgressSink, ProgressStatus};

/// Per-invocation context handed to executors.
#[derive(Clone)]
pub struct CommandContext {
    pub id: String,
    pub command: String,
    pub progress: ProgressReporter,
}

/// Emits progress events for one command.
#[derive(Clone)]
pub struct ProgressReporter {
    command_id: String,
    command_type: String,
    sink: Arc<dyn ProgressSink>,
}

impl ProgressReporter {
    pub fn new(
        command_id: impl Into<String>,
        command_type: impl Into<String>,
        sink: Arc<dyn ProgressSink>,
    ) -> Self {
        Self {
            command_id: command_id.into(),
            command_type: command_type.into(),
            sink,
        }
    }

    /// Start an event for this command, to be finished with the builder
    /// methods on [`ProgressEvent`] and passed to [`ProgressReporter::emit`].
    pub fn event(&self, status: ProgressStatus, progress: u8, message: impl Into<String>) -> ProgressEvent {
        ProgressEvent::new(&self.command_id, &self.command_type, status, progress, message)
    }

    pub fn emit(&self, event: ProgressEvent) {
        self.sink.deliver(event);
    }

    pub fn report(&self, status: ProgressStatus, progress: u8, message: impl Into<String>) {
        self.emit(self.event(status, progress, message));
    }
}

/// The host-side executor of named commands.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Execute `ctx.command` with `params`.
    ///
    /// The error string is relayed verbatim to the caller.
    async fn execute(&self, ctx: CommandContext, params: Value) -> Result<Value, String>;
}

type Handler = Arc<dyn Fn(CommandContext, Value) -> BoxFuture<'static, Result<Value, String>> + Send + Sync>;

/// Name→handler dispatch table.
#[derive(Clone, Default)]
pub struct CommandRegistry {
    handlers: HashMap<String, Handler>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `name`, replacing any previous handler.
    pub fn register<F, Fut>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(CommandContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, String>> + Send + 'static,
    {
        let boxed: Handler =
            Arc::new(move |ctx: CommandContext, params: Value| handler(ctx, params).boxed());
        self.handlers.insert(name.into(), boxed);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Registered command names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// A registry with the diagnostic commands `ping`, `echo` and `count`.
    pub fn with_builtins() -> Self {
        Self::new()
            .register("ping", |_ctx, _params| async move {
                Ok(json!({ "pong": true, "timestamp": chrono::Utc::now().timestamp_millis() }))
            })
            .register("echo", |_ctx, params| async move { Ok(params) })
            .register("count", count_command)
    }
}

#[async_trait]
impl CommandExecutor for CommandRegistry {
    async fn execute(&self, ctx: CommandContext, params: Value) -> Result<Value, String> {
        let handler = self
            .handlers
            .get(&ctx.command)
            .cloned()
            .ok_or_else(|| format!("Unknown command: {}", ctx.command))?;
        handler(ctx, params).await
    }
}

/// Counts to `params.total`, reporting progress every `params.chunk` items.
async fn count_command(ctx: CommandContext, params: Value) -> Result<Value, String> {
    let total = params.get("total").and_then(Value::as_u64).unwrap_or(10);
    let chunk = params.get("chunk").and_then(Value::as_u64).unwrap_or(1).max(1);
    let delay = Duration::from_millis(params.get("delay_ms").and_then(Value::as_u64).unwrap_or(0));
    let total_chunks = u32::try_from(total.div_ceil(chunk)).unwrap_or(u32::MAX);
    let chunk_size = u32::try_from(chunk).unwrap_or(u32::MAX);

    ctx.progress.emit(
        ctx.progress
            .event(ProgressStatus::Started, 0, format!("Counting to {}", total))
            .with_items(0, total),
    );

    let mut processed = 0u64;
    let mut current_chunk = 0u32;
    while processed < total {
        processed = (processed + chunk).min(total);
        current_chunk += 1;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let percent = u8::try_from(processed * 100 / total).unwrap_or(100);
        ctx.progress.emit(
            ctx.progress
                .event(
                    ProgressStatus::InProgress,
                    percent,
                    format!("Counted {} of {}", processed, total),
                )
                .with_items(processed, total)
                .with_chunks(current_chunk, total_chunks, chunk_size),
        );
    }

    ctx.progress.emit(
        ctx.progress
            .event(ProgressStatus::Completed, 100, "Done")
            .with_items(total, total),
    );
    Ok(json!({ "counted": total }))
}
