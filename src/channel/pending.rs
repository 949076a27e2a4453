//! Pending Request Table
//!
//! Single responsibility: Correlate outbound requests with their single outcome.
//!
//! Every entry is retired by exactly one of: a matching response, a matching
//! error, its timeout, or a connection-wide rejection. Retirement is a single
//! `DashMap::remove`, so whichever path removes the entry first wins and every
//! later path finds nothing and does nothing.

use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::{ChannelError, Result};

/// Default per-request timeout
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

struct PendingEntry {
    created_at: Instant,
    response_tx: oneshot::Sender<Result<Value>>,
    timeout_task: Option<JoinHandle<()>>,
}

/// Shared table of in-flight requests, keyed by request id.
#[derive(Clone, Default)]
pub struct PendingTable {
    entries: Arc<DashMap<String, PendingEntry>>,
}

/// The caller's side of a pending request.
pub struct PendingResponse {
    id: String,
    response_rx: oneshot::Receiver<Result<Value>>,
}

impl PendingResponse {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait for the outcome of the request.
    pub async fn wait(self) -> Result<Value> {
        match self.response_rx.await {
            Ok(result) => result,
            // The table was dropped along with the connection task
            Err(_) => Err(ChannelError::Closed),
        }
    }
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request and arm its timeout.
    ///
    /// Must be called from within a tokio runtime.
    pub fn register(&self, id: impl Into<String>, timeout: Duration) -> PendingResponse {
        let id = id.into();
        let (response_tx, response_rx) = oneshot::channel();

        let stale = self.entries.insert(
            id.clone(),
            PendingEntry {
                created_at: Instant::now(),
                response_tx,
                timeout_task: None,
            },
        );
        if let Some(stale) = stale {
            // A reused id supersedes the older request
            if let Some(task) = stale.timeout_task {
                task.abort();
            }
            let _ = stale
                .response_tx
                .send(Err(ChannelError::Superseded { id: id.clone() }));
        }

        let table = self.clone();
        let timer_id = id.clone();
        let timeout_task = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if table.retire(
                &timer_id,
                Err(ChannelError::Timeout {
                    id: timer_id.clone(),
                    after: timeout,
                }),
                false,
            ) {
                debug!(id = %timer_id, timeout_ms = timeout.as_millis() as u64, "Request timed out");
            }
        });

        match self.entries.get_mut(&id) {
            Some(mut entry) => entry.timeout_task = Some(timeout_task),
            // Settled before the timer was attached
            None => timeout_task.abort(),
        }

        PendingResponse { id, response_rx }
    }

    /// Resolve a request with its result. Returns false if the id is not pending.
    pub fn resolve(&self, id: &str, result: Value) -> bool {
        self.retire(id, Ok(result), true)
    }

    /// Reject a request. Returns false if the id is not pending.
    pub fn reject(&self, id: &str, error: ChannelError) -> bool {
        self.retire(id, Err(error), true)
    }

    /// Reject every pending request, building a fresh error for each.
    ///
    /// Returns the number of requests rejected.
    pub fn reject_all(&self, make_error: impl Fn() -> ChannelError) -> usize {
        let ids: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        ids.iter()
            .filter(|id| self.retire(id, Err(make_error()), true))
            .count()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// How long a request has been waiting
    pub fn age(&self, id: &str) -> Option<Duration> {
        self.entries.get(id).map(|e| e.created_at.elapsed())
    }

    fn retire(&self, id: &str, outcome: Result<Value>, cancel_timer: bool) -> bool {
        match self.entries.remove(id) {
            Some((_, entry)) => {
                if cancel_timer {
                    if let Some(task) = entry.timeout_task {
                        task.abort();
                    }
                }
                // The caller may have stopped waiting; that is not an error
                let _ = entry.response_tx.send(outcome);
                true
            }
            None => false,
        }
    }
}
