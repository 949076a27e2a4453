//! Plugin Bridge - Reconnecting command channel for plugin hosts
//!
//! Connects a plugin host to an automation server through a WebSocket relay.
//! Both sides send named commands over a shared channel and get correlated
//! results back; long-running commands stream progress.
//!
//! ## Architecture
//!
//! ```text
//! automation server ◄──► relay (ws://localhost:3055) ◄──► plugin-bridge ◄──► plugin host
//!                          channel "ab12cd34"              ChannelClient     CommandExecutor
//! ```
//!
//! - **channel**: connection, reconnection, request correlation, routing
//! - **delegate**: the boundary where commands are executed
//! - **progress**: progress events, sinks and the retaining hub
//!
//! ## Failure Model
//!
//! | Event                       | Outcome                                    |
//! |-----------------------------|--------------------------------------------|
//! | No response within timeout  | `Timeout` for that request only            |
//! | Counterparty reports error  | `Remote` for that request only             |
//! | Socket drops                | All pending rejected, reconnect with backoff |
//! | Reconnect attempts run out  | `failed` until a manual `reconnect()`      |

pub mod channel;
pub mod config;
pub mod delegate;
pub mod error;
pub mod progress;

// Re-exports
pub use channel::{ChannelClient, ClientConfig, ConnectionSnapshot, ConnectionStatus};
pub use config::Config;
pub use delegate::{CommandContext, CommandExecutor, CommandRegistry, ProgressReporter};
pub use error::{ChannelError, Result};
pub use progress::{ProgressEvent, ProgressHub, ProgressHubConfig, ProgressSink, ProgressStatus};
