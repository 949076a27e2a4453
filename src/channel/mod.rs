//! Reconnecting Command Channel
//!
//! A WebSocket connection to a relay server, joined to one named channel,
//! that carries request/response commands in both directions.
//!
//! # Architecture
//!
//! | Module      | Responsibility                                        |
//! |-------------|-------------------------------------------------------|
//! | `backoff`   | Reconnect delay policy                                |
//! | `protocol`  | JSON frame encoding and classification                |
//! | `pending`   | Outstanding requests, timeouts, exactly-once settling |
//! | `state`     | Connection state machine (no I/O)                     |
//! | `router`    | Inbound frame dispatch                                |
//! | `transport` | WebSocket connect/send/receive                        |
//! | `client`    | Public handle and the connection task behind it       |
//!
//! # Key Design Principles
//!
//! ## 1. One Owner for the Socket
//!
//! - The connection task owns the socket, the reconnect timer and the state
//!   machine
//! - Callers talk to it through channels, never shared flags
//! - At most one reconnect timer exists at any time
//!
//! ## 2. A Channel Only Exists While Connected
//!
//! - `ConnectionStatus::Connected` carries the channel name
//! - `send()` checks for it and fails with `NotConnected` otherwise
//!
//! ## 3. Every Request Settles Exactly Once
//!
//! - Response, remote error, timeout, or connection-wide rejection
//! - Whichever comes first removes the entry; later outcomes are dropped
//!
//! # Usage
//!
//! ```ignore
//! use plugin_bridge::channel::{ChannelClient, ClientConfig};
//!
//! let client = ChannelClient::builder(ClientConfig::default())
//!     .executor(Arc::new(CommandRegistry::with_builtins()))
//!     .spawn();
//!
//! let channel = client.connect().await?;
//! let result = client.send("get_document_info", json!({})).await?;
//! ```

pub mod protocol;
mod router;
mod transport;

pub mod backoff;
pub mod client;
pub mod pending;
pub mod state;

pub use backoff::BackoffPolicy;
pub use client::{
    ChannelClient, ChannelClientBuilder, ClientConfig, ConnectionSnapshot, DEFAULT_SERVER_URL,
};
pub use pending::{PendingResponse, PendingTable, DEFAULT_REQUEST_TIMEOUT};
pub use protocol::{generate_channel_name, CHANNEL_NAME_LEN, JOIN_REJECTED};
pub use state::{ConnectionStatus, DEFAULT_MAX_RECONNECT_ATTEMPTS};
