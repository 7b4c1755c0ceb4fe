pub mod config;
mod connection;
pub mod endpoint;
mod manager;
pub mod policy;

pub use config::{ExhaustionPolicy, StreamConfig};
pub use manager::{spawn_transport, ConnectionState, StreamCommand, StreamEvent, StreamHandle};
pub use policy::{Backoff, ConnectionStatus, NextAttempt, RetryBudget, TransportMode, TransportSelector};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid endpoint url: {0}")]
    Url(String),
    #[error("socket connect failed: {0}")]
    SocketConnect(String),
    #[error("push stream request failed: {0}")]
    PushStreamRequest(String),
    #[error("push stream rejected with status {0}")]
    PushStreamStatus(u16),
    #[error("send failed: {0}")]
    Send(String),
    #[error("transport manager stopped")]
    ChannelClosed,
}
