//! Probe module for game server status.
//!
//! A probe never fails: transport and protocol errors are folded into the
//! offline variant of [`StatusSample`].

mod slp;
mod srv;

pub use slp::*;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Probe error types.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("network error: {0}")]
    Network(String),
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl From<std::io::Error> for ProbeError {
    fn from(e: std::io::Error) -> Self {
        ProbeError::Network(e.to_string())
    }
}

/// Fields reported by a server that answered the status query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnlineStatus {
    pub players: u32,
    pub max_players: u32,
    pub version: String,
    pub motd: String,
    pub ping_ms: u64,
}

/// Normalized result of one probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusSample {
    Online(OnlineStatus),
    Offline { error: String },
}

impl StatusSample {
    pub fn offline(error: impl Into<String>) -> Self {
        StatusSample::Offline { error: error.into() }
    }

    pub fn is_online(&self) -> bool {
        matches!(self, StatusSample::Online(_))
    }

    pub fn as_online(&self) -> Option<&OnlineStatus> {
        match self {
            StatusSample::Online(status) => Some(status),
            StatusSample::Offline { .. } => None,
        }
    }
}

/// Queries one server.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, host: &str, port: u16, timeout: Duration) -> StatusSample;
}

/// Prober speaking the Minecraft Java Server List Ping protocol.
#[derive(Debug, Clone, Default)]
pub struct MinecraftProber;

#[async_trait]
impl Prober for MinecraftProber {
    async fn probe(&self, host: &str, port: u16, timeout: Duration) -> StatusSample {
        // Add jitter so targets sharing a host don't fire in lockstep
        let jitter = rand::random::<u64>() % 100;
        tokio::time::sleep(Duration::from_millis(jitter)).await;

        match query_status(host, port, timeout).await {
            Ok(status) => StatusSample::Online(status),
            Err(e) => {
                tracing::error!("Status check failed for {}:{}: {}", host, port, e);
                StatusSample::offline(e.to_string())
            }
        }
    }
}
