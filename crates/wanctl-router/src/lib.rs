//! Router backend abstraction.
//!
//! The daemons talk to the router through [`RouterBackend`]; the
//! concrete transport (RouterOS REST or SSH CLI) is picked by config
//! at startup. Both implementations cache resolved resource IDs,
//! retry transient failures with jittered backoff, and report
//! idempotent success when the target is already in the requested
//! state.

pub mod rest;
pub mod ssh;
pub mod testing;

use async_trait::async_trait;

use wanctl_common::config::{RouterConfig, Transport};

/// Failure taxonomy. Retryable kinds (network, transport, 5xx) are
/// re-attempted by the built-in backoff; permanent kinds (4xx, auth,
/// missing resources, protocol violations) fail straight through.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("network error: {0}")]
    Network(String),
    #[error("router returned HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("{kind} \"{name}\" not found on router")]
    NotFound { kind: &'static str, name: String },
    #[error("unexpected router response: {0}")]
    Protocol(String),
    #[error("ssh transport error: {0}")]
    Transport(String),
    #[error("remote command failed (exit {code}): {stderr}")]
    Command { code: i32, stderr: String },
}

impl RouterError {
    pub fn is_retryable(&self) -> bool {
        match self {
            RouterError::Network(_) | RouterError::Transport(_) => true,
            RouterError::Http { status, .. } => *status >= 500,
            RouterError::Auth(_)
            | RouterError::NotFound { .. }
            | RouterError::Protocol(_)
            | RouterError::Command { .. } => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, RouterError>;

/// CAKE queue statistics as read from the router.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Cumulative dropped packets.
    pub drops: u64,
    /// Packets currently queued.
    pub queued_packets: u64,
    /// Cumulative bytes through the queue.
    pub bytes: u64,
}

/// Transport-agnostic router operations.
///
/// Callers treat any error as "do not update last-applied state"; the
/// backend has already exhausted its retry budget by the time an
/// error surfaces.
#[async_trait]
pub trait RouterBackend: Send + Sync {
    /// Set a queue-tree entry's max-limit in bits/sec.
    async fn set_queue_limit(&self, queue: &str, max_bps: u64) -> Result<()>;

    /// Reset a queue's packet/byte counters. Backends without counter
    /// reset report success.
    async fn reset_queue_counters(&self, _queue: &str) -> Result<()> {
        Ok(())
    }

    /// Read queue statistics; `None` when the transport cannot expose them.
    async fn get_queue_stats(&self, queue: &str) -> Result<Option<QueueStats>>;

    /// Enable the steer-away mangle rule (diverts traffic to the
    /// secondary WAN). Success if already enabled.
    async fn enable_steering(&self) -> Result<()>;

    /// Disable the steer-away mangle rule. Success if already disabled.
    async fn disable_steering(&self) -> Result<()>;

    /// Lightweight liveness probe.
    async fn test_connection(&self) -> Result<()>;

    /// Release the transport handle.
    async fn close(&self) {}
}

#[async_trait]
impl<T: RouterBackend + ?Sized> RouterBackend for std::sync::Arc<T> {
    async fn set_queue_limit(&self, queue: &str, max_bps: u64) -> Result<()> {
        (**self).set_queue_limit(queue, max_bps).await
    }
    async fn reset_queue_counters(&self, queue: &str) -> Result<()> {
        (**self).reset_queue_counters(queue).await
    }
    async fn get_queue_stats(&self, queue: &str) -> Result<Option<QueueStats>> {
        (**self).get_queue_stats(queue).await
    }
    async fn enable_steering(&self) -> Result<()> {
        (**self).enable_steering().await
    }
    async fn disable_steering(&self) -> Result<()> {
        (**self).disable_steering().await
    }
    async fn test_connection(&self) -> Result<()> {
        (**self).test_connection().await
    }
    async fn close(&self) {
        (**self).close().await
    }
}

/// Build the backend selected by `router.transport`.
pub fn backend_for(cfg: &RouterConfig) -> Result<Box<dyn RouterBackend>> {
    match cfg.transport {
        Transport::Rest => Ok(Box::new(rest::RestBackend::new(cfg)?)),
        Transport::Ssh => Ok(Box::new(ssh::SshBackend::new(cfg)?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_taxonomy() {
        assert!(RouterError::Network("timeout".into()).is_retryable());
        assert!(RouterError::Transport("broken pipe".into()).is_retryable());
        assert!(RouterError::Http {
            status: 503,
            body: String::new()
        }
        .is_retryable());
        assert!(!RouterError::Http {
            status: 404,
            body: String::new()
        }
        .is_retryable());
        assert!(!RouterError::Auth("bad credentials".into()).is_retryable());
        assert!(!RouterError::NotFound {
            kind: "queue",
            name: "wan1".into()
        }
        .is_retryable());
    }
}
