//! In-memory backend for controller tests.
//!
//! Records every call and can be scripted to fail, so the daemons'
//! rollback behavior (no `last_applied` update, counters preserved)
//! is testable without a router.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::{QueueStats, Result, RouterBackend, RouterError};

/// One observed router call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    SetQueueLimit { queue: String, max_bps: u64 },
    ResetQueueCounters { queue: String },
    GetQueueStats { queue: String },
    EnableSteering,
    DisableSteering,
    TestConnection,
}

/// Scriptable recording backend.
#[derive(Default)]
pub struct RecordingBackend {
    calls: Mutex<Vec<Call>>,
    fail_writes: AtomicBool,
    fail_stats: AtomicBool,
    stats: Mutex<Option<QueueStats>>,
}

impl RecordingBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every mutating call fail with a retryable network error.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Make stats reads fail.
    pub fn set_fail_stats(&self, fail: bool) {
        self.fail_stats.store(fail, Ordering::SeqCst);
    }

    /// Queue stats returned by `get_queue_stats`.
    pub fn set_stats(&self, stats: Option<QueueStats>) {
        *self.stats.lock().unwrap() = stats;
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Count of calls that mutate router state.
    pub fn write_count(&self) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| {
                matches!(
                    c,
                    Call::SetQueueLimit { .. } | Call::EnableSteering | Call::DisableSteering
                )
            })
            .count()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    fn write_result(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            Err(RouterError::Network("injected failure".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl RouterBackend for RecordingBackend {
    async fn set_queue_limit(&self, queue: &str, max_bps: u64) -> Result<()> {
        self.record(Call::SetQueueLimit {
            queue: queue.to_string(),
            max_bps,
        });
        self.write_result()
    }

    async fn reset_queue_counters(&self, queue: &str) -> Result<()> {
        self.record(Call::ResetQueueCounters {
            queue: queue.to_string(),
        });
        self.write_result()
    }

    async fn get_queue_stats(&self, queue: &str) -> Result<Option<QueueStats>> {
        self.record(Call::GetQueueStats {
            queue: queue.to_string(),
        });
        if self.fail_stats.load(Ordering::SeqCst) {
            return Err(RouterError::Network("injected stats failure".into()));
        }
        Ok(*self.stats.lock().unwrap())
    }

    async fn enable_steering(&self) -> Result<()> {
        self.record(Call::EnableSteering);
        self.write_result()
    }

    async fn disable_steering(&self) -> Result<()> {
        self.record(Call::DisableSteering);
        self.write_result()
    }

    async fn test_connection(&self) -> Result<()> {
        self.record(Call::TestConnection);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_calls_in_order() {
        let backend = RecordingBackend::new();
        backend.set_queue_limit("dl", 1000).await.unwrap();
        backend.enable_steering().await.unwrap();
        assert_eq!(
            backend.calls(),
            vec![
                Call::SetQueueLimit {
                    queue: "dl".into(),
                    max_bps: 1000
                },
                Call::EnableSteering,
            ]
        );
        assert_eq!(backend.write_count(), 2);
    }

    #[tokio::test]
    async fn scripted_failure_surfaces() {
        let backend = RecordingBackend::new();
        backend.set_fail_writes(true);
        assert!(backend.set_queue_limit("dl", 1000).await.is_err());
        // The attempt is still recorded.
        assert_eq!(backend.call_count(), 1);
    }

    #[tokio::test]
    async fn stats_scripting() {
        let backend = RecordingBackend::new();
        assert_eq!(backend.get_queue_stats("dl").await.unwrap(), None);
        backend.set_stats(Some(QueueStats {
            drops: 5,
            queued_packets: 2,
            bytes: 100,
        }));
        let stats = backend.get_queue_stats("dl").await.unwrap().unwrap();
        assert_eq!(stats.drops, 5);
    }
}
