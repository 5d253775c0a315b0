//! Process-wide cooperative shutdown.
//!
//! One watch channel per process. Signal tasks only flip the flag —
//! no logging, no I/O — and every loop observes it between units of
//! work or during its timed sleep.

use std::time::Duration;

use tokio::sync::watch;

/// Sender half, owned by `main`.
pub struct ShutdownHandle {
    tx: watch::Sender<bool>,
}

impl ShutdownHandle {
    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }

    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }
}

/// Cloneable receiver half, threaded through constructors.
#[derive(Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn is_shutdown(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait until shutdown fires.
    pub async fn wait(&mut self) {
        // Err means the sender is gone — treat as shutdown.
        while !*self.rx.borrow_and_update() {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Sleep for `dur`, waking early on shutdown. Returns true if
    /// shutdown fired.
    pub async fn sleep(&mut self, dur: Duration) -> bool {
        if self.is_shutdown() {
            return true;
        }
        let mut rx = self.rx.clone();
        let shutdown_seen = async move {
            while !*rx.borrow_and_update() {
                if rx.changed().await.is_err() {
                    break;
                }
            }
        };
        tokio::select! {
            _ = tokio::time::sleep(dur) => self.is_shutdown(),
            _ = shutdown_seen => true,
        }
    }
}

/// Create the shutdown pair.
pub fn shutdown_pair() -> (ShutdownHandle, ShutdownSignal) {
    let (tx, rx) = watch::channel(false);
    (ShutdownHandle { tx }, ShutdownSignal { rx })
}

/// Spawn the signal listeners (SIGINT + SIGTERM). The handlers do
/// nothing but set the flag; callers log the shutdown from the main loop.
pub fn install_signal_handlers(handle: &ShutdownHandle) {
    let tx = handle.tx.clone();
    tokio::spawn(async move {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(s) => s,
                Err(_) => return,
            };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
        let _ = tx.send(true);
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn trigger_flips_flag() {
        let (handle, signal) = shutdown_pair();
        assert!(!signal.is_shutdown());
        handle.trigger();
        assert!(signal.is_shutdown());
    }

    #[tokio::test]
    async fn sleep_returns_false_without_shutdown() {
        let (_handle, mut signal) = shutdown_pair();
        let fired = signal.sleep(Duration::from_millis(5)).await;
        assert!(!fired);
    }

    #[tokio::test]
    async fn sleep_wakes_early_on_shutdown() {
        let (handle, mut signal) = shutdown_pair();
        let start = std::time::Instant::now();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            handle.trigger();
        });
        let fired = signal.sleep(Duration::from_secs(30)).await;
        assert!(fired);
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn wait_completes_after_trigger() {
        let (handle, mut signal) = shutdown_pair();
        handle.trigger();
        signal.wait().await;
    }
}
