//! RouterOS SSH CLI transport.
//!
//! Key-based auth only. One persistent SSH connection per backend:
//! a ControlMaster process owns the transport, and each command runs
//! through its control socket, so the TCP/SSH handshake is paid once.
//! If the master is found dead before a command, it is respawned.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use wanctl_common::config::RouterConfig;
use wanctl_common::retry::{retry_with_backoff, RetryPolicy};

use crate::{QueueStats, Result, RouterBackend, RouterError};

pub struct SshBackend {
    destination: String,
    key_path: PathBuf,
    control_path: PathBuf,
    timeout: Duration,
    steering_comment: String,
    retry: RetryPolicy,
    master: Mutex<Option<Child>>,
}

impl SshBackend {
    pub fn new(cfg: &RouterConfig) -> Result<Self> {
        let key_path = cfg
            .ssh_key
            .clone()
            .ok_or_else(|| RouterError::Auth("router.ssh_key not configured".into()))?;
        let control_path =
            std::env::temp_dir().join(format!("wanctl-ssh-{}-{}", cfg.host, std::process::id()));
        Ok(SshBackend {
            destination: format!("{}@{}", cfg.user, cfg.host),
            key_path,
            control_path,
            timeout: cfg.timeout,
            steering_comment: cfg.steering_comment.clone(),
            retry: RetryPolicy::default(),
            master: Mutex::new(None),
        })
    }

    fn base_args(&self) -> Vec<String> {
        vec![
            "-o".into(),
            "BatchMode=yes".into(),
            "-o".into(),
            "StrictHostKeyChecking=accept-new".into(),
            "-o".into(),
            format!("ConnectTimeout={}", self.timeout.as_secs().max(1)),
            "-i".into(),
            self.key_path.display().to_string(),
            "-S".into(),
            self.control_path.display().to_string(),
        ]
    }

    /// Make sure the master connection is alive, respawning if needed.
    async fn ensure_master(&self) -> Result<()> {
        let mut master = self.master.lock().await;

        if master.is_some() && self.master_alive().await {
            return Ok(());
        }

        if let Some(mut old) = master.take() {
            let _ = old.kill().await;
        }

        let mut cmd = Command::new("ssh");
        cmd.args(self.base_args())
            .arg("-M")
            .arg("-N")
            .arg(&self.destination)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        let child = cmd
            .spawn()
            .map_err(|e| RouterError::Transport(format!("cannot spawn ssh master: {e}")))?;
        *master = Some(child);
        drop(master);

        // Wait for the control socket to come up.
        let deadline = tokio::time::Instant::now() + self.timeout;
        loop {
            if self.master_alive().await {
                tracing::debug!(dest = %self.destination, "ssh master established");
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(RouterError::Transport(format!(
                    "ssh master to {} did not come up within {:?}",
                    self.destination, self.timeout
                )));
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    async fn master_alive(&self) -> bool {
        let status = Command::new("ssh")
            .arg("-S")
            .arg(&self.control_path)
            .arg("-O")
            .arg("check")
            .arg(&self.destination)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        matches!(status, Ok(s) if s.success())
    }

    /// Run one RouterOS CLI command over the shared transport.
    async fn run(&self, command: &str) -> Result<String> {
        self.ensure_master().await?;

        let output = tokio::time::timeout(
            self.timeout + Duration::from_secs(2),
            Command::new("ssh")
                .args(self.base_args())
                .arg(&self.destination)
                .arg(command)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| RouterError::Transport(format!("command timed out: {command}")))?
        .map_err(|e| RouterError::Transport(format!("cannot run ssh: {e}")))?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        if !output.status.success() {
            let code = output.status.code().unwrap_or(-1);
            // 255 is ssh's own transport failure, not the remote command.
            if code == 255 {
                return Err(RouterError::Transport(stderr.trim().to_string()));
            }
            return Err(RouterError::Command {
                code,
                stderr: stderr.trim().to_string(),
            });
        }
        // RouterOS reports bad syntax/lookup failures on stdout with
        // a zero exit in some versions.
        if stdout.contains("no such item") || stdout.contains("syntax error") {
            return Err(RouterError::Protocol(stdout.trim().to_string()));
        }
        Ok(stdout)
    }
}

#[async_trait]
impl RouterBackend for SshBackend {
    async fn set_queue_limit(&self, queue: &str, max_bps: u64) -> Result<()> {
        let command =
            format!("/queue tree set [find name=\"{queue}\"] max-limit={max_bps}");
        retry_with_backoff(self.retry, RouterError::is_retryable, |_| {
            let command = command.clone();
            async move { self.run(&command).await.map(|_| ()) }
        })
        .await
    }

    async fn reset_queue_counters(&self, queue: &str) -> Result<()> {
        let command = format!("/queue tree reset-counters [find name=\"{queue}\"]");
        retry_with_backoff(self.retry, RouterError::is_retryable, |_| {
            let command = command.clone();
            async move { self.run(&command).await.map(|_| ()) }
        })
        .await
    }

    async fn get_queue_stats(&self, queue: &str) -> Result<Option<QueueStats>> {
        let command = format!("/queue tree print detail where name=\"{queue}\"");
        let output = retry_with_backoff(self.retry, RouterError::is_retryable, |_| {
            let command = command.clone();
            async move { self.run(&command).await }
        })
        .await?;
        Ok(parse_queue_stats(&output))
    }

    async fn enable_steering(&self) -> Result<()> {
        // RouterOS enable of an already-enabled rule is a no-op success.
        let command = format!(
            "/ip firewall mangle enable [find comment=\"{}\"]",
            self.steering_comment
        );
        retry_with_backoff(self.retry, RouterError::is_retryable, |_| {
            let command = command.clone();
            async move { self.run(&command).await.map(|_| ()) }
        })
        .await
    }

    async fn disable_steering(&self) -> Result<()> {
        let command = format!(
            "/ip firewall mangle disable [find comment=\"{}\"]",
            self.steering_comment
        );
        retry_with_backoff(self.retry, RouterError::is_retryable, |_| {
            let command = command.clone();
            async move { self.run(&command).await.map(|_| ()) }
        })
        .await
    }

    async fn test_connection(&self) -> Result<()> {
        self.run("/system resource print").await.map(|_| ())
    }

    async fn close(&self) {
        let mut master = self.master.lock().await;
        if let Some(mut child) = master.take() {
            let _ = Command::new("ssh")
                .arg("-S")
                .arg(&self.control_path)
                .arg("-O")
                .arg("exit")
                .arg(&self.destination)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await;
            let _ = child.kill().await;
        }
    }
}

/// Parse `/queue tree print detail` output.
///
/// The detail listing is `key=value` pairs; byte/packet pairs print
/// as `bytes=123/456` (upload/download legs share an entry on some
/// configurations) — the first number is taken.
fn parse_queue_stats(output: &str) -> Option<QueueStats> {
    if output.trim().is_empty() {
        return None;
    }
    let field = |name: &str| -> Option<u64> {
        let re = Regex::new(&format!(r"{name}=([0-9]+)")).ok()?;
        re.captures(output)?.get(1)?.as_str().parse().ok()
    };
    let drops = field("dropped").or_else(|| field("drops"))?;
    Some(QueueStats {
        drops,
        queued_packets: field("queued-packets").unwrap_or(0),
        bytes: field("bytes").unwrap_or(0),
    })
}
