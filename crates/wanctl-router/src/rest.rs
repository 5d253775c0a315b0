//! RouterOS REST transport.
//!
//! HTTPS with Basic auth; the router's self-signed certificate is
//! tolerated. Resource IDs (queue-tree entries, the steer-away
//! mangle rule) are resolved by name/comment once and cached for the
//! life of the backend.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Mutex;

use wanctl_common::config::RouterConfig;
use wanctl_common::retry::{retry_with_backoff, RetryPolicy};

use crate::{QueueStats, Result, RouterBackend, RouterError};

pub struct RestBackend {
    client: reqwest::Client,
    base_url: String,
    user: String,
    password: String,
    steering_comment: String,
    retry: RetryPolicy,
    /// name/comment → RouterOS ".id", populated on first use.
    ids: Mutex<HashMap<String, String>>,
}

impl RestBackend {
    pub fn new(cfg: &RouterConfig) -> Result<Self> {
        let password_env = cfg
            .password_env
            .as_deref()
            .ok_or_else(|| RouterError::Auth("router.password_env not configured".into()))?;
        let password = std::env::var(password_env).map_err(|_| {
            RouterError::Auth(format!("environment variable {password_env} is not set"))
        })?;

        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .connect_timeout(Duration::from_secs(5))
            .timeout(cfg.timeout.max(Duration::from_secs(10)))
            .build()
            .map_err(|e| RouterError::Network(e.to_string()))?;

        Ok(RestBackend {
            client,
            base_url: format!("https://{}/rest", cfg.host),
            user: cfg.user.clone(),
            password,
            steering_comment: cfg.steering_comment.clone(),
            retry: RetryPolicy::default(),
            ids: Mutex::new(HashMap::new()),
        })
    }

    async fn get(&self, path: &str, query: &[(&str, &str)]) -> Result<Value> {
        let url = format!("{}{path}", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(query)
            .basic_auth(&self.user, Some(&self.password))
            .send()
            .await
            .map_err(|e| RouterError::Network(e.to_string()))?;
        Self::decode(response).await
    }

    async fn patch(&self, path: &str, body: Value) -> Result<Value> {
        let url = format!("{}{path}", self.base_url);
        let response = self
            .client
            .patch(&url)
            .basic_auth(&self.user, Some(&self.password))
            .json(&body)
            .send()
            .await
            .map_err(|e| RouterError::Network(e.to_string()))?;
        Self::decode(response).await
    }

    async fn post(&self, path: &str) -> Result<Value> {
        let url = format!("{}{path}", self.base_url);
        let response = self
            .client
            .post(&url)
            .basic_auth(&self.user, Some(&self.password))
            .json(&json!({}))
            .send()
            .await
            .map_err(|e| RouterError::Network(e.to_string()))?;
        Self::decode(response).await
    }

    async fn decode(response: reqwest::Response) -> Result<Value> {
        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(RouterError::Auth(format!("router rejected credentials ({status})")));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RouterError::Http {
                status: status.as_u16(),
                body,
            });
        }
        if status == reqwest::StatusCode::NO_CONTENT {
            return Ok(Value::Null);
        }
        let text = response
            .text()
            .await
            .map_err(|e| RouterError::Network(e.to_string()))?;
        if text.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|e| RouterError::Protocol(e.to_string()))
    }

    /// Resolve a queue-tree entry's `.id` by name, consulting the cache first.
    async fn queue_id(&self, name: &str) -> Result<String> {
        let key = format!("queue:{name}");
        if let Some(id) = self.ids.lock().await.get(&key) {
            return Ok(id.clone());
        }
        let listing = self.get("/queue/tree", &[("name", name)]).await?;
        let id = first_id(&listing).ok_or_else(|| RouterError::NotFound {
            kind: "queue",
            name: name.to_string(),
        })?;
        self.ids.lock().await.insert(key, id.clone());
        Ok(id)
    }

    /// Resolve the steer-away mangle rule's `.id` and current disabled flag.
    async fn mangle_entry(&self) -> Result<(String, bool)> {
        let listing = self
            .get("/ip/firewall/mangle", &[("comment", &self.steering_comment)])
            .await?;
        let entry = listing
            .as_array()
            .and_then(|rules| rules.first())
            .ok_or_else(|| RouterError::NotFound {
                kind: "mangle rule",
                name: self.steering_comment.clone(),
            })?;
        let id = entry
            .get(".id")
            .and_then(Value::as_str)
            .ok_or_else(|| RouterError::Protocol("mangle entry missing .id".into()))?
            .to_string();
        let disabled = entry
            .get("disabled")
            .and_then(Value::as_str)
            .map(|v| v == "true" || v == "yes")
            .unwrap_or(false);
        self.ids
            .lock()
            .await
            .insert("mangle:steer".into(), id.clone());
        Ok((id, disabled))
    }

    async fn set_steering(&self, enabled: bool) -> Result<()> {
        let (id, disabled) = self.mangle_entry().await?;
        let want_disabled = !enabled;
        if disabled == want_disabled {
            // Already in the requested state.
            return Ok(());
        }
        let body = json!({ "disabled": if want_disabled { "yes" } else { "no" } });
        self.patch(&format!("/ip/firewall/mangle/{id}"), body)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl RouterBackend for RestBackend {
    async fn set_queue_limit(&self, queue: &str, max_bps: u64) -> Result<()> {
        retry_with_backoff(self.retry, RouterError::is_retryable, |_| async move {
            let id = self.queue_id(queue).await?;
            let body = json!({ "max-limit": max_bps.to_string() });
            self.patch(&format!("/queue/tree/{id}"), body).await?;
            Ok(())
        })
        .await
    }

    async fn reset_queue_counters(&self, queue: &str) -> Result<()> {
        retry_with_backoff(self.retry, RouterError::is_retryable, |_| async move {
            let id = self.queue_id(queue).await?;
            self.post(&format!("/queue/tree/{id}/reset-counters")).await?;
            Ok(())
        })
        .await
    }

    async fn get_queue_stats(&self, queue: &str) -> Result<Option<QueueStats>> {
        let listing = retry_with_backoff(self.retry, RouterError::is_retryable, |_| async move {
            self.get("/queue/tree", &[("name", queue)]).await
        })
        .await?;
        let Some(entry) = listing.as_array().and_then(|entries| entries.first()) else {
            return Ok(None);
        };
        Ok(Some(QueueStats {
            drops: field_u64(entry, "dropped").or_else(|| field_u64(entry, "drops")).unwrap_or(0),
            queued_packets: field_u64(entry, "queued-packets").unwrap_or(0),
            bytes: field_u64(entry, "bytes").unwrap_or(0),
        }))
    }

    async fn enable_steering(&self) -> Result<()> {
        retry_with_backoff(self.retry, RouterError::is_retryable, |_| async move {
            self.set_steering(true).await
        })
        .await
    }

    async fn disable_steering(&self) -> Result<()> {
        retry_with_backoff(self.retry, RouterError::is_retryable, |_| async move {
            self.set_steering(false).await
        })
        .await
    }

    async fn test_connection(&self) -> Result<()> {
        self.get("/system/resource", &[]).await?;
        Ok(())
    }
}

fn first_id(listing: &Value) -> Option<String> {
    listing
        .as_array()?
        .first()?
        .get(".id")?
        .as_str()
        .map(str::to_string)
}

/// RouterOS renders numbers as strings; accept either.
fn field_u64(entry: &Value, key: &str) -> Option<u64> {
    match entry.get(key)? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_id_reads_router_listing() {
        let listing = json!([{ ".id": "*7", "name": "wan1-download" }]);
        assert_eq!(first_id(&listing), Some("*7".into()));
        assert_eq!(first_id(&json!([])), None);
        assert_eq!(first_id(&json!({})), None);
    }

    #[test]
    fn field_u64_accepts_strings_and_numbers() {
        let entry = json!({ "dropped": "142", "queued-packets": 7, "bytes": "9000000" });
        assert_eq!(field_u64(&entry, "dropped"), Some(142));
        assert_eq!(field_u64(&entry, "queued-packets"), Some(7));
        assert_eq!(field_u64(&entry, "bytes"), Some(9_000_000));
        assert_eq!(field_u64(&entry, "missing"), None);
    }
}
