//! Steering daemon health endpoint.

use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::Instant;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde_json::json;

use wanctl_common::config::SteeringConfig;
use wanctl_common::metrics::{render_prometheus, Gauge, STEERING_ENABLED};
use wanctl_common::shutdown::ShutdownSignal;
use wanctl_common::state::SteerState;

/// Published once per cycle by the daemon.
#[derive(Debug, Clone)]
pub struct SteerSnapshot {
    pub starting: bool,
    pub degraded: bool,
    pub steering_enabled: bool,
    pub state: SteerState,
    pub last_transition_ts: Option<DateTime<Utc>>,
    pub red_count: u32,
    pub good_count: u32,
    pub router_failures: u32,
    pub cake_failures: u32,
    /// (score, shadow decision) when the confidence classifier runs.
    pub confidence: Option<(f64, &'static str)>,
}

impl Default for SteerSnapshot {
    fn default() -> Self {
        SteerSnapshot {
            starting: true,
            degraded: false,
            steering_enabled: false,
            state: SteerState::Starting,
            last_transition_ts: None,
            red_count: 0,
            good_count: 0,
            router_failures: 0,
            cake_failures: 0,
            confidence: None,
        }
    }
}

pub struct SteerHealth {
    wan_name: String,
    red_samples_required: u32,
    green_samples_required: u32,
    rtt_threshold_ms: f64,
    started_at: Instant,
    snapshot: RwLock<SteerSnapshot>,
}

impl SteerHealth {
    pub fn new(cfg: SteeringConfig) -> Self {
        SteerHealth {
            wan_name: cfg.wan_name,
            red_samples_required: cfg.red_samples_required,
            green_samples_required: cfg.green_samples_required,
            rtt_threshold_ms: cfg.assessment.rtt_threshold_ms,
            started_at: Instant::now(),
            snapshot: RwLock::new(SteerSnapshot::default()),
        }
    }

    pub fn publish(&self, snapshot: SteerSnapshot) {
        *self.snapshot.write().expect("health lock") = snapshot;
    }

    pub fn snapshot(&self) -> SteerSnapshot {
        self.snapshot.read().expect("health lock").clone()
    }
}

pub async fn serve(
    state: Arc<SteerHealth>,
    host: String,
    port: u16,
    mut shutdown: ShutdownSignal,
) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/", get(health_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(prometheus_handler))
        .with_state(state);

    let addr: SocketAddr = format!("{host}:{port}").parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "health server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.wait().await })
        .await?;
    Ok(())
}

async fn health_handler(State(state): State<Arc<SteerHealth>>) -> impl IntoResponse {
    let s = state.snapshot();
    let status = if s.starting {
        "starting"
    } else if s.degraded {
        "degraded"
    } else {
        "healthy"
    };
    let time_in_state = s
        .last_transition_ts
        .map(|ts| (Utc::now() - ts).num_seconds().max(0));
    let mut body = json!({
        "status": status,
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "version": env!("CARGO_PKG_VERSION"),
        "steering": { "enabled": s.steering_enabled },
        "congestion": {
            "primary": {
                "state": s.state.as_str(),
                "state_code": s.state.state_code(),
            },
        },
        "decision": {
            "last_transition_time_iso": s.last_transition_ts
                .map(|t| t.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)),
            "time_in_state_seconds": time_in_state,
        },
        "counters": {
            "red_count": s.red_count,
            "good_count": s.good_count,
            "router_failures": s.router_failures,
            "cake_failures": s.cake_failures,
        },
        "thresholds": {
            "red_samples_required": state.red_samples_required,
            "green_samples_required": state.green_samples_required,
            "rtt_threshold_ms": state.rtt_threshold_ms,
        },
    });
    if let Some((score, decision)) = s.confidence {
        body["confidence"] = json!({
            "primary_score": score,
            "dry_run_decision": decision,
        });
    }
    let code = if s.degraded {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (code, Json(body))
}

async fn prometheus_handler(State(state): State<Arc<SteerHealth>>) -> impl IntoResponse {
    let s = state.snapshot();
    let gauges = vec![Gauge {
        name: STEERING_ENABLED,
        help: "Whether the steer-away mangle rule is enabled (0/1).",
        labels: vec![("wan", state.wan_name.clone())],
        value: if s.steering_enabled { 1.0 } else { 0.0 },
    }];
    (
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        render_prometheus(&gauges),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use wanctl_common::config::SteeringConfigInput;

    fn cfg() -> SteeringConfig {
        let yaml = r#"
cake_state_sources: { primary: /tmp/p.json }
queues: { download: d, upload: u }
router: { host: h, user: u, password_env: P }
ping: { hosts: [1.1.1.1] }
"#;
        let input: SteeringConfigInput = serde_yaml::from_str(yaml).unwrap();
        input.resolve().unwrap()
    }

    #[test]
    fn snapshot_starts_in_starting_state() {
        let health = SteerHealth::new(cfg());
        let s = health.snapshot();
        assert!(s.starting);
        assert_eq!(s.state, SteerState::Starting);
        assert_eq!(s.state.state_code(), 3);
    }

    #[test]
    fn publish_replaces_snapshot() {
        let health = SteerHealth::new(cfg());
        health.publish(SteerSnapshot {
            starting: false,
            steering_enabled: true,
            state: SteerState::Red,
            red_count: 3,
            ..SteerSnapshot::default()
        });
        let s = health.snapshot();
        assert!(s.steering_enabled);
        assert_eq!(s.state, SteerState::Red);
        assert_eq!(s.state.state_code(), 2);
        assert_eq!(s.red_count, 3);
    }
}
