//! Health and history HTTP surface.
//!
//! One small axum server per daemon on loopback. `/health` reflects
//! the latest cycle snapshot (503 once three consecutive cycles have
//! failed), `/metrics` renders Prometheus text, and
//! `/metrics/history` pages the metrics store. Handlers log nothing
//! per request so probes don't fill the journal.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Instant;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, TimeZone, Utc};
use serde_json::json;

use wanctl_common::metrics::{render_prometheus, Gauge};
use wanctl_common::shutdown::ShutdownSignal;
use wanctl_common::state::{DownState, UpState};
use wanctl_store::query::MAX_PAGE_SIZE;
use wanctl_store::{parse_duration, MetricsStore, QueryFilter};

/// Published once per cycle by the controller.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub starting: bool,
    pub degraded: bool,
    pub download_state: &'static str,
    pub upload_state: &'static str,
    pub download_rate_bps: u64,
    pub upload_rate_bps: u64,
    pub baseline_rtt_ms: f64,
    pub load_rtt_ms: f64,
    pub last_rtt_ms: Option<f64>,
    pub cycle_failures: u32,
    pub throttled_writes: u64,
}

impl Default for Snapshot {
    fn default() -> Self {
        Snapshot {
            starting: true,
            degraded: false,
            download_state: DownState::Green.as_str(),
            upload_state: UpState::Green.as_str(),
            download_rate_bps: 0,
            upload_rate_bps: 0,
            baseline_rtt_ms: 0.0,
            load_rtt_ms: 0.0,
            last_rtt_ms: None,
            cycle_failures: 0,
            throttled_writes: 0,
        }
    }
}

/// State shared between the control loop and the HTTP handlers.
pub struct HealthState {
    wan_name: String,
    db_path: PathBuf,
    started_at: Instant,
    snapshot: RwLock<Snapshot>,
}

impl HealthState {
    pub fn new(wan_name: String, db_path: PathBuf) -> Self {
        HealthState {
            wan_name,
            db_path,
            started_at: Instant::now(),
            snapshot: RwLock::new(Snapshot::default()),
        }
    }

    pub fn publish(&self, snapshot: Snapshot) {
        *self.snapshot.write().expect("health lock") = snapshot;
    }

    pub fn snapshot(&self) -> Snapshot {
        self.snapshot.read().expect("health lock").clone()
    }
}

/// Serve until shutdown. Callers spawn this and treat bind failure as
/// a warning — the control loop runs without health if it must.
pub async fn serve(
    state: Arc<HealthState>,
    host: String,
    port: u16,
    mut shutdown: ShutdownSignal,
) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/", get(health_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(prometheus_handler))
        .route("/metrics/history", get(history_handler))
        .with_state(state);

    let addr: SocketAddr = format!("{host}:{port}").parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "health server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.wait().await })
        .await?;
    Ok(())
}

async fn health_handler(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let snapshot = state.snapshot();
    let status = if snapshot.starting {
        "starting"
    } else if snapshot.degraded {
        "degraded"
    } else {
        "healthy"
    };
    let body = json!({
        "status": status,
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "version": env!("CARGO_PKG_VERSION"),
        "wan_name": state.wan_name,
        "download": {
            "state": snapshot.download_state,
            "rate_bps": snapshot.download_rate_bps,
        },
        "upload": {
            "state": snapshot.upload_state,
            "rate_bps": snapshot.upload_rate_bps,
        },
        "ewma": {
            "baseline_rtt_ms": snapshot.baseline_rtt_ms,
            "load_rtt_ms": snapshot.load_rtt_ms,
        },
        "last_rtt_ms": snapshot.last_rtt_ms,
        "counters": {
            "cycle_failures": snapshot.cycle_failures,
            "throttled_writes": snapshot.throttled_writes,
        },
    });
    let code = if snapshot.degraded {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (code, Json(body))
}

async fn prometheus_handler(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let s = state.snapshot();
    let wan = state.wan_name.clone();
    let labels = |w: &str| vec![("wan", w.to_string())];
    let gauges = vec![
        Gauge {
            name: wanctl_common::metrics::RTT_BASELINE_MS,
            help: "Idle baseline RTT EWMA in milliseconds.",
            labels: labels(&wan),
            value: s.baseline_rtt_ms,
        },
        Gauge {
            name: wanctl_common::metrics::RTT_DELTA_MS,
            help: "Load minus baseline RTT in milliseconds.",
            labels: labels(&wan),
            value: s.load_rtt_ms - s.baseline_rtt_ms,
        },
        Gauge {
            name: wanctl_common::metrics::RATE_DOWNLOAD_MBPS,
            help: "Current download cap in Mbit/s.",
            labels: labels(&wan),
            value: s.download_rate_bps as f64 / 1e6,
        },
        Gauge {
            name: wanctl_common::metrics::RATE_UPLOAD_MBPS,
            help: "Current upload cap in Mbit/s.",
            labels: labels(&wan),
            value: s.upload_rate_bps as f64 / 1e6,
        },
        Gauge {
            name: wanctl_common::metrics::STATE,
            help: "Download congestion state (1=GREEN 2=YELLOW 3=SOFT_RED 4=RED).",
            labels: labels(&wan),
            value: state_code(s.download_state),
        },
    ];
    (
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        render_prometheus(&gauges),
    )
}

fn state_code(name: &str) -> f64 {
    match name {
        "GREEN" => 1.0,
        "YELLOW" => 2.0,
        "SOFT_RED" => 3.0,
        "RED" => 4.0,
        _ => 0.0,
    }
}

async fn history_handler(
    State(state): State<Arc<HealthState>>,
    Query(params): Query<HashMap<String, String>>,
) -> axum::response::Response {
    match build_filter(&params, Utc::now()) {
        Ok(filter) => history_response(&state.db_path, filter).await,
        Err(msg) => (StatusCode::BAD_REQUEST, Json(json!({ "error": msg }))).into_response(),
    }
}

/// Translate query params into a store filter; any malformed
/// parameter is a 400 with its reason.
fn build_filter(
    params: &HashMap<String, String>,
    now: DateTime<Utc>,
) -> Result<QueryFilter, String> {
    let (start, end) = match (params.get("range"), params.get("from"), params.get("to")) {
        (Some(_), Some(_), _) | (Some(_), _, Some(_)) => {
            return Err("range and from/to are mutually exclusive".into());
        }
        (Some(range), None, None) => {
            let dur = parse_duration(range)
                .ok_or_else(|| format!("invalid range \"{range}\" (use e.g. 15m, 1h, 2d)"))?;
            let dur = chrono::Duration::from_std(dur).map_err(|_| "range too large".to_string())?;
            (now - dur, now)
        }
        (None, from, to) => {
            let end = match to {
                Some(t) => t
                    .parse::<DateTime<Utc>>()
                    .map_err(|_| format!("invalid to \"{t}\""))?,
                None => now,
            };
            let start = match from {
                Some(f) => f
                    .parse::<DateTime<Utc>>()
                    .map_err(|_| format!("invalid from \"{f}\""))?,
                // Default window: the last hour.
                None => end - chrono::Duration::hours(1),
            };
            if start > end {
                return Err("from is after to".into());
            }
            (start, end)
        }
    };

    let limit = match params.get("limit") {
        Some(l) => Some(
            l.parse::<u32>()
                .map_err(|_| format!("invalid limit \"{l}\""))?
                .min(MAX_PAGE_SIZE),
        ),
        None => None,
    };
    let offset = match params.get("offset") {
        Some(o) => Some(
            o.parse::<u32>()
                .map_err(|_| format!("invalid offset \"{o}\""))?,
        ),
        None => None,
    };

    Ok(QueryFilter {
        start_seconds: start.timestamp(),
        end_seconds: end.timestamp(),
        metrics: params
            .get("metrics")
            .map(|m| m.split(',').map(|s| s.trim().to_string()).collect()),
        wan: params.get("wan").cloned(),
        granularity: None,
        limit,
        offset,
    })
}

async fn history_response(db_path: &PathBuf, filter: QueryFilter) -> axum::response::Response {
    // Missing or unopenable database is empty history, not an error.
    let store = match MetricsStore::open_readonly(db_path).await {
        Ok(Some(store)) => store,
        Ok(None) | Err(_) => {
            return Json(json!({
                "data": [],
                "metadata": {
                    "total_count": 0,
                    "returned_count": 0,
                    "granularity": null,
                    "limit": filter.limit,
                    "offset": filter.offset.unwrap_or(0),
                    "query": {
                        "start": iso(filter.start_seconds),
                        "end": iso(filter.end_seconds),
                    },
                },
            }))
            .into_response();
        }
    };

    let granularity =
        wanctl_store::query::select_granularity(filter.start_seconds, filter.end_seconds);
    match store.query_metrics(&filter).await {
        Ok((rows, total)) => {
            let data: Vec<serde_json::Value> = rows
                .iter()
                .map(|r| {
                    json!({
                        "timestamp": iso(r.timestamp_seconds),
                        "wan_name": r.wan_name,
                        "metric_name": r.metric_name,
                        "value": r.value,
                        "labels": r
                            .labels
                            .as_deref()
                            .and_then(|l| serde_json::from_str::<serde_json::Value>(l).ok()),
                        "granularity": r.granularity,
                    })
                })
                .collect();
            Json(json!({
                "data": data,
                "metadata": {
                    "total_count": total,
                    "returned_count": data.len(),
                    "granularity": granularity.as_str(),
                    "limit": filter.limit.unwrap_or(MAX_PAGE_SIZE),
                    "offset": filter.offset.unwrap_or(0),
                    "query": {
                        "start": iso(filter.start_seconds),
                        "end": iso(filter.end_seconds),
                    },
                },
            }))
            .into_response()
        }
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

fn iso(ts: i64) -> String {
    Utc.timestamp_opt(ts, 0)
        .single()
        .map(|t| t.to_rfc3339_opts(chrono::SecondsFormat::Secs, true))
        .unwrap_or_else(|| ts.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn default_window_is_last_hour() {
        let now = Utc.with_ymd_and_hms(2026, 8, 1, 12, 0, 0).unwrap();
        let filter = build_filter(&HashMap::new(), now).unwrap();
        assert_eq!(filter.end_seconds - filter.start_seconds, 3_600);
    }

    #[test]
    fn range_param_sets_window() {
        let now = Utc.with_ymd_and_hms(2026, 8, 1, 12, 0, 0).unwrap();
        let filter = build_filter(&params(&[("range", "15m")]), now).unwrap();
        assert_eq!(filter.end_seconds - filter.start_seconds, 900);
    }

    #[test]
    fn range_and_from_conflict() {
        let now = Utc::now();
        let p = params(&[("range", "1h"), ("from", "2026-08-01T00:00:00Z")]);
        assert!(build_filter(&p, now).is_err());
    }

    #[test]
    fn invalid_range_rejected() {
        assert!(build_filter(&params(&[("range", "fortnight")]), Utc::now()).is_err());
    }

    #[test]
    fn from_after_to_rejected() {
        let p = params(&[
            ("from", "2026-08-01T12:00:00Z"),
            ("to", "2026-08-01T00:00:00Z"),
        ]);
        assert!(build_filter(&p, Utc::now()).is_err());
    }

    #[test]
    fn limit_capped_at_page_max() {
        let filter = build_filter(&params(&[("limit", "2000000")]), Utc::now()).unwrap();
        assert_eq!(filter.limit, Some(MAX_PAGE_SIZE));
    }

    #[test]
    fn invalid_limit_rejected() {
        assert!(build_filter(&params(&[("limit", "ten")]), Utc::now()).is_err());
    }

    #[test]
    fn metrics_csv_splits() {
        let filter = build_filter(
            &params(&[("metrics", "wanctl_rtt_ms, wanctl_state")]),
            Utc::now(),
        )
        .unwrap();
        assert_eq!(
            filter.metrics,
            Some(vec!["wanctl_rtt_ms".to_string(), "wanctl_state".to_string()])
        );
    }

    #[test]
    fn snapshot_status_logic() {
        let state = HealthState::new("primary".into(), "/nonexistent".into());
        assert!(state.snapshot().starting);
        state.publish(Snapshot {
            starting: false,
            degraded: true,
            ..Snapshot::default()
        });
        let s = state.snapshot();
        assert!(!s.starting);
        assert!(s.degraded);
    }
}
