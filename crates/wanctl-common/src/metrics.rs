//! Metric-name registry and Prometheus text rendering.
//!
//! Every sample the daemons record carries one of these names; the
//! store's downsampler looks up the aggregation here so a numeric
//! gauge averages while a state gauge takes the mode.

use std::fmt::Write;

pub const RTT_MS: &str = "wanctl_rtt_ms";
pub const RTT_BASELINE_MS: &str = "wanctl_rtt_baseline_ms";
pub const RTT_DELTA_MS: &str = "wanctl_rtt_delta_ms";
pub const RATE_DOWNLOAD_MBPS: &str = "wanctl_rate_download_mbps";
pub const RATE_UPLOAD_MBPS: &str = "wanctl_rate_upload_mbps";
/// 1=GREEN, 2=YELLOW, 3=SOFT_RED, 4=RED.
pub const STATE: &str = "wanctl_state";
/// 0/1.
pub const STEERING_ENABLED: &str = "wanctl_steering_enabled";

/// How a metric is combined when downsampling a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregation {
    Avg,
    /// Most frequent value — for state and boolean gauges where an
    /// average would be meaningless.
    Mode,
}

/// Declared aggregation per metric. Unknown names average, with a
/// debug note so a new metric doesn't silently get the wrong rollup.
pub fn aggregation_for(metric: &str) -> Aggregation {
    match metric {
        STATE | STEERING_ENABLED => Aggregation::Mode,
        RTT_MS | RTT_BASELINE_MS | RTT_DELTA_MS | RATE_DOWNLOAD_MBPS | RATE_UPLOAD_MBPS => {
            Aggregation::Avg
        }
        other => {
            tracing::debug!(metric = other, "no declared aggregation, defaulting to avg");
            Aggregation::Avg
        }
    }
}

/// Sample resolution tiers in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Granularity {
    Raw,
    OneMinute,
    FiveMinutes,
    OneHour,
}

impl Granularity {
    pub fn as_str(self) -> &'static str {
        match self {
            Granularity::Raw => "raw",
            Granularity::OneMinute => "1m",
            Granularity::FiveMinutes => "5m",
            Granularity::OneHour => "1h",
        }
    }

    pub fn parse(s: &str) -> Option<Granularity> {
        match s {
            "raw" => Some(Granularity::Raw),
            "1m" => Some(Granularity::OneMinute),
            "5m" => Some(Granularity::FiveMinutes),
            "1h" => Some(Granularity::OneHour),
            _ => None,
        }
    }

    /// Bucket width in seconds; raw samples are unbucketed.
    pub fn bucket_seconds(self) -> Option<i64> {
        match self {
            Granularity::Raw => None,
            Granularity::OneMinute => Some(60),
            Granularity::FiveMinutes => Some(300),
            Granularity::OneHour => Some(3600),
        }
    }

    pub fn next_coarser(self) -> Option<Granularity> {
        match self {
            Granularity::Raw => Some(Granularity::OneMinute),
            Granularity::OneMinute => Some(Granularity::FiveMinutes),
            Granularity::FiveMinutes => Some(Granularity::OneHour),
            Granularity::OneHour => None,
        }
    }
}

/// One gauge for the Prometheus text endpoint.
pub struct Gauge {
    pub name: &'static str,
    pub help: &'static str,
    pub labels: Vec<(&'static str, String)>,
    pub value: f64,
}

/// Render gauges in Prometheus text exposition format.
pub fn render_prometheus(gauges: &[Gauge]) -> String {
    let mut out = String::with_capacity(1024);
    let mut last_name = "";
    for g in gauges {
        if g.name != last_name {
            writeln!(out, "# HELP {} {}", g.name, g.help).unwrap();
            writeln!(out, "# TYPE {} gauge", g.name).unwrap();
            last_name = g.name;
        }
        if g.labels.is_empty() {
            writeln!(out, "{} {}", g.name, g.value).unwrap();
        } else {
            let labels = g
                .labels
                .iter()
                .map(|(k, v)| format!("{k}=\"{v}\""))
                .collect::<Vec<_>>()
                .join(",");
            writeln!(out, "{}{{{labels}}} {}", g.name, g.value).unwrap();
        }
    }
    out
}
