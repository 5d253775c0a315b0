//! YAML configuration schema for both daemons.
//!
//! Raw files deserialize into `*Input` structs where every field is
//! optional; `resolve()` merges defaults and validates, returning the
//! full list of violations at once so an operator fixes a broken file
//! in one pass instead of one error per restart.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

/// Configuration loading failure.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error("invalid config:\n  - {}", violations.join("\n  - "))]
    Invalid { violations: Vec<String> },
}

// ─── Shared sections ────────────────────────────────────────────────────────

/// Router transport selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Rest,
    Ssh,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RouterConfigInput {
    pub transport: Option<String>,
    pub host: Option<String>,
    pub user: Option<String>,
    /// Path to the SSH private key (ssh transport).
    pub ssh_key: Option<String>,
    /// Environment variable holding the REST password (rest transport).
    pub password_env: Option<String>,
    pub timeout_seconds: Option<f64>,
}

/// Resolved router connection settings.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub transport: Transport,
    pub host: String,
    pub user: String,
    pub ssh_key: Option<PathBuf>,
    pub password_env: Option<String>,
    pub timeout: Duration,
    /// Name of the steer-away mangle rule's comment field.
    pub steering_comment: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct QueuesInput {
    pub download: Option<String>,
    pub upload: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Queues {
    pub download: String,
    pub upload: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PingInput {
    pub hosts: Vec<String>,
    pub count: Option<u32>,
    pub timeout_seconds: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct PingConfig {
    pub hosts: Vec<String>,
    /// Probes per host per cycle.
    pub count: u32,
    /// Per-host deadline.
    pub timeout: Duration,
}

impl Default for PingConfig {
    fn default() -> Self {
        PingConfig {
            hosts: vec!["1.1.1.1".into()],
            count: 1,
            timeout: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HealthInput {
    pub host: Option<String>,
    pub port: Option<u16>,
}

#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MetricsInput {
    pub enabled: Option<bool>,
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageInput {
    pub db_path: Option<String>,
    pub retention_days: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub db_path: PathBuf,
    pub retention_days: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            db_path: "/var/lib/wanctl/metrics.db".into(),
            retention_days: 30,
        }
    }
}

// ─── Autorate config ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DownFloorsInput {
    pub green: Option<u64>,
    pub yellow: Option<u64>,
    pub soft_red: Option<u64>,
    pub red: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct UpFloorsInput {
    pub green: Option<u64>,
    pub yellow: Option<u64>,
    pub red: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DownDirectionInput {
    pub max_capacity_bps: Option<u64>,
    pub min_capacity_bps: Option<u64>,
    pub floors_bps: DownFloorsInput,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct UpDirectionInput {
    pub max_capacity_bps: Option<u64>,
    pub min_capacity_bps: Option<u64>,
    pub floors_bps: UpFloorsInput,
}

/// Download rate floors, one per congestion state, in bits/sec.
#[derive(Debug, Clone, Copy)]
pub struct DownFloors {
    pub green: u64,
    pub yellow: u64,
    pub soft_red: u64,
    pub red: u64,
}

/// Upload rate floors in bits/sec.
#[derive(Debug, Clone, Copy)]
pub struct UpFloors {
    pub green: u64,
    pub yellow: u64,
    pub red: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct DownDirection {
    pub max_capacity_bps: u64,
    pub min_capacity_bps: u64,
    pub floors: DownFloors,
}

#[derive(Debug, Clone, Copy)]
pub struct UpDirection {
    pub max_capacity_bps: u64,
    pub min_capacity_bps: u64,
    pub floors: UpFloors,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ThresholdsInput {
    pub yellow_ms: Option<f64>,
    pub soft_red_ms: Option<f64>,
    pub red_ms: Option<f64>,
    pub upload_yellow_ms: Option<f64>,
    pub upload_red_ms: Option<f64>,
    pub upgrade_samples: Option<u32>,
    pub downgrade_samples: Option<u32>,
}

/// RTT-delta thresholds (ms) and hysteresis sample counts.
///
/// Upgrades toward a worse state fire after `upgrade_samples`
/// consecutive qualifying samples; downgrades need the larger
/// `downgrade_samples` count.
#[derive(Debug, Clone, Copy)]
pub struct Thresholds {
    pub yellow_ms: f64,
    pub soft_red_ms: f64,
    pub red_ms: f64,
    pub upload_yellow_ms: f64,
    pub upload_red_ms: f64,
    pub upgrade_samples: u32,
    pub downgrade_samples: u32,
}

impl Default for Thresholds {
    fn default() -> Self {
        Thresholds {
            yellow_ms: 5.0,
            soft_red_ms: 15.0,
            red_ms: 30.0,
            upload_yellow_ms: 8.0,
            upload_red_ms: 30.0,
            upgrade_samples: 8,
            downgrade_samples: 60,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EwmaInput {
    pub alpha_baseline: Option<f64>,
    pub alpha_load: Option<f64>,
    pub baseline_update_threshold_ms: Option<f64>,
}

#[derive(Debug, Clone, Copy)]
pub struct EwmaConfig {
    /// Slow idle-only baseline smoothing factor.
    pub alpha_baseline: f64,
    /// Fast always-on load smoothing factor.
    pub alpha_load: f64,
    /// Baseline updates only while the current delta is strictly below this.
    pub baseline_update_threshold_ms: f64,
}

impl Default for EwmaConfig {
    fn default() -> Self {
        EwmaConfig {
            alpha_baseline: 0.001,
            alpha_load: 0.05,
            baseline_update_threshold_ms: 5.0,
        }
    }
}

/// Behavior when every ping host fails in a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackMode {
    /// Skip EWMA/state updates, keep last known values.
    Freeze,
    /// Escalate a failure counter; past the limit, force RED and hold rates.
    GracefulDegradation,
    /// Treat the last successful RTT as this cycle's measurement.
    UseLastRtt,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FallbackInput {
    pub mode: Option<String>,
    pub max_consecutive_failures: Option<u32>,
}

#[derive(Debug, Clone, Copy)]
pub struct FallbackConfig {
    pub mode: FallbackMode,
    pub max_consecutive_failures: u32,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        FallbackConfig {
            mode: FallbackMode::Freeze,
            max_consecutive_failures: 10,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WriteLimitInput {
    pub max_writes: Option<usize>,
    pub window_seconds: Option<u64>,
}

/// Flash-wear protection: at most `max_writes` router pushes per window.
#[derive(Debug, Clone, Copy)]
pub struct WriteLimit {
    pub max_writes: usize,
    pub window: Duration,
}

impl Default for WriteLimit {
    fn default() -> Self {
        WriteLimit {
            max_writes: 10,
            window: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AutorateConfigInput {
    pub wan_name: Option<String>,
    pub queues: QueuesInput,
    pub router: RouterConfigInput,
    pub download: DownDirectionInput,
    pub upload: UpDirectionInput,
    pub thresholds: ThresholdsInput,
    pub ewma: EwmaInput,
    pub ping: PingInput,
    pub fallback: FallbackInput,
    pub cycle_interval_seconds: Option<f64>,
    pub write_limit: WriteLimitInput,
    pub state_file: Option<String>,
    pub lock_file: Option<String>,
    pub health: HealthInput,
    pub metrics: MetricsInput,
    pub storage: StorageInput,
}

/// Fully-resolved per-WAN autorate configuration. Loaded once, read-only.
#[derive(Debug, Clone)]
pub struct AutorateConfig {
    pub wan_name: String,
    pub queues: Queues,
    pub router: RouterConfig,
    pub download: DownDirection,
    pub upload: UpDirection,
    pub thresholds: Thresholds,
    pub ewma: EwmaConfig,
    pub ping: PingConfig,
    pub fallback: FallbackConfig,
    pub cycle_interval: Duration,
    pub write_limit: WriteLimit,
    pub state_file: PathBuf,
    pub lock_file: PathBuf,
    pub health: HealthConfig,
    pub metrics: MetricsConfig,
    pub storage: StorageConfig,
}

impl AutorateConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let input: AutorateConfigInput =
            serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        input.resolve()
    }
}

impl AutorateConfigInput {
    pub fn resolve(self) -> Result<AutorateConfig, ConfigError> {
        let mut v = Violations::default();

        let wan_name = v.required(self.wan_name, "wan_name");
        let queues = resolve_queues(self.queues, &mut v);
        let router = resolve_router(self.router, &mut v);
        let download = resolve_download(self.download, &mut v);
        let upload = resolve_upload(self.upload, &mut v);
        let thresholds = resolve_thresholds(self.thresholds, &mut v);
        let ewma = resolve_ewma(self.ewma, &mut v);
        let ping = resolve_ping(self.ping, &mut v);
        let fallback = resolve_fallback(self.fallback, &mut v);
        let cycle_interval = resolve_interval(
            self.cycle_interval_seconds,
            "cycle_interval_seconds",
            0.05,
            &mut v,
        );
        let write_limit = resolve_write_limit(self.write_limit, &mut v);
        let health = resolve_health(self.health, 9101);
        let metrics = resolve_metrics(self.metrics);
        let storage = resolve_storage(self.storage);

        let state_file = self
            .state_file
            .map(PathBuf::from)
            .unwrap_or_else(|| "/var/lib/wanctl/autorate.state.json".into());
        let lock_file = self
            .lock_file
            .map(PathBuf::from)
            .unwrap_or_else(|| "/run/wanctl/autorate.lock".into());

        v.finish()?;
        Ok(AutorateConfig {
            wan_name: wan_name.unwrap_or_default(),
            queues,
            router,
            download,
            upload,
            thresholds,
            ewma,
            ping,
            fallback,
            cycle_interval,
            write_limit,
            state_file,
            lock_file,
            health,
            metrics,
            storage,
        })
    }
}

// ─── Steering config ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AssessmentInput {
    pub rtt_threshold_ms: Option<f64>,
    pub cake_drops_threshold: Option<u64>,
    pub cake_queue_depth_threshold: Option<u64>,
}

#[derive(Debug, Clone, Copy)]
pub struct AssessmentConfig {
    /// RTT delta above this is a congestion signal.
    pub rtt_threshold_ms: f64,
    /// CAKE drop-count delta per cycle confirming congestion.
    pub cake_drops_threshold: u64,
    /// CAKE queued-packet depth confirming congestion.
    pub cake_queue_depth_threshold: u64,
}

impl Default for AssessmentConfig {
    fn default() -> Self {
        AssessmentConfig {
            rtt_threshold_ms: 30.0,
            cake_drops_threshold: 50,
            cake_queue_depth_threshold: 1000,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StateSourcesInput {
    pub primary: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ConfidenceInput {
    pub enabled: Option<bool>,
    pub dry_run: Option<bool>,
    pub enable_threshold: Option<f64>,
    pub release_threshold: Option<f64>,
}

#[derive(Debug, Clone, Copy)]
pub struct ConfidenceConfig {
    pub enabled: bool,
    /// When true, the hysteresis classifier stays authoritative and
    /// confidence decisions are only logged.
    pub dry_run: bool,
    pub enable_threshold: f64,
    pub release_threshold: f64,
}

impl Default for ConfidenceConfig {
    fn default() -> Self {
        ConfidenceConfig {
            enabled: false,
            dry_run: true,
            enable_threshold: 0.8,
            release_threshold: 0.3,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SteeringConfigInput {
    pub wan_name: Option<String>,
    pub interval_seconds: Option<f64>,
    pub assessment: AssessmentInput,
    pub cake_state_sources: StateSourcesInput,
    pub cake_aware_enabled: Option<bool>,
    pub red_samples_required: Option<u32>,
    pub green_samples_required: Option<u32>,
    pub history_size: Option<usize>,
    pub baseline_rtt_ms: Option<f64>,
    pub confidence: ConfidenceInput,
    pub queues: QueuesInput,
    pub router: RouterConfigInput,
    pub ping: PingInput,
    pub state_file: Option<String>,
    pub lock_file: Option<String>,
    pub health: HealthInput,
    pub metrics: MetricsInput,
    pub storage: StorageInput,
}

/// Fully-resolved steering daemon configuration.
#[derive(Debug, Clone)]
pub struct SteeringConfig {
    pub wan_name: String,
    pub interval: Duration,
    pub assessment: AssessmentConfig,
    /// Primary WAN's autorate state file.
    pub primary_state_file: PathBuf,
    pub cake_aware_enabled: bool,
    pub red_samples_required: u32,
    pub green_samples_required: u32,
    pub history_size: usize,
    pub baseline_rtt_ms: f64,
    pub confidence: ConfidenceConfig,
    pub queues: Queues,
    pub router: RouterConfig,
    pub ping: PingConfig,
    pub state_file: PathBuf,
    pub lock_file: PathBuf,
    pub health: HealthConfig,
    pub metrics: MetricsConfig,
    pub storage: StorageConfig,
}

impl SteeringConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let input: SteeringConfigInput =
            serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        input.resolve()
    }
}

impl SteeringConfigInput {
    pub fn resolve(self) -> Result<SteeringConfig, ConfigError> {
        let mut v = Violations::default();

        let wan_name = self.wan_name.unwrap_or_else(|| "steer".into());
        let interval = resolve_interval(self.interval_seconds, "interval_seconds", 0.05, &mut v);
        let assessment = resolve_assessment(self.assessment, &mut v);
        let primary_state_file = v.required(self.cake_state_sources.primary, "cake_state_sources.primary");
        let red_samples_required = self.red_samples_required.unwrap_or(16);
        let green_samples_required = self.green_samples_required.unwrap_or(60);
        if red_samples_required == 0 {
            v.push("red_samples_required must be >= 1");
        }
        if green_samples_required < red_samples_required {
            v.push("green_samples_required must be >= red_samples_required (recovery is the slow side)");
        }
        let history_size = self.history_size.unwrap_or(2400);
        if history_size == 0 {
            v.push("history_size must be >= 1");
        }
        let baseline_rtt_ms = self.baseline_rtt_ms.unwrap_or(25.0);
        if !(crate::state::BASELINE_MIN_MS..=crate::state::BASELINE_MAX_MS).contains(&baseline_rtt_ms) {
            v.push(format!(
                "baseline_rtt_ms must be within [{}, {}], got {baseline_rtt_ms}",
                crate::state::BASELINE_MIN_MS,
                crate::state::BASELINE_MAX_MS
            ));
        }
        let confidence = resolve_confidence(self.confidence, &mut v);
        let queues = resolve_queues(self.queues, &mut v);
        let router = resolve_router(self.router, &mut v);
        let ping = resolve_ping(self.ping, &mut v);
        let health = resolve_health(self.health, 9102);
        let metrics = resolve_metrics(self.metrics);
        let storage = resolve_storage(self.storage);

        let state_file = self
            .state_file
            .map(PathBuf::from)
            .unwrap_or_else(|| "/var/lib/wanctl/steer.state.json".into());
        let lock_file = self
            .lock_file
            .map(PathBuf::from)
            .unwrap_or_else(|| "/run/wanctl/steer.lock".into());

        v.finish()?;
        Ok(SteeringConfig {
            wan_name,
            interval,
            assessment,
            primary_state_file: primary_state_file.map(PathBuf::from).unwrap_or_default(),
            cake_aware_enabled: self.cake_aware_enabled.unwrap_or(false),
            red_samples_required,
            green_samples_required,
            history_size,
            baseline_rtt_ms,
            confidence,
            queues,
            router,
            ping,
            state_file,
            lock_file,
            health,
            metrics,
            storage,
        })
    }
}

// ─── Resolution helpers ─────────────────────────────────────────────────────

#[derive(Default)]
struct Violations(Vec<String>);

impl Violations {
    fn push(&mut self, msg: impl Into<String>) {
        self.0.push(msg.into());
    }

    fn required<T>(&mut self, value: Option<T>, field: &str) -> Option<T> {
        if value.is_none() {
            self.push(format!("{field} is required"));
        }
        value
    }

    fn finish(self) -> Result<(), ConfigError> {
        if self.0.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid { violations: self.0 })
        }
    }
}

fn resolve_queues(input: QueuesInput, v: &mut Violations) -> Queues {
    Queues {
        download: v.required(input.download, "queues.download").unwrap_or_default(),
        upload: v.required(input.upload, "queues.upload").unwrap_or_default(),
    }
}

fn resolve_router(input: RouterConfigInput, v: &mut Violations) -> RouterConfig {
    let transport = match input.transport.as_deref() {
        Some("rest") | None => Transport::Rest,
        Some("ssh") => Transport::Ssh,
        Some(other) => {
            v.push(format!(
                "router.transport must be \"rest\" or \"ssh\", got \"{other}\""
            ));
            Transport::Rest
        }
    };
    let host = v.required(input.host, "router.host").unwrap_or_default();
    let user = v.required(input.user, "router.user").unwrap_or_default();
    let timeout_seconds = input.timeout_seconds.unwrap_or(5.0);
    if !(0.5..=60.0).contains(&timeout_seconds) {
        v.push(format!(
            "router.timeout_seconds must be within [0.5, 60], got {timeout_seconds}"
        ));
    }
    match transport {
        Transport::Ssh if input.ssh_key.is_none() => {
            v.push("router.ssh_key is required for the ssh transport (key-based auth only)");
        }
        Transport::Rest if input.password_env.is_none() => {
            v.push("router.password_env is required for the rest transport");
        }
        _ => {}
    }
    RouterConfig {
        transport,
        host,
        user,
        ssh_key: input.ssh_key.map(PathBuf::from),
        password_env: input.password_env,
        timeout: Duration::from_secs_f64(timeout_seconds.clamp(0.5, 60.0)),
        steering_comment: "wanctl-steer-away".into(),
    }
}

fn resolve_download(input: DownDirectionInput, v: &mut Violations) -> DownDirection {
    let max = v
        .required(input.max_capacity_bps, "download.max_capacity_bps")
        .unwrap_or(0);
    let min = v
        .required(input.min_capacity_bps, "download.min_capacity_bps")
        .unwrap_or(0);
    let f = &input.floors_bps;
    let green = f.green.unwrap_or(max);
    let yellow = v
        .required(f.yellow, "download.floors_bps.yellow")
        .unwrap_or(0);
    let soft_red = v
        .required(f.soft_red, "download.floors_bps.soft_red")
        .unwrap_or(0);
    let red = v.required(f.red, "download.floors_bps.red").unwrap_or(0);

    if min > max {
        v.push(format!(
            "download.min_capacity_bps ({min}) exceeds max_capacity_bps ({max})"
        ));
    }
    // Floors must fall monotonically GREEN >= YELLOW >= SOFT_RED >= RED,
    // and every floor must sit inside [min, max].
    if !(red <= soft_red && soft_red <= yellow && yellow <= green) {
        v.push(format!(
            "download.floors_bps must satisfy red <= soft_red <= yellow <= green \
             (got red={red}, soft_red={soft_red}, yellow={yellow}, green={green})"
        ));
    }
    for (name, floor) in [
        ("green", green),
        ("yellow", yellow),
        ("soft_red", soft_red),
        ("red", red),
    ] {
        if floor < min || floor > max {
            v.push(format!(
                "download.floors_bps.{name} ({floor}) outside [min={min}, max={max}]"
            ));
        }
    }

    DownDirection {
        max_capacity_bps: max,
        min_capacity_bps: min,
        floors: DownFloors {
            green,
            yellow,
            soft_red,
            red,
        },
    }
}

fn resolve_upload(input: UpDirectionInput, v: &mut Violations) -> UpDirection {
    let max = v
        .required(input.max_capacity_bps, "upload.max_capacity_bps")
        .unwrap_or(0);
    let min = v
        .required(input.min_capacity_bps, "upload.min_capacity_bps")
        .unwrap_or(0);
    let f = &input.floors_bps;
    let green = f.green.unwrap_or(max);
    let yellow = v.required(f.yellow, "upload.floors_bps.yellow").unwrap_or(0);
    let red = v.required(f.red, "upload.floors_bps.red").unwrap_or(0);

    if min > max {
        v.push(format!(
            "upload.min_capacity_bps ({min}) exceeds max_capacity_bps ({max})"
        ));
    }
    if !(red <= yellow && yellow <= green) {
        v.push(format!(
            "upload.floors_bps must satisfy red <= yellow <= green \
             (got red={red}, yellow={yellow}, green={green})"
        ));
    }
    for (name, floor) in [("green", green), ("yellow", yellow), ("red", red)] {
        if floor < min || floor > max {
            v.push(format!(
                "upload.floors_bps.{name} ({floor}) outside [min={min}, max={max}]"
            ));
        }
    }

    UpDirection {
        max_capacity_bps: max,
        min_capacity_bps: min,
        floors: UpFloors { green, yellow, red },
    }
}

fn resolve_thresholds(input: ThresholdsInput, v: &mut Violations) -> Thresholds {
    let d = Thresholds::default();
    let t = Thresholds {
        yellow_ms: input.yellow_ms.unwrap_or(d.yellow_ms),
        soft_red_ms: input.soft_red_ms.unwrap_or(d.soft_red_ms),
        red_ms: input.red_ms.unwrap_or(d.red_ms),
        upload_yellow_ms: input.upload_yellow_ms.unwrap_or(d.upload_yellow_ms),
        upload_red_ms: input.upload_red_ms.unwrap_or(d.upload_red_ms),
        upgrade_samples: input.upgrade_samples.unwrap_or(d.upgrade_samples),
        downgrade_samples: input.downgrade_samples.unwrap_or(d.downgrade_samples),
    };
    if !(t.yellow_ms < t.soft_red_ms && t.soft_red_ms < t.red_ms) {
        v.push(format!(
            "thresholds must satisfy yellow_ms < soft_red_ms < red_ms \
             (got {}, {}, {})",
            t.yellow_ms, t.soft_red_ms, t.red_ms
        ));
    }
    if t.upload_yellow_ms >= t.upload_red_ms {
        v.push(format!(
            "thresholds must satisfy upload_yellow_ms < upload_red_ms (got {}, {})",
            t.upload_yellow_ms, t.upload_red_ms
        ));
    }
    if t.upgrade_samples == 0 || t.downgrade_samples == 0 {
        v.push("thresholds.upgrade_samples and downgrade_samples must be >= 1");
    }
    if t.upgrade_samples > t.downgrade_samples {
        v.push(format!(
            "thresholds.upgrade_samples ({}) must not exceed downgrade_samples ({}) \
             — recovery is the slow side",
            t.upgrade_samples, t.downgrade_samples
        ));
    }
    t
}

fn resolve_ewma(input: EwmaInput, v: &mut Violations) -> EwmaConfig {
    let d = EwmaConfig::default();
    let e = EwmaConfig {
        alpha_baseline: input.alpha_baseline.unwrap_or(d.alpha_baseline),
        alpha_load: input.alpha_load.unwrap_or(d.alpha_load),
        baseline_update_threshold_ms: input
            .baseline_update_threshold_ms
            .unwrap_or(d.baseline_update_threshold_ms),
    };
    for (name, alpha) in [
        ("ewma.alpha_baseline", e.alpha_baseline),
        ("ewma.alpha_load", e.alpha_load),
    ] {
        if !(alpha > 0.0 && alpha < 1.0) {
            v.push(format!("{name} must be within (0, 1), got {alpha}"));
        }
    }
    if e.alpha_baseline >= e.alpha_load {
        v.push(format!(
            "ewma.alpha_baseline ({}) must be smaller than alpha_load ({})",
            e.alpha_baseline, e.alpha_load
        ));
    }
    if e.baseline_update_threshold_ms <= 0.0 {
        v.push(format!(
            "ewma.baseline_update_threshold_ms must be > 0, got {}",
            e.baseline_update_threshold_ms
        ));
    }
    e
}

fn resolve_ping(input: PingInput, v: &mut Violations) -> PingConfig {
    let d = PingConfig::default();
    if input.hosts.is_empty() {
        v.push("ping.hosts must list at least one target");
    }
    if input.hosts.len() > 8 {
        v.push(format!(
            "ping.hosts supports at most 8 targets, got {}",
            input.hosts.len()
        ));
    }
    let count = input.count.unwrap_or(d.count);
    if count == 0 || count > 10 {
        v.push(format!("ping.count must be within [1, 10], got {count}"));
    }
    let timeout_seconds = input.timeout_seconds.unwrap_or(2.0);
    if !(0.2..=30.0).contains(&timeout_seconds) {
        v.push(format!(
            "ping.timeout_seconds must be within [0.2, 30], got {timeout_seconds}"
        ));
    }
    PingConfig {
        hosts: input.hosts,
        count: count.clamp(1, 10),
        timeout: Duration::from_secs_f64(timeout_seconds.clamp(0.2, 30.0)),
    }
}

fn resolve_fallback(input: FallbackInput, v: &mut Violations) -> FallbackConfig {
    let d = FallbackConfig::default();
    let mode = match input.mode.as_deref() {
        None | Some("freeze") => FallbackMode::Freeze,
        Some("graceful_degradation") => FallbackMode::GracefulDegradation,
        Some("use_last_rtt") => FallbackMode::UseLastRtt,
        Some(other) => {
            v.push(format!(
                "fallback.mode must be one of freeze | graceful_degradation | use_last_rtt, \
                 got \"{other}\""
            ));
            FallbackMode::Freeze
        }
    };
    let max_consecutive_failures = input
        .max_consecutive_failures
        .unwrap_or(d.max_consecutive_failures);
    if max_consecutive_failures == 0 {
        v.push("fallback.max_consecutive_failures must be >= 1");
    }
    FallbackConfig {
        mode,
        max_consecutive_failures,
    }
}

fn resolve_interval(
    seconds: Option<f64>,
    field: &str,
    default: f64,
    v: &mut Violations,
) -> Duration {
    let s = seconds.unwrap_or(default);
    if !(0.01..=3600.0).contains(&s) {
        v.push(format!("{field} must be within [0.01, 3600], got {s}"));
        return Duration::from_secs_f64(default);
    }
    Duration::from_secs_f64(s)
}

fn resolve_write_limit(input: WriteLimitInput, v: &mut Violations) -> WriteLimit {
    let d = WriteLimit::default();
    let max_writes = input.max_writes.unwrap_or(d.max_writes);
    let window_seconds = input.window_seconds.unwrap_or(d.window.as_secs());
    if max_writes == 0 {
        v.push("write_limit.max_writes must be >= 1");
    }
    if window_seconds == 0 {
        v.push("write_limit.window_seconds must be >= 1");
    }
    WriteLimit {
        max_writes,
        window: Duration::from_secs(window_seconds.max(1)),
    }
}

fn resolve_assessment(input: AssessmentInput, v: &mut Violations) -> AssessmentConfig {
    let d = AssessmentConfig::default();
    let a = AssessmentConfig {
        rtt_threshold_ms: input.rtt_threshold_ms.unwrap_or(d.rtt_threshold_ms),
        cake_drops_threshold: input.cake_drops_threshold.unwrap_or(d.cake_drops_threshold),
        cake_queue_depth_threshold: input
            .cake_queue_depth_threshold
            .unwrap_or(d.cake_queue_depth_threshold),
    };
    if a.rtt_threshold_ms <= 0.0 {
        v.push(format!(
            "assessment.rtt_threshold_ms must be > 0, got {}",
            a.rtt_threshold_ms
        ));
    }
    a
}

fn resolve_confidence(input: ConfidenceInput, v: &mut Violations) -> ConfidenceConfig {
    let d = ConfidenceConfig::default();
    let c = ConfidenceConfig {
        enabled: input.enabled.unwrap_or(d.enabled),
        dry_run: input.dry_run.unwrap_or(d.dry_run),
        enable_threshold: input.enable_threshold.unwrap_or(d.enable_threshold),
        release_threshold: input.release_threshold.unwrap_or(d.release_threshold),
    };
    if !(0.0..=1.0).contains(&c.enable_threshold) || !(0.0..=1.0).contains(&c.release_threshold) {
        v.push("confidence thresholds must be within [0, 1]");
    }
    if c.release_threshold >= c.enable_threshold {
        v.push(format!(
            "confidence.release_threshold ({}) must be below enable_threshold ({})",
            c.release_threshold, c.enable_threshold
        ));
    }
    c
}

fn resolve_health(input: HealthInput, default_port: u16) -> HealthConfig {
    HealthConfig {
        host: input.host.unwrap_or_else(|| "127.0.0.1".into()),
        port: input.port.unwrap_or(default_port),
    }
}

fn resolve_metrics(input: MetricsInput) -> MetricsConfig {
    MetricsConfig {
        enabled: input.enabled.unwrap_or(true),
        labels: input.labels,
    }
}

fn resolve_storage(input: StorageInput) -> StorageConfig {
    let d = StorageConfig::default();
    StorageConfig {
        db_path: input.db_path.map(PathBuf::from).unwrap_or(d.db_path),
        retention_days: input.retention_days.unwrap_or(d.retention_days).max(1),
    }
}
