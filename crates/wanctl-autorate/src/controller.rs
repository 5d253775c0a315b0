//! The autorate control loop.
//!
//! One cycle, strict order: measure → baseline EWMA (idle-gated,
//! strict `<`) → load EWMA → clamp → classify both directions → pick
//! floors → flash-wear skip → rate-limit gate → retried router push →
//! persist → metrics. Router failures roll the cycle back (no
//! `last_applied` change) and count toward the health degradation
//! threshold; ping failures are absorbed by the configured fallback
//! policy and never fail a cycle.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;

use wanctl_common::config::{AutorateConfig, FallbackMode};
use wanctl_common::ratelimit::{BurstSuppressor, RateLimiter};
use wanctl_common::rtt;
use wanctl_common::shutdown::ShutdownSignal;
use wanctl_common::state::{
    AutorateState, DownState, LoadSource, StateStore, UpState, BASELINE_MAX_MS, BASELINE_MIN_MS,
};
use wanctl_common::metrics as metric_names;
use wanctl_router::RouterBackend;
use wanctl_store::{MetricSample, MetricsStore};

use crate::classify;
use crate::health::{HealthState, Snapshot};

/// Consecutive failed cycles before the health endpoint reports degraded.
pub const DEGRADED_AFTER_FAILURES: u32 = 3;

pub struct AutorateController {
    cfg: AutorateConfig,
    state: AutorateState,
    backend: Box<dyn RouterBackend>,
    store: Option<MetricsStore>,
    limiter: RateLimiter,
    state_store: StateStore,
    health: Arc<HealthState>,
    dry_run: bool,
    labels_json: Option<String>,
    ping_failures: u32,
    cycle_failures: u32,
    throttled_writes: u64,
    first_cycle_done: bool,
    warn_suppress: BurstSuppressor,
}

impl AutorateController {
    pub fn new(
        cfg: AutorateConfig,
        backend: Box<dyn RouterBackend>,
        store: Option<MetricsStore>,
        health: Arc<HealthState>,
        dry_run: bool,
    ) -> Self {
        let state_store = StateStore::new(cfg.state_file.clone());
        let limiter = RateLimiter::new(cfg.write_limit.max_writes, cfg.write_limit.window);
        let labels_json = if cfg.metrics.labels.is_empty() {
            None
        } else {
            serde_json::to_string(&cfg.metrics.labels).ok()
        };
        let mut controller = AutorateController {
            cfg,
            state: AutorateState::default(),
            backend,
            store,
            limiter,
            state_store,
            health,
            dry_run,
            labels_json,
            ping_failures: 0,
            cycle_failures: 0,
            throttled_writes: 0,
            first_cycle_done: false,
            warn_suppress: BurstSuppressor::new(std::time::Duration::from_secs(30)),
        };
        controller.load_state();
        controller
    }

    pub fn state(&self) -> &AutorateState {
        &self.state
    }

    /// Load persisted state and re-establish the invariants the loop
    /// relies on: EWMAs in bounds, rates inside capacity and at or
    /// above the current state's floor.
    pub fn load_state(&mut self) {
        let (mut state, source): (AutorateState, LoadSource) = self.state_store.load();
        state.clamp_to_schema();

        let dl_floor = self.down_floor(state.download.current_state);
        state.download.current_rate_bps = clamp_rate(
            state.download.current_rate_bps,
            dl_floor,
            self.cfg.download.min_capacity_bps,
            self.cfg.download.max_capacity_bps,
        );
        let ul_floor = self.up_floor(state.upload.current_state);
        state.upload.current_rate_bps = clamp_rate(
            state.upload.current_rate_bps,
            ul_floor,
            self.cfg.upload.min_capacity_bps,
            self.cfg.upload.max_capacity_bps,
        );

        if source != LoadSource::Fresh {
            tracing::info!(
                wan = %self.cfg.wan_name,
                state = state.download.current_state.as_str(),
                dl_rate_bps = state.download.current_rate_bps,
                "state loaded"
            );
        }
        self.state = state;
    }

    pub fn save_state(&mut self) -> bool {
        match self.state_store.save(&self.state) {
            Ok(()) => true,
            Err(e) => {
                if self.warn_suppress.allow("state-save") {
                    tracing::warn!(wan = %self.cfg.wan_name, error = %e, "state save failed");
                }
                false
            }
        }
    }

    /// Run one full cycle, measuring RTT first.
    pub async fn run_cycle(&mut self) -> bool {
        let rtt = rtt::measure(&self.cfg.ping).await;
        self.cycle_with_measurement(rtt).await
    }

    /// Cycle body with the measurement injected (tests drive this).
    pub async fn cycle_with_measurement(&mut self, measured: Option<f64>) -> bool {
        let rtt_ms = match measured {
            Some(rtt) => {
                self.ping_failures = 0;
                self.state.last_rtt_ms = Some(rtt);
                rtt
            }
            None => match self.handle_ping_failure().await {
                Some(rtt) => rtt,
                None => return true,
            },
        };

        // Baseline updates only while idle, on a strict `<`, so load
        // cannot drag the reference upward.
        let delta_now = rtt_ms - self.state.ewma.baseline_rtt_ms;
        if delta_now < self.cfg.ewma.baseline_update_threshold_ms {
            let a = self.cfg.ewma.alpha_baseline;
            self.state.ewma.baseline_rtt_ms =
                (1.0 - a) * self.state.ewma.baseline_rtt_ms + a * rtt_ms;
            tracing::debug!(
                wan = %self.cfg.wan_name,
                baseline_ms = self.state.ewma.baseline_rtt_ms,
                "baseline updated"
            );
        }
        let a = self.cfg.ewma.alpha_load;
        self.state.ewma.load_rtt_ms = (1.0 - a) * self.state.ewma.load_rtt_ms + a * rtt_ms;

        self.state.ewma.baseline_rtt_ms = self
            .state
            .ewma
            .baseline_rtt_ms
            .clamp(BASELINE_MIN_MS, BASELINE_MAX_MS);
        self.state.ewma.load_rtt_ms = self
            .state
            .ewma
            .load_rtt_ms
            .clamp(BASELINE_MIN_MS, BASELINE_MAX_MS);

        let delta = self.state.ewma.load_rtt_ms - self.state.ewma.baseline_rtt_ms;

        if let Some((from, to)) =
            classify::classify_download(&mut self.state.download, &self.cfg.thresholds, delta)
        {
            tracing::info!(
                wan = %self.cfg.wan_name,
                from = from.as_str(),
                to = to.as_str(),
                delta_ms = delta,
                "download state transition"
            );
        }
        if let Some((from, to)) =
            classify::classify_upload(&mut self.state.upload, &self.cfg.thresholds, delta)
        {
            tracing::info!(
                wan = %self.cfg.wan_name,
                from = from.as_str(),
                to = to.as_str(),
                delta_ms = delta,
                "upload state transition"
            );
        }

        let new_dl = clamp_rate(
            self.down_floor(self.state.download.current_state),
            0,
            self.cfg.download.min_capacity_bps,
            self.cfg.download.max_capacity_bps,
        );
        let new_ul = clamp_rate(
            self.up_floor(self.state.upload.current_state),
            0,
            self.cfg.upload.min_capacity_bps,
            self.cfg.upload.max_capacity_bps,
        );
        self.state.download.current_rate_bps = new_dl;
        self.state.upload.current_rate_bps = new_ul;

        let mut cycle_ok = true;

        let unchanged = new_dl == self.state.last_applied.dl_rate_bps
            && new_ul == self.state.last_applied.ul_rate_bps;
        if !unchanged {
            if self.limiter.allow() {
                match self.push_rates(new_dl, new_ul).await {
                    Ok(()) => {
                        self.state.last_applied.dl_rate_bps = new_dl;
                        self.state.last_applied.ul_rate_bps = new_ul;
                    }
                    Err(e) => {
                        if self.warn_suppress.allow("router-push") {
                            tracing::warn!(
                                wan = %self.cfg.wan_name,
                                error = %e,
                                "router push failed, keeping last applied rates"
                            );
                        } else {
                            tracing::debug!(wan = %self.cfg.wan_name, error = %e, "router push failed");
                        }
                        cycle_ok = false;
                    }
                }
            } else {
                self.throttled_writes += 1;
                tracing::debug!(
                    wan = %self.cfg.wan_name,
                    dl_bps = new_dl,
                    ul_bps = new_ul,
                    "router write throttled"
                );
            }
        }

        self.state.timestamp = Some(Utc::now());
        if !self.save_state() {
            cycle_ok = false;
        }

        // Health reflects the persisted state before the metrics land.
        self.finish_cycle(cycle_ok);
        self.record_metrics(rtt_ms, delta).await;
        cycle_ok
    }

    /// All ping hosts failed: apply the fallback policy. Returns a
    /// substitute measurement to continue the cycle with, or `None`
    /// when the cycle is done (fallback handled it).
    async fn handle_ping_failure(&mut self) -> Option<f64> {
        match self.cfg.fallback.mode {
            FallbackMode::Freeze => {
                tracing::debug!(wan = %self.cfg.wan_name, "all pings failed, freezing");
                // Contents unchanged — timestamp stays so the file is
                // byte-identical across frozen cycles.
                self.save_state();
                self.finish_cycle(true);
                None
            }
            FallbackMode::UseLastRtt => match self.state.last_rtt_ms {
                Some(last) => {
                    tracing::debug!(
                        wan = %self.cfg.wan_name,
                        rtt_ms = last,
                        "all pings failed, reusing last RTT"
                    );
                    Some(last)
                }
                None => {
                    self.save_state();
                    self.finish_cycle(true);
                    None
                }
            },
            FallbackMode::GracefulDegradation => {
                self.ping_failures += 1;
                if self.ping_failures == self.cfg.fallback.max_consecutive_failures {
                    tracing::warn!(
                        wan = %self.cfg.wan_name,
                        failures = self.ping_failures,
                        "connectivity lost, forcing RED and holding rates"
                    );
                }
                if self.ping_failures >= self.cfg.fallback.max_consecutive_failures {
                    // Force RED but hold the previous caps.
                    self.state.download.current_state = DownState::Red;
                    self.state.upload.current_state = UpState::Red;
                    self.state.timestamp = Some(Utc::now());
                    self.save_state();
                    self.finish_cycle(true);
                    self.record_metrics(f64::NAN, f64::NAN).await;
                } else {
                    self.save_state();
                    self.finish_cycle(true);
                }
                None
            }
        }
    }

    async fn push_rates(&mut self, dl_bps: u64, ul_bps: u64) -> wanctl_router::Result<()> {
        if self.dry_run {
            tracing::info!(
                wan = %self.cfg.wan_name,
                dl_bps,
                ul_bps,
                "dry-run: would set queue limits"
            );
            return Ok(());
        }
        self.backend
            .set_queue_limit(&self.cfg.queues.download, dl_bps)
            .await?;
        self.backend
            .set_queue_limit(&self.cfg.queues.upload, ul_bps)
            .await?;
        tracing::info!(
            wan = %self.cfg.wan_name,
            dl_bps,
            ul_bps,
            "queue limits applied"
        );
        Ok(())
    }

    async fn record_metrics(&self, rtt_ms: f64, delta_ms: f64) {
        let Some(store) = &self.store else {
            return;
        };
        if !self.cfg.metrics.enabled {
            return;
        }
        let ts = Utc::now().timestamp();
        let wan = &self.cfg.wan_name;
        let mut samples = Vec::with_capacity(6);
        if rtt_ms.is_finite() {
            samples.push(MetricSample::raw(ts, wan, metric_names::RTT_MS, rtt_ms));
            samples.push(MetricSample::raw(
                ts,
                wan,
                metric_names::RTT_BASELINE_MS,
                self.state.ewma.baseline_rtt_ms,
            ));
            samples.push(MetricSample::raw(ts, wan, metric_names::RTT_DELTA_MS, delta_ms));
        }
        samples.push(MetricSample::raw(
            ts,
            wan,
            metric_names::RATE_DOWNLOAD_MBPS,
            self.state.download.current_rate_bps as f64 / 1e6,
        ));
        samples.push(MetricSample::raw(
            ts,
            wan,
            metric_names::RATE_UPLOAD_MBPS,
            self.state.upload.current_rate_bps as f64 / 1e6,
        ));
        samples.push(MetricSample::raw(
            ts,
            wan,
            metric_names::STATE,
            self.state.download.current_state.metric_code() as f64,
        ));
        let samples: Vec<MetricSample> = samples
            .into_iter()
            .map(|s| s.with_labels(self.labels_json.clone()))
            .collect();
        if let Err(e) = store.write_metrics_batch(&samples).await {
            tracing::warn!(wan = %self.cfg.wan_name, error = %e, "metrics write failed");
        }
    }

    fn finish_cycle(&mut self, ok: bool) {
        if ok {
            self.cycle_failures = 0;
        } else {
            self.cycle_failures += 1;
        }
        self.first_cycle_done = true;
        self.publish_snapshot();
    }

    fn publish_snapshot(&self) {
        let snapshot = Snapshot {
            starting: !self.first_cycle_done,
            degraded: self.cycle_failures >= DEGRADED_AFTER_FAILURES,
            download_state: self.state.download.current_state.as_str(),
            upload_state: self.state.upload.current_state.as_str(),
            download_rate_bps: self.state.download.current_rate_bps,
            upload_rate_bps: self.state.upload.current_rate_bps,
            baseline_rtt_ms: self.state.ewma.baseline_rtt_ms,
            load_rtt_ms: self.state.ewma.load_rtt_ms,
            last_rtt_ms: self.state.last_rtt_ms,
            cycle_failures: self.cycle_failures,
            throttled_writes: self.throttled_writes,
        };
        self.health.publish(snapshot);
    }

    fn down_floor(&self, state: DownState) -> u64 {
        let f = &self.cfg.download.floors;
        match state {
            DownState::Green => f.green,
            DownState::Yellow => f.yellow,
            DownState::SoftRed => f.soft_red,
            DownState::Red => f.red,
        }
    }

    fn up_floor(&self, state: UpState) -> u64 {
        let f = &self.cfg.upload.floors;
        match state {
            UpState::Green => f.green,
            UpState::Yellow => f.yellow,
            UpState::Red => f.red,
        }
    }

    pub fn throttled_writes(&self) -> u64 {
        self.throttled_writes
    }

    /// Drive the loop until shutdown. Overrunning cycles merge into
    /// the next tick instead of catching up.
    pub async fn run_daemon(&mut self, mut shutdown: ShutdownSignal) -> i32 {
        tracing::info!(
            wan = %self.cfg.wan_name,
            interval_ms = self.cfg.cycle_interval.as_millis() as u64,
            "autorate daemon running"
        );
        loop {
            if shutdown.is_shutdown() {
                break;
            }
            let started = Instant::now();
            self.run_cycle().await;
            let elapsed = started.elapsed();
            if elapsed < self.cfg.cycle_interval
                && shutdown.sleep(self.cfg.cycle_interval - elapsed).await
            {
                break;
            }
        }

        // One final write on the way out, then release the transport.
        self.state.timestamp = Some(Utc::now());
        self.save_state();
        self.backend.close().await;
        tracing::info!(wan = %self.cfg.wan_name, "autorate daemon stopped");
        130
    }
}

fn clamp_rate(rate: u64, floor: u64, min: u64, max: u64) -> u64 {
    let clamped = rate.max(floor).clamp(min, max);
    if clamped != rate && rate != 0 {
        tracing::warn!(rate, clamped, "rate outside bounds, clamped");
    }
    clamped
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use wanctl_common::config::{AutorateConfigInput, ConfigError, FallbackConfig};
    use wanctl_router::testing::RecordingBackend;

    fn test_config(dir: &std::path::Path) -> AutorateConfig {
        let yaml = format!(
            r#"
wan_name: primary
queues:
  download: wan1-download
  upload: wan1-upload
router:
  transport: rest
  host: 192.168.88.1
  user: wanctl
  password_env: WANCTL_ROUTER_PASSWORD
download:
  max_capacity_bps: 940000000
  min_capacity_bps: 50000000
  floors_bps:
    green: 940000000
    yellow: 800000000
    soft_red: 500000000
    red: 200000000
upload:
  max_capacity_bps: 40000000
  min_capacity_bps: 5000000
  floors_bps:
    green: 40000000
    yellow: 30000000
    red: 10000000
thresholds:
  yellow_ms: 5.0
  soft_red_ms: 15.0
  red_ms: 30.0
  upgrade_samples: 8
  downgrade_samples: 60
ewma:
  alpha_baseline: 0.001
  alpha_load: 0.05
  baseline_update_threshold_ms: 5.0
ping:
  hosts: [1.1.1.1]
cycle_interval_seconds: 0.05
state_file: {state}
lock_file: {lock}
metrics:
  enabled: false
"#,
            state = dir.join("state.json").display(),
            lock = dir.join("wan.lock").display(),
        );
        let input: AutorateConfigInput = serde_yaml::from_str(&yaml).unwrap();
        input.resolve().unwrap()
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        backend: Arc<RecordingBackend>,
        controller: AutorateController,
    }

    fn fixture() -> Fixture {
        fixture_with(|_| {})
    }

    fn fixture_with(tweak: impl FnOnce(&mut AutorateConfig)) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = test_config(dir.path());
        tweak(&mut cfg);
        let backend = Arc::new(RecordingBackend::new());
        let health = Arc::new(HealthState::new(
            cfg.wan_name.clone(),
            cfg.storage.db_path.clone(),
        ));
        let controller =
            AutorateController::new(cfg, Box::new(backend.clone()), None, health, false);
        Fixture {
            _dir: dir,
            backend,
            controller,
        }
    }

    fn assert_invariants(c: &AutorateController) {
        let s = c.state();
        assert!(s.ewma.baseline_rtt_ms >= BASELINE_MIN_MS);
        assert!(s.ewma.baseline_rtt_ms <= BASELINE_MAX_MS);
        assert!(s.ewma.load_rtt_ms >= BASELINE_MIN_MS);
        assert!(s.ewma.load_rtt_ms <= BASELINE_MAX_MS);
        assert!(s.download.current_rate_bps >= c.cfg.download.min_capacity_bps);
        assert!(s.download.current_rate_bps <= c.cfg.download.max_capacity_bps);
        assert!(s.download.current_rate_bps >= c.down_floor(s.download.current_state));
        assert!(s.upload.current_rate_bps >= c.up_floor(s.upload.current_state));
    }

    // Scenario: cold start into steady state. Constant 25 ms RTT —
    // GREEN, full rate, exactly one router push (then flash-wear skips).
    #[tokio::test]
    async fn cold_start_steady_state() {
        let mut f = fixture();
        for _ in 0..200 {
            assert!(f.controller.cycle_with_measurement(Some(25.0)).await);
            assert_invariants(&f.controller);
        }
        let s = f.controller.state();
        assert_eq!(s.download.current_state, DownState::Green);
        assert_eq!(s.download.current_rate_bps, 940_000_000);
        assert!((s.ewma.baseline_rtt_ms - 25.0).abs() < 1.0);
        assert!((s.ewma.load_rtt_ms - 25.0).abs() < 0.1);
        // Both queues pushed once on the first cycle, then skipped.
        assert_eq!(f.backend.write_count(), 2);
        assert_eq!(s.last_applied.dl_rate_bps, 940_000_000);
    }

    // Scenario: congestion onset. 100 idle cycles then RTT steps to
    // 35 ms; delta crosses T_yellow, holds below T_soft_red → YELLOW
    // at 800 Mbps and no further escalation.
    #[tokio::test]
    async fn congestion_onset_into_yellow() {
        let mut f = fixture();
        for _ in 0..100 {
            f.controller.cycle_with_measurement(Some(25.0)).await;
        }
        assert_eq!(f.controller.state().download.current_state, DownState::Green);

        for _ in 100..200 {
            f.controller.cycle_with_measurement(Some(35.0)).await;
            assert_invariants(&f.controller);
        }
        let s = f.controller.state();
        assert_eq!(s.download.current_state, DownState::Yellow);
        assert_eq!(s.download.current_rate_bps, 800_000_000);
        // Baseline froze under load (strict < gate): still near 25.
        assert!(s.ewma.baseline_rtt_ms < 26.0);
        // Load converged toward 35 → delta ≈ 10, below T_soft_red.
        assert!(s.ewma.load_rtt_ms > 33.0);
        assert_eq!(s.last_applied.dl_rate_bps, 800_000_000);
    }

    // Scenario: freeze fallback. After one good cycle, nine failed
    // measurement cycles leave state, rates, and the file untouched.
    #[tokio::test]
    async fn freeze_fallback_holds_everything() {
        let mut f = fixture();
        assert!(f.controller.cycle_with_measurement(Some(25.0)).await);
        let calls_before = f.backend.call_count();
        let state_path = f.controller.state_store.path().to_path_buf();
        let contents_before = std::fs::read_to_string(&state_path).unwrap();
        let ewma_before = f.controller.state().ewma.clone();

        for _ in 0..9 {
            assert!(f.controller.cycle_with_measurement(None).await);
        }

        let s = f.controller.state();
        assert_eq!(s.ewma.baseline_rtt_ms, ewma_before.baseline_rtt_ms);
        assert_eq!(s.ewma.load_rtt_ms, ewma_before.load_rtt_ms);
        assert_eq!(s.download.current_state, DownState::Green);
        // Zero router calls during the outage.
        assert_eq!(f.backend.call_count(), calls_before);
        // File contents identical (mtime may differ).
        let contents_after = std::fs::read_to_string(&state_path).unwrap();
        assert_eq!(contents_before, contents_after);
    }

    #[tokio::test]
    async fn use_last_rtt_fallback_keeps_loop_running() {
        let mut f = fixture_with(|cfg| {
            cfg.fallback = FallbackConfig {
                mode: FallbackMode::UseLastRtt,
                max_consecutive_failures: 10,
            };
        });
        f.controller.cycle_with_measurement(Some(25.0)).await;
        let load_before = f.controller.state().ewma.load_rtt_ms;
        // Failed measurement reuses 25 ms — EWMAs keep converging.
        f.controller.cycle_with_measurement(None).await;
        let load_after = f.controller.state().ewma.load_rtt_ms;
        assert!(load_after.is_finite());
        assert!((load_after - load_before).abs() < 1.0);
    }

    #[tokio::test]
    async fn graceful_degradation_forces_red_and_holds_rates() {
        let mut f = fixture_with(|cfg| {
            cfg.fallback = FallbackConfig {
                mode: FallbackMode::GracefulDegradation,
                max_consecutive_failures: 3,
            };
        });
        f.controller.cycle_with_measurement(Some(25.0)).await;
        let rate_before = f.controller.state().download.current_rate_bps;
        let writes_before = f.backend.write_count();

        for _ in 0..5 {
            assert!(f.controller.cycle_with_measurement(None).await);
        }
        let s = f.controller.state();
        assert_eq!(s.download.current_state, DownState::Red);
        assert_eq!(s.upload.current_state, UpState::Red);
        // Rates held, not dropped to the RED floor.
        assert_eq!(s.download.current_rate_bps, rate_before);
        assert_eq!(f.backend.write_count(), writes_before);

        // Connectivity returns: the failure counter resets and the
        // classifier walks back down on its own evidence.
        f.controller.cycle_with_measurement(Some(25.0)).await;
        assert_eq!(f.controller.ping_failures, 0);
    }

    // Scenario: the write rate limiter. 10 writes/60 s; the 11th
    // distinct target is throttled, not pushed.
    #[tokio::test]
    async fn rate_limiter_throttles_eleventh_write() {
        let mut f = fixture();
        // Each cycle pushes both queues but consumes one permit; drive
        // distinct targets by walking states up and down isn't practical
        // here, so exercise the limiter directly through push gating:
        // force distinct last_applied each cycle.
        for i in 0..11u64 {
            f.controller.state.last_applied.dl_rate_bps = i; // force "changed"
            f.controller.cycle_with_measurement(Some(25.0)).await;
        }
        // 10 permitted pushes (2 queue calls each), the 11th throttled.
        assert_eq!(f.backend.write_count(), 20);
        assert_eq!(f.controller.throttled_writes(), 1);
    }

    #[tokio::test]
    async fn router_failure_preserves_last_applied() {
        let mut f = fixture();
        f.backend.set_fail_writes(true);
        let ok = f.controller.cycle_with_measurement(Some(25.0)).await;
        assert!(!ok);
        let s = f.controller.state();
        // No update on failure — the next cycle retries.
        assert_eq!(s.last_applied.dl_rate_bps, 0);
        assert_eq!(s.last_applied.ul_rate_bps, 0);

        f.backend.set_fail_writes(false);
        assert!(f.controller.cycle_with_measurement(Some(25.0)).await);
        assert_eq!(f.controller.state().last_applied.dl_rate_bps, 940_000_000);
    }

    #[tokio::test]
    async fn three_failures_mark_degraded() {
        let mut f = fixture();
        f.backend.set_fail_writes(true);
        for i in 0..3u64 {
            // Distinct targets so flash-wear doesn't hide the failure.
            f.controller.state.last_applied.dl_rate_bps = i;
            f.controller.cycle_with_measurement(Some(25.0)).await;
        }
        assert_eq!(f.controller.cycle_failures, 3);
        assert!(f.controller.health.snapshot().degraded);

        f.backend.set_fail_writes(false);
        f.controller.state.last_applied.dl_rate_bps = 7;
        f.controller.cycle_with_measurement(Some(25.0)).await;
        assert!(!f.controller.health.snapshot().degraded);
    }

    #[tokio::test]
    async fn state_survives_restart_via_file() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());
        let health = Arc::new(HealthState::new(
            cfg.wan_name.clone(),
            cfg.storage.db_path.clone(),
        ));
        let backend = Box::new(RecordingBackend::new());
        let mut first =
            AutorateController::new(cfg.clone(), backend, None, health.clone(), false);
        for _ in 0..10 {
            first.cycle_with_measurement(Some(30.0)).await;
        }
        let saved_baseline = first.state().ewma.baseline_rtt_ms;
        drop(first);

        let second = AutorateController::new(
            cfg,
            Box::new(RecordingBackend::new()),
            None,
            health,
            false,
        );
        assert!((second.state().ewma.baseline_rtt_ms - saved_baseline).abs() < 1e-9);
        assert_eq!(second.state().download.current_state, DownState::Green);
    }

    #[tokio::test]
    async fn baseline_gate_is_strict_at_equality() {
        let mut f = fixture();
        // Pin the baseline and fire a measurement exactly threshold above.
        f.controller.state.ewma.baseline_rtt_ms = 25.0;
        f.controller.state.ewma.load_rtt_ms = 25.0;
        f.controller.cycle_with_measurement(Some(30.0)).await; // delta == 5.0
        // Strict `<`: equality freezes the baseline.
        assert_eq!(f.controller.state().ewma.baseline_rtt_ms, 25.0);

        f.controller.state.ewma.baseline_rtt_ms = 25.0;
        f.controller.cycle_with_measurement(Some(29.999)).await; // delta < 5.0
        assert!(f.controller.state().ewma.baseline_rtt_ms > 25.0);
    }

    #[tokio::test]
    async fn ewma_clamped_to_bounds_on_extreme_input() {
        let mut f = fixture();
        for _ in 0..500 {
            f.controller.cycle_with_measurement(Some(500.0)).await;
            assert_invariants(&f.controller);
        }
        assert_eq!(f.controller.state().ewma.load_rtt_ms, BASELINE_MAX_MS);
        for _ in 0..500 {
            f.controller.cycle_with_measurement(Some(1.0)).await;
            assert_invariants(&f.controller);
        }
        assert_eq!(f.controller.state().ewma.load_rtt_ms, BASELINE_MIN_MS);
    }

    #[test]
    fn config_error_lists_are_surfaced() {
        // Spot check that resolve failures reach this crate intact.
        let input: AutorateConfigInput = serde_yaml::from_str("{}").unwrap();
        match input.resolve() {
            Err(ConfigError::Invalid { violations }) => assert!(!violations.is_empty()),
            other => panic!("expected Invalid, got {other:?}"),
        }
    }
}
