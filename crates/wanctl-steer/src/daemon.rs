//! The steering control loop.
//!
//! Nine steps per cycle: read the primary WAN's autorate state,
//! measure own RTT, optionally read CAKE queue stats, smooth, assess,
//! run the hysteresis machine, shadow-run the confidence classifier,
//! persist, record metrics. The mangle rule flips only on counter
//! satisfaction, and only a successful router call commits a
//! transition — a failure leaves the counters that fired intact so
//! the next cycle retries.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;

use wanctl_common::config::SteeringConfig;
use wanctl_common::ewma::Ewma;
use wanctl_common::ratelimit::BurstSuppressor;
use wanctl_common::metrics as metric_names;
use wanctl_common::rtt;
use wanctl_common::shutdown::ShutdownSignal;
use wanctl_common::state::{
    push_bounded, AutorateState, SteerState, SteeringState, StateStore, BASELINE_MAX_MS,
    BASELINE_MIN_MS,
};
use wanctl_router::{QueueStats, RouterBackend};
use wanctl_store::{MetricSample, MetricsStore};

use crate::assess::{self, AssessmentInputs};
use crate::confidence::{ConfidenceController, ConfidenceInputs};
use crate::health::{SteerHealth, SteerSnapshot};

/// Consecutive failed cycles before health reports degraded.
pub const DEGRADED_AFTER_FAILURES: u32 = 3;
/// Consecutive CAKE read failures before the ERROR escalation.
const CAKE_ERROR_AFTER: u32 = 3;

/// Smoothing for the per-daemon delta/depth EWMAs (display and
/// confidence inputs; the raw delta feeds the assessment so the
/// hysteresis counters remain the only damping).
const DELTA_ALPHA: f64 = 0.2;
const DEPTH_ALPHA: f64 = 0.1;

/// Queue statistics outcome for one cycle.
#[derive(Debug, Clone, Copy)]
pub enum CakeReading {
    /// CAKE-aware mode off.
    Disabled,
    Ok(QueueStats),
    Failed,
}

/// What autorate is doing, as read from its state file.
#[derive(Debug, Clone, Copy)]
struct PrimaryView {
    baseline_rtt_ms: f64,
    download_state: wanctl_common::state::DownState,
    applied_dl_bps: u64,
}

pub struct SteerDaemon {
    cfg: SteeringConfig,
    state: SteeringState,
    backend: Box<dyn RouterBackend>,
    store: Option<MetricsStore>,
    state_store: StateStore,
    health: Arc<SteerHealth>,
    confidence: Option<ConfidenceController>,
    delta_ewma: Ewma,
    depth_ewma: Ewma,
    dry_run: bool,
    last_cake_drops: Option<u64>,
    cycle_failures: u32,
    first_cycle_done: bool,
    warn_suppress: BurstSuppressor,
}

impl SteerDaemon {
    pub fn new(
        cfg: SteeringConfig,
        backend: Box<dyn RouterBackend>,
        store: Option<MetricsStore>,
        health: Arc<SteerHealth>,
        dry_run: bool,
    ) -> Self {
        let state_store = StateStore::new(cfg.state_file.clone());
        let (mut state, _source): (SteeringState, _) = state_store.load();
        state.clamp_to_schema();
        state.bound_histories(cfg.history_size);
        if state.baseline_rtt_ms <= 0.0 {
            state.baseline_rtt_ms = cfg.baseline_rtt_ms;
        }

        let confidence = cfg
            .confidence
            .enabled
            .then(|| ConfidenceController::new(cfg.confidence));

        SteerDaemon {
            delta_ewma: Ewma::new(DELTA_ALPHA),
            depth_ewma: Ewma::new(DEPTH_ALPHA),
            cfg,
            state,
            backend,
            store,
            state_store,
            health,
            confidence,
            dry_run,
            last_cake_drops: None,
            cycle_failures: 0,
            first_cycle_done: false,
            warn_suppress: BurstSuppressor::new(std::time::Duration::from_secs(30)),
        }
    }

    pub fn state(&self) -> &SteeringState {
        &self.state
    }

    /// Run one cycle: gather the live inputs, then assess.
    pub async fn run_cycle(&mut self) -> bool {
        let rtt_ms = rtt::measure(&self.cfg.ping).await;
        let cake = if self.cfg.cake_aware_enabled {
            match self
                .backend
                .get_queue_stats(&self.cfg.queues.download)
                .await
            {
                Ok(Some(stats)) => CakeReading::Ok(stats),
                Ok(None) | Err(_) => CakeReading::Failed,
            }
        } else {
            CakeReading::Disabled
        };
        self.cycle_with_inputs(rtt_ms, cake).await
    }

    /// Cycle body with the measurements injected (tests drive this).
    pub async fn cycle_with_inputs(&mut self, rtt_ms: Option<f64>, cake: CakeReading) -> bool {
        // Step 1: primary autorate state. Missing/corrupt files are
        // tolerated — the daemon falls back to its own baseline.
        if let Some(primary) = read_primary_state(&self.cfg.primary_state_file) {
            self.state.baseline_rtt_ms = primary
                .baseline_rtt_ms
                .clamp(BASELINE_MIN_MS, BASELINE_MAX_MS);
            tracing::trace!(
                primary_state = primary.download_state.as_str(),
                primary_dl_bps = primary.applied_dl_bps,
                "primary autorate view"
            );
        }

        // Step 2: without an RTT sample there is nothing to assess;
        // counters hold and the cycle is not a failure.
        let Some(rtt_ms) = rtt_ms else {
            tracing::debug!(wan = %self.cfg.wan_name, "no RTT sample, holding counters");
            self.persist();
            self.finish_cycle(true);
            return true;
        };

        // Step 3: queue statistics, never blocking the cycle.
        let (drops_delta, queue_depth) = self.ingest_cake(cake);

        // Step 4: per-daemon smoothing.
        let delta = rtt_ms - self.state.baseline_rtt_ms;
        let smoothed_delta = self.delta_ewma.update(delta);
        let smoothed_depth = self.depth_ewma.update(queue_depth as f64);

        // Step 5: degradation condition. The raw delta feeds the
        // assessment — the counters are the damping.
        let inputs = AssessmentInputs {
            rtt_delta_ms: delta,
            cake_drops_delta: drops_delta,
            queue_depth,
        };
        let assessment = assess::evaluate(&self.cfg.assessment, self.cfg.cake_aware_enabled, &inputs);

        // Step 6: unified hysteresis machine.
        let mut cycle_ok = true;
        self.update_counters(&assessment);
        if !self.apply_transition().await {
            cycle_ok = false;
        }
        if self.state.current_state != SteerState::Red {
            self.state.current_state = if assessment.is_degraded || assessment.is_warning {
                SteerState::Yellow
            } else {
                SteerState::Green
            };
        }

        // Step 7: confidence classifier, shadow only.
        if let Some(confidence) = &mut self.confidence {
            let red_fraction = red_fraction(&self.state);
            let decision = confidence.update(&ConfidenceInputs {
                rtt_delta_ms: smoothed_delta,
                rtt_threshold_ms: self.cfg.assessment.rtt_threshold_ms,
                queue_pressure: smoothed_depth
                    / self.cfg.assessment.cake_queue_depth_threshold.max(1) as f64,
                red_fraction,
            });
            if decision.wants_enable && !self.state.steering_enabled {
                tracing::info!(
                    score = decision.score,
                    "confidence classifier would enable steering (shadow)"
                );
            } else if decision.wants_release && self.state.steering_enabled {
                tracing::info!(
                    score = decision.score,
                    "confidence classifier would release steering (shadow)"
                );
            }
            self.state.confidence = Some(wanctl_common::state::ConfidenceState {
                score: decision.score,
                timer_state: decision.timer_state.as_str().to_string(),
                dry_run_enable_decisions: confidence.dry_run_enable_decisions,
                dry_run_release_decisions: confidence.dry_run_release_decisions,
            });
        }

        // Step 8: bounded histories + atomic persist.
        let cap = self.cfg.history_size;
        push_bounded(&mut self.state.history_rtt, rtt_ms, cap);
        push_bounded(&mut self.state.history_delta, delta, cap);
        push_bounded(&mut self.state.cake_drops_history, drops_delta, cap);
        push_bounded(&mut self.state.queue_depth_history, queue_depth, cap);
        push_bounded(&mut self.state.congestion_state_history, assessment.state, 10);
        self.state.timestamp = Some(Utc::now());
        if !self.persist() {
            cycle_ok = false;
        }

        // Step 9: metrics, after health reflects the persisted state.
        self.finish_cycle(cycle_ok);
        self.record_metrics(rtt_ms, delta).await;
        cycle_ok
    }

    fn ingest_cake(&mut self, cake: CakeReading) -> (u64, u64) {
        match cake {
            CakeReading::Disabled => (0, 0),
            CakeReading::Ok(stats) => {
                self.state.cake_failures = 0;
                let drops_delta = match self.last_cake_drops {
                    Some(last) => stats.drops.saturating_sub(last),
                    None => 0,
                };
                self.last_cake_drops = Some(stats.drops);
                (drops_delta, stats.queued_packets)
            }
            CakeReading::Failed => {
                self.state.cake_failures = self.state.cake_failures.saturating_add(1);
                if self.state.cake_failures == 1 {
                    tracing::warn!(wan = %self.cfg.wan_name, "CAKE stats read failed");
                } else if self.state.cake_failures == CAKE_ERROR_AFTER {
                    tracing::error!(
                        wan = %self.cfg.wan_name,
                        failures = self.state.cake_failures,
                        "CAKE stats degraded"
                    );
                }
                (0, 0)
            }
        }
    }

    fn update_counters(&mut self, a: &assess::Assessment) {
        let red_cap = self.cfg.red_samples_required + 1;
        let green_cap = self.cfg.green_samples_required + 1;
        if a.is_degraded {
            self.state.red_count = (self.state.red_count + 1).min(red_cap);
            self.state.bad_count = (self.state.bad_count + 1).min(red_cap);
            self.state.good_count = 0;
            self.state.yellow_count = 0;
        } else if a.is_warning {
            // RTT-only signal: hold position, drop the RED evidence
            // silently, and do not count toward recovery either.
            self.state.yellow_count = (self.state.yellow_count + 1).min(red_cap);
            self.state.bad_count = (self.state.bad_count + 1).min(red_cap);
            self.state.red_count = 0;
            self.state.good_count = 0;
        } else {
            self.state.good_count = (self.state.good_count + 1).min(green_cap);
            self.state.red_count = 0;
            self.state.yellow_count = 0;
            self.state.bad_count = 0;
        }
    }

    /// At most one router transition per cycle. Only success commits:
    /// on failure the counters that fired stay put for a retry.
    async fn apply_transition(&mut self) -> bool {
        if self.state.current_state != SteerState::Red
            && self.state.red_count >= self.cfg.red_samples_required
        {
            if self.execute_steering_transition(true).await {
                tracing::info!(
                    wan = %self.cfg.wan_name,
                    red_count = self.state.red_count,
                    "primary degraded, steering enabled"
                );
                self.state.current_state = SteerState::Red;
                self.state.steering_enabled = true;
                self.state.red_count = 0;
                self.state.good_count = 0;
                self.state.last_transition_ts = Some(Utc::now());
                self.state.last_router_action_ts = Some(Utc::now());
            } else {
                return false;
            }
        } else if self.state.current_state == SteerState::Red
            && self.state.good_count >= self.cfg.green_samples_required
        {
            if self.execute_steering_transition(false).await {
                tracing::info!(
                    wan = %self.cfg.wan_name,
                    good_count = self.state.good_count,
                    "primary recovered, steering disabled"
                );
                self.state.current_state = SteerState::Green;
                self.state.steering_enabled = false;
                self.state.good_count = 0;
                self.state.red_count = 0;
                self.state.last_transition_ts = Some(Utc::now());
                self.state.last_router_action_ts = Some(Utc::now());
            } else {
                return false;
            }
        }
        true
    }

    async fn execute_steering_transition(&mut self, enable: bool) -> bool {
        if self.dry_run {
            tracing::info!(enable, "dry-run: would toggle steering mangle rule");
            return true;
        }
        let result = if enable {
            self.backend.enable_steering().await
        } else {
            self.backend.disable_steering().await
        };
        match result {
            Ok(()) => true,
            Err(e) => {
                self.state.router_failures = self.state.router_failures.saturating_add(1);
                if self.warn_suppress.allow("steering-transition") {
                    tracing::warn!(
                        wan = %self.cfg.wan_name,
                        enable,
                        error = %e,
                        "steering transition failed, will retry"
                    );
                } else {
                    tracing::debug!(wan = %self.cfg.wan_name, enable, error = %e, "steering transition failed");
                }
                false
            }
        }
    }

    fn persist(&mut self) -> bool {
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

    async fn record_metrics(&self, rtt_ms: f64, delta_ms: f64) {
        let Some(store) = &self.store else {
            return;
        };
        if !self.cfg.metrics.enabled {
            return;
        }
        let ts = Utc::now().timestamp();
        let wan = &self.cfg.wan_name;
        let samples = vec![
            MetricSample::raw(ts, wan, metric_names::RTT_MS, rtt_ms),
            MetricSample::raw(ts, wan, metric_names::RTT_DELTA_MS, delta_ms),
            MetricSample::raw(
                ts,
                wan,
                metric_names::STEERING_ENABLED,
                if self.state.steering_enabled { 1.0 } else { 0.0 },
            ),
        ];
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
        let confidence = self.state.confidence.as_ref().map(|c| {
            (
                c.score,
                if c.timer_state == "armed" {
                    "enable"
                } else if c.timer_state == "idle" {
                    "release"
                } else {
                    "hold"
                },
            )
        });
        self.health.publish(SteerSnapshot {
            starting: !self.first_cycle_done,
            degraded: self.cycle_failures >= DEGRADED_AFTER_FAILURES,
            steering_enabled: self.state.steering_enabled,
            state: self.state.current_state,
            last_transition_ts: self.state.last_transition_ts,
            red_count: self.state.red_count,
            good_count: self.state.good_count,
            router_failures: self.state.router_failures,
            cake_failures: self.state.cake_failures,
            confidence,
        });
    }

    /// Drive the loop until shutdown; one final persist on the way out.
    pub async fn run_daemon_loop(&mut self, mut shutdown: ShutdownSignal) -> i32 {
        tracing::info!(
            wan = %self.cfg.wan_name,
            interval_ms = self.cfg.interval.as_millis() as u64,
            cake_aware = self.cfg.cake_aware_enabled,
            "steering daemon running"
        );
        loop {
            if shutdown.is_shutdown() {
                break;
            }
            let started = Instant::now();
            self.run_cycle().await;
            let elapsed = started.elapsed();
            if elapsed < self.cfg.interval && shutdown.sleep(self.cfg.interval - elapsed).await {
                break;
            }
        }
        self.state.timestamp = Some(Utc::now());
        self.persist();
        self.backend.close().await;
        tracing::info!(wan = %self.cfg.wan_name, "steering daemon stopped");
        130
    }
}

/// Fraction of recent assessments that were RED, for confidence scoring.
fn red_fraction(state: &SteeringState) -> f64 {
    if state.congestion_state_history.is_empty() {
        return 0.0;
    }
    let red = state
        .congestion_state_history
        .iter()
        .filter(|s| **s == SteerState::Red)
        .count();
    red as f64 / state.congestion_state_history.len() as f64
}

/// Tolerant read of the primary autorate state file: missing, stale,
/// torn, or corrupt files all yield `None`.
fn read_primary_state(path: &Path) -> Option<PrimaryView> {
    let raw = std::fs::read_to_string(path).ok()?;
    let parsed: AutorateState = serde_json::from_str(&raw).ok()?;
    let baseline = parsed.ewma.baseline_rtt_ms;
    if !baseline.is_finite() || baseline <= 0.0 {
        return None;
    }
    Some(PrimaryView {
        baseline_rtt_ms: baseline,
        download_state: parsed.download.current_state,
        applied_dl_bps: parsed.last_applied.dl_rate_bps,
    })
}
