//! Confidence classifier (shadow deployment).
//!
//! Blends the RTT excess, queue indicators, and recent-history
//! agreement into one score in [0, 1]. The hysteresis classifier
//! stays authoritative; this controller's decisions are logged and
//! surfaced in health output so the scoring can be evaluated in the
//! field before it is ever allowed to act.

use wanctl_common::config::ConfidenceConfig;

const W_RTT: f64 = 0.5;
const W_QUEUE: f64 = 0.3;
const W_HISTORY: f64 = 0.2;

/// Score inputs for one cycle.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConfidenceInputs {
    /// Smoothed RTT delta, ms.
    pub rtt_delta_ms: f64,
    /// The configured RTT threshold, ms.
    pub rtt_threshold_ms: f64,
    /// Queue depth relative to its threshold, >= 0 (1.0 = at threshold).
    pub queue_pressure: f64,
    /// Fraction of recent assessments that were RED, in [0, 1].
    pub red_fraction: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerState {
    Idle,
    Arming,
    Armed,
}

impl TimerState {
    pub fn as_str(self) -> &'static str {
        match self {
            TimerState::Idle => "idle",
            TimerState::Arming => "arming",
            TimerState::Armed => "armed",
        }
    }
}

/// One cycle's shadow decision.
#[derive(Debug, Clone, Copy)]
pub struct ConfidenceDecision {
    pub score: f64,
    pub timer_state: TimerState,
    pub wants_enable: bool,
    pub wants_release: bool,
}

pub struct ConfidenceController {
    cfg: ConfidenceConfig,
    score: f64,
    timer_state: TimerState,
    pub dry_run_enable_decisions: u64,
    pub dry_run_release_decisions: u64,
}

impl ConfidenceController {
    pub fn new(cfg: ConfidenceConfig) -> Self {
        ConfidenceController {
            cfg,
            score: 0.0,
            timer_state: TimerState::Idle,
            dry_run_enable_decisions: 0,
            dry_run_release_decisions: 0,
        }
    }

    pub fn score(&self) -> f64 {
        self.score
    }

    pub fn timer_state(&self) -> TimerState {
        self.timer_state
    }

    pub fn update(&mut self, inputs: &ConfidenceInputs) -> ConfidenceDecision {
        // RTT component saturates at 2× threshold.
        let rtt_component = if inputs.rtt_threshold_ms > 0.0 {
            (inputs.rtt_delta_ms / (2.0 * inputs.rtt_threshold_ms)).clamp(0.0, 1.0)
        } else {
            0.0
        };
        let queue_component = inputs.queue_pressure.clamp(0.0, 1.0);
        let history_component = inputs.red_fraction.clamp(0.0, 1.0);

        self.score =
            W_RTT * rtt_component + W_QUEUE * queue_component + W_HISTORY * history_component;

        self.timer_state = if self.score >= self.cfg.enable_threshold {
            TimerState::Armed
        } else if self.score > self.cfg.release_threshold {
            TimerState::Arming
        } else {
            TimerState::Idle
        };

        let decision = ConfidenceDecision {
            score: self.score,
            timer_state: self.timer_state,
            wants_enable: self.timer_state == TimerState::Armed,
            wants_release: self.timer_state == TimerState::Idle,
        };
        if self.cfg.dry_run {
            if decision.wants_enable {
                self.dry_run_enable_decisions += 1;
            }
            if decision.wants_release {
                self.dry_run_release_decisions += 1;
            }
        }
        decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> ConfidenceController {
        ConfidenceController::new(ConfidenceConfig {
            enabled: true,
            dry_run: true,
            enable_threshold: 0.8,
            release_threshold: 0.3,
        })
    }

    #[test]
    fn quiet_link_scores_low() {
        let mut c = controller();
        let d = c.update(&ConfidenceInputs {
            rtt_delta_ms: 2.0,
            rtt_threshold_ms: 30.0,
            queue_pressure: 0.0,
            red_fraction: 0.0,
        });
        assert!(d.score < 0.1);
        assert_eq!(d.timer_state, TimerState::Idle);
        assert!(d.wants_release);
    }

    #[test]
    fn saturated_signals_arm() {
        let mut c = controller();
        let d = c.update(&ConfidenceInputs {
            rtt_delta_ms: 90.0, // 3× threshold, saturates the RTT term
            rtt_threshold_ms: 30.0,
            queue_pressure: 1.5,
            red_fraction: 1.0,
        });
        assert!((d.score - 1.0).abs() < 1e-9);
        assert_eq!(d.timer_state, TimerState::Armed);
        assert!(d.wants_enable);
    }

    #[test]
    fn mid_scores_hold_in_arming() {
        let mut c = controller();
        let d = c.update(&ConfidenceInputs {
            rtt_delta_ms: 30.0, // half the saturated RTT term
            rtt_threshold_ms: 30.0,
            queue_pressure: 0.5,
            red_fraction: 0.0,
        });
        // 0.5·0.5 + 0.3·0.5 = 0.4: between release (0.3) and enable (0.8).
        assert_eq!(d.timer_state, TimerState::Arming);
        assert!(!d.wants_enable);
        assert!(!d.wants_release);
    }

    #[test]
    fn dry_run_counters_accumulate() {
        let mut c = controller();
        let hot = ConfidenceInputs {
            rtt_delta_ms: 90.0,
            rtt_threshold_ms: 30.0,
            queue_pressure: 1.0,
            red_fraction: 1.0,
        };
        c.update(&hot);
        c.update(&hot);
        assert_eq!(c.dry_run_enable_decisions, 2);
        assert_eq!(c.dry_run_release_decisions, 0);
    }

    #[test]
    fn score_bounded_zero_to_one() {
        let mut c = controller();
        let d = c.update(&ConfidenceInputs {
            rtt_delta_ms: 10_000.0,
            rtt_threshold_ms: 30.0,
            queue_pressure: 100.0,
            red_fraction: 5.0,
        });
        assert!(d.score <= 1.0);
        assert!(d.score >= 0.0);
    }
}
