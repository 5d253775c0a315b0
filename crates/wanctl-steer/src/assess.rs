//! Per-cycle degradation assessment.
//!
//! CAKE-aware mode demands agreement between the latency signal and a
//! queue signal before calling the link degraded; RTT alone is only a
//! warning. Legacy mode (no queue visibility) degrades on RTT alone.

use wanctl_common::config::AssessmentConfig;
use wanctl_common::state::SteerState;

/// Signals feeding one assessment. A failed CAKE read supplies zeros
/// for drops/depth, so in CAKE-aware mode a stats outage caps the
/// verdict at YELLOW rather than inventing a RED.
#[derive(Debug, Clone, Copy, Default)]
pub struct AssessmentInputs {
    /// RTT delta over the primary baseline, ms.
    pub rtt_delta_ms: f64,
    /// CAKE drops accumulated since the previous cycle.
    pub cake_drops_delta: u64,
    /// Current CAKE queue depth in packets.
    pub queue_depth: u64,
}

/// One cycle's verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Assessment {
    pub is_degraded: bool,
    pub is_recovered: bool,
    pub is_warning: bool,
    pub state: SteerState,
}

pub fn evaluate(cfg: &AssessmentConfig, cake_aware: bool, inputs: &AssessmentInputs) -> Assessment {
    let rtt_over = inputs.rtt_delta_ms > cfg.rtt_threshold_ms;

    if cake_aware {
        let queue_over = inputs.cake_drops_delta >= cfg.cake_drops_threshold
            || inputs.queue_depth >= cfg.cake_queue_depth_threshold;
        let degraded = rtt_over && queue_over;
        let warning = rtt_over && !queue_over;
        Assessment {
            is_degraded: degraded,
            is_recovered: !rtt_over,
            is_warning: warning,
            state: if degraded {
                SteerState::Red
            } else if warning {
                SteerState::Yellow
            } else {
                SteerState::Green
            },
        }
    } else {
        // Legacy: RTT is the only signal.
        Assessment {
            is_degraded: rtt_over,
            is_recovered: !rtt_over,
            is_warning: false,
            state: if rtt_over {
                SteerState::Red
            } else {
                SteerState::Green
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> AssessmentConfig {
        AssessmentConfig {
            rtt_threshold_ms: 30.0,
            cake_drops_threshold: 50,
            cake_queue_depth_threshold: 1000,
        }
    }

    fn inputs(delta: f64, drops: u64, depth: u64) -> AssessmentInputs {
        AssessmentInputs {
            rtt_delta_ms: delta,
            cake_drops_delta: drops,
            queue_depth: depth,
        }
    }

    #[test]
    fn legacy_mode_degrades_on_rtt_alone() {
        let a = evaluate(&cfg(), false, &inputs(40.0, 0, 0));
        assert!(a.is_degraded);
        assert_eq!(a.state, SteerState::Red);

        let a = evaluate(&cfg(), false, &inputs(10.0, 0, 0));
        assert!(a.is_recovered);
        assert_eq!(a.state, SteerState::Green);
    }

    #[test]
    fn threshold_is_exclusive() {
        // delta == threshold is not over it.
        let a = evaluate(&cfg(), false, &inputs(30.0, 0, 0));
        assert!(!a.is_degraded);
        assert!(a.is_recovered);
    }

    #[test]
    fn cake_mode_needs_both_signals_for_red() {
        // RTT high but queues clean: warning only.
        let a = evaluate(&cfg(), true, &inputs(40.0, 5, 100));
        assert!(!a.is_degraded);
        assert!(a.is_warning);
        assert_eq!(a.state, SteerState::Yellow);

        // RTT high and drops over threshold: degraded.
        let a = evaluate(&cfg(), true, &inputs(40.0, 80, 100));
        assert!(a.is_degraded);
        assert_eq!(a.state, SteerState::Red);

        // RTT high and depth over threshold: degraded.
        let a = evaluate(&cfg(), true, &inputs(40.0, 0, 2000));
        assert!(a.is_degraded);
    }

    #[test]
    fn cake_mode_queue_alone_is_green() {
        // Queue noise without an RTT signal stays green: drops can
        // come from normal AQM behavior.
        let a = evaluate(&cfg(), true, &inputs(5.0, 500, 5000));
        assert!(!a.is_degraded);
        assert!(!a.is_warning);
        assert!(a.is_recovered);
        assert_eq!(a.state, SteerState::Green);
    }

    #[test]
    fn cake_mode_stats_outage_caps_at_warning() {
        // A failed CAKE read feeds zeros: RTT pressure alone can warn
        // but never steer, so a dead stats path cannot flap the rule.
        let a = evaluate(&cfg(), true, &inputs(40.0, 0, 0));
        assert!(!a.is_degraded);
        assert!(a.is_warning);
        assert_eq!(a.state, SteerState::Yellow);
    }
}
