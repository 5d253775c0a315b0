//! Congestion state machines with asymmetric hysteresis.
//!
//! ```text
//!           ≥T_yellow ×N_up      ≥T_soft_red ×N_up      ≥T_red ×N_up
//!   GREEN ───────────────▶ YELLOW ───────────────▶ SOFT_RED ─────────▶ RED
//!     ◀─────────────────    ◀─────────────────      ◀─────────────────
//!      <T_yellow ×N_down      <T_soft_red ×N_down      <T_red ×N_down
//! ```
//!
//! Upgrades (toward worse) need `upgrade_samples` consecutive samples
//! at or above the next state's threshold; downgrades need the larger
//! `downgrade_samples` count strictly below the current state's entry
//! threshold, and always step one level. A transition resets the
//! opposing streaks so a fresh run of evidence is required to reverse
//! it. Upload runs the same machine without SOFT_RED.

use wanctl_common::config::Thresholds;
use wanctl_common::state::{DownDirState, DownState, UpDirState, UpState};

/// A committed transition, `(from, to)`.
pub type Transition<S> = Option<(S, S)>;

/// Advance the download machine by one RTT-delta sample.
pub fn classify_download(
    dir: &mut DownDirState,
    t: &Thresholds,
    delta_ms: f64,
) -> Transition<DownState> {
    let up_cap = t.upgrade_samples + 1;
    let down_cap = t.downgrade_samples + 1;

    dir.yellow_streak = bump(dir.yellow_streak, delta_ms >= t.yellow_ms, up_cap);
    dir.soft_red_streak = bump(dir.soft_red_streak, delta_ms >= t.soft_red_ms, up_cap);
    dir.red_streak = bump(dir.red_streak, delta_ms >= t.red_ms, up_cap);
    dir.green_streak = bump(
        dir.green_streak,
        delta_ms < entry_threshold_down(dir.current_state, t),
        down_cap,
    );

    // Upgrade first: one level toward worse when the next state's
    // streak satisfies the (smaller) upgrade count.
    if let Some(worse) = dir.current_state.next_worse() {
        let streak = match worse {
            DownState::Yellow => dir.yellow_streak,
            DownState::SoftRed => dir.soft_red_streak,
            DownState::Red => dir.red_streak,
            DownState::Green => 0,
        };
        if streak >= t.upgrade_samples {
            let from = dir.current_state;
            dir.current_state = worse;
            dir.green_streak = 0;
            return Some((from, worse));
        }
    }

    // Downgrade: one level toward better, on the slower count.
    if let Some(better) = dir.current_state.next_better() {
        if dir.green_streak >= t.downgrade_samples {
            let from = dir.current_state;
            dir.current_state = better;
            dir.green_streak = 0;
            dir.yellow_streak = 0;
            dir.soft_red_streak = 0;
            dir.red_streak = 0;
            return Some((from, better));
        }
    }

    None
}

/// Advance the upload machine by one RTT-delta sample.
pub fn classify_upload(dir: &mut UpDirState, t: &Thresholds, delta_ms: f64) -> Transition<UpState> {
    let up_cap = t.upgrade_samples + 1;
    let down_cap = t.downgrade_samples + 1;

    dir.yellow_streak = bump(dir.yellow_streak, delta_ms >= t.upload_yellow_ms, up_cap);
    dir.red_streak = bump(dir.red_streak, delta_ms >= t.upload_red_ms, up_cap);
    dir.green_streak = bump(
        dir.green_streak,
        delta_ms < entry_threshold_up(dir.current_state, t),
        down_cap,
    );

    if let Some(worse) = dir.current_state.next_worse() {
        let streak = match worse {
            UpState::Yellow => dir.yellow_streak,
            UpState::Red => dir.red_streak,
            UpState::Green => 0,
        };
        if streak >= t.upgrade_samples {
            let from = dir.current_state;
            dir.current_state = worse;
            dir.green_streak = 0;
            return Some((from, worse));
        }
    }

    if let Some(better) = dir.current_state.next_better() {
        if dir.green_streak >= t.downgrade_samples {
            let from = dir.current_state;
            dir.current_state = better;
            dir.green_streak = 0;
            dir.yellow_streak = 0;
            dir.red_streak = 0;
            return Some((from, better));
        }
    }

    None
}

/// Threshold that admitted the current state; recovery requires the
/// delta strictly below it.
fn entry_threshold_down(state: DownState, t: &Thresholds) -> f64 {
    match state {
        DownState::Green | DownState::Yellow => t.yellow_ms,
        DownState::SoftRed => t.soft_red_ms,
        DownState::Red => t.red_ms,
    }
}

fn entry_threshold_up(state: UpState, t: &Thresholds) -> f64 {
    match state {
        UpState::Green | UpState::Yellow => t.upload_yellow_ms,
        UpState::Red => t.upload_red_ms,
    }
}

fn bump(streak: u32, qualifies: bool, cap: u32) -> u32 {
    if qualifies {
        streak.saturating_add(1).min(cap)
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thresholds() -> Thresholds {
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

    fn drive_down(dir: &mut DownDirState, t: &Thresholds, delta: f64, n: usize) -> Vec<(DownState, DownState)> {
        (0..n)
            .filter_map(|_| classify_download(dir, t, delta))
            .collect()
    }

    #[test]
    fn stays_green_below_yellow_threshold() {
        let t = thresholds();
        let mut dir = DownDirState::default();
        let transitions = drive_down(&mut dir, &t, 2.0, 200);
        assert!(transitions.is_empty());
        assert_eq!(dir.current_state, DownState::Green);
    }

    #[test]
    fn upgrade_fires_exactly_at_nup() {
        let t = thresholds();
        let mut dir = DownDirState::default();
        // N_up - 1 qualifying samples: no transition yet.
        for _ in 0..7 {
            assert_eq!(classify_download(&mut dir, &t, 10.0), None);
        }
        assert_eq!(dir.current_state, DownState::Green);
        // The 8th fires.
        assert_eq!(
            classify_download(&mut dir, &t, 10.0),
            Some((DownState::Green, DownState::Yellow))
        );
    }

    #[test]
    fn equality_with_threshold_counts_toward_upgrade() {
        // Upgrade predicate is >=: delta exactly at T_yellow qualifies.
        let t = thresholds();
        let mut dir = DownDirState::default();
        let transitions = drive_down(&mut dir, &t, 5.0, 8);
        assert_eq!(transitions, vec![(DownState::Green, DownState::Yellow)]);
    }

    #[test]
    fn just_below_threshold_never_upgrades() {
        let t = thresholds();
        let mut dir = DownDirState::default();
        let transitions = drive_down(&mut dir, &t, 4.999, 500);
        assert!(transitions.is_empty());
    }

    #[test]
    fn no_state_skipping_under_severe_delta() {
        let t = thresholds();
        let mut dir = DownDirState::default();
        // Delta far above T_red: must still walk GREEN→YELLOW→SOFT_RED→RED
        // one level per transition.
        let transitions = drive_down(&mut dir, &t, 100.0, 30);
        assert_eq!(
            transitions,
            vec![
                (DownState::Green, DownState::Yellow),
                (DownState::Yellow, DownState::SoftRed),
                (DownState::SoftRed, DownState::Red),
            ]
        );
        for (from, to) in transitions {
            assert_eq!(to.level() - from.level(), 1);
        }
        assert_eq!(dir.current_state, DownState::Red);
    }

    #[test]
    fn yellow_holds_when_delta_between_yellow_and_soft_red() {
        let t = thresholds();
        let mut dir = DownDirState::default();
        drive_down(&mut dir, &t, 10.0, 8);
        assert_eq!(dir.current_state, DownState::Yellow);
        // Delta ~10 ms stays below T_soft_red and above T_yellow: parked.
        let more = drive_down(&mut dir, &t, 10.0, 200);
        assert!(more.is_empty());
        assert_eq!(dir.current_state, DownState::Yellow);
    }

    #[test]
    fn downgrade_needs_full_recovery_count() {
        let t = thresholds();
        let mut dir = DownDirState::default();
        drive_down(&mut dir, &t, 10.0, 8);
        assert_eq!(dir.current_state, DownState::Yellow);

        // 59 recovered samples: not enough.
        for _ in 0..59 {
            assert_eq!(classify_download(&mut dir, &t, 1.0), None);
        }
        // The 60th downgrades.
        assert_eq!(
            classify_download(&mut dir, &t, 1.0),
            Some((DownState::Yellow, DownState::Green))
        );
    }

    #[test]
    fn downgrade_steps_one_level_from_red() {
        let t = thresholds();
        let mut dir = DownDirState::default();
        drive_down(&mut dir, &t, 100.0, 30);
        assert_eq!(dir.current_state, DownState::Red);

        // Delta 20 ms: below T_red (recovery for RED) but above T_soft_red.
        // RED downgrades to SOFT_RED, then SOFT_RED's own entry threshold
        // (15 ms) is not satisfied, so it parks there.
        let transitions = drive_down(&mut dir, &t, 20.0, 300);
        assert_eq!(transitions, vec![(DownState::Red, DownState::SoftRed)]);
        assert_eq!(dir.current_state, DownState::SoftRed);
    }

    #[test]
    fn downgrade_resets_upgrade_streaks() {
        let t = thresholds();
        let mut dir = DownDirState::default();
        drive_down(&mut dir, &t, 100.0, 30);
        assert_eq!(dir.current_state, DownState::Red);

        // Recover fully to SOFT_RED with delta 14 (below soft_red entry of RED
        // and below soft_red threshold): after the transition the soft_red
        // streak must not instantly re-fire an upgrade.
        let mut transitions = Vec::new();
        for _ in 0..61 {
            if let Some(tr) = classify_download(&mut dir, &t, 14.0) {
                transitions.push(tr);
            }
        }
        assert_eq!(transitions, vec![(DownState::Red, DownState::SoftRed)]);
        // Next samples at 14 ms (≥ nothing relevant for SOFT_RED's upgrade
        // to RED which needs ≥30) keep it stable.
        for _ in 0..20 {
            assert_eq!(classify_download(&mut dir, &t, 14.0), None);
        }
        assert_eq!(dir.current_state, DownState::SoftRed);
    }

    #[test]
    fn interrupted_streak_starts_over() {
        let t = thresholds();
        let mut dir = DownDirState::default();
        for _ in 0..7 {
            classify_download(&mut dir, &t, 10.0);
        }
        // One good sample breaks the run.
        classify_download(&mut dir, &t, 1.0);
        for _ in 0..7 {
            assert_eq!(classify_download(&mut dir, &t, 10.0), None);
        }
        assert_eq!(dir.current_state, DownState::Green);
    }

    #[test]
    fn streaks_stay_bounded() {
        let t = thresholds();
        let mut dir = DownDirState::default();
        drive_down(&mut dir, &t, 1.0, 10_000);
        assert!(dir.green_streak <= t.downgrade_samples + 1);
        drive_down(&mut dir, &t, 100.0, 10_000);
        assert!(dir.yellow_streak <= t.upgrade_samples + 1);
        assert!(dir.red_streak <= t.upgrade_samples + 1);
    }

    #[test]
    fn upload_three_state_walk() {
        let t = thresholds();
        let mut dir = UpDirState::default();
        let mut transitions = Vec::new();
        for _ in 0..30 {
            if let Some(tr) = classify_upload(&mut dir, &t, 100.0) {
                transitions.push(tr);
            }
        }
        assert_eq!(
            transitions,
            vec![
                (UpState::Green, UpState::Yellow),
                (UpState::Yellow, UpState::Red),
            ]
        );
    }

    #[test]
    fn upload_uses_its_own_thresholds() {
        let t = thresholds();
        let mut dir = UpDirState::default();
        // 6 ms: above download yellow (5) but below upload yellow (8).
        for _ in 0..200 {
            assert_eq!(classify_upload(&mut dir, &t, 6.0), None);
        }
        assert_eq!(dir.current_state, UpState::Green);
    }

    #[test]
    fn upload_recovers_to_green() {
        let t = thresholds();
        let mut dir = UpDirState::default();
        for _ in 0..8 {
            classify_upload(&mut dir, &t, 10.0);
        }
        assert_eq!(dir.current_state, UpState::Yellow);
        let mut transitions = Vec::new();
        for _ in 0..60 {
            if let Some(tr) = classify_upload(&mut dir, &t, 1.0) {
                transitions.push(tr);
            }
        }
        assert_eq!(transitions, vec![(UpState::Yellow, UpState::Green)]);
    }
}
