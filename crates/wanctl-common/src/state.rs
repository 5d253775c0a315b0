//! Persisted controller state.
//!
//! Both daemons keep their loop state in a JSON file, written
//! atomically (temp + fsync + rename) after every cycle that changes
//! it, with the previous contents preserved in a `.backup` sibling.
//! Loading tolerates a missing or corrupt primary: the backup is
//! tried next, then schema defaults. Numeric fields are clamped to
//! schema bounds on load so a hand-edited or stale file can never
//! inject out-of-range values into the loop.

use std::collections::VecDeque;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Lower clamp for both RTT EWMAs, in ms.
pub const BASELINE_MIN_MS: f64 = 10.0;
/// Upper clamp for both RTT EWMAs, in ms.
pub const BASELINE_MAX_MS: f64 = 60.0;

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("cannot write state {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot serialize state: {0}")]
    Serialize(#[from] serde_json::Error),
}

// ─── Congestion states ──────────────────────────────────────────────────────

/// Download congestion state. SOFT_RED is the RTT-only intermediate
/// step between YELLOW and RED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DownState {
    #[default]
    Green,
    Yellow,
    SoftRed,
    Red,
}

impl DownState {
    /// Severity level, GREEN=0 .. RED=3. Transitions move one level at a time.
    pub fn level(self) -> u8 {
        match self {
            DownState::Green => 0,
            DownState::Yellow => 1,
            DownState::SoftRed => 2,
            DownState::Red => 3,
        }
    }

    /// Metric encoding: GREEN=1, YELLOW=2, SOFT_RED=3, RED=4.
    pub fn metric_code(self) -> i64 {
        self.level() as i64 + 1
    }

    pub fn next_worse(self) -> Option<DownState> {
        match self {
            DownState::Green => Some(DownState::Yellow),
            DownState::Yellow => Some(DownState::SoftRed),
            DownState::SoftRed => Some(DownState::Red),
            DownState::Red => None,
        }
    }

    pub fn next_better(self) -> Option<DownState> {
        match self {
            DownState::Green => None,
            DownState::Yellow => Some(DownState::Green),
            DownState::SoftRed => Some(DownState::Yellow),
            DownState::Red => Some(DownState::SoftRed),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DownState::Green => "GREEN",
            DownState::Yellow => "YELLOW",
            DownState::SoftRed => "SOFT_RED",
            DownState::Red => "RED",
        }
    }
}

/// Upload congestion state (three levels, no SOFT_RED).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UpState {
    #[default]
    Green,
    Yellow,
    Red,
}

impl UpState {
    pub fn level(self) -> u8 {
        match self {
            UpState::Green => 0,
            UpState::Yellow => 1,
            UpState::Red => 2,
        }
    }

    pub fn next_worse(self) -> Option<UpState> {
        match self {
            UpState::Green => Some(UpState::Yellow),
            UpState::Yellow => Some(UpState::Red),
            UpState::Red => None,
        }
    }

    pub fn next_better(self) -> Option<UpState> {
        match self {
            UpState::Green => None,
            UpState::Yellow => Some(UpState::Green),
            UpState::Red => Some(UpState::Yellow),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            UpState::Green => "GREEN",
            UpState::Yellow => "YELLOW",
            UpState::Red => "RED",
        }
    }
}

/// Steering daemon's coarse assessment, distinct from the autorate
/// four-state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SteerState {
    /// Before the first completed cycle.
    #[default]
    Starting,
    Green,
    Yellow,
    Red,
}

impl SteerState {
    /// Health encoding: GREEN=0, YELLOW=1, RED=2, UNKNOWN/STARTING=3.
    pub fn state_code(self) -> u8 {
        match self {
            SteerState::Green => 0,
            SteerState::Yellow => 1,
            SteerState::Red => 2,
            SteerState::Starting => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SteerState::Starting => "STARTING",
            SteerState::Green => "GREEN",
            SteerState::Yellow => "YELLOW",
            SteerState::Red => "RED",
        }
    }
}

// ─── Autorate state ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DownDirState {
    pub green_streak: u32,
    pub yellow_streak: u32,
    pub soft_red_streak: u32,
    pub red_streak: u32,
    pub current_state: DownState,
    pub current_rate_bps: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UpDirState {
    pub green_streak: u32,
    pub yellow_streak: u32,
    pub red_streak: u32,
    pub current_state: UpState,
    pub current_rate_bps: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EwmaState {
    pub baseline_rtt_ms: f64,
    pub load_rtt_ms: f64,
}

impl Default for EwmaState {
    fn default() -> Self {
        EwmaState {
            baseline_rtt_ms: 25.0,
            load_rtt_ms: 25.0,
        }
    }
}

/// Rates most recently pushed to the router; the flash-wear skip
/// compares against these.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LastApplied {
    pub dl_rate_bps: u64,
    pub ul_rate_bps: u64,
}

/// Per-WAN autorate loop state, one file per instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AutorateState {
    pub download: DownDirState,
    pub upload: UpDirState,
    pub ewma: EwmaState,
    pub last_applied: LastApplied,
    /// Last RTT measurement that succeeded (for the use_last_rtt fallback).
    pub last_rtt_ms: Option<f64>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl AutorateState {
    /// Clamp every field to schema bounds. Called after load so a
    /// stale or edited file cannot feed out-of-range values into the loop.
    pub fn clamp_to_schema(&mut self) {
        self.ewma.baseline_rtt_ms = clamp_finite(self.ewma.baseline_rtt_ms, 25.0);
        self.ewma.load_rtt_ms = clamp_finite(self.ewma.load_rtt_ms, 25.0);
        if let Some(rtt) = self.last_rtt_ms {
            if !rtt.is_finite() || rtt <= 0.0 {
                self.last_rtt_ms = None;
            }
        }
    }
}

// ─── Steering state ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfidenceState {
    pub score: f64,
    /// "idle" | "arming" | "armed".
    pub timer_state: String,
    pub dry_run_enable_decisions: u64,
    pub dry_run_release_decisions: u64,
}

/// Steering daemon loop state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SteeringState {
    pub current_state: SteerState,
    pub bad_count: u32,
    pub good_count: u32,
    pub red_count: u32,
    pub yellow_count: u32,
    /// Recent coarse assessments, newest last, bounded at ~10.
    pub congestion_state_history: VecDeque<SteerState>,
    pub history_rtt: VecDeque<f64>,
    pub history_delta: VecDeque<f64>,
    pub cake_drops_history: VecDeque<u64>,
    pub queue_depth_history: VecDeque<u64>,
    pub last_transition_ts: Option<DateTime<Utc>>,
    pub last_router_action_ts: Option<DateTime<Utc>>,
    pub router_failures: u32,
    pub cake_failures: u32,
    pub baseline_rtt_ms: f64,
    pub steering_enabled: bool,
    pub confidence: Option<ConfidenceState>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl Default for SteeringState {
    fn default() -> Self {
        SteeringState {
            current_state: SteerState::Starting,
            bad_count: 0,
            good_count: 0,
            red_count: 0,
            yellow_count: 0,
            congestion_state_history: VecDeque::new(),
            history_rtt: VecDeque::new(),
            history_delta: VecDeque::new(),
            cake_drops_history: VecDeque::new(),
            queue_depth_history: VecDeque::new(),
            last_transition_ts: None,
            last_router_action_ts: None,
            router_failures: 0,
            cake_failures: 0,
            baseline_rtt_ms: 25.0,
            steering_enabled: false,
            confidence: None,
            timestamp: None,
        }
    }
}

impl SteeringState {
    pub fn clamp_to_schema(&mut self) {
        self.baseline_rtt_ms = clamp_finite(self.baseline_rtt_ms, 25.0);
    }

    /// Re-bound every history to `cap`, dropping oldest entries.
    /// Capacity comes from config, not the file, so a reload under a
    /// smaller `history_size` trims immediately.
    pub fn bound_histories(&mut self, cap: usize) {
        bound(&mut self.congestion_state_history, 10);
        bound(&mut self.history_rtt, cap);
        bound(&mut self.history_delta, cap);
        bound(&mut self.cake_drops_history, cap);
        bound(&mut self.queue_depth_history, cap);
    }
}

fn bound<T>(q: &mut VecDeque<T>, cap: usize) {
    while q.len() > cap {
        q.pop_front();
    }
}

fn clamp_finite(value: f64, fallback: f64) -> f64 {
    if value.is_finite() {
        value.clamp(BASELINE_MIN_MS, BASELINE_MAX_MS)
    } else {
        fallback
    }
}

/// Push onto a bounded history, dropping the oldest on overflow.
pub fn push_bounded<T>(q: &mut VecDeque<T>, value: T, cap: usize) {
    if cap == 0 {
        return;
    }
    while q.len() >= cap {
        q.pop_front();
    }
    q.push_back(value);
}

// ─── Store ──────────────────────────────────────────────────────────────────

/// Where a loaded state actually came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadSource {
    /// No file on disk — schema defaults.
    Fresh,
    Primary,
    Backup,
}

/// Atomic JSON persistence with a `.backup` sibling.
pub struct StateStore {
    path: PathBuf,
    backup_path: PathBuf,
    tmp_path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path: PathBuf = path.into();
        let backup_path = sibling(&path, ".backup");
        let tmp_path = sibling(&path, ".tmp");
        StateStore {
            path,
            backup_path,
            tmp_path,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the state: primary, then backup, then defaults.
    pub fn load<T: DeserializeOwned + Default>(&self) -> (T, LoadSource) {
        match std::fs::read_to_string(&self.path) {
            Ok(raw) => match serde_json::from_str::<T>(&raw) {
                Ok(state) => (state, LoadSource::Primary),
                Err(e) => {
                    tracing::warn!(
                        path = %self.path.display(),
                        error = %e,
                        "state file corrupt, trying backup"
                    );
                    self.load_backup()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => (T::default(), LoadSource::Fresh),
            Err(e) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "state file unreadable, trying backup"
                );
                self.load_backup()
            }
        }
    }

    fn load_backup<T: DeserializeOwned + Default>(&self) -> (T, LoadSource) {
        match std::fs::read_to_string(&self.backup_path) {
            Ok(raw) => match serde_json::from_str::<T>(&raw) {
                Ok(state) => {
                    tracing::info!(path = %self.backup_path.display(), "Recovered state from backup");
                    (state, LoadSource::Backup)
                }
                Err(e) => {
                    tracing::warn!(
                        path = %self.backup_path.display(),
                        error = %e,
                        "backup also corrupt, using defaults"
                    );
                    (T::default(), LoadSource::Fresh)
                }
            },
            Err(_) => (T::default(), LoadSource::Fresh),
        }
    }

    /// Write atomically: temp + fsync + rename, then refresh the backup
    /// with the contents the primary held before this write.
    pub fn save<T: Serialize>(&self, state: &T) -> Result<(), StateError> {
        let json = serde_json::to_vec_pretty(state)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                let _ = std::fs::create_dir_all(parent);
            }
        }
        let prior = std::fs::read(&self.path).ok();

        let mut tmp = std::fs::File::create(&self.tmp_path).map_err(|source| StateError::Io {
            path: self.tmp_path.clone(),
            source,
        })?;
        tmp.write_all(&json).map_err(|source| StateError::Io {
            path: self.tmp_path.clone(),
            source,
        })?;
        tmp.sync_all().map_err(|source| StateError::Io {
            path: self.tmp_path.clone(),
            source,
        })?;
        drop(tmp);

        std::fs::rename(&self.tmp_path, &self.path).map_err(|source| StateError::Io {
            path: self.path.clone(),
            source,
        })?;

        if let Some(prior) = prior {
            if let Err(e) = std::fs::write(&self.backup_path, prior) {
                tracing::warn!(
                    path = %self.backup_path.display(),
                    error = %e,
                    "failed to refresh state backup"
                );
            }
        }
        Ok(())
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push(suffix);
    PathBuf::from(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn down_state_levels_step_by_one() {
        let chain = [
            DownState::Green,
            DownState::Yellow,
            DownState::SoftRed,
            DownState::Red,
        ];
        for w in chain.windows(2) {
            assert_eq!(w[0].next_worse(), Some(w[1]));
            assert_eq!(w[1].next_better(), Some(w[0]));
            assert_eq!(w[1].level() - w[0].level(), 1);
        }
        assert_eq!(DownState::Red.next_worse(), None);
        assert_eq!(DownState::Green.next_better(), None);
    }

    #[test]
    fn metric_codes_match_registry() {
        assert_eq!(DownState::Green.metric_code(), 1);
        assert_eq!(DownState::Yellow.metric_code(), 2);
        assert_eq!(DownState::SoftRed.metric_code(), 3);
        assert_eq!(DownState::Red.metric_code(), 4);
    }

    #[test]
    fn steer_state_codes() {
        assert_eq!(SteerState::Green.state_code(), 0);
        assert_eq!(SteerState::Yellow.state_code(), 1);
        assert_eq!(SteerState::Red.state_code(), 2);
        assert_eq!(SteerState::Starting.state_code(), 3);
    }

    #[test]
    fn state_serializes_screaming_snake() {
        let json = serde_json::to_string(&DownState::SoftRed).unwrap();
        assert_eq!(json, "\"SOFT_RED\"");
        let back: DownState = serde_json::from_str("\"SOFT_RED\"").unwrap();
        assert_eq!(back, DownState::SoftRed);
    }

    #[test]
    fn clamp_pulls_ewma_into_bounds() {
        let mut state = AutorateState::default();
        state.ewma.baseline_rtt_ms = 5.0;
        state.ewma.load_rtt_ms = 500.0;
        state.clamp_to_schema();
        assert_eq!(state.ewma.baseline_rtt_ms, BASELINE_MIN_MS);
        assert_eq!(state.ewma.load_rtt_ms, BASELINE_MAX_MS);
    }

    #[test]
    fn clamp_replaces_non_finite() {
        let mut state = AutorateState::default();
        state.ewma.baseline_rtt_ms = f64::NAN;
        state.last_rtt_ms = Some(f64::INFINITY);
        state.clamp_to_schema();
        assert_eq!(state.ewma.baseline_rtt_ms, 25.0);
        assert_eq!(state.last_rtt_ms, None);
    }

    #[test]
    fn push_bounded_drops_oldest() {
        let mut q = VecDeque::new();
        for i in 0..5u64 {
            push_bounded(&mut q, i, 3);
        }
        assert_eq!(q, VecDeque::from(vec![2, 3, 4]));
    }

    #[test]
    fn missing_file_loads_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));
        let (state, source) = store.load::<AutorateState>();
        assert_eq!(source, LoadSource::Fresh);
        assert_eq!(state.download.current_state, DownState::Green);
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));

        let mut state = AutorateState::default();
        state.download.current_state = DownState::Yellow;
        state.download.current_rate_bps = 800_000_000;
        state.ewma.baseline_rtt_ms = 24.5;
        state.timestamp = Some(Utc::now());
        store.save(&state).unwrap();

        let (loaded, source) = store.load::<AutorateState>();
        assert_eq!(source, LoadSource::Primary);
        assert_eq!(loaded.download.current_state, DownState::Yellow);
        assert_eq!(loaded.download.current_rate_bps, 800_000_000);
        assert_eq!(loaded.ewma.baseline_rtt_ms, 24.5);
    }

    #[test]
    fn corrupt_primary_recovers_from_backup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let store = StateStore::new(path.clone());

        let mut state = AutorateState::default();
        state.download.current_rate_bps = 500_000_000;
        store.save(&state).unwrap();
        // Second save makes the first contents the backup.
        state.download.current_rate_bps = 600_000_000;
        store.save(&state).unwrap();

        // Truncate the primary mid-JSON.
        let raw = std::fs::read_to_string(&path).unwrap();
        std::fs::write(&path, &raw[..raw.len() / 2]).unwrap();

        let (loaded, source) = store.load::<AutorateState>();
        assert_eq!(source, LoadSource::Backup);
        assert_eq!(loaded.download.current_rate_bps, 500_000_000);
    }

    #[test]
    fn both_corrupt_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let store = StateStore::new(path.clone());

        std::fs::write(&path, "{ not json").unwrap();
        std::fs::write(dir.path().join("state.json.backup"), "also not json").unwrap();

        let (loaded, source) = store.load::<AutorateState>();
        assert_eq!(source, LoadSource::Fresh);
        assert_eq!(loaded.download.current_rate_bps, 0);
    }

    #[test]
    fn steering_histories_rebound_from_config() {
        let mut s = SteeringState::default();
        for i in 0..100 {
            s.history_rtt.push_back(i as f64);
        }
        s.bound_histories(10);
        assert_eq!(s.history_rtt.len(), 10);
        assert_eq!(*s.history_rtt.front().unwrap(), 90.0);
    }
}
