use std::fmt;
use std::sync::Mutex;
use std::time::Instant;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Fetching,
    Merging,
    Done,
    Failed,
    Interrupted,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Fetching => "fetching",
            Phase::Merging => "merging",
            Phase::Done => "done",
            Phase::Failed => "failed",
            Phase::Interrupted => "interrupted",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
struct ProgressState {
    downloaded_bytes: u64,
    session_bytes: u64,
    merged_percent: f64,
    errors: u32,
    phase: Phase,
}

/// Shared counters for one run. All mutation goes through the single mutex,
/// held only for the duration of the update, never across I/O.
pub struct RunProgress {
    state: Mutex<ProgressState>,
    total_bytes: u64,
    threads: u32,
    resumed: bool,
    resume_bytes: u64,
    started: Instant,
}

impl RunProgress {
    pub fn new(total_bytes: u64, threads: u32, resume_bytes: u64) -> Self {
        Self {
            state: Mutex::new(ProgressState {
                downloaded_bytes: resume_bytes,
                session_bytes: 0,
                merged_percent: 0.0,
                errors: 0,
                phase: Phase::Fetching,
            }),
            total_bytes,
            threads,
            resumed: resume_bytes > 0,
            resume_bytes,
            started: Instant::now(),
        }
    }

    /// Bytes streamed to disk by this process.
    pub fn add_bytes(&self, bytes: u64) {
        if let Ok(mut state) = self.state.lock() {
            state.downloaded_bytes = state.downloaded_bytes.saturating_add(bytes);
            state.session_bytes = state.session_bytes.saturating_add(bytes);
        }
    }

    /// Bytes accounted for without a transfer (range-exhausted segments).
    /// Kept out of the session counter so speed is not skewed.
    pub fn credit_bytes(&self, bytes: u64) {
        if let Ok(mut state) = self.state.lock() {
            state.downloaded_bytes = state.downloaded_bytes.saturating_add(bytes);
        }
    }

    pub fn add_error(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.errors += 1;
        }
    }

    pub fn set_phase(&self, phase: Phase) {
        if let Ok(mut state) = self.state.lock() {
            state.phase = phase;
        }
    }

    pub fn set_merged_percent(&self, percent: f64) {
        if let Ok(mut state) = self.state.lock() {
            state.merged_percent = percent.clamp(0.0, 100.0);
        }
    }

    pub fn downloaded_bytes(&self) -> u64 {
        self.state
            .lock()
            .map(|state| state.downloaded_bytes)
            .unwrap_or(0)
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let state = self.state.lock();
        let (downloaded_bytes, session_bytes, merged_percent, errors, phase) = match &state {
            Ok(state) => (
                state.downloaded_bytes,
                state.session_bytes,
                state.merged_percent,
                state.errors,
                state.phase,
            ),
            Err(_) => (0, 0, 0.0, 0, Phase::Failed),
        };
        ProgressSnapshot {
            downloaded_bytes,
            session_bytes,
            total_bytes: self.total_bytes,
            merged_percent,
            elapsed_secs: self.started.elapsed().as_secs_f64(),
            threads: self.threads,
            resumed: self.resumed,
            resume_bytes: self.resume_bytes,
            errors,
            phase,
        }
    }
}

/// Read-only view handed to progress sinks at a bounded interval.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressSnapshot {
    pub downloaded_bytes: u64,
    pub session_bytes: u64,
    pub total_bytes: u64,
    pub merged_percent: f64,
    pub elapsed_secs: f64,
    pub threads: u32,
    pub resumed: bool,
    pub resume_bytes: u64,
    pub errors: u32,
    pub phase: Phase,
}

impl ProgressSnapshot {
    pub fn percent(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        (self.downloaded_bytes as f64 / self.total_bytes as f64 * 100.0).clamp(0.0, 100.0)
    }

    pub fn speed_bytes_per_sec(&self) -> u64 {
        if self.elapsed_secs <= 0.0 {
            return 0;
        }
        (self.session_bytes as f64 / self.elapsed_secs) as u64
    }
}

pub trait ProgressSink: Send + Sync {
    fn update(&self, snapshot: &ProgressSnapshot);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resume_seeds_downloaded_but_not_session() {
        let progress = RunProgress::new(1000, 4, 250);
        progress.add_bytes(100);
        let snap = progress.snapshot();
        assert_eq!(snap.downloaded_bytes, 350);
        assert_eq!(snap.session_bytes, 100);
        assert!(snap.resumed);
        assert_eq!(snap.resume_bytes, 250);
    }

    #[test]
    fn credited_bytes_skip_the_session_counter() {
        let progress = RunProgress::new(1000, 2, 0);
        progress.credit_bytes(500);
        let snap = progress.snapshot();
        assert_eq!(snap.downloaded_bytes, 500);
        assert_eq!(snap.session_bytes, 0);
        assert!(!snap.resumed);
    }

    #[test]
    fn percent_is_clamped_when_counters_overshoot() {
        let progress = RunProgress::new(100, 1, 0);
        progress.add_bytes(150);
        assert_eq!(progress.snapshot().percent(), 100.0);
    }

    #[test]
    fn merged_percent_is_clamped() {
        let progress = RunProgress::new(100, 1, 0);
        progress.set_merged_percent(140.0);
        assert_eq!(progress.snapshot().merged_percent, 100.0);
        progress.set_merged_percent(-3.0);
        assert_eq!(progress.snapshot().merged_percent, 0.0);
    }

    #[test]
    fn phase_transitions_are_visible_in_snapshots() {
        let progress = RunProgress::new(100, 1, 0);
        assert_eq!(progress.snapshot().phase, Phase::Fetching);
        progress.set_phase(Phase::Merging);
        assert_eq!(progress.snapshot().phase, Phase::Merging);
    }
}
