//! Worker state shared with observers

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

use crate::analysis::MatchCandidate;
use crate::pipeline::ScanReport;

/// Lifecycle state of the scan worker
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "label", rename_all = "snake_case")]
pub enum WorkerState {
    /// No worker thread
    #[default]
    Stopped,
    /// Running, automatic frames are discarded
    Paused,
    /// Running a pipeline pass
    Processing(String),
    /// Running, waiting for frames
    Idle,
}

impl WorkerState {
    pub fn is_running(&self) -> bool {
        !matches!(self, WorkerState::Stopped)
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerState::Stopped => f.write_str("stopped"),
            WorkerState::Paused => f.write_str("paused"),
            WorkerState::Processing(label) => write!(f, "processing ({})", label),
            WorkerState::Idle => f.write_str("idle"),
        }
    }
}

/// Bounded log, oldest line dropped first
#[derive(Debug, Clone)]
pub struct LogRing {
    lines: VecDeque<String>,
    capacity: usize,
}

impl LogRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    pub fn push(&mut self, line: impl Into<String>) {
        if self.capacity == 0 {
            return;
        }
        while self.lines.len() >= self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line.into());
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Lines oldest first
    pub fn lines(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }
}

/// Frame counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameCounters {
    pub received: u64,
    pub processed: u64,
    /// Discarded while paused or stopped, or pushed out of a full queue
    pub dropped: u64,
    pub decode_errors: u64,
}

/// Everything an observer can see of the worker
///
/// Published as a whole; readers never see a half-updated snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DebugSnapshot {
    pub state: WorkerState,
    pub paused: bool,
    pub manual_pending: bool,
    pub counters: FrameCounters,
    /// Last completed pass: recognition results, visual analysis, matches
    pub report: Option<ScanReport>,
    pub logs: Vec<String>,
}

impl DebugSnapshot {
    /// Best match of the last completed pass
    pub fn best(&self) -> Option<&MatchCandidate> {
        self.report.as_ref().and_then(|r| r.candidates.first())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_ring_drops_oldest() {
        let mut ring = LogRing::new(3);
        for i in 0..5 {
            ring.push(format!("line {}", i));
        }
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.lines(), vec!["line 2", "line 3", "line 4"]);
    }

    #[test]
    fn test_log_ring_zero_capacity() {
        let mut ring = LogRing::new(0);
        ring.push("ignored");
        assert!(ring.is_empty());
    }

    #[test]
    fn test_worker_state_serialization() {
        assert_eq!(
            serde_json::to_string(&WorkerState::Processing("manual scan".into())).unwrap(),
            r#"{"state":"processing","label":"manual scan"}"#
        );
        assert_eq!(serde_json::to_string(&WorkerState::Idle).unwrap(), r#"{"state":"idle"}"#);
        assert_eq!(WorkerState::Paused.to_string(), "paused");
        assert!(!WorkerState::Stopped.is_running());
        assert!(WorkerState::Paused.is_running());
    }

    #[test]
    fn test_snapshot_best() {
        let mut snapshot = DebugSnapshot::default();
        assert!(snapshot.best().is_none());

        snapshot.report = Some(ScanReport {
            candidates: vec![MatchCandidate {
                card_id: 1,
                name: "Dark Magician".into(),
                set_code: "LOB-EN005".into(),
                rarity: "Ultra Rare".into(),
                confidence: 96.0,
                reason: "Set Code Match (LOB-EN005)".into(),
                image_path: None,
            }],
            ..Default::default()
        });
        assert_eq!(snapshot.best().map(|b| b.card_id), Some(1));
    }
}
