use serde::{Deserialize, Serialize};

use crate::work::Work;

/// Observable status of a Work, folded from its counters and timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkStatus {
    Error,
    Complete,
    Progress,
}

impl WorkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkStatus::Error => "error",
            WorkStatus::Complete => "complete",
            WorkStatus::Progress => "progress",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WorkTracking {
    pub status: WorkStatus,
    /// Informational completion ratio in [0, 1]; independent of `status`.
    pub progress: f64,
}

/// Pure fold of a Work's accounted state into a status.
///
/// `Error` takes precedence; `Complete` requires the terminal transition
/// to have landed and every expectation accounted for. An overshooting
/// `expected_number` therefore shows up as a work that never completes,
/// not as a fault.
pub fn compute_work_status(work: &Work) -> WorkTracking {
    let status = if work.in_error {
        WorkStatus::Error
    } else if work.processed_at.is_some() && work.completed_number >= work.expected_number {
        WorkStatus::Complete
    } else {
        WorkStatus::Progress
    };
    let denom = work.expected_number.max(1) as f64;
    let progress = (work.completed_number as f64 / denom).clamp(0.0, 1.0);
    WorkTracking { status, progress }
}
