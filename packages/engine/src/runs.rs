use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Backend-reported status of one execution run. Anything other than
/// `running` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Stopped,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// One backend-tracked execution attempt. `completed_at` is expected to be
/// present exactly when the status is terminal, but records violating that
/// are tolerated downstream (they bill as zero).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRun {
    pub id: String,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl ExecutionRun {
    pub fn is_running(&self) -> bool {
        !self.status.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Stopped.is_terminal());
    }

    #[test]
    fn run_round_trips_without_timestamps() {
        let run = ExecutionRun {
            id: "run_1".to_string(),
            status: RunStatus::Running,
            started_at: None,
            completed_at: None,
        };
        let json = serde_json::to_value(&run).expect("serialize");
        assert_eq!(json["status"], "running");
        assert!(json.get("startedAt").is_none());
        let parsed: ExecutionRun = serde_json::from_value(json).expect("deserialize");
        assert!(parsed.is_running());
    }
}
