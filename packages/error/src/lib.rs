use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    AlreadyTerminal,
    TransportFailed,
    FetchFailed,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AlreadyTerminal => "already_terminal",
            Self::TransportFailed => "transport_failed",
            Self::FetchFailed => "fetch_failed",
        }
    }

    /// Whether a later retry of the same operation may succeed.
    pub fn retryable(&self) -> bool {
        match self {
            Self::AlreadyTerminal => false,
            Self::TransportFailed => true,
            Self::FetchFailed => true,
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    /// Subscribe attempted on a run the terminal cache already knows has
    /// finished. A fast-path signal rather than a failure.
    #[error("run already terminal: {run_id}")]
    AlreadyTerminal { run_id: String },
    /// The live transport failed to open or died mid-stream. Recoverable;
    /// never recorded as terminal.
    #[error("transport failed for run {run_id}: {message}")]
    TransportFailed { run_id: String, message: String },
    /// The run-history refetch failed. Recovered locally by keeping the
    /// previous snapshot and retrying on the next interval.
    #[error("run history fetch failed for {key}: {message}")]
    FetchFailed { key: String, message: String },
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::AlreadyTerminal { .. } => ErrorKind::AlreadyTerminal,
            Self::TransportFailed { .. } => ErrorKind::TransportFailed,
            Self::FetchFailed { .. } => ErrorKind::FetchFailed,
        }
    }

    pub fn to_summary(&self) -> ErrorSummary {
        let mut details = Map::new();
        match self {
            Self::AlreadyTerminal { run_id } => {
                details.insert("runId".to_string(), Value::String(run_id.clone()));
            }
            Self::TransportFailed { run_id, message } => {
                details.insert("runId".to_string(), Value::String(run_id.clone()));
                details.insert("message".to_string(), Value::String(message.clone()));
            }
            Self::FetchFailed { key, message } => {
                details.insert("key".to_string(), Value::String(key.clone()));
                details.insert("message".to_string(), Value::String(message.clone()));
            }
        }

        ErrorSummary {
            kind: self.kind(),
            message: self.to_string(),
            details: if details.is_empty() {
                None
            } else {
                Some(Value::Object(details))
            },
        }
    }
}

/// Serializable view of an [`EngineError`] for reporting across an API
/// boundary or into structured logs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorSummary {
    #[serde(rename = "type")]
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_carries_run_id() {
        let err = EngineError::TransportFailed {
            run_id: "run_1".to_string(),
            message: "connection reset".to_string(),
        };
        let summary = err.to_summary();
        assert_eq!(summary.kind, ErrorKind::TransportFailed);
        let details = summary.details.expect("details");
        assert_eq!(details["runId"], "run_1");
    }

    #[test]
    fn already_terminal_is_not_retryable() {
        assert!(!ErrorKind::AlreadyTerminal.retryable());
        assert!(ErrorKind::FetchFailed.retryable());
    }
}
