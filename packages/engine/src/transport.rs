use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::runs::{ExecutionRun, RunStatus};
use runwatch_error::EngineError;

/// One notification from a live run connection.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// Incremental payload from the run; opaque to the engine.
    Message(Value),
    /// The backend confirmed the run finished. Closes the connection and
    /// records the run id as terminal.
    Terminal(RunStatus),
    /// The transport failed. Closes the connection without recording the run
    /// as terminal, so a later resubscribe may succeed.
    TransportError(String),
}

/// A live transport session bound to exactly one run id. The registry owns
/// the receiver; the factory's transport task holds the sending side.
#[derive(Debug)]
pub struct RunConnection {
    pub events: mpsc::Receiver<StreamEvent>,
}

/// Opens the underlying live connection for a run.
pub trait ConnectionFactory: Send + Sync + 'static {
    fn open(&self, run_id: &str) -> BoxFuture<'static, Result<RunConnection, EngineError>>;
}

/// Authoritative snapshot provider polled by the usage tracker.
pub trait RunHistorySource: Send + Sync + 'static {
    fn fetch_runs(&self, key: &str) -> BoxFuture<'static, Result<Vec<ExecutionRun>, EngineError>>;
}

impl std::fmt::Debug for dyn ConnectionFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ConnectionFactory")
    }
}

impl std::fmt::Debug for dyn RunHistorySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RunHistorySource")
    }
}
