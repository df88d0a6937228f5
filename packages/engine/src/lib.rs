//! Execution-run streaming and usage accounting.
//!
//! The engine owns two concerns: at most one live event connection per
//! in-progress execution run ([`StreamRegistry`]), and a per-thread elapsed
//! compute counter that never visibly decreases ([`UsageTracker`]).

pub mod runs;
pub mod stream_registry;
pub mod terminal_cache;
pub mod tracker;
pub mod transport;
pub mod usage;

pub use runs::{ExecutionRun, RunStatus};
pub use stream_registry::{ConnectionState, RegistryConfig, RunSubscription, StreamRegistry};
pub use terminal_cache::TerminalCache;
pub use tracker::{TrackerConfig, TrackingPhase, UsageTracker};
pub use transport::{ConnectionFactory, RunConnection, RunHistorySource, StreamEvent};
pub use usage::billable_minutes;
