use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::terminal_cache::{TerminalCache, DEFAULT_MAX_ENTRIES};
use crate::transport::{ConnectionFactory, StreamEvent};
use runwatch_error::EngineError;

const EVENT_BUFFER_SIZE: usize = 256;

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub max_terminal_entries: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_terminal_entries: DEFAULT_MAX_ENTRIES,
        }
    }
}

/// Lifecycle of a registered connection. Closed connections leave the
/// registry, so lookups on absent run ids report `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
}

/// A subscriber's handle onto one run's live event stream.
#[derive(Debug)]
pub struct RunSubscription {
    pub run_id: String,
    /// True when the subscribe reused a connection that was already
    /// connecting or open.
    pub already_open: bool,
    pub events: broadcast::Receiver<StreamEvent>,
}

#[derive(Debug)]
struct ManagedConnection {
    state: ConnectionState,
    /// Guards against a pump task that outlives its registry slot mutating
    /// state owned by a newer connection for the same run id.
    instance_id: u64,
    sender: broadcast::Sender<StreamEvent>,
    pump: Option<JoinHandle<()>>,
}

#[derive(Debug)]
struct Inner {
    factory: Arc<dyn ConnectionFactory>,
    connections: Mutex<HashMap<String, ManagedConnection>>,
    terminal: Mutex<TerminalCache>,
    instance_counter: AtomicU64,
}

/// Single source of truth for "is there a live connection for run X".
///
/// Guarantees at most one underlying transport open per run id regardless of
/// how many times subscribe is called, and consults the terminal cache so
/// runs known to have finished are never reopened.
#[derive(Debug, Clone)]
pub struct StreamRegistry {
    inner: Arc<Inner>,
}

impl StreamRegistry {
    pub fn new(factory: Arc<dyn ConnectionFactory>, config: RegistryConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                factory,
                connections: Mutex::new(HashMap::new()),
                terminal: Mutex::new(TerminalCache::new(config.max_terminal_entries)),
                instance_counter: AtomicU64::new(1),
            }),
        }
    }

    /// Open (or reuse) the live connection for a run.
    ///
    /// Returns [`EngineError::AlreadyTerminal`] without touching the
    /// transport when the terminal cache knows the run finished. A failed
    /// open removes the placeholder entry before returning, never leaving a
    /// half-registered connection behind.
    pub async fn subscribe(&self, run_id: &str) -> Result<RunSubscription, EngineError> {
        if self.inner.terminal.lock().await.contains(run_id) {
            return Err(EngineError::AlreadyTerminal {
                run_id: run_id.to_string(),
            });
        }

        let (instance_id, receiver, sender) = {
            let mut connections = self.inner.connections.lock().await;
            if let Some(existing) = connections.get(run_id) {
                return Ok(RunSubscription {
                    run_id: run_id.to_string(),
                    already_open: true,
                    events: existing.sender.subscribe(),
                });
            }

            let instance_id = self.inner.instance_counter.fetch_add(1, Ordering::SeqCst);
            let (sender, receiver) = broadcast::channel(EVENT_BUFFER_SIZE);
            connections.insert(
                run_id.to_string(),
                ManagedConnection {
                    state: ConnectionState::Connecting,
                    instance_id,
                    sender: sender.clone(),
                    pump: None,
                },
            );
            (instance_id, receiver, sender)
        };

        let connection = match self.inner.factory.open(run_id).await {
            Ok(connection) => connection,
            Err(err) => {
                self.remove_if_current(run_id, instance_id, true).await;
                return Err(err);
            }
        };

        let pump = self.spawn_pump(run_id.to_string(), instance_id, connection.events, sender);

        let mut connections = self.inner.connections.lock().await;
        match connections.get_mut(run_id) {
            Some(entry) if entry.instance_id == instance_id => {
                entry.state = ConnectionState::Open;
                entry.pump = Some(pump);
            }
            _ => {
                pump.abort();
                return Err(EngineError::TransportFailed {
                    run_id: run_id.to_string(),
                    message: "subscription closed before the connection opened".to_string(),
                });
            }
        }
        drop(connections);

        tracing::debug!(run_id = %run_id, "opened run stream");
        Ok(RunSubscription {
            run_id: run_id.to_string(),
            already_open: false,
            events: receiver,
        })
    }

    /// Close and deregister the connection for a run. A no-op for run ids
    /// with no registered connection.
    pub async fn unsubscribe(&self, run_id: &str, reason: &str) {
        let removed = self.inner.connections.lock().await.remove(run_id);
        if let Some(mut connection) = removed {
            if let Some(pump) = connection.pump.take() {
                pump.abort();
            }
            tracing::debug!(run_id = %run_id, reason = %reason, "closed run stream");
        }
    }

    /// Record a run as finished: close any live connection and remember the
    /// id so later subscribes short-circuit. Also used when completion is
    /// learned out-of-band, e.g. from polling.
    pub async fn mark_terminal(&self, run_id: &str) {
        self.unsubscribe(run_id, "terminal").await;
        self.inner.terminal.lock().await.insert(run_id);
        tracing::debug!(run_id = %run_id, "run recorded terminal");
    }

    /// Forget that a run finished. Only for the deliberate id-reuse case;
    /// the engine must be willing to resubscribe afterward.
    pub async fn clear_terminal(&self, run_id: &str) {
        self.inner.terminal.lock().await.remove(run_id);
    }

    pub async fn is_terminal(&self, run_id: &str) -> bool {
        self.inner.terminal.lock().await.contains(run_id)
    }

    /// Tear down every registered connection. Safe to call repeatedly; used
    /// at session teardown so no connection outlives its owner.
    pub async fn dispose_all(&self, reason: &str) {
        let drained: Vec<(String, ManagedConnection)> = {
            let mut connections = self.inner.connections.lock().await;
            connections.drain().collect()
        };
        for (run_id, mut connection) in drained {
            if let Some(pump) = connection.pump.take() {
                pump.abort();
            }
            tracing::debug!(run_id = %run_id, reason = %reason, "closed run stream");
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.connections.lock().await.len()
    }

    pub async fn connection_state(&self, run_id: &str) -> ConnectionState {
        self.inner
            .connections
            .lock()
            .await
            .get(run_id)
            .map(|connection| connection.state)
            .unwrap_or(ConnectionState::Closed)
    }

    fn spawn_pump(
        &self,
        run_id: String,
        instance_id: u64,
        mut events: mpsc::Receiver<StreamEvent>,
        sender: broadcast::Sender<StreamEvent>,
    ) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            loop {
                let event = events.recv().await.unwrap_or_else(|| {
                    StreamEvent::TransportError(
                        "event channel closed before terminal event".to_string(),
                    )
                });

                let terminal = matches!(&event, StreamEvent::Terminal(_));
                let failed = matches!(&event, StreamEvent::TransportError(_));
                if !terminal && !failed && !registry.is_current(&run_id, instance_id).await {
                    return;
                }
                if let StreamEvent::TransportError(message) = &event {
                    tracing::debug!(run_id = %run_id, error = %message, "run stream failed");
                }
                let _ = sender.send(event);

                if terminal {
                    if registry.remove_if_current(&run_id, instance_id, false).await {
                        registry.inner.terminal.lock().await.insert(&run_id);
                        tracing::debug!(run_id = %run_id, "run recorded terminal");
                    }
                    return;
                }
                if failed {
                    registry.remove_if_current(&run_id, instance_id, false).await;
                    return;
                }
            }
        })
    }

    async fn is_current(&self, run_id: &str, instance_id: u64) -> bool {
        self.inner
            .connections
            .lock()
            .await
            .get(run_id)
            .map(|connection| connection.instance_id == instance_id)
            .unwrap_or(false)
    }

    async fn remove_if_current(&self, run_id: &str, instance_id: u64, abort_pump: bool) -> bool {
        let mut connections = self.inner.connections.lock().await;
        let current = connections
            .get(run_id)
            .map(|connection| connection.instance_id == instance_id)
            .unwrap_or(false);
        if !current {
            return false;
        }
        if let Some(mut connection) = connections.remove(run_id) {
            if abort_pump {
                if let Some(pump) = connection.pump.take() {
                    pump.abort();
                }
            }
        }
        true
    }
}
