//! Command lifecycle events
//!
//! The engine reports executions, fallbacks, breaker transitions and pool
//! rejections to an [`EventBus`]. Emitting never blocks the execution path:
//! events are queued on a bounded channel and a dispatcher task hands them
//! to every registered [`EventSink`]. When sinks fall behind and the queue
//! is full, new events are dropped and counted. A sink that returns an error
//! is unregistered and a [`CommandEvent::SinkFailed`] event is emitted in
//! its place.

use crate::circuit_breaker::CircuitState;
use crate::metrics::Outcome;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// Something that happened inside the engine.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "name", rename_all = "snake_case")]
pub enum CommandEvent {
    /// A command's primary step finished with the given outcome.
    Executed {
        group: String,
        execution_id: Uuid,
        outcome: Outcome,
        latency: Duration,
        at: DateTime<Utc>,
    },
    /// A fallback ran.
    Fallback {
        group: String,
        execution_id: Uuid,
        succeeded: bool,
        at: DateTime<Utc>,
    },
    /// A group's breaker changed state.
    BreakerTransition {
        group: String,
        from: CircuitState,
        to: CircuitState,
        at: DateTime<Utc>,
    },
    /// A group's bulkhead refused a command.
    PoolRejected { group: String, at: DateTime<Utc> },
    /// A sink failed and was unregistered.
    SinkFailed {
        sink: String,
        error: String,
        at: DateTime<Utc>,
    },
}

impl CommandEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Executed { .. } => "command.executed",
            Self::Fallback { .. } => "command.fallback",
            Self::BreakerTransition { .. } => "breaker.transition",
            Self::PoolRejected { .. } => "pool.rejected",
            Self::SinkFailed { .. } => "pool.sinkfailed",
        }
    }

    pub fn group(&self) -> Option<&str> {
        match self {
            Self::Executed { group, .. }
            | Self::Fallback { group, .. }
            | Self::BreakerTransition { group, .. }
            | Self::PoolRejected { group, .. } => Some(group),
            Self::SinkFailed { .. } => None,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::Executed { at, .. }
            | Self::Fallback { at, .. }
            | Self::BreakerTransition { at, .. }
            | Self::PoolRejected { at, .. }
            | Self::SinkFailed { at, .. } => *at,
        }
    }
}

/// Sink failure; the sink is removed from the bus.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct SinkError(pub String);

impl SinkError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Consumer of engine events.
pub trait EventSink: Send + Sync {
    /// Name used when reporting a failed sink.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    fn consume(&self, event: &CommandEvent) -> Result<(), SinkError>;
}

/// Closure-backed sink.
pub struct FnSink<F> {
    name: String,
    consume: F,
}

impl<F> FnSink<F>
where
    F: Fn(&CommandEvent) -> Result<(), SinkError> + Send + Sync,
{
    pub fn new(name: impl Into<String>, consume: F) -> Self {
        Self {
            name: name.into(),
            consume,
        }
    }
}

impl<F> EventSink for FnSink<F>
where
    F: Fn(&CommandEvent) -> Result<(), SinkError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn consume(&self, event: &CommandEvent) -> Result<(), SinkError> {
        (self.consume)(event)
    }
}

/// Handle returned by [`EventBus::add_sink`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SinkId(u64);

/// Events queued for the dispatcher before new ones are dropped.
pub const EVENT_QUEUE_CAPACITY: usize = 4096;

struct BusInner {
    sinks: RwLock<Vec<(SinkId, Arc<dyn EventSink>)>>,
    tx: Option<mpsc::Sender<CommandEvent>>,
    next_id: AtomicU64,
    dropped: AtomicU64,
}

impl BusInner {
    fn send(&self, event: CommandEvent) {
        let Some(tx) = &self.tx else {
            return;
        };
        match tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                debug!(
                    event = event.name(),
                    group = event.group(),
                    dropped,
                    "Event queue full, dropping event"
                );
            }
            // Dispatcher is gone (runtime shutting down).
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    fn remove(&self, id: SinkId) -> bool {
        let mut sinks = self.sinks.write();
        let before = sinks.len();
        sinks.retain(|(sink_id, _)| *sink_id != id);
        sinks.len() != before
    }

    fn deliver(&self, event: &CommandEvent) {
        let sinks = self.sinks.read().clone();

        for (id, sink) in sinks {
            if let Err(e) = sink.consume(event) {
                warn!(sink = sink.name(), error = %e, "Event sink failed, removing");
                if self.remove(id) {
                    self.send(CommandEvent::SinkFailed {
                        sink: sink.name().to_string(),
                        error: e.to_string(),
                        at: Utc::now(),
                    });
                }
            }
        }
    }
}

/// Fan-out of engine events to registered sinks.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    /// Create a bus whose dispatcher runs on `handle`.
    pub fn start(handle: &Handle) -> Self {
        Self::start_with_capacity(handle, EVENT_QUEUE_CAPACITY)
    }

    /// Like [`EventBus::start`] with an explicit queue size (minimum 1).
    pub fn start_with_capacity(handle: &Handle, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let inner = Arc::new(BusInner {
            sinks: RwLock::new(Vec::new()),
            tx: Some(tx),
            next_id: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        });

        handle.spawn(dispatch(Arc::downgrade(&inner), rx));

        Self { inner }
    }

    /// Create a bus without a dispatcher; events are only traced.
    pub fn detached() -> Self {
        Self {
            inner: Arc::new(BusInner {
                sinks: RwLock::new(Vec::new()),
                tx: None,
                next_id: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Register a sink.
    pub fn add_sink<S: EventSink + 'static>(&self, sink: S) -> SinkId {
        self.add_shared_sink(Arc::new(sink))
    }

    /// Register a shared sink.
    pub fn add_shared_sink(&self, sink: Arc<dyn EventSink>) -> SinkId {
        let id = SinkId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner.sinks.write().push((id, sink));
        id
    }

    /// Unregister a sink. Returns false if it was already gone.
    pub fn remove_sink(&self, id: SinkId) -> bool {
        self.inner.remove(id)
    }

    /// Unregister every sink.
    pub fn clear(&self) {
        self.inner.sinks.write().clear();
    }

    pub fn sink_count(&self) -> usize {
        self.inner.sinks.read().len()
    }

    /// Events discarded because the queue was full.
    pub fn dropped_count(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    /// Queue an event for delivery.
    pub fn emit(&self, event: CommandEvent) {
        trace!(event = event.name(), group = event.group(), "Event emitted");

        if self.inner.sinks.read().is_empty() {
            return;
        }
        self.inner.send(event);
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("sinks", &self.sink_count())
            .field("dispatching", &self.inner.tx.is_some())
            .field("dropped", &self.dropped_count())
            .finish()
    }
}

async fn dispatch(bus: Weak<BusInner>, mut rx: mpsc::Receiver<CommandEvent>) {
    while let Some(event) = rx.recv().await {
        let Some(inner) = bus.upgrade() else {
            break;
        };
        inner.deliver(&event);
    }
}
