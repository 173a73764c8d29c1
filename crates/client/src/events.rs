//! Session event broadcasting.
//!
//! Session state (row cache, error map, progress slot) lives outside any UI
//! framework. Presentation code subscribes here and re-reads the state it
//! cares about when told something changed, so cache writes never force a
//! full state diff.
//!
//! Design:
//! - Each subscriber gets its own bounded queue
//! - Broadcast never blocks; a full queue drops the event for that subscriber
//! - Closed subscribers are pruned on the next broadcast

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use smol::channel::{self, Receiver, Sender, TrySendError};
use tidygrid_protocol::JobKind;

use crate::process::CurrentProcess;
use crate::stage::Stage;

/// Default per-subscriber queue depth.
pub const DEFAULT_QUEUE_DEPTH: usize = 256;

/// Notifications published by a session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The engine signalled ready.
    EngineReady,
    StageChanged { from: Stage, to: Stage },
    /// The current-process slot changed (acquired, updated or released).
    ProcessChanged(Option<CurrentProcess>),
    /// The error map changed; read a fresh snapshot.
    ErrorsChanged,
    /// The pending-validation set changed.
    PendingChanged,
    /// Rows landed in the cache.
    RowsFetched { start: usize, count: usize },
    /// Cached rows may be stale; re-render from the cache.
    DataVersionChanged(u64),
    /// The full validation pass finished.
    ValidationCompleted { rows_processed: usize },
    /// Unsolicited per-chunk progress reported by the engine.
    EngineProgress { job: JobKind, rows_processed: usize, total_rows: usize },
    /// An engine failure that could not be attributed to any call.
    UnroutableFault { message: String },
}

/// Registry of event subscribers.
/// Cloneable; all clones share the same subscriber list.
#[derive(Clone)]
pub struct EventRegistry {
    senders: Arc<Mutex<Vec<(u64, Sender<SessionEvent>)>>>,
    next_id: Arc<AtomicU64>,
    dropped_events: Arc<AtomicU64>,
    queue_depth: usize,
}

impl EventRegistry {
    pub fn new(queue_depth: usize) -> Self {
        Self {
            senders: Arc::new(Mutex::new(Vec::new())),
            next_id: Arc::new(AtomicU64::new(1)),
            dropped_events: Arc::new(AtomicU64::new(0)),
            queue_depth: queue_depth.max(1),
        }
    }

    /// Register a subscriber and return its id and receiver.
    pub fn register(&self) -> (u64, Receiver<SessionEvent>) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = channel::bounded(self.queue_depth);
        self.senders.lock().push((id, tx));
        (id, rx)
    }

    pub fn unregister(&self, id: u64) {
        self.senders.lock().retain(|(sub_id, _)| *sub_id != id);
    }

    /// Deliver an event to every subscriber without blocking.
    pub fn broadcast(&self, event: SessionEvent) {
        let mut senders = self.senders.lock();
        senders.retain(|(id, tx)| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.dropped_events.fetch_add(1, Ordering::Relaxed);
                log::debug!("event dropped for subscriber {} (backpressure)", id);
                true
            }
            Err(TrySendError::Closed(_)) => false,
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.senders.lock().len()
    }

    /// Total events dropped due to full queues.
    pub fn dropped_events_count(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }
}

impl Default for EventRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_DEPTH)
    }
}
