//! In-process diagnostic event bus.
//!
//! Every engine publishes its significant moments here; front-ends, scripts
//! and tests subscribe. Delivery is best-effort: each subscriber owns a
//! bounded queue and a subscriber that falls behind loses the oldest events,
//! never back-pressuring the producing engine.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use tokio::sync::broadcast;

use crate::codec::ExceptionCode;

/// Which fault the injector fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    Drop,
    Latency,
    BitFlip,
    ForcedException,
}

impl std::fmt::Display for FaultKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Drop => write!(f, "drop"),
            Self::Latency => write!(f, "latency"),
            Self::BitFlip => write!(f, "bit_flip"),
            Self::ForcedException => write!(f, "forced_exception"),
        }
    }
}

/// Engine lifecycle transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Started,
    Stopped,
}

#[derive(Debug, Clone)]
pub enum EventKind {
    /// A request observed or issued, with the bytes as on the wire.
    Request {
        unit_id: u8,
        function: u8,
        raw: Vec<u8>,
    },
    /// A response observed or produced.
    Response {
        unit_id: u8,
        function: u8,
        is_exception: bool,
        exception_code: Option<ExceptionCode>,
        raw: Vec<u8>,
    },
    /// A failure, optionally with the offending bytes.
    Error {
        message: String,
        raw: Option<Vec<u8>>,
    },
    /// The fault injector fired.
    FaultInjected { kind: FaultKind },
    /// An upstream peer attached or detached.
    Connection { peer: String, connected: bool },
    /// An engine started or stopped.
    Lifecycle {
        component: &'static str,
        state: LifecycleState,
    },
    /// Pre-flight summary emitted before a client write hits the wire.
    WritePreflight {
        address: u16,
        registers: Vec<u16>,
        interpretation: String,
    },
    /// Script-originated event (`ctx.emit_event`).
    Custom {
        name: String,
        payload: serde_json::Value,
    },
}

#[derive(Debug, Clone)]
pub struct Event {
    /// Monotonic per-bus sequence number.
    pub id: u64,
    pub timestamp: SystemTime,
    pub kind: EventKind,
}

/// Cloneable handle to a broadcast event channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
    seq: Arc<AtomicU64>,
}

impl EventBus {
    /// Default per-subscriber queue depth.
    pub const DEFAULT_CAPACITY: usize = 1024;

    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            seq: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn publish(&self, kind: EventKind) {
        let event = Event {
            id: self.seq.fetch_add(1, Ordering::Relaxed),
            timestamp: SystemTime::now(),
            kind,
        };
        // Send fails only when nobody is subscribed, which is fine.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> EventSubscriber {
        EventSubscriber {
            rx: self.tx.subscribe(),
            dropped: 0,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

/// One subscriber's view of the bus.
pub struct EventSubscriber {
    rx: broadcast::Receiver<Event>,
    dropped: u64,
}

impl EventSubscriber {
    /// Next event in arrival order, or `None` once the bus is gone.
    ///
    /// Overflow is absorbed here: lagging skips the oldest events and bumps
    /// the drop counter instead of surfacing an error.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.dropped += n;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant for polling consumers.
    pub fn try_recv(&mut self) -> Option<Event> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    self.dropped += n;
                }
                Err(_) => return None,
            }
        }
    }

    /// Events lost to overflow so far.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}
