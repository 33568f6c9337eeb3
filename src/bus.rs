//! Per-transport bus coordination.
//!
//! Background scanners and user-initiated operations compete for the same
//! wire. The coordinator hands out exclusive guards, serving operators
//! before queued scanners; a scanner holding the bus is expected to check
//! [`BusGuard::should_yield`] at each frame boundary and release so an
//! operator waits for at most one in-flight frame.
//!
//! Grant hand-off travels through a oneshot channel carrying the guard
//! itself: a waiter cancelled mid-grant drops the unreceived guard, which
//! releases the bus to the next waiter instead of leaking it.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

/// Who is asking for the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusPriority {
    /// User-initiated read/write: served before queued scanners.
    Operator,
    /// Background sweep: yields to operators at frame boundaries.
    Scanner,
}

#[derive(Default)]
struct BusState {
    held: bool,
    operators: VecDeque<oneshot::Sender<BusGuard>>,
    scanners: VecDeque<oneshot::Sender<BusGuard>>,
}

/// Mutual exclusion over one transport, with role priority.
pub struct BusCoordinator {
    state: Mutex<BusState>,
}

impl BusCoordinator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(BusState::default()),
        })
    }

    /// Waits until the bus is free and returns the exclusive guard.
    ///
    /// FIFO within each priority class; operators overtake queued scanners.
    /// Dropping the returned future while queued cancels the wait.
    pub async fn acquire(self: &Arc<Self>, priority: BusPriority) -> BusGuard {
        let rx = {
            let mut state = self.state.lock().expect("bus state poisoned");
            if !state.held {
                state.held = true;
                return BusGuard::new(Arc::clone(self), priority);
            }
            let (tx, rx) = oneshot::channel();
            match priority {
                BusPriority::Operator => state.operators.push_back(tx),
                BusPriority::Scanner => state.scanners.push_back(tx),
            }
            rx
        };

        match rx.await {
            Ok(guard) => guard,
            // The coordinator only drops senders on release when the waiter
            // already went away; a live waiter cannot see this.
            Err(_) => unreachable!("bus grant channel closed while waiting"),
        }
    }

    /// True while at least one operator is queued. Scanners poll this via
    /// their guard to honor frame-boundary preemption.
    pub fn operator_waiting(&self) -> bool {
        !self
            .state
            .lock()
            .expect("bus state poisoned")
            .operators
            .is_empty()
    }

    fn release(self: &Arc<Self>) {
        loop {
            let (waiter, priority) = {
                let mut state = self.state.lock().expect("bus state poisoned");
                if let Some(tx) = state.operators.pop_front() {
                    (tx, BusPriority::Operator)
                } else if let Some(tx) = state.scanners.pop_front() {
                    (tx, BusPriority::Scanner)
                } else {
                    state.held = false;
                    return;
                }
            };

            let mut guard = BusGuard::new(Arc::clone(self), priority);
            match waiter.send(guard) {
                Ok(()) => return,
                Err(returned) => {
                    // Waiter cancelled; keep the bus and try the next one.
                    guard = returned;
                    guard.disarm();
                }
            }
        }
    }
}

/// Exclusive hold on the bus; releases on drop.
pub struct BusGuard {
    coordinator: Arc<BusCoordinator>,
    priority: BusPriority,
    armed: bool,
}

impl BusGuard {
    fn new(coordinator: Arc<BusCoordinator>, priority: BusPriority) -> Self {
        Self {
            coordinator,
            priority,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }

    pub fn priority(&self) -> BusPriority {
        self.priority
    }

    /// Whether a scanner holding this guard must hand the bus over.
    pub fn should_yield(&self) -> bool {
        self.priority == BusPriority::Scanner && self.coordinator.operator_waiting()
    }
}

impl Drop for BusGuard {
    fn drop(&mut self) {
        if self.armed {
            self.coordinator.release();
        }
    }
}
