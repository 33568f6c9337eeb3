use std::collections::HashMap;

use crate::codec::Framing;

/// Maps bridge-issued downstream transaction ids back to the upstream ids
/// they answer, so a TCP master gets its own id back even when the
/// downstream side renumbers (TCP) or has no ids at all (RTU).
#[derive(Debug, Default)]
pub(crate) struct TxnTracker {
    next_downstream: u16,
    in_flight: HashMap<u16, u16>,
}

impl TxnTracker {
    /// Allocates the downstream id for a request and remembers which
    /// upstream id it belongs to.
    pub fn register(&mut self, upstream: Option<u16>) -> u16 {
        self.next_downstream = self.next_downstream.wrapping_add(1);
        let downstream = self.next_downstream;
        self.in_flight.insert(downstream, upstream.unwrap_or(0));
        downstream
    }

    /// Resolves a downstream response id back to the upstream id.
    pub fn resolve(&mut self, downstream: u16) -> Option<u16> {
        self.in_flight.remove(&downstream)
    }
}

/// Per-upstream-connection state. Sessions are single-threaded: requests
/// are relayed in arrival order and responses leave in the same order.
pub(crate) struct SessionState {
    pub peer: String,
    pub upstream_framing: Framing,
    pub txn: TxnTracker,
}

impl SessionState {
    pub fn new(peer: impl Into<String>, upstream_framing: Framing) -> Self {
        Self {
            peer: peer.into(),
            upstream_framing,
            txn: TxnTracker::default(),
        }
    }
}
