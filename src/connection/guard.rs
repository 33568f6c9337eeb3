use std::{net::SocketAddr, sync::Arc};

use super::ConnectionManager;

/// RAII handle for one accepted upstream connection.
///
/// Holds the limit permits; dropping it returns them and decrements the
/// peer's active count.
#[derive(Debug)]
pub struct ConnectionGuard {
    pub(crate) manager: Arc<ConnectionManager>,
    pub(crate) addr: SocketAddr,
    pub(crate) _global_permit: tokio::sync::OwnedSemaphorePermit,
    pub(crate) _per_ip_permit: Option<tokio::sync::OwnedSemaphorePermit>,
}

impl ConnectionGuard {
    pub fn peer(&self) -> SocketAddr {
        self.addr
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let manager = Arc::clone(&self.manager);
        let addr = self.addr;

        tokio::spawn(async move {
            let mut stats = manager.stats.lock().await;
            if let Some(client_stats) = stats.get_mut(&addr) {
                client_stats.active_connections =
                    client_stats.active_connections.saturating_sub(1);
            }
        });
    }
}
