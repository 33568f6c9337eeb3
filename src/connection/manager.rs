use std::{
    collections::HashMap,
    net::{IpAddr, SocketAddr},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use tokio::sync::{Mutex, Semaphore};
use tracing::info;

use crate::config::ConnectionConfig;
use crate::errors::{ConnectionError, UmdtError};

use super::{ClientStats, ConnectionGuard, ConnectionStats, IpStats};

/// Admission control and bookkeeping for an upstream listener.
///
/// Serves both the mock server and the bridge: global and per-IP limits via
/// semaphores, per-client counters, idle cleanup.
#[derive(Debug)]
pub struct Manager {
    per_ip_semaphores: Mutex<HashMap<IpAddr, Arc<Semaphore>>>,
    global_semaphore: Arc<Semaphore>,
    pub(crate) stats: Mutex<HashMap<SocketAddr, ClientStats>>,
    config: ConnectionConfig,
    total_connections: AtomicU64,
}

impl Manager {
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            per_ip_semaphores: Mutex::new(HashMap::new()),
            global_semaphore: Arc::new(Semaphore::new(config.max_connections)),
            stats: Mutex::new(HashMap::new()),
            config,
            total_connections: AtomicU64::new(0),
        }
    }

    /// Admits a new connection or rejects it against the limits.
    pub async fn accept_connection(
        self: &Arc<Self>,
        addr: SocketAddr,
    ) -> Result<ConnectionGuard, UmdtError> {
        let per_ip_permit = if let Some(per_ip_limit) = self.config.per_ip_limits {
            let mut semaphores = self.per_ip_semaphores.lock().await;
            let semaphore = semaphores
                .entry(addr.ip())
                .or_insert_with(|| Arc::new(Semaphore::new(per_ip_limit)));

            Some(semaphore.clone().try_acquire_owned().map_err(|_| {
                UmdtError::Connection(ConnectionError::limit_exceeded(format!(
                    "Per-IP limit ({}) reached for {}",
                    per_ip_limit,
                    addr.ip()
                )))
            })?)
        } else {
            None
        };

        let global_permit = self
            .global_semaphore
            .clone()
            .try_acquire_owned()
            .map_err(|_| {
                UmdtError::Connection(ConnectionError::limit_exceeded(
                    "Global connection limit reached",
                ))
            })?;

        {
            let mut stats = self.stats.lock().await;
            let client_stats = stats.entry(addr).or_insert_with(ClientStats::fresh);
            client_stats.active_connections += 1;
            client_stats.last_active = Instant::now();
        }

        self.total_connections.fetch_add(1, Ordering::Relaxed);

        Ok(ConnectionGuard {
            manager: Arc::clone(self),
            addr,
            _global_permit: global_permit,
            _per_ip_permit: per_ip_permit,
        })
    }

    /// Updates counters after a served (or failed) request.
    pub async fn record_request(&self, addr: SocketAddr, success: bool) {
        let mut stats = self.stats.lock().await;
        let client_stats = stats.entry(addr).or_insert_with(ClientStats::fresh);
        client_stats.total_requests += 1;
        client_stats.last_active = Instant::now();
        if !success {
            client_stats.error_count += 1;
            client_stats.last_error = Some(Instant::now());
        }
    }

    fn should_cleanup(stats: &ClientStats, now: Instant, idle: Duration, error: Duration) -> bool {
        stats.active_connections == 0
            && (now.duration_since(stats.last_active) >= idle
                || (stats.error_count > 0
                    && now.duration_since(stats.last_error.unwrap_or(now)) >= error))
    }

    /// Forgets peers that went quiet.
    pub async fn cleanup_idle_connections(&self) {
        let now = Instant::now();
        let mut stats = self.stats.lock().await;
        stats.retain(|addr, client_stats| {
            let drop_it = Self::should_cleanup(
                client_stats,
                now,
                self.config.idle_timeout,
                self.config.error_timeout,
            );
            if drop_it {
                info!(
                    "Forgetting idle peer {} ({} requests, {} errors)",
                    addr, client_stats.total_requests, client_stats.error_count
                );
            }
            !drop_it
        });
    }

    pub async fn get_stats(&self) -> ConnectionStats {
        let stats = self.stats.lock().await;
        let mut total_active = 0usize;
        let mut total_requests = 0u64;
        let mut total_errors = 0u64;
        let mut per_ip_stats = HashMap::new();

        for (addr, client_stats) in stats.iter() {
            total_active += client_stats.active_connections;
            total_requests += client_stats.total_requests;
            total_errors += client_stats.error_count;
            per_ip_stats.insert(
                *addr,
                IpStats {
                    active_connections: client_stats.active_connections,
                    total_requests: client_stats.total_requests,
                    error_count: client_stats.error_count,
                    last_active: client_stats.last_active,
                    last_error: client_stats.last_error,
                },
            );
        }

        ConnectionStats {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_connections: total_active,
            total_requests,
            total_errors,
            per_ip_stats,
        }
    }
}
