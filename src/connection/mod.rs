mod backoff_strategy;
mod guard;
mod manager;
mod stats;

pub use backoff_strategy::BackoffStrategy;
pub use guard::ConnectionGuard;
pub use manager::Manager as ConnectionManager;
pub use stats::ClientStats;
pub use stats::ConnectionStats;
pub use stats::IpStats;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;
    use crate::errors::{ConnectionError, UmdtError};
    use std::{
        net::{IpAddr, Ipv4Addr, SocketAddr},
        sync::Arc,
        time::Duration,
    };
    use tokio::time::sleep;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), port)
    }

    #[tokio::test]
    async fn test_per_ip_limit() {
        let config = ConnectionConfig {
            max_connections: 4,
            per_ip_limits: Some(1),
            ..Default::default()
        };
        let manager = Arc::new(ConnectionManager::new(config));

        let _conn1 = manager.accept_connection(addr(1000)).await.unwrap();

        // Same IP, different source port: still over the per-IP limit.
        match manager.accept_connection(addr(1001)).await {
            Err(UmdtError::Connection(ConnectionError::LimitExceeded(msg))) => {
                assert!(msg.contains("127.0.0.1"), "wrong message: {}", msg);
            }
            other => panic!("expected LimitExceeded, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_global_limit() {
        let config = ConnectionConfig {
            max_connections: 1,
            per_ip_limits: None,
            ..Default::default()
        };
        let manager = Arc::new(ConnectionManager::new(config));

        let conn = manager.accept_connection(addr(1000)).await.unwrap();
        assert!(manager.accept_connection(addr(1001)).await.is_err());

        // Released permit admits the next client.
        drop(conn);
        sleep(Duration::from_millis(50)).await;
        assert!(manager.accept_connection(addr(1001)).await.is_ok());
    }

    #[tokio::test]
    async fn test_guard_decrements_active_count() {
        let manager = Arc::new(ConnectionManager::new(ConnectionConfig::default()));

        {
            let _guard = manager.accept_connection(addr(2000)).await.unwrap();
            let stats = manager.get_stats().await;
            assert_eq!(stats.active_connections, 1);
        }

        sleep(Duration::from_millis(50)).await;
        let stats = manager.get_stats().await;
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.total_connections, 1);
    }

    #[tokio::test]
    async fn test_idle_cleanup() {
        let config = ConnectionConfig {
            idle_timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let manager = Arc::new(ConnectionManager::new(config));

        let guard = manager.accept_connection(addr(3000)).await.unwrap();
        manager.record_request(addr(3000), true).await;
        drop(guard);
        sleep(Duration::from_millis(100)).await;

        manager.cleanup_idle_connections().await;
        let stats = manager.get_stats().await;
        assert!(stats.per_ip_stats.is_empty());
    }

    #[tokio::test]
    async fn test_request_counters() {
        let manager = Arc::new(ConnectionManager::new(ConnectionConfig::default()));
        let _guard = manager.accept_connection(addr(4000)).await.unwrap();

        manager.record_request(addr(4000), true).await;
        manager.record_request(addr(4000), false).await;

        let stats = manager.get_stats().await;
        assert_eq!(stats.total_requests, 2);
        assert_eq!(stats.total_errors, 1);
    }
}
