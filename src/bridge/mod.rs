//! The transparent bridge: relays Modbus between any pair of transports
//! with a hook pipeline and dual-stream capture.

mod pipeline;
mod session;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex};
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info};

use crate::bus::BusCoordinator;
use crate::codec::{self, Framing, MBAP_HEADER_LEN};
use crate::config::BridgeConfig;
use crate::connection::ConnectionManager;
use crate::errors::{ConfigError, IoOperation, TransportError, UmdtError};
use crate::events::{EventBus, EventKind, EventSubscriber, LifecycleState};
use crate::pcap::DualPcap;
use crate::script::{BridgeScriptHost, ScriptRegistry, STOP_GRACE};
use crate::server::FaultInjector;
use crate::transport::{self, Endpoint, SerialTransport, Transport, TransportOptions};

use session::SessionState;

/// One running bridge between an upstream listener and a downstream link.
pub struct Bridge {
    config: BridgeConfig,
    downstream: Mutex<Box<dyn Transport>>,
    bus: Arc<BusCoordinator>,
    scripts: Arc<BridgeScriptHost>,
    pcap: Arc<DualPcap>,
    faults: FaultInjector,
    connections: Arc<ConnectionManager>,
    events: EventBus,
    shutdown: broadcast::Sender<()>,
}

impl Bridge {
    /// Opens the downstream transport and the capture files, resolves the
    /// configured scripts, and returns the bridge ready to run.
    pub async fn new(
        config: BridgeConfig,
        registry: &ScriptRegistry,
    ) -> Result<Arc<Self>, UmdtError> {
        config.validate()?;

        let events = EventBus::default();
        let pcap = DualPcap::open(
            config.pcap_upstream.as_deref(),
            config.pcap_downstream.as_deref(),
        )
        .await?;

        let downstream = transport::connect(
            &config.downstream,
            TransportOptions {
                request_timeout: config.request_timeout,
                ..Default::default()
            },
            events.clone(),
        )
        .await?;
        info!("Bridge downstream connected: {}", downstream.describe());

        let scripts = Arc::new(BridgeScriptHost::new(events.clone()));
        let mut resolved = Vec::new();
        for script in &config.scripts {
            if !script.enabled {
                continue;
            }
            let built = registry.build_bridge(&script.path).ok_or_else(|| {
                ConfigError::invalid(format!("unknown bridge script '{}'", script.path))
            })?;
            resolved.push(built);
        }
        scripts.install(resolved).await;

        Ok(Arc::new(Self {
            downstream: Mutex::new(downstream),
            bus: BusCoordinator::new(),
            scripts,
            pcap: Arc::new(pcap),
            faults: FaultInjector::new((&config.faults).into()),
            connections: Arc::new(ConnectionManager::new(config.connection.clone())),
            events,
            shutdown: broadcast::channel(1).0,
            config,
        }))
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn subscribe(&self) -> EventSubscriber {
        self.events.subscribe()
    }

    /// Atomically replaces the hook table.
    pub async fn reload_scripts(&self, scripts: Vec<Arc<dyn crate::script::BridgeScript>>) {
        self.scripts.install(scripts).await;
    }

    fn spawn_task<F>(&self, name: &str, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let task = tokio::spawn(future);
        debug!("Spawned {} task: {:?}", name, task.id());
    }

    /// Runs the upstream listener until `shutdown`.
    pub async fn run(self: Arc<Self>) -> Result<(), UmdtError> {
        self.scripts.start().await;
        self.events.publish(EventKind::Lifecycle {
            component: "bridge",
            state: LifecycleState::Started,
        });

        if let Some(interval) = self.config.periodic_interval {
            let scripts = Arc::clone(&self.scripts);
            let mut shutdown_rx = self.shutdown.subscribe();
            self.spawn_task("periodic", async move {
                loop {
                    tokio::select! {
                        _ = sleep(interval) => scripts.run_periodic().await,
                        _ = shutdown_rx.recv() => break,
                    }
                }
            });
        }

        let manager = Arc::clone(&self.connections);
        let mut shutdown_rx = self.shutdown.subscribe();
        self.spawn_task("cleanup", async move {
            loop {
                tokio::select! {
                    _ = sleep(Duration::from_secs(60)) => manager.cleanup_idle_connections().await,
                    _ = shutdown_rx.recv() => break,
                }
            }
        });

        let result = match self.config.upstream.clone() {
            Endpoint::Tcp(tcp) => self.clone().run_tcp_upstream(&tcp.address()).await,
            Endpoint::Serial(serial) => self.clone().run_serial_upstream(serial).await,
        };

        self.events.publish(EventKind::Lifecycle {
            component: "bridge",
            state: LifecycleState::Stopped,
        });
        result
    }

    async fn run_tcp_upstream(self: Arc<Self>, addr: &str) -> Result<(), UmdtError> {
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            TransportError::io(
                IoOperation::Listen,
                format!("Failed to bind to address {}", addr),
                e,
            )
        })?;

        info!("Bridge listening on {}", addr);
        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((socket, peer)) => {
                        info!("Master connected from {}", peer);
                        match self.connections.accept_connection(peer).await {
                            Ok(guard) => {
                                let bridge = Arc::clone(&self);
                                self.spawn_task("session", async move {
                                    bridge.events.publish(EventKind::Connection {
                                        peer: peer.to_string(),
                                        connected: true,
                                    });
                                    if let Err(e) = bridge.handle_tcp_session(socket, peer).await {
                                        error!("Session error: {}", e);
                                    }
                                    bridge.events.publish(EventKind::Connection {
                                        peer: peer.to_string(),
                                        connected: false,
                                    });
                                    drop(guard);
                                });
                            }
                            Err(e) => {
                                error!("Connection rejected: {}", e);
                                sleep(Duration::from_millis(100)).await;
                            }
                        }
                    }
                    Err(e) => {
                        error!("Accept error: {}", e);
                        sleep(Duration::from_millis(100)).await;
                    }
                },
                _ = shutdown_rx.recv() => {
                    info!("Bridge listener shutting down");
                    return Ok(());
                }
            }
        }
    }

    async fn handle_tcp_session(
        self: &Arc<Self>,
        mut socket: TcpStream,
        peer: SocketAddr,
    ) -> Result<(), UmdtError> {
        socket.set_nodelay(true).map_err(|e| {
            TransportError::io(IoOperation::Configure, "Failed to set TCP_NODELAY", e)
        })?;

        let mut session = SessionState::new(peer.to_string(), Framing::Tcp);
        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            let mut header = [0u8; MBAP_HEADER_LEN];
            tokio::select! {
                read = timeout(self.config.session_timeout, socket.read_exact(&mut header)) => {
                    match read {
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                            info!("Master {} disconnected", peer);
                            return Ok(());
                        }
                        Ok(Err(e)) => return Err(TransportError::from(e).into()),
                        Err(_) => {
                            info!("Master {} idle, closing session", peer);
                            return Ok(());
                        }
                    }
                }
                _ = shutdown_rx.recv() => return Ok(()),
            }

            let mbap = codec::MbapHeader::parse(&header);
            let mut body = vec![0u8; mbap.remaining()];
            match timeout(self.config.session_timeout, socket.read_exact(&mut body)).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    debug!("Truncated frame from {}: {}", peer, e);
                    self.connections.record_request(peer, false).await;
                    return Ok(());
                }
                Err(_) => {
                    self.connections.record_request(peer, false).await;
                    return Ok(());
                }
            }

            let mut raw = header.to_vec();
            raw.extend_from_slice(&body);
            let frame = codec::tcp::decode(&raw);
            debug!("Upstream frame from {}: {:02X?}", peer, raw);

            match self.relay(&mut session, frame).await {
                Some(reply) => {
                    if let Err(e) = socket.write_all(&reply).await {
                        self.connections.record_request(peer, false).await;
                        return Err(TransportError::from(e).into());
                    }
                    self.connections.record_request(peer, true).await;
                }
                None => {
                    self.connections.record_request(peer, false).await;
                }
            }
        }
    }

    /// Serial upstream: the bridge answers as a slave on that bus.
    async fn run_serial_upstream(
        self: Arc<Self>,
        endpoint: crate::transport::SerialEndpoint,
    ) -> Result<(), UmdtError> {
        let mut transport = SerialTransport::new(
            endpoint,
            TransportOptions::default(),
            self.events.clone(),
        );
        transport.open().await?;
        info!("Bridge serving on {}", transport.describe());

        let mut session = SessionState::new(transport.describe(), Framing::Rtu);
        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            let received = tokio::select! {
                received = transport.receive_frame(Duration::from_secs(1)) => received,
                _ = shutdown_rx.recv() => {
                    let _ = transport.close().await;
                    return Ok(());
                }
            };

            let bytes = match received {
                Ok(bytes) => bytes,
                Err(TransportError::Timeout { .. }) => continue,
                Err(e) => {
                    let _ = transport.close().await;
                    return Err(e.into());
                }
            };

            let frame = codec::rtu::decode(&bytes);
            if let Some(reply) = self.relay(&mut session, frame).await {
                if let Err(e) = transport.send(&reply).await {
                    error!("Upstream serial reply failed: {}", e);
                }
            }
        }
    }

    /// Graceful shutdown: stop the listener, give scripts their grace,
    /// close the downstream link.
    pub async fn shutdown(&self) -> Result<(), UmdtError> {
        info!("Bridge shutting down");
        let _ = self.shutdown.send(());
        self.scripts.stop(STOP_GRACE).await;
        let mut downstream = self.downstream.lock().await;
        let _ = downstream.close().await;
        Ok(())
    }
}
