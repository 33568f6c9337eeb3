//! The mock Modbus server: a scriptable, fault-injecting endpoint emulator.

mod dispatch;
mod faults;
mod rules;
mod store;

use std::future::Future;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info};

pub use dispatch::ServerState;
pub use faults::{FaultInjector, FaultProfile};
pub use rules::{Rule, RuleKey, RuleMap};
pub use store::{RegisterGroup, RegisterStore, StoreSnapshot, StoreValue};

use crate::codec::{self, Framing, RegisterKind, MBAP_HEADER_LEN};
use crate::config::{DeviceConfig, MockServerConfig};
use crate::connection::ConnectionManager;
use crate::errors::{ConfigError, IoOperation, TransportError, UmdtError};
use crate::events::{EventBus, EventKind, EventSubscriber, LifecycleState};
use crate::script::{ScriptRegistry, ServerScriptHost, STOP_GRACE};
use crate::transport::{Endpoint, SerialTransport, Transport, TransportOptions};

/// One emulated Modbus endpoint with its listener lifecycle.
pub struct MockServer {
    config: MockServerConfig,
    state: Arc<ServerState>,
    scripts: Arc<ServerScriptHost>,
    /// Scripts resolved at build time, installed when `run` starts.
    pending_scripts: std::sync::Mutex<Vec<Arc<dyn crate::script::ServerScript>>>,
    connections: Arc<ConnectionManager>,
    events: EventBus,
    shutdown: broadcast::Sender<()>,
}

impl MockServer {
    /// Builds the server from config; scripts are resolved from `registry`.
    pub fn new(config: MockServerConfig, registry: &ScriptRegistry) -> Result<Arc<Self>, UmdtError> {
        config.validate()?;

        let events = EventBus::default();
        let state = ServerState::new(&config.device, events.clone())?;
        let scripts = Arc::new(ServerScriptHost::new(
            events.clone(),
            Some(state.clone() as Arc<dyn crate::script::RegisterAccess>),
        ));

        let mut resolved = Vec::new();
        for script in &config.device.scripts {
            if !script.enabled {
                continue;
            }
            let built = registry.build_server(&script.path).ok_or_else(|| {
                ConfigError::invalid(format!("unknown server script '{}'", script.path))
            })?;
            resolved.push(built);
        }

        Ok(Arc::new(Self {
            connections: Arc::new(ConnectionManager::new(config.connection.clone())),
            state,
            scripts,
            pending_scripts: std::sync::Mutex::new(resolved),
            events,
            shutdown: broadcast::channel(1).0,
            config,
        }))
    }

    pub fn state(&self) -> &Arc<ServerState> {
        &self.state
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Subscribes to the diagnostic event stream.
    pub fn subscribe(&self) -> EventSubscriber {
        self.events.subscribe()
    }

    // Thin state-API delegation for front-ends.

    pub async fn get(&self, kind: RegisterKind, address: u16) -> Option<StoreValue> {
        self.state.get(kind, address).await
    }

    pub async fn set(
        &self,
        kind: RegisterKind,
        address: u16,
        value: StoreValue,
    ) -> Result<(), UmdtError> {
        self.state.set(kind, address, value).await
    }

    pub fn add_rule(&self, kind: RegisterKind, address: u16, rule: Rule) {
        self.state.add_rule(kind, address, rule);
    }

    pub fn remove_rule(&self, kind: RegisterKind, address: u16) {
        self.state.remove_rule(kind, address);
    }

    pub fn update_faults(&self, profile: FaultProfile) {
        self.state.update_faults(profile);
    }

    pub async fn load_config(&self, path: impl AsRef<Path>) -> Result<(), UmdtError> {
        let device = DeviceConfig::from_file(path)?;
        self.state.load_config(&device).await
    }

    pub async fn snapshot(&self) -> StoreSnapshot {
        self.state.snapshot().await
    }

    /// Atomically replaces the script hook table.
    pub async fn reload_scripts(&self, scripts: Vec<Arc<dyn crate::script::ServerScript>>) {
        self.scripts.install(scripts).await;
    }

    fn spawn_task<F>(&self, name: &str, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let task = tokio::spawn(future);
        debug!("Spawned {} task: {:?}", name, task.id());
    }

    /// Runs the listener until `shutdown`.
    pub async fn run(self: Arc<Self>) -> Result<(), UmdtError> {
        let pending = std::mem::take(&mut *self.pending_scripts.lock().expect("scripts poisoned"));
        if !pending.is_empty() {
            self.scripts.install(pending).await;
        }
        self.scripts.start().await;
        self.events.publish(EventKind::Lifecycle {
            component: "mock-server",
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

        let result = match self.config.listen.clone() {
            Endpoint::Tcp(tcp) => self.clone().run_tcp(&tcp.address()).await,
            Endpoint::Serial(serial) => self.clone().run_serial(serial).await,
        };

        self.events.publish(EventKind::Lifecycle {
            component: "mock-server",
            state: LifecycleState::Stopped,
        });
        result
    }

    async fn run_tcp(self: Arc<Self>, addr: &str) -> Result<(), UmdtError> {
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            TransportError::io(
                IoOperation::Listen,
                format!("Failed to bind to address {}", addr),
                e,
            )
        })?;

        info!("Mock server listening on {}", addr);
        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((socket, peer)) => {
                        info!("New connection from {}", peer);
                        match self.connections.accept_connection(peer).await {
                            Ok(guard) => {
                                let server = Arc::clone(&self);
                                self.spawn_task("session", async move {
                                    server.events.publish(EventKind::Connection {
                                        peer: peer.to_string(),
                                        connected: true,
                                    });
                                    if let Err(e) = server.handle_tcp_session(socket, peer).await {
                                        error!("Session error: {}", e);
                                    }
                                    server.events.publish(EventKind::Connection {
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
                    info!("Mock server listener shutting down");
                    return Ok(());
                }
            }
        }
    }

    /// Serves one TCP session: MBAP frames in arrival order.
    async fn handle_tcp_session(
        self: &Arc<Self>,
        mut socket: TcpStream,
        peer: SocketAddr,
    ) -> Result<(), UmdtError> {
        socket.set_nodelay(true).map_err(|e| {
            TransportError::io(IoOperation::Configure, "Failed to set TCP_NODELAY", e)
        })?;

        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            let mut header = [0u8; MBAP_HEADER_LEN];
            tokio::select! {
                read = timeout(self.config.session_timeout, socket.read_exact(&mut header)) => {
                    match read {
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                            info!("Client {} disconnected", peer);
                            return Ok(());
                        }
                        Ok(Err(e)) => return Err(TransportError::from(e).into()),
                        Err(_) => {
                            info!("Client {} idle, closing session", peer);
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
                    self.events.publish(EventKind::Error {
                        message: "truncated MBAP frame".to_string(),
                        raw: Some(header.to_vec()),
                    });
                    self.connections.record_request(peer, false).await;
                    return Ok(());
                }
                Err(_) => {
                    debug!("Mid-frame silence from {}", peer);
                    self.events.publish(EventKind::Error {
                        message: "truncated MBAP frame".to_string(),
                        raw: Some(header.to_vec()),
                    });
                    self.connections.record_request(peer, false).await;
                    return Ok(());
                }
            }

            let mut raw = header.to_vec();
            raw.extend_from_slice(&body);
            let frame = codec::tcp::decode(&raw);
            debug!("Received TCP frame from {}: {:02X?}", peer, raw);

            match self.state.dispatch(&frame, &self.scripts).await {
                Some(response) => {
                    let reply = codec::tcp::encode(
                        frame.transaction_id.unwrap_or(0),
                        response.unit_id,
                        response.wire_function(),
                        &response.payload,
                    );
                    if let Err(e) = socket.write_all(&reply).await {
                        self.connections.record_request(peer, false).await;
                        return Err(TransportError::from(e).into());
                    }
                    self.connections
                        .record_request(peer, !response.is_exception)
                        .await;
                }
                None => {
                    // Dropped (fault, unit mismatch, script): no reply.
                    self.connections.record_request(peer, false).await;
                }
            }
        }
    }

    /// Serves one serial line: RTU frames delimited by silence.
    async fn run_serial(
        self: Arc<Self>,
        endpoint: crate::transport::SerialEndpoint,
    ) -> Result<(), UmdtError> {
        let mut transport = SerialTransport::new(
            endpoint,
            TransportOptions::default(),
            self.events.clone(),
        );
        transport.open().await?;
        info!("Mock server serving on {}", transport.describe());

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
            if let Some(response) = self.state.dispatch(&frame, &self.scripts).await {
                let reply = codec::rtu::encode(
                    response.unit_id,
                    response.wire_function(),
                    &response.payload,
                );
                if let Err(e) = transport.send(&reply).await {
                    error!("Serial reply failed: {}", e);
                }
            }
        }
    }

    /// Graceful shutdown: stop accepting, give scripts their grace period.
    pub async fn shutdown(&self) -> Result<(), UmdtError> {
        info!("Mock server shutting down");
        let _ = self.shutdown.send(());
        self.scripts.stop(STOP_GRACE).await;
        Ok(())
    }

    /// Framing used on the listener side.
    pub fn framing(&self) -> Framing {
        self.config.listen.framing()
    }
}
