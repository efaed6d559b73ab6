//! TCP server implementation.

use crate::broadcast::MetaEventBroadcaster;
use crate::config::Config;
use crate::error::ServerError;
use crate::handler::{Disposition, MessageHandler, RouterInfo};
use crate::metrics::Metrics;
use crate::session::{Session, SessionState, WireMode, WireReader};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rand::Rng;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use wampd_core::{Dealer, DealerOptions, MetaEventSink};
use wampd_protocol::{Message, MessageRegistry, DEFAULT_PORT, MAX_ID};

/// Server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Idle connection timeout.
    pub idle_timeout: Duration,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Wire format spoken on every connection.
    pub wire_mode: WireMode,
    /// Realm and agent announced in WELCOME.
    pub router: RouterInfo,
    pub dealer: DealerOptions,
    /// Metrics instance (if metrics are enabled).
    pub metrics: Option<Arc<Metrics>>,
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("bind_addr", &self.bind_addr)
            .field("idle_timeout", &self.idle_timeout)
            .field("max_connections", &self.max_connections)
            .field("wire_mode", &self.wire_mode)
            .field("router", &self.router)
            .field("dealer", &self.dealer)
            .field("metrics_enabled", &self.metrics.is_some())
            .finish()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)),
            idle_timeout: Duration::from_secs(300),
            max_connections: 1000,
            wire_mode: WireMode::default(),
            router: RouterInfo::default(),
            dealer: DealerOptions::default(),
            metrics: None,
        }
    }
}

impl ServerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Default::default()
        }
    }

    /// Builds the server configuration from a loaded [`Config`].
    pub fn from_config(config: &Config) -> Self {
        Self {
            bind_addr: config.network.bind_addr,
            idle_timeout: config.network.idle_timeout(),
            max_connections: config.network.max_connections,
            wire_mode: config.network.wire_mode,
            router: RouterInfo {
                realm: config.realm.name.clone(),
                agent: config.realm.agent.clone(),
            },
            dealer: config.dealer.options(),
            metrics: None,
        }
    }

    pub fn with_wire_mode(mut self, wire_mode: WireMode) -> Self {
        self.wire_mode = wire_mode;
        self
    }

    pub fn with_dealer_options(mut self, options: DealerOptions) -> Self {
        self.dealer = options;
        self
    }

    /// Sets the metrics instance.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Returns whether metrics are enabled.
    pub fn metrics_enabled(&self) -> bool {
        self.metrics.is_some()
    }
}

/// Server statistics.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    pub messages_total: AtomicU64,
    pub errors_total: AtomicU64,
}

/// WAMP router serving the dealer role over TCP.
pub struct Server {
    config: ServerConfig,
    handler: Arc<MessageHandler>,
    broadcaster: Arc<MetaEventBroadcaster>,
    sessions: Arc<DashMap<u64, Arc<Session>>>,
    stats: Arc<ServerStats>,
    shutdown: broadcast::Sender<()>,
    running: AtomicBool,
}

/// Default meta event channel capacity.
const DEFAULT_BROADCAST_CAPACITY: usize = 1024;

const READ_BUFFER_SIZE: usize = 8192;

impl Server {
    /// Creates a new server with its own dealer.
    pub fn new(config: ServerConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        let mut broadcaster = MetaEventBroadcaster::new(DEFAULT_BROADCAST_CAPACITY);
        if let Some(ref metrics) = config.metrics {
            broadcaster = broadcaster.with_metrics(metrics.clone());
        }
        let broadcaster = Arc::new(broadcaster);

        let registry = Arc::new(MessageRegistry::standard());
        let events: Arc<dyn MetaEventSink> = broadcaster.clone();
        let dealer = Dealer::new(registry, events).with_options(config.dealer.clone());

        let mut handler = MessageHandler::new(Arc::new(dealer), config.router.clone());
        if let Some(ref metrics) = config.metrics {
            handler = handler.with_metrics(metrics.clone());
        }

        Self {
            config,
            handler: Arc::new(handler),
            broadcaster,
            sessions: Arc::new(DashMap::new()),
            stats: Arc::new(ServerStats::default()),
            shutdown: shutdown_tx,
            running: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn dealer(&self) -> &Arc<Dealer> {
        self.handler.dealer()
    }

    pub fn broadcaster(&self) -> &Arc<MetaEventBroadcaster> {
        &self.broadcaster
    }

    /// Number of open sessions, established or not.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Binds the configured address.
    pub async fn bind(&self) -> Result<TcpListener, ServerError> {
        Ok(TcpListener::bind(self.config.bind_addr).await?)
    }

    /// Binds and runs the server until shutdown.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Accepts connections on `listener` until shutdown.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        self.running.store(true, Ordering::SeqCst);

        tracing::info!(
            "Server listening on {} (realm={}, wire={})",
            listener.local_addr()?,
            self.config.router.realm,
            self.config.wire_mode.as_str()
        );

        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            if self.stats.connections_active.load(Ordering::Relaxed)
                                >= self.config.max_connections as u64
                            {
                                tracing::warn!("Connection limit reached, rejecting {}", addr);
                                continue;
                            }

                            self.stats.connections_total.fetch_add(1, Ordering::Relaxed);
                            self.stats.connections_active.fetch_add(1, Ordering::Relaxed);

                            if let Some(ref metrics) = self.config.metrics {
                                metrics.connections_total.inc();
                                metrics.connections_active.inc();
                            }

                            let handler = self.handler.clone();
                            let sessions = self.sessions.clone();
                            let stats = self.stats.clone();
                            let config = self.config.clone();
                            let mut conn_shutdown = self.shutdown.subscribe();

                            tokio::spawn(async move {
                                let result = Self::handle_connection(
                                    stream,
                                    addr,
                                    handler,
                                    sessions,
                                    stats.clone(),
                                    config.clone(),
                                    &mut conn_shutdown,
                                )
                                .await;

                                match result {
                                    Ok(()) | Err(ServerError::ShuttingDown) => {}
                                    Err(e) => {
                                        tracing::debug!("Connection {} error: {}", addr, e);
                                        stats.errors_total.fetch_add(1, Ordering::Relaxed);
                                    }
                                }

                                stats.connections_active.fetch_sub(1, Ordering::Relaxed);

                                if let Some(ref metrics) = config.metrics {
                                    metrics.connections_active.dec();
                                }

                                tracing::info!("Client disconnected: {}", addr);
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("Server shutting down");
                    break;
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Registers a session under a fresh random id.
    fn open_session(
        sessions: &DashMap<u64, Arc<Session>>,
        addr: SocketAddr,
        outbound: mpsc::UnboundedSender<Message>,
    ) -> Arc<Session> {
        let mut rng = rand::thread_rng();
        loop {
            let id = rng.gen_range(1..=MAX_ID);
            if let Entry::Vacant(entry) = sessions.entry(id) {
                let session = Arc::new(Session::new(id, addr, outbound));
                entry.insert(session.clone());
                return session;
            }
        }
    }

    /// Handles a single connection from accept to close.
    async fn handle_connection(
        mut stream: TcpStream,
        addr: SocketAddr,
        handler: Arc<MessageHandler>,
        sessions: Arc<DashMap<u64, Arc<Session>>>,
        stats: Arc<ServerStats>,
        config: ServerConfig,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<(), ServerError> {
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
        let session = Self::open_session(&sessions, addr, outbound_tx);
        tracing::info!("Client connected: {} (session {})", addr, session.id);

        let result = Self::drive_session(
            &mut stream,
            &session,
            &handler,
            &stats,
            &config,
            &mut outbound_rx,
            shutdown,
        )
        .await;

        handler.close_session(&session);
        sessions.remove(&session.id);
        tracing::debug!(
            "[{}] Session {} closed after {} messages ({:?})",
            addr,
            session.id,
            session.message_count(),
            session.age()
        );
        result
    }

    async fn drive_session(
        stream: &mut TcpStream,
        session: &Arc<Session>,
        handler: &MessageHandler,
        stats: &ServerStats,
        config: &ServerConfig,
        outbound: &mut mpsc::UnboundedReceiver<Message>,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<(), ServerError> {
        let addr = session.remote_addr;
        let mut reader: WireReader = config.wire_mode.reader();
        let mut buf = [0u8; READ_BUFFER_SIZE];

        loop {
            tokio::select! {
                biased;

                // Messages routed to this session by the dealer
                Some(message) = outbound.recv() => {
                    Self::write_message(stream, config.wire_mode, &message).await?;
                    continue;
                }

                result = stream.read(&mut buf) => {
                    match result {
                        Ok(0) => {
                            tracing::debug!("[{}] Connection closed by client", addr);
                            return Ok(());
                        }
                        Ok(n) => {
                            tracing::trace!("[{}] Received {} bytes", addr, n);
                            reader.extend(&buf[..n]);
                        }
                        Err(e) => {
                            tracing::debug!("[{}] Read error: {}", addr, e);
                            return Err(ServerError::Io(e));
                        }
                    }
                }

                _ = tokio::time::sleep(config.idle_timeout) => {
                    if session.idle_duration() >= config.idle_timeout {
                        tracing::debug!("[{}] Idle timeout", addr);
                        return Ok(());
                    }
                    continue;
                }

                _ = shutdown.recv() => {
                    tracing::debug!("[{}] Shutdown signal received", addr);
                    if session.state() == SessionState::Established {
                        if let Some(goodbye) = handler.shutdown_message() {
                            Self::write_message(stream, config.wire_mode, &goodbye).await?;
                        }
                    }
                    stream.flush().await?;
                    return Err(ServerError::ShuttingDown);
                }
            }

            loop {
                let raw = match reader.decode_raw() {
                    Ok(Some(raw)) => raw,
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!("[{}] Undecodable input: {}", addr, e);
                        handler.reject_frame(session, &e);
                        Self::flush_outbound(stream, config.wire_mode, outbound).await?;
                        return Err(ServerError::Protocol(e));
                    }
                };

                stats.messages_total.fetch_add(1, Ordering::Relaxed);
                if handler.handle_raw(session, raw) == Disposition::Close {
                    tracing::debug!("[{}] Session closing", addr);
                    Self::flush_outbound(stream, config.wire_mode, outbound).await?;
                    return Ok(());
                }
            }
        }
    }

    async fn write_message(
        stream: &mut TcpStream,
        wire_mode: WireMode,
        message: &Message,
    ) -> Result<(), ServerError> {
        let bytes = wire_mode.encode(message)?;
        tracing::trace!("Writing {} ({} bytes)", message.kind(), bytes.len());
        stream.write_all(&bytes).await?;
        Ok(())
    }

    /// Writes everything already queued for the session.
    async fn flush_outbound(
        stream: &mut TcpStream,
        wire_mode: WireMode,
        outbound: &mut mpsc::UnboundedReceiver<Message>,
    ) -> Result<(), ServerError> {
        while let Ok(message) = outbound.try_recv() {
            Self::write_message(stream, wire_mode, &message).await?;
        }
        stream.flush().await?;
        Ok(())
    }

    /// Subscribes to the shutdown signal.
    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown.subscribe()
    }

    /// Initiates server shutdown.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    /// Returns whether the server is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Returns server statistics.
    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }
}
