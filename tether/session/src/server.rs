//! Server orchestrator: owns the listener, shared state, and lifecycle.

use crate::correlator::Correlator;
use crate::error::{CallError, SendError, StartError};
use crate::events::{DisconnectReason, Observers, ReplyHandler, ServerEventHandler};
use crate::registry::Registry;
use crate::session::{run_session, SessionCommand};
use crate::stats::ServerStats;
use crate::transport::{listen_tcp, IoStream, SecurityConfig};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tether_wire::{encode_envelope, Envelope, DEFAULT_MAX_FRAME_SIZE};
use tokio::sync::{oneshot, watch};
use tracing::{info, warn};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to listen on.
    pub bind_addr: SocketAddr,
    /// Transport security for accepted connections.
    pub security: SecurityConfig,
    /// When set, peers must present this key before any other traffic.
    pub preshared_key: Option<String>,
    /// Close sessions with no inbound traffic for this long. `None`
    /// disables the idle check.
    pub idle_timeout: Option<Duration>,
    /// How long a peer gets to answer the preshared-key challenge.
    pub auth_timeout: Duration,
    /// Upper bound on a single wire frame, inbound and outbound.
    pub max_frame_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 9000)),
            security: SecurityConfig::None,
            preshared_key: None,
            idle_timeout: None,
            auth_timeout: Duration::from_secs(10),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

/// State shared between the server handle and every session task.
pub(crate) struct Shared {
    pub(crate) registry: Registry,
    pub(crate) correlator: Correlator,
    pub(crate) stats: ServerStats,
    pub(crate) observers: Observers,
    pub(crate) reply_handler: RwLock<Option<Arc<dyn ReplyHandler>>>,
    pub(crate) idle_timeout: Option<Duration>,
    pub(crate) auth_timeout: Duration,
    pub(crate) max_frame_size: usize,
    psk: RwLock<Option<String>>,
}

impl Shared {
    pub(crate) fn new(config: &ServerConfig) -> Self {
        Self {
            registry: Registry::new(),
            correlator: Correlator::new(),
            stats: ServerStats::new(),
            observers: Observers::new(),
            reply_handler: RwLock::new(None),
            idle_timeout: config.idle_timeout,
            auth_timeout: config.auth_timeout,
            max_frame_size: config.max_frame_size,
            psk: RwLock::new(config.preshared_key.clone()),
        }
    }

    /// Current preshared key, if one is required.
    pub(crate) fn preshared_key(&self) -> Option<String> {
        self.psk.read().ok().and_then(|guard| guard.clone())
    }
}

/// A messaging server handle.
///
/// Cheap to clone by sharing; all methods take `&self` and may be called
/// from any task.
pub struct Server {
    config: ServerConfig,
    shared: Arc<Shared>,
    shutdown_tx: watch::Sender<bool>,
    local_addr: Mutex<Option<SocketAddr>>,
    started: AtomicBool,
    disposed: AtomicBool,
}

impl Server {
    /// Build a server from configuration. Nothing listens until
    /// [`Server::start`].
    pub fn new(config: ServerConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let shared = Arc::new(Shared::new(&config));
        Self {
            config,
            shared,
            shutdown_tx,
            local_addr: Mutex::new(None),
            started: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
        }
    }

    /// Register an observer for connection and message events.
    pub fn register_observer(&self, observer: Arc<dyn ServerEventHandler>) {
        self.shared.observers.register(observer);
    }

    /// Install the handler that answers inbound sync requests.
    pub fn set_reply_handler(&self, handler: Arc<dyn ReplyHandler>) {
        if let Ok(mut slot) = self.shared.reply_handler.write() {
            *slot = Some(handler);
        }
    }

    /// Replace (or clear) the preshared key. Applies to handshakes that
    /// begin after the call; established sessions are unaffected.
    pub fn set_preshared_key(&self, key: Option<String>) {
        if let Ok(mut slot) = self.shared.psk.write() {
            *slot = key;
        }
    }

    /// Bind the listener and spawn the accept loop.
    ///
    /// Certificate problems are reported before any bind is attempted, so
    /// a TLS misconfiguration never half-starts the server.
    pub async fn start(&self) -> Result<(), StartError> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(StartError::Config("server already disposed".into()));
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(StartError::Config("server already started".into()));
        }

        let acceptor = self.build_acceptor()?;

        let listener = listen_tcp(self.config.bind_addr)
            .await
            .map_err(|source| StartError::Bind {
                addr: self.config.bind_addr,
                source,
            })?;
        let local_addr = listener.local_addr().map_err(|source| StartError::Bind {
            addr: self.config.bind_addr,
            source,
        })?;
        if let Ok(mut slot) = self.local_addr.lock() {
            *slot = Some(local_addr);
        }
        info!(%local_addr, security = ?self.config.security, "server listening");

        let shared = self.shared.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        info!("accept loop stopping");
                        break;
                    }
                    accepted = listener.accept() => match accepted {
                        Ok((socket, addr)) => {
                            let _ = socket.set_nodelay(true);
                            let shared = shared.clone();
                            let acceptor = acceptor.clone();
                            tokio::spawn(async move {
                                let peer = addr.to_string();
                                let stream = match secure_stream(socket, acceptor).await {
                                    Ok(stream) => stream,
                                    Err(err) => {
                                        warn!(%peer, "handshake rejected: {err:#}");
                                        return;
                                    }
                                };
                                run_session(stream, peer, shared).await;
                            });
                        }
                        Err(err) => {
                            warn!("accept failed: {err}");
                            tokio::time::sleep(Duration::from_millis(50)).await;
                        }
                    }
                }
            }
        });

        Ok(())
    }

    #[cfg(feature = "tls")]
    fn build_acceptor(&self) -> Result<Option<Arc<crate::transport::tls::TlsServer>>, StartError> {
        match &self.config.security {
            SecurityConfig::None => Ok(None),
            SecurityConfig::Tls(settings) => {
                let tls_config = crate::transport::tls::make_server_config(settings)
                    .map_err(|err| StartError::Certificate(format!("{err:#}")))?;
                Ok(Some(Arc::new(crate::transport::tls::tls_acceptor(
                    tls_config,
                ))))
            }
        }
    }

    #[cfg(not(feature = "tls"))]
    fn build_acceptor(&self) -> Result<Option<()>, StartError> {
        match &self.config.security {
            SecurityConfig::None => Ok(None),
            SecurityConfig::Tls(_) => Err(StartError::Config(
                "TLS requested but this build has no TLS support".into(),
            )),
        }
    }

    /// Address the listener actually bound, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.lock().ok().and_then(|slot| *slot)
    }

    /// Peer addresses of all connected clients.
    pub async fn list_clients(&self) -> Vec<String> {
        self.shared.registry.list().await
    }

    /// Whether `peer` holds a live session.
    pub async fn is_client_connected(&self, peer: &str) -> bool {
        self.shared.registry.contains(peer).await
    }

    /// Fire-and-forget send.
    ///
    /// Returns once the frame has been written to the peer's socket (or the
    /// write failed). Delivery to the remote application is not implied.
    pub async fn send(&self, peer: &str, envelope: Envelope) -> Result<bool, SendError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.enqueue(peer, envelope, Some(done_tx)).await?;
        Ok(done_rx.await.unwrap_or(false))
    }

    /// Queue a send and return a completion signal without waiting for it.
    ///
    /// The receiver resolves `true` once the frame is on the wire, `false`
    /// (or an error) if the session died first.
    pub async fn send_async(
        &self,
        peer: &str,
        envelope: Envelope,
    ) -> Result<oneshot::Receiver<bool>, SendError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.enqueue(peer, envelope, Some(done_tx)).await?;
        Ok(done_rx)
    }

    /// Synchronous request: send a sync-request envelope and wait up to
    /// `timeout` for the correlated reply.
    pub async fn send_and_wait(
        &self,
        peer: &str,
        envelope: Envelope,
        timeout: Duration,
    ) -> Result<Envelope, CallError> {
        // Waiter goes in before the frame goes out, so the reply can never
        // beat its slot.
        let (corr_id, reply_rx) = self.shared.correlator.register(peer);
        let request = envelope.into_sync_request(corr_id, timeout);

        if let Err(err) = self.enqueue(peer, request, None).await {
            self.shared.correlator.abandon(corr_id);
            return Err(err.into());
        }

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(CallError::PeerDisconnected),
            Err(_) => {
                self.shared.correlator.abandon(corr_id);
                Err(CallError::Timeout)
            }
        }
    }

    /// Close one client's session.
    pub async fn disconnect_client(&self, peer: &str) -> bool {
        match self.shared.registry.lookup(peer).await {
            Some(handle) => handle
                .cmd_tx
                .send(SessionCommand::Close {
                    reason: DisconnectReason::Removed,
                })
                .await
                .is_ok(),
            None => false,
        }
    }

    /// Traffic counters.
    pub fn stats(&self) -> &ServerStats {
        &self.shared.stats
    }

    /// Stop accepting, close every session, and wait for teardown.
    ///
    /// Idempotent: only the first call does any work.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("disposing server");
        let _ = self.shutdown_tx.send(true);

        for handle in self.shared.registry.handles().await {
            let _ = handle
                .cmd_tx
                .send(SessionCommand::Close {
                    reason: DisconnectReason::Shutdown,
                })
                .await;
        }
        self.shared.correlator.fail_all();

        // Sessions unregister themselves as their tasks wind down.
        let drained = tokio::time::timeout(Duration::from_secs(5), async {
            while !self.shared.registry.is_empty().await {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        if drained.is_err() {
            warn!("dispose timed out waiting for sessions to exit");
        }
        info!("server disposed");
    }

    async fn enqueue(
        &self,
        peer: &str,
        envelope: Envelope,
        done: Option<oneshot::Sender<bool>>,
    ) -> Result<(), SendError> {
        let handle = self
            .shared
            .registry
            .lookup(peer)
            .await
            .ok_or_else(|| SendError::UnknownClient(peer.to_string()))?;
        let frame = encode_envelope(&envelope, self.shared.max_frame_size)?;
        handle
            .cmd_tx
            .send(SessionCommand::Send { frame, done })
            .await
            .map_err(|_| SendError::SessionClosed)
    }
}

#[cfg(feature = "tls")]
async fn secure_stream(
    socket: tokio::net::TcpStream,
    acceptor: Option<Arc<crate::transport::tls::TlsServer>>,
) -> anyhow::Result<IoStream> {
    match acceptor {
        Some(acceptor) => crate::transport::tls::accept_tls(&acceptor, socket).await,
        None => Ok(IoStream::Plain(socket)),
    }
}

#[cfg(not(feature = "tls"))]
async fn secure_stream(
    socket: tokio::net::TcpStream,
    _acceptor: Option<()>,
) -> anyhow::Result<IoStream> {
    Ok(IoStream::Plain(socket))
}
