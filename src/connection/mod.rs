//! `ConnectionFactory`: negotiates transport + AMQP + SASL, opens the
//! connection, attaches the CBS sub-link (spec.md §4.1).

pub mod fault_tolerant;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fe2o3_amqp::connection::ConnectionHandle as RawConnectionHandle;
use fe2o3_amqp::sasl_profile::SaslProfile;
use fe2o3_amqp::{Connection, Session};
use fe2o3_amqp_cbs::client::CbsClient;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, instrument};

use crate::deadline::Deadline;
use crate::endpoint::{ProxySettings, ServiceEndpoint, TransportType};
use crate::error::{Result, ScopeError};
use crate::properties::ClientLibraryProperties;

use self::fault_tolerant::{ConnectionOpener, FaultTolerantHandle};

/// SASL mechanism name advertised for the anonymous handshake Event
/// Hubs/Service Bus style endpoints expect before CBS takes over
/// authorization (spec.md §4.1 step 1, §6).
pub const CBS_SASL_HANDLER_NAME: &str = "MSSBCBS";

const DEFAULT_IDLE_TIMEOUT_MS: u32 = 60_000;

/// How often the close-watcher task yields its lock on the raw connection
/// handle so `begin_session` can make progress between `on_close` polls.
const CLOSE_WATCH_YIELD_INTERVAL: Duration = Duration::from_millis(200);

/// A live AMQP connection plus its dedicated CBS sub-link.
///
/// Cloning shares the same underlying connection and CBS client; both are
/// internally synchronized since `fe2o3-amqp`'s `Session::begin` and
/// `CbsClient::put_token` need exclusive access to their respective handles.
///
/// `inner` is an `Option` rather than a bare `RawConnectionHandle` because
/// the teacher's `ConnectionHandle::on_close` (and `close`/`close_with_error`)
/// panics if called again on a handle it has already resolved on (it awaits
/// the event loop's `JoinHandle` to completion, which can only be polled to
/// `Ready` once) — taking the handle out on first resolution makes "was this
/// handle's close already observed" a type-level fact instead of a second
/// flag to keep in sync with `faulted`.
#[derive(Clone)]
pub struct AmqpConnectionHandle {
    inner: Arc<AsyncMutex<Option<RawConnectionHandle<()>>>>,
    cbs: Arc<AsyncMutex<CbsClient>>,
    faulted: Arc<AtomicBool>,
}

impl std::fmt::Debug for AmqpConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmqpConnectionHandle")
            .field("faulted", &self.faulted.load(Ordering::SeqCst))
            .finish()
    }
}

impl AmqpConnectionHandle {
    /// Begins a new session on the shared connection, bounded by `timeout`
    /// (spec.md §3: "Session-level timeout = 30 s"). One session per link.
    pub async fn begin_session(&self, timeout: Duration) -> Result<Session> {
        let mut guard = self.inner.lock().await;
        let Some(conn) = guard.as_mut() else {
            self.faulted.store(true, Ordering::SeqCst);
            return Err(ScopeError::transport(ConnectionFaulted));
        };
        if conn.is_closed() {
            self.faulted.store(true, Ordering::SeqCst);
            return Err(ScopeError::transport(ConnectionFaulted));
        }
        tokio::time::timeout(timeout, Session::begin(conn))
            .await
            .map_err(|_| ScopeError::Timeout)?
            .map_err(|e| ScopeError::transport(BeginSessionFailed(e.to_string())))
    }

    pub fn cbs(&self) -> Arc<AsyncMutex<CbsClient>> {
        self.cbs.clone()
    }

    /// Spawns the background task that owns this connection's one-shot close
    /// notification (spec.md §4.1 step 6, §9 "event-driven close chains").
    ///
    /// `ConnectionHandle::on_close` requires `&mut self` for as long as the
    /// connection stays open, which would starve `begin_session` if held
    /// continuously, so the task time-slices: it calls `on_close` against a
    /// short timer via `select!`, releasing the lock every
    /// [`CLOSE_WATCH_YIELD_INTERVAL`] so session creation gets a turn. The
    /// moment `on_close` actually resolves, `faulted` flips and `on_fault`
    /// fires immediately — not on the next caller's `get_or_create`.
    fn spawn_close_watcher(&self, on_fault: Option<Arc<dyn Fn() + Send + Sync>>) {
        let inner = self.inner.clone();
        let faulted = self.faulted.clone();
        tokio::spawn(async move {
            loop {
                if faulted.load(Ordering::SeqCst) {
                    return;
                }
                let mut guard = inner.lock().await;
                let Some(conn) = guard.as_mut() else {
                    return;
                };
                tokio::select! {
                    biased;
                    result = conn.on_close() => {
                        *guard = None;
                        drop(guard);
                        if faulted.swap(true, Ordering::SeqCst) {
                            // Already handled by `dispose()` racing us; don't
                            // double-fire the hook.
                            return;
                        }
                        if let Err(e) = result {
                            debug!(error = %e, "connection closed with error");
                        }
                        if let Some(hook) = &on_fault {
                            hook();
                        }
                        return;
                    }
                    _ = tokio::time::sleep(CLOSE_WATCH_YIELD_INTERVAL) => {
                        drop(guard);
                    }
                }
            }
        });
    }
}

#[async_trait]
impl FaultTolerantHandle for AmqpConnectionHandle {
    fn is_faulted(&self) -> bool {
        if self.faulted.load(Ordering::SeqCst) {
            return true;
        }
        // Cheap, non-blocking backstop for the window between an organic
        // close and the watcher task's next lock acquisition; the watcher
        // (spawned in `ConnectionFactory::open`) is the primary, immediate
        // trigger for `on_fault`.
        match self.inner.try_lock() {
            Ok(guard) => guard.as_ref().map(|conn| conn.is_closed()).unwrap_or(true),
            Err(_) => false,
        }
    }

    async fn dispose(&self) {
        self.faulted.store(true, Ordering::SeqCst);
        {
            let mut cbs = self.cbs.lock().await;
            let _ = cbs.close().await;
        }
        let mut guard = self.inner.lock().await;
        if let Some(mut conn) = guard.take() {
            let _ = conn.close().await;
        }
    }
}

#[derive(Debug)]
struct ConnectionFaulted;
impl std::fmt::Display for ConnectionFaulted {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("connection is closed")
    }
}
impl std::error::Error for ConnectionFaulted {}

#[derive(Debug)]
struct BeginSessionFailed(String);
impl std::fmt::Display for BeginSessionFailed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "failed to begin session: {}", self.0)
    }
}
impl std::error::Error for BeginSessionFailed {}

/// Negotiates transport settings, opens the connection, and attaches the
/// CBS sub-link (spec.md §4.1).
#[derive(Clone)]
pub struct ConnectionFactory {
    pub endpoint: ServiceEndpoint,
    pub transport: TransportType,
    pub proxy: Option<ProxySettings>,
    pub scope_id: String,
    /// Handed to [`AmqpConnectionHandle::spawn_close_watcher`] the moment a
    /// connection opens, so the `CloseCoordinator` reacts to a dropped
    /// connection immediately rather than waiting for a subsequent
    /// `get_or_create` call to notice it (spec.md §4.1 step 6).
    pub on_fault: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl fmt::Debug for ConnectionFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionFactory")
            .field("endpoint", &self.endpoint)
            .field("transport", &self.transport)
            .field("proxy", &self.proxy)
            .field("scope_id", &self.scope_id)
            .field("on_fault", &self.on_fault.is_some())
            .finish()
    }
}

#[async_trait]
impl ConnectionOpener for ConnectionFactory {
    type Handle = AmqpConnectionHandle;

    #[instrument(skip(self), fields(scope_id = %self.scope_id))]
    async fn open(&self, timeout: Duration) -> Result<AmqpConnectionHandle> {
        self.transport.validate()?;
        let deadline = Deadline::starting_now(timeout);

        let raw_connection = match self.transport {
            TransportType::TcpTls => self.open_tcp_tls(&deadline).await?,
            TransportType::WebSockets => self.open_websocket(&deadline).await?,
        };
        let mut raw_connection = raw_connection;

        deadline.check()?;
        let mut cbs_session = Session::begin(&mut raw_connection)
            .await
            .map_err(|e| ScopeError::transport(BeginSessionFailed(e.to_string())))?;
        let cbs_client = CbsClient::attach(&mut cbs_session)
            .await
            .map_err(|e| ScopeError::authorization(e.to_string()))?;
        debug!("CBS link attached");

        let handle = AmqpConnectionHandle {
            inner: Arc::new(AsyncMutex::new(Some(raw_connection))),
            cbs: Arc::new(AsyncMutex::new(cbs_client)),
            faulted: Arc::new(AtomicBool::new(false)),
        };
        handle.spawn_close_watcher(self.on_fault.clone());
        Ok(handle)
    }
}

impl ConnectionFactory {
    async fn open_tcp_tls(&self, deadline: &Deadline) -> Result<RawConnectionHandle<()>> {
        let url = format!("amqps://{}:{}", self.endpoint.host(), self.endpoint.tcp_port());
        let _ = deadline.check()?;
        Connection::builder()
            .container_id(self.scope_id.clone())
            .hostname(self.endpoint.host())
            .idle_time_out(DEFAULT_IDLE_TIMEOUT_MS)
            .properties(ClientLibraryProperties::current().into_fields())
            .sasl_profile(SaslProfile::Anonymous)
            .alt_tls_establishment(true)
            .open(url.as_str())
            .await
            .map_err(|e| ScopeError::transport(OpenFailed(e.to_string())))
    }

    /// Opens the AMQP connection over a `wss://` WebSocket transport.
    ///
    /// Proxy negotiation itself is out of this crate's scope (spec.md §1) —
    /// `fe2o3-amqp-ws`'s connector is handed the proxy URL when one was
    /// configured and is solely responsible for the CONNECT handshake.
    async fn open_websocket(&self, deadline: &Deadline) -> Result<RawConnectionHandle<()>> {
        let ws_url = self.endpoint.websocket_url()?;
        let _ = deadline.check()?;

        let mut builder = fe2o3_amqp_ws::Builder::new();
        if let Some(proxy) = &self.proxy {
            builder = builder.proxy(proxy.url.clone());
        }
        let ws_stream = builder
            .connect(ws_url.as_str())
            .await
            .map_err(|e| ScopeError::transport(OpenFailed(e.to_string())))?;

        Connection::builder()
            .container_id(self.scope_id.clone())
            .hostname(self.endpoint.host())
            .idle_time_out(DEFAULT_IDLE_TIMEOUT_MS)
            .properties(ClientLibraryProperties::current().into_fields())
            .sasl_profile(SaslProfile::Anonymous)
            .open_with_stream(ws_stream)
            .await
            .map_err(|e| ScopeError::transport(OpenFailed(e.to_string())))
    }
}

#[derive(Debug)]
struct OpenFailed(String);
impl std::fmt::Display for OpenFailed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "connection open failed: {}", self.0)
    }
}
impl std::error::Error for OpenFailed {}
