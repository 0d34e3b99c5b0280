//! Persistent connection to the local gateway: transport lifecycle, connect handshake,
//! correlated requests, push events, and automatic reconnection.
//!
//! One supervisor task owns the WebSocket. It reads frames, writes queued requests, drives the
//! handshake, and on close drains every pending request before scheduling the next attempt.
//! Callers never touch the socket; `request` queues a frame and waits on its pending entry.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::backoff::ReconnectPolicy;
use super::error::GatewayError;
use super::events::EventBus;
use super::pending::{PendingTable, RequestResult};
use super::protocol::{
    ClientInfo, ConnectAuth, ConnectParams, ErrorShape, Frame, HelloOk, CONNECT_METHOD,
    MAX_PROTOCOL, MIN_PROTOCOL,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type StatusObserver = Arc<dyn Fn(bool) + Send + Sync>;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Lifecycle of a [`GatewayConnection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No transport. Initial state, and where `disconnect` leaves the connection.
    Disconnected,
    /// Opening the transport.
    Connecting,
    /// Transport open, `connect` handshake in flight.
    Authenticating,
    /// Handshake accepted.
    Ready,
    /// Handshake rejected; transport still open but the session is unauthenticated.
    Degraded,
    /// Transport closed; waiting out the reconnect delay.
    Reconnecting,
}

impl ConnectionState {
    /// True while the transport is open.
    pub fn is_open(self) -> bool {
        matches!(
            self,
            ConnectionState::Authenticating | ConnectionState::Ready | ConnectionState::Degraded
        )
    }
}

/// Everything needed to open and authenticate a session.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub url: String,
    pub token: String,
    pub client: ClientInfo,
    pub role: String,
    pub scopes: Vec<String>,
    pub min_protocol: u32,
    pub max_protocol: u32,
    pub reconnect: ReconnectPolicy,
    pub request_timeout: Duration,
    /// When set, requests other than `connect` wait for the handshake and fail on a rejected one.
    pub require_handshake: bool,
}

impl ConnectOptions {
    pub fn new(url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: token.into(),
            client: ClientInfo::default(),
            role: "operator".to_string(),
            scopes: Vec::new(),
            min_protocol: MIN_PROTOCOL,
            max_protocol: MAX_PROTOCOL,
            reconnect: ReconnectPolicy::default(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            require_handshake: true,
        }
    }

    fn connect_params(&self) -> ConnectParams {
        ConnectParams {
            min_protocol: self.min_protocol,
            max_protocol: self.max_protocol,
            client: self.client.clone(),
            role: self.role.clone(),
            scopes: self.scopes.clone(),
            auth: ConnectAuth {
                token: self.token.clone(),
            },
        }
    }
}

/// Builder for [`GatewayConnection`].
pub struct GatewayConnectionBuilder {
    options: ConnectOptions,
    on_status: Option<StatusObserver>,
    events: EventBus,
}

impl GatewayConnectionBuilder {
    pub fn client(mut self, client: ClientInfo) -> Self {
        self.options.client = client;
        self
    }

    pub fn role(mut self, role: impl Into<String>) -> Self {
        self.options.role = role.into();
        self
    }

    pub fn scopes(mut self, scopes: Vec<String>) -> Self {
        self.options.scopes = scopes;
        self
    }

    pub fn protocol_range(mut self, min: u32, max: u32) -> Self {
        self.options.min_protocol = min;
        self.options.max_protocol = max;
        self
    }

    pub fn reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.options.reconnect = policy;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.options.request_timeout = timeout;
        self
    }

    pub fn require_handshake(mut self, require: bool) -> Self {
        self.options.require_handshake = require;
        self
    }

    /// Called with `true` when the transport opens and `false` when it closes.
    pub fn on_status<F>(mut self, observer: F) -> Self
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        self.on_status = Some(Arc::new(observer));
        self
    }

    /// Receive every event. More subscribers can be added later through [`GatewayConnection::events`].
    pub fn on_event<F>(self, handler: F) -> Self
    where
        F: Fn(&str, &Value) + Send + Sync + 'static,
    {
        self.events.subscribe_all(handler).detach();
        self
    }

    pub fn build(self) -> GatewayConnection {
        GatewayConnection::from_options(self.options, self.on_status, self.events)
    }
}

struct Supervisor {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

struct Inner {
    options: ConnectOptions,
    state: watch::Sender<ConnectionState>,
    pending: PendingTable,
    events: EventBus,
    on_status: Option<StatusObserver>,
    /// Queue into the supervisor's socket writer; `None` while the transport is closed.
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    hello: Mutex<Option<HelloOk>>,
    auth_error: Mutex<Option<ErrorShape>>,
    supervisor: Mutex<Option<Supervisor>>,
    /// Set when the current transport reached `Ready`; the supervisor resets its backoff on it.
    reached_ready: AtomicBool,
    /// A client-initiated `authenticate` is in flight.
    reauthenticating: AtomicBool,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Removes a pending entry when the waiting caller gives up (timeout or dropped future).
struct PendingGuard<'a> {
    pending: &'a PendingTable,
    id: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(self.id);
    }
}

/// Clears a flag when dropped.
struct FlagGuard<'a>(&'a AtomicBool);

impl<'a> FlagGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        (!flag.swap(true, Ordering::AcqRel)).then(|| Self(flag))
    }
}

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Shared by every handle clone. The supervisor task only holds `Inner`, so dropping the last
/// handle is what stops it.
struct Owner {
    inner: Arc<Inner>,
}

impl Drop for Owner {
    fn drop(&mut self) {
        if self.inner.stop_supervisor().is_some() {
            log::debug!("last gateway handle dropped; stopping connection");
        }
    }
}

/// Client side of the gateway WebSocket protocol. Cheap to clone; clones share one session.
#[derive(Clone)]
pub struct GatewayConnection {
    inner: Arc<Inner>,
    _owner: Arc<Owner>,
}

impl GatewayConnection {
    pub fn builder(url: impl Into<String>, token: impl Into<String>) -> GatewayConnectionBuilder {
        GatewayConnectionBuilder {
            options: ConnectOptions::new(url, token),
            on_status: None,
            events: EventBus::new(),
        }
    }

    pub fn new(options: ConnectOptions) -> Self {
        Self::from_options(options, None, EventBus::new())
    }

    fn from_options(options: ConnectOptions, on_status: Option<StatusObserver>, events: EventBus) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let inner = Arc::new(Inner {
            options,
            state,
            pending: PendingTable::new(),
            events,
            on_status,
            outbound: Mutex::new(None),
            hello: Mutex::new(None),
            auth_error: Mutex::new(None),
            supervisor: Mutex::new(None),
            reached_ready: AtomicBool::new(false),
            reauthenticating: AtomicBool::new(false),
        });
        Self {
            _owner: Arc::new(Owner {
                inner: Arc::clone(&inner),
            }),
            inner,
        }
    }

    pub fn options(&self) -> &ConnectOptions {
        &self.inner.options
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// Handshake result of the current session, if it was accepted.
    pub fn hello(&self) -> Option<HelloOk> {
        lock(&self.inner.hello).clone()
    }

    /// Number of requests waiting for a response.
    pub fn pending_requests(&self) -> usize {
        self.inner.pending.len()
    }

    /// Start the connection and keep it up, reconnecting after every close until
    /// [`disconnect`](Self::disconnect), [`close`](Self::close), or until every handle is dropped.
    /// Does nothing if already running. Must be called inside a Tokio runtime.
    pub fn connect(&self) {
        let mut supervisor = lock(&self.inner.supervisor);
        if supervisor.as_ref().is_some_and(|s| !s.handle.is_finished()) {
            log::debug!("gateway connection already running");
            return;
        }
        let (stop, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(supervise(Arc::clone(&self.inner), stop_rx));
        *supervisor = Some(Supervisor { stop, handle });
    }

    /// Close the transport, fail pending requests, and stop reconnecting.
    pub async fn disconnect(&self) {
        let Some(supervisor) = self.inner.stop_supervisor() else {
            return;
        };
        if let Err(e) = supervisor.handle.await {
            if e.is_panic() {
                log::warn!("gateway supervisor panicked: {}", e);
            }
        }
        // Covers a supervisor that died without cleaning up.
        self.inner.on_transport_closed(false);
        log::info!("gateway connection closed by client");
    }

    /// Signal the connection to stop without waiting for the transport to close. Pending
    /// requests fail with `ConnectionLost` once the supervisor winds down.
    pub fn close(&self) {
        if self.inner.stop_supervisor().is_some() {
            log::info!("gateway connection closing");
        }
    }

    /// Wait until the handshake has completed. Fails with `Unauthenticated` if it was rejected.
    pub async fn wait_ready(&self, timeout: Duration) -> Result<(), GatewayError> {
        let deadline = Instant::now() + timeout;
        let mut states = self.inner.state.subscribe();
        loop {
            let state = *states.borrow_and_update();
            match state {
                ConnectionState::Ready => return Ok(()),
                ConnectionState::Degraded => return Err(self.inner.unauthenticated()),
                _ => {}
            }
            match tokio::time::timeout_at(deadline, states.changed()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => return Err(GatewayError::NotConnected),
                Err(_) => {
                    return Err(GatewayError::Timeout {
                        method: CONNECT_METHOD.to_string(),
                        timeout,
                    })
                }
            }
        }
    }

    /// Send `method` with `params` and wait for its response, up to the configured request timeout.
    pub async fn request(&self, method: &str, params: Value) -> RequestResult {
        self.request_with_timeout(method, params, self.inner.options.request_timeout)
            .await
    }

    /// Like [`request`](Self::request) with an explicit deadline.
    pub async fn request_with_timeout(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> RequestResult {
        if method.trim().is_empty() {
            return Err(GatewayError::InvalidRequest("method must not be empty".to_string()));
        }
        let deadline = Instant::now() + timeout;
        if self.inner.options.require_handshake && method != CONNECT_METHOD {
            self.inner.await_authenticated(method, deadline, timeout).await?;
        } else if !self.state().is_open() {
            return Err(GatewayError::NotConnected);
        }
        self.inner.send_request(method, params, deadline, timeout).await
    }

    /// Run the `connect` handshake again on the open transport (e.g. after a rejection).
    /// Fails with `InvalidRequest` while another handshake is still in flight.
    pub async fn authenticate(&self) -> Result<HelloOk, GatewayError> {
        match self.state() {
            ConnectionState::Ready | ConnectionState::Degraded => {}
            ConnectionState::Authenticating => return Err(handshake_in_flight()),
            _ => return Err(GatewayError::NotConnected),
        }
        let Some(_flight) = FlagGuard::acquire(&self.inner.reauthenticating) else {
            return Err(handshake_in_flight());
        };
        let result = self.inner.handshake().await;
        self.inner.finish_handshake(result)
    }
}

fn handshake_in_flight() -> GatewayError {
    GatewayError::InvalidRequest("connect handshake already in flight".to_string())
}

impl Inner {
    /// Take the running supervisor, if any, and tell it to stop.
    fn stop_supervisor(&self) -> Option<Supervisor> {
        let supervisor = lock(&self.supervisor).take()?;
        let _ = supervisor.stop.send(true);
        Some(supervisor)
    }

    fn set_state(&self, next: ConnectionState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            log::debug!("gateway state {:?} -> {:?}", prev, next);
        }
    }

    fn notify_status(&self, connected: bool) {
        if let Some(observer) = &self.on_status {
            observer(connected);
        }
    }

    fn unauthenticated(&self) -> GatewayError {
        let shape = lock(&self.auth_error)
            .clone()
            .unwrap_or_else(|| ErrorShape::new("UNAUTHORIZED", "connect handshake rejected"));
        GatewayError::Unauthenticated(shape)
    }

    async fn await_authenticated(
        &self,
        method: &str,
        deadline: Instant,
        timeout: Duration,
    ) -> Result<(), GatewayError> {
        let mut states = self.state.subscribe();
        loop {
            let state = *states.borrow_and_update();
            match state {
                ConnectionState::Ready => return Ok(()),
                ConnectionState::Degraded => return Err(self.unauthenticated()),
                ConnectionState::Authenticating => {}
                _ => return Err(GatewayError::NotConnected),
            }
            match tokio::time::timeout_at(deadline, states.changed()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => return Err(GatewayError::NotConnected),
                Err(_) => {
                    return Err(GatewayError::Timeout {
                        method: method.to_string(),
                        timeout,
                    })
                }
            }
        }
    }

    async fn send_request(
        &self,
        method: &str,
        params: Value,
        deadline: Instant,
        timeout: Duration,
    ) -> RequestResult {
        let id = uuid::Uuid::new_v4().to_string();
        let text = Frame::request(&id, method, params)
            .encode()
            .map_err(|e| GatewayError::Encode(e.to_string()))?;
        let outbound = lock(&self.outbound)
            .clone()
            .ok_or(GatewayError::NotConnected)?;

        let rx = self.pending.register(&id)?;
        let _guard = PendingGuard {
            pending: &self.pending,
            id: &id,
        };
        if outbound.send(Message::Text(text)).is_err() {
            return Err(GatewayError::NotConnected);
        }
        log::debug!("gateway -> req {} ({})", method, id);

        match tokio::time::timeout_at(deadline, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(GatewayError::ConnectionLost),
            Err(_) => {
                log::warn!("gateway request {} ({}) timed out after {:?}", method, id, timeout);
                Err(GatewayError::Timeout {
                    method: method.to_string(),
                    timeout,
                })
            }
        }
    }

    async fn handshake(&self) -> RequestResult {
        let params = match serde_json::to_value(self.options.connect_params()) {
            Ok(v) => v,
            Err(e) => return Err(GatewayError::Encode(e.to_string())),
        };
        let timeout = self.options.request_timeout;
        self.send_request(CONNECT_METHOD, params, Instant::now() + timeout, timeout)
            .await
    }

    /// Apply a handshake outcome. Ignored once the transport has closed.
    fn finish_handshake(&self, result: RequestResult) -> Result<HelloOk, GatewayError> {
        let payload = match result {
            Ok(payload) => payload,
            Err(GatewayError::ConnectionLost) | Err(GatewayError::NotConnected) => {
                return Err(GatewayError::ConnectionLost)
            }
            Err(e) => {
                let shape = match &e {
                    GatewayError::Server(shape) => shape.clone(),
                    GatewayError::Timeout { .. } => ErrorShape::new("TIMEOUT", e.to_string()),
                    other => ErrorShape::new("UNAVAILABLE", other.to_string()),
                };
                log::warn!("gateway handshake rejected: {}", shape);
                *lock(&self.auth_error) = Some(shape.clone());
                self.state.send_if_modified(|s| {
                    let open = s.is_open();
                    if open {
                        *s = ConnectionState::Degraded;
                    }
                    open
                });
                return Err(GatewayError::Unauthenticated(shape));
            }
        };

        let hello: HelloOk = serde_json::from_value(payload).unwrap_or_else(|e| {
            log::debug!("gateway hello payload not recognised: {}", e);
            HelloOk::default()
        });
        *lock(&self.hello) = Some(hello.clone());
        lock(&self.auth_error).take();
        let applied = self.state.send_if_modified(|s| {
            let open = s.is_open();
            if open {
                *s = ConnectionState::Ready;
            }
            open
        });
        if !applied {
            return Err(GatewayError::ConnectionLost);
        }
        self.reached_ready.store(true, Ordering::Release);
        log::info!(
            "gateway session ready (protocol {})",
            hello
                .protocol
                .map(|p| p.to_string())
                .unwrap_or_else(|| "unknown".to_string())
        );
        Ok(hello)
    }

    fn handle_text(&self, text: &str, last_seq: &mut Option<u64>) {
        match Frame::decode(text) {
            Ok(Frame::Response(res)) => {
                let id = res.id.clone();
                if self.pending.complete(res) {
                    log::debug!("gateway <- res {}", id);
                } else {
                    log::debug!("gateway <- res {} matches no pending request, dropped", id);
                }
            }
            Ok(Frame::Event(ev)) => {
                if let Some(seq) = ev.seq {
                    if let Some(next) = last_seq.and_then(|last| last.checked_add(1)) {
                        if seq > next {
                            log::warn!("gateway event gap: expected seq {}, got {}", next, seq);
                        }
                    }
                    *last_seq = Some(seq);
                }
                let payload = ev.payload.unwrap_or(Value::Null);
                self.events.publish(&ev.event, &payload);
            }
            Ok(Frame::Request(req)) => {
                log::debug!("gateway <- req {} ({}) ignored", req.method, req.id);
            }
            Err(e) => log::debug!("gateway <- undecodable frame dropped: {}", e),
        }
    }

    /// Transport is gone: stop accepting sends, fail everything outstanding, report the close.
    fn on_transport_closed(&self, was_open: bool) {
        lock(&self.outbound).take();
        lock(&self.hello).take();
        let failed = self.pending.drain(GatewayError::ConnectionLost);
        if failed > 0 {
            log::info!("gateway closed with {} pending request(s); failing them", failed);
        }
        self.set_state(ConnectionState::Disconnected);
        if was_open {
            self.notify_status(false);
        }
    }
}

/// Connection loop: open, serve, close, wait, repeat until stopped.
async fn supervise(inner: Arc<Inner>, mut stop: watch::Receiver<bool>) {
    let mut attempt: u32 = 0;
    loop {
        inner.set_state(ConnectionState::Connecting);
        let open = tokio::time::timeout(
            inner.options.request_timeout,
            tokio_tungstenite::connect_async(inner.options.url.as_str()),
        );
        let opened = tokio::select! {
            res = open => res,
            _ = stop.changed() => break,
        };
        match opened {
            Ok(Ok((ws, _))) => {
                log::info!("gateway transport open: {}", inner.options.url);
                inner.reached_ready.store(false, Ordering::Release);
                let stopped = run_session(&inner, ws, &mut stop).await;
                inner.on_transport_closed(true);
                if inner.reached_ready.load(Ordering::Acquire) {
                    attempt = 0;
                }
                if stopped {
                    break;
                }
            }
            Ok(Err(e)) => {
                log::warn!("gateway connect to {} failed: {}", inner.options.url, e);
                inner.set_state(ConnectionState::Disconnected);
            }
            Err(_) => {
                log::warn!(
                    "gateway connect to {} timed out after {:?}",
                    inner.options.url,
                    inner.options.request_timeout
                );
                inner.set_state(ConnectionState::Disconnected);
            }
        }
        if *stop.borrow() {
            break;
        }

        let delay = inner.options.reconnect.delay(attempt);
        attempt = attempt.saturating_add(1);
        inner.set_state(ConnectionState::Reconnecting);
        log::info!("gateway reconnecting in {:?} (attempt {})", delay, attempt);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = stop.changed() => break,
        }
    }
    inner.set_state(ConnectionState::Disconnected);
}

/// Serve one open transport until it closes or the client stops. Returns true when stopped.
async fn run_session(inner: &Inner, ws: WsStream, stop: &mut watch::Receiver<bool>) -> bool {
    let (mut sink, mut stream) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    *lock(&inner.outbound) = Some(tx);
    lock(&inner.auth_error).take();
    inner.set_state(ConnectionState::Authenticating);
    inner.notify_status(true);

    let handshake = inner.handshake();
    tokio::pin!(handshake);
    let mut handshake_done = false;
    let mut stopped = false;
    let mut last_seq = None;

    loop {
        tokio::select! {
            _ = stop.changed() => {
                stopped = true;
                break;
            }
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => inner.handle_text(&text, &mut last_seq),
                Some(Ok(Message::Close(frame))) => {
                    log::info!("gateway closed the connection: {:?}", frame);
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    log::warn!("gateway transport error: {}", e);
                    break;
                }
                None => {
                    log::info!("gateway transport ended");
                    break;
                }
            },
            Some(msg) = rx.recv() => {
                if let Err(e) = sink.send(msg).await {
                    log::warn!("gateway send failed: {}", e);
                    break;
                }
            }
            result = &mut handshake, if !handshake_done => {
                handshake_done = true;
                let _ = inner.finish_handshake(result);
            }
        }
    }

    // Refuse new sends before the table is drained.
    lock(&inner.outbound).take();
    drop(rx);
    if stopped {
        let _ = sink.close().await;
    }
    stopped
}
