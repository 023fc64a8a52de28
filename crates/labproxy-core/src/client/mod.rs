//! Client proxy for a remote device.
//!
//! `ClientProxy` connects to a `Server`, performs the handshake, keeps the
//! session alive with a background heartbeat, and turns calls into request
//! frames. Calls to non-blocking capabilities are followed by `^result` polls
//! until the task finishes. Transport failures trigger a bounded number of
//! reconnections. After a timeout the old session is resumed with `^ping`
//! when the server still knows it; otherwise a fresh handshake is made. A request is sent again only
//! if it never reached the wire; once written, its failure is returned to the
//! caller, so device code runs at most once per call.
//!
//! # Thread Safety
//!
//! The connection sits behind a tokio `Mutex` shared by the call path and the
//! heartbeat, so at most one request is outstanding per proxy.

mod typed;

use serde_json::{Map, Value};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::cancel::CancellationToken;
use crate::config::ClientOptions;
use crate::error::{ProxyError, Result};
use crate::protocol::{
    admin_kwargs, read_frame, write_frame, ControlCommand, Reply, Request, SessionId,
    HANDSHAKE_SESSION,
};
use crate::registry::{CapabilityKind, CapabilityTable};

/// How far a failed roundtrip got.
enum Failure {
    /// Nothing was written; the request can be sent again.
    Unsent(ProxyError),
    /// The server may have received and run the request.
    Sent(ProxyError),
}

impl Failure {
    fn error(&self) -> &ProxyError {
        match self {
            Failure::Unsent(e) | Failure::Sent(e) => e,
        }
    }
}

impl From<Failure> for ProxyError {
    fn from(failure: Failure) -> Self {
        match failure {
            Failure::Unsent(e) | Failure::Sent(e) => e,
        }
    }
}

/// One TCP connection to the server.
struct Connection {
    stream: TcpStream,
    max_message_size: usize,
}

impl Connection {
    async fn open(address: &str, timeout: Duration, max_message_size: usize) -> Result<Self> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(address))
            .await
            .map_err(|_| ProxyError::Timeout(timeout))?
            .map_err(|e| ProxyError::Transport {
                message: format!("could not connect to {}: {}", address, e),
            })?;
        stream.set_nodelay(true)?;
        Ok(Self {
            stream,
            max_message_size,
        })
    }

    /// Fail if the server already closed this connection. Between roundtrips
    /// nothing may be waiting to be read.
    fn check_open(&self) -> Result<()> {
        let mut probe = [0u8; 1];
        match self.stream.try_read(&mut probe) {
            Ok(0) => Err(ProxyError::Transport {
                message: "connection closed by server".to_string(),
            }),
            Ok(_) => Err(ProxyError::Transport {
                message: "unsolicited data from server".to_string(),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Send one request and read its reply.
    async fn roundtrip(&mut self, request: &Request, timeout: Duration) -> std::result::Result<Reply, Failure> {
        let request_bytes = serde_json::to_vec(request).map_err(|e| Failure::Unsent(e.into()))?;
        self.check_open().map_err(Failure::Unsent)?;

        let started = Instant::now();
        let max_size = self.max_message_size;
        let (mut reader, mut writer) = self.stream.split();

        // A frame cut short by a write error can never be read as a request.
        match tokio::time::timeout(timeout, write_frame(&mut writer, &request_bytes)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(Failure::Unsent(e)),
            Err(_) => return Err(Failure::Sent(ProxyError::Timeout(timeout))),
        }

        let remaining = timeout.saturating_sub(started.elapsed());
        let reply_bytes = tokio::time::timeout(remaining, read_frame(&mut reader, max_size))
            .await
            .map_err(|_| Failure::Sent(ProxyError::Timeout(timeout)))?
            .map_err(Failure::Sent)?
            .ok_or_else(|| {
                Failure::Sent(ProxyError::Transport {
                    message: "connection closed by server".to_string(),
                })
            })?;

        serde_json::from_slice(&reply_bytes).map_err(|e| {
            Failure::Sent(ProxyError::Protocol {
                message: format!("unreadable reply: {}", e),
            })
        })
    }
}

/// State shared between the proxy and its heartbeat task.
struct Inner {
    address: String,
    options: ClientOptions,
    ctor_args: Vec<Value>,
    ctor_kwargs: Map<String, Value>,
    conn: Mutex<Option<Connection>>,
    session: AtomicU64,
    capabilities: RwLock<Arc<CapabilityTable>>,
    /// Consecutive transport failures; reset by any successful reply.
    failures: AtomicU32,
    reconnects: AtomicU32,
    last_ping: StdMutex<Option<Instant>>,
    closed: CancellationToken,
}

impl Inner {
    fn session_id(&self) -> SessionId {
        self.session.load(Ordering::SeqCst)
    }

    fn mark_alive(&self) {
        *self.last_ping.lock().unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());
    }

    /// Open a connection, handshake, fetch the capability table and, if
    /// configured, ask for admin.
    ///
    /// With `resume`, the old session is kept if the server still knows it,
    /// along with its admin slot.
    async fn establish(&self, resume: Option<SessionId>) -> Result<Connection> {
        let timeout = self.options.connect_timeout;
        let mut conn =
            Connection::open(&self.address, timeout, self.options.max_message_size).await?;

        if let Some(id) = resume.filter(|id| *id != HANDSHAKE_SESSION) {
            let ping = Request::control(id, ControlCommand::Ping, Map::new());
            if conn.roundtrip(&ping, timeout).await?.is_ok() {
                info!("Resumed session {} on {}", id, self.address);
                self.mark_alive();
                return Ok(conn);
            }
            debug!("Session {} is gone from {}, starting a new one", id, self.address);
        }

        let name = self.options.name.clone().unwrap_or_default();
        let hello = Request::new(
            HANDSHAKE_SESSION,
            name,
            self.ctor_args.clone(),
            self.ctor_kwargs.clone(),
        );
        let value = conn
            .roundtrip(&hello, timeout)
            .await?
            .into_result()
            .map_err(|e| ProxyError::Handshake {
                message: e.to_string(),
            })?;
        let id = value
            .get("id")
            .and_then(Value::as_u64)
            .ok_or_else(|| ProxyError::Handshake {
                message: format!("reply carries no session id: {}", value),
            })?;
        self.session.store(id, Ordering::SeqCst);
        info!("Connected to {} as session {}", self.address, id);

        let api = Request::control(id, ControlCommand::Api, Map::new());
        let table: CapabilityTable =
            serde_json::from_value(conn.roundtrip(&api, timeout).await?.into_result()?)?;
        *self
            .capabilities
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Arc::new(table);

        if self.options.request_admin {
            let admin = Request::control(id, ControlCommand::Admin, admin_kwargs(Some(true), false));
            let reply = conn.roundtrip(&admin, timeout).await?;
            if reply.is_error() {
                warn!(
                    "Session {} was not granted admin: {}",
                    id,
                    reply.msg.as_deref().unwrap_or("no reason given")
                );
            }
        }

        self.mark_alive();
        Ok(conn)
    }

    /// Send a request under the current session, reconnecting on transport
    /// failure. Only requests that were never written are sent again.
    async fn send(&self, command: &str, args: Vec<Value>, kwargs: Map<String, Value>) -> Result<Reply> {
        let mut conn = self.conn.lock().await;
        loop {
            if self.closed.is_cancelled() {
                return Err(ProxyError::NotConnected);
            }
            let Some(connection) = conn.as_mut() else {
                return Err(ProxyError::NotConnected);
            };

            let request = Request::new(self.session_id(), command, args.clone(), kwargs.clone());
            let failure = match connection.roundtrip(&request, self.options.request_timeout).await {
                Ok(reply) => {
                    self.failures.store(0, Ordering::SeqCst);
                    return Ok(reply);
                }
                Err(failure) if failure.error().is_transport() => failure,
                Err(failure) => return Err(failure.into()),
            };

            // The stream may still carry a late reply, so it is replaced either way.
            *conn = None;
            match failure {
                Failure::Unsent(err) => {
                    warn!("Lost connection to {} ({}), reconnecting", self.address, err);
                    *conn = Some(self.reconnect(None).await?);
                }
                Failure::Sent(err) => {
                    warn!(
                        "No reply to \"{}\" from {} ({}), reconnecting without resending",
                        command, self.address, err
                    );
                    // A timed-out server is still up and still knows this session;
                    // a closed one may have restarted and reissued the id.
                    let resume = matches!(err, ProxyError::Timeout(_)).then(|| self.session_id());
                    *conn = Some(self.reconnect(resume).await?);
                    return Err(err);
                }
            }
        }
    }

    async fn reconnect(&self, resume: Option<SessionId>) -> Result<Connection> {
        loop {
            let attempt = self.failures.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt > self.options.max_reconnects {
                error!("Server at {} seems to be offline, giving up", self.address);
                self.closed.cancel();
                return Err(ProxyError::ReconnectExhausted {
                    address: self.address.clone(),
                    attempts: self.options.max_reconnects,
                });
            }

            self.reconnects.fetch_add(1, Ordering::SeqCst);
            match self.establish(resume).await {
                Ok(conn) => {
                    info!("Reconnected to {} (attempt {})", self.address, attempt);
                    return Ok(conn);
                }
                Err(e) => {
                    warn!("Reconnection attempt {} to {} failed: {}", attempt, self.address, e);
                    tokio::time::sleep(self.options.reconnect_delay).await;
                }
            }
        }
    }

    /// Tell the server we are leaving and drop the connection.
    async fn goodbye(&self) {
        self.closed.cancel();
        let mut conn = self.conn.lock().await;
        if let Some(mut connection) = conn.take() {
            let id = self.session_id();
            let request = Request::control(id, ControlCommand::Disconnect, Map::new());
            match connection.roundtrip(&request, self.options.request_timeout).await {
                Ok(_) => info!("Session {} disconnected from {}", id, self.address),
                Err(failure) => debug!(
                    "Disconnect of session {} not acknowledged: {}",
                    id,
                    failure.error()
                ),
            }
        }
    }

    async fn heartbeat(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.options.ping_interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = self.closed.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match self.send(&ControlCommand::Ping.wire_name(), Vec::new(), Map::new()).await {
                Ok(reply) if reply.is_ok() => self.mark_alive(),
                Ok(reply) => warn!(
                    "Ping rejected for session {}: {}",
                    self.session_id(),
                    reply.msg.as_deref().unwrap_or("no reason given")
                ),
                Err(ProxyError::NotConnected) => break,
                Err(e) => warn!("Ping failed: {}", e),
            }
        }
        debug!("Heartbeat for {} stopped", self.address);
    }
}

/// Connection to one remote device.
pub struct ClientProxy {
    inner: Arc<Inner>,
    heartbeat: StdMutex<Option<JoinHandle<()>>>,
}

impl ClientProxy {
    /// Connect to the server at `address` (`"host:port"`).
    ///
    /// `args` and `kwargs` construct the device if this is the server's
    /// first client; later clients' constructor arguments are ignored.
    pub async fn connect(
        address: impl Into<String>,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
        options: ClientOptions,
    ) -> Result<Self> {
        let inner = Arc::new(Inner {
            address: address.into(),
            options,
            ctor_args: args,
            ctor_kwargs: kwargs,
            conn: Mutex::new(None),
            session: AtomicU64::new(HANDSHAKE_SESSION),
            capabilities: RwLock::new(Arc::new(CapabilityTable::default())),
            failures: AtomicU32::new(0),
            reconnects: AtomicU32::new(0),
            last_ping: StdMutex::new(None),
            closed: CancellationToken::new(),
        });

        let conn = inner.establish(None).await?;
        *inner.conn.lock().await = Some(conn);
        let heartbeat = tokio::spawn(inner.clone().heartbeat());

        Ok(Self {
            inner,
            heartbeat: StdMutex::new(Some(heartbeat)),
        })
    }

    /// Invoke a capability and return its value.
    ///
    /// For non-blocking capabilities this polls `^result` until the task ends.
    pub async fn call(&self, name: &str, args: Vec<Value>, kwargs: Map<String, Value>) -> Result<Value> {
        self.call_with_cancel(name, args, kwargs, &CancellationToken::new())
            .await
    }

    /// Like `call`; cancelling `cancel` while a non-blocking call is being
    /// polled sends a single `^abort` and returns its outcome.
    pub async fn call_with_cancel(
        &self,
        name: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        let reply = self.call_raw(name, args, kwargs).await?;
        let value = reply.into_result()?;

        let non_blocking = self
            .capabilities()
            .get(name)
            .is_some_and(|c| c.kind == CapabilityKind::Method && !c.blocking);
        if non_blocking {
            return self.wait_for_result(name, cancel).await;
        }
        Ok(value)
    }

    async fn wait_for_result(&self, name: &str, cancel: &CancellationToken) -> Result<Value> {
        let ctrl_c = self.inner.options.abort_on_ctrl_c;
        loop {
            let reply = self.result().await?;
            if !reply.is_waiting() {
                return reply.into_result();
            }

            let interrupted = tokio::select! {
                _ = cancel.cancelled() => true,
                _ = tokio::signal::ctrl_c(), if ctrl_c => true,
                _ = tokio::time::sleep(self.inner.options.poll_interval) => false,
            };
            if interrupted {
                warn!("Interrupted while waiting for \"{}\", sending abort", name);
                return self.abort().await?.into_result();
            }
        }
    }

    /// Read a property.
    pub async fn get(&self, name: &str) -> Result<Value> {
        self.call(name, Vec::new(), Map::new()).await
    }

    /// Write a property.
    pub async fn set(&self, name: &str, value: Value) -> Result<()> {
        self.call(name, vec![value], Map::new()).await.map(|_| ())
    }

    /// Send a request and return the reply envelope as is.
    pub async fn call_raw(&self, name: &str, args: Vec<Value>, kwargs: Map<String, Value>) -> Result<Reply> {
        self.inner.send(name, args, kwargs).await
    }

    /// Send a control command and return the reply envelope as is.
    pub async fn send_control(&self, command: ControlCommand, kwargs: Map<String, Value>) -> Result<Reply> {
        self.inner.send(&command.wire_name(), Vec::new(), kwargs).await
    }

    pub async fn request_admin(&self, force: bool) -> Result<Reply> {
        self.send_control(ControlCommand::Admin, admin_kwargs(Some(true), force))
            .await
    }

    pub async fn release_admin(&self) -> Result<Reply> {
        self.send_control(ControlCommand::Admin, admin_kwargs(Some(false), false))
            .await
    }

    /// Whether this session holds the admin slot.
    pub async fn is_admin(&self) -> Result<bool> {
        let reply = self
            .send_control(ControlCommand::Admin, admin_kwargs(None, false))
            .await?;
        Ok(reply.into_result()? == Value::Bool(true))
    }

    /// Latency statistics the server keeps for this session.
    pub async fn stats(&self) -> Result<Value> {
        self.send_control(ControlCommand::Stats, Map::new())
            .await?
            .into_result()
    }

    /// Poll the pending non-blocking task once.
    pub async fn result(&self) -> Result<Reply> {
        self.send_control(ControlCommand::Result, Map::new()).await
    }

    /// Ask the server to interrupt the pending non-blocking task.
    pub async fn abort(&self) -> Result<Reply> {
        self.send_control(ControlCommand::Abort, Map::new()).await
    }

    /// Stop the server. Needs admin.
    pub async fn kill(&self) -> Result<()> {
        self.send_control(ControlCommand::Kill, Map::new())
            .await?
            .into_result()?;
        self.shutdown().await;
        Ok(())
    }

    pub fn address(&self) -> &str {
        &self.inner.address
    }

    pub fn session_id(&self) -> SessionId {
        self.inner.session_id()
    }

    /// Capability table fetched on the last handshake.
    pub fn capabilities(&self) -> Arc<CapabilityTable> {
        self.inner
            .capabilities
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// How many reconnections were attempted over the proxy's lifetime.
    pub fn reconnect_count(&self) -> u32 {
        self.inner.reconnects.load(Ordering::SeqCst)
    }

    /// True while the heartbeat keeps getting answers.
    pub fn is_alive(&self) -> bool {
        if self.inner.closed.is_cancelled() {
            return false;
        }
        let window = self.inner.options.ping_interval * 2;
        self.inner
            .last_ping
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some_and(|at| at.elapsed() <= window)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Disconnect from the server and stop the heartbeat.
    pub async fn shutdown(&self) {
        self.inner.closed.cancel();
        let heartbeat = self
            .heartbeat
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(heartbeat) = heartbeat {
            let _ = heartbeat.await;
        }
        self.inner.goodbye().await;
    }
}

impl Drop for ClientProxy {
    fn drop(&mut self) {
        let heartbeat = self
            .heartbeat
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(heartbeat) = heartbeat {
            heartbeat.abort();
        }

        let has_connection = self
            .inner
            .conn
            .try_lock()
            .map_or(true, |conn| conn.is_some());
        if !has_connection {
            self.inner.closed.cancel();
            return;
        }

        // Best effort: without a runtime there is nobody to send the goodbye.
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let inner = self.inner.clone();
                runtime.spawn(async move { inner.goodbye().await });
            }
            Err(_) => self.inner.closed.cancel(),
        }
    }
}

impl std::fmt::Debug for ClientProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientProxy")
            .field("address", &self.inner.address)
            .field("session", &self.session_id())
            .field("closed", &self.is_closed())
            .finish()
    }
}
