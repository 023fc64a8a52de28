//! TCP server exposing one device instance to many clients.
//!
//! Each connection gets its own task that reads frames, but every request is
//! handed to a single dispatch loop through a channel, so requests from all
//! clients are processed one at a time. A liveness loop drains session
//! budgets in the background and evicts clients that stopped pinging.
//!
//! # Thread Safety
//!
//! Device code runs on tokio's blocking pool. A blocking capability holds the
//! dispatch loop until it returns; non-blocking ones only occupy the single
//! task slot, leaving the loop free for `^result`, `^abort` and other clients.

mod dispatcher;
mod session;
mod task;

pub use dispatcher::{Dispatcher, TASK_STARTED};
pub use session::{AdminGrant, AdminRefusal, AdminSlot, LatencyStats, SessionStats};

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::ServerOptions;
use crate::error::{ProxyError, Result};
use crate::protocol::{read_frame, write_frame, Reply, Request};
use crate::registry::Device;

/// A request waiting for the dispatch loop, with the channel its reply goes to.
type Job = (Request, oneshot::Sender<Reply>);

/// Serves one device type over TCP.
pub struct Server<T: Device> {
    dispatcher: Arc<Dispatcher<T>>,
    running: Option<RunHandle>,
}

/// Everything belonging to one `start`..`stop` run.
struct RunHandle {
    addr: SocketAddr,
    shutdown_tx: Arc<watch::Sender<bool>>,
    tasks: Vec<JoinHandle<()>>,
}

impl<T: Device> Server<T> {
    /// Server whose device is constructed by the first client handshake.
    pub fn new(options: ServerOptions) -> Result<Self> {
        Ok(Self::from_dispatcher(Dispatcher::new(options)?))
    }

    /// Server for a device built up front.
    pub fn with_instance(instance: T, options: ServerOptions) -> Result<Self> {
        Ok(Self::from_dispatcher(Dispatcher::with_instance(instance, options)?))
    }

    fn from_dispatcher(dispatcher: Dispatcher<T>) -> Self {
        Self {
            dispatcher: Arc::new(dispatcher),
            running: None,
        }
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher<T>> {
        &self.dispatcher
    }

    /// Address of the current run, if started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|run| run.addr)
    }

    pub fn is_running(&self) -> bool {
        self.running
            .as_ref()
            .is_some_and(|run| !*run.shutdown_tx.borrow())
    }

    /// Bind `address` and start serving. A running server is stopped first.
    /// Returns the bound address, useful when binding port 0.
    pub async fn start<A: ToSocketAddrs>(&mut self, address: A) -> Result<SocketAddr> {
        if self.running.is_some() {
            info!("Server restarting");
            self.stop().await;
        }

        let listener = TcpListener::bind(address).await?;
        let addr = listener.local_addr()?;
        info!(
            "Serving {} on {}",
            std::any::type_name::<T>(),
            addr
        );

        let options = self.dispatcher.options().clone();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shutdown_tx = Arc::new(shutdown_tx);
        let (job_tx, job_rx) = mpsc::channel::<Job>(options.max_connections.max(1));

        let tasks = vec![
            tokio::spawn(dispatch_loop(
                self.dispatcher.clone(),
                job_rx,
                shutdown_rx.clone(),
            )),
            tokio::spawn(accept_loop(listener, job_tx, shutdown_rx.clone(), options)),
            tokio::spawn(liveness_loop(self.dispatcher.clone(), shutdown_rx.clone())),
            tokio::spawn(kill_watch(
                self.dispatcher.clone(),
                shutdown_tx.clone(),
                shutdown_rx,
            )),
        ];

        self.running = Some(RunHandle {
            addr,
            shutdown_tx,
            tasks,
        });
        Ok(addr)
    }

    /// Stop serving and forget all sessions. The device instance is kept.
    pub async fn stop(&mut self) {
        let Some(run) = self.running.take() else {
            return;
        };
        let _ = run.shutdown_tx.send(true);
        for task in run.tasks {
            if let Err(e) = task.await {
                warn!("Server task ended abnormally: {}", e);
            }
        }
        self.dispatcher.reset_sessions();
        info!("Server on {} stopped", run.addr);
    }

    /// Wait until the current run ends, e.g. because an admin sent `^kill`.
    pub async fn wait(&self) {
        if let Some(run) = &self.running {
            let mut shutdown = run.shutdown_tx.subscribe();
            stopped(&mut shutdown).await;
        }
    }
}

impl<T: Device> Drop for Server<T> {
    fn drop(&mut self) {
        if let Some(run) = self.running.take() {
            let _ = run.shutdown_tx.send(true);
            for task in run.tasks {
                task.abort();
            }
        }
    }
}

/// Resolves once the shutdown flag is set or its sender is gone.
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

async fn dispatch_loop<T: Device>(
    dispatcher: Arc<Dispatcher<T>>,
    mut jobs: mpsc::Receiver<Job>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = stopped(&mut shutdown) => break,
            job = jobs.recv() => {
                let Some((request, reply_tx)) = job else {
                    break;
                };
                let reply = dispatcher.dispatch(request).await;
                // The connection may have gone away in the meantime.
                let _ = reply_tx.send(reply);
            }
        }
    }
    dispatcher.reset_sessions();
    debug!("Dispatch loop stopped");
}

async fn accept_loop(
    listener: TcpListener,
    jobs: mpsc::Sender<Job>,
    mut shutdown: watch::Receiver<bool>,
    options: ServerOptions,
) {
    let active_connections = Arc::new(AtomicUsize::new(0));

    loop {
        tokio::select! {
            _ = stopped(&mut shutdown) => {
                debug!("Accept loop stopped");
                break;
            }
            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, peer_addr)) => {
                        let current = active_connections.load(Ordering::Relaxed);
                        if current >= options.max_connections {
                            warn!(
                                "Rejecting connection from {}: at max capacity ({})",
                                peer_addr, options.max_connections
                            );
                            continue;
                        }

                        active_connections.fetch_add(1, Ordering::Relaxed);
                        let jobs = jobs.clone();
                        let conns = active_connections.clone();
                        let mut conn_shutdown = shutdown.clone();
                        let max_size = options.max_message_size;

                        tokio::spawn(async move {
                            debug!("Connection from {}", peer_addr);
                            if let Err(e) = handle_connection(stream, &jobs, &mut conn_shutdown, max_size).await {
                                debug!("Connection {} ended: {}", peer_addr, e);
                            }
                            conns.fetch_sub(1, Ordering::Relaxed);
                        });
                    }
                    Err(e) => {
                        error!("Accept error: {}", e);
                    }
                }
            }
        }
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    jobs: &mpsc::Sender<Job>,
    shutdown: &mut watch::Receiver<bool>,
    max_size: usize,
) -> Result<()> {
    let (mut reader, mut writer) = stream.split();

    loop {
        let frame = tokio::select! {
            result = read_frame(&mut reader, max_size) => {
                match result {
                    Ok(Some(frame)) => frame,
                    Ok(None) => return Ok(()),
                    Err(e @ ProxyError::Protocol { .. }) => {
                        // The oversized payload is still in the stream; reply and hang up.
                        write_frame(&mut writer, &encode_reply(&Reply::error(e.to_string()))).await?;
                        return Err(e);
                    }
                    Err(e) => return Err(e),
                }
            }
            _ = stopped(shutdown) => return Ok(()),
        };

        let reply = match serde_json::from_slice::<Request>(&frame) {
            Ok(request) => submit(jobs, request).await?,
            Err(e) => Reply::error(format!("Malformed request: {}", e)),
        };
        write_frame(&mut writer, &encode_reply(&reply)).await?;
    }
}

/// Hand a request to the dispatch loop and wait for its reply.
async fn submit(jobs: &mpsc::Sender<Job>, request: Request) -> Result<Reply> {
    let (reply_tx, reply_rx) = oneshot::channel();
    jobs.send((request, reply_tx))
        .await
        .map_err(|_| ProxyError::Transport {
            message: "dispatch loop stopped".to_string(),
        })?;
    reply_rx.await.map_err(|_| ProxyError::Transport {
        message: "dispatch loop dropped the request".to_string(),
    })
}

/// Sent if a reply cannot be encoded.
const FALLBACK_REPLY: &[u8] = br#"{"status":"error","msg":"reply encoding failed"}"#;

/// Replies carry only strings and JSON values, so encoding does not fail in
/// practice; device results that could not be encoded were already turned
/// into error replies by the dispatcher.
fn encode_reply(reply: &Reply) -> Vec<u8> {
    serde_json::to_vec(reply).unwrap_or_else(|e| {
        error!("Could not encode reply: {}", e);
        FALLBACK_REPLY.to_vec()
    })
}

async fn liveness_loop<T: Device>(
    dispatcher: Arc<Dispatcher<T>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let period = dispatcher
        .options()
        .ping_interval
        .max(Duration::from_millis(1));
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = stopped(&mut shutdown) => break,
            _ = ticker.tick() => {
                dispatcher.expire(period);
            }
        }
    }
    debug!("Liveness loop stopped");
}

async fn kill_watch<T: Device>(
    dispatcher: Arc<Dispatcher<T>>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    mut shutdown: watch::Receiver<bool>,
) {
    tokio::select! {
        _ = stopped(&mut shutdown) => {}
        _ = dispatcher.kill_requested() => {
            tokio::time::sleep(dispatcher.options().kill_grace).await;
            info!("Stopping on client request");
            let _ = shutdown_tx.send(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{admin_kwargs, ControlCommand, Status, HANDSHAKE_SESSION};
    use crate::test_support::Stage;
    use crate::config::ProxyConfig;
    use serde_json::{json, Map};

    fn fast_options() -> ServerOptions {
        ServerOptions {
            ping_interval: Duration::from_millis(50),
            liveness_budget: Duration::from_millis(150),
            kill_grace: Duration::from_millis(20),
            ..ServerOptions::default()
        }
    }

    async fn roundtrip(stream: &mut TcpStream, request: &Request) -> Reply {
        let (mut reader, mut writer) = stream.split();
        let bytes = serde_json::to_vec(request).unwrap();
        write_frame(&mut writer, &bytes).await.unwrap();
        let reply = read_frame(&mut reader, ProxyConfig::MAX_MESSAGE_SIZE)
            .await
            .unwrap()
            .unwrap();
        serde_json::from_slice(&reply).unwrap()
    }

    async fn open_session(addr: SocketAddr) -> (TcpStream, u64) {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let hello = Request::new(HANDSHAKE_SESSION, "test", vec![], Map::new());
        let reply = roundtrip(&mut stream, &hello).await;
        let id = reply.value.unwrap()["id"].as_u64().unwrap();
        (stream, id)
    }

    #[test]
    fn test_encoded_replies_decode() {
        let reply = Reply::value(json!({"id": 3})).with_msg("ok");
        let back: Reply = serde_json::from_slice(&encode_reply(&reply)).unwrap();
        assert_eq!(back, reply);

        let fallback: Reply = serde_json::from_slice(FALLBACK_REPLY).unwrap();
        assert!(fallback.is_error());
    }

    #[tokio::test]
    async fn test_server_start_and_stop() {
        let mut server = Server::<Stage>::new(ServerOptions::default()).unwrap();
        let addr = server.start("127.0.0.1:0").await.unwrap();

        assert!(addr.port() > 0);
        assert_eq!(addr.ip(), std::net::Ipv4Addr::LOCALHOST);
        assert!(server.is_running());
        assert_eq!(server.local_addr(), Some(addr));

        server.stop().await;
        assert!(!server.is_running());
        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_handshake_and_call_over_tcp() {
        let mut server = Server::<Stage>::new(ServerOptions::default()).unwrap();
        let addr = server.start("127.0.0.1:0").await.unwrap();

        let (mut stream, id) = open_session(addr).await;
        assert_eq!(id, 1);

        let reply = roundtrip(&mut stream, &Request::new(id, "double", vec![json!(4)], Map::new())).await;
        assert_eq!(reply.value, Some(json!(8)));

        let reply = roundtrip(&mut stream, &Request::new(id, "fail", vec![], Map::new())).await;
        assert_eq!(reply.status, Status::Error);

        server.stop().await;
    }

    #[tokio::test]
    async fn test_malformed_request_gets_error_reply() {
        let mut server = Server::<Stage>::new(ServerOptions::default()).unwrap();
        let addr = server.start("127.0.0.1:0").await.unwrap();

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let (mut reader, mut writer) = stream.split();
        write_frame(&mut writer, b"not valid json").await.unwrap();

        let bytes = read_frame(&mut reader, 1024).await.unwrap().unwrap();
        let reply: Reply = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(reply.status, Status::Error);
        assert!(reply.msg.unwrap().contains("Malformed request"));

        server.stop().await;
    }

    #[tokio::test]
    async fn test_restart_clears_sessions_but_keeps_ids_unique() {
        let mut server = Server::<Stage>::new(ServerOptions::default()).unwrap();
        let addr = server.start("127.0.0.1:0").await.unwrap();
        let (_stream, first) = open_session(addr).await;
        assert_eq!(server.dispatcher().session_count(), 1);

        let addr = server.start("127.0.0.1:0").await.unwrap();
        assert_eq!(server.dispatcher().session_count(), 0);

        let (mut stream, second) = open_session(addr).await;
        assert!(second > first);

        let stale = Request::control(first, ControlCommand::Ping, Map::new());
        assert_eq!(roundtrip(&mut stream, &stale).await.status, Status::Error);

        server.stop().await;
    }

    #[tokio::test]
    async fn test_silent_session_is_evicted() {
        let mut server = Server::<Stage>::new(fast_options()).unwrap();
        let addr = server.start("127.0.0.1:0").await.unwrap();

        let (mut quiet, quiet_id) = open_session(addr).await;
        let (mut chatty, chatty_id) = open_session(addr).await;
        let take_admin = Request::control(quiet_id, ControlCommand::Admin, admin_kwargs(Some(true), false));
        assert!(roundtrip(&mut quiet, &take_admin).await.is_ok());

        for _ in 0..8 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let ping = Request::control(chatty_id, ControlCommand::Ping, Map::new());
            assert!(roundtrip(&mut chatty, &ping).await.is_ok());
        }

        let ping = Request::control(quiet_id, ControlCommand::Ping, Map::new());
        assert_eq!(roundtrip(&mut quiet, &ping).await.status, Status::Error);
        assert_eq!(server.dispatcher().admin(), AdminSlot::Free);
        assert_eq!(server.dispatcher().session_count(), 1);

        server.stop().await;
    }

    #[tokio::test]
    async fn test_kill_stops_server() {
        let mut server = Server::<Stage>::new(fast_options()).unwrap();
        let addr = server.start("127.0.0.1:0").await.unwrap();
        let (mut stream, id) = open_session(addr).await;

        let take_admin = Request::control(id, ControlCommand::Admin, admin_kwargs(Some(true), false));
        roundtrip(&mut stream, &take_admin).await;
        let kill = Request::control(id, ControlCommand::Kill, Map::new());
        assert!(roundtrip(&mut stream, &kill).await.is_ok());

        tokio::time::timeout(Duration::from_secs(2), server.wait())
            .await
            .expect("server should stop after kill");
        assert!(!server.is_running());
        server.stop().await;
    }
}
