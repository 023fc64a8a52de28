//! Request dispatch against one shared device instance.
//!
//! The dispatcher owns everything the server knows about its clients: the
//! session table with its admin slot, the pending non-blocking task, and the
//! lazily built target. It is transport-agnostic; `Server` feeds it requests
//! from TCP connections one at a time.

use serde::Serialize;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{Notify, OnceCell};
use tracing::{debug, info, warn};

use super::session::{AdminSlot, SessionStats, SessionTable};
use super::task::{TaskPoll, TaskSlot};
use crate::config::ServerOptions;
use crate::error::{DeviceError, ProxyError, Result};
use crate::protocol::{Args, ControlCommand, Reply, Request, SessionId, HANDSHAKE_SESSION};
use crate::registry::{CapabilityTable, Device, Handler, Registry};

/// Reply acknowledging that a non-blocking call was started.
pub const TASK_STARTED: &str = "non-blocking call started";

type Target<T> = std::result::Result<Arc<T>, String>;

pub struct Dispatcher<T> {
    registry: Registry<T>,
    options: ServerOptions,
    target: OnceCell<Target<T>>,
    sessions: Mutex<SessionTable>,
    task: TaskSlot,
    kill: Notify,
}

impl<T: Device> Dispatcher<T> {
    /// Dispatcher whose device is built by the first handshake.
    pub fn new(options: ServerOptions) -> Result<Self> {
        Self::with_target(options, OnceCell::new())
    }

    /// Dispatcher serving an already constructed device.
    pub fn with_instance(instance: T, options: ServerOptions) -> Result<Self> {
        Self::with_target(options, OnceCell::from(Ok(Arc::new(instance))))
    }

    fn with_target(options: ServerOptions, target: OnceCell<Target<T>>) -> Result<Self> {
        let registry = Registry::<T>::build()?;
        Ok(Self {
            registry,
            sessions: Mutex::new(SessionTable::new(options.liveness_budget)),
            options,
            target,
            task: TaskSlot::default(),
            kill: Notify::new(),
        })
    }

    pub fn capabilities(&self) -> &Arc<CapabilityTable> {
        self.registry.table()
    }

    pub fn options(&self) -> &ServerOptions {
        &self.options
    }

    pub fn session_count(&self) -> usize {
        self.sessions().len()
    }

    pub fn admin(&self) -> AdminSlot {
        self.sessions().admin()
    }

    pub fn has_pending_task(&self) -> bool {
        self.task.is_pending()
    }

    /// The device instance, once a handshake has built it.
    pub fn instance(&self) -> Option<Arc<T>> {
        match self.target.get() {
            Some(Ok(target)) => Some(target.clone()),
            _ => None,
        }
    }

    fn sessions(&self) -> MutexGuard<'_, SessionTable> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Process one request and produce its reply. Never fails: every problem
    /// becomes an error reply.
    pub async fn dispatch(&self, request: Request) -> Reply {
        let session = request.session;
        if session == HANDSHAKE_SESSION {
            return self.handshake(request).await;
        }

        // Any traffic from a session proves it is alive.
        let known = self.sessions().touch(session);
        if !known {
            debug!("Request \"{}\" from unknown session {}", request.command, session);
            return Reply::error(ProxyError::UnknownSession(session).to_string());
        }

        debug!("Session {} -> {}", session, request.command);
        let started = Instant::now();
        let reply = match request.control_name().map(ControlCommand::parse) {
            Some(Some(command)) => self.control(session, command, request).await,
            Some(None) => Reply::error(format!("Unknown control command \"{}\"", request.command)),
            None => self.invoke(session, request).await,
        };
        self.sessions().record_latency(session, started.elapsed());
        reply
    }

    async fn handshake(&self, request: Request) -> Reply {
        let Request {
            command,
            args,
            kwargs,
            ..
        } = request;

        let target = self
            .target
            .get_or_init(|| async move {
                let args = Args::new(args, kwargs);
                match tokio::task::spawn_blocking(move || T::construct(&args)).await {
                    Ok(Ok(instance)) => {
                        info!("Constructed {}", std::any::type_name::<T>());
                        Ok(Arc::new(instance))
                    }
                    Ok(Err(e)) => Err(e.to_string()),
                    Err(e) => Err(format!("constructor panicked: {e}")),
                }
            })
            .await;

        if let Err(msg) = target {
            warn!("Refusing handshake: {}", msg);
            let err = ProxyError::Handshake {
                message: format!("instance creation failed: {msg}"),
            };
            return Reply::error(err.to_string());
        }

        let name = (!command.is_empty()).then_some(command);
        let (id, name) = {
            let mut sessions = self.sessions();
            let id = sessions.open(name);
            (id, sessions.name(id).unwrap_or_default().to_string())
        };
        info!("Session {} ({}) connected", id, name);
        Reply::value(json!({ "id": id }))
    }

    fn target(&self) -> std::result::Result<Arc<T>, String> {
        match self.target.get() {
            Some(Ok(target)) => Ok(target.clone()),
            Some(Err(msg)) => Err(msg.clone()),
            None => Err("device has not been constructed".to_string()),
        }
    }

    async fn invoke(&self, session: SessionId, request: Request) -> Reply {
        let Request {
            command,
            args,
            kwargs,
            ..
        } = request;

        let (Some(capability), Some(handler)) = (
            self.registry.table().get(&command).cloned(),
            self.registry.handler(&command),
        ) else {
            return Reply::error(format!("Unknown command \"{command}\""));
        };
        let target = match self.target() {
            Ok(target) => target,
            Err(msg) => return Reply::error(msg),
        };

        match handler {
            Handler::Property { getter, setter } => {
                if !kwargs.is_empty() {
                    return Reply::error(format!("Property \"{command}\" takes no keyword arguments"));
                }
                let mut args = args;
                match (args.pop(), args.is_empty()) {
                    (None, _) => run_blocking(move || getter(&target)).await,
                    (Some(value), true) => {
                        if capability.requires_admin && !self.is_admin(session) {
                            return not_admin(&command);
                        }
                        let Some(setter) = setter else {
                            return Reply::error(DeviceError::ReadOnly(command).to_string());
                        };
                        run_blocking(move || setter(&target, value).map(|()| Value::Null)).await
                    }
                    (Some(_), false) => Reply::error(format!(
                        "Property \"{command}\" takes zero or one argument"
                    )),
                }
            }
            Handler::Method(method) => {
                if capability.requires_admin && !self.is_admin(session) {
                    return not_admin(&command);
                }
                let args = Args::new(args, kwargs);
                if capability.blocking {
                    return run_blocking(move || method(&target, args)).await;
                }
                match self.task.try_start(&command, move || method(&target, args)) {
                    Ok(()) => {
                        debug!("Session {} started non-blocking \"{}\"", session, command);
                        Reply::ok().with_msg(TASK_STARTED)
                    }
                    Err(e) => Reply::error(e.to_string()),
                }
            }
        }
    }

    fn is_admin(&self, session: SessionId) -> bool {
        self.sessions().is_admin(session)
    }

    async fn control(&self, session: SessionId, command: ControlCommand, request: Request) -> Reply {
        match command {
            ControlCommand::Ping => Reply::ok(),
            ControlCommand::Disconnect => {
                let removed = self.sessions().close(session);
                if removed {
                    info!("Session {} disconnected", session);
                }
                Reply::ok()
            }
            ControlCommand::Admin => self.admin_request(session, request),
            ControlCommand::Stats => {
                let stats: Option<SessionStats> = self.sessions().stats(session);
                match stats {
                    Some(stats) => encode(&stats),
                    None => Reply::error(ProxyError::UnknownSession(session).to_string()),
                }
            }
            ControlCommand::Result => self.result().await,
            ControlCommand::Abort => self.abort(session).await,
            ControlCommand::Api => encode(self.registry.table().as_ref()),
            ControlCommand::Kill => {
                if !self.is_admin(session) {
                    return not_admin(&request.command);
                }
                warn!("Session {} asked the server to stop", session);
                self.kill.notify_one();
                Reply::ok().with_msg("server stopping")
            }
        }
    }

    fn admin_request(&self, session: SessionId, request: Request) -> Reply {
        let args = Args::new(request.args, request.kwargs);
        let parsed = args
            .arg_or_default::<Option<bool>>(0, "admin", None)
            .and_then(|wanted| Ok((wanted, args.arg_or_default(1, "force", false)?)));
        let (wanted, force) = match parsed {
            Ok(parsed) => parsed,
            Err(e) => return Reply::error(e.to_string()),
        };

        let mut sessions = self.sessions();
        let outcome = match wanted {
            None => {
                let held = match sessions.admin() {
                    AdminSlot::Free => Value::Null,
                    AdminSlot::HeldBy(holder) => json!(holder == session),
                };
                return Reply::value(held);
            }
            Some(true) => sessions.request_admin(session, force),
            Some(false) => sessions.release_admin(session),
        };
        drop(sessions);

        match outcome {
            Ok(grant) => {
                info!("Session {}: {}", session, grant.message());
                Reply::value(json!(wanted == Some(true))).with_msg(grant.message())
            }
            Err(refusal) => {
                warn!("Session {} admin request refused: {}", session, refusal);
                Reply::error(refusal.to_string())
            }
        }
    }

    async fn result(&self) -> Reply {
        match self.task.wait(self.options.result_timeout).await {
            TaskPoll::Empty => Reply::error("No pending task"),
            TaskPoll::Running => Reply::waiting("Task is still running"),
            TaskPoll::Done(outcome) => outcome_reply(outcome),
        }
    }

    async fn abort(&self, session: SessionId) -> Reply {
        match self.task.poll() {
            TaskPoll::Empty => {
                warn!("Session {} sent abort with no task pending", session);
                Reply::error("No pending task to abort")
            }
            TaskPoll::Done(outcome) => {
                warn!("Session {} sent abort, but the task had already finished", session);
                outcome_reply(outcome)
            }
            TaskPoll::Running => {
                let Some(interrupt) = self.registry.interrupt() else {
                    warn!("Abort requested but no interrupt handler is registered");
                    return Reply::waiting("No interrupt handler registered; task still running");
                };
                let target = match self.target() {
                    Ok(target) => target,
                    Err(msg) => return Reply::error(msg),
                };
                let reply = run_blocking(move || interrupt(&target)).await;
                // A failed interrupt leaves the worker running, so its slot stays taken.
                if reply.is_error() {
                    warn!("Session {} could not abort the pending task", session);
                    return reply;
                }
                if let Some(command) = self.task.release() {
                    warn!("Session {} aborted \"{}\"", session, command);
                }
                reply
            }
        }
    }

    /// Drain `elapsed` from every liveness budget and evict the sessions that
    /// ran out. Returns the evicted ids.
    pub fn expire(&self, elapsed: Duration) -> Vec<SessionId> {
        let evicted = self.sessions().drain(elapsed);
        for id in &evicted {
            warn!("Session {} stopped pinging, evicted", id);
        }
        evicted
    }

    /// Forget every session and free the admin slot.
    pub fn reset_sessions(&self) {
        self.sessions().clear();
    }

    /// Resolves once an admin has sent `^kill`.
    pub async fn kill_requested(&self) {
        self.kill.notified().await;
    }
}

fn not_admin(command: &str) -> Reply {
    let err = ProxyError::NotAdmin {
        command: command.to_string(),
    };
    Reply::error(err.to_string())
}

fn outcome_reply(outcome: std::result::Result<Value, String>) -> Reply {
    match outcome {
        Ok(value) => Reply::value(value),
        Err(msg) => Reply::error(msg),
    }
}

fn encode<S: Serialize + ?Sized>(value: &S) -> Reply {
    match serde_json::to_value(value) {
        Ok(value) => Reply::value(value),
        Err(e) => Reply::error(
            ProxyError::Serialization {
                message: e.to_string(),
            }
            .to_string(),
        ),
    }
}

/// Run device code on the blocking pool and turn its outcome into a reply.
async fn run_blocking<F>(work: F) -> Reply
where
    F: FnOnce() -> std::result::Result<Value, DeviceError> + Send + 'static,
{
    match tokio::task::spawn_blocking(work).await {
        Ok(Ok(Value::Null)) => Reply::ok(),
        Ok(Ok(value)) => Reply::value(value),
        Ok(Err(e)) => Reply::error(e.to_string()),
        Err(e) => Reply::error(format!("device call panicked: {e}")),
    }
}
