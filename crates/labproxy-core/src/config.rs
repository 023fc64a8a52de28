//! Centralized configuration for labproxy.
//!
//! Protocol constants live on `ProxyConfig`. `ServerOptions` and
//! `ClientOptions` default from them and can be overridden per instance, which
//! the tests use to shrink heartbeat and eviction intervals.

use std::time::Duration;

/// Protocol-level constants.
pub struct ProxyConfig;

impl ProxyConfig {
    /// Prefix that marks a command as a control command.
    pub const ESCAPE: char = '^';

    // Liveness
    pub const PING_INTERVAL: Duration = Duration::from_secs(10);
    pub const LIVENESS_BUDGET: Duration = Duration::from_secs(30);

    // Non-blocking tasks
    pub const RESULT_TIMEOUT: Duration = Duration::from_millis(200);
    pub const POLL_INTERVAL: Duration = Duration::from_millis(50);

    // Client transport
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
    pub const MAX_RECONNECTS: u32 = 3;
    pub const RECONNECT_DELAY: Duration = Duration::from_millis(500);

    // Server limits
    pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024; // 16MB
    pub const MAX_CONNECTIONS: usize = 64;
    pub const KILL_GRACE: Duration = Duration::from_millis(500);
}

/// Tunables for a `Server`.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Period of the liveness loop; each tick drains this much budget.
    pub ping_interval: Duration,
    /// Budget a session gets on handshake and on every ping.
    pub liveness_budget: Duration,
    /// How long `^result` waits for a running task before answering `waiting`.
    pub result_timeout: Duration,
    pub max_connections: usize,
    pub max_message_size: usize,
    /// Delay between acknowledging `^kill` and stopping.
    pub kill_grace: Duration,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            ping_interval: ProxyConfig::PING_INTERVAL,
            liveness_budget: ProxyConfig::LIVENESS_BUDGET,
            result_timeout: ProxyConfig::RESULT_TIMEOUT,
            max_connections: ProxyConfig::MAX_CONNECTIONS,
            max_message_size: ProxyConfig::MAX_MESSAGE_SIZE,
            kill_grace: ProxyConfig::KILL_GRACE,
        }
    }
}

/// Tunables for a `ClientProxy`.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Name announced in the handshake, shown in server logs and stats.
    pub name: Option<String>,
    /// Ask for the admin slot right after connecting.
    pub request_admin: bool,
    /// Send `^abort` when Ctrl-C arrives while polling a non-blocking call.
    pub abort_on_ctrl_c: bool,
    pub ping_interval: Duration,
    pub poll_interval: Duration,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    pub max_reconnects: u32,
    pub reconnect_delay: Duration,
    pub max_message_size: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            name: None,
            request_admin: true,
            abort_on_ctrl_c: false,
            ping_interval: ProxyConfig::PING_INTERVAL,
            poll_interval: ProxyConfig::POLL_INTERVAL,
            request_timeout: ProxyConfig::REQUEST_TIMEOUT,
            connect_timeout: ProxyConfig::CONNECT_TIMEOUT,
            max_reconnects: ProxyConfig::MAX_RECONNECTS,
            reconnect_delay: ProxyConfig::RECONNECT_DELAY,
            max_message_size: ProxyConfig::MAX_MESSAGE_SIZE,
        }
    }
}

impl ClientOptions {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    /// Connect as an observer that never asks for admin on its own.
    pub fn observer(mut self) -> Self {
        self.request_admin = false;
        self
    }
}
