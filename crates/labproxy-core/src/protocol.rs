//! Wire protocol types and framing.
//!
//! A request is a JSON array `[session_id, command, args, kwargs]`; a reply is
//! an object `{"status": "ok"|"error"|"waiting", "value": ..., "msg": ...}`.
//! Commands starting with `^` are control commands handled by the server
//! itself rather than forwarded to the device. Session id 0 is the handshake
//! address, and the command field of a handshake carries the client's name.
//!
//! Every message travels as a length-prefixed frame:
//!
//! ```text
//! [u32 BE: len][UTF-8 JSON bytes of len]
//! ```

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::config::ProxyConfig;
use crate::error::{DeviceError, ProxyError, Result};

/// Identifier the server hands out on handshake.
pub type SessionId = u64;

/// Session id used by a client that has not completed its handshake yet.
pub const HANDSHAKE_SESSION: SessionId = 0;

/// Key of the object that wraps a base64-encoded binary payload.
pub const BYTES_KEY: &str = "$bytes";

/// One request from a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "WireRequest", into = "WireRequest")]
pub struct Request {
    pub session: SessionId,
    pub command: String,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
}

#[derive(Serialize, Deserialize)]
struct WireRequest(SessionId, String, Vec<Value>, Map<String, Value>);

impl From<WireRequest> for Request {
    fn from(WireRequest(session, command, args, kwargs): WireRequest) -> Self {
        Self {
            session,
            command,
            args,
            kwargs,
        }
    }
}

impl From<Request> for WireRequest {
    fn from(request: Request) -> Self {
        WireRequest(request.session, request.command, request.args, request.kwargs)
    }
}

impl Request {
    pub fn new(
        session: SessionId,
        command: impl Into<String>,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> Self {
        Self {
            session,
            command: command.into(),
            args,
            kwargs,
        }
    }

    /// Build a control request such as `^ping`.
    pub fn control(session: SessionId, command: ControlCommand, kwargs: Map<String, Value>) -> Self {
        Self::new(session, command.wire_name(), Vec::new(), kwargs)
    }

    /// The control-command name without its escape, if this is a control request.
    pub fn control_name(&self) -> Option<&str> {
        self.command.strip_prefix(ProxyConfig::ESCAPE)
    }
}

/// Outcome category of a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Ok,
    Error,
    /// A non-blocking task is still running.
    Waiting,
}

/// One reply from the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,
}

impl Reply {
    pub fn ok() -> Self {
        Self {
            status: Status::Ok,
            value: None,
            msg: None,
        }
    }

    pub fn value(value: Value) -> Self {
        Self {
            status: Status::Ok,
            value: Some(value),
            msg: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            status: Status::Error,
            value: None,
            msg: Some(msg.into()),
        }
    }

    pub fn waiting(msg: impl Into<String>) -> Self {
        Self {
            status: Status::Waiting,
            value: None,
            msg: Some(msg.into()),
        }
    }

    pub fn with_msg(mut self, msg: impl Into<String>) -> Self {
        self.msg = Some(msg.into());
        self
    }

    pub fn is_ok(&self) -> bool {
        self.status == Status::Ok
    }

    pub fn is_error(&self) -> bool {
        self.status == Status::Error
    }

    pub fn is_waiting(&self) -> bool {
        self.status == Status::Waiting
    }

    /// Unwrap the envelope: the value (or `null`) on `ok`, `ProxyError::Remote` otherwise.
    pub fn into_result(self) -> Result<Value> {
        match self.status {
            Status::Ok => Ok(self.value.unwrap_or(Value::Null)),
            Status::Error => Err(ProxyError::Remote(
                self.msg.unwrap_or_else(|| "unspecified server error".to_string()),
            )),
            Status::Waiting => Err(ProxyError::Remote(
                self.msg.unwrap_or_else(|| "task still running".to_string()),
            )),
        }
    }
}

/// Commands the server handles itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlCommand {
    Ping,
    Disconnect,
    Admin,
    Stats,
    Result,
    Abort,
    Api,
    Kill,
}

impl ControlCommand {
    pub const ALL: [ControlCommand; 8] = [
        ControlCommand::Ping,
        ControlCommand::Disconnect,
        ControlCommand::Admin,
        ControlCommand::Stats,
        ControlCommand::Result,
        ControlCommand::Abort,
        ControlCommand::Api,
        ControlCommand::Kill,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ControlCommand::Ping => "ping",
            ControlCommand::Disconnect => "disconnect",
            ControlCommand::Admin => "admin",
            ControlCommand::Stats => "stats",
            ControlCommand::Result => "result",
            ControlCommand::Abort => "abort",
            ControlCommand::Api => "api",
            ControlCommand::Kill => "kill",
        }
    }

    /// Parse a control name (without escape). Matching is case-insensitive.
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|command| command.as_str().eq_ignore_ascii_case(name))
    }

    /// The command as sent on the wire, e.g. `^ping`.
    pub fn wire_name(&self) -> String {
        format!("{}{}", ProxyConfig::ESCAPE, self.as_str())
    }
}

/// Keyword arguments of an `^admin` request.
pub fn admin_kwargs(admin: Option<bool>, force: bool) -> Map<String, Value> {
    let mut kwargs = Map::new();
    kwargs.insert("admin".to_string(), json!(admin));
    kwargs.insert("force".to_string(), json!(force));
    kwargs
}

/// Arguments of a device call, with typed extraction helpers for handlers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Args {
    pub positional: Vec<Value>,
    pub keyword: Map<String, Value>,
}

impl Args {
    pub fn new(positional: Vec<Value>, keyword: Map<String, Value>) -> Self {
        Self {
            positional,
            keyword,
        }
    }

    pub fn len(&self) -> usize {
        self.positional.len() + self.keyword.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positional.is_empty() && self.keyword.is_empty()
    }

    /// Positional argument `index`, decoded as `T`.
    pub fn arg<T: DeserializeOwned>(&self, index: usize) -> std::result::Result<T, DeviceError> {
        let value = self
            .positional
            .get(index)
            .ok_or_else(|| DeviceError::MissingArgument(format!("#{index}")))?;
        decode_arg(&format!("#{index}"), value)
    }

    /// Keyword argument `name`, decoded as `T`; `None` when absent.
    pub fn kwarg<T: DeserializeOwned>(&self, name: &str) -> std::result::Result<Option<T>, DeviceError> {
        self.keyword
            .get(name)
            .map(|value| decode_arg(name, value))
            .transpose()
    }

    /// Argument given either at position `index` or as keyword `name`.
    pub fn arg_or_kwarg<T: DeserializeOwned>(
        &self,
        index: usize,
        name: &str,
    ) -> std::result::Result<T, DeviceError> {
        self.optional(index, name)?
            .ok_or_else(|| DeviceError::MissingArgument(name.to_string()))
    }

    /// Like `arg_or_kwarg`, falling back to `default` when neither is given.
    pub fn arg_or_default<T: DeserializeOwned>(
        &self,
        index: usize,
        name: &str,
        default: T,
    ) -> std::result::Result<T, DeviceError> {
        Ok(self.optional(index, name)?.unwrap_or(default))
    }

    fn optional<T: DeserializeOwned>(
        &self,
        index: usize,
        name: &str,
    ) -> std::result::Result<Option<T>, DeviceError> {
        match self.positional.get(index) {
            Some(value) => decode_arg(name, value).map(Some),
            None => self.kwarg(name),
        }
    }
}

fn decode_arg<T: DeserializeOwned>(name: &str, value: &Value) -> std::result::Result<T, DeviceError> {
    T::deserialize(value).map_err(|e| DeviceError::invalid(name, e.to_string()))
}

/// Encode a value for the wire.
pub fn to_wire<T: Serialize + ?Sized>(value: &T) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| ProxyError::Serialization {
        message: e.to_string(),
    })
}

/// Decode a value received from the wire.
pub fn from_wire<T: DeserializeOwned>(value: Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| ProxyError::Serialization {
        message: e.to_string(),
    })
}

/// Wrap raw bytes as `{"$bytes": "<base64>"}` so they survive JSON.
pub fn bytes_to_value(bytes: &[u8]) -> Value {
    json!({ BYTES_KEY: STANDARD.encode(bytes) })
}

/// Inverse of `bytes_to_value`. Returns `None` for anything else.
pub fn value_to_bytes(value: &Value) -> Option<Vec<u8>> {
    let object = value.as_object()?;
    if object.len() != 1 {
        return None;
    }
    let encoded = object.get(BYTES_KEY)?.as_str()?;
    STANDARD.decode(encoded).ok()
}

/// Read a length-prefixed frame from an async reader.
///
/// Frame format: `[4-byte BE u32 length][payload bytes]`
///
/// Returns `None` on clean EOF (peer closed connection).
pub async fn read_frame<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    max_size: usize,
) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;

    if len > max_size {
        return Err(ProxyError::Protocol {
            message: format!("message size {} exceeds maximum {}", len, max_size),
        });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    Ok(Some(payload))
}

/// Write a length-prefixed frame to an async writer.
///
/// Frame format: `[4-byte BE u32 length][payload bytes]`
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    let len = u32::try_from(payload.len()).map_err(|_| ProxyError::Protocol {
        message: format!("message size {} does not fit a frame", payload.len()),
    })?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}
