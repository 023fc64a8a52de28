//! labproxy - remote invocation of laboratory device drivers.
//!
//! A [`Server`] owns one device instance and exposes the capabilities its type
//! declares (see [`Device`]) to any number of clients over TCP. One client at
//! a time may hold the admin slot and call admin-gated capabilities; the
//! others observe. Long-running methods can be declared non-blocking: the
//! server starts them in the background, and clients poll for the result or
//! abort them through the device's interrupt handler. Clients that stop
//! sending heartbeats are evicted.
//!
//! # Example
//!
//! ```rust,ignore
//! use labproxy::{ClientOptions, ClientProxy, Server, ServerOptions};
//!
//! #[tokio::main]
//! async fn main() -> labproxy::Result<()> {
//!     let mut server = Server::<MyMotor>::new(ServerOptions::default())?;
//!     let addr = server.start("127.0.0.1:0").await?;
//!
//!     let motor = ClientProxy::connect(addr.to_string(), vec![], Default::default(), ClientOptions::default()).await?;
//!     let pos = motor.get("position").await?;
//!     println!("Motor at {}", pos);
//!
//!     motor.shutdown().await;
//!     server.stop().await;
//!     Ok(())
//! }
//! ```

pub mod cancel;
pub mod client;
pub mod config;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod server;

#[cfg(test)]
mod test_support;

// Used by `device_client!` expansions.
pub use serde_json;

// Re-export commonly used types
pub use cancel::CancellationToken;
pub use client::ClientProxy;
pub use config::{ClientOptions, ProxyConfig, ServerOptions};
pub use error::{DeviceError, ProxyError, RegistryError, Result};
pub use protocol::{bytes_to_value, value_to_bytes, Args, ControlCommand, Reply, Request, SessionId, Status};
pub use registry::{Capability, CapabilityKind, CapabilityTable, Device, Policy, Registry, RegistryBuilder};
pub use server::{AdminSlot, Dispatcher, Server};
