//! Capability registry.
//!
//! A device type lists the methods and properties it exposes by implementing
//! [`Device::register`]. The resulting [`Registry`] holds the handler closures
//! next to a descriptor-only [`CapabilityTable`] that the server shares with
//! every session and sends to clients on `^api`.
//!
//! ```
//! use labproxy::{Args, Device, DeviceError, Policy, Registry, RegistryBuilder};
//! use serde_json::json;
//! use std::sync::Mutex;
//!
//! struct Shutter {
//!     open: Mutex<bool>,
//! }
//!
//! impl Device for Shutter {
//!     fn construct(_args: &Args) -> Result<Self, DeviceError> {
//!         Ok(Shutter { open: Mutex::new(false) })
//!     }
//!
//!     fn register(registry: &mut RegistryBuilder<Self>) {
//!         registry
//!             .property(
//!                 "open",
//!                 Policy::new().admin(),
//!                 |s: &Shutter| Ok(json!(*s.open.lock().unwrap())),
//!                 |s: &Shutter, value: serde_json::Value| {
//!                     *s.open.lock().unwrap() = value.as_bool().unwrap_or(false);
//!                     Ok(())
//!                 },
//!             )
//!             .method("status", Policy::new(), |_s: &Shutter, _args: Args| Ok(json!("ready")));
//!     }
//! }
//!
//! let registry = Registry::<Shutter>::build().unwrap();
//! assert_eq!(registry.table().len(), 2);
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::config::ProxyConfig;
use crate::error::{DeviceError, RegistryError};
use crate::protocol::Args;

/// A type whose instances can be served remotely.
///
/// Handlers receive `&Self` and may run concurrently (a non-blocking task and
/// the interrupt handler overlap), so state that changes needs interior
/// mutability.
pub trait Device: Send + Sync + Sized + 'static {
    /// Build the instance from the first handshake's constructor arguments.
    fn construct(args: &Args) -> Result<Self, DeviceError>;

    /// Declare the exposed capabilities.
    fn register(registry: &mut RegistryBuilder<Self>);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityKind {
    Method,
    Property,
}

/// Descriptor of one exposed method or property.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capability {
    pub name: String,
    pub kind: CapabilityKind,
    /// For properties this gates the setter only.
    pub requires_admin: bool,
    /// Always true for properties.
    pub blocking: bool,
    pub interrupt: bool,
    /// Properties without a setter are read-only.
    #[serde(default)]
    pub writable: bool,
}

/// Access policy given to a capability at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Policy {
    requires_admin: bool,
    blocking: bool,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            requires_admin: false,
            blocking: true,
        }
    }
}

impl Policy {
    /// Open to every session, blocking.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn admin(mut self) -> Self {
        self.requires_admin = true;
        self
    }

    /// Run on a background worker; the caller polls `^result`.
    pub fn non_blocking(mut self) -> Self {
        self.blocking = false;
        self
    }
}

/// Descriptor-only view of a registry, shared by all sessions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityTable {
    capabilities: BTreeMap<String, Capability>,
}

impl CapabilityTable {
    pub fn get(&self, name: &str) -> Option<&Capability> {
        self.capabilities.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.capabilities.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Capability> {
        self.capabilities.values()
    }

    pub fn len(&self) -> usize {
        self.capabilities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.capabilities.is_empty()
    }

    pub fn interrupt_handler(&self) -> Option<&Capability> {
        self.capabilities.values().find(|c| c.interrupt)
    }
}

pub type MethodHandler<T> = Arc<dyn Fn(&T, Args) -> Result<Value, DeviceError> + Send + Sync>;
pub type Getter<T> = Arc<dyn Fn(&T) -> Result<Value, DeviceError> + Send + Sync>;
pub type Setter<T> = Arc<dyn Fn(&T, Value) -> Result<(), DeviceError> + Send + Sync>;
pub type InterruptHandler<T> = Arc<dyn Fn(&T) -> Result<Value, DeviceError> + Send + Sync>;

pub(crate) enum Handler<T> {
    Method(MethodHandler<T>),
    Property {
        getter: Getter<T>,
        setter: Option<Setter<T>>,
    },
}

impl<T> Clone for Handler<T> {
    fn clone(&self) -> Self {
        match self {
            Handler::Method(handler) => Handler::Method(handler.clone()),
            Handler::Property { getter, setter } => Handler::Property {
                getter: getter.clone(),
                setter: setter.clone(),
            },
        }
    }
}

/// Collects capability declarations for a device type.
///
/// Registration calls chain; the first declaration error is kept and reported
/// by [`Registry::build`].
pub struct RegistryBuilder<T> {
    table: CapabilityTable,
    handlers: HashMap<String, Handler<T>>,
    interrupt: Option<InterruptHandler<T>>,
    error: Option<RegistryError>,
}

impl<T: Device> RegistryBuilder<T> {
    fn new() -> Self {
        Self {
            table: CapabilityTable::default(),
            handlers: HashMap::new(),
            interrupt: None,
            error: None,
        }
    }

    /// Expose a method.
    pub fn method<F>(&mut self, name: &str, policy: Policy, handler: F) -> &mut Self
    where
        F: Fn(&T, Args) -> Result<Value, DeviceError> + Send + Sync + 'static,
    {
        let capability = Capability {
            name: name.to_string(),
            kind: CapabilityKind::Method,
            requires_admin: policy.requires_admin,
            blocking: policy.blocking,
            interrupt: false,
            writable: false,
        };
        self.insert(capability, Handler::Method(Arc::new(handler)))
    }

    /// Expose a read-write property. `policy.admin()` gates the setter;
    /// reads are open to every session.
    pub fn property<G, S>(&mut self, name: &str, policy: Policy, getter: G, setter: S) -> &mut Self
    where
        G: Fn(&T) -> Result<Value, DeviceError> + Send + Sync + 'static,
        S: Fn(&T, Value) -> Result<(), DeviceError> + Send + Sync + 'static,
    {
        let capability = Capability {
            name: name.to_string(),
            kind: CapabilityKind::Property,
            requires_admin: policy.requires_admin,
            blocking: true,
            interrupt: false,
            writable: true,
        };
        let handler = Handler::Property {
            getter: Arc::new(getter),
            setter: Some(Arc::new(setter)),
        };
        self.insert(capability, handler)
    }

    /// Expose a property without a setter.
    pub fn read_only<G>(&mut self, name: &str, getter: G) -> &mut Self
    where
        G: Fn(&T) -> Result<Value, DeviceError> + Send + Sync + 'static,
    {
        let capability = Capability {
            name: name.to_string(),
            kind: CapabilityKind::Property,
            requires_admin: false,
            blocking: true,
            interrupt: false,
            writable: false,
        };
        let handler = Handler::Property {
            getter: Arc::new(getter),
            setter: None,
        };
        self.insert(capability, handler)
    }

    /// Expose the interrupt handler that `^abort` calls while a non-blocking
    /// task runs. It is also callable as an ordinary method without arguments.
    pub fn interrupt<F>(&mut self, name: &str, handler: F) -> &mut Self
    where
        F: Fn(&T) -> Result<Value, DeviceError> + Send + Sync + 'static,
    {
        if let Some(existing) = self.table.interrupt_handler() {
            let err = RegistryError::DuplicateInterrupt {
                existing: existing.name.clone(),
                name: name.to_string(),
            };
            self.fail(err);
            return self;
        }

        let handler: InterruptHandler<T> = Arc::new(handler);
        let as_method = {
            let handler = handler.clone();
            let name = name.to_string();
            move |target: &T, args: Args| {
                if !args.is_empty() {
                    return Err(DeviceError::invalid(&name, "takes no arguments"));
                }
                handler(target)
            }
        };
        let capability = Capability {
            name: name.to_string(),
            kind: CapabilityKind::Method,
            requires_admin: false,
            blocking: true,
            interrupt: true,
            writable: false,
        };
        let before = self.table.len();
        self.insert(capability, Handler::Method(Arc::new(as_method)));
        if self.table.len() > before {
            self.interrupt = Some(handler);
        }
        self
    }

    fn insert(&mut self, capability: Capability, handler: Handler<T>) -> &mut Self {
        if let Err(err) = validate_name(&capability.name) {
            self.fail(err);
            return self;
        }
        if self.table.contains(&capability.name) {
            self.fail(RegistryError::Duplicate(capability.name));
            return self;
        }
        self.handlers.insert(capability.name.clone(), handler);
        self.table
            .capabilities
            .insert(capability.name.clone(), capability);
        self
    }

    fn fail(&mut self, err: RegistryError) {
        if self.error.is_none() {
            self.error = Some(err);
        }
    }
}

fn validate_name(name: &str) -> Result<(), RegistryError> {
    if name.is_empty() {
        return Err(RegistryError::EmptyName);
    }
    if name.starts_with(ProxyConfig::ESCAPE) {
        return Err(RegistryError::Reserved(name.to_string()));
    }
    Ok(())
}

/// Everything a server needs to know about a device type.
pub struct Registry<T> {
    table: Arc<CapabilityTable>,
    handlers: HashMap<String, Handler<T>>,
    interrupt: Option<InterruptHandler<T>>,
}

impl<T: Device> Registry<T> {
    /// Run `T::register` and validate the declarations.
    pub fn build() -> Result<Self, RegistryError> {
        let mut builder = RegistryBuilder::new();
        T::register(&mut builder);
        if let Some(err) = builder.error {
            return Err(err);
        }
        Ok(Self {
            table: Arc::new(builder.table),
            handlers: builder.handlers,
            interrupt: builder.interrupt,
        })
    }
}

impl<T> Registry<T> {
    pub fn table(&self) -> &Arc<CapabilityTable> {
        &self.table
    }

    pub(crate) fn handler(&self, name: &str) -> Option<Handler<T>> {
        self.handlers.get(name).cloned()
    }

    pub(crate) fn interrupt(&self) -> Option<InterruptHandler<T>> {
        self.interrupt.clone()
    }
}

impl<T> std::fmt::Debug for Registry<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("table", &self.table)
            .field("has_interrupt", &self.interrupt.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::Stage;
    use serde_json::json;

    #[test]
    fn test_build_collects_descriptors() {
        let registry = Registry::<Stage>::build().unwrap();
        let table = registry.table();

        let x = table.get("x").unwrap();
        assert_eq!(x.kind, CapabilityKind::Property);
        assert!(x.requires_admin);
        assert!(x.blocking);
        assert!(x.writable);

        let slow = table.get("slow").unwrap();
        assert_eq!(slow.kind, CapabilityKind::Method);
        assert!(!slow.blocking);
        assert!(!slow.requires_admin);

        assert_eq!(table.interrupt_handler().map(|c| c.name.as_str()), Some("stop"));
        assert!(registry.interrupt().is_some());
        assert!(registry.handler("double").is_some());
        assert!(registry.handler("missing").is_none());
    }

    #[test]
    fn test_table_serializes_for_api() {
        let registry = Registry::<Stage>::build().unwrap();
        let value = serde_json::to_value(registry.table().as_ref()).unwrap();
        let back: CapabilityTable = serde_json::from_value(value.clone()).unwrap();
        assert_eq!(&back, registry.table().as_ref());
        assert_eq!(value["capabilities"]["slow"]["blocking"], json!(false));
    }

    struct TwoInterrupts;

    impl Device for TwoInterrupts {
        fn construct(_args: &Args) -> Result<Self, DeviceError> {
            Ok(TwoInterrupts)
        }

        fn register(registry: &mut RegistryBuilder<Self>) {
            registry
                .interrupt("stop", |_| Ok(Value::Null))
                .interrupt("halt", |_| Ok(Value::Null));
        }
    }

    #[test]
    fn test_second_interrupt_is_rejected() {
        let err = Registry::<TwoInterrupts>::build().unwrap_err();
        assert_eq!(
            err,
            RegistryError::DuplicateInterrupt {
                existing: "stop".into(),
                name: "halt".into(),
            }
        );
    }

    struct BadNames;

    impl Device for BadNames {
        fn construct(_args: &Args) -> Result<Self, DeviceError> {
            Ok(BadNames)
        }

        fn register(registry: &mut RegistryBuilder<Self>) {
            registry
                .method("go", Policy::new(), |_, _| Ok(Value::Null))
                .method("go", Policy::new().admin(), |_, _| Ok(Value::Null))
                .method("^sneaky", Policy::new(), |_, _| Ok(Value::Null));
        }
    }

    #[test]
    fn test_first_declaration_error_wins() {
        let err = Registry::<BadNames>::build().unwrap_err();
        assert_eq!(err, RegistryError::Duplicate("go".into()));
    }

    #[test]
    fn test_reserved_and_empty_names() {
        assert_eq!(validate_name(""), Err(RegistryError::EmptyName));
        assert_eq!(validate_name("^ping"), Err(RegistryError::Reserved("^ping".into())));
        assert_eq!(validate_name("abort"), Ok(()));
        assert_eq!(validate_name("move_to"), Ok(()));
    }
}
