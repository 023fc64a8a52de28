//! Devices shared by the unit tests.

use serde_json::{json, Value};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::error::DeviceError;
use crate::protocol::Args;
use crate::registry::{Device, Policy, RegistryBuilder};

/// A translation stage with one admin-gated property and a slow move.
pub(crate) struct Stage {
    x: AtomicI64,
    /// Bumped by every stop; a running move quits when it changes.
    stops: AtomicU64,
    /// How many times `pause` ran.
    pauses: AtomicU64,
}

impl Stage {
    pub(crate) fn new(x: i64) -> Self {
        Stage {
            x: AtomicI64::new(x),
            stops: AtomicU64::new(0),
            pauses: AtomicU64::new(0),
        }
    }

    pub(crate) fn pauses(&self) -> u64 {
        self.pauses.load(Ordering::SeqCst)
    }

    fn slow(&self, args: Args) -> Result<Value, DeviceError> {
        let millis: u64 = args.arg_or_kwarg(0, "millis")?;
        let value: Value = args.arg_or_default(1, "value", Value::Null)?;
        let epoch = self.stops.load(Ordering::SeqCst);

        let deadline = Instant::now() + Duration::from_millis(millis);
        while Instant::now() < deadline {
            if self.stops.load(Ordering::SeqCst) != epoch {
                return Err(DeviceError::failed("stopped early"));
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        Ok(value)
    }
}

impl Device for Stage {
    fn construct(args: &Args) -> Result<Self, DeviceError> {
        if args.kwarg::<bool>("fail")?.unwrap_or(false) {
            return Err(DeviceError::failed("stage controller not found"));
        }
        Ok(Stage::new(args.arg_or_default(0, "x", 0)?))
    }

    fn register(registry: &mut RegistryBuilder<Self>) {
        registry
            .property(
                "x",
                Policy::new().admin(),
                |stage: &Stage| Ok(json!(stage.x.load(Ordering::SeqCst))),
                |stage: &Stage, value: Value| {
                    let x = value
                        .as_i64()
                        .ok_or_else(|| DeviceError::invalid("x", "expected an integer"))?;
                    stage.x.store(x, Ordering::SeqCst);
                    Ok(())
                },
            )
            .read_only("label", |_| Ok(json!("stage-1")))
            .method("double", Policy::new(), |_, args| {
                let n: i64 = args.arg(0)?;
                Ok(json!(n * 2))
            })
            .method("home", Policy::new().admin(), |stage, _| {
                stage.x.store(0, Ordering::SeqCst);
                Ok(Value::Null)
            })
            .method("fail", Policy::new(), |_, _| {
                Err(DeviceError::failed("limit switch hit"))
            })
            .method("panic", Policy::new(), |_, _| -> Result<Value, DeviceError> {
                panic!("driver bug")
            })
            .method("pause", Policy::new(), |stage, args| {
                let millis: u64 = args.arg(0)?;
                stage.pauses.fetch_add(1, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(millis));
                Ok(json!(millis))
            })
            .method("slow", Policy::new().non_blocking(), |stage, args| stage.slow(args))
            .interrupt("stop", |stage| {
                stage.stops.fetch_add(1, Ordering::SeqCst);
                Ok(json!("interrupted"))
            });
    }
}

/// A device whose interrupt handler fails.
pub(crate) struct Jammed;

impl Device for Jammed {
    fn construct(_args: &Args) -> Result<Self, DeviceError> {
        Ok(Jammed)
    }

    fn register(registry: &mut RegistryBuilder<Self>) {
        registry
            .method("nap", Policy::new().non_blocking(), |_, args| {
                let millis: u64 = args.arg(0)?;
                std::thread::sleep(Duration::from_millis(millis));
                Ok(json!("rested"))
            })
            .interrupt("stop", |_| Err(DeviceError::failed("brake stuck")));
    }
}

/// A device with nothing to interrupt its slow call.
pub(crate) struct Sleeper;

impl Device for Sleeper {
    fn construct(_args: &Args) -> Result<Self, DeviceError> {
        Ok(Sleeper)
    }

    fn register(registry: &mut RegistryBuilder<Self>) {
        registry.method("nap", Policy::new().non_blocking(), |_, args| {
            let millis: u64 = args.arg(0)?;
            std::thread::sleep(Duration::from_millis(millis));
            Ok(json!("rested"))
        });
    }
}
