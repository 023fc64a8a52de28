//! A simulated single-axis motor.
//!
//! The motor travels at a fixed speed toward its target, so a move of
//! `distance` units takes `distance / speed` seconds. Moves run as
//! non-blocking capabilities and can be stopped through the `abort`
//! interrupt, which reports where the motor came to rest.

use labproxy::{bytes_to_value, Args, Device, DeviceError, Policy, RegistryBuilder};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// How often a running move updates its position and checks for aborts.
const STEP_INTERVAL: Duration = Duration::from_millis(10);

/// Default travel speed in units per second.
pub const DEFAULT_SPEED: f64 = 10.0;

#[derive(Debug, Clone, Copy)]
struct MotorState {
    position: f64,
    speed: f64,
    moving: bool,
}

/// The motor driver exposed by the demo server.
pub struct DummyMotor {
    state: Mutex<MotorState>,
    /// Bumped by every abort; a running move stops when it changes.
    aborts: AtomicU64,
}

impl DummyMotor {
    pub fn new(position: f64, speed: f64) -> Result<Self, DeviceError> {
        check_speed(speed)?;
        Ok(Self {
            state: Mutex::new(MotorState {
                position,
                speed,
                moving: false,
            }),
            aborts: AtomicU64::new(0),
        })
    }

    fn state(&self) -> MutexGuard<'_, MotorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn position(&self) -> f64 {
        self.state().position
    }

    pub fn speed(&self) -> f64 {
        self.state().speed
    }

    pub fn is_moving(&self) -> bool {
        self.state().moving
    }

    pub fn status(&self) -> &'static str {
        if self.is_moving() {
            "MOVING"
        } else {
            "IDLE"
        }
    }

    /// Travel to `target`, returning the final position.
    ///
    /// Blocks the calling thread for the duration of the move. Fails if
    /// another move is in progress or if the move is aborted.
    pub fn move_to(&self, target: f64) -> Result<f64, DeviceError> {
        if !target.is_finite() {
            return Err(DeviceError::invalid("value", "target must be a finite number"));
        }

        let epoch = self.aborts.load(Ordering::SeqCst);
        let (start, duration, _moving) = {
            let mut state = self.state();
            if state.moving {
                return Err(DeviceError::failed("motor is already moving"));
            }
            let duration = Duration::try_from_secs_f64((target - state.position).abs() / state.speed)
                .map_err(|_| {
                    DeviceError::invalid("value", format!("move to {} would take too long", target))
                })?;
            state.moving = true;
            (state.position, duration, MovingFlag(self))
        };

        let distance = target - start;
        info!("Moving from {} to {} ({:.2}s)", start, target, duration.as_secs_f64());

        let started = Instant::now();
        loop {
            if self.aborts.load(Ordering::SeqCst) != epoch {
                let position = self.position();
                warn!("Move to {} aborted at {}", target, position);
                break Err(DeviceError::failed(format!("move aborted at {}", position)));
            }

            let elapsed = started.elapsed();
            if elapsed >= duration {
                self.state().position = target;
                break Ok(target);
            }

            let fraction = elapsed.as_secs_f64() / duration.as_secs_f64();
            self.state().position = start + distance * fraction;
            std::thread::sleep(STEP_INTERVAL);
        }
    }

    /// Stop any running move and report the current position.
    pub fn abort(&self) -> f64 {
        self.aborts.fetch_add(1, Ordering::SeqCst);
        let position = self.position();
        debug!("Abort requested at {}", position);
        position
    }

    /// Wait until the motor is idle.
    pub fn check_done(&self) {
        while self.is_moving() {
            std::thread::sleep(STEP_INTERVAL);
        }
    }

    /// The reply a serial controller would send for a position query.
    pub fn controller_reply(&self) -> Vec<u8> {
        format!("POS {:.3}\r\n", self.position()).into_bytes()
    }
}

/// Clears `moving` when a move ends, however it ends.
struct MovingFlag<'a>(&'a DummyMotor);

impl Drop for MovingFlag<'_> {
    fn drop(&mut self) {
        self.0.state().moving = false;
    }
}

fn check_speed(speed: f64) -> Result<(), DeviceError> {
    if speed.is_finite() && speed > 0.0 {
        Ok(())
    } else {
        Err(DeviceError::invalid("speed", "speed must be a positive number"))
    }
}

fn number(name: &str, value: &Value) -> Result<f64, DeviceError> {
    value
        .as_f64()
        .ok_or_else(|| DeviceError::invalid(name, "expected a number"))
}

impl Device for DummyMotor {
    /// Arguments: `speed` (units per second, default 10) and `position`
    /// (starting position, default 0), positional or keyword.
    fn construct(args: &Args) -> Result<Self, DeviceError> {
        let speed = args.arg_or_default(0, "speed", DEFAULT_SPEED)?;
        let position = args.arg_or_default(1, "position", 0.0)?;
        DummyMotor::new(position, speed)
    }

    fn register(registry: &mut RegistryBuilder<Self>) {
        registry
            .method("status", Policy::new(), |motor, _| Ok(json!(motor.status())))
            .method("get_pos", Policy::new(), |motor, _| Ok(json!(motor.position())))
            .method("set_pos", Policy::new().admin().non_blocking(), |motor, args| {
                let target: f64 = args.arg_or_kwarg(0, "value")?;
                Ok(json!(motor.move_to(target)?))
            })
            .method("check_done", Policy::new(), |motor, _| {
                motor.check_done();
                Ok(Value::Null)
            })
            .method("controller_reply", Policy::new(), |motor, _| {
                Ok(bytes_to_value(&motor.controller_reply()))
            })
            .read_only("pos", |motor| Ok(json!(motor.position())))
            .property(
                "speed",
                Policy::new().admin(),
                |motor: &DummyMotor| Ok(json!(motor.speed())),
                |motor: &DummyMotor, value: Value| {
                    let speed = number("speed", &value)?;
                    check_speed(speed)?;
                    motor.state().speed = speed;
                    Ok(())
                },
            )
            .interrupt("abort", |motor| Ok(json!(motor.abort())));
    }
}
