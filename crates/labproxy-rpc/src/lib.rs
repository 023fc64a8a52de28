//! Demo device server for labproxy.
//!
//! Exposes [`DummyMotor`], a simulated motor, and [`MotorClient`], its typed
//! client. The `labproxy-rpc` binary serves the motor over TCP.

pub mod motor;

pub use motor::{DummyMotor, DEFAULT_SPEED};

labproxy::device_client! {
    /// Typed client for a [`DummyMotor`] server.
    pub struct MotorClient {
        /// "IDLE" or "MOVING".
        fn status() -> String;
        fn get_pos() -> f64;
        /// Move to `value` and wait for the move to finish. Requires admin.
        fn set_pos(value: f64) -> f64;
        fn check_done() -> ();
        /// Stop the motor; returns where it stopped.
        fn abort() -> f64;
        property pos: f64;
        property speed / set_speed: f64;
    }
}
