//! Closed-loop motor control core.
//!
//! A [`poller::MotorPoller`] owns one [`motor::Actuator`] per [`port::Port`].
//! Servos plan a trapezoidal [`control::Trajectory`] for every command and
//! follow it with PID + feedforward on each control tick, detecting stalls
//! and completion along the way. [`handle::MotorHandle`] is the command API
//! for foreground callers.

pub mod config;
pub mod control;
pub mod dcmotor;
pub mod error;
pub mod handle;
pub mod hardware_traits;
pub mod log;
pub mod motor;
pub mod poller;
pub mod port;
pub mod servo;
pub mod sim;

pub use config::{load_config, Config, ConfigError};
pub use control::{Mode, Then};
pub use error::{Result, ServoError};
pub use handle::MotorHandle;
pub use motor::Actuator;
pub use poller::{MotorPoller, SharedPoller};
pub use port::Port;
pub use servo::{ResetAngle, Servo};
