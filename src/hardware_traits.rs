// Trait-based interfaces to the collaborators around the control core.
//
// The core never talks to registers or device drivers directly. Board support
// code (or the simulator in `crate::sim`) implements these traits.

use crate::error::Result;
use std::time::Duration;

/// Monotonic time source for the control tick.
pub trait TimeInterface: Send + Sync {
    /// Time elapsed since an arbitrary, fixed epoch.
    fn now(&self) -> Duration;
}

/// Raw duty sink of one motor port.
pub trait MotorDriver: Send {
    /// Returns `Err(ServoError::Again)` while the port is still being set up.
    fn ready(&mut self) -> Result<()>;
    /// Applies a signed duty cycle in absolute units (`±MAX_DUTY`).
    fn drive(&mut self, duty: i32) -> Result<()>;
    /// Lets the motor spin freely.
    fn coast(&mut self) -> Result<()>;
}

/// Tacho/encoder reader of one motor port. Counts are motor-shaft degrees.
pub trait Encoder: Send {
    fn count(&mut self) -> Result<i32>;
    /// Angular rate in counts per second.
    fn rate(&mut self) -> Result<i32>;
    fn reset_count(&mut self, count: i32) -> Result<()>;
    /// Absolute shaft position, if the sensor has one.
    fn absolute_count(&mut self) -> Result<Option<i32>>;
}
