// src/dcmotor.rs - DC actuator layer: signed duty commands with direction and duty ceiling
use crate::error::{Result, ServoError};
use crate::hardware_traits::MotorDriver;
use crate::port::Port;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Absolute duty range of the motor drivers.
pub const MAX_DUTY: i32 = 10_000;
/// Scale from a duty percentage to absolute duty units.
pub const DUTY_PCT_TO_ABS: i32 = MAX_DUTY / 100;

/// Positive direction of the motor as seen by the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    Clockwise,
    Counterclockwise,
}

impl Direction {
    /// Sign applied to every duty command and encoder reading.
    pub fn sign(self) -> i32 {
        match self {
            Direction::Clockwise => 1,
            Direction::Counterclockwise => -1,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Clockwise => write!(f, "clockwise"),
            Direction::Counterclockwise => write!(f, "counterclockwise"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DcMotorSettings {
    pub direction: Direction,
    /// Duty ceiling in absolute units, `0..=MAX_DUTY`.
    pub max_duty: i32,
}

impl Default for DcMotorSettings {
    fn default() -> Self {
        Self {
            direction: Direction::Clockwise,
            max_duty: MAX_DUTY,
        }
    }
}

/// What the driver was last told to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveState {
    Coast,
    Brake,
    Duty(i32),
}

pub struct DcMotor {
    port: Port,
    driver: Box<dyn MotorDriver>,
    settings: DcMotorSettings,
    state: DriveState,
}

impl DcMotor {
    pub fn new(port: Port, driver: Box<dyn MotorDriver>) -> Self {
        Self {
            port,
            driver,
            settings: DcMotorSettings::default(),
            state: DriveState::Coast,
        }
    }

    /// Prepares the motor for use. Returns `ServoError::Again` while the
    /// driver is still setting up; callers decide how often to retry.
    pub fn setup(&mut self, direction: Direction) -> Result<()> {
        self.driver.ready()?;
        self.coast()?;
        self.settings = DcMotorSettings {
            direction,
            max_duty: MAX_DUTY,
        };
        Ok(())
    }

    pub fn port(&self) -> Port {
        self.port
    }

    pub fn settings(&self) -> DcMotorSettings {
        self.settings
    }

    pub fn state(&self) -> DriveState {
        self.state
    }

    /// Sets the duty ceiling as a percentage of the absolute duty range.
    pub fn set_max_duty_pct(&mut self, max_duty_pct: i32) -> Result<()> {
        if !(0..=100).contains(&max_duty_pct) {
            return Err(ServoError::invalid_arg(format!(
                "duty limit {max_duty_pct}% outside 0..=100"
            )));
        }
        self.coast()?;
        self.settings.max_duty = max_duty_pct * DUTY_PCT_TO_ABS;
        Ok(())
    }

    pub fn coast(&mut self) -> Result<()> {
        self.state = DriveState::Coast;
        self.driver.coast()
    }

    pub fn brake(&mut self) -> Result<()> {
        self.state = DriveState::Brake;
        self.driver.drive(0)
    }

    /// Drives the motor with a duty in absolute units, clipped to the duty
    /// ceiling and sign-flipped for inverted motors.
    pub fn set_duty_cycle_int(&mut self, duty: i32) -> Result<()> {
        let limit = self.settings.max_duty;
        let duty = duty.clamp(-limit, limit);
        self.state = DriveState::Duty(duty);
        self.driver.drive(duty * self.settings.direction.sign())
    }

    /// Drives the motor with a user duty percentage.
    pub fn set_duty_cycle_usr(&mut self, duty_pct: i32) -> Result<()> {
        self.set_duty_cycle_int(duty_pct.saturating_mul(DUTY_PCT_TO_ABS))
    }
}

impl fmt::Display for DcMotor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Motor properties:\n------------------------\nPort\t\t {}\nPositive dir.\t {}\nTorque limit\t {}",
            self.port,
            self.settings.direction,
            self.settings.max_duty / DUTY_PCT_TO_ABS
        )
    }
}

impl fmt::Debug for DcMotor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DcMotor")
            .field("port", &self.port)
            .field("settings", &self.settings)
            .field("state", &self.state)
            .finish()
    }
}
