//! # Servo Controller Configuration
//!
//! ## Example: TOML Configuration
//!
//! ```toml
//! [poller]
//! period_ms = 5
//! wait_interval_ms = 5
//!
//! [retry]
//! max_attempts = 10
//! interval_ms = 100
//!
//! [motors.A]
//! kind = "servo"
//! direction = "counterclockwise"
//! gears = [[12, 20, 36], [20, 40]]
//!
//! [motors.A.control.limits]
//! speed = 500
//! acceleration = 1000
//! actuation = 80
//!
//! [motors.B]
//! kind = "dc"
//! ```
//!
//! Control overrides are in output-shaft units and replace the defaults
//! derived from the gear ratio.

// src/config.rs - Single configuration file
use crate::control::{ControlSettings, Gears, Limits, PidSettings, StallTolerances, TargetTolerances};
use crate::dcmotor::Direction;
use crate::error::ServoError;
use crate::port::Port;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid motor configuration on port {port}: {source}")]
    Motor { port: Port, source: ServoError },
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub poller: PollerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub motors: BTreeMap<Port, MotorConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PollerConfig {
    /// Control tick period.
    #[serde(default = "default_period_ms")]
    pub period_ms: u64,
    /// How often a waiting command checks for completion.
    #[serde(default = "default_wait_interval_ms")]
    pub wait_interval_ms: u64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            period_ms: default_period_ms(),
            wait_interval_ms: default_wait_interval_ms(),
        }
    }
}

impl PollerConfig {
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms.max(1))
    }

    pub fn wait_interval(&self) -> Duration {
        Duration::from_millis(self.wait_interval_ms.max(1))
    }
}

/// Bounded retry while a port is still being set up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_interval_ms")]
    pub interval_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            interval_ms: default_retry_interval_ms(),
        }
    }
}

impl RetryConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MotorKind {
    Dc,
    #[default]
    Servo,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct MotorConfig {
    #[serde(default)]
    pub kind: MotorKind,
    #[serde(default)]
    pub direction: Direction,
    #[serde(default)]
    pub gears: Option<Gears>,
    #[serde(default)]
    pub control: ControlOverrides,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ControlOverrides {
    pub limits: Option<Limits>,
    pub pid: Option<PidSettings>,
    pub target_tolerances: Option<TargetTolerances>,
    pub stall_tolerances: Option<StallTolerances>,
}

impl MotorConfig {
    /// Control settings for this motor: gear-derived defaults plus overrides.
    pub fn control_settings(&self) -> Result<ControlSettings, ServoError> {
        let mut settings = ControlSettings::from_gears(self.gears.as_ref())?;
        if let Some(limits) = self.control.limits {
            settings.set_limits(limits)?;
        }
        if let Some(pid) = self.control.pid {
            settings.set_pid(pid)?;
        }
        if let Some(tolerances) = self.control.target_tolerances {
            settings.set_target_tolerances(tolerances)?;
        }
        if let Some(tolerances) = self.control.stall_tolerances {
            settings.set_stall_tolerances(tolerances)?;
        }
        Ok(settings)
    }
}

impl Config {
    /// Checks every motor section without touching hardware.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (&port, motor) in &self.motors {
            motor
                .control_settings()
                .map_err(|source| ConfigError::Motor { port, source })?;
        }
        Ok(())
    }
}

fn default_period_ms() -> u64 { 5 }
fn default_wait_interval_ms() -> u64 { 5 }
fn default_max_attempts() -> u32 { 10 }
fn default_retry_interval_ms() -> u64 { 100 }

pub fn load_config(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path).map_err(|e| {
        tracing::error!("Failed to read config file '{}': {}", path.display(), e);
        ConfigError::Io(e)
    })?;
    let config: Config = toml::from_str(&contents).map_err(|e| {
        tracing::error!("Failed to parse config TOML: {}", e);
        ConfigError::Toml(e)
    })?;
    config.validate().inspect_err(|e| tracing::error!("{}", e))?;
    tracing::info!(
        "Loaded configuration from '{}' with {} motor(s)",
        path.display(),
        config.motors.len()
    );
    Ok(config)
}
