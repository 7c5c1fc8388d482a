// src/handle.rs - Foreground command API for one port
//
// A `MotorHandle` is what a binding layer holds. Every call locks the motor
// table for the duration of one synchronous operation; waiting happens with
// the lock released so the control tick keeps running.

use crate::control::{Limits, PidSettings, StallTolerances, TargetTolerances, Then, TrajectoryInfo};
use crate::error::Result;
use crate::log::LogSample;
use crate::motor::Actuator;
use crate::poller::{self, SharedPoller};
use crate::port::Port;
use crate::servo::{ResetAngle, Servo};
use std::time::Duration;

#[derive(Clone)]
pub struct MotorHandle {
    poller: SharedPoller,
    port: Port,
    wait_interval: Duration,
}

/// Restores the actuation limit of a servo when dropped.
struct ActuationOverride {
    poller: SharedPoller,
    port: Port,
    previous: i32,
}

impl Drop for ActuationOverride {
    fn drop(&mut self) {
        let restored = poller::lock(&self.poller).and_then(|mut table| {
            table
                .servo_mut(self.port)
                .map(|servo| servo.control_mut().restore_actuation_limit(self.previous))
        });
        if let Err(e) = restored {
            tracing::warn!("Could not restore actuation limit on port {}: {}", self.port, e);
        }
    }
}

impl MotorHandle {
    pub fn new(poller: SharedPoller, port: Port, wait_interval: Duration) -> Self {
        Self {
            poller,
            port,
            wait_interval,
        }
    }

    pub fn port(&self) -> Port {
        self.port
    }

    fn with_actuator<R>(&self, f: impl FnOnce(&mut Actuator) -> Result<R>) -> Result<R> {
        let mut table = poller::lock(&self.poller)?;
        f(table.actuator_mut(self.port)?)
    }

    fn with_servo<R>(&self, f: impl FnOnce(&mut Servo) -> Result<R>) -> Result<R> {
        let mut table = poller::lock(&self.poller)?;
        f(table.servo_mut(self.port)?)
    }

    /// Issues a maneuver, dropping any fault left over from the previous one.
    fn command(&self, f: impl FnOnce(&mut Servo) -> Result<()>) -> Result<()> {
        let mut table = poller::lock(&self.poller)?;
        table.take_fault(self.port);
        f(table.servo_mut(self.port)?)
    }

    /// Polls until the running maneuver is done or stalled, or the control
    /// tick reports a fault.
    pub async fn wait_done(&self) -> Result<()> {
        loop {
            {
                let mut table = poller::lock(&self.poller)?;
                if let Some(fault) = table.take_fault(self.port) {
                    return Err(fault);
                }
                let servo = table.servo(self.port)?;
                if servo.done() || servo.stalled() {
                    return Ok(());
                }
            }
            tokio::time::sleep(self.wait_interval).await;
        }
    }

    // Any actuator.

    pub fn dc(&self, duty_pct: i32) -> Result<()> {
        self.with_actuator(|actuator| actuator.dc(duty_pct))
    }

    pub fn stop(&self) -> Result<()> {
        self.with_actuator(Actuator::stop)
    }

    pub fn brake(&self) -> Result<()> {
        self.with_actuator(Actuator::brake)
    }

    pub fn dc_settings(&self) -> Result<i32> {
        self.with_actuator(|actuator| Ok(actuator.dc_settings()))
    }

    pub fn set_dc_settings(&self, max_duty_pct: i32) -> Result<()> {
        self.with_actuator(|actuator| actuator.set_dc_settings(max_duty_pct))
    }

    pub fn describe(&self) -> Result<String> {
        self.with_actuator(|actuator| Ok(actuator.to_string()))
    }

    // Servo maneuvers.

    pub fn run(&self, speed: i32) -> Result<()> {
        self.command(|servo| servo.run(speed))
    }

    pub async fn run_time(&self, speed: i32, duration_ms: i64, then: Then, wait: bool) -> Result<()> {
        self.command(|servo| servo.run_time(speed, duration_ms, then))?;
        if wait {
            self.wait_done().await?;
        }
        Ok(())
    }

    pub async fn run_angle(&self, speed: i32, angle: i32, then: Then, wait: bool) -> Result<()> {
        self.command(|servo| servo.run_angle(speed, angle, then))?;
        if wait {
            self.wait_done().await?;
        }
        Ok(())
    }

    pub async fn run_target(&self, speed: i32, target: i32, then: Then, wait: bool) -> Result<()> {
        self.command(|servo| servo.run_target(speed, target, then))?;
        if wait {
            self.wait_done().await?;
        }
        Ok(())
    }

    /// Runs until stalled and returns the angle at which the stall began.
    ///
    /// With `duty_limit` (percent) the actuation limit is lowered for the
    /// duration of the call and restored on every exit path.
    pub async fn run_until_stalled(&self, speed: i32, then: Then, duty_limit: Option<i32>) -> Result<i32> {
        let _override = match duty_limit {
            Some(limit) => {
                let previous = self.with_servo(|servo| servo.control_mut().override_actuation_limit(limit))?;
                Some(ActuationOverride {
                    poller: self.poller.clone(),
                    port: self.port,
                    previous,
                })
            }
            None => None,
        };
        self.command(|servo| servo.run_until_stalled(speed, then))?;
        self.wait_done().await?;
        self.with_servo(|servo| match servo.stall_angle() {
            Some(angle) => Ok(angle),
            None => servo.angle(),
        })
    }

    pub fn track_target(&self, target: i32) -> Result<()> {
        self.command(|servo| servo.track_target(target))
    }

    pub fn hold(&self) -> Result<()> {
        self.command(Servo::hold)
    }

    // Telemetry.

    pub fn angle(&self) -> Result<i32> {
        self.with_servo(Servo::angle)
    }

    pub fn speed(&self) -> Result<i32> {
        self.with_servo(Servo::speed)
    }

    pub fn reset_angle(&self, reset: ResetAngle) -> Result<()> {
        self.with_servo(|servo| servo.reset_angle(reset))
    }

    pub fn done(&self) -> Result<bool> {
        self.with_servo(|servo| Ok(servo.done()))
    }

    pub fn stalled(&self) -> Result<bool> {
        self.with_servo(|servo| Ok(servo.stalled()))
    }

    pub fn trajectory(&self) -> Result<TrajectoryInfo> {
        self.with_servo(|servo| Ok(servo.trajectory()))
    }

    pub fn scale(&self) -> Result<f64> {
        self.with_servo(|servo| Ok(servo.scale()))
    }

    // Settings.

    pub fn limits(&self) -> Result<Limits> {
        self.with_servo(|servo| Ok(servo.limits()))
    }

    pub fn set_limits(&self, limits: Limits) -> Result<()> {
        self.with_servo(|servo| servo.set_limits(limits))
    }

    pub fn pid(&self) -> Result<PidSettings> {
        self.with_servo(|servo| Ok(servo.pid()))
    }

    pub fn set_pid(&self, pid: PidSettings) -> Result<()> {
        self.with_servo(|servo| servo.set_pid(pid))
    }

    pub fn target_tolerances(&self) -> Result<TargetTolerances> {
        self.with_servo(|servo| Ok(servo.target_tolerances()))
    }

    pub fn set_target_tolerances(&self, tolerances: TargetTolerances) -> Result<()> {
        self.with_servo(|servo| servo.set_target_tolerances(tolerances))
    }

    pub fn stall_tolerances(&self) -> Result<StallTolerances> {
        self.with_servo(|servo| Ok(servo.stall_tolerances()))
    }

    pub fn set_stall_tolerances(&self, tolerances: StallTolerances) -> Result<()> {
        self.with_servo(|servo| servo.set_stall_tolerances(tolerances))
    }

    // Logging.

    pub fn log_start(&self, duration_ms: i64) -> Result<()> {
        self.with_servo(|servo| servo.log_start(duration_ms))
    }

    pub fn log_samples(&self) -> Result<Vec<LogSample>> {
        self.with_servo(|servo| Ok(servo.log().samples().to_vec()))
    }

    pub fn log_save_csv(&self, path: impl AsRef<std::path::Path>) -> Result<()> {
        self.with_servo(|servo| servo.log().save_csv(path))
    }
}
