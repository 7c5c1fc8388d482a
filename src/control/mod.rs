//! Closed-loop control of one servo.
//!
//! [`Control`] owns the settings, the active trajectory, the feedback
//! controller and the stall detector of one actuator. Commands install a
//! complete trajectory and mode together through [`Control::start`]; the
//! periodic tick calls [`Control::update`] with the measured state and gets
//! back what to do with the motor.

pub mod pid;
pub mod settings;
pub mod stall;
pub mod trajectory;

pub use pid::{PidController, PidOutput};
pub use settings::{ControlSettings, Gears, Limits, PidSettings, StallTolerances, TargetTolerances};
pub use stall::StallDetector;
pub use trajectory::{PlannerLimits, Reference, StartState, Trajectory, TrajectoryInfo};

use crate::dcmotor::DUTY_PCT_TO_ABS;
use crate::error::{Result, ServoError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Idle,
    Timed,
    Angle,
    Target,
    Velocity,
    Tracking,
}

/// What to do once a maneuver completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Then {
    Coast,
    Brake,
    #[default]
    Hold,
}

impl fmt::Display for Then {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Then::Coast => write!(f, "coast"),
            Then::Brake => write!(f, "brake"),
            Then::Hold => write!(f, "hold"),
        }
    }
}

impl FromStr for Then {
    type Err = ServoError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "coast" => Ok(Then::Coast),
            "brake" => Ok(Then::Brake),
            "hold" => Ok(Then::Hold),
            other => Err(ServoError::invalid_arg(format!("unknown stop action '{other}'"))),
        }
    }
}

/// Motor command produced by one control tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Actuation {
    Duty(i32),
    Coast,
    Brake,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TickOutput {
    pub actuation: Actuation,
    pub reference: Reference,
    pub feedback: PidOutput,
    /// The maneuver completed on this tick.
    pub completed: bool,
    /// The stall flag was raised on this tick.
    pub stalled: bool,
}

#[derive(Debug, Clone)]
pub struct Control {
    settings: ControlSettings,
    mode: Mode,
    trajectory: Trajectory,
    then: Then,
    stop_on_stall: bool,
    done: bool,
    pid: PidController,
    stall: StallDetector,
}

impl Control {
    pub fn new(settings: ControlSettings) -> Self {
        Self {
            settings,
            mode: Mode::Idle,
            trajectory: Trajectory::stationary(0.0, 0.0),
            then: Then::Coast,
            stop_on_stall: false,
            done: false,
            pid: PidController::new(),
            stall: StallDetector::new(),
        }
    }

    pub fn settings(&self) -> &ControlSettings {
        &self.settings
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn is_active(&self) -> bool {
        self.mode != Mode::Idle
    }

    /// Most recently installed trajectory.
    pub fn trajectory(&self) -> &Trajectory {
        &self.trajectory
    }

    pub fn then(&self) -> Then {
        self.then
    }

    /// True when no maneuver is running or the running one has completed.
    pub fn done(&self) -> bool {
        !self.is_active() || self.done
    }

    pub fn stalled(&self) -> bool {
        self.stall.stalled()
    }

    pub fn stall_angle(&self) -> Option<f64> {
        self.stall.stall_angle()
    }

    fn check_idle(&self) -> Result<()> {
        if self.is_active() {
            return Err(ServoError::invalid_op(format!(
                "cannot change control settings while in {:?} mode",
                self.mode
            )));
        }
        Ok(())
    }

    pub fn set_limits(&mut self, limits: Limits) -> Result<()> {
        self.check_idle()?;
        self.settings.set_limits(limits)
    }

    pub fn set_pid(&mut self, pid: PidSettings) -> Result<()> {
        self.check_idle()?;
        self.settings.set_pid(pid)
    }

    pub fn set_target_tolerances(&mut self, tolerances: TargetTolerances) -> Result<()> {
        self.check_idle()?;
        self.settings.set_target_tolerances(tolerances)
    }

    pub fn set_stall_tolerances(&mut self, tolerances: StallTolerances) -> Result<()> {
        self.check_idle()?;
        self.settings.set_stall_tolerances(tolerances)
    }

    /// Temporarily replaces the actuation limit with `duty_pct` percent and
    /// returns the previous absolute limit. Not subject to the idle check.
    pub fn override_actuation_limit(&mut self, duty_pct: i32) -> Result<i32> {
        if !(0..=100).contains(&duty_pct) {
            return Err(ServoError::invalid_arg(format!(
                "duty limit {duty_pct}% outside 0..=100"
            )));
        }
        let previous = self.settings.actuation_limit;
        self.settings.actuation_limit = duty_pct * DUTY_PCT_TO_ABS;
        Ok(previous)
    }

    /// Puts back a limit returned by [`Control::override_actuation_limit`].
    pub fn restore_actuation_limit(&mut self, previous: i32) {
        self.settings.actuation_limit = previous;
    }

    pub fn planner_limits(&self) -> PlannerLimits {
        PlannerLimits {
            speed: self.settings.speed_limit as f64,
            acceleration: self.settings.acceleration_limit as f64,
        }
    }

    /// State a new command plans from: the reference while a maneuver is
    /// running, so that consecutive commands join smoothly, else the
    /// measured state.
    pub fn start_state(&self, time: f64, angle: f64, speed: f64) -> StartState {
        if self.is_active() {
            let reference = self.trajectory.evaluate(time);
            StartState {
                time,
                angle: reference.angle,
                speed: reference.speed,
            }
        } else {
            StartState { time, angle, speed }
        }
    }

    /// Installs a new maneuver, superseding the running one.
    pub fn start(&mut self, mode: Mode, trajectory: Trajectory, then: Then, stop_on_stall: bool) {
        if !self.is_active() {
            self.pid.reset();
        }
        tracing::debug!(
            ?mode,
            %then,
            t1 = trajectory.t1 - trajectory.t0,
            t3 = ?trajectory.end_time().map(|t3| t3 - trajectory.t0),
            th0 = trajectory.th0,
            th3 = trajectory.th3,
            w1 = trajectory.w1,
            "control start"
        );
        self.trajectory = trajectory;
        self.mode = mode;
        self.then = then;
        self.stop_on_stall = stop_on_stall;
        self.done = false;
        self.stall.reset();
    }

    /// Ends closed-loop control.
    pub fn stop(&mut self) {
        self.mode = Mode::Idle;
        self.stop_on_stall = false;
    }

    fn finished(&self, time: f64, feedback: &PidOutput) -> bool {
        if self.stop_on_stall {
            return self.stall.stalled();
        }
        match self.mode {
            Mode::Timed | Mode::Angle | Mode::Target => {
                self.trajectory.end_time().is_some_and(|end| time >= end)
                    && feedback.on_target(&self.settings)
            }
            Mode::Idle | Mode::Velocity | Mode::Tracking => false,
        }
    }

    /// Runs one control tick. Returns `None` while idle.
    pub fn update(&mut self, time: f64, angle: f64, speed: f64) -> Option<TickOutput> {
        if !self.is_active() {
            return None;
        }
        let reference = self.trajectory.evaluate(time);
        let feedback = self.pid.update(&self.settings, &reference, angle, speed, time);
        let stalled = self.stall.update(&self.settings, time, feedback.duty, speed, angle);
        if stalled {
            tracing::warn!(angle, speed, duty = feedback.duty, "stall detected");
        }

        let mut actuation = Actuation::Duty(feedback.duty);
        let mut completed = false;
        if !self.done && self.finished(time, &feedback) {
            self.done = true;
            completed = true;
            actuation = match self.then {
                Then::Coast => {
                    self.stop();
                    Actuation::Coast
                }
                Then::Brake => {
                    self.stop();
                    Actuation::Brake
                }
                Then::Hold => {
                    if self.stop_on_stall {
                        self.trajectory = Trajectory::stationary(time, angle);
                        self.mode = Mode::Angle;
                        self.stop_on_stall = false;
                    }
                    Actuation::Duty(feedback.duty)
                }
            };
            tracing::debug!(angle, then = %self.then, "maneuver complete");
        }

        Some(TickOutput {
            actuation,
            reference,
            feedback,
            completed,
            stalled,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DT: f64 = 0.005;

    fn control() -> Control {
        Control::new(ControlSettings::default())
    }

    /// Feeds the reference back as the measurement until idle or `until`.
    fn follow_perfectly(control: &mut Control, until: f64) -> Vec<TickOutput> {
        let mut outputs = Vec::new();
        let mut t = 0.0;
        while t <= until {
            let r = control.trajectory().evaluate(t);
            match control.update(t, r.angle, r.speed) {
                Some(out) => outputs.push(out),
                None => break,
            }
            t += DT;
        }
        outputs
    }

    #[test]
    fn test_idle_control_is_done_and_silent() {
        let mut control = control();
        assert!(control.done());
        assert!(!control.stalled());
        assert!(control.update(0.0, 0.0, 0.0).is_none());
    }

    #[test]
    fn test_settings_locked_while_active() {
        let mut control = control();
        let traj = Trajectory::time_based(StartState::default(), 100.0, None, &control.planner_limits()).unwrap();
        control.start(Mode::Velocity, traj, Then::Coast, false);

        let valid = Limits { speed: 500, acceleration: 500, actuation: 50 };
        let invalid = Limits { speed: -1, acceleration: 500, actuation: 500 };
        for limits in [valid, invalid] {
            assert!(matches!(control.set_limits(limits), Err(ServoError::InvalidOperation(_))));
        }
        assert!(matches!(
            control.set_pid(control.settings().pid()),
            Err(ServoError::InvalidOperation(_))
        ));
        assert!(matches!(
            control.set_target_tolerances(TargetTolerances { speed: 1, position: 1 }),
            Err(ServoError::InvalidOperation(_))
        ));
        assert!(matches!(
            control.set_stall_tolerances(StallTolerances { speed: 1, time: 1 }),
            Err(ServoError::InvalidOperation(_))
        ));

        control.stop();
        control.set_limits(valid).unwrap();
        assert_eq!(control.settings().limits(), valid);
    }

    #[test]
    fn test_override_bypasses_lock_and_restores() {
        let mut control = control();
        let traj = Trajectory::time_based(StartState::default(), 100.0, None, &control.planner_limits()).unwrap();
        control.start(Mode::Velocity, traj, Then::Coast, true);
        let previous = control.override_actuation_limit(30).unwrap();
        assert_eq!(previous, 10_000);
        assert_eq!(control.settings().actuation_limit, 3000);
        control.restore_actuation_limit(previous);
        assert_eq!(control.settings().actuation_limit, 10_000);
        assert!(matches!(control.override_actuation_limit(101), Err(ServoError::InvalidArgument(_))));
    }

    #[test]
    fn test_coast_after_completion_returns_to_idle() {
        let mut control = control();
        let traj = Trajectory::angle_based(StartState::default(), 90.0, 500.0, &control.planner_limits()).unwrap();
        control.start(Mode::Target, traj, Then::Coast, false);
        assert!(!control.done());
        let outputs = follow_perfectly(&mut control, 2.0);
        let last = outputs.last().unwrap();
        assert!(last.completed);
        assert_eq!(last.actuation, Actuation::Coast);
        assert_eq!(control.mode(), Mode::Idle);
        assert!(control.done());
    }

    #[test]
    fn test_hold_keeps_loop_running() {
        let mut control = control();
        let traj = Trajectory::time_based(StartState::default(), 500.0, Some(1000), &control.planner_limits()).unwrap();
        control.start(Mode::Timed, traj, Then::Hold, false);
        let outputs = follow_perfectly(&mut control, 1.5);
        assert_eq!(outputs.iter().filter(|o| o.completed).count(), 1);
        assert_eq!(control.mode(), Mode::Timed);
        assert!(control.done());
        // Still producing duty commands toward the final angle.
        let out = control.update(2.0, 370.0, 0.0).unwrap();
        assert_eq!(out.reference.angle, 375.0);
        assert!(matches!(out.actuation, Actuation::Duty(d) if d > 0));
    }

    #[test]
    fn test_stall_seeking_completes_on_stall() {
        let mut control = control();
        let traj = Trajectory::time_based(StartState::default(), 300.0, None, &control.planner_limits()).unwrap();
        control.start(Mode::Velocity, traj, Then::Brake, true);
        let mut t = 0.0;
        let mut result = None;
        while t < 2.0 {
            // Shaft pinned at 7 counts.
            if let Some(out) = control.update(t, 7.0, 0.0) {
                if out.completed {
                    result = Some(out);
                    break;
                }
            }
            t += DT;
        }
        let out = result.unwrap();
        assert_eq!(out.actuation, Actuation::Brake);
        assert!(control.stalled());
        assert_eq!(control.stall_angle(), Some(7.0));
        assert_eq!(control.mode(), Mode::Idle);
    }

    #[test]
    fn test_stall_hold_holds_measured_angle() {
        let mut control = control();
        let traj = Trajectory::time_based(StartState::default(), 300.0, None, &control.planner_limits()).unwrap();
        control.start(Mode::Velocity, traj, Then::Hold, true);
        let mut t = 0.0;
        while !control.done() {
            control.update(t, 4.0, 0.0);
            t += DT;
        }
        assert_eq!(control.mode(), Mode::Angle);
        assert_eq!(control.trajectory().th3, 4.0);

        // The hold tick is no longer saturated; the onset angle stays.
        let out = control.update(t, 4.0, 0.0).unwrap();
        assert!(!out.stalled);
        assert!(control.stalled());
        assert_eq!(control.stall_angle(), Some(4.0));
    }

    #[test]
    fn test_completion_decided_on_single_tick() {
        let mut control = control();
        let traj = Trajectory::angle_based(StartState::default(), 90.0, 500.0, &control.planner_limits()).unwrap();
        let t3 = traj.t3;
        control.start(Mode::Target, traj, Then::Hold, false);

        // Past t3 but 10 counts off: not done.
        let out = control.update(t3 + 0.1, 100.0, 0.0).unwrap();
        assert!(!out.completed);
        assert!(!control.done());

        // One sample inside both tolerances completes the maneuver.
        let out = control.update(t3 + 0.105, 91.0, 5.0).unwrap();
        assert!(out.completed);
        assert!(control.done());

        // Leaving the tolerance band afterwards does not undo it.
        let out = control.update(t3 + 0.11, 100.0, 0.0).unwrap();
        assert!(!out.completed);
        assert!(control.done());
        assert_eq!(control.mode(), Mode::Target);
    }

    #[test]
    fn test_velocity_and_tracking_never_complete() {
        let mut control = control();
        let traj = Trajectory::time_based(StartState::default(), 200.0, None, &control.planner_limits()).unwrap();
        control.start(Mode::Velocity, traj, Then::Coast, false);
        assert!(follow_perfectly(&mut control, 3.0).iter().all(|o| !o.completed));
        assert!(!control.done());

        control.start(Mode::Tracking, Trajectory::stationary(3.0, 50.0), Then::Coast, false);
        assert!(follow_perfectly(&mut control, 5.0).iter().all(|o| !o.completed));
        assert!(!control.done());
    }

    #[test]
    fn test_new_command_plans_from_reference() {
        let mut control = control();
        let traj = Trajectory::time_based(StartState::default(), 400.0, None, &control.planner_limits()).unwrap();
        control.start(Mode::Velocity, traj, Then::Coast, false);
        let start = control.start_state(1.0, 0.0, 0.0);
        assert!((start.speed - 400.0).abs() < 1e-9);
        assert!(start.angle > 300.0);

        control.stop();
        let start = control.start_state(1.0, 12.0, -3.0);
        assert_eq!((start.angle, start.speed), (12.0, -3.0));
    }

    #[test]
    fn test_reporting_is_idempotent() {
        let mut control = control();
        let traj = Trajectory::angle_based(StartState::default(), 45.0, 300.0, &control.planner_limits()).unwrap();
        control.start(Mode::Angle, traj, Then::Hold, false);
        let snapshot = (control.done(), control.stalled(), control.trajectory().clone());
        for _ in 0..3 {
            assert_eq!((control.done(), control.stalled(), control.trajectory().clone()), snapshot);
        }
    }

    #[test]
    fn test_then_parsing() {
        assert_eq!("HOLD".parse::<Then>().unwrap(), Then::Hold);
        assert_eq!("coast".parse::<Then>().unwrap(), Then::Coast);
        assert!("drift".parse::<Then>().is_err());
    }
}
