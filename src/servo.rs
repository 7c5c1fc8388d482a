// src/servo.rs - DC motor + encoder + closed-loop control of one port
//
// All public angles and speeds are in user units (output-shaft degrees);
// internally everything is encoder counts.

use crate::control::{
    Actuation, Control, ControlSettings, Limits, Mode, PidSettings, StallTolerances,
    TargetTolerances, Then, Trajectory, TrajectoryInfo, trajectory,
};
use crate::dcmotor::{DcMotor, DriveState, DUTY_PCT_TO_ABS};
use crate::error::{Result, ServoError};
use crate::hardware_traits::{Encoder, TimeInterface};
use crate::log::{LogSample, ServoLog};
use crate::port::Port;
use std::fmt;
use std::sync::Arc;

/// Target of [`Servo::reset_angle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetAngle {
    To(i32),
    /// Whatever the absolute position sensor reports.
    Absolute,
}

pub struct Servo {
    motor: DcMotor,
    encoder: Box<dyn Encoder>,
    control: Control,
    clock: Arc<dyn TimeInterface>,
    log: ServoLog,
}

fn check_speed(speed: i32) -> Result<()> {
    if speed == 0 {
        return Err(ServoError::invalid_arg("speed must be nonzero"));
    }
    Ok(())
}

impl Servo {
    /// Wraps a motor that has already been set up.
    pub fn new(
        motor: DcMotor,
        encoder: Box<dyn Encoder>,
        clock: Arc<dyn TimeInterface>,
        settings: ControlSettings,
    ) -> Self {
        Self {
            motor,
            encoder,
            control: Control::new(settings),
            clock,
            log: ServoLog::default(),
        }
    }

    pub fn port(&self) -> Port {
        self.motor.port()
    }

    pub fn motor(&self) -> &DcMotor {
        &self.motor
    }

    pub fn control(&self) -> &Control {
        &self.control
    }

    pub fn control_mut(&mut self) -> &mut Control {
        &mut self.control
    }

    fn now(&self) -> f64 {
        self.clock.now().as_secs_f64()
    }

    fn sign(&self) -> f64 {
        self.motor.settings().direction.sign() as f64
    }

    fn to_counts(&self, units: i32) -> f64 {
        self.control.settings().units_to_counts(units as f64)
    }

    fn to_units(&self, counts: f64) -> i32 {
        self.control.settings().counts_to_units(counts).round() as i32
    }

    /// Measured angle and speed in counts, in the user's positive direction.
    fn measure(&mut self) -> Result<(f64, f64)> {
        let sign = self.sign();
        let count = self.encoder.count()?;
        let rate = self.encoder.rate()?;
        Ok((sign * count as f64, sign * rate as f64))
    }

    /// Drops closed-loop control after a fault and lets the motor spin freely.
    fn abort(&mut self, err: ServoError) -> ServoError {
        tracing::warn!(port = %self.port(), error = %err, "maneuver aborted");
        self.control.stop();
        if let Err(coast_err) = self.motor.coast() {
            tracing::warn!(port = %self.port(), error = %coast_err, "coast after fault failed");
        }
        err
    }

    fn begin<F>(&mut self, mode: Mode, then: Then, stop_on_stall: bool, plan: F) -> Result<()>
    where
        F: FnOnce(trajectory::StartState, &trajectory::PlannerLimits) -> Result<Trajectory>,
    {
        let time = self.now();
        let (angle, speed) = match self.measure() {
            Ok(measured) => measured,
            Err(e) => return Err(self.abort(e)),
        };
        let start = self.control.start_state(time, angle, speed);
        let trajectory = match plan(start, &self.control.planner_limits()) {
            Ok(trajectory) => trajectory,
            Err(e) => return Err(self.abort(e)),
        };
        self.control.start(mode, trajectory, then, stop_on_stall);
        Ok(())
    }

    /// One control tick: measure, evaluate, actuate, log.
    pub fn control_update(&mut self) -> Result<()> {
        let active = self.control.is_active();
        if !active && !self.log.is_armed() {
            return Ok(());
        }
        let time = self.now();
        let (angle, speed) = match self.measure() {
            Ok(measured) => measured,
            Err(e) if active => return Err(self.abort(e)),
            Err(e) => {
                // Only recording: report once, then stop reading.
                self.log.stop();
                return Err(e);
            }
        };

        let output = self.control.update(time, angle, speed);
        if let Some(out) = &output {
            let applied = match out.actuation {
                Actuation::Duty(duty) => self.motor.set_duty_cycle_int(duty),
                Actuation::Coast => self.motor.coast(),
                Actuation::Brake => self.motor.brake(),
            };
            if let Err(e) = applied {
                return Err(self.abort(e));
            }
        }

        if self.log.is_armed() {
            let duty = match self.motor.state() {
                DriveState::Duty(duty) => duty,
                DriveState::Coast | DriveState::Brake => 0,
            };
            let (reference_angle, reference_speed) = output
                .map(|out| (out.reference.angle, out.reference.speed))
                .unwrap_or((angle, speed));
            self.log.record(
                time,
                LogSample {
                    time_ms: 0,
                    angle: angle.round() as i32,
                    speed: speed.round() as i32,
                    duty,
                    reference_angle,
                    reference_speed,
                },
            );
        }
        Ok(())
    }

    // Direct actuation. Each of these ends closed-loop control first.

    pub fn dc(&mut self, duty_pct: i32) -> Result<()> {
        self.control.stop();
        self.motor.set_duty_cycle_usr(duty_pct)
    }

    pub fn stop(&mut self) -> Result<()> {
        self.control.stop();
        self.motor.coast()
    }

    pub fn brake(&mut self) -> Result<()> {
        self.control.stop();
        self.motor.brake()
    }

    // Maneuvers.

    pub fn run(&mut self, speed: i32) -> Result<()> {
        let speed = self.to_counts(speed);
        self.begin(Mode::Velocity, Then::Coast, false, |start, limits| {
            Trajectory::time_based(start, speed, None, limits)
        })
    }

    pub fn run_time(&mut self, speed: i32, duration_ms: i64, then: Then) -> Result<()> {
        trajectory::check_duration(duration_ms)?;
        let speed = self.to_counts(speed);
        self.begin(Mode::Timed, then, false, |start, limits| {
            Trajectory::time_based(start, speed, Some(duration_ms), limits)
        })
    }

    /// Rotates by `angle` relative to the current (reference) angle. The
    /// direction is the product of the signs of `speed` and `angle`.
    pub fn run_angle(&mut self, speed: i32, angle: i32, then: Then) -> Result<()> {
        check_speed(speed)?;
        let distance = self.to_counts(angle) * speed.signum() as f64;
        let speed = self.to_counts(speed).abs();
        self.begin(Mode::Angle, then, false, |start, limits| {
            Trajectory::angle_based(start, start.angle + distance, speed, limits)
        })
    }

    /// Moves to an absolute angle. The sign of `speed` is ignored.
    pub fn run_target(&mut self, speed: i32, target: i32, then: Then) -> Result<()> {
        check_speed(speed)?;
        let target = self.to_counts(target);
        let speed = self.to_counts(speed).abs();
        self.begin(Mode::Target, then, false, |start, limits| {
            Trajectory::angle_based(start, target, speed, limits)
        })
    }

    /// Runs open-ended until the stall detector fires, then applies `then`.
    pub fn run_until_stalled(&mut self, speed: i32, then: Then) -> Result<()> {
        check_speed(speed)?;
        let speed = self.to_counts(speed);
        self.begin(Mode::Velocity, then, true, |start, limits| {
            Trajectory::time_based(start, speed, None, limits)
        })
    }

    /// Follows `target` immediately, without a planned profile.
    pub fn track_target(&mut self, target: i32) -> Result<()> {
        let target = self.to_counts(target);
        self.begin(Mode::Tracking, Then::Hold, false, |start, _| {
            Ok(Trajectory::stationary(start.time, target))
        })
    }

    pub fn hold(&mut self) -> Result<()> {
        self.begin(Mode::Angle, Then::Hold, false, |start, _| {
            Ok(Trajectory::stationary(start.time, start.angle))
        })
    }

    // Telemetry.

    pub fn angle(&mut self) -> Result<i32> {
        let (angle, _) = self.measure()?;
        Ok(self.to_units(angle))
    }

    pub fn speed(&mut self) -> Result<i32> {
        let (_, speed) = self.measure()?;
        Ok(self.to_units(speed))
    }

    /// Resets the angle count. A holding servo holds the new angle; a
    /// running one is stopped first.
    pub fn reset_angle(&mut self, reset: ResetAngle) -> Result<()> {
        let raw = match reset {
            ResetAngle::To(angle) => (self.to_counts(angle) * self.sign()).round() as i32,
            ResetAngle::Absolute => self.encoder.absolute_count()?.ok_or_else(|| {
                ServoError::invalid_op("motor has no absolute position sensor")
            })?,
        };
        let holding = self.control.is_active() && self.control.done();
        if self.control.is_active() && !holding {
            self.stop()?;
        }
        self.encoder.reset_count(raw)?;
        if holding {
            self.control.stop();
            self.hold()?;
        }
        Ok(())
    }

    pub fn done(&self) -> bool {
        self.control.done()
    }

    pub fn stalled(&self) -> bool {
        self.control.stalled()
    }

    /// Angle at which the last stall began.
    pub fn stall_angle(&self) -> Option<i32> {
        self.control.stall_angle().map(|angle| self.to_units(angle))
    }

    pub fn trajectory(&self) -> TrajectoryInfo {
        self.control
            .trajectory()
            .info(self.control.settings().counts_per_unit())
    }

    /// Encoder counts per output-shaft degree.
    pub fn scale(&self) -> f64 {
        self.control.settings().counts_per_unit()
    }

    // Settings.

    pub fn limits(&self) -> Limits {
        self.control.settings().limits()
    }

    pub fn set_limits(&mut self, limits: Limits) -> Result<()> {
        self.control.set_limits(limits)
    }

    pub fn pid(&self) -> PidSettings {
        self.control.settings().pid()
    }

    pub fn set_pid(&mut self, pid: PidSettings) -> Result<()> {
        self.control.set_pid(pid)
    }

    pub fn target_tolerances(&self) -> TargetTolerances {
        self.control.settings().target_tolerances()
    }

    pub fn set_target_tolerances(&mut self, tolerances: TargetTolerances) -> Result<()> {
        self.control.set_target_tolerances(tolerances)
    }

    pub fn stall_tolerances(&self) -> StallTolerances {
        self.control.settings().stall_tolerances()
    }

    pub fn set_stall_tolerances(&mut self, tolerances: StallTolerances) -> Result<()> {
        self.control.set_stall_tolerances(tolerances)
    }

    /// Duty ceiling of the DC layer, percent.
    pub fn dc_settings(&self) -> i32 {
        self.motor.settings().max_duty / DUTY_PCT_TO_ABS
    }

    pub fn set_dc_settings(&mut self, max_duty_pct: i32) -> Result<()> {
        if self.control.is_active() {
            return Err(ServoError::invalid_op("cannot change duty limit while active"));
        }
        self.motor.set_max_duty_pct(max_duty_pct)
    }

    // Logging.

    pub fn log_start(&mut self, duration_ms: i64) -> Result<()> {
        let now = self.now();
        self.log.start(now, duration_ms)
    }

    pub fn log(&self) -> &ServoLog {
        &self.log
    }
}

impl fmt::Display for Servo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}\nGear ratio\t {}", self.motor, self.scale())
    }
}

impl fmt::Debug for Servo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Servo")
            .field("motor", &self.motor)
            .field("mode", &self.control.mode())
            .field("done", &self.control.done())
            .field("stalled", &self.control.stalled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dcmotor::Direction;
    use crate::sim::{SimClock, SimMotor};
    use std::time::Duration;

    const TICK: Duration = Duration::from_millis(5);

    fn servo(direction: Direction, gear_ratio: f64) -> (Servo, SimMotor, SimClock) {
        let clock = SimClock::new();
        let sim = SimMotor::new(Arc::new(clock.clone()));
        let mut motor = DcMotor::new(Port::A, sim.driver());
        motor.setup(direction).unwrap();
        let servo = Servo::new(
            motor,
            sim.encoder(),
            Arc::new(clock.clone()),
            ControlSettings::new(gear_ratio).unwrap(),
        );
        (servo, sim, clock)
    }

    fn run_for(servo: &mut Servo, clock: &SimClock, duration: Duration) {
        let ticks = duration.as_millis() / TICK.as_millis();
        for _ in 0..ticks {
            clock.advance(TICK);
            servo.control_update().unwrap();
        }
    }

    #[test]
    fn test_run_target_reaches_angle_and_holds() {
        let (mut servo, _, clock) = servo(Direction::Clockwise, 1.0);
        servo.run_target(500, 180, Then::Hold).unwrap();
        run_for(&mut servo, &clock, Duration::from_secs(3));
        assert!(servo.done());
        assert_eq!(servo.control().mode(), Mode::Target);
        assert!((servo.angle().unwrap() - 180).abs() <= 3);
    }

    #[test]
    fn test_run_angle_sign_rules() {
        let (mut servo, _, clock) = servo(Direction::Clockwise, 1.0);
        servo.run_angle(-400, 90, Then::Coast).unwrap();
        assert_eq!(servo.trajectory().th3, Some(-90));
        servo.stop().unwrap();
        servo.run_angle(-400, -90, Then::Coast).unwrap();
        assert_eq!(servo.trajectory().th3, Some(90));
        run_for(&mut servo, &clock, Duration::from_secs(2));
        assert_eq!(servo.control().mode(), Mode::Idle);
        // run_target ignores the sign of speed.
        servo.run_target(-400, 30, Then::Coast).unwrap();
        assert!(servo.trajectory().th3.unwrap() == 30);
    }

    #[test]
    fn test_zero_speed_rejected_without_side_effects() {
        let (mut servo, _, _) = servo(Direction::Clockwise, 1.0);
        servo.hold().unwrap();
        assert!(matches!(servo.run_target(0, 90, Then::Hold), Err(ServoError::InvalidArgument(_))));
        assert!(matches!(servo.run_time(100, -5, Then::Hold), Err(ServoError::InvalidArgument(_))));
        assert_eq!(servo.control().mode(), Mode::Angle);
    }

    #[test]
    fn test_inverted_direction_reports_user_angle() {
        let (mut servo, sim, clock) = servo(Direction::Counterclockwise, 1.0);
        servo.run_target(400, 90, Then::Hold).unwrap();
        run_for(&mut servo, &clock, Duration::from_secs(2));
        assert!((servo.angle().unwrap() - 90).abs() <= 3);
        assert!((sim.shaft_angle().unwrap() + 90.0).abs() <= 3.5);
    }

    #[test]
    fn test_gear_ratio_scales_user_units() {
        let (mut servo, sim, clock) = servo(Direction::Clockwise, 3.0);
        assert_eq!(servo.scale(), 3.0);
        servo.run_target(100, 60, Then::Hold).unwrap();
        assert_eq!(servo.trajectory().th3, Some(60));
        run_for(&mut servo, &clock, Duration::from_secs(3));
        assert!((sim.shaft_angle().unwrap() - 180.0).abs() <= 4.0);
        assert!((servo.angle().unwrap() - 60).abs() <= 1);
    }

    #[test]
    fn test_dc_cancels_control() {
        let (mut servo, sim, _) = servo(Direction::Clockwise, 1.0);
        servo.run(300).unwrap();
        servo.dc(25).unwrap();
        assert_eq!(servo.control().mode(), Mode::Idle);
        assert_eq!(sim.applied_duty().unwrap(), Some(2500));
        servo.run(300).unwrap();
        servo.brake().unwrap();
        assert_eq!(servo.control().mode(), Mode::Idle);
        assert_eq!(servo.motor().state(), DriveState::Brake);
    }

    #[test]
    fn test_encoder_fault_aborts_maneuver() {
        let (mut servo, sim, clock) = servo(Direction::Clockwise, 1.0);
        servo.run(500).unwrap();
        run_for(&mut servo, &clock, Duration::from_millis(100));
        sim.set_encoder_fault(true).unwrap();
        clock.advance(TICK);
        assert!(matches!(servo.control_update(), Err(ServoError::Io(_))));
        assert_eq!(servo.control().mode(), Mode::Idle);
        assert_eq!(sim.applied_duty().unwrap(), None);
    }

    #[test]
    fn test_reset_angle_while_holding_rehold() {
        let (mut servo, _, clock) = servo(Direction::Clockwise, 1.0);
        servo.run_target(300, 90, Then::Hold).unwrap();
        run_for(&mut servo, &clock, Duration::from_secs(2));
        assert!(servo.done());
        servo.reset_angle(ResetAngle::To(0)).unwrap();
        assert_eq!(servo.control().mode(), Mode::Angle);
        assert!(servo.angle().unwrap().abs() <= 3);
        assert!(servo.trajectory().th3.unwrap().abs() <= 3);
    }

    #[test]
    fn test_reset_angle_while_running_stops() {
        let (mut servo, sim, clock) = servo(Direction::Clockwise, 1.0);
        servo.run(300).unwrap();
        run_for(&mut servo, &clock, Duration::from_millis(200));
        servo.reset_angle(ResetAngle::To(1000)).unwrap();
        assert_eq!(servo.control().mode(), Mode::Idle);
        assert_eq!(servo.angle().unwrap(), 1000);

        sim.set_absolute(false).unwrap();
        assert!(matches!(
            servo.reset_angle(ResetAngle::Absolute),
            Err(ServoError::InvalidOperation(_))
        ));
    }

    #[test]
    fn test_dc_settings_locked_while_active() {
        let (mut servo, _, _) = servo(Direction::Clockwise, 1.0);
        servo.set_dc_settings(60).unwrap();
        assert_eq!(servo.dc_settings(), 60);
        servo.run(100).unwrap();
        assert!(matches!(servo.set_dc_settings(80), Err(ServoError::InvalidOperation(_))));
    }

    #[test]
    fn test_log_records_ticks() {
        let (mut servo, _, clock) = servo(Direction::Clockwise, 1.0);
        servo.log_start(100).unwrap();
        servo.run(200).unwrap();
        run_for(&mut servo, &clock, Duration::from_millis(200));
        let samples = servo.log().samples();
        assert_eq!(samples.len(), 20);
        assert!(samples.windows(2).all(|w| w[1].time_ms > w[0].time_ms));
        assert!(samples.last().unwrap().reference_speed > 0.0);
    }

    #[test]
    fn test_idle_log_read_fault_reported_once() {
        let (mut servo, sim, clock) = servo(Direction::Clockwise, 1.0);
        servo.log_start(1000).unwrap();
        run_for(&mut servo, &clock, Duration::from_millis(50));
        sim.set_encoder_fault(true).unwrap();
        clock.advance(TICK);
        assert!(matches!(servo.control_update(), Err(ServoError::Io(_))));
        assert!(!servo.log().is_armed());
        clock.advance(TICK);
        assert_eq!(servo.control_update(), Ok(()));
        assert_eq!(servo.log().samples().len(), 10);
    }
}
