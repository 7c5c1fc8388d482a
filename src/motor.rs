// src/motor.rs - Closed set of actuator kinds attached to a port
use crate::dcmotor::{DcMotor, DUTY_PCT_TO_ABS};
use crate::error::{Result, ServoError};
use crate::port::Port;
use crate::servo::Servo;
use std::fmt;

/// Whatever is attached to a port. Both kinds accept direct duty commands;
/// only servos run closed-loop maneuvers.
#[derive(Debug)]
pub enum Actuator {
    DirectDrive(DcMotor),
    ServoControlled(Servo),
}

impl Actuator {
    pub fn port(&self) -> Port {
        match self {
            Actuator::DirectDrive(motor) => motor.port(),
            Actuator::ServoControlled(servo) => servo.port(),
        }
    }

    pub fn dc_motor(&self) -> &DcMotor {
        match self {
            Actuator::DirectDrive(motor) => motor,
            Actuator::ServoControlled(servo) => servo.motor(),
        }
    }

    pub fn dc(&mut self, duty_pct: i32) -> Result<()> {
        match self {
            Actuator::DirectDrive(motor) => motor.set_duty_cycle_usr(duty_pct),
            Actuator::ServoControlled(servo) => servo.dc(duty_pct),
        }
    }

    pub fn stop(&mut self) -> Result<()> {
        match self {
            Actuator::DirectDrive(motor) => motor.coast(),
            Actuator::ServoControlled(servo) => servo.stop(),
        }
    }

    pub fn brake(&mut self) -> Result<()> {
        match self {
            Actuator::DirectDrive(motor) => motor.brake(),
            Actuator::ServoControlled(servo) => servo.brake(),
        }
    }

    pub fn dc_settings(&self) -> i32 {
        match self {
            Actuator::DirectDrive(motor) => motor.settings().max_duty / DUTY_PCT_TO_ABS,
            Actuator::ServoControlled(servo) => servo.dc_settings(),
        }
    }

    pub fn set_dc_settings(&mut self, max_duty_pct: i32) -> Result<()> {
        match self {
            Actuator::DirectDrive(motor) => motor.set_max_duty_pct(max_duty_pct),
            Actuator::ServoControlled(servo) => servo.set_dc_settings(max_duty_pct),
        }
    }

    pub fn servo(&self) -> Result<&Servo> {
        match self {
            Actuator::ServoControlled(servo) => Ok(servo),
            Actuator::DirectDrive(motor) => Err(not_a_servo(motor.port())),
        }
    }

    pub fn servo_mut(&mut self) -> Result<&mut Servo> {
        match self {
            Actuator::ServoControlled(servo) => Ok(servo),
            Actuator::DirectDrive(motor) => Err(not_a_servo(motor.port())),
        }
    }

    /// Periodic control tick. Plain DC motors have nothing to do.
    pub fn tick(&mut self) -> Result<()> {
        match self {
            Actuator::DirectDrive(_) => Ok(()),
            Actuator::ServoControlled(servo) => servo.control_update(),
        }
    }
}

fn not_a_servo(port: Port) -> ServoError {
    ServoError::invalid_op(format!("motor on port {port} has no rotation sensor"))
}

impl fmt::Display for Actuator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Actuator::DirectDrive(motor) => fmt::Display::fmt(motor, f),
            Actuator::ServoControlled(servo) => fmt::Display::fmt(servo, f),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::{ControlSettings, Mode};
    use crate::dcmotor::{Direction, DriveState};
    use crate::sim::{SimClock, SimMotor};
    use std::sync::Arc;

    fn dc_actuator() -> Actuator {
        let clock = SimClock::new();
        let sim = SimMotor::new(Arc::new(clock));
        let mut motor = DcMotor::new(Port::B, sim.driver());
        motor.setup(Direction::Clockwise).unwrap();
        Actuator::DirectDrive(motor)
    }

    fn servo_actuator() -> Actuator {
        let clock = SimClock::new();
        let sim = SimMotor::new(Arc::new(clock.clone()));
        let mut motor = DcMotor::new(Port::C, sim.driver());
        motor.setup(Direction::Clockwise).unwrap();
        Actuator::ServoControlled(Servo::new(
            motor,
            sim.encoder(),
            Arc::new(clock),
            ControlSettings::default(),
        ))
    }

    #[test]
    fn test_dc_actuator_has_no_control() {
        let mut actuator = dc_actuator();
        assert_eq!(actuator.port(), Port::B);
        actuator.dc(-30).unwrap();
        assert_eq!(actuator.dc_motor().state(), DriveState::Duty(-3000));
        assert!(matches!(actuator.servo_mut(), Err(ServoError::InvalidOperation(_))));
        actuator.tick().unwrap();
    }

    #[test]
    fn test_stop_cancels_servo_control() {
        let mut actuator = servo_actuator();
        actuator.servo_mut().unwrap().run(100).unwrap();
        assert_eq!(actuator.servo().unwrap().control().mode(), Mode::Velocity);
        actuator.stop().unwrap();
        assert_eq!(actuator.servo().unwrap().control().mode(), Mode::Idle);
        assert_eq!(actuator.dc_motor().state(), DriveState::Coast);
    }

    #[test]
    fn test_dc_settings_dispatch() {
        let mut actuator = dc_actuator();
        actuator.set_dc_settings(40).unwrap();
        assert_eq!(actuator.dc_settings(), 40);
        assert!(actuator.to_string().contains("Torque limit\t 40"));
    }
}
