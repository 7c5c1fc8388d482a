//! Tunable limits, gains and tolerances of one servo.
//!
//! Values are stored in encoder counts (motor-shaft degrees) and converted to
//! output-shaft units with `counts_per_unit` at the API boundary. Gains and
//! the feedforward term are unitless and never scaled.

use crate::dcmotor::{DUTY_PCT_TO_ABS, MAX_DUTY};
use crate::error::{Result, ServoError};
use serde::{Deserialize, Serialize};

/// Feedforward output is `feedforward * acceleration / FEEDFORWARD_SCALE`.
pub const FEEDFORWARD_SCALE: f64 = 100.0;

/// Gear train specification: one train `[12, 20, 36]` or several trains
/// `[[12, 20, 36], [20, 40]]`. Each train is listed from driver to follower.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Gears {
    Train(Vec<i32>),
    Trains(Vec<Vec<i32>>),
}

impl Gears {
    /// Overall ratio: product over trains of `last / first`.
    ///
    /// Every tooth count must be at least 1 and no stage may speed up the
    /// output, i.e. each follower has at least as many teeth as its driver.
    pub fn ratio(&self) -> Result<f64> {
        let trains: Vec<&[i32]> = match self {
            Gears::Train(train) => vec![train.as_slice()],
            Gears::Trains(trains) => trains.iter().map(Vec::as_slice).collect(),
        };
        if trains.is_empty() {
            return Err(ServoError::invalid_arg("gear list is empty"));
        }
        let mut ratio = 1.0;
        for train in trains {
            let (Some(&first), Some(&last)) = (train.first(), train.last()) else {
                return Err(ServoError::invalid_arg("gear train is empty"));
            };
            if let Some(bad) = train.iter().find(|&&teeth| teeth < 1) {
                return Err(ServoError::invalid_arg(format!(
                    "gear with {bad} teeth in {train:?}"
                )));
            }
            if let Some(stage) = train.windows(2).find(|pair| pair[1] < pair[0]) {
                return Err(ServoError::invalid_arg(format!(
                    "gear stage {}:{} in {train:?} is below 1:1",
                    stage[0], stage[1]
                )));
            }
            ratio = ratio * last as f64 / first as f64;
        }
        Ok(ratio)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limits {
    pub speed: i32,
    pub acceleration: i32,
    /// Percentage of the absolute duty range.
    pub actuation: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PidSettings {
    pub kp: i32,
    pub ki: i32,
    pub kd: i32,
    pub integral_range: i32,
    pub integral_rate: i32,
    pub feed_forward: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetTolerances {
    pub speed: i32,
    pub position: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StallTolerances {
    pub speed: i32,
    /// Milliseconds.
    pub time: i32,
}

/// Control settings of one servo, in counts.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlSettings {
    counts_per_unit: f64,
    pub speed_limit: i32,
    pub acceleration_limit: i32,
    /// Duty ceiling under closed-loop control, absolute duty units.
    pub actuation_limit: i32,
    pub kp: i32,
    pub ki: i32,
    pub kd: i32,
    pub integral_range: i32,
    pub integral_rate: i32,
    pub feed_forward: i32,
    pub target_tolerance_speed: i32,
    pub target_tolerance_position: i32,
    pub stall_tolerance_speed: i32,
    /// Milliseconds.
    pub stall_tolerance_time: i32,
}

impl Default for ControlSettings {
    fn default() -> Self {
        Self {
            counts_per_unit: 1.0,
            speed_limit: 1000,
            acceleration_limit: 2000,
            actuation_limit: MAX_DUTY,
            kp: 400,
            ki: 600,
            kd: 5,
            integral_range: 45,
            integral_rate: 15,
            feed_forward: 50,
            target_tolerance_speed: 20,
            target_tolerance_position: 3,
            stall_tolerance_speed: 20,
            stall_tolerance_time: 200,
        }
    }
}

fn check_non_negative(name: &str, value: i32) -> Result<()> {
    if value < 0 {
        return Err(ServoError::invalid_arg(format!("{name} must be >= 0, got {value}")));
    }
    Ok(())
}

fn check_positive(name: &str, value: i32) -> Result<()> {
    if value <= 0 {
        return Err(ServoError::invalid_arg(format!("{name} must be > 0, got {value}")));
    }
    Ok(())
}

impl ControlSettings {
    /// Default settings for a motor behind a gear train of the given ratio.
    pub fn new(gear_ratio: f64) -> Result<Self> {
        if !gear_ratio.is_finite() || gear_ratio <= 0.0 {
            return Err(ServoError::invalid_arg(format!(
                "gear ratio must be positive, got {gear_ratio}"
            )));
        }
        Ok(Self {
            counts_per_unit: gear_ratio,
            ..Self::default()
        })
    }

    pub fn from_gears(gears: Option<&Gears>) -> Result<Self> {
        let ratio = match gears {
            Some(gears) => gears.ratio()?,
            None => 1.0,
        };
        Self::new(ratio)
    }

    pub fn counts_per_unit(&self) -> f64 {
        self.counts_per_unit
    }

    pub fn counts_to_units(&self, counts: f64) -> f64 {
        counts / self.counts_per_unit
    }

    pub fn units_to_counts(&self, units: f64) -> f64 {
        units * self.counts_per_unit
    }

    fn to_user(&self, counts: i32) -> i32 {
        self.counts_to_units(counts as f64).round() as i32
    }

    fn to_counts(&self, units: i32) -> i32 {
        self.units_to_counts(units as f64).round() as i32
    }

    pub fn limits(&self) -> Limits {
        Limits {
            speed: self.to_user(self.speed_limit),
            acceleration: self.to_user(self.acceleration_limit),
            actuation: self.actuation_limit / DUTY_PCT_TO_ABS,
        }
    }

    pub fn set_limits(&mut self, limits: Limits) -> Result<()> {
        check_positive("speed limit", limits.speed)?;
        check_positive("acceleration limit", limits.acceleration)?;
        if !(0..=100).contains(&limits.actuation) {
            return Err(ServoError::invalid_arg(format!(
                "actuation limit {}% outside 0..=100",
                limits.actuation
            )));
        }
        self.speed_limit = self.to_counts(limits.speed).max(1);
        self.acceleration_limit = self.to_counts(limits.acceleration).max(1);
        self.actuation_limit = limits.actuation * DUTY_PCT_TO_ABS;
        Ok(())
    }

    pub fn pid(&self) -> PidSettings {
        PidSettings {
            kp: self.kp,
            ki: self.ki,
            kd: self.kd,
            integral_range: self.to_user(self.integral_range),
            integral_rate: self.to_user(self.integral_rate),
            feed_forward: self.feed_forward,
        }
    }

    pub fn set_pid(&mut self, pid: PidSettings) -> Result<()> {
        check_non_negative("kp", pid.kp)?;
        check_non_negative("ki", pid.ki)?;
        check_non_negative("kd", pid.kd)?;
        check_non_negative("integral range", pid.integral_range)?;
        check_non_negative("integral rate", pid.integral_rate)?;
        check_non_negative("feed forward", pid.feed_forward)?;
        self.kp = pid.kp;
        self.ki = pid.ki;
        self.kd = pid.kd;
        self.integral_range = self.to_counts(pid.integral_range);
        self.integral_rate = self.to_counts(pid.integral_rate);
        self.feed_forward = pid.feed_forward;
        Ok(())
    }

    pub fn target_tolerances(&self) -> TargetTolerances {
        TargetTolerances {
            speed: self.to_user(self.target_tolerance_speed),
            position: self.to_user(self.target_tolerance_position),
        }
    }

    pub fn set_target_tolerances(&mut self, tolerances: TargetTolerances) -> Result<()> {
        check_non_negative("speed tolerance", tolerances.speed)?;
        check_non_negative("position tolerance", tolerances.position)?;
        self.target_tolerance_speed = self.to_counts(tolerances.speed);
        self.target_tolerance_position = self.to_counts(tolerances.position);
        Ok(())
    }

    pub fn stall_tolerances(&self) -> StallTolerances {
        StallTolerances {
            speed: self.to_user(self.stall_tolerance_speed),
            time: self.stall_tolerance_time,
        }
    }

    pub fn set_stall_tolerances(&mut self, tolerances: StallTolerances) -> Result<()> {
        check_non_negative("stall speed", tolerances.speed)?;
        check_non_negative("stall time", tolerances.time)?;
        self.stall_tolerance_speed = self.to_counts(tolerances.speed);
        self.stall_tolerance_time = tolerances.time;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_train_ratio() {
        let gears = Gears::Train(vec![12, 20, 36]);
        assert!((gears.ratio().unwrap() - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_compound_train_ratio() {
        let gears = Gears::Trains(vec![vec![12, 20, 36], vec![20, 40]]);
        assert!((gears.ratio().unwrap() - 6.0).abs() < 1e-9);
    }

    #[test]
    fn test_invalid_trains() {
        for gears in [
            Gears::Trains(vec![vec![0, 20, 36]]),
            Gears::Trains(vec![vec![12, 1, 36]]),
            Gears::Train(vec![]),
            Gears::Trains(vec![]),
            Gears::Train(vec![36, 12]),
        ] {
            assert!(
                matches!(gears.ratio(), Err(ServoError::InvalidArgument(_))),
                "{gears:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_gears_deserialize_both_shapes() {
        #[derive(Deserialize)]
        struct Wrapper {
            gears: Gears,
        }
        let one: Wrapper = toml::from_str("gears = [12, 20, 36]").unwrap();
        assert_eq!(one.gears, Gears::Train(vec![12, 20, 36]));
        let many: Wrapper = toml::from_str("gears = [[12, 20, 36], [20, 40]]").unwrap();
        assert_eq!(many.gears.ratio().unwrap(), 6.0);
    }

    #[test]
    fn test_user_units_follow_gear_ratio() {
        let mut settings = ControlSettings::new(3.0).unwrap();
        settings
            .set_limits(Limits { speed: 200, acceleration: 400, actuation: 80 })
            .unwrap();
        assert_eq!(settings.speed_limit, 600);
        assert_eq!(settings.acceleration_limit, 1200);
        assert_eq!(settings.actuation_limit, 8000);
        assert_eq!(settings.limits(), Limits { speed: 200, acceleration: 400, actuation: 80 });
    }

    #[test]
    fn test_limits_validation() {
        let mut settings = ControlSettings::default();
        let before = settings.clone();
        assert!(settings.set_limits(Limits { speed: 100, acceleration: 100, actuation: 101 }).is_err());
        assert!(settings.set_limits(Limits { speed: 0, acceleration: 100, actuation: 50 }).is_err());
        assert!(settings.set_limits(Limits { speed: 100, acceleration: -5, actuation: 50 }).is_err());
        assert_eq!(settings, before);
    }

    #[test]
    fn test_non_positive_gear_ratio() {
        assert!(ControlSettings::new(0.0).is_err());
        assert!(ControlSettings::new(-2.0).is_err());
    }
}
