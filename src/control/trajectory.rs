// src/control/trajectory.rs - Trapezoidal/triangular motion profiles
//
// A trajectory has three constant-acceleration phases separated by four
// checkpoints t0 <= t1 <= t2 <= t3:
//
//   [t0, t1)  accelerate from w0 to w1 at a0
//   [t1, t2)  cruise at w1
//   [t2, t3)  decelerate from w1 to zero at a2
//
// Times are seconds on the control clock, angles are counts, speeds are
// counts/s. Open-ended trajectories cruise forever after t1.

use crate::error::{Result, ServoError};
use serde::Serialize;

/// Longest accepted time-based maneuver.
pub const MAX_DURATION_MS: i64 = 30 * 60 * 1000;

/// Reference state of a trajectory at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Reference {
    pub angle: f64,
    pub speed: f64,
    pub acceleration: f64,
}

/// State the planner starts from.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct StartState {
    pub time: f64,
    pub angle: f64,
    pub speed: f64,
}

/// Kinematic limits the planner must respect.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlannerLimits {
    pub speed: f64,
    pub acceleration: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Trajectory {
    pub t0: f64,
    pub t1: f64,
    pub t2: f64,
    pub t3: f64,
    pub th0: f64,
    pub th1: f64,
    pub th2: f64,
    pub th3: f64,
    pub w0: f64,
    pub w1: f64,
    pub a0: f64,
    pub a2: f64,
    /// No deceleration phase: cruise at w1 until superseded.
    pub forever: bool,
}

/// Phase durations and boundary values in a frame where the motion is positive.
#[derive(Debug, Clone, Copy)]
struct Phases {
    w0: f64,
    w1: f64,
    a0: f64,
    a2: f64,
    t_acc: f64,
    t_cruise: f64,
    t_dec: f64,
}

impl Phases {
    fn new(w0: f64, w1: f64, accel: f64, t_cruise: f64) -> Self {
        Self {
            w0,
            w1,
            a0: if w1 >= w0 { accel } else { -accel },
            a2: if w1 >= 0.0 { -accel } else { accel },
            t_acc: (w1 - w0).abs() / accel,
            t_cruise: t_cruise.max(0.0),
            t_dec: w1.abs() / accel,
        }
    }
}

fn sign(x: f64) -> f64 {
    if x < 0.0 { -1.0 } else { 1.0 }
}

fn check_limits(limits: &PlannerLimits) -> Result<()> {
    if !(limits.speed > 0.0 && limits.acceleration > 0.0) {
        return Err(ServoError::invalid_arg(format!(
            "planner limits must be positive: {limits:?}"
        )));
    }
    Ok(())
}

/// Validates a user duration in milliseconds.
pub fn check_duration(duration_ms: i64) -> Result<()> {
    if !(0..=MAX_DURATION_MS).contains(&duration_ms) {
        return Err(ServoError::invalid_arg(format!(
            "duration {duration_ms} ms outside 0..={MAX_DURATION_MS}"
        )));
    }
    Ok(())
}

impl Trajectory {
    /// Zero-length trajectory that holds `angle` from `time` on.
    pub fn stationary(time: f64, angle: f64) -> Self {
        Self {
            t0: time,
            t1: time,
            t2: time,
            t3: time,
            th0: angle,
            th1: angle,
            th2: angle,
            th3: angle,
            w0: 0.0,
            w1: 0.0,
            a0: 0.0,
            a2: 0.0,
            forever: false,
        }
    }

    fn from_phases(start: StartState, direction: f64, p: Phases, forever: bool) -> Self {
        let t0 = start.time;
        let t1 = t0 + p.t_acc;
        let th0 = start.angle;
        let th1 = th0 + direction * (p.w0 * p.t_acc + 0.5 * p.a0 * p.t_acc * p.t_acc);
        if forever {
            return Self {
                t0,
                t1,
                t2: t1,
                t3: t1,
                th0,
                th1,
                th2: th1,
                th3: th1,
                w0: direction * p.w0,
                w1: direction * p.w1,
                a0: direction * p.a0,
                a2: 0.0,
                forever: true,
            };
        }
        let t2 = t1 + p.t_cruise;
        let t3 = t2 + p.t_dec;
        let th2 = th1 + direction * p.w1 * p.t_cruise;
        let th3 = th2 + direction * (p.w1 * p.t_dec + 0.5 * p.a2 * p.t_dec * p.t_dec);
        Self {
            t0,
            t1,
            t2,
            t3,
            th0,
            th1,
            th2,
            th3,
            w0: direction * p.w0,
            w1: direction * p.w1,
            a0: direction * p.a0,
            a2: if p.t_dec > 0.0 { direction * p.a2 } else { 0.0 },
            forever: false,
        }
    }

    /// Profile that runs at `speed` for `duration_ms` and then stops, or
    /// forever when `duration_ms` is `None`.
    ///
    /// The total time equals the requested duration, except when the initial
    /// speed cannot be shed within it at the acceleration limit; the profile
    /// then just decelerates to a standstill.
    pub fn time_based(
        start: StartState,
        speed: f64,
        duration_ms: Option<i64>,
        limits: &PlannerLimits,
    ) -> Result<Self> {
        check_limits(limits)?;
        if let Some(ms) = duration_ms {
            check_duration(ms)?;
        }
        let accel = limits.acceleration;
        let direction = if speed != 0.0 { sign(speed) } else { sign(start.speed) };
        let w0 = direction * start.speed;
        let mut w1 = speed.abs().min(limits.speed);

        let Some(ms) = duration_ms else {
            return Ok(Self::from_phases(start, direction, Phases::new(w0, w1, accel, 0.0), true));
        };
        let duration = ms as f64 / 1000.0;

        let stop_time = w0.abs() / accel;
        let phases = if stop_time >= duration {
            Phases::new(w0, 0.0, accel, 0.0)
        } else if w0 <= w1 {
            if (w1 - w0) / accel + w1 / accel > duration {
                w1 = (accel * duration + w0) / 2.0;
            }
            let t_move = (w1 - w0) / accel + w1 / accel;
            Phases::new(w0, w1, accel, duration - t_move)
        } else {
            Phases::new(w0, w1, accel, duration - stop_time)
        };
        Ok(Self::from_phases(start, direction, phases, false))
    }

    /// Profile that ends at rest at `target`, cruising at most at `speed`.
    pub fn angle_based(
        start: StartState,
        target: f64,
        speed: f64,
        limits: &PlannerLimits,
    ) -> Result<Self> {
        check_limits(limits)?;
        let vmax = speed.abs().min(limits.speed);
        if vmax <= 0.0 {
            return Err(ServoError::invalid_arg("speed must be nonzero for a target move"));
        }
        let accel = limits.acceleration;
        let distance = target - start.angle;
        if distance == 0.0 && start.speed == 0.0 {
            return Ok(Self::stationary(start.time, target));
        }
        let direction = if distance != 0.0 { sign(distance) } else { sign(start.speed) };
        let d = distance.abs();
        let w0 = direction * start.speed;
        let stop_distance = if w0 > 0.0 { w0 * w0 / (2.0 * accel) } else { 0.0 };

        let phases = if stop_distance > d {
            // Cannot stop before the target: brake through it and come back.
            let excess = stop_distance - d;
            let w_back = (accel * excess).sqrt().min(vmax);
            let t_cruise = (excess - w_back * w_back / accel) / w_back;
            Phases::new(w0, -w_back, accel, t_cruise)
        } else if w0 <= vmax {
            let d_acc = (vmax * vmax - w0 * w0) / (2.0 * accel);
            let d_dec = vmax * vmax / (2.0 * accel);
            if d_acc + d_dec <= d {
                Phases::new(w0, vmax, accel, (d - d_acc - d_dec) / vmax)
            } else {
                let w_peak = (accel * d + w0 * w0 / 2.0).sqrt();
                Phases::new(w0, w_peak, accel, 0.0)
            }
        } else {
            Phases::new(w0, vmax, accel, (d - stop_distance) / vmax)
        };
        let mut trajectory = Self::from_phases(start, direction, phases, false);
        // Land exactly on the commanded angle despite rounding in the phases.
        trajectory.th3 = target;
        Ok(trajectory)
    }

    /// Time at which the reference comes to rest, if ever.
    pub fn end_time(&self) -> Option<f64> {
        (!self.forever).then_some(self.t3)
    }

    /// Reference angle, speed and acceleration at `time`.
    pub fn evaluate(&self, time: f64) -> Reference {
        let time = time.max(self.t0);
        if time < self.t1 {
            let dt = time - self.t0;
            return Reference {
                angle: self.th0 + self.w0 * dt + 0.5 * self.a0 * dt * dt,
                speed: self.w0 + self.a0 * dt,
                acceleration: self.a0,
            };
        }
        if self.forever || time < self.t2 {
            let dt = time - self.t1;
            return Reference {
                angle: self.th1 + self.w1 * dt,
                speed: self.w1,
                acceleration: 0.0,
            };
        }
        if time < self.t3 {
            let dt = time - self.t2;
            return Reference {
                angle: self.th2 + self.w1 * dt + 0.5 * self.a2 * dt * dt,
                speed: self.w1 + self.a2 * dt,
                acceleration: self.a2,
            };
        }
        Reference {
            angle: self.th3,
            speed: 0.0,
            acceleration: 0.0,
        }
    }

    /// Checkpoints relative to t0 in milliseconds and in user units.
    pub fn info(&self, counts_per_unit: f64) -> TrajectoryInfo {
        let ms = |t: f64| ((t - self.t0) * 1000.0).round() as i64;
        let unit = |v: f64| (v / counts_per_unit).round() as i32;
        TrajectoryInfo {
            t0: 0,
            t1: ms(self.t1),
            t2: (!self.forever).then(|| ms(self.t2)),
            t3: (!self.forever).then(|| ms(self.t3)),
            th0: unit(self.th0),
            th1: unit(self.th1),
            th2: (!self.forever).then(|| unit(self.th2)),
            th3: (!self.forever).then(|| unit(self.th3)),
            w0: unit(self.w0),
            w1: unit(self.w1),
            a0: unit(self.a0),
            a2: unit(self.a2),
        }
    }
}

/// Telemetry view of a trajectory. Open-ended trajectories have no end checkpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrajectoryInfo {
    pub t0: i64,
    pub t1: i64,
    pub t2: Option<i64>,
    pub t3: Option<i64>,
    pub th0: i32,
    pub th1: i32,
    pub th2: Option<i32>,
    pub th3: Option<i32>,
    pub w0: i32,
    pub w1: i32,
    pub a0: i32,
    pub a2: i32,
}
