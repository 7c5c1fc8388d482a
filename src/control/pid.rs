// src/control/pid.rs - PID + acceleration feedforward with band/rate-limited integral
use super::settings::{ControlSettings, FEEDFORWARD_SCALE};
use super::trajectory::Reference;

/// Output of one feedback evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PidOutput {
    /// Duty command in absolute units, within `±actuation_limit`.
    pub duty: i32,
    pub position_error: f64,
    pub speed_error: f64,
}

impl PidOutput {
    /// Both errors inside the target tolerances.
    pub fn on_target(&self, settings: &ControlSettings) -> bool {
        self.position_error.abs() <= settings.target_tolerance_position as f64
            && self.speed_error.abs() <= settings.target_tolerance_speed as f64
    }
}

#[derive(Debug, Clone, Default)]
pub struct PidController {
    /// Integral of position error in count-seconds.
    integral: f64,
    previous_time: Option<f64>,
}

impl PidController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.integral = 0.0;
        self.previous_time = None;
    }

    pub fn integral(&self) -> f64 {
        self.integral
    }

    /// Computes the duty command for the measured state at `time` (seconds).
    ///
    /// The integral only accumulates while `|position_error| <= integral_range`,
    /// and each tick adds at most `integral_rate` counts of error per second.
    pub fn update(
        &mut self,
        settings: &ControlSettings,
        reference: &Reference,
        angle: f64,
        speed: f64,
        time: f64,
    ) -> PidOutput {
        let position_error = reference.angle - angle;
        let speed_error = reference.speed - speed;

        let dt = self
            .previous_time
            .map(|previous| (time - previous).max(0.0))
            .unwrap_or(0.0);
        self.previous_time = Some(time);

        if position_error.abs() <= settings.integral_range as f64 {
            let rate = settings.integral_rate as f64;
            self.integral += position_error.clamp(-rate, rate) * dt;
        }

        let feedforward = settings.feed_forward as f64 * reference.acceleration / FEEDFORWARD_SCALE;
        let raw = feedforward
            + settings.kp as f64 * position_error
            + settings.ki as f64 * self.integral
            + settings.kd as f64 * speed_error;

        let limit = settings.actuation_limit as f64;
        let duty = raw.clamp(-limit, limit).round() as i32;
        tracing::trace!(
            reference = reference.angle,
            angle,
            position_error,
            speed_error,
            integral = self.integral,
            duty,
            "pid update"
        );
        PidOutput {
            duty,
            position_error,
            speed_error,
        }
    }
}
