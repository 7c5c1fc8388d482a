// src/control/stall.rs - Saturated-but-not-moving detection
use super::settings::ControlSettings;

#[derive(Debug, Clone, Default)]
pub struct StallDetector {
    /// Time and angle at which the current stall condition began.
    onset: Option<(f64, f64)>,
    /// Onset angle of the stall that raised the flag. Kept until `reset`.
    latched_angle: Option<f64>,
    stalled: bool,
}

impl StallDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clears the flag and the timer. Called on every new command.
    pub fn reset(&mut self) {
        self.onset = None;
        self.latched_angle = None;
        self.stalled = false;
    }

    pub fn stalled(&self) -> bool {
        self.stalled
    }

    /// Angle at saturation onset of the stall that raised the flag.
    pub fn stall_angle(&self) -> Option<f64> {
        self.latched_angle
    }

    /// Feeds one tick. Returns true on the tick the flag is raised.
    pub fn update(
        &mut self,
        settings: &ControlSettings,
        time: f64,
        duty: i32,
        speed: f64,
        angle: f64,
    ) -> bool {
        let saturated = duty.abs() >= settings.actuation_limit;
        let slow = speed.abs() <= settings.stall_tolerance_speed as f64;
        if !(saturated && slow) {
            self.onset = None;
            return false;
        }
        let (since, onset_angle) = *self.onset.get_or_insert((time, angle));
        if self.stalled {
            return false;
        }
        let elapsed_ms = ((time - since) * 1000.0).round() as i64;
        if elapsed_ms >= settings.stall_tolerance_time as i64 {
            self.stalled = true;
            self.latched_angle = Some(onset_angle);
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stall_after_tolerance_time() {
        let settings = ControlSettings::default();
        let mut detector = StallDetector::new();
        let limit = settings.actuation_limit;
        let mut raised = Vec::new();
        for tick in 0..=50 {
            let t = tick as f64 * 0.005;
            if detector.update(&settings, t, limit, 0.0, 12.0 + tick as f64 * 0.01) {
                raised.push(tick);
            }
        }
        // 200 ms at 5 ms per tick.
        assert_eq!(raised, vec![40]);
        assert!(detector.stalled());
        assert_eq!(detector.stall_angle(), Some(12.0));
    }

    #[test]
    fn test_condition_break_resets_timer() {
        let settings = ControlSettings::default();
        let mut detector = StallDetector::new();
        let limit = settings.actuation_limit;
        for tick in 0..30 {
            detector.update(&settings, tick as f64 * 0.005, limit, 0.0, 0.0);
        }
        // One unsaturated tick restarts the window.
        detector.update(&settings, 0.150, limit - 1, 0.0, 0.0);
        for tick in 31..60 {
            detector.update(&settings, tick as f64 * 0.005, limit, 0.0, 0.0);
        }
        assert!(!detector.stalled());
        assert_eq!(detector.stall_angle(), None);
    }

    #[test]
    fn test_moving_motor_is_not_stalled() {
        let settings = ControlSettings::default();
        let mut detector = StallDetector::new();
        for tick in 0..200 {
            detector.update(&settings, tick as f64 * 0.005, settings.actuation_limit, 300.0, 0.0);
        }
        assert!(!detector.stalled());
    }

    #[test]
    fn test_reset_clears_flag() {
        let settings = ControlSettings::default();
        let mut detector = StallDetector::new();
        for tick in 0..100 {
            detector.update(&settings, tick as f64 * 0.005, -settings.actuation_limit, 5.0, 0.0);
        }
        assert!(detector.stalled());
        detector.reset();
        assert!(!detector.stalled());
        assert_eq!(detector.stall_angle(), None);
    }

    #[test]
    fn test_stall_angle_survives_condition_break() {
        let settings = ControlSettings::default();
        let mut detector = StallDetector::new();
        let limit = settings.actuation_limit;
        for tick in 0..=40 {
            detector.update(&settings, tick as f64 * 0.005, limit, 0.0, 4.0);
        }
        assert_eq!(detector.stall_angle(), Some(4.0));
        // Holding afterwards drops out of saturation.
        detector.update(&settings, 0.205, 0, 0.0, 4.5);
        assert!(detector.stalled());
        assert_eq!(detector.stall_angle(), Some(4.0));
    }
}
