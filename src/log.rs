// src/log.rs - Per-servo data logger
use crate::error::{Result, ServoError};
use serde::Serialize;
use std::path::Path;

/// Default number of samples kept per recording.
pub const LOG_CAPACITY: usize = 10_000;

/// One control tick as seen by the logger. Angles and speeds are counts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LogSample {
    /// Milliseconds since the recording started.
    pub time_ms: i64,
    pub angle: i32,
    pub speed: i32,
    pub duty: i32,
    pub reference_angle: f64,
    pub reference_speed: f64,
}

#[derive(Debug, Clone)]
pub struct ServoLog {
    capacity: usize,
    samples: Vec<LogSample>,
    started: f64,
    /// End of the recording window, seconds on the control clock.
    until: Option<f64>,
}

impl Default for ServoLog {
    fn default() -> Self {
        Self::with_capacity(LOG_CAPACITY)
    }
}

impl ServoLog {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            samples: Vec::new(),
            started: 0.0,
            until: None,
        }
    }

    /// Starts a new recording of `duration_ms` from `now`, dropping the old one.
    pub fn start(&mut self, now: f64, duration_ms: i64) -> Result<()> {
        if duration_ms < 0 {
            return Err(ServoError::invalid_arg(format!(
                "log duration must be >= 0, got {duration_ms}"
            )));
        }
        self.samples.clear();
        self.started = now;
        self.until = Some(now + duration_ms as f64 / 1000.0);
        tracing::debug!(duration_ms, capacity = self.capacity, "servo log armed");
        Ok(())
    }

    pub fn stop(&mut self) {
        self.until = None;
    }

    pub fn is_armed(&self) -> bool {
        self.until.is_some()
    }

    /// Appends a sample taken at `now`. Disarms once the window has elapsed
    /// or the buffer is full.
    pub fn record(&mut self, now: f64, sample: LogSample) {
        let Some(until) = self.until else {
            return;
        };
        if now > until || self.samples.len() >= self.capacity {
            self.stop();
            return;
        }
        self.samples.push(LogSample {
            time_ms: ((now - self.started) * 1000.0).round() as i64,
            ..sample
        });
    }

    pub fn samples(&self) -> &[LogSample] {
        &self.samples
    }

    pub fn save_csv(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let mut writer = csv::Writer::from_path(path)
            .map_err(|e| ServoError::Io(format!("{}: {e}", path.display())))?;
        for sample in &self.samples {
            writer
                .serialize(sample)
                .map_err(|e| ServoError::Io(e.to_string()))?;
        }
        writer.flush().map_err(|e| ServoError::Io(e.to_string()))?;
        tracing::info!(samples = self.samples.len(), path = %path.display(), "servo log saved");
        Ok(())
    }
}
