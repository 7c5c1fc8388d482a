// src/sim/mod.rs - Simulated clocks and a first-order DC motor plant
//
// The plant integrates lazily: every driver or encoder call first advances
// the model in 1 ms steps up to the clock's current time.

use crate::error::{Result, ServoError};
use crate::hardware_traits::{Encoder, MotorDriver, TimeInterface};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Steady-state speed per duty unit, counts/s.
pub const SIM_GAIN: f64 = 0.1;
/// Mechanical time constant while driven or braked, seconds.
pub const SIM_TAU: f64 = 0.05;
/// Time constant of the free-wheeling decay while coasting, seconds.
pub const SIM_COAST_TAU: f64 = 0.5;

const STEP: Duration = Duration::from_millis(1);

/// Manually advanced clock shared between the plant and the servo.
#[derive(Debug, Clone, Default)]
pub struct SimClock {
    micros: Arc<AtomicU64>,
}

impl SimClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, by: Duration) {
        self.micros.fetch_add(by.as_micros() as u64, Ordering::SeqCst);
    }

    pub fn set(&self, to: Duration) {
        self.micros.store(to.as_micros() as u64, Ordering::SeqCst);
    }
}

impl TimeInterface for SimClock {
    fn now(&self) -> Duration {
        Duration::from_micros(self.micros.load(Ordering::SeqCst))
    }
}

/// Tokio's monotonic clock. Follows paused and auto-advanced time in tests.
#[derive(Debug, Clone, Copy)]
pub struct TokioClock {
    epoch: tokio::time::Instant,
}

impl TokioClock {
    pub fn new() -> Self {
        Self {
            epoch: tokio::time::Instant::now(),
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeInterface for TokioClock {
    fn now(&self) -> Duration {
        self.epoch.elapsed()
    }
}

#[derive(Debug)]
struct Plant {
    angle: f64,
    speed: f64,
    duty: i32,
    coasting: bool,
    last_update: Duration,
    /// Raw angle minus reported count.
    offset: i64,
    pinned: bool,
    encoder_fault: bool,
    busy_responses: u32,
    absolute: bool,
    /// Uniform encoder noise amplitude, counts.
    noise: i32,
}

impl Plant {
    fn step(&mut self, dt: f64) {
        if self.pinned {
            self.speed = 0.0;
            return;
        }
        let (target, tau) = if self.coasting {
            (0.0, SIM_COAST_TAU)
        } else {
            (SIM_GAIN * self.duty as f64, SIM_TAU)
        };
        self.speed += (target - self.speed) * dt / tau;
        self.angle += self.speed * dt;
    }

    fn advance_to(&mut self, now: Duration) {
        while self.last_update + STEP <= now {
            self.step(STEP.as_secs_f64());
            self.last_update += STEP;
        }
    }
}

/// Simulated motor with encoder. Clones share one plant, so a test can keep
/// a handle while the servo owns the driver and encoder halves.
#[derive(Clone)]
pub struct SimMotor {
    plant: Arc<Mutex<Plant>>,
    clock: Arc<dyn TimeInterface>,
}

impl SimMotor {
    pub fn new(clock: Arc<dyn TimeInterface>) -> Self {
        let now = clock.now();
        Self {
            plant: Arc::new(Mutex::new(Plant {
                angle: 0.0,
                speed: 0.0,
                duty: 0,
                coasting: true,
                last_update: now,
                offset: 0,
                pinned: false,
                encoder_fault: false,
                busy_responses: 0,
                absolute: true,
                noise: 0,
            })),
            clock,
        }
    }

    fn plant(&self) -> Result<MutexGuard<'_, Plant>> {
        let mut plant = self
            .plant
            .lock()
            .map_err(|_| ServoError::Io("simulated plant lock poisoned".to_string()))?;
        plant.advance_to(self.clock.now());
        Ok(plant)
    }

    /// Holds the shaft still, as if blocked by an obstacle.
    pub fn set_pinned(&self, pinned: bool) -> Result<()> {
        self.plant()?.pinned = pinned;
        Ok(())
    }

    /// Makes every encoder read fail with `ServoError::Io`.
    pub fn set_encoder_fault(&self, fault: bool) -> Result<()> {
        self.plant()?.encoder_fault = fault;
        Ok(())
    }

    /// Number of `ready()` calls that report `ServoError::Again`.
    pub fn set_busy_responses(&self, count: u32) -> Result<()> {
        self.plant()?.busy_responses = count;
        Ok(())
    }

    pub fn set_absolute(&self, absolute: bool) -> Result<()> {
        self.plant()?.absolute = absolute;
        Ok(())
    }

    /// Adds uniform noise of up to `counts` to every count reading.
    pub fn set_noise(&self, counts: i32) -> Result<()> {
        self.plant()?.noise = counts.abs();
        Ok(())
    }

    /// Places the shaft at `angle` raw counts without changing the count offset.
    pub fn set_angle(&self, angle: f64) -> Result<()> {
        self.plant()?.angle = angle;
        Ok(())
    }

    /// Raw shaft angle in counts.
    pub fn shaft_angle(&self) -> Result<f64> {
        Ok(self.plant()?.angle)
    }

    /// Last raw duty applied by the driver, `None` while coasting.
    pub fn applied_duty(&self) -> Result<Option<i32>> {
        let plant = self.plant()?;
        Ok((!plant.coasting).then_some(plant.duty))
    }

    pub fn driver(&self) -> Box<dyn MotorDriver> {
        Box::new(self.clone())
    }

    pub fn encoder(&self) -> Box<dyn Encoder> {
        Box::new(self.clone())
    }
}

impl MotorDriver for SimMotor {
    fn ready(&mut self) -> Result<()> {
        let mut plant = self.plant()?;
        if plant.busy_responses > 0 {
            plant.busy_responses -= 1;
            return Err(ServoError::Again);
        }
        Ok(())
    }

    fn drive(&mut self, duty: i32) -> Result<()> {
        let mut plant = self.plant()?;
        plant.duty = duty;
        plant.coasting = false;
        Ok(())
    }

    fn coast(&mut self) -> Result<()> {
        let mut plant = self.plant()?;
        plant.duty = 0;
        plant.coasting = true;
        Ok(())
    }
}

impl Encoder for SimMotor {
    fn count(&mut self) -> Result<i32> {
        let plant = self.plant()?;
        if plant.encoder_fault {
            return Err(ServoError::Io("encoder read failed".to_string()));
        }
        let noise = if plant.noise > 0 {
            rand::random_range(-plant.noise..=plant.noise) as i64
        } else {
            0
        };
        Ok((plant.angle.round() as i64 - plant.offset + noise) as i32)
    }

    fn rate(&mut self) -> Result<i32> {
        let plant = self.plant()?;
        if plant.encoder_fault {
            return Err(ServoError::Io("encoder read failed".to_string()));
        }
        Ok(plant.speed.round() as i32)
    }

    fn reset_count(&mut self, count: i32) -> Result<()> {
        let mut plant = self.plant()?;
        plant.offset = plant.angle.round() as i64 - count as i64;
        Ok(())
    }

    fn absolute_count(&mut self) -> Result<Option<i32>> {
        let plant = self.plant()?;
        if !plant.absolute {
            return Ok(None);
        }
        // Wrapped to -180..180 like an absolute position sensor.
        let wrapped = (plant.angle.round() as i64 + 180).rem_euclid(360) - 180;
        Ok(Some(wrapped as i32))
    }
}
