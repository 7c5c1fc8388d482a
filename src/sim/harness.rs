//! CLI entry point for the simulation harness: run a scenario of servo
//! commands on a simulated clock and write the servo log as CSV.
//!
//! A scenario is a TOML file:
//!
//! ```toml
//! gears = [12, 36]
//! noise = 1
//!
//! [[step]]
//! command = "run_target"
//! speed = 300
//! angle = 90
//! then = "hold"
//!
//! [[step]]
//! command = "wait"
//! ms = 500
//! ```

use clap::Parser;
use serde::Deserialize;
use servoctl::control::{ControlSettings, Gears, Then};
use servoctl::dcmotor::{DcMotor, Direction};
use servoctl::hardware_traits::TimeInterface;
use servoctl::sim::{SimClock, SimMotor};
use servoctl::{Port, Servo, ServoError};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Simulation Harness CLI
#[derive(Parser, Debug)]
#[command(name = "sim-harness", about = "Run a servo scenario on a simulated motor and dump a CSV trace.")]
struct Cli {
    /// Scenario TOML file
    scenario: PathBuf,

    /// Output CSV file
    #[arg(short, long, default_value = "servo_log.csv")]
    output: PathBuf,

    /// Control tick period in milliseconds
    #[arg(long, default_value_t = 5)]
    period_ms: u64,
}

#[derive(Debug, Deserialize)]
struct Scenario {
    #[serde(default)]
    direction: Direction,
    #[serde(default)]
    gears: Option<Gears>,
    #[serde(default)]
    noise: i32,
    #[serde(default, rename = "step")]
    steps: Vec<Step>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
enum Step {
    Run { speed: i32 },
    RunTime { speed: i32, ms: i64, #[serde(default)] then: Then },
    RunAngle { speed: i32, angle: i32, #[serde(default)] then: Then },
    RunTarget { speed: i32, angle: i32, #[serde(default)] then: Then },
    RunUntilStalled { speed: i32, #[serde(default)] then: Then },
    Track { angle: i32 },
    Hold,
    Stop,
    Brake,
    Dc { duty: i32 },
    /// Block or release the simulated shaft.
    Pin { pinned: bool },
    /// Let the control loop run.
    Wait { ms: u64 },
    /// Let the control loop run until the maneuver is done or stalled.
    WaitDone {
        #[serde(default = "default_timeout_ms")]
        timeout_ms: u64,
    },
}

fn default_timeout_ms() -> u64 { 10_000 }

struct Harness {
    clock: SimClock,
    sim: SimMotor,
    servo: Servo,
    period: Duration,
}

impl Harness {
    fn new(scenario: &Scenario, period: Duration) -> Result<Self, ServoError> {
        let clock = SimClock::new();
        let time: Arc<dyn TimeInterface> = Arc::new(clock.clone());
        let sim = SimMotor::new(time.clone());
        sim.set_noise(scenario.noise)?;
        let mut motor = DcMotor::new(Port::A, sim.driver());
        motor.setup(scenario.direction)?;
        let settings = ControlSettings::from_gears(scenario.gears.as_ref())?;
        let servo = Servo::new(motor, sim.encoder(), time, settings);
        Ok(Self { clock, sim, servo, period })
    }

    fn tick(&mut self) -> Result<(), ServoError> {
        self.clock.advance(self.period);
        self.servo.control_update()
    }

    fn run_for(&mut self, ms: u64) -> Result<(), ServoError> {
        let ticks = ms / self.period.as_millis().max(1) as u64;
        for _ in 0..ticks {
            self.tick()?;
        }
        Ok(())
    }

    fn apply(&mut self, step: &Step) -> Result<(), ServoError> {
        tracing::info!("{:?}", step);
        match *step {
            Step::Run { speed } => self.servo.run(speed),
            Step::RunTime { speed, ms, then } => self.servo.run_time(speed, ms, then),
            Step::RunAngle { speed, angle, then } => self.servo.run_angle(speed, angle, then),
            Step::RunTarget { speed, angle, then } => self.servo.run_target(speed, angle, then),
            Step::RunUntilStalled { speed, then } => self.servo.run_until_stalled(speed, then),
            Step::Track { angle } => self.servo.track_target(angle),
            Step::Hold => self.servo.hold(),
            Step::Stop => self.servo.stop(),
            Step::Brake => self.servo.brake(),
            Step::Dc { duty } => self.servo.dc(duty),
            Step::Pin { pinned } => self.sim.set_pinned(pinned),
            Step::Wait { ms } => self.run_for(ms),
            Step::WaitDone { timeout_ms } => {
                let deadline = self.clock.now() + Duration::from_millis(timeout_ms);
                while !(self.servo.done() || self.servo.stalled()) {
                    if self.clock.now() >= deadline {
                        tracing::warn!("Timed out after {} ms waiting for completion", timeout_ms);
                        break;
                    }
                    self.tick()?;
                }
                Ok(())
            }
        }
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();
    let cli = Cli::parse();

    let scenario: Scenario = match std::fs::read_to_string(&cli.scenario)
        .map_err(|e| e.to_string())
        .and_then(|text| toml::from_str(&text).map_err(|e| e.to_string()))
    {
        Ok(scenario) => scenario,
        Err(e) => {
            eprintln!("Failed to load scenario {}: {e}", cli.scenario.display());
            std::process::exit(1);
        }
    };

    let period = Duration::from_millis(cli.period_ms.max(1));
    let result = Harness::new(&scenario, period).and_then(|mut harness| {
        harness
            .servo
            .log_start(servoctl::control::trajectory::MAX_DURATION_MS)?;
        for step in &scenario.steps {
            harness.apply(step)?;
        }
        harness.servo.log().save_csv(&cli.output)?;
        Ok(harness)
    });

    match result {
        Ok(harness) => println!(
            "Wrote {} samples to {} (final shaft angle {:.1})",
            harness.servo.log().samples().len(),
            cli.output.display(),
            harness.sim.shaft_angle().unwrap_or(f64::NAN)
        ),
        Err(e) => {
            eprintln!("Scenario failed: {e}");
            std::process::exit(1);
        }
    }
}
