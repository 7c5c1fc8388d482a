// src/main.rs - servoctl: issue one command to a simulated servo and report telemetry
use clap::{Parser, Subcommand};
use serde::Serialize;
use servoctl::config::{self, Config, MotorConfig, MotorKind};
use servoctl::control::TrajectoryInfo;
use servoctl::hardware_traits::TimeInterface;
use servoctl::poller::{self, MotorPoller, SharedPoller};
use servoctl::sim::{SimMotor, TokioClock};
use servoctl::{MotorHandle, Port, Then};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Closed-loop servo controller running against simulated motors.
#[derive(Parser, Debug)]
#[command(name = "servoctl", version, about)]
struct Cli {
    /// Path to a TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port of the servo to command
    #[arg(short, long, default_value = "A")]
    port: Port,

    /// Record the maneuver and write the samples to this CSV file
    #[arg(long)]
    log: Option<PathBuf>,

    /// Encoder noise of the simulated motor, counts
    #[arg(long, default_value_t = 0)]
    noise: i32,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run at constant speed for a while, then stop
    Run {
        #[arg(allow_negative_numbers = true)]
        speed: i32,
        #[arg(long, default_value_t = 1000)]
        for_ms: u64,
    },
    /// Run at a speed for a given time
    RunTime {
        #[arg(allow_negative_numbers = true)]
        speed: i32,
        duration_ms: i64,
        #[arg(long, default_value = "hold")]
        then: Then,
    },
    /// Rotate by a relative angle
    RunAngle {
        #[arg(allow_negative_numbers = true)]
        speed: i32,
        #[arg(allow_negative_numbers = true)]
        angle: i32,
        #[arg(long, default_value = "hold")]
        then: Then,
    },
    /// Move to an absolute angle
    RunTarget {
        speed: i32,
        #[arg(allow_negative_numbers = true)]
        target: i32,
        #[arg(long, default_value = "hold")]
        then: Then,
    },
    /// Run until the shaft hits a simulated obstacle
    RunUntilStalled {
        #[arg(allow_negative_numbers = true)]
        speed: i32,
        #[arg(long, default_value = "coast")]
        then: Then,
        /// Temporary actuation limit, percent
        #[arg(long)]
        duty_limit: Option<i32>,
        /// Time after which the simulated shaft is blocked
        #[arg(long, default_value_t = 500)]
        obstacle_ms: u64,
    },
    /// Follow a target angle without a planned profile
    Track {
        #[arg(allow_negative_numbers = true)]
        target: i32,
        #[arg(long, default_value_t = 500)]
        for_ms: u64,
    },
    /// Hold the current angle
    Hold {
        #[arg(long, default_value_t = 500)]
        for_ms: u64,
    },
}

#[derive(Serialize)]
struct Report {
    port: Port,
    angle: i32,
    speed: i32,
    done: bool,
    stalled: bool,
    stall_angle: Option<i32>,
    trajectory: TrajectoryInfo,
}

async fn attach(
    poller: &SharedPoller,
    config: &Config,
    port: Port,
    motor: &MotorConfig,
    sim: &SimMotor,
    clock: Arc<dyn TimeInterface>,
) -> servoctl::Result<()> {
    match motor.kind {
        MotorKind::Dc => {
            poller::attach_dc(poller, port, sim.driver(), motor.direction, &config.retry).await
        }
        MotorKind::Servo => {
            poller::attach_servo(
                poller,
                port,
                sim.driver(),
                sim.encoder(),
                clock,
                motor.direction,
                motor.control_settings()?,
                &config.retry,
            )
            .await
        }
    }
}

async fn execute(handle: &MotorHandle, sim: &SimMotor, command: Command) -> servoctl::Result<Option<i32>> {
    match command {
        Command::Run { speed, for_ms } => {
            handle.run(speed)?;
            tokio::time::sleep(Duration::from_millis(for_ms)).await;
            handle.stop()?;
        }
        Command::RunTime { speed, duration_ms, then } => {
            handle.run_time(speed, duration_ms, then, true).await?;
        }
        Command::RunAngle { speed, angle, then } => {
            handle.run_angle(speed, angle, then, true).await?;
        }
        Command::RunTarget { speed, target, then } => {
            handle.run_target(speed, target, then, true).await?;
        }
        Command::RunUntilStalled { speed, then, duty_limit, obstacle_ms } => {
            let obstacle = sim.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(obstacle_ms)).await;
                if let Err(e) = obstacle.set_pinned(true) {
                    tracing::warn!("Could not place obstacle: {}", e);
                }
            });
            let angle = handle.run_until_stalled(speed, then, duty_limit).await?;
            return Ok(Some(angle));
        }
        Command::Track { target, for_ms } => {
            handle.track_target(target)?;
            tokio::time::sleep(Duration::from_millis(for_ms)).await;
        }
        Command::Hold { for_ms } => {
            handle.hold()?;
            tokio::time::sleep(Duration::from_millis(for_ms)).await;
        }
    }
    Ok(None)
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    // Telemetry goes to stdout, logs to stderr.
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    tracing::info!("Starting servoctl {}", env!("CARGO_PKG_VERSION"));

    let mut config = match &cli.config {
        Some(path) => config::load_config(path)?,
        None => Config::default(),
    };
    config.motors.entry(cli.port).or_default();

    let clock: Arc<dyn TimeInterface> = Arc::new(TokioClock::new());
    let poller = MotorPoller::shared();
    let mut sims = BTreeMap::new();
    for (&port, motor) in &config.motors {
        let sim = SimMotor::new(clock.clone());
        sim.set_noise(cli.noise)?;
        attach(&poller, &config, port, motor, &sim, clock.clone()).await?;
        sims.insert(port, sim);
    }
    let sim = sims
        .get(&cli.port)
        .ok_or(servoctl::ServoError::NoDevice(cli.port))?;

    let ticker = poller::spawn(poller.clone(), config.poller.period());
    let handle = MotorHandle::new(poller.clone(), cli.port, config.poller.wait_interval());
    if cli.log.is_some() {
        handle.log_start(servoctl::control::trajectory::MAX_DURATION_MS)?;
    }

    let result = execute(&handle, sim, cli.command).await;
    ticker.abort();
    let stall_angle = result?;

    let report = Report {
        port: cli.port,
        angle: handle.angle()?,
        speed: handle.speed()?,
        done: handle.done()?,
        stalled: handle.stalled()?,
        stall_angle,
        trajectory: handle.trajectory()?,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);

    if let Some(path) = &cli.log {
        handle.log_save_csv(path)?;
    }
    Ok(())
}
