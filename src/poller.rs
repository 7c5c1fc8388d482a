// src/poller.rs - Per-port actuator table and the periodic control tick
use crate::config::RetryConfig;
use crate::control::ControlSettings;
use crate::dcmotor::{DcMotor, Direction};
use crate::error::{Result, ServoError};
use crate::hardware_traits::{Encoder, MotorDriver, TimeInterface};
use crate::motor::Actuator;
use crate::port::{Port, NUM_PORTS};
use crate::servo::Servo;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Owns every attached actuator. Commands and the control tick both go
/// through this table, so a tick never sees a half-installed command.
#[derive(Debug, Default)]
pub struct MotorPoller {
    slots: [Option<Actuator>; NUM_PORTS],
    /// Last fault raised by the control tick of each port.
    faults: [Option<ServoError>; NUM_PORTS],
}

pub type SharedPoller = Arc<Mutex<MotorPoller>>;

/// Locks the shared table. A poisoned lock is reported, not propagated as a panic.
pub fn lock(poller: &SharedPoller) -> Result<MutexGuard<'_, MotorPoller>> {
    poller
        .lock()
        .map_err(|_| ServoError::invalid_op("motor table lock poisoned"))
}

impl MotorPoller {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedPoller {
        Arc::new(Mutex::new(Self::new()))
    }

    /// Installs an actuator on its port, replacing whatever was there.
    pub fn attach(&mut self, actuator: Actuator) -> Option<Actuator> {
        let port = actuator.port();
        self.faults[port.index()] = None;
        tracing::info!("Attached {} on port {}", kind(&actuator), port);
        self.slots[port.index()].replace(actuator)
    }

    pub fn detach(&mut self, port: Port) -> Option<Actuator> {
        let removed = self.slots[port.index()].take();
        if removed.is_some() {
            tracing::info!("Detached port {}", port);
        }
        removed
    }

    pub fn actuator(&self, port: Port) -> Result<&Actuator> {
        self.slots[port.index()]
            .as_ref()
            .ok_or(ServoError::NoDevice(port))
    }

    pub fn actuator_mut(&mut self, port: Port) -> Result<&mut Actuator> {
        self.slots[port.index()]
            .as_mut()
            .ok_or(ServoError::NoDevice(port))
    }

    pub fn servo(&self, port: Port) -> Result<&Servo> {
        self.actuator(port)?.servo()
    }

    pub fn servo_mut(&mut self, port: Port) -> Result<&mut Servo> {
        self.actuator_mut(port)?.servo_mut()
    }

    pub fn ports(&self) -> impl Iterator<Item = Port> + '_ {
        Port::ALL
            .into_iter()
            .filter(|port| self.slots[port.index()].is_some())
    }

    /// Takes the fault recorded by the last failing tick of `port`.
    pub fn take_fault(&mut self, port: Port) -> Option<ServoError> {
        self.faults[port.index()].take()
    }

    /// One control tick over every attached actuator. Faults are recorded
    /// per port for the waiter to pick up.
    pub fn poll(&mut self) {
        for (slot, fault) in self.slots.iter_mut().zip(self.faults.iter_mut()) {
            let Some(actuator) = slot else {
                continue;
            };
            if let Err(e) = actuator.tick() {
                tracing::warn!("Control tick failed on port {}: {}", actuator.port(), e);
                *fault = Some(e);
            }
        }
    }
}

fn kind(actuator: &Actuator) -> &'static str {
    match actuator {
        Actuator::DirectDrive(_) => "DC motor",
        Actuator::ServoControlled(_) => "servo",
    }
}

/// Sets up the motor, retrying while the driver reports `Again`.
pub async fn setup_with_retry(
    motor: &mut DcMotor,
    direction: Direction,
    policy: &RetryConfig,
) -> Result<()> {
    let mut attempt = 1;
    loop {
        match motor.setup(direction) {
            Err(ServoError::Again) if attempt < policy.max_attempts => {
                tracing::warn!(
                    "Port {} not ready (attempt {}/{}), retrying in {:?}",
                    motor.port(),
                    attempt,
                    policy.max_attempts,
                    policy.interval()
                );
                attempt += 1;
                tokio::time::sleep(policy.interval()).await;
            }
            result => return result,
        }
    }
}

pub async fn attach_dc(
    poller: &SharedPoller,
    port: Port,
    driver: Box<dyn MotorDriver>,
    direction: Direction,
    policy: &RetryConfig,
) -> Result<()> {
    let mut motor = DcMotor::new(port, driver);
    setup_with_retry(&mut motor, direction, policy).await?;
    lock(poller)?.attach(Actuator::DirectDrive(motor));
    Ok(())
}

#[allow(clippy::too_many_arguments)]
pub async fn attach_servo(
    poller: &SharedPoller,
    port: Port,
    driver: Box<dyn MotorDriver>,
    encoder: Box<dyn Encoder>,
    clock: Arc<dyn TimeInterface>,
    direction: Direction,
    settings: ControlSettings,
    policy: &RetryConfig,
) -> Result<()> {
    let mut motor = DcMotor::new(port, driver);
    setup_with_retry(&mut motor, direction, policy).await?;
    let servo = Servo::new(motor, encoder, clock, settings);
    lock(poller)?.attach(Actuator::ServoControlled(servo));
    Ok(())
}

/// Runs the control tick every `period` until the task is aborted.
pub fn spawn(poller: SharedPoller, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            match poller.lock() {
                Ok(mut table) => table.poll(),
                Err(_) => {
                    tracing::error!("Motor table lock poisoned, stopping control loop");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimClock, SimMotor};

    fn sim() -> (SimClock, SimMotor) {
        let clock = SimClock::new();
        let motor = SimMotor::new(Arc::new(clock.clone()));
        (clock, motor)
    }

    fn fast_retry(max_attempts: u32) -> RetryConfig {
        RetryConfig { max_attempts, interval_ms: 1 }
    }

    #[test]
    fn test_missing_port_is_no_device() {
        let poller = MotorPoller::shared();
        let table = lock(&poller).unwrap();
        assert_eq!(table.actuator(Port::D).unwrap_err(), ServoError::NoDevice(Port::D));
        assert_eq!(table.ports().count(), 0);
    }

    #[test]
    fn test_attach_retries_until_ready() {
        let poller = MotorPoller::shared();
        let (_, motor) = sim();
        motor.set_busy_responses(3).unwrap();
        tokio_test::block_on(attach_dc(
            &poller,
            Port::A,
            motor.driver(),
            Direction::Clockwise,
            &fast_retry(5),
        ))
        .unwrap();
        assert_eq!(lock(&poller).unwrap().ports().collect::<Vec<_>>(), vec![Port::A]);
    }

    #[tokio::test]
    async fn test_attach_gives_up_after_max_attempts() {
        let poller = MotorPoller::shared();
        let (_, motor) = sim();
        motor.set_busy_responses(10).unwrap();
        let err = attach_dc(&poller, Port::A, motor.driver(), Direction::Clockwise, &fast_retry(3))
            .await
            .unwrap_err();
        assert_eq!(err, ServoError::Again);
        assert!(lock(&poller).unwrap().actuator(Port::A).is_err());
    }

    #[tokio::test]
    async fn test_poll_records_faults_per_port() {
        let poller = MotorPoller::shared();
        let (clock, motor) = sim();
        attach_servo(
            &poller,
            Port::E,
            motor.driver(),
            motor.encoder(),
            Arc::new(clock.clone()),
            Direction::Clockwise,
            ControlSettings::default(),
            &fast_retry(1),
        )
        .await
        .unwrap();

        let mut table = lock(&poller).unwrap();
        table.servo_mut(Port::E).unwrap().run(200).unwrap();
        clock.advance(Duration::from_millis(5));
        table.poll();
        assert!(table.take_fault(Port::E).is_none());

        motor.set_encoder_fault(true).unwrap();
        clock.advance(Duration::from_millis(5));
        table.poll();
        assert!(matches!(table.take_fault(Port::E), Some(ServoError::Io(_))));
        assert!(table.take_fault(Port::E).is_none());
        assert!(table.servo(Port::E).unwrap().done());
    }
}
