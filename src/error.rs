// src/error.rs - Error taxonomy shared by every layer of the control core
use crate::port::Port;
use thiserror::Error;

/// Errors surfaced by the actuator, settings, planner and control layers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServoError {
    /// Out-of-range duration, gear ratio, duty limit or malformed gear train.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    /// Operation not allowed in the current state (e.g. settings changed while busy).
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
    /// No actuator attached to the port.
    #[error("No device on port {0}")]
    NoDevice(Port),
    #[error("Invalid port: {0}")]
    InvalidPort(String),
    /// Transient "not ready yet" state of the hardware. Only retried during attach.
    #[error("Device busy, try again")]
    Again,
    /// Reserved for collaborators that lack an optional capability.
    #[error("Not implemented: {0}")]
    NotImplemented(String),
    /// Fault reported by a hardware collaborator during a tick.
    #[error("I/O error: {0}")]
    Io(String),
}

pub type Result<T> = std::result::Result<T, ServoError>;

impl ServoError {
    pub fn invalid_arg(msg: impl Into<String>) -> Self {
        ServoError::InvalidArgument(msg.into())
    }

    pub fn invalid_op(msg: impl Into<String>) -> Self {
        ServoError::InvalidOperation(msg.into())
    }
}
