/// Error taxonomy for radio, connection, decode and configuration failures
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{Channel, PeripheralId};

/// Failure to turn one characteristic payload into a measurement.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    /// Wire identifier not in the registry, or not confirmed on this connection.
    #[error("unknown channel {0}")]
    UnknownChannel(Uuid),
    #[error("{channel}: need {needed} bytes, got {got}")]
    InsufficientData {
        channel: Channel,
        needed: usize,
        got: usize,
    },
    #[error("{channel}: value {value} is outside the physical range")]
    MalformedPayload { channel: Channel, value: f64 },
}

/// What a [`Radio`](crate::bluetooth::Radio) backend may report.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RadioError {
    #[error("Bluetooth adapter is powered off")]
    PoweredOff,
    #[error("Bluetooth permission denied")]
    PermissionDenied,
    #[error("peripheral {0} not found")]
    PeripheralNotFound(PeripheralId),
    #[error("characteristic {0} not found")]
    CharacteristicNotFound(Uuid),
    #[error("peripheral {0} is not connected")]
    NotConnected(PeripheralId),
    #[error("Bluetooth stack error: {0}")]
    Stack(String),
}

/// Cause carried by [`SessionError::ConnectionFailed`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConnectFailure {
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("cancelled")]
    Cancelled,
    #[error("link lost before negotiation finished")]
    LinkLost,
    #[error(transparent)]
    Radio(#[from] RadioError),
}

/// Caller-visible failures of session commands.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    #[error("Bluetooth is disabled")]
    AdapterDisabled,
    #[error("Bluetooth permissions were not granted")]
    PermissionDenied,
    #[error("a connection attempt is already in progress")]
    AlreadyConnecting,
    #[error("already connected to {0}")]
    AlreadyConnected(PeripheralId),
    #[error("connection to {peripheral} failed: {cause}")]
    ConnectionFailed {
        peripheral: PeripheralId,
        #[source]
        cause: ConnectFailure,
    },
    #[error("no probe is connected")]
    NotConnected,
    #[error("no channel decoded in this read cycle")]
    NoChannelsDecoded,
    #[error(transparent)]
    Radio(RadioError),
}

impl From<RadioError> for SessionError {
    fn from(e: RadioError) -> Self {
        match e {
            RadioError::PoweredOff => SessionError::AdapterDisabled,
            RadioError::PermissionDenied => SessionError::PermissionDenied,
            other => SessionError::Radio(other),
        }
    }
}

/// Invalid environment configuration.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("{name} must be a whole number of seconds, got '{value}'")]
    NotANumber { name: &'static str, value: String },
    #[error("{name} must be between {min} and {max} seconds, got {value}")]
    OutOfRange {
        name: &'static str,
        value: u64,
        min: u64,
        max: u64,
    },
}
