//! Transport and command error types.

use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Errors raised by the transport link and its radio backend.
///
/// Cloneable so the same value can be returned to the caller and
/// published on the event channel.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    /// Runtime radio/location permission not granted.
    #[error("Bluetooth permission denied")]
    PermissionDenied,

    /// Radio hardware is switched off.
    #[error("Bluetooth is not powered on")]
    PoweredOff,

    /// No usable Bluetooth adapter on this host.
    #[error("No Bluetooth adapter found")]
    NoAdapter,

    /// Empty device name or prefix handed to a scan helper.
    #[error("Invalid scan target: {0}")]
    InvalidTarget(String),

    /// Nothing matching the target advertised within the scan window.
    #[error("Device not found: {target} (waited {waited:?})")]
    DiscoveryTimeout { target: String, waited: Duration },

    /// Hardware scan could not be started or failed mid-way.
    #[error("Scan failed: {0}")]
    Scan(String),

    /// Physical connection failed.
    #[error("Connection failed: {0}")]
    Connection(String),

    /// Physical connection did not complete in time.
    #[error("Connection timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// Lock service missing after discovery.
    #[error("Service not found: {0}")]
    ServiceNotFound(Uuid),

    /// Command characteristic missing after discovery.
    #[error("Characteristic not found: {0}")]
    CharacteristicNotFound(Uuid),

    /// Operation needs an active link.
    #[error("Device not connected")]
    NotConnected,

    /// Local write call failed.
    #[error("Write failed: {0}")]
    Write(String),

    /// Configured UUID string does not parse.
    #[error("Invalid UUID {value}: {reason}")]
    InvalidUuid { value: String, reason: String },

    /// Any other failure reported by the radio bindings.
    #[error("Radio error: {0}")]
    Radio(String),
}

impl LinkError {
    /// Permission or power problems detected before any scan
    pub fn is_precondition(&self) -> bool {
        matches!(self, Self::PermissionDenied | Self::PoweredOff | Self::NoAdapter)
    }

    /// Expected GATT layout missing on an otherwise healthy link
    pub fn is_protocol_structure(&self) -> bool {
        matches!(
            self,
            Self::ServiceNotFound(_) | Self::CharacteristicNotFound(_)
        )
    }
}

/// Errors raised while sending a logical command.
///
/// A response timeout or a 0x80 reply is not an error; both come back as a
/// failed [`CommandOutcome`](super::orchestrator::CommandOutcome).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// Another command is still sending or awaiting its response.
    #[error("Another command is already in progress")]
    Busy,

    /// Transport reports no active link.
    #[error("Device not connected")]
    NotConnected,

    /// A byte kept failing at the radio layer.
    #[error("Byte 0x{byte:02X} failed after {attempts} attempts")]
    Transmission { byte: u8, attempts: u32 },

    /// `cancel_sending` was called while this command was in flight.
    #[error("Command cancelled")]
    Cancelled,

    /// A card command was requested without one of its input fields.
    #[error("Missing command parameter: {0}")]
    MissingParameter(&'static str),
}
