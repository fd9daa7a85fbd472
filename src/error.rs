//! Error types for the simple-bluetooth-printer crate.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// The main error type for this crate.
#[derive(Error, Debug)]
pub enum Error {
    /// Bluetooth-related error from the underlying BLE library.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// Socket or stream I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Bluetooth is not available or is disabled on this system.
    #[error("Bluetooth not available or disabled")]
    BluetoothUnavailable,

    /// The application is not allowed to use Bluetooth.
    #[error("Bluetooth permission not granted")]
    PermissionDenied,

    /// The supplied address is empty or malformed.
    #[error("Invalid address: {address:?}")]
    InvalidAddress {
        /// The rejected address.
        address: String,
    },

    /// The transport could not resolve the address to a device.
    #[error("Device not found: {address}")]
    DeviceNotFound {
        /// The address that was searched for.
        address: String,
    },

    /// Operation requires a connection but none is established.
    #[error("Not connected")]
    NotConnected,

    /// Failed to establish a connection to the device.
    #[error("Connection failed: {reason}")]
    ConnectionFailed {
        /// Description of why the connection failed.
        reason: String,
    },

    /// The connect attempt did not finish before its deadline.
    #[error("Connection timed out after {timeout:?}")]
    Timeout {
        /// The deadline that elapsed.
        timeout: Duration,
    },

    /// The connected BLE device exposes no writable characteristic.
    #[error("No writable characteristic found")]
    NoWritableEndpoint,

    /// Characteristic not found on the device.
    #[error("Characteristic not found: {uuid}")]
    CharacteristicNotFound {
        /// The UUID of the characteristic that was not found.
        uuid: String,
    },

    /// A write was aborted part way through.
    #[error("Write failed: {reason}")]
    WriteFailed {
        /// Description of the failure.
        reason: String,
    },

    /// The requested operation is not supported by the active transport.
    #[error("Operation not supported: {operation}")]
    NotSupported {
        /// Description of the unsupported operation.
        operation: String,
    },

    /// An invalid parameter was provided.
    #[error("Invalid parameter: {name} = {value}")]
    InvalidParameter {
        /// The name of the parameter.
        name: String,
        /// The invalid value that was provided.
        value: String,
    },

    /// An internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Error codes surfaced across the command boundary.
///
/// The code travels as the decimal string of its ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum ErrorCode {
    /// The radio is missing, powered off or unsupported.
    BluetoothNotAvailable = 0,
    /// The host refused Bluetooth access.
    PermissionNotGranted = 1,
    /// Any other failure; carries a free-text message.
    ErrorWithMessage = 2,
    /// Unclassified failure.
    Unknown = 3,
}

impl ErrorCode {
    /// The string-encoded ordinal, e.g. `"2"`.
    pub fn code_string(&self) -> String {
        (*self as u8).to_string()
    }
}

/// A structured failure reported to the caller of a command.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CommandError {
    /// Error classification.
    pub code: ErrorCode,
    /// Optional human readable detail.
    pub message: Option<String>,
}

impl CommandError {
    /// Create an error with a message.
    pub fn with_message(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: Some(message.into()),
        }
    }

    /// Create an error without a message.
    pub fn bare(code: ErrorCode) -> Self {
        Self {
            code,
            message: None,
        }
    }
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(message) => write!(f, "[{}] {}", self.code.code_string(), message),
            None => write!(f, "[{}]", self.code.code_string()),
        }
    }
}

impl std::error::Error for CommandError {}

impl From<&Error> for CommandError {
    fn from(error: &Error) -> Self {
        match error {
            Error::BluetoothUnavailable => Self::bare(ErrorCode::BluetoothNotAvailable),
            Error::PermissionDenied => Self::bare(ErrorCode::PermissionNotGranted),
            Error::Internal(message) => Self::with_message(ErrorCode::Unknown, message.clone()),
            other => Self::with_message(ErrorCode::ErrorWithMessage, other.to_string()),
        }
    }
}

impl From<Error> for CommandError {
    fn from(error: Error) -> Self {
        Self::from(&error)
    }
}
