//! Platform Bluetooth stacks.
//!
//! A [`BluetoothPlatform`] answers radio and bonding queries, runs scans and
//! builds transport handles. [`native`] backs BLE with btleplug on every
//! desktop OS; `bluez` adds RFCOMM on Linux; [`fake`] is an in-memory stack.

#[cfg(all(target_os = "linux", feature = "bluez"))]
pub mod bluez;
pub mod fake;
pub mod native;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::device::{AddressableDevice, ScanCandidate};
use crate::error::{Error, Result};
use crate::transport::TransportFactory;

/// State of the local Bluetooth radio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum RadioState {
    /// The host has no Bluetooth support.
    Unsupported = 2,
    /// The application may not use Bluetooth.
    Unauthorized = 3,
    /// The radio is switched off.
    PoweredOff = 4,
    /// The radio is on and usable.
    Available = 5,
}

impl RadioState {
    /// Integer code of the state.
    pub fn code(&self) -> u8 {
        *self as u8
    }

    /// Fail unless the radio can be used.
    pub fn ensure_available(&self) -> Result<()> {
        match self {
            Self::Available => Ok(()),
            Self::Unauthorized => Err(Error::PermissionDenied),
            Self::Unsupported | Self::PoweredOff => Err(Error::BluetoothUnavailable),
        }
    }
}

/// A host Bluetooth stack.
#[async_trait]
pub trait BluetoothPlatform: TransportFactory + 'static {
    /// Query the radio.
    async fn radio_state(&self) -> Result<RadioState>;

    /// Devices the system already knows about.
    async fn bonded_devices(&self) -> Result<Vec<AddressableDevice>>;

    /// Start scanning; every raw result is sent to `results` until
    /// [`stop_scan`](Self::stop_scan).
    async fn start_scan(&self, results: mpsc::UnboundedSender<ScanCandidate>) -> Result<()>;

    /// Stop scanning. Safe to call when no scan runs.
    async fn stop_scan(&self) -> Result<()>;
}
