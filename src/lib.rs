// Allow unusual byte groupings for UUIDs which have standard format
#![allow(clippy::unusual_byte_groupings)]

//! # simple-bluetooth-printer
//!
//! A single Bluetooth printer connection that runs over either BLE (GATT)
//! or Classic (RFCOMM / SPP) behind one lifecycle: discover, connect, write,
//! disconnect, with state notifications pushed to the host.
//!
//! ## Features
//!
//! - **Discovery**: De-duplicated scan results, announced once per device
//! - **One connection**: Reconnecting to the same printer reuses the session;
//!   connecting elsewhere tears the old one down first
//! - **Grace period**: A deferred disconnect survives a quick reconnect
//! - **Chunked writes**: Payloads are split to the link size and paced
//! - **Method calls**: Host commands in, replies and events out
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use simple_bluetooth_printer::{
//!     ConnectConfig, NativePlatform, PrinterManager, Result, TransportKind,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let platform = Arc::new(NativePlatform::new().await?);
//!     let manager = PrinterManager::new(platform);
//!
//!     manager.attach_event_sink(Arc::new(|event: simple_bluetooth_printer::Event| {
//!         println!("{} {:?}", event.method(), event.payload());
//!     }));
//!
//!     manager.start_discovery().await?;
//!     tokio::time::sleep(std::time::Duration::from_secs(5)).await;
//!     manager.stop_discovery().await?;
//!
//!     if let Some(printer) = manager.discovered_devices().first() {
//!         manager.connect(printer.address(), &ConnectConfig::ble()).await?;
//!         manager
//!             .write_data(b"Hello\n\n\n".to_vec().into(), TransportKind::Ble, None)
//!             .await?;
//!         manager.disconnect(None);
//!     }
//!
//!     manager.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Platform Notes
//!
//! ### macOS
//! Requires Bluetooth permission. Add `NSBluetoothAlwaysUsageDescription`
//! to your Info.plist for bundled apps.
//!
//! ### Linux
//! Requires BlueZ. User may need to be in the `bluetooth` group. Classic
//! printers need the `bluez` feature.
//!
//! ### Windows
//! Requires Windows 10 or later with Bluetooth LE support.
//!
//! ## Feature Flags
//!
//! - `serde`: Enable serialization/deserialization for data types
//! - `bluez`: RFCOMM sockets through BlueZ (Linux only)

// Public modules
pub mod chunking;
pub mod command;
pub mod config;
pub mod device;
pub mod discovery;
pub mod error;
pub mod event;
pub mod lifecycle;
pub mod manager;
pub mod platform;
pub mod registry;
pub mod transport;

// Re-exports for convenience
pub use error::{CommandError, Error, ErrorCode, Result};
pub use lifecycle::{ConnectionLifecycle, ConnectionState};
pub use manager::PrinterManager;

// Re-export commonly used types from submodules
pub use chunking::{ChunkingPolicy, Fragment};
pub use command::{Command, MethodCall, Reply, Responder, Value};
pub use config::{
    BleConfig, ClassicConfig, ConnectConfig, ConnectionPriority, LifecycleConfig,
    SPP_SERVICE_UUID,
};
pub use device::{AddressableDevice, BondState, ScanCandidate, TransportKind};
pub use discovery::Discovery;
pub use event::{Event, EventHub, EventSink};
pub use platform::native::NativePlatform;
pub use platform::{BluetoothPlatform, RadioState};
pub use registry::DeviceRegistry;
pub use transport::{TransportFactory, TransportHandle, WriteEndpointResolver};

#[cfg(all(target_os = "linux", feature = "bluez"))]
pub use platform::bluez::BluezRfcommConnector;
