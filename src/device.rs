//! Discovered and bonded device records.

use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use crate::command::Value;

/// The transport a device is reached over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TransportKind {
    /// Bluetooth Low Energy (GATT).
    #[default]
    Ble,
    /// Bluetooth Classic (RFCOMM serial port).
    Classic,
}

impl TransportKind {
    /// Map the `isBLE` call argument to a transport kind.
    pub fn from_is_ble(is_ble: bool) -> Self {
        if is_ble {
            Self::Ble
        } else {
            Self::Classic
        }
    }

    /// Check if this is the BLE transport.
    pub fn is_ble(&self) -> bool {
        matches!(self, Self::Ble)
    }

    /// Device type code reported in attribute maps.
    pub fn device_type_code(&self) -> i64 {
        match self {
            Self::Classic => 1,
            Self::Ble => 2,
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ble => write!(f, "BLE"),
            Self::Classic => write!(f, "Classic"),
        }
    }
}

/// Pairing state of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum BondState {
    /// Not paired.
    #[default]
    None = 10,
    /// Pairing in progress.
    Bonding = 11,
    /// Paired.
    Bonded = 12,
}

/// Transport-specific classification integers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceClassification {
    /// Full class-of-device value (0 when unknown).
    pub device_class: u32,
    /// Major class-of-device value (0 when unknown).
    pub major_device_class: u32,
    /// Pairing state.
    pub bond_state: BondState,
}

/// A discovered or bonded device.
///
/// Two records are equal when their display name and address are equal;
/// signal strength and classification do not take part.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AddressableDevice {
    address: String,
    display_name: String,
    signal_strength: Option<i16>,
    transport: TransportKind,
    classification: DeviceClassification,
}

impl AddressableDevice {
    /// Create a new device record.
    pub fn new(
        address: impl Into<String>,
        display_name: impl Into<String>,
        transport: TransportKind,
    ) -> Self {
        Self {
            address: address.into(),
            display_name: display_name.into(),
            signal_strength: None,
            transport,
            classification: DeviceClassification::default(),
        }
    }

    /// Set the signal strength (RSSI in dBm).
    pub fn with_signal_strength(mut self, rssi: Option<i16>) -> Self {
        self.signal_strength = rssi;
        self
    }

    /// Set the classification flags.
    pub fn with_classification(mut self, classification: DeviceClassification) -> Self {
        self.classification = classification;
        self
    }

    /// Transport-specific address.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Advertised or cached device name.
    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// Signal strength in dBm, if known.
    pub fn signal_strength(&self) -> Option<i16> {
        self.signal_strength
    }

    /// The transport the device was seen on.
    pub fn transport(&self) -> TransportKind {
        self.transport
    }

    /// Classification flags.
    pub fn classification(&self) -> DeviceClassification {
        self.classification
    }

    /// Check whether this record shares identity with `name`/`address`.
    pub fn same_identity(&self, name: &str, address: &str) -> bool {
        self.display_name == name && self.address == address
    }

    /// Render the record as the attribute map pushed to the host.
    pub fn to_attribute_map(&self) -> BTreeMap<String, Value> {
        let mut map = BTreeMap::new();
        map.insert("name".to_string(), Value::from(self.display_name.as_str()));
        map.insert("address".to_string(), Value::from(self.address.as_str()));
        map.insert(
            "rssi".to_string(),
            Value::Int(self.signal_strength.map(i64::from).unwrap_or(-1)),
        );
        map.insert(
            "type".to_string(),
            Value::Int(self.transport.device_type_code()),
        );
        map.insert(
            "deviceClass".to_string(),
            Value::Int(i64::from(self.classification.device_class)),
        );
        map.insert(
            "majorDeviceClass".to_string(),
            Value::Int(i64::from(self.classification.major_device_class)),
        );
        map.insert(
            "bondState".to_string(),
            Value::Int(self.classification.bond_state as i64),
        );
        map
    }
}

impl PartialEq for AddressableDevice {
    fn eq(&self, other: &Self) -> bool {
        self.display_name == other.display_name && self.address == other.address
    }
}

impl Eq for AddressableDevice {}

impl Hash for AddressableDevice {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.display_name.hash(state);
        self.address.hash(state);
    }
}

/// Whether an advertisement says the device accepts connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Connectable {
    /// The advertisement carries no connectability information.
    #[default]
    Unknown,
    /// Explicitly connectable.
    Yes,
    /// Explicitly marked non-connectable.
    No,
}

/// A raw scan result, before filtering and deduplication.
#[derive(Debug, Clone)]
pub struct ScanCandidate {
    /// Transport-specific address.
    pub address: String,
    /// Advertised name, if any.
    pub name: Option<String>,
    /// Signal strength in dBm.
    pub rssi: Option<i16>,
    /// Transport the advertisement arrived on.
    pub transport: TransportKind,
    /// Classification flags.
    pub classification: DeviceClassification,
    /// Connectability flag from the advertisement.
    pub connectable: Connectable,
}

impl ScanCandidate {
    /// Create a BLE candidate with the given name and address.
    pub fn ble(address: impl Into<String>, name: Option<&str>) -> Self {
        Self {
            address: address.into(),
            name: name.map(str::to_string),
            rssi: None,
            transport: TransportKind::Ble,
            classification: DeviceClassification::default(),
            connectable: Connectable::Unknown,
        }
    }

    /// Set the signal strength.
    pub fn with_rssi(mut self, rssi: i16) -> Self {
        self.rssi = Some(rssi);
        self
    }

    /// Set the connectability flag.
    pub fn with_connectable(mut self, connectable: Connectable) -> Self {
        self.connectable = connectable;
        self
    }

    /// The name, when present and non-empty.
    pub fn usable_name(&self) -> Option<&str> {
        self.name.as_deref().filter(|name| !name.is_empty())
    }

    /// Build the device record, or `None` when the candidate has no name.
    pub fn to_device(&self) -> Option<AddressableDevice> {
        let name = self.usable_name()?;
        Some(
            AddressableDevice::new(self.address.clone(), name, self.transport)
                .with_signal_strength(self.rssi)
                .with_classification(self.classification),
        )
    }
}
