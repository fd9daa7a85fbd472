//! Connection and transport configuration.

use std::time::Duration;

use uuid::Uuid;

use crate::device::TransportKind;

/// Serial Port Profile service UUID used for Classic RFCOMM connections.
pub const SPP_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000_1101_0000_1000_8000_00805f9b34fb);

/// Connect deadline used when a command passes no timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default ATT MTU before any negotiation.
pub const DEFAULT_ATT_MTU: u16 = 23;

/// Requested BLE connection interval class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum ConnectionPriority {
    /// Balanced interval; what a fresh link starts with.
    #[default]
    Balanced = 0,
    /// Short interval for throughput.
    High = 1,
    /// Long interval to save power.
    LowPower = 2,
}

impl ConnectionPriority {
    /// Create from a raw integer; unknown values fall back to `Balanced`.
    pub fn from_raw(value: i64) -> Self {
        match value {
            1 => Self::High,
            2 => Self::LowPower,
            _ => Self::Balanced,
        }
    }
}

/// Parameters for one `connect` command.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ConnectConfig {
    /// Which transport to connect over.
    pub transport: TransportKind,
    /// Connect deadline; zero means the lifecycle default.
    pub timeout: Duration,
    /// Let the platform connect whenever the device becomes available (BLE).
    pub auto_connect: bool,
    /// Requested connection priority (BLE).
    pub priority: ConnectionPriority,
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self::ble()
    }
}

impl ConnectConfig {
    /// BLE connection with default options.
    pub fn ble() -> Self {
        Self {
            transport: TransportKind::Ble,
            timeout: Duration::ZERO,
            auto_connect: false,
            priority: ConnectionPriority::Balanced,
        }
    }

    /// Classic connection with default options.
    pub fn classic() -> Self {
        Self {
            transport: TransportKind::Classic,
            ..Self::ble()
        }
    }

    /// Set the connect deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the auto-connect flag.
    pub fn with_auto_connect(mut self, auto_connect: bool) -> Self {
        self.auto_connect = auto_connect;
        self
    }

    /// Set the requested priority.
    pub fn with_priority(mut self, priority: ConnectionPriority) -> Self {
        self.priority = priority;
        self
    }

    /// The deadline to apply, substituting `default` for a zero timeout.
    pub fn effective_timeout(&self, default: Duration) -> Duration {
        if self.timeout.is_zero() {
            default
        } else {
            self.timeout
        }
    }
}

/// Settings for the connection state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LifecycleConfig {
    /// Deadline used when a connect command carries no timeout.
    pub default_connect_timeout: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            default_connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

/// Settings for BLE sessions.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BleConfig {
    /// MTU assumed until a negotiation reports otherwise.
    pub assumed_mtu: u16,
    /// Pause between fragments of a long write.
    pub fragment_delay: Duration,
}

impl Default for BleConfig {
    fn default() -> Self {
        Self {
            assumed_mtu: DEFAULT_ATT_MTU,
            fragment_delay: Duration::ZERO,
        }
    }
}

/// Settings for Classic RFCOMM sessions.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ClassicConfig {
    /// Service the socket connects to.
    pub service_uuid: Uuid,
    /// Largest single socket write.
    pub buffer_size: usize,
    /// Pause between fragments so the receiver is not overrun.
    pub fragment_delay: Duration,
    /// Pause after the final flush before closing the socket.
    pub pre_close_delay: Duration,
    /// Size of the read-loop buffer.
    pub read_buffer_size: usize,
}

impl Default for ClassicConfig {
    fn default() -> Self {
        Self {
            service_uuid: SPP_SERVICE_UUID,
            buffer_size: 1024,
            fragment_delay: Duration::from_millis(10),
            pre_close_delay: Duration::from_millis(100),
            read_buffer_size: 1024,
        }
    }
}
