//! Host command surface: method calls, arguments and replies.

use std::collections::BTreeMap;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::config::{ConnectConfig, ConnectionPriority};
use crate::device::TransportKind;
use crate::error::{CommandError, Error, Result};

/// A dynamically typed argument or reply value.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Value {
    /// No value.
    #[default]
    Null,
    /// Boolean.
    Bool(bool),
    /// Integer.
    Int(i64),
    /// UTF-8 string.
    Str(String),
    /// Raw bytes.
    Bytes(Bytes),
    /// Ordered list.
    List(Vec<Value>),
    /// String-keyed map.
    Map(BTreeMap<String, Value>),
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(Bytes::from(value))
    }
}

impl From<Bytes> for Value {
    fn from(value: Bytes) -> Self {
        Self::Bytes(value)
    }
}

/// A method invocation from the host.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MethodCall {
    /// Method name, e.g. `"connect"`.
    pub method: String,
    /// Named arguments.
    pub arguments: BTreeMap<String, Value>,
}

impl MethodCall {
    /// Create a call with no arguments.
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            arguments: BTreeMap::new(),
        }
    }

    /// Add an argument.
    pub fn arg(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.arguments.insert(name.to_string(), value.into());
        self
    }

    fn get(&self, name: &str) -> Option<&Value> {
        self.arguments.get(name).filter(|v| **v != Value::Null)
    }

    fn invalid(name: &str, value: &Value) -> Error {
        Error::InvalidParameter {
            name: name.to_string(),
            value: format!("{value:?}"),
        }
    }

    /// Optional string argument.
    pub fn str_arg(&self, name: &str) -> Result<Option<&str>> {
        match self.get(name) {
            None => Ok(None),
            Some(Value::Str(s)) => Ok(Some(s.as_str())),
            Some(other) => Err(Self::invalid(name, other)),
        }
    }

    /// Optional boolean argument.
    pub fn bool_arg(&self, name: &str) -> Result<Option<bool>> {
        match self.get(name) {
            None => Ok(None),
            Some(Value::Bool(b)) => Ok(Some(*b)),
            Some(other) => Err(Self::invalid(name, other)),
        }
    }

    /// Optional integer argument.
    pub fn int_arg(&self, name: &str) -> Result<Option<i64>> {
        match self.get(name) {
            None => Ok(None),
            Some(Value::Int(i)) => Ok(Some(*i)),
            Some(other) => Err(Self::invalid(name, other)),
        }
    }

    /// Optional byte payload argument.
    pub fn bytes_arg(&self, name: &str) -> Result<Option<Bytes>> {
        match self.get(name) {
            None => Ok(None),
            Some(Value::Bytes(b)) => Ok(Some(b.clone())),
            Some(other) => Err(Self::invalid(name, other)),
        }
    }

    fn millis_arg(&self, name: &str) -> Result<Option<Duration>> {
        match self.int_arg(name)? {
            None => Ok(None),
            Some(ms) if ms < 0 => Err(Error::InvalidParameter {
                name: name.to_string(),
                value: ms.to_string(),
            }),
            Some(ms) => Ok(Some(Duration::from_millis(ms as u64))),
        }
    }

    fn uuid_arg(&self, name: &str) -> Result<Option<Uuid>> {
        match self.str_arg(name)? {
            None | Some("") => Ok(None),
            Some(s) => Uuid::parse_str(s).map(Some).map_err(|_| Error::InvalidParameter {
                name: name.to_string(),
                value: s.to_string(),
            }),
        }
    }
}

/// A parsed host command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// List devices already known to the system.
    ListBondedDevices,
    /// Begin a discovery session.
    StartDiscovery,
    /// End the discovery session.
    StopDiscovery,
    /// Connect to a device.
    Connect {
        /// Device address (may be empty; rejected by the lifecycle).
        address: String,
        /// Connection parameters.
        config: ConnectConfig,
    },
    /// Disconnect, optionally after a grace period.
    Disconnect {
        /// Delay before teardown; `None` or zero tears down immediately.
        grace_period: Option<Duration>,
    },
    /// Keep an existing connection to `address` alive.
    EnsureConnected {
        /// Device address.
        address: String,
    },
    /// Write raw bytes to the connected device.
    WriteData {
        /// Payload.
        payload: Bytes,
        /// Transport the caller expects to be connected.
        transport: TransportKind,
        /// Explicit BLE characteristic to write to.
        characteristic: Option<Uuid>,
    },
    /// Renegotiate the BLE MTU.
    RequestMtu {
        /// Requested MTU.
        mtu: u16,
    },
    /// Subscribe to a BLE characteristic.
    SetupNotification {
        /// Characteristic to subscribe to.
        characteristic: Uuid,
        /// Use indications instead of notifications.
        indicate: bool,
    },
}

impl Command {
    /// Parse a method call.
    ///
    /// Returns `Ok(None)` for methods this crate does not implement.
    pub fn parse(call: &MethodCall) -> Result<Option<Self>> {
        let transport =
            TransportKind::from_is_ble(call.bool_arg("isBLE")?.unwrap_or(false));

        let command = match call.method.as_str() {
            "getBondedDevices" => Self::ListBondedDevices,
            "startDiscovery" => Self::StartDiscovery,
            "stopDiscovery" => Self::StopDiscovery,
            "connect" => {
                let config = ConnectConfig {
                    transport,
                    timeout: call.millis_arg("timeout")?.unwrap_or(Duration::ZERO),
                    auto_connect: call.bool_arg("androidAutoConnect")?.unwrap_or(false),
                    priority: ConnectionPriority::from_raw(
                        call.int_arg("connectionPriority")?.unwrap_or(0),
                    ),
                };
                Self::Connect {
                    address: call.str_arg("address")?.unwrap_or_default().to_string(),
                    config,
                }
            }
            "disconnect" => Self::Disconnect {
                grace_period: call.millis_arg("delay")?,
            },
            "ensureConnected" => Self::EnsureConnected {
                address: call.str_arg("address")?.unwrap_or_default().to_string(),
            },
            "writeData" => Self::WriteData {
                payload: call.bytes_arg("bytes")?.unwrap_or_default(),
                transport,
                characteristic: call.uuid_arg("characteristicUuid")?,
            },
            "requestMtu" => {
                let mtu = call.int_arg("mtu")?.unwrap_or_default();
                let mtu = u16::try_from(mtu).map_err(|_| Error::InvalidParameter {
                    name: "mtu".to_string(),
                    value: mtu.to_string(),
                })?;
                Self::RequestMtu { mtu }
            }
            "setupNotification" | "setupIndication" => {
                let characteristic =
                    call.uuid_arg("characteristicUuid")?
                        .ok_or_else(|| Error::InvalidParameter {
                            name: "characteristicUuid".to_string(),
                            value: "null".to_string(),
                        })?;
                Self::SetupNotification {
                    characteristic,
                    indicate: call.method == "setupIndication",
                }
            }
            _ => return Ok(None),
        };

        Ok(Some(command))
    }
}

/// The outcome of a command as seen by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// The command succeeded.
    Success(Value),
    /// The command failed.
    Error(CommandError),
    /// The method is unknown.
    NotImplemented,
}

impl Reply {
    /// Check for success.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

impl From<Result<Value>> for Reply {
    fn from(result: Result<Value>) -> Self {
        match result {
            Ok(value) => Self::Success(value),
            Err(e) => Self::Error(CommandError::from(e)),
        }
    }
}

type ReplyFn = Box<dyn FnOnce(Reply) + Send>;

/// Delivers the reply of one command exactly once.
///
/// The first completion wins; later completions are discarded.
pub struct Responder {
    callback: Mutex<Option<ReplyFn>>,
}

impl std::fmt::Debug for Responder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Responder")
            .field("complete", &self.is_complete())
            .finish()
    }
}

impl Responder {
    /// Wrap a reply callback.
    pub fn new(callback: impl FnOnce(Reply) + Send + 'static) -> Self {
        Self {
            callback: Mutex::new(Some(Box::new(callback))),
        }
    }

    /// Complete with `reply`. Returns `false` if already completed.
    pub fn complete(&self, reply: Reply) -> bool {
        let callback = self.callback.lock().take();
        match callback {
            Some(callback) => {
                callback(reply);
                true
            }
            None => {
                debug!("Discarding late reply {:?}", reply);
                false
            }
        }
    }

    /// Complete successfully.
    pub fn success(&self, value: Value) -> bool {
        self.complete(Reply::Success(value))
    }

    /// Complete with an error.
    pub fn error(&self, error: CommandError) -> bool {
        self.complete(Reply::Error(error))
    }

    /// Check whether a reply has been delivered.
    pub fn is_complete(&self) -> bool {
        self.callback.lock().is_none()
    }
}
