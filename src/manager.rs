//! Command surface for one printer link.
//!
//! [`PrinterManager`] puts radio checks, discovery and the connection
//! lifecycle behind the host's method calls.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::command::{Command, MethodCall, Reply, Responder, Value};
use crate::config::{ConnectConfig, LifecycleConfig};
use crate::device::{AddressableDevice, TransportKind};
use crate::discovery::Discovery;
use crate::error::{Error, Result};
use crate::event::{EventHub, EventSink};
use crate::lifecycle::{ConnectionLifecycle, ConnectionState};
use crate::platform::BluetoothPlatform;
use crate::registry::DeviceRegistry;

/// Central manager for discovering and talking to one printer.
pub struct PrinterManager<P> {
    platform: Arc<P>,
    events: EventHub,
    discovery: Discovery,
    lifecycle: ConnectionLifecycle,
}

impl<P: BluetoothPlatform> PrinterManager<P> {
    /// Create a manager with default settings.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn new(platform: Arc<P>) -> Self {
        Self::with_config(platform, LifecycleConfig::default(), DeviceRegistry::new())
    }

    /// Create a manager with explicit lifecycle and registry settings.
    pub fn with_config(platform: Arc<P>, config: LifecycleConfig, registry: DeviceRegistry) -> Self {
        let events = EventHub::new();
        let lifecycle = ConnectionLifecycle::new(platform.clone(), events.clone(), config);
        let discovery = Discovery::with_registry(registry, events.clone());
        Self {
            platform,
            events,
            discovery,
            lifecycle,
        }
    }

    /// Attach the host's event sink, replacing any previous one.
    pub fn attach_event_sink(&self, sink: Arc<dyn EventSink>) {
        self.events.attach(sink);
    }

    /// Detach the host's event sink.
    pub fn detach_event_sink(&self) {
        self.events.detach();
    }

    /// The platform in use.
    pub fn platform(&self) -> &Arc<P> {
        &self.platform
    }

    /// The connection lifecycle.
    pub fn lifecycle(&self) -> &ConnectionLifecycle {
        &self.lifecycle
    }

    /// The current connection state.
    pub fn connection_state(&self) -> ConnectionState {
        self.lifecycle.state()
    }

    async fn ensure_radio(&self) -> Result<()> {
        self.platform.radio_state().await?.ensure_available()
    }

    /// Devices the system already knows.
    pub async fn list_bonded_devices(&self) -> Result<Vec<AddressableDevice>> {
        self.ensure_radio().await?;
        self.platform.bonded_devices().await
    }

    /// Start a discovery session. Results arrive as scan result events.
    pub async fn start_discovery(&self) -> Result<()> {
        self.ensure_radio().await?;

        if self.discovery.is_running() {
            self.platform.stop_scan().await?;
        }
        let results = self.discovery.begin();
        if let Err(e) = self.platform.start_scan(results).await {
            self.discovery.end();
            return Err(e);
        }
        info!("Discovery started");
        Ok(())
    }

    /// Stop the discovery session. A no-op when none runs.
    pub async fn stop_discovery(&self) -> Result<()> {
        if !self.discovery.end() {
            debug!("Not discovering, ignoring stop request");
            return Ok(());
        }
        self.platform.stop_scan().await?;
        info!("Discovery stopped");
        Ok(())
    }

    /// Devices found by the current or last discovery session.
    pub fn discovered_devices(&self) -> Vec<AddressableDevice> {
        self.discovery.devices()
    }

    /// Connect to `address`.
    pub async fn connect(&self, address: &str, config: &ConnectConfig) -> Result<()> {
        self.ensure_radio().await?;
        self.lifecycle.connect(address, config).await
    }

    /// Disconnect, optionally after a grace period.
    pub fn disconnect(&self, grace_period: Option<Duration>) {
        self.lifecycle.disconnect(grace_period);
    }

    /// Keep an existing connection to `address` alive.
    pub fn ensure_connected(&self, address: &str) -> bool {
        self.lifecycle.ensure_connected(address)
    }

    /// Write raw bytes over the connected transport.
    ///
    /// Fails with [`Error::NotConnected`] when the connected transport is not
    /// `transport`.
    pub async fn write_data(
        &self,
        payload: Bytes,
        transport: TransportKind,
        characteristic: Option<Uuid>,
    ) -> Result<()> {
        match self.lifecycle.connected_transport() {
            Some(kind) if kind == transport => {}
            Some(kind) => {
                warn!("Write for {} while connected over {}", transport, kind);
                return Err(Error::NotConnected);
            }
            None => return Err(Error::NotConnected),
        }
        self.lifecycle.write(payload, characteristic).await
    }

    /// Renegotiate the BLE MTU. Returns the MTU in effect.
    pub async fn request_mtu(&self, mtu: u16) -> Result<u16> {
        self.lifecycle.request_capacity(mtu).await
    }

    /// Subscribe to notifications or indications of a characteristic.
    pub async fn setup_notification(&self, characteristic: Uuid, indicate: bool) -> Result<()> {
        self.lifecycle.setup_notification(characteristic, indicate).await
    }

    /// Run a parsed command.
    pub async fn execute(&self, command: Command) -> Result<Value> {
        match command {
            Command::ListBondedDevices => {
                let devices = self.list_bonded_devices().await?;
                Ok(Value::List(
                    devices
                        .iter()
                        .map(|device| Value::Map(device.to_attribute_map()))
                        .collect(),
                ))
            }
            Command::StartDiscovery => self.start_discovery().await.map(|()| Value::Bool(true)),
            Command::StopDiscovery => self.stop_discovery().await.map(|()| Value::Bool(true)),
            Command::Connect { address, config } => self
                .connect(&address, &config)
                .await
                .map(|()| Value::Bool(true)),
            Command::Disconnect { grace_period } => {
                self.disconnect(grace_period);
                Ok(Value::Bool(true))
            }
            Command::EnsureConnected { address } => {
                Ok(Value::Bool(self.ensure_connected(&address)))
            }
            Command::WriteData {
                payload,
                transport,
                characteristic,
            } => self
                .write_data(payload, transport, characteristic)
                .await
                .map(|()| Value::Bool(true)),
            Command::RequestMtu { mtu } => self
                .request_mtu(mtu)
                .await
                .map(|mtu| Value::Int(i64::from(mtu))),
            Command::SetupNotification {
                characteristic,
                indicate,
            } => self
                .setup_notification(characteristic, indicate)
                .await
                .map(|()| Value::Bool(true)),
        }
    }

    /// Parse and run a method call.
    pub async fn dispatch(&self, call: &MethodCall) -> Reply {
        let command = match Command::parse(call) {
            Ok(Some(command)) => command,
            Ok(None) => {
                debug!("Method {} is not implemented", call.method);
                return Reply::NotImplemented;
            }
            Err(e) => return Reply::from(Err(e)),
        };

        let reply = Reply::from(self.execute(command).await);
        if let Reply::Error(error) = &reply {
            debug!("{} failed: {}", call.method, error);
        }
        reply
    }

    /// Run a method call and deliver its reply through `responder`.
    ///
    /// Returns `false` if the responder had already been completed.
    pub async fn dispatch_with(&self, call: &MethodCall, responder: &Responder) -> bool {
        let reply = self.dispatch(call).await;
        responder.complete(reply)
    }

    /// Stop discovery, tear down the connection and wait for release.
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down printer manager");
        self.stop_discovery().await?;
        self.lifecycle.shutdown().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{CommandError, ErrorCode};
    use crate::platform::fake::FakePlatform;
    use crate::platform::RadioState;

    #[tokio::test]
    async fn test_radio_precheck_codes() {
        let platform = Arc::new(FakePlatform::new());
        let manager = PrinterManager::new(platform.clone());

        platform.set_radio_state(RadioState::PoweredOff);
        let reply = manager.dispatch(&MethodCall::new("startDiscovery")).await;
        assert_eq!(
            reply,
            Reply::Error(CommandError::bare(ErrorCode::BluetoothNotAvailable))
        );

        platform.set_radio_state(RadioState::Unauthorized);
        let reply = manager.dispatch(&MethodCall::new("getBondedDevices")).await;
        assert_eq!(
            reply,
            Reply::Error(CommandError::bare(ErrorCode::PermissionNotGranted))
        );
        assert_eq!(platform.scan_starts(), 0);
    }

    #[tokio::test]
    async fn test_unknown_method_not_implemented() {
        let manager = PrinterManager::new(Arc::new(FakePlatform::new()));
        let reply = manager.dispatch(&MethodCall::new("printReceipt")).await;
        assert_eq!(reply, Reply::NotImplemented);
    }

    #[tokio::test]
    async fn test_stop_discovery_without_session() {
        let platform = Arc::new(FakePlatform::new());
        let manager = PrinterManager::new(platform.clone());

        manager.stop_discovery().await.unwrap();
        let reply = manager.dispatch(&MethodCall::new("stopDiscovery")).await;
        assert!(reply.is_success());
        assert!(!platform.is_scanning());
    }

    #[tokio::test]
    async fn test_bonded_devices_as_attribute_maps() {
        let platform = Arc::new(FakePlatform::new());
        platform.set_bonded_devices(vec![AddressableDevice::new(
            "00:11:22:33:44:55",
            "PT-210",
            TransportKind::Classic,
        )]);
        let manager = PrinterManager::new(platform);

        let reply = manager.dispatch(&MethodCall::new("getBondedDevices")).await;

        let Reply::Success(Value::List(devices)) = reply else {
            panic!("unexpected reply {:?}", reply);
        };
        assert_eq!(devices.len(), 1);
        let Value::Map(map) = &devices[0] else {
            panic!("device is not a map");
        };
        assert_eq!(map.get("address"), Some(&Value::from("00:11:22:33:44:55")));
    }
}
