//! btleplug-backed platform.
//!
//! btleplug exposes neither MTU negotiation nor connection priority, so
//! [`BtleplugPeripheral`] reports the configured MTU and only logs priority
//! requests. "Bonded" devices are the peripherals the adapter already knows.
//! Classic needs an [`RfcommConnector`] supplied with
//! [`NativePlatform::with_rfcomm`].

use std::sync::Arc;

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CentralState, Characteristic, Manager as _, Peripheral as _,
    PeripheralProperties, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::stream::{BoxStream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::config::{BleConfig, ClassicConfig, ConnectionPriority};
use crate::device::{AddressableDevice, ScanCandidate, TransportKind};
use crate::error::{Error, Result};
use crate::platform::{BluetoothPlatform, RadioState};
use crate::transport::{
    BleTransport, CharacteristicInfo, ClassicTransport, GattPeripheral, RfcommConnector,
    SocketStream, TransportFactory, TransportHandle,
};

/// Map the adapter state onto a [`RadioState`].
pub fn radio_state_from(state: CentralState) -> RadioState {
    match state {
        CentralState::PoweredOn => RadioState::Available,
        CentralState::PoweredOff => RadioState::PoweredOff,
        // Some backends never report a state.
        _ => RadioState::Available,
    }
}

/// Build a scan candidate from advertised properties.
pub fn candidate_from_properties(address: String, properties: &PeripheralProperties) -> ScanCandidate {
    let mut candidate = ScanCandidate::ble(address, properties.local_name.as_deref());
    candidate.rssi = properties.rssi;
    candidate
}

/// A btleplug peripheral.
pub struct BtleplugPeripheral {
    adapter: Adapter,
    peripheral: Peripheral,
    assumed_mtu: u16,
}

impl BtleplugPeripheral {
    /// Wrap a peripheral of `adapter`.
    pub fn new(adapter: Adapter, peripheral: Peripheral, assumed_mtu: u16) -> Self {
        Self {
            adapter,
            peripheral,
            assumed_mtu,
        }
    }

    fn characteristic(&self, info: &CharacteristicInfo) -> Result<Characteristic> {
        self.peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == info.uuid && c.service_uuid == info.service_uuid)
            .ok_or_else(|| Error::CharacteristicNotFound {
                uuid: info.uuid.to_string(),
            })
    }
}

#[async_trait]
impl GattPeripheral for BtleplugPeripheral {
    async fn connect(&self, auto_connect: bool) -> Result<()> {
        if auto_connect {
            debug!("auto_connect is not supported by btleplug, connecting directly");
        }
        if self.peripheral.is_connected().await.unwrap_or(false) {
            info!("Peripheral already connected at BLE level");
            return Ok(());
        }
        self.peripheral.connect().await?;
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.peripheral.disconnect().await?;
        Ok(())
    }

    async fn discover_characteristics(&self) -> Result<Vec<CharacteristicInfo>> {
        self.peripheral.discover_services().await?;
        Ok(self
            .peripheral
            .characteristics()
            .into_iter()
            .map(|c| CharacteristicInfo {
                uuid: c.uuid,
                service_uuid: c.service_uuid,
                properties: c.properties,
            })
            .collect())
    }

    async fn write(
        &self,
        characteristic: &CharacteristicInfo,
        data: &[u8],
        write_type: WriteType,
    ) -> Result<()> {
        let characteristic = self.characteristic(characteristic)?;
        self.peripheral
            .write(&characteristic, data, write_type)
            .await?;
        Ok(())
    }

    async fn subscribe(&self, characteristic: &CharacteristicInfo) -> Result<()> {
        let characteristic = self.characteristic(characteristic)?;
        self.peripheral.subscribe(&characteristic).await?;
        debug!("Subscribed to {}", characteristic.uuid);
        Ok(())
    }

    async fn request_mtu(&self, mtu: u16) -> Result<u16> {
        debug!(
            "MTU {} requested; btleplug negotiates internally, using {}",
            mtu, self.assumed_mtu
        );
        Ok(self.assumed_mtu)
    }

    async fn request_connection_priority(&self, priority: ConnectionPriority) -> Result<()> {
        debug!("Connection priority {:?} left to the OS", priority);
        Ok(())
    }

    async fn disconnections(&self) -> Result<BoxStream<'static, ()>> {
        let id = self.peripheral.id();
        let events = self.adapter.events().await?;
        Ok(events
            .filter_map(move |event| {
                let matched = matches!(&event, CentralEvent::DeviceDisconnected(other) if *other == id);
                async move { matched.then_some(()) }
            })
            .boxed())
    }
}

/// Connector wrapper that stops the BLE scan before opening a socket.
pub struct ScanStoppingConnector {
    adapter: Adapter,
    inner: Box<dyn RfcommConnector>,
}

#[async_trait]
impl RfcommConnector for ScanStoppingConnector {
    async fn cancel_discovery(&self) -> Result<()> {
        if let Err(e) = self.adapter.stop_scan().await {
            trace!("stop_scan before RFCOMM connect: {}", e);
        }
        self.inner.cancel_discovery().await
    }

    async fn open(&self, address: &str, service_uuid: Uuid) -> Result<Box<dyn SocketStream>> {
        self.inner.open(address, service_uuid).await
    }
}

/// The host's Bluetooth stack, through btleplug.
pub struct NativePlatform {
    adapter: Adapter,
    ble_config: BleConfig,
    classic_config: ClassicConfig,
    rfcomm: Option<Arc<ScanStoppingConnector>>,
    scan_task: Mutex<Option<JoinHandle<()>>>,
}

impl NativePlatform {
    /// Use the first adapter of the system.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BluetoothUnavailable`] if there is no adapter.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new()
            .await
            .map_err(|_e| Error::BluetoothUnavailable)?;

        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(Error::BluetoothUnavailable)?;

        info!(
            "Using Bluetooth adapter: {:?}",
            adapter.adapter_info().await.ok()
        );

        Ok(Self::with_adapter(adapter))
    }

    /// Use a specific adapter.
    pub fn with_adapter(adapter: Adapter) -> Self {
        Self {
            adapter,
            ble_config: BleConfig::default(),
            classic_config: ClassicConfig::default(),
            rfcomm: None,
            scan_task: Mutex::new(None),
        }
    }

    /// Set the BLE transport configuration.
    pub fn with_ble_config(mut self, config: BleConfig) -> Self {
        self.ble_config = config;
        self
    }

    /// Enable Classic connections through `connector`.
    pub fn with_rfcomm(mut self, connector: impl RfcommConnector, config: ClassicConfig) -> Self {
        self.rfcomm = Some(Arc::new(ScanStoppingConnector {
            adapter: self.adapter.clone(),
            inner: Box::new(connector),
        }));
        self.classic_config = config;
        self
    }

    /// The underlying adapter.
    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    async fn find_peripheral(&self, address: &str) -> Result<Option<Peripheral>> {
        for peripheral in self.adapter.peripherals().await? {
            if peripheral.id().to_string() == address
                || peripheral.address().to_string().eq_ignore_ascii_case(address)
            {
                return Ok(Some(peripheral));
            }
        }
        Ok(None)
    }
}

async fn forward_scan_results(adapter: Adapter, results: mpsc::UnboundedSender<ScanCandidate>) {
    let mut events = match adapter.events().await {
        Ok(events) => events,
        Err(e) => {
            error!("Failed to get adapter events: {}", e);
            return;
        }
    };

    loop {
        let event = tokio::select! {
            _ = results.closed() => break,
            event = events.next() => match event {
                Some(event) => event,
                None => break,
            },
        };

        let id = match event {
            CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
            _ => continue,
        };

        let peripheral = match adapter.peripheral(&id).await {
            Ok(p) => p,
            Err(e) => {
                trace!("Failed to get peripheral: {}", e);
                continue;
            }
        };
        let properties = match peripheral.properties().await {
            Ok(Some(p)) => p,
            _ => continue,
        };

        if results
            .send(candidate_from_properties(id.to_string(), &properties))
            .is_err()
        {
            break;
        }
    }

    debug!("Scan event loop ended");
}

#[async_trait]
impl TransportFactory for NativePlatform {
    async fn open_transport(
        &self,
        address: &str,
        kind: TransportKind,
    ) -> Result<Arc<dyn TransportHandle>> {
        match kind {
            TransportKind::Ble => {
                let peripheral = self.find_peripheral(address).await?.ok_or_else(|| {
                    Error::DeviceNotFound {
                        address: address.to_string(),
                    }
                })?;
                let peripheral = BtleplugPeripheral::new(
                    self.adapter.clone(),
                    peripheral,
                    self.ble_config.assumed_mtu,
                );
                Ok(Arc::new(BleTransport::new(
                    address,
                    Arc::new(peripheral),
                    self.ble_config.clone(),
                )))
            }
            TransportKind::Classic => {
                let connector = self.rfcomm.clone().ok_or_else(|| Error::NotSupported {
                    operation: "Classic connections without an RFCOMM connector".to_string(),
                })?;
                Ok(Arc::new(ClassicTransport::new(
                    address,
                    connector,
                    self.classic_config.clone(),
                )))
            }
        }
    }
}

#[async_trait]
impl BluetoothPlatform for NativePlatform {
    async fn radio_state(&self) -> Result<RadioState> {
        Ok(radio_state_from(self.adapter.adapter_state().await?))
    }

    async fn bonded_devices(&self) -> Result<Vec<AddressableDevice>> {
        let mut devices = Vec::new();
        for peripheral in self.adapter.peripherals().await? {
            let name = match peripheral.properties().await {
                Ok(Some(properties)) => properties.local_name.unwrap_or_default(),
                _ => String::new(),
            };
            devices.push(AddressableDevice::new(
                peripheral.id().to_string(),
                name,
                TransportKind::Ble,
            ));
        }
        Ok(devices)
    }

    async fn start_scan(&self, results: mpsc::UnboundedSender<ScanCandidate>) -> Result<()> {
        self.stop_scan().await?;

        info!("Starting BLE scan");
        self.adapter.start_scan(ScanFilter::default()).await?;

        let handle = tokio::spawn(forward_scan_results(self.adapter.clone(), results));
        *self.scan_task.lock() = Some(handle);
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        let task = self.scan_task.lock().take();
        let Some(task) = task else {
            debug!("Not scanning, ignoring stop request");
            return Ok(());
        };

        info!("Stopping BLE scan");
        task.abort();
        let _ = task.await;
        if let Err(e) = self.adapter.stop_scan().await {
            warn!("Failed to stop scan: {}", e);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_radio_state_mapping() {
        assert_eq!(radio_state_from(CentralState::PoweredOn), RadioState::Available);
        assert_eq!(radio_state_from(CentralState::PoweredOff), RadioState::PoweredOff);
    }

    #[test]
    fn test_candidate_from_properties() {
        let properties = PeripheralProperties {
            local_name: Some("MPT-II".to_string()),
            rssi: Some(-61),
            ..Default::default()
        };

        let candidate = candidate_from_properties("AA:BB".to_string(), &properties);

        assert_eq!(candidate.usable_name(), Some("MPT-II"));
        assert_eq!(candidate.rssi, Some(-61));
        assert_eq!(candidate.transport, TransportKind::Ble);
    }
}
