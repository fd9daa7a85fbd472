//! In-memory Bluetooth stack.
//!
//! Records every operation so callers can assert on it, and lets them inject
//! failures, delays, link drops and scan results. Classic sockets are
//! `tokio::io::duplex` pipes; the remote end is handed to the caller.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{CharPropFlags, WriteType};
use futures::stream::{BoxStream, StreamExt};
use parking_lot::Mutex;
use tokio::io::DuplexStream;
use tokio::sync::{broadcast, mpsc};
use tracing::trace;
use uuid::Uuid;

use crate::config::{BleConfig, ClassicConfig, ConnectionPriority};
use crate::device::{AddressableDevice, ScanCandidate, TransportKind};
use crate::error::{Error, Result};
use crate::platform::{BluetoothPlatform, RadioState};
use crate::transport::{
    BleTransport, CharacteristicInfo, ClassicTransport, GattPeripheral, RfcommConnector,
    SocketStream, TransportFactory, TransportHandle,
};

const DUPLEX_CAPACITY: usize = 64 * 1024;

/// One recorded GATT write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeWrite {
    /// Target characteristic.
    pub characteristic: Uuid,
    /// Bytes written.
    pub data: Vec<u8>,
    /// Write type used.
    pub write_type: WriteType,
}

#[derive(Default)]
struct PeripheralLog {
    connected: bool,
    connects: usize,
    disconnects: usize,
    discoveries: usize,
    writes: Vec<FakeWrite>,
    fail_write_at: Option<usize>,
    mtu_requests: Vec<u16>,
    priorities: Vec<ConnectionPriority>,
    subscriptions: Vec<Uuid>,
}

/// A scripted BLE peripheral.
pub struct FakePeripheral {
    address: String,
    characteristics: Vec<CharacteristicInfo>,
    connect_delay: Duration,
    connect_error: Option<String>,
    mtu_limit: u16,
    log: Mutex<PeripheralLog>,
    link: broadcast::Sender<()>,
}

impl FakePeripheral {
    /// A peripheral with no characteristics.
    pub fn new(address: impl Into<String>) -> Self {
        let (link, _) = broadcast::channel(8);
        Self {
            address: address.into(),
            characteristics: Vec::new(),
            connect_delay: Duration::ZERO,
            connect_error: None,
            mtu_limit: 517,
            log: Mutex::new(PeripheralLog::default()),
            link,
        }
    }

    /// Add a characteristic in the printer's service.
    pub fn with_characteristic(mut self, uuid: Uuid, properties: CharPropFlags) -> Self {
        self.characteristics.push(CharacteristicInfo {
            uuid,
            service_uuid: Uuid::from_u128(0x0000_18f0_0000_1000_8000_00805f9b34fb),
            properties,
        });
        self
    }

    /// Delay every connect.
    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    /// Reject every connect.
    pub fn with_connect_error(mut self, reason: impl Into<String>) -> Self {
        self.connect_error = Some(reason.into());
        self
    }

    /// Largest MTU the peripheral accepts.
    pub fn with_mtu_limit(mut self, mtu: u16) -> Self {
        self.mtu_limit = mtu;
        self
    }

    /// The peripheral's address.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Fail the write with this zero-based index.
    pub fn fail_write_at(&self, index: usize) {
        self.log.lock().fail_write_at = Some(index);
    }

    /// Simulate the peripheral going out of range.
    pub fn drop_link(&self) {
        self.log.lock().connected = false;
        let _ = self.link.send(());
    }

    /// Check the GATT connection.
    pub fn is_connected(&self) -> bool {
        self.log.lock().connected
    }

    /// Number of connects.
    pub fn connect_count(&self) -> usize {
        self.log.lock().connects
    }

    /// Number of disconnects.
    pub fn disconnect_count(&self) -> usize {
        self.log.lock().disconnects
    }

    /// Number of service discoveries.
    pub fn discovery_count(&self) -> usize {
        self.log.lock().discoveries
    }

    /// Writes received so far.
    pub fn writes(&self) -> Vec<FakeWrite> {
        self.log.lock().writes.clone()
    }

    /// Requested MTUs.
    pub fn mtu_requests(&self) -> Vec<u16> {
        self.log.lock().mtu_requests.clone()
    }

    /// Requested connection priorities.
    pub fn priority_requests(&self) -> Vec<ConnectionPriority> {
        self.log.lock().priorities.clone()
    }

    /// Subscribed characteristics.
    pub fn subscriptions(&self) -> Vec<Uuid> {
        self.log.lock().subscriptions.clone()
    }

    fn require_connected(&self) -> Result<()> {
        if self.log.lock().connected {
            Ok(())
        } else {
            Err(Error::NotConnected)
        }
    }
}

#[async_trait]
impl GattPeripheral for FakePeripheral {
    async fn connect(&self, _auto_connect: bool) -> Result<()> {
        if !self.connect_delay.is_zero() {
            tokio::time::sleep(self.connect_delay).await;
        }
        if let Some(reason) = &self.connect_error {
            return Err(Error::ConnectionFailed {
                reason: reason.clone(),
            });
        }
        let mut log = self.log.lock();
        log.connected = true;
        log.connects += 1;
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let mut log = self.log.lock();
        log.connected = false;
        log.disconnects += 1;
        Ok(())
    }

    async fn discover_characteristics(&self) -> Result<Vec<CharacteristicInfo>> {
        self.require_connected()?;
        self.log.lock().discoveries += 1;
        Ok(self.characteristics.clone())
    }

    async fn write(
        &self,
        characteristic: &CharacteristicInfo,
        data: &[u8],
        write_type: WriteType,
    ) -> Result<()> {
        self.require_connected()?;
        let mut log = self.log.lock();
        if log.fail_write_at == Some(log.writes.len()) {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "write rejected",
            )));
        }
        trace!("Fake write of {} bytes to {}", data.len(), characteristic.uuid);
        log.writes.push(FakeWrite {
            characteristic: characteristic.uuid,
            data: data.to_vec(),
            write_type,
        });
        Ok(())
    }

    async fn subscribe(&self, characteristic: &CharacteristicInfo) -> Result<()> {
        self.require_connected()?;
        self.log.lock().subscriptions.push(characteristic.uuid);
        Ok(())
    }

    async fn request_mtu(&self, mtu: u16) -> Result<u16> {
        self.require_connected()?;
        self.log.lock().mtu_requests.push(mtu);
        Ok(mtu.min(self.mtu_limit))
    }

    async fn request_connection_priority(&self, priority: ConnectionPriority) -> Result<()> {
        self.require_connected()?;
        self.log.lock().priorities.push(priority);
        Ok(())
    }

    async fn disconnections(&self) -> Result<BoxStream<'static, ()>> {
        let rx = self.link.subscribe();
        Ok(futures::stream::unfold(rx, |mut rx| async move {
            match rx.recv().await {
                Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => Some(((), rx)),
                Err(broadcast::error::RecvError::Closed) => None,
            }
        })
        .boxed())
    }
}

#[derive(Default)]
struct ConnectorLog {
    discovery_cancels: usize,
    opened: Vec<(String, Uuid)>,
    remotes: Vec<DuplexStream>,
    fail_next: Option<String>,
}

/// An RFCOMM connector backed by in-memory pipes.
#[derive(Default)]
pub struct FakeConnector {
    log: Mutex<ConnectorLog>,
}

impl FakeConnector {
    /// Create a connector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject the next open.
    pub fn fail_next_open(&self, reason: impl Into<String>) {
        self.log.lock().fail_next = Some(reason.into());
    }

    /// Take the remote end of the oldest socket not yet taken.
    pub fn take_remote(&self) -> Option<DuplexStream> {
        let mut log = self.log.lock();
        if log.remotes.is_empty() {
            None
        } else {
            Some(log.remotes.remove(0))
        }
    }

    /// Sockets opened so far, as (address, service UUID).
    pub fn opened(&self) -> Vec<(String, Uuid)> {
        self.log.lock().opened.clone()
    }

    /// Number of discovery cancellations.
    pub fn discovery_cancels(&self) -> usize {
        self.log.lock().discovery_cancels
    }
}

#[async_trait]
impl RfcommConnector for FakeConnector {
    async fn cancel_discovery(&self) -> Result<()> {
        self.log.lock().discovery_cancels += 1;
        Ok(())
    }

    async fn open(&self, address: &str, service_uuid: Uuid) -> Result<Box<dyn SocketStream>> {
        let mut log = self.log.lock();
        if let Some(reason) = log.fail_next.take() {
            return Err(Error::ConnectionFailed { reason });
        }
        let (local, remote) = tokio::io::duplex(DUPLEX_CAPACITY);
        log.opened.push((address.to_string(), service_uuid));
        log.remotes.push(remote);
        Ok(Box::new(local))
    }
}

/// An in-memory [`BluetoothPlatform`].
pub struct FakePlatform {
    radio: Mutex<RadioState>,
    bonded: Mutex<Vec<AddressableDevice>>,
    peripherals: Mutex<HashMap<String, Arc<FakePeripheral>>>,
    classic_devices: Mutex<HashSet<String>>,
    connector: Arc<FakeConnector>,
    scan: Mutex<Option<mpsc::UnboundedSender<ScanCandidate>>>,
    scan_starts: AtomicUsize,
    transports_opened: AtomicUsize,
    ble_config: BleConfig,
    classic_config: ClassicConfig,
}

impl Default for FakePlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl FakePlatform {
    /// A platform with an available radio and no devices.
    pub fn new() -> Self {
        Self {
            radio: Mutex::new(RadioState::Available),
            bonded: Mutex::new(Vec::new()),
            peripherals: Mutex::new(HashMap::new()),
            classic_devices: Mutex::new(HashSet::new()),
            connector: Arc::new(FakeConnector::new()),
            scan: Mutex::new(None),
            scan_starts: AtomicUsize::new(0),
            transports_opened: AtomicUsize::new(0),
            ble_config: BleConfig::default(),
            classic_config: ClassicConfig::default(),
        }
    }

    /// Change the radio state.
    pub fn set_radio_state(&self, state: RadioState) {
        *self.radio.lock() = state;
    }

    /// Replace the bonded device list.
    pub fn set_bonded_devices(&self, devices: Vec<AddressableDevice>) {
        *self.bonded.lock() = devices;
    }

    /// Make a BLE peripheral reachable.
    pub fn add_ble_peripheral(&self, peripheral: Arc<FakePeripheral>) {
        self.peripherals
            .lock()
            .insert(peripheral.address().to_string(), peripheral);
    }

    /// Make a Classic device reachable.
    pub fn add_classic_device(&self, address: impl Into<String>) {
        self.classic_devices.lock().insert(address.into());
    }

    /// The connector used for Classic transports.
    pub fn connector(&self) -> Arc<FakeConnector> {
        self.connector.clone()
    }

    /// Deliver a raw scan result. Returns `false` when no scan runs.
    pub fn advertise(&self, candidate: ScanCandidate) -> bool {
        match self.scan.lock().as_ref() {
            Some(results) => results.send(candidate).is_ok(),
            None => false,
        }
    }

    /// Check whether a scan runs.
    pub fn is_scanning(&self) -> bool {
        self.scan.lock().is_some()
    }

    /// Number of scans started.
    pub fn scan_starts(&self) -> usize {
        self.scan_starts.load(Ordering::SeqCst)
    }

    /// Number of transport handles built.
    pub fn transports_opened(&self) -> usize {
        self.transports_opened.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransportFactory for FakePlatform {
    async fn open_transport(
        &self,
        address: &str,
        kind: TransportKind,
    ) -> Result<Arc<dyn TransportHandle>> {
        let transport: Arc<dyn TransportHandle> = match kind {
            TransportKind::Ble => {
                let peripheral = self.peripherals.lock().get(address).cloned();
                let peripheral = peripheral.ok_or_else(|| Error::DeviceNotFound {
                    address: address.to_string(),
                })?;
                Arc::new(BleTransport::new(address, peripheral, self.ble_config.clone()))
            }
            TransportKind::Classic => {
                if !self.classic_devices.lock().contains(address) {
                    return Err(Error::DeviceNotFound {
                        address: address.to_string(),
                    });
                }
                Arc::new(ClassicTransport::new(
                    address,
                    self.connector.clone(),
                    self.classic_config.clone(),
                ))
            }
        };
        self.transports_opened.fetch_add(1, Ordering::SeqCst);
        Ok(transport)
    }
}

#[async_trait]
impl BluetoothPlatform for FakePlatform {
    async fn radio_state(&self) -> Result<RadioState> {
        Ok(*self.radio.lock())
    }

    async fn bonded_devices(&self) -> Result<Vec<AddressableDevice>> {
        Ok(self.bonded.lock().clone())
    }

    async fn start_scan(&self, results: mpsc::UnboundedSender<ScanCandidate>) -> Result<()> {
        self.scan_starts.fetch_add(1, Ordering::SeqCst);
        *self.scan.lock() = Some(results);
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.scan.lock().take();
        Ok(())
    }
}
