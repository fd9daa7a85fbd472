//! BLE (GATT) transport.
//!
//! Wraps a [`GattPeripheral`] backend with session handling, write
//! endpoint resolution and long writes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use btleplug::api::{CharPropFlags, WriteType};
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::chunking::{write_fragments, ChunkingPolicy, FragmentSink};
use crate::config::{BleConfig, ConnectConfig, ConnectionPriority};
use crate::device::TransportKind;
use crate::error::{Error, Result};
use crate::transport::endpoint::WriteEndpointResolver;
use crate::transport::{SessionContext, TransportHandle};

/// A discovered GATT characteristic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicInfo {
    /// Characteristic UUID.
    pub uuid: Uuid,
    /// UUID of the service containing the characteristic.
    pub service_uuid: Uuid,
    /// GATT property flags.
    pub properties: CharPropFlags,
}

impl CharacteristicInfo {
    /// The write type to use for this characteristic.
    ///
    /// Acknowledged writes are preferred when supported.
    pub fn write_type(&self) -> WriteType {
        if self.properties.contains(CharPropFlags::WRITE) {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        }
    }

    /// Check whether notifications or indications can be enabled.
    pub fn can_notify(&self) -> bool {
        self.properties
            .intersects(CharPropFlags::NOTIFY | CharPropFlags::INDICATE)
    }
}

/// Backend operations on one BLE peripheral.
#[async_trait]
pub trait GattPeripheral: Send + Sync + 'static {
    /// Establish the GATT connection.
    async fn connect(&self, auto_connect: bool) -> Result<()>;

    /// Drop the GATT connection.
    async fn disconnect(&self) -> Result<()>;

    /// Discover services and return every characteristic.
    async fn discover_characteristics(&self) -> Result<Vec<CharacteristicInfo>>;

    /// Write one ATT payload.
    async fn write(
        &self,
        characteristic: &CharacteristicInfo,
        data: &[u8],
        write_type: WriteType,
    ) -> Result<()>;

    /// Enable notifications or indications.
    async fn subscribe(&self, characteristic: &CharacteristicInfo) -> Result<()>;

    /// Request an MTU; returns the value in effect afterwards.
    async fn request_mtu(&self, mtu: u16) -> Result<u16>;

    /// Request a connection priority.
    async fn request_connection_priority(&self, priority: ConnectionPriority) -> Result<()>;

    /// Stream yielding once each time the peripheral disconnects.
    async fn disconnections(&self) -> Result<BoxStream<'static, ()>>;
}

struct GattWriter<'a, P: ?Sized> {
    peripheral: &'a P,
    characteristic: &'a CharacteristicInfo,
    write_type: WriteType,
}

#[async_trait]
impl<'a, P: GattPeripheral + ?Sized> FragmentSink for GattWriter<'a, P> {
    async fn write_fragment(&mut self, fragment: &[u8]) -> Result<()> {
        self.peripheral
            .write(self.characteristic, fragment, self.write_type)
            .await
    }
}

/// BLE transport session over a [`GattPeripheral`].
pub struct BleTransport<P> {
    address: String,
    peripheral: Arc<P>,
    config: BleConfig,
    /// MTU currently in effect.
    mtu: Mutex<u16>,
    /// Characteristics discovered on this session.
    characteristics: Mutex<Option<Vec<CharacteristicInfo>>>,
    /// Session token, set once connected.
    cancel: Mutex<Option<CancellationToken>>,
    /// Disconnect monitor task.
    monitor: Mutex<Option<tokio::task::JoinHandle<()>>>,
    /// Serialises writes so fragments of different payloads never interleave.
    write_lock: tokio::sync::Mutex<()>,
    closed: AtomicBool,
}

impl<P: GattPeripheral> BleTransport<P> {
    /// Create an unconnected transport.
    pub fn new(address: impl Into<String>, peripheral: Arc<P>, config: BleConfig) -> Self {
        let mtu = config.assumed_mtu;
        Self {
            address: address.into(),
            peripheral,
            config,
            mtu: Mutex::new(mtu),
            characteristics: Mutex::new(None),
            cancel: Mutex::new(None),
            monitor: Mutex::new(None),
            write_lock: tokio::sync::Mutex::new(()),
            closed: AtomicBool::new(false),
        }
    }

    /// The MTU currently in effect.
    pub fn mtu(&self) -> u16 {
        *self.mtu.lock()
    }

    fn session_token(&self) -> Result<CancellationToken> {
        if self.is_closed() {
            return Err(Error::NotConnected);
        }
        self.cancel.lock().clone().ok_or(Error::NotConnected)
    }

    async fn characteristics(&self) -> Result<Vec<CharacteristicInfo>> {
        let cached = self.characteristics.lock().clone();
        if let Some(cached) = cached {
            return Ok(cached);
        }

        let discovered = self.peripheral.discover_characteristics().await?;
        debug!(
            "Discovered {} characteristics on {}",
            discovered.len(),
            self.address
        );
        *self.characteristics.lock() = Some(discovered.clone());
        Ok(discovered)
    }
}

#[async_trait]
impl<P: GattPeripheral> TransportHandle for BleTransport<P> {
    fn kind(&self) -> TransportKind {
        TransportKind::Ble
    }

    fn address(&self) -> &str {
        &self.address
    }

    async fn connect(&self, config: &ConnectConfig, context: SessionContext) -> Result<()> {
        if self.is_closed() {
            return Err(Error::NotConnected);
        }

        debug!(
            "Connecting BLE session {} to {} (auto_connect={})",
            context.session(),
            self.address,
            config.auto_connect
        );

        self.peripheral.connect(config.auto_connect).await?;
        let mut disconnections = self.peripheral.disconnections().await?;

        let cancel = context.cancellation().clone();
        *self.cancel.lock() = Some(cancel.clone());

        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    trace!("BLE disconnect monitor cancelled");
                }
                event = disconnections.next() => {
                    let reason = match event {
                        Some(()) => "peripheral disconnected",
                        None => "connection event stream ended",
                    };
                    context.link_dropped(reason);
                }
            }
        });
        *self.monitor.lock() = Some(handle);

        info!("BLE link to {} established", self.address);
        Ok(())
    }

    async fn write(&self, payload: Bytes, characteristic: Option<Uuid>) -> Result<()> {
        let token = self.session_token()?;
        let _guard = self.write_lock.lock().await;

        let characteristics = self.characteristics().await?;
        let endpoint = WriteEndpointResolver::resolve(&characteristics, characteristic)?;
        let write_type = endpoint.write_type();
        let policy = ChunkingPolicy::for_ble_mtu(self.mtu(), &self.config)?;

        if policy.needs_chunking(payload.len()) {
            debug!(
                "Long write of {} bytes to {} in {} fragments",
                payload.len(),
                endpoint.uuid,
                policy.fragment_count(payload.len())
            );
            let mut writer = GattWriter {
                peripheral: self.peripheral.as_ref(),
                characteristic: &endpoint,
                write_type,
            };
            write_fragments(&policy, &payload, &token, &mut writer).await?;
        } else {
            if token.is_cancelled() {
                return Err(Error::NotConnected);
            }
            trace!("Writing {} bytes to {}", payload.len(), endpoint.uuid);
            self.peripheral
                .write(&endpoint, &payload, write_type)
                .await?;
        }

        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if let Some(token) = self.cancel.lock().take() {
            token.cancel();
        }
        let monitor = self.monitor.lock().take();
        if let Some(handle) = monitor {
            let _ = handle.await;
        }
        *self.characteristics.lock() = None;

        match self.peripheral.disconnect().await {
            Ok(()) => {
                info!("BLE link to {} closed", self.address);
                Ok(())
            }
            Err(e) => {
                warn!("Failed to disconnect {}: {}", self.address, e);
                Err(e)
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn request_priority(&self, priority: ConnectionPriority) -> Result<()> {
        self.session_token()?;
        debug!("Requesting {:?} priority on {}", priority, self.address);
        self.peripheral.request_connection_priority(priority).await
    }

    async fn request_capacity(&self, mtu: u16) -> Result<u16> {
        self.session_token()?;
        let negotiated = self.peripheral.request_mtu(mtu).await?;
        debug!(
            "MTU on {}: requested {}, negotiated {}",
            self.address, mtu, negotiated
        );
        *self.mtu.lock() = negotiated;
        Ok(negotiated)
    }

    async fn setup_notification(&self, characteristic: Uuid, indicate: bool) -> Result<()> {
        self.session_token()?;
        let characteristics = self.characteristics().await?;
        let target = WriteEndpointResolver::resolve(&characteristics, Some(characteristic))?;

        let required = if indicate {
            CharPropFlags::INDICATE
        } else {
            CharPropFlags::NOTIFY
        };
        if !target.properties.contains(required) {
            return Err(Error::NotSupported {
                operation: format!("{:?} on characteristic {}", required, characteristic),
            });
        }

        self.peripheral.subscribe(&target).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::fake::FakePeripheral;
    use pretty_assertions::assert_eq;
    use tokio::sync::mpsc;

    const WRITE_A: u128 = 0x49535343_8841_43f4_a8d4_ecbe34729bb3;
    const WRITE_B: u128 = 0x0000ff02_0000_1000_8000_00805f9b34fb;
    const NOTIFY: u128 = 0x49535343_1e4d_4bd9_ba61_23c647249616;

    fn printer() -> Arc<FakePeripheral> {
        Arc::new(
            FakePeripheral::new("AA:BB:CC:DD:EE:FF")
                .with_characteristic(Uuid::from_u128(WRITE_A), CharPropFlags::WRITE)
                .with_characteristic(
                    Uuid::from_u128(WRITE_B),
                    CharPropFlags::WRITE_WITHOUT_RESPONSE,
                )
                .with_characteristic(
                    Uuid::from_u128(NOTIFY),
                    CharPropFlags::NOTIFY | CharPropFlags::READ,
                ),
        )
    }

    async fn connected(
        peripheral: Arc<FakePeripheral>,
    ) -> (
        BleTransport<FakePeripheral>,
        CancellationToken,
        mpsc::UnboundedReceiver<crate::transport::LinkDrop>,
    ) {
        let transport = BleTransport::new("AA:BB:CC:DD:EE:FF", peripheral, BleConfig::default());
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        transport
            .connect(&ConnectConfig::ble(), SessionContext::new(1, cancel.clone(), tx))
            .await
            .unwrap();
        (transport, cancel, rx)
    }

    #[tokio::test]
    async fn test_short_write_uses_smallest_writable() {
        let peripheral = printer();
        let (transport, _cancel, _rx) = connected(peripheral.clone()).await;

        transport
            .write(Bytes::from_static(b"hello"), None)
            .await
            .unwrap();

        let writes = peripheral.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].characteristic, Uuid::from_u128(WRITE_B));
        assert_eq!(writes[0].data, b"hello".to_vec());
        assert_eq!(writes[0].write_type, WriteType::WithoutResponse);
    }

    #[tokio::test]
    async fn test_long_write_fragments_by_mtu() {
        let peripheral = printer();
        let (transport, _cancel, _rx) = connected(peripheral.clone()).await;
        let payload: Vec<u8> = (0..45u8).collect();

        transport
            .write(Bytes::from(payload.clone()), Some(Uuid::from_u128(WRITE_A)))
            .await
            .unwrap();

        let writes = peripheral.writes();
        let sizes: Vec<_> = writes.iter().map(|w| w.data.len()).collect();
        assert_eq!(sizes, vec![20, 20, 5]);
        assert!(writes
            .iter()
            .all(|w| w.write_type == WriteType::WithResponse));
        let joined: Vec<u8> = writes.into_iter().flat_map(|w| w.data).collect();
        assert_eq!(joined, payload);
    }

    #[tokio::test]
    async fn test_capacity_changes_fragment_size() {
        let peripheral = Arc::new(
            FakePeripheral::new("AA")
                .with_characteristic(Uuid::from_u128(WRITE_A), CharPropFlags::WRITE)
                .with_mtu_limit(185),
        );
        let (transport, _cancel, _rx) = connected(peripheral.clone()).await;

        assert_eq!(transport.request_capacity(512).await.unwrap(), 185);
        assert_eq!(transport.mtu(), 185);

        transport
            .write(Bytes::from(vec![0u8; 182]), None)
            .await
            .unwrap();
        assert_eq!(peripheral.writes().len(), 1);
        assert_eq!(peripheral.mtu_requests(), vec![512]);
    }

    #[tokio::test]
    async fn test_no_writable_endpoint() {
        let peripheral = Arc::new(
            FakePeripheral::new("AA").with_characteristic(Uuid::from_u128(NOTIFY), CharPropFlags::NOTIFY),
        );
        let (transport, _cancel, _rx) = connected(peripheral.clone()).await;

        let result = transport.write(Bytes::from_static(b"x"), None).await;
        assert!(matches!(result, Err(Error::NoWritableEndpoint)));
        assert!(peripheral.writes().is_empty());
    }

    #[tokio::test]
    async fn test_discovery_is_cached_per_session() {
        let peripheral = printer();
        let (transport, _cancel, _rx) = connected(peripheral.clone()).await;

        transport.write(Bytes::from_static(b"a"), None).await.unwrap();
        transport.write(Bytes::from_static(b"b"), None).await.unwrap();

        assert_eq!(peripheral.discovery_count(), 1);
    }

    #[tokio::test]
    async fn test_remote_disconnect_reports_link_drop() {
        let peripheral = printer();
        let (_transport, _cancel, mut rx) = connected(peripheral.clone()).await;

        peripheral.drop_link();

        let drop = rx.recv().await.unwrap();
        assert_eq!(drop.session, 1);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_blocks_writes() {
        let peripheral = printer();
        let (transport, _cancel, mut rx) = connected(peripheral.clone()).await;

        transport.close().await.unwrap();
        transport.close().await.unwrap();

        assert!(transport.is_closed());
        assert_eq!(peripheral.disconnect_count(), 1);
        assert!(matches!(
            transport.write(Bytes::from_static(b"x"), None).await,
            Err(Error::NotConnected)
        ));

        peripheral.drop_link();
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_setup_notification_checks_properties() {
        let peripheral = printer();
        let (transport, _cancel, _rx) = connected(peripheral.clone()).await;

        transport
            .setup_notification(Uuid::from_u128(NOTIFY), false)
            .await
            .unwrap();
        assert!(matches!(
            transport
                .setup_notification(Uuid::from_u128(NOTIFY), true)
                .await,
            Err(Error::NotSupported { .. })
        ));
        assert_eq!(peripheral.subscriptions(), vec![Uuid::from_u128(NOTIFY)]);
    }
}
