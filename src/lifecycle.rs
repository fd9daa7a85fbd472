//! Connection lifecycle for a single printer link.
//!
//! [`ConnectionLifecycle`] owns at most one transport session at a time and
//! is the only place the [`ConnectionState`] changes. Caller commands,
//! deferred-disconnect timers and transport link drops all end up in the
//! same critical section, so whichever reaches it first wins and the other
//! becomes a no-op.
//!
//! # State machine
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Disconnected
//!                            \-> Failed    -> Disconnected
//! ```
//!
//! A new `connect` is accepted from any state. Transport teardown runs in
//! the background and is awaited by the next `connect` before it opens a new
//! session.

use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::config::{ConnectConfig, ConnectionPriority, LifecycleConfig};
use crate::device::TransportKind;
use crate::error::{Error, Result};
use crate::event::{Event, EventHub};
use crate::transport::{LinkDrop, SessionContext, SessionId, TransportFactory, TransportHandle};

/// Observable state of the printer connection.
///
/// The discriminant is the code sent to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum ConnectionState {
    /// A connect attempt is in progress.
    Connecting = 0,
    /// A transport session is established.
    Connected = 1,
    /// The last connect attempt failed.
    Failed = 2,
    /// No transport session exists.
    #[default]
    Disconnected = 3,
}

impl ConnectionState {
    /// The integer code sent with state notifications.
    pub fn code(&self) -> u8 {
        *self as u8
    }

    /// Check if connected.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Failed => write!(f, "Failed"),
            Self::Disconnected => write!(f, "Disconnected"),
        }
    }
}

/// The one live session and everything it owns.
struct ActiveConnection {
    address: String,
    kind: TransportKind,
    session: SessionId,
    transport: Arc<dyn TransportHandle>,
    /// Set once the transport connect succeeded.
    established: bool,
    /// Keep-alive flag cleared by a deferred disconnect.
    is_active: bool,
    /// Last applied connection priority.
    priority: ConnectionPriority,
    /// Last capacity request and its negotiated result.
    capacity: Option<(u16, u16)>,
    /// Cancels every background task of the session.
    cancel: CancellationToken,
    /// Cancels the pending deferred disconnect, if any.
    deferred: Option<CancellationToken>,
}

impl ActiveConnection {
    fn matches(&self, address: &str, kind: TransportKind) -> bool {
        self.established && self.address == address && self.kind == kind
    }

    fn reactivate(&mut self) {
        self.is_active = true;
        if let Some(timer) = self.deferred.take() {
            debug!("Cancelling deferred disconnect of {}", self.address);
            timer.cancel();
        }
    }

    fn dispose(&mut self) {
        if let Some(timer) = self.deferred.take() {
            timer.cancel();
        }
        self.cancel.cancel();
    }

    /// Dispose the session and close its transport in the background.
    fn release(mut self) -> JoinHandle<()> {
        self.dispose();
        let transport = self.transport;
        let address = self.address;
        tokio::spawn(async move {
            if let Err(e) = transport.close().await {
                warn!("Error closing transport to {}: {}", address, e);
            }
        })
    }
}

struct LifecycleState {
    state: ConnectionState,
    active: Option<ActiveConnection>,
    next_session: SessionId,
    /// Transport closes that a new session must wait for.
    releases: Vec<JoinHandle<()>>,
}

struct Shared {
    config: LifecycleConfig,
    factory: Arc<dyn TransportFactory>,
    events: EventHub,
    inner: Mutex<LifecycleState>,
    /// Serialises connect attempts.
    connect_lock: tokio::sync::Mutex<()>,
    drops: mpsc::UnboundedSender<LinkDrop>,
}

impl Shared {
    /// Apply a transition and notify the host. Must be called with the
    /// state lock held.
    fn transition(&self, inner: &mut LifecycleState, next: ConnectionState) {
        if inner.state == next {
            trace!("Suppressing redundant transition to {}", next);
            return;
        }
        debug!("Connection state {} -> {}", inner.state, next);
        inner.state = next;
        self.events.emit(Event::ConnectionStateChanged(next));
    }

    fn teardown_locked(&self, inner: &mut LifecycleState, reason: &str) {
        if let Some(active) = inner.active.take() {
            info!(
                "Tearing down session {} to {} ({})",
                active.session, active.address, reason
            );
            inner.releases.retain(|handle| !handle.is_finished());
            inner.releases.push(active.release());
        }
        self.transition(inner, ConnectionState::Disconnected);
    }

    fn teardown(&self, reason: &str) {
        let mut inner = self.inner.lock();
        self.teardown_locked(&mut inner, reason);
    }

    fn expire_grace_period(&self, session: SessionId) {
        let mut inner = self.inner.lock();
        let expired = inner
            .active
            .as_ref()
            .map_or(false, |active| active.session == session && !active.is_active);
        if expired {
            self.teardown_locked(&mut inner, "grace period elapsed");
        } else {
            trace!("Grace period of session {} ended with the link kept", session);
        }
    }

    fn on_link_drop(&self, drop: LinkDrop) {
        let mut inner = self.inner.lock();
        let current = inner
            .active
            .as_ref()
            .map_or(false, |active| active.session == drop.session);
        if current {
            warn!("Link dropped on session {}: {}", drop.session, drop.reason);
            self.teardown_locked(&mut inner, &drop.reason);
        } else {
            debug!("Ignoring link drop from stale session {}", drop.session);
        }
    }
}

async fn pump_link_drops(shared: Weak<Shared>, mut drops: mpsc::UnboundedReceiver<LinkDrop>) {
    while let Some(drop) = drops.recv().await {
        let Some(shared) = shared.upgrade() else {
            break;
        };
        shared.on_link_drop(drop);
    }
    trace!("Link drop pump ended");
}

enum ConnectPlan {
    Reuse {
        transport: Arc<dyn TransportHandle>,
        priority: Option<ConnectionPriority>,
    },
    Fresh {
        releases: Vec<JoinHandle<()>>,
    },
}

/// The connection state machine.
///
/// Must be created inside a Tokio runtime.
pub struct ConnectionLifecycle {
    shared: Arc<Shared>,
    pump: JoinHandle<()>,
}

impl ConnectionLifecycle {
    /// Create a lifecycle that opens transports through `factory` and
    /// reports transitions to `events`.
    pub fn new(
        factory: Arc<dyn TransportFactory>,
        events: EventHub,
        config: LifecycleConfig,
    ) -> Self {
        let (drops_tx, drops_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            config,
            factory,
            events,
            inner: Mutex::new(LifecycleState {
                state: ConnectionState::Disconnected,
                active: None,
                next_session: 0,
                releases: Vec::new(),
            }),
            connect_lock: tokio::sync::Mutex::new(()),
            drops: drops_tx,
        });
        let pump = tokio::spawn(pump_link_drops(Arc::downgrade(&shared), drops_rx));

        Self { shared, pump }
    }

    /// The current state.
    pub fn state(&self) -> ConnectionState {
        self.shared.inner.lock().state
    }

    /// Address of the established connection, if any.
    pub fn connected_address(&self) -> Option<String> {
        let inner = self.shared.inner.lock();
        inner
            .active
            .as_ref()
            .filter(|active| active.established)
            .map(|active| active.address.clone())
    }

    /// Transport kind of the established connection, if any.
    pub fn connected_transport(&self) -> Option<TransportKind> {
        let inner = self.shared.inner.lock();
        inner
            .active
            .as_ref()
            .filter(|active| active.established)
            .map(|active| active.kind)
    }

    /// Connect to `address`.
    ///
    /// Returns immediately if an established connection to the same address
    /// and transport exists, re-activating it. Any other connection is torn
    /// down without a `Disconnected` notification and its release awaited
    /// before the new session is opened.
    pub async fn connect(&self, address: &str, config: &ConnectConfig) -> Result<()> {
        if address.trim().is_empty() {
            return Err(Error::InvalidAddress {
                address: address.to_string(),
            });
        }

        let _serial = self.shared.connect_lock.lock().await;

        let plan = {
            let mut inner = self.shared.inner.lock();
            if let Some(active) = inner
                .active
                .as_mut()
                .filter(|active| active.matches(address, config.transport))
            {
                debug!("Already connected to {}, reusing session", address);
                active.reactivate();
                let priority = (active.priority != config.priority).then(|| {
                    active.priority = config.priority;
                    config.priority
                });
                ConnectPlan::Reuse {
                    transport: active.transport.clone(),
                    priority,
                }
            } else {
                if let Some(previous) = inner.active.take() {
                    info!(
                        "Superseding connection to {} with {}",
                        previous.address, address
                    );
                    inner.releases.push(previous.release());
                }
                ConnectPlan::Fresh {
                    releases: std::mem::take(&mut inner.releases),
                }
            }
        };

        match plan {
            ConnectPlan::Reuse {
                transport,
                priority,
            } => {
                if let Some(priority) = priority {
                    apply_priority(transport.as_ref(), priority).await;
                }
                Ok(())
            }
            ConnectPlan::Fresh { releases } => {
                await_releases(releases).await;
                self.open_session(address, config).await
            }
        }
    }

    async fn open_session(&self, address: &str, config: &ConnectConfig) -> Result<()> {
        let transport = match self
            .shared
            .factory
            .open_transport(address, config.transport)
            .await
        {
            Ok(transport) => transport,
            Err(e) => {
                // A superseded session is already gone.
                let mut inner = self.shared.inner.lock();
                if inner.active.is_none() && inner.state.is_connected() {
                    self.shared.transition(&mut inner, ConnectionState::Disconnected);
                }
                return Err(e);
            }
        };

        let cancel = CancellationToken::new();
        let session = {
            let mut inner = self.shared.inner.lock();
            inner.next_session += 1;
            let session = inner.next_session;
            inner.active = Some(ActiveConnection {
                address: address.to_string(),
                kind: config.transport,
                session,
                transport: transport.clone(),
                established: false,
                is_active: true,
                priority: config.priority,
                capacity: None,
                cancel: cancel.clone(),
                deferred: None,
            });
            self.shared.transition(&mut inner, ConnectionState::Connecting);
            session
        };

        let timeout = config.effective_timeout(self.shared.config.default_connect_timeout);
        info!(
            "Connecting to {} over {} (session {}, timeout {:?})",
            address, config.transport, session, timeout
        );

        let context = SessionContext::new(session, cancel.clone(), self.shared.drops.clone());
        let outcome = tokio::select! {
            _ = cancel.cancelled() => Err(Error::ConnectionFailed {
                reason: "connect cancelled".to_string(),
            }),
            result = tokio::time::timeout(timeout, transport.connect(config, context)) => {
                match result {
                    Ok(result) => result,
                    Err(_) => Err(Error::Timeout { timeout }),
                }
            }
        };

        let mut inner = self.shared.inner.lock();
        let current = inner
            .active
            .as_ref()
            .map_or(false, |active| active.session == session);
        if !current {
            debug!("Session {} was torn down while connecting", session);
            return match outcome {
                Ok(()) => Err(Error::ConnectionFailed {
                    reason: "connection torn down while connecting".to_string(),
                }),
                Err(e) => Err(e),
            };
        }

        match outcome {
            Ok(()) => {
                if let Some(active) = inner.active.as_mut() {
                    active.established = true;
                }
                self.shared.transition(&mut inner, ConnectionState::Connected);
                drop(inner);

                info!("Connected to {}", address);
                if config.transport.is_ble() && config.priority != ConnectionPriority::default() {
                    apply_priority(transport.as_ref(), config.priority).await;
                }
                Ok(())
            }
            Err(e) => {
                if let Some(failed) = inner.active.take() {
                    inner.releases.retain(|handle| !handle.is_finished());
                    inner.releases.push(failed.release());
                }
                self.shared.transition(&mut inner, ConnectionState::Failed);
                drop(inner);

                warn!("Connect to {} failed: {}", address, e);
                Err(e)
            }
        }
    }

    /// Disconnect.
    ///
    /// With no grace period (or a zero one) the session is torn down at once.
    /// Otherwise the connection is marked inactive and torn down after
    /// `grace_period` unless [`connect`](Self::connect) or
    /// [`ensure_connected`](Self::ensure_connected) re-activates it first.
    /// Never waits for the transport to close.
    pub fn disconnect(&self, grace_period: Option<Duration>) {
        match grace_period.filter(|grace| !grace.is_zero()) {
            None => self.shared.teardown("disconnect requested"),
            Some(grace) => self.defer_disconnect(grace),
        }
    }

    fn defer_disconnect(&self, grace: Duration) {
        let mut inner = self.shared.inner.lock();
        let Some(active) = inner.active.as_mut() else {
            self.shared.transition(&mut inner, ConnectionState::Disconnected);
            return;
        };

        active.is_active = false;
        if let Some(previous) = active.deferred.take() {
            previous.cancel();
        }
        let timer = CancellationToken::new();
        active.deferred = Some(timer.clone());
        let session = active.session;
        debug!("Disconnect of {} deferred by {:?}", active.address, grace);

        let shared = Arc::downgrade(&self.shared);
        tokio::spawn(async move {
            tokio::select! {
                _ = timer.cancelled() => {}
                _ = tokio::time::sleep(grace) => {
                    if let Some(shared) = shared.upgrade() {
                        shared.expire_grace_period(session);
                    }
                }
            }
        });
    }

    /// Keep the connection to `address` alive.
    ///
    /// Returns `true` and cancels any deferred disconnect if an established
    /// connection to `address` exists. Never connects.
    pub fn ensure_connected(&self, address: &str) -> bool {
        let mut inner = self.shared.inner.lock();
        match inner
            .active
            .as_mut()
            .filter(|active| active.established && active.address == address)
        {
            Some(active) => {
                active.reactivate();
                true
            }
            None => false,
        }
    }

    fn connected_transport_handle(&self) -> Result<(SessionId, Arc<dyn TransportHandle>)> {
        let inner = self.shared.inner.lock();
        match (inner.state, inner.active.as_ref()) {
            (ConnectionState::Connected, Some(active)) if active.established => {
                Ok((active.session, active.transport.clone()))
            }
            _ => Err(Error::NotConnected),
        }
    }

    /// Write `payload` to the connected device.
    pub async fn write(&self, payload: Bytes, characteristic: Option<Uuid>) -> Result<()> {
        let (session, transport) = self.connected_transport_handle()?;
        trace!("Writing {} bytes on session {}", payload.len(), session);
        transport.write(payload, characteristic).await
    }

    /// Renegotiate link capacity (BLE MTU).
    ///
    /// A repeated request for the same value returns the cached result.
    pub async fn request_capacity(&self, mtu: u16) -> Result<u16> {
        let (session, transport) = self.connected_transport_handle()?;

        let cached = {
            let inner = self.shared.inner.lock();
            inner
                .active
                .as_ref()
                .filter(|active| active.session == session)
                .and_then(|active| active.capacity)
        };
        if let Some((requested, negotiated)) = cached {
            if requested == mtu {
                debug!("MTU {} already negotiated as {}", mtu, negotiated);
                return Ok(negotiated);
            }
        }

        let negotiated = transport.request_capacity(mtu).await?;

        let mut inner = self.shared.inner.lock();
        if let Some(active) = inner
            .active
            .as_mut()
            .filter(|active| active.session == session)
        {
            active.capacity = Some((mtu, negotiated));
        }
        Ok(negotiated)
    }

    /// Subscribe to notifications or indications of a characteristic.
    pub async fn setup_notification(&self, characteristic: Uuid, indicate: bool) -> Result<()> {
        let (_, transport) = self.connected_transport_handle()?;
        transport.setup_notification(characteristic, indicate).await
    }

    /// Tear down any session and wait until its transport is closed.
    pub async fn shutdown(&self) {
        let releases = {
            let mut inner = self.shared.inner.lock();
            self.shared.teardown_locked(&mut inner, "shutdown");
            std::mem::take(&mut inner.releases)
        };
        await_releases(releases).await;
    }
}

async fn await_releases(releases: Vec<JoinHandle<()>>) {
    for release in releases {
        if let Err(e) = release.await {
            warn!("Transport release task failed: {}", e);
        }
    }
}

async fn apply_priority(transport: &dyn TransportHandle, priority: ConnectionPriority) {
    if let Err(e) = transport.request_priority(priority).await {
        warn!(
            "Failed to apply {:?} priority on {}: {}",
            priority,
            transport.address(),
            e
        );
    }
}

impl std::fmt::Debug for ConnectionLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionLifecycle")
            .field("state", &self.state())
            .field("connected_address", &self.connected_address())
            .finish()
    }
}

impl Drop for ConnectionLifecycle {
    fn drop(&mut self) {
        self.pump.abort();
        let Some(mut active) = self.shared.inner.lock().active.take() else {
            return;
        };
        if tokio::runtime::Handle::try_current().is_ok() {
            drop(active.release());
        } else {
            warn!("No runtime to close transport to {}", active.address);
            active.dispose();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::fake::{FakePeripheral, FakePlatform};
    use btleplug::api::CharPropFlags;
    use pretty_assertions::assert_eq;

    const WRITE_CHAR: u128 = 0x0000ff02_0000_1000_8000_00805f9b34fb;

    fn lifecycle_with(platform: Arc<FakePlatform>) -> (ConnectionLifecycle, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let events = EventHub::new();
        events.attach(Arc::new(tx));
        let lifecycle = ConnectionLifecycle::new(platform, events, LifecycleConfig::default());
        (lifecycle, rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Event>) -> Vec<ConnectionState> {
        let mut states = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let Event::ConnectionStateChanged(state) = event {
                states.push(state);
            }
        }
        states
    }

    fn printer(address: &str) -> Arc<FakePeripheral> {
        Arc::new(
            FakePeripheral::new(address)
                .with_characteristic(Uuid::from_u128(WRITE_CHAR), CharPropFlags::WRITE),
        )
    }

    #[test]
    fn test_state_codes() {
        assert_eq!(ConnectionState::Connecting.code(), 0);
        assert_eq!(ConnectionState::Connected.code(), 1);
        assert_eq!(ConnectionState::Failed.code(), 2);
        assert_eq!(ConnectionState::Disconnected.code(), 3);
        assert_eq!(ConnectionState::default(), ConnectionState::Disconnected);
        assert_eq!(ConnectionState::Failed.to_string(), "Failed");
    }

    #[tokio::test]
    async fn test_empty_address_rejected_without_notification() {
        let platform = Arc::new(FakePlatform::new());
        let (lifecycle, mut rx) = lifecycle_with(platform.clone());

        let result = lifecycle.connect("", &ConnectConfig::ble()).await;

        assert!(matches!(result, Err(Error::InvalidAddress { .. })));
        assert!(drain(&mut rx).is_empty());
        assert_eq!(platform.transports_opened(), 0);
    }

    #[tokio::test]
    async fn test_unknown_device_fails_before_connecting() {
        let platform = Arc::new(FakePlatform::new());
        let (lifecycle, mut rx) = lifecycle_with(platform);

        let result = lifecycle.connect("AA:AA", &ConnectConfig::ble()).await;

        assert!(matches!(result, Err(Error::DeviceNotFound { .. })));
        assert!(drain(&mut rx).is_empty());
        assert_eq!(lifecycle.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_then_immediate_disconnect() {
        let platform = Arc::new(FakePlatform::new());
        let peripheral = printer("AA:01");
        platform.add_ble_peripheral(peripheral.clone());
        let (lifecycle, mut rx) = lifecycle_with(platform);

        lifecycle.connect("AA:01", &ConnectConfig::ble()).await.unwrap();
        assert_eq!(lifecycle.connected_address().as_deref(), Some("AA:01"));

        lifecycle.disconnect(None);
        lifecycle.disconnect(None);
        lifecycle.shutdown().await;

        assert_eq!(
            drain(&mut rx),
            vec![
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::Disconnected
            ]
        );
        assert_eq!(peripheral.disconnect_count(), 1);
        assert!(!peripheral.is_connected());
    }

    #[tokio::test]
    async fn test_link_drop_moves_to_disconnected() {
        let platform = Arc::new(FakePlatform::new());
        let peripheral = printer("AA:02");
        platform.add_ble_peripheral(peripheral.clone());
        let (lifecycle, mut rx) = lifecycle_with(platform);

        lifecycle.connect("AA:02", &ConnectConfig::ble()).await.unwrap();
        peripheral.drop_link();

        for _ in 0..100 {
            if lifecycle.state() == ConnectionState::Disconnected {
                break;
            }
            tokio::task::yield_now().await;
        }

        assert_eq!(lifecycle.state(), ConnectionState::Disconnected);
        assert_eq!(
            drain(&mut rx),
            vec![
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::Disconnected
            ]
        );

        lifecycle.disconnect(None);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_capacity_is_cached() {
        let platform = Arc::new(FakePlatform::new());
        let peripheral = Arc::new(
            FakePeripheral::new("AA:03")
                .with_characteristic(Uuid::from_u128(WRITE_CHAR), CharPropFlags::WRITE)
                .with_mtu_limit(247),
        );
        platform.add_ble_peripheral(peripheral.clone());
        let (lifecycle, _rx) = lifecycle_with(platform);

        lifecycle.connect("AA:03", &ConnectConfig::ble()).await.unwrap();
        assert_eq!(lifecycle.request_capacity(512).await.unwrap(), 247);
        assert_eq!(lifecycle.request_capacity(512).await.unwrap(), 247);
        assert_eq!(lifecycle.request_capacity(100).await.unwrap(), 100);

        assert_eq!(peripheral.mtu_requests(), vec![512, 100]);
    }

    #[tokio::test]
    async fn test_priority_reapplied_only_on_change() {
        let platform = Arc::new(FakePlatform::new());
        let peripheral = printer("AA:04");
        platform.add_ble_peripheral(peripheral.clone());
        let (lifecycle, _rx) = lifecycle_with(platform);

        let high = ConnectConfig::ble().with_priority(ConnectionPriority::High);
        lifecycle.connect("AA:04", &high).await.unwrap();
        lifecycle.connect("AA:04", &high).await.unwrap();
        lifecycle
            .connect("AA:04", &ConnectConfig::ble())
            .await
            .unwrap();

        assert_eq!(
            peripheral.priority_requests(),
            vec![ConnectionPriority::High, ConnectionPriority::Balanced]
        );
        assert_eq!(peripheral.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_drop_closes_active_transport() {
        let platform = Arc::new(FakePlatform::new());
        let peripheral = printer("AA:05");
        platform.add_ble_peripheral(peripheral.clone());
        let (lifecycle, _rx) = lifecycle_with(platform);

        lifecycle.connect("AA:05", &ConnectConfig::ble()).await.unwrap();
        drop(lifecycle);

        for _ in 0..100 {
            if peripheral.disconnect_count() > 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(peripheral.disconnect_count(), 1);
        assert!(!peripheral.is_connected());
    }

    struct PanicOnClose {
        address: String,
    }

    #[async_trait::async_trait]
    impl TransportHandle for PanicOnClose {
        fn kind(&self) -> TransportKind {
            TransportKind::Ble
        }

        fn address(&self) -> &str {
            &self.address
        }

        async fn connect(&self, _config: &ConnectConfig, _context: SessionContext) -> Result<()> {
            Ok(())
        }

        async fn write(&self, _payload: Bytes, _characteristic: Option<Uuid>) -> Result<()> {
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            panic!("close blew up");
        }

        fn is_closed(&self) -> bool {
            false
        }
    }

    struct PanickyFactory {
        fallback: FakePlatform,
    }

    #[async_trait::async_trait]
    impl TransportFactory for PanickyFactory {
        async fn open_transport(
            &self,
            address: &str,
            kind: TransportKind,
        ) -> Result<Arc<dyn TransportHandle>> {
            if address == "AA:06" {
                return Ok(Arc::new(PanicOnClose {
                    address: address.to_string(),
                }));
            }
            self.fallback.open_transport(address, kind).await
        }
    }

    #[tokio::test]
    async fn test_failed_release_does_not_block_next_connect() {
        let fallback = FakePlatform::new();
        let peripheral = printer("AA:07");
        fallback.add_ble_peripheral(peripheral.clone());
        let factory = Arc::new(PanickyFactory { fallback });
        let lifecycle = ConnectionLifecycle::new(factory, EventHub::new(), LifecycleConfig::default());

        lifecycle.connect("AA:06", &ConnectConfig::ble()).await.unwrap();
        lifecycle.connect("AA:07", &ConnectConfig::ble()).await.unwrap();

        assert_eq!(lifecycle.state(), ConnectionState::Connected);
        assert_eq!(lifecycle.connected_address().as_deref(), Some("AA:07"));
        assert!(peripheral.is_connected());
    }
}
