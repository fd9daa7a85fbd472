//! Discovery sessions.
//!
//! Raw scan results arrive on a channel and are folded into the
//! [`DeviceRegistry`]; each new device is announced once as a scan result
//! event. Stopping a session cancels it under the registry lock, so a result
//! still in flight can never touch the registry afterwards.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::device::{AddressableDevice, ScanCandidate};
use crate::event::{Event, EventHub};
use crate::registry::DeviceRegistry;

/// Runs at most one discovery session at a time.
#[derive(Debug)]
pub struct Discovery {
    registry: Arc<Mutex<DeviceRegistry>>,
    session: Mutex<Option<CancellationToken>>,
    events: EventHub,
}

impl Discovery {
    /// Create an idle discovery that announces devices to `events`.
    pub fn new(events: EventHub) -> Self {
        Self::with_registry(DeviceRegistry::new(), events)
    }

    /// Create an idle discovery over a configured registry.
    pub fn with_registry(registry: DeviceRegistry, events: EventHub) -> Self {
        Self {
            registry: Arc::new(Mutex::new(registry)),
            session: Mutex::new(None),
            events,
        }
    }

    /// Start a new session and return the sender for raw results.
    ///
    /// Any running session is stopped first and the registry is cleared.
    /// Must be called inside a Tokio runtime.
    pub fn begin(&self) -> mpsc::UnboundedSender<ScanCandidate> {
        self.end();

        let token = CancellationToken::new();
        self.registry.lock().clear();
        *self.session.lock() = Some(token.clone());

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(fold_results(
            rx,
            self.registry.clone(),
            self.events.clone(),
            token,
        ));
        debug!("Discovery session started");
        tx
    }

    /// Stop the running session. Returns `false` if none was running.
    pub fn end(&self) -> bool {
        let Some(token) = self.session.lock().take() else {
            return false;
        };
        let _registry = self.registry.lock();
        token.cancel();
        debug!("Discovery session stopped");
        true
    }

    /// Check whether a session runs.
    pub fn is_running(&self) -> bool {
        self.session.lock().is_some()
    }

    /// Devices found by the current or last session, in discovery order.
    pub fn devices(&self) -> Vec<AddressableDevice> {
        self.registry.lock().devices()
    }
}

impl Drop for Discovery {
    fn drop(&mut self) {
        self.end();
    }
}

async fn fold_results(
    mut results: mpsc::UnboundedReceiver<ScanCandidate>,
    registry: Arc<Mutex<DeviceRegistry>>,
    events: EventHub,
    token: CancellationToken,
) {
    loop {
        let candidate = tokio::select! {
            _ = token.cancelled() => break,
            candidate = results.recv() => match candidate {
                Some(candidate) => candidate,
                None => break,
            },
        };

        let mut registry = registry.lock();
        if token.is_cancelled() {
            break;
        }
        if registry.add_if_new(&candidate) {
            if let Some(device) = registry.last() {
                trace!("New device {} ({})", device.display_name(), device.address());
                events.emit(Event::ScanResult(device.clone()));
            }
        }
    }
    trace!("Discovery fold ended");
}
