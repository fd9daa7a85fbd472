//! Asynchronous notifications pushed to the host.
//!
//! The host owns the receiving end (an [`EventSink`]) and may attach or
//! detach it at any time. Notifications emitted while nothing is attached
//! are dropped.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc};
use tracing::trace;

use crate::command::Value;
use crate::device::AddressableDevice;
use crate::lifecycle::ConnectionState;

/// Method name used for scan result notifications.
pub const SCAN_RESULT_METHOD: &str = "scanResult";

/// Method name used for connection state notifications.
pub const CONNECTION_STATE_METHOD: &str = "connectionStateChanged";

/// A notification for the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A new device was found during discovery.
    ScanResult(AddressableDevice),
    /// The connection state machine moved to a new state.
    ConnectionStateChanged(ConnectionState),
}

impl Event {
    /// The host-side method name of this event.
    pub fn method(&self) -> &'static str {
        match self {
            Self::ScanResult(_) => SCAN_RESULT_METHOD,
            Self::ConnectionStateChanged(_) => CONNECTION_STATE_METHOD,
        }
    }

    /// The attribute map carried by this event.
    pub fn payload(&self) -> Value {
        match self {
            Self::ScanResult(device) => Value::Map(device.to_attribute_map()),
            Self::ConnectionStateChanged(state) => {
                let mut map = BTreeMap::new();
                map.insert("state".to_string(), Value::Int(i64::from(state.code())));
                Value::Map(map)
            }
        }
    }
}

/// Receiver of host notifications.
///
/// `send` is called while the connection state lock is held so that
/// notifications keep transition order. Implementations must return quickly
/// and must not call back into the lifecycle.
pub trait EventSink: Send + Sync {
    /// Deliver one notification.
    fn send(&self, event: Event);
}

impl<F> EventSink for F
where
    F: Fn(Event) + Send + Sync,
{
    fn send(&self, event: Event) {
        self(event)
    }
}

impl EventSink for mpsc::UnboundedSender<Event> {
    fn send(&self, event: Event) {
        let _ = mpsc::UnboundedSender::send(self, event);
    }
}

impl EventSink for broadcast::Sender<Event> {
    fn send(&self, event: Event) {
        let _ = broadcast::Sender::send(self, event);
    }
}

/// Late-bound, shared reference to the host's event sink.
#[derive(Clone, Default)]
pub struct EventHub {
    sink: Arc<RwLock<Option<Arc<dyn EventSink>>>>,
}

impl std::fmt::Debug for EventHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHub")
            .field("attached", &self.is_attached())
            .finish()
    }
}

impl EventHub {
    /// Create a hub with nothing attached.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a sink, replacing any previous one.
    pub fn attach(&self, sink: Arc<dyn EventSink>) {
        *self.sink.write() = Some(sink);
    }

    /// Detach the current sink.
    pub fn detach(&self) {
        *self.sink.write() = None;
    }

    /// Check whether a sink is attached.
    pub fn is_attached(&self) -> bool {
        self.sink.read().is_some()
    }

    /// Deliver an event if a sink is attached. Returns whether it was delivered.
    pub fn emit(&self, event: Event) -> bool {
        let sink = self.sink.read().clone();
        match sink {
            Some(sink) => {
                sink.send(event);
                true
            }
            None => {
                trace!("No event sink attached, dropping {}", event.method());
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::TransportKind;
    use parking_lot::Mutex;

    #[test]
    fn test_emit_without_sink_is_dropped() {
        let hub = EventHub::new();
        assert!(!hub.is_attached());
        assert!(!hub.emit(Event::ConnectionStateChanged(ConnectionState::Connected)));
    }

    #[test]
    fn test_attach_detach() {
        let hub = EventHub::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = seen.clone();
        hub.attach(Arc::new(move |event: Event| sink_seen.lock().push(event)));

        assert!(hub.emit(Event::ConnectionStateChanged(ConnectionState::Connecting)));
        hub.detach();
        assert!(!hub.emit(Event::ConnectionStateChanged(ConnectionState::Connected)));

        assert_eq!(
            *seen.lock(),
            vec![Event::ConnectionStateChanged(ConnectionState::Connecting)]
        );
    }

    #[test]
    fn test_clones_share_the_binding() {
        let hub = EventHub::new();
        let clone = hub.clone();
        let (tx, mut rx) = mpsc::unbounded_channel();
        clone.attach(Arc::new(tx));

        hub.emit(Event::ConnectionStateChanged(ConnectionState::Failed));
        assert_eq!(
            rx.try_recv().unwrap(),
            Event::ConnectionStateChanged(ConnectionState::Failed)
        );
    }

    #[test]
    fn test_payloads() {
        let event = Event::ConnectionStateChanged(ConnectionState::Disconnected);
        assert_eq!(event.method(), "connectionStateChanged");
        match event.payload() {
            Value::Map(map) => assert_eq!(map["state"], Value::Int(3)),
            other => panic!("unexpected payload {other:?}"),
        }

        let device = AddressableDevice::new("AA", "P1", TransportKind::Ble);
        let event = Event::ScanResult(device);
        assert_eq!(event.method(), "scanResult");
        match event.payload() {
            Value::Map(map) => assert_eq!(map["name"], Value::from("P1")),
            other => panic!("unexpected payload {other:?}"),
        }
    }
}
