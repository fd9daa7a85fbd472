//! Transport capability shared by the BLE and Classic sessions.
//!
//! The connection lifecycle is written once against [`TransportHandle`];
//! the concrete transports live in [`ble`] and [`classic`].

pub mod ble;
pub mod classic;
pub mod endpoint;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::config::{ConnectConfig, ConnectionPriority};
use crate::device::TransportKind;
use crate::error::{Error, Result};

pub use ble::{BleTransport, CharacteristicInfo, GattPeripheral};
pub use classic::{ClassicTransport, RfcommConnector, SocketStream};
pub use endpoint::WriteEndpointResolver;

/// Identifier of one connection attempt.
pub type SessionId = u64;

/// Report that a session's link went away without being asked to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkDrop {
    /// The session whose link dropped.
    pub session: SessionId,
    /// Why the link dropped.
    pub reason: String,
}

/// Context handed to a transport when it connects.
///
/// Carries the session's cancellation token, which every background task
/// of the session must observe, and the channel used to report link loss.
#[derive(Debug, Clone)]
pub struct SessionContext {
    session: SessionId,
    cancel: CancellationToken,
    drops: mpsc::UnboundedSender<LinkDrop>,
}

impl SessionContext {
    /// Create a context.
    pub fn new(
        session: SessionId,
        cancel: CancellationToken,
        drops: mpsc::UnboundedSender<LinkDrop>,
    ) -> Self {
        Self {
            session,
            cancel,
            drops,
        }
    }

    /// The session this context belongs to.
    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Token cancelled when the session is torn down.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Report a link drop. Ignored once the session has been cancelled.
    pub fn link_dropped(&self, reason: impl Into<String>) {
        if self.cancel.is_cancelled() {
            return;
        }
        let reason = reason.into();
        debug!("Session {} link dropped: {}", self.session, reason);
        let _ = self.drops.send(LinkDrop {
            session: self.session,
            reason,
        });
    }
}

/// One transport session to one device.
///
/// Handles are exclusively owned by the connection lifecycle. Every
/// operation after `close` fails with [`Error::NotConnected`].
#[async_trait]
pub trait TransportHandle: Send + Sync {
    /// The transport variant.
    fn kind(&self) -> TransportKind;

    /// The device address this handle targets.
    fn address(&self) -> &str;

    /// Open the link. Background tasks must stop when the context's token is
    /// cancelled and report unexpected loss through the context.
    async fn connect(&self, config: &ConnectConfig, context: SessionContext) -> Result<()>;

    /// Write a payload, fragmenting it as needed.
    async fn write(&self, payload: Bytes, characteristic: Option<Uuid>) -> Result<()>;

    /// Release the link. Idempotent.
    async fn close(&self) -> Result<()>;

    /// Check whether `close` has run.
    fn is_closed(&self) -> bool;

    /// Request a connection priority.
    async fn request_priority(&self, _priority: ConnectionPriority) -> Result<()> {
        Err(Error::NotSupported {
            operation: format!("connection priority on {}", self.kind()),
        })
    }

    /// Renegotiate link capacity (MTU). Returns the negotiated value.
    async fn request_capacity(&self, _mtu: u16) -> Result<u16> {
        Err(Error::NotSupported {
            operation: format!("MTU negotiation on {}", self.kind()),
        })
    }

    /// Subscribe to notifications or indications of a characteristic.
    async fn setup_notification(&self, _characteristic: Uuid, _indicate: bool) -> Result<()> {
        Err(Error::NotSupported {
            operation: format!("notifications on {}", self.kind()),
        })
    }
}

/// Creates transport handles for device addresses.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Resolve `address` and build an unconnected handle.
    ///
    /// Fails with [`Error::DeviceNotFound`] when the address cannot be
    /// resolved to a device.
    async fn open_transport(
        &self,
        address: &str,
        kind: TransportKind,
    ) -> Result<Arc<dyn TransportHandle>>;
}
