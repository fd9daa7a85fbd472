//! RFCOMM sockets through BlueZ.
//!
//! Registers a client profile for the service UUID and asks BlueZ to
//! connect it; the socket arrives as a connection request on the profile.

use async_trait::async_trait;
use bluer::rfcomm::{Profile, Role};
use bluer::{Adapter, Address, Session};
use futures::StreamExt;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::transport::{RfcommConnector, SocketStream};

fn connect_error(e: impl std::fmt::Display) -> Error {
    Error::ConnectionFailed {
        reason: e.to_string(),
    }
}

/// [`RfcommConnector`] over the BlueZ D-Bus API.
pub struct BluezRfcommConnector {
    session: Session,
    adapter: Adapter,
}

impl BluezRfcommConnector {
    /// Connect to bluetoothd and use the default adapter.
    pub async fn new() -> Result<Self> {
        let session = Session::new()
            .await
            .map_err(|_e| Error::BluetoothUnavailable)?;
        let adapter = session
            .default_adapter()
            .await
            .map_err(|_e| Error::BluetoothUnavailable)?;
        info!("Using BlueZ adapter {}", adapter.name());
        Ok(Self { session, adapter })
    }
}

#[async_trait]
impl RfcommConnector for BluezRfcommConnector {
    async fn open(&self, address: &str, service_uuid: Uuid) -> Result<Box<dyn SocketStream>> {
        let parsed: Address = address.parse().map_err(|_e| Error::InvalidAddress {
            address: address.to_string(),
        })?;
        let device = self.adapter.device(parsed).map_err(|_e| Error::DeviceNotFound {
            address: address.to_string(),
        })?;

        let profile = Profile {
            uuid: service_uuid,
            role: Some(Role::Client),
            require_authentication: Some(false),
            require_authorization: Some(false),
            auto_connect: Some(false),
            ..Default::default()
        };
        let mut requests = self
            .session
            .register_profile(profile)
            .await
            .map_err(connect_error)?;

        debug!("Connecting profile {} on {}", service_uuid, address);
        let connect = device.connect_profile(&service_uuid);
        tokio::pin!(connect);
        let mut connect_done = false;

        let request = loop {
            tokio::select! {
                result = &mut connect, if !connect_done => {
                    connect_done = true;
                    result.map_err(connect_error)?;
                }
                request = requests.next() => {
                    break request.ok_or_else(|| connect_error("profile registration closed"))?;
                }
            }
        };

        let stream = request.accept().map_err(connect_error)?;
        Ok(Box::new(stream))
    }
}
