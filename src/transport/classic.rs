//! Classic (RFCOMM / SPP) transport.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::chunking::{write_fragments, ChunkingPolicy, FragmentSink};
use crate::config::{ClassicConfig, ConnectConfig};
use crate::device::TransportKind;
use crate::error::{Error, Result};
use crate::transport::{SessionContext, TransportHandle};

/// A connected RFCOMM byte stream.
pub trait SocketStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> SocketStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

type Stream = Box<dyn SocketStream>;

/// Opens RFCOMM sockets.
#[async_trait]
pub trait RfcommConnector: Send + Sync + 'static {
    /// Stop any running inquiry. Inquiry slows RFCOMM connection setup.
    async fn cancel_discovery(&self) -> Result<()> {
        Ok(())
    }

    /// Open a socket to the service identified by `service_uuid`.
    async fn open(&self, address: &str, service_uuid: Uuid) -> Result<Box<dyn SocketStream>>;
}

struct FlushingWriter<'a> {
    writer: &'a mut WriteHalf<Stream>,
}

#[async_trait]
impl FragmentSink for FlushingWriter<'_> {
    async fn write_fragment(&mut self, fragment: &[u8]) -> Result<()> {
        self.writer.write_all(fragment).await?;
        self.writer.flush().await?;
        Ok(())
    }
}

/// Classic transport session over an [`RfcommConnector`].
pub struct ClassicTransport<C> {
    address: String,
    connector: Arc<C>,
    config: ClassicConfig,
    writer: tokio::sync::Mutex<Option<WriteHalf<Stream>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    cancel: Mutex<Option<CancellationToken>>,
    closed: AtomicBool,
}

impl<C: RfcommConnector> ClassicTransport<C> {
    /// Create an unconnected transport.
    pub fn new(address: impl Into<String>, connector: Arc<C>, config: ClassicConfig) -> Self {
        Self {
            address: address.into(),
            connector,
            config,
            writer: tokio::sync::Mutex::new(None),
            reader: Mutex::new(None),
            cancel: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    fn session_token(&self) -> Result<CancellationToken> {
        if self.is_closed() {
            return Err(Error::NotConnected);
        }
        self.cancel.lock().clone().ok_or(Error::NotConnected)
    }
}

/// Drain the socket until it closes. Incoming data is discarded; the loop
/// exists to notice the remote end going away.
async fn read_loop(mut reader: ReadHalf<Stream>, buffer_size: usize, context: SessionContext) {
    let cancel = context.cancellation().clone();
    let mut buf = vec![0u8; buffer_size.max(1)];

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                trace!("Read loop for session {} cancelled", context.session());
                return;
            }
            result = reader.read(&mut buf) => match result {
                Ok(0) => {
                    context.link_dropped("socket closed by remote");
                    return;
                }
                Ok(n) => {
                    trace!("Discarding {} bytes on session {}", n, context.session());
                }
                Err(e) => {
                    context.link_dropped(format!("socket read failed: {}", e));
                    return;
                }
            }
        }
    }
}

#[async_trait]
impl<C: RfcommConnector> TransportHandle for ClassicTransport<C> {
    fn kind(&self) -> TransportKind {
        TransportKind::Classic
    }

    fn address(&self) -> &str {
        &self.address
    }

    async fn connect(&self, _config: &ConnectConfig, context: SessionContext) -> Result<()> {
        if self.is_closed() {
            return Err(Error::NotConnected);
        }

        if let Err(e) = self.connector.cancel_discovery().await {
            warn!("Failed to stop discovery before RFCOMM connect: {}", e);
        }

        debug!(
            "Opening RFCOMM session {} to {} ({})",
            context.session(),
            self.address,
            self.config.service_uuid
        );
        let stream = self
            .connector
            .open(&self.address, self.config.service_uuid)
            .await?;
        let (read_half, write_half) = tokio::io::split(stream);
        *self.writer.lock().await = Some(write_half);

        *self.cancel.lock() = Some(context.cancellation().clone());
        let handle = tokio::spawn(read_loop(
            read_half,
            self.config.read_buffer_size,
            context,
        ));
        *self.reader.lock() = Some(handle);

        info!("RFCOMM link to {} established", self.address);
        Ok(())
    }

    async fn write(&self, payload: Bytes, characteristic: Option<Uuid>) -> Result<()> {
        let token = self.session_token()?;
        if let Some(uuid) = characteristic {
            debug!("Ignoring characteristic {} on RFCOMM write", uuid);
        }

        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(Error::NotConnected)?;
        let policy = ChunkingPolicy::classic(&self.config)?;

        trace!(
            "Writing {} bytes to {} in {} fragments",
            payload.len(),
            self.address,
            policy.fragment_count(payload.len())
        );
        let mut sink = FlushingWriter { writer };
        write_fragments(&policy, &payload, &token, &mut sink).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if let Some(token) = self.cancel.lock().take() {
            token.cancel();
        }
        let reader = self.reader.lock().take();
        if let Some(handle) = reader {
            let _ = handle.await;
        }

        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            if let Err(e) = writer.flush().await {
                debug!("Flush before close failed on {}: {}", self.address, e);
            }
            tokio::time::sleep(self.config.pre_close_delay).await;
            if let Err(e) = writer.shutdown().await {
                debug!("Socket shutdown failed on {}: {}", self.address, e);
            }
        }

        info!("RFCOMM link to {} closed", self.address);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SPP_SERVICE_UUID;
    use crate::platform::fake::FakeConnector;
    use crate::transport::LinkDrop;
    use std::time::Duration;
    use tokio::sync::mpsc;

    async fn connected(
        connector: Arc<FakeConnector>,
    ) -> (
        ClassicTransport<FakeConnector>,
        tokio::io::DuplexStream,
        mpsc::UnboundedReceiver<LinkDrop>,
    ) {
        let transport =
            ClassicTransport::new("00:11:22:33:44:55", connector.clone(), ClassicConfig::default());
        let (tx, rx) = mpsc::unbounded_channel();
        transport
            .connect(
                &ConnectConfig::classic(),
                SessionContext::new(3, CancellationToken::new(), tx),
            )
            .await
            .unwrap();
        let remote = connector.take_remote().unwrap();
        (transport, remote, rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_fragments_in_order_with_pacing() {
        let connector = Arc::new(FakeConnector::new());
        let (transport, mut remote, _rx) = connected(connector).await;
        let payload: Vec<u8> = (0..2600u32).map(|i| (i % 256) as u8).collect();

        let start = tokio::time::Instant::now();
        transport
            .write(Bytes::from(payload.clone()), None)
            .await
            .unwrap();
        assert_eq!(start.elapsed(), Duration::from_millis(20));

        let mut received = vec![0u8; payload.len()];
        remote.read_exact(&mut received).await.unwrap();
        assert_eq!(received, payload);
    }

    #[tokio::test]
    async fn test_connect_stops_discovery_and_uses_spp() {
        let connector = Arc::new(FakeConnector::new());
        let (_transport, _remote, _rx) = connected(connector.clone()).await;

        assert_eq!(connector.discovery_cancels(), 1);
        assert_eq!(connector.opened(), vec![("00:11:22:33:44:55".to_string(), SPP_SERVICE_UUID)]);
    }

    #[tokio::test]
    async fn test_open_failure() {
        let connector = Arc::new(FakeConnector::new());
        connector.fail_next_open("service discovery failed");
        let transport = ClassicTransport::new("AA", connector, ClassicConfig::default());
        let (tx, _rx) = mpsc::unbounded_channel();

        let result = transport
            .connect(
                &ConnectConfig::classic(),
                SessionContext::new(1, CancellationToken::new(), tx),
            )
            .await;

        assert!(result.is_err());
        assert!(matches!(
            transport.write(Bytes::from_static(b"x"), None).await,
            Err(Error::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_remote_close_reports_link_drop() {
        let connector = Arc::new(FakeConnector::new());
        let (_transport, remote, mut rx) = connected(connector).await;

        drop(remote);

        let drop = rx.recv().await.unwrap();
        assert_eq!(drop.session, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_shuts_socket_without_link_drop() {
        let connector = Arc::new(FakeConnector::new());
        let (transport, mut remote, mut rx) = connected(connector).await;

        transport.write(Bytes::from_static(b"\x1b@"), None).await.unwrap();
        transport.close().await.unwrap();
        transport.close().await.unwrap();

        let mut received = Vec::new();
        remote.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"\x1b@".to_vec());
        assert!(rx.try_recv().is_err());
        assert!(matches!(
            transport.write(Bytes::from_static(b"x"), None).await,
            Err(Error::NotConnected)
        ));
    }
}
