//! Injected platform capabilities
//!
//! The engine never reaches for a global radio manager. Callers hand it a
//! [`RadioAdapter`] for discovery and a [`SocketFactory`] for transports, so a
//! real Bluetooth stack, a TCP loopback or the in-memory medium in
//! [`crate::memory`] can be substituted freely.
//!
//! Closing a socket must unblock any task suspended in `accept` or `read` on
//! it with an error. [`IoSocket`] provides that for any tokio byte stream.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{watch, Mutex};
use tracing::debug;

use crate::errors::{BluechatError, Result};
use crate::types::{DiscoveredRecord, PeerDevice, ServiceRecord};

// ----------------------------------------------------------------------------
// Capability Traits
// ----------------------------------------------------------------------------

/// Stream of found-device notifications. Dropping it unregisters the listener.
pub type FoundDevices = BoxStream<'static, DiscoveredRecord>;

/// Local radio: presence, authorization, bonded devices and scanning
#[async_trait]
pub trait RadioAdapter: Send + Sync {
    /// Whether the radio exists and is powered on
    async fn is_enabled(&self) -> bool;

    /// Whether scan/connect authorization has been granted to this process
    async fn is_authorized(&self) -> bool;

    /// Devices previously bonded with this radio
    async fn bonded_devices(&self) -> Result<Vec<PeerDevice>>;

    /// Begin a scan window and register for found-device notifications
    async fn start_scan(&self) -> Result<FoundDevices>;

    /// Cancel the active scan window, if any
    async fn cancel_scan(&self) -> Result<()>;
}

/// Opens listening endpoints and outbound transports
#[async_trait]
pub trait SocketFactory: Send + Sync {
    async fn listen(&self, service: &ServiceRecord) -> Result<Arc<dyn ServerSocket>>;

    async fn connect(&self, address: &str, service: &ServiceRecord) -> Result<Arc<dyn Socket>>;
}

/// A listening endpoint
#[async_trait]
pub trait ServerSocket: Send + Sync {
    /// Wait for the next inbound transport
    async fn accept(&self) -> Result<Arc<dyn Socket>>;

    /// Stop listening. A pending `accept` fails.
    fn close(&self);
}

/// An open bidirectional byte stream
#[async_trait]
pub trait Socket: Send + Sync {
    /// Read into `buf`. `Ok(0)` means the peer closed its side.
    async fn read(&self, buf: &mut [u8]) -> Result<usize>;

    /// Write all of `data`
    async fn write(&self, data: &[u8]) -> Result<()>;

    /// Whether the transport still considers itself connected
    fn is_connected(&self) -> bool;

    /// Close the transport. A pending `read` fails; idempotent.
    fn close(&self);

    /// Remote address, for logging
    fn peer_address(&self) -> &str;
}

// ----------------------------------------------------------------------------
// Generic Stream Socket
// ----------------------------------------------------------------------------

/// [`Socket`] over any tokio byte stream
pub struct IoSocket<S> {
    reader: Mutex<ReadHalf<S>>,
    writer: Arc<Mutex<WriteHalf<S>>>,
    connected: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    peer_address: String,
}

impl<S> IoSocket<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new<A: Into<String>>(stream: S, peer_address: A) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            reader: Mutex::new(reader),
            writer: Arc::new(Mutex::new(writer)),
            connected: AtomicBool::new(true),
            shutdown_tx,
            peer_address: peer_address.into(),
        }
    }

    /// Wrap into the shared handle the engine stores
    pub fn into_shared(self) -> Arc<dyn Socket> {
        Arc::new(self)
    }

    fn is_shut_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl<S> Socket for IoSocket<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        if *shutdown_rx.borrow_and_update() {
            return Err(BluechatError::SocketClosed);
        }

        tokio::select! {
            _ = async {
                let _ = shutdown_rx.wait_for(|closed| *closed).await;
            } => Err(BluechatError::SocketClosed),
            result = async {
                let mut reader = self.reader.lock().await;
                reader.read(buf).await
            } => {
                match result {
                    Ok(0) => {
                        self.mark_disconnected();
                        Ok(0)
                    }
                    Ok(n) => Ok(n),
                    Err(e) => {
                        self.mark_disconnected();
                        Err(BluechatError::Io(e))
                    }
                }
            }
        }
    }

    async fn write(&self, data: &[u8]) -> Result<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        if *shutdown_rx.borrow_and_update() {
            return Err(BluechatError::SocketClosed);
        }

        // A write stuck on a full pipe must give the writer back on close
        tokio::select! {
            _ = async {
                let _ = shutdown_rx.wait_for(|closed| *closed).await;
            } => Err(BluechatError::SocketClosed),
            result = async {
                let mut writer = self.writer.lock().await;
                writer.write_all(data).await?;
                writer.flush().await
            } => result.map_err(|e| {
                self.mark_disconnected();
                BluechatError::Io(e)
            }),
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && !self.is_shut_down()
    }

    fn close(&self) {
        self.mark_disconnected();
        let was_closed = self.shutdown_tx.send_replace(true);
        if !was_closed {
            debug!("Closed socket to {}", self.peer_address);
            // Half-close so the peer sees end of stream even while our Arc lingers
            match self.writer.try_lock() {
                Ok(mut writer) => {
                    let _ = futures::FutureExt::now_or_never(writer.shutdown());
                }
                Err(_) => {
                    // A writer is mid-flight; it bails on the shutdown signal
                    if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                        let writer = self.writer.clone();
                        runtime.spawn(async move {
                            let _ = writer.lock().await.shutdown().await;
                        });
                    }
                }
            }
        }
    }

    fn peer_address(&self) -> &str {
        &self.peer_address
    }
}
