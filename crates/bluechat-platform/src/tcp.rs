//! TCP stand-in radio
//!
//! Behaves like a radio whose neighbourhood is a fixed list of peers: the
//! configured peers are both the bonded set and what every scan reports.
//! Listening binds `listen_addr`; dialing connects to a peer's `host:port`
//! address. The chat service record is not carried on the wire.

use std::net::SocketAddr;
use std::future::poll_fn;
use std::sync::{Arc, Mutex, Weak};
use std::task::Poll;

use async_trait::async_trait;
use bluechat_core::{
    BluechatError, DiscoveredRecord, FoundDevices, IoSocket, PeerDevice, RadioAdapter, Result,
    ServerSocket, ServiceRecord, Socket, SocketFactory,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex as AsyncMutex};
use tracing::{debug, info};

/// Configuration for [`TcpRadio`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpRadioConfig {
    /// Address the listening endpoint binds to
    pub listen_addr: String,
    /// Known peers, addressed as `host:port`
    pub peers: Vec<PeerDevice>,
}

impl Default for TcpRadioConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:7878".to_string(),
            peers: Vec::new(),
        }
    }
}

impl TcpRadioConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_listen_addr<A: Into<String>>(mut self, addr: A) -> Self {
        self.listen_addr = addr.into();
        self
    }

    pub fn with_peer(mut self, peer: PeerDevice) -> Self {
        self.peers.push(peer);
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.listen_addr
            .parse::<SocketAddr>()
            .map_err(|e| BluechatError::config_error(format!("listen_addr: {}", e)))?;
        if let Some(peer) = self.peers.iter().find(|peer| peer.address.is_empty()) {
            return Err(BluechatError::config_error(format!(
                "peer {} has an empty address",
                peer.display_name()
            )));
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// TCP Radio
// ----------------------------------------------------------------------------

/// Radio and socket factory backed by TCP
pub struct TcpRadio {
    config: TcpRadioConfig,
    bound: Mutex<Option<SocketAddr>>,
    /// Most recent endpoint; the bind lock serializes close-then-bind
    active: AsyncMutex<Weak<TcpServerSocket>>,
}

impl TcpRadio {
    pub fn new(config: TcpRadioConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            bound: Mutex::new(None),
            active: AsyncMutex::new(Weak::new()),
        })
    }

    pub fn config(&self) -> &TcpRadioConfig {
        &self.config
    }

    /// Address of the most recently opened listening endpoint.
    ///
    /// Useful when `listen_addr` asks for an ephemeral port.
    pub fn bound_addr(&self) -> Option<SocketAddr> {
        *self.bound.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl RadioAdapter for TcpRadio {
    async fn is_enabled(&self) -> bool {
        true
    }

    async fn is_authorized(&self) -> bool {
        true
    }

    async fn bonded_devices(&self) -> Result<Vec<PeerDevice>> {
        Ok(self.config.peers.clone())
    }

    async fn start_scan(&self) -> Result<FoundDevices> {
        let records: Vec<DiscoveredRecord> = self
            .config
            .peers
            .iter()
            .filter(|peer| peer.address != self.config.listen_addr)
            .map(|peer| DiscoveredRecord::new(peer.name.clone(), peer.address.clone()))
            .collect();
        debug!("TCP scan reporting {} configured peers", records.len());
        Ok(futures::stream::iter(records).boxed())
    }

    async fn cancel_scan(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl SocketFactory for TcpRadio {
    async fn listen(&self, service: &ServiceRecord) -> Result<Arc<dyn ServerSocket>> {
        let mut active = self.active.lock().await;
        // One endpoint per radio; an abandoned one must not hold the port
        if let Some(previous) = active.upgrade() {
            previous.close();
        }

        let listener = TcpListener::bind(&self.config.listen_addr)
            .await
            .map_err(|e| {
                BluechatError::accept_failed(format!("bind {}: {}", self.config.listen_addr, e))
            })?;
        let local_addr = listener.local_addr()?;
        *self.bound.lock().unwrap_or_else(|e| e.into_inner()) = Some(local_addr);

        info!("Listening for {} on tcp://{}", service, local_addr);
        let (shutdown_tx, _) = watch::channel(false);
        let server = Arc::new(TcpServerSocket {
            listener: Mutex::new(Some(listener)),
            shutdown_tx,
        });
        *active = Arc::downgrade(&server);
        Ok(server)
    }

    async fn connect(&self, address: &str, service: &ServiceRecord) -> Result<Arc<dyn Socket>> {
        debug!("Dialing {} for {}", address, service);
        let stream = TcpStream::connect(address)
            .await
            .map_err(|e| BluechatError::connect_failed(address, e.to_string()))?;
        stream.set_nodelay(true)?;
        Ok(IoSocket::new(stream, address).into_shared())
    }
}

// ----------------------------------------------------------------------------
// Listening Endpoint
// ----------------------------------------------------------------------------

/// Dropping the listener in `close` frees the port immediately
struct TcpServerSocket {
    listener: Mutex<Option<TcpListener>>,
    shutdown_tx: watch::Sender<bool>,
}

impl TcpServerSocket {
    async fn next_stream(&self) -> Result<(TcpStream, SocketAddr)> {
        poll_fn(|cx| {
            let listener = self.listener.lock().unwrap_or_else(|e| e.into_inner());
            match listener.as_ref() {
                Some(listener) => listener.poll_accept(cx).map_err(BluechatError::from),
                None => Poll::Ready(Err(BluechatError::SocketClosed)),
            }
        })
        .await
    }
}

#[async_trait]
impl ServerSocket for TcpServerSocket {
    async fn accept(&self) -> Result<Arc<dyn Socket>> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        if *shutdown_rx.borrow_and_update() {
            return Err(BluechatError::SocketClosed);
        }

        tokio::select! {
            _ = async {
                let _ = shutdown_rx.wait_for(|closed| *closed).await;
            } => Err(BluechatError::SocketClosed),
            accepted = self.next_stream() => {
                let (stream, peer) = accepted?;
                stream.set_nodelay(true)?;
                Ok(IoSocket::new(stream, peer.to_string()).into_shared())
            }
        }
    }

    fn close(&self) {
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if !self.shutdown_tx.send_replace(true) {
            debug!("Closed TCP listening endpoint");
        }
        drop(listener);
    }
}
