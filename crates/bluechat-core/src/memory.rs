//! In-memory radio medium
//!
//! A [`MemoryAir`] is a shared medium on which any number of
//! [`MemoryRadio`] nodes live. Each radio implements both capability traits:
//! scanning reports the other nodes on the same air, listening registers a
//! service under the radio's address, and dialing pairs the caller with the
//! listener through a `tokio::io::duplex` pipe.
//!
//! Radios also keep an activity journal so tests can assert on ordering,
//! e.g. that a scan was cancelled before an outbound connect began.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use futures::channel::mpsc as futures_mpsc;
use futures::StreamExt;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::debug;
use uuid::Uuid;

use crate::capability::{FoundDevices, IoSocket, RadioAdapter, ServerSocket, Socket, SocketFactory};
use crate::errors::{BluechatError, Result};
use crate::lock_unpoisoned;
use crate::types::{DiscoveredRecord, PeerDevice, ServiceRecord};

const DUPLEX_CAPACITY: usize = 8 * 1024;

type ListenerKey = (String, Uuid);

struct Registration {
    id: u64,
    sender: mpsc::UnboundedSender<Arc<dyn Socket>>,
}

#[derive(Default)]
struct AirState {
    nodes: Vec<(String, String)>,
    listeners: HashMap<ListenerKey, Registration>,
}

// ----------------------------------------------------------------------------
// Shared Medium
// ----------------------------------------------------------------------------

/// Medium shared by in-memory radios
#[derive(Clone, Default)]
pub struct MemoryAir {
    state: Arc<StdMutex<AirState>>,
    next_listener_id: Arc<AtomicU64>,
}

impl MemoryAir {
    pub fn new() -> Self {
        Self::default()
    }

    /// Place a new radio on the air. The radio starts enabled and authorized.
    pub fn radio<A: Into<String>, N: Into<String>>(&self, address: A, name: N) -> Arc<MemoryRadio> {
        let address = address.into();
        let name = name.into();
        lock_unpoisoned(&self.state)
            .nodes
            .push((address.clone(), name.clone()));

        Arc::new(MemoryRadio {
            air: self.clone(),
            address,
            name,
            enabled: AtomicBool::new(true),
            authorized: AtomicBool::new(true),
            bonded: StdMutex::new(Vec::new()),
            scan_sink: StdMutex::new(None),
            activity: StdMutex::new(Vec::new()),
        })
    }

    fn visible_from(&self, address: &str) -> Vec<DiscoveredRecord> {
        lock_unpoisoned(&self.state)
            .nodes
            .iter()
            .filter(|(node, _)| node != address)
            .map(|(node, name)| DiscoveredRecord::new(Some(name.clone()), node.clone()))
            .collect()
    }
}

/// Something a [`MemoryRadio`] was asked to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioActivity {
    ScanStarted,
    ScanCancelled,
    Listen,
    Connect { address: String, while_scanning: bool },
}

// ----------------------------------------------------------------------------
// Memory Radio
// ----------------------------------------------------------------------------

/// One node on a [`MemoryAir`]
pub struct MemoryRadio {
    air: MemoryAir,
    address: String,
    name: String,
    enabled: AtomicBool,
    authorized: AtomicBool,
    bonded: StdMutex<Vec<PeerDevice>>,
    scan_sink: StdMutex<Option<futures_mpsc::UnboundedSender<DiscoveredRecord>>>,
    activity: StdMutex<Vec<RadioActivity>>,
}

impl MemoryRadio {
    pub fn address(&self) -> &str {
        &self.address
    }

    /// This radio as a peer seen from elsewhere
    pub fn as_peer(&self) -> PeerDevice {
        PeerDevice::named(self.name.clone(), self.address.clone())
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn set_authorized(&self, authorized: bool) {
        self.authorized.store(authorized, Ordering::SeqCst);
    }

    pub fn set_bonded(&self, devices: Vec<PeerDevice>) {
        *lock_unpoisoned(&self.bonded) = devices;
    }

    /// Deliver a found-device notification to the active scan, if any
    pub fn announce(&self, record: DiscoveredRecord) -> bool {
        match lock_unpoisoned(&self.scan_sink).as_ref() {
            Some(sink) => sink.unbounded_send(record).is_ok(),
            None => false,
        }
    }

    pub fn is_scanning(&self) -> bool {
        lock_unpoisoned(&self.scan_sink)
            .as_ref()
            .is_some_and(|sink| !sink.is_closed())
    }

    /// Journal of requests made to this radio, oldest first
    pub fn activity(&self) -> Vec<RadioActivity> {
        lock_unpoisoned(&self.activity).clone()
    }

    fn record(&self, activity: RadioActivity) {
        lock_unpoisoned(&self.activity).push(activity);
    }

    fn ensure_enabled(&self) -> Result<()> {
        if self.enabled.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BluechatError::AdapterUnavailable)
        }
    }
}

#[async_trait]
impl RadioAdapter for MemoryRadio {
    async fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    async fn is_authorized(&self) -> bool {
        self.authorized.load(Ordering::SeqCst)
    }

    async fn bonded_devices(&self) -> Result<Vec<PeerDevice>> {
        self.ensure_enabled()?;
        Ok(lock_unpoisoned(&self.bonded).clone())
    }

    async fn start_scan(&self) -> Result<FoundDevices> {
        self.ensure_enabled()?;

        let (sink, found) = futures_mpsc::unbounded();
        for record in self.air.visible_from(&self.address) {
            let _ = sink.unbounded_send(record);
        }
        *lock_unpoisoned(&self.scan_sink) = Some(sink);
        self.record(RadioActivity::ScanStarted);
        Ok(found.boxed())
    }

    async fn cancel_scan(&self) -> Result<()> {
        if lock_unpoisoned(&self.scan_sink).take().is_some() {
            self.record(RadioActivity::ScanCancelled);
        }
        Ok(())
    }
}

#[async_trait]
impl SocketFactory for MemoryRadio {
    async fn listen(&self, service: &ServiceRecord) -> Result<Arc<dyn ServerSocket>> {
        self.ensure_enabled()?;
        self.record(RadioActivity::Listen);

        let key = (self.address.clone(), service.uuid);
        let id = self.air.next_listener_id.fetch_add(1, Ordering::SeqCst);
        let (sender, incoming) = mpsc::unbounded_channel();

        {
            let mut state = lock_unpoisoned(&self.air.state);
            if state
                .listeners
                .get(&key)
                .is_some_and(|existing| !existing.sender.is_closed())
            {
                return Err(BluechatError::accept_failed(format!(
                    "{} already registered on {}",
                    service, self.address
                )));
            }
            state.listeners.insert(key.clone(), Registration { id, sender });
        }

        debug!("{} listening for {}", self.address, service);
        let (shutdown_tx, _) = watch::channel(false);
        Ok(Arc::new(MemoryServerSocket {
            air: self.air.clone(),
            key,
            id,
            incoming: Mutex::new(incoming),
            shutdown_tx,
        }))
    }

    async fn connect(&self, address: &str, service: &ServiceRecord) -> Result<Arc<dyn Socket>> {
        self.record(RadioActivity::Connect {
            address: address.to_string(),
            while_scanning: self.is_scanning(),
        });
        self.ensure_enabled()?;

        let listener = {
            let state = lock_unpoisoned(&self.air.state);
            state
                .listeners
                .get(&(address.to_string(), service.uuid))
                .map(|registration| registration.sender.clone())
        };
        let listener = listener
            .ok_or_else(|| BluechatError::connect_failed(address, "service not found"))?;

        let (local, remote) = tokio::io::duplex(DUPLEX_CAPACITY);
        let inbound = IoSocket::new(remote, self.address.clone()).into_shared();
        listener
            .send(inbound)
            .map_err(|_| BluechatError::connect_failed(address, "listener closed"))?;

        Ok(IoSocket::new(local, address).into_shared())
    }
}

// ----------------------------------------------------------------------------
// Listening Endpoint
// ----------------------------------------------------------------------------

struct MemoryServerSocket {
    air: MemoryAir,
    key: ListenerKey,
    id: u64,
    incoming: Mutex<mpsc::UnboundedReceiver<Arc<dyn Socket>>>,
    shutdown_tx: watch::Sender<bool>,
}

#[async_trait]
impl ServerSocket for MemoryServerSocket {
    async fn accept(&self) -> Result<Arc<dyn Socket>> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        if *shutdown_rx.borrow_and_update() {
            return Err(BluechatError::SocketClosed);
        }

        tokio::select! {
            _ = async {
                let _ = shutdown_rx.wait_for(|closed| *closed).await;
            } => Err(BluechatError::SocketClosed),
            socket = async { self.incoming.lock().await.recv().await } => {
                socket.ok_or_else(|| BluechatError::accept_failed("listener unregistered"))
            }
        }
    }

    fn close(&self) {
        if self.shutdown_tx.send_replace(true) {
            return;
        }
        let mut state = lock_unpoisoned(&self.air.state);
        if state
            .listeners
            .get(&self.key)
            .is_some_and(|registration| registration.id == self.id)
        {
            state.listeners.remove(&self.key);
        }
    }
}

impl Drop for MemoryServerSocket {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dial_pairs_with_listener() {
        let air = MemoryAir::new();
        let server = air.radio("AA", "server");
        let client = air.radio("BB", "client");
        let service = ServiceRecord::default();

        let listener = server.listen(&service).await.unwrap();
        let outbound = client.connect("AA", &service).await.unwrap();
        let inbound = listener.accept().await.unwrap();

        outbound.write(b"hi").await.unwrap();
        let mut buf = [0u8; 8];
        let n = inbound.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hi");
        assert_eq!(inbound.peer_address(), "BB");
    }

    #[tokio::test]
    async fn test_dial_without_listener_fails() {
        let air = MemoryAir::new();
        let client = air.radio("BB", "client");
        let result = client.connect("AA", &ServiceRecord::default()).await;
        assert!(matches!(result, Err(BluechatError::ConnectFailed { .. })));
    }

    #[tokio::test]
    async fn test_closed_listener_unregisters() {
        let air = MemoryAir::new();
        let server = air.radio("AA", "server");
        let client = air.radio("BB", "client");
        let service = ServiceRecord::default();

        let listener = server.listen(&service).await.unwrap();
        listener.close();
        assert!(listener.accept().await.is_err());
        assert!(client.connect("AA", &service).await.is_err());

        // The service can be registered again once the old endpoint is gone
        assert!(server.listen(&service).await.is_ok());
    }

    #[tokio::test]
    async fn test_scan_reports_other_nodes() {
        let air = MemoryAir::new();
        let radio = air.radio("AA", "me");
        air.radio("BB", "you");

        let mut found = radio.start_scan().await.unwrap();
        let record = found.next().await.unwrap();
        assert_eq!(record.address, "BB");
        assert!(radio.is_scanning());

        radio.cancel_scan().await.unwrap();
        assert!(found.next().await.is_none());
        assert!(!radio.is_scanning());
    }
}
