//! Bluetooth Classic backend using bluer (BlueZ)
//!
//! Scanning uses BlueZ device discovery; the bonded set is every known device
//! BlueZ reports as paired. Transports are RFCOMM streams obtained through
//! profile registration: a server-role profile for listening, a client-role
//! profile plus `connect_profile` for dialing.

use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use bluechat_core::{
    BluechatError, DiscoveredRecord, FoundDevices, IoSocket, PeerDevice, RadioAdapter, Result,
    ServerSocket, ServiceRecord, Socket, SocketFactory,
};
use bluer::rfcomm::{Profile, ProfileHandle, ReqError, Role};
use bluer::{Adapter, AdapterEvent, Address, ErrorKind, Session};
use futures::StreamExt;
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

fn map_bluer_error(error: bluer::Error) -> BluechatError {
    match error.kind {
        ErrorKind::NotAuthorized => BluechatError::PermissionDenied,
        ErrorKind::NotReady => BluechatError::AdapterUnavailable,
        _ => BluechatError::transport(error.to_string()),
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

// ----------------------------------------------------------------------------
// BlueZ Radio
// ----------------------------------------------------------------------------

/// Default BlueZ adapter as radio and RFCOMM socket factory
pub struct BluezRadio {
    session: Session,
    adapter: Adapter,
    scan: StdMutex<Option<AbortHandle>>,
    // Client profile backing the most recent outbound stream
    client_profile: Mutex<Option<ProfileHandle>>,
}

impl BluezRadio {
    /// Connect to bluetoothd and pick the default adapter
    pub async fn new() -> Result<Arc<Self>> {
        let session = Session::new()
            .await
            .map_err(|e| BluechatError::transport(format!("BlueZ session: {}", e)))?;
        let adapter = session.default_adapter().await.map_err(|e| {
            warn!("No default Bluetooth adapter: {}", e);
            BluechatError::AdapterUnavailable
        })?;

        info!("Using Bluetooth adapter {}", adapter.name());
        Ok(Arc::new(Self {
            session,
            adapter,
            scan: StdMutex::new(None),
            client_profile: Mutex::new(None),
        }))
    }

    fn profile_for(service: &ServiceRecord, role: Role) -> Profile {
        Profile {
            uuid: service.uuid,
            name: Some(service.name.clone()),
            role: Some(role),
            require_authentication: Some(false),
            require_authorization: Some(false),
            auto_connect: Some(false),
            ..Default::default()
        }
    }
}

async fn describe(adapter: &Adapter, address: Address) -> DiscoveredRecord {
    let mut record = DiscoveredRecord::new(None, address.to_string());
    if let Ok(device) = adapter.device(address) {
        record.name = device.name().await.ok().flatten();
        record.rssi = device.rssi().await.ok().flatten();
    }
    record
}

#[async_trait]
impl RadioAdapter for BluezRadio {
    async fn is_enabled(&self) -> bool {
        self.adapter.is_powered().await.unwrap_or(false)
    }

    async fn is_authorized(&self) -> bool {
        !matches!(
            self.adapter.address().await,
            Err(e) if e.kind == ErrorKind::NotAuthorized
        )
    }

    async fn bonded_devices(&self) -> Result<Vec<PeerDevice>> {
        let addresses = self
            .adapter
            .device_addresses()
            .await
            .map_err(map_bluer_error)?;

        let mut bonded = Vec::new();
        for address in addresses {
            let device = self.adapter.device(address).map_err(map_bluer_error)?;
            if device.is_paired().await.unwrap_or(false) {
                let name = device.name().await.ok().flatten();
                bonded.push(PeerDevice::new(name, address.to_string()));
            }
        }
        Ok(bonded)
    }

    async fn start_scan(&self) -> Result<FoundDevices> {
        let adapter = self.adapter.clone();
        let (sink, found) = futures::channel::mpsc::unbounded();
        let (ready_tx, ready_rx) = oneshot::channel();

        // The discovery session lives as long as this task
        let task = tokio::spawn(async move {
            let events = match adapter.discover_devices().await {
                Ok(events) => {
                    let _ = ready_tx.send(Ok(()));
                    events
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            tokio::pin!(events);

            while let Some(event) = events.next().await {
                if let AdapterEvent::DeviceAdded(address) = event {
                    let record = describe(&adapter, address).await;
                    if sink.unbounded_send(record).is_err() {
                        break;
                    }
                }
            }
            debug!("BlueZ discovery event stream ended");
        });

        match ready_rx.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(map_bluer_error(e)),
            Err(_) => return Err(BluechatError::transport("discovery task ended early")),
        }

        if let Some(previous) = lock(&self.scan).replace(task.abort_handle()) {
            previous.abort();
        }
        Ok(found.boxed())
    }

    async fn cancel_scan(&self) -> Result<()> {
        if let Some(scan) = lock(&self.scan).take() {
            scan.abort();
            debug!("BlueZ discovery cancelled");
        }
        Ok(())
    }
}

#[async_trait]
impl SocketFactory for BluezRadio {
    async fn listen(&self, service: &ServiceRecord) -> Result<Arc<dyn ServerSocket>> {
        // Only one registration per service UUID is allowed
        self.client_profile.lock().await.take();

        let handle = self
            .session
            .register_profile(Self::profile_for(service, Role::Server))
            .await
            .map_err(|e| BluechatError::accept_failed(format!("register {}: {}", service, e)))?;

        info!("Registered RFCOMM server profile for {}", service);
        let (shutdown_tx, _) = watch::channel(false);
        Ok(Arc::new(BluezServerSocket {
            profile: Mutex::new(Some(handle)),
            shutdown_tx,
        }))
    }

    async fn connect(&self, address: &str, service: &ServiceRecord) -> Result<Arc<dyn Socket>> {
        let target: Address = address
            .parse()
            .map_err(|e| BluechatError::connect_failed(address, format!("invalid address: {}", e)))?;

        let mut client_profile = self.client_profile.lock().await;
        client_profile.take();
        let mut handle = self
            .session
            .register_profile(Self::profile_for(service, Role::Client))
            .await
            .map_err(|e| BluechatError::connect_failed(address, e.to_string()))?;

        let device = self
            .adapter
            .device(target)
            .map_err(|e| BluechatError::connect_failed(address, e.to_string()))?;
        let uuid = service.uuid;
        let connecting = async {
            if !device.is_connected().await.unwrap_or(false) {
                device.connect().await?;
            }
            device.connect_profile(&uuid).await
        };
        tokio::pin!(connecting);

        let mut profile_connected = false;
        let stream = loop {
            tokio::select! {
                result = &mut connecting, if !profile_connected => {
                    profile_connected = true;
                    if let Err(e) = result {
                        return Err(BluechatError::connect_failed(address, e.to_string()));
                    }
                }
                request = handle.next() => {
                    let Some(request) = request else {
                        return Err(BluechatError::connect_failed(address, "profile unregistered"));
                    };
                    if request.device() != target {
                        debug!("Rejecting RFCOMM request from {}", request.device());
                        request.reject(ReqError::Rejected);
                        continue;
                    }
                    break request
                        .accept()
                        .map_err(|e| BluechatError::connect_failed(address, e.to_string()))?;
                }
            }
        };

        *client_profile = Some(handle);
        info!("RFCOMM stream open to {}", address);
        Ok(IoSocket::new(stream, address).into_shared())
    }
}

// ----------------------------------------------------------------------------
// Listening Endpoint
// ----------------------------------------------------------------------------

struct BluezServerSocket {
    profile: Mutex<Option<ProfileHandle>>,
    shutdown_tx: watch::Sender<bool>,
}

#[async_trait]
impl ServerSocket for BluezServerSocket {
    async fn accept(&self) -> Result<Arc<dyn Socket>> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        if *shutdown_rx.borrow_and_update() {
            return Err(BluechatError::SocketClosed);
        }

        let mut profile = self.profile.lock().await;
        let Some(handle) = profile.as_mut() else {
            return Err(BluechatError::SocketClosed);
        };

        let request = tokio::select! {
            _ = async {
                let _ = shutdown_rx.wait_for(|closed| *closed).await;
            } => Err(BluechatError::SocketClosed),
            request = handle.next() => {
                request.ok_or_else(|| BluechatError::accept_failed("profile unregistered"))
            }
        };

        let request = match request {
            Ok(request) => request,
            Err(e) => {
                // Dropping the handle unregisters the profile
                profile.take();
                return Err(e);
            }
        };

        let peer = request.device().to_string();
        let stream = request
            .accept()
            .map_err(|e| BluechatError::accept_failed(format!("{}: {}", peer, e)))?;
        Ok(IoSocket::new(stream, peer).into_shared())
    }

    fn close(&self) {
        self.shutdown_tx.send_replace(true);
        if let Ok(mut profile) = self.profile.try_lock() {
            profile.take();
        }
    }
}
