//! Discovery controller
//!
//! Drives the `Idle -> Scanning -> Idle` lifecycle of the local radio and
//! feeds found-device notifications into the [`DeviceRegistry`]. The
//! notification stream returned by the radio is the registration: it is
//! consumed by a listener task owned here and dropped on `stop_discovery`.

use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::capability::{FoundDevices, RadioAdapter};
use crate::config::EngineConfig;
use crate::errors::{BluechatError, Result};
use crate::registry::DeviceRegistry;
use crate::types::PeerDevice;

// ----------------------------------------------------------------------------
// Discovery State
// ----------------------------------------------------------------------------

/// Observable discovery phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryPhase {
    Idle,
    Scanning,
}

enum ScanState {
    Idle,
    Scanning { listener: JoinHandle<()> },
}

struct DiscoveryInner {
    radio: Arc<dyn RadioAdapter>,
    registry: DeviceRegistry,
    config: EngineConfig,
    state: Mutex<ScanState>,
}

// ----------------------------------------------------------------------------
// Discovery Controller
// ----------------------------------------------------------------------------

/// Starts and stops scans and keeps the registry current
#[derive(Clone)]
pub struct DiscoveryController {
    inner: Arc<DiscoveryInner>,
}

impl DiscoveryController {
    pub fn new(radio: Arc<dyn RadioAdapter>, registry: DeviceRegistry, config: EngineConfig) -> Self {
        Self {
            inner: Arc::new(DiscoveryInner {
                radio,
                registry,
                config,
                state: Mutex::new(ScanState::Idle),
            }),
        }
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.inner.registry
    }

    pub fn radio(&self) -> &Arc<dyn RadioAdapter> {
        &self.inner.radio
    }

    pub async fn phase(&self) -> DiscoveryPhase {
        match *self.inner.state.lock().await {
            ScanState::Idle => DiscoveryPhase::Idle,
            ScanState::Scanning { .. } => DiscoveryPhase::Scanning,
        }
    }

    /// Fail unless the radio is present, powered and authorized
    pub async fn ensure_radio_ready(&self) -> Result<()> {
        if !self.inner.radio.is_enabled().await {
            return Err(BluechatError::AdapterUnavailable);
        }
        if !self.inner.radio.is_authorized().await {
            return Err(BluechatError::PermissionDenied);
        }
        Ok(())
    }

    /// Open a scan window.
    ///
    /// Refreshes the paired snapshot, clears previously scanned devices and
    /// registers for notifications. Calling this while scanning restarts the
    /// window.
    pub async fn start_discovery(&self) -> Result<()> {
        self.ensure_radio_ready().await?;

        let mut state = self.inner.state.lock().await;
        if let ScanState::Scanning { listener } = std::mem::replace(&mut *state, ScanState::Idle) {
            debug!("Restarting scan window");
            listener.abort();
            if let Err(e) = self.inner.radio.cancel_scan().await {
                debug!("Ignoring cancel failure during restart: {}", e);
            }
        }

        self.refresh_paired_devices().await?;
        self.inner.registry.clear_scanned();

        let found = self.inner.radio.start_scan().await?;
        let listener = self.spawn_listener(found);
        *state = ScanState::Scanning { listener };

        info!("Discovery started");
        Ok(())
    }

    /// Close the scan window. Safe to call when idle.
    pub async fn stop_discovery(&self) {
        let mut state = self.inner.state.lock().await;
        let ScanState::Scanning { listener } = std::mem::replace(&mut *state, ScanState::Idle) else {
            return;
        };

        listener.abort();
        if let Err(e) = self.inner.radio.cancel_scan().await {
            warn!("Failed to cancel scan: {}", e);
        }
        info!("Discovery stopped");
    }

    /// Re-read the bonded set into the registry
    pub async fn refresh_paired_devices(&self) -> Result<()> {
        let bonded = self.inner.radio.bonded_devices().await?;
        debug!("Radio reports {} bonded devices", bonded.len());
        self.inner.registry.refresh_paired(bonded);
        Ok(())
    }

    fn spawn_listener(&self, mut found: FoundDevices) -> JoinHandle<()> {
        let registry = self.inner.registry.clone();
        let radio = self.inner.radio.clone();
        let refresh_interval = self.inner.config.paired_refresh_interval;

        tokio::spawn(async move {
            let mut refresh = refresh_interval.map(|period| {
                let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                interval
            });

            loop {
                tokio::select! {
                    record = found.next() => {
                        let Some(record) = record else {
                            debug!("Radio closed the found-device stream");
                            break;
                        };
                        registry.record_discovered(PeerDevice::from(record));
                    }
                    _ = async {
                        match refresh.as_mut() {
                            Some(interval) => {
                                interval.tick().await;
                            }
                            None => futures::future::pending::<()>().await,
                        }
                    } => {
                        match radio.bonded_devices().await {
                            Ok(bonded) => registry.refresh_paired(bonded),
                            Err(e) => warn!("Periodic paired refresh failed: {}", e),
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryAir, RadioActivity};
    use crate::types::DiscoveredRecord;
    use std::time::Duration;

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn test_start_and_stop_transitions() {
        let air = MemoryAir::new();
        let radio = air.radio("11:11:11:11:11:11", "local");
        let controller = DiscoveryController::new(radio.clone(), DeviceRegistry::new(), EngineConfig::default());

        assert_eq!(controller.phase().await, DiscoveryPhase::Idle);
        controller.start_discovery().await.unwrap();
        assert_eq!(controller.phase().await, DiscoveryPhase::Scanning);
        assert!(radio.is_scanning());

        controller.stop_discovery().await;
        assert_eq!(controller.phase().await, DiscoveryPhase::Idle);
        assert!(!radio.is_scanning());

        // Second stop is a no-op
        controller.stop_discovery().await;
        let cancels = radio
            .activity()
            .iter()
            .filter(|a| matches!(a, RadioActivity::ScanCancelled))
            .count();
        assert_eq!(cancels, 1);
    }

    #[tokio::test]
    async fn test_found_devices_reach_registry() {
        let air = MemoryAir::new();
        let radio = air.radio("11:11:11:11:11:11", "local");
        let _other = air.radio("22:22:22:22:22:22", "other");
        let controller = DiscoveryController::new(radio.clone(), DeviceRegistry::new(), EngineConfig::default());

        controller.start_discovery().await.unwrap();
        radio.announce(DiscoveredRecord::new(Some("other".into()), "22:22:22:22:22:22"));
        radio.announce(DiscoveredRecord::new(None, "33:33:33:33:33:33"));
        settle().await;

        let scanned = controller.registry().snapshot().scanned;
        let addresses: Vec<_> = scanned.iter().map(|d| d.address.as_str()).collect();
        assert_eq!(addresses, vec!["22:22:22:22:22:22", "33:33:33:33:33:33"]);
    }

    #[tokio::test]
    async fn test_restart_clears_scanned_and_refreshes_paired() {
        let air = MemoryAir::new();
        let radio = air.radio("11:11:11:11:11:11", "local");
        let controller = DiscoveryController::new(radio.clone(), DeviceRegistry::new(), EngineConfig::default());

        controller.start_discovery().await.unwrap();
        radio.announce(DiscoveredRecord::new(None, "44:44:44:44:44:44"));
        settle().await;
        assert_eq!(controller.registry().snapshot().scanned.len(), 1);

        radio.set_bonded(vec![PeerDevice::named("bonded", "55:55:55:55:55:55")]);
        controller.start_discovery().await.unwrap();
        let snapshot = controller.registry().snapshot();
        assert!(snapshot.scanned.is_empty());
        assert_eq!(snapshot.paired.len(), 1);
        assert_eq!(controller.phase().await, DiscoveryPhase::Scanning);
    }

    #[tokio::test]
    async fn test_adapter_unavailable_leaves_registry_empty() {
        let air = MemoryAir::new();
        let radio = air.radio("11:11:11:11:11:11", "local");
        radio.set_bonded(vec![PeerDevice::named("bonded", "55:55:55:55:55:55")]);
        radio.set_enabled(false);
        let controller = DiscoveryController::new(radio.clone(), DeviceRegistry::new(), EngineConfig::default());

        let result = controller.start_discovery().await;
        assert!(matches!(result, Err(BluechatError::AdapterUnavailable)));
        assert!(controller.registry().snapshot().is_empty());
        assert_eq!(controller.phase().await, DiscoveryPhase::Idle);
    }

    #[tokio::test]
    async fn test_permission_denied() {
        let air = MemoryAir::new();
        let radio = air.radio("11:11:11:11:11:11", "local");
        radio.set_authorized(false);
        let controller = DiscoveryController::new(radio, DeviceRegistry::new(), EngineConfig::default());

        let result = controller.start_discovery().await;
        assert!(matches!(result, Err(BluechatError::PermissionDenied)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_paired_refresh() {
        let air = MemoryAir::new();
        let radio = air.radio("11:11:11:11:11:11", "local");
        let config = EngineConfig::default().with_paired_refresh_interval(Some(Duration::from_secs(5)));
        let controller = DiscoveryController::new(radio.clone(), DeviceRegistry::new(), config);

        controller.start_discovery().await.unwrap();
        assert!(controller.registry().snapshot().paired.is_empty());

        radio.set_bonded(vec![PeerDevice::named("late bond", "66:66:66:66:66:66")]);
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(controller.registry().snapshot().paired.len(), 1);

        controller.stop_discovery().await;
    }
}
