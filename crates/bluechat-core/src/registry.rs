//! Device registry
//!
//! Holds two insertion-ordered lists of peers: devices seen during the current
//! scan window and devices bonded with the local radio. Observers subscribe to
//! whole snapshots, never deltas, so a renderer can redraw from whatever it
//! last received.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;
use tracing::debug;

use crate::types::PeerDevice;

/// Current registry contents
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RegistrySnapshot {
    /// Discovery-sourced devices, each address at most once
    pub scanned: Vec<PeerDevice>,
    /// Bonded devices as last reported by the radio
    pub paired: Vec<PeerDevice>,
}

impl RegistrySnapshot {
    pub fn is_empty(&self) -> bool {
        self.scanned.is_empty() && self.paired.is_empty()
    }

    /// Look a device up by address in either list
    pub fn find(&self, address: &str) -> Option<&PeerDevice> {
        self.paired
            .iter()
            .chain(self.scanned.iter())
            .find(|device| device.address == address)
    }
}

/// Shared, cloneable device registry
#[derive(Debug, Clone)]
pub struct DeviceRegistry {
    snapshot_tx: Arc<watch::Sender<RegistrySnapshot>>,
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceRegistry {
    pub fn new() -> Self {
        let (snapshot_tx, _) = watch::channel(RegistrySnapshot::default());
        Self {
            snapshot_tx: Arc::new(snapshot_tx),
        }
    }

    /// Insert a scanned device unless its address is already present.
    ///
    /// Returns whether the device was new.
    pub fn record_discovered(&self, device: PeerDevice) -> bool {
        self.snapshot_tx.send_if_modified(|snapshot| {
            if snapshot.scanned.contains(&device) {
                return false;
            }
            debug!("Discovered device {}", device);
            snapshot.scanned.push(device);
            true
        })
    }

    /// Replace the bonded set wholesale.
    ///
    /// Observers are only woken when the set actually changed; an identical
    /// list leaves the current snapshot in place.
    pub fn refresh_paired(&self, bonded: Vec<PeerDevice>) {
        self.snapshot_tx.send_if_modified(|snapshot| {
            if same_devices(&snapshot.paired, &bonded) {
                return false;
            }
            snapshot.paired = bonded;
            true
        });
    }

    /// Forget every scanned device
    pub fn clear_scanned(&self) {
        self.snapshot_tx.send_if_modified(|snapshot| {
            if snapshot.scanned.is_empty() {
                return false;
            }
            snapshot.scanned.clear();
            true
        });
    }

    /// Forget everything
    pub fn clear(&self) {
        self.snapshot_tx.send_if_modified(|snapshot| {
            if snapshot.is_empty() {
                return false;
            }
            *snapshot = RegistrySnapshot::default();
            true
        });
    }

    /// Copy of the current contents
    pub fn snapshot(&self) -> RegistrySnapshot {
        self.snapshot_tx.borrow().clone()
    }

    /// Observe every change as a full snapshot
    pub fn subscribe(&self) -> watch::Receiver<RegistrySnapshot> {
        self.snapshot_tx.subscribe()
    }
}

// Device equality ignores names, but a renamed bond is still a change worth
// publishing.
fn same_devices(current: &[PeerDevice], next: &[PeerDevice]) -> bool {
    current.len() == next.len()
        && current
            .iter()
            .zip(next)
            .all(|(a, b)| a.address == b.address && a.name == b.name)
}
