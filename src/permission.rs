//! Which devices the user allowed us to open.
//!
//! A desktop has no system permission prompt for serial ports, so the
//! request/answer round trip is kept here: a request marks the device
//! pending, and an answer arrives either through the HTTP API or, with
//! `--grant-all`, immediately. Granted devices are persisted.

use ddiscan_core::{ConnectionEvent, Device, DeviceId, PermissionStatus};
use log::{error, info, warn};
use std::collections::BTreeSet;
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;

use crate::config::Persistence;

#[derive(Debug, Default)]
struct PermissionInner {
    granted: BTreeSet<DeviceId>,
    denied: BTreeSet<DeviceId>,
    pending: BTreeSet<DeviceId>,
}

#[derive(Debug, Clone)]
pub struct PermissionStore {
    inner: Arc<RwLock<PermissionInner>>,
    persistence: Arc<Persistence>,
    grant_all: bool,
    tx_events: mpsc::Sender<ConnectionEvent>,
}

impl PermissionStore {
    pub fn new(
        persistence: Arc<Persistence>,
        grant_all: bool,
        tx_events: mpsc::Sender<ConnectionEvent>,
    ) -> Self {
        let granted = persistence.settings().granted_devices.into_iter().collect();
        PermissionStore {
            inner: Arc::new(RwLock::new(PermissionInner {
                granted,
                ..Default::default()
            })),
            persistence,
            grant_all,
            tx_events,
        }
    }

    pub fn is_granted(&self, device: &DeviceId) -> bool {
        self.inner.read().unwrap().granted.contains(device)
    }

    pub fn status(&self, device: &DeviceId) -> PermissionStatus {
        let inner = self.inner.read().unwrap();
        if inner.granted.contains(device) {
            PermissionStatus::Granted
        } else if inner.pending.contains(device) {
            PermissionStatus::Requested
        } else if inner.denied.contains(device) {
            PermissionStatus::Denied
        } else {
            PermissionStatus::Unknown
        }
    }

    /// Fill in the permission status of a discovered device
    pub fn annotate(&self, mut device: Device) -> Device {
        device.permission = self.status(&device.id);
        device
    }

    /// Mark `device` as waiting for an answer.
    ///
    /// In grant-all mode the answer is given on the spot and posted to the
    /// connection manager as a `PermissionResult`.
    pub fn request(&self, device: &Device) {
        self.inner
            .write()
            .unwrap()
            .pending
            .insert(device.id.clone());

        if self.grant_all {
            info!("Auto-granting permission for {}", device);
            self.answer(&device.id, true);
            let event = ConnectionEvent::PermissionResult {
                device: device.id.clone(),
                granted: true,
            };
            // Runs on the connection task itself, so waiting for room would deadlock
            if let Err(e) = self.tx_events.try_send(event) {
                warn!("Cannot post permission result for {}: {}", device, e);
            }
        } else {
            info!(
                "Permission requested for {}; answer with PUT /v1/api/devices/{{device_id}}/permission",
                device
            );
        }
    }

    /// Record the user's answer. Returns whether a request was pending.
    pub fn answer(&self, device: &DeviceId, granted: bool) -> bool {
        let (was_pending, granted_list) = {
            let mut inner = self.inner.write().unwrap();
            let was_pending = inner.pending.remove(device);
            if granted {
                inner.denied.remove(device);
                inner.granted.insert(device.clone());
            } else {
                inner.granted.remove(device);
                inner.denied.insert(device.clone());
            }
            (was_pending, inner.granted.iter().cloned().collect::<Vec<_>>())
        };

        info!(
            "Permission for {} {}",
            device,
            if granted { "granted" } else { "denied" }
        );
        if let Err(e) = self
            .persistence
            .update(|settings| settings.granted_devices = granted_list)
        {
            error!("Failed to persist permissions: {}", e);
        }
        was_pending
    }
}
