//! Hot-plug detection.
//!
//! Serial ports have no attach/detach notification that works everywhere,
//! so the port list is polled. A port that was listed on the previous poll
//! and is missing now is reported as a `DeviceDetached` event; the
//! connection manager decides whether that concerns it. Listing ports is a
//! blocking call and runs on the blocking pool.

use ddiscan_core::{ConnectionEvent, Device, DeviceId};
use log::{debug, info, warn};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_graceful_shutdown::SubsystemHandle;

use crate::{SensorError, Session};

/// How often the port list is refreshed
pub const POLL_INTERVAL: Duration = Duration::from_millis(500);

pub struct DeviceMonitor<F> {
    session: Session,
    lister: Arc<F>,
    known: BTreeSet<DeviceId>,
}

impl<F> DeviceMonitor<F>
where
    F: Fn() -> Result<Vec<Device>, SensorError> + Send + Sync + 'static,
{
    pub fn new(session: Session, lister: F) -> Self {
        DeviceMonitor {
            session,
            lister: Arc::new(lister),
            known: BTreeSet::new(),
        }
    }

    pub async fn run(mut self, subsys: SubsystemHandle) -> Result<(), SensorError> {
        let mut poll_timer = interval(POLL_INTERVAL);
        poll_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = subsys.on_shutdown_requested() => {
                    debug!("Device monitor: shutdown requested");
                    break;
                }
                _ = poll_timer.tick() => {
                    for event in self.poll().await? {
                        self.session.post(event).await?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Refresh the device list, returning a detach event per vanished port.
    async fn poll(&mut self) -> Result<Vec<ConnectionEvent>, SensorError> {
        let lister = self.lister.clone();
        let listing = tokio::task::spawn_blocking(move || (*lister)()).await?;
        Ok(self.update(listing))
    }

    fn update(&mut self, listing: Result<Vec<Device>, SensorError>) -> Vec<ConnectionEvent> {
        let devices = match listing {
            Ok(devices) => devices,
            Err(e) => {
                // Keep the previous view; one failed listing is not a detach
                warn!("{}", e);
                return Vec::new();
            }
        };

        let current: BTreeSet<DeviceId> = devices.iter().map(|d| d.id.clone()).collect();
        for added in current.difference(&self.known) {
            info!("Device attached: {}", added);
        }
        let events = self
            .known
            .difference(&current)
            .map(|removed| {
                info!("Device detached: {}", removed);
                ConnectionEvent::DeviceDetached(removed.clone())
            })
            .collect();

        self.known = current;
        self.session.set_devices(devices);
        events
    }
}
