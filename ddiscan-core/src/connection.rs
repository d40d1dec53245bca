//! Connection state machine for the sensor link.
//!
//! This module provides platform-independent connection lifecycle management.
//! It performs no I/O itself: device access goes through a
//! [`DeviceProvider`], and the reader thread is started by whoever owns the
//! manager when [`handle`](ConnectionManager::handle) returns
//! [`Action::StartReader`].
//!
//! # Architecture
//!
//! ```text
//!   UI requests ─┐
//!   permission  ─┼──► ConnectionEvent queue ──► ConnectionManager::handle
//!   detach      ─┤                                      │
//!   read fault  ─┘                                      ▼
//!                                          Action::Open / Action::StartReader
//! ```
//!
//! All inputs arrive as [`ConnectionEvent`]s and are applied one at a time,
//! so a detach can never interleave with a half-finished open.
//!
//! # Usage
//!
//! ```rust,ignore
//! use ddiscan_core::connection::{Action, ConnectionEvent, ConnectionManager};
//!
//! let mut conn = ConnectionManager::new();
//! let mut next = Some(ConnectionEvent::Discover);
//! while let Some(event) = next.take() {
//!     match conn.handle(event, &mut provider) {
//!         Some(Action::Open(device)) => next = Some(ConnectionEvent::Open(device)),
//!         Some(Action::StartReader(start)) => spawn_reader(start),
//!         None => {}
//!     }
//! }
//! ```

use serde::Serialize;

use crate::device::{Device, DeviceId, DeviceProvider, OpenError, PermissionStatus};
use crate::link::{LinkError, LinkLease, LinkSettings};

// =============================================================================
// Connection State
// =============================================================================

/// Lifecycle state of the (single) sensor connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionState {
    /// No device in use
    Disconnected,
    /// A device was found and we are waiting for the user's permission
    AwaitingPermission,
    /// Permission is settled, the port is about to be opened
    Connecting,
    /// Port open, reader running
    Connected,
    /// A read fault is being unwound; never persists past one event
    Faulted,
}

impl Default for ConnectionState {
    fn default() -> Self {
        ConnectionState::Disconnected
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "Disconnected"),
            ConnectionState::AwaitingPermission => write!(f, "Awaiting Permission"),
            ConnectionState::Connecting => write!(f, "Connecting"),
            ConnectionState::Connected => write!(f, "Connected"),
            ConnectionState::Faulted => write!(f, "Faulted"),
        }
    }
}

/// The user-facing status line.
///
/// Changes only on the transitions that report something; waiting for
/// permission, for example, leaves the previous status in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionStatus {
    Disconnected,
    NoDevice,
    Connected,
    OpenFailed,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        ConnectionStatus::Disconnected
    }
}

impl ConnectionStatus {
    pub fn text(&self) -> &'static str {
        match self {
            ConnectionStatus::Disconnected => "Disconnected",
            ConnectionStatus::NoDevice => "No device",
            ConnectionStatus::Connected => "Connected",
            ConnectionStatus::OpenFailed => "Open failed",
        }
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.text())
    }
}

// =============================================================================
// Events and Actions
// =============================================================================

/// Every input the state machine reacts to.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// User asked to connect
    Discover,
    /// Continue a connection attempt; produced from [`Action::Open`]
    Open(DeviceId),
    /// User asked to disconnect
    Disconnect,
    /// Answer to an earlier permission request
    PermissionResult { device: DeviceId, granted: bool },
    /// A device disappeared
    DeviceDetached(DeviceId),
    /// The reader for connection `generation` hit a link fault
    ReadFault { generation: u64, error: LinkError },
}

/// Everything a new reader needs: the open link, and the lease it must poll.
#[derive(Debug)]
pub struct ReaderStart<L> {
    pub device: Device,
    pub link: L,
    pub lease: LinkLease,
}

/// Work the owner of the manager has to carry out.
#[derive(Debug)]
pub enum Action<L> {
    /// Queue `ConnectionEvent::Open(device)` behind any pending events
    Open(DeviceId),
    /// Run a reader on a dedicated worker
    StartReader(ReaderStart<L>),
}

/// Serializable view of the manager for status reporting.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSnapshot {
    pub state: ConnectionState,
    pub status: ConnectionStatus,
    pub status_text: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<DeviceId>,
    pub generation: u64,
    pub fault_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl Default for ConnectionSnapshot {
    fn default() -> Self {
        ConnectionManager::new().snapshot()
    }
}

// =============================================================================
// Connection Manager
// =============================================================================

/// Owns the connection lifecycle.
///
/// A pure state machine: feed it events with [`handle`](Self::handle) from a
/// single owner and carry out the [`Action`]s it returns.
#[derive(Debug, Clone)]
pub struct ConnectionManager {
    state: ConnectionState,
    status: ConnectionStatus,
    settings: LinkSettings,
    /// Device being authorised, opened or in use
    device: Option<Device>,
    /// Our half of the lease lent to the running reader
    lease: Option<LinkLease>,
    /// Incremented for every successful open
    generation: u64,
    fault_count: u32,
    last_open_error: Option<OpenError>,
    last_fault: Option<LinkError>,
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionManager {
    /// Create a new connection manager in disconnected state.
    pub fn new() -> Self {
        Self::with_settings(LinkSettings::default())
    }

    pub fn with_settings(settings: LinkSettings) -> Self {
        ConnectionManager {
            state: ConnectionState::Disconnected,
            status: ConnectionStatus::Disconnected,
            settings,
            device: None,
            lease: None,
            generation: 0,
            fault_count: 0,
            last_open_error: None,
            last_fault: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn settings(&self) -> &LinkSettings {
        &self.settings
    }

    /// Device currently tracked (awaiting permission, connecting or connected)
    pub fn device(&self) -> Option<&Device> {
        self.device.as_ref()
    }

    /// Generation of the current (or most recent) connection
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Number of read faults seen since creation
    pub fn fault_count(&self) -> u32 {
        self.fault_count
    }

    pub fn last_open_error(&self) -> Option<&OpenError> {
        self.last_open_error.as_ref()
    }

    pub fn last_fault(&self) -> Option<&LinkError> {
        self.last_fault.as_ref()
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        let last_error = match self.status {
            ConnectionStatus::OpenFailed => self.last_open_error.as_ref().map(|e| e.to_string()),
            _ => self.last_fault.as_ref().map(|e| e.to_string()),
        };
        ConnectionSnapshot {
            state: self.state,
            status: self.status,
            status_text: self.status.text(),
            device: self.device.as_ref().map(|d| d.id.clone()),
            generation: self.generation,
            fault_count: self.fault_count,
            last_error,
        }
    }

    // -------------------------------------------------------------------------
    // Event Dispatch
    // -------------------------------------------------------------------------

    /// Apply one event.
    pub fn handle<P: DeviceProvider>(
        &mut self,
        event: ConnectionEvent,
        provider: &mut P,
    ) -> Option<Action<P::Link>> {
        match event {
            ConnectionEvent::Discover => self.discover(provider),
            ConnectionEvent::Open(device) => self.open(&device, provider),
            ConnectionEvent::Disconnect => {
                self.disconnect();
                None
            }
            ConnectionEvent::PermissionResult { device, granted } => {
                self.permission_result(&device, granted, provider)
            }
            ConnectionEvent::DeviceDetached(device) => {
                self.device_detached(&device);
                None
            }
            ConnectionEvent::ReadFault { generation, error } => {
                self.read_fault(generation, error);
                None
            }
        }
    }

    // -------------------------------------------------------------------------
    // State Transitions
    // -------------------------------------------------------------------------

    /// Look for a device and start connecting to the first one found.
    ///
    /// Only acts when disconnected.
    pub fn discover<P: DeviceProvider>(&mut self, provider: &mut P) -> Option<Action<P::Link>> {
        if self.state != ConnectionState::Disconnected {
            return None;
        }

        let Some(mut device) = provider.discover().into_iter().next() else {
            self.status = ConnectionStatus::NoDevice;
            return None;
        };

        if provider.has_permission(&device) {
            device.permission = PermissionStatus::Granted;
            return Some(self.start_connecting(device));
        }

        device.permission = PermissionStatus::Requested;
        provider.request_permission(&device);
        self.device = Some(device);
        self.state = ConnectionState::AwaitingPermission;
        None
    }

    fn permission_result<P: DeviceProvider>(
        &mut self,
        device_id: &DeviceId,
        granted: bool,
        _provider: &mut P,
    ) -> Option<Action<P::Link>> {
        if self.state != ConnectionState::AwaitingPermission || !self.is_tracking(device_id) {
            return None;
        }
        let mut device = self.device.take()?;

        if granted {
            device.permission = PermissionStatus::Granted;
            Some(self.start_connecting(device))
        } else {
            self.state = ConnectionState::Disconnected;
            self.status = ConnectionStatus::Disconnected;
            None
        }
    }

    fn start_connecting<L>(&mut self, device: Device) -> Action<L> {
        let id = device.id.clone();
        self.device = Some(device);
        self.state = ConnectionState::Connecting;
        Action::Open(id)
    }

    /// Second half of connecting: actually open the port.
    ///
    /// Ignored unless we are still connecting to that same device, which is
    /// what makes a detach or disconnect queued in between win.
    fn open<P: DeviceProvider>(
        &mut self,
        device_id: &DeviceId,
        provider: &mut P,
    ) -> Option<Action<P::Link>> {
        if self.state != ConnectionState::Connecting || !self.is_tracking(device_id) {
            return None;
        }
        let device = self.device.clone()?;

        match provider.open(&device, &self.settings) {
            Ok(link) => {
                self.generation += 1;
                let lease = LinkLease::new(self.generation);
                self.lease = Some(lease.clone());
                self.last_open_error = None;
                self.last_fault = None;
                self.state = ConnectionState::Connected;
                self.status = ConnectionStatus::Connected;
                Some(Action::StartReader(ReaderStart {
                    device,
                    link,
                    lease,
                }))
            }
            Err(e) => {
                self.last_open_error = Some(e);
                self.device = None;
                self.state = ConnectionState::Disconnected;
                self.status = ConnectionStatus::OpenFailed;
                None
            }
        }
    }

    /// Drop whatever we are doing and go back to disconnected.
    ///
    /// Returns false (and changes nothing) when already disconnected.
    pub fn disconnect(&mut self) -> bool {
        if self.state == ConnectionState::Disconnected {
            return false;
        }
        self.release();
        true
    }

    /// Detach of the tracked device wins over every state.
    ///
    /// Detaches naming any other device are ignored on purpose: unplugging an
    /// unrelated port must not drop the sensor.
    fn device_detached(&mut self, device_id: &DeviceId) -> bool {
        if self.state == ConnectionState::Disconnected || !self.is_tracking(device_id) {
            return false;
        }
        self.release();
        true
    }

    fn read_fault(&mut self, generation: u64, error: LinkError) -> bool {
        let current = self
            .lease
            .as_ref()
            .is_some_and(|lease| lease.generation() == generation);
        if self.state != ConnectionState::Connected || !current {
            // Fault from a reader whose connection is already gone
            return false;
        }
        self.state = ConnectionState::Faulted;
        self.fault_count = self.fault_count.saturating_add(1);
        self.last_fault = Some(error);
        self.release();
        true
    }

    fn release(&mut self) {
        if let Some(lease) = self.lease.take() {
            lease.revoke();
        }
        self.device = None;
        self.state = ConnectionState::Disconnected;
        self.status = ConnectionStatus::Disconnected;
    }

    fn is_tracking(&self, device_id: &DeviceId) -> bool {
        self.device.as_ref().is_some_and(|d| &d.id == device_id)
    }
}

// =============================================================================
// Tests
// =============================================================================
