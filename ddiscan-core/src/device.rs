//! Sensor devices and the provider that finds, authorises and opens them.

use core::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::link::{LinkSettings, SerialLink};

/// Opaque device identifier (a port name such as `/dev/ttyUSB0` or `COM3`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        DeviceId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        DeviceId(s.to_string())
    }
}

/// Whether the user allowed us to open a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionStatus {
    #[default]
    Unknown,
    Requested,
    Granted,
    Denied,
}

/// A discovered sensor candidate.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub id: DeviceId,
    pub permission: PermissionStatus,
    /// Human readable description (USB product string etc.)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Device {
    pub fn new(id: impl Into<DeviceId>) -> Self {
        Device {
            id: id.into(),
            permission: PermissionStatus::Unknown,
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.description {
            Some(d) => write!(f, "{} ({})", self.id, d),
            None => write!(f, "{}", self.id),
        }
    }
}

/// Why a device could not be opened.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OpenError {
    /// No driver claims the device (it no longer enumerates)
    #[error("No driver for device {0}")]
    DriverAbsent(DeviceId),

    /// The OS would not hand out a handle (busy, gone, not permitted)
    #[error("Device {0} is unavailable")]
    DeviceUnavailable(DeviceId),

    /// Opening the port failed
    #[error("Cannot open {device}: {reason}")]
    PortOpen { device: DeviceId, reason: String },

    /// The port opened but rejected the line parameters
    #[error("Cannot set {settings} on {device}: {reason}")]
    SetParameters {
        device: DeviceId,
        settings: String,
        reason: String,
    },
}

/// Platform-specific device access used by the connection manager.
///
/// Every call is synchronous. Asynchronous answers (a permission prompt the
/// user answers later, a device being unplugged) come back as
/// [`ConnectionEvent`](crate::connection::ConnectionEvent)s, not through
/// this trait.
pub trait DeviceProvider {
    type Link: SerialLink + 'static;

    /// Candidate devices, most preferred first.
    fn discover(&mut self) -> Vec<Device>;

    fn has_permission(&self, device: &Device) -> bool;

    /// Ask the user (or policy) for access. The answer arrives later as a
    /// `PermissionResult` event.
    fn request_permission(&mut self, device: &Device);

    /// Open the device and apply `settings`.
    fn open(&mut self, device: &Device, settings: &LinkSettings) -> Result<Self::Link, OpenError>;
}
