//! Serial port backend: enumeration, opening and reading via [`serialport`].

use ddiscan_core::link::Parity;
use ddiscan_core::{
    Device, DeviceId, DeviceProvider, LinkError, LinkSettings, OpenError, SerialLink,
};
use serialport::{
    DataBits, FlowControl, SerialPort, SerialPortInfo, SerialPortType, StopBits, UsbPortInfo,
};
use std::io::{self, Read};
use std::time::Duration;

use crate::permission::PermissionStore;

/// Which ports count as sensor candidates.
#[derive(Debug, Clone, Default)]
pub struct PortFilter {
    /// Also offer non-USB ports (built-in UARTs, Bluetooth, PCI)
    pub all_ports: bool,
    /// Only this port, whatever its type
    pub device: Option<String>,
}

impl PortFilter {
    fn admits(&self, info: &SerialPortInfo) -> bool {
        match &self.device {
            Some(name) => info.port_name == *name,
            None => self.all_ports || matches!(info.port_type, SerialPortType::UsbPort(_)),
        }
    }
}

/// Candidate devices, sorted by port name.
pub fn enumerate(filter: &PortFilter) -> Result<Vec<Device>, serialport::Error> {
    let ports = serialport::available_ports()?;
    Ok(candidates(ports, filter))
}

fn candidates(ports: Vec<SerialPortInfo>, filter: &PortFilter) -> Vec<Device> {
    let mut devices: Vec<Device> = ports
        .into_iter()
        .filter(|info| filter.admits(info))
        .map(|info| {
            let device = Device::new(info.port_name.as_str());
            match &info.port_type {
                SerialPortType::UsbPort(usb) => device.with_description(describe_usb(usb)),
                _ => device,
            }
        })
        .collect();
    devices.sort_by(|a, b| a.id.cmp(&b.id));
    devices
}

fn describe_usb(usb: &UsbPortInfo) -> String {
    let ids = format!("{:04x}:{:04x}", usb.vid, usb.pid);
    match (&usb.manufacturer, &usb.product) {
        (_, Some(product)) => format!("{} {}", ids, product),
        (Some(manufacturer), None) => format!("{} {}", ids, manufacturer),
        (None, None) => ids,
    }
}

// =============================================================================
// Device Provider
// =============================================================================

pub struct SerialPortProvider {
    filter: PortFilter,
    permissions: PermissionStore,
}

impl SerialPortProvider {
    pub fn new(filter: PortFilter, permissions: PermissionStore) -> Self {
        SerialPortProvider {
            filter,
            permissions,
        }
    }
}

impl DeviceProvider for SerialPortProvider {
    type Link = SerialPortLink;

    fn discover(&mut self) -> Vec<Device> {
        match enumerate(&self.filter) {
            Ok(devices) => devices
                .into_iter()
                .map(|d| self.permissions.annotate(d))
                .collect(),
            Err(e) => {
                log::warn!("Cannot enumerate serial ports: {}", e);
                Vec::new()
            }
        }
    }

    fn has_permission(&self, device: &Device) -> bool {
        self.permissions.is_granted(&device.id)
    }

    fn request_permission(&mut self, device: &Device) {
        self.permissions.request(device);
    }

    fn open(&mut self, device: &Device, settings: &LinkSettings) -> Result<SerialPortLink, OpenError> {
        // The port may have vanished since discovery
        match serialport::available_ports() {
            Ok(ports) if !ports.iter().any(|p| p.port_name == device.id.as_str()) => {
                return Err(OpenError::DriverAbsent(device.id.clone()));
            }
            Ok(_) => {}
            Err(e) => log::debug!("Cannot re-probe ports before open: {}", e),
        }
        SerialPortLink::open(&device.id, settings)
    }
}

// =============================================================================
// Serial Link
// =============================================================================

pub struct SerialPortLink {
    device: DeviceId,
    port: Option<Box<dyn SerialPort>>,
}

impl SerialPortLink {
    pub fn open(device: &DeviceId, settings: &LinkSettings) -> Result<Self, OpenError> {
        let set_parameters = |reason: String| OpenError::SetParameters {
            device: device.clone(),
            settings: settings.to_string(),
            reason,
        };
        let data_bits = data_bits(settings.data_bits)
            .ok_or_else(|| set_parameters(format!("{} data bits", settings.data_bits)))?;
        let stop_bits = stop_bits(settings.stop_bits)
            .ok_or_else(|| set_parameters(format!("{} stop bits", settings.stop_bits)))?;

        let port = serialport::new(device.as_str(), settings.baud_rate)
            .data_bits(data_bits)
            .parity(parity(settings.parity))
            .stop_bits(stop_bits)
            .flow_control(FlowControl::None)
            .timeout(settings.read_timeout)
            .open()
            .map_err(|e| map_open_error(device, settings, e))?;

        log::info!("Opened serial port: {} at {}", device, settings);

        Ok(SerialPortLink {
            device: device.clone(),
            port: Some(port),
        })
    }
}

impl SerialLink for SerialPortLink {
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, LinkError> {
        let Some(port) = self.port.as_mut() else {
            return Err(LinkError::Usage(format!("{} is closed", self.device)));
        };
        if buf.is_empty() {
            return Err(LinkError::Usage("empty read buffer".to_string()));
        }
        if port.timeout() != timeout {
            port.set_timeout(timeout)
                .map_err(|e| LinkError::Usage(e.to_string()))?;
        }
        match port.read(buf) {
            Ok(n) => Ok(n),
            Err(e) => map_read_error(e),
        }
    }

    fn close(&mut self) -> Result<(), LinkError> {
        // Dropping the handle closes the port
        if self.port.take().is_some() {
            log::debug!("Closed serial port {}", self.device);
        }
        Ok(())
    }
}

fn data_bits(bits: u8) -> Option<DataBits> {
    match bits {
        5 => Some(DataBits::Five),
        6 => Some(DataBits::Six),
        7 => Some(DataBits::Seven),
        8 => Some(DataBits::Eight),
        _ => None,
    }
}

fn stop_bits(bits: u8) -> Option<StopBits> {
    match bits {
        1 => Some(StopBits::One),
        2 => Some(StopBits::Two),
        _ => None,
    }
}

fn parity(parity: Parity) -> serialport::Parity {
    match parity {
        Parity::None => serialport::Parity::None,
        Parity::Odd => serialport::Parity::Odd,
        Parity::Even => serialport::Parity::Even,
    }
}

fn map_open_error(device: &DeviceId, settings: &LinkSettings, e: serialport::Error) -> OpenError {
    match e.kind {
        serialport::ErrorKind::NoDevice => OpenError::DeviceUnavailable(device.clone()),
        serialport::ErrorKind::InvalidInput => OpenError::SetParameters {
            device: device.clone(),
            settings: settings.to_string(),
            reason: e.description,
        },
        _ => OpenError::PortOpen {
            device: device.clone(),
            reason: e.to_string(),
        },
    }
}

/// Timeouts are empty reads; a vanished device is `Detached`.
fn map_read_error(e: io::Error) -> Result<usize, LinkError> {
    match e.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => Ok(0),
        io::ErrorKind::BrokenPipe
        | io::ErrorKind::NotConnected
        | io::ErrorKind::UnexpectedEof
        | io::ErrorKind::PermissionDenied => Err(LinkError::Detached),
        _ => Err(LinkError::Io(e.to_string())),
    }
}
