//! Serial link abstraction for platform-independent ingest code.
//!
//! The reader loop only needs two operations from an open connection: a
//! read that gives up after a timeout, and a close. Everything else about a
//! port (enumeration, permission, opening) lives behind
//! [`DeviceProvider`](crate::device::DeviceProvider).
//!
//! # Design
//!
//! Reads are **blocking with a bounded timeout**, not async: the reader runs
//! on its own thread and a timeout is reported as a zero-length read, not an
//! error. Errors are split by who can fix them:
//!
//! - link faults ([`LinkError::Io`], [`LinkError::Detached`]): the wire or the
//!   device went away; the connection is over.
//! - usage errors ([`LinkError::Usage`]): the caller asked for something the
//!   link cannot do; the connection itself is still fine.

use core::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

// =============================================================================
// Link Parameters
// =============================================================================

/// Sensor baud rate
pub const BAUD_RATE: u32 = 115_200;

/// How long one read may block before it returns zero bytes
pub const READ_TIMEOUT: Duration = Duration::from_millis(200);

/// Size of the reader's fixed read buffer
pub const READ_BUFFER_SIZE: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
    None,
    Odd,
    Even,
}

impl fmt::Display for Parity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Parity::None => write!(f, "N"),
            Parity::Odd => write!(f, "O"),
            Parity::Even => write!(f, "E"),
        }
    }
}

/// Line parameters applied when a port is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkSettings {
    pub baud_rate: u32,
    pub data_bits: u8,
    pub stop_bits: u8,
    pub parity: Parity,
    pub read_timeout: Duration,
}

impl Default for LinkSettings {
    fn default() -> Self {
        LinkSettings {
            baud_rate: BAUD_RATE,
            data_bits: 8,
            stop_bits: 1,
            parity: Parity::None,
            read_timeout: READ_TIMEOUT,
        }
    }
}

impl fmt::Display for LinkSettings {
    // Conventional "115200 8N1" notation
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}{}{}",
            self.baud_rate, self.data_bits, self.parity, self.stop_bits
        )
    }
}

// =============================================================================
// Error Types
// =============================================================================

/// Error returned by [`SerialLink`] operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    /// I/O failure on the wire
    #[error("Link I/O error: {0}")]
    Io(String),

    /// The device is no longer there
    #[error("Device detached")]
    Detached,

    /// The operation was invalid for this link; the link is still usable
    #[error("Invalid link operation: {0}")]
    Usage(String),
}

impl LinkError {
    /// True for errors that end the connection.
    pub fn is_link_fault(&self) -> bool {
        matches!(self, LinkError::Io(_) | LinkError::Detached)
    }
}

// =============================================================================
// SerialLink Trait
// =============================================================================

/// An open connection to a sensor.
///
/// Implementations exist for:
/// - **serialport**: a real UART/USB-serial device
/// - **emulator**: a simulated sensor
/// - test doubles that replay scripted chunks
pub trait SerialLink: Send {
    /// Read whatever is available into `buf`, waiting at most `timeout`.
    ///
    /// Returns `Ok(0)` when the timeout expires without data.
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, LinkError>;

    /// Release the underlying device. Calling it twice is harmless.
    fn close(&mut self) -> Result<(), LinkError>;
}

impl<L: SerialLink + ?Sized> SerialLink for Box<L> {
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, LinkError> {
        (**self).read(buf, timeout)
    }

    fn close(&mut self) -> Result<(), LinkError> {
        (**self).close()
    }
}

// =============================================================================
// Link Lease
// =============================================================================

/// The connection manager's hold on a link it lent to a reader.
///
/// The reader checks [`LinkLease::is_present`] once per iteration and stops
/// when the manager has revoked it. Each lease carries the generation of the
/// connection it belongs to, so reports from a reader that outlived its
/// connection can be recognised as stale.
#[derive(Debug, Clone)]
pub struct LinkLease {
    present: Arc<AtomicBool>,
    generation: u64,
}

impl LinkLease {
    pub fn new(generation: u64) -> Self {
        LinkLease {
            present: Arc::new(AtomicBool::new(true)),
            generation,
        }
    }

    pub fn is_present(&self) -> bool {
        self.present.load(Ordering::Acquire)
    }

    /// Empty the slot. Every clone observes it on its next check.
    pub fn revoke(&self) {
        self.present.store(false, Ordering::Release);
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

// =============================================================================
// Tests
// =============================================================================
