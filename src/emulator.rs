//! A simulated ranging sensor.
//!
//! Produces the same `amplitude,tof` text a real sensor writes, delivered the
//! way a serial driver delivers it: paced to the line rate and cut into
//! irregular chunks that ignore record boundaries. Every so often a line is
//! garbled.

use ddiscan_core::{
    Device, DeviceId, DeviceProvider, LinkError, LinkSettings, OpenError, SerialLink,
};
use std::time::Duration;

use crate::permission::PermissionStore;

pub const EMULATOR_DEVICE: &str = "emulator:0";

/// Records per sweep of the echo train
const RECORDS_PER_SWEEP: u32 = 150;

/// Time of flight range of one sweep, in microseconds
const TOF_START_US: f32 = 200.0;
const TOF_END_US: f32 = 17_000.0;

/// One in this many lines is garbled
const MALFORMED_EVERY: u32 = 97;

/// Reflectors as (time of flight in µs, peak amplitude)
const REFLECTORS: [(f32, f32); 3] = [(2_900.0, 610.0), (7_400.0, 380.0), (12_800.0, 190.0)];

/// Pause between chunks
const CHUNK_INTERVAL: Duration = Duration::from_millis(20);

pub fn list_devices() -> Vec<Device> {
    vec![Device::new(EMULATOR_DEVICE).with_description("Simulated ranging sensor")]
}

pub struct EmulatorProvider {
    permissions: PermissionStore,
}

impl EmulatorProvider {
    pub fn new(permissions: PermissionStore) -> Self {
        EmulatorProvider { permissions }
    }
}

impl DeviceProvider for EmulatorProvider {
    type Link = EmulatorLink;

    fn discover(&mut self) -> Vec<Device> {
        list_devices()
            .into_iter()
            .map(|d| self.permissions.annotate(d))
            .collect()
    }

    fn has_permission(&self, device: &Device) -> bool {
        self.permissions.is_granted(&device.id)
    }

    fn request_permission(&mut self, device: &Device) {
        self.permissions.request(device);
    }

    fn open(&mut self, device: &Device, settings: &LinkSettings) -> Result<EmulatorLink, OpenError> {
        if device.id.as_str() != EMULATOR_DEVICE {
            return Err(OpenError::DriverAbsent(device.id.clone()));
        }
        log::info!("Opened emulated sensor {} at {}", device.id, settings);
        Ok(EmulatorLink::new(device.id.clone(), settings.baud_rate))
    }
}

/// xorshift32; good enough for noise and chunk sizes
#[derive(Debug)]
struct Noise(u32);

impl Noise {
    fn next(&mut self) -> u32 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.0 = x;
        x
    }

    /// Uniform in `0.0..1.0`
    fn unit(&mut self) -> f32 {
        (self.next() >> 8) as f32 / (1u32 << 24) as f32
    }

    /// Uniform in `1..=max`
    fn size(&mut self, max: usize) -> usize {
        1 + (self.next() as usize % max.max(1))
    }
}

#[derive(Debug)]
pub struct EmulatorLink {
    device: DeviceId,
    /// Generated but not yet delivered bytes
    pending: Vec<u8>,
    /// Bytes the line can carry per chunk interval
    chunk_budget: usize,
    line: u32,
    noise: Noise,
    closed: bool,
}

impl EmulatorLink {
    pub fn new(device: DeviceId, baud_rate: u32) -> Self {
        // 10 bits per byte on an 8N1 line
        let bytes_per_sec = (baud_rate / 10) as usize;
        let chunk_budget = (bytes_per_sec * CHUNK_INTERVAL.as_millis() as usize / 1000).max(1);
        EmulatorLink {
            device,
            pending: Vec::new(),
            chunk_budget,
            line: 0,
            noise: Noise(0x9e37_79b9),
            closed: false,
        }
    }

    fn next_line(&mut self) -> String {
        let step = self.line % RECORDS_PER_SWEEP;
        self.line = self.line.wrapping_add(1);

        if self.line % MALFORMED_EVERY == 0 {
            return "ERR;sync lost\n".to_string();
        }

        let tof = TOF_START_US
            + (TOF_END_US - TOF_START_US) * step as f32 / (RECORDS_PER_SWEEP - 1) as f32;
        let echo: f32 = REFLECTORS
            .iter()
            .map(|&(at, peak)| {
                let width = 250.0 + at * 0.04;
                peak * (-((tof - at) / width).powi(2)).exp()
            })
            .sum();
        let amplitude = echo + 8.0 + 12.0 * self.noise.unit();
        format!("{:.1},{:.0}\n", amplitude, tof)
    }
}

impl SerialLink for EmulatorLink {
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, LinkError> {
        if self.closed {
            return Err(LinkError::Usage(format!("{} is closed", self.device)));
        }
        if buf.is_empty() {
            return Err(LinkError::Usage("empty read buffer".to_string()));
        }

        std::thread::sleep(CHUNK_INTERVAL.min(timeout));
        while self.pending.len() < self.chunk_budget {
            let line = self.next_line();
            self.pending.extend_from_slice(line.as_bytes());
        }

        let n = self.noise.size(self.chunk_budget.min(buf.len()));
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(n)
    }

    fn close(&mut self) -> Result<(), LinkError> {
        self.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ddiscan_core::{parse_record, Pipeline};

    fn link() -> EmulatorLink {
        EmulatorLink::new(DeviceId::new(EMULATOR_DEVICE), 115_200)
    }

    #[test]
    fn test_lines_parse_except_the_garbled_ones() {
        let mut link = link();
        let mut malformed = 0;
        for _ in 0..MALFORMED_EVERY * 2 {
            let line = link.next_line();
            if parse_record(line.trim()).is_err() {
                malformed += 1;
            }
        }
        assert_eq!(malformed, 2);
    }

    #[test]
    fn test_chunks_are_irregular_and_bounded() {
        let mut link = link();
        let mut buf = [0u8; 1024];
        let mut sizes = Vec::new();
        for _ in 0..5 {
            let n = link.read(&mut buf, Duration::from_millis(1)).unwrap();
            assert!(n >= 1 && n <= link.chunk_budget);
            sizes.push(n);
        }
        sizes.dedup();
        assert!(sizes.len() > 1);
    }

    #[test]
    fn test_feeds_the_pipeline() {
        let mut link = link();
        let mut pipeline = Pipeline::new();
        let mut buf = [0u8; 1024];
        let mut batches = 0;
        while batches == 0 {
            let n = link.read(&mut buf, Duration::from_millis(1)).unwrap();
            pipeline.ingest(&buf[..n], |_| batches += 1);
        }
        assert!(pipeline.stats().records >= 150);
        assert!(pipeline.stats().malformed >= 1);
    }

    #[test]
    fn test_read_after_close_is_a_usage_error() {
        let mut link = link();
        link.close().unwrap();
        let mut buf = [0u8; 16];
        assert!(matches!(
            link.read(&mut buf, Duration::from_millis(1)),
            Err(LinkError::Usage(_))
        ));
    }
}
