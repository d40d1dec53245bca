//! The blocking reader worker.
//!
//! One dedicated thread per connection. It owns the link and the whole ingest
//! pipeline, so nothing on the hot path is shared except the counters.

use ddiscan_core::{
    Batch, ConnectionEvent, DeviceId, IngestReport, LinkError, LinkLease, Pipeline, ReaderStart,
    SerialLink, READ_BUFFER_SIZE, READ_TIMEOUT,
};
use log::{debug, error, info, trace, warn};
use serde::Serialize;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tokio::sync::mpsc;

/// Where finished batches go.
pub trait BatchSink: Send {
    fn post(&mut self, batch: Batch);
}

impl<F> BatchSink for F
where
    F: FnMut(Batch) + Send,
{
    fn post(&mut self, batch: Batch) {
        self(batch)
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Ingest counters, written by the reader and read by the API.
#[derive(Debug, Default)]
pub struct IngestStats {
    bytes: AtomicU64,
    lines: AtomicU64,
    records: AtomicU64,
    malformed: AtomicU64,
    batches: AtomicU64,
    dropped: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub bytes: u64,
    pub lines: u64,
    pub records: u64,
    pub malformed: u64,
    pub batches: u64,
    pub dropped: u64,
}

impl IngestStats {
    pub fn record(&self, bytes: usize, report: &IngestReport) {
        self.bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        self.lines.fetch_add(report.lines, Ordering::Relaxed);
        self.records.fetch_add(report.records, Ordering::Relaxed);
        self.malformed.fetch_add(report.malformed, Ordering::Relaxed);
        self.batches.fetch_add(report.batches, Ordering::Relaxed);
    }

    /// A batch was produced but the renderer had no room for it
    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            bytes: self.bytes.load(Ordering::Relaxed),
            lines: self.lines.load(Ordering::Relaxed),
            records: self.records.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// Stream Reader
// =============================================================================

pub struct StreamReader<L, S> {
    device: DeviceId,
    link: L,
    lease: LinkLease,
    sink: S,
    stats: Arc<IngestStats>,
    pipeline: Pipeline,
}

impl<L, S> StreamReader<L, S>
where
    L: SerialLink,
    S: BatchSink,
{
    pub fn new(start: ReaderStart<L>, sink: S, stats: Arc<IngestStats>) -> Self {
        StreamReader {
            device: start.device.id,
            link: start.link,
            lease: start.lease,
            sink,
            stats,
            pipeline: Pipeline::new(),
        }
    }

    /// Read until the lease is revoked or the link fails.
    ///
    /// Returns the link fault that ended the loop, `None` when it was
    /// cancelled. The link is closed either way.
    pub fn run(mut self) -> Option<LinkError> {
        let mut buf = [0u8; READ_BUFFER_SIZE];
        info!("Reader for {} started", self.device);

        let fault = loop {
            if !self.lease.is_present() {
                break None;
            }

            match self.link.read(&mut buf, READ_TIMEOUT) {
                Ok(0) => {}
                Ok(n) => {
                    let sink = &mut self.sink;
                    let report = self.pipeline.ingest(&buf[..n], |batch| sink.post(batch));
                    self.stats.record(n, &report);
                    if report.malformed > 0 {
                        trace!(
                            "{}: dropped {} malformed line(s)",
                            self.device,
                            report.malformed
                        );
                    }
                }
                Err(e) if e.is_link_fault() => {
                    warn!("{}: {}", self.device, e);
                    break Some(e);
                }
                Err(e) => {
                    error!("{}: {}", self.device, e);
                    thread::sleep(READ_TIMEOUT);
                }
            }
        };

        if let Err(e) = self.link.close() {
            debug!("{}: close failed: {}", self.device, e);
        }
        info!(
            "Reader for {} exiting ({} records, {} batches)",
            self.device,
            self.pipeline.stats().records,
            self.pipeline.stats().batches
        );
        fault
    }
}

impl<L, S> StreamReader<L, S>
where
    L: SerialLink + 'static,
    S: BatchSink + 'static,
{
    /// Run on a dedicated thread; a fault is reported back as a `ReadFault`
    /// tagged with this reader's connection generation.
    pub fn spawn(self, tx_events: mpsc::Sender<ConnectionEvent>) -> io::Result<JoinHandle<()>> {
        let generation = self.lease.generation();
        thread::Builder::new()
            .name(format!("reader-{}", generation))
            .spawn(move || {
                if let Some(error) = self.run() {
                    let event = ConnectionEvent::ReadFault { generation, error };
                    if tx_events.blocking_send(event).is_err() {
                        debug!("Connection task gone, fault not reported");
                    }
                }
            })
    }
}
