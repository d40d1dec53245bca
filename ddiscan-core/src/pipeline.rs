//! The ingest pipeline: raw chunk → lines → records → points → batches.

use serde::Serialize;

use crate::batch::{Batch, Batcher, Point};
use crate::protocol::{parse_record, LineAssembler};

/// Counters for what one [`Pipeline`] has processed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStats {
    pub bytes: u64,
    pub lines: u64,
    pub records: u64,
    pub malformed: u64,
    pub batches: u64,
}

/// What a single [`Pipeline::ingest`] call did, for callers that keep
/// their own totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub lines: u64,
    pub records: u64,
    pub malformed: u64,
    pub batches: u64,
}

/// Owns all mutable ingest state for one connection.
///
/// Not shared: the reader that owns it is the only writer, and what leaves
/// it is an immutable [`Batch`].
#[derive(Debug, Default)]
pub struct Pipeline {
    assembler: LineAssembler,
    batcher: Batcher,
    stats: PipelineStats,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push one raw chunk through the pipeline, calling `emit` for every
    /// batch that fills up. Malformed lines are dropped silently.
    pub fn ingest<F>(&mut self, chunk: &[u8], mut emit: F) -> IngestReport
    where
        F: FnMut(Batch),
    {
        let mut report = IngestReport::default();

        for line in self.assembler.feed(chunk) {
            report.lines += 1;
            match parse_record(&line) {
                Ok(record) => {
                    report.records += 1;
                    let (baseline, signal) = Point::pair_from_record(&record);
                    self.batcher.push(baseline, signal);
                    if let Some(batch) = self.batcher.drain_if_ready() {
                        report.batches += 1;
                        emit(batch);
                    }
                }
                Err(_) => {
                    report.malformed += 1;
                }
            }
        }

        self.stats.bytes += chunk.len() as u64;
        self.stats.lines += report.lines;
        self.stats.records += report.records;
        self.stats.malformed += report.malformed;
        self.stats.batches += report.batches;
        report
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats
    }

    /// Points waiting for the next batch
    pub fn pending_points(&self) -> usize {
        self.batcher.pending_len()
    }

    /// Bytes of an incomplete trailing line
    pub fn pending_bytes(&self) -> usize {
        self.assembler.pending_len()
    }
}
