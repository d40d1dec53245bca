//! Consumer side of the batch hand-off.
//!
//! Readers post batches into a bounded queue through a [`ChannelSink`]; the
//! [`Renderer`] task takes them out in order and publishes them as
//! [`StreamFrame`]s. When the renderer falls behind the newest batch is
//! dropped and counted rather than blocking the reader.

use ddiscan_core::{Batch, ConnectionSnapshot, RangeConfig};
use log::{debug, trace, warn};
use serde::Serialize;
use std::io::Write;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_graceful_shutdown::SubsystemHandle;

use crate::reader::{BatchSink, IngestStats};
use crate::{SensorError, Session};

/// Everything sent to stream clients, one JSON object per message.
///
/// ```json
/// {"type":"batch","seq":12,"points":[[171.5,0.0],[171.5,12.5]]}
/// {"type":"status","connection":{"state":"connected",...}}
/// {"type":"range","range":{"xMax":3000.0,"yMax":700.0}}
/// ```
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum StreamFrame {
    Batch { seq: u64, points: Batch },
    Status { connection: ConnectionSnapshot },
    Range { range: RangeConfig },
}

/// Producer half, owned by a reader thread.
pub struct ChannelSink {
    tx: mpsc::Sender<Batch>,
    stats: Arc<IngestStats>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<Batch>, stats: Arc<IngestStats>) -> Self {
        ChannelSink { tx, stats }
    }
}

impl BatchSink for ChannelSink {
    fn post(&mut self, batch: Batch) {
        match self.tx.try_send(batch) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.stats.record_dropped();
                warn!("Renderer is behind, dropping batch");
            }
            Err(TrySendError::Closed(_)) => {
                debug!("Renderer gone, batch discarded");
            }
        }
    }
}

pub struct Renderer {
    session: Session,
    rx_batches: mpsc::Receiver<Batch>,
    output: bool,
    seq: u64,
}

impl Renderer {
    pub fn new(session: Session, rx_batches: mpsc::Receiver<Batch>, output: bool) -> Self {
        Renderer {
            session,
            rx_batches,
            output,
            seq: 0,
        }
    }

    pub async fn run(mut self, subsys: SubsystemHandle) -> Result<(), SensorError> {
        loop {
            tokio::select! { biased;
                _ = subsys.on_shutdown_requested() => {
                    return Ok(());
                },
                r = self.rx_batches.recv() => {
                    match r {
                        Some(batch) => self.render(batch)?,
                        None => return Ok(()),
                    }
                },
            }
        }
    }

    /// Publish one batch. Batches are rendered strictly in arrival order.
    fn render(&mut self, batch: Batch) -> Result<(), SensorError> {
        self.seq += 1;
        let frame = StreamFrame::Batch {
            seq: self.seq,
            points: batch,
        };

        if self.output {
            forward_output(&frame)?;
        }
        trace!("Rendering batch {}", self.seq);
        self.session.publish(frame);
        Ok(())
    }
}

fn forward_output(frame: &StreamFrame) -> Result<(), SensorError> {
    let mut stdout = std::io::stdout().lock();
    serde_json::to_writer(&mut stdout, frame).map_err(std::io::Error::from)?;
    stdout.write_all(b"\n")?;
    Ok(())
}
