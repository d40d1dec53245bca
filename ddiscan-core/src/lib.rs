//! # DDiscan Core
//!
//! Platform-independent ingest and connection logic for a serial ultrasonic
//! ranging sensor.
//!
//! This crate contains pure parsing and state logic with **zero I/O dependencies**.
//! The sensor streams `amplitude,tof` text records over a serial link; this
//! crate turns those bytes into batches of plottable points, and decides
//! when a link is opened, kept or dropped.
//!
//! ## Architecture
//!
//! All platform-specific I/O is abstracted through the [`DeviceProvider`] and
//! [`SerialLink`] traits, so the same logic runs against a real port, an
//! emulator or a scripted test double.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  ddiscan-core (platform-independent, no tokio/async deps)    │
//! │  ├── protocol    (line reassembly & record parsing)          │
//! │  ├── range       (time of flight → distance, axis bounds)    │
//! │  ├── batch       (points & 300-point batches)                │
//! │  ├── pipeline    (chunk → batches, with counters)            │
//! │  ├── connection  (state machine)                             │
//! │  └── link/device (abstract serial I/O)                       │
//! └──────────────────────────────────────────────────────────────┘
//!                              ▲
//!                 ┌────────────┴────────────┐
//!                 │  ddiscan                │
//!                 │  (serialport, tokio,    │
//!                 │   axum)                 │
//!                 └─────────────────────────┘
//! ```
//!
//! ## Key Modules
//!
//! - [`protocol`] - Line reassembly and `amplitude,tof` parsing
//! - [`range`] - Time of flight to distance conversion, display range
//! - [`batch`] - Points and immutable batches
//! - [`pipeline`] - The complete byte-to-batch ingest path
//! - [`connection`] - Connection state machine
//! - [`link`] - Platform-agnostic serial link trait ([`SerialLink`])
//! - [`device`] - Device discovery, permission and opening ([`DeviceProvider`])
//!
//! ## Example: Ingesting Raw Bytes
//!
//! ```rust
//! use ddiscan_core::Pipeline;
//!
//! let mut pipeline = Pipeline::new();
//! let mut batches = Vec::new();
//!
//! // A record split across two reads
//! pipeline.ingest(b"12.5,20", |b| batches.push(b));
//! pipeline.ingest(b"00\n", |b| batches.push(b));
//!
//! assert_eq!(pipeline.stats().records, 1);
//! assert_eq!(pipeline.pending_points(), 2);
//! assert!(batches.is_empty());
//! ```
//!
//! ## Example: Using Connection State Machine
//!
//! ```rust
//! use ddiscan_core::{ConnectionManager, ConnectionState, ConnectionStatus};
//!
//! let mut conn = ConnectionManager::new();
//! assert_eq!(conn.state(), ConnectionState::Disconnected);
//! assert_eq!(conn.status().text(), "Disconnected");
//!
//! // Disconnecting twice is fine
//! assert!(!conn.disconnect());
//! assert!(!conn.disconnect());
//! ```

pub mod batch;
pub mod connection;
pub mod device;
pub mod error;
pub mod link;
pub mod pipeline;
pub mod protocol;
pub mod range;

// Re-export commonly used types
pub use batch::{Batch, Batcher, Point, BATCH_SIZE};
pub use connection::{
    Action, ConnectionEvent, ConnectionManager, ConnectionSnapshot, ConnectionState,
    ConnectionStatus, ReaderStart,
};
pub use device::{Device, DeviceId, DeviceProvider, OpenError, PermissionStatus};
pub use error::ParseError;
pub use link::{LinkError, LinkLease, LinkSettings, SerialLink, READ_BUFFER_SIZE, READ_TIMEOUT};
pub use pipeline::{IngestReport, Pipeline, PipelineStats};
pub use protocol::{parse_record, LineAssembler, Record};
pub use range::{tof_to_distance_mm, RangeConfig};
