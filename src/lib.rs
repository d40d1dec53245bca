//! # DDiscan
//!
//! Ultrasonic ranging sensor reader with REST API and WebSocket support.
//!
//! This crate provides the runtime around [`ddiscan_core`]:
//! - Finds the sensor among the serial ports and asks for permission to use it
//! - Reads the sensor on a dedicated thread and turns its output into batches
//! - Hands each batch to a renderer that streams it to WebSocket clients
//! - Exposes connection control and display range through a REST API
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         ddiscan                              │
//! │  ┌─────────────┐  ┌─────────────┐  ┌──────────────────────┐  │
//! │  │ REST API    │  │ WebSocket   │  │ Monitor (hot-plug)   │  │
//! │  │ (axum)      │  │ (frames)    │  │                      │  │
//! │  └──────┬──────┘  └──────▲──────┘  └──────────┬───────────┘  │
//! │         │ ConnectionEvent│ StreamFrame        │              │
//! │         ▼                │                    ▼              │
//! │  ┌─────────────────┐  ┌──┴──────────┐                        │
//! │  │ Connection task │  │ Renderer    │◄── Batch (bounded) ──┐ │
//! │  │ (state machine) │  └─────────────┘                      │ │
//! │  └──────┬──────────┘                                       │ │
//! │         │ spawns                                           │ │
//! │         ▼                                                  │ │
//! │  ┌─────────────────────────────────────────────────────┐   │ │
//! │  │ StreamReader thread: link → lines → records → batch ├───┘ │
//! │  └─────────────────────────────────────────────────────┘     │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Key Components
//!
//! - [`Session`] - Main application state container
//! - [`connection::ConnectionActor`] - Owns the connection state machine
//! - [`reader::StreamReader`] - Blocking reader worker
//! - [`render::Renderer`] - Consumer side of the batch hand-off
//! - [`serial::SerialPortProvider`] - Real serial ports
//! - [`monitor::DeviceMonitor`] - Hot-plug detection
//! - [`web::Web`] - REST API and WebSocket server
//!
//! ## REST API
//!
//! | Endpoint | Description |
//! |----------|-------------|
//! | `GET /v1/api/status` | Connection state and ingest counters |
//! | `POST /v1/api/connect` | Find a sensor and connect |
//! | `POST /v1/api/disconnect` | Drop the connection |
//! | `GET /v1/api/devices` | Candidate devices |
//! | `PUT /v1/api/devices/{device_id}/permission` | Answer a permission request |
//! | `GET/PUT /v1/api/range` | Display range |
//! | `WS /v1/api/stream` | Batch, status and range frames |
//!
//! ## Command-Line Interface
//!
//! See [`Cli`] for all available options. Key options:
//!
//! - `-p, --port` - HTTP server port (default: 6503)
//! - `-v` - Increase verbosity (use multiple times)
//! - `--connect` - Connect to the first sensor found at startup
//! - `--grant-all` - Do not wait for permission answers
//! - `--emulator` - Use a simulated sensor

extern crate tokio;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use clap::Parser;
use ddiscan_core::{Batch, ConnectionEvent, ConnectionSnapshot, Device, RangeConfig};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio_graceful_shutdown::{SubsystemBuilder, SubsystemHandle};

pub mod config;
pub mod connection;
#[cfg(feature = "emulator")]
pub mod emulator;
pub mod monitor;
pub mod permission;
pub mod reader;
pub mod render;
pub mod serial;
pub mod web;

use config::{ConfigError, Persistence};
use connection::ConnectionActor;
use monitor::DeviceMonitor;
use permission::PermissionStore;
use reader::IngestStats;
use render::{Renderer, StreamFrame};
use serial::{PortFilter, SerialPortProvider};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Capacity of the connection event queue
const EVENT_QUEUE_DEPTH: usize = 32;

/// Capacity of the frame broadcast to WebSocket clients
const FRAME_BROADCAST_DEPTH: usize = 64;

#[derive(Parser, Clone, Debug)]
#[command(version, about)]
pub struct Cli {
    #[clap(flatten)]
    pub verbose: clap_verbosity_flag::Verbosity<clap_verbosity_flag::InfoLevel>,

    /// Port for webserver
    #[arg(short, long, default_value_t = 6503)]
    pub port: u16,

    /// Only consider this serial port (e.g. /dev/ttyUSB0 or COM3)
    #[arg(short, long)]
    pub device: Option<String>,

    /// Also consider serial ports that are not USB
    #[arg(long, default_value_t = false)]
    pub all_ports: bool,

    /// Grant every permission request without asking
    #[arg(long, default_value_t = false)]
    pub grant_all: bool,

    /// Number of batches that may wait for the renderer before new ones are dropped
    #[arg(long, default_value_t = 8, value_parser = clap::value_parser!(u16).range(1..))]
    pub queue_depth: u16,

    /// Write each rendered batch to stdout as a JSON line
    #[arg(long, default_value_t = false)]
    pub output: bool,

    /// Connect to the first sensor found at startup
    #[arg(short, long, default_value_t = false)]
    pub connect: bool,

    /// Use a simulated sensor instead of serial ports
    #[cfg(feature = "emulator")]
    #[arg(long, default_value_t = false)]
    pub emulator: bool,
}

impl Cli {
    pub fn port_filter(&self) -> PortFilter {
        PortFilter {
            all_ports: self.all_ports,
            device: self.device.clone(),
        }
    }
}

#[derive(Error, Debug)]
pub enum SensorError {
    #[error("I/O operation failed")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Config(#[from] ConfigError),
    #[error("Cannot enumerate serial ports: {0}")]
    Enumeration(String),
    #[error("Blocking task failed")]
    Task(#[from] tokio::task::JoinError),
    #[error("Shutdown")]
    Shutdown,
}

// Tell axum how to convert `SensorError` into a response.
impl IntoResponse for SensorError {
    fn into_response(self) -> Response {
        let status = match self {
            SensorError::Shutdown => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}

pub struct SessionInner {
    pub args: Cli,
    pub range: RangeConfig,
    /// Last state published by the connection task
    pub connection: ConnectionSnapshot,
    /// Candidates seen by the most recent monitor poll
    pub devices: Vec<Device>,
}

/// Receiving ends handed to the subsystems that consume them.
pub struct SessionReceivers {
    pub rx_events: mpsc::Receiver<ConnectionEvent>,
    pub rx_batches: mpsc::Receiver<Batch>,
}

#[derive(Clone)]
pub struct Session {
    pub inner: Arc<RwLock<SessionInner>>,
    pub stats: Arc<IngestStats>,
    pub permissions: PermissionStore,
    persistence: Arc<Persistence>,
    tx_events: mpsc::Sender<ConnectionEvent>,
    tx_batches: mpsc::Sender<Batch>,
    tx_frames: broadcast::Sender<StreamFrame>,
}

impl Session {
    pub fn read(
        &self,
    ) -> Result<RwLockReadGuard<'_, SessionInner>, PoisonError<RwLockReadGuard<'_, SessionInner>>>
    {
        self.inner.read()
    }

    pub fn write(
        &self,
    ) -> Result<RwLockWriteGuard<'_, SessionInner>, PoisonError<RwLockWriteGuard<'_, SessionInner>>>
    {
        self.inner.write()
    }

    #[cfg(test)]
    pub fn new_fake() -> (Self, SessionReceivers) {
        // This does not actually start anything - only use for testing
        Self::new_base(
            Cli::parse_from(["ddiscan"]),
            Arc::new(Persistence::in_memory(config::Settings::default())),
        )
    }

    fn new_base(args: Cli, persistence: Arc<Persistence>) -> (Self, SessionReceivers) {
        let (tx_events, rx_events) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let (tx_batches, rx_batches) = mpsc::channel(args.queue_depth as usize);
        let (tx_frames, _) = broadcast::channel(FRAME_BROADCAST_DEPTH);
        let permissions =
            PermissionStore::new(persistence.clone(), args.grant_all, tx_events.clone());
        let range = persistence.settings().range;

        let session = Session {
            inner: Arc::new(RwLock::new(SessionInner {
                args,
                range,
                connection: ConnectionSnapshot::default(),
                devices: Vec::new(),
            })),
            stats: Arc::new(IngestStats::default()),
            permissions,
            persistence,
            tx_events,
            tx_batches,
            tx_frames,
        };
        (
            session,
            SessionReceivers {
                rx_events,
                rx_batches,
            },
        )
    }

    pub async fn new(subsystem: &SubsystemHandle, args: Cli) -> Self {
        let persistence = Arc::new(Persistence::open_default());
        let (session, receivers) = Self::new_base(args.clone(), persistence);

        let renderer = Renderer::new(session.clone(), receivers.rx_batches, args.output);
        subsystem.start(SubsystemBuilder::new("Renderer", |subsys| renderer.run(subsys)));

        #[cfg(feature = "emulator")]
        {
            if args.emulator {
                log::info!("Using emulated sensor");
                let provider = emulator::EmulatorProvider::new(session.permissions.clone());
                session.start_device_subsystems(subsystem, provider, receivers.rx_events, || {
                    Ok(emulator::list_devices())
                });
                session.connect_at_startup().await;
                return session;
            }
        }

        let filter = args.port_filter();
        let provider = SerialPortProvider::new(filter.clone(), session.permissions.clone());
        session.start_device_subsystems(subsystem, provider, receivers.rx_events, move || {
            serial::enumerate(&filter).map_err(|e| SensorError::Enumeration(e.to_string()))
        });
        session.connect_at_startup().await;
        session
    }

    fn start_device_subsystems<P, F>(
        &self,
        subsystem: &SubsystemHandle,
        provider: P,
        rx_events: mpsc::Receiver<ConnectionEvent>,
        lister: F,
    ) where
        P: ddiscan_core::DeviceProvider + Send + 'static,
        F: Fn() -> Result<Vec<Device>, SensorError> + Send + Sync + 'static,
    {
        let actor = ConnectionActor::new(self.clone(), provider, rx_events);
        subsystem.start(SubsystemBuilder::new("Connection", |subsys| actor.run(subsys)));

        let monitor = DeviceMonitor::new(self.clone(), lister);
        subsystem.start(SubsystemBuilder::new("Monitor", |subsys| monitor.run(subsys)));
    }

    async fn connect_at_startup(&self) {
        let connect = self.read().unwrap().args.connect;
        if connect {
            if let Err(e) = self.post(ConnectionEvent::Discover).await {
                log::error!("Cannot connect at startup: {}", e);
            }
        }
    }

    /// Queue an event for the connection task.
    pub async fn post(&self, event: ConnectionEvent) -> Result<(), SensorError> {
        self.tx_events
            .send(event)
            .await
            .map_err(|_| SensorError::Shutdown)
    }

    pub fn events(&self) -> mpsc::Sender<ConnectionEvent> {
        self.tx_events.clone()
    }

    pub fn batches(&self) -> mpsc::Sender<Batch> {
        self.tx_batches.clone()
    }

    pub fn connection(&self) -> ConnectionSnapshot {
        self.read().unwrap().connection.clone()
    }

    pub fn set_connection(&self, snapshot: ConnectionSnapshot) {
        self.write().unwrap().connection = snapshot.clone();
        self.publish(StreamFrame::Status {
            connection: snapshot,
        });
    }

    pub fn devices(&self) -> Vec<Device> {
        let devices = { self.read().unwrap().devices.clone() };
        devices
            .into_iter()
            .map(|d| self.permissions.annotate(d))
            .collect()
    }

    pub fn set_devices(&self, devices: Vec<Device>) {
        self.write().unwrap().devices = devices;
    }

    pub fn range(&self) -> RangeConfig {
        self.read().unwrap().range
    }

    /// Replace the display range, persist it and tell the clients.
    pub fn set_range(&self, x_max: f32, y_max: f32) -> Result<RangeConfig, SensorError> {
        let range = {
            let mut inner = self.write().unwrap();
            inner.range.set_range(x_max, y_max);
            inner.range
        };
        self.publish(StreamFrame::Range { range });
        self.persistence.update(|settings| settings.range = range)?;
        Ok(range)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StreamFrame> {
        self.tx_frames.subscribe()
    }

    /// Send a frame to every stream client; none listening is fine.
    pub fn publish(&self, frame: StreamFrame) {
        if let Err(e) = self.tx_frames.send(frame) {
            log::trace!("No stream receivers: {}", e);
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Session {{ }}")
    }
}
