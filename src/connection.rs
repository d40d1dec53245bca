//! The task that owns the connection state machine.
//!
//! Every input (user requests, permission answers, detaches, read faults)
//! arrives as a [`ConnectionEvent`] on one queue and is applied in order, so
//! the state machine never sees two inputs at once. Provider calls block
//! (port enumeration, opening a port, writing the permission file) and run on
//! the blocking pool.

use ddiscan_core::{
    Action, ConnectionEvent, ConnectionManager, ConnectionSnapshot, ConnectionStatus,
    DeviceProvider, LinkError, LinkLease, ReaderStart,
};
use log::{debug, error, info};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use tokio::sync::mpsc;
use tokio_graceful_shutdown::SubsystemHandle;

use crate::reader::StreamReader;
use crate::render::ChannelSink;
use crate::{SensorError, Session};

/// The state machine and the provider it drives, always used together.
struct Machine<P> {
    manager: ConnectionManager,
    provider: P,
}

/// A running reader thread and the lease it polls.
struct ActiveReader {
    lease: LinkLease,
    handle: JoinHandle<()>,
}

pub struct ConnectionActor<P: DeviceProvider> {
    session: Session,
    machine: Arc<Mutex<Machine<P>>>,
    rx_events: mpsc::Receiver<ConnectionEvent>,
    /// Events to apply before taking new ones from the queue
    backlog: VecDeque<ConnectionEvent>,
    reader: Option<ActiveReader>,
}

impl<P> ConnectionActor<P>
where
    P: DeviceProvider + Send + 'static,
{
    pub fn new(session: Session, provider: P, rx_events: mpsc::Receiver<ConnectionEvent>) -> Self {
        ConnectionActor {
            session,
            machine: Arc::new(Mutex::new(Machine {
                manager: ConnectionManager::new(),
                provider,
            })),
            rx_events,
            backlog: VecDeque::new(),
            reader: None,
        }
    }

    pub async fn run(mut self, subsys: SubsystemHandle) -> Result<(), SensorError> {
        let (settings, snapshot) = {
            let machine = self.machine.lock().unwrap();
            (machine.manager.settings().to_string(), machine.manager.snapshot())
        };
        info!("Connection task started ({})", settings);
        self.session.set_connection(snapshot);

        loop {
            if let Some(event) = self.backlog.pop_front() {
                self.dispatch(event).await?;
                continue;
            }

            tokio::select! { biased;
                _ = subsys.on_shutdown_requested() => {
                    break;
                },
                r = self.rx_events.recv() => {
                    match r {
                        Some(event) => self.dispatch(event).await?,
                        None => break,
                    }
                },
            }
        }

        let stopped = {
            let mut machine = self.machine.lock().unwrap();
            machine
                .manager
                .disconnect()
                .then(|| machine.manager.snapshot())
        };
        if let Some(snapshot) = stopped {
            self.session.set_connection(snapshot);
        }
        self.await_reader_exit().await;
        info!("Connection task stopped");
        Ok(())
    }

    async fn dispatch(&mut self, event: ConnectionEvent) -> Result<(), SensorError> {
        if matches!(event, ConnectionEvent::Open(_)) {
            // The previous reader may still hold the port
            self.await_reader_exit().await;
        }

        let machine = self.machine.clone();
        let (before, action, after) = tokio::task::spawn_blocking(move || {
            let mut machine = machine.lock().unwrap();
            let Machine { manager, provider } = &mut *machine;
            debug!("Connection event {:?} in state {}", event, manager.state());
            let before = manager.snapshot();
            let action = manager.handle(event, provider);
            (before, action, manager.snapshot())
        })
        .await?;

        match action {
            Some(Action::Open(device)) => {
                // Anything already queued (a detach, a disconnect) goes first
                while let Ok(pending) = self.rx_events.try_recv() {
                    self.backlog.push_back(pending);
                }
                self.backlog.push_back(ConnectionEvent::Open(device));
            }
            Some(Action::StartReader(start)) => self.start_reader(start),
            None => {}
        }

        if after != before {
            report(&after);
            self.session.set_connection(after);
        }
        Ok(())
    }

    fn start_reader(&mut self, start: ReaderStart<P::Link>) {
        let device = start.device.clone();
        let lease = start.lease.clone();
        let generation = lease.generation();
        let sink = ChannelSink::new(self.session.batches(), self.session.stats.clone());
        let reader = StreamReader::new(start, sink, self.session.stats.clone());

        match reader.spawn(self.session.events()) {
            Ok(handle) => {
                info!("Reading {} (connection {})", device, generation);
                self.reader = Some(ActiveReader { lease, handle });
            }
            Err(e) => {
                // The link went down with the closure that failed to spawn
                error!("Cannot start reader for {}: {}", device, e);
                self.backlog.push_back(ConnectionEvent::ReadFault {
                    generation,
                    error: LinkError::Io(e.to_string()),
                });
            }
        }
    }

    /// Wait until a reader whose lease was revoked has closed its port.
    ///
    /// A reader that still holds a valid lease is the live connection and is
    /// left alone.
    async fn await_reader_exit(&mut self) {
        let Some(reader) = self.reader.take() else {
            return;
        };
        if reader.lease.is_present() {
            self.reader = Some(reader);
            return;
        }

        let generation = reader.lease.generation();
        if !reader.handle.is_finished() {
            debug!("Waiting for reader {} to close its port", generation);
        }
        let handle = reader.handle;
        match tokio::task::spawn_blocking(move || handle.join()).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => error!("Reader {} panicked", generation),
            Err(e) => error!("Cannot join reader {}: {}", generation, e),
        }
    }
}

fn report(after: &ConnectionSnapshot) {
    match after.status {
        ConnectionStatus::OpenFailed => {
            error!(
                "Open failed: {}",
                after.last_error.as_deref().unwrap_or("unknown error")
            );
        }
        _ => info!(
            "Connection {} ({}) device {}",
            after.state,
            after.status,
            after
                .device
                .as_ref()
                .map(|d| d.to_string())
                .unwrap_or_else(|| "-".to_string())
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ddiscan_core::{
        ConnectionState, Device, DeviceId, LinkSettings, OpenError, SerialLink,
    };
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    /// Streams records until told the device is gone.
    struct FakeLink {
        unplugged: Arc<Mutex<bool>>,
    }

    impl SerialLink for FakeLink {
        fn read(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<usize, LinkError> {
            if *self.unplugged.lock().unwrap() {
                return Err(LinkError::Detached);
            }
            std::thread::sleep(Duration::from_millis(1));
            let record = b"100,1000\n";
            buf[..record.len()].copy_from_slice(record);
            Ok(record.len())
        }

        fn close(&mut self) -> Result<(), LinkError> {
            Ok(())
        }
    }

    struct FakeProvider {
        unplugged: Arc<Mutex<bool>>,
        granted: bool,
    }

    impl DeviceProvider for FakeProvider {
        type Link = FakeLink;

        fn discover(&mut self) -> Vec<Device> {
            vec![Device::new("fake:0")]
        }

        fn has_permission(&self, _device: &Device) -> bool {
            self.granted
        }

        fn request_permission(&mut self, _device: &Device) {}

        fn open(&mut self, device: &Device, _settings: &LinkSettings) -> Result<FakeLink, OpenError> {
            if *self.unplugged.lock().unwrap() {
                return Err(OpenError::DriverAbsent(device.id.clone()));
            }
            Ok(FakeLink {
                unplugged: self.unplugged.clone(),
            })
        }
    }

    fn actor(granted: bool) -> (ConnectionActor<FakeProvider>, Arc<Mutex<bool>>, crate::SessionReceivers) {
        let (session, mut receivers) = Session::new_fake();
        let unplugged = Arc::new(Mutex::new(false));
        let provider = FakeProvider {
            unplugged: unplugged.clone(),
            granted,
        };
        let rx_events = std::mem::replace(&mut receivers.rx_events, mpsc::channel(1).1);
        (ConnectionActor::new(session, provider, rx_events), unplugged, receivers)
    }

    /// Apply everything currently queued, including the backlog.
    async fn settle<P: DeviceProvider + Send + 'static>(actor: &mut ConnectionActor<P>) {
        loop {
            if let Some(event) = actor.backlog.pop_front() {
                actor.dispatch(event).await.unwrap();
            } else if let Ok(event) = actor.rx_events.try_recv() {
                actor.dispatch(event).await.unwrap();
            } else {
                break;
            }
        }
    }

    #[tokio::test]
    async fn test_connect_stream_and_detach() {
        let (mut actor, unplugged, mut receivers) = actor(true);
        let session = actor.session.clone();

        session.post(ConnectionEvent::Discover).await.unwrap();
        settle(&mut actor).await;
        assert_eq!(session.connection().state, ConnectionState::Connected);
        assert_eq!(session.connection().status_text, "Connected");

        // 150 records make a batch
        let batch = tokio::time::timeout(Duration::from_secs(5), receivers.rx_batches.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(batch.len(), 300);

        // Pulling the plug: the reader reports a fault and the state unwinds
        *unplugged.lock().unwrap() = true;
        let fault = tokio::time::timeout(Duration::from_secs(5), actor.rx_events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(fault, ConnectionEvent::ReadFault { generation: 1, .. }));
        actor.dispatch(fault).await.unwrap();

        let snapshot = session.connection();
        assert_eq!(snapshot.state, ConnectionState::Disconnected);
        assert_eq!(snapshot.status_text, "Disconnected");
        assert_eq!(snapshot.fault_count, 1);
    }

    #[tokio::test]
    async fn test_detach_queued_before_open_wins() {
        let (mut actor, _unplugged, _receivers) = actor(true);
        let session = actor.session.clone();

        session.post(ConnectionEvent::Discover).await.unwrap();
        session
            .post(ConnectionEvent::DeviceDetached(DeviceId::new("fake:0")))
            .await
            .unwrap();
        settle(&mut actor).await;

        assert_eq!(session.connection().state, ConnectionState::Disconnected);
        assert_eq!(session.connection().generation, 0);
    }

    #[tokio::test]
    async fn test_open_failure_is_reported() {
        let (mut actor, unplugged, _receivers) = actor(true);
        let session = actor.session.clone();
        *unplugged.lock().unwrap() = true;

        session.post(ConnectionEvent::Discover).await.unwrap();
        settle(&mut actor).await;

        let snapshot = session.connection();
        assert_eq!(snapshot.status_text, "Open failed");
        assert!(snapshot.last_error.unwrap().contains("fake:0"));
    }

    #[tokio::test]
    async fn test_disconnect_stops_reader_and_is_idempotent() {
        let (mut actor, _unplugged, _receivers) = actor(true);
        let session = actor.session.clone();
        let mut frames = session.subscribe();

        session.post(ConnectionEvent::Discover).await.unwrap();
        settle(&mut actor).await;
        session.post(ConnectionEvent::Disconnect).await.unwrap();
        session.post(ConnectionEvent::Disconnect).await.unwrap();
        settle(&mut actor).await;
        assert_eq!(session.connection().state, ConnectionState::Disconnected);

        // Connecting, Connected and Disconnected; the second disconnect adds nothing
        let mut statuses = 0;
        while let Ok(frame) = frames.try_recv() {
            if matches!(frame, crate::render::StreamFrame::Status { .. }) {
                statuses += 1;
            }
        }
        assert_eq!(statuses, 3);
    }

    #[tokio::test]
    async fn test_waits_for_permission() {
        let (mut actor, _unplugged, _receivers) = actor(false);
        let session = actor.session.clone();

        session.post(ConnectionEvent::Discover).await.unwrap();
        settle(&mut actor).await;
        assert_eq!(
            session.connection().state,
            ConnectionState::AwaitingPermission
        );

        session
            .post(ConnectionEvent::PermissionResult {
                device: DeviceId::new("fake:0"),
                granted: true,
            })
            .await
            .unwrap();
        settle(&mut actor).await;
        assert_eq!(session.connection().state, ConnectionState::Connected);

        session.post(ConnectionEvent::Disconnect).await.unwrap();
        settle(&mut actor).await;
    }

    /// A port that can be held by one handle at a time, like a serial port
    /// on Unix. Reads block for the whole timeout.
    struct ExclusiveLink {
        busy: Arc<Mutex<bool>>,
    }

    impl SerialLink for ExclusiveLink {
        fn read(&mut self, _buf: &mut [u8], timeout: Duration) -> Result<usize, LinkError> {
            std::thread::sleep(timeout);
            Ok(0)
        }

        fn close(&mut self) -> Result<(), LinkError> {
            *self.busy.lock().unwrap() = false;
            Ok(())
        }
    }

    struct ExclusiveProvider {
        busy: Arc<Mutex<bool>>,
    }

    impl DeviceProvider for ExclusiveProvider {
        type Link = ExclusiveLink;

        fn discover(&mut self) -> Vec<Device> {
            vec![Device::new("/dev/ttyUSB0")]
        }

        fn has_permission(&self, _device: &Device) -> bool {
            true
        }

        fn request_permission(&mut self, _device: &Device) {}

        fn open(
            &mut self,
            device: &Device,
            _settings: &LinkSettings,
        ) -> Result<ExclusiveLink, OpenError> {
            let mut busy = self.busy.lock().unwrap();
            if *busy {
                return Err(OpenError::PortOpen {
                    device: device.id.clone(),
                    reason: "Device or resource busy".to_string(),
                });
            }
            *busy = true;
            Ok(ExclusiveLink {
                busy: self.busy.clone(),
            })
        }
    }

    #[tokio::test]
    async fn test_reconnect_waits_for_previous_reader_to_close_port() {
        let (session, mut receivers) = Session::new_fake();
        let busy = Arc::new(Mutex::new(false));
        let provider = ExclusiveProvider { busy: busy.clone() };
        let rx_events = std::mem::replace(&mut receivers.rx_events, mpsc::channel(1).1);
        let mut actor = ConnectionActor::new(session.clone(), provider, rx_events);

        session.post(ConnectionEvent::Discover).await.unwrap();
        settle(&mut actor).await;
        assert_eq!(session.connection().state, ConnectionState::Connected);

        // The reader is now inside a read that lasts the full timeout
        tokio::time::sleep(Duration::from_millis(50)).await;
        session.post(ConnectionEvent::Disconnect).await.unwrap();
        session.post(ConnectionEvent::Discover).await.unwrap();
        settle(&mut actor).await;

        let snapshot = session.connection();
        assert_eq!(snapshot.state, ConnectionState::Connected);
        assert_eq!(snapshot.status_text, "Connected");
        assert_eq!(snapshot.generation, 2);
        assert!(*busy.lock().unwrap());

        session.post(ConnectionEvent::Disconnect).await.unwrap();
        settle(&mut actor).await;
        actor.await_reader_exit().await;
        assert!(!*busy.lock().unwrap());
    }
}
