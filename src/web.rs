//! HTTP and WebSocket surface.

use axum::{
    debug_handler,
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, Path, State,
    },
    http::{header, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::Response,
    routing::{get, post, put},
    Json, Router,
};
use ddiscan_core::{ConnectionEvent, ConnectionSnapshot, Device, DeviceId, RangeConfig};
use log::{debug, trace, warn};
use serde::{Deserialize, Serialize};
use std::{
    io,
    net::{IpAddr, Ipv4Addr, SocketAddr},
};
use thiserror::Error;
use tokio::{net::TcpListener, sync::broadcast};
use tokio_graceful_shutdown::SubsystemHandle;

use crate::reader::StatsSnapshot;
use crate::render::StreamFrame;
use crate::{SensorError, Session, VERSION};

const STATUS_URI: &str = "/v1/api/status";
const CONNECT_URI: &str = "/v1/api/connect";
const DISCONNECT_URI: &str = "/v1/api/disconnect";
const DEVICES_URI: &str = "/v1/api/devices";
// Device ids contain slashes; clients percent-encode them
const DEVICE_PERMISSION_URI: &str = "/v1/api/devices/{device_id}/permission";
const RANGE_URI: &str = "/v1/api/range";
const STREAM_URI: &str = "/v1/api/stream";

#[derive(Error, Debug)]
pub enum WebError {
    #[error("Socket operation failed")]
    Io(#[from] io::Error),
}

#[derive(Clone)]
pub struct Web {
    session: Session,
    shutdown_tx: broadcast::Sender<()>,
}

impl Web {
    pub fn new(session: Session) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Web {
            session,
            shutdown_tx,
        }
    }

    fn router(self) -> Router {
        Router::new()
            .route(STATUS_URI, get(get_status))
            .route(CONNECT_URI, post(connect))
            .route(DISCONNECT_URI, post(disconnect))
            .route(DEVICES_URI, get(get_devices))
            .route(DEVICE_PERMISSION_URI, put(set_permission))
            .route(RANGE_URI, get(get_range).put(set_range))
            .route(STREAM_URI, get(stream_handler))
            .layer(middleware::from_fn(no_cache_middleware))
            .with_state(self)
    }

    pub async fn run(self, subsys: SubsystemHandle) -> Result<(), WebError> {
        let port = self.session.read().unwrap().args.port;
        let listener =
            TcpListener::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)), port))
                .await
                .map_err(WebError::Io)?;

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let shutdown_tx = self.shutdown_tx.clone(); // Clone as self is moved into the router below

        let app = self
            .router()
            .into_make_service_with_connect_info::<SocketAddr>();

        log::info!("Starting HTTP web server on port {}", port);

        tokio::select! { biased;
            _ = subsys.on_shutdown_requested() => {
                let _ = shutdown_tx.send(());
            },
            r = axum::serve(listener, app)
                    .with_graceful_shutdown(
                        async move {
                            _ = shutdown_rx.recv().await;
                        }
                    ) => {
                return r.map_err(WebError::Io);
            }
        }
        Ok(())
    }
}

/// Middleware to add no-cache headers to API responses
async fn no_cache_middleware(request: axum::http::Request<axum::body::Body>, next: Next) -> Response {
    let mut response = next.run(request).await;
    response.headers_mut().insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-cache, no-store, must-revalidate"),
    );
    response
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusApi {
    version: &'static str,
    connection: ConnectionSnapshot,
    stats: StatsSnapshot,
    range: RangeConfig,
}

#[debug_handler]
async fn get_status(State(state): State<Web>) -> Json<StatusApi> {
    let session = &state.session;
    Json(StatusApi {
        version: VERSION,
        connection: session.connection(),
        stats: session.stats.snapshot(),
        range: session.range(),
    })
}

#[debug_handler]
async fn connect(State(state): State<Web>) -> Result<StatusCode, SensorError> {
    debug!("Connect requested");
    state.session.post(ConnectionEvent::Discover).await?;
    Ok(StatusCode::ACCEPTED)
}

#[debug_handler]
async fn disconnect(State(state): State<Web>) -> Result<StatusCode, SensorError> {
    debug!("Disconnect requested");
    state.session.post(ConnectionEvent::Disconnect).await?;
    Ok(StatusCode::ACCEPTED)
}

#[debug_handler]
async fn get_devices(State(state): State<Web>) -> Json<Vec<Device>> {
    Json(state.session.devices())
}

/// Parameters for device-specific endpoints
#[derive(Deserialize)]
struct DeviceIdParam {
    device_id: String,
}

#[derive(Deserialize)]
struct PermissionAnswer {
    granted: bool,
}

#[debug_handler]
async fn set_permission(
    State(state): State<Web>,
    Path(params): Path<DeviceIdParam>,
    Json(answer): Json<PermissionAnswer>,
) -> Result<StatusCode, SensorError> {
    let device = DeviceId::new(params.device_id);
    let granted = answer.granted;
    let permissions = state.session.permissions.clone();
    let answered = device.clone();
    // Persisting the answer writes the settings file
    let was_pending =
        tokio::task::spawn_blocking(move || permissions.answer(&answered, granted))
            .await?;
    if !was_pending {
        debug!("Permission for {} answered without a pending request", device);
    }
    state
        .session
        .post(ConnectionEvent::PermissionResult {
            device,
            granted,
        })
        .await?;
    Ok(StatusCode::OK)
}

#[debug_handler]
async fn get_range(State(state): State<Web>) -> Json<RangeConfig> {
    Json(state.session.range())
}

#[debug_handler]
async fn set_range(
    State(state): State<Web>,
    Json(range): Json<RangeConfig>,
) -> Result<Json<RangeConfig>, SensorError> {
    debug!("PUT range {:?}", range);
    Ok(Json(state.session.set_range(range.x_max, range.y_max)?))
}

#[debug_handler]
async fn stream_handler(
    State(state): State<Web>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    debug!("stream request from {}", addr);

    let shutdown_rx = state.shutdown_tx.subscribe();
    let frames_rx = state.session.subscribe();
    // New clients start from the current state
    let initial = vec![
        StreamFrame::Status {
            connection: state.session.connection(),
        },
        StreamFrame::Range {
            range: state.session.range(),
        },
    ];
    ws.on_upgrade(move |socket| stream(socket, initial, frames_rx, shutdown_rx))
}

/// Actual websocket statemachine (one will be spawned per connection)
async fn stream(
    mut socket: WebSocket,
    initial: Vec<StreamFrame>,
    mut frames_rx: broadcast::Receiver<StreamFrame>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    for frame in &initial {
        if let Err(e) = send_frame(&mut socket, frame).await {
            warn!("Error on send to websocket: {}", e);
            return;
        }
    }

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                debug!("Shutdown of websocket");
                break;
            },
            r = frames_rx.recv() => {
                match r {
                    Ok(frame) => {
                        if let Err(e) = send_frame(&mut socket, &frame).await {
                            warn!("Error on send to websocket: {}", e);
                            break;
                        }
                    },
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Websocket receiver lagged, skipped {} frames", n);
                    },
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("Frame channel closed");
                        break;
                    }
                }
            },
            m = socket.recv() => {
                match m {
                    Some(Ok(Message::Close(_))) | None => {
                        debug!("Websocket closed by client");
                        break;
                    },
                    Some(Err(e)) => {
                        debug!("Websocket receive error: {}", e);
                        break;
                    },
                    Some(Ok(_)) => {}
                }
            }
        }
    }
}

async fn send_frame(socket: &mut WebSocket, frame: &StreamFrame) -> Result<(), axum::Error> {
    let text = serde_json::to_string(frame).map_err(axum::Error::new)?;
    let len = text.len();
    socket.send(Message::Text(text.into())).await?;
    trace!("Sent frame {} bytes", len);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ddiscan_core::{ConnectionState, PermissionStatus};

    fn web() -> (Web, crate::SessionReceivers) {
        let (session, receivers) = Session::new_fake();
        (Web::new(session), receivers)
    }

    #[tokio::test]
    async fn test_status_reports_defaults() {
        let (web, _receivers) = web();
        let Json(status) = get_status(State(web)).await;
        assert_eq!(status.connection.state, ConnectionState::Disconnected);
        assert_eq!(status.range, RangeConfig::new(3000.0, 700.0));
        assert_eq!(status.stats, StatsSnapshot::default());

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["connection"]["statusText"], "Disconnected");
        assert_eq!(json["range"]["xMax"], 3000.0);
    }

    #[tokio::test]
    async fn test_connect_and_disconnect_post_events() {
        let (web, mut receivers) = web();
        assert_eq!(connect(State(web.clone())).await.unwrap(), StatusCode::ACCEPTED);
        assert_eq!(disconnect(State(web)).await.unwrap(), StatusCode::ACCEPTED);

        assert_eq!(receivers.rx_events.recv().await, Some(ConnectionEvent::Discover));
        assert_eq!(receivers.rx_events.recv().await, Some(ConnectionEvent::Disconnect));
    }

    #[tokio::test]
    async fn test_permission_answer_is_recorded_and_posted() {
        let (web, mut receivers) = web();
        let status = set_permission(
            State(web.clone()),
            Path(DeviceIdParam {
                device_id: "/dev/ttyUSB0".to_string(),
            }),
            Json(PermissionAnswer { granted: true }),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::OK);

        let device = DeviceId::new("/dev/ttyUSB0");
        assert_eq!(
            web.session.permissions.status(&device),
            PermissionStatus::Granted
        );
        assert_eq!(
            receivers.rx_events.recv().await,
            Some(ConnectionEvent::PermissionResult {
                device,
                granted: true,
            })
        );
    }

    #[tokio::test]
    async fn test_range_round_trip_without_validation() {
        let (web, _receivers) = web();
        let Json(stored) = set_range(State(web.clone()), Json(RangeConfig::new(-10.0, 0.0)))
            .await
            .unwrap();
        assert_eq!(stored, RangeConfig::new(-10.0, 0.0));

        let Json(read_back) = get_range(State(web)).await;
        assert_eq!(read_back, stored);
    }

    #[tokio::test]
    async fn test_connect_after_shutdown_is_unavailable() {
        let (web, receivers) = web();
        drop(receivers);
        let err = connect(State(web)).await.unwrap_err();
        assert!(matches!(err, SensorError::Shutdown));
    }

    #[tokio::test]
    async fn test_devices_carry_permission_status() {
        let (web, _receivers) = web();
        web.session.set_devices(vec![Device::new("COM3")]);
        web.session
            .permissions
            .answer(&DeviceId::new("COM3"), false);

        let Json(devices) = get_devices(State(web)).await;
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].permission, PermissionStatus::Denied);
    }
}
