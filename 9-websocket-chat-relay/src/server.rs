use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use axum::{
    Router,
    extract::{
        ConnectInfo, State,
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
    },
    http::HeaderValue,
    response::Response,
    routing::get,
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink};
use tokio::{
    net::TcpListener,
    select,
    sync::{mpsc, watch},
    task::JoinHandle,
    time::{MissedTickBehavior, timeout},
};
use tower::ServiceBuilder;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, info, warn};

use crate::{
    config::{CorsPolicy, ServerConfig, TransportConfig},
    hub::{ConnectionId, Hub, Outbound, Registration},
};

/// Close code sent when the hub ends a connection (going away).
const CLOSE_GOING_AWAY: u16 = 1001;

/// How long a terminated connection's writer may take to flush its close frame.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

#[derive(Clone)]
struct AppState {
    hub: Arc<Hub>,
    transport: TransportConfig,
}

pub struct Server {
    listener: TcpListener,
    hub: Arc<Hub>,
    config: ServerConfig,
}

impl Server {
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        let listener = TcpListener::bind(config.listen)
            .await
            .with_context(|| format!("failed to bind {}", config.listen))?;
        Ok(Self::new(listener, config))
    }

    pub fn new(listener: TcpListener, config: ServerConfig) -> Self {
        let hub = Arc::new(Hub::new(config.hub.clone()));
        Self {
            listener,
            hub,
            config,
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Shared handle to the connection registry, mostly for inspection in tests.
    pub fn hub(&self) -> Arc<Hub> {
        Arc::clone(&self.hub)
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Server {
            listener,
            hub,
            config,
        } = self;

        let router = build_router(Arc::clone(&hub), &config);
        let heartbeat = config
            .heartbeat
            .map(|period| spawn_heartbeat(Arc::clone(&hub), period));

        let shutdown_hub = Arc::clone(&hub);
        let served = axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            shutdown.await;
            shutdown_hub.shutdown();
        })
        .await;

        if let Some(heartbeat) = heartbeat {
            heartbeat.abort();
        }
        // Connections accepted while the server was draining.
        hub.shutdown();

        served.context("server exited with error")
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

/// Builds the HTTP router: the WebSocket endpoint plus trace and CORS layers.
pub fn build_router(hub: Arc<Hub>, config: &ServerConfig) -> Router {
    let state = AppState {
        hub,
        transport: config.transport,
    };

    Router::new()
        .route(&config.path, get(upgrade))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors_layer(&config.cors)),
        )
        .with_state(state)
}

fn cors_layer(policy: &CorsPolicy) -> CorsLayer {
    let origins = match policy {
        CorsPolicy::AnyOrigin => AllowOrigin::any(),
        CorsPolicy::Origins(origins) => {
            let values = origins
                .iter()
                .filter_map(|origin| match HeaderValue::from_str(origin) {
                    Ok(value) => Some(value),
                    Err(error) => {
                        warn!(origin = %origin, %error, "ignoring invalid allowed origin");
                        None
                    }
                })
                .collect::<Vec<_>>();
            AllowOrigin::list(values)
        }
    };

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
}

async fn upgrade(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    mut ws: WebSocketUpgrade,
) -> Response {
    if let Some(size) = state.transport.max_message_size {
        ws = ws.max_message_size(size);
    }
    if let Some(size) = state.transport.max_frame_size {
        ws = ws.max_frame_size(size);
    }

    ws.on_upgrade(move |socket| run_connection(socket, state.hub, peer))
}

async fn run_connection(socket: WebSocket, hub: Arc<Hub>, peer: SocketAddr) {
    let Registration {
        id,
        outbound,
        mut terminated,
    } = hub.accept(peer);
    let (sink, mut stream) = socket.split();
    let mut writer = tokio::spawn(write_outbound(sink, outbound, id));

    loop {
        select! {
            frame = stream.next() => {
                if !handle_frame(&hub, id, frame) {
                    break;
                }
            }
            // The writer stops once the hub closes or terminates this connection.
            _ = &mut writer => {
                debug!(id, "writer finished; dropping connection");
                break;
            }
            // Evicted or shut down while the writer may be blocked on a peer
            // that stopped reading.
            _ = wait_terminated(&mut terminated) => {
                if timeout(CLOSE_GRACE, &mut writer).await.is_err() {
                    debug!(id, "writer still blocked; dropping connection");
                }
                break;
            }
        }
    }

    writer.abort();
    hub.remove(id);
}

async fn wait_terminated(terminated: &mut watch::Receiver<bool>) {
    let _ = terminated.wait_for(|done| *done).await;
}

/// Feeds one inbound frame to the hub. Returns `false` once the connection is done.
fn handle_frame(
    hub: &Hub,
    id: ConnectionId,
    frame: Option<Result<Message, axum::Error>>,
) -> bool {
    match frame {
        Some(Ok(Message::Text(text))) => {
            hub.on_message(id, &text);
            true
        }
        Some(Ok(Message::Binary(bytes))) => {
            match String::from_utf8(bytes) {
                Ok(text) => {
                    hub.on_message(id, &text);
                }
                Err(error) => warn!(id, %error, "dropping non-UTF-8 binary frame"),
            }
            true
        }
        Some(Ok(Message::Pong(_))) => {
            hub.mark_alive(id);
            true
        }
        // Pings are answered by the protocol layer.
        Some(Ok(Message::Ping(_))) => {
            hub.mark_alive(id);
            true
        }
        Some(Ok(Message::Close(frame))) => {
            debug!(id, ?frame, "peer sent close");
            false
        }
        Some(Err(error)) => {
            hub.on_error(id, &error);
            false
        }
        None => false,
    }
}

async fn write_outbound(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    id: ConnectionId,
) {
    while let Some(frame) = outbound.recv().await {
        let message = match frame {
            Outbound::Text(text) => Message::Text(text),
            Outbound::Ping => Message::Ping(Vec::new()),
            Outbound::Close => {
                let close = Message::Close(Some(CloseFrame {
                    code: CLOSE_GOING_AWAY,
                    reason: "connection closed by hub".into(),
                }));
                if let Err(error) = sink.send(close).await {
                    debug!(id, %error, "failed to send close frame");
                }
                return;
            }
        };

        if let Err(error) = sink.send(message).await {
            debug!(id, %error, "failed to deliver frame to client");
            return;
        }
    }
}

fn spawn_heartbeat(hub: Arc<Hub>, period: Duration) -> JoinHandle<()> {
    info!(?period, "heartbeat enabled");
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let evicted = hub.sweep();
            if !evicted.is_empty() {
                info!(?evicted, remaining = hub.len(), "evicted unresponsive connections");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request};
    use tower::ServiceExt;

    fn router(cors: CorsPolicy) -> Router {
        let config = ServerConfig {
            cors,
            ..ServerConfig::default()
        };
        build_router(Arc::new(Hub::default()), &config)
    }

    #[tokio::test]
    async fn plain_get_is_not_upgraded() {
        let response = router(CorsPolicy::AnyOrigin)
            .oneshot(Request::get("/ws").body(Body::empty()).expect("request"))
            .await
            .expect("response");

        assert!(!response.status().is_success());
    }

    #[tokio::test]
    async fn unknown_path_is_not_found() {
        let response = router(CorsPolicy::AnyOrigin)
            .oneshot(Request::get("/chat").body(Body::empty()).expect("request"))
            .await
            .expect("response");

        assert_eq!(response.status(), axum::http::StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn wildcard_cors_allows_any_origin() {
        let response = router(CorsPolicy::AnyOrigin)
            .oneshot(
                Request::get("/ws")
                    .header("origin", "https://chat.example")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");

        assert_eq!(
            response.headers().get("access-control-allow-origin"),
            Some(&HeaderValue::from_static("*"))
        );
    }

    #[tokio::test]
    async fn listed_origins_are_echoed_back() {
        let cors = CorsPolicy::Origins(vec!["https://chat.example".into()]);

        let allowed = router(cors.clone())
            .oneshot(
                Request::get("/ws")
                    .header("origin", "https://chat.example")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(
            allowed.headers().get("access-control-allow-origin"),
            Some(&HeaderValue::from_static("https://chat.example"))
        );

        let other = router(cors)
            .oneshot(
                Request::get("/ws")
                    .header("origin", "https://elsewhere.example")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert!(other.headers().get("access-control-allow-origin").is_none());
    }
}
