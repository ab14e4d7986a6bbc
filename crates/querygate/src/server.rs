use crate::config::GatewayConfig;
use crate::connection::run_connection;
use crate::transport::ws_transport;
use axum::Router;
use axum::extract::{State, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::get;
use querygate_core::{GatewayError, QueryResolver};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct AppState {
    pub resolver: Arc<QueryResolver>,
    pub config: Arc<GatewayConfig>,
    pub root: CancellationToken,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .with_state(state)
}

async fn ws_handler(State(app): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.max_message_size(app.config.max_frame_size)
        .on_upgrade(move |socket| async move {
            let (sink, stream) = ws_transport(socket);
            run_connection(
                app.resolver.clone(),
                &app.config,
                app.root.clone(),
                sink,
                stream,
            )
            .await;
        })
}

async fn health() -> &'static str {
    "healthy"
}

/// Bind and serve until the root token is cancelled, then let in-flight
/// connections unwind through their own teardown.
pub async fn serve(
    config: Arc<GatewayConfig>,
    resolver: Arc<QueryResolver>,
    root: CancellationToken,
) -> Result<(), GatewayError> {
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr).await?;
    log::info!("[SERVER] Listening on {}", addr);

    let state = AppState {
        resolver,
        config,
        root: root.clone(),
    };

    axum::serve(listener, router(state))
        .with_graceful_shutdown(root.cancelled_owned())
        .await?;

    Ok(())
}
