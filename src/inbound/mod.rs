//! HTTP listener: landing page, probe endpoint, and WebSocket upgrades
//!
//! The single listen port serves plain HTTP and upgrades to WebSocket on the
//! standard handshake. Upgrades are accepted on any path; the path never
//! influences relay behavior.

use crate::{relay, Error, Result, ServerContext};
use axum::extract::connect_info::ConnectInfo;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

const INDEX_HTML: &str = include_str!("index.html");
const NOT_FOUND_BODY: &str = "Not Found";

/// HTTP listener owning the shared connection context
pub struct HttpListener {
    ctx: Arc<ServerContext>,
    addr: SocketAddr,
}

impl HttpListener {
    pub fn new(ctx: Arc<ServerContext>, addr: SocketAddr) -> Self {
        HttpListener { ctx, addr }
    }

    /// Bind and serve until ctrl-c. A bind failure is fatal and propagates.
    pub async fn start(&self) -> Result<()> {
        let listener = TcpListener::bind(self.addr)
            .await
            .map_err(|e| Error::connection(format!("bind {}: {}", self.addr, e)))?;
        info!("listening on {}", listener.local_addr()?);

        let app = router(self.ctx.clone());
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await?;

        Ok(())
    }
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("received shutdown signal");
}

/// Build the router: two static pages, the probe endpoint, and a 404
/// fallback, every one of them upgrade-capable.
pub fn router(ctx: Arc<ServerContext>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/index.html", get(index))
        .route("/generate_204", get(generate_204))
        .fallback(not_found)
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}

async fn index(
    ws: Option<WebSocketUpgrade>,
    State(ctx): State<Arc<ServerContext>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
) -> Response {
    match ws {
        Some(ws) => upgrade(ws, ctx, peer),
        None => Html(INDEX_HTML).into_response(),
    }
}

async fn generate_204(
    ws: Option<WebSocketUpgrade>,
    State(ctx): State<Arc<ServerContext>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
) -> Response {
    match ws {
        Some(ws) => upgrade(ws, ctx, peer),
        None => (StatusCode::NO_CONTENT, [(header::CONNECTION, "close")]).into_response(),
    }
}

async fn not_found(
    ws: Option<WebSocketUpgrade>,
    State(ctx): State<Arc<ServerContext>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
) -> Response {
    match ws {
        Some(ws) => upgrade(ws, ctx, peer),
        None => (StatusCode::NOT_FOUND, NOT_FOUND_BODY).into_response(),
    }
}

fn upgrade(ws: WebSocketUpgrade, ctx: Arc<ServerContext>, peer: SocketAddr) -> Response {
    ws.on_upgrade(move |socket| relay::serve(socket, peer, ctx))
}
