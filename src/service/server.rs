use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use tracing::info;

use super::config::ServiceConfig;
use super::pipeline;
use super::state::AppState;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("invalid service configuration: {0}")]
    Startup(String),
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },
    #[error("startup healthcheck failed: {0}")]
    Healthcheck(String),
    #[error("server terminated: {0}")]
    Serve(String),
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let max_body = state.config.inbound_body_max_bytes;
    Router::new()
        .route("/health", get(health))
        .route("/webhook/inbound", post(inbound))
        .with_state(state)
        .layer(DefaultBodyLimit::max(max_body))
}

pub async fn run_server(
    config: ServiceConfig,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<(), ServerError> {
    let state = Arc::new(AppState::new(config).map_err(|err| ServerError::Startup(err.to_string()))?);

    if state.config.startup_healthcheck {
        state
            .store
            .healthcheck()
            .await
            .map_err(|err| ServerError::Healthcheck(err.to_string()))?;
        info!("store reachable, startup healthcheck passed");
    }

    let addr_text = format!("{}:{}", state.config.host, state.config.port);
    let addr: SocketAddr = addr_text
        .parse()
        .map_err(|_| ServerError::Startup(format!("invalid listen address {}", addr_text)))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind {
            addr: addr_text,
            source,
        })?;
    info!("email intake service listening on {}", addr);

    let app = build_router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|err| ServerError::Serve(err.to_string()))
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn inbound(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok());
    pipeline::process_inbound(&state, content_type, &body).await
}
