use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use embercache_core::{InMemoryStorage, PromiseMap};
use tokio::net::TcpListener;
use tokio::signal;

use crate::config::Config;
use crate::error::Result;

mod cache;
mod types;

use cache::{cache_get, cache_intend, cache_upload, health};
pub(crate) use types::*;

pub struct ServerState {
    pub(crate) node_id: String,
    pub(crate) storage: Arc<InMemoryStorage>,
    pub(crate) promises: Arc<PromiseMap>,
}

impl ServerState {
    pub fn new(node_id: impl Into<String>, storage: Arc<InMemoryStorage>) -> Self {
        Self {
            node_id: node_id.into(),
            storage,
            promises: Arc::new(PromiseMap::new()),
        }
    }

    pub fn storage(&self) -> &Arc<InMemoryStorage> {
        &self.storage
    }

    pub fn promises(&self) -> &Arc<PromiseMap> {
        &self.promises
    }
}

pub fn build_state(config: &Config) -> Arc<ServerState> {
    let storage = Arc::new(InMemoryStorage::with_capacity(
        config.cache.max_memory_bytes,
        config.cache.initial_capacity,
    ));
    Arc::new(ServerState::new(config.node.node_id.clone(), storage))
}

pub fn build_router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(
            "/cache/*key",
            get(cache_get).post(cache_intend).put(cache_upload),
        )
        // The upload handler enforces the value cap itself so it can release
        // the promise when the cap fires.
        .layer(DefaultBodyLimit::disable())
        .with_state(state)
}

pub async fn run_server(config: Config) -> Result<()> {
    let state = build_state(&config);
    let app = build_router(state.clone());

    let listener = TcpListener::bind(&config.node.bind_addr).await?;
    tracing::info!(
        "embercache node {} listening on {}",
        config.node.node_id,
        config.node.bind_addr
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    state.promises.stop();
    tracing::info!("embercache shut down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = signal::ctrl_c().await {
            tracing::error!("failed to install ctrl-c handler: {}", error);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => tracing::error!("failed to install SIGTERM handler: {}", error),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received ctrl-c, shutting down"),
        _ = terminate => tracing::info!("received SIGTERM, shutting down"),
    }
}

pub(crate) fn response_error(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
        .into_response()
}
