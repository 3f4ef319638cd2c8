//! HTTP command surface.
//!
//! Requests flow through middleware in order:
//! 1. Request ID generation
//! 2. Request/response logging
//! 3. Timeout enforcement
//! 4. Handler execution
//!
//! # Graceful Shutdown
//!
//! The server stops accepting connections on CTRL+C, SIGTERM or when the
//! supplied cancellation token fires, then lets in-flight requests finish.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    extract::Request,
    middleware::{self, Next},
    response::Response,
    routing::{delete, get, post},
    Router,
};
use tankobon_core::{storage::PgStore, Clock};
use tankobon_delivery::EngineHandle;
use tokio_util::sync::CancellationToken;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::info;
use uuid::Uuid;

use crate::{commands::CommandDispatcher, handlers};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    /// Command executor.
    pub dispatcher: Arc<CommandDispatcher>,
    /// Engine handle for health reporting.
    pub engine: EngineHandle,
    /// Database, when the service runs on Postgres.
    pub database: Option<PgStore>,
    /// Clock for response timestamps.
    pub clock: Arc<dyn Clock>,
}

/// Creates the router with all routes and middleware.
pub fn create_router(state: AppState, request_timeout: Duration) -> Router {
    let health_routes = Router::new()
        .route("/health", get(handlers::health_check))
        .route("/live", get(handlers::liveness_check));

    let command_routes = Router::new()
        .route("/queue", get(handlers::queue_status))
        .route("/search", post(handlers::search))
        .route("/series/{token}/items", get(handlers::list_items))
        .route("/recipients/{recipient}/deliveries", post(handlers::deliver))
        .route(
            "/recipients/{recipient}/subscriptions",
            get(handlers::list_subscriptions)
                .post(handlers::subscribe)
                .delete(handlers::unsubscribe),
        )
        .route("/recipients/{recipient}/formats", get(handlers::output_formats))
        .route("/recipients/{recipient}/formats/{format}/toggle", post(handlers::toggle_format))
        .route("/artifacts", delete(handlers::refresh_artifact));

    Router::new()
        .merge(health_routes)
        .merge(command_routes)
        .layer(TimeoutLayer::new(request_timeout))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(inject_request_id))
        .with_state(state)
}

/// Adds an `X-Request-Id` header to every response.
async fn inject_request_id(mut req: Request, next: Next) -> Response {
    let request_id = Uuid::new_v4().to_string();
    req.extensions_mut().insert(request_id.clone());

    let mut response = next.run(req).await;

    if let Ok(header_value) = request_id.parse() {
        response.headers_mut().insert("X-Request-Id", header_value);
    }

    response
}

/// Serves the command surface until a shutdown signal or `cancel` fires.
///
/// # Errors
///
/// Returns `std::io::Error` if the address cannot be bound.
pub async fn start_server(
    state: AppState,
    addr: SocketAddr,
    request_timeout: Duration,
    cancel: CancellationToken,
) -> Result<(), std::io::Error> {
    let app = create_router(state, request_timeout);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;

    info!(addr = %actual_addr, "command surface listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                () = shutdown_signal() => cancel.cancel(),
                () = cancel.cancelled() => {},
            }
        })
        .await?;

    info!("command surface stopped");
    Ok(())
}

/// Waits for CTRL+C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("received CTRL+C, starting graceful shutdown");
        },
        () = terminate => {
            info!("received SIGTERM, starting graceful shutdown");
        },
    }
}
