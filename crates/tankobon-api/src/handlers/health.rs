//! Health check handlers for service monitoring.
//!
//! `/health` reports the delivery engine and, when configured, the database.
//! `/live` only proves the process answers HTTP.

use std::time::Instant;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tankobon_core::storage::PgStore;
use tankobon_delivery::EngineHandle;
use tracing::{debug, error, instrument};

use crate::server::AppState;

/// Health check response structure.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Overall service health status
    pub status: HealthStatus,
    /// Timestamp when health check was performed
    pub timestamp: DateTime<Utc>,
    /// Individual component health checks
    pub checks: HealthChecks,
    /// Service version information
    pub version: String,
}

/// Overall health status enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// All systems operational
    Healthy,
    /// Running on in-memory storage
    Degraded,
    /// Critical systems failing
    Unhealthy,
}

/// Individual component health check results.
#[derive(Debug, Serialize)]
pub struct HealthChecks {
    /// Database connectivity, absent on in-memory storage
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<ComponentHealth>,
    /// Delivery workers and queue
    pub delivery: ComponentHealth,
}

/// Health status for individual components.
#[derive(Debug, Serialize)]
pub struct ComponentHealth {
    /// Component status
    pub status: ComponentStatus,
    /// Optional error message if unhealthy
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Time taken by the check
    pub response_time_ms: u64,
}

/// Component status values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    /// Component is healthy
    Up,
    /// Component is experiencing issues
    Down,
}

fn elapsed_ms(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}

async fn check_database(database: &PgStore) -> ComponentHealth {
    let start = Instant::now();
    match database.health_check().await {
        Ok(()) => ComponentHealth {
            status: ComponentStatus::Up,
            message: None,
            response_time_ms: elapsed_ms(start),
        },
        Err(e) => {
            error!(error = %e, "database health check failed");
            ComponentHealth {
                status: ComponentStatus::Down,
                message: Some(format!("database connection failed: {e}")),
                response_time_ms: elapsed_ms(start),
            }
        },
    }
}

async fn check_delivery(engine: &EngineHandle) -> ComponentHealth {
    let start = Instant::now();
    let stats = engine.stats().await;
    let (status, message) = if stats.active_workers == 0 {
        (ComponentStatus::Down, Some("no delivery workers running".to_string()))
    } else {
        (ComponentStatus::Up, None)
    };
    ComponentHealth { status, message, response_time_ms: elapsed_ms(start) }
}

/// Health check endpoint handler.
#[instrument(name = "health_check", skip(state))]
pub async fn health_check(State(state): State<AppState>) -> Response {
    let database = match &state.database {
        Some(database) => Some(check_database(database).await),
        None => None,
    };
    let delivery = check_delivery(&state.engine).await;

    let any_down = delivery.status == ComponentStatus::Down
        || database.as_ref().is_some_and(|db| db.status == ComponentStatus::Down);
    let status = if any_down {
        HealthStatus::Unhealthy
    } else if database.is_none() {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    };

    let response = HealthResponse {
        status,
        timestamp: state.clock.now_utc(),
        checks: HealthChecks { database, delivery },
        version: env!("CARGO_PKG_VERSION").to_string(),
    };

    let status_code = match response.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    debug!(status = ?response.status, "health check completed");

    (status_code, Json(response)).into_response()
}

/// Liveness check endpoint.
#[instrument(name = "liveness_check", skip(state))]
pub async fn liveness_check(State(state): State<AppState>) -> Response {
    let response = serde_json::json!({
        "status": "alive",
        "timestamp": state.clock.now_utc(),
        "service": "tankobon"
    });

    (StatusCode::OK, Json(response)).into_response()
}
