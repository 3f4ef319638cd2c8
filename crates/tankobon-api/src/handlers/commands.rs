//! Command handlers.
//!
//! Each handler turns a request into a [`Command`], runs it through the
//! dispatcher and returns the [`Reply`](crate::commands::Reply) as JSON.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use tankobon_core::{ContentRef, EnqueueError, OutputFormat, RecipientId, Token};
use tankobon_discovery::SourceError;
use tracing::{error, instrument, warn};

use crate::{
    commands::{Command, CommandError, Reply},
    server::AppState,
};

/// Error response with code and message.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error details including code and message
    pub error: ErrorDetail,
}

/// Detailed error information.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorDetail {
    /// Stable machine-readable code
    pub code: String,
    /// Human-readable error description
    pub message: String,
}

fn classify(error: &CommandError) -> (StatusCode, &'static str) {
    match error {
        CommandError::UnknownToken { .. } => (StatusCode::NOT_FOUND, "unknown_token"),
        CommandError::WrongToken { .. } => (StatusCode::BAD_REQUEST, "wrong_token"),
        CommandError::UnknownProvider { .. } => (StatusCode::NOT_FOUND, "unknown_provider"),
        CommandError::Unrouted { .. } => (StatusCode::UNPROCESSABLE_ENTITY, "unrouted"),
        CommandError::InvalidInput(_) => (StatusCode::BAD_REQUEST, "invalid_input"),
        CommandError::Source(SourceError::NotFound { .. }) => (StatusCode::NOT_FOUND, "not_found"),
        CommandError::Source(_) => (StatusCode::BAD_GATEWAY, "source_failure"),
        CommandError::Store(_) => (StatusCode::SERVICE_UNAVAILABLE, "store_failure"),
        CommandError::Enqueue(EnqueueError::Closed) => {
            (StatusCode::SERVICE_UNAVAILABLE, "shutting_down")
        },
        CommandError::Enqueue(EnqueueError::RecipientBlocked { .. }) => {
            (StatusCode::CONFLICT, "recipient_blocked")
        },
        CommandError::Delivery(_) => (StatusCode::INTERNAL_SERVER_ERROR, "delivery_failure"),
    }
}

fn create_error_response(error: &CommandError) -> Response {
    let (status, code) = classify(error);
    if status.is_server_error() {
        error!(error = %error, code, "command failed");
    } else {
        warn!(error = %error, code, "command rejected");
    }

    let error_response =
        ErrorResponse { error: ErrorDetail { code: code.to_string(), message: error.to_string() } };

    (status, Json(error_response)).into_response()
}

async fn run(state: &AppState, command: Command, success: StatusCode) -> Response {
    match state.dispatcher.dispatch(command).await {
        Ok(reply) => (success, Json(reply)).into_response(),
        Err(error) => create_error_response(&error),
    }
}

/// Body of `POST /search`.
#[derive(Debug, Deserialize)]
pub struct SearchRequest {
    /// Title fragment
    pub query: String,
    /// Restrict to one provider identifier
    #[serde(default)]
    pub provider: Option<String>,
    /// Restrict to one language code
    #[serde(default)]
    pub language: Option<String>,
}

/// Query of `GET /series/{token}/items`.
#[derive(Debug, Deserialize)]
pub struct PageQuery {
    /// Page number, 1 when absent
    #[serde(default)]
    pub page: Option<u32>,
}

/// Body of `POST /recipients/{id}/deliveries`.
#[derive(Debug, Deserialize)]
pub struct DeliverRequest {
    /// Item or batch tokens, delivered in this order
    pub items: Vec<Token>,
}

/// Body of `POST /recipients/{id}/subscriptions`.
#[derive(Debug, Deserialize)]
pub struct SubscribeRequest {
    /// Series token from a search
    pub series: Token,
}

/// Query of `GET /recipients/{id}/subscriptions`.
#[derive(Debug, Deserialize)]
pub struct SubscriptionFilter {
    /// Space separated fragments
    #[serde(default)]
    pub filter: Option<String>,
}

/// Query of `DELETE /recipients/{id}/subscriptions`.
#[derive(Debug, Deserialize)]
pub struct UnsubscribeQuery {
    /// Series URL to stop following
    pub url: String,
}

/// Query of `DELETE /artifacts`.
#[derive(Debug, Deserialize)]
pub struct RefreshQuery {
    /// Item whose cached artifacts are dropped
    pub content_ref: String,
}

/// `GET /queue`: queue depth and engine counters.
#[instrument(name = "queue_status", skip(state))]
pub async fn queue_status(State(state): State<AppState>) -> Response {
    run(&state, Command::QueueStatus, StatusCode::OK).await
}

/// `POST /search`: search providers and register the hits.
#[instrument(name = "search", skip(state, request), fields(query = %request.query))]
pub async fn search(State(state): State<AppState>, Json(request): Json<SearchRequest>) -> Response {
    let command = Command::Search {
        query: request.query,
        provider: request.provider,
        language: request.language,
    };
    run(&state, command, StatusCode::OK).await
}

/// `GET /series/{token}/items?page=`: one page of chapters.
#[instrument(name = "list_items", skip(state))]
pub async fn list_items(
    State(state): State<AppState>,
    Path(token): Path<Token>,
    Query(query): Query<PageQuery>,
) -> Response {
    let command = Command::ListItems { series: token, page: query.page.unwrap_or(1) };
    run(&state, command, StatusCode::OK).await
}

/// `POST /recipients/{id}/deliveries`: enqueue chapters in request order.
#[instrument(name = "deliver", skip(state, request), fields(items = request.items.len()))]
pub async fn deliver(
    State(state): State<AppState>,
    Path(recipient): Path<i64>,
    Json(request): Json<DeliverRequest>,
) -> Response {
    let command = Command::Deliver { recipient: RecipientId(recipient), items: request.items };
    run(&state, command, StatusCode::ACCEPTED).await
}

/// `GET /recipients/{id}/subscriptions?filter=`: first matching subscriptions.
#[instrument(name = "list_subscriptions", skip(state))]
pub async fn list_subscriptions(
    State(state): State<AppState>,
    Path(recipient): Path<i64>,
    Query(query): Query<SubscriptionFilter>,
) -> Response {
    let command =
        Command::ListSubscriptions { recipient: RecipientId(recipient), filter: query.filter };
    run(&state, command, StatusCode::OK).await
}

/// `POST /recipients/{id}/subscriptions`: follow a series.
#[instrument(name = "subscribe", skip(state, request))]
pub async fn subscribe(
    State(state): State<AppState>,
    Path(recipient): Path<i64>,
    Json(request): Json<SubscribeRequest>,
) -> Response {
    let command = Command::Subscribe { recipient: RecipientId(recipient), series: request.series };
    match state.dispatcher.dispatch(command).await {
        Ok(reply @ Reply::Subscribed { created: true }) => {
            (StatusCode::CREATED, Json(reply)).into_response()
        },
        Ok(reply) => (StatusCode::OK, Json(reply)).into_response(),
        Err(error) => create_error_response(&error),
    }
}

/// `DELETE /recipients/{id}/subscriptions?url=`: stop following a series.
#[instrument(name = "unsubscribe", skip(state))]
pub async fn unsubscribe(
    State(state): State<AppState>,
    Path(recipient): Path<i64>,
    Query(query): Query<UnsubscribeQuery>,
) -> Response {
    let command = Command::Unsubscribe { recipient: RecipientId(recipient), series_url: query.url };
    run(&state, command, StatusCode::OK).await
}

/// `GET /recipients/{id}/formats`: enabled output formats.
#[instrument(name = "output_formats", skip(state))]
pub async fn output_formats(State(state): State<AppState>, Path(recipient): Path<i64>) -> Response {
    run(&state, Command::OutputFormats { recipient: RecipientId(recipient) }, StatusCode::OK).await
}

/// `POST /recipients/{id}/formats/{format}/toggle`: flip one format.
#[instrument(name = "toggle_format", skip(state))]
pub async fn toggle_format(
    State(state): State<AppState>,
    Path((recipient, format)): Path<(i64, String)>,
) -> Response {
    let format = match format.parse::<OutputFormat>() {
        Ok(format) => format,
        Err(message) => return create_error_response(&CommandError::InvalidInput(message)),
    };
    let command = Command::ToggleFormat { recipient: RecipientId(recipient), format };
    run(&state, command, StatusCode::OK).await
}

/// `DELETE /artifacts?content_ref=`: forget cached artifacts of one item.
#[instrument(name = "refresh_artifact", skip(state))]
pub async fn refresh_artifact(
    State(state): State<AppState>,
    Query(query): Query<RefreshQuery>,
) -> Response {
    let command = Command::Refresh { content_ref: ContentRef::new(query.content_ref) };
    run(&state, command, StatusCode::OK).await
}
