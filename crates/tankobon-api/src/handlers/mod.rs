//! HTTP request handlers.

pub mod commands;
pub mod health;

pub use commands::{
    deliver, list_items, list_subscriptions, output_formats, queue_status, refresh_artifact,
    search, subscribe, toggle_format, unsubscribe, ErrorDetail, ErrorResponse,
};
pub use health::{health_check, liveness_check};
