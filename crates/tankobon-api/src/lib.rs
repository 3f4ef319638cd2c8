//! tankobon command surface and service wiring.
//!
//! [`Config`] loads service settings, [`CommandDispatcher`] executes typed
//! recipient commands, the [`gateway`] module adapts HTTP sidecars to the
//! provider, producer and converter traits, and [`server`] exposes the
//! commands over HTTP.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod commands;
pub mod config;
pub mod gateway;
pub mod handlers;
pub mod server;

pub use commands::{Command, CommandDispatcher, CommandError, Registered, Reply};
pub use config::{Config, ProviderConfig};
pub use gateway::{GatewayConverter, GatewayProducer, GatewayProvider};
pub use server::{create_router, start_server, AppState};
