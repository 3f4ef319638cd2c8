//! Core domain types for chapter discovery and delivery.
//!
//! Provides strongly-typed identifiers, the job and artifact models shared by
//! the delivery and discovery crates, the persistent store interfaces, a
//! clock abstraction for deterministic tests, and the token registry used by
//! the command surface.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod models;
pub mod registry;
pub mod sink;
pub mod storage;
pub mod time;

pub use error::{CoreError, EnqueueError, Result};
pub use models::{
    ArtifactEntry, ArtifactHandle, ContentCard, ContentRef, ItemRef, Job, JobId, OutputFormat,
    OutputFormats, RecipientId, SeriesRef, Subscription,
};
pub use registry::{Token, TokenRegistry};
pub use sink::JobSink;
pub use time::{Clock, RealClock, TestClock};
