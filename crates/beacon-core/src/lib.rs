//! Core utilities and types shared across all Beacon crates

pub mod error;
pub mod error_builder;
pub mod events;
pub mod problemdetails;
pub use problemdetails::ProblemDetails;
pub mod types;
mod encryption;

// Re-export commonly used types
pub use error::*;
pub use error_builder::*;
pub use events::*;

// Re-export external dependencies
pub use anyhow;
pub use async_trait;
pub use chrono;
pub use serde;
pub use serde_json;
pub use thiserror;
pub use tokio;
pub use tracing;
pub use uuid;

pub use encryption::EncryptionService;

// Re-export standard datetime type for use across all crates
pub use types::{DBDateTime, UtcDateTime};
