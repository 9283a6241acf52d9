//! Custom types for common data structures

use chrono::{DateTime as ChronoDateTime, Utc};

/// Database DateTime type used across all Beacon crates
///
/// This is the canonical datetime type for TIMESTAMPTZ columns.
pub type DBDateTime = ChronoDateTime<Utc>;

/// Standard UTC DateTime type used across all Beacon crates
///
/// This is the canonical datetime type for API responses (serializes as
/// ISO 8601 with 'Z' suffix: `2025-10-12T12:15:47.609192Z`) and database
/// TIMESTAMPTZ columns.
///
/// # OpenAPI Schema
/// When using with utoipa, add the schema attribute:
/// ```rust,ignore
/// #[schema(value_type = String, format = DateTime)]
/// pub field: UtcDateTime,
/// ```
pub type UtcDateTime = ChronoDateTime<Utc>;
