//! Domain lifecycle events and the sink they are delivered through.
//!
//! The provisioning workflow reports state changes (CNAME verified,
//! certificate provisioned, permanent failure) through an injected
//! [`DomainEventSink`]. Delivery is best-effort: callers log sink errors
//! and move on, so a broken notification channel can never stall a sweep.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainEvent {
    pub id: String,
    pub domain_id: i32,
    pub hostname: String,
    pub kind: DomainEventKind,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DomainEventKind {
    /// CNAME record confirmed to point at the canonical target
    Verified,
    /// TLS certificate issued and stored
    Provisioned,
    /// Retry budget exhausted, operator attention required
    Failed,
}

impl DomainEvent {
    pub fn new(
        domain_id: i32,
        hostname: impl Into<String>,
        kind: DomainEventKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            domain_id,
            hostname: hostname.into(),
            kind,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EventSinkError {
    #[error("Failed to deliver event: {0}")]
    Delivery(String),

    #[error("Sink unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait DomainEventSink: Send + Sync {
    async fn emit(&self, event: DomainEvent) -> Result<(), EventSinkError>;
}

pub type DynDomainEventSink = Arc<dyn DomainEventSink>;

/// Default sink that records events as structured log lines.
///
/// Email and webhook sinks live outside this workspace and implement the
/// same trait.
pub struct TracingEventSink;

#[async_trait]
impl DomainEventSink for TracingEventSink {
    async fn emit(&self, event: DomainEvent) -> Result<(), EventSinkError> {
        match event.kind {
            DomainEventKind::Failed => warn!(
                domain_id = event.domain_id,
                hostname = %event.hostname,
                event_id = %event.id,
                "domain event: {:?} - {}",
                event.kind,
                event.message
            ),
            _ => info!(
                domain_id = event.domain_id,
                hostname = %event.hostname,
                event_id = %event.id,
                "domain event: {:?} - {}",
                event.kind,
                event.message
            ),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_carries_fresh_id() {
        let a = DomainEvent::new(1, "status.example.com", DomainEventKind::Verified, "ok");
        let b = DomainEvent::new(1, "status.example.com", DomainEventKind::Verified, "ok");
        assert_ne!(a.id, b.id);
        assert_eq!(a.domain_id, 1);
    }

    #[tokio::test]
    async fn test_tracing_sink_accepts_events() {
        let sink = TracingEventSink;
        let event = DomainEvent::new(7, "status.example.com", DomainEventKind::Failed, "budget");
        assert!(sink.emit(event).await.is_ok());
    }
}
