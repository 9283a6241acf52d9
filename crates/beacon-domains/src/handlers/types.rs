use crate::{CertificateOrderer, CnameVerifier, DomainStore};
use beacon_core::DynDomainEventSink;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use utoipa::ToSchema;

use crate::state::DomainState;

pub struct DomainAppState {
    pub store: Arc<dyn DomainStore>,
    pub verifier: Arc<dyn CnameVerifier>,
    pub orderer: Arc<CertificateOrderer>,
    pub event_sink: DynDomainEventSink,
}

pub fn create_domain_app_state(
    store: Arc<dyn DomainStore>,
    verifier: Arc<dyn CnameVerifier>,
    orderer: Arc<CertificateOrderer>,
    event_sink: DynDomainEventSink,
) -> Arc<DomainAppState> {
    Arc::new(DomainAppState {
        store,
        verifier,
        orderer,
        event_sink,
    })
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct CreateDomainRequest {
    pub project_id: i32,
    pub status_page_id: i32,
    /// Subdomain label, e.g. "status"
    pub subdomain: String,
    /// Base domain, e.g. "example.com"
    pub base_domain: String,
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct ChangeHostnameRequest {
    pub subdomain: String,
    pub base_domain: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct DomainResponse {
    pub id: i32,
    pub project_id: i32,
    pub status_page_id: i32,
    pub subdomain: String,
    pub base_domain: String,
    pub full_domain: String,
    /// Derived provisioning state: unverified, verified, ssl_pending,
    /// provisioned
    pub state: String,
    pub cname_verified: bool,
    pub ssl_ordered: bool,
    pub ssl_provisioned: bool,
    pub retry_count: i32,
    pub last_checked_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl From<beacon_entities::status_page_domains::Model> for DomainResponse {
    fn from(domain: beacon_entities::status_page_domains::Model) -> Self {
        let state = DomainState::from_flags(
            domain.cname_verified,
            domain.ssl_ordered,
            domain.ssl_provisioned,
        )
        .map(|s| s.as_str().to_string())
        .unwrap_or_else(|_| "invalid".to_string());

        Self {
            id: domain.id,
            project_id: domain.project_id,
            status_page_id: domain.status_page_id,
            subdomain: domain.subdomain,
            base_domain: domain.base_domain,
            full_domain: domain.full_domain,
            state,
            cname_verified: domain.cname_verified,
            ssl_ordered: domain.ssl_ordered,
            ssl_provisioned: domain.ssl_provisioned,
            retry_count: domain.retry_count,
            last_checked_at: domain.last_checked_at.map(|dt| dt.timestamp_millis()),
            created_at: domain.created_at.timestamp_millis(),
            updated_at: domain.updated_at.timestamp_millis(),
        }
    }
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct ListDomainsResponse {
    pub domains: Vec<DomainResponse>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct VerifyCnameResponse {
    pub verified: bool,
    /// The CNAME target the resolver actually observed, if any
    pub observed_target: Option<String>,
    pub domain: DomainResponse,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct OrderSslResponse {
    pub order_id: i32,
    pub domain: DomainResponse,
}

#[derive(Deserialize)]
pub struct ListDomainsQuery {
    pub status_page_id: Option<i32>,
}
