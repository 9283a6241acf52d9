use super::types::{
    ChangeHostnameRequest, CreateDomainRequest, DomainAppState, DomainResponse, ListDomainsQuery,
    ListDomainsResponse, OrderSslResponse, VerifyCnameResponse,
};
use crate::errors::{CaError, OrderError, StoreError, VerifyError};
use crate::state::DomainTransition;
use crate::store::NewDomain;
use beacon_core::error_builder::ErrorBuilder;
use beacon_core::problemdetails::Problem;
use beacon_core::{DomainEvent, DomainEventKind};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post, put},
    Json, Router,
};
use std::sync::Arc;
use tracing::{error, info};
use utoipa::OpenApi;

// Convert StoreError to Problem for consistent error handling
impl From<StoreError> for Problem {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::NotFound(msg) => ErrorBuilder::new(StatusCode::NOT_FOUND)
                .title("Resource Not Found")
                .detail(msg)
                .build(),
            StoreError::DuplicateEntry(msg) => ErrorBuilder::new(StatusCode::CONFLICT)
                .title("Duplicate Entry")
                .detail(msg)
                .build(),
            StoreError::InvalidData(msg) => ErrorBuilder::new(StatusCode::BAD_REQUEST)
                .title("Invalid Data")
                .detail(msg)
                .build(),
            StoreError::InvalidTransition { .. } | StoreError::InvalidFlags { .. } => {
                ErrorBuilder::new(StatusCode::CONFLICT)
                    .title("Invalid Transition")
                    .detail(error.to_string())
                    .build()
            }
            StoreError::ConcurrentModification(id) => ErrorBuilder::new(StatusCode::CONFLICT)
                .title("Concurrent Modification")
                .detail(format!(
                    "Domain {} was modified concurrently, please retry",
                    id
                ))
                .build(),
            StoreError::Database(msg) => ErrorBuilder::new(StatusCode::INTERNAL_SERVER_ERROR)
                .title("Database Error")
                .detail(msg)
                .build(),
            StoreError::Connection(msg) => ErrorBuilder::new(StatusCode::INTERNAL_SERVER_ERROR)
                .title("Database Connection Error")
                .detail(msg)
                .build(),
            StoreError::Internal(msg) => ErrorBuilder::new(StatusCode::INTERNAL_SERVER_ERROR)
                .title("Internal Error")
                .detail(msg)
                .build(),
        }
    }
}

// Convert VerifyError to Problem
impl From<VerifyError> for Problem {
    fn from(error: VerifyError) -> Self {
        match error {
            VerifyError::Transient(msg) => ErrorBuilder::new(StatusCode::BAD_GATEWAY)
                .title("DNS Lookup Failed")
                .detail(format!("{}. Please try again in a few minutes.", msg))
                .build(),
        }
    }
}

// Convert OrderError to Problem
impl From<OrderError> for Problem {
    fn from(error: OrderError) -> Self {
        match error {
            OrderError::InvalidState(msg) => ErrorBuilder::new(StatusCode::CONFLICT)
                .title("Invalid State")
                .detail(msg)
                .build(),
            OrderError::NotFound(msg) => ErrorBuilder::new(StatusCode::NOT_FOUND)
                .title("Resource Not Found")
                .detail(msg)
                .build(),
            OrderError::Store(e) => Problem::from(e),
            OrderError::Ca(e) => Problem::from(e),
        }
    }
}

// Convert CaError to Problem
impl From<CaError> for Problem {
    fn from(error: CaError) -> Self {
        match error {
            CaError::Transient(msg) => ErrorBuilder::new(StatusCode::BAD_GATEWAY)
                .title("Certificate Authority Unreachable")
                .detail(format!("{}. Please try again in a few minutes.", msg))
                .build(),
            CaError::Rejected(msg) => ErrorBuilder::new(StatusCode::BAD_REQUEST)
                .title("Certificate Authority Rejection")
                .detail(msg)
                .build(),
            CaError::Configuration(msg) => ErrorBuilder::new(StatusCode::BAD_REQUEST)
                .title("Configuration Error")
                .detail(msg)
                .build(),
            CaError::CertificateGeneration(msg) => {
                ErrorBuilder::new(StatusCode::INTERNAL_SERVER_ERROR)
                    .title("Certificate Generation Error")
                    .detail(msg)
                    .build()
            }
        }
    }
}

#[derive(OpenApi)]
#[openapi(
    paths(
        create_domain,
        list_domains,
        get_domain,
        change_hostname,
        delete_domain,
        verify_cname,
        order_ssl
    ),
    components(
        schemas(
            CreateDomainRequest,
            ChangeHostnameRequest,
            DomainResponse,
            ListDomainsResponse,
            VerifyCnameResponse,
            OrderSslResponse
        )
    ),
    info(
        title = "Custom Domains API",
        description = "API endpoints for status-page custom domains: CNAME \
        verification and SSL certificate provisioning.",
        version = "1.0.0"
    ),
    tags(
        (name = "Domains", description = "Custom domain management endpoints")
    )
)]
pub struct DomainApiDoc;

/// Create a new custom domain
///
/// The domain starts unverified; the provisioning sweep (or a manual
/// verify-cname call) moves it forward once the CNAME record is in place.
#[utoipa::path(
    post,
    path = "/domains",
    request_body = CreateDomainRequest,
    responses(
        (status = 201, description = "Domain created successfully", body = DomainResponse),
        (status = 400, description = "Invalid input"),
        (status = 409, description = "Domain already exists"),
        (status = 500, description = "Internal server error")
    ),
    tag = "Domains"
)]
async fn create_domain(
    State(app_state): State<Arc<DomainAppState>>,
    Json(request): Json<CreateDomainRequest>,
) -> Result<impl IntoResponse, Problem> {
    let domain = app_state
        .store
        .create_domain(NewDomain {
            project_id: request.project_id,
            status_page_id: request.status_page_id,
            subdomain: request.subdomain,
            base_domain: request.base_domain,
        })
        .await?;

    Ok((StatusCode::CREATED, Json(DomainResponse::from(domain))))
}

/// List custom domains
#[utoipa::path(
    get,
    path = "/domains",
    params(
        ("status_page_id" = Option<i32>, Query, description = "Filter by status page")
    ),
    responses(
        (status = 200, description = "Domains retrieved successfully", body = ListDomainsResponse),
        (status = 500, description = "Internal server error")
    ),
    tag = "Domains"
)]
async fn list_domains(
    State(app_state): State<Arc<DomainAppState>>,
    Query(query): Query<ListDomainsQuery>,
) -> Result<impl IntoResponse, Problem> {
    let domains = app_state.store.list_domains(query.status_page_id).await?;

    Ok(Json(ListDomainsResponse {
        domains: domains.into_iter().map(DomainResponse::from).collect(),
    }))
}

/// Get a custom domain by ID
///
/// The response carries the domain's current state flags; provisioning
/// errors are never surfaced here.
#[utoipa::path(
    get,
    path = "/domains/{id}",
    responses(
        (status = 200, description = "Domain retrieved successfully", body = DomainResponse),
        (status = 404, description = "Domain not found")
    ),
    tag = "Domains"
)]
async fn get_domain(
    State(app_state): State<Arc<DomainAppState>>,
    Path(id): Path<i32>,
) -> Result<impl IntoResponse + std::fmt::Debug, Problem> {
    let domain = app_state
        .store
        .find_domain(id)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("Domain {}", id)))?;

    Ok(Json(DomainResponse::from(domain)))
}

/// Change a domain's hostname
///
/// Changing the subdomain or base domain resets verification from scratch:
/// all provisioning flags are cleared and the domain returns to the
/// unverified state.
#[utoipa::path(
    put,
    path = "/domains/{id}/hostname",
    request_body = ChangeHostnameRequest,
    responses(
        (status = 200, description = "Hostname changed", body = DomainResponse),
        (status = 400, description = "Invalid hostname"),
        (status = 404, description = "Domain not found"),
        (status = 409, description = "Hostname already in use")
    ),
    tag = "Domains"
)]
async fn change_hostname(
    State(app_state): State<Arc<DomainAppState>>,
    Path(id): Path<i32>,
    Json(request): Json<ChangeHostnameRequest>,
) -> Result<impl IntoResponse, Problem> {
    let domain = app_state
        .store
        .change_hostname(id, &request.subdomain, &request.base_domain)
        .await?;

    Ok(Json(DomainResponse::from(domain)))
}

/// Delete a custom domain
#[utoipa::path(
    delete,
    path = "/domains/{id}",
    responses(
        (status = 204, description = "Domain deleted"),
        (status = 404, description = "Domain not found")
    ),
    tag = "Domains"
)]
async fn delete_domain(
    State(app_state): State<Arc<DomainAppState>>,
    Path(id): Path<i32>,
) -> Result<impl IntoResponse, Problem> {
    app_state.store.soft_delete_domain(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Manually trigger CNAME verification
///
/// Same contract as the periodic sweep: a definitive negative answer comes
/// back as `verified: false` (and advances the retry counter), while
/// resolver trouble is reported as a 502 so the caller can retry.
#[utoipa::path(
    post,
    path = "/domains/{id}/verify-cname",
    responses(
        (status = 200, description = "Verification attempted", body = VerifyCnameResponse),
        (status = 404, description = "Domain not found"),
        (status = 409, description = "Domain is already verified"),
        (status = 502, description = "DNS resolver unavailable")
    ),
    tag = "Domains"
)]
async fn verify_cname(
    State(app_state): State<Arc<DomainAppState>>,
    Path(id): Path<i32>,
) -> Result<impl IntoResponse + std::fmt::Debug, Problem> {
    let domain = app_state
        .store
        .find_domain(id)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("Domain {}", id)))?;

    if domain.cname_verified {
        return Err(ErrorBuilder::new(StatusCode::CONFLICT)
            .title("Invalid Transition")
            .detail(format!("Domain {} is already verified", domain.full_domain))
            .build());
    }

    info!("Manual CNAME verification requested for {}", domain.full_domain);

    let outcome = app_state.verifier.verify(&domain.full_domain).await?;

    let transition = if outcome.verified {
        DomainTransition::CnameVerified
    } else {
        DomainTransition::VerificationFailed
    };
    let updated = app_state.store.apply_transition(domain.id, transition).await?;

    if outcome.verified {
        let event = DomainEvent::new(
            updated.id,
            updated.full_domain.clone(),
            DomainEventKind::Verified,
            "CNAME record verified",
        );
        if let Err(e) = app_state.event_sink.emit(event).await {
            error!("Failed to emit verification event: {}", e);
        }
    }

    Ok(Json(VerifyCnameResponse {
        verified: outcome.verified,
        observed_target: outcome.observed_target,
        domain: DomainResponse::from(updated),
    }))
}

/// Manually order an SSL certificate
///
/// Same preconditions as the periodic sweep: the domain must be verified
/// and have no outstanding pending order.
#[utoipa::path(
    post,
    path = "/domains/{id}/order-ssl",
    responses(
        (status = 201, description = "Certificate order created", body = OrderSslResponse),
        (status = 404, description = "Domain not found"),
        (status = 409, description = "Domain not verified or order already pending"),
        (status = 502, description = "Certificate authority unreachable")
    ),
    tag = "Domains"
)]
async fn order_ssl(
    State(app_state): State<Arc<DomainAppState>>,
    Path(id): Path<i32>,
) -> Result<impl IntoResponse + std::fmt::Debug, Problem> {
    let domain = app_state
        .store
        .find_domain(id)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("Domain {}", id)))?;

    info!("Manual SSL order requested for {}", domain.full_domain);

    let handle = app_state.orderer.order(&domain).await?;

    let updated = app_state
        .store
        .find_domain(id)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("Domain {}", id)))?;

    Ok((
        StatusCode::CREATED,
        Json(OrderSslResponse {
            order_id: handle.order_id,
            domain: DomainResponse::from(updated),
        }),
    ))
}

/// Serve an HTTP-01 challenge response
///
/// The CA resolves the domain's CNAME to our edge and fetches the key
/// authorization from here during validation.
async fn acme_challenge(
    State(app_state): State<Arc<DomainAppState>>,
    Path(token): Path<String>,
) -> Result<impl IntoResponse + std::fmt::Debug, Problem> {
    let order = app_state
        .store
        .find_pending_order_by_token(&token)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("Challenge {}", token)))?;

    let key_authorization = order.key_authorization.ok_or_else(|| {
        StoreError::NotFound(format!("Challenge {} has no key authorization", token))
    })?;

    Ok(key_authorization)
}

pub fn configure_routes() -> Router<Arc<DomainAppState>> {
    Router::new()
        .route("/domains", post(create_domain))
        .route("/domains", get(list_domains))
        .route("/domains/{id}", get(get_domain))
        .route("/domains/{id}", delete(delete_domain))
        .route("/domains/{id}/hostname", put(change_hostname))
        .route("/domains/{id}/verify-cname", post(verify_cname))
        .route("/domains/{id}/order-ssl", post(order_ssl))
        .route(
            "/.well-known/acme-challenge/{token}",
            get(acme_challenge),
        )
}
