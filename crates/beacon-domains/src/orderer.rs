//! Certificate-order lifecycle bookkeeping.
//!
//! `order` is only legal for a VERIFIED domain with no outstanding pending
//! order; anything else is a precondition violation surfaced as
//! `OrderError::InvalidState` and never retried. `poll_status` is
//! idempotent: terminal orders report their recorded status without
//! touching the CA again.

use beacon_entities::status_page_domains;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use crate::ca::{CaOrderState, CertificateAuthority};
use crate::errors::{CaError, OrderError};
use crate::state::{DomainState, DomainTransition};
use crate::store::DomainStore;

/// Reference to one certificate-issuance attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderHandle {
    pub order_id: i32,
    pub domain_id: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderStatus {
    Pending,
    Issued,
    Failed { reason: String },
}

pub struct CertificateOrderer {
    store: Arc<dyn DomainStore>,
    ca: Arc<dyn CertificateAuthority>,
}

impl CertificateOrderer {
    pub fn new(store: Arc<dyn DomainStore>, ca: Arc<dyn CertificateAuthority>) -> Self {
        Self { store, ca }
    }

    /// Create a certificate order for a verified domain.
    ///
    /// Creates the pending CertificateOrder record, submits the order to
    /// the CA, persists the HTTP-01 challenge so the edge can serve it,
    /// confirms the challenge, and moves the domain to SSL_PENDING.
    pub async fn order(
        &self,
        domain: &status_page_domains::Model,
    ) -> Result<OrderHandle, OrderError> {
        let state = DomainState::from_flags(
            domain.cname_verified,
            domain.ssl_ordered,
            domain.ssl_provisioned,
        )?;

        if state != DomainState::Verified {
            return Err(OrderError::InvalidState(format!(
                "SSL can only be ordered for a verified domain without a pending order \
                 (domain {} is {})",
                domain.full_domain,
                state.as_str()
            )));
        }

        if self.store.find_pending_order(domain.id).await?.is_some() {
            return Err(OrderError::InvalidState(format!(
                "Domain {} already has a pending certificate order",
                domain.full_domain
            )));
        }

        let order = self.store.create_pending_order(domain.id).await?;
        info!(
            "Ordering certificate for {} (order {})",
            domain.full_domain, order.id
        );

        let ca_order = match self.ca.begin_order(&domain.full_domain).await {
            Ok(ca_order) => ca_order,
            Err(e) => {
                self.store
                    .mark_order_failed(order.id, &e.to_string())
                    .await?;
                return Err(OrderError::Ca(e));
            }
        };

        let challenge = ca_order.challenge.as_ref();
        self.store
            .record_order_submitted(
                order.id,
                &ca_order.order_url,
                challenge.map(|c| c.token.as_str()),
                challenge.map(|c| c.key_authorization.as_str()),
                challenge.map(|c| c.validation_url.as_str()),
            )
            .await?;

        // The challenge is persisted and servable; let the CA validate it
        if let Some(challenge) = challenge {
            if let Err(e) = self
                .ca
                .confirm_challenge(&ca_order.order_url, &challenge.validation_url)
                .await
            {
                self.store
                    .mark_order_failed(order.id, &e.to_string())
                    .await?;
                return Err(OrderError::Ca(e));
            }
        }

        self.store
            .apply_transition(domain.id, DomainTransition::SslOrdered)
            .await?;

        Ok(OrderHandle {
            order_id: order.id,
            domain_id: domain.id,
        })
    }

    /// Check the state of an order, recording issuance or failure.
    ///
    /// Side-effect-free beyond bookkeeping: on `issued` the certificate and
    /// encrypted private key are stored and `provisioned_at` is stamped;
    /// failed orders record their reason. State-machine transitions are the
    /// caller's responsibility.
    pub async fn poll_status(&self, handle: &OrderHandle) -> Result<OrderStatus, OrderError> {
        let order = self
            .store
            .find_order(handle.order_id)
            .await?
            .ok_or_else(|| {
                OrderError::NotFound(format!("Certificate order {}", handle.order_id))
            })?;

        match order.status.as_str() {
            "issued" => return Ok(OrderStatus::Issued),
            "failed" => {
                return Ok(OrderStatus::Failed {
                    reason: order
                        .failure_reason
                        .unwrap_or_else(|| "unknown failure".to_string()),
                })
            }
            _ => {}
        }

        let domain = self
            .store
            .find_domain(handle.domain_id)
            .await?
            .ok_or_else(|| OrderError::NotFound(format!("Domain {}", handle.domain_id)))?;

        let order_url = match order.external_order_url.as_deref() {
            Some(url) => url,
            None => {
                let reason = "order was never submitted to the CA";
                self.store.mark_order_failed(order.id, reason).await?;
                return Ok(OrderStatus::Failed {
                    reason: reason.to_string(),
                });
            }
        };

        match self.ca.check_order(&domain.full_domain, order_url).await {
            Ok(CaOrderState::Pending) => Ok(OrderStatus::Pending),
            Ok(CaOrderState::Issued(cert)) => {
                self.store
                    .mark_order_issued(order.id, &cert.certificate_pem, &cert.private_key_pem)
                    .await?;
                Ok(OrderStatus::Issued)
            }
            Ok(CaOrderState::Failed { reason }) => {
                self.store.mark_order_failed(order.id, &reason).await?;
                Ok(OrderStatus::Failed { reason })
            }
            Err(CaError::Rejected(reason)) => {
                self.store.mark_order_failed(order.id, &reason).await?;
                Ok(OrderStatus::Failed { reason })
            }
            Err(e) => {
                // Transient CA trouble; the order stays pending for the
                // next sweep
                warn!(
                    "Polling order {} for {} failed: {}",
                    order.id, domain.full_domain, e
                );
                Err(OrderError::Ca(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{InMemoryDomainStore, ScriptedCertificateAuthority};
    use crate::store::NewDomain;

    fn new_domain() -> NewDomain {
        NewDomain {
            project_id: 1,
            status_page_id: 1,
            subdomain: "status".to_string(),
            base_domain: "example.com".to_string(),
        }
    }

    #[tokio::test]
    async fn test_order_requires_verified_domain() {
        let store = Arc::new(InMemoryDomainStore::new());
        let ca = Arc::new(ScriptedCertificateAuthority::issuing());
        let orderer = CertificateOrderer::new(store.clone(), ca);

        let domain = store.create_domain(new_domain()).await.unwrap();

        let result = orderer.order(&domain).await;
        assert!(matches!(result, Err(OrderError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_order_moves_domain_to_ssl_pending() {
        let store = Arc::new(InMemoryDomainStore::new());
        let ca = Arc::new(ScriptedCertificateAuthority::issuing());
        let orderer = CertificateOrderer::new(store.clone(), ca);

        let domain = store.create_domain(new_domain()).await.unwrap();
        let domain = store
            .apply_transition(domain.id, DomainTransition::CnameVerified)
            .await
            .unwrap();

        let handle = orderer.order(&domain).await.unwrap();

        let domain = store.find_domain(domain.id).await.unwrap().unwrap();
        assert!(domain.ssl_ordered);
        assert!(!domain.ssl_provisioned);

        let order = store.find_order(handle.order_id).await.unwrap().unwrap();
        assert_eq!(order.status, "pending");
        assert!(order.external_order_url.is_some());
        assert!(order.challenge_token.is_some());
    }

    #[tokio::test]
    async fn test_second_order_while_pending_is_invalid_state() {
        let store = Arc::new(InMemoryDomainStore::new());
        let ca = Arc::new(ScriptedCertificateAuthority::issuing());
        let orderer = CertificateOrderer::new(store.clone(), ca);

        let domain = store.create_domain(new_domain()).await.unwrap();
        let domain = store
            .apply_transition(domain.id, DomainTransition::CnameVerified)
            .await
            .unwrap();

        orderer.order(&domain).await.unwrap();

        // Re-load: the domain is now SSL_PENDING
        let domain = store.find_domain(domain.id).await.unwrap().unwrap();
        let result = orderer.order(&domain).await;
        assert!(matches!(result, Err(OrderError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_poll_records_issuance_and_is_idempotent() {
        let store = Arc::new(InMemoryDomainStore::new());
        let ca = Arc::new(ScriptedCertificateAuthority::issuing());
        let orderer = CertificateOrderer::new(store.clone(), ca.clone());

        let domain = store.create_domain(new_domain()).await.unwrap();
        let domain = store
            .apply_transition(domain.id, DomainTransition::CnameVerified)
            .await
            .unwrap();
        let handle = orderer.order(&domain).await.unwrap();

        let status = orderer.poll_status(&handle).await.unwrap();
        assert_eq!(status, OrderStatus::Issued);

        let order = store.find_order(handle.order_id).await.unwrap().unwrap();
        assert_eq!(order.status, "issued");
        assert!(order.provisioned_at.is_some());
        assert!(order.certificate_pem.is_some());

        // Polling a terminal order does not hit the CA again
        let status = orderer.poll_status(&handle).await.unwrap();
        assert_eq!(status, OrderStatus::Issued);
        assert_eq!(ca.check_calls(), 1);
    }

    #[tokio::test]
    async fn test_poll_records_failure_reason() {
        let store = Arc::new(InMemoryDomainStore::new());
        let ca = Arc::new(ScriptedCertificateAuthority::failing("challenge expired"));
        let orderer = CertificateOrderer::new(store.clone(), ca);

        let domain = store.create_domain(new_domain()).await.unwrap();
        let domain = store
            .apply_transition(domain.id, DomainTransition::CnameVerified)
            .await
            .unwrap();
        let handle = orderer.order(&domain).await.unwrap();

        let status = orderer.poll_status(&handle).await.unwrap();
        assert_eq!(
            status,
            OrderStatus::Failed {
                reason: "challenge expired".to_string()
            }
        );

        let order = store.find_order(handle.order_id).await.unwrap().unwrap();
        assert_eq!(order.status, "failed");
        assert_eq!(order.failure_reason.as_deref(), Some("challenge expired"));
    }

    #[tokio::test]
    async fn test_ca_rejection_at_submission_fails_the_order() {
        let store = Arc::new(InMemoryDomainStore::new());
        let ca = Arc::new(ScriptedCertificateAuthority::rejecting_submission(
            "rate limited",
        ));
        let orderer = CertificateOrderer::new(store.clone(), ca);

        let domain = store.create_domain(new_domain()).await.unwrap();
        let domain = store
            .apply_transition(domain.id, DomainTransition::CnameVerified)
            .await
            .unwrap();

        let result = orderer.order(&domain).await;
        assert!(matches!(result, Err(OrderError::Ca(_))));

        // The failed attempt is recorded and counts toward the budget
        let since = chrono::Utc::now() - chrono::Duration::hours(24);
        assert_eq!(
            store
                .count_failed_orders_since(domain.id, since)
                .await
                .unwrap(),
            1
        );

        // The domain did not move to SSL_PENDING
        let domain = store.find_domain(domain.id).await.unwrap().unwrap();
        assert!(!domain.ssl_ordered);
    }
}
