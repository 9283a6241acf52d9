//! ACME certificate-authority client.
//!
//! The orderer only owns lifecycle bookkeeping; the actual
//! challenge/response protocol is behind [`CertificateAuthority`].
//! [`LetsEncryptAuthority`] implements it with HTTP-01 challenges: the
//! verified CNAME already routes the hostname to the platform edge, so the
//! CA's validation request lands on our own
//! `/.well-known/acme-challenge/{token}` endpoint.

use async_trait::async_trait;
use beacon_core::UtcDateTime;
use chrono::TimeZone;
use instant_acme::{
    Account, AccountCredentials, ChallengeType as AcmeChallengeType, Identifier, NewAccount,
    NewOrder, Order, OrderStatus,
};
use rcgen::{CertificateParams, DistinguishedName, KeyPair};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::errors::CaError;
use crate::store::DomainStore;

/// HTTP-01 challenge material to persist and serve.
#[derive(Debug, Clone)]
pub struct CaChallenge {
    pub token: String,
    pub key_authorization: String,
    /// The ACME validation URL to confirm once the token is servable
    pub validation_url: String,
}

#[derive(Debug, Clone)]
pub struct CaOrder {
    pub order_url: String,
    /// None when the CA considers the order ready without a new challenge
    /// (a recent authorization is still valid)
    pub challenge: Option<CaChallenge>,
}

#[derive(Debug, Clone)]
pub struct IssuedCertificate {
    pub certificate_pem: String,
    pub private_key_pem: String,
    pub expires_at: UtcDateTime,
}

#[derive(Debug, Clone)]
pub enum CaOrderState {
    Pending,
    Issued(Box<IssuedCertificate>),
    Failed { reason: String },
}

#[async_trait]
pub trait CertificateAuthority: Send + Sync {
    /// Create a new order for the domain and return its challenge material.
    async fn begin_order(&self, domain: &str) -> Result<CaOrder, CaError>;

    /// Tell the CA the challenge response is in place and may be validated.
    async fn confirm_challenge(&self, order_url: &str, validation_url: &str)
        -> Result<(), CaError>;

    /// Fetch the current state of an order, finalizing and downloading the
    /// certificate when the CA has validated the challenge.
    async fn check_order(&self, domain: &str, order_url: &str) -> Result<CaOrderState, CaError>;
}

/// Let's Encrypt client on instant-acme.
///
/// Account credentials are persisted through the store so registration
/// happens once per (email, environment). Environment is controlled by the
/// LETSENCRYPT_MODE env var (default: "production"); ACME_DIRECTORY_URL
/// overrides the directory for test CAs such as Pebble.
pub struct LetsEncryptAuthority {
    store: Arc<dyn DomainStore>,
    email: String,
    environment: String,
}

impl LetsEncryptAuthority {
    pub fn new(store: Arc<dyn DomainStore>, email: impl Into<String>) -> Self {
        let environment =
            std::env::var("LETSENCRYPT_MODE").unwrap_or_else(|_| "production".to_string());

        Self {
            store,
            email: email.into(),
            environment,
        }
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    fn directory_url(&self) -> String {
        if let Ok(custom_url) = std::env::var("ACME_DIRECTORY_URL") {
            return custom_url;
        }

        if self.environment == "production" {
            instant_acme::LetsEncrypt::Production.url().to_string()
        } else {
            instant_acme::LetsEncrypt::Staging.url().to_string()
        }
    }

    async fn get_or_create_account(&self) -> Result<Account, CaError> {
        if let Some(credentials_json) = self
            .store
            .find_acme_account(&self.email, &self.environment)
            .await
            .map_err(|e| CaError::Configuration(e.to_string()))?
        {
            let credentials: AccountCredentials = serde_json::from_str(&credentials_json)
                .map_err(|e| {
                    CaError::Configuration(format!("Failed to deserialize account: {}", e))
                })?;

            let account = Account::from_credentials(credentials)
                .await
                .map_err(|e| CaError::Transient(format!("Failed to load account: {}", e)))?;

            return Ok(account);
        }

        info!(
            "Creating ACME account for {} ({} environment)",
            self.email, self.environment
        );

        let acme_url = self.directory_url();
        let (account, credentials) = Account::create(
            &NewAccount {
                contact: &[format!("mailto:{}", self.email).as_str()],
                terms_of_service_agreed: true,
                only_return_existing: false,
            },
            &acme_url,
            None,
        )
        .await?;

        let credentials_json = serde_json::to_string(&credentials)
            .map_err(|e| CaError::Configuration(format!("Failed to serialize account: {}", e)))?;

        self.store
            .save_acme_account(&self.email, &self.environment, &credentials_json)
            .await
            .map_err(|e| CaError::Configuration(e.to_string()))?;

        Ok(account)
    }

    /// Generate a keypair, finalize the order with a CSR, and wait briefly
    /// for the certificate. The private key is persisted before the CSR
    /// leaves the process so a later poll can still complete the order.
    async fn finalize_order(
        &self,
        domain: &str,
        order: &mut Order,
    ) -> Result<CaOrderState, CaError> {
        let mut params = CertificateParams::new(vec![domain.to_string()])?;
        params.distinguished_name = DistinguishedName::new();

        let private_key = KeyPair::generate()?;
        let csr = params.serialize_request(&private_key)?;
        let private_key_pem = private_key.serialize_pem();

        let order_url = order.url().to_string();
        self.store
            .save_order_private_key(&order_url, &private_key_pem)
            .await
            .map_err(|e| CaError::Transient(format!("Failed to persist private key: {}", e)))?;

        order.finalize(csr.der()).await?;

        for _ in 0..15 {
            if let Some(cert_chain_pem) = order.certificate().await? {
                let expires_at = extract_expiration_time(&cert_chain_pem)?;
                info!("Certificate issued for {}", domain);
                return Ok(CaOrderState::Issued(Box::new(IssuedCertificate {
                    certificate_pem: cert_chain_pem,
                    private_key_pem,
                    expires_at,
                })));
            }
            tokio::time::sleep(Duration::from_secs(2)).await;
        }

        debug!(
            "Certificate for {} not ready after finalize; will complete on a later poll",
            domain
        );
        Ok(CaOrderState::Pending)
    }

    /// Download a certificate for an order we finalized on an earlier poll.
    async fn download_certificate(
        &self,
        domain: &str,
        order: &mut Order,
        order_url: &str,
    ) -> Result<CaOrderState, CaError> {
        let private_key_pem = match self
            .store
            .find_order_private_key(order_url)
            .await
            .map_err(|e| CaError::Transient(format!("Failed to load private key: {}", e)))?
        {
            Some(key) => key,
            None => {
                return Ok(CaOrderState::Failed {
                    reason: "order finalized but private key is missing".to_string(),
                })
            }
        };

        match order.certificate().await? {
            Some(cert_chain_pem) => {
                let expires_at = extract_expiration_time(&cert_chain_pem)?;
                info!("Certificate issued for {}", domain);
                Ok(CaOrderState::Issued(Box::new(IssuedCertificate {
                    certificate_pem: cert_chain_pem,
                    private_key_pem,
                    expires_at,
                })))
            }
            None => Ok(CaOrderState::Pending),
        }
    }
}

/// Bound on one CA interaction, including the post-finalize wait.
/// Exceeding it is a transient failure, not a verdict on the order.
const CA_CALL_TIMEOUT: Duration = Duration::from_secs(120);

#[async_trait]
impl CertificateAuthority for LetsEncryptAuthority {
    async fn begin_order(&self, domain: &str) -> Result<CaOrder, CaError> {
        tokio::time::timeout(CA_CALL_TIMEOUT, self.begin_order_inner(domain))
            .await
            .map_err(|_| {
                CaError::Transient(format!("ACME order request for {} timed out", domain))
            })?
    }

    async fn confirm_challenge(
        &self,
        order_url: &str,
        validation_url: &str,
    ) -> Result<(), CaError> {
        tokio::time::timeout(
            CA_CALL_TIMEOUT,
            self.confirm_challenge_inner(order_url, validation_url),
        )
        .await
        .map_err(|_| CaError::Transient("ACME challenge confirmation timed out".to_string()))?
    }

    async fn check_order(&self, domain: &str, order_url: &str) -> Result<CaOrderState, CaError> {
        tokio::time::timeout(CA_CALL_TIMEOUT, self.check_order_inner(domain, order_url))
            .await
            .map_err(|_| {
                CaError::Transient(format!("ACME order poll for {} timed out", domain))
            })?
    }
}

impl LetsEncryptAuthority {
    async fn begin_order_inner(&self, domain: &str) -> Result<CaOrder, CaError> {
        info!("Beginning ACME order for {}", domain);

        let account = self.get_or_create_account().await?;

        let identifiers = vec![Identifier::Dns(domain.to_string())];
        let mut order = account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await?;

        let order_url = order.url().to_string();

        // A still-valid authorization skips straight to Ready
        if order.state().status == OrderStatus::Ready {
            info!("Order for {} is already ready, no challenge needed", domain);
            return Ok(CaOrder {
                order_url,
                challenge: None,
            });
        }

        let authorizations = order.authorizations().await?;
        let authz = authorizations
            .first()
            .ok_or_else(|| CaError::Rejected("No authorizations found".to_string()))?;

        let challenge = authz
            .challenges
            .iter()
            .find(|c| c.r#type == AcmeChallengeType::Http01)
            .ok_or_else(|| CaError::Rejected("No HTTP-01 challenge offered".to_string()))?;

        let key_auth = order.key_authorization(challenge);

        debug!(
            "HTTP-01 challenge for {}: token {} will be served at /.well-known/acme-challenge/",
            domain, challenge.token
        );

        Ok(CaOrder {
            order_url,
            challenge: Some(CaChallenge {
                token: challenge.token.clone(),
                key_authorization: key_auth.as_str().to_string(),
                validation_url: challenge.url.clone(),
            }),
        })
    }

    async fn confirm_challenge_inner(
        &self,
        order_url: &str,
        validation_url: &str,
    ) -> Result<(), CaError> {
        let account = self.get_or_create_account().await?;
        let mut order = account.order(order_url.to_string()).await?;

        debug!("Setting challenge ready: {}", validation_url);
        order.set_challenge_ready(validation_url).await?;

        Ok(())
    }

    async fn check_order_inner(
        &self,
        domain: &str,
        order_url: &str,
    ) -> Result<CaOrderState, CaError> {
        let account = self.get_or_create_account().await?;
        let mut order = account.order(order_url.to_string()).await?;

        let status = order.refresh().await?.status;

        match status {
            OrderStatus::Pending | OrderStatus::Processing => Ok(CaOrderState::Pending),
            OrderStatus::Invalid => Ok(CaOrderState::Failed {
                reason: "order validation failed (challenge invalid or expired)".to_string(),
            }),
            OrderStatus::Ready => self.finalize_order(domain, &mut order).await,
            OrderStatus::Valid => self.download_certificate(domain, &mut order, order_url).await,
            _ => Ok(CaOrderState::Pending),
        }
    }
}

fn extract_expiration_time(cert_pem: &str) -> Result<UtcDateTime, CaError> {
    let (_, pem) = x509_parser::pem::parse_x509_pem(cert_pem.as_bytes())
        .map_err(|e| CaError::CertificateGeneration(format!("Failed to parse PEM: {}", e)))?;

    let x509 = pem
        .parse_x509()
        .map_err(|e| CaError::CertificateGeneration(format!("Failed to parse X509: {}", e)))?;

    let not_after = x509.validity().not_after;

    chrono::Utc
        .timestamp_opt(not_after.timestamp(), 0)
        .single()
        .ok_or_else(|| {
            CaError::CertificateGeneration("Invalid expiration timestamp".to_string())
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expiration_extraction_rejects_garbage() {
        let result = extract_expiration_time("not a certificate");
        assert!(matches!(result, Err(CaError::CertificateGeneration(_))));
    }

    #[test]
    fn test_expiration_extraction_from_generated_cert() {
        // Self-signed throwaway cert just to exercise the PEM path
        let key = KeyPair::generate().unwrap();
        let params = CertificateParams::new(vec!["status.example.com".to_string()]).unwrap();
        let cert = params.self_signed(&key).unwrap();

        let expires_at = extract_expiration_time(&cert.pem()).unwrap();
        assert!(expires_at > chrono::Utc::now());
    }
}
