//! CNAME verification for custom domains.
//!
//! A domain is considered routed to the platform once its CNAME record
//! resolves to the canonical target (e.g. `pages.beacon.sh`). Lookups are
//! pure queries: a missing or mismatched record is a definitive negative
//! answer, while resolver failures and timeouts surface as transient
//! errors so callers retry them with backoff instead of treating the
//! domain as unroutable.

use async_trait::async_trait;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::error::ResolveErrorKind;
use hickory_resolver::TokioAsyncResolver;
use std::time::Duration;
use tracing::debug;

use crate::errors::VerifyError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationOutcome {
    pub verified: bool,
    /// The CNAME target actually observed, if any record resolved
    pub observed_target: Option<String>,
}

#[async_trait]
pub trait CnameVerifier: Send + Sync {
    async fn verify(&self, hostname: &str) -> Result<VerificationOutcome, VerifyError>;
}

/// CNAME verifier backed by a caching hickory resolver.
pub struct DnsCnameVerifier {
    resolver: TokioAsyncResolver,
    expected_target: String,
    lookup_timeout: Duration,
}

impl DnsCnameVerifier {
    /// Create a verifier using Cloudflare's DNS servers.
    ///
    /// `expected_target` is the canonical routing hostname configured for
    /// the whole installation.
    pub fn new(expected_target: impl Into<String>) -> Self {
        let mut options = ResolverOpts::default();
        options.cache_size = 256;
        options.try_tcp_on_error = true;
        options.use_hosts_file = false;

        let resolver = TokioAsyncResolver::tokio(ResolverConfig::cloudflare(), options);

        Self {
            resolver,
            expected_target: normalize(&expected_target.into()),
            lookup_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_lookup_timeout(mut self, timeout: Duration) -> Self {
        self.lookup_timeout = timeout;
        self
    }

    pub fn expected_target(&self) -> &str {
        &self.expected_target
    }
}

#[async_trait]
impl CnameVerifier for DnsCnameVerifier {
    async fn verify(&self, hostname: &str) -> Result<VerificationOutcome, VerifyError> {
        debug!(
            "Verifying CNAME record: {} -> {}",
            hostname, self.expected_target
        );

        let lookup = tokio::time::timeout(
            self.lookup_timeout,
            self.resolver
                .lookup(hostname, hickory_resolver::proto::rr::RecordType::CNAME),
        )
        .await
        .map_err(|_| {
            VerifyError::Transient(format!(
                "CNAME lookup for {} timed out after {:?}",
                hostname, self.lookup_timeout
            ))
        })?;

        match lookup {
            Ok(lookup) => {
                let mut observed_target = None;

                for record in lookup.iter() {
                    if let Some(cname) = record.as_cname() {
                        let target = normalize(&cname.to_string());
                        debug!("Found CNAME record: {} -> {}", hostname, target);

                        if target.eq_ignore_ascii_case(&self.expected_target) {
                            return Ok(VerificationOutcome {
                                verified: true,
                                observed_target: Some(target),
                            });
                        }

                        observed_target = Some(target);
                    }
                }

                debug!(
                    "CNAME records found for {} but none match the expected target",
                    hostname
                );
                Ok(VerificationOutcome {
                    verified: false,
                    observed_target,
                })
            }
            Err(e) => match e.kind() {
                // NXDOMAIN and NOERROR-without-records both mean the
                // operator has not (yet) created the record
                ResolveErrorKind::NoRecordsFound { .. } => {
                    debug!("No CNAME record found for {}: {}", hostname, e);
                    Ok(VerificationOutcome {
                        verified: false,
                        observed_target: None,
                    })
                }
                _ => Err(VerifyError::Transient(format!(
                    "CNAME lookup failed for {}: {}",
                    hostname, e
                ))),
            },
        }
    }
}

/// Lowercase and strip the trailing dot DNS answers carry.
fn normalize(name: &str) -> String {
    name.trim_end_matches('.').to_ascii_lowercase()
}
