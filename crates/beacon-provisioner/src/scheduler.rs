//! The provisioning sweep.
//!
//! Each sweep reads the three state buckets from the store and processes
//! every eligible domain on its own bounded task. A domain's failure never
//! aborts the sweep for the others, and overlapping sweeps cannot
//! double-apply a transition: the store's version check rejects the loser.

use beacon_core::{DomainEvent, DomainEventKind, DynDomainEventSink};
use beacon_domains::errors::{OrderError, StoreError, VerifyError};
use beacon_domains::orderer::{CertificateOrderer, OrderHandle, OrderStatus};
use beacon_domains::state::DomainTransition;
use beacon_domains::store::DomainStore;
use beacon_domains::verifier::CnameVerifier;
use beacon_entities::status_page_domains;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::backoff::BackoffPolicy;

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct ProvisionerConfig {
    /// Sweep cadence. The product copy promises provisioning "within the
    /// hour", which is a cadence hint, not a deadline.
    pub sweep_interval: Duration,
    /// Bound on concurrent per-domain tasks within one sweep
    pub worker_limit: usize,
    /// Backoff between verification attempts for one domain
    pub verify_backoff: BackoffPolicy,
    /// Maximum failed certificate orders per domain per rolling 24h;
    /// exhausting it emits a permanent-failure event and pauses ordering
    pub daily_order_budget: u32,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(60 * 60),
            worker_limit: 10,
            verify_backoff: BackoffPolicy::default(),
            daily_order_budget: 3,
        }
    }
}

/// Summary of one sweep, for logging.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SweepReport {
    pub checked: usize,
    pub verified: usize,
    pub still_unverified: usize,
    pub ordered: usize,
    pub provisioned: usize,
    pub order_failures: usize,
    pub permanent_failures: usize,
    pub skipped: usize,
    pub errors: usize,
}

/// What happened to a single domain during a sweep.
enum SweepAction {
    Verified,
    StillUnverified,
    Ordered,
    Provisioned,
    OrderFailed,
    PermanentFailure,
    Skipped,
    Error,
}

impl SweepReport {
    fn record(&mut self, action: SweepAction) {
        self.checked += 1;
        match action {
            SweepAction::Verified => self.verified += 1,
            SweepAction::StillUnverified => self.still_unverified += 1,
            SweepAction::Ordered => self.ordered += 1,
            SweepAction::Provisioned => self.provisioned += 1,
            SweepAction::OrderFailed => self.order_failures += 1,
            SweepAction::PermanentFailure => {
                self.order_failures += 1;
                self.permanent_failures += 1;
            }
            SweepAction::Skipped => self.skipped += 1,
            SweepAction::Error => self.errors += 1,
        }
    }
}

pub struct ProvisioningScheduler {
    store: Arc<dyn DomainStore>,
    verifier: Arc<dyn CnameVerifier>,
    orderer: Arc<CertificateOrderer>,
    event_sink: DynDomainEventSink,
    config: ProvisionerConfig,
}

impl ProvisioningScheduler {
    pub fn new(
        store: Arc<dyn DomainStore>,
        verifier: Arc<dyn CnameVerifier>,
        orderer: Arc<CertificateOrderer>,
        event_sink: DynDomainEventSink,
        config: ProvisionerConfig,
    ) -> Self {
        Self {
            store,
            verifier,
            orderer,
            event_sink,
            config,
        }
    }

    /// Start the periodic sweep loop. Runs until the task is dropped.
    pub async fn start(self: Arc<Self>) {
        info!(
            "Starting provisioning scheduler (interval: {:?})",
            self.config.sweep_interval
        );

        let mut interval = tokio::time::interval(self.config.sweep_interval);
        loop {
            interval.tick().await;
            let scheduler = self.clone();
            tokio::spawn(async move {
                match scheduler.run_sweep().await {
                    Ok(report) => {
                        if report.checked > 0 {
                            info!(
                                "Provisioning sweep: {} checked, {} verified, {} ordered, \
                                 {} provisioned, {} failed, {} skipped",
                                report.checked,
                                report.verified,
                                report.ordered,
                                report.provisioned,
                                report.order_failures,
                                report.skipped
                            );
                        } else {
                            debug!("Provisioning sweep completed: nothing to do");
                        }
                    }
                    Err(e) => {
                        error!("Provisioning sweep failed: {:?}", e);
                    }
                }
            });
        }
    }

    /// Run one sweep over all eligible domains.
    pub async fn run_sweep(&self) -> Result<SweepReport, SchedulerError> {
        debug!("Starting provisioning sweep");
        let now = Utc::now();

        let unverified = self.store.list_pending_verification().await?;
        let verified = self.store.list_verified_without_ssl().await?;
        let awaiting = self.store.list_awaiting_provisioning().await?;

        debug!(
            "Sweep buckets: {} unverified, {} awaiting order, {} awaiting issuance",
            unverified.len(),
            verified.len(),
            awaiting.len()
        );

        let semaphore = Arc::new(tokio::sync::Semaphore::new(self.config.worker_limit));
        let mut tasks = Vec::new();
        let mut report = SweepReport::default();

        for domain in unverified {
            if !self
                .config
                .verify_backoff
                .is_due(domain.last_checked_at, domain.retry_count, now)
            {
                report.record(SweepAction::Skipped);
                continue;
            }

            let store = self.store.clone();
            let verifier = self.verifier.clone();
            let sink = self.event_sink.clone();
            let permit = semaphore.clone().acquire_owned().await.unwrap();

            tasks.push(tokio::spawn(async move {
                let _permit = permit; // Hold permit until task completes
                Self::process_unverified(store, verifier, sink, domain).await
            }));
        }

        for domain in verified {
            let store = self.store.clone();
            let orderer = self.orderer.clone();
            let budget = self.config.daily_order_budget;
            let permit = semaphore.clone().acquire_owned().await.unwrap();

            tasks.push(tokio::spawn(async move {
                let _permit = permit;
                Self::process_verified(store, orderer, budget, domain).await
            }));
        }

        for domain in awaiting {
            let store = self.store.clone();
            let orderer = self.orderer.clone();
            let sink = self.event_sink.clone();
            let budget = self.config.daily_order_budget;
            let permit = semaphore.clone().acquire_owned().await.unwrap();

            tasks.push(tokio::spawn(async move {
                let _permit = permit;
                Self::process_ssl_pending(store, orderer, sink, budget, domain).await
            }));
        }

        for task in tasks {
            match task.await {
                Ok(action) => report.record(action),
                Err(e) => {
                    error!("Sweep task failed: {:?}", e);
                    report.checked += 1;
                    report.errors += 1;
                }
            }
        }

        debug!("Provisioning sweep completed");
        Ok(report)
    }

    /// Check one unverified domain's CNAME record.
    async fn process_unverified(
        store: Arc<dyn DomainStore>,
        verifier: Arc<dyn CnameVerifier>,
        sink: DynDomainEventSink,
        domain: status_page_domains::Model,
    ) -> SweepAction {
        let outcome = match verifier.verify(&domain.full_domain).await {
            Ok(outcome) => outcome,
            Err(VerifyError::Transient(msg)) => {
                warn!(
                    "Transient DNS failure for {} (attempt {}): {}",
                    domain.full_domain,
                    domain.retry_count + 1,
                    msg
                );
                // Record the attempt so the next check backs off
                return Self::apply(&store, domain.id, DomainTransition::VerificationFailed)
                    .await
                    .map(|_| SweepAction::StillUnverified)
                    .unwrap_or(SweepAction::Error);
            }
        };

        if !outcome.verified {
            debug!(
                "CNAME for {} not verified yet (observed: {:?})",
                domain.full_domain, outcome.observed_target
            );
            return Self::apply(&store, domain.id, DomainTransition::VerificationFailed)
                .await
                .map(|_| SweepAction::StillUnverified)
                .unwrap_or(SweepAction::Error);
        }

        match Self::apply(&store, domain.id, DomainTransition::CnameVerified).await {
            Ok(true) => {
                info!("CNAME verified for {}", domain.full_domain);
                Self::emit(
                    &sink,
                    DomainEvent::new(
                        domain.id,
                        domain.full_domain.clone(),
                        DomainEventKind::Verified,
                        "CNAME record verified",
                    ),
                )
                .await;
                SweepAction::Verified
            }
            Ok(false) => SweepAction::Skipped,
            Err(()) => SweepAction::Error,
        }
    }

    /// Order a certificate for a verified domain, respecting the daily
    /// budget.
    async fn process_verified(
        store: Arc<dyn DomainStore>,
        orderer: Arc<CertificateOrderer>,
        budget: u32,
        domain: status_page_domains::Model,
    ) -> SweepAction {
        let since = Utc::now() - chrono::Duration::hours(24);
        let failures = match store.count_failed_orders_since(domain.id, since).await {
            Ok(failures) => failures,
            Err(e) => {
                error!(
                    "Failed to read order history for {}: {}",
                    domain.full_domain, e
                );
                return SweepAction::Error;
            }
        };

        if failures >= budget as u64 {
            debug!(
                "Order budget exhausted for {} ({} failures in 24h); waiting",
                domain.full_domain, failures
            );
            return SweepAction::Skipped;
        }

        // A pending order that never reached the CA (crash mid-submission)
        // blocks the domain; fail it once it is stale so ordering can resume
        if let Ok(Some(existing)) = store.find_pending_order(domain.id).await {
            if existing.external_order_url.is_none()
                && Utc::now() - existing.requested_at > chrono::Duration::hours(1)
            {
                warn!(
                    "Clearing stale unsubmitted order {} for {}",
                    existing.id, domain.full_domain
                );
                if let Err(e) = store
                    .mark_order_failed(existing.id, "order was never submitted to the CA")
                    .await
                {
                    error!("Failed to clear stale order: {}", e);
                    return SweepAction::Error;
                }
            } else {
                return SweepAction::Skipped;
            }
        }

        match orderer.order(&domain).await {
            Ok(handle) => {
                info!(
                    "Certificate ordered for {} (order {})",
                    domain.full_domain, handle.order_id
                );
                SweepAction::Ordered
            }
            // A concurrent sweep or manual trigger got there first
            Err(OrderError::InvalidState(_)) => SweepAction::Skipped,
            Err(e) => {
                warn!("Ordering failed for {}: {}", domain.full_domain, e);
                SweepAction::OrderFailed
            }
        }
    }

    /// Poll the pending order of an SSL_PENDING domain.
    async fn process_ssl_pending(
        store: Arc<dyn DomainStore>,
        orderer: Arc<CertificateOrderer>,
        sink: DynDomainEventSink,
        budget: u32,
        domain: status_page_domains::Model,
    ) -> SweepAction {
        let order = match store.find_pending_order(domain.id).await {
            Ok(Some(order)) => order,
            Ok(None) => {
                // The flag says pending but no order exists; give the
                // domain back to the ordering bucket
                warn!(
                    "Domain {} is ssl_pending without a pending order; resetting",
                    domain.full_domain
                );
                return Self::apply(&store, domain.id, DomainTransition::CertificateFailed)
                    .await
                    .map(|_| SweepAction::OrderFailed)
                    .unwrap_or(SweepAction::Error);
            }
            Err(e) => {
                error!("Failed to load order for {}: {}", domain.full_domain, e);
                return SweepAction::Error;
            }
        };

        let handle = OrderHandle {
            order_id: order.id,
            domain_id: domain.id,
        };

        match orderer.poll_status(&handle).await {
            Ok(OrderStatus::Pending) => {
                debug!("Order {} for {} still pending", order.id, domain.full_domain);
                SweepAction::Skipped
            }
            Ok(OrderStatus::Issued) => {
                match Self::apply(&store, domain.id, DomainTransition::CertificateIssued).await {
                    Ok(true) => {
                        info!("Certificate provisioned for {}", domain.full_domain);
                        Self::emit(
                            &sink,
                            DomainEvent::new(
                                domain.id,
                                domain.full_domain.clone(),
                                DomainEventKind::Provisioned,
                                "TLS certificate issued and stored",
                            ),
                        )
                        .await;
                        SweepAction::Provisioned
                    }
                    Ok(false) => SweepAction::Skipped,
                    Err(()) => SweepAction::Error,
                }
            }
            Ok(OrderStatus::Failed { reason }) => {
                warn!(
                    "Certificate order {} for {} failed: {}",
                    order.id, domain.full_domain, reason
                );

                match Self::apply(&store, domain.id, DomainTransition::CertificateFailed).await {
                    Ok(true) => {}
                    Ok(false) => return SweepAction::Skipped,
                    Err(()) => return SweepAction::Error,
                }

                let since = Utc::now() - chrono::Duration::hours(24);
                let failures = store
                    .count_failed_orders_since(domain.id, since)
                    .await
                    .unwrap_or(0);

                if failures >= budget as u64 {
                    warn!(
                        "Order budget exhausted for {} after {} failures; operator attention required",
                        domain.full_domain, failures
                    );
                    Self::emit(
                        &sink,
                        DomainEvent::new(
                            domain.id,
                            domain.full_domain.clone(),
                            DomainEventKind::Failed,
                            format!(
                                "Certificate ordering failed {} times in 24h (last: {}); \
                                 automatic retries paused",
                                failures, reason
                            ),
                        ),
                    )
                    .await;
                    SweepAction::PermanentFailure
                } else {
                    SweepAction::OrderFailed
                }
            }
            Err(e) => {
                // Transient CA trouble; the order stays pending
                warn!(
                    "Polling order {} for {} failed: {}",
                    order.id, domain.full_domain, e
                );
                SweepAction::Error
            }
        }
    }

    /// Apply a transition, treating a lost optimistic-lock race or an
    /// already-applied edge as a benign skip.
    ///
    /// Returns Ok(true) when this sweep applied the edge, Ok(false) when a
    /// concurrent run did, Err(()) on real store trouble.
    async fn apply(
        store: &Arc<dyn DomainStore>,
        domain_id: i32,
        transition: DomainTransition,
    ) -> Result<bool, ()> {
        match store.apply_transition(domain_id, transition).await {
            Ok(_) => Ok(true),
            Err(StoreError::ConcurrentModification(_))
            | Err(StoreError::InvalidTransition { .. }) => {
                debug!(
                    "Transition {:?} for domain {} already applied by a concurrent run",
                    transition, domain_id
                );
                Ok(false)
            }
            Err(e) => {
                error!(
                    "Failed to apply {:?} to domain {}: {}",
                    transition, domain_id, e
                );
                Err(())
            }
        }
    }

    /// Fire-and-forget event emission; a broken sink never stalls a sweep.
    async fn emit(sink: &DynDomainEventSink, event: DomainEvent) {
        if let Err(e) = sink.emit(event).await {
            error!("Failed to emit domain event: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_domains::store::NewDomain;
    use beacon_domains::test_utils::{
        InMemoryDomainStore, RecordingEventSink, ScriptedCertificateAuthority, ScriptedLookup,
        StaticCnameVerifier,
    };

    struct Harness {
        store: Arc<InMemoryDomainStore>,
        verifier: Arc<StaticCnameVerifier>,
        ca: Arc<ScriptedCertificateAuthority>,
        sink: Arc<RecordingEventSink>,
        scheduler: ProvisioningScheduler,
    }

    fn harness(ca: ScriptedCertificateAuthority, config: ProvisionerConfig) -> Harness {
        let store = Arc::new(InMemoryDomainStore::new());
        let verifier = Arc::new(StaticCnameVerifier::new());
        let ca = Arc::new(ca);
        let sink = Arc::new(RecordingEventSink::new());
        let orderer = Arc::new(CertificateOrderer::new(store.clone(), ca.clone()));

        let scheduler = ProvisioningScheduler::new(
            store.clone(),
            verifier.clone(),
            orderer,
            sink.clone(),
            config,
        );

        Harness {
            store,
            verifier,
            ca,
            sink,
            scheduler,
        }
    }

    async fn add_domain(store: &Arc<InMemoryDomainStore>, subdomain: &str) -> i32 {
        store
            .create_domain(NewDomain {
                project_id: 1,
                status_page_id: 1,
                subdomain: subdomain.to_string(),
                base_domain: "example.com".to_string(),
            })
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn test_full_pipeline_unverified_to_provisioned() {
        let h = harness(
            ScriptedCertificateAuthority::issuing(),
            ProvisionerConfig::default(),
        );
        let domain_id = add_domain(&h.store, "status").await;
        h.verifier.set(
            "status.example.com",
            ScriptedLookup::Verified("pages.beacon.sh".to_string()),
        );

        // Sweep 1: verify
        let report = h.scheduler.run_sweep().await.unwrap();
        assert_eq!(report.verified, 1);

        // Sweep 2: order
        let report = h.scheduler.run_sweep().await.unwrap();
        assert_eq!(report.ordered, 1);

        // Sweep 3: poll, issue, provision
        let report = h.scheduler.run_sweep().await.unwrap();
        assert_eq!(report.provisioned, 1);

        let domain = h.store.find_domain(domain_id).await.unwrap().unwrap();
        assert!(domain.cname_verified);
        assert!(domain.ssl_ordered);
        assert!(domain.ssl_provisioned);

        let kinds: Vec<DomainEventKind> = h.sink.events().iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![DomainEventKind::Verified, DomainEventKind::Provisioned]
        );

        // A provisioned domain drops out of every bucket
        let report = h.scheduler.run_sweep().await.unwrap();
        assert_eq!(report.checked, 0);
        assert_eq!(h.sink.events().len(), 2);
    }

    #[tokio::test]
    async fn test_missing_cname_increments_retry_and_backs_off() {
        let h = harness(
            ScriptedCertificateAuthority::issuing(),
            ProvisionerConfig::default(),
        );
        let domain_id = add_domain(&h.store, "status").await;
        // No scripted lookup: definitive NXDOMAIN

        let report = h.scheduler.run_sweep().await.unwrap();
        assert_eq!(report.still_unverified, 1);

        let domain = h.store.find_domain(domain_id).await.unwrap().unwrap();
        assert!(!domain.cname_verified);
        assert_eq!(domain.retry_count, 1);
        assert!(h.sink.events().is_empty());

        // An immediate second sweep is inside the backoff window
        let report = h.scheduler.run_sweep().await.unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(h.verifier.verify_calls(), 1);

        // After the window elapses the domain is checked again
        h.store
            .age_last_check(domain_id, chrono::Duration::hours(2));
        let report = h.scheduler.run_sweep().await.unwrap();
        assert_eq!(report.still_unverified, 1);
        assert_eq!(h.verifier.verify_calls(), 2);

        let domain = h.store.find_domain(domain_id).await.unwrap().unwrap();
        assert_eq!(domain.retry_count, 2);
    }

    #[tokio::test]
    async fn test_transient_resolver_error_counts_as_attempt() {
        let h = harness(
            ScriptedCertificateAuthority::issuing(),
            ProvisionerConfig::default(),
        );
        let domain_id = add_domain(&h.store, "status").await;
        h.verifier.set(
            "status.example.com",
            ScriptedLookup::Transient("resolver timed out".to_string()),
        );

        let report = h.scheduler.run_sweep().await.unwrap();
        assert_eq!(report.still_unverified, 1);

        let domain = h.store.find_domain(domain_id).await.unwrap().unwrap();
        assert_eq!(domain.retry_count, 1);
        assert!(h.sink.events().is_empty());
    }

    #[tokio::test]
    async fn test_domain_failures_are_isolated() {
        let h = harness(
            ScriptedCertificateAuthority::issuing(),
            ProvisionerConfig::default(),
        );
        let broken_id = add_domain(&h.store, "broken").await;
        let healthy_id = add_domain(&h.store, "healthy").await;

        h.verifier.set(
            "broken.example.com",
            ScriptedLookup::Transient("SERVFAIL".to_string()),
        );
        h.verifier.set(
            "healthy.example.com",
            ScriptedLookup::Verified("pages.beacon.sh".to_string()),
        );

        let report = h.scheduler.run_sweep().await.unwrap();
        assert_eq!(report.checked, 2);
        assert_eq!(report.verified, 1);
        assert_eq!(report.still_unverified, 1);

        let healthy = h.store.find_domain(healthy_id).await.unwrap().unwrap();
        assert!(healthy.cname_verified);
        let broken = h.store.find_domain(broken_id).await.unwrap().unwrap();
        assert!(!broken.cname_verified);
    }

    #[tokio::test]
    async fn test_order_budget_exhaustion_emits_permanent_failure() {
        let config = ProvisionerConfig {
            daily_order_budget: 3,
            ..Default::default()
        };
        let h = harness(ScriptedCertificateAuthority::failing("challenge expired"), config);
        let domain_id = add_domain(&h.store, "status").await;
        h.verifier.set(
            "status.example.com",
            ScriptedLookup::Verified("pages.beacon.sh".to_string()),
        );

        // Sweep 1 verifies; sweeps then alternate order -> poll/fail.
        h.scheduler.run_sweep().await.unwrap();

        for _ in 0..3 {
            let report = h.scheduler.run_sweep().await.unwrap();
            assert_eq!(report.ordered, 1);

            let report = h.scheduler.run_sweep().await.unwrap();
            assert_eq!(report.order_failures, 1);

            // Each failure returns the domain to VERIFIED
            let domain = h.store.find_domain(domain_id).await.unwrap().unwrap();
            assert!(domain.cname_verified);
            assert!(!domain.ssl_ordered);
        }

        // The exhausting failure emitted exactly one permanent-failure event
        let failed_events: Vec<_> = h
            .sink
            .events()
            .into_iter()
            .filter(|e| e.kind == DomainEventKind::Failed)
            .collect();
        assert_eq!(failed_events.len(), 1);

        // Ordering is paused while the budget is exhausted
        let begin_calls = h.ca.begin_calls();
        let report = h.scheduler.run_sweep().await.unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(h.ca.begin_calls(), begin_calls);
        assert_eq!(
            h.sink
                .events()
                .iter()
                .filter(|e| e.kind == DomainEventKind::Failed)
                .count(),
            1
        );

        // Once the failures age out of the window, ordering resumes
        h.store.age_orders(domain_id, chrono::Duration::hours(25));
        let report = h.scheduler.run_sweep().await.unwrap();
        assert_eq!(report.ordered, 1);
    }

    #[tokio::test]
    async fn test_pending_order_stays_pending_on_hanging_ca() {
        let h = harness(
            ScriptedCertificateAuthority::hanging(),
            ProvisionerConfig::default(),
        );
        let domain_id = add_domain(&h.store, "status").await;
        h.verifier.set(
            "status.example.com",
            ScriptedLookup::Verified("pages.beacon.sh".to_string()),
        );

        h.scheduler.run_sweep().await.unwrap(); // verify
        h.scheduler.run_sweep().await.unwrap(); // order

        let report = h.scheduler.run_sweep().await.unwrap(); // poll: pending
        assert_eq!(report.skipped, 1);

        let domain = h.store.find_domain(domain_id).await.unwrap().unwrap();
        assert!(domain.ssl_ordered);
        assert!(!domain.ssl_provisioned);
        assert!(h
            .store
            .find_pending_order(domain_id)
            .await
            .unwrap()
            .is_some());
    }
}
