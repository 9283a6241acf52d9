//! Persistent domain state and certificate-order bookkeeping.
//!
//! All provisioning-flag changes go through [`DomainStore::apply_transition`],
//! which validates the edge against the state machine and applies it with a
//! compare-and-set on the record's `version` column. Two sweeps racing on
//! the same domain therefore cannot double-apply a transition: the loser's
//! update matches zero rows and comes back as `ConcurrentModification`.

use async_trait::async_trait;
use beacon_core::{EncryptionService, UtcDateTime};
use beacon_database::DbConnection;
use beacon_entities::{acme_accounts, certificate_orders, status_page_domains};
use chrono::Utc;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder,
};
use std::sync::Arc;
use tracing::{debug, info};

use crate::errors::StoreError;
use crate::state::{DomainState, DomainTransition};

/// Input for creating a new custom domain (flags start all false).
#[derive(Debug, Clone)]
pub struct NewDomain {
    pub project_id: i32,
    pub status_page_id: i32,
    pub subdomain: String,
    pub base_domain: String,
}

#[async_trait]
pub trait DomainStore: Send + Sync {
    // Domain CRUD
    async fn create_domain(
        &self,
        new: NewDomain,
    ) -> Result<status_page_domains::Model, StoreError>;
    async fn find_domain(
        &self,
        id: i32,
    ) -> Result<Option<status_page_domains::Model>, StoreError>;
    async fn find_domain_by_hostname(
        &self,
        hostname: &str,
    ) -> Result<Option<status_page_domains::Model>, StoreError>;
    async fn list_domains(
        &self,
        status_page_id: Option<i32>,
    ) -> Result<Vec<status_page_domains::Model>, StoreError>;
    async fn change_hostname(
        &self,
        id: i32,
        subdomain: &str,
        base_domain: &str,
    ) -> Result<status_page_domains::Model, StoreError>;
    async fn soft_delete_domain(&self, id: i32) -> Result<(), StoreError>;

    // Query-by-state operations for the provisioning sweep
    async fn list_pending_verification(
        &self,
    ) -> Result<Vec<status_page_domains::Model>, StoreError>;
    async fn list_verified_without_ssl(
        &self,
    ) -> Result<Vec<status_page_domains::Model>, StoreError>;
    async fn list_awaiting_provisioning(
        &self,
    ) -> Result<Vec<status_page_domains::Model>, StoreError>;

    // State machine
    async fn apply_transition(
        &self,
        domain_id: i32,
        transition: DomainTransition,
    ) -> Result<status_page_domains::Model, StoreError>;

    // Certificate orders
    async fn create_pending_order(
        &self,
        domain_id: i32,
    ) -> Result<certificate_orders::Model, StoreError>;
    async fn find_order(
        &self,
        order_id: i32,
    ) -> Result<Option<certificate_orders::Model>, StoreError>;
    async fn find_pending_order(
        &self,
        domain_id: i32,
    ) -> Result<Option<certificate_orders::Model>, StoreError>;
    async fn find_pending_order_by_token(
        &self,
        token: &str,
    ) -> Result<Option<certificate_orders::Model>, StoreError>;
    async fn record_order_submitted(
        &self,
        order_id: i32,
        external_order_url: &str,
        challenge_token: Option<&str>,
        key_authorization: Option<&str>,
        validation_url: Option<&str>,
    ) -> Result<certificate_orders::Model, StoreError>;
    async fn save_order_private_key(
        &self,
        external_order_url: &str,
        private_key_pem: &str,
    ) -> Result<(), StoreError>;
    async fn find_order_private_key(
        &self,
        external_order_url: &str,
    ) -> Result<Option<String>, StoreError>;
    async fn mark_order_issued(
        &self,
        order_id: i32,
        certificate_pem: &str,
        private_key_pem: &str,
    ) -> Result<certificate_orders::Model, StoreError>;
    async fn mark_order_failed(
        &self,
        order_id: i32,
        reason: &str,
    ) -> Result<certificate_orders::Model, StoreError>;
    async fn count_failed_orders_since(
        &self,
        domain_id: i32,
        since: UtcDateTime,
    ) -> Result<u64, StoreError>;

    // ACME account persistence (credentials JSON per email + environment)
    async fn save_acme_account(
        &self,
        email: &str,
        environment: &str,
        credentials: &str,
    ) -> Result<(), StoreError>;
    async fn find_acme_account(
        &self,
        email: &str,
        environment: &str,
    ) -> Result<Option<String>, StoreError>;
}

pub struct PostgresDomainStore {
    db: Arc<DbConnection>,
    encryption_service: Arc<EncryptionService>,
}

impl PostgresDomainStore {
    pub fn new(db: Arc<DbConnection>, encryption_service: Arc<EncryptionService>) -> Self {
        Self {
            db,
            encryption_service,
        }
    }
}

/// Compute the full hostname from its parts (`status` + `example.com`
/// becomes `status.example.com`).
pub fn full_domain(subdomain: &str, base_domain: &str) -> String {
    format!(
        "{}.{}",
        subdomain.trim().to_ascii_lowercase(),
        base_domain.trim().trim_end_matches('.').to_ascii_lowercase()
    )
}

fn is_valid_label(label: &str) -> bool {
    if label.is_empty() || label.len() > 63 {
        return false;
    }

    if !label.chars().all(|c| c.is_alphanumeric() || c == '-') {
        return false;
    }

    !label.starts_with('-') && !label.ends_with('-')
}

/// Validate the subdomain label and base domain of a candidate hostname.
pub fn validate_hostname(subdomain: &str, base_domain: &str) -> Result<(), StoreError> {
    let subdomain = subdomain.trim().to_ascii_lowercase();
    let base_domain = base_domain
        .trim()
        .trim_end_matches('.')
        .to_ascii_lowercase();

    if !is_valid_label(&subdomain) {
        return Err(StoreError::InvalidData(format!(
            "Invalid subdomain label: {}",
            subdomain
        )));
    }

    let parts: Vec<&str> = base_domain.split('.').collect();
    if parts.len() < 2 || !parts.iter().all(|p| is_valid_label(p)) {
        return Err(StoreError::InvalidData(format!(
            "Invalid base domain: {}",
            base_domain
        )));
    }

    if subdomain.len() + 1 + base_domain.len() > 253 {
        return Err(StoreError::InvalidData(format!(
            "Hostname too long: {}.{}",
            subdomain, base_domain
        )));
    }

    Ok(())
}

impl PostgresDomainStore {
    fn live() -> sea_orm::Condition {
        sea_orm::Condition::all()
            .add(status_page_domains::Column::DeletedAt.is_null())
    }
}

#[async_trait]
impl DomainStore for PostgresDomainStore {
    async fn create_domain(
        &self,
        new: NewDomain,
    ) -> Result<status_page_domains::Model, StoreError> {
        validate_hostname(&new.subdomain, &new.base_domain)?;
        let hostname = full_domain(&new.subdomain, &new.base_domain);

        info!("Creating custom domain: {}", hostname);

        if self.find_domain_by_hostname(&hostname).await?.is_some() {
            return Err(StoreError::DuplicateEntry(format!(
                "Domain {} already exists",
                hostname
            )));
        }

        let domain = status_page_domains::ActiveModel {
            project_id: Set(new.project_id),
            status_page_id: Set(new.status_page_id),
            subdomain: Set(new.subdomain.trim().to_ascii_lowercase()),
            base_domain: Set(new
                .base_domain
                .trim()
                .trim_end_matches('.')
                .to_ascii_lowercase()),
            full_domain: Set(hostname.clone()),
            cname_verified: Set(false),
            ssl_ordered: Set(false),
            ssl_provisioned: Set(false),
            last_checked_at: Set(None),
            retry_count: Set(0),
            version: Set(0),
            deleted_at: Set(None),
            ..Default::default()
        };

        let domain = domain.insert(self.db.as_ref()).await?;

        debug!("Domain created: {} with ID {}", hostname, domain.id);
        Ok(domain)
    }

    async fn find_domain(
        &self,
        id: i32,
    ) -> Result<Option<status_page_domains::Model>, StoreError> {
        let domain = status_page_domains::Entity::find_by_id(id)
            .filter(Self::live())
            .one(self.db.as_ref())
            .await?;
        Ok(domain)
    }

    async fn find_domain_by_hostname(
        &self,
        hostname: &str,
    ) -> Result<Option<status_page_domains::Model>, StoreError> {
        let domain = status_page_domains::Entity::find()
            .filter(status_page_domains::Column::FullDomain.eq(hostname))
            .filter(Self::live())
            .one(self.db.as_ref())
            .await?;
        Ok(domain)
    }

    async fn list_domains(
        &self,
        status_page_id: Option<i32>,
    ) -> Result<Vec<status_page_domains::Model>, StoreError> {
        let mut query = status_page_domains::Entity::find().filter(Self::live());

        if let Some(page_id) = status_page_id {
            query = query.filter(status_page_domains::Column::StatusPageId.eq(page_id));
        }

        let domains = query
            .order_by_asc(status_page_domains::Column::Id)
            .all(self.db.as_ref())
            .await?;
        Ok(domains)
    }

    async fn change_hostname(
        &self,
        id: i32,
        subdomain: &str,
        base_domain: &str,
    ) -> Result<status_page_domains::Model, StoreError> {
        validate_hostname(subdomain, base_domain)?;
        let hostname = full_domain(subdomain, base_domain);

        let domain = self
            .find_domain(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("Domain {}", id)))?;

        if domain.full_domain == hostname {
            return Ok(domain);
        }

        if self.find_domain_by_hostname(&hostname).await?.is_some() {
            return Err(StoreError::DuplicateEntry(format!(
                "Domain {} already exists",
                hostname
            )));
        }

        info!(
            "Changing hostname of domain {} from {} to {}; verification restarts",
            id, domain.full_domain, hostname
        );

        let now = Utc::now();
        let result = status_page_domains::Entity::update_many()
            .col_expr(
                status_page_domains::Column::Subdomain,
                Expr::value(subdomain.trim().to_ascii_lowercase()),
            )
            .col_expr(
                status_page_domains::Column::BaseDomain,
                Expr::value(
                    base_domain
                        .trim()
                        .trim_end_matches('.')
                        .to_ascii_lowercase(),
                ),
            )
            .col_expr(
                status_page_domains::Column::FullDomain,
                Expr::value(hostname),
            )
            .col_expr(status_page_domains::Column::CnameVerified, Expr::value(false))
            .col_expr(status_page_domains::Column::SslOrdered, Expr::value(false))
            .col_expr(
                status_page_domains::Column::SslProvisioned,
                Expr::value(false),
            )
            .col_expr(status_page_domains::Column::RetryCount, Expr::value(0))
            .col_expr(
                status_page_domains::Column::Version,
                Expr::value(domain.version + 1),
            )
            .col_expr(status_page_domains::Column::UpdatedAt, Expr::value(now))
            .filter(status_page_domains::Column::Id.eq(id))
            .filter(status_page_domains::Column::Version.eq(domain.version))
            .exec(self.db.as_ref())
            .await?;

        if result.rows_affected == 0 {
            return Err(StoreError::ConcurrentModification(id));
        }

        self.find_domain(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("Domain {}", id)))
    }

    async fn soft_delete_domain(&self, id: i32) -> Result<(), StoreError> {
        let domain = self
            .find_domain(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("Domain {}", id)))?;

        info!("Soft-deleting domain {} ({})", id, domain.full_domain);

        let mut active: status_page_domains::ActiveModel = domain.into();
        active.deleted_at = Set(Some(Utc::now()));
        active.update(self.db.as_ref()).await?;

        Ok(())
    }

    async fn list_pending_verification(
        &self,
    ) -> Result<Vec<status_page_domains::Model>, StoreError> {
        let domains = status_page_domains::Entity::find()
            .filter(Self::live())
            .filter(status_page_domains::Column::CnameVerified.eq(false))
            .order_by_asc(status_page_domains::Column::Id)
            .all(self.db.as_ref())
            .await?;
        Ok(domains)
    }

    async fn list_verified_without_ssl(
        &self,
    ) -> Result<Vec<status_page_domains::Model>, StoreError> {
        let domains = status_page_domains::Entity::find()
            .filter(Self::live())
            .filter(status_page_domains::Column::CnameVerified.eq(true))
            .filter(status_page_domains::Column::SslOrdered.eq(false))
            .order_by_asc(status_page_domains::Column::Id)
            .all(self.db.as_ref())
            .await?;
        Ok(domains)
    }

    async fn list_awaiting_provisioning(
        &self,
    ) -> Result<Vec<status_page_domains::Model>, StoreError> {
        let domains = status_page_domains::Entity::find()
            .filter(Self::live())
            .filter(status_page_domains::Column::SslOrdered.eq(true))
            .filter(status_page_domains::Column::SslProvisioned.eq(false))
            .order_by_asc(status_page_domains::Column::Id)
            .all(self.db.as_ref())
            .await?;
        Ok(domains)
    }

    async fn apply_transition(
        &self,
        domain_id: i32,
        transition: DomainTransition,
    ) -> Result<status_page_domains::Model, StoreError> {
        let domain = self
            .find_domain(domain_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("Domain {}", domain_id)))?;

        let current = DomainState::from_flags(
            domain.cname_verified,
            domain.ssl_ordered,
            domain.ssl_provisioned,
        )?;
        let next = current.apply(transition)?;

        debug!(
            "Applying {:?} to domain {} ({}): {:?} -> {:?}",
            transition, domain_id, domain.full_domain, current, next
        );

        let (cname_verified, ssl_ordered, ssl_provisioned) = next.flags();
        let now = Utc::now();

        let mut update = status_page_domains::Entity::update_many()
            .col_expr(
                status_page_domains::Column::CnameVerified,
                Expr::value(cname_verified),
            )
            .col_expr(
                status_page_domains::Column::SslOrdered,
                Expr::value(ssl_ordered),
            )
            .col_expr(
                status_page_domains::Column::SslProvisioned,
                Expr::value(ssl_provisioned),
            )
            .col_expr(
                status_page_domains::Column::Version,
                Expr::value(domain.version + 1),
            )
            .col_expr(status_page_domains::Column::UpdatedAt, Expr::value(now));

        match transition {
            DomainTransition::CnameVerified => {
                update = update
                    .col_expr(status_page_domains::Column::RetryCount, Expr::value(0))
                    .col_expr(
                        status_page_domains::Column::LastCheckedAt,
                        Expr::value(Some(now)),
                    );
            }
            DomainTransition::VerificationFailed => {
                update = update
                    .col_expr(
                        status_page_domains::Column::RetryCount,
                        Expr::value(domain.retry_count + 1),
                    )
                    .col_expr(
                        status_page_domains::Column::LastCheckedAt,
                        Expr::value(Some(now)),
                    );
            }
            DomainTransition::HostnameChanged => {
                update = update
                    .col_expr(status_page_domains::Column::RetryCount, Expr::value(0));
            }
            _ => {}
        }

        let result = update
            .filter(status_page_domains::Column::Id.eq(domain_id))
            .filter(status_page_domains::Column::Version.eq(domain.version))
            .exec(self.db.as_ref())
            .await?;

        if result.rows_affected == 0 {
            return Err(StoreError::ConcurrentModification(domain_id));
        }

        self.find_domain(domain_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("Domain {}", domain_id)))
    }

    async fn create_pending_order(
        &self,
        domain_id: i32,
    ) -> Result<certificate_orders::Model, StoreError> {
        if self.find_pending_order(domain_id).await?.is_some() {
            return Err(StoreError::DuplicateEntry(format!(
                "Domain {} already has a pending certificate order",
                domain_id
            )));
        }

        let order = certificate_orders::ActiveModel {
            domain_id: Set(domain_id),
            status: Set("pending".to_string()),
            requested_at: Set(Utc::now()),
            ..Default::default()
        };

        let order = order.insert(self.db.as_ref()).await?;
        debug!(
            "Created pending certificate order {} for domain {}",
            order.id, domain_id
        );
        Ok(order)
    }

    async fn find_order(
        &self,
        order_id: i32,
    ) -> Result<Option<certificate_orders::Model>, StoreError> {
        let order = certificate_orders::Entity::find_by_id(order_id)
            .one(self.db.as_ref())
            .await?;
        Ok(order)
    }

    async fn find_pending_order(
        &self,
        domain_id: i32,
    ) -> Result<Option<certificate_orders::Model>, StoreError> {
        let order = certificate_orders::Entity::find()
            .filter(certificate_orders::Column::DomainId.eq(domain_id))
            .filter(certificate_orders::Column::Status.eq("pending"))
            .one(self.db.as_ref())
            .await?;
        Ok(order)
    }

    async fn find_pending_order_by_token(
        &self,
        token: &str,
    ) -> Result<Option<certificate_orders::Model>, StoreError> {
        let order = certificate_orders::Entity::find()
            .filter(certificate_orders::Column::ChallengeToken.eq(token))
            .filter(certificate_orders::Column::Status.eq("pending"))
            .one(self.db.as_ref())
            .await?;
        Ok(order)
    }

    async fn record_order_submitted(
        &self,
        order_id: i32,
        external_order_url: &str,
        challenge_token: Option<&str>,
        key_authorization: Option<&str>,
        validation_url: Option<&str>,
    ) -> Result<certificate_orders::Model, StoreError> {
        let order = self
            .find_order(order_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("Certificate order {}", order_id)))?;

        let mut active: certificate_orders::ActiveModel = order.into();
        active.external_order_url = Set(Some(external_order_url.to_string()));
        active.challenge_token = Set(challenge_token.map(String::from));
        active.key_authorization = Set(key_authorization.map(String::from));
        active.validation_url = Set(validation_url.map(String::from));

        let order = active.update(self.db.as_ref()).await?;
        Ok(order)
    }

    async fn save_order_private_key(
        &self,
        external_order_url: &str,
        private_key_pem: &str,
    ) -> Result<(), StoreError> {
        let order = certificate_orders::Entity::find()
            .filter(certificate_orders::Column::ExternalOrderUrl.eq(external_order_url))
            .one(self.db.as_ref())
            .await?
            .ok_or_else(|| {
                StoreError::NotFound(format!("Certificate order for {}", external_order_url))
            })?;

        let encrypted = self
            .encryption_service
            .encrypt_string(private_key_pem)
            .map_err(|e| StoreError::Internal(format!("Failed to encrypt private key: {}", e)))?;

        let mut active: certificate_orders::ActiveModel = order.into();
        active.private_key_pem = Set(Some(encrypted));
        active.update(self.db.as_ref()).await?;

        Ok(())
    }

    async fn find_order_private_key(
        &self,
        external_order_url: &str,
    ) -> Result<Option<String>, StoreError> {
        let order = certificate_orders::Entity::find()
            .filter(certificate_orders::Column::ExternalOrderUrl.eq(external_order_url))
            .one(self.db.as_ref())
            .await?;

        match order.and_then(|o| o.private_key_pem) {
            Some(encrypted) => {
                let decrypted = self
                    .encryption_service
                    .decrypt_string(&encrypted)
                    .map_err(|e| {
                        StoreError::Internal(format!("Failed to decrypt private key: {}", e))
                    })?;
                Ok(Some(decrypted))
            }
            None => Ok(None),
        }
    }

    async fn mark_order_issued(
        &self,
        order_id: i32,
        certificate_pem: &str,
        private_key_pem: &str,
    ) -> Result<certificate_orders::Model, StoreError> {
        let order = self
            .find_order(order_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("Certificate order {}", order_id)))?;

        let encrypted = self
            .encryption_service
            .encrypt_string(private_key_pem)
            .map_err(|e| StoreError::Internal(format!("Failed to encrypt private key: {}", e)))?;

        let mut active: certificate_orders::ActiveModel = order.into();
        active.status = Set("issued".to_string());
        active.certificate_pem = Set(Some(certificate_pem.to_string()));
        active.private_key_pem = Set(Some(encrypted));
        active.failure_reason = Set(None);
        active.provisioned_at = Set(Some(Utc::now()));

        let order = active.update(self.db.as_ref()).await?;
        info!(
            "Certificate order {} issued for domain {}",
            order.id, order.domain_id
        );
        Ok(order)
    }

    async fn mark_order_failed(
        &self,
        order_id: i32,
        reason: &str,
    ) -> Result<certificate_orders::Model, StoreError> {
        let order = self
            .find_order(order_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("Certificate order {}", order_id)))?;

        let mut active: certificate_orders::ActiveModel = order.into();
        active.status = Set("failed".to_string());
        active.failure_reason = Set(Some(reason.to_string()));

        let order = active.update(self.db.as_ref()).await?;
        info!(
            "Certificate order {} failed for domain {}: {}",
            order.id, order.domain_id, reason
        );
        Ok(order)
    }

    async fn count_failed_orders_since(
        &self,
        domain_id: i32,
        since: UtcDateTime,
    ) -> Result<u64, StoreError> {
        let count = certificate_orders::Entity::find()
            .filter(certificate_orders::Column::DomainId.eq(domain_id))
            .filter(certificate_orders::Column::Status.eq("failed"))
            .filter(certificate_orders::Column::RequestedAt.gte(since))
            .count(self.db.as_ref())
            .await?;
        Ok(count)
    }

    async fn save_acme_account(
        &self,
        email: &str,
        environment: &str,
        credentials: &str,
    ) -> Result<(), StoreError> {
        let account = acme_accounts::ActiveModel {
            email: Set(email.to_string()),
            environment: Set(environment.to_string()),
            credentials: Set(credentials.to_string()),
            ..Default::default()
        };

        account.insert(self.db.as_ref()).await?;
        Ok(())
    }

    async fn find_acme_account(
        &self,
        email: &str,
        environment: &str,
    ) -> Result<Option<String>, StoreError> {
        let account = acme_accounts::Entity::find()
            .filter(acme_accounts::Column::Email.eq(email))
            .filter(acme_accounts::Column::Environment.eq(environment))
            .one(self.db.as_ref())
            .await?;
        Ok(account.map(|a| a.credentials))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_database::test_utils::TestDatabase;
    use beacon_entities::status_pages;

    #[test]
    fn test_full_domain_normalization() {
        assert_eq!(
            full_domain(" Status ", "Example.COM."),
            "status.example.com"
        );
    }

    #[test]
    fn test_hostname_validation() {
        assert!(validate_hostname("status", "example.com").is_ok());
        assert!(validate_hostname("my-status", "example.co.uk").is_ok());

        assert!(validate_hostname("", "example.com").is_err());
        assert!(validate_hostname("-status", "example.com").is_err());
        assert!(validate_hostname("status-", "example.com").is_err());
        assert!(validate_hostname("status", "example").is_err());
        assert!(validate_hostname("status", ".example.com").is_err());
        assert!(validate_hostname("st_atus", "example.com").is_err());
    }

    // The shared test container truncates tables on setup; serialize the
    // database tests in this binary so they cannot wipe each other's rows
    static DB_TEST_LOCK: tokio::sync::Mutex<()> = tokio::sync::Mutex::const_new(());

    async fn setup() -> (
        tokio::sync::MutexGuard<'static, ()>,
        TestDatabase,
        PostgresDomainStore,
        i32,
    ) {
        let guard = DB_TEST_LOCK.lock().await;
        let test_db = TestDatabase::with_migrations().await.unwrap();
        let encryption = Arc::new(EncryptionService::new_from_password("test"));
        let store = PostgresDomainStore::new(test_db.db.clone(), encryption);

        let page = status_pages::ActiveModel {
            project_id: Set(1),
            name: Set("Production Status".to_string()),
            deleted_at: Set(None),
            ..Default::default()
        };
        let page = page.insert(test_db.db.as_ref()).await.unwrap();

        (guard, test_db, store, page.id)
    }

    fn new_domain(page_id: i32, subdomain: &str) -> NewDomain {
        NewDomain {
            project_id: 1,
            status_page_id: page_id,
            subdomain: subdomain.to_string(),
            base_domain: "example.com".to_string(),
        }
    }

    #[tokio::test]
    async fn test_create_and_find_domain() {
        let (_guard, _db, store, page_id) = setup().await;

        let domain = store
            .create_domain(new_domain(page_id, "status"))
            .await
            .unwrap();
        assert_eq!(domain.full_domain, "status.example.com");
        assert!(!domain.cname_verified);
        assert!(!domain.ssl_ordered);
        assert!(!domain.ssl_provisioned);
        assert_eq!(domain.retry_count, 0);
        assert_eq!(domain.version, 0);

        let found = store
            .find_domain_by_hostname("status.example.com")
            .await
            .unwrap();
        assert_eq!(found.map(|d| d.id), Some(domain.id));

        // Duplicate hostname is rejected
        let result = store.create_domain(new_domain(page_id, "status")).await;
        assert!(matches!(result, Err(StoreError::DuplicateEntry(_))));
    }

    #[tokio::test]
    async fn test_transition_happy_path_increments_version() {
        let (_guard, _db, store, page_id) = setup().await;
        let domain = store
            .create_domain(new_domain(page_id, "status"))
            .await
            .unwrap();

        let domain = store
            .apply_transition(domain.id, DomainTransition::CnameVerified)
            .await
            .unwrap();
        assert!(domain.cname_verified);
        assert_eq!(domain.version, 1);
        assert!(domain.last_checked_at.is_some());

        let domain = store
            .apply_transition(domain.id, DomainTransition::SslOrdered)
            .await
            .unwrap();
        assert!(domain.ssl_ordered);
        assert_eq!(domain.version, 2);

        let domain = store
            .apply_transition(domain.id, DomainTransition::CertificateIssued)
            .await
            .unwrap();
        assert!(domain.ssl_provisioned);
        assert_eq!(domain.version, 3);
    }

    #[tokio::test]
    async fn test_verification_failed_increments_retry_count() {
        let (_guard, _db, store, page_id) = setup().await;
        let domain = store
            .create_domain(new_domain(page_id, "status"))
            .await
            .unwrap();

        let domain = store
            .apply_transition(domain.id, DomainTransition::VerificationFailed)
            .await
            .unwrap();
        assert_eq!(domain.retry_count, 1);
        assert!(!domain.cname_verified);
        assert!(domain.last_checked_at.is_some());

        let domain = store
            .apply_transition(domain.id, DomainTransition::VerificationFailed)
            .await
            .unwrap();
        assert_eq!(domain.retry_count, 2);
    }

    #[tokio::test]
    async fn test_illegal_transitions_rejected() {
        let (_guard, _db, store, page_id) = setup().await;
        let domain = store
            .create_domain(new_domain(page_id, "status"))
            .await
            .unwrap();

        // Cannot order SSL before verification
        let result = store
            .apply_transition(domain.id, DomainTransition::SslOrdered)
            .await;
        assert!(matches!(
            result,
            Err(StoreError::InvalidTransition { .. })
        ));

        // Verify, then verify again
        store
            .apply_transition(domain.id, DomainTransition::CnameVerified)
            .await
            .unwrap();
        let result = store
            .apply_transition(domain.id, DomainTransition::CnameVerified)
            .await;
        assert!(matches!(
            result,
            Err(StoreError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_concurrent_transitions_apply_at_most_once() {
        let (_guard, _db, store, page_id) = setup().await;
        let domain = store
            .create_domain(new_domain(page_id, "status"))
            .await
            .unwrap();

        let (a, b) = tokio::join!(
            store.apply_transition(domain.id, DomainTransition::CnameVerified),
            store.apply_transition(domain.id, DomainTransition::CnameVerified)
        );

        // Exactly one of the racing sweeps wins; the other loses either the
        // version check or the edge validation
        let successes = [a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count();
        assert_eq!(successes, 1);

        let domain = store.find_domain(domain.id).await.unwrap().unwrap();
        assert!(domain.cname_verified);
        assert_eq!(domain.version, 1);
    }

    #[tokio::test]
    async fn test_change_hostname_resets_flags() {
        let (_guard, _db, store, page_id) = setup().await;
        let domain = store
            .create_domain(new_domain(page_id, "status"))
            .await
            .unwrap();

        store
            .apply_transition(domain.id, DomainTransition::CnameVerified)
            .await
            .unwrap();
        store
            .apply_transition(domain.id, DomainTransition::SslOrdered)
            .await
            .unwrap();

        let domain = store
            .change_hostname(domain.id, "uptime", "example.com")
            .await
            .unwrap();
        assert_eq!(domain.full_domain, "uptime.example.com");
        assert!(!domain.cname_verified);
        assert!(!domain.ssl_ordered);
        assert!(!domain.ssl_provisioned);
        assert_eq!(domain.retry_count, 0);
    }

    #[tokio::test]
    async fn test_soft_delete_hides_domain() {
        let (_guard, _db, store, page_id) = setup().await;
        let domain = store
            .create_domain(new_domain(page_id, "status"))
            .await
            .unwrap();

        store.soft_delete_domain(domain.id).await.unwrap();

        assert!(store.find_domain(domain.id).await.unwrap().is_none());
        assert!(store
            .list_pending_verification()
            .await
            .unwrap()
            .is_empty());

        // The hostname is free for reuse
        let recreated = store.create_domain(new_domain(page_id, "status")).await;
        assert!(recreated.is_ok());
    }

    #[tokio::test]
    async fn test_query_by_state_buckets() {
        let (_guard, _db, store, page_id) = setup().await;

        let unverified = store
            .create_domain(new_domain(page_id, "one"))
            .await
            .unwrap();
        let verified = store
            .create_domain(new_domain(page_id, "two"))
            .await
            .unwrap();
        let pending_ssl = store
            .create_domain(new_domain(page_id, "three"))
            .await
            .unwrap();

        store
            .apply_transition(verified.id, DomainTransition::CnameVerified)
            .await
            .unwrap();
        store
            .apply_transition(pending_ssl.id, DomainTransition::CnameVerified)
            .await
            .unwrap();
        store
            .apply_transition(pending_ssl.id, DomainTransition::SslOrdered)
            .await
            .unwrap();

        let bucket: Vec<i32> = store
            .list_pending_verification()
            .await
            .unwrap()
            .iter()
            .map(|d| d.id)
            .collect();
        assert_eq!(bucket, vec![unverified.id]);

        let bucket: Vec<i32> = store
            .list_verified_without_ssl()
            .await
            .unwrap()
            .iter()
            .map(|d| d.id)
            .collect();
        assert_eq!(bucket, vec![verified.id]);

        let bucket: Vec<i32> = store
            .list_awaiting_provisioning()
            .await
            .unwrap()
            .iter()
            .map(|d| d.id)
            .collect();
        assert_eq!(bucket, vec![pending_ssl.id]);
    }

    #[tokio::test]
    async fn test_single_pending_order_per_domain() {
        let (_guard, _db, store, page_id) = setup().await;
        let domain = store
            .create_domain(new_domain(page_id, "status"))
            .await
            .unwrap();

        let order = store.create_pending_order(domain.id).await.unwrap();
        assert_eq!(order.status, "pending");

        let result = store.create_pending_order(domain.id).await;
        assert!(matches!(result, Err(StoreError::DuplicateEntry(_))));

        // A failed order frees the slot
        store.mark_order_failed(order.id, "rate limited").await.unwrap();
        assert!(store.create_pending_order(domain.id).await.is_ok());
    }

    #[tokio::test]
    async fn test_order_issuance_lifecycle() {
        let (_guard, _db, store, page_id) = setup().await;
        let domain = store
            .create_domain(new_domain(page_id, "status"))
            .await
            .unwrap();

        let order = store.create_pending_order(domain.id).await.unwrap();
        let order = store
            .record_order_submitted(
                order.id,
                "https://acme.test/order/1",
                Some("token123"),
                Some("token123.abc"),
                Some("https://acme.test/chall/1"),
            )
            .await
            .unwrap();
        assert_eq!(order.challenge_token.as_deref(), Some("token123"));

        let found = store
            .find_pending_order_by_token("token123")
            .await
            .unwrap();
        assert_eq!(found.map(|o| o.id), Some(order.id));

        let order = store
            .mark_order_issued(order.id, "CERT PEM", "KEY PEM")
            .await
            .unwrap();
        assert_eq!(order.status, "issued");
        assert!(order.provisioned_at.is_some());
        // Private key is stored encrypted
        assert_ne!(order.private_key_pem.as_deref(), Some("KEY PEM"));

        let key = store
            .find_order_private_key("https://acme.test/order/1")
            .await
            .unwrap();
        assert_eq!(key.as_deref(), Some("KEY PEM"));

        // Issued orders no longer serve challenges
        assert!(store
            .find_pending_order_by_token("token123")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_failed_order_budget_counting() {
        let (_guard, _db, store, page_id) = setup().await;
        let domain = store
            .create_domain(new_domain(page_id, "status"))
            .await
            .unwrap();

        for _ in 0..3 {
            let order = store.create_pending_order(domain.id).await.unwrap();
            store
                .mark_order_failed(order.id, "challenge expired")
                .await
                .unwrap();
        }

        let since = Utc::now() - chrono::Duration::hours(24);
        let count = store
            .count_failed_orders_since(domain.id, since)
            .await
            .unwrap();
        assert_eq!(count, 3);

        // Failures older than the window do not count
        let count = store
            .count_failed_orders_since(domain.id, Utc::now() + chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_acme_account_roundtrip() {
        let (_guard, _db, store, _page_id) = setup().await;

        assert!(store
            .find_acme_account("ops@example.com", "staging")
            .await
            .unwrap()
            .is_none());

        store
            .save_acme_account("ops@example.com", "staging", r#"{"id":"abc"}"#)
            .await
            .unwrap();

        let creds = store
            .find_acme_account("ops@example.com", "staging")
            .await
            .unwrap();
        assert_eq!(creds.as_deref(), Some(r#"{"id":"abc"}"#));
    }
}
