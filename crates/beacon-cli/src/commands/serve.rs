use std::sync::Arc;
use std::time::Duration;

use beacon_core::{EncryptionService, TracingEventSink};
use beacon_database::establish_connection;
use beacon_domains::{
    configure_routes, create_domain_app_state, CertificateAuthority, CertificateOrderer,
    CnameVerifier, DnsCnameVerifier, DomainStore, LetsEncryptAuthority, PostgresDomainStore,
};
use beacon_provisioner::{ProvisionerConfig, ProvisioningScheduler};
use clap::Args;
use rustls::crypto::CryptoProvider;
use tracing::info;

#[derive(Args)]
pub struct ServeCommand {
    /// Address to bind the HTTP API
    #[arg(long, default_value = "0.0.0.0:8080", env = "BEACON_HTTP_ADDR")]
    listen: String,

    /// PostgreSQL connection string
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,

    /// Canonical CNAME target customers point their domains at
    /// (e.g. pages.beacon.sh)
    #[arg(long, env = "BEACON_CNAME_TARGET")]
    cname_target: String,

    /// Contact email for ACME account registration
    #[arg(long, env = "BEACON_ACME_EMAIL")]
    acme_email: String,

    /// Master key for encrypting certificate private keys at rest
    /// (32 bytes raw or 64 hex characters)
    #[arg(long, env = "BEACON_MASTER_KEY")]
    master_key: String,

    /// Seconds between provisioning sweeps
    #[arg(long, default_value_t = 3600, env = "BEACON_SWEEP_INTERVAL_SECS")]
    sweep_interval_secs: u64,

    /// Maximum failed certificate orders per domain per day
    #[arg(long, default_value_t = 3, env = "BEACON_DAILY_ORDER_BUDGET")]
    daily_order_budget: u32,
}

impl ServeCommand {
    pub async fn run(self) -> anyhow::Result<()> {
        // instant-acme needs a process-wide rustls crypto provider
        CryptoProvider::install_default(rustls::crypto::ring::default_provider())
            .map_err(|_| anyhow::anyhow!("rustls crypto provider already installed"))?;

        info!("Connecting to database and running migrations");
        let db = establish_connection(&self.database_url).await?;

        let encryption_service = Arc::new(EncryptionService::new(&self.master_key)?);
        let store: Arc<dyn DomainStore> =
            Arc::new(PostgresDomainStore::new(db.clone(), encryption_service));
        let verifier: Arc<dyn CnameVerifier> =
            Arc::new(DnsCnameVerifier::new(self.cname_target.clone()));
        let ca: Arc<dyn CertificateAuthority> =
            Arc::new(LetsEncryptAuthority::new(store.clone(), self.acme_email.clone()));
        let orderer = Arc::new(CertificateOrderer::new(store.clone(), ca));
        let event_sink = Arc::new(TracingEventSink);

        let scheduler = Arc::new(ProvisioningScheduler::new(
            store.clone(),
            verifier.clone(),
            orderer.clone(),
            event_sink.clone(),
            ProvisionerConfig {
                sweep_interval: Duration::from_secs(self.sweep_interval_secs),
                daily_order_budget: self.daily_order_budget,
                ..Default::default()
            },
        ));
        tokio::spawn(scheduler.start());

        let app_state = create_domain_app_state(store, verifier, orderer, event_sink);
        let app = configure_routes().with_state(app_state);

        let listener = tokio::net::TcpListener::bind(&self.listen).await?;
        info!(
            "Beacon API listening on {} (CNAME target: {})",
            self.listen, self.cname_target
        );
        axum::serve(listener, app).await?;

        Ok(())
    }
}
