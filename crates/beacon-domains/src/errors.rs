use crate::state::{DomainState, DomainTransition};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Duplicate entry: {0}")]
    DuplicateEntry(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Invalid flag combination: cname_verified={cname_verified}, ssl_ordered={ssl_ordered}, ssl_provisioned={ssl_provisioned}")]
    InvalidFlags {
        cname_verified: bool,
        ssl_ordered: bool,
        ssl_provisioned: bool,
    },

    #[error("Invalid transition: {transition:?} is not legal from {state:?}")]
    InvalidTransition {
        state: DomainState,
        transition: DomainTransition,
    },

    #[error("Concurrent modification of domain {0}")]
    ConcurrentModification(i32),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<sea_orm::DbErr> for StoreError {
    fn from(err: sea_orm::DbErr) -> Self {
        match err {
            sea_orm::DbErr::RecordNotFound(msg) => StoreError::NotFound(msg),
            sea_orm::DbErr::RecordNotInserted => {
                StoreError::DuplicateEntry("Record not inserted".to_string())
            }
            sea_orm::DbErr::ConnectionAcquire(err) => StoreError::Connection(err.to_string()),
            _ => StoreError::Database(err.to_string()),
        }
    }
}

#[derive(Error, Debug)]
pub enum VerifyError {
    /// Resolver failure or timeout. Retried with backoff on the next sweep;
    /// a definitive negative answer is NOT an error and comes back as
    /// `verified = false` instead.
    #[error("Transient resolver failure: {0}")]
    Transient(String),
}

#[derive(Error, Debug)]
pub enum CaError {
    /// Network-level failure talking to the ACME directory
    #[error("CA network error: {0}")]
    Transient(String),

    /// The CA processed the request and said no (invalid order, rate
    /// limit, expired challenge)
    #[error("CA rejection: {0}")]
    Rejected(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Certificate generation error: {0}")]
    CertificateGeneration(String),
}

impl From<instant_acme::Error> for CaError {
    fn from(err: instant_acme::Error) -> Self {
        // instant-acme funnels transport and protocol failures through one
        // type; definitive rejections are detected from order state instead
        CaError::Transient(err.to_string())
    }
}

impl From<rcgen::Error> for CaError {
    fn from(err: rcgen::Error) -> Self {
        CaError::CertificateGeneration(err.to_string())
    }
}

#[derive(Error, Debug)]
pub enum OrderError {
    /// Precondition violation: ordering for an unverified domain, or while
    /// another order is still pending. Never retried.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Order not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Ca(#[from] CaError),
}
