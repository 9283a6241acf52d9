//! Custom-domain verification and SSL provisioning for status pages.
//!
//! A custom hostname moves through four states: unverified, verified (the
//! CNAME points at the canonical target), ssl_pending (a certificate order
//! is with the CA), and provisioned. This crate owns the state machine and
//! its persistent store, the DNS verifier, the certificate orderer, and the
//! HTTP surface; the periodic sweep that drives it lives in
//! `beacon-provisioner`.

pub mod ca;
pub mod errors;
pub mod handlers;
pub mod orderer;
pub mod state;
pub mod store;
pub mod test_utils;
pub mod verifier;

// Re-export commonly used types
pub use ca::{
    CaChallenge, CaOrder, CaOrderState, CertificateAuthority, IssuedCertificate,
    LetsEncryptAuthority,
};
pub use errors::{CaError, OrderError, StoreError, VerifyError};
pub use orderer::{CertificateOrderer, OrderHandle, OrderStatus};
pub use state::{DomainState, DomainTransition};
pub use store::{DomainStore, NewDomain, PostgresDomainStore};
pub use verifier::{CnameVerifier, DnsCnameVerifier, VerificationOutcome};

// Export handlers state for use in other contexts
pub use handlers::{configure_routes, create_domain_app_state, DomainAppState};
