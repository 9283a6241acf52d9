//! The per-domain provisioning state machine.
//!
//! The original product tracked provisioning progress as three independent
//! booleans on the domain record, which made combinations like
//! "SSL ordered but CNAME unverified" reachable through direct field
//! writes. Here the flags are only a storage encoding: every change goes
//! through [`DomainState::apply`], and [`DomainState::from_flags`] rejects
//! encodings that do not correspond to a legal state.

use crate::errors::StoreError;
use serde::{Deserialize, Serialize};

/// The four legal provisioning states of a custom domain.
///
/// ```text
/// UNVERIFIED --CnameVerified-->     VERIFIED
/// UNVERIFIED --VerificationFailed-> UNVERIFIED   (retry counter advances)
/// VERIFIED   --SslOrdered-->        SSL_PENDING
/// SSL_PENDING --CertificateIssued-> PROVISIONED
/// SSL_PENDING --CertificateFailed-> VERIFIED
/// any        --HostnameChanged-->   UNVERIFIED   (flags reset)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DomainState {
    Unverified,
    Verified,
    SslPending,
    Provisioned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DomainTransition {
    /// DNS verifier confirmed the CNAME points at the canonical target
    CnameVerified,
    /// Verification attempt did not succeed (unresolved or transient);
    /// stays UNVERIFIED and advances the retry counter
    VerificationFailed,
    /// A certificate order was accepted for the verified domain
    SslOrdered,
    /// The pending certificate order was issued
    CertificateIssued,
    /// The pending certificate order failed; eligible for re-order
    CertificateFailed,
    /// Subdomain or base domain edited; verification starts over
    HostnameChanged,
}

impl DomainState {
    /// Decode the persisted flag triple into a state.
    ///
    /// Only four of the eight combinations are legal; anything else means
    /// the record was mutated outside the transition function.
    pub fn from_flags(
        cname_verified: bool,
        ssl_ordered: bool,
        ssl_provisioned: bool,
    ) -> Result<Self, StoreError> {
        match (cname_verified, ssl_ordered, ssl_provisioned) {
            (false, false, false) => Ok(DomainState::Unverified),
            (true, false, false) => Ok(DomainState::Verified),
            (true, true, false) => Ok(DomainState::SslPending),
            (true, true, true) => Ok(DomainState::Provisioned),
            _ => Err(StoreError::InvalidFlags {
                cname_verified,
                ssl_ordered,
                ssl_provisioned,
            }),
        }
    }

    /// The flag triple this state encodes to.
    pub fn flags(&self) -> (bool, bool, bool) {
        match self {
            DomainState::Unverified => (false, false, false),
            DomainState::Verified => (true, false, false),
            DomainState::SslPending => (true, true, false),
            DomainState::Provisioned => (true, true, true),
        }
    }

    /// Apply a transition, returning the next state or an
    /// `InvalidTransition` error if the edge is not legal from here.
    pub fn apply(&self, transition: DomainTransition) -> Result<DomainState, StoreError> {
        use DomainState::*;
        use DomainTransition::*;

        match (self, transition) {
            (Unverified, CnameVerified) => Ok(Verified),
            (Unverified, VerificationFailed) => Ok(Unverified),
            (Verified, SslOrdered) => Ok(SslPending),
            (SslPending, CertificateIssued) => Ok(Provisioned),
            (SslPending, CertificateFailed) => Ok(Verified),
            (_, HostnameChanged) => Ok(Unverified),
            (state, transition) => Err(StoreError::InvalidTransition {
                state: *state,
                transition,
            }),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DomainState::Unverified => "unverified",
            DomainState::Verified => "verified",
            DomainState::SslPending => "ssl_pending",
            DomainState::Provisioned => "provisioned",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_four_flag_combinations_are_legal() {
        assert_eq!(
            DomainState::from_flags(false, false, false).unwrap(),
            DomainState::Unverified
        );
        assert_eq!(
            DomainState::from_flags(true, false, false).unwrap(),
            DomainState::Verified
        );
        assert_eq!(
            DomainState::from_flags(true, true, false).unwrap(),
            DomainState::SslPending
        );
        assert_eq!(
            DomainState::from_flags(true, true, true).unwrap(),
            DomainState::Provisioned
        );

        // ssl_ordered without cname_verified, ssl_provisioned without
        // ssl_ordered, and friends
        assert!(DomainState::from_flags(false, true, false).is_err());
        assert!(DomainState::from_flags(false, false, true).is_err());
        assert!(DomainState::from_flags(false, true, true).is_err());
        assert!(DomainState::from_flags(true, false, true).is_err());
    }

    #[test]
    fn test_flags_roundtrip() {
        for state in [
            DomainState::Unverified,
            DomainState::Verified,
            DomainState::SslPending,
            DomainState::Provisioned,
        ] {
            let (a, b, c) = state.flags();
            assert_eq!(DomainState::from_flags(a, b, c).unwrap(), state);
        }
    }

    #[test]
    fn test_happy_path() {
        let state = DomainState::Unverified;
        let state = state.apply(DomainTransition::CnameVerified).unwrap();
        assert_eq!(state, DomainState::Verified);
        let state = state.apply(DomainTransition::SslOrdered).unwrap();
        assert_eq!(state, DomainState::SslPending);
        let state = state.apply(DomainTransition::CertificateIssued).unwrap();
        assert_eq!(state, DomainState::Provisioned);
    }

    #[test]
    fn test_retry_edge_stays_unverified() {
        let state = DomainState::Unverified;
        assert_eq!(
            state.apply(DomainTransition::VerificationFailed).unwrap(),
            DomainState::Unverified
        );
    }

    #[test]
    fn test_certificate_failure_returns_to_verified() {
        let state = DomainState::SslPending;
        assert_eq!(
            state.apply(DomainTransition::CertificateFailed).unwrap(),
            DomainState::Verified
        );
    }

    #[test]
    fn test_hostname_change_resets_from_any_state() {
        for state in [
            DomainState::Unverified,
            DomainState::Verified,
            DomainState::SslPending,
            DomainState::Provisioned,
        ] {
            assert_eq!(
                state.apply(DomainTransition::HostnameChanged).unwrap(),
                DomainState::Unverified
            );
        }
    }

    #[test]
    fn test_double_apply_is_rejected() {
        // Verifying an already-verified domain
        assert!(matches!(
            DomainState::Verified.apply(DomainTransition::CnameVerified),
            Err(StoreError::InvalidTransition { .. })
        ));
        // Ordering SSL while an order is already pending
        assert!(matches!(
            DomainState::SslPending.apply(DomainTransition::SslOrdered),
            Err(StoreError::InvalidTransition { .. })
        ));
        // Issuing against a domain that never ordered
        assert!(matches!(
            DomainState::Verified.apply(DomainTransition::CertificateIssued),
            Err(StoreError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_ordering_requires_verification() {
        assert!(matches!(
            DomainState::Unverified.apply(DomainTransition::SslOrdered),
            Err(StoreError::InvalidTransition { .. })
        ));
    }
}
