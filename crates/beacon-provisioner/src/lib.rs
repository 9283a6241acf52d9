//! Periodic driver for the domain provisioning state machine.
//!
//! The [`scheduler::ProvisioningScheduler`] sweeps all eligible domains on
//! a fixed interval: unverified domains get a CNAME check (subject to
//! exponential backoff), verified domains get a certificate order (subject
//! to a daily budget), and pending orders are polled to completion.

pub mod backoff;
pub mod scheduler;

pub use backoff::BackoffPolicy;
pub use scheduler::{ProvisionerConfig, ProvisioningScheduler, SchedulerError, SweepReport};
