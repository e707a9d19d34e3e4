//! Attestation token broker: leases a finite pool of externally deposited attestation tokens to
//! verified upstream users, at most one valid lease per user.
//!
//! [`TokenBroker`] holds the lifecycle rules, [`LeaseStore`] implementations persist the pool,
//! and [`router`] exposes the service over HTTP.

mod lease;
mod metrics;
mod routes;
mod service;
mod store;
mod verify;

pub use lease::{AssignRequest, AttestationLease, LeaseGrant, Stats};
pub use metrics::BrokerMetrics;
pub use routes::*;
pub use service::TokenBroker;
pub use store::*;
pub use verify::*;
