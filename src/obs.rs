//! Observability helpers shared by every flow.
//!
//! # Feature Flags
//!
//! - Spans are always emitted through `tracing`, named `gira_broker.flow` with the `flow` and
//!   `stage` (call site) fields.
//! - Enable `metrics` to increment the `gira_broker_flow_total` counter for every
//!   attempt/success/failure, labeled by `flow` + `outcome`, plus the transport and
//!   subscription counters recorded through [`record_counter`].

mod metrics;
mod tracing;

pub use metrics::*;
pub use tracing::*;

// std
use std::sync::atomic::{AtomicU64, Ordering};
// crates.io
use sha2::{Digest, Sha256};
// self
use crate::_prelude::*;

/// Flow kinds observed by the crate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FlowKind {
	/// Upstream request/response call.
	Call,
	/// Credential refresh.
	Refresh,
	/// Credential login.
	Login,
	/// Real-time subscription.
	Subscription,
	/// Attestation token deposit at the broker.
	PostToken,
	/// Attestation token exchange at the broker.
	Exchange,
}
impl FlowKind {
	/// Returns a stable label suitable for span or metric fields.
	pub const fn as_str(self) -> &'static str {
		match self {
			FlowKind::Call => "call",
			FlowKind::Refresh => "refresh",
			FlowKind::Login => "login",
			FlowKind::Subscription => "subscription",
			FlowKind::PostToken => "post_token",
			FlowKind::Exchange => "exchange",
		}
	}
}
impl Display for FlowKind {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str(self.as_str())
	}
}

/// Outcome labels recorded for each attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FlowOutcome {
	/// Entry to a flow.
	Attempt,
	/// Successful completion.
	Success,
	/// Failure propagated back to the caller.
	Failure,
}
impl FlowOutcome {
	/// Returns a stable label suitable for span or metric fields.
	pub const fn as_str(self) -> &'static str {
		match self {
			FlowOutcome::Attempt => "attempt",
			FlowOutcome::Success => "success",
			FlowOutcome::Failure => "failure",
		}
	}
}
impl Display for FlowOutcome {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str(self.as_str())
	}
}

/// Returns a short, log-safe fingerprint for a secret value.
pub fn fingerprint(secret: &str) -> String {
	let digest = Sha256::digest(secret.as_bytes());

	digest.iter().take(6).map(|byte| format!("{byte:02x}")).collect()
}

pub(crate) fn load(counter: &AtomicU64) -> u64 {
	counter.load(Ordering::Relaxed)
}

pub(crate) fn bump(counter: &AtomicU64) {
	counter.fetch_add(1, Ordering::Relaxed);
}
