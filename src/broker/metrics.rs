// std
use std::sync::atomic::AtomicU64;
// self
use crate::obs::{self, record_counter};

/// Thread-safe counters for broker operations.
#[derive(Debug, Default)]
pub struct BrokerMetrics {
	deposits: AtomicU64,
	rejected_deposits: AtomicU64,
	fast_path: AtomicU64,
	verifications: AtomicU64,
	assignments: AtomicU64,
	exhausted: AtomicU64,
	reclaimed: AtomicU64,
}
impl BrokerMetrics {
	/// Returns the number of accepted deposits.
	pub fn deposits(&self) -> u64 {
		obs::load(&self.deposits)
	}

	/// Returns the number of rejected deposits (bad, expired, or duplicate).
	pub fn rejected_deposits(&self) -> u64 {
		obs::load(&self.rejected_deposits)
	}

	/// Returns the number of exchanges served from an existing assignment without verification.
	pub fn fast_path(&self) -> u64 {
		obs::load(&self.fast_path)
	}

	/// Returns the number of identity verifications performed.
	pub fn verifications(&self) -> u64 {
		obs::load(&self.verifications)
	}

	/// Returns the number of leases newly assigned.
	pub fn assignments(&self) -> u64 {
		obs::load(&self.assignments)
	}

	/// Returns the number of exchanges that found the pool empty.
	pub fn exhausted(&self) -> u64 {
		obs::load(&self.exhausted)
	}

	/// Returns the number of lease values cleared by reclamation.
	pub fn reclaimed(&self) -> u64 {
		obs::load(&self.reclaimed)
	}

	pub(crate) fn record_deposit(&self) {
		obs::bump(&self.deposits);
		record_counter("gira_broker_deposits_total");
	}

	pub(crate) fn record_rejected_deposit(&self) {
		obs::bump(&self.rejected_deposits);
		record_counter("gira_broker_rejected_deposits_total");
	}

	pub(crate) fn record_fast_path(&self) {
		obs::bump(&self.fast_path);
		record_counter("gira_broker_fast_path_total");
	}

	pub(crate) fn record_verification(&self) {
		obs::bump(&self.verifications);
		record_counter("gira_broker_verifications_total");
	}

	pub(crate) fn record_assignment(&self) {
		obs::bump(&self.assignments);
		record_counter("gira_broker_assignments_total");
	}

	pub(crate) fn record_exhausted(&self) {
		obs::bump(&self.exhausted);
		record_counter("gira_broker_exhausted_total");
	}

	pub(crate) fn record_reclaimed(&self, count: usize) {
		for _ in 0..count {
			obs::bump(&self.reclaimed);
			record_counter("gira_broker_reclaimed_total");
		}
	}
}
