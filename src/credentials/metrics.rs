// std
use std::sync::atomic::AtomicU64;
// self
use crate::obs;

/// Thread-safe counters for credential lookups and refreshes.
#[derive(Debug, Default)]
pub struct RefreshMetrics {
	cache_hits: AtomicU64,
	attempts: AtomicU64,
	success: AtomicU64,
	failure: AtomicU64,
}
impl RefreshMetrics {
	/// Returns the number of lookups served from the store without I/O.
	pub fn cache_hits(&self) -> u64 {
		obs::load(&self.cache_hits)
	}

	/// Returns the total number of refresh calls sent to the auth endpoint.
	pub fn attempts(&self) -> u64 {
		obs::load(&self.attempts)
	}

	/// Returns the number of successful refresh calls.
	pub fn successes(&self) -> u64 {
		obs::load(&self.success)
	}

	/// Returns the number of failed refresh calls.
	pub fn failures(&self) -> u64 {
		obs::load(&self.failure)
	}

	pub(crate) fn record_cache_hit(&self) {
		obs::bump(&self.cache_hits);
	}

	pub(crate) fn record_attempt(&self) {
		obs::bump(&self.attempts);
	}

	pub(crate) fn record_success(&self) {
		obs::bump(&self.success);
	}

	pub(crate) fn record_failure(&self) {
		obs::bump(&self.failure);
	}
}
