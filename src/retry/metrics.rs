// std
use std::sync::atomic::AtomicU64;
// self
use crate::{
	_prelude::*,
	obs::{self, record_counter},
};

/// Thread-safe counters for the retrying transport.
#[derive(Debug, Default)]
pub struct RetryMetrics {
	requests: AtomicU64,
	sent: AtomicU64,
	timeouts: AtomicU64,
	retries: AtomicU64,
}
impl RetryMetrics {
	/// Returns the number of logical requests handed to the transport.
	pub fn requests(&self) -> u64 {
		obs::load(&self.requests)
	}

	/// Returns the number of attempts actually sent to the inner transport.
	pub fn sent(&self) -> u64 {
		obs::load(&self.sent)
	}

	/// Returns the number of attempts that hit the per-attempt deadline.
	pub fn timeouts(&self) -> u64 {
		obs::load(&self.timeouts)
	}

	/// Returns the number of times a request was scheduled for another attempt.
	pub fn retries(&self) -> u64 {
		obs::load(&self.retries)
	}

	pub(crate) fn record_request(&self) {
		obs::bump(&self.requests);
		record_counter("gira_requests_total");
	}

	pub(crate) fn record_sent(&self) {
		obs::bump(&self.sent);
		record_counter("gira_sent_requests_total");
	}

	pub(crate) fn record_timeout(&self) {
		obs::bump(&self.timeouts);
		record_counter("gira_timeout_retries_total");
	}

	pub(crate) fn record_retry(&self) {
		obs::bump(&self.retries);
		record_counter("gira_retries_total");
	}
}
impl Display for RetryMetrics {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		write!(
			f,
			"requests={} sent={} timeouts={} retries={}",
			self.requests(),
			self.sent(),
			self.timeouts(),
			self.retries()
		)
	}
}
