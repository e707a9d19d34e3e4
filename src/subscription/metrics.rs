// std
use std::sync::atomic::AtomicU64;
// self
use crate::obs::{self, record_counter};

/// Thread-safe counters for subscription watches.
#[derive(Debug, Default)]
pub struct SubscriptionMetrics {
	watches: AtomicU64,
	connects: AtomicU64,
	received: AtomicU64,
	transient_errors: AtomicU64,
	reconnects: AtomicU64,
}
impl SubscriptionMetrics {
	/// Returns the number of watches started.
	pub fn watches(&self) -> u64 {
		obs::load(&self.watches)
	}

	/// Returns the number of connection attempts.
	pub fn connects(&self) -> u64 {
		obs::load(&self.connects)
	}

	/// Returns the number of events decoded and handed to a sink.
	pub fn received(&self) -> u64 {
		obs::load(&self.received)
	}

	/// Returns the number of transient stream errors observed.
	pub fn transient_errors(&self) -> u64 {
		obs::load(&self.transient_errors)
	}

	/// Returns the number of times a watch entered the reconnecting phase.
	pub fn reconnects(&self) -> u64 {
		obs::load(&self.reconnects)
	}

	pub(crate) fn record_watch(&self) {
		obs::bump(&self.watches);
		record_counter("gira_subscriptions_total");
	}

	pub(crate) fn record_connect(&self) {
		obs::bump(&self.connects);
		record_counter("gira_subscriptions_connects_total");
	}

	pub(crate) fn record_received(&self) {
		obs::bump(&self.received);
		record_counter("gira_subscriptions_received_msgs_total");
	}

	pub(crate) fn record_transient_error(&self) {
		obs::bump(&self.transient_errors);
		record_counter("gira_subscriptions_invalid_errors_total");
	}

	pub(crate) fn record_reconnect(&self) {
		obs::bump(&self.reconnects);
		record_counter("gira_subscriptions_reconnects_total");
	}
}
