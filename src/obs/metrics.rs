// self
use crate::obs::{FlowKind, FlowOutcome};

/// Records a flow outcome via the global metrics recorder (when enabled).
pub fn record_flow_outcome(kind: FlowKind, outcome: FlowOutcome) {
	#[cfg(feature = "metrics")]
	{
		metrics::counter!(
			"gira_broker_flow_total",
			"flow" => kind.as_str(),
			"outcome" => outcome.as_str()
		)
		.increment(1);
	}

	#[cfg(not(feature = "metrics"))]
	{
		let _ = (kind, outcome);
	}
}

/// Increments a plain named counter via the global metrics recorder (when enabled).
pub fn record_counter(name: &'static str) {
	#[cfg(feature = "metrics")]
	{
		metrics::counter!(name).increment(1);
	}

	#[cfg(not(feature = "metrics"))]
	{
		let _ = name;
	}
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	#[test]
	fn recorders_noop_without_metrics() {
		record_flow_outcome(FlowKind::Exchange, FlowOutcome::Failure);
		record_counter("gira_requests_total");
	}
}
