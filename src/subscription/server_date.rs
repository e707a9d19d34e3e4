//! Upstream clock ticks.

// self
use crate::{
	_prelude::*,
	subscription::{Operation, SubscriptionEvent, trips::lenient_instant},
};

/// Server-date subscription document.
pub const SERVER_DATE_SUBSCRIPTION: &str =
	"subscription ($token: String!) { serverDate(_access_token: $token) { date } }";

/// One tick of the upstream clock.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServerDate {
	/// Upstream time; `None` when the tick carried an unreadable timestamp.
	#[serde(deserialize_with = "lenient_instant")]
	pub date: Option<OffsetDateTime>,
}
impl SubscriptionEvent for ServerDate {
	fn operation() -> Operation {
		Operation::new(SERVER_DATE_SUBSCRIPTION)
	}

	fn decode(data: serde_json::Value) -> Result<Self> {
		#[derive(Deserialize)]
		struct Envelope {
			#[serde(rename = "serverDate")]
			tick: ServerDate,
		}

		let envelope: Envelope =
			serde_path_to_error::deserialize(data).map_err(|e| Error::Subscription {
				reason: format!("undecodable server date at {}: {}", e.path(), e.inner()),
			})?;

		Ok(envelope.tick)
	}
}
