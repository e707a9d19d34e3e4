//! Active-trip events and a watch that follows one trip to completion.

// crates.io
use futures::StreamExt;
use serde::Deserializer;
use time::format_description::well_known::Rfc3339;
// self
use crate::{
	_prelude::*,
	auth::TripCode,
	subscription::{Operation, SinkControl, SubscriptionEvent, Watch},
};

/// Active-trip subscription document.
pub const ACTIVE_TRIP_SUBSCRIPTION: &str = "subscription ($token: String!) { \
	activeTripSubscription(_access_token: $token) { \
	code bike startDate endDate cost finished canceled canPayWithMoney canUsePoints \
	clientPoints tripPoints period periodTime error } }";

/// Upstream error code carried by an update when the subscription's credential went stale.
pub const STALE_CREDENTIAL_CODE: i32 = 401;

/// One status update of the user's active trip.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TripUpdate {
	/// Trip code; absent on error updates.
	#[serde(deserialize_with = "lenient_code")]
	pub code: Option<TripCode>,
	/// Bike name.
	pub bike: String,
	/// Trip start.
	#[serde(deserialize_with = "lenient_instant")]
	pub start_date: Option<OffsetDateTime>,
	/// Trip end; absent while the trip is ongoing.
	#[serde(deserialize_with = "lenient_instant")]
	pub end_date: Option<OffsetDateTime>,
	/// Cost charged for the trip.
	pub cost: f64,
	/// Whether the trip has finished.
	pub finished: bool,
	/// Whether the trip was cancelled.
	pub canceled: bool,
	/// Whether the trip can be paid with money.
	pub can_pay_with_money: bool,
	/// Whether the trip can be paid with points.
	pub can_use_points: bool,
	/// Points held by the user.
	pub client_points: i64,
	/// Points earned by the trip.
	pub trip_points: i64,
	/// Billing period label.
	pub period: String,
	/// Billing period duration label.
	pub period_time: String,
	/// Upstream error code; zero when the update is healthy.
	pub error: i32,
}
impl TripUpdate {
	/// Returns how long the trip has lasted, measured to `now` while it is ongoing.
	pub fn elapsed_at(&self, now: OffsetDateTime) -> Duration {
		let Some(start) = self.start_date else {
			return Duration::ZERO;
		};

		(self.end_date.unwrap_or(now) - start).max(Duration::ZERO)
	}

	/// Formats [`elapsed_at`](Self::elapsed_at) as `mm:ss`, or `h:mm:ss` past the hour.
	pub fn pretty_duration_at(&self, now: OffsetDateTime) -> String {
		let seconds = self.elapsed_at(now).whole_seconds();
		let (h, m, s) = (seconds / 3600, (seconds / 60) % 60, seconds % 60);

		if h > 0 { format!("{h}:{m:02}:{s:02}") } else { format!("{m:02}:{s:02}") }
	}
}
impl SubscriptionEvent for TripUpdate {
	fn operation() -> Operation {
		Operation::new(ACTIVE_TRIP_SUBSCRIPTION)
	}

	fn decode(data: serde_json::Value) -> Result<Self> {
		#[derive(Deserialize)]
		struct Envelope {
			#[serde(rename = "activeTripSubscription")]
			trip: TripUpdate,
		}

		let envelope: Envelope =
			serde_path_to_error::deserialize(data).map_err(|e| Error::Subscription {
				reason: format!("undecodable trip update at {}: {}", e.path(), e.inner()),
			})?;

		Ok(envelope.trip)
	}

	fn control(&self) -> SinkControl {
		if self.error == STALE_CREDENTIAL_CODE {
			SinkControl::Reconnect
		} else {
			SinkControl::Continue
		}
	}
}

fn lenient_code<'de, D>(deserializer: D) -> Result<Option<TripCode>, D::Error>
where
	D: Deserializer<'de>,
{
	let raw = Option::<String>::deserialize(deserializer)?;

	Ok(raw.and_then(|code| TripCode::new(code).ok()))
}

pub(super) fn lenient_instant<'de, D>(deserializer: D) -> Result<Option<OffsetDateTime>, D::Error>
where
	D: Deserializer<'de>,
{
	let raw = Option::<String>::deserialize(deserializer)?;

	Ok(raw.and_then(|text| OffsetDateTime::parse(&text, &Rfc3339).ok()))
}

/// Follows one trip through an active-trip [`Watch`].
///
/// A watch created with [`new`](Self::new) skips finished or cancelled updates until a trip
/// starts and then tracks that trip's code; [`resume`](Self::resume) tracks a known code from the
/// outset. Updates for other trips are skipped and the watch ends after the tracked trip
/// finishes or is cancelled.
#[derive(Debug)]
pub struct ActiveTripWatch {
	watch: Watch<TripUpdate>,
	tracked: Option<TripCode>,
	done: bool,
}
impl ActiveTripWatch {
	/// Waits for a new trip to start.
	pub fn new(watch: Watch<TripUpdate>) -> Self {
		Self { watch, tracked: None, done: false }
	}

	/// Follows the trip identified by `code`.
	pub fn resume(watch: Watch<TripUpdate>, code: TripCode) -> Self {
		watch.track(code.clone());

		Self { watch, tracked: Some(code), done: false }
	}

	/// Returns the trip being followed, once known.
	pub fn tracked_code(&self) -> Option<&TripCode> {
		self.tracked.as_ref()
	}

	/// Returns the next update of the tracked trip, or `None` once the trip or the watch ended.
	pub async fn next_update(&mut self) -> Option<Result<TripUpdate>> {
		if self.done {
			return None;
		}

		loop {
			let update = match self.watch.next().await? {
				Ok(update) => update,
				Err(e) => return Some(Err(e)),
			};

			match &self.tracked {
				None => {
					if update.finished || update.canceled {
						continue;
					}

					let Some(code) = update.code.clone() else {
						continue;
					};

					tracing::debug!(trip = %code, "Active trip started.");

					self.watch.track(code.clone());
					self.tracked = Some(code);
				},
				Some(code) if update.code.as_ref() != Some(code) => continue,
				Some(_) => {},
			}

			if update.finished || update.canceled {
				tracing::debug!(finished = update.finished, "Active trip ended.");

				self.done = true;
				self.watch.cancel();
			}

			return Some(Ok(update));
		}
	}
}
