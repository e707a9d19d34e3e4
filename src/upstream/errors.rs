//! Upstream error shapes and the single place where their quirks are translated.
//!
//! The upstream reports application failures as GraphQL error lists whose codes live either in
//! `extensions.code` (a string) or `extensions.codes` (an array). Free-form messages carry the
//! remaining business conditions. Everything else in the crate consumes the structured values
//! produced here.

// self
use crate::_prelude::*;

/// Application error codes the upstream emits for otherwise-valid calls that succeed on retry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TransientCode {
	/// `INVALID_OPERATION`, returned for a large fraction of healthy requests.
	InvalidOperation,
}
impl TransientCode {
	/// Every known transient code.
	pub const ALL: [Self; 1] = [Self::InvalidOperation];

	/// Returns the wire representation.
	pub const fn as_str(self) -> &'static str {
		match self {
			Self::InvalidOperation => "INVALID_OPERATION",
		}
	}

	/// Maps a wire code to a known transient code.
	pub fn from_code(code: &str) -> Option<Self> {
		Self::ALL.into_iter().find(|known| known.as_str() == code)
	}
}
impl Display for TransientCode {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str(self.as_str())
	}
}

/// One entry of a GraphQL `errors` array.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphQlError {
	/// Human-readable message.
	#[serde(default)]
	pub message: String,
	/// Free-form extension object.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub extensions: Option<serde_json::Map<String, serde_json::Value>>,
}
impl GraphQlError {
	/// Returns the error code from `extensions.code`, falling back to `extensions.codes[0]`.
	pub fn code(&self) -> Option<&str> {
		self.single_code().or_else(|| self.first_listed_code())
	}

	/// Returns the transient code carried by this entry, if any.
	///
	/// `extensions.code` and `extensions.codes[0]` are checked independently.
	pub fn transient_code(&self) -> Option<TransientCode> {
		[self.single_code(), self.first_listed_code()]
			.into_iter()
			.flatten()
			.find_map(TransientCode::from_code)
	}

	fn single_code(&self) -> Option<&str> {
		self.extensions.as_ref()?.get("code").and_then(serde_json::Value::as_str)
	}

	fn first_listed_code(&self) -> Option<&str> {
		self.extensions
			.as_ref()?
			.get("codes")
			.and_then(serde_json::Value::as_array)
			.and_then(|codes| codes.first())
			.and_then(serde_json::Value::as_str)
	}
}

#[derive(Deserialize)]
struct ErrorEnvelope {
	#[serde(default)]
	errors: Vec<GraphQlError>,
}

/// Returns the transient marker carried by a GraphQL error list.
///
/// A list is transient only when it holds exactly one entry and that entry's code is a known
/// [`TransientCode`].
pub fn transient_marker_in(errors: &[GraphQlError]) -> Option<TransientCode> {
	match errors {
		[only] => only.transient_code(),
		_ => None,
	}
}

/// Decodes `body` as a GraphQL response and returns its transient marker, if any.
///
/// Bodies that are not JSON objects with an `errors` array are never transient.
pub fn transient_marker(body: &[u8]) -> Option<TransientCode> {
	let envelope: ErrorEnvelope = serde_json::from_slice(body).ok()?;

	transient_marker_in(&envelope.errors)
}

/// Business conditions the upstream reports through error messages.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UpstreamErrorKind {
	/// The user already has a trip in progress.
	AlreadyHasActiveTrip,
	/// The bike is reserved by someone else.
	BikeAlreadyReserved,
	/// The account balance does not cover the trip.
	NotEnoughBalance,
	/// Trips were started too close to one another.
	TripIntervalLimit,
	/// The user has no active subscription plan.
	NoActiveSubscriptions,
	/// The upstream could not find a service status for the request.
	NoServiceStatus,
	/// The bike is already part of a trip.
	BikeAlreadyInTrip,
	/// The upstream failed to talk to the operator's backend.
	TmlCommunication,
	/// The service announced it is unavailable.
	ServiceUnavailable,
	/// The upstream answered 401/403.
	Forbidden,
	/// Any other application error.
	Other,
}
impl UpstreamErrorKind {
	/// Classifies an upstream error message.
	pub fn classify(message: &str) -> Self {
		const TABLE: [(&str, UpstreamErrorKind); 12] = [
			("already_has_active_trip", UpstreamErrorKind::AlreadyHasActiveTrip),
			("bike_already_reserved", UpstreamErrorKind::BikeAlreadyReserved),
			("not_enough_balance", UpstreamErrorKind::NotEnoughBalance),
			("trip_interval_limit", UpstreamErrorKind::TripIntervalLimit),
			("has_no_active_subscriptions", UpstreamErrorKind::NoActiveSubscriptions),
			("no_service_status_found", UpstreamErrorKind::NoServiceStatus),
			("bike_already_in_trip", UpstreamErrorKind::BikeAlreadyInTrip),
			// Misspelled upstream.
			("navigator_error_tml_comunication", UpstreamErrorKind::TmlCommunication),
			("Serviço indisponível", UpstreamErrorKind::ServiceUnavailable),
			(r"Servi\u00E7o indispon\u00EDvel", UpstreamErrorKind::ServiceUnavailable),
			("403 Forbidden", UpstreamErrorKind::Forbidden),
			("401 Unauthorized", UpstreamErrorKind::Forbidden),
		];

		TABLE
			.iter()
			.find(|(needle, _)| message.contains(needle))
			.map(|(_, kind)| *kind)
			.unwrap_or(Self::Other)
	}

	/// Returns a stable label for logs.
	pub const fn as_str(self) -> &'static str {
		match self {
			Self::AlreadyHasActiveTrip => "already_has_active_trip",
			Self::BikeAlreadyReserved => "bike_already_reserved",
			Self::NotEnoughBalance => "not_enough_balance",
			Self::TripIntervalLimit => "trip_interval_limit",
			Self::NoActiveSubscriptions => "no_active_subscriptions",
			Self::NoServiceStatus => "no_service_status",
			Self::BikeAlreadyInTrip => "bike_already_in_trip",
			Self::TmlCommunication => "tml_communication",
			Self::ServiceUnavailable => "service_unavailable",
			Self::Forbidden => "forbidden",
			Self::Other => "other",
		}
	}
}

/// Non-retryable application error returned by the upstream.
#[derive(Clone, Debug, PartialEq, Eq, ThisError)]
#[error("Upstream rejected the request ({}): {message}.", kind.as_str())]
pub struct UpstreamError {
	/// Structured classification.
	pub kind: UpstreamErrorKind,
	/// Original upstream message.
	pub message: String,
	/// Upstream error code, when one was supplied.
	pub code: Option<String>,
}
impl UpstreamError {
	/// Builds an error, classifying `message`.
	pub fn new(message: impl Into<String>, code: Option<String>) -> Self {
		let message = message.into();

		Self { kind: UpstreamErrorKind::classify(&message), message, code }
	}
}

/// Translates a GraphQL error list into the crate error taxonomy.
///
/// Transient markers and internal server failures become [`Error::Transient`], lost or rejected
/// credentials become [`Error::InvalidGrant`], everything else becomes [`Error::Upstream`].
pub fn translate(errors: &[GraphQlError]) -> Error {
	if let Some(code) = transient_marker_in(errors) {
		return crate::error::TransientError::Upstream { message: code.to_string(), status: None }
			.into();
	}

	let Some(first) = errors.first() else {
		return UpstreamError::new("empty error list", None).into();
	};
	let message = errors.iter().map(|e| e.message.as_str()).collect::<Vec<_>>().join("; ");

	if errors.len() == 1 {
		let lowered = first.message.to_ascii_lowercase();

		if lowered.contains("internal server error") {
			return crate::error::TransientError::Upstream { message, status: None }.into();
		}
		if lowered.contains("invalid refresh token") || lowered.contains("record not found") {
			return Error::InvalidGrant { reason: first.message.clone() };
		}
	}

	UpstreamError::new(message, first.code().map(str::to_owned)).into()
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	#[test]
	fn marker_reads_code_and_codes() {
		let single = br#"{"errors":[{"message":"x","extensions":{"code":"INVALID_OPERATION"}}]}"#;
		let array = br#"{"errors":[{"message":"x","extensions":{"codes":["INVALID_OPERATION"]}}]}"#;

		assert_eq!(transient_marker(single), Some(TransientCode::InvalidOperation));
		assert_eq!(transient_marker(array), Some(TransientCode::InvalidOperation));
	}

	#[test]
	fn marker_checks_code_and_codes_independently() {
		let listed = br#"{"errors":[{"message":"x","extensions":{
			"code":"FORBIDDEN","codes":["INVALID_OPERATION"]
		}}]}"#;
		let single = br#"{"errors":[{"message":"x","extensions":{
			"code":"INVALID_OPERATION","codes":["FORBIDDEN"]
		}}]}"#;
		let neither = br#"{"errors":[{"message":"x","extensions":{
			"code":"FORBIDDEN","codes":["NOT_FOUND","INVALID_OPERATION"]
		}}]}"#;

		assert_eq!(transient_marker(listed), Some(TransientCode::InvalidOperation));
		assert_eq!(transient_marker(single), Some(TransientCode::InvalidOperation));
		assert_eq!(transient_marker(neither), None);
	}

	#[test]
	fn marker_requires_exactly_one_known_error() {
		let two = br#"{"errors":[
			{"message":"x","extensions":{"code":"INVALID_OPERATION"}},
			{"message":"y","extensions":{"code":"INVALID_OPERATION"}}
		]}"#;
		let other = br#"{"errors":[{"message":"x","extensions":{"code":"FORBIDDEN"}}]}"#;

		assert_eq!(transient_marker(two), None);
		assert_eq!(transient_marker(other), None);
		assert_eq!(transient_marker(b"<html>bad gateway</html>"), None);
		assert_eq!(transient_marker(br#"{"data":{"ok":true}}"#), None);
	}

	#[test]
	fn business_errors_are_classified() {
		assert_eq!(
			UpstreamErrorKind::classify("error: already_has_active_trip"),
			UpstreamErrorKind::AlreadyHasActiveTrip
		);
		assert_eq!(
			UpstreamErrorKind::classify("navigator_error_tml_comunication"),
			UpstreamErrorKind::TmlCommunication
		);
		assert_eq!(
			UpstreamErrorKind::classify("Serviço indisponível"),
			UpstreamErrorKind::ServiceUnavailable
		);
		assert_eq!(
			UpstreamErrorKind::classify(r#"{"message":"Servi\u00E7o indispon\u00EDvel"}"#),
			UpstreamErrorKind::ServiceUnavailable
		);
		assert_eq!(UpstreamErrorKind::classify("401 Unauthorized"), UpstreamErrorKind::Forbidden);
		assert_eq!(UpstreamErrorKind::classify("something new"), UpstreamErrorKind::Other);
	}

	#[test]
	fn translate_maps_into_taxonomy() {
		let transient = GraphQlError {
			message: "x".into(),
			extensions: serde_json::json!({"code": "INVALID_OPERATION"}).as_object().cloned(),
		};
		let lost = GraphQlError { message: "record not found".into(), extensions: None };
		let business = GraphQlError { message: "not_enough_balance".into(), extensions: None };

		assert!(translate(&[transient]).is_transient());
		assert!(matches!(translate(&[lost]), Error::InvalidGrant { .. }));

		let Error::Upstream(err) = translate(&[business]) else {
			panic!("Business errors should map to Error::Upstream.");
		};

		assert_eq!(err.kind, UpstreamErrorKind::NotEnoughBalance);
	}
}
