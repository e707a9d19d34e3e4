//! HTTP surface of the broker.

// crates.io
use axum::{
	Json, Router,
	extract::State,
	http::{HeaderMap, StatusCode, header::USER_AGENT},
	response::{IntoResponse, Response},
	routing::get,
};
// self
use crate::{
	_prelude::*,
	attestation::{ATTESTATION_HEADER, CREDENTIAL_HEADER},
	broker::TokenBroker,
};

/// Header naming where a deposited token came from.
pub const SOURCE_HEADER: &str = "x-token-source";

/// Builds the broker router: `/post`, `/exchange`, `/exchangeEnc`, and `/stats`.
pub fn router(broker: Arc<TokenBroker>) -> Router {
	Router::new()
		.route("/post", get(post_token).post(post_token))
		.route("/exchange", get(exchange))
		.route("/exchangeEnc", get(exchange_encrypted))
		.route("/stats", get(stats))
		.with_state(broker)
}

/// Maps crate errors onto broker response statuses.
#[derive(Debug)]
pub struct ApiError(pub Error);
impl ApiError {
	/// Returns the status this error is reported with.
	pub fn status(&self) -> StatusCode {
		match &self.0 {
			Error::MalformedToken { .. }
			| Error::InvalidGrant { .. }
			| Error::InvalidClient { .. } => StatusCode::BAD_REQUEST,
			Error::PoolExhausted => StatusCode::NOT_FOUND,
			Error::Transient(_) | Error::Transport(_) => StatusCode::SERVICE_UNAVAILABLE,
			_ => StatusCode::INTERNAL_SERVER_ERROR,
		}
	}
}
impl From<Error> for ApiError {
	fn from(e: Error) -> Self {
		Self(e)
	}
}
impl IntoResponse for ApiError {
	fn into_response(self) -> Response {
		let status = self.status();
		let body = match status {
			StatusCode::BAD_REQUEST => self.0.to_string(),
			StatusCode::NOT_FOUND => "no tokens available".into(),
			StatusCode::SERVICE_UNAVAILABLE => "identity check unavailable, retry later".into(),
			_ => {
				tracing::error!(error = %self.0, "Broker request failed.");

				"internal error".into()
			},
		};

		(status, body).into_response()
	}
}

async fn post_token(
	State(broker): State<Arc<TokenBroker>>,
	headers: HeaderMap,
) -> Result<&'static str, ApiError> {
	let source = header(&headers, SOURCE_HEADER);

	broker.post_token(header(&headers, ATTESTATION_HEADER), Some(source)).await?;

	Ok("thanks!")
}

async fn exchange(
	State(broker): State<Arc<TokenBroker>>,
	headers: HeaderMap,
) -> Result<String, ApiError> {
	let token = broker
		.exchange_token(
			header(&headers, CREDENTIAL_HEADER),
			Some(header(&headers, USER_AGENT.as_str())),
		)
		.await?;

	Ok(token.expose().to_owned())
}

async fn exchange_encrypted(
	State(broker): State<Arc<TokenBroker>>,
	headers: HeaderMap,
) -> Result<String, ApiError> {
	let sealed = broker
		.exchange_encrypted(
			header(&headers, CREDENTIAL_HEADER),
			Some(header(&headers, USER_AGENT.as_str())),
		)
		.await?;

	Ok(sealed)
}

async fn stats(
	State(broker): State<Arc<TokenBroker>>,
	headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
	let stats = broker.stats(header(&headers, ATTESTATION_HEADER)).await?;

	Ok(Json(stats))
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
	headers.get(name).and_then(|value| value.to_str().ok()).map(str::trim).unwrap_or_default()
}
