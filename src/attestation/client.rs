//! HTTP client for the attestation broker.

// crates.io
use oauth2::http::{Method, StatusCode};
// self
use crate::{
	_prelude::*,
	attestation::crypto,
	auth::TokenSecret,
	broker::Stats,
	config::Endpoints,
	error::TransientError,
	http::{self, HttpResponse, HttpTransport},
};

/// Header carrying the caller's upstream access token.
pub const CREDENTIAL_HEADER: &str = "x-gira-token";
/// Header carrying an attestation token.
pub const ATTESTATION_HEADER: &str = "x-firebase-token";

const POOL_EXHAUSTED_MARKER: &str = "no tokens available";

/// Typed client for the broker's `exchange`, `exchangeEnc`, and `stats` routes.
#[derive(Clone)]
pub struct BrokerClient {
	base: Url,
	transport: Arc<dyn HttpTransport>,
}
impl BrokerClient {
	/// Creates a client rooted at `base` that sends through `transport`.
	pub fn new(base: Url, transport: Arc<dyn HttpTransport>) -> Self {
		Self { base, transport }
	}

	/// Exchanges the caller's access token for a raw attestation token.
	///
	/// An empty pool surfaces as [`Error::PoolExhausted`].
	pub async fn exchange(&self, access_token: &str) -> Result<TokenSecret> {
		let body = self.get_text("exchange", CREDENTIAL_HEADER, access_token).await?;

		Ok(TokenSecret::new(body))
	}

	/// Exchanges the caller's access token and encrypts the result locally for that credential.
	pub async fn exchange_encrypted(&self, access_token: &str) -> Result<TokenSecret> {
		let raw = self.exchange(access_token).await?;

		Ok(TokenSecret::new(crypto::encrypt(raw.expose(), access_token)?))
	}

	/// Exchanges the caller's access token and returns the broker-encrypted attestation.
	pub async fn exchange_remote_encrypted(&self, access_token: &str) -> Result<TokenSecret> {
		let body = self.get_text("exchangeEnc", CREDENTIAL_HEADER, access_token).await?;

		Ok(TokenSecret::new(body))
	}

	/// Reads the broker's pool counters, gated by any token the broker accepts.
	pub async fn stats(&self, attestation_token: &str) -> Result<Stats> {
		let response = self.get("stats", ATTESTATION_HEADER, attestation_token).await?;

		check_response(&response)?;

		http::decode_json(&response)
	}

	async fn get_text(&self, path: &str, header: &str, value: &str) -> Result<String> {
		let response = self.get(path, header, value).await?;

		check_response(&response)?;

		Ok(http::body_text(&response).trim().to_owned())
	}

	async fn get(&self, path: &str, header: &str, value: &str) -> Result<HttpResponse> {
		let url = Endpoints::join(&self.base, path)?;
		let request = http::build_request(Method::GET, &url, &[(header, value)], None)?;

		self.transport.execute(request).await
	}
}
impl Debug for BrokerClient {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("BrokerClient").field("base", &self.base.as_str()).finish()
	}
}

fn check_response(response: &HttpResponse) -> Result<()> {
	let status = response.status();

	if status == StatusCode::OK {
		return Ok(());
	}

	let body = http::body_text(response);

	if status == StatusCode::NOT_FOUND || body.contains(POOL_EXHAUSTED_MARKER) {
		return Err(Error::PoolExhausted);
	}
	if status == StatusCode::BAD_REQUEST {
		return Err(Error::InvalidGrant { reason: body.trim().to_owned() });
	}

	Err(TransientError::Upstream {
		message: format!("broker answered {status}"),
		status: Some(status.as_u16()),
	}
	.into())
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	fn response(status: u16, body: &str) -> HttpResponse {
		let mut response = HttpResponse::new(body.as_bytes().to_vec());

		*response.status_mut() = StatusCode::from_u16(status).expect("Status fixture is valid.");

		response
	}

	#[test]
	fn statuses_map_into_taxonomy() {
		assert!(check_response(&response(200, "token")).is_ok());
		assert!(matches!(check_response(&response(404, "")), Err(Error::PoolExhausted)));
		assert!(matches!(
			check_response(&response(500, "failed: no tokens available")),
			Err(Error::PoolExhausted)
		));
		assert!(matches!(
			check_response(&response(400, "invalid token\n")),
			Err(Error::InvalidGrant { reason }) if reason == "invalid token"
		));
		assert!(check_response(&response(503, "")).expect_err("503 must fail.").is_transient());
	}
}
