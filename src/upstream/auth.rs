//! Client for the upstream auth endpoint: refresh, login, and identity lookup.
//!
//! The endpoint reports failures through a mix of HTTP statuses, body substrings, and an
//! `error` object on `200` responses. [`AuthApi`] folds all of them into the crate taxonomy:
//! rejected refresh tokens become [`Error::InvalidGrant`], rejected logins become
//! [`Error::InvalidClient`], and server failures become [`Error::Transient`].

// crates.io
use oauth2::http::{Method, StatusCode};
// self
use crate::{
	_prelude::*,
	auth::{Credential, UnverifiedClaims, UserId},
	config::Endpoints,
	error::TransientError,
	http::{self, HttpResponse, HttpTransport},
	upstream::UpstreamError,
};

const INVALID_CREDENTIALS_CODE: i64 = 100;

/// Typed client for the upstream auth endpoint.
#[derive(Clone)]
pub struct AuthApi {
	base: Url,
	transport: Arc<dyn HttpTransport>,
}
impl AuthApi {
	/// Creates a client rooted at `base` (e.g. `https://host/auth/`) that sends through
	/// `transport`, normally a [`RetryingTransport`](crate::retry::RetryingTransport).
	pub fn new(base: Url, transport: Arc<dyn HttpTransport>) -> Self {
		Self { base, transport }
	}

	/// Exchanges `refresh_token` for a new credential owned by `user`.
	pub async fn refresh(&self, user: &UserId, refresh_token: &str) -> Result<Credential> {
		let url = Endpoints::join(&self.base, "token/refresh")?;
		let request = http::json_post(&url, &serde_json::json!({ "Token": refresh_token }))?;
		let tokens: DataEnvelope<TokenPair> = self.call(request).await?;

		Credential::from_tokens(user.clone(), tokens.data.access_token, tokens.data.refresh_token)
	}

	/// Logs in with email + password; the owning user is the access token's subject.
	pub async fn login(&self, email: &str, password: &str) -> Result<Credential> {
		let url = Endpoints::join(&self.base, "auth")?;
		let request = http::json_post(
			&url,
			&serde_json::json!({
				"Provider": "EmailPassword",
				"CredentialsEmailPassword": { "Email": email, "Password": password },
			}),
		)?;
		let tokens: DataEnvelope<TokenPair> = self.call(request).await?;
		let claims = UnverifiedClaims::parse(&tokens.data.access_token)?;
		let user = UserId::new(claims.require_sub()?)
			.map_err(|e| Error::malformed(format!("access token subject is invalid: {e}")))?;

		Credential::from_tokens(user, tokens.data.access_token, tokens.data.refresh_token)
	}

	/// Resolves the authoritative identity behind `access_token`.
	///
	/// Rejected tokens surface as [`Error::InvalidGrant`].
	pub async fn user_id(&self, access_token: &str) -> Result<UserId> {
		let url = Endpoints::join(&self.base, "user")?;
		let bearer = format!("Bearer {access_token}");
		let request =
			http::build_request(Method::GET, &url, &[("authorization", bearer.as_str())], None)?;
		let user: DataEnvelope<UserData> = self.call(request).await.map_err(|err| match err {
			Error::Upstream(upstream) => Error::InvalidGrant { reason: upstream.message },
			other => other,
		})?;

		UserId::new(&user.data.id)
			.map_err(|e| Error::malformed(format!("identity endpoint returned a bad id: {e}")))
	}

	async fn call<T>(&self, request: http::HttpRequest) -> Result<T>
	where
		T: serde::de::DeserializeOwned,
	{
		let response = self.transport.execute(request).await?;

		check_response(&response)?;

		http::decode_json(&response)
	}
}
impl Debug for AuthApi {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("AuthApi").field("base", &self.base.as_str()).finish()
	}
}

#[derive(Deserialize)]
struct DataEnvelope<T> {
	data: T,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenPair {
	access_token: String,
	refresh_token: String,
}

#[derive(Deserialize)]
struct UserData {
	id: String,
}

#[derive(Default, Deserialize)]
struct ErrorEnvelope {
	#[serde(default)]
	error: Option<ErrorBody>,
}

#[derive(Deserialize)]
struct ErrorBody {
	#[serde(default)]
	code: i64,
	#[serde(default)]
	message: String,
}

fn check_response(response: &HttpResponse) -> Result<()> {
	let status = response.status();

	if status.is_server_error() {
		return Err(TransientError::Upstream {
			message: "auth endpoint internal server error".into(),
			status: Some(status.as_u16()),
		}
		.into());
	}

	let body = http::body_text(response);

	if status == StatusCode::BAD_REQUEST && body.contains("Invalid refresh token") {
		return Err(Error::InvalidGrant { reason: "Invalid refresh token".into() });
	}
	if status == StatusCode::BAD_REQUEST && body.contains("The field Email must") {
		return Err(Error::InvalidClient { reason: "invalid email".into() });
	}
	if status != StatusCode::OK {
		return Err(UpstreamError::new(format!("http {status} '{body}'"), None).into());
	}

	let envelope: ErrorEnvelope = serde_json::from_slice(response.body()).unwrap_or_default();

	match envelope.error {
		Some(error) if error.code == INVALID_CREDENTIALS_CODE =>
			Err(Error::InvalidClient { reason: error.message }),
		Some(error) if error.code != 0 =>
			Err(UpstreamError::new(error.message, Some(error.code.to_string())).into()),
		_ => Ok(()),
	}
}
