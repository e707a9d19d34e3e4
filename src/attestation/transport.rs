//! Header-injecting transport decorators for one user's upstream calls.

// crates.io
use oauth2::http::{
	HeaderName, HeaderValue, StatusCode,
	header::{AUTHORIZATION, WWW_AUTHENTICATE},
};
// self
use crate::{
	_prelude::*,
	attestation::{ATTESTATION_HEADER, BrokerClient},
	auth::UserId,
	credentials::CredentialCache,
	http::{HttpRequest, HttpTransport, TransportFuture},
	obs,
};

/// Adds `authorization: Bearer <access token>` for `user`, refreshing through the cache.
#[derive(Debug)]
pub struct BearerTransport<T> {
	inner: T,
	cache: CredentialCache,
	user: UserId,
}
impl<T> BearerTransport<T>
where
	T: HttpTransport,
{
	/// Wraps `inner` so every request carries `user`'s bearer token.
	pub fn new(inner: T, cache: CredentialCache, user: UserId) -> Self {
		Self { inner, cache, user }
	}
}
impl<T> HttpTransport for BearerTransport<T>
where
	T: HttpTransport,
{
	fn execute(&self, mut request: HttpRequest) -> TransportFuture<'_> {
		Box::pin(async move {
			let credential = self.cache.token(&self.user).await?;
			let bearer = format!("Bearer {}", credential.access_token.expose());

			request.headers_mut().insert(AUTHORIZATION, header_value(&bearer)?);

			self.inner.execute(request).await
		})
	}
}

/// Adds the encrypted attestation for `user` as `x-firebase-token`.
#[derive(Debug)]
pub struct AttestationTransport<T> {
	inner: T,
	cache: CredentialCache,
	broker: Arc<BrokerClient>,
	user: UserId,
}
impl<T> AttestationTransport<T>
where
	T: HttpTransport,
{
	/// Wraps `inner` so every request carries an attestation obtained from `broker`.
	pub fn new(inner: T, cache: CredentialCache, broker: Arc<BrokerClient>, user: UserId) -> Self {
		Self { inner, cache, broker, user }
	}
}
impl<T> HttpTransport for AttestationTransport<T>
where
	T: HttpTransport,
{
	fn execute(&self, mut request: HttpRequest) -> TransportFuture<'_> {
		Box::pin(async move {
			let credential = self.cache.token(&self.user).await?;
			let attestation =
				self.broker.exchange_encrypted(credential.access_token.expose()).await?;

			request.headers_mut().insert(
				HeaderName::from_static(ATTESTATION_HEADER),
				header_value(attestation.expose())?,
			);

			let response = self.inner.execute(request).await?;

			if response.status() == StatusCode::UNAUTHORIZED {
				tracing::warn!(
					user = %self.user,
					challenge = response
						.headers()
						.get(WWW_AUTHENTICATE)
						.and_then(|v| v.to_str().ok())
						.unwrap_or_default(),
					attestation = %obs::fingerprint(attestation.expose()),
					"Upstream rejected the attestation."
				);
			}

			Ok(response)
		})
	}
}

fn header_value(value: &str) -> Result<HeaderValue> {
	HeaderValue::from_str(value).map_err(|_| Error::malformed("token is not a valid header value"))
}
