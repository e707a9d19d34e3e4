//! Token verification seams used by the broker.
//!
//! [`AttestationVerifier`] checks deposited attestation tokens against a published key set;
//! [`IdentityVerifier`] asks the upstream who a caller's access token belongs to.

// crates.io
use jsonwebtoken::{
	Algorithm, DecodingKey, Validation,
	jwk::{Jwk, JwkSet, KeyAlgorithm},
};
use tokio::time::Instant;
// self
use crate::{
	_prelude::*,
	auth::UserId,
	error::{TransientError, TransportError},
	upstream::AuthApi,
};

/// Issuer of the attestation tokens the broker accepts by default.
pub const DEFAULT_ISSUER: &str = "https://firebaseappcheck.googleapis.com/860507348154";
/// Published key set for [`DEFAULT_ISSUER`].
pub const DEFAULT_JWKS_URL: &str = "https://firebaseappcheck.googleapis.com/v1/jwks";
/// Minimum spacing between key set reloads triggered by unknown key ids.
pub const DEFAULT_RELOAD_COOLDOWN: StdDuration = StdDuration::from_secs(5 * 60);

/// Boxed future returned by verifier operations.
pub type VerifyFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + 'a + Send>>;

/// Claims of a verified attestation token.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttestationClaims {
	/// Depositing app instance.
	pub sub: String,
	/// Token id.
	#[serde(default)]
	pub jti: String,
	/// Issuer.
	pub iss: String,
	/// Expiry in seconds since the Unix epoch.
	pub exp: i64,
}
impl AttestationClaims {
	/// Returns the expiry instant.
	pub fn expires_at(&self) -> Result<OffsetDateTime> {
		OffsetDateTime::from_unix_timestamp(self.exp)
			.map_err(|e| Error::malformed(format!("exp claim is out of range: {e}")))
	}
}

/// Verifies signature and issuer of attestation tokens.
///
/// Expiry is left to the caller so deposits and the stats gate can apply different rules; the
/// `exp` claim must still be present.
pub trait AttestationVerifier
where
	Self: Send + Sync,
{
	/// Verifies `token` and returns its claims; failures surface as [`Error::MalformedToken`].
	fn verify<'a>(&'a self, token: &'a str) -> VerifyFuture<'a, AttestationClaims>;

	/// Reloads key material; a no-op for static verifiers.
	fn refresh(&self) -> VerifyFuture<'_, ()> {
		Box::pin(async { Ok(()) })
	}
}

/// Resolves the authoritative identity behind an upstream access token.
pub trait IdentityVerifier
where
	Self: Send + Sync,
{
	/// Returns the verified user; rejected tokens surface as [`Error::InvalidGrant`].
	fn user_id<'a>(&'a self, access_token: &'a str) -> VerifyFuture<'a, UserId>;
}
impl IdentityVerifier for AuthApi {
	fn user_id<'a>(&'a self, access_token: &'a str) -> VerifyFuture<'a, UserId> {
		Box::pin(AuthApi::user_id(self, access_token))
	}
}

/// [`AttestationVerifier`] backed by a JSON Web Key Set.
///
/// Tokens are checked with the algorithm the matching key declares. An unknown key id reloads a
/// remote key set at most once per cool-down; [`refresh`](AttestationVerifier::refresh) always
/// reloads.
pub struct JwksVerifier {
	issuer: String,
	source: Option<(Url, ReqwestClient)>,
	keys: RwLock<JwkSet>,
	reload_cooldown: StdDuration,
	last_reload: Mutex<Option<Instant>>,
}
impl JwksVerifier {
	/// Creates a verifier that downloads keys from `jwks_url`; call
	/// [`refresh`](AttestationVerifier::refresh) before first use.
	pub fn remote(jwks_url: Url, issuer: impl Into<String>, client: ReqwestClient) -> Self {
		Self::build(issuer.into(), Some((jwks_url, client)), JwkSet { keys: Vec::new() })
	}

	/// Creates a verifier over a fixed key set.
	pub fn with_keys(keys: JwkSet, issuer: impl Into<String>) -> Self {
		Self::build(issuer.into(), None, keys)
	}

	/// Overrides the minimum spacing between reloads caused by unknown key ids.
	pub fn with_reload_cooldown(mut self, cooldown: StdDuration) -> Self {
		self.reload_cooldown = cooldown;

		self
	}

	fn build(issuer: String, source: Option<(Url, ReqwestClient)>, keys: JwkSet) -> Self {
		Self {
			issuer,
			source,
			keys: RwLock::new(keys),
			reload_cooldown: DEFAULT_RELOAD_COOLDOWN,
			last_reload: Mutex::new(None),
		}
	}

	/// Returns the number of loaded keys.
	pub fn key_count(&self) -> usize {
		self.keys.read().keys.len()
	}

	fn decode(&self, token: &str) -> Result<Option<AttestationClaims>> {
		let header = jsonwebtoken::decode_header(token)
			.map_err(|e| Error::malformed(format!("invalid token header: {e}")))?;
		let kid = header.kid.ok_or_else(|| Error::malformed("token header has no kid"))?;
		let (key, alg) = {
			let keys = self.keys.read();
			let Some(jwk) = keys.find(&kid) else {
				return Ok(None);
			};
			let key = DecodingKey::from_jwk(jwk)
				.map_err(|e| Error::malformed(format!("key {kid} is unusable: {e}")))?;

			(key, declared_algorithm(jwk)?)
		};

		if header.alg != alg {
			return Err(Error::malformed(format!(
				"token is signed with {:?} but key {kid} is declared for {alg:?}",
				header.alg
			)));
		}

		let mut validation = Validation::new(alg);

		validation.set_issuer(&[self.issuer.as_str()]);
		validation.set_required_spec_claims(&["exp", "iss", "sub"]);
		validation.validate_exp = false;
		validation.validate_aud = false;
		validation.leeway = 0;

		let data = jsonwebtoken::decode::<AttestationClaims>(token, &key, &validation)
			.map_err(|e| Error::malformed(format!("token verification failed: {e}")))?;

		Ok(Some(data.claims))
	}

	/// Claims the next unknown-kid reload slot; `false` while the cool-down is running.
	fn claim_reload(&self) -> bool {
		let mut last = self.last_reload.lock();
		let now = Instant::now();

		if last.is_some_and(|at| now.duration_since(at) < self.reload_cooldown) {
			return false;
		}

		*last = Some(now);

		true
	}

	async fn fetch_keys(&self) -> Result<()> {
		let Some((url, client)) = &self.source else {
			return Ok(());
		};

		*self.last_reload.lock() = Some(Instant::now());

		let response = client.get(url.clone()).send().await.map_err(TransportError::from)?;
		let status = response.status();

		if !status.is_success() {
			return Err(TransientError::Upstream {
				message: format!("key set endpoint answered {status}"),
				status: Some(status.as_u16()),
			}
			.into());
		}

		let body = response.bytes().await.map_err(TransportError::from)?;
		let keys: JwkSet =
			serde_path_to_error::deserialize(&mut serde_json::Deserializer::from_slice(&body))
				.map_err(|source| TransientError::ResponseParse {
					source,
					status: Some(status.as_u16()),
				})?;

		tracing::info!(keys = keys.keys.len(), "Loaded attestation key set.");

		*self.keys.write() = keys;

		Ok(())
	}
}
impl AttestationVerifier for JwksVerifier {
	fn verify<'a>(&'a self, token: &'a str) -> VerifyFuture<'a, AttestationClaims> {
		Box::pin(async move {
			if let Some(claims) = self.decode(token)? {
				return Ok(claims);
			}
			if self.source.is_some() && self.claim_reload() {
				tracing::debug!("Unknown key id; reloading key set.");

				self.fetch_keys().await?;

				if let Some(claims) = self.decode(token)? {
					return Ok(claims);
				}
			}

			Err(Error::malformed("token is signed with an unknown key"))
		})
	}

	fn refresh(&self) -> VerifyFuture<'_, ()> {
		Box::pin(self.fetch_keys())
	}
}
impl Debug for JwksVerifier {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("JwksVerifier")
			.field("issuer", &self.issuer)
			.field("source", &self.source.as_ref().map(|(url, _)| url.as_str()))
			.field("keys", &self.key_count())
			.field("reload_cooldown", &self.reload_cooldown)
			.finish()
	}
}

/// Returns the signing algorithm `jwk` is declared for.
fn declared_algorithm(jwk: &Jwk) -> Result<Algorithm> {
	let Some(declared) = &jwk.common.key_algorithm else {
		return Err(Error::malformed("key does not declare its algorithm"));
	};
	let alg = match declared {
		KeyAlgorithm::HS256 => Algorithm::HS256,
		KeyAlgorithm::HS384 => Algorithm::HS384,
		KeyAlgorithm::HS512 => Algorithm::HS512,
		KeyAlgorithm::ES256 => Algorithm::ES256,
		KeyAlgorithm::ES384 => Algorithm::ES384,
		KeyAlgorithm::RS256 => Algorithm::RS256,
		KeyAlgorithm::RS384 => Algorithm::RS384,
		KeyAlgorithm::RS512 => Algorithm::RS512,
		KeyAlgorithm::PS256 => Algorithm::PS256,
		KeyAlgorithm::PS384 => Algorithm::PS384,
		KeyAlgorithm::PS512 => Algorithm::PS512,
		KeyAlgorithm::EdDSA => Algorithm::EdDSA,
		other => {
			return Err(Error::malformed(format!("key is declared for {other:?}, not signing")));
		},
	};

	Ok(alg)
}
