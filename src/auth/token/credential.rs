//! Per-user upstream credential: an access/refresh token pair plus the access-token expiry.

// self
use crate::{
	_prelude::*,
	auth::{UnverifiedClaims, UserId, token::secret::TokenSecret},
	error::ConfigError,
};

/// Access/refresh token pair owned by one user.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
	/// Owning user.
	pub user: UserId,
	/// Bearer token presented to the upstream; callers must avoid logging it.
	pub access_token: TokenSecret,
	/// Token exchanged for a new pair once the access token expires.
	pub refresh_token: TokenSecret,
	/// Expiry read from the access token's `exp` claim.
	pub expires_at: OffsetDateTime,
}
impl Credential {
	/// Builds a credential, reading the expiry from the unverified access token.
	pub fn from_tokens(
		user: UserId,
		access_token: impl Into<String>,
		refresh_token: impl Into<String>,
	) -> Result<Self> {
		let access_token = access_token.into();
		let expires_at = UnverifiedClaims::parse(&access_token)?
			.expires_at()
			.ok_or(ConfigError::MissingExpiry)?;

		Ok(Self {
			user,
			access_token: TokenSecret::new(access_token),
			refresh_token: TokenSecret::new(refresh_token),
			expires_at,
		})
	}

	/// Returns `true` while the access token stays valid for at least `margin` past `instant`.
	pub fn is_fresh_at(&self, instant: OffsetDateTime, margin: Duration) -> bool {
		instant + margin < self.expires_at
	}

	/// Returns `true` if the access token has expired at the provided instant.
	pub fn is_expired_at(&self, instant: OffsetDateTime) -> bool {
		instant >= self.expires_at
	}

	/// Returns how long ago the access token expired (zero while it is still valid).
	pub fn idle_for(&self, instant: OffsetDateTime) -> Duration {
		if self.is_expired_at(instant) { instant - self.expires_at } else { Duration::ZERO }
	}
}
impl Debug for Credential {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("Credential")
			.field("user", &self.user)
			.field("access_token", &"<redacted>")
			.field("refresh_token", &"<redacted>")
			.field("expires_at", &self.expires_at)
			.finish()
	}
}
