//! Claims read from a JWT payload without verifying its signature.
//!
//! Upstream access tokens are only ever inspected locally for routing and freshness decisions;
//! anything that needs authority (lease assignment, attestation deposits) verifies separately.

// crates.io
use base64::{
	Engine,
	engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD},
};
// self
use crate::_prelude::*;

/// Registered claims the crate reads from unverified tokens.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnverifiedClaims {
	/// Subject (`sub`).
	#[serde(default)]
	pub sub: Option<String>,
	/// Token identifier (`jti`).
	#[serde(default)]
	pub jti: Option<String>,
	/// Expiry in seconds since the Unix epoch (`exp`).
	#[serde(default)]
	pub exp: Option<i64>,
	/// Issuer (`iss`).
	#[serde(default)]
	pub iss: Option<String>,
}
impl UnverifiedClaims {
	/// Decodes the payload segment of `token` without checking its signature.
	pub fn parse(token: &str) -> Result<Self> {
		let mut segments = token.trim().split('.');
		let (Some(_header), Some(payload), Some(_signature), None) =
			(segments.next(), segments.next(), segments.next(), segments.next())
		else {
			return Err(Error::malformed("token is not a three-segment JWT"));
		};
		let bytes = URL_SAFE_NO_PAD
			.decode(payload)
			.or_else(|_| URL_SAFE.decode(payload))
			.map_err(|e| Error::malformed(format!("token payload is not base64url: {e}")))?;

		serde_json::from_slice(&bytes)
			.map_err(|e| Error::malformed(format!("token payload is not a claims object: {e}")))
	}

	/// Returns the expiry instant, if the token carries a representable `exp`.
	pub fn expires_at(&self) -> Option<OffsetDateTime> {
		self.exp.and_then(|exp| OffsetDateTime::from_unix_timestamp(exp).ok())
	}

	/// Returns the subject or a [`Error::MalformedToken`] naming the missing claim.
	pub fn require_sub(&self) -> Result<&str> {
		self.sub
			.as_deref()
			.filter(|sub| !sub.is_empty())
			.ok_or_else(|| Error::malformed("missing sub claim"))
	}

	/// Returns the token id or a [`Error::MalformedToken`] naming the missing claim.
	pub fn require_jti(&self) -> Result<&str> {
		self.jti
			.as_deref()
			.filter(|jti| !jti.is_empty())
			.ok_or_else(|| Error::malformed("missing jti claim"))
	}
}
