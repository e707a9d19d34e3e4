//! Crate-level error types shared by the transport, credential, broker, and subscription layers.

// self
use crate::_prelude::*;

/// Crate-wide result type alias returning [`Error`] by default.
pub type Result<T, E = Error> = std::result::Result<T, E>;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Canonical error exposed by public APIs.
#[derive(Debug, ThisError)]
pub enum Error {
	/// Storage-layer failure.
	#[error("{0}")]
	Storage(
		#[from]
		#[source]
		crate::store::StoreError,
	),
	/// Local configuration problem.
	#[error(transparent)]
	Config(#[from] ConfigError),
	/// Temporary upstream failure; retry with backoff.
	#[error(transparent)]
	Transient(#[from] TransientError),
	/// Transport failure (DNS, TCP, TLS).
	#[error(transparent)]
	Transport(#[from] TransportError),
	/// Attestation payload could not be encrypted or decrypted.
	#[error(transparent)]
	Crypto(#[from] crate::attestation::CryptoError),
	/// Upstream answered with a non-retryable application error.
	#[error(transparent)]
	Upstream(#[from] crate::upstream::UpstreamError),

	/// The refresh token was rejected or no credential is stored; the user must log in again.
	#[error("Credential is no longer usable: {reason}.")]
	InvalidGrant {
		/// Upstream- or crate-supplied reason string.
		reason: String,
	},
	/// The auth endpoint rejected the supplied login credentials.
	#[error("Login was rejected: {reason}.")]
	InvalidClient {
		/// Upstream-supplied reason string.
		reason: String,
	},
	/// The broker has no unassigned attestation token left; back off and retry later.
	#[error("No attestation tokens are available.")]
	PoolExhausted,
	/// A token or header presented at a service boundary could not be parsed or verified.
	#[error("Malformed token: {reason}.")]
	MalformedToken {
		/// Description of what was wrong with the input.
		reason: String,
	},
	/// A subscription stream failed with an error that must not be retried.
	#[error("Subscription failed: {reason}.")]
	Subscription {
		/// Description of the fatal stream error.
		reason: String,
	},
}
impl Error {
	/// Returns `true` when the caller should back off and retry the whole operation later.
	pub fn is_transient(&self) -> bool {
		matches!(self, Self::Transient(_) | Self::Transport(_) | Self::PoolExhausted)
	}

	pub(crate) fn malformed(reason: impl Into<String>) -> Self {
		Self::MalformedToken { reason: reason.into() }
	}
}

/// Configuration and validation failures.
#[derive(Debug, ThisError)]
pub enum ConfigError {
	/// HTTP request construction failed.
	#[error(transparent)]
	HttpRequest(#[from] oauth2::http::Error),
	/// An endpoint URL could not be derived.
	#[error("Endpoint URL is invalid.")]
	InvalidEndpoint {
		/// Underlying parsing failure.
		#[source]
		source: url::ParseError,
	},
	/// A request body could not be serialized.
	#[error("Request body could not be serialized.")]
	RequestBody(#[source] serde_json::Error),
	/// A token lacked the `exp` claim needed to derive its expiry.
	#[error("Token is missing its expiry claim.")]
	MissingExpiry,
}

/// Temporary failure variants (safe to retry).
#[derive(Debug, ThisError)]
pub enum TransientError {
	/// Upstream returned an unexpected but non-fatal response.
	#[error("Upstream returned an unexpected response: {message}.")]
	Upstream {
		/// Upstream- or crate-supplied message summarizing the failure.
		message: String,
		/// HTTP status code, when available.
		status: Option<u16>,
	},
	/// One network attempt hit its deadline; [`RetryingTransport`](crate::retry::RetryingTransport)
	/// replays these.
	#[error("Upstream attempt exceeded its {timeout:?} deadline.")]
	AttemptTimeout {
		/// Deadline that elapsed.
		timeout: StdDuration,
	},
	/// Every attempt hit the per-attempt deadline.
	#[error("Upstream request timed out after {attempts} attempt(s).")]
	Timeout {
		/// Number of attempts made before giving up.
		attempts: u32,
	},
	/// Upstream responded with JSON that could not be decoded.
	#[error("Upstream returned malformed JSON.")]
	ResponseParse {
		/// Structured parsing failure.
		#[source]
		source: serde_path_to_error::Error<serde_json::error::Error>,
		/// HTTP status code, when available.
		status: Option<u16>,
	},
}

/// Transport-level failures (network, IO).
#[derive(Debug, ThisError)]
pub enum TransportError {
	/// Underlying HTTP client reported a network failure.
	#[error("Network error occurred while calling the upstream.")]
	Network {
		/// Transport-specific network error.
		#[source]
		source: BoxError,
	},
	/// Underlying IO failure surfaced during transport.
	#[error("I/O error occurred while calling the upstream.")]
	Io(#[from] std::io::Error),
}
impl TransportError {
	/// Wraps a transport-specific network error.
	pub fn network(src: impl 'static + Send + Sync + std::error::Error) -> Self {
		Self::Network { source: Box::new(src) }
	}
}
impl From<ReqwestError> for TransportError {
	fn from(e: ReqwestError) -> Self {
		Self::network(e)
	}
}
