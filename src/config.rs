//! Typed policies and endpoint sets shared by the transport, credential, subscription, and
//! broker layers.

// self
use crate::{_prelude::*, error::ConfigError};

/// Default upstream GraphQL endpoint.
pub const DEFAULT_API_URL: &str = "https://egira-proxy-arqetk5clq-ew.a.run.app/api/graphql";
/// Default upstream auth endpoint base.
pub const DEFAULT_AUTH_URL: &str = "https://c2g091p01.emel.pt/auth/";
/// Default real-time subscription endpoint.
pub const DEFAULT_SUBSCRIPTIONS_URL: &str = "wss://apigira.emel.pt/graphql";
/// User agent sent with every upstream request unless overridden.
pub const DEFAULT_USER_AGENT: &str = "Gira/3.4.3 (Android 34)";

/// Timeout, attempt, and backoff policy applied by
/// [`RetryingTransport`](crate::retry::RetryingTransport).
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
	/// Per-attempt deadline.
	pub timeout: StdDuration,
	/// Upper bound on attempts per request, including the first.
	pub max_attempts: u32,
	/// Base of the exponential backoff; the delay after attempt `i` is `base^i / 2` seconds.
	pub backoff_base: f64,
	/// `User-Agent` header injected when the request does not carry one.
	pub user_agent: Option<String>,
}
impl RetryPolicy {
	/// Overrides the per-attempt deadline.
	pub fn with_timeout(mut self, timeout: StdDuration) -> Self {
		self.timeout = timeout;

		self
	}

	/// Overrides the attempt budget; values below one are clamped to one.
	pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
		self.max_attempts = max_attempts.max(1);

		self
	}

	/// Overrides the backoff base; negative values disable backoff.
	pub fn with_backoff_base(mut self, base: f64) -> Self {
		self.backoff_base = base.max(0.0);

		self
	}

	/// Overrides (or clears) the injected user agent.
	pub fn with_user_agent(mut self, user_agent: Option<String>) -> Self {
		self.user_agent = user_agent;

		self
	}

	/// Returns the delay to sleep after the zero-indexed attempt `attempt` failed.
	pub fn backoff(&self, attempt: u32) -> StdDuration {
		let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
		let secs = self.backoff_base.powi(exponent) / 2.0;

		if secs.is_finite() && secs > 0.0 {
			StdDuration::from_secs_f64(secs)
		} else {
			StdDuration::ZERO
		}
	}
}
impl Default for RetryPolicy {
	fn default() -> Self {
		Self {
			timeout: StdDuration::from_secs(5),
			max_attempts: 10,
			backoff_base: 1.5,
			user_agent: Some(DEFAULT_USER_AGENT.into()),
		}
	}
}

/// Freshness and keep-alive policy for [`CredentialCache`](crate::credentials::CredentialCache).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CredentialPolicy {
	/// Access tokens expiring within this margin are treated as stale.
	pub safety_margin: Duration,
	/// Credentials whose access token expired longer ago than this are refreshed by the
	/// keep-alive loop so their refresh token does not lapse.
	pub max_idle: Duration,
	/// Base period of the keep-alive loop.
	pub keep_alive_interval: StdDuration,
	/// Random extra delay added to each keep-alive period.
	pub keep_alive_jitter: StdDuration,
}
impl CredentialPolicy {
	/// Overrides the freshness margin.
	pub fn with_safety_margin(mut self, margin: Duration) -> Self {
		self.safety_margin = if margin.is_negative() { Duration::ZERO } else { margin };

		self
	}

	/// Overrides the idle threshold used by the keep-alive loop.
	pub fn with_max_idle(mut self, max_idle: Duration) -> Self {
		self.max_idle = max_idle;

		self
	}

	/// Overrides the keep-alive period and jitter.
	pub fn with_keep_alive(mut self, interval: StdDuration, jitter: StdDuration) -> Self {
		self.keep_alive_interval = interval;
		self.keep_alive_jitter = jitter;

		self
	}
}
impl Default for CredentialPolicy {
	fn default() -> Self {
		Self {
			safety_margin: Duration::seconds(10),
			max_idle: Duration::days(6),
			keep_alive_interval: StdDuration::from_secs(60 * 60),
			keep_alive_jitter: StdDuration::from_secs(300),
		}
	}
}

/// Delay policy between subscription reconnects.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
	/// Fixed part of the delay.
	pub base_delay: StdDuration,
	/// Upper bound of the uniformly random part of the delay.
	pub jitter: StdDuration,
}
impl ReconnectPolicy {
	/// Overrides the fixed delay.
	pub fn with_base_delay(mut self, base_delay: StdDuration) -> Self {
		self.base_delay = base_delay;

		self
	}

	/// Overrides the jitter bound.
	pub fn with_jitter(mut self, jitter: StdDuration) -> Self {
		self.jitter = jitter;

		self
	}

	/// Samples the next reconnect delay.
	pub fn next_delay(&self) -> StdDuration {
		let jitter_ms = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);

		if jitter_ms == 0 {
			return self.base_delay;
		}

		self.base_delay + StdDuration::from_millis(rand::random_range(0..jitter_ms))
	}
}
impl Default for ReconnectPolicy {
	fn default() -> Self {
		Self { base_delay: StdDuration::from_secs(1), jitter: StdDuration::from_millis(1_000) }
	}
}

/// Lease windows applied by the attestation broker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeasePolicy {
	/// Minimum remaining validity for an existing assignment to be reused.
	pub leeway: Duration,
	/// Forward-looking window reported by `available_tokens_after_10_mins`.
	pub availability_window: Duration,
	/// Period of the reclamation sweep.
	pub reclaim_interval: StdDuration,
}
impl LeasePolicy {
	/// Overrides the reuse leeway.
	pub fn with_leeway(mut self, leeway: Duration) -> Self {
		self.leeway = leeway;

		self
	}

	/// Overrides the reclamation period.
	pub fn with_reclaim_interval(mut self, interval: StdDuration) -> Self {
		self.reclaim_interval = interval;

		self
	}
}
impl Default for LeasePolicy {
	fn default() -> Self {
		Self {
			leeway: Duration::minutes(2),
			availability_window: Duration::minutes(10),
			reclaim_interval: StdDuration::from_secs(60 * 60),
		}
	}
}

/// Upstream and broker locations used by a [`Client`](crate::client::Client).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoints {
	/// GraphQL request/response endpoint.
	pub api: Url,
	/// Auth endpoint base (`token/refresh`, `auth`, `user` are joined onto it).
	pub auth: Url,
	/// Attestation broker base (`exchange`, `exchangeEnc`, `stats` are joined onto it).
	pub broker: Url,
	/// Real-time subscription endpoint.
	pub subscriptions: Url,
}
impl Endpoints {
	/// Starts a builder seeded with the production upstream locations.
	pub fn builder() -> EndpointsBuilder {
		EndpointsBuilder::default()
	}

	/// Joins `path` onto `base`, mapping failures to [`ConfigError::InvalidEndpoint`].
	pub fn join(base: &Url, path: &str) -> Result<Url> {
		base.join(path).map_err(|source| ConfigError::InvalidEndpoint { source }.into())
	}
}

/// Builder for [`Endpoints`].
#[derive(Clone, Debug, Default)]
pub struct EndpointsBuilder {
	api: Option<Url>,
	auth: Option<Url>,
	broker: Option<Url>,
	subscriptions: Option<Url>,
}
impl EndpointsBuilder {
	/// Sets the GraphQL endpoint.
	pub fn api(mut self, url: Url) -> Self {
		self.api = Some(url);

		self
	}

	/// Sets the auth endpoint base.
	pub fn auth(mut self, url: Url) -> Self {
		self.auth = Some(url);

		self
	}

	/// Sets the broker base.
	pub fn broker(mut self, url: Url) -> Self {
		self.broker = Some(url);

		self
	}

	/// Sets the subscription endpoint.
	pub fn subscriptions(mut self, url: Url) -> Self {
		self.subscriptions = Some(url);

		self
	}

	/// Finalizes the endpoint set.
	///
	/// Missing upstream locations fall back to the production defaults. The broker has no
	/// public default, so it falls back to `http://localhost:8080/`.
	pub fn build(self) -> Result<Endpoints> {
		Ok(Endpoints {
			api: or_default(self.api, DEFAULT_API_URL)?,
			auth: or_default(self.auth, DEFAULT_AUTH_URL)?,
			broker: or_default(self.broker, "http://localhost:8080/")?,
			subscriptions: or_default(self.subscriptions, DEFAULT_SUBSCRIPTIONS_URL)?,
		})
	}
}

fn or_default(url: Option<Url>, fallback: &str) -> Result<Url> {
	match url {
		Some(url) => Ok(url),
		None =>
			Url::parse(fallback).map_err(|source| ConfigError::InvalidEndpoint { source }.into()),
	}
}
