//! Per-user credential cache with single-flight refresh.
//!
//! [`CredentialCache::token`] returns the stored credential while its access token stays fresh
//! and otherwise refreshes it through the auth endpoint. Refreshes for one user are serialized
//! behind a lazily created per-user guard, so concurrent callers racing past an expiry collapse
//! into a single upstream call; unrelated users never contend. The refresh and the write-back run
//! as one detached task, so a caller that stops waiting never strands a rotated refresh token
//! that was not persisted. A rejected refresh token surfaces
//! as [`Error::InvalidGrant`] and leaves the stored credential untouched, so the caller decides
//! whether to clear local state and prompt for a new login.

mod metrics;

pub use metrics::RefreshMetrics;

// self
use crate::{
	_prelude::*,
	auth::{Credential, UserId},
	config::CredentialPolicy,
	error::TransientError,
	obs::{self, FlowKind, FlowOutcome, FlowSpan},
	store::CredentialStore,
	upstream::AuthApi,
};

type FlowGuards = Arc<Mutex<HashMap<UserId, Arc<AsyncMutex<()>>>>>;

/// Persisted per-user credential holder.
#[derive(Clone)]
pub struct CredentialCache {
	store: Arc<dyn CredentialStore>,
	auth: Arc<AuthApi>,
	policy: CredentialPolicy,
	metrics: Arc<RefreshMetrics>,
	flow_guards: FlowGuards,
}
impl CredentialCache {
	/// Creates a cache over `store` that refreshes through `auth`.
	pub fn new(store: Arc<dyn CredentialStore>, auth: Arc<AuthApi>) -> Self {
		Self {
			store,
			auth,
			policy: CredentialPolicy::default(),
			metrics: Default::default(),
			flow_guards: Default::default(),
		}
	}

	/// Overrides the freshness/keep-alive policy.
	pub fn with_policy(mut self, policy: CredentialPolicy) -> Self {
		self.policy = policy;

		self
	}

	/// Returns the refresh counters.
	pub fn metrics(&self) -> Arc<RefreshMetrics> {
		self.metrics.clone()
	}

	/// Returns the auth endpoint client shared by this cache.
	pub fn auth(&self) -> &Arc<AuthApi> {
		&self.auth
	}

	/// Returns a credential for `user` whose access token is fresh, refreshing it when needed.
	///
	/// A missing credential fails with [`Error::InvalidGrant`]; the user must log in first.
	pub async fn token(&self, user: &UserId) -> Result<Credential> {
		let margin = self.policy.safety_margin;

		let now = OffsetDateTime::now_utc();

		if let Some(current) = self.store.fetch(user).await?.filter(|c| c.is_fresh_at(now, margin))
		{
			self.metrics.record_cache_hit();

			return Ok(current);
		}

		self.refresh_guarded(user, move |current, now| !current.is_fresh_at(now, margin)).await
	}

	/// Authenticates with email + password and stores the resulting credential.
	pub async fn login(&self, email: &str, password: &str) -> Result<Credential> {
		const KIND: FlowKind = FlowKind::Login;

		let span = FlowSpan::new(KIND, "login");

		obs::record_flow_outcome(KIND, FlowOutcome::Attempt);

		let result = span
			.instrument(async move {
				let credential = self.auth.login(email, password).await?;

				self.store.save(credential.clone()).await?;

				tracing::info!(user = %credential.user, "Stored credential after login.");

				Ok(credential)
			})
			.await;

		match &result {
			Ok(_) => obs::record_flow_outcome(KIND, FlowOutcome::Success),
			Err(_) => obs::record_flow_outcome(KIND, FlowOutcome::Failure),
		}

		result
	}

	/// Seeds (or replaces) the stored credential for `credential.user`.
	pub async fn remember(&self, credential: Credential) -> Result<()> {
		let guard = self.flow_guard(&credential.user);
		let _singleflight = guard.lock().await;

		self.store.save(credential).await?;

		Ok(())
	}

	/// Drops the stored credential for `user`, returning it when one existed.
	pub async fn forget(&self, user: &UserId) -> Result<Option<Credential>> {
		let guard = self.flow_guard(user);
		let _singleflight = guard.lock().await;

		Ok(self.store.remove(user).await?)
	}

	/// Refreshes every stored credential whose access token expired more than `max_idle` ago,
	/// returning how many were refreshed.
	///
	/// Individual failures are logged and skipped so one revoked user does not block the rest.
	pub async fn refresh_idle(&self, max_idle: Duration) -> Result<usize> {
		let now = OffsetDateTime::now_utc();
		let mut refreshed = 0;

		for credential in self.store.list().await? {
			if credential.idle_for(now) <= max_idle {
				continue;
			}

			let outcome = self
				.refresh_guarded(&credential.user, move |current, now| {
					current.idle_for(now) > max_idle
				})
				.await;

			match outcome {
				Ok(_) => refreshed += 1,
				Err(err) => tracing::warn!(
					user = %credential.user,
					error = %err,
					"Keep-alive refresh failed."
				),
			}
		}

		Ok(refreshed)
	}

	/// Runs [`refresh_idle`](Self::refresh_idle) periodically until `shutdown` fires.
	pub async fn run_keep_alive(&self, shutdown: CancellationToken) {
		loop {
			let jitter_ms =
				u64::try_from(self.policy.keep_alive_jitter.as_millis()).unwrap_or(u64::MAX);
			let jitter = if jitter_ms == 0 {
				StdDuration::ZERO
			} else {
				StdDuration::from_millis(rand::random_range(0..jitter_ms))
			};

			tokio::select! {
				_ = shutdown.cancelled() => break,
				_ = tokio::time::sleep(self.policy.keep_alive_interval + jitter) => {},
			}

			match self.refresh_idle(self.policy.max_idle).await {
				Ok(count) => tracing::info!(count, "Keep-alive refreshed idle credentials."),
				Err(err) => tracing::warn!(error = %err, "Keep-alive sweep failed."),
			}
		}
	}

	/// Runs [`refresh_locked`](Self::refresh_locked) on a spawned task and waits for it.
	async fn refresh_guarded<F>(&self, user: &UserId, needs_refresh: F) -> Result<Credential>
	where
		F: 'static + Send + Fn(&Credential, OffsetDateTime) -> bool,
	{
		let span = FlowSpan::new(FlowKind::Refresh, "refresh_guarded");
		let cache = self.clone();
		let user = user.clone();
		let flow = tokio::spawn(
			span.instrument(async move { cache.refresh_locked(&user, needs_refresh).await }),
		);

		match flow.await {
			Ok(result) => result,
			Err(e) => match e.try_into_panic() {
				Ok(panic) => std::panic::resume_unwind(panic),
				Err(_) => Err(TransientError::Upstream {
					message: "credential refresh was cancelled".into(),
					status: None,
				}
				.into()),
			},
		}
	}

	/// Takes the per-user guard, re-reads the stored credential, and refreshes and persists it
	/// when `needs_refresh` still holds.
	async fn refresh_locked<F>(&self, user: &UserId, needs_refresh: F) -> Result<Credential>
	where
		F: Fn(&Credential, OffsetDateTime) -> bool,
	{
		const KIND: FlowKind = FlowKind::Refresh;

		let guard = self.flow_guard(user);
		let _singleflight = guard.lock().await;
		let current = self.store.fetch(user).await?.ok_or_else(|| Error::InvalidGrant {
			reason: "No stored credential is available for this user".into(),
		})?;

		if !needs_refresh(&current, OffsetDateTime::now_utc()) {
			self.metrics.record_cache_hit();

			return Ok(current);
		}

		obs::record_flow_outcome(KIND, FlowOutcome::Attempt);
		self.metrics.record_attempt();

		let refreshed = match self.auth.refresh(user, current.refresh_token.expose()).await {
			Ok(refreshed) => refreshed,
			Err(err) => {
				self.metrics.record_failure();
				obs::record_flow_outcome(KIND, FlowOutcome::Failure);

				tracing::warn!(user = %user, error = %err, "Credential refresh failed.");

				return Err(err);
			},
		};

		self.store.save(refreshed.clone()).await.inspect_err(|_| {
			self.metrics.record_failure();
			obs::record_flow_outcome(KIND, FlowOutcome::Failure);
		})?;
		self.metrics.record_success();
		obs::record_flow_outcome(KIND, FlowOutcome::Success);

		tracing::debug!(
			user = %user,
			expires_at = %refreshed.expires_at,
			"Credential refreshed."
		);

		Ok(refreshed)
	}

	fn flow_guard(&self, user: &UserId) -> Arc<AsyncMutex<()>> {
		let mut guards = self.flow_guards.lock();

		guards.entry(user.clone()).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
	}
}
impl Debug for CredentialCache {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("CredentialCache")
			.field("auth", &self.auth)
			.field("policy", &self.policy)
			.field("metrics", &self.metrics)
			.finish()
	}
}
