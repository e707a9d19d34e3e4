//! Lease lifecycle: deposit, exchange, stats, and reclamation.

// self
use crate::{
	_prelude::*,
	attestation::crypto,
	auth::{TokenSecret, UnverifiedClaims, UserId},
	broker::{
		AssignRequest, AttestationLease, AttestationVerifier, BrokerMetrics, IdentityVerifier,
		LeaseStore, Stats,
	},
	config::LeasePolicy,
	obs::{self, FlowKind, FlowOutcome, FlowSpan},
};

/// Attestation token broker.
///
/// Deposits are verified offline against the key set. Exchanges first trust the caller's
/// unverified `sub` claim when a lease is already assigned to it; otherwise the caller's
/// identity is confirmed with the upstream and a lease is assigned atomically, so concurrent
/// requests for one identity converge on the same lease.
#[derive(Clone)]
pub struct TokenBroker {
	store: Arc<dyn LeaseStore>,
	verifier: Arc<dyn AttestationVerifier>,
	identity: Arc<dyn IdentityVerifier>,
	policy: LeasePolicy,
	metrics: Arc<BrokerMetrics>,
}
impl TokenBroker {
	/// Creates a broker over `store`, checking deposits with `verifier` and callers with
	/// `identity`.
	pub fn new(
		store: Arc<dyn LeaseStore>,
		verifier: Arc<dyn AttestationVerifier>,
		identity: Arc<dyn IdentityVerifier>,
	) -> Self {
		Self {
			store,
			verifier,
			identity,
			policy: LeasePolicy::default(),
			metrics: Default::default(),
		}
	}

	/// Overrides the lease windows.
	pub fn with_policy(mut self, policy: LeasePolicy) -> Self {
		self.policy = policy;

		self
	}

	/// Returns the broker counters.
	pub fn metrics(&self) -> Arc<BrokerMetrics> {
		self.metrics.clone()
	}

	/// Returns the active lease windows.
	pub fn policy(&self) -> &LeasePolicy {
		&self.policy
	}

	/// Deposits an attestation token as an unassigned lease.
	pub async fn post_token(&self, token: &str, source: Option<&str>) -> Result<AttestationLease> {
		self.post_token_at(token, source, OffsetDateTime::now_utc()).await
	}

	/// Same as [`post_token`](Self::post_token) with an explicit clock.
	pub async fn post_token_at(
		&self,
		token: &str,
		source: Option<&str>,
		now: OffsetDateTime,
	) -> Result<AttestationLease> {
		const KIND: FlowKind = FlowKind::PostToken;

		let span = FlowSpan::new(KIND, "post_token");

		obs::record_flow_outcome(KIND, FlowOutcome::Attempt);

		let result = span.instrument(self.deposit(token, source, now)).await;

		match &result {
			Ok(_) => {
				self.metrics.record_deposit();
				obs::record_flow_outcome(KIND, FlowOutcome::Success);
			},
			Err(_) => {
				self.metrics.record_rejected_deposit();
				obs::record_flow_outcome(KIND, FlowOutcome::Failure);
			},
		}

		result
	}

	/// Exchanges the caller's upstream access token for an attestation token.
	pub async fn exchange_token(
		&self,
		credential: &str,
		user_agent: Option<&str>,
	) -> Result<TokenSecret> {
		self.exchange_token_at(credential, user_agent, OffsetDateTime::now_utc()).await
	}

	/// Same as [`exchange_token`](Self::exchange_token) with an explicit clock.
	pub async fn exchange_token_at(
		&self,
		credential: &str,
		user_agent: Option<&str>,
		now: OffsetDateTime,
	) -> Result<TokenSecret> {
		const KIND: FlowKind = FlowKind::Exchange;

		let span = FlowSpan::new(KIND, "exchange_token");

		obs::record_flow_outcome(KIND, FlowOutcome::Attempt);

		let result = span.instrument(self.exchange(credential, user_agent, now)).await;

		match &result {
			Ok(_) => obs::record_flow_outcome(KIND, FlowOutcome::Success),
			Err(_) => obs::record_flow_outcome(KIND, FlowOutcome::Failure),
		}

		result
	}

	/// Exchanges like [`exchange_token`](Self::exchange_token) and encrypts the result for the
	/// caller's credential.
	pub async fn exchange_encrypted(
		&self,
		credential: &str,
		user_agent: Option<&str>,
	) -> Result<String> {
		self.exchange_encrypted_at(credential, user_agent, OffsetDateTime::now_utc()).await
	}

	/// Same as [`exchange_encrypted`](Self::exchange_encrypted) with an explicit clock.
	pub async fn exchange_encrypted_at(
		&self,
		credential: &str,
		user_agent: Option<&str>,
		now: OffsetDateTime,
	) -> Result<String> {
		let token = self.exchange_token_at(credential, user_agent, now).await?;

		crypto::encrypt(token.expose(), credential)
	}

	/// Reports pool counters; `token` must verify, though it may have expired.
	pub async fn stats(&self, token: &str) -> Result<Stats> {
		self.stats_at(token, OffsetDateTime::now_utc()).await
	}

	/// Same as [`stats`](Self::stats) with an explicit clock.
	pub async fn stats_at(&self, token: &str, now: OffsetDateTime) -> Result<Stats> {
		if token.is_empty() {
			return Err(Error::malformed("missing token"));
		}

		self.verifier.verify(token).await?;

		Ok(self.store.stats(now, self.policy.availability_window).await?)
	}

	/// Clears the value of every lease that expired before `now`.
	pub async fn reclaim_expired(&self, now: OffsetDateTime) -> Result<usize> {
		let count = self.store.reclaim_expired(now).await?;

		self.metrics.record_reclaimed(count);

		if count > 0 {
			tracing::info!(count, "Reclaimed expired attestation leases.");
		}

		Ok(count)
	}

	/// Reclaims expired leases and reloads verification keys now and then every
	/// [`LeasePolicy::reclaim_interval`] until `shutdown` fires.
	pub async fn run_maintenance(&self, shutdown: CancellationToken) {
		loop {
			if let Err(err) = self.verifier.refresh().await {
				tracing::warn!(error = %err, "Attestation key reload failed.");
			}
			if let Err(err) = self.reclaim_expired(OffsetDateTime::now_utc()).await {
				tracing::warn!(error = %err, "Lease reclamation failed.");
			}

			tokio::select! {
				_ = shutdown.cancelled() => break,
				_ = tokio::time::sleep(self.policy.reclaim_interval) => {},
			}
		}
	}

	async fn deposit(
		&self,
		token: &str,
		source: Option<&str>,
		now: OffsetDateTime,
	) -> Result<AttestationLease> {
		if token.is_empty() {
			return Err(Error::malformed("missing token"));
		}

		let claims = self.verifier.verify(token).await?;
		let expires_at = claims.expires_at()?;

		if expires_at <= now {
			return Err(Error::malformed("token has expired"));
		}

		let lease = AttestationLease {
			token: Some(TokenSecret::new(token)),
			created_at: now,
			expires_at,
			token_id: claims.jti,
			token_sub: claims.sub,
			assigned_to: None,
			assigned_at: None,
			user_agent: None,
			source: source.filter(|s| !s.is_empty()).map(str::to_owned),
		};

		if !self.store.insert(lease.clone()).await? {
			return Err(Error::malformed("token already exists"));
		}

		tracing::info!(
			expires_at = %lease.expires_at,
			token_sub = %lease.token_sub,
			token_id = %lease.token_id,
			source = lease.source.as_deref().unwrap_or_default(),
			"Accepted attestation deposit."
		);

		Ok(lease)
	}

	async fn exchange(
		&self,
		credential: &str,
		user_agent: Option<&str>,
		now: OffsetDateTime,
	) -> Result<TokenSecret> {
		if credential.is_empty() {
			return Err(Error::malformed("missing token"));
		}

		let claims = UnverifiedClaims::parse(credential)?;
		let claimed = UserId::new(claims.require_sub()?)
			.map_err(|e| Error::malformed(format!("sub claim is invalid: {e}")))?;
		let valid_after = now + self.policy.leeway;

		if let Some(lease) = self.store.assigned_to(&claimed, valid_after).await? {
			self.metrics.record_fast_path();

			tracing::debug!(user = %claimed, "Served assigned lease without verification.");

			return lease_token(lease);
		}

		self.metrics.record_verification();

		let user = self.identity.user_id(credential).await.inspect_err(|err| {
			tracing::warn!(user = %claimed, error = %err, "Identity verification failed.");
		})?;
		let request = AssignRequest {
			user: user.clone(),
			user_agent: user_agent.filter(|s| !s.is_empty()).map(str::to_owned),
			now,
			valid_after,
		};
		let Some(grant) = self.store.assign(request).await? else {
			self.metrics.record_exhausted();

			tracing::warn!(user = %user, "No attestation tokens are available.");

			return Err(Error::PoolExhausted);
		};

		if grant.newly_assigned {
			self.metrics.record_assignment();
		}

		let fingerprint =
			grant.lease.token.as_ref().map(|t| obs::fingerprint(t.expose())).unwrap_or_default();

		tracing::info!(
			user = %user,
			newly_assigned = grant.newly_assigned,
			lease = %fingerprint,
			"Served verified lease."
		);

		lease_token(grant.lease)
	}
}
impl Debug for TokenBroker {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("TokenBroker")
			.field("policy", &self.policy)
			.field("metrics", &self.metrics)
			.finish()
	}
}

fn lease_token(lease: AttestationLease) -> Result<TokenSecret> {
	lease.token.ok_or(Error::PoolExhausted)
}
