//! Attestation lease records and the in-memory table both lease stores are built on.

// self
use crate::{
	_prelude::*,
	auth::{TokenSecret, UserId},
};

/// One deposited attestation token and its assignment state.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttestationLease {
	/// Token value; cleared by reclamation once the token expires.
	pub token: Option<TokenSecret>,
	/// Deposit instant.
	pub created_at: OffsetDateTime,
	/// Expiry read from the verified `exp` claim.
	pub expires_at: OffsetDateTime,
	/// Verified `jti` claim.
	pub token_id: String,
	/// Verified `sub` claim (the depositing app instance).
	pub token_sub: String,
	/// User this lease is assigned to.
	pub assigned_to: Option<UserId>,
	/// Assignment instant.
	pub assigned_at: Option<OffsetDateTime>,
	/// User agent of the request that caused the assignment.
	pub user_agent: Option<String>,
	/// Free-form label supplied by the depositor.
	pub source: Option<String>,
}
impl AttestationLease {
	/// Returns `true` while the lease holds a token that outlives `instant`.
	pub fn is_valid_at(&self, instant: OffsetDateTime) -> bool {
		self.token.is_some() && self.expires_at > instant
	}

	/// Returns `true` when no user holds this lease.
	pub fn is_unassigned(&self) -> bool {
		self.assigned_to.is_none()
	}
}
impl Debug for AttestationLease {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("AttestationLease")
			.field("token", &self.token.as_ref().map(|_| "<redacted>"))
			.field("expires_at", &self.expires_at)
			.field("token_id", &self.token_id)
			.field("assigned_to", &self.assigned_to)
			.field("assigned_at", &self.assigned_at)
			.field("source", &self.source)
			.finish()
	}
}

/// Pool counters reported by the broker's `stats` route.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
	/// Every lease ever deposited.
	pub total_tokens: u64,
	/// Unassigned leases that already expired.
	pub expired_unassigned: u64,
	/// Leases that have not expired yet.
	pub valid_tokens: u64,
	/// Unassigned leases that have not expired yet.
	pub available_tokens: u64,
	/// Unassigned leases that remain valid past the availability window.
	pub available_tokens_after_10_mins: u64,
	/// Assigned leases that have not expired yet.
	pub assigned_tokens: u64,
}

/// Assignment request evaluated atomically by a lease store.
#[derive(Clone, Debug)]
pub struct AssignRequest {
	/// Verified identity receiving the lease.
	pub user: UserId,
	/// User agent recorded on assignment.
	pub user_agent: Option<String>,
	/// Current instant.
	pub now: OffsetDateTime,
	/// An existing assignment is reused only if it outlives this instant.
	pub valid_after: OffsetDateTime,
}

/// Outcome of an [`AssignRequest`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeaseGrant {
	/// The lease now held by the user.
	pub lease: AttestationLease,
	/// `false` when an existing assignment was reused.
	pub newly_assigned: bool,
}

/// Lease rows plus lookup indices on token value and assignee.
#[derive(Clone, Debug, Default)]
pub(crate) struct LeaseTable {
	leases: Vec<AttestationLease>,
	by_token: HashMap<String, usize>,
	by_assignee: HashMap<UserId, Vec<usize>>,
}
impl LeaseTable {
	pub(crate) fn from_leases(leases: Vec<AttestationLease>) -> Self {
		let mut table = Self::default();

		for lease in leases {
			table.push(lease);
		}

		table
	}

	pub(crate) fn leases(&self) -> &[AttestationLease] {
		&self.leases
	}

	/// Appends `lease` unless its token is already present.
	pub(crate) fn insert(&mut self, lease: AttestationLease) -> bool {
		if lease.token.as_ref().is_some_and(|token| self.by_token.contains_key(token.expose())) {
			return false;
		}

		self.push(lease);

		true
	}

	pub(crate) fn assigned_to(
		&self,
		user: &UserId,
		valid_after: OffsetDateTime,
	) -> Option<&AttestationLease> {
		self.by_assignee
			.get(user)?
			.iter()
			.map(|&idx| &self.leases[idx])
			.find(|lease| lease.is_valid_at(valid_after))
	}

	/// Reuses a valid assignment for the user or assigns the earliest-expiring available lease.
	pub(crate) fn assign(&mut self, request: &AssignRequest) -> Option<LeaseGrant> {
		if let Some(existing) = self.assigned_to(&request.user, request.valid_after) {
			return Some(LeaseGrant { lease: existing.clone(), newly_assigned: false });
		}

		let idx = self
			.leases
			.iter()
			.enumerate()
			.filter(|(_, lease)| lease.is_unassigned() && lease.is_valid_at(request.now))
			.min_by_key(|(_, lease)| lease.expires_at)
			.map(|(idx, _)| idx)?;
		let lease = &mut self.leases[idx];

		lease.assigned_to = Some(request.user.clone());
		lease.assigned_at = Some(request.now);
		lease.user_agent = request.user_agent.clone();

		self.by_assignee.entry(request.user.clone()).or_default().push(idx);

		Some(LeaseGrant { lease: self.leases[idx].clone(), newly_assigned: true })
	}

	pub(crate) fn stats(&self, now: OffsetDateTime, window: Duration) -> Stats {
		let mut stats = Stats { total_tokens: self.leases.len() as u64, ..Default::default() };
		let horizon = now + window;

		for lease in &self.leases {
			let live = lease.expires_at > now;

			match (lease.is_unassigned(), live) {
				(true, true) => {
					stats.available_tokens += 1;

					if lease.expires_at > horizon {
						stats.available_tokens_after_10_mins += 1;
					}
				},
				(true, false) if lease.expires_at < now => stats.expired_unassigned += 1,
				(false, true) => stats.assigned_tokens += 1,
				_ => {},
			}
			if live {
				stats.valid_tokens += 1;
			}
		}

		stats
	}

	/// Clears the token value of every lease that expired before `now`.
	pub(crate) fn reclaim_expired(&mut self, now: OffsetDateTime) -> usize {
		let mut reclaimed = 0;

		for lease in &mut self.leases {
			if lease.expires_at >= now {
				continue;
			}
			if let Some(token) = lease.token.take() {
				self.by_token.remove(token.expose());

				reclaimed += 1;
			}
		}

		reclaimed
	}

	fn push(&mut self, lease: AttestationLease) {
		let idx = self.leases.len();

		if let Some(token) = &lease.token {
			self.by_token.insert(token.expose().to_owned(), idx);
		}
		if let Some(user) = &lease.assigned_to {
			self.by_assignee.entry(user.clone()).or_default().push(idx);
		}

		self.leases.push(lease);
	}
}

#[cfg(test)]
pub(crate) fn lease_fixture(token: &str, expires_at: OffsetDateTime) -> AttestationLease {
	AttestationLease {
		token: Some(TokenSecret::new(token)),
		created_at: expires_at - Duration::hours(1),
		expires_at,
		token_id: format!("jti-{token}"),
		token_sub: "app-instance".into(),
		assigned_to: None,
		assigned_at: None,
		user_agent: None,
		source: None,
	}
}

#[cfg(test)]
mod tests {
	// self
	use super::*;
	use crate::_preludet::*;

	fn request(user_id: &str, now: OffsetDateTime) -> AssignRequest {
		AssignRequest {
			user: user(user_id),
			user_agent: Some("test-agent".into()),
			now,
			valid_after: now + Duration::minutes(2),
		}
	}

	#[test]
	fn duplicates_are_rejected() {
		let now = OffsetDateTime::now_utc();
		let mut table = LeaseTable::default();

		assert!(table.insert(lease_fixture("a", now + Duration::hours(1))));
		assert!(!table.insert(lease_fixture("a", now + Duration::hours(2))));
		assert_eq!(table.leases().len(), 1);
	}

	#[test]
	fn assignment_picks_earliest_expiry_and_is_reused() {
		let now = OffsetDateTime::now_utc();
		let mut table = LeaseTable::from_leases(vec![
			lease_fixture("late", now + Duration::hours(2)),
			lease_fixture("early", now + Duration::hours(1)),
			lease_fixture("expired", now - Duration::minutes(1)),
		]);
		let first = table.assign(&request("alice", now)).expect("A lease should be available.");

		assert!(first.newly_assigned);
		assert_eq!(first.lease.token.as_ref().map(TokenSecret::expose), Some("early"));
		assert_eq!(first.lease.user_agent.as_deref(), Some("test-agent"));

		let again = table.assign(&request("alice", now)).expect("Reuse should succeed.");

		assert!(!again.newly_assigned);
		assert_eq!(again.lease, first.lease);

		let bob = table.assign(&request("bob", now)).expect("Second lease should be available.");

		assert_eq!(bob.lease.token.as_ref().map(TokenSecret::expose), Some("late"));
		assert!(table.assign(&request("carol", now)).is_none());
	}

	#[test]
	fn assignments_near_expiry_are_not_reused() {
		let now = OffsetDateTime::now_utc();
		let mut table = LeaseTable::from_leases(vec![
			lease_fixture("short", now + Duration::minutes(1)),
			lease_fixture("long", now + Duration::hours(1)),
		]);
		let first = table.assign(&request("alice", now)).expect("A lease should be available.");

		assert_eq!(first.lease.token.as_ref().map(TokenSecret::expose), Some("short"));

		let second = table.assign(&request("alice", now)).expect("A new lease should be assigned.");

		assert!(second.newly_assigned);
		assert_eq!(second.lease.token.as_ref().map(TokenSecret::expose), Some("long"));
	}

	#[test]
	fn stats_and_reclamation_follow_expiry() {
		let now = OffsetDateTime::now_utc();
		let mut table = LeaseTable::from_leases(vec![
			lease_fixture("expired", now - Duration::minutes(5)),
			lease_fixture("soon", now + Duration::minutes(5)),
			lease_fixture("later", now + Duration::minutes(30)),
			AttestationLease {
				assigned_to: Some(user("alice")),
				assigned_at: Some(now),
				..lease_fixture("held", now + Duration::minutes(40))
			},
		]);
		let stats = table.stats(now, Duration::minutes(10));

		assert_eq!(stats, Stats {
			total_tokens: 4,
			expired_unassigned: 1,
			valid_tokens: 3,
			available_tokens: 2,
			available_tokens_after_10_mins: 1,
			assigned_tokens: 1,
		});
		assert_eq!(table.reclaim_expired(now), 1);
		assert_eq!(table.reclaim_expired(now), 0);
		assert!(table.leases()[0].token.is_none());
		assert_eq!(table.leases()[0].token_id, "jti-expired");
		assert!(table.insert(lease_fixture("expired", now + Duration::hours(1))));
	}
}
