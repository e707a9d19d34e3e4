//! Lease persistence contracts plus memory and file backends.
//!
//! Every mutating operation runs under one write lock, so the "re-check, then assign the
//! earliest-expiring lease" step of an exchange is atomic with respect to every other exchange
//! in the process. The file backend persists inside the same critical section and only publishes
//! the new table once the snapshot is on disk. Its lock is asynchronous and snapshot writes run on
//! the blocking pool, so a slow disk stalls only lease writers, never runtime workers.

// std
use std::path::{Path, PathBuf};
// crates.io
use async_lock::RwLock as AsyncRwLock;
// self
use crate::{
	_prelude::*,
	auth::UserId,
	broker::{AssignRequest, AttestationLease, LeaseGrant, Stats, lease::LeaseTable},
	store::{
		StoreError, StoreFuture,
		file::{load_snapshot, persist_snapshot},
	},
};

/// Storage backend contract implemented by lease stores.
pub trait LeaseStore
where
	Self: Send + Sync,
{
	/// Stores a new lease; returns `false` when its token is already present.
	fn insert(&self, lease: AttestationLease) -> StoreFuture<'_, bool>;

	/// Returns the lease assigned to `user` that stays valid past `valid_after`, if any.
	fn assigned_to<'a>(
		&'a self,
		user: &'a UserId,
		valid_after: OffsetDateTime,
	) -> StoreFuture<'a, Option<AttestationLease>>;

	/// Atomically reuses or assigns a lease for `request.user`; `None` when the pool is empty.
	fn assign(&self, request: AssignRequest) -> StoreFuture<'_, Option<LeaseGrant>>;

	/// Computes pool counters at `now` with the given forward-looking window.
	fn stats(&self, now: OffsetDateTime, window: Duration) -> StoreFuture<'_, Stats>;

	/// Clears the value of every lease that expired before `now`, returning how many changed.
	fn reclaim_expired(&self, now: OffsetDateTime) -> StoreFuture<'_, usize>;
}

/// Thread-safe in-memory [`LeaseStore`] for tests and single-process demos.
#[derive(Clone, Debug, Default)]
pub struct MemoryLeaseStore(Arc<RwLock<LeaseTable>>);
impl MemoryLeaseStore {
	/// Returns a copy of every stored lease in deposit order.
	pub fn leases(&self) -> Vec<AttestationLease> {
		self.0.read().leases().to_vec()
	}
}
impl LeaseStore for MemoryLeaseStore {
	fn insert(&self, lease: AttestationLease) -> StoreFuture<'_, bool> {
		Box::pin(async move { Ok(self.0.write().insert(lease)) })
	}

	fn assigned_to<'a>(
		&'a self,
		user: &'a UserId,
		valid_after: OffsetDateTime,
	) -> StoreFuture<'a, Option<AttestationLease>> {
		Box::pin(async move { Ok(self.0.read().assigned_to(user, valid_after).cloned()) })
	}

	fn assign(&self, request: AssignRequest) -> StoreFuture<'_, Option<LeaseGrant>> {
		Box::pin(async move { Ok(self.0.write().assign(&request)) })
	}

	fn stats(&self, now: OffsetDateTime, window: Duration) -> StoreFuture<'_, Stats> {
		Box::pin(async move { Ok(self.0.read().stats(now, window)) })
	}

	fn reclaim_expired(&self, now: OffsetDateTime) -> StoreFuture<'_, usize> {
		Box::pin(async move { Ok(self.0.write().reclaim_expired(now)) })
	}
}

/// Persists leases to a JSON snapshot after each mutation.
#[derive(Debug)]
pub struct FileLeaseStore {
	path: PathBuf,
	inner: AsyncRwLock<LeaseTable>,
}
impl FileLeaseStore {
	/// Opens (or creates) a lease snapshot at `path`.
	pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
		let path = path.into();
		let leases: Vec<AttestationLease> = load_snapshot(&path)?;

		Ok(Self { path, inner: AsyncRwLock::new(LeaseTable::from_leases(leases)) })
	}

	/// Returns the snapshot location.
	pub fn path(&self) -> &Path {
		&self.path
	}

	async fn mutate<R>(
		&self,
		apply: impl FnOnce(&mut LeaseTable) -> R,
		changed: impl FnOnce(&R) -> bool,
	) -> Result<R, StoreError> {
		let mut guard = self.inner.write().await;
		let mut next = guard.clone();
		let outcome = apply(&mut next);

		if changed(&outcome) {
			let path = self.path.clone();
			let written = tokio::task::spawn_blocking(move || {
				persist_snapshot(&path, next.leases()).map(|()| next)
			})
			.await
			.map_err(|e| StoreError::Backend {
				message: format!("Lease snapshot writer stopped: {e}"),
			})??;

			*guard = written;
		}

		Ok(outcome)
	}
}
impl LeaseStore for FileLeaseStore {
	fn insert(&self, lease: AttestationLease) -> StoreFuture<'_, bool> {
		Box::pin(async move {
			self.mutate(|table| table.insert(lease), |inserted| *inserted).await
		})
	}

	fn assigned_to<'a>(
		&'a self,
		user: &'a UserId,
		valid_after: OffsetDateTime,
	) -> StoreFuture<'a, Option<AttestationLease>> {
		Box::pin(async move { Ok(self.inner.read().await.assigned_to(user, valid_after).cloned()) })
	}

	fn assign(&self, request: AssignRequest) -> StoreFuture<'_, Option<LeaseGrant>> {
		Box::pin(async move {
			self.mutate(
				|table| table.assign(&request),
				|grant| grant.as_ref().is_some_and(|grant| grant.newly_assigned),
			)
			.await
		})
	}

	fn stats(&self, now: OffsetDateTime, window: Duration) -> StoreFuture<'_, Stats> {
		Box::pin(async move { Ok(self.inner.read().await.stats(now, window)) })
	}

	fn reclaim_expired(&self, now: OffsetDateTime) -> StoreFuture<'_, usize> {
		Box::pin(async move {
			self.mutate(|table| table.reclaim_expired(now), |count| *count > 0).await
		})
	}
}

#[cfg(test)]
mod tests {
	// std
	use std::fs;
	// crates.io
	use tokio::runtime::Runtime;
	// self
	use super::*;
	use crate::{_preludet::*, broker::lease::lease_fixture, store::file::temp_path};

	#[test]
	fn file_store_survives_reopen() {
		let path = temp_path("gira_broker_lease_store");
		let now = OffsetDateTime::now_utc();
		let rt = Runtime::new().expect("Failed to build Tokio runtime for lease store test.");
		let store = FileLeaseStore::open(&path).expect("Failed to open lease snapshot.");

		assert!(
			rt.block_on(store.insert(lease_fixture("a", now + Duration::hours(1))))
				.expect("Insert should succeed.")
		);
		assert!(
			rt.block_on(store.insert(lease_fixture("b", now - Duration::hours(1))))
				.expect("Insert should succeed.")
		);

		let grant = rt
			.block_on(store.assign(AssignRequest {
				user: user("alice"),
				user_agent: Some("agent".into()),
				now,
				valid_after: now + Duration::minutes(2),
			}))
			.expect("Assign should succeed.")
			.expect("A lease should be available.");

		assert!(grant.newly_assigned);
		assert_eq!(rt.block_on(store.reclaim_expired(now)).expect("Reclaim should succeed."), 1);
		drop(store);

		let reopened = FileLeaseStore::open(&path).expect("Failed to reopen lease snapshot.");
		let held = rt
			.block_on(reopened.assigned_to(&user("alice"), now + Duration::minutes(2)))
			.expect("Lookup should succeed.")
			.expect("Assignment should survive reopen.");

		assert_eq!(held, grant.lease);
		assert!(
			!rt.block_on(reopened.insert(lease_fixture("a", now + Duration::hours(1))))
				.expect("Insert should succeed."),
			"Duplicate detection must survive reopen."
		);

		let stats = rt
			.block_on(reopened.stats(now, Duration::minutes(10)))
			.expect("Stats should succeed.");

		assert_eq!(stats.total_tokens, 2);
		assert_eq!(stats.assigned_tokens, 1);
		assert_eq!(stats.expired_unassigned, 1);

		fs::remove_file(&path).unwrap_or_else(|e| {
			panic!("Failed to remove temporary lease snapshot {}: {e}", path.display())
		});
	}

	#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
	async fn file_store_assigns_each_lease_once_under_contention() {
		let path = temp_path("gira_broker_lease_contention");
		let now = OffsetDateTime::now_utc();
		let store = Arc::new(FileLeaseStore::open(&path).expect("Failed to open lease snapshot."));

		for name in ["a", "b"] {
			store
				.insert(lease_fixture(name, now + Duration::hours(1)))
				.await
				.expect("Insert should succeed.");
		}

		let tasks = (0..6)
			.map(|i| {
				let store = store.clone();

				tokio::spawn(async move {
					store
						.assign(AssignRequest {
							user: user(&format!("rider-{i}")),
							user_agent: None,
							now,
							valid_after: now + Duration::minutes(2),
						})
						.await
						.expect("Assign should succeed.")
				})
			})
			.collect::<Vec<_>>();
		let mut granted = 0;

		for task in tasks {
			if task.await.expect("Assign task should join.").is_some() {
				granted += 1;
			}
		}

		assert_eq!(granted, 2);

		let reopened = FileLeaseStore::open(&path).expect("Failed to reopen lease snapshot.");
		let stats =
			reopened.stats(now, Duration::minutes(10)).await.expect("Stats should succeed.");

		assert_eq!(stats.assigned_tokens, 2);
		assert_eq!(stats.available_tokens, 0);

		fs::remove_file(&path).unwrap_or_else(|e| {
			panic!("Failed to remove temporary lease snapshot {}: {e}", path.display())
		});
	}

	#[tokio::test]
	async fn memory_store_assigns_each_lease_once() {
		let store = MemoryLeaseStore::default();
		let now = OffsetDateTime::now_utc();

		store
			.insert(lease_fixture("only", now + Duration::hours(1)))
			.await
			.expect("Insert should succeed.");

		let assign = |name: &str| AssignRequest {
			user: user(name),
			user_agent: None,
			now,
			valid_after: now + Duration::minutes(2),
		};

		assert!(store.assign(assign("alice")).await.expect("Assign should succeed.").is_some());
		assert!(store.assign(assign("bob")).await.expect("Assign should succeed.").is_none());
		assert_eq!(store.leases()[0].assigned_to, Some(user("alice")));
	}
}
