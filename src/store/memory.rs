//! Thread-safe in-memory [`CredentialStore`] implementation for local development and tests.

// self
use crate::{
	_prelude::*,
	auth::{Credential, UserId},
	store::{CredentialStore, StoreFuture},
};

type StoreMap = Arc<RwLock<HashMap<UserId, Credential>>>;

/// Thread-safe storage backend that keeps credentials in-process for tests and demos.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore(StoreMap);
impl MemoryStore {
	/// Returns the number of stored credentials.
	pub fn len(&self) -> usize {
		self.0.read().len()
	}

	/// Returns `true` when no credential is stored.
	pub fn is_empty(&self) -> bool {
		self.0.read().is_empty()
	}
}
impl CredentialStore for MemoryStore {
	fn save(&self, credential: Credential) -> StoreFuture<'_, ()> {
		let map = self.0.clone();

		Box::pin(async move {
			map.write().insert(credential.user.clone(), credential);

			Ok(())
		})
	}

	fn fetch<'a>(&'a self, user: &'a UserId) -> StoreFuture<'a, Option<Credential>> {
		let map = self.0.clone();

		Box::pin(async move { Ok(map.read().get(user).cloned()) })
	}

	fn remove<'a>(&'a self, user: &'a UserId) -> StoreFuture<'a, Option<Credential>> {
		let map = self.0.clone();

		Box::pin(async move { Ok(map.write().remove(user)) })
	}

	fn list(&self) -> StoreFuture<'_, Vec<Credential>> {
		let map = self.0.clone();

		Box::pin(async move { Ok(map.read().values().cloned().collect()) })
	}
}

#[cfg(test)]
mod tests {
	// self
	use super::*;
	use crate::_preludet::*;

	fn credential(sub: &str, access_expiry: OffsetDateTime) -> Credential {
		Credential::from_tokens(user(sub), access_token_for(sub, "jti", access_expiry), "refresh")
			.expect("Credential fixture should build.")
	}

	#[tokio::test]
	async fn save_fetch_remove_round_trip() {
		let store = MemoryStore::default();
		let now = OffsetDateTime::now_utc();
		let alice = credential("alice", now + Duration::hours(1));

		store.save(alice.clone()).await.expect("Save should succeed.");
		store.save(credential("bob", now)).await.expect("Save should succeed.");

		assert_eq!(store.len(), 2);
		assert_eq!(
			store.fetch(&alice.user).await.expect("Fetch should succeed."),
			Some(alice.clone())
		);
		assert_eq!(store.list().await.expect("List should succeed.").len(), 2);
		assert_eq!(store.remove(&alice.user).await.expect("Remove should succeed."), Some(alice));
		assert_eq!(store.fetch(&user("alice")).await.expect("Fetch should succeed."), None);
	}

	#[tokio::test]
	async fn save_overwrites_previous_credential() {
		let store = MemoryStore::default();
		let now = OffsetDateTime::now_utc();
		let newer = credential("alice", now + Duration::hours(2));

		store.save(credential("alice", now)).await.expect("Save should succeed.");
		store.save(newer.clone()).await.expect("Save should succeed.");

		assert_eq!(store.len(), 1);
		assert_eq!(store.fetch(&user("alice")).await.expect("Fetch should succeed."), Some(newer));
	}
}
