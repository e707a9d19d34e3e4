//! Storage contracts and built-in store implementations for per-user credentials.

pub mod file;
pub mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

// self
use crate::{
	_prelude::*,
	auth::{Credential, UserId},
};

/// Boxed future returned by store operations.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + 'a + Send>>;

/// Storage backend contract implemented by credential stores.
pub trait CredentialStore
where
	Self: Send + Sync,
{
	/// Persists or replaces the credential owned by `credential.user`.
	fn save(&self, credential: Credential) -> StoreFuture<'_, ()>;

	/// Fetches the credential owned by `user`, if present.
	fn fetch<'a>(&'a self, user: &'a UserId) -> StoreFuture<'a, Option<Credential>>;

	/// Removes the credential owned by `user`, returning it when one existed.
	fn remove<'a>(&'a self, user: &'a UserId) -> StoreFuture<'a, Option<Credential>>;

	/// Lists every stored credential.
	fn list(&self) -> StoreFuture<'_, Vec<Credential>>;
}

/// Error type produced by [`CredentialStore`] and lease store implementations.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ThisError)]
pub enum StoreError {
	/// Serialization failures surfaced by the backend.
	#[error("Serialization error: {message}.")]
	Serialization {
		/// Human-readable error payload.
		message: String,
	},
	/// Backend-level failure for the storage engine.
	#[error("Backend failure: {message}.")]
	Backend {
		/// Human-readable error payload.
		message: String,
	},
}
