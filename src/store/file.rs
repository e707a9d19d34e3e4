//! Simple file-backed [`CredentialStore`] for lightweight deployments and bots.
//!
//! The snapshot helpers here are shared with the broker's file-backed lease store: every
//! mutation rewrites the whole JSON snapshot to a temporary file, syncs it, and renames it over
//! the previous one.

// std
use std::{
	fs::{self, File},
	io::Write,
	path::{Path, PathBuf},
};
// self
use crate::{
	_prelude::*,
	auth::{Credential, UserId},
	store::{CredentialStore, StoreError, StoreFuture},
};

/// Persists credentials to a JSON file after each mutation.
#[derive(Clone, Debug)]
pub struct FileStore {
	path: PathBuf,
	inner: Arc<RwLock<HashMap<UserId, Credential>>>,
}
impl FileStore {
	/// Opens (or creates) a store at the provided path, eagerly loading existing data.
	pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
		let path = path.into();
		let entries: Vec<Credential> = load_snapshot(&path)?;
		let snapshot = entries.into_iter().map(|c| (c.user.clone(), c)).collect();

		Ok(Self { path, inner: Arc::new(RwLock::new(snapshot)) })
	}

	/// Returns the snapshot location.
	pub fn path(&self) -> &Path {
		&self.path
	}

	fn persist_locked(&self, contents: &HashMap<UserId, Credential>) -> Result<(), StoreError> {
		let mut snapshot: Vec<_> = contents.values().collect();

		snapshot.sort_by(|a, b| a.user.cmp(&b.user));

		persist_snapshot(&self.path, &snapshot)
	}
}
impl CredentialStore for FileStore {
	fn save(&self, credential: Credential) -> StoreFuture<'_, ()> {
		Box::pin(async move {
			let mut guard = self.inner.write();

			guard.insert(credential.user.clone(), credential);
			self.persist_locked(&guard)?;

			Ok(())
		})
	}

	fn fetch<'a>(&'a self, user: &'a UserId) -> StoreFuture<'a, Option<Credential>> {
		Box::pin(async move { Ok(self.inner.read().get(user).cloned()) })
	}

	fn remove<'a>(&'a self, user: &'a UserId) -> StoreFuture<'a, Option<Credential>> {
		Box::pin(async move {
			let mut guard = self.inner.write();
			let removed = guard.remove(user);

			if removed.is_some() {
				self.persist_locked(&guard)?;
			}

			Ok(removed)
		})
	}

	fn list(&self) -> StoreFuture<'_, Vec<Credential>> {
		Box::pin(async move { Ok(self.inner.read().values().cloned().collect()) })
	}
}

/// Loads a JSON array snapshot, treating a missing or empty file as empty.
pub(crate) fn load_snapshot<T>(path: &Path) -> Result<Vec<T>, StoreError>
where
	T: serde::de::DeserializeOwned,
{
	ensure_parent_exists(path)?;

	if !path.exists() {
		return Ok(Vec::new());
	}

	let metadata = path.metadata().map_err(|e| StoreError::Backend {
		message: format!("Failed to inspect {}: {e}", path.display()),
	})?;

	if metadata.len() == 0 {
		return Ok(Vec::new());
	}

	let bytes = fs::read(path).map_err(|e| StoreError::Backend {
		message: format!("Failed to read {}: {e}", path.display()),
	})?;

	serde_json::from_slice(&bytes).map_err(|e| StoreError::Serialization {
		message: format!("Failed to parse {}: {e}", path.display()),
	})
}

/// Atomically replaces the snapshot at `path` with `entries`.
pub(crate) fn persist_snapshot<T>(path: &Path, entries: &T) -> Result<(), StoreError>
where
	T: ?Sized + Serialize,
{
	ensure_parent_exists(path)?;

	let serialized = serde_json::to_vec_pretty(entries).map_err(|e| StoreError::Serialization {
		message: format!("Failed to serialize store snapshot: {e}"),
	})?;
	let mut tmp_path = path.to_path_buf();

	tmp_path.set_extension("tmp");

	{
		let mut file = File::create(&tmp_path).map_err(|e| StoreError::Backend {
			message: format!("Failed to create {}: {e}", tmp_path.display()),
		})?;

		file.write_all(&serialized).map_err(|e| StoreError::Backend {
			message: format!("Failed to write {}: {e}", tmp_path.display()),
		})?;
		file.sync_all().map_err(|e| StoreError::Backend {
			message: format!("Failed to sync {}: {e}", tmp_path.display()),
		})?;
	}

	fs::rename(&tmp_path, path).map_err(|e| StoreError::Backend {
		message: format!("Failed to replace {}: {e}", path.display()),
	})
}

fn ensure_parent_exists(path: &Path) -> Result<(), StoreError> {
	if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
		fs::create_dir_all(parent).map_err(|e| StoreError::Backend {
			message: format!("Failed to create store directory {}: {e}", parent.display()),
		})?;
	}

	Ok(())
}

#[cfg(test)]
pub(crate) fn temp_path(prefix: &str) -> PathBuf {
	let unique = format!(
		"{prefix}_{}_{}.json",
		std::process::id(),
		OffsetDateTime::now_utc().unix_timestamp_nanos(),
	);

	std::env::temp_dir().join(unique)
}
