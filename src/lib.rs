//! Resilient access to a flaky bike-share upstream on behalf of many users: a retrying
//! transport, a single-flight credential cache, a reconnecting subscription engine, and a
//! broker that leases scarce attestation tokens.

#![deny(clippy::all)]
#![warn(missing_docs, unused_crate_dependencies)]

pub mod attestation;
pub mod auth;
pub mod broker;
pub mod client;
pub mod config;
pub mod credentials;
pub mod error;
pub mod http;
pub mod obs;
pub mod retry;
pub mod store;
pub mod subscription;
pub mod upstream;
#[cfg(any(test, feature = "test"))]
pub mod _preludet {
	//! Convenience re-exports and helpers for integration tests; enabled via `cfg(test)` or the
	//! `test` crate feature.

	pub use crate::_prelude::*;

	// std
	use std::collections::VecDeque;
	// crates.io
	use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
	use futures::StreamExt;
	use jsonwebtoken::{Algorithm, EncodingKey, Header, jwk::JwkSet};
	// self
	use crate::{
		auth::{Credential, UserId},
		broker::AttestationClaims,
		config::{Endpoints, RetryPolicy},
		credentials::CredentialCache,
		http::ReqwestTransport,
		retry::RetryingTransport,
		store::{CredentialStore, MemoryStore},
		subscription::{
			ConnectFuture, FrameStream, Operation, ServerMessage, SubscriptionConnector,
			SubscriptionEngine,
		},
		upstream::{AuthApi, GraphQlError},
	};

	/// Builds an unsigned (`alg: none`) JWT carrying the provided claims.
	///
	/// The crate only ever reads upstream credentials without verifying them, so tests can mint
	/// them freely.
	pub fn unsigned_jwt(claims: serde_json::Value) -> String {
		let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
		let payload = URL_SAFE_NO_PAD.encode(claims.to_string());

		format!("{header}.{payload}.")
	}

	/// Mints an upstream-style access token for `sub` that expires at `expires_at`.
	pub fn access_token_for(sub: &str, jti: &str, expires_at: OffsetDateTime) -> String {
		unsigned_jwt(serde_json::json!({
			"sub": sub,
			"jti": jti,
			"exp": expires_at.unix_timestamp(),
		}))
	}

	/// Key id of the symmetric key returned by [`hs256_key_set`].
	pub const TEST_KID: &str = "test-key";
	const TEST_SECRET: &[u8] = b"attestation-test-secret";

	/// Returns a key set holding one HS256 key for signing attestation fixtures.
	pub fn hs256_key_set() -> JwkSet {
		serde_json::from_value(serde_json::json!({
			"keys": [{
				"kty": "oct",
				"kid": TEST_KID,
				"alg": "HS256",
				"k": URL_SAFE_NO_PAD.encode(TEST_SECRET),
			}]
		}))
		.expect("Test key set should deserialize.")
	}

	/// Signs an attestation token with the key from [`hs256_key_set`].
	pub fn sign_attestation(sub: &str, jti: &str, iss: &str, expires_at: OffsetDateTime) -> String {
		sign_attestation_as(Algorithm::HS256, TEST_KID, sub, jti, iss, expires_at)
	}

	/// Signs an attestation token with the test secret under an arbitrary algorithm and key id.
	pub fn sign_attestation_as(
		alg: Algorithm,
		kid: &str,
		sub: &str,
		jti: &str,
		iss: &str,
		expires_at: OffsetDateTime,
	) -> String {
		let mut header = Header::new(alg);

		header.kid = Some(kid.into());

		let claims = AttestationClaims {
			sub: sub.into(),
			jti: jti.into(),
			iss: iss.into(),
			exp: expires_at.unix_timestamp(),
		};

		jsonwebtoken::encode(&header, &claims, &EncodingKey::from_secret(TEST_SECRET))
			.expect("Test attestation should sign.")
	}

	/// Parses a user identifier fixture.
	pub fn user(value: &str) -> UserId {
		UserId::new(value).expect("User identifier fixture should be valid.")
	}

	/// Retry policy with tiny timeouts and no backoff base so tests stay fast.
	pub fn fast_retry_policy(max_attempts: u32) -> RetryPolicy {
		RetryPolicy::default()
			.with_max_attempts(max_attempts)
			.with_timeout(StdDuration::from_secs(2))
			.with_backoff_base(0.0)
	}

	/// Builds endpoints that all point at a single mock server base URL.
	pub fn endpoints_for(base: &str) -> Endpoints {
		let base = Url::parse(base).expect("Mock server base URL should parse.");

		Endpoints::builder()
			.api(base.join("/api/graphql").expect("API endpoint should join."))
			.auth(base.join("/auth/").expect("Auth endpoint should join."))
			.broker(base.join("/tokens/").expect("Broker endpoint should join."))
			.subscriptions(
				Url::parse("ws://127.0.0.1:9/graphql").expect("Subscription URL should parse."),
			)
			.build()
			.expect("Test endpoints should build.")
	}

	/// Constructs a [`CredentialCache`] backed by an in-memory store and a reqwest transport
	/// pointed at `base`.
	pub fn build_test_credential_cache(base: &str) -> (CredentialCache, Arc<MemoryStore>) {
		let store_backend = Arc::new(MemoryStore::default());
		let store: Arc<dyn CredentialStore> = store_backend.clone();
		let transport =
			Arc::new(RetryingTransport::bounded(ReqwestTransport::default(), fast_retry_policy(3)));
		let auth = AuthApi::new(endpoints_for(base).auth, transport);
		let cache = CredentialCache::new(store, Arc::new(auth));

		(cache, store_backend)
	}

	/// Returns the single-entry GraphQL error list entry the upstream emits for transient
	/// failures.
	pub fn invalid_operation() -> GraphQlError {
		serde_json::from_value(serde_json::json!({
			"message": "Invalid operation",
			"extensions": { "code": "INVALID_OPERATION" },
		}))
		.expect("Transient error fixture should deserialize.")
	}

	/// [`SubscriptionConnector`] replaying scripted sessions.
	///
	/// Each connect pops the next session: `Err` fails the connect, `Ok` yields its frames and
	/// then keeps the session open. Once the script is exhausted, sessions stay open and silent.
	#[derive(Debug, Default)]
	pub struct ScriptedConnector {
		sessions: Mutex<VecDeque<Result<Vec<ServerMessage>>>>,
		operations: Mutex<Vec<Operation>>,
	}
	impl ScriptedConnector {
		/// Creates a connector replaying `sessions` in order.
		pub fn new(sessions: impl IntoIterator<Item = Result<Vec<ServerMessage>>>) -> Self {
			Self {
				sessions: Mutex::new(sessions.into_iter().collect()),
				operations: Default::default(),
			}
		}

		/// Returns every operation started so far.
		pub fn operations(&self) -> Vec<Operation> {
			self.operations.lock().clone()
		}
	}
	impl SubscriptionConnector for ScriptedConnector {
		fn connect<'a>(&'a self, operation: &'a Operation) -> ConnectFuture<'a> {
			self.operations.lock().push(operation.clone());

			let session = self.sessions.lock().pop_front();

			Box::pin(async move {
				let frames = session.unwrap_or_else(|| Ok(Vec::new()))?;
				let stream: FrameStream = Box::pin(
					futures::stream::iter(frames.into_iter().map(Ok))
						.chain(futures::stream::pending()),
				);

				Ok(stream)
			})
		}
	}

	/// Builds a [`SubscriptionEngine`] over `connector` whose credential cache already holds a
	/// fresh credential for the returned user.
	pub async fn build_test_subscription_engine(
		connector: Arc<dyn SubscriptionConnector>,
	) -> (SubscriptionEngine, UserId) {
		let subscriber = user("subscriber");
		let (credentials, _) = build_test_credential_cache("http://127.0.0.1:9");
		let access_token = access_token_for(
			subscriber.as_ref(),
			"subscription-jti",
			OffsetDateTime::now_utc() + Duration::hours(1),
		);
		let credential = Credential::from_tokens(subscriber.clone(), access_token, "refresh")
			.expect("Credential fixture should build.");

		credentials.remember(credential).await.expect("Credential fixture should persist.");

		(SubscriptionEngine::new(credentials, connector), subscriber)
	}
}

mod _prelude {
	pub use std::{
		collections::{BTreeMap, HashMap, HashSet},
		error::Error as StdError,
		fmt::{Debug, Display, Formatter, Result as FmtResult},
		future::Future,
		pin::Pin,
		str::FromStr,
		sync::Arc,
		time::Duration as StdDuration,
	};

	pub use async_lock::Mutex as AsyncMutex;
	pub use parking_lot::{Mutex, RwLock};
	pub use reqwest::{Client as ReqwestClient, Error as ReqwestError};
	pub use serde::{Deserialize, Serialize};
	pub use thiserror::Error as ThisError;
	pub use time::{Duration, OffsetDateTime};
	pub use tokio_util::sync::CancellationToken;
	pub use url::Url;

	pub use crate::error::{Error, Result};
}

pub use reqwest;
pub use tokio_util;
pub use url;
#[cfg(feature = "cli")] use {clap as _, color_eyre as _, tracing_subscriber as _};
#[cfg(test)] use {color_eyre as _, httpmock as _, tower as _};
