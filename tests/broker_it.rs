#![cfg(feature = "test")]

// crates.io
use axum::{
	body::{Body, to_bytes},
	http::{Request, StatusCode},
};
use httpmock::prelude::*;
use jsonwebtoken::Algorithm;
use tower::ServiceExt;
// self
use gira_broker::{
	_preludet::*,
	attestation::{ATTESTATION_HEADER, BrokerClient, CREDENTIAL_HEADER, crypto},
	broker::{
		self, AttestationVerifier, DEFAULT_ISSUER, JwksVerifier, MemoryLeaseStore, SOURCE_HEADER,
		TokenBroker,
	},
	http::ReqwestTransport,
	retry::RetryingTransport,
	upstream::AuthApi,
};

const ALICE: &str = "45e33173-2943-47ae-92de-59afbcab4c4c";
const BOB: &str = "8d2f6b1a-9c4e-4f3b-a1d2-7e6c5b4a3f21";

fn credential_for(sub: &str) -> String {
	let expires_at = OffsetDateTime::now_utc() + Duration::hours(1);

	access_token_for(sub, "3ebb9117-7150-4547-8cca-f51fd6e55f46", expires_at)
}

fn attestation(jti: &str, ttl: Duration) -> String {
	sign_attestation("app-instance", jti, DEFAULT_ISSUER, OffsetDateTime::now_utc() + ttl)
}

/// Builds a broker whose identity checks go to the auth endpoint on `server`.
fn broker_against(server: &MockServer) -> (Arc<TokenBroker>, Arc<MemoryLeaseStore>) {
	let store = Arc::new(MemoryLeaseStore::default());
	let transport = RetryingTransport::bounded(ReqwestTransport::default(), fast_retry_policy(2));
	let identity = AuthApi::new(endpoints_for(&server.base_url()).auth, Arc::new(transport));
	let broker = TokenBroker::new(
		store.clone(),
		Arc::new(JwksVerifier::with_keys(hs256_key_set(), DEFAULT_ISSUER)),
		Arc::new(identity),
	);

	(Arc::new(broker), store)
}

async fn mock_identity<'a>(server: &'a MockServer, sub: &str) -> httpmock::Mock<'a> {
	let bearer = format!("Bearer {}", credential_for(sub));
	let body = serde_json::json!({ "data": { "id": sub } }).to_string();

	server
		.mock_async(|when, then| {
			when.method(GET).path("/auth/user").header("authorization", bearer);
			then.status(200).header("content-type", "application/json").body(body);
		})
		.await
}

async fn call(router: axum::Router, path: &str, headers: &[(&str, &str)]) -> (StatusCode, String) {
	let mut request = Request::builder().method("GET").uri(path);

	for (name, value) in headers {
		request = request.header(*name, *value);
	}

	let response = router
		.oneshot(request.body(Body::empty()).expect("Request should build."))
		.await
		.expect("Router should answer.");
	let status = response.status();
	let body = to_bytes(response.into_body(), usize::MAX).await.expect("Body should buffer.");

	(status, String::from_utf8_lossy(&body).into_owned())
}

#[tokio::test]
async fn concurrent_exchanges_for_one_identity_converge() {
	let server = MockServer::start_async().await;
	let (broker, store) = broker_against(&server);
	let _identity = mock_identity(&server, ALICE).await;

	for jti in ["pool-1", "pool-2", "pool-3"] {
		broker
			.post_token(&attestation(jti, Duration::hours(1)), None)
			.await
			.expect("Deposit should succeed.");
	}

	let credential = credential_for(ALICE);
	let (a, b, c) = tokio::join!(
		broker.exchange_token(&credential, Some("agent")),
		broker.exchange_token(&credential, Some("agent")),
		broker.exchange_token(&credential, Some("agent")),
	);
	let a = a.expect("First exchange should succeed.");
	let b = b.expect("Second exchange should succeed.");
	let c = c.expect("Third exchange should succeed.");

	assert_eq!(a.expose(), b.expose());
	assert_eq!(b.expose(), c.expose());
	assert_eq!(store.leases().iter().filter(|lease| !lease.is_unassigned()).count(), 1);
	assert_eq!(broker.metrics().assignments(), 1);
}

#[tokio::test]
async fn distinct_identities_never_share_a_lease() {
	let server = MockServer::start_async().await;
	let (broker, _) = broker_against(&server);
	let _alice = mock_identity(&server, ALICE).await;
	let _bob = mock_identity(&server, BOB).await;

	broker
		.post_token(&attestation("only", Duration::hours(1)), None)
		.await
		.expect("Deposit should succeed.");

	let alice = broker
		.exchange_token(&credential_for(ALICE), None)
		.await
		.expect("First identity should get the only lease.");
	let bob = broker.exchange_token(&credential_for(BOB), None).await;

	assert!(matches!(bob, Err(Error::PoolExhausted)));

	broker
		.post_token(&attestation("second", Duration::hours(2)), None)
		.await
		.expect("Deposit should succeed.");

	let bob = broker
		.exchange_token(&credential_for(BOB), None)
		.await
		.expect("Second identity should get the new lease.");

	assert_ne!(alice.expose(), bob.expose());
}

#[tokio::test]
async fn forged_subjects_are_checked_upstream() {
	let server = MockServer::start_async().await;
	let (broker, _) = broker_against(&server);
	let rejected = server
		.mock_async(|when, then| {
			when.method(GET).path("/auth/user");
			then.status(401).body("Unauthorized");
		})
		.await;

	broker
		.post_token(&attestation("pool", Duration::hours(1)), None)
		.await
		.expect("Deposit should succeed.");

	let err = broker
		.exchange_token(&credential_for(ALICE), None)
		.await
		.expect_err("Unverified identities must be refused.");

	assert!(matches!(err, Error::InvalidGrant { .. }));

	rejected.assert_calls_async(1).await;
}

#[tokio::test]
async fn reclamation_frees_expired_values_but_keeps_rows() {
	let server = MockServer::start_async().await;
	let (broker, store) = broker_against(&server);
	let now = OffsetDateTime::now_utc();
	let short = attestation("short", Duration::minutes(5));

	broker.post_token_at(&short, None, now).await.expect("Deposit should succeed.");
	broker
		.post_token_at(&attestation("long", Duration::hours(1)), None, now)
		.await
		.expect("Deposit should succeed.");

	let reclaimed = broker
		.reclaim_expired(now + Duration::minutes(10))
		.await
		.expect("Reclamation should succeed.");

	assert_eq!(reclaimed, 1);
	assert_eq!(store.leases().len(), 2);
	assert_eq!(broker.metrics().reclaimed(), 1);

	let stats = broker.stats_at(&short, now + Duration::minutes(10)).await.expect("Stats work.");

	assert_eq!(stats.total_tokens, 2);
	assert_eq!(stats.valid_tokens, 1);
}

#[tokio::test]
async fn routes_report_documented_statuses() {
	let server = MockServer::start_async().await;
	let (broker, _) = broker_against(&server);
	let _identity = mock_identity(&server, ALICE).await;
	let router = broker::router(broker);
	let token = attestation("route", Duration::hours(1));
	let token = token.as_str();
	let credential = credential_for(ALICE);
	let credential = credential.as_str();

	assert_eq!(
		call(router.clone(), "/exchange", &[(CREDENTIAL_HEADER, credential)]).await.0,
		StatusCode::NOT_FOUND
	);
	assert_eq!(
		call(router.clone(), "/post", &[(ATTESTATION_HEADER, token), (SOURCE_HEADER, "it")]).await,
		(StatusCode::OK, "thanks!".into())
	);
	assert_eq!(
		call(router.clone(), "/post", &[(ATTESTATION_HEADER, token)]).await.0,
		StatusCode::BAD_REQUEST
	);
	assert_eq!(call(router.clone(), "/post", &[]).await.0, StatusCode::BAD_REQUEST);
	assert_eq!(
		call(router.clone(), "/exchange", &[(CREDENTIAL_HEADER, credential)]).await,
		(StatusCode::OK, token.to_owned())
	);

	let (status, sealed) =
		call(router.clone(), "/exchangeEnc", &[(CREDENTIAL_HEADER, credential)]).await;

	assert_eq!(status, StatusCode::OK);
	assert_eq!(crypto::decrypt(&sealed, credential).expect("Decrypt should succeed."), token);

	let (status, stats) = call(router.clone(), "/stats", &[(ATTESTATION_HEADER, token)]).await;
	let stats: serde_json::Value = serde_json::from_str(&stats).expect("Stats should be JSON.");

	assert_eq!(status, StatusCode::OK);
	assert_eq!(stats["total_tokens"], 1);
	assert_eq!(stats["assigned_tokens"], 1);
	assert_eq!(call(router, "/stats", &[]).await.0, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn broker_client_talks_to_a_live_service() {
	let server = MockServer::start_async().await;
	let jwks = server
		.mock_async(|when, then| {
			when.method(GET).path("/jwks");
			then.status(200)
				.header("content-type", "application/json")
				.body(serde_json::to_string(&hs256_key_set()).expect("Key set should serialize."));
		})
		.await;
	let _identity = mock_identity(&server, ALICE).await;
	let identity_transport =
		RetryingTransport::bounded(ReqwestTransport::default(), fast_retry_policy(2));
	let verifier = JwksVerifier::remote(
		Url::parse(&server.url("/jwks")).expect("JWKS URL should parse."),
		DEFAULT_ISSUER,
		ReqwestClient::new(),
	);
	let identity =
		AuthApi::new(endpoints_for(&server.base_url()).auth, Arc::new(identity_transport));
	let broker = Arc::new(TokenBroker::new(
		Arc::new(MemoryLeaseStore::default()),
		Arc::new(verifier),
		Arc::new(identity),
	));
	let listener =
		tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("Listener should bind.");
	let addr = listener.local_addr().expect("Listener should expose its address.");
	let shutdown = CancellationToken::new();
	let service = tokio::spawn(
		axum::serve(listener, broker::router(broker.clone()))
			.with_graceful_shutdown(shutdown.clone().cancelled_owned())
			.into_future(),
	);
	let base = Url::parse(&format!("http://{addr}/")).expect("Broker URL should parse.");
	let client = BrokerClient::new(base, Arc::new(ReqwestTransport::default()));
	let token = attestation("live", Duration::hours(1));
	let credential = credential_for(ALICE);

	assert!(matches!(client.exchange(&credential).await, Err(Error::PoolExhausted)));

	broker.post_token(&token, Some("it")).await.expect("Deposit should load keys and succeed.");

	let raw = client.exchange(&credential).await.expect("Exchange should succeed.");
	let local = client.exchange_encrypted(&credential).await.expect("Local sealing works.");
	let remote =
		client.exchange_remote_encrypted(&credential).await.expect("Remote sealing works.");

	assert_eq!(raw.expose(), token);
	assert_eq!(local.expose(), remote.expose());
	assert_eq!(
		crypto::decrypt(remote.expose(), &credential).expect("Decrypt should succeed."),
		token
	);

	let stats = client.stats(&token).await.expect("Stats should be readable.");

	assert_eq!(stats.total_tokens, 1);
	assert_eq!(stats.assigned_tokens, 1);
	assert!(matches!(client.exchange("not-a-jwt").await, Err(Error::InvalidGrant { .. })));

	jwks.assert_calls_async(1).await;
	shutdown.cancel();
	service.await.expect("Service task should join.").expect("Service should stop cleanly.");
}

#[tokio::test]
async fn unknown_key_ids_reload_the_key_set_once_per_cooldown() {
	let server = MockServer::start_async().await;
	let jwks = server
		.mock_async(|when, then| {
			when.method(GET).path("/jwks");
			then.status(200)
				.header("content-type", "application/json")
				.body(serde_json::to_string(&hs256_key_set()).expect("Key set should serialize."));
		})
		.await;
	let verifier = JwksVerifier::remote(
		Url::parse(&server.url("/jwks")).expect("JWKS URL should parse."),
		DEFAULT_ISSUER,
		ReqwestClient::new(),
	);
	let expires_at = OffsetDateTime::now_utc() + Duration::hours(1);

	for i in 0..25 {
		let kid = format!("bogus-{i}");
		let token =
			sign_attestation_as(Algorithm::HS256, &kid, "app", "jti", DEFAULT_ISSUER, expires_at);
		let err = verifier.verify(&token).await.expect_err("Unknown keys must be refused.");

		assert!(matches!(err, Error::MalformedToken { .. }));
	}

	jwks.assert_calls_async(1).await;

	let claims = verifier
		.verify(&attestation("genuine", Duration::hours(1)))
		.await
		.expect("Keys loaded by the single reload should verify genuine tokens.");

	assert_eq!(claims.jti, "genuine");

	verifier.refresh().await.expect("Maintenance reloads ignore the cool-down.");
	jwks.assert_calls_async(2).await;
}
