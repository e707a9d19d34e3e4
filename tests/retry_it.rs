#![cfg(feature = "test")]

// std
use std::sync::atomic::{AtomicU32, Ordering};
// crates.io
use httpmock::prelude::*;
use oauth2::http::{Method, StatusCode};
// self
use gira_broker::{
	_preludet::*,
	config::{DEFAULT_USER_AGENT, RetryPolicy},
	error::TransientError,
	http::{self, HttpRequest, HttpResponse, HttpTransport, ReqwestTransport, TransportFuture},
	retry::{RetryingTransport, TimeoutTransport},
};

/// Answers every request with a fixed status, or never answers when `status` is `None`.
struct Scripted {
	status: Option<u16>,
	calls: AtomicU32,
}
impl Scripted {
	fn new(status: Option<u16>) -> Arc<Self> {
		Arc::new(Self { status, calls: AtomicU32::new(0) })
	}

	fn calls(&self) -> u32 {
		self.calls.load(Ordering::SeqCst)
	}
}
impl HttpTransport for Scripted {
	fn execute(&self, _request: HttpRequest) -> TransportFuture<'_> {
		self.calls.fetch_add(1, Ordering::SeqCst);

		Box::pin(async move {
			let Some(status) = self.status else {
				return std::future::pending().await;
			};
			let mut response = HttpResponse::new(Vec::new());

			*response.status_mut() =
				StatusCode::from_u16(status).expect("Status fixture is valid.");

			Ok::<_, Error>(response)
		})
	}
}

fn get(url: &str) -> HttpRequest {
	let url = Url::parse(url).expect("Request URL should parse.");

	http::build_request(Method::GET, &url, &[], None).expect("Request should build.")
}

#[tokio::test(start_paused = true)]
async fn server_errors_use_the_whole_budget_with_exponential_backoff() {
	let inner = Scripted::new(Some(503));
	let policy = RetryPolicy::default();
	let transport = RetryingTransport::bounded(inner.clone(), policy.clone());
	let started = tokio::time::Instant::now();
	let response = transport
		.execute(get("https://upstream.test/api"))
		.await
		.expect("Exhausted retries should hand back the last response.");
	let elapsed = started.elapsed();
	let expected: StdDuration = (0..policy.max_attempts - 1).map(|i| policy.backoff(i)).sum();

	assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
	assert_eq!(inner.calls(), policy.max_attempts);
	assert!(elapsed >= expected, "Elapsed {elapsed:?} should cover backoff {expected:?}.");
	assert!(elapsed < expected + StdDuration::from_millis(50));

	let metrics = transport.metrics();

	assert_eq!(metrics.requests(), 1);
	assert_eq!(metrics.sent(), u64::from(policy.max_attempts));
	assert_eq!(metrics.retries(), u64::from(policy.max_attempts - 1));
}

#[tokio::test(start_paused = true)]
async fn timeouts_are_replayed_without_backoff() {
	let inner = Scripted::new(None);
	let policy = RetryPolicy::default().with_max_attempts(3);
	let transport = RetryingTransport::bounded(inner.clone(), policy.clone());
	let started = tokio::time::Instant::now();
	let err = transport
		.execute(get("https://upstream.test/api"))
		.await
		.expect_err("Silent upstreams should time out.");
	let elapsed = started.elapsed();
	let expected = policy.timeout * 3;

	assert!(matches!(err, Error::Transient(TransientError::Timeout { attempts: 3 })));
	assert_eq!(inner.calls(), 3);
	assert!(elapsed >= expected, "Elapsed {elapsed:?} should cover three deadlines.");
	assert!(elapsed < expected + StdDuration::from_millis(50), "No backoff follows a timeout.");

	let metrics = transport.metrics();

	assert_eq!(metrics.timeouts(), 3);
	assert_eq!(metrics.retries(), 0);
}

/// Spends `delay` before handing the request on, like a decorator fetching credentials.
struct Slow<T> {
	inner: T,
	delay: StdDuration,
}
impl<T> HttpTransport for Slow<T>
where
	T: HttpTransport,
{
	fn execute(&self, request: HttpRequest) -> TransportFuture<'_> {
		Box::pin(async move {
			tokio::time::sleep(self.delay).await;

			self.inner.execute(request).await
		})
	}
}

#[tokio::test(start_paused = true)]
async fn deadlines_bound_only_the_network_hop() {
	let network = Scripted::new(Some(200));
	let policy = RetryPolicy::default().with_max_attempts(2);
	let slow = Slow {
		inner: TimeoutTransport::new(network.clone(), policy.timeout),
		delay: policy.timeout * 3,
	};
	let transport = RetryingTransport::new(slow, policy);
	let response = transport
		.execute(get("https://upstream.test/api"))
		.await
		.expect("Work outside the network hop must not count against the deadline.");

	assert_eq!(response.status(), StatusCode::OK);
	assert_eq!(network.calls(), 1);
	assert_eq!(transport.metrics().timeouts(), 0);
}

#[tokio::test(start_paused = true)]
async fn successful_responses_are_not_retried() {
	let inner = Scripted::new(Some(404));
	let transport = RetryingTransport::bounded(inner.clone(), RetryPolicy::default());
	let response =
		transport.execute(get("https://upstream.test/api")).await.expect("404 is a response.");

	assert_eq!(response.status(), StatusCode::NOT_FOUND);
	assert_eq!(inner.calls(), 1);
}

#[tokio::test]
async fn transient_markers_are_retried_over_the_network() {
	let server = MockServer::start_async().await;
	let mock = server
		.mock_async(|when, then| {
			when.method(GET).path("/api").header("user-agent", DEFAULT_USER_AGENT);
			then.status(200).header("content-type", "application/json").body(
				r#"{"errors":[{"message":"x","extensions":{"code":"INVALID_OPERATION"}}]}"#,
			);
		})
		.await;
	let transport = RetryingTransport::bounded(ReqwestTransport::default(), fast_retry_policy(4));
	let response = transport
		.execute(get(&server.url("/api")))
		.await
		.expect("Marker responses are returned once the budget is spent.");

	assert_eq!(response.status(), StatusCode::OK);

	mock.assert_calls_async(4).await;
}

#[tokio::test]
async fn transport_failures_stop_immediately() {
	let transport = RetryingTransport::bounded(ReqwestTransport::default(), fast_retry_policy(5));
	let err = transport
		.execute(get("http://127.0.0.1:9/unreachable"))
		.await
		.expect_err("Connection refusals should surface.");

	assert!(matches!(err, Error::Transport(_)));
	assert_eq!(transport.metrics().sent(), 1);
}
