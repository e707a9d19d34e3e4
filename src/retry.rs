//! Retrying transport that makes a flaky upstream look reliable.
//!
//! [`RetryingTransport`] wraps any [`HttpTransport`] and replays each request up to
//! [`RetryPolicy::max_attempts`] times. An attempt is retried when it hits the per-attempt
//! deadline, when the upstream answers `5xx`, or when the body carries exactly one GraphQL error
//! with a known [`TransientCode`](crate::upstream::TransientCode). Any other response, and any
//! other failure, is handed back immediately. Once the budget is spent the last response (or the
//! last timeout) is returned unchanged.
//!
//! The deadline belongs to the network hop alone: [`TimeoutTransport`] sits directly around the
//! network transport, so decorators between it and the retry loop (credential refresh, broker
//! exchanges) run to completion under their own budgets. Timed-out attempts are replayed at once;
//! only answered-but-retryable attempts wait out the backoff.

mod metrics;

pub use metrics::RetryMetrics;

// crates.io
use oauth2::http::{HeaderValue, header::USER_AGENT};
// self
use crate::{
	_prelude::*,
	config::RetryPolicy,
	error::TransientError,
	http::{HttpRequest, HttpResponse, HttpTransport, TransportFuture},
	obs::{self, FlowKind, FlowOutcome, FlowSpan},
	upstream,
};

/// [`HttpTransport`] decorator bounding each network attempt by a fixed deadline.
///
/// An elapsed deadline surfaces as [`TransientError::AttemptTimeout`], which
/// [`RetryingTransport`] replays.
#[derive(Clone, Debug)]
pub struct TimeoutTransport<T> {
	inner: T,
	timeout: StdDuration,
}
impl<T> TimeoutTransport<T>
where
	T: HttpTransport,
{
	/// Bounds every request sent through `inner` by `timeout`.
	pub fn new(inner: T, timeout: StdDuration) -> Self {
		Self { inner, timeout }
	}
}
impl<T> HttpTransport for TimeoutTransport<T>
where
	T: HttpTransport,
{
	fn execute(&self, request: HttpRequest) -> TransportFuture<'_> {
		Box::pin(async move {
			tokio::time::timeout(self.timeout, self.inner.execute(request))
				.await
				.unwrap_or_else(|_elapsed| {
					Err(TransientError::AttemptTimeout { timeout: self.timeout }.into())
				})
		})
	}
}

/// [`HttpTransport`] decorator applying retry and backoff policy uniformly.
#[derive(Debug)]
pub struct RetryingTransport<T> {
	inner: T,
	policy: RetryPolicy,
	metrics: Arc<RetryMetrics>,
}
impl<T> RetryingTransport<T>
where
	T: HttpTransport,
{
	/// Wraps `inner` with the provided policy.
	///
	/// `inner` is expected to bound its own network hop, usually with a [`TimeoutTransport`];
	/// see [`bounded`](RetryingTransport::bounded).
	pub fn new(inner: T, policy: RetryPolicy) -> Self {
		Self { inner, policy, metrics: Default::default() }
	}

	/// Shares an externally owned metrics sink (e.g. one per process).
	pub fn with_metrics(mut self, metrics: Arc<RetryMetrics>) -> Self {
		self.metrics = metrics;

		self
	}

	/// Returns the counters recorded by this transport.
	pub fn metrics(&self) -> Arc<RetryMetrics> {
		self.metrics.clone()
	}

	/// Returns the active policy.
	pub fn policy(&self) -> &RetryPolicy {
		&self.policy
	}

	async fn execute_with_retries(&self, mut request: HttpRequest) -> Result<HttpResponse> {
		self.metrics.record_request();

		if let Some(value) =
			self.policy.user_agent.as_deref().and_then(|agent| HeaderValue::from_str(agent).ok())
		{
			request.headers_mut().insert(USER_AGENT, value);
		}

		tracing::debug!(
			method = %request.method(),
			uri = %request.uri(),
			"Sending upstream request."
		);

		let max_attempts = self.policy.max_attempts.max(1);
		let mut last = None;

		for attempt in 0..max_attempts {
			self.metrics.record_sent();

			match self.inner.execute(replay(&request)).await {
				Err(Error::Transient(TransientError::AttemptTimeout { timeout })) => {
					self.metrics.record_timeout();

					tracing::warn!(attempt, ?timeout, "Upstream attempt timed out.");

					last = Some(Err(TransientError::Timeout { attempts: attempt + 1 }.into()));

					continue;
				},
				Err(err) => return Err(err),
				Ok(response) => {
					if !should_retry(&response) {
						return Ok(response);
					}

					tracing::debug!(
						attempt,
						status = response.status().as_u16(),
						"Upstream answered with a retryable response."
					);

					last = Some(Ok(response));
				},
			}

			if attempt + 1 < max_attempts {
				self.metrics.record_retry();
				tokio::time::sleep(self.policy.backoff(attempt)).await;
			}
		}

		tracing::warn!(attempts = max_attempts, "Upstream retry budget exhausted.");

		last.unwrap_or_else(|| Err(TransientError::Timeout { attempts: max_attempts }.into()))
	}
}
impl<T> RetryingTransport<TimeoutTransport<T>>
where
	T: HttpTransport,
{
	/// Wraps a network transport, bounding each attempt by [`RetryPolicy::timeout`].
	pub fn bounded(network: T, policy: RetryPolicy) -> Self {
		let timeout = policy.timeout;

		Self::new(TimeoutTransport::new(network, timeout), policy)
	}
}
impl<T> HttpTransport for RetryingTransport<T>
where
	T: HttpTransport,
{
	fn execute(&self, request: HttpRequest) -> TransportFuture<'_> {
		const KIND: FlowKind = FlowKind::Call;

		let span = FlowSpan::new(KIND, "retrying_execute");

		obs::record_flow_outcome(KIND, FlowOutcome::Attempt);

		Box::pin(async move {
			let result = span.instrument(self.execute_with_retries(request)).await;

			match &result {
				Ok(_) => obs::record_flow_outcome(KIND, FlowOutcome::Success),
				Err(_) => obs::record_flow_outcome(KIND, FlowOutcome::Failure),
			}

			result
		})
	}
}

/// Returns `true` if `response` should be retried: `5xx`, or a single known transient GraphQL
/// error.
pub fn should_retry(response: &HttpResponse) -> bool {
	response.status().is_server_error() || upstream::transient_marker(response.body()).is_some()
}

fn replay(request: &HttpRequest) -> HttpRequest {
	let mut copy = HttpRequest::new(request.body().clone());

	*copy.method_mut() = request.method().clone();
	*copy.uri_mut() = request.uri().clone();
	*copy.version_mut() = request.version();
	*copy.headers_mut() = request.headers().clone();

	copy
}
