//! Per-user upstream client.
//!
//! [`Client::call`] sends one request through the full decorator stack:
//! `RetryingTransport → BearerTransport → AttestationTransport → TimeoutTransport → network`.
//! Every attempt picks up a fresh bearer token from the [`CredentialCache`] and an attestation
//! from the broker, so a retry after an expiry or a rejected attestation presents new headers.
//! Only the network hop is bounded by the per-attempt deadline; token refreshes and broker
//! exchanges carry their own retry budgets.
//! [`Client::graphql`] adds the GraphQL envelope and translates upstream error lists once.

// crates.io
use oauth2::http::StatusCode;
use serde::de::DeserializeOwned;
// self
use crate::{
	_prelude::*,
	attestation::{AttestationTransport, BearerTransport, BrokerClient},
	auth::UserId,
	config::{Endpoints, RetryPolicy},
	credentials::CredentialCache,
	error::TransientError,
	http::{self, HttpRequest, HttpResponse, HttpTransport, ReqwestTransport},
	retry::{RetryMetrics, RetryingTransport, TimeoutTransport},
	upstream::{self, GraphQlError, UpstreamError},
};

/// Shared wiring from which per-user [`Client`]s are built.
#[derive(Clone, Debug)]
pub struct ClientFactory {
	endpoints: Endpoints,
	credentials: CredentialCache,
	broker: Arc<BrokerClient>,
	network: ReqwestTransport,
	policy: RetryPolicy,
	metrics: Arc<RetryMetrics>,
}
impl ClientFactory {
	/// Creates a factory whose clients talk to `endpoints` and authenticate through
	/// `credentials`; broker exchanges share the same retry policy.
	pub fn new(
		endpoints: Endpoints,
		credentials: CredentialCache,
		network: ReqwestTransport,
		policy: RetryPolicy,
	) -> Self {
		let metrics = Arc::<RetryMetrics>::default();
		let broker_transport = RetryingTransport::bounded(network.clone(), policy.clone())
			.with_metrics(metrics.clone());
		let broker = BrokerClient::new(endpoints.broker.clone(), Arc::new(broker_transport));

		Self { endpoints, credentials, broker: Arc::new(broker), network, policy, metrics }
	}

	/// Returns the retry counters shared by every client built here.
	pub fn metrics(&self) -> Arc<RetryMetrics> {
		self.metrics.clone()
	}

	/// Returns the broker client used for attestation exchanges.
	pub fn broker(&self) -> &Arc<BrokerClient> {
		&self.broker
	}

	/// Builds the client acting on behalf of `user`.
	pub fn client(&self, user: UserId) -> Client {
		let attested = AttestationTransport::new(
			TimeoutTransport::new(self.network.clone(), self.policy.timeout),
			self.credentials.clone(),
			self.broker.clone(),
			user.clone(),
		);
		let bearer = BearerTransport::new(attested, self.credentials.clone(), user.clone());
		let transport =
			RetryingTransport::new(bearer, self.policy.clone()).with_metrics(self.metrics.clone());

		Client { user, api: self.endpoints.api.clone(), transport: Arc::new(transport) }
	}
}

/// Upstream client bound to one user.
#[derive(Clone)]
pub struct Client {
	user: UserId,
	api: Url,
	transport: Arc<dyn HttpTransport>,
}
impl Client {
	/// Returns the user this client acts for.
	pub fn user(&self) -> &UserId {
		&self.user
	}

	/// Sends `request` with retries, bearer, and attestation headers applied.
	pub async fn call(&self, request: HttpRequest) -> Result<HttpResponse> {
		self.transport.execute(request).await
	}

	/// Runs a GraphQL operation against the API endpoint and decodes its `data` as `T`.
	///
	/// Upstream error lists become [`Error::Transient`], [`Error::InvalidGrant`], or
	/// [`Error::Upstream`] via [`upstream::translate`].
	pub async fn graphql<T>(&self, query: &str, variables: serde_json::Value) -> Result<T>
	where
		T: DeserializeOwned,
	{
		let request = http::json_post(
			&self.api,
			&serde_json::json!({ "query": query, "variables": variables }),
		)?;
		let response = self.call(request).await?;
		let status = response.status();

		if let Ok(envelope) = http::decode_json::<Envelope<T>>(&response) {
			if !envelope.errors.is_empty() {
				return Err(upstream::translate(&envelope.errors));
			}
			if status.is_success() {
				return envelope
					.data
					.ok_or_else(|| UpstreamError::new("response carried no data", None).into());
			}
		}

		Err(status_error(status, &http::body_text(&response)))
	}
}
impl Debug for Client {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("Client").field("user", &self.user).field("api", &self.api.as_str()).finish()
	}
}

#[derive(Deserialize)]
struct Envelope<T> {
	data: Option<T>,
	#[serde(default)]
	errors: Vec<GraphQlError>,
}

fn status_error(status: StatusCode, body: &str) -> Error {
	let message = format!("{status}: {}", body.trim());

	if status.is_server_error() || status.is_success() {
		TransientError::Upstream { message, status: Some(status.as_u16()) }.into()
	} else {
		UpstreamError::new(message, None).into()
	}
}

#[cfg(test)]
mod tests {
	// self
	use super::*;
	use crate::upstream::UpstreamErrorKind;

	#[test]
	fn status_errors_split_server_and_client_failures() {
		assert!(status_error(StatusCode::BAD_GATEWAY, "oops").is_transient());

		let Error::Upstream(forbidden) = status_error(StatusCode::FORBIDDEN, "Forbidden") else {
			panic!("Client errors must surface as upstream errors.");
		};

		assert_eq!(forbidden.kind, UpstreamErrorKind::Forbidden);
	}
}
