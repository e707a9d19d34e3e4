//! Transport primitives for upstream and broker calls.
//!
//! Every request/response hop in the crate goes through [`HttpTransport`], so decorators
//! (retries, bearer injection, attestation injection) stack on one another without knowing
//! which HTTP stack sits underneath. Requests and responses are the buffered
//! [`HttpRequest`]/[`HttpResponse`] types, which keeps bodies replayable across retries.

// crates.io
use oauth2::http::{HeaderValue, Method, header::CONTENT_TYPE};
// self
use crate::{
	_prelude::*,
	error::{ConfigError, TransientError, TransportError},
};

pub use oauth2::{HttpRequest, HttpResponse};

/// Boxed future returned by [`HttpTransport::execute`].
pub type TransportFuture<'a> =
	Pin<Box<dyn Future<Output = Result<HttpResponse, Error>> + 'a + Send>>;

/// Abstraction over anything that can turn one buffered request into one buffered response.
///
/// Implementations must be `Send + Sync + 'static` so they can be shared behind `Arc` by every
/// per-user client, and the futures they return must be `Send` so callers can spawn them.
pub trait HttpTransport
where
	Self: 'static + Send + Sync,
{
	/// Performs a single request.
	fn execute(&self, request: HttpRequest) -> TransportFuture<'_>;
}
impl<T> HttpTransport for Arc<T>
where
	T: ?Sized + HttpTransport,
{
	fn execute(&self, request: HttpRequest) -> TransportFuture<'_> {
		(**self).execute(request)
	}
}

/// Thin wrapper around [`ReqwestClient`] so shared HTTP behavior lives in one place.
#[derive(Clone, Debug, Default)]
pub struct ReqwestTransport(pub ReqwestClient);
impl ReqwestTransport {
	/// Wraps an existing reqwest [`ReqwestClient`].
	pub fn with_client(client: ReqwestClient) -> Self {
		Self(client)
	}
}
impl AsRef<ReqwestClient> for ReqwestTransport {
	fn as_ref(&self) -> &ReqwestClient {
		&self.0
	}
}
impl HttpTransport for ReqwestTransport {
	fn execute(&self, request: HttpRequest) -> TransportFuture<'_> {
		Box::pin(async move {
			let request = reqwest::Request::try_from(request).map_err(TransportError::from)?;
			let response = self.0.execute(request).await.map_err(TransportError::from)?;
			let status = response.status();
			let headers = response.headers().to_owned();
			let body = response.bytes().await.map_err(TransportError::from)?;
			let mut response_new = HttpResponse::new(body.to_vec());

			*response_new.status_mut() = status;
			*response_new.headers_mut() = headers;

			Ok(response_new)
		})
	}
}

/// Builds a buffered request, attaching a JSON content type when a body is present.
pub fn build_request(
	method: Method,
	url: &Url,
	headers: &[(&str, &str)],
	body: Option<Vec<u8>>,
) -> Result<HttpRequest> {
	let mut builder = oauth2::http::Request::builder().method(method).uri(url.as_str());

	for (name, value) in headers {
		builder = builder.header(*name, *value);
	}
	if body.is_some() {
		builder = builder.header(CONTENT_TYPE, HeaderValue::from_static("application/json"));
	}

	Ok(builder.body(body.unwrap_or_default()).map_err(ConfigError::from)?)
}

/// Serializes `payload` and wraps it in a JSON `POST` request.
pub fn json_post<T>(url: &Url, payload: &T) -> Result<HttpRequest>
where
	T: ?Sized + Serialize,
{
	let body = serde_json::to_vec(payload).map_err(ConfigError::RequestBody)?;

	build_request(Method::POST, url, &[], Some(body))
}

/// Decodes a JSON response body, reporting the failing path on error.
pub fn decode_json<T>(response: &HttpResponse) -> Result<T>
where
	T: serde::de::DeserializeOwned,
{
	let mut deserializer = serde_json::Deserializer::from_slice(response.body());

	serde_path_to_error::deserialize(&mut deserializer).map_err(|source| {
		TransientError::ResponseParse { source, status: Some(response.status().as_u16()) }.into()
	})
}

/// Returns the response body as lossy UTF-8 for diagnostics and string matching.
pub fn body_text(response: &HttpResponse) -> String {
	String::from_utf8_lossy(response.body()).into_owned()
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	#[test]
	fn json_post_sets_content_type_and_body() {
		let url = Url::parse("https://example.test/auth/token/refresh").expect("URL should parse.");
		let request = json_post(&url, &serde_json::json!({ "Token": "refresh" }))
			.expect("Request should build.");

		assert_eq!(request.method(), Method::POST);
		assert_eq!(request.uri().path(), "/auth/token/refresh");
		assert_eq!(
			request.headers().get(CONTENT_TYPE).and_then(|v| v.to_str().ok()),
			Some("application/json")
		);
		assert_eq!(request.body().as_slice(), br#"{"Token":"refresh"}"#);
	}

	#[test]
	fn decode_json_reports_failing_path() {
		let mut response = HttpResponse::new(br#"{"data":{"id":7}}"#.to_vec());

		*response.status_mut() = oauth2::http::StatusCode::OK;

		#[derive(Debug, Deserialize)]
		struct Envelope {
			#[allow(dead_code)]
			data: Inner,
		}
		#[derive(Debug, Deserialize)]
		struct Inner {
			#[allow(dead_code)]
			id: String,
		}

		let err = decode_json::<Envelope>(&response).expect_err("Numeric id must not decode.");
		let Error::Transient(TransientError::ResponseParse { source, status }) = err else {
			panic!("Decode failures should map to ResponseParse.");
		};

		assert_eq!(source.path().to_string(), "data.id");
		assert_eq!(status, Some(200));
	}

	#[test]
	fn header_pairs_are_attached() {
		let url = Url::parse("https://example.test/user").expect("URL should parse.");
		let request = build_request(Method::GET, &url, &[("authorization", "Bearer abc")], None)
			.expect("Request should build.");

		assert_eq!(
			request.headers().get("authorization").and_then(|v| v.to_str().ok()),
			Some("Bearer abc")
		);
		assert!(request.headers().get(CONTENT_TYPE).is_none());
		assert!(request.body().is_empty());
	}
}
