//! `graphql-ws` frames exchanged over the subscription socket.

// self
use crate::{_prelude::*, upstream::GraphQlError};

/// WebSocket subprotocol negotiated with the upstream.
pub const SUBPROTOCOL: &str = "graphql-ws";

/// Subscription document plus its variables; the caller's access token is bound as `token`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Operation {
	/// GraphQL subscription document.
	pub query: String,
	/// Variables sent with the document.
	#[serde(default)]
	pub variables: serde_json::Map<String, serde_json::Value>,
}
impl Operation {
	/// Creates an operation without variables.
	pub fn new(query: impl Into<String>) -> Self {
		Self { query: query.into(), variables: Default::default() }
	}

	/// Returns a copy with `token` bound to `access_token`.
	pub fn with_token(&self, access_token: &str) -> Self {
		let mut bound = self.clone();

		bound.variables.insert("token".into(), access_token.into());

		bound
	}
}

/// Frames sent by the client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
	/// Opens the session.
	ConnectionInit {
		/// Connection parameters.
		#[serde(default)]
		payload: serde_json::Map<String, serde_json::Value>,
	},
	/// Starts one operation.
	Start {
		/// Operation id echoed by the server.
		id: String,
		/// Operation to run.
		payload: Operation,
	},
	/// Stops one operation.
	Stop {
		/// Operation id.
		id: String,
	},
}
impl ClientMessage {
	/// Encodes the frame as JSON text.
	pub fn to_text(&self) -> Result<String> {
		serde_json::to_string(self).map_err(|e| crate::error::ConfigError::RequestBody(e).into())
	}
}

/// Frames sent by the server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
	/// Session accepted.
	ConnectionAck,
	/// Session rejected.
	ConnectionError {
		/// Server-supplied reason.
		#[serde(default)]
		payload: serde_json::Value,
	},
	/// Keep-alive.
	Ka,
	/// One operation result.
	Data {
		/// Operation id.
		#[serde(default)]
		id: String,
		/// Result body.
		payload: DataPayload,
	},
	/// Operation-level failure.
	Error {
		/// Operation id.
		#[serde(default)]
		id: String,
		/// A GraphQL error object or list.
		#[serde(default)]
		payload: serde_json::Value,
	},
	/// The server finished the operation.
	Complete {
		/// Operation id.
		#[serde(default)]
		id: String,
	},
}
impl ServerMessage {
	/// Decodes one text frame.
	pub fn parse(text: &str) -> Result<Self> {
		let mut deserializer = serde_json::Deserializer::from_str(text);

		serde_path_to_error::deserialize(&mut deserializer).map_err(|e| Error::Subscription {
			reason: format!("undecodable frame at {}: {}", e.path(), e.inner()),
		})
	}

	/// Wraps a data result; convenient for scripted connections.
	pub fn data(data: serde_json::Value) -> Self {
		Self::Data { id: "1".into(), payload: DataPayload { data: Some(data), errors: Vec::new() } }
	}

	/// Wraps a GraphQL error list inside a data frame.
	pub fn errors(errors: Vec<GraphQlError>) -> Self {
		Self::Data { id: "1".into(), payload: DataPayload { data: None, errors } }
	}
}

/// `data` frame body.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DataPayload {
	/// Operation result, when present.
	#[serde(default)]
	pub data: Option<serde_json::Value>,
	/// GraphQL errors, when present.
	#[serde(default)]
	pub errors: Vec<GraphQlError>,
}

/// Reads an `error` frame payload as a GraphQL error list.
pub(crate) fn error_list(payload: &serde_json::Value) -> Vec<GraphQlError> {
	match payload {
		serde_json::Value::Array(items) =>
			items.iter().filter_map(|item| serde_json::from_value(item.clone()).ok()).collect(),
		serde_json::Value::Object(_) =>
			serde_json::from_value(payload.clone()).map(|e| vec![e]).unwrap_or_default(),
		serde_json::Value::String(message) =>
			vec![GraphQlError { message: message.clone(), extensions: None }],
		_ => Vec::new(),
	}
}

#[cfg(test)]
mod tests {
	// self
	use super::*;
	use crate::upstream::TransientCode;

	#[test]
	fn client_frames_use_the_wire_names() {
		let start = ClientMessage::Start {
			id: "1".into(),
			payload: Operation::new("subscription { x }").with_token("abc"),
		};
		let json: serde_json::Value =
			serde_json::from_str(&start.to_text().expect("Start frame should encode."))
				.expect("Encoded frame should be JSON.");

		assert_eq!(json["type"], "start");
		assert_eq!(json["payload"]["variables"]["token"], "abc");

		let init = ClientMessage::ConnectionInit { payload: Default::default() }
			.to_text()
			.expect("Init frame should encode.");

		assert!(init.contains(r#""type":"connection_init""#));
	}

	#[test]
	fn server_frames_decode_with_extra_fields() {
		assert_eq!(
			ServerMessage::parse(r#"{"type":"connection_ack","payload":{}}"#)
				.expect("Ack should decode."),
			ServerMessage::ConnectionAck
		);
		assert_eq!(
			ServerMessage::parse(r#"{"type":"ka"}"#).expect("Ka should decode."),
			ServerMessage::Ka
		);

		let data = ServerMessage::parse(r#"{"type":"data","id":"1","payload":{"data":{"a":1}}}"#)
			.expect("Data should decode.");

		assert_eq!(data, ServerMessage::data(serde_json::json!({ "a": 1 })));
		assert!(matches!(
			ServerMessage::parse(r#"{"type":"mystery"}"#),
			Err(Error::Subscription { .. })
		));
	}

	#[test]
	fn error_payloads_accept_lists_objects_and_strings() {
		let list = error_list(&serde_json::json!([
			{ "message": "x", "extensions": { "code": "INVALID_OPERATION" } }
		]));

		assert_eq!(list.len(), 1);
		assert_eq!(list[0].transient_code(), Some(TransientCode::InvalidOperation));
		assert_eq!(error_list(&serde_json::json!({ "message": "boom" }))[0].message, "boom");
		assert_eq!(error_list(&serde_json::json!("plain"))[0].message, "plain");
		assert!(error_list(&serde_json::Value::Null).is_empty());
	}
}
