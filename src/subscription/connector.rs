//! Socket seam between the subscription engine and the network.

// crates.io
use futures::{SinkExt, Stream, StreamExt};
use tokio_tungstenite::tungstenite::{
	Message,
	client::IntoClientRequest,
	http::{HeaderValue, header::SEC_WEBSOCKET_PROTOCOL},
};
// self
use crate::{
	_prelude::*,
	error::TransportError,
	subscription::protocol::{ClientMessage, Operation, SUBPROTOCOL, ServerMessage},
};

/// Server frames of one live connection; the stream ends when the socket closes.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<ServerMessage>> + Send>>;

/// Boxed future returned by [`SubscriptionConnector::connect`].
pub type ConnectFuture<'a> = Pin<Box<dyn Future<Output = Result<FrameStream>> + 'a + Send>>;

/// Opens one subscription connection and starts `operation` on it.
///
/// Implementations complete the session handshake before returning, so a rejected session is a
/// connect failure rather than a stream frame.
pub trait SubscriptionConnector
where
	Self: 'static + Send + Sync,
{
	/// Connects and starts `operation`.
	fn connect<'a>(&'a self, operation: &'a Operation) -> ConnectFuture<'a>;
}

/// [`SubscriptionConnector`] speaking `graphql-ws` over `tokio-tungstenite`.
#[derive(Clone, Debug)]
pub struct WsConnector {
	url: Url,
}
impl WsConnector {
	/// Creates a connector for `url`.
	pub fn new(url: Url) -> Self {
		Self { url }
	}

	async fn open(&self, operation: &Operation) -> Result<FrameStream> {
		let mut request = self.url.as_str().into_client_request().map_err(TransportError::network)?;

		request.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(SUBPROTOCOL));

		let (mut socket, _) =
			tokio_tungstenite::connect_async(request).await.map_err(TransportError::network)?;

		socket
			.send(Message::Text(
				ClientMessage::ConnectionInit { payload: Default::default() }.to_text()?,
			))
			.await
			.map_err(TransportError::network)?;

		loop {
			let Some(frame) = socket.next().await else {
				return Err(closed("socket closed before the session was acknowledged"));
			};

			match frame.map_err(TransportError::network)? {
				Message::Text(text) => match ServerMessage::parse(&text)? {
					ServerMessage::ConnectionAck => break,
					ServerMessage::ConnectionError { payload } =>
						return Err(closed(&format!("session rejected: {payload}"))),
					_ => continue,
				},
				Message::Close(_) =>
					return Err(closed("socket closed before the session was acknowledged")),
				_ => continue,
			}
		}

		socket
			.send(Message::Text(
				ClientMessage::Start { id: "1".into(), payload: operation.clone() }.to_text()?,
			))
			.await
			.map_err(TransportError::network)?;

		let frames = socket.filter_map(|frame| async move {
			match frame {
				Ok(Message::Text(text)) => Some(ServerMessage::parse(&text)),
				Ok(_) => None,
				Err(e) => Some(Err(TransportError::network(e).into())),
			}
		});

		Ok(Box::pin(frames))
	}
}
impl SubscriptionConnector for WsConnector {
	fn connect<'a>(&'a self, operation: &'a Operation) -> ConnectFuture<'a> {
		Box::pin(self.open(operation))
	}
}

fn closed(message: &str) -> Error {
	let source = std::io::Error::new(std::io::ErrorKind::ConnectionAborted, message.to_owned());

	TransportError::Io(source).into()
}
