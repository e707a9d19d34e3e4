#![cfg(feature = "test")]

// crates.io
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{
	WebSocketStream,
	tungstenite::{
		Message,
		handshake::server::{ErrorResponse, Request, Response},
		http::{HeaderValue, header::SEC_WEBSOCKET_PROTOCOL},
	},
};
// self
use gira_broker::{
	_preludet::*,
	auth::TripCode,
	config::ReconnectPolicy,
	subscription::{ActiveTripWatch, SUBPROTOCOL, WsConnector},
};

fn trip_frame(code: &str, finished: bool) -> Message {
	let frame = serde_json::json!({
		"type": "data",
		"id": "1",
		"payload": {
			"data": {
				"activeTripSubscription": {
					"code": code,
					"bike": "E0042",
					"startDate": "2024-05-01T10:00:00Z",
					"finished": finished,
					"canceled": false,
					"error": 0,
				}
			}
		}
	});

	Message::Text(frame.to_string())
}

fn negotiate(request: &Request, mut response: Response) -> Result<Response, ErrorResponse> {
	let offered = request
		.headers()
		.get(SEC_WEBSOCKET_PROTOCOL)
		.and_then(|value| value.to_str().ok())
		.unwrap_or_default();

	assert_eq!(offered, SUBPROTOCOL);

	response.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(SUBPROTOCOL));

	Ok(response)
}

async fn next_json(socket: &mut WebSocketStream<TcpStream>) -> Option<serde_json::Value> {
	while let Some(Ok(frame)) = socket.next().await {
		if let Message::Text(text) = frame {
			return Some(serde_json::from_str(&text).expect("Client frames should be JSON."));
		}
	}

	None
}

/// Serves two sessions: the first sends an ongoing trip and completes, the second finishes it.
/// Returns the `start` frames received.
async fn serve_two_sessions(listener: TcpListener) -> Vec<serde_json::Value> {
	let mut starts = Vec::new();

	for session in 0..2 {
		let (stream, _) = listener.accept().await.expect("Client should connect.");
		let mut socket = tokio_tungstenite::accept_hdr_async(stream, negotiate)
			.await
			.expect("Handshake should succeed.");
		let init = next_json(&mut socket).await.expect("Client should open the session.");

		assert_eq!(init["type"], "connection_init");

		socket
			.send(Message::Text(r#"{"type":"connection_ack"}"#.into()))
			.await
			.expect("Ack should send.");

		let start = next_json(&mut socket).await.expect("Client should start the operation.");

		starts.push(start);
		socket.send(Message::Text(r#"{"type":"ka"}"#.into())).await.expect("Ka should send.");

		if session == 0 {
			socket.send(trip_frame("T-1", false)).await.expect("Update should send.");
			socket
				.send(Message::Text(r#"{"type":"complete","id":"1"}"#.into()))
				.await
				.expect("Complete should send.");
		} else {
			socket.send(trip_frame("T-2", false)).await.expect("Foreign update should send.");
			socket.send(trip_frame("T-1", true)).await.expect("Final update should send.");
		}

		while let Some(Ok(_)) = socket.next().await {}
	}

	starts
}

#[tokio::test]
async fn trip_watch_survives_server_completion_over_websockets() {
	let listener = TcpListener::bind("127.0.0.1:0").await.expect("Listener should bind.");
	let addr = listener.local_addr().expect("Listener should expose its address.");
	let server = tokio::spawn(serve_two_sessions(listener));
	let url = Url::parse(&format!("ws://{addr}/graphql")).expect("Socket URL should parse.");
	let (engine, subscriber) =
		build_test_subscription_engine(Arc::new(WsConnector::new(url))).await;
	let engine = engine.with_policy(
		ReconnectPolicy::default()
			.with_base_delay(StdDuration::from_millis(10))
			.with_jitter(StdDuration::ZERO),
	);
	let cancel = CancellationToken::new();
	let mut trip = ActiveTripWatch::new(engine.watch_trips(subscriber, &cancel));
	let ongoing = trip
		.next_update()
		.await
		.expect("An update should arrive.")
		.expect("The update should decode.");
	let code = TripCode::new("T-1").expect("Trip code fixture should be valid.");

	assert!(!ongoing.finished);
	assert_eq!(trip.tracked_code(), Some(&code));

	let finished = trip
		.next_update()
		.await
		.expect("The final update should arrive after reconnecting.")
		.expect("The final update should decode.");

	assert!(finished.finished);
	assert_eq!(finished.code, Some(code));
	assert!(trip.next_update().await.is_none());

	let metrics = engine.metrics();

	assert_eq!(metrics.connects(), 2);
	assert_eq!(metrics.reconnects(), 1);

	drop(trip);

	let starts = tokio::time::timeout(StdDuration::from_secs(5), server)
		.await
		.expect("Server should finish.")
		.expect("Server task should join.");

	assert_eq!(starts.len(), 2);

	for start in starts {
		assert_eq!(start["type"], "start");
		assert_eq!(start["id"], "1");
		assert!(start["payload"]["query"].as_str().is_some_and(|q| q.contains("activeTrip")));
		assert!(start["payload"]["variables"]["token"].as_str().is_some_and(|t| !t.is_empty()));
	}
}
