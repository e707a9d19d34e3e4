//! Reconnecting real-time subscriptions.
//!
//! Each [`Watch`] is backed by one background task cycling through
//! `Connecting → Streaming → (Reconnecting | Terminated)`.
//! Connecting fetches a fresh access token from the [`CredentialCache`] and opens a session
//! through the [`SubscriptionConnector`];
//! streaming decodes frames and hands events to the watch. Transient upstream errors, server-side
//! completion, dropped sockets, and stale-credential events reconnect after a jittered delay;
//! fatal errors are delivered once and end the watch. Cancelling the watch's token ends it from
//! any phase without another reconnect.

mod connector;
mod metrics;
mod protocol;
mod server_date;
mod trips;

pub use connector::*;
pub use metrics::SubscriptionMetrics;
pub use protocol::*;
pub use server_date::*;
pub use trips::*;

// std
use std::{
	sync::atomic::{AtomicU64, Ordering},
	task::{Context, Poll},
};
// crates.io
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::DropGuard;
// self
use crate::{
	_prelude::*,
	auth::{TripCode, UserId},
	config::ReconnectPolicy,
	credentials::CredentialCache,
	obs::{self, FlowKind, FlowOutcome, FlowSpan},
	upstream::{self, GraphQlError},
};

const WATCH_BUFFER: usize = 16;

type Registry = Arc<Mutex<HashMap<UserId, (u64, CancellationToken)>>>;

/// What the engine does after an event reached the sink.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SinkControl {
	/// Keep streaming.
	Continue,
	/// Drop the connection and reconnect with a fresh credential.
	Reconnect,
	/// End the watch.
	Terminate,
}

/// Event type carried by one subscription document.
pub trait SubscriptionEvent
where
	Self: 'static + Send + Sized,
{
	/// Operation to start; `token` is bound to the caller's access token on every connect.
	fn operation() -> Operation;

	/// Decodes one `data` payload; failures end the watch.
	fn decode(data: serde_json::Value) -> Result<Self>;

	/// Inspects a decoded event before delivery.
	fn control(&self) -> SinkControl {
		SinkControl::Continue
	}
}

/// Lifecycle phase of a watch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubscriptionPhase {
	/// Fetching a credential and opening a session.
	Connecting,
	/// Receiving frames.
	Streaming,
	/// Waiting before the next connect.
	Reconnecting,
	/// Ended; no further events.
	Terminated,
}

/// Snapshot of a watch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubscriptionState {
	/// Current phase.
	pub phase: SubscriptionPhase,
	/// Trip being followed, when the watch tracks one.
	pub tracked_code: Option<TripCode>,
	/// When the last event was decoded.
	pub last_update: Option<OffsetDateTime>,
	/// `false` once a fatal error ended the watch.
	pub retryable: bool,
	/// Number of connection attempts made.
	pub connects: u32,
}
impl Default for SubscriptionState {
	fn default() -> Self {
		Self {
			phase: SubscriptionPhase::Connecting,
			tracked_code: None,
			last_update: None,
			retryable: true,
			connects: 0,
		}
	}
}

/// Stream of events from one subscription.
///
/// Fatal errors arrive as a final `Err` item. The stream ends once the watch terminates;
/// dropping it cancels the background task.
pub struct Watch<E> {
	rx: mpsc::Receiver<Result<E>>,
	state: Arc<Mutex<SubscriptionState>>,
	cancel: CancellationToken,
	_guard: DropGuard,
}
impl<E> Watch<E> {
	/// Returns a snapshot of the watch state.
	pub fn state(&self) -> SubscriptionState {
		self.state.lock().clone()
	}

	/// Ends the watch; buffered events remain readable.
	pub fn cancel(&self) {
		self.cancel.cancel();
	}

	pub(crate) fn track(&self, code: TripCode) {
		self.state.lock().tracked_code = Some(code);
	}
}
impl<E> Unpin for Watch<E> {}
impl<E> Stream for Watch<E> {
	type Item = Result<E>;

	fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
		self.get_mut().rx.poll_recv(cx)
	}
}
impl<E> Debug for Watch<E> {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("Watch").field("state", &*self.state.lock()).finish()
	}
}

/// Starts and supervises subscription watches.
#[derive(Clone)]
pub struct SubscriptionEngine {
	credentials: CredentialCache,
	connector: Arc<dyn SubscriptionConnector>,
	policy: ReconnectPolicy,
	metrics: Arc<SubscriptionMetrics>,
	registry: Registry,
	generation: Arc<AtomicU64>,
}
impl SubscriptionEngine {
	/// Creates an engine that authenticates through `credentials` and connects via `connector`.
	pub fn new(credentials: CredentialCache, connector: Arc<dyn SubscriptionConnector>) -> Self {
		Self {
			credentials,
			connector,
			policy: ReconnectPolicy::default(),
			metrics: Default::default(),
			registry: Default::default(),
			generation: Default::default(),
		}
	}

	/// Overrides the reconnect delay policy.
	pub fn with_policy(mut self, policy: ReconnectPolicy) -> Self {
		self.policy = policy;

		self
	}

	/// Returns the subscription counters.
	pub fn metrics(&self) -> Arc<SubscriptionMetrics> {
		self.metrics.clone()
	}

	/// Returns the number of registered trip watches.
	pub fn active_trip_watches(&self) -> usize {
		self.registry.lock().len()
	}

	/// Starts a watch of `E` events for `user`; it ends when `cancel` (or a child) fires.
	///
	/// Must be called from within a Tokio runtime.
	pub fn watch<E>(&self, user: UserId, cancel: &CancellationToken) -> Watch<E>
	where
		E: SubscriptionEvent,
	{
		self.spawn(user, cancel.child_token(), None)
	}

	/// Starts the active-trip watch for `user`, cancelling any trip watch already running for
	/// the same user.
	pub fn watch_trips(&self, user: UserId, cancel: &CancellationToken) -> Watch<TripUpdate> {
		let token = cancel.child_token();
		let id = self.generation.fetch_add(1, Ordering::Relaxed);
		let previous = self.registry.lock().insert(user.clone(), (id, token.clone()));

		if let Some((_, previous)) = previous {
			tracing::debug!(user = %user, "Replacing existing trip watch.");

			previous.cancel();
		}

		self.spawn(user, token, Some(id))
	}

	fn spawn<E>(
		&self,
		user: UserId,
		cancel: CancellationToken,
		registration: Option<u64>,
	) -> Watch<E>
	where
		E: SubscriptionEvent,
	{
		let (tx, rx) = mpsc::channel(WATCH_BUFFER);
		let state = Arc::new(Mutex::new(SubscriptionState::default()));
		let worker = Worker {
			engine: self.clone(),
			operation: E::operation(),
			user,
			cancel: cancel.clone(),
			state: state.clone(),
			tx,
		};

		self.metrics.record_watch();

		tokio::spawn(async move {
			worker.run().await;

			if let Some(id) = registration {
				worker.engine.unregister(&worker.user, id);
			}
		});

		Watch { rx, state, cancel: cancel.clone(), _guard: cancel.drop_guard() }
	}

	fn unregister(&self, user: &UserId, id: u64) {
		let mut registry = self.registry.lock();

		if registry.get(user).is_some_and(|(current, _)| *current == id) {
			registry.remove(user);
		}
	}
}
impl Debug for SubscriptionEngine {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("SubscriptionEngine")
			.field("policy", &self.policy)
			.field("metrics", &self.metrics)
			.finish()
	}
}

enum Step {
	Reconnect,
	Terminate,
}

struct Worker<E> {
	engine: SubscriptionEngine,
	operation: Operation,
	user: UserId,
	cancel: CancellationToken,
	state: Arc<Mutex<SubscriptionState>>,
	tx: mpsc::Sender<Result<E>>,
}
impl<E> Worker<E>
where
	E: SubscriptionEvent,
{
	async fn run(&self) {
		const KIND: FlowKind = FlowKind::Subscription;

		let span = FlowSpan::new(KIND, "watch");

		obs::record_flow_outcome(KIND, FlowOutcome::Attempt);

		span.instrument(async {
			loop {
				self.set_phase(SubscriptionPhase::Connecting);

				let step = tokio::select! {
					biased;
					_ = self.cancel.cancelled() => Step::Terminate,
					step = self.session() => step,
				};

				if matches!(step, Step::Terminate) || self.cancel.is_cancelled() {
					break;
				}

				self.set_phase(SubscriptionPhase::Reconnecting);
				self.engine.metrics.record_reconnect();

				let delay = self.engine.policy.next_delay();

				tracing::debug!(
					user = %self.user,
					delay_ms = delay.as_millis() as u64,
					"Reconnecting subscription."
				);

				tokio::select! {
					biased;
					_ = self.cancel.cancelled() => break,
					_ = tokio::time::sleep(delay) => {},
				}
			}
		})
		.await;

		let retryable = {
			let mut state = self.state.lock();

			state.phase = SubscriptionPhase::Terminated;

			state.retryable
		};

		obs::record_flow_outcome(
			KIND,
			if retryable { FlowOutcome::Success } else { FlowOutcome::Failure },
		);
		tracing::debug!(user = %self.user, "Subscription terminated.");
	}

	async fn session(&self) -> Step {
		let credential = match self.engine.credentials.token(&self.user).await {
			Ok(credential) => credential,
			Err(e @ Error::InvalidGrant { .. }) => return self.fail(e).await,
			Err(e) => {
				tracing::warn!(
					user = %self.user,
					error = %e,
					"Subscription credential unavailable."
				);

				return Step::Reconnect;
			},
		};
		let operation = self.operation.with_token(credential.access_token.expose());

		self.engine.metrics.record_connect();
		self.state.lock().connects += 1;

		let mut frames = match self.engine.connector.connect(&operation).await {
			Ok(frames) => frames,
			Err(e) => {
				tracing::warn!(user = %self.user, error = %e, "Subscription connect failed.");

				return Step::Reconnect;
			},
		};

		self.set_phase(SubscriptionPhase::Streaming);

		while let Some(frame) = frames.next().await {
			let message = match frame {
				Ok(message) => message,
				Err(e @ Error::Subscription { .. }) => return self.fail(e).await,
				Err(e) => {
					tracing::warn!(user = %self.user, error = %e, "Subscription socket failed.");

					return Step::Reconnect;
				},
			};

			match message {
				ServerMessage::Data { payload, .. } => {
					if !payload.errors.is_empty() {
						return self.on_errors(&payload.errors).await;
					}
					let Some(data) = payload.data else {
						continue;
					};

					if let Some(step) = self.on_data(data).await {
						return step;
					}
				},
				ServerMessage::Error { payload, .. } =>
					return self.on_errors(&protocol::error_list(&payload)).await,
				ServerMessage::Complete { .. } => {
					tracing::debug!(user = %self.user, "Server completed the subscription.");

					return Step::Reconnect;
				},
				ServerMessage::ConnectionError { payload } => {
					tracing::warn!(user = %self.user, %payload, "Server dropped the session.");

					return Step::Reconnect;
				},
				ServerMessage::ConnectionAck | ServerMessage::Ka => {},
			}
		}

		tracing::debug!(user = %self.user, "Subscription stream ended.");

		Step::Reconnect
	}

	async fn on_data(&self, data: serde_json::Value) -> Option<Step> {
		let event = match E::decode(data) {
			Ok(event) => event,
			Err(e) => return Some(self.fail(e).await),
		};

		self.engine.metrics.record_received();
		self.state.lock().last_update = Some(OffsetDateTime::now_utc());

		match self.deliver(event).await {
			SinkControl::Continue => None,
			SinkControl::Reconnect => {
				tracing::debug!(user = %self.user, "Event requested a reconnect.");

				Some(Step::Reconnect)
			},
			SinkControl::Terminate => Some(Step::Terminate),
		}
	}

	async fn on_errors(&self, errors: &[GraphQlError]) -> Step {
		if let Some(code) = upstream::transient_marker_in(errors) {
			self.engine.metrics.record_transient_error();

			tracing::debug!(user = %self.user, %code, "Transient subscription error.");

			return Step::Reconnect;
		}

		let reason = errors.iter().map(|e| e.message.as_str()).collect::<Vec<_>>().join("; ");

		self.fail(Error::Subscription { reason }).await
	}

	/// Hands `event` to the watch unless it asks for a reconnect.
	async fn deliver(&self, event: E) -> SinkControl {
		match event.control() {
			SinkControl::Continue =>
				if self.send(Ok(event)).await {
					SinkControl::Continue
				} else {
					SinkControl::Terminate
				},
			control => control,
		}
	}

	async fn fail(&self, error: Error) -> Step {
		tracing::warn!(user = %self.user, error = %error, "Subscription failed permanently.");

		self.state.lock().retryable = false;
		self.send(Err(error)).await;

		Step::Terminate
	}

	async fn send(&self, item: Result<E>) -> bool {
		tokio::select! {
			biased;
			_ = self.cancel.cancelled() => false,
			sent = self.tx.send(item) => sent.is_ok(),
		}
	}

	fn set_phase(&self, phase: SubscriptionPhase) {
		self.state.lock().phase = phase;
	}
}
