#![forbid(unsafe_code)]

//! Legacy PubSub topics served over an EventSub WebSocket session.
//!
//! Each topic expands to one or more EventSub subscriptions bound to the
//! session's connection id. Notifications are routed back to the topic by
//! subscription id.

mod reader;


use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use eventwire_domain::{LegacyTopic, RevocationReason, Subscription, TopicError, Transport};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, warn};
use url::Url;

use super::eventsub::{self, EventSubSession, MessageType};
use crate::SubscriptionApi;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type TwitchWs = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;
pub type WsConnector = Arc<dyn Fn(Url) -> BoxFuture<'static, anyhow::Result<TwitchWs>> + Send + Sync>;

/// `(topic, raw event JSON)`.
pub type MessageHandler = Arc<dyn Fn(&str, Bytes) + Send + Sync>;
pub type ErrorHandler = Arc<dyn Fn(&SubscriptionSession, BridgeError) + Send + Sync>;
pub type ConnectHandler = Arc<dyn Fn(&SubscriptionSession) + Send + Sync>;
pub type ReconnectHandler = Arc<dyn Fn(&SubscriptionSession) + Send + Sync>;

/// Bridge errors: returned from direct calls, or delivered to the error handler.
#[derive(Debug, Error)]
pub enum BridgeError {
	#[error("invalid topic: {0}")]
	InvalidTopic(#[from] TopicError),
	#[error("not connected")]
	NotConnected,
	#[error("connect already in progress")]
	AlreadyConnecting,
	#[error("connect failed: {0:#}")]
	Connect(anyhow::Error),
	#[error("timed out waiting for session_welcome")]
	WelcomeTimeout,
	#[error("subscribe {event_type} for topic {topic} failed: {error:#}")]
	Subscribe {
		topic: String,
		event_type: String,
		error: anyhow::Error,
	},
	#[error("unsubscribe topic {topic} failed: {}", failures.join("; "))]
	Unsubscribe { topic: String, failures: Vec<String> },
	#[error("subscription {subscription_id} for topic {topic} revoked: {reason}")]
	SubscriptionRevoked {
		topic: String,
		subscription_id: String,
		reason: RevocationReason,
	},
	#[error("reconnect to {url} failed: {error:#}")]
	ReconnectFailed { url: String, error: anyhow::Error },
	#[error("connection lost: {0}")]
	ConnectionLost(String),
}

/// Bridge configuration.
#[derive(Clone)]
pub struct SessionConfig {
	pub ws_url: String,
	pub connect_timeout: Duration,

	/// Added to the server's keepalive before the watchdog declares the socket dead.
	pub keepalive_grace: Duration,

	/// Override for tests and custom TLS setups.
	pub ws_connector: Option<WsConnector>,

	on_message: Option<MessageHandler>,
	on_error: Option<ErrorHandler>,
	on_connect: Option<ConnectHandler>,
	on_reconnect: Option<ReconnectHandler>,
}

impl SessionConfig {
	pub const DEFAULT_WS_URL: &'static str = "wss://eventsub.wss.twitch.tv/ws";

	pub fn new() -> Self {
		Self {
			ws_url: Self::DEFAULT_WS_URL.to_string(),
			connect_timeout: Duration::from_secs(10),
			keepalive_grace: Duration::from_secs(5),
			ws_connector: None,
			on_message: None,
			on_error: None,
			on_connect: None,
			on_reconnect: None,
		}
	}

	pub fn ws_url(mut self, url: impl Into<String>) -> Self {
		self.ws_url = url.into();
		self
	}

	pub fn on_message(mut self, f: impl Fn(&str, Bytes) + Send + Sync + 'static) -> Self {
		self.on_message = Some(Arc::new(f));
		self
	}

	pub fn on_error(mut self, f: impl Fn(&SubscriptionSession, BridgeError) + Send + Sync + 'static) -> Self {
		self.on_error = Some(Arc::new(f));
		self
	}

	pub fn on_connect(mut self, f: impl Fn(&SubscriptionSession) + Send + Sync + 'static) -> Self {
		self.on_connect = Some(Arc::new(f));
		self
	}

	pub fn on_reconnect(mut self, f: impl Fn(&SubscriptionSession) + Send + Sync + 'static) -> Self {
		self.on_reconnect = Some(Arc::new(f));
		self
	}

	fn connector(&self) -> WsConnector {
		if let Some(c) = &self.ws_connector {
			return c.clone();
		}

		Arc::new(|url: Url| Box::pin(connect_eventsub_ws(url)) as BoxFuture<'static, anyhow::Result<TwitchWs>>)
	}
}

impl Default for SessionConfig {
	fn default() -> Self {
		Self::new()
	}
}

impl fmt::Debug for SessionConfig {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("SessionConfig")
			.field("ws_url", &self.ws_url)
			.field("connect_timeout", &self.connect_timeout)
			.field("keepalive_grace", &self.keepalive_grace)
			.field("ws_connector", &self.ws_connector.is_some())
			.finish_non_exhaustive()
	}
}

async fn connect_eventsub_ws(url: Url) -> anyhow::Result<TwitchWs> {
	let (ws, _resp) = tokio_tungstenite::connect_async(url.as_str())
		.await
		.context("connect_async to eventsub ws")?;
	Ok(ws)
}

/// Read frames until `session_welcome`, answering pings on the way.
pub(crate) async fn read_until_welcome(ws: &mut TwitchWs) -> anyhow::Result<EventSubSession> {
	loop {
		let Some(msg) = ws.next().await else {
			anyhow::bail!("ws closed before welcome");
		};
		let msg = msg.context("ws read")?;

		match msg {
			Message::Text(t) => {
				let frame = eventsub::parse_frame(&t)?;
				if frame.message_type() == MessageType::SessionWelcome {
					return eventsub::parse_session(&frame);
				}
				debug!(message_type = %frame.metadata.message_type, "ignoring frame before welcome");
			}
			Message::Ping(p) => {
				let _ = ws.send(Message::Pong(p)).await;
			}
			Message::Close(c) => {
				anyhow::bail!("ws closed before welcome: close={c:?}");
			}
			_ => {}
		}
	}
}

/// Connect and wait for the welcome, bounded by `timeout`.
pub(crate) async fn open_session(
	connector: &WsConnector,
	url: Url,
	timeout: Duration,
) -> Result<(TwitchWs, EventSubSession), BridgeError> {
	let fut = async {
		let mut ws = connector(url).await?;
		let session = read_until_welcome(&mut ws).await?;
		anyhow::Ok((ws, session))
	};

	match tokio::time::timeout(timeout, fut).await {
		Ok(Ok(v)) => Ok(v),
		Ok(Err(e)) => Err(BridgeError::Connect(e)),
		Err(_) => Err(BridgeError::WelcomeTimeout),
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionStatus {
	Disconnected,
	Connecting,
	Connected,
}

#[derive(Debug)]
struct TopicBinding {
	/// Canonical form; topics that differ only in prefix alias share one binding.
	topic: LegacyTopic,
	members: Vec<Subscription>,
}

struct SessionState {
	status: SessionStatus,
	connection_id: String,
	keepalive_timeout: Duration,

	/// Bumped per established connection; stale reader tasks compare against it.
	generation: u64,
	shutdown: Option<oneshot::Sender<()>>,
	reader: Option<JoinHandle<()>>,

	bindings: HashMap<String, TopicBinding>,
	topic_by_subscription: HashMap<String, String>,
}

impl SessionState {
	fn reset(&mut self) {
		self.status = SessionStatus::Disconnected;
		self.connection_id.clear();
		self.keepalive_timeout = Duration::ZERO;
		self.bindings.clear();
		self.topic_by_subscription.clear();
	}
}

pub(crate) struct SessionInner {
	cfg: SessionConfig,
	api: Arc<dyn SubscriptionApi>,
	state: Mutex<SessionState>,
}

/// WebSocket bridge serving legacy topics from EventSub subscriptions.
///
/// Cheap to clone; clones share one session. User callbacks are always
/// invoked with the internal lock released, so they may call back into the
/// session.
#[derive(Clone)]
pub struct SubscriptionSession {
	inner: Arc<SessionInner>,
}

impl fmt::Debug for SubscriptionSession {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let st = self.inner.state.lock();
		f.debug_struct("SubscriptionSession")
			.field("status", &st.status)
			.field("connection_id", &st.connection_id)
			.field("topics", &st.bindings.len())
			.finish()
	}
}

/// Resets a `Connecting` status if `connect` bails out early.
struct ConnectingGuard<'a> {
	inner: &'a SessionInner,
	armed: bool,
}

impl Drop for ConnectingGuard<'_> {
	fn drop(&mut self) {
		if self.armed {
			let mut st = self.inner.state.lock();
			if st.status == SessionStatus::Connecting {
				st.status = SessionStatus::Disconnected;
			}
		}
	}
}

impl SubscriptionSession {
	pub fn new(cfg: SessionConfig, api: Arc<dyn SubscriptionApi>) -> Self {
		Self {
			inner: Arc::new(SessionInner {
				cfg,
				api,
				state: Mutex::new(SessionState {
					status: SessionStatus::Disconnected,
					connection_id: String::new(),
					keepalive_timeout: Duration::ZERO,
					generation: 0,
					shutdown: None,
					reader: None,
					bindings: HashMap::new(),
					topic_by_subscription: HashMap::new(),
				}),
			}),
		}
	}

	pub(crate) fn from_inner(inner: Arc<SessionInner>) -> Self {
		Self { inner }
	}

	/// Open the socket and wait for `session_welcome`. No-op when already connected.
	pub async fn connect(&self) -> Result<(), BridgeError> {
		{
			let mut st = self.inner.state.lock();
			match st.status {
				SessionStatus::Connected => return Ok(()),
				SessionStatus::Connecting => return Err(BridgeError::AlreadyConnecting),
				SessionStatus::Disconnected => st.status = SessionStatus::Connecting,
			}
		}
		let mut guard = ConnectingGuard {
			inner: &self.inner,
			armed: true,
		};

		let cfg = &self.inner.cfg;
		let url = Url::parse(&cfg.ws_url)
			.with_context(|| format!("invalid eventsub ws url: {}", cfg.ws_url))
			.map_err(BridgeError::Connect)?;

		let (ws, welcome) = open_session(&cfg.connector(), url, cfg.connect_timeout).await?;
		let keepalive = welcome.keepalive_timeout();
		let (shutdown_tx, shutdown_rx) = oneshot::channel();

		{
			let mut st = self.inner.state.lock();
			st.generation = st.generation.wrapping_add(1);
			st.status = SessionStatus::Connected;
			st.connection_id = welcome.id.clone();
			st.keepalive_timeout = keepalive;
			st.shutdown = Some(shutdown_tx);

			let reader = reader::SessionReader {
				session: Arc::downgrade(&self.inner),
				generation: st.generation,
				keepalive,
			};
			st.reader = Some(tokio::spawn(reader.run(ws, shutdown_rx)));
		}
		guard.armed = false;

		info!(
			session_id = %welcome.id,
			keepalive_secs = keepalive.as_secs(),
			"eventsub bridge connected"
		);

		if let Some(cb) = &self.inner.cfg.on_connect {
			cb(self);
		}
		Ok(())
	}

	/// Subscribe a legacy topic. Idempotent for an already bound topic or any alias of it.
	///
	/// Fan-out members are created in order; on failure the members created
	/// so far stay bound.
	pub async fn listen(&self, topic: &str) -> Result<(), BridgeError> {
		let topic = topic.trim();
		let (connection_id, generation) = {
			let st = self.inner.state.lock();
			if st.status != SessionStatus::Connected {
				return Err(BridgeError::NotConnected);
			}
			(st.connection_id.clone(), st.generation)
		};

		let parsed = LegacyTopic::parse(topic)?;
		if let Some(bound) = self.bound_as(&parsed) {
			if bound != topic {
				debug!(topic, bound_as = %bound, "topic already bound under an alias");
			}
			return Ok(());
		}

		let requests = parsed.subscription_requests();
		let total = requests.len();
		for (created, request) in requests.into_iter().enumerate() {
			let sub = match self
				.inner
				.api
				.create_subscription(&request, Transport::websocket(connection_id.as_str()))
				.await
			{
				Ok(sub) => sub,
				Err(error) => {
					warn!(
						topic,
						event_type = %request.kind,
						created,
						total,
						error = %format!("{error:#}"),
						"eventsub subscribe failed; keeping members created so far"
					);
					return Err(BridgeError::Subscribe {
						topic: topic.to_string(),
						event_type: request.kind,
						error,
					});
				}
			};

			let mut st = self.inner.state.lock();
			if st.status != SessionStatus::Connected || st.generation != generation {
				warn!(topic, subscription_id = %sub.id, "session ended while subscribing");
				return Err(BridgeError::NotConnected);
			}
			debug!(topic, subscription_id = %sub.id, event_type = %sub.kind, "eventsub subscription created");
			st.topic_by_subscription.insert(sub.id.clone(), topic.to_string());
			st.bindings
				.entry(topic.to_string())
				.or_insert_with(|| TopicBinding {
					topic: parsed.clone(),
					members: Vec::new(),
				})
				.members
				.push(sub);
		}

		info!(topic, members = total, "listening");
		Ok(())
	}

	/// Caller string of the binding for `topic`, if one exists.
	fn bound_as(&self, topic: &LegacyTopic) -> Option<String> {
		let st = self.inner.state.lock();
		st.bindings
			.iter()
			.find(|(_, binding)| binding.topic == *topic)
			.map(|(name, _)| name.clone())
	}

		/// Drop a topic binding and delete its subscriptions. No-op for an unbound topic.
	pub async fn unlisten(&self, topic: &str) -> Result<(), BridgeError> {
		let topic = topic.trim();
		let binding = {
			let mut st = self.inner.state.lock();
			let Some(binding) = st.bindings.remove(topic) else {
				return Ok(());
			};
			for sub in &binding.members {
				st.topic_by_subscription.remove(&sub.id);
			}
			binding
		};

		let mut failures = Vec::new();
		for sub in &binding.members {
			if let Err(e) = self.inner.api.delete_subscription(&sub.id).await {
				warn!(topic, subscription_id = %sub.id, error = %format!("{e:#}"), "eventsub unsubscribe failed");
				failures.push(format!("{}: {e:#}", sub.id));
			}
		}

		info!(topic, "unlistened");
		if failures.is_empty() {
			Ok(())
		} else {
			Err(BridgeError::Unsubscribe {
				topic: topic.to_string(),
				failures,
			})
		}
	}

	/// Bound topic strings, sorted.
	pub fn topics(&self) -> Vec<String> {
		let st = self.inner.state.lock();
		let mut topics: Vec<String> = st.bindings.keys().cloned().collect();
		topics.sort();
		topics
	}

	/// Subscription ids currently bound to `topic`.
	pub fn subscription_ids(&self, topic: &str) -> Vec<String> {
		let st = self.inner.state.lock();
		st.bindings
			.get(topic.trim())
			.map(|b| b.members.iter().map(|s| s.id.clone()).collect())
			.unwrap_or_default()
	}

	pub fn is_connected(&self) -> bool {
		self.inner.state.lock().status == SessionStatus::Connected
	}

	/// Current connection id; empty when disconnected.
	pub fn session_id(&self) -> String {
		self.inner.state.lock().connection_id.clone()
	}

	pub fn keepalive_timeout(&self) -> Option<Duration> {
		let st = self.inner.state.lock();
		(st.status == SessionStatus::Connected).then_some(st.keepalive_timeout)
	}

	/// Close the socket and forget all bindings. Idempotent.
	pub async fn close(&self) -> Result<(), BridgeError> {
		let (shutdown, reader) = {
			let mut st = self.inner.state.lock();
			if st.status != SessionStatus::Connected {
				return Ok(());
			}
			st.reset();
			st.generation = st.generation.wrapping_add(1);
			(st.shutdown.take(), st.reader.take())
		};

		if let Some(tx) = shutdown {
			let _ = tx.send(());
		}
		if let Some(reader) = reader
			&& tokio::time::timeout(Duration::from_secs(5), reader).await.is_err()
		{
			debug!("eventsub reader did not stop in time");
		}

		info!("eventsub bridge closed");
		Ok(())
	}

	fn report(&self, err: BridgeError) {
		match &self.inner.cfg.on_error {
			Some(cb) => cb(self, err),
			None => debug!(error = %err, "bridge error (no handler)"),
		}
	}
}
