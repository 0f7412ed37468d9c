#![forbid(unsafe_code)]

use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::Context;
use eventwire_domain::RevocationReason;
use futures_util::{SinkExt, StreamExt};
use metrics::counter;
use tokio::sync::oneshot;
use tokio::time::{Instant, sleep_until};
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, warn};
use url::Url;

use super::{BridgeError, SessionInner, SessionStatus, SubscriptionSession, TwitchWs};
use crate::twitch::eventsub::{self, EventSubFrame, MessageType};

/// Secondary socket opened after `session_reconnect`, waiting for its welcome.
struct Migration {
	url: String,
	ws: TwitchWs,
	deadline: Instant,
}

enum Flow {
	Continue,
	Stop,
}

pub(super) struct SessionReader {
	pub(super) session: Weak<SessionInner>,
	pub(super) generation: u64,
	pub(super) keepalive: Duration,
}

/// Effectively never; used when the keepalive window does not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365);

pub(super) fn watchdog_deadline(last_activity: Instant, keepalive: Duration, grace: Duration) -> Instant {
	last_activity
		.checked_add(keepalive.saturating_add(grace))
		.unwrap_or_else(|| Instant::now() + FAR_FUTURE)
}

impl SessionReader {
	pub(super) async fn run(self, mut ws: TwitchWs, mut shutdown_rx: oneshot::Receiver<()>) {
		let Some(grace) = self.session.upgrade().map(|inner| inner.cfg.keepalive_grace) else {
			return;
		};

		let mut keepalive = self.keepalive;
		let mut last_activity = Instant::now();
		let mut migrating: Option<Migration> = None;
		let mut primary_done = false;

		loop {
			let watchdog = watchdog_deadline(last_activity, keepalive, grace);
			let mig_active = migrating.is_some();
			let mig_deadline = migrating.as_ref().map_or(watchdog, |m| m.deadline);

			tokio::select! {
				_ = &mut shutdown_rx => {
					let _ = ws.close(None).await;
					if let Some(mut m) = migrating.take() {
						let _ = m.ws.close(None).await;
					}
					debug!("eventsub reader stopped");
					return;
				}

				msg = ws.next(), if !primary_done => {
					let msg = match msg {
						Some(Ok(m)) => m,
						Some(Err(e)) => {
							if mig_active {
								debug!(error = %e, "primary socket failed during migration; waiting for secondary");
								primary_done = true;
								continue;
							}
							self.connection_lost(format!("ws read error: {e}"));
							return;
						}
						None => {
							if mig_active {
								primary_done = true;
								continue;
							}
							self.connection_lost("ws ended".to_string());
							return;
						}
					};

					last_activity = Instant::now();
					match msg {
						Message::Text(t) => {
							if let Flow::Stop = self.on_text(&t, &mut migrating).await {
								return;
							}
						}
						Message::Ping(p) => {
							let _ = ws.send(Message::Pong(p)).await;
						}
						Message::Close(frame) => {
							if mig_active {
								primary_done = true;
								continue;
							}
							self.connection_lost(format!("ws closed: {frame:?}"));
							return;
						}
						_ => {}
					}
				}

				msg2 = async {
					match &mut migrating {
						Some(m) => m.ws.next().await,
						None => std::future::pending().await,
					}
				}, if mig_active => {
					let failure = match msg2 {
						Some(Ok(Message::Text(t))) => {
							let Ok(frame) = eventsub::parse_frame(&t) else {
								debug!("unparseable frame on reconnect socket");
								continue;
							};

							if frame.message_type() == MessageType::SessionWelcome {
								let Some(m) = migrating.take() else {
									continue;
								};
								match self.promote(&frame) {
									Ok(Some(new_keepalive)) => {
										let mut old = std::mem::replace(&mut ws, m.ws);
										if !primary_done {
											let _ = old.close(None).await;
										}
										primary_done = false;
										keepalive = new_keepalive;
										last_activity = Instant::now();
										self.notify_reconnected();
										continue;
									}
									Ok(None) => return,
									Err(e) => Some((m.url, e)),
								}
							} else if frame.message_type() == MessageType::SessionReconnect {
								debug!("ignoring session_reconnect on reconnect socket before its welcome");
								None
							} else {
								if let Flow::Stop = self.on_frame(frame, &mut None).await {
									return;
								}
								None
							}
						}
						Some(Ok(Message::Ping(p))) => {
							if let Some(m) = &mut migrating {
								let _ = m.ws.send(Message::Pong(p)).await;
							}
							None
						}
						Some(Ok(Message::Close(frame))) => {
							Some((String::new(), anyhow::anyhow!("reconnect socket closed: {frame:?}")))
						}
						Some(Ok(_)) => None,
						Some(Err(e)) => Some((String::new(), anyhow::Error::new(e).context("reconnect socket read"))),
						None => Some((String::new(), anyhow::anyhow!("reconnect socket ended"))),
					};

					if let Some((url, error)) = failure {
						let url = match migrating.take() {
							Some(m) => m.url,
							None => url,
						};
						if let Flow::Stop = self.migration_failed(url, error, primary_done) {
							return;
						}
						primary_done = false;
					}
				}

				_ = sleep_until(mig_deadline), if mig_active => {
					if let Some(m) = migrating.take() {
						let error = anyhow::anyhow!("timed out waiting for session_welcome on reconnect socket");
						if let Flow::Stop = self.migration_failed(m.url, error, primary_done) {
							return;
						}
					}
				}

				_ = sleep_until(watchdog), if !primary_done => {
					self.connection_lost(format!("no message within keepalive window ({}s + {}s grace)", keepalive.as_secs(), grace.as_secs()));
					return;
				}
			}
		}
	}

	/// Live session handle, if this reader still owns the connection.
	fn current(&self) -> Option<Arc<SessionInner>> {
		let inner = self.session.upgrade()?;
		let current = {
			let st = inner.state.lock();
			st.status == SessionStatus::Connected && st.generation == self.generation
		};
		current.then_some(inner)
	}

	async fn on_text(&self, raw: &str, migrating: &mut Option<Migration>) -> Flow {
		match eventsub::parse_frame(raw) {
			Ok(frame) => self.on_frame(frame, migrating).await,
			Err(e) => {
				warn!(error = %format!("{e:#}"), "dropping unparseable eventsub frame");
				Flow::Continue
			}
		}
	}

	/// Handle one frame. `migrating` is `&mut None` for frames off the reconnect socket,
	/// which never carry a `session_reconnect` here.
	async fn on_frame(&self, frame: EventSubFrame, migrating: &mut Option<Migration>) -> Flow {
		let Some(inner) = self.current() else {
			return Flow::Stop;
		};

		match frame.message_type() {
			MessageType::SessionKeepalive => debug!("eventsub keepalive"),
			MessageType::Notification => self.dispatch_notification(&inner, &frame),
			MessageType::Revocation => self.handle_revocation(&inner, &frame),
			MessageType::SessionReconnect => {
				if migrating.is_none() {
					*migrating = self.start_migration(&inner, &frame).await;
				}
			}
			other => debug!(message_type = %other, "ignoring eventsub frame"),
		}
		Flow::Continue
	}

	fn dispatch_notification(&self, inner: &Arc<SessionInner>, frame: &EventSubFrame) {
		let payload = match eventsub::parse_event_payload(frame.payload.get()) {
			Ok(p) => p,
			Err(e) => {
				warn!(message_id = %frame.metadata.message_id, error = %format!("{e:#}"), "dropping malformed notification");
				return;
			}
		};

		let topic = {
			let st = inner.state.lock();
			st.topic_by_subscription.get(&payload.subscription.id).cloned()
		};
		let Some(topic) = topic else {
			counter!("eventwire_bridge_unknown_subscription_total").increment(1);
			debug!(subscription_id = %payload.subscription.id, "notification for untracked subscription");
			return;
		};

		counter!("eventwire_bridge_notifications_total").increment(1);
		if let Some(cb) = &inner.cfg.on_message {
			cb(&topic, payload.event_bytes());
		}
	}

	fn handle_revocation(&self, inner: &Arc<SessionInner>, frame: &EventSubFrame) {
		let payload = match eventsub::parse_event_payload(frame.payload.get()) {
			Ok(p) => p,
			Err(e) => {
				warn!(message_id = %frame.metadata.message_id, error = %format!("{e:#}"), "dropping malformed revocation");
				return;
			}
		};
		let id = payload.subscription.id.as_str();

		let topic = {
			let mut st = inner.state.lock();
			let topic = st.topic_by_subscription.remove(id);
			if let Some(topic) = &topic
				&& let Some(binding) = st.bindings.get_mut(topic)
			{
				binding.members.retain(|s| s.id != id);
				if binding.members.is_empty() {
					st.bindings.remove(topic);
				}
			}
			topic
		};
		let Some(topic) = topic else {
			debug!(subscription_id = id, "revocation for untracked subscription");
			return;
		};

		let reason = RevocationReason::from(&payload.subscription.status);
		counter!("eventwire_bridge_revocations_total").increment(1);
		warn!(%topic, subscription_id = id, %reason, "eventsub subscription revoked");

		SubscriptionSession::from_inner(inner.clone()).report(BridgeError::SubscriptionRevoked {
			topic,
			subscription_id: id.to_string(),
			reason,
		});
	}

	async fn start_migration(&self, inner: &Arc<SessionInner>, frame: &EventSubFrame) -> Option<Migration> {
		let session = SubscriptionSession::from_inner(inner.clone());
		let url = match eventsub::parse_session(frame).and_then(|s| s.reconnect_url.context("session_reconnect without reconnect_url")) {
			Ok(url) => url,
			Err(error) => {
				session.report(BridgeError::ReconnectFailed { url: String::new(), error });
				return None;
			}
		};

		info!(%url, "eventsub session_reconnect; opening new socket");
		let cfg = &inner.cfg;
		let connect = async {
			let parsed = Url::parse(&url).with_context(|| format!("invalid reconnect_url: {url}"))?;
			cfg.connector()(parsed).await
		};

		match tokio::time::timeout(cfg.connect_timeout, connect).await {
			Ok(Ok(ws)) => Some(Migration {
				url,
				ws,
				deadline: Instant::now() + cfg.connect_timeout,
			}),
			Ok(Err(error)) => {
				session.report(BridgeError::ReconnectFailed { url, error });
				None
			}
			Err(_) => {
				session.report(BridgeError::ReconnectFailed {
					url,
					error: anyhow::anyhow!("timed out connecting"),
				});
				None
			}
		}
	}

	/// Adopt the reconnect socket's welcome. `Ok(None)` when the session was closed meanwhile.
	fn promote(&self, frame: &EventSubFrame) -> anyhow::Result<Option<Duration>> {
		let welcome = eventsub::parse_session(frame)?;
		let Some(inner) = self.current() else {
			return Ok(None);
		};

		let keepalive = welcome.keepalive_timeout();
		{
			let mut st = inner.state.lock();
			if st.generation != self.generation {
				return Ok(None);
			}
			st.connection_id = welcome.id.clone();
			st.keepalive_timeout = keepalive;
		}

		counter!("eventwire_bridge_reconnects_total").increment(1);
		info!(session_id = %welcome.id, "eventsub session migrated");
		Ok(Some(keepalive))
	}

	fn notify_reconnected(&self) {
		let Some(inner) = self.current() else {
			return;
		};
		if let Some(cb) = &inner.cfg.on_reconnect {
			cb(&SubscriptionSession::from_inner(inner.clone()));
		}
	}

	fn migration_failed(&self, url: String, error: anyhow::Error, primary_done: bool) -> Flow {
		warn!(%url, error = %format!("{error:#}"), "eventsub reconnect failed");
		if let Some(inner) = self.current() {
			SubscriptionSession::from_inner(inner).report(BridgeError::ReconnectFailed { url, error });
		}

		if primary_done {
			self.connection_lost("primary socket ended and reconnect failed".to_string());
			return Flow::Stop;
		}
		Flow::Continue
	}

	/// Tear the session down if this reader still owns it, then report.
	fn connection_lost(&self, reason: String) {
		let Some(inner) = self.session.upgrade() else {
			return;
		};

		let owned = {
			let mut st = inner.state.lock();
			let owned = st.status == SessionStatus::Connected && st.generation == self.generation;
			if owned {
				st.reset();
				st.generation = st.generation.wrapping_add(1);
				st.shutdown = None;
				st.reader = None;
			}
			owned
		};

		if owned {
			warn!(%reason, "eventsub connection lost");
			SubscriptionSession::from_inner(inner).report(BridgeError::ConnectionLost(reason));
		}
	}
}
