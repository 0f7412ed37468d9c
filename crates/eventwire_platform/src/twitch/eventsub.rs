#![forbid(unsafe_code)]

use core::fmt;
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use eventwire_domain::Subscription;
use serde::Deserialize;
use serde_json::value::RawValue;

/// EventSub message type, shared by the webhook header and the WebSocket metadata.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageType {
	WebhookCallbackVerification,
	Notification,
	Revocation,
	SessionWelcome,
	SessionKeepalive,
	SessionReconnect,
	Other(String),
}

impl MessageType {
	pub fn as_str(&self) -> &str {
		match self {
			Self::WebhookCallbackVerification => "webhook_callback_verification",
			Self::Notification => "notification",
			Self::Revocation => "revocation",
			Self::SessionWelcome => "session_welcome",
			Self::SessionKeepalive => "session_keepalive",
			Self::SessionReconnect => "session_reconnect",
			Self::Other(s) => s.as_str(),
		}
	}
}

impl From<&str> for MessageType {
	fn from(s: &str) -> Self {
		match s {
			"webhook_callback_verification" => Self::WebhookCallbackVerification,
			"notification" => Self::Notification,
			"revocation" => Self::Revocation,
			"session_welcome" => Self::SessionWelcome,
			"session_keepalive" => Self::SessionKeepalive,
			"session_reconnect" => Self::SessionReconnect,
			other => Self::Other(other.to_string()),
		}
	}
}

impl fmt::Display for MessageType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// EventSub metadata (present on all WebSocket messages).
#[derive(Debug, Deserialize)]
pub(crate) struct EventSubMetadata {
	pub(crate) message_id: String,
	pub(crate) message_type: String,
	pub(crate) message_timestamp: String,
}

/// WebSocket envelope; the payload is decoded once the type is known.
#[derive(Debug, Deserialize)]
pub(crate) struct EventSubFrame {
	pub(crate) metadata: EventSubMetadata,
	pub(crate) payload: Box<RawValue>,
}

impl EventSubFrame {
	pub(crate) fn message_type(&self) -> MessageType {
		MessageType::from(self.metadata.message_type.as_str())
	}
}

/// Notification/revocation payload. Webhook verification requests add `challenge`.
#[derive(Debug, Deserialize)]
pub(crate) struct EventSubEventPayload {
	pub(crate) subscription: Subscription,

	#[serde(default)]
	pub(crate) event: Option<Box<RawValue>>,
	#[serde(default)]
	pub(crate) challenge: Option<String>,
}

impl EventSubEventPayload {
	/// Raw event JSON, empty when the message carries none.
	pub(crate) fn event_bytes(&self) -> Bytes {
		self.event
			.as_ref()
			.map(|raw| Bytes::copy_from_slice(raw.get().as_bytes()))
			.unwrap_or_default()
	}
}

#[derive(Debug, Deserialize)]
pub(crate) struct EventSubSessionPayload {
	pub(crate) session: EventSubSession,
}

/// `session` object of welcome and reconnect payloads.
#[derive(Debug, Deserialize)]
pub(crate) struct EventSubSession {
	pub(crate) id: String,

	#[serde(default)]
	pub(crate) status: Option<String>,
	#[serde(default)]
	pub(crate) keepalive_timeout_seconds: Option<u64>,
	#[serde(default)]
	pub(crate) reconnect_url: Option<String>,
}

impl EventSubSession {
	/// Server keepalive, capped at the largest value EventSub hands out.
	pub(crate) fn keepalive_timeout(&self) -> Duration {
		let secs = self
			.keepalive_timeout_seconds
			.unwrap_or(DEFAULT_KEEPALIVE_SECS)
			.min(MAX_KEEPALIVE_SECS);
		Duration::from_secs(secs)
	}
}

pub(crate) const DEFAULT_KEEPALIVE_SECS: u64 = 10;
pub(crate) const MAX_KEEPALIVE_SECS: u64 = 600;

/// Parse a raw WS text frame into its envelope.
pub(crate) fn parse_frame(raw_json: &str) -> anyhow::Result<EventSubFrame> {
	serde_json::from_str(raw_json).context("parse EventSub frame")
}

/// Decode a `session_welcome`/`session_reconnect` payload.
pub(crate) fn parse_session(frame: &EventSubFrame) -> anyhow::Result<EventSubSession> {
	let payload: EventSubSessionPayload =
		serde_json::from_str(frame.payload.get()).context("parse EventSub session payload")?;
	Ok(payload.session)
}

/// Decode a notification/revocation payload.
pub(crate) fn parse_event_payload(raw_json: &str) -> anyhow::Result<EventSubEventPayload> {
	serde_json::from_str(raw_json).context("parse EventSub event payload")
}

pub(crate) fn parse_message_timestamp(ts: &str) -> anyhow::Result<DateTime<Utc>> {
	let dt = DateTime::parse_from_rfc3339(ts).context("parse EventSub RFC3339 timestamp")?;
	Ok(dt.with_timezone(&Utc))
}
