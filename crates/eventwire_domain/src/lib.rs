#![forbid(unsafe_code)]

pub mod topic;

use core::fmt;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub use topic::{LegacyTopic, TopicError, TopicKind, build_topic, event_types_for, parse_topic};

/// Subscription condition (`condition` object), ordered by key.
pub type Condition = BTreeMap<String, String>;

/// Subscription lifecycle status as reported by the platform.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum SubscriptionStatus {
	Enabled,
	VerificationPending,

	/// Any other status; the platform uses these to say why a subscription stopped.
	Revoked(String),
}

impl SubscriptionStatus {
	pub const ENABLED: &'static str = "enabled";
	pub const VERIFICATION_PENDING: &'static str = "webhook_callback_verification_pending";

	pub fn as_str(&self) -> &str {
		match self {
			Self::Enabled => Self::ENABLED,
			Self::VerificationPending => Self::VERIFICATION_PENDING,
			Self::Revoked(reason) => reason.as_str(),
		}
	}

	pub fn is_enabled(&self) -> bool {
		matches!(self, Self::Enabled)
	}
}

impl From<String> for SubscriptionStatus {
	fn from(s: String) -> Self {
		match s.as_str() {
			Self::ENABLED => Self::Enabled,
			Self::VERIFICATION_PENDING => Self::VerificationPending,
			_ => Self::Revoked(s),
		}
	}
}

impl From<SubscriptionStatus> for String {
	fn from(s: SubscriptionStatus) -> Self {
		match s {
			SubscriptionStatus::Revoked(reason) => reason,
			other => other.as_str().to_string(),
		}
	}
}

impl fmt::Display for SubscriptionStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Delivery transport for a subscription.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum Transport {
	Webhook {
		callback: String,

		/// Only present on create requests; the platform never echoes it back.
		#[serde(default, skip_serializing_if = "Option::is_none")]
		secret: Option<String>,
	},
	Websocket {
		session_id: String,

		#[serde(default, skip_serializing_if = "Option::is_none")]
		connected_at: Option<String>,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		disconnected_at: Option<String>,
	},
}

impl Transport {
	/// WebSocket transport targeting a live session.
	pub fn websocket(session_id: impl Into<String>) -> Self {
		Self::Websocket {
			session_id: session_id.into(),
			connected_at: None,
			disconnected_at: None,
		}
	}

	/// Webhook transport with the callback URL and signing secret.
	pub fn webhook(callback: impl Into<String>, secret: impl Into<String>) -> Self {
		Self::Webhook {
			callback: callback.into(),
			secret: Some(secret.into()),
		}
	}

	pub fn method(&self) -> &'static str {
		match self {
			Self::Webhook { .. } => "webhook",
			Self::Websocket { .. } => "websocket",
		}
	}

	pub fn session_id(&self) -> Option<&str> {
		match self {
			Self::Websocket { session_id, .. } => Some(session_id.as_str()),
			Self::Webhook { .. } => None,
		}
	}
}

impl fmt::Debug for Transport {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Webhook { callback, secret } => f
				.debug_struct("Webhook")
				.field("callback", callback)
				.field("secret", &secret.as_ref().map(|_| "<redacted>"))
				.finish(),
			Self::Websocket {
				session_id,
				connected_at,
				disconnected_at,
			} => f
				.debug_struct("Websocket")
				.field("session_id", session_id)
				.field("connected_at", connected_at)
				.field("disconnected_at", disconnected_at)
				.finish(),
		}
	}
}

/// Platform-tracked subscription (read-only local copy).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
	pub id: String,

	#[serde(rename = "type")]
	pub kind: String,
	pub version: String,
	pub status: SubscriptionStatus,

	#[serde(default)]
	pub condition: Condition,
	pub transport: Transport,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub created_at: Option<String>,
}

/// Everything needed to create a subscription except its transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionRequest {
	#[serde(rename = "type")]
	pub kind: String,
	pub version: String,
	pub condition: Condition,
}

impl SubscriptionRequest {
	pub fn new(kind: impl Into<String>, version: impl Into<String>, condition: Condition) -> Self {
		Self {
			kind: kind.into(),
			version: version.into(),
			condition,
		}
	}
}

/// Why the platform revoked a subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RevocationReason {
	/// The user revoked the authorization (any `authorization_revoked*` status).
	AuthorizationRevoked,

	/// Verbatim status string.
	Other(String),
}

impl RevocationReason {
	pub const AUTHORIZATION_REVOKED: &'static str = "authorization_revoked";

	pub fn from_status(status: &str) -> Self {
		if status.starts_with(Self::AUTHORIZATION_REVOKED) {
			Self::AuthorizationRevoked
		} else {
			Self::Other(status.to_string())
		}
	}

	pub fn as_str(&self) -> &str {
		match self {
			Self::AuthorizationRevoked => Self::AUTHORIZATION_REVOKED,
			Self::Other(status) => status.as_str(),
		}
	}
}

impl From<&SubscriptionStatus> for RevocationReason {
	fn from(status: &SubscriptionStatus) -> Self {
		Self::from_status(status.as_str())
	}
}

impl fmt::Display for RevocationReason {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}
