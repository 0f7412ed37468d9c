#![forbid(unsafe_code)]

mod auth;
mod gate;
mod server;

#[cfg(test)]
mod tests;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use eventwire_domain::{RevocationReason, Subscription};
use http_body_util::Full;
use hyper::body::Body;
use hyper::{Request, Response, StatusCode};
use tracing::{debug, info, warn};

pub use auth::WebhookRejection;
pub use gate::{GateConfig, SignatureGate};
pub use server::{serve_webhook, serve_webhook_listener};

use self::auth::{AuthLimits, Authenticated, authenticate, empty_response, text_response};
use super::dedup::{DedupConfig, Deduplicator};
use super::eventsub::{MessageType, parse_event_payload};
use crate::SecretString;

/// EventSub webhook header names.
pub mod headers {
	pub const MESSAGE_ID: &str = "Twitch-Eventsub-Message-Id";
	pub const MESSAGE_TIMESTAMP: &str = "Twitch-Eventsub-Message-Timestamp";
	pub const MESSAGE_SIGNATURE: &str = "Twitch-Eventsub-Message-Signature";
	pub const MESSAGE_TYPE: &str = "Twitch-Eventsub-Message-Type";
	pub const MESSAGE_RETRY: &str = "Twitch-Eventsub-Message-Retry";
	pub const SUBSCRIPTION_TYPE: &str = "Twitch-Eventsub-Subscription-Type";
	pub const SUBSCRIPTION_VERSION: &str = "Twitch-Eventsub-Subscription-Version";
}

/// Authenticated webhook message handed to caller handlers.
#[derive(Debug, Clone)]
pub struct WebhookMessage {
	pub message_id: String,
	pub message_type: MessageType,
	pub timestamp: DateTime<Utc>,
	pub subscription: Subscription,

	/// Raw `event` JSON, left for the caller to decode. Empty for verification requests.
	pub event: Bytes,

	/// Only set on `webhook_callback_verification`.
	pub challenge: Option<String>,
}

impl WebhookMessage {
	/// Revocation reason derived from the subscription status.
	pub fn revocation_reason(&self) -> RevocationReason {
		RevocationReason::from(&self.subscription.status)
	}
}

pub type VerificationPredicate = Arc<dyn Fn(&WebhookMessage) -> bool + Send + Sync>;
pub type NotificationHandler = Arc<dyn Fn(WebhookMessage) + Send + Sync>;

/// Webhook endpoint configuration.
#[derive(Clone)]
pub struct WebhookConfig {
	pub secret: SecretString,
	pub max_message_age: Duration,
	pub future_tolerance: Duration,
	pub max_body_bytes: usize,

	/// `None` disables replay detection.
	pub dedup: Option<DedupConfig>,

	verification: Option<VerificationPredicate>,
	notification: Option<NotificationHandler>,
	revocation: Option<NotificationHandler>,
}

impl WebhookConfig {
	pub const DEFAULT_MAX_MESSAGE_AGE: Duration = Duration::from_secs(10 * 60);
	pub const FUTURE_TOLERANCE: Duration = Duration::from_secs(60);
	pub const DEFAULT_MAX_BODY_BYTES: usize = 1024 * 1024;

	pub fn new(secret: SecretString) -> Self {
		Self {
			secret,
			max_message_age: Self::DEFAULT_MAX_MESSAGE_AGE,
			future_tolerance: Self::FUTURE_TOLERANCE,
			max_body_bytes: Self::DEFAULT_MAX_BODY_BYTES,
			dedup: Some(DedupConfig::default()),
			verification: None,
			notification: None,
			revocation: None,
		}
	}

	pub fn max_message_age(mut self, age: Duration) -> Self {
		self.max_message_age = age;
		self
	}

	pub fn max_body_bytes(mut self, limit: usize) -> Self {
		self.max_body_bytes = limit;
		self
	}

	pub fn dedup(mut self, dedup: Option<DedupConfig>) -> Self {
		self.dedup = dedup;
		self
	}

	/// Decide whether to confirm a subscription. Without one, every verification is accepted.
	pub fn on_verification(mut self, f: impl Fn(&WebhookMessage) -> bool + Send + Sync + 'static) -> Self {
		self.verification = Some(Arc::new(f));
		self
	}

	pub fn on_notification(mut self, f: impl Fn(WebhookMessage) + Send + Sync + 'static) -> Self {
		self.notification = Some(Arc::new(f));
		self
	}

	pub fn on_revocation(mut self, f: impl Fn(WebhookMessage) + Send + Sync + 'static) -> Self {
		self.revocation = Some(Arc::new(f));
		self
	}

	pub(crate) fn limits(&self) -> AuthLimits {
		AuthLimits {
			secret: self.secret.clone(),
			max_message_age: self.max_message_age,
			future_tolerance: self.future_tolerance,
			max_body_bytes: self.max_body_bytes,
		}
	}
}

impl fmt::Debug for WebhookConfig {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("WebhookConfig")
			.field("secret", &self.secret)
			.field("max_message_age", &self.max_message_age)
			.field("future_tolerance", &self.future_tolerance)
			.field("max_body_bytes", &self.max_body_bytes)
			.field("dedup", &self.dedup)
			.field("verification", &self.verification.is_some())
			.field("notification", &self.notification.is_some())
			.field("revocation", &self.revocation.is_some())
			.finish()
	}
}

/// Authenticates inbound EventSub webhook requests and dispatches them by type.
pub struct WebhookEndpoint {
	cfg: WebhookConfig,
	limits: AuthLimits,
	dedup: Option<Deduplicator>,
}

impl WebhookEndpoint {
	pub fn new(cfg: WebhookConfig) -> Self {
		Self {
			limits: cfg.limits(),
			dedup: cfg.dedup.map(Deduplicator::new),
			cfg,
		}
	}

	pub fn config(&self) -> &WebhookConfig {
		&self.cfg
	}

	/// Handle one request. Every outcome, including rejection, is an HTTP response.
	pub async fn handle<B>(&self, req: Request<B>) -> Response<Full<Bytes>>
	where
		B: Body<Data = Bytes>,
		B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
	{
		metrics::counter!("eventwire_webhook_requests_total").increment(1);

		let result = match authenticate(&self.limits, req).await {
			Ok(authed) => self.dispatch(authed),
			Err(rejection) => Err(rejection),
		};

		match result {
			Ok(resp) => resp,
			Err(rejection) => {
				metrics::counter!(rejection.metric()).increment(1);
				debug!(reason = %rejection, status = %rejection.status(), "webhook request rejected");
				rejection.into_response()
			}
		}
	}

	fn dispatch(&self, authed: Authenticated) -> Result<Response<Full<Bytes>>, WebhookRejection> {
		let message_type = MessageType::from(authed.message_type.as_deref().unwrap_or_default());
		if !matches!(
			message_type,
			MessageType::WebhookCallbackVerification | MessageType::Notification | MessageType::Revocation
		) {
			return Err(WebhookRejection::UnknownType);
		}

		let body = std::str::from_utf8(&authed.body).map_err(|_| WebhookRejection::Malformed)?;
		let payload = parse_event_payload(body).map_err(|e| {
			debug!(error = %e, message_id = %authed.message_id, "webhook payload parse failed");
			WebhookRejection::Malformed
		})?;

		let message = WebhookMessage {
			event: payload.event_bytes(),
			message_id: authed.message_id,
			message_type,
			timestamp: authed.timestamp,
			subscription: payload.subscription,
			challenge: payload.challenge,
		};

		match message.message_type {
			MessageType::WebhookCallbackVerification => self.verify_callback(message),
			MessageType::Notification => {
				if self.is_replay(&message) {
					return Ok(empty_response(StatusCode::NO_CONTENT));
				}
				metrics::counter!("eventwire_webhook_notifications_total").increment(1);
				if let Some(handler) = &self.cfg.notification {
					handler(message);
				}
				Ok(empty_response(StatusCode::NO_CONTENT))
			}
			MessageType::Revocation => {
				if self.is_replay(&message) {
					return Ok(empty_response(StatusCode::NO_CONTENT));
				}
				metrics::counter!("eventwire_webhook_revocations_total").increment(1);
				info!(
					subscription_id = %message.subscription.id,
					subscription_type = %message.subscription.kind,
					reason = %message.revocation_reason(),
					"eventsub webhook subscription revoked"
				);
				if let Some(handler) = &self.cfg.revocation {
					handler(message);
				}
				Ok(empty_response(StatusCode::NO_CONTENT))
			}
			_ => Err(WebhookRejection::UnknownType),
		}
	}

	fn verify_callback(&self, message: WebhookMessage) -> Result<Response<Full<Bytes>>, WebhookRejection> {
		let Some(challenge) = message.challenge.clone() else {
			return Err(WebhookRejection::Malformed);
		};

		let accepted = self.cfg.verification.as_ref().is_none_or(|predicate| predicate(&message));
		if !accepted {
			warn!(
				subscription_id = %message.subscription.id,
				subscription_type = %message.subscription.kind,
				"webhook verification rejected by predicate"
			);
			return Err(WebhookRejection::VerificationRejected);
		}

		info!(
			subscription_id = %message.subscription.id,
			subscription_type = %message.subscription.kind,
			"webhook subscription verified"
		);
		Ok(text_response(StatusCode::OK, challenge))
	}

	fn is_replay(&self, message: &WebhookMessage) -> bool {
		let duplicate = self
			.dedup
			.as_ref()
			.is_some_and(|d| d.is_duplicate(&message.message_id));
		if duplicate {
			metrics::counter!("eventwire_webhook_duplicate_total").increment(1);
			debug!(message_id = %message.message_id, "duplicate webhook delivery ignored");
		}
		duplicate
	}
}
