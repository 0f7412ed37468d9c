#![forbid(unsafe_code)]

mod bridge;
mod dedup;
mod eventsub;
mod helix;
mod signature;
mod webhook;

pub use bridge::{
	BoxFuture, BridgeError, ConnectHandler, ErrorHandler, MessageHandler, ReconnectHandler, SessionConfig, SubscriptionSession,
	TwitchWs, WsConnector,
};
pub use dedup::{DedupConfig, Deduplicator};
pub use eventsub::MessageType;
pub use helix::{HelixConfig, HelixSubscriptionClient};
pub use signature::{SIGNATURE_PREFIX, sign, verify};
pub use webhook::{
	GateConfig, NotificationHandler, SignatureGate, VerificationPredicate, WebhookConfig, WebhookEndpoint, WebhookMessage,
	WebhookRejection, headers, serve_webhook, serve_webhook_listener,
};
