#![forbid(unsafe_code)]

pub mod twitch;

use std::fmt;

use async_trait::async_trait;
use eventwire_domain::{Subscription, SubscriptionRequest, Transport};

/// Wrapper that redacts in logs.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}

	/// Access the inner secret string.
	pub fn expose(&self) -> &str {
		&self.0
	}

	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretString(<redacted>)")
	}
}

impl fmt::Display for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("<redacted>")
	}
}

impl<'de> serde::Deserialize<'de> for SecretString {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: serde::Deserializer<'de>,
	{
		let s = String::deserialize(deserializer)?;
		Ok(SecretString::new(s))
	}
}

/// Subscription management collaborator (create/delete on the platform).
#[async_trait]
pub trait SubscriptionApi: Send + Sync + 'static {
	async fn create_subscription(
		&self,
		request: &SubscriptionRequest,
		transport: Transport,
	) -> anyhow::Result<Subscription>;

	async fn delete_subscription(&self, id: &str) -> anyhow::Result<()>;
}

/// Supplies a bearer token on demand. Refresh is the implementor's concern.
#[async_trait]
pub trait TokenProvider: Send + Sync + 'static {
	async fn access_token(&self) -> anyhow::Result<SecretString>;
}

/// Token provider backed by a fixed user access token.
#[derive(Debug, Clone)]
pub struct StaticTokenProvider {
	token: SecretString,
}

impl StaticTokenProvider {
	pub fn new(token: SecretString) -> Self {
		Self { token }
	}
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
	async fn access_token(&self) -> anyhow::Result<SecretString> {
		if self.token.is_empty() {
			anyhow::bail!("no access token configured");
		}
		Ok(self.token.clone())
	}
}
