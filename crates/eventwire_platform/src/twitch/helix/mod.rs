#![forbid(unsafe_code)]

#[cfg(test)]
mod tests;

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use async_trait::async_trait;
use eventwire_domain::{Condition, Subscription, SubscriptionRequest, Transport};
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde::{Deserialize, Serialize};
use metrics::counter;
use tracing::{debug, warn};
use url::Url;

use crate::{SubscriptionApi, TokenProvider};

const EVENTSUB_SUBSCRIPTIONS_PATH: &str = "/helix/eventsub/subscriptions";

/// Longest advertised rate-limit wait honoured before the single retry.
const MAX_RATE_LIMIT_WAIT: Duration = Duration::from_secs(30);
const SERVER_ERROR_BACKOFF: Duration = Duration::from_millis(250);

/// Rate-limit wait from `Retry-After` (seconds) or `Ratelimit-Reset` (unix seconds).
fn advertised_wait(headers: &HeaderMap, now_unix: u64) -> Option<Duration> {
	let number = |name: &str| {
		headers
			.get(name)
			.and_then(|v| v.to_str().ok())
			.and_then(|s| s.trim().parse::<u64>().ok())
	};

	if let Some(secs) = number(RETRY_AFTER.as_str()) {
		return Some(Duration::from_secs(secs));
	}
	number("Ratelimit-Reset").map(|reset| Duration::from_secs(reset.saturating_sub(now_unix)))
}

/// Wait before retrying a response with `status`, or `None` to give up.
fn retry_wait(status: StatusCode, headers: &HeaderMap, now_unix: u64) -> Option<Duration> {
	if status == StatusCode::TOO_MANY_REQUESTS {
		return advertised_wait(headers, now_unix).filter(|wait| *wait <= MAX_RATE_LIMIT_WAIT);
	}
	status.is_server_error().then_some(SERVER_ERROR_BACKOFF)
}

fn unix_now() -> u64 {
	SystemTime::now().duration_since(UNIX_EPOCH).map_or(0, |d| d.as_secs())
}

/// Send once; retry once on 429 within [`MAX_RATE_LIMIT_WAIT`] or on 5xx.
async fn send_with_retry(req: reqwest::RequestBuilder, label: &'static str) -> anyhow::Result<reqwest::Response> {
	let retry = req.try_clone();
	let resp = req.send().await.with_context(|| format!("helix {label} send"))?;
	let status = resp.status();

	if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
		let body = resp.text().await.unwrap_or_default();
		anyhow::bail!("helix {label} unauthorized (status={status}): {body}");
	}

	let Some(retry) = retry else {
		return Ok(resp);
	};
	let Some(wait) = retry_wait(status, resp.headers(), unix_now()) else {
		if status == StatusCode::TOO_MANY_REQUESTS {
			warn!(label, "helix rate limited without a usable reset; not retrying");
		}
		return Ok(resp);
	};

	counter!("eventwire_helix_retries_total", "status" => status.as_u16().to_string()).increment(1);
	debug!(label, %status, wait_ms = wait.as_millis() as u64, "retrying helix request");
	tokio::time::sleep(wait).await;
	retry.send().await.with_context(|| format!("helix {label} retry send"))
}

/// Helix connection settings.
#[derive(Debug, Clone)]
pub struct HelixConfig {
	pub base_url: String,
	pub client_id: String,
}

impl HelixConfig {
	pub fn new(client_id: impl Into<String>) -> Self {
		Self {
			base_url: "https://api.twitch.tv".to_string(),
			client_id: client_id.into(),
		}
	}
}

/// [`SubscriptionApi`] backed by `/helix/eventsub/subscriptions`.
#[derive(Clone)]
pub struct HelixSubscriptionClient {
	http: reqwest::Client,
	base_url: Url,
	client_id: String,
	tokens: Arc<dyn TokenProvider>,
}

#[derive(Debug, Serialize)]
struct HelixCreateSubscriptionRequest<'a> {
	#[serde(rename = "type")]
	r#type: &'a str,
	version: &'a str,
	condition: &'a Condition,
	transport: &'a Transport,
}

#[derive(Debug, Deserialize)]
struct HelixSubscriptionsResponse {
	data: Vec<Subscription>,

	#[serde(default)]
	pagination: Option<HelixPagination>,
}

#[derive(Debug, Deserialize)]
struct HelixPagination {
	#[serde(default)]
	cursor: Option<String>,
}

impl HelixSubscriptionClient {
	pub fn new(cfg: HelixConfig, tokens: Arc<dyn TokenProvider>) -> anyhow::Result<Self> {
		let base_url = Url::parse(&cfg.base_url).with_context(|| format!("parse helix base url {}", cfg.base_url))?;
		let http = reqwest::Client::builder()
			.user_agent("eventwire/0.x (eventsub)")
			.build()
			.context("build reqwest client")?;

		Ok(Self {
			http,
			base_url,
			client_id: cfg.client_id,
			tokens,
		})
	}

	async fn authed(&self, req: reqwest::RequestBuilder) -> anyhow::Result<reqwest::RequestBuilder> {
		let token = self.tokens.access_token().await.context("obtain helix access token")?;
		Ok(req
			.header("Client-Id", &self.client_id)
			.header("Authorization", format!("Bearer {}", token.expose())))
	}

	fn url(&self, path_and_query: &str) -> anyhow::Result<Url> {
		self.base_url.join(path_and_query).context("join helix url")
	}

	/// One page of subscriptions, optionally filtered by type.
	async fn list_page(
		&self,
		subscription_type: Option<&str>,
		after: Option<&str>,
	) -> anyhow::Result<HelixSubscriptionsResponse> {
		let mut query = Vec::new();
		if let Some(ty) = subscription_type {
			query.push(format!("type={}", urlencoding::encode(ty)));
		}
		if let Some(after) = after {
			query.push(format!("after={}", urlencoding::encode(after)));
		}
		let path = if query.is_empty() {
			EVENTSUB_SUBSCRIPTIONS_PATH.to_string()
		} else {
			format!("{EVENTSUB_SUBSCRIPTIONS_PATH}?{}", query.join("&"))
		};

		let url = self.url(&path)?;
		let resp = send_with_retry(self.authed(self.http.get(url)).await?, "GET /helix/eventsub/subscriptions")
			.await
			.context("helix GET /helix/eventsub/subscriptions send")?;

		let status = resp.status();
		let body = resp
			.text()
			.await
			.context("helix GET /helix/eventsub/subscriptions read body")?;

		if !status.is_success() {
			anyhow::bail!("helix list subscriptions failed: status={status} body={body}");
		}

		serde_json::from_str(&body).context("helix list subscriptions parse json")
	}

	/// All subscriptions (following pagination cursors), optionally filtered by type.
	pub async fn list_subscriptions(&self, subscription_type: Option<&str>) -> anyhow::Result<Vec<Subscription>> {
		let mut out = Vec::new();
		let mut after: Option<String> = None;

		loop {
			let page = self.list_page(subscription_type, after.as_deref()).await?;
			out.extend(page.data);

			let next = page.pagination.and_then(|p| p.cursor).filter(|c| !c.is_empty());
			if next.is_none() {
				break;
			}
			after = next;
		}

		Ok(out)
	}
}

#[async_trait]
impl SubscriptionApi for HelixSubscriptionClient {
	async fn create_subscription(
		&self,
		request: &SubscriptionRequest,
		transport: Transport,
	) -> anyhow::Result<Subscription> {
		let kind = request.kind.as_str();
		let url = self.url(EVENTSUB_SUBSCRIPTIONS_PATH)?;
		let body = HelixCreateSubscriptionRequest {
			r#type: kind,
			version: &request.version,
			condition: &request.condition,
			transport: &transport,
		};

		let resp = send_with_retry(
			self.authed(self.http.post(url)).await?.json(&body),
			"POST /helix/eventsub/subscriptions",
		)
		.await
		.with_context(|| format!("helix POST {EVENTSUB_SUBSCRIPTIONS_PATH} send (type={kind})"))?;

		let status = resp.status();
		let body = resp
			.text()
			.await
			.with_context(|| format!("helix POST {EVENTSUB_SUBSCRIPTIONS_PATH} read body (type={kind})"))?;

		if status == StatusCode::CONFLICT {
			anyhow::bail!("helix create subscription conflict (type={kind}): body={body}");
		}
		if !status.is_success() {
			anyhow::bail!("helix create subscription failed (type={kind}): status={status} body={body}");
		}

		let parsed: HelixSubscriptionsResponse =
			serde_json::from_str(&body).with_context(|| format!("helix create subscription parse json (type={kind})"))?;
		parsed
			.data
			.into_iter()
			.next()
			.with_context(|| format!("helix create subscription returned no data (type={kind})"))
	}

	async fn delete_subscription(&self, id: &str) -> anyhow::Result<()> {
		let url = self.url(&format!(
			"{base}?id={}",
			urlencoding::encode(id),
			base = EVENTSUB_SUBSCRIPTIONS_PATH
		))?;

		let resp = send_with_retry(
			self.authed(self.http.delete(url)).await?,
			"DELETE /helix/eventsub/subscriptions",
		)
		.await
		.context("helix DELETE /helix/eventsub/subscriptions send")?;

		let status = resp.status();
		if status.is_success() {
			return Ok(());
		}

		let body = resp
			.text()
			.await
			.context("helix DELETE /helix/eventsub/subscriptions read body")?;
		anyhow::bail!("helix delete subscription failed (id={id}): status={status} body={body}");
	}
}
