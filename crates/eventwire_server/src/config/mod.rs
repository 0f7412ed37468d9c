#![forbid(unsafe_code)]


use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use eventwire_platform::SecretString;
use eventwire_platform::twitch::{DedupConfig, WebhookConfig};
use serde::Deserialize;
use tracing::{info, warn};

/// Default config path: `~/.eventwire/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".eventwire").join("config.toml"))
}

/// Load the server config from TOML and `EVENTWIRE_*` env overrides.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg);

	apply_env_overrides(&mut cfg, |key| std::env::var(key).ok());

	Ok(cfg)
}

pub const DEFAULT_WEBHOOK_PATH: &str = "/eventsub";

#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub webhook: WebhookSettings,
	pub twitch: TwitchSettings,
	pub bridge: BridgeSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
	/// Webhook listener bind address (host:port). No listener when unset.
	pub webhook_bind: Option<String>,
	pub webhook_path: String,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
}

impl Default for ServerSettings {
	fn default() -> Self {
		Self {
			webhook_bind: None,
			webhook_path: DEFAULT_WEBHOOK_PATH.to_string(),
			metrics_bind: None,
		}
	}
}

#[derive(Debug, Clone)]
pub struct WebhookSettings {
	/// Shared secret registered with the webhook subscriptions.
	pub secret: Option<SecretString>,
	pub max_message_age: Duration,
	pub max_body_bytes: usize,
	pub dedup_max_age: Duration,
	pub dedup_max_size: usize,
}

impl Default for WebhookSettings {
	fn default() -> Self {
		let dedup = DedupConfig::default();
		Self {
			secret: None,
			max_message_age: WebhookConfig::DEFAULT_MAX_MESSAGE_AGE,
			max_body_bytes: WebhookConfig::DEFAULT_MAX_BODY_BYTES,
			dedup_max_age: dedup.max_age,
			dedup_max_size: dedup.max_size,
		}
	}
}

impl WebhookSettings {
	/// Endpoint config, or `None` without a secret.
	pub fn to_webhook_config(&self) -> Option<WebhookConfig> {
		let secret = self.secret.clone()?;
		Some(
			WebhookConfig::new(secret)
				.max_message_age(self.max_message_age)
				.max_body_bytes(self.max_body_bytes)
				.dedup(Some(DedupConfig {
					max_age: self.dedup_max_age,
					max_size: self.dedup_max_size,
				})),
		)
	}
}

#[derive(Debug, Clone, Default)]
pub struct TwitchSettings {
	pub client_id: Option<String>,
	/// User access token (bearer) for Helix subscription calls.
	pub user_access_token: Option<SecretString>,
	pub helix_base_url: Option<String>,
	pub eventsub_ws_url: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct BridgeSettings {
	pub enabled: bool,
	/// Legacy topics to listen to after connecting.
	pub topics: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	webhook: FileWebhookSettings,

	#[serde(default)]
	twitch: FileTwitchSettings,

	#[serde(default)]
	bridge: FileBridgeSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	webhook_bind: Option<String>,
	webhook_path: Option<String>,
	metrics_bind: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileWebhookSettings {
	secret: Option<SecretString>,
	max_message_age_secs: Option<u64>,
	max_body_bytes: Option<usize>,
	dedup_max_age_secs: Option<u64>,
	dedup_max_size: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileTwitchSettings {
	client_id: Option<String>,
	user_access_token: Option<SecretString>,
	helix_base_url: Option<String>,
	eventsub_ws_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileBridgeSettings {
	enabled: Option<bool>,

	#[serde(default)]
	topics: Vec<String>,
}

fn non_empty(v: Option<String>) -> Option<String> {
	v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn non_empty_secret(v: Option<SecretString>) -> Option<SecretString> {
	non_empty(v.map(|s| s.expose().to_string())).map(SecretString::new)
}

fn normalize_path(path: &str) -> String {
	let path = path.trim();
	if path.is_empty() {
		DEFAULT_WEBHOOK_PATH.to_string()
	} else if path.starts_with('/') {
		path.to_string()
	} else {
		format!("/{path}")
	}
}

/// Trimmed, valid, de-duplicated topics. Invalid entries are logged and dropped.
fn normalize_topics<I>(topics: I) -> Vec<String>
where
	I: IntoIterator<Item = String>,
{
	let mut out: Vec<String> = Vec::new();
	for topic in topics {
		let topic = topic.trim();
		if topic.is_empty() {
			continue;
		}
		if let Err(e) = eventwire_domain::parse_topic(topic) {
			warn!(topic, error = %e, "bridge config: ignoring invalid topic");
			continue;
		}
		if !out.iter().any(|t| t == topic) {
			out.push(topic.to_string());
		}
	}
	out
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> Self {
		let webhook_defaults = WebhookSettings::default();

		Self {
			server: ServerSettings {
				webhook_bind: non_empty(file.server.webhook_bind),
				webhook_path: file
					.server
					.webhook_path
					.as_deref()
					.map(normalize_path)
					.unwrap_or_else(|| DEFAULT_WEBHOOK_PATH.to_string()),
				metrics_bind: non_empty(file.server.metrics_bind),
			},
			webhook: WebhookSettings {
				secret: non_empty_secret(file.webhook.secret),
				max_message_age: file
					.webhook
					.max_message_age_secs
					.filter(|v| *v > 0)
					.map(Duration::from_secs)
					.unwrap_or(webhook_defaults.max_message_age),
				max_body_bytes: file
					.webhook
					.max_body_bytes
					.filter(|v| *v > 0)
					.unwrap_or(webhook_defaults.max_body_bytes),
				dedup_max_age: file
					.webhook
					.dedup_max_age_secs
					.filter(|v| *v > 0)
					.map(Duration::from_secs)
					.unwrap_or(webhook_defaults.dedup_max_age),
				dedup_max_size: file
					.webhook
					.dedup_max_size
					.filter(|v| *v > 0)
					.unwrap_or(webhook_defaults.dedup_max_size),
			},
			twitch: TwitchSettings {
				client_id: non_empty(file.twitch.client_id),
				user_access_token: non_empty_secret(file.twitch.user_access_token),
				helix_base_url: non_empty(file.twitch.helix_base_url),
				eventsub_ws_url: non_empty(file.twitch.eventsub_ws_url),
			},
			bridge: BridgeSettings {
				enabled: file.bridge.enabled.unwrap_or(false),
				topics: normalize_topics(file.bridge.topics),
			},
		}
	}
}

fn parse_env_bool(v: &str) -> Option<bool> {
	match v.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		_ => None,
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn apply_env_overrides(cfg: &mut ServerConfig, env: impl Fn(&str) -> Option<String>) {
	let var = |key: &str| non_empty(env(key));

	if let Some(v) = var("EVENTWIRE_WEBHOOK_BIND") {
		cfg.server.webhook_bind = Some(v);
		info!("server config: webhook_bind overridden by env");
	}

	if let Some(v) = var("EVENTWIRE_WEBHOOK_PATH") {
		cfg.server.webhook_path = normalize_path(&v);
		info!("server config: webhook_path overridden by env");
	}

	if let Some(v) = var("EVENTWIRE_METRICS_BIND") {
		cfg.server.metrics_bind = Some(v);
		info!("server config: metrics_bind overridden by env");
	}

	if let Some(v) = var("EVENTWIRE_WEBHOOK_SECRET") {
		cfg.webhook.secret = Some(SecretString::new(v));
		info!("webhook config: secret overridden by env");
	}

	if let Some(v) = var("EVENTWIRE_WEBHOOK_MAX_MESSAGE_AGE_SECS")
		&& let Ok(secs) = v.parse::<u64>()
		&& secs > 0
	{
		cfg.webhook.max_message_age = Duration::from_secs(secs);
		info!(secs, "webhook config: max_message_age overridden by env");
	}

	if let Some(v) = var("EVENTWIRE_WEBHOOK_MAX_BODY_BYTES")
		&& let Ok(bytes) = v.parse::<usize>()
		&& bytes > 0
	{
		cfg.webhook.max_body_bytes = bytes;
		info!(bytes, "webhook config: max_body_bytes overridden by env");
	}

	if let Some(v) = var("EVENTWIRE_TWITCH_CLIENT_ID") {
		cfg.twitch.client_id = Some(v);
		info!("twitch config: client_id overridden by env");
	}

	if let Some(v) = var("EVENTWIRE_TWITCH_USER_ACCESS_TOKEN") {
		cfg.twitch.user_access_token = Some(SecretString::new(v));
		info!("twitch config: user_access_token overridden by env");
	}

	if let Some(v) = var("EVENTWIRE_TWITCH_HELIX_BASE_URL") {
		cfg.twitch.helix_base_url = Some(v);
		info!("twitch config: helix_base_url overridden by env");
	}

	if let Some(v) = var("EVENTWIRE_TWITCH_EVENTSUB_WS_URL") {
		cfg.twitch.eventsub_ws_url = Some(v);
		info!("twitch config: eventsub_ws_url overridden by env");
	}

	if let Some(v) = var("EVENTWIRE_BRIDGE_ENABLED")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.bridge.enabled = enabled;
		info!(enabled, "bridge config: enabled overridden by env");
	}

	if let Some(v) = var("EVENTWIRE_BRIDGE_TOPICS") {
		cfg.bridge.topics = normalize_topics(v.split(',').map(str::to_string));
		info!(count = cfg.bridge.topics.len(), "bridge config: topics overridden by env");
	}

	if let Some(secret) = &cfg.webhook.secret {
		let len = secret.expose().len();
		if !(10..=100).contains(&len) {
			warn!(len, "webhook config: secret should be 10 to 100 characters");
		}
	}

	if cfg.bridge.enabled && (cfg.twitch.client_id.is_none() || cfg.twitch.user_access_token.is_none()) {
		warn!("bridge config: enabled without twitch client_id/user_access_token; subscribe calls will fail");
	}
}
