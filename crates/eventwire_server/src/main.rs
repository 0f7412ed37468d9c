#![forbid(unsafe_code)]

mod config;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use eventwire_platform::twitch::{
	BridgeError, HelixConfig, HelixSubscriptionClient, SessionConfig, SubscriptionSession, WebhookEndpoint,
	WebhookMessage, serve_webhook,
};
use eventwire_platform::{SecretString, StaticTokenProvider};
use opentelemetry_sdk::trace::SdkTracerProvider;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::ServerConfig;

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: eventwire_server [--config path]\n\
\n\
Options:\n\
\t--config  Config file (default: ~/.eventwire/config.toml)\n\
\t--help    Show this help\n\
"
	);
	std::process::exit(2)
}

fn parse_args() -> Option<PathBuf> {
	let mut config_path = None;

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--config" | "-c" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--config must be non-empty");
					usage_and_exit();
				}
				config_path = Some(PathBuf::from(v));
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	config_path
}

fn init_rustls_crypto_provider() {
	let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

const DEFAULT_LOG_FILTER: &str = "info,eventwire_server=debug,eventwire_platform=debug";

fn otlp_endpoint() -> Option<String> {
	std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty())
}

/// Batch OTLP span exporter, also registered as the global tracer provider.
fn otlp_provider(endpoint: &str) -> anyhow::Result<SdkTracerProvider> {
	use opentelemetry_otlp::WithExportConfig;

	let exporter = opentelemetry_otlp::SpanExporter::builder()
		.with_tonic()
		.with_endpoint(endpoint)
		.build()
		.context("build otlp span exporter")?;
	let provider = SdkTracerProvider::builder().with_batch_exporter(exporter).build();
	opentelemetry::global::set_tracer_provider(provider.clone());
	Ok(provider)
}

fn init_tracing() {
	use opentelemetry::trace::TracerProvider as _;

	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
	let endpoint = otlp_endpoint();
	let provider = endpoint.as_deref().map(otlp_provider);
	let otel = match &provider {
		Some(Ok(p)) => Some(tracing_opentelemetry::layer().with_tracer(p.tracer(env!("CARGO_PKG_NAME")))),
		_ => None,
	};

	tracing_subscriber::registry()
		.with(filter)
		.with(tracing_subscriber::fmt::layer().with_target(false))
		.with(otel)
		.init();

	match (endpoint, provider) {
		(Some(endpoint), Some(Ok(_))) => info!(%endpoint, "otlp tracing enabled"),
		(_, Some(Err(e))) => warn!(error = %format!("{e:#}"), "otlp tracing disabled"),
		_ => {}
	}
}

/// Start the Prometheus listener and describe the counters this binary emits.
fn init_metrics(bind: &str) -> anyhow::Result<SocketAddr> {
	let addr: SocketAddr = bind
		.parse()
		.with_context(|| format!("invalid metrics bind address {bind} (expected host:port)"))?;
	metrics_exporter_prometheus::PrometheusBuilder::new()
		.with_http_listener(addr)
		.install()
		.context("install prometheus exporter")?;

	metrics::describe_counter!("eventwire_webhook_requests_total", "Webhook requests received");
	metrics::describe_counter!("eventwire_webhook_notifications_total", "Webhook notifications accepted");
	metrics::describe_counter!("eventwire_webhook_revocations_total", "Webhook revocations accepted");
	metrics::describe_counter!("eventwire_bridge_notifications_total", "Bridge notifications routed to a topic");
	metrics::describe_counter!("eventwire_webhook_duplicate_total", "Webhook replays acknowledged without dispatch");
	metrics::describe_counter!("eventwire_bridge_unknown_subscription_total", "Bridge notifications for untracked subscriptions");
	metrics::describe_counter!("eventwire_bridge_revocations_total", "Bridge subscriptions revoked");
	metrics::describe_counter!("eventwire_bridge_reconnects_total", "Bridge session migrations");
	metrics::describe_counter!("eventwire_helix_retries_total", "Helix requests retried");
	metrics::describe_counter!("eventwire_server_events_total", "Events logged by the server, by source");
	Ok(addr)
}

fn log_webhook_message(msg: &WebhookMessage) {
	metrics::counter!("eventwire_server_events_total", "source" => "webhook").increment(1);
	info!(
		message_id = %msg.message_id,
		subscription_id = %msg.subscription.id,
		subscription_type = %msg.subscription.kind,
		event_bytes = msg.event.len(),
		"webhook notification"
	);
}

/// Spawn the webhook listener when a bind address and a secret are configured.
fn start_webhook(cfg: &ServerConfig) -> anyhow::Result<Option<JoinHandle<()>>> {
	let Some(bind) = cfg.server.webhook_bind.as_deref() else {
		return Ok(None);
	};
	let addr: SocketAddr = bind
		.parse()
		.with_context(|| format!("invalid webhook bind address {bind} (expected host:port)"))?;

	let Some(webhook_cfg) = cfg.webhook.to_webhook_config() else {
		warn!(%addr, "webhook bind configured without webhook.secret; listener disabled");
		return Ok(None);
	};

	let webhook_cfg = webhook_cfg
		.on_notification(|msg| log_webhook_message(&msg))
		.on_revocation(|msg| {
			warn!(
				subscription_id = %msg.subscription.id,
				subscription_type = %msg.subscription.kind,
				reason = %msg.revocation_reason(),
				"webhook subscription revoked"
			);
		});

	let endpoint = Arc::new(WebhookEndpoint::new(webhook_cfg));
	let path = cfg.server.webhook_path.clone();
	Ok(Some(tokio::spawn(async move {
		if let Err(e) = serve_webhook(addr, path, endpoint).await {
			warn!(error = %format!("{e:#}"), "webhook listener exited with error");
		}
	})))
}

/// Connect the legacy-topic bridge and listen to the configured topics.
async fn start_bridge(cfg: &ServerConfig) -> anyhow::Result<Option<SubscriptionSession>> {
	if !cfg.bridge.enabled {
		return Ok(None);
	}

	let mut helix_cfg = HelixConfig::new(cfg.twitch.client_id.clone().unwrap_or_default());
	if let Some(base_url) = cfg.twitch.helix_base_url.clone() {
		helix_cfg.base_url = base_url;
	}
	let token = cfg
		.twitch
		.user_access_token
		.clone()
		.unwrap_or_else(|| SecretString::new(String::new()));
	let helix = HelixSubscriptionClient::new(helix_cfg, Arc::new(StaticTokenProvider::new(token)))?;

	let mut session_cfg = SessionConfig::new()
		.on_message(|topic, event| {
			metrics::counter!("eventwire_server_events_total", "source" => "bridge").increment(1);
			info!(topic, event_bytes = event.len(), "bridge message");
		})
		.on_error(|_session, err| match err {
			BridgeError::SubscriptionRevoked { .. } | BridgeError::ReconnectFailed { .. } => {
				warn!(error = %err, "bridge error");
			}
			BridgeError::ConnectionLost(_) => {
				warn!(error = %err, "bridge connection lost; configured topics are no longer served");
			}
			other => debug!(error = %other, "bridge error"),
		})
		.on_connect(|session| info!(session_id = %session.session_id(), "bridge connected"))
		.on_reconnect(|session| info!(session_id = %session.session_id(), "bridge migrated to new session"));
	if let Some(url) = cfg.twitch.eventsub_ws_url.clone() {
		session_cfg = session_cfg.ws_url(url);
	}

	let session = SubscriptionSession::new(session_cfg, Arc::new(helix));
	session.connect().await.context("connect eventsub bridge")?;

	for topic in &cfg.bridge.topics {
		if let Err(e) = session.listen(topic).await {
			warn!(topic = %topic, error = %e, "bridge listen failed");
		}
	}
	info!(topics = ?session.topics(), "bridge ready");

	Ok(Some(session))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let config_path = parse_args();

	init_rustls_crypto_provider();
	init_tracing();

	let config_path = match config_path {
		Some(p) => p,
		None => crate::config::default_config_path()?,
	};
	let server_cfg = crate::config::load_server_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");

	if let Some(bind) = server_cfg.server.metrics_bind.as_deref() {
		match init_metrics(bind) {
			Ok(addr) => info!(%addr, "metrics exporter listening"),
			Err(e) => warn!(error = %format!("{e:#}"), "metrics exporter disabled"),
		}
	}

	let webhook = start_webhook(&server_cfg)?;
	let bridge = start_bridge(&server_cfg).await?;

	if webhook.is_none() && bridge.is_none() {
		warn!("neither webhook listener nor bridge configured; exiting");
		return Ok(());
	}

	tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
	info!("shutting down");

	if let Some(session) = bridge {
		for topic in session.topics() {
			if let Err(e) = session.unlisten(&topic).await {
				warn!(topic = %topic, error = %e, "bridge unlisten failed");
			}
		}
		session.close().await?;
	}
	if let Some(handle) = webhook {
		handle.abort();
	}

	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn metrics_bind_must_be_a_socket_address() {
		let err = init_metrics("localhost").unwrap_err();
		assert!(format!("{err:#}").contains("invalid metrics bind address localhost"));
	}
}
