#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::{info, warn};

use super::WebhookEndpoint;
use super::auth::empty_response;

/// Bind `bind` and serve the endpoint on `path` until the listener fails.
pub async fn serve_webhook(bind: SocketAddr, path: String, endpoint: Arc<WebhookEndpoint>) -> anyhow::Result<()> {
	let listener = TcpListener::bind(bind)
		.await
		.with_context(|| format!("bind webhook listener on {bind}"))?;
	serve_webhook_listener(listener, path, endpoint).await
}

/// Serve on an already-bound listener.
pub async fn serve_webhook_listener(
	listener: TcpListener,
	path: String,
	endpoint: Arc<WebhookEndpoint>,
) -> anyhow::Result<()> {
	let path: Arc<str> = Arc::from(path);
	info!(addr = ?listener.local_addr().ok(), path = %path, "eventsub webhook listening");

	loop {
		let (stream, _addr) = listener.accept().await.context("accept webhook connection")?;
		let io = TokioIo::new(stream);
		let endpoint = endpoint.clone();
		let path = path.clone();
		tokio::spawn(async move {
			let service = service_fn(move |req| route(req, endpoint.clone(), path.clone()));
			if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
				warn!(error = %err, "webhook connection error");
			}
		});
	}
}

async fn route(
	req: Request<Incoming>,
	endpoint: Arc<WebhookEndpoint>,
	path: Arc<str>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
	if req.uri().path() != &*path {
		return Ok(empty_response(StatusCode::NOT_FOUND));
	}
	Ok(endpoint.handle(req).await)
}
