#![forbid(unsafe_code)]

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Body;
use hyper::service::Service;
use hyper::{Request, Response};
use tracing::debug;

use super::WebhookConfig;
use super::auth::{AuthLimits, authenticate};
use crate::SecretString;

/// Limits applied by [`SignatureGate`].
#[derive(Debug, Clone)]
pub struct GateConfig {
	pub secret: SecretString,
	pub max_message_age: Duration,
	pub max_body_bytes: usize,
}

impl GateConfig {
	pub fn new(secret: SecretString) -> Self {
		Self {
			secret,
			max_message_age: WebhookConfig::DEFAULT_MAX_MESSAGE_AGE,
			max_body_bytes: WebhookConfig::DEFAULT_MAX_BODY_BYTES,
		}
	}
}

impl From<&WebhookConfig> for GateConfig {
	fn from(cfg: &WebhookConfig) -> Self {
		Self {
			secret: cfg.secret.clone(),
			max_message_age: cfg.max_message_age,
			max_body_bytes: cfg.max_body_bytes,
		}
	}
}

/// Wraps a service so that only signed, fresh EventSub requests reach it.
///
/// The inner service receives the request with its original headers and the
/// exact body bytes that were verified. Rejected requests never reach it.
#[derive(Clone)]
pub struct SignatureGate<S> {
	inner: S,
	limits: Arc<AuthLimits>,
}

impl<S> SignatureGate<S> {
	pub fn new(cfg: GateConfig, inner: S) -> Self {
		Self {
			inner,
			limits: Arc::new(AuthLimits {
				secret: cfg.secret,
				max_message_age: cfg.max_message_age,
				future_tolerance: WebhookConfig::FUTURE_TOLERANCE,
				max_body_bytes: cfg.max_body_bytes,
			}),
		}
	}

	pub fn inner(&self) -> &S {
		&self.inner
	}
}

impl<S, B> Service<Request<B>> for SignatureGate<S>
where
	S: Service<Request<Full<Bytes>>, Response = Response<Full<Bytes>>> + Clone + Send + 'static,
	S::Future: Send + 'static,
	S::Error: Send + 'static,
	B: Body<Data = Bytes> + Send + 'static,
	B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
	type Response = Response<Full<Bytes>>;
	type Error = S::Error;
	type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

	fn call(&self, req: Request<B>) -> Self::Future {
		let inner = self.inner.clone();
		let limits = self.limits.clone();

		Box::pin(async move {
			match authenticate(&limits, req).await {
				Ok(authed) => {
					let req = Request::from_parts(authed.parts, Full::new(authed.body));
					inner.call(req).await
				}
				Err(rejection) => {
					metrics::counter!(rejection.metric()).increment(1);
					debug!(reason = %rejection, "signature gate rejected request");
					Ok(rejection.into_response())
				}
			}
		})
	}
}
