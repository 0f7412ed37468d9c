#![forbid(unsafe_code)]

use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::Body;
use hyper::header::{CONTENT_LENGTH, CONTENT_TYPE, HeaderMap, HeaderValue};
use hyper::http::request::Parts;
use hyper::{Method, Request, Response, StatusCode};
use thiserror::Error;
use tracing::debug;

use super::super::eventsub::parse_message_timestamp;
use super::super::signature;
use super::headers;
use crate::SecretString;

/// Why an inbound webhook request was refused. Rendered as an HTTP response.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WebhookRejection {
	#[error("method not allowed")]
	MethodNotAllowed,
	#[error("request body too large")]
	BodyTooLarge,
	#[error("failed to read request body")]
	BodyRead,
	#[error("missing signature headers")]
	MissingHeaders,
	#[error("invalid signature")]
	SignatureInvalid,
	#[error("invalid message timestamp")]
	TimestampMalformed,
	#[error("message timestamp too old")]
	TimestampExpired,
	#[error("message timestamp is in the future")]
	TimestampFuture,
	#[error("malformed payload")]
	Malformed,
	#[error("unknown message type")]
	UnknownType,
	#[error("verification rejected")]
	VerificationRejected,
}

impl WebhookRejection {
	pub fn status(&self) -> StatusCode {
		match self {
			Self::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
			Self::BodyTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
			Self::MissingHeaders | Self::SignatureInvalid => StatusCode::FORBIDDEN,
			Self::BodyRead
			| Self::TimestampMalformed
			| Self::TimestampExpired
			| Self::TimestampFuture
			| Self::Malformed
			| Self::UnknownType
			| Self::VerificationRejected => StatusCode::BAD_REQUEST,
		}
	}

	pub(crate) fn metric(&self) -> &'static str {
		match self {
			Self::BodyTooLarge => "eventwire_webhook_body_too_large_total",
			Self::MissingHeaders | Self::SignatureInvalid => "eventwire_webhook_signature_invalid_total",
			Self::TimestampMalformed | Self::TimestampExpired | Self::TimestampFuture => {
				"eventwire_webhook_timestamp_rejected_total"
			}
			_ => "eventwire_webhook_parse_errors_total",
		}
	}

	pub fn into_response(self) -> Response<Full<Bytes>> {
		text_response(self.status(), self.to_string())
	}
}

pub(crate) fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
	let mut resp = Response::new(Full::new(body.into()));
	*resp.status_mut() = status;
	resp.headers_mut()
		.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
	resp
}

pub(crate) fn empty_response(status: StatusCode) -> Response<Full<Bytes>> {
	let mut resp = Response::new(Full::new(Bytes::new()));
	*resp.status_mut() = status;
	resp
}

/// Authentication limits shared by the endpoint and the gate.
#[derive(Debug, Clone)]
pub(crate) struct AuthLimits {
	pub(crate) secret: SecretString,
	pub(crate) max_message_age: Duration,
	pub(crate) future_tolerance: Duration,
	pub(crate) max_body_bytes: usize,
}

/// A request that passed the body limit, signature and freshness checks.
#[derive(Debug)]
pub(crate) struct Authenticated {
	pub(crate) parts: Parts,
	pub(crate) body: Bytes,
	pub(crate) message_id: String,
	pub(crate) message_type: Option<String>,
	pub(crate) timestamp: DateTime<Utc>,
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
	headers
		.get(name)
		.and_then(|v| v.to_str().ok())
		.map(str::trim)
		.filter(|v| !v.is_empty())
}

pub(crate) async fn authenticate<B>(limits: &AuthLimits, req: Request<B>) -> Result<Authenticated, WebhookRejection>
where
	B: Body<Data = Bytes>,
	B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
	let (parts, body) = req.into_parts();

	if parts.method != Method::POST {
		return Err(WebhookRejection::MethodNotAllowed);
	}

	let declared_len = header(&parts.headers, CONTENT_LENGTH.as_str()).and_then(|v| v.parse::<u64>().ok());
	if declared_len.is_some_and(|len| len > limits.max_body_bytes as u64) {
		return Err(WebhookRejection::BodyTooLarge);
	}

	let body = match Limited::new(body, limits.max_body_bytes).collect().await {
		Ok(collected) => collected.to_bytes(),
		Err(err) if err.downcast_ref::<LengthLimitError>().is_some() => {
			return Err(WebhookRejection::BodyTooLarge);
		}
		Err(err) => {
			debug!(error = %err, "webhook body read failed");
			return Err(WebhookRejection::BodyRead);
		}
	};

	let (Some(message_id), Some(timestamp_raw), Some(sig)) = (
		header(&parts.headers, headers::MESSAGE_ID),
		header(&parts.headers, headers::MESSAGE_TIMESTAMP),
		header(&parts.headers, headers::MESSAGE_SIGNATURE),
	) else {
		return Err(WebhookRejection::MissingHeaders);
	};

	if !signature::verify(limits.secret.expose().as_bytes(), message_id, timestamp_raw, &body, sig) {
		return Err(WebhookRejection::SignatureInvalid);
	}

	let timestamp = parse_message_timestamp(timestamp_raw).map_err(|_| WebhookRejection::TimestampMalformed)?;
	check_freshness(timestamp, Utc::now(), limits)?;

	let message_id = message_id.to_string();
	let message_type = header(&parts.headers, headers::MESSAGE_TYPE).map(str::to_string);
	Ok(Authenticated {
		parts,
		body,
		message_id,
		message_type,
		timestamp,
	})
}

pub(crate) fn check_freshness(
	timestamp: DateTime<Utc>,
	now: DateTime<Utc>,
	limits: &AuthLimits,
) -> Result<(), WebhookRejection> {
	match (now - timestamp).to_std() {
		Ok(age) if age > limits.max_message_age => Err(WebhookRejection::TimestampExpired),
		Ok(_) => Ok(()),
		// Negative age: the timestamp is ahead of our clock.
		Err(_) => match (timestamp - now).to_std() {
			Ok(ahead) if ahead > limits.future_tolerance => Err(WebhookRejection::TimestampFuture),
			_ => Ok(()),
		},
	}
}
