use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use eventwire_domain::RevocationReason;
use http_body_util::{BodyExt, Full};
use hyper::service::{Service, service_fn};
use hyper::{Method, Request, Response, StatusCode};
use parking_lot::Mutex;

use super::auth::{AuthLimits, check_freshness};
use super::*;
use crate::twitch::signature::sign;

const SECRET: &str = "s3cr3t-webhook-key";

fn subscription_json(status: &str) -> String {
	format!(
		r#"{{"id":"f1c2a387-161a-49f9-a165-0f21d7a4e1c4","status":"{status}","type":"channel.follow","version":"2","cost":1,"condition":{{"broadcaster_user_id":"12826"}},"transport":{{"method":"webhook","callback":"https://example.com/webhooks/callback"}},"created_at":"2019-11-16T10:11:12.634234626Z"}}"#
	)
}

fn verification_body() -> String {
	format!(
		r#"{{"challenge":"pogchamp-kappa-360noscope-vohiyo","subscription":{}}}"#,
		subscription_json("webhook_callback_verification_pending")
	)
}

fn notification_body() -> String {
	format!(
		r#"{{"subscription":{},"event":{{"user_id":"1337","user_login":"awesome_user","broadcaster_user_id":"12826"}}}}"#,
		subscription_json("enabled")
	)
}

fn revocation_body(status: &str) -> String {
	format!(r#"{{"subscription":{}}}"#, subscription_json(status))
}

fn ts(at: DateTime<Utc>) -> String {
	at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn request_with(
	secret: &str,
	message_id: &str,
	message_type: &str,
	timestamp: &str,
	body: &str,
) -> Request<Full<Bytes>> {
	let signature = sign(secret.as_bytes(), message_id, timestamp, body.as_bytes());
	Request::builder()
		.method(Method::POST)
		.uri("/eventsub")
		.header(headers::MESSAGE_ID, message_id)
		.header(headers::MESSAGE_TIMESTAMP, timestamp)
		.header(headers::MESSAGE_SIGNATURE, signature)
		.header(headers::MESSAGE_TYPE, message_type)
		.header("content-type", "application/json")
		.body(Full::new(Bytes::from(body.to_string())))
		.unwrap()
}

fn signed(message_id: &str, message_type: &str, body: &str) -> Request<Full<Bytes>> {
	request_with(SECRET, message_id, message_type, &ts(Utc::now()), body)
}

async fn body_text(resp: Response<Full<Bytes>>) -> String {
	let bytes = resp.into_body().collect().await.unwrap().to_bytes();
	String::from_utf8(bytes.to_vec()).unwrap()
}

fn endpoint(cfg: WebhookConfig) -> WebhookEndpoint {
	WebhookEndpoint::new(cfg)
}

fn config() -> WebhookConfig {
	WebhookConfig::new(SecretString::new(SECRET))
}

#[tokio::test]
async fn verification_echoes_challenge() {
	let ep = endpoint(config());
	let resp = ep.handle(signed("m-1", "webhook_callback_verification", &verification_body())).await;

	assert_eq!(resp.status(), StatusCode::OK);
	assert_eq!(
		resp.headers().get("content-type").unwrap().to_str().unwrap(),
		"text/plain; charset=utf-8"
	);
	assert_eq!(body_text(resp).await, "pogchamp-kappa-360noscope-vohiyo");
}

#[tokio::test]
async fn verification_predicate_can_reject() {
	let seen = Arc::new(Mutex::new(Vec::new()));
	let seen_cb = seen.clone();
	let ep = endpoint(config().on_verification(move |msg| {
		seen_cb.lock().push(msg.subscription.kind.clone());
		msg.subscription.kind == "channel.raid"
	}));

	let resp = ep.handle(signed("m-1", "webhook_callback_verification", &verification_body())).await;
	assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
	assert_eq!(seen.lock().as_slice(), ["channel.follow".to_string()]);
}

#[tokio::test]
async fn verification_without_challenge_is_malformed() {
	let ep = endpoint(config());
	let resp = ep.handle(signed("m-1", "webhook_callback_verification", &notification_body())).await;
	assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn notification_dispatches_raw_event() {
	let received = Arc::new(Mutex::new(Vec::<WebhookMessage>::new()));
	let received_cb = received.clone();
	let ep = endpoint(config().on_notification(move |msg| received_cb.lock().push(msg)));

	let resp = ep.handle(signed("m-42", "notification", &notification_body())).await;
	assert_eq!(resp.status(), StatusCode::NO_CONTENT);
	assert!(body_text(resp).await.is_empty());

	let received = received.lock();
	assert_eq!(received.len(), 1);
	let msg = &received[0];
	assert_eq!(msg.message_id, "m-42");
	assert_eq!(msg.message_type, MessageType::Notification);
	assert_eq!(msg.subscription.kind, "channel.follow");
	assert_eq!(
		&msg.event[..],
		br#"{"user_id":"1337","user_login":"awesome_user","broadcaster_user_id":"12826"}"#
	);
}

#[tokio::test]
async fn notification_without_handler_still_acknowledged() {
	let ep = endpoint(config());
	let resp = ep.handle(signed("m-1", "notification", &notification_body())).await;
	assert_eq!(resp.status(), StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn retried_delivery_is_acknowledged_once() {
	let count = Arc::new(AtomicUsize::new(0));
	let count_cb = count.clone();
	let ep = endpoint(config().on_notification(move |_| {
		count_cb.fetch_add(1, Ordering::SeqCst);
	}));

	for _ in 0..3 {
		let resp = ep.handle(signed("same-id", "notification", &notification_body())).await;
		assert_eq!(resp.status(), StatusCode::NO_CONTENT);
	}
	assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn dedup_can_be_disabled() {
	let count = Arc::new(AtomicUsize::new(0));
	let count_cb = count.clone();
	let ep = endpoint(config().dedup(None).on_notification(move |_| {
		count_cb.fetch_add(1, Ordering::SeqCst);
	}));

	for _ in 0..2 {
		ep.handle(signed("same-id", "notification", &notification_body())).await;
	}
	assert_eq!(count.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn revocation_dispatches_with_reason() {
	let reasons = Arc::new(Mutex::new(Vec::new()));
	let reasons_cb = reasons.clone();
	let ep = endpoint(config().on_revocation(move |msg| reasons_cb.lock().push(msg.revocation_reason())));

	let resp = ep.handle(signed("r-1", "revocation", &revocation_body("authorization_revoked"))).await;
	assert_eq!(resp.status(), StatusCode::NO_CONTENT);
	let resp = ep.handle(signed("r-2", "revocation", &revocation_body("user_removed"))).await;
	assert_eq!(resp.status(), StatusCode::NO_CONTENT);

	assert_eq!(
		reasons.lock().as_slice(),
		[
			RevocationReason::AuthorizationRevoked,
			RevocationReason::Other("user_removed".to_string())
		]
	);
}

#[tokio::test]
async fn wrong_secret_is_forbidden() {
	let called = Arc::new(AtomicUsize::new(0));
	let called_cb = called.clone();
	let ep = endpoint(config().on_notification(move |_| {
		called_cb.fetch_add(1, Ordering::SeqCst);
	}));

	let req = request_with("not-the-secret", "m-1", "notification", &ts(Utc::now()), &notification_body());
	let resp = ep.handle(req).await;
	assert_eq!(resp.status(), StatusCode::FORBIDDEN);
	assert_eq!(called.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn missing_signature_header_is_forbidden() {
	let ep = endpoint(config());
	let mut req = signed("m-1", "notification", &notification_body());
	req.headers_mut().remove(headers::MESSAGE_SIGNATURE);
	assert_eq!(ep.handle(req).await.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn tampered_body_is_forbidden() {
	let ep = endpoint(config());
	let timestamp = ts(Utc::now());
	let good = request_with(SECRET, "m-1", "notification", &timestamp, &notification_body());
	let (parts, _) = good.into_parts();
	let tampered = notification_body().replace("1337", "1338");
	let req = Request::from_parts(parts, Full::new(Bytes::from(tampered)));
	assert_eq!(ep.handle(req).await.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn stale_timestamp_is_rejected() {
	let ep = endpoint(config().max_message_age(Duration::from_secs(5 * 60)));
	let old = ts(Utc::now() - chrono::Duration::minutes(10));
	let resp = ep.handle(request_with(SECRET, "m-1", "notification", &old, &notification_body())).await;

	assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
	assert_eq!(body_text(resp).await, "message timestamp too old");
}

#[tokio::test]
async fn future_timestamp_is_rejected_with_distinct_text() {
	let ep = endpoint(config());
	let ahead = ts(Utc::now() + chrono::Duration::minutes(5));
	let resp = ep.handle(request_with(SECRET, "m-1", "notification", &ahead, &notification_body())).await;

	assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
	assert_eq!(body_text(resp).await, "message timestamp is in the future");
}

#[tokio::test]
async fn slightly_future_timestamp_is_tolerated() {
	let ep = endpoint(config());
	let ahead = ts(Utc::now() + chrono::Duration::seconds(20));
	let resp = ep.handle(request_with(SECRET, "m-1", "notification", &ahead, &notification_body())).await;
	assert_eq!(resp.status(), StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn malformed_timestamp_is_rejected() {
	let ep = endpoint(config());
	let resp = ep.handle(request_with(SECRET, "m-1", "notification", "not-a-time", &notification_body())).await;
	assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn oversized_body_rejected_before_signature_check() {
	let ep = endpoint(config().max_body_bytes(64));
	let body = "x".repeat(1024);

	// Unsigned: a signature failure would be 403, so 413 proves the size check ran first.
	let req = Request::builder()
		.method(Method::POST)
		.uri("/eventsub")
		.body(Full::new(Bytes::from(body)))
		.unwrap();
	assert_eq!(ep.handle(req).await.status(), StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn oversized_body_without_content_length_is_rejected() {
	let ep = endpoint(config().max_body_bytes(16));
	let mut req = signed("m-1", "notification", &notification_body());
	req.headers_mut().remove("content-length");
	assert_eq!(ep.handle(req).await.status(), StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn non_post_is_method_not_allowed() {
	let ep = endpoint(config());
	let mut req = signed("m-1", "notification", &notification_body());
	*req.method_mut() = Method::GET;
	assert_eq!(ep.handle(req).await.status(), StatusCode::METHOD_NOT_ALLOWED);
}

#[tokio::test]
async fn unknown_type_and_bad_json_are_bad_requests() {
	let ep = endpoint(config());
	let resp = ep.handle(signed("m-1", "something_else", &notification_body())).await;
	assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
	assert_eq!(body_text(resp).await, "unknown message type");

	let resp = ep.handle(signed("m-2", "notification", "{not json")).await;
	assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
	assert_eq!(body_text(resp).await, "malformed payload");
}

#[test]
fn freshness_window_edges() {
	let limits = AuthLimits {
		secret: SecretString::new(SECRET),
		max_message_age: Duration::from_secs(600),
		future_tolerance: Duration::from_secs(60),
		max_body_bytes: 1024,
	};
	let now = Utc::now();

	assert!(check_freshness(now, now, &limits).is_ok());
	assert!(check_freshness(now - chrono::Duration::seconds(600), now, &limits).is_ok());
	assert_eq!(
		check_freshness(now - chrono::Duration::seconds(601), now, &limits),
		Err(WebhookRejection::TimestampExpired)
	);
	assert!(check_freshness(now + chrono::Duration::seconds(60), now, &limits).is_ok());
	assert_eq!(
		check_freshness(now + chrono::Duration::seconds(61), now, &limits),
		Err(WebhookRejection::TimestampFuture)
	);
}

#[tokio::test]
async fn gate_forwards_verified_body_unchanged() {
	let inner = service_fn(|req: Request<Full<Bytes>>| async move {
		let id = req
			.headers()
			.get(headers::MESSAGE_ID)
			.and_then(|v| v.to_str().ok())
			.unwrap_or_default()
			.to_string();
		let body = req.into_body().collect().await.unwrap().to_bytes();
		let mut out = id.into_bytes();
		out.push(b'|');
		out.extend_from_slice(&body);
		Ok::<_, Infallible>(Response::new(Full::new(Bytes::from(out))))
	});
	let gate = SignatureGate::new(GateConfig::new(SecretString::new(SECRET)), inner);

	let body = notification_body();
	let resp = gate.call(signed("m-7", "notification", &body)).await.unwrap();
	assert_eq!(resp.status(), StatusCode::OK);
	assert_eq!(body_text(resp).await, format!("m-7|{body}"));

	let bad = request_with("wrong", "m-8", "notification", &ts(Utc::now()), &body);
	let resp = gate.call(bad).await.unwrap();
	assert_eq!(resp.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn server_routes_only_configured_path() {
	let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	let ep = Arc::new(endpoint(config()));
	let server = tokio::spawn(serve_webhook_listener(listener, "/eventsub".to_string(), ep));

	let client = reqwest::Client::new();
	let body = verification_body();
	let timestamp = ts(Utc::now());
	let signature = sign(SECRET.as_bytes(), "m-1", &timestamp, body.as_bytes());

	let resp = client
		.post(format!("http://{addr}/eventsub"))
		.header(headers::MESSAGE_ID, "m-1")
		.header(headers::MESSAGE_TIMESTAMP, &timestamp)
		.header(headers::MESSAGE_SIGNATURE, &signature)
		.header(headers::MESSAGE_TYPE, "webhook_callback_verification")
		.body(body.clone())
		.send()
		.await
		.unwrap();
	assert_eq!(resp.status().as_u16(), 200);
	assert_eq!(resp.text().await.unwrap(), "pogchamp-kappa-360noscope-vohiyo");

	let resp = client.post(format!("http://{addr}/other")).body(body).send().await.unwrap();
	assert_eq!(resp.status().as_u16(), 404);

	server.abort();
}
