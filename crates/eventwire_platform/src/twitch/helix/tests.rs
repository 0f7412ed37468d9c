use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::Bytes;
use eventwire_domain::{Condition, SubscriptionRequest, Transport};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use tokio::net::TcpListener;

use super::*;
use crate::{SecretString, StaticTokenProvider};

#[derive(Debug, Clone)]
struct Seen {
	method: Method,
	path_and_query: String,
	authorization: String,
	client_id: String,
	body: String,
}

#[derive(Default)]
struct FakeHelix {
	seen: Mutex<Vec<Seen>>,
	flaky_posts: AtomicUsize,
}

fn json(status: StatusCode, body: String) -> Response<Full<Bytes>> {
	let mut resp = Response::new(Full::new(Bytes::from(body)));
	*resp.status_mut() = status;
	resp
}

fn subscription(id: &str, kind: &str, session: &str) -> String {
	format!(
		r#"{{"id":"{id}","status":"enabled","type":"{kind}","version":"1","condition":{{"broadcaster_user_id":"1"}},"transport":{{"method":"websocket","session_id":"{session}","connected_at":"2023-07-19T14:56:51Z"}},"created_at":"2023-07-19T14:56:52Z","cost":0}}"#
	)
}

async fn handle(req: Request<Incoming>, fake: Arc<FakeHelix>) -> Result<Response<Full<Bytes>>, Infallible> {
	let (parts, body) = req.into_parts();
	let body = body.collect().await.map(|c| c.to_bytes()).unwrap_or_default();
	let body = String::from_utf8_lossy(&body).to_string();
	let header = |name: &str| {
		parts
			.headers
			.get(name)
			.and_then(|v| v.to_str().ok())
			.unwrap_or_default()
			.to_string()
	};
	let path_and_query = parts.uri.path_and_query().map(|p| p.as_str().to_string()).unwrap_or_default();

	fake.seen.lock().push(Seen {
		method: parts.method.clone(),
		path_and_query: path_and_query.clone(),
		authorization: header("authorization"),
		client_id: header("client-id"),
		body: body.clone(),
	});

	let resp = match (parts.method, path_and_query.as_str()) {
		(Method::POST, "/helix/eventsub/subscriptions") => {
			let req: serde_json::Value = serde_json::from_str(&body).unwrap_or_default();
			let kind = req["type"].as_str().unwrap_or_default().to_string();
			let session = req["transport"]["session_id"].as_str().unwrap_or_default().to_string();

			if kind == "flaky.type" && fake.flaky_posts.fetch_add(1, Ordering::SeqCst) == 0 {
				json(StatusCode::SERVICE_UNAVAILABLE, "{}".to_string())
			} else if kind == "taken.type" {
				json(StatusCode::CONFLICT, r#"{"message":"subscription already exists"}"#.to_string())
			} else {
				json(
					StatusCode::ACCEPTED,
					format!(
						r#"{{"data":[{}],"total":1,"total_cost":0,"max_total_cost":10}}"#,
						subscription("sub-new", &kind, &session)
					),
				)
			}
		}
		(Method::DELETE, "/helix/eventsub/subscriptions?id=sub-1") => json(StatusCode::NO_CONTENT, String::new()),
		(Method::DELETE, _) => json(StatusCode::NOT_FOUND, r#"{"message":"not found"}"#.to_string()),
		(Method::GET, "/helix/eventsub/subscriptions?type=channel.raid") => json(
			StatusCode::OK,
			format!(
				r#"{{"data":[{}],"total":2,"pagination":{{"cursor":"page-2"}}}}"#,
				subscription("sub-a", "channel.raid", "s")
			),
		),
		(Method::GET, "/helix/eventsub/subscriptions?type=channel.raid&after=page-2") => json(
			StatusCode::OK,
			format!(
				r#"{{"data":[{}],"total":2,"pagination":{{}}}}"#,
				subscription("sub-b", "channel.raid", "s")
			),
		),
		_ => json(StatusCode::BAD_REQUEST, "{}".to_string()),
	};
	Ok(resp)
}

async fn spawn_fake() -> (SocketAddr, Arc<FakeHelix>) {
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	let fake = Arc::new(FakeHelix::default());
	let state = fake.clone();

	tokio::spawn(async move {
		loop {
			let Ok((stream, _)) = listener.accept().await else {
				return;
			};
			let state = state.clone();
			tokio::spawn(async move {
				let service = service_fn(move |req| handle(req, state.clone()));
				let _ = http1::Builder::new().serve_connection(TokioIo::new(stream), service).await;
			});
		}
	});

	(addr, fake)
}

fn client(addr: SocketAddr) -> HelixSubscriptionClient {
	let cfg = HelixConfig {
		base_url: format!("http://{addr}"),
		client_id: "client-abc".to_string(),
	};
	let tokens = Arc::new(StaticTokenProvider::new(SecretString::new("tok-123")));
	HelixSubscriptionClient::new(cfg, tokens).unwrap()
}

fn request(kind: &str) -> SubscriptionRequest {
	let mut condition = Condition::new();
	condition.insert("broadcaster_user_id".to_string(), "1".to_string());
	SubscriptionRequest::new(kind, "1", condition)
}

#[tokio::test]
async fn create_posts_request_and_decodes_subscription() {
	let (addr, fake) = spawn_fake().await;
	let helix = client(addr);

	let sub = helix
		.create_subscription(&request("channel.cheer"), Transport::websocket("session-9"))
		.await
		.unwrap();
	assert_eq!(sub.id, "sub-new");
	assert_eq!(sub.kind, "channel.cheer");
	assert_eq!(sub.transport.session_id(), Some("session-9"));

	let seen = fake.seen.lock().clone();
	assert_eq!(seen.len(), 1);
	assert_eq!(seen[0].authorization, "Bearer tok-123");
	assert_eq!(seen[0].client_id, "client-abc");

	let body: serde_json::Value = serde_json::from_str(&seen[0].body).unwrap();
	assert_eq!(body["type"], "channel.cheer");
	assert_eq!(body["version"], "1");
	assert_eq!(body["condition"]["broadcaster_user_id"], "1");
	assert_eq!(body["transport"]["method"], "websocket");
	assert_eq!(body["transport"]["session_id"], "session-9");
}

#[tokio::test]
async fn create_retries_once_on_server_error() {
	let (addr, fake) = spawn_fake().await;
	let helix = client(addr);

	let sub = helix
		.create_subscription(&request("flaky.type"), Transport::websocket("s"))
		.await
		.unwrap();
	assert_eq!(sub.kind, "flaky.type");
	assert_eq!(fake.seen.lock().len(), 2);
}

#[tokio::test]
async fn create_conflict_is_an_error() {
	let (addr, _fake) = spawn_fake().await;
	let err = client(addr)
		.create_subscription(&request("taken.type"), Transport::websocket("s"))
		.await
		.unwrap_err();
	assert!(format!("{err:#}").contains("conflict"));
}

#[tokio::test]
async fn delete_maps_status() {
	let (addr, fake) = spawn_fake().await;
	let helix = client(addr);

	helix.delete_subscription("sub-1").await.unwrap();
	assert!(helix.delete_subscription("sub-unknown").await.is_err());

	let seen = fake.seen.lock().clone();
	assert_eq!(seen[0].method, Method::DELETE);
	assert_eq!(seen[0].path_and_query, "/helix/eventsub/subscriptions?id=sub-1");
}

#[tokio::test]
async fn list_follows_pagination() {
	let (addr, _fake) = spawn_fake().await;
	let subs = client(addr).list_subscriptions(Some("channel.raid")).await.unwrap();
	let ids: Vec<_> = subs.iter().map(|s| s.id.as_str()).collect();
	assert_eq!(ids, ["sub-a", "sub-b"]);
}

#[tokio::test]
async fn missing_token_fails_before_sending() {
	let (addr, fake) = spawn_fake().await;
	let cfg = HelixConfig {
		base_url: format!("http://{addr}"),
		client_id: "client-abc".to_string(),
	};
	let helix = HelixSubscriptionClient::new(cfg, Arc::new(StaticTokenProvider::new(SecretString::default()))).unwrap();

	assert!(helix.delete_subscription("sub-1").await.is_err());
	assert!(fake.seen.lock().is_empty());
}

fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
	let mut map = HeaderMap::new();
	for (name, value) in pairs {
		map.insert(*name, value.parse().unwrap());
	}
	map
}

#[test]
fn rate_limit_wait_prefers_retry_after() {
	let now = 1_700_000_000;
	let h = headers(&[("retry-after", "3"), ("ratelimit-reset", "1700000020")]);
	assert_eq!(retry_wait(StatusCode::TOO_MANY_REQUESTS, &h, now), Some(Duration::from_secs(3)));

	let h = headers(&[("ratelimit-reset", "1700000005")]);
	assert_eq!(retry_wait(StatusCode::TOO_MANY_REQUESTS, &h, now), Some(Duration::from_secs(5)));

	let h = headers(&[("ratelimit-reset", "1699999990")]);
	assert_eq!(retry_wait(StatusCode::TOO_MANY_REQUESTS, &h, now), Some(Duration::ZERO));
}

#[test]
fn rate_limit_without_usable_wait_is_not_retried() {
	let now = 1_700_000_000;
	assert_eq!(retry_wait(StatusCode::TOO_MANY_REQUESTS, &HeaderMap::new(), now), None);
	assert_eq!(retry_wait(StatusCode::TOO_MANY_REQUESTS, &headers(&[("retry-after", "soon")]), now), None);
	assert_eq!(retry_wait(StatusCode::TOO_MANY_REQUESTS, &headers(&[("retry-after", "3600")]), now), None);
}

#[test]
fn server_errors_back_off_briefly() {
	let none = HeaderMap::new();
	assert_eq!(retry_wait(StatusCode::BAD_GATEWAY, &none, 0), Some(SERVER_ERROR_BACKOFF));
	assert_eq!(retry_wait(StatusCode::CONFLICT, &none, 0), None);
	assert_eq!(retry_wait(StatusCode::OK, &none, 0), None);
}
