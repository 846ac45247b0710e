#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::time::Duration;

use haven_domain::{Group, GroupId, Identity, UserId};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::server::groups::GroupRegistry;
use crate::server::http::{HealthState, HttpState, serve_http};
use crate::server::store::{MessageStore, StoreConfig};
use crate::util::time::unix_ms_now;

fn gid(id: &str) -> GroupId {
	GroupId::new(id.to_string()).expect("valid GroupId")
}

fn uid(id: &str) -> UserId {
	UserId::new(id.to_string()).expect("valid UserId")
}

fn test_state() -> HttpState {
	HttpState {
		health: HealthState::new(),
		store: MessageStore::new_in_memory(StoreConfig::default()),
		groups: GroupRegistry::new_in_memory(Duration::from_secs(1)),
	}
}

async fn start_server(state: HttpState) -> SocketAddr {
	let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
	let addr = listener.local_addr().expect("local addr");
	tokio::spawn(async move {
		let _ = serve_http(listener, state).await;
	});
	addr
}

async fn http_request(addr: SocketAddr, method: &str, path_and_query: &str) -> (u16, String) {
	let mut stream = TcpStream::connect(addr).await.expect("connect");
	let request = format!("{method} {path_and_query} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
	stream.write_all(request.as_bytes()).await.expect("write request");

	let mut raw = Vec::new();
	stream.read_to_end(&mut raw).await.expect("read response");
	let text = String::from_utf8_lossy(&raw).to_string();

	let status = text
		.split_whitespace()
		.nth(1)
		.and_then(|s| s.parse::<u16>().ok())
		.expect("status code in response");
	let body = text.split_once("\r\n\r\n").map(|(_, b)| b.to_string()).unwrap_or_default();
	(status, body)
}

async fn http_get(addr: SocketAddr, path_and_query: &str) -> (u16, String) {
	http_request(addr, "GET", path_and_query).await
}

async fn seed_group(state: &HttpState, id: &str, creator: &str, texts: &[&str]) {
	let group = Group {
		id: gid(id),
		name: format!("Group {id}"),
		slug: None,
		tags: Vec::new(),
		created_by: uid(creator),
		created_at: unix_ms_now(),
	};
	state.groups.create_group(group).await.expect("create group");

	let sender = Identity::new(uid(creator), "Alice");
	for text in texts {
		state.store.append(&gid(id), &sender, text).await.expect("append");
	}
}

#[tokio::test]
async fn healthz_responds_ok() {
	let addr = start_server(test_state()).await;

	let (status, body) = http_get(addr, "/healthz").await;
	assert_eq!(status, 200);
	assert_eq!(body, "ok");
}

#[tokio::test]
async fn readyz_flips_once_marked() {
	let state = test_state();
	let health = state.health.clone();
	let addr = start_server(state).await;

	let (status, body) = http_get(addr, "/readyz").await;
	assert_eq!(status, 503);
	assert_eq!(body, "not-ready");

	health.mark_ready();
	let (status, body) = http_get(addr, "/readyz").await;
	assert_eq!(status, 200);
	assert_eq!(body, "ready");
}

#[tokio::test]
async fn unknown_paths_404_and_non_get_405() {
	let addr = start_server(test_state()).await;

	let (status, _) = http_get(addr, "/nope").await;
	assert_eq!(status, 404);

	let (status, _) = http_request(addr, "POST", "/healthz").await;
	assert_eq!(status, 405);
}

#[tokio::test]
async fn history_requires_a_group_id() {
	let addr = start_server(test_state()).await;

	let (status, body) = http_get(addr, "/api/chat/history").await;
	assert_eq!(status, 400);

	let failure: serde_json::Value = serde_json::from_str(&body).expect("json body");
	assert_eq!(failure["success"], false);
	assert!(
		failure["message"].as_str().expect("message").contains("group_id"),
		"got: {failure}"
	);
}

#[tokio::test]
async fn history_for_unknown_groups_is_404() {
	let addr = start_server(test_state()).await;

	let (status, body) = http_get(addr, "/api/chat/history?group_id=missing").await;
	assert_eq!(status, 404);

	let failure: serde_json::Value = serde_json::from_str(&body).expect("json body");
	assert_eq!(failure["success"], false);
}

#[tokio::test]
async fn history_rejects_malformed_cursor_and_limit() {
	let state = test_state();
	seed_group(&state, "g1", "u1", &["m1"]).await;
	let addr = start_server(state).await;

	let (status, body) = http_get(addr, "/api/chat/history?group_id=g1&before=abc").await;
	assert_eq!(status, 400);
	assert!(body.contains("before"), "got: {body}");

	let (status, body) = http_get(addr, "/api/chat/history?group_id=g1&limit=abc").await;
	assert_eq!(status, 400);
	assert!(body.contains("limit"), "got: {body}");

	let (status, _) = http_get(addr, "/api/chat/history?group_id=g1&limit=0").await;
	assert_eq!(status, 400);
}

#[tokio::test]
async fn history_pages_newest_first_with_cursor() {
	let state = test_state();
	seed_group(&state, "g1", "u1", &["m1", "m2", "m3"]).await;
	let addr = start_server(state).await;

	let (status, body) = http_get(addr, "/api/chat/history?group_id=g1&limit=2").await;
	assert_eq!(status, 200);

	let page: serde_json::Value = serde_json::from_str(&body).expect("json body");
	assert_eq!(page["success"], true);
	assert_eq!(page["has_more"], true);
	let messages = page["messages"].as_array().expect("messages array");
	assert_eq!(messages.len(), 2);
	assert_eq!(messages[0]["message"], "m3");
	assert_eq!(messages[1]["message"], "m2");
	assert_eq!(messages[0]["group_id"], "g1");
	assert_eq!(messages[0]["user_id"], "u1");
	assert_eq!(messages[0]["username"], "Alice");
	assert!(messages[0]["created_at"].as_i64().expect("created_at") > 0);

	let cursor = messages[1]["id"].as_i64().expect("message id");
	let (status, body) = http_get(addr, &format!("/api/chat/history?group_id=g1&limit=2&before={cursor}")).await;
	assert_eq!(status, 200);

	let rest: serde_json::Value = serde_json::from_str(&body).expect("json body");
	assert_eq!(rest["has_more"], false);
	let messages = rest["messages"].as_array().expect("messages array");
	assert_eq!(messages.len(), 1);
	assert_eq!(messages[0]["message"], "m1");
}

#[tokio::test]
async fn history_of_an_empty_group_is_an_empty_page() {
	let state = test_state();
	seed_group(&state, "g1", "u1", &[]).await;
	let addr = start_server(state).await;

	let (status, body) = http_get(addr, "/api/chat/history?group_id=g1").await;
	assert_eq!(status, 200);

	let page: serde_json::Value = serde_json::from_str(&body).expect("json body");
	assert_eq!(page["success"], true);
	assert_eq!(page["has_more"], false);
	assert_eq!(page["messages"].as_array().expect("messages array").len(), 0);
}
