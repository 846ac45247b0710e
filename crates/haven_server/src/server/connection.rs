#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use haven_domain::{ChatError, ConnectionId, GroupId, Identity};
use haven_protocol::{ClientFrame, ServerFrame, decode_client_frame, encode_server_frame};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::{WebSocketStream, accept_hdr_async};
use tracing::{debug, info, warn};
use tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tungstenite::http::StatusCode;
use tungstenite::protocol::Message;

use crate::server::auth::AuthResolver;
use crate::server::groups::GroupRegistry;
use crate::server::hub::GroupHub;
use crate::server::registry::ConnectionRegistry;
use crate::server::store::MessageStore;

/// WebSocket endpoint path clients must request.
pub const WS_CHAT_PATH: &str = "/ws/chat";

/// Per-connection server settings.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
	pub max_frame_bytes: usize,

	/// Outbound queue depth; fan-out drops frames once it is full.
	pub outbound_queue_capacity: usize,

	/// Close the connection after this long without an inbound frame.
	pub idle_timeout: Duration,

	pub message_rate_limit_burst: u32,
	pub message_rate_limit_per_minute: u32,
}

impl Default for ConnectionSettings {
	fn default() -> Self {
		Self {
			max_frame_bytes: haven_protocol::DEFAULT_MAX_FRAME_BYTES,
			outbound_queue_capacity: 256,
			idle_timeout: Duration::from_secs(60),
			message_rate_limit_burst: 20,
			message_rate_limit_per_minute: 600,
		}
	}
}

#[derive(Debug, Clone)]
struct TokenBucket {
	capacity: f64,
	tokens: f64,
	refill_per_sec: f64,
	last: Instant,
}

impl TokenBucket {
	fn new(capacity: u32, refill_per_minute: u32) -> Option<Self> {
		if capacity == 0 || refill_per_minute == 0 {
			return None;
		}
		Some(Self {
			capacity: capacity as f64,
			tokens: capacity as f64,
			refill_per_sec: refill_per_minute as f64 / 60.0,
			last: Instant::now(),
		})
	}

	fn allow(&mut self) -> bool {
		let now = Instant::now();
		let elapsed = now.duration_since(self.last).as_secs_f64();
		if elapsed > 0.0 {
			self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
			self.last = now;
		}
		if self.tokens >= 1.0 {
			self.tokens -= 1.0;
			true
		} else {
			false
		}
	}
}

fn token_from_query(query: &str) -> Option<String> {
	query.split('&').find_map(|pair| {
		let (key, value) = pair.split_once('=')?;
		(key == "token").then(|| value.to_string())
	})
}

/// Queues a frame on the connection's outbound channel without blocking.
///
/// A full queue means the client is already drowning; locally generated
/// frames are dropped the same way fan-out frames are.
fn queue_frame(tx: &mpsc::Sender<ServerFrame>, frame: ServerFrame) {
	match tx.try_send(frame) {
		Ok(()) => {}
		Err(mpsc::error::TrySendError::Full(_)) => {
			metrics::counter!("haven_server_control_frames_dropped_total").increment(1);
		}
		Err(mpsc::error::TrySendError::Closed(_)) => {}
	}
}

async fn reject_with_error(ws: &mut WebSocketStream<TcpStream>, message: &str) {
	if let Ok(text) = encode_server_frame(&ServerFrame::error(message)) {
		let _ = ws.send(Message::Text(text.into())).await;
	}
	let _ = ws.close(None).await;
}

/// Serves one WebSocket session end to end: handshake on `/ws/chat`,
/// token auth, registration, frame dispatch, and cleanup.
///
/// Auth and registration failures are terminal: the client gets one error
/// frame and the socket closes. Everything after registration reports
/// per-frame errors and keeps the session alive unless the error is fatal.
#[allow(clippy::too_many_arguments)]
pub async fn handle_connection(
	conn_id: ConnectionId,
	stream: TcpStream,
	peer: SocketAddr,
	registry: ConnectionRegistry,
	hub: GroupHub,
	store: MessageStore,
	groups: GroupRegistry,
	auth: Arc<dyn AuthResolver>,
	settings: ConnectionSettings,
) -> anyhow::Result<()> {
	struct ConnectionGaugeGuard;
	impl Drop for ConnectionGaugeGuard {
		fn drop(&mut self) {
			metrics::gauge!("haven_server_active_connections").decrement(1.0);
		}
	}

	metrics::gauge!("haven_server_active_connections").increment(1.0);
	let _conn_guard = ConnectionGaugeGuard;

	let mut token: Option<String> = None;
	let callback = |req: &Request, resp: Response| {
		if req.uri().path() != WS_CHAT_PATH {
			let mut not_found = ErrorResponse::new(Some("not found".to_string()));
			*not_found.status_mut() = StatusCode::NOT_FOUND;
			return Err(not_found);
		}
		token = req.uri().query().and_then(token_from_query);
		Ok(resp)
	};

	let mut ws_stream = match accept_hdr_async(stream, callback).await {
		Ok(ws) => ws,
		Err(e) => {
			debug!(conn_id = %conn_id, remote = %peer, error = %e, "websocket handshake rejected");
			return Ok(());
		}
	};

	info!(conn_id = %conn_id, remote = %peer, "accepted websocket connection");

	let Some(token) = token else {
		warn!(conn_id = %conn_id, "missing auth token in websocket request");
		metrics::counter!("haven_server_auth_failures_total").increment(1);
		reject_with_error(&mut ws_stream, "unauthorized: missing token").await;
		return Ok(());
	};

	let identity = match auth.resolve(&token).await {
		Ok(identity) => identity,
		Err(e) => {
			warn!(conn_id = %conn_id, error = %e, "auth token rejected");
			metrics::counter!("haven_server_auth_failures_total").increment(1);
			reject_with_error(&mut ws_stream, &e.to_string()).await;
			return Ok(());
		}
	};

	info!(
		conn_id = %conn_id,
		user_id = %identity.user_id,
		username = %identity.display_name,
		"authenticated"
	);

	let (mut ws_sender, mut ws_receiver) = ws_stream.split();
	let (outbound_tx, mut outbound_rx) = mpsc::channel::<ServerFrame>(settings.outbound_queue_capacity);

	if let Err(e) = registry.register(conn_id, identity.clone(), outbound_tx.clone()).await {
		warn!(conn_id = %conn_id, error = %e, "failed to register connection");
		if let Ok(text) = encode_server_frame(&ServerFrame::error(e.to_string())) {
			let _ = ws_sender.send(Message::Text(text.into())).await;
		}
		let _ = ws_sender.send(Message::Close(None)).await;
		return Ok(());
	}

	let writer_conn_id = conn_id;
	let writer_task = tokio::spawn(async move {
		while let Some(frame) = outbound_rx.recv().await {
			let text = match encode_server_frame(&frame) {
				Ok(text) => text,
				Err(e) => {
					warn!(conn_id = %writer_conn_id, error = %e, "failed to encode outbound frame");
					continue;
				}
			};

			metrics::counter!("haven_server_frames_out_total").increment(1);
			if ws_sender.send(Message::Text(text.into())).await.is_err() {
				break;
			}
		}

		let _ = ws_sender.send(Message::Close(None)).await;
	});

	let mut message_bucket =
		TokenBucket::new(settings.message_rate_limit_burst, settings.message_rate_limit_per_minute);

	let loop_result = async {
		loop {
			let inbound = match timeout(settings.idle_timeout, ws_receiver.next()).await {
				Ok(Some(Ok(msg))) => msg,
				Ok(Some(Err(e))) => {
					debug!(conn_id = %conn_id, error = %e, "websocket read failed");
					break;
				}
				Ok(None) => break,
				Err(_) => {
					info!(conn_id = %conn_id, "closing idle connection");
					metrics::counter!("haven_server_idle_disconnects_total").increment(1);
					break;
				}
			};

			match inbound {
				Message::Text(text) => {
					metrics::counter!("haven_server_frames_in_total").increment(1);

					let frame = match decode_client_frame(text.as_str(), settings.max_frame_bytes) {
						Ok(frame) => frame,
						Err(e) => {
							metrics::counter!("haven_server_frame_decode_errors_total").increment(1);
							queue_frame(&outbound_tx, ServerFrame::error(e.to_string()));
							continue;
						}
					};

					let outcome = match frame {
						ClientFrame::Subscribe { group_id } => {
							handle_subscribe_frame(conn_id, &identity, group_id, &registry, &hub, &groups).await
						}
						ClientFrame::Unsubscribe { group_id } => {
							handle_unsubscribe_frame(conn_id, group_id, &registry, &hub).await
						}
						ClientFrame::Message { group_id, text } => {
							let allowed = match message_bucket.as_mut() {
								Some(bucket) => bucket.allow(),
								None => true,
							};
							if !allowed {
								metrics::counter!("haven_server_messages_rate_limited_total").increment(1);
								queue_frame(
									&outbound_tx,
									ServerFrame::error("rate limited: too many messages"),
								);
								continue;
							}

							handle_message_frame(&identity, group_id, text, &registry, &hub, &store, &groups)
								.await
						}
						ClientFrame::Ping { group_id: _ } => {
							queue_frame(&outbound_tx, ServerFrame::Pong);
							continue;
						}
					};

					if let Err(e) = outcome {
						metrics::counter!("haven_server_frame_errors_total").increment(1);
						queue_frame(&outbound_tx, ServerFrame::error(e.to_string()));
						if e.is_fatal() {
							warn!(conn_id = %conn_id, error = %e, "fatal error; closing connection");
							break;
						}
					}
				}
				Message::Binary(_) => {
					queue_frame(&outbound_tx, ServerFrame::error("binary frames are not supported"));
				}
				Message::Close(_) => {
					debug!(conn_id = %conn_id, "client closed connection");
					break;
				}
				// tungstenite answers pings itself; raw frames never surface.
				Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
			}
		}
		Ok::<(), anyhow::Error>(())
	}
	.await;

	{
		let groups_left = registry.unregister(conn_id).await;
		if !groups_left.is_empty() {
			debug!(conn_id = %conn_id, groups = groups_left.len(), "connection closing, leaving groups");
		}
		hub.drop_connection(conn_id, &groups_left).await;
	}

	drop(outbound_tx);
	let _ = writer_task.await;

	loop_result
}

async fn handle_subscribe_frame(
	conn_id: ConnectionId,
	identity: &Identity,
	group_id: String,
	registry: &ConnectionRegistry,
	hub: &GroupHub,
	groups: &GroupRegistry,
) -> Result<(), ChatError> {
	metrics::counter!("haven_server_subscribe_requests_total").increment(1);

	let group_id = GroupId::new(group_id)?;
	groups.require_member(&group_id, &identity.user_id).await?;
	registry.add_subscription(conn_id, group_id.clone()).await?;
	hub.subscribe(&group_id, conn_id).await;
	Ok(())
}

async fn handle_unsubscribe_frame(
	conn_id: ConnectionId,
	group_id: String,
	registry: &ConnectionRegistry,
	hub: &GroupHub,
) -> Result<(), ChatError> {
	metrics::counter!("haven_server_unsubscribe_requests_total").increment(1);

	let group_id = GroupId::new(group_id)?;
	hub.unsubscribe(&group_id, conn_id).await;
	registry.remove_subscription(conn_id, &group_id).await;
	Ok(())
}

async fn handle_message_frame(
	identity: &Identity,
	group_id: String,
	text: String,
	registry: &ConnectionRegistry,
	hub: &GroupHub,
	store: &MessageStore,
	groups: &GroupRegistry,
) -> Result<(), ChatError> {
	let group_id = GroupId::new(group_id)?;
	groups.require_member(&group_id, &identity.user_id).await?;
	hub.publish_stored(registry, &group_id, || store.append(&group_id, identity, &text))
		.await?;
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn token_is_extracted_from_query() {
		assert_eq!(token_from_query("token=abc"), Some("abc".to_string()));
		assert_eq!(token_from_query("a=1&token=abc&b=2"), Some("abc".to_string()));
		assert_eq!(token_from_query("token="), Some(String::new()));
		assert_eq!(token_from_query("a=1&b=2"), None);
		assert_eq!(token_from_query("token"), None);
	}

	#[test]
	fn token_bucket_enforces_burst_then_refills() {
		let mut bucket = TokenBucket::new(2, 60).unwrap();
		assert!(bucket.allow());
		assert!(bucket.allow());
		assert!(!bucket.allow());

		// A refill rate of 60/min means one token per second.
		bucket.last = Instant::now() - Duration::from_secs(1);
		assert!(bucket.allow());
		assert!(!bucket.allow());
	}

	#[test]
	fn zero_rate_limit_disables_the_bucket() {
		assert!(TokenBucket::new(0, 60).is_none());
		assert!(TokenBucket::new(20, 0).is_none());
	}
}
