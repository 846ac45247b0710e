#![forbid(unsafe_code)]

use haven_domain::{ChatMessage, HistoryPage};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Largest inbound text frame the gateway will decode.
///
/// The message body itself is capped much lower by the store; this bound
/// exists so a client cannot make the server buffer megabytes of JSON
/// before validation even starts.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum FrameError {
	#[error("frame too large: {len} bytes exceeds limit of {max}")]
	TooLarge { len: usize, max: usize },
	#[error("malformed frame: {0}")]
	Decode(#[source] serde_json::Error),
	#[error("frame encode failed: {0}")]
	Encode(#[source] serde_json::Error),
}

/// Frames a client may send over the WebSocket.
///
/// Unknown `type` tags and missing fields are decode errors; unknown
/// extra fields are tolerated so older servers keep working when clients
/// grow new optional fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientFrame {
	#[serde(rename = "subscribe")]
	Subscribe { group_id: String },
	#[serde(rename = "unsubscribe")]
	Unsubscribe { group_id: String },
	#[serde(rename = "message")]
	Message { group_id: String, text: String },
	#[serde(rename = "ping")]
	Ping {
		#[serde(default, skip_serializing_if = "Option::is_none")]
		group_id: Option<String>,
	},
}

/// Frames the server may send to a client.
///
/// `Message` is the fan-out payload; every subscriber of a group receives
/// the same frame, including the sender. Timestamps are unix milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerFrame {
	#[serde(rename = "message")]
	Message {
		group_id: String,
		sender_id: String,
		username: String,
		message: String,
		timestamp: i64,
	},
	#[serde(rename = "pong")]
	Pong,
	#[serde(rename = "error")]
	Error { message: String },
}

impl ServerFrame {
	/// Builds the fan-out frame for a stored message.
	pub fn message_event(msg: &ChatMessage) -> Self {
		Self::Message {
			group_id: msg.group_id.as_str().to_string(),
			sender_id: msg.sender_id.as_str().to_string(),
			username: msg.sender_name.clone(),
			message: msg.text.clone(),
			timestamp: msg.created_at,
		}
	}

	pub fn error(message: impl Into<String>) -> Self {
		Self::Error { message: message.into() }
	}
}

/// One message as served by `GET /api/chat/history`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryMessage {
	pub id: i64,
	pub group_id: String,
	pub user_id: String,
	pub username: String,
	pub message: String,
	pub created_at: i64,
}

impl From<&ChatMessage> for HistoryMessage {
	fn from(msg: &ChatMessage) -> Self {
		Self {
			id: msg.id.as_i64(),
			group_id: msg.group_id.as_str().to_string(),
			user_id: msg.sender_id.as_str().to_string(),
			username: msg.sender_name.clone(),
			message: msg.text.clone(),
			created_at: msg.created_at,
		}
	}
}

/// Successful history response body. Messages are newest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryResponse {
	pub success: bool,
	pub messages: Vec<HistoryMessage>,
	pub has_more: bool,
}

impl HistoryResponse {
	pub fn from_page(page: &HistoryPage) -> Self {
		Self {
			success: true,
			messages: page.messages.iter().map(HistoryMessage::from).collect(),
			has_more: page.has_more,
		}
	}
}

/// Error body for the HTTP API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiFailure {
	pub success: bool,
	pub message: String,
}

impl ApiFailure {
	pub fn new(message: impl Into<String>) -> Self {
		Self { success: false, message: message.into() }
	}
}

/// Decodes one inbound text frame, enforcing the size bound first.
pub fn decode_client_frame(text: &str, max_bytes: usize) -> Result<ClientFrame, FrameError> {
	if text.len() > max_bytes {
		return Err(FrameError::TooLarge { len: text.len(), max: max_bytes });
	}
	serde_json::from_str(text).map_err(FrameError::Decode)
}

pub fn encode_server_frame(frame: &ServerFrame) -> Result<String, FrameError> {
	serde_json::to_string(frame).map_err(FrameError::Encode)
}
