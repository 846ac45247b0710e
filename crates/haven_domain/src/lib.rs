#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum chat message length in characters.
pub const MAX_MESSAGE_CHARS: usize = 4000;

/// Maximum length of client-supplied identifiers (group ids, user ids).
pub const MAX_ID_CHARS: usize = 128;

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("value exceeds {max} characters")]
	TooLong { max: usize },
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

fn validate_id(id: &str) -> Result<(), ParseIdError> {
	if id.trim().is_empty() {
		return Err(ParseIdError::Empty);
	}
	if id.chars().count() > MAX_ID_CHARS {
		return Err(ParseIdError::TooLong { max: MAX_ID_CHARS });
	}
	Ok(())
}

/// Stable group (chat room) identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(String);

impl GroupId {
	/// Create a non-empty `GroupId`.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		validate_id(&id)?;
		Ok(Self(id))
	}

	/// Generate a fresh random group id.
	pub fn random() -> Self {
		Self(uuid::Uuid::new_v4().to_string())
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for GroupId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for GroupId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		GroupId::new(s.to_string())
	}
}

/// Identifier of an authenticated principal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
	/// Create a non-empty `UserId`.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		validate_id(&id)?;
		Ok(Self(id))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for UserId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for UserId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		UserId::new(s.to_string())
	}
}

/// Process-local identifier of one live duplex connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(u64);

impl ConnectionId {
	pub const fn new(id: u64) -> Self {
		Self(id)
	}

	pub const fn as_u64(self) -> u64 {
		self.0
	}
}

impl fmt::Display for ConnectionId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "conn-{}", self.0)
	}
}

/// Store-assigned message identifier, monotonically increasing per group.
///
/// Doubles as the pagination cursor: "older than" is "id strictly less than".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(i64);

impl MessageId {
	pub const fn new(id: i64) -> Self {
		Self(id)
	}

	pub const fn as_i64(self) -> i64 {
		self.0
	}
}

impl fmt::Display for MessageId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl FromStr for MessageId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}
		let id: i64 = s
			.parse()
			.map_err(|_| ParseIdError::InvalidFormat("expected a numeric message id".into()))?;
		Ok(Self(id))
	}
}

/// Authenticated principal bound to a connection for its whole lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
	pub user_id: UserId,
	pub display_name: String,
}

impl Identity {
	pub fn new(user_id: UserId, display_name: impl Into<String>) -> Self {
		Self {
			user_id,
			display_name: display_name.into(),
		}
	}
}

/// A chat group as seen by the core: read-only metadata plus the creator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
	pub id: GroupId,
	pub name: String,
	pub slug: Option<String>,
	pub tags: Vec<String>,
	pub created_by: UserId,
	/// Unix milliseconds.
	pub created_at: i64,
}

impl Group {
	/// Whether `user_id` is the group creator (creators are implicit members).
	pub fn is_creator(&self, user_id: &UserId) -> bool {
		&self.created_by == user_id
	}
}

/// Explicit membership row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
	pub group_id: GroupId,
	pub user_id: UserId,
	/// Unix milliseconds.
	pub joined_at: i64,
}

/// A persisted chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
	pub id: MessageId,
	pub group_id: GroupId,
	pub sender_id: UserId,
	pub sender_name: String,
	pub text: String,
	/// Unix milliseconds, assigned by the store at write time.
	pub created_at: i64,
}

/// One page of history, newest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryPage {
	pub messages: Vec<ChatMessage>,
	pub has_more: bool,
}

/// Error taxonomy shared by the store, registries, broker and gateway.
///
/// `Auth` and `Conflict` are fatal to a connection; everything else is
/// reported to the offending peer and the session continues.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChatError {
	#[error("unauthorized: {0}")]
	Auth(String),

	#[error("not found: {0}")]
	NotFound(String),

	#[error("forbidden: {0}")]
	Forbidden(String),

	#[error("invalid request: {0}")]
	Validation(String),

	#[error("temporarily unavailable: {0}")]
	TransientStore(String),

	#[error("conflict: {0}")]
	Conflict(String),
}

impl ChatError {
	/// Whether the gateway must close the connection on this error.
	pub fn is_fatal(&self) -> bool {
		matches!(self, ChatError::Auth(_) | ChatError::Conflict(_))
	}
}

impl From<ParseIdError> for ChatError {
	fn from(e: ParseIdError) -> Self {
		ChatError::Validation(e.to_string())
	}
}
