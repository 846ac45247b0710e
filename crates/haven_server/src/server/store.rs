#![forbid(unsafe_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, anyhow};
use haven_domain::{ChatError, ChatMessage, GroupId, HistoryPage, Identity, MessageId, UserId};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::warn;

use crate::util::time::unix_ms_now;

/// Upper bound on messages kept per group by the in-memory backend.
const MEMORY_LOG_CAPACITY: usize = 65_536;

#[derive(Debug, Clone)]
pub struct StoreConfig {
	pub max_message_chars: usize,
	pub default_page_limit: u32,
	pub max_page_limit: u32,
	pub op_timeout: Duration,
}

impl Default for StoreConfig {
	fn default() -> Self {
		Self {
			max_message_chars: haven_domain::MAX_MESSAGE_CHARS,
			default_page_limit: 50,
			max_page_limit: 200,
			op_timeout: Duration::from_secs(5),
		}
	}
}

#[async_trait::async_trait]
pub trait StoreBackend: Send + Sync {
	/// Appends one message and returns it with its assigned id.
	async fn insert_message(
		&self,
		group_id: &GroupId,
		sender: &Identity,
		body: &str,
		created_at: i64,
	) -> anyhow::Result<ChatMessage>;

	/// Fetches up to `fetch` messages older than `before`, newest first.
	async fn page_messages(
		&self,
		group_id: &GroupId,
		before: Option<MessageId>,
		fetch: u32,
	) -> anyhow::Result<Vec<ChatMessage>>;
}

#[derive(Debug, Default)]
struct MemoryLog {
	next_id: i64,
	by_group: HashMap<String, VecDeque<ChatMessage>>,
}

impl MemoryLog {
	fn append(&mut self, group_id: &GroupId, sender: &Identity, body: &str, created_at: i64) -> ChatMessage {
		self.next_id += 1;
		let msg = ChatMessage {
			id: MessageId::new(self.next_id),
			group_id: group_id.clone(),
			sender_id: sender.user_id.clone(),
			sender_name: sender.display_name.clone(),
			text: body.to_string(),
			created_at,
		};

		let buf = self.by_group.entry(group_id.as_str().to_string()).or_default();
		buf.push_back(msg.clone());
		while buf.len() > MEMORY_LOG_CAPACITY {
			buf.pop_front();
		}
		msg
	}

	fn page(&self, group_id: &GroupId, before: Option<MessageId>, fetch: u32) -> Vec<ChatMessage> {
		let Some(buf) = self.by_group.get(group_id.as_str()) else {
			return Vec::new();
		};

		buf.iter()
			.rev()
			.filter(|m| match before {
				Some(cursor) => m.id.as_i64() < cursor.as_i64(),
				None => true,
			})
			.take(fetch as usize)
			.cloned()
			.collect()
	}
}

pub struct InMemoryMessageBackend {
	inner: Mutex<MemoryLog>,
}

impl Default for InMemoryMessageBackend {
	fn default() -> Self {
		Self { inner: Mutex::new(MemoryLog::default()) }
	}
}

#[async_trait::async_trait]
impl StoreBackend for InMemoryMessageBackend {
	async fn insert_message(
		&self,
		group_id: &GroupId,
		sender: &Identity,
		body: &str,
		created_at: i64,
	) -> anyhow::Result<ChatMessage> {
		let mut guard = self.inner.lock().await;
		Ok(guard.append(group_id, sender, body, created_at))
	}

	async fn page_messages(
		&self,
		group_id: &GroupId,
		before: Option<MessageId>,
		fetch: u32,
	) -> anyhow::Result<Vec<ChatMessage>> {
		let guard = self.inner.lock().await;
		Ok(guard.page(group_id, before, fetch))
	}
}

#[derive(Clone)]
pub struct PersistentMessageBackend {
	backend: PersistentBackend,
}

#[derive(Clone)]
enum PersistentBackend {
	Sqlite(sqlx::SqlitePool),
	Postgres(sqlx::PgPool),
	Mysql(sqlx::MySqlPool),
}

impl PersistentMessageBackend {
	pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
		if database_url.starts_with("sqlite:") {
			let pool = sqlx::SqlitePool::connect(database_url).await.context("connect sqlite")?;
			sqlx::migrate!("migrations/sqlite")
				.run(&pool)
				.await
				.context("run sqlite migrations")?;

			Ok(Self { backend: PersistentBackend::Sqlite(pool) })
		} else if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
			let pool = sqlx::PgPool::connect(database_url).await.context("connect postgres")?;
			sqlx::migrate!("migrations/postgres")
				.run(&pool)
				.await
				.context("run postgres migrations")?;

			Ok(Self { backend: PersistentBackend::Postgres(pool) })
		} else if database_url.starts_with("mysql:") || database_url.starts_with("mariadb:") {
			let pool = sqlx::MySqlPool::connect(database_url).await.context("connect mysql")?;
			sqlx::migrate!("migrations/mysql")
				.run(&pool)
				.await
				.context("run mysql migrations")?;

			Ok(Self { backend: PersistentBackend::Mysql(pool) })
		} else {
			Err(anyhow!("unsupported database_url (use sqlite:, postgres:, mysql:)"))
		}
	}
}

type MessageRow = (i64, String, String, String, i64);

fn message_from_row(group_id: &GroupId, row: MessageRow) -> anyhow::Result<ChatMessage> {
	let (id, sender_id, sender_name, body, created_at) = row;
	Ok(ChatMessage {
		id: MessageId::new(id),
		group_id: group_id.clone(),
		sender_id: UserId::new(sender_id)?,
		sender_name,
		text: body,
		created_at,
	})
}

#[async_trait::async_trait]
impl StoreBackend for PersistentMessageBackend {
	async fn insert_message(
		&self,
		group_id: &GroupId,
		sender: &Identity,
		body: &str,
		created_at: i64,
	) -> anyhow::Result<ChatMessage> {
		let id: i64 = match &self.backend {
			PersistentBackend::Sqlite(pool) => {
				let row: (i64,) = sqlx::query_as(
					"INSERT INTO messages (group_id, sender_id, sender_name, body, created_at) VALUES (?, ?, ?, ?, ?) RETURNING id",
				)
				.bind(group_id.as_str())
				.bind(sender.user_id.as_str())
				.bind(&sender.display_name)
				.bind(body)
				.bind(created_at)
				.fetch_one(pool)
				.await
				.context("insert message (sqlite)")?;
				row.0
			}
			PersistentBackend::Postgres(pool) => {
				let row: (i64,) = sqlx::query_as(
					"INSERT INTO messages (group_id, sender_id, sender_name, body, created_at) VALUES ($1, $2, $3, $4, $5) RETURNING id",
				)
				.bind(group_id.as_str())
				.bind(sender.user_id.as_str())
				.bind(&sender.display_name)
				.bind(body)
				.bind(created_at)
				.fetch_one(pool)
				.await
				.context("insert message (postgres)")?;
				row.0
			}
			PersistentBackend::Mysql(pool) => {
				let result = sqlx::query(
					"INSERT INTO messages (group_id, sender_id, sender_name, body, created_at) VALUES (?, ?, ?, ?, ?)",
				)
				.bind(group_id.as_str())
				.bind(sender.user_id.as_str())
				.bind(&sender.display_name)
				.bind(body)
				.bind(created_at)
				.execute(pool)
				.await
				.context("insert message (mysql)")?;
				result.last_insert_id() as i64
			}
		};

		Ok(ChatMessage {
			id: MessageId::new(id),
			group_id: group_id.clone(),
			sender_id: sender.user_id.clone(),
			sender_name: sender.display_name.clone(),
			text: body.to_string(),
			created_at,
		})
	}

	async fn page_messages(
		&self,
		group_id: &GroupId,
		before: Option<MessageId>,
		fetch: u32,
	) -> anyhow::Result<Vec<ChatMessage>> {
		let rows: Vec<MessageRow> = match (&self.backend, before) {
			(PersistentBackend::Sqlite(pool), Some(cursor)) => {
				sqlx::query_as(
					"SELECT id, sender_id, sender_name, body, created_at FROM messages WHERE group_id = ? AND id < ? ORDER BY id DESC LIMIT ?",
				)
				.bind(group_id.as_str())
				.bind(cursor.as_i64())
				.bind(fetch as i64)
				.fetch_all(pool)
				.await
				.context("select messages (sqlite)")?
			}
			(PersistentBackend::Sqlite(pool), None) => {
				sqlx::query_as(
					"SELECT id, sender_id, sender_name, body, created_at FROM messages WHERE group_id = ? ORDER BY id DESC LIMIT ?",
				)
				.bind(group_id.as_str())
				.bind(fetch as i64)
				.fetch_all(pool)
				.await
				.context("select messages (sqlite)")?
			}
			(PersistentBackend::Postgres(pool), Some(cursor)) => {
				sqlx::query_as(
					"SELECT id, sender_id, sender_name, body, created_at FROM messages WHERE group_id = $1 AND id < $2 ORDER BY id DESC LIMIT $3",
				)
				.bind(group_id.as_str())
				.bind(cursor.as_i64())
				.bind(fetch as i64)
				.fetch_all(pool)
				.await
				.context("select messages (postgres)")?
			}
			(PersistentBackend::Postgres(pool), None) => {
				sqlx::query_as(
					"SELECT id, sender_id, sender_name, body, created_at FROM messages WHERE group_id = $1 ORDER BY id DESC LIMIT $2",
				)
				.bind(group_id.as_str())
				.bind(fetch as i64)
				.fetch_all(pool)
				.await
				.context("select messages (postgres)")?
			}
			(PersistentBackend::Mysql(pool), Some(cursor)) => {
				sqlx::query_as(
					"SELECT id, sender_id, sender_name, body, created_at FROM messages WHERE group_id = ? AND id < ? ORDER BY id DESC LIMIT ?",
				)
				.bind(group_id.as_str())
				.bind(cursor.as_i64())
				.bind(fetch as i64)
				.fetch_all(pool)
				.await
				.context("select messages (mysql)")?
			}
			(PersistentBackend::Mysql(pool), None) => {
				sqlx::query_as(
					"SELECT id, sender_id, sender_name, body, created_at FROM messages WHERE group_id = ? ORDER BY id DESC LIMIT ?",
				)
				.bind(group_id.as_str())
				.bind(fetch as i64)
				.fetch_all(pool)
				.await
				.context("select messages (mysql)")?
			}
		};

		rows.into_iter().map(|row| message_from_row(group_id, row)).collect()
	}
}

/// Durable append-only log of messages with cursor pagination.
///
/// Append is the first half of store-then-publish: fan-out only ever sees
/// messages this service has already accepted.
#[derive(Clone)]
pub struct MessageStore {
	backend: Arc<dyn StoreBackend>,
	cfg: StoreConfig,
}

impl MessageStore {
	pub fn new_in_memory(cfg: StoreConfig) -> Self {
		Self { backend: Arc::new(InMemoryMessageBackend::default()), cfg }
	}

	pub fn new_persistent(backend: PersistentMessageBackend, cfg: StoreConfig) -> Self {
		Self { backend: Arc::new(backend), cfg }
	}

	/// Validates and appends one message, returning it with id and timestamp.
	pub async fn append(
		&self,
		group_id: &GroupId,
		sender: &Identity,
		body: &str,
	) -> Result<ChatMessage, ChatError> {
		let body = body.trim();
		if body.is_empty() {
			return Err(ChatError::Validation("message must not be empty".to_string()));
		}
		let chars = body.chars().count();
		if chars > self.cfg.max_message_chars {
			return Err(ChatError::Validation(format!(
				"message too long: {chars} chars exceeds limit of {}",
				self.cfg.max_message_chars
			)));
		}

		let created_at = unix_ms_now();
		match timeout(self.cfg.op_timeout, self.backend.insert_message(group_id, sender, body, created_at)).await
		{
			Ok(Ok(msg)) => Ok(msg),
			Ok(Err(e)) => {
				warn!(group_id = %group_id, error = %e, "message insert failed");
				Err(ChatError::TransientStore("message store unavailable".to_string()))
			}
			Err(_) => {
				warn!(group_id = %group_id, "message insert timed out");
				Err(ChatError::TransientStore("message store timed out".to_string()))
			}
		}
	}

	/// Returns one history page, newest first, with an accurate `has_more`.
	///
	/// `limit` of zero is rejected; values above the configured cap are
	/// clamped. The backend is asked for one extra row so `has_more` never
	/// needs a second query.
	pub async fn page(
		&self,
		group_id: &GroupId,
		before: Option<MessageId>,
		limit: Option<u32>,
	) -> Result<HistoryPage, ChatError> {
		let limit = match limit {
			None => self.cfg.default_page_limit,
			Some(0) => return Err(ChatError::Validation("limit must be positive".to_string())),
			Some(v) => v.min(self.cfg.max_page_limit),
		};

		let fetch = limit.saturating_add(1);
		let mut messages =
			match timeout(self.cfg.op_timeout, self.backend.page_messages(group_id, before, fetch)).await {
				Ok(Ok(rows)) => rows,
				Ok(Err(e)) => {
					warn!(group_id = %group_id, error = %e, "history page failed");
					return Err(ChatError::TransientStore("message store unavailable".to_string()));
				}
				Err(_) => {
					warn!(group_id = %group_id, "history page timed out");
					return Err(ChatError::TransientStore("message store timed out".to_string()));
				}
			};

		let has_more = messages.len() > limit as usize;
		messages.truncate(limit as usize);
		Ok(HistoryPage { messages, has_more })
	}
}
