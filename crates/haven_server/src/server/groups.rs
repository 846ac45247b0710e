#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, anyhow};
use haven_domain::{ChatError, Group, GroupId, Membership, UserId};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::warn;

use crate::util::time::unix_ms_now;

#[async_trait::async_trait]
pub trait GroupBackend: Send + Sync {
	async fn fetch_group(&self, group_id: &GroupId) -> anyhow::Result<Option<Group>>;

	async fn membership_exists(&self, group_id: &GroupId, user_id: &UserId) -> anyhow::Result<bool>;

	/// Insert paths exist for seeding and tooling; the gateway itself never
	/// creates groups.
	async fn insert_group(&self, group: &Group) -> anyhow::Result<()>;

	async fn insert_membership(&self, membership: &Membership) -> anyhow::Result<()>;
}

#[derive(Debug, Default)]
struct GroupTable {
	groups: HashMap<String, Group>,
	members: HashSet<(String, String)>,
}

pub struct InMemoryGroupBackend {
	inner: Mutex<GroupTable>,
}

impl Default for InMemoryGroupBackend {
	fn default() -> Self {
		Self { inner: Mutex::new(GroupTable::default()) }
	}
}

#[async_trait::async_trait]
impl GroupBackend for InMemoryGroupBackend {
	async fn fetch_group(&self, group_id: &GroupId) -> anyhow::Result<Option<Group>> {
		let guard = self.inner.lock().await;
		Ok(guard.groups.get(group_id.as_str()).cloned())
	}

	async fn membership_exists(&self, group_id: &GroupId, user_id: &UserId) -> anyhow::Result<bool> {
		let guard = self.inner.lock().await;
		Ok(guard
			.members
			.contains(&(group_id.as_str().to_string(), user_id.as_str().to_string())))
	}

	async fn insert_group(&self, group: &Group) -> anyhow::Result<()> {
		let mut guard = self.inner.lock().await;
		guard.groups.insert(group.id.as_str().to_string(), group.clone());
		Ok(())
	}

	async fn insert_membership(&self, membership: &Membership) -> anyhow::Result<()> {
		let mut guard = self.inner.lock().await;
		guard.members.insert((
			membership.group_id.as_str().to_string(),
			membership.user_id.as_str().to_string(),
		));
		Ok(())
	}
}

#[derive(Clone)]
pub struct PersistentGroupBackend {
	backend: PersistentBackend,
}

#[derive(Clone)]
enum PersistentBackend {
	Sqlite(sqlx::SqlitePool),
	Postgres(sqlx::PgPool),
	Mysql(sqlx::MySqlPool),
}

impl PersistentGroupBackend {
	/// Connects to the shared chat database. Schema migrations are owned by
	/// the message store's connect path.
	pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
		if database_url.starts_with("sqlite:") {
			let pool = sqlx::SqlitePool::connect(database_url).await.context("connect sqlite")?;
			Ok(Self { backend: PersistentBackend::Sqlite(pool) })
		} else if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
			let pool = sqlx::PgPool::connect(database_url).await.context("connect postgres")?;
			Ok(Self { backend: PersistentBackend::Postgres(pool) })
		} else if database_url.starts_with("mysql:") || database_url.starts_with("mariadb:") {
			let pool = sqlx::MySqlPool::connect(database_url).await.context("connect mysql")?;
			Ok(Self { backend: PersistentBackend::Mysql(pool) })
		} else {
			Err(anyhow!("unsupported database_url (use sqlite:, postgres:, mysql:)"))
		}
	}
}

type GroupRow = (String, String, Option<String>, String, String, i64);

fn group_from_row(row: GroupRow) -> anyhow::Result<Group> {
	let (id, name, slug, tags, created_by, created_at) = row;
	let tags: Vec<String> = serde_json::from_str(&tags).context("decode group tags")?;
	Ok(Group {
		id: GroupId::new(id)?,
		name,
		slug,
		tags,
		created_by: UserId::new(created_by)?,
		created_at,
	})
}

#[async_trait::async_trait]
impl GroupBackend for PersistentGroupBackend {
	async fn fetch_group(&self, group_id: &GroupId) -> anyhow::Result<Option<Group>> {
		let row: Option<GroupRow> = match &self.backend {
			PersistentBackend::Sqlite(pool) => {
				sqlx::query_as("SELECT id, name, slug, tags, created_by, created_at FROM groups WHERE id = ?")
					.bind(group_id.as_str())
					.fetch_optional(pool)
					.await
					.context("select group (sqlite)")?
			}
			PersistentBackend::Postgres(pool) => {
				sqlx::query_as("SELECT id, name, slug, tags, created_by, created_at FROM groups WHERE id = $1")
					.bind(group_id.as_str())
					.fetch_optional(pool)
					.await
					.context("select group (postgres)")?
			}
			PersistentBackend::Mysql(pool) => {
				sqlx::query_as("SELECT id, name, slug, tags, created_by, created_at FROM groups WHERE id = ?")
					.bind(group_id.as_str())
					.fetch_optional(pool)
					.await
					.context("select group (mysql)")?
			}
		};

		row.map(group_from_row).transpose()
	}

	async fn membership_exists(&self, group_id: &GroupId, user_id: &UserId) -> anyhow::Result<bool> {
		let row: (i64,) = match &self.backend {
			PersistentBackend::Sqlite(pool) => {
				sqlx::query_as("SELECT COUNT(*) FROM group_members WHERE group_id = ? AND user_id = ?")
					.bind(group_id.as_str())
					.bind(user_id.as_str())
					.fetch_one(pool)
					.await
					.context("count membership (sqlite)")?
			}
			PersistentBackend::Postgres(pool) => {
				sqlx::query_as("SELECT COUNT(*) FROM group_members WHERE group_id = $1 AND user_id = $2")
					.bind(group_id.as_str())
					.bind(user_id.as_str())
					.fetch_one(pool)
					.await
					.context("count membership (postgres)")?
			}
			PersistentBackend::Mysql(pool) => {
				sqlx::query_as("SELECT COUNT(*) FROM group_members WHERE group_id = ? AND user_id = ?")
					.bind(group_id.as_str())
					.bind(user_id.as_str())
					.fetch_one(pool)
					.await
					.context("count membership (mysql)")?
			}
		};

		Ok(row.0 > 0)
	}

	async fn insert_group(&self, group: &Group) -> anyhow::Result<()> {
		let tags = serde_json::to_string(&group.tags).context("encode group tags")?;

		match &self.backend {
			PersistentBackend::Sqlite(pool) => {
				sqlx::query(
					"INSERT INTO groups (id, name, slug, tags, created_by, created_at) VALUES (?, ?, ?, ?, ?, ?)",
				)
				.bind(group.id.as_str())
				.bind(&group.name)
				.bind(group.slug.as_deref())
				.bind(&tags)
				.bind(group.created_by.as_str())
				.bind(group.created_at)
				.execute(pool)
				.await
				.context("insert group (sqlite)")?;
			}
			PersistentBackend::Postgres(pool) => {
				sqlx::query(
					"INSERT INTO groups (id, name, slug, tags, created_by, created_at) VALUES ($1, $2, $3, $4, $5, $6)",
				)
				.bind(group.id.as_str())
				.bind(&group.name)
				.bind(group.slug.as_deref())
				.bind(&tags)
				.bind(group.created_by.as_str())
				.bind(group.created_at)
				.execute(pool)
				.await
				.context("insert group (postgres)")?;
			}
			PersistentBackend::Mysql(pool) => {
				sqlx::query(
					"INSERT INTO groups (id, name, slug, tags, created_by, created_at) VALUES (?, ?, ?, ?, ?, ?)",
				)
				.bind(group.id.as_str())
				.bind(&group.name)
				.bind(group.slug.as_deref())
				.bind(&tags)
				.bind(group.created_by.as_str())
				.bind(group.created_at)
				.execute(pool)
				.await
				.context("insert group (mysql)")?;
			}
		}

		Ok(())
	}

	async fn insert_membership(&self, membership: &Membership) -> anyhow::Result<()> {
		match &self.backend {
			PersistentBackend::Sqlite(pool) => {
				sqlx::query(
					"INSERT OR IGNORE INTO group_members (group_id, user_id, joined_at) VALUES (?, ?, ?)",
				)
				.bind(membership.group_id.as_str())
				.bind(membership.user_id.as_str())
				.bind(membership.joined_at)
				.execute(pool)
				.await
				.context("insert membership (sqlite)")?;
			}
			PersistentBackend::Postgres(pool) => {
				sqlx::query(
					"INSERT INTO group_members (group_id, user_id, joined_at) VALUES ($1, $2, $3) \
					ON CONFLICT (group_id, user_id) DO NOTHING",
				)
				.bind(membership.group_id.as_str())
				.bind(membership.user_id.as_str())
				.bind(membership.joined_at)
				.execute(pool)
				.await
				.context("insert membership (postgres)")?;
			}
			PersistentBackend::Mysql(pool) => {
				sqlx::query(
					"INSERT IGNORE INTO group_members (group_id, user_id, joined_at) VALUES (?, ?, ?)",
				)
				.bind(membership.group_id.as_str())
				.bind(membership.user_id.as_str())
				.bind(membership.joined_at)
				.execute(pool)
				.await
				.context("insert membership (mysql)")?;
			}
		}

		Ok(())
	}
}

/// Read-mostly view of groups and memberships.
///
/// The gateway consults this before every subscribe and publish; a group's
/// creator counts as a member without a membership row.
#[derive(Clone)]
pub struct GroupRegistry {
	backend: Arc<dyn GroupBackend>,
	op_timeout: Duration,
}

impl GroupRegistry {
	pub fn new_in_memory(op_timeout: Duration) -> Self {
		Self { backend: Arc::new(InMemoryGroupBackend::default()), op_timeout }
	}

	pub fn new_persistent(backend: PersistentGroupBackend, op_timeout: Duration) -> Self {
		Self { backend: Arc::new(backend), op_timeout }
	}

	async fn with_timeout<T>(
		&self,
		what: &'static str,
		fut: impl Future<Output = anyhow::Result<T>> + Send,
	) -> Result<T, ChatError> {
		match timeout(self.op_timeout, fut).await {
			Ok(Ok(v)) => Ok(v),
			Ok(Err(e)) => {
				warn!(error = %e, "group registry {what} failed");
				Err(ChatError::TransientStore(format!("group registry unavailable ({what})")))
			}
			Err(_) => {
				warn!("group registry {what} timed out");
				Err(ChatError::TransientStore(format!("group registry timed out ({what})")))
			}
		}
	}

	/// Fetches the group or fails with `NotFound`.
	pub async fn ensure_group_exists(&self, group_id: &GroupId) -> Result<Group, ChatError> {
		let group = self.with_timeout("fetch group", self.backend.fetch_group(group_id)).await?;
		group.ok_or_else(|| ChatError::NotFound(format!("group {group_id}")))
	}

	/// Whether the user may read and write the group.
	///
	/// The creator is always a member; everyone else needs a membership row.
	pub async fn is_member(&self, group_id: &GroupId, user_id: &UserId) -> Result<bool, ChatError> {
		let group = self.ensure_group_exists(group_id).await?;
		if group.is_creator(user_id) {
			return Ok(true);
		}
		self.with_timeout("check membership", self.backend.membership_exists(group_id, user_id))
			.await
	}

	pub async fn require_member(&self, group_id: &GroupId, user_id: &UserId) -> Result<(), ChatError> {
		if self.is_member(group_id, user_id).await? {
			Ok(())
		} else {
			Err(ChatError::Forbidden(format!("not a member of {group_id}")))
		}
	}

	/// Creates a group. Fails with `Conflict` if the id is already taken.
	pub async fn create_group(&self, group: Group) -> Result<Group, ChatError> {
		let existing = self.with_timeout("fetch group", self.backend.fetch_group(&group.id)).await?;
		if existing.is_some() {
			return Err(ChatError::Conflict(format!("group {} already exists", group.id)));
		}
		self.with_timeout("insert group", self.backend.insert_group(&group)).await?;
		Ok(group)
	}

	/// Adds a membership row. Idempotent for existing members.
	pub async fn add_member(&self, group_id: &GroupId, user_id: &UserId) -> Result<(), ChatError> {
		self.ensure_group_exists(group_id).await?;
		let membership = Membership {
			group_id: group_id.clone(),
			user_id: user_id.clone(),
			joined_at: unix_ms_now(),
		};
		self.with_timeout("insert membership", self.backend.insert_membership(&membership))
			.await
	}
}
