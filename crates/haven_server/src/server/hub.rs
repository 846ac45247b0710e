#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;

use haven_domain::{ChatError, ChatMessage, ConnectionId, GroupId};
use haven_protocol::ServerFrame;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock, mpsc};
use tracing::{debug, warn};

use crate::server::registry::ConnectionRegistry;

/// Per-group broker that fans stored messages out to subscribers.
///
/// Each group has its own lock, held across append-then-deliver, so the
/// order subscribers see frames in always matches append order. Publishes
/// to different groups never contend with each other.
#[derive(Clone)]
pub struct GroupHub {
	groups: Arc<RwLock<HashMap<GroupId, Arc<Mutex<GroupState>>>>>,
	cfg: GroupHubConfig,
}

/// Configuration for `GroupHub`.
#[derive(Debug, Clone, Default)]
pub struct GroupHubConfig {
	pub debug_logs: bool,
}

#[derive(Debug, Default)]
struct GroupState {
	subscribers: HashSet<ConnectionId>,
	/// Set under the outer write lock right before the entry is removed;
	/// tells late lockers their Arc is detached from the map.
	dead: bool,
}

impl GroupHub {
	pub fn new(cfg: GroupHubConfig) -> Self {
		Self { groups: Arc::new(RwLock::new(HashMap::new())), cfg }
	}

	/// Locks the live entry for a group, creating it if needed.
	///
	/// Loops on the `dead` marker: an Arc cloned out of the map can lose a
	/// GC race, and appending under a detached lock would let two publishes
	/// to the same group interleave.
	async fn lock_entry(&self, group_id: &GroupId) -> OwnedMutexGuard<GroupState> {
		loop {
			let state = {
				let map = self.groups.read().await;
				map.get(group_id).cloned()
			};
			let state = match state {
				Some(state) => state,
				None => {
					let mut map = self.groups.write().await;
					map.entry(group_id.clone())
						.or_insert_with(|| Arc::new(Mutex::new(GroupState::default())))
						.clone()
				}
			};

			let guard = state.lock_owned().await;
			if !guard.dead {
				return guard;
			}
		}
	}

	/// Removes the entry if it is still empty.
	///
	/// Holding the map write lock while taking the entry lock is safe here:
	/// entry-lock holders never wait on the map.
	async fn gc_if_empty(&self, group_id: &GroupId) {
		let mut map = self.groups.write().await;
		if let Some(state) = map.get(group_id) {
			let mut guard = state.clone().lock_owned().await;
			if guard.subscribers.is_empty() {
				guard.dead = true;
				drop(guard);
				map.remove(group_id);
			}
		}
	}

	/// Adds a connection to a group's subscriber set. Idempotent.
	pub async fn subscribe(&self, group_id: &GroupId, conn_id: ConnectionId) {
		let mut guard = self.lock_entry(group_id).await;
		guard.subscribers.insert(conn_id);

		if self.cfg.debug_logs {
			debug!(group_id = %group_id, %conn_id, subs = guard.subscribers.len(), "group hub: subscribed");
		}
	}

	/// Removes a connection from a group's subscriber set. Idempotent; a
	/// group nobody subscribes to anymore is dropped from the map.
	pub async fn unsubscribe(&self, group_id: &GroupId, conn_id: ConnectionId) {
		let state = {
			let map = self.groups.read().await;
			map.get(group_id).cloned()
		};
		let Some(state) = state else {
			return;
		};

		let mut guard = state.lock_owned().await;
		if guard.dead {
			return;
		}
		guard.subscribers.remove(&conn_id);
		let now_empty = guard.subscribers.is_empty();

		if self.cfg.debug_logs {
			debug!(group_id = %group_id, %conn_id, subs = guard.subscribers.len(), "group hub: unsubscribed");
		}
		drop(guard);

		if now_empty {
			self.gc_if_empty(group_id).await;
		}
	}

	/// Drops a closing connection from every group it subscribed to.
	pub async fn drop_connection(&self, conn_id: ConnectionId, groups: &[GroupId]) {
		for group_id in groups {
			self.unsubscribe(group_id, conn_id).await;
		}
	}

	/// Appends via `append` and fans the stored message out, atomically per
	/// group.
	///
	/// The entry lock is held across both steps; concurrent publishes to
	/// the same group serialize here, which is what keeps delivery order
	/// equal to append order. Slow subscribers lose the frame rather than
	/// stall the group; closed ones are pruned.
	pub async fn publish_stored<F, Fut>(
		&self,
		registry: &ConnectionRegistry,
		group_id: &GroupId,
		append: F,
	) -> Result<ChatMessage, ChatError>
	where
		F: FnOnce() -> Fut,
		Fut: Future<Output = Result<ChatMessage, ChatError>>,
	{
		let mut guard = self.lock_entry(group_id).await;

		let msg = match append().await {
			Ok(msg) => msg,
			Err(e) => {
				let now_empty = guard.subscribers.is_empty();
				drop(guard);
				if now_empty {
					self.gc_if_empty(group_id).await;
				}
				return Err(e);
			}
		};

		metrics::counter!("haven_server_messages_total").increment(1);

		let frame = ServerFrame::message_event(&msg);
		let mut dropped: u64 = 0;
		let mut stale: Vec<ConnectionId> = Vec::new();

		for conn_id in guard.subscribers.iter().copied() {
			match registry.resolve_sender(conn_id).await {
				Some(tx) => match tx.try_send(frame.clone()) {
					Ok(()) => {}
					Err(mpsc::error::TrySendError::Full(_)) => {
						dropped += 1;
						metrics::counter!("haven_server_fanout_dropped_total").increment(1);
					}
					Err(mpsc::error::TrySendError::Closed(_)) => stale.push(conn_id),
				},
				None => stale.push(conn_id),
			}
		}

		for conn_id in stale {
			guard.subscribers.remove(&conn_id);
		}
		let now_empty = guard.subscribers.is_empty();
		drop(guard);

		if dropped > 0 {
			warn!(
				group_id = %group_id,
				dropped,
				"group hub: dropped frames for slow subscribers"
			);
		}

		if now_empty {
			self.gc_if_empty(group_id).await;
		}

		Ok(msg)
	}

	/// Current subscriber count for a group (0 if the group has no entry).
	pub async fn subscriber_count(&self, group_id: &GroupId) -> usize {
		let state = {
			let map = self.groups.read().await;
			map.get(group_id).cloned()
		};
		match state {
			Some(state) => state.lock().await.subscribers.len(),
			None => 0,
		}
	}

	/// Number of groups currently holding an entry. Empty groups are
	/// collected, so this doubles as a leak check in tests.
	pub async fn group_count(&self) -> usize {
		self.groups.read().await.len()
	}
}
