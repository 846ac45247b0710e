#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use haven_domain::{ChatError, ConnectionId, GroupId, Identity};
use haven_protocol::ServerFrame;
use tokio::sync::{Mutex, mpsc};

/// Live-connection bookkeeping: who is on each socket, the sender for its
/// outbound queue, and which groups it subscribed to.
///
/// The registry is a leaf: none of its methods call into the hub or the
/// stores, so its lock can be taken from inside a group's fan-out section.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
	inner: Arc<Mutex<RegistryInner>>,
}

#[derive(Default)]
struct RegistryInner {
	conns: HashMap<ConnectionId, ConnEntry>,
}

struct ConnEntry {
	identity: Identity,
	outbound: mpsc::Sender<ServerFrame>,
	groups: HashSet<GroupId>,
}

impl ConnectionRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	/// Admits an authenticated connection. A duplicate id is a `Conflict`,
	/// which is fatal to the offending connection.
	pub async fn register(
		&self,
		conn_id: ConnectionId,
		identity: Identity,
		outbound: mpsc::Sender<ServerFrame>,
	) -> Result<(), ChatError> {
		let mut inner = self.inner.lock().await;
		if inner.conns.contains_key(&conn_id) {
			return Err(ChatError::Conflict(format!("connection {conn_id} already registered")));
		}
		inner.conns.insert(conn_id, ConnEntry { identity, outbound, groups: HashSet::new() });
		Ok(())
	}

	/// Removes a connection and returns the groups it was subscribed to so
	/// the caller can cascade into the hub. Idempotent.
	pub async fn unregister(&self, conn_id: ConnectionId) -> Vec<GroupId> {
		let mut inner = self.inner.lock().await;
		match inner.conns.remove(&conn_id) {
			Some(entry) => entry.groups.into_iter().collect(),
			None => Vec::new(),
		}
	}

	/// Records a subscription on the connection's entry. Idempotent.
	pub async fn add_subscription(
		&self,
		conn_id: ConnectionId,
		group_id: GroupId,
	) -> Result<(), ChatError> {
		let mut inner = self.inner.lock().await;
		let entry = inner
			.conns
			.get_mut(&conn_id)
			.ok_or_else(|| ChatError::NotFound(format!("connection {conn_id} not registered")))?;
		entry.groups.insert(group_id);
		Ok(())
	}

	/// Forgets a subscription. Idempotent, also for unknown connections.
	pub async fn remove_subscription(&self, conn_id: ConnectionId, group_id: &GroupId) {
		let mut inner = self.inner.lock().await;
		if let Some(entry) = inner.conns.get_mut(&conn_id) {
			entry.groups.remove(group_id);
		}
	}

	/// Sender for a connection's outbound queue, if it is still registered.
	pub async fn resolve_sender(&self, conn_id: ConnectionId) -> Option<mpsc::Sender<ServerFrame>> {
		let inner = self.inner.lock().await;
		inner.conns.get(&conn_id).map(|entry| entry.outbound.clone())
	}

	/// Identity bound to a connection at registration time.
	pub async fn identity(&self, conn_id: ConnectionId) -> Option<Identity> {
		let inner = self.inner.lock().await;
		inner.conns.get(&conn_id).map(|entry| entry.identity.clone())
	}

	/// Groups a connection currently subscribes to.
	pub async fn subscriptions(&self, conn_id: ConnectionId) -> Vec<GroupId> {
		let inner = self.inner.lock().await;
		match inner.conns.get(&conn_id) {
			Some(entry) => entry.groups.iter().cloned().collect(),
			None => Vec::new(),
		}
	}

	pub async fn connection_count(&self) -> usize {
		let inner = self.inner.lock().await;
		inner.conns.len()
	}
}
