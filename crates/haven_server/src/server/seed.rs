#![forbid(unsafe_code)]

use haven_domain::{ChatError, Group, GroupId, Identity, UserId};
use tracing::{info, warn};

use crate::server::groups::GroupRegistry;
use crate::server::store::MessageStore;
use crate::util::time::unix_ms_now;

/// Seeds a couple of demo groups so a fresh checkout has something to chat in.
///
/// Re-running against an existing database is harmless: groups that already
/// exist are skipped and membership inserts are idempotent.
pub async fn seed_demo_data(groups: &GroupRegistry, store: &MessageStore) -> anyhow::Result<()> {
	let demo_owner = UserId::new("demo-owner")?;
	let demo_member = UserId::new("demo-member")?;

	let fixtures = [
		("night-owls", "Night Owls Support", &["anxiety", "students"][..]),
		("daily-check-ins", "Daily Check-ins", &["habits"][..]),
	];

	for (slug, name, tags) in fixtures {
		let group_id = GroupId::new(format!("grp-{slug}"))?;
		let group = Group {
			id: group_id.clone(),
			name: name.to_string(),
			slug: Some(slug.to_string()),
			tags: tags.iter().map(|t| t.to_string()).collect(),
			created_by: demo_owner.clone(),
			created_at: unix_ms_now(),
		};

		match groups.create_group(group).await {
			Ok(_) => {
				info!(group_id = %group_id, name, "seeded demo group");
				groups.add_member(&group_id, &demo_member).await?;

				let greeter = Identity::new(demo_owner.clone(), "Haven");
				let welcome = format!("Welcome to {name}! This group was seeded for local development.");
				if let Err(err) = store.append(&group_id, &greeter, &welcome).await {
					warn!(group_id = %group_id, error = %err, "failed to seed welcome message");
				}
			}
			Err(ChatError::Conflict(_)) => {
				info!(group_id = %group_id, "demo group already present, skipping");
			}
			Err(err) => return Err(err.into()),
		}
	}

	Ok(())
}
