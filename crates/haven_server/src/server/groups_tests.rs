#![forbid(unsafe_code)]

use std::time::Duration;

use haven_domain::{ChatError, Group, GroupId, UserId};

use crate::server::groups::GroupRegistry;
use crate::util::time::unix_ms_now;

fn gid(id: &str) -> GroupId {
	GroupId::new(id.to_string()).expect("valid GroupId")
}

fn uid(id: &str) -> UserId {
	UserId::new(id.to_string()).expect("valid UserId")
}

fn registry() -> GroupRegistry {
	GroupRegistry::new_in_memory(Duration::from_secs(1))
}

fn group(id: &str, creator: &str) -> Group {
	Group {
		id: gid(id),
		name: format!("Group {id}"),
		slug: None,
		tags: Vec::new(),
		created_by: uid(creator),
		created_at: unix_ms_now(),
	}
}

#[tokio::test]
async fn unknown_groups_are_not_found() {
	let registry = registry();

	match registry.ensure_group_exists(&gid("missing")).await {
		Err(ChatError::NotFound(reason)) => assert!(reason.contains("missing"), "got: {reason}"),
		other => panic!("expected NotFound, got: {other:?}"),
	}

	match registry.is_member(&gid("missing"), &uid("u1")).await {
		Err(ChatError::NotFound(_)) => {}
		other => panic!("expected NotFound from is_member, got: {other:?}"),
	}
}

#[tokio::test]
async fn create_group_then_fetch_roundtrips_metadata() {
	let registry = registry();

	let mut wanted = group("g1", "u1");
	wanted.slug = Some("night-owls".to_string());
	wanted.tags = vec!["anxiety".to_string(), "students".to_string()];
	registry.create_group(wanted.clone()).await.expect("create");

	let got = registry.ensure_group_exists(&gid("g1")).await.expect("fetch");
	assert_eq!(got, wanted);
}

#[tokio::test]
async fn duplicate_group_ids_conflict() {
	let registry = registry();

	registry.create_group(group("g1", "u1")).await.expect("create");
	match registry.create_group(group("g1", "u2")).await {
		Err(ChatError::Conflict(reason)) => assert!(reason.contains("g1"), "got: {reason}"),
		other => panic!("expected Conflict, got: {other:?}"),
	}
}

#[tokio::test]
async fn creators_are_implicit_members() {
	let registry = registry();
	registry.create_group(group("g1", "u1")).await.expect("create");

	assert!(registry.is_member(&gid("g1"), &uid("u1")).await.expect("is_member"));
	registry.require_member(&gid("g1"), &uid("u1")).await.expect("creator passes");
}

#[tokio::test]
async fn non_members_are_forbidden() {
	let registry = registry();
	registry.create_group(group("g1", "u1")).await.expect("create");

	assert!(!registry.is_member(&gid("g1"), &uid("u2")).await.expect("is_member"));
	match registry.require_member(&gid("g1"), &uid("u2")).await {
		Err(ChatError::Forbidden(reason)) => assert!(reason.contains("g1"), "got: {reason}"),
		other => panic!("expected Forbidden, got: {other:?}"),
	}
}

#[tokio::test]
async fn added_members_pass_the_check() {
	let registry = registry();
	registry.create_group(group("g1", "u1")).await.expect("create");

	registry.add_member(&gid("g1"), &uid("u2")).await.expect("add member");
	registry.require_member(&gid("g1"), &uid("u2")).await.expect("member passes");

	// Re-adding is a no-op, not an error.
	registry.add_member(&gid("g1"), &uid("u2")).await.expect("idempotent add");
	assert!(registry.is_member(&gid("g1"), &uid("u2")).await.expect("is_member"));
}

#[tokio::test]
async fn membership_does_not_leak_across_groups() {
	let registry = registry();
	registry.create_group(group("g1", "u1")).await.expect("create g1");
	registry.create_group(group("g2", "u9")).await.expect("create g2");

	registry.add_member(&gid("g1"), &uid("u2")).await.expect("add to g1");

	assert!(!registry.is_member(&gid("g2"), &uid("u2")).await.expect("is_member"));
	assert!(!registry.is_member(&gid("g2"), &uid("u1")).await.expect("creator of g1 only"));
}

#[tokio::test]
async fn adding_members_to_unknown_groups_fails() {
	let registry = registry();

	match registry.add_member(&gid("missing"), &uid("u2")).await {
		Err(ChatError::NotFound(_)) => {}
		other => panic!("expected NotFound, got: {other:?}"),
	}
}
