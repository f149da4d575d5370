//! Capsule replay against an in-memory guild.

use std::collections::HashMap;
use std::sync::Mutex;

use bright_sentinel::sentinel::capsule::{
    Capsule, CapsuleError, CapsulePayload, ChannelSnapshot, OverwriteSnapshot, extract_restore,
};
use bright_sentinel::sentinel::restore::{GuildApi, RoleMeta, replay};
use serenity::async_trait;

struct MockApi {
    guild_id: u64,
    roles: Vec<RoleMeta>,
    members: Mutex<HashMap<u64, Vec<u64>>>,
    created: Mutex<Vec<ChannelSnapshot>>,
    positions: Mutex<Vec<(u64, u16)>>,
    fail_channel_create: bool,
}

impl MockApi {
    fn new(guild_id: u64) -> Self {
        Self {
            guild_id,
            roles: vec![
                RoleMeta { id: 1, managed: false },
                RoleMeta { id: 2, managed: false },
                RoleMeta { id: 9, managed: true },
            ],
            members: Mutex::new(HashMap::new()),
            created: Mutex::new(Vec::new()),
            positions: Mutex::new(Vec::new()),
            fail_channel_create: false,
        }
    }

    fn with_member(self, user_id: u64, roles: Vec<u64>) -> Self {
        self.members.lock().unwrap().insert(user_id, roles);
        self
    }

    fn member_roles(&self, user_id: u64) -> Vec<u64> {
        self.members.lock().unwrap().get(&user_id).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl GuildApi for MockApi {
    fn guild_id(&self) -> u64 {
        self.guild_id
    }

    fn existing_roles(&self) -> Vec<RoleMeta> {
        self.roles.clone()
    }

    async fn fetch_member_roles(&self, user_id: u64) -> Option<Vec<u64>> {
        self.members.lock().unwrap().get(&user_id).cloned()
    }

    async fn set_member_roles(&self, user_id: u64, roles: Vec<u64>) -> bool {
        self.members.lock().unwrap().insert(user_id, roles).is_some()
    }

    async fn create_channel(&self, snapshot: &ChannelSnapshot) -> Option<u64> {
        if self.fail_channel_create {
            return None;
        }
        self.created.lock().unwrap().push(snapshot.clone());
        Some(snapshot.id + 1)
    }

    async fn set_channel_position(&self, channel_id: u64, position: u16) -> bool {
        self.positions.lock().unwrap().push((channel_id, position));
        true
    }
}

fn roles_capsule(guild_id: u64, target: u64, roles: Vec<u64>, managed: Vec<u64>) -> Capsule {
    Capsule::new(
        guild_id,
        "derole",
        86_400_000,
        CapsulePayload::MemberRoles {
            target_id: target,
            role_ids: roles,
            managed_keep: managed,
            reason: "test".into(),
            executor_id: None,
        },
    )
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[tokio::test]
async fn restores_roles_and_skips_deleted_ones() {
    let api = MockApi::new(7).with_member(42, vec![9]);
    // Role 555 no longer exists in the guild.
    let cap = roles_capsule(7, 42, vec![1, 2, 555], vec![9]);
    let summary = replay(&api, &cap, now_ms()).await.unwrap();
    assert!(summary.contains("skipped"), "summary mentions dropped roles: {summary}");

    let mut roles = api.member_roles(42);
    roles.sort();
    assert_eq!(roles, vec![1, 2, 9]);
}

#[tokio::test]
async fn managed_roles_held_now_are_never_removed() {
    // Capsule knows nothing about role 9, but the member holds it and it
    // is managed, so it survives the set.
    let api = MockApi::new(7).with_member(42, vec![9]);
    let cap = roles_capsule(7, 42, vec![1], vec![]);
    replay(&api, &cap, now_ms()).await.unwrap();
    let mut roles = api.member_roles(42);
    roles.sort();
    assert_eq!(roles, vec![1, 9]);
}

#[tokio::test]
async fn expired_capsule_is_rejected() {
    let api = MockApi::new(7).with_member(42, vec![]);
    let cap = roles_capsule(7, 42, vec![1], vec![]);
    let err = replay(&api, &cap, cap.expires_at + 1).await.unwrap_err();
    assert_eq!(err, CapsuleError::Expired);
    assert!(api.member_roles(42).is_empty(), "no side effects after rejection");
}

#[tokio::test]
async fn wrong_guild_is_rejected() {
    let api = MockApi::new(8);
    let cap = roles_capsule(7, 42, vec![1], vec![]);
    assert_eq!(replay(&api, &cap, now_ms()).await.unwrap_err(), CapsuleError::GuildMismatch);
}

#[tokio::test]
async fn missing_member_is_reported() {
    let api = MockApi::new(7);
    let cap = roles_capsule(7, 42, vec![1], vec![]);
    assert_eq!(replay(&api, &cap, now_ms()).await.unwrap_err(), CapsuleError::MemberNotFound);
}

#[tokio::test]
async fn channel_recreate_restores_shape_and_position() {
    let api = MockApi::new(7);
    let snap = ChannelSnapshot {
        id: 500,
        name: "general".into(),
        kind: 0,
        parent_id: Some(400),
        position: Some(3),
        overwrites: vec![OverwriteSnapshot {
            id: 7,
            kind: "role".into(),
            allow: 0,
            deny: 1024,
        }],
        topic: Some("talk".into()),
        nsfw: false,
        rate_limit_per_user: Some(5),
        bitrate: None,
        user_limit: None,
    };
    let cap = Capsule::new(
        7,
        "recreate #general",
        86_400_000,
        CapsulePayload::ChannelRecreate {
            channel: snap,
            reason: "test".into(),
            executor_id: Some(13),
        },
    );

    // Through the wire format, as the button handler would see it.
    let decoded = Capsule::decode(extract_restore(&cap.message_content()).unwrap()).unwrap();
    let summary = replay(&api, &decoded, now_ms()).await.unwrap();
    assert!(summary.contains("general"));

    let created = api.created.lock().unwrap();
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].name, "general");
    assert_eq!(created[0].overwrites.len(), 1);
    assert_eq!(*api.positions.lock().unwrap(), vec![(501, 3)]);
}

#[tokio::test]
async fn category_recreate_replays_like_any_channel() {
    let api = MockApi::new(7);
    let snap = ChannelSnapshot {
        id: 600,
        name: "moderation".into(),
        kind: 4,
        parent_id: None,
        position: Some(1),
        overwrites: vec![OverwriteSnapshot {
            id: 7,
            kind: "role".into(),
            allow: 0,
            deny: 1024,
        }],
        topic: None,
        nsfw: false,
        rate_limit_per_user: None,
        bitrate: None,
        user_limit: None,
    };
    let cap = Capsule::new(
        7,
        "recreate category moderation",
        86_400_000,
        CapsulePayload::ChannelRecreate {
            channel: snap,
            reason: "test".into(),
            executor_id: None,
        },
    );

    let decoded = Capsule::decode(extract_restore(&cap.message_content()).unwrap()).unwrap();
    replay(&api, &decoded, now_ms()).await.unwrap();

    let created = api.created.lock().unwrap();
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].kind, 4);
    assert_eq!(created[0].overwrites.len(), 1);
}

#[tokio::test]
async fn failed_channel_create_maps_to_error() {
    let mut api = MockApi::new(7);
    api.fail_channel_create = true;
    let cap = Capsule::new(
        7,
        "recreate",
        86_400_000,
        CapsulePayload::ChannelRecreate {
            channel: ChannelSnapshot {
                id: 500,
                name: "general".into(),
                kind: 0,
                parent_id: None,
                position: None,
                overwrites: vec![],
                topic: None,
                nsfw: false,
                rate_limit_per_user: None,
                bitrate: None,
                user_limit: None,
            },
            reason: "test".into(),
            executor_id: None,
        },
    );
    assert_eq!(
        replay(&api, &cap, now_ms()).await.unwrap_err(),
        CapsuleError::ChannelCreateFailed
    );
}
