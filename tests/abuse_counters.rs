//! Counter semantics across guilds and actors, plus a property check
//! that lockdown fires at most once per actor per window.

use bright_sentinel::AppContext;
use bright_sentinel::config::Settings;
use bright_sentinel::sentinel::whitelist::normalize_scopes;
use bright_sentinel::sentinel::{ActionKind, BumpOutcome, Sentinel};
use proptest::prelude::*;
use serenity::all::{GuildId, UserId};
use std::sync::Arc;

const OWNER: UserId = UserId::new(10);
const BOT: UserId = UserId::new(11);

fn sentinel() -> Arc<Sentinel> {
    AppContext::new_testing(Settings::default()).sentinel()
}

#[test]
fn guilds_are_isolated() {
    let s = sentinel();
    let (g1, g2) = (GuildId::new(1), GuildId::new(2));
    let attacker = UserId::new(42);

    // Reach the role_delete limit (3) in g1 only.
    for _ in 0..2 {
        s.bump(g1, OWNER, BOT, attacker, ActionKind::RoleDelete);
    }
    assert!(matches!(
        s.bump(g1, OWNER, BOT, attacker, ActionKind::RoleDelete),
        BumpOutcome::Lockdown { .. }
    ));
    assert_eq!(
        s.bump(g2, OWNER, BOT, attacker, ActionKind::RoleDelete),
        BumpOutcome::Counted(1)
    );
}

#[test]
fn actors_are_isolated() {
    let s = sentinel();
    let g = GuildId::new(1);
    for i in 0..4 {
        let actor = UserId::new(100 + i);
        assert_eq!(
            s.bump(g, OWNER, BOT, actor, ActionKind::ChannelDelete),
            BumpOutcome::Counted(1)
        );
    }
}

#[test]
fn whitelist_revocation_takes_effect_immediately() {
    let s = sentinel();
    let g = GuildId::new(1);
    let actor = UserId::new(42);

    s.whitelist.grant(g, actor, normalize_scopes(["channels"]));
    assert_eq!(
        s.bump(g, OWNER, BOT, actor, ActionKind::ChannelDelete),
        BumpOutcome::Ignored
    );
    let _ = s.whitelist.revoke(g, actor, &normalize_scopes(["channels"]));
    assert_eq!(
        s.bump(g, OWNER, BOT, actor, ActionKind::ChannelDelete),
        BumpOutcome::Counted(1)
    );
}

proptest! {
    // Any burst of destructive events from one actor yields at most one
    // lockdown while the window stays open.
    #[test]
    fn at_most_one_lockdown_per_burst(events in prop::collection::vec(0usize..9, 1..200)) {
        let s = sentinel();
        let g = GuildId::new(1);
        let actor = UserId::new(42);
        let kinds = [
            ActionKind::ChannelDelete,
            ActionKind::CategoryDelete,
            ActionKind::ChannelCreate,
            ActionKind::ChannelPermEdit,
            ActionKind::RoleDelete,
            ActionKind::RoleCreate,
            ActionKind::RolePermEdit,
            ActionKind::WebhookChange,
            ActionKind::MemberBan,
        ];

        let mut lockdowns = 0;
        for idx in events {
            if let BumpOutcome::Lockdown { .. } = s.bump(g, OWNER, BOT, actor, kinds[idx]) {
                lockdowns += 1;
            }
        }
        prop_assert!(lockdowns <= 1);
    }
}
