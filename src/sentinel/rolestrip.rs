//! Defense against humans mass-removing roles: a per-(guild, executor)
//! counter over a long window. Crossing the threshold deroles the
//! executor (managed roles kept) and posts a restore capsule plus a
//! Restore/Keep panel for operators.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serenity::all::{
    ButtonStyle, ComponentInteraction, Context as SerenityContext, EditMember, GuildId, Member,
    Permissions, RoleId, UserId,
};
use serenity::model::guild::audit_log;
use serenity::builder::{
    CreateActionRow, CreateButton, CreateInteractionResponse, CreateInteractionResponseMessage,
    CreateMessage,
};
use tracing::{info, warn};

use crate::AppContext;
use crate::sentinel::capsule::{Capsule, CapsulePayload};
use crate::sentinel::whitelist::Scope;
use crate::sentinel::{audit_executor, restore};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VictimRoles {
    pub target_id: u64,
    pub role_ids: Vec<u64>,
}

#[derive(Debug)]
struct StripRecord {
    count: u32,
    last_action: Instant,
    victims: Vec<VictimRoles>,
}

/// Roles taken from the executor by the defense, held so the Restore
/// button can put them back without decoding the capsule.
#[derive(Debug, Clone)]
pub struct PendingDerole {
    pub removed_roles: Vec<u64>,
    pub managed_keep: Vec<u64>,
}

#[derive(Debug, PartialEq, Eq)]
pub struct StripTrigger {
    pub victims: Vec<VictimRoles>,
}

pub struct RoleStripTracker {
    window: Duration,
    threshold: u32,
    strips: DashMap<(GuildId, UserId), StripRecord>,
    pending: DashMap<(GuildId, UserId), PendingDerole>,
}

impl RoleStripTracker {
    pub fn new(window: Duration, threshold: u32) -> Self {
        Self {
            window,
            threshold,
            strips: DashMap::new(),
            pending: DashMap::new(),
        }
    }

    /// Record a role-removal event against its executor, weighted by how
    /// many roles it took. Returns a trigger exactly once when the count
    /// reaches the threshold; the counter resets afterwards so a
    /// persistent attacker re-arms it.
    pub fn record_removal(
        &self,
        guild_id: GuildId,
        executor_id: UserId,
        victim: VictimRoles,
    ) -> Option<StripTrigger> {
        let mut rec = self
            .strips
            .entry((guild_id, executor_id))
            .or_insert_with(|| StripRecord {
                count: 0,
                last_action: Instant::now(),
                victims: Vec::new(),
            });

        if rec.last_action.elapsed() >= self.window {
            rec.count = 0;
            rec.victims.clear();
        }
        rec.last_action = Instant::now();
        rec.count += victim.role_ids.len() as u32;
        rec.victims.push(victim);

        if rec.count >= self.threshold {
            let victims = std::mem::take(&mut rec.victims);
            rec.count = 0;
            Some(StripTrigger { victims })
        } else {
            None
        }
    }

    pub fn set_pending(&self, guild_id: GuildId, executor_id: UserId, pending: PendingDerole) {
        self.pending.insert((guild_id, executor_id), pending);
    }

    pub fn take_pending(&self, guild_id: GuildId, executor_id: UserId) -> Option<PendingDerole> {
        self.pending.remove(&(guild_id, executor_id)).map(|(_, v)| v)
    }

    #[cfg(any(test, feature = "test-utils"))]
    pub fn count_of(&self, guild_id: GuildId, executor_id: UserId) -> u32 {
        self.strips
            .get(&(guild_id, executor_id))
            .map(|r| r.count)
            .unwrap_or(0)
    }
}

/* =========================================
   Discord glue
   ========================================= */

fn panel_buttons(guild_id: GuildId, executor_id: UserId, disabled: bool) -> Vec<CreateActionRow> {
    vec![CreateActionRow::Buttons(vec![
        CreateButton::new(format!("snl:restore_roles:{}:{}", guild_id.get(), executor_id.get()))
            .label("Restore roles")
            .style(ButtonStyle::Success)
            .disabled(disabled),
        CreateButton::new(format!("snl:keep_derolled:{}:{}", guild_id.get(), executor_id.get()))
            .label("Keep derolled")
            .style(ButtonStyle::Secondary)
            .disabled(disabled),
    ])]
}

/// A member lost roles. Attribute the removal; when a non-exempt human
/// crosses the mass-removal threshold, derole them.
pub async fn on_member_roles_removed(
    ctx: &SerenityContext,
    app: &Arc<AppContext>,
    old: &Member,
    new: &Member,
) {
    let removed: Vec<RoleId> = old
        .roles
        .iter()
        .filter(|r| !new.roles.contains(r))
        .copied()
        .collect();
    if removed.is_empty() {
        return;
    }

    let sentinel = app.sentinel();
    let guild_id = new.guild_id;
    let cfg = &app.settings.sentinel;

    let max_age = Duration::from_secs(cfg.attribution_max_age_secs);
    let Some(executor_id) = audit_executor(
        ctx,
        guild_id,
        &[audit_log::Action::Member(audit_log::MemberAction::RoleUpdate)],
        Some(new.user.id.get()),
        max_age,
    )
    .await
    else {
        return;
    };

    let (owner_id, bot_id) = {
        let Some(guild) = ctx.cache.guild(guild_id) else {
            return;
        };
        (guild.owner_id, ctx.cache.current_user().id)
    };
    if executor_id == bot_id
        || new.user.id == executor_id
        || sentinel
            .whitelist
            .has_scope(guild_id, owner_id, executor_id, Scope::Roles)
    {
        return;
    }

    let victim = VictimRoles {
        target_id: new.user.id.get(),
        role_ids: removed.iter().map(|r| r.get()).collect(),
    };
    let Some(trigger) = sentinel
        .rolestrip
        .record_removal(guild_id, executor_id, victim)
    else {
        return;
    };

    info!(
        guild = guild_id.get(),
        executor = executor_id.get(),
        victims = trigger.victims.len(),
        "mass role removal threshold crossed; deroling executor"
    );
    derole_executor(ctx, app, guild_id, executor_id).await;

    if cfg.rolestrip.restore_victims {
        for victim in &trigger.victims {
            let cap = Capsule::new(
                guild_id.get(),
                format!("Roles stripped from user {}", victim.target_id),
                (cfg.capsules.ttl_secs * 1000) as i64,
                CapsulePayload::MemberRoles {
                    target_id: victim.target_id,
                    role_ids: victim.role_ids.clone(),
                    managed_keep: Vec::new(),
                    reason: "Victim of mass role removal".into(),
                    executor_id: Some(executor_id.get()),
                },
            );
            let _ = restore::post_restore_capsule(ctx, app, guild_id, &cap, None).await;
        }
    }
}

/// Strip the executor down to managed roles, persist a restore capsule,
/// and post the operator panel next to it.
async fn derole_executor(
    ctx: &SerenityContext,
    app: &Arc<AppContext>,
    guild_id: GuildId,
    executor_id: UserId,
) {
    let sentinel = app.sentinel();
    let cfg = &app.settings.sentinel;

    let Ok(member) = guild_id.member(&ctx.http, executor_id).await else {
        warn!(guild = guild_id.get(), executor = executor_id.get(), "derole: member fetch failed");
        return;
    };

    let (managed_keep, removed_roles): (Vec<RoleId>, Vec<RoleId>) = {
        let Some(guild) = ctx.cache.guild(guild_id) else {
            return;
        };
        member
            .roles
            .iter()
            .copied()
            .partition(|rid| guild.roles.get(rid).map(|r| r.managed).unwrap_or(false))
    };

    let edit = EditMember::new().roles(managed_keep.clone());
    if let Err(e) = guild_id.edit_member(&ctx.http, executor_id, edit).await {
        warn!(guild = guild_id.get(), executor = executor_id.get(), error = %e, "derole failed");
        return;
    }

    sentinel.rolestrip.set_pending(
        guild_id,
        executor_id,
        PendingDerole {
            removed_roles: removed_roles.iter().map(|r| r.get()).collect(),
            managed_keep: managed_keep.iter().map(|r| r.get()).collect(),
        },
    );

    let cap = Capsule::new(
        guild_id.get(),
        format!("Executor {} derolled by mass-removal defense", executor_id.get()),
        (cfg.capsules.ttl_secs * 1000) as i64,
        CapsulePayload::MemberRoles {
            target_id: executor_id.get(),
            role_ids: removed_roles.iter().map(|r| r.get()).collect(),
            managed_keep: managed_keep.iter().map(|r| r.get()).collect(),
            reason: "Mass role removal defense".into(),
            executor_id: Some(executor_id.get()),
        },
    );
    let posted = restore::post_restore_capsule(ctx, app, guild_id, &cap, None).await;

    if let Some((channel_id, _)) = posted {
        let msg = CreateMessage::new()
            .content(format!(
                "🛡️ <@{}> removed roles from {} member(s) within the watch window and was derolled (managed roles kept).",
                executor_id.get(),
                cfg.rolestrip.threshold,
            ))
            .components(panel_buttons(guild_id, executor_id, false));
        let _ = channel_id.send_message(&ctx.http, msg).await;
    }
}

/// Whether a member update amounts to an Administrator grant: the
/// effective permission set gained the flag it did not hold before.
pub fn gained_admin(old: Permissions, new: Permissions) -> bool {
    !old.contains(Permissions::ADMINISTRATOR) && new.contains(Permissions::ADMINISTRATOR)
}

/// A member gained Administrator. Unless the target is the owner, or the
/// target or the attributed executor holds the `admin` scope, revert the
/// target to their previous role set.
pub async fn on_admin_grant(
    ctx: &SerenityContext,
    app: &Arc<AppContext>,
    old: &Member,
    new: &Member,
) {
    let guild_id = new.guild_id;
    let (owner_id, bot_id, gained) = {
        let Some(guild) = ctx.cache.guild(guild_id) else {
            return;
        };
        let gained = gained_admin(
            guild.member_permissions(old),
            guild.member_permissions(new),
        );
        (guild.owner_id, ctx.cache.current_user().id, gained)
    };
    if !gained || new.user.id == owner_id {
        return;
    }

    let sentinel = app.sentinel();
    if sentinel
        .whitelist
        .has_scope(guild_id, owner_id, new.user.id, Scope::Admin)
    {
        return;
    }

    let max_age = Duration::from_secs(app.settings.sentinel.attribution_max_age_secs);
    let executor = audit_executor(
        ctx,
        guild_id,
        &[audit_log::Action::Member(audit_log::MemberAction::RoleUpdate)],
        Some(new.user.id.get()),
        max_age,
    )
    .await;
    if let Some(executor_id) = executor {
        if executor_id == bot_id
            || sentinel
                .whitelist
                .has_scope(guild_id, owner_id, executor_id, Scope::Admin)
        {
            return;
        }
    }

    warn!(
        guild = guild_id.get(),
        target = new.user.id.get(),
        executor = executor.map(|e| e.get()).unwrap_or(0),
        "unauthorized administrator grant; reverting"
    );
    let edit = EditMember::new().roles(old.roles.clone());
    if let Err(e) = guild_id.edit_member(&ctx.http, new.user.id, edit).await {
        warn!(guild = guild_id.get(), error = %e, "admin grant revert failed");
    }
    let by = match executor {
        Some(id) => format!(" by <@{}>", id.get()),
        None => String::new(),
    };
    sentinel
        .alert_guild(
            ctx,
            guild_id,
            format!(
                "⚠️ <@{}> was granted Administrator{by} without the `admin` scope. The grant was reverted.",
                new.user.id.get(),
            ),
        )
        .await;
}

/// `snl:restore_roles:*` / `snl:keep_derolled:*` buttons.
pub async fn handle_button(
    ctx: &SerenityContext,
    app: &Arc<AppContext>,
    interaction: &ComponentInteraction,
) -> bool {
    let parts: Vec<&str> = interaction.data.custom_id.split(':').collect();
    let [ns, action, guild_raw, executor_raw] = parts.as_slice() else {
        return false;
    };
    if *ns != "snl" || !matches!(*action, "restore_roles" | "keep_derolled") {
        return false;
    }
    let (Ok(guild_id), Ok(executor_id)) =
        (guild_raw.parse::<u64>(), executor_raw.parse::<u64>())
    else {
        return false;
    };
    let guild_id = GuildId::new(guild_id);
    let executor_id = UserId::new(executor_id);

    let sentinel = app.sentinel();
    let owner_id = {
        let Some(guild) = ctx.cache.guild(guild_id) else {
            return true;
        };
        guild.owner_id
    };
    if !sentinel
        .whitelist
        .has_scope(guild_id, owner_id, interaction.user.id, Scope::Restore)
    {
        let reject = CreateInteractionResponse::Message(
            CreateInteractionResponseMessage::new()
                .content("You need the `restore` whitelist scope to act on deroles.")
                .ephemeral(true),
        );
        let _ = interaction.create_response(&ctx.http, reject).await;
        return true;
    }

    let note = if *action == "keep_derolled" {
        sentinel.rolestrip.take_pending(guild_id, executor_id);
        format!("Kept derolled by <@{}>.", interaction.user.id.get())
    } else {
        match sentinel.rolestrip.take_pending(guild_id, executor_id) {
            Some(pending) => {
                let roles: Vec<RoleId> = pending
                    .removed_roles
                    .iter()
                    .chain(pending.managed_keep.iter())
                    .map(|r| RoleId::new(*r))
                    .collect();
                let edit = EditMember::new().roles(roles);
                match guild_id.edit_member(&ctx.http, executor_id, edit).await {
                    Ok(_) => format!(
                        "Roles restored to <@{}> by <@{}>.",
                        executor_id.get(),
                        interaction.user.id.get()
                    ),
                    Err(e) => format!("Role restore failed: {e}"),
                }
            }
            // Restart or double click; the capsule below still works.
            None => "Nothing pending for this user; use the capsule's Restore button.".to_string(),
        }
    };

    let update = CreateInteractionResponse::UpdateMessage(
        CreateInteractionResponseMessage::new()
            .content(format!("{}\n{}", interaction.message.content, note))
            .components(panel_buttons(guild_id, executor_id, true)),
    );
    let _ = interaction.create_response(&ctx.http, update).await;
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    const G: GuildId = GuildId::new(1);
    const E: UserId = UserId::new(42);

    fn victim(n: u64) -> VictimRoles {
        VictimRoles {
            target_id: n,
            role_ids: vec![100 + n],
        }
    }

    #[test]
    fn triggers_exactly_at_threshold() {
        let t = RoleStripTracker::new(Duration::from_secs(180), 5);
        for i in 1..=4 {
            assert!(t.record_removal(G, E, victim(i)).is_none());
        }
        let trigger = t.record_removal(G, E, victim(5)).expect("fifth removal triggers");
        assert_eq!(trigger.victims.len(), 5);
        assert_eq!(trigger.victims[0], victim(1));
        // Counter re-arms after a trigger.
        assert_eq!(t.count_of(G, E), 0);
        assert!(t.record_removal(G, E, victim(6)).is_none());
    }

    #[test]
    fn one_event_stripping_five_roles_triggers() {
        let t = RoleStripTracker::new(Duration::from_secs(180), 5);
        let v = VictimRoles {
            target_id: 7,
            role_ids: vec![101, 102, 103, 104, 105],
        };
        let trigger = t.record_removal(G, E, v.clone()).expect("five roles at once trigger");
        assert_eq!(trigger.victims, vec![v]);
    }

    #[test]
    fn four_removals_do_not_trigger() {
        let t = RoleStripTracker::new(Duration::from_secs(180), 5);
        for i in 1..=4 {
            assert!(t.record_removal(G, E, victim(i)).is_none());
        }
        assert_eq!(t.count_of(G, E), 4);
    }

    #[test]
    fn elapsed_window_resets() {
        let t = RoleStripTracker::new(Duration::ZERO, 5);
        for i in 1..=10 {
            assert!(t.record_removal(G, E, victim(i)).is_none(), "window resets each time");
        }
    }

    #[test]
    fn admin_grant_is_a_transition() {
        let safe = Permissions::SEND_MESSAGES;
        let admin = Permissions::ADMINISTRATOR;
        assert!(gained_admin(safe, safe | admin));
        // Already an admin, or a grant of anything else, is no transition.
        assert!(!gained_admin(admin, admin | Permissions::MANAGE_ROLES));
        assert!(!gained_admin(safe, safe | Permissions::BAN_MEMBERS));
        assert!(!gained_admin(admin, safe));
    }

    #[test]
    fn pending_is_taken_once() {
        let t = RoleStripTracker::new(Duration::from_secs(180), 5);
        t.set_pending(
            G,
            E,
            PendingDerole {
                removed_roles: vec![1, 2],
                managed_keep: vec![3],
            },
        );
        let p = t.take_pending(G, E).unwrap();
        assert_eq!(p.removed_roles, vec![1, 2]);
        assert!(t.take_pending(G, E).is_none());
    }
}
