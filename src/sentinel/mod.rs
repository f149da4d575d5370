//! Guild anti-nuke engine: per-(guild, executor) sliding-window counters
//! over destructive audit-log events, with an at-most-once lockdown when
//! a counter reaches its limit.

pub mod api;
pub mod capsule;
pub mod commands;
pub mod restore;
pub mod review;
pub mod rolestrip;
pub mod threats;
pub mod whitelist;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serenity::all::{ChannelType, Context as SerenityContext, EditRole, GuildId, UserId};
use serenity::model::guild::audit_log;
use serenity::builder::CreateMessage;
use tracing::{info, warn};

use crate::AppContext;
use crate::config::Limits;
use crate::permissions;
use review::ReviewGate;
use rolestrip::RoleStripTracker;
use threats::ThreatWatch;
use whitelist::{Scope, Whitelist};

/* =========================================
   Action kinds
   ========================================= */

/// The destructive event families the counters watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    ChannelDelete,
    CategoryDelete,
    ChannelCreate,
    ChannelPermEdit,
    RoleDelete,
    RoleCreate,
    RolePermEdit,
    WebhookChange,
    MemberBan,
}

impl ActionKind {
    pub fn limit(self, limits: &Limits) -> u32 {
        match self {
            ActionKind::ChannelDelete => limits.channel_delete,
            ActionKind::CategoryDelete => limits.category_delete,
            ActionKind::ChannelCreate => limits.channel_create,
            ActionKind::ChannelPermEdit => limits.channel_perm_edit,
            ActionKind::RoleDelete => limits.role_delete,
            ActionKind::RoleCreate => limits.role_create,
            ActionKind::RolePermEdit => limits.role_perm_edit,
            ActionKind::WebhookChange => limits.webhook_change,
            ActionKind::MemberBan => limits.member_ban,
        }
    }

    /// Whitelist scope that exempts an executor from this counter.
    pub fn scope(self) -> Scope {
        match self {
            ActionKind::ChannelDelete
            | ActionKind::CategoryDelete
            | ActionKind::ChannelCreate
            | ActionKind::ChannelPermEdit => Scope::Channels,
            ActionKind::RoleDelete | ActionKind::RoleCreate | ActionKind::RolePermEdit => {
                Scope::Roles
            }
            ActionKind::WebhookChange => Scope::Webhooks,
            ActionKind::MemberBan => Scope::Bans,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ActionKind::ChannelDelete => "channel deletions",
            ActionKind::CategoryDelete => "category deletions",
            ActionKind::ChannelCreate => "channel creations",
            ActionKind::ChannelPermEdit => "channel permission edits",
            ActionKind::RoleDelete => "role deletions",
            ActionKind::RoleCreate => "role creations",
            ActionKind::RolePermEdit => "role permission edits",
            ActionKind::WebhookChange => "webhook changes",
            ActionKind::MemberBan => "member bans",
        }
    }
}

/* =========================================
   Counter state
   ========================================= */

#[derive(Debug)]
struct ActorCounter {
    counts: HashMap<ActionKind, u32>,
    last_action: Instant,
    /// Set when lockdown fired for this actor; latches until the entry
    /// is swept, so lockdown runs at most once per window.
    locked: bool,
}

impl ActorCounter {
    fn new() -> Self {
        Self {
            counts: HashMap::new(),
            last_action: Instant::now(),
            locked: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BumpOutcome {
    /// Exempt executor, or the actor is already locked.
    Ignored,
    /// Counted below the limit; carries the new count.
    Counted(u32),
    /// The limit was reached; the caller must run lockdown.
    Lockdown { kind: ActionKind, count: u32 },
}

/* =========================================
   Service
   ========================================= */

pub struct Sentinel {
    ctx: Arc<AppContext>,
    counters: DashMap<(GuildId, UserId), ActorCounter>,
    pub whitelist: Whitelist,
    pub review: ReviewGate,
    pub rolestrip: RoleStripTracker,
    pub threats: ThreatWatch,
}

impl Sentinel {
    pub fn new(ctx: Arc<AppContext>) -> Arc<Self> {
        let cfg = &ctx.settings.sentinel;
        let whitelist = Whitelist::new(cfg.super_admin_id.map(UserId::new));
        let review = ReviewGate::new(Duration::from_secs(cfg.review.dedupe_secs));
        let rolestrip = RoleStripTracker::new(
            Duration::from_secs(cfg.rolestrip.window_secs),
            cfg.rolestrip.threshold,
        );
        let threats = ThreatWatch::new(Duration::from_secs(cfg.threats.dedupe_secs));
        Arc::new(Self {
            ctx,
            counters: DashMap::new(),
            whitelist,
            review,
            rolestrip,
            threats,
        })
    }

    pub fn app(&self) -> &Arc<AppContext> {
        &self.ctx
    }

    fn window(&self) -> Duration {
        Duration::from_secs(self.ctx.settings.sentinel.window_secs)
    }

    /// Count one destructive action against its executor. Pure state
    /// transition; the caller performs the lockdown side effects.
    pub fn bump(
        &self,
        guild_id: GuildId,
        owner_id: UserId,
        bot_id: UserId,
        executor_id: UserId,
        kind: ActionKind,
    ) -> BumpOutcome {
        if executor_id == bot_id
            || self
                .whitelist
                .has_scope(guild_id, owner_id, executor_id, kind.scope())
        {
            return BumpOutcome::Ignored;
        }

        let mut entry = self
            .counters
            .entry((guild_id, executor_id))
            .or_insert_with(ActorCounter::new);

        if entry.last_action.elapsed() >= self.window() {
            entry.counts.clear();
            entry.locked = false;
        }
        entry.last_action = Instant::now();

        if entry.locked {
            return BumpOutcome::Ignored;
        }

        let count = entry.counts.entry(kind).or_insert(0);
        *count += 1;
        let count = *count;

        if count >= kind.limit(&self.ctx.settings.sentinel.limits) {
            entry.locked = true;
            BumpOutcome::Lockdown { kind, count }
        } else {
            BumpOutcome::Counted(count)
        }
    }

    /// Background sweep dropping counter entries whose window elapsed.
    pub fn spawn_sweeper(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let period = Duration::from_secs(this.ctx.settings.sentinel.sweep_secs.max(1));
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            tick.tick().await;
            loop {
                tick.tick().await;
                let window = this.window();
                this.counters
                    .retain(|_, c| c.last_action.elapsed() < window);
            }
        });
    }

    #[cfg(any(test, feature = "test-utils"))]
    pub fn counter_of(&self, guild_id: GuildId, user_id: UserId, kind: ActionKind) -> u32 {
        self.counters
            .get(&(guild_id, user_id))
            .and_then(|c| c.counts.get(&kind).copied())
            .unwrap_or(0)
    }

    /* =========================================
       Lockdown side effects
       ========================================= */

    /// Strip the dangerous flags from every guild role that carries any,
    /// then alert the first writable text channel. Role edits are
    /// best-effort; roles above the bot's top role will fail and are
    /// skipped with a warning.
    pub async fn lockdown(
        &self,
        ctx: &SerenityContext,
        guild_id: GuildId,
        executor_id: UserId,
        kind: ActionKind,
        count: u32,
    ) {
        info!(
            guild = guild_id.get(),
            executor = executor_id.get(),
            kind = kind.label(),
            count,
            "lockdown triggered"
        );

        let dangerous_roles: Vec<_> = {
            let Some(guild) = ctx.cache.guild(guild_id) else {
                warn!(guild = guild_id.get(), "lockdown: guild not cached");
                return;
            };
            // Managed roles reject edits and @everyone is left for manual
            // review, so both are skipped.
            let everyone = guild_id.get();
            guild
                .roles
                .values()
                .filter(|r| {
                    !r.managed
                        && r.id.get() != everyone
                        && permissions::has_dangerous(r.permissions)
                })
                .map(|r| (r.id, r.permissions, r.name.clone()))
                .collect()
        };

        let mut stripped = 0usize;
        for (role_id, perms, name) in dangerous_roles {
            let edit = EditRole::new().permissions(permissions::strip_dangerous(perms));
            match guild_id.edit_role(&ctx.http, role_id, edit).await {
                Ok(_) => stripped += 1,
                Err(e) => {
                    warn!(guild = guild_id.get(), role = %name, error = %e, "lockdown: role edit failed");
                }
            }
        }

        let alert = format!(
            "🚨 **SERVER LOCKDOWN** 🚨\nDetected **{count} {}** by <@{executor}> within the abuse window.\nDangerous permissions were removed from **{stripped}** role(s).\nReview the audit log and restore permissions manually once the situation is under control.",
            kind.label(),
            executor = executor_id.get(),
        );
        self.alert_guild(ctx, guild_id, alert).await;
    }

    /// Post a plaintext alert to the first text channel the bot can write
    /// to. Best-effort: silently gives up when none accepts the message.
    pub async fn alert_guild(&self, ctx: &SerenityContext, guild_id: GuildId, content: String) {
        let mut channels: Vec<_> = {
            let Some(guild) = ctx.cache.guild(guild_id) else {
                return;
            };
            guild
                .channels
                .values()
                .filter(|c| c.kind == ChannelType::Text)
                .map(|c| (c.position, c.id))
                .collect()
        };
        channels.sort();

        for (_, channel_id) in channels {
            let msg = CreateMessage::new().content(content.clone());
            if channel_id.send_message(&ctx.http, msg).await.is_ok() {
                return;
            }
        }
        warn!(guild = guild_id.get(), "alert: no writable text channel");
    }
}

/* =========================================
   Audit-log attribution
   ========================================= */

/// Resolve who performed a gateway event by scanning recent audit-log
/// entries of the given kinds. Only entries younger than `max_age` count;
/// when `target` is set the entry must also point at that snowflake.
/// Returns None when attribution is uncertain.
pub async fn audit_executor(
    ctx: &SerenityContext,
    guild_id: GuildId,
    kinds: &[audit_log::Action],
    target: Option<u64>,
    max_age: Duration,
) -> Option<UserId> {
    let now = chrono::Utc::now().timestamp();
    for kind in kinds {
        let logs = match guild_id
            .audit_logs(&ctx.http, Some(*kind), None, None, Some(5))
            .await
        {
            Ok(l) => l,
            Err(e) => {
                warn!(guild = guild_id.get(), error = %e, "audit log fetch failed");
                continue;
            }
        };
        for entry in &logs.entries {
            let age = now - entry.id.created_at().unix_timestamp();
            if age < 0 || age as u64 > max_age.as_secs() {
                continue;
            }
            if let Some(want) = target {
                let hit = entry.target_id.map(|t| t.get() == want).unwrap_or(false);
                if !hit {
                    continue;
                }
            }
            return Some(entry.user_id);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;

    const G: GuildId = GuildId::new(1);
    const OWNER: UserId = UserId::new(10);
    const BOT: UserId = UserId::new(11);
    const ATTACKER: UserId = UserId::new(42);

    fn sentinel() -> Arc<Sentinel> {
        AppContext::new_testing(Settings::default()).sentinel()
    }

    #[test]
    fn locks_when_count_reaches_limit() {
        let s = sentinel();
        // channel_delete limit defaults to 4; the 4th deletion locks.
        for i in 1..=3 {
            assert_eq!(
                s.bump(G, OWNER, BOT, ATTACKER, ActionKind::ChannelDelete),
                BumpOutcome::Counted(i)
            );
        }
        assert_eq!(
            s.bump(G, OWNER, BOT, ATTACKER, ActionKind::ChannelDelete),
            BumpOutcome::Lockdown {
                kind: ActionKind::ChannelDelete,
                count: 4
            }
        );
        // Latched: no second lockdown within the window.
        assert_eq!(
            s.bump(G, OWNER, BOT, ATTACKER, ActionKind::ChannelDelete),
            BumpOutcome::Ignored
        );
    }

    #[test]
    fn exempt_actors_are_never_counted() {
        let s = sentinel();
        assert_eq!(
            s.bump(G, OWNER, BOT, OWNER, ActionKind::RoleDelete),
            BumpOutcome::Ignored
        );
        assert_eq!(
            s.bump(G, OWNER, BOT, BOT, ActionKind::RoleDelete),
            BumpOutcome::Ignored
        );
        s.whitelist.grant(
            G,
            ATTACKER,
            whitelist::normalize_scopes(["roles"]),
        );
        assert_eq!(
            s.bump(G, OWNER, BOT, ATTACKER, ActionKind::RoleDelete),
            BumpOutcome::Ignored
        );
        // The grant covers roles only; bans still count.
        assert_eq!(
            s.bump(G, OWNER, BOT, ATTACKER, ActionKind::MemberBan),
            BumpOutcome::Counted(1)
        );
    }

    #[test]
    fn kinds_are_counted_independently() {
        let s = sentinel();
        s.bump(G, OWNER, BOT, ATTACKER, ActionKind::ChannelDelete);
        s.bump(G, OWNER, BOT, ATTACKER, ActionKind::RoleDelete);
        assert_eq!(s.counter_of(G, ATTACKER, ActionKind::ChannelDelete), 1);
        assert_eq!(s.counter_of(G, ATTACKER, ActionKind::RoleDelete), 1);
        assert_eq!(s.counter_of(G, ATTACKER, ActionKind::MemberBan), 0);
    }

    #[test]
    fn elapsed_window_resets_counts() {
        let mut settings = Settings::default();
        settings.sentinel.window_secs = 0;
        let s = AppContext::new_testing(settings).sentinel();
        // With a zero window every bump starts a fresh window.
        assert_eq!(
            s.bump(G, OWNER, BOT, ATTACKER, ActionKind::CategoryDelete),
            BumpOutcome::Counted(1)
        );
        assert_eq!(
            s.bump(G, OWNER, BOT, ATTACKER, ActionKind::CategoryDelete),
            BumpOutcome::Counted(1)
        );
    }
}
