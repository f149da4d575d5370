//! Bot review gate: a bot joining with dangerous permissions, or one with
//! a standing denial, is kicked on sight and a review panel is posted for
//! humans to accept or deny it. Harmless bots join untouched. Decisions
//! are process-local; a restart simply re-reviews the next join.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serenity::all::{
    ButtonStyle, ComponentInteraction, Context as SerenityContext, EditMember, GuildId, Member,
    Permissions, RoleId, UserId,
};
use serenity::model::guild::audit_log;
use serenity::builder::{
    CreateActionRow, CreateButton, CreateEmbed, CreateInteractionResponse,
    CreateInteractionResponseMessage, CreateMessage,
};
use tracing::{info, warn};

use crate::AppContext;
use crate::permissions;
use crate::sentinel::whitelist::Scope;
use crate::sentinel::{audit_executor, restore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BotDecision {
    Approved,
    Denied,
    Unseen,
}

pub struct ReviewGate {
    approved: DashMap<GuildId, HashSet<UserId>>,
    denied: DashMap<GuildId, HashSet<UserId>>,
    /// Bots with a posted panel awaiting a verdict.
    pending: DashMap<GuildId, HashSet<UserId>>,
    /// Suppresses repeated kick/panel storms per (guild, bot).
    dedupe: moka::sync::Cache<(u64, u64), ()>,
}

impl ReviewGate {
    pub fn new(dedupe_ttl: Duration) -> Self {
        Self {
            approved: DashMap::new(),
            denied: DashMap::new(),
            pending: DashMap::new(),
            dedupe: moka::sync::Cache::builder()
                .time_to_live(dedupe_ttl)
                .build(),
        }
    }

    pub fn decision(&self, guild_id: GuildId, bot_id: UserId) -> BotDecision {
        if self
            .approved
            .get(&guild_id)
            .map(|s| s.contains(&bot_id))
            .unwrap_or(false)
        {
            return BotDecision::Approved;
        }
        if self
            .denied
            .get(&guild_id)
            .map(|s| s.contains(&bot_id))
            .unwrap_or(false)
        {
            return BotDecision::Denied;
        }
        BotDecision::Unseen
    }

    /// Approve; clears any standing denial. Idempotent.
    pub fn approve(&self, guild_id: GuildId, bot_id: UserId) {
        if let Some(mut s) = self.denied.get_mut(&guild_id) {
            s.remove(&bot_id);
        }
        if let Some(mut s) = self.pending.get_mut(&guild_id) {
            s.remove(&bot_id);
        }
        self.approved.entry(guild_id).or_default().insert(bot_id);
    }

    /// Deny; clears any standing approval. Idempotent.
    pub fn deny(&self, guild_id: GuildId, bot_id: UserId) {
        if let Some(mut s) = self.approved.get_mut(&guild_id) {
            s.remove(&bot_id);
        }
        if let Some(mut s) = self.pending.get_mut(&guild_id) {
            s.remove(&bot_id);
        }
        self.denied.entry(guild_id).or_default().insert(bot_id);
    }

    pub fn mark_pending(&self, guild_id: GuildId, bot_id: UserId) {
        self.pending.entry(guild_id).or_default().insert(bot_id);
    }

    pub fn is_pending(&self, guild_id: GuildId, bot_id: UserId) -> bool {
        self.pending
            .get(&guild_id)
            .map(|s| s.contains(&bot_id))
            .unwrap_or(false)
    }

    /// True the first time per dedupe window; later calls are suppressed.
    pub fn should_act(&self, guild_id: GuildId, bot_id: UserId) -> bool {
        let key = (guild_id.get(), bot_id.get());
        if self.dedupe.contains_key(&key) {
            return false;
        }
        self.dedupe.insert(key, ());
        true
    }
}

/* =========================================
   Discord glue
   ========================================= */

fn accept_id(guild_id: GuildId, bot_id: UserId) -> String {
    format!("snl:accept:{}:{}", guild_id.get(), bot_id.get())
}

fn deny_id(guild_id: GuildId, bot_id: UserId) -> String {
    format!("snl:deny:{}:{}", guild_id.get(), bot_id.get())
}

fn panel_buttons(guild_id: GuildId, bot_id: UserId, disabled: bool) -> Vec<CreateActionRow> {
    vec![CreateActionRow::Buttons(vec![
        CreateButton::new(accept_id(guild_id, bot_id))
            .label("Accept")
            .style(ButtonStyle::Success)
            .disabled(disabled),
        CreateButton::new(deny_id(guild_id, bot_id))
            .label("Deny")
            .style(ButtonStyle::Danger)
            .disabled(disabled),
    ])]
}

/// True when a joining bot must be kicked pending review: it carries a
/// standing denial, or its permission set intersects the dangerous list.
pub fn kick_on_sight(decision: BotDecision, perms: Permissions) -> bool {
    decision == BotDecision::Denied || permissions::has_dangerous(perms)
}

/// New member that is a bot. Denied or dangerously-permissioned bots are
/// kicked and a review panel is posted; anything else joins untouched.
/// Kick failure falls back to clearing the bot's roles.
pub async fn on_bot_member_add(ctx: &SerenityContext, app: &Arc<AppContext>, member: &Member) {
    let sentinel = app.sentinel();
    let guild_id = member.guild_id;
    let bot_id = member.user.id;

    let decision = sentinel.review.decision(guild_id, bot_id);
    if decision == BotDecision::Approved {
        return;
    }

    let (owner_id, perms) = {
        let Some(guild) = ctx.cache.guild(guild_id) else {
            return;
        };
        let perms = guild.member_permissions(member);
        (guild.owner_id, perms)
    };
    if !kick_on_sight(decision, perms) {
        return;
    }
    if !sentinel.review.should_act(guild_id, bot_id) {
        return;
    }

    let max_age = Duration::from_secs(app.settings.sentinel.attribution_max_age_secs);
    let adder = audit_executor(
        ctx,
        guild_id,
        &[audit_log::Action::Member(audit_log::MemberAction::BotAdd)],
        Some(bot_id.get()),
        max_age,
    )
    .await;

    info!(guild = guild_id.get(), bot = bot_id.get(), "unreviewed bot joined; kicking");
    let kicked = guild_id
        .kick_with_reason(&ctx.http, bot_id, "Unreviewed bot (pending approval)")
        .await
        .is_ok();
    if !kicked {
        // Containment fallback: a bot we cannot kick at least loses its roles.
        let edit = EditMember::new().roles(Vec::<RoleId>::new());
        if let Err(e) = guild_id.edit_member(&ctx.http, bot_id, edit).await {
            warn!(guild = guild_id.get(), bot = bot_id.get(), error = %e, "bot containment failed");
        }
    }

    let adder_line = match adder {
        Some(id) => format!("<@{}>", id.get()),
        None => "unknown (no fresh audit entry)".to_string(),
    };
    let perm_list = permissions::dangerous_labels(perms).join(", ");
    let embed = CreateEmbed::new()
        .title("🤖 Bot Review Required")
        .description(format!(
            "**{}** tried to join and was {}.",
            member.user.tag(),
            if kicked { "kicked pending review" } else { "contained (kick failed)" },
        ))
        .field("Bot", format!("<@{}> (`{}`)", bot_id.get(), bot_id.get()), true)
        .field("Added by", adder_line, true)
        .field("Dangerous permissions", perm_list, false);

    let Some(channel) = restore::ensure_named_text_channel(
        ctx,
        guild_id,
        &app.settings.sentinel.review.channel,
        "Bot review panel",
    )
    .await
    else {
        warn!(guild = guild_id.get(), "no channel for review panel");
        return;
    };

    let msg = CreateMessage::new()
        .content(format!("<@{}>", owner_id.get()))
        .embed(embed)
        .components(panel_buttons(guild_id, bot_id, false));
    match channel.send_message(&ctx.http, msg).await {
        Ok(_) => sentinel.review.mark_pending(guild_id, bot_id),
        Err(e) => warn!(guild = guild_id.get(), error = %e, "review panel post failed"),
    }
}

/// A bot's roles changed. If it now holds dangerous permissions without
/// an approval on file, strip its roles and re-run the join gate.
pub async fn on_bot_member_update(ctx: &SerenityContext, app: &Arc<AppContext>, member: &Member) {
    let sentinel = app.sentinel();
    let guild_id = member.guild_id;
    let bot_id = member.user.id;

    if sentinel.review.decision(guild_id, bot_id) == BotDecision::Approved {
        return;
    }

    let dangerous = {
        let Some(guild) = ctx.cache.guild(guild_id) else {
            return;
        };
        permissions::has_dangerous(guild.member_permissions(member))
    };
    if !dangerous {
        return;
    }

    warn!(guild = guild_id.get(), bot = bot_id.get(), "unapproved bot gained dangerous perms");
    let managed_keep: Vec<_> = {
        let Some(guild) = ctx.cache.guild(guild_id) else {
            return;
        };
        member
            .roles
            .iter()
            .filter(|rid| guild.roles.get(*rid).map(|r| r.managed).unwrap_or(false))
            .copied()
            .collect()
    };
    let edit = EditMember::new().roles(managed_keep);
    if let Err(e) = guild_id.edit_member(&ctx.http, bot_id, edit).await {
        warn!(guild = guild_id.get(), bot = bot_id.get(), error = %e, "bot role strip failed");
    }
    on_bot_member_add(ctx, app, member).await;
}

/// `snl:accept:*` / `snl:deny:*` buttons. Returns true when the custom id
/// belonged to this module.
pub async fn handle_button(
    ctx: &SerenityContext,
    app: &Arc<AppContext>,
    interaction: &ComponentInteraction,
) -> bool {
    let Some((action, guild_id, bot_id)) = parse_review_custom_id(&interaction.data.custom_id)
    else {
        return false;
    };
    if !matches!(action, "accept" | "deny") {
        return false;
    }

    let sentinel = app.sentinel();
    let owner_id = {
        let Some(guild) = ctx.cache.guild(guild_id) else {
            return true;
        };
        guild.owner_id
    };
    if !sentinel
        .whitelist
        .has_scope(guild_id, owner_id, interaction.user.id, Scope::BotAdds)
    {
        let reject = CreateInteractionResponse::Message(
            CreateInteractionResponseMessage::new()
                .content("You need the `bot-adds` whitelist scope to review bots.")
                .ephemeral(true),
        );
        let _ = interaction.create_response(&ctx.http, reject).await;
        return true;
    }

    let verdict = if action == "accept" {
        sentinel.review.approve(guild_id, bot_id);
        format!("✅ Approved by <@{}>. Re-invite the bot; it will be let in.", interaction.user.id.get())
    } else {
        sentinel.review.deny(guild_id, bot_id);
        // In case the bot slipped back in meanwhile.
        let _ = guild_id
            .kick_with_reason(&ctx.http, bot_id, "Bot denied by review")
            .await;
        format!("⛔ Denied by <@{}>. The bot will be kicked on every join.", interaction.user.id.get())
    };

    let mut embeds: Vec<CreateEmbed> = interaction
        .message
        .embeds
        .iter()
        .cloned()
        .map(CreateEmbed::from)
        .collect();
    if let Some(first) = embeds.pop() {
        embeds.push(first.field("Verdict", verdict, false));
    }
    let update = CreateInteractionResponse::UpdateMessage(
        CreateInteractionResponseMessage::new()
            .embeds(embeds)
            .components(panel_buttons(guild_id, bot_id, true)),
    );
    if let Err(e) = interaction.create_response(&ctx.http, update).await {
        warn!(guild = guild_id.get(), error = %e, "review panel update failed");
    }
    true
}

/// `snl:<action>:<guild>:<bot>` grammar shared by the review buttons.
pub fn parse_review_custom_id(id: &str) -> Option<(&str, GuildId, UserId)> {
    let parts: Vec<&str> = id.split(':').collect();
    let [ns, action, guild_raw, bot_raw] = parts.as_slice() else {
        return None;
    };
    if *ns != "snl" {
        return None;
    }
    Some((
        *action,
        GuildId::new(guild_raw.parse().ok()?),
        UserId::new(bot_raw.parse().ok()?),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    const G: GuildId = GuildId::new(1);
    const B: UserId = UserId::new(99);

    #[test]
    fn decisions_are_mutually_exclusive() {
        let gate = ReviewGate::new(Duration::from_secs(60));
        assert_eq!(gate.decision(G, B), BotDecision::Unseen);
        gate.approve(G, B);
        assert_eq!(gate.decision(G, B), BotDecision::Approved);
        gate.deny(G, B);
        assert_eq!(gate.decision(G, B), BotDecision::Denied);
        gate.approve(G, B);
        assert_eq!(gate.decision(G, B), BotDecision::Approved);
    }

    #[test]
    fn approve_is_idempotent() {
        let gate = ReviewGate::new(Duration::from_secs(60));
        gate.approve(G, B);
        gate.approve(G, B);
        assert_eq!(gate.decision(G, B), BotDecision::Approved);
    }

    #[test]
    fn dedupe_suppresses_repeat_action() {
        let gate = ReviewGate::new(Duration::from_secs(60));
        assert!(gate.should_act(G, B));
        assert!(!gate.should_act(G, B));
        // A different bot is unaffected.
        assert!(gate.should_act(G, UserId::new(100)));
    }

    #[test]
    fn harmless_bots_are_not_kicked() {
        // Zero permissions and no standing denial: the join is left alone.
        assert!(!kick_on_sight(BotDecision::Unseen, Permissions::empty()));
        assert!(!kick_on_sight(
            BotDecision::Unseen,
            Permissions::SEND_MESSAGES | Permissions::EMBED_LINKS
        ));
        // Dangerous permissions or a denial force the kick.
        assert!(kick_on_sight(BotDecision::Unseen, Permissions::ADMINISTRATOR));
        assert!(kick_on_sight(BotDecision::Unseen, Permissions::MANAGE_WEBHOOKS));
        assert!(kick_on_sight(BotDecision::Denied, Permissions::empty()));
    }

    #[test]
    fn custom_id_parse() {
        let (action, g, b) = parse_review_custom_id("snl:accept:1:99").unwrap();
        assert_eq!((action, g, b), ("accept", G, B));
        assert!(parse_review_custom_id("thr:menu:1:2:3").is_none());
        assert!(parse_review_custom_id("snl:accept:x:99").is_none());
    }
}
