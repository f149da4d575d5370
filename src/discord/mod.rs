//! Gateway event fan-out. Each handler attributes the event to its
//! executor through the audit log, feeds the abuse counters, and hands
//! off to the matching sentinel module.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serenity::all::{
    ChannelId, ChannelType, Context, EventHandler, GatewayIntents, GuildChannel, GuildId,
    GuildMemberUpdateEvent, Interaction, Member, Message, PermissionOverwriteType, Ready, Role,
    RoleId, User, UserId,
};
use serenity::model::guild::audit_log;
use serenity::async_trait;
use tracing::{error, info};

use crate::AppContext;
use crate::permissions;
use crate::sentinel::capsule::{ChannelSnapshot, OverwriteSnapshot};
use crate::sentinel::{
    ActionKind, BumpOutcome, audit_executor, commands, restore, review, rolestrip, threats,
};

pub struct Handler {
    pub app: Arc<AppContext>,
}

impl Handler {
    /// Attribute a destructive event and feed the counter. Runs lockdown
    /// when the bump crosses the limit. Returns the executor when one was
    /// found, for handlers that also want to show it.
    async fn count(
        &self,
        ctx: &Context,
        guild_id: GuildId,
        kind: ActionKind,
        audit_kinds: &[audit_log::Action],
        target: Option<u64>,
    ) -> Option<UserId> {
        let (owner_id, bot_id) = {
            let guild = ctx.cache.guild(guild_id)?;
            (guild.owner_id, ctx.cache.current_user().id)
        };
        let max_age = Duration::from_secs(self.app.settings.sentinel.attribution_max_age_secs);
        let executor_id = audit_executor(ctx, guild_id, audit_kinds, target, max_age).await?;

        let sentinel = self.app.sentinel();
        match sentinel.bump(guild_id, owner_id, bot_id, executor_id, kind) {
            BumpOutcome::Lockdown { kind, count } => {
                sentinel
                    .lockdown(ctx, guild_id, executor_id, kind, count)
                    .await;
            }
            BumpOutcome::Counted(_) | BumpOutcome::Ignored => {}
        }
        Some(executor_id)
    }
}

/// Discord's channel type discriminants, mirrored by the replay side.
fn channel_kind_code(kind: ChannelType) -> u8 {
    match kind {
        ChannelType::Voice => 2,
        ChannelType::Category => 4,
        ChannelType::News => 5,
        ChannelType::Stage => 13,
        ChannelType::Forum => 15,
        _ => 0,
    }
}

fn snapshot_channel(channel: &GuildChannel) -> ChannelSnapshot {
    ChannelSnapshot {
        id: channel.id.get(),
        name: channel.name.clone(),
        kind: channel_kind_code(channel.kind),
        parent_id: channel.parent_id.map(|p| p.get()),
        position: Some(channel.position),
        overwrites: channel
            .permission_overwrites
            .iter()
            .map(|o| OverwriteSnapshot {
                id: match o.kind {
                    PermissionOverwriteType::Member(id) => id.get(),
                    PermissionOverwriteType::Role(id) => id.get(),
                    _ => 0,
                },
                kind: match o.kind {
                    PermissionOverwriteType::Member(_) => "member".into(),
                    _ => "role".into(),
                },
                allow: o.allow.bits(),
                deny: o.deny.bits(),
            })
            .collect(),
        topic: channel.topic.clone(),
        nsfw: channel.nsfw,
        rate_limit_per_user: channel.rate_limit_per_user,
        bitrate: channel.bitrate,
        user_limit: channel.user_limit,
    }
}

#[async_trait]
impl EventHandler for Handler {
    async fn ready(&self, _ctx: Context, ready: Ready) {
        info!(user = %ready.user.name, guilds = ready.guilds.len(), "gateway ready");
    }

    async fn message(&self, ctx: Context, msg: Message) {
        if commands::on_message(&ctx, &self.app, &msg).await {
            return;
        }
        threats::on_message(&ctx, &self.app, &msg).await;
    }

    async fn interaction_create(&self, ctx: Context, interaction: Interaction) {
        let Interaction::Component(component) = interaction else {
            return;
        };
        if review::handle_button(&ctx, &self.app, &component).await {
            return;
        }
        if rolestrip::handle_button(&ctx, &self.app, &component).await {
            return;
        }
        if restore::handle_button(&ctx, &self.app, &component).await {
            return;
        }
        let _ = threats::handle_button(&ctx, &self.app, &component).await;
    }

    async fn channel_create(&self, ctx: Context, channel: GuildChannel) {
        let _ = self
            .count(
                &ctx,
                channel.guild_id,
                ActionKind::ChannelCreate,
                &[audit_log::Action::Channel(audit_log::ChannelAction::Create)],
                Some(channel.id.get()),
            )
            .await;
    }

    async fn channel_delete(&self, ctx: Context, channel: GuildChannel, _messages: Option<Vec<Message>>) {
        let kind = if channel.kind == ChannelType::Category {
            ActionKind::CategoryDelete
        } else {
            ActionKind::ChannelDelete
        };
        let executor = self
            .count(
                &ctx,
                channel.guild_id,
                kind,
                &[audit_log::Action::Channel(audit_log::ChannelAction::Delete)],
                Some(channel.id.get()),
            )
            .await;

        // Every deleted channel gets a capsule, categories included; their
        // name, overwrites and position replay like any other channel.
        let snapshot = snapshot_channel(&channel);
        restore::on_channel_deleted(&ctx, &self.app, channel.guild_id, snapshot, executor).await;
    }

    async fn channel_update(&self, ctx: Context, old: Option<GuildChannel>, new: GuildChannel) {
        let overwrites_changed = old
            .map(|o| o.permission_overwrites != new.permission_overwrites)
            .unwrap_or(true);
        if !overwrites_changed {
            return;
        }
        let _ = self
            .count(
                &ctx,
                new.guild_id,
                ActionKind::ChannelPermEdit,
                &[
                    audit_log::Action::ChannelOverwrite(audit_log::ChannelOverwriteAction::Create),
                    audit_log::Action::ChannelOverwrite(audit_log::ChannelOverwriteAction::Update),
                    audit_log::Action::ChannelOverwrite(audit_log::ChannelOverwriteAction::Delete),
                ],
                Some(new.id.get()),
            )
            .await;
    }

    async fn guild_role_create(&self, ctx: Context, new: Role) {
        let _ = self
            .count(
                &ctx,
                new.guild_id,
                ActionKind::RoleCreate,
                &[audit_log::Action::Role(audit_log::RoleAction::Create)],
                Some(new.id.get()),
            )
            .await;
    }

    async fn guild_role_delete(
        &self,
        ctx: Context,
        guild_id: GuildId,
        removed_role_id: RoleId,
        _removed_role: Option<Role>,
    ) {
        let _ = self
            .count(
                &ctx,
                guild_id,
                ActionKind::RoleDelete,
                &[audit_log::Action::Role(audit_log::RoleAction::Delete)],
                Some(removed_role_id.get()),
            )
            .await;
    }

    async fn guild_role_update(&self, ctx: Context, old: Option<Role>, new: Role) {
        // Only edits granting a dangerous flag feed the counter; cosmetic
        // permission changes are free. Without the old role (cold cache)
        // the new permission set alone decides.
        let gained_danger = match &old {
            Some(o) => permissions::gained_dangerous(o.permissions, new.permissions),
            None => permissions::has_dangerous(new.permissions),
        };
        if !gained_danger {
            return;
        }
        let _ = self
            .count(
                &ctx,
                new.guild_id,
                ActionKind::RolePermEdit,
                &[audit_log::Action::Role(audit_log::RoleAction::Update)],
                Some(new.id.get()),
            )
            .await;
    }

    async fn guild_ban_addition(&self, ctx: Context, guild_id: GuildId, banned_user: User) {
        let _ = self
            .count(
                &ctx,
                guild_id,
                ActionKind::MemberBan,
                &[audit_log::Action::Member(audit_log::MemberAction::BanAdd)],
                Some(banned_user.id.get()),
            )
            .await;
    }

    async fn webhook_update(&self, ctx: Context, guild_id: GuildId, _channel_id: ChannelId) {
        // The gateway does not say which webhook operation happened; any
        // fresh webhook audit entry counts.
        let _ = self
            .count(
                &ctx,
                guild_id,
                ActionKind::WebhookChange,
                &[
                    audit_log::Action::Webhook(audit_log::WebhookAction::Create),
                    audit_log::Action::Webhook(audit_log::WebhookAction::Update),
                    audit_log::Action::Webhook(audit_log::WebhookAction::Delete),
                ],
                None,
            )
            .await;
    }

    async fn guild_member_addition(&self, ctx: Context, new_member: Member) {
        if new_member.user.bot {
            review::on_bot_member_add(&ctx, &self.app, &new_member).await;
        }
    }

    async fn guild_member_update(
        &self,
        ctx: Context,
        old: Option<Member>,
        new: Option<Member>,
        _event: GuildMemberUpdateEvent,
    ) {
        let Some(new) = new else {
            return;
        };
        if new.user.bot {
            review::on_bot_member_update(&ctx, &self.app, &new).await;
            return;
        }
        let Some(old) = old else {
            return;
        };
        rolestrip::on_member_roles_removed(&ctx, &self.app, &old, &new).await;
        rolestrip::on_admin_grant(&ctx, &self.app, &old, &new).await;
    }
}

pub fn default_gateway_intents() -> GatewayIntents {
    GatewayIntents::GUILDS
        | GatewayIntents::GUILD_MEMBERS
        | GatewayIntents::GUILD_MESSAGES
        | GatewayIntents::MESSAGE_CONTENT
        | GatewayIntents::GUILD_MODERATION
        | GatewayIntents::GUILD_WEBHOOKS
}

pub async fn run_bot(app: Arc<AppContext>) -> Result<()> {
    let token = app.settings.discord.token.clone();
    let mut client = serenity::Client::builder(&token, default_gateway_intents())
        .event_handler(Handler { app })
        .await?;
    if let Err(e) = client.start().await {
        error!(error = %e, "gateway client stopped");
        return Err(e.into());
    }
    Ok(())
}
