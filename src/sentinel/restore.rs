//! Posting restore capsules into the guild's log channel and replaying
//! them later. Replay goes through the `GuildApi` seam so the decision
//! logic is testable without a gateway.

use std::sync::Arc;
use std::time::Duration;

use serenity::async_trait;
use serenity::all::{
    ButtonStyle, ChannelId, ChannelType, ComponentInteraction, Context as SerenityContext,
    CreateChannel, EditChannel, EditMember, GuildId, MessageId, PermissionOverwrite,
    PermissionOverwriteType, Permissions, RoleId, UserId,
};
use serenity::builder::{
    CreateActionRow, CreateButton, CreateInteractionResponse, CreateInteractionResponseMessage,
    CreateMessage, EditMessage,
};
use tracing::warn;

use crate::AppContext;
use crate::sentinel::capsule::{Capsule, CapsuleError, CapsulePayload, ChannelSnapshot, extract_restore};
use crate::sentinel::whitelist::Scope;

/* =========================================
   Replay seam
   ========================================= */

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoleMeta {
    pub id: u64,
    pub managed: bool,
}

/// The slice of guild state replay needs. Production uses the serenity
/// implementation below; tests substitute an in-memory one.
#[async_trait]
pub trait GuildApi: Send + Sync {
    fn guild_id(&self) -> u64;
    fn existing_roles(&self) -> Vec<RoleMeta>;
    async fn fetch_member_roles(&self, user_id: u64) -> Option<Vec<u64>>;
    async fn set_member_roles(&self, user_id: u64, roles: Vec<u64>) -> bool;
    async fn create_channel(&self, snapshot: &ChannelSnapshot) -> Option<u64>;
    async fn set_channel_position(&self, channel_id: u64, position: u16) -> bool;
}

/// Replay a decoded capsule against live guild state. Roles deleted since
/// capture are silently dropped; managed roles the member still holds are
/// never taken away.
pub async fn replay<A: GuildApi>(api: &A, cap: &Capsule, now_ms: i64) -> Result<String, CapsuleError> {
    cap.validate(api.guild_id(), now_ms)?;

    match &cap.payload {
        CapsulePayload::MemberRoles {
            target_id,
            role_ids,
            managed_keep,
            ..
        } => {
            let current = api
                .fetch_member_roles(*target_id)
                .await
                .ok_or(CapsuleError::MemberNotFound)?;
            let existing = api.existing_roles();
            let alive = |id: &u64| existing.iter().any(|r| r.id == *id);
            let current_managed: Vec<u64> = current
                .iter()
                .filter(|id| existing.iter().any(|r| r.id == **id && r.managed))
                .copied()
                .collect();

            let mut desired: Vec<u64> = role_ids.iter().filter(|id| alive(id)).copied().collect();
            let dropped = role_ids.len() - desired.len();
            for id in managed_keep.iter().filter(|id| alive(id)).chain(current_managed.iter()) {
                if !desired.contains(id) {
                    desired.push(*id);
                }
            }

            if !api.set_member_roles(*target_id, desired.clone()).await {
                return Err(CapsuleError::MemberNotFound);
            }
            Ok(if dropped > 0 {
                format!(
                    "Restored {} role(s) to <@{target_id}> ({dropped} deleted since capture were skipped).",
                    desired.len()
                )
            } else {
                format!("Restored {} role(s) to <@{target_id}>.", desired.len())
            })
        }
        CapsulePayload::ChannelRecreate { channel, .. } => {
            let new_id = api
                .create_channel(channel)
                .await
                .ok_or(CapsuleError::ChannelCreateFailed)?;
            if let Some(pos) = channel.position {
                // Position is cosmetic; failure is acceptable.
                let _ = api.set_channel_position(new_id, pos).await;
            }
            Ok(format!("Recreated channel **#{}** as <#{new_id}>.", channel.name))
        }
    }
}

/* =========================================
   Serenity implementation
   ========================================= */

pub struct SerenityGuildApi<'a> {
    pub ctx: &'a SerenityContext,
    pub guild_id: GuildId,
}

#[async_trait]
impl GuildApi for SerenityGuildApi<'_> {
    fn guild_id(&self) -> u64 {
        self.guild_id.get()
    }

    fn existing_roles(&self) -> Vec<RoleMeta> {
        let Some(guild) = self.ctx.cache.guild(self.guild_id) else {
            return vec![];
        };
        guild
            .roles
            .values()
            .map(|r| RoleMeta {
                id: r.id.get(),
                managed: r.managed,
            })
            .collect()
    }

    async fn fetch_member_roles(&self, user_id: u64) -> Option<Vec<u64>> {
        let member = self
            .guild_id
            .member(&self.ctx.http, UserId::new(user_id))
            .await
            .ok()?;
        Some(member.roles.iter().map(|r| r.get()).collect())
    }

    async fn set_member_roles(&self, user_id: u64, roles: Vec<u64>) -> bool {
        let roles: Vec<RoleId> = roles.into_iter().map(RoleId::new).collect();
        self.guild_id
            .edit_member(&self.ctx.http, UserId::new(user_id), EditMember::new().roles(roles))
            .await
            .is_ok()
    }

    async fn create_channel(&self, snapshot: &ChannelSnapshot) -> Option<u64> {
        let kind = match snapshot.kind {
            2 => ChannelType::Voice,
            4 => ChannelType::Category,
            5 => ChannelType::News,
            13 => ChannelType::Stage,
            15 => ChannelType::Forum,
            _ => ChannelType::Text,
        };
        let overwrites: Vec<PermissionOverwrite> = snapshot
            .overwrites
            .iter()
            .map(|o| PermissionOverwrite {
                allow: Permissions::from_bits_truncate(o.allow),
                deny: Permissions::from_bits_truncate(o.deny),
                kind: if o.kind == "member" {
                    PermissionOverwriteType::Member(UserId::new(o.id))
                } else {
                    PermissionOverwriteType::Role(RoleId::new(o.id))
                },
            })
            .collect();

        let mut builder = CreateChannel::new(&snapshot.name)
            .kind(kind)
            .permissions(overwrites)
            .nsfw(snapshot.nsfw)
            .audit_log_reason("Restore capsule replay");
        if let Some(parent) = snapshot.parent_id {
            builder = builder.category(ChannelId::new(parent));
        }
        if let Some(topic) = &snapshot.topic {
            builder = builder.topic(topic);
        }
        if let Some(rate) = snapshot.rate_limit_per_user {
            builder = builder.rate_limit_per_user(rate);
        }
        if let Some(bitrate) = snapshot.bitrate {
            builder = builder.bitrate(bitrate);
        }
        if let Some(limit) = snapshot.user_limit {
            builder = builder.user_limit(limit);
        }

        self.guild_id
            .create_channel(&self.ctx.http, builder)
            .await
            .ok()
            .map(|c| c.id.get())
    }

    async fn set_channel_position(&self, channel_id: u64, position: u16) -> bool {
        ChannelId::new(channel_id)
            .edit(&self.ctx.http, EditChannel::new().position(position))
            .await
            .is_ok()
    }
}

/* =========================================
   Log channel and capsule posting
   ========================================= */

/// Find a text channel by name, creating it hidden from @everyone when
/// missing. Creation failure (missing Manage Channels) yields None.
pub async fn ensure_named_text_channel(
    ctx: &SerenityContext,
    guild_id: GuildId,
    name: &str,
    reason: &str,
) -> Option<ChannelId> {
    let (existing, owner_id, bot_id) = {
        let guild = ctx.cache.guild(guild_id)?;
        let found = guild
            .channels
            .values()
            .find(|c| c.kind == ChannelType::Text && c.name == name)
            .map(|c| c.id);
        (found, guild.owner_id, ctx.cache.current_user().id)
    };
    if let Some(id) = existing {
        return Some(id);
    }

    let everyone = RoleId::new(guild_id.get());
    let visible = Permissions::VIEW_CHANNEL | Permissions::READ_MESSAGE_HISTORY;
    let builder = CreateChannel::new(name)
        .kind(ChannelType::Text)
        .permissions(vec![
            PermissionOverwrite {
                allow: Permissions::empty(),
                deny: Permissions::VIEW_CHANNEL,
                kind: PermissionOverwriteType::Role(everyone),
            },
            PermissionOverwrite {
                allow: visible,
                deny: Permissions::empty(),
                kind: PermissionOverwriteType::Member(owner_id),
            },
            PermissionOverwrite {
                allow: visible | Permissions::SEND_MESSAGES,
                deny: Permissions::empty(),
                kind: PermissionOverwriteType::Member(bot_id),
            },
        ])
        .audit_log_reason(reason);

    match guild_id.create_channel(&ctx.http, builder).await {
        Ok(c) => Some(c.id),
        Err(e) => {
            warn!(guild = guild_id.get(), channel = name, error = %e, "log channel create failed");
            None
        }
    }
}

/// Post a capsule into the log channel with a Restore button addressing
/// the capsule's own message, then schedule its TTL deletion. The button
/// id is patched in after posting because the message id is only known
/// then.
pub async fn post_restore_capsule(
    ctx: &SerenityContext,
    app: &Arc<AppContext>,
    guild_id: GuildId,
    cap: &Capsule,
    note: Option<String>,
) -> Option<(ChannelId, MessageId)> {
    let cfg = &app.settings.sentinel;
    let channel_id =
        ensure_named_text_channel(ctx, guild_id, &cfg.capsules.log_channel, "Restore capsule log")
            .await?;

    let mut content = cap.message_content();
    if let Some(note) = note {
        content = format!("{note}\n{content}");
    }
    let msg = match channel_id
        .send_message(&ctx.http, CreateMessage::new().content(content))
        .await
    {
        Ok(m) => m,
        Err(e) => {
            warn!(guild = guild_id.get(), error = %e, "capsule post failed");
            return None;
        }
    };

    let button = CreateActionRow::Buttons(vec![
        CreateButton::new(format!("snl:restorecap:{}:{}", channel_id.get(), msg.id.get()))
            .label("Restore")
            .style(ButtonStyle::Primary),
    ]);
    let _ = channel_id
        .edit_message(&ctx.http, msg.id, EditMessage::new().components(vec![button]))
        .await;

    let http = ctx.http.clone();
    let ttl = Duration::from_secs(cfg.capsules.ttl_secs);
    let msg_id = msg.id;
    tokio::spawn(async move {
        tokio::time::sleep(ttl).await;
        let _ = channel_id.delete_message(&http, msg_id).await;
    });

    Some((channel_id, msg.id))
}

/// `snl:restorecap:{channel}:{message}` button: fetch the capsule message,
/// decode, replay, report. All failure modes map to a short user-facing
/// line.
pub async fn handle_button(
    ctx: &SerenityContext,
    app: &Arc<AppContext>,
    interaction: &ComponentInteraction,
) -> bool {
    let parts: Vec<&str> = interaction.data.custom_id.split(':').collect();
    let [ns, action, channel_raw, msg_raw] = parts.as_slice() else {
        return false;
    };
    if *ns != "snl" || *action != "restorecap" {
        return false;
    }
    let (Ok(channel_id), Ok(msg_id)) = (channel_raw.parse::<u64>(), msg_raw.parse::<u64>()) else {
        return false;
    };
    let Some(guild_id) = interaction.guild_id else {
        return true;
    };

    let sentinel = app.sentinel();
    let owner_id = {
        let Some(guild) = ctx.cache.guild(guild_id) else {
            return true;
        };
        guild.owner_id
    };
    let reply = if !sentinel
        .whitelist
        .has_scope(guild_id, owner_id, interaction.user.id, Scope::Restore)
    {
        "You need the `restore` whitelist scope to replay capsules.".to_string()
    } else {
        run_replay(ctx, guild_id, ChannelId::new(channel_id), MessageId::new(msg_id)).await
    };

    let resp = CreateInteractionResponse::Message(
        CreateInteractionResponseMessage::new()
            .content(reply)
            .ephemeral(true),
    );
    let _ = interaction.create_response(&ctx.http, resp).await;
    true
}

async fn run_replay(
    ctx: &SerenityContext,
    guild_id: GuildId,
    channel_id: ChannelId,
    msg_id: MessageId,
) -> String {
    let Ok(message) = channel_id.message(&ctx.http, msg_id).await else {
        return format!("❌ {}", CapsuleError::MessageMissing);
    };
    let Some(b64) = extract_restore(&message.content) else {
        return format!("❌ {}", CapsuleError::PayloadMissing);
    };
    let cap = match Capsule::decode(b64) {
        Ok(c) => c,
        Err(e) => return format!("❌ {e}"),
    };
    let api = SerenityGuildApi { ctx, guild_id };
    let now_ms = chrono::Utc::now().timestamp_millis();
    match replay(&api, &cap, now_ms).await {
        Ok(summary) => format!("✅ {summary}"),
        Err(e) => format!("❌ {e}"),
    }
}

/// Snapshot + capsule + panel for a just-deleted channel.
pub async fn on_channel_deleted(
    ctx: &SerenityContext,
    app: &Arc<AppContext>,
    guild_id: GuildId,
    snapshot: ChannelSnapshot,
    executor_id: Option<UserId>,
) {
    let cfg = &app.settings.sentinel;
    let name = snapshot.name.clone();
    let cap = Capsule::new(
        guild_id.get(),
        format!("Recreate channel #{name}"),
        (cfg.capsules.ttl_secs * 1000) as i64,
        CapsulePayload::ChannelRecreate {
            channel: snapshot,
            reason: "Channel deleted".into(),
            executor_id: executor_id.map(|u| u.get()),
        },
    );
    let owner_ping = ctx
        .cache
        .guild(guild_id)
        .map(|g| format!("<@{}> ", g.owner_id.get()))
        .unwrap_or_default();
    let note = match executor_id {
        Some(id) => format!("{owner_ping}🗑️ **#{name}** was deleted by <@{}>.", id.get()),
        None => format!("{owner_ping}🗑️ **#{name}** was deleted."),
    };
    let _ = post_restore_capsule(ctx, app, guild_id, &cap, Some(note)).await;
}
