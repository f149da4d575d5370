//! Threat text scanner: first-match classification of message content
//! against fixed rule sets, deletion of the offending message, and a
//! durable threat capsule with moderation buttons in the threats channel.

use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serenity::all::{
    ButtonStyle, ChannelId, ComponentInteraction, Context as SerenityContext, EditMember, GuildId,
    Message, MessageId, RoleId, Timestamp, UserId,
};
use serenity::builder::{
    CreateActionRow, CreateButton, CreateEmbed, CreateInteractionResponse,
    CreateInteractionResponseMessage, CreateMessage, EditMessage,
};
use tracing::{info, warn};
use unicode_normalization::UnicodeNormalization;

use crate::AppContext;
use crate::sentinel::capsule::{CAPSULE_VERSION, THREAT_CONTENT_MAX, ThreatCapsule, extract_threat};
use crate::sentinel::restore::ensure_named_text_channel;
use crate::sentinel::whitelist::Scope;

/// Content excerpt cap inside embeds; the full (capped) text lives in the
/// capsule itself.
const EMBED_EXCERPT_MAX: usize = 900;

pub struct ThreatRule {
    pub key: &'static str,
    pub title: &'static str,
    pub severity: &'static str,
    patterns: Vec<Regex>,
}

static THREAT_RULES: Lazy<Vec<ThreatRule>> = Lazy::new(|| {
    let rule = |key, title, severity, pats: &[&str]| ThreatRule {
        key,
        title,
        severity,
        patterns: pats.iter().map(|p| Regex::new(p).unwrap()).collect(),
    };
    vec![
        rule(
            "nuking",
            "Nuking / Server Destruction Threat",
            "HIGH",
            &[
                r"(?i)\bnuk(e|ing)\b",
                r"(?i)\bnuke\s+the\s+server\b",
                r"(?i)\bdelete\s+all\s+(channels|roles)\b",
                r"(?i)\bmass\s+ban\b",
                r"(?i)\bwipe\s+the\s+server\b",
                r"(?i)\braid\b",
            ],
        ),
        rule(
            "violence",
            "Violence / Murder Threat",
            "CRITICAL",
            &[
                r"(?i)\b(i('|’)m|im)\s+going\s+to\s+kill\b",
                r"(?i)\bkill\s+you\b",
                r"(?i)\bmurder\b",
                r"(?i)\bshoot\b",
                r"(?i)\bstab\b",
                r"(?i)\b(i('|’)ll|ill)\s+end\s+you\b",
            ],
        ),
        rule(
            "selfharm",
            "Self-harm / Suicide Threat",
            "CRITICAL",
            &[
                r"(?i)\bsuicid(e|al)\b",
                r"(?i)\bkill\s+myself\b",
                r"(?i)\bend\s+my\s+life\b",
                r"(?i)\bself\s*harm\b",
                r"(?i)\b(i('|’)m|im)\s+done\s+with\s+life\b",
            ],
        ),
    ]
});

/// First rule whose any pattern matches the NFKC-folded text.
pub fn classify(text: &str) -> Option<&'static ThreatRule> {
    let folded: String = text.nfkc().collect();
    THREAT_RULES
        .iter()
        .find(|rule| rule.patterns.iter().any(|p| p.is_match(&folded)))
}

/// Per-(guild, author) suppression so one outburst produces one capsule.
pub struct ThreatWatch {
    dedupe: moka::sync::Cache<(u64, u64), ()>,
}

impl ThreatWatch {
    pub fn new(dedupe_ttl: Duration) -> Self {
        Self {
            dedupe: moka::sync::Cache::builder()
                .time_to_live(dedupe_ttl)
                .build(),
        }
    }

    pub fn should_log(&self, guild_id: GuildId, author_id: UserId) -> bool {
        let key = (guild_id.get(), author_id.get());
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

fn log_buttons(
    guild_id: GuildId,
    channel_id: ChannelId,
    log_msg_id: MessageId,
    author_id: UserId,
    disabled: bool,
) -> Vec<CreateActionRow> {
    let tail = format!(
        "{}:{}:{}:{}",
        guild_id.get(),
        channel_id.get(),
        log_msg_id.get(),
        author_id.get()
    );
    vec![CreateActionRow::Buttons(vec![
        CreateButton::new(format!("thr:menu:{tail}"))
            .label("Actions")
            .style(ButtonStyle::Danger)
            .disabled(disabled),
        CreateButton::new(format!("thr:ignore:{tail}"))
            .label("Ignore")
            .style(ButtonStyle::Secondary)
            .disabled(disabled),
        CreateButton::new(format!("thr:info:{tail}"))
            .label("User Info")
            .style(ButtonStyle::Primary)
            .disabled(disabled),
    ])]
}

/// Role mentions for the info card, capped at Discord's 25-role field.
fn role_mentions(roles: &[RoleId]) -> String {
    if roles.is_empty() {
        return "none".to_string();
    }
    roles
        .iter()
        .take(25)
        .map(|r| format!("<@&{}>", r.get()))
        .collect::<Vec<_>>()
        .join(" ")
}

fn excerpt(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let cut: String = text.chars().take(max).collect();
    format!("{cut}…")
}

/// Scan a guild message. On a hit: delete it, then (unless deduped) post
/// a threat capsule with the action panel.
pub async fn on_message(ctx: &SerenityContext, app: &Arc<AppContext>, msg: &Message) {
    if msg.author.bot {
        return;
    }
    let Some(guild_id) = msg.guild_id else {
        return;
    };
    if msg.content.starts_with(&app.settings.discord.prefix) {
        return;
    }
    let Some(rule) = classify(&msg.content) else {
        return;
    };

    let sentinel = app.sentinel();
    let owner_id = {
        let Some(guild) = ctx.cache.guild(guild_id) else {
            return;
        };
        guild.owner_id
    };
    if sentinel
        .whitelist
        .has_scope(guild_id, owner_id, msg.author.id, Scope::Threats)
    {
        return;
    }

    let deleted = msg.delete(&ctx.http).await.is_ok();
    info!(
        guild = guild_id.get(),
        author = msg.author.id.get(),
        rule = rule.key,
        deleted,
        "threat detected"
    );

    if !sentinel.threats.should_log(guild_id, msg.author.id) {
        return;
    }

    let cfg = &app.settings.sentinel;
    let Some(channel_id) =
        ensure_named_text_channel(ctx, guild_id, &cfg.threats.channel, "Threat log").await
    else {
        return;
    };

    let now = chrono::Utc::now().timestamp_millis();
    let mut cap = ThreatCapsule {
        v: CAPSULE_VERSION,
        guild_id: guild_id.get(),
        at: now,
        expires_at: now + (cfg.threats.ttl_secs * 1000) as i64,
        category: rule.key.into(),
        category_title: rule.title.into(),
        severity: rule.severity.into(),
        deleted,
        author_id: msg.author.id.get(),
        author_tag: msg.author.tag(),
        channel_id: msg.channel_id.get(),
        message_id: msg.id.get(),
        content: excerpt(&msg.content, THREAT_CONTENT_MAX),
        ignored: false,
        actions: vec![],
    };

    let embed = threat_embed(&cap);
    let post = CreateMessage::new().content(cap.message_content()).embed(embed);
    let log_msg = match channel_id.send_message(&ctx.http, post).await {
        Ok(m) => m,
        Err(e) => {
            warn!(guild = guild_id.get(), error = %e, "threat log post failed");
            return;
        }
    };

    // The buttons address the log message itself, so they are patched in
    // once its id exists. message_id in the capsule switches to the log
    // message too; the original is gone.
    cap.message_id = log_msg.id.get();
    let edit = EditMessage::new()
        .content(cap.message_content())
        .components(log_buttons(guild_id, channel_id, log_msg.id, msg.author.id, false));
    let _ = channel_id.edit_message(&ctx.http, log_msg.id, edit).await;

    let http = ctx.http.clone();
    let ttl = Duration::from_secs(cfg.threats.ttl_secs);
    let log_id = log_msg.id;
    tokio::spawn(async move {
        tokio::time::sleep(ttl).await;
        let _ = channel_id.delete_message(&http, log_id).await;
    });
}

fn threat_embed(cap: &ThreatCapsule) -> CreateEmbed {
    CreateEmbed::new()
        .title(format!("⚠️ {}", cap.category_title))
        .field("Severity", format!("`{}`", cap.severity), true)
        .field("Author", format!("<@{}> (`{}`)", cap.author_id, cap.author_tag), true)
        .field("Channel", format!("<#{}>", cap.channel_id), true)
        .field("Message", excerpt(&cap.content, EMBED_EXCERPT_MAX), false)
        .field(
            "Original message",
            if cap.deleted { "deleted" } else { "deletion failed" },
            true,
        )
}

struct ThreatRef {
    guild_id: GuildId,
    channel_id: ChannelId,
    log_msg_id: MessageId,
    author_id: UserId,
}

fn parse_tail(parts: &[&str]) -> Option<ThreatRef> {
    let [g, c, m, u] = parts else {
        return None;
    };
    Some(ThreatRef {
        guild_id: GuildId::new(g.parse().ok()?),
        channel_id: ChannelId::new(c.parse().ok()?),
        log_msg_id: MessageId::new(m.parse().ok()?),
        author_id: UserId::new(u.parse().ok()?),
    })
}

/// `thr:*` (panel) and `thr2:*` (action menu) buttons.
pub async fn handle_button(
    ctx: &SerenityContext,
    app: &Arc<AppContext>,
    interaction: &ComponentInteraction,
) -> bool {
    let parts: Vec<&str> = interaction.data.custom_id.split(':').collect();
    match parts.as_slice() {
        ["thr", action @ ("menu" | "ignore" | "info"), tail @ ..] => {
            let Some(r) = parse_tail(tail) else {
                return false;
            };
            handle_panel(ctx, app, interaction, action, r).await;
            true
        }
        ["thr2", action, tail @ ..] => {
            let Some(r) = parse_tail(tail) else {
                return false;
            };
            handle_action(ctx, app, interaction, action, r).await;
            true
        }
        _ => false,
    }
}

async fn authorized(
    ctx: &SerenityContext,
    app: &Arc<AppContext>,
    interaction: &ComponentInteraction,
    guild_id: GuildId,
) -> bool {
    let owner_id = {
        let Some(guild) = ctx.cache.guild(guild_id) else {
            return false;
        };
        guild.owner_id
    };
    if app
        .sentinel()
        .whitelist
        .has_scope(guild_id, owner_id, interaction.user.id, Scope::Threats)
    {
        return true;
    }
    let reject = CreateInteractionResponse::Message(
        CreateInteractionResponseMessage::new()
            .content("You need the `threats` whitelist scope to act on threat logs.")
            .ephemeral(true),
    );
    let _ = interaction.create_response(&ctx.http, reject).await;
    false
}

async fn handle_panel(
    ctx: &SerenityContext,
    app: &Arc<AppContext>,
    interaction: &ComponentInteraction,
    action: &str,
    r: ThreatRef,
) {
    if !authorized(ctx, app, interaction, r.guild_id).await {
        return;
    }
    match action {
        "menu" => {
            let tail = format!(
                "{}:{}:{}:{}",
                r.guild_id.get(),
                r.channel_id.get(),
                r.log_msg_id.get(),
                r.author_id.get()
            );
            let rows = vec![
                CreateActionRow::Buttons(vec![
                    CreateButton::new(format!("thr2:timeout10m:{tail}"))
                        .label("Timeout 10m")
                        .style(ButtonStyle::Secondary),
                    CreateButton::new(format!("thr2:timeout1h:{tail}"))
                        .label("Timeout 1h")
                        .style(ButtonStyle::Secondary),
                    CreateButton::new(format!("thr2:timeout24h:{tail}"))
                        .label("Timeout 24h")
                        .style(ButtonStyle::Secondary),
                ]),
                CreateActionRow::Buttons(vec![
                    CreateButton::new(format!("thr2:kick:{tail}"))
                        .label("Kick")
                        .style(ButtonStyle::Danger),
                    CreateButton::new(format!("thr2:ban:{tail}"))
                        .label("Ban")
                        .style(ButtonStyle::Danger),
                    CreateButton::new(format!("thr2:dismiss:{tail}"))
                        .label("Dismiss")
                        .style(ButtonStyle::Secondary),
                ]),
            ];
            let menu = CreateInteractionResponse::Message(
                CreateInteractionResponseMessage::new()
                    .content(format!("Moderation actions for <@{}>:", r.author_id.get()))
                    .components(rows)
                    .ephemeral(true),
            );
            let _ = interaction.create_response(&ctx.http, menu).await;
        }
        "ignore" => {
            let note = match amend_capsule(ctx, &r, |cap| {
                cap.ignored = true;
                cap.push_action(interaction.user.id.get(), "Ignored");
            })
            .await
            {
                Some(cap) => {
                    let edit = EditMessage::new()
                        .content(cap.message_content())
                        .components(log_buttons(
                            r.guild_id,
                            r.channel_id,
                            r.log_msg_id,
                            r.author_id,
                            true,
                        ));
                    let _ = r.channel_id.edit_message(&ctx.http, r.log_msg_id, edit).await;
                    "Marked ignored; panel closed.".to_string()
                }
                None => "Capsule message is gone or unreadable.".to_string(),
            };
            let resp = CreateInteractionResponse::Message(
                CreateInteractionResponseMessage::new().content(note).ephemeral(true),
            );
            let _ = interaction.create_response(&ctx.http, resp).await;
        }
        "info" => {
            let user = r.author_id.to_user(&ctx.http).await.ok();
            let member = r.guild_id.member(&ctx.http, r.author_id).await.ok();
            let embed = match user {
                Some(u) => {
                    let created = u.id.created_at().unix_timestamp();
                    let joined = member
                        .as_ref()
                        .and_then(|m| m.joined_at)
                        .map(|t| format!("<t:{}:R>", t.unix_timestamp()))
                        .unwrap_or_else(|| "unknown".to_string());
                    let roles = member
                        .as_ref()
                        .map(|m| role_mentions(&m.roles))
                        .unwrap_or_else(|| "not a member".to_string());
                    CreateEmbed::new()
                        .title(format!("User info: {}", u.tag()))
                        .field("Id", format!("`{}`", u.id.get()), true)
                        .field("Created", format!("<t:{created}:R>"), true)
                        .field("Joined", joined, true)
                        .field("Bot", if u.bot { "yes" } else { "no" }, true)
                        .field("Roles", roles, false)
                }
                None => CreateEmbed::new()
                    .title("User info")
                    .description("User could not be fetched."),
            };
            let resp = CreateInteractionResponse::Message(
                CreateInteractionResponseMessage::new().embed(embed).ephemeral(true),
            );
            let _ = interaction.create_response(&ctx.http, resp).await;
        }
        _ => {}
    }
}

async fn handle_action(
    ctx: &SerenityContext,
    app: &Arc<AppContext>,
    interaction: &ComponentInteraction,
    action: &str,
    r: ThreatRef,
) {
    if !authorized(ctx, app, interaction, r.guild_id).await {
        return;
    }

    let (label, outcome) = match action {
        "timeout10m" => ("Timeout 10m", timeout(ctx, &r, 10 * 60).await),
        "timeout1h" => ("Timeout 1h", timeout(ctx, &r, 60 * 60).await),
        "timeout24h" => ("Timeout 24h", timeout(ctx, &r, 24 * 60 * 60).await),
        "kick" => (
            "Kick",
            r.guild_id
                .kick_with_reason(&ctx.http, r.author_id, "Threatening message")
                .await
                .is_ok(),
        ),
        "ban" => (
            "Ban",
            r.guild_id
                .ban_with_reason(&ctx.http, r.author_id, 0, "Threatening message")
                .await
                .is_ok(),
        ),
        // Dismiss changes nothing about the member but is still part of
        // the capsule's action log.
        "dismiss" => ("Dismissed", true),
        _ => return,
    };

    if outcome {
        let by = interaction.user.id.get();
        if let Some(cap) = amend_capsule(ctx, &r, |cap| cap.push_action(by, label)).await {
            let edit = EditMessage::new().content(cap.message_content());
            let _ = r.channel_id.edit_message(&ctx.http, r.log_msg_id, edit).await;
        }
    }

    let note = if !outcome {
        format!("❌ {label} failed (permissions/hierarchy?).")
    } else if action == "dismiss" {
        "Dismissed.".to_string()
    } else {
        format!("✅ {label} applied to <@{}>.", r.author_id.get())
    };
    let resp = CreateInteractionResponse::Message(
        CreateInteractionResponseMessage::new().content(note).ephemeral(true),
    );
    let _ = interaction.create_response(&ctx.http, resp).await;
}

async fn timeout(ctx: &SerenityContext, r: &ThreatRef, secs: i64) -> bool {
    let until = chrono::Utc::now().timestamp() + secs;
    let Ok(ts) = Timestamp::from_unix_timestamp(until) else {
        return false;
    };
    r.guild_id
        .edit_member(
            &ctx.http,
            r.author_id,
            EditMember::new()
                .disable_communication_until_datetime(ts)
                .audit_log_reason("Threatening message"),
        )
        .await
        .is_ok()
}

/// Fetch the capsule message, apply `f`, return the amended capsule. The
/// caller writes it back.
async fn amend_capsule<F>(ctx: &SerenityContext, r: &ThreatRef, f: F) -> Option<ThreatCapsule>
where
    F: FnOnce(&mut ThreatCapsule),
{
    let message = r.channel_id.message(&ctx.http, r.log_msg_id).await.ok()?;
    let b64 = extract_threat(&message.content)?;
    let mut cap = ThreatCapsule::decode(b64).ok()?;
    f(&mut cap);
    Some(cap)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nuking_rule_matches_first() {
        let rule = classify("we are going to nuke this server").unwrap();
        assert_eq!(rule.key, "nuking");
        assert_eq!(rule.severity, "HIGH");
    }

    #[test]
    fn selfharm_is_critical() {
        let rule = classify("i will kill myself").unwrap();
        assert_eq!(rule.key, "selfharm");
        assert_eq!(rule.severity, "CRITICAL");
    }

    #[test]
    fn violence_with_curly_apostrophe() {
        let rule = classify("i’m going to kill you").unwrap();
        assert_eq!(rule.key, "violence");
    }

    #[test]
    fn benign_text_passes() {
        assert!(classify("let's play some games tonight").is_none());
        assert!(classify("").is_none());
        // Word boundaries: no substring hits.
        assert!(classify("nuclear family braids").is_none());
    }

    #[test]
    fn nfkc_fold_catches_fullwidth() {
        // Fullwidth letters normalize to ASCII under NFKC.
        assert!(classify("ｒａｉｄ").is_some());
    }

    #[test]
    fn dedupe_is_per_author() {
        let w = ThreatWatch::new(Duration::from_secs(25));
        let g = GuildId::new(1);
        assert!(w.should_log(g, UserId::new(1)));
        assert!(!w.should_log(g, UserId::new(1)));
        assert!(w.should_log(g, UserId::new(2)));
    }

    #[test]
    fn role_mentions_cap_at_twenty_five() {
        assert_eq!(role_mentions(&[]), "none");
        let roles: Vec<RoleId> = (1..=30).map(RoleId::new).collect();
        let s = role_mentions(&roles);
        assert_eq!(s.matches("<@&").count(), 25);
        assert!(s.starts_with("<@&1>"));
    }

    #[test]
    fn dismiss_lands_in_the_action_log() {
        let now = chrono::Utc::now().timestamp_millis();
        let mut cap = ThreatCapsule {
            v: CAPSULE_VERSION,
            guild_id: 1,
            at: now,
            expires_at: now + 1000,
            category: "nuking".into(),
            category_title: "Nuking / Server Destruction Threat".into(),
            severity: "HIGH".into(),
            deleted: true,
            author_id: 2,
            author_tag: "user".into(),
            channel_id: 3,
            message_id: 4,
            content: "raid".into(),
            ignored: false,
            actions: vec![],
        };
        cap.push_action(9, "Dismissed");
        // Survives the wire format like every other action.
        let round = ThreatCapsule::decode(extract_threat(&cap.message_content()).unwrap()).unwrap();
        assert_eq!(round.actions.len(), 1);
        assert_eq!(round.actions[0].action, "Dismissed");
        assert_eq!(round.actions[0].by, 9);
    }

    #[test]
    fn excerpt_caps_on_char_boundary() {
        let long = "ą".repeat(1000);
        let e = excerpt(&long, 900);
        assert_eq!(e.chars().count(), 901);
        assert!(e.ends_with('…'));
        assert_eq!(excerpt("short", 900), "short");
    }
}
