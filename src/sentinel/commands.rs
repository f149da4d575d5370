//! Prefix text commands for whitelist administration. Parsing and
//! replies are pure; the Discord glue at the bottom only ships the
//! resulting string back.

use std::sync::Arc;

use serenity::all::{Context as SerenityContext, GuildId, Message, UserId};
use serenity::builder::CreateMessage;

use crate::AppContext;
use crate::sentinel::whitelist::{Whitelist, format_scopes, normalize_scopes};

/// Mention or raw snowflake. Discord ids are 17-19 digits today; accept a
/// small margin.
pub fn parse_user_token(token: &str) -> Option<UserId> {
    let raw = token
        .trim()
        .trim_start_matches("<@!")
        .trim_start_matches("<@")
        .trim_end_matches('>');
    if raw.len() < 16 || raw.len() > 22 || !raw.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    raw.parse().ok().map(UserId::new)
}

fn help_text(prefix: &str) -> String {
    format!(
        "**Sentinel whitelist commands**\n\
         `{p}whitelist @user <scopes…>` — grant scopes (`roles`, `channels`, `webhooks`, `bans`, `admin`, `restore`, `bot-adds`, `threats`, `all`)\n\
         `{p}whitelist list` — show whitelisted users\n\
         `{p}removewhitelist @user [scopes…]` — revoke scopes (none given removes the user)\n\
         `{p}wlman add/remove @user` — manage who may edit the whitelist\n\
         `{p}wlman list` — show whitelist managers\n\
         `{p}help` — this message",
        p = prefix
    )
}

/// Dispatch one prefixed message. Returns None when the content is not a
/// known command; Some(reply) otherwise.
pub fn handle_text_command(
    wl: &Whitelist,
    guild_id: GuildId,
    owner_id: UserId,
    author_id: UserId,
    content: &str,
    prefix: &str,
) -> Option<String> {
    let body = content.strip_prefix(prefix)?;
    let mut words = body.split_whitespace();
    let command = words.next()?.to_lowercase();
    let args: Vec<&str> = words.collect();

    match command.as_str() {
        "help" => Some(help_text(prefix)),
        "whitelist" => Some(cmd_whitelist(wl, guild_id, owner_id, author_id, &args)),
        "removewhitelist" => Some(cmd_removewhitelist(wl, guild_id, owner_id, author_id, &args)),
        "wlman" => Some(cmd_wlman(wl, guild_id, owner_id, author_id, &args)),
        _ => None,
    }
}

fn manager_gate(wl: &Whitelist, guild_id: GuildId, owner_id: UserId, author_id: UserId) -> Option<String> {
    if wl.is_manager(guild_id, owner_id, author_id) {
        None
    } else {
        Some("⛔ Only the owner and whitelist managers may edit the whitelist.".to_string())
    }
}

fn cmd_whitelist(
    wl: &Whitelist,
    guild_id: GuildId,
    owner_id: UserId,
    author_id: UserId,
    args: &[&str],
) -> String {
    if args.first().map(|a| a.eq_ignore_ascii_case("list")).unwrap_or(false) {
        let entries = wl.list(guild_id);
        if entries.is_empty() {
            return "Whitelist is empty.".to_string();
        }
        return entries
            .iter()
            .map(|(id, scopes)| format!("• <@{}> — {}", id.get(), format_scopes(scopes)))
            .collect::<Vec<_>>()
            .join("\n");
    }

    if let Some(reject) = manager_gate(wl, guild_id, owner_id, author_id) {
        return reject;
    }
    let Some(user_id) = args.first().and_then(|t| parse_user_token(t)) else {
        return "Usage: `whitelist @user <scopes…>` (mention or id).".to_string();
    };
    // Optional filler word between user and scopes.
    let scope_tokens = args[1..]
        .iter()
        .filter(|t| !t.eq_ignore_ascii_case("for"))
        .copied();
    let scopes = normalize_scopes(scope_tokens);
    let held = wl.grant(guild_id, user_id, scopes);
    format!("✅ <@{}> whitelisted for: {}", user_id.get(), format_scopes(&held))
}

fn cmd_removewhitelist(
    wl: &Whitelist,
    guild_id: GuildId,
    owner_id: UserId,
    author_id: UserId,
    args: &[&str],
) -> String {
    if let Some(reject) = manager_gate(wl, guild_id, owner_id, author_id) {
        return reject;
    }
    let Some(user_id) = args.first().and_then(|t| parse_user_token(t)) else {
        return "Usage: `removewhitelist @user [scopes…]`.".to_string();
    };
    if args.len() == 1 {
        return if wl.remove(guild_id, user_id) {
            format!("✅ <@{}> removed from the whitelist.", user_id.get())
        } else {
            format!("<@{}> was not whitelisted.", user_id.get())
        };
    }
    let scopes = normalize_scopes(args[1..].iter().copied());
    match wl.revoke(guild_id, user_id, &scopes) {
        Some(left) => format!(
            "✅ Revoked. <@{}> still holds: {}",
            user_id.get(),
            format_scopes(&left)
        ),
        None => format!("✅ <@{}> removed from the whitelist.", user_id.get()),
    }
}

fn cmd_wlman(
    wl: &Whitelist,
    guild_id: GuildId,
    owner_id: UserId,
    author_id: UserId,
    args: &[&str],
) -> String {
    match args.first().map(|a| a.to_lowercase()).as_deref() {
        Some("list") => {
            let managers = wl.manager_list(guild_id);
            if managers.is_empty() {
                "No extra whitelist managers; only the owner may edit.".to_string()
            } else {
                managers
                    .iter()
                    .map(|id| format!("• <@{}>", id.get()))
                    .collect::<Vec<_>>()
                    .join("\n")
            }
        }
        Some(op @ ("add" | "remove")) => {
            // The roster itself is owner territory; managers only edit the
            // whitelist entries.
            if !wl.is_implicit(owner_id, author_id) {
                return "⛔ Only the owner may manage the manager roster.".to_string();
            }
            let Some(user_id) = args.get(1).and_then(|t| parse_user_token(t)) else {
                return format!("Usage: `wlman {op} @user`.");
            };
            if op == "add" {
                wl.manager_add(guild_id, user_id);
                format!("✅ <@{}> may now edit the whitelist.", user_id.get())
            } else {
                wl.manager_remove(guild_id, user_id);
                format!("✅ <@{}> may no longer edit the whitelist.", user_id.get())
            }
        }
        _ => "Usage: `wlman add/remove @user` or `wlman list`.".to_string(),
    }
}

/* =========================================
   Discord glue
   ========================================= */

pub async fn on_message(ctx: &SerenityContext, app: &Arc<AppContext>, msg: &Message) -> bool {
    if msg.author.bot || !msg.content.starts_with(&app.settings.discord.prefix) {
        return false;
    }
    let Some(guild_id) = msg.guild_id else {
        return false;
    };
    let owner_id = {
        let Some(guild) = ctx.cache.guild(guild_id) else {
            return false;
        };
        guild.owner_id
    };
    let sentinel = app.sentinel();
    let Some(reply) = handle_text_command(
        &sentinel.whitelist,
        guild_id,
        owner_id,
        msg.author.id,
        &msg.content,
        &app.settings.discord.prefix,
    ) else {
        return false;
    };
    let _ = msg
        .channel_id
        .send_message(&ctx.http, CreateMessage::new().content(reply))
        .await;
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sentinel::whitelist::Scope;

    const G: GuildId = GuildId::new(1);
    const OWNER: UserId = UserId::new(100000000000000010);
    const STRANGER: UserId = UserId::new(100000000000000042);

    fn run(wl: &Whitelist, author: UserId, line: &str) -> Option<String> {
        handle_text_command(wl, G, OWNER, author, line, "=")
    }

    #[test]
    fn parses_mentions_and_ids() {
        assert_eq!(
            parse_user_token("<@!100000000000000042>"),
            Some(STRANGER)
        );
        assert_eq!(parse_user_token("100000000000000042"), Some(STRANGER));
        assert_eq!(parse_user_token("notanid"), None);
        assert_eq!(parse_user_token("123"), None);
    }

    #[test]
    fn owner_grants_scopes_with_filler_word() {
        let wl = Whitelist::new(None);
        let reply = run(&wl, OWNER, "=whitelist <@100000000000000042> for roles bans").unwrap();
        assert!(reply.contains("roles"));
        assert!(reply.contains("bans"));
        assert!(wl.has_scope(G, OWNER, STRANGER, Scope::Roles));
        assert!(!wl.has_scope(G, OWNER, STRANGER, Scope::Threats));
    }

    #[test]
    fn non_manager_cannot_edit() {
        let wl = Whitelist::new(None);
        let reply = run(&wl, STRANGER, "=whitelist <@100000000000000042> all").unwrap();
        assert!(reply.starts_with("⛔"));
        assert!(!wl.contains(G, STRANGER));
    }

    #[test]
    fn wlman_promotes_an_editor() {
        let wl = Whitelist::new(None);
        run(&wl, OWNER, "=wlman add <@100000000000000042>").unwrap();
        let reply = run(&wl, STRANGER, "=whitelist 100000000000000042 threats").unwrap();
        assert!(reply.starts_with("✅"));
        assert!(wl.has_scope(G, OWNER, STRANGER, Scope::Threats));

        // Managers still cannot touch the roster itself.
        let reply = run(&wl, STRANGER, "=wlman add 100000000000000050").unwrap();
        assert!(reply.starts_with("⛔"));
    }

    #[test]
    fn removewhitelist_without_scopes_drops_user() {
        let wl = Whitelist::new(None);
        run(&wl, OWNER, "=whitelist 100000000000000042 roles bans").unwrap();
        let reply = run(&wl, OWNER, "=removewhitelist 100000000000000042").unwrap();
        assert!(reply.contains("removed"));
        assert!(!wl.contains(G, STRANGER));
    }

    #[test]
    fn unknown_command_is_ignored() {
        let wl = Whitelist::new(None);
        assert!(run(&wl, OWNER, "=frobnicate").is_none());
        assert!(run(&wl, OWNER, "no prefix at all").is_none());
    }

    #[test]
    fn list_is_readable_by_anyone() {
        let wl = Whitelist::new(None);
        run(&wl, OWNER, "=whitelist 100000000000000042 restore").unwrap();
        let reply = run(&wl, STRANGER, "=whitelist list").unwrap();
        assert!(reply.contains("restore"));
    }
}
