use once_cell::sync::Lazy;
use serenity::all::Permissions;

/// Capability flags that let an actor take a guild apart. One shared
/// constant feeds both the bot-review gate and the lockdown stripper so
/// the two lists cannot drift.
pub static DANGEROUS: Lazy<Permissions> = Lazy::new(|| {
    Permissions::ADMINISTRATOR
        | Permissions::MANAGE_GUILD
        | Permissions::MANAGE_ROLES
        | Permissions::MANAGE_CHANNELS
        | Permissions::MANAGE_WEBHOOKS
        | Permissions::BAN_MEMBERS
        | Permissions::KICK_MEMBERS
});

static LABELS: &[(Permissions, &str)] = &[
    (Permissions::ADMINISTRATOR, "Administrator"),
    (Permissions::MANAGE_GUILD, "Manage Server"),
    (Permissions::MANAGE_ROLES, "Manage Roles"),
    (Permissions::MANAGE_CHANNELS, "Manage Channels"),
    (Permissions::MANAGE_WEBHOOKS, "Manage Webhooks"),
    (Permissions::BAN_MEMBERS, "Ban Members"),
    (Permissions::KICK_MEMBERS, "Kick Members"),
];

pub fn has_dangerous(perms: Permissions) -> bool {
    perms.intersects(*DANGEROUS)
}

/// Human-readable names of the dangerous flags held by `perms`,
/// for review panels.
pub fn dangerous_labels(perms: Permissions) -> Vec<&'static str> {
    let out: Vec<&'static str> = LABELS
        .iter()
        .filter(|(flag, _)| perms.contains(*flag))
        .map(|(_, label)| *label)
        .collect();
    if out.is_empty() { vec!["(unknown)"] } else { out }
}

/// `perms` with every dangerous flag removed. Used by lockdown.
pub fn strip_dangerous(perms: Permissions) -> Permissions {
    perms & !*DANGEROUS
}

/// True when `new` holds a dangerous flag that `old` did not. Cosmetic
/// permission edits do not count.
pub fn gained_dangerous(old: Permissions, new: Permissions) -> bool {
    has_dangerous(new & !old)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admin_is_dangerous() {
        assert!(has_dangerous(Permissions::ADMINISTRATOR));
        assert!(!has_dangerous(Permissions::SEND_MESSAGES));
    }

    #[test]
    fn strip_leaves_safe_flags() {
        let perms = Permissions::ADMINISTRATOR | Permissions::SEND_MESSAGES;
        let safe = strip_dangerous(perms);
        assert!(!has_dangerous(safe));
        assert!(safe.contains(Permissions::SEND_MESSAGES));
    }

    #[test]
    fn gained_tracks_new_dangerous_flags_only() {
        let safe = Permissions::SEND_MESSAGES;
        // Adding a cosmetic flag is not a gain.
        assert!(!gained_dangerous(safe, safe | Permissions::EMBED_LINKS));
        // Adding a dangerous flag is.
        assert!(gained_dangerous(safe, safe | Permissions::BAN_MEMBERS));
        // A dangerous flag that was already there is not a gain.
        let admin = Permissions::ADMINISTRATOR | safe;
        assert!(!gained_dangerous(admin, admin | Permissions::EMBED_LINKS));
        // Losing one is not a gain either.
        assert!(!gained_dangerous(admin, safe));
    }

    #[test]
    fn labels_follow_flags() {
        let perms = Permissions::BAN_MEMBERS | Permissions::MANAGE_ROLES;
        let labels = dangerous_labels(perms);
        assert_eq!(labels, vec!["Manage Roles", "Ban Members"]);
        assert_eq!(dangerous_labels(Permissions::SEND_MESSAGES), vec!["(unknown)"]);
    }
}
