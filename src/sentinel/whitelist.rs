//! Scoped per-guild whitelist plus the manager roster allowed to edit it.
//!
//! The guild owner and the configured super-admin implicitly hold every
//! scope and are always managers. Everything here is process-local; the
//! whitelist does not survive restarts by design.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serenity::all::{GuildId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Scope {
    Roles,
    Channels,
    Webhooks,
    Bans,
    Admin,
    Restore,
    BotAdds,
    Threats,
    All,
}

impl Scope {
    pub const ALL_SCOPES: [Scope; 9] = [
        Scope::Roles,
        Scope::Channels,
        Scope::Webhooks,
        Scope::Bans,
        Scope::Admin,
        Scope::Restore,
        Scope::BotAdds,
        Scope::Threats,
        Scope::All,
    ];
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Scope::Roles => "roles",
            Scope::Channels => "channels",
            Scope::Webhooks => "webhooks",
            Scope::Bans => "bans",
            Scope::Admin => "admin",
            Scope::Restore => "restore",
            Scope::BotAdds => "bot-adds",
            Scope::Threats => "threats",
            Scope::All => "all",
        };
        f.write_str(s)
    }
}

impl FromStr for Scope {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "roles" => Ok(Scope::Roles),
            "channels" => Ok(Scope::Channels),
            "webhooks" => Ok(Scope::Webhooks),
            "bans" => Ok(Scope::Bans),
            "admin" => Ok(Scope::Admin),
            "restore" => Ok(Scope::Restore),
            "bot-adds" => Ok(Scope::BotAdds),
            "threats" => Ok(Scope::Threats),
            "all" => Ok(Scope::All),
            _ => Err(()),
        }
    }
}

/// Normalize raw scope tokens: lowercase, trailing commas stripped,
/// unknown tokens dropped. An empty result defaults to `all`.
pub fn normalize_scopes<I, S>(tokens: I) -> BTreeSet<Scope>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut set = BTreeSet::new();
    for tok in tokens {
        let v = tok.as_ref().to_lowercase();
        let v = v.trim().trim_end_matches(',');
        if let Ok(scope) = v.parse::<Scope>() {
            set.insert(scope);
        }
    }
    if set.is_empty() {
        set.insert(Scope::All);
    }
    set
}

pub fn format_scopes(set: &BTreeSet<Scope>) -> String {
    if set.is_empty() {
        return "none".into();
    }
    set.iter()
        .map(|s| s.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug)]
pub struct Whitelist {
    super_admin: Option<UserId>,
    entries: DashMap<GuildId, HashMap<UserId, BTreeSet<Scope>>>,
    managers: DashMap<GuildId, HashSet<UserId>>,
}

impl Whitelist {
    pub fn new(super_admin: Option<UserId>) -> Self {
        Self {
            super_admin,
            entries: DashMap::new(),
            managers: DashMap::new(),
        }
    }

    /// Owner or configured super-admin: implicit full trust.
    pub fn is_implicit(&self, owner_id: UserId, user_id: UserId) -> bool {
        user_id == owner_id || Some(user_id) == self.super_admin
    }

    /// Does `user_id` hold `scope` (or `all`) in `guild_id`?
    pub fn has_scope(&self, guild_id: GuildId, owner_id: UserId, user_id: UserId, scope: Scope) -> bool {
        if self.is_implicit(owner_id, user_id) {
            return true;
        }
        let Some(map) = self.entries.get(&guild_id) else {
            return false;
        };
        let Some(scopes) = map.get(&user_id) else {
            return false;
        };
        scopes.contains(&Scope::All) || scopes.contains(&scope)
    }

    /// Grant scopes. Granting (or already holding) `all` collapses the
    /// entry to just `all`.
    pub fn grant(&self, guild_id: GuildId, user_id: UserId, scopes: BTreeSet<Scope>) -> BTreeSet<Scope> {
        let mut map = self.entries.entry(guild_id).or_default();
        let entry = map.entry(user_id).or_default();
        if scopes.contains(&Scope::All) || entry.contains(&Scope::All) {
            entry.clear();
            entry.insert(Scope::All);
        } else {
            entry.extend(scopes);
        }
        entry.clone()
    }

    /// Revoke scopes. Revoking `all`, or revoking from an `all` entry,
    /// removes the user entirely. Returns the remaining scopes, or None
    /// if the user was not whitelisted / is now removed.
    pub fn revoke(&self, guild_id: GuildId, user_id: UserId, scopes: &BTreeSet<Scope>) -> Option<BTreeSet<Scope>> {
        let mut map = self.entries.get_mut(&guild_id)?;
        let entry = map.get_mut(&user_id)?;
        if scopes.contains(&Scope::All) || entry.contains(&Scope::All) {
            map.remove(&user_id);
            return None;
        }
        for s in scopes {
            entry.remove(s);
        }
        if entry.is_empty() {
            map.remove(&user_id);
            return None;
        }
        Some(entry.clone())
    }

    /// Remove the user entirely regardless of held scopes.
    pub fn remove(&self, guild_id: GuildId, user_id: UserId) -> bool {
        self.entries
            .get_mut(&guild_id)
            .map(|mut m| m.remove(&user_id).is_some())
            .unwrap_or(false)
    }

    pub fn contains(&self, guild_id: GuildId, user_id: UserId) -> bool {
        self.entries
            .get(&guild_id)
            .map(|m| m.contains_key(&user_id))
            .unwrap_or(false)
    }

    pub fn scopes_of(&self, guild_id: GuildId, user_id: UserId) -> Option<BTreeSet<Scope>> {
        self.entries.get(&guild_id)?.get(&user_id).cloned()
    }

    pub fn list(&self, guild_id: GuildId) -> Vec<(UserId, BTreeSet<Scope>)> {
        let Some(map) = self.entries.get(&guild_id) else {
            return vec![];
        };
        let mut out: Vec<_> = map.iter().map(|(k, v)| (*k, v.clone())).collect();
        out.sort_by_key(|(id, _)| *id);
        out
    }

    /* --------- manager roster --------- */

    pub fn is_manager(&self, guild_id: GuildId, owner_id: UserId, user_id: UserId) -> bool {
        if self.is_implicit(owner_id, user_id) {
            return true;
        }
        self.managers
            .get(&guild_id)
            .map(|s| s.contains(&user_id))
            .unwrap_or(false)
    }

    pub fn manager_add(&self, guild_id: GuildId, user_id: UserId) {
        self.managers.entry(guild_id).or_default().insert(user_id);
    }

    pub fn manager_remove(&self, guild_id: GuildId, user_id: UserId) {
        if let Some(mut s) = self.managers.get_mut(&guild_id) {
            s.remove(&user_id);
        }
    }

    pub fn manager_list(&self, guild_id: GuildId) -> Vec<UserId> {
        let Some(set) = self.managers.get(&guild_id) else {
            return vec![];
        };
        let mut out: Vec<_> = set.iter().copied().collect();
        out.sort();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const G: GuildId = GuildId::new(1);
    const OWNER: UserId = UserId::new(10);
    const SUPER: UserId = UserId::new(11);
    const U: UserId = UserId::new(42);

    fn wl() -> Whitelist {
        Whitelist::new(Some(SUPER))
    }

    #[test]
    fn owner_and_super_admin_hold_every_scope() {
        let wl = wl();
        for scope in Scope::ALL_SCOPES {
            assert!(wl.has_scope(G, OWNER, OWNER, scope));
            assert!(wl.has_scope(G, OWNER, SUPER, scope));
        }
        assert!(!wl.has_scope(G, OWNER, U, Scope::Restore));
    }

    #[test]
    fn grant_all_absorbs_other_scopes() {
        let wl = wl();
        wl.grant(G, U, normalize_scopes(["restore", "threats"]));
        let got = wl.grant(G, U, normalize_scopes(["all"]));
        assert_eq!(got, BTreeSet::from([Scope::All]));
        assert!(wl.has_scope(G, OWNER, U, Scope::Bans));
    }

    #[test]
    fn revoke_all_removes_entry() {
        let wl = wl();
        wl.grant(G, U, normalize_scopes(["restore", "threats"]));
        assert!(wl.revoke(G, U, &normalize_scopes(["all"])).is_none());
        assert!(!wl.contains(G, U));
    }

    #[test]
    fn revoke_partial_keeps_remainder() {
        let wl = wl();
        wl.grant(G, U, normalize_scopes(["restore", "threats", "bans"]));
        let left = wl.revoke(G, U, &normalize_scopes(["threats"])).unwrap();
        assert_eq!(left, BTreeSet::from([Scope::Bans, Scope::Restore]));
        assert!(wl.has_scope(G, OWNER, U, Scope::Restore));
        assert!(!wl.has_scope(G, OWNER, U, Scope::Threats));
    }

    #[test]
    fn normalize_drops_garbage_and_defaults_to_all() {
        assert_eq!(
            normalize_scopes(["Bot-Adds,", "bogus", "THREATS"]),
            BTreeSet::from([Scope::BotAdds, Scope::Threats])
        );
        assert_eq!(normalize_scopes(Vec::<String>::new()), BTreeSet::from([Scope::All]));
        assert_eq!(normalize_scopes(["nonsense"]), BTreeSet::from([Scope::All]));
    }

    #[test]
    fn managers_gate_whitelist_edits() {
        let wl = wl();
        assert!(wl.is_manager(G, OWNER, OWNER));
        assert!(!wl.is_manager(G, OWNER, U));
        wl.manager_add(G, U);
        assert!(wl.is_manager(G, OWNER, U));
        wl.manager_remove(G, U);
        assert!(!wl.is_manager(G, OWNER, U));
    }
}
