//! Channel-persisted "capsules": recoverable state serialized as base64
//! JSON inside a fenced code block of a bot message. The (channelId,
//! messageId) pair is the capsule's address; there is no index and no
//! database. Capsules survive process restarts because they live in the
//! guild's own channel history.

use base64::{Engine as _, engine::general_purpose::STANDARD as B64};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CAPSULE_VERSION: u8 = 1;

static RE_RESTORE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"restore:([A-Za-z0-9+/=]+)").unwrap());
static RE_THREAT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"threat:([A-Za-z0-9+/=]+)").unwrap());

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CapsuleError {
    #[error("capsule expired")]
    Expired,
    #[error("capsule guild mismatch")]
    GuildMismatch,
    #[error("capsule payload missing or corrupt")]
    PayloadMissing,
    #[error("capsule decode failed")]
    Decode,
    #[error("capsule message missing (expired or deleted)")]
    MessageMissing,
    #[error("member not found in guild")]
    MemberNotFound,
    #[error("failed to recreate channel (permissions/hierarchy?)")]
    ChannelCreateFailed,
}

/* =========================================
   Restore capsules
   ========================================= */

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Capsule {
    pub v: u8,
    pub guild_id: u64,
    /// Creation time, epoch millis.
    pub at: i64,
    /// Soft expiry, epoch millis. Replay past this is rejected.
    pub expires_at: i64,
    pub title: String,
    #[serde(flatten)]
    pub payload: CapsulePayload,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum CapsulePayload {
    #[serde(rename = "member.roles")]
    MemberRoles {
        target_id: u64,
        /// Non-managed roles the member held before the derole.
        role_ids: Vec<u64>,
        /// Managed roles that must survive a `roles.set`.
        managed_keep: Vec<u64>,
        reason: String,
        executor_id: Option<u64>,
    },
    #[serde(rename = "channel.recreate")]
    ChannelRecreate {
        channel: ChannelSnapshot,
        reason: String,
        executor_id: Option<u64>,
    },
}

/// Everything needed to recreate a deleted channel. Message history is
/// not recoverable and is not part of the snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChannelSnapshot {
    pub id: u64,
    pub name: String,
    /// Discord channel type discriminant.
    pub kind: u8,
    pub parent_id: Option<u64>,
    pub position: Option<u16>,
    pub overwrites: Vec<OverwriteSnapshot>,
    pub topic: Option<String>,
    #[serde(default)]
    pub nsfw: bool,
    pub rate_limit_per_user: Option<u16>,
    pub bitrate: Option<u32>,
    pub user_limit: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OverwriteSnapshot {
    pub id: u64,
    /// "role" or "member".
    pub kind: String,
    pub allow: u64,
    pub deny: u64,
}

impl Capsule {
    pub fn new(guild_id: u64, title: impl Into<String>, ttl_ms: i64, payload: CapsulePayload) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            v: CAPSULE_VERSION,
            guild_id,
            at: now,
            expires_at: now + ttl_ms,
            title: title.into(),
            payload,
        }
    }

    pub fn validate(&self, guild_id: u64, now_ms: i64) -> Result<(), CapsuleError> {
        if self.guild_id != guild_id {
            return Err(CapsuleError::GuildMismatch);
        }
        if now_ms > self.expires_at {
            return Err(CapsuleError::Expired);
        }
        Ok(())
    }

    pub fn encode(&self) -> String {
        // Struct-to-JSON cannot fail for these shapes.
        let json = serde_json::to_vec(self).unwrap_or_default();
        B64.encode(json)
    }

    pub fn decode(b64: &str) -> Result<Self, CapsuleError> {
        let bytes = B64.decode(b64).map_err(|_| CapsuleError::Decode)?;
        serde_json::from_slice(&bytes).map_err(|_| CapsuleError::Decode)
    }

    /// Message body carrying the capsule. The `restore:` marker inside
    /// the code fence is what `extract_restore` looks for later.
    pub fn message_content(&self) -> String {
        format!(
            "🧾 **SENTINEL RESTORE CAPSULE**: {}\nExpires: <t:{}:R>\n```txt\nrestore:{}\n```",
            self.title,
            self.expires_at / 1000,
            self.encode()
        )
    }
}

pub fn extract_restore(content: &str) -> Option<&str> {
    RE_RESTORE
        .captures(content)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}

/* =========================================
   Threat capsules
   ========================================= */

/// Cap on the stored message snapshot.
pub const THREAT_CONTENT_MAX: usize = 3500;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ThreatCapsule {
    pub v: u8,
    pub guild_id: u64,
    pub at: i64,
    pub expires_at: i64,
    pub category: String,
    pub category_title: String,
    pub severity: String,
    pub deleted: bool,
    pub author_id: u64,
    pub author_tag: String,
    pub channel_id: u64,
    pub message_id: u64,
    pub content: String,
    pub ignored: bool,
    /// Moderation decisions appended as operators act on the record.
    pub actions: Vec<ThreatAction>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ThreatAction {
    pub by: u64,
    pub at: i64,
    pub action: String,
}

impl ThreatCapsule {
    pub fn push_action(&mut self, by: u64, action: impl Into<String>) {
        self.actions.push(ThreatAction {
            by,
            at: chrono::Utc::now().timestamp_millis(),
            action: action.into(),
        });
    }

    pub fn encode(&self) -> String {
        let json = serde_json::to_vec(self).unwrap_or_default();
        B64.encode(json)
    }

    pub fn decode(b64: &str) -> Result<Self, CapsuleError> {
        let bytes = B64.decode(b64).map_err(|_| CapsuleError::Decode)?;
        serde_json::from_slice(&bytes).map_err(|_| CapsuleError::Decode)
    }

    pub fn message_content(&self) -> String {
        format!(
            "🧾 **SENTINEL THREAT CAPSULE**\nExpires: <t:{}:R>\n```txt\nthreat:{}\n```",
            self.expires_at / 1000,
            self.encode()
        )
    }
}

pub fn extract_threat(content: &str) -> Option<&str> {
    RE_THREAT
        .captures(content)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}
