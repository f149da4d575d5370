use anyhow::Result;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Settings {
    pub env: String,
    pub app: App,
    pub discord: Discord,
    pub logging: Logging,
    pub sentinel: SentinelConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct App {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Discord {
    pub token: String,
    pub app_id: Option<String>,
    /// Text-command prefix for the whitelist commands.
    pub prefix: String,
    /// Bind address for the health endpoint; empty disables it.
    pub health_addr: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Logging {
    pub json: Option<bool>,
    pub level: Option<String>,
}

/// All sentinel tunables. Defaults mirror the production values the
/// heuristics were calibrated against; override per environment in
/// `config/<env>.toml` or via `SENTINEL_*` env vars.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SentinelConfig {
    /// Always-trusted operator account, in addition to the guild owner.
    pub super_admin_id: Option<u64>,
    /// Rolling window for the abuse counters, seconds.
    pub window_secs: u64,
    /// Interval of the expiry sweep over counter state, seconds.
    pub sweep_secs: u64,
    /// Max age of an audit-log entry to still attribute an event to its
    /// executor. Larger values risk attributing to a stale entry; smaller
    /// values undercount in guilds with slow audit-log propagation.
    pub attribution_max_age_secs: u64,
    pub limits: Limits,
    pub review: ReviewConfig,
    pub rolestrip: RoleStripConfig,
    pub capsules: CapsuleConfig,
    pub threats: ThreatConfig,
}

/// Per-window limits per monitored action kind.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Limits {
    pub channel_delete: u32,
    pub category_delete: u32,
    pub channel_create: u32,
    pub channel_perm_edit: u32,
    pub role_delete: u32,
    pub role_create: u32,
    pub role_perm_edit: u32,
    pub webhook_change: u32,
    pub member_ban: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReviewConfig {
    /// Panel/kick dedupe per (guild, bot), seconds.
    pub dedupe_secs: u64,
    pub channel: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RoleStripConfig {
    pub window_secs: u64,
    pub threshold: u32,
    /// Also post restore capsules for the victims of a mass role strip,
    /// not only for the derolled executor.
    pub restore_victims: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CapsuleConfig {
    pub log_channel: String,
    pub ttl_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ThreatConfig {
    pub channel: String,
    /// Per-(guild, author) log dedupe, seconds.
    pub dedupe_secs: u64,
    pub ttl_secs: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            channel_delete: 4,
            category_delete: 2,
            channel_create: 8,
            channel_perm_edit: 5,
            role_delete: 3,
            role_create: 8,
            role_perm_edit: 4,
            webhook_change: 4,
            member_ban: 4,
        }
    }
}

impl Default for SentinelConfig {
    fn default() -> Self {
        Self {
            super_admin_id: None,
            window_secs: 30,
            sweep_secs: 30,
            attribution_max_age_secs: 12,
            limits: Limits::default(),
            review: ReviewConfig {
                dedupe_secs: 60,
                channel: "sentinel-review".into(),
            },
            rolestrip: RoleStripConfig {
                window_secs: 180,
                threshold: 5,
                restore_victims: false,
            },
            capsules: CapsuleConfig {
                log_channel: "sentinel-log".into(),
                ttl_secs: 24 * 60 * 60,
            },
            threats: ThreatConfig {
                channel: "sentinel-threats".into(),
                dedupe_secs: 25,
                ttl_secs: 7 * 24 * 60 * 60,
            },
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            env: "development".into(),
            app: App {
                name: "Bright Sentinel".into(),
            },
            discord: Discord {
                token: String::new(),
                app_id: None,
                prefix: "=".into(),
                health_addr: None,
            },
            logging: Logging {
                json: Some(false),
                level: Some("info".into()),
            },
            sentinel: SentinelConfig::default(),
        }
    }
}

impl Settings {
    pub fn load() -> Result<Self> {
        let env = std::env::var("SENTINEL_ENV").unwrap_or_else(|_| "development".to_string());

        // Load .env.<env> and .env if present.
        let _ = dotenvy::from_filename(format!(".env.{}", env));
        let _ = dotenvy::dotenv();

        // Layers: defaults -> TOML file -> SENTINEL_* env vars.
        let mut defaults = Settings::default();
        defaults.env = env.clone();

        let figment = Figment::from(Serialized::defaults(defaults))
            .merge(Toml::file(format!("config/{}.toml", env)))
            // SENTINEL_DISCORD_TOKEN => discord.token etc.
            .merge(Env::prefixed("SENTINEL_").split("_"));

        let mut s: Settings = figment.extract()?;
        s.env = env;
        Ok(s)
    }
}
