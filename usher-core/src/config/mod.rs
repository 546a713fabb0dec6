//! Configuration management for Usher
//!
//! This module provides file-based configuration (TOML or JSON) with
//! environment overrides, defaults, and validation.

use crate::core_invite::types::{ChannelId, Tier};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

mod error;

pub use error::ConfigError;

/// Default invite lifetime (24 hours)
pub const DEFAULT_TTL: Duration = Duration::from_secs(86_400);

/// Default delivery template
pub const DEFAULT_TEMPLATE: &str = "{tier} access granted.\nLink (valid 24 hours, single use): {link}";

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Tier key (`v1`) to tier settings
    pub tiers: BTreeMap<String, TierConfig>,

    /// Invite lifecycle tuning
    pub invite: InviteConfig,

    /// Relay bot and combo behavior
    pub relay: RelayConfig,

    /// Storage configuration
    pub storage: StorageConfig,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// How long shutdown waits for background tasks
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

/// Per-tier settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierConfig {
    /// Destination channel
    pub channel_id: i64,

    /// Request-to-join mode
    #[serde(default = "default_true")]
    pub approval_required: bool,

    /// Invite lifetime
    #[serde(default = "default_ttl", with = "humantime_serde")]
    pub ttl: Duration,

    /// Usage limit for direct-join invites
    #[serde(default = "default_usage_limit")]
    pub usage_limit: u32,

    /// Delivery template override
    #[serde(default)]
    pub template: Option<String>,

    /// Relay command override (defaults to `/add<key>`)
    #[serde(default)]
    pub relay_command: Option<String>,
}

/// Invite lifecycle configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InviteConfig {
    /// Default delivery template
    pub template: String,

    /// Window in which repeated issuance reuses the same link
    #[serde(with = "humantime_serde")]
    pub dedupe_window: Duration,

    /// Maximum tracked (tier, recipient) dedupe entries
    pub dedupe_capacity: usize,

    /// Consumption watcher poll interval
    #[serde(with = "humantime_serde")]
    pub watch_interval: Duration,

    /// Expiry sweep interval
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
}

/// Ordering policy for relay + invite combos
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComboOrder {
    RelayFirst,
    Parallel,
}

impl FromStr for ComboOrder {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "relay_first" => Ok(ComboOrder::RelayFirst),
            "parallel" => Ok(ComboOrder::Parallel),
            other => Err(ConfigError::invalid("combo order", other)),
        }
    }
}

impl fmt::Display for ComboOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComboOrder::RelayFirst => f.write_str("relay_first"),
            ComboOrder::Parallel => f.write_str("parallel"),
        }
    }
}

/// Relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Username of the relay bot
    pub bot_username: String,

    /// Send an invite after relaying
    pub combo_enabled: bool,

    /// Ordering policy
    pub order: ComboOrder,

    /// How long to wait for a reply from the relay bot
    #[serde(with = "humantime_serde")]
    pub reply_wait: Duration,

    /// Fixed delay between relay and issuance
    #[serde(with = "humantime_serde")]
    pub settle_delay: Duration,

    /// Deliver invites without notification sound
    pub silent_dm: bool,

    /// Lower bound for the relayed request number
    pub request_no_min: u32,

    /// Upper bound for the relayed request number
    pub request_no_max: u32,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Audit log path
    pub invite_log: PathBuf,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Enable JSON formatting
    pub json_format: bool,

    /// Include timestamps
    pub with_timestamp: bool,

    /// Include target module
    pub with_target: bool,
}

fn default_true() -> bool {
    true
}

fn default_ttl() -> Duration {
    DEFAULT_TTL
}

fn default_usage_limit() -> u32 {
    1
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tiers: BTreeMap::new(),
            invite: InviteConfig::default(),
            relay: RelayConfig::default(),
            storage: StorageConfig::default(),
            logging: LoggingConfig::default(),
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

impl Default for InviteConfig {
    fn default() -> Self {
        Self {
            template: DEFAULT_TEMPLATE.to_string(),
            dedupe_window: Duration::from_secs(60),
            dedupe_capacity: 1024,
            watch_interval: Duration::from_secs(2),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bot_username: String::new(),
            combo_enabled: true,
            order: ComboOrder::RelayFirst,
            reply_wait: Duration::from_secs(5),
            settle_delay: Duration::from_secs(5),
            silent_dm: true,
            request_no_min: 1,
            request_no_max: 100,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            invite_log: PathBuf::from("./data/invite_log.jsonl"),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            with_timestamp: true,
            with_target: true,
        }
    }
}

impl TierConfig {
    /// Minimal tier bound to a channel, everything else defaulted
    pub fn new(channel_id: i64) -> Self {
        Self {
            channel_id,
            approval_required: true,
            ttl: DEFAULT_TTL,
            usage_limit: 1,
            template: None,
            relay_command: None,
        }
    }
}

impl RelayConfig {
    /// Clamp a requested quantity into the configured range
    pub fn clip_request_no(&self, n: u32) -> u32 {
        n.clamp(self.request_no_min, self.request_no_max)
    }
}

impl Config {
    /// Load configuration from file, apply environment overrides, validate
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let config = Self::from_file(path)?.with_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML or JSON file (chosen by extension)
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let is_json = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        let parsed: Result<Self, String> = if is_json {
            serde_json::from_str(&contents).map_err(|e| e.to_string())
        } else {
            toml::from_str(&contents).map_err(|e| e.to_string())
        };
        parsed.map_err(|message| ConfigError::Parse {
            path: path.to_path_buf(),
            message,
        })
    }

    /// Apply environment overrides
    ///
    /// Environment variables follow the pattern: USHER_<SECTION>_<KEY>
    /// Example: USHER_RELAY_ORDER=parallel
    pub fn with_env_overrides(mut self) -> Result<Self, ConfigError> {
        if let Ok(path) = env::var("USHER_STORAGE_INVITE_LOG") {
            self.storage.invite_log = PathBuf::from(path);
        }

        if let Ok(bot) = env::var("USHER_RELAY_BOT_USERNAME") {
            self.relay.bot_username = bot;
        }
        if let Ok(order) = env::var("USHER_RELAY_ORDER") {
            self.relay.order = order.parse()?;
        }
        if let Ok(combo) = env::var("USHER_RELAY_COMBO_ENABLED") {
            self.relay.combo_enabled = combo
                .parse()
                .map_err(|e| ConfigError::invalid("combo flag", e))?;
        }
        if let Ok(wait) = env::var("USHER_RELAY_REPLY_WAIT") {
            self.relay.reply_wait = parse_duration("reply wait", &wait)?;
        }

        if let Ok(window) = env::var("USHER_INVITE_DEDUPE_WINDOW") {
            self.invite.dedupe_window = parse_duration("dedupe window", &window)?;
        }
        if let Ok(interval) = env::var("USHER_INVITE_WATCH_INTERVAL") {
            self.invite.watch_interval = parse_duration("watch interval", &interval)?;
        }

        if let Ok(level) = env::var("USHER_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(json) = env::var("USHER_LOG_JSON") {
            self.logging.json_format = json
                .parse()
                .map_err(|e| ConfigError::invalid("JSON log flag", e))?;
        }

        Ok(self)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tiers.is_empty() {
            return Err(ConfigError::Validation(
                "at least one tier must be configured".to_string(),
            ));
        }

        for (key, tier) in &self.tiers {
            if tier.channel_id == 0 {
                return Err(ConfigError::Validation(format!(
                    "tier {} has no channel_id",
                    key
                )));
            }
            if tier.ttl.is_zero() {
                return Err(ConfigError::Validation(format!(
                    "tier {} ttl must be greater than 0",
                    key
                )));
            }
            if tier.usage_limit == 0 {
                return Err(ConfigError::Validation(format!(
                    "tier {} usage_limit must be greater than 0",
                    key
                )));
            }
            let template = tier.template.as_deref().unwrap_or(&self.invite.template);
            if !template.contains("{link}") {
                return Err(ConfigError::Validation(format!(
                    "template for tier {} does not contain {{link}}",
                    key
                )));
            }
        }

        if self.invite.watch_interval.is_zero() {
            return Err(ConfigError::Validation(
                "watch_interval must be greater than 0".to_string(),
            ));
        }

        if self.invite.sweep_interval.is_zero() {
            return Err(ConfigError::Validation(
                "sweep_interval must be greater than 0".to_string(),
            ));
        }

        if self.invite.dedupe_capacity == 0 {
            return Err(ConfigError::Validation(
                "dedupe_capacity must be greater than 0".to_string(),
            ));
        }

        if self.relay.bot_username.trim().is_empty() {
            return Err(ConfigError::Validation(
                "relay.bot_username must be set".to_string(),
            ));
        }

        if self.relay.request_no_min == 0 || self.relay.request_no_min > self.relay.request_no_max {
            return Err(ConfigError::Validation(format!(
                "invalid request number range {}..={}",
                self.relay.request_no_min, self.relay.request_no_max
            )));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::Validation(format!(
                "Invalid log level: {}",
                self.logging.level
            )));
        }

        Ok(())
    }

    /// Resolve a tier by key or link name (`v1`, `linkv1`, `/addv1`)
    pub fn tier(&self, name: &str) -> Option<Tier> {
        let key = crate::core_invite::types::normalize_tier_key(name);
        self.tiers.get(&key).map(|tier| self.build_tier(&key, tier))
    }

    /// Resolve the tier bound to a channel
    pub fn tier_for_channel(&self, channel: ChannelId) -> Option<Tier> {
        self.tiers
            .iter()
            .find(|(_, tier)| tier.channel_id == channel.0)
            .map(|(key, tier)| self.build_tier(key, tier))
    }

    fn build_tier(&self, key: &str, tier: &TierConfig) -> Tier {
        Tier {
            key: key.to_string(),
            channel_id: ChannelId(tier.channel_id),
            approval_required: tier.approval_required,
            ttl: tier.ttl,
            usage_limit: tier.usage_limit,
            message_template: tier
                .template
                .clone()
                .unwrap_or_else(|| self.invite.template.clone()),
            relay_command: tier
                .relay_command
                .clone()
                .unwrap_or_else(|| format!("/add{}", key)),
        }
    }
}

fn parse_duration(what: &'static str, value: &str) -> Result<Duration, ConfigError> {
    humantime_serde::re::humantime::parse_duration(value).map_err(|e| ConfigError::invalid(what, e))
}
