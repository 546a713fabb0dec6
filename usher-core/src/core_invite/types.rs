//! Invite domain types
//!
//! Identifiers, tiers, invites and assignments shared by every component of
//! the invite lifecycle.

use chrono::{DateTime, FixedOffset, Local};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Chat-network user identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub i64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for UserId {
    fn from(id: i64) -> Self {
        UserId(id)
    }
}

/// Chat-network channel identifier (usually negative, e.g. `-100...`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(pub i64);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for ChannelId {
    fn from(id: i64) -> Self {
        ChannelId(id)
    }
}

/// Identity of an invite on the gateway: a link is only unique per channel
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InviteKey {
    pub channel: ChannelId,
    pub link: String,
}

impl InviteKey {
    pub fn new(channel: ChannelId, link: impl Into<String>) -> Self {
        Self {
            channel,
            link: link.into(),
        }
    }
}

impl fmt::Display for InviteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.channel, self.link)
    }
}

/// A configured access level bound to one destination channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tier {
    /// Short key, e.g. `v1`
    pub key: String,

    /// Destination channel
    pub channel_id: ChannelId,

    /// Whether joining requires a join-request step
    pub approval_required: bool,

    /// Lifetime of an issued invite
    pub ttl: Duration,

    /// Usage limit for direct-join invites (ignored in request-to-join mode)
    pub usage_limit: u32,

    /// Delivery template with `{tier}` and `{link}` placeholders
    pub message_template: String,

    /// Command relayed to the relay bot for combo requests, e.g. `/addv1`
    pub relay_command: String,
}

impl Tier {
    /// Name under which issuance is recorded in the audit log (`linkv1`)
    pub fn link_name(&self) -> String {
        format!("link{}", self.key)
    }

    /// Human label used in delivered messages (`VIP1`, or `VIP` when the key has no number)
    pub fn label(&self) -> String {
        tier_label(&self.key)
    }
}

/// Derive the display label from a tier key or link name
pub fn tier_label(name: &str) -> String {
    let lower = name.trim().to_lowercase();
    let number = lower
        .strip_prefix("linkv")
        .or_else(|| lower.strip_prefix('v'))
        .unwrap_or("");

    if !number.is_empty() && number.chars().all(|c| c.is_ascii_digit()) {
        format!("VIP{}", number)
    } else {
        "VIP".to_string()
    }
}

/// Normalize a tier reference (`v1`, `linkv1`, `/addv1`, `.linkv1`) to its key
pub fn normalize_tier_key(name: &str) -> String {
    let lower = name.trim().trim_start_matches(['/', '.', '!']).to_lowercase();
    if let Some(rest) = lower.strip_prefix("link") {
        return rest.to_string();
    }
    if let Some(rest) = lower.strip_prefix("add") {
        return rest.to_string();
    }
    lower
}

/// Lifecycle status of an invite
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InviteStatus {
    Pending,
    Consumed,
    Revoked,
    Expired,
}

impl InviteStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InviteStatus::Pending => "pending",
            InviteStatus::Consumed => "consumed",
            InviteStatus::Revoked => "revoked",
            InviteStatus::Expired => "expired",
        }
    }

    /// Whether the remote link can no longer be redeemed
    pub fn is_terminal(&self) -> bool {
        !matches!(self, InviteStatus::Pending)
    }
}

impl fmt::Display for InviteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single-use access credential for one channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Invite {
    pub link: String,
    pub tier: String,
    pub channel_id: ChannelId,
    pub recipient: UserId,
    pub created_at: DateTime<FixedOffset>,
    pub expires_at: DateTime<FixedOffset>,
    pub approval_required: bool,
    pub usage_limit: Option<u32>,
    pub status: InviteStatus,
}

impl Invite {
    pub fn key(&self) -> InviteKey {
        InviteKey::new(self.channel_id, self.link.clone())
    }

    pub fn is_pending(&self) -> bool {
        self.status == InviteStatus::Pending
    }

    /// Whether the invite is past its expiry at `now`
    pub fn is_expired_at(&self, now: DateTime<FixedOffset>) -> bool {
        self.expires_at <= now
    }

    /// Pending and not yet expired at `now`
    pub fn is_live_at(&self, now: DateTime<FixedOffset>) -> bool {
        self.is_pending() && !self.is_expired_at(now)
    }
}

/// The invite currently assigned to a recipient
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActiveAssignment {
    pub recipient: UserId,
    pub invite: Invite,
}

/// Where an issuance request came from; selects the audit action
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueOrigin {
    /// Relay + link combo
    Combo,
    /// Link-only operator command
    Manual,
}

/// Current wall-clock time with the local offset
pub fn now() -> DateTime<FixedOffset> {
    Local::now().fixed_offset()
}
