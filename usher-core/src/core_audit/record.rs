/*
    record.rs - Audit record schema

    One JSON object per line. `time` and `action` are always present; every
    other field is action-specific and omitted when empty. Unknown fields and
    unknown actions are tolerated on read so older binaries can replay logs
    written by newer ones.
*/

use crate::core_invite::types::{now, ChannelId, UserId};
use chrono::{DateTime, FixedOffset, SecondsFormat};
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;

/// Lifecycle transitions recorded in the audit log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    InviteSent,
    InviteSentManual,
    InviteError,
    InviteSuperseded,
    InviteRevoked,
    RevokeErr,
    DeclineErr,
    InviteRevokedOnRequest,
    WatchErr,
    InviteConsumed,
    InviteConsumedFallback,
    InviteAbusedKicked,
    KickErr,
    InviteExpired,
    RelayAddv,
    RelayErr,
    InviteDmFailed,
    #[serde(other)]
    Unknown,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::InviteSent => "invite_sent",
            AuditAction::InviteSentManual => "invite_sent_manual",
            AuditAction::InviteError => "invite_error",
            AuditAction::InviteSuperseded => "invite_superseded",
            AuditAction::InviteRevoked => "invite_revoked",
            AuditAction::RevokeErr => "revoke_err",
            AuditAction::DeclineErr => "decline_err",
            AuditAction::InviteRevokedOnRequest => "invite_revoked_on_request",
            AuditAction::WatchErr => "watch_err",
            AuditAction::InviteConsumed => "invite_consumed",
            AuditAction::InviteConsumedFallback => "invite_consumed_fallback",
            AuditAction::InviteAbusedKicked => "invite_abused_kicked",
            AuditAction::KickErr => "kick_err",
            AuditAction::InviteExpired => "invite_expired",
            AuditAction::RelayAddv => "relay_addv",
            AuditAction::RelayErr => "relay_err",
            AuditAction::InviteDmFailed => "invite_dm_failed",
            AuditAction::Unknown => "unknown",
        }
    }

    /// Records that hand a link to a recipient
    pub fn is_issuance(&self) -> bool {
        matches!(self, AuditAction::InviteSent | AuditAction::InviteSentManual)
    }

    /// Records after which a link is closed for good
    pub fn closes_link(&self) -> bool {
        matches!(
            self,
            AuditAction::InviteConsumed
                | AuditAction::InviteConsumedFallback
                | AuditAction::InviteSuperseded
                | AuditAction::InviteExpired
        )
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single line of the audit log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    #[serde(serialize_with = "serialize_time")]
    pub time: DateTime<FixedOffset>,

    pub action: AuditAction,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier: Option<String>,

    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient_id"
    )]
    pub peer: Option<ChannelId>,

    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient_id"
    )]
    pub target: Option<UserId>,

    /// Identity that redeemed a link it was not issued to
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient_id"
    )]
    pub joiner: Option<UserId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none", alias = "err")]
    pub error: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub req_no: Option<u32>,

    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        serialize_with = "serialize_opt_time"
    )]
    pub expires_at: Option<DateTime<FixedOffset>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub superseded_by: Option<String>,

    /// Relay destination
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
}

impl AuditRecord {
    /// Start a record stamped with the current time
    pub fn new(action: AuditAction) -> Self {
        Self::at(now(), action)
    }

    /// Start a record with an explicit timestamp
    pub fn at(time: DateTime<FixedOffset>, action: AuditAction) -> Self {
        AuditRecord {
            time,
            action,
            tier: None,
            peer: None,
            target: None,
            joiner: None,
            link: None,
            status: None,
            error: None,
            req_no: None,
            expires_at: None,
            superseded_by: None,
            to: None,
        }
    }

    pub fn tier(mut self, tier: impl Into<String>) -> Self {
        self.tier = Some(tier.into());
        self
    }

    pub fn peer(mut self, peer: ChannelId) -> Self {
        self.peer = Some(peer);
        self
    }

    pub fn target(mut self, target: UserId) -> Self {
        self.target = Some(target);
        self
    }

    pub fn joiner(mut self, joiner: UserId) -> Self {
        self.joiner = Some(joiner);
        self
    }

    pub fn link(mut self, link: impl Into<String>) -> Self {
        self.link = Some(link.into());
        self
    }

    pub fn status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    pub fn error(mut self, error: impl fmt::Display) -> Self {
        self.error = Some(error.to_string());
        self
    }

    pub fn req_no(mut self, req_no: Option<u32>) -> Self {
        self.req_no = req_no;
        self
    }

    pub fn expires_at(mut self, expires_at: DateTime<FixedOffset>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn superseded_by(mut self, link: impl Into<String>) -> Self {
        self.superseded_by = Some(link.into());
        self
    }

    pub fn to(mut self, to: impl Into<String>) -> Self {
        self.to = Some(to.into());
        self
    }

    /// Serialize as a single newline-terminated JSON line
    pub fn to_line(&self) -> serde_json::Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

fn serialize_time<S: Serializer>(time: &DateTime<FixedOffset>, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&time.to_rfc3339_opts(SecondsFormat::Secs, false))
}

fn serialize_opt_time<S: Serializer>(
    time: &Option<DateTime<FixedOffset>>,
    s: S,
) -> Result<S::Ok, S::Error> {
    match time {
        Some(time) => serialize_time(time, s),
        None => s.serialize_none(),
    }
}

/// Accept ids written as numbers or numeric strings
fn lenient_id<'de, D, T>(d: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: From<i64>,
{
    match Option::<serde_json::Value>::deserialize(d)? {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::Number(n)) => n
            .as_i64()
            .map(|v| Some(T::from(v)))
            .ok_or_else(|| de::Error::custom(format!("id out of range: {}", n))),
        Some(serde_json::Value::String(s)) => s
            .trim()
            .parse::<i64>()
            .map(|v| Some(T::from(v)))
            .map_err(de::Error::custom),
        Some(other) => Err(de::Error::custom(format!("unexpected id: {}", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issuance_line_shape() {
        let time = DateTime::parse_from_rfc3339("2026-10-18T10:00:00+07:00").unwrap();
        let record = AuditRecord::at(time, AuditAction::InviteSent)
            .tier("linkv1")
            .target(UserId(555))
            .link("https://t.me/+abc")
            .status("pending");

        let line = record.to_line().unwrap();
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);

        let value: serde_json::Value = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(value["time"], "2026-10-18T10:00:00+07:00");
        assert_eq!(value["action"], "invite_sent");
        assert_eq!(value["tier"], "linkv1");
        assert_eq!(value["target"], 555);
        assert_eq!(value["status"], "pending");
        assert!(value.get("error").is_none());
        assert!(value.get("req_no").is_none());
    }

    #[test]
    fn test_reads_legacy_fields() {
        let line = r#"{"time": "2025-01-02T03:04:05+07:00", "action": "invite_error", "tier": "linkv2", "peer": "-1001234", "err": "no_link_returned"}"#;
        let record: AuditRecord = serde_json::from_str(line).unwrap();

        assert_eq!(record.action, AuditAction::InviteError);
        assert_eq!(record.peer, Some(ChannelId(-1001234)));
        assert_eq!(record.error.as_deref(), Some("no_link_returned"));
    }

    #[test]
    fn test_unknown_action_and_fields_tolerated() {
        let line = r#"{"time": "2025-01-02T03:04:05+00:00", "action": "note_saved", "title": "rules", "type": "text"}"#;
        let record: AuditRecord = serde_json::from_str(line).unwrap();

        assert_eq!(record.action, AuditAction::Unknown);
        assert!(record.target.is_none());
    }

    #[test]
    fn test_action_classes() {
        assert!(AuditAction::InviteSent.is_issuance());
        assert!(AuditAction::InviteSentManual.is_issuance());
        assert!(!AuditAction::InviteRevoked.is_issuance());
        assert!(AuditAction::InviteConsumedFallback.closes_link());
        assert!(!AuditAction::InviteRevokedOnRequest.closes_link());
    }
}
