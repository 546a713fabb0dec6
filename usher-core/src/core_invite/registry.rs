//! Invite Registry
//!
//! In-memory index of every invite seen by this process and of the invite
//! currently assigned to each recipient. Nothing here is persisted: the
//! registry is a fold over the audit log and can be rebuilt at any time with
//! [`Registry::replay`].
//!
//! # Indexes
//!
//! ```text
//! invites:      (channel, link) -> Invite          (closed + past expiry: pruned)
//! assignments:  recipient       -> (channel, link) (at most one per recipient)
//! holders:      (channel, link) -> recipient       (inverse of assignments)
//! ```

use super::types::{
    ActiveAssignment, ChannelId, Invite, InviteKey, InviteStatus, UserId,
};
use crate::config::{Config, DEFAULT_TTL};
use crate::core_audit::{AuditAction, AuditRecord};
use chrono::{DateTime, FixedOffset};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, info};

/// Summary of a replay
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayStats {
    /// Records folded
    pub records: usize,
    /// Issuance records seen
    pub issued: usize,
    /// Assignments active after the fold
    pub assignments: usize,
}

#[derive(Debug, Default)]
struct RegistryState {
    invites: HashMap<InviteKey, Invite>,
    assignments: HashMap<UserId, InviteKey>,
    holders: HashMap<InviteKey, UserId>,
}

impl RegistryState {
    fn assignment(&self, user: UserId) -> Option<ActiveAssignment> {
        let key = self.assignments.get(&user)?;
        let invite = self.invites.get(key)?;
        Some(ActiveAssignment {
            recipient: user,
            invite: invite.clone(),
        })
    }

    fn take_assignment(&mut self, user: UserId) -> Option<Invite> {
        let key = self.assignments.remove(&user)?;
        self.holders.remove(&key);
        self.invites.get(&key).cloned()
    }

    fn install(&mut self, invite: Invite) -> Option<Invite> {
        let user = invite.recipient;
        let key = invite.key();

        let displaced = match self.assignments.get(&user) {
            Some(existing) if *existing != key => self.take_assignment(user),
            _ => None,
        };

        // A link maps to at most one recipient
        if let Some(previous_holder) = self.holders.insert(key.clone(), user) {
            if previous_holder != user {
                self.assignments.remove(&previous_holder);
            }
        }
        self.assignments.insert(user, key.clone());
        self.invites.insert(key, invite);

        displaced
    }

    fn set_status(&mut self, key: &InviteKey, status: InviteStatus) -> Option<InviteStatus> {
        let invite = self.invites.get_mut(key)?;
        let previous = invite.status;
        invite.status = status;
        Some(previous)
    }

    fn release(&mut self, key: &InviteKey) -> Option<UserId> {
        let user = self.holders.remove(key)?;
        self.assignments.remove(&user);
        Some(user)
    }

    fn key_for_link(&self, link: &str) -> Option<InviteKey> {
        self.invites.keys().find(|key| key.link == link).cloned()
    }

    /// Locate the invite a record refers to
    fn resolve_key(&self, record: &AuditRecord, config: &Config) -> Option<InviteKey> {
        let link = record.link.as_deref()?;

        if let Some(channel) = record.peer {
            return Some(InviteKey::new(channel, link));
        }
        if let Some(key) = self.key_for_link(link) {
            return Some(key);
        }
        let tier = config.tier(record.tier.as_deref()?)?;
        Some(InviteKey::new(tier.channel_id, link))
    }

    fn apply(&mut self, record: &AuditRecord, config: &Config) {
        match record.action {
            AuditAction::InviteSent | AuditAction::InviteSentManual => {
                if let Some(invite) = invite_from_record(record, config) {
                    self.install(invite);
                }
            }
            AuditAction::InviteSuperseded => {
                if let Some(key) = self.resolve_key(record, config) {
                    self.set_status(&key, InviteStatus::Revoked);
                    self.release(&key);
                }
            }
            AuditAction::InviteRevoked => {
                if let Some(key) = self.resolve_key(record, config) {
                    if self.invites.get(&key).map(|i| i.is_pending()).unwrap_or(false) {
                        self.set_status(&key, InviteStatus::Revoked);
                    }
                }
            }
            AuditAction::InviteRevokedOnRequest => {
                if let Some(key) = self.resolve_key(record, config) {
                    self.set_status(&key, InviteStatus::Consumed);
                }
            }
            AuditAction::InviteConsumed | AuditAction::InviteConsumedFallback => {
                match self.resolve_key(record, config) {
                    Some(key) => {
                        self.set_status(&key, InviteStatus::Consumed);
                        self.release(&key);
                    }
                    None => {
                        if let Some(target) = record.target {
                            self.take_assignment(target);
                        }
                    }
                }
            }
            AuditAction::InviteExpired => {
                if let Some(key) = self.resolve_key(record, config) {
                    self.set_status(&key, InviteStatus::Expired);
                    self.release(&key);
                }
            }
            _ => {}
        }
    }
}

/// Rebuild an invite from an issuance record
fn invite_from_record(record: &AuditRecord, config: &Config) -> Option<Invite> {
    let link = record.link.clone()?;
    let recipient = record.target?;
    let tier = record.tier.as_deref().and_then(|name| config.tier(name));

    let channel_id = match (record.peer, &tier) {
        (Some(peer), _) => peer,
        (None, Some(tier)) => tier.channel_id,
        (None, None) => {
            debug!(link = %link, "Issuance record without resolvable channel");
            return None;
        }
    };

    let ttl = tier.as_ref().map(|t| t.ttl).unwrap_or(DEFAULT_TTL);
    let expires_at = record.expires_at.unwrap_or_else(|| {
        record.time + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::days(1))
    });
    let approval_required = tier.as_ref().map(|t| t.approval_required).unwrap_or(true);
    let usage_limit = match &tier {
        Some(tier) if !approval_required => Some(tier.usage_limit),
        _ => None,
    };

    Some(Invite {
        link,
        tier: record.tier.clone().unwrap_or_default(),
        channel_id,
        recipient,
        created_at: record.time,
        expires_at,
        approval_required,
        usage_limit,
        status: InviteStatus::Pending,
    })
}

/// In-memory invite index
#[derive(Default)]
pub struct Registry {
    state: RwLock<RegistryState>,
    recipient_locks: Mutex<HashMap<UserId, Arc<Mutex<()>>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry by folding audit records
    pub fn fold(records: &[AuditRecord], config: &Config) -> Self {
        let mut state = RegistryState::default();
        for record in records {
            state.apply(record, config);
        }
        Self {
            state: RwLock::new(state),
            recipient_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Replace the current state with a fold of `records`
    pub async fn replay(&self, records: &[AuditRecord], config: &Config) -> ReplayStats {
        let mut state = RegistryState::default();
        let mut issued = 0;
        for record in records {
            if record.action.is_issuance() {
                issued += 1;
            }
            state.apply(record, config);
        }

        let stats = ReplayStats {
            records: records.len(),
            issued,
            assignments: state.assignments.len(),
        };
        *self.state.write().await = state;

        info!(
            records = stats.records,
            issued = stats.issued,
            assignments = stats.assignments,
            "Registry rebuilt from audit log"
        );
        stats
    }

    /// Enter the per-recipient critical section
    ///
    /// Held across gateway calls by issuance and reconciliation, so the
    /// read-then-write of a recipient's assignment is never interleaved.
    pub async fn lock_recipient(&self, user: UserId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.recipient_locks.lock().await;
            locks.entry(user).or_default().clone()
        };
        lock.lock_owned().await
    }

    /// Current assignment for a recipient, whatever its status
    pub async fn assignment(&self, user: UserId) -> Option<ActiveAssignment> {
        self.state.read().await.assignment(user)
    }

    /// Assignment that is still Pending and not expired at `now`
    pub async fn live_assignment(
        &self,
        user: UserId,
        now: DateTime<FixedOffset>,
    ) -> Option<ActiveAssignment> {
        self.assignment(user)
            .await
            .filter(|assignment| assignment.invite.is_live_at(now))
    }

    /// Install `invite` as its recipient's assignment, returning any displaced invite
    pub async fn install(&self, invite: Invite) -> Option<Invite> {
        self.state.write().await.install(invite)
    }

    /// Remove and return a recipient's assignment
    pub async fn take_assignment(&self, user: UserId) -> Option<Invite> {
        self.state.write().await.take_assignment(user)
    }

    /// Drop the assignment holding `key`, returning its recipient
    pub async fn release(&self, key: &InviteKey) -> Option<UserId> {
        self.state.write().await.release(key)
    }

    /// Set an invite's status, returning the previous one
    pub async fn set_status(&self, key: &InviteKey, status: InviteStatus) -> Option<InviteStatus> {
        self.state.write().await.set_status(key, status)
    }

    /// Move a Pending invite to `status`; false when it was not Pending
    pub async fn close(&self, key: &InviteKey, status: InviteStatus) -> bool {
        let mut state = self.state.write().await;
        match state.invites.get_mut(key) {
            Some(invite) if invite.is_pending() => {
                invite.status = status;
                true
            }
            _ => false,
        }
    }

    pub async fn status(&self, key: &InviteKey) -> Option<InviteStatus> {
        self.state.read().await.invites.get(key).map(|i| i.status)
    }

    pub async fn invite(&self, key: &InviteKey) -> Option<Invite> {
        self.state.read().await.invites.get(key).cloned()
    }

    /// Recipient currently holding `key`
    pub async fn holder(&self, key: &InviteKey) -> Option<UserId> {
        self.state.read().await.holders.get(key).copied()
    }

    /// Assignments on `channel` whose link may still be redeemed or awaits the join, newest first
    pub async fn outstanding_on_channel(&self, channel: ChannelId) -> Vec<ActiveAssignment> {
        let state = self.state.read().await;
        let mut outstanding: Vec<ActiveAssignment> = state
            .holders
            .iter()
            .filter(|(key, _)| key.channel == channel)
            .filter_map(|(key, user)| {
                let invite = state.invites.get(key)?;
                matches!(invite.status, InviteStatus::Pending | InviteStatus::Consumed).then(|| {
                    ActiveAssignment {
                        recipient: *user,
                        invite: invite.clone(),
                    }
                })
            })
            .collect();

        outstanding.sort_by(|a, b| b.invite.created_at.cmp(&a.invite.created_at));
        outstanding
    }

    /// Pending assignments whose invite expired at or before `now`
    pub async fn expired(&self, now: DateTime<FixedOffset>) -> Vec<ActiveAssignment> {
        let state = self.state.read().await;
        state
            .assignments
            .keys()
            .filter_map(|user| state.assignment(*user))
            .filter(|a| a.invite.is_pending() && a.invite.is_expired_at(now))
            .collect()
    }

    /// Live approval-required invites that need a consumption watcher
    pub async fn watchable(&self, now: DateTime<FixedOffset>) -> Vec<Invite> {
        let state = self.state.read().await;
        state
            .assignments
            .values()
            .filter_map(|key| state.invites.get(key))
            .filter(|invite| invite.approval_required && invite.is_live_at(now))
            .cloned()
            .collect()
    }

    /// All assignments, ordered by recipient
    pub async fn snapshot(&self) -> Vec<ActiveAssignment> {
        let state = self.state.read().await;
        let mut assignments: Vec<ActiveAssignment> = state
            .assignments
            .keys()
            .filter_map(|user| state.assignment(*user))
            .collect();
        assignments.sort_by_key(|a| a.recipient);
        assignments
    }

    /// Forget closed invites whose link expired at or before `now`
    ///
    /// Their assignments go with them, as do recipient locks that nobody
    /// holds or waits on. Returns the forgotten keys.
    pub async fn prune(&self, now: DateTime<FixedOffset>) -> Vec<InviteKey> {
        let pruned = {
            let mut state = self.state.write().await;
            let stale: Vec<InviteKey> = state
                .invites
                .iter()
                .filter(|(_, invite)| invite.status.is_terminal() && invite.is_expired_at(now))
                .map(|(key, _)| key.clone())
                .collect();
            for key in &stale {
                state.release(key);
                state.invites.remove(key);
            }
            stale
        };

        let mut locks = self.recipient_locks.lock().await;
        let state = self.state.read().await;
        locks.retain(|user, lock| {
            Arc::strong_count(lock) > 1 || state.assignments.contains_key(user)
        });

        pruned
    }

    /// Number of assignments
    pub async fn len(&self) -> usize {
        self.state.read().await.assignments.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
