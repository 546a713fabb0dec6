//! Shared invite context
//!
//! Every component receives an `Arc<InviteContext>` instead of reaching for
//! process-wide state. The context also owns the remote-closing helpers, so
//! revocation stays idempotent no matter which path triggers it.

use super::gateway::MessagingGateway;
use super::registry::Registry;
use super::types::{Invite, InviteKey, InviteStatus, Tier, UserId};
use super::watcher::WatcherSet;
use crate::config::Config;
use crate::core_audit::{AuditAction, AuditLog, AuditRecord};
use crate::metrics;
use chrono::{DateTime, FixedOffset};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Which remote link to close and on whose behalf
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkRef {
    /// Issuance name (`linkv1`)
    pub tier: String,
    pub key: InviteKey,
    pub recipient: Option<UserId>,
}

impl LinkRef {
    pub fn new(tier: impl Into<String>, key: InviteKey, recipient: Option<UserId>) -> Self {
        Self {
            tier: tier.into(),
            key,
            recipient,
        }
    }

    fn record(&self, action: AuditAction) -> AuditRecord {
        let record = AuditRecord::new(action)
            .tier(self.tier.clone())
            .peer(self.key.channel)
            .link(self.key.link.clone());
        match self.recipient {
            Some(recipient) => record.target(recipient),
            None => record,
        }
    }
}

impl From<&Invite> for LinkRef {
    fn from(invite: &Invite) -> Self {
        LinkRef::new(invite.tier.clone(), invite.key(), Some(invite.recipient))
    }
}

/// Context bundle passed to every invite component
pub struct InviteContext {
    pub config: Arc<Config>,
    pub registry: Arc<Registry>,
    pub audit: Arc<AuditLog>,
    pub gateway: Arc<dyn MessagingGateway>,
    pub watchers: WatcherSet,

    /// Links already revoked on the gateway (or being revoked)
    revoked: Mutex<HashSet<InviteKey>>,

    /// Links whose pending requests were already declined
    declined: Mutex<HashSet<InviteKey>>,
}

impl InviteContext {
    pub fn new(
        config: Arc<Config>,
        registry: Arc<Registry>,
        audit: Arc<AuditLog>,
        gateway: Arc<dyn MessagingGateway>,
    ) -> Self {
        Self {
            config,
            registry,
            audit,
            gateway,
            watchers: WatcherSet::new(),
            revoked: Mutex::new(HashSet::new()),
            declined: Mutex::new(HashSet::new()),
        }
    }

    /// Resolve a tier by key or issuance name
    pub fn tier(&self, name: &str) -> Option<Tier> {
        self.config.tier(name)
    }

    /// Whether `key` has been revoked on the gateway by this process
    pub fn is_revoked(&self, key: &InviteKey) -> bool {
        self.revoked
            .lock()
            .map(|revoked| revoked.contains(key))
            .unwrap_or(false)
    }

    /// Revoke a link on the gateway
    ///
    /// Repeated calls for the same link are no-ops that report success. A
    /// link the gateway no longer knows counts as revoked. Returns false
    /// when the gateway call failed (logged as `revoke_err`).
    pub async fn revoke_link(&self, link: &LinkRef) -> bool {
        if !claim(&self.revoked, &link.key) {
            debug!(link = %link.key, "Link already revoked");
            return true;
        }

        match self
            .gateway
            .revoke_invite(link.key.channel, &link.key.link)
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                debug!(link = %link.key, "Link already gone on the gateway");
            }
            Err(e) => {
                release(&self.revoked, &link.key);
                metrics::record_gateway_failure("revoke_invite");
                self.audit.record(link.record(AuditAction::RevokeErr).error(&e));
                return false;
            }
        }

        self.audit.record(link.record(AuditAction::InviteRevoked));
        true
    }

    /// Decline every pending join request made through a link
    pub async fn decline(&self, link: &LinkRef) -> bool {
        if !claim(&self.declined, &link.key) {
            return true;
        }

        match self
            .gateway
            .decline_pending_requests(link.key.channel, &link.key.link)
            .await
        {
            Ok(()) => true,
            Err(e) if e.is_not_found() => true,
            Err(e) => {
                release(&self.declined, &link.key);
                metrics::record_gateway_failure("decline_pending_requests");
                self.audit.record(link.record(AuditAction::DeclineErr).error(&e));
                false
            }
        }
    }

    /// Revoke then decline; returns whether the revoke succeeded
    pub async fn close_link(&self, link: &LinkRef) -> bool {
        let revoked = self.revoke_link(link).await;
        self.decline(link).await;
        revoked
    }

    /// Arm a consumption watcher for `invite`; false when one is already armed
    pub fn arm_watcher(self: &Arc<Self>, invite: Invite) -> bool {
        self.watchers.arm(self.clone(), invite)
    }

    /// Close every Pending assignment that expired at or before `now`
    ///
    /// No remote revoke is issued: the gateway retires expired links itself.
    /// Invites closed before this sweep and past their expiry are forgotten
    /// first, along with their revoke and decline claims.
    pub async fn sweep_expired(&self, now: DateTime<FixedOffset>) -> usize {
        let pruned = self.registry.prune(now).await;
        if !pruned.is_empty() {
            forget(&self.revoked, &pruned);
            forget(&self.declined, &pruned);
            debug!(pruned = pruned.len(), "Forgot closed invites");
        }

        let mut swept = 0;

        for assignment in self.registry.expired(now).await {
            let _guard = self.registry.lock_recipient(assignment.recipient).await;
            let invite = assignment.invite;
            let key = invite.key();

            if !self.registry.close(&key, InviteStatus::Expired).await {
                continue;
            }
            self.registry.release(&key).await;
            self.watchers.cancel(&key);

            self.audit.record(
                LinkRef::from(&invite)
                    .record(AuditAction::InviteExpired)
                    .status(InviteStatus::Expired.as_str()),
            );
            swept += 1;
        }

        if swept > 0 {
            metrics::record_counter(metrics::INVITES_EXPIRED, swept as u64);
            info!(swept, "Expired pending invites");
        }
        swept
    }
}

fn claim(set: &Mutex<HashSet<InviteKey>>, key: &InviteKey) -> bool {
    match set.lock() {
        Ok(mut set) => set.insert(key.clone()),
        Err(_) => {
            warn!(link = %key, "Link tracking lock poisoned");
            true
        }
    }
}

fn release(set: &Mutex<HashSet<InviteKey>>, key: &InviteKey) {
    if let Ok(mut set) = set.lock() {
        set.remove(key);
    }
}

fn forget(set: &Mutex<HashSet<InviteKey>>, keys: &[InviteKey]) {
    if let Ok(mut set) = set.lock() {
        for key in keys {
            set.remove(key);
        }
    }
}
