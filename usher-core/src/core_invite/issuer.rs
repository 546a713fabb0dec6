//! Invite Issuer
//!
//! Creates invites for a (tier, recipient) pair. Issuance for one recipient
//! is serialized by the registry's per-recipient lock, which covers the
//! dedupe check, the gateway call, supersession of the previous invite and
//! installation of the new one.

use super::context::{InviteContext, LinkRef};
use super::errors::{GatewayError, InviteError, InviteResult};
use super::gateway::CreateInvite;
use super::types::{now, Invite, InviteKey, InviteStatus, IssueOrigin, Tier, UserId};
use crate::core_audit::{AuditAction, AuditRecord};
use crate::metrics;
use chrono::{DateTime, FixedOffset};
use hashlink::LruCache;
use std::sync::{Arc, Mutex};
use tokio::time::Instant;
use tracing::{debug, info};

/// A request to issue an invite
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssueRequest {
    /// Tier key or issuance name
    pub tier: String,
    pub recipient: UserId,
    pub origin: IssueOrigin,
    /// Overrides the tier's approval mode
    pub require_approval: Option<bool>,
    /// Relay quantity, recorded alongside the issuance
    pub request_no: Option<u32>,
}

impl IssueRequest {
    pub fn new(tier: impl Into<String>, recipient: UserId) -> Self {
        Self {
            tier: tier.into(),
            recipient,
            origin: IssueOrigin::Combo,
            require_approval: None,
            request_no: None,
        }
    }

    pub fn origin(mut self, origin: IssueOrigin) -> Self {
        self.origin = origin;
        self
    }

    pub fn require_approval(mut self, required: bool) -> Self {
        self.require_approval = Some(required);
        self
    }

    pub fn request_no(mut self, request_no: Option<u32>) -> Self {
        self.request_no = request_no;
        self
    }
}

type DedupeKey = (String, UserId);

/// Issues invites and keeps the one-pending-invite-per-recipient invariant
pub struct InviteIssuer {
    ctx: Arc<InviteContext>,
    dedupe: Mutex<LruCache<DedupeKey, (InviteKey, Instant)>>,
}

impl InviteIssuer {
    pub fn new(ctx: Arc<InviteContext>) -> Self {
        let capacity = ctx.config.invite.dedupe_capacity.max(1);

        Self {
            ctx,
            dedupe: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn context(&self) -> &Arc<InviteContext> {
        &self.ctx
    }

    /// Issue an invite, reusing a fresh one from the dedupe window
    pub async fn issue(&self, request: IssueRequest) -> InviteResult<Invite> {
        let tier = match self.ctx.tier(&request.tier) {
            Some(tier) => tier,
            None => {
                self.ctx.audit.record(
                    AuditRecord::new(AuditAction::InviteError)
                        .tier(request.tier.clone())
                        .error("peer_not_configured"),
                );
                return Err(InviteError::Configuration(format!(
                    "peer_not_configured: {}",
                    request.tier
                )));
            }
        };

        let _guard = self.ctx.registry.lock_recipient(request.recipient).await;
        let issued_at = now();

        if let Some(invite) = self.cached(&tier, request.recipient, issued_at).await {
            metrics::record_counter(metrics::INVITES_DEDUPE_HITS, 1);
            debug!(
                tier = %tier.key,
                recipient = %request.recipient,
                link = %invite.link,
                "Returning invite from dedupe window"
            );
            return Ok(invite);
        }

        let approval_required = request.require_approval.unwrap_or(tier.approval_required);
        let link = self.create(&tier, approval_required, issued_at).await?;

        let invite = Invite {
            link,
            tier: tier.link_name(),
            channel_id: tier.channel_id,
            recipient: request.recipient,
            created_at: issued_at,
            expires_at: expires_at(issued_at, &tier),
            approval_required,
            usage_limit: (!approval_required).then_some(tier.usage_limit),
            status: InviteStatus::Pending,
        };

        if let Some(previous) = self.ctx.registry.take_assignment(request.recipient).await {
            self.supersede(previous, &invite, issued_at).await;
        }
        self.ctx.registry.install(invite.clone()).await;

        let action = match request.origin {
            IssueOrigin::Combo => AuditAction::InviteSent,
            IssueOrigin::Manual => AuditAction::InviteSentManual,
        };
        self.ctx.audit.record(
            AuditRecord::at(issued_at, action)
                .tier(invite.tier.clone())
                .peer(invite.channel_id)
                .target(invite.recipient)
                .link(invite.link.clone())
                .status(InviteStatus::Pending.as_str())
                .expires_at(invite.expires_at)
                .req_no(request.request_no),
        );

        self.remember(&tier, request.recipient, invite.key());
        if approval_required {
            self.ctx.arm_watcher(invite.clone());
        }

        metrics::record_counter(metrics::INVITES_ISSUED, 1);
        info!(
            tier = %invite.tier,
            recipient = %invite.recipient,
            link = %invite.link,
            approval_required,
            "Invite issued"
        );
        Ok(invite)
    }

    async fn create(
        &self,
        tier: &Tier,
        approval_required: bool,
        issued_at: DateTime<FixedOffset>,
    ) -> InviteResult<String> {
        let request = CreateInvite {
            channel: tier.channel_id,
            expires_at: expires_at(issued_at, tier),
            approval_required,
            usage_limit: (!approval_required).then_some(tier.usage_limit),
        };

        let result = match self.ctx.gateway.create_invite(request).await {
            Ok(link) if link.trim().is_empty() => Err(GatewayError::NoLinkReturned),
            other => other,
        };

        result.map_err(|e| {
            metrics::record_gateway_failure("create_invite");
            self.ctx.audit.record(
                AuditRecord::new(AuditAction::InviteError)
                    .tier(tier.link_name())
                    .peer(tier.channel_id)
                    .error(&e),
            );
            InviteError::from(e)
        })
    }

    /// Retire the recipient's previous invite in favour of `replacement`
    async fn supersede(&self, previous: Invite, replacement: &Invite, at: DateTime<FixedOffset>) {
        let key = previous.key();
        self.ctx.watchers.cancel(&key);

        if !previous.is_pending() {
            debug!(link = %key, status = %previous.status, "Dropping closed assignment");
            return;
        }

        if previous.is_expired_at(at) {
            self.ctx.registry.close(&key, InviteStatus::Expired).await;
            self.ctx.audit.record(
                AuditRecord::new(AuditAction::InviteExpired)
                    .tier(previous.tier.clone())
                    .peer(previous.channel_id)
                    .target(previous.recipient)
                    .link(previous.link.clone())
                    .status(InviteStatus::Expired.as_str()),
            );
            return;
        }

        self.ctx.close_link(&LinkRef::from(&previous)).await;
        self.ctx.registry.close(&key, InviteStatus::Revoked).await;
        self.ctx.audit.record(
            AuditRecord::new(AuditAction::InviteSuperseded)
                .tier(previous.tier.clone())
                .peer(previous.channel_id)
                .target(previous.recipient)
                .link(previous.link.clone())
                .superseded_by(replacement.link.clone()),
        );
        metrics::record_counter(metrics::INVITES_SUPERSEDED, 1);

        let superseded = InviteError::RaceSuperseded {
            recipient: previous.recipient.to_string(),
            old: previous.link,
            new: replacement.link.clone(),
        };
        info!("{}", superseded);
    }

    async fn cached(
        &self,
        tier: &Tier,
        recipient: UserId,
        at: DateTime<FixedOffset>,
    ) -> Option<Invite> {
        let window = self.ctx.config.invite.dedupe_window;
        let cached = {
            let mut cache = self.dedupe.lock().unwrap_or_else(|e| e.into_inner());
            let entry = (tier.key.clone(), recipient);
            let fresh = cache
                .get(&entry)
                .map(|(key, inserted)| (key.clone(), inserted.elapsed() < window));
            match fresh {
                Some((key, true)) => Some(key),
                Some((_, false)) => {
                    cache.remove(&entry);
                    None
                }
                None => None,
            }
        }?;

        // Only reuse what the recipient still holds
        self.ctx
            .registry
            .live_assignment(recipient, at)
            .await
            .map(|assignment| assignment.invite)
            .filter(|invite| invite.key() == cached)
    }

    fn remember(&self, tier: &Tier, recipient: UserId, key: InviteKey) {
        let mut cache = self.dedupe.lock().unwrap_or_else(|e| e.into_inner());
        cache.insert((tier.key.clone(), recipient), (key, Instant::now()));
    }
}

fn expires_at(issued_at: DateTime<FixedOffset>, tier: &Tier) -> DateTime<FixedOffset> {
    let ttl = chrono::Duration::from_std(tier.ttl).unwrap_or_else(|_| chrono::Duration::days(1));
    issued_at + ttl
}
