//! Join Reconciler
//!
//! Turns membership events into lifecycle transitions. A join is resolved
//! in this order:
//!
//! 1. exact match: the joiner holds an assignment on the channel;
//! 2. channel fallback: someone else holds an outstanding assignment on the
//!    channel, so the joiner used a link that was not theirs;
//! 3. cold start: nothing in the registry, so the audit log is searched for
//!    the joiner's latest open issuance.

use super::context::{InviteContext, LinkRef};
use super::gateway::GatewayEvent;
use super::types::{ActiveAssignment, ChannelId, Invite, InviteKey, InviteStatus, UserId};
use crate::core_audit::{AuditAction, AuditRecord};
use crate::metrics;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// How a membership event was resolved
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// The intended recipient joined
    Consumed(Invite),
    /// Someone else joined through a recipient's link and was removed
    Abuse { invite: Invite, joiner: UserId },
    /// Resolved from the audit log after a restart
    Fallback(AuditRecord),
    /// Nothing to do
    Ignored,
}

/// Reacts to gateway membership events
pub struct InviteReconciler {
    ctx: Arc<InviteContext>,
}

impl InviteReconciler {
    pub fn new(ctx: Arc<InviteContext>) -> Self {
        Self { ctx }
    }

    /// Handle one inbound gateway event
    pub async fn handle_event(&self, event: GatewayEvent) -> Resolution {
        match event {
            GatewayEvent::MemberJoined {
                channel,
                user,
                link,
            } => self.reconcile_join(channel, user, link.as_deref(), true).await,
            GatewayEvent::MemberAdded { channel, user } => {
                self.reconcile_join(channel, user, None, false).await
            }
            GatewayEvent::JoinRequested { channel, user, .. } => {
                let woken = self.ctx.watchers.nudge_channel(channel);
                debug!(%channel, %user, woken, "Join request; nudged watchers");
                Resolution::Ignored
            }
            GatewayEvent::MessageReceived { .. } => Resolution::Ignored,
        }
    }

    /// Resolve a join of `user` into `channel`
    ///
    /// `detect_abuse` is false for administrator adds, which never go
    /// through a link.
    pub async fn reconcile_join(
        &self,
        channel: ChannelId,
        user: UserId,
        link: Option<&str>,
        detect_abuse: bool,
    ) -> Resolution {
        if self.ctx.config.tier_for_channel(channel).is_none() {
            debug!(%channel, %user, "Join on unmanaged channel");
            return Resolution::Ignored;
        }

        let guard = self.ctx.registry.lock_recipient(user).await;

        if let Some(assignment) = self.ctx.registry.assignment(user).await {
            if assignment.invite.channel_id == channel {
                return self.consume(assignment.invite).await;
            }
        }

        if detect_abuse {
            if let Some(victim) = self.exposed_assignment(channel, user, link).await {
                // Only one recipient lock is ever held at a time
                drop(guard);
                return self.abuse(victim, user).await;
            }
        }

        self.cold_start(channel, user).await
    }

    async fn consume(&self, invite: Invite) -> Resolution {
        let key = invite.key();
        self.ctx.watchers.cancel(&key);
        self.ctx.close_link(&LinkRef::from(&invite)).await;

        // An abused link stays Revoked
        self.ctx.registry.close(&key, InviteStatus::Consumed).await;
        self.ctx.registry.release(&key).await;

        self.ctx.audit.record(
            AuditRecord::new(AuditAction::InviteConsumed)
                .tier(invite.tier.clone())
                .peer(invite.channel_id)
                .target(invite.recipient)
                .link(invite.link.clone()),
        );
        metrics::record_counter(metrics::INVITES_CONSUMED, 1);
        info!(recipient = %invite.recipient, link = %key, "Invite consumed by its recipient");

        let invite = self.ctx.registry.invite(&key).await.unwrap_or(invite);
        Resolution::Consumed(invite)
    }

    /// Outstanding assignment on `channel` held by someone other than `joiner`
    async fn exposed_assignment(
        &self,
        channel: ChannelId,
        joiner: UserId,
        link: Option<&str>,
    ) -> Option<ActiveAssignment> {
        let mut outstanding = self
            .ctx
            .registry
            .outstanding_on_channel(channel)
            .await
            .into_iter()
            .filter(|assignment| assignment.recipient != joiner);

        match link {
            Some(link) => outstanding.find(|assignment| assignment.invite.link == link),
            None => outstanding.next(),
        }
    }

    async fn abuse(&self, victim: ActiveAssignment, joiner: UserId) -> Resolution {
        let _guard = self.ctx.registry.lock_recipient(victim.recipient).await;
        let key = victim.invite.key();
        let invite = self
            .ctx
            .registry
            .invite(&key)
            .await
            .unwrap_or(victim.invite);

        if let Err(e) = self.ctx.gateway.kick_member(invite.channel_id, joiner).await {
            metrics::record_gateway_failure("kick_member");
            self.ctx.audit.record(
                AuditRecord::new(AuditAction::KickErr)
                    .tier(invite.tier.clone())
                    .peer(invite.channel_id)
                    .target(invite.recipient)
                    .joiner(joiner)
                    .link(invite.link.clone())
                    .error(&e),
            );
        }

        self.ctx.audit.record(
            AuditRecord::new(AuditAction::InviteAbusedKicked)
                .tier(invite.tier.clone())
                .peer(invite.channel_id)
                .target(invite.recipient)
                .joiner(joiner)
                .link(invite.link.clone()),
        );
        warn!(
            recipient = %invite.recipient,
            %joiner,
            link = %key,
            "Invite redeemed by someone else; joiner removed"
        );

        self.ctx.watchers.cancel(&key);
        self.ctx.close_link(&LinkRef::from(&invite)).await;
        self.ctx.registry.close(&key, InviteStatus::Revoked).await;
        metrics::record_counter(metrics::INVITES_ABUSED, 1);

        let invite = self.ctx.registry.invite(&key).await.unwrap_or(invite);
        Resolution::Abuse { invite, joiner }
    }

    async fn cold_start(&self, channel: ChannelId, user: UserId) -> Resolution {
        let scan = self
            .ctx
            .audit
            .latest_issuance(user, Some(channel), &self.ctx.config);
        let record = match scan {
            Ok(Some(record)) => record,
            Ok(None) => {
                debug!(%channel, %user, "No issuance on record for joiner");
                return Resolution::Ignored;
            }
            Err(e) => {
                warn!(%channel, %user, error = %e, "Audit log scan failed");
                return Resolution::Ignored;
            }
        };

        let Some(link) = record.link.clone() else {
            return Resolution::Ignored;
        };
        let key = InviteKey::new(record.peer.unwrap_or(channel), link);
        let tier = record.tier.clone().unwrap_or_default();

        self.ctx.watchers.cancel(&key);
        self.ctx
            .close_link(&LinkRef::new(tier.clone(), key.clone(), Some(user)))
            .await;
        self.ctx.registry.close(&key, InviteStatus::Consumed).await;

        let fallback = AuditRecord::new(AuditAction::InviteConsumedFallback)
            .tier(tier)
            .peer(key.channel)
            .target(user)
            .link(key.link.clone());
        self.ctx.audit.record(fallback.clone());
        metrics::record_counter(metrics::INVITES_FALLBACK, 1);
        info!(%user, link = %key, "Join reconciled from audit log");

        Resolution::Fallback(fallback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, TierConfig};
    use crate::core_audit::{read_records, AuditLog};
    use crate::core_invite::adapters::{GatewayCall, MockGateway};
    use crate::core_invite::registry::Registry;
    use crate::core_invite::types::now;
    use tempfile::tempdir;

    const CHANNEL: ChannelId = ChannelId(-100);

    fn setup(dir: &std::path::Path) -> (InviteReconciler, Arc<MockGateway>) {
        let mut config = Config::default();
        config.tiers.insert("v1".to_string(), TierConfig::new(CHANNEL.0));
        setup_with(dir, config)
    }

    fn setup_with(dir: &std::path::Path, config: Config) -> (InviteReconciler, Arc<MockGateway>) {
        let gateway = Arc::new(MockGateway::new());
        let ctx = Arc::new(InviteContext::new(
            Arc::new(config),
            Arc::new(Registry::new()),
            Arc::new(AuditLog::open(dir.join("log.jsonl")).unwrap()),
            gateway.clone(),
        ));
        (InviteReconciler::new(ctx), gateway)
    }

    fn invite(user: i64, link: &str, status: InviteStatus) -> Invite {
        let created = now();
        Invite {
            link: link.to_string(),
            tier: "linkv1".to_string(),
            channel_id: CHANNEL,
            recipient: UserId(user),
            created_at: created,
            expires_at: created + chrono::Duration::hours(24),
            approval_required: true,
            usage_limit: None,
            status,
        }
    }

    fn joined(user: i64) -> GatewayEvent {
        GatewayEvent::MemberJoined {
            channel: CHANNEL,
            user: UserId(user),
            link: None,
        }
    }

    #[tokio::test]
    async fn test_exact_match_after_watcher_consumed() {
        let dir = tempdir().unwrap();
        let (reconciler, gateway) = setup(dir.path());
        let ctx = reconciler.ctx.clone();

        let inv = invite(1, "https://t.me/+a", InviteStatus::Consumed);
        ctx.registry.install(inv.clone()).await;

        let resolution = reconciler.handle_event(joined(1)).await;
        match resolution {
            Resolution::Consumed(invite) => assert_eq!(invite.status, InviteStatus::Consumed),
            other => panic!("unexpected resolution: {:?}", other),
        }
        assert!(ctx.registry.assignment(UserId(1)).await.is_none());
        assert_eq!(
            gateway.count_calls(|c| matches!(c, GatewayCall::RevokeInvite { .. })),
            1
        );
    }

    #[tokio::test]
    async fn test_admin_add_is_not_abuse() {
        let dir = tempdir().unwrap();
        let (reconciler, gateway) = setup(dir.path());
        reconciler
            .ctx
            .registry
            .install(invite(1, "https://t.me/+a", InviteStatus::Pending))
            .await;

        let resolution = reconciler
            .handle_event(GatewayEvent::MemberAdded {
                channel: CHANNEL,
                user: UserId(2),
            })
            .await;

        assert_eq!(resolution, Resolution::Ignored);
        assert_eq!(gateway.count_calls(|c| matches!(c, GatewayCall::KickMember { .. })), 0);
    }

    #[tokio::test]
    async fn test_abuse_matches_reported_link() {
        let dir = tempdir().unwrap();
        let (reconciler, gateway) = setup(dir.path());
        let ctx = reconciler.ctx.clone();
        ctx.registry
            .install(invite(1, "https://t.me/+a", InviteStatus::Pending))
            .await;
        ctx.registry
            .install(invite(2, "https://t.me/+b", InviteStatus::Pending))
            .await;

        let resolution = reconciler
            .handle_event(GatewayEvent::MemberJoined {
                channel: CHANNEL,
                user: UserId(3),
                link: Some("https://t.me/+a".to_string()),
            })
            .await;

        match resolution {
            Resolution::Abuse { invite, joiner } => {
                assert_eq!(invite.recipient, UserId(1));
                assert_eq!(invite.status, InviteStatus::Revoked);
                assert_eq!(joiner, UserId(3));
            }
            other => panic!("unexpected resolution: {:?}", other),
        }

        // Victim keeps the assignment; the other recipient is untouched
        assert!(ctx.registry.assignment(UserId(1)).await.is_some());
        let b = InviteKey::new(CHANNEL, "https://t.me/+b");
        assert_eq!(ctx.registry.status(&b).await, Some(InviteStatus::Pending));
        assert_eq!(
            gateway.count_calls(
                |c| matches!(c, GatewayCall::KickMember { user, .. } if *user == UserId(3))
            ),
            1
        );
    }

    #[tokio::test]
    async fn test_kick_failure_is_recorded() {
        let dir = tempdir().unwrap();
        let (reconciler, gateway) = setup(dir.path());
        gateway.fail_kick(crate::core_invite::errors::GatewayError::PermissionDenied(
            "ban rights".to_string(),
        ));
        reconciler
            .ctx
            .registry
            .install(invite(1, "https://t.me/+a", InviteStatus::Pending))
            .await;

        reconciler.handle_event(joined(9)).await;

        let actions: Vec<AuditAction> = read_records(reconciler.ctx.audit.path())
            .unwrap()
            .into_iter()
            .map(|r| r.action)
            .collect();
        assert!(actions.contains(&AuditAction::KickErr));
        assert!(actions.contains(&AuditAction::InviteAbusedKicked));
    }

    #[tokio::test]
    async fn test_unmanaged_channel_is_ignored() {
        let dir = tempdir().unwrap();
        let (reconciler, gateway) = setup(dir.path());

        let resolution = reconciler
            .handle_event(GatewayEvent::MemberJoined {
                channel: ChannelId(-999),
                user: UserId(1),
                link: None,
            })
            .await;

        assert_eq!(resolution, Resolution::Ignored);
        assert!(gateway.calls().is_empty());
    }

    #[tokio::test]
    async fn test_cold_start_skips_closed_links() {
        let dir = tempdir().unwrap();
        let (reconciler, gateway) = setup(dir.path());
        let audit = &reconciler.ctx.audit;

        audit
            .append(
                &AuditRecord::new(AuditAction::InviteSent)
                    .tier("linkv1")
                    .peer(CHANNEL)
                    .target(UserId(4))
                    .link("https://t.me/+old"),
            )
            .unwrap();
        audit
            .append(
                &AuditRecord::new(AuditAction::InviteConsumed)
                    .tier("linkv1")
                    .peer(CHANNEL)
                    .target(UserId(4))
                    .link("https://t.me/+old"),
            )
            .unwrap();

        assert_eq!(reconciler.handle_event(joined(4)).await, Resolution::Ignored);
        assert!(gateway.calls().is_empty());
    }

    #[tokio::test]
    async fn test_cold_start_places_peerless_record_on_its_tier_channel() {
        let dir = tempdir().unwrap();
        let mut config = Config::default();
        config.tiers.insert("v1".to_string(), TierConfig::new(-1001));
        config.tiers.insert("v2".to_string(), TierConfig::new(-1002));
        let (reconciler, gateway) = setup_with(dir.path(), config);

        // Older writers left out `peer`
        reconciler
            .ctx
            .audit
            .append(
                &AuditRecord::new(AuditAction::InviteSent)
                    .tier("linkv2")
                    .target(UserId(31))
                    .link("https://t.me/+vip2"),
            )
            .unwrap();

        let wrong_channel = reconciler
            .handle_event(GatewayEvent::MemberJoined {
                channel: ChannelId(-1001),
                user: UserId(31),
                link: None,
            })
            .await;
        assert_eq!(wrong_channel, Resolution::Ignored);
        assert!(gateway.calls().is_empty());

        let resolution = reconciler
            .handle_event(GatewayEvent::MemberJoined {
                channel: ChannelId(-1002),
                user: UserId(31),
                link: None,
            })
            .await;
        match resolution {
            Resolution::Fallback(record) => {
                assert_eq!(record.peer, Some(ChannelId(-1002)));
                assert_eq!(record.link.as_deref(), Some("https://t.me/+vip2"));
            }
            other => panic!("unexpected resolution: {:?}", other),
        }
        assert_eq!(
            gateway.calls(),
            vec![
                GatewayCall::RevokeInvite {
                    channel: ChannelId(-1002),
                    link: "https://t.me/+vip2".to_string(),
                },
                GatewayCall::DeclinePendingRequests {
                    channel: ChannelId(-1002),
                    link: "https://t.me/+vip2".to_string(),
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_abuse_waits_for_victim_lock() {
        let dir = tempdir().unwrap();
        let (reconciler, gateway) = setup(dir.path());
        let reconciler = Arc::new(reconciler);
        let ctx = reconciler.ctx.clone();
        ctx.registry
            .install(invite(1, "https://t.me/+a", InviteStatus::Pending))
            .await;

        let victim_guard = ctx.registry.lock_recipient(UserId(1)).await;
        let task = {
            let reconciler = reconciler.clone();
            tokio::spawn(async move { reconciler.handle_event(joined(2)).await })
        };
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(!task.is_finished());
        assert!(gateway.calls().is_empty());

        drop(victim_guard);
        match task.await.unwrap() {
            Resolution::Abuse { invite, joiner } => {
                assert_eq!(invite.recipient, UserId(1));
                assert_eq!(joiner, UserId(2));
            }
            other => panic!("unexpected resolution: {:?}", other),
        }
    }
}
