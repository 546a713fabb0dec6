//! End-to-end invite lifecycle tests against the mock gateway

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tempfile::tempdir;
use usher_core::config::{ComboOrder, Config, TierConfig};
use usher_core::core_audit::{read_records, AuditAction, AuditRecord};
use usher_core::core_invite::adapters::{GatewayCall, MockGateway};
use usher_core::core_invite::types::now;
use usher_core::core_invite::{
    ChannelId, ComboOutcome, ComboRequest, GatewayEvent, InviteKey, InviteService, InviteStatus,
    IssueRequest, LinkRef, Peer, Resolution, UserId,
};

const VIP1: ChannelId = ChannelId(-1001);
const VIP2: ChannelId = ChannelId(-1002);

fn config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.tiers.insert("v1".to_string(), TierConfig::new(VIP1.0));

    let mut open = TierConfig::new(VIP2.0);
    open.approval_required = false;
    config.tiers.insert("v2".to_string(), open);

    config.relay.bot_username = "@main_bot".to_string();
    config.storage.invite_log = dir.join("invite_log.jsonl");
    config
}

fn service(config: Config) -> (InviteService, Arc<MockGateway>) {
    let gateway = Arc::new(MockGateway::new());
    let service = InviteService::new(config, gateway.clone()).unwrap();
    (service, gateway)
}

fn records(service: &InviteService) -> Vec<AuditRecord> {
    read_records(service.context().audit.path()).unwrap()
}

fn count(records: &[AuditRecord], action: AuditAction) -> usize {
    records.iter().filter(|r| r.action == action).count()
}

fn joined(channel: ChannelId, user: i64) -> GatewayEvent {
    GatewayEvent::MemberJoined {
        channel,
        user: UserId(user),
        link: None,
    }
}

fn is_create(call: &GatewayCall) -> bool {
    matches!(call, GatewayCall::CreateInvite(_))
}

fn is_revoke(call: &GatewayCall) -> bool {
    matches!(call, GatewayCall::RevokeInvite { .. })
}

fn is_decline(call: &GatewayCall) -> bool {
    matches!(call, GatewayCall::DeclinePendingRequests { .. })
}

fn is_poll(call: &GatewayCall) -> bool {
    matches!(call, GatewayCall::CountPendingRequests { .. })
}

#[tokio::test(start_paused = true)]
async fn test_combo_relay_first_delivers_link() {
    let dir = tempdir().unwrap();
    let (service, gateway) = service(config(dir.path()));
    gateway.queue_links(["https://t.me/+abc"]);

    let outcome = service
        .orchestrator()
        .run(ComboRequest::new("v1", UserId(555)))
        .await
        .unwrap();

    let invite = match outcome {
        ComboOutcome::Delivered(invite) => invite,
        other => panic!("unexpected outcome: {:?}", other),
    };
    assert_eq!(invite.link, "https://t.me/+abc");
    assert_eq!(invite.expires_at - invite.created_at, chrono::Duration::seconds(86_400));

    let records = records(&service);
    let sent = records
        .iter()
        .find(|r| r.action == AuditAction::InviteSent)
        .unwrap();
    assert_eq!(sent.tier.as_deref(), Some("linkv1"));
    assert_eq!(sent.target, Some(UserId(555)));
    assert_eq!(sent.link.as_deref(), Some("https://t.me/+abc"));
    assert_eq!(sent.status.as_deref(), Some("pending"));

    let delivered = gateway.messages_to(&Peer::User(UserId(555)));
    assert_eq!(delivered.len(), 1);
    assert!(delivered[0].contains("https://t.me/+abc"));
    assert!(delivered[0].contains("VIP1"));

    // Relay lands before the invite is created
    let calls = gateway.calls();
    let relay = calls
        .iter()
        .position(|c| matches!(c, GatewayCall::SendMessage { to: Peer::Username(_), .. }))
        .unwrap();
    let create = calls.iter().position(is_create).unwrap();
    assert!(relay < create);
    assert_eq!(
        gateway.messages_to(&Peer::Username("@main_bot".to_string())),
        vec!["/addv1 555".to_string()]
    );
}

#[tokio::test(start_paused = true)]
async fn test_combo_relay_reply_and_request_no_clipping() {
    let dir = tempdir().unwrap();
    let (service, gateway) = service(config(dir.path()));
    gateway.auto_reply_from("@main_bot");

    let started = tokio::time::Instant::now();
    service
        .orchestrator()
        .run(ComboRequest::new("v1", UserId(9)).with_request_no(250))
        .await
        .unwrap();

    // Reply arrives at once, so only the settle delay elapses
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(5));
    assert!(elapsed < Duration::from_secs(10));
    assert_eq!(
        gateway.messages_to(&Peer::Username("@main_bot".to_string())),
        vec!["/addv1 9 100".to_string()]
    );

    let records = records(&service);
    let relay = records
        .iter()
        .find(|r| r.action == AuditAction::RelayAddv)
        .unwrap();
    assert_eq!(relay.req_no, Some(100));
    assert_eq!(relay.to.as_deref(), Some("@main_bot"));
}

#[tokio::test(start_paused = true)]
async fn test_combo_parallel_runs_both_halves() {
    let dir = tempdir().unwrap();
    let mut config = config(dir.path());
    config.relay.order = ComboOrder::Parallel;
    let (service, gateway) = service(config);

    let outcome = service
        .orchestrator()
        .run(ComboRequest::new("v2", UserId(77)))
        .await
        .unwrap();

    match outcome {
        ComboOutcome::Spawned { relay, issuance } => {
            relay.await.unwrap();
            issuance.await.unwrap();
        }
        other => panic!("unexpected outcome: {:?}", other),
    }

    assert_eq!(gateway.count_calls(is_create), 1);
    assert_eq!(gateway.messages_to(&Peer::Username("@main_bot".to_string())).len(), 1);
    assert_eq!(gateway.messages_to(&Peer::User(UserId(77))).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_combo_disabled_only_relays() {
    let dir = tempdir().unwrap();
    let mut config = config(dir.path());
    config.relay.combo_enabled = false;
    let (service, gateway) = service(config);

    let outcome = service
        .orchestrator()
        .run(ComboRequest::new("v1", UserId(1)))
        .await
        .unwrap();

    assert!(matches!(outcome, ComboOutcome::RelayOnly));
    assert_eq!(gateway.count_calls(is_create), 0);
}

#[tokio::test(start_paused = true)]
async fn test_delivery_failure_is_recorded() {
    let dir = tempdir().unwrap();
    let (service, gateway) = service(config(dir.path()));
    gateway.fail_send(usher_core::core_invite::GatewayError::SendFailed(
        "user blocked".to_string(),
    ));

    let result = service.orchestrator().issue_manual("v1", UserId(3)).await;
    assert!(result.is_err());

    let records = records(&service);
    assert_eq!(count(&records, AuditAction::InviteSentManual), 1);
    assert_eq!(count(&records, AuditAction::InviteDmFailed), 1);
}

#[tokio::test(start_paused = true)]
async fn test_dedupe_returns_same_link() {
    let dir = tempdir().unwrap();
    let (service, gateway) = service(config(dir.path()));

    let first = service
        .issuer()
        .issue(IssueRequest::new("v1", UserId(10)))
        .await
        .unwrap();
    let second = service
        .issuer()
        .issue(IssueRequest::new("v1", UserId(10)))
        .await
        .unwrap();

    assert_eq!(first.link, second.link);
    assert_eq!(gateway.count_calls(is_create), 1);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_issuance_keeps_one_pending() {
    let dir = tempdir().unwrap();
    let (service, gateway) = service(config(dir.path()));
    let issuer = service.issuer().clone();

    let requests = ["v1", "v2", "v1", "v2"].map(|tier| {
        let issuer = issuer.clone();
        tokio::spawn(async move { issuer.issue(IssueRequest::new(tier, UserId(20))).await })
    });
    let invites: Vec<_> = futures::future::join_all(requests)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect();

    let registry = &service.context().registry;
    let mut pending = 0;
    for invite in &invites {
        if registry.status(&invite.key()).await == Some(InviteStatus::Pending) {
            pending += 1;
        }
    }
    assert_eq!(pending, 1);
    assert_eq!(registry.len().await, 1);

    let creates = gateway.count_calls(is_create);
    assert_eq!(gateway.count_calls(is_revoke), creates - 1);
    assert_eq!(count(&records(&service), AuditAction::InviteSuperseded), creates - 1);
}

#[tokio::test(start_paused = true)]
async fn test_revoke_twice_is_noop() {
    let dir = tempdir().unwrap();
    let (service, gateway) = service(config(dir.path()));
    let ctx = service.context();

    let link = LinkRef::new("linkv1", InviteKey::new(VIP1, "https://t.me/+twice"), None);
    assert!(ctx.revoke_link(&link).await);
    assert!(ctx.revoke_link(&link).await);

    assert_eq!(gateway.count_calls(is_revoke), 1);
    assert_eq!(count(&records(&service), AuditAction::InviteRevoked), 1);
}

#[tokio::test(start_paused = true)]
async fn test_watcher_consumes_on_first_request() {
    let dir = tempdir().unwrap();
    let (service, gateway) = service(config(dir.path()));
    gateway.queue_links(["https://t.me/+watched"]);
    let key = InviteKey::new(VIP1, "https://t.me/+watched");
    gateway.script_pending(&key, [0, 0, 1]);

    service
        .issuer()
        .issue(IssueRequest::new("v1", UserId(42)))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(20)).await;

    assert_eq!(gateway.count_calls(is_poll), 3);
    assert_eq!(gateway.count_calls(is_revoke), 1);
    assert_eq!(gateway.count_calls(is_decline), 1);

    let ctx = service.context();
    assert!(!ctx.watchers.is_armed(&key));
    assert_eq!(ctx.registry.status(&key).await, Some(InviteStatus::Consumed));
    // Still assigned until the recipient actually joins
    assert!(ctx.registry.assignment(UserId(42)).await.is_some());

    let resolution = service.reconciler().handle_event(joined(VIP1, 42)).await;
    assert!(matches!(resolution, Resolution::Consumed(_)));
    assert_eq!(gateway.count_calls(is_revoke), 1);
    assert!(ctx.registry.assignment(UserId(42)).await.is_none());

    let records = records(&service);
    assert_eq!(count(&records, AuditAction::InviteRevokedOnRequest), 1);
    assert_eq!(count(&records, AuditAction::InviteConsumed), 1);
}

#[tokio::test(start_paused = true)]
async fn test_cold_start_uses_audit_log() {
    let dir = tempdir().unwrap();
    let config = config(dir.path());
    let (service, gateway) = service(config);

    service
        .context()
        .audit
        .append(
            &AuditRecord::new(AuditAction::InviteSent)
                .tier("linkv1")
                .peer(VIP1)
                .target(UserId(31))
                .link("https://t.me/+before-restart")
                .status("pending"),
        )
        .unwrap();

    let resolution = service.reconciler().handle_event(joined(VIP1, 31)).await;
    match resolution {
        Resolution::Fallback(record) => {
            assert_eq!(record.link.as_deref(), Some("https://t.me/+before-restart"));
        }
        other => panic!("unexpected resolution: {:?}", other),
    }

    let records = records(&service);
    assert_eq!(count(&records, AuditAction::InviteConsumedFallback), 1);
    assert_eq!(gateway.count_calls(is_revoke), 1);

    // A second join finds the link already closed
    let again = service.reconciler().handle_event(joined(VIP1, 31)).await;
    assert_eq!(again, Resolution::Ignored);
    assert_eq!(gateway.count_calls(is_revoke), 1);
}

#[tokio::test(start_paused = true)]
async fn test_cold_start_resolves_peerless_record_through_its_tier() {
    let dir = tempdir().unwrap();
    let (service, gateway) = service(config(dir.path()));

    // Written before records carried `peer`
    service
        .context()
        .audit
        .append(
            &AuditRecord::new(AuditAction::InviteSent)
                .tier("linkv2")
                .target(UserId(31))
                .link("https://t.me/+vip2"),
        )
        .unwrap();

    let elsewhere = service.reconciler().handle_event(joined(VIP1, 31)).await;
    assert_eq!(elsewhere, Resolution::Ignored);
    assert!(gateway.calls().is_empty());

    let resolution = service.reconciler().handle_event(joined(VIP2, 31)).await;
    assert!(matches!(resolution, Resolution::Fallback(_)));
    let revoked_on = gateway.count_calls(|c| {
        matches!(c, GatewayCall::RevokeInvite { channel, link } if *channel == VIP2 && link == "https://t.me/+vip2")
    });
    assert_eq!(revoked_on, 1);
    assert_eq!(gateway.count_calls(is_decline), 1);

    let records = records(&service);
    let fallback = records
        .iter()
        .find(|r| r.action == AuditAction::InviteConsumedFallback)
        .unwrap();
    assert_eq!(fallback.peer, Some(VIP2));
}

#[tokio::test(start_paused = true)]
async fn test_recovery_survives_torn_trailing_line() {
    let dir = tempdir().unwrap();
    let config = config(dir.path());

    let sent = AuditRecord::new(AuditAction::InviteSent)
        .tier("linkv1")
        .peer(VIP1)
        .target(UserId(31))
        .link("https://t.me/+survivor")
        .status("pending");
    let mut raw = sent.to_line().unwrap().into_bytes();
    // Crash mid-append, inside a multi-byte character
    raw.extend_from_slice(b"{\"action\":\"invite_error\",\"error\":\"caf\xc3");
    std::fs::write(&config.storage.invite_log, raw).unwrap();

    let (service, gateway) = service(config);
    let report = service.recover().await.unwrap();
    assert_eq!(report.records, 1);
    assert_eq!(report.assignments, 1);

    let resolution = service.reconciler().handle_event(joined(VIP1, 31)).await;
    assert!(matches!(resolution, Resolution::Consumed(_)));
    assert_eq!(gateway.count_calls(is_revoke), 1);

    // Records appended after the torn line stay readable
    let records = records(&service);
    assert_eq!(count(&records, AuditAction::InviteConsumed), 1);

    service.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_cold_start_without_record_is_noop() {
    let dir = tempdir().unwrap();
    let (service, gateway) = service(config(dir.path()));

    let resolution = service.reconciler().handle_event(joined(VIP1, 404)).await;
    assert_eq!(resolution, Resolution::Ignored);
    assert!(gateway.calls().is_empty());
    assert!(records(&service).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_foreign_join_is_kicked() {
    let dir = tempdir().unwrap();
    let (service, gateway) = service(config(dir.path()));

    let invite = service
        .issuer()
        .issue(IssueRequest::new("v1", UserId(1)))
        .await
        .unwrap();

    let resolution = service.reconciler().handle_event(joined(VIP1, 2)).await;
    assert!(matches!(resolution, Resolution::Abuse { joiner: UserId(2), .. }));

    let kicks = gateway.count_calls(|c| {
        matches!(c, GatewayCall::KickMember { channel, user } if *channel == VIP1 && *user == UserId(2))
    });
    assert_eq!(kicks, 1);

    let ctx = service.context();
    let status = ctx.registry.status(&invite.key()).await;
    assert_ne!(status, Some(InviteStatus::Consumed));
    assert_eq!(status, Some(InviteStatus::Revoked));
    assert_eq!(
        ctx.registry.assignment(UserId(1)).await.unwrap().invite.link,
        invite.link
    );
    assert!(!ctx.watchers.is_armed(&invite.key()));

    let records = records(&service);
    let abused = records
        .iter()
        .find(|r| r.action == AuditAction::InviteAbusedKicked)
        .unwrap();
    assert_eq!(abused.target, Some(UserId(1)));
    assert_eq!(abused.joiner, Some(UserId(2)));
}

#[tokio::test(start_paused = true)]
async fn test_recovery_restores_outstanding_invites() {
    let dir = tempdir().unwrap();

    {
        let (service, _gateway) = service(config(dir.path()));
        let issuer = service.issuer();
        issuer.issue(IssueRequest::new("v1", UserId(1))).await.unwrap();
        issuer.issue(IssueRequest::new("v2", UserId(2))).await.unwrap();
        issuer.issue(IssueRequest::new("v1", UserId(3))).await.unwrap();
        service.reconciler().handle_event(joined(VIP1, 3)).await;
        service.shutdown().await;
    }

    let (service, gateway) = service(config(dir.path()));
    let report = service.recover().await.unwrap();

    assert_eq!(report.assignments, 2);
    assert_eq!(report.watchers_armed, 1);
    assert!(report.records >= 4);

    let registry = &service.context().registry;
    assert!(registry.assignment(UserId(1)).await.is_some());
    assert!(registry.assignment(UserId(2)).await.is_some());
    assert!(registry.assignment(UserId(3)).await.is_none());

    // A restored invite is matched exactly, not through the log scan
    let resolution = service.reconciler().handle_event(joined(VIP2, 2)).await;
    assert!(matches!(resolution, Resolution::Consumed(_)));
    assert_eq!(gateway.count_calls(is_revoke), 1);

    service.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_sweep_expires_without_remote_revoke() {
    let dir = tempdir().unwrap();
    let (service, gateway) = service(config(dir.path()));

    let invite = service
        .issuer()
        .issue(IssueRequest::new("v1", UserId(50)))
        .await
        .unwrap();

    let ctx = service.context();
    let swept = ctx.sweep_expired(now() + chrono::Duration::hours(25)).await;
    assert_eq!(swept, 1);

    assert_eq!(ctx.registry.status(&invite.key()).await, Some(InviteStatus::Expired));
    assert!(ctx.registry.assignment(UserId(50)).await.is_none());
    assert!(!ctx.watchers.is_armed(&invite.key()));
    assert_eq!(gateway.count_calls(is_revoke), 0);
    assert_eq!(count(&records(&service), AuditAction::InviteExpired), 1);
}

#[tokio::test(start_paused = true)]
async fn test_running_service_handles_gateway_events() {
    let dir = tempdir().unwrap();
    let (service, gateway) = service(config(dir.path()));
    service.start().await.unwrap();

    gateway.queue_links(["https://t.me/+nudged"]);
    let key = InviteKey::new(VIP1, "https://t.me/+nudged");
    gateway.script_pending(&key, [1]);
    service
        .issuer()
        .issue(IssueRequest::new("v1", UserId(60)))
        .await
        .unwrap();

    // A join request wakes the watcher before its poll interval
    gateway.emit(GatewayEvent::JoinRequested {
        channel: VIP1,
        user: UserId(60),
        link: Some(key.link.clone()),
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let ctx = service.context();
    assert_eq!(ctx.registry.status(&key).await, Some(InviteStatus::Consumed));

    gateway.emit(joined(VIP1, 60));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(ctx.registry.assignment(UserId(60)).await.is_none());

    service.shutdown().await;
    assert!(service.is_shutting_down().await);
}
