//! Combo Orchestrator
//!
//! Sequences the relay command (forwarded to the relay bot) with invite
//! issuance and delivery. `relay_first` waits for the relay to land before
//! issuing; `parallel` fires both and lets them race.

use super::context::InviteContext;
use super::errors::{InviteError, InviteResult};
use super::gateway::{GatewayEvent, Peer};
use super::issuer::{InviteIssuer, IssueRequest};
use super::sink::CredentialSink;
use super::types::{Invite, IssueOrigin, Tier, UserId};
use crate::config::ComboOrder;
use crate::core_audit::{AuditAction, AuditRecord};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A resolved combo command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComboRequest {
    /// Tier key or issuance name
    pub tier: String,
    pub recipient: UserId,
    /// Quantity forwarded with the relay command
    pub request_no: Option<u32>,
}

impl ComboRequest {
    pub fn new(tier: impl Into<String>, recipient: UserId) -> Self {
        Self {
            tier: tier.into(),
            recipient,
            request_no: None,
        }
    }

    pub fn with_request_no(mut self, request_no: u32) -> Self {
        self.request_no = Some(request_no);
        self
    }
}

/// What a combo run did
#[derive(Debug)]
pub enum ComboOutcome {
    /// Relay sent, invite issued and delivered
    Delivered(Invite),
    /// Combo disabled: relay only
    RelayOnly,
    /// Parallel mode: both halves run in the background
    Spawned {
        relay: JoinHandle<()>,
        issuance: JoinHandle<()>,
    },
}

/// Runs relay + invite combos and manual issuance
pub struct ComboOrchestrator {
    ctx: Arc<InviteContext>,
    issuer: Arc<InviteIssuer>,
    sink: Arc<dyn CredentialSink>,
}

impl ComboOrchestrator {
    pub fn new(
        ctx: Arc<InviteContext>,
        issuer: Arc<InviteIssuer>,
        sink: Arc<dyn CredentialSink>,
    ) -> Self {
        Self { ctx, issuer, sink }
    }

    /// Run a combo under the configured ordering policy
    pub async fn run(self: &Arc<Self>, request: ComboRequest) -> InviteResult<ComboOutcome> {
        let tier = self.resolve(&request.tier)?;
        let settings = &self.ctx.config.relay;
        let request_no = request.request_no.map(|n| settings.clip_request_no(n));
        let recipient = request.recipient;

        if !settings.combo_enabled {
            self.relay(&tier, recipient, request_no).await?;
            return Ok(ComboOutcome::RelayOnly);
        }

        match settings.order {
            ComboOrder::RelayFirst => {
                // Subscribe before sending so a fast reply is not missed
                let mut events = self.ctx.gateway.subscribe();
                self.relay(&tier, recipient, request_no).await?;

                if !self.await_reply(&mut events).await {
                    debug!(tier = %tier.key, %recipient, "No relay reply; continuing");
                }
                tokio::time::sleep(settings.settle_delay).await;

                let invite = self
                    .issue_and_deliver(&tier, recipient, IssueOrigin::Combo, request_no)
                    .await?;
                Ok(ComboOutcome::Delivered(invite))
            }
            ComboOrder::Parallel => {
                let relay_task = {
                    let this = self.clone();
                    let tier = tier.clone();
                    tokio::spawn(async move {
                        // Failure already recorded as relay_err
                        let _ = this.relay(&tier, recipient, request_no).await;
                    })
                };
                let issuance_task = {
                    let this = self.clone();
                    tokio::spawn(async move {
                        let _ = this
                            .issue_and_deliver(&tier, recipient, IssueOrigin::Combo, request_no)
                            .await;
                    })
                };

                Ok(ComboOutcome::Spawned {
                    relay: relay_task,
                    issuance: issuance_task,
                })
            }
        }
    }

    /// Link-only issuance: approval required, delivered directly
    pub async fn issue_manual(&self, tier: &str, recipient: UserId) -> InviteResult<Invite> {
        let tier = self.resolve(tier)?;
        self.issue_and_deliver(&tier, recipient, IssueOrigin::Manual, None)
            .await
    }

    fn resolve(&self, name: &str) -> InviteResult<Tier> {
        self.ctx.tier(name).ok_or_else(|| {
            self.ctx.audit.record(
                AuditRecord::new(AuditAction::InviteError)
                    .tier(name)
                    .error("peer_not_configured"),
            );
            InviteError::Configuration(format!("peer_not_configured: {}", name))
        })
    }

    async fn relay(
        &self,
        tier: &Tier,
        recipient: UserId,
        request_no: Option<u32>,
    ) -> InviteResult<()> {
        let bot = self.ctx.config.relay.bot_username.clone();
        let text = relay_text(&tier.relay_command, recipient, request_no);

        match self
            .ctx
            .gateway
            .send_message(&Peer::Username(bot.clone()), &text, false)
            .await
        {
            Ok(()) => {
                self.ctx.audit.record(
                    AuditRecord::new(AuditAction::RelayAddv)
                        .tier(tier.key.clone())
                        .target(recipient)
                        .to(bot)
                        .req_no(request_no),
                );
                Ok(())
            }
            Err(e) => {
                crate::metrics::record_gateway_failure("send_message");
                self.ctx.audit.record(
                    AuditRecord::new(AuditAction::RelayErr)
                        .tier(tier.key.clone())
                        .target(recipient)
                        .to(bot)
                        .error(&e),
                );
                Err(e.into())
            }
        }
    }

    /// Wait up to `reply_wait` for any message from the relay bot
    async fn await_reply(&self, events: &mut broadcast::Receiver<GatewayEvent>) -> bool {
        let bot = normalize_username(&self.ctx.config.relay.bot_username);
        let wait = self.ctx.config.relay.reply_wait;

        let reply = async {
            loop {
                match events.recv().await {
                    Ok(GatewayEvent::MessageReceived {
                        sender: Peer::Username(name),
                    }) if normalize_username(&name) == bot => return true,
                    Ok(_) => continue,
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Relay reply wait lagged");
                        continue;
                    }
                    Err(RecvError::Closed) => return false,
                }
            }
        };

        tokio::time::timeout(wait, reply).await.unwrap_or(false)
    }

    async fn issue_and_deliver(
        &self,
        tier: &Tier,
        recipient: UserId,
        origin: IssueOrigin,
        request_no: Option<u32>,
    ) -> InviteResult<Invite> {
        let mut request = IssueRequest::new(tier.key.clone(), recipient)
            .origin(origin)
            .request_no(request_no);
        if origin == IssueOrigin::Manual {
            request = request.require_approval(true);
        }

        let result = match self.issuer.issue(request).await {
            Ok(invite) => self
                .sink
                .deliver(recipient, tier, &invite.link)
                .await
                .map(|()| invite),
            Err(e) => Err(e),
        };

        match &result {
            Ok(invite) => info!(tier = %invite.tier, %recipient, "Invite delivered"),
            Err(e) => {
                warn!(tier = %tier.key, %recipient, error = %e, "Invite delivery failed");
                self.ctx.audit.record(
                    AuditRecord::new(AuditAction::InviteDmFailed)
                        .tier(tier.link_name())
                        .target(recipient)
                        .error(e),
                );
            }
        }
        result
    }
}

/// `"{command} {recipient}[ {request_no}]"`
pub fn relay_text(command: &str, recipient: UserId, request_no: Option<u32>) -> String {
    match request_no {
        Some(n) => format!("{} {} {}", command, recipient, n),
        None => format!("{} {}", command, recipient),
    }
}

fn normalize_username(name: &str) -> String {
    name.trim().trim_start_matches('@').to_lowercase()
}
