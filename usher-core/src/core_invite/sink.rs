//! Credential delivery

use super::errors::InviteResult;
use super::gateway::{MessagingGateway, Peer};
use super::types::{Tier, UserId};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Delivers an issued link to its recipient
#[async_trait]
pub trait CredentialSink: Send + Sync {
    async fn deliver(&self, recipient: UserId, tier: &Tier, link: &str) -> InviteResult<()>;
}

/// Fill a delivery template
pub fn render_invite(template: &str, tier: &Tier, link: &str) -> String {
    template
        .replace("{tier}", &tier.label())
        .replace("{link}", link)
}

/// Sink that sends the rendered template as a direct message
pub struct GatewaySink {
    gateway: Arc<dyn MessagingGateway>,
    silent: bool,
}

impl GatewaySink {
    pub fn new(gateway: Arc<dyn MessagingGateway>, silent: bool) -> Self {
        Self { gateway, silent }
    }
}

#[async_trait]
impl CredentialSink for GatewaySink {
    async fn deliver(&self, recipient: UserId, tier: &Tier, link: &str) -> InviteResult<()> {
        let text = render_invite(&tier.message_template, tier, link);
        self.gateway
            .send_message(&Peer::User(recipient), &text, self.silent)
            .await?;

        debug!(recipient = %recipient, tier = %tier.key, "Invite delivered");
        Ok(())
    }
}
