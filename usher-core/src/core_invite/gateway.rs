//! Messaging Gateway trait
//!
//! Defines the remote operations the invite lifecycle depends on. The chat
//! network client lives behind this trait; tests and demos use
//! [`MockGateway`](super::adapters::MockGateway).

use super::errors::GatewayResult;
use super::types::{ChannelId, UserId};
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use std::fmt;
use tokio::sync::broadcast;

/// Parameters for creating an invite link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateInvite {
    pub channel: ChannelId,
    pub expires_at: DateTime<FixedOffset>,
    pub approval_required: bool,
    /// Omitted in request-to-join mode
    pub usage_limit: Option<u32>,
}

/// Destination of an outbound message
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Peer {
    User(UserId),
    Username(String),
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Peer::User(id) => write!(f, "{}", id),
            Peer::Username(name) => f.write_str(name),
        }
    }
}

/// Inbound events from the gateway
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayEvent {
    /// A user joined a channel on their own (e.g. through a link)
    MemberJoined {
        channel: ChannelId,
        user: UserId,
        /// Link used, when the network reports it
        link: Option<String>,
    },

    /// A user was added to a channel by an administrator
    MemberAdded { channel: ChannelId, user: UserId },

    /// A user asked to join through a request-to-join link
    JoinRequested {
        channel: ChannelId,
        user: UserId,
        link: Option<String>,
    },

    /// A direct message arrived
    MessageReceived { sender: Peer },
}

/// Remote operations used by the invite lifecycle
///
/// Every call is a single attempt. Implementations must not retry; callers
/// treat each failure as terminal for that attempt.
#[async_trait]
pub trait MessagingGateway: Send + Sync {
    /// Create an invite link, returning the link
    async fn create_invite(&self, request: CreateInvite) -> GatewayResult<String>;

    /// Revoke an invite link
    async fn revoke_invite(&self, channel: ChannelId, link: &str) -> GatewayResult<()>;

    /// Decline every pending join request made through `link`
    async fn decline_pending_requests(&self, channel: ChannelId, link: &str) -> GatewayResult<()>;

    /// Number of pending join requests made through `link`
    async fn count_pending_requests(&self, channel: ChannelId, link: &str) -> GatewayResult<u32>;

    /// Remove a member from a channel
    async fn kick_member(&self, channel: ChannelId, user: UserId) -> GatewayResult<()>;

    /// Send a direct message
    async fn send_message(&self, to: &Peer, text: &str, silent: bool) -> GatewayResult<()>;

    /// Subscribe to inbound events
    fn subscribe(&self) -> broadcast::Receiver<GatewayEvent>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_display() {
        assert_eq!(Peer::User(UserId(555)).to_string(), "555");
        assert_eq!(Peer::Username("@main_bot".to_string()).to_string(), "@main_bot");
    }
}
