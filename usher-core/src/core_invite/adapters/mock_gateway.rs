//! Mock MessagingGateway for testing
//!
//! Records every call in order and answers from scripted state, so invite
//! lifecycle logic can be exercised without a chat network.

use crate::core_invite::errors::{GatewayError, GatewayResult};
use crate::core_invite::gateway::{CreateInvite, GatewayEvent, MessagingGateway, Peer};
use crate::core_invite::types::{ChannelId, InviteKey, UserId};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;

/// A call made against the mock, in arrival order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayCall {
    CreateInvite(CreateInvite),
    RevokeInvite { channel: ChannelId, link: String },
    DeclinePendingRequests { channel: ChannelId, link: String },
    CountPendingRequests { channel: ChannelId, link: String },
    KickMember { channel: ChannelId, user: UserId },
    SendMessage { to: Peer, text: String, silent: bool },
}

#[derive(Default)]
struct MockState {
    calls: Vec<GatewayCall>,
    links: VecDeque<String>,
    next_link: u64,
    pending: HashMap<InviteKey, VecDeque<u32>>,
    fail_create: Option<GatewayError>,
    fail_revoke: Option<GatewayError>,
    fail_send: Option<GatewayError>,
    fail_kick: Option<GatewayError>,
    fail_count: Option<GatewayError>,
    auto_reply: Option<String>,
}

/// In-memory gateway
pub struct MockGateway {
    state: Arc<Mutex<MockState>>,
    events: broadcast::Sender<GatewayEvent>,
}

impl MockGateway {
    /// Create a new mock gateway
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            state: Arc::new(Mutex::new(MockState::default())),
            events,
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Links handed out by `create_invite`, in order, before generated ones
    pub fn queue_links<I, S>(&self, links: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.state().links.extend(links.into_iter().map(Into::into));
    }

    /// Pending request counts reported for `key`; the last value repeats
    pub fn script_pending(&self, key: &InviteKey, counts: impl IntoIterator<Item = u32>) {
        self.state()
            .pending
            .insert(key.clone(), counts.into_iter().collect());
    }

    pub fn fail_create(&self, error: GatewayError) {
        self.state().fail_create = Some(error);
    }

    pub fn fail_revoke(&self, error: GatewayError) {
        self.state().fail_revoke = Some(error);
    }

    pub fn fail_send(&self, error: GatewayError) {
        self.state().fail_send = Some(error);
    }

    pub fn fail_kick(&self, error: GatewayError) {
        self.state().fail_kick = Some(error);
    }

    pub fn fail_count(&self, error: GatewayError) {
        self.state().fail_count = Some(error);
    }

    /// Clear every scripted failure
    pub fn clear_failures(&self) {
        let mut state = self.state();
        state.fail_create = None;
        state.fail_revoke = None;
        state.fail_send = None;
        state.fail_kick = None;
        state.fail_count = None;
    }

    /// Answer messages sent to `username` with a `MessageReceived` from it
    pub fn auto_reply_from(&self, username: impl Into<String>) {
        self.state().auto_reply = Some(username.into());
    }

    /// Publish an inbound event; returns the number of subscribers reached
    pub fn emit(&self, event: GatewayEvent) -> usize {
        self.events.send(event).unwrap_or(0)
    }

    /// Every call so far
    pub fn calls(&self) -> Vec<GatewayCall> {
        self.state().calls.clone()
    }

    /// Number of calls matching `predicate`
    pub fn count_calls(&self, predicate: impl Fn(&GatewayCall) -> bool) -> usize {
        self.state().calls.iter().filter(|call| predicate(call)).count()
    }

    /// Texts sent to `peer`
    pub fn messages_to(&self, peer: &Peer) -> Vec<String> {
        self.state()
            .calls
            .iter()
            .filter_map(|call| match call {
                GatewayCall::SendMessage { to, text, .. } if to == peer => Some(text.clone()),
                _ => None,
            })
            .collect()
    }

    fn push(&self, call: GatewayCall) -> MutexGuard<'_, MockState> {
        let mut state = self.state();
        state.calls.push(call);
        state
    }
}

impl Default for MockGateway {
    fn default() -> Self {
        Self::new()
    }
}

fn fail(error: &Option<GatewayError>) -> GatewayResult<()> {
    match error {
        Some(error) => Err(error.clone()),
        None => Ok(()),
    }
}

#[async_trait]
impl MessagingGateway for MockGateway {
    async fn create_invite(&self, request: CreateInvite) -> GatewayResult<String> {
        let mut state = self.push(GatewayCall::CreateInvite(request));
        fail(&state.fail_create)?;

        if let Some(link) = state.links.pop_front() {
            return Ok(link);
        }
        state.next_link += 1;
        Ok(format!("https://t.me/+mock{}", state.next_link))
    }

    async fn revoke_invite(&self, channel: ChannelId, link: &str) -> GatewayResult<()> {
        let state = self.push(GatewayCall::RevokeInvite {
            channel,
            link: link.to_string(),
        });
        fail(&state.fail_revoke)
    }

    async fn decline_pending_requests(&self, channel: ChannelId, link: &str) -> GatewayResult<()> {
        self.push(GatewayCall::DeclinePendingRequests {
            channel,
            link: link.to_string(),
        });
        Ok(())
    }

    async fn count_pending_requests(&self, channel: ChannelId, link: &str) -> GatewayResult<u32> {
        let mut state = self.push(GatewayCall::CountPendingRequests {
            channel,
            link: link.to_string(),
        });
        fail(&state.fail_count)?;

        let key = InviteKey::new(channel, link);
        let count = match state.pending.get_mut(&key) {
            Some(counts) if counts.len() > 1 => counts.pop_front().unwrap_or(0),
            Some(counts) => counts.front().copied().unwrap_or(0),
            None => 0,
        };
        Ok(count)
    }

    async fn kick_member(&self, channel: ChannelId, user: UserId) -> GatewayResult<()> {
        let state = self.push(GatewayCall::KickMember { channel, user });
        fail(&state.fail_kick)
    }

    async fn send_message(&self, to: &Peer, text: &str, silent: bool) -> GatewayResult<()> {
        let reply = {
            let state = self.push(GatewayCall::SendMessage {
                to: to.clone(),
                text: text.to_string(),
                silent,
            });
            fail(&state.fail_send)?;

            match (&state.auto_reply, to) {
                (Some(bot), Peer::Username(name)) if bot == name => Some(to.clone()),
                _ => None,
            }
        };

        if let Some(sender) = reply {
            self.emit(GatewayEvent::MessageReceived { sender });
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.events.subscribe()
    }
}
