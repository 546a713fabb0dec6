//! Consumption Watcher
//!
//! One task per outstanding approval-required invite. Each task polls the
//! gateway for pending join requests on its link and, on the first one,
//! revokes the link and declines whatever else queued up behind it.
//!
//! # Lifecycle
//!
//! ```text
//! Armed --(count >= 1)--> Consumed
//!   |
//!   +--(cancel: supersession, reconciliation, abuse, expiry, shutdown)--> Cancelled
//! ```
//!
//! Tasks wake on a fixed interval or early when a `JoinRequested` event for
//! their channel arrives (see [`WatcherSet::nudge_channel`]).

use super::context::{InviteContext, LinkRef};
use super::types::{ChannelId, Invite, InviteKey, InviteStatus};
use crate::core_audit::{AuditAction, AuditRecord};
use crate::metrics;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info};

struct WatchHandle {
    cancel: oneshot::Sender<()>,
    nudge: Arc<Notify>,
    task: JoinHandle<()>,
}

/// The set of armed watchers, keyed by invite
#[derive(Default)]
pub struct WatcherSet {
    handles: Mutex<HashMap<InviteKey, WatchHandle>>,
}

impl WatcherSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn handles(&self) -> MutexGuard<'_, HashMap<InviteKey, WatchHandle>> {
        self.handles.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Spawn a watcher for `invite` unless one is already armed for its key
    pub fn arm(&self, ctx: Arc<InviteContext>, invite: Invite) -> bool {
        let key = invite.key();
        let mut handles = self.handles();
        if handles.contains_key(&key) {
            debug!(link = %key, "Watcher already armed");
            return false;
        }

        let (cancel, cancelled) = oneshot::channel();
        let nudge = Arc::new(Notify::new());
        let task = tokio::spawn(watch(ctx, invite, cancelled, nudge.clone()));

        handles.insert(
            key.clone(),
            WatchHandle {
                cancel,
                nudge,
                task,
            },
        );
        metrics::record_watchers(handles.len());
        debug!(link = %key, "Watcher armed");
        true
    }

    /// Cancel the watcher for `key`, if armed
    pub fn cancel(&self, key: &InviteKey) -> bool {
        let handle = {
            let mut handles = self.handles();
            let handle = handles.remove(key);
            metrics::record_watchers(handles.len());
            handle
        };

        match handle {
            Some(handle) => {
                // The task may have finished on its own already
                let _ = handle.cancel.send(());
                debug!(link = %key, "Watcher cancelled");
                true
            }
            None => false,
        }
    }

    /// Cancel every watcher, returning their tasks so the caller can drain them
    pub fn cancel_all(&self) -> Vec<JoinHandle<()>> {
        let drained: Vec<WatchHandle> = {
            let mut handles = self.handles();
            let drained = handles.drain().map(|(_, handle)| handle).collect();
            metrics::record_watchers(0);
            drained
        };

        drained
            .into_iter()
            .map(|handle| {
                let _ = handle.cancel.send(());
                handle.task
            })
            .collect()
    }

    /// Wake every watcher on `channel` for an immediate poll
    pub fn nudge_channel(&self, channel: ChannelId) -> usize {
        let handles = self.handles();
        let mut woken = 0;
        for (key, handle) in handles.iter() {
            if key.channel == channel {
                handle.nudge.notify_one();
                woken += 1;
            }
        }
        woken
    }

    pub fn is_armed(&self, key: &InviteKey) -> bool {
        self.handles().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.handles().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn forget(&self, key: &InviteKey) {
        let mut handles = self.handles();
        if handles.remove(key).is_some() {
            metrics::record_watchers(handles.len());
        }
    }
}

async fn watch(
    ctx: Arc<InviteContext>,
    invite: Invite,
    mut cancelled: oneshot::Receiver<()>,
    nudge: Arc<Notify>,
) {
    let key = invite.key();
    let interval = ctx.config.invite.watch_interval;

    loop {
        tokio::select! {
            _ = &mut cancelled => {
                debug!(link = %key, "Watcher stopping");
                return;
            }
            _ = tokio::time::sleep(interval) => {}
            _ = nudge.notified() => {}
        }

        // Another path may have closed the invite between polls
        match ctx.registry.status(&key).await {
            Some(InviteStatus::Pending) | None => {}
            Some(status) => {
                debug!(link = %key, %status, "Invite closed elsewhere");
                break;
            }
        }

        let count = match ctx
            .gateway
            .count_pending_requests(key.channel, &key.link)
            .await
        {
            Ok(count) => count,
            Err(e) => {
                metrics::record_gateway_failure("count_pending_requests");
                ctx.audit.record(
                    AuditRecord::new(AuditAction::WatchErr)
                        .tier(invite.tier.clone())
                        .peer(key.channel)
                        .target(invite.recipient)
                        .link(key.link.clone())
                        .error(&e),
                );
                continue;
            }
        };

        if count == 0 {
            continue;
        }

        ctx.close_link(&LinkRef::from(&invite)).await;
        ctx.audit.record(
            AuditRecord::new(AuditAction::InviteRevokedOnRequest)
                .tier(invite.tier.clone())
                .peer(key.channel)
                .target(invite.recipient)
                .link(key.link.clone())
                .status(InviteStatus::Consumed.as_str()),
        );
        ctx.registry.close(&key, InviteStatus::Consumed).await;

        info!(
            link = %key,
            recipient = %invite.recipient,
            requests = count,
            "Join request received; invite consumed"
        );
        break;
    }

    ctx.watchers.forget(&key);
}
