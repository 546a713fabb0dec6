//! Invite Service
//!
//! Runtime wiring for the invite lifecycle: opens the audit log, rebuilds
//! the registry from it, and runs the gateway event loop and the expiry
//! sweep until shutdown.

use super::context::InviteContext;
use super::errors::InviteResult;
use super::gateway::MessagingGateway;
use super::issuer::InviteIssuer;
use super::orchestrator::ComboOrchestrator;
use super::reconciler::InviteReconciler;
use super::registry::Registry;
use super::sink::{CredentialSink, GatewaySink};
use super::types::now;
use crate::config::Config;
use crate::core_audit::AuditLog;
use crate::shutdown::ShutdownCoordinator;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

/// What a recovery pass restored
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub records: usize,
    pub assignments: usize,
    pub watchers_armed: usize,
}

/// Owns every invite component and their background tasks
pub struct InviteService {
    ctx: Arc<InviteContext>,
    issuer: Arc<InviteIssuer>,
    reconciler: Arc<InviteReconciler>,
    orchestrator: Arc<ComboOrchestrator>,
    coordinator: Arc<ShutdownCoordinator>,
}

impl InviteService {
    /// Build a service delivering invites through the gateway itself
    pub fn new(config: Config, gateway: Arc<dyn MessagingGateway>) -> InviteResult<Self> {
        let sink = Arc::new(GatewaySink::new(gateway.clone(), config.relay.silent_dm));
        Self::with_sink(config, gateway, sink)
    }

    /// Build a service with a custom credential sink
    pub fn with_sink(
        config: Config,
        gateway: Arc<dyn MessagingGateway>,
        sink: Arc<dyn CredentialSink>,
    ) -> InviteResult<Self> {
        let audit = AuditLog::open(config.storage.invite_log.clone())?;
        let coordinator = Arc::new(ShutdownCoordinator::new(config.shutdown_timeout));

        let ctx = Arc::new(InviteContext::new(
            Arc::new(config),
            Arc::new(Registry::new()),
            Arc::new(audit),
            gateway,
        ));
        let issuer = Arc::new(InviteIssuer::new(ctx.clone()));
        let reconciler = Arc::new(InviteReconciler::new(ctx.clone()));
        let orchestrator = Arc::new(ComboOrchestrator::new(ctx.clone(), issuer.clone(), sink));

        Ok(Self {
            ctx,
            issuer,
            reconciler,
            orchestrator,
            coordinator,
        })
    }

    pub fn context(&self) -> &Arc<InviteContext> {
        &self.ctx
    }

    pub fn issuer(&self) -> &Arc<InviteIssuer> {
        &self.issuer
    }

    pub fn reconciler(&self) -> &Arc<InviteReconciler> {
        &self.reconciler
    }

    pub fn orchestrator(&self) -> &Arc<ComboOrchestrator> {
        &self.orchestrator
    }

    /// Rebuild the registry from the audit log and re-arm watchers
    pub async fn recover(&self) -> InviteResult<RecoveryReport> {
        let records = self.ctx.audit.read_all()?;
        let stats = self.ctx.registry.replay(&records, &self.ctx.config).await;

        let mut watchers_armed = 0;
        for invite in self.ctx.registry.watchable(now()).await {
            if self.ctx.arm_watcher(invite) {
                watchers_armed += 1;
            }
        }

        let report = RecoveryReport {
            records: stats.records,
            assignments: stats.assignments,
            watchers_armed,
        };
        info!(
            records = report.records,
            assignments = report.assignments,
            watchers = report.watchers_armed,
            "Invite state recovered"
        );
        Ok(report)
    }

    /// Recover, then run the event loop and expiry sweep in the background
    pub async fn start(&self) -> InviteResult<RecoveryReport> {
        crate::metrics::init_metrics();
        let report = self.recover().await?;

        self.coordinator
            .spawn("gateway-events", self.event_loop())
            .await;
        self.coordinator
            .spawn("expiry-sweep", sweep_loop(self.ctx.clone()))
            .await;

        Ok(report)
    }

    fn event_loop(&self) -> impl Future<Output = ()> + Send + 'static {
        let reconciler = self.reconciler.clone();
        let mut events = self.ctx.gateway.subscribe();

        async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        let resolution = reconciler.handle_event(event).await;
                        debug!(?resolution, "Gateway event handled");
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Gateway event stream lagged");
                    }
                    Err(RecvError::Closed) => {
                        warn!("Gateway event stream closed");
                        break;
                    }
                }
            }
        }
    }

    /// Stop background tasks and every armed watcher
    pub async fn shutdown(&self) {
        for handle in self.ctx.watchers.cancel_all() {
            self.coordinator.track("invite-watcher", handle).await;
        }
        self.coordinator.shutdown().await;
    }

    pub async fn is_shutting_down(&self) -> bool {
        self.coordinator.is_shutting_down().await
    }
}

async fn sweep_loop(ctx: Arc<InviteContext>) {
    let mut ticker = tokio::time::interval(ctx.config.invite.sweep_interval);
    // The first tick completes immediately
    ticker.tick().await;
    loop {
        ticker.tick().await;
        ctx.sweep_expired(now()).await;
    }
}
