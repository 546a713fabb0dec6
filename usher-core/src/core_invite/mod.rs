//! Invite lifecycle
//!
//! Issues single-use invite links, watches them for consumption, reconciles
//! joins against what was issued and recovers all of it from the audit log.
//!
//! ```text
//! ComboOrchestrator -> InviteIssuer -> Registry / AuditLog -> MessagingGateway
//! gateway events    -> InviteReconciler / watchers -> Registry / AuditLog
//! ```

pub mod adapters;
pub mod context;
pub mod errors;
pub mod gateway;
pub mod issuer;
pub mod orchestrator;
pub mod reconciler;
pub mod registry;
pub mod service;
pub mod sink;
pub mod types;
pub mod watcher;

// Re-exports
pub use context::{InviteContext, LinkRef};
pub use errors::{GatewayError, GatewayResult, InviteError, InviteResult};
pub use gateway::{CreateInvite, GatewayEvent, MessagingGateway, Peer};
pub use issuer::{InviteIssuer, IssueRequest};
pub use orchestrator::{ComboOrchestrator, ComboOutcome, ComboRequest};
pub use reconciler::{InviteReconciler, Resolution};
pub use registry::{Registry, ReplayStats};
pub use service::{InviteService, RecoveryReport};
pub use sink::{CredentialSink, GatewaySink};
pub use types::{
    ActiveAssignment, ChannelId, Invite, InviteKey, InviteStatus, IssueOrigin, Tier, UserId,
};
pub use watcher::WatcherSet;
