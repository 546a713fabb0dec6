//! Usher core
//!
//! Single-use invite credential lifecycle: issuance, consumption tracking,
//! abuse handling and log-based recovery.

pub mod config;
pub mod core_audit;
pub mod core_invite;
pub mod logging;
pub mod metrics;
pub mod shutdown;

pub use config::Config;
pub use core_audit::{AuditAction, AuditLog, AuditRecord};
pub use core_invite::{InviteError, InviteResult, InviteService};
pub use logging::{init_logging, LogLevel};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_exports() {
        let _ = LogLevel::Info;
        let _ = Config::default();
    }
}
