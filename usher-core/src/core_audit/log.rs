/*
    log.rs - Append-only audit log

    Durable, sequential JSON-lines ledger of every invite lifecycle
    transition. It is the only persisted state; the registry is rebuilt from
    it on startup and the join reconciler scans it when the registry is cold.

    Features:
    - Append-only writes on an O_APPEND handle (no in-place updates)
    - One write_all per record under a mutex, so lines never interleave
    - Tolerant sequential read for replay (bad lines are skipped)
    - Newest-first scan for cold-start reconciliation
*/

use super::record::AuditRecord;
use crate::config::Config;
use crate::core_invite::types::{ChannelId, UserId};
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors that can occur reading or writing the audit log
#[derive(Debug, Error)]
pub enum AuditError {
    #[error("Audit log I/O error: {0}")]
    Io(String),

    #[error("Audit record serialization error: {0}")]
    Serialization(String),

    #[error("Audit log writer lock poisoned")]
    Poisoned,
}

impl From<std::io::Error> for AuditError {
    fn from(err: std::io::Error) -> Self {
        AuditError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for AuditError {
    fn from(err: serde_json::Error) -> Self {
        AuditError::Serialization(err.to_string())
    }
}

/// Result type for audit log operations
pub type AuditResult<T> = Result<T, AuditError>;

/// Append-only audit log
pub struct AuditLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl AuditLog {
    /// Create or open an audit log
    pub fn open(path: impl Into<PathBuf>) -> AuditResult<Self> {
        let path = path.into();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;
        terminate_torn_tail(&mut file)?;

        Ok(AuditLog {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a record as one newline-terminated line
    pub fn append(&self, record: &AuditRecord) -> AuditResult<()> {
        let line = record.to_line()?;

        {
            let mut file = self.file.lock().map_err(|_| AuditError::Poisoned)?;
            file.write_all(line.as_bytes())?;
            file.flush()?;
        }

        info!(action = %record.action, "{}", line.trim_end());
        Ok(())
    }

    /// Append a record, downgrading failure to a warning
    ///
    /// Components call this at their operation boundary: an audit write
    /// failure must never abort a gateway side effect that already happened.
    pub fn record(&self, record: AuditRecord) {
        if let Err(e) = self.append(&record) {
            warn!(action = %record.action, error = %e, "Failed to append audit record");
        }
    }

    /// Read every parseable record in file order
    pub fn read_all(&self) -> AuditResult<Vec<AuditRecord>> {
        read_records(&self.path)
    }

    /// Latest issuance record for `user`, newest first
    ///
    /// Records without a target match on `channel` instead (open invites).
    /// Returns `None` when the matching link was closed later in the log.
    pub fn latest_issuance(
        &self,
        user: UserId,
        channel: Option<ChannelId>,
        config: &Config,
    ) -> AuditResult<Option<AuditRecord>> {
        let records = self.read_all()?;
        Ok(latest_open_issuance(&records, user, channel, config))
    }
}

/// Close a record left unterminated by a crash so the next append starts a new line
fn terminate_torn_tail(file: &mut File) -> std::io::Result<()> {
    if file.metadata()?.len() == 0 {
        return Ok(());
    }

    let mut last = [0u8; 1];
    file.seek(SeekFrom::End(-1))?;
    file.read_exact(&mut last)?;
    if last[0] != b'\n' {
        warn!("Audit log ends with a partial record; terminating it");
        file.write_all(b"\n")?;
    }
    Ok(())
}

/// Read a JSON-lines audit file, skipping lines that do not parse
///
/// Lines are split on raw bytes: a record torn by a crash mid-append may end
/// inside a multi-byte character and must not hide the lines around it.
pub fn read_records(path: &Path) -> AuditResult<Vec<AuditRecord>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut records = Vec::new();
    for (index, line) in BufReader::new(file).split(b'\n').enumerate() {
        let line = match String::from_utf8(line?) {
            Ok(line) => line,
            Err(e) => {
                debug!(line = index + 1, error = %e, "Skipping non-UTF-8 audit line");
                continue;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<AuditRecord>(&line) {
            Ok(record) => records.push(record),
            Err(e) => debug!(line = index + 1, error = %e, "Skipping unreadable audit line"),
        }
    }

    Ok(records)
}

/// Newest-first search for the issuance a joining user most likely redeemed
///
/// Records written without a `peer` are placed on their tier's channel. The
/// returned record always carries the channel it was matched on.
pub fn latest_open_issuance(
    records: &[AuditRecord],
    user: UserId,
    channel: Option<ChannelId>,
    config: &Config,
) -> Option<AuditRecord> {
    let mut closed: HashSet<&str> = HashSet::new();

    for record in records.iter().rev() {
        if record.action.closes_link() {
            if let Some(link) = record.link.as_deref() {
                closed.insert(link);
            }
            continue;
        }

        if !record.action.is_issuance() {
            continue;
        }

        let recorded = issuance_channel(record, config);
        let matches = match record.target {
            Some(target) => target == user && channel_matches(recorded, channel),
            None => channel.is_some() && recorded == channel,
        };
        if !matches {
            continue;
        }

        return match record.link.as_deref() {
            Some(link) if !closed.contains(link) => {
                let mut found = record.clone();
                found.peer = recorded;
                Some(found)
            }
            _ => None,
        };
    }

    None
}

/// Channel an issuance was made on: its `peer`, else its tier's channel
fn issuance_channel(record: &AuditRecord, config: &Config) -> Option<ChannelId> {
    record.peer.or_else(|| {
        let tier = config.tier(record.tier.as_deref()?)?;
        Some(tier.channel_id)
    })
}

fn channel_matches(recorded: Option<ChannelId>, wanted: Option<ChannelId>) -> bool {
    match (recorded, wanted) {
        (Some(recorded), Some(wanted)) => recorded == wanted,
        (None, Some(_)) => false,
        (_, None) => true,
    }
}
