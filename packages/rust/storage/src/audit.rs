//! Append-only audit log.
//!
//! Every state-changing action on the deletion queue (and every denied
//! attempt) appends one JSON line to `audit.jsonl`. The file is opened in
//! append mode and never rewritten in place, so existing entries cannot be
//! edited retroactively; integrity checks re-parse the whole file.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use docflow_shared::{DocflowError, Result};

/// One audit record: who did what to which target, with state snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Unique entry identifier (UUID v7, time-sortable).
    pub id: String,
    /// When the action happened.
    pub timestamp: DateTime<Utc>,
    /// Acting identity.
    pub actor: String,
    /// Action name (`propose`, `approve`, `reject`, `execute`, `decide_denied`).
    pub action: String,
    /// Target identifier the action applied to.
    pub target: String,
    /// State before the action, if applicable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<String>,
    /// State after the action, if applicable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<String>,
    /// Outcome detail (execution result, denial reason).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,
}

impl AuditEntry {
    /// Build a new entry stamped with the current time.
    pub fn new(actor: &str, action: &str, target: &str) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            timestamp: Utc::now(),
            actor: actor.into(),
            action: action.into(),
            target: target.into(),
            before: None,
            after: None,
            outcome: None,
        }
    }

    pub fn with_transition(mut self, before: impl Into<String>, after: impl Into<String>) -> Self {
        self.before = Some(before.into());
        self.after = Some(after.into());
        self
    }

    pub fn with_outcome(mut self, outcome: impl Into<String>) -> Self {
        self.outcome = Some(outcome.into());
        self
    }
}

/// Handle to the job's append-only audit file.
#[derive(Debug, Clone)]
pub struct AuditLog {
    path: PathBuf,
}

impl AuditLog {
    /// Open (or create on first append) the audit log at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Default location inside a job directory.
    pub fn for_job_dir(job_dir: &Path) -> Self {
        Self::new(job_dir.join("audit.jsonl"))
    }

    /// Append one entry. The file is only ever opened with `append`.
    pub fn append(&self, entry: &AuditEntry) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| DocflowError::io(parent, e))?;
        }

        let line = serde_json::to_string(entry)
            .map_err(|e| DocflowError::validation(format!("audit serialization: {e}")))?;

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| DocflowError::io(&self.path, e))?;

        writeln!(file, "{line}").map_err(|e| DocflowError::io(&self.path, e))?;
        debug!(action = %entry.action, target = %entry.target, "audit entry appended");
        Ok(())
    }

    /// Read the full trail in append order. Fails if any line is corrupt,
    /// which is the integrity check: a rewritten file will not parse
    /// line-for-line against the entries it once held.
    pub fn read_all(&self) -> Result<Vec<AuditEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content =
            std::fs::read_to_string(&self.path).map_err(|e| DocflowError::io(&self.path, e))?;

        content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|line| {
                serde_json::from_str(line)
                    .map_err(|e| DocflowError::validation(format!("corrupt audit entry: {e}")))
            })
            .collect()
    }
}
