//! Exclusive per-job writer lease.
//!
//! A `.lease` file created with `create_new` guarantees a single writer per
//! job: a second `run` on the same job fails fast instead of interleaving
//! manifest writes. The lease is released on drop.

use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use docflow_shared::{DocflowError, JobId, Result};

/// Lease file name within a job directory.
const LEASE_FILE: &str = ".lease";

/// Held for the duration of one `run` invocation; releases on drop.
#[derive(Debug)]
pub struct JobLease {
    path: PathBuf,
}

impl JobLease {
    /// Try to take the lease for `job_id` inside `job_dir`.
    pub(crate) fn acquire(job_dir: &Path, job_id: &JobId) -> Result<Self> {
        let path = job_dir.join(LEASE_FILE);

        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::AlreadyExists => DocflowError::invalid_state(format!(
                    "job '{job_id}' already has an active run (lease held at {})",
                    path.display()
                )),
                _ => DocflowError::io(&path, e),
            })?;

        let _ = writeln!(
            file,
            "pid={} acquired_at={}",
            std::process::id(),
            chrono::Utc::now().to_rfc3339()
        );

        debug!(%job_id, path = %path.display(), "job lease acquired");
        Ok(Self { path })
    }
}

impl Drop for JobLease {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to release job lease");
        } else {
            debug!(path = %self.path.display(), "job lease released");
        }
    }
}
