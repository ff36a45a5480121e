//! Durable job manifest store.
//!
//! One directory per job under the store root:
//!
//! ```text
//! <root>/<job_id>/
//! ├── manifest.json    pretty-printed, diffable
//! ├── .lease           exclusive writer lock, held for one run
//! └── artifacts/       pass outputs (written by the pass handlers)
//! ```
//!
//! Persistence is all-or-nothing: the manifest is serialized to a staging
//! file in the same directory and atomically renamed over the canonical
//! path, so a reader sees either the pre- or post-transition version,
//! never a torn write.

mod lease;

pub use lease::JobLease;

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use docflow_shared::{DocflowError, JobId, Manifest, PassName, Result};

/// Canonical manifest file name within a job directory.
const MANIFEST_FILE: &str = "manifest.json";

/// Staging file name used during atomic persist.
const MANIFEST_STAGING_FILE: &str = "manifest.json.tmp";

/// Filesystem-backed store for job manifests.
#[derive(Debug, Clone)]
pub struct ManifestStore {
    root: PathBuf,
}

impl ManifestStore {
    /// Create a store rooted at `root` (usually `<data_root>/jobs`).
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory holding one job's manifest and artifacts.
    pub fn job_dir(&self, job_id: &JobId) -> PathBuf {
        self.root.join(job_id.to_string())
    }

    /// Path to a job's canonical manifest file.
    pub fn manifest_path(&self, job_id: &JobId) -> PathBuf {
        self.job_dir(job_id).join(MANIFEST_FILE)
    }

    /// Load the manifest for `job_id`, creating a fresh one (every pass
    /// pending) if none exists yet. Creates the job directory as needed.
    pub fn create_or_load(&self, job_id: &JobId, environment: &str) -> Result<Manifest> {
        let dir = self.job_dir(job_id);
        std::fs::create_dir_all(&dir).map_err(|e| DocflowError::io(&dir, e))?;

        let path = self.manifest_path(job_id);
        if path.exists() {
            let manifest = self.load(&path)?;
            debug!(%job_id, "loaded existing manifest");
            return Ok(manifest);
        }

        let manifest = Manifest::new(job_id.clone(), environment);
        self.persist(&manifest)?;
        info!(%job_id, environment, "created new job manifest");
        Ok(manifest)
    }

    /// Read-only snapshot of a job's manifest. Fails if the job does not exist.
    pub fn snapshot(&self, job_id: &JobId) -> Result<Manifest> {
        let path = self.manifest_path(job_id);
        if !path.exists() {
            return Err(DocflowError::validation(format!(
                "no manifest found for job '{job_id}' at {}",
                path.display()
            )));
        }
        self.load(&path)
    }

    /// Atomically persist the manifest: write to a staging file, then
    /// rename over the canonical path.
    pub fn persist(&self, manifest: &Manifest) -> Result<()> {
        let dir = self.job_dir(&manifest.job.id);
        std::fs::create_dir_all(&dir).map_err(|e| DocflowError::io(&dir, e))?;

        let staging = dir.join(MANIFEST_STAGING_FILE);
        let canonical = dir.join(MANIFEST_FILE);

        let json = serde_json::to_string_pretty(manifest)
            .map_err(|e| DocflowError::validation(format!("manifest serialization: {e}")))?;

        std::fs::write(&staging, json).map_err(|e| DocflowError::io(&staging, e))?;
        std::fs::rename(&staging, &canonical).map_err(|e| DocflowError::io(&canonical, e))?;

        debug!(job_id = %manifest.job.id, "manifest persisted");
        Ok(())
    }

    /// Acquire the exclusive per-job writer lease for the duration of a run.
    pub fn acquire_lease(&self, job_id: &JobId) -> Result<JobLease> {
        let dir = self.job_dir(job_id);
        std::fs::create_dir_all(&dir).map_err(|e| DocflowError::io(&dir, e))?;
        JobLease::acquire(&dir, job_id)
    }

    fn load(&self, path: &Path) -> Result<Manifest> {
        let content = std::fs::read_to_string(path).map_err(|e| DocflowError::io(path, e))?;
        let mut manifest: Manifest = serde_json::from_str(&content).map_err(|e| {
            DocflowError::validation(format!("invalid manifest at {}: {e}", path.display()))
        })?;

        // A hand-edited manifest may omit pass entries; reseed any missing
        // record as pending so lookups stay total.
        for pass in PassName::ALL {
            manifest.passes.entry(pass).or_default();
        }
        Ok(manifest)
    }
}
