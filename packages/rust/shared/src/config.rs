//! Application configuration for Docflow.
//!
//! User config lives at `~/.docflow/docflow.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{DocflowError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "docflow.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".docflow";

// ---------------------------------------------------------------------------
// Config structs (matching docflow.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Global defaults.
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// Pipeline behavior knobs.
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Deletion approval policy.
    #[serde(default)]
    pub approval: ApprovalConfig,

    /// Source selection patterns.
    #[serde(default)]
    pub sources: SourcePatternsConfig,
}

/// `[defaults]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Root directory for job data (manifests, artifacts, databases).
    #[serde(default = "default_data_root")]
    pub data_root: String,

    /// Default environment tag for new jobs.
    #[serde(default = "default_environment")]
    pub environment: String,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            data_root: default_data_root(),
            environment: default_environment(),
        }
    }
}

fn default_data_root() -> String {
    "~/docflow-data".into()
}
fn default_environment() -> String {
    "dev".into()
}

/// `[pipeline]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Relative count-drift tolerance before the chunk contract reports
    /// drift. `|actual - expected| / expected` above this routes the source
    /// to reconciliation; at or below it the deviation is logged only.
    #[serde(default = "default_drift_tolerance")]
    pub drift_tolerance: f64,

    /// Target maximum chunk size in bytes of canonical text.
    #[serde(default = "default_max_chunk_bytes")]
    pub max_chunk_bytes: usize,

    /// Treat a reconciliation failure as fatal to the run.
    #[serde(default)]
    pub halt_on_reconcile_failure: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            drift_tolerance: default_drift_tolerance(),
            max_chunk_bytes: default_max_chunk_bytes(),
            halt_on_reconcile_failure: false,
        }
    }
}

fn default_drift_tolerance() -> f64 {
    0.05
}
fn default_max_chunk_bytes() -> usize {
    2000
}

/// `[approval]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalConfig {
    /// Role required to decide deletion proposals.
    #[serde(default = "default_required_role")]
    pub required_role: String,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            required_role: default_required_role(),
        }
    }
}

fn default_required_role() -> String {
    "admin".into()
}

/// `[sources]` section — regex patterns matched against relative paths.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourcePatternsConfig {
    /// Patterns a source path must match (empty = match all).
    #[serde(default)]
    pub include_patterns: Vec<String>,

    /// Patterns that exclude a source path.
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
}

impl SourcePatternsConfig {
    /// Compile the configured patterns, failing on an invalid regex.
    pub fn compile(&self) -> Result<CompiledPatterns> {
        let compile = |patterns: &[String]| -> Result<Vec<regex::Regex>> {
            patterns
                .iter()
                .map(|p| {
                    regex::Regex::new(p).map_err(|e| {
                        DocflowError::config(format!("invalid source pattern '{p}': {e}"))
                    })
                })
                .collect()
        };
        Ok(CompiledPatterns {
            include: compile(&self.include_patterns)?,
            exclude: compile(&self.exclude_patterns)?,
        })
    }
}

/// Compiled include/exclude matchers.
#[derive(Debug, Clone)]
pub struct CompiledPatterns {
    include: Vec<regex::Regex>,
    exclude: Vec<regex::Regex>,
}

impl CompiledPatterns {
    /// Whether a relative source path is selected for intake.
    pub fn matches(&self, rel_path: &str) -> bool {
        if self.exclude.iter().any(|r| r.is_match(rel_path)) {
            return false;
        }
        self.include.is_empty() || self.include.iter().any(|r| r.is_match(rel_path))
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.docflow/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| DocflowError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.docflow/docflow.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| DocflowError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| DocflowError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| DocflowError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| DocflowError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| DocflowError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Expand a leading `~/` against the user's home directory.
pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = dirs::home_dir()
    {
        return home.join(rest);
    }
    PathBuf::from(path)
}
