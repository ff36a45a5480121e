//! CLI command definitions, routing, and tracing setup.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

use docflow_core::{
    CancelToken, HandlerRegistry, Orchestrator, ProgressReporter, RunOptions, RunSummary,
};
use docflow_manifest::ManifestStore;
use docflow_shared::{
    ActorRole, AppConfig, JobId, PassName, PassStatus, config_file_path, expand_tilde, init_config,
    load_config,
};
use docflow_storage::{
    ApprovalQueue, AuditLog, Decision, DeletionProposal, ProposalState, Storage,
};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// Docflow — ingest documentation into validated, traceable bundles.
#[derive(Parser)]
#[command(
    name = "docflow",
    version,
    about = "Run and manage the six-pass documentation ingestion pipeline.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Run the pipeline over a directory of source documents.
    Run {
        /// Directory containing the source documents to ingest.
        sources: PathBuf,

        /// Existing job to resume (defaults to a new job).
        #[arg(long)]
        job: Option<JobId>,

        /// Environment tag for a new job (defaults from config).
        #[arg(long)]
        env: Option<String>,

        /// Start at this pass; every earlier pass must already be SUCCESS.
        #[arg(long)]
        from: Option<PassName>,

        /// Run only these passes (comma-separated).
        #[arg(long, value_delimiter = ',')]
        only: Vec<PassName>,
    },

    /// Show a job's manifest status.
    Status {
        /// Job identifier.
        job: JobId,

        /// Print the raw manifest as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Inspect and decide deletion proposals.
    Proposals {
        /// Proposals subcommand.
        #[command(subcommand)]
        action: ProposalsAction,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Deletion proposal subcommands.
#[derive(Subcommand)]
pub(crate) enum ProposalsAction {
    /// List a job's proposals.
    List {
        /// Job identifier.
        job: JobId,

        /// Filter by state: pending, approved, rejected, or executed.
        #[arg(long)]
        state: Option<ProposalState>,
    },

    /// Approve or reject a pending proposal.
    Decide {
        /// Job identifier.
        job: JobId,

        /// Proposal identifier.
        proposal: String,

        /// Approve the proposal.
        #[arg(long, conflicts_with = "reject")]
        approve: bool,

        /// Reject the proposal.
        #[arg(long)]
        reject: bool,

        /// Acting identity for the audit trail.
        #[arg(long)]
        actor: String,

        /// Role the actor holds.
        #[arg(long, default_value = "operator")]
        role: ActorRole,
    },

    /// Execute an approved proposal.
    Execute {
        /// Job identifier.
        job: JobId,

        /// Proposal identifier.
        proposal: String,

        /// Acting identity for the audit trail.
        #[arg(long)]
        actor: String,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .init();
        }
        LogFormat::Json => {
            fmt().json().with_env_filter(env_filter).init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Run {
            sources,
            job,
            env,
            from,
            only,
        } => cmd_run(sources, job, env, from, only).await,
        Command::Status { job, json } => cmd_status(&job, json).await,
        Command::Proposals { action } => match action {
            ProposalsAction::List { job, state } => cmd_proposals_list(&job, state).await,
            ProposalsAction::Decide {
                job,
                proposal,
                approve,
                reject,
                actor,
                role,
            } => {
                let decision = match (approve, reject) {
                    (true, false) => Decision::Approve,
                    (false, true) => Decision::Reject,
                    _ => return Err(eyre!("pass exactly one of --approve or --reject")),
                };
                cmd_proposals_decide(&job, &proposal, decision, &actor, role).await
            }
            ProposalsAction::Execute {
                job,
                proposal,
                actor,
            } => cmd_proposals_execute(&job, &proposal, &actor).await,
        },
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show().await,
        },
    }
}

// ---------------------------------------------------------------------------
// Shared plumbing
// ---------------------------------------------------------------------------

fn jobs_root(config: &AppConfig) -> PathBuf {
    expand_tilde(&config.defaults.data_root).join("jobs")
}

fn database_path(job_dir: &std::path::Path) -> PathBuf {
    job_dir.join("indexes").join("docflow.db")
}

async fn open_job_storage(config: &AppConfig, job: &JobId) -> Result<(ManifestStore, Storage)> {
    let store = ManifestStore::new(jobs_root(config));
    let storage = Storage::open(&database_path(&store.job_dir(job))).await?;
    Ok((store, storage))
}

fn approval_queue(config: &AppConfig, job_dir: &std::path::Path) -> Result<ApprovalQueue> {
    let required_role: ActorRole = config.approval.required_role.parse()?;
    Ok(ApprovalQueue::new(
        AuditLog::for_job_dir(job_dir),
        required_role,
    ))
}

/// Proposals for a job, or empty when it has no database yet. Opening a
/// missing database read-only would still create an empty file on disk.
async fn read_proposals(
    job_dir: &std::path::Path,
    job_key: &str,
    state: Option<ProposalState>,
) -> Result<Vec<DeletionProposal>> {
    let db_path = database_path(job_dir);
    if !db_path.exists() {
        return Ok(Vec::new());
    }
    let storage = Storage::open_readonly(&db_path).await?;
    Ok(storage.list_proposals(job_key, state).await?)
}

// ---------------------------------------------------------------------------
// run
// ---------------------------------------------------------------------------

async fn cmd_run(
    sources: PathBuf,
    job: Option<JobId>,
    env: Option<String>,
    from: Option<PassName>,
    only: Vec<PassName>,
) -> Result<()> {
    let config = load_config()?;

    if !sources.is_dir() {
        return Err(eyre!(
            "sources directory '{}' does not exist",
            sources.display()
        ));
    }

    let job_id = job.unwrap_or_default();
    let environment = env.unwrap_or_else(|| config.defaults.environment.clone());

    let store = ManifestStore::new(jobs_root(&config));
    let job_dir = store.job_dir(&job_id);
    let storage = Storage::open(&database_path(&job_dir)).await?;
    let queue = approval_queue(&config, &job_dir)?;
    let orchestrator = Orchestrator::new(
        store,
        storage,
        queue,
        &config,
        HandlerRegistry::default_handlers(),
    )?;

    info!(%job_id, environment, sources = %sources.display(), "starting run");

    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });
    }

    let opts = RunOptions {
        job_id: job_id.clone(),
        environment,
        sources_root: sources,
        from,
        only,
    };
    let reporter = CliProgress::new();
    let summary = orchestrator.run(&opts, &reporter, &cancel).await;
    reporter.finish();
    let summary = summary?;

    print_summary(&summary, &job_dir);
    Ok(())
}

fn print_summary(summary: &RunSummary, job_dir: &std::path::Path) {
    println!();
    println!("  Job: {}", summary.job_id);
    for (pass, status) in &summary.statuses {
        println!("  {:<8} {status}", pass.to_string());
    }
    if !summary.reconciled.is_empty() {
        println!();
        println!("  Reconciled sources:");
        for report in &summary.reconciled {
            println!(
                "  {:<24} +{} records, {} deletion proposal(s), expected now {}",
                report.source_id, report.inserted, report.proposed, report.new_expected
            );
        }
        if summary.reconciled.iter().any(|r| r.proposed > 0) {
            println!("  Review with: docflow proposals list {}", summary.job_id);
        }
    }
    println!();
    println!("  Data: {}", job_dir.display());
    println!();
}

// ---------------------------------------------------------------------------
// status
// ---------------------------------------------------------------------------

async fn cmd_status(job: &JobId, json: bool) -> Result<()> {
    let config = load_config()?;
    let store = ManifestStore::new(jobs_root(&config));
    let manifest = store.snapshot(job)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&manifest)?);
        return Ok(());
    }

    println!();
    println!("  Job:         {}", manifest.job.id);
    println!("  Environment: {}", manifest.job.environment);
    println!("  Created:     {}", manifest.job.created_at.to_rfc3339());
    println!("  Sources:     {}", manifest.source_fingerprints.len());
    println!();
    for pass in PassName::ALL {
        let record = manifest.pass(pass);
        let detail = match record.status {
            PassStatus::Success => format!(
                "{} records in {}ms",
                record.metrics.records_out, record.metrics.duration_ms
            ),
            PassStatus::Failed => record.failure_reason.clone().unwrap_or_default(),
            _ => String::new(),
        };
        println!("  {:<8} {:<8} {detail}", pass.to_string(), record.status.to_string());
    }

    let pending = read_proposals(
        &store.job_dir(job),
        &job.to_string(),
        Some(ProposalState::Pending),
    )
    .await?;
    if !pending.is_empty() {
        println!();
        println!("  Pending deletion proposals: {}", pending.len());
    }
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// proposals
// ---------------------------------------------------------------------------

async fn cmd_proposals_list(job: &JobId, state: Option<ProposalState>) -> Result<()> {
    let config = load_config()?;
    let store = ManifestStore::new(jobs_root(&config));

    let proposals = read_proposals(&store.job_dir(job), &job.to_string(), state).await?;
    if proposals.is_empty() {
        println!("no proposals");
        return Ok(());
    }

    for p in proposals {
        println!("{}  {:<9} {}", p.id, p.state.to_string(), p.target);
        println!("    reason:   {}", p.reason);
        if !p.evidence.is_empty() {
            println!("    evidence: {}", p.evidence);
        }
        println!("    proposed: {} at {}", p.proposed_by, p.created_at.to_rfc3339());
        if let (Some(by), Some(at)) = (&p.decided_by, &p.decided_at) {
            println!("    decided:  {by} at {}", at.to_rfc3339());
        }
    }
    Ok(())
}

async fn cmd_proposals_decide(
    job: &JobId,
    proposal: &str,
    decision: Decision,
    actor: &str,
    role: ActorRole,
) -> Result<()> {
    let config = load_config()?;
    let (store, storage) = open_job_storage(&config, job).await?;
    let queue = approval_queue(&config, &store.job_dir(job))?;

    let decided = queue
        .decide(&storage, proposal, actor, role, decision)
        .await?;
    println!("proposal {} is now {}", decided.id, decided.state);
    Ok(())
}

async fn cmd_proposals_execute(job: &JobId, proposal: &str, actor: &str) -> Result<()> {
    let config = load_config()?;
    let (store, storage) = open_job_storage(&config, job).await?;
    let queue = approval_queue(&config, &store.job_dir(job))?;

    let outcome = queue.execute(&storage, proposal, actor).await?;
    println!("executed {}: removed {}", outcome.proposal_id, outcome.removed);
    Ok(())
}

// ---------------------------------------------------------------------------
// config
// ---------------------------------------------------------------------------

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("created {}", path.display());
    Ok(())
}

async fn cmd_config_show() -> Result<()> {
    let config = load_config()?;
    println!("# {}", config_file_path()?.display());
    println!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// Per-pass progress on a single indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {msg}")
                .expect("valid template")
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
        );
        spinner.enable_steady_tick(std::time::Duration::from_millis(80));
        Self { spinner }
    }

    fn finish(&self) {
        self.spinner.finish_and_clear();
    }
}

impl ProgressReporter for CliProgress {
    fn pass_started(&self, pass: PassName) {
        self.spinner.set_message(format!("running pass {pass}"));
    }

    fn pass_finished(&self, pass: PassName, status: PassStatus) {
        self.spinner
            .println(format!("  {:<8} {status}", pass.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn listing_proposals_for_a_job_without_a_database_is_empty() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let job_dir = tmp.path().join("jobs").join("never-ran");

        let proposals = read_proposals(&job_dir, "never-ran", None)
            .await
            .expect("read proposals");
        assert!(proposals.is_empty());
        // The lookup must not leave an empty database behind.
        assert!(!database_path(&job_dir).exists());
    }
}
