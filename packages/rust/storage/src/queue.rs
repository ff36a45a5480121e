//! Deletion approval queue.
//!
//! State machine per proposal: PENDING → {APPROVED, REJECTED} → (APPROVED
//! only) → EXECUTED. All transitions run through this module; the storage
//! layer's guarded UPDATEs make a skipped or repeated transition a state
//! error rather than a lost write. No deletion happens without a matching
//! APPROVED proposal and audit entry.

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use docflow_shared::{ActorRole, DocflowError, Result};

use crate::audit::{AuditEntry, AuditLog};
use crate::{DeletionProposal, ProposalState, Storage};

/// Decision an authorized actor can make on a pending proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Approve,
    Reject,
}

/// Outcome of executing an approved proposal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOutcome {
    pub proposal_id: String,
    /// Human-readable description of what was removed.
    pub removed: String,
}

/// Policy-enforcing front door for the proposals table.
#[derive(Debug, Clone)]
pub struct ApprovalQueue {
    audit: AuditLog,
    required_role: ActorRole,
}

impl ApprovalQueue {
    pub fn new(audit: AuditLog, required_role: ActorRole) -> Self {
        Self {
            audit,
            required_role,
        }
    }

    /// File a new proposal in PENDING and audit it.
    pub async fn propose(
        &self,
        storage: &Storage,
        job_id: &str,
        target: &str,
        reason: &str,
        evidence: &str,
        proposed_by: &str,
    ) -> Result<DeletionProposal> {
        let proposal = DeletionProposal {
            id: Uuid::now_v7().to_string(),
            job_id: job_id.into(),
            target: target.into(),
            reason: reason.into(),
            evidence: evidence.into(),
            state: ProposalState::Pending,
            proposed_by: proposed_by.into(),
            created_at: Utc::now(),
            decided_by: None,
            decided_at: None,
            executed_at: None,
        };
        storage.insert_proposal(&proposal).await?;

        self.audit.append(
            &AuditEntry::new(proposed_by, "propose", target)
                .with_transition("none", "pending")
                .with_outcome(reason),
        )?;

        info!(proposal_id = %proposal.id, target, "deletion proposal filed");
        Ok(proposal)
    }

    /// Decide a PENDING proposal. Requires the configured role; an
    /// unauthorized attempt changes nothing and is audited as denied.
    pub async fn decide(
        &self,
        storage: &Storage,
        proposal_id: &str,
        actor: &str,
        role: ActorRole,
        decision: Decision,
    ) -> Result<DeletionProposal> {
        let proposal = self.require_proposal(storage, proposal_id).await?;

        if role != self.required_role {
            self.audit.append(
                &AuditEntry::new(actor, "decide_denied", &proposal.target)
                    .with_outcome(format!("role '{role}' lacks '{}'", self.required_role)),
            )?;
            warn!(proposal_id, actor, %role, "decision denied: insufficient role");
            return Err(DocflowError::unauthorized(
                actor,
                format!("decide proposal '{proposal_id}'"),
            ));
        }

        let new_state = match decision {
            Decision::Approve => ProposalState::Approved,
            Decision::Reject => ProposalState::Rejected,
        };

        let updated = storage
            .transition_decided(proposal_id, new_state, actor)
            .await?;
        if updated == 0 {
            return Err(DocflowError::invalid_state(format!(
                "proposal '{proposal_id}' is '{}', only pending proposals can be decided",
                proposal.state
            )));
        }

        self.audit.append(
            &AuditEntry::new(actor, new_state.as_str(), &proposal.target)
                .with_transition("pending", new_state.as_str()),
        )?;

        info!(proposal_id, actor, state = %new_state, "proposal decided");
        self.require_proposal(storage, proposal_id).await
    }

    /// Execute an APPROVED proposal: perform the deletion, transition to
    /// EXECUTED, and audit the outcome. A REJECTED proposal can never reach
    /// here.
    pub async fn execute(
        &self,
        storage: &Storage,
        proposal_id: &str,
        actor: &str,
    ) -> Result<ExecutionOutcome> {
        let proposal = self.require_proposal(storage, proposal_id).await?;

        if proposal.state != ProposalState::Approved {
            return Err(DocflowError::invalid_state(format!(
                "proposal '{proposal_id}' is '{}', only approved proposals can be executed",
                proposal.state
            )));
        }

        let removed = self.delete_target(storage, &proposal.target).await?;

        let updated = storage.transition_executed(proposal_id).await?;
        if updated == 0 {
            // The row changed under us between the check and the update.
            return Err(DocflowError::invalid_state(format!(
                "proposal '{proposal_id}' left approved state during execution"
            )));
        }

        self.audit.append(
            &AuditEntry::new(actor, "execute", &proposal.target)
                .with_transition("approved", "executed")
                .with_outcome(removed.as_str()),
        )?;

        info!(proposal_id, target = %proposal.target, "proposal executed");
        Ok(ExecutionOutcome {
            proposal_id: proposal_id.into(),
            removed,
        })
    }

    async fn require_proposal(
        &self,
        storage: &Storage,
        proposal_id: &str,
    ) -> Result<DeletionProposal> {
        storage.get_proposal(proposal_id).await?.ok_or_else(|| {
            DocflowError::validation(format!("no proposal with id '{proposal_id}'"))
        })
    }

    /// Resolve a target identifier and remove the underlying data.
    async fn delete_target(&self, storage: &Storage, target: &str) -> Result<String> {
        match target.split_once(':') {
            Some(("chunk", record_id)) => {
                let Some(chunk) = storage.get_chunk(record_id).await? else {
                    // Already gone; execution is still recorded.
                    return Ok(format!("chunk record '{record_id}' was already absent"));
                };
                storage
                    .purge_cache_entries(std::slice::from_ref(&chunk.content_hash))
                    .await?;
                storage.delete_chunk(record_id).await?;
                Ok(format!(
                    "chunk record '{record_id}' (source '{}', seq {}) and its cache entry",
                    chunk.source_id, chunk.seq
                ))
            }
            _ => Err(DocflowError::validation(format!(
                "unsupported deletion target '{target}'"
            ))),
        }
    }
}
