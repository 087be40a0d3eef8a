//! Time-locked encrypted settlement jobs, advanced one phase per poll.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::capabilities::{CapabilityError, EncryptionAuthority};
use crate::types::{EncryptedJob, JobStatus};

#[derive(Debug, thiserror::Error)]
pub enum ConditionalError {
    #[error("transient authority error: {0}")]
    Transient(String),
    #[error("unrecoverable authority error: {0}")]
    Unrecoverable(String),
    #[error("job {0} is already terminal")]
    Terminal(String),
}

impl ConditionalError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Transient(_) => "CONDITIONAL_TRANSIENT",
            Self::Unrecoverable(_) => "CONDITIONAL_FAILED",
            Self::Terminal(_) => "CONDITIONAL_TERMINAL",
        }
    }
}

impl From<CapabilityError> for ConditionalError {
    fn from(error: CapabilityError) -> Self {
        if error.is_transient() {
            Self::Transient(error.to_string())
        } else {
            Self::Unrecoverable(error.to_string())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvancePhase {
    Waiting,
    Submitted,
    Decrypted,
    Retrying,
    Failed,
}

impl AdvancePhase {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Submitted => "submitted",
            Self::Decrypted => "decrypted",
            Self::Retrying => "retrying",
            Self::Failed => "failed",
        }
    }
}

/// Result of one poll. `job` is the updated record to persist.
#[derive(Debug, Clone)]
pub struct AdvanceOutcome {
    pub phase: AdvancePhase,
    pub job: EncryptedJob,
}

impl AdvanceOutcome {
    /// True when the job changed status during this poll.
    #[must_use]
    pub fn transitioned(&self) -> bool {
        matches!(
            self.phase,
            AdvancePhase::Submitted | AdvancePhase::Decrypted | AdvancePhase::Failed
        )
    }
}

pub struct ConditionalQueue {
    authority: Arc<dyn EncryptionAuthority>,
}

impl ConditionalQueue {
    #[must_use]
    pub fn new(authority: Arc<dyn EncryptionAuthority>) -> Self {
        Self { authority }
    }

    /// Encrypt a payout payload into a new PENDING job.
    pub async fn seal(
        &self,
        scope: &str,
        command_id: &str,
        payload: &str,
        unlock_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<EncryptedJob, ConditionalError> {
        let encrypted_payload = self.authority.encrypt(payload, unlock_at).await?;

        let mut hasher = Sha256::new();
        hasher.update(scope.as_bytes());
        hasher.update(command_id.as_bytes());
        hasher.update(encrypted_payload.as_bytes());
        hasher.update(unlock_at.timestamp().to_be_bytes());
        let job_id = format!("job_{}", &hex::encode(hasher.finalize())[..32]);

        Ok(EncryptedJob {
            job_id,
            scope: scope.to_string(),
            command_id: command_id.to_string(),
            unlock_at,
            encrypted_payload,
            status: JobStatus::Pending,
            tx_reference: None,
            decrypted_payload: None,
            attempts: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// Move a job forward by at most one phase.
    ///
    /// Transient authority failures keep the job's status and bump `attempts`; unrecoverable
    /// ones move it to FAILED. Both come back as `Ok` with the updated job.
    pub async fn advance(
        &self,
        job: &EncryptedJob,
        now: DateTime<Utc>,
    ) -> Result<AdvanceOutcome, ConditionalError> {
        if job.status.is_terminal() {
            return Err(ConditionalError::Terminal(job.job_id.clone()));
        }

        let step = match (job.status, job.tx_reference.as_deref()) {
            (JobStatus::Pending, _) if now < job.unlock_at => {
                return Ok(AdvanceOutcome {
                    phase: AdvancePhase::Waiting,
                    job: job.clone(),
                });
            }
            (JobStatus::Pending, None) => self
                .authority
                .submit(&job.encrypted_payload)
                .await
                .map(Step::Submitted),
            (JobStatus::Pending, Some(tx_reference)) => Ok(Step::Submitted(tx_reference.to_string())),
            (JobStatus::Submitted, Some(tx_reference)) => self
                .authority
                .fetch_decrypted(tx_reference)
                .await
                .map(Step::Fetched),
            (JobStatus::Submitted, None) => Err(CapabilityError::Rejected(
                "submitted job has no tx reference".to_string(),
            )),
            (JobStatus::Decrypted | JobStatus::Failed, _) => {
                return Err(ConditionalError::Terminal(job.job_id.clone()));
            }
        };

        let mut next = job.clone();
        next.updated_at = now;
        let phase = match step {
            Ok(Step::Submitted(tx_reference)) => {
                next.status = JobStatus::Submitted;
                next.tx_reference = Some(tx_reference);
                next.last_error = None;
                AdvancePhase::Submitted
            }
            Ok(Step::Fetched(Some(payload))) => {
                next.status = JobStatus::Decrypted;
                next.decrypted_payload = Some(payload);
                next.last_error = None;
                AdvancePhase::Decrypted
            }
            Ok(Step::Fetched(None)) => AdvancePhase::Waiting,
            Err(error) => {
                next.attempts = next.attempts.saturating_add(1);
                next.last_error = Some(error.to_string());
                match ConditionalError::from(error) {
                    ConditionalError::Transient(reason) => {
                        tracing::warn!(job_id = %job.job_id, reason = %reason, "conditional job will retry");
                        AdvancePhase::Retrying
                    }
                    _ => {
                        tracing::error!(job_id = %job.job_id, "conditional job failed");
                        next.status = JobStatus::Failed;
                        AdvancePhase::Failed
                    }
                }
            }
        };

        Ok(AdvanceOutcome { phase, job: next })
    }
}

enum Step {
    Submitted(String),
    Fetched(Option<String>),
}
