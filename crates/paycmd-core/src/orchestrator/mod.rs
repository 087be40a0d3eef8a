//! Per-scope tick loop and operator entrypoints.
//!
//! One tick ingests new command text, executes approved commands, advances conditional jobs and
//! fires due recurring rules. Only one tick runs per scope at a time; approvals and aborts wait
//! for the running tick to finish.

mod execute;
mod ingest;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::Mutex;

use crate::capabilities::{
    AuditSink, Clock, CommandSource, EncryptionAuthority, Reflector, Signer, SwapVenue,
    ToolPlanner, ToolTransport, Wallet,
};
use crate::compiler::CommandCompiler;
use crate::conditional::ConditionalQueue;
use crate::config::OrchestratorConfig;
use crate::mandates::{MandateAuthority, MandateError};
use crate::paid_tools::BudgetedToolClient;
use crate::policy::PolicyEngine;
use crate::receipts::{ReceiptInput, build_receipt};
use crate::store::{CommandStore, StatusUpdate, StoreError};
use crate::types::{
    CartMandate, Command, CommandStatus, EncryptedJob, IntentMandate, LedgerEntry, MandateStatus,
    PaymentMandate, Receipt, ReceiptKind,
};

pub use execute::ExecutionError;

pub const OPERATOR_ABORT: &str = "OPERATOR_ABORT";

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("scope {0} already has a tick in progress")]
    ScopeBusy(String),
    #[error("command {0} not found")]
    NotFound(String),
    #[error("command {command_id} is {status:?}")]
    InvalidState {
        command_id: String,
        status: CommandStatus,
    },
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("mandate error: {0}")]
    Mandate(#[from] MandateError),
    #[error("receipt error: {0}")]
    Receipt(String),
    #[error("compiler setup failed: {0}")]
    Compiler(String),
}

impl OrchestratorError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::ScopeBusy(_) => "SCOPE_BUSY",
            Self::NotFound(_) => "NOT_FOUND",
            Self::InvalidState { .. } => "INVALID_STATE",
            Self::Store(error) => error.code(),
            Self::Mandate(error) => error.code(),
            Self::Receipt(_) => "RECEIPT_ERROR",
            Self::Compiler(_) => "COMPILER_SETUP_FAILED",
        }
    }
}

pub struct Collaborators {
    pub store: Arc<dyn CommandStore>,
    pub source: Arc<dyn CommandSource>,
    pub signer: Arc<dyn Signer>,
    pub wallet: Arc<dyn Wallet>,
    pub transport: Arc<dyn ToolTransport>,
    pub encryption: Arc<dyn EncryptionAuthority>,
    pub audit: Arc<dyn AuditSink>,
    pub planner: Arc<dyn ToolPlanner>,
    pub swap_venue: Option<Arc<dyn SwapVenue>>,
    pub reflector: Option<Arc<dyn Reflector>>,
    pub clock: Arc<dyn Clock>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FinishedCommand {
    pub command_id: String,
    pub status: CommandStatus,
    pub reason_code: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub scope: String,
    pub created: Vec<String>,
    pub duplicates: usize,
    pub needs_info: usize,
    pub unrecognized: usize,
    pub ingest_errors: usize,
    pub finished: Vec<FinishedCommand>,
    pub job_transitions: usize,
    pub job_errors: usize,
    pub recurring_emitted: usize,
    pub recurring_errors: usize,
    pub phase_errors: usize,
}

impl TickReport {
    fn new(scope: &str) -> Self {
        Self {
            scope: scope.to_string(),
            ..Self::default()
        }
    }

    fn phase_failed(&mut self, phase: &str, error: &OrchestratorError) {
        tracing::error!(
            scope = %self.scope,
            phase,
            code = error.code(),
            error = %error,
            "tick phase failed; continuing"
        );
        self.phase_errors += 1;
    }

    fn finish(&mut self, command: &Command) {
        self.finished.push(FinishedCommand {
            command_id: command.command_id.clone(),
            status: command.status,
            reason_code: command.reason_code.clone(),
        });
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApprovalOutcome {
    pub approved: bool,
    pub signer_address: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommandTrace {
    pub command: Command,
    pub intent: Option<IntentMandate>,
    pub cart: Option<CartMandate>,
    pub payment_mandates: Vec<PaymentMandate>,
    pub receipts: Vec<Receipt>,
    pub ledger: Vec<LedgerEntry>,
    pub jobs: Vec<EncryptedJob>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SpendSummary {
    pub command_id: String,
    pub ceiling_units: u64,
    pub spent_units: u64,
    pub remaining_units: u64,
    pub daily_spent_units: u64,
    pub daily_ceiling_units: u64,
    pub paid_calls: usize,
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    store: Arc<dyn CommandStore>,
    source: Arc<dyn CommandSource>,
    wallet: Arc<dyn Wallet>,
    audit: Arc<dyn AuditSink>,
    planner: Arc<dyn ToolPlanner>,
    swap_venue: Option<Arc<dyn SwapVenue>>,
    reflector: Option<Arc<dyn Reflector>>,
    clock: Arc<dyn Clock>,
    compiler: CommandCompiler,
    policy: PolicyEngine,
    mandates: Arc<MandateAuthority>,
    tools: BudgetedToolClient,
    queue: ConditionalQueue,
    scope_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        collaborators: Collaborators,
    ) -> Result<Self, OrchestratorError> {
        let compiler =
            CommandCompiler::new().map_err(|error| OrchestratorError::Compiler(error.to_string()))?;
        let mandates = Arc::new(MandateAuthority::new(
            collaborators.signer.clone(),
            config.chain_id,
            config.mandate_window_seconds,
        ));
        let tools = BudgetedToolClient::new(
            collaborators.transport,
            collaborators.signer,
            collaborators.store.clone(),
            mandates.clone(),
            config.retry,
            config.payment_network.clone(),
            config.chain_id,
        );

        Ok(Self {
            policy: PolicyEngine::new(config.policy.clone()),
            config,
            store: collaborators.store,
            source: collaborators.source,
            wallet: collaborators.wallet,
            audit: collaborators.audit,
            planner: collaborators.planner,
            swap_venue: collaborators.swap_venue,
            reflector: collaborators.reflector,
            clock: collaborators.clock,
            compiler,
            mandates,
            tools,
            queue: ConditionalQueue::new(collaborators.encryption),
            scope_locks: Mutex::new(HashMap::new()),
        })
    }

    #[must_use]
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Run one pass over a scope. Returns `ScopeBusy` if another tick holds the scope.
    ///
    /// Failures inside a phase are counted in the report and the remaining phases still run.
    pub async fn tick(&self, scope: &str, now: DateTime<Utc>) -> Result<TickReport, OrchestratorError> {
        let lock = self.scope_lock(scope).await;
        let Ok(_guard) = lock.try_lock_owned() else {
            tracing::debug!(scope, "tick skipped: scope busy");
            return Err(OrchestratorError::ScopeBusy(scope.to_string()));
        };

        let mut report = TickReport::new(scope);
        if let Err(error) = self.ingest(scope, now, &mut report).await {
            report.phase_failed("ingest", &error);
        }
        if let Err(error) = self.execute_approved(scope, now, &mut report).await {
            report.phase_failed("execute", &error);
        }
        if let Err(error) = self.advance_jobs(scope, now, &mut report).await {
            report.phase_failed("jobs", &error);
        }
        if let Err(error) = self.run_recurring_rules(scope, now, &mut report).await {
            report.phase_failed("recurring", &error);
        }

        tracing::info!(
            scope,
            created = report.created.len(),
            finished = report.finished.len(),
            needs_info = report.needs_info,
            job_transitions = report.job_transitions,
            job_errors = report.job_errors,
            recurring_emitted = report.recurring_emitted,
            recurring_errors = report.recurring_errors,
            phase_errors = report.phase_errors,
            "tick complete"
        );
        Ok(report)
    }

    /// Build, sign and verify the cart for a command awaiting approval.
    pub async fn request_approval(
        &self,
        scope: &str,
        command_id: &str,
    ) -> Result<ApprovalOutcome, OrchestratorError> {
        let lock = self.scope_lock(scope).await;
        let _guard = lock.lock_owned().await;
        let now = self.clock.now();

        let command = self.load_command(scope, command_id).await?;
        if command.status != CommandStatus::AwaitingApproval {
            return Err(OrchestratorError::InvalidState {
                command_id: command_id.to_string(),
                status: command.status,
            });
        }
        let intent = self
            .store
            .get_intent(scope, command_id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("intent for {command_id}")))?;

        let mut cart = self.mandates.build_cart_mandate(&intent, now);
        if let Err(error) = self.mandates.ensure_not_expired(&cart, now) {
            self.terminate(&command, CommandStatus::Aborted, error.code(), &error.to_string(), now)
                .await?;
            return Ok(ApprovalOutcome {
                approved: false,
                signer_address: None,
            });
        }

        let (signer_address, signature) = self.mandates.request_signature(&cart).await?;
        let expected = self.expected_signer();
        let verification = self
            .mandates
            .verify(&cart, &signature, Some(expected.as_str()));
        if !verification.valid {
            tracing::error!(
                scope,
                command_id,
                expected = %expected,
                recovered = ?verification.signer_address,
                "cart signature does not match the approver"
            );
            self.terminate(
                &command,
                CommandStatus::Failed,
                ExecutionError::MANDATE_VERIFICATION_FAILED,
                "cart signature does not match the approver",
                now,
            )
            .await?;
            return Ok(ApprovalOutcome {
                approved: false,
                signer_address: verification.signer_address,
            });
        }

        cart.signer_address = Some(signer_address.clone());
        cart.signature = Some(signature);
        self.store.put_cart(cart).await?;
        self.store
            .update_intent_status(scope, command_id, MandateStatus::Approved)
            .await?;
        self.store
            .transition_command(
                scope,
                command_id,
                CommandStatus::AwaitingApproval,
                CommandStatus::Approved,
                StatusUpdate::default(),
                now,
            )
            .await?;
        self.audit_line(scope, &format!("APPROVED {command_id} signer={signer_address}"))
            .await;

        Ok(ApprovalOutcome {
            approved: true,
            signer_address: Some(signer_address),
        })
    }

    /// Abort a live command. Terminal commands are returned unchanged.
    pub async fn simulate_abort(
        &self,
        scope: &str,
        command_id: &str,
        reason: &str,
    ) -> Result<Command, OrchestratorError> {
        let lock = self.scope_lock(scope).await;
        let _guard = lock.lock_owned().await;
        let now = self.clock.now();

        let command = self.load_command(scope, command_id).await?;
        if command.status.is_terminal() {
            return Ok(command);
        }
        self.terminate(&command, CommandStatus::Aborted, OPERATOR_ABORT, reason, now)
            .await
    }

    /// Commands waiting for a signed cart, oldest first.
    pub async fn pending_approvals(&self, scope: &str) -> Result<Vec<Command>, OrchestratorError> {
        Ok(self
            .store
            .list_commands(scope, Some(CommandStatus::AwaitingApproval))
            .await?)
    }

    pub async fn trace(
        &self,
        scope: &str,
        command_id: &str,
    ) -> Result<CommandTrace, OrchestratorError> {
        let command = self.load_command(scope, command_id).await?;
        Ok(CommandTrace {
            intent: self.store.get_intent(scope, command_id).await?,
            cart: self.store.get_cart(scope, command_id).await?,
            payment_mandates: self.store.list_payment_mandates(scope, command_id).await?,
            receipts: self.store.list_receipts(scope, command_id).await?,
            ledger: self.store.list_ledger(scope, command_id).await?,
            jobs: self.store.list_jobs_for_command(scope, command_id).await?,
            command,
        })
    }

    pub async fn spend_summary(
        &self,
        scope: &str,
        command_id: &str,
    ) -> Result<SpendSummary, OrchestratorError> {
        let command = self.load_command(scope, command_id).await?;
        let ceiling_units = match self.store.get_intent(scope, command_id).await? {
            Some(intent) => intent.ceiling_units,
            None => self.policy.effective_ceiling(&command.parsed),
        };
        let spent_units = self.store.sum_ledger_for_command(scope, command_id).await?;
        let daily_spent_units = self
            .store
            .sum_ledger_for_scope_since(scope, start_of_day(self.clock.now()))
            .await?;
        let paid_calls = self.store.list_ledger(scope, command_id).await?.len();

        Ok(SpendSummary {
            command_id: command_id.to_string(),
            ceiling_units,
            spent_units,
            remaining_units: ceiling_units.saturating_sub(spent_units),
            daily_spent_units,
            daily_ceiling_units: self.config.policy.daily_ceiling_units,
            paid_calls,
        })
    }

    async fn scope_lock(&self, scope: &str) -> Arc<Mutex<()>> {
        let mut locks = self.scope_locks.lock().await;
        locks
            .entry(scope.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn load_command(&self, scope: &str, command_id: &str) -> Result<Command, OrchestratorError> {
        self.store
            .get_command(scope, command_id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(command_id.to_string()))
    }

    fn expected_signer(&self) -> String {
        self.config
            .approver_address
            .clone()
            .unwrap_or_else(|| self.mandates.signer_address())
    }

    /// Move a live command to ABORTED or FAILED with one ABORT receipt and one audit line.
    async fn terminate(
        &self,
        command: &Command,
        to: CommandStatus,
        reason_code: &str,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<Command, OrchestratorError> {
        let updated = self
            .store
            .transition_command(
                &command.scope,
                &command.command_id,
                command.status,
                to,
                StatusUpdate::reason(reason_code, message),
                now,
            )
            .await?;

        self.record_receipt(
            &command.scope,
            &command.command_id,
            ReceiptKind::Abort,
            Some(reason_code),
            json!({
                "from_status": command.status.as_str(),
                "status": to.as_str(),
                "reason_code": reason_code,
                "message": message,
            }),
            now,
        )
        .await?;
        self.audit_line(
            &command.scope,
            &format!(
                "{} {} {reason_code}: {message}",
                to.as_str(),
                command.command_id
            ),
        )
        .await;

        tracing::warn!(
            scope = %command.scope,
            command_id = %command.command_id,
            status = to.as_str(),
            reason_code,
            "command terminated"
        );
        Ok(updated)
    }

    async fn record_receipt(
        &self,
        scope: &str,
        command_id: &str,
        kind: ReceiptKind,
        reason_code: Option<&str>,
        payload: Value,
        now: DateTime<Utc>,
    ) -> Result<Receipt, OrchestratorError> {
        let receipt = build_receipt(ReceiptInput {
            scope: scope.to_string(),
            command_id: command_id.to_string(),
            kind,
            reason_code: reason_code.map(str::to_string),
            payload,
            created_at: now,
        })
        .map_err(|error| OrchestratorError::Receipt(error.to_string()))?;
        self.store.append_receipt(receipt.clone()).await?;
        Ok(receipt)
    }

    /// Audit failures are logged and otherwise ignored.
    async fn audit_line(&self, scope: &str, line: &str) {
        if let Err(error) = self.audit.append_line(scope, line).await {
            tracing::warn!(scope, error = %error, "audit append failed");
        }
    }
}

pub(crate) fn start_of_day(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive()
        .and_hms_opt(0, 0, 0)
        .map_or(now, |midnight| midnight.and_utc())
}
