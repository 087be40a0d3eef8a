use chrono::{DateTime, Duration, Utc};
use paycmd_x402::{DecimalAmount, USDC_DECIMALS};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};

use super::{Orchestrator, OrchestratorError, TickReport, start_of_day};
use crate::capabilities::{ConfirmationStatus, Reflection, ReflectionInput, SwapOrder};
use crate::paid_tools::{CallBudget, ToolCall, ToolCallContext, ToolCallError};
use crate::policy::{PolicyInput, ReasonCode};
use crate::store::{StatusUpdate, StoreError};
use crate::types::{
    CartMandate, Command, CommandStatus, EncryptedJob, IntentMandate, ParsedCommand, PlannedTool,
    ReceiptKind, RecurringRule,
};

#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("{message}")]
    PolicyRejection {
        reason_code: ReasonCode,
        message: String,
    },
    #[error("budget exceeded: {0}")]
    BudgetExceeded(String),
    #[error("cart mandate expired at {0}")]
    ExpiredMandate(DateTime<Utc>),
    #[error("mandate verification failed: {0}")]
    MandateVerification(String),
    #[error("reflection aborted: {0}")]
    ReflectionAbort(String),
    #[error("tool call failed: {0}")]
    ToolCall(ToolCallError),
    #[error("settlement failed: {0}")]
    Settlement(String),
    #[error("store error: {0}")]
    Store(StoreError),
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
}

impl ExecutionError {
    pub const MANDATE_VERIFICATION_FAILED: &'static str = "MANDATE_VERIFICATION_FAILED";

    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::PolicyRejection { reason_code, .. } => reason_code.as_str(),
            Self::BudgetExceeded(_) => "BUDGET_EXCEEDED",
            Self::ExpiredMandate(_) => "EXPIRED_MANDATE",
            Self::MandateVerification(_) => Self::MANDATE_VERIFICATION_FAILED,
            Self::ReflectionAbort(_) => "REFLECTION_ABORT",
            Self::ToolCall(error) => error.code(),
            Self::Settlement(_) => "SETTLEMENT_FAILED",
            Self::Store(error) => error.code(),
            Self::Orchestrator(error) => error.code(),
        }
    }

    /// Operator-visible refusals abort; broken collaborators fail.
    #[must_use]
    pub fn terminal_status(&self) -> CommandStatus {
        match self {
            Self::PolicyRejection { .. }
            | Self::BudgetExceeded(_)
            | Self::ExpiredMandate(_)
            | Self::ReflectionAbort(_) => CommandStatus::Aborted,
            _ => CommandStatus::Failed,
        }
    }
}

impl From<ToolCallError> for ExecutionError {
    fn from(error: ToolCallError) -> Self {
        match error {
            ToolCallError::BudgetExceeded { .. } => Self::BudgetExceeded(error.to_string()),
            other => Self::ToolCall(other),
        }
    }
}

impl From<StoreError> for ExecutionError {
    fn from(error: StoreError) -> Self {
        Self::Store(error)
    }
}

impl Orchestrator {
    pub(super) async fn execute_approved(
        &self,
        scope: &str,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> Result<(), OrchestratorError> {
        let approved = self
            .store
            .list_commands(scope, Some(CommandStatus::Approved))
            .await?;

        for command in approved {
            match self.execute(&command, now).await {
                Ok(done) => report.finish(&done),
                Err(error) => {
                    if let Some(finished) = self.fail_command(&command, &error, now).await {
                        report.finish(&finished);
                    }
                }
            }
        }
        Ok(())
    }

    async fn execute(
        &self,
        command: &Command,
        now: DateTime<Utc>,
    ) -> Result<Command, ExecutionError> {
        let scope = command.scope.as_str();
        let command_id = command.command_id.as_str();
        let intent = self
            .store
            .get_intent(scope, command_id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("intent for {command_id}")))?;

        match self.store.get_cart(scope, command_id).await? {
            Some(cart) => self.verify_cart(&cart, now)?,
            None if command.requires_approval => {
                return Err(ExecutionError::MandateVerification(
                    "approval required but no signed cart is stored".to_string(),
                ));
            }
            None => {}
        }

        let command = self
            .store
            .transition_command(
                scope,
                command_id,
                CommandStatus::Approved,
                CommandStatus::Executing,
                StatusUpdate::default(),
                now,
            )
            .await?;

        let selected = intent
            .tool_plan
            .iter()
            .map(|tool| tool.name.clone())
            .collect::<Vec<_>>();
        let estimated = intent
            .tool_plan
            .iter()
            .map(|tool| tool.price_units)
            .sum::<u64>();
        let decision = self.policy.evaluate(&PolicyInput {
            command: &command,
            command_spend_units: self.store.sum_ledger_for_command(scope, command_id).await?,
            daily_spend_units: self
                .store
                .sum_ledger_for_scope_since(scope, start_of_day(now))
                .await?,
            estimated_tool_cost_units: estimated,
            selected_tools: &selected,
            now,
        });
        if !decision.allowed {
            return Err(ExecutionError::PolicyRejection {
                reason_code: decision.reason_code,
                message: decision.message,
            });
        }

        self.record_receipt(
            scope,
            command_id,
            ReceiptKind::AgentPlan,
            None,
            json!({
                "intent_id": intent.intent_id,
                "tools": intent.tool_plan,
                "estimated_units": estimated,
                "ceiling_units": intent.ceiling_units,
                "policy": decision,
            }),
            now,
        )
        .await?;

        let mut outputs = Vec::new();
        for tool in &intent.tool_plan {
            self.run_tool(&command, &intent, tool, now, &mut outputs)
                .await?;
        }
        self.reflect(&command, &intent, now, &mut outputs).await?;

        let settlement = self.settle(&command, now).await?;
        self.record_receipt(
            scope,
            command_id,
            ReceiptKind::Settlement,
            Some(ReasonCode::Ok.as_str()),
            settlement.clone(),
            now,
        )
        .await?;
        let done = self
            .store
            .transition_command(
                scope,
                command_id,
                CommandStatus::Executing,
                CommandStatus::Done,
                StatusUpdate::default(),
                now,
            )
            .await?;

        let reference = settlement
            .get("tx_reference")
            .or_else(|| settlement.get("job_id"))
            .or_else(|| settlement.get("rule_id"))
            .and_then(Value::as_str)
            .unwrap_or("-");
        self.audit_line(scope, &format!("DONE {command_id} {reference}"))
            .await;
        tracing::info!(scope, command_id, reference, "command settled");
        Ok(done)
    }

    fn verify_cart(&self, cart: &CartMandate, now: DateTime<Utc>) -> Result<(), ExecutionError> {
        if now >= cart.expires_at {
            return Err(ExecutionError::ExpiredMandate(cart.expires_at));
        }
        let signature = cart.signature.as_deref().ok_or_else(|| {
            ExecutionError::MandateVerification("cart carries no signature".to_string())
        })?;
        let expected = self.expected_signer();
        let verification = self
            .mandates
            .verify(cart, signature, Some(expected.as_str()));
        if !verification.valid {
            tracing::error!(
                scope = %cart.scope,
                command_id = %cart.command_id,
                expected = %expected,
                recovered = ?verification.signer_address,
                "stored cart signature failed verification"
            );
            return Err(ExecutionError::MandateVerification(format!(
                "cart {} is not signed by {expected}",
                cart.cart_id
            )));
        }
        Ok(())
    }

    /// Remaining spend for the next paid call: the tighter of the command and daily headroom.
    async fn remaining_budget(
        &self,
        intent: &IntentMandate,
        now: DateTime<Utc>,
    ) -> Result<u64, ExecutionError> {
        let spent = self
            .store
            .sum_ledger_for_command(&intent.scope, &intent.command_id)
            .await?;
        let daily = self
            .store
            .sum_ledger_for_scope_since(&intent.scope, start_of_day(now))
            .await?;
        Ok(intent
            .ceiling_units
            .saturating_sub(spent)
            .min(self.config.policy.daily_ceiling_units.saturating_sub(daily)))
    }

    async fn run_tool(
        &self,
        command: &Command,
        intent: &IntentMandate,
        tool: &PlannedTool,
        now: DateTime<Utc>,
        outputs: &mut Vec<(String, Value)>,
    ) -> Result<(), ExecutionError> {
        let remaining_units = self.remaining_budget(intent, now).await?;
        let call = ToolCall {
            tool: tool.name.clone(),
            endpoint: tool.endpoint.clone(),
            body: json!({
                "scope": command.scope,
                "command_id": command.command_id,
                "kind": command.parsed.kind().as_str(),
                "command": command.parsed,
            }),
            expected_price_units: tool.price_units,
        };

        match self
            .tools
            .call(ToolCallContext { intent, now }, &call, CallBudget { remaining_units })
            .await
        {
            Ok(outcome) => {
                let spent = self
                    .store
                    .sum_ledger_for_command(&intent.scope, &intent.command_id)
                    .await?;
                if spent > intent.ceiling_units {
                    return Err(ExecutionError::BudgetExceeded(format!(
                        "ledger total {spent} exceeds ceiling {}",
                        intent.ceiling_units
                    )));
                }
                outputs.push((tool.name.clone(), outcome.response.body));
                Ok(())
            }
            Err(error) if tool.optional => {
                tracing::warn!(
                    scope = %command.scope,
                    command_id = %command.command_id,
                    tool = %tool.name,
                    code = error.code(),
                    error = %error,
                    "optional tool failed; continuing"
                );
                Ok(())
            }
            Err(error) => Err(error.into()),
        }
    }

    /// Reflector failures are logged and execution proceeds.
    async fn reflect(
        &self,
        command: &Command,
        intent: &IntentMandate,
        now: DateTime<Utc>,
        outputs: &mut Vec<(String, Value)>,
    ) -> Result<(), ExecutionError> {
        let Some(reflector) = self.reflector.as_ref() else {
            return Ok(());
        };

        let remaining_units = self.remaining_budget(intent, now).await?;
        let input = ReflectionInput {
            command: command.clone(),
            tool_outputs: outputs.clone(),
            remaining_units,
        };
        let reflection = match reflector.reflect(&input).await {
            Ok(reflection) => reflection,
            Err(error) => {
                tracing::warn!(
                    scope = %command.scope,
                    command_id = %command.command_id,
                    error = %error,
                    "reflection unavailable; proceeding"
                );
                return Ok(());
            }
        };

        self.record_receipt(
            &command.scope,
            &command.command_id,
            ReceiptKind::AgentReflection,
            None,
            json!({
                "reflection": reflection,
                "remaining_units": remaining_units,
                "tool_outputs": outputs.len(),
            }),
            now,
        )
        .await?;

        match reflection {
            Reflection::Proceed => Ok(()),
            Reflection::Abort { reason } => Err(ExecutionError::ReflectionAbort(reason)),
            Reflection::MoreTools { tools } => {
                for name in tools {
                    if !self.policy.is_allowlisted(&name) {
                        tracing::warn!(tool = %name, "reflection asked for a tool outside the allowlist");
                        continue;
                    }
                    let Some(tool) = self.planner.lookup(&name) else {
                        tracing::warn!(tool = %name, "reflection asked for an unknown tool");
                        continue;
                    };
                    let remaining_units = self.remaining_budget(intent, now).await?;
                    if tool.price_units > remaining_units {
                        tracing::warn!(
                            tool = %name,
                            price_units = tool.price_units,
                            remaining_units,
                            "skipping follow-up tool over remaining budget"
                        );
                        continue;
                    }
                    let follow_up = PlannedTool {
                        optional: true,
                        ..tool
                    };
                    self.run_tool(command, intent, &follow_up, now, outputs)
                        .await?;
                }
                Ok(())
            }
        }
    }

    /// Perform the command's effect and return the settlement receipt payload.
    async fn settle(&self, command: &Command, now: DateTime<Utc>) -> Result<Value, ExecutionError> {
        let scope = command.scope.as_str();
        let command_id = command.command_id.as_str();

        match &command.parsed {
            ParsedCommand::PayParty(pay) => {
                let tx_reference = self
                    .wallet
                    .transfer(&pay.recipient, &pay.token, pay.amount_units)
                    .await
                    .map_err(|error| ExecutionError::Settlement(error.to_string()))?;
                let confirmation = self
                    .wallet
                    .wait_for_confirmation(&tx_reference)
                    .await
                    .map_err(|error| ExecutionError::Settlement(error.to_string()))?;
                if confirmation.status == ConfirmationStatus::Reverted {
                    return Err(ExecutionError::Settlement(format!(
                        "transfer {tx_reference} reverted"
                    )));
                }
                Ok(json!({
                    "kind": command.parsed.kind().as_str(),
                    "tx_reference": tx_reference,
                    "block_ref": confirmation.block_ref,
                    "confirmations": confirmation.confirmations,
                    "vendor": pay.vendor,
                    "recipient": pay.recipient,
                    "token": pay.token,
                    "amount_units": pay.amount_units,
                    "amount": DecimalAmount::format_units(pay.amount_units, USDC_DECIMALS),
                    "reference": pay.reference,
                }))
            }
            ParsedCommand::TreasurySwap(swap) => {
                let venue = self.swap_venue.as_ref().ok_or_else(|| {
                    ExecutionError::Settlement("no swap venue configured".to_string())
                })?;
                let order = SwapOrder {
                    token_in: swap.token_in.clone(),
                    token_out: swap.token_out.clone(),
                    amount_units: swap.amount_units,
                    slippage_bps: swap.slippage_bps,
                    max_spend_units: swap.max_spend_units,
                };
                let tx_reference = venue
                    .swap(&order)
                    .await
                    .map_err(|error| ExecutionError::Settlement(error.to_string()))?;
                self.record_receipt(
                    scope,
                    command_id,
                    ReceiptKind::Defi,
                    None,
                    json!({ "order": order, "tx_reference": tx_reference }),
                    now,
                )
                .await?;
                Ok(json!({
                    "kind": command.parsed.kind().as_str(),
                    "tx_reference": tx_reference,
                    "token_in": swap.token_in,
                    "token_out": swap.token_out,
                    "amount_units": swap.amount_units,
                }))
            }
            ParsedCommand::PrivateTimedPayout(payout) => {
                let unlock_at = payout.unlock_at.ok_or_else(|| {
                    ExecutionError::Settlement(format!(
                        "unlock time {:?} is not a timestamp",
                        payout.unlock_at_raw
                    ))
                })?;
                let sealed = json!({
                    "command_id": command_id,
                    "recipient": payout.recipient,
                    "token": payout.token,
                    "amount_units": payout.amount_units,
                })
                .to_string();
                let job = self
                    .queue
                    .seal(scope, command_id, &sealed, unlock_at, now)
                    .await
                    .map_err(|error| ExecutionError::Settlement(error.to_string()))?;
                self.store.put_job(job.clone()).await?;
                self.record_receipt(
                    scope,
                    command_id,
                    ReceiptKind::Encrypted,
                    None,
                    json!({
                        "job_id": job.job_id,
                        "status": job.status.as_str(),
                        "unlock_at": unlock_at.to_rfc3339(),
                    }),
                    now,
                )
                .await?;
                Ok(json!({
                    "kind": command.parsed.kind().as_str(),
                    "job_id": job.job_id,
                    "unlock_at": unlock_at.to_rfc3339(),
                }))
            }
            ParsedCommand::RecurringPay(recurring) => {
                let digest = Sha256::digest(format!("{scope}|{command_id}").as_bytes());
                let rule = RecurringRule {
                    rule_id: format!("rule_{}", &hex::encode(digest)[..16]),
                    scope: scope.to_string(),
                    source_command_id: command_id.to_string(),
                    amount_units: recurring.amount_units,
                    token: recurring.token.clone(),
                    recipient: recurring.recipient.clone(),
                    interval_seconds: recurring.interval_seconds,
                    next_run_at: recurring.start_at.unwrap_or(now),
                    occurrences: 0,
                    active: true,
                    created_at: now,
                    vendor: recurring.vendor.clone(),
                };
                self.store.put_recurring_rule(rule.clone()).await?;
                self.record_receipt(
                    scope,
                    command_id,
                    ReceiptKind::Recurring,
                    None,
                    json!({
                        "rule_id": rule.rule_id,
                        "interval_seconds": rule.interval_seconds,
                        "next_run_at": rule.next_run_at.to_rfc3339(),
                    }),
                    now,
                )
                .await?;
                Ok(json!({
                    "kind": command.parsed.kind().as_str(),
                    "rule_id": rule.rule_id,
                    "next_run_at": rule.next_run_at.to_rfc3339(),
                }))
            }
        }
    }

    /// Terminate a command after a failed execution. Returns the terminal record when written.
    async fn fail_command(
        &self,
        command: &Command,
        error: &ExecutionError,
        now: DateTime<Utc>,
    ) -> Option<Command> {
        let current = match self
            .store
            .get_command(&command.scope, &command.command_id)
            .await
        {
            Ok(Some(current)) if !current.status.is_terminal() => current,
            Ok(_) => return None,
            Err(store_error) => {
                tracing::error!(
                    scope = %command.scope,
                    command_id = %command.command_id,
                    error = %store_error,
                    "cannot reload command after execution error"
                );
                return None;
            }
        };

        match self
            .terminate(
                &current,
                error.terminal_status(),
                error.code(),
                &error.to_string(),
                now,
            )
            .await
        {
            Ok(finished) => Some(finished),
            Err(terminate_error) => {
                tracing::error!(
                    scope = %command.scope,
                    command_id = %command.command_id,
                    error = %terminate_error,
                    "failed to record terminal status"
                );
                None
            }
        }
    }

    /// One job's failure is counted and the rest of the queue still advances.
    pub(super) async fn advance_jobs(
        &self,
        scope: &str,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> Result<(), OrchestratorError> {
        for job in self.store.list_open_jobs(scope).await? {
            match self.advance_job(scope, &job, now).await {
                Ok(true) => report.job_transitions += 1,
                Ok(false) => {}
                Err(error) => {
                    tracing::error!(
                        scope,
                        job_id = %job.job_id,
                        code = error.code(),
                        error = %error,
                        "job advance not recorded"
                    );
                    report.job_errors += 1;
                }
            }
        }
        Ok(())
    }

    /// Returns whether the job changed status.
    async fn advance_job(
        &self,
        scope: &str,
        job: &EncryptedJob,
        now: DateTime<Utc>,
    ) -> Result<bool, OrchestratorError> {
        let outcome = match self.queue.advance(job, now).await {
            Ok(outcome) => outcome,
            Err(error) => {
                tracing::warn!(scope, job_id = %job.job_id, error = %error, "job not advanced");
                return Ok(false);
            }
        };
        if outcome.job != *job {
            self.store.put_job(outcome.job.clone()).await?;
        }
        if !outcome.transitioned() {
            return Ok(false);
        }

        let updated = &outcome.job;
        self.record_receipt(
            scope,
            &updated.command_id,
            ReceiptKind::Encrypted,
            None,
            json!({
                "job_id": updated.job_id,
                "phase": outcome.phase.as_str(),
                "status": updated.status.as_str(),
                "tx_reference": updated.tx_reference,
                "decrypted_payload": updated.decrypted_payload,
                "attempts": updated.attempts,
                "last_error": updated.last_error,
            }),
            now,
        )
        .await?;
        self.audit_line(
            scope,
            &format!(
                "JOB {} {} {}",
                updated.job_id,
                updated.status.as_str(),
                updated.command_id
            ),
        )
        .await;
        Ok(true)
    }

    /// Queue one generated payment line per due rule. Missed periods collapse into one line.
    pub(super) async fn run_recurring_rules(
        &self,
        scope: &str,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> Result<(), OrchestratorError> {
        for rule in self.store.list_recurring_rules(scope).await? {
            if !rule.active || rule.next_run_at > now {
                continue;
            }
            let rule_id = rule.rule_id.clone();
            match self.fire_rule(scope, rule, now).await {
                Ok(()) => report.recurring_emitted += 1,
                Err(error) => {
                    tracing::error!(
                        scope,
                        rule_id = %rule_id,
                        code = error.code(),
                        error = %error,
                        "recurring payment not queued"
                    );
                    report.recurring_errors += 1;
                }
            }
        }
        Ok(())
    }

    /// The rule only advances once its line is queued, so a failed rule fires again next tick.
    async fn fire_rule(
        &self,
        scope: &str,
        mut rule: RecurringRule,
        now: DateTime<Utc>,
    ) -> Result<(), OrchestratorError> {
        let occurrence = rule.occurrences.saturating_add(1);
        self.store
            .push_generated_line(scope, recurring_line(&rule, occurrence))
            .await?;

        let interval = Duration::seconds(rule.interval_seconds.max(1));
        while rule.next_run_at <= now {
            rule.next_run_at += interval;
        }
        rule.occurrences = occurrence;
        tracing::info!(
            scope,
            rule_id = %rule.rule_id,
            occurrence,
            next_run_at = %rule.next_run_at,
            "recurring payment queued"
        );
        self.store.put_recurring_rule(rule).await?;
        Ok(())
    }
}

/// Strict-grammar payment line for one occurrence of a rule.
fn recurring_line(rule: &RecurringRule, occurrence: u64) -> String {
    format!(
        "PAY_VENDOR {} {} {} TO {} REF {}#{occurrence}",
        rule.vendor.as_deref().unwrap_or(rule.rule_id.as_str()),
        DecimalAmount::format_units(rule.amount_units, USDC_DECIMALS),
        rule.token,
        rule.recipient,
        rule.rule_id
    )
}
