use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use super::{Orchestrator, OrchestratorError, TickReport};
use crate::compiler::{CompileError, canonical_form, command_id};
use crate::store::StatusUpdate;
use crate::types::{Command, CommandStatus};

/// Label written back to the command surface for each consumed line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IngestLabel {
    Created,
    Duplicate,
    NeedsInfo,
    Unrecognized,
    Error,
}

impl IngestLabel {
    fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Duplicate => "duplicate",
            Self::NeedsInfo => "needs_info",
            Self::Unrecognized => "unrecognized",
            Self::Error => "error",
        }
    }
}

impl Orchestrator {
    /// Engine-generated lines first, then new lines from the command surface.
    pub(super) async fn ingest(
        &self,
        scope: &str,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> Result<(), OrchestratorError> {
        for line in self.store.take_generated_lines(scope).await? {
            self.ingest_line(scope, &line, now, report).await;
        }

        let pending = match self.source.list_pending(scope).await {
            Ok(pending) => pending,
            Err(error) => {
                tracing::warn!(scope, error = %error, "command source unavailable; skipping ingestion");
                return Ok(());
            }
        };

        for line in pending {
            let label = self.ingest_line(scope, &line.text, now, report).await;
            if let Err(error) = self
                .source
                .mark_consumed(&line.position_ref, label.as_str())
                .await
            {
                tracing::warn!(
                    scope,
                    position_ref = %line.position_ref,
                    error = %error,
                    "failed to mark command line consumed"
                );
            }
        }
        Ok(())
    }

    async fn ingest_line(
        &self,
        scope: &str,
        text: &str,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> IngestLabel {
        let parsed = match self.compiler.compile(text, now) {
            Ok(parsed) => parsed,
            Err(error) => {
                let label = match error {
                    CompileError::MissingFields(_) => {
                        report.needs_info += 1;
                        IngestLabel::NeedsInfo
                    }
                    CompileError::Empty | CompileError::Unrecognized => {
                        report.unrecognized += 1;
                        IngestLabel::Unrecognized
                    }
                };
                self.report_parse_failure(scope, text, &error).await;
                return label;
            }
        };

        let command_id = command_id(&canonical_form(&parsed));
        let command = Command {
            scope: scope.to_string(),
            command_id: command_id.clone(),
            raw_text: text.trim().to_string(),
            requires_approval: self.policy.requires_approval(&parsed),
            parsed,
            status: CommandStatus::New,
            reason_code: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        };

        match self.store.insert_command(command.clone()).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(scope, command_id = %command_id, "duplicate command ignored");
                report.duplicates += 1;
                return IngestLabel::Duplicate;
            }
            Err(error) => {
                tracing::error!(scope, error = %error, "failed to insert command");
                report.ingest_errors += 1;
                return IngestLabel::Error;
            }
        }

        match self.admit(command, now, report).await {
            Ok(()) => {
                report.created.push(command_id);
                IngestLabel::Created
            }
            Err(error) => {
                tracing::error!(scope, command_id = %command_id, error = %error, "failed to admit command");
                report.ingest_errors += 1;
                self.fail_admission(scope, &command_id, &error, now, report)
                    .await;
                IngestLabel::Error
            }
        }
    }

    /// A resubmitted line is a duplicate, so a half-admitted command must not stay live.
    async fn fail_admission(
        &self,
        scope: &str,
        command_id: &str,
        error: &OrchestratorError,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) {
        let current = match self.store.get_command(scope, command_id).await {
            Ok(Some(current)) if !current.status.is_terminal() => current,
            Ok(_) => return,
            Err(store_error) => {
                tracing::error!(
                    scope,
                    command_id,
                    error = %store_error,
                    "cannot reload command after admission error"
                );
                return;
            }
        };
        match self
            .terminate(
                &current,
                CommandStatus::Failed,
                error.code(),
                &error.to_string(),
                now,
            )
            .await
        {
            Ok(failed) => report.finish(&failed),
            Err(terminate_error) => {
                tracing::error!(
                    scope,
                    command_id,
                    error = %terminate_error,
                    "failed to record terminal status"
                );
            }
        }
    }

    /// Plan tools, persist the intent and route the command to approval or straight to APPROVED.
    async fn admit(
        &self,
        command: Command,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> Result<(), OrchestratorError> {
        let plan = self.planner.plan(&command.parsed);
        let ceiling = self.policy.effective_ceiling(&command.parsed);
        let intent = self
            .mandates
            .build_intent_mandate(&command, plan, ceiling, now)?;
        self.store.put_intent(intent).await?;

        let command = self
            .store
            .transition_command(
                &command.scope,
                &command.command_id,
                CommandStatus::New,
                CommandStatus::IntentCreated,
                StatusUpdate::default(),
                now,
            )
            .await?;

        let decision = self.policy.check_variant(&command.parsed, now);
        if !decision.allowed {
            let aborted = self
                .terminate(
                    &command,
                    CommandStatus::Aborted,
                    decision.reason_code.as_str(),
                    &decision.message,
                    now,
                )
                .await?;
            report.finish(&aborted);
            return Ok(());
        }

        let next = if command.requires_approval {
            CommandStatus::AwaitingApproval
        } else {
            CommandStatus::Approved
        };
        self.store
            .transition_command(
                &command.scope,
                &command.command_id,
                CommandStatus::IntentCreated,
                next,
                StatusUpdate::default(),
                now,
            )
            .await?;

        if next == CommandStatus::AwaitingApproval {
            self.audit_line(
                &command.scope,
                &format!(
                    "AWAITING_APPROVAL {} {}",
                    command.command_id,
                    command.parsed.kind().as_str()
                ),
            )
            .await;
        }
        tracing::info!(
            scope = %command.scope,
            command_id = %command.command_id,
            kind = command.parsed.kind().as_str(),
            status = next.as_str(),
            "command admitted"
        );
        Ok(())
    }

    /// One audit line per distinct failing text, however often it is resubmitted.
    async fn report_parse_failure(&self, scope: &str, text: &str, error: &CompileError) {
        let normalized = text.split_whitespace().collect::<Vec<_>>().join(" ");
        let fingerprint = hex::encode(Sha256::digest(normalized.to_lowercase().as_bytes()));

        match self.store.note_parse_failure(scope, &fingerprint).await {
            Ok(true) => {}
            Ok(false) => return,
            Err(error) => {
                tracing::warn!(scope, error = %error, "failed to record parse failure");
                return;
            }
        }

        let line = match error {
            CompileError::MissingFields(missing) => format!(
                "NEEDS_INFO {}: missing {}; example: {}",
                missing.command_guess.as_str(),
                missing.missing.join(", "),
                missing.example
            ),
            other => format!("{}: {normalized}", other.code().to_uppercase()),
        };
        tracing::info!(scope, code = error.code(), "command text rejected");
        self.audit_line(scope, &line).await;
    }
}
