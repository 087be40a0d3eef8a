use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::types::{
    CartMandate, Command, CommandStatus, EncryptedJob, IntentMandate, LedgerEntry, MandateStatus,
    PaymentMandate, Receipt, RecurringRule,
};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("backend error: {0}")]
    Backend(String),
}

impl StoreError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Conflict(_) => "STORE_CONFLICT",
            Self::NotFound(_) => "STORE_NOT_FOUND",
            Self::Backend(_) => "STORE_BACKEND",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusUpdate {
    pub reason_code: Option<String>,
    pub last_error: Option<String>,
}

impl StatusUpdate {
    #[must_use]
    pub fn reason(reason_code: &str, message: impl Into<String>) -> Self {
        Self {
            reason_code: Some(reason_code.to_string()),
            last_error: Some(message.into()),
        }
    }
}

/// Key-indexed record store for commands, mandates, receipts, ledger, jobs and rules.
///
/// Every record is keyed by scope first; nothing is visible across scopes.
#[async_trait]
pub trait CommandStore: Send + Sync {
    /// Returns `false` when a command with the same id already exists in the scope.
    async fn insert_command(&self, command: Command) -> Result<bool, StoreError>;

    async fn get_command(
        &self,
        scope: &str,
        command_id: &str,
    ) -> Result<Option<Command>, StoreError>;

    async fn list_commands(
        &self,
        scope: &str,
        status: Option<CommandStatus>,
    ) -> Result<Vec<Command>, StoreError>;

    /// Compare-and-set on the current status. A mismatch or an illegal edge is a conflict.
    async fn transition_command(
        &self,
        scope: &str,
        command_id: &str,
        from: CommandStatus,
        to: CommandStatus,
        update: StatusUpdate,
        now: DateTime<Utc>,
    ) -> Result<Command, StoreError>;

    async fn put_intent(&self, intent: IntentMandate) -> Result<(), StoreError>;

    async fn get_intent(
        &self,
        scope: &str,
        command_id: &str,
    ) -> Result<Option<IntentMandate>, StoreError>;

    async fn update_intent_status(
        &self,
        scope: &str,
        command_id: &str,
        status: MandateStatus,
    ) -> Result<(), StoreError>;

    async fn put_cart(&self, cart: CartMandate) -> Result<(), StoreError>;

    async fn get_cart(
        &self,
        scope: &str,
        command_id: &str,
    ) -> Result<Option<CartMandate>, StoreError>;

    async fn put_payment_mandate(&self, mandate: PaymentMandate) -> Result<(), StoreError>;

    async fn list_payment_mandates(
        &self,
        scope: &str,
        command_id: &str,
    ) -> Result<Vec<PaymentMandate>, StoreError>;

    async fn append_receipt(&self, receipt: Receipt) -> Result<(), StoreError>;

    async fn list_receipts(
        &self,
        scope: &str,
        command_id: &str,
    ) -> Result<Vec<Receipt>, StoreError>;

    async fn append_ledger(&self, entry: LedgerEntry) -> Result<(), StoreError>;

    async fn list_ledger(
        &self,
        scope: &str,
        command_id: &str,
    ) -> Result<Vec<LedgerEntry>, StoreError>;

    async fn sum_ledger_for_command(
        &self,
        scope: &str,
        command_id: &str,
    ) -> Result<u64, StoreError>;

    async fn sum_ledger_for_scope_since(
        &self,
        scope: &str,
        since: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    /// Insert or replace by `job_id`.
    async fn put_job(&self, job: EncryptedJob) -> Result<(), StoreError>;

    async fn list_open_jobs(&self, scope: &str) -> Result<Vec<EncryptedJob>, StoreError>;

    async fn list_jobs_for_command(
        &self,
        scope: &str,
        command_id: &str,
    ) -> Result<Vec<EncryptedJob>, StoreError>;

    /// Insert or replace by `rule_id`.
    async fn put_recurring_rule(&self, rule: RecurringRule) -> Result<(), StoreError>;

    async fn list_recurring_rules(&self, scope: &str) -> Result<Vec<RecurringRule>, StoreError>;

    async fn push_generated_line(&self, scope: &str, line: String) -> Result<(), StoreError>;

    async fn take_generated_lines(&self, scope: &str) -> Result<Vec<String>, StoreError>;

    /// Returns `true` the first time a fingerprint is seen in the scope.
    async fn note_parse_failure(&self, scope: &str, fingerprint: &str)
    -> Result<bool, StoreError>;
}

pub fn memory() -> Arc<dyn CommandStore> {
    Arc::new(MemoryCommandStore::default())
}

type ScopedKey = (String, String);

fn key(scope: &str, id: &str) -> ScopedKey {
    (scope.to_string(), id.to_string())
}

#[derive(Default)]
pub struct MemoryCommandStore {
    inner: Mutex<MemoryCommandStoreInner>,
}

#[derive(Default)]
struct MemoryCommandStoreInner {
    commands: HashMap<ScopedKey, Command>,
    command_order: Vec<ScopedKey>,
    intents: HashMap<ScopedKey, IntentMandate>,
    carts: HashMap<ScopedKey, CartMandate>,
    payment_mandates: Vec<PaymentMandate>,
    receipts: Vec<Receipt>,
    ledger: Vec<LedgerEntry>,
    jobs: HashMap<String, EncryptedJob>,
    job_order: Vec<String>,
    rules: HashMap<String, RecurringRule>,
    rule_order: Vec<String>,
    generated_lines: HashMap<String, Vec<String>>,
    parse_failures: HashSet<ScopedKey>,
}

#[async_trait]
impl CommandStore for MemoryCommandStore {
    async fn insert_command(&self, command: Command) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        let command_key = key(&command.scope, &command.command_id);
        if inner.commands.contains_key(&command_key) {
            return Ok(false);
        }
        inner.command_order.push(command_key.clone());
        inner.commands.insert(command_key, command);
        Ok(true)
    }

    async fn get_command(
        &self,
        scope: &str,
        command_id: &str,
    ) -> Result<Option<Command>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.commands.get(&key(scope, command_id)).cloned())
    }

    async fn list_commands(
        &self,
        scope: &str,
        status: Option<CommandStatus>,
    ) -> Result<Vec<Command>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .command_order
            .iter()
            .filter(|(command_scope, _)| command_scope == scope)
            .filter_map(|command_key| inner.commands.get(command_key))
            .filter(|command| status.is_none_or(|status| command.status == status))
            .cloned()
            .collect())
    }

    async fn transition_command(
        &self,
        scope: &str,
        command_id: &str,
        from: CommandStatus,
        to: CommandStatus,
        update: StatusUpdate,
        now: DateTime<Utc>,
    ) -> Result<Command, StoreError> {
        let mut inner = self.inner.lock().await;
        let Some(command) = inner.commands.get_mut(&key(scope, command_id)) else {
            return Err(StoreError::NotFound(format!("command {command_id}")));
        };
        if command.status != from {
            return Err(StoreError::Conflict(format!(
                "command {command_id} is {} not {}",
                command.status.as_str(),
                from.as_str()
            )));
        }
        if !from.can_transition_to(to) {
            return Err(StoreError::Conflict(format!(
                "illegal transition {} -> {}",
                from.as_str(),
                to.as_str()
            )));
        }

        command.status = to;
        command.updated_at = now;
        if update.reason_code.is_some() {
            command.reason_code = update.reason_code;
        }
        if update.last_error.is_some() {
            command.last_error = update.last_error;
        }
        Ok(command.clone())
    }

    async fn put_intent(&self, intent: IntentMandate) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let intent_key = key(&intent.scope, &intent.command_id);
        inner.intents.insert(intent_key, intent);
        Ok(())
    }

    async fn get_intent(
        &self,
        scope: &str,
        command_id: &str,
    ) -> Result<Option<IntentMandate>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.intents.get(&key(scope, command_id)).cloned())
    }

    async fn update_intent_status(
        &self,
        scope: &str,
        command_id: &str,
        status: MandateStatus,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let Some(intent) = inner.intents.get_mut(&key(scope, command_id)) else {
            return Err(StoreError::NotFound(format!("intent for {command_id}")));
        };
        intent.status = status;
        Ok(())
    }

    async fn put_cart(&self, cart: CartMandate) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let cart_key = key(&cart.scope, &cart.command_id);
        inner.carts.insert(cart_key, cart);
        Ok(())
    }

    async fn get_cart(
        &self,
        scope: &str,
        command_id: &str,
    ) -> Result<Option<CartMandate>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.carts.get(&key(scope, command_id)).cloned())
    }

    async fn put_payment_mandate(&self, mandate: PaymentMandate) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.payment_mandates.push(mandate);
        Ok(())
    }

    async fn list_payment_mandates(
        &self,
        scope: &str,
        command_id: &str,
    ) -> Result<Vec<PaymentMandate>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .payment_mandates
            .iter()
            .filter(|mandate| mandate.scope == scope && mandate.command_id == command_id)
            .cloned()
            .collect())
    }

    async fn append_receipt(&self, receipt: Receipt) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if inner
            .receipts
            .iter()
            .any(|existing| existing.receipt_id == receipt.receipt_id)
        {
            return Err(StoreError::Conflict(format!(
                "receipt {} already recorded",
                receipt.receipt_id
            )));
        }
        inner.receipts.push(receipt);
        Ok(())
    }

    async fn list_receipts(
        &self,
        scope: &str,
        command_id: &str,
    ) -> Result<Vec<Receipt>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .receipts
            .iter()
            .filter(|receipt| receipt.scope == scope && receipt.command_id == command_id)
            .cloned()
            .collect())
    }

    async fn append_ledger(&self, entry: LedgerEntry) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.ledger.push(entry);
        Ok(())
    }

    async fn list_ledger(
        &self,
        scope: &str,
        command_id: &str,
    ) -> Result<Vec<LedgerEntry>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .ledger
            .iter()
            .filter(|entry| entry.scope == scope && entry.command_id == command_id)
            .cloned()
            .collect())
    }

    async fn sum_ledger_for_command(
        &self,
        scope: &str,
        command_id: &str,
    ) -> Result<u64, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .ledger
            .iter()
            .filter(|entry| entry.scope == scope && entry.command_id == command_id)
            .fold(0_u64, |total, entry| total.saturating_add(entry.amount_units)))
    }

    async fn sum_ledger_for_scope_since(
        &self,
        scope: &str,
        since: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .ledger
            .iter()
            .filter(|entry| entry.scope == scope && entry.created_at >= since)
            .fold(0_u64, |total, entry| total.saturating_add(entry.amount_units)))
    }

    async fn put_job(&self, job: EncryptedJob) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if !inner.jobs.contains_key(&job.job_id) {
            inner.job_order.push(job.job_id.clone());
        }
        inner.jobs.insert(job.job_id.clone(), job);
        Ok(())
    }

    async fn list_open_jobs(&self, scope: &str) -> Result<Vec<EncryptedJob>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .job_order
            .iter()
            .filter_map(|job_id| inner.jobs.get(job_id))
            .filter(|job| job.scope == scope && !job.status.is_terminal())
            .cloned()
            .collect())
    }

    async fn list_jobs_for_command(
        &self,
        scope: &str,
        command_id: &str,
    ) -> Result<Vec<EncryptedJob>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .job_order
            .iter()
            .filter_map(|job_id| inner.jobs.get(job_id))
            .filter(|job| job.scope == scope && job.command_id == command_id)
            .cloned()
            .collect())
    }

    async fn put_recurring_rule(&self, rule: RecurringRule) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if !inner.rules.contains_key(&rule.rule_id) {
            inner.rule_order.push(rule.rule_id.clone());
        }
        inner.rules.insert(rule.rule_id.clone(), rule);
        Ok(())
    }

    async fn list_recurring_rules(&self, scope: &str) -> Result<Vec<RecurringRule>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .rule_order
            .iter()
            .filter_map(|rule_id| inner.rules.get(rule_id))
            .filter(|rule| rule.scope == scope)
            .cloned()
            .collect())
    }

    async fn push_generated_line(&self, scope: &str, line: String) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner
            .generated_lines
            .entry(scope.to_string())
            .or_default()
            .push(line);
        Ok(())
    }

    async fn take_generated_lines(&self, scope: &str) -> Result<Vec<String>, StoreError> {
        let mut inner = self.inner.lock().await;
        Ok(inner.generated_lines.remove(scope).unwrap_or_default())
    }

    async fn note_parse_failure(
        &self,
        scope: &str,
        fingerprint: &str,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        Ok(inner.parse_failures.insert(key(scope, fingerprint)))
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::{CommandStore, MemoryCommandStore, StatusUpdate, StoreError};
    use crate::types::{Command, CommandStatus, LedgerEntry, ParsedCommand, PayParty};

    fn command(scope: &str, command_id: &str) -> Command {
        let now = Utc::now();
        Command {
            scope: scope.to_string(),
            command_id: command_id.to_string(),
            raw_text: "PAY 1 USDC TO 0x1111111111111111111111111111111111111111".to_string(),
            parsed: ParsedCommand::PayParty(PayParty {
                vendor: None,
                amount_units: 1_000_000,
                token: "USDC".to_string(),
                recipient: "0x1111111111111111111111111111111111111111".to_string(),
                max_total_units: None,
                reference: None,
            }),
            status: CommandStatus::New,
            requires_approval: false,
            reason_code: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn insert_is_idempotent_per_scope() -> Result<(), StoreError> {
        let store = MemoryCommandStore::default();
        assert!(store.insert_command(command("ops", "cmd_a")).await?);
        assert!(!store.insert_command(command("ops", "cmd_a")).await?);
        assert!(store.insert_command(command("treasury", "cmd_a")).await?);
        assert_eq!(store.list_commands("ops", None).await?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn transitions_are_compare_and_set() -> Result<(), StoreError> {
        let store = MemoryCommandStore::default();
        store.insert_command(command("ops", "cmd_a")).await?;
        let now = Utc::now();

        let updated = store
            .transition_command(
                "ops",
                "cmd_a",
                CommandStatus::New,
                CommandStatus::IntentCreated,
                StatusUpdate::default(),
                now,
            )
            .await?;
        assert_eq!(updated.status, CommandStatus::IntentCreated);

        let stale = store
            .transition_command(
                "ops",
                "cmd_a",
                CommandStatus::New,
                CommandStatus::IntentCreated,
                StatusUpdate::default(),
                now,
            )
            .await;
        assert!(matches!(stale, Err(StoreError::Conflict(_))));

        store
            .transition_command(
                "ops",
                "cmd_a",
                CommandStatus::IntentCreated,
                CommandStatus::Aborted,
                StatusUpdate::reason("SLIPPAGE_TOO_HIGH", "too much"),
                now,
            )
            .await?;
        let terminal = store
            .transition_command(
                "ops",
                "cmd_a",
                CommandStatus::Aborted,
                CommandStatus::Failed,
                StatusUpdate::default(),
                now,
            )
            .await;
        assert!(matches!(terminal, Err(StoreError::Conflict(_))));

        let stored = store.get_command("ops", "cmd_a").await?;
        assert_eq!(
            stored.and_then(|command| command.reason_code),
            Some("SLIPPAGE_TOO_HIGH".to_string())
        );
        Ok(())
    }

    #[tokio::test]
    async fn ledger_sums_by_command_and_window() -> Result<(), StoreError> {
        let store = MemoryCommandStore::default();
        let now = Utc::now();
        for (command_id, amount_units, created_at) in [
            ("cmd_a", 250_000, now),
            ("cmd_a", 500_000, now),
            ("cmd_b", 100_000, now - Duration::days(2)),
        ] {
            store
                .append_ledger(LedgerEntry {
                    scope: "ops".to_string(),
                    command_id: command_id.to_string(),
                    category: "tool".to_string(),
                    amount_units,
                    reference_kind: "payment_mandate".to_string(),
                    reference_id: "pm".to_string(),
                    created_at,
                })
                .await?;
        }
        assert_eq!(store.sum_ledger_for_command("ops", "cmd_a").await?, 750_000);
        assert_eq!(
            store
                .sum_ledger_for_scope_since("ops", now - Duration::hours(1))
                .await?,
            750_000
        );
        assert_eq!(store.sum_ledger_for_scope_since("other", now).await?, 0);
        Ok(())
    }

    #[tokio::test]
    async fn parse_failures_and_generated_lines() -> Result<(), StoreError> {
        let store = MemoryCommandStore::default();
        assert!(store.note_parse_failure("ops", "abc").await?);
        assert!(!store.note_parse_failure("ops", "abc").await?);

        store.push_generated_line("ops", "PAY 1 USDC".to_string()).await?;
        assert_eq!(store.take_generated_lines("ops").await?, vec!["PAY 1 USDC"]);
        assert!(store.take_generated_lines("ops").await?.is_empty());
        Ok(())
    }
}
