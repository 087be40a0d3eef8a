use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const COMMAND_ID_PREFIX: &str = "cmd_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandStatus {
    New,
    IntentCreated,
    AwaitingApproval,
    Approved,
    Executing,
    Done,
    Aborted,
    Failed,
}

impl CommandStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::IntentCreated => "INTENT_CREATED",
            Self::AwaitingApproval => "AWAITING_APPROVAL",
            Self::Approved => "APPROVED",
            Self::Executing => "EXECUTING",
            Self::Done => "DONE",
            Self::Aborted => "ABORTED",
            Self::Failed => "FAILED",
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Aborted | Self::Failed)
    }

    /// Forward-only lifecycle. Terminal states accept nothing; any live state may abort or fail.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            Self::Aborted | Self::Failed => true,
            Self::New => false,
            Self::IntentCreated => self == Self::New,
            Self::AwaitingApproval => self == Self::IntentCreated,
            Self::Approved => matches!(self, Self::IntentCreated | Self::AwaitingApproval),
            Self::Executing => self == Self::Approved,
            Self::Done => self == Self::Executing,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    Pay,
    Swap,
    PrivatePayout,
    Recurring,
}

impl CommandKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pay => "pay",
            Self::Swap => "swap",
            Self::PrivatePayout => "private_payout",
            Self::Recurring => "recurring",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayParty {
    pub vendor: Option<String>,
    pub amount_units: u64,
    pub token: String,
    pub recipient: String,
    pub max_total_units: Option<u64>,
    pub reference: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreasurySwap {
    pub amount_units: u64,
    pub token_in: String,
    pub token_out: String,
    pub slippage_bps: u32,
    pub max_spend_units: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrivateTimedPayout {
    pub amount_units: u64,
    pub token: String,
    pub recipient: String,
    /// Unlock value as written; kept so an unparseable time still reaches policy.
    pub unlock_at_raw: String,
    pub unlock_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecurringPay {
    pub amount_units: u64,
    pub token: String,
    pub recipient: String,
    pub interval_seconds: i64,
    pub start_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub vendor: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParsedCommand {
    PayParty(PayParty),
    TreasurySwap(TreasurySwap),
    PrivateTimedPayout(PrivateTimedPayout),
    RecurringPay(RecurringPay),
}

impl ParsedCommand {
    #[must_use]
    pub fn kind(&self) -> CommandKind {
        match self {
            Self::PayParty(_) => CommandKind::Pay,
            Self::TreasurySwap(_) => CommandKind::Swap,
            Self::PrivateTimedPayout(_) => CommandKind::PrivatePayout,
            Self::RecurringPay(_) => CommandKind::Recurring,
        }
    }

    /// Amount that moves if the command settles; drives approval gating.
    #[must_use]
    pub fn principal_units(&self) -> u64 {
        match self {
            Self::PayParty(pay) => pay.amount_units,
            Self::TreasurySwap(swap) => swap.amount_units,
            Self::PrivateTimedPayout(payout) => payout.amount_units,
            Self::RecurringPay(recurring) => recurring.amount_units,
        }
    }

    /// Tool-spend ceiling declared in the command text, if any.
    #[must_use]
    pub fn declared_ceiling_units(&self) -> Option<u64> {
        match self {
            Self::PayParty(pay) => pay.max_total_units,
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub scope: String,
    pub command_id: String,
    pub raw_text: String,
    pub parsed: ParsedCommand,
    pub status: CommandStatus,
    /// Decided once at ingestion; never recomputed.
    pub requires_approval: bool,
    pub reason_code: Option<String>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MandateStatus {
    Pending,
    Approved,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedTool {
    pub name: String,
    pub endpoint: String,
    pub price_units: u64,
    /// Optional enrichment; a failed optional call does not block execution.
    #[serde(default)]
    pub optional: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntentMandate {
    pub intent_id: String,
    pub scope: String,
    pub command_id: String,
    pub tool_plan: Vec<PlannedTool>,
    pub ceiling_units: u64,
    pub status: MandateStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartMandate {
    pub cart_id: String,
    pub intent_id: String,
    pub scope: String,
    pub command_id: String,
    pub digest: String,
    pub ceiling_units: u64,
    pub expires_at: DateTime<Utc>,
    pub signer_address: Option<String>,
    pub signature: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentMandate {
    pub payment_mandate_id: String,
    pub scope: String,
    pub command_id: String,
    pub intent_id: String,
    pub tool: String,
    pub price_units: u64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReceiptKind {
    Tool,
    Settlement,
    Abort,
    Encrypted,
    Defi,
    AgentPlan,
    AgentReflection,
    Recurring,
}

impl ReceiptKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tool => "TOOL",
            Self::Settlement => "SETTLEMENT",
            Self::Abort => "ABORT",
            Self::Encrypted => "ENCRYPTED",
            Self::Defi => "DEFI",
            Self::AgentPlan => "AGENT_PLAN",
            Self::AgentReflection => "AGENT_REFLECTION",
            Self::Recurring => "RECURRING",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Receipt {
    pub receipt_id: String,
    pub scope: String,
    pub command_id: String,
    pub kind: ReceiptKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason_code: Option<String>,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    pub canonical_json_sha256: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub scope: String,
    pub command_id: String,
    pub category: String,
    pub amount_units: u64,
    pub reference_kind: String,
    pub reference_id: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Submitted,
    Decrypted,
    Failed,
}

impl JobStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Submitted => "SUBMITTED",
            Self::Decrypted => "DECRYPTED",
            Self::Failed => "FAILED",
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Decrypted | Self::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedJob {
    pub job_id: String,
    pub scope: String,
    pub command_id: String,
    pub unlock_at: DateTime<Utc>,
    pub encrypted_payload: String,
    pub status: JobStatus,
    pub tx_reference: Option<String>,
    pub decrypted_payload: Option<String>,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecurringRule {
    pub rule_id: String,
    pub scope: String,
    pub source_command_id: String,
    pub amount_units: u64,
    pub token: String,
    pub recipient: String,
    pub interval_seconds: i64,
    pub next_run_at: DateTime<Utc>,
    pub occurrences: u64,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    /// Payee label for generated lines; the rule id stands in when absent.
    #[serde(default)]
    pub vendor: Option<String>,
}
