//! Command orchestration core: operator text in, policy-checked, mandate-signed, budgeted
//! execution out, with an append-only receipt trail per command.

pub mod capabilities;
pub mod compiler;
pub mod conditional;
pub mod config;
pub mod mandates;
pub mod memory;
pub mod orchestrator;
pub mod paid_tools;
pub mod planner;
pub mod policy;
pub mod receipts;
pub mod retry;
pub mod store;
pub mod typed_data;
pub mod types;

pub use capabilities::{
    AuditSink, CapabilityError, Clock, CommandSource, Confirmation, ConfirmationStatus,
    EncryptionAuthority, HttpResponse, PendingCommand, Reflection, ReflectionInput, Reflector,
    Signer, SwapOrder, SwapVenue, ToolPlanner, ToolTransport, Wallet,
};
pub use compiler::{CommandCompiler, CompileError, MissingFieldsError};
pub use conditional::{AdvanceOutcome, AdvancePhase, ConditionalError, ConditionalQueue};
pub use config::{ConfigError, OrchestratorConfig};
pub use mandates::{MandateAuthority, MandateError, Verification};
pub use memory::{ManualClock, MemoryAuditSink, MemoryCommandSource, SystemClock};
pub use orchestrator::{
    ApprovalOutcome, Collaborators, CommandTrace, ExecutionError, FinishedCommand, Orchestrator,
    OrchestratorError, SpendSummary, TickReport,
};
pub use paid_tools::{BudgetedToolClient, CallBudget, PaidToolOutcome, ToolCall, ToolCallError};
pub use planner::{CatalogError, ToolCatalog};
pub use policy::{PolicyConfig, PolicyDecision, PolicyEngine, PolicyInput, ReasonCode};
pub use receipts::{RECEIPT_SCHEMA_V1, ReceiptError, build_receipt, canonical_sha256};
pub use retry::{RetryPolicy, retry_with_backoff};
pub use store::{CommandStore, MemoryCommandStore, StatusUpdate, StoreError};
pub use typed_data::{LocalKeySigner, TypedData, TypedDataError};
pub use types::*;
