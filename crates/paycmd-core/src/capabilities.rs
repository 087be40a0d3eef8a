//! Seams to the outside world. The orchestrator only talks to chains, paid tools, the command
//! surface and the decryption network through these traits.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::typed_data::TypedData;
use crate::types::{Command, ParsedCommand, PlannedTool};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CapabilityError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("unavailable: {0}")]
    Unavailable(String),
    #[error("rejected: {0}")]
    Rejected(String),
}

impl CapabilityError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Transport(_) => "CAPABILITY_TRANSPORT",
            Self::Unavailable(_) => "CAPABILITY_UNAVAILABLE",
            Self::Rejected(_) => "CAPABILITY_REJECTED",
        }
    }

    /// Transport failures and temporary unavailability are worth another attempt.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Unavailable(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCommand {
    pub text: String,
    pub position_ref: String,
}

#[async_trait]
pub trait CommandSource: Send + Sync {
    async fn list_pending(&self, scope: &str) -> Result<Vec<PendingCommand>, CapabilityError>;

    async fn mark_consumed(
        &self,
        position_ref: &str,
        status_label: &str,
    ) -> Result<(), CapabilityError>;
}

#[async_trait]
pub trait Signer: Send + Sync {
    fn address(&self) -> String;

    /// 0x-prefixed 65-byte `r || s || v` signature over the typed-data digest.
    async fn sign_typed_data(&self, typed_data: &TypedData) -> Result<String, CapabilityError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmationStatus {
    Confirmed,
    Reverted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Confirmation {
    pub status: ConfirmationStatus,
    pub block_ref: Option<String>,
    pub confirmations: u64,
}

#[async_trait]
pub trait Wallet: Send + Sync {
    async fn transfer(
        &self,
        to: &str,
        token: &str,
        amount_units: u64,
    ) -> Result<String, CapabilityError>;

    async fn wait_for_confirmation(
        &self,
        tx_reference: &str,
    ) -> Result<Confirmation, CapabilityError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapOrder {
    pub token_in: String,
    pub token_out: String,
    pub amount_units: u64,
    pub slippage_bps: u32,
    pub max_spend_units: u64,
}

#[async_trait]
pub trait SwapVenue: Send + Sync {
    async fn swap(&self, order: &SwapOrder) -> Result<String, CapabilityError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Value,
}

impl HttpResponse {
    /// Case-insensitive header lookup.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

#[async_trait]
pub trait ToolTransport: Send + Sync {
    async fn post(
        &self,
        url: &str,
        body: &Value,
        headers: &BTreeMap<String, String>,
    ) -> Result<HttpResponse, CapabilityError>;
}

#[async_trait]
pub trait EncryptionAuthority: Send + Sync {
    async fn encrypt(
        &self,
        payload: &str,
        unlock_at: DateTime<Utc>,
    ) -> Result<String, CapabilityError>;

    async fn submit(&self, encrypted_payload: &str) -> Result<String, CapabilityError>;

    /// `None` until the decryption network has released the payload.
    async fn fetch_decrypted(&self, tx_reference: &str)
    -> Result<Option<String>, CapabilityError>;
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn append_line(&self, scope: &str, line: &str) -> Result<(), CapabilityError>;
}

#[derive(Debug, Clone)]
pub struct ReflectionInput {
    pub command: Command,
    pub tool_outputs: Vec<(String, Value)>,
    pub remaining_units: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Reflection {
    Proceed,
    Abort { reason: String },
    MoreTools { tools: Vec<String> },
}

#[async_trait]
pub trait Reflector: Send + Sync {
    async fn reflect(&self, input: &ReflectionInput) -> Result<Reflection, CapabilityError>;
}

pub trait ToolPlanner: Send + Sync {
    fn plan(&self, parsed: &ParsedCommand) -> Vec<PlannedTool>;

    fn lookup(&self, tool: &str) -> Option<PlannedTool>;
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde_json::json;

    use super::{CapabilityError, HttpResponse};

    #[test]
    fn transient_errors_are_transport_and_unavailable() {
        assert!(CapabilityError::Transport("reset".to_string()).is_transient());
        assert!(CapabilityError::Unavailable("503".to_string()).is_transient());
        assert!(!CapabilityError::Rejected("bad key".to_string()).is_transient());
    }

    #[test]
    fn response_header_lookup_ignores_case() {
        let response = HttpResponse {
            status: 402,
            headers: BTreeMap::from([(
                "www-authenticate".to_string(),
                "x402 price=\"0.25\"".to_string(),
            )]),
            body: json!({}),
        };
        assert_eq!(response.header("WWW-Authenticate"), Some("x402 price=\"0.25\""));
        assert_eq!(response.header("X-PAYMENT-RESPONSE"), None);
    }
}
