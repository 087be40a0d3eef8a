//! Budgeted pay-per-call client for paid verification tools.
//!
//! A call is posted once; an HTTP 402 answer is priced, checked against the remaining budget,
//! paid with a signed transfer authorization in the `X-PAYMENT` header and resubmitted. The
//! whole exchange is wrapped in a bounded exponential retry for transient failures, up to the
//! point a payment header has been sent: after that, any failure is final and the authorized
//! amount stays on the ledger.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use paycmd_x402::{
    DecimalAmount, ExactPaymentPayload, PAYMENT_HEADER, PaymentAuthorization, PaymentChallenge,
    PaymentChallengeParser, PaymentPayload, STATUS_PAYMENT_REQUIRED, USDC_DECIMALS, X402_VERSION,
};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::capabilities::{CapabilityError, HttpResponse, Signer, ToolTransport};
use crate::mandates::MandateAuthority;
use crate::receipts::{ReceiptInput, build_receipt};
use crate::retry::{RetryPolicy, retry_with_backoff};
use crate::store::{CommandStore, StoreError};
use crate::typed_data::{TypedData, TypedDataDomain, TypedDataField};
use crate::types::{IntentMandate, LedgerEntry, Receipt, ReceiptKind};

pub const TRACE_HEADER: &str = "X-Trace-Id";
pub const LEDGER_CATEGORY_TOOL: &str = "tool";
pub const LEDGER_REFERENCE_PAYMENT_MANDATE: &str = "payment_mandate";
const AUTHORIZATION_VALIDITY_SECONDS: i64 = 300;
const STATUS_TOO_MANY_REQUESTS: u16 = 429;

#[derive(Debug, thiserror::Error)]
pub enum ToolCallError {
    #[error("tool {tool} requires {required_units} units but only {remaining_units} remain")]
    BudgetExceeded {
        tool: String,
        required_units: u64,
        remaining_units: u64,
    },
    #[error("tool {tool} rejected the payment")]
    PaymentRejected { tool: String },
    #[error("tool {tool} failed after payment {payment_mandate_id} was sent: {reason}")]
    PaidCallFailed {
        tool: String,
        payment_mandate_id: String,
        reason: String,
    },
    #[error("tool {tool} answered HTTP {status}")]
    Upstream { tool: String, status: u16 },
    #[error("transport error calling {tool}: {source}")]
    Transport {
        tool: String,
        #[source]
        source: CapabilityError,
    },
    #[error("invalid payment challenge from {tool}: {reason}")]
    InvalidChallenge { tool: String, reason: String },
    #[error("payment signing failed: {0}")]
    Signing(String),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("receipt error: {0}")]
    Receipt(String),
}

impl ToolCallError {
    /// Only transport failures and 5xx/429 answers before any payment are retried.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { source, .. } => source.is_transient(),
            Self::Upstream { status, .. } => *status >= 500 || *status == STATUS_TOO_MANY_REQUESTS,
            _ => false,
        }
    }

    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::BudgetExceeded { .. } => "BUDGET_EXCEEDED",
            Self::PaymentRejected { .. } => "PAYMENT_REJECTED",
            Self::PaidCallFailed { .. } => "PAID_CALL_FAILED",
            Self::Upstream { .. } => "UPSTREAM_ERROR",
            Self::Transport { .. } => "TRANSPORT_ERROR",
            Self::InvalidChallenge { .. } => "INVALID_CHALLENGE",
            Self::Signing(_) => "SIGNING_FAILED",
            Self::Store(_) => "STORE_ERROR",
            Self::Receipt(_) => "RECEIPT_ERROR",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ToolCall {
    pub tool: String,
    pub endpoint: String,
    pub body: Value,
    pub expected_price_units: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallBudget {
    pub remaining_units: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct ToolCallContext<'a> {
    pub intent: &'a IntentMandate,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct PaidToolOutcome {
    pub response: HttpResponse,
    pub receipt: Receipt,
    pub cost_units: u64,
}

pub struct BudgetedToolClient {
    transport: Arc<dyn ToolTransport>,
    signer: Arc<dyn Signer>,
    store: Arc<dyn CommandStore>,
    authority: Arc<MandateAuthority>,
    retry: RetryPolicy,
    parser: PaymentChallengeParser,
    network: String,
    chain_id: u64,
}

struct AttemptResult {
    response: HttpResponse,
    initial_status: u16,
    payment_attempted: bool,
    cost_units: u64,
    payment_mandate_id: Option<String>,
    attempt: u32,
}

impl BudgetedToolClient {
    #[must_use]
    pub fn new(
        transport: Arc<dyn ToolTransport>,
        signer: Arc<dyn Signer>,
        store: Arc<dyn CommandStore>,
        authority: Arc<MandateAuthority>,
        retry: RetryPolicy,
        network: String,
        chain_id: u64,
    ) -> Self {
        Self {
            transport,
            signer,
            store,
            authority,
            retry,
            parser: PaymentChallengeParser,
            network,
            chain_id,
        }
    }

    pub async fn call(
        &self,
        ctx: ToolCallContext<'_>,
        call: &ToolCall,
        budget: CallBudget,
    ) -> Result<PaidToolOutcome, ToolCallError> {
        let trace_id = Uuid::now_v7().to_string();
        let client = self;
        let trace = trace_id.as_str();

        let result = retry_with_backoff(self.retry, ToolCallError::is_retryable, move |attempt| {
            client.attempt_once(ctx, call, budget, trace, attempt)
        })
        .await?;

        let intent = ctx.intent;
        if let Some(payment_mandate_id) = result.payment_mandate_id.as_deref() {
            self.record_spend(ctx, result.cost_units, payment_mandate_id)
                .await?;
        }

        let receipt = build_receipt(ReceiptInput {
            scope: intent.scope.clone(),
            command_id: intent.command_id.clone(),
            kind: ReceiptKind::Tool,
            reason_code: None,
            payload: json!({
                "tool": call.tool,
                "endpoint": call.endpoint,
                "trace_id": trace_id,
                "attempt": result.attempt,
                "initial_status": result.initial_status,
                "payment_attempted": result.payment_attempted,
                "final_status": result.response.status,
                "payment_mandate_id": result.payment_mandate_id,
                "cost_units": result.cost_units,
                "cost": DecimalAmount::format_units(result.cost_units, USDC_DECIMALS),
                "body": result.response.body,
                "timestamp": ctx.now.to_rfc3339(),
            }),
            created_at: ctx.now,
        })
        .map_err(|error| ToolCallError::Receipt(error.to_string()))?;
        self.store.append_receipt(receipt.clone()).await?;

        tracing::info!(
            scope = %intent.scope,
            command_id = %intent.command_id,
            tool = %call.tool,
            cost_units = result.cost_units,
            payment_attempted = result.payment_attempted,
            "paid tool call completed"
        );

        Ok(PaidToolOutcome {
            response: result.response,
            receipt,
            cost_units: result.cost_units,
        })
    }

    async fn attempt_once(
        &self,
        ctx: ToolCallContext<'_>,
        call: &ToolCall,
        budget: CallBudget,
        trace_id: &str,
        attempt: u32,
    ) -> Result<AttemptResult, ToolCallError> {
        let mut headers = BTreeMap::from([(TRACE_HEADER.to_string(), trace_id.to_string())]);
        let initial = self.post(call, &headers).await?;
        let initial_status = initial.status;

        if initial_status != STATUS_PAYMENT_REQUIRED {
            let response = classify(call, initial)?;
            return Ok(AttemptResult {
                response,
                initial_status,
                payment_attempted: false,
                cost_units: 0,
                payment_mandate_id: None,
                attempt,
            });
        }

        let challenge = self
            .parser
            .parse_challenge(
                initial.status,
                initial.header("WWW-Authenticate"),
                &initial.body,
            )
            .ok_or_else(|| ToolCallError::InvalidChallenge {
                tool: call.tool.clone(),
                reason: "unparseable 402 response".to_string(),
            })?;
        let required_units = challenge
            .amount_units
            .unwrap_or(call.expected_price_units);

        if required_units > budget.remaining_units {
            tracing::warn!(
                tool = %call.tool,
                required_units,
                remaining_units = budget.remaining_units,
                "payment challenge exceeds remaining budget"
            );
            return Err(ToolCallError::BudgetExceeded {
                tool: call.tool.clone(),
                required_units,
                remaining_units: budget.remaining_units,
            });
        }

        let mandate =
            self.authority
                .build_payment_mandate(ctx.intent, &call.tool, required_units, ctx.now);
        self.store.put_payment_mandate(mandate.clone()).await?;

        let header = self
            .payment_header(call, &challenge, required_units, &mandate.payment_mandate_id, ctx.now)
            .await?;
        headers.insert(PAYMENT_HEADER.to_string(), header);

        let paid = match self.post(call, &headers).await {
            Ok(paid) => paid,
            Err(error) => {
                return Err(self
                    .paid_call_failed(ctx, call, required_units, &mandate.payment_mandate_id, error)
                    .await);
            }
        };
        if paid.status == STATUS_PAYMENT_REQUIRED {
            return Err(ToolCallError::PaymentRejected {
                tool: call.tool.clone(),
            });
        }
        let response = match classify(call, paid) {
            Ok(response) => response,
            Err(error) => {
                return Err(self
                    .paid_call_failed(ctx, call, required_units, &mandate.payment_mandate_id, error)
                    .await);
            }
        };

        Ok(AttemptResult {
            response,
            initial_status,
            payment_attempted: true,
            cost_units: required_units,
            payment_mandate_id: Some(mandate.payment_mandate_id),
            attempt,
        })
    }

    async fn record_spend(
        &self,
        ctx: ToolCallContext<'_>,
        amount_units: u64,
        payment_mandate_id: &str,
    ) -> Result<(), StoreError> {
        self.store
            .append_ledger(LedgerEntry {
                scope: ctx.intent.scope.clone(),
                command_id: ctx.intent.command_id.clone(),
                category: LEDGER_CATEGORY_TOOL.to_string(),
                amount_units,
                reference_kind: LEDGER_REFERENCE_PAYMENT_MANDATE.to_string(),
                reference_id: payment_mandate_id.to_string(),
                created_at: ctx.now,
            })
            .await
    }

    /// The signed authorization is out of our hands once sent, so it is booked before failing.
    async fn paid_call_failed(
        &self,
        ctx: ToolCallContext<'_>,
        call: &ToolCall,
        amount_units: u64,
        payment_mandate_id: &str,
        cause: ToolCallError,
    ) -> ToolCallError {
        tracing::warn!(
            scope = %ctx.intent.scope,
            command_id = %ctx.intent.command_id,
            tool = %call.tool,
            payment_mandate_id,
            amount_units,
            error = %cause,
            "paid call failed after payment was sent"
        );
        if let Err(error) = self.record_spend(ctx, amount_units, payment_mandate_id).await {
            return ToolCallError::Store(error);
        }
        ToolCallError::PaidCallFailed {
            tool: call.tool.clone(),
            payment_mandate_id: payment_mandate_id.to_string(),
            reason: cause.to_string(),
        }
    }

    async fn post(
        &self,
        call: &ToolCall,
        headers: &BTreeMap<String, String>,
    ) -> Result<HttpResponse, ToolCallError> {
        self.transport
            .post(&call.endpoint, &call.body, headers)
            .await
            .map_err(|source| ToolCallError::Transport {
                tool: call.tool.clone(),
                source,
            })
    }

    async fn payment_header(
        &self,
        call: &ToolCall,
        challenge: &PaymentChallenge,
        required_units: u64,
        payment_mandate_id: &str,
        now: DateTime<Utc>,
    ) -> Result<String, ToolCallError> {
        let pay_to = challenge
            .pay_to
            .clone()
            .ok_or_else(|| ToolCallError::InvalidChallenge {
                tool: call.tool.clone(),
                reason: "challenge does not name a payee".to_string(),
            })?;
        let authorization = PaymentAuthorization {
            from: self.signer.address(),
            to: pay_to,
            value: required_units.to_string(),
            valid_after: "0".to_string(),
            valid_before: (now + Duration::seconds(AUTHORIZATION_VALIDITY_SECONDS))
                .timestamp()
                .to_string(),
            nonce: format!(
                "0x{}",
                hex::encode(Sha256::digest(payment_mandate_id.as_bytes()))
            ),
        };

        let typed_data = self.authorization_typed_data(challenge, &authorization);
        let signature = self
            .signer
            .sign_typed_data(&typed_data)
            .await
            .map_err(|error| ToolCallError::Signing(error.to_string()))?;

        PaymentPayload {
            x402_version: X402_VERSION,
            scheme: challenge.scheme.clone(),
            network: challenge
                .network
                .clone()
                .unwrap_or_else(|| self.network.clone()),
            payload: ExactPaymentPayload {
                signature,
                authorization,
            },
        }
        .encode_header()
        .map_err(|error| ToolCallError::Signing(error.to_string()))
    }

    fn authorization_typed_data(
        &self,
        challenge: &PaymentChallenge,
        authorization: &PaymentAuthorization,
    ) -> TypedData {
        let contract = challenge
            .asset
            .clone()
            .filter(|asset| asset.starts_with("0x") && asset.len() == 42);
        let domain = match (&challenge.asset_name, &challenge.asset_version, contract) {
            (Some(name), Some(version), Some(contract)) => TypedDataDomain {
                name: name.clone(),
                version: version.clone(),
                chain_id: self.chain_id,
                verifying_contract: Some(contract),
            },
            (_, _, contract) => TypedDataDomain {
                verifying_contract: contract,
                ..TypedDataDomain::paycmd(self.chain_id)
            },
        };

        TypedData {
            domain,
            primary_type: "TransferWithAuthorization".to_string(),
            fields: vec![
                TypedDataField::new("from", "address"),
                TypedDataField::new("to", "address"),
                TypedDataField::new("value", "uint256"),
                TypedDataField::new("validAfter", "uint256"),
                TypedDataField::new("validBefore", "uint256"),
                TypedDataField::new("nonce", "bytes32"),
            ],
            message: BTreeMap::from([
                ("from".to_string(), Value::String(authorization.from.clone())),
                ("to".to_string(), Value::String(authorization.to.clone())),
                ("value".to_string(), Value::String(authorization.value.clone())),
                (
                    "validAfter".to_string(),
                    Value::String(authorization.valid_after.clone()),
                ),
                (
                    "validBefore".to_string(),
                    Value::String(authorization.valid_before.clone()),
                ),
                ("nonce".to_string(), Value::String(authorization.nonce.clone())),
            ]),
        }
    }
}

fn classify(call: &ToolCall, response: HttpResponse) -> Result<HttpResponse, ToolCallError> {
    if (200..300).contains(&response.status) {
        return Ok(response);
    }
    Err(ToolCallError::Upstream {
        tool: call.tool.clone(),
        status: response.status,
    })
}
