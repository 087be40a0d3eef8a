//! Intent, cart and payment mandates: the authorization trail behind every paid action.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::capabilities::{CapabilityError, Signer};
use crate::typed_data::{TypedData, TypedDataDomain, TypedDataError, TypedDataField, recover_address};
use crate::types::{CartMandate, Command, IntentMandate, MandateStatus, PaymentMandate, PlannedTool};

pub const DEFAULT_MANDATE_WINDOW_SECONDS: i64 = 300;
pub const CART_PRIMARY_TYPE: &str = "CartMandate";

#[derive(Debug, thiserror::Error)]
pub enum MandateError {
    #[error("mandate expired at {0}")]
    Expired(DateTime<Utc>),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("typed data error: {0}")]
    TypedData(#[from] TypedDataError),
    #[error("signer error: {0}")]
    Signer(#[from] CapabilityError),
}

impl MandateError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Expired(_) => "EXPIRED_MANDATE",
            Self::Serialization(_) | Self::TypedData(_) => "MANDATE_ENCODING_FAILED",
            Self::Signer(_) => "SIGNER_FAILED",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verification {
    pub valid: bool,
    pub signer_address: Option<String>,
}

pub struct MandateAuthority {
    signer: Arc<dyn Signer>,
    chain_id: u64,
    window: Duration,
}

impl MandateAuthority {
    #[must_use]
    pub fn new(signer: Arc<dyn Signer>, chain_id: u64, window_seconds: i64) -> Self {
        Self {
            signer,
            chain_id,
            window: Duration::seconds(window_seconds.max(1)),
        }
    }

    #[must_use]
    pub fn signer_address(&self) -> String {
        self.signer.address()
    }

    pub fn build_intent_mandate(
        &self,
        command: &Command,
        tool_plan: Vec<PlannedTool>,
        ceiling_units: u64,
        now: DateTime<Utc>,
    ) -> Result<IntentMandate, MandateError> {
        let serialized = serde_json::to_string(&command.parsed)
            .map_err(|error| MandateError::Serialization(error.to_string()))?;
        let intent_id = prefixed_hash(
            "intent_",
            &[command.scope.as_str(), command.command_id.as_str(), serialized.as_str()],
        );
        Ok(IntentMandate {
            intent_id,
            scope: command.scope.clone(),
            command_id: command.command_id.clone(),
            tool_plan,
            ceiling_units,
            status: MandateStatus::Pending,
            created_at: now,
        })
    }

    /// Unsigned cart. Expiry is anchored to the intent, never to the build time.
    #[must_use]
    pub fn build_cart_mandate(&self, intent: &IntentMandate, now: DateTime<Utc>) -> CartMandate {
        let digest = intent
            .tool_plan
            .iter()
            .map(|tool| format!("{}:{}", tool.name, tool.price_units))
            .collect::<Vec<_>>()
            .join("|");
        let cart_id = prefixed_hash(
            "cart_",
            &[intent.intent_id.as_str(), digest.as_str()],
        );
        CartMandate {
            cart_id,
            intent_id: intent.intent_id.clone(),
            scope: intent.scope.clone(),
            command_id: intent.command_id.clone(),
            digest,
            ceiling_units: intent.ceiling_units,
            expires_at: intent.created_at + self.window,
            signer_address: None,
            signature: None,
            created_at: now,
        }
    }

    #[must_use]
    pub fn cart_typed_data(&self, cart: &CartMandate) -> TypedData {
        TypedData {
            domain: TypedDataDomain::paycmd(self.chain_id),
            primary_type: CART_PRIMARY_TYPE.to_string(),
            fields: vec![
                TypedDataField::new("cartId", "string"),
                TypedDataField::new("intentId", "string"),
                TypedDataField::new("commandId", "string"),
                TypedDataField::new("scope", "string"),
                TypedDataField::new("digest", "string"),
                TypedDataField::new("ceilingUnits", "uint256"),
                TypedDataField::new("expiresAt", "uint256"),
            ],
            message: BTreeMap::from([
                ("cartId".to_string(), Value::String(cart.cart_id.clone())),
                ("intentId".to_string(), Value::String(cart.intent_id.clone())),
                ("commandId".to_string(), Value::String(cart.command_id.clone())),
                ("scope".to_string(), Value::String(cart.scope.clone())),
                ("digest".to_string(), Value::String(cart.digest.clone())),
                ("ceilingUnits".to_string(), Value::from(cart.ceiling_units)),
                (
                    "expiresAt".to_string(),
                    Value::from(u64::try_from(cart.expires_at.timestamp()).unwrap_or(0)),
                ),
            ]),
        }
    }

    /// Returns `(signer_address, signature)`.
    pub async fn request_signature(
        &self,
        cart: &CartMandate,
    ) -> Result<(String, String), MandateError> {
        let typed_data = self.cart_typed_data(cart);
        let signature = self.signer.sign_typed_data(&typed_data).await?;
        Ok((self.signer.address(), signature))
    }

    /// Recovers the signer from the cart digest. Malformed signatures verify as invalid.
    #[must_use]
    pub fn verify(
        &self,
        cart: &CartMandate,
        signature: &str,
        expected_signer: Option<&str>,
    ) -> Verification {
        let recovered = self
            .cart_typed_data(cart)
            .signing_digest()
            .and_then(|digest| recover_address(&digest, signature));

        match recovered {
            Ok(address) => {
                let valid = expected_signer
                    .is_none_or(|expected| expected.eq_ignore_ascii_case(address.as_str()));
                Verification {
                    valid,
                    signer_address: Some(address),
                }
            }
            Err(error) => {
                tracing::debug!(cart_id = %cart.cart_id, error = %error, "signature recovery failed");
                Verification {
                    valid: false,
                    signer_address: None,
                }
            }
        }
    }

    pub fn ensure_not_expired(
        &self,
        cart: &CartMandate,
        now: DateTime<Utc>,
    ) -> Result<(), MandateError> {
        if now >= cart.expires_at {
            return Err(MandateError::Expired(cart.expires_at));
        }
        Ok(())
    }

    #[must_use]
    pub fn build_payment_mandate(
        &self,
        intent: &IntentMandate,
        tool: &str,
        price_units: u64,
        now: DateTime<Utc>,
    ) -> PaymentMandate {
        PaymentMandate {
            payment_mandate_id: format!("pm_{}", Uuid::now_v7().simple()),
            scope: intent.scope.clone(),
            command_id: intent.command_id.clone(),
            intent_id: intent.intent_id.clone(),
            tool: tool.to_string(),
            price_units,
            created_at: now,
        }
    }
}

fn prefixed_hash(prefix: &str, parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0x1f]);
    }
    format!("{prefix}{}", &hex::encode(hasher.finalize())[..32])
}
