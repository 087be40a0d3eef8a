use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::types::{Receipt, ReceiptKind};

pub const RECEIPT_SCHEMA_V1: &str = "paycmd.receipt.v1";
const RECEIPT_ID_PREFIX: &str = "rcpt_";
const RECEIPT_ID_HEX_LEN: usize = 24;

#[derive(Debug, thiserror::Error)]
pub enum ReceiptError {
    #[error("hash error: {0}")]
    Hash(String),
}

#[derive(Debug, Clone)]
pub struct ReceiptInput {
    pub scope: String,
    pub command_id: String,
    pub kind: ReceiptKind,
    pub reason_code: Option<String>,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

/// JSON with object keys sorted at every depth, so hashes do not depend on insertion order.
pub fn canonical_json(value: &impl Serialize) -> Result<String, ReceiptError> {
    let value = serde_json::to_value(value).map_err(|error| ReceiptError::Hash(error.to_string()))?;
    serde_json::to_string(&sorted(value)).map_err(|error| ReceiptError::Hash(error.to_string()))
}

pub fn canonical_sha256(value: &impl Serialize) -> Result<String, ReceiptError> {
    let canonical = canonical_json(value)?;
    Ok(hex::encode(Sha256::digest(canonical.as_bytes())))
}

pub fn build_receipt(input: ReceiptInput) -> Result<Receipt, ReceiptError> {
    #[derive(Serialize)]
    struct HashInput<'a> {
        schema: &'a str,
        scope: &'a str,
        command_id: &'a str,
        kind: &'a str,
        reason_code: Option<&'a str>,
        payload: &'a Value,
        created_at: &'a DateTime<Utc>,
    }

    let canonical_json_sha256 = canonical_sha256(&HashInput {
        schema: RECEIPT_SCHEMA_V1,
        scope: input.scope.as_str(),
        command_id: input.command_id.as_str(),
        kind: input.kind.as_str(),
        reason_code: input.reason_code.as_deref(),
        payload: &input.payload,
        created_at: &input.created_at,
    })?;
    let receipt_id = format!(
        "{RECEIPT_ID_PREFIX}{}",
        &canonical_json_sha256[..RECEIPT_ID_HEX_LEN]
    );

    Ok(Receipt {
        receipt_id,
        scope: input.scope,
        command_id: input.command_id,
        kind: input.kind,
        reason_code: input.reason_code,
        payload: input.payload,
        created_at: input.created_at,
        canonical_json_sha256,
    })
}

fn sorted(value: Value) -> Value {
    match value {
        Value::Object(object) => {
            let mut entries: Vec<(String, Value)> = object.into_iter().collect();
            entries.sort_by(|left, right| left.0.cmp(&right.0));
            let mut ordered = Map::new();
            for (key, value) in entries {
                ordered.insert(key, sorted(value));
            }
            Value::Object(ordered)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sorted).collect()),
        other => other,
    }
}
