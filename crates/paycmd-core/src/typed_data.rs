//! EIP-712 structured data hashing plus secp256k1 signing and address recovery.
//!
//! Only flat structs with atomic member types are supported (`string`, `bytes`, `bytes32`,
//! `address`, `bool`, `uint8`..`uint256`), which covers cart mandates and payment
//! authorizations.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k256::ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha3::{Digest, Keccak256};

use crate::capabilities::{CapabilityError, Signer};

pub const DOMAIN_NAME: &str = "paycmd";
pub const DOMAIN_VERSION: &str = "1";

const SIGNATURE_LEN: usize = 65;
const ADDRESS_LEN: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TypedDataError {
    #[error("missing value for field {0}")]
    MissingField(String),
    #[error("invalid value for field {field}: {reason}")]
    InvalidValue { field: String, reason: String },
    #[error("unsupported type {0}")]
    UnsupportedType(String),
    #[error("invalid signature: {0}")]
    InvalidSignature(String),
    #[error("invalid key: {0}")]
    InvalidKey(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypedDataDomain {
    pub name: String,
    pub version: String,
    pub chain_id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verifying_contract: Option<String>,
}

impl TypedDataDomain {
    #[must_use]
    pub fn paycmd(chain_id: u64) -> Self {
        Self {
            name: DOMAIN_NAME.to_string(),
            version: DOMAIN_VERSION.to_string(),
            chain_id,
            verifying_contract: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypedDataField {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
}

impl TypedDataField {
    #[must_use]
    pub fn new(name: &str, type_name: &str) -> Self {
        Self {
            name: name.to_string(),
            type_name: type_name.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypedData {
    pub domain: TypedDataDomain,
    pub primary_type: String,
    pub fields: Vec<TypedDataField>,
    pub message: BTreeMap<String, Value>,
}

impl TypedData {
    /// `keccak256(0x19 0x01 || domainSeparator || hashStruct(message))`.
    pub fn signing_digest(&self) -> Result<[u8; 32], TypedDataError> {
        let domain_separator = self.domain_separator()?;
        let struct_hash = hash_struct(&self.primary_type, &self.fields, &self.message)?;

        let mut hasher = Keccak256::new();
        hasher.update([0x19, 0x01]);
        hasher.update(domain_separator);
        hasher.update(struct_hash);
        Ok(hasher.finalize().into())
    }

    pub fn domain_separator(&self) -> Result<[u8; 32], TypedDataError> {
        let mut fields = vec![
            TypedDataField::new("name", "string"),
            TypedDataField::new("version", "string"),
            TypedDataField::new("chainId", "uint256"),
        ];
        let mut values = BTreeMap::from([
            ("name".to_string(), Value::String(self.domain.name.clone())),
            ("version".to_string(), Value::String(self.domain.version.clone())),
            ("chainId".to_string(), Value::from(self.domain.chain_id)),
        ]);
        if let Some(contract) = self.domain.verifying_contract.as_ref() {
            fields.push(TypedDataField::new("verifyingContract", "address"));
            values.insert("verifyingContract".to_string(), Value::String(contract.clone()));
        }
        hash_struct("EIP712Domain", &fields, &values)
    }
}

/// `Name(type1 name1,type2 name2,...)`.
#[must_use]
pub fn encode_type(primary_type: &str, fields: &[TypedDataField]) -> String {
    let members = fields
        .iter()
        .map(|field| format!("{} {}", field.type_name, field.name))
        .collect::<Vec<_>>()
        .join(",");
    format!("{primary_type}({members})")
}

fn hash_struct(
    primary_type: &str,
    fields: &[TypedDataField],
    values: &BTreeMap<String, Value>,
) -> Result<[u8; 32], TypedDataError> {
    let mut hasher = Keccak256::new();
    hasher.update(keccak(encode_type(primary_type, fields).as_bytes()));
    for field in fields {
        let value = values
            .get(&field.name)
            .ok_or_else(|| TypedDataError::MissingField(field.name.clone()))?;
        hasher.update(encode_value(field, value)?);
    }
    Ok(hasher.finalize().into())
}

fn encode_value(field: &TypedDataField, value: &Value) -> Result<[u8; 32], TypedDataError> {
    let invalid = |reason: &str| TypedDataError::InvalidValue {
        field: field.name.clone(),
        reason: reason.to_string(),
    };
    let type_name = field.type_name.as_str();

    match type_name {
        "string" => {
            let raw = value.as_str().ok_or_else(|| invalid("expected string"))?;
            Ok(keccak(raw.as_bytes()))
        }
        "bytes" => {
            let raw = value.as_str().ok_or_else(|| invalid("expected hex string"))?;
            let bytes = decode_hex(raw).map_err(|reason| invalid(reason.as_str()))?;
            Ok(keccak(&bytes))
        }
        "bytes32" => {
            let raw = value.as_str().ok_or_else(|| invalid("expected hex string"))?;
            let bytes = decode_hex(raw).map_err(|reason| invalid(reason.as_str()))?;
            bytes
                .try_into()
                .map_err(|_| invalid("expected 32 bytes"))
        }
        "address" => {
            let raw = value.as_str().ok_or_else(|| invalid("expected address"))?;
            let bytes = decode_hex(raw).map_err(|reason| invalid(reason.as_str()))?;
            if bytes.len() != ADDRESS_LEN {
                return Err(invalid("expected 20 bytes"));
            }
            let mut word = [0_u8; 32];
            word[32 - ADDRESS_LEN..].copy_from_slice(&bytes);
            Ok(word)
        }
        "bool" => {
            let flag = value.as_bool().ok_or_else(|| invalid("expected bool"))?;
            let mut word = [0_u8; 32];
            word[31] = u8::from(flag);
            Ok(word)
        }
        _ if type_name.starts_with("uint") => {
            let number = match value {
                Value::Number(number) => number
                    .as_u64()
                    .map(u128::from)
                    .ok_or_else(|| invalid("expected unsigned integer"))?,
                Value::String(raw) => raw
                    .trim()
                    .parse::<u128>()
                    .map_err(|_| invalid("expected unsigned integer"))?,
                _ => return Err(invalid("expected unsigned integer")),
            };
            let mut word = [0_u8; 32];
            word[16..].copy_from_slice(&number.to_be_bytes());
            Ok(word)
        }
        other => Err(TypedDataError::UnsupportedType(other.to_string())),
    }
}

fn keccak(bytes: &[u8]) -> [u8; 32] {
    Keccak256::digest(bytes).into()
}

fn decode_hex(raw: &str) -> Result<Vec<u8>, String> {
    let trimmed = raw.trim();
    let stripped = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    hex::decode(stripped).map_err(|error| error.to_string())
}

/// Lower-case 0x address derived from an uncompressed public key.
#[must_use]
pub fn address_from_key(key: &VerifyingKey) -> String {
    let point = key.to_encoded_point(false);
    let digest = keccak(&point.as_bytes()[1..]);
    format!("0x{}", hex::encode(&digest[32 - ADDRESS_LEN..]))
}

/// Recover the signer address from a digest and a 65-byte `r || s || v` signature.
///
/// `v` may be `27`/`28` or `0`/`1`.
pub fn recover_address(digest: &[u8; 32], signature_hex: &str) -> Result<String, TypedDataError> {
    let bytes = decode_hex(signature_hex).map_err(TypedDataError::InvalidSignature)?;
    if bytes.len() != SIGNATURE_LEN {
        return Err(TypedDataError::InvalidSignature(format!(
            "expected {SIGNATURE_LEN} bytes, got {}",
            bytes.len()
        )));
    }

    let signature = Signature::from_slice(&bytes[..64])
        .map_err(|error| TypedDataError::InvalidSignature(error.to_string()))?;
    let v = bytes[64];
    let recovery_byte = if v >= 27 { v - 27 } else { v };
    let recovery_id = RecoveryId::from_byte(recovery_byte)
        .ok_or_else(|| TypedDataError::InvalidSignature(format!("invalid recovery byte {v}")))?;

    let key = VerifyingKey::recover_from_prehash(digest, &signature, recovery_id)
        .map_err(|error| TypedDataError::InvalidSignature(error.to_string()))?;
    Ok(address_from_key(&key))
}

/// In-process secp256k1 key. Used by the runner and tests; production wallets sign elsewhere.
pub struct LocalKeySigner {
    key: SigningKey,
    address: String,
}

impl LocalKeySigner {
    pub fn from_bytes(secret: &[u8]) -> Result<Self, TypedDataError> {
        let key = SigningKey::from_slice(secret)
            .map_err(|error| TypedDataError::InvalidKey(error.to_string()))?;
        let address = address_from_key(key.verifying_key());
        Ok(Self { key, address })
    }

    pub fn from_hex(secret_hex: &str) -> Result<Self, TypedDataError> {
        let bytes = decode_hex(secret_hex).map_err(TypedDataError::InvalidKey)?;
        Self::from_bytes(&bytes)
    }

    pub fn sign_digest(&self, digest: &[u8; 32]) -> Result<String, TypedDataError> {
        let (signature, recovery_id) = self
            .key
            .sign_prehash_recoverable(digest)
            .map_err(|error| TypedDataError::InvalidSignature(error.to_string()))?;
        let mut bytes = signature.to_bytes().to_vec();
        bytes.push(recovery_id.to_byte() + 27);
        Ok(format!("0x{}", hex::encode(bytes)))
    }
}

impl std::fmt::Debug for LocalKeySigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalKeySigner")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Signer for LocalKeySigner {
    fn address(&self) -> String {
        self.address.clone()
    }

    async fn sign_typed_data(&self, typed_data: &TypedData) -> Result<String, CapabilityError> {
        let digest = typed_data
            .signing_digest()
            .map_err(|error| CapabilityError::Rejected(error.to_string()))?;
        self.sign_digest(&digest)
            .map_err(|error| CapabilityError::Rejected(error.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde_json::{Value, json};

    use super::{
        LocalKeySigner, TypedData, TypedDataDomain, TypedDataError, TypedDataField, encode_type,
        hash_struct, keccak, recover_address,
    };

    // Well-known test vector: private key 1 maps to this address.
    const KEY_ONE: &str = "0x0000000000000000000000000000000000000000000000000000000000000001";
    const KEY_ONE_ADDRESS: &str = "0x7e5f4552091a69125d5dfcb7b8c2659029395bdf";

    fn sample() -> TypedData {
        TypedData {
            domain: TypedDataDomain::paycmd(84_532),
            primary_type: "Mail".to_string(),
            fields: vec![
                TypedDataField::new("to", "address"),
                TypedDataField::new("contents", "string"),
                TypedDataField::new("amount", "uint256"),
            ],
            message: BTreeMap::from([
                (
                    "to".to_string(),
                    json!("0x1111111111111111111111111111111111111111"),
                ),
                ("contents".to_string(), json!("hello")),
                ("amount".to_string(), json!("250000")),
            ]),
        }
    }

    #[test]
    fn encode_type_lists_members_in_order() {
        assert_eq!(
            encode_type("Mail", &sample().fields),
            "Mail(address to,string contents,uint256 amount)"
        );
    }

    #[test]
    fn local_signer_derives_known_address() -> Result<(), TypedDataError> {
        let signer = LocalKeySigner::from_hex(KEY_ONE)?;
        assert_eq!(super::Signer::address(&signer), KEY_ONE_ADDRESS);
        Ok(())
    }

    #[test]
    fn signature_recovers_signer_and_detects_tampering() -> Result<(), Box<dyn std::error::Error>> {
        let signer = LocalKeySigner::from_hex(KEY_ONE)?;
        let typed = sample();
        let digest = typed.signing_digest()?;
        let signature = signer.sign_digest(&digest)?;
        assert_eq!(signature.len(), 2 + 130);
        assert_eq!(recover_address(&digest, &signature)?, KEY_ONE_ADDRESS);

        let mut changed = typed;
        changed
            .message
            .insert("amount".to_string(), Value::from(250_001_u64));
        let changed_digest = changed.signing_digest()?;
        assert_ne!(changed_digest, digest);
        let recovered = recover_address(&changed_digest, &signature);
        assert!(recovered.map_or(true, |address| address != KEY_ONE_ADDRESS));
        Ok(())
    }

    // Vectors from the EIP-712 "Ether Mail" example.
    #[test]
    fn domain_hashing_matches_reference_vectors() -> Result<(), TypedDataError> {
        assert_eq!(
            hex::encode(keccak(
                b"EIP712Domain(string name,string version,uint256 chainId,address verifyingContract)"
            )),
            "8b73c3c69bb8fe3d512ecc4cf759cc79239f7b179b0ffacaa9a75d522b39400f"
        );

        let mail = TypedData {
            domain: TypedDataDomain {
                name: "Ether Mail".to_string(),
                version: "1".to_string(),
                chain_id: 1,
                verifying_contract: Some("0xCcCCccccCCCCcCCCCCCcCcCccCcCCCcCcccccccC".to_string()),
            },
            ..sample()
        };
        assert_eq!(
            hex::encode(mail.domain_separator()?),
            "f2cee375fa42b42143804025fc449deafd50cc031ca257e0b194a650a912090f"
        );
        Ok(())
    }

    #[test]
    fn struct_hash_matches_reference_vector() -> Result<(), TypedDataError> {
        let person = hash_struct(
            "Person",
            &[
                TypedDataField::new("name", "string"),
                TypedDataField::new("wallet", "address"),
            ],
            &BTreeMap::from([
                ("name".to_string(), json!("Cow")),
                (
                    "wallet".to_string(),
                    json!("0xCD2a3d9F938E13CD947Ec05AbC7FE734Df8DD826"),
                ),
            ]),
        )?;
        assert_eq!(
            hex::encode(person),
            "fc71e5fa27ff56c350aa531bc129ebdf613b772b6604664f5d8dbe21b85eb0c8"
        );
        Ok(())
    }

    #[test]
    fn digest_depends_on_chain_id() -> Result<(), TypedDataError> {
        let first = sample();
        let mut second = sample();
        second.domain.chain_id = 1;
        assert_ne!(first.signing_digest()?, second.signing_digest()?);
        Ok(())
    }

    #[test]
    fn missing_or_malformed_values_are_errors() {
        let mut typed = sample();
        typed.message.remove("contents");
        assert_eq!(
            typed.signing_digest(),
            Err(TypedDataError::MissingField("contents".to_string()))
        );

        let mut typed = sample();
        typed.message.insert("to".to_string(), json!("0x1234"));
        assert!(matches!(
            typed.signing_digest(),
            Err(TypedDataError::InvalidValue { .. })
        ));

        assert!(recover_address(&[0_u8; 32], "0xdeadbeef").is_err());
    }
}
