//! Rust-native x402 primitives used by paycmd paid tool calls.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// HTTP status used by paid endpoints to demand a payment artifact.
pub const STATUS_PAYMENT_REQUIRED: u16 = 402;
/// Request header carrying the base64 payment payload.
pub const PAYMENT_HEADER: &str = "X-PAYMENT";
/// Response header carrying the settlement response of a paid call.
pub const PAYMENT_RESPONSE_HEADER: &str = "X-PAYMENT-RESPONSE";
/// Decimal places of the settlement asset (USDC).
pub const USDC_DECIMALS: u32 = 6;
/// Protocol version written into payment payloads.
pub const X402_VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum X402Error {
    #[error("encode error: {0}")]
    Encode(String),
    #[error("decode error: {0}")]
    Decode(String),
}

/// Parsed payment challenge from a 402 response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentChallenge {
    /// Payment scheme, `exact` unless the endpoint says otherwise.
    pub scheme: String,
    /// Settlement network name when advertised.
    pub network: Option<String>,
    /// Asset symbol or contract when advertised.
    pub asset: Option<String>,
    /// Recipient of the payment when advertised.
    pub pay_to: Option<String>,
    /// Quoted price in asset units. `None` when the challenge carries no price.
    pub amount_units: Option<u64>,
    /// Resource the payment unlocks.
    pub resource: Option<String>,
    /// EIP-712 domain name of the asset contract, from `extra.name`.
    pub asset_name: Option<String>,
    /// EIP-712 domain version of the asset contract, from `extra.version`.
    pub asset_version: Option<String>,
}

/// Parser for x402 payment challenges.
///
/// Accepts the JSON body form (`{"accepts":[{"maxAmountRequired":"250000",...}]}`), a
/// plain `{"price":"$0.25"}` body, or a `WWW-Authenticate: x402 price="0.25"` header.
#[derive(Debug, Default, Clone, Copy)]
pub struct PaymentChallengeParser;

impl PaymentChallengeParser {
    /// Parse a challenge from a response status, its `WWW-Authenticate` header and body.
    ///
    /// Returns `None` when the status is not 402.
    #[must_use]
    pub fn parse_challenge(
        &self,
        status: u16,
        www_authenticate: Option<&str>,
        body: &Value,
    ) -> Option<PaymentChallenge> {
        if status != STATUS_PAYMENT_REQUIRED {
            return None;
        }

        if let Some(challenge) = parse_accepts_body(body) {
            return Some(challenge);
        }

        if let Some(price) = body.get("price").and_then(price_value_units) {
            return Some(PaymentChallenge {
                scheme: "exact".to_string(),
                network: body.get("network").and_then(Value::as_str).map(str::to_string),
                asset: body.get("asset").and_then(Value::as_str).map(str::to_string),
                pay_to: body.get("payTo").and_then(Value::as_str).map(str::to_string),
                amount_units: Some(price),
                resource: None,
                asset_name: None,
                asset_version: None,
            });
        }

        if let Some(challenge) = self.parse_header(www_authenticate) {
            return Some(challenge);
        }

        // A 402 without a machine-readable price still demands payment.
        Some(PaymentChallenge {
            scheme: "exact".to_string(),
            network: None,
            asset: None,
            pay_to: None,
            amount_units: None,
            resource: None,
            asset_name: None,
            asset_version: None,
        })
    }

    /// Parse an x402 challenge from a header value.
    ///
    /// Returns `None` when the header does not include an `x402 price="..."` challenge.
    #[must_use]
    pub fn parse_header(&self, header: Option<&str>) -> Option<PaymentChallenge> {
        let raw = header?.trim();
        if raw.is_empty() {
            return None;
        }

        let lowered = raw.to_ascii_lowercase();
        let pos = lowered.find("x402")?;
        let after = &raw[pos + 4..];

        let mut price: Option<u64> = None;
        let mut pay_to: Option<String> = None;
        let mut asset: Option<String> = None;
        let mut network: Option<String> = None;

        for part in after.split(',') {
            let segment = part.trim();
            if segment.is_empty() {
                continue;
            }

            let Some((key_raw, value_raw)) = segment.split_once('=') else {
                continue;
            };
            let key = key_raw.trim().to_ascii_lowercase();
            if key.is_empty() {
                continue;
            }

            let value = parse_quoted_value(value_raw.trim())?;
            if value.is_empty() {
                continue;
            }

            match key.as_str() {
                "price" => price = DecimalAmount::parse_units(value.as_str(), USDC_DECIMALS),
                "pay_to" | "payto" => pay_to = Some(value),
                "asset" => asset = Some(value),
                "network" => network = Some(value),
                _ => {}
            }
        }

        let price = price?;

        Some(PaymentChallenge {
            scheme: "exact".to_string(),
            network,
            asset,
            pay_to,
            amount_units: Some(price),
            resource: None,
            asset_name: None,
            asset_version: None,
        })
    }
}

/// Fixed-point decimal amount parsing used for price and spend enforcement.
#[derive(Debug, Clone, Copy)]
pub struct DecimalAmount;

impl DecimalAmount {
    /// Parse a decimal string (`"0.25"`, `"$2"`, `"200"`) into integer units.
    ///
    /// Returns `None` for empty or negative values, more fractional digits than
    /// `decimals`, stray characters, or 64-bit overflow.
    #[must_use]
    pub fn parse_units(raw: &str, decimals: u32) -> Option<u64> {
        let trimmed = raw.trim();
        let trimmed = trimmed.strip_prefix('$').unwrap_or(trimmed);
        if trimmed.is_empty() {
            return None;
        }

        let (whole, fraction) = match trimmed.split_once('.') {
            Some((whole, fraction)) => (whole, fraction),
            None => (trimmed, ""),
        };
        if whole.is_empty() && fraction.is_empty() {
            return None;
        }
        if !whole.bytes().all(|byte| byte.is_ascii_digit())
            || !fraction.bytes().all(|byte| byte.is_ascii_digit())
        {
            return None;
        }
        if fraction.len() > decimals as usize {
            return None;
        }

        let scale = 10_u64.checked_pow(decimals)?;
        let whole_units = if whole.is_empty() {
            0
        } else {
            whole.parse::<u64>().ok()?.checked_mul(scale)?
        };

        let fraction_units = if fraction.is_empty() {
            0
        } else {
            let padding = decimals - fraction.len() as u32;
            fraction
                .parse::<u64>()
                .ok()?
                .checked_mul(10_u64.checked_pow(padding)?)?
        };

        whole_units.checked_add(fraction_units)
    }

    /// Render integer units as a trimmed decimal string.
    #[must_use]
    pub fn format_units(units: u64, decimals: u32) -> String {
        let Some(scale) = 10_u64.checked_pow(decimals) else {
            return units.to_string();
        };
        let whole = units / scale;
        let fraction = units % scale;
        if fraction == 0 {
            return whole.to_string();
        }
        let padded = format!("{fraction:0width$}", width = decimals as usize);
        format!("{whole}.{}", padded.trim_end_matches('0'))
    }
}

/// Transfer authorization signed by the payer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentAuthorization {
    pub from: String,
    pub to: String,
    pub value: String,
    pub valid_after: String,
    pub valid_before: String,
    pub nonce: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExactPaymentPayload {
    pub signature: String,
    pub authorization: PaymentAuthorization,
}

/// Payment artifact attached to the retried request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentPayload {
    pub x402_version: u32,
    pub scheme: String,
    pub network: String,
    pub payload: ExactPaymentPayload,
}

impl PaymentPayload {
    /// Encode as the base64 JSON value of the `X-PAYMENT` header.
    pub fn encode_header(&self) -> Result<String, X402Error> {
        let json =
            serde_json::to_vec(self).map_err(|error| X402Error::Encode(error.to_string()))?;
        Ok(STANDARD.encode(json))
    }

    /// Decode an `X-PAYMENT` header value.
    pub fn decode_header(value: &str) -> Result<Self, X402Error> {
        let bytes = STANDARD
            .decode(value.trim())
            .map_err(|error| X402Error::Decode(error.to_string()))?;
        serde_json::from_slice(&bytes).map_err(|error| X402Error::Decode(error.to_string()))
    }
}

fn parse_accepts_body(body: &Value) -> Option<PaymentChallenge> {
    let first = body.get("accepts")?.as_array()?.first()?;
    let amount_units = first
        .get("maxAmountRequired")
        .and_then(|value| match value {
            Value::String(raw) => raw.trim().parse::<u64>().ok(),
            Value::Number(number) => number.as_u64(),
            _ => None,
        });

    Some(PaymentChallenge {
        scheme: first
            .get("scheme")
            .and_then(Value::as_str)
            .unwrap_or("exact")
            .to_string(),
        network: first.get("network").and_then(Value::as_str).map(str::to_string),
        asset: first.get("asset").and_then(Value::as_str).map(str::to_string),
        pay_to: first.get("payTo").and_then(Value::as_str).map(str::to_string),
        amount_units,
        resource: first.get("resource").and_then(Value::as_str).map(str::to_string),
        asset_name: extra_str(first, "name"),
        asset_version: extra_str(first, "version"),
    })
}

fn extra_str(requirement: &Value, key: &str) -> Option<String> {
    requirement
        .get("extra")?
        .get(key)?
        .as_str()
        .map(str::to_string)
}

fn price_value_units(value: &Value) -> Option<u64> {
    match value {
        Value::String(raw) => DecimalAmount::parse_units(raw, USDC_DECIMALS),
        Value::Number(number) => {
            DecimalAmount::parse_units(number.to_string().as_str(), USDC_DECIMALS)
        }
        _ => None,
    }
}

fn parse_quoted_value(raw: &str) -> Option<String> {
    if raw.len() < 2 {
        return None;
    }
    if !raw.starts_with('"') || !raw.ends_with('"') {
        return None;
    }

    Some(raw[1..raw.len() - 1].to_string())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{
        DecimalAmount, ExactPaymentPayload, PaymentAuthorization, PaymentChallengeParser,
        PaymentPayload, USDC_DECIMALS,
    };

    #[test]
    fn challenge_parser_reads_accepts_body() {
        let parser = PaymentChallengeParser;
        let body = json!({
            "x402Version": 1,
            "accepts": [{
                "scheme": "exact",
                "network": "base-sepolia",
                "maxAmountRequired": "250000",
                "payTo": "0x1111111111111111111111111111111111111111",
                "asset": "USDC",
                "resource": "https://tools.test/risk"
            }]
        });

        let challenge = parser.parse_challenge(402, None, &body);
        let challenge = if let Some(value) = challenge {
            value
        } else {
            assert!(false, "missing challenge");
            return;
        };
        assert_eq!(challenge.amount_units, Some(250_000));
        assert_eq!(challenge.network.as_deref(), Some("base-sepolia"));
        assert_eq!(challenge.resource.as_deref(), Some("https://tools.test/risk"));
        assert_eq!(challenge.asset_name, None);
    }

    #[test]
    fn challenge_parser_reads_asset_domain_from_extra() {
        let parser = PaymentChallengeParser;
        let body = json!({
            "accepts": [{
                "scheme": "exact",
                "network": "base-sepolia",
                "maxAmountRequired": "10000",
                "payTo": "0x1111111111111111111111111111111111111111",
                "asset": "0x036CbD53842c5426634e7929541eC2318f3dCF7e",
                "extra": { "name": "USDC", "version": "2" }
            }]
        });

        let challenge = parser.parse_challenge(402, None, &body);
        let challenge = if let Some(value) = challenge {
            value
        } else {
            assert!(false, "missing challenge");
            return;
        };
        assert_eq!(challenge.asset_name.as_deref(), Some("USDC"));
        assert_eq!(challenge.asset_version.as_deref(), Some("2"));
        assert_eq!(
            challenge.asset.as_deref(),
            Some("0x036CbD53842c5426634e7929541eC2318f3dCF7e")
        );
    }

    #[test]
    fn challenge_parser_reads_price_body_and_header() {
        let parser = PaymentChallengeParser;

        let from_body = parser.parse_challenge(402, None, &json!({ "price": "$0.50" }));
        assert_eq!(from_body.and_then(|value| value.amount_units), Some(500_000));

        let from_header = parser.parse_challenge(
            402,
            Some("Bearer realm=\"x\", x402 price=\"0.25\", pay_to=\"0xabc\""),
            &json!({}),
        );
        let from_header = if let Some(value) = from_header {
            value
        } else {
            assert!(false, "missing header challenge");
            return;
        };
        assert_eq!(from_header.amount_units, Some(250_000));
        assert_eq!(from_header.pay_to.as_deref(), Some("0xabc"));
    }

    #[test]
    fn challenge_parser_ignores_non_402_and_keeps_priceless_402() {
        let parser = PaymentChallengeParser;
        assert!(parser.parse_challenge(200, None, &json!({})).is_none());
        assert!(parser.parse_challenge(500, None, &json!({"price": "1"})).is_none());

        let priceless = parser.parse_challenge(402, None, &json!({"error": "pay"}));
        assert!(priceless.is_some());
        assert_eq!(priceless.and_then(|value| value.amount_units), None);
    }

    #[test]
    fn header_parser_rejects_empty_or_invalid_values() {
        let parser = PaymentChallengeParser;
        assert!(parser.parse_header(None).is_none());
        assert!(parser.parse_header(Some("")).is_none());
        assert!(parser.parse_header(Some("Bearer realm=\"x\"")).is_none());
        assert!(parser.parse_header(Some("x402 price=0.25")).is_none());
        assert!(parser.parse_header(Some("x402 asset=\"USDC\"")).is_none());
    }

    #[test]
    fn decimal_amount_parses_common_forms() {
        assert_eq!(DecimalAmount::parse_units("200", USDC_DECIMALS), Some(200_000_000));
        assert_eq!(DecimalAmount::parse_units("0.25", USDC_DECIMALS), Some(250_000));
        assert_eq!(DecimalAmount::parse_units("$2", USDC_DECIMALS), Some(2_000_000));
        assert_eq!(DecimalAmount::parse_units(".5", USDC_DECIMALS), Some(500_000));
        assert_eq!(DecimalAmount::parse_units("1.000001", USDC_DECIMALS), Some(1_000_001));
    }

    #[test]
    fn decimal_amount_rejects_invalid_forms() {
        assert_eq!(DecimalAmount::parse_units("", USDC_DECIMALS), None);
        assert_eq!(DecimalAmount::parse_units("-1", USDC_DECIMALS), None);
        assert_eq!(DecimalAmount::parse_units("1.0000001", USDC_DECIMALS), None);
        assert_eq!(DecimalAmount::parse_units("1e3", USDC_DECIMALS), None);
        assert_eq!(DecimalAmount::parse_units(".", USDC_DECIMALS), None);
        assert_eq!(
            DecimalAmount::parse_units("99999999999999999999", USDC_DECIMALS),
            None
        );
    }

    #[test]
    fn decimal_amount_formats_trimmed() {
        assert_eq!(DecimalAmount::format_units(750_000, USDC_DECIMALS), "0.75");
        assert_eq!(DecimalAmount::format_units(2_000_000, USDC_DECIMALS), "2");
        assert_eq!(DecimalAmount::format_units(1_000_001, USDC_DECIMALS), "1.000001");
    }

    #[test]
    fn payment_header_decodes_what_it_encodes() -> Result<(), Box<dyn std::error::Error>> {
        let payload = PaymentPayload {
            x402_version: 1,
            scheme: "exact".to_string(),
            network: "base-sepolia".to_string(),
            payload: ExactPaymentPayload {
                signature: "0xsig".to_string(),
                authorization: PaymentAuthorization {
                    from: "0xfrom".to_string(),
                    to: "0xto".to_string(),
                    value: "250000".to_string(),
                    valid_after: "0".to_string(),
                    valid_before: "1700000300".to_string(),
                    nonce: "0x01".to_string(),
                },
            },
        };

        let header = payload.encode_header()?;
        assert!(!header.contains('{'));
        let decoded = PaymentPayload::decode_header(header.as_str())?;
        assert_eq!(decoded, payload);
        assert!(PaymentPayload::decode_header("not base64!").is_err());
        Ok(())
    }
}
