use std::collections::BTreeSet;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use paycmd_x402::{DecimalAmount, USDC_DECIMALS};
use thiserror::Error;

use crate::mandates::DEFAULT_MANDATE_WINDOW_SECONDS;
use crate::policy::{DEFAULT_MAX_SLIPPAGE_BPS, PolicyConfig};
use crate::retry::{DEFAULT_BASE_DELAY_MS, DEFAULT_MAX_ATTEMPTS, RetryPolicy};

pub const DEFAULT_CHAIN_ID: u64 = 84_532;
pub const DEFAULT_PAYMENT_NETWORK: &str = "base-sepolia";
const MAX_RETRY_ATTEMPTS: u32 = 10;
const MAX_SLIPPAGE_BPS_CAP: u32 = 10_000;
const MIN_MANDATE_WINDOW_SECONDS: i64 = 30;
const MAX_MANDATE_WINDOW_SECONDS: i64 = 86_400;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {key}: {value:?} is not a decimal amount")]
    InvalidAmount { key: String, value: String },
    #[error("invalid {key}: {reason}")]
    InvalidNumber { key: String, reason: String },
    #[error("invalid PAYCMD_APPROVER_ADDRESS: {0}")]
    InvalidApproverAddress(String),
}

impl ConfigError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidAmount { .. } => "CONFIG_INVALID_AMOUNT",
            Self::InvalidNumber { .. } => "CONFIG_INVALID_NUMBER",
            Self::InvalidApproverAddress(_) => "CONFIG_INVALID_APPROVER",
        }
    }
}

#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    pub policy: PolicyConfig,
    pub mandate_window_seconds: i64,
    pub chain_id: u64,
    /// Expected cart signer. Defaults to the configured signer's own address.
    pub approver_address: Option<String>,
    pub retry: RetryPolicy,
    pub payment_network: String,
    pub tool_catalog_path: Option<PathBuf>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            policy: PolicyConfig::default(),
            mandate_window_seconds: DEFAULT_MANDATE_WINDOW_SECONDS,
            chain_id: DEFAULT_CHAIN_ID,
            approver_address: None,
            retry: RetryPolicy::default(),
            payment_network: DEFAULT_PAYMENT_NETWORK.to_string(),
            tool_catalog_path: None,
        }
    }
}

impl OrchestratorConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = PolicyConfig::default();
        let lookup = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let policy = PolicyConfig {
            tool_allowlist: parse_with_lookup(
                &lookup,
                "PAYCMD_TOOL_ALLOWLIST",
                BTreeSet::new(),
                |raw| Ok(parse_list(raw.as_str())),
            )?,
            default_command_ceiling_units: parse_with_lookup(
                &lookup,
                "PAYCMD_DEFAULT_COMMAND_CEILING",
                defaults.default_command_ceiling_units,
                |raw| parse_amount("PAYCMD_DEFAULT_COMMAND_CEILING", raw),
            )?,
            daily_ceiling_units: parse_with_lookup(
                &lookup,
                "PAYCMD_DAILY_CEILING",
                defaults.daily_ceiling_units,
                |raw| parse_amount("PAYCMD_DAILY_CEILING", raw),
            )?,
            max_slippage_bps: parse_with_lookup(
                &lookup,
                "PAYCMD_MAX_SLIPPAGE_BPS",
                DEFAULT_MAX_SLIPPAGE_BPS,
                |raw| parse_number::<u32>("PAYCMD_MAX_SLIPPAGE_BPS", raw),
            )?
            .min(MAX_SLIPPAGE_BPS_CAP),
            auto_run_ceiling_units: parse_with_lookup(
                &lookup,
                "PAYCMD_AUTO_RUN_CEILING",
                defaults.auto_run_ceiling_units,
                |raw| parse_amount("PAYCMD_AUTO_RUN_CEILING", raw),
            )?,
            approval_threshold_units: parse_with_lookup(
                &lookup,
                "PAYCMD_APPROVAL_THRESHOLD",
                defaults.approval_threshold_units,
                |raw| parse_amount("PAYCMD_APPROVAL_THRESHOLD", raw),
            )?,
        };

        let mandate_window_seconds = parse_with_lookup(
            &lookup,
            "PAYCMD_MANDATE_WINDOW_SECONDS",
            DEFAULT_MANDATE_WINDOW_SECONDS,
            |raw| parse_number::<i64>("PAYCMD_MANDATE_WINDOW_SECONDS", raw),
        )?
        .clamp(MIN_MANDATE_WINDOW_SECONDS, MAX_MANDATE_WINDOW_SECONDS);

        let retry = RetryPolicy {
            max_attempts: parse_with_lookup(
                &lookup,
                "PAYCMD_RETRY_MAX_ATTEMPTS",
                DEFAULT_MAX_ATTEMPTS,
                |raw| parse_number::<u32>("PAYCMD_RETRY_MAX_ATTEMPTS", raw),
            )?
            .clamp(1, MAX_RETRY_ATTEMPTS),
            base_delay: Duration::from_millis(parse_with_lookup(
                &lookup,
                "PAYCMD_RETRY_BASE_DELAY_MS",
                DEFAULT_BASE_DELAY_MS,
                |raw| parse_number::<u64>("PAYCMD_RETRY_BASE_DELAY_MS", raw),
            )?),
        };

        let approver_address = match lookup("PAYCMD_APPROVER_ADDRESS") {
            Some(raw) => Some(parse_address(raw)?),
            None => None,
        };

        Ok(Self {
            policy,
            mandate_window_seconds,
            chain_id: parse_with_lookup(&lookup, "PAYCMD_CHAIN_ID", DEFAULT_CHAIN_ID, |raw| {
                parse_number::<u64>("PAYCMD_CHAIN_ID", raw)
            })?,
            approver_address,
            retry,
            payment_network: lookup("PAYCMD_PAYMENT_NETWORK")
                .unwrap_or_else(|| DEFAULT_PAYMENT_NETWORK.to_string()),
            tool_catalog_path: lookup("PAYCMD_TOOL_CATALOG").map(PathBuf::from),
        })
    }
}

fn parse_with_lookup<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
    parser: impl FnOnce(String) -> Result<T, ConfigError>,
) -> Result<T, ConfigError> {
    match lookup(key) {
        Some(raw) => parser(raw),
        None => Ok(default),
    }
}

fn parse_amount(key: &str, raw: String) -> Result<u64, ConfigError> {
    DecimalAmount::parse_units(raw.as_str(), USDC_DECIMALS).ok_or(ConfigError::InvalidAmount {
        key: key.to_string(),
        value: raw,
    })
}

fn parse_number<T>(key: &str, raw: String) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse::<T>().map_err(|error| ConfigError::InvalidNumber {
        key: key.to_string(),
        reason: error.to_string(),
    })
}

fn parse_list(raw: &str) -> BTreeSet<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToString::to_string)
        .collect()
}

fn parse_address(raw: String) -> Result<String, ConfigError> {
    let valid = raw.len() == 42
        && raw.starts_with("0x")
        && raw[2..].bytes().all(|byte| byte.is_ascii_hexdigit());
    if !valid {
        return Err(ConfigError::InvalidApproverAddress(raw));
    }
    Ok(raw.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use super::{ConfigError, OrchestratorConfig};

    #[test]
    fn defaults_apply_without_env() -> Result<(), ConfigError> {
        let config = OrchestratorConfig::from_lookup(|_| None)?;
        assert_eq!(config.mandate_window_seconds, 300);
        assert_eq!(config.policy.max_slippage_bps, 200);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.base_delay, Duration::from_secs(1));
        assert!(config.policy.tool_allowlist.is_empty());
        assert!(config.approver_address.is_none());
        Ok(())
    }

    #[test]
    fn env_overrides_are_parsed_and_clamped() -> Result<(), ConfigError> {
        let values = HashMap::from([
            ("PAYCMD_DEFAULT_COMMAND_CEILING", "2.5"),
            ("PAYCMD_DAILY_CEILING", "$20"),
            ("PAYCMD_TOOL_ALLOWLIST", "risk, kyb,,news"),
            ("PAYCMD_MANDATE_WINDOW_SECONDS", "5"),
            ("PAYCMD_RETRY_MAX_ATTEMPTS", "99"),
            ("PAYCMD_RETRY_BASE_DELAY_MS", "0"),
            (
                "PAYCMD_APPROVER_ADDRESS",
                "0x7E5F4552091A69125d5DfCb7b8C2659029395Bdf",
            ),
            ("PAYCMD_CHAIN_ID", "1"),
        ]);
        let config =
            OrchestratorConfig::from_lookup(|key| values.get(key).map(ToString::to_string))?;

        assert_eq!(config.policy.default_command_ceiling_units, 2_500_000);
        assert_eq!(config.policy.daily_ceiling_units, 20_000_000);
        assert_eq!(config.policy.tool_allowlist.len(), 3);
        assert_eq!(config.mandate_window_seconds, 30);
        assert_eq!(config.retry.max_attempts, 10);
        assert_eq!(config.retry.base_delay, Duration::ZERO);
        assert_eq!(
            config.approver_address.as_deref(),
            Some("0x7e5f4552091a69125d5dfcb7b8c2659029395bdf")
        );
        assert_eq!(config.chain_id, 1);
        Ok(())
    }

    #[test]
    fn invalid_values_are_rejected() {
        let values = HashMap::from([("PAYCMD_DAILY_CEILING", "lots")]);
        let result = OrchestratorConfig::from_lookup(|key| values.get(key).map(ToString::to_string));
        assert!(matches!(result, Err(ConfigError::InvalidAmount { .. })));

        let values = HashMap::from([("PAYCMD_APPROVER_ADDRESS", "0x1234")]);
        let result = OrchestratorConfig::from_lookup(|key| values.get(key).map(ToString::to_string));
        assert!(matches!(result, Err(ConfigError::InvalidApproverAddress(_))));
    }
}
