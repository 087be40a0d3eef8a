//! Spend and risk rules. Pure: no I/O, no clock reads.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use paycmd_x402::{DecimalAmount, USDC_DECIMALS};
use serde::{Deserialize, Serialize};

use crate::types::{Command, ParsedCommand};

pub const DEFAULT_MAX_SLIPPAGE_BPS: u32 = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReasonCode {
    Ok,
    ToolNotAllowlisted,
    OverCmdBudget,
    SpendLimitReached,
    DailyLimitReached,
    SlippageTooHigh,
    MaxSpendExceeded,
    InvalidUnlockTime,
}

impl ReasonCode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::ToolNotAllowlisted => "TOOL_NOT_ALLOWLISTED",
            Self::OverCmdBudget => "OVER_CMD_BUDGET",
            Self::SpendLimitReached => "SPEND_LIMIT_REACHED",
            Self::DailyLimitReached => "DAILY_LIMIT_REACHED",
            Self::SlippageTooHigh => "SLIPPAGE_TOO_HIGH",
            Self::MaxSpendExceeded => "MAX_SPEND_EXCEEDED",
            Self::InvalidUnlockTime => "INVALID_UNLOCK_TIME",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyConfig {
    pub tool_allowlist: BTreeSet<String>,
    pub default_command_ceiling_units: u64,
    pub daily_ceiling_units: u64,
    pub max_slippage_bps: u32,
    pub auto_run_ceiling_units: u64,
    pub approval_threshold_units: u64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            tool_allowlist: BTreeSet::new(),
            default_command_ceiling_units: 1_000_000,
            daily_ceiling_units: 10_000_000,
            max_slippage_bps: DEFAULT_MAX_SLIPPAGE_BPS,
            auto_run_ceiling_units: 50_000_000,
            approval_threshold_units: 50_000_000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PolicyInput<'a> {
    pub command: &'a Command,
    pub command_spend_units: u64,
    pub daily_spend_units: u64,
    pub estimated_tool_cost_units: u64,
    pub selected_tools: &'a [String],
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub allowed: bool,
    pub reason_code: ReasonCode,
    pub message: String,
}

impl PolicyDecision {
    fn allow() -> Self {
        Self {
            allowed: true,
            reason_code: ReasonCode::Ok,
            message: "all policy checks passed".to_string(),
        }
    }

    fn deny(reason_code: ReasonCode, message: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason_code,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PolicyEngine {
    config: PolicyConfig,
}

impl PolicyEngine {
    #[must_use]
    pub fn new(config: PolicyConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    /// Command-declared `MAX_TOTAL` when present, otherwise the configured default.
    #[must_use]
    pub fn effective_ceiling(&self, parsed: &ParsedCommand) -> u64 {
        parsed
            .declared_ceiling_units()
            .unwrap_or(self.config.default_command_ceiling_units)
    }

    #[must_use]
    pub fn requires_approval(&self, parsed: &ParsedCommand) -> bool {
        let gate = self
            .config
            .auto_run_ceiling_units
            .max(self.config.approval_threshold_units);
        parsed.principal_units() > gate
    }

    #[must_use]
    pub fn is_allowlisted(&self, tool: &str) -> bool {
        self.config.tool_allowlist.contains(tool)
    }

    /// First failing rule wins.
    #[must_use]
    pub fn evaluate(&self, input: &PolicyInput<'_>) -> PolicyDecision {
        if let Some(tool) = input
            .selected_tools
            .iter()
            .find(|tool| !self.is_allowlisted(tool.as_str()))
        {
            return PolicyDecision::deny(
                ReasonCode::ToolNotAllowlisted,
                format!("tool {tool} is not allowlisted"),
            );
        }

        let ceiling = self.effective_ceiling(&input.command.parsed);
        if input.estimated_tool_cost_units > ceiling {
            return PolicyDecision::deny(
                ReasonCode::OverCmdBudget,
                format!(
                    "estimated tool cost {} exceeds command ceiling {}",
                    units(input.estimated_tool_cost_units),
                    units(ceiling)
                ),
            );
        }

        let projected = input
            .command_spend_units
            .saturating_add(input.estimated_tool_cost_units);
        if projected > ceiling {
            return PolicyDecision::deny(
                ReasonCode::SpendLimitReached,
                format!(
                    "command spend {} plus estimate {} exceeds ceiling {}",
                    units(input.command_spend_units),
                    units(input.estimated_tool_cost_units),
                    units(ceiling)
                ),
            );
        }

        let projected_daily = input
            .daily_spend_units
            .saturating_add(input.estimated_tool_cost_units);
        if projected_daily > self.config.daily_ceiling_units {
            return PolicyDecision::deny(
                ReasonCode::DailyLimitReached,
                format!(
                    "daily spend {} plus estimate {} exceeds daily ceiling {}",
                    units(input.daily_spend_units),
                    units(input.estimated_tool_cost_units),
                    units(self.config.daily_ceiling_units)
                ),
            );
        }

        self.check_variant(&input.command.parsed, input.now)
    }

    /// Variant-specific rules only; safe to run before any tool is planned.
    #[must_use]
    pub fn check_variant(&self, parsed: &ParsedCommand, now: DateTime<Utc>) -> PolicyDecision {
        match parsed {
            ParsedCommand::TreasurySwap(swap) => {
                if swap.slippage_bps > self.config.max_slippage_bps {
                    return PolicyDecision::deny(
                        ReasonCode::SlippageTooHigh,
                        format!(
                            "slippage {} bps exceeds max {} bps",
                            swap.slippage_bps, self.config.max_slippage_bps
                        ),
                    );
                }
                if swap.amount_units > swap.max_spend_units {
                    return PolicyDecision::deny(
                        ReasonCode::MaxSpendExceeded,
                        format!(
                            "swap amount {} exceeds max spend {}",
                            units(swap.amount_units),
                            units(swap.max_spend_units)
                        ),
                    );
                }
                PolicyDecision::allow()
            }
            ParsedCommand::PrivateTimedPayout(payout) => match payout.unlock_at {
                None => PolicyDecision::deny(
                    ReasonCode::InvalidUnlockTime,
                    format!("unlock time {:?} is not a timestamp", payout.unlock_at_raw),
                ),
                Some(unlock_at) if unlock_at <= now => PolicyDecision::deny(
                    ReasonCode::InvalidUnlockTime,
                    format!("unlock time {} is not in the future", unlock_at.to_rfc3339()),
                ),
                Some(_) => PolicyDecision::allow(),
            },
            ParsedCommand::PayParty(_) | ParsedCommand::RecurringPay(_) => PolicyDecision::allow(),
        }
    }
}

fn units(value: u64) -> String {
    DecimalAmount::format_units(value, USDC_DECIMALS)
}
