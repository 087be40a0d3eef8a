//! Command Compiler: raw operator text to typed commands and content-addressed ids.
//!
//! Two surfaces are accepted. The strict surface is a fixed keyword grammar
//! (`PAY_VENDOR`, `PAY`, `TREASURY_SWAP`, `PRIVATE_PAYOUT`, `RECURRING_PAY`, optionally
//! slash-prefixed). Anything else goes through a best-effort natural-language pass that
//! either extracts every required field or reports which ones are missing.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use paycmd_x402::{DecimalAmount, USDC_DECIMALS};
use regex::{Captures, Regex};
use sha2::{Digest, Sha256};

use crate::types::{
    COMMAND_ID_PREFIX, CommandKind, ParsedCommand, PayParty, PrivateTimedPayout, RecurringPay,
    TreasurySwap,
};

const NL_DEFAULT_SLIPPAGE_BPS: u32 = 50;
const COMMAND_ID_HEX_LEN: usize = 32;

const AMOUNT: &str = r"\$?\d+(?:\.\d+)?";
const TOKEN: &str = r"[A-Za-z][A-Za-z0-9]{1,11}";
const ADDRESS: &str = r"0x[0-9a-fA-F]{40}";

/// Words that look like `<number> <token>` but are units of time or rate.
const NON_TOKEN_WORDS: &[&str] = &[
    "bps", "percent", "pct", "min", "mins", "minute", "minutes", "hr", "hrs", "hour", "hours",
    "day", "days", "week", "weeks", "sec", "secs", "seconds",
];

/// Connectives that follow an amount when the token symbol was left out ("send 5 to 0x..").
const STOP_WORDS: &[&str] = &[
    "to", "for", "into", "from", "of", "and", "or", "at", "on", "in", "every", "with", "via",
    "per", "by", "the",
];

fn is_token_word(word: &str) -> bool {
    let lowered = word.to_ascii_lowercase();
    !NON_TOKEN_WORDS.contains(&lowered.as_str()) && !STOP_WORDS.contains(&lowered.as_str())
}

/// True when the match at `start` continues a word, e.g. digits inside a hex address.
fn starts_mid_word(text: &str, start: usize) -> bool {
    text[..start]
        .chars()
        .next_back()
        .is_some_and(|ch| ch.is_ascii_alphanumeric())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingFieldsError {
    pub command_guess: CommandKind,
    pub missing: Vec<String>,
    pub extracted: BTreeMap<String, String>,
    pub example: String,
}

impl fmt::Display for MissingFieldsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} command is missing {}; example: {}",
            self.command_guess.as_str(),
            self.missing.join(", "),
            self.example
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompileError {
    #[error("empty command")]
    Empty,
    #[error("unrecognized command")]
    Unrecognized,
    #[error("needs info: {0}")]
    MissingFields(MissingFieldsError),
}

impl CompileError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::Unrecognized => "unrecognized",
            Self::MissingFields(_) => "needs_info",
        }
    }
}

/// Canonical usage example for a command kind.
#[must_use]
pub fn usage_example(kind: CommandKind) -> &'static str {
    match kind {
        CommandKind::Pay => {
            "PAY_VENDOR ACME 200 USDC TO 0x1111111111111111111111111111111111111111 MAX_TOTAL 2"
        }
        CommandKind::Swap => "TREASURY_SWAP 25 USDC TO WETH SLIPPAGE 50 MAX_SPEND 30",
        CommandKind::PrivatePayout => {
            "PRIVATE_PAYOUT 50 USDC TO 0x1111111111111111111111111111111111111111 AT 2030-01-01T00:00:00Z"
        }
        CommandKind::Recurring => {
            "RECURRING_PAY 10 USDC TO 0x1111111111111111111111111111111111111111 EVERY 7d VENDOR ACME"
        }
    }
}

/// Deterministic rendering used only as the pre-image of the command id.
#[must_use]
pub fn canonical_form(parsed: &ParsedCommand) -> String {
    match parsed {
        ParsedCommand::PayParty(pay) => format!(
            "PAY|vendor={}|amount={}|token={}|to={}|max_total={}|ref={}",
            pay.vendor.as_deref().unwrap_or("-"),
            pay.amount_units,
            pay.token,
            pay.recipient,
            optional_units(pay.max_total_units),
            pay.reference.as_deref().unwrap_or("-"),
        ),
        ParsedCommand::TreasurySwap(swap) => format!(
            "SWAP|amount={}|token_in={}|token_out={}|slippage_bps={}|max_spend={}",
            swap.amount_units,
            swap.token_in,
            swap.token_out,
            swap.slippage_bps,
            swap.max_spend_units,
        ),
        ParsedCommand::PrivateTimedPayout(payout) => format!(
            "PRIVATE_PAYOUT|amount={}|token={}|to={}|unlock={}",
            payout.amount_units,
            payout.token,
            payout.recipient,
            payout
                .unlock_at
                .map(|at| at.timestamp().to_string())
                .unwrap_or_else(|| payout.unlock_at_raw.clone()),
        ),
        ParsedCommand::RecurringPay(recurring) => format!(
            "RECURRING|amount={}|token={}|to={}|interval={}|start={}|vendor={}",
            recurring.amount_units,
            recurring.token,
            recurring.recipient,
            recurring.interval_seconds,
            recurring
                .start_at
                .map(|at| at.timestamp().to_string())
                .unwrap_or_else(|| "-".to_string()),
            recurring.vendor.as_deref().unwrap_or("-"),
        ),
    }
}

/// Content-addressed id: `cmd_` + the first 128 bits of SHA-256 over the canonical form.
#[must_use]
pub fn command_id(canonical: &str) -> String {
    let digest = hex::encode(Sha256::digest(canonical.as_bytes()));
    format!("{COMMAND_ID_PREFIX}{}", &digest[..COMMAND_ID_HEX_LEN])
}

pub struct CommandCompiler {
    pay_vendor: Regex,
    pay: Regex,
    swap: Regex,
    private_payout: Regex,
    recurring: Regex,
    nl: NaturalLanguagePatterns,
}

struct NaturalLanguagePatterns {
    amount_token: Regex,
    bare_amount: Regex,
    address: Regex,
    swap_target: Regex,
    slippage: Regex,
    max_spend: Regex,
    vendor: Regex,
    absolute_time: Regex,
    relative_time: Regex,
    every: Regex,
    cadence_word: Regex,
}

impl CommandCompiler {
    pub fn new() -> Result<Self, regex::Error> {
        let payment_tail = format!(
            r"(?P<amount>{AMOUNT})\s+(?P<token>{TOKEN})\s+to\s+(?P<to>{ADDRESS})(?:\s+max_total\s+(?P<max_total>{AMOUNT}))?(?:\s+ref\s+(?P<reference>\S+))?"
        );
        Ok(Self {
            pay_vendor: Regex::new(&format!(
                r"(?i)^/?pay_vendor\s+(?P<vendor>\S+)\s+{payment_tail}\s*$"
            ))?,
            pay: Regex::new(&format!(r"(?i)^/?pay\s+{payment_tail}\s*$"))?,
            swap: Regex::new(&format!(
                r"(?i)^/?treasury_swap\s+(?P<amount>{AMOUNT})\s+(?P<token_in>{TOKEN})\s+to\s+(?P<token_out>{TOKEN})\s+slippage\s+(?P<slippage>\d+)\s+max_spend\s+(?P<max_spend>{AMOUNT})\s*$"
            ))?,
            private_payout: Regex::new(&format!(
                r"(?i)^/?private_payout\s+(?P<amount>{AMOUNT})\s+(?P<token>{TOKEN})\s+to\s+(?P<to>{ADDRESS})\s+at\s+(?P<at>\S+)\s*$"
            ))?,
            recurring: Regex::new(&format!(
                r"(?i)^/?recurring_pay\s+(?P<amount>{AMOUNT})\s+(?P<token>{TOKEN})\s+to\s+(?P<to>{ADDRESS})\s+every\s+(?P<every>\d+[smhdw])(?:\s+start\s+(?P<start>\S+))?(?:\s+vendor\s+(?P<vendor>\S+))?\s*$"
            ))?,
            nl: NaturalLanguagePatterns {
                amount_token: Regex::new(r"(?i)\$?(\d+(?:\.\d+)?)\s*([A-Za-z][A-Za-z0-9]{1,11})\b")?,
                bare_amount: Regex::new(r"\$?(\d+(?:\.\d+)?)\b(?:\s*([A-Za-z]+))?")?,
                address: Regex::new(&format!(r"({ADDRESS})"))?,
                swap_target: Regex::new(r"(?i)\b(?:to|for|into)\s+([A-Za-z][A-Za-z0-9]{1,11})\b")?,
                slippage: Regex::new(r"(?i)(\d+(?:\.\d+)?)\s*(%|bps)")?,
                max_spend: Regex::new(
                    r"(?i)\bmax(?:imum)?(?:[\s_]+spend)?\s+(?:of\s+)?\$?(\d+(?:\.\d+)?)",
                )?,
                vendor: Regex::new(r"(?i)\b(?:vendor|for)\s+([A-Za-z][A-Za-z0-9_-]{1,31})\b")?,
                absolute_time: Regex::new(
                    r"(?i)\b(?:at|on|after)\s+(\d{4}-\d{2}-\d{2}T\S+|\d{9,})",
                )?,
                relative_time: Regex::new(
                    r"(?i)\bin\s+(\d+)\s*(minute|min|hour|hr|day|week)s?\b",
                )?,
                every: Regex::new(r"(?i)\bevery\s+(?:(\d+)\s*)?(minute|hour|day|week)s?\b")?,
                cadence_word: Regex::new(r"(?i)\b(hourly|daily|weekly)\b")?,
            },
        })
    }

    /// Compile one line of operator text. `now` resolves relative times ("in 10 minutes").
    pub fn compile(&self, raw: &str, now: DateTime<Utc>) -> Result<ParsedCommand, CompileError> {
        let text = raw.trim();
        if text.is_empty() {
            return Err(CompileError::Empty);
        }

        if let Some(parsed) = self.compile_strict(text) {
            return Ok(parsed);
        }

        self.compile_natural(text, now)
    }

    fn compile_strict(&self, text: &str) -> Option<ParsedCommand> {
        if let Some(caps) = self.pay_vendor.captures(text) {
            return strict_pay(&caps, Some(caps.name("vendor")?.as_str().to_ascii_uppercase()));
        }
        if let Some(caps) = self.pay.captures(text) {
            return strict_pay(&caps, None);
        }
        if let Some(caps) = self.swap.captures(text) {
            return Some(ParsedCommand::TreasurySwap(TreasurySwap {
                amount_units: units(caps.name("amount")?.as_str())?,
                token_in: caps.name("token_in")?.as_str().to_ascii_uppercase(),
                token_out: caps.name("token_out")?.as_str().to_ascii_uppercase(),
                slippage_bps: caps.name("slippage")?.as_str().parse().ok()?,
                max_spend_units: units(caps.name("max_spend")?.as_str())?,
            }));
        }
        if let Some(caps) = self.private_payout.captures(text) {
            let unlock_at_raw = caps.name("at")?.as_str().to_string();
            return Some(ParsedCommand::PrivateTimedPayout(PrivateTimedPayout {
                amount_units: units(caps.name("amount")?.as_str())?,
                token: caps.name("token")?.as_str().to_ascii_uppercase(),
                recipient: caps.name("to")?.as_str().to_ascii_lowercase(),
                unlock_at: parse_timestamp(unlock_at_raw.as_str()),
                unlock_at_raw,
            }));
        }
        if let Some(caps) = self.recurring.captures(text) {
            let start_at = match caps.name("start") {
                Some(start) => Some(parse_timestamp(start.as_str())?),
                None => None,
            };
            return Some(ParsedCommand::RecurringPay(RecurringPay {
                amount_units: units(caps.name("amount")?.as_str())?,
                token: caps.name("token")?.as_str().to_ascii_uppercase(),
                recipient: caps.name("to")?.as_str().to_ascii_lowercase(),
                interval_seconds: parse_interval(caps.name("every")?.as_str())?,
                start_at,
                vendor: caps
                    .name("vendor")
                    .map(|vendor| vendor.as_str().to_ascii_uppercase()),
            }));
        }
        None
    }

    fn compile_natural(&self, text: &str, now: DateTime<Utc>) -> Result<ParsedCommand, CompileError> {
        let kind = detect_kind(text).ok_or(CompileError::Unrecognized)?;
        let mut extracted = BTreeMap::new();
        let mut missing = Vec::new();

        let amount_token = self.first_amount_token(text);
        if let Some((amount, token)) = amount_token.as_ref() {
            extracted.insert("amount".to_string(), DecimalAmount::format_units(*amount, USDC_DECIMALS));
            extracted.insert("token".to_string(), token.clone());
        } else if let Some(amount) = self.bare_amount(text) {
            extracted.insert(
                "amount".to_string(),
                DecimalAmount::format_units(amount, USDC_DECIMALS),
            );
            missing.push("token".to_string());
        } else {
            missing.push("amount".to_string());
            missing.push("token".to_string());
        }

        let recipient = self
            .nl
            .address
            .captures(text)
            .and_then(|caps| caps.get(1))
            .map(|found| found.as_str().to_ascii_lowercase());
        if let Some(address) = recipient.as_ref() {
            extracted.insert("recipient".to_string(), address.clone());
        }

        let parsed = match kind {
            CommandKind::Pay => {
                if recipient.is_none() {
                    missing.push("recipient".to_string());
                }
                let vendor = self.vendor(text, &mut extracted);
                let max_total = self.max_spend(text);
                match (amount_token, recipient) {
                    (Some((amount_units, token)), Some(recipient)) if missing.is_empty() => {
                        Some(ParsedCommand::PayParty(PayParty {
                            vendor,
                            amount_units,
                            token,
                            recipient,
                            max_total_units: max_total,
                            reference: None,
                        }))
                    }
                    _ => None,
                }
            }
            CommandKind::Swap => {
                let token_out = self.swap_target(text, amount_token.as_ref());
                match token_out.as_ref() {
                    Some(token_out) => {
                        extracted.insert("token_out".to_string(), token_out.clone());
                    }
                    None => missing.push("token_out".to_string()),
                }
                let slippage_bps = self.slippage_bps(text);
                let max_spend = self.max_spend(text);
                match (amount_token, token_out) {
                    (Some((amount_units, token_in)), Some(token_out)) if missing.is_empty() => {
                        Some(ParsedCommand::TreasurySwap(TreasurySwap {
                            amount_units,
                            token_in,
                            token_out,
                            slippage_bps: slippage_bps.unwrap_or(NL_DEFAULT_SLIPPAGE_BPS),
                            max_spend_units: max_spend.unwrap_or(amount_units),
                        }))
                    }
                    _ => None,
                }
            }
            CommandKind::PrivatePayout => {
                if recipient.is_none() {
                    missing.push("recipient".to_string());
                }
                let unlock = self.unlock_time(text, now);
                match unlock.as_ref() {
                    Some((raw, _)) => {
                        extracted.insert("unlock_at".to_string(), raw.clone());
                    }
                    None => missing.push("unlock_at".to_string()),
                }
                match (amount_token, recipient, unlock) {
                    (Some((amount_units, token)), Some(recipient), Some((raw, at)))
                        if missing.is_empty() =>
                    {
                        Some(ParsedCommand::PrivateTimedPayout(PrivateTimedPayout {
                            amount_units,
                            token,
                            recipient,
                            unlock_at_raw: raw,
                            unlock_at: at,
                        }))
                    }
                    _ => None,
                }
            }
            CommandKind::Recurring => {
                if recipient.is_none() {
                    missing.push("recipient".to_string());
                }
                let vendor = self.vendor(text, &mut extracted);
                let interval = self.interval_seconds(text);
                match interval {
                    Some(seconds) => {
                        extracted.insert("interval_seconds".to_string(), seconds.to_string());
                    }
                    None => missing.push("interval".to_string()),
                }
                match (amount_token, recipient, interval) {
                    (Some((amount_units, token)), Some(recipient), Some(interval_seconds))
                        if missing.is_empty() =>
                    {
                        Some(ParsedCommand::RecurringPay(RecurringPay {
                            amount_units,
                            token,
                            recipient,
                            interval_seconds,
                            start_at: None,
                            vendor,
                        }))
                    }
                    _ => None,
                }
            }
        };

        parsed.ok_or_else(|| {
            CompileError::MissingFields(MissingFieldsError {
                command_guess: kind,
                missing,
                extracted,
                example: usage_example(kind).to_string(),
            })
        })
    }

    fn first_amount_token(&self, text: &str) -> Option<(u64, String)> {
        self.nl.amount_token.captures_iter(text).find_map(|caps| {
            let token = caps.get(2)?.as_str();
            if starts_mid_word(text, caps.get(0)?.start()) || !is_token_word(token) {
                return None;
            }
            // "0x..." addresses split into "0" + "x...".
            if caps.get(1)?.as_str() == "0" && token.starts_with(['x', 'X']) {
                return None;
            }
            Some((units(caps.get(1)?.as_str())?, token.to_ascii_uppercase()))
        })
    }

    /// An amount with no token symbol after it. Durations such as "7 days" are not amounts.
    fn bare_amount(&self, text: &str) -> Option<u64> {
        self.nl.bare_amount.captures_iter(text).find_map(|caps| {
            if starts_mid_word(text, caps.get(0)?.start()) {
                return None;
            }
            let unit = caps.get(2).map(|word| word.as_str().to_ascii_lowercase());
            if unit.is_some_and(|unit| NON_TOKEN_WORDS.contains(&unit.as_str())) {
                return None;
            }
            units(caps.get(1)?.as_str())
        })
    }

    fn swap_target(&self, text: &str, source: Option<&(u64, String)>) -> Option<String> {
        self.nl.swap_target.captures_iter(text).find_map(|caps| {
            let token = caps.get(1)?.as_str().to_ascii_uppercase();
            let is_source = source.is_some_and(|(_, source_token)| *source_token == token);
            if is_source || !is_token_word(&token) {
                return None;
            }
            Some(token)
        })
    }

    fn vendor(&self, text: &str, extracted: &mut BTreeMap<String, String>) -> Option<String> {
        let vendor = self
            .nl
            .vendor
            .captures(text)
            .and_then(|caps| caps.get(1))
            .map(|found| found.as_str().to_ascii_uppercase())?;
        extracted.insert("vendor".to_string(), vendor.clone());
        Some(vendor)
    }

    fn slippage_bps(&self, text: &str) -> Option<u32> {
        let caps = self.nl.slippage.captures(text)?;
        let value = caps.get(1)?.as_str();
        let bps = if caps.get(2)?.as_str() == "%" {
            DecimalAmount::parse_units(value, 2)?
        } else {
            value.parse::<u64>().ok()?
        };
        u32::try_from(bps).ok()
    }

    fn max_spend(&self, text: &str) -> Option<u64> {
        let caps = self.nl.max_spend.captures(text)?;
        units(caps.get(1)?.as_str())
    }

    fn unlock_time(
        &self,
        text: &str,
        now: DateTime<Utc>,
    ) -> Option<(String, Option<DateTime<Utc>>)> {
        if let Some(caps) = self.nl.absolute_time.captures(text) {
            let raw = caps.get(1)?.as_str().to_string();
            let at = parse_timestamp(raw.as_str());
            return Some((raw, at));
        }
        let caps = self.nl.relative_time.captures(text)?;
        let count = caps.get(1)?.as_str().parse::<i64>().ok()?;
        let unit_seconds = unit_seconds(caps.get(2)?.as_str())?;
        let at = now + Duration::seconds(count.checked_mul(unit_seconds)?);
        Some((at.timestamp().to_string(), Some(at)))
    }

    fn interval_seconds(&self, text: &str) -> Option<i64> {
        if let Some(caps) = self.nl.every.captures(text) {
            let count = match caps.get(1) {
                Some(count) => count.as_str().parse::<i64>().ok()?,
                None => 1,
            };
            let seconds = count.checked_mul(unit_seconds(caps.get(2)?.as_str())?)?;
            return (seconds > 0).then_some(seconds);
        }
        let caps = self.nl.cadence_word.captures(text)?;
        match caps.get(1)?.as_str().to_ascii_lowercase().as_str() {
            "hourly" => Some(3_600),
            "daily" => Some(86_400),
            "weekly" => Some(604_800),
            _ => None,
        }
    }
}

fn strict_pay(caps: &Captures<'_>, vendor: Option<String>) -> Option<ParsedCommand> {
    let max_total_units = match caps.name("max_total") {
        Some(value) => Some(units(value.as_str())?),
        None => None,
    };
    Some(ParsedCommand::PayParty(PayParty {
        vendor,
        amount_units: units(caps.name("amount")?.as_str())?,
        token: caps.name("token")?.as_str().to_ascii_uppercase(),
        recipient: caps.name("to")?.as_str().to_ascii_lowercase(),
        max_total_units,
        reference: caps.name("reference").map(|value| value.as_str().to_string()),
    }))
}

fn detect_kind(text: &str) -> Option<CommandKind> {
    let lowered = text.to_ascii_lowercase();
    let has_word = |words: &[&str]| {
        lowered
            .split(|ch: char| !ch.is_ascii_alphanumeric() && ch != '_' && ch != '-')
            .any(|word| words.contains(&word))
    };

    if has_word(&["swap", "exchange", "convert", "treasury_swap"]) {
        return Some(CommandKind::Swap);
    }
    if has_word(&["private", "privately", "time-locked", "timelocked", "unlock", "private_payout"]) {
        return Some(CommandKind::PrivatePayout);
    }
    if has_word(&["every", "recurring", "hourly", "daily", "weekly", "recurring_pay"]) {
        return Some(CommandKind::Recurring);
    }
    if has_word(&["pay", "send", "transfer", "pay_vendor"]) {
        return Some(CommandKind::Pay);
    }
    None
}

fn units(raw: &str) -> Option<u64> {
    DecimalAmount::parse_units(raw, USDC_DECIMALS)
}

/// RFC 3339 or unix seconds.
#[must_use]
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let trimmed = raw.trim();
    if !trimmed.is_empty() && trimmed.bytes().all(|byte| byte.is_ascii_digit()) {
        return DateTime::from_timestamp(trimmed.parse::<i64>().ok()?, 0);
    }
    DateTime::parse_from_rfc3339(trimmed)
        .ok()
        .map(|value| value.with_timezone(&Utc))
}

/// `<n><s|m|h|d|w>` to seconds; zero intervals are rejected.
#[must_use]
pub fn parse_interval(raw: &str) -> Option<i64> {
    let raw = raw.trim().to_ascii_lowercase();
    let (count, unit) = raw.split_at(raw.len().checked_sub(1)?);
    let count = count.parse::<i64>().ok()?;
    let unit_seconds = match unit {
        "s" => 1,
        "m" => 60,
        "h" => 3_600,
        "d" => 86_400,
        "w" => 604_800,
        _ => return None,
    };
    let seconds = count.checked_mul(unit_seconds)?;
    (seconds > 0).then_some(seconds)
}

fn unit_seconds(unit: &str) -> Option<i64> {
    match unit.to_ascii_lowercase().as_str() {
        "minute" | "min" => Some(60),
        "hour" | "hr" => Some(3_600),
        "day" => Some(86_400),
        "week" => Some(604_800),
        _ => None,
    }
}

fn optional_units(value: Option<u64>) -> String {
    value.map_or_else(|| "-".to_string(), |units| units.to_string())
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::{CommandCompiler, CompileError, canonical_form, command_id, parse_interval};
    use crate::types::{CommandKind, ParsedCommand};

    const ADDR_A: &str = "0xAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA";

    #[test]
    fn strict_pay_vendor_parses_all_fields() -> Result<(), Box<dyn std::error::Error>> {
        let compiler = CommandCompiler::new()?;
        let parsed = compiler.compile(
            &format!("PAY_VENDOR ACME 200 USDC TO {ADDR_A} MAX_TOTAL 2"),
            Utc::now(),
        )?;
        let ParsedCommand::PayParty(pay) = parsed else {
            return Err("expected pay".into());
        };
        assert_eq!(pay.vendor.as_deref(), Some("ACME"));
        assert_eq!(pay.amount_units, 200_000_000);
        assert_eq!(pay.token, "USDC");
        assert_eq!(pay.recipient, ADDR_A.to_ascii_lowercase());
        assert_eq!(pay.max_total_units, Some(2_000_000));
        Ok(())
    }

    #[test]
    fn strict_swap_and_slash_prefix() -> Result<(), Box<dyn std::error::Error>> {
        let compiler = CommandCompiler::new()?;
        let parsed = compiler.compile(
            "/treasury_swap 25 usdc to weth slippage 250 max_spend 30",
            Utc::now(),
        )?;
        let ParsedCommand::TreasurySwap(swap) = parsed else {
            return Err("expected swap".into());
        };
        assert_eq!(swap.token_in, "USDC");
        assert_eq!(swap.token_out, "WETH");
        assert_eq!(swap.slippage_bps, 250);
        assert_eq!(swap.max_spend_units, 30_000_000);
        Ok(())
    }

    #[test]
    fn strict_private_payout_keeps_unparseable_time() -> Result<(), Box<dyn std::error::Error>> {
        let compiler = CommandCompiler::new()?;
        let parsed = compiler.compile(
            &format!("PRIVATE_PAYOUT 50 USDC TO {ADDR_A} AT tomorrowish"),
            Utc::now(),
        )?;
        let ParsedCommand::PrivateTimedPayout(payout) = parsed else {
            return Err("expected private payout".into());
        };
        assert_eq!(payout.unlock_at, None);
        assert_eq!(payout.unlock_at_raw, "tomorrowish");
        Ok(())
    }

    #[test]
    fn strict_recurring_parses_interval_and_start() -> Result<(), Box<dyn std::error::Error>> {
        let compiler = CommandCompiler::new()?;
        let parsed = compiler.compile(
            &format!("RECURRING_PAY 10 USDC TO {ADDR_A} EVERY 7d START 1900000000"),
            Utc::now(),
        )?;
        let ParsedCommand::RecurringPay(recurring) = parsed else {
            return Err("expected recurring".into());
        };
        assert_eq!(recurring.interval_seconds, 7 * 86_400);
        assert_eq!(recurring.start_at.map(|at| at.timestamp()), Some(1_900_000_000));
        assert_eq!(recurring.vendor, None);
        Ok(())
    }

    #[test]
    fn strict_recurring_vendor_is_part_of_identity() -> Result<(), Box<dyn std::error::Error>> {
        let compiler = CommandCompiler::new()?;
        let now = Utc::now();
        let labelled = compiler.compile(
            &format!("RECURRING_PAY 10 USDC TO {ADDR_A} EVERY 1d VENDOR rent"),
            now,
        )?;
        let ParsedCommand::RecurringPay(recurring) = &labelled else {
            return Err("expected recurring".into());
        };
        assert_eq!(recurring.vendor.as_deref(), Some("RENT"));

        let bare = compiler.compile(&format!("RECURRING_PAY 10 USDC TO {ADDR_A} EVERY 1d"), now)?;
        assert_ne!(
            command_id(&canonical_form(&labelled)),
            command_id(&canonical_form(&bare))
        );
        Ok(())
    }

    #[test]
    fn command_id_is_stable_across_surfaces() -> Result<(), Box<dyn std::error::Error>> {
        let compiler = CommandCompiler::new()?;
        let now = Utc::now();
        let strict = compiler.compile(&format!("PAY 5 USDC TO {ADDR_A}"), now)?;
        let spaced = compiler.compile(&format!("  pay   5.0   usdc   to   {ADDR_A}  "), now)?;
        let natural = compiler.compile(&format!("please send 5 usdc to {ADDR_A}"), now)?;

        let id = command_id(&canonical_form(&strict));
        assert!(id.starts_with("cmd_"));
        assert_eq!(id.len(), 4 + 32);
        assert_eq!(id, command_id(&canonical_form(&spaced)));
        assert_eq!(id, command_id(&canonical_form(&natural)));

        let other = compiler.compile(&format!("PAY 6 USDC TO {ADDR_A}"), now)?;
        assert_ne!(id, command_id(&canonical_form(&other)));
        Ok(())
    }

    #[test]
    fn natural_language_swap_uses_percent_slippage() -> Result<(), Box<dyn std::error::Error>> {
        let compiler = CommandCompiler::new()?;
        let parsed = compiler.compile("swap 25 USDC into WETH with 1.5% slippage", Utc::now())?;
        let ParsedCommand::TreasurySwap(swap) = parsed else {
            return Err("expected swap".into());
        };
        assert_eq!(swap.slippage_bps, 150);
        assert_eq!(swap.token_out, "WETH");
        assert_eq!(swap.max_spend_units, 25_000_000);
        Ok(())
    }

    #[test]
    fn natural_language_relative_unlock_resolves_from_now() -> Result<(), Box<dyn std::error::Error>>
    {
        let compiler = CommandCompiler::new()?;
        let now = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).single().ok_or("bad time")?;
        let parsed = compiler.compile(
            &format!("privately send 50 usdc to {ADDR_A} in 2 hours"),
            now,
        )?;
        let ParsedCommand::PrivateTimedPayout(payout) = parsed else {
            return Err("expected private payout".into());
        };
        assert_eq!(payout.amount_units, 50_000_000);
        assert_eq!(
            payout.unlock_at.map(|at| at.timestamp()),
            Some(now.timestamp() + 7_200)
        );
        Ok(())
    }

    #[test]
    fn natural_language_missing_fields_reports_guess_and_example()
    -> Result<(), Box<dyn std::error::Error>> {
        let compiler = CommandCompiler::new()?;
        let error = compiler
            .compile("pay 200 usdc to acme", Utc::now())
            .err()
            .ok_or("expected missing fields")?;
        let CompileError::MissingFields(missing) = error else {
            return Err("expected MissingFields".into());
        };
        assert_eq!(missing.command_guess, CommandKind::Pay);
        assert_eq!(missing.missing, vec!["recipient".to_string()]);
        assert_eq!(missing.extracted.get("amount").map(String::as_str), Some("200"));
        assert!(missing.example.starts_with("PAY_VENDOR"));
        Ok(())
    }

    #[test]
    fn amount_without_token_asks_only_for_token() -> Result<(), Box<dyn std::error::Error>> {
        let compiler = CommandCompiler::new()?;
        for text in [format!("send 5 to {ADDR_A}"), format!("pay 5 for {ADDR_A}")] {
            let error = compiler
                .compile(&text, Utc::now())
                .err()
                .ok_or("connective must not be read as a token")?;
            let CompileError::MissingFields(missing) = error else {
                return Err("expected MissingFields".into());
            };
            assert_eq!(missing.command_guess, CommandKind::Pay);
            assert_eq!(missing.missing, vec!["token".to_string()], "{text}");
            assert_eq!(missing.extracted.get("amount").map(String::as_str), Some("5"));
            assert!(!missing.extracted.contains_key("token"));
        }
        Ok(())
    }

    #[test]
    fn digits_inside_an_address_are_not_an_amount() -> Result<(), Box<dyn std::error::Error>> {
        let compiler = CommandCompiler::new()?;
        let error = compiler
            .compile(
                "send usdc to 0x1234567890abcdef1234567890abcdef12345bdf",
                Utc::now(),
            )
            .err()
            .ok_or("expected missing fields")?;
        let CompileError::MissingFields(missing) = error else {
            return Err("expected MissingFields".into());
        };
        assert_eq!(missing.missing, vec!["amount".to_string(), "token".to_string()]);
        assert!(!missing.extracted.contains_key("amount"));
        Ok(())
    }

    #[test]
    fn unrecognized_and_empty_text_are_rejected() -> Result<(), Box<dyn std::error::Error>> {
        let compiler = CommandCompiler::new()?;
        assert_eq!(compiler.compile("   ", Utc::now()), Err(CompileError::Empty));
        assert_eq!(
            compiler.compile("what's the weather", Utc::now()),
            Err(CompileError::Unrecognized)
        );
        Ok(())
    }

    #[test]
    fn interval_parser_handles_units() {
        assert_eq!(parse_interval("30m"), Some(1_800));
        assert_eq!(parse_interval("1w"), Some(604_800));
        assert_eq!(parse_interval("0d"), None);
        assert_eq!(parse_interval("5y"), None);
        assert_eq!(parse_interval(""), None);
    }
}
