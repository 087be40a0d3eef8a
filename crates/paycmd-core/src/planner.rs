use std::collections::BTreeMap;
use std::path::Path;

use paycmd_x402::{DecimalAmount, USDC_DECIMALS};
use serde::Deserialize;

use crate::capabilities::ToolPlanner;
use crate::types::{CommandKind, ParsedCommand, PlannedTool};

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("failed to read catalog {path}: {reason}")]
    Read { path: String, reason: String },
    #[error("failed to parse catalog: {0}")]
    Parse(String),
    #[error("invalid price {price:?} for tool {tool}")]
    InvalidPrice { tool: String, price: String },
    #[error("plan for {kind} references unknown tool {tool}")]
    UnknownTool { kind: String, tool: String },
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    tools: Vec<CatalogTool>,
    #[serde(default)]
    plans: CatalogPlans,
}

#[derive(Debug, Deserialize)]
struct CatalogTool {
    name: String,
    endpoint: String,
    /// Decimal price, e.g. `"0.25"`.
    price: String,
    #[serde(default)]
    optional: bool,
}

#[derive(Debug, Default, Deserialize)]
struct CatalogPlans {
    #[serde(default)]
    pay: Vec<String>,
    #[serde(default)]
    swap: Vec<String>,
    #[serde(default)]
    private_payout: Vec<String>,
    #[serde(default)]
    recurring: Vec<String>,
}

/// Paid tools and the ordered tool plan for each command kind.
///
/// ```toml
/// [[tools]]
/// name = "risk"
/// endpoint = "https://tools.example/risk"
/// price = "0.25"
///
/// [plans]
/// pay = ["risk"]
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolCatalog {
    tools: BTreeMap<String, PlannedTool>,
    plans: BTreeMap<&'static str, Vec<String>>,
}

impl ToolCatalog {
    pub fn from_toml_str(raw: &str) -> Result<Self, CatalogError> {
        let file: CatalogFile =
            toml::from_str(raw).map_err(|error| CatalogError::Parse(error.to_string()))?;

        let mut tools = BTreeMap::new();
        for tool in file.tools {
            let price_units = DecimalAmount::parse_units(&tool.price, USDC_DECIMALS).ok_or_else(
                || CatalogError::InvalidPrice {
                    tool: tool.name.clone(),
                    price: tool.price.clone(),
                },
            )?;
            tools.insert(
                tool.name.clone(),
                PlannedTool {
                    name: tool.name,
                    endpoint: tool.endpoint,
                    price_units,
                    optional: tool.optional,
                },
            );
        }

        let mut plans = BTreeMap::new();
        for (kind, names) in [
            (CommandKind::Pay, file.plans.pay),
            (CommandKind::Swap, file.plans.swap),
            (CommandKind::PrivatePayout, file.plans.private_payout),
            (CommandKind::Recurring, file.plans.recurring),
        ] {
            if let Some(unknown) = names.iter().find(|name| !tools.contains_key(*name)) {
                return Err(CatalogError::UnknownTool {
                    kind: kind.as_str().to_string(),
                    tool: unknown.clone(),
                });
            }
            plans.insert(kind.as_str(), names);
        }

        Ok(Self { tools, plans })
    }

    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let raw = std::fs::read_to_string(path).map_err(|error| CatalogError::Read {
            path: path.display().to_string(),
            reason: error.to_string(),
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn tool_names(&self) -> impl Iterator<Item = &str> {
        self.tools.keys().map(String::as_str)
    }

    #[must_use]
    pub fn tool(&self, name: &str) -> Option<&PlannedTool> {
        self.tools.get(name)
    }

    #[must_use]
    pub fn plan_for(&self, kind: CommandKind) -> Vec<PlannedTool> {
        self.plans
            .get(kind.as_str())
            .map(|names| {
                names
                    .iter()
                    .filter_map(|name| self.tools.get(name).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl ToolPlanner for ToolCatalog {
    fn plan(&self, parsed: &ParsedCommand) -> Vec<PlannedTool> {
        self.plan_for(parsed.kind())
    }

    fn lookup(&self, tool: &str) -> Option<PlannedTool> {
        self.tool(tool).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::{CatalogError, ToolCatalog};
    use crate::types::CommandKind;

    const CATALOG: &str = r#"
[[tools]]
name = "risk"
endpoint = "https://tools.test/risk"
price = "0.25"

[[tools]]
name = "kyb"
endpoint = "https://tools.test/kyb"
price = "$0.50"

[[tools]]
name = "news"
endpoint = "https://tools.test/news"
price = "0.10"
optional = true

[plans]
pay = ["risk", "kyb"]
swap = ["news"]
"#;

    #[test]
    fn catalog_builds_ordered_plans() -> Result<(), CatalogError> {
        let catalog = ToolCatalog::from_toml_str(CATALOG)?;
        let plan = catalog.plan_for(CommandKind::Pay);
        assert_eq!(
            plan.iter().map(|tool| tool.name.as_str()).collect::<Vec<_>>(),
            vec!["risk", "kyb"]
        );
        assert_eq!(plan.iter().map(|tool| tool.price_units).sum::<u64>(), 750_000);
        assert!(catalog.plan_for(CommandKind::Recurring).is_empty());
        assert!(catalog.tool("news").is_some_and(|tool| tool.optional));
        assert_eq!(catalog.tool_names().count(), 3);
        Ok(())
    }

    #[test]
    fn catalog_rejects_unknown_tools_and_bad_prices() {
        let unknown = ToolCatalog::from_toml_str("[plans]\npay = [\"ghost\"]\n");
        assert!(matches!(unknown, Err(CatalogError::UnknownTool { .. })));

        let bad_price = ToolCatalog::from_toml_str(
            "[[tools]]\nname = \"x\"\nendpoint = \"https://x\"\nprice = \"free\"\n",
        );
        assert!(matches!(bad_price, Err(CatalogError::InvalidPrice { .. })));
    }
}
