#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use paycmd_core::{
    AuditSink, CapabilityError, CartMandate, Collaborators, Command, CommandStatus, CommandStore,
    Confirmation, ConfirmationStatus, EncryptedJob, EncryptionAuthority, HttpResponse,
    IntentMandate, LedgerEntry, LocalKeySigner, MandateStatus, ManualClock, MemoryAuditSink,
    MemoryCommandSource, Orchestrator, OrchestratorConfig, PaymentMandate, Receipt, RecurringRule,
    Reflection, ReflectionInput, Reflector, RetryPolicy, StatusUpdate, StoreError, SwapOrder,
    SwapVenue, ToolCatalog, ToolTransport, Wallet, store,
};
use serde_json::{Value, json};
use tokio::sync::Mutex;

pub const SCOPE: &str = "ops";
pub const APPROVER_KEY: &str = "0x0000000000000000000000000000000000000000000000000000000000000001";
pub const APPROVER_ADDRESS: &str = "0x7e5f4552091a69125d5dfcb7b8c2659029395bdf";
pub const STRANGER_KEY: &str = "0x0000000000000000000000000000000000000000000000000000000000000002";
pub const RECIPIENT: &str = "0x1111111111111111111111111111111111111111";
pub const PAY_TO: &str = "0x2222222222222222222222222222222222222222";

pub const CATALOG: &str = r#"
[[tools]]
name = "risk"
endpoint = "https://tools.test/risk"
price = "0.25"

[[tools]]
name = "kyb"
endpoint = "https://tools.test/kyb"
price = "0.50"

[[tools]]
name = "news"
endpoint = "https://tools.test/news"
price = "0.10"
optional = true

[plans]
pay = ["risk", "kyb"]
swap = ["risk"]
private_payout = ["risk"]
"#;

pub fn start_time() -> anyhow::Result<DateTime<Utc>> {
    Utc.with_ymd_and_hms(2030, 1, 1, 9, 0, 0)
        .single()
        .ok_or_else(|| anyhow::anyhow!("invalid start time"))
}

#[derive(Debug, Clone)]
pub enum ToolBehavior {
    Free(Value),
    Paid { price_units: u64, body: Value },
    Fail(u16),
}

/// Paid tool endpoints keyed by URL. Paid endpoints answer 402 until an `X-PAYMENT` header arrives.
#[derive(Default)]
pub struct ToolServer {
    behaviors: Mutex<HashMap<String, ToolBehavior>>,
    pub calls: Mutex<Vec<(String, bool)>>,
}

impl ToolServer {
    pub fn standard() -> Self {
        let behaviors = HashMap::from([
            (
                "https://tools.test/risk".to_string(),
                ToolBehavior::Paid {
                    price_units: 250_000,
                    body: json!({"risk": "low"}),
                },
            ),
            (
                "https://tools.test/kyb".to_string(),
                ToolBehavior::Paid {
                    price_units: 500_000,
                    body: json!({"kyb": "verified"}),
                },
            ),
            (
                "https://tools.test/news".to_string(),
                ToolBehavior::Free(json!({"headlines": []})),
            ),
        ]);
        Self {
            behaviors: Mutex::new(behaviors),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub async fn set(&self, url: &str, behavior: ToolBehavior) {
        self.behaviors.lock().await.insert(url.to_string(), behavior);
    }

    pub async fn paid_calls(&self) -> usize {
        self.calls.lock().await.iter().filter(|(_, paid)| *paid).count()
    }
}

fn response(status: u16, body: Value) -> HttpResponse {
    HttpResponse {
        status,
        headers: BTreeMap::new(),
        body,
    }
}

#[async_trait]
impl ToolTransport for ToolServer {
    async fn post(
        &self,
        url: &str,
        _body: &Value,
        headers: &BTreeMap<String, String>,
    ) -> Result<HttpResponse, CapabilityError> {
        let paid = headers
            .keys()
            .any(|key| key.eq_ignore_ascii_case(paycmd_x402::PAYMENT_HEADER));
        self.calls.lock().await.push((url.to_string(), paid));

        let behavior = self
            .behaviors
            .lock()
            .await
            .get(url)
            .cloned()
            .ok_or_else(|| CapabilityError::Rejected(format!("no tool at {url}")))?;
        Ok(match behavior {
            ToolBehavior::Free(body) => response(200, body),
            ToolBehavior::Paid { body, .. } if paid => response(200, body),
            ToolBehavior::Paid { price_units, .. } => response(
                402,
                json!({
                    "accepts": [{
                        "scheme": "exact",
                        "network": "base-sepolia",
                        "maxAmountRequired": price_units.to_string(),
                        "payTo": PAY_TO,
                    }]
                }),
            ),
            ToolBehavior::Fail(status) => response(status, json!({"error": "unavailable"})),
        })
    }
}

#[derive(Default)]
pub struct FakeWallet {
    pub transfers: Mutex<Vec<(String, String, u64)>>,
    pub revert: Mutex<bool>,
}

#[async_trait]
impl Wallet for FakeWallet {
    async fn transfer(
        &self,
        to: &str,
        token: &str,
        amount_units: u64,
    ) -> Result<String, CapabilityError> {
        let mut transfers = self.transfers.lock().await;
        transfers.push((to.to_string(), token.to_string(), amount_units));
        Ok(format!("0xtransfer{}", transfers.len()))
    }

    async fn wait_for_confirmation(
        &self,
        _tx_reference: &str,
    ) -> Result<Confirmation, CapabilityError> {
        let status = if *self.revert.lock().await {
            ConfirmationStatus::Reverted
        } else {
            ConfirmationStatus::Confirmed
        };
        Ok(Confirmation {
            status,
            block_ref: Some("0xblock".to_string()),
            confirmations: 1,
        })
    }
}

#[derive(Default)]
pub struct FakeSwapVenue {
    pub orders: Mutex<Vec<SwapOrder>>,
}

#[async_trait]
impl SwapVenue for FakeSwapVenue {
    async fn swap(&self, order: &SwapOrder) -> Result<String, CapabilityError> {
        let mut orders = self.orders.lock().await;
        orders.push(order.clone());
        Ok(format!("0xswap{}", orders.len()))
    }
}

/// Seals payloads in the clear and releases them on the first fetch.
#[derive(Default)]
pub struct FakeTimelock {
    pub submitted: Mutex<Vec<String>>,
}

#[async_trait]
impl EncryptionAuthority for FakeTimelock {
    async fn encrypt(
        &self,
        payload: &str,
        unlock_at: DateTime<Utc>,
    ) -> Result<String, CapabilityError> {
        Ok(format!("sealed:{}:{payload}", unlock_at.timestamp()))
    }

    async fn submit(&self, encrypted_payload: &str) -> Result<String, CapabilityError> {
        let mut submitted = self.submitted.lock().await;
        submitted.push(encrypted_payload.to_string());
        Ok(format!("0xconditional{}", submitted.len()))
    }

    async fn fetch_decrypted(
        &self,
        tx_reference: &str,
    ) -> Result<Option<String>, CapabilityError> {
        let index = tx_reference
            .trim_start_matches("0xconditional")
            .parse::<usize>()
            .map_err(|_| CapabilityError::Rejected(format!("unknown tx {tx_reference}")))?;
        let submitted = self.submitted.lock().await;
        Ok(submitted
            .get(index.saturating_sub(1))
            .and_then(|sealed| sealed.splitn(3, ':').nth(2))
            .map(str::to_string))
    }
}

pub struct ScriptedReflector {
    decisions: Mutex<VecDeque<Reflection>>,
    pub inputs: Mutex<Vec<ReflectionInput>>,
}

impl ScriptedReflector {
    pub fn new(decisions: Vec<Reflection>) -> Self {
        Self {
            decisions: Mutex::new(decisions.into()),
            inputs: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Reflector for ScriptedReflector {
    async fn reflect(&self, input: &ReflectionInput) -> Result<Reflection, CapabilityError> {
        self.inputs.lock().await.push(input.clone());
        Ok(self
            .decisions
            .lock()
            .await
            .pop_front()
            .unwrap_or(Reflection::Proceed))
    }
}

/// Memory store whose named operations can be armed to fail once.
pub struct FaultyStore {
    inner: Arc<dyn CommandStore>,
    armed: Mutex<HashSet<&'static str>>,
}

impl FaultyStore {
    pub fn new(inner: Arc<dyn CommandStore>) -> Self {
        Self {
            inner,
            armed: Mutex::new(HashSet::new()),
        }
    }

    pub async fn fail_next(&self, operation: &'static str) {
        self.armed.lock().await.insert(operation);
    }

    async fn check(&self, operation: &'static str) -> Result<(), StoreError> {
        if self.armed.lock().await.remove(operation) {
            return Err(StoreError::Backend(format!("{operation} unavailable")));
        }
        Ok(())
    }
}

#[async_trait]
impl CommandStore for FaultyStore {
    async fn insert_command(&self, command: Command) -> Result<bool, StoreError> {
        self.check("insert_command").await?;
        self.inner.insert_command(command).await
    }

    async fn get_command(
        &self,
        scope: &str,
        command_id: &str,
    ) -> Result<Option<Command>, StoreError> {
        self.check("get_command").await?;
        self.inner.get_command(scope, command_id).await
    }

    async fn list_commands(
        &self,
        scope: &str,
        status: Option<CommandStatus>,
    ) -> Result<Vec<Command>, StoreError> {
        self.check("list_commands").await?;
        self.inner.list_commands(scope, status).await
    }

    async fn transition_command(
        &self,
        scope: &str,
        command_id: &str,
        from: CommandStatus,
        to: CommandStatus,
        update: StatusUpdate,
        now: DateTime<Utc>,
    ) -> Result<Command, StoreError> {
        self.check("transition_command").await?;
        self.inner
            .transition_command(scope, command_id, from, to, update, now)
            .await
    }

    async fn put_intent(&self, intent: IntentMandate) -> Result<(), StoreError> {
        self.check("put_intent").await?;
        self.inner.put_intent(intent).await
    }

    async fn get_intent(
        &self,
        scope: &str,
        command_id: &str,
    ) -> Result<Option<IntentMandate>, StoreError> {
        self.check("get_intent").await?;
        self.inner.get_intent(scope, command_id).await
    }

    async fn update_intent_status(
        &self,
        scope: &str,
        command_id: &str,
        status: MandateStatus,
    ) -> Result<(), StoreError> {
        self.check("update_intent_status").await?;
        self.inner.update_intent_status(scope, command_id, status).await
    }

    async fn put_cart(&self, cart: CartMandate) -> Result<(), StoreError> {
        self.check("put_cart").await?;
        self.inner.put_cart(cart).await
    }

    async fn get_cart(
        &self,
        scope: &str,
        command_id: &str,
    ) -> Result<Option<CartMandate>, StoreError> {
        self.check("get_cart").await?;
        self.inner.get_cart(scope, command_id).await
    }

    async fn put_payment_mandate(&self, mandate: PaymentMandate) -> Result<(), StoreError> {
        self.check("put_payment_mandate").await?;
        self.inner.put_payment_mandate(mandate).await
    }

    async fn list_payment_mandates(
        &self,
        scope: &str,
        command_id: &str,
    ) -> Result<Vec<PaymentMandate>, StoreError> {
        self.check("list_payment_mandates").await?;
        self.inner.list_payment_mandates(scope, command_id).await
    }

    async fn append_receipt(&self, receipt: Receipt) -> Result<(), StoreError> {
        self.check("append_receipt").await?;
        self.inner.append_receipt(receipt).await
    }

    async fn list_receipts(
        &self,
        scope: &str,
        command_id: &str,
    ) -> Result<Vec<Receipt>, StoreError> {
        self.check("list_receipts").await?;
        self.inner.list_receipts(scope, command_id).await
    }

    async fn append_ledger(&self, entry: LedgerEntry) -> Result<(), StoreError> {
        self.check("append_ledger").await?;
        self.inner.append_ledger(entry).await
    }

    async fn list_ledger(
        &self,
        scope: &str,
        command_id: &str,
    ) -> Result<Vec<LedgerEntry>, StoreError> {
        self.check("list_ledger").await?;
        self.inner.list_ledger(scope, command_id).await
    }

    async fn sum_ledger_for_command(
        &self,
        scope: &str,
        command_id: &str,
    ) -> Result<u64, StoreError> {
        self.check("sum_ledger_for_command").await?;
        self.inner.sum_ledger_for_command(scope, command_id).await
    }

    async fn sum_ledger_for_scope_since(
        &self,
        scope: &str,
        since: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        self.check("sum_ledger_for_scope_since").await?;
        self.inner.sum_ledger_for_scope_since(scope, since).await
    }

    async fn put_job(&self, job: EncryptedJob) -> Result<(), StoreError> {
        self.check("put_job").await?;
        self.inner.put_job(job).await
    }

    async fn list_open_jobs(&self, scope: &str) -> Result<Vec<EncryptedJob>, StoreError> {
        self.check("list_open_jobs").await?;
        self.inner.list_open_jobs(scope).await
    }

    async fn list_jobs_for_command(
        &self,
        scope: &str,
        command_id: &str,
    ) -> Result<Vec<EncryptedJob>, StoreError> {
        self.check("list_jobs_for_command").await?;
        self.inner.list_jobs_for_command(scope, command_id).await
    }

    async fn put_recurring_rule(&self, rule: RecurringRule) -> Result<(), StoreError> {
        self.check("put_recurring_rule").await?;
        self.inner.put_recurring_rule(rule).await
    }

    async fn list_recurring_rules(&self, scope: &str) -> Result<Vec<RecurringRule>, StoreError> {
        self.check("list_recurring_rules").await?;
        self.inner.list_recurring_rules(scope).await
    }

    async fn push_generated_line(&self, scope: &str, line: String) -> Result<(), StoreError> {
        self.check("push_generated_line").await?;
        self.inner.push_generated_line(scope, line).await
    }

    async fn take_generated_lines(&self, scope: &str) -> Result<Vec<String>, StoreError> {
        self.check("take_generated_lines").await?;
        self.inner.take_generated_lines(scope).await
    }

    async fn note_parse_failure(
        &self,
        scope: &str,
        fingerprint: &str,
    ) -> Result<bool, StoreError> {
        self.check("note_parse_failure").await?;
        self.inner.note_parse_failure(scope, fingerprint).await
    }
}

pub struct HarnessBuilder {
    config: OrchestratorConfig,
    signer_key: &'static str,
    reflector: Option<Arc<dyn Reflector>>,
    source: Option<Arc<dyn paycmd_core::CommandSource>>,
}

impl HarnessBuilder {
    pub fn config(mut self, update: impl FnOnce(&mut OrchestratorConfig)) -> Self {
        update(&mut self.config);
        self
    }

    pub fn signer_key(mut self, key: &'static str) -> Self {
        self.signer_key = key;
        self
    }

    pub fn reflector(mut self, reflector: Arc<dyn Reflector>) -> Self {
        self.reflector = Some(reflector);
        self
    }

    pub fn source(mut self, source: Arc<dyn paycmd_core::CommandSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn build(self) -> anyhow::Result<Harness> {
        let faults = Arc::new(FaultyStore::new(store::memory()));
        let store: Arc<dyn CommandStore> = faults.clone();
        let source = Arc::new(MemoryCommandSource::new());
        let audit = Arc::new(MemoryAuditSink::new());
        let wallet = Arc::new(FakeWallet::default());
        let tools = Arc::new(ToolServer::standard());
        let venue = Arc::new(FakeSwapVenue::default());
        let timelock = Arc::new(FakeTimelock::default());
        let clock = Arc::new(ManualClock::new(start_time()?));
        let catalog = Arc::new(ToolCatalog::from_toml_str(CATALOG)?);
        let signer = Arc::new(LocalKeySigner::from_hex(self.signer_key)?);

        let command_source: Arc<dyn paycmd_core::CommandSource> = match self.source {
            Some(custom) => custom,
            None => source.clone(),
        };
        let audit_sink: Arc<dyn AuditSink> = audit.clone();

        let orchestrator = Orchestrator::new(
            self.config,
            Collaborators {
                store: store.clone(),
                source: command_source,
                signer,
                wallet: wallet.clone(),
                transport: tools.clone(),
                encryption: timelock.clone(),
                audit: audit_sink,
                planner: catalog,
                swap_venue: Some(venue.clone()),
                reflector: self.reflector,
                clock: clock.clone(),
            },
        )?;

        Ok(Harness {
            orchestrator: Arc::new(orchestrator),
            store,
            faults,
            source,
            audit,
            wallet,
            tools,
            venue,
            timelock,
            clock,
        })
    }
}

pub struct Harness {
    pub orchestrator: Arc<Orchestrator>,
    pub store: Arc<dyn CommandStore>,
    pub faults: Arc<FaultyStore>,
    pub source: Arc<MemoryCommandSource>,
    pub audit: Arc<MemoryAuditSink>,
    pub wallet: Arc<FakeWallet>,
    pub tools: Arc<ToolServer>,
    pub venue: Arc<FakeSwapVenue>,
    pub timelock: Arc<FakeTimelock>,
    pub clock: Arc<ManualClock>,
}

impl Harness {
    pub fn builder() -> HarnessBuilder {
        let mut config = OrchestratorConfig::default();
        config.policy.tool_allowlist = ["risk", "kyb", "news"]
            .into_iter()
            .map(str::to_string)
            .collect::<BTreeSet<_>>();
        config.retry = RetryPolicy::immediate(2);
        HarnessBuilder {
            config,
            signer_key: APPROVER_KEY,
            reflector: None,
            source: None,
        }
    }

    pub fn standard() -> anyhow::Result<Self> {
        Self::builder().build()
    }

    pub fn now(&self) -> DateTime<Utc> {
        use paycmd_core::Clock;
        self.clock.now()
    }

    pub fn submit(&self, text: &str) -> anyhow::Result<String> {
        Ok(self.source.push(SCOPE, text)?)
    }

    pub async fn tick(&self) -> anyhow::Result<paycmd_core::TickReport> {
        Ok(self.orchestrator.tick(SCOPE, self.now()).await?)
    }

    pub fn audit_lines(&self) -> anyhow::Result<Vec<String>> {
        Ok(self.audit.lines(SCOPE)?)
    }

    pub async fn receipt_kinds(&self, command_id: &str) -> anyhow::Result<Vec<&'static str>> {
        Ok(self
            .store
            .list_receipts(SCOPE, command_id)
            .await?
            .iter()
            .map(|receipt| receipt.kind.as_str())
            .collect())
    }
}
