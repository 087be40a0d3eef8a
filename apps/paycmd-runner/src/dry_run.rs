//! Settlement stand-ins for running the orchestrator without moving funds.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use paycmd_core::{
    CapabilityError, Confirmation, ConfirmationStatus, EncryptionAuthority, SwapOrder, SwapVenue,
    Wallet,
};
use tokio::sync::Mutex;
use uuid::Uuid;

fn dry_run_reference(kind: &str) -> String {
    format!("dryrun_{kind}_{}", Uuid::now_v7().simple())
}

#[derive(Debug, Default)]
pub struct DryRunWallet;

#[async_trait]
impl Wallet for DryRunWallet {
    async fn transfer(
        &self,
        to: &str,
        token: &str,
        amount_units: u64,
    ) -> Result<String, CapabilityError> {
        let tx_reference = dry_run_reference("transfer");
        tracing::info!(to, token, amount_units, tx_reference = %tx_reference, "dry-run transfer");
        Ok(tx_reference)
    }

    async fn wait_for_confirmation(
        &self,
        tx_reference: &str,
    ) -> Result<Confirmation, CapabilityError> {
        Ok(Confirmation {
            status: ConfirmationStatus::Confirmed,
            block_ref: Some(format!("dryrun_block_{tx_reference}")),
            confirmations: 0,
        })
    }
}

#[derive(Debug, Default)]
pub struct DryRunSwapVenue;

#[async_trait]
impl SwapVenue for DryRunSwapVenue {
    async fn swap(&self, order: &SwapOrder) -> Result<String, CapabilityError> {
        let tx_reference = dry_run_reference("swap");
        tracing::info!(
            token_in = %order.token_in,
            token_out = %order.token_out,
            amount_units = order.amount_units,
            slippage_bps = order.slippage_bps,
            tx_reference = %tx_reference,
            "dry-run swap"
        );
        Ok(tx_reference)
    }
}

struct HeldPayload {
    payload: String,
    unlock_at: DateTime<Utc>,
}

/// Holds payloads in memory and releases each one once its unlock time has passed.
#[derive(Default)]
pub struct DryRunTimelock {
    sealed: Mutex<HashMap<String, HeldPayload>>,
    submitted: Mutex<HashMap<String, String>>,
}

#[async_trait]
impl EncryptionAuthority for DryRunTimelock {
    async fn encrypt(
        &self,
        payload: &str,
        unlock_at: DateTime<Utc>,
    ) -> Result<String, CapabilityError> {
        let handle = dry_run_reference("sealed");
        self.sealed.lock().await.insert(
            handle.clone(),
            HeldPayload {
                payload: payload.to_string(),
                unlock_at,
            },
        );
        Ok(handle)
    }

    async fn submit(&self, encrypted_payload: &str) -> Result<String, CapabilityError> {
        if !self.sealed.lock().await.contains_key(encrypted_payload) {
            return Err(CapabilityError::Rejected(format!(
                "unknown sealed payload {encrypted_payload}"
            )));
        }
        let tx_reference = dry_run_reference("conditional");
        self.submitted
            .lock()
            .await
            .insert(tx_reference.clone(), encrypted_payload.to_string());
        Ok(tx_reference)
    }

    async fn fetch_decrypted(
        &self,
        tx_reference: &str,
    ) -> Result<Option<String>, CapabilityError> {
        let Some(handle) = self.submitted.lock().await.get(tx_reference).cloned() else {
            return Err(CapabilityError::Rejected(format!(
                "unknown conditional tx {tx_reference}"
            )));
        };
        let sealed = self.sealed.lock().await;
        Ok(sealed
            .get(&handle)
            .filter(|held| held.unlock_at <= Utc::now())
            .map(|held| held.payload.clone()))
    }
}
