//! EVM disbursement: ERC-20 transfer from the corporate address, with the
//! stale-nonce collision check before broadcast.

use std::str::FromStr;
use std::sync::Arc;

use alloy::primitives::U256;
use async_trait::async_trait;
use eyre::Result;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::chain::{EvmClient, TxOutcome};
use crate::config::{EVM_DECIMALS, EVM_FEE_AMOUNT};
use crate::metrics;
use crate::store::{IntentFilter, Store, StoreError};
use crate::types::{to_base_units, Intent, Network};

use super::Dispatcher;

/// Whether a prior payout from this sender's intents already recorded the
/// exact tx hash just signed. A hit means the pending nonce was stale and
/// broadcasting would replay an earlier payout.
pub async fn stale_nonce_collision(
    store: &dyn Store,
    from_address: &str,
    tx_hash: &str,
) -> Result<bool, StoreError> {
    let prior = store
        .find_intent(
            &IntentFilter::new()
                .from_address(from_address)
                .source_completed(true)
                .destination_tx_hash(tx_hash)
                .destination_completed(true),
        )
        .await?;
    Ok(prior.is_some())
}

pub struct EvmDispatcher {
    client: Arc<EvmClient>,
    store: Arc<dyn Store>,
    /// Payouts are serialized per chain: two concurrent dispatches would
    /// read the same pending nonce and sign colliding transactions.
    dispatch_lock: Mutex<()>,
}

impl EvmDispatcher {
    pub fn new(client: Arc<EvmClient>, store: Arc<dyn Store>) -> Self {
        Self {
            client,
            store,
            dispatch_lock: Mutex::new(()),
        }
    }

    /// Terminal update shared by every exit path.
    async fn finalize(&self, mut intent: Intent) -> Result<()> {
        intent.mark_completed();
        self.store.update_intent(&intent).await?;
        Ok(())
    }
}

#[async_trait]
impl Dispatcher for EvmDispatcher {
    fn network(&self) -> Network {
        Network::Evm
    }

    async fn disburse(&self, mut intent: Intent) -> Result<()> {
        let _serialized = self.dispatch_lock.lock().await;

        info!(
            intent_id = %intent.id,
            to = %intent.to_address,
            amount = %intent.amount,
            "Dispatching EVM payout"
        );

        // Payout is the user amount minus the EVM-side fee, in base units
        let payout =
            to_base_units(&intent.amount, EVM_DECIMALS) - to_base_units(&EVM_FEE_AMOUNT, EVM_DECIMALS);
        let payout = match U256::from_str(&payout.to_string()) {
            Ok(v) => v,
            Err(e) => {
                error!(intent_id = %intent.id, error = %e, "Invalid payout amount");
                metrics::PAYOUTS.with_label_values(&["evm", "failed"]).inc();
                return self.finalize(intent).await;
            }
        };

        let signed = match self.client.sign_transfer(&intent.to_address, payout).await {
            Ok(signed) => signed,
            Err(e) => {
                error!(intent_id = %intent.id, error = %e, "Failed to sign EVM payout");
                metrics::PAYOUTS.with_label_values(&["evm", "failed"]).inc();
                return self.finalize(intent).await;
            }
        };

        // The pending nonce can be stale; a replayed nonce reproduces a
        // prior payout's tx hash. Abort rather than double-pay.
        if stale_nonce_collision(self.store.as_ref(), &intent.from_address, &signed.tx_hash).await? {
            warn!(
                intent_id = %intent.id,
                tx_hash = %signed.tx_hash,
                "Signed payout reproduces an earlier payout hash; stale nonce, aborting"
            );
            metrics::PAYOUTS.with_label_values(&["evm", "skipped"]).inc();
            return self.finalize(intent).await;
        }

        if let Err(e) = self.client.broadcast(&signed).await {
            error!(intent_id = %intent.id, error = %e, "Failed to broadcast EVM payout");
            metrics::PAYOUTS.with_label_values(&["evm", "failed"]).inc();
            return self.finalize(intent).await;
        }

        intent.destination_tx_hash = Some(signed.tx_hash.clone());
        intent.touch();
        self.store.update_intent(&intent).await?;

        match self.client.await_success(&signed.tx_hash).await {
            Ok(TxOutcome::Success) => {
                intent.destination_completed = true;
                metrics::PAYOUTS.with_label_values(&["evm", "success"]).inc();
                info!(
                    intent_id = %intent.id,
                    tx_hash = %signed.tx_hash,
                    "EVM payout disbursed"
                );
            }
            Ok(TxOutcome::Failed) => {
                error!(
                    intent_id = %intent.id,
                    tx_hash = %signed.tx_hash,
                    "EVM payout failed on-chain; operator intervention required"
                );
                metrics::PAYOUTS.with_label_values(&["evm", "failed"]).inc();
            }
            Err(e) => {
                error!(
                    intent_id = %intent.id,
                    tx_hash = %signed.tx_hash,
                    error = %e,
                    "EVM payout confirmation errored; operator intervention required"
                );
                metrics::PAYOUTS.with_label_values(&["evm", "failed"]).inc();
            }
        }

        self.finalize(intent).await
    }
}
