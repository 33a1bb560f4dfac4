//! COS disbursement: bank MsgSend from the corporate address.

use std::sync::Arc;

use async_trait::async_trait;
use eyre::Result;
use tokio::sync::Mutex;
use tracing::{error, info};

use crate::chain::{CosClient, TxOutcome};
use crate::config::{COS_DECIMALS, COS_FEE_AMOUNT};
use crate::metrics;
use crate::store::Store;
use crate::types::{to_base_units, Intent, Network};

use super::Dispatcher;

pub struct CosDispatcher {
    client: Arc<CosClient>,
    store: Arc<dyn Store>,
    /// The portal has never deducted the COS fee from payouts; the switch
    /// stays so the deduction can be turned on without a code change.
    deduct_fee: bool,
    /// Serialized per chain: concurrent dispatches would reuse the account
    /// sequence.
    dispatch_lock: Mutex<()>,
}

impl CosDispatcher {
    pub fn new(client: Arc<CosClient>, store: Arc<dyn Store>, deduct_fee: bool) -> Self {
        Self {
            client,
            store,
            deduct_fee,
            dispatch_lock: Mutex::new(()),
        }
    }

    async fn finalize(&self, mut intent: Intent) -> Result<()> {
        intent.mark_completed();
        self.store.update_intent(&intent).await?;
        Ok(())
    }
}

#[async_trait]
impl Dispatcher for CosDispatcher {
    fn network(&self) -> Network {
        Network::Cos
    }

    async fn disburse(&self, mut intent: Intent) -> Result<()> {
        let _serialized = self.dispatch_lock.lock().await;

        info!(
            intent_id = %intent.id,
            to = %intent.to_address,
            amount = %intent.amount,
            "Dispatching COS payout"
        );

        let mut payout = to_base_units(&intent.amount, COS_DECIMALS);
        if self.deduct_fee {
            payout -= to_base_units(&COS_FEE_AMOUNT, COS_DECIMALS);
        }
        let payout: u128 = match payout.to_string().parse() {
            Ok(v) => v,
            Err(e) => {
                error!(intent_id = %intent.id, error = %e, "Invalid payout amount");
                metrics::PAYOUTS.with_label_values(&["cos", "failed"]).inc();
                return self.finalize(intent).await;
            }
        };

        let account = match self.client.account_info().await {
            Ok(account) => account,
            Err(e) => {
                error!(intent_id = %intent.id, error = %e, "Failed to read corporate account state");
                metrics::PAYOUTS.with_label_values(&["cos", "failed"]).inc();
                return self.finalize(intent).await;
            }
        };

        let tx_bytes = match self.client.sign_send(&intent.to_address, payout, &account) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(intent_id = %intent.id, error = %e, "Failed to sign COS payout");
                metrics::PAYOUTS.with_label_values(&["cos", "failed"]).inc();
                return self.finalize(intent).await;
            }
        };

        let tx_hash = match self.client.broadcast(tx_bytes).await {
            Ok(hash) => hash,
            Err(e) => {
                error!(intent_id = %intent.id, error = %e, "Failed to broadcast COS payout");
                metrics::PAYOUTS.with_label_values(&["cos", "failed"]).inc();
                return self.finalize(intent).await;
            }
        };

        intent.destination_tx_hash = Some(tx_hash.clone());
        intent.touch();
        self.store.update_intent(&intent).await?;

        match self.client.await_success(&tx_hash).await {
            Ok(TxOutcome::Success) => {
                intent.destination_completed = true;
                metrics::PAYOUTS.with_label_values(&["cos", "success"]).inc();
                info!(intent_id = %intent.id, tx_hash, "COS payout disbursed");
            }
            Ok(TxOutcome::Failed) => {
                error!(
                    intent_id = %intent.id,
                    tx_hash,
                    "COS payout failed on-chain; operator intervention required"
                );
                metrics::PAYOUTS.with_label_values(&["cos", "failed"]).inc();
            }
            Err(e) => {
                error!(
                    intent_id = %intent.id,
                    tx_hash,
                    error = %e,
                    "COS payout confirmation errored; operator intervention required"
                );
                metrics::PAYOUTS.with_label_values(&["cos", "failed"]).inc();
            }
        }

        self.finalize(intent).await
    }
}
