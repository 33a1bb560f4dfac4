//! COS → EVM direction: consume recipient-scoped Tx events and dispatch
//! EVM payouts.
//!
//! The subscription query is narrow enough that every event can be
//! correlated immediately; there is no staging table on this side.

use std::str::FromStr;
use std::sync::Arc;

use bigdecimal::num_bigint::BigInt;
use eyre::Result;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::{BLACKLIST_THRESHOLD_AMOUNT, COS_DECIMALS};
use crate::dispatch::Dispatcher;
use crate::metrics;
use crate::store::{IntentFilter, Store};
use crate::types::{from_base_units, CosTxEvent, Network};

pub struct CosListener {
    store: Arc<dyn Store>,
    /// Payout capability on the opposite chain.
    dispatcher: Arc<dyn Dispatcher>,
    denom: String,
}

impl CosListener {
    pub fn new(store: Arc<dyn Store>, dispatcher: Arc<dyn Dispatcher>, denom: &str) -> Self {
        Self {
            store,
            dispatcher,
            denom: denom.to_string(),
        }
    }

    /// Consume events in arrival order. Dispatch is synchronous: a payout
    /// completes before the next event is processed.
    pub async fn run(self, mut events: mpsc::Receiver<CosTxEvent>) -> Result<()> {
        while let Some(event) = events.recv().await {
            if let Err(e) = self.handle_event(&event).await {
                error!(
                    tx_hash = %event.tx_hash,
                    sender = %event.sender,
                    error = %e,
                    "Failed to process COS deposit event"
                );
            }
        }
        Ok(())
    }

    pub async fn handle_event(&self, event: &CosTxEvent) -> Result<()> {
        // A deposit Tx carries two transfer.amount entries: the fee first,
        // then the gross transfer. Single-entry events are informational.
        if event.transfer_amounts.len() < 2 {
            debug!(tx_hash = %event.tx_hash, "COS event has no fee entry; ignoring");
            return Ok(());
        }

        let gross = event.transfer_amounts[1].replace(&self.denom, "");
        let raw = match BigInt::from_str(&gross) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(
                    tx_hash = %event.tx_hash,
                    amount = %event.transfer_amounts[1],
                    error = %e,
                    "Unparseable COS transfer amount"
                );
                return Ok(());
            }
        };
        let amount = from_base_units(raw, COS_DECIMALS);

        metrics::DEPOSITS_SEEN.with_label_values(&["cos"]).inc();

        let blacklisted = self.store.find_blacklist(&event.sender).await?.is_some();
        let over_threshold = blacklisted && amount >= *BLACKLIST_THRESHOLD_AMOUNT;

        let open = self
            .store
            .find_intent(
                &IntentFilter::new()
                    .from_address(&event.sender)
                    .source_network(Network::Cos)
                    .destination_network(Network::Evm)
                    .source_completed(false)
                    .destination_completed(false)
                    .amount(amount.clone()),
            )
            .await?;

        let Some(mut intent) = open else {
            // Deposit without a registered intent; funds sit with the
            // corporate address until the operator sorts it out
            info!(
                sender = %event.sender,
                amount = %amount,
                tx_hash = %event.tx_hash,
                "COS deposit has no open intent; dropping"
            );
            return Ok(());
        };

        intent.mark_source_completed(&event.tx_hash);

        if over_threshold {
            warn!(
                intent_id = %intent.id,
                sender = %event.sender,
                amount = %amount,
                "Blacklisted sender at or above threshold; closing intent without payout"
            );
            intent.mark_completed();
            self.store.update_intent(&intent).await?;
            return Ok(());
        }

        self.store.update_intent(&intent).await?;
        info!(
            intent_id = %intent.id,
            tx_hash = %event.tx_hash,
            "COS deposit matched; dispatching EVM payout"
        );

        self.dispatcher.disburse(intent).await
    }
}
