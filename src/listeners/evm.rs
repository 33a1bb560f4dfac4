//! EVM raw-deposit capture.
//!
//! The token contract's log stream delivers every Transfer, intents or
//! not; only logs whose recipient is the corporate address are swap
//! deposits. Those are staged as raw deposits for the deferred matcher.

use std::sync::Arc;

use eyre::Result;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::metrics;
use crate::store::Store;
use crate::types::{topic_to_address, EvmLogEvent, RawDeposit};

pub struct EvmListener {
    store: Arc<dyn Store>,
    corporate_addr: String,
}

impl EvmListener {
    pub fn new(store: Arc<dyn Store>, corporate_addr: &str) -> Self {
        Self {
            store,
            corporate_addr: corporate_addr.to_lowercase(),
        }
    }

    pub async fn run(self, mut events: mpsc::Receiver<EvmLogEvent>) -> Result<()> {
        while let Some(event) = events.recv().await {
            if let Err(e) = self.handle_log(&event).await {
                error!(
                    tx_hash = %event.tx_hash,
                    block_number = event.block_number,
                    error = %e,
                    "Failed to stage EVM deposit log"
                );
            }
        }
        Ok(())
    }

    pub async fn handle_log(&self, event: &EvmLogEvent) -> Result<()> {
        // Transfer(from, to, value): two indexed address topics expected
        if event.topics.len() < 3 {
            return Ok(());
        }

        let recipient = topic_to_address(&event.topics[2]);
        if recipient != self.corporate_addr {
            debug!(tx_hash = %event.tx_hash, "Transfer is not a swap deposit");
            return Ok(());
        }

        let deposit = RawDeposit {
            block_number: event.block_number as i64,
            tx_hash: event.tx_hash.clone(),
            topics: event.topics.clone(),
            data: event.data.clone(),
            removed: false,
        };

        // Insert absorbs re-observations of the same block after reconnects
        self.store.insert_raw_deposit(&deposit).await?;
        metrics::DEPOSITS_SEEN.with_label_values(&["evm"]).inc();

        info!(
            tx_hash = %event.tx_hash,
            block_number = event.block_number,
            sender = %deposit.sender_address().unwrap_or_default(),
            "Staged EVM deposit"
        );

        Ok(())
    }
}
