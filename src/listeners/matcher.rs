//! Deferred matching for the EVM → COS direction.
//!
//! EVM deposit logs arrive continuously, and users may send the on-chain
//! transaction before registering the intent, so correlation runs on a
//! timer: each tick takes one queued intent and scans the staged raw
//! deposits for a sender/amount match.

use std::sync::Arc;

use bigdecimal::BigDecimal;
use eyre::Result;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tracing::{debug, error, info, warn};

use crate::chain::evm::decode_transfer_amount;
use crate::config::{BLACKLIST_THRESHOLD_AMOUNT, MATCH_PERIOD, MAX_TRIES};
use crate::dispatch::Dispatcher;
use crate::metrics;
use crate::store::{IntentFilter, Store};
use crate::types::{Intent, MatchResult, Network, RawDeposit};

pub struct DeferredMatcher {
    store: Arc<dyn Store>,
    /// Payout capability on the opposite chain.
    dispatcher: Arc<dyn Dispatcher>,
    corporate_addr: String,
    queue_rx: mpsc::Receiver<Intent>,
    /// Used to re-enqueue intents that found no match this pass.
    queue_tx: mpsc::Sender<Intent>,
}

impl DeferredMatcher {
    pub fn new(
        store: Arc<dyn Store>,
        dispatcher: Arc<dyn Dispatcher>,
        corporate_addr: &str,
        queue_rx: mpsc::Receiver<Intent>,
        queue_tx: mpsc::Sender<Intent>,
    ) -> Self {
        Self {
            store,
            dispatcher,
            corporate_addr: corporate_addr.to_lowercase(),
            queue_rx,
            queue_tx,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        let mut ticker = tokio::time::interval(MATCH_PERIOD);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            let intent = match self.queue_rx.try_recv() {
                Ok(intent) => {
                    metrics::MATCH_QUEUE_DEPTH.dec();
                    intent
                }
                Err(TryRecvError::Empty) => continue,
                Err(TryRecvError::Disconnected) => return Ok(()),
            };

            if let Err(e) = self.match_pass(intent).await {
                error!(error = %e, "Deferred matching pass failed");
            }
        }
    }

    /// One matching pass over a single queued intent.
    pub async fn match_pass(&self, mut intent: Intent) -> Result<()> {
        debug!(
            intent_id = %intent.id,
            try_count = intent.try_count,
            "Scanning staged deposits for intent"
        );

        let mut matched = false;
        for raw in self.store.pending_raw_deposits().await? {
            let amount = match decode_transfer_amount(&raw.data) {
                Ok(amount) => amount,
                Err(e) => {
                    warn!(
                        block_number = raw.block_number,
                        error = %e,
                        "Unparseable staged deposit; skipping"
                    );
                    continue;
                }
            };
            let Some(sender) = raw.sender_address() else {
                continue;
            };

            if !sender.eq_ignore_ascii_case(&intent.from_address) || amount != intent.amount {
                continue;
            }

            match self.process_deposit(&intent, &raw, &sender, &amount).await? {
                MatchResult::Matched | MatchResult::Blacklisted => {
                    let mut consumed = raw.clone();
                    consumed.removed = true;
                    self.store.update_raw_deposit(&consumed).await?;
                    matched = true;
                    break;
                }
                MatchResult::SelfDeposit | MatchResult::NoMatch => continue,
            }
        }

        intent.try_count += 1;

        if intent.try_count >= MAX_TRIES {
            self.abandon(&intent).await?;
            return Ok(());
        }

        if !matched {
            debug!(
                intent_id = %intent.id,
                try_count = intent.try_count,
                "No deposit matched; re-enqueueing intent"
            );
            match self.queue_tx.try_send(intent) {
                Ok(()) => metrics::MATCH_QUEUE_DEPTH.inc(),
                Err(e) => warn!(error = %e, "Failed to re-enqueue intent for matching"),
            }
        }

        Ok(())
    }

    /// Correlate one candidate deposit with the queued intent. The store
    /// copy of the intent is re-read through the admission-precise filter
    /// so a concurrently completed intent is never resurrected.
    async fn process_deposit(
        &self,
        queued: &Intent,
        raw: &RawDeposit,
        sender: &str,
        amount: &BigDecimal,
    ) -> Result<MatchResult> {
        // The contract also emits Transfer for outbound payouts of the
        // COS → EVM direction; those must not be matched as deposits.
        if sender.eq_ignore_ascii_case(&self.corporate_addr) {
            info!(
                tx_hash = %raw.tx_hash,
                amount = %amount,
                "Outbound payout leg observed; not a user deposit"
            );
            return Ok(MatchResult::SelfDeposit);
        }

        let blacklisted = self.store.find_blacklist(sender).await?.is_some();
        let over_threshold = blacklisted && amount >= &*BLACKLIST_THRESHOLD_AMOUNT;

        let open = self
            .store
            .find_intent(
                &IntentFilter::new()
                    .from_address(sender)
                    .to_address(&queued.to_address)
                    .source_network(Network::Evm)
                    .destination_network(Network::Cos)
                    .source_completed(false)
                    .destination_completed(false)
                    .created_at(queued.created_at)
                    .amount(amount.clone()),
            )
            .await?;

        let Some(mut intent) = open else {
            return Ok(MatchResult::NoMatch);
        };

        intent.mark_source_completed(&raw.tx_hash);

        if over_threshold {
            warn!(
                intent_id = %intent.id,
                sender,
                amount = %amount,
                "Blacklisted sender at or above threshold; closing intent without payout"
            );
            intent.mark_completed();
            self.store.update_intent(&intent).await?;
            return Ok(MatchResult::Blacklisted);
        }

        self.store.update_intent(&intent).await?;
        info!(
            intent_id = %intent.id,
            tx_hash = %raw.tx_hash,
            "EVM deposit matched; dispatching COS payout"
        );

        self.dispatcher.disburse(intent).await?;
        Ok(MatchResult::Matched)
    }

    /// Abandonment after the final pass: the stored intent is located with
    /// the same precise filter admission wrote it under and closed.
    async fn abandon(&self, intent: &Intent) -> Result<()> {
        warn!(
            intent_id = %intent.id,
            try_count = intent.try_count,
            "No deposit arrived within the matching window; abandoning intent"
        );

        let open = self
            .store
            .find_intent(
                &IntentFilter::new()
                    .from_address(&intent.from_address)
                    .to_address(&intent.to_address)
                    .source_network(Network::Evm)
                    .destination_network(Network::Cos)
                    .source_completed(false)
                    .destination_completed(false)
                    .created_at(intent.created_at)
                    .amount(intent.amount.clone()),
            )
            .await?;

        if let Some(mut stale) = open {
            stale.mark_completed();
            self.store.update_intent(&stale).await?;
            metrics::INTENTS_ABANDONED.inc();
        }

        Ok(())
    }
}
