//! Intent admission: validates transfer requests, enforces the
//! one-in-flight-per-sender rule and hands EVM-sourced intents to the
//! deferred matcher.

use std::str::FromStr;
use std::sync::Arc;

use bigdecimal::BigDecimal;
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::{fee_for, TIMEOUT_MINUTES};
use crate::metrics;
use crate::store::{IntentFilter, Store, StoreError};
use crate::types::{fractional_digits, now, Intent, Network};

lazy_static! {
    static ref EVM_ADDRESS_RE: Regex =
        Regex::new("^0x[0-9a-fA-F]{40}$").expect("constant regex is valid");
}

/// A transfer request as posted to the API.
#[derive(Debug, Clone, Deserialize)]
pub struct IntentRequest {
    pub from_address: String,
    pub from_network: String,
    pub to_address: String,
    pub to_network: String,
    pub amount: f64,
}

#[derive(Debug, Error)]
pub enum AdmitError {
    #[error("unknown network: {0}")]
    UnknownNetwork(String),
    #[error("source and destination networks must differ")]
    SameNetwork,
    #[error("not a valid {network} address: {address}")]
    InvalidAddress { network: Network, address: String },
    #[error("the {0} amount has to be less than 5 decimals like 0.00001")]
    TooManyDecimals(Network),
    #[error("invalid amount")]
    InvalidAmount,
    #[error("transaction fee {fee} is bigger than {amount}")]
    FeeExceedsAmount { fee: BigDecimal, amount: BigDecimal },
    #[error("previous intent still active; remaining = {0:.2} minutes")]
    PreviousActive(f64),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Admission gate in front of the intent ledger.
pub struct IntentAdmit {
    store: Arc<dyn Store>,
    matcher_queue: mpsc::Sender<Intent>,
    cos_address_re: Regex,
}

impl IntentAdmit {
    pub fn new(
        store: Arc<dyn Store>,
        matcher_queue: mpsc::Sender<Intent>,
        cos_bech32_prefix: &str,
    ) -> eyre::Result<Self> {
        let cos_address_re = Regex::new(&format!("^{}1[0-9a-zA-Z]{{38}}$", cos_bech32_prefix))
            .map_err(|e| eyre::eyre!("Invalid COS address pattern: {}", e))?;
        Ok(Self {
            store,
            matcher_queue,
            cos_address_re,
        })
    }

    /// Whether an address is syntactically valid on either chain. Used by
    /// the blacklist endpoint.
    pub fn is_valid_address(&self, address: &str) -> bool {
        EVM_ADDRESS_RE.is_match(address) || self.cos_address_re.is_match(address)
    }

    fn validate_address(&self, network: Network, address: &str) -> Result<(), AdmitError> {
        let valid = match network {
            Network::Evm => EVM_ADDRESS_RE.is_match(address),
            Network::Cos => self.cos_address_re.is_match(address),
        };
        if valid {
            Ok(())
        } else {
            Err(AdmitError::InvalidAddress {
                network,
                address: address.to_string(),
            })
        }
    }

    /// Validate and persist a new intent.
    pub async fn admit(&self, request: &IntentRequest) -> Result<Intent, AdmitError> {
        let source_network = Network::from_str(&request.from_network)
            .map_err(|_| AdmitError::UnknownNetwork(request.from_network.clone()))?;
        let destination_network = Network::from_str(&request.to_network)
            .map_err(|_| AdmitError::UnknownNetwork(request.to_network.clone()))?;
        if source_network == destination_network {
            return Err(AdmitError::SameNetwork);
        }

        // Users submit amounts as JSON numbers; the shortest decimal
        // rendering is what the 5-digit rule is counted against.
        if !request.amount.is_finite() || request.amount <= 0.0 {
            return Err(AdmitError::InvalidAmount);
        }
        let amount = BigDecimal::from_str(&format!("{}", request.amount))
            .map_err(|_| AdmitError::InvalidAmount)?;

        if fractional_digits(&amount) > 5 {
            return Err(AdmitError::TooManyDecimals(source_network));
        }

        let fee = fee_for(destination_network);
        if fee >= amount {
            return Err(AdmitError::FeeExceedsAmount { fee, amount });
        }

        self.validate_address(source_network, &request.from_address)?;
        self.validate_address(destination_network, &request.to_address)?;

        self.enforce_one_in_flight(&request.from_address).await?;

        let intent = Intent::new(
            request.from_address.clone(),
            request.to_address.clone(),
            source_network,
            destination_network,
            amount,
        );
        self.store.insert_intent(&intent).await?;
        metrics::INTENTS_ADMITTED.inc();

        info!(
            intent_id = %intent.id,
            from = %intent.from_address,
            source = %intent.source_network,
            destination = %intent.destination_network,
            amount = %intent.amount,
            "Intent admitted"
        );

        // EVM deposits may land before the intent exists; matching is
        // deferred. The offer must not block the admission path.
        if intent.source_network == Network::Evm {
            match self.matcher_queue.try_send(intent.clone()) {
                Ok(()) => metrics::MATCH_QUEUE_DEPTH.inc(),
                Err(e) => warn!(
                    intent_id = %intent.id,
                    error = %e,
                    "Deferred matcher queue is full; intent will only abandon by timeout sweep"
                ),
            }
        }

        Ok(intent)
    }

    /// At most one open intent per sender. A prior open intent inside the
    /// timeout window rejects the new one; past the window it is swept as
    /// abandoned and admission continues.
    async fn enforce_one_in_flight(&self, from_address: &str) -> Result<(), AdmitError> {
        let open = self
            .store
            .find_intent(
                &IntentFilter::new()
                    .from_address(from_address)
                    .completed(false),
            )
            .await?;

        let Some(mut prior) = open else {
            return Ok(());
        };

        prior.touch();
        self.store.update_intent(&prior).await?;

        let expires_at = prior.created_at + chrono::Duration::minutes(TIMEOUT_MINUTES);
        let remaining = expires_at - now();
        let remaining_minutes = remaining.num_milliseconds() as f64 / 60_000.0;

        if remaining_minutes > 0.0 {
            return Err(AdmitError::PreviousActive(remaining_minutes));
        }

        info!(
            intent_id = %prior.id,
            from = %prior.from_address,
            "Timeout elapsed on prior open intent; sweeping as abandoned"
        );
        prior.mark_completed();
        self.store.update_intent(&prior).await?;
        metrics::INTENTS_ABANDONED.inc();

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemStore;

    fn admit_with_store() -> (IntentAdmit, Arc<MemStore>, mpsc::Receiver<Intent>) {
        let store = Arc::new(MemStore::new());
        let (tx, rx) = mpsc::channel(8);
        let admit = IntentAdmit::new(store.clone(), tx, "darc").unwrap();
        (admit, store, rx)
    }

    fn evm_to_cos(amount: f64) -> IntentRequest {
        IntentRequest {
            from_address: "0x1111111111111111111111111111111111111111".into(),
            from_network: "evm".into(),
            to_address: "darc1qqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqq".into(),
            to_network: "cos".into(),
            amount,
        }
    }

    fn cos_to_evm(amount: f64) -> IntentRequest {
        IntentRequest {
            from_address: "darc1qqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqq".into(),
            from_network: "cos".into(),
            to_address: "0x1111111111111111111111111111111111111111".into(),
            to_network: "evm".into(),
            amount,
        }
    }

    #[tokio::test]
    async fn test_admits_valid_request_and_enqueues_evm_source() {
        let (admit, store, mut rx) = admit_with_store();
        let intent = admit.admit(&evm_to_cos(1.5)).await.unwrap();

        assert_eq!(intent.source_network, Network::Evm);
        assert!(store.get_intent(&intent.id).await.unwrap().is_some());

        let queued = rx.try_recv().unwrap();
        assert_eq!(queued.id, intent.id);
    }

    #[tokio::test]
    async fn test_cos_source_is_not_enqueued() {
        let (admit, _store, mut rx) = admit_with_store();
        admit.admit(&cos_to_evm(5.0)).await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_rejects_six_fractional_digits() {
        let (admit, _store, _rx) = admit_with_store();
        let err = admit.admit(&evm_to_cos(0.123456)).await.unwrap_err();
        assert!(matches!(err, AdmitError::TooManyDecimals(_)));
    }

    #[tokio::test]
    async fn test_accepts_five_fractional_digits() {
        let (admit, _store, _rx) = admit_with_store();
        // 0.00001 is not exactly representable as f64; the shortest
        // rendering still counts as 5 digits
        assert!(admit.admit(&cos_to_evm(3.00001)).await.is_ok());
    }

    #[tokio::test]
    async fn test_rejects_fee_at_or_above_amount() {
        let (admit, _store, _rx) = admit_with_store();
        // EVM-bound fee is 2 user units
        let err = admit.admit(&cos_to_evm(2.0)).await.unwrap_err();
        assert!(matches!(err, AdmitError::FeeExceedsAmount { .. }));
        assert!(admit.admit(&cos_to_evm(2.5)).await.is_ok());
    }

    #[tokio::test]
    async fn test_rejects_same_network() {
        let (admit, _store, _rx) = admit_with_store();
        let mut request = evm_to_cos(1.5);
        request.to_network = "evm".into();
        request.to_address = "0x2222222222222222222222222222222222222222".into();
        let err = admit.admit(&request).await.unwrap_err();
        assert!(matches!(err, AdmitError::SameNetwork));
    }

    #[tokio::test]
    async fn test_rejects_malformed_addresses() {
        let (admit, _store, _rx) = admit_with_store();

        let mut request = evm_to_cos(1.5);
        request.from_address = "0x123".into();
        assert!(matches!(
            admit.admit(&request).await.unwrap_err(),
            AdmitError::InvalidAddress { .. }
        ));

        let mut request = evm_to_cos(1.5);
        request.to_address = "cosmos1qqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqq".into();
        assert!(matches!(
            admit.admit(&request).await.unwrap_err(),
            AdmitError::InvalidAddress { .. }
        ));
    }

    #[tokio::test]
    async fn test_one_in_flight_rejects_within_window() {
        let (admit, _store, _rx) = admit_with_store();
        admit.admit(&evm_to_cos(1.5)).await.unwrap();

        let err = admit.admit(&evm_to_cos(2.5)).await.unwrap_err();
        match err {
            AdmitError::PreviousActive(remaining) => {
                assert!(remaining > 2.5 && remaining <= 3.0, "remaining = {remaining}");
            }
            other => panic!("expected PreviousActive, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_timeout_sweep_closes_stale_intent() {
        let (admit, store, _rx) = admit_with_store();
        let first = admit.admit(&evm_to_cos(1.5)).await.unwrap();

        // Age the first intent past the timeout window
        let mut stale = store.get_intent(&first.id).await.unwrap().unwrap();
        stale.created_at = stale.created_at - chrono::Duration::minutes(TIMEOUT_MINUTES + 1);
        store.update_intent(&stale).await.unwrap();

        let second = admit.admit(&evm_to_cos(2.5)).await.unwrap();
        assert_ne!(second.id, first.id);

        let swept = store.get_intent(&first.id).await.unwrap().unwrap();
        assert!(swept.completed);
        assert!(!swept.destination_completed);
    }

    #[tokio::test]
    async fn test_admission_allowed_after_completion() {
        let (admit, store, _rx) = admit_with_store();
        let first = admit.admit(&evm_to_cos(1.5)).await.unwrap();

        let mut done = store.get_intent(&first.id).await.unwrap().unwrap();
        done.mark_completed();
        store.update_intent(&done).await.unwrap();

        assert!(admit.admit(&evm_to_cos(2.5)).await.is_ok());
    }
}
