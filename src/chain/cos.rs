//! COS chain adapter: Tx event subscription, bank-send signing and
//! broadcast, transaction status polling.
//!
//! The signing key is derived from the corporate mnemonic on the configured
//! coin type and lives inside the client; nothing global.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use bip39::Mnemonic;
use cosmrs::{
    bank::MsgSend,
    bip32::DerivationPath,
    crypto::secp256k1::SigningKey,
    tx::{self, Fee, Msg, SignDoc, SignerInfo},
    AccountId, Coin,
};
use eyre::{eyre, Result, WrapErr};
use futures::StreamExt;
use tendermint_rpc::query::{EventType, Query};
use tendermint_rpc::{Client, HttpClient, SubscriptionClient, WebSocketClient};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::{CosConfig, COS_SEND_FEE_BASE, COS_SEND_GAS_LIMIT, POLL_PERIOD};
use crate::types::CosTxEvent;

use super::TxOutcome;

/// Account state needed to sign: number and sequence.
#[derive(Debug, Clone)]
pub struct AccountInfo {
    pub account_number: u64,
    pub sequence: u64,
}

/// COS node adapter holding the corporate signing key.
pub struct CosClient {
    node_url: String,
    ws_url: String,
    grpc_url: String,
    chain_id: String,
    denom: String,
    corporate_addr: String,
    signing_key: SigningKey,
    address: AccountId,
    rpc: HttpClient,
    http: reqwest::Client,
}

impl CosClient {
    pub fn new(config: &CosConfig) -> Result<Self> {
        let mnemonic = Mnemonic::parse(&config.corporate_mnemonic)
            .map_err(|e| eyre!("Invalid corporate mnemonic: {}", e))?;
        let seed = mnemonic.to_seed("");

        let path: DerivationPath = format!("m/44'/{}'/0'/0/0", config.coin_type)
            .parse()
            .map_err(|e| eyre!("Invalid derivation path: {:?}", e))?;

        let signing_key = SigningKey::derive_from_path(seed, &path)
            .map_err(|e| eyre!("Failed to derive signing key: {}", e))?;

        let address = signing_key
            .public_key()
            .account_id(&config.bech32_prefix)
            .map_err(|e| eyre!("Failed to derive account address: {}", e))?;

        if address.to_string() != config.corporate_addr {
            return Err(eyre!(
                "COS_CORPORATE_MNEMONIC does not control COS_CORPORATE_ADDR (derived {})",
                address
            ));
        }

        let ws_url = websocket_url(&config.node_url);

        let rpc = HttpClient::new(config.node_url.as_str())
            .wrap_err("Failed to build COS RPC client")?;

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .wrap_err("Failed to build HTTP client for COS adapter")?;

        info!(
            corporate_addr = %address,
            chain_id = %config.chain_id,
            denom = %config.denom,
            "COS client initialized"
        );

        Ok(Self {
            node_url: config.node_url.clone(),
            ws_url,
            grpc_url: config.node_grpc_url.clone(),
            chain_id: config.chain_id.clone(),
            denom: config.denom.clone(),
            corporate_addr: config.corporate_addr.clone(),
            signing_key,
            address,
            rpc,
            http,
        })
    }

    /// Subscribe to `Tx` events whose `transfer.recipient` is the corporate
    /// address and push them into the channel. Restartable: a dropped
    /// WebSocket is reopened and resubscribed.
    pub async fn watch_deposits(self: Arc<Self>, events: mpsc::Sender<CosTxEvent>) -> Result<()> {
        let mut consecutive_failures: u32 = 0;

        loop {
            match self.subscribe_once(&events).await {
                // The consumer hung up; shutdown in progress
                Ok(()) => return Ok(()),
                Err(e) => {
                    consecutive_failures += 1;
                    let backoff = Duration::from_secs((2u64).pow(consecutive_failures.min(6)));
                    warn!(
                        error = %e,
                        consecutive_failures,
                        backoff_secs = backoff.as_secs(),
                        "COS subscription dropped, reconnecting"
                    );
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    async fn subscribe_once(&self, events: &mpsc::Sender<CosTxEvent>) -> Result<()> {
        let (client, driver) = WebSocketClient::new(self.ws_url.as_str())
            .await
            .wrap_err("Failed to open COS WebSocket connection")?;
        let driver_handle = tokio::spawn(driver.run());

        let query = Query::from(EventType::Tx).and_eq("transfer.recipient", self.corporate_addr.clone());
        let mut subscription = client
            .subscribe(query.clone())
            .await
            .wrap_err("Failed to subscribe to COS Tx events")?;

        info!(query = %query, "COS subscription established");

        while let Some(item) = subscription.next().await {
            let event = item.wrap_err("COS subscription yielded an error")?;

            let Some(attrs) = event.events else {
                continue;
            };

            let sender = attrs
                .get("message.sender")
                .and_then(|v| v.first())
                .cloned();
            let tx_hash = attrs.get("tx.hash").and_then(|v| v.first()).cloned();
            let transfer_amounts = attrs.get("transfer.amount").cloned().unwrap_or_default();

            let (Some(sender), Some(tx_hash)) = (sender, tx_hash) else {
                debug!("COS event missing sender or tx hash attributes");
                continue;
            };

            let deposit = CosTxEvent {
                sender,
                tx_hash,
                transfer_amounts,
            };

            if events.send(deposit).await.is_err() {
                let _ = client.close();
                driver_handle.abort();
                return Ok(());
            }
        }

        let _ = client.close();
        driver_handle.abort();
        Err(eyre!("COS subscription stream ended"))
    }

    /// Account number and sequence from the auth module's REST endpoint.
    pub async fn account_info(&self) -> Result<AccountInfo> {
        let url = format!(
            "{}/cosmos/auth/v1beta1/accounts/{}",
            self.grpc_url, self.address
        );

        let response = self
            .http
            .get(&url)
            .send()
            .await
            .wrap_err("Failed to query account info")?;

        if !response.status().is_success() {
            return Err(eyre!(
                "Account query failed: {} - {}",
                response.status(),
                response.text().await.unwrap_or_default()
            ));
        }

        let data: serde_json::Value = response.json().await?;
        let account = data
            .get("account")
            .ok_or_else(|| eyre!("Missing 'account' field in response"))?;

        // Some chains nest the fields under base_account
        let sequence = account
            .get("sequence")
            .or_else(|| account.get("base_account").and_then(|b| b.get("sequence")))
            .and_then(|v| v.as_str())
            .unwrap_or("0")
            .parse()
            .unwrap_or(0);

        let account_number = account
            .get("account_number")
            .or_else(|| {
                account
                    .get("base_account")
                    .and_then(|b| b.get("account_number"))
            })
            .and_then(|v| v.as_str())
            .unwrap_or("0")
            .parse()
            .unwrap_or(0);

        Ok(AccountInfo {
            account_number,
            sequence,
        })
    }

    /// Build and sign a bank `MsgSend` of the configured denom from the
    /// corporate address.
    pub fn sign_send(
        &self,
        to: &str,
        amount_base: u128,
        account: &AccountInfo,
    ) -> Result<Vec<u8>> {
        let to_addr = AccountId::from_str(to)
            .map_err(|e| eyre!("Invalid payout recipient address {}: {}", to, e))?;

        let amount = Coin {
            denom: self
                .denom
                .parse()
                .map_err(|e| eyre!("Invalid denom {}: {:?}", self.denom, e))?,
            amount: amount_base,
        };

        let msg = MsgSend {
            from_address: self.address.clone(),
            to_address: to_addr,
            amount: vec![amount],
        };

        let body = tx::Body::new(
            vec![msg
                .to_any()
                .map_err(|e| eyre!("Failed to encode MsgSend: {}", e))?],
            "",
            0u32,
        );

        let signer_info =
            SignerInfo::single_direct(Some(self.signing_key.public_key()), account.sequence);

        let fee = Fee::from_amount_and_gas(
            Coin {
                denom: self
                    .denom
                    .parse()
                    .map_err(|e| eyre!("Invalid denom {}: {:?}", self.denom, e))?,
                amount: COS_SEND_FEE_BASE,
            },
            COS_SEND_GAS_LIMIT,
        );

        let auth_info = signer_info.auth_info(fee);

        let chain_id = self
            .chain_id
            .parse()
            .map_err(|_| eyre!("Invalid chain ID: {}", self.chain_id))?;

        let sign_doc = SignDoc::new(&body, &auth_info, &chain_id, account.account_number)
            .map_err(|e| eyre!("Failed to create sign doc: {}", e))?;

        let tx_raw = sign_doc
            .sign(&self.signing_key)
            .map_err(|e| eyre!("Failed to sign transaction: {}", e))?;

        tx_raw
            .to_bytes()
            .map_err(|e| eyre!("Failed to serialize transaction: {}", e))
    }

    /// Broadcast a signed transaction; returns its hash in hex form.
    pub async fn broadcast(&self, tx_bytes: Vec<u8>) -> Result<String> {
        let response = self
            .rpc
            .broadcast_tx_sync(tx_bytes)
            .await
            .wrap_err("Failed to broadcast COS transaction")?;

        if response.code.is_err() {
            return Err(eyre!(
                "COS broadcast rejected (code {}): {}",
                response.code.value(),
                response.log
            ));
        }

        info!(tx_hash = %response.hash, "COS payout broadcast");
        Ok(response.hash.to_string())
    }

    /// Poll `/tx?hash=` until the transaction resolves. A "tx not found"
    /// error means still pending; success requires no error field and a
    /// `tx_result.log` that mentions emitted events.
    pub async fn await_success(&self, tx_hash: &str) -> Result<TxOutcome> {
        let mut tries: u32 = 0;
        loop {
            tokio::time::sleep(POLL_PERIOD).await;
            tries += 1;

            match self.tx_status(tx_hash).await {
                Ok(CosTxStatus::Success) => {
                    info!(tx_hash, tries, "COS payout confirmed");
                    return Ok(TxOutcome::Success);
                }
                Ok(CosTxStatus::Pending) => {
                    debug!(tx_hash, tries, "COS payout not yet found");
                }
                Ok(CosTxStatus::Failed(reason)) => {
                    warn!(tx_hash, tries, reason, "COS payout failed");
                    return Ok(TxOutcome::Failed);
                }
                Err(e) => {
                    warn!(tx_hash, tries, error = %e, "COS payout status query failed");
                    return Ok(TxOutcome::Failed);
                }
            }
        }
    }

    async fn tx_status(&self, tx_hash: &str) -> Result<CosTxStatus> {
        let hash = if tx_hash.starts_with("0x") {
            tx_hash.to_string()
        } else {
            format!("0x{}", tx_hash)
        };
        let url = format!("{}/tx?hash={}", self.node_url, hash);

        let body: serde_json::Value = self
            .http
            .get(&url)
            .send()
            .await
            .wrap_err("COS tx status request failed")?
            .json()
            .await
            .wrap_err("COS tx status returned non-JSON body")?;

        Ok(classify_tx_response(&body))
    }
}

/// Status of a broadcast COS transaction as reported by the node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CosTxStatus {
    Pending,
    Success,
    Failed(String),
}

/// Classify the raw `/tx?hash=` JSON-RPC response.
pub fn classify_tx_response(body: &serde_json::Value) -> CosTxStatus {
    if let Some(error) = body.get("error") {
        let message = error
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        let data = error.get("data").and_then(|v| v.as_str()).unwrap_or_default();
        if data.contains("not found") {
            return CosTxStatus::Pending;
        }
        return CosTxStatus::Failed(format!("{}: {}", message, data));
    }

    let log = body
        .get("result")
        .and_then(|r| r.get("tx_result"))
        .and_then(|t| t.get("log"))
        .and_then(|l| l.as_str())
        .unwrap_or_default();

    if log.contains("events") {
        CosTxStatus::Success
    } else {
        CosTxStatus::Failed(log.to_string())
    }
}

/// Derive the WebSocket endpoint from the RPC base URL.
fn websocket_url(node_url: &str) -> String {
    let base = node_url.trim_end_matches('/');
    let swapped = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        base.to_string()
    };
    format!("{}/websocket", swapped)
}
