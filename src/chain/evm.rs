//! EVM chain adapter: token-contract log watching, payout signing and
//! broadcast, receipt polling.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use alloy::consensus::{SignableTransaction, TxEnvelope, TxLegacy};
use alloy::eips::eip2718::Encodable2718;
use alloy::network::TxSignerSync;
use alloy::primitives::{Address, TxKind, B256, U256};
use alloy::providers::{Provider, ProviderBuilder, RootProvider};
use alloy::rpc::types::Filter;
use alloy::signers::local::PrivateKeySigner;
use alloy::sol;
use alloy::sol_types::{SolCall, SolEvent};
use alloy::transports::http::{Client, Http};
use bigdecimal::num_bigint::BigInt;
use bigdecimal::BigDecimal;
use eyre::{eyre, Result, WrapErr};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::{EvmConfig, EVM_DECIMALS, EVM_TRANSFER_GAS_LIMIT, POLL_PERIOD};
use crate::types::{from_base_units, EvmLogEvent};

use super::TxOutcome;

sol! {
    /// Standard fungible-token surface the portal relies on.
    contract Erc20Token {
        function transfer(address to, uint256 amount) external returns (bool);
        event Transfer(address indexed from, address indexed to, uint256 value);
    }
}

/// A payout transaction signed but not yet broadcast. The hash is known
/// up front so the dispatcher can run its stale-nonce check first.
#[derive(Debug, Clone)]
pub struct SignedTransfer {
    pub tx_hash: String,
    pub raw: Vec<u8>,
}

/// EVM node adapter holding the corporate signing key.
pub struct EvmClient {
    provider: RootProvider<Http<Client>>,
    signer: PrivateKeySigner,
    chain_id: u64,
    token_contract: Address,
    corporate_addr: Address,
    receipt_api_url: Option<String>,
    http: reqwest::Client,
}

impl EvmClient {
    pub fn new(config: &EvmConfig) -> Result<Self> {
        let url = config.node_url.parse().wrap_err("Failed to parse EVM node URL")?;
        let provider = ProviderBuilder::new().on_http(url);

        let token_contract =
            Address::from_str(&config.token_contract).wrap_err("Invalid token contract address")?;
        let corporate_addr =
            Address::from_str(&config.corporate_addr).wrap_err("Invalid corporate address")?;

        let signer: PrivateKeySigner = config
            .corporate_priv_key
            .parse()
            .wrap_err("Invalid corporate private key")?;

        if signer.address() != corporate_addr {
            return Err(eyre!(
                "EVM_CORPORATE_PRIV_KEY does not control EVM_CORPORATE_ADDR (key address {})",
                signer.address()
            ));
        }

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .wrap_err("Failed to build HTTP client for EVM adapter")?;

        info!(
            corporate_addr = %corporate_addr,
            token_contract = %token_contract,
            chain_id = config.chain_id,
            "EVM client initialized"
        );

        Ok(Self {
            provider,
            signer,
            chain_id: config.chain_id,
            token_contract,
            corporate_addr,
            receipt_api_url: config.receipt_api_url.clone(),
            http,
        })
    }

    pub fn corporate_address(&self) -> Address {
        self.corporate_addr
    }

    /// Push every confirmed `Transfer` log of the token contract into the
    /// channel. Restartable: transient node failures back off and resume
    /// from the last delivered block, so duplicates are possible and the
    /// consumer deduplicates.
    pub async fn watch_deposits(
        self: Arc<Self>,
        events: mpsc::Sender<EvmLogEvent>,
    ) -> Result<()> {
        let poll_interval = Duration::from_millis(1000);
        let transfer_topic = Erc20Token::Transfer::SIGNATURE_HASH;
        let mut cursor: Option<u64> = None;
        let mut consecutive_failures: u32 = 0;

        loop {
            let head = match self.provider.get_block_number().await {
                Ok(h) => {
                    consecutive_failures = 0;
                    h
                }
                Err(e) => {
                    consecutive_failures += 1;
                    let backoff = Duration::from_secs((2u64).pow(consecutive_failures.min(6)));
                    warn!(
                        error = %e,
                        consecutive_failures,
                        backoff_secs = backoff.as_secs(),
                        "Failed to get EVM block number, will retry"
                    );
                    tokio::time::sleep(backoff).await;
                    continue;
                }
            };

            let from_block = match cursor {
                // Deposits sent before the portal started are not replayed
                None => {
                    cursor = Some(head);
                    tokio::time::sleep(poll_interval).await;
                    continue;
                }
                Some(last) if head <= last => {
                    tokio::time::sleep(poll_interval).await;
                    continue;
                }
                Some(last) => last + 1,
            };

            let filter = Filter::new()
                .address(self.token_contract)
                .from_block(from_block)
                .to_block(head);

            let logs = match self.provider.get_logs(&filter).await {
                Ok(logs) => logs,
                Err(e) => {
                    warn!(
                        from_block,
                        to_block = head,
                        error = %e,
                        "Failed to fetch EVM logs, will retry range"
                    );
                    tokio::time::sleep(poll_interval).await;
                    continue;
                }
            };

            for log in logs {
                let topics = log.topics();
                if topics.is_empty() || topics[0] != transfer_topic {
                    continue;
                }

                let (Some(block_number), Some(tx_hash)) =
                    (log.block_number, log.transaction_hash)
                else {
                    debug!("Skipping pending EVM log without block metadata");
                    continue;
                };

                let event = EvmLogEvent {
                    block_number,
                    tx_hash: format!("{:?}", tx_hash),
                    topics: topics.iter().map(|t| format!("{:?}", t)).collect(),
                    data: log.data().data.to_vec(),
                };

                if events.send(event).await.is_err() {
                    // Consumer is gone; the process is shutting down
                    return Ok(());
                }
            }

            cursor = Some(head);
            tokio::time::sleep(poll_interval).await;
        }
    }

    /// Build and sign an ERC-20 `transfer(to, amount)` payout with the
    /// node's pending nonce and suggested gas price. Broadcast is a
    /// separate step so the caller can inspect the tx hash first.
    pub async fn sign_transfer(&self, to: &str, amount_base: U256) -> Result<SignedTransfer> {
        let to_addr = Address::from_str(to)
            .map_err(|_| eyre!("Invalid payout recipient address: {}", to))?;

        let nonce = self
            .provider
            .get_transaction_count(self.corporate_addr)
            .pending()
            .await
            .wrap_err("Failed to read pending nonce")?;

        let gas_price = self
            .provider
            .get_gas_price()
            .await
            .wrap_err("Failed to read suggested gas price")?;

        let calldata = Erc20Token::transferCall {
            to: to_addr,
            amount: amount_base,
        }
        .abi_encode();

        let mut tx = TxLegacy {
            chain_id: Some(self.chain_id),
            nonce,
            gas_price,
            gas_limit: EVM_TRANSFER_GAS_LIMIT,
            to: TxKind::Call(self.token_contract),
            value: U256::ZERO,
            input: calldata.into(),
        };

        let signature = self
            .signer
            .sign_transaction_sync(&mut tx)
            .wrap_err("Failed to sign payout transaction")?;
        let signed = tx.into_signed(signature);
        let tx_hash = format!("{:?}", signed.hash());

        debug!(
            nonce,
            gas_price,
            to = %to_addr,
            amount = %amount_base,
            tx_hash = %tx_hash,
            "Signed EVM payout"
        );

        let envelope = TxEnvelope::Legacy(signed);
        Ok(SignedTransfer {
            tx_hash,
            raw: envelope.encoded_2718(),
        })
    }

    pub async fn broadcast(&self, signed: &SignedTransfer) -> Result<()> {
        self.provider
            .send_raw_transaction(&signed.raw)
            .await
            .wrap_err("Failed to broadcast payout transaction")?;
        Ok(())
    }

    /// Poll until the payout receipt resolves. Success is a non-zero
    /// receipt status. The cadence respects public RPC rate limits.
    pub async fn await_success(&self, tx_hash: &str) -> Result<TxOutcome> {
        let mut tries: u32 = 0;
        loop {
            tokio::time::sleep(POLL_PERIOD).await;
            tries += 1;

            let status = match &self.receipt_api_url {
                Some(url) => self.receipt_status_from_api(url, tx_hash).await?,
                None => self.receipt_status_from_node(tx_hash).await?,
            };

            match status {
                Some(true) => {
                    info!(tx_hash, tries, "EVM payout confirmed");
                    return Ok(TxOutcome::Success);
                }
                Some(false) => {
                    warn!(tx_hash, tries, "EVM payout reverted");
                    return Ok(TxOutcome::Failed);
                }
                None => {
                    debug!(tx_hash, tries, "EVM payout receipt not yet available");
                }
            }
        }
    }

    async fn receipt_status_from_node(&self, tx_hash: &str) -> Result<Option<bool>> {
        let hash = B256::from_str(tx_hash).map_err(|_| eyre!("Invalid tx hash: {}", tx_hash))?;
        let receipt = self
            .provider
            .get_transaction_receipt(hash)
            .await
            .wrap_err("Failed to query transaction receipt")?;
        Ok(receipt.map(|r| r.status()))
    }

    /// Explorer receipt endpoint, `{txhash}` substituted into the URL.
    /// Responds with `{"result":{"status":"1"}}` once mined.
    async fn receipt_status_from_api(&self, url: &str, tx_hash: &str) -> Result<Option<bool>> {
        let url = url.replace("{txhash}", tx_hash);
        let body: serde_json::Value = self
            .http
            .get(&url)
            .send()
            .await
            .wrap_err("Receipt API request failed")?
            .json()
            .await
            .wrap_err("Receipt API returned non-JSON body")?;

        let status = body
            .get("result")
            .and_then(|r| r.get("status"))
            .and_then(|s| s.as_str());

        match status {
            Some(s) if !s.is_empty() => {
                let raw = s.trim_start_matches("0x");
                Ok(Some(u64::from_str_radix(raw, 16).unwrap_or(0) != 0))
            }
            _ => Ok(None),
        }
    }
}

/// Decode the `Transfer` event payload into a user-unit amount.
pub fn decode_transfer_amount(data: &[u8]) -> Result<BigDecimal> {
    if data.len() < 32 {
        return Err(eyre!("Transfer event data too short: {} bytes", data.len()));
    }
    let raw = U256::from_be_slice(&data[..32]);
    let raw = BigInt::from_str(&raw.to_string())
        .map_err(|e| eyre!("Failed to parse transfer amount: {}", e))?;
    Ok(from_base_units(raw, EVM_DECIMALS))
}
