//! Core data model for the swap portal: networks, intents, staged deposits
//! and blacklist entries.

use std::fmt;
use std::str::FromStr;

use bigdecimal::num_bigint::BigInt;
use bigdecimal::BigDecimal;
use chrono::{DateTime, SubsecRound, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Current time truncated to microseconds, the precision the store
/// round-trips. Keeps timestamp equality filters exact.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// The two chains bridged by the portal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Evm,
    Cos,
}

impl Network {
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Evm => "evm",
            Network::Cos => "cos",
        }
    }

    /// The chain on the other side of the bridge.
    pub fn opposite(&self) -> Network {
        match self {
            Network::Evm => Network::Cos,
            Network::Cos => Network::Evm,
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Network {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "evm" => Ok(Network::Evm),
            "cos" => Ok(Network::Cos),
            other => Err(format!("unknown network: {}", other)),
        }
    }
}

/// A user-declared cross-chain transfer and its lifecycle state.
///
/// Created by the admission path, mutated only by the orchestrator
/// (listeners, dispatchers, deferred matcher, timeout sweep). Never
/// deleted; `completed = true` is terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Intent {
    pub id: String,
    pub from_address: String,
    pub to_address: String,
    pub source_network: Network,
    pub destination_network: Network,
    /// Amount in user units (not base units), at most 5 fractional digits.
    pub amount: BigDecimal,
    pub source_tx_hash: Option<String>,
    pub destination_tx_hash: Option<String>,
    pub source_completed: bool,
    pub destination_completed: bool,
    pub completed: bool,
    /// Deferred-matcher retry counter; only meaningful for EVM-sourced intents.
    pub try_count: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Intent {
    /// Build a fresh open intent with a newly assigned id.
    pub fn new(
        from_address: String,
        to_address: String,
        source_network: Network,
        destination_network: Network,
        amount: BigDecimal,
    ) -> Self {
        let now = now();
        Self {
            id: new_record_id(),
            from_address,
            to_address,
            source_network,
            destination_network,
            amount,
            source_tx_hash: None,
            destination_tx_hash: None,
            source_completed: false,
            destination_completed: false,
            completed: false,
            try_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Record the observed source-chain deposit.
    pub fn mark_source_completed(&mut self, tx_hash: &str) {
        self.source_tx_hash = Some(tx_hash.to_string());
        self.source_completed = true;
        self.touch();
    }

    /// Close the intent. Terminal: no further mutation after this.
    pub fn mark_completed(&mut self) {
        self.completed = true;
        self.touch();
    }

    pub fn touch(&mut self) {
        self.updated_at = now();
    }
}

/// Opaque 12-byte hex id, assigned at creation.
fn new_record_id() -> String {
    let mut bytes = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// A staged EVM deposit log whose matching intent is not yet known.
///
/// Inserted for every token-contract Transfer whose recipient topic is the
/// corporate EVM address; flipped to `removed = true` once consumed by the
/// deferred matcher. Keyed by block number.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawDeposit {
    pub block_number: i64,
    pub tx_hash: String,
    /// Event topics as 0x-prefixed 32-byte hex strings.
    pub topics: Vec<String>,
    /// ABI-encoded non-indexed payload (the transfer amount).
    pub data: Vec<u8>,
    pub removed: bool,
}

impl RawDeposit {
    /// Sender address from the first indexed topic.
    pub fn sender_address(&self) -> Option<String> {
        self.topics.get(1).map(|t| topic_to_address(t))
    }

    /// Recipient address from the second indexed topic.
    pub fn recipient_address(&self) -> Option<String> {
        self.topics.get(2).map(|t| topic_to_address(t))
    }
}

/// Extract the 20-byte address from a 32-byte indexed topic.
pub fn topic_to_address(topic: &str) -> String {
    let hexpart = topic.strip_prefix("0x").unwrap_or(topic);
    if hexpart.len() < 40 {
        return format!("0x{}", hexpart.to_lowercase());
    }
    format!("0x{}", hexpart[hexpart.len() - 40..].to_lowercase())
}

/// A blocked depositor address, in either chain's form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlacklistEntry {
    pub id: String,
    pub address: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BlacklistEntry {
    pub fn new(address: String) -> Self {
        let now = now();
        Self {
            id: new_record_id(),
            address,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Outcome of correlating a staged deposit with an intent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchResult {
    /// Deposit matched; payout dispatched on the destination chain.
    Matched,
    /// The log is the outbound leg of a prior payout from the corporate
    /// address; not a user deposit.
    SelfDeposit,
    /// No open intent corresponds to this deposit.
    NoMatch,
    /// Sender is blacklisted at or above the threshold; intent closed
    /// without payout.
    Blacklisted,
}

/// A Transfer log observed on the EVM token contract, as delivered by the
/// chain adapter's deposit stream.
#[derive(Debug, Clone)]
pub struct EvmLogEvent {
    pub block_number: u64,
    pub tx_hash: String,
    pub topics: Vec<String>,
    pub data: Vec<u8>,
}

/// A Tx event observed on the COS chain for the corporate recipient.
#[derive(Debug, Clone)]
pub struct CosTxEvent {
    pub sender: String,
    pub tx_hash: String,
    /// All `transfer.amount` attribute values, in emission order. The first
    /// entry is the fee transfer, the second the gross deposit; events with
    /// a single entry are informational.
    pub transfer_amounts: Vec<String>,
}

/// Convert a user-unit amount to base units (`amount × 10^decimals`),
/// truncating any residue below one base unit.
pub fn to_base_units(amount: &BigDecimal, decimals: i64) -> BigInt {
    let scaled = amount * BigDecimal::new(BigInt::from(1), -decimals);
    scaled.with_scale(0).into_bigint_and_exponent().0
}

/// Convert base units to user units (`raw / 10^decimals`).
pub fn from_base_units(raw: BigInt, decimals: i64) -> BigDecimal {
    BigDecimal::new(raw, decimals)
}

/// Count significant fractional digits of an amount.
pub fn fractional_digits(amount: &BigDecimal) -> i64 {
    amount.normalized().fractional_digit_count().max(0)
}
