//! Durable records for intents, staged raw deposits and the blacklist.
//!
//! All orchestration code goes through the [`Store`] trait; production runs
//! on Postgres ([`postgres::PgStore`]), tests on [`memory::MemStore`]. Every
//! operation is individually atomic; no cross-record transactions are needed.

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::types::{BlacklistEntry, Intent, Network, RawDeposit};

pub mod memory;
pub mod postgres;

pub use memory::MemStore;
pub use postgres::PgStore;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Insert hit an existing primary key.
    #[error("primary key conflict")]
    Conflict,
    #[error(transparent)]
    Backend(#[from] sqlx::Error),
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

/// Typed equality filter over intent fields.
///
/// Each setter narrows the match; unset fields are ignored. Numeric and
/// boolean coercion is carried by the field types themselves, so an amount
/// persisted as a whole number still matches its decimal form.
#[derive(Debug, Default, Clone)]
pub struct IntentFilter {
    pub from_address: Option<String>,
    pub to_address: Option<String>,
    pub source_network: Option<Network>,
    pub destination_network: Option<Network>,
    pub source_completed: Option<bool>,
    pub destination_completed: Option<bool>,
    pub completed: Option<bool>,
    pub destination_tx_hash: Option<String>,
    pub amount: Option<BigDecimal>,
    pub created_at: Option<DateTime<Utc>>,
}

impl IntentFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_address(mut self, addr: impl Into<String>) -> Self {
        self.from_address = Some(addr.into());
        self
    }

    pub fn to_address(mut self, addr: impl Into<String>) -> Self {
        self.to_address = Some(addr.into());
        self
    }

    pub fn source_network(mut self, network: Network) -> Self {
        self.source_network = Some(network);
        self
    }

    pub fn destination_network(mut self, network: Network) -> Self {
        self.destination_network = Some(network);
        self
    }

    pub fn source_completed(mut self, value: bool) -> Self {
        self.source_completed = Some(value);
        self
    }

    pub fn destination_completed(mut self, value: bool) -> Self {
        self.destination_completed = Some(value);
        self
    }

    pub fn completed(mut self, value: bool) -> Self {
        self.completed = Some(value);
        self
    }

    pub fn destination_tx_hash(mut self, hash: impl Into<String>) -> Self {
        self.destination_tx_hash = Some(hash.into());
        self
    }

    pub fn amount(mut self, amount: BigDecimal) -> Self {
        self.amount = Some(amount);
        self
    }

    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = Some(at);
        self
    }

    /// Whether an intent satisfies every set condition.
    pub fn matches(&self, intent: &Intent) -> bool {
        if let Some(ref v) = self.from_address {
            if !intent.from_address.eq_ignore_ascii_case(v) {
                return false;
            }
        }
        if let Some(ref v) = self.to_address {
            if !intent.to_address.eq_ignore_ascii_case(v) {
                return false;
            }
        }
        if let Some(v) = self.source_network {
            if intent.source_network != v {
                return false;
            }
        }
        if let Some(v) = self.destination_network {
            if intent.destination_network != v {
                return false;
            }
        }
        if let Some(v) = self.source_completed {
            if intent.source_completed != v {
                return false;
            }
        }
        if let Some(v) = self.destination_completed {
            if intent.destination_completed != v {
                return false;
            }
        }
        if let Some(v) = self.completed {
            if intent.completed != v {
                return false;
            }
        }
        if let Some(ref v) = self.destination_tx_hash {
            if intent.destination_tx_hash.as_deref() != Some(v.as_str()) {
                return false;
            }
        }
        if let Some(ref v) = self.amount {
            // BigDecimal equality is numeric, so 5 == 5.00000
            if &intent.amount != v {
                return false;
            }
        }
        if let Some(v) = self.created_at {
            if intent.created_at != v {
                return false;
            }
        }
        true
    }
}

/// The persistence contract of the portal.
#[async_trait]
pub trait Store: Send + Sync {
    /// Create a new intent. Fails with [`StoreError::Conflict`] when the id
    /// already exists.
    async fn insert_intent(&self, intent: &Intent) -> Result<(), StoreError>;

    async fn get_intent(&self, id: &str) -> Result<Option<Intent>, StoreError>;

    /// Equality match on any subset of intent fields; returns the first hit.
    async fn find_intent(&self, filter: &IntentFilter) -> Result<Option<Intent>, StoreError>;

    /// Upsert by id.
    async fn update_intent(&self, intent: &Intent) -> Result<(), StoreError>;

    async fn insert_blacklist(&self, entry: &BlacklistEntry) -> Result<(), StoreError>;

    async fn find_blacklist(&self, address: &str) -> Result<Option<BlacklistEntry>, StoreError>;

    /// Stage an observed EVM deposit log. Re-observations of the same block
    /// are absorbed silently.
    async fn insert_raw_deposit(&self, deposit: &RawDeposit) -> Result<(), StoreError>;

    /// All staged deposits not yet consumed by the matcher.
    async fn pending_raw_deposits(&self) -> Result<Vec<RawDeposit>, StoreError>;

    /// Upsert by block number.
    async fn update_raw_deposit(&self, deposit: &RawDeposit) -> Result<(), StoreError>;
}
