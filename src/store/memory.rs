//! In-memory store, the test double for [`PgStore`]. Honors the same CRUD
//! contract, including conflict detection and the raw-deposit upsert key.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::types::{BlacklistEntry, Intent, RawDeposit};

use super::{IntentFilter, Store, StoreError};

#[derive(Default)]
struct Inner {
    intents: Vec<Intent>,
    blacklist: Vec<BlacklistEntry>,
    raw_deposits: HashMap<i64, RawDeposit>,
}

#[derive(Default, Clone)]
pub struct MemStore {
    inner: Arc<RwLock<Inner>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemStore {
    async fn insert_intent(&self, intent: &Intent) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if inner.intents.iter().any(|i| i.id == intent.id) {
            return Err(StoreError::Conflict);
        }
        inner.intents.push(intent.clone());
        Ok(())
    }

    async fn get_intent(&self, id: &str) -> Result<Option<Intent>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.intents.iter().find(|i| i.id == id).cloned())
    }

    async fn find_intent(&self, filter: &IntentFilter) -> Result<Option<Intent>, StoreError> {
        let inner = self.inner.read().await;
        let mut hits: Vec<&Intent> = inner.intents.iter().filter(|i| filter.matches(i)).collect();
        hits.sort_by_key(|i| i.created_at);
        Ok(hits.first().map(|i| (*i).clone()))
    }

    async fn update_intent(&self, intent: &Intent) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        match inner.intents.iter_mut().find(|i| i.id == intent.id) {
            Some(slot) => *slot = intent.clone(),
            None => inner.intents.push(intent.clone()),
        }
        Ok(())
    }

    async fn insert_blacklist(&self, entry: &BlacklistEntry) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if inner
            .blacklist
            .iter()
            .any(|b| b.address.eq_ignore_ascii_case(&entry.address))
        {
            return Err(StoreError::Conflict);
        }
        inner.blacklist.push(entry.clone());
        Ok(())
    }

    async fn find_blacklist(&self, address: &str) -> Result<Option<BlacklistEntry>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .blacklist
            .iter()
            .find(|b| b.address.eq_ignore_ascii_case(address))
            .cloned())
    }

    async fn insert_raw_deposit(&self, deposit: &RawDeposit) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner
            .raw_deposits
            .entry(deposit.block_number)
            .or_insert_with(|| deposit.clone());
        Ok(())
    }

    async fn pending_raw_deposits(&self) -> Result<Vec<RawDeposit>, StoreError> {
        let inner = self.inner.read().await;
        let mut pending: Vec<RawDeposit> = inner
            .raw_deposits
            .values()
            .filter(|d| !d.removed)
            .cloned()
            .collect();
        pending.sort_by_key(|d| d.block_number);
        Ok(pending)
    }

    async fn update_raw_deposit(&self, deposit: &RawDeposit) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner
            .raw_deposits
            .insert(deposit.block_number, deposit.clone());
        Ok(())
    }
}
