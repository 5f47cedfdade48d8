use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, error, warn};

use super::lock::RowLock;
use super::log::CommitRecord;
use super::{Constraint, Executor, Shared, StoreError, lock_state};
use crate::Amount;
use crate::model::{
    Account, AccountId, IdempotencyKey, Transaction, TransactionId, TransactionStatus,
};

/// Transactional handle on the store.
///
/// Writes are buffered here and become visible to others only on
/// [`commit`](Self::commit). Row locks taken through the handle are held
/// until it is committed, aborted, or dropped. Dropping without commit
/// discards every buffered write, which is what happens on early returns,
/// panics and cancelled futures.
pub struct UnitOfWork {
    shared: Arc<Shared>,
    id: u64,
    account_locks: HashMap<AccountId, RowLock<AccountId>>,
    key_locks: HashMap<IdempotencyKey, RowLock<IdempotencyKey>>,
    accounts: BTreeMap<AccountId, Account>,
    transactions: HashMap<TransactionId, Transaction>,
    finished: bool,
}

impl UnitOfWork {
    pub(super) fn new(shared: Arc<Shared>, id: u64) -> Self {
        Self {
            shared,
            id,
            account_locks: HashMap::new(),
            key_locks: HashMap::new(),
            accounts: BTreeMap::new(),
            transactions: HashMap::new(),
            finished: false,
        }
    }

    /// Durably apply every buffered write, then release all locks.
    pub fn commit(mut self) -> Result<(), StoreError> {
        self.finished = true;
        let record = CommitRecord {
            accounts: std::mem::take(&mut self.accounts).into_values().collect(),
            transactions: std::mem::take(&mut self.transactions)
                .into_values()
                .collect(),
        };
        if record.is_empty() {
            debug!(unit = self.id, "read-only unit of work committed");
            return Ok(());
        }

        let accounts = record.accounts.len();
        let transactions = record.transactions.len();
        let mut log = self.shared.log.as_ref().map(lock_state);
        if let Some(log) = log.as_mut() {
            if let Err(e) = log.append(&record) {
                error!(unit = self.id, error = %e, "commit log append failed, discarding writes");
                return Err(e);
            }
        }
        lock_state(&self.shared.tables).apply(record);
        debug!(unit = self.id, accounts, transactions, "unit of work committed");
        Ok(())
    }

    /// Discard every buffered write and release all locks.
    pub fn abort(mut self) {
        self.finished = true;
        debug!(
            unit = self.id,
            discarded = self.accounts.len() + self.transactions.len(),
            "unit of work aborted"
        );
    }

    async fn lock_account(&mut self, id: AccountId) -> Result<(), StoreError> {
        if self.account_locks.contains_key(&id) {
            return Ok(());
        }
        let lock = self
            .shared
            .account_locks
            .acquire(id, self.shared.lock_timeout)
            .await?;
        self.account_locks.insert(id, lock);
        Ok(())
    }

    async fn lock_key(&mut self, key: IdempotencyKey) -> Result<(), StoreError> {
        if self.key_locks.contains_key(&key) {
            return Ok(());
        }
        let lock = self
            .shared
            .key_locks
            .acquire(key, self.shared.lock_timeout)
            .await?;
        self.key_locks.insert(key, lock);
        Ok(())
    }

    fn visible_account(&self, id: AccountId) -> Option<Account> {
        self.accounts
            .get(&id)
            .cloned()
            .or_else(|| self.shared.committed_account(id))
    }

    fn visible_transaction(&self, id: TransactionId) -> Option<Transaction> {
        self.transactions
            .get(&id)
            .cloned()
            .or_else(|| self.shared.committed_transaction(id))
    }

    fn visible_by_key(&self, key: IdempotencyKey) -> Option<Transaction> {
        self.transactions
            .values()
            .find(|tx| tx.idempotency_key == Some(key))
            .cloned()
            .or_else(|| self.shared.committed_by_key(key))
    }
}

#[async_trait]
impl Executor for UnitOfWork {
    fn open_unit_of_work(&self) -> Result<UnitOfWork, StoreError> {
        Err(StoreError::CannotNestTransaction)
    }

    async fn insert_account(&mut self, account: &Account) -> Result<(), StoreError> {
        // Holding the row lock makes a concurrent creator of the same id wait
        // for our outcome instead of racing past the existence check.
        self.lock_account(account.id).await?;
        if self.visible_account(account.id).is_some() {
            return Err(StoreError::UniqueViolation(Constraint::AccountId));
        }
        self.accounts.insert(account.id, account.clone());
        Ok(())
    }

    async fn account(&mut self, id: AccountId) -> Result<Option<Account>, StoreError> {
        Ok(self.visible_account(id))
    }

    async fn account_for_update(&mut self, id: AccountId) -> Result<Option<Account>, StoreError> {
        let newly_locked = !self.account_locks.contains_key(&id);
        self.lock_account(id).await?;
        let row = self.visible_account(id);
        if row.is_none() && newly_locked {
            self.account_locks.remove(&id);
        }
        Ok(row)
    }

    async fn update_balance(
        &mut self,
        id: AccountId,
        balance: Amount,
        at: DateTime<Utc>,
    ) -> Result<Option<Account>, StoreError> {
        self.lock_account(id).await?;
        let Some(mut account) = self.visible_account(id) else {
            return Ok(None);
        };
        account.balance = balance;
        account.updated_at = at;
        self.accounts.insert(id, account.clone());
        Ok(Some(account))
    }

    async fn accounts(&mut self) -> Result<Vec<Account>, StoreError> {
        let mut merged: BTreeMap<AccountId, Account> = self
            .shared
            .committed_accounts()
            .into_iter()
            .map(|account| (account.id, account))
            .collect();
        for (id, account) in &self.accounts {
            merged.insert(*id, account.clone());
        }
        Ok(merged.into_values().collect())
    }

    async fn insert_transaction(&mut self, transaction: &Transaction) -> Result<(), StoreError> {
        if self.visible_transaction(transaction.id).is_some() {
            return Err(StoreError::UniqueViolation(Constraint::TransactionId));
        }
        if let Some(key) = transaction.idempotency_key {
            // Index entry lock: a racing writer of the same key blocks here
            // until our unit of work ends, then sees the committed row.
            self.lock_key(key).await?;
            if self.visible_by_key(key).is_some() {
                return Err(StoreError::UniqueViolation(Constraint::IdempotencyKey));
            }
        }
        self.transactions.insert(transaction.id, transaction.clone());
        Ok(())
    }

    async fn transaction(&mut self, id: TransactionId) -> Result<Option<Transaction>, StoreError> {
        Ok(self.visible_transaction(id))
    }

    async fn transaction_by_key(
        &mut self,
        key: IdempotencyKey,
    ) -> Result<Option<Transaction>, StoreError> {
        Ok(self.visible_by_key(key))
    }

    async fn update_status(
        &mut self,
        id: TransactionId,
        status: TransactionStatus,
        at: DateTime<Utc>,
    ) -> Result<Option<Transaction>, StoreError> {
        let Some(transaction) = self.transactions.get_mut(&id) else {
            return Ok(None);
        };
        transaction.status = status;
        transaction.updated_at = at;
        Ok(Some(transaction.clone()))
    }
}

impl Drop for UnitOfWork {
    fn drop(&mut self) {
        if !self.finished && !(self.accounts.is_empty() && self.transactions.is_empty()) {
            warn!(
                unit = self.id,
                locks = self.account_locks.len() + self.key_locks.len(),
                "unit of work dropped before commit, discarding writes"
            );
        }
    }
}
