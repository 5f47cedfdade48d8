//! Ledger store: keyed account and transaction storage with units of work.
//!
//! Committed state lives behind a single mutex and is only ever replaced
//! wholesale by [`UnitOfWork::commit`]. Row locks are separate async mutexes
//! so a unit of work can wait for a contended account without blocking the
//! rest of the store. Two handles implement [`Executor`]:
//!
//! - [`Store`]: the direct handle; every write is its own single-statement unit.
//! - [`UnitOfWork`]: the transactional handle; writes are buffered until commit.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::info;

use crate::Amount;
use crate::config::StoreConfig;
use crate::model::{
    Account, AccountId, IdempotencyKey, Transaction, TransactionId, TransactionStatus,
};

mod lock;
mod log;
mod unit_of_work;

use lock::LockTable;
use log::{CommitLog, CommitRecord};
pub use unit_of_work::UnitOfWork;

/// Storage-level failures. All of them abort the unit of work they occur in.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("cannot open a unit of work from inside another unit of work")]
    CannotNestTransaction,

    #[error("lock on {resource} not acquired within {waited:?}")]
    LockTimeout { resource: String, waited: Duration },

    #[error("unit of work exceeded its deadline of {0:?}")]
    DeadlineExceeded(Duration),

    #[error("unique constraint violated: {0}")]
    UniqueViolation(Constraint),

    #[error("commit log i/o failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("commit log line {line} is corrupt: {source}")]
    Corrupt {
        line: usize,
        source: serde_json::Error,
    },

    #[error("commit log could not be rolled back after a failed append")]
    LogPoisoned,

    #[error("failed to encode commit record: {0}")]
    Encode(#[source] serde_json::Error),
}

impl StoreError {
    /// Whether retrying the whole unit of work may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::LockTimeout { .. } | StoreError::DeadlineExceeded(_) | StoreError::Io(_)
        )
    }
}

/// Uniqueness constraints enforced by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Constraint {
    AccountId,
    TransactionId,
    IdempotencyKey,
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Constraint::AccountId => "accounts_pkey",
            Constraint::TransactionId => "transactions_pkey",
            Constraint::IdempotencyKey => "transactions_idempotency_key",
        })
    }
}

/// Operations shared by the direct and the transactional handle.
#[async_trait]
pub trait Executor: Send {
    /// Begin a unit of work. Only the direct handle may do this.
    fn open_unit_of_work(&self) -> Result<UnitOfWork, StoreError>;

    async fn insert_account(&mut self, account: &Account) -> Result<(), StoreError>;

    /// Plain read of the latest visible row.
    async fn account(&mut self, id: AccountId) -> Result<Option<Account>, StoreError>;

    /// Read and take the row's exclusive lock.
    async fn account_for_update(&mut self, id: AccountId) -> Result<Option<Account>, StoreError>;

    /// Returns the updated row, or `None` if it does not exist.
    async fn update_balance(
        &mut self,
        id: AccountId,
        balance: Amount,
        at: DateTime<Utc>,
    ) -> Result<Option<Account>, StoreError>;

    /// All visible accounts ordered by identity.
    async fn accounts(&mut self) -> Result<Vec<Account>, StoreError>;

    async fn insert_transaction(&mut self, transaction: &Transaction) -> Result<(), StoreError>;

    async fn transaction(&mut self, id: TransactionId) -> Result<Option<Transaction>, StoreError>;

    async fn transaction_by_key(
        &mut self,
        key: IdempotencyKey,
    ) -> Result<Option<Transaction>, StoreError>;

    /// Only rows written by the current unit of work are mutable; committed
    /// transactions report `None`.
    async fn update_status(
        &mut self,
        id: TransactionId,
        status: TransactionStatus,
        at: DateTime<Utc>,
    ) -> Result<Option<Transaction>, StoreError>;
}

#[derive(Default)]
pub(crate) struct Tables {
    accounts: HashMap<AccountId, Account>,
    transactions: HashMap<TransactionId, Transaction>,
    by_key: HashMap<IdempotencyKey, TransactionId>,
}

impl Tables {
    fn apply(&mut self, record: CommitRecord) {
        for account in record.accounts {
            self.accounts.insert(account.id, account);
        }
        for transaction in record.transactions {
            if let Some(key) = transaction.idempotency_key {
                self.by_key.insert(key, transaction.id);
            }
            self.transactions.insert(transaction.id, transaction);
        }
    }

    fn transaction_by_key(&self, key: &IdempotencyKey) -> Option<&Transaction> {
        self.by_key
            .get(key)
            .and_then(|id| self.transactions.get(id))
    }
}

pub(crate) struct Shared {
    tables: StdMutex<Tables>,
    /// Held across append and apply so log order matches commit order.
    /// Readers only take `tables` and never wait on the disk.
    log: Option<StdMutex<CommitLog>>,
    account_locks: LockTable<AccountId>,
    key_locks: LockTable<IdempotencyKey>,
    lock_timeout: Duration,
    next_unit: AtomicU64,
}

impl Shared {
    fn committed_account(&self, id: AccountId) -> Option<Account> {
        lock_state(&self.tables).accounts.get(&id).cloned()
    }

    fn committed_accounts(&self) -> Vec<Account> {
        let mut accounts: Vec<Account> = lock_state(&self.tables)
            .accounts
            .values()
            .cloned()
            .collect();
        accounts.sort_by_key(|account| account.id);
        accounts
    }

    fn committed_transaction(&self, id: TransactionId) -> Option<Transaction> {
        lock_state(&self.tables).transactions.get(&id).cloned()
    }

    fn committed_by_key(&self, key: IdempotencyKey) -> Option<Transaction> {
        lock_state(&self.tables).transaction_by_key(&key).cloned()
    }
}

/// Direct handle to the ledger store. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    shared: Arc<Shared>,
}

impl Store {
    /// A store with no commit log.
    pub fn in_memory(config: &StoreConfig) -> Self {
        Self::with_tables(Tables::default(), None, config)
    }

    /// Open the store described by `config`, replaying its commit log if one
    /// is configured.
    pub fn open(config: &StoreConfig) -> Result<Self, StoreError> {
        let Some(path) = &config.data_file else {
            return Ok(Self::in_memory(config));
        };

        let (log, records) = CommitLog::open(path, config.sync_writes)?;
        let mut tables = Tables::default();
        for record in records {
            tables.apply(record);
        }
        info!(
            path = %log.path().display(),
            accounts = tables.accounts.len(),
            transactions = tables.transactions.len(),
            "store recovered"
        );
        Ok(Self::with_tables(tables, Some(log), config))
    }

    fn with_tables(tables: Tables, log: Option<CommitLog>, config: &StoreConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                tables: StdMutex::new(tables),
                log: log.map(StdMutex::new),
                account_locks: LockTable::new(),
                key_locks: LockTable::new(),
                lock_timeout: config.lock_timeout(),
                next_unit: AtomicU64::new(1),
            }),
        }
    }

    fn begin(&self) -> UnitOfWork {
        let id = self.shared.next_unit.fetch_add(1, Ordering::Relaxed);
        UnitOfWork::new(Arc::clone(&self.shared), id)
    }
}

#[async_trait]
impl Executor for Store {
    fn open_unit_of_work(&self) -> Result<UnitOfWork, StoreError> {
        Ok(self.begin())
    }

    async fn insert_account(&mut self, account: &Account) -> Result<(), StoreError> {
        let mut unit = self.begin();
        unit.insert_account(account).await?;
        unit.commit()
    }

    async fn account(&mut self, id: AccountId) -> Result<Option<Account>, StoreError> {
        Ok(self.shared.committed_account(id))
    }

    async fn account_for_update(&mut self, id: AccountId) -> Result<Option<Account>, StoreError> {
        // The lock ends with the single-statement unit.
        let mut unit = self.begin();
        let row = unit.account_for_update(id).await?;
        unit.abort();
        Ok(row)
    }

    async fn update_balance(
        &mut self,
        id: AccountId,
        balance: Amount,
        at: DateTime<Utc>,
    ) -> Result<Option<Account>, StoreError> {
        let mut unit = self.begin();
        let row = unit.update_balance(id, balance, at).await?;
        unit.commit()?;
        Ok(row)
    }

    async fn accounts(&mut self) -> Result<Vec<Account>, StoreError> {
        Ok(self.shared.committed_accounts())
    }

    async fn insert_transaction(&mut self, transaction: &Transaction) -> Result<(), StoreError> {
        let mut unit = self.begin();
        unit.insert_transaction(transaction).await?;
        unit.commit()
    }

    async fn transaction(&mut self, id: TransactionId) -> Result<Option<Transaction>, StoreError> {
        Ok(self.shared.committed_transaction(id))
    }

    async fn transaction_by_key(
        &mut self,
        key: IdempotencyKey,
    ) -> Result<Option<Transaction>, StoreError> {
        Ok(self.shared.committed_by_key(key))
    }

    async fn update_status(
        &mut self,
        _id: TransactionId,
        _status: TransactionStatus,
        _at: DateTime<Utc>,
    ) -> Result<Option<Transaction>, StoreError> {
        // A fresh single-statement unit never owns an uncommitted row.
        Ok(None)
    }
}

/// Lock a std mutex, recovering the data if a previous holder panicked.
/// Committed tables are only replaced inside [`Tables::apply`], which does
/// not panic midway.
pub(crate) fn lock_state<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
