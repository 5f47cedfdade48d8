pub mod amount;
pub mod config;
pub mod csv;
pub mod engine;
pub mod journal;
pub mod ledger;
pub mod model;
pub mod store;

pub use amount::Amount;
pub use config::Config;
pub use engine::{Engine, ErrorKind, LedgerError};
pub use model::{
    Account, AccountId, Command, IdempotencyKey, Transaction, TransactionId, TransactionStatus,
    TransferRequest,
};
pub use store::{Executor, Store, StoreError, UnitOfWork};
