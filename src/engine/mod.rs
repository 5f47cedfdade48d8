//! Transfer orchestration.
//!
//! The engine owns a [`Store`] handle and runs every operation inside its own
//! unit of work. Transfers lock both accounts in ascending id order, so two
//! transfers over the same pair always queue on the same row first and can
//! never wait on each other in a cycle.

use std::future::Future;
use std::time::Duration;

use tokio_stream::{Stream, StreamExt};
use tracing::{debug, error, info, warn};

use crate::Amount;
use crate::config::{Config, Limits};
use crate::journal::Journal;
use crate::ledger::AccountLedger;
use crate::model::{
    Account, AccountId, Command, IdempotencyKey, Transaction, TransactionId, TransactionStatus,
    TransferRequest,
};
use crate::store::{Executor, Store, StoreError, UnitOfWork};

mod state;
pub use state::TransferState;

mod error;
pub use error::{AmountViolation, ErrorKind, LedgerError};

/// Attempts per transfer. The second attempt only happens after losing an
/// idempotency key race, and its lookup then finds the winner's record.
const MAX_ATTEMPTS: usize = 2;

/// The transfer engine.
pub struct Engine {
    store: Store,
    accounts: AccountLedger,
    journal: Journal,
    limits: Limits,
    deadline: Duration,
}

/// A transfer that passed input validation.
#[derive(Debug, Clone, Copy)]
struct ValidatedTransfer {
    source: AccountId,
    destination: AccountId,
    amount: Amount,
    idempotency_key: Option<IdempotencyKey>,
}

/// Result of the work done inside one unit of work, before commit.
enum Outcome {
    /// An earlier transaction with the same idempotency key.
    Replayed(Transaction),
    Completed(Transaction),
    /// Source balance too low; the `Failed` record still gets committed.
    Rejected {
        transaction: Transaction,
        available: Amount,
    },
}

/// Public API
impl Engine {
    pub fn new(store: Store, config: &Config) -> Self {
        Self {
            store,
            accounts: AccountLedger::new(&config.limits),
            journal: Journal,
            limits: config.limits.clone(),
            deadline: config.store.unit_of_work_timeout(),
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Run the engine over a stream of commands, in order.
    pub async fn run(&self, mut stream: impl Stream<Item = Command> + Unpin) {
        while let Some(command) = stream.next().await {
            // rejected commands are logged by the operation and must not stop the engine
            let _ = self.apply(command).await;
        }
    }

    /// Apply a single command.
    pub async fn apply(&self, command: Command) -> Result<(), LedgerError> {
        match command {
            Command::OpenAccount { account, balance } => {
                self.create_account(account, balance).await?;
            }
            Command::Transfer(request) => {
                self.transfer(request).await?;
            }
        }
        Ok(())
    }

    pub async fn create_account(
        &self,
        id: i64,
        initial_balance: Amount,
    ) -> Result<Account, LedgerError> {
        info!(account = id, initial_balance = %initial_balance, "creating account");
        let result = self
            .within_deadline(async {
                let mut unit = self.store.open_unit_of_work()?;
                let account = self.accounts.create(&mut unit, id, initial_balance).await?;
                unit.commit()?;
                Ok(account)
            })
            .await;
        if let Err(e) = &result {
            warn!(account = id, reason = %e, "account creation rejected");
        }
        result
    }

    pub async fn get_account(&self, id: i64) -> Result<Account, LedgerError> {
        let id = AccountId::new(id).ok_or(LedgerError::InvalidAccountId(id))?;
        let mut store = self.store.clone();
        self.accounts.read(&mut store, id).await
    }

    pub async fn get_transaction(&self, id: TransactionId) -> Result<Transaction, LedgerError> {
        let mut store = self.store.clone();
        self.journal.get(&mut store, id).await
    }

    /// Committed accounts ordered by id.
    pub async fn accounts(&self) -> Result<Vec<Account>, LedgerError> {
        let mut store = self.store.clone();
        self.accounts.list(&mut store).await
    }

    /// Move `amount` from `source` to `destination`, at most once per
    /// idempotency key.
    ///
    /// An insufficient balance is committed as a `Failed` transaction and
    /// reported as [`LedgerError::InsufficientBalance`]. Replaying a key
    /// returns the stored transaction whatever its status.
    pub async fn transfer(&self, request: TransferRequest) -> Result<Transaction, LedgerError> {
        info!(
            source = request.source,
            destination = request.destination,
            amount = %request.amount,
            idempotency_key = ?request.idempotency_key,
            "processing transfer"
        );

        let mut progress = Progress::new();
        let transfer = match self.validate(&request) {
            Ok(transfer) => transfer,
            Err(e) => {
                warn!(reason = %e, "transfer rejected");
                return Err(e);
            }
        };
        progress.advance(TransferState::Validated);

        let mut attempt = 1;
        loop {
            let result = self
                .within_deadline(self.execute(&transfer, &mut progress))
                .await;
            match result {
                Err(LedgerError::DuplicateTransaction(key)) if attempt < MAX_ATTEMPTS => {
                    info!(idempotency_key = %key, "lost idempotency key race, replaying");
                    progress.restart();
                    attempt += 1;
                }
                result => return Self::log_transfer(result, &mut progress),
            }
        }
    }
}

/// Private API
impl Engine {
    fn validate(&self, request: &TransferRequest) -> Result<ValidatedTransfer, LedgerError> {
        let source =
            AccountId::new(request.source).ok_or(LedgerError::InvalidAccountId(request.source))?;
        let destination = AccountId::new(request.destination)
            .ok_or(LedgerError::InvalidAccountId(request.destination))?;

        if source == destination {
            return Err(LedgerError::SameAccountTransfer(source));
        }
        self.check_amount(request.amount)?;

        Ok(ValidatedTransfer {
            source,
            destination,
            amount: request.amount,
            idempotency_key: request.idempotency_key,
        })
    }

    fn check_amount(&self, amount: Amount) -> Result<(), LedgerError> {
        let limits = &self.limits;
        let violation = if !amount.is_positive() {
            AmountViolation::NotPositive
        } else if amount < limits.min_transfer {
            AmountViolation::BelowMinimum(limits.min_transfer)
        } else if amount > limits.max_transfer {
            AmountViolation::AboveMaximum(limits.max_transfer)
        } else if !amount.fits_scale() {
            AmountViolation::TooPrecise
        } else {
            return Ok(());
        };
        Err(LedgerError::invalid_amount(amount, violation))
    }

    /// One attempt: open a unit of work, run the transfer, commit or abort.
    async fn execute(
        &self,
        transfer: &ValidatedTransfer,
        progress: &mut Progress,
    ) -> Result<Transaction, LedgerError> {
        let mut unit = self.store.open_unit_of_work()?;
        match self.apply_transfer(&mut unit, transfer, progress).await {
            Ok(Outcome::Replayed(transaction)) | Ok(Outcome::Completed(transaction)) => {
                unit.commit()?;
                progress.advance(TransferState::Committed);
                Ok(transaction)
            }
            Ok(Outcome::Rejected {
                transaction,
                available,
            }) => {
                unit.commit()?;
                progress.advance(TransferState::Committed);
                Err(LedgerError::InsufficientBalance {
                    account: transfer.source,
                    available,
                    requested: transfer.amount,
                    transaction: transaction.id,
                })
            }
            Err(e) => {
                unit.abort();
                Err(e)
            }
        }
    }

    async fn apply_transfer(
        &self,
        unit: &mut UnitOfWork,
        transfer: &ValidatedTransfer,
        progress: &mut Progress,
    ) -> Result<Outcome, LedgerError> {
        if let Some(key) = transfer.idempotency_key {
            if let Some(existing) = self.journal.find_by_idempotency_key(unit, key).await? {
                if (existing.source, existing.destination, existing.amount)
                    != (transfer.source, transfer.destination, transfer.amount)
                {
                    warn!(
                        idempotency_key = %key,
                        transaction = %existing.id,
                        "idempotency key reused with different transfer details"
                    );
                }
                info!(
                    idempotency_key = %key,
                    transaction = %existing.id,
                    status = %existing.status,
                    "returning existing transaction for idempotency key"
                );
                return Ok(Outcome::Replayed(existing));
            }
        }

        let (first, second) = lock_order(transfer.source, transfer.destination);
        let first_account = self.accounts.read_for_update(unit, first).await?;
        let second_account = self.accounts.read_for_update(unit, second).await?;
        progress.advance(TransferState::Locked);

        let (source, destination) = if first == transfer.source {
            (first_account, second_account)
        } else {
            (second_account, first_account)
        };

        let transaction = Transaction::pending(
            transfer.source,
            transfer.destination,
            transfer.amount,
            transfer.idempotency_key,
        );
        self.journal.create(unit, &transaction).await?;

        if source.balance < transfer.amount {
            progress.advance(TransferState::InsufficientFunds);
            let failed = self
                .journal
                .set_status(unit, transaction.id, TransactionStatus::Failed)
                .await?;
            progress.advance(TransferState::Failed);
            return Ok(Outcome::Rejected {
                transaction: failed,
                available: source.balance,
            });
        }

        let overflow = || LedgerError::invalid_amount(transfer.amount, AmountViolation::Overflow);
        let debited = source.balance.checked_sub(transfer.amount).ok_or_else(overflow)?;
        let credited = destination
            .balance
            .checked_add(transfer.amount)
            .ok_or_else(overflow)?;

        self.accounts.write_balance(unit, source.id, debited).await?;
        self.accounts
            .write_balance(unit, destination.id, credited)
            .await?;
        let completed = self
            .journal
            .set_status(unit, transaction.id, TransactionStatus::Completed)
            .await?;
        progress.advance(TransferState::Applied);

        Ok(Outcome::Completed(completed))
    }

    /// Bound a unit-of-work future by the configured deadline. On expiry the
    /// future is dropped, which aborts its unit of work and frees its locks.
    async fn within_deadline<T>(
        &self,
        work: impl Future<Output = Result<T, LedgerError>>,
    ) -> Result<T, LedgerError> {
        match tokio::time::timeout(self.deadline, work).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::DeadlineExceeded(self.deadline).into()),
        }
    }

    /// Small helper to log `transfer` results
    fn log_transfer(
        result: Result<Transaction, LedgerError>,
        progress: &mut Progress,
    ) -> Result<Transaction, LedgerError> {
        match &result {
            Ok(transaction) => {
                info!(
                    transaction = %transaction.id,
                    status = %transaction.status,
                    "transfer committed"
                );
            }
            Err(e @ LedgerError::InsufficientBalance { .. }) => {
                warn!(reason = %e, "transfer failed");
            }
            Err(e) if e.kind() == ErrorKind::Infrastructure => {
                let at = progress.state;
                progress.advance(TransferState::Aborted);
                error!(state = %at, error = %e, retryable = e.is_retryable(), "transfer aborted");
            }
            Err(e) => {
                let at = progress.state;
                progress.advance(TransferState::Aborted);
                warn!(state = %at, reason = %e, "transfer aborted");
            }
        }
        result
    }
}

/// Canonical lock order: ascending by raw account id.
pub(crate) fn lock_order(a: AccountId, b: AccountId) -> (AccountId, AccountId) {
    if a < b { (a, b) } else { (b, a) }
}

/// Tracks a transfer's state for logging.
struct Progress {
    state: TransferState,
}

impl Progress {
    fn new() -> Self {
        Self {
            state: TransferState::Received,
        }
    }

    fn advance(&mut self, next: TransferState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "illegal transfer transition {} -> {}",
            self.state,
            next
        );
        debug!(from = %self.state, to = %next, "transfer state");
        self.state = next;
    }

    /// Start a new attempt after an aborted one.
    fn restart(&mut self) {
        self.state = TransferState::Validated;
    }
}
