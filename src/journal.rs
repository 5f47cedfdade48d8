//! Transaction journal: history of transfer attempts and their outcome.

use chrono::Utc;
use tracing::{error, info, warn};

use crate::engine::LedgerError;
use crate::model::{IdempotencyKey, Transaction, TransactionId, TransactionStatus};
use crate::store::{Constraint, Executor, StoreError};

/// Stateless façade over the transaction rows of a store handle.
#[derive(Debug, Clone, Copy, Default)]
pub struct Journal;

impl Journal {
    /// Look up a prior attempt. Must run in the same unit of work that would
    /// create the record, so the lookup and the insert see one snapshot.
    pub async fn find_by_idempotency_key<E>(
        &self,
        exec: &mut E,
        key: IdempotencyKey,
    ) -> Result<Option<Transaction>, LedgerError>
    where
        E: Executor + ?Sized,
    {
        exec.transaction_by_key(key).await.map_err(|e| {
            error!(idempotency_key = %key, error = %e, "failed to look up idempotency key");
            e.into()
        })
    }

    pub async fn get<E>(&self, exec: &mut E, id: TransactionId) -> Result<Transaction, LedgerError>
    where
        E: Executor + ?Sized,
    {
        exec.transaction(id)
            .await?
            .ok_or(LedgerError::TransactionNotFound(id))
    }

    /// Insert a `Pending` record.
    pub async fn create<E>(&self, exec: &mut E, transaction: &Transaction) -> Result<(), LedgerError>
    where
        E: Executor + ?Sized,
    {
        if transaction.status != TransactionStatus::Pending {
            return Err(LedgerError::InvalidStatusTransition {
                id: transaction.id,
                status: transaction.status,
            });
        }

        match exec.insert_transaction(transaction).await {
            Ok(()) => {
                info!(transaction = %transaction.id, "transaction created");
                Ok(())
            }
            Err(StoreError::UniqueViolation(Constraint::IdempotencyKey)) => {
                // Only keyed inserts can hit this constraint.
                let key = transaction
                    .idempotency_key
                    .ok_or(StoreError::UniqueViolation(Constraint::IdempotencyKey))?;
                warn!(idempotency_key = %key, "duplicate idempotency key");
                Err(LedgerError::DuplicateTransaction(key))
            }
            Err(e) => {
                error!(
                    source = %transaction.source,
                    destination = %transaction.destination,
                    amount = %transaction.amount,
                    error = %e,
                    "failed to create transaction"
                );
                Err(e.into())
            }
        }
    }

    /// Move a record written in this unit of work to a terminal status.
    pub async fn set_status<E>(
        &self,
        exec: &mut E,
        id: TransactionId,
        status: TransactionStatus,
    ) -> Result<Transaction, LedgerError>
    where
        E: Executor + ?Sized,
    {
        if !status.is_terminal() {
            return Err(LedgerError::InvalidStatusTransition { id, status });
        }

        match exec.update_status(id, status, Utc::now()).await {
            Ok(Some(transaction)) => {
                info!(transaction = %id, status = %status, "transaction status updated");
                Ok(transaction)
            }
            Ok(None) => Err(LedgerError::TransactionNotFound(id)),
            Err(e) => {
                error!(transaction = %id, status = %status, error = %e, "failed to update transaction status");
                Err(e.into())
            }
        }
    }
}
