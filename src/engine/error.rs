//! Error types for ledger operations.

use thiserror::Error;

use crate::Amount;
use crate::model::{AccountId, IdempotencyKey, TransactionId, TransactionStatus};
use crate::store::StoreError;

/// Every outcome a ledger operation can fail with.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("invalid account id {0}: must be a positive integer")]
    InvalidAccountId(i64),

    #[error("invalid amount {amount}: {reason}")]
    InvalidAmount {
        amount: Amount,
        reason: AmountViolation,
    },

    #[error("source and destination accounts cannot be the same ({0})")]
    SameAccountTransfer(AccountId),

    #[error("account {0} not found")]
    AccountNotFound(AccountId),

    #[error("account {0} already exists")]
    DuplicateAccount(AccountId),

    #[error(
        "insufficient balance in account {account}: available {available}, requested {requested} (transaction {transaction})"
    )]
    InsufficientBalance {
        account: AccountId,
        available: Amount,
        requested: Amount,
        transaction: TransactionId,
    },

    #[error("idempotency key {0} is already used by another transaction")]
    DuplicateTransaction(IdempotencyKey),

    #[error("transaction {0} not found")]
    TransactionNotFound(TransactionId),

    #[error("transaction {id} cannot move to status {status}")]
    InvalidStatusTransition {
        id: TransactionId,
        status: TransactionStatus,
    },

    #[error("internal error: {0}")]
    Internal(#[from] StoreError),
}

/// Why an amount was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AmountViolation {
    #[error("must be greater than zero")]
    NotPositive,
    #[error("must not be negative")]
    Negative,
    #[error("below minimum {0}")]
    BelowMinimum(Amount),
    #[error("exceeds maximum {0}")]
    AboveMaximum(Amount),
    #[error("more than {} fractional digits", Amount::MAX_SCALE)]
    TooPrecise,
    #[error("resulting balance is out of range")]
    Overflow,
}

/// Error classes, for callers that map errors onto a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Rejected before any storage access; never retried.
    Input,
    /// Rejected by ledger rules inside a unit of work.
    BusinessRule,
    /// Storage fault; the unit of work was aborted with no effect.
    Infrastructure,
}

impl LedgerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LedgerError::InvalidAccountId(_)
            | LedgerError::InvalidAmount { .. }
            | LedgerError::SameAccountTransfer(_) => ErrorKind::Input,
            LedgerError::AccountNotFound(_)
            | LedgerError::DuplicateAccount(_)
            | LedgerError::InsufficientBalance { .. }
            | LedgerError::DuplicateTransaction(_)
            | LedgerError::TransactionNotFound(_) => ErrorKind::BusinessRule,
            LedgerError::InvalidStatusTransition { .. } | LedgerError::Internal(_) => {
                ErrorKind::Infrastructure
            }
        }
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            LedgerError::InvalidAccountId(_) => "invalid_account_id",
            LedgerError::InvalidAmount { .. } => "invalid_amount",
            LedgerError::SameAccountTransfer(_) => "same_account_transfer",
            LedgerError::AccountNotFound(_) => "account_not_found",
            LedgerError::DuplicateAccount(_) => "duplicate_account",
            LedgerError::InsufficientBalance { .. } => "insufficient_balance",
            LedgerError::DuplicateTransaction(_) => "duplicate_transaction",
            LedgerError::TransactionNotFound(_) => "transaction_not_found",
            LedgerError::InvalidStatusTransition { .. } | LedgerError::Internal(_) => {
                "internal_error"
            }
        }
    }

    /// Whether the caller should resend the same request (with the same
    /// idempotency key, if any).
    pub fn is_retryable(&self) -> bool {
        match self {
            LedgerError::Internal(e) => e.is_retryable(),
            _ => false,
        }
    }

    pub(crate) fn invalid_amount(amount: Amount, reason: AmountViolation) -> Self {
        LedgerError::InvalidAmount { amount, reason }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn kinds_follow_taxonomy() {
        let id = AccountId::new(1).unwrap();
        assert_eq!(LedgerError::SameAccountTransfer(id).kind(), ErrorKind::Input);
        assert_eq!(LedgerError::DuplicateAccount(id).kind(), ErrorKind::BusinessRule);
        assert_eq!(
            LedgerError::Internal(StoreError::CannotNestTransaction).kind(),
            ErrorKind::Infrastructure
        );
    }

    #[test]
    fn only_transient_storage_faults_are_retryable() {
        let timeout = LedgerError::Internal(StoreError::LockTimeout {
            resource: "1".to_string(),
            waited: Duration::from_millis(5),
        });
        assert!(timeout.is_retryable());
        assert_eq!(timeout.code(), "internal_error");

        assert!(!LedgerError::Internal(StoreError::CannotNestTransaction).is_retryable());
        assert!(!LedgerError::InvalidAccountId(0).is_retryable());
    }

    #[test]
    fn messages_include_context() {
        let err = LedgerError::invalid_amount(Amount::from_int(-3), AmountViolation::Negative);
        assert_eq!(err.to_string(), "invalid amount -3: must not be negative");
        assert_eq!(
            AmountViolation::TooPrecise.to_string(),
            "more than 8 fractional digits"
        );
    }
}
