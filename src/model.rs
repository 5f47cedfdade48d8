//! Core domain types for the transfer engine.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::Amount;

/// Caller-assigned account identifier. Always positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(i64);

impl AccountId {
    /// Returns `None` for non-positive identities.
    pub fn new(raw: i64) -> Option<Self> {
        (raw > 0).then_some(AccountId(raw))
    }

    pub fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Engine-generated transaction identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(Uuid);

impl TransactionId {
    pub fn generate() -> Self {
        TransactionId(Uuid::new_v4())
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Client-supplied token deduplicating transfer requests.
///
/// Absence is modelled with `Option`, so the nil UUID is an ordinary key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(Uuid);

impl IdempotencyKey {
    pub fn new(value: Uuid) -> Self {
        IdempotencyKey(value)
    }
}

impl FromStr for IdempotencyKey {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(IdempotencyKey)
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An account and its current balance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub balance: Amount,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Lifecycle of a journal entry. `Completed` and `Failed` are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Failed,
}

impl TransactionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransactionStatus::Completed | TransactionStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Completed => "completed",
            TransactionStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A recorded transfer attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TransactionId,
    pub source: AccountId,
    pub destination: AccountId,
    pub amount: Amount,
    pub idempotency_key: Option<IdempotencyKey>,
    pub status: TransactionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Transaction {
    /// Create a fresh `Pending` entry with a newly generated id.
    pub fn pending(
        source: AccountId,
        destination: AccountId,
        amount: Amount,
        idempotency_key: Option<IdempotencyKey>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: TransactionId::generate(),
            source,
            destination,
            amount,
            idempotency_key,
            status: TransactionStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A transfer as submitted by a caller, before validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub source: i64,
    pub destination: i64,
    pub amount: Amount,
    pub idempotency_key: Option<IdempotencyKey>,
}

/// Inputs accepted by [`Engine::apply`](crate::Engine::apply).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Open a new account with an initial balance.
    OpenAccount { account: i64, balance: Amount },
    /// Move funds between two existing accounts.
    Transfer(TransferRequest),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn account_id_must_be_positive() {
        assert_eq!(AccountId::new(123).map(AccountId::get), Some(123));
        assert!(AccountId::new(0).is_none());
        assert!(AccountId::new(-5).is_none());
    }

    #[test]
    fn account_ids_order_by_value() {
        let low = AccountId::new(9).unwrap();
        let high = AccountId::new(10).unwrap();
        assert!(low < high);
        assert_eq!(low.max(high), high);
    }

    #[test]
    fn nil_idempotency_key_is_a_real_key() {
        let key: IdempotencyKey = "00000000-0000-0000-0000-000000000000".parse().unwrap();
        let present = Some(key);
        assert!(present.is_some());
        assert_eq!(present, Some(IdempotencyKey::new(Uuid::nil())));
    }

    #[test]
    fn idempotency_key_rejects_non_uuid() {
        assert!("not-a-key".parse::<IdempotencyKey>().is_err());
    }

    #[test]
    fn pending_transaction_defaults() {
        let tx = Transaction::pending(
            AccountId::new(1).unwrap(),
            AccountId::new(2).unwrap(),
            Amount::from_int(5),
            None,
        );
        assert_eq!(tx.status, TransactionStatus::Pending);
        assert_eq!(tx.created_at, tx.updated_at);
        assert!(tx.idempotency_key.is_none());
    }

    #[test]
    fn generated_ids_are_unique() {
        assert_ne!(TransactionId::generate(), TransactionId::generate());
    }

    #[test]
    fn status_terminality() {
        assert!(!TransactionStatus::Pending.is_terminal());
        assert!(TransactionStatus::Completed.is_terminal());
        assert!(TransactionStatus::Failed.is_terminal());
        assert_eq!(TransactionStatus::Failed.to_string(), "failed");
    }

    #[test]
    fn status_serializes_lowercase() {
        let json = serde_json::to_string(&TransactionStatus::Completed).unwrap();
        assert_eq!(json, "\"completed\"");
    }
}
