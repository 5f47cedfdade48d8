//! Account ledger: the only path through which account rows are read or written.

use chrono::Utc;
use tracing::{error, info, warn};

use crate::Amount;
use crate::config::Limits;
use crate::engine::{AmountViolation, LedgerError};
use crate::model::{Account, AccountId};
use crate::store::{Constraint, Executor, StoreError};

/// Stateless façade over the account rows of a store handle.
#[derive(Debug, Clone)]
pub struct AccountLedger {
    max_initial_balance: Amount,
}

impl AccountLedger {
    pub fn new(limits: &Limits) -> Self {
        Self {
            max_initial_balance: limits.max_initial_balance,
        }
    }

    /// Persist a new account.
    ///
    /// Duplicates are caught by the store's uniqueness constraint, not by a
    /// read beforehand.
    pub async fn create<E>(
        &self,
        exec: &mut E,
        id: i64,
        initial_balance: Amount,
    ) -> Result<Account, LedgerError>
    where
        E: Executor + ?Sized,
    {
        self.check_balance(initial_balance)?;
        let id = AccountId::new(id).ok_or(LedgerError::InvalidAccountId(id))?;

        let now = Utc::now();
        let account = Account {
            id,
            balance: initial_balance,
            created_at: now,
            updated_at: now,
        };

        match exec.insert_account(&account).await {
            Ok(()) => {
                info!(account = %id, balance = %initial_balance, "account created");
                Ok(account)
            }
            Err(StoreError::UniqueViolation(Constraint::AccountId)) => {
                warn!(account = %id, "duplicate account creation attempt");
                Err(LedgerError::DuplicateAccount(id))
            }
            Err(e) => {
                error!(account = %id, error = %e, "failed to create account");
                Err(e.into())
            }
        }
    }

    /// Non-locking read.
    pub async fn read<E>(&self, exec: &mut E, id: AccountId) -> Result<Account, LedgerError>
    where
        E: Executor + ?Sized,
    {
        exec.account(id)
            .await?
            .ok_or(LedgerError::AccountNotFound(id))
    }

    /// Read while taking the row's exclusive lock for the rest of the unit of work.
    pub async fn read_for_update<E>(
        &self,
        exec: &mut E,
        id: AccountId,
    ) -> Result<Account, LedgerError>
    where
        E: Executor + ?Sized,
    {
        match exec.account_for_update(id).await {
            Ok(Some(account)) => Ok(account),
            Ok(None) => {
                warn!(account = %id, "account not found");
                Err(LedgerError::AccountNotFound(id))
            }
            Err(e) => {
                error!(account = %id, error = %e, "failed to lock account");
                Err(e.into())
            }
        }
    }

    pub async fn write_balance<E>(
        &self,
        exec: &mut E,
        id: AccountId,
        new_balance: Amount,
    ) -> Result<Account, LedgerError>
    where
        E: Executor + ?Sized,
    {
        if new_balance.is_negative() {
            return Err(LedgerError::invalid_amount(
                new_balance,
                AmountViolation::Negative,
            ));
        }

        match exec.update_balance(id, new_balance, Utc::now()).await {
            Ok(Some(account)) => {
                info!(account = %id, balance = %new_balance, "account balance updated");
                Ok(account)
            }
            Ok(None) => {
                warn!(account = %id, "no account found to update");
                Err(LedgerError::AccountNotFound(id))
            }
            Err(e) => {
                error!(account = %id, error = %e, "failed to update account balance");
                Err(e.into())
            }
        }
    }

    /// All accounts visible to `exec`, ordered by identity.
    pub async fn list<E>(&self, exec: &mut E) -> Result<Vec<Account>, LedgerError>
    where
        E: Executor + ?Sized,
    {
        Ok(exec.accounts().await?)
    }

    fn check_balance(&self, balance: Amount) -> Result<(), LedgerError> {
        let violation = if balance.is_negative() {
            Some(AmountViolation::Negative)
        } else if balance > self.max_initial_balance {
            Some(AmountViolation::AboveMaximum(self.max_initial_balance))
        } else if !balance.fits_scale() {
            Some(AmountViolation::TooPrecise)
        } else {
            None
        };
        match violation {
            Some(reason) => Err(LedgerError::invalid_amount(balance, reason)),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::store::Store;

    fn amount(s: &str) -> Amount {
        s.parse().unwrap()
    }

    fn setup() -> (AccountLedger, Store) {
        (
            AccountLedger::new(&Limits::default()),
            Store::in_memory(&StoreConfig::default()),
        )
    }

    #[tokio::test]
    async fn create_then_read_round_trips() {
        let (ledger, mut store) = setup();
        let created = ledger.create(&mut store, 123, amount("1000.50")).await.unwrap();
        assert_eq!(created.created_at, created.updated_at);

        let read = ledger.read(&mut store, created.id).await.unwrap();
        assert_eq!(read, created);
    }

    #[tokio::test]
    async fn create_rejects_bad_input() {
        let (ledger, mut store) = setup();

        let err = ledger.create(&mut store, 1, amount("-0.01")).await.unwrap_err();
        assert!(matches!(
            err,
            LedgerError::InvalidAmount { reason: AmountViolation::Negative, .. }
        ));

        let err = ledger
            .create(&mut store, 1, amount("10000000000.01"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LedgerError::InvalidAmount { reason: AmountViolation::AboveMaximum(_), .. }
        ));

        let err = ledger
            .create(&mut store, 1, amount("0.000000001"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LedgerError::InvalidAmount { reason: AmountViolation::TooPrecise, .. }
        ));

        let err = ledger.create(&mut store, 0, amount("1")).await.unwrap_err();
        assert!(matches!(err, LedgerError::InvalidAccountId(0)));

        assert!(ledger.list(&mut store).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn zero_and_ceiling_balances_are_allowed() {
        let (ledger, mut store) = setup();
        ledger.create(&mut store, 1, Amount::ZERO).await.unwrap();
        ledger
            .create(&mut store, 2, amount("10000000000"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn duplicate_create_keeps_original_balance() {
        let (ledger, mut store) = setup();
        let original = ledger.create(&mut store, 7, amount("5")).await.unwrap();

        let err = ledger.create(&mut store, 7, amount("500")).await.unwrap_err();
        assert!(matches!(err, LedgerError::DuplicateAccount(id) if id == original.id));
        assert_eq!(
            ledger.read(&mut store, original.id).await.unwrap().balance,
            amount("5")
        );
    }

    #[tokio::test]
    async fn missing_account_is_not_found() {
        let (ledger, mut store) = setup();
        let id = AccountId::new(404).unwrap();

        assert!(matches!(
            ledger.read(&mut store, id).await,
            Err(LedgerError::AccountNotFound(_))
        ));

        let mut unit = store.open_unit_of_work().unwrap();
        assert!(matches!(
            ledger.read_for_update(&mut unit, id).await,
            Err(LedgerError::AccountNotFound(_))
        ));
        assert!(matches!(
            ledger.write_balance(&mut unit, id, amount("1")).await,
            Err(LedgerError::AccountNotFound(_))
        ));
    }

    #[tokio::test]
    async fn write_balance_refuses_negative() {
        let (ledger, mut store) = setup();
        let account = ledger.create(&mut store, 1, amount("10")).await.unwrap();

        let mut unit = store.open_unit_of_work().unwrap();
        ledger.read_for_update(&mut unit, account.id).await.unwrap();
        let err = ledger
            .write_balance(&mut unit, account.id, amount("-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidAmount { .. }));

        let updated = ledger
            .write_balance(&mut unit, account.id, amount("2.5"))
            .await
            .unwrap();
        assert!(updated.updated_at >= account.updated_at);
        unit.commit().unwrap();

        assert_eq!(
            ledger.read(&mut store, account.id).await.unwrap().balance,
            amount("2.5")
        );
    }
}
