//! Account store: the single source of truth for balances and nonces
//!
//! Balance and nonce live in one stored value per address, so a reader
//! sees either the old account or the new one, never a mix. Mutations are
//! staged into a [`StorageBatch`] and committed together with whatever the
//! caller adds (journal removal, transaction record, ...).

use crate::error::{Error, Result};
use crate::storage::{Storage, StorageBatch, StorageExt, Table};
use crate::types::{Account, Address, Amount};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Meta key holding the total issued by system transactions
pub const TOTAL_ISSUED_KEY: &[u8] = b"total_issued";

/// Change requested for one account
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccountDelta {
    /// Account to change
    pub address: Address,
    /// Signed balance change in minor units
    pub balance_delta: i128,
    /// Amount to add to the nonce
    pub nonce_advance: u64,
}

impl AccountDelta {
    /// Credit `amount`
    pub fn credit(address: Address, amount: Amount) -> Self {
        Self {
            address,
            balance_delta: i128::from(amount.minor_units()),
            nonce_advance: 0,
        }
    }

    /// Debit `amount`, optionally advancing the nonce
    pub fn debit(address: Address, amount: Amount, nonce_advance: u64) -> Self {
        Self {
            address,
            balance_delta: -i128::from(amount.minor_units()),
            nonce_advance,
        }
    }
}

/// Before/after view of one account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceChange {
    /// Account
    pub address: Address,
    /// Balance before
    pub previous: Amount,
    /// Balance after
    pub current: Amount,
}

/// Durable address → account map plus the issuance counter
#[derive(Clone)]
pub struct AccountStore {
    storage: Arc<dyn Storage>,
}

impl AccountStore {
    /// Create over a storage backend
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    /// Account state; zero balance and nonce when never touched
    pub fn get(&self, address: &Address) -> Result<Account> {
        Ok(self
            .storage
            .get_value::<Account>(Table::Accounts, address.as_bytes())?
            .unwrap_or_else(|| Account::empty(*address)))
    }

    /// Apply one delta in its own durable batch
    pub fn apply_delta(
        &self,
        address: Address,
        balance_delta: i128,
        nonce_advance: u64,
    ) -> Result<Account> {
        let delta = AccountDelta {
            address,
            balance_delta,
            nonce_advance,
        };
        self.apply_deltas(&[delta], StorageBatch::new())?;
        self.get(&address)
    }

    /// Validate and commit several deltas atomically with `extra` ops
    ///
    /// Deltas on the same address are summed first. Nothing is written if
    /// any resulting balance would be negative or overflow.
    pub fn apply_deltas(
        &self,
        deltas: &[AccountDelta],
        extra: StorageBatch,
    ) -> Result<Vec<BalanceChange>> {
        let (mut batch, changes) = self.stage_deltas(deltas)?;
        batch.extend(extra);
        self.storage.write(batch)?;
        Ok(changes)
    }

    /// Compute new account values for `deltas` without writing
    pub fn stage_deltas(
        &self,
        deltas: &[AccountDelta],
    ) -> Result<(StorageBatch, Vec<BalanceChange>)> {
        let mut combined: BTreeMap<Address, (i128, u64)> = BTreeMap::new();
        for delta in deltas {
            let slot = combined.entry(delta.address).or_insert((0, 0));
            slot.0 = slot
                .0
                .checked_add(delta.balance_delta)
                .ok_or_else(|| Error::Overflow(format!("balance delta on {}", delta.address)))?;
            slot.1 = slot
                .1
                .checked_add(delta.nonce_advance)
                .ok_or_else(|| Error::Overflow(format!("nonce advance on {}", delta.address)))?;
        }

        let mut batch = StorageBatch::new();
        let mut changes = Vec::with_capacity(combined.len());

        for (address, (balance_delta, nonce_advance)) in combined {
            let account = self.get(&address)?;
            let next = i128::from(account.balance.minor_units()) + balance_delta;

            if next < 0 {
                return Err(Error::InsufficientFunds {
                    address,
                    required: Amount::new(u64::try_from(-balance_delta).unwrap_or(u64::MAX)),
                    available: account.balance,
                });
            }
            let balance = u64::try_from(next)
                .map(Amount::new)
                .map_err(|_| Error::Overflow(format!("balance of {}", address)))?;
            let nonce = account
                .nonce
                .checked_add(nonce_advance)
                .ok_or_else(|| Error::Overflow(format!("nonce of {}", address)))?;

            let updated = Account {
                address,
                balance,
                nonce,
            };
            batch.put_value(Table::Accounts, address.as_bytes().to_vec(), &updated)?;
            changes.push(BalanceChange {
                address,
                previous: account.balance,
                current: balance,
            });
        }

        Ok((batch, changes))
    }

    /// Stage balances back to recorded values, keeping current nonces
    pub fn stage_restore(&self, balances: &[(Address, Amount)]) -> Result<StorageBatch> {
        let mut batch = StorageBatch::new();
        let mut seen = Vec::with_capacity(balances.len());
        for (address, balance) in balances {
            // First recorded value wins when an address repeats
            if seen.contains(address) {
                continue;
            }
            seen.push(*address);

            let mut account = self.get(address)?;
            account.balance = *balance;
            batch.put_value(Table::Accounts, address.as_bytes().to_vec(), &account)?;
        }
        Ok(batch)
    }

    /// Stage an increase of the issuance counter
    pub fn stage_issuance(&self, amount: Amount) -> Result<StorageBatch> {
        let issued = self
            .total_issued()?
            .checked_add(u128::from(amount.minor_units()))
            .ok_or_else(|| Error::Overflow("total issuance".to_string()))?;
        let mut batch = StorageBatch::new();
        batch.put_value(Table::Meta, TOTAL_ISSUED_KEY.to_vec(), &issued)?;
        Ok(batch)
    }

    /// Sum of all system issuance
    pub fn total_issued(&self) -> Result<u128> {
        Ok(self
            .storage
            .get_value::<u128>(Table::Meta, TOTAL_ISSUED_KEY)?
            .unwrap_or(0))
    }

    /// Sum of all balances
    pub fn total_balance(&self) -> Result<u128> {
        Ok(self
            .all()?
            .iter()
            .map(|account| u128::from(account.balance.minor_units()))
            .sum())
    }

    /// Every stored account
    pub fn all(&self) -> Result<Vec<Account>> {
        self.storage.scan_values(Table::Accounts)
    }

    /// Fail unless balances sum to total issuance
    pub fn check_conservation(&self) -> Result<()> {
        let issued = self.total_issued()?;
        let held = self.total_balance()?;
        if issued != held {
            return Err(Error::InvariantViolation(format!(
                "conservation broken: issued {} but accounts hold {}",
                issued, held
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    fn store() -> AccountStore {
        AccountStore::new(Arc::new(MemoryStorage::new()))
    }

    fn addr(byte: u8) -> Address {
        Address::from_bytes([byte; 20])
    }

    #[test]
    fn test_missing_account_defaults() {
        let accounts = store();
        let account = accounts.get(&addr(1)).unwrap();
        assert_eq!(account.balance, Amount::ZERO);
        assert_eq!(account.nonce, 0);
    }

    #[test]
    fn test_apply_delta() {
        let accounts = store();
        accounts.apply_delta(addr(1), 100, 0).unwrap();
        let account = accounts.apply_delta(addr(1), -40, 1).unwrap();
        assert_eq!(account.balance, Amount::new(60));
        assert_eq!(account.nonce, 1);
    }

    #[test]
    fn test_negative_balance_refused() {
        let accounts = store();
        accounts.apply_delta(addr(1), 10, 0).unwrap();

        let err = accounts.apply_delta(addr(1), -11, 1).unwrap_err();
        assert!(matches!(err, Error::InsufficientFunds { .. }));

        let account = accounts.get(&addr(1)).unwrap();
        assert_eq!(account.balance, Amount::new(10));
        assert_eq!(account.nonce, 0);
    }

    #[test]
    fn test_apply_deltas_all_or_nothing() {
        let accounts = store();
        accounts.apply_delta(addr(1), 50, 0).unwrap();

        let deltas = [
            AccountDelta::credit(addr(2), Amount::new(30)),
            AccountDelta::debit(addr(1), Amount::new(60), 1),
        ];
        assert!(accounts.apply_deltas(&deltas, StorageBatch::new()).is_err());
        assert_eq!(accounts.get(&addr(2)).unwrap().balance, Amount::ZERO);
    }

    #[test]
    fn test_self_transfer_nets_out() {
        let accounts = store();
        accounts.apply_delta(addr(1), 50, 0).unwrap();

        let deltas = [
            AccountDelta::debit(addr(1), Amount::new(50), 1),
            AccountDelta::credit(addr(1), Amount::new(50)),
        ];
        let changes = accounts.apply_deltas(&deltas, StorageBatch::new()).unwrap();
        assert_eq!(changes.len(), 1);

        let account = accounts.get(&addr(1)).unwrap();
        assert_eq!(account.balance, Amount::new(50));
        assert_eq!(account.nonce, 1);
    }

    #[test]
    fn test_restore_keeps_nonce() {
        let accounts = store();
        accounts.apply_delta(addr(1), 50, 3).unwrap();

        let batch = accounts.stage_restore(&[(addr(1), Amount::new(7))]).unwrap();
        accounts.apply_deltas(&[], batch).unwrap();

        let account = accounts.get(&addr(1)).unwrap();
        assert_eq!(account.balance, Amount::new(7));
        assert_eq!(account.nonce, 3);
    }

    #[test]
    fn test_conservation() {
        let accounts = store();
        let batch = accounts.stage_issuance(Amount::new(100)).unwrap();
        accounts
            .apply_deltas(&[AccountDelta::credit(addr(1), Amount::new(100))], batch)
            .unwrap();
        accounts.check_conservation().unwrap();

        accounts.apply_delta(addr(2), 1, 0).unwrap();
        assert!(matches!(
            accounts.check_conservation(),
            Err(Error::InvariantViolation(_))
        ));
    }
}
