//! Token Operations Module
//!
//! The token-transfer collaborator the ledgers call after their own state is
//! consistent. Every successful call returns a `TransferRecord` that can be
//! handed back to `TokenBank::revert` to undo it.
//!
//! ## Key Features
//!
//! - **Allowance-based pulls**: deposits move funds with `transfer_from`
//! - **Compensating actions**: `revert` undoes a recorded transfer or burn
//! - **In-memory bank**: `InMemoryTokenBank` for services and tests

use crate::{BTreeMap, Vec};
use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};

use crate::errors::{LedgerError, LedgerResult};
use crate::types::{Address, TokenId};

// ============================================================================
// Types
// ============================================================================

/// Receipt of an executed token movement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, BorshSerialize, BorshDeserialize)]
pub enum TransferRecord {
    /// `spender` moved `amount` from `from` to `to` out of its allowance
    TransferFrom {
        token: TokenId,
        spender: Address,
        from: Address,
        to: Address,
        amount: u128,
    },
    /// `from` moved `amount` to `to`
    Transfer {
        token: TokenId,
        from: Address,
        to: Address,
        amount: u128,
    },
    /// `amount` was destroyed from `from`
    Burn {
        token: TokenId,
        from: Address,
        amount: u128,
    },
}

impl TransferRecord {
    pub fn token(&self) -> &TokenId {
        match self {
            Self::TransferFrom { token, .. }
            | Self::Transfer { token, .. }
            | Self::Burn { token, .. } => token,
        }
    }

    pub fn amount(&self) -> u128 {
        match self {
            Self::TransferFrom { amount, .. }
            | Self::Transfer { amount, .. }
            | Self::Burn { amount, .. } => *amount,
        }
    }
}

// ============================================================================
// Collaborator Trait
// ============================================================================

/// Token ledger the stability pools move funds through
pub trait TokenBank {
    /// Balance of `owner` in `token`
    fn balance_of(&self, token: &TokenId, owner: &Address) -> u128;

    /// Amount `spender` may still pull from `owner`
    fn allowance(&self, token: &TokenId, owner: &Address, spender: &Address) -> u128;

    /// Pull `amount` from `from` to `to` using `spender`'s allowance
    fn transfer_from(
        &mut self,
        token: &TokenId,
        spender: &Address,
        from: &Address,
        to: &Address,
        amount: u128,
    ) -> LedgerResult<TransferRecord>;

    /// Move `amount` held by `from` to `to`
    fn transfer(
        &mut self,
        token: &TokenId,
        from: &Address,
        to: &Address,
        amount: u128,
    ) -> LedgerResult<TransferRecord>;

    /// Destroy `amount` held by `from`
    fn burn(&mut self, token: &TokenId, from: &Address, amount: u128) -> LedgerResult<TransferRecord>;

    /// Undo a previously executed movement
    fn revert(&mut self, record: &TransferRecord) -> LedgerResult<()>;
}

/// Undo `records` newest first.
///
/// A failed revert does not stop the rest; the first failure is returned
/// once every record has been tried.
pub fn revert_all<B: TokenBank + ?Sized>(bank: &mut B, records: &[TransferRecord]) -> LedgerResult<()> {
    let mut first_failure = None;
    for record in records.iter().rev() {
        if let Err(err) = bank.revert(record) {
            first_failure.get_or_insert(err);
        }
    }
    first_failure.map_or(Ok(()), Err)
}

// ============================================================================
// In-Memory Bank
// ============================================================================

/// Balance and allowance book kept in memory
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, BorshSerialize, BorshDeserialize)]
pub struct InMemoryTokenBank {
    balances: BTreeMap<TokenId, BTreeMap<Address, u128>>,
    allowances: BTreeMap<TokenId, BTreeMap<(Address, Address), u128>>,
    supply: BTreeMap<TokenId, u128>,
}

impl InMemoryTokenBank {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create `amount` new tokens for `to`
    pub fn mint(&mut self, token: &TokenId, to: &Address, amount: u128) -> LedgerResult<()> {
        let supply = self.supply.entry(*token).or_insert(0);
        *supply = supply.checked_add(amount).ok_or(LedgerError::Overflow)?;
        self.credit(token, to, amount)
    }

    /// Set the amount `spender` may pull from `owner`
    pub fn approve(&mut self, token: &TokenId, owner: &Address, spender: &Address, amount: u128) {
        self.allowances
            .entry(*token)
            .or_default()
            .insert((*owner, *spender), amount);
    }

    pub fn total_supply(&self, token: &TokenId) -> u128 {
        self.supply.get(token).copied().unwrap_or(0)
    }

    /// Every non-zero holder of `token`
    pub fn holders(&self, token: &TokenId) -> Vec<(Address, u128)> {
        self.balances
            .get(token)
            .map(|book| {
                book.iter()
                    .filter(|(_, balance)| **balance > 0)
                    .map(|(owner, balance)| (*owner, *balance))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn credit(&mut self, token: &TokenId, to: &Address, amount: u128) -> LedgerResult<()> {
        let balance = self.balances.entry(*token).or_default().entry(*to).or_insert(0);
        *balance = balance.checked_add(amount).ok_or(LedgerError::Overflow)?;
        Ok(())
    }

    fn debit(&mut self, token: &TokenId, from: &Address, amount: u128) -> LedgerResult<()> {
        let available = self.balance_of(token, from);
        if available < amount {
            return Err(LedgerError::InsufficientBalance {
                available,
                requested: amount,
            });
        }
        let book = self.balances.entry(*token).or_default();
        if available == amount {
            book.remove(from);
        } else {
            book.insert(*from, available - amount);
        }
        Ok(())
    }

    fn move_funds(&mut self, token: &TokenId, from: &Address, to: &Address, amount: u128) -> LedgerResult<()> {
        self.debit(token, from, amount)?;
        self.credit(token, to, amount)
    }
}

impl TokenBank for InMemoryTokenBank {
    fn balance_of(&self, token: &TokenId, owner: &Address) -> u128 {
        self.balances
            .get(token)
            .and_then(|book| book.get(owner))
            .copied()
            .unwrap_or(0)
    }

    fn allowance(&self, token: &TokenId, owner: &Address, spender: &Address) -> u128 {
        self.allowances
            .get(token)
            .and_then(|book| book.get(&(*owner, *spender)))
            .copied()
            .unwrap_or(0)
    }

    fn transfer_from(
        &mut self,
        token: &TokenId,
        spender: &Address,
        from: &Address,
        to: &Address,
        amount: u128,
    ) -> LedgerResult<TransferRecord> {
        if amount == 0 {
            return Err(LedgerError::ZeroAmount);
        }

        let allowed = self.allowance(token, from, spender);
        if allowed < amount {
            return Err(LedgerError::InsufficientAllowance {
                available: allowed,
                requested: amount,
            });
        }

        self.move_funds(token, from, to, amount)?;
        self.approve(token, from, spender, allowed - amount);

        Ok(TransferRecord::TransferFrom {
            token: *token,
            spender: *spender,
            from: *from,
            to: *to,
            amount,
        })
    }

    fn transfer(
        &mut self,
        token: &TokenId,
        from: &Address,
        to: &Address,
        amount: u128,
    ) -> LedgerResult<TransferRecord> {
        if amount == 0 {
            return Err(LedgerError::ZeroAmount);
        }

        self.move_funds(token, from, to, amount)?;

        Ok(TransferRecord::Transfer {
            token: *token,
            from: *from,
            to: *to,
            amount,
        })
    }

    fn burn(&mut self, token: &TokenId, from: &Address, amount: u128) -> LedgerResult<TransferRecord> {
        if amount == 0 {
            return Err(LedgerError::ZeroAmount);
        }

        self.debit(token, from, amount)?;
        let supply = self.supply.entry(*token).or_insert(0);
        *supply = supply.saturating_sub(amount);

        Ok(TransferRecord::Burn {
            token: *token,
            from: *from,
            amount,
        })
    }

    fn revert(&mut self, record: &TransferRecord) -> LedgerResult<()> {
        match record {
            TransferRecord::TransferFrom { token, spender, from, to, amount } => {
                self.move_funds(token, to, from, *amount)?;
                let allowed = self.allowance(token, from, spender);
                self.approve(token, from, spender, allowed.saturating_add(*amount));
            }
            TransferRecord::Transfer { token, from, to, amount } => {
                self.move_funds(token, to, from, *amount)?;
            }
            TransferRecord::Burn { token, from, amount } => {
                self.mint(token, from, *amount)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOKEN: TokenId = [1u8; 32];
    const ALICE: Address = [2u8; 32];
    const POOL: Address = [3u8; 32];

    fn funded_bank() -> InMemoryTokenBank {
        let mut bank = InMemoryTokenBank::new();
        bank.mint(&TOKEN, &ALICE, 1_000).unwrap();
        bank
    }

    #[test]
    fn test_transfer_from_consumes_allowance() {
        let mut bank = funded_bank();
        bank.approve(&TOKEN, &ALICE, &POOL, 600);

        bank.transfer_from(&TOKEN, &POOL, &ALICE, &POOL, 400).unwrap();

        assert_eq!(bank.balance_of(&TOKEN, &ALICE), 600);
        assert_eq!(bank.balance_of(&TOKEN, &POOL), 400);
        assert_eq!(bank.allowance(&TOKEN, &ALICE, &POOL), 200);
    }

    #[test]
    fn test_transfer_from_failures() {
        let mut bank = funded_bank();

        let result = bank.transfer_from(&TOKEN, &POOL, &ALICE, &POOL, 1);
        assert!(matches!(result, Err(LedgerError::InsufficientAllowance { .. })));

        bank.approve(&TOKEN, &ALICE, &POOL, 5_000);
        let result = bank.transfer_from(&TOKEN, &POOL, &ALICE, &POOL, 2_000);
        assert_eq!(
            result,
            Err(LedgerError::InsufficientBalance { available: 1_000, requested: 2_000 })
        );
        // Nothing moved
        assert_eq!(bank.balance_of(&TOKEN, &ALICE), 1_000);
        assert_eq!(bank.allowance(&TOKEN, &ALICE, &POOL), 5_000);

        assert_eq!(bank.transfer(&TOKEN, &ALICE, &POOL, 0), Err(LedgerError::ZeroAmount));
    }

    #[test]
    fn test_revert_restores_balances_and_allowance() {
        let mut bank = funded_bank();
        bank.approve(&TOKEN, &ALICE, &POOL, 1_000);
        let before = bank.clone();

        let pulled = bank.transfer_from(&TOKEN, &POOL, &ALICE, &POOL, 700).unwrap();
        let burned = bank.burn(&TOKEN, &POOL, 300).unwrap();
        let paid = bank.transfer(&TOKEN, &POOL, &ALICE, 100).unwrap();
        assert_eq!(bank.total_supply(&TOKEN), 700);

        revert_all(&mut bank, &[pulled, burned, paid]).unwrap();

        assert_eq!(bank.balance_of(&TOKEN, &ALICE), before.balance_of(&TOKEN, &ALICE));
        assert_eq!(bank.balance_of(&TOKEN, &POOL), 0);
        assert_eq!(bank.allowance(&TOKEN, &ALICE, &POOL), 1_000);
        assert_eq!(bank.total_supply(&TOKEN), 1_000);
    }

    #[test]
    fn test_revert_all_continues_past_failure() {
        let mut bank = funded_bank();
        let first = bank.transfer(&TOKEN, &ALICE, &POOL, 100).unwrap();
        let second = bank.transfer(&TOKEN, &ALICE, &POOL, 200).unwrap();
        // Funds leave the pool outside the records, so the newer one cannot be undone
        bank.transfer(&TOKEN, &POOL, &[4u8; 32], 150).unwrap();

        let result = revert_all(&mut bank, &[first, second]);

        assert_eq!(
            result,
            Err(LedgerError::InsufficientBalance { available: 150, requested: 200 })
        );
        // The older record was still reverted
        assert_eq!(bank.balance_of(&TOKEN, &ALICE), 800);
        assert_eq!(bank.balance_of(&TOKEN, &POOL), 50);
    }

    #[test]
    fn test_holders() {
        let mut bank = funded_bank();
        bank.transfer(&TOKEN, &ALICE, &POOL, 1_000).unwrap();
        assert_eq!(bank.holders(&TOKEN), vec![(POOL, 1_000)]);
    }
}
