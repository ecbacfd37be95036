//! Core Types for the stability pools
//!
//! Value types shared by the ledgers, the manager and the collaborators.

use crate::{BTreeMap, Vec};
use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};

use crate::math::WideUint;

/// Type alias for addresses (32-byte hash)
pub type Address = [u8; 32];

/// Type alias for token identifiers (debt and collateral tokens)
pub type TokenId = [u8; 32];

// ============ Amounts ============

/// An amount of one token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, BorshSerialize, BorshDeserialize)]
pub struct TokenAmount {
    pub token: TokenId,
    pub amount: u128,
}

impl TokenAmount {
    pub fn new(token: TokenId, amount: u128) -> Self {
        Self { token, amount }
    }
}

// ============ Deposit Snapshot ============

/// Global product-sum state captured at a depositor's last interaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, BorshSerialize, BorshDeserialize)]
pub struct DepositSnapshot {
    /// Product factor P at snapshot time
    pub p: u128,
    /// Scale at snapshot time
    pub scale: u64,
    /// Epoch at snapshot time
    pub epoch: u64,
    /// Collateral sum S per token at `(epoch, scale)`
    pub coll_sums: BTreeMap<TokenId, WideUint>,
}

impl DepositSnapshot {
    /// All-zero snapshot reported for a closed position
    pub fn cleared() -> Self {
        Self {
            p: 0,
            scale: 0,
            epoch: 0,
            coll_sums: BTreeMap::new(),
        }
    }

    /// Recorded sum for a collateral token (zero if never seen)
    pub fn coll_sum(&self, token: &TokenId) -> WideUint {
        self.coll_sums.get(token).copied().unwrap_or(WideUint::ZERO)
    }
}

// ============ Offset Instructions ============

/// One debt token's share of a liquidation, as split by the liquidation side
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, BorshSerialize, BorshDeserialize)]
pub struct RemainingStability {
    /// Pool account of the ledger that should absorb this entry
    pub pool: Address,
    /// Debt token of that ledger
    pub debt_token: TokenId,
    /// Deposits left in the pool as seen by the liquidation side
    pub remaining: u128,
    /// Debt to cancel against the pool
    pub debt_to_offset: u128,
    /// Collateral handed to the pool for that debt
    pub coll_gained: Vec<TokenAmount>,
}

// ============ Transaction Context ============

/// Caller and height of the transaction being executed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxContext {
    pub caller: Address,
    pub block_height: u64,
}

impl TxContext {
    pub fn new(caller: Address, block_height: u64) -> Self {
        Self { caller, block_height }
    }
}
