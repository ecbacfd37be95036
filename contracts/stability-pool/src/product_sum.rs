//! Product-Sum State
//!
//! Global P/S bookkeeping of one ledger. Deposits shrink by the running
//! product P; collateral accrues per unit staked in the sums
//! `S[epoch][scale][token]`. Depositors are valued lazily against the
//! snapshot taken at their last interaction.

use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};

use spledger_common::{
    constants::precision::DECIMAL_PRECISION,
    errors::{LedgerError, LedgerResult},
    math::{
        compounded_stake, gain_from_sums, loss_per_unit_staked, next_product, per_unit_staked,
        wide_mul,
        ProductStep, WideUint, U256,
    },
    types::{DepositSnapshot, TokenAmount, TokenId},
    BTreeMap, Vec,
};

/// Sums by collateral token at one epoch/scale
pub type ScaleSums = BTreeMap<TokenId, WideUint>;

/// What an offset did to P, the scale and the epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffsetEffects {
    pub step: ProductStep,
    pub p: u128,
    pub scale: u64,
    pub epoch: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, BorshSerialize, BorshDeserialize)]
pub struct ProductSum {
    /// Running product factor, 1e18 = 1.0
    pub p: u128,
    pub current_scale: u64,
    pub current_epoch: u64,
    /// epoch -> scale -> token -> S
    pub epoch_to_scale_to_sum: BTreeMap<u64, BTreeMap<u64, ScaleSums>>,
    /// Overcharge carried from the last rounded-up debt-loss division
    pub last_debt_error: u128,
    /// Remainder of the last gain division, per collateral token
    pub last_coll_error: BTreeMap<TokenId, u128>,
    /// Collateral tokens ever credited, in first-credit order
    pub used_coll_tokens: Vec<TokenId>,
}

impl Default for ProductSum {
    fn default() -> Self {
        Self::new()
    }
}

impl ProductSum {
    pub fn new() -> Self {
        Self {
            p: DECIMAL_PRECISION,
            current_scale: 0,
            current_epoch: 0,
            epoch_to_scale_to_sum: BTreeMap::new(),
            last_debt_error: 0,
            last_coll_error: BTreeMap::new(),
            used_coll_tokens: Vec::new(),
        }
    }

    /// `S[epoch][scale][token]`, zero when never written
    pub fn sum(&self, epoch: u64, scale: u64, token: &TokenId) -> WideUint {
        self.epoch_to_scale_to_sum
            .get(&epoch)
            .and_then(|scales| scales.get(&scale))
            .and_then(|sums| sums.get(token))
            .copied()
            .unwrap_or(WideUint::ZERO)
    }

    /// Snapshot of the current P/scale/epoch and sums
    pub fn snapshot(&self) -> DepositSnapshot {
        let coll_sums = self
            .used_coll_tokens
            .iter()
            .map(|token| (*token, self.sum(self.current_epoch, self.current_scale, token)))
            .filter(|(_, sum)| !sum.is_zero())
            .collect();

        DepositSnapshot {
            p: self.p,
            scale: self.current_scale,
            epoch: self.current_epoch,
            coll_sums,
        }
    }

    /// Current value of a deposit of `initial` taken at `snapshot`
    pub fn compounded(&self, initial: u128, snapshot: &DepositSnapshot) -> LedgerResult<u128> {
        if snapshot.epoch < self.current_epoch {
            return Ok(0);
        }
        let scale_diff = self
            .current_scale
            .checked_sub(snapshot.scale)
            .ok_or(LedgerError::Underflow)?;

        compounded_stake(initial, snapshot.p, self.p, scale_diff)
    }

    /// Collateral of `token` accrued to a deposit of `initial` since `snapshot`
    pub fn coll_gain(
        &self,
        initial: u128,
        snapshot: &DepositSnapshot,
        token: &TokenId,
    ) -> LedgerResult<u128> {
        if initial == 0 {
            return Ok(0);
        }

        let at_snapshot = self.sum(snapshot.epoch, snapshot.scale, token).to_u256();
        let same_scale_delta = at_snapshot
            .checked_sub(snapshot.coll_sum(token).to_u256())
            .ok_or(LedgerError::Underflow)?;
        let next_scale_sum = self.sum(snapshot.epoch, snapshot.scale + 1, token).to_u256();

        gain_from_sums(initial, snapshot.p, same_scale_delta, next_scale_sum)
    }

    /// Non-zero gains over every used collateral token
    pub fn coll_gains(
        &self,
        initial: u128,
        snapshot: &DepositSnapshot,
    ) -> LedgerResult<Vec<TokenAmount>> {
        let mut gains = Vec::new();
        for token in &self.used_coll_tokens {
            let gain = self.coll_gain(initial, snapshot, token)?;
            if gain > 0 {
                gains.push(TokenAmount::new(*token, gain));
            }
        }
        Ok(gains)
    }

    /// Absorb `debt` (at most `total_deposits`) and credit `coll` per unit staked.
    ///
    /// Every quantity is computed before anything is written, so an error
    /// leaves the state untouched.
    pub fn apply_offset(
        &mut self,
        debt: u128,
        coll: &[TokenAmount],
        total_deposits: u128,
    ) -> LedgerResult<OffsetEffects> {
        if total_deposits == 0 {
            return Err(LedgerError::DivisionByZero);
        }
        if debt > total_deposits {
            return Err(LedgerError::InvalidInput {
                param: "debt",
                reason: "Debt exceeds total deposits",
            });
        }

        // Collateral sums, accrued at the P in force before this offset
        let mut staged: Vec<(TokenId, WideUint, u128)> = Vec::with_capacity(coll.len());
        for entry in coll.iter().filter(|c| c.amount > 0) {
            let mut error = self.last_coll_error.get(&entry.token).copied().unwrap_or(0);
            let gain_per_unit = per_unit_staked(entry.amount, total_deposits, &mut error)?;
            let marginal = wide_mul(gain_per_unit, U256::from(self.p))?;
            let updated = self
                .sum(self.current_epoch, self.current_scale, &entry.token)
                .to_u256()
                .checked_add(marginal)
                .ok_or(LedgerError::Overflow)?;
            staged.push((entry.token, WideUint::from(updated), error));
        }

        // Debt loss per unit staked, rounded up; a full wipe is exactly 1.0
        let (loss_per_unit, debt_error) = if debt == total_deposits {
            (DECIMAL_PRECISION, 0)
        } else {
            let mut excess = self.last_debt_error;
            let loss = loss_per_unit_staked(debt, total_deposits, &mut excess)?;
            (loss, excess)
        };

        let step = next_product(self.p, loss_per_unit)?;

        // Commit
        let (epoch, scale) = (self.current_epoch, self.current_scale);
        for (token, sum, error) in staged {
            if !self.used_coll_tokens.contains(&token) {
                self.used_coll_tokens.push(token);
            }
            self.epoch_to_scale_to_sum
                .entry(epoch)
                .or_default()
                .entry(scale)
                .or_default()
                .insert(token, sum);
            self.last_coll_error.insert(token, error);
        }
        self.last_debt_error = debt_error;

        match step {
            ProductStep::Depleted => {
                self.current_epoch += 1;
                self.current_scale = 0;
                self.p = DECIMAL_PRECISION;
                self.last_debt_error = 0;
                self.last_coll_error.clear();
            }
            ProductStep::Shrunk(p) => self.p = p,
            ProductStep::Rescaled { p, scales } => {
                self.p = p;
                self.current_scale += scales;
            }
        }

        Ok(OffsetEffects {
            step,
            p: self.p,
            scale: self.current_scale,
            epoch: self.current_epoch,
        })
    }
}
