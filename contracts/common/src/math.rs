//! Fixed-Point Math for the stability pools
//!
//! 18-decimal fixed-point arithmetic over `u128` amounts. Every
//! multiply-divide runs through a checked 256-bit intermediate so that
//! `amount * DECIMAL_PRECISION` and `gain * P` can never wrap.
//!
//! ## Key Features
//!
//! - **Checked helpers**: `mul_div`, `safe_add`, `safe_sub`, `to_u128`
//! - **Error diffusion**: `per_unit_staked` carries the division remainder
//!   into the next call so repeated small offsets lose nothing to truncation;
//!   `loss_per_unit_staked` rounds up and carries the overcharge instead
//! - **Product-sum steps**: `next_product`, `compounded_stake` and
//!   `gain_from_sums` implement the epoch/scale compounding rules

use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};

use crate::constants::precision::{DECIMAL_PRECISION, PERCENT_DIVISOR};
use crate::constants::stability_pool::{COMPOUNDING_DUST_DIVISOR, SCALE_FACTOR};
use crate::errors::{LedgerError, LedgerResult};

uint::construct_uint! {
    /// 256-bit unsigned integer for intermediate products
    pub struct U256(4);
}

// ============ Wide Storage ============

/// 256-bit value in a serialisable form (little-endian 64-bit words)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, BorshSerialize, BorshDeserialize)]
pub struct WideUint(pub [u64; 4]);

impl WideUint {
    pub const ZERO: WideUint = WideUint([0; 4]);

    pub fn is_zero(&self) -> bool {
        self.0 == [0; 4]
    }

    pub fn to_u256(self) -> U256 {
        U256(self.0)
    }
}

impl From<U256> for WideUint {
    fn from(value: U256) -> Self {
        WideUint(value.0)
    }
}

impl From<WideUint> for U256 {
    fn from(value: WideUint) -> Self {
        U256(value.0)
    }
}

impl From<u128> for WideUint {
    fn from(value: u128) -> Self {
        WideUint(U256::from(value).0)
    }
}

// ============ Checked Helpers ============

/// Narrow a 256-bit value back to `u128`
pub fn to_u128(value: U256) -> LedgerResult<u128> {
    if value > U256::from(u128::MAX) {
        return Err(LedgerError::Overflow);
    }
    Ok(value.low_u128())
}

/// `a * b / c` with a 256-bit intermediate, rounding down
pub fn mul_div(a: u128, b: u128, c: u128) -> LedgerResult<u128> {
    if c == 0 {
        return Err(LedgerError::DivisionByZero);
    }
    to_u128(U256::from(a) * U256::from(b) / U256::from(c))
}

/// Checked 256-bit multiply
pub fn wide_mul(a: U256, b: U256) -> LedgerResult<U256> {
    a.checked_mul(b).ok_or(LedgerError::Overflow)
}

/// Safe addition with overflow check
pub fn safe_add(a: u128, b: u128) -> LedgerResult<u128> {
    a.checked_add(b).ok_or(LedgerError::Overflow)
}

/// Safe subtraction with underflow check
pub fn safe_sub(a: u128, b: u128) -> LedgerResult<u128> {
    a.checked_sub(b).ok_or(LedgerError::Underflow)
}

/// `part / whole` in basis points
pub fn ratio_bps(part: u128, whole: u128) -> LedgerResult<u128> {
    mul_div(part, PERCENT_DIVISOR, whole)
}

// ============ Error Diffusion ============

/// Per-unit-staked share of `amount` across `total`, in 1e18 fixed point.
///
/// Computes `floor((amount * 1e18 + carried_error) / total)` and leaves the
/// new remainder in `carried_error`, so the truncated part of one offset is
/// credited by the next one.
pub fn per_unit_staked(amount: u128, total: u128, carried_error: &mut u128) -> LedgerResult<U256> {
    if total == 0 {
        return Err(LedgerError::DivisionByZero);
    }

    let numerator = wide_mul(U256::from(amount), U256::from(DECIMAL_PRECISION))?
        .checked_add(U256::from(*carried_error))
        .ok_or(LedgerError::Overflow)?;
    let total = U256::from(total);

    let quotient = numerator / total;
    // remainder < total <= u128::MAX
    *carried_error = (numerator % total).low_u128();

    Ok(quotient)
}

/// Debt loss per unit staked for absorbing `amount` out of `total`, in 1e18
/// fixed point, rounded up.
///
/// `carried_excess` is the amount (in `amount * 1e18` units) earlier calls
/// charged beyond the exact loss. It is deducted before dividing and replaced
/// by this call's overcharge, so deposits are never valued above what the
/// pool holds and the rounding does not accumulate.
pub fn loss_per_unit_staked(
    amount: u128,
    total: u128,
    carried_excess: &mut u128,
) -> LedgerResult<u128> {
    if total == 0 {
        return Err(LedgerError::DivisionByZero);
    }

    let charge = wide_mul(U256::from(amount), U256::from(DECIMAL_PRECISION))?;
    let excess = U256::from(*carried_excess);
    if charge <= excess {
        *carried_excess = (excess - charge).low_u128();
        return Ok(0);
    }

    let numerator = charge - excess;
    let total = U256::from(total);
    let remainder = numerator % total;
    let mut quotient = numerator / total;
    if remainder.is_zero() {
        *carried_excess = 0;
    } else {
        quotient = quotient + U256::one();
        // total - remainder < total <= u128::MAX
        *carried_excess = (total - remainder).low_u128();
    }

    to_u128(quotient)
}

// ============ Product-Sum Steps ============

/// Result of multiplying the running product P by `1 - loss_per_unit`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProductStep {
    /// Loss consumed every deposit; a new epoch starts at P = 1
    Depleted,
    /// P stays within the current scale
    Shrunk(u128),
    /// P dropped below `SCALE_FACTOR` and was multiplied by it `scales`
    /// times until it was back at or above it
    Rescaled { p: u128, scales: u64 },
}

/// Apply a debt loss rate to the product factor.
///
/// The resulting P is always at least `SCALE_FACTOR`.
pub fn next_product(p: u128, loss_per_unit: u128) -> LedgerResult<ProductStep> {
    let factor = DECIMAL_PRECISION
        .checked_sub(loss_per_unit)
        .ok_or(LedgerError::InvalidInput {
            param: "loss_per_unit",
            reason: "Loss rate above 1.0",
        })?;

    if factor == 0 {
        return Ok(ProductStep::Depleted);
    }

    let shrunk = mul_div(p, factor, DECIMAL_PRECISION)?;
    if shrunk >= SCALE_FACTOR {
        return Ok(ProductStep::Shrunk(shrunk));
    }

    // Rescale from the unrounded product so nothing is lost between scales
    let product = wide_mul(U256::from(p), U256::from(factor))?;
    if product.is_zero() {
        return Ok(ProductStep::Depleted);
    }

    let scale_factor = U256::from(SCALE_FACTOR);
    let mut multiplier = U256::one();
    let mut scales = 0u64;
    loop {
        multiplier = multiplier.checked_mul(scale_factor).ok_or(LedgerError::Overflow)?;
        scales += 1;
        let rescaled = product.checked_mul(multiplier).ok_or(LedgerError::Overflow)?
            / U256::from(DECIMAL_PRECISION);
        if rescaled >= scale_factor {
            return Ok(ProductStep::Rescaled {
                p: to_u128(rescaled)?,
                scales,
            });
        }
    }
}

/// Current value of a deposit of `initial` taken when P was `snapshot_p`,
/// `scale_diff` scales ago, within the same epoch.
///
/// More than one scale behind counts as fully consumed. Results below
/// `initial / COMPOUNDING_DUST_DIVISOR` are rounded to zero.
pub fn compounded_stake(
    initial: u128,
    snapshot_p: u128,
    current_p: u128,
    scale_diff: u64,
) -> LedgerResult<u128> {
    if initial == 0 {
        return Ok(0);
    }
    if snapshot_p == 0 {
        return Err(LedgerError::DivisionByZero);
    }

    let scaled = wide_mul(U256::from(initial), U256::from(current_p))? / U256::from(snapshot_p);
    let compounded = match scale_diff {
        0 => to_u128(scaled)?,
        1 => to_u128(scaled / U256::from(SCALE_FACTOR))?,
        _ => 0,
    };

    if compounded < initial / COMPOUNDING_DUST_DIVISOR {
        return Ok(0);
    }

    Ok(compounded.min(initial))
}

/// Collateral owed to a deposit of `initial` taken when P was `snapshot_p`.
///
/// `same_scale_delta` is the growth of the sum at the snapshot's own
/// epoch/scale, `next_scale_sum` the sum accrued one scale later (it is
/// descaled here). Sums further ahead are ignored.
pub fn gain_from_sums(
    initial: u128,
    snapshot_p: u128,
    same_scale_delta: U256,
    next_scale_sum: U256,
) -> LedgerResult<u128> {
    if initial == 0 {
        return Ok(0);
    }
    if snapshot_p == 0 {
        return Err(LedgerError::DivisionByZero);
    }

    let sum = same_scale_delta
        .checked_add(next_scale_sum / U256::from(SCALE_FACTOR))
        .ok_or(LedgerError::Overflow)?;

    let gain = wide_mul(U256::from(initial), sum)?
        / U256::from(snapshot_p)
        / U256::from(DECIMAL_PRECISION);

    to_u128(gain)
}
