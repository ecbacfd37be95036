//! Oracle Module
//!
//! Read-only collaborators used to value pool balances in USD for
//! reporting. Nothing here feeds back into the deposit accounting.

use crate::{BTreeMap, Vec};

use crate::constants::token;
use crate::errors::{LedgerError, LedgerResult};
use crate::math::mul_div;
use crate::types::{TokenAmount, TokenId};

/// Source of USD prices (18 decimals per whole token)
pub trait PriceFeed {
    /// Price of one whole `token` in USD
    fn price_usd(&self, token: &TokenId) -> LedgerResult<u128>;
}

/// Protocol reserve whose holdings back the pools in reports
pub trait ReservePool {
    /// Every token balance held by the reserve
    fn reserves(&self) -> Vec<TokenAmount>;
}

/// USD value of `amount` base units at `price_usd`
pub fn usd_value(amount: u128, price_usd: u128) -> LedgerResult<u128> {
    mul_div(amount, price_usd, token::ONE)
}

/// Total USD value of a basket of token amounts
pub fn basket_value(feed: &dyn PriceFeed, amounts: &[TokenAmount]) -> LedgerResult<u128> {
    amounts.iter().try_fold(0u128, |acc, entry| {
        if entry.amount == 0 {
            return Ok(acc);
        }
        let value = usd_value(entry.amount, feed.price_usd(&entry.token)?)?;
        acc.checked_add(value).ok_or(LedgerError::Overflow)
    })
}

// ============================================================================
// In-Memory Implementations
// ============================================================================

/// Reserve with balances set directly
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InMemoryReservePool {
    balances: BTreeMap<TokenId, u128>,
}

impl InMemoryReservePool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_balance(&mut self, token: TokenId, amount: u128) {
        self.balances.insert(token, amount);
    }
}

impl ReservePool for InMemoryReservePool {
    fn reserves(&self) -> Vec<TokenAmount> {
        self.balances
            .iter()
            .map(|(token, amount)| TokenAmount::new(*token, *amount))
            .collect()
    }
}

/// Feed with fixed prices, mostly for tests and dry runs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StaticPriceFeed {
    prices: BTreeMap<TokenId, u128>,
}

impl StaticPriceFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_price(mut self, token: TokenId, price_usd: u128) -> Self {
        self.prices.insert(token, price_usd);
        self
    }
}

impl PriceFeed for StaticPriceFeed {
    fn price_usd(&self, token: &TokenId) -> LedgerResult<u128> {
        self.prices
            .get(token)
            .copied()
            .ok_or(LedgerError::PriceUnavailable { token: *token })
    }
}
