//! Price Oracle
//!
//! Operator-maintained USD price feed for the stability pools' debt and
//! collateral tokens. Prices only value pool balances for reporting; the
//! deposit accounting never reads them.
//!
//! ## Trust Model
//!
//! - A single operator pushes prices; the admin may replace the operator
//! - Each update may move a price by at most `max_deviation_bps`
//! - Reads fail once a price is older than `max_age_blocks`

use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};

use spledger_common::{
    constants::{oracle::{MAX_PRICE_AGE_BLOCKS, MAX_PRICE_DEVIATION_BPS}, precision::PERCENT_DIVISOR},
    errors::{LedgerError, LedgerResult},
    oracle::PriceFeed,
    types::{Address, TokenId},
    BTreeMap,
};

// ============ Price Data ============

/// Where a price came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, BorshSerialize, BorshDeserialize)]
#[borsh(use_discriminant = true)]
#[repr(u8)]
pub enum PriceSource {
    /// Pushed by the operator
    Operator = 0,
    /// Seeded at construction
    Genesis = 1,
}

/// Last known price of one token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, BorshSerialize, BorshDeserialize)]
pub struct PriceData {
    /// USD per whole token, 18 decimals
    pub price: u128,
    /// Block height of the update
    pub updated_at: u64,
    pub source: PriceSource,
}

impl PriceData {
    pub fn new(price: u128, updated_at: u64, source: PriceSource) -> Self {
        Self { price, updated_at, source }
    }

    pub fn is_stale(&self, current_block: u64, max_age: u64) -> bool {
        current_block.saturating_sub(self.updated_at) > max_age
    }
}

// ============ Oracle State ============

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, BorshSerialize, BorshDeserialize)]
pub struct OracleState {
    pub prices: BTreeMap<TokenId, PriceData>,
    /// Authorized operator (can update prices)
    pub operator: Address,
    /// Admin (can change operator)
    pub admin: Address,
    pub max_age_blocks: u64,
    pub max_deviation_bps: u128,
}

impl OracleState {
    pub fn new(admin: Address, operator: Address) -> Self {
        Self {
            prices: BTreeMap::new(),
            operator,
            admin,
            max_age_blocks: MAX_PRICE_AGE_BLOCKS,
            max_deviation_bps: MAX_PRICE_DEVIATION_BPS,
        }
    }

    /// Seed a price without operator or deviation checks
    pub fn with_genesis_price(mut self, token: TokenId, price: u128, block_height: u64) -> Self {
        self.prices
            .insert(token, PriceData::new(price, block_height, PriceSource::Genesis));
        self
    }

    /// Push a new price for `token`
    pub fn update_price(
        &mut self,
        signer: &Address,
        token: TokenId,
        new_price: u128,
        block_height: u64,
    ) -> LedgerResult<()> {
        // 1. Only operator can update price
        if *signer != self.operator {
            return Err(LedgerError::Unauthorized {
                expected: self.operator,
                actual: *signer,
            });
        }

        // 2. Price must be positive
        if new_price == 0 {
            return Err(LedgerError::ZeroAmount);
        }

        // 3. Check deviation against the previous price, if any
        if let Some(previous) = self.prices.get(&token) {
            if block_height < previous.updated_at {
                return Err(LedgerError::InvalidInput {
                    param: "block_height",
                    reason: "Older than the current price",
                });
            }
            let deviation = calculate_price_deviation(previous.price, new_price);
            if deviation > self.max_deviation_bps {
                return Err(LedgerError::PriceDeviation {
                    old_price: previous.price,
                    new_price,
                    max_deviation_bps: self.max_deviation_bps,
                });
            }
        }

        self.prices
            .insert(token, PriceData::new(new_price, block_height, PriceSource::Operator));
        Ok(())
    }

    /// Replace the operator (admin only)
    pub fn set_operator(&mut self, signer: &Address, new_operator: Address) -> LedgerResult<()> {
        if *signer != self.admin {
            return Err(LedgerError::Unauthorized {
                expected: self.admin,
                actual: *signer,
            });
        }
        if new_operator == self.operator {
            return Err(LedgerError::InvalidInput {
                param: "operator",
                reason: "same as current",
            });
        }

        self.operator = new_operator;
        Ok(())
    }

    /// Fresh price of `token` at `current_block`
    pub fn get_price(&self, token: &TokenId, current_block: u64) -> LedgerResult<u128> {
        let data = self
            .prices
            .get(token)
            .ok_or(LedgerError::PriceUnavailable { token: *token })?;

        if data.is_stale(current_block, self.max_age_blocks) {
            return Err(LedgerError::StalePrice {
                updated_at: data.updated_at,
                current_block,
                max_age: self.max_age_blocks,
            });
        }

        Ok(data.price)
    }

    /// Last price regardless of age, with a staleness flag (display only)
    pub fn get_price_for_display(&self, token: &TokenId, current_block: u64) -> Option<(u128, bool)> {
        self.prices
            .get(token)
            .map(|data| (data.price, data.is_stale(current_block, self.max_age_blocks)))
    }

    /// This oracle as a `PriceFeed` evaluated at `current_block`
    pub fn at(&self, current_block: u64) -> OracleView<'_> {
        OracleView {
            state: self,
            current_block,
        }
    }
}

/// Oracle pinned to a block height
#[derive(Debug, Clone, Copy)]
pub struct OracleView<'a> {
    state: &'a OracleState,
    current_block: u64,
}

impl PriceFeed for OracleView<'_> {
    fn price_usd(&self, token: &TokenId) -> LedgerResult<u128> {
        self.state.get_price(token, self.current_block)
    }
}

// ============ Helper Functions ============

/// Price deviation in basis points (100 bps = 1%)
fn calculate_price_deviation(old_price: u128, new_price: u128) -> u128 {
    if old_price == 0 {
        return PERCENT_DIVISOR;
    }

    let diff = old_price.abs_diff(new_price);
    diff.saturating_mul(PERCENT_DIVISOR) / old_price
}

// ============ Tests ============
