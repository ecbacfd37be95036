//! USD reporting over all registered pools.
//!
//! Read-only: prices value what the ledgers already hold and never feed
//! back into the deposit accounting.

use spledger_common::{
    errors::{LedgerError, LedgerResult},
    math::{ratio_bps, safe_add},
    oracle::{basket_value, usd_value, PriceFeed, ReservePool},
    types::{TokenAmount, TokenId},
};

use crate::StabilityPoolManager;

/// One pool valued in USD
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolReport {
    pub debt_token: TokenId,
    pub total_deposits: u128,
    pub deposits_usd: u128,
    /// Collateral held for depositors, non-zero balances only
    pub collateral: Vec<TokenAmount>,
    pub collateral_usd: u128,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StabilityReport {
    /// Per pool, in registration order
    pub pools: Vec<PoolReport>,
    pub total_deposits_usd: u128,
    pub total_collateral_usd: u128,
    pub reserve_usd: u128,
    /// Reserve value over deposit value, in bps; `u128::MAX` with no deposits
    pub coverage_bps: u128,
}

impl StabilityPoolManager {
    /// Value every pool and the reserve backing them
    pub fn stability_report(
        &self,
        feed: &dyn PriceFeed,
        reserve: &dyn ReservePool,
    ) -> LedgerResult<StabilityReport> {
        let mut pools = Vec::with_capacity(self.pool_count());
        let mut total_deposits_usd = 0u128;
        let mut total_collateral_usd = 0u128;

        for ledger in self.ledgers() {
            let total_deposits = ledger.total_deposits();
            let deposits_usd = if total_deposits == 0 {
                0
            } else {
                usd_value(total_deposits, feed.price_usd(ledger.debt_token())?)?
            };

            let collateral: Vec<TokenAmount> = ledger
                .used_coll_tokens()
                .iter()
                .map(|token| TokenAmount::new(*token, ledger.total_gained_coll(token)))
                .filter(|entry| entry.amount > 0)
                .collect();
            let collateral_usd = basket_value(feed, &collateral)?;

            total_deposits_usd = safe_add(total_deposits_usd, deposits_usd)?;
            total_collateral_usd = safe_add(total_collateral_usd, collateral_usd)?;
            pools.push(PoolReport {
                debt_token: *ledger.debt_token(),
                total_deposits,
                deposits_usd,
                collateral,
                collateral_usd,
            });
        }

        let reserve_usd = basket_value(feed, &reserve.reserves())?;
        let coverage_bps = match ratio_bps(reserve_usd, total_deposits_usd) {
            Ok(bps) => bps,
            Err(LedgerError::DivisionByZero) => u128::MAX,
            Err(err) => return Err(err),
        };

        Ok(StabilityReport {
            pools,
            total_deposits_usd,
            total_collateral_usd,
            reserve_usd,
            coverage_bps,
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::{ManagerConfig, StabilityPoolManager};
    use spledger_common::oracle::{InMemoryReservePool, StaticPriceFeed};

    #[test]
    fn test_report_of_empty_pools() {
        let (mut manager, admin, _) = StabilityPoolManager::new(ManagerConfig::default()).unwrap();
        manager.add_stability_pool(&admin, [1u8; 32], 1).unwrap();

        // No deposits means no price lookups at all
        let report = manager
            .stability_report(&StaticPriceFeed::new(), &InMemoryReservePool::new())
            .unwrap();

        assert_eq!(report.pools.len(), 1);
        assert_eq!(report.total_deposits_usd, 0);
        assert_eq!(report.coverage_bps, u128::MAX);
        assert!(report.pools[0].collateral.is_empty());
    }
}
