//! Protocol Constants
//!
//! All magic numbers and configuration values for the stability pools.
//!
//! # Network Configuration
//!
//! Use feature flags to compile for different networks:
//! - `mainnet` - Production values (meaningful minimum deposit)
//! - Default (no feature) - Testnet values (any non-zero deposit)
//!
//! ```toml
//! # For mainnet deployment:
//! spledger-common = { path = "...", features = ["mainnet"] }
//! ```

/// Token amount conventions
pub mod token {
    /// One whole token in base units
    pub const ONE: u128 = 1_000_000_000_000_000_000;
}

/// Precision constants
pub mod precision {
    /// Fixed-point unit (1.0 = 1e18)
    pub const DECIMAL_PRECISION: u128 = 1_000_000_000_000_000_000;

    /// Basis-point denominator for every reported ratio (10_000 = 100%)
    pub const PERCENT_DIVISOR: u128 = 10_000;
}

/// Stability Pool Configuration
pub mod stability_pool {
    /// Factor P is multiplied by when it would fall below it (1e9)
    pub const SCALE_FACTOR: u128 = 1_000_000_000;

    /// A compounded deposit below `initial / COMPOUNDING_DUST_DIVISOR` is zero
    pub const COMPOUNDING_DUST_DIVISOR: u128 = 1_000_000_000;

    /// Remaining deposit below which a withdrawal takes everything (1e-9 token)
    pub const DUST_THRESHOLD: u128 = 1_000_000_000;

    /// Minimum deposit after a top-up
    /// - Mainnet: 1 token
    /// - Testnet: any non-zero amount
    #[cfg(feature = "mainnet")]
    pub const MIN_DEPOSIT: u128 = super::token::ONE;
    #[cfg(not(feature = "mainnet"))]
    pub const MIN_DEPOSIT: u128 = 1;

    /// Domain tag for ledger authority ids
    pub const LEDGER_DOMAIN: &[u8] = b"spledger/ledger";

    /// Domain tag for pool token accounts
    pub const POOL_ACCOUNT_DOMAIN: &[u8] = b"spledger/pool-account";
}

/// Oracle Configuration
pub mod oracle {
    /// Maximum price age in blocks before considered stale
    #[cfg(feature = "mainnet")]
    pub const MAX_PRICE_AGE_BLOCKS: u64 = 50;
    #[cfg(not(feature = "mainnet"))]
    pub const MAX_PRICE_AGE_BLOCKS: u64 = 1_000;

    /// Maximum allowed price deviation per update (10%)
    pub const MAX_PRICE_DEVIATION_BPS: u128 = 1_000;
}
