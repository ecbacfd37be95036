//! Error Types for the stability pool ledgers
//!
//! Typed errors with stable codes, grouped by the way a caller is expected
//! to react to them.

use crate::types::{Address, TokenId};

/// Result type alias for ledger operations
pub type LedgerResult<T> = Result<T, LedgerError>;

/// Main error enum for all ledger errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    // ============ Authorization Errors ============
    /// Capability was minted by a different authority
    Unauthorized { expected: Address, actual: Address },

    /// A capability for this role was already handed out
    CapabilityAlreadyIssued { role: &'static str },

    // ============ Input Errors ============
    /// Zero amount not allowed
    ZeroAmount,

    /// Amount below minimum threshold
    BelowMinimum { amount: u128, minimum: u128 },

    /// Invalid input parameter
    InvalidInput { param: &'static str, reason: &'static str },

    // ============ Registry Errors ============
    /// A ledger already exists for this debt token
    AlreadyRegistered { debt_token: TokenId },

    /// No ledger registered for this debt token
    PoolNotFound { debt_token: TokenId },

    /// Depositor has no position in this pool
    DepositNotFound { depositor: Address },

    /// An operation failed and at least one of its transfers could not be
    /// reverted; `original` is the code of the error that caused the undo
    RollbackIncomplete { original: &'static str },

    // ============ Token Errors ============
    /// Insufficient balance for a transfer
    InsufficientBalance { available: u128, requested: u128 },

    /// Spender allowance too small for a transfer_from
    InsufficientAllowance { available: u128, requested: u128 },

    // ============ Oracle Errors ============
    /// No price known for token
    PriceUnavailable { token: TokenId },

    /// Price is older than the configured maximum age
    StalePrice { updated_at: u64, current_block: u64, max_age: u64 },

    /// Price update moved too far in one step
    PriceDeviation { old_price: u128, new_price: u128, max_deviation_bps: u128 },

    // ============ Math Errors ============
    /// Arithmetic overflow occurred
    Overflow,

    /// Arithmetic underflow occurred
    Underflow,

    /// Division by zero
    DivisionByZero,

    // ============ Codec Errors ============
    /// Command or config bytes could not be decoded
    Decode { reason: &'static str },
}

/// How a caller should treat an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Wrong caller; never retried
    Authorization,
    /// Caller can fix the input and retry
    InvalidInput,
    /// Raised by a collaborator (token bank, oracle)
    External,
    /// Internal arithmetic guard tripped
    Arithmetic,
    /// Registry or position lookup failed
    State,
}

impl LedgerError {
    /// Returns a human-readable error code for logging/debugging
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unauthorized { .. } => "E020_UNAUTHORIZED",
            Self::CapabilityAlreadyIssued { .. } => "E021_CAP_ISSUED",
            Self::ZeroAmount => "E010_ZERO_AMOUNT",
            Self::BelowMinimum { .. } => "E011_BELOW_MINIMUM",
            Self::InvalidInput { .. } => "E012_INVALID_INPUT",
            Self::AlreadyRegistered { .. } => "E030_ALREADY_REGISTERED",
            Self::PoolNotFound { .. } => "E031_POOL_NOT_FOUND",
            Self::DepositNotFound { .. } => "E032_DEPOSIT_NOT_FOUND",
            Self::RollbackIncomplete { .. } => "E033_ROLLBACK_INCOMPLETE",
            Self::InsufficientBalance { .. } => "E040_INSUFFICIENT_BALANCE",
            Self::InsufficientAllowance { .. } => "E041_INSUFFICIENT_ALLOWANCE",
            Self::PriceUnavailable { .. } => "E050_PRICE_UNAVAILABLE",
            Self::StalePrice { .. } => "E051_STALE_PRICE",
            Self::PriceDeviation { .. } => "E052_PRICE_DEVIATION",
            Self::Overflow => "E080_OVERFLOW",
            Self::Underflow => "E081_UNDERFLOW",
            Self::DivisionByZero => "E082_DIV_ZERO",
            Self::Decode { .. } => "E090_DECODE",
        }
    }

    /// Classify the error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Unauthorized { .. } | Self::CapabilityAlreadyIssued { .. } => {
                ErrorKind::Authorization
            }
            Self::ZeroAmount
            | Self::BelowMinimum { .. }
            | Self::InvalidInput { .. }
            | Self::Decode { .. } => ErrorKind::InvalidInput,
            Self::AlreadyRegistered { .. }
            | Self::PoolNotFound { .. }
            | Self::DepositNotFound { .. }
            | Self::RollbackIncomplete { .. } => ErrorKind::State,
            Self::InsufficientBalance { .. }
            | Self::InsufficientAllowance { .. }
            | Self::PriceUnavailable { .. }
            | Self::StalePrice { .. }
            | Self::PriceDeviation { .. } => ErrorKind::External,
            Self::Overflow | Self::Underflow | Self::DivisionByZero => ErrorKind::Arithmetic,
        }
    }

    /// Returns true if this error is recoverable (user can fix it)
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::InsufficientBalance { .. } => true,   // Get more funds
            Self::InsufficientAllowance { .. } => true, // Approve the pool
            Self::BelowMinimum { .. } => true,          // Increase amount
            Self::StalePrice { .. } => true,            // Wait for update
            _ => self.kind() == ErrorKind::InvalidInput,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn test_error_codes_unique() {
        let errors = [
            LedgerError::Unauthorized { expected: [0u8; 32], actual: [1u8; 32] },
            LedgerError::CapabilityAlreadyIssued { role: "admin" },
            LedgerError::ZeroAmount,
            LedgerError::BelowMinimum { amount: 1, minimum: 2 },
            LedgerError::InvalidInput { param: "x", reason: "y" },
            LedgerError::AlreadyRegistered { debt_token: [2u8; 32] },
            LedgerError::PoolNotFound { debt_token: [2u8; 32] },
            LedgerError::DepositNotFound { depositor: [3u8; 32] },
            LedgerError::RollbackIncomplete { original: "E041_INSUFFICIENT_ALLOWANCE" },
            LedgerError::InsufficientBalance { available: 0, requested: 1 },
            LedgerError::InsufficientAllowance { available: 0, requested: 1 },
            LedgerError::PriceUnavailable { token: [4u8; 32] },
            LedgerError::StalePrice { updated_at: 0, current_block: 10, max_age: 5 },
            LedgerError::PriceDeviation { old_price: 1, new_price: 2, max_deviation_bps: 100 },
            LedgerError::Overflow,
            LedgerError::Underflow,
            LedgerError::DivisionByZero,
            LedgerError::Decode { reason: "bad" },
        ];

        let codes: Vec<_> = errors.iter().map(|e| e.code()).collect();
        let unique: BTreeSet<_> = codes.iter().collect();
        assert_eq!(codes.len(), unique.len(), "Error codes must be unique");
    }

    #[test]
    fn test_error_taxonomy() {
        assert_eq!(
            LedgerError::Unauthorized { expected: [0u8; 32], actual: [1u8; 32] }.kind(),
            ErrorKind::Authorization
        );
        assert_eq!(LedgerError::ZeroAmount.kind(), ErrorKind::InvalidInput);
        assert_eq!(
            LedgerError::InsufficientBalance { available: 0, requested: 1 }.kind(),
            ErrorKind::External
        );
        assert_eq!(LedgerError::Overflow.kind(), ErrorKind::Arithmetic);

        assert!(LedgerError::ZeroAmount.is_recoverable());
        assert!(!LedgerError::Overflow.is_recoverable());
        assert!(!LedgerError::CapabilityAlreadyIssued { role: "admin" }.is_recoverable());
        assert!(!LedgerError::RollbackIncomplete { original: "E080_OVERFLOW" }.is_recoverable());
    }
}
