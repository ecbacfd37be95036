//! Stability Pool Events
//!
//! Events are emitted while ledgers execute and are the only data source
//! the indexing and reporting side reads. Amounts are unsigned; direction
//! is carried by the event type and exposed through `signed_deposit_delta`.

use crate::Vec;
use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};
use crate::types::{Address, TokenAmount, TokenId};

/// Event types for indexing and filtering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, BorshSerialize, BorshDeserialize)]
#[borsh(use_discriminant = true)]
#[repr(u8)]
pub enum EventType {
    // Depositor Events (0x20 - 0x2F)
    StabilityProvided = 0x20,
    StabilityWithdrawn = 0x21,
    StabilityGainsWithdrawn = 0x22,
    DepositSnapshotUpdated = 0x23,

    // Pool State Events (0x30 - 0x3F)
    PoolOffset = 0x30,
    ProductUpdated = 0x31,
    ScaleUpdated = 0x32,
    EpochUpdated = 0x33,

    // Registry Events (0x40 - 0x4F)
    StabilityPoolAdded = 0x40,
}

/// Main event enum containing all stability pool events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, BorshSerialize, BorshDeserialize)]
pub enum PoolEvent {
    // ============ Depositor Events ============

    /// Emitted when debt tokens are deposited
    StabilityProvided {
        depositor: Address,
        debt_token: TokenId,
        amount: u128,
        new_deposit: u128,
        block_height: u64,
    },

    /// Emitted when debt tokens are withdrawn
    StabilityWithdrawn {
        depositor: Address,
        debt_token: TokenId,
        amount: u128,
        remaining_deposit: u128,
        block_height: u64,
    },

    /// Emitted whenever collateral gains are realized for a depositor
    StabilityGainsWithdrawn {
        depositor: Address,
        debt_token: TokenId,
        /// Deposit consumed by offsets since the previous snapshot
        deposit_lost: u128,
        gains: Vec<TokenAmount>,
        block_height: u64,
    },

    /// Emitted when a depositor's snapshot is retaken or cleared
    DepositSnapshotUpdated {
        depositor: Address,
        debt_token: TokenId,
        p: u128,
        scale: u64,
        epoch: u64,
        block_height: u64,
    },

    // ============ Pool State Events ============

    /// Emitted when liquidated debt is absorbed by a pool
    PoolOffset {
        debt_token: TokenId,
        debt_absorbed: u128,
        coll_added: Vec<TokenAmount>,
        total_deposits: u128,
        block_height: u64,
    },

    /// Emitted when the product factor changes
    ProductUpdated {
        debt_token: TokenId,
        p: u128,
        block_height: u64,
    },

    /// Emitted when P is rescaled
    ScaleUpdated {
        debt_token: TokenId,
        scale: u64,
        block_height: u64,
    },

    /// Emitted when a pool is fully depleted
    EpochUpdated {
        debt_token: TokenId,
        epoch: u64,
        block_height: u64,
    },

    // ============ Registry Events ============

    /// Emitted when a ledger is registered with the manager
    StabilityPoolAdded {
        debt_token: TokenId,
        pool: Address,
        block_height: u64,
    },
}

impl PoolEvent {
    /// Get the event type for filtering
    pub fn event_type(&self) -> EventType {
        match self {
            Self::StabilityProvided { .. } => EventType::StabilityProvided,
            Self::StabilityWithdrawn { .. } => EventType::StabilityWithdrawn,
            Self::StabilityGainsWithdrawn { .. } => EventType::StabilityGainsWithdrawn,
            Self::DepositSnapshotUpdated { .. } => EventType::DepositSnapshotUpdated,
            Self::PoolOffset { .. } => EventType::PoolOffset,
            Self::ProductUpdated { .. } => EventType::ProductUpdated,
            Self::ScaleUpdated { .. } => EventType::ScaleUpdated,
            Self::EpochUpdated { .. } => EventType::EpochUpdated,
            Self::StabilityPoolAdded { .. } => EventType::StabilityPoolAdded,
        }
    }

    /// Get the block height when event occurred
    pub fn block_height(&self) -> u64 {
        match self {
            Self::StabilityProvided { block_height, .. } => *block_height,
            Self::StabilityWithdrawn { block_height, .. } => *block_height,
            Self::StabilityGainsWithdrawn { block_height, .. } => *block_height,
            Self::DepositSnapshotUpdated { block_height, .. } => *block_height,
            Self::PoolOffset { block_height, .. } => *block_height,
            Self::ProductUpdated { block_height, .. } => *block_height,
            Self::ScaleUpdated { block_height, .. } => *block_height,
            Self::EpochUpdated { block_height, .. } => *block_height,
            Self::StabilityPoolAdded { block_height, .. } => *block_height,
        }
    }

    /// Debt token the event belongs to
    pub fn debt_token(&self) -> &TokenId {
        match self {
            Self::StabilityProvided { debt_token, .. }
            | Self::StabilityWithdrawn { debt_token, .. }
            | Self::StabilityGainsWithdrawn { debt_token, .. }
            | Self::DepositSnapshotUpdated { debt_token, .. }
            | Self::PoolOffset { debt_token, .. }
            | Self::ProductUpdated { debt_token, .. }
            | Self::ScaleUpdated { debt_token, .. }
            | Self::EpochUpdated { debt_token, .. }
            | Self::StabilityPoolAdded { debt_token, .. } => debt_token,
        }
    }

    /// Deposit change signed by direction (+ provided, - withdrawn)
    pub fn signed_deposit_delta(&self) -> Option<i128> {
        match self {
            Self::StabilityProvided { amount, .. } => i128::try_from(*amount).ok(),
            Self::StabilityWithdrawn { amount, .. } => i128::try_from(*amount).ok().map(|a| -a),
            _ => None,
        }
    }

    /// Serialize event to bytes for storage/transmission
    pub fn to_bytes(&self) -> Vec<u8> {
        borsh::to_vec(self).unwrap_or_default()
    }

    /// Deserialize event from bytes
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        borsh::from_slice(bytes).ok()
    }
}

/// Event log for collecting multiple events during execution
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventLog {
    events: Vec<PoolEvent>,
}

impl EventLog {
    /// Create a new empty event log
    pub fn new() -> Self {
        Self { events: Vec::new() }
    }

    /// Emit an event (add to log)
    pub fn emit(&mut self, event: PoolEvent) {
        self.events.push(event);
    }

    /// Move every event of `other` to the end of this log
    pub fn append(&mut self, other: EventLog) {
        self.events.extend(other.events);
    }

    /// Get all events
    pub fn events(&self) -> &[PoolEvent] {
        &self.events
    }

    /// Take ownership of all events
    pub fn into_events(self) -> Vec<PoolEvent> {
        self.events
    }

    /// Filter events by type
    pub fn filter_by_type(&self, event_type: EventType) -> Vec<&PoolEvent> {
        self.events
            .iter()
            .filter(|e| e.event_type() == event_type)
            .collect()
    }

    /// Net deposit flow per the signed deltas of every event in the log
    pub fn net_deposit_flow(&self) -> i128 {
        self.events
            .iter()
            .filter_map(PoolEvent::signed_deposit_delta)
            .fold(0i128, |acc, d| acc.saturating_add(d))
    }

    /// Check if any events were emitted
    pub fn has_events(&self) -> bool {
        !self.events.is_empty()
    }

    /// Get number of events
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Check if the log is empty
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Clear all events
    pub fn clear(&mut self) {
        self.events.clear();
    }
}
