//! Command Codec
//!
//! CBOR-encoded manager commands. A journal of commands can be shipped
//! between processes and replayed against a manager, one transaction per
//! command.
//!
//! ```text
//! ManagerCommand { op, caller, block_height, <op-specific fields> }
//!   -> command_to_action -> ManagerAction -> StabilityPoolManager
//! ```

use serde::{Deserialize, Serialize};

use spledger_common::{
    access_control::{Admin, Capability, Liquidator},
    errors::{LedgerError, LedgerResult},
    token_ops::TokenBank,
    types::{Address, RemainingStability, TokenAmount, TokenId, TxContext},
};

use crate::StabilityPoolManager;

// ============ Operation Codes ============

/// Operation codes carried in `ManagerCommand::op`
pub mod op {
    /// Deposit debt tokens into one or more pools
    pub const PROVIDE: u8 = 0x20;
    /// Withdraw compounded deposits from one or more pools
    pub const WITHDRAW: u8 = 0x21;
    /// Claim collateral gains from every pool with a position
    pub const WITHDRAW_GAINS: u8 = 0x22;
    /// Absorb a liquidation (liquidator only)
    pub const OFFSET: u8 = 0x23;
    /// Register a ledger for a new debt token (admin only)
    pub const ADD_POOL: u8 = 0x40;
}

// ============ Commands ============

/// Wire form of one manager call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagerCommand {
    /// Operation type (see `op` module)
    pub op: u8,
    pub caller: Address,
    pub block_height: u64,
    /// Per-pool amounts for provide/withdraw
    pub amounts: Option<Vec<TokenAmount>>,
    /// Debt token for pool registration
    pub debt_token: Option<TokenId>,
    /// Pre-split liquidation for offset
    pub offsets: Option<Vec<RemainingStability>>,
    /// Account the offset collateral is collected from
    pub coll_source: Option<Address>,
}

impl ManagerCommand {
    fn bare(op: u8, caller: Address, block_height: u64) -> Self {
        Self {
            op,
            caller,
            block_height,
            amounts: None,
            debt_token: None,
            offsets: None,
            coll_source: None,
        }
    }

    pub fn provide(caller: Address, block_height: u64, amounts: Vec<TokenAmount>) -> Self {
        Self {
            amounts: Some(amounts),
            ..Self::bare(op::PROVIDE, caller, block_height)
        }
    }

    pub fn withdraw(caller: Address, block_height: u64, amounts: Vec<TokenAmount>) -> Self {
        Self {
            amounts: Some(amounts),
            ..Self::bare(op::WITHDRAW, caller, block_height)
        }
    }

    pub fn withdraw_gains(caller: Address, block_height: u64) -> Self {
        Self::bare(op::WITHDRAW_GAINS, caller, block_height)
    }

    pub fn offset(
        caller: Address,
        block_height: u64,
        coll_source: Address,
        offsets: Vec<RemainingStability>,
    ) -> Self {
        Self {
            offsets: Some(offsets),
            coll_source: Some(coll_source),
            ..Self::bare(op::OFFSET, caller, block_height)
        }
    }

    pub fn add_pool(caller: Address, block_height: u64, debt_token: TokenId) -> Self {
        Self {
            debt_token: Some(debt_token),
            ..Self::bare(op::ADD_POOL, caller, block_height)
        }
    }

    pub fn context(&self) -> TxContext {
        TxContext::new(self.caller, self.block_height)
    }
}

/// Typed form of a decoded command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagerAction {
    Provide { amounts: Vec<TokenAmount> },
    Withdraw { amounts: Vec<TokenAmount> },
    WithdrawGains,
    Offset {
        coll_source: Address,
        offsets: Vec<RemainingStability>,
    },
    AddPool { debt_token: TokenId },
}

/// Map a command to its action; `None` for unknown ops or missing fields
pub fn command_to_action(command: &ManagerCommand) -> Option<ManagerAction> {
    match command.op {
        op::PROVIDE => Some(ManagerAction::Provide {
            amounts: command.amounts.clone()?,
        }),
        op::WITHDRAW => Some(ManagerAction::Withdraw {
            amounts: command.amounts.clone()?,
        }),
        op::WITHDRAW_GAINS => Some(ManagerAction::WithdrawGains),
        op::OFFSET => Some(ManagerAction::Offset {
            coll_source: command.coll_source?,
            offsets: command.offsets.clone()?,
        }),
        op::ADD_POOL => Some(ManagerAction::AddPool {
            debt_token: command.debt_token?,
        }),
        _ => None,
    }
}

// ============ Encoding ============

pub fn encode_commands(commands: &[ManagerCommand]) -> LedgerResult<Vec<u8>> {
    let mut bytes = Vec::new();
    ciborium::into_writer(&commands, &mut bytes).map_err(|_| LedgerError::Decode {
        reason: "Unencodable command journal",
    })?;
    Ok(bytes)
}

pub fn decode_commands(bytes: &[u8]) -> LedgerResult<Vec<ManagerCommand>> {
    ciborium::from_reader(bytes).map_err(|_| LedgerError::Decode {
        reason: "Malformed command journal",
    })
}

// ============ Replay ============

/// Result of replaying a command journal
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    /// Commands that committed
    pub applied: usize,
    /// Position in the journal and error of every command that did not
    pub failures: Vec<(usize, LedgerError)>,
}

/// Accounts a journal must name as caller of its privileged commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalSigners {
    /// Caller of every `ADD_POOL`
    pub admin: Address,
    /// Caller of every `OFFSET`
    pub liquidator: Address,
}

impl JournalSigners {
    fn check(expected: Address, command: &ManagerCommand) -> LedgerResult<()> {
        if command.caller != expected {
            return Err(LedgerError::Unauthorized {
                expected,
                actual: command.caller,
            });
        }
        Ok(())
    }
}

/// Apply `commands` in order, each as its own transaction.
///
/// A failing command leaves no trace and does not stop the replay. The
/// admin and liquidator capabilities are only exercised for commands whose
/// caller matches the corresponding account in `signers`.
pub fn replay<B: TokenBank + ?Sized>(
    manager: &mut StabilityPoolManager,
    admin: &Capability<Admin>,
    liquidator: &Capability<Liquidator>,
    signers: &JournalSigners,
    bank: &mut B,
    commands: &[ManagerCommand],
) -> ReplaySummary {
    let mut summary = ReplaySummary::default();
    for (position, command) in commands.iter().enumerate() {
        match apply_command(manager, admin, liquidator, signers, bank, command) {
            Ok(()) => summary.applied += 1,
            Err(err) => summary.failures.push((position, err)),
        }
    }
    summary
}

fn apply_command<B: TokenBank + ?Sized>(
    manager: &mut StabilityPoolManager,
    admin: &Capability<Admin>,
    liquidator: &Capability<Liquidator>,
    signers: &JournalSigners,
    bank: &mut B,
    command: &ManagerCommand,
) -> LedgerResult<()> {
    let action = command_to_action(command).ok_or(LedgerError::Decode {
        reason: "Unknown op or missing field",
    })?;
    let ctx = command.context();

    match action {
        ManagerAction::Provide { amounts } => {
            manager.provide_stability(bank, &ctx, &amounts)?;
        }
        ManagerAction::Withdraw { amounts } => {
            manager.withdraw_stability(bank, &ctx, &amounts)?;
        }
        ManagerAction::WithdrawGains => {
            manager.withdraw_gains(bank, &ctx)?;
        }
        ManagerAction::Offset { coll_source, offsets } => {
            JournalSigners::check(signers.liquidator, command)?;
            manager.offset(liquidator, bank, &coll_source, &offsets, ctx.block_height)?;
        }
        ManagerAction::AddPool { debt_token } => {
            JournalSigners::check(signers.admin, command)?;
            manager.add_stability_pool(admin, debt_token, ctx.block_height)?;
        }
    }
    Ok(())
}
