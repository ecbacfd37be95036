//! Stability Pool Ledger
//!
//! One ledger per debt token. Depositors park debt tokens here; liquidated
//! debt is cancelled against the pool ("offset") and the seized collateral
//! is shared out pro rata.
//!
//! ## Product-Sum Accounting
//!
//! Nothing is iterated per depositor. A deposit is stored with a snapshot of
//! the global P/S state and valued on demand:
//! - compounded deposit = initial * P / P_snapshot (epoch and scale aware)
//! - collateral gain = initial * (S - S_snapshot) / P_snapshot
//!
//! ## Transactions
//!
//! Every mutation computes, commits, then moves tokens. A failed transfer
//! reverts the transfers already made and restores the pre-call state. A
//! successful call returns its `Undo` so an enclosing transaction can still
//! roll it back.

use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub mod product_sum;

pub use product_sum::{OffsetEffects, ProductSum};

use spledger_common::{
    access_control::{Authority, Capability, PoolOwner},
    constants::stability_pool::{DUST_THRESHOLD, MIN_DEPOSIT},
    errors::{LedgerError, LedgerResult},
    events::{EventLog, PoolEvent},
    math::{mul_div, safe_add, safe_sub, ProductStep, WideUint},
    token_ops::{revert_all, TokenBank, TransferRecord},
    types::{Address, DepositSnapshot, TokenAmount, TokenId, TxContext},
    BTreeMap, Vec,
};

// ============ Ledger Config ============

/// Per-ledger limits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, BorshSerialize, BorshDeserialize)]
pub struct LedgerConfig {
    /// Smallest deposit a depositor may hold after a top-up
    pub min_deposit: u128,
    /// A withdrawal leaving less than this takes the whole deposit
    pub dust_threshold: u128,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            min_deposit: MIN_DEPOSIT,
            dust_threshold: DUST_THRESHOLD,
        }
    }
}

// ============ State Types ============

/// A depositor's stored deposit and the snapshot it is valued against
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, BorshSerialize, BorshDeserialize)]
pub struct Position {
    pub initial: u128,
    pub snapshot: DepositSnapshot,
}

/// Aggregate balances of a ledger
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, BorshSerialize, BorshDeserialize)]
pub struct PoolTotals {
    pub total_deposits: u128,
    /// Collateral held for depositors, per token
    pub total_gained_coll: BTreeMap<TokenId, u128>,
}

/// Pre-call copy of everything a ledger operation may touch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    totals: PoolTotals,
    product_sum: Option<ProductSum>,
    position: Option<(Address, Option<Position>)>,
}

/// How to take an applied operation back
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Undo {
    checkpoint: Checkpoint,
    transfers: Vec<TransferRecord>,
}

impl Undo {
    /// Token movements the operation executed
    pub fn transfers(&self) -> &[TransferRecord] {
        &self.transfers
    }
}

/// A committed operation together with its undo
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Applied<R> {
    pub receipt: R,
    pub undo: Undo,
}

// ============ Receipts ============

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvideReceipt {
    pub deposited: u128,
    pub new_deposit: u128,
    pub deposit_lost: u128,
    pub gains: Vec<TokenAmount>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WithdrawReceipt {
    pub withdrawn: u128,
    pub remaining_deposit: u128,
    pub deposit_lost: u128,
    pub gains: Vec<TokenAmount>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GainsReceipt {
    pub deposit: u128,
    pub deposit_lost: u128,
    pub gains: Vec<TokenAmount>,
}

/// Split of an offset request into what this ledger absorbed and the rest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffsetOutcome {
    pub debt_absorbed: u128,
    pub coll_absorbed: Vec<TokenAmount>,
    pub debt_unabsorbed: u128,
    pub coll_unabsorbed: Vec<TokenAmount>,
}

/// A depositor's position valued at the current state
struct Realized {
    initial: u128,
    compounded: u128,
    gains: Vec<TokenAmount>,
}

impl Realized {
    fn deposit_lost(&self) -> u128 {
        self.initial.saturating_sub(self.compounded)
    }
}

enum Movement {
    /// Debt tokens from a depositor into the pool
    Pull { from: Address, amount: u128 },
    /// Tokens from the pool to a depositor
    Pay { token: TokenId, to: Address, amount: u128 },
    /// Absorbed debt destroyed from the pool account
    Burn { amount: u128 },
    /// Collateral from the liquidation side into the pool
    Collect { token: TokenId, from: Address, amount: u128 },
}

// ============ Ledger ============

#[derive(Debug)]
pub struct StabilityPoolLedger {
    authority: Authority,
    debt_token: TokenId,
    pool_account: Address,
    config: LedgerConfig,
    totals: PoolTotals,
    product_sum: ProductSum,
    deposits: BTreeMap<Address, Position>,
}

impl StabilityPoolLedger {
    /// Create an empty ledger and the capability that mutates it
    pub fn new(
        debt_token: TokenId,
        pool_account: Address,
        authority_id: Address,
        config: LedgerConfig,
    ) -> LedgerResult<(Self, Capability<PoolOwner>)> {
        let mut authority = Authority::with_id(authority_id);
        let owner = authority.mint::<PoolOwner>()?;

        let ledger = Self {
            authority,
            debt_token,
            pool_account,
            config,
            totals: PoolTotals::default(),
            product_sum: ProductSum::new(),
            deposits: BTreeMap::new(),
        };

        Ok((ledger, owner))
    }

    // ============ Mutations ============

    /// Deposit `amount` debt tokens for `ctx.caller`.
    ///
    /// Pending gains are paid and past losses realized before the new funds
    /// are added, so the top-up is never diluted by earlier offsets.
    pub fn provide_to_sp<B: TokenBank + ?Sized>(
        &mut self,
        cap: &Capability<PoolOwner>,
        bank: &mut B,
        ctx: &TxContext,
        amount: u128,
        events: &mut EventLog,
    ) -> LedgerResult<Applied<ProvideReceipt>> {
        self.authority.verify(cap)?;
        if amount == 0 {
            return Err(LedgerError::ZeroAmount);
        }

        let depositor = ctx.caller;
        let had_position = self.deposits.contains_key(&depositor);
        let realized = self.realize(&depositor)?;
        let new_deposit = safe_add(realized.compounded, amount)?;
        if new_deposit < self.config.min_deposit {
            return Err(LedgerError::BelowMinimum {
                amount: new_deposit,
                minimum: self.config.min_deposit,
            });
        }
        let total_deposits = safe_add(self.totals.total_deposits, amount)?;

        let checkpoint = self.checkpoint(Some(depositor), false);
        self.totals.total_deposits = total_deposits;
        self.release_gains(&realized.gains);
        let snapshot = self.product_sum.snapshot();
        self.deposits.insert(
            depositor,
            Position {
                initial: new_deposit,
                snapshot: snapshot.clone(),
            },
        );

        let mut movements = Vec::with_capacity(realized.gains.len() + 1);
        movements.push(Movement::Pull { from: depositor, amount });
        movements.extend(self.payouts(&depositor, &realized.gains));
        let undo = self.settle(bank, checkpoint, movements)?;

        let mut staged = EventLog::new();
        if had_position {
            staged.emit(self.gains_event(ctx, &realized));
        }
        staged.emit(PoolEvent::StabilityProvided {
            depositor,
            debt_token: self.debt_token,
            amount,
            new_deposit,
            block_height: ctx.block_height,
        });
        staged.emit(self.snapshot_event(ctx, &snapshot));
        events.append(staged);

        Ok(Applied {
            receipt: ProvideReceipt {
                deposited: amount,
                new_deposit,
                deposit_lost: realized.deposit_lost(),
                gains: realized.gains,
            },
            undo,
        })
    }

    /// Withdraw up to `amount` of `ctx.caller`'s compounded deposit.
    ///
    /// Requests above the compounded deposit are capped. A remainder below
    /// the dust threshold is withdrawn too and the position closed.
    pub fn withdraw_from_sp<B: TokenBank + ?Sized>(
        &mut self,
        cap: &Capability<PoolOwner>,
        bank: &mut B,
        ctx: &TxContext,
        amount: u128,
        events: &mut EventLog,
    ) -> LedgerResult<Applied<WithdrawReceipt>> {
        self.authority.verify(cap)?;
        if amount == 0 {
            return Err(LedgerError::ZeroAmount);
        }

        let depositor = ctx.caller;
        if !self.deposits.contains_key(&depositor) {
            return Err(LedgerError::DepositNotFound { depositor });
        }
        let realized = self.realize(&depositor)?;

        let available = realized.compounded.min(self.totals.total_deposits);
        let mut withdrawn = amount.min(available);
        let mut remaining = realized.compounded - withdrawn;
        if remaining < self.config.dust_threshold {
            withdrawn = available;
            remaining = 0;
        }
        let total_deposits = safe_sub(self.totals.total_deposits, withdrawn)?;

        let checkpoint = self.checkpoint(Some(depositor), false);
        self.totals.total_deposits = total_deposits;
        self.release_gains(&realized.gains);
        let snapshot = self.store_position(depositor, remaining);

        let mut movements = Vec::with_capacity(realized.gains.len() + 1);
        if withdrawn > 0 {
            movements.push(Movement::Pay {
                token: self.debt_token,
                to: depositor,
                amount: withdrawn,
            });
        }
        movements.extend(self.payouts(&depositor, &realized.gains));
        let undo = self.settle(bank, checkpoint, movements)?;

        let mut staged = EventLog::new();
        staged.emit(self.gains_event(ctx, &realized));
        staged.emit(PoolEvent::StabilityWithdrawn {
            depositor,
            debt_token: self.debt_token,
            amount: withdrawn,
            remaining_deposit: remaining,
            block_height: ctx.block_height,
        });
        staged.emit(self.snapshot_event(ctx, &snapshot));
        events.append(staged);

        Ok(Applied {
            receipt: WithdrawReceipt {
                withdrawn,
                remaining_deposit: remaining,
                deposit_lost: realized.deposit_lost(),
                gains: realized.gains,
            },
            undo,
        })
    }

    /// Pay out every pending collateral gain of `ctx.caller`.
    ///
    /// The deposit is re-snapshotted at its compounded value; a deposit
    /// wiped by an earlier epoch is closed once its gains are paid.
    pub fn withdraw_gains<B: TokenBank + ?Sized>(
        &mut self,
        cap: &Capability<PoolOwner>,
        bank: &mut B,
        ctx: &TxContext,
        events: &mut EventLog,
    ) -> LedgerResult<Applied<GainsReceipt>> {
        self.authority.verify(cap)?;

        let depositor = ctx.caller;
        if !self.deposits.contains_key(&depositor) {
            return Err(LedgerError::DepositNotFound { depositor });
        }
        let realized = self.realize(&depositor)?;

        let checkpoint = self.checkpoint(Some(depositor), false);
        self.release_gains(&realized.gains);
        let snapshot = self.store_position(depositor, realized.compounded);

        let movements = self.payouts(&depositor, &realized.gains);
        let undo = self.settle(bank, checkpoint, movements)?;

        let mut staged = EventLog::new();
        staged.emit(self.gains_event(ctx, &realized));
        staged.emit(self.snapshot_event(ctx, &snapshot));
        events.append(staged);

        Ok(Applied {
            receipt: GainsReceipt {
                deposit: realized.compounded,
                deposit_lost: realized.deposit_lost(),
                gains: realized.gains,
            },
            undo,
        })
    }

    /// Cancel `debt_to_offset` against the pool and credit `coll_to_add`.
    ///
    /// At most `total_deposits` is absorbed; collateral is scaled down by the
    /// absorbed fraction and the rest is handed back in the outcome. An empty
    /// pool or zero debt absorbs nothing.
    pub fn offset<B: TokenBank + ?Sized>(
        &mut self,
        cap: &Capability<PoolOwner>,
        bank: &mut B,
        coll_source: &Address,
        debt_to_offset: u128,
        coll_to_add: &[TokenAmount],
        block_height: u64,
        events: &mut EventLog,
    ) -> LedgerResult<Applied<OffsetOutcome>> {
        self.authority.verify(cap)?;
        for (i, entry) in coll_to_add.iter().enumerate() {
            if coll_to_add[..i].iter().any(|prev| prev.token == entry.token) {
                return Err(LedgerError::InvalidInput {
                    param: "coll_to_add",
                    reason: "Duplicate collateral token",
                });
            }
        }

        let total = self.totals.total_deposits;
        if total == 0 || debt_to_offset == 0 {
            return Ok(Applied {
                receipt: OffsetOutcome {
                    debt_absorbed: 0,
                    coll_absorbed: Vec::new(),
                    debt_unabsorbed: debt_to_offset,
                    coll_unabsorbed: coll_to_add.to_vec(),
                },
                undo: Undo {
                    checkpoint: self.checkpoint(None, false),
                    transfers: Vec::new(),
                },
            });
        }

        let debt_absorbed = debt_to_offset.min(total);
        let mut coll_absorbed = Vec::with_capacity(coll_to_add.len());
        let mut coll_unabsorbed = Vec::new();
        for entry in coll_to_add {
            let absorbed = if debt_absorbed == debt_to_offset {
                entry.amount
            } else {
                mul_div(entry.amount, debt_absorbed, debt_to_offset)?
            };
            coll_absorbed.push(TokenAmount::new(entry.token, absorbed));
            if entry.amount > absorbed {
                coll_unabsorbed.push(TokenAmount::new(entry.token, entry.amount - absorbed));
            }
        }

        let mut gained = self.totals.total_gained_coll.clone();
        for entry in &coll_absorbed {
            let held = gained.entry(entry.token).or_insert(0);
            *held = safe_add(*held, entry.amount)?;
        }

        let checkpoint = self.checkpoint(None, true);
        let effects = self
            .product_sum
            .apply_offset(debt_absorbed, &coll_absorbed, total)?;
        self.totals.total_deposits = total - debt_absorbed;
        self.totals.total_gained_coll = gained;

        let mut movements = Vec::with_capacity(coll_absorbed.len() + 1);
        movements.push(Movement::Burn { amount: debt_absorbed });
        for entry in coll_absorbed.iter().filter(|c| c.amount > 0) {
            movements.push(Movement::Collect {
                token: entry.token,
                from: *coll_source,
                amount: entry.amount,
            });
        }
        let undo = self.settle(bank, checkpoint, movements)?;

        let mut staged = EventLog::new();
        staged.emit(PoolEvent::PoolOffset {
            debt_token: self.debt_token,
            debt_absorbed,
            coll_added: coll_absorbed.clone(),
            total_deposits: self.totals.total_deposits,
            block_height,
        });
        staged.emit(PoolEvent::ProductUpdated {
            debt_token: self.debt_token,
            p: effects.p,
            block_height,
        });
        match effects.step {
            ProductStep::Rescaled { .. } => staged.emit(PoolEvent::ScaleUpdated {
                debt_token: self.debt_token,
                scale: effects.scale,
                block_height,
            }),
            ProductStep::Depleted => {
                staged.emit(PoolEvent::EpochUpdated {
                    debt_token: self.debt_token,
                    epoch: effects.epoch,
                    block_height,
                });
                staged.emit(PoolEvent::ScaleUpdated {
                    debt_token: self.debt_token,
                    scale: 0,
                    block_height,
                });
            }
            ProductStep::Shrunk(_) => {}
        }
        events.append(staged);

        Ok(Applied {
            receipt: OffsetOutcome {
                debt_absorbed,
                coll_absorbed,
                debt_unabsorbed: debt_to_offset - debt_absorbed,
                coll_unabsorbed,
            },
            undo,
        })
    }

    /// Take back an operation applied by this ledger
    pub fn rollback<B: TokenBank + ?Sized>(
        &mut self,
        cap: &Capability<PoolOwner>,
        bank: &mut B,
        undo: Undo,
    ) -> LedgerResult<()> {
        let transfers = self.rewind(cap, undo)?;
        revert_all(bank, &transfers)
    }

    /// Restore the state an applied operation started from, without touching
    /// the token bank. Returns the operation's transfers, oldest first, for
    /// the caller to revert.
    pub fn rewind(
        &mut self,
        cap: &Capability<PoolOwner>,
        undo: Undo,
    ) -> LedgerResult<Vec<TransferRecord>> {
        self.authority.verify(cap)?;
        self.restore(undo.checkpoint);
        Ok(undo.transfers)
    }

    // ============ Queries ============

    pub fn debt_token(&self) -> &TokenId {
        &self.debt_token
    }

    pub fn pool_account(&self) -> &Address {
        &self.pool_account
    }

    pub fn authority_id(&self) -> &Address {
        self.authority.id()
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn total_deposits(&self) -> u128 {
        self.totals.total_deposits
    }

    /// Collateral held for depositors
    pub fn total_gained_coll(&self, token: &TokenId) -> u128 {
        self.totals.total_gained_coll.get(token).copied().unwrap_or(0)
    }

    pub fn used_coll_tokens(&self) -> &[TokenId] {
        &self.product_sum.used_coll_tokens
    }

    pub fn product(&self) -> u128 {
        self.product_sum.p
    }

    pub fn current_scale(&self) -> u64 {
        self.product_sum.current_scale
    }

    pub fn current_epoch(&self) -> u64 {
        self.product_sum.current_epoch
    }

    pub fn epoch_scale_sum(&self, epoch: u64, scale: u64, token: &TokenId) -> WideUint {
        self.product_sum.sum(epoch, scale, token)
    }

    pub fn depositor_count(&self) -> usize {
        self.deposits.len()
    }

    /// Whether `depositor` holds a position (possibly worth zero)
    pub fn has_position(&self, depositor: &Address) -> bool {
        self.deposits.contains_key(depositor)
    }

    /// Deposit as stored at the last interaction
    pub fn initial_deposit(&self, depositor: &Address) -> u128 {
        self.deposits.get(depositor).map(|p| p.initial).unwrap_or(0)
    }

    pub fn deposit_snapshot(&self, depositor: &Address) -> Option<&DepositSnapshot> {
        self.deposits.get(depositor).map(|p| &p.snapshot)
    }

    /// Current value of `depositor`'s deposit after offsets
    pub fn compounded_deposit(&self, depositor: &Address) -> LedgerResult<u128> {
        match self.deposits.get(depositor) {
            Some(position) => self.product_sum.compounded(position.initial, &position.snapshot),
            None => Ok(0),
        }
    }

    /// Pending gain of one collateral token
    pub fn depositor_coll_gain(&self, depositor: &Address, token: &TokenId) -> LedgerResult<u128> {
        match self.deposits.get(depositor) {
            Some(position) => Ok(self
                .product_sum
                .coll_gain(position.initial, &position.snapshot, token)?
                .min(self.total_gained_coll(token))),
            None => Ok(0),
        }
    }

    /// Pending non-zero gains over every used collateral token
    pub fn depositor_coll_gains(&self, depositor: &Address) -> LedgerResult<Vec<TokenAmount>> {
        Ok(self.realize(depositor)?.gains)
    }

    /// sha-256 over the borsh encoding of the accounting state
    pub fn state_hash(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.debt_token);
        hasher.update(self.pool_account);
        hasher.update(borsh::to_vec(&self.config).unwrap_or_default());
        hasher.update(borsh::to_vec(&self.totals).unwrap_or_default());
        hasher.update(borsh::to_vec(&self.product_sum).unwrap_or_default());
        hasher.update(borsh::to_vec(&self.deposits).unwrap_or_default());
        let result = hasher.finalize();
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&result);
        hash
    }

    // ============ Internals ============

    /// Value `depositor`'s position against the current state
    fn realize(&self, depositor: &Address) -> LedgerResult<Realized> {
        let Some(position) = self.deposits.get(depositor) else {
            return Ok(Realized {
                initial: 0,
                compounded: 0,
                gains: Vec::new(),
            });
        };

        let compounded = self
            .product_sum
            .compounded(position.initial, &position.snapshot)?;
        let gains = self
            .product_sum
            .coll_gains(position.initial, &position.snapshot)?
            .into_iter()
            .map(|g| TokenAmount::new(g.token, g.amount.min(self.total_gained_coll(&g.token))))
            .filter(|g| g.amount > 0)
            .collect();

        Ok(Realized {
            initial: position.initial,
            compounded,
            gains,
        })
    }

    /// Store `deposit` with a fresh snapshot, or close the position at zero
    fn store_position(&mut self, depositor: Address, deposit: u128) -> DepositSnapshot {
        if deposit == 0 {
            self.deposits.remove(&depositor);
            return DepositSnapshot::cleared();
        }

        let snapshot = self.product_sum.snapshot();
        self.deposits.insert(
            depositor,
            Position {
                initial: deposit,
                snapshot: snapshot.clone(),
            },
        );
        snapshot
    }

    fn release_gains(&mut self, gains: &[TokenAmount]) {
        for gain in gains {
            if let Some(held) = self.totals.total_gained_coll.get_mut(&gain.token) {
                *held = held.saturating_sub(gain.amount);
            }
        }
    }

    fn payouts(&self, depositor: &Address, gains: &[TokenAmount]) -> Vec<Movement> {
        gains
            .iter()
            .map(|g| Movement::Pay {
                token: g.token,
                to: *depositor,
                amount: g.amount,
            })
            .collect()
    }

    fn checkpoint(&self, depositor: Option<Address>, with_product_sum: bool) -> Checkpoint {
        Checkpoint {
            totals: self.totals.clone(),
            product_sum: with_product_sum.then(|| self.product_sum.clone()),
            position: depositor.map(|d| (d, self.deposits.get(&d).cloned())),
        }
    }

    fn restore(&mut self, checkpoint: Checkpoint) {
        self.totals = checkpoint.totals;
        if let Some(product_sum) = checkpoint.product_sum {
            self.product_sum = product_sum;
        }
        if let Some((depositor, previous)) = checkpoint.position {
            match previous {
                Some(position) => {
                    self.deposits.insert(depositor, position);
                }
                None => {
                    self.deposits.remove(&depositor);
                }
            }
        }
    }

    /// Execute `movements`; on the first failure undo the ones already made
    /// and restore `checkpoint`
    fn settle<B: TokenBank + ?Sized>(
        &mut self,
        bank: &mut B,
        checkpoint: Checkpoint,
        movements: Vec<Movement>,
    ) -> LedgerResult<Undo> {
        let mut transfers = Vec::with_capacity(movements.len());
        for movement in movements {
            let result = match movement {
                Movement::Pull { from, amount } => bank.transfer_from(
                    &self.debt_token,
                    &self.pool_account,
                    &from,
                    &self.pool_account,
                    amount,
                ),
                Movement::Pay { token, to, amount } => {
                    bank.transfer(&token, &self.pool_account, &to, amount)
                }
                Movement::Burn { amount } => bank.burn(&self.debt_token, &self.pool_account, amount),
                Movement::Collect { token, from, amount } => {
                    bank.transfer(&token, &from, &self.pool_account, amount)
                }
            };

            match result {
                Ok(record) => transfers.push(record),
                Err(err) => {
                    self.restore(checkpoint);
                    if revert_all(bank, &transfers).is_err() {
                        return Err(LedgerError::RollbackIncomplete { original: err.code() });
                    }
                    return Err(err);
                }
            }
        }

        Ok(Undo {
            checkpoint,
            transfers,
        })
    }

    fn gains_event(&self, ctx: &TxContext, realized: &Realized) -> PoolEvent {
        PoolEvent::StabilityGainsWithdrawn {
            depositor: ctx.caller,
            debt_token: self.debt_token,
            deposit_lost: realized.deposit_lost(),
            gains: realized.gains.clone(),
            block_height: ctx.block_height,
        }
    }

    fn snapshot_event(&self, ctx: &TxContext, snapshot: &DepositSnapshot) -> PoolEvent {
        PoolEvent::DepositSnapshotUpdated {
            depositor: ctx.caller,
            debt_token: self.debt_token,
            p: snapshot.p,
            scale: snapshot.scale,
            epoch: snapshot.epoch,
            block_height: ctx.block_height,
        }
    }
}

// ============ Tests ============

#[cfg(test)]
mod tests {
    use super::*;
    use spledger_common::{
        constants::{precision::DECIMAL_PRECISION, stability_pool::SCALE_FACTOR, token::ONE},
        events::EventType,
        token_ops::InMemoryTokenBank,
    };

    const DEBT: TokenId = [10u8; 32];
    const COLL_A: TokenId = [11u8; 32];
    const COLL_B: TokenId = [12u8; 32];
    const POOL: Address = [20u8; 32];
    const LIQUIDATOR: Address = [21u8; 32];
    const ALICE: Address = [1u8; 32];
    const BOB: Address = [2u8; 32];

    struct Harness {
        ledger: StabilityPoolLedger,
        owner: Capability<PoolOwner>,
        bank: InMemoryTokenBank,
        events: EventLog,
    }

    impl Harness {
        fn new() -> Self {
            let (ledger, owner) =
                StabilityPoolLedger::new(DEBT, POOL, [30u8; 32], LedgerConfig::default()).unwrap();
            let mut bank = InMemoryTokenBank::new();
            for depositor in [ALICE, BOB] {
                bank.mint(&DEBT, &depositor, 1_000_000 * ONE).unwrap();
                bank.approve(&DEBT, &depositor, &POOL, u128::MAX);
            }
            bank.mint(&COLL_A, &LIQUIDATOR, 1_000_000 * ONE).unwrap();
            bank.mint(&COLL_B, &LIQUIDATOR, 1_000_000 * ONE).unwrap();
            Self { ledger, owner, bank, events: EventLog::new() }
        }

        fn provide(&mut self, who: Address, amount: u128) -> LedgerResult<ProvideReceipt> {
            self.ledger
                .provide_to_sp(&self.owner, &mut self.bank, &TxContext::new(who, 1), amount, &mut self.events)
                .map(|a| a.receipt)
        }

        fn withdraw(&mut self, who: Address, amount: u128) -> LedgerResult<WithdrawReceipt> {
            self.ledger
                .withdraw_from_sp(&self.owner, &mut self.bank, &TxContext::new(who, 2), amount, &mut self.events)
                .map(|a| a.receipt)
        }

        fn claim(&mut self, who: Address) -> LedgerResult<GainsReceipt> {
            self.ledger
                .withdraw_gains(&self.owner, &mut self.bank, &TxContext::new(who, 3), &mut self.events)
                .map(|a| a.receipt)
        }

        fn offset(&mut self, debt: u128, coll: &[TokenAmount]) -> LedgerResult<OffsetOutcome> {
            self.ledger
                .offset(&self.owner, &mut self.bank, &LIQUIDATOR, debt, coll, 4, &mut self.events)
                .map(|a| a.receipt)
        }
    }

    // ============ Deposit Tests ============

    #[test]
    fn test_provide_success() {
        let mut h = Harness::new();
        let receipt = h.provide(ALICE, 1_000 * ONE).unwrap();

        assert_eq!(receipt.new_deposit, 1_000 * ONE);
        assert_eq!(h.ledger.total_deposits(), 1_000 * ONE);
        assert_eq!(h.ledger.compounded_deposit(&ALICE).unwrap(), 1_000 * ONE);
        assert_eq!(h.bank.balance_of(&DEBT, &POOL), 1_000 * ONE);
        assert_eq!(h.events.filter_by_type(EventType::StabilityProvided).len(), 1);
        assert_eq!(h.events.net_deposit_flow(), (1_000 * ONE) as i128);
    }

    #[test]
    fn test_provide_zero_amount_fails() {
        let mut h = Harness::new();
        assert!(matches!(h.provide(ALICE, 0), Err(LedgerError::ZeroAmount)));
    }

    #[test]
    fn test_provide_below_minimum_fails() {
        let (ledger, owner) = StabilityPoolLedger::new(
            DEBT,
            POOL,
            [30u8; 32],
            LedgerConfig { min_deposit: 10 * ONE, dust_threshold: DUST_THRESHOLD },
        )
        .unwrap();
        let mut h = Harness { ledger, owner, ..Harness::new() };

        let result = h.provide(ALICE, ONE);
        assert!(matches!(result, Err(LedgerError::BelowMinimum { .. })));
    }

    #[test]
    fn test_provide_without_allowance_leaves_state_untouched() {
        let mut h = Harness::new();
        h.provide(ALICE, 100 * ONE).unwrap();
        h.bank.approve(&DEBT, &BOB, &POOL, 0);

        let hash = h.ledger.state_hash();
        let bank = h.bank.clone();
        let events = h.events.len();

        let result = h.provide(BOB, 50 * ONE);
        assert!(matches!(result, Err(LedgerError::InsufficientAllowance { .. })));
        assert_eq!(h.ledger.state_hash(), hash);
        assert_eq!(h.bank, bank);
        assert_eq!(h.events.len(), events);
    }

    #[test]
    fn test_top_up_pays_gains_and_is_not_diluted() {
        let mut h = Harness::new();
        h.provide(ALICE, 1_000 * ONE).unwrap();
        h.offset(100 * ONE, &[TokenAmount::new(COLL_A, 10 * ONE)]).unwrap();

        let receipt = h.provide(ALICE, 100 * ONE).unwrap();
        assert_eq!(receipt.deposit_lost, 100 * ONE);
        assert_eq!(receipt.gains, vec![TokenAmount::new(COLL_A, 10 * ONE)]);
        assert_eq!(receipt.new_deposit, 1_000 * ONE);
        assert_eq!(h.ledger.compounded_deposit(&ALICE).unwrap(), 1_000 * ONE);
        assert_eq!(h.bank.balance_of(&COLL_A, &ALICE), 10 * ONE);
        assert_eq!(h.ledger.total_gained_coll(&COLL_A), 0);
    }

    // ============ Withdrawal Tests ============

    #[test]
    fn test_withdraw_round_trip() {
        let mut h = Harness::new();
        let before = h.bank.balance_of(&DEBT, &ALICE);

        h.provide(ALICE, 500 * ONE).unwrap();
        let receipt = h.withdraw(ALICE, 500 * ONE).unwrap();

        assert_eq!(receipt.withdrawn, 500 * ONE);
        assert_eq!(receipt.remaining_deposit, 0);
        assert_eq!(h.bank.balance_of(&DEBT, &ALICE), before);
        assert_eq!(h.ledger.total_deposits(), 0);
        assert!(!h.ledger.has_position(&ALICE));
        assert_eq!(h.events.net_deposit_flow(), 0);
    }

    #[test]
    fn test_withdraw_caps_at_compounded_deposit() {
        let mut h = Harness::new();
        h.provide(ALICE, 1_000 * ONE).unwrap();
        h.offset(100 * ONE, &[]).unwrap();

        let receipt = h.withdraw(ALICE, 5_000 * ONE).unwrap();
        assert_eq!(receipt.withdrawn, 900 * ONE);
        assert_eq!(receipt.deposit_lost, 100 * ONE);
        assert_eq!(h.ledger.total_deposits(), 0);
    }

    #[test]
    fn test_withdraw_sweeps_dust() {
        let mut h = Harness::new();
        h.provide(ALICE, 1_000 * ONE).unwrap();

        let receipt = h.withdraw(ALICE, 1_000 * ONE - 10).unwrap();
        assert_eq!(receipt.withdrawn, 1_000 * ONE);
        assert_eq!(receipt.remaining_deposit, 0);
        assert!(h.ledger.deposit_snapshot(&ALICE).is_none());
    }

    #[test]
    fn test_withdraw_errors() {
        let mut h = Harness::new();
        assert!(matches!(h.withdraw(ALICE, ONE), Err(LedgerError::DepositNotFound { .. })));

        h.provide(ALICE, ONE).unwrap();
        assert!(matches!(h.withdraw(ALICE, 0), Err(LedgerError::ZeroAmount)));
    }

    // ============ Offset Tests ============

    #[test]
    fn test_offset_on_empty_pool_is_noop() {
        let mut h = Harness::new();
        let hash = h.ledger.state_hash();

        let outcome = h.offset(100 * ONE, &[TokenAmount::new(COLL_A, ONE)]).unwrap();
        assert_eq!(outcome.debt_absorbed, 0);
        assert_eq!(outcome.debt_unabsorbed, 100 * ONE);
        assert_eq!(outcome.coll_unabsorbed, vec![TokenAmount::new(COLL_A, ONE)]);
        assert_eq!(h.ledger.state_hash(), hash);
        assert!(!h.events.has_events());
    }

    #[test]
    fn test_offset_clamps_to_total_deposits() {
        let mut h = Harness::new();
        h.provide(ALICE, 100 * ONE).unwrap();

        let outcome = h.offset(400 * ONE, &[TokenAmount::new(COLL_A, 40 * ONE)]).unwrap();
        assert_eq!(outcome.debt_absorbed, 100 * ONE);
        assert_eq!(outcome.debt_unabsorbed, 300 * ONE);
        assert_eq!(outcome.coll_absorbed, vec![TokenAmount::new(COLL_A, 10 * ONE)]);
        assert_eq!(outcome.coll_unabsorbed, vec![TokenAmount::new(COLL_A, 30 * ONE)]);

        assert_eq!(h.ledger.total_deposits(), 0);
        assert_eq!(h.ledger.current_epoch(), 1);
        assert_eq!(h.bank.balance_of(&DEBT, &POOL), 0);
        assert_eq!(h.bank.balance_of(&COLL_A, &POOL), 10 * ONE);
    }

    #[test]
    fn test_offset_rejects_duplicate_tokens() {
        let mut h = Harness::new();
        h.provide(ALICE, 100 * ONE).unwrap();

        let coll = [TokenAmount::new(COLL_A, ONE), TokenAmount::new(COLL_A, ONE)];
        assert!(matches!(h.offset(10 * ONE, &coll), Err(LedgerError::InvalidInput { .. })));
    }

    #[test]
    fn test_offset_rolls_back_when_collateral_missing() {
        let mut h = Harness::new();
        h.provide(ALICE, 1_000 * ONE).unwrap();
        let hash = h.ledger.state_hash();
        let bank = h.bank.clone();

        // Second token cannot be collected
        let coll = [
            TokenAmount::new(COLL_A, 10 * ONE),
            TokenAmount::new(COLL_B, 2_000_000 * ONE),
        ];
        let result = h.offset(100 * ONE, &coll);

        assert!(matches!(result, Err(LedgerError::InsufficientBalance { .. })));
        assert_eq!(h.ledger.state_hash(), hash);
        assert_eq!(h.bank, bank);
    }

    #[test]
    fn test_offset_multi_collateral() {
        let mut h = Harness::new();
        h.provide(ALICE, 600 * ONE).unwrap();
        h.provide(BOB, 400 * ONE).unwrap();

        h.offset(
            100 * ONE,
            &[TokenAmount::new(COLL_A, 10 * ONE), TokenAmount::new(COLL_B, 5 * ONE)],
        )
        .unwrap();

        assert_eq!(h.ledger.used_coll_tokens(), &[COLL_A, COLL_B]);
        assert_eq!(
            h.ledger.depositor_coll_gains(&ALICE).unwrap(),
            vec![TokenAmount::new(COLL_A, 6 * ONE), TokenAmount::new(COLL_B, 3 * ONE)]
        );
        assert_eq!(h.ledger.depositor_coll_gain(&BOB, &COLL_B).unwrap(), 2 * ONE);
        assert_eq!(h.ledger.compounded_deposit(&ALICE).unwrap(), 540 * ONE);
        assert_eq!(h.ledger.compounded_deposit(&BOB).unwrap(), 360 * ONE);
    }

    #[test]
    fn test_scale_change_keeps_late_depositor_precise() {
        let mut h = Harness::new();
        h.provide(ALICE, 100_000 * ONE).unwrap();

        // Leaves 1e-5 of the pool: P = 1e13, still above the scale factor
        h.offset(100_000 * ONE - ONE, &[TokenAmount::new(COLL_A, 100 * ONE)]).unwrap();
        assert_eq!(h.ledger.product(), 10_000_000_000_000);
        assert_eq!(h.ledger.current_scale(), 0);

        h.provide(BOB, ONE).unwrap();
        assert_eq!(h.ledger.depositor_coll_gain(&BOB, &COLL_A).unwrap(), 0);

        // Another 1e-5 factor pushes P below 1e9 and rescales it
        h.offset(2 * ONE - 20_000_000_000_000, &[TokenAmount::new(COLL_A, 2 * ONE)]).unwrap();
        assert_eq!(h.ledger.current_scale(), 1);
        assert_eq!(h.ledger.product(), 100_000_000 * SCALE_FACTOR);
        assert_eq!(h.events.filter_by_type(EventType::ScaleUpdated).len(), 1);

        assert_eq!(h.ledger.compounded_deposit(&BOB).unwrap(), ONE / 100_000);
        // 1e-10 of the initial deposit is below the compounding dust cut
        assert_eq!(h.ledger.compounded_deposit(&ALICE).unwrap(), 0);
        assert_eq!(h.ledger.depositor_coll_gain(&BOB, &COLL_A).unwrap(), ONE);
        assert_eq!(h.ledger.depositor_coll_gain(&ALICE, &COLL_A).unwrap(), 101 * ONE);
        assert_eq!(h.ledger.total_deposits(), 2 * ONE / 100_000);
    }

    #[test]
    fn test_repeated_near_total_offsets_keep_pool_usable() {
        let mut h = Harness::new();
        for _ in 0..4 {
            h.provide(BOB, ONE).unwrap();
            let total = h.ledger.total_deposits();
            h.offset(total - 1, &[]).unwrap();

            assert!(h.ledger.product() >= SCALE_FACTOR);
            assert!(h.ledger.compounded_deposit(&BOB).unwrap() <= h.ledger.total_deposits());
        }

        let receipt = h.provide(ALICE, ONE).unwrap();
        assert_eq!(receipt.new_deposit, ONE);
        assert_eq!(h.ledger.compounded_deposit(&ALICE).unwrap(), ONE);
        assert_eq!(h.withdraw(ALICE, ONE).unwrap().withdrawn, ONE);
    }

    #[test]
    fn test_near_total_loss_rescales_more_than_once() {
        let mut h = Harness::new();
        h.provide(ALICE, ONE).unwrap();

        // P lands exactly on the scale factor
        h.offset(ONE - SCALE_FACTOR, &[]).unwrap();
        assert_eq!(h.ledger.product(), SCALE_FACTOR);
        assert_eq!(h.ledger.current_scale(), 0);

        // Loss rate of 1 - 1e-18 at that P takes two rescales
        h.provide(BOB, ONE).unwrap();
        h.offset(ONE + SCALE_FACTOR - 2, &[]).unwrap();
        assert_eq!(h.ledger.current_scale(), 2);
        assert_eq!(h.ledger.product(), SCALE_FACTOR);
        assert_eq!(h.events.filter_by_type(EventType::ScaleUpdated).len(), 1);

        assert_eq!(h.ledger.compounded_deposit(&ALICE).unwrap(), 0);
        assert_eq!(h.ledger.compounded_deposit(&BOB).unwrap(), 0);

        h.provide(ALICE, ONE).unwrap();
        assert_eq!(h.ledger.compounded_deposit(&ALICE).unwrap(), ONE);
        assert_eq!(h.withdraw(ALICE, ONE).unwrap().withdrawn, ONE);
    }

    #[test]
    fn test_compounded_deposits_never_exceed_total() {
        let mut h = Harness::new();
        h.provide(ALICE, 1_000 * ONE + 7).unwrap();
        h.provide(BOB, 333 * ONE).unwrap();

        for debt in [17 * ONE + 3, 250 * ONE + 1, 3, 400 * ONE + 1] {
            h.offset(debt, &[]).unwrap();
            let sum = h.ledger.compounded_deposit(&ALICE).unwrap()
                + h.ledger.compounded_deposit(&BOB).unwrap();
            assert!(sum <= h.ledger.total_deposits());
        }

        // Each depositor can take out exactly what is reported
        for depositor in [ALICE, BOB] {
            let compounded = h.ledger.compounded_deposit(&depositor).unwrap();
            let receipt = h.withdraw(depositor, compounded).unwrap();
            assert_eq!(receipt.withdrawn, compounded);
            assert_eq!(receipt.remaining_deposit, 0);
        }
    }

    #[test]
    fn test_rollback_restores_applied_operation() {
        let mut h = Harness::new();
        h.provide(ALICE, 1_000 * ONE).unwrap();
        let hash = h.ledger.state_hash();
        let bank = h.bank.clone();

        let applied = h
            .ledger
            .offset(&h.owner, &mut h.bank, &LIQUIDATOR, 500 * ONE, &[TokenAmount::new(COLL_A, ONE)], 9, &mut h.events)
            .unwrap();
        assert_ne!(h.ledger.state_hash(), hash);
        assert_eq!(applied.undo.transfers().len(), 2);

        h.ledger.rollback(&h.owner, &mut h.bank, applied.undo).unwrap();
        assert_eq!(h.ledger.state_hash(), hash);
        assert_eq!(h.bank, bank);
        assert_eq!(h.ledger.product(), DECIMAL_PRECISION);
    }

    #[test]
    fn test_foreign_capability_rejected() {
        let mut h = Harness::new();
        let (_, foreign) =
            StabilityPoolLedger::new(DEBT, POOL, [99u8; 32], LedgerConfig::default()).unwrap();

        let result = h.ledger.provide_to_sp(
            &foreign,
            &mut h.bank,
            &TxContext::new(ALICE, 1),
            ONE,
            &mut h.events,
        );
        assert!(matches!(result, Err(LedgerError::Unauthorized { .. })));

        let result = h.ledger.offset(&foreign, &mut h.bank, &LIQUIDATOR, ONE, &[], 1, &mut h.events);
        assert!(matches!(result, Err(LedgerError::Unauthorized { .. })));
    }

    #[test]
    fn test_claim_after_wipeout_closes_position() {
        let mut h = Harness::new();
        h.provide(ALICE, 500 * ONE).unwrap();
        h.offset(500 * ONE, &[TokenAmount::new(COLL_A, 5 * ONE)]).unwrap();

        let receipt = h.claim(ALICE).unwrap();
        assert_eq!(receipt.deposit, 0);
        assert_eq!(receipt.deposit_lost, 500 * ONE);
        assert_eq!(receipt.gains, vec![TokenAmount::new(COLL_A, 5 * ONE)]);
        assert!(!h.ledger.has_position(&ALICE));
        assert!(matches!(h.claim(ALICE), Err(LedgerError::DepositNotFound { .. })));
    }
}
