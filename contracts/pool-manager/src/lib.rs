//! Stability Pool Manager
//!
//! Registry of one `StabilityPoolLedger` per debt token and the entry point
//! depositors and the liquidation side talk to.
//!
//! ## Key Features
//!
//! - **Registry**: ledgers are created here, in registration order, and the
//!   manager keeps the `PoolOwner` capability of each one
//! - **Transactional fan-out**: a call spanning several debt tokens is
//!   all-or-nothing; ledgers already applied are rolled back, newest first,
//!   when a later one fails
//! - **Privileged offsets**: only the holder of the `Liquidator` capability
//!   can route liquidated debt into the pools
//! - **Events**: ledger events are published to the manager's log only once
//!   the whole transaction has committed

use std::collections::BTreeMap;

use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};

pub mod codec;
pub mod report;


pub use codec::{
    command_to_action, decode_commands, encode_commands, replay, JournalSigners, ManagerAction,
    ManagerCommand, ReplaySummary,
};
pub use report::{PoolReport, StabilityReport};

use spledger_common::{
    access_control::{derive_id, Admin, Authority, Capability, Liquidator, PoolOwner},
    constants::stability_pool::{DUST_THRESHOLD, LEDGER_DOMAIN, MIN_DEPOSIT, POOL_ACCOUNT_DOMAIN},
    errors::{LedgerError, LedgerResult},
    events::{EventLog, PoolEvent},
    token_ops::{revert_all, TokenBank},
    types::{Address, RemainingStability, TokenAmount, TokenId, TxContext},
};
use spledger_stability_pool::{
    Applied, GainsReceipt, LedgerConfig, OffsetOutcome, ProvideReceipt, StabilityPoolLedger, Undo,
    WithdrawReceipt,
};

// ============ Manager Config ============

/// Manager-wide settings, applied to every ledger it creates
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, BorshSerialize, BorshDeserialize)]
pub struct ManagerConfig {
    /// Seed of the manager's authority id
    pub manager_seed: Vec<u8>,
    pub min_deposit: u128,
    pub dust_threshold: u128,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            manager_seed: b"spledger/manager".to_vec(),
            min_deposit: MIN_DEPOSIT,
            dust_threshold: DUST_THRESHOLD,
        }
    }
}

impl ManagerConfig {
    pub fn ledger_config(&self) -> LedgerConfig {
        LedgerConfig {
            min_deposit: self.min_deposit,
            dust_threshold: self.dust_threshold,
        }
    }

    /// Decode a config document from CBOR
    pub fn from_cbor(bytes: &[u8]) -> LedgerResult<Self> {
        ciborium::from_reader(bytes).map_err(|_| LedgerError::Decode {
            reason: "Malformed manager config",
        })
    }

    pub fn to_cbor(&self) -> LedgerResult<Vec<u8>> {
        let mut bytes = Vec::new();
        ciborium::into_writer(self, &mut bytes).map_err(|_| LedgerError::Decode {
            reason: "Unencodable manager config",
        })?;
        Ok(bytes)
    }
}

// ============ Manager ============

struct PoolEntry {
    ledger: StabilityPoolLedger,
    owner: Capability<PoolOwner>,
}

pub struct StabilityPoolManager {
    authority: Authority,
    config: ManagerConfig,
    pools: Vec<PoolEntry>,
    index: BTreeMap<TokenId, usize>,
    events: EventLog,
}

impl StabilityPoolManager {
    /// Create an empty manager together with its admin and liquidator capabilities
    pub fn new(
        config: ManagerConfig,
    ) -> LedgerResult<(Self, Capability<Admin>, Capability<Liquidator>)> {
        let mut authority = Authority::new(&config.manager_seed);
        let admin = authority.mint::<Admin>()?;
        let liquidator = authority.mint::<Liquidator>()?;

        let manager = Self {
            authority,
            config,
            pools: Vec::new(),
            index: BTreeMap::new(),
            events: EventLog::new(),
        };

        Ok((manager, admin, liquidator))
    }

    // ============ Registry ============

    /// Register a ledger for `debt_token`; returns its pool account
    pub fn add_stability_pool(
        &mut self,
        admin: &Capability<Admin>,
        debt_token: TokenId,
        block_height: u64,
    ) -> LedgerResult<Address> {
        self.authority.verify(admin)?;
        if self.index.contains_key(&debt_token) {
            return Err(LedgerError::AlreadyRegistered { debt_token });
        }

        let manager_id = *self.authority.id();
        let ledger_id = derive_id(&[LEDGER_DOMAIN, manager_id.as_slice(), debt_token.as_slice()]);
        let pool_account =
            derive_id(&[POOL_ACCOUNT_DOMAIN, manager_id.as_slice(), debt_token.as_slice()]);
        let (ledger, owner) = StabilityPoolLedger::new(
            debt_token,
            pool_account,
            ledger_id,
            self.config.ledger_config(),
        )?;

        self.index.insert(debt_token, self.pools.len());
        self.pools.push(PoolEntry { ledger, owner });
        self.events.emit(PoolEvent::StabilityPoolAdded {
            debt_token,
            pool: pool_account,
            block_height,
        });

        Ok(pool_account)
    }

    // ============ Mutations ============

    /// Deposit into several pools at once
    pub fn provide_stability<B: TokenBank + ?Sized>(
        &mut self,
        bank: &mut B,
        ctx: &TxContext,
        amounts: &[TokenAmount],
    ) -> LedgerResult<Vec<(TokenId, ProvideReceipt)>> {
        let targets = self.resolve_requests(amounts)?;
        self.transact(bank, &targets, |ledger, owner, bank, step, events| {
            ledger.provide_to_sp(owner, bank, ctx, amounts[step].amount, events)
        })
    }

    /// Withdraw from several pools at once
    pub fn withdraw_stability<B: TokenBank + ?Sized>(
        &mut self,
        bank: &mut B,
        ctx: &TxContext,
        amounts: &[TokenAmount],
    ) -> LedgerResult<Vec<(TokenId, WithdrawReceipt)>> {
        let targets = self.resolve_requests(amounts)?;
        self.transact(bank, &targets, |ledger, owner, bank, step, events| {
            ledger.withdraw_from_sp(owner, bank, ctx, amounts[step].amount, events)
        })
    }

    /// Claim gains from every pool `ctx.caller` holds a position in
    pub fn withdraw_gains<B: TokenBank + ?Sized>(
        &mut self,
        bank: &mut B,
        ctx: &TxContext,
    ) -> LedgerResult<Vec<(TokenId, GainsReceipt)>> {
        let targets: Vec<usize> = self
            .pools
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.ledger.has_position(&ctx.caller))
            .map(|(i, _)| i)
            .collect();

        self.transact(bank, &targets, |ledger, owner, bank, _, events| {
            ledger.withdraw_gains(owner, bank, ctx, events)
        })
    }

    /// Absorb one liquidation, pre-split per debt token
    pub fn offset<B: TokenBank + ?Sized>(
        &mut self,
        liquidator: &Capability<Liquidator>,
        bank: &mut B,
        coll_source: &Address,
        entries: &[RemainingStability],
        block_height: u64,
    ) -> LedgerResult<Vec<(TokenId, OffsetOutcome)>> {
        self.authority.verify(liquidator)?;

        let mut targets = Vec::with_capacity(entries.len());
        let mut selected = Vec::with_capacity(entries.len());
        for entry in entries.iter().filter(|e| e.debt_to_offset > 0) {
            let index = self.resolve(&entry.debt_token)?;
            if *self.pools[index].ledger.pool_account() != entry.pool {
                return Err(LedgerError::InvalidInput {
                    param: "pool",
                    reason: "Pool account does not match debt token",
                });
            }
            if targets.contains(&index) {
                return Err(LedgerError::InvalidInput {
                    param: "entries",
                    reason: "Duplicate debt token",
                });
            }
            targets.push(index);
            selected.push(entry);
        }

        self.transact(bank, &targets, |ledger, owner, bank, step, events| {
            let entry = selected[step];
            ledger.offset(
                owner,
                bank,
                coll_source,
                entry.debt_to_offset,
                &entry.coll_gained,
                block_height,
                events,
            )
        })
    }

    // ============ Queries ============

    pub fn authority_id(&self) -> &Address {
        self.authority.id()
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }

    /// Registered debt tokens, in registration order
    pub fn debt_tokens(&self) -> Vec<TokenId> {
        self.ledgers().map(|l| *l.debt_token()).collect()
    }

    pub fn get_stability_pool(&self, debt_token: &TokenId) -> LedgerResult<&StabilityPoolLedger> {
        let index = self.resolve(debt_token)?;
        Ok(&self.pools[index].ledger)
    }

    /// Total deposits of every pool
    pub fn get_total_deposits(&self) -> Vec<TokenAmount> {
        self.ledgers()
            .map(|l| TokenAmount::new(*l.debt_token(), l.total_deposits()))
            .collect()
    }

    /// `depositor`'s compounded deposit in every pool
    pub fn get_compounded_deposits(&self, depositor: &Address) -> LedgerResult<Vec<TokenAmount>> {
        self.ledgers()
            .map(|l| {
                l.compounded_deposit(depositor)
                    .map(|amount| TokenAmount::new(*l.debt_token(), amount))
            })
            .collect()
    }

    /// Pending gains of `depositor`, per pool that owes any
    pub fn get_depositor_coll_gains(
        &self,
        depositor: &Address,
    ) -> LedgerResult<Vec<(TokenId, Vec<TokenAmount>)>> {
        let mut result = Vec::new();
        for ledger in self.ledgers() {
            let gains = ledger.depositor_coll_gains(depositor)?;
            if !gains.is_empty() {
                result.push((*ledger.debt_token(), gains));
            }
        }
        Ok(result)
    }

    /// One offset template per pool: its account, debt token and remaining
    /// deposits, with zeroed entries for `coll_tokens`
    pub fn get_remaining_stability(&self, coll_tokens: &[TokenId]) -> Vec<RemainingStability> {
        self.ledgers()
            .map(|l| RemainingStability {
                pool: *l.pool_account(),
                debt_token: *l.debt_token(),
                remaining: l.total_deposits(),
                debt_to_offset: 0,
                coll_gained: coll_tokens.iter().map(|t| TokenAmount::new(*t, 0)).collect(),
            })
            .collect()
    }

    /// Published events
    pub fn events(&self) -> &EventLog {
        &self.events
    }

    /// Drain the published events
    pub fn take_events(&mut self) -> EventLog {
        std::mem::take(&mut self.events)
    }

    // ============ Internals ============

    fn ledgers(&self) -> impl Iterator<Item = &StabilityPoolLedger> + '_ {
        self.pools.iter().map(|entry| &entry.ledger)
    }

    fn resolve(&self, debt_token: &TokenId) -> LedgerResult<usize> {
        self.index
            .get(debt_token)
            .copied()
            .ok_or(LedgerError::PoolNotFound { debt_token: *debt_token })
    }

    fn resolve_requests(&self, requests: &[TokenAmount]) -> LedgerResult<Vec<usize>> {
        if requests.is_empty() {
            return Err(LedgerError::InvalidInput {
                param: "amounts",
                reason: "Empty request list",
            });
        }
        for (i, request) in requests.iter().enumerate() {
            if requests[..i].iter().any(|prev| prev.token == request.token) {
                return Err(LedgerError::InvalidInput {
                    param: "amounts",
                    reason: "Duplicate debt token",
                });
            }
        }

        requests.iter().map(|r| self.resolve(&r.token)).collect()
    }

    /// Run `op` on each ledger in `targets` as a single transaction.
    ///
    /// `op` receives the position of the ledger in `targets`. On failure the
    /// ledgers already applied are rolled back in reverse order and no event
    /// is published. The failing op's error is returned, or
    /// `RollbackIncomplete` carrying its code when a transfer could not be
    /// reverted.
    fn transact<B, R, F>(
        &mut self,
        bank: &mut B,
        targets: &[usize],
        mut op: F,
    ) -> LedgerResult<Vec<(TokenId, R)>>
    where
        B: TokenBank + ?Sized,
        F: FnMut(
            &mut StabilityPoolLedger,
            &Capability<PoolOwner>,
            &mut B,
            usize,
            &mut EventLog,
        ) -> LedgerResult<Applied<R>>,
    {
        let mut staged = EventLog::new();
        let mut applied: Vec<(usize, Undo)> = Vec::with_capacity(targets.len());
        let mut receipts = Vec::with_capacity(targets.len());

        for (step, &index) in targets.iter().enumerate() {
            let PoolEntry { ledger, owner } = &mut self.pools[index];
            let debt_token = *ledger.debt_token();

            match op(ledger, &*owner, bank, step, &mut staged) {
                Ok(Applied { receipt, undo }) => {
                    applied.push((index, undo));
                    receipts.push((debt_token, receipt));
                }
                Err(err) => {
                    let unwound = self.unwind(bank, applied);
                    if unwound.is_err() && !matches!(err, LedgerError::RollbackIncomplete { .. }) {
                        return Err(LedgerError::RollbackIncomplete { original: err.code() });
                    }
                    return Err(err);
                }
            }
        }

        self.events.append(staged);
        Ok(receipts)
    }

    /// Restore every applied ledger, newest first, then revert all of their
    /// transfers. A failed revert does not stop the others; the first one is
    /// returned at the end.
    fn unwind<B: TokenBank + ?Sized>(
        &mut self,
        bank: &mut B,
        applied: Vec<(usize, Undo)>,
    ) -> LedgerResult<()> {
        let mut first_failure = None;
        let mut transfers = Vec::new();
        for (index, undo) in applied.into_iter().rev() {
            let PoolEntry { ledger, owner } = &mut self.pools[index];
            match ledger.rewind(&*owner, undo) {
                Ok(records) => transfers.push(records),
                Err(err) => {
                    first_failure.get_or_insert(err);
                }
            }
        }

        for records in &transfers {
            if let Err(err) = revert_all(bank, records) {
                first_failure.get_or_insert(err);
            }
        }
        first_failure.map_or(Ok(()), Err)
    }
}

// ============ Tests ============

#[cfg(test)]
mod tests {
    use super::*;
    use spledger_common::{constants::token::ONE, events::EventType, token_ops::InMemoryTokenBank};

    const DEBT_A: TokenId = [1u8; 32];
    const DEBT_B: TokenId = [2u8; 32];
    const ALICE: Address = [10u8; 32];

    fn manager() -> (StabilityPoolManager, Capability<Admin>, Capability<Liquidator>) {
        StabilityPoolManager::new(ManagerConfig::default()).unwrap()
    }

    #[test]
    fn test_config_cbor() {
        let config = ManagerConfig {
            manager_seed: b"test".to_vec(),
            min_deposit: 5 * ONE,
            dust_threshold: 7,
        };
        let bytes = config.to_cbor().unwrap();
        assert_eq!(ManagerConfig::from_cbor(&bytes).unwrap(), config);

        let result = ManagerConfig::from_cbor(&[0xff, 0x00]);
        assert!(matches!(result, Err(LedgerError::Decode { .. })));
    }

    #[test]
    fn test_add_stability_pool() {
        let (mut manager, admin, _) = manager();
        let pool = manager.add_stability_pool(&admin, DEBT_A, 7).unwrap();

        assert_eq!(manager.pool_count(), 1);
        assert_eq!(*manager.get_stability_pool(&DEBT_A).unwrap().pool_account(), pool);
        assert_eq!(manager.events().filter_by_type(EventType::StabilityPoolAdded).len(), 1);

        let again = manager.add_stability_pool(&admin, DEBT_A, 8);
        assert_eq!(again, Err(LedgerError::AlreadyRegistered { debt_token: DEBT_A }));
    }

    #[test]
    fn test_pool_accounts_are_distinct_per_manager_and_token() {
        let (mut first, admin, _) = manager();
        let a = first.add_stability_pool(&admin, DEBT_A, 1).unwrap();
        let b = first.add_stability_pool(&admin, DEBT_B, 1).unwrap();
        assert_ne!(a, b);

        let (mut second, other_admin, _) = StabilityPoolManager::new(ManagerConfig {
            manager_seed: b"other".to_vec(),
            ..ManagerConfig::default()
        })
        .unwrap();
        let c = second.add_stability_pool(&other_admin, DEBT_A, 1).unwrap();
        assert_ne!(a, c);

        // An admin handle is bound to the manager that minted it
        let result = second.add_stability_pool(&admin, DEBT_B, 1);
        assert!(matches!(result, Err(LedgerError::Unauthorized { .. })));
    }

    #[test]
    fn test_request_validation() {
        let (mut manager, admin, _) = manager();
        manager.add_stability_pool(&admin, DEBT_A, 1).unwrap();
        let mut bank = InMemoryTokenBank::new();
        let ctx = TxContext::new(ALICE, 2);

        let empty = manager.provide_stability(&mut bank, &ctx, &[]);
        assert!(matches!(empty, Err(LedgerError::InvalidInput { .. })));

        let duplicate = [TokenAmount::new(DEBT_A, ONE), TokenAmount::new(DEBT_A, ONE)];
        let result = manager.provide_stability(&mut bank, &ctx, &duplicate);
        assert!(matches!(result, Err(LedgerError::InvalidInput { .. })));

        let unknown = manager.withdraw_stability(&mut bank, &ctx, &[TokenAmount::new(DEBT_B, ONE)]);
        assert_eq!(unknown, Err(LedgerError::PoolNotFound { debt_token: DEBT_B }));
    }

    #[test]
    fn test_withdraw_gains_without_positions_is_empty() {
        let (mut manager, admin, _) = manager();
        manager.add_stability_pool(&admin, DEBT_A, 1).unwrap();
        let mut bank = InMemoryTokenBank::new();
        let events_before = manager.events().len();

        let receipts = manager.withdraw_gains(&mut bank, &TxContext::new(ALICE, 2)).unwrap();
        assert!(receipts.is_empty());
        assert_eq!(manager.events().len(), events_before);
    }

    #[test]
    fn test_remaining_stability_templates() {
        let (mut manager, admin, _) = manager();
        let pool_a = manager.add_stability_pool(&admin, DEBT_A, 1).unwrap();
        manager.add_stability_pool(&admin, DEBT_B, 1).unwrap();

        let templates = manager.get_remaining_stability(&[[9u8; 32]]);
        assert_eq!(templates.len(), 2);
        assert_eq!(templates[0].pool, pool_a);
        assert_eq!(templates[0].debt_token, DEBT_A);
        assert_eq!(templates[1].debt_token, DEBT_B);
        assert_eq!(templates[0].coll_gained, vec![TokenAmount::new([9u8; 32], 0)]);
        assert_eq!(manager.debt_tokens(), vec![DEBT_A, DEBT_B]);
    }

    #[test]
    fn test_take_events_drains_log() {
        let (mut manager, admin, _) = manager();
        manager.add_stability_pool(&admin, DEBT_A, 1).unwrap();

        let taken = manager.take_events();
        assert_eq!(taken.len(), 1);
        assert!(manager.events().is_empty());
    }
}
