//! Access Control Module
//!
//! Capability-based authorization for privileged entry points.
//!
//! ## Key Features
//!
//! - **Typed Roles**: `Admin`, `Liquidator` and `PoolOwner` are distinct types,
//!   so a handle for one role cannot be passed where another is required
//! - **Unforgeable Handles**: a `Capability<R>` can only be obtained from the
//!   `Authority` that owns the guarded object, once per role
//! - **Deterministic Identity**: authority ids are sha-256 digests of a seed

use core::fmt;
use core::marker::PhantomData;

use sha2::{Digest, Sha256};

use crate::errors::{LedgerError, LedgerResult};
use crate::types::Address;

// ============================================================================
// Roles
// ============================================================================

mod sealed {
    pub trait Sealed {}
}

/// A role a capability can be minted for
pub trait Role: sealed::Sealed {
    /// Role name used in errors
    const NAME: &'static str;
    /// Bit in the authority's issued-set
    const BIT: u8;
}

/// May register new ledgers with a manager
#[derive(Debug)]
pub enum Admin {}

/// May route liquidated debt into the pools
#[derive(Debug)]
pub enum Liquidator {}

/// May mutate a single ledger (held by the manager that created it)
#[derive(Debug)]
pub enum PoolOwner {}

impl sealed::Sealed for Admin {}
impl sealed::Sealed for Liquidator {}
impl sealed::Sealed for PoolOwner {}

impl Role for Admin {
    const NAME: &'static str = "admin";
    const BIT: u8 = 0b001;
}

impl Role for Liquidator {
    const NAME: &'static str = "liquidator";
    const BIT: u8 = 0b010;
}

impl Role for PoolOwner {
    const NAME: &'static str = "pool_owner";
    const BIT: u8 = 0b100;
}

// ============================================================================
// Capability
// ============================================================================

/// Proof that the holder may exercise role `R` on one authority's object
pub struct Capability<R: Role> {
    authority: Address,
    _role: PhantomData<R>,
}

impl<R: Role> Capability<R> {
    /// Id of the authority that minted this capability
    pub fn authority(&self) -> &Address {
        &self.authority
    }

    /// Role name
    pub fn role(&self) -> &'static str {
        R::NAME
    }
}

impl<R: Role> fmt::Debug for Capability<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Capability")
            .field("role", &R::NAME)
            .field("authority", &self.authority)
            .finish()
    }
}

// ============================================================================
// Authority
// ============================================================================

/// Issuer and verifier of capabilities for one guarded object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authority {
    id: Address,
    issued: u8,
}

impl Authority {
    /// Authority whose id is `sha256(seed)`
    pub fn new(seed: &[u8]) -> Self {
        Self::with_id(derive_id(&[seed]))
    }

    /// Authority with a precomputed id
    pub fn with_id(id: Address) -> Self {
        Self { id, issued: 0 }
    }

    pub fn id(&self) -> &Address {
        &self.id
    }

    /// Hand out the single capability for role `R`
    pub fn mint<R: Role>(&mut self) -> LedgerResult<Capability<R>> {
        if self.issued & R::BIT != 0 {
            return Err(LedgerError::CapabilityAlreadyIssued { role: R::NAME });
        }
        self.issued |= R::BIT;

        Ok(Capability {
            authority: self.id,
            _role: PhantomData,
        })
    }

    /// Check that `cap` was minted by this authority
    pub fn verify<R: Role>(&self, cap: &Capability<R>) -> LedgerResult<()> {
        if cap.authority != self.id {
            return Err(LedgerError::Unauthorized {
                expected: self.id,
                actual: cap.authority,
            });
        }
        Ok(())
    }
}

/// sha-256 over the concatenation of `parts`
pub fn derive_id(parts: &[&[u8]]) -> Address {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    let result = hasher.finalize();
    let mut id = [0u8; 32];
    id.copy_from_slice(&result);
    id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mint_once_per_role() {
        let mut authority = Authority::new(b"manager");

        let admin = authority.mint::<Admin>().unwrap();
        let liquidator = authority.mint::<Liquidator>().unwrap();
        assert_eq!(admin.authority(), authority.id());
        assert_eq!(liquidator.role(), "liquidator");

        assert_eq!(
            authority.mint::<Admin>().unwrap_err(),
            LedgerError::CapabilityAlreadyIssued { role: "admin" }
        );
    }

    #[test]
    fn test_verify_rejects_foreign_capability() {
        let mut ours = Authority::new(b"ours");
        let mut theirs = Authority::new(b"theirs");

        let own_cap = ours.mint::<Liquidator>().unwrap();
        let foreign_cap = theirs.mint::<Liquidator>().unwrap();

        assert!(ours.verify(&own_cap).is_ok());
        assert!(matches!(
            ours.verify(&foreign_cap),
            Err(LedgerError::Unauthorized { .. })
        ));
    }

    #[test]
    fn test_derive_id_is_deterministic() {
        assert_eq!(
            derive_id(&[b"a".as_slice(), b"b".as_slice()]),
            derive_id(&[b"ab".as_slice()])
        );
        assert_ne!(derive_id(&[b"a".as_slice()]), derive_id(&[b"b".as_slice()]));
        assert_eq!(*Authority::new(b"seed").id(), derive_id(&[b"seed".as_slice()]));
    }
}
