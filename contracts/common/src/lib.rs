//! spledger Common Library
//!
//! Shared types, constants, and utilities for the spledger stability pool
//! ledgers and their manager.
//!
//! ## Contents
//!
//! - **Fixed-point math**: 18-decimal arithmetic over `u128` amounts with
//!   256-bit checked intermediates and error-diffusion accumulators
//! - **Types**: deposit snapshots, token amounts, offset instructions
//! - **Events**: typed records consumed by the indexing layer
//! - **Access control**: capability handles for privileged entry points
//! - **Collaborators**: token bank, price feed and reserve pool traits
//!
//! This crate is `no_std` compatible when built without the `std` feature.

#![cfg_attr(not(feature = "std"), no_std)]

#[cfg(not(feature = "std"))]
extern crate alloc;

// Re-export collections for submodules based on feature
#[cfg(not(feature = "std"))]
pub use alloc::{collections::BTreeMap, vec::Vec};
#[cfg(feature = "std")]
pub use std::{collections::BTreeMap, vec::Vec};

pub mod constants;
pub mod errors;
pub mod types;
pub mod math;
pub mod events;
pub mod access_control;
pub mod token_ops;
pub mod oracle;

// Re-exports for convenience
pub use errors::*;
pub use types::*;
pub use math::*;
pub use events::*;
pub use access_control::*;
pub use token_ops::*;
pub use oracle::*;
