/// Policy errors
#[macro_use]
pub mod error;
/// Filter
pub mod filter;
/// Basic policy enforcement
pub mod simple_validator;
/// Policy enforcement interface
pub mod validator;

use crate::prelude::*;

/// The default fee rate, in satoshi per started kilobyte
pub const DEFAULT_FEE_PER_KB_SAT: u64 = 10_000;

/// The default dust limit for channel outputs
pub const DEFAULT_DUST_LIMIT_SAT: u64 = 546;

/// The largest amount that can exist
pub const MAX_MONEY_SAT: u64 = 21_000_000 * 100_000_000;

/// An enforcement policy
pub trait Policy {
    /// A policy error has occurred.
    /// Policy errors can be converted to warnings by returning `Ok(())`
    fn policy_error(&self, _tag: String, msg: String) -> Result<(), error::ValidationError>;
}
