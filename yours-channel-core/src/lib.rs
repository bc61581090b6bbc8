#![crate_name = "yours_channel"]

//! Two-party Bitcoin payment channels.
//!
//! See [`channel::Channel`] for the bidirectional channel with revocable commitments and
//! [`sender::Sender`] / [`recipient::Recipient`] for the unidirectional one.

#![forbid(unsafe_code)]
#![allow(bare_trait_objects)]
#![warn(rustdoc::broken_intra_doc_links)]
#![warn(missing_docs)]

#[macro_use]
extern crate alloc;
extern crate core;

pub use bitcoin;

/// Various utilities
#[macro_use]
pub mod util;
/// Policy enforcement
#[macro_use]
pub mod policy;
/// Bidirectional channel
pub mod channel;
/// Payee side of the unidirectional channel
pub mod recipient;
/// Payer side of the unidirectional channel
pub mod sender;
/// Channel key derivation
pub mod signer;
/// Transaction and script construction
pub mod tx;
/// Messages exchanged between the two parties
pub mod wire;

pub use alloc::sync::Arc;

/// std / no_std compat
pub mod prelude {
    pub use alloc::{boxed::Box, string::String, vec, vec::Vec};

    pub use hashbrown::HashSet as UnorderedSet;

    pub use alloc::collections::BTreeMap as OrderedMap;

    pub use alloc::string::ToString;

    pub use std::sync::{Mutex, MutexGuard};

    /// Convenience trait for Send + Sync
    pub trait SendSync: Send + Sync {}
}

pub use prelude::SendSync;
