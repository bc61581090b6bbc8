use crate::prelude::*;

use bitcoin::absolute::LockTime;
use bitcoin::hashes::hash160;
use bitcoin::Sequence;

use crate::channel::ChannelBalance;
use crate::policy::Policy;
use crate::tx::tx::CommitmentTerms;

use super::error::ValidationError;

/// A policy checker
///
/// Called by [`crate::channel::Channel`] and [`crate::recipient::Recipient`] before they sign
/// anything the counterparty proposed.
pub trait Validator: SendSync {
    /// Validate the amount locked into a channel
    fn validate_funding_amount(&self, funding_sat: u64) -> Result<(), ValidationError>;

    /// Validate the relative delays of the commitment output scripts
    fn validate_delays(&self, htlc_delay: u16, refund_delay: u16) -> Result<(), ValidationError>;

    /// Validate a refund of the unidirectional channel
    fn validate_refund_tx(
        &self,
        funding_sat: u64,
        refund_sat: u64,
        fee_sat: u64,
        lock_time: LockTime,
        sequence: Sequence,
    ) -> Result<(), ValidationError>;

    /// A payment must be final when signed, so it cannot mature after the refund
    fn validate_payment_lock(&self, lock_time: LockTime, sequence: Sequence) -> Result<(), ValidationError>;

    /// Validate the amounts of a payment of the unidirectional channel.
    ///
    /// * `previous_paid_sat` - the total already paid, zero before the first payment
    /// * `paid_sat` - the new total paid to the payee
    fn validate_payment_tx(
        &self,
        funding_sat: u64,
        previous_paid_sat: u64,
        paid_sat: u64,
        change_sat: u64,
        fee_sat: u64,
    ) -> Result<(), ValidationError>;

    /// Validate a counterparty's commitment before countersigning it.
    ///
    /// * `expected_fee_sat` - the fee recomputed by the receiver
    /// * `receiver_is_funder` - whether the receiver pays the fee
    /// * `agreed` - the latest balances both parties signed, from the receiver's view
    fn validate_commitment_proposal(
        &self,
        funding_sat: u64,
        terms: &CommitmentTerms,
        expected_fee_sat: u64,
        receiver_is_funder: bool,
        agreed: &ChannelBalance,
    ) -> Result<(), ValidationError>;

    /// Validate that a counterparty revocation hash was never used before.
    ///
    /// * `seen` - revocation hashes of counterparty states already countersigned
    /// * `own` - hashes of secrets generated locally (revocation and HTLC)
    fn validate_revocation_hash(
        &self,
        revocation_hash: &hash160::Hash,
        htlc_hash: &hash160::Hash,
        seen: &UnorderedSet<hash160::Hash>,
        own: &UnorderedSet<hash160::Hash>,
    ) -> Result<(), ValidationError>;

    /// The enforcement policy
    fn policy(&self) -> Box<&dyn Policy>;
}
