use crate::prelude::*;
use core::fmt;

use bitcoin::absolute::LockTime;
use bitcoin::hashes::{hash160, Hash};
use bitcoin::secp256k1::rand::RngCore;
use bitcoin::secp256k1::PublicKey;
use bitcoin::transaction::Version;
use bitcoin::{Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness};
use serde_derive::{Deserialize, Serialize};
use serde_with::{hex::Hex, serde_as};

use crate::tx::script::{get_htlc_redeemscript, get_rhtlc_redeemscript, HtlcParams, RhtlcParams};
use crate::util::crypto_utils::{new_secret, secret_hash};
use crate::util::debug_utils::{DebugTxOut, Redacted};
use crate::util::status::{amount_mismatch, unexpected_input, Status};
use crate::util::transaction_utils::{estimate_size, fee_for_size, MULTISIG_SCRIPT_SIG_SIZE};

/// A reference to a previous transaction output: its outpoint plus the output itself.
///
/// For a channel this is the single output every refund, payment and commitment
/// transaction spends.  It is immutable once captured.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundingReference {
    /// Previous transaction and output index
    pub outpoint: OutPoint,
    /// The output being spent
    pub txout: TxOut,
}

impl FundingReference {
    /// A reference to output `vout` of transaction `txid`
    pub fn new(txid: Txid, vout: u32, txout: TxOut) -> Self {
        FundingReference { outpoint: OutPoint { txid, vout }, txout }
    }

    /// A reference to output `vout` of a known transaction
    pub fn from_tx(tx: &Transaction, vout: u32) -> Result<Self, Status> {
        let txout = tx
            .output
            .get(vout as usize)
            .ok_or_else(|| unexpected_input(format!("transaction has no output {}", vout)))?;
        Ok(Self::new(tx.compute_txid(), vout, txout.clone()))
    }

    /// The referenced amount
    pub fn amount_sat(&self) -> u64 {
        self.txout.value.to_sat()
    }

    /// An unsigned input spending the reference
    pub fn to_txin(&self, sequence: Sequence) -> TxIn {
        TxIn {
            previous_output: self.outpoint,
            script_sig: ScriptBuf::new(),
            sequence,
            witness: Witness::new(),
        }
    }

    /// Fails with `UnexpectedInput` unless `tx` spends exactly this reference and nothing else
    pub fn check_sole_input(&self, tx: &Transaction) -> Result<(), Status> {
        if tx.input.len() != 1 {
            return Err(unexpected_input(format!("expected 1 input, saw {}", tx.input.len())));
        }
        if tx.input[0].previous_output != self.outpoint {
            return Err(unexpected_input(format!(
                "input spends {}, expected {}",
                tx.input[0].previous_output, self.outpoint
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for FundingReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FundingReference")
            .field("outpoint", &self.outpoint)
            .field("txout", &DebugTxOut(&self.txout))
            .finish()
    }
}

/// How far a channel transaction has been signed
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignatureState {
    /// No signatures yet
    Unsigned,
    /// Signed by the counterparty with the given multisig key
    PartiallySigned {
        /// The key that signed
        by: PublicKey,
    },
    /// Signed by both parties, valid for broadcast
    FullySigned,
}

/// A refund, payment or commitment transaction together with its signing progress
#[derive(Clone, Debug, PartialEq)]
pub struct ChannelTransaction {
    /// Position in the update sequence
    pub sequence: u64,
    /// The transaction
    tx: Transaction,
    /// Signing progress
    pub state: SignatureState,
}

/// A transaction of the unidirectional channel
pub type PaymentTransaction = ChannelTransaction;
/// A transaction of the bidirectional channel
pub type CommitmentTransaction = ChannelTransaction;

impl ChannelTransaction {
    pub(crate) fn new(sequence: u64, tx: Transaction, state: SignatureState) -> Self {
        ChannelTransaction { sequence, tx, state }
    }

    /// The transaction, only once both parties have signed it
    pub fn broadcastable(&self) -> Option<&Transaction> {
        match self.state {
            SignatureState::FullySigned => Some(&self.tx),
            _ => None,
        }
    }

    /// The outputs, for inspection
    pub fn outputs(&self) -> &[TxOut] {
        &self.tx.output
    }

    /// The transaction with all signatures removed
    pub fn unsigned_tx(&self) -> Transaction {
        crate::util::transaction_utils::strip_script_sigs(&self.tx)
    }
}

/// A secret and its HASH160, shared as-is by revocation and HTLC pairs
#[derive(Clone)]
struct SecretPair {
    secret: [u8; 32],
    hash: hash160::Hash,
}

impl SecretPair {
    fn new<R: RngCore>(rng: &mut R) -> Self {
        let secret = new_secret(rng);
        SecretPair { hash: secret_hash(&secret), secret }
    }
}

/// The revocation secret for one commitment state, generated by its owner
#[derive(Clone)]
pub struct RevocationPair(SecretPair);

impl RevocationPair {
    /// A fresh pair
    pub fn new<R: RngCore>(rng: &mut R) -> Self {
        RevocationPair(SecretPair::new(rng))
    }

    /// The hash embedded in the owner's RHTLC output
    pub fn hash(&self) -> hash160::Hash {
        self.0.hash
    }

    pub(crate) fn secret(&self) -> &[u8; 32] {
        &self.0.secret
    }
}

impl fmt::Debug for RevocationPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RevocationPair").field("hash", &self.0.hash).field("secret", &Redacted).finish()
    }
}

/// The secret of one in-flight payment, generated by its payee
#[derive(Clone)]
pub struct HtlcPair(SecretPair);

impl HtlcPair {
    /// A fresh pair
    pub fn new<R: RngCore>(rng: &mut R) -> Self {
        HtlcPair(SecretPair::new(rng))
    }

    /// The hash the payer embeds in the commitment
    pub fn hash(&self) -> hash160::Hash {
        self.0.hash
    }

    /// The secret, disclosed to settle the payment
    pub fn secret(&self) -> &[u8; 32] {
        &self.0.secret
    }
}

impl fmt::Debug for HtlcPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HtlcPair").field("hash", &self.0.hash).field("secret", &Redacted).finish()
    }
}

/// What a proposer asks for in its next commitment
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CommitmentOutputs {
    /// The counterparty's balance, including the fee if the counterparty funded the channel
    pub counterparty_balance_sat: u64,
    /// The counterparty's current HTLC hash
    pub htlc_hash: hash160::Hash,
}

/// Everything the receiver needs to rebuild a proposed commitment transaction
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitmentTerms {
    /// Commitment number
    pub sequence: u64,
    /// Value of the owner's RHTLC output
    pub to_owner_sat: u64,
    /// Value of the counterparty's HTLC output
    pub to_counterparty_sat: u64,
    /// Fee, paid by the funder
    pub fee_sat: u64,
    /// Hash of the owner's revocation secret for this state
    #[serde_as(as = "Hex")]
    pub revocation_hash: [u8; 20],
    /// Hash of the counterparty's HTLC secret
    #[serde_as(as = "Hex")]
    pub htlc_hash: [u8; 20],
    /// Relative delay of the RHTLC HTLC branch
    pub htlc_delay: u16,
    /// Relative delay of the refund branches
    pub refund_delay: u16,
}

impl CommitmentTerms {
    /// The revocation hash
    pub fn revocation_hash(&self) -> hash160::Hash {
        hash160::Hash::from_byte_array(self.revocation_hash)
    }

    /// The HTLC hash
    pub fn htlc_hash(&self) -> hash160::Hash {
        hash160::Hash::from_byte_array(self.htlc_hash)
    }

    /// Gross balances `(owner, counterparty)`, with the fee added back to the funder's side
    pub fn balances(&self, owner_is_funder: bool) -> (u64, u64) {
        if owner_is_funder {
            (self.to_owner_sat + self.fee_sat, self.to_counterparty_sat)
        } else {
            (self.to_owner_sat, self.to_counterparty_sat + self.fee_sat)
        }
    }
}

/// The keys named by a commitment's output scripts
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CommitmentKeys {
    /// Payment key of the commitment's owner
    pub owner_payment_pubkey: PublicKey,
    /// Payment key of the counterparty
    pub counterparty_payment_pubkey: PublicKey,
}

impl CommitmentKeys {
    /// The RHTLC parameters for a set of terms
    pub fn rhtlc_params(&self, terms: &CommitmentTerms) -> RhtlcParams {
        RhtlcParams {
            owner_pubkey: self.owner_payment_pubkey,
            counterparty_pubkey: self.counterparty_payment_pubkey,
            revocation_hash: terms.revocation_hash(),
            htlc_hash: terms.htlc_hash(),
            htlc_delay: terms.htlc_delay,
            refund_delay: terms.refund_delay,
        }
    }

    /// The HTLC parameters for a set of terms
    pub fn htlc_params(&self, terms: &CommitmentTerms) -> HtlcParams {
        HtlcParams {
            payee_pubkey: self.counterparty_payment_pubkey,
            payer_pubkey: self.owner_payment_pubkey,
            htlc_hash: terms.htlc_hash(),
            refund_delay: terms.refund_delay,
        }
    }
}

/// Build the unsigned commitment transaction for `terms`.
///
/// Output 0 is the owner's RHTLC, output 1 the counterparty's HTLC.  Zero-valued
/// outputs are left out.
pub fn build_commitment_tx(
    funding: &FundingReference,
    terms: &CommitmentTerms,
    keys: &CommitmentKeys,
) -> Result<Transaction, Status> {
    let total = terms
        .to_owner_sat
        .checked_add(terms.to_counterparty_sat)
        .and_then(|v| v.checked_add(terms.fee_sat))
        .ok_or_else(|| amount_mismatch("commitment amounts overflow"))?;
    if total != funding.amount_sat() {
        return Err(amount_mismatch(format!(
            "outputs {} + {} + fee {} != funding {}",
            terms.to_owner_sat,
            terms.to_counterparty_sat,
            terms.fee_sat,
            funding.amount_sat()
        )));
    }
    let mut output = Vec::new();
    if terms.to_owner_sat > 0 {
        output.push(TxOut {
            value: Amount::from_sat(terms.to_owner_sat),
            script_pubkey: get_rhtlc_redeemscript(&keys.rhtlc_params(terms)).to_p2sh(),
        });
    }
    if terms.to_counterparty_sat > 0 {
        output.push(TxOut {
            value: Amount::from_sat(terms.to_counterparty_sat),
            script_pubkey: get_htlc_redeemscript(&keys.htlc_params(terms)).to_p2sh(),
        });
    }
    Ok(Transaction {
        version: Version::ONE,
        lock_time: LockTime::ZERO,
        input: vec![funding.to_txin(Sequence::MAX)],
        output,
    })
}

/// The fee of a commitment transaction, which depends only on its shape.
///
/// Both outputs are counted so the fee does not move with the balance split.
pub fn commitment_fee(
    funding: &FundingReference,
    keys: &CommitmentKeys,
    htlc_delay: u16,
    refund_delay: u16,
    fee_per_kb_sat: u64,
) -> u64 {
    let placeholder = CommitmentTerms {
        sequence: 0,
        to_owner_sat: 1,
        to_counterparty_sat: 1,
        fee_sat: 0,
        revocation_hash: [0; 20],
        htlc_hash: [0; 20],
        htlc_delay,
        refund_delay,
    };
    let tx = Transaction {
        version: Version::ONE,
        lock_time: LockTime::ZERO,
        input: vec![funding.to_txin(Sequence::MAX)],
        output: vec![
            TxOut {
                value: Amount::from_sat(placeholder.to_owner_sat),
                script_pubkey: get_rhtlc_redeemscript(&keys.rhtlc_params(&placeholder)).to_p2sh(),
            },
            TxOut {
                value: Amount::from_sat(placeholder.to_counterparty_sat),
                script_pubkey: get_htlc_redeemscript(&keys.htlc_params(&placeholder)).to_p2sh(),
            },
        ],
    };
    fee_for_size(estimate_size(&tx, MULTISIG_SCRIPT_SIG_SIZE), fee_per_kb_sat)
}
