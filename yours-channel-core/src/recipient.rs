use crate::prelude::*;
use core::fmt;

use bitcoin::secp256k1::{self, PublicKey, Secp256k1, SecretKey};
use bitcoin::{Address, Network, Transaction};
use tracing::*;

use crate::policy::simple_validator::{SimplePolicy, SimpleValidator};
use crate::policy::validator::Validator;
use crate::tx::multisig::{MultisigContext, MultisigSignatures};
use crate::tx::tx::{FundingReference, SignatureState};
use crate::util::debug_utils::{DebugVecTxOut, Redacted};
use crate::util::status::{
    amount_mismatch, invalid_proposal, not_initialized, unexpected_input, Status,
};
use crate::util::transaction_utils::{sign_legacy_input, sum_outputs};
use crate::wire::{MessageKind, WireMessage};
use crate::Arc;

/// The payee side of a unidirectional channel.
///
/// Validates and countersigns the refund and payments the sender proposes.
pub struct Recipient {
    secp_ctx: Secp256k1<secp256k1::All>,
    multisig_key: SecretKey,
    multisig_pubkey: PublicKey,
    counterparty_multisig_pubkey: PublicKey,
    own_address: Address,
    network: Network,
    validator: Arc<dyn Validator>,
    multisig: Option<MultisigContext>,
    funding: Option<FundingReference>,
    last_sequence: Option<u64>,
    refund_signed: bool,
    paid_sat: u64,
}

impl Recipient {
    /// A recipient signing the multisig with `multisig_key` and paid at `own_address`
    pub fn new(
        multisig_key: SecretKey,
        counterparty_multisig_pubkey: PublicKey,
        own_address: Address,
        policy: SimplePolicy,
    ) -> Self {
        let network = policy.network;
        Self::new_with_validator(
            multisig_key,
            counterparty_multisig_pubkey,
            own_address,
            network,
            Arc::new(SimpleValidator::new(policy)),
        )
    }

    /// A recipient enforcing a custom policy
    pub fn new_with_validator(
        multisig_key: SecretKey,
        counterparty_multisig_pubkey: PublicKey,
        own_address: Address,
        network: Network,
        validator: Arc<dyn Validator>,
    ) -> Self {
        let secp_ctx = Secp256k1::new();
        let multisig_pubkey = PublicKey::from_secret_key(&secp_ctx, &multisig_key);
        Recipient {
            secp_ctx,
            multisig_key,
            multisig_pubkey,
            counterparty_multisig_pubkey,
            own_address,
            network,
            validator,
            multisig: None,
            funding: None,
            last_sequence: None,
            refund_signed: false,
            paid_sat: 0,
        }
    }

    /// Build the multisig context
    pub fn initialize(&mut self) -> Result<(), Status> {
        if self.multisig.is_none() {
            let multisig = MultisigContext::new(
                self.multisig_pubkey,
                self.counterparty_multisig_pubkey,
                self.network,
            )?;
            info!("recipient ready on channel {}", multisig.address());
            self.multisig = Some(multisig);
        }
        Ok(())
    }

    /// Whether [`Recipient::initialize`] completed
    pub fn is_initialized(&self) -> bool {
        self.multisig.is_some()
    }

    fn multisig(&self) -> Result<&MultisigContext, Status> {
        self.multisig.as_ref().ok_or_else(|| not_initialized("recipient is not initialized"))
    }

    /// The recipient's multisig key
    pub fn multisig_pubkey(&self) -> PublicKey {
        self.multisig_pubkey
    }

    /// The channel id, which is the multisig address
    pub fn channel_id(&self) -> Result<String, Status> {
        Ok(self.multisig()?.address().to_string())
    }

    /// Total paid by the latest countersigned payment
    pub fn paid_sat(&self) -> u64 {
        self.paid_sat
    }

    /// Record the funding output, which must pay the channel multisig
    pub fn accept_funding(&mut self, funding: FundingReference) -> Result<(), Status> {
        let multisig = self.multisig()?;
        if funding.txout.script_pubkey != multisig.script_pubkey() {
            return Err(unexpected_input(format!(
                "funding {} does not pay {}",
                funding.outpoint,
                multisig.address()
            )));
        }
        if let Some(existing) = &self.funding {
            if *existing != funding {
                return Err(unexpected_input(format!(
                    "channel already funded by {}",
                    existing.outpoint
                )));
            }
        }
        self.validator.validate_funding_amount(funding.amount_sat())?;
        info!("channel funded by {} with {} sat", funding.outpoint, funding.amount_sat());
        self.funding = Some(funding);
        Ok(())
    }

    /// Validate a refund or payment proposed by the sender and add the recipient's signature
    #[instrument(skip(self, message), fields(kind = ?message.kind, sequence = message.sequence))]
    pub fn countersign(&mut self, message: WireMessage) -> Result<WireMessage, Status> {
        let multisig = self.multisig()?;
        let funding =
            self.funding.as_ref().ok_or_else(|| not_initialized("funding not yet accepted"))?;
        let channel_id = multisig.address().to_string();
        if message.kind == MessageKind::Commitment {
            return Err(invalid_proposal("commitments are not part of a unidirectional channel"));
        }
        message.check_envelope(message.kind, &channel_id, &self.counterparty_multisig_pubkey)?;
        if message.state != SignatureState::Unsigned {
            return Err(invalid_proposal(format!("expected an unsigned proposal, saw {:?}", message.state)));
        }
        if let Some(last) = self.last_sequence {
            if message.sequence <= last {
                return Err(invalid_proposal(format!(
                    "sequence {} does not follow {}",
                    message.sequence, last
                )));
            }
        }
        funding.check_sole_input(&message.tx)?;
        let total = sum_outputs(&message.tx)?;
        let fee_sat = funding.amount_sat().checked_sub(total).ok_or_else(|| {
            amount_mismatch(format!("outputs {} exceed funding {}", total, funding.amount_sat()))
        })?;
        debug!("{:?} {}: {:?}", message.kind, message.sequence, DebugVecTxOut(&message.tx.output));

        let paid_sat = match message.kind {
            MessageKind::Refund => {
                self.check_refund(&message.tx, funding, fee_sat)?;
                None
            }
            _ => Some(self.check_payment(&message.tx, funding, fee_sat)?),
        };

        let sig =
            sign_legacy_input(&self.secp_ctx, &message.tx, 0, multisig.redeem_script(), &self.multisig_key)?;
        let mut sigs: MultisigSignatures = [None, None];
        multisig.add_signature(&mut sigs, &self.multisig_pubkey, sig)?;
        let script_sig = multisig.script_sig(&sigs)?;

        let mut reply = message;
        reply.tx.input[0].script_sig = script_sig;
        reply.state = SignatureState::PartiallySigned { by: self.multisig_pubkey };
        reply.signer = self.multisig_pubkey;

        self.last_sequence = Some(reply.sequence);
        match paid_sat {
            None => self.refund_signed = true,
            Some(paid_sat) => self.paid_sat = paid_sat,
        }
        info!("countersigned {:?} {}", reply.kind, reply.sequence);
        trace_channel_state!(self);
        Ok(reply)
    }

    fn check_refund(
        &self,
        tx: &Transaction,
        funding: &FundingReference,
        fee_sat: u64,
    ) -> Result<(), Status> {
        if self.refund_signed || self.paid_sat > 0 {
            return Err(invalid_proposal("refund is only signed before any payment"));
        }
        if tx.output.len() != 1 {
            return Err(amount_mismatch(format!("refund has {} outputs", tx.output.len())));
        }
        if tx.output[0].script_pubkey == self.own_address.script_pubkey() {
            return Err(amount_mismatch("refund pays the recipient"));
        }
        self.validator.validate_refund_tx(
            funding.amount_sat(),
            tx.output[0].value.to_sat(),
            fee_sat,
            tx.lock_time,
            tx.input[0].sequence,
        )?;
        Ok(())
    }

    fn check_payment(
        &self,
        tx: &Transaction,
        funding: &FundingReference,
        fee_sat: u64,
    ) -> Result<u64, Status> {
        if !self.refund_signed {
            return Err(invalid_proposal("payment proposed before the refund"));
        }
        self.validator.validate_payment_lock(tx.lock_time, tx.input[0].sequence)?;
        let own_script = self.own_address.script_pubkey();
        let (paid, change): (Vec<_>, Vec<_>) =
            tx.output.iter().partition(|out| out.script_pubkey == own_script);
        if paid.len() != 1 || change.len() > 1 {
            return Err(amount_mismatch(format!(
                "payment must have one output to {} and at most one change output",
                self.own_address
            )));
        }
        let paid_sat = paid[0].value.to_sat();
        let change_sat = change.first().map(|out| out.value.to_sat()).unwrap_or(0);
        self.validator
            .validate_payment_tx(funding.amount_sat(), self.paid_sat, paid_sat, change_sat, fee_sat)
            .map_err(|err| amount_mismatch(format!("{:?}", err.kind)))?;
        Ok(paid_sat)
    }
}

impl fmt::Debug for Recipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Recipient")
            .field("multisig_key", &Redacted)
            .field("multisig_pubkey", &self.multisig_pubkey)
            .field("counterparty_multisig_pubkey", &self.counterparty_multisig_pubkey)
            .field("own_address", &self.own_address)
            .field("funding", &self.funding)
            .field("last_sequence", &self.last_sequence)
            .field("refund_signed", &self.refund_signed)
            .field("paid_sat", &self.paid_sat)
            .finish()
    }
}
