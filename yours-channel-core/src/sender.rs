use crate::prelude::*;
use core::fmt;

use bitcoin::absolute::LockTime;
use bitcoin::secp256k1::{self, PublicKey, Secp256k1, SecretKey};
use bitcoin::transaction::Version;
use bitcoin::{Address, Amount, Network, Sequence, Transaction, TxOut};
use tracing::*;

use crate::policy::simple_validator::SimplePolicy;
use crate::tx::multisig::MultisigContext;
use crate::tx::tx::{FundingReference, PaymentTransaction, SignatureState};
use crate::util::debug_utils::{DebugVecTxOut, Redacted};
use crate::util::status::{
    amount_mismatch, invalid_proposal, not_initialized, signature_mismatch,
    unexpected_input, update_in_progress, Status,
};
use crate::util::transaction_utils::{
    estimate_size, fee_for_size, p2pkh_script_pubkey, p2pkh_script_sig, same_unsigned,
    sign_legacy_input, verify_legacy_input, MULTISIG_SCRIPT_SIG_SIZE, P2PKH_SCRIPT_SIG_SIZE,
};
use crate::wire::{check_channel_id, check_version, Counterparty, MessageKind, WireMessage, WIRE_VERSION};

/// Progress of the payer side of a unidirectional channel
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SenderState {
    /// Keys not yet derived
    Uninitialized,
    /// Own keys known
    Initialized,
    /// Multisig address built
    MultisigReady,
    /// Funding transaction built and signed
    FundingBuilt,
    /// A fully-signed refund is held
    RefundExchanged,
    /// A fully-signed payment is held, with its sequence
    PaymentExchanged(u64),
}

struct SenderKeys {
    pubkey: PublicKey,
    address: Address,
    multisig_pubkey: PublicKey,
    multisig: MultisigContext,
}

struct PendingExchange {
    message: WireMessage,
    // the new payment total, for payments
    paid_sat: Option<u64>,
}

/// The payer side of a unidirectional channel.
///
/// Funds a 2-of-2 multisig with the recipient, obtains a time-locked refund, then pays
/// by repeatedly exchanging transactions that move more of the funding to the recipient.
pub struct Sender {
    secp_ctx: Secp256k1<secp256k1::All>,
    funding_key: SecretKey,
    multisig_key: SecretKey,
    counterparty_multisig_pubkey: PublicKey,
    counterparty_address: Address,
    policy: SimplePolicy,
    state: SenderState,
    keys: Option<SenderKeys>,
    funding: Option<FundingReference>,
    balance_sat: u64,
    paid_sat: u64,
    next_sequence: u64,
    refund: Option<PaymentTransaction>,
    latest_payment: Option<PaymentTransaction>,
    pending: Option<PendingExchange>,
}

impl Sender {
    /// A sender funding from `funding_key` and signing the multisig with `multisig_key`.
    ///
    /// Payments go to `counterparty_address`.
    pub fn new(
        funding_key: SecretKey,
        multisig_key: SecretKey,
        counterparty_multisig_pubkey: PublicKey,
        counterparty_address: Address,
        policy: SimplePolicy,
    ) -> Self {
        Sender {
            secp_ctx: Secp256k1::new(),
            funding_key,
            multisig_key,
            counterparty_multisig_pubkey,
            counterparty_address,
            policy,
            state: SenderState::Uninitialized,
            keys: None,
            funding: None,
            balance_sat: 0,
            paid_sat: 0,
            next_sequence: 0,
            refund: None,
            latest_payment: None,
            pending: None,
        }
    }

    /// Compute own keys and the multisig context
    pub fn initialize(&mut self) -> Result<(), Status> {
        if self.keys.is_some() {
            return Ok(());
        }
        let pubkey = PublicKey::from_secret_key(&self.secp_ctx, &self.funding_key);
        let address = Address::p2pkh(bitcoin::PublicKey::new(pubkey), self.network());
        let multisig_pubkey = PublicKey::from_secret_key(&self.secp_ctx, &self.multisig_key);
        self.state = SenderState::Initialized;
        let multisig =
            MultisigContext::new(multisig_pubkey, self.counterparty_multisig_pubkey, self.network())?;
        info!("sender ready on channel {}", multisig.address());
        self.keys = Some(SenderKeys { pubkey, address, multisig_pubkey, multisig });
        self.state = SenderState::MultisigReady;
        trace_channel_state!(self);
        Ok(())
    }

    /// Whether [`Sender::initialize`] completed
    pub fn is_initialized(&self) -> bool {
        self.keys.is_some()
    }

    /// Protocol progress
    pub fn state(&self) -> SenderState {
        self.state
    }

    /// The network addresses are built for
    pub fn network(&self) -> Network {
        self.policy.network
    }

    fn keys(&self) -> Result<&SenderKeys, Status> {
        self.keys.as_ref().ok_or_else(|| not_initialized("sender is not initialized"))
    }

    /// The payer's own public key
    pub fn pubkey(&self) -> Result<PublicKey, Status> {
        Ok(self.keys()?.pubkey)
    }

    /// The payer's own P2PKH address, which receives change and the refund
    pub fn address(&self) -> Result<&Address, Status> {
        Ok(&self.keys()?.address)
    }

    /// The payer's multisig key
    pub fn multisig_pubkey(&self) -> Result<PublicKey, Status> {
        Ok(self.keys()?.multisig_pubkey)
    }

    /// The funding multisig
    pub fn multisig(&self) -> Result<&MultisigContext, Status> {
        Ok(&self.keys()?.multisig)
    }

    /// The channel id, which is the multisig address
    pub fn channel_id(&self) -> Result<String, Status> {
        Ok(self.keys()?.multisig.address().to_string())
    }

    /// The funding reference, once the funding transaction is built
    pub fn funding(&self) -> Option<&FundingReference> {
        self.funding.as_ref()
    }

    /// Amount locked in the channel
    pub fn balance_sat(&self) -> u64 {
        self.balance_sat
    }

    /// Total paid by the latest fully-signed payment
    pub fn paid_sat(&self) -> u64 {
        self.paid_sat
    }

    /// The fully-signed refund
    pub fn refund(&self) -> Option<&PaymentTransaction> {
        self.refund.as_ref()
    }

    /// The latest fully-signed payment
    pub fn latest_payment(&self) -> Option<&PaymentTransaction> {
        self.latest_payment.as_ref()
    }

    /// The message awaiting the recipient's signature
    pub fn pending_message(&self) -> Option<&WireMessage> {
        self.pending.as_ref().map(|p| &p.message)
    }

    /// Build and sign the funding transaction.
    ///
    /// `input` must be a P2PKH output of `pubkey`, which must be the sender's own key.
    /// Output 0 locks `amount_sat` into the multisig, output 1 returns the change.
    #[instrument(skip(self))]
    pub fn build_funding_tx(
        &mut self,
        amount_sat: u64,
        input: FundingReference,
        pubkey: &PublicKey,
    ) -> Result<Transaction, Status> {
        let keys = self.keys()?;
        if self.funding.is_some() {
            return Err(unexpected_input("funding transaction already built"));
        }
        if *pubkey != keys.pubkey {
            return Err(unexpected_input(format!("{} is not the sender key", pubkey)));
        }
        let script_code = p2pkh_script_pubkey(pubkey);
        if input.txout.script_pubkey != script_code {
            return Err(unexpected_input(format!(
                "input {} does not pay the sender key",
                input.outpoint
            )));
        }
        if amount_sat < self.policy.dust_limit_sat || amount_sat > self.policy.max_funding_sat {
            return Err(amount_mismatch(format!("funding amount {} out of range", amount_sat)));
        }

        let change_script = p2pkh_script_pubkey(&keys.pubkey);
        let mut tx = Transaction {
            version: Version::ONE,
            lock_time: LockTime::ZERO,
            input: vec![input.to_txin(Sequence::MAX)],
            output: vec![
                TxOut { value: Amount::from_sat(amount_sat), script_pubkey: keys.multisig.script_pubkey() },
                TxOut { value: Amount::ZERO, script_pubkey: change_script },
            ],
        };
        let fee_sat = fee_for_size(estimate_size(&tx, P2PKH_SCRIPT_SIG_SIZE), self.policy.fee_per_kb_sat);
        let change_sat = input
            .amount_sat()
            .checked_sub(amount_sat)
            .and_then(|v| v.checked_sub(fee_sat))
            .ok_or_else(|| {
                amount_mismatch(format!(
                    "input {} cannot cover {} plus fee {}",
                    input.amount_sat(),
                    amount_sat,
                    fee_sat
                ))
            })?;
        if change_sat < self.policy.dust_limit_sat {
            return Err(amount_mismatch(format!("change {} below dust limit", change_sat)));
        }
        tx.output[1].value = Amount::from_sat(change_sat);

        let sig = sign_legacy_input(&self.secp_ctx, &tx, 0, &script_code, &self.funding_key)?;
        tx.input[0].script_sig = p2pkh_script_sig(&sig, pubkey)?;

        let funding = FundingReference::from_tx(&tx, 0)?;
        info!(
            "funding {} sat into {} at {}, fee {}",
            amount_sat,
            keys.multisig.address(),
            funding.outpoint,
            fee_sat
        );
        self.funding = Some(funding);
        self.balance_sat = amount_sat;
        self.state = SenderState::FundingBuilt;
        trace_channel_state!(self);
        Ok(tx)
    }

    fn require_funding(&self) -> Result<&FundingReference, Status> {
        self.funding.as_ref().ok_or_else(|| not_initialized("funding transaction not built"))
    }

    fn require_idle(&self) -> Result<(), Status> {
        match &self.pending {
            Some(p) => Err(update_in_progress(format!(
                "{:?} {} awaiting signature",
                p.message.kind, p.message.sequence
            ))),
            None => Ok(()),
        }
    }

    fn channel_fee(&self, tx: &Transaction) -> u64 {
        fee_for_size(estimate_size(tx, MULTISIG_SCRIPT_SIG_SIZE), self.policy.fee_per_kb_sat)
    }

    fn make_message(&mut self, kind: MessageKind, tx: Transaction, paid_sat: Option<u64>) -> Result<WireMessage, Status> {
        let keys = self.keys()?;
        let message = WireMessage {
            version: WIRE_VERSION,
            kind,
            channel_id: keys.multisig.address().to_string(),
            sequence: self.next_sequence,
            state: SignatureState::Unsigned,
            signer: keys.multisig_pubkey,
            tx,
            terms: None,
        };
        // never reuse a sequence, even for an attempt that is later abandoned
        self.next_sequence += 1;
        debug!("proposing {:?} {}: {:?}", kind, message.sequence, DebugVecTxOut(&message.tx.output));
        self.pending = Some(PendingExchange { message: message.clone(), paid_sat });
        Ok(message)
    }

    /// Build the unsigned refund, which returns the funding less fee to the payer once
    /// `lock_time` is reached
    #[instrument(skip(self))]
    pub fn build_refund_tx(&mut self, lock_time: LockTime) -> Result<WireMessage, Status> {
        let keys = self.keys()?;
        let funding = self.require_funding()?;
        self.require_idle()?;
        if self.refund.is_some() {
            return Err(invalid_proposal("refund already exchanged"));
        }
        if lock_time == LockTime::ZERO {
            return Err(invalid_proposal("refund must be time locked"));
        }
        let mut tx = Transaction {
            version: Version::ONE,
            lock_time,
            input: vec![funding.to_txin(Sequence::ENABLE_LOCKTIME_NO_RBF)],
            output: vec![TxOut { value: Amount::ZERO, script_pubkey: p2pkh_script_pubkey(&keys.pubkey) }],
        };
        let fee_sat = self.channel_fee(&tx);
        let refund_sat = funding
            .amount_sat()
            .checked_sub(fee_sat)
            .filter(|v| *v >= self.policy.dust_limit_sat)
            .ok_or_else(|| amount_mismatch(format!("funding cannot cover refund fee {}", fee_sat)))?;
        tx.output[0].value = Amount::from_sat(refund_sat);
        self.make_message(MessageKind::Refund, tx, None)
    }

    /// Build the unsigned payment moving `paid_total_sat` in total to the payee.
    ///
    /// The change output is left out when nothing remains.
    #[instrument(skip(self))]
    pub fn build_payment_tx(&mut self, paid_total_sat: u64) -> Result<WireMessage, Status> {
        let keys = self.keys()?;
        let funding = self.require_funding()?;
        self.require_idle()?;
        if self.refund.is_none() {
            return Err(invalid_proposal("refund must be exchanged before paying"));
        }
        if paid_total_sat <= self.paid_sat {
            return Err(amount_mismatch(format!(
                "payment total {} does not exceed {}",
                paid_total_sat, self.paid_sat
            )));
        }
        if paid_total_sat < self.policy.dust_limit_sat {
            return Err(amount_mismatch(format!("payment {} below dust limit", paid_total_sat)));
        }
        let mut tx = Transaction {
            version: Version::ONE,
            lock_time: LockTime::ZERO,
            input: vec![funding.to_txin(Sequence::MAX)],
            output: vec![
                TxOut {
                    value: Amount::from_sat(paid_total_sat),
                    script_pubkey: self.counterparty_address.script_pubkey(),
                },
                TxOut { value: Amount::ZERO, script_pubkey: p2pkh_script_pubkey(&keys.pubkey) },
            ],
        };
        let fee_sat = self.channel_fee(&tx);
        let change_sat = funding
            .amount_sat()
            .checked_sub(paid_total_sat)
            .and_then(|v| v.checked_sub(fee_sat))
            .ok_or_else(|| {
                amount_mismatch(format!(
                    "funding {} cannot cover {} plus fee {}",
                    funding.amount_sat(),
                    paid_total_sat,
                    fee_sat
                ))
            })?;
        if change_sat == 0 {
            tx.output.truncate(1);
        } else if change_sat < self.policy.dust_limit_sat {
            return Err(amount_mismatch(format!("change {} below dust limit", change_sat)));
        } else {
            tx.output[1].value = Amount::from_sat(change_sat);
        }
        self.make_message(MessageKind::Payment, tx, Some(paid_total_sat))
    }

    /// Drop the pending exchange, leaving the last fully-signed state in place
    pub fn abort_pending(&mut self) {
        if let Some(p) = self.pending.take() {
            warn!("abandoning {:?} {}", p.message.kind, p.message.sequence);
        }
    }

    /// Complete the pending exchange with the recipient's countersigned message
    #[instrument(skip(self, message), fields(sequence = message.sequence))]
    pub fn finalize(&mut self, message: WireMessage) -> Result<PaymentTransaction, Status> {
        let keys = self.keys()?;
        let funding = self.require_funding()?;
        let pending = self.pending.as_ref().ok_or_else(|| invalid_proposal("nothing pending"))?;
        check_version(message.version)?;
        check_channel_id(&message.channel_id, &pending.message.channel_id)?;
        if message.kind != pending.message.kind || message.sequence != pending.message.sequence {
            return Err(invalid_proposal(format!(
                "reply {:?} {} does not answer {:?} {}",
                message.kind, message.sequence, pending.message.kind, pending.message.sequence
            )));
        }
        if message.signer != self.counterparty_multisig_pubkey
            || message.state
                != (SignatureState::PartiallySigned { by: self.counterparty_multisig_pubkey })
        {
            return Err(signature_mismatch(format!(
                "reply not signed by the recipient: {:?}",
                message.state
            )));
        }
        funding.check_sole_input(&message.tx)?;
        if !same_unsigned(&message.tx, &pending.message.tx) {
            return Err(invalid_proposal("reply transaction differs from the proposal"));
        }

        let multisig = &keys.multisig;
        let mut sigs = multisig
            .parse_script_sig(&message.tx.input[0].script_sig)
            .map_err(|err| signature_mismatch(format!("reply scriptSig: {:?}", err.kind)))?;
        let theirs = multisig
            .position(&self.counterparty_multisig_pubkey)
            .and_then(|pos| sigs[pos])
            .ok_or_else(|| signature_mismatch("recipient signature missing"))?;
        let mut tx = message.tx;
        verify_legacy_input(
            &self.secp_ctx,
            &tx,
            0,
            multisig.redeem_script(),
            &theirs,
            &self.counterparty_multisig_pubkey,
        )?;
        let ours = sign_legacy_input(&self.secp_ctx, &tx, 0, multisig.redeem_script(), &self.multisig_key)?;
        multisig.add_signature(&mut sigs, &keys.multisig_pubkey, ours)?;
        tx.input[0].script_sig = multisig.script_sig(&sigs)?;

        let signed = PaymentTransaction::new(message.sequence, tx, SignatureState::FullySigned);
        let paid_sat = pending.paid_sat;
        match paid_sat {
            None => {
                info!("refund {} fully signed", signed.sequence);
                self.refund = Some(signed.clone());
                self.state = SenderState::RefundExchanged;
            }
            Some(paid_sat) => {
                info!("payment {} of {} sat fully signed", signed.sequence, paid_sat);
                self.paid_sat = paid_sat;
                self.latest_payment = Some(signed.clone());
                self.state = SenderState::PaymentExchanged(signed.sequence);
            }
        }
        self.pending = None;
        trace_channel_state!(self);
        Ok(signed)
    }

    /// Send the pending message to the recipient and finalize its reply.
    ///
    /// If this future is dropped, or the exchange fails, the pending message is abandoned.
    pub async fn exchange(
        &mut self,
        counterparty: &dyn Counterparty,
    ) -> Result<PaymentTransaction, Status> {
        let message = self
            .pending_message()
            .cloned()
            .ok_or_else(|| invalid_proposal("nothing pending"))?;
        let mut sender = scopeguard::guard(self, |sender| {
            if sender.pending.is_some() {
                sender.abort_pending();
            }
        });
        let reply = counterparty.countersign(message).await?;
        sender.finalize(reply)
    }
}

impl fmt::Debug for Sender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sender")
            .field("state", &self.state)
            .field("funding_key", &Redacted)
            .field("multisig_key", &Redacted)
            .field("counterparty_multisig_pubkey", &self.counterparty_multisig_pubkey)
            .field("channel_id", &self.keys.as_ref().map(|k| k.multisig.address().to_string()))
            .field("funding", &self.funding)
            .field("balance_sat", &self.balance_sat)
            .field("paid_sat", &self.paid_sat)
            .field("next_sequence", &self.next_sequence)
            .field("pending", &self.pending.as_ref().map(|p| (p.message.kind, p.message.sequence)))
            .finish()
    }
}
