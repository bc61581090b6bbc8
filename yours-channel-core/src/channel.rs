use crate::prelude::*;
use core::fmt;

use bitcoin::bip32::{Xpriv, Xpub};
use bitcoin::hashes::{hash160, Hash};
use bitcoin::secp256k1::rand::RngCore;
use bitcoin::secp256k1::{self, Secp256k1};
use bitcoin::Network;
use tracing::*;

use crate::policy::simple_validator::{SimplePolicy, SimpleValidator};
use crate::policy::validator::Validator;
use crate::signer::derive::{ChannelIdentity, ChannelPath};
use crate::tx::multisig::{MultisigContext, MultisigSignatures};
use crate::tx::tx::{
    build_commitment_tx, commitment_fee, CommitmentKeys, CommitmentOutputs, CommitmentTerms,
    CommitmentTransaction, FundingReference, HtlcPair, RevocationPair, SignatureState,
};
use crate::util::crypto_utils::secret_hash;
use crate::util::debug_utils::{DebugBytes, DebugVecTxOut, Redacted};
use crate::util::status::{
    amount_mismatch, invalid_path, invalid_proposal, not_initialized, revocation_pending,
    signature_mismatch, unexpected_input, update_in_progress, Code, Status,
};
use crate::util::transaction_utils::{same_unsigned, sign_legacy_input, verify_legacy_input};
use crate::wire::{check_channel_id, check_version, Counterparty, MessageKind, RevocationMessage, WireMessage, WIRE_VERSION};
use crate::Arc;

/// Balances both parties signed, from one party's point of view
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChannelBalance {
    /// The commitment these balances come from, `None` before any commitment
    pub sequence: Option<u64>,
    /// This party's balance, including the fee if it funded the channel
    pub holder_sat: u64,
    /// The counterparty's balance, including the fee if it funded the channel
    pub counterparty_sat: u64,
}

impl ChannelBalance {
    /// The opening balance: everything belongs to the funder
    pub fn opening(funding_amount_sat: u64, is_funder: bool) -> Self {
        if is_funder {
            ChannelBalance { sequence: None, holder_sat: funding_amount_sat, counterparty_sat: 0 }
        } else {
            ChannelBalance { sequence: None, holder_sat: 0, counterparty_sat: funding_amount_sat }
        }
    }
}

/// Progress of the current update cycle
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelState {
    /// Keys not yet derived
    Uninitialized,
    /// Keys derived
    Initialized,
    /// Multisig address built
    MultisigReady,
    /// Own commitment proposed, awaiting the counterparty signature
    CommitmentProposed(u64),
    /// Own commitment fully signed
    CommitmentCountersigned(u64),
    /// The predecessor of the given fully-signed commitment was revoked
    Superseded(u64),
}

#[derive(Clone)]
struct OwnCommitment {
    terms: CommitmentTerms,
    revocation: RevocationPair,
}

struct PendingCommitment {
    message: WireMessage,
    commitment: OwnCommitment,
}

struct LatestCommitment {
    tx: CommitmentTransaction,
    commitment: OwnCommitment,
}

// Any failure while checking a counterparty proposal is reported as an invalid proposal
fn reject(status: Status) -> Status {
    if status.code() == Code::InvalidProposal {
        status
    } else {
        invalid_proposal(format!("{:?}: {}", status.code(), status.message()))
    }
}

/// One party of a bidirectional channel.
///
/// Each party proposes its own commitment transactions: output 0 is a revocable HTLC
/// paying the proposer, output 1 an HTLC paying the counterparty.  The counterparty
/// countersigns after validation, and the proposer discloses the revocation secret of
/// its previous commitment before building the next one.
pub struct Channel {
    secp_ctx: Secp256k1<secp256k1::All>,
    funding_amount_sat: u64,
    is_funder: bool,
    root: Xpriv,
    counterparty_root: Xpub,
    policy: SimplePolicy,
    validator: Arc<dyn Validator>,
    state: ChannelState,
    path: Option<ChannelPath>,
    identity: Option<ChannelIdentity>,
    multisig: Option<MultisigContext>,
    funding: Option<FundingReference>,
    htlc: Option<HtlcPair>,
    // hashes of every secret generated here
    own_secret_hashes: UnorderedSet<hash160::Hash>,
    last_proposed: Option<u64>,
    pending: Option<PendingCommitment>,
    latest: Option<LatestCommitment>,
    awaiting_revocation: Option<(u64, RevocationPair)>,
    // proposals dropped before they were fully signed
    abandoned: OrderedMap<u64, RevocationPair>,
    disclosed: OrderedMap<u64, [u8; 32]>,
    agreed: ChannelBalance,
    // counterparty commitments we countersigned, by sequence, with their revocation hash
    countersigned: OrderedMap<u64, hash160::Hash>,
    seen_revocation_hashes: UnorderedSet<hash160::Hash>,
    counterparty_secrets: OrderedMap<u64, [u8; 32]>,
}

impl Channel {
    /// A channel over `funding_amount_sat`, funded by this party if `is_funder`
    pub fn new(
        funding_amount_sat: u64,
        is_funder: bool,
        root: Xpriv,
        counterparty_root: Xpub,
        policy: SimplePolicy,
    ) -> Self {
        let validator = Arc::new(SimpleValidator::new(policy.clone()));
        Self::new_with_validator(funding_amount_sat, is_funder, root, counterparty_root, policy, validator)
    }

    /// A channel enforcing a custom acceptance policy
    pub fn new_with_validator(
        funding_amount_sat: u64,
        is_funder: bool,
        root: Xpriv,
        counterparty_root: Xpub,
        policy: SimplePolicy,
        validator: Arc<dyn Validator>,
    ) -> Self {
        Channel {
            secp_ctx: Secp256k1::new(),
            funding_amount_sat,
            is_funder,
            root,
            counterparty_root,
            policy,
            validator,
            state: ChannelState::Uninitialized,
            path: None,
            identity: None,
            multisig: None,
            funding: None,
            htlc: None,
            own_secret_hashes: UnorderedSet::new(),
            last_proposed: None,
            pending: None,
            latest: None,
            awaiting_revocation: None,
            abandoned: OrderedMap::new(),
            disclosed: OrderedMap::new(),
            agreed: ChannelBalance::opening(funding_amount_sat, is_funder),
            countersigned: OrderedMap::new(),
            seen_revocation_hashes: UnorderedSet::new(),
            counterparty_secrets: OrderedMap::new(),
        }
    }

    /// Fix the derivation path, which both parties must agree on.  Only allowed before
    /// initialization.
    pub fn set_path(&mut self, path: ChannelPath) -> Result<(), Status> {
        if self.identity.is_some() {
            return Err(invalid_path(format!("path is already fixed at {}", self.path_string())));
        }
        self.path = Some(path);
        Ok(())
    }

    fn path_string(&self) -> String {
        self.path.map(|p| p.to_string()).unwrap_or_default()
    }

    /// Derive the channel keys, drawing a random path if none was set
    #[cfg(feature = "std")]
    pub fn initialize(&mut self) -> Result<(), Status> {
        self.initialize_with_rng(&mut bitcoin::secp256k1::rand::thread_rng())
    }

    /// Derive the channel keys, drawing a random path from `rng` if none was set
    pub fn initialize_with_rng<R: RngCore>(&mut self, rng: &mut R) -> Result<(), Status> {
        if self.identity.is_some() {
            return Ok(());
        }
        self.policy.check_delays()?;
        self.validator.validate_funding_amount(self.funding_amount_sat)?;
        let path = self.path.unwrap_or_else(|| ChannelPath::random(rng));
        let identity =
            ChannelIdentity::derive(&self.secp_ctx, self.root, &self.counterparty_root, path)?;
        let multisig = Self::make_multisig(&identity, self.policy.network)?;
        info!("channel keys derived at {}", path);
        self.path = Some(path);
        self.identity = Some(identity);
        self.state = ChannelState::Initialized;
        self.multisig = Some(multisig);
        self.build_multisig_address()?;
        Ok(())
    }

    fn make_multisig(identity: &ChannelIdentity, network: Network) -> Result<MultisigContext, Status> {
        MultisigContext::new(
            identity.channel_key().public_key(),
            *identity.counterparty_channel_pubkey(),
            network,
        )
    }

    /// Whether [`Channel::initialize`] completed
    pub fn is_initialized(&self) -> bool {
        self.identity.is_some()
    }

    /// Protocol progress
    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// The derivation path, once fixed
    pub fn path(&self) -> Option<&ChannelPath> {
        self.path.as_ref()
    }

    /// Whether this party funded the channel and pays the fees
    pub fn is_funder(&self) -> bool {
        self.is_funder
    }

    /// The channel amount
    pub fn funding_amount_sat(&self) -> u64 {
        self.funding_amount_sat
    }

    fn identity(&self) -> Result<&ChannelIdentity, Status> {
        self.identity.as_ref().ok_or_else(|| not_initialized("channel is not initialized"))
    }

    fn multisig(&self) -> Result<&MultisigContext, Status> {
        self.multisig.as_ref().ok_or_else(|| not_initialized("channel is not initialized"))
    }

    fn require_funding(&self) -> Result<&FundingReference, Status> {
        self.funding.as_ref().ok_or_else(|| not_initialized("channel funding not set"))
    }

    /// Build the multisig address of the two channel keys.  Repeated calls return the same
    /// address.
    pub fn build_multisig_address(&mut self) -> Result<String, Status> {
        let multisig = match &self.multisig {
            Some(multisig) => multisig.clone(),
            None => Self::make_multisig(self.identity()?, self.policy.network)?,
        };
        let address = multisig.address().to_string();
        if self.state == ChannelState::Initialized {
            info!("channel {} at {}", address, self.path_string());
            self.state = ChannelState::MultisigReady;
            trace_channel_state!(self);
        }
        self.multisig = Some(multisig);
        Ok(address)
    }

    /// The channel id, which is the multisig address
    pub fn get_id(&self) -> Result<String, Status> {
        Ok(self.multisig()?.address().to_string())
    }

    /// The funding multisig
    pub fn multisig_context(&self) -> Result<&MultisigContext, Status> {
        self.multisig()
    }

    /// Capture the output that funds the channel.  It must pay the channel amount to the
    /// multisig, and cannot be replaced once set.
    pub fn set_funding(&mut self, funding: FundingReference) -> Result<(), Status> {
        let multisig = self.multisig()?;
        if let Some(existing) = &self.funding {
            if *existing == funding {
                return Ok(());
            }
            return Err(unexpected_input(format!("channel already funded by {}", existing.outpoint)));
        }
        if funding.txout.script_pubkey != multisig.script_pubkey() {
            return Err(unexpected_input(format!(
                "{} does not pay {}",
                funding.outpoint,
                multisig.address()
            )));
        }
        if funding.amount_sat() != self.funding_amount_sat {
            return Err(amount_mismatch(format!(
                "funding output has {} sat, channel is {}",
                funding.amount_sat(),
                self.funding_amount_sat
            )));
        }
        info!("channel funded by {}", funding.outpoint);
        self.funding = Some(funding);
        Ok(())
    }

    /// The funding reference
    pub fn funding(&self) -> Option<&FundingReference> {
        self.funding.as_ref()
    }

    /// Generate a fresh HTLC secret for receiving a payment, replacing the current one.
    /// Returns the hash for the counterparty to embed in its next commitment.
    pub fn new_htlc_pair<R: RngCore>(&mut self, rng: &mut R) -> hash160::Hash {
        let htlc = HtlcPair::new(rng);
        let hash = htlc.hash();
        self.own_secret_hashes.insert(hash);
        debug!("new htlc hash {}", hash);
        self.htlc = Some(htlc);
        hash
    }

    /// The current HTLC hash
    pub fn htlc_hash(&self) -> Option<hash160::Hash> {
        self.htlc.as_ref().map(|h| h.hash())
    }

    /// The current HTLC secret, disclosed to settle a payment
    pub fn htlc_secret(&self) -> Option<[u8; 32]> {
        self.htlc.as_ref().map(|h| *h.secret())
    }

    /// Balances of the latest state both parties signed
    pub fn agreed_balance(&self) -> &ChannelBalance {
        &self.agreed
    }

    fn own_commitment_keys(&self) -> Result<CommitmentKeys, Status> {
        let identity = self.identity()?;
        Ok(CommitmentKeys {
            owner_payment_pubkey: identity.payment_key().public_key(),
            counterparty_payment_pubkey: *identity.counterparty_payment_pubkey(),
        })
    }

    fn counterparty_commitment_keys(&self) -> Result<CommitmentKeys, Status> {
        let identity = self.identity()?;
        Ok(CommitmentKeys {
            owner_payment_pubkey: *identity.counterparty_payment_pubkey(),
            counterparty_payment_pubkey: identity.payment_key().public_key(),
        })
    }

    /// Propose own commitment `sequence`, giving the counterparty
    /// `outputs.counterparty_balance_sat`.
    ///
    /// The sequence must exceed every sequence proposed before, including abandoned
    /// attempts.  A fresh revocation secret is generated for the new state.
    #[instrument(skip(self, rng))]
    pub fn propose_commitment<R: RngCore>(
        &mut self,
        sequence: u64,
        outputs: CommitmentOutputs,
        rng: &mut R,
    ) -> Result<WireMessage, Status> {
        let identity = self.identity()?;
        let funding = self.require_funding()?;
        if let Some(pending) = &self.pending {
            return Err(update_in_progress(format!(
                "commitment {} awaiting signature",
                pending.message.sequence
            )));
        }
        if let Some((revocable, _)) = &self.awaiting_revocation {
            return Err(revocation_pending(format!("commitment {} is not yet revoked", revocable)));
        }
        if let Some(last) = self.last_proposed {
            if sequence <= last {
                return Err(invalid_proposal(format!(
                    "sequence {} does not exceed {}",
                    sequence, last
                )));
            }
        }
        self.policy.check_delays()?;

        let keys = self.own_commitment_keys()?;
        let fee_sat = commitment_fee(
            funding,
            &keys,
            self.policy.htlc_delay,
            self.policy.refund_delay,
            self.policy.fee_per_kb_sat,
        );
        let (owner_fee, counterparty_fee) = if self.is_funder { (fee_sat, 0) } else { (0, fee_sat) };
        let to_counterparty_sat = outputs.counterparty_balance_sat.checked_sub(counterparty_fee);
        let to_owner_sat = funding
            .amount_sat()
            .checked_sub(outputs.counterparty_balance_sat)
            .and_then(|v| v.checked_sub(owner_fee));
        let (to_owner_sat, to_counterparty_sat) = match (to_owner_sat, to_counterparty_sat) {
            (Some(o), Some(c)) => (o, c),
            _ =>
                return Err(amount_mismatch(format!(
                    "counterparty balance {} with fee {} does not fit funding {}",
                    outputs.counterparty_balance_sat,
                    fee_sat,
                    funding.amount_sat()
                ))),
        };

        let revocation = RevocationPair::new(rng);
        let terms = CommitmentTerms {
            sequence,
            to_owner_sat,
            to_counterparty_sat,
            fee_sat,
            revocation_hash: revocation.hash().to_byte_array(),
            htlc_hash: outputs.htlc_hash.to_byte_array(),
            htlc_delay: self.policy.htlc_delay,
            refund_delay: self.policy.refund_delay,
        };
        let tx = build_commitment_tx(funding, &terms, &keys)?;
        let message = WireMessage {
            version: WIRE_VERSION,
            kind: MessageKind::Commitment,
            channel_id: self.get_id()?,
            sequence,
            state: SignatureState::Unsigned,
            signer: identity.channel_key().public_key(),
            tx,
            terms: Some(terms.clone()),
        };
        debug!(
            "proposing commitment {} revocation hash {:?}: {:?}",
            sequence,
            DebugBytes(&terms.revocation_hash),
            DebugVecTxOut(&message.tx.output)
        );

        // Only advance the state once the proposal is complete.
        self.own_secret_hashes.insert(revocation.hash());
        self.last_proposed = Some(sequence);
        self.pending = Some(PendingCommitment {
            message: message.clone(),
            commitment: OwnCommitment { terms, revocation },
        });
        self.state = ChannelState::CommitmentProposed(sequence);
        trace_channel_state!(self);
        Ok(message)
    }

    /// Validate a counterparty commitment and sign it with the multisig key
    #[instrument(skip(self, message), fields(sequence = message.sequence))]
    pub fn accept_and_countersign(&mut self, message: WireMessage) -> Result<WireMessage, Status> {
        let identity = self.identity()?;
        let multisig = self.multisig()?;
        let funding = self.require_funding()?;
        let own_pubkey = identity.channel_key().public_key();

        message
            .check_envelope(
                MessageKind::Commitment,
                &multisig.address().to_string(),
                identity.counterparty_channel_pubkey(),
            )
            .map_err(reject)?;
        if message.state != SignatureState::Unsigned {
            return Err(invalid_proposal(format!("expected unsigned commitment, saw {:?}", message.state)));
        }
        let terms = message
            .terms
            .as_ref()
            .ok_or_else(|| invalid_proposal("commitment without terms"))?;
        if terms.sequence != message.sequence {
            return Err(invalid_proposal(format!(
                "terms for {} in message {}",
                terms.sequence, message.sequence
            )));
        }

        // (a) the funding reference
        funding.check_sole_input(&message.tx).map_err(reject)?;

        let sequence = message.sequence;
        if let Some((&last, _)) = self.countersigned.last_key_value() {
            if sequence <= last {
                return Err(invalid_proposal(format!(
                    "sequence {} does not exceed countersigned {}",
                    sequence, last
                )));
            }
        }
        // the proposer may hold at most one unrevoked commitment
        let unrevoked: Vec<u64> = self
            .countersigned
            .keys()
            .filter(|s| !self.counterparty_secrets.contains_key(*s))
            .copied()
            .collect();
        if unrevoked.len() > 1 {
            return Err(invalid_proposal(format!(
                "counterparty commitments {:?} are not revoked",
                unrevoked
            )));
        }

        // (c) fresh revocation hash, and our current HTLC hash
        let own_htlc_hash =
            self.htlc_hash().ok_or_else(|| invalid_proposal("no htlc hash was offered"))?;
        if terms.htlc_hash() != own_htlc_hash {
            return Err(invalid_proposal(format!(
                "htlc hash {} is not ours {}",
                terms.htlc_hash(),
                own_htlc_hash
            )));
        }
        self.validator.validate_revocation_hash(
            &terms.revocation_hash(),
            &terms.htlc_hash(),
            &self.seen_revocation_hashes,
            &self.own_secret_hashes,
        )?;

        // (b) amounts against the agreed state, and the exact templates
        let keys = self.counterparty_commitment_keys()?;
        let expected_fee_sat = commitment_fee(
            funding,
            &keys,
            terms.htlc_delay,
            terms.refund_delay,
            self.policy.fee_per_kb_sat,
        );
        self.validator
            .validate_commitment_proposal(
                funding.amount_sat(),
                terms,
                expected_fee_sat,
                self.is_funder,
                &self.agreed,
            )
            .map_err(|ve| {
                #[cfg(not(feature = "log_pretty_print"))]
                warn!("VALIDATION FAILED: {} terms={:?} agreed={:?}", ve, terms, &self.agreed);
                #[cfg(feature = "log_pretty_print")]
                warn!("VALIDATION FAILED: {}\nterms={:#?}\nagreed={:#?}", ve, terms, &self.agreed);
                ve
            })?;
        let mut tx = build_commitment_tx(funding, terms, &keys).map_err(reject)?;
        if !same_unsigned(&tx, &message.tx) {
            return Err(invalid_proposal("commitment does not match its terms"));
        }

        let sig = sign_legacy_input(
            &self.secp_ctx,
            &tx,
            0,
            multisig.redeem_script(),
            identity.channel_key().secret_key(),
        )?;
        let mut sigs: MultisigSignatures = [None, None];
        multisig.add_signature(&mut sigs, &own_pubkey, sig)?;
        tx.input[0].script_sig = multisig.script_sig(&sigs)?;

        let revocation_hash = terms.revocation_hash();
        let (counterparty_sat, holder_sat) = terms.balances(!self.is_funder);
        let terms = terms.clone();
        let reply = WireMessage {
            version: WIRE_VERSION,
            kind: MessageKind::Commitment,
            channel_id: message.channel_id,
            sequence,
            state: SignatureState::PartiallySigned { by: own_pubkey },
            signer: own_pubkey,
            tx,
            terms: Some(terms),
        };

        // Only advance the state if nothing goes wrong.
        self.countersigned.insert(sequence, revocation_hash);
        self.seen_revocation_hashes.insert(revocation_hash);
        if self.agreed.sequence.map_or(true, |agreed| sequence > agreed) {
            self.agreed = ChannelBalance { sequence: Some(sequence), holder_sat, counterparty_sat };
        }
        info!("countersigned counterparty commitment {}", sequence);
        trace_channel_state!(self);
        Ok(reply)
    }

    /// Complete the pending proposal with the counterparty's signature
    #[instrument(skip(self, message), fields(sequence = message.sequence))]
    pub fn finalize_commitment(&mut self, message: WireMessage) -> Result<CommitmentTransaction, Status> {
        let identity = self.identity()?;
        let multisig = self.multisig()?;
        let pending = self.pending.as_ref().ok_or_else(|| invalid_proposal("no commitment pending"))?;
        let counterparty_pubkey = *identity.counterparty_channel_pubkey();
        check_version(message.version)?;
        check_channel_id(&message.channel_id, &pending.message.channel_id)?;
        if message.kind != MessageKind::Commitment || message.sequence != pending.message.sequence {
            return Err(invalid_proposal(format!(
                "reply {:?} {} does not answer commitment {}",
                message.kind, message.sequence, pending.message.sequence
            )));
        }
        if !same_unsigned(&message.tx, &pending.message.tx) {
            return Err(invalid_proposal("reply differs from the proposed commitment"));
        }
        if message.signer != counterparty_pubkey
            || message.state != (SignatureState::PartiallySigned { by: counterparty_pubkey })
        {
            return Err(signature_mismatch(format!(
                "reply not signed by the counterparty: {:?}",
                message.state
            )));
        }

        let mut sigs = multisig
            .parse_script_sig(&message.tx.input[0].script_sig)
            .map_err(|err| signature_mismatch(format!("reply scriptSig: {:?}", err.kind)))?;
        let theirs = multisig
            .position(&counterparty_pubkey)
            .and_then(|pos| sigs[pos])
            .ok_or_else(|| signature_mismatch("counterparty signature missing"))?;
        let mut tx = message.tx;
        verify_legacy_input(&self.secp_ctx, &tx, 0, multisig.redeem_script(), &theirs, &counterparty_pubkey)?;
        let ours = sign_legacy_input(
            &self.secp_ctx,
            &tx,
            0,
            multisig.redeem_script(),
            identity.channel_key().secret_key(),
        )?;
        multisig.add_signature(&mut sigs, &identity.channel_key().public_key(), ours)?;
        tx.input[0].script_sig = multisig.script_sig(&sigs)?;

        let sequence = message.sequence;
        let signed = CommitmentTransaction::new(sequence, tx, SignatureState::FullySigned);
        let (holder_sat, counterparty_sat) = pending.commitment.terms.balances(self.is_funder);
        let pending = match self.pending.take() {
            Some(pending) => pending,
            None => return Err(invalid_proposal("no commitment pending")),
        };
        if let Some(previous) = self.latest.take() {
            self.awaiting_revocation = Some((previous.tx.sequence, previous.commitment.revocation));
        }
        self.latest = Some(LatestCommitment { tx: signed.clone(), commitment: pending.commitment });
        if self.agreed.sequence.map_or(true, |agreed| sequence >= agreed) {
            self.agreed = ChannelBalance { sequence: Some(sequence), holder_sat, counterparty_sat };
        }
        self.state = ChannelState::CommitmentCountersigned(sequence);
        info!("commitment {} fully signed", sequence);
        trace_channel_state!(self);
        Ok(signed)
    }

    /// Drop the pending proposal, leaving the last fully-signed commitment in place.
    /// Its sequence is not reused.
    ///
    /// The counterparty may already have countersigned it, so its revocation secret is
    /// kept for [`Channel::revoke_abandoned`].
    pub fn abort_pending(&mut self) {
        if let Some(pending) = self.pending.take() {
            let sequence = pending.message.sequence;
            warn!("abandoning commitment {}", sequence);
            self.abandoned.insert(sequence, pending.commitment.revocation);
            self.state = match &self.latest {
                Some(latest) => ChannelState::CommitmentCountersigned(latest.tx.sequence),
                None => ChannelState::MultisigReady,
            };
        }
    }

    /// Disclose the revocation secrets of every abandoned proposal
    pub fn revoke_abandoned(&mut self) -> Result<Vec<RevocationMessage>, Status> {
        let channel_id = self.get_id()?;
        let abandoned = core::mem::take(&mut self.abandoned);
        Ok(abandoned
            .into_iter()
            .map(|(sequence, revocation)| {
                let secret = *revocation.secret();
                self.disclosed.insert(sequence, secret);
                debug!("revoked abandoned commitment {}", sequence);
                RevocationMessage { version: WIRE_VERSION, channel_id: channel_id.clone(), sequence, secret }
            })
            .collect())
    }

    /// Disclose the revocation secret of the commitment superseded by the latest
    /// fully-signed one.  This cannot be undone.
    pub fn revoke_previous(&mut self) -> Result<RevocationMessage, Status> {
        let channel_id = self.get_id()?;
        let (sequence, revocation) = self
            .awaiting_revocation
            .take()
            .ok_or_else(|| invalid_proposal("no commitment awaiting revocation"))?;
        let secret = *revocation.secret();
        self.disclosed.insert(sequence, secret);
        if let Some(latest) = &self.latest {
            self.state = ChannelState::Superseded(latest.tx.sequence);
        }
        info!("revoked commitment {}", sequence);
        Ok(RevocationMessage { version: WIRE_VERSION, channel_id, sequence, secret })
    }

    /// A revocation already disclosed, for resending
    pub fn disclosed_revocation(&self, sequence: u64) -> Option<RevocationMessage> {
        let channel_id = self.get_id().ok()?;
        self.disclosed.get(&sequence).map(|secret| RevocationMessage {
            version: WIRE_VERSION,
            channel_id,
            sequence,
            secret: *secret,
        })
    }

    /// Record a counterparty revocation secret
    pub fn receive_revocation(&mut self, message: RevocationMessage) -> Result<(), Status> {
        check_version(message.version)?;
        check_channel_id(&message.channel_id, &self.get_id()?)?;
        let expected = self.countersigned.get(&message.sequence).ok_or_else(|| {
            invalid_proposal(format!("no countersigned commitment {}", message.sequence))
        })?;
        if secret_hash(&message.secret) != *expected {
            return Err(invalid_proposal(format!(
                "secret does not match revocation hash {} of commitment {}",
                expected, message.sequence
            )));
        }
        info!("counterparty revoked commitment {}", message.sequence);
        self.counterparty_secrets.insert(message.sequence, message.secret);
        Ok(())
    }

    /// A revocation secret disclosed by the counterparty, for the penalty branch of its
    /// revoked commitment
    pub fn revocation_secret_for(&self, sequence: u64) -> Option<[u8; 32]> {
        self.counterparty_secrets.get(&sequence).copied()
    }

    /// The latest commitment, which is always fully signed
    pub fn latest_commitment(&self) -> Option<&CommitmentTransaction> {
        self.latest.as_ref().map(|l| &l.tx)
    }

    /// Terms of the latest fully-signed commitment
    pub fn latest_terms(&self) -> Option<&CommitmentTerms> {
        self.latest.as_ref().map(|l| &l.commitment.terms)
    }

    /// The proposal awaiting the counterparty signature
    pub fn pending_commitment(&self) -> Option<&WireMessage> {
        self.pending.as_ref().map(|p| &p.message)
    }

    /// Run a full update: propose, have the counterparty countersign, finalize.
    ///
    /// If this future is dropped, or any step fails, the proposal is abandoned and the
    /// last fully-signed commitment stays in place.
    pub async fn update<R: RngCore>(
        &mut self,
        sequence: u64,
        outputs: CommitmentOutputs,
        rng: &mut R,
        counterparty: &dyn Counterparty,
    ) -> Result<CommitmentTransaction, Status> {
        let message = self.propose_commitment(sequence, outputs, rng)?;
        let mut channel = scopeguard::guard(self, |channel| {
            if channel.pending.is_some() {
                channel.abort_pending();
            }
        });
        let reply = counterparty.countersign(message).await?;
        channel.finalize_commitment(reply)
    }

    /// Revoke the superseded commitment and deliver the secret
    pub async fn revoke(&mut self, counterparty: &dyn Counterparty) -> Result<RevocationMessage, Status> {
        let message = self.revoke_previous()?;
        counterparty.revoke(message.clone()).await?;
        Ok(message)
    }

    /// Revoke abandoned proposals and deliver the secrets.  Returns how many the
    /// counterparty recognized; it rejects those it never countersigned.
    pub async fn revoke_abandoned_with(&mut self, counterparty: &dyn Counterparty) -> Result<usize, Status> {
        let mut delivered = 0;
        for message in self.revoke_abandoned()? {
            let sequence = message.sequence;
            match counterparty.revoke(message).await {
                Ok(()) => delivered += 1,
                Err(err) => debug!("abandoned commitment {} not known to peer: {}", sequence, err),
            }
        }
        Ok(delivered)
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("state", &self.state)
            .field("funding_amount_sat", &self.funding_amount_sat)
            .field("is_funder", &self.is_funder)
            .field("root", &Redacted)
            .field("path", &self.path)
            .field("identity", &self.identity)
            .field("channel_id", &self.multisig.as_ref().map(|m| m.address().to_string()))
            .field("funding", &self.funding)
            .field("htlc", &self.htlc)
            .field("last_proposed", &self.last_proposed)
            .field("pending", &self.pending.as_ref().map(|p| p.message.sequence))
            .field("latest", &self.latest.as_ref().map(|l| l.tx.sequence))
            .field("awaiting_revocation", &self.awaiting_revocation)
            .field("abandoned", &self.abandoned.keys().collect::<Vec<_>>())
            .field("agreed", &self.agreed)
            .field("countersigned", &self.countersigned)
            .field("counterparty_revoked", &self.counterparty_secrets.keys().collect::<Vec<_>>())
            .finish()
    }
}
