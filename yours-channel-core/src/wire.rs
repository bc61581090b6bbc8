//! The versioned envelope in which the two parties hand each other transactions,
//! and the async seam the handshake drivers talk through.

use crate::prelude::*;

use async_trait::async_trait;
use bitcoin::secp256k1::PublicKey;
use bitcoin::Transaction;
use serde_derive::{Deserialize, Serialize};
use serde_with::{hex::Hex, serde_as};

use crate::tx::tx::{CommitmentTerms, SignatureState};
use crate::util::ser_util::TransactionHandler;
use crate::util::status::{invalid_proposal, Status};

/// The only envelope version understood
pub const WIRE_VERSION: u8 = 1;

/// What a message carries
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// A refund of the unidirectional channel
    Refund,
    /// A payment of the unidirectional channel
    Payment,
    /// A commitment of the bidirectional channel
    Commitment,
}

/// A transaction in flight between the two parties
#[serde_as]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    /// Envelope version, [`WIRE_VERSION`]
    pub version: u8,
    /// What the transaction is
    pub kind: MessageKind,
    /// The multisig address of the channel
    pub channel_id: String,
    /// Position in the update sequence
    pub sequence: u64,
    /// Signing progress of `tx`
    pub state: SignatureState,
    /// Multisig key of the party that sent this message
    pub signer: PublicKey,
    /// The transaction, consensus encoded
    #[serde_as(as = "TransactionHandler")]
    pub tx: Transaction,
    /// Commitment terms, for commitments only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terms: Option<CommitmentTerms>,
}

impl WireMessage {
    /// Encode as JSON
    pub fn to_json(&self) -> Result<String, Status> {
        serde_json::to_string(self)
            .map_err(|err| invalid_proposal(format!("encode message: {}", err)))
    }

    /// Decode from JSON
    pub fn from_json(json: &str) -> Result<Self, Status> {
        serde_json::from_str(json).map_err(|err| invalid_proposal(format!("decode message: {}", err)))
    }

    /// Common envelope checks a receiver runs before looking at the transaction
    pub fn check_envelope(
        &self,
        kind: MessageKind,
        channel_id: &str,
        signer: &PublicKey,
    ) -> Result<(), Status> {
        check_version(self.version)?;
        if self.kind != kind {
            return Err(invalid_proposal(format!("expected {:?} message, saw {:?}", kind, self.kind)));
        }
        check_channel_id(&self.channel_id, channel_id)?;
        if self.signer != *signer {
            return Err(invalid_proposal(format!("unexpected signer {}", self.signer)));
        }
        Ok(())
    }
}

/// Discloses the revocation secret of a superseded commitment
#[serde_as]
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevocationMessage {
    /// Envelope version, [`WIRE_VERSION`]
    pub version: u8,
    /// The multisig address of the channel
    pub channel_id: String,
    /// The revoked commitment
    pub sequence: u64,
    /// The revocation secret
    #[serde_as(as = "Hex")]
    pub secret: [u8; 32],
}

impl RevocationMessage {
    /// Encode as JSON
    pub fn to_json(&self) -> Result<String, Status> {
        serde_json::to_string(self)
            .map_err(|err| invalid_proposal(format!("encode revocation: {}", err)))
    }

    /// Decode from JSON
    pub fn from_json(json: &str) -> Result<Self, Status> {
        serde_json::from_str(json)
            .map_err(|err| invalid_proposal(format!("decode revocation: {}", err)))
    }
}

impl core::fmt::Debug for RevocationMessage {
    // the secret is public once sent, but keep it out of logs anyway
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RevocationMessage")
            .field("version", &self.version)
            .field("channel_id", &self.channel_id)
            .field("sequence", &self.sequence)
            .field("secret", &crate::util::debug_utils::Redacted)
            .finish()
    }
}

pub(crate) fn check_version(version: u8) -> Result<(), Status> {
    if version != WIRE_VERSION {
        return Err(invalid_proposal(format!("unsupported message version {}", version)));
    }
    Ok(())
}

pub(crate) fn check_channel_id(seen: &str, expected: &str) -> Result<(), Status> {
    if seen != expected {
        return Err(invalid_proposal(format!("message for channel {}, expected {}", seen, expected)));
    }
    Ok(())
}

/// The other party, as seen by a handshake driver.
///
/// Implementations carry the message over whatever transport connects the parties.
#[async_trait]
pub trait Counterparty: Send + Sync {
    /// Have the counterparty validate and countersign a proposal
    async fn countersign(&self, message: WireMessage) -> Result<WireMessage, Status>;

    /// Deliver a revocation secret
    async fn revoke(&self, message: RevocationMessage) -> Result<(), Status> {
        Err(invalid_proposal(format!(
            "counterparty does not accept revocations (sequence {})",
            message.sequence
        )))
    }
}
