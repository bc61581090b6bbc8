use crate::prelude::*;

use bitcoin::blockdata::opcodes::all::{OP_CHECKMULTISIG, OP_PUSHBYTES_0, OP_PUSHNUM_2};
use bitcoin::blockdata::script::{Builder, Instruction};
use bitcoin::secp256k1::{ecdsa::Signature, PublicKey};
use bitcoin::{Address, Network, Script, ScriptBuf};

use crate::policy::error::{mismatch_error, ValidationError};
use crate::tx::script::{expect_data, expect_script_end};
use crate::util::crypto_utils::bitcoin_vec_to_signature;
use crate::util::status::{invalid_key, Status};
use crate::util::transaction_utils::{push_signature, push_vec};

/// Signatures in redeem script key order; `None` where still missing
pub type MultisigSignatures = [Option<Signature>; 2];

/// The 2-of-2 multisig both parties lock the channel funds into
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MultisigContext {
    pubkeys: [PublicKey; 2],
    redeem_script: ScriptBuf,
    address: Address,
}

impl MultisigContext {
    /// Build the context from the two channel keys, in either order
    pub fn new(a: PublicKey, b: PublicKey, network: Network) -> Result<Self, Status> {
        if a == b {
            return Err(invalid_key(format!("both multisig keys are {}", a)));
        }
        let mut pubkeys = [a, b];
        pubkeys.sort_by_key(|k| k.serialize());
        let redeem_script = make_multisig_redeemscript(&pubkeys);
        let address = Address::p2sh(&redeem_script, network)
            .map_err(|err| invalid_key(format!("p2sh address: {}", err)))?;
        Ok(MultisigContext { pubkeys, redeem_script, address })
    }

    /// Build the context from serialized keys
    pub fn from_slices(a: &[u8], b: &[u8], network: Network) -> Result<Self, Status> {
        let parse = |data: &[u8]| {
            PublicKey::from_slice(data)
                .map_err(|err| invalid_key(format!("multisig key {}: {}", hex::encode(data), err)))
        };
        Self::new(parse(a)?, parse(b)?, network)
    }

    /// The keys, sorted
    pub fn sorted_pubkeys(&self) -> &[PublicKey; 2] {
        &self.pubkeys
    }

    /// `OP_2 <k1> <k2> OP_2 OP_CHECKMULTISIG`
    pub fn redeem_script(&self) -> &Script {
        &self.redeem_script
    }

    /// The P2SH address of the redeem script
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// The P2SH output script
    pub fn script_pubkey(&self) -> ScriptBuf {
        self.address.script_pubkey()
    }

    /// Position of a key in the redeem script
    pub fn position(&self, pubkey: &PublicKey) -> Option<usize> {
        self.pubkeys.iter().position(|k| k == pubkey)
    }

    /// Whether `pubkey` is one of the two keys
    pub fn contains(&self, pubkey: &PublicKey) -> bool {
        self.position(pubkey).is_some()
    }

    /// Place a signature by `pubkey` into its slot
    pub fn add_signature(
        &self,
        sigs: &mut MultisigSignatures,
        pubkey: &PublicKey,
        sig: Signature,
    ) -> Result<(), Status> {
        let pos = self
            .position(pubkey)
            .ok_or_else(|| invalid_key(format!("{} is not a multisig key", pubkey)))?;
        sigs[pos] = Some(sig);
        Ok(())
    }

    /// The P2SH scriptSig `OP_0 <sig1> <sig2> <redeem_script>`.
    /// A missing signature is left as an empty push, which fails CHECKMULTISIG.
    pub fn script_sig(&self, sigs: &MultisigSignatures) -> Result<ScriptBuf, Status> {
        let mut builder = Builder::new().push_opcode(OP_PUSHBYTES_0);
        for sig in sigs.iter() {
            builder = match sig {
                Some(sig) => push_signature(builder, sig)?,
                None => builder.push_opcode(OP_PUSHBYTES_0),
            };
        }
        Ok(push_vec(builder, self.redeem_script.to_bytes())?.into_script())
    }

    /// Read back the signatures from a (possibly partial) scriptSig built by
    /// [`MultisigContext::script_sig`]
    pub fn parse_script_sig(&self, script_sig: &Script) -> Result<MultisigSignatures, ValidationError> {
        let iter = &mut script_sig.instructions();
        let dummy = expect_data(iter)?;
        if !dummy.is_empty() {
            return Err(mismatch_error("multisig dummy element must be empty"));
        }
        let mut sigs: MultisigSignatures = [None, None];
        for slot in sigs.iter_mut() {
            let data = expect_data(iter)?;
            if !data.is_empty() {
                let sig = bitcoin_vec_to_signature(&data)
                    .map_err(|status| mismatch_error(status.message().to_string()))?;
                *slot = Some(sig);
            }
        }
        match iter.next() {
            Some(Ok(Instruction::PushBytes(d))) if d.as_bytes() == self.redeem_script.as_bytes() => {}
            _ => return Err(mismatch_error("scriptSig does not end with the channel redeem script")),
        }
        expect_script_end(iter)?;
        Ok(sigs)
    }
}

/// The standard 2-of-2 multisig redeem script over keys in the given order
pub fn make_multisig_redeemscript(pubkeys: &[PublicKey; 2]) -> ScriptBuf {
    Builder::new()
        .push_opcode(OP_PUSHNUM_2)
        .push_key(&bitcoin::PublicKey::new(pubkeys[0]))
        .push_key(&bitcoin::PublicKey::new(pubkeys[1]))
        .push_opcode(OP_PUSHNUM_2)
        .push_opcode(OP_CHECKMULTISIG)
        .into_script()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::status::Code;
    use crate::util::test_utils::*;
    use bitcoin::secp256k1::{Message, Secp256k1};

    #[test]
    fn order_independent_test() {
        for (i, j) in [(1u8, 2u8), (40, 50), (200, 3)] {
            let a = make_pubkey(i);
            let b = make_pubkey(j);
            let ab = MultisigContext::new(a, b, Network::Bitcoin).unwrap();
            let ba = MultisigContext::new(b, a, Network::Bitcoin).unwrap();
            assert_eq!(ab, ba);
            assert_eq!(ab.redeem_script(), ba.redeem_script());
            assert!(ab.address().to_string().starts_with('3'));
        }
    }

    #[test]
    fn sender_fixture_redeemscript_test() {
        let ctx = MultisigContext::new(make_pubkey(40), make_pubkey(50), Network::Bitcoin).unwrap();
        assert_eq!(
            hex::encode(ctx.redeem_script().as_bytes()),
            "52210229757774cc6f3be1d5f1774aefa8f02e50bc64404230e7a67e8fde79bd559a9a\
             210391de2f6bb67b11139f0e21203041bf080eacf59a33d99cd9f1929141bb0b4d0b52ae"
        );
        assert_eq!(
            hex::encode(ctx.script_pubkey().as_bytes()),
            "a914825d8d4a359b1caee1ea5191d43deaff2a87691487"
        );
    }

    #[test]
    fn malformed_key_test() {
        let good = make_pubkey(1).serialize();
        let err = MultisigContext::from_slices(&good, &[5u8; 33], Network::Bitcoin).unwrap_err();
        assert_eq!(err.code(), Code::InvalidKey);
        let err = MultisigContext::from_slices(&good[..32], &good, Network::Bitcoin).unwrap_err();
        assert_eq!(err.code(), Code::InvalidKey);
        let err = MultisigContext::from_slices(&good, &good, Network::Bitcoin).unwrap_err();
        assert_eq!(err.code(), Code::InvalidKey);
    }

    #[test]
    fn script_sig_round_trip_with_missing_signature() {
        let secp_ctx = Secp256k1::new();
        let ctx = MultisigContext::new(make_pubkey(40), make_pubkey(50), Network::Testnet).unwrap();
        let sig = secp_ctx.sign_ecdsa(&Message::from_digest([9u8; 32]), &make_secret_key(50));
        let mut sigs: MultisigSignatures = [None, None];
        ctx.add_signature(&mut sigs, &make_pubkey(50), sig).unwrap();
        assert!(ctx.add_signature(&mut sigs, &make_pubkey(60), sig).is_err());

        let partial = ctx.script_sig(&sigs).unwrap();
        let parsed = ctx.parse_script_sig(&partial).unwrap();
        assert_eq!(parsed, sigs);
        assert_eq!(parsed.iter().filter(|s| s.is_some()).count(), 1);

        let other = MultisigContext::new(make_pubkey(41), make_pubkey(50), Network::Testnet).unwrap();
        assert!(other.parse_script_sig(&partial).is_err());
    }
}
