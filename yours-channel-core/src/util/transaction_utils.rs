use crate::prelude::*;
use bitcoin::consensus::encode::serialize;
use bitcoin::hashes::Hash;
use bitcoin::script::{Builder, PushBytesBuf};
use bitcoin::secp256k1::{self, ecdsa::Signature, Message, PublicKey, Secp256k1, SecretKey};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::{Script, ScriptBuf, Transaction};

use crate::util::crypto_utils::{ecdsa_sign, ecdsa_verify, signature_to_bitcoin_vec};
use crate::util::status::{amount_mismatch, invalid_proposal, signature_mismatch, unexpected_input, Status};

/// The largest scriptSig of a pay-to-pubkey-hash spend:
/// `<sig> <pubkey>`
pub const P2PKH_SCRIPT_SIG_SIZE: usize = (1 + 73) + (1 + 33);

/// The largest scriptSig of a 2-of-2 multisig P2SH spend:
/// `OP_0 <sig> <sig> <redeemscript>`
pub const MULTISIG_SCRIPT_SIG_SIZE: usize = 1 + 2 * (1 + 73) + (2 + 71);

/// Estimated serialized size of a transaction once every input carries a scriptSig of
/// `script_sig_size` bytes.  Existing scriptSigs are ignored.
pub fn estimate_size(tx: &Transaction, script_sig_size: usize) -> usize {
    serialize(&strip_script_sigs(tx)).len() + tx.input.len() * script_sig_size
}

/// Fee for a transaction of `size` bytes, charged per started kilobyte
pub fn fee_for_size(size: usize, fee_per_kb_sat: u64) -> u64 {
    (size as u64 + 999) / 1000 * fee_per_kb_sat
}

/// A copy of the transaction with all scriptSigs removed, as exchanged before signing
pub fn strip_script_sigs(tx: &Transaction) -> Transaction {
    let mut stripped = tx.clone();
    for input in stripped.input.iter_mut() {
        input.script_sig = ScriptBuf::new();
    }
    stripped
}

/// Whether two transactions are identical apart from their scriptSigs
pub fn same_unsigned(a: &Transaction, b: &Transaction) -> bool {
    strip_script_sigs(a) == strip_script_sigs(b)
}

/// Total value of the outputs
pub fn sum_outputs(tx: &Transaction) -> Result<u64, Status> {
    tx.output.iter().try_fold(0u64, |acc, out| {
        acc.checked_add(out.value.to_sat())
            .ok_or_else(|| amount_mismatch("output sum overflow"))
    })
}

/// The SIGHASH_ALL legacy signature hash of an input
pub fn legacy_sighash_message(
    tx: &Transaction,
    input_index: usize,
    script_code: &Script,
) -> Result<Message, Status> {
    let sighash = SighashCache::new(tx)
        .legacy_signature_hash(input_index, script_code, EcdsaSighashType::All.to_u32())
        .map_err(|err| unexpected_input(format!("sighash for input {}: {}", input_index, err)))?;
    Ok(Message::from_digest(sighash.to_byte_array()))
}

/// Sign a legacy (non-segwit) input with SIGHASH_ALL
pub fn sign_legacy_input(
    secp_ctx: &Secp256k1<secp256k1::All>,
    tx: &Transaction,
    input_index: usize,
    script_code: &Script,
    privkey: &SecretKey,
) -> Result<Signature, Status> {
    let message = legacy_sighash_message(tx, input_index, script_code)?;
    Ok(ecdsa_sign(secp_ctx, privkey, &message))
}

/// Check a counterparty signature on a legacy input
pub fn verify_legacy_input(
    secp_ctx: &Secp256k1<secp256k1::All>,
    tx: &Transaction,
    input_index: usize,
    script_code: &Script,
    sig: &Signature,
    pubkey: &PublicKey,
) -> Result<(), Status> {
    let message = legacy_sighash_message(tx, input_index, script_code)?;
    if !ecdsa_verify(secp_ctx, &message, sig, pubkey) {
        return Err(signature_mismatch(format!(
            "signature on input {} does not verify against {}",
            input_index, pubkey
        )));
    }
    Ok(())
}

/// Push an arbitrary byte vector
pub fn push_vec(builder: Builder, data: Vec<u8>) -> Result<Builder, Status> {
    let bytes = PushBytesBuf::try_from(data)
        .map_err(|_| invalid_proposal("script push exceeds the maximum size"))?;
    Ok(builder.push_slice(bytes))
}

/// Push a signature with its SIGHASH_ALL byte
pub fn push_signature(builder: Builder, sig: &Signature) -> Result<Builder, Status> {
    push_vec(builder, signature_to_bitcoin_vec(*sig))
}

/// The pay-to-pubkey-hash script for a key
pub fn p2pkh_script_pubkey(pubkey: &PublicKey) -> ScriptBuf {
    ScriptBuf::new_p2pkh(&bitcoin::PublicKey::new(*pubkey).pubkey_hash())
}

/// The scriptSig spending a pay-to-pubkey-hash output
pub fn p2pkh_script_sig(sig: &Signature, pubkey: &PublicKey) -> Result<ScriptBuf, Status> {
    let builder = push_signature(Builder::new(), sig)?;
    Ok(builder.push_key(&bitcoin::PublicKey::new(*pubkey)).into_script())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::absolute::LockTime;
    use bitcoin::transaction::Version;
    use bitcoin::{Amount, OutPoint, Sequence, TxIn, TxOut, Witness};

    fn make_tx() -> Transaction {
        Transaction {
            version: Version::ONE,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::null(),
                script_sig: ScriptBuf::from(vec![0x51, 0x51]),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            }],
            output: vec![
                TxOut { value: Amount::from_sat(5000), script_pubkey: ScriptBuf::new() },
                TxOut { value: Amount::from_sat(7000), script_pubkey: ScriptBuf::new() },
            ],
        }
    }

    #[test]
    fn fee_rounds_up_per_kilobyte() {
        assert_eq!(fee_for_size(1, 10_000), 10_000);
        assert_eq!(fee_for_size(1000, 10_000), 10_000);
        assert_eq!(fee_for_size(1001, 10_000), 20_000);
        assert_eq!(fee_for_size(0, 10_000), 0);
    }

    #[test]
    fn estimate_ignores_existing_script_sigs() {
        let tx = make_tx();
        let bare = serialize(&strip_script_sigs(&tx)).len();
        assert_eq!(estimate_size(&tx, P2PKH_SCRIPT_SIG_SIZE), bare + P2PKH_SCRIPT_SIG_SIZE);
        assert!(same_unsigned(&tx, &strip_script_sigs(&tx)));
        assert_eq!(sum_outputs(&tx).unwrap(), 12_000);
    }

    #[test]
    fn sign_and_verify_input() {
        let secp_ctx = Secp256k1::new();
        let key = SecretKey::from_slice(&[30u8; 32]).unwrap();
        let pubkey = PublicKey::from_secret_key(&secp_ctx, &key);
        let other = PublicKey::from_secret_key(&secp_ctx, &SecretKey::from_slice(&[31u8; 32]).unwrap());
        let tx = make_tx();
        let script_code = p2pkh_script_pubkey(&pubkey);
        let sig = sign_legacy_input(&secp_ctx, &tx, 0, &script_code, &key).unwrap();
        verify_legacy_input(&secp_ctx, &tx, 0, &script_code, &sig, &pubkey).unwrap();
        let err = verify_legacy_input(&secp_ctx, &tx, 0, &script_code, &sig, &other).unwrap_err();
        assert_eq!(err.code(), crate::util::status::Code::SignatureMismatch);
        assert!(sign_legacy_input(&secp_ctx, &tx, 1, &script_code, &key).is_err());
    }
}
