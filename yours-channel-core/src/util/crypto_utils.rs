use crate::prelude::*;
use bitcoin::ecdsa;
use bitcoin::hashes::{hash160, Hash};
use bitcoin::secp256k1::rand::RngCore;
use bitcoin::secp256k1::{self, ecdsa::Signature, Message, PublicKey, Secp256k1, SecretKey};
use bitcoin::sighash::EcdsaSighashType;

use crate::util::status::{signature_mismatch, Status};

/// Draw a fresh 32 byte secret from the supplied random source
pub fn new_secret<R: RngCore>(rng: &mut R) -> [u8; 32] {
    let mut secret = [0u8; 32];
    rng.fill_bytes(&mut secret);
    secret
}

/// HASH160 (SHA-256 then RIPEMD-160) of a secret, as committed to by the channel scripts
pub fn secret_hash(secret: &[u8]) -> hash160::Hash {
    hash160::Hash::hash(secret)
}

/// Convert a signature to the DER + sighash-type form used in scripts
pub fn signature_to_bitcoin_vec(sig: Signature) -> Vec<u8> {
    ecdsa::Signature::sighash_all(sig).to_vec()
}

/// Convert a DER + sighash-type signature from a script.
/// Only SIGHASH_ALL is accepted.
pub fn bitcoin_vec_to_signature(sigvec: &[u8]) -> Result<Signature, Status> {
    let sig = ecdsa::Signature::from_slice(sigvec)
        .map_err(|err| signature_mismatch(format!("unparseable signature: {}", err)))?;
    if sig.sighash_type != EcdsaSighashType::All {
        return Err(signature_mismatch(format!(
            "unexpected sighash type {:?}",
            sig.sighash_type
        )));
    }
    Ok(sig.signature)
}

/// Sign a message digest with deterministic nonces
pub fn ecdsa_sign(
    secp_ctx: &Secp256k1<secp256k1::All>,
    privkey: &SecretKey,
    message: &Message,
) -> Signature {
    secp_ctx.sign_ecdsa(message, privkey)
}

/// Verify a signature over a message digest
pub fn ecdsa_verify(
    secp_ctx: &Secp256k1<secp256k1::All>,
    message: &Message,
    sig: &Signature,
    pubkey: &PublicKey,
) -> bool {
    secp_ctx.verify_ecdsa(message, sig, pubkey).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::secp256k1::rand::rngs::StdRng;
    use bitcoin::secp256k1::rand::SeedableRng;

    #[test]
    fn secrets_are_fresh() {
        let mut rng = StdRng::seed_from_u64(7);
        let a = new_secret(&mut rng);
        let b = new_secret(&mut rng);
        assert_ne!(a, b);
        assert_ne!(secret_hash(&a), secret_hash(&b));
    }

    #[test]
    fn signature_vec_test() {
        let secp_ctx = Secp256k1::new();
        let key = SecretKey::from_slice(&[7u8; 32]).unwrap();
        let msg = Message::from_digest([3u8; 32]);
        let sig = ecdsa_sign(&secp_ctx, &key, &msg);
        let sigvec = signature_to_bitcoin_vec(sig);
        assert_eq!(*sigvec.last().unwrap(), EcdsaSighashType::All as u8);
        assert_eq!(bitcoin_vec_to_signature(&sigvec).unwrap(), sig);
        let pubkey = PublicKey::from_secret_key(&secp_ctx, &key);
        assert!(ecdsa_verify(&secp_ctx, &msg, &sig, &pubkey));

        let mut none = sigvec.clone();
        *none.last_mut().unwrap() = EcdsaSighashType::None as u8;
        assert!(bitcoin_vec_to_signature(&none).is_err());
    }
}
