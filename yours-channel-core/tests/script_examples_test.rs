//! Spend the channel output scripts through the consensus script interpreter

use bitcoin::absolute::LockTime;
use bitcoin::blockdata::script::Builder;
use bitcoin::hashes::{sha256, Hash};
use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
use bitcoin::transaction::Version;
use bitcoin::{Amount, OutPoint, Script, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness};
use test_log::test;

use yours_channel::tx::script::{
    get_cltv_redeemscript, get_csv_redeemscript, get_htlc_redeemscript, get_rhtlc_redeemscript,
    get_sha256_lock_redeemscript, htlc_claim_script_sig, htlc_refund_script_sig,
    p2sh_single_sig_script_sig, rhtlc_htlc_script_sig, rhtlc_penalty_script_sig,
    rhtlc_refund_script_sig, HtlcParams, RhtlcParams,
};
use yours_channel::util::crypto_utils::secret_hash;
use yours_channel::util::test_utils::{
    make_pubkey, make_secret_key, make_txid, verify_input, VERIFY_CHANNEL_FLAGS,
};
use yours_channel::util::transaction_utils::{p2pkh_script_pubkey, push_signature, sign_legacy_input};

const REVOCATION_SECRET: [u8; 32] = [3; 32];
const HTLC_SECRET: [u8; 32] = [4; 32];

fn spent_output(script_pubkey: ScriptBuf) -> TxOut {
    TxOut { value: Amount::from_sat(500_000), script_pubkey }
}

fn spending_tx(version: Version, lock_time: LockTime, sequence: Sequence) -> Transaction {
    Transaction {
        version,
        lock_time,
        input: vec![TxIn {
            previous_output: OutPoint { txid: make_txid(0), vout: 0 },
            script_sig: ScriptBuf::new(),
            sequence,
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: Amount::from_sat(100_000),
            script_pubkey: p2pkh_script_pubkey(&make_pubkey(9)),
        }],
    }
}

fn sign(tx: &Transaction, script_code: &Script, key: &SecretKey) -> bitcoin::secp256k1::ecdsa::Signature {
    sign_legacy_input(&Secp256k1::new(), tx, 0, script_code, key).unwrap()
}

// a spend of a bare (non-P2SH) single-key script
fn bare_spend(mut tx: Transaction, script_pubkey: &Script, key: &SecretKey) -> Transaction {
    let sig = sign(&tx, script_pubkey, key);
    tx.input[0].script_sig = push_signature(Builder::new(), &sig).unwrap().into_script();
    tx
}

fn p2sh_spend(mut tx: Transaction, redeemscript: &Script, key: &SecretKey, preimages: &[&[u8]]) -> Transaction {
    let sig = sign(&tx, redeemscript, key);
    tx.input[0].script_sig = p2sh_single_sig_script_sig(&sig, preimages, redeemscript).unwrap();
    tx
}

fn cltv_tx(height: u32) -> Transaction {
    spending_tx(Version::ONE, LockTime::from_height(height).unwrap(), Sequence(0xf0f0f0f0))
}

fn csv_tx(blocks: u16) -> Transaction {
    spending_tx(Version::TWO, LockTime::ZERO, Sequence::from_height(blocks))
}

#[test]
fn cltv_locks_until_height() {
    let key = make_secret_key(1);
    let script = get_cltv_redeemscript(100, &make_pubkey(1));
    let spent = spent_output(script.clone());

    let early = bare_spend(cltv_tx(99), &script, &key);
    assert!(verify_input(&early, 0, &spent, VERIFY_CHANNEL_FLAGS).is_err());
    let ready = bare_spend(cltv_tx(100), &script, &key);
    verify_input(&ready, 0, &spent, VERIFY_CHANNEL_FLAGS).unwrap();

    // a final sequence disables the lock time, and with it the spend
    let mut final_seq = cltv_tx(100);
    final_seq.input[0].sequence = Sequence::MAX;
    let final_seq = bare_spend(final_seq, &script, &key);
    assert!(verify_input(&final_seq, 0, &spent, VERIFY_CHANNEL_FLAGS).is_err());
}

#[test]
fn cltv_locks_until_height_p2sh() {
    let key = make_secret_key(1);
    let redeemscript = get_cltv_redeemscript(100, &make_pubkey(1));
    let spent = spent_output(redeemscript.to_p2sh());

    let early = p2sh_spend(cltv_tx(99), &redeemscript, &key, &[]);
    assert!(verify_input(&early, 0, &spent, VERIFY_CHANNEL_FLAGS).is_err());
    let ready = p2sh_spend(cltv_tx(100), &redeemscript, &key, &[]);
    verify_input(&ready, 0, &spent, VERIFY_CHANNEL_FLAGS).unwrap();
}

#[test]
fn csv_locks_for_blocks() {
    let key = make_secret_key(2);
    let script = get_csv_redeemscript(100, &make_pubkey(2));
    let spent = spent_output(script.clone());

    let early = bare_spend(csv_tx(99), &script, &key);
    assert!(verify_input(&early, 0, &spent, VERIFY_CHANNEL_FLAGS).is_err());
    let ready = bare_spend(csv_tx(100), &script, &key);
    verify_input(&ready, 0, &spent, VERIFY_CHANNEL_FLAGS).unwrap();

    // relative lock times need version 2
    let mut v1 = csv_tx(100);
    v1.version = Version::ONE;
    let v1 = bare_spend(v1, &script, &key);
    assert!(verify_input(&v1, 0, &spent, VERIFY_CHANNEL_FLAGS).is_err());
}

#[test]
fn csv_locks_for_blocks_p2sh() {
    let key = make_secret_key(2);
    let redeemscript = get_csv_redeemscript(100, &make_pubkey(2));
    let spent = spent_output(redeemscript.to_p2sh());

    let early = p2sh_spend(csv_tx(99), &redeemscript, &key, &[]);
    assert!(verify_input(&early, 0, &spent, VERIFY_CHANNEL_FLAGS).is_err());
    let ready = p2sh_spend(csv_tx(100), &redeemscript, &key, &[]);
    verify_input(&ready, 0, &spent, VERIFY_CHANNEL_FLAGS).unwrap();
}

#[test]
fn sha256_lock_needs_preimage() {
    let key = make_secret_key(3);
    let secret: &[u8] = b"this is a secret string";
    let redeemscript = get_sha256_lock_redeemscript(&sha256::Hash::hash(secret), &make_pubkey(3));
    let spent = spent_output(redeemscript.to_p2sh());
    let tx = spending_tx(Version::ONE, LockTime::ZERO, Sequence::MAX);

    let good = p2sh_spend(tx.clone(), &redeemscript, &key, &[secret]);
    verify_input(&good, 0, &spent, VERIFY_CHANNEL_FLAGS).unwrap();
    let bad = p2sh_spend(tx.clone(), &redeemscript, &key, &[&b"not the secret"[..]]);
    assert!(verify_input(&bad, 0, &spent, VERIFY_CHANNEL_FLAGS).is_err());
    let wrong_key = p2sh_spend(tx, &redeemscript, &make_secret_key(4), &[secret]);
    assert!(verify_input(&wrong_key, 0, &spent, VERIFY_CHANNEL_FLAGS).is_err());
}

struct Rhtlc {
    owner: SecretKey,
    counterparty: SecretKey,
    redeemscript: ScriptBuf,
    spent: TxOut,
}

// Alice owns the commitment, Bob is the counterparty
fn make_rhtlc() -> Rhtlc {
    let params = RhtlcParams {
        owner_pubkey: make_pubkey(10),
        counterparty_pubkey: make_pubkey(11),
        revocation_hash: secret_hash(&REVOCATION_SECRET),
        htlc_hash: secret_hash(&HTLC_SECRET),
        htlc_delay: 144,
        refund_delay: 288,
    };
    let redeemscript = get_rhtlc_redeemscript(&params);
    let spent = spent_output(redeemscript.to_p2sh());
    Rhtlc { owner: make_secret_key(10), counterparty: make_secret_key(11), redeemscript, spent }
}

fn with_script_sig(mut tx: Transaction, script_sig: ScriptBuf) -> Transaction {
    tx.input[0].script_sig = script_sig;
    tx
}

#[test]
fn rhtlc_penalty_branch() {
    let r = make_rhtlc();
    let tx = spending_tx(Version::ONE, LockTime::ZERO, Sequence::MAX);
    let sig = sign(&tx, &r.redeemscript, &r.counterparty);

    let good = with_script_sig(
        tx.clone(),
        rhtlc_penalty_script_sig(&sig, &REVOCATION_SECRET, &r.redeemscript).unwrap(),
    );
    verify_input(&good, 0, &r.spent, VERIFY_CHANNEL_FLAGS).unwrap();

    // the HTLC secret does not open the penalty branch
    let wrong_secret =
        with_script_sig(tx.clone(), rhtlc_penalty_script_sig(&sig, &HTLC_SECRET, &r.redeemscript).unwrap());
    assert!(verify_input(&wrong_secret, 0, &r.spent, VERIFY_CHANNEL_FLAGS).is_err());

    // nor can the owner use it
    let owner_sig = sign(&tx, &r.redeemscript, &r.owner);
    let owner = with_script_sig(
        tx,
        rhtlc_penalty_script_sig(&owner_sig, &REVOCATION_SECRET, &r.redeemscript).unwrap(),
    );
    assert!(verify_input(&owner, 0, &r.spent, VERIFY_CHANNEL_FLAGS).is_err());
}

#[test]
fn rhtlc_htlc_branch() {
    let r = make_rhtlc();
    let spend = |blocks: u16, secret: &[u8; 32]| {
        let tx = csv_tx(blocks);
        let sig = sign(&tx, &r.redeemscript, &r.counterparty);
        with_script_sig(tx, rhtlc_htlc_script_sig(&sig, secret, &r.redeemscript).unwrap())
    };
    assert!(verify_input(&spend(143, &HTLC_SECRET), 0, &r.spent, VERIFY_CHANNEL_FLAGS).is_err());
    verify_input(&spend(144, &HTLC_SECRET), 0, &r.spent, VERIFY_CHANNEL_FLAGS).unwrap();
    assert!(verify_input(&spend(144, &REVOCATION_SECRET), 0, &r.spent, VERIFY_CHANNEL_FLAGS).is_err());
}

#[test]
fn rhtlc_refund_branch() {
    let r = make_rhtlc();
    let spend = |blocks: u16, key: &SecretKey| {
        let tx = csv_tx(blocks);
        let sig = sign(&tx, &r.redeemscript, key);
        with_script_sig(tx, rhtlc_refund_script_sig(&sig, &r.redeemscript).unwrap())
    };
    assert!(verify_input(&spend(287, &r.owner), 0, &r.spent, VERIFY_CHANNEL_FLAGS).is_err());
    verify_input(&spend(288, &r.owner), 0, &r.spent, VERIFY_CHANNEL_FLAGS).unwrap();
    assert!(verify_input(&spend(288, &r.counterparty), 0, &r.spent, VERIFY_CHANNEL_FLAGS).is_err());
}

fn make_htlc(payee: &PublicKey, payer: &PublicKey) -> (ScriptBuf, TxOut) {
    let redeemscript = get_htlc_redeemscript(&HtlcParams {
        payee_pubkey: *payee,
        payer_pubkey: *payer,
        htlc_hash: secret_hash(&HTLC_SECRET),
        refund_delay: 288,
    });
    let spent = spent_output(redeemscript.to_p2sh());
    (redeemscript, spent)
}

#[test]
fn htlc_claim_branch() {
    let (redeemscript, spent) = make_htlc(&make_pubkey(20), &make_pubkey(21));
    let tx = spending_tx(Version::ONE, LockTime::ZERO, Sequence::MAX);
    let sig = sign(&tx, &redeemscript, &make_secret_key(20));

    let good = with_script_sig(tx.clone(), htlc_claim_script_sig(&sig, &HTLC_SECRET, &redeemscript).unwrap());
    verify_input(&good, 0, &spent, VERIFY_CHANNEL_FLAGS).unwrap();
    let bad =
        with_script_sig(tx, htlc_claim_script_sig(&sig, &REVOCATION_SECRET, &redeemscript).unwrap());
    assert!(verify_input(&bad, 0, &spent, VERIFY_CHANNEL_FLAGS).is_err());
}

#[test]
fn htlc_refund_branch() {
    let (redeemscript, spent) = make_htlc(&make_pubkey(20), &make_pubkey(21));
    let spend = |blocks: u16, key: &SecretKey| {
        let tx = csv_tx(blocks);
        let sig = sign(&tx, &redeemscript, key);
        with_script_sig(tx, htlc_refund_script_sig(&sig, &redeemscript).unwrap())
    };
    assert!(verify_input(&spend(287, &make_secret_key(21)), 0, &spent, VERIFY_CHANNEL_FLAGS).is_err());
    verify_input(&spend(288, &make_secret_key(21)), 0, &spent, VERIFY_CHANNEL_FLAGS).unwrap();
    assert!(verify_input(&spend(288, &make_secret_key(20)), 0, &spent, VERIFY_CHANNEL_FLAGS).is_err());
}
