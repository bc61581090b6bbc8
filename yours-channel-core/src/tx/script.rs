use crate::prelude::*;

use bitcoin::blockdata::opcodes::all::{
    OP_CHECKSIG, OP_CHECKSIGVERIFY, OP_CLTV, OP_CSV, OP_DROP, OP_ELSE, OP_ENDIF, OP_EQUAL,
    OP_EQUALVERIFY, OP_HASH160, OP_IF, OP_PUSHBYTES_0, OP_PUSHNUM_1, OP_PUSHNUM_16, OP_SHA256,
};
use bitcoin::blockdata::opcodes::Opcode;
use bitcoin::blockdata::script::{Builder, Instruction, Instructions};
use bitcoin::hashes::{hash160, sha256, Hash};
use bitcoin::secp256k1::{ecdsa::Signature, PublicKey};
use bitcoin::{Script, ScriptBuf};

use crate::policy::error::{mismatch_error, script_format_error, ValidationError};
use crate::util::status::Status;
use crate::util::transaction_utils::{push_signature, push_vec};

fn expect_next<'a>(iter: &'a mut Instructions) -> Result<Instruction<'a>, ValidationError> {
    iter.next()
        .ok_or_else(|| script_format_error("unexpected end"))?
        .map_err(|err| script_format_error(format!("unparseable opcode: {}", err)))
}

/// Consume an opcode, which must be `op`
#[inline]
pub fn expect_op(iter: &mut Instructions, op: Opcode) -> Result<(), ValidationError> {
    let ins = expect_next(iter)?;
    match ins {
        Instruction::Op(o) =>
            if o == op {
                Ok(())
            } else {
                Err(mismatch_error(format!("expected op {}, saw {}", op, o)))
            },
        _ => Err(mismatch_error(format!("expected op {}, saw {:?}", op, ins))),
    }
}

/// Consume a non-negative script number
#[inline]
pub fn expect_number(iter: &mut Instructions) -> Result<i64, ValidationError> {
    let ins = expect_next(iter)?;
    match ins {
        Instruction::Op(op) => {
            let code = op.to_u8();
            if code >= OP_PUSHNUM_1.to_u8() && code <= OP_PUSHNUM_16.to_u8() {
                Ok((code - OP_PUSHNUM_1.to_u8() + 1) as i64)
            } else {
                Err(mismatch_error(format!("expected number, saw {}", op)))
            }
        }
        Instruction::PushBytes(d) => {
            let d = d.as_bytes();
            if d.len() > 4 {
                return Err(script_format_error(format!("number too long: {} bytes", d.len())));
            }
            let mut value: i64 = 0;
            for (i, b) in d.iter().enumerate() {
                value |= (*b as i64) << (8 * i);
            }
            match d.last() {
                Some(last) if last & 0x80 != 0 =>
                    Err(script_format_error(format!("negative number {:?}", d))),
                _ => Ok(value),
            }
        }
    }
}

/// Consume a relative block delay
#[inline]
pub fn expect_delay(iter: &mut Instructions) -> Result<u16, ValidationError> {
    let n = expect_number(iter)?;
    u16::try_from(n).map_err(|_| mismatch_error(format!("delay {} out of range", n)))
}

/// The script must be exhausted
#[inline]
pub fn expect_script_end(iter: &mut Instructions) -> Result<(), ValidationError> {
    let ins = iter.next();
    if ins.is_none() {
        Ok(())
    } else {
        Err(mismatch_error(format!("expected script end, saw {:?}", ins)))
    }
}

/// Consume a data push
#[inline]
pub fn expect_data(iter: &mut Instructions) -> Result<Vec<u8>, ValidationError> {
    let ins = expect_next(iter)?;
    match ins {
        Instruction::PushBytes(d) => Ok(d.as_bytes().to_vec()),
        _ => Err(mismatch_error(format!("expected data, saw {:?}", ins))),
    }
}

/// Consume a compressed public key push
pub fn expect_pubkey(iter: &mut Instructions) -> Result<PublicKey, ValidationError> {
    let data = expect_data(iter)?;
    if data.len() != 33 {
        return Err(mismatch_error(format!("expected compressed key, saw {} bytes", data.len())));
    }
    PublicKey::from_slice(&data).map_err(|err| mismatch_error(format!("bad pubkey: {}", err)))
}

/// Consume a HASH160 push
pub fn expect_hash160(iter: &mut Instructions) -> Result<hash160::Hash, ValidationError> {
    let data = expect_data(iter)?;
    hash160::Hash::from_slice(&data)
        .map_err(|_| mismatch_error(format!("expected 20 byte hash, saw {} bytes", data.len())))
}

/// Parameters of a revocable HTLC output, owned by the party whose commitment it is in.
///
/// The three spending branches are:
/// 1. penalty: the counterparty's signature and the owner's revocation secret
/// 2. after `htlc_delay` blocks: the counterparty's signature and the HTLC secret
/// 3. after `refund_delay` blocks: the owner's signature
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RhtlcParams {
    /// Key of the owner, who can reclaim the funds after the refund delay
    pub owner_pubkey: PublicKey,
    /// Key of the counterparty, who can claim with either secret
    pub counterparty_pubkey: PublicKey,
    /// Hash of the owner's revocation secret for this state
    pub revocation_hash: hash160::Hash,
    /// Hash of the in-flight HTLC secret
    pub htlc_hash: hash160::Hash,
    /// Relative delay of the HTLC branch
    pub htlc_delay: u16,
    /// Relative delay of the refund branch
    pub refund_delay: u16,
}

/// Parameters of an HTLC output
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HtlcParams {
    /// Key of the payee, who claims with the HTLC secret
    pub payee_pubkey: PublicKey,
    /// Key of the payer, who is refunded after the delay
    pub payer_pubkey: PublicKey,
    /// Hash of the HTLC secret
    pub htlc_hash: hash160::Hash,
    /// Relative delay of the refund branch
    pub refund_delay: u16,
}

fn push_pubkey(builder: Builder, key: &PublicKey) -> Builder {
    builder.push_key(&bitcoin::PublicKey::new(*key))
}

/// The revocable HTLC redeem script
pub fn get_rhtlc_redeemscript(params: &RhtlcParams) -> ScriptBuf {
    let builder = Builder::new().push_opcode(OP_IF);
    let builder = push_pubkey(builder, &params.counterparty_pubkey)
        .push_opcode(OP_CHECKSIGVERIFY)
        .push_opcode(OP_HASH160)
        .push_slice(params.revocation_hash.to_byte_array())
        .push_opcode(OP_EQUAL)
        .push_opcode(OP_ELSE)
        .push_opcode(OP_IF)
        .push_int(params.htlc_delay as i64)
        .push_opcode(OP_CSV)
        .push_opcode(OP_DROP);
    let builder = push_pubkey(builder, &params.counterparty_pubkey)
        .push_opcode(OP_CHECKSIGVERIFY)
        .push_opcode(OP_HASH160)
        .push_slice(params.htlc_hash.to_byte_array())
        .push_opcode(OP_EQUAL)
        .push_opcode(OP_ELSE)
        .push_int(params.refund_delay as i64)
        .push_opcode(OP_CSV)
        .push_opcode(OP_DROP);
    push_pubkey(builder, &params.owner_pubkey)
        .push_opcode(OP_CHECKSIG)
        .push_opcode(OP_ENDIF)
        .push_opcode(OP_ENDIF)
        .into_script()
}

/// Parse a revocable HTLC redeem script back into its parameters
pub fn parse_rhtlc_redeemscript(script: &Script) -> Result<RhtlcParams, ValidationError> {
    let iter = &mut script.instructions();
    expect_op(iter, OP_IF)?;
    let counterparty_pubkey = expect_pubkey(iter)?;
    expect_op(iter, OP_CHECKSIGVERIFY)?;
    expect_op(iter, OP_HASH160)?;
    let revocation_hash = expect_hash160(iter)?;
    expect_op(iter, OP_EQUAL)?;
    expect_op(iter, OP_ELSE)?;
    expect_op(iter, OP_IF)?;
    let htlc_delay = expect_delay(iter)?;
    expect_op(iter, OP_CSV)?;
    expect_op(iter, OP_DROP)?;
    let htlc_claim_pubkey = expect_pubkey(iter)?;
    if htlc_claim_pubkey != counterparty_pubkey {
        return Err(mismatch_error("penalty and htlc branches name different keys"));
    }
    expect_op(iter, OP_CHECKSIGVERIFY)?;
    expect_op(iter, OP_HASH160)?;
    let htlc_hash = expect_hash160(iter)?;
    expect_op(iter, OP_EQUAL)?;
    expect_op(iter, OP_ELSE)?;
    let refund_delay = expect_delay(iter)?;
    expect_op(iter, OP_CSV)?;
    expect_op(iter, OP_DROP)?;
    let owner_pubkey = expect_pubkey(iter)?;
    expect_op(iter, OP_CHECKSIG)?;
    expect_op(iter, OP_ENDIF)?;
    expect_op(iter, OP_ENDIF)?;
    expect_script_end(iter)?;
    Ok(RhtlcParams {
        owner_pubkey,
        counterparty_pubkey,
        revocation_hash,
        htlc_hash,
        htlc_delay,
        refund_delay,
    })
}

/// The HTLC redeem script
pub fn get_htlc_redeemscript(params: &HtlcParams) -> ScriptBuf {
    let builder = Builder::new().push_opcode(OP_IF);
    let builder = push_pubkey(builder, &params.payee_pubkey)
        .push_opcode(OP_CHECKSIGVERIFY)
        .push_opcode(OP_HASH160)
        .push_slice(params.htlc_hash.to_byte_array())
        .push_opcode(OP_EQUAL)
        .push_opcode(OP_ELSE)
        .push_int(params.refund_delay as i64)
        .push_opcode(OP_CSV)
        .push_opcode(OP_DROP);
    push_pubkey(builder, &params.payer_pubkey)
        .push_opcode(OP_CHECKSIG)
        .push_opcode(OP_ENDIF)
        .into_script()
}

/// Parse an HTLC redeem script back into its parameters
pub fn parse_htlc_redeemscript(script: &Script) -> Result<HtlcParams, ValidationError> {
    let iter = &mut script.instructions();
    expect_op(iter, OP_IF)?;
    let payee_pubkey = expect_pubkey(iter)?;
    expect_op(iter, OP_CHECKSIGVERIFY)?;
    expect_op(iter, OP_HASH160)?;
    let htlc_hash = expect_hash160(iter)?;
    expect_op(iter, OP_EQUAL)?;
    expect_op(iter, OP_ELSE)?;
    let refund_delay = expect_delay(iter)?;
    expect_op(iter, OP_CSV)?;
    expect_op(iter, OP_DROP)?;
    let payer_pubkey = expect_pubkey(iter)?;
    expect_op(iter, OP_CHECKSIG)?;
    expect_op(iter, OP_ENDIF)?;
    expect_script_end(iter)?;
    Ok(HtlcParams { payee_pubkey, payer_pubkey, htlc_hash, refund_delay })
}

/// A key locked until an absolute lock time: `<n> CLTV DROP <key> CHECKSIG`
pub fn get_cltv_redeemscript(lock_time: u32, pubkey: &PublicKey) -> ScriptBuf {
    let builder = Builder::new().push_int(lock_time as i64).push_opcode(OP_CLTV).push_opcode(OP_DROP);
    push_pubkey(builder, pubkey).push_opcode(OP_CHECKSIG).into_script()
}

/// A key locked for a relative delay: `<n> CSV DROP <key> CHECKSIG`
pub fn get_csv_redeemscript(delay: u16, pubkey: &PublicKey) -> ScriptBuf {
    let builder = Builder::new().push_int(delay as i64).push_opcode(OP_CSV).push_opcode(OP_DROP);
    push_pubkey(builder, pubkey).push_opcode(OP_CHECKSIG).into_script()
}

/// A key plus a SHA-256 preimage: `SHA256 <h> EQUALVERIFY <key> CHECKSIG`
pub fn get_sha256_lock_redeemscript(hash: &sha256::Hash, pubkey: &PublicKey) -> ScriptBuf {
    let builder = Builder::new()
        .push_opcode(OP_SHA256)
        .push_slice(hash.to_byte_array())
        .push_opcode(OP_EQUALVERIFY);
    push_pubkey(builder, pubkey).push_opcode(OP_CHECKSIG).into_script()
}

fn push_redeemscript(builder: Builder, redeemscript: &Script) -> Result<ScriptBuf, Status> {
    Ok(push_vec(builder, redeemscript.to_bytes())?.into_script())
}

/// Spend an RHTLC output through the penalty branch, given the revealed revocation secret
pub fn rhtlc_penalty_script_sig(
    sig: &Signature,
    revocation_secret: &[u8; 32],
    redeemscript: &Script,
) -> Result<ScriptBuf, Status> {
    let builder = push_signature(Builder::new().push_slice(*revocation_secret), sig)?
        .push_opcode(OP_PUSHNUM_1);
    push_redeemscript(builder, redeemscript)
}

/// Spend an RHTLC output through the HTLC branch
pub fn rhtlc_htlc_script_sig(
    sig: &Signature,
    htlc_secret: &[u8; 32],
    redeemscript: &Script,
) -> Result<ScriptBuf, Status> {
    let builder = push_signature(Builder::new().push_slice(*htlc_secret), sig)?
        .push_opcode(OP_PUSHNUM_1)
        .push_opcode(OP_PUSHBYTES_0);
    push_redeemscript(builder, redeemscript)
}

/// Spend an RHTLC output through the refund branch
pub fn rhtlc_refund_script_sig(sig: &Signature, redeemscript: &Script) -> Result<ScriptBuf, Status> {
    let builder = push_signature(Builder::new(), sig)?
        .push_opcode(OP_PUSHBYTES_0)
        .push_opcode(OP_PUSHBYTES_0);
    push_redeemscript(builder, redeemscript)
}

/// Claim an HTLC output with the secret
pub fn htlc_claim_script_sig(
    sig: &Signature,
    htlc_secret: &[u8; 32],
    redeemscript: &Script,
) -> Result<ScriptBuf, Status> {
    let builder = push_signature(Builder::new().push_slice(*htlc_secret), sig)?
        .push_opcode(OP_PUSHNUM_1);
    push_redeemscript(builder, redeemscript)
}

/// Reclaim an HTLC output after the delay
pub fn htlc_refund_script_sig(sig: &Signature, redeemscript: &Script) -> Result<ScriptBuf, Status> {
    let builder = push_signature(Builder::new(), sig)?.push_opcode(OP_PUSHBYTES_0);
    push_redeemscript(builder, redeemscript)
}

/// Spend a single-key P2SH script: `<sig> <preimages>... <redeemscript>`.
/// The last preimage ends up on top of the stack.
pub fn p2sh_single_sig_script_sig(
    sig: &Signature,
    preimages: &[&[u8]],
    redeemscript: &Script,
) -> Result<ScriptBuf, Status> {
    let mut builder = push_signature(Builder::new(), sig)?;
    for preimage in preimages {
        builder = push_vec(builder, preimage.to_vec())?;
    }
    push_redeemscript(builder, redeemscript)
}
