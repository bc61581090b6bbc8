#![allow(missing_docs)]

use crate::prelude::*;

use bitcoin::bip32::Xpriv;
use bitcoin::consensus::encode::{deserialize, serialize};
use bitcoin::hashes::Hash;
use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
use bitcoin::{Amount, Network, ScriptBuf, Transaction, TxOut, Txid};

use crate::tx::multisig::MultisigContext;
use crate::tx::tx::FundingReference;
use crate::util::transaction_utils::p2pkh_script_pubkey;

/// Root key of the fixture channel owner
pub const FIXTURE_XPRV: &str = "xprv9s21ZrQH143K3vDcUe4KsRnPzFpxwv9VhnExscaAB6KGW9kTr1YhJngKqA47ycSMzzJoGUFeh5PkC4r8nRr7iDqXSdrdh1M1rXqgFhHsFbV";

/// Root public key of the fixture counterparty
pub const FIXTURE_COUNTERPARTY_XPUB: &str = "xpub661MyMwAqRbcGsGCwFS4LxezMPgLmXQDqE5q4fUSpQ4rWSHxtQ3USe9N4AkH2x4tzoMtXiWvepZeq5AicnpqapAS68JWGJLrnrSdW5Crofo";

/// The multisig address of the fixture keys at `m/1/1`
pub const FIXTURE_CHANNEL_ADDRESS: &str = "3JPTiXjHVB5HBnUiZMXVmV4G4SkTtVgqE7";

/// Funding of 2e7 sat from a 1e8 sat output of key 30, into the multisig of keys 40 and 50
pub const FIXTURE_FUNDING_TX_HEX: &str = "01000000010000000000000000000000000000000000000000000000000000000000000000000000006a4730440220394e0e0d6729bddb777c34668144142ef0f8b247d3d0461770772dbde915c734022066d3755061395e66528c08ef179f59cba90a6c6e722b5dd233998edb356a871e0121036d2b085e9e382ed10b69fc311a03f8641ccfff21574de0927513a49d9a688a00ffffffff02002d31010000000017a914825d8d4a359b1caee1ea5191d43deaff2a87691487f08cc404000000001976a914896007cb039c6648498ba434b2d0ed00837c1a3588ac00000000";

/// The same funding transaction, signed with a random nonce instead of RFC6979
pub const FIXTURE_FUNDING_TX_RANDOM_NONCE_HEX: &str = "01000000010000000000000000000000000000000000000000000000000000000000000000000000006b483045022100c000cacbb96e644d8ecd80b7e729471ab64d7913a52ceb45b7c498394459fa6f0220338cad242d55e4379d95ebc839771930ea849a31243b8e4400013a2f90ea91400121036d2b085e9e382ed10b69fc311a03f8641ccfff21574de0927513a49d9a688a00ffffffff02002d31010000000017a914825d8d4a359b1caee1ea5191d43deaff2a87691487f08cc404000000001976a914896007cb039c6648498ba434b2d0ed00837c1a3588ac00000000";

/// Consensus script verification flags
pub const VERIFY_P2SH: u32 = 1 << 0;
pub const VERIFY_DERSIG: u32 = 1 << 2;
pub const VERIFY_CHECKLOCKTIMEVERIFY: u32 = 1 << 9;
pub const VERIFY_CHECKSEQUENCEVERIFY: u32 = 1 << 10;
pub const VERIFY_CHANNEL_FLAGS: u32 =
    VERIFY_P2SH | VERIFY_DERSIG | VERIFY_CHECKLOCKTIMEVERIFY | VERIFY_CHECKSEQUENCEVERIFY;

/// A secret key whose scalar is `i`
pub fn make_secret_key(i: u8) -> SecretKey {
    let mut bytes = [0u8; 32];
    bytes[31] = i;
    SecretKey::from_slice(&bytes).unwrap()
}

pub fn make_pubkey(i: u8) -> PublicKey {
    PublicKey::from_secret_key(&Secp256k1::new(), &make_secret_key(i))
}

/// A deterministic root key
pub fn make_root(i: u8) -> Xpriv {
    Xpriv::new_master(Network::Bitcoin, &[i; 32]).unwrap()
}

pub fn make_txid(i: u8) -> Txid {
    Txid::from_byte_array([i; 32])
}

/// A funding reference with a placeholder output script
pub fn make_funding_reference(amount_sat: u64, txid_byte: u8) -> FundingReference {
    FundingReference::new(
        make_txid(txid_byte),
        0,
        TxOut { value: Amount::from_sat(amount_sat), script_pubkey: ScriptBuf::new() },
    )
}

/// A funding reference paying a multisig
pub fn make_multisig_funding(ctx: &MultisigContext, amount_sat: u64, txid_byte: u8) -> FundingReference {
    FundingReference::new(
        make_txid(txid_byte),
        1,
        TxOut { value: Amount::from_sat(amount_sat), script_pubkey: ctx.script_pubkey() },
    )
}

/// A P2PKH output of key `i`, as spent by a funding transaction
pub fn make_p2pkh_input(i: u8, amount_sat: u64, txid: Txid) -> FundingReference {
    FundingReference::new(
        txid,
        0,
        TxOut { value: Amount::from_sat(amount_sat), script_pubkey: p2pkh_script_pubkey(&make_pubkey(i)) },
    )
}

pub fn make_fixture_funding_tx() -> Transaction {
    deserialize(&hex::decode(FIXTURE_FUNDING_TX_HEX).unwrap()).unwrap()
}

/// Run input `index` of `tx` through the consensus script interpreter
pub fn verify_input(tx: &Transaction, index: usize, spent: &TxOut, flags: u32) -> Result<(), String> {
    bitcoin::consensus::verify_script_with_flags(
        &spent.script_pubkey,
        index,
        spent.value,
        &serialize(tx),
        flags,
    )
    .map_err(|err| format!("{:?}", err))
}

/// Assert that every input of `tx` spending `funding` verifies
pub fn assert_spends(tx: &Transaction, funding: &FundingReference) {
    verify_input(tx, 0, &funding.txout, VERIFY_CHANNEL_FLAGS)
        .unwrap_or_else(|err| panic!("input 0 does not verify: {}", err));
}
