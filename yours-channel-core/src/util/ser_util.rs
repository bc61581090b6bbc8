//! Serialization helpers for the wire envelope.
//!
//! Transactions travel in consensus encoding, hex encoded when the format is
//! human readable, so the counterparty reconstructs them byte-identically.

use crate::prelude::*;

use alloc::borrow::Cow;
use bitcoin::consensus::encode::{deserialize, serialize};
use bitcoin::Transaction;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serializer};
use serde_with::{DeserializeAs, SerializeAs};

/// Consensus-encoded transaction handler
#[derive(Copy, Clone, Debug, Default)]
pub struct TransactionHandler;

impl SerializeAs<Transaction> for TransactionHandler {
    fn serialize_as<S>(source: &Transaction, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let bytes = serialize(source);
        if serializer.is_human_readable() {
            serializer.serialize_str(&hex::encode(bytes))
        } else {
            serializer.serialize_bytes(&bytes)
        }
    }
}

impl<'de> DeserializeAs<'de, Transaction> for TransactionHandler {
    fn deserialize_as<D>(deserializer: D) -> Result<Transaction, D::Error>
    where
        D: Deserializer<'de>,
    {
        let bytes = if deserializer.is_human_readable() {
            let res = <Cow<'de, str> as Deserialize<'de>>::deserialize(deserializer)?;
            hex::decode(&*res).map_err(|err| D::Error::custom(format!("bad hex: {}", err)))?
        } else {
            <Vec<u8> as Deserialize<'de>>::deserialize(deserializer)?
        };
        deserialize(&bytes).map_err(|err| D::Error::custom(format!("bad transaction: {}", err)))
    }
}
