use crate::prelude::*;
use core::fmt;
use core::str::FromStr;

use bitcoin::bip32::{ChildNumber, Xpriv, Xpub};
use bitcoin::secp256k1::rand::{Rng, RngCore};
use bitcoin::secp256k1::{self, PublicKey, Secp256k1, SecretKey};
use serde_derive::{Deserialize, Serialize};

use crate::util::debug_utils::Redacted;
use crate::util::status::{invalid_path, key_derivation_error, Status};

/// Smallest allowed path segment
pub const MIN_PATH_INDEX: u32 = 1;
/// Largest allowed path segment, one below the largest non-hardened index
pub const MAX_PATH_INDEX: u32 = (1 << 31) - 2;

/// Index of the payment key below the channel key
pub const PAYMENT_KEY_INDEX: u32 = 0;

/// The two-segment derivation path `m/<x>/<y>` of a channel's key material
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ChannelPath {
    x: u32,
    y: u32,
}

impl ChannelPath {
    /// A path from explicit segments
    pub fn new(x: u32, y: u32) -> Result<Self, Status> {
        for segment in [x, y] {
            if segment < MIN_PATH_INDEX || segment > MAX_PATH_INDEX {
                return Err(invalid_path(format!(
                    "path segment {} outside [{}, {}]",
                    segment, MIN_PATH_INDEX, MAX_PATH_INDEX
                )));
            }
        }
        Ok(ChannelPath { x, y })
    }

    /// A path with both segments drawn independently and uniformly.
    ///
    /// Equal segments are possible but negligibly likely, and are not rejected.
    pub fn random<R: RngCore>(rng: &mut R) -> Self {
        let x = rng.gen_range(MIN_PATH_INDEX..=MAX_PATH_INDEX);
        let y = rng.gen_range(MIN_PATH_INDEX..=MAX_PATH_INDEX);
        ChannelPath { x, y }
    }

    /// First segment
    pub fn x(&self) -> u32 {
        self.x
    }

    /// Second segment
    pub fn y(&self) -> u32 {
        self.y
    }

    fn child_numbers(&self) -> Result<[ChildNumber; 2], Status> {
        let normal = |i: u32| {
            ChildNumber::from_normal_idx(i)
                .map_err(|err| invalid_path(format!("path segment {}: {}", i, err)))
        };
        Ok([normal(self.x)?, normal(self.y)?])
    }

    fn payment_child_numbers(&self) -> Result<[ChildNumber; 3], Status> {
        let [x, y] = self.child_numbers()?;
        let payment = ChildNumber::from_normal_idx(PAYMENT_KEY_INDEX)
            .map_err(|err| invalid_path(format!("payment index: {}", err)))?;
        Ok([x, y, payment])
    }
}

impl fmt::Display for ChannelPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m/{}/{}", self.x, self.y)
    }
}

impl fmt::Debug for ChannelPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for ChannelPath {
    type Err = Status;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('/');
        if parts.next() != Some("m") {
            return Err(invalid_path(format!("path {:?} must start with m/", s)));
        }
        let mut segment = || -> Result<u32, Status> {
            let part = parts.next().ok_or_else(|| invalid_path(format!("path {:?} too short", s)))?;
            // reject "+1", hardened markers and the like
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(invalid_path(format!("bad path segment {:?} in {:?}", part, s)));
            }
            part.parse::<u32>()
                .map_err(|_| invalid_path(format!("path segment {:?} out of range", part)))
        };
        let x = segment()?;
        let y = segment()?;
        if parts.next().is_some() {
            return Err(invalid_path(format!("path {:?} has more than two segments", s)));
        }
        ChannelPath::new(x, y)
    }
}

impl TryFrom<String> for ChannelPath {
    type Error = Status;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<ChannelPath> for String {
    fn from(path: ChannelPath) -> String {
        path.to_string()
    }
}

/// A derived key pair
#[derive(Clone)]
pub struct ChannelKeyPair {
    secret: SecretKey,
    public: PublicKey,
}

impl ChannelKeyPair {
    /// Wrap an existing secret key
    pub fn from_secret_key(secp_ctx: &Secp256k1<secp256k1::All>, secret: SecretKey) -> Self {
        ChannelKeyPair { public: PublicKey::from_secret_key(secp_ctx, &secret), secret }
    }

    /// The public half
    pub fn public_key(&self) -> PublicKey {
        self.public
    }

    pub(crate) fn secret_key(&self) -> &SecretKey {
        &self.secret
    }
}

impl fmt::Debug for ChannelKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelKeyPair")
            .field("public", &self.public)
            .field("secret", &Redacted)
            .finish()
    }
}

/// Derive the channel key pair at `path` below a root key
pub fn derive_channel_key(
    secp_ctx: &Secp256k1<secp256k1::All>,
    root: &Xpriv,
    path: &ChannelPath,
) -> Result<ChannelKeyPair, Status> {
    let xpriv = root
        .derive_priv(secp_ctx, &path.child_numbers()?)
        .map_err(|err| key_derivation_error(format!("channel key at {}: {}", path, err)))?;
    Ok(ChannelKeyPair::from_secret_key(secp_ctx, xpriv.private_key))
}

/// Derive the payment key pair used by the commitment output scripts
pub fn derive_payment_key(
    secp_ctx: &Secp256k1<secp256k1::All>,
    root: &Xpriv,
    path: &ChannelPath,
) -> Result<ChannelKeyPair, Status> {
    let xpriv = root
        .derive_priv(secp_ctx, &path.payment_child_numbers()?)
        .map_err(|err| key_derivation_error(format!("payment key at {}: {}", path, err)))?;
    Ok(ChannelKeyPair::from_secret_key(secp_ctx, xpriv.private_key))
}

/// The counterparty's channel public key, from its root public key
pub fn derive_counterparty_channel_key(
    secp_ctx: &Secp256k1<secp256k1::All>,
    root: &Xpub,
    path: &ChannelPath,
) -> Result<PublicKey, Status> {
    let xpub = root
        .derive_pub(secp_ctx, &path.child_numbers()?)
        .map_err(|err| key_derivation_error(format!("counterparty key at {}: {}", path, err)))?;
    Ok(xpub.public_key)
}

/// The counterparty's payment public key, from its root public key
pub fn derive_counterparty_payment_key(
    secp_ctx: &Secp256k1<secp256k1::All>,
    root: &Xpub,
    path: &ChannelPath,
) -> Result<PublicKey, Status> {
    let xpub = root.derive_pub(secp_ctx, &path.payment_child_numbers()?).map_err(|err| {
        key_derivation_error(format!("counterparty payment key at {}: {}", path, err))
    })?;
    Ok(xpub.public_key)
}

/// Parse a serialized extended private key
pub fn parse_root_xpriv(s: &str) -> Result<Xpriv, Status> {
    Xpriv::from_str(s).map_err(|err| key_derivation_error(format!("root key: {}", err)))
}

/// Parse a serialized extended public key
pub fn parse_root_xpub(s: &str) -> Result<Xpub, Status> {
    Xpub::from_str(s).map_err(|err| key_derivation_error(format!("counterparty root key: {}", err)))
}

/// One party's signing identity for one channel
pub struct ChannelIdentity {
    root: Xpriv,
    path: ChannelPath,
    channel_key: ChannelKeyPair,
    payment_key: ChannelKeyPair,
    counterparty_channel_pubkey: PublicKey,
    counterparty_payment_pubkey: PublicKey,
}

impl ChannelIdentity {
    /// Derive both parties' channel keys at `path`
    pub fn derive(
        secp_ctx: &Secp256k1<secp256k1::All>,
        root: Xpriv,
        counterparty_root: &Xpub,
        path: ChannelPath,
    ) -> Result<Self, Status> {
        Ok(ChannelIdentity {
            channel_key: derive_channel_key(secp_ctx, &root, &path)?,
            payment_key: derive_payment_key(secp_ctx, &root, &path)?,
            counterparty_channel_pubkey: derive_counterparty_channel_key(
                secp_ctx,
                counterparty_root,
                &path,
            )?,
            counterparty_payment_pubkey: derive_counterparty_payment_key(
                secp_ctx,
                counterparty_root,
                &path,
            )?,
            root,
            path,
        })
    }

    /// The derivation path, fixed for the life of the channel
    pub fn path(&self) -> &ChannelPath {
        &self.path
    }

    /// The public key of the root this identity was derived from
    pub fn root_xpub(&self, secp_ctx: &Secp256k1<secp256k1::All>) -> Xpub {
        Xpub::from_priv(secp_ctx, &self.root)
    }

    /// The key signing the funding multisig
    pub fn channel_key(&self) -> &ChannelKeyPair {
        &self.channel_key
    }

    /// The key named by this party's commitment output scripts
    pub fn payment_key(&self) -> &ChannelKeyPair {
        &self.payment_key
    }

    /// The counterparty's multisig key
    pub fn counterparty_channel_pubkey(&self) -> &PublicKey {
        &self.counterparty_channel_pubkey
    }

    /// The counterparty's payment key
    pub fn counterparty_payment_pubkey(&self) -> &PublicKey {
        &self.counterparty_payment_pubkey
    }
}

impl fmt::Debug for ChannelIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelIdentity")
            .field("root", &Redacted)
            .field("path", &self.path)
            .field("channel_key", &self.channel_key)
            .field("payment_key", &self.payment_key)
            .field("counterparty_channel_pubkey", &self.counterparty_channel_pubkey)
            .field("counterparty_payment_pubkey", &self.counterparty_payment_pubkey)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::status::Code;
    use crate::util::test_utils::*;
    use bitcoin::secp256k1::rand::rngs::StdRng;
    use bitcoin::secp256k1::rand::SeedableRng;
    use test_log::test;

    #[test]
    fn path_parse_test() {
        let path: ChannelPath = "m/1/1".parse().unwrap();
        assert_eq!((path.x(), path.y()), (1, 1));
        assert_eq!(path.to_string(), "m/1/1");
        let path: ChannelPath = "m/2147483646/5".parse().unwrap();
        assert_eq!(path.x(), MAX_PATH_INDEX);

        for bad in [
            "", "m", "m/1", "m/1/2/3", "n/1/2", "m/0/1", "m/1/0", "m/2147483647/1", "m/1'/2",
            "m/+1/2", "m/1/-2", "m/x/y", "m/1//2", "m/99999999999/1",
        ] {
            let err = ChannelPath::from_str(bad).unwrap_err();
            assert_eq!(err.code(), Code::InvalidPath, "{}", bad);
        }
        assert_eq!(ChannelPath::new(0, 1).unwrap_err().code(), Code::InvalidPath);
        assert_eq!(ChannelPath::new(1, MAX_PATH_INDEX + 1).unwrap_err().code(), Code::InvalidPath);
    }

    #[test]
    fn path_serde_test() {
        let path = ChannelPath::new(12, 34).unwrap();
        let json = serde_json::to_string(&path).unwrap();
        assert_eq!(json, "\"m/12/34\"");
        assert_eq!(serde_json::from_str::<ChannelPath>(&json).unwrap(), path);
        assert!(serde_json::from_str::<ChannelPath>("\"m/0/34\"").is_err());
    }

    #[test]
    fn random_path_test() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut distinct = 0;
        for _ in 0..1000 {
            let path = ChannelPath::random(&mut rng);
            assert!(path.x() >= MIN_PATH_INDEX && path.x() <= MAX_PATH_INDEX);
            assert!(path.y() >= MIN_PATH_INDEX && path.y() <= MAX_PATH_INDEX);
            if path.x() != path.y() {
                distinct += 1;
            }
            // every random path is also a valid parsed path
            assert_eq!(path.to_string().parse::<ChannelPath>().unwrap(), path);
        }
        assert_eq!(distinct, 1000);
    }

    #[test]
    fn counterparty_derivation_matches_private_derivation() {
        let secp_ctx = Secp256k1::new();
        let alice_root = make_root(1);
        let bob_root = make_root(2);
        let bob_xpub = Xpub::from_priv(&secp_ctx, &bob_root);
        let path = ChannelPath::new(1, 1).unwrap();
        let bob_key = derive_channel_key(&secp_ctx, &bob_root, &path).unwrap();
        assert_eq!(
            derive_counterparty_channel_key(&secp_ctx, &bob_xpub, &path).unwrap(),
            bob_key.public_key()
        );
        let bob_payment = derive_payment_key(&secp_ctx, &bob_root, &path).unwrap();
        assert_eq!(
            derive_counterparty_payment_key(&secp_ctx, &bob_xpub, &path).unwrap(),
            bob_payment.public_key()
        );
        assert_ne!(bob_payment.public_key(), bob_key.public_key());

        let identity = ChannelIdentity::derive(&secp_ctx, alice_root, &bob_xpub, path).unwrap();
        assert_eq!(*identity.counterparty_channel_pubkey(), bob_key.public_key());
        assert_eq!(*identity.counterparty_payment_pubkey(), bob_payment.public_key());
        assert_eq!(identity.path(), &path);
        assert_eq!(identity.root_xpub(&secp_ctx), Xpub::from_priv(&secp_ctx, &alice_root));
        let dbg = format!("{:?}", identity);
        assert!(dbg.contains("<redacted>"));
        assert!(!dbg.contains("xprv"));
    }

    #[test]
    fn fixture_channel_keys_test() {
        let secp_ctx = Secp256k1::new();
        let root = parse_root_xpriv(FIXTURE_XPRV).unwrap();
        let counterparty_root = parse_root_xpub(FIXTURE_COUNTERPARTY_XPUB).unwrap();
        let path: ChannelPath = "m/1/1".parse().unwrap();
        let identity = ChannelIdentity::derive(&secp_ctx, root, &counterparty_root, path).unwrap();
        assert_eq!(
            identity.channel_key().public_key().to_string(),
            "0366bd67f5933b2dc5681ac12817cf5bd5b906c7eb5cfe27b87b220bf5b5fc2358"
        );
        assert_eq!(
            identity.counterparty_channel_pubkey().to_string(),
            "036ee6426d64de6f8f47898b7384f7bff74ac24e1ceaafffee4b42f758f0db7e4d"
        );
    }

    #[test]
    fn malformed_root_key_test() {
        assert_eq!(parse_root_xpriv("xprvnotakey").unwrap_err().code(), Code::KeyDerivationError);
        assert_eq!(parse_root_xpub("").unwrap_err().code(), Code::KeyDerivationError);
    }
}
