//! Fixed-size identifiers used throughout the pipeline.
//!
//! Git objects are addressed by their 20 byte SHA-1 digest ([`ObjectHash`]),
//! everything the network signs (transactions, push notes) is addressed by a
//! 32 byte BLAKE3 digest of its canonical encoding. Accounts and push keys are
//! identified by the first 20 bytes of the BLAKE3 digest of their ed25519
//! public key.

use std::fmt;
use std::str::FromStr;

use ed25519_dalek::VerifyingKey;
use hex::FromHex;
use hex::FromHexError;

/// Length of a hex encoded git object hash.
pub const OBJECT_HASH_HEX_LEN: usize = 40;

/// A git object id (SHA-1).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ObjectHash(pub [u8; 20]);

impl ObjectHash {
    /// The all-zero hash git uses for "no object", e.g. the old side of a
    /// newly created reference.
    pub const ZERO: ObjectHash = ObjectHash([0; 20]);

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    pub fn from_hex(hex: &str) -> Result<Self, FromHexError> {
        Ok(ObjectHash(<[u8; 20]>::from_hex(hex)?))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl FromStr for ObjectHash {
    type Err = FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl fmt::Display for ObjectHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ObjectHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectHash({})", self.to_hex())
    }
}

/// Returns true if `s` is a syntactically valid hex object hash.
pub fn is_object_hash_hex(s: &str) -> bool {
    s.len() == OBJECT_HASH_HEX_LEN && s.bytes().all(|b| b.is_ascii_hexdigit())
}

macro_rules! digest_id {
    ($(#[$meta:meta])* $name:ident, $len:expr) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
        pub struct $name(pub [u8; $len]);

        impl $name {
            pub fn from_hex(hex: &str) -> Result<Self, FromHexError> {
                Ok($name(<[u8; $len]>::from_hex(hex)?))
            }

            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }

            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.to_hex())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.to_hex())
            }
        }
    };
}

digest_id!(
    /// Identity of a signed transaction (BLAKE3 over its full encoding).
    TxHash,
    32
);
digest_id!(
    /// Identity of a push note (BLAKE3 over its canonical encoding).
    NoteId,
    32
);
digest_id!(
    /// An account address derived from an ed25519 public key.
    Address,
    20
);
digest_id!(
    /// The identifier of a registered push key.
    KeyId,
    20
);

fn key_digest(key: &VerifyingKey) -> [u8; 20] {
    let digest = blake3::hash(key.as_bytes());
    let mut out = [0; 20];
    out.copy_from_slice(&digest.as_bytes()[..20]);
    out
}

impl Address {
    pub fn from_public_key(key: &VerifyingKey) -> Self {
        Address(key_digest(key))
    }
}

impl KeyId {
    /// Push key ids share the derivation of account addresses but live in a
    /// separate namespace so a key id can never be confused for an address.
    pub fn from_public_key(key: &VerifyingKey) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"pushkey");
        hasher.update(key.as_bytes());
        let mut out = [0; 20];
        out.copy_from_slice(&hasher.finalize().as_bytes()[..20]);
        KeyId(out)
    }
}

/// Generates random non-zero object hashes for property tests.
#[cfg(feature = "proptest")]
#[derive(Debug)]
pub struct RandObjectHash;

#[cfg(feature = "proptest")]
pub struct ObjectHashValueTree(ObjectHash);

#[cfg(feature = "proptest")]
impl proptest::strategy::Strategy for RandObjectHash {
    type Tree = ObjectHashValueTree;
    type Value = ObjectHash;

    fn new_tree(
        &self,
        runner: &mut proptest::test_runner::TestRunner,
    ) -> proptest::strategy::NewTree<Self> {
        use rand::RngCore;

        let mut hash = [0; 20];
        while hash == [0; 20] {
            runner.rng().fill_bytes(&mut hash);
        }
        Ok(ObjectHashValueTree(ObjectHash(hash)))
    }
}

#[cfg(feature = "proptest")]
impl proptest::strategy::ValueTree for ObjectHashValueTree {
    type Value = ObjectHash;

    fn simplify(&mut self) -> bool {
        false
    }
    fn complicate(&mut self) -> bool {
        false
    }
    fn current(&self) -> ObjectHash {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;

    #[test]
    fn object_hash_hex() {
        let hex = "0123456789abcdef0123456789abcdef01234567";
        let hash: ObjectHash = hex.parse().unwrap();
        assert_eq!(hash.to_hex(), hex);
        assert!(!hash.is_zero());
        assert!(ObjectHash::from_hex(&"0".repeat(40)).unwrap().is_zero());
    }

    #[test]
    fn object_hash_hex_check() {
        assert!(is_object_hash_hex(&"a".repeat(40)));
        assert!(!is_object_hash_hex(&"a".repeat(39)));
        assert!(!is_object_hash_hex(&"g".repeat(40)));
    }

    #[test]
    fn key_id_and_address_differ() {
        let key = SigningKey::generate(&mut OsRng).verifying_key();
        assert_ne!(Address::from_public_key(&key).0, KeyId::from_public_key(&key).0);
    }
}
