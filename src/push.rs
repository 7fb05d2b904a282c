//! Push notes and their endorsements.
//!
//! A [`PushNote`] proposes updates to one or more references of a repository.
//! It is created and signed by the node that received the `git push`, then
//! broadcast to the storers who check it and answer with a signed
//! [`PushEndorsement`].
//!
//! Field values are kept in the form they arrive in (hex strings, decimal fee
//! strings) so that syntax validation can point at the exact offending field.
//! Accessors such as [`PushedReference::old_object_hash`] parse them after
//! validation has succeeded.

use ed25519::signature::Signer;
use ed25519::Signature;
use ed25519_dalek::SignatureError;
use ed25519_dalek::SigningKey;
use ed25519_dalek::Verifier;
use ed25519_dalek::VerifyingKey;
use hex::FromHexError;

use crate::codec::DecodeError;
use crate::codec::Decoder;
use crate::codec::Encoder;
use crate::hash::Address;
use crate::hash::KeyId;
use crate::hash::NoteId;
use crate::hash::ObjectHash;

pub const BRANCH_PREFIX: &str = "refs/heads/";
pub const TAG_PREFIX: &str = "refs/tags/";
pub const NOTE_PREFIX: &str = "refs/notes/";

/// Returns true if `name` names a branch.
pub fn is_branch(name: &str) -> bool {
    name.starts_with(BRANCH_PREFIX)
}

/// Returns true if `name` names a tag.
pub fn is_tag(name: &str) -> bool {
    name.starts_with(TAG_PREFIX)
}

/// Returns true if `name` names a git note reference.
pub fn is_note(name: &str) -> bool {
    name.starts_with(NOTE_PREFIX)
}

/// A single reference update inside a push note.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PushedReference {
    pub name: String,
    pub old_hash: String,
    pub new_hash: String,
    /// The reference's own sequence number.
    pub nonce: u64,
    pub account_nonce: u64,
    /// Decimal fee paid for this update.
    pub fee: String,
    /// Objects introduced by this update.
    pub objects: Vec<String>,
    /// Set when the update claims to execute an accepted merge proposal.
    pub merge_proposal_id: Option<String>,
}

impl PushedReference {
    pub fn old_object_hash(&self) -> Result<ObjectHash, FromHexError> {
        ObjectHash::from_hex(&self.old_hash)
    }

    pub fn new_object_hash(&self) -> Result<ObjectHash, FromHexError> {
        ObjectHash::from_hex(&self.new_hash)
    }

    pub fn object_hashes(&self) -> Result<Vec<ObjectHash>, FromHexError> {
        self.objects.iter().map(|h| ObjectHash::from_hex(h)).collect()
    }

    pub fn fee_value(&self) -> Option<u64> {
        self.fee.parse().ok()
    }

    /// A push with an all-zero new hash deletes the reference.
    pub fn is_deletion(&self) -> bool {
        self.new_object_hash().is_ok_and(|h| h.is_zero())
    }

    fn encode_into(&self, enc: &mut Encoder) {
        enc.str(&self.name)
            .str(&self.old_hash)
            .str(&self.new_hash)
            .u64(self.nonce)
            .u64(self.account_nonce)
            .str(&self.fee)
            .count(self.objects.len());
        for object in &self.objects {
            enc.str(object);
        }
        enc.str(self.merge_proposal_id.as_deref().unwrap_or(""));
    }

    fn decode_from(dec: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let name = dec.str()?;
        let old_hash = dec.str()?;
        let new_hash = dec.str()?;
        let nonce = dec.u64()?;
        let account_nonce = dec.u64()?;
        let fee = dec.str()?;
        let count = dec.count()?;
        let objects = (0..count).map(|_| dec.str()).collect::<Result<_, _>>()?;
        let merge_proposal_id = Some(dec.str()?).filter(|id| !id.is_empty());
        Ok(PushedReference {
            name,
            old_hash,
            new_hash,
            nonce,
            account_nonce,
            fee,
            objects,
            merge_proposal_id,
        })
    }
}

/// A signed proposal to update references of a repository.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PushNote {
    pub repo_name: String,
    pub references: Vec<PushedReference>,
    /// Raw push key id as transmitted. A well formed note carries exactly
    /// `KeyId` sized bytes.
    pub pusher_key_id: Vec<u8>,
    pub pusher_address: Address,
    /// Creation time in unix seconds.
    pub timestamp: i64,
    /// Sum of the byte length of all objects referenced by the note.
    pub size: u64,
    pub node_pub_key: Option<[u8; 32]>,
    pub node_sig: Vec<u8>,
}

impl PushNote {
    fn encode_with_sig(&self, sig: &[u8]) -> Vec<u8> {
        let mut enc = Encoder::new();
        enc.str(&self.repo_name).count(self.references.len());
        for reference in &self.references {
            reference.encode_into(&mut enc);
        }
        enc.bytes(&self.pusher_key_id)
            .fixed(self.pusher_address.as_bytes())
            .i64(self.timestamp)
            .u64(self.size)
            .fixed(&self.node_pub_key.unwrap_or([0; 32]))
            .bytes(sig);
        enc.finish()
    }

    /// Encoding with the signature field emptied; this is what the creating
    /// node signs and what the note id is derived from.
    pub fn bytes_for_signing(&self) -> Vec<u8> {
        self.encode_with_sig(&[])
    }

    pub fn encode(&self) -> Vec<u8> {
        self.encode_with_sig(&self.node_sig)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut dec = Decoder::new(bytes);
        let note = Self::decode_from(&mut dec)?;
        dec.finish()?;
        Ok(note)
    }

    pub(crate) fn decode_from(dec: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let repo_name = dec.str()?;
        let count = dec.count()?;
        let references = (0..count)
            .map(|_| PushedReference::decode_from(dec))
            .collect::<Result<_, _>>()?;
        let pusher_key_id = dec.bytes()?;
        let pusher_address = Address(dec.fixed()?);
        let timestamp = dec.i64()?;
        let size = dec.u64()?;
        let node_pub_key = Some(dec.fixed::<32>()?).filter(|k| k != &[0; 32]);
        let node_sig = dec.bytes()?;
        Ok(PushNote {
            repo_name,
            references,
            pusher_key_id,
            pusher_address,
            timestamp,
            size,
            node_pub_key,
            node_sig,
        })
    }

    pub fn id(&self) -> NoteId {
        NoteId(*blake3::hash(&self.bytes_for_signing()).as_bytes())
    }

    /// The push key id, if it is correctly sized.
    pub fn key_id(&self) -> Option<KeyId> {
        <[u8; 20]>::try_from(self.pusher_key_id.as_slice())
            .ok()
            .map(KeyId)
    }

    /// Sum of all reference fees, `None` if a fee is not numeric or the sum
    /// overflows.
    pub fn total_fee(&self) -> Option<u64> {
        self.references
            .iter()
            .try_fold(0u64, |acc, r| acc.checked_add(r.fee_value()?))
    }

    pub fn reference(&self, name: &str) -> Option<&PushedReference> {
        self.references.iter().find(|r| r.name == name)
    }

    /// Signs the note as the creating node.
    pub fn sign(&mut self, node_key: &SigningKey) {
        self.node_pub_key = Some(node_key.verifying_key().to_bytes());
        let signature = node_key.sign(&self.bytes_for_signing());
        self.node_sig = signature.to_bytes().to_vec();
    }

    pub fn verify_signature(&self) -> Result<(), SignatureError> {
        let key = self.node_pub_key.ok_or_else(SignatureError::new)?;
        let key = VerifyingKey::from_bytes(&key)?;
        let signature = Signature::from_slice(&self.node_sig)?;
        key.verify(&self.bytes_for_signing(), &signature)
    }
}

/// A quorum member's signed attestation that a push note is valid.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PushEndorsement {
    pub note_id: Option<NoteId>,
    /// Primary public key of the endorsing storer.
    pub sender_pub_key: Option<[u8; 32]>,
    /// Signature made with the storer's secondary key.
    pub signature: Vec<u8>,
}

const ENDORSEMENT_DOMAIN: &[u8] = b"pushnet/endorsement/v1";

impl PushEndorsement {
    pub fn new(note_id: NoteId, sender_pub_key: [u8; 32], secondary_key: &SigningKey) -> Self {
        let mut endorsement = PushEndorsement {
            note_id: Some(note_id),
            sender_pub_key: Some(sender_pub_key),
            signature: Vec::new(),
        };
        endorsement.signature = secondary_key.sign(&endorsement.message()).to_bytes().to_vec();
        endorsement
    }

    /// The canonical message a storer signs when endorsing a note.
    pub fn message(&self) -> Vec<u8> {
        let mut enc = Encoder::new();
        enc.fixed(ENDORSEMENT_DOMAIN)
            .fixed(self.note_id.unwrap_or_default().as_bytes())
            .fixed(&self.sender_pub_key.unwrap_or([0; 32]));
        enc.finish()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Encoder::new();
        self.encode_into(&mut enc);
        enc.finish()
    }

    pub(crate) fn encode_into(&self, enc: &mut Encoder) {
        enc.fixed(self.note_id.unwrap_or_default().as_bytes())
            .fixed(&self.sender_pub_key.unwrap_or([0; 32]))
            .bytes(&self.signature);
    }

    pub(crate) fn decode_from(dec: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let note_id = Some(NoteId(dec.fixed()?)).filter(|id| id.0 != [0; 32]);
        let sender_pub_key = Some(dec.fixed::<32>()?).filter(|k| k != &[0; 32]);
        let signature = dec.bytes()?;
        Ok(PushEndorsement {
            note_id,
            sender_pub_key,
            signature,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    fn note() -> PushNote {
        PushNote {
            repo_name: "repo1".into(),
            references: vec![PushedReference {
                name: "refs/heads/master".into(),
                old_hash: "0".repeat(40),
                new_hash: "a".repeat(40),
                nonce: 1,
                account_nonce: 1,
                fee: "10".into(),
                objects: vec!["a".repeat(40)],
                merge_proposal_id: None,
            }],
            pusher_key_id: vec![1; 20],
            timestamp: 1_700_000_000,
            size: 12,
            ..Default::default()
        }
    }

    #[test]
    fn signature_verifies_and_detects_tampering() {
        let key = SigningKey::generate(&mut OsRng);
        let mut note = note();
        note.sign(&key);
        note.verify_signature().expect("valid signature");

        note.size += 1;
        assert!(note.verify_signature().is_err());
    }

    #[test]
    fn id_ignores_signature() {
        let key = SigningKey::generate(&mut OsRng);
        let mut signed = note();
        signed.sign(&key);
        let mut unsigned = signed.clone();
        unsigned.node_sig.clear();
        assert_eq!(signed.id(), unsigned.id());
    }

    #[test]
    fn decode_restores_note() {
        let key = SigningKey::generate(&mut OsRng);
        let mut note = note();
        note.references[0].merge_proposal_id = Some("1".into());
        note.sign(&key);
        assert_eq!(PushNote::decode(&note.encode()).unwrap(), note);
    }

    #[test]
    fn total_fee_rejects_non_numeric() {
        let mut note = note();
        assert_eq!(note.total_fee(), Some(10));
        note.references[0].fee = "1.5".into();
        assert_eq!(note.total_fee(), None);
    }

    #[test]
    fn ref_kinds() {
        assert!(is_branch("refs/heads/dev"));
        assert!(is_tag("refs/tags/v1"));
        assert!(is_note("refs/notes/review"));
        assert!(!is_branch("refs/tags/v1"));
    }
}
