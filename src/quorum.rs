//! Endorsement eligibility and signature checks.
//!
//! Storers answer a valid push note with a [`PushEndorsement`] signed by
//! their declared secondary key. This module establishes that a single
//! endorsement is well formed, comes from a current quorum member and is
//! signed correctly. Whether enough endorsements have accumulated is left to
//! the caller, who can count them per note with an [`EndorsementIndex`].

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::MutexGuard;

use ed25519::Signature;
use ed25519_dalek::Verifier;
use ed25519_dalek::VerifyingKey;

use crate::hash::NoteId;
use crate::push::PushEndorsement;
use crate::state::StorerSelector;
use crate::validation::FieldError;

#[derive(Debug)]
pub enum EndorsementError {
    Field(FieldError),
    /// The sender is not among the top ranked storers.
    NotAQuorumMember,
    /// The sender's declared secondary key is not a valid public key.
    BadSecondaryKey,
    BadSignature,
    /// The storer ranking could not be read.
    Selector(anyhow::Error),
}

impl std::fmt::Display for EndorsementError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EndorsementError::Field(err) => write!(f, "{err}"),
            EndorsementError::NotAQuorumMember => {
                write!(f, "sender is not one of the top push storers")
            }
            EndorsementError::BadSecondaryKey => {
                write!(f, "unable to decode the sender's secondary key")
            }
            EndorsementError::BadSignature => write!(f, "endorsement signature is not valid"),
            EndorsementError::Selector(err) => write!(f, "failed to get top storers: {err}"),
        }
    }
}

impl std::error::Error for EndorsementError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EndorsementError::Field(err) => Some(err),
            EndorsementError::Selector(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<FieldError> for EndorsementError {
    fn from(err: FieldError) -> Self {
        Self::Field(err)
    }
}

/// Checks that the endorsement names a note and a sender.
pub fn check_endorsement(endorsement: &PushEndorsement) -> Result<(), FieldError> {
    if endorsement.note_id.is_none() {
        return Err(FieldError::new("note_id", "push note id is required"));
    }
    if endorsement.sender_pub_key.is_none() {
        return Err(FieldError::new(
            "sender_pub_key",
            "sender public key is required",
        ));
    }
    Ok(())
}

/// Checks that the endorsement's sender is among the `quorum_size` top
/// storers and, unless `no_sig_check`, that it is signed by the sender's
/// declared secondary key.
pub fn check_endorsement_consistency(
    endorsement: &PushEndorsement,
    no_sig_check: bool,
    quorum_size: usize,
    selector: &dyn StorerSelector,
) -> Result<(), EndorsementError> {
    check_endorsement(endorsement)?;
    let storers = selector
        .top_storers(quorum_size)
        .map_err(EndorsementError::Selector)?;
    let sender = endorsement.sender_pub_key;
    let storer = storers
        .iter()
        .find(|storer| Some(storer.public_key) == sender)
        .ok_or(EndorsementError::NotAQuorumMember)?;

    let key = VerifyingKey::from_bytes(&storer.secondary_key)
        .map_err(|_| EndorsementError::BadSecondaryKey)?;
    if no_sig_check {
        return Ok(());
    }
    let signature = Signature::from_slice(&endorsement.signature)
        .map_err(|_| EndorsementError::BadSignature)?;
    key.verify(&endorsement.message(), &signature)
        .map_err(|_| EndorsementError::BadSignature)
}

/// Endorsements collected per push note, at most one per sender.
#[derive(Debug, Default)]
pub struct EndorsementIndex {
    notes: Mutex<HashMap<NoteId, Vec<PushEndorsement>>>,
}

impl EndorsementIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<NoteId, Vec<PushEndorsement>>> {
        self.notes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Records `endorsement`, returning false if it lacks a note id or its
    /// sender already endorsed the note.
    pub fn add(&self, endorsement: PushEndorsement) -> bool {
        let Some(note_id) = endorsement.note_id else {
            return false;
        };
        let mut notes = self.lock();
        let entries = notes.entry(note_id).or_default();
        if entries
            .iter()
            .any(|e| e.sender_pub_key == endorsement.sender_pub_key)
        {
            return false;
        }
        entries.push(endorsement);
        true
    }

    pub fn endorsements(&self, note_id: &NoteId) -> Vec<PushEndorsement> {
        self.lock().get(note_id).cloned().unwrap_or_default()
    }

    /// Number of distinct senders that endorsed the note.
    pub fn count(&self, note_id: &NoteId) -> usize {
        self.lock().get(note_id).map_or(0, Vec::len)
    }

    /// Public keys of the note's endorsers.
    pub fn endorsers(&self, note_id: &NoteId) -> HashSet<[u8; 32]> {
        self.lock()
            .get(note_id)
            .into_iter()
            .flatten()
            .filter_map(|e| e.sender_pub_key)
            .collect()
    }

    pub fn remove_note(&self, note_id: &NoteId) -> Option<Vec<PushEndorsement>> {
        self.lock().remove(note_id)
    }
}
