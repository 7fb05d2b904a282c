//! Push note validation.
//!
//! A push note passes through these checks before a node endorses it:
//!
//! 1. [`check_push_note_syntax`]: shape of every field, timestamp bounds and
//!    the creating node's signature. No ledger access.
//! 2. [`check_push_note_consistency`]: the note against confirmed ledger
//!    state (repository, pusher key and account, nonces, old hashes).
//! 3. [`fetch_and_check_reference_objects`]: every listed object is present
//!    locally or fetched from peers, and their sizes add up to the declared
//!    note size.
//! 4. [`check_signed_object`] on each reference tip: the object carries a
//!    valid `tx:` trailer signed by the pusher's key.
//! 5. [`check_merge_compliance`] for references executing a merge proposal.
//!
//! [`PushNoteValidator`] runs them in that order. Every rejection is a
//! [`FieldError`] naming the offending field and, for per-reference checks,
//! the reference index.

mod merge;
mod objects;

use std::sync::Arc;

use hifitime::Epoch;

use crate::config::ValidatorConfig;
use crate::hash::is_object_hash_hex;
use crate::hash::ObjectHash;
use crate::push::PushNote;
use crate::push::PushedReference;
use crate::state::KeyError;
use crate::state::KeyResolver;
use crate::state::LedgerState;
use crate::state::LocalGitStore;
use crate::state::ObjectTransport;
use crate::state::Repository;

pub use merge::check_merge_compliance;
pub use objects::check_signed_object;
pub use objects::fetch_and_check_reference_objects;

/// A validation failure tied to a field of the checked value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub field: String,
    /// Position of the offending element when the field is a list entry.
    pub index: Option<usize>,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        FieldError {
            field: field.into(),
            index: None,
            message: message.into(),
        }
    }

    pub fn at(index: usize, field: impl Into<String>, message: impl Into<String>) -> Self {
        FieldError {
            field: field.into(),
            index: Some(index),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for FieldError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.index {
            Some(index) => write!(
                f,
                "index:{index}, field:{}, msg:{}",
                self.field, self.message
            ),
            None => write!(f, "field:{}, msg:{}", self.field, self.message),
        }
    }
}

impl std::error::Error for FieldError {}

#[derive(Debug)]
pub enum ValidationError {
    /// The note was rejected.
    Field(FieldError),
    /// An object could not be fetched from peers.
    Fetch {
        hash: ObjectHash,
        source: anyhow::Error,
    },
    /// A collaborator failed while being queried or written to.
    Store(anyhow::Error),
    /// The wall clock could not be read.
    Clock(String),
}

impl ValidationError {
    /// The field error, if this is a rejection.
    pub fn field(&self) -> Option<&FieldError> {
        match self {
            ValidationError::Field(err) => Some(err),
            _ => None,
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::Field(err) => write!(f, "{err}"),
            ValidationError::Fetch { hash, source } => {
                write!(f, "failed to fetch object {hash}: {source}")
            }
            ValidationError::Store(err) => write!(f, "state lookup failed: {err}"),
            ValidationError::Clock(err) => write!(f, "system time unavailable: {err}"),
        }
    }
}

impl std::error::Error for ValidationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ValidationError::Field(err) => Some(err),
            ValidationError::Fetch { source, .. } => Some(source.as_ref()),
            ValidationError::Store(err) => Some(err.as_ref()),
            ValidationError::Clock(_) => None,
        }
    }
}

impl From<FieldError> for ValidationError {
    fn from(err: FieldError) -> Self {
        Self::Field(err)
    }
}

fn check_reference_syntax(index: usize, reference: &PushedReference) -> Result<(), FieldError> {
    if reference.name.is_empty() {
        return Err(FieldError::at(index, "name", "name is required"));
    }
    if !is_object_hash_hex(&reference.old_hash) {
        return Err(FieldError::at(index, "old_hash", "old hash is not valid"));
    }
    if !is_object_hash_hex(&reference.new_hash) {
        return Err(FieldError::at(index, "new_hash", "new hash is not valid"));
    }
    if reference.nonce == 0 {
        return Err(FieldError::at(
            index,
            "nonce",
            "reference nonce must be greater than zero",
        ));
    }
    if reference.account_nonce == 0 {
        return Err(FieldError::at(
            index,
            "account_nonce",
            "account nonce must be greater than zero",
        ));
    }
    if reference.fee_value().is_none() {
        return Err(FieldError::at(index, "fee", "fee must be numeric"));
    }
    if let Some(bad) = reference.objects.iter().find(|h| !is_object_hash_hex(h)) {
        return Err(FieldError::at(
            index,
            "objects",
            format!("object hash {bad:?} is not valid"),
        ));
    }
    Ok(())
}

/// Checks the shape of `note` without consulting the ledger. `now` is the
/// current time in unix seconds.
pub fn check_push_note_syntax(
    note: &PushNote,
    now: i64,
    config: &ValidatorConfig,
) -> Result<(), FieldError> {
    if note.repo_name.is_empty() {
        return Err(FieldError::new("repo", "repo name is required"));
    }
    if note.references.is_empty() {
        return Err(FieldError::new(
            "references",
            "at least one reference is required",
        ));
    }
    for (index, reference) in note.references.iter().enumerate() {
        check_reference_syntax(index, reference)?;
    }

    if note.pusher_key_id.is_empty() {
        return Err(FieldError::new("pusher_key_id", "push key id is required"));
    }
    if note.key_id().is_none() {
        return Err(FieldError::new("pusher_key_id", "push key id is not valid"));
    }

    if note.timestamp == 0 {
        return Err(FieldError::new("timestamp", "timestamp is required"));
    }
    let max_drift = config.max_future_drift.as_secs() as i64;
    if note.timestamp > now.saturating_add(max_drift) {
        return Err(FieldError::new(
            "timestamp",
            "timestamp cannot be a future time",
        ));
    }
    let max_age = config.max_note_age.as_secs() as i64;
    if note.timestamp < now.saturating_sub(max_age) {
        return Err(FieldError::new("timestamp", "timestamp is too old"));
    }

    if note.node_pub_key.is_none() {
        return Err(FieldError::new(
            "node_pub_key",
            "push node public key is required",
        ));
    }
    if note.node_sig.is_empty() {
        return Err(FieldError::new("node_sig", "push node signature is required"));
    }
    if note.verify_signature().is_err() {
        return Err(FieldError::new("node_sig", "failed to verify signature"));
    }
    Ok(())
}

/// Checks a single pushed reference against the repository's confirmed
/// state.
///
/// A zero old hash creates the reference and needs no prior state; any other
/// old hash must be the reference's current hash. The reference nonce must
/// follow the recorded one (zero for unknown references).
pub fn check_pushed_reference(
    repository: &Repository,
    index: usize,
    reference: &PushedReference,
) -> Result<(), FieldError> {
    let old_hash = reference
        .old_object_hash()
        .map_err(|_| FieldError::at(index, "old_hash", "old hash is not valid"))?;
    let state = repository.references.get(&reference.name);
    if !old_hash.is_zero() {
        let Some(state) = state else {
            return Err(FieldError::at(index, "name", "unknown reference"));
        };
        if state.hash != old_hash {
            return Err(FieldError::at(
                index,
                "old_hash",
                format!(
                    "old hash does not match current reference hash ({})",
                    state.hash
                ),
            ));
        }
    }

    let expected = state.map_or(0, |state| state.nonce) + 1;
    if reference.nonce != expected {
        return Err(FieldError::at(
            index,
            "nonce",
            format!(
                "reference has nonce '{}', expecting '{expected}'",
                reference.nonce
            ),
        ));
    }
    Ok(())
}

/// Checks `note` against confirmed ledger state.
pub fn check_push_note_consistency(
    note: &PushNote,
    ledger: &dyn LedgerState,
    keys: &dyn KeyResolver,
) -> Result<(), ValidationError> {
    let repository = ledger
        .repository(&note.repo_name)
        .map_err(ValidationError::Store)?
        .ok_or_else(|| {
            FieldError::new(
                "repo",
                format!("repository named '{}' is unknown", note.repo_name),
            )
        })?;

    let key_id = note
        .key_id()
        .ok_or_else(|| FieldError::new("pusher_key_id", "push key id is not valid"))?;
    let push_key = keys.resolve_key(&key_id).map_err(|err| match err {
        KeyError::UnknownKey(id) => ValidationError::Field(FieldError::new(
            "pusher_key_id",
            format!("pusher's public key id '{id}' is unknown"),
        )),
        KeyError::Other(err) => ValidationError::Store(err),
    })?;
    if push_key.address != note.pusher_address {
        return Err(FieldError::new(
            "pusher_address",
            "push key does not belong to pusher",
        )
        .into());
    }

    let account = ledger
        .account(&note.pusher_address)
        .map_err(ValidationError::Store)?
        .ok_or_else(|| FieldError::new("pusher_address", "pusher account not found"))?;
    let fee = note
        .total_fee()
        .ok_or_else(|| FieldError::new("fee", "total fee is not valid"))?;
    if account.balance < fee {
        return Err(FieldError::new(
            "fee",
            format!(
                "insufficient account balance to pay fee (balance: {}, fee: {fee})",
                account.balance
            ),
        )
        .into());
    }

    let expected_nonce = account.nonce + 1;
    for (index, reference) in note.references.iter().enumerate() {
        if reference.account_nonce != expected_nonce {
            return Err(FieldError::at(
                index,
                "account_nonce",
                format!(
                    "wrong account nonce '{}', expecting '{expected_nonce}'",
                    reference.account_nonce
                ),
            )
            .into());
        }
        check_pushed_reference(&repository, index, reference)?;
    }
    Ok(())
}

fn unix_now() -> Result<i64, ValidationError> {
    let now = Epoch::now().map_err(|err| ValidationError::Clock(err.to_string()))?;
    Ok(now.to_unix_seconds() as i64)
}

/// Runs the complete validation pipeline against a node's collaborators.
pub struct PushNoteValidator {
    config: ValidatorConfig,
    ledger: Arc<dyn LedgerState>,
    keys: Arc<dyn KeyResolver>,
    store: Arc<dyn LocalGitStore>,
    transport: Arc<dyn ObjectTransport>,
}

impl PushNoteValidator {
    pub fn new(
        config: ValidatorConfig,
        ledger: Arc<dyn LedgerState>,
        keys: Arc<dyn KeyResolver>,
        store: Arc<dyn LocalGitStore>,
        transport: Arc<dyn ObjectTransport>,
    ) -> Self {
        PushNoteValidator {
            config,
            ledger,
            keys,
            store,
            transport,
        }
    }

    /// Validates `note` against the current wall clock.
    pub fn validate(&self, note: &PushNote) -> Result<(), ValidationError> {
        self.validate_at(note, unix_now()?)
    }

    /// Validates `note` as if the current time were `now` (unix seconds).
    pub fn validate_at(&self, note: &PushNote, now: i64) -> Result<(), ValidationError> {
        check_push_note_syntax(note, now, &self.config)?;
        check_push_note_consistency(note, self.ledger.as_ref(), self.keys.as_ref())?;
        fetch_and_check_reference_objects(note, self.store.as_ref(), self.transport.as_ref())?;

        // Consistency established the key id is well formed.
        let key_id = note
            .key_id()
            .ok_or_else(|| FieldError::new("pusher_key_id", "push key id is not valid"))?;
        for (index, reference) in note.references.iter().enumerate() {
            if reference.is_deletion() {
                continue;
            }
            let tip = reference
                .new_object_hash()
                .map_err(|_| FieldError::at(index, "new_hash", "new hash is not valid"))?;
            check_signed_object(
                self.store.as_ref(),
                self.keys.as_ref(),
                &note.repo_name,
                index,
                &tip,
                &key_id,
            )?;
        }

        let needs_merge_check = note
            .references
            .iter()
            .any(|reference| reference.merge_proposal_id.is_some());
        if needs_merge_check {
            let repository = self
                .ledger
                .repository(&note.repo_name)
                .map_err(ValidationError::Store)?
                .unwrap_or_default();
            for (index, reference) in note.references.iter().enumerate() {
                if reference.merge_proposal_id.is_some() {
                    check_merge_compliance(&repository, note, index, self.store.as_ref())?;
                }
            }
        }
        tracing::debug!(repo = %note.repo_name, note = %note.id(), "push note is valid");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ReferenceState;
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;

    const NOW: i64 = 1_700_000_000;

    fn reference() -> PushedReference {
        PushedReference {
            name: "refs/heads/master".into(),
            old_hash: "0".repeat(40),
            new_hash: "a".repeat(40),
            nonce: 1,
            account_nonce: 1,
            fee: "1".into(),
            objects: vec![],
            merge_proposal_id: None,
        }
    }

    fn signed_note() -> PushNote {
        let mut note = PushNote {
            repo_name: "repo".into(),
            references: vec![reference()],
            pusher_key_id: vec![1; 20],
            timestamp: NOW,
            ..Default::default()
        };
        note.sign(&SigningKey::generate(&mut OsRng));
        note
    }

    fn syntax(note: &PushNote) -> Result<(), FieldError> {
        check_push_note_syntax(note, NOW, &ValidatorConfig::default())
    }

    #[test]
    fn well_formed_note_passes_syntax() {
        syntax(&signed_note()).unwrap();
    }

    #[test]
    fn reference_errors_carry_index() {
        let mut note = signed_note();
        let mut bad = reference();
        bad.fee = "ten".into();
        note.references.push(bad);
        note.sign(&SigningKey::generate(&mut OsRng));
        let err = syntax(&note).unwrap_err();
        assert_eq!(err.index, Some(1));
        assert_eq!(err.field, "fee");
        assert_eq!(err.to_string(), "index:1, field:fee, msg:fee must be numeric");
    }

    #[test]
    fn timestamp_bounds() {
        let config = ValidatorConfig::default();
        let note = signed_note();
        let err = check_push_note_syntax(&note, NOW - 1, &config).unwrap_err();
        assert_eq!(err.message, "timestamp cannot be a future time");
        let err = check_push_note_syntax(&note, NOW + 2 * 60 * 60, &config).unwrap_err();
        assert_eq!(err.message, "timestamp is too old");
    }

    #[test]
    fn tampered_note_fails_signature() {
        let mut note = signed_note();
        note.size += 1;
        assert_eq!(syntax(&note).unwrap_err().field, "node_sig");
    }

    #[test]
    fn short_key_id_is_rejected() {
        let mut note = signed_note();
        note.pusher_key_id = vec![1; 4];
        assert_eq!(
            syntax(&note).unwrap_err().message,
            "push key id is not valid"
        );
    }

    #[test]
    fn existing_reference_needs_matching_old_hash() {
        let mut repository = Repository::default();
        repository.references.insert(
            "refs/heads/master".into(),
            ReferenceState {
                nonce: 1,
                hash: ObjectHash([0xaa; 20]),
            },
        );
        let mut update = reference();
        update.old_hash = "bb".repeat(20);
        update.nonce = 2;
        let err = check_pushed_reference(&repository, 0, &update).unwrap_err();
        assert_eq!(err.field, "old_hash");

        update.old_hash = "aa".repeat(20);
        check_pushed_reference(&repository, 0, &update).unwrap();
    }
}
