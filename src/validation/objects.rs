use bytes::Bytes;

use crate::git;
use crate::git::ObjectKind;
use crate::git::Tag;
use crate::hash::KeyId;
use crate::hash::ObjectHash;
use crate::push::PushNote;
use crate::state::KeyError;
use crate::state::KeyResolver;
use crate::state::LocalGitStore;
use crate::state::ObjectTransport;
use crate::txline;
use crate::txline::TxLineError;

use super::FieldError;
use super::ValidationError;

/// Reads `hash` from `store`, fetching it from peers on a miss. Fetched
/// objects must hash to `hash`; they are written to `store` and announced.
fn ensure_object(
    store: &dyn LocalGitStore,
    transport: &dyn ObjectTransport,
    repo: &str,
    index: usize,
    hash: &ObjectHash,
) -> Result<Bytes, ValidationError> {
    if store.has_object(repo, hash) {
        if let Some(raw) = store.object(repo, hash).map_err(ValidationError::Store)? {
            return Ok(raw);
        }
    }
    let raw = transport
        .fetch_object(repo, hash)
        .map_err(|source| ValidationError::Fetch {
            hash: *hash,
            source,
        })?;
    if git::object_hash(&raw) != *hash {
        return Err(FieldError::at(
            index,
            "objects",
            format!("fetched object does not match its hash {hash}"),
        )
        .into());
    }
    store
        .write_object(repo, hash, raw.clone())
        .map_err(ValidationError::Store)?;
    transport.announce(hash);
    tracing::debug!(repo, object = %hash, "fetched object");
    Ok(raw)
}

/// Makes every object listed by `note` available locally and checks that
/// their total size equals the note's declared size.
///
/// Fetch failures are returned as is; retrying belongs to the transport.
pub fn fetch_and_check_reference_objects(
    note: &PushNote,
    store: &dyn LocalGitStore,
    transport: &dyn ObjectTransport,
) -> Result<(), ValidationError> {
    let mut total: u64 = 0;
    for (index, reference) in note.references.iter().enumerate() {
        let hashes = reference
            .object_hashes()
            .map_err(|_| FieldError::at(index, "objects", "object hash is not valid"))?;
        for hash in &hashes {
            let raw = ensure_object(store, transport, &note.repo_name, index, hash)?;
            total += raw.len() as u64;
        }
    }
    if total != note.size {
        return Err(FieldError::new(
            "size",
            format!(
                "invalid size ({} bytes). actual object size ({total} bytes) is different",
                note.size
            ),
        )
        .into());
    }
    Ok(())
}

fn txline_error(index: usize, hash: &ObjectHash, kind: ObjectKind, err: TxLineError) -> FieldError {
    let message = match err {
        TxLineError::Missing => format!("{} ({hash}) is unsigned: txline was not set", kind.as_str()),
        TxLineError::BadSignature => format!("{} ({hash}) signature is not valid", kind.as_str()),
        other => format!("{} ({hash}): {other}", kind.as_str()),
    };
    FieldError::at(index, "new_hash", message)
}

/// Verifies the `tx:` trailer of a signed commit or tag.
///
/// The trailer must name `pusher_key` and carry a valid signature by that
/// key. An unsigned tag is accepted when the commit it points to is signed.
pub fn check_signed_object(
    store: &dyn LocalGitStore,
    keys: &dyn KeyResolver,
    repo: &str,
    index: usize,
    hash: &ObjectHash,
    pusher_key: &KeyId,
) -> Result<txline::TxLine, ValidationError> {
    let raw = store
        .object(repo, hash)
        .map_err(ValidationError::Store)?
        .ok_or_else(|| FieldError::at(index, "new_hash", format!("object ({hash}) not found")))?;
    let (kind, content) = git::split_raw(&raw)
        .map_err(|err| FieldError::at(index, "new_hash", format!("object ({hash}): {err}")))?;
    match kind {
        ObjectKind::Commit => verify_trailer(keys, index, hash, kind, content, pusher_key),
        ObjectKind::Tag => {
            if !matches!(txline::signed_message(content), Err(TxLineError::Missing)) {
                return verify_trailer(keys, index, hash, kind, content, pusher_key);
            }
            let tag = Tag::parse(content)
                .map_err(|err| FieldError::at(index, "new_hash", format!("tag ({hash}): {err}")))?;
            if tag.kind != ObjectKind::Commit {
                return Err(txline_error(index, hash, kind, TxLineError::Missing).into());
            }
            check_signed_object(store, keys, repo, index, &tag.object, pusher_key)
        }
        other => Err(FieldError::at(
            index,
            "new_hash",
            format!("reference must point to a commit or tag, not a {}", other.as_str()),
        )
        .into()),
    }
}

fn verify_trailer(
    keys: &dyn KeyResolver,
    index: usize,
    hash: &ObjectHash,
    kind: ObjectKind,
    content: &[u8],
    pusher_key: &KeyId,
) -> Result<txline::TxLine, ValidationError> {
    let (line, _) =
        txline::signed_message(content).map_err(|err| txline_error(index, hash, kind, err))?;
    if line.key_id != *pusher_key {
        return Err(FieldError::at(
            index,
            "new_hash",
            format!(
                "{} ({hash}) was signed by key {}, not the pusher's key",
                kind.as_str(),
                line.key_id
            ),
        )
        .into());
    }
    let key = keys.resolve_key(&line.key_id).map_err(|err| match err {
        KeyError::UnknownKey(id) => ValidationError::Field(FieldError::at(
            index,
            "new_hash",
            format!("signing key {id} is unknown"),
        )),
        KeyError::Other(err) => ValidationError::Store(err),
    })?;
    txline::verify(content, &key.public_key)
        .map_err(|err| txline_error(index, hash, kind, err).into())
}
