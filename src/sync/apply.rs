//! Applying a confirmed reference update to local git storage.

use bytes::Bytes;

use crate::git;
use crate::hash::ObjectHash;
use crate::pack::PackError;
use crate::pack::RefCommand;
use crate::pack::ReferenceUpdateRequest;
use crate::state::LocalGitStore;
use crate::state::ObjectTransport;
use crate::state::ReceiveError;

use super::task::RefTask;
use super::SyncError;

#[derive(Debug)]
pub enum ApplyError {
    /// The request could not be built from the note.
    BuildPack(PackError),
    /// An object the update needs is not stored locally.
    MissingObject(ObjectHash),
    /// The note does not contain the task's reference.
    UnknownReference(String),
    /// The receive path rejected the pack as malformed.
    InvalidPack(String),
    /// The receive path failed.
    ReceiveFailed(anyhow::Error),
    Store(anyhow::Error),
}

impl std::fmt::Display for ApplyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApplyError::BuildPack(err) => write!(f, "failed to build packfile: {err}"),
            ApplyError::MissingObject(hash) => write!(f, "object {hash} is not available locally"),
            ApplyError::UnknownReference(name) => write!(f, "note does not update {name}"),
            ApplyError::InvalidPack(reason) => write!(f, "invalid packfile: {reason}"),
            ApplyError::ReceiveFailed(err) => write!(f, "receive-pack failed: {err}"),
            ApplyError::Store(err) => write!(f, "storage error: {err}"),
        }
    }
}

impl std::error::Error for ApplyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ApplyError::BuildPack(err) => Some(err),
            ApplyError::ReceiveFailed(err) | ApplyError::Store(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<PackError> for ApplyError {
    fn from(err: PackError) -> Self {
        Self::BuildPack(err)
    }
}

impl From<ReceiveError> for ApplyError {
    fn from(err: ReceiveError) -> Self {
        match err {
            ReceiveError::InvalidPack(reason) => Self::InvalidPack(reason),
            ReceiveError::Process(err) => Self::ReceiveFailed(err),
        }
    }
}

/// Builds the reference update request moving the task's reference from its
/// old to its new hash, carrying every object the note lists for it.
pub fn build_request(
    store: &dyn LocalGitStore,
    task: &RefTask,
) -> Result<ReferenceUpdateRequest, ApplyError> {
    let reference = task
        .note
        .reference(&task.reference)
        .ok_or_else(|| ApplyError::UnknownReference(task.reference.clone()))?;
    let hashes = reference
        .object_hashes()
        .map_err(|err| PackError::Malformed(err.to_string()))?;
    let objects = hashes
        .iter()
        .map(|hash| {
            store
                .object(&task.repo, hash)
                .map_err(ApplyError::Store)?
                .map(|raw| raw.to_vec())
                .ok_or(ApplyError::MissingObject(*hash))
        })
        .collect::<Result<_, _>>()?;
    Ok(ReferenceUpdateRequest {
        commands: vec![RefCommand {
            old: task.old_hash,
            new: task.new_hash,
            name: task.reference.clone(),
        }],
        objects,
    })
}

/// Applies the task's update by feeding a reference update pack into the
/// repository's receive path, as if the update had been pushed directly.
pub fn update_repo_using_note(store: &dyn LocalGitStore, task: &RefTask) -> Result<(), ApplyError> {
    let pack = build_request(store, task)?.encode()?;
    store.apply_reference_update_pack(&task.repo, Bytes::from(pack))?;
    Ok(())
}

/// Fetches the objects the note lists for the task's reference that are not
/// stored locally yet.
pub fn fetch_reference_objects(
    store: &dyn LocalGitStore,
    transport: &dyn ObjectTransport,
    task: &RefTask,
) -> Result<usize, SyncError> {
    let Some(reference) = task.note.reference(&task.reference) else {
        return Ok(0);
    };
    let hashes = reference
        .object_hashes()
        .map_err(|err| SyncError::Store(err.into()))?;
    let mut fetched = 0;
    for hash in hashes {
        if store.has_object(&task.repo, &hash) {
            continue;
        }
        let raw = transport
            .fetch_object(&task.repo, &hash)
            .map_err(|source| SyncError::Fetch { hash, source })?;
        if git::object_hash(&raw) != hash {
            return Err(SyncError::Fetch {
                hash,
                source: anyhow::anyhow!("peer served an object with a different hash"),
            });
        }
        store
            .write_object(&task.repo, &hash, raw)
            .map_err(SyncError::Store)?;
        transport.announce(&hash);
        fetched += 1;
    }
    Ok(fetched)
}
