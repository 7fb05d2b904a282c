use crate::hash::ObjectHash;
use crate::push::is_branch;
use crate::push::PushNote;
use crate::push::BRANCH_PREFIX;
use crate::state::LocalGitStore;
use crate::state::ProposalOutcome;
use crate::state::Repository;

use super::FieldError;
use super::ValidationError;

fn merge_error(index: usize, message: impl std::fmt::Display) -> ValidationError {
    FieldError::at(index, "merge_proposal_id", format!("merge error: {message}")).into()
}

/// Checks that reference `index` of `note` executes its merge proposal
/// faithfully.
///
/// The proposal must be open, accepted and created by the pusher, and it must
/// target this branch at its current local hash. The pushed merger commit
/// may only record the resolution: it has exactly one parent and keeps that
/// parent's tree, author and committer. The merger commit and its parent are
/// read from `store`, so objects must have been fetched beforehand.
pub fn check_merge_compliance(
    repository: &Repository,
    note: &PushNote,
    index: usize,
    store: &dyn LocalGitStore,
) -> Result<(), ValidationError> {
    let Some(reference) = note.references.get(index) else {
        return Err(FieldError::at(index, "references", "reference does not exist").into());
    };
    let Some(proposal_id) = reference.merge_proposal_id.as_deref() else {
        return Ok(());
    };

    if !is_branch(&reference.name) {
        return Err(merge_error(index, "pushed reference must be a branch"));
    }
    let Some(proposal) = repository.proposals.get(proposal_id) else {
        return Err(merge_error(
            index,
            format!("merge proposal ({proposal_id}) not found"),
        ));
    };
    if proposal.creator != note.pusher_address {
        return Err(merge_error(
            index,
            "merge proposal can only be executed by its creator",
        ));
    }
    if proposal.closed {
        return Err(merge_error(index, "merge proposal is already closed"));
    }
    if proposal.outcome != ProposalOutcome::Accepted {
        return Err(merge_error(index, "merge proposal has not been accepted"));
    }

    let branch = &reference.name[BRANCH_PREFIX.len()..];
    if proposal.merge.base_branch != branch {
        return Err(merge_error(
            index,
            "pushed branch name and proposal base branch name must match",
        ));
    }
    let local_hash = store
        .reference_hash(&note.repo_name, &reference.name)
        .map_err(ValidationError::Store)?
        .unwrap_or(ObjectHash::ZERO);
    if proposal.merge.base_branch_hash != local_hash {
        return Err(merge_error(
            index,
            "base branch has changed since the proposal was accepted",
        ));
    }

    let merger_hash = reference
        .new_object_hash()
        .map_err(|_| FieldError::at(index, "new_hash", "new hash is not valid"))?;
    let merger = store
        .commit(&note.repo_name, &merger_hash)
        .map_err(ValidationError::Store)?
        .ok_or_else(|| merge_error(index, format!("merger commit ({merger_hash}) not found")))?;
    let &[parent_hash] = merger.parents.as_slice() else {
        return Err(merge_error(
            index,
            "merger commit must have exactly one parent",
        ));
    };
    let parent = store
        .commit(&note.repo_name, &parent_hash)
        .map_err(ValidationError::Store)?
        .ok_or_else(|| merge_error(index, format!("parent commit ({parent_hash}) not found")))?;

    if merger.tree != parent.tree
        || merger.author != parent.author
        || merger.committer != parent.committer
    {
        return Err(merge_error(
            index,
            "cannot modify history as seen from target commit",
        ));
    }
    if let Some(target_hash) = proposal.merge.target_hash {
        if parent_hash != target_hash {
            return Err(merge_error(
                index,
                "merger commit's parent is not the proposal's target commit",
            ));
        }
    }
    Ok(())
}
