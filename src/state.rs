//! Interfaces to the collaborators this pipeline consumes.
//!
//! The ledger, key store, object transport and local git storage are owned by
//! the surrounding node. They are reached only through the narrow traits in
//! this module, mirroring how storage backends plug in behind `BlobStore` and
//! `BranchStore` style seams. Collaborator failures are opaque to this crate
//! and are carried as [`anyhow::Error`].
//!
//! [`crate::memory`] provides in-memory implementations of every trait.

use std::collections::BTreeMap;

use bytes::Bytes;

use crate::git::Commit;
use crate::hash::Address;
use crate::hash::KeyId;
use crate::hash::ObjectHash;
use crate::tx::Transaction;

/// Ledger view of an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Account {
    pub nonce: u64,
    pub balance: u64,
}

/// Ledger view of a single reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReferenceState {
    pub nonce: u64,
    pub hash: ObjectHash,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProposalOutcome {
    #[default]
    Undecided,
    Accepted,
    Rejected,
}

/// The merge request recorded by a merge proposal.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MergeRequest {
    /// Short branch name, without `refs/heads/`.
    pub base_branch: String,
    pub base_branch_hash: ObjectHash,
    pub target_branch: String,
    /// When set, the merger commit's parent must be exactly this commit.
    pub target_hash: Option<ObjectHash>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Proposal {
    pub creator: Address,
    pub closed: bool,
    pub outcome: ProposalOutcome,
    pub merge: MergeRequest,
}

/// Ledger view of a repository.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Repository {
    pub references: BTreeMap<String, ReferenceState>,
    pub proposals: BTreeMap<String, Proposal>,
    /// Height of the last block that confirmed a push to this repository.
    pub updated_at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Block {
    pub height: u64,
    pub transactions: Vec<Transaction>,
}

/// Confirmed network state.
pub trait LedgerState: Send + Sync {
    fn account(&self, address: &Address) -> anyhow::Result<Option<Account>>;
    fn repository(&self, name: &str) -> anyhow::Result<Option<Repository>>;
    fn last_confirmed_height(&self) -> anyhow::Result<u64>;
    fn block(&self, height: u64) -> anyhow::Result<Option<Block>>;
}

/// A registered push key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushKey {
    pub public_key: [u8; 32],
    /// The account the key was registered for.
    pub address: Address,
}

#[derive(Debug)]
pub enum KeyError {
    UnknownKey(KeyId),
    Other(anyhow::Error),
}

impl std::fmt::Display for KeyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeyError::UnknownKey(id) => write!(f, "unknown key {id}"),
            KeyError::Other(err) => write!(f, "key lookup failed: {err}"),
        }
    }
}

impl std::error::Error for KeyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            KeyError::UnknownKey(_) => None,
            KeyError::Other(err) => Some(err.as_ref()),
        }
    }
}

pub trait KeyResolver: Send + Sync {
    fn resolve_key(&self, id: &KeyId) -> Result<PushKey, KeyError>;
}

/// Fetches git objects from peers.
pub trait ObjectTransport: Send + Sync {
    /// Fetches a raw git object (`<type> <size>\0<content>`). May fail
    /// transiently; retries belong to the implementation.
    fn fetch_object(&self, repo: &str, hash: &ObjectHash) -> anyhow::Result<Bytes>;

    /// Announces that this node now holds `hash`.
    fn announce(&self, hash: &ObjectHash);
}

/// Why the local receive path refused a reference update pack.
#[derive(Debug)]
pub enum ReceiveError {
    /// The pack was rejected as malformed.
    InvalidPack(String),
    /// The local receive process failed.
    Process(anyhow::Error),
}

impl std::fmt::Display for ReceiveError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReceiveError::InvalidPack(reason) => write!(f, "invalid pack: {reason}"),
            ReceiveError::Process(err) => write!(f, "receive failed: {err}"),
        }
    }
}

impl std::error::Error for ReceiveError {}

/// The node's local git storage.
pub trait LocalGitStore: Send + Sync {
    fn has_repository(&self, repo: &str) -> bool;
    fn init_repository(&self, repo: &str) -> anyhow::Result<()>;

    /// Current hash of `reference`, `None` if the reference does not exist.
    fn reference_hash(&self, repo: &str, reference: &str) -> anyhow::Result<Option<ObjectHash>>;

    fn has_object(&self, repo: &str, hash: &ObjectHash) -> bool;
    /// Raw git object bytes, `None` if absent.
    fn object(&self, repo: &str, hash: &ObjectHash) -> anyhow::Result<Option<Bytes>>;
    fn write_object(&self, repo: &str, hash: &ObjectHash, raw: Bytes) -> anyhow::Result<()>;

    /// Reads and parses a commit.
    fn commit(&self, repo: &str, hash: &ObjectHash) -> anyhow::Result<Option<Commit>> {
        match self.object(repo, hash)? {
            Some(raw) => Ok(Some(Commit::parse_raw(&raw)?)),
            None => Ok(None),
        }
    }

    /// Feeds a reference update request into the repository's receive path
    /// as if a normal push had occurred.
    fn apply_reference_update_pack(&self, repo: &str, pack: Bytes) -> Result<(), ReceiveError>;
}

/// A quorum eligible storer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Storer {
    pub public_key: [u8; 32],
    /// Declared secondary key used to sign endorsements. Kept raw since a
    /// storer may declare garbage.
    pub secondary_key: [u8; 32],
}

/// Ticket weighted storer ranking.
pub trait StorerSelector: Send + Sync {
    fn top_storers(&self, limit: usize) -> anyhow::Result<Vec<Storer>>;
}

/// The per-repository sync progress this node persists.
pub trait SyncHeightStore: Send + Sync {
    /// Repositories this node tracks.
    fn tracked(&self) -> Vec<String>;
    fn last_synced(&self, repo: &str) -> u64;
    fn set_last_synced(&self, repo: &str, height: u64);
}

/// Current on-chain account nonce of a sender.
pub trait NonceLookup: Send + Sync {
    fn account_nonce(&self, address: &Address) -> anyhow::Result<u64>;
}

impl<F> NonceLookup for F
where
    F: Fn(&Address) -> anyhow::Result<u64> + Send + Sync,
{
    fn account_nonce(&self, address: &Address) -> anyhow::Result<u64> {
        self(address)
    }
}
