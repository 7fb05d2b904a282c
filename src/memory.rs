//! In-memory implementations of the collaborator traits in [`crate::state`].
//!
//! Useful for unit tests, simulations and ephemeral nodes where persistence
//! is not required. Every type is internally synchronised so it can be shared
//! behind an `Arc` by concurrent workers.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::MutexGuard;

use anyhow::anyhow;
use bytes::Bytes;

use crate::git;
use crate::hash::Address;
use crate::hash::KeyId;
use crate::hash::ObjectHash;
use crate::pack::ReferenceUpdateRequest;
use crate::state::Account;
use crate::state::Block;
use crate::state::KeyError;
use crate::state::KeyResolver;
use crate::state::LedgerState;
use crate::state::LocalGitStore;
use crate::state::ObjectTransport;
use crate::state::PushKey;
use crate::state::ReceiveError;
use crate::state::Repository;
use crate::state::Storer;
use crate::state::StorerSelector;
use crate::state::SyncHeightStore;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Default)]
struct LedgerInner {
    accounts: HashMap<Address, Account>,
    repositories: HashMap<String, Repository>,
    blocks: BTreeMap<u64, Block>,
}

/// A ledger held in memory. The confirmed height is the highest block added.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    inner: Mutex<LedgerInner>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_account(&self, address: Address, account: Account) {
        lock(&self.inner).accounts.insert(address, account);
    }

    pub fn set_repository(&self, name: impl Into<String>, repository: Repository) {
        lock(&self.inner).repositories.insert(name.into(), repository);
    }

    /// Applies `f` to the named repository, creating it if absent.
    pub fn update_repository(&self, name: &str, f: impl FnOnce(&mut Repository)) {
        let mut inner = lock(&self.inner);
        f(inner.repositories.entry(name.to_owned()).or_default());
    }

    pub fn add_block(&self, block: Block) {
        lock(&self.inner).blocks.insert(block.height, block);
    }
}

impl LedgerState for MemoryLedger {
    fn account(&self, address: &Address) -> anyhow::Result<Option<Account>> {
        Ok(lock(&self.inner).accounts.get(address).copied())
    }

    fn repository(&self, name: &str) -> anyhow::Result<Option<Repository>> {
        Ok(lock(&self.inner).repositories.get(name).cloned())
    }

    fn last_confirmed_height(&self) -> anyhow::Result<u64> {
        Ok(lock(&self.inner)
            .blocks
            .keys()
            .next_back()
            .copied()
            .unwrap_or(0))
    }

    fn block(&self, height: u64) -> anyhow::Result<Option<Block>> {
        Ok(lock(&self.inner).blocks.get(&height).cloned())
    }
}

/// Registered push keys by id.
#[derive(Debug, Default)]
pub struct MemoryKeys {
    keys: Mutex<HashMap<KeyId, PushKey>>,
}

impl MemoryKeys {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `key` and returns its id.
    pub fn register(&self, key: PushKey) -> anyhow::Result<KeyId> {
        let verifying = ed25519_dalek::VerifyingKey::from_bytes(&key.public_key)?;
        let id = KeyId::from_public_key(&verifying);
        lock(&self.keys).insert(id, key);
        Ok(id)
    }
}

impl KeyResolver for MemoryKeys {
    fn resolve_key(&self, id: &KeyId) -> Result<PushKey, KeyError> {
        lock(&self.keys)
            .get(id)
            .copied()
            .ok_or(KeyError::UnknownKey(*id))
    }
}

#[derive(Debug, Default)]
struct TransportInner {
    objects: HashMap<ObjectHash, Bytes>,
    failing: bool,
    fetches: usize,
    announced: Vec<ObjectHash>,
}

/// A peer network holding a fixed set of objects for every repository.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    inner: Mutex<TransportInner>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes a raw object available and returns its hash.
    pub fn insert(&self, raw: impl Into<Bytes>) -> ObjectHash {
        let raw = raw.into();
        let hash = git::object_hash(&raw);
        lock(&self.inner).objects.insert(hash, raw);
        hash
    }

    /// Serves `raw` under `hash` regardless of its content.
    pub fn insert_as(&self, hash: ObjectHash, raw: impl Into<Bytes>) {
        lock(&self.inner).objects.insert(hash, raw.into());
    }

    /// Makes every subsequent fetch fail.
    pub fn set_failing(&self, failing: bool) {
        lock(&self.inner).failing = failing;
    }

    /// Number of fetch calls served or failed so far.
    pub fn fetch_count(&self) -> usize {
        lock(&self.inner).fetches
    }

    pub fn announced(&self) -> Vec<ObjectHash> {
        lock(&self.inner).announced.clone()
    }
}

impl ObjectTransport for MemoryTransport {
    fn fetch_object(&self, repo: &str, hash: &ObjectHash) -> anyhow::Result<Bytes> {
        let mut inner = lock(&self.inner);
        inner.fetches += 1;
        if inner.failing {
            return Err(anyhow!("no peer reachable for {repo}"));
        }
        inner
            .objects
            .get(hash)
            .cloned()
            .ok_or_else(|| anyhow!("object {hash} not found in {repo}"))
    }

    fn announce(&self, hash: &ObjectHash) {
        lock(&self.inner).announced.push(*hash);
    }
}

#[derive(Debug, Default)]
struct GitRepo {
    references: BTreeMap<String, ObjectHash>,
    objects: HashMap<ObjectHash, Bytes>,
}

/// Local git storage held in memory.
///
/// Reference update packs are applied like `receive-pack` would: every
/// object is unpacked, then each command moves its reference from `old` to
/// `new`, failing if the reference is not at `old`.
#[derive(Debug, Default)]
pub struct MemoryGitStore {
    repos: Mutex<HashMap<String, GitRepo>>,
}

impl MemoryGitStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets `reference` directly, creating the repository if needed.
    pub fn set_reference(&self, repo: &str, reference: &str, hash: ObjectHash) {
        lock(&self.repos)
            .entry(repo.to_owned())
            .or_default()
            .references
            .insert(reference.to_owned(), hash);
    }

    /// Stores a raw object and returns its hash, creating the repository if
    /// needed.
    pub fn insert_object(&self, repo: &str, raw: impl Into<Bytes>) -> ObjectHash {
        let raw = raw.into();
        let hash = git::object_hash(&raw);
        lock(&self.repos)
            .entry(repo.to_owned())
            .or_default()
            .objects
            .insert(hash, raw);
        hash
    }
}

impl LocalGitStore for MemoryGitStore {
    fn has_repository(&self, repo: &str) -> bool {
        lock(&self.repos).contains_key(repo)
    }

    fn init_repository(&self, repo: &str) -> anyhow::Result<()> {
        lock(&self.repos).entry(repo.to_owned()).or_default();
        Ok(())
    }

    fn reference_hash(&self, repo: &str, reference: &str) -> anyhow::Result<Option<ObjectHash>> {
        let repos = lock(&self.repos);
        let repo = repos
            .get(repo)
            .ok_or_else(|| anyhow!("repository {repo} does not exist"))?;
        Ok(repo.references.get(reference).copied())
    }

    fn has_object(&self, repo: &str, hash: &ObjectHash) -> bool {
        lock(&self.repos)
            .get(repo)
            .is_some_and(|r| r.objects.contains_key(hash))
    }

    fn object(&self, repo: &str, hash: &ObjectHash) -> anyhow::Result<Option<Bytes>> {
        Ok(lock(&self.repos)
            .get(repo)
            .and_then(|r| r.objects.get(hash).cloned()))
    }

    fn write_object(&self, repo: &str, hash: &ObjectHash, raw: Bytes) -> anyhow::Result<()> {
        lock(&self.repos)
            .entry(repo.to_owned())
            .or_default()
            .objects
            .insert(*hash, raw);
        Ok(())
    }

    fn apply_reference_update_pack(&self, repo: &str, pack: Bytes) -> Result<(), ReceiveError> {
        let request = ReferenceUpdateRequest::decode(&pack)
            .map_err(|err| ReceiveError::InvalidPack(err.to_string()))?;
        let mut repos = lock(&self.repos);
        let target = repos
            .get_mut(repo)
            .ok_or_else(|| ReceiveError::Process(anyhow!("repository {repo} does not exist")))?;
        for command in &request.commands {
            let current = target
                .references
                .get(&command.name)
                .copied()
                .unwrap_or(ObjectHash::ZERO);
            if current != command.old {
                return Err(ReceiveError::Process(anyhow!(
                    "{} is at {current}, not {}",
                    command.name,
                    command.old
                )));
            }
        }
        for raw in request.objects {
            target.objects.insert(git::object_hash(&raw), raw.into());
        }
        for command in request.commands {
            if command.new.is_zero() {
                target.references.remove(&command.name);
            } else {
                target.references.insert(command.name, command.new);
            }
        }
        Ok(())
    }
}

/// A fixed storer ranking.
#[derive(Debug, Default)]
pub struct MemoryStorers {
    ranked: Mutex<Vec<Storer>>,
}

impl MemoryStorers {
    pub fn new(ranked: Vec<Storer>) -> Self {
        MemoryStorers {
            ranked: Mutex::new(ranked),
        }
    }

    pub fn set(&self, ranked: Vec<Storer>) {
        *lock(&self.ranked) = ranked;
    }
}

impl StorerSelector for MemoryStorers {
    fn top_storers(&self, limit: usize) -> anyhow::Result<Vec<Storer>> {
        Ok(lock(&self.ranked).iter().take(limit).copied().collect())
    }
}

/// Sync progress held in memory. Repositories become tracked when a height
/// is first recorded for them or when added with [`MemoryHeights::track`].
#[derive(Debug, Default)]
pub struct MemoryHeights {
    heights: Mutex<BTreeMap<String, u64>>,
    tracked: Mutex<HashSet<String>>,
}

impl MemoryHeights {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&self, repo: impl Into<String>) {
        lock(&self.tracked).insert(repo.into());
    }
}

impl SyncHeightStore for MemoryHeights {
    fn tracked(&self) -> Vec<String> {
        let mut repos: Vec<String> = lock(&self.tracked).iter().cloned().collect();
        repos.sort();
        repos
    }

    fn last_synced(&self, repo: &str) -> u64 {
        lock(&self.heights).get(repo).copied().unwrap_or(0)
    }

    fn set_last_synced(&self, repo: &str, height: u64) {
        lock(&self.heights).insert(repo.to_owned(), height);
        lock(&self.tracked).insert(repo.to_owned());
    }
}
