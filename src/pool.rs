//! The transaction admission pool.
//!
//! Pending transactions, push proposals included, wait here until a block
//! includes them. The pool is bounded, keeps each sender's transactions in
//! nonce order and otherwise serves the highest fee rate first.
//!
//! A transaction that skips ahead of its sender's next expected nonce is held
//! in an out-of-order cache until its predecessor arrives. An incoming
//! transaction with the same sender and nonce as a pooled one replaces it only
//! if it pays a strictly higher fee rate.
//!
//! Served order is computed lazily: inserts only mark the order stale, and the
//! next [`AdmissionPool::first`] or [`AdmissionPool::last`] rebuilds it by
//! merging every sender's nonce-ordered queue on the fee rate of its head.
//! Removals leave their hash in the order; serving skips hashes that are no
//! longer pooled.

mod cache;

use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::collections::BinaryHeap;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::thread::JoinHandle;
use std::time::Instant;

use crossbeam_channel::select;
use crossbeam_channel::Sender;

use crate::config::PoolConfig;
use crate::hash::Address;
use crate::hash::TxHash;
use crate::state::NonceLookup;
use crate::tx::FeeRate;
use crate::tx::Transaction;

use cache::NonceCollection;

#[derive(Debug)]
pub enum PoolError {
    /// The pool is at capacity and nothing cheaper can be evicted.
    ContainerFull,
    /// A pooled transaction with the same sender and nonce pays an equal or
    /// higher fee rate.
    FailedReplaceByFee,
    SenderTxLimitReached { limit: usize },
    StaleNonce { nonce: u64, current: u64 },
    AlreadyInPool,
    /// A transaction with the same sender and nonce is already cached.
    AlreadyCached,
    CacheFull,
    NonceLookup(anyhow::Error),
}

impl std::fmt::Display for PoolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolError::ContainerFull => write!(f, "container is full"),
            PoolError::FailedReplaceByFee => write!(
                f,
                "replace-by-fee failed: a transaction with the same nonce has an equal or higher fee rate"
            ),
            PoolError::SenderTxLimitReached { limit } => {
                write!(f, "sender reached its limit of {limit} pending transactions")
            }
            PoolError::StaleNonce { nonce, current } => write!(
                f,
                "tx nonce cannot be less than or equal to current account nonce (nonce: {nonce}, current: {current})"
            ),
            PoolError::AlreadyInPool => write!(f, "transaction already in the pool"),
            PoolError::AlreadyCached => {
                write!(f, "a transaction with the same sender and nonce is already cached")
            }
            PoolError::CacheFull => write!(f, "out-of-order cache is full"),
            PoolError::NonceLookup(err) => write!(f, "failed to get sender nonce: {err}"),
        }
    }
}

impl std::error::Error for PoolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PoolError::NonceLookup(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
struct PoolEntry {
    tx: Transaction,
    sender: Address,
    fee_rate: FeeRate,
    size: u64,
    added_at: Instant,
    seq: u64,
}

/// Head of one sender's queue during the order merge. Higher fee rate wins,
/// then earlier insertion.
#[derive(PartialEq, Eq, PartialOrd, Ord)]
struct Head {
    fee_rate: FeeRate,
    seq: Reverse<u64>,
    sender: Address,
}

#[derive(Default)]
struct PoolInner {
    entries: HashMap<TxHash, PoolEntry>,
    senders: HashMap<Address, BTreeMap<u64, TxHash>>,
    cache: NonceCollection,
    order: VecDeque<TxHash>,
    order_stale: bool,
    byte_size: u64,
    next_seq: u64,
}

impl PoolInner {
    fn has_nonce(&self, sender: &Address, nonce: u64) -> bool {
        self.senders
            .get(sender)
            .is_some_and(|nonces| nonces.contains_key(&nonce))
    }

    fn sender_count(&self, sender: &Address) -> usize {
        self.senders.get(sender).map_or(0, BTreeMap::len) + self.cache.count(sender)
    }

    fn insert(&mut self, tx: Transaction, hash: TxHash, sender: Address, added_at: Instant) {
        let size = tx.economic_size();
        let entry = PoolEntry {
            fee_rate: tx.fee_rate(),
            size,
            sender,
            added_at,
            seq: self.next_seq,
            tx,
        };
        self.next_seq += 1;
        self.byte_size += size;
        self.senders
            .entry(sender)
            .or_default()
            .insert(entry.tx.nonce, hash);
        self.entries.insert(hash, entry);
        self.order_stale = true;
    }

    fn remove(&mut self, hash: &TxHash) -> Option<PoolEntry> {
        let entry = self.entries.remove(hash)?;
        if let Some(nonces) = self.senders.get_mut(&entry.sender) {
            nonces.remove(&entry.tx.nonce);
            if nonces.is_empty() {
                self.senders.remove(&entry.sender);
            }
        }
        self.byte_size -= entry.size;
        Some(entry)
    }

    /// Rebuilds the served order if anything was inserted since the last
    /// rebuild. Removals keep the pooled part of the order valid.
    fn sort(&mut self) {
        if !self.order_stale {
            return;
        }
        let mut queues: HashMap<Address, VecDeque<TxHash>> = self
            .senders
            .iter()
            .map(|(sender, nonces)| (*sender, nonces.values().copied().collect()))
            .collect();
        let mut heads = BinaryHeap::new();
        for (sender, queue) in &queues {
            if let Some(hash) = queue.front() {
                heads.push(self.head(sender, hash));
            }
        }
        let mut order = VecDeque::with_capacity(self.entries.len());
        while let Some(Head { sender, .. }) = heads.pop() {
            let Some(queue) = queues.get_mut(&sender) else {
                continue;
            };
            if let Some(hash) = queue.pop_front() {
                order.push_back(hash);
            }
            if let Some(next) = queue.front() {
                heads.push(self.head(&sender, next));
            }
        }
        self.order = order;
        self.order_stale = false;
    }

    /// Highest priority pooled hash.
    fn front(&mut self) -> Option<TxHash> {
        self.sort();
        while let Some(hash) = self.order.front().copied() {
            if self.entries.contains_key(&hash) {
                return Some(hash);
            }
            self.order.pop_front();
        }
        None
    }

    /// Lowest priority pooled hash.
    fn back(&mut self) -> Option<TxHash> {
        self.sort();
        while let Some(hash) = self.order.back().copied() {
            if self.entries.contains_key(&hash) {
                return Some(hash);
            }
            self.order.pop_back();
        }
        None
    }

    fn head(&self, sender: &Address, hash: &TxHash) -> Head {
        let entry = &self.entries[hash];
        Head {
            fee_rate: entry.fee_rate,
            seq: Reverse(entry.seq),
            sender: *sender,
        }
    }

    /// Evicts the lowest priority entry if it belongs to another sender and
    /// pays strictly less than `fee_rate`.
    fn evict_for(&mut self, sender: &Address, fee_rate: FeeRate) -> bool {
        let Some(last) = self.back() else {
            return false;
        };
        let entry = &self.entries[&last];
        if entry.sender == *sender || entry.fee_rate >= fee_rate {
            return false;
        }
        self.remove(&last);
        tracing::debug!(tx = %last, "evicted lowest fee rate transaction");
        true
    }

    /// Moves cached successors of `(sender, nonce)` into the pool while
    /// capacity allows.
    fn promote_successors(&mut self, sender: &Address, nonce: u64, capacity: usize) -> usize {
        let mut promoted = 0;
        let mut next = nonce + 1;
        while self.entries.len() < capacity {
            let Some(cached) = self.cache.take(sender, next) else {
                break;
            };
            self.insert(cached.tx, cached.hash, *sender, cached.added_at);
            promoted += 1;
            next += 1;
        }
        promoted
    }
}

/// A bounded, nonce ordered and fee prioritised pool of pending
/// transactions.
pub struct AdmissionPool {
    config: PoolConfig,
    nonce_lookup: Box<dyn NonceLookup>,
    inner: Mutex<PoolInner>,
}

impl AdmissionPool {
    pub fn new(config: PoolConfig, nonce_lookup: impl NonceLookup + 'static) -> Self {
        AdmissionPool {
            config,
            nonce_lookup: Box::new(nonce_lookup),
            inner: Mutex::new(PoolInner::default()),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, PoolInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Admits `tx`, returning whether another transaction was evicted to make
    /// room for it.
    pub fn add(&self, tx: Transaction) -> Result<bool, PoolError> {
        let hash = tx.hash();
        let sender = tx.sender_address();
        let current = self
            .nonce_lookup
            .account_nonce(&sender)
            .map_err(PoolError::NonceLookup)?;
        if tx.nonce <= current {
            return Err(PoolError::StaleNonce {
                nonce: tx.nonce,
                current,
            });
        }

        let mut inner = self.lock();
        if inner.entries.contains_key(&hash) || inner.cache.contains_hash(&hash) {
            return Err(PoolError::AlreadyInPool);
        }

        let existing = inner
            .senders
            .get(&sender)
            .and_then(|nonces| nonces.get(&tx.nonce))
            .copied();
        if let Some(existing) = existing {
            if tx.fee_rate() <= inner.entries[&existing].fee_rate {
                return Err(PoolError::FailedReplaceByFee);
            }
            inner.remove(&existing);
            inner.insert(tx, hash, sender, Instant::now());
            tracing::debug!(tx = %hash, replaced = %existing, "replaced by fee");
            return Ok(false);
        }

        if inner.cache.contains(&sender, tx.nonce) {
            return Err(PoolError::AlreadyCached);
        }
        if inner.sender_count(&sender) >= self.config.sender_tx_limit {
            return Err(PoolError::SenderTxLimitReached {
                limit: self.config.sender_tx_limit,
            });
        }

        let nonce = tx.nonce;
        if nonce != current + 1 && !inner.has_nonce(&sender, nonce - 1) {
            if inner.cache.len() >= self.config.cache_capacity {
                return Err(PoolError::CacheFull);
            }
            inner.cache.insert(sender, tx, hash);
            tracing::debug!(tx = %hash, nonce, "cached out-of-order transaction");
            return Ok(false);
        }

        let mut evicted = false;
        if inner.entries.len() >= self.config.capacity {
            if !inner.evict_for(&sender, tx.fee_rate()) {
                return Err(PoolError::ContainerFull);
            }
            evicted = true;
        }
        inner.insert(tx, hash, sender, Instant::now());
        inner.promote_successors(&sender, nonce, self.config.capacity);
        Ok(evicted)
    }

    /// Removes and returns the highest priority transaction.
    pub fn first(&self) -> Option<Transaction> {
        let mut inner = self.lock();
        let hash = inner.front()?;
        inner.remove(&hash).map(|entry| entry.tx)
    }

    /// Removes and returns the lowest priority transaction.
    pub fn last(&self) -> Option<Transaction> {
        let mut inner = self.lock();
        let hash = inner.back()?;
        inner.remove(&hash).map(|entry| entry.tx)
    }

    /// Number of transactions in the main pool.
    pub fn size(&self) -> usize {
        self.lock().entries.len()
    }

    /// Number of out-of-order transactions held back.
    pub fn cache_size(&self) -> usize {
        self.lock().cache.len()
    }

    /// Pooled plus cached transactions of `address`.
    pub fn size_by_addr(&self, address: &Address) -> usize {
        self.lock().sender_count(address)
    }

    /// Sum of the economic size of all pooled transactions.
    pub fn byte_size(&self) -> u64 {
        self.lock().byte_size
    }

    pub fn has(&self, tx: &Transaction) -> bool {
        self.has_by_hash(&tx.hash())
    }

    pub fn has_by_hash(&self, hash: &TxHash) -> bool {
        self.lock().entries.contains_key(hash)
    }

    pub fn is_cached(&self, hash: &TxHash) -> bool {
        self.lock().cache.contains_hash(hash)
    }

    pub fn get_by_hash(&self, hash: &TxHash) -> Option<Transaction> {
        let inner = self.lock();
        match inner.entries.get(hash) {
            Some(entry) => Some(entry.tx.clone()),
            None => inner.cache.get_by_hash(hash).map(|cached| cached.tx.clone()),
        }
    }

    pub fn get_fee_rate_by_hash(&self, hash: &TxHash) -> Option<FeeRate> {
        self.lock().entries.get(hash).map(|entry| entry.fee_rate)
    }

    /// Removes the given transactions from the pool and the cache, returning
    /// how many were found.
    pub fn remove(&self, txs: &[Transaction]) -> usize {
        let mut inner = self.lock();
        txs.iter()
            .map(|tx| tx.hash())
            .filter(|hash| inner.remove(hash).is_some() || inner.cache.remove_hash(hash).is_some())
            .count()
    }

    /// Drops every pooled or cached transaction older than the configured
    /// time-to-live.
    pub fn clean(&self) -> usize {
        let ttl = self.config.tx_ttl;
        let mut inner = self.lock();
        let expired: Vec<TxHash> = inner
            .entries
            .iter()
            .filter(|(_, entry)| entry.added_at.elapsed() >= ttl)
            .map(|(hash, _)| *hash)
            .collect();
        for hash in &expired {
            inner.remove(hash);
        }
        expired.len() + inner.cache.remove_expired(ttl)
    }

    /// Promotes cached transactions whose predecessor has been confirmed
    /// since they arrived. Nonces are looked up without holding the lock.
    pub fn promote_ready(&self) -> usize {
        let senders = self.lock().cache.senders();
        let mut promoted = 0;
        for sender in senders {
            let current = match self.nonce_lookup.account_nonce(&sender) {
                Ok(current) => current,
                Err(err) => {
                    tracing::warn!(%sender, error = %err, "nonce lookup failed during promotion");
                    continue;
                }
            };
            let mut inner = self.lock();
            if inner.cache.first_nonce(&sender) != Some(current + 1)
                || inner.entries.len() >= self.config.capacity
            {
                continue;
            }
            promoted += inner.promote_successors(&sender, current, self.config.capacity);
        }
        promoted
    }

    /// Clears the pool, the cache and all indices.
    pub fn flush(&self) {
        *self.lock() = PoolInner::default();
    }

    /// Starts the periodic expiry sweep on its own thread.
    pub fn spawn_sweeper(self: &Arc<Self>) -> Sweeper {
        let (stop, stopped) = crossbeam_channel::bounded::<()>(0);
        let pool = Arc::clone(self);
        let ticker = crossbeam_channel::tick(self.config.sweep_interval);
        let handle = std::thread::spawn(move || loop {
            select! {
                recv(stopped) -> _ => break,
                recv(ticker) -> _ => {
                    let expired = pool.clean();
                    let promoted = pool.promote_ready();
                    if expired > 0 || promoted > 0 {
                        tracing::debug!(expired, promoted, "pool sweep");
                    }
                }
            }
        });
        Sweeper {
            stop: Some(stop),
            handle: Some(handle),
        }
    }
}

/// Handle of a running expiry sweep; stops it when dropped.
pub struct Sweeper {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Sweeper {
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        drop(self.stop.take());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tx::TxPayload;
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;
    use std::time::Duration;

    fn tx(key: &SigningKey, nonce: u64, fee: u64) -> Transaction {
        let payload = TxPayload::Transfer {
            to: Address([1; 20]),
            value: 1,
        };
        Transaction::new(key, nonce, fee, 0, payload)
    }

    fn pool(config: PoolConfig) -> AdmissionPool {
        AdmissionPool::new(config, |_: &Address| -> anyhow::Result<u64> { Ok(0) })
    }

    #[test]
    fn byte_size_tracks_removals() {
        let key = SigningKey::generate(&mut OsRng);
        let pool = pool(PoolConfig::default());
        let a = tx(&key, 1, 1);
        let b = tx(&key, 2, 1);
        pool.add(a.clone()).unwrap();
        pool.add(b.clone()).unwrap();
        assert_eq!(pool.byte_size(), a.economic_size() + b.economic_size());
        assert_eq!(pool.remove(&[a.clone()]), 1);
        assert_eq!(pool.byte_size(), b.economic_size());
        assert_eq!(pool.remove(&[a]), 0);
    }

    #[test]
    fn removed_entries_are_skipped_when_serving() {
        let keys: Vec<SigningKey> = (0..4).map(|_| SigningKey::generate(&mut OsRng)).collect();
        let pool = pool(PoolConfig::default());
        let txs: Vec<Transaction> = keys
            .iter()
            .enumerate()
            .map(|(i, key)| tx(key, 1, 10 * (i as u64 + 1)))
            .collect();
        for tx in &txs {
            pool.add(tx.clone()).unwrap();
        }
        // Order is built, then its head and tail are removed.
        assert_eq!(pool.first(), Some(txs[3].clone()));
        assert_eq!(pool.remove(&[txs[2].clone(), txs[0].clone()]), 2);
        assert_eq!(pool.size(), 1);
        assert_eq!(pool.last(), Some(txs[1].clone()));
        assert_eq!(pool.first(), None);
        assert_eq!(pool.byte_size(), 0);

        // Re-adding a removed transaction puts it back in the order.
        pool.add(txs[0].clone()).unwrap();
        assert_eq!(pool.first(), Some(txs[0].clone()));
    }

    #[test]
    fn eviction_replaces_cheapest_other_sender() {
        let cheap = SigningKey::generate(&mut OsRng);
        let rich = SigningKey::generate(&mut OsRng);
        let pool = pool(PoolConfig::default().with_capacity(1));
        let low = tx(&cheap, 1, 1);
        pool.add(low.clone()).unwrap();
        assert!(pool.add(tx(&rich, 1, 100)).unwrap());
        assert_eq!(pool.size(), 1);
        assert!(!pool.has(&low));
    }

    #[test]
    fn expired_entries_are_cleaned() {
        let key = SigningKey::generate(&mut OsRng);
        let pool = pool(PoolConfig::default().with_tx_ttl(Duration::ZERO));
        pool.add(tx(&key, 1, 1)).unwrap();
        pool.add(tx(&key, 5, 1)).unwrap();
        assert_eq!(pool.clean(), 2);
        assert_eq!(pool.size(), 0);
        assert_eq!(pool.cache_size(), 0);
        assert_eq!(pool.byte_size(), 0);
    }

    #[test]
    fn fresh_entries_survive_clean() {
        let key = SigningKey::generate(&mut OsRng);
        let pool = pool(PoolConfig::default());
        pool.add(tx(&key, 1, 1)).unwrap();
        assert_eq!(pool.clean(), 0);
        assert_eq!(pool.size(), 1);
    }

    #[test]
    fn sweeper_stops() {
        let pool = Arc::new(pool(
            PoolConfig::default()
                .with_tx_ttl(Duration::ZERO)
                .with_sweep_interval(Duration::from_millis(5)),
        ));
        let key = SigningKey::generate(&mut OsRng);
        pool.add(tx(&key, 1, 1)).unwrap();
        let sweeper = pool.spawn_sweeper();
        let deadline = Instant::now() + Duration::from_secs(5);
        while pool.size() > 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        sweeper.stop();
        assert_eq!(pool.size(), 0);
    }
}
