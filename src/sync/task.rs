//! Sync tasks and the deduplicated queue they travel through.

use std::collections::HashSet;
use std::collections::VecDeque;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::time::Instant;

use crate::hash::NoteId;
use crate::hash::ObjectHash;
use crate::push::PushNote;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A task with an identity used for deduplication.
pub trait Keyed {
    type Key: Clone + Eq + Hash;

    fn key(&self) -> Self::Key;
}

/// Catch-up work for one repository: the blocks from `start_height` to
/// `end_height`, both inclusive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoTask {
    pub repo: String,
    pub start_height: u64,
    pub end_height: u64,
}

impl Keyed for RepoTask {
    type Key = String;

    fn key(&self) -> String {
        self.repo.clone()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RefTaskKey {
    pub repo: String,
    pub reference: String,
    pub note_id: NoteId,
}

/// One confirmed reference update waiting to be applied locally.
#[derive(Debug, Clone)]
pub struct RefTask {
    pub repo: String,
    pub reference: String,
    pub old_hash: ObjectHash,
    pub new_hash: ObjectHash,
    /// Height of the block that confirmed the update.
    pub height: u64,
    pub compat_retry_count: u32,
    /// The task is not run before this instant.
    pub next_run_time: Instant,
    /// Public keys of the storers that endorsed the note.
    pub endorsers: HashSet<[u8; 32]>,
    /// Public key of the node that created the note.
    pub note_creator: Option<[u8; 32]>,
    pub note: Arc<PushNote>,
    pub note_id: NoteId,
}

impl Keyed for RefTask {
    type Key = RefTaskKey;

    fn key(&self) -> RefTaskKey {
        RefTaskKey {
            repo: self.repo.clone(),
            reference: self.reference.clone(),
            note_id: self.note_id,
        }
    }
}

struct QueueInner<T: Keyed> {
    tasks: VecDeque<T>,
    keys: HashSet<T::Key>,
}

/// A FIFO queue holding at most one task per key.
///
/// A key is reserved from [`push`](TaskQueue::push) until
/// [`complete`](TaskQueue::complete), so a popped task that is being worked
/// on still blocks duplicates. A worker hands a popped task back with
/// [`requeue`](TaskQueue::requeue).
pub struct TaskQueue<T: Keyed> {
    inner: Mutex<QueueInner<T>>,
}

impl<T: Keyed> Default for TaskQueue<T> {
    fn default() -> Self {
        TaskQueue {
            inner: Mutex::new(QueueInner {
                tasks: VecDeque::new(),
                keys: HashSet::new(),
            }),
        }
    }
}

impl<T: Keyed> TaskQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `task` unless its key is reserved. Returns whether it was
    /// added.
    pub fn push(&self, task: T) -> bool {
        let mut inner = lock(&self.inner);
        if !inner.keys.insert(task.key()) {
            return false;
        }
        inner.tasks.push_back(task);
        true
    }

    /// Hands a popped task back. Its key is still reserved.
    pub fn requeue(&self, task: T) {
        let mut inner = lock(&self.inner);
        inner.keys.insert(task.key());
        inner.tasks.push_back(task);
    }

    pub fn pop(&self) -> Option<T> {
        lock(&self.inner).tasks.pop_front()
    }

    /// Releases the key of a finished task.
    pub fn complete(&self, key: &T::Key) {
        lock(&self.inner).keys.remove(key);
    }

    /// Whether `key` is queued or in flight.
    pub fn contains(&self, key: &T::Key) -> bool {
        lock(&self.inner).keys.contains(key)
    }

    /// Number of queued tasks, excluding those in flight.
    pub fn len(&self) -> usize {
        lock(&self.inner).tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Keyed + Clone> TaskQueue<T> {
    /// Copies of the queued tasks, front first.
    pub fn snapshot(&self) -> Vec<T> {
        lock(&self.inner).tasks.iter().cloned().collect()
    }
}

/// Exclusive claim on a key in a shared set, released on drop.
pub(crate) struct Claim<'a, K: Eq + Hash> {
    set: &'a Mutex<HashSet<K>>,
    key: Option<K>,
}

impl<'a, K: Eq + Hash + Clone> Claim<'a, K> {
    /// Claims `key`, or returns `None` if someone else holds it.
    pub fn acquire(set: &'a Mutex<HashSet<K>>, key: K) -> Option<Self> {
        if !lock(set).insert(key.clone()) {
            return None;
        }
        Some(Claim {
            set,
            key: Some(key),
        })
    }
}

impl<K: Eq + Hash> Drop for Claim<'_, K> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            lock(self.set).remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(repo: &str, end: u64) -> RepoTask {
        RepoTask {
            repo: repo.into(),
            start_height: 1,
            end_height: end,
        }
    }

    #[test]
    fn reserved_keys_block_duplicates() {
        let queue = TaskQueue::new();
        assert!(queue.push(task("a", 1)));
        assert!(!queue.push(task("a", 2)));
        let popped = queue.pop().unwrap();
        assert!(!queue.push(task("a", 3)));
        queue.requeue(popped);
        assert_eq!(queue.len(), 1);
        let popped = queue.pop().unwrap();
        queue.complete(&popped.key());
        assert!(queue.push(task("a", 4)));
    }

    #[test]
    fn claim_is_released_on_drop() {
        let set = Mutex::new(HashSet::new());
        let claim = Claim::acquire(&set, "repo").unwrap();
        assert!(Claim::acquire(&set, "repo").is_none());
        drop(claim);
        assert!(Claim::acquire(&set, "repo").is_some());
    }
}
