//! The reference syncer.
//!
//! Every reference update of a confirmed push note becomes a [`RefTask`].
//! A task applies only once the local reference is at the update's old
//! hash; since each confirmed update names its predecessor, this serialises
//! one reference's history even with concurrent workers.
//!
//! A local reference that disagrees with the old hash is retried a bounded
//! number of times, fetching the note's objects in between. When the retries
//! are spent the task moves to a dead-letter list and stays there until
//! [`RefSyncer::retry_dead_letters`] is called; its key remains reserved so
//! repeated notifications do not recreate it.
//!
//! A repository's synced height moves to a block height only once every
//! update scheduled at that height and below has been applied. An update
//! that failed keeps its height blocked until the block is delivered again.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::time::Instant;

use crate::config::SyncConfig;
use crate::hash::ObjectHash;
use crate::state::LocalGitStore;
use crate::state::ObjectTransport;
use crate::state::SyncHeightStore;
use crate::tx::Transaction;

use super::apply;
use super::task::Claim;
use super::task::Keyed;
use super::task::RefTask;
use super::task::RefTaskKey;
use super::task::TaskQueue;
use super::PushTxHandler;
use super::SyncError;
use super::Worker;
use super::Workers;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// What happens to a task after a run.
enum Next {
    Complete,
    Requeue,
    DeadLetter,
}

/// Updates of one repository scheduled at one height.
#[derive(Default)]
struct HeightBatch {
    open: HashSet<RefTaskKey>,
    failed: HashSet<RefTaskKey>,
}

impl HeightBatch {
    fn is_settled(&self) -> bool {
        self.open.is_empty() && self.failed.is_empty()
    }
}

struct RefSyncInner {
    config: SyncConfig,
    node_key: Option<[u8; 32]>,
    store: Arc<dyn LocalGitStore>,
    transport: Arc<dyn ObjectTransport>,
    heights: Arc<dyn SyncHeightStore>,
    queue: TaskQueue<RefTask>,
    finalizing: Mutex<HashSet<(String, String)>>,
    dead_letters: Mutex<Vec<RefTask>>,
    /// Per repository, the heights not yet reflected in the synced height.
    batches: Mutex<HashMap<String, BTreeMap<u64, HeightBatch>>>,
}

impl RefSyncInner {
    fn schedule(&self, tx: &Transaction, height: u64) -> Result<(), SyncError> {
        let Some((note, endorsements)) = tx.as_push() else {
            return Ok(());
        };
        let mut batches = lock(&self.batches);
        let pending = batches.entry(note.repo_name.clone()).or_default();
        pending.entry(height).or_default();

        let note_id = note.id();
        let shared = Arc::new(note.clone());
        let endorsers: HashSet<[u8; 32]> =
            endorsements.iter().filter_map(|e| e.sender_pub_key).collect();
        for reference in note.references.iter().filter(|r| !r.is_deletion()) {
            let (Ok(old_hash), Ok(new_hash)) =
                (reference.old_object_hash(), reference.new_object_hash())
            else {
                tracing::warn!(
                    repo = %note.repo_name,
                    reference = %reference.name,
                    "skipping reference with malformed hashes"
                );
                continue;
            };
            let task = RefTask {
                repo: note.repo_name.clone(),
                reference: reference.name.clone(),
                old_hash,
                new_hash,
                height,
                compat_retry_count: 0,
                next_run_time: Instant::now(),
                endorsers: endorsers.clone(),
                note_creator: note.node_pub_key,
                note: Arc::clone(&shared),
                note_id,
            };
            let key = task.key();
            let batch = pending.entry(height).or_default();
            batch.failed.remove(&key);
            batch.open.insert(key);
            if self.queue.push(task) {
                tracing::debug!(
                    repo = %note.repo_name,
                    reference = %reference.name,
                    note = %note_id,
                    "queued reference update"
                );
            }
        }
        // Notes made only of deletions settle at once.
        self.advance_settled(&note.repo_name, pending);
        if pending.is_empty() {
            batches.remove(&note.repo_name);
        }
        Ok(())
    }

    fn advance_height(&self, repo: &str, height: u64) {
        if self.heights.last_synced(repo) < height {
            self.heights.set_last_synced(repo, height);
        }
    }

    /// Advances the synced height across the settled heights at the front
    /// of `pending`.
    fn advance_settled(&self, repo: &str, pending: &mut BTreeMap<u64, HeightBatch>) {
        while let Some(front) = pending.first_entry() {
            if !front.get().is_settled() {
                break;
            }
            let height = *front.key();
            front.remove();
            self.advance_height(repo, height);
        }
    }

    /// Records the outcome of a finished task and releases its key.
    fn settle(&self, task: &RefTask, applied: bool) {
        let key = task.key();
        let mut batches = lock(&self.batches);
        let pending = batches.entry(key.repo.clone()).or_default();
        let batch = pending.entry(task.height).or_default();
        batch.open.remove(&key);
        if !applied {
            batch.failed.insert(key.clone());
        }
        self.advance_settled(&key.repo, pending);
        if pending.is_empty() {
            batches.remove(&key.repo);
        }
        self.queue.complete(&key);
    }

    fn do_task(&self, mut task: RefTask) -> Result<(), SyncError> {
        let (next, result) = self.run(&mut task);
        match next {
            Next::Complete => self.settle(&task, result.is_ok()),
            Next::Requeue => self.queue.requeue(task),
            Next::DeadLetter => lock(&self.dead_letters).push(task),
        }
        result
    }

    fn run(&self, task: &mut RefTask) -> (Next, Result<(), SyncError>) {
        let Some(_finalizing) = Claim::acquire(
            &self.finalizing,
            (task.repo.clone(), task.reference.clone()),
        ) else {
            return (Next::Requeue, Ok(()));
        };
        if task.next_run_time > Instant::now() {
            return (Next::Requeue, Ok(()));
        }
        if !self.store.has_repository(&task.repo) {
            return (
                Next::Complete,
                Err(SyncError::RepositoryMissing(task.repo.clone())),
            );
        }
        let local = match self.store.reference_hash(&task.repo, &task.reference) {
            Ok(hash) => hash.unwrap_or(ObjectHash::ZERO),
            Err(err) => return (Next::Complete, Err(SyncError::Store(err))),
        };

        if local == task.new_hash {
            tracing::debug!(
                repo = %task.repo,
                reference = %task.reference,
                "update already applied"
            );
            return (Next::Complete, Ok(()));
        }
        if local != task.old_hash {
            return self.handle_divergence(task, local);
        }

        let local_copy = self
            .node_key
            .is_some_and(|key| task.note_creator == Some(key) || task.endorsers.contains(&key));
        if !local_copy {
            if let Err(err) =
                apply::fetch_reference_objects(self.store.as_ref(), self.transport.as_ref(), task)
            {
                tracing::warn!(
                    repo = %task.repo,
                    reference = %task.reference,
                    error = %err,
                    "failed to fetch objects, update not applied"
                );
                return (Next::Complete, Err(err));
            }
        }
        if let Err(err) = apply::update_repo_using_note(self.store.as_ref(), task) {
            return (Next::Complete, Err(err.into()));
        }
        tracing::info!(
            repo = %task.repo,
            reference = %task.reference,
            old = %task.old_hash,
            new = %task.new_hash,
            "applied reference update"
        );
        (Next::Complete, Ok(()))
    }

    fn handle_divergence(&self, task: &mut RefTask, local: ObjectHash) -> (Next, Result<(), SyncError>) {
        if task.compat_retry_count >= self.config.max_compat_retries {
            let expected = task.old_hash;
            task.old_hash = local;
            tracing::error!(
                repo = %task.repo,
                reference = %task.reference,
                %local,
                %expected,
                "reference is not compatible with local state, giving up"
            );
            return (
                Next::DeadLetter,
                Err(SyncError::IncompatibleReference {
                    reference: task.reference.clone(),
                    local,
                    expected,
                }),
            );
        }

        if let Err(err) =
            apply::fetch_reference_objects(self.store.as_ref(), self.transport.as_ref(), task)
        {
            tracing::debug!(repo = %task.repo, error = %err, "compat fetch failed");
        }
        task.compat_retry_count += 1;
        task.next_run_time = Instant::now() + self.config.compat_backoff;
        tracing::warn!(
            repo = %task.repo,
            reference = %task.reference,
            %local,
            expected = %task.old_hash,
            retry = task.compat_retry_count,
            "local reference diverged, retrying later"
        );
        (Next::Requeue, Ok(()))
    }
}

impl Worker for RefSyncInner {
    fn work_once(&self) -> bool {
        let Some(task) = self.queue.pop() else {
            return false;
        };
        if task.next_run_time > Instant::now() {
            // Only backed off tasks remain ahead; let the worker idle.
            self.queue.requeue(task);
            return false;
        }
        let (repo, reference) = (task.repo.clone(), task.reference.clone());
        if let Err(err) = self.do_task(task) {
            tracing::warn!(%repo, %reference, error = %err, "reference sync failed");
        }
        true
    }
}

/// Applies confirmed reference updates to local git storage.
pub struct RefSyncer {
    inner: Arc<RefSyncInner>,
    workers: Mutex<Option<Workers>>,
}

impl RefSyncer {
    /// `node_key` is this node's public key; updates of notes it created or
    /// endorsed are applied from local objects without fetching.
    pub fn new(
        config: SyncConfig,
        node_key: Option<[u8; 32]>,
        store: Arc<dyn LocalGitStore>,
        transport: Arc<dyn ObjectTransport>,
        heights: Arc<dyn SyncHeightStore>,
    ) -> Self {
        RefSyncer {
            inner: Arc::new(RefSyncInner {
                config,
                node_key,
                store,
                transport,
                heights,
                queue: TaskQueue::new(),
                finalizing: Mutex::new(HashSet::new()),
                dead_letters: Mutex::new(Vec::new()),
                batches: Mutex::new(HashMap::new()),
            }),
            workers: Mutex::new(None),
        }
    }

    /// Starts the worker threads.
    ///
    /// # Panics
    ///
    /// Panics if the syncer is already running.
    pub fn start(&self) {
        let mut workers = lock(&self.workers);
        if workers.is_some() {
            panic!("reference syncer already started");
        }
        let (pool, _) = Workers::spawn(Arc::clone(&self.inner), &self.inner.config);
        *workers = Some(pool);
        tracing::debug!(workers = self.inner.config.workers, "reference syncer started");
    }

    /// Stops the workers after their current task.
    pub fn stop(&self) {
        if let Some(mut workers) = lock(&self.workers).take() {
            workers.stop();
            tracing::debug!("reference syncer stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        lock(&self.workers).is_some()
    }

    /// Runs `task` once. Depending on the outcome the task is finished,
    /// requeued or moved to the dead-letter list.
    pub fn do_task(&self, task: RefTask) -> Result<(), SyncError> {
        self.inner.do_task(task)
    }

    /// Pops and runs the next queued task, if any.
    pub fn run_next(&self) -> Option<Result<(), SyncError>> {
        let task = self.inner.queue.pop()?;
        Some(self.inner.do_task(task))
    }

    /// Number of queued tasks, excluding tasks being worked on.
    pub fn queue_size(&self) -> usize {
        self.inner.queue.len()
    }

    pub fn has_task(&self, key: &RefTaskKey) -> bool {
        self.inner.queue.contains(key)
    }

    /// Copies of the queued tasks, front first.
    pub fn queued_tasks(&self) -> Vec<RefTask> {
        self.inner.queue.snapshot()
    }

    /// Tasks that exhausted their compat retries.
    pub fn dead_letters(&self) -> Vec<RefTask> {
        lock(&self.inner.dead_letters).clone()
    }

    /// Requeues every dead-lettered task with its retry state reset. The
    /// tasks carry the local hash observed when they gave up as their old
    /// hash. Returns how many were requeued.
    pub fn retry_dead_letters(&self) -> usize {
        let tasks: Vec<RefTask> = lock(&self.inner.dead_letters).drain(..).collect();
        let count = tasks.len();
        for mut task in tasks {
            task.compat_retry_count = 0;
            task.next_run_time = Instant::now();
            self.inner.queue.requeue(task);
        }
        count
    }
}

impl PushTxHandler for RefSyncer {
    fn on_new_push_tx(&self, tx: &Transaction, height: u64) -> Result<(), SyncError> {
        self.inner.schedule(tx, height)
    }
}

impl Drop for RefSyncer {
    fn drop(&mut self) {
        self.stop();
    }
}
