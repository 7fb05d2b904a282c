//! The watcher.
//!
//! A periodic scan compares each tracked repository's last synced height
//! with the height of the last block that confirmed a push to it, and queues
//! a [`RepoTask`] for every repository that lags. Workers walk the task's
//! blocks in order. Blocks without pushes to the repository advance its last
//! synced height directly; the first block with one hands its pushes to the
//! [`PushTxHandler`] and ends the pass, so the height never moves past an
//! update that has not been applied. The handler advances the height once
//! the update lands and the next scan resumes from there.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;

use crossbeam_channel::select;

use crate::config::SyncConfig;
use crate::state::LedgerState;
use crate::state::LocalGitStore;
use crate::state::SyncHeightStore;
use crate::tx::Transaction;

use super::task::Claim;
use super::task::Keyed;
use super::task::RepoTask;
use super::task::TaskQueue;
use super::PushTxHandler;
use super::SyncError;
use super::Worker;
use super::Workers;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct WatcherInner {
    ledger: Arc<dyn LedgerState>,
    heights: Arc<dyn SyncHeightStore>,
    store: Arc<dyn LocalGitStore>,
    handler: Arc<dyn PushTxHandler>,
    queue: TaskQueue<RepoTask>,
    processing: Mutex<HashSet<String>>,
}

impl WatcherInner {
    fn scan(&self) -> Result<usize, SyncError> {
        let mut queued = 0;
        for repo in self.heights.tracked() {
            let Some(state) = self.ledger.repository(&repo).map_err(SyncError::Store)? else {
                continue;
            };
            let last_synced = self.heights.last_synced(&repo);
            if last_synced >= state.updated_at {
                continue;
            }
            let task = RepoTask {
                repo: repo.clone(),
                start_height: last_synced + 1,
                end_height: state.updated_at,
            };
            if self.queue.push(task) {
                tracing::debug!(%repo, from = last_synced + 1, to = state.updated_at, "repository is behind");
                queued += 1;
            }
        }
        Ok(queued)
    }

    fn do_task(&self, task: &RepoTask) -> Result<(), SyncError> {
        let Some(_processing) = Claim::acquire(&self.processing, task.repo.clone()) else {
            tracing::debug!(repo = %task.repo, "repository is already being processed");
            return Ok(());
        };
        let start = task
            .start_height
            .max(self.heights.last_synced(&task.repo) + 1);
        for height in start..=task.end_height {
            let Some(block) = self.ledger.block(height).map_err(SyncError::Store)? else {
                tracing::warn!(repo = %task.repo, height, "block not found");
                return Ok(());
            };
            let pushes: Vec<&Transaction> = block
                .transactions
                .iter()
                .filter(|tx| {
                    tx.as_push()
                        .is_some_and(|(note, _)| note.repo_name == task.repo)
                })
                .collect();
            if pushes.is_empty() {
                self.heights.set_last_synced(&task.repo, height);
                continue;
            }

            if !self.store.has_repository(&task.repo) {
                self.store
                    .init_repository(&task.repo)
                    .map_err(SyncError::Store)?;
                tracing::debug!(repo = %task.repo, "initialized local repository");
            }
            for tx in pushes {
                self.handler.on_new_push_tx(tx, height)?;
            }
            return Ok(());
        }
        Ok(())
    }
}

impl Worker for WatcherInner {
    fn work_once(&self) -> bool {
        let Some(task) = self.queue.pop() else {
            return false;
        };
        // Only queued tasks are deduplicated; the processing claim keeps
        // workers apart.
        self.queue.complete(&task.key());
        if let Err(err) = self.do_task(&task) {
            tracing::warn!(repo = %task.repo, error = %err, "watcher task failed");
        }
        true
    }
}

/// Detects repositories lagging behind the ledger and feeds their confirmed
/// pushes to a [`PushTxHandler`].
pub struct Watcher {
    config: SyncConfig,
    inner: Arc<WatcherInner>,
    workers: Mutex<Option<Workers>>,
}

impl Watcher {
    pub fn new(
        config: SyncConfig,
        ledger: Arc<dyn LedgerState>,
        heights: Arc<dyn SyncHeightStore>,
        store: Arc<dyn LocalGitStore>,
        handler: Arc<dyn PushTxHandler>,
    ) -> Self {
        Watcher {
            config,
            inner: Arc::new(WatcherInner {
                ledger,
                heights,
                store,
                handler,
                queue: TaskQueue::new(),
                processing: Mutex::new(HashSet::new()),
            }),
            workers: Mutex::new(None),
        }
    }

    /// Starts the periodic scan and the worker threads.
    ///
    /// # Panics
    ///
    /// Panics if the watcher is already running.
    pub fn start(&self) {
        let mut workers = lock(&self.workers);
        if workers.is_some() {
            panic!("watcher already started");
        }
        let (mut pool, stopped) = Workers::spawn(Arc::clone(&self.inner), &self.config);
        let inner = Arc::clone(&self.inner);
        let ticker = crossbeam_channel::tick(self.config.scan_interval);
        pool.attach(std::thread::spawn(move || loop {
            select! {
                recv(stopped) -> _ => break,
                recv(ticker) -> _ => {
                    if let Err(err) = inner.scan() {
                        tracing::warn!(error = %err, "watcher scan failed");
                    }
                }
            }
        }));
        *workers = Some(pool);
        tracing::debug!(workers = self.config.workers, "watcher started");
    }

    /// Stops the scan and lets workers exit after their current task.
    pub fn stop(&self) {
        if let Some(mut workers) = lock(&self.workers).take() {
            workers.stop();
            tracing::debug!("watcher stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        lock(&self.workers).is_some()
    }

    /// Queues a task for every lagging repository, returning how many were
    /// queued.
    pub fn scan(&self) -> Result<usize, SyncError> {
        self.inner.scan()
    }

    /// Queues `task` unless a task for the same repository is queued.
    pub fn add_task(&self, task: RepoTask) -> bool {
        self.inner.queue.push(task)
    }

    /// Walks the task's blocks, see the module documentation.
    pub fn do_task(&self, task: &RepoTask) -> Result<(), SyncError> {
        self.inner.do_task(task)
    }

    /// Pops and runs the next queued task, if any.
    pub fn run_next(&self) -> Option<Result<(), SyncError>> {
        let task = self.inner.queue.pop()?;
        self.inner.queue.complete(&task.key());
        Some(self.inner.do_task(&task))
    }

    pub fn queue_size(&self) -> usize {
        self.inner.queue.len()
    }

    pub fn has_task(&self, repo: &str) -> bool {
        self.inner.queue.contains(&repo.to_owned())
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.stop();
    }
}
