//! Reconciliation of local repositories with confirmed network state.
//!
//! The [`Watcher`](watcher::Watcher) notices repositories whose last synced
//! height trails the ledger and walks the missing blocks. Confirmed push
//! transactions it finds are handed to a [`PushTxHandler`], normally the
//! [`RefSyncer`](refsync::RefSyncer), which turns each pushed reference into
//! a task and applies it to local git storage once the local reference
//! agrees with the update's old hash.
//!
//! Both components run a fixed pool of worker threads pulling from a
//! deduplicated queue. [`stop`](watcher::Watcher::stop) lets workers finish
//! their current task; a task may therefore complete after a stop request.

pub mod apply;
pub mod refsync;
pub mod task;
pub mod watcher;

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::Receiver;
use crossbeam_channel::RecvTimeoutError;
use crossbeam_channel::Sender;
use crossbeam_channel::TryRecvError;
use rand::Rng;

use crate::config::SyncConfig;
use crate::hash::ObjectHash;
use crate::tx::Transaction;

use apply::ApplyError;

#[derive(Debug)]
pub enum SyncError {
    /// The local repository does not exist.
    RepositoryMissing(String),
    /// The local reference kept diverging from the update's old hash after
    /// every compat retry was spent.
    IncompatibleReference {
        reference: String,
        local: ObjectHash,
        expected: ObjectHash,
    },
    Fetch {
        hash: ObjectHash,
        source: anyhow::Error,
    },
    Apply(ApplyError),
    /// A collaborator failed.
    Store(anyhow::Error),
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncError::RepositoryMissing(repo) => {
                write!(f, "local repository {repo} does not exist")
            }
            SyncError::IncompatibleReference {
                reference,
                local,
                expected,
            } => write!(
                f,
                "reference is not compatible with local state: {reference} is at {local}, update expects {expected}"
            ),
            SyncError::Fetch { hash, source } => {
                write!(f, "failed to fetch object {hash}: {source}")
            }
            SyncError::Apply(err) => write!(f, "failed to apply update: {err}"),
            SyncError::Store(err) => write!(f, "storage error: {err}"),
        }
    }
}

impl std::error::Error for SyncError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SyncError::Fetch { source, .. } => Some(source.as_ref()),
            SyncError::Apply(err) => Some(err),
            SyncError::Store(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<ApplyError> for SyncError {
    fn from(err: ApplyError) -> Self {
        Self::Apply(err)
    }
}

/// Receives confirmed push transactions found by the watcher.
pub trait PushTxHandler: Send + Sync {
    /// Schedules the updates of `tx`, confirmed at `height`. The handler is
    /// responsible for advancing the repository's last synced height once
    /// the updates are applied.
    fn on_new_push_tx(&self, tx: &Transaction, height: u64) -> Result<(), SyncError>;
}

/// Something a worker pool can drive.
pub(crate) trait Worker: Send + Sync + 'static {
    /// Processes at most one queued task. Returns false if the queue was
    /// empty.
    fn work_once(&self) -> bool;
}

/// Running worker threads sharing one stop signal.
pub(crate) struct Workers {
    stop: Option<Sender<()>>,
    handles: Vec<JoinHandle<()>>,
}

impl Workers {
    pub fn spawn<W: Worker>(worker: Arc<W>, config: &SyncConfig) -> (Self, Receiver<()>) {
        let (stop, stopped) = crossbeam_channel::bounded::<()>(0);
        let handles = (0..config.workers.max(1))
            .map(|_| {
                let worker = Arc::clone(&worker);
                let stopped = stopped.clone();
                let backoff = config.idle_backoff;
                let jitter = config.idle_jitter;
                std::thread::spawn(move || worker_loop(worker.as_ref(), &stopped, backoff, jitter))
            })
            .collect();
        (
            Workers {
                stop: Some(stop),
                handles,
            },
            stopped,
        )
    }

    /// Adds a thread that exits when the pool is stopped.
    pub fn attach(&mut self, handle: JoinHandle<()>) {
        self.handles.push(handle);
    }

    pub fn stop(&mut self) {
        drop(self.stop.take());
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for Workers {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop<W: Worker>(worker: &W, stopped: &Receiver<()>, backoff: Duration, jitter: Duration) {
    loop {
        match stopped.try_recv() {
            Err(TryRecvError::Empty) => {}
            _ => return,
        }
        if worker.work_once() {
            continue;
        }
        let extra = rand::thread_rng().gen_range(0..=jitter.as_millis() as u64);
        match stopped.recv_timeout(backoff + Duration::from_millis(extra)) {
            Err(RecvTimeoutError::Timeout) => {}
            _ => return,
        }
    }
}
