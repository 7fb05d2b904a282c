mod util;

use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use pushnet::memory::MemoryHeights;
use pushnet::prelude::*;
use pushnet::state::LocalGitStore;
use pushnet::state::SyncHeightStore;
use pushnet::sync::task::RefTaskKey;

use util::blob;
use util::reference;
use util::Net;
use util::MASTER;
use util::REPO;

const DEV: &str = "refs/heads/dev";

struct Node {
    net: Net,
    heights: Arc<MemoryHeights>,
    syncer: RefSyncer,
}

impl Node {
    fn new(config: SyncConfig) -> Self {
        Self::build(config, false)
    }

    /// A node that created the notes it later syncs.
    fn creator(config: SyncConfig) -> Self {
        Self::build(config, true)
    }

    fn build(config: SyncConfig, creator: bool) -> Self {
        let net = Net::new();
        net.store.init_repository(REPO).unwrap();
        let node_key = creator.then(|| net.node.verifying_key().to_bytes());
        let heights = Arc::new(MemoryHeights::new());
        let syncer = RefSyncer::new(
            config,
            node_key,
            net.store.clone(),
            net.transport.clone(),
            heights.clone(),
        );
        Node {
            net,
            heights,
            syncer,
        }
    }

    /// A commit and its tree, served by peers. Returns the commit hash and
    /// the object list of a reference pointing at it.
    fn publish(&self, subject: &str) -> (ObjectHash, Vec<String>) {
        let (tree, tree_raw) = blob(subject.as_bytes());
        let commit = self.net.transport.insert(self.net.unsigned_commit(tree, subject));
        self.net.transport.insert(tree_raw);
        (commit, vec![commit.to_hex(), tree.to_hex()])
    }

    fn local(&self, name: &str) -> Option<ObjectHash> {
        self.net.store.reference_hash(REPO, name).unwrap()
    }

    fn confirm(&self, references: Vec<PushedReference>, height: u64) -> PushNote {
        let note = self.net.note(references, 0);
        let tx = self.net.push_tx(note.clone(), vec![]);
        self.syncer.on_new_push_tx(&tx, height).unwrap();
        note
    }
}

fn update(name: &str, old: ObjectHash, new: ObjectHash, objects: Vec<String>) -> PushedReference {
    let mut update = reference(name, old, new, 1);
    update.objects = objects;
    update
}

fn quick() -> SyncConfig {
    SyncConfig::default()
        .with_compat_backoff(Duration::ZERO)
        .with_idle_backoff(Duration::from_millis(5), Duration::from_millis(5))
}

#[test]
fn confirmed_update_is_fetched_and_applied() {
    let node = Node::new(quick());
    let (commit, objects) = node.publish("first");
    node.confirm(vec![update(MASTER, ObjectHash::ZERO, commit, objects)], 7);
    assert_eq!(node.syncer.queue_size(), 1);

    node.syncer.run_next().unwrap().unwrap();

    assert_eq!(node.local(MASTER), Some(commit));
    assert_eq!(node.heights.last_synced(REPO), 7);
    assert_eq!(node.net.transport.fetch_count(), 2);
    assert!(node.net.transport.announced().contains(&commit));
    assert!(node.syncer.run_next().is_none());
}

#[test]
fn repeated_notification_is_queued_once() {
    let node = Node::new(quick());
    let (commit, objects) = node.publish("first");
    let note = node.confirm(vec![update(MASTER, ObjectHash::ZERO, commit, objects.clone())], 3);
    node.confirm(vec![update(MASTER, ObjectHash::ZERO, commit, objects)], 3);

    assert_eq!(node.syncer.queue_size(), 1);
    assert!(node.syncer.has_task(&RefTaskKey {
        repo: REPO.into(),
        reference: MASTER.into(),
        note_id: note.id(),
    }));
    let task = &node.syncer.queued_tasks()[0];
    assert_eq!(task.new_hash, commit);
    assert_eq!(task.height, 3);
    assert_eq!(task.compat_retry_count, 0);
}

#[test]
fn deletion_only_note_advances_height_directly() {
    let node = Node::new(quick());
    node.net.store.set_reference(REPO, MASTER, ObjectHash([1; 20]));
    node.confirm(
        vec![reference(MASTER, ObjectHash([1; 20]), ObjectHash::ZERO, 2)],
        9,
    );
    assert_eq!(node.syncer.queue_size(), 0);
    assert_eq!(node.heights.last_synced(REPO), 9);
    assert_eq!(node.local(MASTER), Some(ObjectHash([1; 20])));
}

#[test]
fn height_waits_for_every_reference_of_the_repository() {
    let node = Node::new(quick());
    let (first, first_objects) = node.publish("first");
    let (second, second_objects) = node.publish("second");
    node.confirm(
        vec![
            update(MASTER, ObjectHash::ZERO, first, first_objects),
            update(DEV, ObjectHash::ZERO, second, second_objects),
        ],
        4,
    );
    assert_eq!(node.syncer.queue_size(), 2);

    node.syncer.run_next().unwrap().unwrap();
    assert_eq!(node.heights.last_synced(REPO), 0);
    node.syncer.run_next().unwrap().unwrap();
    assert_eq!(node.heights.last_synced(REPO), 4);
    assert_eq!(node.local(MASTER), Some(first));
    assert_eq!(node.local(DEV), Some(second));
}

#[test]
fn diverged_reference_backs_off() {
    let node = Node::new(quick().with_compat_backoff(Duration::from_secs(60)));
    let (commit, objects) = node.publish("first");
    node.net.store.set_reference(REPO, MASTER, ObjectHash([5; 20]));
    node.confirm(vec![update(MASTER, ObjectHash([6; 20]), commit, objects)], 2);

    node.syncer.run_next().unwrap().unwrap();
    let task = &node.syncer.queued_tasks()[0];
    assert_eq!(task.compat_retry_count, 1);
    assert!(task.next_run_time > Instant::now());

    // Not due yet: handed back untouched.
    node.syncer.run_next().unwrap().unwrap();
    assert_eq!(node.syncer.queued_tasks()[0].compat_retry_count, 1);
    assert_eq!(node.local(MASTER), Some(ObjectHash([5; 20])));
}

#[test]
fn exhausted_divergence_is_dead_lettered_and_retryable() {
    let node = Node::new(quick().with_max_compat_retries(1));
    let (commit, objects) = node.publish("first");
    let local = ObjectHash([5; 20]);
    let expected = ObjectHash([6; 20]);
    node.net.store.set_reference(REPO, MASTER, local);
    let note = node.confirm(vec![update(MASTER, expected, commit, objects.clone())], 2);
    let key = RefTaskKey {
        repo: REPO.into(),
        reference: MASTER.into(),
        note_id: note.id(),
    };

    node.syncer.run_next().unwrap().unwrap();
    match node.syncer.run_next().unwrap() {
        Err(SyncError::IncompatibleReference {
            local: seen,
            expected: wanted,
            ..
        }) => {
            assert_eq!(seen, local);
            assert_eq!(wanted, expected);
        }
        other => panic!("expected an incompatible reference, got {other:?}"),
    }
    assert_eq!(node.syncer.queue_size(), 0);
    let dead = node.syncer.dead_letters();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].old_hash, local);
    assert!(node.syncer.has_task(&key));

    node.confirm(vec![update(MASTER, expected, commit, objects)], 2);
    assert_eq!(node.syncer.queue_size(), 0);

    assert_eq!(node.syncer.retry_dead_letters(), 1);
    assert!(node.syncer.dead_letters().is_empty());
    node.syncer.run_next().unwrap().unwrap();
    assert_eq!(node.local(MASTER), Some(commit));
    assert_eq!(node.heights.last_synced(REPO), 2);
    assert!(!node.syncer.has_task(&key));
}

#[test]
fn fetch_failure_drops_the_task() {
    let node = Node::new(quick());
    let (commit, objects) = node.publish("first");
    node.net.transport.set_failing(true);
    let note = node.confirm(vec![update(MASTER, ObjectHash::ZERO, commit, objects)], 5);

    assert!(matches!(
        node.syncer.run_next(),
        Some(Err(SyncError::Fetch { .. }))
    ));
    assert_eq!(node.syncer.queue_size(), 0);
    assert!(!node.syncer.has_task(&RefTaskKey {
        repo: REPO.into(),
        reference: MASTER.into(),
        note_id: note.id(),
    }));
    assert_eq!(node.heights.last_synced(REPO), 0);
    assert_eq!(node.local(MASTER), None);
}

#[test]
fn failed_sibling_update_holds_the_height_until_redelivered() {
    let node = Node::new(quick());
    // The dev commit is not served by any peer yet.
    let (tree, tree_raw) = blob(b"dev");
    let dev_raw = node.net.unsigned_commit(tree, "dev");
    let dev = pushnet::git::object_hash(&dev_raw);
    let (master, master_objects) = node.publish("master");
    let note = node.net.note(
        vec![
            update(DEV, ObjectHash::ZERO, dev, vec![dev.to_hex(), tree.to_hex()]),
            update(MASTER, ObjectHash::ZERO, master, master_objects),
        ],
        0,
    );
    let tx = node.net.push_tx(note, vec![]);
    node.syncer.on_new_push_tx(&tx, 4).unwrap();

    assert!(matches!(
        node.syncer.run_next(),
        Some(Err(SyncError::Fetch { .. }))
    ));
    node.syncer.run_next().unwrap().unwrap();
    assert_eq!(node.local(DEV), None);
    assert_eq!(node.local(MASTER), Some(master));
    assert_eq!(node.heights.last_synced(REPO), 0);

    // A later block applies but may not move the height past block 4.
    let (next, next_objects) = node.publish("next");
    node.confirm(vec![update("refs/heads/next", ObjectHash::ZERO, next, next_objects)], 5);
    node.syncer.run_next().unwrap().unwrap();
    assert_eq!(node.heights.last_synced(REPO), 0);

    node.net.transport.insert(dev_raw);
    node.net.transport.insert(tree_raw);
    node.syncer.on_new_push_tx(&tx, 4).unwrap();
    assert_eq!(node.syncer.queue_size(), 2);
    node.syncer.run_next().unwrap().unwrap();
    node.syncer.run_next().unwrap().unwrap();
    assert_eq!(node.local(DEV), Some(dev));
    assert_eq!(node.heights.last_synced(REPO), 5);
}

#[test]
fn note_creator_applies_from_local_objects() {
    let node = Node::creator(quick());
    let (tree, tree_raw) = blob(b"local");
    let commit = node
        .net
        .store
        .insert_object(REPO, node.net.unsigned_commit(tree, "local"));
    node.net.store.insert_object(REPO, tree_raw);
    let objects = vec![commit.to_hex(), tree.to_hex()];
    node.confirm(vec![update(MASTER, ObjectHash::ZERO, commit, objects)], 1);

    node.syncer.run_next().unwrap().unwrap();
    assert_eq!(node.local(MASTER), Some(commit));
    assert_eq!(node.net.transport.fetch_count(), 0);
}

#[test]
fn endorser_applies_from_local_objects() {
    let net = Net::new();
    let endorser = [8; 32];
    net.store.init_repository(REPO).unwrap();
    let heights = Arc::new(MemoryHeights::new());
    let syncer = RefSyncer::new(
        quick(),
        Some(endorser),
        net.store.clone(),
        net.transport.clone(),
        heights.clone(),
    );

    let (tree, tree_raw) = blob(b"local");
    let commit = net.store.insert_object(REPO, net.unsigned_commit(tree, "local"));
    net.store.insert_object(REPO, tree_raw);
    let note = net.note(
        vec![update(
            MASTER,
            ObjectHash::ZERO,
            commit,
            vec![commit.to_hex(), tree.to_hex()],
        )],
        0,
    );
    let endorsement = PushEndorsement {
        note_id: Some(note.id()),
        sender_pub_key: Some(endorser),
        signature: vec![],
    };
    syncer
        .on_new_push_tx(&net.push_tx(note, vec![endorsement]), 1)
        .unwrap();

    syncer.run_next().unwrap().unwrap();
    assert_eq!(net.store.reference_hash(REPO, MASTER).unwrap(), Some(commit));
    assert_eq!(net.transport.fetch_count(), 0);
    assert_eq!(heights.last_synced(REPO), 1);
}

#[test]
fn already_applied_update_only_advances_height() {
    let node = Node::new(quick());
    let (commit, objects) = node.publish("first");
    node.net.store.set_reference(REPO, MASTER, commit);
    node.confirm(vec![update(MASTER, ObjectHash::ZERO, commit, objects)], 6);

    node.syncer.run_next().unwrap().unwrap();
    assert_eq!(node.net.transport.fetch_count(), 0);
    assert_eq!(node.heights.last_synced(REPO), 6);
}

#[test]
fn missing_local_repository_is_reported() {
    let net = Net::new();
    let heights = Arc::new(MemoryHeights::new());
    let syncer = RefSyncer::new(
        quick(),
        None,
        net.store.clone(),
        net.transport.clone(),
        heights.clone(),
    );
    let note = net.note(
        vec![reference(MASTER, ObjectHash::ZERO, ObjectHash([1; 20]), 1)],
        0,
    );
    syncer.on_new_push_tx(&net.push_tx(note, vec![]), 1).unwrap();

    match syncer.run_next() {
        Some(Err(SyncError::RepositoryMissing(repo))) => assert_eq!(repo, REPO),
        other => panic!("expected a missing repository, got {other:?}"),
    }
    assert_eq!(heights.last_synced(REPO), 0);
}

#[test]
fn non_push_transactions_are_ignored() {
    let node = Node::new(quick());
    let tx = util::transfer(&node.net.pusher, 1, 1);
    node.syncer.on_new_push_tx(&tx, 3).unwrap();
    assert_eq!(node.syncer.queue_size(), 0);
    assert_eq!(node.heights.last_synced(REPO), 0);
}

#[test]
#[should_panic(expected = "already started")]
fn double_start_panics() {
    let node = Node::new(quick().with_workers(1));
    node.syncer.start();
    node.syncer.start();
}

#[test]
fn workers_apply_queued_updates() {
    let node = Node::new(quick().with_workers(2));
    let (commit, objects) = node.publish("first");
    node.syncer.start();
    assert!(node.syncer.is_running());
    node.confirm(vec![update(MASTER, ObjectHash::ZERO, commit, objects)], 3);

    let deadline = Instant::now() + Duration::from_secs(5);
    while node.heights.last_synced(REPO) < 3 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    node.syncer.stop();
    assert!(!node.syncer.is_running());
    assert_eq!(node.local(MASTER), Some(commit));
    assert_eq!(node.heights.last_synced(REPO), 3);
}
