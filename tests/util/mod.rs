#![allow(dead_code)]

use std::sync::Arc;

use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;

use pushnet::git;
use pushnet::git::Commit;
use pushnet::git::ObjectKind;
use pushnet::memory::MemoryGitStore;
use pushnet::memory::MemoryKeys;
use pushnet::memory::MemoryLedger;
use pushnet::memory::MemoryTransport;
use pushnet::prelude::*;
use pushnet::state::Account;
use pushnet::state::PushKey;
use pushnet::state::Repository;
use pushnet::txline;
use pushnet::txline::TxLine;

pub const NOW: i64 = 1_700_000_000;
pub const REPO: &str = "repo1";
pub const MASTER: &str = "refs/heads/master";

pub fn transfer(key: &SigningKey, nonce: u64, fee: u64) -> Transaction {
    transfer_at(key, nonce, fee, NOW)
}

pub fn transfer_at(key: &SigningKey, nonce: u64, fee: u64, timestamp: i64) -> Transaction {
    let payload = TxPayload::Transfer {
        to: Address([9; 20]),
        value: 1,
    };
    Transaction::new(key, nonce, fee, timestamp, payload)
}

pub fn reference(name: &str, old: ObjectHash, new: ObjectHash, nonce: u64) -> PushedReference {
    PushedReference {
        name: name.into(),
        old_hash: old.to_hex(),
        new_hash: new.to_hex(),
        nonce,
        account_nonce: 1,
        fee: "1".into(),
        objects: vec![],
        merge_proposal_id: None,
    }
}

/// A node's collaborators held in memory plus a registered pusher.
pub struct Net {
    pub ledger: Arc<MemoryLedger>,
    pub keys: Arc<MemoryKeys>,
    pub store: Arc<MemoryGitStore>,
    pub transport: Arc<MemoryTransport>,
    pub pusher: SigningKey,
    pub pusher_address: Address,
    pub key_id: KeyId,
    /// The node that creates and signs push notes.
    pub node: SigningKey,
}

impl Net {
    pub fn new() -> Self {
        init_tracing();
        let ledger = Arc::new(MemoryLedger::new());
        let keys = Arc::new(MemoryKeys::new());
        let pusher = SigningKey::generate(&mut OsRng);
        let pusher_address = Address::from_public_key(&pusher.verifying_key());
        let key_id = keys
            .register(PushKey {
                public_key: pusher.verifying_key().to_bytes(),
                address: pusher_address,
            })
            .unwrap();
        ledger.set_account(
            pusher_address,
            Account {
                nonce: 0,
                balance: 1_000,
            },
        );
        ledger.set_repository(REPO, Repository::default());
        Net {
            ledger,
            keys,
            store: Arc::new(MemoryGitStore::new()),
            transport: Arc::new(MemoryTransport::new()),
            pusher,
            pusher_address,
            key_id,
            node: SigningKey::generate(&mut OsRng),
        }
    }

    /// A raw commit whose message carries a `tx:` trailer signed by the
    /// pusher.
    pub fn signed_commit(
        &self,
        tree: ObjectHash,
        parents: Vec<ObjectHash>,
        author: &str,
        subject: &str,
    ) -> Vec<u8> {
        let line = TxLine::new("1", 1, self.key_id);
        let commit = Commit {
            tree,
            parents,
            author: author.into(),
            committer: author.into(),
            message: format!("{subject}\n\n{}\n", line.render_unsigned()),
        };
        let content = String::from_utf8(commit.encode()).unwrap();
        let signed = txline::sign(&content, &self.pusher).unwrap();
        git::encode_raw(ObjectKind::Commit, signed.as_bytes())
    }

    pub fn unsigned_commit(&self, tree: ObjectHash, subject: &str) -> Vec<u8> {
        Commit {
            tree,
            parents: vec![],
            author: "alice <alice@example.com> 1700000000 +0000".into(),
            committer: "alice <alice@example.com> 1700000000 +0000".into(),
            message: format!("{subject}\n"),
        }
        .to_raw()
    }

    /// A note by the pusher, signed by the node.
    pub fn note(&self, references: Vec<PushedReference>, size: u64) -> PushNote {
        let mut note = PushNote {
            repo_name: REPO.into(),
            references,
            pusher_key_id: self.key_id.as_bytes().to_vec(),
            pusher_address: self.pusher_address,
            timestamp: NOW,
            size,
            ..Default::default()
        };
        note.sign(&self.node);
        note
    }

    pub fn push_tx(&self, note: PushNote, endorsements: Vec<PushEndorsement>) -> Transaction {
        let payload = TxPayload::Push { note, endorsements };
        Transaction::new(&self.pusher, 1, 10, NOW, payload)
    }

    pub fn validator(&self) -> PushNoteValidator {
        PushNoteValidator::new(
            ValidatorConfig::default(),
            self.ledger.clone(),
            self.keys.clone(),
            self.store.clone(),
            self.transport.clone(),
        )
    }
}

/// Routes crate logs to the test harness; filtered by `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub const AUTHOR: &str = "alice <alice@example.com> 1700000000 +0000";

/// A blob object and its hash.
pub fn blob(content: &[u8]) -> (ObjectHash, Vec<u8>) {
    let raw = git::encode_raw(ObjectKind::Blob, content);
    (git::object_hash(&raw), raw)
}
