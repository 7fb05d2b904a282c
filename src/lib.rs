//! Push replication for a decentralized git hosting node.
//!
//! Anyone may propose an update to a repository hosted by the network. This
//! crate decides which proposals are admitted, whether a proposed update is
//! acceptable, and how confirmed updates reach each node's local copy:
//!
//! * [`pool::AdmissionPool`] orders and bounds pending transactions.
//! * [`validation`] checks push notes against their own shape, the ledger,
//!   the objects they reference and any merge proposal they execute.
//! * [`quorum`] checks endorsements from the storers selected to vouch for
//!   a note.
//! * [`sync::watcher::Watcher`] and [`sync::refsync::RefSyncer`] bring local
//!   repositories up to the confirmed state.
//!
//! The ledger, key store, peer transport and local git storage belong to the
//! embedding node and are reached through the traits in [`state`];
//! [`memory`] implements all of them in memory.

pub mod codec;
pub mod config;
pub mod git;
pub mod hash;
pub mod memory;
pub mod pack;
pub mod pool;
pub mod push;
pub mod quorum;
pub mod state;
pub mod sync;
pub mod tx;
pub mod txline;
pub mod validation;

pub mod prelude {
    pub use crate::config::PoolConfig;
    pub use crate::config::SyncConfig;
    pub use crate::config::ValidatorConfig;
    pub use crate::hash::Address;
    pub use crate::hash::KeyId;
    pub use crate::hash::NoteId;
    pub use crate::hash::ObjectHash;
    pub use crate::hash::TxHash;
    pub use crate::pool::AdmissionPool;
    pub use crate::pool::PoolError;
    pub use crate::push::PushEndorsement;
    pub use crate::push::PushNote;
    pub use crate::push::PushedReference;
    pub use crate::sync::refsync::RefSyncer;
    pub use crate::sync::watcher::Watcher;
    pub use crate::sync::PushTxHandler;
    pub use crate::sync::SyncError;
    pub use crate::tx::Transaction;
    pub use crate::tx::TxPayload;
    pub use crate::validation::FieldError;
    pub use crate::validation::PushNoteValidator;
    pub use crate::validation::ValidationError;
}
