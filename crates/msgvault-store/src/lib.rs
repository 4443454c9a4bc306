//! Persistent storage for the msgvault core.
//!
//! Two concerns live here:
//!
//! - the durable per-conversation sequence counter ([`SeqCounterStore`]),
//!   the source of truth for sequence assignment, and
//! - the bucketed message document database ([`MsgDocDatabase`]) plus the
//!   high-level [`MsgDocStore`] that implements insert-or-update-in-place
//!   block writes, range reads with revoke/quote overlays, and retention.
//!
//! Both traits come with an in-memory implementation ([`MemoryStores`],
//! for tests and simulation) and a redb-backed one ([`RedbStores`], ACID
//! transactions, survives restarts).

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod counter;
mod db;
mod doc_store;
mod error;

pub use counter::SeqCounterStore;
pub use db::{MemoryStores, MsgDocDatabase, RedbStores};
pub use doc_store::{MsgDocStore, RetentionOutcome};
pub use error::StoreError;
