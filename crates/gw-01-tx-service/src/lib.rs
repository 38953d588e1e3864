//! # Transaction Service (GW-01)
//!
//! Bidirectional mapping between transaction hashes, overlay short ids, and
//! transaction contents. This cache is what makes short-id block compression
//! work: a block arriving from the BDN references transactions by short id,
//! and this service resolves them back to bytes.
//!
//! ## Data Structures
//!
//! - `by_hash`: O(1) lookup of short ids and contents by transaction hash
//! - `by_short_id`: O(1) short id to hash resolution
//! - `insertion_order`: FIFO log driving eviction
//!
//! ## Invariants Enforced
//!
//! - A hash maps to at most one contents (first writer wins)
//! - A short id maps to exactly one hash (the map stays injective)
//! - Deleting a hash cascades to all of its short ids
//! - Entries pinned by an in-progress block recovery are never evicted

pub mod domain;

pub use domain::service::{
    MissingTransactions, SetContentsOutcome, TransactionService, TxServiceConfig,
    TxServiceCounters,
};
