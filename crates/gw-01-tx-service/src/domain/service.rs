//! Transaction cache with multiple indices and FIFO eviction.

use shared_types::{GatewayError, Sha256Hash, ShortId, NULL_SHORT_ID};
use std::collections::{HashMap, VecDeque};
use tracing::{debug, error};

/// Transaction service configuration.
#[derive(Clone, Debug)]
pub struct TxServiceConfig {
    /// Maximum number of cached entries before FIFO eviction.
    pub entry_budget: usize,
    /// Maximum total content bytes before FIFO eviction.
    pub byte_budget: usize,
    /// Number of confirmed blocks to keep seen short ids for before their
    /// transactions become eligible for removal.
    pub seen_blocks_window: usize,
}

impl Default for TxServiceConfig {
    fn default() -> Self {
        Self {
            entry_budget: 200_000,
            byte_budget: 256 * 1024 * 1024,
            seen_blocks_window: 6,
        }
    }
}

/// Monotonic counters surfaced in the periodic stats log line.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TxServiceCounters {
    /// Content writes ignored because contents were already present.
    pub duplicate_contents: u64,
    /// Short id assignments that displaced an existing binding.
    pub sid_conflicts: u64,
    /// Entries removed by budget eviction.
    pub evicted: u64,
    /// Entries removed by confirmed-block sweeps.
    pub swept_after_confirmation: u64,
}

/// Result of a `set_transaction_contents` call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SetContentsOutcome {
    /// Contents stored for the first time.
    Stored,
    /// Contents were already present; the write was ignored and counted.
    DuplicateIgnored,
}

/// Short ids a decompression could not resolve, split by failure mode.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MissingTransactions {
    /// Short ids with no known hash.
    pub sids: Vec<ShortId>,
    /// Hashes known for their short id but with no contents yet.
    pub hashes: Vec<Sha256Hash>,
}

impl MissingTransactions {
    /// True if anything at all is missing.
    pub fn any(&self) -> bool {
        !self.sids.is_empty() || !self.hashes.is_empty()
    }
}

#[derive(Debug, Default)]
struct TxEntry {
    short_ids: Vec<ShortId>,
    contents: Option<Vec<u8>>,
}

/// The hash ↔ short id ↔ contents cache.
#[derive(Debug)]
pub struct TransactionService {
    config: TxServiceConfig,
    by_hash: HashMap<Sha256Hash, TxEntry>,
    by_short_id: HashMap<ShortId, Sha256Hash>,
    insertion_order: VecDeque<Sha256Hash>,
    content_bytes: usize,
    /// Pin counts per hash; pinned entries survive budget eviction.
    protected: HashMap<Sha256Hash, usize>,
    /// Short ids seen in recent blocks, oldest block first.
    seen_in_blocks: VecDeque<(Sha256Hash, Vec<ShortId>)>,
    /// Seen-sid sets parked until their grace alarm fires.
    pending_seen: HashMap<Sha256Hash, Vec<ShortId>>,
    counters: TxServiceCounters,
}

impl TransactionService {
    /// Creates an empty service.
    pub fn new(config: TxServiceConfig) -> Self {
        Self {
            config,
            by_hash: HashMap::new(),
            by_short_id: HashMap::new(),
            insertion_order: VecDeque::new(),
            content_bytes: 0,
            protected: HashMap::new(),
            seen_in_blocks: VecDeque::new(),
            pending_seen: HashMap::new(),
            counters: TxServiceCounters::default(),
        }
    }

    /// Creates a service with default budgets.
    pub fn with_defaults() -> Self {
        Self::new(TxServiceConfig::default())
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.by_hash.len()
    }

    /// True if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.by_hash.is_empty()
    }

    /// Total cached content bytes.
    pub fn content_bytes(&self) -> usize {
        self.content_bytes
    }

    /// Snapshot of the service counters.
    pub fn counters(&self) -> TxServiceCounters {
        self.counters
    }

    /// Binds `short_id` to `hash`, creating the entry if needed.
    ///
    /// Idempotent for an existing binding. A short id already bound to a
    /// different hash is rebound to the newer hash (last writer wins) and the
    /// call reports `SidConflict` so the caller can surface the anomaly.
    pub fn assign_short_id(
        &mut self,
        hash: Sha256Hash,
        short_id: ShortId,
    ) -> Result<(), GatewayError> {
        if short_id == NULL_SHORT_ID {
            debug!(%hash, "ignoring null short id assignment");
            return Ok(());
        }

        let mut conflict = None;
        if let Some(existing) = self.by_short_id.get(&short_id).copied() {
            if existing == hash {
                return Ok(());
            }
            // Impossible by protocol, handled defensively: unbind from the
            // previous hash and let the newer assignment win.
            error!(short_id, %existing, %hash, "short id conflict, rebinding");
            self.counters.sid_conflicts += 1;
            if let Some(entry) = self.by_hash.get_mut(&existing) {
                entry.short_ids.retain(|sid| *sid != short_id);
            }
            conflict = Some(existing);
        }

        self.entry_mut(hash).short_ids.push(short_id);
        self.by_short_id.insert(short_id, hash);
        self.evict_over_budget();

        match conflict {
            Some(existing) => Err(GatewayError::SidConflict { short_id, existing }),
            None => Ok(()),
        }
    }

    /// Stores contents for `hash`. The first writer wins; later writes are
    /// ignored and counted, even if the bytes differ.
    pub fn set_transaction_contents(
        &mut self,
        hash: Sha256Hash,
        contents: Vec<u8>,
    ) -> SetContentsOutcome {
        let contents_len = contents.len();
        let entry = self.entry_mut(hash);
        if entry.contents.is_some() {
            self.counters.duplicate_contents += 1;
            return SetContentsOutcome::DuplicateIgnored;
        }
        entry.contents = Some(contents);
        self.content_bytes += contents_len;
        self.evict_over_budget();
        SetContentsOutcome::Stored
    }

    /// True if `short_id` resolves to a hash.
    pub fn has_short_id(&self, short_id: ShortId) -> bool {
        self.by_short_id.contains_key(&short_id)
    }

    /// True if `hash` has a short id assigned.
    pub fn has_transaction_short_id(&self, hash: &Sha256Hash) -> bool {
        self.by_hash
            .get(hash)
            .map(|e| !e.short_ids.is_empty())
            .unwrap_or(false)
    }

    /// True if contents are cached for `hash`.
    pub fn has_transaction_contents(&self, hash: &Sha256Hash) -> bool {
        self.by_hash
            .get(hash)
            .map(|e| e.contents.is_some())
            .unwrap_or(false)
    }

    /// Resolves a short id to its hash and (possibly absent) contents.
    pub fn get_transaction(&self, short_id: ShortId) -> Option<(Sha256Hash, Option<&[u8]>)> {
        let hash = self.by_short_id.get(&short_id)?;
        let entry = self.by_hash.get(hash)?;
        Some((*hash, entry.contents.as_deref()))
    }

    /// Contents cached for `hash`, if any.
    pub fn get_transaction_by_hash(&self, hash: &Sha256Hash) -> Option<&[u8]> {
        self.by_hash.get(hash)?.contents.as_deref()
    }

    /// Every short id currently assigned to `hash`.
    pub fn short_ids_for(&self, hash: &Sha256Hash) -> &[ShortId] {
        self.by_hash
            .get(hash)
            .map(|e| e.short_ids.as_slice())
            .unwrap_or(&[])
    }

    /// First short id assigned to `hash`, or `NULL_SHORT_ID`.
    pub fn get_short_id(&self, hash: &Sha256Hash) -> ShortId {
        self.by_hash
            .get(hash)
            .and_then(|e| e.short_ids.first().copied())
            .unwrap_or(NULL_SHORT_ID)
    }

    /// Splits `short_ids` into the subset with no known hash and the subset
    /// with a hash but no contents.
    pub fn get_missing_transactions(&self, short_ids: &[ShortId]) -> MissingTransactions {
        let mut missing = MissingTransactions::default();
        for &sid in short_ids {
            match self.by_short_id.get(&sid) {
                None => missing.sids.push(sid),
                Some(hash) => {
                    if !self.has_transaction_contents(hash) && !missing.hashes.contains(hash) {
                        missing.hashes.push(*hash);
                    }
                }
            }
        }
        missing
    }

    /// Restartable iteration over all currently cached hashes.
    pub fn transaction_hashes(&self) -> impl Iterator<Item = Sha256Hash> + '_ {
        self.by_hash.keys().copied()
    }

    /// Pins `hash` against budget eviction while a recovery references it.
    pub fn protect(&mut self, hash: Sha256Hash) {
        *self.protected.entry(hash).or_insert(0) += 1;
    }

    /// Releases one recovery pin for `hash`.
    pub fn unprotect(&mut self, hash: &Sha256Hash) {
        if let Some(count) = self.protected.get_mut(hash) {
            *count -= 1;
            if *count == 0 {
                self.protected.remove(hash);
            }
        }
    }

    /// Records that `short_ids` appeared in a now-seen block. Once the block
    /// falls out of the confirmation window its transactions are removed.
    pub fn track_seen_short_ids(&mut self, block_hash: Sha256Hash, short_ids: Vec<ShortId>) {
        self.seen_in_blocks.push_back((block_hash, short_ids));
        while self.seen_in_blocks.len() > self.config.seen_blocks_window {
            let (confirmed_block, sids) = self
                .seen_in_blocks
                .pop_front()
                .expect("window length checked");
            debug!(block = %confirmed_block, count = sids.len(), "sweeping confirmed short ids");
            for sid in sids {
                if self.remove_transaction_by_short_id(sid) {
                    self.counters.swept_after_confirmation += 1;
                }
            }
        }
    }

    /// Parks a seen-sid set until the caller's grace alarm fires; the delay
    /// keeps a locally compressed block's transactions available for BDN-side
    /// recovery requests.
    pub fn track_seen_short_ids_delayed(&mut self, block_hash: Sha256Hash, short_ids: Vec<ShortId>) {
        self.pending_seen.insert(block_hash, short_ids);
    }

    /// Commits a parked seen-sid set once its grace alarm fires.
    pub fn commit_delayed_seen(&mut self, block_hash: &Sha256Hash) {
        if let Some(short_ids) = self.pending_seen.remove(block_hash) {
            self.track_seen_short_ids(*block_hash, short_ids);
        }
    }

    /// Removes every transaction in a confirmed block, given its short ids
    /// and hashes (driven by relay cleanup messages).
    pub fn on_block_confirmed(
        &mut self,
        short_ids: &[ShortId],
        hashes: &[Sha256Hash],
    ) -> usize {
        let mut removed = 0;
        for &sid in short_ids {
            if self.remove_transaction_by_short_id(sid) {
                removed += 1;
            }
        }
        for hash in hashes {
            if self.remove_transaction_by_hash(hash) {
                removed += 1;
            }
        }
        self.counters.swept_after_confirmation += removed as u64;
        removed
    }

    /// Removes the transaction a short id resolves to, cascading to all of
    /// the hash's short ids. Returns true if an entry was removed.
    pub fn remove_transaction_by_short_id(&mut self, short_id: ShortId) -> bool {
        match self.by_short_id.get(&short_id).copied() {
            Some(hash) => self.remove_transaction_by_hash(&hash),
            None => false,
        }
    }

    /// Removes the entry for `hash` and all of its short ids. Returns true if
    /// an entry was removed.
    pub fn remove_transaction_by_hash(&mut self, hash: &Sha256Hash) -> bool {
        match self.by_hash.remove(hash) {
            Some(entry) => {
                for sid in &entry.short_ids {
                    self.by_short_id.remove(sid);
                }
                if let Some(contents) = &entry.contents {
                    self.content_bytes -= contents.len();
                }
                self.protected.remove(hash);
                true
            }
            None => false,
        }
    }

    fn entry_mut(&mut self, hash: Sha256Hash) -> &mut TxEntry {
        if !self.by_hash.contains_key(&hash) {
            self.insertion_order.push_back(hash);
        }
        self.by_hash.entry(hash).or_default()
    }

    fn over_budget(&self) -> bool {
        self.by_hash.len() > self.config.entry_budget
            || self.content_bytes > self.config.byte_budget
    }

    fn evict_over_budget(&mut self) {
        let mut pinned = Vec::new();
        while self.over_budget() {
            let Some(oldest) = self.insertion_order.pop_front() else {
                break;
            };
            if !self.by_hash.contains_key(&oldest) {
                continue; // already removed by a sweep
            }
            if self.protected.contains_key(&oldest) {
                pinned.push(oldest);
                continue;
            }
            self.remove_transaction_by_hash(&oldest);
            self.counters.evicted += 1;
        }
        // Pinned entries keep their place at the head of the FIFO.
        for hash in pinned.into_iter().rev() {
            self.insertion_order.push_front(hash);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(byte: u8) -> Sha256Hash {
        Sha256Hash::new([byte; 32])
    }

    #[test]
    fn test_assign_then_contents() {
        let mut service = TransactionService::with_defaults();
        assert!(service.assign_short_id(hash(1), 5).is_ok());
        assert_eq!(
            service.set_transaction_contents(hash(1), vec![1, 2, 3]),
            SetContentsOutcome::Stored
        );

        assert!(service.has_short_id(5));
        assert_eq!(service.get_short_id(&hash(1)), 5);
        let (tx_hash, contents) = service.get_transaction(5).unwrap();
        assert_eq!(tx_hash, hash(1));
        assert_eq!(contents, Some(&[1u8, 2, 3][..]));
    }

    #[test]
    fn test_assign_is_idempotent() {
        let mut service = TransactionService::with_defaults();
        service.assign_short_id(hash(1), 5).unwrap();
        service.assign_short_id(hash(1), 5).unwrap();
        assert_eq!(service.by_hash.get(&hash(1)).unwrap().short_ids, vec![5]);
    }

    #[test]
    fn test_first_content_writer_wins() {
        let mut service = TransactionService::with_defaults();
        service.set_transaction_contents(hash(1), vec![1]);
        assert_eq!(
            service.set_transaction_contents(hash(1), vec![2, 2]),
            SetContentsOutcome::DuplicateIgnored
        );
        assert_eq!(service.get_transaction_by_hash(&hash(1)), Some(&[1u8][..]));
        assert_eq!(service.counters().duplicate_contents, 1);
        assert_eq!(service.content_bytes(), 1);
    }

    #[test]
    fn test_sid_conflict_rebinds_to_newer_hash() {
        let mut service = TransactionService::with_defaults();
        service.assign_short_id(hash(1), 5).unwrap();
        let err = service.assign_short_id(hash(2), 5).unwrap_err();
        assert_eq!(
            err,
            GatewayError::SidConflict {
                short_id: 5,
                existing: hash(1)
            }
        );

        // Newer binding wins and the map stays injective.
        assert_eq!(service.get_transaction(5).unwrap().0, hash(2));
        assert_eq!(service.get_short_id(&hash(1)), NULL_SHORT_ID);
        assert_eq!(service.counters().sid_conflicts, 1);
    }

    #[test]
    fn test_null_short_id_is_ignored() {
        let mut service = TransactionService::with_defaults();
        service.assign_short_id(hash(1), NULL_SHORT_ID).unwrap();
        assert!(!service.has_transaction_short_id(&hash(1)));
    }

    #[test]
    fn test_hash_can_collect_multiple_sids() {
        let mut service = TransactionService::with_defaults();
        service.assign_short_id(hash(1), 5).unwrap();
        service.assign_short_id(hash(1), 9).unwrap();

        assert_eq!(service.get_transaction(9).unwrap().0, hash(1));
        assert_eq!(service.get_short_id(&hash(1)), 5);

        // Cascade removes both bindings.
        assert!(service.remove_transaction_by_hash(&hash(1)));
        assert!(!service.has_short_id(5));
        assert!(!service.has_short_id(9));
    }

    #[test]
    fn test_missing_transactions_split() {
        let mut service = TransactionService::with_defaults();
        service.assign_short_id(hash(1), 1).unwrap();
        service.assign_short_id(hash(2), 2).unwrap();
        service.set_transaction_contents(hash(2), vec![0xAA]);

        let missing = service.get_missing_transactions(&[1, 2, 3]);
        assert!(missing.any());
        assert_eq!(missing.sids, vec![3]);
        assert_eq!(missing.hashes, vec![hash(1)]);

        let complete = service.get_missing_transactions(&[2]);
        assert!(!complete.any());
    }

    #[test]
    fn test_entry_budget_eviction_is_fifo() {
        let mut service = TransactionService::new(TxServiceConfig {
            entry_budget: 2,
            byte_budget: usize::MAX,
            seen_blocks_window: 6,
        });
        service.assign_short_id(hash(1), 1).unwrap();
        service.assign_short_id(hash(2), 2).unwrap();
        service.assign_short_id(hash(3), 3).unwrap();

        assert_eq!(service.len(), 2);
        assert!(!service.has_short_id(1));
        assert!(service.has_short_id(2));
        assert!(service.has_short_id(3));
        assert_eq!(service.counters().evicted, 1);
    }

    #[test]
    fn test_eviction_skips_protected_entries() {
        let mut service = TransactionService::new(TxServiceConfig {
            entry_budget: 2,
            byte_budget: usize::MAX,
            seen_blocks_window: 6,
        });
        service.assign_short_id(hash(1), 1).unwrap();
        service.protect(hash(1));
        service.assign_short_id(hash(2), 2).unwrap();
        service.assign_short_id(hash(3), 3).unwrap();

        // Oldest is pinned, so the next oldest goes.
        assert!(service.has_short_id(1));
        assert!(!service.has_short_id(2));

        service.unprotect(&hash(1));
        service.assign_short_id(hash(4), 4).unwrap();
        assert!(!service.has_short_id(1));
    }

    #[test]
    fn test_byte_budget_eviction() {
        let mut service = TransactionService::new(TxServiceConfig {
            entry_budget: usize::MAX,
            byte_budget: 10,
            seen_blocks_window: 6,
        });
        service.set_transaction_contents(hash(1), vec![0; 6]);
        service.set_transaction_contents(hash(2), vec![0; 6]);

        assert_eq!(service.len(), 1);
        assert!(service.has_transaction_contents(&hash(2)));
        assert!(service.content_bytes() <= 10);
    }

    #[test]
    fn test_seen_short_ids_sweep_after_window() {
        let mut service = TransactionService::new(TxServiceConfig {
            entry_budget: usize::MAX,
            byte_budget: usize::MAX,
            seen_blocks_window: 2,
        });
        for i in 1..=3u8 {
            service.assign_short_id(hash(i), i as ShortId).unwrap();
            service.track_seen_short_ids(hash(100 + i), vec![i as ShortId]);
        }

        // Window of 2: the first tracked block has been swept.
        assert!(!service.has_short_id(1));
        assert!(service.has_short_id(2));
        assert!(service.has_short_id(3));
    }

    #[test]
    fn test_delayed_seen_commits_on_alarm() {
        let mut service = TransactionService::new(TxServiceConfig {
            entry_budget: usize::MAX,
            byte_budget: usize::MAX,
            seen_blocks_window: 0,
        });
        service.assign_short_id(hash(1), 1).unwrap();
        service.track_seen_short_ids_delayed(hash(200), vec![1]);
        assert!(service.has_short_id(1));

        service.commit_delayed_seen(&hash(200));
        assert!(!service.has_short_id(1));
    }

    #[test]
    fn test_short_id_map_stays_injective_under_random_ops() {
        use rand::{Rng, SeedableRng};
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let mut service = TransactionService::with_defaults();

        for _ in 0..5_000 {
            let hash = Sha256Hash::new([rng.gen_range(0..32u8); 32]);
            let sid: ShortId = rng.gen_range(1..64);
            let _ = service.assign_short_id(hash, sid);
        }

        // Every sid resolves to a hash whose entry lists that sid.
        for (&sid, hash) in &service.by_short_id {
            let entry = service.by_hash.get(hash).expect("hash entry exists");
            assert!(entry.short_ids.contains(&sid));
        }
        // Every listed sid points back at its owning hash.
        for (hash, entry) in &service.by_hash {
            for sid in &entry.short_ids {
                assert_eq!(service.by_short_id.get(sid), Some(hash));
            }
        }
    }
}
