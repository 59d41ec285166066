//! Cache entries and LRU eviction
//!
//! Entries live in an unbounded [`LruCache`] whose recency order is the
//! access order: inserting or reading an entry makes it the most recent, so
//! entries that were never read again keep their insertion order. The memory
//! budget is enforced separately over the pixel bytes of ready entries;
//! pinned pages are never evicted.

use diary_render::{Artifact, Generation, PageId};
use diary_scheduler::RenderError;
use log::debug;
use lru::LruCache;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

/// State of a cache entry
#[derive(Debug, Clone, PartialEq)]
pub enum EntryState {
    Empty,
    /// A render job for the entry's generation exists
    Pending,
    Ready,
    /// Retries ran out or the page cannot be rendered; retried only on an
    /// explicit request
    Failed(RenderError),
}

/// Cached state of one page
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub page_id: PageId,

    /// Generation the entry belongs to
    pub generation: Generation,

    pub artifact: Option<Arc<Artifact>>,
    pub state: EntryState,
    pub last_access: Instant,

    /// Pixel bytes held by `artifact`
    pub size_bytes: usize,
}

impl CacheEntry {
    fn new(page_id: PageId, generation: Generation) -> Self {
        Self {
            page_id,
            generation,
            artifact: None,
            state: EntryState::Empty,
            last_access: Instant::now(),
            size_bytes: 0,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state == EntryState::Ready
    }

    /// Whether the entry holds an artifact of exactly `generation`
    pub fn is_valid_for(&self, generation: Generation) -> bool {
        self.is_ready() && self.generation == generation && self.artifact.is_some()
    }
}

/// All cache entries plus pins and the memory budget
pub struct EntryStore {
    entries: LruCache<PageId, CacheEntry>,
    pinned: HashSet<PageId>,
    size_bytes: usize,
    budget_bytes: usize,
    evictions: u64,
}

impl EntryStore {
    pub fn new(budget_bytes: usize) -> Self {
        Self {
            entries: LruCache::unbounded(),
            pinned: HashSet::new(),
            size_bytes: 0,
            budget_bytes,
            evictions: 0,
        }
    }

    /// The artifact for `page_id` if it is valid for `generation`
    ///
    /// A hit counts as an access.
    pub fn lookup(&mut self, page_id: PageId, generation: Generation) -> Option<Arc<Artifact>> {
        if !self.entries.peek(&page_id)?.is_valid_for(generation) {
            return None;
        }
        let entry = self.entries.get_mut(&page_id)?;
        entry.last_access = Instant::now();
        entry.artifact.clone()
    }

    /// Look at an entry without touching its recency
    pub fn peek(&self, page_id: PageId) -> Option<&CacheEntry> {
        self.entries.peek(&page_id)
    }

    /// Record that a job for `generation` now exists
    pub fn mark_pending(&mut self, page_id: PageId, generation: Generation) {
        let entry = self.entry_mut(page_id, generation);
        entry.generation = generation;
        entry.state = EntryState::Pending;
        entry.last_access = Instant::now();
        let freed = Self::clear_artifact(entry);
        self.size_bytes -= freed;
    }

    /// Store a finished render and evict what no longer fits
    ///
    /// Returns the evicted pages.
    pub fn store(&mut self, artifact: Arc<Artifact>) -> Vec<PageId> {
        let page_id = artifact.page_id;
        let size = artifact.size_bytes();

        let entry = self.entry_mut(page_id, artifact.generation);
        let freed = Self::clear_artifact(entry);
        entry.generation = artifact.generation;
        entry.artifact = Some(artifact);
        entry.size_bytes = size;
        entry.state = EntryState::Ready;
        entry.last_access = Instant::now();

        self.size_bytes = self.size_bytes - freed + size;
        self.evict_if_needed()
    }

    pub fn mark_failed(&mut self, page_id: PageId, generation: Generation, error: RenderError) {
        let entry = self.entry_mut(page_id, generation);
        entry.generation = generation;
        entry.state = EntryState::Failed(error);
        let freed = Self::clear_artifact(entry);
        self.size_bytes -= freed;
    }

    /// Forget a pending entry whose job went away without a result
    pub fn reset(&mut self, page_id: PageId) {
        if self.entries.peek(&page_id).is_some_and(|entry| entry.state == EntryState::Pending) {
            self.remove(page_id);
        }
    }

    /// The page moved on to `generation`
    ///
    /// Stale bytes are dropped. The entry stays as pending when a job for
    /// the new generation already exists, and is removed otherwise.
    pub fn demote(&mut self, page_id: PageId, generation: Generation, job_pending: bool) {
        if job_pending {
            self.mark_pending(page_id, generation);
        } else {
            self.remove(page_id);
        }
    }

    pub fn remove(&mut self, page_id: PageId) -> Option<CacheEntry> {
        let entry = self.entries.pop(&page_id)?;
        self.size_bytes -= entry.size_bytes;
        Some(entry)
    }

    pub fn pin(&mut self, page_id: PageId) -> bool {
        self.pinned.insert(page_id)
    }

    /// Remove the pin; call [`EntryStore::evict_if_needed`] afterwards
    pub fn unpin(&mut self, page_id: PageId) -> bool {
        self.pinned.remove(&page_id)
    }

    pub fn unpin_all(&mut self) {
        self.pinned.clear();
    }

    pub fn is_pinned(&self, page_id: PageId) -> bool {
        self.pinned.contains(&page_id)
    }

    pub fn pinned_len(&self) -> usize {
        self.pinned.len()
    }

    /// Change the budget and evict down to it
    pub fn set_budget(&mut self, budget_bytes: usize) -> Vec<PageId> {
        self.budget_bytes = budget_bytes;
        self.evict_if_needed()
    }

    /// Evict unpinned ready entries, least recently used first, until the
    /// total size fits the budget or only pinned entries hold memory
    pub fn evict_if_needed(&mut self) -> Vec<PageId> {
        let mut evicted = Vec::new();
        while self.size_bytes > self.budget_bytes {
            let victim = self
                .entries
                .iter()
                .rev()
                .find(|(page_id, entry)| entry.is_ready() && !self.pinned.contains(*page_id))
                .map(|(page_id, _)| *page_id);
            let Some(page_id) = victim else {
                break;
            };

            if let Some(entry) = self.remove(page_id) {
                debug!("evicted {page_id} {} ({} bytes)", entry.generation, entry.size_bytes);
            }
            self.evictions += 1;
            evicted.push(page_id);
        }
        evicted
    }

    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    pub fn budget_bytes(&self) -> usize {
        self.budget_bytes
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn evictions(&self) -> u64 {
        self.evictions
    }

    /// Existing entry, promoted to most recent, or a new empty one
    fn entry_mut(&mut self, page_id: PageId, generation: Generation) -> &mut CacheEntry {
        self.entries.get_or_insert_mut(page_id, || CacheEntry::new(page_id, generation))
    }

    /// Drop the artifact, returning the bytes freed
    fn clear_artifact(entry: &mut CacheEntry) -> usize {
        entry.artifact = None;
        std::mem::take(&mut entry.size_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use diary_render::Bitmap;
    use rand::Rng;

    const G1: Generation = Generation(1);
    const G2: Generation = Generation(2);

    fn artifact(page: u64, generation: Generation, size: usize) -> Arc<Artifact> {
        let width = (size / 4) as u32;
        let bitmap = Bitmap::new(width, 1, vec![0; width as usize * 4]).unwrap();
        Arc::new(Artifact::from_bitmap(PageId(page), generation, 1.0, bitmap))
    }

    fn unpinned_bytes(store: &EntryStore) -> usize {
        store
            .entries
            .iter()
            .filter(|(page_id, _)| !store.is_pinned(**page_id))
            .map(|(_, entry)| entry.size_bytes)
            .sum()
    }

    #[test]
    fn test_lookup_requires_matching_generation() {
        let mut store = EntryStore::new(1024);
        store.store(artifact(1, G1, 100));

        assert!(store.lookup(PageId(1), G1).is_some());
        assert!(store.lookup(PageId(1), G2).is_none());
        assert!(store.lookup(PageId(2), G1).is_none());
    }

    #[test]
    fn test_store_replaces_bytes() {
        let mut store = EntryStore::new(1024);
        store.store(artifact(1, G1, 100));
        store.store(artifact(1, G2, 40));

        assert_eq!(store.size_bytes(), 40);
        assert_eq!(store.len(), 1);
        assert_eq!(store.peek(PageId(1)).unwrap().generation, G2);
    }

    #[test]
    fn test_eviction_scenario_keeps_pinned_and_recent() {
        let mut store = EntryStore::new(1000);
        store.pin(PageId(0));
        for page in 0..=4 {
            store.store(artifact(page, G1, 100));
        }
        // Touch A so it is the most recent; it is pinned regardless
        store.lookup(PageId(0), G1);

        // 500 bytes cached, room for 3 entries: two must go
        let evicted = store.set_budget(300);
        assert_eq!(evicted, vec![PageId(1), PageId(2)]);
        for page in [0, 3, 4] {
            assert!(store.peek(PageId(page)).is_some(), "page {page} should remain");
        }
        assert_eq!(store.size_bytes(), 300);
        assert_eq!(store.evictions(), 2);
    }

    #[test]
    fn test_lookup_refreshes_recency() {
        let mut store = EntryStore::new(1000);
        store.store(artifact(1, G1, 400));
        store.store(artifact(2, G1, 400));
        store.lookup(PageId(1), G1);

        let evicted = store.store(artifact(3, G1, 400));
        assert_eq!(evicted, vec![PageId(2)]);
    }

    #[test]
    fn test_pinned_entry_is_never_evicted() {
        let mut store = EntryStore::new(100);
        store.pin(PageId(1));
        let evicted = store.store(artifact(1, G1, 400));

        assert!(evicted.is_empty());
        assert_eq!(store.size_bytes(), 400);

        store.unpin(PageId(1));
        assert_eq!(store.evict_if_needed(), vec![PageId(1)]);
        assert_eq!(store.size_bytes(), 0);
    }

    #[test]
    fn test_pending_entries_hold_no_memory() {
        let mut store = EntryStore::new(100);
        store.store(artifact(1, G1, 80));
        store.mark_pending(PageId(1), G2);

        assert_eq!(store.size_bytes(), 0);
        assert_eq!(store.peek(PageId(1)).unwrap().state, EntryState::Pending);

        store.reset(PageId(1));
        assert!(store.peek(PageId(1)).is_none());
    }

    #[test]
    fn test_demote_drops_stale_bytes() {
        let mut store = EntryStore::new(1024);
        store.store(artifact(1, G1, 100));
        store.store(artifact(2, G1, 100));

        store.demote(PageId(1), G2, false);
        store.demote(PageId(2), G2, true);

        assert!(store.peek(PageId(1)).is_none());
        let pending = store.peek(PageId(2)).unwrap();
        assert_eq!((pending.generation, &pending.state), (G2, &EntryState::Pending));
        assert_eq!(store.size_bytes(), 0);
    }

    #[test]
    fn test_failed_entry_is_kept_until_reset_by_request() {
        let mut store = EntryStore::new(1024);
        store.mark_pending(PageId(1), G1);
        store.mark_failed(PageId(1), G1, RenderError::Permanent("bad image".into()));

        store.reset(PageId(1));
        let entry = store.peek(PageId(1)).unwrap();
        assert!(matches!(entry.state, EntryState::Failed(_)));
        assert!(store.lookup(PageId(1), G1).is_none());
    }

    #[test]
    fn test_random_operations_respect_budget() {
        let mut rng = rand::thread_rng();
        let budget = 2_000;
        let mut store = EntryStore::new(budget);

        for _ in 0..2_000 {
            let page = rng.gen_range(0..16u64);
            match rng.gen_range(0..6) {
                0 | 1 => {
                    let size = rng.gen_range(1..=150) * 4;
                    store.store(artifact(page, Generation(rng.gen_range(1..4)), size));
                }
                2 => {
                    store.lookup(PageId(page), G1);
                }
                3 => {
                    store.unpin_all();
                    store.pin(PageId(page));
                    store.evict_if_needed();
                }
                4 => store.demote(PageId(page), Generation(4), rng.gen_bool(0.5)),
                _ => {
                    store.set_budget(rng.gen_range(budget / 2..=budget));
                }
            }

            let total: usize = store.entries.iter().map(|(_, entry)| entry.size_bytes).sum();
            assert_eq!(total, store.size_bytes());
            assert!(
                store.size_bytes() <= store.budget_bytes() || unpinned_bytes(&store) == 0,
                "{} bytes over a budget of {} with unpinned entries left",
                store.size_bytes(),
                store.budget_bytes()
            );
        }
    }
}
