//! Page content source
//!
//! The cache never owns page content. It asks a [`PageStore`] for an
//! immutable snapshot when a render is dispatched, and the host reports
//! edits through [`CacheManager::page_mutated`](crate::CacheManager::page_mutated).

use diary_render::{PageId, PageSnapshot};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

/// Supplier of page snapshots
pub trait PageStore: Send + Sync {
    /// Current content of a page
    fn get_page(&self, page_id: PageId) -> Option<PageSnapshot>;

    /// All pages in document order
    fn page_ids(&self) -> Vec<PageId>;

    fn contains(&self, page_id: PageId) -> bool {
        self.get_page(page_id).is_some()
    }
}

#[derive(Debug, Default)]
struct Pages {
    order: Vec<PageId>,
    snapshots: HashMap<PageId, PageSnapshot>,
}

/// In-memory [`PageStore`]
///
/// Updates do not notify the cache on their own; the host calls
/// `page_mutated` with the page id afterwards.
#[derive(Debug, Default)]
pub struct MemoryPageStore {
    pages: RwLock<Pages>,
}

impl MemoryPageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store holding `snapshots` in the given order
    pub fn from_snapshots(snapshots: impl IntoIterator<Item = PageSnapshot>) -> Self {
        let store = Self::new();
        for snapshot in snapshots {
            store.insert(snapshot);
        }
        store
    }

    /// Add or replace a page; new pages go to the end of the document
    pub fn insert(&self, snapshot: PageSnapshot) {
        let mut pages = self.pages.write().unwrap_or_else(PoisonError::into_inner);
        let page_id = snapshot.page_id;
        if pages.snapshots.insert(page_id, snapshot).is_none() {
            pages.order.push(page_id);
        }
    }

    /// Edit a page in place and return its new content
    pub fn update<F>(&self, page_id: PageId, edit: F) -> Option<PageSnapshot>
    where
        F: FnOnce(&mut PageSnapshot),
    {
        let mut pages = self.pages.write().unwrap_or_else(PoisonError::into_inner);
        let snapshot = pages.snapshots.get_mut(&page_id)?;
        edit(snapshot);
        Some(snapshot.clone())
    }

    pub fn remove(&self, page_id: PageId) -> Option<PageSnapshot> {
        let mut pages = self.pages.write().unwrap_or_else(PoisonError::into_inner);
        let removed = pages.snapshots.remove(&page_id)?;
        pages.order.retain(|id| *id != page_id);
        Some(removed)
    }

    pub fn len(&self) -> usize {
        self.pages.read().unwrap_or_else(PoisonError::into_inner).order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PageStore for MemoryPageStore {
    fn get_page(&self, page_id: PageId) -> Option<PageSnapshot> {
        let pages = self.pages.read().unwrap_or_else(PoisonError::into_inner);
        pages.snapshots.get(&page_id).cloned()
    }

    fn page_ids(&self) -> Vec<PageId> {
        self.pages.read().unwrap_or_else(PoisonError::into_inner).order.clone()
    }

    fn contains(&self, page_id: PageId) -> bool {
        let pages = self.pages.read().unwrap_or_else(PoisonError::into_inner);
        pages.snapshots.contains_key(&page_id)
    }
}
