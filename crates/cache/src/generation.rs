//! Expected generation per page

use diary_render::{Generation, PageId};
use std::collections::HashMap;

/// The generation each page is expected to be rendered at
///
/// Generations only move forward. Pages never mentioned stand at
/// [`Generation::INITIAL`].
#[derive(Debug, Default)]
pub struct GenerationTable {
    current: HashMap<PageId, Generation>,
}

impl GenerationTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self, page_id: PageId) -> Generation {
        self.current.get(&page_id).copied().unwrap_or(Generation::INITIAL)
    }

    /// Advance the page by one generation and return the new value
    pub fn bump(&mut self, page_id: PageId) -> Generation {
        let next = self.current(page_id).next();
        self.current.insert(page_id, next);
        next
    }

    /// Raise the page to `generation` if it is newer; returns true if it was
    pub fn observe(&mut self, page_id: PageId, generation: Generation) -> bool {
        if generation <= self.current(page_id) {
            return false;
        }
        self.current.insert(page_id, generation);
        true
    }
}
