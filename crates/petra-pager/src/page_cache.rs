//! In-memory page cache owned by the pager.
//!
//! The cache maps page numbers to buffers plus the two flags the write
//! protocols depend on: `dirty` (page differs from the database file) and
//! `need_sync` (the journal must reach disk before this page may, because
//! the page extends the file and has no pre-image to roll back to).

use std::collections::HashMap;

use petra_types::PageSize;

#[derive(Debug, Clone)]
pub struct CachedPage {
    pub data: Vec<u8>,
    pub dirty: bool,
    pub need_sync: bool,
}

/// Page cache with a soft page limit; only clean pages are evicted.
#[derive(Debug)]
pub struct PageCache {
    pages: HashMap<u32, CachedPage>,
    page_size: PageSize,
    max_pages: usize,
}

impl PageCache {
    #[must_use]
    pub fn new(page_size: PageSize, max_pages: usize) -> Self {
        Self {
            pages: HashMap::new(),
            page_size,
            max_pages: max_pages.max(1),
        }
    }

    #[must_use]
    pub fn page_size(&self) -> PageSize {
        self.page_size
    }

    /// Change the page size, which is only legal while the cache is empty.
    pub fn set_page_size(&mut self, page_size: PageSize) {
        debug_assert!(self.pages.is_empty());
        self.page_size = page_size;
    }

    #[must_use]
    pub fn get(&self, page: u32) -> Option<&CachedPage> {
        self.pages.get(&page)
    }

    /// Insert or replace a page image, evicting a clean page if over the
    /// limit. A replaced entry keeps its flags.
    pub fn insert(&mut self, page: u32, data: Vec<u8>) -> &mut CachedPage {
        debug_assert_eq!(data.len(), self.page_size.as_usize());
        if self.pages.len() >= self.max_pages && !self.pages.contains_key(&page) {
            self.evict_one_clean();
        }
        match self.pages.entry(page) {
            std::collections::hash_map::Entry::Occupied(entry) => {
                let slot = entry.into_mut();
                slot.data = data;
                slot
            }
            std::collections::hash_map::Entry::Vacant(entry) => entry.insert(CachedPage {
                data,
                dirty: false,
                need_sync: false,
            }),
        }
    }

    fn evict_one_clean(&mut self) {
        let victim = self
            .pages
            .iter()
            .find(|(_, p)| !p.dirty)
            .map(|(&pgno, _)| pgno);
        if let Some(pgno) = victim {
            self.pages.remove(&pgno);
        }
    }

    /// Dirty page numbers in ascending order.
    #[must_use]
    pub fn dirty_pages(&self) -> Vec<u32> {
        let mut pages: Vec<u32> = self
            .pages
            .iter()
            .filter(|(_, p)| p.dirty)
            .map(|(&pgno, _)| pgno)
            .collect();
        pages.sort_unstable();
        pages
    }

    /// Whether any cached page awaits a journal sync.
    #[must_use]
    pub fn any_need_sync(&self) -> bool {
        self.pages.values().any(|p| p.need_sync)
    }

    /// Mark every page clean (after a successful commit).
    pub fn clear_flags(&mut self) {
        for page in self.pages.values_mut() {
            page.dirty = false;
            page.need_sync = false;
        }
    }

    /// Drop dirty pages, keeping clean ones (after a rollback the clean
    /// pages still match the database file).
    pub fn drop_dirty(&mut self) {
        self.pages.retain(|_, p| !p.dirty);
    }

    /// Drop pages above `db_size` (the image shrank).
    pub fn truncate(&mut self, db_size: u32) {
        self.pages.retain(|&pgno, _| pgno <= db_size);
    }

    /// Drop everything (cache invalidated by another writer).
    pub fn clear(&mut self) {
        self.pages.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }
}
