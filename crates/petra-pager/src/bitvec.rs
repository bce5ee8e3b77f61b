//! Page-number bitmap used for journal and savepoint membership tests.

/// A growable bitmap over 1-based page numbers.
///
/// Used to answer "has this page already been journaled?" without scanning
/// the journal, and to de-duplicate replays during savepoint rollback.
#[derive(Debug, Clone, Default)]
pub struct PageBitvec {
    words: Vec<u64>,
}

impl PageBitvec {
    /// An empty bitmap sized for `pages` pages.
    #[must_use]
    pub fn with_capacity(pages: u32) -> Self {
        Self {
            words: vec![0; (pages as usize).div_ceil(64)],
        }
    }

    /// Set the bit for `page`.
    pub fn set(&mut self, page: u32) {
        let index = (page - 1) as usize;
        let word = index / 64;
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        self.words[word] |= 1 << (index % 64);
    }

    /// Whether the bit for `page` is set.
    #[must_use]
    pub fn contains(&self, page: u32) -> bool {
        let index = (page - 1) as usize;
        self.words
            .get(index / 64)
            .is_some_and(|w| w & (1 << (index % 64)) != 0)
    }

    /// Clear every bit.
    pub fn clear(&mut self) {
        self.words.fill(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_test() {
        let mut bv = PageBitvec::with_capacity(100);
        assert!(!bv.contains(1));
        bv.set(1);
        bv.set(64);
        bv.set(65);
        assert!(bv.contains(1));
        assert!(bv.contains(64));
        assert!(bv.contains(65));
        assert!(!bv.contains(2));
    }

    #[test]
    fn grows_past_initial_capacity() {
        let mut bv = PageBitvec::with_capacity(1);
        bv.set(1000);
        assert!(bv.contains(1000));
        assert!(!bv.contains(999));
    }

    #[test]
    fn clear_resets_all() {
        let mut bv = PageBitvec::with_capacity(10);
        bv.set(3);
        bv.set(7);
        bv.clear();
        assert!(!bv.contains(3));
        assert!(!bv.contains(7));
    }
}
