//! Content-addressed pages shared between sparse snapshots.

use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::{Arc, Weak};

pub const PAGE_SIZE: usize = 4096;

/// One page of application memory. The last page of a region may be short.
#[derive(Debug, PartialEq, Eq)]
pub struct Page {
    hash: u64,
    bytes: Box<[u8]>,
}

impl Page {
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn hash(&self) -> u64 {
        self.hash
    }
}

fn page_hash(bytes: &[u8]) -> u64 {
    let mut hasher = DefaultHasher::new();
    bytes.hash(&mut hasher);
    hasher.finish()
}

/// Index of the pages currently held by some snapshot. A page lives as long as
/// one snapshot holds its handle; the store only keeps weak references.
#[derive(Debug, Default)]
pub struct PageStore {
    index: HashMap<u64, Vec<Weak<Page>>>,
}

impl PageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the live page with this content, or stores a new one.
    pub fn store(&mut self, bytes: &[u8]) -> Arc<Page> {
        let hash = page_hash(bytes);
        let bucket = self.index.entry(hash).or_default();
        bucket.retain(|w| w.strong_count() > 0);
        for weak in bucket.iter() {
            if let Some(page) = weak.upgrade()
                && page.bytes() == bytes
            {
                return page;
            }
        }
        let page = Arc::new(Page {
            hash,
            bytes: bytes.into(),
        });
        bucket.push(Arc::downgrade(&page));
        page
    }

    /// Forgets pages no snapshot holds anymore.
    pub fn prune(&mut self) {
        self.index.retain(|_, bucket| {
            bucket.retain(|w| w.strong_count() > 0);
            !bucket.is_empty()
        });
    }

    pub fn live_pages(&self) -> usize {
        self.index
            .values()
            .flatten()
            .filter(|w| w.strong_count() > 0)
            .count()
    }
}
