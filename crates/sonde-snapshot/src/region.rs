use crate::SnapshotError;
use crate::page_store::{PAGE_SIZE, Page, PageStore};
use sonde_remote::AddressSpace;
use sonde_types::AddressRange;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    Heap,
    Data,
}

/// How the bytes of a region are kept.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StorageKind {
    #[default]
    Dense,
    /// Split into pages shared through a [`PageStore`].
    Sparse,
}

#[derive(Debug, Clone)]
pub enum RegionStorage {
    Dense(Vec<u8>),
    Sparse(Vec<Arc<Page>>),
    /// One copy per simulated process of a privatized data segment.
    Privatized(Vec<Region>),
}

/// A copied area of the application memory.
#[derive(Debug, Clone)]
pub struct Region {
    pub kind: RegionKind,
    /// Index of the owning object in the layout, for data regions.
    pub object: Option<usize>,
    pub range: AddressRange,
    pub storage: RegionStorage,
}

impl Region {
    /// Copies `range` out of `space`.
    pub fn capture(
        space: &(impl AddressSpace + ?Sized),
        kind: RegionKind,
        object: Option<usize>,
        range: AddressRange,
        storage: StorageKind,
        store: &mut PageStore,
    ) -> Result<Self, SnapshotError> {
        let size = range.size() as usize;
        let storage = match storage {
            StorageKind::Dense => RegionStorage::Dense(space.read_vec(range.start, size)?),
            StorageKind::Sparse => {
                let mut pages = Vec::with_capacity(size.div_ceil(PAGE_SIZE));
                let mut buf = vec![0u8; PAGE_SIZE];
                let mut offset = 0;
                while offset < size {
                    let len = PAGE_SIZE.min(size - offset);
                    space.read_bytes(range.start + offset as u64, &mut buf[..len])?;
                    pages.push(store.store(&buf[..len]));
                    offset += len;
                }
                RegionStorage::Sparse(pages)
            }
        };
        Ok(Self {
            kind,
            object,
            range,
            storage,
        })
    }

    pub fn contains(&self, address: u64) -> bool {
        self.range.contains(address)
    }

    /// Reads `buf.len()` bytes at `address`, which must lie inside the region.
    pub fn read(&self, address: u64, buf: &mut [u8]) -> Result<(), SnapshotError> {
        let wanted = AddressRange::with_size(address, buf.len() as u64);
        if !self.range.contains_range(&wanted) {
            return Err(SnapshotError::NotCaptured {
                address,
                size: buf.len(),
            });
        }
        let offset = (address - self.range.start) as usize;
        match &self.storage {
            RegionStorage::Dense(bytes) => {
                buf.copy_from_slice(&bytes[offset..offset + buf.len()]);
            }
            RegionStorage::Sparse(pages) => {
                let mut done = 0;
                while done < buf.len() {
                    let at = offset + done;
                    let page = &pages[at / PAGE_SIZE];
                    let in_page = at % PAGE_SIZE;
                    let len = (page.bytes().len() - in_page).min(buf.len() - done);
                    buf[done..done + len].copy_from_slice(&page.bytes()[in_page..in_page + len]);
                    done += len;
                }
            }
            RegionStorage::Privatized(_) => return Err(SnapshotError::Privatized { address }),
        }
        Ok(())
    }

    /// Writes the saved bytes back into `space`.
    pub fn restore(&self, space: &mut (impl AddressSpace + ?Sized)) -> Result<(), SnapshotError> {
        match &self.storage {
            RegionStorage::Dense(bytes) => space.write_bytes(self.range.start, bytes)?,
            RegionStorage::Sparse(pages) => {
                let mut address = self.range.start;
                for page in pages {
                    space.write_bytes(address, page.bytes())?;
                    address += page.bytes().len() as u64;
                }
            }
            RegionStorage::Privatized(copies) => {
                for copy in copies {
                    copy.restore(space)?;
                }
            }
        }
        Ok(())
    }
}
