//! Binary layout of the instrumented allocator's metadata.
//!
//! The heap is split in blocks of [`BLOCKSIZE`] bytes, numbered from 1. The
//! descriptor points at a table of [`HEAPINFO_ENTRY_SIZE`]-byte entries, one per
//! block, which itself lives inside the heap. A busy block is either a run of
//! whole blocks, or a block cut in equal fragments of `1 << log2` bytes.
//!
//! Descriptor (little-endian `u64`s): heapbase, heapinfo, heaplimit, heapsize,
//! breakval, bytes_used.
//!
//! Heap-info entry: `type: i32` at 0, then either
//! `size: u64` at 8, `busy_size: u64` at 16, `ignore: i32` at 24 (whole blocks), or
//! `nfree: u64` at 8, `first: u64` at 16, `frag_size: [i16; 16]` at 24,
//! `ignore: [i32; 16]` at 56 (fragmented blocks).

use crate::SnapshotError;
use crate::snapshot::MemoryView;
use sonde_remote::AddressSpace;

pub const BLOCKSIZE: u64 = 4096;
pub const MAX_FRAGMENT_PER_BLOCK: usize = 16;
pub const HEAPINFO_ENTRY_SIZE: u64 = 120;
pub const DESCRIPTOR_SIZE: usize = 48;

const TYPE_FREE: i32 = -1;
const TYPE_HEAPINFO: i32 = -2;
const TYPE_UNFRAGMENTED: i32 = 0;

/// Smallest fragment is `1 << MIN_FRAGMENT_LOG2` bytes, so a block never holds
/// more than [`MAX_FRAGMENT_PER_BLOCK`] fragments.
const MIN_FRAGMENT_LOG2: u32 = 8;
const BLOCK_LOG2: u32 = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapDescriptor {
    pub heapbase: u64,
    pub heapinfo: u64,
    /// One past the highest block in use.
    pub heaplimit: u64,
    /// Number of entries in the heap-info table.
    pub heapsize: u64,
    pub breakval: u64,
    pub bytes_used: u64,
}

impl HeapDescriptor {
    pub fn read(view: &(impl MemoryView + ?Sized), address: u64) -> Result<Self, SnapshotError> {
        let mut buf = [0u8; DESCRIPTOR_SIZE];
        view.read_bytes(address, &mut buf)?;
        let field = |i: usize| {
            let mut word = [0u8; 8];
            word.copy_from_slice(&buf[i * 8..i * 8 + 8]);
            u64::from_le_bytes(word)
        };
        Ok(Self {
            heapbase: field(0),
            heapinfo: field(1),
            heaplimit: field(2),
            heapsize: field(3),
            breakval: field(4),
            bytes_used: field(5),
        })
    }

    #[cfg(test)]
    fn write(&self, space: &mut (impl AddressSpace + ?Sized), address: u64) -> Result<(), SnapshotError> {
        let mut buf = [0u8; DESCRIPTOR_SIZE];
        for (i, value) in [
            self.heapbase,
            self.heapinfo,
            self.heaplimit,
            self.heapsize,
            self.breakval,
            self.bytes_used,
        ]
        .into_iter()
        .enumerate()
        {
            buf[i * 8..i * 8 + 8].copy_from_slice(&value.to_le_bytes());
        }
        space.write_bytes(address, &buf)?;
        Ok(())
    }

    pub fn block_address(&self, block: u64) -> u64 {
        (block - 1) * BLOCKSIZE + self.heapbase
    }

    /// Block holding `address`, or `None` below the heap base.
    pub fn block_of(&self, address: u64) -> Option<u64> {
        address
            .checked_sub(self.heapbase)
            .map(|offset| offset / BLOCKSIZE + 1)
    }

    /// Strictly inside the heap, excluding the base itself.
    pub fn contains(&self, address: u64) -> bool {
        address > self.heapbase && address < self.breakval
    }

    fn entry_address(&self, block: u64) -> u64 {
        self.heapinfo + block * HEAPINFO_ENTRY_SIZE
    }

    pub fn block_info(
        &self,
        view: &(impl MemoryView + ?Sized),
        block: u64,
    ) -> Result<BlockInfo, SnapshotError> {
        let mut raw = [0u8; HEAPINFO_ENTRY_SIZE as usize];
        view.read_bytes(self.entry_address(block), &mut raw)?;
        BlockInfo::decode(block, &raw)
    }

    #[cfg(test)]
    fn write_block_info(
        &self,
        space: &mut (impl AddressSpace + ?Sized),
        block: u64,
        info: &BlockInfo,
    ) -> Result<(), SnapshotError> {
        space.write_bytes(self.entry_address(block), &info.encode())?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fragments {
    pub log2: u32,
    pub nfree: u64,
    pub first: u64,
    /// Used size of each fragment, -1 when free.
    pub frag_size: [i16; MAX_FRAGMENT_PER_BLOCK],
    pub ignore: [i32; MAX_FRAGMENT_PER_BLOCK],
}

impl Fragments {
    pub fn count(&self) -> usize {
        (BLOCKSIZE >> self.log2) as usize
    }

    pub fn size(&self) -> u64 {
        1 << self.log2
    }
}

/// Decoded heap-info entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockInfo {
    Free,
    HeapInfo,
    /// First block of a busy run (continuation blocks have `size` 0).
    Unfragmented {
        size: u64,
        busy_size: u64,
        ignore: i32,
    },
    Fragmented(Fragments),
}

fn le_i32(raw: &[u8], at: usize) -> i32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&raw[at..at + 4]);
    i32::from_le_bytes(b)
}

fn le_u64(raw: &[u8], at: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&raw[at..at + 8]);
    u64::from_le_bytes(b)
}

impl BlockInfo {
    fn decode(block: u64, raw: &[u8]) -> Result<Self, SnapshotError> {
        match le_i32(raw, 0) {
            TYPE_FREE => Ok(Self::Free),
            TYPE_HEAPINFO => Ok(Self::HeapInfo),
            TYPE_UNFRAGMENTED => Ok(Self::Unfragmented {
                size: le_u64(raw, 8),
                busy_size: le_u64(raw, 16),
                ignore: le_i32(raw, 24),
            }),
            log2 if (MIN_FRAGMENT_LOG2 as i32..BLOCK_LOG2 as i32).contains(&log2) => {
                let mut frag_size = [0i16; MAX_FRAGMENT_PER_BLOCK];
                let mut ignore = [0i32; MAX_FRAGMENT_PER_BLOCK];
                for j in 0..MAX_FRAGMENT_PER_BLOCK {
                    frag_size[j] = i16::from_le_bytes([raw[24 + 2 * j], raw[25 + 2 * j]]);
                    ignore[j] = le_i32(raw, 56 + 4 * j);
                }
                Ok(Self::Fragmented(Fragments {
                    log2: log2 as u32,
                    nfree: le_u64(raw, 8),
                    first: le_u64(raw, 16),
                    frag_size,
                    ignore,
                }))
            }
            other => Err(SnapshotError::CorruptHeap {
                block,
                reason: format!("unknown block type {other}"),
            }),
        }
    }

    #[cfg(test)]
    fn encode(&self) -> [u8; HEAPINFO_ENTRY_SIZE as usize] {
        let mut raw = [0u8; HEAPINFO_ENTRY_SIZE as usize];
        match self {
            Self::Free => raw[0..4].copy_from_slice(&TYPE_FREE.to_le_bytes()),
            Self::HeapInfo => raw[0..4].copy_from_slice(&TYPE_HEAPINFO.to_le_bytes()),
            Self::Unfragmented {
                size,
                busy_size,
                ignore,
            } => {
                raw[0..4].copy_from_slice(&TYPE_UNFRAGMENTED.to_le_bytes());
                raw[8..16].copy_from_slice(&size.to_le_bytes());
                raw[16..24].copy_from_slice(&busy_size.to_le_bytes());
                raw[24..28].copy_from_slice(&ignore.to_le_bytes());
            }
            Self::Fragmented(f) => {
                raw[0..4].copy_from_slice(&(f.log2 as i32).to_le_bytes());
                raw[8..16].copy_from_slice(&f.nfree.to_le_bytes());
                raw[16..24].copy_from_slice(&f.first.to_le_bytes());
                for j in 0..MAX_FRAGMENT_PER_BLOCK {
                    raw[24 + 2 * j..26 + 2 * j].copy_from_slice(&f.frag_size[j].to_le_bytes());
                    raw[56 + 4 * j..60 + 4 * j].copy_from_slice(&f.ignore[j].to_le_bytes());
                }
            }
        }
        raw
    }
}

/// Minimal allocator producing the layout above inside an address space. The
/// in-process application model allocates through it.
#[cfg(test)]
#[derive(Debug, Clone)]
pub(crate) struct HeapBuilder {
    descriptor_address: u64,
    descriptor: HeapDescriptor,
}

#[cfg(test)]
impl HeapBuilder {
    /// Lays out an empty heap of `capacity` blocks at `heapbase` and stores its
    /// descriptor at `descriptor_address`. The first blocks hold the heap-info
    /// table. `heapbase` must be mapped for `capacity * BLOCKSIZE` bytes.
    pub fn format(
        space: &mut (impl AddressSpace + ?Sized),
        descriptor_address: u64,
        heapbase: u64,
        capacity: u64,
    ) -> Result<Self, SnapshotError> {
        let table_blocks = ((capacity + 1) * HEAPINFO_ENTRY_SIZE).div_ceil(BLOCKSIZE);
        let mut descriptor = HeapDescriptor {
            heapbase,
            heapinfo: heapbase,
            heaplimit: table_blocks + 1,
            heapsize: capacity + 1,
            breakval: 0,
            bytes_used: 0,
        };
        descriptor.breakval = descriptor.block_address(descriptor.heaplimit);
        for block in 1..=capacity {
            let info = if block <= table_blocks {
                BlockInfo::HeapInfo
            } else {
                BlockInfo::Free
            };
            descriptor.write_block_info(space, block, &info)?;
        }
        descriptor.write(space, descriptor_address)?;
        Ok(Self {
            descriptor_address,
            descriptor,
        })
    }

    pub fn descriptor(&self) -> &HeapDescriptor {
        &self.descriptor
    }

    /// Whole-block allocation; returns the block address.
    pub fn alloc_blocks(
        &mut self,
        space: &mut (impl AddressSpace + ?Sized),
        busy_size: u64,
    ) -> Result<u64, SnapshotError> {
        let blocks = busy_size.div_ceil(BLOCKSIZE).max(1);
        let block = self.descriptor.heaplimit;
        if block + blocks > self.descriptor.heapsize {
            return Err(SnapshotError::HeapFull { wanted: busy_size });
        }
        self.descriptor.write_block_info(
            space,
            block,
            &BlockInfo::Unfragmented {
                size: blocks,
                busy_size,
                ignore: 0,
            },
        )?;
        for k in 1..blocks {
            self.descriptor.write_block_info(
                space,
                block + k,
                &BlockInfo::Unfragmented {
                    size: 0,
                    busy_size: 0,
                    ignore: 0,
                },
            )?;
        }
        self.descriptor.heaplimit = block + blocks;
        self.descriptor.breakval = self.descriptor.block_address(self.descriptor.heaplimit);
        self.descriptor.bytes_used += busy_size;
        self.descriptor.write(space, self.descriptor_address)?;
        tracing::trace!(block, blocks, busy_size, "heap block allocated");
        Ok(self.descriptor.block_address(block))
    }

    /// Small allocation in a fragmented block; large requests fall back to whole blocks.
    pub fn alloc(
        &mut self,
        space: &mut (impl AddressSpace + ?Sized),
        size: u64,
    ) -> Result<u64, SnapshotError> {
        let log2 = size.max(1).next_power_of_two().trailing_zeros().max(MIN_FRAGMENT_LOG2);
        if log2 >= BLOCK_LOG2 {
            return self.alloc_blocks(space, size);
        }

        for block in 1..self.descriptor.heaplimit {
            if let BlockInfo::Fragmented(mut frags) = self.descriptor.block_info(&Live(&*space), block)?
                && frags.log2 == log2
                && frags.nfree > 0
                && let Some(j) = frags.frag_size[..frags.count()].iter().position(|&s| s == -1)
            {
                frags.frag_size[j] = size as i16;
                frags.nfree -= 1;
                return self.commit_fragment(space, block, j, frags, size);
            }
        }

        let block = self.descriptor.heaplimit;
        if block + 1 > self.descriptor.heapsize {
            return Err(SnapshotError::HeapFull { wanted: size });
        }
        self.descriptor.heaplimit = block + 1;
        self.descriptor.breakval = self.descriptor.block_address(self.descriptor.heaplimit);
        let mut frags = Fragments {
            log2,
            nfree: (BLOCKSIZE >> log2) - 1,
            first: 1,
            frag_size: [-1; MAX_FRAGMENT_PER_BLOCK],
            ignore: [0; MAX_FRAGMENT_PER_BLOCK],
        };
        frags.frag_size[0] = size as i16;
        self.commit_fragment(space, block, 0, frags, size)
    }

    fn commit_fragment(
        &mut self,
        space: &mut (impl AddressSpace + ?Sized),
        block: u64,
        fragment: usize,
        frags: Fragments,
        size: u64,
    ) -> Result<u64, SnapshotError> {
        self.descriptor
            .write_block_info(space, block, &BlockInfo::Fragmented(frags))?;
        self.descriptor.bytes_used += size;
        self.descriptor.write(space, self.descriptor_address)?;
        tracing::trace!(block, fragment, size, "heap fragment allocated");
        Ok(self.descriptor.block_address(block) + ((fragment as u64) << frags.log2))
    }

    /// Releases the allocation starting at `address`.
    pub fn free(
        &mut self,
        space: &mut (impl AddressSpace + ?Sized),
        address: u64,
    ) -> Result<(), SnapshotError> {
        let Some(block) = self.descriptor.block_of(address) else {
            return Ok(());
        };
        match self.descriptor.block_info(&Live(&*space), block)? {
            BlockInfo::Unfragmented {
                size, busy_size, ..
            } => {
                for k in 0..size.max(1) {
                    self.descriptor
                        .write_block_info(space, block + k, &BlockInfo::Free)?;
                }
                self.descriptor.bytes_used -= busy_size.min(self.descriptor.bytes_used);
            }
            BlockInfo::Fragmented(mut frags) => {
                let j = ((address - self.descriptor.block_address(block)) >> frags.log2) as usize;
                let used = frags.frag_size[j].max(0) as u64;
                frags.frag_size[j] = -1;
                frags.ignore[j] = 0;
                frags.nfree += 1;
                self.descriptor
                    .write_block_info(space, block, &BlockInfo::Fragmented(frags))?;
                self.descriptor.bytes_used -= used.min(self.descriptor.bytes_used);
            }
            BlockInfo::Free | BlockInfo::HeapInfo => return Ok(()),
        }
        self.descriptor.write(space, self.descriptor_address)
    }

    /// Bumps the ignore counter of the allocation at `address`, the way the
    /// allocator does when the application ignores part of it.
    pub fn mark_ignored(
        &mut self,
        space: &mut (impl AddressSpace + ?Sized),
        address: u64,
    ) -> Result<(), SnapshotError> {
        let Some(block) = self.descriptor.block_of(address) else {
            return Ok(());
        };
        let info = match self.descriptor.block_info(&Live(&*space), block)? {
            BlockInfo::Unfragmented {
                size,
                busy_size,
                ignore,
            } => BlockInfo::Unfragmented {
                size,
                busy_size,
                ignore: ignore + 1,
            },
            BlockInfo::Fragmented(mut frags) => {
                let j = ((address - self.descriptor.block_address(block)) >> frags.log2) as usize;
                frags.ignore[j] += 1;
                BlockInfo::Fragmented(frags)
            }
            other => other,
        };
        self.descriptor.write_block_info(space, block, &info)
    }
}

/// Live address space seen through [`MemoryView`].
pub struct Live<'a, A: AddressSpace + ?Sized>(pub &'a A);

impl<A: AddressSpace + ?Sized> MemoryView for Live<'_, A> {
    fn read_bytes(&self, address: u64, buf: &mut [u8]) -> Result<(), SnapshotError> {
        Ok(self.0.read_bytes(address, buf)?)
    }
}
