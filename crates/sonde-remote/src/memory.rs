use crate::RemoteError;
use crate::debuginfo::ObjectInformation;
use sonde_types::AddressRange;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Heap area the application asked to leave out of state comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IgnoredHeapRegion {
    pub address: u64,
    pub size: u64,
    pub block: u64,
    /// -1 for a whole block.
    pub fragment: i64,
}

/// Stack of one actor, and where its saved registers live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackArea {
    pub address: u64,
    /// Points at the saved `rip`, `rsp`, `rbp` of the actor.
    pub context: u64,
    pub size: u64,
    pub block: u64,
}

impl StackArea {
    pub fn range(&self) -> AddressRange {
        AddressRange::with_size(self.address, self.size)
    }
}

/// Everything known about the application besides raw bytes: loaded objects, the
/// ignore lists, actor stacks and symbols registered at run time.
#[derive(Debug, Clone, Default)]
pub struct ProcessLayout {
    /// Executable first.
    pub objects: Vec<Arc<ObjectInformation>>,
    /// Address of the global that points at the heap descriptor.
    pub heap_pointer: Option<u64>,
    ignored_regions: Vec<AddressRange>,
    ignored_heap: Vec<IgnoredHeapRegion>,
    stack_areas: Vec<StackArea>,
    symbols: BTreeMap<String, u64>,
}

impl ProcessLayout {
    pub fn new(objects: Vec<Arc<ObjectInformation>>) -> Self {
        Self {
            objects,
            ..Self::default()
        }
    }

    /// Keeps the list sorted and merges overlapping or touching ranges.
    pub fn ignore_region(&mut self, address: u64, size: u64) {
        if size == 0 {
            return;
        }
        let mut range = AddressRange::with_size(address, size);
        let start = self
            .ignored_regions
            .partition_point(|r| r.end < range.start);
        let mut end = start;
        while end < self.ignored_regions.len() && self.ignored_regions[end].start <= range.end {
            range.start = range.start.min(self.ignored_regions[end].start);
            range.end = range.end.max(self.ignored_regions[end].end);
            end += 1;
        }
        self.ignored_regions.splice(start..end, [range]);
    }

    pub fn ignored_regions(&self) -> &[AddressRange] {
        &self.ignored_regions
    }

    /// Sorted by address; a second registration of the same address is ignored.
    pub fn ignore_heap(&mut self, region: IgnoredHeapRegion) {
        match self
            .ignored_heap
            .binary_search_by_key(&region.address, |r| r.address)
        {
            Ok(_) => {}
            Err(pos) => self.ignored_heap.insert(pos, region),
        }
    }

    /// Drops the first ignored region starting inside `address..=address + size`.
    pub fn unignore_heap(&mut self, address: u64, size: u64) {
        let pos = self.ignored_heap.partition_point(|r| r.address < address);
        if let Some(region) = self.ignored_heap.get(pos)
            && region.address <= address.saturating_add(size)
        {
            self.ignored_heap.remove(pos);
        }
    }

    pub fn ignored_heap(&self) -> &[IgnoredHeapRegion] {
        &self.ignored_heap
    }

    pub fn set_ignored_heap(&mut self, regions: Vec<IgnoredHeapRegion>) {
        self.ignored_heap = regions;
    }

    pub fn add_stack_area(&mut self, area: StackArea) {
        match self.stack_areas.iter_mut().find(|a| a.address == area.address) {
            Some(existing) => *existing = area,
            None => self.stack_areas.push(area),
        }
    }

    pub fn stack_areas(&self) -> &[StackArea] {
        &self.stack_areas
    }

    pub fn is_stack_block(&self, block: u64) -> bool {
        self.stack_areas.iter().any(|a| a.block == block)
    }

    pub fn register_symbol(&mut self, name: impl Into<String>, address: u64) {
        self.symbols.insert(name.into(), address);
    }

    pub fn symbol(&self, name: &str) -> Option<u64> {
        self.symbols.get(name).copied()
    }

    /// Globals from debug information first, then ELF symbols; executable before libraries.
    pub fn resolve_global(&self, name: &str) -> Result<u64, RemoteError> {
        let by_debug_info = self
            .objects
            .iter()
            .find_map(|o| o.find_global(name).map(|v| v.address));
        by_debug_info
            .or_else(|| self.objects.iter().find_map(|o| o.symbols.get(name).copied()))
            .ok_or_else(|| RemoteError::MissingSymbol(name.to_string()))
    }

    /// (object index, subprogram index) of the function containing `ip`.
    pub fn find_function(&self, ip: u64) -> Option<(usize, usize)> {
        self.objects
            .iter()
            .enumerate()
            .find_map(|(i, o)| o.find_subprogram(ip).map(|s| (i, s)))
    }

    pub fn object_of_data(&self, address: u64) -> Option<usize> {
        self.objects
            .iter()
            .position(|o| o.rw.is_some_and(|rw| rw.contains(address)))
    }
}

/// Byte-level access to an application's memory.
pub trait AddressSpace {
    fn read_bytes(&self, address: u64, buf: &mut [u8]) -> Result<(), RemoteError>;

    fn write_bytes(&mut self, address: u64, data: &[u8]) -> Result<(), RemoteError>;

    fn layout(&self) -> &ProcessLayout;

    fn layout_mut(&mut self) -> &mut ProcessLayout;

    /// Drops whatever was cached about the application's memory.
    fn clear_cache(&mut self) {}

    /// Address of the heap descriptor, when the application exposes one.
    fn heap_descriptor(&self) -> Result<Option<u64>, RemoteError> {
        match self.layout().heap_pointer {
            Some(pointer) => {
                let descriptor = self.read_u64(pointer)?;
                Ok((descriptor != 0).then_some(descriptor))
            }
            None => Ok(None),
        }
    }

    fn read_vec(&self, address: u64, size: usize) -> Result<Vec<u8>, RemoteError> {
        let mut buf = vec![0u8; size];
        self.read_bytes(address, &mut buf)?;
        Ok(buf)
    }

    fn read_u64(&self, address: u64) -> Result<u64, RemoteError> {
        let mut buf = [0u8; 8];
        self.read_bytes(address, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn read_i64(&self, address: u64) -> Result<i64, RemoteError> {
        Ok(self.read_u64(address)? as i64)
    }

    fn read_i32(&self, address: u64) -> Result<i32, RemoteError> {
        let mut buf = [0u8; 4];
        self.read_bytes(address, &mut buf)?;
        Ok(i32::from_le_bytes(buf))
    }

    fn write_u64(&mut self, address: u64, value: u64) -> Result<(), RemoteError> {
        self.write_bytes(address, &value.to_le_bytes())
    }

    fn write_i32(&mut self, address: u64, value: i32) -> Result<(), RemoteError> {
        self.write_bytes(address, &value.to_le_bytes())
    }
}

/// Address space held in this process: a set of disjoint zero-initialised segments.
#[derive(Debug, Clone, Default)]
pub struct LocalMemory {
    segments: BTreeMap<u64, Vec<u8>>,
    layout: ProcessLayout,
}

impl LocalMemory {
    pub fn new(layout: ProcessLayout) -> Self {
        Self {
            segments: BTreeMap::new(),
            layout,
        }
    }

    pub fn map(&mut self, start: u64, size: usize) {
        self.segments.insert(start, vec![0u8; size]);
    }

    fn segment(&self, address: u64, size: usize) -> Option<(u64, &Vec<u8>)> {
        let (&start, bytes) = self.segments.range(..=address).next_back()?;
        let offset = (address - start) as usize;
        (offset + size <= bytes.len()).then_some((start, bytes))
    }
}

impl AddressSpace for LocalMemory {
    fn read_bytes(&self, address: u64, buf: &mut [u8]) -> Result<(), RemoteError> {
        let (start, bytes) = self
            .segment(address, buf.len())
            .ok_or(RemoteError::Unmapped {
                address,
                size: buf.len(),
            })?;
        let offset = (address - start) as usize;
        buf.copy_from_slice(&bytes[offset..offset + buf.len()]);
        Ok(())
    }

    fn write_bytes(&mut self, address: u64, data: &[u8]) -> Result<(), RemoteError> {
        let start = self
            .segment(address, data.len())
            .map(|(start, _)| start)
            .ok_or(RemoteError::Unmapped {
                address,
                size: data.len(),
            })?;
        let offset = (address - start) as usize;
        if let Some(bytes) = self.segments.get_mut(&start) {
            bytes[offset..offset + data.len()].copy_from_slice(data);
        }
        Ok(())
    }

    fn layout(&self) -> &ProcessLayout {
        &self.layout
    }

    fn layout_mut(&mut self) -> &mut ProcessLayout {
        &mut self.layout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ignored_regions_are_sorted_and_merged() {
        let mut layout = ProcessLayout::default();
        layout.ignore_region(0x3000, 0x10);
        layout.ignore_region(0x1000, 0x10);
        layout.ignore_region(0x1008, 0x10);
        layout.ignore_region(0x1018, 0x8);
        layout.ignore_region(0x2000, 0);
        assert_eq!(
            layout.ignored_regions(),
            &[
                AddressRange {
                    start: 0x1000,
                    end: 0x1020
                },
                AddressRange {
                    start: 0x3000,
                    end: 0x3010
                },
            ]
        );
        layout.ignore_region(0x0ff0, 0x2100);
        assert_eq!(layout.ignored_regions().len(), 1);
    }

    #[test]
    fn ignored_heap_is_sorted_by_address_and_unignored() {
        let mut layout = ProcessLayout::default();
        for address in [0x500, 0x100, 0x300, 0x100] {
            layout.ignore_heap(IgnoredHeapRegion {
                address,
                size: 8,
                block: 1,
                fragment: -1,
            });
        }
        let addresses: Vec<u64> = layout.ignored_heap().iter().map(|r| r.address).collect();
        assert_eq!(addresses, vec![0x100, 0x300, 0x500]);
        layout.unignore_heap(0x300, 8);
        layout.unignore_heap(0x999, 8);
        let addresses: Vec<u64> = layout.ignored_heap().iter().map(|r| r.address).collect();
        assert_eq!(addresses, vec![0x100, 0x500]);
    }

    #[test]
    fn unignore_covers_regions_starting_inside_the_range() {
        let mut layout = ProcessLayout::default();
        for address in [0x1008, 0x2000] {
            layout.ignore_heap(IgnoredHeapRegion {
                address,
                size: 8,
                block: 2,
                fragment: 1,
            });
        }
        layout.unignore_heap(0x1000, 16);
        let addresses: Vec<u64> = layout.ignored_heap().iter().map(|r| r.address).collect();
        assert_eq!(addresses, vec![0x2000]);
        // starts past the end of the range
        layout.unignore_heap(0x1f00, 0x80);
        assert_eq!(layout.ignored_heap().len(), 1);
        layout.unignore_heap(0x1f00, 0x100);
        assert!(layout.ignored_heap().is_empty());
    }

    #[test]
    fn local_memory_rejects_accesses_outside_segments() {
        let mut mem = LocalMemory::default();
        mem.map(0x1000, 0x100);
        mem.write_u64(0x10f8, 0xdead_beef).expect("in bounds");
        assert_eq!(mem.read_u64(0x10f8).expect("read back"), 0xdead_beef);
        assert!(matches!(
            mem.read_u64(0x10fc),
            Err(RemoteError::Unmapped { address: 0x10fc, size: 8 })
        ));
        assert!(mem.write_i32(0x0ffc, 1).is_err());
    }

    #[test]
    fn missing_symbols_are_reported() {
        let mut object = ObjectInformation::synthetic("app", AddressRange::with_size(0x1000, 0x10));
        object.symbols.insert("counter".into(), 0x1008);
        let layout = ProcessLayout::new(vec![Arc::new(object)]);
        assert_eq!(layout.resolve_global("counter").expect("found"), 0x1008);
        assert!(matches!(
            layout.resolve_global("nope"),
            Err(RemoteError::MissingSymbol(name)) if name == "nope"
        ));
    }
}
