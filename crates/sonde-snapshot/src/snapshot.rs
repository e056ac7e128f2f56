use crate::SnapshotError;
use crate::hash::state_hash;
use crate::heap::{HeapDescriptor, Live};
use crate::page_store::PageStore;
use crate::region::{Region, RegionKind, StorageKind};
use sonde_remote::{
    AddressSpace, Frame, IgnoredHeapRegion, ObjectInformation, StackArea, TypeId, unwind_stack,
};
use sonde_types::{ActorId, AddressRange, StateNum};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

/// Read access to some copy of the application memory.
pub trait MemoryView {
    fn read_bytes(&self, address: u64, buf: &mut [u8]) -> Result<(), SnapshotError>;

    fn read_vec(&self, address: u64, size: usize) -> Result<Vec<u8>, SnapshotError> {
        let mut buf = vec![0u8; size];
        self.read_bytes(address, &mut buf)?;
        Ok(buf)
    }

    fn read_u64(&self, address: u64) -> Result<u64, SnapshotError> {
        let mut buf = [0u8; 8];
        self.read_bytes(address, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn read_i32(&self, address: u64) -> Result<i32, SnapshotError> {
        let mut buf = [0u8; 4];
        self.read_bytes(address, &mut buf)?;
        Ok(i32::from_le_bytes(buf))
    }
}

/// A local variable of one frame, resolved to its address at snapshot time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotLocal {
    pub name: String,
    pub subprogram: String,
    pub ip: u64,
    pub address: u64,
    /// Object whose type table `type_id` refers to.
    pub object: usize,
    pub type_id: Option<TypeId>,
}

#[derive(Debug, Clone)]
pub struct StackSnapshot {
    pub area: StackArea,
    pub frames: Vec<Frame>,
    pub locals: Vec<SnapshotLocal>,
}

#[derive(Debug, Clone)]
struct IgnoredData {
    start: u64,
    bytes: Vec<u8>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureOptions {
    pub storage: StorageKind,
    /// Compute the state hash used as a fast inequality test.
    pub hash: bool,
}

/// Immutable copy of the writable memory of the application at one state.
#[derive(Debug)]
pub struct Snapshot {
    num: StateNum,
    regions: Vec<Region>,
    heap: Option<HeapDescriptor>,
    stacks: Vec<StackSnapshot>,
    stack_sizes: Vec<u64>,
    hash: Option<u64>,
    enabled_actors: BTreeSet<ActorId>,
    ignored_data: Vec<IgnoredData>,
    to_ignore: Vec<IgnoredHeapRegion>,
    objects: Vec<Arc<ObjectInformation>>,
}

impl Snapshot {
    /// Copies every writable data segment and the heap. Ignored regions are
    /// zeroed in the application for the duration of the copy.
    pub fn take(
        num: StateNum,
        space: &mut (impl AddressSpace + ?Sized),
        store: &mut PageStore,
        enabled_actors: BTreeSet<ActorId>,
        options: CaptureOptions,
    ) -> Result<Self, SnapshotError> {
        let heap = match space.heap_descriptor()? {
            Some(address) => Some(HeapDescriptor::read(&Live(&*space), address)?),
            None => None,
        };

        let ignored: Vec<AddressRange> = space.layout().ignored_regions().to_vec();
        let mut ignored_data = Vec::with_capacity(ignored.len());
        let captured = zero_ignored(&mut *space, &ignored, &mut ignored_data)
            .and_then(|()| capture_regions(&*space, heap.as_ref(), store, options.storage));
        // ignored bytes go back even when zeroing or the copy failed
        for data in &ignored_data {
            space.write_bytes(data.start, &data.bytes)?;
        }
        let regions = captured?;

        let mut stacks = Vec::new();
        let mut stack_sizes = Vec::new();
        for area in space.layout().stack_areas() {
            let frames = unwind_stack(&*space, area)?;
            let used = frames
                .first()
                .map(|f| area.range().end.saturating_sub(f.sp))
                .unwrap_or(0);
            stack_sizes.push(used);
            let locals = collect_locals(space.layout().objects.as_slice(), &frames);
            stacks.push(StackSnapshot {
                area: *area,
                frames,
                locals,
            });
        }

        let mut snapshot = Self {
            num,
            regions,
            heap,
            stacks,
            stack_sizes,
            hash: None,
            enabled_actors,
            ignored_data,
            to_ignore: space.layout().ignored_heap().to_vec(),
            objects: space.layout().objects.clone(),
        };
        if options.hash {
            snapshot.hash = Some(state_hash(&snapshot));
        }
        debug!(
            %num,
            regions = snapshot.regions.len(),
            stacks = snapshot.stacks.len(),
            heap_bytes_used = snapshot.heap_bytes_used(),
            "snapshot taken"
        );
        Ok(snapshot)
    }

    /// Writes every region back, then the ignored bytes saved at capture time,
    /// and resets the ignored heap list.
    pub fn restore(&self, space: &mut (impl AddressSpace + ?Sized)) -> Result<(), SnapshotError> {
        for region in &self.regions {
            region.restore(space)?;
        }
        for data in &self.ignored_data {
            space.write_bytes(data.start, &data.bytes)?;
        }
        space.layout_mut().set_ignored_heap(self.to_ignore.clone());
        space.clear_cache();
        debug!(num = %self.num, "snapshot restored");
        Ok(())
    }

    pub fn num(&self) -> StateNum {
        self.num
    }

    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    pub fn heap(&self) -> Option<&HeapDescriptor> {
        self.heap.as_ref()
    }

    pub fn heap_bytes_used(&self) -> u64 {
        self.heap.map(|h| h.bytes_used).unwrap_or(0)
    }

    pub fn stacks(&self) -> &[StackSnapshot] {
        &self.stacks
    }

    pub fn stack_sizes(&self) -> &[u64] {
        &self.stack_sizes
    }

    pub fn hash(&self) -> Option<u64> {
        self.hash
    }

    pub fn enabled_actors(&self) -> &BTreeSet<ActorId> {
        &self.enabled_actors
    }

    pub fn ignored_heap(&self) -> &[IgnoredHeapRegion] {
        &self.to_ignore
    }

    pub fn objects(&self) -> &[Arc<ObjectInformation>] {
        &self.objects
    }

    pub fn region_of(&self, address: u64) -> Option<&Region> {
        self.regions.iter().find(|r| r.contains(address))
    }

    /// `address` is the start of an actor stack.
    pub fn is_stack(&self, address: u64) -> bool {
        self.stacks.iter().any(|s| s.area.address == address)
    }

    pub fn is_stack_block(&self, block: u64) -> bool {
        self.stacks.iter().any(|s| s.area.block == block)
    }
}

impl MemoryView for Snapshot {
    fn read_bytes(&self, address: u64, buf: &mut [u8]) -> Result<(), SnapshotError> {
        match self.region_of(address) {
            Some(region) => region.read(address, buf),
            None => Err(SnapshotError::NotCaptured {
                address,
                size: buf.len(),
            }),
        }
    }
}

/// Saves then zeroes every ignored range; `saved` holds whatever was read
/// before a failure.
fn zero_ignored(
    space: &mut (impl AddressSpace + ?Sized),
    ignored: &[AddressRange],
    saved: &mut Vec<IgnoredData>,
) -> Result<(), SnapshotError> {
    for range in ignored {
        let size = range.size() as usize;
        saved.push(IgnoredData {
            start: range.start,
            bytes: space.read_vec(range.start, size)?,
        });
        space.write_bytes(range.start, &vec![0u8; size])?;
    }
    Ok(())
}

fn capture_regions(
    space: &(impl AddressSpace + ?Sized),
    heap: Option<&HeapDescriptor>,
    store: &mut PageStore,
    storage: StorageKind,
) -> Result<Vec<Region>, SnapshotError> {
    let mut regions = Vec::new();
    for (index, object) in space.layout().objects.iter().enumerate() {
        if let Some(rw) = object.rw {
            regions.push(Region::capture(
                space,
                RegionKind::Data,
                Some(index),
                rw,
                storage,
                store,
            )?);
        }
    }
    if let Some(heap) = heap
        && heap.breakval > heap.heapbase
    {
        regions.push(Region::capture(
            space,
            RegionKind::Heap,
            None,
            AddressRange::with_size(heap.heapbase, heap.breakval - heap.heapbase),
            storage,
            store,
        )?);
    }
    Ok(regions)
}

fn collect_locals(objects: &[Arc<ObjectInformation>], frames: &[Frame]) -> Vec<SnapshotLocal> {
    let mut locals = Vec::new();
    for frame in frames {
        let Some(function) = frame.function else {
            continue;
        };
        let subprogram = &objects[function.object].subprograms[function.subprogram];
        for local in &subprogram.locals {
            locals.push(SnapshotLocal {
                name: local.name.clone(),
                subprogram: subprogram.name.clone(),
                ip: frame.ip,
                address: frame.frame_base.wrapping_add_signed(local.frame_offset),
                object: function.object,
                type_id: local.type_id,
            });
        }
    }
    locals
}
