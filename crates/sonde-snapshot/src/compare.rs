//! Equality of two snapshots.
//!
//! Globals and locals are compared through their debug-information types.
//! Pointers into the heap are followed, so two heaps holding the same data
//! structure at different addresses compare equal. Every busy heap area of one
//! snapshot must in the end be matched with an area of the other one.
//!
//! The relation is not guaranteed to be transitive.

use crate::SnapshotError;
use crate::heap::{BlockInfo, HeapDescriptor, MAX_FRAGMENT_PER_BLOCK};
use crate::region::{Region, RegionKind, RegionStorage};
use crate::snapshot::{MemoryView, Snapshot, StackSnapshot};
use sonde_remote::{ObjectInformation, Type, TypeId, TypeKind};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::trace;

/// Outcome of comparing two areas. `Unknown` does not make states different.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AreaComparison {
    Same,
    Different,
    Unknown,
}

impl AreaComparison {
    fn from_difference(differs: bool) -> Self {
        if differs { Self::Different } else { Self::Same }
    }

    pub fn is_different(self) -> bool {
        self == Self::Different
    }
}

/// A heap block, or one fragment of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HeapLocation {
    pub block: u64,
    /// -1 for a whole block.
    pub fragment: i64,
}

impl HeapLocation {
    pub fn whole(block: u64) -> Self {
        Self {
            block,
            fragment: -1,
        }
    }

    pub fn fragment(block: u64, fragment: usize) -> Self {
        Self {
            block,
            fragment: fragment as i64,
        }
    }
}

/// Pairs of heap areas already being compared on the current path.
pub type VisitedPairs = HashSet<(HeapLocation, HeapLocation)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TypeRef {
    object: usize,
    id: TypeId,
}

struct Side<'a> {
    snapshot: &'a Snapshot,
    heap: Option<HeapDescriptor>,
    /// Match of each block/fragment in the other heap.
    equals_to: Vec<Option<HeapLocation>>,
    /// Type inferred for each block/fragment.
    types: Vec<Option<TypeRef>>,
}

fn slot(block: u64, fragment: usize) -> usize {
    block as usize * MAX_FRAGMENT_PER_BLOCK + fragment
}

impl<'a> Side<'a> {
    fn new(snapshot: &'a Snapshot) -> Self {
        let heap = snapshot.heap().copied();
        let slots = heap
            .map(|h| h.heapsize as usize * MAX_FRAGMENT_PER_BLOCK)
            .unwrap_or(0);
        Self {
            snapshot,
            heap,
            equals_to: vec![None; slots],
            types: vec![None; slots],
        }
    }

    fn equals(&self, block: u64, fragment: usize) -> Option<HeapLocation> {
        self.equals_to.get(slot(block, fragment)).copied().flatten()
    }

    fn set_equal(&mut self, block: u64, fragment: usize, other: HeapLocation) {
        if let Some(entry) = self.equals_to.get_mut(slot(block, fragment)) {
            *entry = Some(other);
        }
    }

    fn type_at(&self, block: u64, fragment: usize) -> Option<TypeRef> {
        self.types.get(slot(block, fragment)).copied().flatten()
    }

    fn set_type(&mut self, block: u64, fragment: usize, ty: TypeRef) {
        if let Some(entry) = self.types.get_mut(slot(block, fragment)) {
            *entry = Some(ty);
        }
    }

    fn in_heap(&self, address: u64) -> bool {
        self.heap.is_some_and(|h| h.contains(address))
    }

    /// Size of the ignored heap area starting exactly at `address`.
    fn ignore_size(&self, address: u64) -> Option<u64> {
        let ignored = self.snapshot.ignored_heap();
        ignored
            .binary_search_by_key(&address, |r| r.address)
            .ok()
            .map(|i| ignored[i].size)
    }

    /// Busy areas that found no match.
    fn unmatched(&self, heaplimit: u64) -> Result<usize, SnapshotError> {
        let Some(heap) = self.heap else {
            return Ok(0);
        };
        let mut count = 0;
        for block in 1..heaplimit {
            match heap.block_info(self.snapshot, block)? {
                BlockInfo::Unfragmented { busy_size, .. }
                    if busy_size > 0 && self.equals(block, 0).is_none() =>
                {
                    trace!(block, busy_size, "heap block without match");
                    count += 1;
                }
                BlockInfo::Fragmented(frags) => {
                    for j in 0..frags.count() {
                        if frags.frag_size[j] > 0 && self.equals(block, j).is_none() {
                            trace!(block, fragment = j, "heap fragment without match");
                            count += 1;
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(count)
    }
}

struct StateComparator<'a> {
    sides: [Side<'a>; 2],
    objects: &'a [Arc<ObjectInformation>],
    compared_pointers: HashSet<(u64, u64)>,
}

impl<'a> StateComparator<'a> {
    fn new(s1: &'a Snapshot, s2: &'a Snapshot) -> Self {
        Self {
            sides: [Side::new(s1), Side::new(s2)],
            objects: s1.objects(),
            compared_pointers: HashSet::new(),
        }
    }

    fn snapshots(&self) -> (&'a Snapshot, &'a Snapshot) {
        (self.sides[0].snapshot, self.sides[1].snapshot)
    }

    fn ty(&self, r: TypeRef) -> Option<&'a Type> {
        self.objects.get(r.object)?.types.get(r.id)
    }

    fn resolved(&self, r: TypeRef) -> Option<&'a Type> {
        self.objects.get(r.object)?.types.resolve(r.id)
    }

    fn bytes_differ(&self, area1: u64, area2: u64, size: u64) -> Result<AreaComparison, SnapshotError> {
        let (s1, s2) = self.snapshots();
        let a = s1.read_vec(area1, size as usize)?;
        let b = s2.read_vec(area2, size as usize)?;
        Ok(AreaComparison::from_difference(a != b))
    }

    fn match_equals(&mut self, pairs: &VisitedPairs) {
        for (a, b) in pairs {
            let fa = a.fragment.max(0) as usize;
            let fb = b.fragment.max(0) as usize;
            self.sides[0].set_equal(a.block, fa, *b);
            self.sides[1].set_equal(b.block, fb, *a);
        }
    }

    fn blocks_equal(&self, b1: u64, b2: u64) -> bool {
        self.sides[0].equals(b1, 0).is_some_and(|l| l.block == b2)
            && self.sides[1].equals(b2, 0).is_some_and(|l| l.block == b1)
    }

    fn fragments_equal(&self, b1: u64, f1: usize, b2: u64, f2: usize) -> bool {
        self.sides[0].equals(b1, f1) == Some(HeapLocation::fragment(b2, f2))
            && self.sides[1].equals(b2, f2) == Some(HeapLocation::fragment(b1, f1))
    }

    /// Compares the heap areas at `area1` and `area2`. A top-level call (no
    /// `visited`) records the matched pairs when the areas are not different.
    fn compare_heap_area(
        &mut self,
        area1: u64,
        area2: u64,
        visited: Option<&mut VisitedPairs>,
        ty: Option<TypeRef>,
        pointer_level: u32,
    ) -> Result<AreaComparison, SnapshotError> {
        match visited {
            Some(visited) => self.heap_area(area1, area2, visited, ty, pointer_level),
            None => {
                let mut current = VisitedPairs::new();
                let result = self.heap_area(area1, area2, &mut current, ty, pointer_level)?;
                if !result.is_different() {
                    self.match_equals(&current);
                }
                Ok(result)
            }
        }
    }

    fn heap_area(
        &mut self,
        area1: u64,
        area2: u64,
        visited: &mut VisitedPairs,
        ty: Option<TypeRef>,
        pointer_level: u32,
    ) -> Result<AreaComparison, SnapshotError> {
        use AreaComparison::*;
        let (s1, s2) = self.snapshots();
        let (Some(h1), Some(h2)) = (self.sides[0].heap, self.sides[1].heap) else {
            return Ok(Different);
        };
        let (Some(block1), Some(block2)) = (h1.block_of(area1), h2.block_of(area2)) else {
            return Ok(Different);
        };

        if s1.is_stack_block(block1) && s2.is_stack_block(block2) {
            visited.insert((HeapLocation::whole(block1), HeapLocation::whole(block2)));
            return Ok(Same);
        }
        if block1 >= h1.heapsize || block2 >= h2.heapsize {
            return Ok(Different);
        }
        let real_block1 = h1.block_address(block1);
        let real_block2 = h2.block_address(block2);

        let mut ty = ty;
        let mut type_size = None;
        if let Some(r) = ty
            && let Some(t) = self.resolved(r)
        {
            ty = Some(TypeRef {
                object: r.object,
                id: t.id,
            });
            type_size = match t.kind {
                TypeKind::Pointer { .. } => None,
                TypeKind::Base if t.name == "char" => None,
                _ => Some(t.byte_size),
            };
        }

        let mut check_ignore = 0;
        let size: u64;
        match (h1.block_info(s1, block1)?, h2.block_info(s2, block2)?) {
            (BlockInfo::Free | BlockInfo::HeapInfo, BlockInfo::Free | BlockInfo::HeapInfo) => {
                return Ok(Same);
            }
            (
                BlockInfo::Unfragmented {
                    size: size1,
                    busy_size: busy1,
                    ignore: ignore1,
                },
                BlockInfo::Unfragmented {
                    size: size2,
                    busy_size: busy2,
                    ignore: ignore2,
                },
            ) => {
                if self.sides[0].equals(block1, 0).is_some()
                    && self.sides[1].equals(block2, 0).is_some()
                    && self.blocks_equal(block1, block2)
                {
                    return Ok(Same);
                }
                if let Some(type_size) = type_size
                    && type_size != busy1
                    && type_size != busy2
                    && ty.and_then(|r| self.ty(r)).is_some_and(|t| t.name.is_empty())
                {
                    return Ok(Unknown);
                }
                if size1 != size2 || busy1 != busy2 {
                    return Ok(Different);
                }
                if !visited.insert((HeapLocation::whole(block1), HeapLocation::whole(block2))) {
                    return Ok(Same);
                }
                if let Some(r) = ty {
                    if area1 == real_block1 {
                        self.sides[0].set_type(block1, 0, r);
                    }
                    if area2 == real_block2 {
                        self.sides[1].set_type(block2, 0, r);
                    }
                }
                if busy1 == 0 {
                    return Ok(Same);
                }
                if ignore1 > 0 && ignore2 == ignore1 {
                    check_ignore = ignore1;
                }
                size = busy1;
            }
            (BlockInfo::Fragmented(f1), BlockInfo::Fragmented(f2)) => {
                let frag1 = ((area1 - real_block1) >> f1.log2) as usize;
                let frag2 = ((area2 - real_block2) >> f2.log2) as usize;
                let real_frag1 = real_block1 + ((frag1 as u64) << f1.log2);
                let real_frag2 = real_block2 + ((frag2 as u64) << f2.log2);
                let used1 = f1.frag_size[frag1] as i64;
                let used2 = f2.frag_size[frag2] as i64;

                if let Some(type_size) = type_size
                    && (used1 == -1 || used2 == -1 || type_size as i64 != used1 || type_size as i64 != used2)
                {
                    return Ok(Unknown);
                }
                if self.sides[0].equals(block1, frag1).is_some()
                    && self.sides[1].equals(block2, frag2).is_some()
                    && self.fragments_equal(block1, frag1, block2, frag2)
                {
                    return Ok(Same);
                }
                if used1 != used2 {
                    return Ok(if type_size.is_none() { Unknown } else { Different });
                }

                let mut used = used1;
                if let Some(r) = ty {
                    if area1 == real_frag1 {
                        self.sides[0].set_type(block1, frag1, r);
                    }
                    if area2 == real_frag2 {
                        self.sides[1].set_type(block2, frag2, r);
                    }
                }

                let (mut offset1, mut offset2) = (0, 0);
                if ty.is_none() {
                    let known1 = self.sides[0].type_at(block1, frag1);
                    let known2 = self.sides[1].type_at(block2, frag2);
                    if let Some(base) = known1.or(known2) {
                        offset1 = area1 - real_frag1;
                        offset2 = area2 - real_frag2;
                        let inferred1 = self.offset_type(known1.unwrap_or(base), offset1, used);
                        let inferred2 = self.offset_type(known2.unwrap_or(base), offset2, used);
                        let (Some(inferred1), Some(inferred2)) = (inferred1, inferred2) else {
                            return Ok(Unknown);
                        };
                        let size1 = self.resolved(inferred1).map(|t| t.byte_size).unwrap_or(0);
                        let size2 = self.resolved(inferred2).map(|t| t.byte_size).unwrap_or(0);
                        if size1 > 0 && size1 == size2 {
                            ty = Some(inferred1);
                            used = size1 as i64;
                        }
                    }
                }

                if offset1 == 0
                    && offset2 == 0
                    && !visited.insert((
                        HeapLocation::fragment(block1, frag1),
                        HeapLocation::fragment(block2, frag2),
                    ))
                {
                    return Ok(Same);
                }
                if used <= 0 {
                    return Ok(Same);
                }
                if f1.ignore[frag1] > 0 && f2.ignore[frag2] == f1.ignore[frag1] {
                    check_ignore = f1.ignore[frag1];
                }
                size = used as u64;
            }
            _ => return Ok(Different),
        }

        let result = match ty {
            Some(r) => self.heap_area_with_type(
                area1,
                area2,
                visited,
                r,
                Some(size),
                check_ignore,
                pointer_level,
            )?,
            None => self.heap_area_without_type(area1, area2, visited, size, check_ignore)?,
        };
        Ok(if result.is_different() { Different } else { Same })
    }

    /// Type of the member at `offset` inside an area of type `r`.
    fn offset_type(&self, r: TypeRef, offset: u64, area_size: i64) -> Option<TypeRef> {
        if offset == 0 {
            return Some(r);
        }
        let t = self.resolved(r)?;
        let TypeKind::Struct { members } = &t.kind else {
            return None;
        };
        let full = TypeRef {
            object: r.object,
            id: t.id,
        };
        let area_size = area_size as u64;
        if area_size != t.byte_size {
            return (t.byte_size > 0 && area_size > t.byte_size && area_size % t.byte_size == 0)
                .then_some(full);
        }
        members
            .iter()
            .find(|m| m.offset == offset)
            .and_then(|m| m.type_id)
            .map(|id| TypeRef {
                object: r.object,
                id,
            })
    }

    fn heap_area_without_type(
        &mut self,
        area1: u64,
        area2: u64,
        visited: &mut VisitedPairs,
        size: u64,
        check_ignore: i32,
    ) -> Result<AreaComparison, SnapshotError> {
        let (s1, s2) = self.snapshots();
        let bytes1 = s1.read_vec(area1, size as usize)?;
        let bytes2 = s2.read_vec(area2, size as usize)?;
        let mut check_ignore = check_ignore;
        let mut i = 0u64;
        while i < size {
            if check_ignore > 0
                && let Some(ignored) = self.sides[0].ignore_size(area1 + i)
                && self.sides[1].ignore_size(area2 + i) == Some(ignored)
            {
                check_ignore -= 1;
                if ignored == 0 {
                    return Ok(AreaComparison::Same);
                }
                i += ignored;
                continue;
            }

            if bytes1[i as usize] != bytes2[i as usize] {
                let aligned = i / 8 * 8;
                let pointed1 = s1.read_u64(area1 + aligned)?;
                let pointed2 = s2.read_u64(area2 + aligned)?;
                if self.sides[0].in_heap(pointed1) && self.sides[1].in_heap(pointed2) {
                    let result =
                        self.compare_heap_area(pointed1, pointed2, Some(visited), None, 0)?;
                    if result.is_different() {
                        return Ok(result);
                    }
                    i = aligned + 8;
                    continue;
                }
                return Ok(AreaComparison::Different);
            }
            i += 1;
        }
        Ok(AreaComparison::Same)
    }

    #[allow(clippy::too_many_arguments)]
    fn heap_area_with_type(
        &mut self,
        area1: u64,
        area2: u64,
        visited: &mut VisitedPairs,
        ty: TypeRef,
        area_size: Option<u64>,
        check_ignore: i32,
        pointer_level: u32,
    ) -> Result<AreaComparison, SnapshotError> {
        use AreaComparison::*;
        let (s1, s2) = self.snapshots();
        let mut r = ty;
        loop {
            let Some(t) = self.ty(r) else {
                return Ok(Same);
            };
            if s1.is_stack(area1) && s2.is_stack(area2) {
                return Ok(Same);
            }
            if check_ignore > 0
                && let Some(ignored) = self.sides[0].ignore_size(area1)
                && ignored > 0
                && self.sides[1].ignore_size(area2) == Some(ignored)
            {
                return Ok(Same);
            }

            return match &t.kind {
                TypeKind::Unspecified => Ok(Different),
                TypeKind::Base if t.name == "char" => {
                    if area1 == area2 {
                        Ok(Unknown)
                    } else {
                        self.bytes_differ(area1, area2, area_size.unwrap_or(t.byte_size))
                    }
                }
                TypeKind::Base | TypeKind::Enum => {
                    if area_size.is_some_and(|s| s != t.byte_size) {
                        Ok(Unknown)
                    } else {
                        self.bytes_differ(area1, area2, t.byte_size)
                    }
                }
                TypeKind::Alias { target } => match target {
                    Some(target) => {
                        r = TypeRef {
                            object: r.object,
                            id: *target,
                        };
                        continue;
                    }
                    None => Ok(Same),
                },
                TypeKind::Array { element, count } => {
                    let Some(element) = *element else {
                        return Ok(Same);
                    };
                    let element = TypeRef {
                        object: r.object,
                        id: element,
                    };
                    let Some(resolved) = self.resolved(element) else {
                        return Ok(Same);
                    };
                    match resolved.kind {
                        TypeKind::Unspecified => return Ok(Different),
                        TypeKind::Subroutine => return Ok(Same),
                        _ => {}
                    }
                    let stride = resolved.byte_size;
                    for i in 0..*count {
                        let result = self.heap_area_with_type(
                            area1 + i * stride,
                            area2 + i * stride,
                            visited,
                            element,
                            Some(stride),
                            check_ignore,
                            pointer_level,
                        )?;
                        if result.is_different() {
                            return Ok(result);
                        }
                    }
                    Ok(Same)
                }
                TypeKind::Pointer {
                    target,
                    to_subroutine,
                } => {
                    if *to_subroutine {
                        let differs = s1.read_u64(area1)? != s2.read_u64(area2)?;
                        return Ok(AreaComparison::from_difference(differs));
                    }
                    let target = target.map(|id| TypeRef {
                        object: r.object,
                        id,
                    });
                    let level = pointer_level + 1;
                    let pointers = if level <= 1 {
                        1
                    } else {
                        area_size.unwrap_or(8) / 8
                    };
                    for i in 0..pointers {
                        let pointed1 = s1.read_u64(area1 + i * 8)?;
                        let pointed2 = s2.read_u64(area2 + i * 8)?;
                        let result = if self.sides[0].in_heap(pointed1) && self.sides[1].in_heap(pointed2) {
                            self.compare_heap_area(pointed1, pointed2, Some(visited), target, level)?
                        } else {
                            AreaComparison::from_difference(pointed1 != pointed2)
                        };
                        if level <= 1 || result.is_different() {
                            return Ok(result);
                        }
                    }
                    Ok(Same)
                }
                TypeKind::Struct { .. } => {
                    let Some(full) = self.resolved(r) else {
                        return Ok(Same);
                    };
                    let full_ref = TypeRef {
                        object: r.object,
                        id: full.id,
                    };
                    let byte_size = full.byte_size;
                    if let Some(area_size) = area_size
                        && area_size != byte_size
                    {
                        if byte_size == 0 || area_size <= byte_size || area_size % byte_size != 0 {
                            return Ok(Unknown);
                        }
                        for i in 0..area_size / byte_size {
                            let result = self.heap_area_with_type(
                                area1 + i * byte_size,
                                area2 + i * byte_size,
                                visited,
                                full_ref,
                                None,
                                check_ignore,
                                0,
                            )?;
                            if result.is_different() {
                                return Ok(result);
                            }
                        }
                    } else {
                        for member in full.members() {
                            let Some(member_type) = member.type_id else {
                                continue;
                            };
                            let result = self.heap_area_with_type(
                                area1 + member.offset,
                                area2 + member.offset,
                                visited,
                                TypeRef {
                                    object: r.object,
                                    id: member_type,
                                },
                                None,
                                check_ignore,
                                0,
                            )?;
                            if result.is_different() {
                                return Ok(result);
                            }
                        }
                    }
                    Ok(Same)
                }
                TypeKind::Union { .. } => {
                    self.heap_area_without_type(area1, area2, visited, t.byte_size, check_ignore)
                }
                TypeKind::Subroutine => Ok(Same),
            };
        }
    }

    /// Typed comparison of an area outside the heap (global or local variable).
    fn compare_areas_with_type(
        &mut self,
        area1: u64,
        area2: u64,
        ty: TypeRef,
        pointer_level: u32,
    ) -> Result<AreaComparison, SnapshotError> {
        use AreaComparison::*;
        let (s1, s2) = self.snapshots();
        let mut r = ty;
        loop {
            let Some(t) = self.ty(r) else {
                return Ok(Same);
            };
            return match &t.kind {
                TypeKind::Unspecified => Ok(Different),
                TypeKind::Base | TypeKind::Enum | TypeKind::Union { .. } => {
                    self.bytes_differ(area1, area2, t.byte_size)
                }
                TypeKind::Alias { target } => match target {
                    Some(target) => {
                        r = TypeRef {
                            object: r.object,
                            id: *target,
                        };
                        continue;
                    }
                    None => Ok(Same),
                },
                TypeKind::Array { element, count } => {
                    let Some(element) = *element else {
                        return Ok(Same);
                    };
                    let element = TypeRef {
                        object: r.object,
                        id: element,
                    };
                    let Some(resolved) = self.resolved(element) else {
                        return Ok(Same);
                    };
                    match resolved.kind {
                        TypeKind::Unspecified => return Ok(Different),
                        TypeKind::Subroutine => return Ok(Same),
                        _ => {}
                    }
                    let stride = resolved.byte_size;
                    for i in 0..*count {
                        let result = self.compare_areas_with_type(
                            area1 + i * stride,
                            area2 + i * stride,
                            element,
                            pointer_level,
                        )?;
                        if result.is_different() {
                            return Ok(result);
                        }
                    }
                    Ok(Same)
                }
                TypeKind::Pointer {
                    target,
                    to_subroutine,
                } => {
                    let pointed1 = s1.read_u64(area1)?;
                    let pointed2 = s2.read_u64(area2)?;
                    if *to_subroutine {
                        return Ok(AreaComparison::from_difference(pointed1 != pointed2));
                    }
                    match (pointed1, pointed2) {
                        (0, 0) => return Ok(Same),
                        (0, _) | (_, 0) => return Ok(Different),
                        _ => {}
                    }
                    if !self.compared_pointers.insert((pointed1, pointed2)) {
                        return Ok(Same);
                    }
                    let level = pointer_level + 1;
                    let target = target.map(|id| TypeRef {
                        object: r.object,
                        id,
                    });

                    if self.sides[0].in_heap(pointed1) {
                        if !self.sides[1].in_heap(pointed2) {
                            return Ok(Different);
                        }
                        return self.compare_heap_area(pointed1, pointed2, None, target, level);
                    }
                    let region1 = s1.region_of(area1);
                    if region1.is_some_and(|region| region.contains(pointed1)) {
                        if !s2.region_of(area2).is_some_and(|region| region.contains(pointed2)) {
                            return Ok(Different);
                        }
                        return match target {
                            Some(target) => {
                                self.compare_areas_with_type(pointed1, pointed2, target, level)
                            }
                            None => Ok(AreaComparison::from_difference(pointed1 != pointed2)),
                        };
                    }
                    Ok(AreaComparison::from_difference(pointed1 != pointed2))
                }
                TypeKind::Struct { .. } => {
                    let Some(full) = self.resolved(r) else {
                        return Ok(Same);
                    };
                    for member in full.members() {
                        let Some(member_type) = member.type_id else {
                            continue;
                        };
                        let result = self.compare_areas_with_type(
                            area1 + member.offset,
                            area2 + member.offset,
                            TypeRef {
                                object: r.object,
                                id: member_type,
                            },
                            pointer_level,
                        )?;
                        if result.is_different() {
                            return Ok(result);
                        }
                    }
                    Ok(Same)
                }
                TypeKind::Subroutine => Ok(Unknown),
            };
        }
    }

    fn globals_differ(
        &mut self,
        object: usize,
        region1: &Region,
        region2: &Region,
    ) -> Result<bool, SnapshotError> {
        match (&region1.storage, &region2.storage) {
            (RegionStorage::Privatized(copies1), RegionStorage::Privatized(copies2)) => {
                if copies1.len() != copies2.len() {
                    return Ok(true);
                }
                for (c1, c2) in copies1.iter().zip(copies2) {
                    let size = c1.range.size() as usize;
                    let mut a = vec![0u8; size];
                    let mut b = vec![0u8; size];
                    c1.read(c1.range.start, &mut a)?;
                    c2.read(c2.range.start, &mut b)?;
                    if a != b {
                        return Ok(true);
                    }
                }
                return Ok(false);
            }
            (RegionStorage::Privatized(_), _) | (_, RegionStorage::Privatized(_)) => return Ok(true),
            _ => {}
        }

        let Some(info) = self.objects.get(object).cloned() else {
            return Ok(false);
        };
        let Some(rw) = info.rw else {
            return Ok(false);
        };
        for variable in &info.globals {
            if !rw.contains(variable.address) {
                continue;
            }
            let Some(type_id) = variable.type_id else {
                continue;
            };
            let result = self.compare_areas_with_type(
                variable.address,
                variable.address,
                TypeRef { object, id: type_id },
                0,
            )?;
            if result.is_different() {
                trace!(
                    variable = %variable.name,
                    address = variable.address,
                    object = %info.path,
                    "global variable differs"
                );
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn locals_differ(
        &mut self,
        stack1: &StackSnapshot,
        stack2: &StackSnapshot,
    ) -> Result<bool, SnapshotError> {
        if stack1.locals.len() != stack2.locals.len() {
            trace!("different number of local variables");
            return Ok(true);
        }
        for (var1, var2) in stack1.locals.iter().zip(&stack2.locals) {
            if var1.name != var2.name || var1.subprogram != var2.subprogram || var1.ip != var2.ip {
                trace!(
                    name1 = %var1.name,
                    name2 = %var2.name,
                    frame1 = %var1.subprogram,
                    frame2 = %var2.subprogram,
                    ip1 = var1.ip,
                    ip2 = var2.ip,
                    "different local variable or frame"
                );
                return Ok(true);
            }
            let Some(type_id) = var1.type_id else {
                continue;
            };
            let result = self.compare_areas_with_type(
                var1.address,
                var2.address,
                TypeRef {
                    object: var1.object,
                    id: type_id,
                },
                0,
            )?;
            if result.is_different() {
                trace!(name = %var1.name, frame = %var1.subprogram, "local variable differs");
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Every busy block/fragment of the first heap must match one of the second,
    /// trying the same location first.
    fn heaps_equal(&mut self) -> Result<bool, SnapshotError> {
        let (s1, s2) = self.snapshots();
        let (Some(h1), Some(h2)) = (self.sides[0].heap, self.sides[1].heap) else {
            return Ok(true);
        };
        let heaplimit = h1.heaplimit;
        let mut unmatched = 0;
        let mut completed = true;

        let mut i1 = 1;
        'blocks: while i1 < heaplimit {
            let info2 = h2.block_info(s2, i1)?;
            match h1.block_info(s1, i1)? {
                BlockInfo::Free | BlockInfo::HeapInfo => i1 += 1,
                BlockInfo::Unfragmented {
                    size: size1,
                    busy_size,
                    ..
                } => {
                    let addr1 = h1.block_address(i1);
                    if s1.is_stack(addr1) {
                        for k in 0..size1 {
                            self.sides[0].set_equal(i1 + k, 0, HeapLocation::whole(i1));
                        }
                        if let BlockInfo::Unfragmented { size: size2, .. } = info2 {
                            for k in 0..size2 {
                                self.sides[1].set_equal(i1 + k, 0, HeapLocation::whole(i1));
                            }
                        }
                        i1 += size1.max(1);
                        continue;
                    }
                    if size1 == 0 || self.sides[0].equals(i1, 0).is_some() {
                        i1 += 1;
                        continue;
                    }

                    let mut matched = None;
                    if let BlockInfo::Unfragmented { size: size2, .. } = info2
                        && self.sides[1].equals(i1, 0).is_none()
                        && !self
                            .compare_heap_area(addr1, h2.block_address(i1), None, None, 0)?
                            .is_different()
                    {
                        matched = Some((i1, size2));
                    }
                    let mut i2 = 1;
                    while matched.is_none() && i2 < heaplimit {
                        if i2 != i1
                            && let BlockInfo::Unfragmented { size: size2, .. } = h2.block_info(s2, i2)?
                            && self.sides[1].equals(i2, 0).is_none()
                            && !self
                                .compare_heap_area(addr1, h2.block_address(i2), None, None, 0)?
                                .is_different()
                        {
                            matched = Some((i2, size2));
                        }
                        i2 += 1;
                    }

                    match matched {
                        Some((i2, size2)) => {
                            for k in 1..size2 {
                                self.sides[1].set_equal(i2 + k, 0, HeapLocation::whole(i1));
                            }
                            for k in 1..size1 {
                                self.sides[0].set_equal(i1 + k, 0, HeapLocation::whole(i2));
                            }
                            i1 += size1.max(1);
                        }
                        None => {
                            trace!(block = i1, busy_size, "heap block not found");
                            unmatched += 1;
                            completed = false;
                            break 'blocks;
                        }
                    }
                }
                BlockInfo::Fragmented(f1) => {
                    let block1 = h1.block_address(i1);
                    for j1 in 0..f1.count() {
                        if f1.frag_size[j1] == -1 || self.sides[0].equals(i1, j1).is_some() {
                            continue;
                        }
                        let frag1 = block1 + ((j1 as u64) << f1.log2);

                        let mut equal = false;
                        if let BlockInfo::Fragmented(f2) = info2
                            && f2.log2 == f1.log2
                            && self.sides[1].equals(i1, j1).is_none()
                        {
                            let frag2 = h2.block_address(i1) + ((j1 as u64) << f2.log2);
                            equal = !self
                                .compare_heap_area(frag1, frag2, None, None, 0)?
                                .is_different();
                        }
                        let mut i2 = 1;
                        while !equal && i2 < heaplimit {
                            if let BlockInfo::Fragmented(f2) = h2.block_info(s2, i2)? {
                                for j2 in 0..f2.count() {
                                    if (i2 == i1 && j2 == j1)
                                        || f2.frag_size[j2] == -1
                                        || self.sides[1].equals(i2, j2).is_some()
                                    {
                                        continue;
                                    }
                                    let frag2 = h2.block_address(i2) + ((j2 as u64) << f2.log2);
                                    if !self
                                        .compare_heap_area(frag1, frag2, None, None, 0)?
                                        .is_different()
                                    {
                                        equal = true;
                                        break;
                                    }
                                }
                            }
                            i2 += 1;
                        }

                        if !equal {
                            trace!(
                                block = i1,
                                fragment = j1,
                                used = f1.frag_size[j1],
                                "heap fragment not found"
                            );
                            unmatched += 1;
                            completed = false;
                            break 'blocks;
                        }
                    }
                    i1 += 1;
                }
            }
        }

        if completed {
            unmatched += self.sides[0].unmatched(heaplimit)?;
            unmatched += self.sides[1].unmatched(heaplimit)?;
        }
        trace!(unmatched, "heap comparison done");
        Ok(unmatched == 0)
    }
}

/// Whether two snapshots represent the same application state. Checks run from
/// the cheapest to the most expensive: hash, enabled actors, stack sizes, heap
/// geometry, locals, globals, then the heap itself.
pub fn snapshot_equal(s1: &Snapshot, s2: &Snapshot) -> Result<bool, SnapshotError> {
    let (num1, num2) = (s1.num(), s2.num());

    if let (Some(hash1), Some(hash2)) = (s1.hash(), s2.hash())
        && hash1 != hash2
    {
        trace!(%num1, %num2, hash1, hash2, "different hash");
        return Ok(false);
    }
    if s1.enabled_actors() != s2.enabled_actors() {
        trace!(%num1, %num2, "different enabled actors");
        return Ok(false);
    }
    if s1.stack_sizes() != s2.stack_sizes() {
        trace!(%num1, %num2, "different stack sizes");
        return Ok(false);
    }
    match (s1.heap(), s2.heap()) {
        (Some(h1), Some(h2)) if h1.heaplimit != h2.heaplimit || h1.heapsize != h2.heapsize => {
            trace!(%num1, %num2, "different heap information");
            return Ok(false);
        }
        (Some(_), None) | (None, Some(_)) => {
            trace!(%num1, %num2, "only one snapshot has a heap");
            return Ok(false);
        }
        _ => {}
    }

    let mut comparator = StateComparator::new(s1, s2);

    for (index, (stack1, stack2)) in s1.stacks().iter().zip(s2.stacks()).enumerate() {
        if comparator.locals_differ(stack1, stack2)? {
            trace!(%num1, %num2, stack = index + 1, "different local variables");
            return Ok(false);
        }
    }

    if s1.regions().len() != s2.regions().len() {
        trace!(%num1, %num2, "different region count");
        return Ok(false);
    }
    for (region1, region2) in s1.regions().iter().zip(s2.regions()) {
        if region1.kind != RegionKind::Data {
            continue;
        }
        let Some(object) = region1.object else {
            continue;
        };
        if region2.kind != RegionKind::Data || region2.object != Some(object) {
            return Ok(false);
        }
        if comparator.globals_differ(object, region1, region2)? {
            trace!(%num1, %num2, object, "different global variables");
            return Ok(false);
        }
    }

    if !comparator.heaps_equal()? {
        trace!(%num1, %num2, "different heap");
        return Ok(false);
    }
    trace!(%num1, %num2, "no difference found");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page_store::PageStore;
    use crate::snapshot::CaptureOptions;
    use crate::testing::{self, NOISE, TestApp};
    use sonde_remote::{AddressSpace, IgnoredHeapRegion};
    use sonde_types::{ActorId, StateNum};
    use std::collections::BTreeSet;

    fn take_with(app: &mut TestApp, num: u64, enabled: &[u64], hash: bool) -> Snapshot {
        let mut store = PageStore::new();
        Snapshot::take(
            StateNum::new(num).expect("num"),
            &mut app.mem,
            &mut store,
            enabled
                .iter()
                .map(|&a| ActorId::new(a).expect("aid"))
                .collect::<BTreeSet<_>>(),
            CaptureOptions {
                hash,
                ..CaptureOptions::default()
            },
        )
        .expect("snapshot")
    }

    fn take(app: &mut TestApp, num: u64) -> Snapshot {
        take_with(app, num, &[1], false)
    }

    #[test]
    fn equality_is_reflexive_and_stable() {
        let mut app = testing::app();
        app.set_counter(3);
        app.push_list(&[1, 2, 3]);
        app.add_stack(8);
        let first = take(&mut app, 1);
        let second = take(&mut app, 2);
        assert!(snapshot_equal(&first, &first).expect("compare"));
        assert!(snapshot_equal(&first, &second).expect("compare"));
        assert!(snapshot_equal(&second, &first).expect("compare"));
    }

    #[test]
    fn a_changed_global_is_a_difference() {
        let mut app = testing::app();
        let before = take(&mut app, 1);
        app.set_counter(1);
        let after = take(&mut app, 2);
        assert!(!snapshot_equal(&before, &after).expect("compare"));
    }

    #[test]
    fn enabled_actors_and_hash_are_checked_first() {
        let mut app = testing::app();
        let one = take_with(&mut app, 1, &[1, 2], true);
        let other = take_with(&mut app, 2, &[1], true);
        assert_ne!(one.hash(), other.hash());
        assert!(!snapshot_equal(&one, &other).expect("compare"));
        let same = take_with(&mut app, 3, &[1, 2], true);
        assert_eq!(one.hash(), same.hash());
        assert!(snapshot_equal(&one, &same).expect("compare"));
    }

    #[test]
    fn same_list_at_other_addresses_is_equal() {
        let mut a = testing::app();
        let n1 = a.alloc_node(10);
        let n2 = a.alloc_node(20);
        a.link(n1, n2);
        a.set_list(n1);
        let sa = take(&mut a, 1);

        // allocated in the opposite order: the head sits in the second fragment
        let mut b = testing::app();
        let m2 = b.alloc_node(20);
        let m1 = b.alloc_node(10);
        b.link(m1, m2);
        b.set_list(m1);
        let sb = take(&mut b, 2);

        assert_ne!(n1, m1);
        assert!(snapshot_equal(&sa, &sb).expect("compare"));
    }

    #[test]
    fn a_different_value_deep_in_the_list_is_a_difference() {
        let mut a = testing::app();
        a.push_list(&[1, 2, 3]);
        let sa = take(&mut a, 1);
        let mut b = testing::app();
        b.push_list(&[1, 2, 4]);
        let sb = take(&mut b, 2);
        assert!(!snapshot_equal(&sa, &sb).expect("compare"));
    }

    #[test]
    fn cyclic_structures_terminate() {
        let mut a = testing::app();
        let x = a.alloc_node(1);
        let y = a.alloc_node(2);
        a.link(x, y);
        a.link(y, x);
        a.set_list(x);
        let first = take(&mut a, 1);
        let second = take(&mut a, 2);
        assert!(snapshot_equal(&first, &second).expect("compare"));

        a.mem.write_i32(y, 3).expect("value");
        let changed = take(&mut a, 3);
        assert!(!snapshot_equal(&first, &changed).expect("compare"));
    }

    #[test]
    fn an_extra_allocation_is_a_difference() {
        let mut a = testing::app();
        a.push_list(&[1]);
        let before = take(&mut a, 1);
        let mut b = testing::app();
        b.push_list(&[1]);
        b.heap.alloc(&mut b.mem, 32).expect("alloc");
        let after = take(&mut b, 2);
        assert!(!snapshot_equal(&before, &after).expect("compare"));
    }

    #[test]
    fn ignored_global_bytes_never_differ() {
        let mut a = testing::app();
        a.mem.layout_mut().ignore_region(NOISE, 8);
        a.mem.write_u64(NOISE, 1).expect("write");
        let first = take(&mut a, 1);
        a.mem.write_u64(NOISE, 2).expect("write");
        let second = take(&mut a, 2);
        assert!(snapshot_equal(&first, &second).expect("compare"));
    }

    fn with_ignored_block(filler: u8) -> Snapshot {
        let mut app = testing::app();
        let block = app.heap.alloc_blocks(&mut app.mem, 64).expect("block");
        app.mem.write_bytes(block, &[7u8; 64]).expect("fill");
        app.mem.write_bytes(block + 8, &[filler; 8]).expect("fill");
        app.heap.mark_ignored(&mut app.mem, block + 8).expect("mark");
        let heap_block = app.heap.descriptor().block_of(block).expect("block");
        app.mem.layout_mut().ignore_heap(IgnoredHeapRegion {
            address: block + 8,
            size: 8,
            block: heap_block,
            fragment: -1,
        });
        take(&mut app, u64::from(filler))
    }

    #[test]
    fn ignored_heap_bytes_never_differ() {
        let first = with_ignored_block(1);
        let second = with_ignored_block(2);
        assert!(snapshot_equal(&first, &second).expect("compare"));
    }

    #[test]
    fn different_locals_are_a_difference() {
        let mut a = testing::app();
        a.add_stack(1);
        let sa = take(&mut a, 1);
        let mut b = testing::app();
        b.add_stack(2);
        let sb = take(&mut b, 2);
        assert!(!snapshot_equal(&sa, &sb).expect("compare"));
    }
}
