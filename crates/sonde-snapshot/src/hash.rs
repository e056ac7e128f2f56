use crate::snapshot::Snapshot;
use std::hash::{DefaultHasher, Hash, Hasher};

/// Hash over the parts of a snapshot that equal snapshots always share: the
/// enabled actors, stack usage, heap geometry and the shape of every stack.
/// Two snapshots with different hashes are never equal.
pub(crate) fn state_hash(snapshot: &Snapshot) -> u64 {
    let mut hasher = DefaultHasher::new();
    snapshot.enabled_actors().hash(&mut hasher);
    snapshot.stack_sizes().hash(&mut hasher);
    if let Some(heap) = snapshot.heap() {
        heap.heaplimit.hash(&mut hasher);
        heap.heapsize.hash(&mut hasher);
    }
    for stack in snapshot.stacks() {
        stack.locals.len().hash(&mut hasher);
        for local in &stack.locals {
            local.name.hash(&mut hasher);
            local.subprogram.hash(&mut hasher);
            local.ip.hash(&mut hasher);
        }
    }
    hasher.finish()
}
