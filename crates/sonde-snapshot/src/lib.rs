//! Snapshots of the application memory and the state-equality test used to
//! detect already visited states.

mod compare;
mod error;
mod hash;
pub mod heap;
pub mod page_store;
mod region;
mod snapshot;
#[cfg(test)]
mod testing;

pub use compare::{AreaComparison, HeapLocation, VisitedPairs, snapshot_equal};
pub use error::SnapshotError;
pub use heap::{BlockInfo, HeapDescriptor, Live};
pub use page_store::{PAGE_SIZE, Page, PageStore};
pub use region::{Region, RegionKind, RegionStorage, StorageKind};
pub use snapshot::{CaptureOptions, MemoryView, Snapshot, SnapshotLocal, StackSnapshot};
