//! Everything the checker needs to look inside the application: ptrace
//! control, raw memory access, loaded objects with their debug information,
//! and actor stack unwinding.

pub mod debuginfo;
mod error;
pub mod maps;
mod memory;
pub mod process;
mod remote_memory;
pub mod unwind;

pub use debuginfo::{
    FrameBase, LocalVariable, Member, ObjectInformation, Subprogram, Type, TypeId, TypeKind,
    TypeTable, Variable,
};
pub use error::{RemoteError, Termination};
pub use memory::{AddressSpace, IgnoredHeapRegion, LocalMemory, ProcessLayout, StackArea};
pub use process::{Tracee, TraceeEvent, spawn};
pub use remote_memory::{HEAP_DESCRIPTOR_SYMBOL, RemoteProcessMemory};
pub use unwind::{Frame, FunctionRef, SavedRegisters, unwind_stack};
