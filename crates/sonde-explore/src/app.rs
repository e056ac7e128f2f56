use crate::ExploreError;
use crate::transition::Transition;
use sonde_remote::{AddressSpace, IgnoredHeapRegion, ProcessLayout, StackArea};
use sonde_types::ActorId;
use sonde_wire::{ActorStatus, Message};
use tracing::debug;

/// Outcome of one step of the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub transition: Transition,
    /// The application reported a failed assertion during the step.
    pub assertion_failed: bool,
}

/// The application as seen by an exploration: it can be asked to run one step
/// of one actor, and its memory can be read, snapshotted and restored.
pub trait RemoteApp {
    fn actors_status(&mut self) -> Result<Vec<ActorStatus>, ExploreError>;

    fn execute(&mut self, aid: ActorId, times_considered: u32) -> Result<Step, ExploreError>;

    /// Some actor is alive and none can progress.
    fn deadlock_check(&mut self) -> Result<bool, ExploreError>;

    fn memory(&self) -> &dyn AddressSpace;

    fn memory_mut(&mut self) -> &mut dyn AddressSpace;

    fn finalize(&mut self) -> Result<(), ExploreError>;
}

/// Applies the memory registrations the application sends while it runs.
/// Any other message is handed back.
pub fn apply_registration(layout: &mut ProcessLayout, message: Message) -> Option<Message> {
    match message {
        Message::IgnoreMemory { addr, size } => {
            debug!(addr, size, "ignore memory");
            layout.ignore_region(addr, size);
        }
        Message::IgnoreHeap {
            addr,
            size,
            block,
            fragment,
        } => {
            debug!(addr, size, block, fragment, "ignore heap");
            layout.ignore_heap(IgnoredHeapRegion {
                address: addr,
                size,
                block,
                fragment,
            });
        }
        Message::UnignoreHeap { addr, size } => {
            debug!(addr, size, "unignore heap");
            layout.unignore_heap(addr, size);
        }
        Message::RegisterSymbol { name, address } => {
            debug!(%name, address, "register symbol");
            layout.register_symbol(name, address);
        }
        Message::StackRegion {
            address,
            context,
            size,
            block,
        } => {
            debug!(address, size, block, "stack region");
            layout.add_stack_area(StackArea {
                address,
                context,
                size,
                block,
            });
        }
        other => return Some(other),
    }
    None
}
