//! Frame-pointer unwinding of actor stacks.

use crate::memory::{AddressSpace, StackArea};
use crate::RemoteError;
use tracing::trace;

const MAX_FRAMES: usize = 256;

/// Registers saved in an actor context, in this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SavedRegisters {
    pub rip: u64,
    pub rsp: u64,
    pub rbp: u64,
}

impl SavedRegisters {
    pub fn read(space: &(impl AddressSpace + ?Sized), context: u64) -> Result<Self, RemoteError> {
        Ok(Self {
            rip: space.read_u64(context)?,
            rsp: space.read_u64(context + 8)?,
            rbp: space.read_u64(context + 16)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FunctionRef {
    pub object: usize,
    pub subprogram: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    pub ip: u64,
    pub sp: u64,
    /// Base the function's locals are relative to.
    pub frame_base: u64,
    pub function: Option<FunctionRef>,
}

/// Walks the rbp chain from the registers saved in `area.context`. The walk stops
/// when the chain leaves the stack, stops growing, or reaches a null return address.
pub fn unwind_stack(
    space: &(impl AddressSpace + ?Sized),
    area: &StackArea,
) -> Result<Vec<Frame>, RemoteError> {
    let stack = area.range();
    let mut regs = SavedRegisters::read(space, area.context)?;
    let mut frames = Vec::new();

    for depth in 0..MAX_FRAMES {
        // return addresses point after the call
        let lookup_ip = if depth == 0 { regs.rip } else { regs.rip.wrapping_sub(1) };
        let function = space
            .layout()
            .find_function(lookup_ip)
            .map(|(object, subprogram)| FunctionRef { object, subprogram });
        let frame_base = match function {
            Some(f) => space.layout().objects[f.object].subprograms[f.subprogram]
                .frame_base_address(regs.rbp),
            None => regs.rbp.wrapping_add(16),
        };
        frames.push(Frame {
            ip: regs.rip,
            sp: regs.rsp,
            frame_base,
            function,
        });

        if regs.rbp == 0 || !stack.contains(regs.rbp) || !stack.contains(regs.rbp + 8) {
            break;
        }
        let next_rbp = space.read_u64(regs.rbp)?;
        let next_rip = space.read_u64(regs.rbp + 8)?;
        if next_rip == 0 || (next_rbp != 0 && next_rbp <= regs.rbp) {
            break;
        }
        regs = SavedRegisters {
            rip: next_rip,
            rsp: regs.rbp + 16,
            rbp: next_rbp,
        };
    }
    trace!(stack = %stack, frames = frames.len(), "unwound actor stack");
    Ok(frames)
}
