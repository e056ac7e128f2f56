//! In-process application used by the tests of this crate: one object with a
//! few typed globals, a formatted heap and optionally one actor stack.

use crate::heap::{BLOCKSIZE, HeapBuilder};
use sonde_remote::{
    AddressSpace, FrameBase, LocalMemory, LocalVariable, Member, ObjectInformation, ProcessLayout,
    StackArea, Subprogram, Type, TypeKind, Variable,
};
use sonde_types::AddressRange;
use std::sync::Arc;

pub(crate) const APP_DATA: u64 = 0x60_0000;
pub(crate) const COUNTER: u64 = APP_DATA;
pub(crate) const LIST: u64 = APP_DATA + 0x8;
pub(crate) const NOISE: u64 = APP_DATA + 0x10;
pub(crate) const HEAP_POINTER: u64 = APP_DATA + 0x100;
pub(crate) const DESCRIPTOR: u64 = APP_DATA + 0x200;
pub(crate) const CONTEXT: u64 = APP_DATA + 0x300;
pub(crate) const HEAPBASE: u64 = 0x100_0000;
pub(crate) const HEAP_BLOCKS: u64 = 64;
pub(crate) const STACK_USED: u64 = 128;

pub(crate) const INT: u64 = 1;
pub(crate) const NODE: u64 = 2;
pub(crate) const NODE_PTR: u64 = 3;
pub(crate) const LONG: u64 = 4;
pub(crate) const VOID_PTR: u64 = 5;

pub(crate) struct TestApp {
    pub mem: LocalMemory,
    pub heap: HeapBuilder,
}

fn object() -> ObjectInformation {
    let mut object = ObjectInformation::synthetic("app", AddressRange::with_size(APP_DATA, 0x1000));
    let types = &mut object.types;
    types.insert(Type::new(INT, "int", 4, TypeKind::Base));
    types.insert(Type::new(
        NODE,
        "node",
        16,
        TypeKind::Struct {
            members: vec![
                Member {
                    name: "value".into(),
                    offset: 0,
                    type_id: Some(INT),
                },
                Member {
                    name: "next".into(),
                    offset: 8,
                    type_id: Some(NODE_PTR),
                },
            ],
        },
    ));
    types.insert(Type::new(
        NODE_PTR,
        "",
        8,
        TypeKind::Pointer {
            target: Some(NODE),
            to_subroutine: false,
        },
    ));
    types.insert(Type::new(LONG, "long", 8, TypeKind::Base));
    types.insert(Type::new(
        VOID_PTR,
        "",
        8,
        TypeKind::Pointer {
            target: None,
            to_subroutine: false,
        },
    ));
    types.link();

    let global = |name: &str, type_id, address| Variable {
        name: name.into(),
        type_id: Some(type_id),
        address,
    };
    object.globals = vec![
        global("counter", INT, COUNTER),
        global("list", NODE_PTR, LIST),
        global("noise", LONG, NOISE),
        global("__sonde_heap_descriptor", VOID_PTR, HEAP_POINTER),
    ];
    object.subprograms = vec![Subprogram {
        name: "actor_main".into(),
        low_pc: 0x1000,
        high_pc: 0x1100,
        frame_base: FrameBase::Cfa,
        locals: vec![LocalVariable {
            name: "token".into(),
            type_id: Some(INT),
            frame_offset: -20,
        }],
    }];
    object
}

pub(crate) fn app() -> TestApp {
    let mut layout = ProcessLayout::new(vec![Arc::new(object())]);
    layout.heap_pointer = Some(HEAP_POINTER);
    let mut mem = LocalMemory::new(layout);
    mem.map(APP_DATA, 0x1000);
    mem.map(HEAPBASE, (HEAP_BLOCKS * BLOCKSIZE) as usize);
    let heap = HeapBuilder::format(&mut mem, DESCRIPTOR, HEAPBASE, HEAP_BLOCKS).expect("format");
    mem.write_u64(HEAP_POINTER, DESCRIPTOR).expect("heap pointer");
    TestApp { mem, heap }
}

impl TestApp {
    pub fn set_counter(&mut self, value: i32) {
        self.mem.write_i32(COUNTER, value).expect("counter");
    }

    pub fn counter(&self) -> i32 {
        self.mem.read_i32(COUNTER).expect("counter")
    }

    pub fn alloc_node(&mut self, value: i32) -> u64 {
        let node = self.heap.alloc(&mut self.mem, 16).expect("node");
        self.mem.write_i32(node, value).expect("value");
        self.mem.write_u64(node + 8, 0).expect("next");
        node
    }

    pub fn link(&mut self, node: u64, next: u64) {
        self.mem.write_u64(node + 8, next).expect("next");
    }

    pub fn set_list(&mut self, head: u64) {
        self.mem.write_u64(LIST, head).expect("list");
    }

    /// Prepends nodes so the list starts with `values` in order.
    pub fn push_list(&mut self, values: &[i32]) {
        for &value in values.iter().rev() {
            let head = self.mem.read_u64(LIST).expect("list");
            let node = self.alloc_node(value);
            self.link(node, head);
            self.set_list(node);
        }
    }

    /// One actor stack in the heap, stopped in `actor_main` with `token` set.
    pub fn add_stack(&mut self, token: i32) -> StackArea {
        let address = self.heap.alloc_blocks(&mut self.mem, 2 * BLOCKSIZE).expect("stack");
        let top = address + 2 * BLOCKSIZE;
        let rbp = top - 64;
        self.mem.write_u64(CONTEXT, 0x1010).expect("rip");
        self.mem.write_u64(CONTEXT + 8, top - STACK_USED).expect("rsp");
        self.mem.write_u64(CONTEXT + 16, rbp).expect("rbp");
        self.mem.write_i32(rbp + 16 - 20, token).expect("token");
        let block = self
            .heap
            .descriptor()
            .block_of(address)
            .expect("in the heap");
        let area = StackArea {
            address,
            context: CONTEXT,
            size: 2 * BLOCKSIZE,
            block,
        };
        self.mem.layout_mut().add_stack_area(area);
        area
    }
}
