//! Types, variables and functions of one loaded object, read from its DWARF.
//!
//! Only what state comparison needs survives the load: a closed [`TypeKind`]
//! per type, globals with their runtime address, and functions with the
//! frame-relative locals they declare.

use crate::RemoteError;
use crate::maps::ObjectLocation;
use addr2line::gimli;
use object::{Object, ObjectKind, ObjectSection, ObjectSymbol};
use sonde_types::AddressRange;
use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

pub type TypeId = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub name: String,
    pub offset: u64,
    pub type_id: Option<TypeId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeKind {
    Base,
    Enum,
    Pointer {
        target: Option<TypeId>,
        to_subroutine: bool,
    },
    Struct {
        members: Vec<Member>,
    },
    Union {
        members: Vec<Member>,
    },
    Array {
        element: Option<TypeId>,
        count: u64,
    },
    /// typedef, const, volatile, restrict.
    Alias {
        target: Option<TypeId>,
    },
    Subroutine,
    Unspecified,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Type {
    pub id: TypeId,
    pub name: String,
    pub byte_size: u64,
    /// Concrete type behind aliases and forward declarations.
    pub full_type: Option<TypeId>,
    pub kind: TypeKind,
}

impl Type {
    pub fn new(id: TypeId, name: impl Into<String>, byte_size: u64, kind: TypeKind) -> Self {
        Self {
            id,
            name: name.into(),
            byte_size,
            full_type: None,
            kind,
        }
    }

    pub fn members(&self) -> &[Member] {
        match &self.kind {
            TypeKind::Struct { members } | TypeKind::Union { members } => members,
            _ => &[],
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TypeTable {
    types: HashMap<TypeId, Type>,
}

impl TypeTable {
    pub fn insert(&mut self, ty: Type) {
        self.types.insert(ty.id, ty);
    }

    pub fn get(&self, id: TypeId) -> Option<&Type> {
        self.types.get(&id)
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// The concrete type, with aliases and declarations looked through.
    pub fn resolve(&self, id: TypeId) -> Option<&Type> {
        let ty = self.get(id)?;
        match ty.full_type {
            Some(full) => self.get(full),
            None => Some(ty),
        }
    }

    /// Computes `full_type`, pointer-to-function flags and missing array sizes.
    pub fn link(&mut self) {
        let mut complete_by_name: HashMap<String, TypeId> = HashMap::new();
        for ty in self.types.values() {
            if ty.byte_size > 0
                && !ty.name.is_empty()
                && matches!(ty.kind, TypeKind::Struct { .. } | TypeKind::Union { .. })
            {
                complete_by_name.insert(ty.name.clone(), ty.id);
            }
        }

        let ids: Vec<TypeId> = self.types.keys().copied().collect();
        let mut full_types = Vec::with_capacity(ids.len());
        for &id in &ids {
            let mut current = id;
            for _ in 0..64 {
                match self.types.get(&current).map(|t| &t.kind) {
                    Some(TypeKind::Alias {
                        target: Some(target),
                    }) => current = *target,
                    _ => break,
                }
            }
            if let Some(ty) = self.types.get(&current)
                && ty.byte_size == 0
                && !ty.name.is_empty()
                && let Some(&complete) = complete_by_name.get(&ty.name)
            {
                current = complete;
            }
            full_types.push((id, current));
        }
        for (id, full) in full_types {
            if let Some(ty) = self.types.get_mut(&id) {
                ty.full_type = Some(full);
            }
        }

        let mut updates = Vec::new();
        for &id in &ids {
            let Some(ty) = self.types.get(&id) else {
                continue;
            };
            match &ty.kind {
                TypeKind::Pointer {
                    target: Some(target),
                    ..
                } => {
                    let to_subroutine = matches!(
                        self.resolve(*target).map(|t| &t.kind),
                        Some(TypeKind::Subroutine)
                    );
                    updates.push((id, None, Some(to_subroutine)));
                }
                TypeKind::Array {
                    element: Some(element),
                    count,
                } if ty.byte_size == 0 => {
                    let size = self.resolve(*element).map(|t| t.byte_size).unwrap_or(0) * count;
                    updates.push((id, Some(size), None));
                }
                TypeKind::Alias { .. } if ty.byte_size == 0 => {
                    let size = self.resolve(id).map(|t| t.byte_size).unwrap_or(0);
                    updates.push((id, Some(size), None));
                }
                _ => {}
            }
        }
        for (id, size, to_sub) in updates {
            if let Some(ty) = self.types.get_mut(&id) {
                if let Some(size) = size {
                    ty.byte_size = size;
                }
                if let (Some(flag), TypeKind::Pointer { to_subroutine, .. }) = (to_sub, &mut ty.kind) {
                    *to_subroutine = flag;
                }
            }
        }
    }
}

/// A global variable at a fixed runtime address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Variable {
    pub name: String,
    pub type_id: Option<TypeId>,
    pub address: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameBase {
    /// `DW_OP_call_frame_cfa`: the caller's stack pointer, rbp + 16 with frame pointers.
    Cfa,
    /// `DW_OP_reg6` / `DW_OP_breg6`.
    Rbp,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalVariable {
    pub name: String,
    pub type_id: Option<TypeId>,
    pub frame_offset: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subprogram {
    pub name: String,
    pub low_pc: u64,
    pub high_pc: u64,
    pub frame_base: FrameBase,
    pub locals: Vec<LocalVariable>,
}

impl Subprogram {
    pub fn contains(&self, ip: u64) -> bool {
        ip >= self.low_pc && ip < self.high_pc
    }

    /// Address the locals are relative to, given the frame's saved rbp.
    pub fn frame_base_address(&self, rbp: u64) -> u64 {
        match self.frame_base {
            FrameBase::Rbp => rbp,
            FrameBase::Cfa | FrameBase::Unknown => rbp.wrapping_add(16),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectInformation {
    pub path: String,
    pub is_executable: bool,
    pub text: Option<AddressRange>,
    /// Writable data segment, `.data` and `.bss`.
    pub rw: Option<AddressRange>,
    pub globals: Vec<Variable>,
    /// Sorted by `low_pc`.
    pub subprograms: Vec<Subprogram>,
    pub types: TypeTable,
    /// Defined ELF data symbols, relocated.
    pub symbols: BTreeMap<String, u64>,
}

impl ObjectInformation {
    /// Object without debug information; used for in-process address spaces.
    pub fn synthetic(path: impl Into<String>, rw: AddressRange) -> Self {
        Self {
            path: path.into(),
            is_executable: true,
            rw: Some(rw),
            ..Self::default()
        }
    }

    pub fn find_global(&self, name: &str) -> Option<&Variable> {
        self.globals.iter().find(|v| v.name == name)
    }

    pub fn global_at(&self, address: u64) -> Option<&Variable> {
        self.globals.iter().find(|v| {
            let size = v
                .type_id
                .and_then(|t| self.types.resolve(t))
                .map(|t| t.byte_size)
                .unwrap_or(1)
                .max(1);
            address >= v.address && address < v.address + size
        })
    }

    pub fn find_subprogram(&self, ip: u64) -> Option<usize> {
        let idx = self.subprograms.partition_point(|s| s.low_pc <= ip);
        let candidate = idx.checked_sub(1)?;
        self.subprograms[candidate].contains(ip).then_some(candidate)
    }

    pub fn contains_code(&self, ip: u64) -> bool {
        self.text.is_some_and(|t| t.contains(ip))
    }

    /// Loads the DWARF and symbol table of the file behind `location`.
    pub fn load(location: &ObjectLocation) -> Result<Self, RemoteError> {
        let err = |reason: String| RemoteError::DebugInfo {
            path: location.path.clone(),
            reason,
        };
        let data = std::fs::read(&location.path).map_err(|e| err(e.to_string()))?;
        let file = object::File::parse(&*data).map_err(|e| err(e.to_string()))?;
        let bias = match file.kind() {
            ObjectKind::Dynamic => location.base,
            _ => 0,
        };

        let mut info = Self {
            path: location.path.clone(),
            is_executable: location.is_executable,
            text: location.text,
            rw: location.rw,
            ..Self::default()
        };

        for symbol in file.symbols().chain(file.dynamic_symbols()) {
            if symbol.is_undefined() || symbol.kind() != object::SymbolKind::Data {
                continue;
            }
            if let Ok(name) = symbol.name()
                && !name.is_empty()
            {
                info.symbols
                    .insert(name.to_string(), symbol.address().wrapping_add(bias));
            }
        }

        let endian = if file.is_little_endian() {
            gimli::RunTimeEndian::Little
        } else {
            gimli::RunTimeEndian::Big
        };
        let sections = gimli::DwarfSections::load(|id| load_section(&file, id))
            .map_err(|e| err(e.to_string()))?;
        let dwarf = sections.borrow(|section| gimli::EndianSlice::new(section, endian));

        let mut loader = DwarfLoader {
            info: &mut info,
            bias,
        };
        loader.load(&dwarf).map_err(|e| err(e.to_string()))?;

        info.subprograms.sort_by_key(|s| s.low_pc);
        info.types.link();
        debug!(
            path = %info.path,
            globals = info.globals.len(),
            subprograms = info.subprograms.len(),
            types = info.types.len(),
            "loaded debug information"
        );
        Ok(info)
    }
}

fn load_section<'data>(
    file: &object::File<'data>,
    id: gimli::SectionId,
) -> Result<Cow<'data, [u8]>, gimli::Error> {
    Ok(match file.section_by_name(id.name()) {
        Some(section) => section.uncompressed_data().unwrap_or(Cow::Borrowed(&[])),
        None => Cow::Borrowed(&[]),
    })
}

type Slice<'a> = gimli::EndianSlice<'a, gimli::RunTimeEndian>;

enum Scope {
    Type(TypeId),
    Subprogram(usize),
    Other,
}

struct DwarfLoader<'i> {
    info: &'i mut ObjectInformation,
    bias: u64,
}

impl DwarfLoader<'_> {
    fn load(&mut self, dwarf: &gimli::Dwarf<Slice<'_>>) -> Result<(), gimli::Error> {
        let mut units = dwarf.units();
        while let Some(header) = units.next()? {
            let unit = dwarf.unit(header)?;
            self.load_unit(dwarf, &unit)?;
        }
        Ok(())
    }

    fn load_unit(
        &mut self,
        dwarf: &gimli::Dwarf<Slice<'_>>,
        unit: &gimli::Unit<Slice<'_>>,
    ) -> Result<(), gimli::Error> {
        let mut cursor = unit.entries();
        let mut depth: isize = 0;
        let mut scopes: Vec<(isize, Scope)> = Vec::new();

        while let Some((delta, entry)) = cursor.next_dfs()? {
            depth += delta;
            while scopes.last().is_some_and(|(d, _)| *d >= depth) {
                scopes.pop();
            }

            let Some(id) = entry
                .offset()
                .to_debug_info_offset(&unit.header)
                .map(|o| o.0 as u64)
            else {
                continue;
            };
            let name = match entry.attr_value(gimli::DW_AT_name)? {
                Some(value) => dwarf
                    .attr_string(unit, value)
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                None => String::new(),
            };
            let type_ref = type_reference(unit, entry.attr_value(gimli::DW_AT_type)?);
            let byte_size = entry
                .attr_value(gimli::DW_AT_byte_size)?
                .and_then(|v| v.udata_value())
                .unwrap_or(0);

            let scope = match entry.tag() {
                gimli::DW_TAG_base_type => {
                    self.info
                        .types
                        .insert(Type::new(id, name, byte_size, TypeKind::Base));
                    Scope::Other
                }
                gimli::DW_TAG_enumeration_type => {
                    self.info
                        .types
                        .insert(Type::new(id, name, byte_size, TypeKind::Enum));
                    Scope::Other
                }
                gimli::DW_TAG_pointer_type
                | gimli::DW_TAG_reference_type
                | gimli::DW_TAG_rvalue_reference_type => {
                    let size = if byte_size == 0 { 8 } else { byte_size };
                    self.info.types.insert(Type::new(
                        id,
                        name,
                        size,
                        TypeKind::Pointer {
                            target: type_ref,
                            to_subroutine: false,
                        },
                    ));
                    Scope::Other
                }
                gimli::DW_TAG_structure_type | gimli::DW_TAG_class_type => {
                    self.info.types.insert(Type::new(
                        id,
                        name,
                        byte_size,
                        TypeKind::Struct {
                            members: Vec::new(),
                        },
                    ));
                    Scope::Type(id)
                }
                gimli::DW_TAG_union_type => {
                    self.info.types.insert(Type::new(
                        id,
                        name,
                        byte_size,
                        TypeKind::Union {
                            members: Vec::new(),
                        },
                    ));
                    Scope::Type(id)
                }
                gimli::DW_TAG_array_type => {
                    self.info.types.insert(Type::new(
                        id,
                        name,
                        byte_size,
                        TypeKind::Array {
                            element: type_ref,
                            count: 0,
                        },
                    ));
                    Scope::Type(id)
                }
                gimli::DW_TAG_subrange_type => {
                    let count = match entry.attr_value(gimli::DW_AT_count)? {
                        Some(value) => value.udata_value().unwrap_or(0),
                        None => entry
                            .attr_value(gimli::DW_AT_upper_bound)?
                            .and_then(|v| v.udata_value())
                            .map(|upper| upper + 1)
                            .unwrap_or(0),
                    };
                    if let Some(array) = self.enclosing_type(&scopes)
                        && let Some(ty) = self.info.types.types.get_mut(&array)
                        && let TypeKind::Array { count: total, .. } = &mut ty.kind
                    {
                        *total = if *total == 0 { count } else { *total * count };
                    }
                    Scope::Other
                }
                gimli::DW_TAG_typedef
                | gimli::DW_TAG_const_type
                | gimli::DW_TAG_volatile_type
                | gimli::DW_TAG_restrict_type => {
                    self.info.types.insert(Type::new(
                        id,
                        name,
                        byte_size,
                        TypeKind::Alias { target: type_ref },
                    ));
                    Scope::Other
                }
                gimli::DW_TAG_subroutine_type => {
                    self.info
                        .types
                        .insert(Type::new(id, name, 0, TypeKind::Subroutine));
                    Scope::Other
                }
                gimli::DW_TAG_unspecified_type => {
                    self.info
                        .types
                        .insert(Type::new(id, name, 0, TypeKind::Unspecified));
                    Scope::Other
                }
                gimli::DW_TAG_member => {
                    let offset = entry
                        .attr_value(gimli::DW_AT_data_member_location)?
                        .and_then(|v| v.udata_value())
                        .unwrap_or(0);
                    if let Some(parent) = self.enclosing_type(&scopes)
                        && let Some(ty) = self.info.types.types.get_mut(&parent)
                        && let TypeKind::Struct { members } | TypeKind::Union { members } =
                            &mut ty.kind
                    {
                        members.push(Member {
                            name,
                            offset,
                            type_id: type_ref,
                        });
                    }
                    Scope::Other
                }
                gimli::DW_TAG_subprogram => {
                    let low_pc = match entry.attr_value(gimli::DW_AT_low_pc)? {
                        Some(value) => dwarf.attr_address(unit, value)?,
                        None => None,
                    };
                    match low_pc {
                        Some(low) => {
                            let high = match entry.attr_value(gimli::DW_AT_high_pc)? {
                                Some(gimli::AttributeValue::Udata(len)) => Some(low + len),
                                Some(value) => dwarf.attr_address(unit, value)?,
                                None => None,
                            }
                            .unwrap_or(low);
                            let frame_base = match entry.attr_value(gimli::DW_AT_frame_base)? {
                                Some(gimli::AttributeValue::Exprloc(expr)) => {
                                    let mut ops = expr.operations(unit.encoding());
                                    match ops.next()? {
                                        Some(gimli::Operation::CallFrameCFA) => FrameBase::Cfa,
                                        Some(gimli::Operation::Register { register })
                                        | Some(gimli::Operation::RegisterOffset {
                                            register, ..
                                        }) if register.0 == 6 => FrameBase::Rbp,
                                        _ => FrameBase::Unknown,
                                    }
                                }
                                _ => FrameBase::Unknown,
                            };
                            self.info.subprograms.push(Subprogram {
                                name,
                                low_pc: low.wrapping_add(self.bias),
                                high_pc: high.wrapping_add(self.bias),
                                frame_base,
                                locals: Vec::new(),
                            });
                            Scope::Subprogram(self.info.subprograms.len() - 1)
                        }
                        None => Scope::Other,
                    }
                }
                gimli::DW_TAG_variable | gimli::DW_TAG_formal_parameter => {
                    if let Some(gimli::AttributeValue::Exprloc(expr)) =
                        entry.attr_value(gimli::DW_AT_location)?
                    {
                        let mut ops = expr.operations(unit.encoding());
                        let function = scopes.iter().rev().find_map(|(_, s)| match s {
                            Scope::Subprogram(index) => Some(*index),
                            _ => None,
                        });
                        match (ops.next()?, function) {
                            (Some(gimli::Operation::Address { address }), _) => {
                                self.info.globals.push(Variable {
                                    name,
                                    type_id: type_ref,
                                    address: address.wrapping_add(self.bias),
                                });
                            }
                            (Some(gimli::Operation::FrameOffset { offset }), Some(index)) => {
                                self.info.subprograms[index].locals.push(LocalVariable {
                                    name,
                                    type_id: type_ref,
                                    frame_offset: offset,
                                });
                            }
                            _ => {}
                        }
                    }
                    Scope::Other
                }
                _ => Scope::Other,
            };

            if entry.has_children() {
                scopes.push((depth, scope));
            }
        }
        Ok(())
    }

    fn enclosing_type(&self, scopes: &[(isize, Scope)]) -> Option<TypeId> {
        match scopes.last() {
            Some((_, Scope::Type(id))) => Some(*id),
            _ => None,
        }
    }
}

fn type_reference(
    unit: &gimli::Unit<Slice<'_>>,
    value: Option<gimli::AttributeValue<Slice<'_>>>,
) -> Option<TypeId> {
    match value? {
        gimli::AttributeValue::UnitRef(offset) => offset
            .to_debug_info_offset(&unit.header)
            .map(|o| o.0 as u64),
        gimli::AttributeValue::DebugInfoRef(offset) => Some(offset.0 as u64),
        _ => None,
    }
}
