//! Dynamic, type-erased struct field access over target memory (spec.md
//! §9's "Dynamic struct generation over debug info").
//!
//! The symbol-resolution subsystem that would normally produce these
//! layouts from DWARF or a JSON debug dump is out of scope; this module
//! only specifies the layout representation and the read/write dispatch
//! a populated registry makes possible. Nothing in [`crate::backend`] or
//! [`crate::callback`] depends on this module — it's an optional layer
//! [`crate::target::Target`] exposes on top of the core.

use std::collections::HashMap;
use std::sync::Arc;

use crate::backend::Backend;
use crate::error::{Result, RspError};

/// The shape of one struct field. No runtime code generation: a
/// `Struct` resolves a field name to one of these tags and dispatches to
/// plain reads/writes/masking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldType {
    /// A plain integer of `size` bytes (1, 2, 4, or 8).
    Base { size: u32 },
    /// A nested struct, by layout name. Not directly readable as an
    /// integer; fetch its base address and wrap it in a new `Struct`.
    Struct { name: String },
    /// A fixed-length array of `count` elements of `elem_size` bytes each.
    Array { elem_size: u32, count: u32 },
    /// A sub-range of a `base_size`-byte integer: `len` bits starting at
    /// bit `pos` (LSB 0).
    Bitfield { base_size: u32, pos: u32, len: u32 },
    /// A field whose type the layout source couldn't resolve.
    Unknown,
}

#[derive(Debug, Clone)]
pub struct FieldLayout {
    pub name: String,
    pub offset: u32,
    pub ty: FieldType,
}

/// The field layout of one struct type, keyed by name at registration.
#[derive(Debug, Clone, Default)]
pub struct StructLayout {
    pub name: String,
    pub size: u32,
    pub fields: Vec<FieldLayout>,
}

impl StructLayout {
    pub fn field(&self, name: &str) -> Option<&FieldLayout> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// Layouts registered by name, populated externally (e.g. by the
/// out-of-scope symbols subsystem) and consulted by [`Struct`].
#[derive(Debug, Clone, Default)]
pub struct StructLayoutRegistry {
    layouts: HashMap<String, Arc<StructLayout>>,
}

impl StructLayoutRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, layout: StructLayout) {
        self.layouts.insert(layout.name.clone(), Arc::new(layout));
    }

    pub fn get(&self, name: &str) -> Option<Arc<StructLayout>> {
        self.layouts.get(name).cloned()
    }
}

/// A struct value at a known address, ready to have its fields read or
/// written through a [`Backend`].
pub struct Struct {
    base_addr: u64,
    layout: Arc<StructLayout>,
}

impl Struct {
    pub fn new(base_addr: u64, layout: Arc<StructLayout>) -> Self {
        Struct { base_addr, layout }
    }

    pub fn base_addr(&self) -> u64 {
        self.base_addr
    }

    pub fn layout(&self) -> &StructLayout {
        &self.layout
    }

    /// The address of `field_name` within this struct instance.
    pub fn field_addr(&self, field_name: &str) -> Result<u64> {
        let field = self.lookup(field_name)?;
        Ok(self.base_addr + field.offset as u64)
    }

    /// The address of element `index` of an `Array` field.
    pub fn array_elem_addr(&self, field_name: &str, index: u32) -> Result<u64> {
        let field = self.lookup(field_name)?;
        match field.ty {
            FieldType::Array { elem_size, count } if index < count => {
                Ok(self.base_addr + field.offset as u64 + (index * elem_size) as u64)
            }
            FieldType::Array { count, .. } => Err(RspError::UnexpectedReply {
                context: "array_elem_addr",
                reply: format!("index {index} out of bounds for array of {count}"),
            }),
            _ => Err(RspError::UnexpectedReply {
                context: "array_elem_addr",
                reply: format!("field '{field_name}' is not an array"),
            }),
        }
    }

    /// Read `field_name` as an integer. `Bitfield`s are masked and
    /// shifted into place; `Base` fields are read at their native width.
    pub fn read_field(&self, backend: &dyn Backend, field_name: &str) -> Result<u64> {
        let field = self.lookup(field_name)?;
        let addr = self.base_addr + field.offset as u64;
        match field.ty {
            FieldType::Base { size } => read_sized(backend, addr, size),
            FieldType::Bitfield { base_size, pos, len } => {
                let raw = read_sized(backend, addr, base_size)?;
                Ok((raw >> pos) & bit_mask(len))
            }
            _ => Err(unreadable(field_name)),
        }
    }

    /// Write `val` into `field_name`. `Bitfield` writes read-modify-write
    /// the underlying `base_size` word so neighboring bits are preserved.
    pub fn write_field(&self, backend: &dyn Backend, field_name: &str, val: u64) -> Result<()> {
        let field = self.lookup(field_name)?;
        let addr = self.base_addr + field.offset as u64;
        match field.ty {
            FieldType::Base { size } => write_sized(backend, addr, val, size),
            FieldType::Bitfield { base_size, pos, len } => {
                let mask = bit_mask(len);
                let raw = read_sized(backend, addr, base_size)?;
                let merged = (raw & !(mask << pos)) | ((val & mask) << pos);
                write_sized(backend, addr, merged, base_size)
            }
            _ => Err(unreadable(field_name)),
        }
    }

    fn lookup(&self, field_name: &str) -> Result<&FieldLayout> {
        self.layout.field(field_name).ok_or_else(|| RspError::UnexpectedReply {
            context: "struct field lookup",
            reply: format!("no field '{field_name}' in struct '{}'", self.layout.name),
        })
    }
}

fn bit_mask(len: u32) -> u64 {
    if len >= 64 {
        u64::MAX
    } else {
        (1u64 << len) - 1
    }
}

fn unreadable(field_name: &str) -> RspError {
    RspError::UnexpectedReply {
        context: "read_field",
        reply: format!("field '{field_name}' is not a plain integer or bitfield"),
    }
}

fn read_sized(backend: &dyn Backend, addr: u64, size: u32) -> Result<u64> {
    match size {
        1 => backend.read_uint8(addr).map(|v| v as u64),
        2 => backend.read_uint16(addr).map(|v| v as u64),
        4 => backend.read_uint32(addr).map(|v| v as u64),
        8 => backend.read_uint64(addr),
        _ => Err(RspError::UnexpectedReply {
            context: "struct field size",
            reply: format!("unsupported field size {size}"),
        }),
    }
}

fn write_sized(backend: &dyn Backend, addr: u64, val: u64, size: u32) -> Result<()> {
    match size {
        1 => backend.write_uint8(addr, val as u8),
        2 => backend.write_uint16(addr, val as u16),
        4 => backend.write_uint32(addr, val as u32),
        8 => backend.write_uint64(addr, val),
        _ => Err(RspError::UnexpectedReply {
            context: "struct field size",
            reply: format!("unsupported field size {size}"),
        }),
    }
}
