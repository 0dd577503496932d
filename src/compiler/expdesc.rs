//! Expression descriptors: the compiler's intermediate representation for
//! a not-yet-discharged expression, mirroring Lua's own `expdesc` (spec
//! §4.3 "Expression lowering").
//!
//! Unlike the reference compiler's fully lazy/relocatable scheme, these
//! are discharged eagerly once an operation actually needs the value in
//! a register — see `compiler/mod.rs`'s `to_*` helpers. That trades a
//! few extra `MOVE`s for a much simpler implementation while preserving
//! every observable semantic (RK operands, short-circuit jumps, multret
//! propagation).

use crate::value::LuaString;

/// A table/global access that hasn't been read or written yet: `table`
/// indexed by `key`. Kept lazy so assignment targets can resolve the
/// table+key once and reuse it for either a `GETTABLE`/`GETTABUP` (read)
/// or `SETTABLE`/`SETTABUP` (write).
#[derive(Debug, Clone)]
pub struct Indexed {
    pub table: Box<ExpDesc>,
    pub key: Box<ExpDesc>,
}

#[derive(Debug, Clone)]
pub enum ExpDesc {
    Nil,
    True,
    False,
    Int(i64),
    Float(f64),
    Str(LuaString),
    /// Already sitting in a register: a local variable's own slot, or a
    /// temporary a prior operation wrote into.
    Local(u8),
    Reg(u8),
    Upvalue(u8),
    /// An unresolved name that turned out to be neither a local nor an
    /// upvalue: a global, read/written through the `_ENV` upvalue.
    Global(String),
    Indexed(Indexed),
    /// The `A` register of an open `CALL`/`METHODCALL`, already fixed to
    /// return exactly one result.
    Call(u8),
    /// The `A` register of an open `VARARG`, already fixed to exactly one
    /// result.
    Vararg(u8),
}

impl ExpDesc {
    pub fn indexed(table: ExpDesc, key: ExpDesc) -> ExpDesc {
        ExpDesc::Indexed(Indexed {
            table: Box::new(table),
            key: Box::new(key),
        })
    }
}
