//! Compiled functions and their runtime closures.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use super::LuaValue;

/// A constant pool entry. Restricted to the handful of types a `.luac`
/// constant table can hold — unlike `LuaValue`, there is no table or
/// function variant here.
#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(super::lua_string::LuaString),
}

impl Constant {
    pub fn to_value(&self) -> LuaValue {
        match self {
            Constant::Nil => LuaValue::Nil,
            Constant::Bool(b) => LuaValue::Bool(*b),
            Constant::Int(i) => LuaValue::Int(*i),
            Constant::Float(f) => LuaValue::Float(*f),
            Constant::Str(s) => LuaValue::Str(s.clone()),
        }
    }
}

/// Describes where an upvalue of a nested function is captured from, in
/// the enclosing function's frame: either one of the enclosing
/// function's own locals (`in_stack = true`, `index` a register), or one
/// of the enclosing function's own upvalues (`in_stack = false`, `index`
/// an upvalue slot).
#[derive(Debug, Clone, Copy)]
pub struct UpvalDesc {
    pub in_stack: bool,
    pub index: u32,
    /// Debug-info name, used only for error messages/introspection.
    pub name: Option<&'static str>,
}

/// A compiled function: bytecode plus everything needed to interpret it.
/// Shared via `Rc` since the same prototype backs every closure created
/// from a given `CLOSURE` instruction.
#[derive(Debug)]
pub struct Prototype {
    pub num_params: u8,
    pub is_vararg: bool,
    pub max_stack_size: u8,
    pub code: Vec<u32>,
    pub constants: Vec<Constant>,
    pub upvalues: Vec<UpvalDesc>,
    pub protos: Vec<Rc<Prototype>>,
    /// Source line for each instruction in `code`, 1:1, for error
    /// messages and tracebacks.
    pub line_info: Vec<u32>,
    pub source: String,
    pub line_defined: u32,
    pub last_line_defined: u32,
    /// Human-readable local variable names, for debug/error messages
    /// only — never consulted for semantics.
    pub local_names: Vec<String>,
}

/// An upvalue cell. While the enclosing frame that created it is still
/// live, it points at a live stack register (`Open`); once that frame
/// returns, the value is copied out and the upvalue becomes `Closed`,
/// so shared closures keep seeing the same value independent of the
/// stack's lifetime.
#[derive(Debug)]
pub enum Upvalue {
    Open(usize),
    Closed(LuaValue),
}

pub type UpvalueRef = Rc<RefCell<Upvalue>>;

/// A closure: a prototype plus its captured upvalues.
#[derive(Debug)]
pub struct LuaClosure {
    pub proto: Rc<Prototype>,
    pub upvalues: Vec<UpvalueRef>,
}

/// A builtin implemented in Rust. Takes the arguments passed to it and
/// returns its results, or a runtime error that `pcall` can catch.
pub type NativeFn = dyn Fn(&mut crate::vm::LuaVM, Vec<LuaValue>) -> Result<Vec<LuaValue>, crate::error::LuaError>;

pub struct NativeFunction {
    pub name: &'static str,
    pub func: Box<NativeFn>,
}

impl fmt::Debug for NativeFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NativeFunction({})", self.name)
    }
}

impl NativeFunction {
    pub fn new(
        name: &'static str,
        func: impl Fn(&mut crate::vm::LuaVM, Vec<LuaValue>) -> Result<Vec<LuaValue>, crate::error::LuaError>
            + 'static,
    ) -> Self {
        NativeFunction {
            name,
            func: Box::new(func),
        }
    }
}
