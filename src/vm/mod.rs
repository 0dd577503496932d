//! Register-based bytecode interpreter: the call-frame stack,
//! the fetch/dispatch loop over `OpCode`, metamethod lookup/dispatch, and
//! the `pcall` unwinding boundary. `arith` and `opcode` hold the
//! value-level primitives and instruction encoding this loop drives.

pub mod arith;
pub mod opcode;

use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;

use ahash::AHashMap;
use log::trace;

use crate::error::{LuaError, LuaResult, RuntimeError};
use crate::limits;
use crate::value::{
    lua_raw_eq, ClosureRef, Constant, LuaClosure, LuaString, LuaTable, LuaValue, NativeFunction,
    NativeRef, Prototype, TableRef, Upvalue, UpvalueRef,
};
use opcode::{Instruction, OpCode};

/// How many results the caller of a pushed frame is expecting back,
/// taken from the `CALL`'s `C` operand.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Want {
    Fixed(usize),
    All,
}

/// A call-stack record. `base` is an absolute index into
/// `LuaVM::registers`, not a pointer, so growing the register file
/// never invalidates a live frame.
struct Frame {
    closure: ClosureRef,
    base: usize,
    pc: usize,
    /// Extra arguments beyond `proto.num_params`, for a vararg function's
    /// `...`. Captured once at call time.
    varargs: Vec<LuaValue>,
    want: Want,
}

/// Where a newly pushed frame's arguments live: already materialized in
/// the caller's registers (the common `CALL` path, reused in place with
/// no copy) or a fresh owned list (calls originating from Rust — a
/// metamethod, `pcall`, or the top-level `execute`).
enum ArgsSource {
    InPlace(usize, usize),
    Owned(Vec<LuaValue>),
}

enum PopOutcome {
    Done(Vec<LuaValue>),
    Continue,
}

/// The virtual machine: one linear, growable register file shared by
/// every frame, the global environment, and the open-upvalue list. Not
/// `Send`/`Sync` — Lua values are `Rc`-based and the VM is single-threaded.
pub struct LuaVM {
    registers: Vec<LuaValue>,
    frames: Vec<Frame>,
    top: usize,
    /// Open upvalues, keyed by absolute register index. Scanned linearly
    /// on close; call depth keeps this small in practice.
    open_upvalues: Vec<(usize, UpvalueRef)>,
    pub globals: TableRef,
    strings: RefCell<AHashMap<Box<[u8]>, LuaString>>,
    out: Rc<RefCell<dyn Write>>,
}

impl LuaVM {
    pub fn new() -> Self {
        LuaVM {
            registers: vec![LuaValue::Nil; limits::BASIC_STACK_SIZE],
            frames: Vec::new(),
            top: 0,
            open_upvalues: Vec::new(),
            globals: Rc::new(RefCell::new(LuaTable::new())),
            strings: RefCell::new(AHashMap::new()),
            out: Rc::new(RefCell::new(std::io::stdout())),
        }
    }

    /// Redirects `print`'s output sink, e.g. to capture it in a test.
    pub fn set_output(&mut self, out: Rc<RefCell<dyn Write>>) {
        self.out = out;
    }

    pub fn output(&self) -> Rc<RefCell<dyn Write>> {
        self.out.clone()
    }

    /// Registers the required builtin set into the global table (spec
    /// Registers the required builtin set into the global table.
    pub fn open_libs(&mut self) {
        crate::stdlib::install(self);
    }

    /// Interns a short string so repeated identical literals/keys share
    /// one allocation; strings longer than `LUAI_MAXSHORTLEN` are
    /// allocated fresh every time.
    pub fn intern(&self, bytes: Vec<u8>) -> LuaString {
        if bytes.len() > limits::LUAI_MAXSHORTLEN {
            return LuaString::new(bytes);
        }
        let mut table = self.strings.borrow_mut();
        if let Some(existing) = table.get(bytes.as_slice()) {
            return existing.clone();
        }
        let s = LuaString::new(bytes.clone());
        table.insert(bytes.into_boxed_slice(), s.clone());
        s
    }

    // ----- compiling / loading -----------------------------------------

    pub fn compile(&self, src: &[u8], chunk_name: &str) -> LuaResult<Rc<Prototype>> {
        crate::compiler::compile(src, chunk_name).map(Rc::new)
    }

    pub fn load_binary(&self, bytes: &[u8]) -> LuaResult<Rc<Prototype>> {
        crate::bytecode::load_bytes(bytes)
    }

    /// Wraps a top-level `Prototype` in the main closure, binding its
    /// single `_ENV` upvalue to this VM's global table.
    pub fn main_closure(&self, proto: Rc<Prototype>) -> ClosureRef {
        let env = Rc::new(RefCell::new(Upvalue::Closed(LuaValue::Table(self.globals.clone()))));
        Rc::new(LuaClosure { proto, upvalues: vec![env] })
    }

    /// Runs a compiled or loaded prototype as the program's main chunk.
    pub fn execute(&mut self, proto: Rc<Prototype>) -> LuaResult<Vec<LuaValue>> {
        let closure = self.main_closure(proto);
        let depth = self.frames.len();
        self.push_call_frame(closure, ArgsSource::Owned(Vec::new()), Want::All)?;
        match self.run_from(depth) {
            Ok(r) => Ok(r),
            Err(e) => {
                self.unwind_to(depth);
                Err(e)
            }
        }
    }

    // ----- calling values from Rust (metamethods, pcall, builtins) -----

    /// Calls any callable `LuaValue` (closure, native function, or a
    /// value whose metatable has `__call`) and collects every result.
    /// This is the one re-entrant path: it recurses into a fresh
    /// `run_from` rather than joining the flat dispatch loop, since it
    /// may be invoked mid-instruction (e.g. an arithmetic metamethod).
    pub fn call_value(&mut self, callee: LuaValue, mut args: Vec<LuaValue>) -> LuaResult<Vec<LuaValue>> {
        let mut callee = callee;
        let mut hops = 0usize;
        loop {
            match &callee {
                LuaValue::Function(c) => {
                    let closure = c.clone();
                    let depth = self.frames.len();
                    self.push_call_frame(closure, ArgsSource::Owned(args), Want::All)?;
                    return match self.run_from(depth) {
                        Ok(r) => Ok(r),
                        Err(e) => {
                            self.unwind_to(depth);
                            Err(e)
                        }
                    };
                }
                LuaValue::Native(n) => {
                    let native = n.clone();
                    return (native.func)(self, args);
                }
                other => {
                    let mm = self.get_metamethod(other, "__call");
                    match mm {
                        Some(f) if !matches!(f, LuaValue::Nil) => {
                            hops += 1;
                            if hops > limits::MAXTAGLOOP {
                                return Err(self.runtime_error("'__call' chain too long; possible loop"));
                            }
                            args.insert(0, callee.clone());
                            callee = f;
                        }
                        _ => {
                            return Err(self.runtime_error(format!("attempt to call a {} value", other.type_name())));
                        }
                    }
                }
            }
        }
    }

    /// Runs `f` with a `pcall` boundary: on a `RuntimeError`, unwinds the
    /// frames `call_value` pushed (closing their upvalues) and returns
    /// `(false, message-or-raised-value)`; on success, `(true, results…)`.
    pub fn protected_call(&mut self, f: LuaValue, args: Vec<LuaValue>) -> Vec<LuaValue> {
        match self.call_value(f, args) {
            Ok(mut results) => {
                let mut out = Vec::with_capacity(results.len() + 1);
                out.push(LuaValue::Bool(true));
                out.append(&mut results);
                out
            }
            Err(LuaError::Runtime(e)) => {
                let msg = e.value.unwrap_or_else(|| LuaValue::from_str(&e.message));
                vec![LuaValue::Bool(false), msg]
            }
            Err(other) => vec![LuaValue::Bool(false), LuaValue::from_str(&other.to_string())],
        }
    }

    // ----- register file -------------------------------------------------

    fn ensure_capacity(&mut self, n: usize) {
        if self.registers.len() < n {
            self.registers.resize(n, LuaValue::Nil);
        }
    }

    fn get_reg(&self, base: usize, n: u32) -> LuaValue {
        self.registers[base + n as usize].clone()
    }

    fn set_reg(&mut self, base: usize, n: u32, v: LuaValue) {
        self.registers[base + n as usize] = v;
    }

    fn get_rk(&self, base: usize, proto: &Prototype, rk: u32) -> LuaValue {
        if Instruction::is_k(rk) {
            proto.constants[Instruction::k_index(rk) as usize].to_value()
        } else {
            self.get_reg(base, rk)
        }
    }

    // ----- upvalues --------------------------------------------------

    fn find_or_open_upvalue(&mut self, abs_index: usize) -> UpvalueRef {
        if let Some((_, uv)) = self.open_upvalues.iter().find(|(i, _)| *i == abs_index) {
            return uv.clone();
        }
        let uv: UpvalueRef = Rc::new(RefCell::new(Upvalue::Open(abs_index)));
        self.open_upvalues.push((abs_index, uv.clone()));
        uv
    }

    /// Closes every open upvalue at or above `threshold` (an absolute
    /// register index), copying its current value into an owned cell.
    /// Called on `RETURN`, on a closing `JMP`, and while unwinding a
    /// `pcall` boundary.
    fn close_upvalues_from(&mut self, threshold: usize) {
        let mut i = 0;
        while i < self.open_upvalues.len() {
            if self.open_upvalues[i].0 >= threshold {
                let (idx, uv) = self.open_upvalues.remove(i);
                let val = self.registers[idx].clone();
                *uv.borrow_mut() = Upvalue::Closed(val);
            } else {
                i += 1;
            }
        }
    }

    fn read_upvalue(&self, uv: &UpvalueRef) -> LuaValue {
        match &*uv.borrow() {
            Upvalue::Open(idx) => self.registers[*idx].clone(),
            Upvalue::Closed(v) => v.clone(),
        }
    }

    fn write_upvalue(&mut self, uv: &UpvalueRef, v: LuaValue) {
        let idx = match &*uv.borrow() {
            Upvalue::Open(idx) => Some(*idx),
            Upvalue::Closed(_) => None,
        };
        match idx {
            Some(idx) => self.registers[idx] = v,
            None => *uv.borrow_mut() = Upvalue::Closed(v),
        }
    }

    // ----- errors / tracebacks -----------------------------------------

    /// Source position of the `level`-th live frame counting from the
    /// top (`level = 0` is the innermost, currently-running frame), used
    /// by both internal raises and the `error()` builtin's `level`
    /// argument.
    fn frame_location(&self, level_from_top: usize) -> Option<String> {
        let idx = self.frames.len().checked_sub(1 + level_from_top)?;
        let frame = &self.frames[idx];
        let line = frame.closure.proto.line_info.get(frame.pc.saturating_sub(1)).copied().unwrap_or(0);
        Some(format!("{}:{}: ", frame.closure.proto.source, line))
    }

    fn traceback(&self) -> Vec<String> {
        self.frames
            .iter()
            .rev()
            .map(|f| {
                let line = f.closure.proto.line_info.get(f.pc.saturating_sub(1)).copied().unwrap_or(0);
                format!("{}:{}: in function", f.closure.proto.source, line)
            })
            .collect()
    }

    /// Source position for the `error()` builtin's `level` argument;
    /// `level_from_top = 0` is the frame that called `error` itself.
    pub fn error_location(&self, level_from_top: usize) -> Option<String> {
        self.frame_location(level_from_top)
    }

    /// Lets builtins outside this module raise the same
    /// `source:line:`-prefixed `RuntimeError` the dispatch loop itself
    /// raises.
    pub fn make_runtime_error(&self, msg: &str) -> LuaError {
        self.runtime_error(msg)
    }

    /// Builds a `RuntimeError` prefixed with the current frame's
    /// `source:line:`, matching `luaG_runerror`.
    fn runtime_error(&self, msg: impl Into<String>) -> LuaError {
        let loc = self.frame_location(0).unwrap_or_default();
        LuaError::Runtime(RuntimeError {
            message: format!("{}{}", loc, msg.into()),
            traceback: self.traceback(),
            value: None,
        })
    }

    /// Pops every frame above `depth`, closing their upvalues, without
    /// writing results anywhere — used to recover the register/frame
    /// stack after an error crosses a `pcall` boundary.
    fn unwind_to(&mut self, depth: usize) {
        while self.frames.len() > depth {
            let frame = self.frames.pop().unwrap();
            self.close_upvalues_from(frame.base);
        }
    }

    // ----- metamethods ----------------------------------------------------

    fn metatable_of(&self, v: &LuaValue) -> Option<TableRef> {
        match v {
            LuaValue::Table(t) => t.borrow().metatable.clone(),
            _ => None,
        }
    }

    fn get_metamethod(&self, v: &LuaValue, event: &str) -> Option<LuaValue> {
        let mt = self.metatable_of(v)?;
        let m = mt.borrow().get_str(event);
        if matches!(m, LuaValue::Nil) {
            None
        } else {
            Some(m)
        }
    }

    fn try_metamethod_binop(&mut self, event: &str, a: &LuaValue, b: &LuaValue) -> LuaResult<Option<LuaValue>> {
        if let Some(mm) = self.get_metamethod(a, event) {
            return Ok(Some(self.call_single(mm, vec![a.clone(), b.clone()])?));
        }
        if let Some(mm) = self.get_metamethod(b, event) {
            return Ok(Some(self.call_single(mm, vec![a.clone(), b.clone()])?));
        }
        Ok(None)
    }

    /// Calls `f` and takes its first result (or `nil`), the convention
    /// every metamethod uses.
    fn call_single(&mut self, f: LuaValue, args: Vec<LuaValue>) -> LuaResult<LuaValue> {
        Ok(self.call_value(f, args)?.into_iter().next().unwrap_or(LuaValue::Nil))
    }

    // ----- indexing (GETTABLE/SETTABLE with __index/__newindex) -----

    fn index_get(&mut self, mut t: LuaValue, key: LuaValue) -> LuaResult<LuaValue> {
        for _ in 0..limits::MAXTAGLOOP {
            match &t {
                LuaValue::Table(tr) => {
                    let raw = tr.borrow().get(&key);
                    if !matches!(raw, LuaValue::Nil) {
                        return Ok(raw);
                    }
                    let mt = tr.borrow().metatable.clone();
                    let Some(mt) = mt else { return Ok(LuaValue::Nil) };
                    let handler = mt.borrow().get_str("__index");
                    match handler {
                        LuaValue::Nil => return Ok(LuaValue::Nil),
                        LuaValue::Function(_) | LuaValue::Native(_) => {
                            return self.call_single(handler, vec![t.clone(), key]);
                        }
                        other => t = other,
                    }
                }
                _ => {
                    if let Some(handler) = self.get_metamethod(&t, "__index") {
                        match handler {
                            LuaValue::Function(_) | LuaValue::Native(_) => {
                                return self.call_single(handler, vec![t.clone(), key]);
                            }
                            other => {
                                t = other;
                                continue;
                            }
                        }
                    }
                    return Err(self.runtime_error(format!("attempt to index a {} value", t.type_name())));
                }
            }
        }
        Err(self.runtime_error("'__index' chain too long; possible loop"))
    }

    fn index_set(&mut self, mut t: LuaValue, key: LuaValue, value: LuaValue) -> LuaResult<()> {
        for _ in 0..limits::MAXTAGLOOP {
            match &t {
                LuaValue::Table(tr) => {
                    let exists = !matches!(tr.borrow().get(&key), LuaValue::Nil);
                    let mt = tr.borrow().metatable.clone();
                    if exists || mt.is_none() {
                        return self.raw_set_checked(tr, key, value);
                    }
                    let mt = mt.unwrap();
                    let handler = mt.borrow().get_str("__newindex");
                    match handler {
                        LuaValue::Nil => return self.raw_set_checked(tr, key, value),
                        LuaValue::Function(_) | LuaValue::Native(_) => {
                            self.call_value(handler, vec![t.clone(), key, value])?;
                            return Ok(());
                        }
                        other => t = other,
                    }
                }
                _ => return Err(self.runtime_error(format!("attempt to index a {} value", t.type_name()))),
            }
        }
        Err(self.runtime_error("'__newindex' chain too long; possible loop"))
    }

    fn raw_set_checked(&self, tr: &TableRef, key: LuaValue, value: LuaValue) -> LuaResult<()> {
        if matches!(key, LuaValue::Nil) {
            return Err(self.runtime_error("table index is nil"));
        }
        if let LuaValue::Float(f) = key {
            if f.is_nan() {
                return Err(self.runtime_error("table index is NaN"));
            }
        }
        tr.borrow_mut().set(key, value);
        Ok(())
    }

    // ----- arithmetic / comparison / concat, with metamethod fallback -----

    fn do_arith(&mut self, op: OpCode, a: &LuaValue, b: &LuaValue) -> LuaResult<LuaValue> {
        let direct = match op {
            OpCode::Add => arith::add(a, b),
            OpCode::Sub => arith::sub(a, b),
            OpCode::Mul => arith::mul(a, b),
            OpCode::Div => arith::div(a, b),
            OpCode::Pow => arith::pow(a, b),
            _ => unreachable!("do_arith called with non-arithmetic opcode"),
        };
        if let Some(v) = direct {
            return Ok(v);
        }
        let event = arith_event(op);
        if let Some(v) = self.try_metamethod_binop(event, a, b)? {
            return Ok(v);
        }
        let bad = if a.coerce_to_number().is_none() { a } else { b };
        Err(self.runtime_error(format!("attempt to perform arithmetic on a {} value", bad.type_name())))
    }

    fn do_idiv(&mut self, a: &LuaValue, b: &LuaValue) -> LuaResult<LuaValue> {
        match arith::idiv(a, b) {
            Ok(Some(v)) => Ok(v),
            Ok(None) => {
                if let Some(v) = self.try_metamethod_binop("__idiv", a, b)? {
                    return Ok(v);
                }
                let bad = if a.coerce_to_number().is_none() { a } else { b };
                Err(self.runtime_error(format!("attempt to perform arithmetic on a {} value", bad.type_name())))
            }
            Err(msg) => Err(self.runtime_error(msg)),
        }
    }

    fn do_mod(&mut self, a: &LuaValue, b: &LuaValue) -> LuaResult<LuaValue> {
        match arith::modulo(a, b) {
            Ok(Some(v)) => Ok(v),
            Ok(None) => {
                if let Some(v) = self.try_metamethod_binop("__mod", a, b)? {
                    return Ok(v);
                }
                let bad = if a.coerce_to_number().is_none() { a } else { b };
                Err(self.runtime_error(format!("attempt to perform arithmetic on a {} value", bad.type_name())))
            }
            Err(msg) => Err(self.runtime_error(msg)),
        }
    }

    fn do_unm(&mut self, a: &LuaValue) -> LuaResult<LuaValue> {
        if let Some(v) = arith::unm(a) {
            return Ok(v);
        }
        if let Some(mm) = self.get_metamethod(a, "__unm") {
            return self.call_single(mm, vec![a.clone(), a.clone()]);
        }
        Err(self.runtime_error(format!("attempt to perform arithmetic on a {} value", a.type_name())))
    }

    fn do_bitwise(&mut self, op: OpCode, a: &LuaValue, b: &LuaValue) -> LuaResult<LuaValue> {
        let direct = match op {
            OpCode::BAnd => arith::band(a, b),
            OpCode::BOr => arith::bor(a, b),
            OpCode::BXor => arith::bxor(a, b),
            OpCode::Shl => arith::shl(a, b),
            OpCode::Shr => arith::shr(a, b),
            _ => unreachable!("do_bitwise called with non-bitwise opcode"),
        };
        match direct {
            Ok(v) => Ok(v),
            Err(arith::BitwiseError::NoIntegerRepresentation) => {
                Err(self.runtime_error("number has no integer representation"))
            }
            Err(arith::BitwiseError::NotNumbers) => {
                let event = arith_event(op);
                if let Some(v) = self.try_metamethod_binop(event, a, b)? {
                    return Ok(v);
                }
                let bad = if a.coerce_to_number().is_none() { a } else { b };
                Err(self.runtime_error(format!("attempt to perform bitwise operation on a {} value", bad.type_name())))
            }
        }
    }

    fn do_bnot(&mut self, a: &LuaValue) -> LuaResult<LuaValue> {
        match arith::bnot(a) {
            Ok(v) => Ok(v),
            Err(arith::BitwiseError::NoIntegerRepresentation) => {
                Err(self.runtime_error("number has no integer representation"))
            }
            Err(arith::BitwiseError::NotNumbers) => {
                if let Some(mm) = self.get_metamethod(a, "__bnot") {
                    return self.call_single(mm, vec![a.clone(), a.clone()]);
                }
                Err(self.runtime_error(format!("attempt to perform bitwise operation on a {} value", a.type_name())))
            }
        }
    }

    fn do_len(&mut self, v: &LuaValue) -> LuaResult<LuaValue> {
        if let Some(mm) = self.get_metamethod(v, "__len") {
            return self.call_single(mm, vec![v.clone()]);
        }
        match v {
            LuaValue::Str(s) => Ok(LuaValue::Int(s.len() as i64)),
            LuaValue::Table(t) => Ok(LuaValue::Int(t.borrow().length())),
            _ => Err(self.runtime_error(format!("attempt to get length of a {} value", v.type_name()))),
        }
    }

    fn concat_pair(&mut self, a: LuaValue, b: LuaValue) -> LuaResult<LuaValue> {
        if let (Some(mut ab), Some(bb)) = (arith::concat_bytes(&a), arith::concat_bytes(&b)) {
            ab.extend_from_slice(&bb);
            return Ok(LuaValue::Str(self.intern(ab)));
        }
        if let Some(v) = self.try_metamethod_binop("__concat", &a, &b)? {
            return Ok(v);
        }
        let bad = if arith::concat_bytes(&a).is_none() { &a } else { &b };
        Err(self.runtime_error(format!("attempt to concatenate a {} value", bad.type_name())))
    }

    fn do_concat(&mut self, values: &[LuaValue]) -> LuaResult<LuaValue> {
        let mut acc = values[values.len() - 1].clone();
        for v in values[..values.len() - 1].iter().rev() {
            acc = self.concat_pair(v.clone(), acc)?;
        }
        Ok(acc)
    }

    fn values_equal(&mut self, a: &LuaValue, b: &LuaValue) -> LuaResult<bool> {
        if lua_raw_eq(a, b) {
            return Ok(true);
        }
        if let (LuaValue::Table(_), LuaValue::Table(_)) = (a, b) {
            if let Some(v) = self.try_metamethod_binop("__eq", a, b)? {
                return Ok(v.is_truthy());
            }
        }
        Ok(false)
    }

    fn values_less_than(&mut self, a: &LuaValue, b: &LuaValue) -> LuaResult<bool> {
        if let Some(r) = arith::less_than(a, b) {
            return Ok(r);
        }
        if let Some(v) = self.try_metamethod_binop("__lt", a, b)? {
            return Ok(v.is_truthy());
        }
        Err(self.runtime_error(format!("attempt to compare two {} values", a.type_name())))
    }

    fn values_less_equal(&mut self, a: &LuaValue, b: &LuaValue) -> LuaResult<bool> {
        if let Some(r) = arith::less_equal(a, b) {
            return Ok(r);
        }
        if let Some(v) = self.try_metamethod_binop("__le", a, b)? {
            return Ok(v.is_truthy());
        }
        // Lua 5.3's documented fallback: `a <= b` is `not (b < a)` when no
        // `__le` is found (removed in 5.4, still reference behavior here).
        if let Some(v) = self.try_metamethod_binop("__lt", b, a)? {
            return Ok(!v.is_truthy());
        }
        Err(self.runtime_error(format!("attempt to compare two {} values", a.type_name())))
    }

    pub fn tostring(&mut self, v: &LuaValue) -> LuaResult<LuaString> {
        if let Some(mm) = self.get_metamethod(v, "__tostring") {
            return match self.call_single(mm, vec![v.clone()])? {
                LuaValue::Str(s) => Ok(s),
                other => Ok(self.intern(default_tostring(&other))),
            };
        }
        Ok(self.intern(default_tostring(v)))
    }

    // ----- frame push/pop -----------------------------------------------

    fn push_call_frame(&mut self, closure: ClosureRef, argsrc: ArgsSource, want: Want) -> LuaResult<()> {
        if self.frames.len() >= limits::MAX_CALL_DEPTH {
            return Err(self.runtime_error("stack overflow"));
        }
        let proto = closure.proto.clone();
        let num_params = proto.num_params as usize;
        let (base, nargs) = match &argsrc {
            ArgsSource::InPlace(start, count) => (*start, *count),
            ArgsSource::Owned(v) => (self.registers.len(), v.len()),
        };
        let needed = base + proto.max_stack_size as usize + limits::EXTRA_STACK;
        self.ensure_capacity(needed);
        if let ArgsSource::Owned(v) = argsrc {
            for (i, val) in v.into_iter().enumerate() {
                self.registers[base + i] = val;
            }
        }
        let varargs = if proto.is_vararg && nargs > num_params {
            self.registers[base + num_params..base + nargs].to_vec()
        } else {
            Vec::new()
        };
        if nargs < num_params {
            for i in nargs..num_params {
                self.registers[base + i] = LuaValue::Nil;
            }
        }
        for i in num_params..proto.max_stack_size as usize {
            self.registers[base + i] = LuaValue::Nil;
        }
        trace!("call {} (base={base}, nargs={nargs})", proto.source);
        self.frames.push(Frame { closure, base, pc: 0, varargs, want });
        Ok(())
    }

    /// Pops the running frame, writing `results` back to whatever called
    /// it (per its recorded `want`) unless it was the boundary frame for
    /// this `run_from` invocation, in which case the results are simply
    /// handed back to the Rust caller.
    fn pop_frame_with_results(&mut self, results: Vec<LuaValue>, stop_depth: usize) -> PopOutcome {
        let frame = self.frames.pop().unwrap();
        self.close_upvalues_from(frame.base);
        if self.frames.len() == stop_depth {
            return PopOutcome::Done(results);
        }
        let target = frame.base - 1;
        match frame.want {
            Want::Fixed(n) => {
                self.ensure_capacity(target + n);
                for i in 0..n {
                    self.registers[target + i] = results.get(i).cloned().unwrap_or(LuaValue::Nil);
                }
            }
            Want::All => {
                self.ensure_capacity(target + results.len());
                let n = results.len();
                for (i, v) in results.into_iter().enumerate() {
                    self.registers[target + i] = v;
                }
                self.top = target + n;
            }
        }
        PopOutcome::Continue
    }

    // ----- the dispatch loop --------------------------------------------

    /// Dispatches instructions until the frame stack returns to
    /// `stop_depth` (the depth it was at before this call's frame(s) were
    /// pushed), then returns that call's results.
    fn run_from(&mut self, stop_depth: usize) -> LuaResult<Vec<LuaValue>> {
        loop {
            let frame_idx = self.frames.len() - 1;
            let (closure, base, pc) = {
                let f = &self.frames[frame_idx];
                (f.closure.clone(), f.base, f.pc)
            };
            let proto: &Prototype = &closure.proto;
            let instr = proto.code[pc];
            self.frames[frame_idx].pc = pc + 1;
            let op = Instruction::get_opcode(instr);
            let a = Instruction::get_a(instr);
            let b = Instruction::get_b(instr);
            let c = Instruction::get_c(instr);

            match op {
                OpCode::Move => {
                    let v = self.get_reg(base, b);
                    self.set_reg(base, a, v);
                }
                OpCode::LoadK => {
                    let k = proto.constants[Instruction::get_bx(instr) as usize].to_value();
                    self.set_reg(base, a, k);
                }
                OpCode::LoadKX => {
                    let extra = proto.code[self.frames[frame_idx].pc];
                    self.frames[frame_idx].pc += 1;
                    let idx = Instruction::get_ax(extra) as usize;
                    let k = proto.constants[idx].to_value();
                    self.set_reg(base, a, k);
                }
                OpCode::LoadBool => {
                    self.set_reg(base, a, LuaValue::Bool(b != 0));
                    if c != 0 {
                        self.frames[frame_idx].pc += 1;
                    }
                }
                OpCode::LoadNil => {
                    for i in 0..=b {
                        self.set_reg(base, a + i, LuaValue::Nil);
                    }
                }
                OpCode::GetUpval => {
                    let uv = closure.upvalues[b as usize].clone();
                    let v = self.read_upvalue(&uv);
                    self.set_reg(base, a, v);
                }
                OpCode::SetUpval => {
                    let v = self.get_reg(base, a);
                    let uv = closure.upvalues[b as usize].clone();
                    self.write_upvalue(&uv, v);
                }
                OpCode::GetTabUp => {
                    let uv = closure.upvalues[b as usize].clone();
                    let t = self.read_upvalue(&uv);
                    let key = self.get_rk(base, proto, c);
                    let v = self.index_get(t, key)?;
                    self.set_reg(base, a, v);
                }
                OpCode::SetTabUp => {
                    let uv = closure.upvalues[a as usize].clone();
                    let t = self.read_upvalue(&uv);
                    let key = self.get_rk(base, proto, b);
                    let val = self.get_rk(base, proto, c);
                    self.index_set(t, key, val)?;
                }
                OpCode::GetTable => {
                    let t = self.get_reg(base, b);
                    let key = self.get_rk(base, proto, c);
                    let v = self.index_get(t, key)?;
                    self.set_reg(base, a, v);
                }
                OpCode::SetTable => {
                    let t = self.get_reg(base, a);
                    let key = self.get_rk(base, proto, b);
                    let val = self.get_rk(base, proto, c);
                    self.index_set(t, key, val)?;
                }
                OpCode::NewTable => {
                    let t = LuaTable::with_capacity(b as usize, c as usize);
                    self.set_reg(base, a, LuaValue::Table(Rc::new(RefCell::new(t))));
                }
                OpCode::Self_ => {
                    let obj = self.get_reg(base, b);
                    let key = self.get_rk(base, proto, c);
                    self.set_reg(base, a + 1, obj.clone());
                    let v = self.index_get(obj, key)?;
                    self.set_reg(base, a, v);
                }
                OpCode::Add | OpCode::Sub | OpCode::Mul | OpCode::Div | OpCode::Pow => {
                    let x = self.get_rk(base, proto, b);
                    let y = self.get_rk(base, proto, c);
                    let v = self.do_arith(op, &x, &y)?;
                    self.set_reg(base, a, v);
                }
                OpCode::IDiv => {
                    let x = self.get_rk(base, proto, b);
                    let y = self.get_rk(base, proto, c);
                    let v = self.do_idiv(&x, &y)?;
                    self.set_reg(base, a, v);
                }
                OpCode::Mod => {
                    let x = self.get_rk(base, proto, b);
                    let y = self.get_rk(base, proto, c);
                    let v = self.do_mod(&x, &y)?;
                    self.set_reg(base, a, v);
                }
                OpCode::BAnd | OpCode::BOr | OpCode::BXor | OpCode::Shl | OpCode::Shr => {
                    let x = self.get_rk(base, proto, b);
                    let y = self.get_rk(base, proto, c);
                    let v = self.do_bitwise(op, &x, &y)?;
                    self.set_reg(base, a, v);
                }
                OpCode::Unm => {
                    let x = self.get_reg(base, b);
                    let v = self.do_unm(&x)?;
                    self.set_reg(base, a, v);
                }
                OpCode::BNot => {
                    let x = self.get_reg(base, b);
                    let v = self.do_bnot(&x)?;
                    self.set_reg(base, a, v);
                }
                OpCode::Not => {
                    let x = self.get_reg(base, b);
                    self.set_reg(base, a, LuaValue::Bool(!x.is_truthy()));
                }
                OpCode::Len => {
                    let x = self.get_reg(base, b);
                    let v = self.do_len(&x)?;
                    self.set_reg(base, a, v);
                }
                OpCode::Concat => {
                    let values: Vec<LuaValue> = (b..=c).map(|i| self.get_reg(base, i)).collect();
                    let v = self.do_concat(&values)?;
                    self.set_reg(base, a, v);
                }
                OpCode::Jmp => {
                    if a != 0 {
                        self.close_upvalues_from(base + a as usize - 1);
                    }
                    let sbx = Instruction::get_sbx(instr);
                    self.frames[frame_idx].pc = (self.frames[frame_idx].pc as i64 + sbx as i64) as usize;
                }
                OpCode::Eq => {
                    let x = self.get_rk(base, proto, b);
                    let y = self.get_rk(base, proto, c);
                    let eq = self.values_equal(&x, &y)?;
                    if eq != (a != 0) {
                        self.frames[frame_idx].pc += 1;
                    }
                }
                OpCode::Lt => {
                    let x = self.get_rk(base, proto, b);
                    let y = self.get_rk(base, proto, c);
                    let lt = self.values_less_than(&x, &y)?;
                    if lt != (a != 0) {
                        self.frames[frame_idx].pc += 1;
                    }
                }
                OpCode::Le => {
                    let x = self.get_rk(base, proto, b);
                    let y = self.get_rk(base, proto, c);
                    let le = self.values_less_equal(&x, &y)?;
                    if le != (a != 0) {
                        self.frames[frame_idx].pc += 1;
                    }
                }
                OpCode::Test => {
                    let v = self.get_reg(base, a);
                    if v.is_truthy() == (c != 0) {
                        self.frames[frame_idx].pc += 1;
                    }
                }
                OpCode::TestSet => {
                    let v = self.get_reg(base, b);
                    if v.is_truthy() == (c != 0) {
                        self.set_reg(base, a, v);
                    } else {
                        self.frames[frame_idx].pc += 1;
                    }
                }
                OpCode::Call => {
                    self.do_call(base, a, b, c, false)?;
                }
                OpCode::TailCall => {
                    if let Some(results) = self.do_tailcall(frame_idx, base, a, b)? {
                        match self.pop_frame_with_results(results, stop_depth) {
                            PopOutcome::Done(r) => return Ok(r),
                            PopOutcome::Continue => {}
                        }
                    }
                }
                OpCode::Return => {
                    let results = self.gather_open_or_fixed(base, a, b);
                    match self.pop_frame_with_results(results, stop_depth) {
                        PopOutcome::Done(r) => return Ok(r),
                        PopOutcome::Continue => {}
                    }
                }
                OpCode::ForPrep => {
                    self.do_for_prep(base, a)?;
                    let sbx = Instruction::get_sbx(instr);
                    self.frames[frame_idx].pc = (self.frames[frame_idx].pc as i64 + sbx as i64) as usize;
                }
                OpCode::ForLoop => {
                    if self.do_for_loop(base, a) {
                        let sbx = Instruction::get_sbx(instr);
                        self.frames[frame_idx].pc = (self.frames[frame_idx].pc as i64 + sbx as i64) as usize;
                    }
                }
                OpCode::TForCall => {
                    let f = self.get_reg(base, a);
                    let st = self.get_reg(base, a + 1);
                    let ctrl = self.get_reg(base, a + 2);
                    let results = self.call_value(f, vec![st, ctrl])?;
                    for i in 0..c {
                        let v = results.get(i as usize).cloned().unwrap_or(LuaValue::Nil);
                        self.set_reg(base, a + 3 + i, v);
                    }
                }
                OpCode::TForLoop => {
                    let ctrl_result = self.get_reg(base, a + 1);
                    if !matches!(ctrl_result, LuaValue::Nil) {
                        self.set_reg(base, a, ctrl_result);
                        let sbx = Instruction::get_sbx(instr);
                        self.frames[frame_idx].pc = (self.frames[frame_idx].pc as i64 + sbx as i64) as usize;
                    }
                }
                OpCode::SetList => {
                    self.do_setlist(frame_idx, base, proto, a, b, c)?;
                }
                OpCode::Closure => {
                    let bx = Instruction::get_bx(instr) as usize;
                    let child = proto.protos[bx].clone();
                    let mut upvalues = Vec::with_capacity(child.upvalues.len());
                    for desc in &child.upvalues {
                        if desc.in_stack {
                            upvalues.push(self.find_or_open_upvalue(base + desc.index as usize));
                        } else {
                            upvalues.push(closure.upvalues[desc.index as usize].clone());
                        }
                    }
                    let new_closure = Rc::new(LuaClosure { proto: child, upvalues });
                    self.set_reg(base, a, LuaValue::Function(new_closure));
                }
                OpCode::Vararg => {
                    let varargs = self.frames[frame_idx].varargs.clone();
                    if b == 0 {
                        self.ensure_capacity(base + a as usize + varargs.len());
                        for (i, v) in varargs.iter().enumerate() {
                            self.set_reg(base, a + i as u32, v.clone());
                        }
                        self.top = base + a as usize + varargs.len();
                    } else {
                        for i in 0..(b - 1) {
                            let v = varargs.get(i as usize).cloned().unwrap_or(LuaValue::Nil);
                            self.set_reg(base, a + i, v);
                        }
                    }
                }
                OpCode::ExtraArg => unreachable!("EXTRARG consumed by its preceding instruction"),
            }
        }
    }

    fn gather_open_or_fixed(&self, base: usize, a: u32, count_plus_one: u32) -> Vec<LuaValue> {
        if count_plus_one == 0 {
            let start = base + a as usize;
            (start..self.top).map(|i| self.registers[i].clone()).collect()
        } else {
            (0..count_plus_one - 1).map(|i| self.get_reg(base, a + i)).collect()
        }
    }

    fn do_call(&mut self, base: usize, a: u32, b: u32, c: u32, _is_tail: bool) -> LuaResult<()> {
        let callee = self.get_reg(base, a);
        let arg_start = base + a as usize + 1;
        let nargs = if b == 0 { self.top - arg_start } else { b as usize - 1 };
        let want = if c == 0 { Want::All } else { Want::Fixed(c as usize - 1) };

        match self.resolve_callable(callee, arg_start, nargs)? {
            Callable::Closure(closure) => {
                self.push_call_frame(closure, ArgsSource::InPlace(arg_start, nargs), want)?;
            }
            Callable::Native(native) => {
                let args: Vec<LuaValue> = self.registers[arg_start..arg_start + nargs].to_vec();
                let results = (native.func)(self, args)?;
                self.write_call_results(base, a, want, results);
            }
            Callable::Prepared(f, args) => {
                let results = self.call_value(f, args)?;
                self.write_call_results(base, a, want, results);
            }
        }
        Ok(())
    }

    fn write_call_results(&mut self, base: usize, a: u32, want: Want, results: Vec<LuaValue>) {
        match want {
            Want::Fixed(n) => {
                for i in 0..n {
                    let v = results.get(i).cloned().unwrap_or(LuaValue::Nil);
                    self.set_reg(base, a + i as u32, v);
                }
            }
            Want::All => {
                let target = base + a as usize;
                self.ensure_capacity(target + results.len());
                let n = results.len();
                for (i, v) in results.into_iter().enumerate() {
                    self.registers[target + i] = v;
                }
                self.top = target + n;
            }
        }
    }

    /// `TAILCALL` reuses the running frame instead of pushing a new one.
    /// Returns `Some(results)` when the callee
    /// turned out to be a native function (so the tail call *is* this
    /// frame's return, handled by the caller like `RETURN`); `None` when
    /// it's a Lua closure, since the frame was reused in place and
    /// dispatch should simply continue.
    fn do_tailcall(&mut self, frame_idx: usize, base: usize, a: u32, b: u32) -> LuaResult<Option<Vec<LuaValue>>> {
        let callee = self.get_reg(base, a);
        let arg_start = base + a as usize + 1;
        let nargs = if b == 0 { self.top - arg_start } else { b as usize - 1 };
        let args: Vec<LuaValue> = self.registers[arg_start..arg_start + nargs].to_vec();

        match self.resolve_callable(callee, arg_start, nargs)? {
            Callable::Closure(closure) => {
                self.close_upvalues_from(base);
                let proto = closure.proto.clone();
                let num_params = proto.num_params as usize;
                let needed = base + proto.max_stack_size as usize + limits::EXTRA_STACK;
                self.ensure_capacity(needed);
                for (i, v) in args.iter().enumerate() {
                    self.registers[base + i] = v.clone();
                }
                let varargs = if proto.is_vararg && args.len() > num_params {
                    args[num_params..].to_vec()
                } else {
                    Vec::new()
                };
                if args.len() < num_params {
                    for i in args.len()..num_params {
                        self.registers[base + i] = LuaValue::Nil;
                    }
                }
                for i in num_params..proto.max_stack_size as usize {
                    self.registers[base + i] = LuaValue::Nil;
                }
                let frame = &mut self.frames[frame_idx];
                frame.closure = closure;
                frame.pc = 0;
                frame.varargs = varargs;
                Ok(None)
            }
            Callable::Native(native) => Ok(Some((native.func)(self, args)?)),
            Callable::Prepared(f, args) => Ok(Some(self.call_value(f, args)?)),
        }
    }

    /// Resolves `callee` to something directly invocable, following the
    /// `__call` chain (bounded). When `__call` fires,
    /// the original value is prepended to the arguments and the whole
    /// thing becomes `Callable::Prepared`, since by then the arguments
    /// are no longer the ones already sitting in the register file.
    fn resolve_callable(&mut self, mut callee: LuaValue, arg_start: usize, nargs: usize) -> LuaResult<Callable> {
        match &callee {
            LuaValue::Function(c) => return Ok(Callable::Closure(c.clone())),
            LuaValue::Native(n) => return Ok(Callable::Native(n.clone())),
            _ => {}
        }
        let mut args: Option<Vec<LuaValue>> = None;
        for _ in 0..limits::MAXTAGLOOP {
            let mm = self.get_metamethod(&callee, "__call");
            match mm {
                Some(f) => {
                    let mut a = args.take().unwrap_or_else(|| self.registers[arg_start..arg_start + nargs].to_vec());
                    a.insert(0, callee.clone());
                    match f {
                        LuaValue::Function(c) => return Ok(Callable::Prepared(LuaValue::Function(c), a)),
                        LuaValue::Native(n) => return Ok(Callable::Prepared(LuaValue::Native(n), a)),
                        other => {
                            callee = other;
                            args = Some(a);
                        }
                    }
                }
                None => return Err(self.runtime_error(format!("attempt to call a {} value", callee.type_name()))),
            }
        }
        Err(self.runtime_error("'__call' chain too long; possible loop"))
    }

    fn do_for_prep(&mut self, base: usize, a: u32) -> LuaResult<()> {
        let init = self.get_reg(base, a);
        let limit = self.get_reg(base, a + 1);
        let step = self.get_reg(base, a + 2);
        let init_n = init.coerce_to_number().ok_or_else(|| self.runtime_error("'for' initial value must be a number"))?;
        let limit_n = limit.coerce_to_number().ok_or_else(|| self.runtime_error("'for' limit must be a number"))?;
        let step_n = step.coerce_to_number().ok_or_else(|| self.runtime_error("'for' step must be a number"))?;
        if let (LuaValue::Int(i0), LuaValue::Int(st)) = (&init_n, &step_n) {
            if *st == 0 {
                return Err(self.runtime_error("'for' step is zero"));
            }
            let lim = match limit_n {
                LuaValue::Int(l) => l,
                LuaValue::Float(f) => {
                    if *st > 0 {
                        if f >= i64::MAX as f64 { i64::MAX } else { f.floor() as i64 }
                    } else if f <= i64::MIN as f64 {
                        i64::MIN
                    } else {
                        f.ceil() as i64
                    }
                }
                _ => unreachable!(),
            };
            self.set_reg(base, a, LuaValue::Int(i0.wrapping_sub(*st)));
            self.set_reg(base, a + 1, LuaValue::Int(lim));
            self.set_reg(base, a + 2, LuaValue::Int(*st));
        } else {
            let i0 = init_n.as_f64().unwrap();
            let lim = limit_n.as_f64().unwrap();
            let st = step_n.as_f64().unwrap();
            if st == 0.0 {
                return Err(self.runtime_error("'for' step is zero"));
            }
            self.set_reg(base, a, LuaValue::Float(i0 - st));
            self.set_reg(base, a + 1, LuaValue::Float(lim));
            self.set_reg(base, a + 2, LuaValue::Float(st));
        }
        Ok(())
    }

    /// Returns whether the loop continues.
    fn do_for_loop(&mut self, base: usize, a: u32) -> bool {
        let step = self.get_reg(base, a + 2);
        match step {
            LuaValue::Int(st) => {
                let cur = match self.get_reg(base, a) {
                    LuaValue::Int(i) => i,
                    _ => unreachable!("numeric for control var desynced from its declared int type"),
                };
                let limit = match self.get_reg(base, a + 1) {
                    LuaValue::Int(i) => i,
                    _ => unreachable!(),
                };
                let next = cur.wrapping_add(st);
                let cont = if st > 0 { next <= limit } else { next >= limit };
                if cont {
                    self.set_reg(base, a, LuaValue::Int(next));
                    self.set_reg(base, a + 3, LuaValue::Int(next));
                }
                cont
            }
            LuaValue::Float(st) => {
                let cur = self.get_reg(base, a).as_f64().unwrap();
                let limit = self.get_reg(base, a + 1).as_f64().unwrap();
                let next = cur + st;
                let cont = if st > 0.0 { next <= limit } else { next >= limit };
                if cont {
                    self.set_reg(base, a, LuaValue::Float(next));
                    self.set_reg(base, a + 3, LuaValue::Float(next));
                }
                cont
            }
            _ => unreachable!("numeric for control var must be int or float after FORPREP"),
        }
    }

    fn do_setlist(&mut self, frame_idx: usize, base: usize, proto: &Prototype, a: u32, b: u32, c: u32) -> LuaResult<()> {
        let flush_number = if c == 0 {
            let extra = proto.code[self.frames[frame_idx].pc];
            self.frames[frame_idx].pc += 1;
            Instruction::get_ax(extra) as usize
        } else {
            c as usize
        };
        let count = if b == 0 { self.top - (base + a as usize + 1) } else { b as usize };
        let table = self.get_reg(base, a);
        let Some(table) = table.as_table().cloned() else {
            return Err(self.runtime_error("attempt to initialize a non-table with SETLIST"));
        };
        let start_index = (flush_number - 1) * limits::LFIELDS_PER_FLUSH + 1;
        for i in 0..count {
            let v = self.get_reg(base, a + 1 + i as u32);
            table.borrow_mut().set(LuaValue::Int((start_index + i) as i64), v);
        }
        Ok(())
    }
}

impl Default for LuaVM {
    fn default() -> Self {
        Self::new()
    }
}

enum Callable {
    Closure(ClosureRef),
    Native(NativeRef),
    /// A `__call` metamethod resolution: the real function to invoke,
    /// plus the argument list with the original callee already
    /// prepended.
    Prepared(LuaValue, Vec<LuaValue>),
}

fn arith_event(op: OpCode) -> &'static str {
    match op {
        OpCode::Add => "__add",
        OpCode::Sub => "__sub",
        OpCode::Mul => "__mul",
        OpCode::Div => "__div",
        OpCode::Pow => "__pow",
        OpCode::BAnd => "__band",
        OpCode::BOr => "__bor",
        OpCode::BXor => "__bxor",
        OpCode::Shl => "__shl",
        OpCode::Shr => "__shr",
        _ => unreachable!(),
    }
}

/// Default `tostring` formatting, used both by
/// the `tostring`/`print` builtins and `__tostring`'s fallback when a
/// handler returns a non-string.
pub fn default_tostring(v: &LuaValue) -> Vec<u8> {
    match v {
        LuaValue::Nil => b"nil".to_vec(),
        LuaValue::Bool(true) => b"true".to_vec(),
        LuaValue::Bool(false) => b"false".to_vec(),
        LuaValue::Int(i) => {
            let mut buf = itoa::Buffer::new();
            buf.format(*i).as_bytes().to_vec()
        }
        LuaValue::Float(f) => arith::format_float(*f).into_bytes(),
        LuaValue::Str(s) => s.as_bytes().to_vec(),
        LuaValue::Table(t) => format!("table: {:p}", Rc::as_ptr(t)).into_bytes(),
        LuaValue::Function(f) => format!("function: {:p}", Rc::as_ptr(f)).into_bytes(),
        LuaValue::Native(f) => format!("function: builtin: {:p}", Rc::as_ptr(f)).into_bytes(),
    }
}
