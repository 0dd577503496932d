//! Code generator: lowers a parsed `Block` into a `Prototype` tree (spec
//! §4.3). `FuncState` (register allocator, locals, upvalues, jump
//! patching) and `ExpDesc` (the not-yet-discharged expression
//! descriptor) do the bookkeeping; this module walks the AST and drives
//! them.
//!
//! Expressions are discharged eagerly into registers once something
//! needs their value (see `expdesc.rs`), except for two places where
//! Lua's actual jump-list scheme is worth keeping: boolean conditions
//! (`if`/`while`/`repeat`, via `jump_on_true`/`jump_on_false`) compile
//! straight to `TEST`/comparison + `JMP` with no register at all, and
//! `and`/`or` *as values* reuse one register for both operands with a
//! single `TEST`.

pub mod expdesc;
pub mod funcstate;

use std::rc::Rc;

use crate::error::{Line, LuaError, LuaResult};
use crate::limits;
use crate::parser::ast::*;
use crate::parser::Parser;
use crate::value::{Constant, LuaString, Prototype};
use crate::vm::opcode::{Instruction, OpCode};

use expdesc::ExpDesc;
use funcstate::FuncState;

/// Compiles a full chunk (source bytes plus a display name for error
/// messages and debug info) into its main-function `Prototype`. The
/// main function has a single upvalue, `_ENV` (the convention Lua 5.2+
/// uses to thread the global table through as an ordinary upvalue
/// rather than a VM special case) — `LuaVM::create_main_closure` is
/// responsible for actually binding it to the globals table.
pub fn compile(src: &[u8], chunk_name: &str) -> LuaResult<Prototype> {
    let mut parser = Parser::new(src, chunk_name.to_string())?;
    let block = parser.parse_chunk()?;

    let mut c = Compiler { funcs: Vec::new() };
    let mut fs = FuncState::new(chunk_name.to_string(), true, 0);
    fs.add_upvalue("_ENV".to_string(), false, 0, 0)?;
    c.funcs.push(fs);
    c.cur().enter_block(false);
    c.compile_block(&block)?;
    let (_, _, _) = c.cur().leave_block(0)?;
    c.finish_function(0);
    let fs = c.funcs.pop().expect("main funcstate");
    Ok(fs.into_prototype())
}

/// Which lexical scope a resolved name lives in.
enum NameRef {
    Local(u8),
    Upvalue(u8),
    Global,
}

/// An assignment target, already fully evaluated down to whatever
/// registers/indices the eventual store instruction needs — computed
/// once up front so the right-hand side can be evaluated afterwards
/// without disturbing it.
enum LValue {
    Local(u8),
    Upvalue(u8),
    Global { env: u8, key_rk: u32 },
    Indexed { table_reg: u8, key_rk: u32 },
}

struct Compiler {
    funcs: Vec<FuncState>,
}

impl Compiler {
    fn cur(&mut self) -> &mut FuncState {
        self.funcs.last_mut().expect("no active function being compiled")
    }

    fn finish_function(&mut self, line: Line) {
        self.cur().emit_abc(OpCode::Return, 0, 1, 0, line);
    }

    // ----- name resolution (locals / upvalues / globals via _ENV) -----

    fn resolve_at(&mut self, level: usize, name: &str, line: Line) -> LuaResult<NameRef> {
        if let Some(r) = self.funcs[level].resolve_local(name) {
            return Ok(NameRef::Local(r));
        }
        if let Some(i) = self.funcs[level].find_upvalue(name) {
            return Ok(NameRef::Upvalue(i));
        }
        if level == 0 {
            return Ok(NameRef::Global);
        }
        match self.resolve_at(level - 1, name, line)? {
            NameRef::Local(r) => {
                self.funcs[level - 1].mark_upvalue_capture();
                let idx = self.funcs[level].add_upvalue(name.to_string(), true, r as u32, line)?;
                Ok(NameRef::Upvalue(idx))
            }
            NameRef::Upvalue(pi) => {
                let idx = self.funcs[level].add_upvalue(name.to_string(), false, pi as u32, line)?;
                Ok(NameRef::Upvalue(idx))
            }
            NameRef::Global => Ok(NameRef::Global),
        }
    }

    fn resolve(&mut self, name: &str, line: Line) -> LuaResult<ExpDesc> {
        let top = self.funcs.len() - 1;
        match self.resolve_at(top, name, line)? {
            NameRef::Local(r) => Ok(ExpDesc::Local(r)),
            NameRef::Upvalue(i) => Ok(ExpDesc::Upvalue(i)),
            NameRef::Global => Ok(ExpDesc::Global(name.to_string())),
        }
    }

    /// Resolves (adding upvalues down the closure chain as needed) the
    /// current function's own `_ENV`, used for every global access.
    fn env_upvalue(&mut self, line: Line) -> LuaResult<u8> {
        let top = self.funcs.len() - 1;
        match self.resolve_at(top, "_ENV", line)? {
            NameRef::Upvalue(i) => Ok(i),
            NameRef::Local(_) => unreachable!("_ENV is never a local"),
            NameRef::Global => unreachable!("_ENV is always registered on the main chunk"),
        }
    }

    // ----- registers / discharge -----

    fn alloc_reg(&mut self, line: Line) -> LuaResult<u8> {
        let r = self.cur().freereg;
        self.cur().reserve_regs(1, line)?;
        Ok(r)
    }

    fn rk_for_constant(&mut self, c: Constant, line: Line) -> LuaResult<u32> {
        let idx = self.cur().add_constant(c, line)?;
        if idx <= Instruction::MAXINDEXRK {
            Ok(Instruction::rk_const(idx))
        } else {
            let r = self.alloc_reg(line)?;
            self.emit_load_const_idx(r, idx, line);
            Ok(r as u32)
        }
    }

    fn emit_load_const_idx(&mut self, target: u8, idx: u32, line: Line) {
        if idx <= Instruction::MAX_BX {
            self.cur().emit_abx(OpCode::LoadK, target as u32, idx, line);
        } else {
            self.cur().emit_abx(OpCode::LoadKX, target as u32, 0, line);
            self.cur().emit(Instruction::encode_ax(OpCode::ExtraArg, idx), line);
        }
    }

    fn load_const(&mut self, target: u8, c: Constant, line: Line) -> LuaResult<()> {
        let idx = self.cur().add_constant(c, line)?;
        self.emit_load_const_idx(target, idx, line);
        Ok(())
    }

    /// Places `d`'s value into `target`, emitting whatever load/move/
    /// table-access instruction that requires.
    fn discharge_to(&mut self, d: ExpDesc, target: u8, line: Line) -> LuaResult<()> {
        match d {
            ExpDesc::Nil => {
                self.cur().emit_abc(OpCode::LoadNil, target as u32, 0, 0, line);
            }
            ExpDesc::True => {
                self.cur().emit_abc(OpCode::LoadBool, target as u32, 1, 0, line);
            }
            ExpDesc::False => {
                self.cur().emit_abc(OpCode::LoadBool, target as u32, 0, 0, line);
            }
            ExpDesc::Int(i) => self.load_const(target, Constant::Int(i), line)?,
            ExpDesc::Float(f) => self.load_const(target, Constant::Float(f), line)?,
            ExpDesc::Str(s) => self.load_const(target, Constant::Str(s), line)?,
            ExpDesc::Local(r) | ExpDesc::Reg(r) | ExpDesc::Call(r) | ExpDesc::Vararg(r) => {
                if r != target {
                    self.cur().emit_abc(OpCode::Move, target as u32, r as u32, 0, line);
                }
            }
            ExpDesc::Upvalue(i) => {
                self.cur().emit_abc(OpCode::GetUpval, target as u32, i as u32, 0, line);
            }
            ExpDesc::Global(name) => {
                let env = self.env_upvalue(line)?;
                let key_rk = self.rk_for_constant(Constant::Str(LuaString::from_str(&name)), line)?;
                self.cur().emit_abc(OpCode::GetTabUp, target as u32, env as u32, key_rk, line);
            }
            ExpDesc::Indexed(ix) => {
                let treg = self.to_any_reg(*ix.table, line)?;
                let krk = self.to_rk(*ix.key, line)?;
                self.cur().emit_abc(OpCode::GetTable, target as u32, treg as u32, krk, line);
            }
        }
        Ok(())
    }

    /// Forces `d` into *some* register, reusing its own if it already
    /// has one (a local, a temporary, a call/vararg result).
    fn to_any_reg(&mut self, d: ExpDesc, line: Line) -> LuaResult<u8> {
        match d {
            ExpDesc::Local(r) | ExpDesc::Reg(r) | ExpDesc::Call(r) | ExpDesc::Vararg(r) => Ok(r),
            other => {
                let r = self.alloc_reg(line)?;
                self.discharge_to(other, r, line)?;
                Ok(r)
            }
        }
    }

    fn compile_expr_to_any_reg(&mut self, e: &Expr) -> LuaResult<u8> {
        let line = e.line();
        let d = self.compile_expr(e)?;
        self.to_any_reg(d, line)
    }

    /// Compiles `e` and places its value at exactly the current
    /// `freereg` (captured *before* compiling), bumping `freereg` by
    /// one. Unlike the naive "alloc a register, then discharge into
    /// it" sequence, this is safe to use when building up a run of
    /// contiguous registers (call arguments, `SETLIST` batches,
    /// `CONCAT`'s operand range, the numeric-`for` control block):
    /// compiling `e` may itself consume and free temporary registers
    /// above the target before landing its result, so the target has
    /// to be fixed first and reconciled with a `MOVE` afterwards
    /// rather than assumed to be wherever `freereg` ends up next.
    fn compile_expr_into_next_reg(&mut self, e: &Expr, line: Line) -> LuaResult<u8> {
        let target = self.cur().freereg;
        let d = self.compile_expr(e)?;
        let r = self.to_any_reg(d, line)?;
        if r != target {
            self.cur().emit_abc(OpCode::Move, target as u32, r as u32, 0, line);
        }
        self.cur().free_to(target);
        self.cur().reserve_regs(1, line)?;
        Ok(target)
    }

    /// Produces an RK operand: a constant-table index with the high bit
    /// set for literals, or a plain register index otherwise.
    fn to_rk(&mut self, d: ExpDesc, line: Line) -> LuaResult<u32> {
        match d {
            ExpDesc::Nil => self.rk_for_constant(Constant::Nil, line),
            ExpDesc::True => self.rk_for_constant(Constant::Bool(true), line),
            ExpDesc::False => self.rk_for_constant(Constant::Bool(false), line),
            ExpDesc::Int(i) => self.rk_for_constant(Constant::Int(i), line),
            ExpDesc::Float(f) => self.rk_for_constant(Constant::Float(f), line),
            ExpDesc::Str(s) => self.rk_for_constant(Constant::Str(s), line),
            ExpDesc::Local(r) | ExpDesc::Reg(r) => Ok(r as u32),
            other => Ok(self.to_any_reg(other, line)? as u32),
        }
    }

    // ----- blocks -----

    fn compile_block(&mut self, block: &Block) -> LuaResult<()> {
        for stat in &block.stats {
            self.compile_stat(stat)?;
        }
        Ok(())
    }

    /// A non-loop block (`do...end`, an `if` arm, a function body)
    /// closes any upvalues it captured with a zero-offset `JMP` purely
    /// for the side effect: `JMP` also executes a pending `CLOSE`.
    fn close_block_if_needed(&mut self, nactvar_on_entry: usize, has_uv: bool, line: Line) {
        if has_uv {
            self.cur().emit_asbx(OpCode::Jmp, (nactvar_on_entry + 1) as u32, 0, line);
        }
    }

    fn patch_all_to_here(&mut self, pcs: &[usize]) {
        for &pc in pcs {
            self.cur().patch_to_here(pc);
        }
    }

    // ----- statements -----

    fn compile_stat(&mut self, s: &Stat) -> LuaResult<()> {
        match s {
            Stat::Assign { targets, values, line } => self.compile_assign(targets, values, *line),
            Stat::LocalAssign { names, values, line } => self.compile_local_assign(names, values, *line),
            Stat::ExprStat(e) => {
                self.compile_fixed_results(e, 0, e.line())?;
                Ok(())
            }
            Stat::Do(body) => {
                self.cur().enter_block(false);
                self.compile_block(body)?;
                let (nv, huv, breaks) = self.cur().leave_block(0)?;
                self.close_block_if_needed(nv, huv, 0);
                self.cur().patch_breaks_to_here(breaks);
                Ok(())
            }
            Stat::While { cond, body, line } => self.compile_while(cond, body, *line),
            Stat::Repeat { body, cond, line } => self.compile_repeat(body, cond, *line),
            Stat::If { arms, else_block, line } => self.compile_if(arms, else_block, *line),
            Stat::NumericFor { var, start, stop, step, body, line } => {
                self.compile_numeric_for(var, start, stop, step.as_ref(), body, *line)
            }
            Stat::GenericFor { names, exprs, body, line } => self.compile_generic_for(names, exprs, body, *line),
            Stat::FunctionDecl { name, body, line } => self.compile_function_decl(name, body, *line),
            Stat::LocalFunction { name, body, line } => self.compile_local_function(name, body, *line),
            Stat::Return { exprs, line } => self.compile_return(exprs, *line),
            Stat::Break(line) => self.cur().add_break(*line),
            Stat::Goto { label, line } => self.cur().add_goto(label.clone(), *line),
            Stat::Label { name, line } => self.cur().define_label(name.clone(), *line),
        }
    }

    fn prepare_target(&mut self, e: &Expr, line: Line) -> LuaResult<LValue> {
        match e {
            Expr::Name(n, l) => match self.resolve(n, *l)? {
                ExpDesc::Local(r) => Ok(LValue::Local(r)),
                ExpDesc::Upvalue(i) => Ok(LValue::Upvalue(i)),
                ExpDesc::Global(name) => {
                    let env = self.env_upvalue(*l)?;
                    let key_rk = self.rk_for_constant(Constant::Str(LuaString::from_str(&name)), *l)?;
                    Ok(LValue::Global { env, key_rk })
                }
                _ => unreachable!("resolve() only ever returns Local/Upvalue/Global"),
            },
            Expr::Index { obj, key, line: l } => {
                let od = self.compile_expr(obj)?;
                let table_reg = self.to_any_reg(od, *l)?;
                let kd = self.compile_expr(key)?;
                let key_rk = self.to_rk(kd, *l)?;
                Ok(LValue::Indexed { table_reg, key_rk })
            }
            _ => Err(LuaError::Codegen {
                message: "cannot assign to this expression".into(),
                line,
            }),
        }
    }

    fn store_target(&mut self, lv: LValue, value_reg: u8, line: Line) {
        match lv {
            LValue::Local(r) => {
                if r != value_reg {
                    self.cur().emit_abc(OpCode::Move, r as u32, value_reg as u32, 0, line);
                }
            }
            LValue::Upvalue(i) => {
                self.cur().emit_abc(OpCode::SetUpval, value_reg as u32, i as u32, 0, line);
            }
            LValue::Global { env, key_rk } => {
                self.cur().emit_abc(OpCode::SetTabUp, env as u32, key_rk, value_reg as u32, line);
            }
            LValue::Indexed { table_reg, key_rk } => {
                self.cur().emit_abc(OpCode::SetTable, table_reg as u32, key_rk, value_reg as u32, line);
            }
        }
    }

    fn compile_assign(&mut self, targets: &[Expr], values: &[Expr], line: Line) -> LuaResult<()> {
        let mark = self.cur().freereg;
        let mut lvs = Vec::with_capacity(targets.len());
        for t in targets {
            lvs.push(self.prepare_target(t, line)?);
        }
        let base = self.compile_expr_list_adjusted(values, targets.len(), line)?;
        for (i, lv) in lvs.into_iter().enumerate() {
            self.store_target(lv, base + i as u8, line);
        }
        self.cur().free_to(mark);
        Ok(())
    }

    fn compile_local_assign(&mut self, names: &[String], values: &[Expr], line: Line) -> LuaResult<()> {
        self.compile_expr_list_adjusted(values, names.len(), line)?;
        self.cur().declare_locals_in_place(names, line)?;
        Ok(())
    }

    /// Evaluates `exprs` into exactly `want` consecutive registers
    /// (starting at the current `freereg`), matching Lua's assignment
    /// adjustment rule: if there are fewer values than targets, only the
    /// *last* expression may expand (if it's a call or `...`) to cover
    /// the shortfall, else the shortfall is padded with `nil`; if there
    /// are more values than targets, the extras are still evaluated (for
    /// side effects) and then discarded.
    fn compile_expr_list_adjusted(&mut self, exprs: &[Expr], want: usize, line: Line) -> LuaResult<u8> {
        let base = self.cur().freereg;
        if exprs.is_empty() {
            if want > 0 {
                self.cur().reserve_regs(want as u8, line)?;
                self.cur().emit_abc(OpCode::LoadNil, base as u32, (want - 1) as u32, 0, line);
            }
            return Ok(base);
        }
        let m = exprs.len();
        for (i, e) in exprs.iter().enumerate() {
            let is_last = i == m - 1;
            if is_last && want > m {
                let need = want - i;
                if e.is_multret() {
                    self.compile_fixed_results(e, need, e.line())?;
                } else {
                    self.compile_expr_into_next_reg(e, line)?;
                    if need > 1 {
                        let padbase = self.cur().freereg;
                        self.cur().reserve_regs((need - 1) as u8, line)?;
                        self.cur().emit_abc(OpCode::LoadNil, padbase as u32, (need - 2) as u32, 0, line);
                    }
                }
            } else {
                let r = self.compile_expr_into_next_reg(e, line)?;
                if i >= want {
                    self.cur().free_to(r);
                }
            }
        }
        Ok(base)
    }

    /// Evaluates `exprs` left to right, with every expression but the
    /// last truncated to one value; the last, if it's a call or `...`,
    /// is left *open* (`C=0`/`B=0`, "as many results as the runtime top
    /// holds") rather than fixed. Used for call arguments, `return`, and
    /// the positional tail of a table constructor.
    fn compile_value_list_open(&mut self, exprs: &[Expr], line: Line) -> LuaResult<(u8, bool, usize)> {
        let base = self.cur().freereg;
        if exprs.is_empty() {
            return Ok((base, false, 0));
        }
        for e in &exprs[..exprs.len() - 1] {
            self.compile_expr_into_next_reg(e, line)?;
        }
        let last = exprs.last().unwrap();
        if last.is_multret() {
            self.compile_multret_open(last, line)?;
            Ok((base, true, exprs.len() - 1))
        } else {
            self.compile_expr_into_next_reg(last, line)?;
            Ok((base, false, exprs.len()))
        }
    }

    /// Emits a call/vararg expression requesting *all* of its results,
    /// leaving the VM's runtime stack top open rather than reserving a
    /// fixed number of registers at compile time.
    fn compile_multret_open(&mut self, e: &Expr, line: Line) -> LuaResult<()> {
        match e {
            Expr::Call { func, args, line: l } => {
                let (base, open, nfixed) = self.compile_call_setup(func, args, *l)?;
                let b = if open { 0 } else { (nfixed + 1) as u32 };
                self.cur().emit_abc(OpCode::Call, base as u32, b, 0, *l);
            }
            Expr::MethodCall { obj, method, args, line: l } => {
                let (base, open, nfixed) = self.compile_method_call_setup(obj, method, args, *l)?;
                let b = if open { 0 } else { (nfixed + 2) as u32 };
                self.cur().emit_abc(OpCode::Call, base as u32, b, 0, *l);
            }
            Expr::Vararg(l) => {
                let r = self.cur().freereg;
                self.cur().reserve_regs(1, *l)?;
                self.cur().emit_abc(OpCode::Vararg, r as u32, 0, 0, *l);
            }
            _ => unreachable!("compile_multret_open on a non-multret expression"),
        }
        Ok(())
    }

    /// Compiles any expression, requesting exactly `need` results (`0`
    /// is valid: evaluate for side effects only, e.g. a bare call
    /// statement). Returns the base register of the (possibly empty)
    /// result block.
    fn compile_call_fixed(&mut self, func: &Expr, args: &[Expr], line: Line, need: usize) -> LuaResult<u8> {
        let (base, open, nfixed) = self.compile_call_setup(func, args, line)?;
        let b = if open { 0 } else { (nfixed + 1) as u32 };
        self.cur().emit_abc(OpCode::Call, base as u32, b, (need + 1) as u32, line);
        self.cur().free_to(base);
        self.cur().reserve_regs(need as u8, line)?;
        Ok(base)
    }

    fn compile_method_call_fixed(&mut self, obj: &Expr, method: &str, args: &[Expr], line: Line, need: usize) -> LuaResult<u8> {
        let (base, open, nfixed) = self.compile_method_call_setup(obj, method, args, line)?;
        let b = if open { 0 } else { (nfixed + 2) as u32 };
        self.cur().emit_abc(OpCode::Call, base as u32, b, (need + 1) as u32, line);
        self.cur().free_to(base);
        self.cur().reserve_regs(need as u8, line)?;
        Ok(base)
    }

    fn compile_fixed_results(&mut self, e: &Expr, need: usize, line: Line) -> LuaResult<u8> {
        match e {
            Expr::Call { func, args, line: l } => self.compile_call_fixed(func, args, *l, need),
            Expr::MethodCall { obj, method, args, line: l } => {
                self.compile_method_call_fixed(obj, method, args, *l, need)
            }
            Expr::Vararg(l) => {
                let base = self.cur().freereg;
                self.cur().reserve_regs(need as u8, line)?;
                self.cur().emit_abc(OpCode::Vararg, base as u32, (need + 1) as u32, 0, *l);
                Ok(base)
            }
            other => {
                // Not multret: produces exactly one value, regardless of `need`.
                let base = self.cur().freereg;
                if need == 0 {
                    // Still must evaluate for side effects, then discard.
                    let d = self.compile_expr(other)?;
                    let _ = self.to_any_reg(d, line)?;
                    self.cur().free_to(base);
                } else {
                    self.compile_expr_into_next_reg(other, line)?;
                    if need > 1 {
                        let padbase = self.cur().freereg;
                        self.cur().reserve_regs((need - 1) as u8, line)?;
                        self.cur().emit_abc(OpCode::LoadNil, padbase as u32, (need - 2) as u32, 0, line);
                    }
                }
                Ok(base)
            }
        }
    }

    fn compile_call_setup(&mut self, func: &Expr, args: &[Expr], line: Line) -> LuaResult<(u8, bool, usize)> {
        let fd = self.compile_expr(func)?;
        let base = self.alloc_reg(line)?;
        self.discharge_to(fd, base, line)?;
        let (_, open, nfixed) = self.compile_value_list_open(args, line)?;
        Ok((base, open, nfixed))
    }

    fn compile_method_call_setup(
        &mut self,
        obj: &Expr,
        method: &str,
        args: &[Expr],
        line: Line,
    ) -> LuaResult<(u8, bool, usize)> {
        let od = self.compile_expr(obj)?;
        let obj_r = self.to_any_reg(od, line)?;
        let base = self.alloc_reg(line)?;
        self.alloc_reg(line)?; // R(base+1): filled by SELF with the self-argument copy
        let key_rk = self.rk_for_constant(Constant::Str(LuaString::from_str(method)), line)?;
        self.cur().emit_abc(OpCode::Self_, base as u32, obj_r as u32, key_rk, line);
        let (_, open, nfixed) = self.compile_value_list_open(args, line)?;
        Ok((base, open, nfixed))
    }

    fn compile_return(&mut self, exprs: &[Expr], line: Line) -> LuaResult<()> {
        if exprs.is_empty() {
            self.cur().emit_abc(OpCode::Return, 0, 1, 0, line);
            return Ok(());
        }
        if exprs.len() == 1 {
            if let Expr::Call { func, args, line: l } = &exprs[0] {
                let (base, open, nfixed) = self.compile_call_setup(func, args, *l)?;
                let b = if open { 0 } else { (nfixed + 1) as u32 };
                self.cur().emit_abc(OpCode::TailCall, base as u32, b, 0, *l);
                self.cur().emit_abc(OpCode::Return, base as u32, 0, 0, *l);
                return Ok(());
            }
            if let Expr::MethodCall { obj, method, args, line: l } = &exprs[0] {
                let (base, open, nfixed) = self.compile_method_call_setup(obj, method, args, *l)?;
                let b = if open { 0 } else { (nfixed + 2) as u32 };
                self.cur().emit_abc(OpCode::TailCall, base as u32, b, 0, *l);
                self.cur().emit_abc(OpCode::Return, base as u32, 0, 0, *l);
                return Ok(());
            }
        }
        let (base, open, nfixed) = self.compile_value_list_open(exprs, line)?;
        let b = if open { 0 } else { (nfixed + 1) as u32 };
        self.cur().emit_abc(OpCode::Return, base as u32, b, 0, line);
        Ok(())
    }

    // ----- expressions -----

    fn compile_expr(&mut self, e: &Expr) -> LuaResult<ExpDesc> {
        match e {
            Expr::Nil(_) => Ok(ExpDesc::Nil),
            Expr::True(_) => Ok(ExpDesc::True),
            Expr::False(_) => Ok(ExpDesc::False),
            Expr::Int(i, _) => Ok(ExpDesc::Int(*i)),
            Expr::Float(f, _) => Ok(ExpDesc::Float(*f)),
            Expr::Str(s, _) => Ok(ExpDesc::Str(LuaString::new(s.clone()))),
            Expr::Name(n, line) => self.resolve(n, *line),
            Expr::Vararg(line) => {
                if !self.cur().is_vararg {
                    return Err(LuaError::Codegen {
                        message: "cannot use '...' outside a vararg function".into(),
                        line: *line,
                    });
                }
                let dst = self.alloc_reg(*line)?;
                self.cur().emit_abc(OpCode::Vararg, dst as u32, 2, 0, *line);
                Ok(ExpDesc::Vararg(dst))
            }
            Expr::Index { obj, key, .. } => {
                let od = self.compile_expr(obj)?;
                let kd = self.compile_expr(key)?;
                Ok(ExpDesc::indexed(od, kd))
            }
            Expr::Paren(inner) => self.compile_expr(inner),
            Expr::Function(body) => self.compile_closure(body),
            Expr::Table { fields, line } => self.compile_table(fields, *line),
            Expr::Call { func, args, line } => {
                let base = self.compile_call_fixed(func, args, *line, 1)?;
                Ok(ExpDesc::Call(base))
            }
            Expr::MethodCall { obj, method, args, line } => {
                let base = self.compile_method_call_fixed(obj, method, args, *line, 1)?;
                Ok(ExpDesc::Call(base))
            }
            Expr::Binop { op, lhs, rhs, line } => self.compile_binop(*op, lhs, rhs, *line),
            Expr::Unop { op, operand, line } => self.compile_unop(*op, operand, *line),
        }
    }

    fn compile_binop_generic(&mut self, opc: OpCode, lhs: &Expr, rhs: &Expr, line: Line) -> LuaResult<ExpDesc> {
        let mark = self.cur().freereg;
        let ld = self.compile_expr(lhs)?;
        let lrk = self.to_rk(ld, line)?;
        let rd = self.compile_expr(rhs)?;
        let rrk = self.to_rk(rd, line)?;
        self.cur().free_to(mark);
        let dst = self.alloc_reg(line)?;
        self.cur().emit_abc(opc, dst as u32, lrk, rrk, line);
        Ok(ExpDesc::Reg(dst))
    }

    fn compile_unop_generic(&mut self, opc: OpCode, operand: &Expr, line: Line) -> LuaResult<ExpDesc> {
        let mark = self.cur().freereg;
        let d = self.compile_expr(operand)?;
        let r = self.to_any_reg(d, line)?;
        self.cur().free_to(mark);
        let dst = self.alloc_reg(line)?;
        self.cur().emit_abc(opc, dst as u32, r as u32, 0, line);
        Ok(ExpDesc::Reg(dst))
    }

    fn compile_concat(&mut self, lhs: &Expr, rhs: &Expr, line: Line) -> LuaResult<ExpDesc> {
        let mark = self.cur().freereg;
        let r0 = self.compile_expr_into_next_reg(lhs, line)?;
        let r1 = self.compile_expr_into_next_reg(rhs, line)?;
        self.cur().free_to(mark);
        let dst = self.alloc_reg(line)?;
        self.cur().emit_abc(OpCode::Concat, dst as u32, r0 as u32, r1 as u32, line);
        Ok(ExpDesc::Reg(dst))
    }

    fn emit_test_jump(&mut self, reg: u8, jump_if: bool, line: Line) -> usize {
        let c = if jump_if { 0 } else { 1 };
        self.cur().emit_abc(OpCode::Test, reg as u32, 0, c, line);
        self.cur().emit_jmp(0, line)
    }

    fn compile_and(&mut self, lhs: &Expr, rhs: &Expr, line: Line) -> LuaResult<ExpDesc> {
        let dst = self.alloc_reg(line)?;
        let ld = self.compile_expr(lhs)?;
        self.discharge_to(ld, dst, line)?;
        self.cur().free_to(dst + 1);
        let jmp = self.emit_test_jump(dst, false, line);
        let rd = self.compile_expr(rhs)?;
        self.discharge_to(rd, dst, line)?;
        self.cur().free_to(dst + 1);
        self.cur().patch_to_here(jmp);
        Ok(ExpDesc::Reg(dst))
    }

    fn compile_or(&mut self, lhs: &Expr, rhs: &Expr, line: Line) -> LuaResult<ExpDesc> {
        let dst = self.alloc_reg(line)?;
        let ld = self.compile_expr(lhs)?;
        self.discharge_to(ld, dst, line)?;
        self.cur().free_to(dst + 1);
        let jmp = self.emit_test_jump(dst, true, line);
        let rd = self.compile_expr(rhs)?;
        self.discharge_to(rd, dst, line)?;
        self.cur().free_to(dst + 1);
        self.cur().patch_to_here(jmp);
        Ok(ExpDesc::Reg(dst))
    }

    /// Emits the RK operands for a relational operator, normalizing
    /// `>`/`>=` to `<`/`<=` with swapped operands (Lua has no native
    /// greater-than opcode).
    fn compare_operands(&mut self, op: BinOp, lhs: &Expr, rhs: &Expr, line: Line) -> LuaResult<(OpCode, u32, u32)> {
        let mark = self.cur().freereg;
        let ld = self.compile_expr(lhs)?;
        let lrk = self.to_rk(ld, line)?;
        let rd = self.compile_expr(rhs)?;
        let rrk = self.to_rk(rd, line)?;
        self.cur().free_to(mark);
        Ok(match op {
            BinOp::Eq | BinOp::Ne => (OpCode::Eq, lrk, rrk),
            BinOp::Lt => (OpCode::Lt, lrk, rrk),
            BinOp::Gt => (OpCode::Lt, rrk, lrk),
            BinOp::Le => (OpCode::Le, lrk, rrk),
            BinOp::Ge => (OpCode::Le, rrk, lrk),
            _ => unreachable!(),
        })
    }

    /// A comparison used as a *value* (not a condition): materializes a
    /// real boolean via the classic four-instruction idiom (compare,
    /// `JMP` to the true branch, `LOADBOOL false` that self-skips, the
    /// true `LOADBOOL`).
    fn compile_compare_value(&mut self, op: BinOp, lhs: &Expr, rhs: &Expr, line: Line) -> LuaResult<ExpDesc> {
        let (opc, b, c) = self.compare_operands(op, lhs, rhs, line)?;
        let a = if op == BinOp::Ne { 0 } else { 1 };
        self.cur().emit_abc(opc, a, b, c, line);
        let jmp_true = self.cur().emit_jmp(0, line);
        let dst = self.alloc_reg(line)?;
        self.cur().emit_abc(OpCode::LoadBool, dst as u32, 0, 1, line);
        let pc_true = self.cur().emit_abc(OpCode::LoadBool, dst as u32, 1, 0, line);
        self.cur().patch_jump(jmp_true, pc_true);
        Ok(ExpDesc::Reg(dst))
    }

    /// Same comparison, compiled directly as a conditional jump (no
    /// register materialized) for use inside `jump_on_true`/`jump_on_false`.
    fn emit_compare_jump(&mut self, op: BinOp, lhs: &Expr, rhs: &Expr, line: Line, want_true: bool) -> LuaResult<Vec<usize>> {
        let (opc, b, c) = self.compare_operands(op, lhs, rhs, line)?;
        let a: u32 = if op == BinOp::Ne {
            if want_true { 0 } else { 1 }
        } else if want_true {
            1
        } else {
            0
        };
        self.cur().emit_abc(opc, a, b, c, line);
        Ok(vec![self.cur().emit_jmp(0, line)])
    }

    fn compile_binop(&mut self, op: BinOp, lhs: &Expr, rhs: &Expr, line: Line) -> LuaResult<ExpDesc> {
        use BinOp::*;
        match op {
            And => self.compile_and(lhs, rhs, line),
            Or => self.compile_or(lhs, rhs, line),
            Eq | Ne | Lt | Le | Gt | Ge => self.compile_compare_value(op, lhs, rhs, line),
            Concat => self.compile_concat(lhs, rhs, line),
            Add => self.compile_binop_generic(OpCode::Add, lhs, rhs, line),
            Sub => self.compile_binop_generic(OpCode::Sub, lhs, rhs, line),
            Mul => self.compile_binop_generic(OpCode::Mul, lhs, rhs, line),
            Div => self.compile_binop_generic(OpCode::Div, lhs, rhs, line),
            IDiv => self.compile_binop_generic(OpCode::IDiv, lhs, rhs, line),
            Mod => self.compile_binop_generic(OpCode::Mod, lhs, rhs, line),
            Pow => self.compile_binop_generic(OpCode::Pow, lhs, rhs, line),
            BAnd => self.compile_binop_generic(OpCode::BAnd, lhs, rhs, line),
            BOr => self.compile_binop_generic(OpCode::BOr, lhs, rhs, line),
            BXor => self.compile_binop_generic(OpCode::BXor, lhs, rhs, line),
            Shl => self.compile_binop_generic(OpCode::Shl, lhs, rhs, line),
            Shr => self.compile_binop_generic(OpCode::Shr, lhs, rhs, line),
        }
    }

    fn compile_unop(&mut self, op: UnOp, operand: &Expr, line: Line) -> LuaResult<ExpDesc> {
        match op {
            UnOp::Not => self.compile_unop_generic(OpCode::Not, operand, line),
            UnOp::Neg => self.compile_unop_generic(OpCode::Unm, operand, line),
            UnOp::Len => self.compile_unop_generic(OpCode::Len, operand, line),
            UnOp::BNot => self.compile_unop_generic(OpCode::BNot, operand, line),
        }
    }

    // ----- boolean conditions (if/while/repeat, and/or short-circuit) -----

    fn jump_on_false(&mut self, e: &Expr) -> LuaResult<Vec<usize>> {
        match e {
            Expr::Paren(inner) => self.jump_on_false(inner),
            Expr::Unop { op: UnOp::Not, operand, .. } => self.jump_on_true(operand),
            Expr::Binop { op: BinOp::And, lhs, rhs, .. } => {
                let mut out = self.jump_on_false(lhs)?;
                out.extend(self.jump_on_false(rhs)?);
                Ok(out)
            }
            Expr::Binop { op: BinOp::Or, lhs, rhs, .. } => {
                let true_jumps = self.jump_on_true(lhs)?;
                let out = self.jump_on_false(rhs)?;
                self.patch_all_to_here(&true_jumps);
                Ok(out)
            }
            Expr::True(_) => Ok(Vec::new()),
            Expr::False(l) | Expr::Nil(l) => Ok(vec![self.cur().emit_jmp(0, *l)]),
            Expr::Binop { op, lhs, rhs, line } if is_comparison(*op) => self.emit_compare_jump(*op, lhs, rhs, *line, false),
            _ => {
                let line = e.line();
                let r = self.compile_expr_to_any_reg(e)?;
                Ok(vec![self.emit_test_jump(r, false, line)])
            }
        }
    }

    fn jump_on_true(&mut self, e: &Expr) -> LuaResult<Vec<usize>> {
        match e {
            Expr::Paren(inner) => self.jump_on_true(inner),
            Expr::Unop { op: UnOp::Not, operand, .. } => self.jump_on_false(operand),
            Expr::Binop { op: BinOp::Or, lhs, rhs, .. } => {
                let mut out = self.jump_on_true(lhs)?;
                out.extend(self.jump_on_true(rhs)?);
                Ok(out)
            }
            Expr::Binop { op: BinOp::And, lhs, rhs, .. } => {
                let false_jumps = self.jump_on_false(lhs)?;
                let out = self.jump_on_true(rhs)?;
                self.patch_all_to_here(&false_jumps);
                Ok(out)
            }
            Expr::False(_) | Expr::Nil(_) => Ok(Vec::new()),
            Expr::True(l) => Ok(vec![self.cur().emit_jmp(0, *l)]),
            Expr::Binop { op, lhs, rhs, line } if is_comparison(*op) => self.emit_compare_jump(*op, lhs, rhs, *line, true),
            _ => {
                let line = e.line();
                let r = self.compile_expr_to_any_reg(e)?;
                Ok(vec![self.emit_test_jump(r, true, line)])
            }
        }
    }

    // ----- control-flow statements -----

    fn compile_if(&mut self, arms: &[(Expr, Block)], else_block: &Option<Block>, line: Line) -> LuaResult<()> {
        let mut end_jumps = Vec::new();
        for (idx, (cond, body)) in arms.iter().enumerate() {
            let false_jumps = self.jump_on_false(cond)?;
            self.cur().enter_block(false);
            self.compile_block(body)?;
            let (nv, huv, breaks) = self.cur().leave_block(line)?;
            self.close_block_if_needed(nv, huv, line);
            self.cur().patch_breaks_to_here(breaks);
            let has_more = idx + 1 < arms.len() || else_block.is_some();
            if has_more {
                end_jumps.push(self.cur().emit_jmp(0, line));
            }
            self.patch_all_to_here(&false_jumps);
        }
        if let Some(eb) = else_block {
            self.cur().enter_block(false);
            self.compile_block(eb)?;
            let (nv, huv, breaks) = self.cur().leave_block(line)?;
            self.close_block_if_needed(nv, huv, line);
            self.cur().patch_breaks_to_here(breaks);
        }
        self.patch_all_to_here(&end_jumps);
        Ok(())
    }

    fn compile_while(&mut self, cond: &Expr, body: &Block, line: Line) -> LuaResult<()> {
        let loop_start = self.cur().pc();
        let false_jumps = self.jump_on_false(cond)?;
        self.cur().enter_block(true);
        self.compile_block(body)?;
        let (nv, huv, breaks) = self.cur().leave_block(line)?;
        self.close_block_if_needed(nv, huv, line);
        let back = self.cur().emit_jmp(0, line);
        self.cur().patch_jump(back, loop_start);
        self.patch_all_to_here(&false_jumps);
        self.cur().patch_breaks_to_here(breaks);
        Ok(())
    }

    fn compile_repeat(&mut self, body: &Block, cond: &Expr, line: Line) -> LuaResult<()> {
        let loop_start = self.cur().pc();
        self.cur().enter_block(true);
        self.compile_block(body)?;
        // `until` sees locals declared in the body — Lua's one scoping
        // exception — so the condition compiles before `leave_block`.
        let false_jumps = self.jump_on_false(cond)?;
        for &pc in &false_jumps {
            self.cur().patch_jump(pc, loop_start);
        }
        let (nv, huv, breaks) = self.cur().leave_block(line)?;
        self.close_block_if_needed(nv, huv, line);
        self.cur().patch_breaks_to_here(breaks);
        Ok(())
    }

    fn compile_numeric_for(
        &mut self,
        var: &str,
        start: &Expr,
        stop: &Expr,
        step: Option<&Expr>,
        body: &Block,
        line: Line,
    ) -> LuaResult<()> {
        self.cur().enter_block(true);
        let base = self.cur().freereg;
        self.compile_expr_into_next_reg(start, line)?;
        self.compile_expr_into_next_reg(stop, line)?;
        match step {
            Some(s) => {
                self.compile_expr_into_next_reg(s, line)?;
            }
            None => {
                let r = self.cur().freereg;
                self.cur().reserve_regs(1, line)?;
                self.load_const(r, Constant::Int(1), line)?;
            }
        }
        self.alloc_reg(line)?; // loop-variable register (r3), filled by FORPREP/FORLOOP
        self.cur().declare_locals_in_place(&[var.to_string()], line)?;

        let forprep_pc = self.cur().emit_asbx(OpCode::ForPrep, base as u32, 0, line);
        self.compile_block(body)?;
        let (nv, huv, breaks) = self.cur().leave_block(line)?;
        self.close_block_if_needed(nv, huv, line);
        let forloop_pc = self.cur().emit_asbx(OpCode::ForLoop, base as u32, 0, line);
        self.cur().patch_jump(forprep_pc, forloop_pc);
        self.cur().patch_jump(forloop_pc, forprep_pc + 1);
        self.cur().patch_breaks_to_here(breaks);
        Ok(())
    }

    fn compile_generic_for(&mut self, names: &[String], exprs: &[Expr], body: &Block, line: Line) -> LuaResult<()> {
        self.cur().enter_block(true);
        let base = self.compile_expr_list_adjusted(exprs, 3, line)?;
        for _ in names {
            self.alloc_reg(line)?;
        }
        self.cur().declare_locals_in_place(names, line)?;

        let prep_jmp = self.cur().emit_jmp(0, line);
        let body_start = self.cur().pc();
        self.compile_block(body)?;
        let (nv, huv, breaks) = self.cur().leave_block(line)?;
        self.close_block_if_needed(nv, huv, line);
        self.cur().patch_to_here(prep_jmp);
        self.cur().emit_abc(OpCode::TForCall, base as u32, 0, names.len() as u32, line);
        let tforloop_pc = self.cur().emit_asbx(OpCode::TForLoop, (base + 2) as u32, 0, line);
        self.cur().patch_jump(tforloop_pc, body_start);
        self.cur().patch_breaks_to_here(breaks);
        Ok(())
    }

    // ----- table constructors -----

    fn emit_setlist(&mut self, dst: u8, count: u32, flush_number: u32, line: Line) {
        if flush_number <= Instruction::MAX_C {
            self.cur().emit_abc(OpCode::SetList, dst as u32, count, flush_number, line);
        } else {
            self.cur().emit_abc(OpCode::SetList, dst as u32, count, 0, line);
            self.cur().emit(Instruction::encode_ax(OpCode::ExtraArg, flush_number), line);
        }
    }

    fn compile_table(&mut self, fields: &[TableField], line: Line) -> LuaResult<ExpDesc> {
        let dst = self.alloc_reg(line)?;
        let narray = fields.iter().filter(|f| matches!(f, TableField::Positional(_))).count();
        let nhash = fields.len() - narray;
        self.cur().emit_abc(
            OpCode::NewTable,
            dst as u32,
            (narray as u32).min(Instruction::MAX_B),
            (nhash as u32).min(Instruction::MAX_C),
            line,
        );
        let mut pending: u32 = 0;
        let mut flush_number: u32 = 0;
        let n = fields.len();
        for (i, f) in fields.iter().enumerate() {
            match f {
                TableField::Positional(e) => {
                    let is_last = i == n - 1;
                    if is_last && e.is_multret() {
                        self.compile_multret_open(e, line)?;
                        flush_number += 1;
                        self.emit_setlist(dst, 0, flush_number, line);
                        self.cur().free_to(dst + 1);
                        pending = 0;
                    } else {
                        self.compile_expr_into_next_reg(e, line)?;
                        pending += 1;
                        if pending as usize == limits::LFIELDS_PER_FLUSH {
                            flush_number += 1;
                            self.emit_setlist(dst, pending, flush_number, line);
                            self.cur().free_to(dst + 1);
                            pending = 0;
                        }
                    }
                }
                TableField::Named(name, e) => {
                    if pending > 0 {
                        flush_number += 1;
                        self.emit_setlist(dst, pending, flush_number, line);
                        self.cur().free_to(dst + 1);
                        pending = 0;
                    }
                    let vd = self.compile_expr(e)?;
                    let vr = self.to_rk(vd, line)?;
                    let kr = self.rk_for_constant(Constant::Str(LuaString::from_str(name)), line)?;
                    self.cur().emit_abc(OpCode::SetTable, dst as u32, kr, vr, line);
                    self.cur().free_to(dst + 1);
                }
                TableField::Indexed(ke, ve) => {
                    if pending > 0 {
                        flush_number += 1;
                        self.emit_setlist(dst, pending, flush_number, line);
                        self.cur().free_to(dst + 1);
                        pending = 0;
                    }
                    let kd = self.compile_expr(ke)?;
                    let kr = self.to_rk(kd, line)?;
                    let vd = self.compile_expr(ve)?;
                    let vr = self.to_rk(vd, line)?;
                    self.cur().emit_abc(OpCode::SetTable, dst as u32, kr, vr, line);
                    self.cur().free_to(dst + 1);
                }
            }
        }
        if pending > 0 {
            flush_number += 1;
            self.emit_setlist(dst, pending, flush_number, line);
            self.cur().free_to(dst + 1);
        }
        Ok(ExpDesc::Reg(dst))
    }

    // ----- functions and closures -----

    fn compile_closure(&mut self, body: &FuncBody) -> LuaResult<ExpDesc> {
        let proto_idx = self.compile_function_body(body)?;
        let dst = self.alloc_reg(body.line)?;
        self.cur().emit_abx(OpCode::Closure, dst as u32, proto_idx, body.line);
        Ok(ExpDesc::Reg(dst))
    }

    fn compile_function_body(&mut self, body: &FuncBody) -> LuaResult<u32> {
        let source = self.funcs[0].source.clone();
        let mut fs = FuncState::new(source, body.is_vararg, body.line);
        fs.last_line_defined = body.end_line;
        fs.num_params = body.params.len() as u8;
        self.funcs.push(fs);
        for p in &body.params {
            self.cur().new_local(p.clone(), body.line)?;
        }
        self.cur().activate_locals(body.params.len());
        self.cur().enter_block(false);
        self.compile_block(&body.body)?;
        let (_, _, _) = self.cur().leave_block(body.end_line)?;
        self.finish_function(body.end_line);
        let fs = self.funcs.pop().expect("nested funcstate");
        let proto = fs.into_prototype();
        let parent = self.cur();
        let idx = parent.protos.len() as u32;
        parent.protos.push(Rc::new(proto));
        Ok(idx)
    }

    fn compile_function_decl(&mut self, name: &FuncName, body: &FuncBody, line: Line) -> LuaResult<()> {
        let mut target = Expr::Name(name.base.clone(), line);
        for seg in &name.path {
            target = Expr::Index {
                obj: Box::new(target),
                key: Box::new(Expr::Str(seg.clone().into_bytes(), line)),
                line,
            };
        }
        if let Some(m) = &name.method {
            target = Expr::Index {
                obj: Box::new(target),
                key: Box::new(Expr::Str(m.clone().into_bytes(), line)),
                line,
            };
        }
        let lv = self.prepare_target(&target, line)?;
        let d = self.compile_closure(body)?;
        let r = self.to_any_reg(d, line)?;
        self.store_target(lv, r, line);
        Ok(())
    }

    fn compile_local_function(&mut self, name: &str, body: &FuncBody, line: Line) -> LuaResult<()> {
        let reg = self.cur().new_local(name.to_string(), line)?;
        self.cur().activate_locals(1);
        let d = self.compile_closure(body)?;
        let closure_reg = self.to_any_reg(d, line)?;
        if closure_reg != reg {
            self.cur().emit_abc(OpCode::Move, reg as u32, closure_reg as u32, 0, line);
        }
        self.cur().free_to(reg + 1);
        Ok(())
    }
}

fn is_comparison(op: BinOp) -> bool {
    matches!(op, BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge)
}
