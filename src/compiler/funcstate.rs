//! Per-function compiler state: register allocator, locals table,
//! upvalue table, constant pool, and jump-patch bookkeeping.

use std::rc::Rc;

use crate::error::{Line, LuaError, LuaResult};
use crate::limits;
use crate::value::{Constant, Prototype, UpvalDesc};
use crate::vm::opcode::{Instruction, OpCode};

/// A local variable's bookkeeping entry. `attrib` tolerates Lua 5.4-style
/// `<const>`/`<close>` attributes parsed-and-ignored by the parser; Lua
/// 5.3 has no attribute semantics to apply here.
#[derive(Debug, Clone)]
pub struct LocalVar {
    pub name: String,
    pub register: u8,
}

/// One entry of a block's pending-jump list: the pc of a `JMP`
/// instruction whose target is not yet known.
#[derive(Debug, Clone, Copy)]
pub struct PendingJump {
    pub pc: usize,
}

#[derive(Debug, Clone)]
struct LabelEntry {
    name: String,
    pc: usize,
    nactvar: usize,
}

#[derive(Debug, Clone)]
struct GotoEntry {
    name: String,
    pc: usize,
    nactvar: usize,
    line: Line,
}

/// A lexical block. Tracks which locals were active on entry (so they
/// can be popped on exit), whether it's a loop body (so `break` knows
/// where to attach), and the label/goto entries declared directly in it.
struct BlockCtx {
    nactvar_on_entry: usize,
    is_loop: bool,
    break_list: Vec<PendingJump>,
    labels: Vec<LabelEntry>,
    /// gotos (including pending `break`s, which compile to an anonymous
    /// goto to a synthetic end-of-loop label) still unresolved when this
    /// block closes, to be retried against the enclosing block.
    pending_gotos: Vec<GotoEntry>,
    has_upvalue_capture: bool,
}

pub struct FuncState {
    pub num_params: u8,
    pub is_vararg: bool,
    pub code: Vec<u32>,
    pub line_info: Vec<u32>,
    pub constants: Vec<Constant>,
    pub upvalues: Vec<UpvalDesc>,
    upvalue_names: Vec<String>,
    pub protos: Vec<Rc<Prototype>>,
    locals: Vec<LocalVar>,
    /// Number of currently active locals (`nactvar` in Lua's compiler).
    pub nactvar: usize,
    /// High-water mark of registers used; becomes `maxStackSize`.
    max_stack: u8,
    /// Next free register (`freereg`); normally equal to `nactvar` plus
    /// however many temporaries are currently live.
    pub freereg: u8,
    blocks: Vec<BlockCtx>,
    pub source: String,
    pub line_defined: u32,
    pub last_line_defined: u32,
    pub local_debug_names: Vec<String>,
}

impl FuncState {
    pub fn new(source: String, is_vararg: bool, line_defined: u32) -> Self {
        FuncState {
            num_params: 0,
            is_vararg,
            code: Vec::new(),
            line_info: Vec::new(),
            constants: Vec::new(),
            upvalues: Vec::new(),
            upvalue_names: Vec::new(),
            protos: Vec::new(),
            locals: Vec::new(),
            nactvar: 0,
            max_stack: 2,
            freereg: 0,
            blocks: Vec::new(),
            source,
            line_defined,
            last_line_defined: line_defined,
            local_debug_names: Vec::new(),
        }
    }

    // ----- registers -----------------------------------------------------

    pub fn reserve_regs(&mut self, n: u8, line: Line) -> LuaResult<()> {
        self.check_stack(n, line)?;
        self.freereg += n;
        Ok(())
    }

    fn check_stack(&mut self, extra: u8, line: Line) -> LuaResult<()> {
        let needed = self.freereg as u32 + extra as u32;
        if needed > 250 {
            return Err(LuaError::Codegen {
                message: "function or expression needs too many registers".into(),
                line,
            });
        }
        if needed as u8 > self.max_stack {
            self.max_stack = needed as u8;
        }
        Ok(())
    }

    /// Frees registers above `nactvar` down to `to` (a free-list
    /// discipline without an actual free list: temporaries are always
    /// freed in reverse allocation order, so `freereg` alone suffices).
    pub fn free_to(&mut self, to: u8) {
        if to < self.freereg {
            self.freereg = to;
        }
    }

    pub fn free_reg(&mut self, r: u8) {
        if r >= self.nactvar as u8 && r == self.freereg - 1 {
            self.freereg -= 1;
        }
    }

    // ----- locals ----------------------------------------------------

    pub fn new_local(&mut self, name: String, line: Line) -> LuaResult<u8> {
        if self.locals.len() >= limits::MAX_LOCALS {
            return Err(LuaError::Codegen {
                message: "too many local variables".into(),
                line,
            });
        }
        let reg = self.freereg;
        self.reserve_regs(1, line)?;
        self.local_debug_names.push(name.clone());
        self.locals.push(LocalVar {
            name,
            register: reg,
        });
        Ok(reg)
    }

    /// Activates the most recently declared `count` locals (Lua declares
    /// a local's name before its initializer runs, but it only becomes
    /// visible to name lookups once activated at the end of the
    /// declaring statement).
    pub fn activate_locals(&mut self, count: usize) {
        self.nactvar += count;
    }

    pub fn local_count(&self) -> usize {
        self.locals.len()
    }

    /// Declares `names` as locals occupying the registers already
    /// reserved for them — the trailing `names.len()` registers below
    /// `freereg` — without allocating anew. Used after evaluating a
    /// `local` statement's initializer list directly into the
    /// registers its names will own.
    pub fn declare_locals_in_place(&mut self, names: &[String], line: Line) -> LuaResult<()> {
        if self.locals.len() + names.len() > limits::MAX_LOCALS {
            return Err(LuaError::Codegen {
                message: "too many local variables".into(),
                line,
            });
        }
        let base = self.freereg - names.len() as u8;
        for (i, name) in names.iter().enumerate() {
            self.local_debug_names.push(name.clone());
            self.locals.push(LocalVar {
                name: name.clone(),
                register: base + i as u8,
            });
        }
        self.activate_locals(names.len());
        Ok(())
    }

    /// Pops locals back to `count`, closing any that had been captured
    /// as upvalues by emitting a `CLOSE` at the caller's request site.
    pub fn remove_locals_to(&mut self, count: usize) {
        while self.locals.len() > count {
            self.locals.pop();
        }
        if count < self.nactvar {
            self.nactvar = count;
        }
        self.freereg = self.nactvar as u8;
    }

    pub fn resolve_local(&self, name: &str) -> Option<u8> {
        self.locals[..self.nactvar]
            .iter()
            .rposition(|l| l.name == name)
            .map(|i| self.locals[i].register)
    }

    // ----- upvalues ----------------------------------------------------

    pub fn find_upvalue(&self, name: &str) -> Option<u8> {
        self.upvalue_names.iter().position(|n| n == name).map(|i| i as u8)
    }

    pub fn add_upvalue(&mut self, name: String, in_stack: bool, index: u32, line: Line) -> LuaResult<u8> {
        if self.upvalues.len() >= limits::MAX_UPVALUES {
            return Err(LuaError::Codegen {
                message: "too many upvalues".into(),
                line,
            });
        }
        self.upvalues.push(UpvalDesc {
            in_stack,
            index,
            name: None,
        });
        self.upvalue_names.push(name);
        Ok((self.upvalues.len() - 1) as u8)
    }

    // ----- constants ----------------------------------------------------

    pub fn add_constant(&mut self, k: Constant, line: Line) -> LuaResult<u32> {
        if let Some(i) = self.constants.iter().position(|existing| const_eq(existing, &k)) {
            return Ok(i as u32);
        }
        if self.constants.len() >= limits::MAX_CONSTANTS {
            return Err(LuaError::Codegen {
                message: "too many constants".into(),
                line,
            });
        }
        self.constants.push(k);
        Ok((self.constants.len() - 1) as u32)
    }

    // ----- emission ----------------------------------------------------

    pub fn emit(&mut self, instr: u32, line: Line) -> usize {
        self.code.push(instr);
        self.line_info.push(line);
        self.code.len() - 1
    }

    pub fn emit_abc(&mut self, op: OpCode, a: u32, b: u32, c: u32, line: Line) -> usize {
        self.emit(Instruction::encode_abc(op, a, b, c), line)
    }

    pub fn emit_abx(&mut self, op: OpCode, a: u32, bx: u32, line: Line) -> usize {
        self.emit(Instruction::encode_abx(op, a, bx), line)
    }

    pub fn emit_asbx(&mut self, op: OpCode, a: u32, sbx: i32, line: Line) -> usize {
        self.emit(Instruction::encode_asbx(op, a, sbx), line)
    }

    pub fn emit_jmp(&mut self, a: u32, line: Line) -> usize {
        self.emit_asbx(OpCode::Jmp, a, 0, line)
    }

    pub fn pc(&self) -> usize {
        self.code.len()
    }

    /// Patches a previously-emitted `JMP`'s offset to target the current pc.
    pub fn patch_to_here(&mut self, jump_pc: usize) {
        self.patch_jump(jump_pc, self.pc());
    }

    pub fn patch_jump(&mut self, jump_pc: usize, target_pc: usize) {
        let offset = target_pc as i32 - (jump_pc as i32 + 1);
        Instruction::set_sbx(&mut self.code[jump_pc], offset);
    }

    // ----- blocks, break, goto/label ----------------------------------

    pub fn enter_block(&mut self, is_loop: bool) {
        self.blocks.push(BlockCtx {
            nactvar_on_entry: self.nactvar,
            is_loop,
            break_list: Vec::new(),
            labels: Vec::new(),
            pending_gotos: Vec::new(),
            has_upvalue_capture: false,
        });
    }

    /// Closes the innermost block. Returns the block's resolved
    /// `nactvar_on_entry` (so the caller can emit a close-on-`JMP` for
    /// captured locals if `has_upvalue_capture` is set), that flag, and
    /// the block's `break` jump list — NOT yet patched, since a loop's
    /// back edge is emitted by the caller *after* this returns and
    /// `break` must land after that back edge, not before it. Also
    /// re-raises any still-unresolved gotos to the parent block (or a
    /// final undefined-label error if this was the outermost block).
    pub fn leave_block(&mut self, line: Line) -> LuaResult<(usize, bool, Vec<PendingJump>)> {
        let block = self.blocks.pop().expect("unbalanced block stack");
        if let Some(parent) = self.blocks.last_mut() {
            parent.pending_gotos.extend(block.pending_gotos);
        } else if let Some(g) = block.pending_gotos.first() {
            return Err(LuaError::Codegen {
                message: format!("no visible label '{}' for goto", g.name),
                line: g.line,
            });
        }
        self.remove_locals_to(block.nactvar_on_entry);
        Ok((block.nactvar_on_entry, block.has_upvalue_capture, block.break_list))
    }

    /// Patches a block's deferred `break` jump list (see `leave_block`)
    /// to the current pc.
    pub fn patch_breaks_to_here(&mut self, breaks: Vec<PendingJump>) {
        for jmp in breaks {
            self.patch_to_here(jmp.pc);
        }
    }

    pub fn add_break(&mut self, line: Line) -> LuaResult<()> {
        if !self.blocks.iter().any(|b| b.is_loop) {
            return Err(LuaError::Codegen {
                message: "break outside a loop".into(),
                line,
            });
        }
        let a = self.close_threshold();
        let pc = self.emit_jmp(a, line);
        for b in self.blocks.iter_mut().rev() {
            if b.is_loop {
                b.break_list.push(PendingJump { pc });
                break;
            }
        }
        Ok(())
    }

    /// `A` operand for a block-exiting `JMP`: `nactvar+1` if the block
    /// captured an upvalue (so the jump also closes it), else `0` (no
    /// close performed). Exposed for callers (numeric/generic `for`,
    /// `while`/`repeat` back-edges) that emit their own block-exiting
    /// jumps outside of `add_break`.
    pub fn close_threshold(&self) -> u32 {
        if self.blocks.iter().any(|b| b.has_upvalue_capture) {
            self.nactvar as u32 + 1
        } else {
            0
        }
    }

    pub fn mark_upvalue_capture(&mut self) {
        if let Some(b) = self.blocks.last_mut() {
            b.has_upvalue_capture = true;
        }
    }

    pub fn define_label(&mut self, name: String, line: Line) -> LuaResult<()> {
        let pc = self.pc();
        let nactvar = self.nactvar;
        {
            let block = self.blocks.last_mut().expect("label outside any block");
            if block.labels.iter().any(|l| l.name == name) {
                return Err(LuaError::Codegen {
                    message: format!("label '{}' already defined in this block", name),
                    line,
                });
            }
            block.labels.push(LabelEntry { name: name.clone(), pc, nactvar });
        }
        // Retry any pending gotos in this same block against the new label.
        self.resolve_pending_gotos_in_current_block(&name, pc, nactvar)?;
        Ok(())
    }

    fn resolve_pending_gotos_in_current_block(
        &mut self,
        name: &str,
        pc: usize,
        nactvar: usize,
    ) -> LuaResult<()> {
        let block = self.blocks.last_mut().expect("goto outside any block");
        let mut remaining = Vec::new();
        for g in block.pending_gotos.drain(..) {
            if g.name == name {
                if g.nactvar < nactvar {
                    return Err(LuaError::Codegen {
                        message: format!("goto '{}' jumps into the scope of a local variable", name),
                        line: g.line,
                    });
                }
                self.patch_jump(g.pc, pc);
            } else {
                remaining.push(g);
            }
        }
        block.pending_gotos = remaining;
        Ok(())
    }

    pub fn add_goto(&mut self, name: String, line: Line) -> LuaResult<()> {
        // Search from the innermost block outward for an already-defined
        // label (covers backward jumps and jumps to an enclosing block).
        for b in self.blocks.iter().rev() {
            if let Some(l) = b.labels.iter().find(|l| l.name == name) {
                if l.nactvar < self.nactvar {
                    return Err(LuaError::Codegen {
                        message: format!("goto '{}' jumps into the scope of a local variable", name),
                        line,
                    });
                }
                let pc = self.emit_jmp(0, line);
                self.patch_jump(pc, l.pc);
                return Ok(());
            }
        }
        // Not yet defined: record as pending against the current block,
        // to be matched by a later `define_label` in this or an
        // enclosing block (forward jump), or reported undefined once the
        // outermost block closes.
        let nactvar = self.nactvar;
        let pc = self.emit_jmp(0, line);
        let block = self.blocks.last_mut().expect("goto outside any block");
        block.pending_gotos.push(GotoEntry { name, pc, nactvar, line });
        Ok(())
    }

    pub fn into_prototype(self) -> Prototype {
        Prototype {
            num_params: self.num_params,
            is_vararg: self.is_vararg,
            max_stack_size: self.max_stack.max(2),
            code: self.code,
            constants: self.constants,
            upvalues: self.upvalues,
            protos: self.protos,
            line_info: self.line_info,
            source: self.source,
            line_defined: self.line_defined,
            last_line_defined: self.last_line_defined,
            local_names: self.local_debug_names,
        }
    }
}

fn const_eq(a: &Constant, b: &Constant) -> bool {
    use Constant::*;
    match (a, b) {
        (Nil, Nil) => true,
        (Bool(x), Bool(y)) => x == y,
        (Int(x), Int(y)) => x == y,
        (Float(x), Float(y)) => x.to_bits() == y.to_bits(),
        (Str(x), Str(y)) => x == y,
        _ => false,
    }
}
