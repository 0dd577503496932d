//! A Lua 5.3 front end, `.luac` binary chunk reader, and register-based
//! virtual machine.
//!
//! `run`/`run_binary` are the quickest way in: compile or load a chunk,
//! install the builtin library, and execute it to completion against a
//! fresh [`vm::LuaVM`]. Anything beyond a single one-shot script — a
//! persistent global table across multiple chunks, a redirected `print`
//! sink, an embedder driving `pcall` directly — should build a [`vm::LuaVM`]
//! and call its methods instead.

#[cfg(test)]
mod test;

pub mod bytecode;
pub mod compiler;
pub mod error;
pub mod lexer;
pub mod limits;
pub mod parser;
pub mod stdlib;
pub mod value;
pub mod vm;

pub use error::{LuaError, LuaResult};
pub use value::LuaValue;
pub use vm::LuaVM;

/// Compiles `source` as a chunk named `chunk_name`, installs the builtin
/// library, and runs it to completion, returning whatever the chunk's
/// implicit top-level `return` produced.
pub fn run(source: &[u8], chunk_name: &str) -> LuaResult<Vec<LuaValue>> {
    let mut vm = LuaVM::new();
    vm.open_libs();
    run_with_vm(&mut vm, source, chunk_name)
}

/// Same as [`run`], but reuses a caller-supplied [`LuaVM`] — its global
/// table and any builtins already installed on it carry over.
pub fn run_with_vm(vm: &mut LuaVM, source: &[u8], chunk_name: &str) -> LuaResult<Vec<LuaValue>> {
    let proto = vm.compile(source, chunk_name)?;
    vm.execute(proto)
}

/// Loads a precompiled `.luac` binary chunk, installs the builtin
/// library, and runs it to completion.
pub fn run_binary(bytes: &[u8]) -> LuaResult<Vec<LuaValue>> {
    let mut vm = LuaVM::new();
    vm.open_libs();
    let proto = vm.load_binary(bytes)?;
    vm.execute(proto)
}
