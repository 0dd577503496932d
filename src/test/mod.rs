//! Integration-style tests driving `LuaVM::execute` end to end, split
//! into one module per area of concern.

mod test_basic;
mod test_closures;
mod test_operators;
mod test_string;
mod test_table;

use std::cell::RefCell;
use std::rc::Rc;

use crate::value::LuaValue;
use crate::LuaVM;

/// Compiles and runs `source` against a fresh VM with the builtin
/// library installed, returning whatever `print` wrote to stdout.
pub(crate) fn run_and_capture(source: &str) -> String {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut vm = LuaVM::new();
    vm.open_libs();
    let sink = Rc::new(RefCell::new(Vec::new()));
    vm.set_output(sink.clone());
    let proto = vm.compile(source.as_bytes(), "test").expect("compile");
    vm.execute(proto).expect("execute");
    String::from_utf8(sink.borrow().clone()).expect("utf8 output")
}

/// Like [`run_and_capture`], but hands back the VM alongside the output
/// so a test can keep driving it (e.g. inspecting globals afterward).
pub(crate) fn run_and_capture_with_vm(source: &str) -> (LuaVM, String) {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut vm = LuaVM::new();
    vm.open_libs();
    let sink = Rc::new(RefCell::new(Vec::new()));
    vm.set_output(sink.clone());
    let proto = vm.compile(source.as_bytes(), "test").expect("compile");
    vm.execute(proto).expect("execute");
    let out = String::from_utf8(sink.borrow().clone()).expect("utf8 output");
    (vm, out)
}

pub(crate) fn global(vm: &LuaVM, name: &str) -> LuaValue {
    vm.globals.borrow().get_str(name)
}
