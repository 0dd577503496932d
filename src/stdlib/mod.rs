//! The ten required builtins, registered into `_G` by `LuaVM::open_libs`.
//! Each is a plain `NativeFunction` closure over the VM, the same shape
//! `value::function::NativeFn` defines.

use std::io::Write;
use std::rc::Rc;

use crate::error::{LuaResult, RuntimeError};
use crate::value::{LuaValue, NativeFunction};
use crate::vm::LuaVM;

pub fn install(vm: &mut LuaVM) {
    register(vm, "print", lua_print);
    register(vm, "type", lua_type);
    register(vm, "tostring", lua_tostring);
    register(vm, "getmetatable", lua_getmetatable);
    register(vm, "setmetatable", lua_setmetatable);
    register(vm, "pairs", lua_pairs);
    register(vm, "ipairs", lua_ipairs);
    register(vm, "next", lua_next);
    register(vm, "error", lua_error);
    register(vm, "pcall", lua_pcall);
}

fn register(
    vm: &mut LuaVM,
    name: &'static str,
    f: impl Fn(&mut LuaVM, Vec<LuaValue>) -> Result<Vec<LuaValue>, crate::error::LuaError> + 'static,
) {
    let native = Rc::new(NativeFunction::new(name, f));
    vm.globals.borrow_mut().set_str(name, LuaValue::Native(native));
}

fn arg(args: &[LuaValue], i: usize) -> LuaValue {
    args.get(i).cloned().unwrap_or(LuaValue::Nil)
}

/// `print(...)`: writes every argument's `tostring` form, tab-separated,
/// newline-terminated, to the VM's output sink.
fn lua_print(vm: &mut LuaVM, args: Vec<LuaValue>) -> LuaResult<Vec<LuaValue>> {
    let mut line = Vec::new();
    for (i, v) in args.iter().enumerate() {
        if i > 0 {
            line.push(b'\t');
        }
        let s = vm.tostring(v)?;
        line.extend_from_slice(s.as_bytes());
    }
    line.push(b'\n');
    let out = vm.output();
    let _ = out.borrow_mut().write_all(&line);
    Ok(Vec::new())
}

fn lua_type(_vm: &mut LuaVM, args: Vec<LuaValue>) -> LuaResult<Vec<LuaValue>> {
    Ok(vec![LuaValue::from_str(arg(&args, 0).type_name())])
}

fn lua_tostring(vm: &mut LuaVM, args: Vec<LuaValue>) -> LuaResult<Vec<LuaValue>> {
    let s = vm.tostring(&arg(&args, 0))?;
    Ok(vec![LuaValue::Str(s)])
}

/// `getmetatable(t)`: returns `t`'s metatable, or the value of its
/// `__metatable` field when set (a protected metatable hides itself),
/// or `nil` for anything without one.
fn lua_getmetatable(_vm: &mut LuaVM, args: Vec<LuaValue>) -> LuaResult<Vec<LuaValue>> {
    let Some(t) = arg(&args, 0).as_table().cloned() else {
        return Ok(vec![LuaValue::Nil]);
    };
    let mt = t.borrow().metatable.clone();
    let Some(mt) = mt else { return Ok(vec![LuaValue::Nil]) };
    let protected = mt.borrow().get_str("__metatable");
    if !matches!(protected, LuaValue::Nil) {
        Ok(vec![protected])
    } else {
        Ok(vec![LuaValue::Table(mt)])
    }
}

/// `setmetatable(t, m)`: `m` must be a table or `nil`; raises if the
/// current metatable is protected via `__metatable`.
fn lua_setmetatable(vm: &mut LuaVM, args: Vec<LuaValue>) -> LuaResult<Vec<LuaValue>> {
    let t0 = arg(&args, 0);
    let Some(t) = t0.as_table().cloned() else {
        return Err(runtime_error(vm, "bad argument #1 to 'setmetatable' (table expected)"));
    };
    if let Some(existing) = t.borrow().metatable.clone() {
        if !matches!(existing.borrow().get_str("__metatable"), LuaValue::Nil) {
            return Err(runtime_error(vm, "cannot change a protected metatable"));
        }
    }
    match arg(&args, 1) {
        LuaValue::Nil => t.borrow_mut().metatable = None,
        LuaValue::Table(m) => t.borrow_mut().metatable = Some(m),
        _ => return Err(runtime_error(vm, "bad argument #2 to 'setmetatable' (nil or table expected)")),
    }
    Ok(vec![t0])
}

/// `pairs(t)`: `(next, t, nil)`, so a `for k, v in pairs(t) do` loop
/// drives `TFORCALL`/`TFORLOOP` against plain `next`. Ignores any
/// `__pairs` metamethod — not part of the required set.
fn lua_pairs(_vm: &mut LuaVM, args: Vec<LuaValue>) -> LuaResult<Vec<LuaValue>> {
    let t = arg(&args, 0);
    Ok(vec![LuaValue::Native(Rc::new(NativeFunction::new("next", next_impl))), t, LuaValue::Nil])
}

/// `ipairs(t)`: `(iterator, t, 0)`, where the iterator stops at the
/// first `nil` array element.
fn lua_ipairs(_vm: &mut LuaVM, args: Vec<LuaValue>) -> LuaResult<Vec<LuaValue>> {
    let t = arg(&args, 0);
    Ok(vec![LuaValue::Native(Rc::new(NativeFunction::new("ipairs_iterator", ipairs_iterator))), t, LuaValue::Int(0)])
}

fn ipairs_iterator(vm: &mut LuaVM, args: Vec<LuaValue>) -> LuaResult<Vec<LuaValue>> {
    let t = arg(&args, 0);
    let i = match arg(&args, 1) {
        LuaValue::Int(i) => i,
        other => other.as_f64().map(|f| f as i64).unwrap_or(0),
    } + 1;
    let Some(table) = t.as_table() else {
        return Err(runtime_error(vm, "bad argument #1 to 'ipairs' (table expected)"));
    };
    let v = table.borrow().get(&LuaValue::Int(i));
    if matches!(v, LuaValue::Nil) {
        Ok(vec![LuaValue::Nil])
    } else {
        Ok(vec![LuaValue::Int(i), v])
    }
}

fn lua_next(vm: &mut LuaVM, args: Vec<LuaValue>) -> LuaResult<Vec<LuaValue>> {
    next_impl(vm, args)
}

fn next_impl(vm: &mut LuaVM, args: Vec<LuaValue>) -> LuaResult<Vec<LuaValue>> {
    let t = arg(&args, 0);
    let key = arg(&args, 1);
    let Some(table) = t.as_table() else {
        return Err(runtime_error(vm, "bad argument #1 to 'next' (table expected)"));
    };
    match table.borrow().next_entry(&key) {
        Ok(Some((k, v))) => Ok(vec![k, v]),
        Ok(None) => Ok(vec![LuaValue::Nil]),
        Err(()) => Err(runtime_error(vm, "invalid key to 'next'")),
    }
}

/// `error(message [, level])`: raises `message` as a `LuaError::Runtime`
/// carrying the exact value so `pcall` can hand it back unmodified.
/// `level` (default `1`) selects which live Lua frame's `source:line:`
/// prefix to attach when `message` is a string; `level = 0` attaches
/// none.
fn lua_error(vm: &mut LuaVM, args: Vec<LuaValue>) -> LuaResult<Vec<LuaValue>> {
    let value = arg(&args, 0);
    let level = match arg(&args, 1) {
        LuaValue::Nil => 1i64,
        other => other.as_f64().map(|f| f as i64).unwrap_or(1),
    };
    let message = match &value {
        LuaValue::Str(s) if level > 0 => {
            let loc = vm.error_location((level - 1) as usize).unwrap_or_default();
            format!("{}{}", loc, s.to_string_lossy())
        }
        other => String::from_utf8_lossy(&crate::vm::default_tostring(other)).into_owned(),
    };
    Err(RuntimeError::with_value(message, value).into())
}

/// `pcall(f, ...)`: calls `f` with the remaining arguments, catching any
/// `RuntimeError` and unwinding back to this call's frame depth (spec
/// §4.7 "pcall", §5 "pcall is the only unwinding mechanism").
fn lua_pcall(vm: &mut LuaVM, mut args: Vec<LuaValue>) -> LuaResult<Vec<LuaValue>> {
    if args.is_empty() {
        return Err(runtime_error(vm, "bad argument #1 to 'pcall' (value expected)"));
    }
    let f = args.remove(0);
    Ok(vm.protected_call(f, args))
}

fn runtime_error(vm: &LuaVM, msg: &str) -> crate::error::LuaError {
    vm.make_runtime_error(msg)
}
