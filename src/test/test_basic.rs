use super::{global, run_and_capture, run_and_capture_with_vm};
use crate::value::LuaValue;

#[test]
fn print_single_number() {
    assert_eq!(run_and_capture("print(1+2)"), "3\n");
}

#[test]
fn print_tab_separated_arguments() {
    let out = run_and_capture("local t={10,20,30}; print(#t, t[2])");
    assert_eq!(out, "3\t20\n");
}

#[test]
fn numeric_for_loop() {
    assert_eq!(run_and_capture("for i=1,3 do print(i) end"), "1\n2\n3\n");
}

#[test]
fn local_function_and_recursion() {
    let out = run_and_capture(
        r#"
        local function fact(n)
            if n <= 1 then return 1 end
            return n * fact(n - 1)
        end
        print(fact(6))
        "#,
    );
    assert_eq!(out, "720\n");
}

#[test]
fn multiple_assignment_and_varargs() {
    let out = run_and_capture(
        r#"
        local function pair() return 1, 2 end
        local a, b, c = pair()
        print(a, b, c)

        local function sum(...)
            local args = {...}
            local s = 0
            for i, v in ipairs(args) do
                s = s + v
            end
            return s
        end
        print(sum(1, 2, 3, 4))
        "#,
    );
    assert_eq!(out, "1\t2\tnil\n10\n");
}

#[test]
fn generic_for_over_ipairs() {
    let out = run_and_capture(
        r#"
        local t = {"a", "b", "c"}
        for i, v in ipairs(t) do
            print(i, v)
        end
        "#,
    );
    assert_eq!(out, "1\ta\n2\tb\n3\tc\n");
}

#[test]
fn while_and_repeat_loops() {
    let out = run_and_capture(
        r#"
        local i = 0
        while i < 3 do
            i = i + 1
        end
        print(i)

        local j = 0
        repeat
            j = j + 1
        until j >= 3
        print(j)
        "#,
    );
    assert_eq!(out, "3\n3\n");
}

#[test]
fn global_assignment_is_visible_on_the_vm_after_execution() {
    let (vm, out) = run_and_capture_with_vm(
        r#"
        counter = 41
        counter = counter + 1
        print(counter)
        "#,
    );
    assert_eq!(out, "42\n");
    assert!(matches!(global(&vm, "counter"), LuaValue::Int(42)));
}

#[test]
fn nested_tables_and_field_access() {
    let out = run_and_capture(
        r#"
        local t = { inner = { value = 42 } }
        print(t.inner.value)
        t.inner.value = 99
        print(t["inner"]["value"])
        "#,
    );
    assert_eq!(out, "42\n99\n");
}
