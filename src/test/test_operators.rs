use super::run_and_capture;

#[test]
fn integer_addition_stays_integer() {
    let out = run_and_capture(
        r#"
        print(type(1+1))
        print(1+1)
        "#,
    );
    assert_eq!(out, "number\n2\n");
}

#[test]
fn float_addition_stays_float() {
    let out = run_and_capture("print(1+1.0)");
    assert_eq!(out, "2.0\n");
}

#[test]
fn int_float_equality_and_floor_division() {
    let out = run_and_capture(
        r#"
        print(1 == 1.0)
        print(1.0 // 1)
        print(1 // 1)
        "#,
    );
    assert_eq!(out, "true\n1.0\n1\n");
}

#[test]
fn integer_overflow_wraps() {
    let out = run_and_capture("print(9223372036854775807 + 1)");
    assert_eq!(out, "-9223372036854775808\n");
}

#[test]
fn string_number_coercion() {
    let out = run_and_capture(
        r#"
        print("3" + 4)
        print(1 .. 2)
        "#,
    );
    assert_eq!(out, "7\n12\n");
}

#[test]
fn relational_operators() {
    let out = run_and_capture(
        r#"
        print(1 < 2, 2 < 1, 2 <= 2, "a" < "b")
        "#,
    );
    assert_eq!(out, "true\tfalse\ttrue\ttrue\n");
}

#[test]
fn logical_and_or_short_circuit() {
    let out = run_and_capture(
        r#"
        print(false and error("should not run"))
        print(true or error("should not run"))
        print(1 and 2)
        print(nil or 3)
        "#,
    );
    assert_eq!(out, "false\ntrue\n2\n3\n");
}

#[test]
fn bitwise_operators() {
    let out = run_and_capture(
        r#"
        print(5 & 3)
        print(5 | 2)
        print(5 ~ 1)
        print(~0)
        print(1 << 4)
        print(256 >> 4)
        "#,
    );
    assert_eq!(out, "1\n7\n4\n-1\n16\n16\n");
}

#[test]
fn metamethod_add_dispatch() {
    let out = run_and_capture(
        r#"
        local mt = {__add = function(a, b) return "X" end}
        local a = setmetatable({}, mt)
        print(a + 1)
        "#,
    );
    assert_eq!(out, "X\n");
}

#[test]
fn metamethod_lt_and_le_fallback() {
    let out = run_and_capture(
        r#"
        local mt = {__lt = function(a, b) return true end}
        local a = setmetatable({}, mt)
        local b = setmetatable({}, mt)
        print(a < b)
        print(a <= b)
        "#,
    );
    assert_eq!(out, "true\nfalse\n");
}

#[test]
fn pcall_catches_runtime_error_with_location() {
    let out = run_and_capture(
        r#"
        local ok, err = pcall(function() error("boom") end)
        print(ok, err)
        "#,
    );
    assert!(out.starts_with("false\t"));
    assert!(out.trim_end().ends_with(": boom"));
}

#[test]
fn pcall_returns_all_results_on_success() {
    let out = run_and_capture(
        r#"
        local function f() return 1, 2, 3 end
        print(pcall(f))
        "#,
    );
    assert_eq!(out, "true\t1\t2\t3\n");
}
