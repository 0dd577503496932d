//! String/number coercion tests: only arithmetic/concatenation coercion
//! and `tostring`, since there is no string library here.

use super::run_and_capture;

#[test]
fn concatenation_coerces_numbers_to_strings() {
    let out = run_and_capture(
        r#"
        print(1 .. 2)
        print("n=" .. 5)
        print(1.5 .. "x")
        "#,
    );
    assert_eq!(out, "12\nn=5\n1.5x\n");
}

#[test]
fn arithmetic_coerces_numeric_strings() {
    let out = run_and_capture(
        r#"
        print("10" + "5")
        print("3" * "4")
        print("10" - 1)
        "#,
    );
    assert_eq!(out, "15\n12\n9\n");
}

#[test]
fn non_numeric_string_arithmetic_raises() {
    let out = run_and_capture(
        r#"
        local ok, err = pcall(function() return "abc" + 1 end)
        print(ok)
        "#,
    );
    assert_eq!(out, "false\n");
}

#[test]
fn tostring_formats_each_type() {
    let out = run_and_capture(
        r#"
        print(tostring(nil))
        print(tostring(true))
        print(tostring(false))
        print(tostring(42))
        print(tostring(1.5))
        print(tostring("hi"))
        "#,
    );
    assert_eq!(out, "nil\ntrue\nfalse\n42\n1.5\nhi\n");
}

#[test]
fn equality_between_string_and_number_is_false() {
    let out = run_and_capture(r#"print("1" == 1)"#);
    assert_eq!(out, "false\n");
}

#[test]
fn type_of_coercible_string_is_still_string() {
    let out = run_and_capture(r#"print(type("10"))"#);
    assert_eq!(out, "string\n");
}
