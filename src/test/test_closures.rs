use super::run_and_capture;

#[test]
fn counter_closure_shares_upvalue() {
    let out = run_and_capture(
        r#"
        local function f(x)
            return function()
                x = x + 1
                return x
            end
        end
        local g = f(0)
        print(g(), g(), g())
        "#,
    );
    assert_eq!(out, "1\t2\t3\n");
}

#[test]
fn two_closures_share_the_same_upvalue_until_scope_exits() {
    let out = run_and_capture(
        r#"
        local inc, get
        do
            local x = 0
            inc = function() x = x + 1 end
            get = function() return x end
        end
        inc()
        inc()
        print(get())
        inc()
        print(get())
        "#,
    );
    assert_eq!(out, "2\n3\n");
}

#[test]
fn closures_over_loop_variable_are_independent() {
    let out = run_and_capture(
        r#"
        local fns = {}
        for i = 1, 3 do
            fns[i] = function() return i end
        end
        print(fns[1](), fns[2](), fns[3]())
        "#,
    );
    assert_eq!(out, "1\t2\t3\n");
}

#[test]
fn recursive_local_function_upvalues_itself() {
    let out = run_and_capture(
        r#"
        local function fib(n)
            if n < 2 then return n end
            return fib(n - 1) + fib(n - 2)
        end
        print(fib(10))
        "#,
    );
    assert_eq!(out, "55\n");
}

#[test]
fn tail_call_does_not_overflow_deep_recursion() {
    let out = run_and_capture(
        r#"
        local function loop(n, acc)
            if n == 0 then return acc end
            return loop(n - 1, acc + 1)
        end
        print(loop(200000, 0))
        "#,
    );
    assert_eq!(out, "200000\n");
}
