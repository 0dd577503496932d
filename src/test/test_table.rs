use super::run_and_capture;

#[test]
fn length_of_contiguous_array() {
    let out = run_and_capture(
        r#"
        local t = {1, 2, 3, 4, 5}
        print(#t)
        "#,
    );
    assert_eq!(out, "5\n");
}

#[test]
fn length_after_removing_the_last_element() {
    let out = run_and_capture(
        r#"
        local t = {1, 2, 3}
        t[3] = nil
        print(#t)
        "#,
    );
    assert_eq!(out, "2\n");
}

#[test]
fn mixed_array_and_hash_parts() {
    let out = run_and_capture(
        r#"
        local t = {10, 20, 30, name = "lua"}
        print(#t, t.name, t[1])
        "#,
    );
    assert_eq!(out, "3\tlua\t10\n");
}

#[test]
fn pairs_visits_every_entry() {
    let out = run_and_capture(
        r#"
        local t = {1, 2, x = "y"}
        local count = 0
        for k, v in pairs(t) do
            count = count + 1
        end
        print(count)
        "#,
    );
    assert_eq!(out, "3\n");
}

#[test]
fn next_without_a_key_starts_iteration() {
    let out = run_and_capture(
        r#"
        local t = {7, 8, 9}
        local k, v = next(t)
        print(k, v)
        "#,
    );
    assert_eq!(out, "1\t7\n");
}

#[test]
fn nested_assignment_through_indexing() {
    let out = run_and_capture(
        r#"
        local t = {}
        t[1] = {}
        t[1][1] = "deep"
        print(t[1][1])
        "#,
    );
    assert_eq!(out, "deep\n");
}

#[test]
fn metamethod_index_fallback() {
    let out = run_and_capture(
        r#"
        local base = {greet = "hi"}
        local t = setmetatable({}, {__index = base})
        print(t.greet)
        "#,
    );
    assert_eq!(out, "hi\n");
}

#[test]
fn metamethod_newindex_function() {
    let out = run_and_capture(
        r#"
        local log = {}
        local t = setmetatable({}, {__newindex = function(tbl, k, v)
            log[#log + 1] = k
        end})
        t.a = 1
        t.b = 2
        print(log[1], log[2])
        "#,
    );
    assert_eq!(out, "a\tb\n");
}

#[test]
fn protected_metatable_blocks_setmetatable() {
    let out = run_and_capture(
        r#"
        local t = setmetatable({}, {__metatable = "locked"})
        print(getmetatable(t))
        local ok = pcall(setmetatable, t, {})
        print(ok)
        "#,
    );
    assert_eq!(out, "locked\nfalse\n");
}
