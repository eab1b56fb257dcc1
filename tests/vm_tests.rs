// Integration tests for the Vesper VM.
//
// These tests run complete programs through the full pipeline (lexer,
// parser, compiler, VM) and assert on captured output or on the escaped
// exception. Covered: expressions and control flow, functions with
// defaults and varargs, closures and upvalue sharing, classes with
// inheritance and super dispatch, collections and the iterator protocol,
// operator dunder methods, unpacking, try/except/ensure semantics and
// the with-statement.

use vesper::{VesperError, Vm};

fn run(src: &str) -> String {
    let mut vm = Vm::new();
    vm.capture_output();
    if let Err(e) = vm.interpret("test.vsp", src) {
        panic!("program failed: {}\nsource:\n{}", e, src);
    }
    assert_eq!(vm.stack_depth(), 0, "operand stack must end empty");
    vm.take_output()
}

fn run_err(src: &str) -> VesperError {
    let mut vm = Vm::new();
    vm.capture_output();
    match vm.interpret("test.vsp", src) {
        Ok(_) => panic!("program unexpectedly succeeded:\n{}", src),
        Err(e) => e,
    }
}

fn runtime_class(err: &VesperError) -> &str {
    match err {
        VesperError::Runtime(r) => &r.class,
        other => panic!("expected runtime error, got {:?}", other),
    }
}

// === The literal end-to-end scenarios ===

#[test]
fn arithmetic_precedence() {
    assert_eq!(run("print(1 + 2 * 3)"), "7\n");
}

#[test]
fn super_dispatch() {
    let src = r#"
        class A fun hi() return "A" end end
        class B is A fun hi() return super() + "B" end end
        print(B().hi())
    "#;
    assert_eq!(run(src), "AB\n");
}

#[test]
fn table_literal_and_field_access() {
    assert_eq!(run("var t = {.name: \"x\", \"k\": 1} ; print(t[\"name\"], t.k)"), "x 1\n");
}

#[test]
fn try_except_binds_the_exception() {
    let src = r#"try raise Exception("boom") except Exception e print(e._err) end"#;
    assert_eq!(run(src), "boom\n");
}

#[test]
fn foreach_over_list() {
    let src = r#"var s = "" ; for var i in [1,2,3] s = s + String(i) end print(s)"#;
    assert_eq!(run(src), "123\n");
}

#[test]
fn closure_counter_shares_its_upvalue() {
    let src = r#"
        fun make()
            var n = 0
            fun inc() n = n + 1 return n end
            return inc
        end
        var c = make()
        print(c(), c(), c())
    "#;
    assert_eq!(run(src), "1 2 3\n");
}

// === Expressions and control flow ===

#[test]
fn string_concatenation_and_equality() {
    assert_eq!(run(r#"print("ab" + "cd" == "abcd")"#), "true\n");
}

#[test]
fn interning_makes_equal_strings_identical() {
    // Equality of objects is identity; equal strings compare equal only
    // because the pool interns them to one object.
    assert_eq!(run(r#"var a = "he" + "llo" print(a == "hello")"#), "true\n");
}

#[test]
fn comparison_operators() {
    assert_eq!(run("print(1 < 2, 2 <= 2, 3 > 4, 4 >= 4)"), "true true false true\n");
}

#[test]
fn string_ordering() {
    assert_eq!(run(r#"print("apple" < "banana")"#), "true\n");
}

#[test]
fn short_circuit_and_or() {
    let src = r#"
        fun boom() raise Exception("should not run") end
        print(false and boom())
        print(true or boom())
        print(null and 1)
        print(2 and 3)
        print(null or "fallback")
    "#;
    assert_eq!(run(src), "false\ntrue\nnull\n3\nfallback\n");
}

#[test]
fn truthiness_in_conditions() {
    let src = r#"
        if 0 then print("zero is truthy") end
        if "" then print("empty is truthy") end
        if null then print("no") else print("null is falsy") end
    "#;
    assert_eq!(run(src), "zero is truthy\nempty is truthy\nnull is falsy\n");
}

#[test]
fn while_loop_with_break_and_continue() {
    let src = r#"
        var total = 0
        var i = 0
        while true
            i = i + 1
            if i > 10 then break end
            if i % 2 == 0 then continue end
            total = total + i
        end
        print(total)
    "#;
    assert_eq!(run(src), "25\n");
}

#[test]
fn c_style_for_loop() {
    let src = r#"
        var s = ""
        for var i = 0; i < 3; i += 1 do
            s = s + String(i)
        end
        print(s)
    "#;
    assert_eq!(run(src), "012\n");
}

#[test]
fn continue_in_for_loop_still_increments() {
    let src = r#"
        var s = ""
        for var i = 0; i < 5; i += 1 do
            if i == 2 then continue end
            s = s + String(i)
        end
        print(s)
    "#;
    assert_eq!(run(src), "0134\n");
}

#[test]
fn nested_loops_break_inner_only() {
    let src = r#"
        var hits = 0
        for var i in [1,2,3]
            for var j in [1,2,3]
                if j == 2 then break end
                hits = hits + 1
            end
        end
        print(hits)
    "#;
    assert_eq!(run(src), "3\n");
}

#[test]
fn elif_chain() {
    let src = r#"
        fun grade(n)
            if n >= 90 then return "A"
            elif n >= 80 then return "B"
            else return "C" end
        end
        print(grade(95), grade(85), grade(70))
    "#;
    assert_eq!(run(src), "A B C\n");
}

#[test]
fn power_is_right_associative() {
    assert_eq!(run("print(2 ^ 3 ^ 2)"), "512\n");
}

#[test]
fn unary_operators() {
    assert_eq!(run("print(-3, !true, !null)"), "-3 false true\n");
}

#[test]
fn len_operator_on_builtin_kinds() {
    assert_eq!(run(r#"print(#"abc", #[1,2], #(1,2,3))"#), "3 2 3\n");
}

#[test]
fn stringify_operator() {
    assert_eq!(run("print(##42 + ##true)"), "42true\n");
}

// === Functions ===

#[test]
fn default_parameters() {
    let src = r#"
        fun greet(name, greeting="hello")
            return greeting + " " + name
        end
        print(greet("world"))
        print(greet("world", "bye"))
    "#;
    assert_eq!(run(src), "hello world\nbye world\n");
}

#[test]
fn vararg_collects_a_tuple() {
    let src = r#"
        fun f(a, ...rest) return #rest end
        print(f(1), f(1,2), f(1,2,3,4))
    "#;
    assert_eq!(run(src), "0 1 3\n");
}

#[test]
fn arity_mismatch_raises_type_exception() {
    let err = run_err("fun f(a, b) return a end f(1)");
    assert_eq!(runtime_class(&err), "TypeException");
    let err = run_err("fun f(a) return a end f(1, 2)");
    assert_eq!(runtime_class(&err), "TypeException");
}

#[test]
fn call_spread_arguments() {
    let src = r#"
        fun add3(a, b, c) return a + b + c end
        var args = [1, 2, 3]
        print(add3(...args))
        print(add3(1, ...(2, 3)))
    "#;
    assert_eq!(run(src), "6\n6\n");
}

#[test]
fn anonymous_functions_are_values() {
    let src = r#"
        var twice = fun(f, x) return f(f(x)) end
        print(twice(fun(n) return n * 3 end, 2))
    "#;
    assert_eq!(run(src), "18\n");
}

#[test]
fn recursion() {
    let src = r#"
        fun fib(n)
            if n < 2 then return n end
            return fib(n - 1) + fib(n - 2)
        end
        print(fib(15))
    "#;
    assert_eq!(run(src), "610\n");
}

#[test]
fn runaway_recursion_overflows() {
    let err = run_err("fun f() return f() end f()");
    assert_eq!(runtime_class(&err), "StackOverflowException");
}

#[test]
fn stack_overflow_is_catchable() {
    let src = r#"
        fun f() return f() end
        try f() except StackOverflowException e print("caught") end
    "#;
    assert_eq!(run(src), "caught\n");
}

// === Closures and upvalues ===

#[test]
fn two_closures_share_one_open_local() {
    let src = r#"
        fun pair()
            var n = 0
            fun bump() n = n + 10 end
            fun read() return n end
            bump()
            print(read())
            return (bump, read)
        end
        var fns = pair()
        fns[0]()
        print(fns[1]())
    "#;
    // While the local is open, writes through one closure are seen by the
    // other; after the frame returns they share the same closed cell.
    assert_eq!(run(src), "10\n20\n");
}

#[test]
fn loop_variable_is_closed_per_iteration() {
    let src = r#"
        var fns = []
        for var i in [1, 2, 3]
            fns.add(fun() return i end)
        end
        print(fns[0](), fns[1](), fns[2]())
    "#;
    assert_eq!(run(src), "1 2 3\n");
}

#[test]
fn static_module_variables_are_captured() {
    let src = r#"
        static var counter = 0
        fun next() counter = counter + 1 return counter end
        print(next(), next())
    "#;
    assert_eq!(run(src), "1 2\n");
}

// === Classes ===

#[test]
fn constructor_implicitly_returns_this() {
    let src = r#"
        class Point
            fun new(x, y)
                this.x = x
                this.y = y
            end
        end
        var p = Point(3, 4)
        print(p.x, p.y)
    "#;
    assert_eq!(run(src), "3 4\n");
}

#[test]
fn method_dispatch_walks_the_super_chain() {
    let src = r#"
        class A
            fun name() return "A" end
            fun describe() return "I am " + this.name() end
        end
        class B is A
            fun name() return "B" end
        end
        print(A().describe(), B().describe())
    "#;
    assert_eq!(run(src), "I am A I am B\n");
}

#[test]
fn super_with_explicit_method_name() {
    let src = r#"
        class A fun tag() return "base" end end
        class B is A
            fun tag() return "own" end
            fun base_tag() return super.tag() end
        end
        print(B().base_tag())
    "#;
    assert_eq!(run(src), "base\n");
}

#[test]
fn bound_methods_are_first_class() {
    let src = r#"
        class Greeter
            fun new(name) this.name = name end
            fun greet() return "hi " + this.name end
        end
        var m = Greeter("ada").greet
        print(m())
    "#;
    assert_eq!(run(src), "hi ada\n");
}

#[test]
fn is_operator_respects_inheritance() {
    let src = r#"
        class A end
        class B is A end
        var b = B()
        print(b is B, b is A, b is Exception)
        print(1 is Number, "s" is String, null is Null)
    "#;
    assert_eq!(run(src), "true true false\ntrue true true\n");
}

#[test]
fn operator_dunder_methods() {
    let src = r#"
        class Vec
            fun new(x, y) this.x = x this.y = y end
            fun __add__(other) return Vec(this.x + other.x, this.y + other.y) end
            fun __eq__(other) return this.x == other.x and this.y == other.y end
            fun __string__() return "Vec(" + String(this.x) + ", " + String(this.y) + ")" end
            fun __len__() return 2 end
        end
        var v = Vec(1, 2) + Vec(3, 4)
        print(v)
        print(v == Vec(4, 6), v == Vec(0, 0))
        print(#v)
    "#;
    assert_eq!(run(src), "Vec(4, 6)\ntrue false\n2\n");
}

#[test]
fn subscript_dunder_methods() {
    let src = r#"
        class Box
            fun new() this.items = {} end
            fun __get__(k) return this.items[k] end
            fun __set__(k, v) this.items[k] = v return this end
        end
        var b = Box()
        b["answer"] = 42
        print(b["answer"])
    "#;
    assert_eq!(run(src), "42\n");
}

#[test]
fn custom_iterator_protocol() {
    let src = r#"
        class Range
            fun new(limit) this.limit = limit end
            fun __iter__(i)
                if i == null then
                    if this.limit > 0 then return 0 end
                    return false
                end
                if i + 1 < this.limit then return i + 1 end
                return false
            end
            fun __next__(i) return i * i end
        end
        var s = ""
        for var sq in Range(4) s = s + String(sq) + "," end
        print(s)
    "#;
    assert_eq!(run(src), "0,1,4,9,\n");
}

#[test]
fn type_builtin_returns_the_class() {
    let src = r#"
        class A end
        print(type(1) == Number, type(A()) == A, type("x") == String)
    "#;
    assert_eq!(run(src), "true true true\n");
}

#[test]
fn calling_a_non_callable_raises() {
    let err = run_err("var x = 5 x()");
    assert_eq!(runtime_class(&err), "TypeException");
}

#[test]
fn missing_method_raises() {
    let err = run_err("class A end A().nope()");
    assert_eq!(runtime_class(&err), "MethodException");
}

#[test]
fn missing_field_raises() {
    let err = run_err("class A end print(A().nope)");
    assert_eq!(runtime_class(&err), "FieldException");
}

#[test]
fn undefined_name_raises() {
    let err = run_err("print(nothing_here)");
    assert_eq!(runtime_class(&err), "NameException");
}

// === Collections ===

#[test]
fn list_operations() {
    let src = r#"
        var l = [1, 2]
        l.add(3)
        l[0] = 10
        print(l, #l)
        print(l.pop())
        print(#l, l)
    "#;
    assert_eq!(run(src), "[10, 2, 3] 3\n3\n2 [10, 2]\n");
}

#[test]
fn list_index_errors() {
    let err = run_err("var l = [1] print(l[5])");
    assert_eq!(runtime_class(&err), "IndexOutOfBoundException");
    let err = run_err("var l = [1] print(l[0.5])");
    assert_eq!(runtime_class(&err), "TypeException");
}

#[test]
fn tuples_are_immutable() {
    let err = run_err("var t = (1, 2) t[0] = 5");
    assert_eq!(runtime_class(&err), "TypeException");
}

#[test]
fn tuple_keys_hash_structurally() {
    let src = r#"
        var t = {}
        t[(1, 2)] = "a"
        print(t[(1, 2)])
    "#;
    assert_eq!(run(src), "a\n");
}

#[test]
fn table_with_mixed_keys() {
    let src = r#"
        var t = {}
        t[1] = "one"
        t[true] = "yes"
        t["k"] = "str"
        print(t[1], t[true], t["k"], #t)
        print(t.contains(1), t.contains(99))
        t.remove(1)
        print(t.contains(1), #t)
    "#;
    assert_eq!(run(src), "one yes str 3\ntrue false\nfalse 2\n");
}

#[test]
fn null_table_key_raises() {
    let err = run_err("var t = {} t[null] = 1");
    assert_eq!(runtime_class(&err), "TypeException");
}

#[test]
fn table_grows_past_tombstones() {
    let src = r#"
        var t = {}
        for var i = 0; i < 100; i += 1 do t[i] = i * 2 end
        for var i = 0; i < 50; i += 1 do t.remove(i) end
        var sum = 0
        for var k in t sum = sum + t[k] end
        print(#t, sum)
    "#;
    // Keys 50..99 remain: sum of 2k = 2 * (50+...+99) = 7450.
    assert_eq!(run(src), "50 7450\n");
}

#[test]
fn foreach_over_string_yields_bytes() {
    let src = r#"
        var out = ""
        for var c in "abc" out = out + c + "." end
        print(out)
    "#;
    assert_eq!(run(src), "a.b.c.\n");
}

#[test]
fn string_subscript() {
    assert_eq!(run(r#"print("hello"[1])"#), "e\n");
}

#[test]
fn number_conversion_and_is_int() {
    let src = r#"
        print(Number("3.5") + 0.5)
        print(3.isInt(), 3.5.isInt())
    "#;
    assert_eq!(run(src), "4\ntrue false\n");
    let err = run_err(r#"Number("abc")"#);
    assert_eq!(runtime_class(&err), "InvalidArgException");
}

#[test]
fn string_escape_round_trips() {
    let src = "print(\"a\\nb\\t\".escape())";
    assert_eq!(run(src), "a\\nb\\t\n");
}

// === Unpacking ===

#[test]
fn const_unpack_of_literals() {
    // The comma list on the right binds positionally without materializing
    // a tuple.
    let src = r#"
        var a = 0 var b = 0
        var x = 1 var y = 2
        a, b = x, y
        print(a, b)
    "#;
    assert_eq!(run(src), "1 2\n");
}

#[test]
fn parenthesized_unpack_targets() {
    let src = r#"
        var a = 0 var b = 0
        (a, b) = (10, 20)
        print(a, b)
    "#;
    assert_eq!(run(src), "10 20\n");
}

#[test]
fn unpack_declaration_from_literals() {
    assert_eq!(run("var a, b, c = 1, 2, 3 print(a, b, c)"), "1 2 3\n");
    assert_eq!(run("var a, b = [10, 20] print(a, b)"), "10 20\n");
}

#[test]
fn unpack_from_function_result() {
    let src = r#"
        fun minmax(l)
            var lo = l[0] var hi = l[0]
            for var v in l
                if v < lo then lo = v end
                if v > hi then hi = v end
            end
            return (lo, hi)
        end
        var lo, hi = minmax([5, 1, 9, 3])
        print(lo, hi)
    "#;
    assert_eq!(run(src), "1 9\n");
}

#[test]
fn unpack_swap_order() {
    // Elements bind positionally even though targets assign in reverse.
    let src = r#"
        var a = 1 var b = 2
        a, b = b, a
        print(a, b)
    "#;
    assert_eq!(run(src), "2 1\n");
}

#[test]
fn unpack_size_mismatch_raises() {
    let err = run_err("var a, b = (1, 2, 3) print(a)");
    assert_eq!(runtime_class(&err), "TypeException");
}

#[test]
fn compound_assignment_forms() {
    let src = r#"
        var x = 10
        x += 5 x -= 3 x *= 2 x /= 4 x %= 4
        print(x)
    "#;
    assert_eq!(run(src), "2\n");
}

#[test]
fn compound_assignment_on_subscript() {
    let src = r#"
        var l = [1, 2]
        l[0] += 100
        var t = {.n: 5}
        t.n += 1
        print(l[0], t.n)
    "#;
    assert_eq!(run(src), "101 6\n");
}

// === Exceptions ===

#[test]
fn except_clauses_match_in_order() {
    let src = r#"
        fun classify(make)
            try
                raise make()
            except TypeException e
                return "type"
            except Exception e
                return "base"
            end
        end
        print(classify(fun() return TypeException("t") end))
        print(classify(fun() return NameException("n") end))
    "#;
    assert_eq!(run(src), "type\nbase\n");
}

#[test]
fn unmatched_exception_propagates() {
    let src = r#"
        try
            try raise NameException("inner") except TypeException e print("wrong") end
        except NameException e
            print("outer caught", e._err)
        end
    "#;
    assert_eq!(run(src), "outer caught inner\n");
}

#[test]
fn ensure_runs_on_both_paths() {
    let src = r#"
        fun attempt(fail)
            try
                if fail then raise Exception("no") end
                print("body")
            except Exception e
                print("handler")
            ensure
                print("ensure")
            end
        end
        attempt(false)
        attempt(true)
    "#;
    assert_eq!(run(src), "body\nensure\nhandler\nensure\n");
}

#[test]
fn ensure_without_except_reraises() {
    let src = r#"
        fun f()
            try
                raise TypeException("kept")
            ensure
                print("cleanup")
            end
        end
        try f() except TypeException e print("outer", e._err) end
    "#;
    assert_eq!(run(src), "cleanup\nouter kept\n");
}

#[test]
fn exception_in_except_body_reaches_outer_handler() {
    let src = r#"
        try
            try
                raise Exception("first")
            except Exception e
                raise NameException("second")
            end
        except NameException e
            print(e._err)
        end
    "#;
    assert_eq!(run(src), "second\n");
}

#[test]
fn exceptions_unwind_across_frames() {
    let src = r#"
        fun deep(n)
            if n == 0 then raise Exception("bottom") end
            return deep(n - 1)
        end
        try deep(5) except Exception e print(e._err) end
    "#;
    assert_eq!(run(src), "bottom\n");
}

#[test]
fn raising_a_non_exception_is_a_type_error() {
    let err = run_err("raise 42");
    assert_eq!(runtime_class(&err), "TypeException");
}

#[test]
fn explicit_cause_chain_renders() {
    let src = r#"
        try raise Exception("root") except Exception e
            raise TypeException("wrapper", e)
        end
    "#;
    let err = run_err(src);
    match err {
        VesperError::Runtime(r) => {
            assert_eq!(r.class, "TypeException");
            assert!(r.traceback.contains("Exception: root"));
            assert!(r.traceback.contains("Above Exception caused:"));
            assert!(r.traceback.contains("TypeException: wrapper"));
        }
        other => panic!("expected runtime error, got {:?}", other),
    }
}

#[test]
fn unhandled_exception_has_a_traceback() {
    let src = r#"
        fun inner() raise Exception("unhandled") end
        fun outer() inner() end
        outer()
    "#;
    let err = run_err(src);
    match err {
        VesperError::Runtime(r) => {
            assert_eq!(r.class, "Exception");
            assert_eq!(r.message, "unhandled");
            assert!(r.traceback.contains("Traceback (most recent call last):"));
            assert!(r.traceback.contains("error in __main__.outer()"));
            assert!(r.traceback.contains("error in __main__.inner()"));
            // Most recent call last: inner is on a later line than outer.
            let outer_at = r.traceback.find("outer()").unwrap();
            let inner_at = r.traceback.find("inner()").unwrap();
            assert!(outer_at < inner_at);
        }
        other => panic!("expected runtime error, got {:?}", other),
    }
}

#[test]
fn repeated_frames_collapse_in_traceback() {
    let src = r#"
        fun spin(n)
            if n == 0 then raise Exception("done") end
            return spin(n - 1)
        end
        spin(40)
    "#;
    let err = run_err(src);
    match err {
        VesperError::Runtime(r) => {
            assert!(r.traceback.contains("[Previous line repeated"));
        }
        other => panic!("expected runtime error, got {:?}", other),
    }
}

#[test]
fn assert_builtin() {
    assert_eq!(run(r#"assert(1 < 2) print("ok")"#), "ok\n");
    let err = run_err(r#"assert(false, "nope")"#);
    match err {
        VesperError::Runtime(r) => {
            assert_eq!(r.class, "AssertException");
            assert_eq!(r.message, "nope");
        }
        other => panic!("expected runtime error, got {:?}", other),
    }
}

// === with-statement ===

#[test]
fn with_closes_the_resource() {
    let src = r#"
        class Res
            fun new(log) this.log = log end
            fun close() this.log.add("closed") end
        end
        var log = []
        with Res(log) r
            log.add("used")
        end
        print(log)
    "#;
    assert_eq!(run(src), "[used, closed]\n");
}

#[test]
fn with_closes_on_exception_and_reraises() {
    let src = r#"
        class Res
            fun new() end
            fun close() print("closed") end
        end
        try
            with Res() r
                raise Exception("inside")
            end
        except Exception e
            print("caught", e._err)
        end
    "#;
    assert_eq!(run(src), "closed\ncaught inside\n");
}

#[test]
fn with_null_resource_skips_close() {
    let src = r#"
        with null r print("body") end
        print("after")
    "#;
    assert_eq!(run(src), "body\nafter\n");
}

// === Modules ===

#[test]
fn import_from_search_path() {
    use std::io::Write;
    let dir = tempfile::tempdir().unwrap();
    let mod_path = dir.path().join("mathlib.vsp");
    let mut f = std::fs::File::create(&mod_path).unwrap();
    writeln!(
        f,
        "var tau = 6.28\nfun double(x) return x * 2 end\nclass Acc\n fun new() this.n = 0 end\n fun bump() this.n = this.n + 1 return this.n end\nend"
    )
    .unwrap();
    drop(f);

    let mut vm = Vm::new();
    vm.capture_output();
    vm.add_search_path(dir.path());
    let src = r#"
        import mathlib
        print(mathlib.tau)
        print(mathlib.double(21))
        import mathlib for double
        print(double(5))
        import mathlib as m
        print(m.tau)
        var a = mathlib.Acc()
        print(a.bump(), a.bump())
    "#;
    vm.interpret("test.vsp", src).expect("import program should run");
    assert_eq!(vm.take_output(), "6.28\n42\n10\n6.28\n1 2\n");
}

#[test]
fn missing_import_raises() {
    let err = run_err("import does_not_exist");
    assert_eq!(runtime_class(&err), "ImportException");
}

#[test]
fn modules_are_cached_across_imports() {
    use std::io::Write;
    let dir = tempfile::tempdir().unwrap();
    let mod_path = dir.path().join("once.vsp");
    let mut f = std::fs::File::create(&mod_path).unwrap();
    writeln!(f, "print(\"loading\")").unwrap();
    drop(f);

    let mut vm = Vm::new();
    vm.capture_output();
    vm.add_search_path(dir.path());
    vm.interpret("test.vsp", "import once import once import once").unwrap();
    assert_eq!(vm.take_output(), "loading\n");
}

// === Interrupts ===

#[test]
fn interrupt_flag_raises_program_interrupt() {
    let mut vm = Vm::new();
    vm.capture_output();
    vm.interrupt_flag().store(true, std::sync::atomic::Ordering::Relaxed);
    let src = r#"
        try
            while true end
        except ProgramInterrupt e
            print("interrupted")
        end
    "#;
    vm.interpret("test.vsp", src).unwrap();
    assert_eq!(vm.take_output(), "interrupted\n");
}

// === Compile errors from the boundary list ===

#[test]
fn boundary_compile_errors() {
    for (src, needle) in [
        ("break", "outside of a loop"),
        ("continue", "outside of a loop"),
        ("return 1", "top-level"),
        ("class A fun new() return 5 end end", "constructor"),
        ("while true try break ensure end end", "across a try block"),
        ("begin var x = x end", "initializer"),
    ] {
        let mut vm = Vm::new();
        match vm.interpret("test.vsp", src) {
            Err(VesperError::Compile(d)) => {
                assert!(d.message.contains(needle), "{}: {}", src, d.message)
            }
            other => panic!("expected compile error for {:?}, got {:?}", src, other),
        }
    }
}

#[test]
fn syntax_errors_are_reported_with_lines() {
    let mut vm = Vm::new();
    match vm.interpret("test.vsp", "var = 3") {
        Err(VesperError::Syntax(diags)) => {
            assert!(!diags.is_empty());
            assert_eq!(diags[0].line, 1);
        }
        other => panic!("expected syntax error, got {:?}", other),
    }
}
