// File: tests/e2e.rs
//
// End-to-end scenarios run against `interpret()`, one fresh `Vm` per
// test. The teacher's own integration suite checks interpreter results
// rather than literal captured process stdout (it has no `gag`-style
// output-capture dependency); here `Vm::with_output` plus `SharedOutput`
// plays the same role without redirecting the real stdout, so these
// tests pin the exact values a program printed, not just whether it ran.

use lumen::vm::{InterpretError, SharedOutput, Vm};

/// Runs `source` against a fresh `Vm`, returning the interpreter result
/// alongside everything it printed.
fn run(source: &str) -> (Result<(), InterpretError>, String) {
    let output = SharedOutput::new();
    let mut vm = Vm::with_output(Box::new(output.clone()));
    let result = vm.interpret(source);
    (result, output.contents())
}

fn runtime_error_message(result: &Result<(), InterpretError>) -> &str {
    match result {
        Err(InterpretError::Runtime(message)) => message,
        _ => panic!("expected a runtime error"),
    }
}

fn is_compile_error(result: &Result<(), InterpretError>) -> bool {
    matches!(result, Err(InterpretError::Compile))
}

#[test]
fn arithmetic_precedence_and_grouping() {
    let (result, output) = run("print 1 + 2 * 3;");
    assert!(result.is_ok());
    assert_eq!(output, "7\n");
}

#[test]
fn string_concatenation() {
    let source = r#"
        var a = "foo";
        var b = "bar";
        print a + b;
    "#;
    let (result, output) = run(source);
    assert!(result.is_ok());
    assert_eq!(output, "foobar\n");
}

#[test]
fn lexical_scoping_shadows_outer_variable() {
    let source = r#"
        var x = "outer";
        {
            var x = "inner";
            print x;
        }
        print x;
    "#;
    let (result, output) = run(source);
    assert!(result.is_ok());
    assert_eq!(output, "inner\nouter\n");
}

#[test]
fn closures_share_state_across_calls() {
    let source = r#"
        fun mk() {
            var x = 1;
            fun inc() {
                x = x + 1;
                return x;
            }
            return inc;
        }
        var f = mk();
        print f();
        print f();
        print f();
    "#;
    let (result, output) = run(source);
    assert!(result.is_ok());
    assert_eq!(output, "2\n3\n4\n");
}

#[test]
fn single_inheritance_with_super_call() {
    let source = r#"
        class Shape {
            area() { return 0; }
            describe() { return "shape"; }
        }
        class Square < Shape {
            init(side) { this.side = side; }
            area() { return this.side * this.side; }
            describe() { return "square: " + super.describe(); }
        }
        var s = Square(4);
        print s.area();
        print s.describe();
    "#;
    let (result, output) = run(source);
    assert!(result.is_ok());
    assert_eq!(output, "16\nsquare: shape\n");
}

#[test]
fn constructor_argument_flows_through_super_init() {
    let source = r#"
        class A {
            init(n) { this.n = n; }
        }
        class B < A {
            init(n) { super.init(n); }
        }
        print B(7).n;
    "#;
    let (result, output) = run(source);
    assert!(result.is_ok());
    assert_eq!(output, "7\n");
}

#[test]
fn methods_and_fields_round_trip() {
    let source = r#"
        class Counter {
            init() { this.value = 0; }
            bump() { this.value = this.value + 1; return this.value; }
        }
        var c = Counter();
        c.bump();
        c.bump();
        print c.value;
    "#;
    let (result, output) = run(source);
    assert!(result.is_ok());
    assert_eq!(output, "2\n");
}

#[test]
fn method_calls_on_a_plain_instance() {
    let source = r#"
        class A {
            greet() { print "hi"; }
        }
        var a = A();
        a.greet();
    "#;
    let (result, output) = run(source);
    assert!(result.is_ok());
    assert_eq!(output, "hi\n");
}

#[test]
fn for_loop_with_break_and_continue() {
    let source = r#"
        var total = 0;
        for (var i = 0; i < 20; i = i + 1) {
            if (i == 10) { break; }
            if (i % 2 == 0) { continue; }
            total = total + i;
        }
        print total;
    "#;
    let (result, output) = run(source);
    assert!(result.is_ok());
    // odd numbers from 1..9: 1+3+5+7+9 = 25
    assert_eq!(output, "25\n");
}

#[test]
fn while_loop_accumulates() {
    let source = r#"
        var i = 0;
        var sum = 0;
        while (i < 100) {
            sum = sum + i;
            i = i + 1;
        }
        print sum;
    "#;
    let (result, output) = run(source);
    assert!(result.is_ok());
    assert_eq!(output, "4950\n");
}

#[test]
fn recursive_function_computes_fibonacci() {
    let source = r#"
        fun fib(n) {
            if (n < 2) return n;
            return fib(n - 1) + fib(n - 2);
        }
        print fib(10);
    "#;
    let (result, output) = run(source);
    assert!(result.is_ok());
    assert_eq!(output, "55\n");
}

#[test]
fn clock_native_is_callable() {
    let (result, output) = run("print clock() >= 0;");
    assert!(result.is_ok());
    assert_eq!(output, "true\n");
}

#[test]
fn adding_a_number_to_a_string_is_a_runtime_error() {
    let (result, _) = run(r#"print 1 + "a";"#);
    assert!(matches!(result, Err(InterpretError::Runtime(_))));
}

#[test]
fn calling_undefined_global_is_a_runtime_error() {
    let (result, _) = run("doesNotExist();");
    let message = runtime_error_message(&result);
    assert!(message.contains("Undefined variable 'doesNotExist'"), "{}", message);
}

#[test]
fn reading_undefined_variable_reports_its_name() {
    let (result, _) = run("print undefined;");
    let message = runtime_error_message(&result);
    assert!(message.contains("Undefined variable 'undefined'"), "{}", message);
}

#[test]
fn reading_a_local_in_its_own_initializer_is_a_compile_error() {
    let source = r#"
        {
            var a = a;
        }
    "#;
    let (result, _) = run(source);
    assert!(is_compile_error(&result));
}

#[test]
fn malformed_syntax_is_a_compile_error() {
    let (result, _) = run("var = ;");
    assert!(is_compile_error(&result));
}

#[test]
fn accessing_field_on_a_number_is_a_runtime_error() {
    let (result, _) = run("var x = 1; print x.field;");
    let message = runtime_error_message(&result);
    assert!(message.contains("Only instances have properties."), "{}", message);
}

#[test]
fn deep_recursion_overflows_the_frame_stack() {
    let source = r#"
        fun recurse(n) {
            return recurse(n + 1);
        }
        recurse(0);
    "#;
    let (result, _) = run(source);
    let message = runtime_error_message(&result);
    assert!(message.contains("Stack overflow"), "{}", message);
}

#[test]
fn allocating_many_instances_triggers_collection_without_crashing() {
    let source = r#"
        class Node {
            init(value) { this.value = value; }
        }
        var last = nil;
        for (var i = 0; i < 20000; i = i + 1) {
            last = Node(i);
        }
        print last.value;
    "#;
    let (result, output) = run(source);
    assert!(result.is_ok());
    assert_eq!(output, "19999\n");
}
