//! End-to-end scenarios: compile real programs and check their output

use limit_runtime::{NullRuntime, Value, Vm};
use limitc::{Compilation, CompilerOptions};

/// Compile source, run `main`, and return the printed lines
fn run_program(source: &str) -> Vec<String> {
    let mut compilation = Compilation::new(CompilerOptions::default());
    let output = compilation.compile_source("main", source);
    assert!(
        !compilation.sink.has_errors(),
        "compile errors: {:?}",
        compilation.sink.iter().collect::<Vec<_>>()
    );
    let lir = output.lir.expect("LIR should be generated");
    lir.validate().expect("generated LIR must validate");

    let runtime = NullRuntime::new();
    let mut vm = Vm::new(&lir, &runtime);
    vm.capture_output();
    vm.run("main", vec![]).expect("program should run");
    vm.take_output()
}

fn expect_compile_error(source: &str, code: u16) {
    let mut compilation = Compilation::new(CompilerOptions::default());
    let _ = compilation.compile_source("main", source);
    assert!(
        compilation
            .sink
            .iter()
            .any(|d| d.code == code && d.is_error()),
        "expected E{:03}, got: {:?}",
        code,
        compilation.sink.iter().collect::<Vec<_>>()
    );
}

#[test]
fn hello_and_interpolation() {
    let output = run_program(
        r#"
var name: str = "World";
print("Hello, {name}!");
"#,
    );
    assert_eq!(output, vec!["Hello, World!"]);
}

#[test]
fn unified_optional_propagation() {
    let output = run_program(
        r#"
fn to_int(s: str): int? {
    if (s == "10") { return ok(10); }
    return err();
}
fn plus_two(s: str): int? {
    var n: int = to_int(s)?;
    return ok(n + 2);
}
match plus_two("10") { Ok(v) => print("got {v}"), Err => print("none") }
match plus_two("x")  { Ok(v) => print("got {v}"), Err => print("none") }
"#,
    );
    assert_eq!(output, vec!["got 12", "none"]);
}

#[test]
fn recover_with_fallback() {
    let output = run_program(
        r#"
fn div(a: int, b: int): int? {
    if (b == 0) { return err(); }
    return ok(a / b);
}
var v: int = div(10, 0) ? else e { print("caught"); return 0; };
print(v);
"#,
    );
    assert_eq!(output, vec!["caught", "0"]);
}

#[test]
fn recover_success_path_skips_handler() {
    let output = run_program(
        r#"
fn div(a: int, b: int): int? {
    if (b == 0) { return err(); }
    return ok(a / b);
}
var v: int = div(10, 2) ? else e { print("caught"); return 0; };
print(v);
"#,
    );
    assert_eq!(output, vec!["5"]);
}

#[test]
fn inheritance_and_virtual_dispatch() {
    let output = run_program(
        r#"
class A { fn name(): str { return "A"; } }
class B : A { fn name(): str { return "B"; } }
var items: [A] = [A(), B()];
iter (x in items) { print(x.name()); }
"#,
    );
    assert_eq!(output, vec!["A", "B"]);
}

#[test]
fn super_call_extends_parent() {
    let output = run_program(
        r#"
class A { fn name(): str { return "A"; } }
class B : A { fn name(): str { return super.name() + "!"; } }
print(B().name());
"#,
    );
    assert_eq!(output, vec!["A!"]);
}

#[test]
fn visibility_regimes_independent() {
    use std::fs;
    let dir = tempfile::tempdir().unwrap();
    fs::write(
        dir.path().join("m1.lm"),
        "pub class K { pub fn hi(): str { return \"hi\"; } }\nvar secret: int = 1;\n",
    )
    .unwrap();
    fs::write(
        dir.path().join("main.lm"),
        "import m1;\nprint(m1.K().hi());\nprint(m1.secret);\n",
    )
    .unwrap();

    let mut compilation = Compilation::new(CompilerOptions::default());
    let output = compilation
        .compile_file(&dir.path().join("main.lm"))
        .unwrap();
    // The private module member is rejected; the public class member
    // is not. Visibility errors block execution, not LIR generation.
    assert!(compilation
        .sink
        .iter()
        .any(|d| d.code == limitc::codes::NON_PUBLIC_MODULE_MEMBER));
    assert!(!compilation
        .sink
        .iter()
        .any(|d| d.code == limitc::codes::PRIVATE_CLASS_MEMBER));
    assert!(output.lir.is_some());
    assert!(!output.executable);
}

#[test]
fn exhaustiveness_failure_rejected() {
    expect_compile_error(
        r#"
type Color = Red | Green | Blue;
var c: Color = Red;
match c { Red => print("r"), Green => print("g") }
"#,
        limitc::codes::NON_EXHAUSTIVE_MATCH,
    );
}

#[test]
fn loops_and_control_flow() {
    let output = run_program(
        r#"
var total: int = 0;
for (var i: int = 0; i < 10; i = i + 1) {
    if (i % 2 == 0) { continue; }
    total = total + i;
}
print(total);
iter (x in 1..4) { print("{x}"); }
var n: int = 0;
while (n < 2) { n = n + 1; }
print(n);
loop { break; }
print("done");
"#,
    );
    assert_eq!(output, vec!["25", "1", "2", "3", "2", "done"]);
}

#[test]
fn string_operations() {
    let output = run_program(
        r#"
var a: str = "foo" + "bar";
print(a);
print(len(a));
print(str(12) + "!");
"#,
    );
    assert_eq!(output, vec!["foobar", "6", "12!"]);
}

#[test]
fn lists_and_dicts() {
    let output = run_program(
        r#"
var xs: [int] = [10, 20, 30];
print(xs[1]);
xs[1] = 21;
print(xs[1]);
print(len(xs));
var ages: {str: int} = {"ada": 36};
print(ages["ada"]);
"#,
    );
    assert_eq!(output, vec!["20", "21", "3", "36"]);
}

#[test]
fn match_guards_and_literals() {
    let output = run_program(
        r#"
var x: int = 7;
match x {
    n where n < 0 => print("negative"),
    0 => print("zero"),
    _ => print("positive"),
}
"#,
    );
    assert_eq!(output, vec!["positive"]);
}

#[test]
fn enum_matching() {
    let output = run_program(
        r#"
type Color = Red | Green | Blue;
var c: Color = Green;
match c { Red => print("r"), Green => print("g"), Blue => print("b") }
"#,
    );
    assert_eq!(output, vec!["g"]);
}

#[test]
fn closures_capture_environment() {
    let output = run_program(
        r#"
fn make(): int {
    var base: int = 10;
    fn bump(n: int): int { return base + n; }
    return bump(5);
}
print(make());
"#,
    );
    assert_eq!(output, vec!["15"]);
}

#[test]
fn destruction_order_is_deterministic() {
    let source = r#"
fn work(): str {
    var first: str = "a";
    var second: str = "b";
    print(first + second);
    return "done";
}
print(work());
"#;
    let trace_of = |source: &str| {
        let mut compilation = Compilation::new(CompilerOptions::default());
        let output = compilation.compile_source("main", source);
        assert!(!compilation.sink.has_errors());
        let lir = output.lir.unwrap();
        let runtime = NullRuntime::new();
        let mut vm = Vm::new(&lir, &runtime);
        vm.capture_output();
        vm.run("main", vec![]).unwrap();
        vm.take_region_trace()
    };
    let first = trace_of(source);
    let second = trace_of(source);
    assert_eq!(first, second);
    assert!(!first.is_empty());
}

#[test]
fn error_propagation_releases_regions() {
    // The failing path must still produce release/exit events for the
    // regions it unwinds
    let source = r#"
fn fail(): int? { return err(); }
fn outer(): int? {
    var held: str = "resource";
    var n: int = fail()?;
    print(held);
    return ok(n);
}
match outer() { Ok(v) => print("got {v}"), Err => print("failed") }
"#;
    let mut compilation = Compilation::new(CompilerOptions::default());
    let output = compilation.compile_source("main", source);
    assert!(!compilation.sink.has_errors());
    let lir = output.lir.unwrap();
    let runtime = NullRuntime::new();
    let mut vm = Vm::new(&lir, &runtime);
    vm.capture_output();
    vm.run("main", vec![]).unwrap();
    assert_eq!(vm.take_output(), vec!["failed"]);
    let trace = vm.take_region_trace();
    assert!(trace
        .iter()
        .any(|e| matches!(e, limit_runtime::region::RegionEvent::Release(_))));
}

#[test]
fn runtime_division_by_zero_faults() {
    let source = r#"
var a: int = 10;
var b: int = 0;
print(a / b);
"#;
    let mut compilation = Compilation::new(CompilerOptions::default());
    let output = compilation.compile_source("main", source);
    assert!(!compilation.sink.has_errors());
    let lir = output.lir.unwrap();
    let runtime = NullRuntime::new();
    let mut vm = Vm::new(&lir, &runtime);
    vm.capture_output();
    let result = vm.run("main", vec![]);
    assert_eq!(result, Err(limit_runtime::VmError::DivisionByZero));
}

#[test]
fn fluent_self_type_setter() {
    let output = run_program(
        r#"
class Counter {
    var count: int = 0;
    fn bump(): Self { self.count = self.count + 1; return self; }
    fn value(): int { return self.count; }
}
print(Counter().bump().bump().value());
"#,
    );
    assert_eq!(output, vec!["2"]);
}

#[test]
fn init_runs_with_arguments() {
    let output = run_program(
        r#"
class Point {
    var x: int = 0;
    var y: int = 0;
    fn init(x: int, y: int) { self.x = x; self.y = y; }
    fn sum(): int { return self.x + self.y; }
}
print(Point(3, 4).sum());
"#,
    );
    assert_eq!(output, vec!["7"]);
}

#[test]
fn entry_value_is_not_an_error() {
    let mut compilation = Compilation::new(CompilerOptions::default());
    let output = compilation.compile_source("main", "print(1 + 1);\n");
    let lir = output.lir.unwrap();
    let runtime = NullRuntime::new();
    let mut vm = Vm::new(&lir, &runtime);
    vm.capture_output();
    let result = vm.run("main", vec![]);
    assert_eq!(result, Ok(Value::Null));
}
