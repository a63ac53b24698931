//! End-to-end language tests: compile and execute whole programs, asserting
//! on the captured print output.

use pretty_assertions::assert_eq;
use swiftscript::{CollectStringPrint, QueuedInput, ResultCode, Script, ScriptError, StdReadLine};

fn run(source: &str) -> Vec<String> {
    let mut script = Script::compile(source).expect("compilation failed");
    let mut print = CollectStringPrint::new();
    let mut input = StdReadLine;
    script.execute_with(&mut print, &mut input).expect("execution failed");
    print.lines().to_vec()
}

fn run_error(source: &str) -> ScriptError {
    match Script::compile(source) {
        Err(err) => err,
        Ok(mut script) => {
            let mut print = CollectStringPrint::new();
            let mut input = StdReadLine;
            script
                .execute_with(&mut print, &mut input)
                .expect_err("expected a failure")
        }
    }
}

#[test]
fn lexical_scoping_shadows_and_restores() {
    let output = run("let x = 10\nif true { let x = 20\nprint(x)\n}\nprint(x)");
    assert_eq!(output, vec!["20", "10"]);
}

#[test]
fn struct_mutating_method_updates_callers_storage() {
    let source = "struct C { var n: Int = 0\n mutating func inc() { self.n = self.n + 1 } \n func get() -> Int { return self.n } }\nvar c = C()\nc.inc()\nc.inc()\nprint(c.get())";
    assert_eq!(run(source), vec!["2"]);
}

#[test]
fn enum_switch_binds_associated_values() {
    let source = "enum R { case ok(v: Int)\n case err(e: Int) }\nvar r = R.ok(v: 42)\nswitch r { case .ok(let v): print(v)  case .err(let e): print(e) }";
    assert_eq!(run(source), vec!["42"]);
}

#[test]
fn private_member_access_fails_type_check() {
    let source = "class P { private var ssn = \"X\"\n var name = \"John\" }\nvar p = P()\nprint(p.ssn)";
    let err = run_error(source);
    assert_eq!(err.result_code(), ResultCode::TypeCheckError);
    let text = err.to_string();
    assert!(text.contains("private"), "{text}");
    assert!(text.contains("inaccessible"), "{text}");
}

#[test]
fn for_in_ranges_inclusive_and_filtered() {
    assert_eq!(run("for i in 1...3 { print(i) }"), vec!["1", "2", "3"]);
    assert_eq!(run("for i in 1..<3 where i > 1 { print(i) }"), vec!["2"]);
}

#[test]
fn array_count_and_append() {
    let source = "var a = [1, 2, 3]\nprint(a.count)\na.append(4)\nprint(a.count)";
    assert_eq!(run(source), vec!["3", "4"]);
}

#[test]
fn nil_coalescing_prefers_non_nil() {
    assert_eq!(run("let x: Int? = nil\nprint(x ?? 5)"), vec!["5"]);
    assert_eq!(run("let x: Int? = 7\nprint(x ?? 5)"), vec!["7"]);
}

#[test]
fn optional_chaining_short_circuits_on_nil() {
    let source = "class P { var name = \"n\" }\nvar p: P? = P()\nprint(p?.name ?? \"none\")\np = nil\nprint(p?.name ?? \"none\")";
    assert_eq!(run(source), vec!["n", "none"]);
}

#[test]
fn force_unwrap_of_nil_is_a_runtime_error() {
    let err = run_error("var x: Int? = nil\nprint(x!)");
    assert_eq!(err.result_code(), ResultCode::RuntimeError);
    assert!(err.to_string().contains("nil"), "{err}");
}

#[test]
fn string_interpolation_concatenates_parts() {
    let source = "let name = \"World\"\nprint(\"Hello, \\(name)! \\(1 + 2)\")";
    assert_eq!(run(source), vec!["Hello, World! 3"]);
}

#[test]
fn closures_capture_enclosing_locals() {
    let source = "func makeCounter() -> () -> Int { var n = 0\n let inc = { n = n + 1\n return n }\n return inc }\nvar counter = makeCounter()\nprint(counter())\nprint(counter())";
    assert_eq!(run(source), vec!["1", "2"]);
}

#[test]
fn open_upvalues_see_later_mutations() {
    let source = "func test() { var x = 10\n let get = { return x }\n x = 20\n print(get()) }\ntest()";
    assert_eq!(run(source), vec!["20"]);
}

#[test]
fn closed_upvalues_keep_the_final_value() {
    let source = "func make() -> () -> Int { var x = 1\n let get = { return x }\n x = 5\n return get }\nlet g = make()\nprint(g())";
    assert_eq!(run(source), vec!["5"]);
}

#[test]
fn class_inheritance_and_super_dispatch() {
    let source = "class A { func greet() -> String { return \"A\" } }\nclass B: A { override func greet() -> String { return \"B+\" + super.greet() } }\nvar b = B()\nprint(b.greet())";
    assert_eq!(run(source), vec!["B+A"]);
}

#[test]
fn inherited_methods_resolve_through_the_chain() {
    let source = "class A { func hello() -> String { return \"hi\" } }\nclass B: A { }\nvar b = B()\nprint(b.hello())";
    assert_eq!(run(source), vec!["hi"]);
}

#[test]
fn computed_property_runs_its_getter() {
    let source = "class Circle { var radius = 2\n var area: Int { return radius * radius * 3 } }\nvar c = Circle()\nprint(c.area)";
    assert_eq!(run(source), vec!["12"]);
}

#[test]
fn computed_property_setter_receives_new_value() {
    let source = "class Box { var stored = 0\n var doubled: Int { get { return stored * 2 } set { stored = newValue / 2 } } }\nvar b = Box()\nb.doubled = 10\nprint(b.stored)\nprint(b.doubled)";
    assert_eq!(run(source), vec!["5", "10"]);
}

#[test]
fn property_observers_fire_around_writes() {
    let source = "class Temp { var degrees = 0 { willSet { print(\"will\") } didSet { print(\"did\") } } }\nvar t = Temp()\nt.degrees = 5\nprint(t.degrees)";
    assert_eq!(run(source), vec!["will", "did", "5"]);
}

#[test]
fn initializers_set_up_instances() {
    let source = "class Point { var x = 0\n var y = 0\n init(x: Int, y: Int) { self.x = x\n self.y = y } }\nvar p = Point(x: 3, y: 4)\nprint(p.x + p.y)";
    assert_eq!(run(source), vec!["7"]);
}

#[test]
fn tuples_support_labels_indices_and_destructuring() {
    let source = "let t = (x: 1, y: 2)\nprint(t.x)\nprint(t.1)\nlet (a, b) = t\nprint(a + b)";
    assert_eq!(run(source), vec!["1", "2", "3"]);
}

#[test]
fn dictionaries_insert_and_count() {
    let source = "var d = [\"a\": 1, \"b\": 2]\nprint(d[\"a\"] ?? 0)\nd[\"c\"] = 3\nprint(d.count)";
    assert_eq!(run(source), vec!["1", "3"]);
}

#[test]
fn enum_raw_values_read_back() {
    let source = "enum Priority { case low = 1, high = 10 }\nprint(Priority.high.rawValue)";
    assert_eq!(run(source), vec!["10"]);
}

#[test]
fn switch_matches_ranges_and_literals() {
    let source = "let score = 85\nswitch score { case 0..<60: print(\"F\")  case 60..<80: print(\"C\")  default: print(\"A\") }";
    assert_eq!(run(source), vec!["A"]);
}

#[test]
fn switch_multiple_patterns_share_a_body() {
    let source = "let x = 2\nswitch x { case 1, 2: print(\"low\")  default: print(\"high\") }";
    assert_eq!(run(source), vec!["low"]);
}

#[test]
fn guard_let_binds_or_exits() {
    let source = "func f(x: Int?) -> Int { guard let v = x else { return 0 }\n return v + 1 }\nprint(f(x: 5))\nprint(f(x: nil))";
    assert_eq!(run(source), vec!["6", "0"]);
}

#[test]
fn while_break_and_repeat_while() {
    let source = "var i = 0\nwhile true { i = i + 1\n if i == 3 { break } }\nprint(i)\nvar j = 0\nrepeat { j = j + 1 } while j < 2\nprint(j)";
    assert_eq!(run(source), vec!["3", "2"]);
}

#[test]
fn continue_skips_to_the_next_iteration() {
    let source = "for i in 1...5 { if i % 2 == 0 { continue }\n print(i) }";
    assert_eq!(run(source), vec!["1", "3", "5"]);
}

#[test]
fn for_in_iterates_arrays() {
    let source = "var sum = 0\nfor x in [1, 2, 3] { sum = sum + x }\nprint(sum)";
    assert_eq!(run(source), vec!["6"]);
}

#[test]
fn type_checks_walk_the_class_hierarchy() {
    let source = "class Animal { }\nclass Dog: Animal { }\nvar d = Dog()\nprint(d is Animal)\nprint(d is Dog)\nprint(d is String)";
    assert_eq!(run(source), vec!["true", "true", "false"]);
}

#[test]
fn conditional_cast_yields_nil_on_failure() {
    let source = "class Animal { }\nclass Dog: Animal { }\nclass Cat: Animal { }\nvar pet: Animal = Dog()\nlet dog = pet as? Dog\nprint(dog == nil)\nlet cat = pet as? Cat\nprint(cat == nil)";
    assert_eq!(run(source), vec!["false", "true"]);
}

#[test]
fn protocol_conformance_is_visible_to_is() {
    let source = "protocol Greeter { func greet() -> String }\nclass En: Greeter { func greet() -> String { return \"hi\" } }\nvar e = En()\nprint(e is Greeter)";
    assert_eq!(run(source), vec!["true"]);
}

#[test]
fn generic_struct_specializations_run() {
    let source = "struct Box<T> { var value: T? = nil }\nvar b = Box<Int>()\nb.value = 42\nprint(b.value ?? 0)";
    assert_eq!(run(source), vec!["42"]);
}

#[test]
fn static_members_live_on_the_type() {
    let source = "struct Counter { static var total = 0\n static func bump() { Counter.total = Counter.total + 1 } }\nCounter.bump()\nCounter.bump()\nprint(Counter.total)";
    assert_eq!(run(source), vec!["2"]);
}

#[test]
fn enum_methods_dispatch_on_cases() {
    let source = "enum Direction { case north\n case south\n func flipped() -> Direction { switch self { case .north: return Direction.south  case .south: return Direction.north  default: return self } } }\nvar d = Direction.north\nprint(d.flipped() == Direction.south)";
    assert_eq!(run(source), vec!["true"]);
}

#[test]
fn operator_overload_resolves_through_method_dispatch() {
    let source = "struct Vec { var x = 0\n var y = 0\n init(x: Int, y: Int) { self.x = x\n self.y = y }\n func +(other: Vec) -> Vec { return Vec(x: self.x + other.x, y: self.y + other.y) } }\nlet a = Vec(x: 1, y: 2)\nlet b = Vec(x: 3, y: 4)\nlet c = a + b\nprint(c.x)\nprint(c.y)";
    assert_eq!(run(source), vec!["4", "6"]);
}

#[test]
fn default_parameter_values_materialize() {
    let source = "func greet(name: String = \"World\") -> String { return \"Hi \" + name }\nprint(greet())\nprint(greet(name: \"Ana\"))";
    assert_eq!(run(source), vec!["Hi World", "Hi Ana"]);
}

#[test]
fn main_function_is_the_entry_point() {
    let source = "func main() { print(\"main ran\") }\nprint(\"top level\")";
    assert_eq!(run(source), vec!["top level", "main ran"]);
}

#[test]
fn throw_terminates_with_uncaught_error() {
    let err = run_error("throw \"boom\"");
    assert_eq!(err.result_code(), ResultCode::RuntimeError);
    assert!(err.to_string().contains("Uncaught error: boom"), "{err}");
}

#[test]
fn division_by_zero_is_a_runtime_error() {
    let err = run_error("let a = 10\nlet b = 0\nprint(a / b)");
    assert_eq!(err.result_code(), ResultCode::RuntimeError);
    assert!(err.to_string().contains("zero"), "{err}");
}

#[test]
fn integer_arithmetic_wraps_and_truncates() {
    assert_eq!(run("print(7 / 2)"), vec!["3"]);
    assert_eq!(run("print(-7 / 2)"), vec!["-3"]);
    assert_eq!(run("print(7 % 3)"), vec!["1"]);
}

#[test]
fn float_arithmetic_promotes() {
    assert_eq!(run("print(1 + 0.5)"), vec!["1.5"]);
    assert_eq!(run("print(3.0 / 2.0)"), vec!["1.5"]);
}

#[test]
fn bitwise_and_shift_operators() {
    assert_eq!(run("print(6 & 3)"), vec!["2"]);
    assert_eq!(run("print(6 | 3)"), vec!["7"]);
    assert_eq!(run("print(6 ^ 3)"), vec!["5"]);
    assert_eq!(run("print(1 << 4)"), vec!["16"]);
    assert_eq!(run("print(16 >> 2)"), vec!["4"]);
}

#[test]
fn compound_assignment_desugars() {
    let source = "var x = 10\nx += 5\nx *= 2\nprint(x)\nvar a = [1, 2]\na[0] += 9\nprint(a[0])";
    assert_eq!(run(source), vec!["30", "10"]);
}

#[test]
fn ternary_and_logical_operators() {
    assert_eq!(run("print(1 < 2 ? \"yes\" : \"no\")"), vec!["yes"]);
    assert_eq!(run("print(true && false)"), vec!["false"]);
    assert_eq!(run("print(true || false)"), vec!["true"]);
}

#[test]
fn read_line_returns_queued_input_then_nil() {
    let mut script = Script::compile("print(readLine() ?? \"eof\")\nprint(readLine() ?? \"eof\")").expect("compiles");
    let mut print = CollectStringPrint::new();
    let mut input = QueuedInput::new(["first"]);
    script.execute_with(&mut print, &mut input).expect("runs");
    assert_eq!(print.lines(), ["first", "eof"]);
}

#[test]
fn imported_modules_splice_and_export() {
    let mut resolver = swiftscript::MapResolver::new();
    resolver.insert("util", "func twice(x: Int) -> Int { return x * 2 }");
    let mut script =
        Script::compile_with_resolver("import \"util\"\nprint(twice(x: 21))", &mut resolver).expect("compiles");
    let mut print = CollectStringPrint::new();
    let mut input = StdReadLine;
    script.execute_with(&mut print, &mut input).expect("runs");
    assert_eq!(print.lines(), ["42"]);
}

#[test]
fn extensions_add_methods_to_existing_types() {
    let source = "struct Point { var x = 1 }\nextension Point { func doubled() -> Int { return self.x * 2 } }\nvar p = Point()\nprint(p.doubled())";
    assert_eq!(run(source), vec!["2"]);
}

#[test]
fn lazy_properties_materialize_on_first_access() {
    let source = "class L { lazy var big = 40 + 2 }\nvar l = L()\nprint(l.big)\nprint(l.big)";
    assert_eq!(run(source), vec!["42", "42"]);
}

#[test]
fn string_builtins_and_comparison() {
    assert_eq!(run("print(\"hello\".count)"), vec!["5"]);
    assert_eq!(run("print(\"\".isEmpty)"), vec!["true"]);
    assert_eq!(run("print(\"abc\" < \"abd\")"), vec!["true"]);
    assert_eq!(run("print(\"a\" + \"b\" == \"ab\")"), vec!["true"]);
}

#[test]
fn value_semantics_copy_structs_on_assignment() {
    let source = "struct S { var n = 1 }\nvar a = S()\nvar b = a\nb.n = 99\nprint(a.n)\nprint(b.n)";
    assert_eq!(run(source), vec!["1", "99"]);
}

#[test]
fn reference_semantics_share_class_instances() {
    let source = "class C { var n = 1 }\nvar a = C()\nvar b = a\nb.n = 99\nprint(a.n)";
    assert_eq!(run(source), vec!["99"]);
}
