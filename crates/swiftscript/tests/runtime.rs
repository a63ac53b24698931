//! Memory-model tests: deterministic reference counting, `deinit` timing,
//! weak references, and the deferred-release cleanup points.

use pretty_assertions::assert_eq;
use swiftscript::{CollectStringPrint, Script, StdReadLine, VmConfig};

/// Runs with the cleanup threshold at 1 so every release that hits zero is
/// collected at the next instruction boundary.
fn run_eager(source: &str) -> Vec<String> {
    let mut script = Script::compile(source).expect("compilation failed");
    script.set_config(VmConfig {
        deferred_cleanup_threshold: 1,
        ..VmConfig::default()
    });
    let mut print = CollectStringPrint::new();
    let mut input = StdReadLine;
    script.execute_with(&mut print, &mut input).expect("execution failed");
    print.lines().to_vec()
}

fn run_default(source: &str) -> Vec<String> {
    let mut script = Script::compile(source).expect("compilation failed");
    let mut print = CollectStringPrint::new();
    let mut input = StdReadLine;
    script.execute_with(&mut print, &mut input).expect("execution failed");
    print.lines().to_vec()
}

#[test]
fn deinit_runs_when_last_strong_reference_drops() {
    let source = "class D { deinit { print(\"bye\") } }\nvar d: D? = D()\nd = nil\nprint(\"after\")";
    assert_eq!(run_eager(source), vec!["bye", "after"]);
}

#[test]
fn deinit_runs_exactly_once() {
    let source = "class D { deinit { print(\"bye\") } }\nvar d: D? = D()\nd = nil\nprint(\"after\")";
    let output = run_eager(source);
    assert_eq!(output.iter().filter(|l| l.as_str() == "bye").count(), 1);
}

#[test]
fn deinit_eventually_runs_at_shutdown_without_eager_cleanup() {
    let source = "class D { deinit { print(\"bye\") } }\nvar d: D? = D()\nd = nil\nprint(\"after\")";
    let output = run_default(source);
    // With the default threshold the release may only drain at teardown,
    // but it must still run exactly once.
    assert_eq!(output.iter().filter(|l| l.as_str() == "bye").count(), 1);
    assert!(output.contains(&"after".to_owned()));
}

#[test]
fn locals_release_when_a_function_returns() {
    let source = "class D { deinit { print(\"gone\") } }\nfunc scope() { let d = D()\n print(\"in scope\") }\nscope()\nprint(\"out\")";
    assert_eq!(run_eager(source), vec!["in scope", "gone", "out"]);
}

#[test]
fn superclass_deinit_is_found_through_the_chain() {
    let source = "class A { deinit { print(\"A gone\") } }\nclass B: A { }\nvar b: B? = B()\nb = nil\nprint(\"end\")";
    assert_eq!(run_eager(source), vec!["A gone", "end"]);
}

#[test]
fn weak_references_are_nulled_on_deallocation() {
    let source = "class Node { weak var parent: Node? = nil }\nvar child = Node()\nvar parent: Node? = Node()\nchild.parent = parent\nprint(child.parent == nil)\nparent = nil\nprint(child.parent == nil)";
    assert_eq!(run_eager(source), vec!["false", "true"]);
}

#[test]
fn weak_references_do_not_keep_objects_alive() {
    let source = "class D { deinit { print(\"released\") } }\nclass Holder { weak var item: D? = nil }\nvar h = Holder()\nvar d: D? = D()\nh.item = d\nd = nil\nprint(\"after\")";
    assert_eq!(run_eager(source), vec!["released", "after"]);
}

#[test]
fn strong_cycles_leak_until_shutdown() {
    // A <-> B strong cycle: neither deinit runs during execution; both run
    // at VM teardown.
    let source = "class N { var other: N? = nil\n deinit { print(\"freed\") } }\nvar a: N? = N()\nvar b: N? = N()\na!.other = b\nb!.other = a\na = nil\nb = nil\nprint(\"alive\")";
    let output = run_eager(source);
    assert_eq!(output[0], "alive");
    assert_eq!(output.iter().filter(|l| l.as_str() == "freed").count(), 2);
}

#[test]
fn breaking_a_cycle_with_weak_collects_promptly() {
    let source = "class N { weak var other: N? = nil\n deinit { print(\"freed\") } }\nvar a: N? = N()\nvar b: N? = N()\na!.other = b\nb!.other = a\na = nil\nprint(\"first\")\nb = nil\nprint(\"second\")";
    assert_eq!(run_eager(source), vec!["freed", "first", "freed", "second"]);
}

#[test]
fn struct_copies_are_independent_storage() {
    let source = "struct S { var values = [1] }\nvar a = S()\nvar b = a\nb.values = [9, 9]\nprint(a.values.count)\nprint(b.values.count)";
    assert_eq!(run_eager(source), vec!["1", "2"]);
}

#[test]
fn deinit_can_touch_fields_before_release() {
    let source = "class Res { var name = \"db\"\n deinit { print(\"closing \" + name) } }\nvar r: Res? = Res()\nr = nil\nprint(\"done\")";
    assert_eq!(run_eager(source), vec!["closing db", "done"]);
}

#[test]
fn instances_stored_in_collections_survive_scope_exit() {
    let source = "class D { var n = 7\n deinit { print(\"dead\") } }\nvar keep = [D()]\nprint(keep[0].n)\nprint(\"end\")";
    let output = run_eager(source);
    assert_eq!(output[0], "7");
    assert_eq!(output[1], "end");
    // The deinit still runs at shutdown when the list is torn down.
    assert_eq!(output.iter().filter(|l| l.as_str() == "dead").count(), 1);
}

#[test]
fn mutating_self_reassignment_writes_back() {
    let source = "struct P { var n = 1\n init(n: Int = 1) { self.n = n }\n mutating func reset() { self = P(n: 99) } }\nvar p = P()\np.reset()\nprint(p.n)";
    assert_eq!(run_eager(source), vec!["99"]);
}
