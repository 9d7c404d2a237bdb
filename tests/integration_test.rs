// Integration tests for the simulator

use refsim::config::{PlacementPolicy, SimConfig};
use refsim::escape::EscapeMode;
use refsim::interpreter::engine::Simulator;
use refsim::interpreter::errors::FaultKind;
use refsim::memory::heap::HeapState;
use refsim::memory::value::Value;
use refsim::memory::Placement;
use refsim::program::ast::*;
use refsim::program::check::WellFormednessError;
use refsim::snapshot::{CallState, TraceEvent, Verdict};
use refsim::{run_program, simulate, SimError};

fn main_fn(body: Vec<Stmt>) -> FunctionDef {
    FunctionDef::new("main", vec![], body)
}

fn run(program: Program) -> Verdict {
    run_program(program, SimConfig::default()).expect("Simulation failed")
}

fn run_with(program: Program, config: SimConfig) -> Verdict {
    run_program(program, config).expect("Simulation failed")
}

/// main: x := 10; set(&x)   set(p *int): *p = 20
fn pointer_param_program() -> Program {
    Program::new()
        .with_function(main_fn(vec![
            Stmt::declare("x", VarKind::Value, Expr::int(10)),
            Stmt::call("set", vec![Expr::addr_of("x")]),
        ]))
        .with_function(FunctionDef::new(
            "set",
            vec![Param::new("p", VarKind::Pointer)],
            vec![Stmt::store(Expr::var("p"), Expr::int(20))],
        ))
}

/// main: q := newPoint(); x := q.x   newPoint() *Point { pt := Point{1, 2}; return &pt }
fn returned_address_program() -> Program {
    Program::new()
        .with_function(main_fn(vec![
            Stmt::declare("q", VarKind::Pointer, Expr::call("newPoint", vec![])),
            Stmt::declare("x", VarKind::Value, Expr::field(Expr::var("q"), "x")),
        ]))
        .with_function(
            FunctionDef::new(
                "newPoint",
                vec![],
                vec![
                    Stmt::declare(
                        "pt",
                        VarKind::Value,
                        Expr::composite("Point", vec![("x", Expr::int(1)), ("y", Expr::int(2))]),
                    ),
                    Stmt::ret(Some(Expr::addr_of("pt"))),
                ],
            )
            .with_result(None, VarKind::Pointer),
        )
}

#[test]
fn test_scenario_a_pointer_parameter_mutation_is_visible() {
    let verdict = run(pointer_param_program());
    assert_eq!(verdict.value("x"), Some(&Value::int(20)));
    assert!(verdict.panics.is_empty());
}

#[test]
fn test_scenario_b_reassigning_pointer_parameter_is_invisible() {
    let program = Program::new()
        .with_function(main_fn(vec![
            Stmt::declare("x", VarKind::Value, Expr::int(10)),
            Stmt::declare("p", VarKind::Pointer, Expr::addr_of("x")),
            Stmt::call("reassign", vec![Expr::var("p")]),
            Stmt::declare("y", VarKind::Value, Expr::deref(Expr::var("p"))),
        ]))
        .with_function(FunctionDef::new(
            "reassign",
            vec![Param::new("p", VarKind::Pointer)],
            vec![
                Stmt::declare("local", VarKind::Value, Expr::int(99)),
                Stmt::assign("p", Expr::addr_of("local")),
                Stmt::store(Expr::var("p"), Expr::int(100)),
            ],
        ));
    let verdict = run(program);
    assert_eq!(verdict.value("x"), Some(&Value::int(10)));
    assert_eq!(verdict.value("y"), Some(&Value::int(10)));
}

#[test]
fn test_scenario_c_append_within_capacity() {
    let program = Program::new()
        .with_function(main_fn(vec![
            Stmt::declare(
                "s",
                VarKind::ReferenceHeader,
                Expr::slice(vec![Expr::int(1), Expr::int(2), Expr::int(3)], Some(4)),
            ),
            Stmt::call("add", vec![Expr::var("s")]),
            Stmt::declare("n", VarKind::Value, Expr::len(Expr::var("s"))),
            Stmt::declare(
                "last",
                VarKind::Value,
                Expr::index(Expr::reslice(Expr::var("s"), 0, 4), Expr::int(3)),
            ),
        ]))
        .with_function(FunctionDef::new(
            "add",
            vec![Param::new("s", VarKind::ReferenceHeader)],
            vec![Stmt::Append {
                target: Place::var("s"),
                values: vec![Expr::int(4)],
            }],
        ));
    let verdict = run(program);
    // The element landed in the shared block; the length change did not
    assert_eq!(verdict.value("n"), Some(&Value::int(3)));
    assert_eq!(verdict.value("last"), Some(&Value::int(4)));
}

#[test]
fn test_append_past_capacity_ends_aliasing_silently() {
    let program = Program::new()
        .with_function(main_fn(vec![
            Stmt::declare(
                "s",
                VarKind::ReferenceHeader,
                Expr::slice(vec![Expr::int(1), Expr::int(2)], None),
            ),
            Stmt::call("grow", vec![Expr::var("s")]),
            Stmt::declare("first", VarKind::Value, Expr::index(Expr::var("s"), Expr::int(0))),
        ]))
        .with_function(FunctionDef::new(
            "grow",
            vec![Param::new("s", VarKind::ReferenceHeader)],
            vec![
                Stmt::Append {
                    target: Place::var("s"),
                    values: vec![Expr::int(3)],
                },
                Stmt::SetIndex {
                    target: Place::var("s"),
                    index: Expr::int(0),
                    value: Expr::int(100),
                },
            ],
        ));
    let verdict = run(program);
    assert_eq!(verdict.value("first"), Some(&Value::int(1)));
    assert!(verdict.panics.is_empty());
}

#[test]
fn test_scenario_d_returned_address_is_heap_bound_and_readable() {
    let mut sim = Simulator::new(returned_address_program(), SimConfig::default());
    let verdict = sim.run().expect("Simulation failed");

    assert_eq!(verdict.placement("newPoint.pt"), Some(Placement::Heap));
    assert_eq!(verdict.placement("main.q"), Some(Placement::Stack));
    assert_eq!(verdict.value("x"), Some(&Value::int(1)));

    let report = sim.heap_report();
    let slot = report
        .objects
        .iter()
        .find(|o| o.name.as_deref() == Some("pt"))
        .expect("pt should live in the heap");
    assert_eq!(slot.state, HeapState::Live);
}

#[test]
fn test_forced_stack_placement_dangles() {
    let config = SimConfig::default().with_placement_policy(PlacementPolicy::ForceStack);
    let verdict = run_with(returned_address_program(), config);
    assert_eq!(verdict.panics.len(), 1);
    assert_eq!(verdict.panics[0].kind, FaultKind::DanglingPointer);
    assert_eq!(verdict.panics[0].location, Location::new("main", 1));
    assert_eq!(verdict.placement("newPoint.pt"), Some(Placement::Stack));
}

#[test]
fn test_forced_heap_placement_changes_nothing_observable() {
    let config = SimConfig::default().with_placement_policy(PlacementPolicy::ForceHeap);
    let verdict = run_with(pointer_param_program(), config);
    assert_eq!(verdict.value("x"), Some(&Value::int(20)));
    assert!(verdict
        .placements
        .values()
        .all(|placement| *placement == Placement::Heap));
}

#[test]
fn test_conservative_and_interprocedural_placements() {
    let conservative = run(pointer_param_program());
    assert_eq!(conservative.placement("main.x"), Some(Placement::Heap));

    let config = SimConfig::default().with_escape_mode(EscapeMode::Interprocedural);
    let precise = run_with(pointer_param_program(), config);
    assert_eq!(precise.placement("main.x"), Some(Placement::Stack));
    assert_eq!(precise.value("x"), Some(&Value::int(20)));
}

#[test]
fn test_pointer_retained_in_global_stays_readable() {
    let program = Program::new()
        .with_global(VarDecl::new("saved", VarKind::Pointer, None))
        .with_function(main_fn(vec![
            Stmt::call("stash", vec![]),
            Stmt::store(Expr::var("saved"), Expr::int(8)),
            Stmt::declare("seen", VarKind::Value, Expr::deref(Expr::var("saved"))),
        ]))
        .with_function(FunctionDef::new(
            "stash",
            vec![],
            vec![
                Stmt::declare("v", VarKind::Value, Expr::int(7)),
                Stmt::assign("saved", Expr::addr_of("v")),
            ],
        ));
    let config = SimConfig::default().with_escape_mode(EscapeMode::Interprocedural);
    let verdict = run_with(program, config);
    assert_eq!(verdict.placement("stash.v"), Some(Placement::Heap));
    assert_eq!(verdict.value("seen"), Some(&Value::int(8)));
    assert!(verdict.value("saved").is_some_and(|p| !p.is_empty()));
}

#[test]
fn test_nil_dereference_through_field_panics() {
    let program = Program::new().with_function(main_fn(vec![
        Stmt::Declare(VarDecl::new("p", VarKind::Pointer, None)),
        Stmt::declare("x", VarKind::Value, Expr::field(Expr::var("p"), "x")),
    ]));
    let verdict = run(program);
    assert_eq!(verdict.panics.len(), 1);
    assert_eq!(verdict.panics[0].kind, FaultKind::NilDereference);
    assert_eq!(verdict.panics[0].location, Location::new("main", 1));
    assert_eq!(verdict.value("p"), Some(&Value::nil_pointer()));
}

#[test]
fn test_typed_nil_returned_as_interface_is_not_nil() {
    let program = Program::new()
        .with_function(main_fn(vec![
            Stmt::declare("err", VarKind::InterfaceBox, Expr::call("mayFail", vec![])),
            Stmt::declare("failed", VarKind::Value, Expr::is_nil(Expr::var("err"))),
        ]))
        .with_function(
            FunctionDef::new(
                "mayFail",
                vec![],
                vec![
                    Stmt::Declare(VarDecl::new("p", VarKind::Pointer, None)),
                    Stmt::ret(Some(Expr::var("p"))),
                ],
            )
            .with_result(None, VarKind::InterfaceBox),
        );
    let verdict = run(program);
    assert_eq!(verdict.value("failed"), Some(&Value::boolean(false)));
    match verdict.value("err") {
        Some(Value::InterfaceBox { type_tag, value }) => {
            assert_eq!(type_tag.as_deref(), Some("pointer"));
            assert!(value.is_empty());
        }
        other => panic!("expected an interface box, got {:?}", other),
    }
}

#[test]
fn test_map_mutation_in_callee_is_visible() {
    let program = Program::new()
        .with_function(main_fn(vec![
            Stmt::declare("m", VarKind::KeyValueHeader, Expr::MapLit { entries: vec![] }),
            Stmt::call("put", vec![Expr::var("m")]),
            Stmt::declare("n", VarKind::Value, Expr::len(Expr::var("m"))),
        ]))
        .with_function(FunctionDef::new(
            "put",
            vec![Param::new("m", VarKind::KeyValueHeader)],
            vec![Stmt::SetKey {
                target: Place::var("m"),
                key: Expr::string("k"),
                value: Expr::int(1),
            }],
        ));
    assert_eq!(run(program).value("n"), Some(&Value::int(1)));
}

#[test]
fn test_composite_parameter_is_copied() {
    let program = Program::new()
        .with_function(main_fn(vec![
            Stmt::declare(
                "pt",
                VarKind::Value,
                Expr::composite("Point", vec![("x", Expr::int(1))]),
            ),
            Stmt::call("bump", vec![Expr::var("pt")]),
            Stmt::declare("x", VarKind::Value, Expr::field(Expr::var("pt"), "x")),
        ]))
        .with_function(FunctionDef::new(
            "bump",
            vec![Param::new("pt", VarKind::Value)],
            vec![Stmt::set_field(Place::var("pt"), "x", Expr::int(50))],
        ));
    assert_eq!(run(program).value("x"), Some(&Value::int(1)));
}

#[test]
fn test_unreachable_heap_objects_are_tombstoned() {
    let program = Program::new()
        .with_function(main_fn(vec![
            Stmt::declare("q", VarKind::Pointer, Expr::call("newPoint", vec![])),
            Stmt::assign("q", Expr::Nil),
        ]))
        .with_function(
            FunctionDef::new(
                "newPoint",
                vec![],
                vec![Stmt::ret(Some(Expr::new_slot(
                    Expr::composite("Point", vec![("x", Expr::int(1))]),
                    "newPoint.lit",
                )))],
            )
            .with_result(None, VarKind::Pointer),
        );
    let mut sim = Simulator::new(program, SimConfig::default());
    let verdict = sim.run().expect("Simulation failed");
    assert_eq!(verdict.placement("newPoint.lit"), Some(Placement::Heap));

    let report = sim.heap_report();
    assert_eq!(report.live, 0);
    assert_eq!(report.unreachable, 1);
}

#[test]
fn test_trace_records_call_lifecycle_and_truncates() {
    let mut sim = Simulator::new(pointer_param_program(), SimConfig::default());
    sim.run().expect("Simulation failed");
    assert_eq!(
        sim.trace().call_states("set"),
        vec![
            CallState::Entered,
            CallState::Executing,
            CallState::Returning,
            CallState::Exited
        ]
    );
    assert!(!sim.trace().is_truncated());

    let config = SimConfig::default().with_trace_limit(3);
    let mut sim = Simulator::new(pointer_param_program(), config);
    sim.run().expect("Simulation failed");
    assert_eq!(sim.trace().len(), sim.trace().limit());
    assert_eq!(sim.trace().limit(), 3);
    assert!(sim.trace().is_truncated());
}

#[test]
fn test_abort_discards_partial_state() {
    let program = returned_address_program().with_global(VarDecl::new(
        "cell",
        VarKind::Pointer,
        Some(Expr::new_slot(Expr::int(5), "cell.init")),
    ));
    let mut sim = Simulator::new(program, SimConfig::default());
    // <globals>#0, main#0, newPoint#0 and newPoint#1 run; main#1 aborts
    sim.abort_handle().abort_after(4);

    assert!(matches!(sim.run(), Err(SimError::Aborted)));
    let heap_allocs = sim
        .trace()
        .events()
        .iter()
        .filter(|event| matches!(event, TraceEvent::Alloc { placement: Placement::Heap, .. }))
        .count();
    assert_eq!(heap_allocs, 2);
    assert_eq!(sim.trace().call_states("newPoint").last(), Some(&CallState::Exited));

    assert!(sim.storage().heap().is_empty());
    assert_eq!(sim.storage().depth(), 1);
    assert!(sim.verdict().final_values.is_empty());
    assert!(sim.heap_report().objects.is_empty());
}

#[test]
fn test_global_assigned_before_local_shadow_stays_readable() {
    // f: x := 1; g = &x; var g *int   main: f(); v := *g
    let program = Program::new()
        .with_global(VarDecl::new("g", VarKind::Pointer, None))
        .with_function(main_fn(vec![
            Stmt::call("f", vec![]),
            Stmt::declare("v", VarKind::Value, Expr::deref(Expr::var("g"))),
        ]))
        .with_function(FunctionDef::new(
            "f",
            vec![],
            vec![
                Stmt::declare("x", VarKind::Value, Expr::int(1)),
                Stmt::assign("g", Expr::addr_of("x")),
                Stmt::Declare(VarDecl::new("g", VarKind::Pointer, None)),
            ],
        ));

    let verdict = run(program);
    assert_eq!(verdict.placement("f.x"), Some(Placement::Heap));
    assert!(verdict.panics.is_empty());
    assert_eq!(verdict.value("v"), Some(&Value::int(1)));
}

#[test]
fn test_recursive_program_is_rejected() {
    let program = Program::new()
        .with_function(main_fn(vec![Stmt::call("f", vec![])]))
        .with_function(FunctionDef::new("f", vec![], vec![Stmt::call("f", vec![])]));
    assert!(matches!(
        run_program(program, SimConfig::default()),
        Err(SimError::WellFormedness(WellFormednessError::RecursiveCall { .. }))
    ));
}

#[test]
fn test_json_end_to_end() {
    let json = r#"{
        "functions": [
            {
                "name": "main",
                "body": [
                    {"stmt": "declare", "name": "x", "init": {"expr": "lit", "value": {"type": "int", "value": 10}}},
                    {"stmt": "call", "callee": "set", "args": [{"expr": "addr_of", "place": {"place": "var", "name": "x"}}]}
                ]
            },
            {
                "name": "set",
                "params": [{"name": "p", "kind": "pointer"}],
                "body": [
                    {"stmt": "store", "pointer": {"expr": "var", "name": "p"}, "value": {"expr": "lit", "value": {"type": "int", "value": 20}}}
                ]
            }
        ]
    }"#;
    let verdict = simulate(json, SimConfig::default()).expect("Simulation failed");
    let output: serde_json::Value =
        serde_json::from_str(&verdict.to_json().expect("Serialization failed"))
            .expect("Verdict is not valid JSON");

    assert_eq!(output["finalValues"]["x"]["kind"], "primitive");
    assert_eq!(output["finalValues"]["x"]["value"], 20);
    assert_eq!(output["panics"].as_array().map(Vec::len), Some(0));
    assert_eq!(output["placements"]["main.x"], "heap");
    assert_eq!(output["placements"]["set.p"], "stack");
}

#[test]
fn test_json_with_unknown_kind_is_rejected() {
    let json = r#"{"functions": [{"name": "main", "body": [
        {"stmt": "declare", "name": "x", "kind": "channel"}
    ]}]}"#;
    assert!(matches!(
        simulate(json, SimConfig::default()),
        Err(SimError::Json(_))
    ));
}
