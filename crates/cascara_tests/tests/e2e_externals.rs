//! E2E: host function dispatch and the error policy.

mod common;

use cascara_base::{AtomTable, Value, TRUE_ATOM};
use cascara_compile::ast::*;
use cascara_data::{EvalError, EvalResult, ExternalDispatch};
use cascara_system::{BufferSink, Engine, EngineConfig, ErrorPolicy, WERROR};
use common::*;
use std::cell::RefCell;
use std::rc::Rc;

/// Records every call; `fail` makes calls report failure.
struct Recorder {
    calls: Rc<RefCell<Vec<String>>>,
    fail: bool,
}

impl ExternalDispatch for Recorder {
    fn call(&mut self, atoms: &mut AtomTable, name: &str, args: &[Value]) -> EvalResult {
        let rendered: Vec<String> = args.iter().map(|v| v.display(atoms).to_string()).collect();
        self.calls
            .borrow_mut()
            .push(format!("{}({})", name, rendered.join(" ")));
        if self.fail {
            Err(EvalError::External("host refused".to_string()))
        } else {
            Ok(Value::Atom(TRUE_ATOM))
        }
    }
}

#[test]
fn e2e_rhs_calls_reach_the_host() {
    let calls = Rc::new(RefCell::new(Vec::new()));
    let mut engine = engine_with(&["ping"]);
    engine.set_external_dispatch(Box::new(Recorder {
        calls: calls.clone(),
        fail: false,
    }));
    engine
        .add_rule(
            &RuleDef::new("notify")
                .pattern(Pattern::ordered("ping", vec![field_var("x")]))
                .action(RhsAction::Eval(PatternExpr::Call {
                    name: "notify-host".to_string(),
                    args: vec![PatternExpr::var("x")],
                })),
        )
        .unwrap();

    assert_ints(&mut engine, "ping", &[7]);
    engine.run(None);
    assert_eq!(calls.borrow().as_slice(), &["notify-host(7)".to_string()]);
}

#[test]
fn e2e_predicate_calls_filter_matches() {
    let calls = Rc::new(RefCell::new(Vec::new()));
    let mut engine = engine_with(&["ping", "ok"]);
    engine.set_external_dispatch(Box::new(Recorder {
        calls: calls.clone(),
        fail: false,
    }));
    engine
        .add_rule(
            &RuleDef::new("check")
                .pattern(Pattern::ordered(
                    "ping",
                    vec![field_var("x").with_test(PatternExpr::Call {
                        name: "approve".to_string(),
                        args: vec![PatternExpr::var("x")],
                    })],
                ))
                .action(RhsAction::assert_ordered("ok", vec![PatternExpr::var("x")])),
        )
        .unwrap();

    assert_ints(&mut engine, "ping", &[1]);
    assert!(!calls.borrow().is_empty());
    engine.run(None);
    assert!(has_fact(&engine, "(ok 1)"));
}

#[test]
fn e2e_continue_policy_survives_action_errors() {
    let mut engine = Engine::with_config(EngineConfig {
        error_policy: ErrorPolicy::Continue,
        ..EngineConfig::default()
    });
    let errors = BufferSink::new();
    let sink = engine.router.add_sink(Box::new(errors.clone()));
    engine.router.route(WERROR, sink);

    engine.define_ordered_template("item").unwrap();
    engine.define_ordered_template("after").unwrap();
    engine
        .add_rule(
            &RuleDef::new("broken")
                .salience(10)
                .pattern(Pattern::ordered("item", vec![field_var("x")]))
                .action(RhsAction::Eval(PatternExpr::Call {
                    name: "no-such-function".to_string(),
                    args: vec![],
                }))
                .action(RhsAction::assert_ordered(
                    "after",
                    vec![PatternExpr::sym("unreachable")],
                )),
        )
        .unwrap();
    engine
        .add_rule(
            &RuleDef::new("healthy")
                .pattern(Pattern::ordered("item", vec![field_var("x")]))
                .action(RhsAction::assert_ordered(
                    "after",
                    vec![PatternExpr::sym("ok")],
                )),
        )
        .unwrap();

    assert_ints(&mut engine, "item", &[1]);
    // Both fire; the broken rule aborts its own RHS but the run goes on.
    assert_eq!(engine.run(None), 2);
    assert!(has_fact(&engine, "(after ok)"));
    assert!(!has_fact(&engine, "(after unreachable)"));
    assert!(errors.contents().contains("no-such-function"));
}

#[test]
fn e2e_halt_policy_stops_the_run() {
    let mut engine = Engine::with_config(EngineConfig {
        error_policy: ErrorPolicy::Halt,
        ..EngineConfig::default()
    });
    engine.define_ordered_template("item").unwrap();
    engine.define_ordered_template("after").unwrap();
    engine
        .add_rule(
            &RuleDef::new("broken")
                .salience(10)
                .pattern(Pattern::ordered("item", vec![field_var("x")]))
                .action(RhsAction::Eval(PatternExpr::Call {
                    name: "no-such-function".to_string(),
                    args: vec![],
                })),
        )
        .unwrap();
    engine
        .add_rule(
            &RuleDef::new("healthy")
                .pattern(Pattern::ordered("item", vec![field_var("x")]))
                .action(RhsAction::assert_ordered(
                    "after",
                    vec![PatternExpr::sym("ok")],
                )),
        )
        .unwrap();

    assert_ints(&mut engine, "item", &[1]);
    // The failing firing halts the engine; the healthy rule stays
    // queued with the agenda intact.
    assert_eq!(engine.run(None), 1);
    assert!(!has_fact(&engine, "(after ok)"));
    assert_eq!(engine.agenda_len(cascara_data::MAIN_MODULE), 1);
}
