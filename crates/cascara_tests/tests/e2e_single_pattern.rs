//! E2E: single-pattern rules and duplicate-fact policy.

mod common;

use cascara_compile::ast::*;
use cascara_data::{AssertError, MAIN_MODULE};
use cascara_system::{Engine, EngineConfig};
use common::*;

fn sum_rule() -> RuleDef {
    RuleDef::new("sum-point")
        .pattern(Pattern::ordered(
            "point",
            vec![field_var("a"), field_var("b")],
        ))
        .action(RhsAction::assert_ordered(
            "sum",
            vec![PatternExpr::add(
                PatternExpr::var("a"),
                PatternExpr::var("b"),
            )],
        ))
}

#[test]
fn e2e_assert_activates_and_fire_emits() {
    let mut engine = engine_with(&["point", "sum"]);
    engine.add_rule(&sum_rule()).unwrap();

    assert_ints(&mut engine, "point", &[3, 4]);
    assert_eq!(engine.agenda_len(MAIN_MODULE), 1);

    assert_eq!(engine.run(None), 1);
    assert!(has_fact(&engine, "(sum 7)"));
    assert_eq!(engine.agenda_len(MAIN_MODULE), 0);
}

#[test]
fn e2e_each_fact_activates_once() {
    let mut engine = engine_with(&["point", "sum"]);
    engine.add_rule(&sum_rule()).unwrap();

    assert_ints(&mut engine, "point", &[1, 1]);
    assert_ints(&mut engine, "point", &[2, 2]);
    assert_ints(&mut engine, "point", &[3, 3]);
    assert_eq!(engine.agenda_len(MAIN_MODULE), 3);
    assert_eq!(engine.run(None), 3);
    assert!(has_fact(&engine, "(sum 2)"));
    assert!(has_fact(&engine, "(sum 4)"));
    assert!(has_fact(&engine, "(sum 6)"));
}

#[test]
fn e2e_duplicate_assert_is_rejected_by_default() {
    let mut engine = engine_with(&["point"]);
    let first = assert_ints(&mut engine, "point", &[5, 5]);

    let t = engine.template_named("point").unwrap();
    let five = int(&mut engine, 5);
    let five2 = five.clone();
    let result = engine.assert_ordered(t, vec![five, five2]);
    assert_eq!(result, Err(AssertError::Duplicate(first)));
    assert_eq!(engine.facts_snapshot().len(), 1);
}

#[test]
fn e2e_duplicates_allowed_produce_independent_facts() {
    let mut engine = Engine::with_config(EngineConfig {
        allow_duplicates: true,
        ..EngineConfig::default()
    });
    engine.define_ordered_template("point").unwrap();
    engine.define_ordered_template("seen").unwrap();
    engine
        .add_rule(
            &RuleDef::new("observe")
                .pattern(Pattern::ordered(
                    "point",
                    vec![field_var("a"), field_var("b")],
                ))
                .action(RhsAction::assert_ordered(
                    "seen",
                    vec![PatternExpr::var("a")],
                )),
        )
        .unwrap();

    assert_ints(&mut engine, "point", &[5, 5]);
    assert_ints(&mut engine, "point", &[5, 5]);
    assert_eq!(engine.facts_snapshot().len(), 2);
    // Both duplicates activate independently; (seen 5) is emitted once
    // and the second emit is suppressed as its own duplicate... which
    // is also allowed here, so two firings happen regardless.
    assert_eq!(engine.run(None), 2);
}

#[test]
fn e2e_retract_before_run_cancels_the_firing() {
    let mut engine = engine_with(&["point", "sum"]);
    engine.add_rule(&sum_rule()).unwrap();
    let fact = assert_ints(&mut engine, "point", &[3, 4]);
    engine.retract(fact).unwrap();
    assert_eq!(engine.agenda_len(MAIN_MODULE), 0);
    assert_eq!(engine.run(None), 0);
    assert!(!has_fact(&engine, "(sum 7)"));
}
