//! E2E: modify semantics and binding stability during firings.

mod common;

use cascara_compile::ast::*;
use cascara_data::{SlotId, MAIN_MODULE};
use common::*;

#[test]
fn e2e_modify_from_rhs_produces_exactly_one_new_activation() {
    // ?f <- (temp ?t) => (modify ?f (+ ?t 1)): after one firing there
    // is exactly one activation, for the incremented fact, never two
    // for the same underlying fact.
    let mut engine = engine_with(&["temp"]);
    engine
        .add_rule(
            &RuleDef::new("heat")
                .pattern(
                    Pattern::ordered("temp", vec![field_var("t")]).bound_to("f"),
                )
                .action(RhsAction::Modify {
                    target: PatternExpr::var("f"),
                    sets: vec![(
                        "__fields".to_string(),
                        vec![PatternExpr::add(PatternExpr::var("t"), PatternExpr::int(1))],
                    )],
                }),
        )
        .unwrap();

    assert_ints(&mut engine, "temp", &[20]);
    assert_eq!(engine.agenda_len(MAIN_MODULE), 1);

    assert_eq!(engine.run(Some(1)), 1);
    assert!(has_fact(&engine, "(temp 21)"));
    assert!(!has_fact(&engine, "(temp 20)"));
    assert_eq!(engine.agenda_len(MAIN_MODULE), 1);

    // Each bounded run advances by exactly one step.
    assert_eq!(engine.run(Some(2)), 2);
    assert!(has_fact(&engine, "(temp 23)"));
    assert_eq!(engine.facts_snapshot().len(), 1);
}

#[test]
fn e2e_later_actions_still_read_premodify_bindings() {
    // The firing modifies its matched fact, then keeps using ?t; the
    // binding must keep the pre-modify value.
    let mut engine = engine_with(&["temp", "log"]);
    engine
        .add_rule(
            &RuleDef::new("step")
                .pattern(
                    Pattern::ordered("temp", vec![field_var("t")]).bound_to("f"),
                )
                .action(RhsAction::Modify {
                    target: PatternExpr::var("f"),
                    sets: vec![(
                        "__fields".to_string(),
                        vec![PatternExpr::add(PatternExpr::var("t"), PatternExpr::int(1))],
                    )],
                })
                .action(RhsAction::assert_ordered(
                    "log",
                    vec![PatternExpr::var("t")],
                )),
        )
        .unwrap();

    assert_ints(&mut engine, "temp", &[5]);
    engine.run(Some(1));
    assert!(has_fact(&engine, "(temp 6)"));
    // The log records the value the rule matched, not the new one.
    assert!(has_fact(&engine, "(log 5)"));
}

#[test]
fn e2e_retract_then_reassert_reactivates() {
    let mut engine = engine_with(&["item", "seen"]);
    engine
        .add_rule(
            &RuleDef::new("observe")
                .pattern(Pattern::ordered("item", vec![field_var("x")]))
                .action(RhsAction::assert_ordered(
                    "seen",
                    vec![PatternExpr::var("x")],
                )),
        )
        .unwrap();

    let fact = assert_ints(&mut engine, "item", &[9]);
    assert_eq!(engine.run(None), 1);
    assert_eq!(engine.agenda_len(MAIN_MODULE), 0);

    engine.retract(fact).unwrap();
    assert_ints(&mut engine, "item", &[9]);
    // A re-derived match is a fresh activation (refraction only guards
    // the same surviving match).
    assert_eq!(engine.agenda_len(MAIN_MODULE), 1);
}

#[test]
fn e2e_host_modify_is_retract_plus_assert() {
    let mut engine = engine_with(&["temp"]);
    let fact = assert_ints(&mut engine, "temp", &[20]);
    let old_time = engine.wm.facts[fact].time_tag;

    let thirty = int(&mut engine, 30);
    let new_fact = engine
        .modify(fact, vec![(SlotId(0), thirty)])
        .unwrap();
    assert_ne!(fact, new_fact);
    assert!(engine.wm.facts[new_fact].time_tag > old_time);
    assert!(has_fact(&engine, "(temp 30)"));
    assert!(!has_fact(&engine, "(temp 20)"));
}

#[test]
fn e2e_rule_that_retracts_its_own_match_keeps_its_bindings() {
    let mut engine = engine_with(&["task", "done"]);
    engine
        .add_rule(
            &RuleDef::new("consume")
                .pattern(
                    Pattern::ordered("task", vec![field_var("name")]).bound_to("f"),
                )
                .action(RhsAction::Retract(PatternExpr::var("f")))
                .action(RhsAction::assert_ordered(
                    "done",
                    vec![PatternExpr::var("name")],
                )),
        )
        .unwrap();

    assert_syms(&mut engine, "task", &["laundry"]);
    assert_syms(&mut engine, "task", &["dishes"]);
    assert_eq!(engine.run(None), 2);
    assert!(has_fact(&engine, "(done laundry)"));
    assert!(has_fact(&engine, "(done dishes)"));
    assert_eq!(
        rendered(&engine)
            .iter()
            .filter(|f| f.starts_with("(task"))
            .count(),
        0
    );
}
