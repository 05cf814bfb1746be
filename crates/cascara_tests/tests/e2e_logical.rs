//! E2E: logical support and cascading retraction.

mod common;

use cascara_compile::ast::*;
use cascara_data::MAIN_MODULE;
use common::*;

fn derive_rule() -> RuleDef {
    RuleDef::new("derive")
        .cond(CondElem::Logical(vec![CondElem::Pattern(Pattern::ordered(
            "base",
            vec![field_var("x")],
        ))]))
        .action(RhsAction::assert_ordered(
            "derived",
            vec![PatternExpr::var("x")],
        ))
}

#[test]
fn e2e_supported_fact_retracts_with_its_support() {
    let mut engine = engine_with(&["base", "derived"]);
    engine.add_rule(&derive_rule()).unwrap();

    let base = assert_ints(&mut engine, "base", &[1]);
    engine.run(None);
    assert!(has_fact(&engine, "(derived 1)"));

    engine.retract(base).unwrap();
    // The cascade completes before retract returns.
    assert!(!has_fact(&engine, "(derived 1)"));
    assert!(engine.wm.is_empty());
}

#[test]
fn e2e_logical_cascade_is_transitive() {
    // base supports middle, middle supports top.
    let mut engine = engine_with(&["base", "middle", "top"]);
    engine
        .add_rule(
            &RuleDef::new("lift")
                .cond(CondElem::Logical(vec![CondElem::Pattern(Pattern::ordered(
                    "base",
                    vec![field_var("x")],
                ))]))
                .action(RhsAction::assert_ordered(
                    "middle",
                    vec![PatternExpr::var("x")],
                )),
        )
        .unwrap();
    engine
        .add_rule(
            &RuleDef::new("lift-again")
                .cond(CondElem::Logical(vec![CondElem::Pattern(Pattern::ordered(
                    "middle",
                    vec![field_var("x")],
                ))]))
                .action(RhsAction::assert_ordered(
                    "top",
                    vec![PatternExpr::var("x")],
                )),
        )
        .unwrap();

    let base = assert_ints(&mut engine, "base", &[7]);
    engine.run(None);
    assert!(has_fact(&engine, "(middle 7)"));
    assert!(has_fact(&engine, "(top 7)"));

    engine.retract(base).unwrap();
    assert!(engine.wm.is_empty());
}

#[test]
fn e2e_grandparent_under_logical_withdraws() {
    let mut engine = engine_with(&["parent", "grandparent"]);
    engine
        .add_rule(
            &RuleDef::new("grandparent")
                .cond(CondElem::Logical(vec![
                    CondElem::Pattern(Pattern::ordered(
                        "parent",
                        vec![field_var("p"), field_var("c")],
                    )),
                    CondElem::Pattern(Pattern::ordered(
                        "parent",
                        vec![field_var("c"), field_var("g")],
                    )),
                ]))
                .action(RhsAction::assert_ordered(
                    "grandparent",
                    vec![PatternExpr::var("p"), PatternExpr::var("g")],
                )),
        )
        .unwrap();

    let ab = assert_syms(&mut engine, "parent", &["a", "b"]);
    assert_syms(&mut engine, "parent", &["b", "c"]);
    engine.run(None);
    assert!(has_fact(&engine, "(grandparent a c)"));

    engine.retract(ab).unwrap();
    assert!(!has_fact(&engine, "(grandparent a c)"));
}

#[test]
fn e2e_multiple_supporters_keep_the_conclusion() {
    // Two independent bases derive the same constant conclusion; the
    // duplicate assert from the second firing adds a second
    // justification instead of a new fact.
    let mut engine = engine_with(&["base", "alarm"]);
    engine
        .add_rule(
            &RuleDef::new("raise")
                .cond(CondElem::Logical(vec![CondElem::Pattern(Pattern::ordered(
                    "base",
                    vec![field_wild()],
                ))]))
                .action(RhsAction::assert_ordered(
                    "alarm",
                    vec![PatternExpr::sym("on")],
                )),
        )
        .unwrap();

    let b1 = assert_ints(&mut engine, "base", &[1]);
    let b2 = assert_ints(&mut engine, "base", &[2]);
    engine.run(None);
    assert!(has_fact(&engine, "(alarm on)"));

    engine.retract(b1).unwrap();
    assert!(has_fact(&engine, "(alarm on)"));
    engine.retract(b2).unwrap();
    assert!(!has_fact(&engine, "(alarm on)"));
}

#[test]
fn e2e_unconditional_assert_strips_support() {
    let mut engine = engine_with(&["base", "derived"]);
    engine.add_rule(&derive_rule()).unwrap();

    let base = assert_ints(&mut engine, "base", &[3]);
    engine.run(None);
    assert!(has_fact(&engine, "(derived 3)"));

    // Re-asserting the derived fact from outside any firing makes it
    // unconditional; the duplicate is reported but the support strips.
    let t = engine.template_named("derived").unwrap();
    let three = int(&mut engine, 3);
    let _ = engine.assert_ordered(t, vec![three]);

    engine.retract(base).unwrap();
    assert!(has_fact(&engine, "(derived 3)"));
}
