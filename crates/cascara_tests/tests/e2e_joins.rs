//! E2E: cross-pattern joins and equi-join hashing equivalence.

mod common;

use cascara_compile::ast::*;
use cascara_data::MAIN_MODULE;
use cascara_system::{Engine, EngineConfig};
use common::*;

fn grandparent_rule() -> RuleDef {
    RuleDef::new("grandparent")
        .pattern(Pattern::ordered(
            "parent",
            vec![field_var("p"), field_var("c")],
        ))
        .pattern(Pattern::ordered(
            "parent",
            vec![field_var("c"), field_var("g")],
        ))
        .action(RhsAction::assert_ordered(
            "grandparent",
            vec![PatternExpr::var("p"), PatternExpr::var("g")],
        ))
}

#[test]
fn e2e_two_pattern_join_fires_once() {
    let mut engine = engine_with(&["parent", "grandparent"]);
    engine.add_rule(&grandparent_rule()).unwrap();

    assert_syms(&mut engine, "parent", &["a", "b"]);
    assert_syms(&mut engine, "parent", &["b", "c"]);
    assert_eq!(engine.agenda_len(MAIN_MODULE), 1);
    assert_eq!(engine.run(None), 1);
    assert!(has_fact(&engine, "(grandparent a c)"));
}

#[test]
fn e2e_retracting_a_join_input_withdraws_the_activation() {
    let mut engine = engine_with(&["parent", "grandparent"]);
    engine.add_rule(&grandparent_rule()).unwrap();

    let ab = assert_syms(&mut engine, "parent", &["a", "b"]);
    assert_syms(&mut engine, "parent", &["b", "c"]);
    assert_eq!(engine.agenda_len(MAIN_MODULE), 1);

    engine.retract(ab).unwrap();
    // The activation is gone before retract returns.
    assert_eq!(engine.agenda_len(MAIN_MODULE), 0);
    assert_eq!(engine.run(None), 0);
}

#[test]
fn e2e_derived_fact_survives_without_logical_support() {
    let mut engine = engine_with(&["parent", "grandparent"]);
    engine.add_rule(&grandparent_rule()).unwrap();

    let ab = assert_syms(&mut engine, "parent", &["a", "b"]);
    assert_syms(&mut engine, "parent", &["b", "c"]);
    engine.run(None);
    assert!(has_fact(&engine, "(grandparent a c)"));

    engine.retract(ab).unwrap();
    // No logical group, so the conclusion stands.
    assert!(has_fact(&engine, "(grandparent a c)"));
}

#[test]
fn e2e_join_matches_every_combination() {
    let mut engine = engine_with(&["parent", "grandparent"]);
    engine.add_rule(&grandparent_rule()).unwrap();

    assert_syms(&mut engine, "parent", &["a", "b"]);
    assert_syms(&mut engine, "parent", &["b", "c"]);
    assert_syms(&mut engine, "parent", &["b", "d"]);
    assert_syms(&mut engine, "parent", &["x", "b"]);
    // (a,b)x(b,c), (a,b)x(b,d), (x,b)x(b,c), (x,b)x(b,d).
    assert_eq!(engine.agenda_len(MAIN_MODULE), 4);
}

/// The same scenario with hashed memories on and off must produce the
/// same activations and the same firing order.
#[test]
fn e2e_hashed_and_unhashed_joins_agree() {
    let run_one = |hashed: bool| -> (Vec<String>, u64) {
        let mut engine = Engine::with_config(EngineConfig {
            hashed_memories: hashed,
            ..EngineConfig::default()
        });
        engine.define_ordered_template("parent").unwrap();
        engine.define_ordered_template("grandparent").unwrap();
        engine.add_rule(&grandparent_rule()).unwrap();
        assert_syms(&mut engine, "parent", &["a", "b"]);
        assert_syms(&mut engine, "parent", &["b", "c"]);
        assert_syms(&mut engine, "parent", &["c", "d"]);
        assert_syms(&mut engine, "parent", &["b", "e"]);
        let fired = engine.run(None);
        let mut facts = rendered(&engine);
        facts.sort();
        (facts, fired)
    };
    assert_eq!(run_one(true), run_one(false));
}

#[test]
fn e2e_test_ce_filters_joins() {
    let mut engine = engine_with(&["reading", "alarm"]);
    engine
        .add_rule(
            &RuleDef::new("over-threshold")
                .pattern(Pattern::ordered(
                    "reading",
                    vec![field_var("id"), field_var("value")],
                ))
                .cond(CondElem::Test(PatternExpr::cmp(
                    cascara_data::CmpOp::Gt,
                    PatternExpr::var("value"),
                    PatternExpr::int(100),
                )))
                .action(RhsAction::assert_ordered(
                    "alarm",
                    vec![PatternExpr::var("id")],
                )),
        )
        .unwrap();

    let t = engine.template_named("reading").unwrap();
    let a = sym(&mut engine, "a");
    let low = int(&mut engine, 50);
    engine.assert_ordered(t, vec![a, low]).unwrap();
    let b = sym(&mut engine, "b");
    let high = int(&mut engine, 150);
    engine.assert_ordered(t, vec![b, high]).unwrap();

    engine.run(None);
    assert!(has_fact(&engine, "(alarm b)"));
    assert!(!has_fact(&engine, "(alarm a)"));
}
