//! E2E: multifield variables and marker-addressed spans.

mod common;

use cascara_compile::ast::*;
use cascara_data::MAIN_MODULE;
use common::*;

#[test]
fn e2e_multifield_variable_captures_a_span() {
    // (list a $?middle z) => (middle $?middle)
    let mut engine = engine_with(&["list", "middle"]);
    engine
        .add_rule(
            &RuleDef::new("extract-middle")
                .pattern(Pattern::ordered(
                    "list",
                    vec![
                        field_lit(Literal::sym("a")),
                        field_multi_var("middle"),
                        field_lit(Literal::sym("z")),
                    ],
                ))
                .action(RhsAction::assert_ordered(
                    "middle",
                    vec![PatternExpr::var("middle")],
                )),
        )
        .unwrap();

    assert_syms(&mut engine, "list", &["a", "p", "q", "z"]);
    assert_eq!(engine.run(None), 1);
    assert!(has_fact(&engine, "(middle p q)"));
}

#[test]
fn e2e_empty_span_matches() {
    let mut engine = engine_with(&["list", "middle"]);
    engine
        .add_rule(
            &RuleDef::new("extract-middle")
                .pattern(Pattern::ordered(
                    "list",
                    vec![
                        field_lit(Literal::sym("a")),
                        field_multi_var("middle"),
                        field_lit(Literal::sym("z")),
                    ],
                ))
                .action(RhsAction::assert_ordered(
                    "middle",
                    vec![PatternExpr::sym("got"), PatternExpr::var("middle")],
                )),
        )
        .unwrap();

    assert_syms(&mut engine, "list", &["a", "z"]);
    assert_eq!(engine.run(None), 1);
    // The empty span splices to nothing.
    assert!(has_fact(&engine, "(middle got)"));
}

#[test]
fn e2e_two_spans_enumerate_segmentations() {
    // ($?front pivot $?back) over (x pivot y pivot z): the pivot can be
    // either occurrence, so two alpha matches arise.
    let mut engine = engine_with(&["list", "split"]);
    engine
        .add_rule(
            &RuleDef::new("split-at-pivot")
                .pattern(Pattern::ordered(
                    "list",
                    vec![
                        field_multi_var("front"),
                        field_lit(Literal::sym("pivot")),
                        field_multi_var("back"),
                    ],
                ))
                .action(RhsAction::assert_ordered(
                    "split",
                    vec![
                        PatternExpr::Length(Box::new(PatternExpr::var("front"))),
                        PatternExpr::Length(Box::new(PatternExpr::var("back"))),
                    ],
                )),
        )
        .unwrap();

    assert_syms(&mut engine, "list", &["x", "pivot", "y", "pivot", "z"]);
    assert_eq!(engine.agenda_len(MAIN_MODULE), 2);
    assert_eq!(engine.run(None), 2);
    assert!(has_fact(&engine, "(split 1 3)"));
    assert!(has_fact(&engine, "(split 3 1)"));
}

#[test]
fn e2e_single_var_between_spans() {
    // ($? ?x $?) binds each element of the list in turn.
    let mut engine = engine_with(&["list", "element"]);
    engine
        .add_rule(
            &RuleDef::new("each")
                .pattern(Pattern::ordered(
                    "list",
                    vec![field_multi_wild(), field_var("x"), field_multi_wild()],
                ))
                .action(RhsAction::assert_ordered(
                    "element",
                    vec![PatternExpr::var("x")],
                )),
        )
        .unwrap();

    assert_syms(&mut engine, "list", &["p", "q", "r"]);
    assert_eq!(engine.agenda_len(MAIN_MODULE), 3);
    engine.run(None);
    for element in ["p", "q", "r"] {
        assert!(has_fact(&engine, &format!("(element {})", element)));
    }
}

#[test]
fn e2e_multifield_join_across_patterns() {
    // Two lists sharing the same tail join on the multifield value.
    let mut engine = engine_with(&["left", "right", "same"]);
    engine
        .add_rule(
            &RuleDef::new("same-tail")
                .pattern(Pattern::ordered(
                    "left",
                    vec![field_wild(), field_multi_var("tail")],
                ))
                .pattern(Pattern::ordered(
                    "right",
                    vec![field_wild(), field_multi_var("tail")],
                ))
                .action(RhsAction::assert_ordered(
                    "same",
                    vec![PatternExpr::var("tail")],
                )),
        )
        .unwrap();

    assert_syms(&mut engine, "left", &["l", "t1", "t2"]);
    assert_syms(&mut engine, "right", &["r", "t1", "t2"]);
    assert_syms(&mut engine, "right", &["r", "other"]);
    assert_eq!(engine.agenda_len(MAIN_MODULE), 1);
    engine.run(None);
    assert!(has_fact(&engine, "(same t1 t2)"));
}

#[test]
fn e2e_retraction_removes_every_segmentation_match() {
    let mut engine = engine_with(&["list", "element"]);
    engine
        .add_rule(
            &RuleDef::new("each")
                .pattern(Pattern::ordered(
                    "list",
                    vec![field_multi_wild(), field_var("x"), field_multi_wild()],
                ))
                .action(RhsAction::Halt),
        )
        .unwrap();

    let fact = assert_syms(&mut engine, "list", &["p", "q", "r"]);
    assert_eq!(engine.agenda_len(MAIN_MODULE), 3);
    engine.retract(fact).unwrap();
    assert_eq!(engine.agenda_len(MAIN_MODULE), 0);
    assert!(engine.net.is_quiescent());
}
