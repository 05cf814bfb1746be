//! E2E: salience, strategies, refraction, and watch output.

mod common;

use cascara_compile::ast::*;
use cascara_data::MAIN_MODULE;
use cascara_system::{BufferSink, Engine, EngineConfig, Strategy, WatchItem, WTRACE};
use common::*;

#[test]
fn e2e_salience_orders_firings() {
    let mut engine = engine_with(&["go", "log"]);
    for (name, salience, tag) in [("low", 0, "second"), ("high", 10, "first")] {
        engine
            .add_rule(
                &RuleDef::new(name)
                    .salience(salience)
                    .pattern(Pattern::ordered("go", vec![]))
                    .action(RhsAction::assert_ordered(
                        "log",
                        vec![PatternExpr::sym(tag)],
                    )),
            )
            .unwrap();
    }
    assert_syms(&mut engine, "go", &[]);
    assert_eq!(engine.agenda_len(MAIN_MODULE), 2);

    // The salience-10 rule fires first.
    engine.run(Some(1));
    assert!(has_fact(&engine, "(log first)"));
    assert!(!has_fact(&engine, "(log second)"));
    engine.run(None);
    assert!(has_fact(&engine, "(log second)"));
}

#[test]
fn e2e_refraction_prevents_refiring_without_change() {
    let mut engine = engine_with(&["fact", "note"]);
    engine
        .add_rule(
            &RuleDef::new("once")
                .pattern(Pattern::ordered("fact", vec![field_wild()]))
                .action(RhsAction::assert_ordered(
                    "note",
                    vec![PatternExpr::sym("seen")],
                )),
        )
        .unwrap();
    assert_ints(&mut engine, "fact", &[1]);
    assert_eq!(engine.run(None), 1);
    // Running again with no working-memory change fires nothing.
    assert_eq!(engine.run(None), 0);
    assert_eq!(engine.run(None), 0);
}

#[test]
fn e2e_refresh_reactivates_fired_matches() {
    let mut engine = engine_with(&["fact", "note"]);
    engine
        .add_rule(
            &RuleDef::new("once")
                .pattern(Pattern::ordered("fact", vec![field_wild()]))
                .action(RhsAction::assert_ordered(
                    "note",
                    vec![PatternExpr::sym("seen")],
                )),
        )
        .unwrap();
    assert_ints(&mut engine, "fact", &[1]);
    engine.run(None);
    assert_eq!(engine.agenda_len(MAIN_MODULE), 0);

    assert!(engine.refresh_rule("once"));
    assert_eq!(engine.agenda_len(MAIN_MODULE), 1);
    assert_eq!(engine.run(None), 1);
}

#[test]
fn e2e_strategy_change_resorts_the_agenda() {
    let mut engine = engine_with(&["item", "first"]);
    engine
        .add_rule(
            &RuleDef::new("pick")
                .pattern(Pattern::ordered("item", vec![field_var("x")]))
                .action(RhsAction::assert_ordered(
                    "first",
                    vec![PatternExpr::var("x")],
                )),
        )
        .unwrap();
    assert_syms(&mut engine, "item", &["old"]);
    assert_syms(&mut engine, "item", &["new"]);

    // Depth (default) would fire "new" first; switching to breadth
    // before running flips the order.
    engine.set_strategy(Strategy::Breadth);
    engine.run(Some(1));
    assert!(has_fact(&engine, "(first old)"));
}

#[test]
fn e2e_complexity_strategies_use_rule_size() {
    let run_with = |strategy: Strategy| -> String {
        let mut engine = Engine::with_config(EngineConfig {
            strategy,
            ..EngineConfig::default()
        });
        engine.define_ordered_template("a").unwrap();
        engine.define_ordered_template("b").unwrap();
        engine.define_ordered_template("winner").unwrap();
        engine
            .add_rule(
                &RuleDef::new("small")
                    .pattern(Pattern::ordered("a", vec![]))
                    .action(RhsAction::assert_ordered(
                        "winner",
                        vec![PatternExpr::sym("small")],
                    )),
            )
            .unwrap();
        engine
            .add_rule(
                &RuleDef::new("big")
                    .pattern(Pattern::ordered("a", vec![]))
                    .pattern(Pattern::ordered("b", vec![]))
                    .action(RhsAction::assert_ordered(
                        "winner",
                        vec![PatternExpr::sym("big")],
                    )),
            )
            .unwrap();
        assert_syms(&mut engine, "b", &[]);
        assert_syms(&mut engine, "a", &[]);
        engine.run(Some(1));
        rendered(&engine)
            .into_iter()
            .find(|f| f.starts_with("(winner"))
            .unwrap_or_default()
    };
    assert_eq!(run_with(Strategy::Simplicity), "(winner small)");
    assert_eq!(run_with(Strategy::Complexity), "(winner big)");
}

#[test]
fn e2e_dynamic_salience_reads_globals() {
    let mut engine = engine_with(&["go", "log"]);
    let five = int(&mut engine, 5);
    engine.define_global("*urgency*", five);
    let mut urgent = RuleDef::new("urgent")
        .pattern(Pattern::ordered("go", vec![]))
        .action(RhsAction::assert_ordered(
            "log",
            vec![PatternExpr::sym("urgent")],
        ));
    urgent.dynamic_salience = Some(PatternExpr::Global("*urgency*".to_string()));
    engine.add_rule(&urgent).unwrap();
    engine
        .add_rule(
            &RuleDef::new("calm")
                .salience(1)
                .pattern(Pattern::ordered("go", vec![]))
                .action(RhsAction::assert_ordered(
                    "log",
                    vec![PatternExpr::sym("calm")],
                )),
        )
        .unwrap();

    assert_syms(&mut engine, "go", &[]);
    engine.run(Some(1));
    // Salience 5 (from the global) beats salience 1.
    assert!(has_fact(&engine, "(log urgent)"));
}

#[test]
fn e2e_watch_activations_and_rules_trace() {
    let mut engine = engine_with(&["go", "log"]);
    let buffer = BufferSink::new();
    let sink = engine.router.add_sink(Box::new(buffer.clone()));
    engine.router.route(WTRACE, sink);
    engine.set_watch(WatchItem::Activations, true);
    engine.set_watch(WatchItem::Rules, true);

    engine
        .add_rule(
            &RuleDef::new("noisy")
                .pattern(Pattern::ordered("go", vec![]))
                .action(RhsAction::assert_ordered(
                    "log",
                    vec![PatternExpr::sym("x")],
                )),
        )
        .unwrap();
    assert_syms(&mut engine, "go", &[]);
    engine.run(None);

    let output = buffer.contents();
    assert!(output.contains("==> Activation"));
    assert!(output.contains("FIRE 1 noisy"));
}
