//! Shared helpers for the end-to-end suite.

#![allow(dead_code)]

use cascara_base::Value;
use cascara_data::FactId;
use cascara_system::Engine;

/// An engine with the given ordered templates pre-defined.
pub fn engine_with(ordered: &[&str]) -> Engine {
    let mut engine = Engine::new();
    for name in ordered {
        engine.define_ordered_template(name).unwrap();
    }
    engine
}

pub fn sym(engine: &mut Engine, text: &str) -> Value {
    Value::Atom(engine.atoms.intern_symbol(text))
}

pub fn int(engine: &mut Engine, n: i64) -> Value {
    Value::Atom(engine.atoms.integer(n))
}

/// Asserts an ordered fact of symbols.
pub fn assert_syms(engine: &mut Engine, template: &str, fields: &[&str]) -> FactId {
    let t = engine.template_named(template).unwrap();
    let values: Vec<Value> = fields.iter().map(|f| sym(engine, f)).collect();
    engine.assert_ordered(t, values).unwrap()
}

/// Asserts an ordered fact of integers.
pub fn assert_ints(engine: &mut Engine, template: &str, fields: &[i64]) -> FactId {
    let t = engine.template_named(template).unwrap();
    let values: Vec<Value> = fields.iter().map(|n| int(engine, *n)).collect();
    engine.assert_ordered(t, values).unwrap()
}

/// Every live fact, rendered the way watch traces print them.
pub fn rendered(engine: &Engine) -> Vec<String> {
    engine
        .facts_snapshot()
        .into_iter()
        .map(|f| f.rendered)
        .collect()
}

pub fn has_fact(engine: &Engine, text: &str) -> bool {
    rendered(engine).iter().any(|f| f == text)
}
