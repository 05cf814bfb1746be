//! # cascara-compile
//!
//! Rule installation for the cascara engine: the bridge between a
//! frontend's rule AST and a live match network.
//!
//! - [`ast`] — the typed rule tree a parser (or an embedder) produces
//! - [`analysis`] — variable analysis, nand scoping, constraint
//!   propagation, or-expansion
//! - [`codegen`] — alpha test synthesis, join chaining, equi-join key
//!   factoring, shared-node attachment
//!
//! The contract matches the engine's error policy: [`install_rule`]
//! either installs the whole rule (every disjunct attached, activations
//! for existing facts queued) or returns an [`AnalysisError`] having
//! touched nothing.

pub mod analysis;
pub mod ast;
pub mod codegen;
pub mod error;

pub use codegen::{install_rule, remove_rule};
pub use error::{AnalysisError, AnalysisResult};

#[cfg(test)]
mod tests {
    use crate::ast::*;
    use crate::codegen::{install_rule, remove_rule};
    use crate::error::AnalysisError;
    use cascara_base::{AtomTable, Value};
    use cascara_data::{
        FetchDesc, FieldRef, NoExternals, SlotId, Template, WorkingMemory, MAIN_MODULE,
    };
    use cascara_kernel::{EntityRef, MatchEvent, Network};

    struct Fixture {
        atoms: AtomTable,
        wm: WorkingMemory,
        net: Network,
    }

    impl Fixture {
        fn new() -> Fixture {
            Fixture {
                atoms: AtomTable::new(),
                wm: WorkingMemory::new(),
                net: Network::new(),
            }
        }

        fn ordered_template(&mut self, name: &str) {
            let atom = self.atoms.intern_symbol(name);
            let t = Template::ordered(&mut self.atoms, atom, MAIN_MODULE);
            self.wm.define_template(&mut self.atoms, t).unwrap();
        }

        fn install(&mut self, def: &RuleDef) -> Result<cascara_kernel::RuleId, AnalysisError> {
            install_rule(
                &mut self.atoms,
                &self.wm,
                &mut self.net,
                &mut NoExternals,
                MAIN_MODULE,
                &[MAIN_MODULE],
                def,
            )
        }

        fn assert_ordered(&mut self, template: &str, fields: &[&str]) -> EntityRef {
            let atom = self.atoms.intern_symbol(template);
            let t = self.wm.template_id(MAIN_MODULE, atom).unwrap();
            let field_atoms: Vec<_> = fields
                .iter()
                .map(|f| self.atoms.intern_symbol(f))
                .collect();
            let id = self
                .wm
                .assert_fact(
                    &mut self.atoms,
                    t,
                    vec![Value::Multi(cascara_base::Multifield::from_atoms(field_atoms))],
                    false,
                )
                .unwrap();
            let entity = EntityRef::Fact(id);
            self.net
                .assert_entity(&mut self.atoms, &self.wm, &mut NoExternals, entity);
            entity
        }

        fn activations(&mut self) -> Vec<MatchEvent> {
            self.net
                .take_events()
                .into_iter()
                .filter(|e| matches!(e, MatchEvent::Activate { .. }))
                .collect()
        }
    }

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
    fn cross_pattern_join_compiles_and_matches() {
        let mut fx = Fixture::new();
        fx.ordered_template("parent");
        fx.ordered_template("grandparent");
        fx.install(&grandparent_rule()).unwrap();

        fx.assert_ordered("parent", &["a", "b"]);
        fx.assert_ordered("parent", &["b", "c"]);
        let activations = fx.activations();
        assert_eq!(activations.len(), 1);

        // The join bound ?p to a and ?g to c.
        if let MatchEvent::Activate { token, .. } = activations[0] {
            let p = fx
                .net
                .fetch_from_token(
                    &fx.wm,
                    token,
                    &FetchDesc {
                        pattern: 0,
                        slot: SlotId(0),
                        which: FieldRef::Item { chain: 0, item: 0, multi: false },
                    },
                )
                .unwrap();
            let a = fx.atoms.intern_symbol("a");
            assert_eq!(p, Value::Atom(a));
        }
    }

    #[test]
    fn join_key_is_factored_for_shared_variable() {
        let mut fx = Fixture::new();
        fx.ordered_template("parent");
        fx.ordered_template("grandparent");
        let rule = fx.install(&grandparent_rule()).unwrap();
        let terminal = fx.net.rules[rule].disjuncts[0].terminal;
        let join = &fx.net.joins[terminal];
        assert_eq!(join.left_key.len(), 1);
        assert_eq!(join.right_key.len(), 1);
        assert!(join.tests.is_empty());
    }

    #[test]
    fn negated_pattern_via_ast() {
        let mut fx = Fixture::new();
        fx.ordered_template("room");
        fx.ordered_template("occupied");
        let rule = RuleDef::new("free-room")
            .pattern(Pattern::ordered("room", vec![field_var("r")]))
            .cond(CondElem::Not(vec![CondElem::Pattern(Pattern::ordered(
                "occupied",
                vec![field_var("r")],
            ))]))
            .action(RhsAction::assert_ordered(
                "room",
                vec![PatternExpr::var("r")],
            ));
        // The RHS re-asserting rooms is irrelevant here; only matching
        // is exercised.
        fx.install(&rule).unwrap();

        fx.assert_ordered("room", &["r1"]);
        fx.assert_ordered("room", &["r2"]);
        fx.assert_ordered("occupied", &["r1"]);
        // Both rooms activated on assert; r1's activation was withdrawn
        // when the occupied fact arrived.
        assert_eq!(fx.activations().len(), 2);
        let rule = fx
            .net
            .rule_id(MAIN_MODULE, fx.atoms.intern_symbol("free-room"))
            .unwrap();
        let terminal = fx.net.rules[rule].disjuncts[0].terminal;
        assert_eq!(fx.net.joins[terminal].out.len(), 1);
    }

    #[test]
    fn or_expands_into_disjuncts() {
        let mut fx = Fixture::new();
        fx.ordered_template("alpha");
        fx.ordered_template("beta");
        let rule = RuleDef::new("either")
            .cond(CondElem::Or(vec![
                CondElem::Pattern(Pattern::ordered("alpha", vec![field_var("x")])),
                CondElem::Pattern(Pattern::ordered("beta", vec![field_var("x")])),
            ]))
            .action(RhsAction::Halt);
        let id = fx.install(&rule).unwrap();
        assert_eq!(fx.net.rules[id].disjuncts.len(), 2);

        fx.assert_ordered("alpha", &["1"]);
        fx.assert_ordered("beta", &["1"]);
        assert_eq!(fx.activations().len(), 2);
    }

    #[test]
    fn unbound_rhs_variable_is_rejected() {
        let mut fx = Fixture::new();
        fx.ordered_template("thing");
        let rule = RuleDef::new("broken")
            .pattern(Pattern::ordered("thing", vec![field_var("x")]))
            .action(RhsAction::assert_ordered(
                "thing",
                vec![PatternExpr::var("y")],
            ));
        assert_eq!(
            fx.install(&rule),
            Err(AnalysisError::UnboundVariable("y".to_string()))
        );
        // Nothing was attached.
        assert!(fx.net.joins.is_empty());
    }

    #[test]
    fn mixed_cardinality_is_rejected() {
        let mut fx = Fixture::new();
        fx.ordered_template("thing");
        let rule = RuleDef::new("mixed")
            .pattern(Pattern::ordered("thing", vec![field_var("x")]))
            .pattern(Pattern::ordered("thing", vec![field_multi_var("x")]))
            .action(RhsAction::Halt);
        assert_eq!(
            fx.install(&rule),
            Err(AnalysisError::MixedCardinality("x".to_string()))
        );
    }

    #[test]
    fn variable_bound_in_not_is_scoped() {
        let mut fx = Fixture::new();
        fx.ordered_template("a");
        fx.ordered_template("b");
        let rule = RuleDef::new("escape")
            .cond(CondElem::Pattern(Pattern::ordered("a", vec![field_wild()])))
            .cond(CondElem::Not(vec![CondElem::Pattern(Pattern::ordered(
                "b",
                vec![field_var("x")],
            ))]))
            .action(RhsAction::assert_ordered("a", vec![PatternExpr::var("x")]));
        assert_eq!(
            fx.install(&rule),
            Err(AnalysisError::CrossScopeVariable("x".to_string()))
        );
    }

    #[test]
    fn duplicate_address_variable_is_rejected() {
        let mut fx = Fixture::new();
        fx.ordered_template("thing");
        let rule = RuleDef::new("dup")
            .pattern(Pattern::ordered("thing", vec![field_wild()]).bound_to("f"))
            .pattern(Pattern::ordered("thing", vec![field_wild()]).bound_to("f"))
            .action(RhsAction::Halt);
        assert_eq!(
            fx.install(&rule),
            Err(AnalysisError::DuplicatePatternVariable("f".to_string()))
        );
    }

    #[test]
    fn unknown_template_is_rejected() {
        let mut fx = Fixture::new();
        let rule = RuleDef::new("ghost")
            .pattern(Pattern::ordered("missing", vec![]))
            .action(RhsAction::Halt);
        assert_eq!(
            fx.install(&rule),
            Err(AnalysisError::NoSuchTemplate("missing".to_string()))
        );
    }

    #[test]
    fn remove_rule_restores_the_network() {
        let mut fx = Fixture::new();
        fx.ordered_template("parent");
        fx.ordered_template("grandparent");
        let live_before = fx.atoms.live_count();
        let rule = fx.install(&grandparent_rule()).unwrap();
        fx.assert_ordered("parent", &["a", "b"]);
        fx.assert_ordered("parent", &["b", "c"]);
        fx.net.take_events();

        assert!(remove_rule(&mut fx.atoms, &mut fx.net, rule));
        assert!(fx.net.joins.is_empty());
        assert!(fx.net.alpha.memories.is_empty());
        // Atoms interned for the rule's constants are released; the
        // fact fields (a, b, c) are still installed by working memory.
        assert!(fx.atoms.live_count() >= live_before);
    }

    #[test]
    fn second_rule_shares_the_join_prefix() {
        let mut fx = Fixture::new();
        fx.ordered_template("parent");
        fx.ordered_template("grandparent");
        fx.install(&grandparent_rule()).unwrap();
        let joins_before = fx.net.joins.len();
        // Same LHS, different action list: the non-terminal prefix is
        // shared; only the terminal join is new.
        let sibling = RuleDef::new("grandparent-too")
            .pattern(Pattern::ordered(
                "parent",
                vec![field_var("p"), field_var("c")],
            ))
            .pattern(Pattern::ordered(
                "parent",
                vec![field_var("c"), field_var("g")],
            ))
            .action(RhsAction::Halt);
        fx.install(&sibling).unwrap();
        assert_eq!(fx.net.joins.len(), joins_before + 1);
    }
}
