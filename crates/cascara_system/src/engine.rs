//! The engine: one context object owning every subsystem.
//!
//! An [`Engine`] owns the atom table, working memory, match network,
//! agendas, focus stack, router, globals, and configuration — there are
//! no process-wide statics, so independent engines coexist freely.
//!
//! Change discipline: every public working-memory operation (assert,
//! retract, modify) fully propagates through the network, cascades any
//! logical-support retractions, and syncs the agendas before it
//! returns. Storage for retracted entities is released only after that,
//! and never while a firing still holds the entity in its bindings.
//!
//! The firing loop consults the focus stack: the top module's best
//! activation fires; a module whose agenda empties is popped (the
//! bottom module stays resident). Actions re-enter the engine through
//! the same operations hosts use, so their effects are fully propagated
//! before the next action runs.

use crate::agenda::{Activation, Agenda};
use crate::config::{EngineConfig, ErrorPolicy, SalienceEval, Strategy};
use crate::globals::{GlobalBindings, Globals};
use crate::module::ModuleRegistry;
use crate::router::{Router, WDIALOG, WERROR, WTRACE};
use crate::watch::{WatchFlags, WatchItem};
use cascara_base::{AtomId, AtomTable, Handle, HandleKind, Multifield, Value};
use cascara_compile::ast::RuleDef;
use cascara_compile::AnalysisError;
use cascara_data::{
    eval, flatten_to_multifield, AssertError, ClassId, ConstraintCheck, DefaultSpec, DefineError,
    Expr, ExternalDispatch, FactId, InstanceId, ModuleId, NoExternals, SlotAccess, SlotId,
    SlotSpec, Template, TemplateId, WorkingMemory, MAIN_MODULE,
};
use cascara_kernel::{
    Action, ActionSlot, DetachedBinds, EntityRef, FiringBindings, MatchEvent, Network, RuleId,
    TokenId,
};
use serde::Serialize;

/// Whether an assert carries logical support.
#[derive(Clone, Copy)]
enum SupportMode {
    Unconditional,
    Supported(TokenId),
}

struct FiringState {
    binds: DetachedBinds,
    locals: Vec<Option<Value>>,
    supporter: Option<TokenId>,
}

impl FiringState {
    fn support_mode(&self) -> SupportMode {
        match self.supporter {
            Some(token) => SupportMode::Supported(token),
            None => SupportMode::Unconditional,
        }
    }
}

/// One-line agenda entry for hosts and tests.
#[derive(Clone, PartialEq, Eq, Debug, Serialize)]
pub struct ActivationSnapshot {
    pub rule: String,
    pub salience: i32,
    pub fact_numbers: Vec<usize>,
}

/// One-line working-memory entry for hosts and tests.
#[derive(Clone, PartialEq, Eq, Debug, Serialize)]
pub struct FactSnapshot {
    pub number: usize,
    pub rendered: String,
}

/// The forward-chaining engine.
pub struct Engine {
    pub atoms: AtomTable,
    pub wm: WorkingMemory,
    pub net: Network,
    pub router: Router,
    pub watch: WatchFlags,
    config: EngineConfig,
    modules: ModuleRegistry,
    agendas: Vec<Agenda>,
    focus: Vec<ModuleId>,
    globals: Globals,
    externals: Box<dyn ExternalDispatch>,
    halt: bool,
    graveyard: Vec<EntityRef>,
    basis_pinned: Vec<InstanceId>,
    in_firing: bool,
    fired_total: u64,
}

impl Engine {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let mut atoms = AtomTable::new();
        let main_name = atoms.intern_symbol("MAIN");
        let mut net = Network::new();
        net.hashing_enabled = config.hashed_memories;
        Engine {
            atoms,
            wm: WorkingMemory::new(),
            net,
            router: Router::new(),
            watch: WatchFlags::default(),
            config,
            modules: ModuleRegistry::new(main_name),
            agendas: vec![Agenda::new()],
            focus: vec![MAIN_MODULE],
            globals: Globals::new(),
            externals: Box::new(NoExternals),
            halt: false,
            graveyard: Vec::new(),
            basis_pinned: Vec::new(),
            in_firing: false,
            fired_total: 0,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Installs the host's function dispatcher.
    pub fn set_external_dispatch(&mut self, externals: Box<dyn ExternalDispatch>) {
        self.externals = externals;
    }

    pub fn set_strategy(&mut self, strategy: Strategy) {
        self.config.strategy = strategy;
        for agenda in &mut self.agendas {
            agenda.resort(strategy);
        }
    }

    pub fn set_salience_eval(&mut self, mode: SalienceEval) {
        self.config.salience_eval = mode;
    }

    pub fn set_watch(&mut self, item: WatchItem, on: bool) {
        self.watch.set(item, on);
    }

    // ==================================================================
    // Modules and focus
    // ==================================================================

    pub fn define_module(&mut self, name: &str, imports: Vec<ModuleId>) -> Option<ModuleId> {
        let atom = self.atoms.intern_symbol(name);
        let id = self.modules.define(atom, imports)?;
        self.atoms.install(atom);
        self.agendas.push(Agenda::new());
        Some(id)
    }

    pub fn module_named(&mut self, name: &str) -> Option<ModuleId> {
        let atom = self.atoms.intern_symbol(name);
        self.modules.by_name(atom)
    }

    /// Pushes a module onto the focus stack.
    pub fn focus(&mut self, module: ModuleId) {
        if self.focus.last() != Some(&module) {
            self.focus.push(module);
        }
    }

    pub fn pop_focus(&mut self) -> Option<ModuleId> {
        self.focus.pop()
    }

    pub fn clear_focus(&mut self) {
        self.focus.clear();
        self.focus.push(MAIN_MODULE);
    }

    pub fn current_focus(&self) -> Option<ModuleId> {
        self.focus.last().copied()
    }

    // ==================================================================
    // Schema definition
    // ==================================================================

    pub fn define_template(&mut self, template: Template) -> Result<TemplateId, DefineError> {
        let name = self.atoms.text(template.name).unwrap_or_default().to_string();
        let id = self.wm.define_template(&mut self.atoms, template)?;
        if self.watch.compilations {
            self.router
                .println(WDIALOG, &format!("Defining deftemplate: {}", name));
        }
        Ok(id)
    }

    /// Defines an ordered template (one implied multifield slot).
    pub fn define_ordered_template(&mut self, name: &str) -> Result<TemplateId, DefineError> {
        let atom = self.atoms.intern_symbol(name);
        let template = Template::ordered(&mut self.atoms, atom, MAIN_MODULE);
        self.define_template(template)
    }

    pub fn template_named(&mut self, name: &str) -> Option<TemplateId> {
        let atom = self.atoms.intern_symbol(name);
        self.wm.template_id(MAIN_MODULE, atom)
    }

    /// Removes a template no rule's pattern reads and no live fact uses.
    pub fn remove_template(&mut self, id: TemplateId) -> Result<(), DefineError> {
        if self.net.alpha.template_roots.contains_key(&id) {
            let name = self
                .atoms
                .text(self.wm.templates[id].name)
                .unwrap_or_default()
                .to_string();
            return Err(DefineError::InUse(name));
        }
        self.wm.remove_template(&mut self.atoms, id)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn define_class(
        &mut self,
        name: &str,
        module: ModuleId,
        supers: Vec<ClassId>,
        slots: Vec<SlotSpec>,
        reactive: bool,
    ) -> Result<ClassId, DefineError> {
        let atom = self.atoms.intern_symbol(name);
        let id = self
            .wm
            .define_class(&mut self.atoms, atom, module, supers, slots, reactive)?;
        if self.watch.compilations {
            self.router
                .println(WDIALOG, &format!("Defining defclass: {}", name));
        }
        Ok(id)
    }

    // ==================================================================
    // Globals
    // ==================================================================

    pub fn define_global(&mut self, name: &str, value: Value) {
        let atom = self.atoms.intern_symbol(name);
        self.globals.define(&mut self.atoms, atom, value);
    }

    pub fn set_global(&mut self, name: &str, value: Value) -> bool {
        let atom = self.atoms.intern_symbol(name);
        self.globals.set(&mut self.atoms, atom, value)
    }

    pub fn global(&mut self, name: &str) -> Option<Value> {
        let atom = self.atoms.intern_symbol(name);
        self.globals.get(atom).cloned()
    }

    // ==================================================================
    // Rules
    // ==================================================================

    pub fn add_rule(&mut self, def: &RuleDef) -> Result<RuleId, AnalysisError> {
        self.add_rule_in(MAIN_MODULE, def)
    }

    pub fn add_rule_in(
        &mut self,
        module: ModuleId,
        def: &RuleDef,
    ) -> Result<RuleId, AnalysisError> {
        let search = self.modules.visible_from(module);
        let rule = cascara_compile::install_rule(
            &mut self.atoms,
            &self.wm,
            &mut self.net,
            self.externals.as_mut(),
            module,
            &search,
            def,
        )?;
        if self.config.salience_eval == SalienceEval::WhenDefined {
            if let Some(expr) = self.net.rules[rule].dynamic_salience.clone() {
                let salience = self.eval_salience(&expr, self.net.rules[rule].salience);
                self.net.rules[rule].salience = salience;
            }
        }
        if self.watch.compilations {
            self.router
                .println(WDIALOG, &format!("Defining defrule: {}", def.name));
        }
        self.finish_change();
        Ok(rule)
    }

    pub fn remove_rule_named(&mut self, name: &str) -> bool {
        let atom = self.atoms.intern_symbol(name);
        match self.net.rule_id(MAIN_MODULE, atom) {
            Some(rule) => {
                let removed = cascara_compile::remove_rule(&mut self.atoms, &mut self.net, rule);
                self.finish_change();
                removed
            }
            None => false,
        }
    }

    /// Lets a rule's surviving (already fired) matches activate again.
    pub fn refresh_rule(&mut self, name: &str) -> bool {
        let atom = self.atoms.intern_symbol(name);
        let Some(rule) = self.net.rule_id(MAIN_MODULE, atom) else {
            return false;
        };
        let module = self.net.rules[rule].module;
        let cleared = self.agendas[module.0 as usize].refresh_rule(rule);
        for (disjunct, token) in cleared {
            if self.net.tokens.contains(token) {
                self.enqueue_activation(rule, disjunct, token);
            }
        }
        true
    }

    // ==================================================================
    // Working-memory operations
    // ==================================================================

    /// Asserts an ordered fact: the fields land in the implied slot.
    pub fn assert_ordered(
        &mut self,
        template: TemplateId,
        fields: Vec<Value>,
    ) -> Result<FactId, AssertError> {
        let multi = flatten_to_multifield(&fields).ok_or(AssertError::CardinalityMismatch {
            slot: "__fields".to_string(),
        })?;
        self.do_assert(template, vec![Value::Multi(multi)], SupportMode::Unconditional)
    }

    /// Asserts a template fact; omitted slots take their defaults.
    pub fn assert_slots(
        &mut self,
        template: TemplateId,
        values: Vec<(SlotId, Value)>,
    ) -> Result<FactId, AssertError> {
        let slots = self.fill_slots(template, values)?;
        self.do_assert(template, slots, SupportMode::Unconditional)
    }

    pub fn retract(&mut self, fact: FactId) -> Result<(), AssertError> {
        self.do_retract(fact)
    }

    /// Retract-then-assert with updated slots; a new fact with a new
    /// timestamp. Returns the new fact.
    pub fn modify(
        &mut self,
        fact: FactId,
        sets: Vec<(SlotId, Value)>,
    ) -> Result<FactId, AssertError> {
        let (template, mut slots) = {
            let f = self.wm.facts.get(fact).ok_or(AssertError::Gone)?;
            if f.garbage {
                return Err(AssertError::Gone);
            }
            (f.template, f.slots.clone())
        };
        for (slot, value) in sets {
            let spec = self.wm.templates[template].slot(slot).clone();
            if spec.access == SlotAccess::ReadOnly {
                return Err(AssertError::ReadOnlySlot {
                    slot: self.atoms.text(spec.name).unwrap_or_default().to_string(),
                });
            }
            slots[slot.index()] = normalize_for_slot(&spec, value);
        }
        self.do_retract(fact)?;
        self.do_assert(template, slots, SupportMode::Unconditional)
    }

    /// Asserts a copy of the fact with the given slots replaced.
    pub fn duplicate(
        &mut self,
        fact: FactId,
        sets: Vec<(SlotId, Value)>,
    ) -> Result<FactId, AssertError> {
        let (template, mut slots) = {
            let f = self.wm.facts.get(fact).ok_or(AssertError::Gone)?;
            if f.garbage {
                return Err(AssertError::Gone);
            }
            (f.template, f.slots.clone())
        };
        for (slot, value) in sets {
            let spec = self.wm.templates[template].slot(slot).clone();
            slots[slot.index()] = normalize_for_slot(&spec, value);
        }
        self.do_assert(template, slots, SupportMode::Unconditional)
    }

    pub fn make_instance(
        &mut self,
        name: &str,
        class: ClassId,
        values: Vec<(SlotId, Value)>,
    ) -> Result<InstanceId, AssertError> {
        let name_atom = self.atoms.intern_instance_name(name);
        let slots = self.fill_class_slots(class, values)?;
        let id = self
            .wm
            .make_instance(&mut self.atoms, name_atom, class, slots)?;
        if self.wm.classes[class].reactive {
            let entity = EntityRef::Instance(id);
            self.net
                .assert_entity(&mut self.atoms, &self.wm, self.externals.as_mut(), entity);
        }
        self.finish_change();
        Ok(id)
    }

    pub fn unmake_instance(&mut self, id: InstanceId) -> Result<(), AssertError> {
        let entity = EntityRef::Instance(id);
        self.wm.retract_instance(id)?;
        self.net
            .retract_entity(&mut self.atoms, &self.wm, self.externals.as_mut(), entity);
        self.graveyard.push(entity);
        self.finish_change();
        Ok(())
    }

    /// Updates instance slots in place: the matcher re-matches against
    /// the new values while any in-flight firing keeps reading the
    /// pinned pre-modify snapshot.
    pub fn modify_instance(
        &mut self,
        id: InstanceId,
        sets: Vec<(SlotId, Value)>,
    ) -> Result<(), AssertError> {
        let class = {
            let inst = self.wm.instances.get(id).ok_or(AssertError::Gone)?;
            if inst.garbage {
                return Err(AssertError::Gone);
            }
            inst.class
        };
        let mut new_slots = self.wm.instances[id].slots.clone();
        for (slot, value) in sets {
            let spec = self.wm.classes[class].slot(slot).clone();
            if spec.access == SlotAccess::ReadOnly {
                return Err(AssertError::ReadOnlySlot {
                    slot: self.atoms.text(spec.name).unwrap_or_default().to_string(),
                });
            }
            let value = normalize_for_slot(&spec, value);
            match spec.constraint.check(&self.atoms, &value) {
                ConstraintCheck::Ok => {}
                violation => {
                    return Err(AssertError::ConstraintViolation {
                        slot: self.atoms.text(spec.name).unwrap_or_default().to_string(),
                        violation,
                    })
                }
            }
            new_slots[slot.index()] = value;
        }

        let entity = EntityRef::Instance(id);
        let reactive = self.wm.classes[class].reactive;
        if reactive {
            self.net
                .retract_entity(&mut self.atoms, &self.wm, self.externals.as_mut(), entity);
        }
        for value in &new_slots {
            cascara_base::install_value(&mut self.atoms, value);
        }
        {
            let time_tag = self.wm.next_time_tag();
            let inst = &mut self.wm.instances[id];
            let old = std::mem::replace(&mut inst.slots, new_slots);
            if inst.basis.is_none() {
                // Pin the pre-modify values; their install counts move
                // with them and are released when the basis clears.
                inst.basis = Some(old);
                self.basis_pinned.push(id);
            } else {
                for value in &old {
                    cascara_base::deinstall_value(&mut self.atoms, value);
                }
            }
            inst.time_tag = time_tag;
        }
        if reactive {
            self.net
                .assert_entity(&mut self.atoms, &self.wm, self.externals.as_mut(), entity);
        }
        self.finish_change();
        if !self.in_firing {
            self.clear_pinned_bases();
        }
        Ok(())
    }

    // ==================================================================
    // Execution
    // ==================================================================

    pub fn halt(&mut self) {
        self.halt = true;
    }

    /// Fires activations until the focus drains, a limit is reached, or
    /// something halts the engine. Returns the number of rules fired.
    pub fn run(&mut self, limit: Option<u64>) -> u64 {
        self.halt = false;
        let mut fired = 0u64;
        loop {
            if self.halt || limit.is_some_and(|l| fired >= l) {
                break;
            }
            let module = loop {
                match self.focus.last().copied() {
                    None => break None,
                    Some(top) => {
                        if !self.agendas[top.0 as usize].is_empty() {
                            break Some(top);
                        }
                        if self.focus.len() == 1 {
                            // The bottom module stays resident.
                            break None;
                        }
                        self.focus.pop();
                    }
                }
            };
            let Some(module) = module else { break };
            if self.config.salience_eval == SalienceEval::EveryCycle {
                self.reevaluate_salience(module);
            }
            let Some(activation) = self.agendas[module.0 as usize].pop_best() else {
                continue;
            };
            fired += 1;
            self.fire(activation, fired);
        }
        if self.watch.statistics {
            self.router
                .println(WDIALOG, &format!("{} rules fired", fired));
        }
        self.fired_total += fired;
        fired
    }

    pub fn fired_total(&self) -> u64 {
        self.fired_total
    }

    /// Retracts everything, drains the agendas, restores globals and
    /// the focus stack.
    pub fn reset(&mut self) {
        self.halt = false;
        let facts = self.wm.all_facts();
        for fact in facts {
            let _ = self.do_retract(fact);
        }
        let instances: Vec<InstanceId> = self
            .wm
            .instances
            .iter()
            .filter(|(_, i)| !i.garbage)
            .map(|(id, _)| id)
            .collect();
        for id in instances {
            let _ = self.unmake_instance(id);
        }
        for agenda in &mut self.agendas {
            agenda.clear();
        }
        self.clear_focus();
        self.globals.reset(&mut self.atoms);
        self.sweep();
        self.wm.reset_time();
    }

    fn fire(&mut self, activation: Activation, ordinal: u64) {
        let rule = activation.rule;
        if !self.net.rules.contains(rule) || !self.net.tokens.contains(activation.token) {
            return;
        }
        let disjunct = activation.disjunct as usize;
        let (actions, local_count, logical_join, rule_name) = {
            let r = &self.net.rules[rule];
            let d = &r.disjuncts[disjunct];
            (
                d.actions.clone(),
                d.local_count,
                d.logical_join,
                self.atoms.text(r.name).unwrap_or_default().to_string(),
            )
        };
        if self.watch.rules {
            let numbers = self.entity_numbers(activation.token);
            self.router
                .println(WTRACE, &format!("FIRE {} {}: {}", ordinal, rule_name, numbers));
        }

        let binds = self.net.detach_token(activation.token);
        for entry in binds.entries.iter().flatten() {
            entry.0.busy_increment(&mut self.wm);
        }
        let supporter =
            logical_join.and_then(|j| self.net.token_prefix_at(activation.token, j));
        let mut state = FiringState {
            binds,
            locals: vec![None; local_count as usize],
            supporter,
        };

        self.in_firing = true;
        for action in &actions {
            match self.run_action(action, &mut state) {
                Ok(()) => {}
                Err(message) => {
                    self.router.println(
                        WERROR,
                        &format!("error while firing {}: {}", rule_name, message),
                    );
                    if self.config.error_policy == ErrorPolicy::Halt {
                        self.halt = true;
                    }
                    break;
                }
            }
        }
        self.in_firing = false;

        for entry in state.binds.entries.iter().flatten() {
            entry.0.busy_decrement(&mut self.wm);
        }
        self.clear_pinned_bases();
        self.sweep();
    }

    fn run_action(&mut self, action: &Action, state: &mut FiringState) -> Result<(), String> {
        match action {
            Action::Assert { template, slots } => {
                let values = self.eval_action_slots(*template, slots, state)?;
                match self.do_assert(*template, values, state.support_mode()) {
                    Ok(_) | Err(AssertError::Duplicate(_)) => Ok(()),
                    Err(e) => Err(e.to_string()),
                }
            }
            Action::Retract(target) => {
                let fact = self.eval_fact_target(target, state)?;
                self.do_retract(fact).map_err(|e| e.to_string())
            }
            Action::Modify { target, template, sets } => {
                let fact = self.eval_fact_target(target, state)?;
                let mut slots = {
                    let f = self.wm.facts.get(fact).ok_or("modify of a retracted fact")?;
                    if f.garbage {
                        return Err("modify of a retracted fact".to_string());
                    }
                    f.slots.clone()
                };
                self.apply_action_sets(*template, sets, &mut slots, state)?;
                self.do_retract(fact).map_err(|e| e.to_string())?;
                match self.do_assert(*template, slots, state.support_mode()) {
                    Ok(_) | Err(AssertError::Duplicate(_)) => Ok(()),
                    Err(e) => Err(e.to_string()),
                }
            }
            Action::Duplicate { target, template, sets } => {
                let fact = self.eval_fact_target(target, state)?;
                let mut slots = {
                    let f = self.wm.facts.get(fact).ok_or("duplicate of a retracted fact")?;
                    f.slots.clone()
                };
                self.apply_action_sets(*template, sets, &mut slots, state)?;
                match self.do_assert(*template, slots, state.support_mode()) {
                    Ok(_) | Err(AssertError::Duplicate(_)) => Ok(()),
                    Err(e) => Err(e.to_string()),
                }
            }
            Action::Bind { index, value } => {
                let value = self.eval_rhs(value, state)?;
                state.locals[*index as usize] = Some(value);
                Ok(())
            }
            Action::Halt => {
                self.halt = true;
                Ok(())
            }
            Action::Eval(expr) => {
                self.eval_rhs(expr, state)?;
                Ok(())
            }
        }
    }

    fn eval_rhs(&mut self, expr: &Expr, state: &FiringState) -> Result<Value, String> {
        let Engine {
            atoms,
            wm,
            globals,
            externals,
            ..
        } = self;
        let lookup = |name: AtomId| globals.get(name).cloned();
        let bindings = FiringBindings {
            binds: &state.binds,
            wm,
            locals: &state.locals,
            globals: &lookup,
        };
        eval(expr, atoms, &bindings, externals.as_mut()).map_err(|e| e.to_string())
    }

    fn eval_fact_target(&mut self, expr: &Expr, state: &FiringState) -> Result<FactId, String> {
        match self.eval_rhs(expr, state)? {
            Value::Handle(Handle {
                kind: HandleKind::Fact,
                index,
            }) => Ok(FactId::from_index(index as usize)),
            other => Err(format!(
                "expected a fact address, got {}",
                other.display(&self.atoms)
            )),
        }
    }

    /// Evaluates an action's slot expressions into a full slot vector,
    /// defaults filled for unmentioned slots.
    fn eval_action_slots(
        &mut self,
        template: TemplateId,
        slots: &[ActionSlot],
        state: &FiringState,
    ) -> Result<Vec<Value>, String> {
        let mut values = self.default_slots(template).map_err(|e| e.to_string())?;
        self.apply_action_sets(template, slots, &mut values, state)?;
        // Slots with no default carry a sentinel until an action sets
        // them; any survivor is an error.
        let spec = &self.wm.templates[template];
        for (i, value) in values.iter().enumerate() {
            if matches!(value, Value::Handle(h) if h.kind == HandleKind::External && h.index == u64::MAX)
            {
                let slot = self.atoms.text(spec.slots[i].name).unwrap_or_default();
                return Err(format!("slot '{}' has no default and was not set", slot));
            }
        }
        Ok(values)
    }

    fn apply_action_sets(
        &mut self,
        template: TemplateId,
        sets: &[ActionSlot],
        values: &mut [Value],
        state: &FiringState,
    ) -> Result<(), String> {
        for set in sets {
            let spec = self.wm.templates[template].slot(set.slot).clone();
            let mut evaluated = Vec::with_capacity(set.values.len());
            for expr in &set.values {
                evaluated.push(self.eval_rhs(expr, state)?);
            }
            let value = if spec.multi {
                Value::Multi(flatten_to_multifield(&evaluated).ok_or_else(|| {
                    format!(
                        "a fact address cannot be spliced into multifield slot '{}'",
                        self.atoms.text(spec.name).unwrap_or_default()
                    )
                })?)
            } else {
                if evaluated.len() != 1 {
                    return Err(format!(
                        "slot '{}' takes exactly one value",
                        self.atoms.text(spec.name).unwrap_or_default()
                    ));
                }
                evaluated.pop().expect("one value")
            };
            values[set.slot.index()] = value;
        }
        Ok(())
    }

    /// Initial slot vector from template defaults. Slots with no
    /// default get a sentinel that asserts reject if left unset.
    fn default_slots(&mut self, template: TemplateId) -> Result<Vec<Value>, AssertError> {
        let specs: Vec<SlotSpec> = self.wm.templates[template].slots.clone();
        let mut values = Vec::with_capacity(specs.len());
        for spec in &specs {
            let value = match &spec.default {
                DefaultSpec::Static(v) => v.clone(),
                DefaultSpec::Dynamic(expr) => {
                    let Engine {
                        atoms,
                        globals,
                        externals,
                        ..
                    } = self;
                    eval(expr, atoms, &GlobalBindings(globals), externals.as_mut()).map_err(
                        |_| AssertError::MissingValue {
                            slot: String::new(),
                        },
                    )?
                }
                DefaultSpec::None => Value::Handle(Handle {
                    kind: HandleKind::External,
                    index: u64::MAX,
                }),
            };
            values.push(value);
        }
        Ok(values)
    }

    fn fill_slots(
        &mut self,
        template: TemplateId,
        provided: Vec<(SlotId, Value)>,
    ) -> Result<Vec<Value>, AssertError> {
        let mut values = self.default_slots(template)?;
        for (slot, value) in provided {
            let spec = self.wm.templates[template].slot(slot).clone();
            values[slot.index()] = normalize_for_slot(&spec, value);
        }
        let spec = &self.wm.templates[template];
        for (i, value) in values.iter().enumerate() {
            if matches!(value, Value::Handle(h) if h.kind == HandleKind::External && h.index == u64::MAX)
            {
                return Err(AssertError::MissingValue {
                    slot: self
                        .atoms
                        .text(spec.slots[i].name)
                        .unwrap_or_default()
                        .to_string(),
                });
            }
        }
        Ok(values)
    }

    fn fill_class_slots(
        &mut self,
        class: ClassId,
        provided: Vec<(SlotId, Value)>,
    ) -> Result<Vec<Value>, AssertError> {
        let specs: Vec<SlotSpec> = self.wm.classes[class].slots.clone();
        let mut values = Vec::with_capacity(specs.len());
        for spec in &specs {
            values.push(match &spec.default {
                DefaultSpec::Static(v) => v.clone(),
                DefaultSpec::Dynamic(expr) => {
                    let Engine {
                        atoms,
                        globals,
                        externals,
                        ..
                    } = self;
                    eval(expr, atoms, &GlobalBindings(globals), externals.as_mut()).map_err(
                        |_| AssertError::MissingValue {
                            slot: String::new(),
                        },
                    )?
                }
                DefaultSpec::None => Value::Atom(cascara_base::NIL_ATOM),
            });
        }
        for (slot, value) in provided {
            let spec = &self.wm.classes[class].slots[slot.index()];
            values[slot.index()] = normalize_for_slot(spec, value);
        }
        Ok(values)
    }

    // ==================================================================
    // Change plumbing
    // ==================================================================

    fn do_assert(
        &mut self,
        template: TemplateId,
        slots: Vec<Value>,
        support: SupportMode,
    ) -> Result<FactId, AssertError> {
        match self.wm.assert_fact(
            &mut self.atoms,
            template,
            slots,
            self.config.allow_duplicates,
        ) {
            Ok(id) => {
                let entity = EntityRef::Fact(id);
                match support {
                    // The supporter prefix can dissolve mid-firing if
                    // the rule retracts its own inputs; the assert then
                    // degrades to unconditional.
                    SupportMode::Supported(token) if self.net.tokens.contains(token) => {
                        self.net.support.add(token, entity)
                    }
                    _ => {}
                }
                if self.watch.facts {
                    let line = format!("==> f-{} {}", id.index(), self.render_fact(id));
                    self.router.println(WTRACE, &line);
                }
                self.net
                    .assert_entity(&mut self.atoms, &self.wm, self.externals.as_mut(), entity);
                self.finish_change();
                Ok(id)
            }
            Err(AssertError::Duplicate(existing)) => {
                // Logical bookkeeping still applies to the survivor: an
                // unconditional re-assert strips its support, a
                // supported one gains a justification.
                let entity = EntityRef::Fact(existing);
                match support {
                    SupportMode::Unconditional => self.net.support.make_unconditional(entity),
                    SupportMode::Supported(token) => {
                        if self.net.support.is_supported(entity) {
                            self.net.support.add(token, entity);
                        }
                    }
                }
                Err(AssertError::Duplicate(existing))
            }
            Err(e) => Err(e),
        }
    }

    fn do_retract(&mut self, fact: FactId) -> Result<(), AssertError> {
        self.wm.retract_fact(fact)?;
        if self.watch.facts {
            let line = format!("<== f-{} {}", fact.index(), self.render_fact(fact));
            self.router.println(WTRACE, &line);
        }
        let entity = EntityRef::Fact(fact);
        self.net
            .retract_entity(&mut self.atoms, &self.wm, self.externals.as_mut(), entity);
        self.graveyard.push(entity);
        self.finish_change();
        Ok(())
    }

    /// Cascades logical retractions, syncs agendas, sweeps storage.
    fn finish_change(&mut self) {
        loop {
            let pending = self.net.take_pending_logical();
            if pending.is_empty() {
                break;
            }
            for entity in pending {
                match entity {
                    EntityRef::Fact(id) => {
                        if self.wm.retract_fact(id).is_ok() {
                            if self.watch.facts {
                                let line =
                                    format!("<== f-{} {}", id.index(), self.render_fact(id));
                                self.router.println(WTRACE, &line);
                            }
                            self.net.retract_entity(
                                &mut self.atoms,
                                &self.wm,
                                self.externals.as_mut(),
                                entity,
                            );
                            self.graveyard.push(entity);
                        }
                    }
                    EntityRef::Instance(id) => {
                        if self.wm.retract_instance(id).is_ok() {
                            self.net.retract_entity(
                                &mut self.atoms,
                                &self.wm,
                                self.externals.as_mut(),
                                entity,
                            );
                            self.graveyard.push(entity);
                        }
                    }
                }
            }
        }
        self.drain_events();
        if !self.in_firing {
            self.sweep();
        }
    }

    fn drain_events(&mut self) {
        for event in self.net.take_events() {
            match event {
                MatchEvent::Activate {
                    rule,
                    disjunct,
                    token,
                } => {
                    if !self.net.rules.contains(rule) || !self.net.tokens.contains(token) {
                        continue;
                    }
                    self.enqueue_activation(rule, disjunct, token);
                }
                MatchEvent::Deactivate {
                    rule,
                    disjunct,
                    token,
                } => {
                    for agenda in &mut self.agendas {
                        if let Some(removed) = agenda.remove_token(rule, disjunct, token) {
                            if self.watch.activations {
                                let name = self
                                    .net
                                    .rules
                                    .get(rule)
                                    .and_then(|r| self.atoms.text(r.name))
                                    .unwrap_or_default()
                                    .to_string();
                                self.router.println(
                                    WTRACE,
                                    &format!(
                                        "<== Activation {} {}",
                                        removed.salience, name
                                    ),
                                );
                            }
                            break;
                        }
                    }
                }
            }
        }
    }

    fn enqueue_activation(&mut self, rule: RuleId, disjunct: u16, token: TokenId) {
        let (module, auto_focus, static_salience, dynamic, complexity) = {
            let r = &self.net.rules[rule];
            (
                r.module,
                r.auto_focus,
                r.salience,
                r.dynamic_salience.clone(),
                r.disjuncts[disjunct as usize].complexity,
            )
        };
        let salience = match (self.config.salience_eval, dynamic) {
            (SalienceEval::WhenDefined, _) | (_, None) => static_salience,
            (_, Some(expr)) => self.eval_salience(&expr, static_salience),
        };
        let time_tags = self.net.token_time_tags(&self.wm, token);
        let first_tag = self
            .net
            .token_entities(token)
            .first()
            .map(|e| e.time_tag(&self.wm))
            .unwrap_or(0);
        let activation = Activation {
            rule,
            disjunct,
            token,
            salience,
            time_tags,
            first_tag,
            complexity,
            random_tag: rand::random(),
            seq: 0,
        };
        if self.agendas[module.0 as usize].insert(activation, self.config.strategy) {
            if self.watch.activations {
                let name = self
                    .atoms
                    .text(self.net.rules[rule].name)
                    .unwrap_or_default()
                    .to_string();
                let numbers = self.entity_numbers(token);
                self.router.println(
                    WTRACE,
                    &format!("==> Activation {} {}: {}", salience, name, numbers),
                );
            }
            if auto_focus {
                self.focus(module);
            }
        }
    }

    fn eval_salience(&mut self, expr: &Expr, fallback: i32) -> i32 {
        let Engine {
            atoms,
            globals,
            externals,
            ..
        } = self;
        match eval(expr, atoms, &GlobalBindings(globals), externals.as_mut()) {
            Ok(Value::Atom(id)) => atoms.as_integer(id).map(|n| n as i32).unwrap_or(fallback),
            _ => fallback,
        }
    }

    fn reevaluate_salience(&mut self, module: ModuleId) {
        let mut pending: Vec<(RuleId, Expr, i32)> = Vec::new();
        for activation in self.agendas[module.0 as usize].iter() {
            if pending.iter().any(|(r, _, _)| *r == activation.rule) {
                continue;
            }
            if let Some(rule) = self.net.rules.get(activation.rule) {
                if let Some(expr) = rule.dynamic_salience.clone() {
                    pending.push((activation.rule, expr, rule.salience));
                }
            }
        }
        if pending.is_empty() {
            return;
        }
        let updates: Vec<(RuleId, i32)> = pending
            .into_iter()
            .map(|(rule, expr, fallback)| (rule, self.eval_salience(&expr, fallback)))
            .collect();
        let strategy = self.config.strategy;
        self.agendas[module.0 as usize].update_salience(strategy, |activation| {
            updates
                .iter()
                .find(|(r, _)| *r == activation.rule)
                .map(|(_, s)| *s)
                .unwrap_or(activation.salience)
        });
    }

    /// Releases storage for retracted entities nothing references.
    fn sweep(&mut self) {
        let mut keep = Vec::new();
        let graveyard = std::mem::take(&mut self.graveyard);
        for entity in graveyard {
            if !entity.is_live(&self.wm) {
                continue;
            }
            if entity.busy(&self.wm) > 0 {
                keep.push(entity);
                continue;
            }
            match entity {
                EntityRef::Fact(id) => self.wm.release_fact(&mut self.atoms, id),
                EntityRef::Instance(id) => self.wm.release_instance(&mut self.atoms, id),
            }
        }
        self.graveyard = keep;
    }

    fn clear_pinned_bases(&mut self) {
        let pinned = std::mem::take(&mut self.basis_pinned);
        for id in pinned {
            if let Some(inst) = self.wm.instances.get_mut(id) {
                if let Some(basis) = inst.basis.take() {
                    for value in basis {
                        cascara_base::deinstall_value(&mut self.atoms, &value);
                    }
                }
            }
        }
    }

    // ==================================================================
    // Introspection
    // ==================================================================

    pub fn agenda_snapshot(&self, module: ModuleId) -> Vec<ActivationSnapshot> {
        self.agendas[module.0 as usize]
            .iter()
            .map(|a| ActivationSnapshot {
                rule: self
                    .net
                    .rules
                    .get(a.rule)
                    .and_then(|r| self.atoms.text(r.name))
                    .unwrap_or_default()
                    .to_string(),
                salience: a.salience,
                fact_numbers: self
                    .net
                    .token_entities(a.token)
                    .iter()
                    .map(|e| match e {
                        EntityRef::Fact(id) => id.index(),
                        EntityRef::Instance(id) => id.index(),
                    })
                    .collect(),
            })
            .collect()
    }

    pub fn agenda_len(&self, module: ModuleId) -> usize {
        self.agendas[module.0 as usize].len()
    }

    /// Installed rule names, in definition order.
    pub fn rule_names(&self) -> Vec<String> {
        self.net
            .rules
            .iter()
            .map(|(_, r)| self.atoms.text(r.name).unwrap_or_default().to_string())
            .collect()
    }

    /// Defined template names, in definition order.
    pub fn template_names(&self) -> Vec<String> {
        self.wm
            .templates
            .iter()
            .map(|(_, t)| self.atoms.text(t.name).unwrap_or_default().to_string())
            .collect()
    }

    /// Defined class names, in definition order.
    pub fn class_names(&self) -> Vec<String> {
        self.wm
            .classes
            .iter()
            .map(|(_, c)| self.atoms.text(c.name).unwrap_or_default().to_string())
            .collect()
    }

    pub fn facts_snapshot(&self) -> Vec<FactSnapshot> {
        self.wm
            .all_facts()
            .into_iter()
            .map(|id| FactSnapshot {
                number: id.index(),
                rendered: self.render_fact(id),
            })
            .collect()
    }

    /// Renders a fact the way watch traces do.
    pub fn render_fact(&self, id: FactId) -> String {
        let fact = &self.wm.facts[id];
        let template = &self.wm.templates[fact.template];
        let name = self.atoms.text(template.name).unwrap_or_default();
        if template.implied {
            let mut out = format!("({}", name);
            if let Some(mf) = fact.slots[0].as_multi() {
                for atom in mf.iter() {
                    out.push(' ');
                    out.push_str(&self.atoms.display(atom).to_string());
                }
            }
            out.push(')');
            out
        } else {
            let mut out = format!("({}", name);
            for (spec, value) in template.slots.iter().zip(&fact.slots) {
                out.push_str(&format!(
                    " ({} {})",
                    self.atoms.text(spec.name).unwrap_or_default(),
                    value.display(&self.atoms)
                ));
            }
            out.push(')');
            out
        }
    }

    fn entity_numbers(&self, token: TokenId) -> String {
        let parts: Vec<String> = self
            .net
            .token_entities(token)
            .iter()
            .map(|e| match e {
                EntityRef::Fact(id) => format!("f-{}", id.index()),
                EntityRef::Instance(id) => format!("i-{}", id.index()),
            })
            .collect();
        if parts.is_empty() {
            "*".to_string()
        } else {
            parts.join(",")
        }
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

/// Wraps a bare value for a multifield slot; leaves everything else
/// untouched.
fn normalize_for_slot(spec: &SlotSpec, value: Value) -> Value {
    if spec.multi && !value.is_multi() {
        match value {
            Value::Atom(atom) => Value::Multi(Multifield::from_atoms(vec![atom])),
            other => other,
        }
    } else {
        value
    }
}
