//! The network facade: arenas, propagation, sharing, and teardown.
//!
//! One [`Network`] owns the alpha trees, the join graph, every token and
//! alpha match, the compiled rules, and the logical-support registry.
//! The system layer drives it with whole-change operations
//! ([`Network::assert_entity`], [`Network::retract_entity`]) and drains
//! [`MatchEvent`]s at each change boundary; a change fully propagates
//! before the call returns, and storage for retracted entities is only
//! released afterwards, once the events have reached the agenda.
//!
//! Determinism: alpha readers and join children are notified in
//! registration order, so two asserts propagate their consequences in
//! assert order, every time.
//!
//! Join tests and hashes always read an entity's *current* slot values;
//! basis snapshots are consulted only by firing bindings. Instance
//! updates therefore retract against the old values, swap slots, and
//! re-assert against the new ones, keeping every memory's insert-time
//! and removal-time hashes equal.

use crate::alpha::{
    AlphaMatch, AlphaMatchId, AlphaMemId, AlphaMemory, AlphaNet, AlphaNode, AlphaNodeId,
    AlphaTest, ChainMarkers, PatternTarget,
};
use crate::beta::{JoinCond, JoinId, JoinNode, NegState, RightElem, RightInput, Token, TokenId};
use crate::bindings::{read_entity, JoinBindings, SelfBindings};
use crate::entity::EntityRef;
use crate::events::MatchEvent;
use crate::logical::LogicalSupport;
use crate::rule::{CompiledRule, RuleId};
use cascara_base::{Arena, AtomId, AtomTable, Value};
use cascara_data::{
    eval, is_truthy, values_equal, Bindings, ExternalDispatch, FetchDesc, ModuleId, WorkingMemory,
};
use rustc_hash::FxHashMap;
use std::collections::VecDeque;

/// Everything codegen needs to say about one join.
#[derive(Clone, Debug)]
pub struct JoinSpec {
    pub parent: Option<JoinId>,
    pub right: RightInput,
    pub depth: u16,
    pub right_pattern: u16,
    pub left_key: Vec<FetchDesc>,
    pub right_key: Vec<FetchDesc>,
    pub tests: Vec<JoinCond>,
    pub negated: bool,
    pub exists: bool,
    pub from_right: bool,
    pub has_logical: bool,
}

/// The match network.
pub struct Network {
    pub alpha: AlphaNet,
    pub joins: Arena<JoinNode>,
    pub tokens: Arena<Token>,
    pub rules: Arena<CompiledRule>,
    rule_names: FxHashMap<(ModuleId, AtomId), RuleId>,
    /// Joins whose left input is the permanent empty token.
    first_joins: Vec<JoinId>,
    pub root_token: TokenId,
    pub support: LogicalSupport,
    events: VecDeque<MatchEvent>,
    pending_logical: Vec<EntityRef>,
    join_depth: u32,
    /// Equi-join hashing switch; disabling collapses every memory to a
    /// single bucket so hashed and unhashed runs can be compared.
    pub hashing_enabled: bool,
}

impl Network {
    pub fn new() -> Self {
        let mut tokens = Arena::new();
        let root_token = tokens.insert(Token::root());
        Network {
            alpha: AlphaNet::new(),
            joins: Arena::new(),
            tokens,
            rules: Arena::new(),
            rule_names: FxHashMap::default(),
            first_joins: Vec::new(),
            root_token,
            support: LogicalSupport::new(),
            events: VecDeque::new(),
            pending_logical: Vec::new(),
            join_depth: 0,
            hashing_enabled: true,
        }
    }

    /// True while a change is propagating through the join network.
    pub fn join_operation_in_progress(&self) -> bool {
        self.join_depth > 0
    }

    /// Drains the queued activation changes, in propagation order.
    pub fn take_events(&mut self) -> Vec<MatchEvent> {
        self.events.drain(..).collect()
    }

    /// Drains entities that lost their last logical supporter.
    pub fn take_pending_logical(&mut self) -> Vec<EntityRef> {
        std::mem::take(&mut self.pending_logical)
    }

    // ==================================================================
    // Rule registry
    // ==================================================================

    pub fn rule_id(&self, module: ModuleId, name: AtomId) -> Option<RuleId> {
        self.rule_names.get(&(module, name)).copied()
    }

    pub fn insert_rule(&mut self, rule: CompiledRule) -> RuleId {
        let key = (rule.module, rule.name);
        let id = self.rules.insert(rule);
        self.rule_names.insert(key, id);
        id
    }

    /// Detaches a rule's join chains and removes its record. Activation
    /// removals surface as `Deactivate` events.
    pub fn remove_rule(&mut self, id: RuleId) -> Option<CompiledRule> {
        let rule = self.rules.remove(id)?;
        self.rule_names.remove(&(rule.module, rule.name));
        for disjunct in &rule.disjuncts {
            self.detach_join(disjunct.terminal);
        }
        Some(rule)
    }

    /// The timestamp vector of a partial match, newest first.
    pub fn token_time_tags(&self, wm: &WorkingMemory, token: TokenId) -> Vec<u64> {
        let mut tags: Vec<u64> = self.tokens[token]
            .binds
            .iter()
            .flatten()
            .map(|am| self.alpha.matches[*am].entity.time_tag(wm))
            .collect();
        tags.sort_unstable_by(|a, b| b.cmp(a));
        tags
    }

    /// The entities bound by a partial match, in pattern order.
    pub fn token_entities(&self, token: TokenId) -> Vec<EntityRef> {
        self.tokens[token]
            .binds
            .iter()
            .flatten()
            .map(|am| self.alpha.matches[*am].entity)
            .collect()
    }

    /// The ancestor of `token` owned by `join` (the supporter prefix at
    /// a logical join).
    pub fn token_prefix_at(&self, token: TokenId, join: JoinId) -> Option<TokenId> {
        let mut current = Some(token);
        while let Some(t) = current {
            let node = &self.tokens[t];
            if node.owner == Some(join) {
                return Some(t);
            }
            current = node.parent;
        }
        None
    }

    // ==================================================================
    // Construct attachment (called by the rule compiler)
    // ==================================================================

    /// Attaches (or reuses) the alpha path for one pattern and returns
    /// its leaf memory. `tests` excludes the implicit root test. The
    /// memory is backfilled from existing working memory when newly
    /// created.
    pub fn attach_pattern(
        &mut self,
        atoms: &mut AtomTable,
        wm: &WorkingMemory,
        externals: &mut dyn ExternalDispatch,
        target: PatternTarget,
        tests: &[AlphaTest],
    ) -> AlphaMemId {
        let mut node = self.alpha.root_for(target);
        self.alpha.nodes[node].use_count += 1;
        for test in tests {
            node = self.child_for(node, test);
            self.alpha.nodes[node].use_count += 1;
        }
        if let Some(mem) = self.alpha.nodes[node].memory {
            self.alpha.memories[mem].use_count += 1;
            return mem;
        }
        let mem = self.alpha.memories.insert(AlphaMemory {
            matches: Vec::new(),
            readers: Vec::new(),
            use_count: 1,
            node,
        });
        self.alpha.nodes[node].memory = Some(mem);
        self.backfill_memory(atoms, wm, externals, target, tests, mem);
        mem
    }

    fn child_for(&mut self, parent: AlphaNodeId, test: &AlphaTest) -> AlphaNodeId {
        if let AlphaTest::SlotConstant { slot, atom } = test {
            if let Some(&child) = self.alpha.nodes[parent].hashed.get(&(*slot, *atom)) {
                return child;
            }
            let child = self
                .alpha
                .nodes
                .insert(AlphaNode::new(Some(parent), test.clone()));
            let parent_node = &mut self.alpha.nodes[parent];
            parent_node.hashed.insert((*slot, *atom), child);
            if !parent_node.hashed_slots.contains(slot) {
                parent_node.hashed_slots.push(*slot);
            }
            return child;
        }
        let linear = self.alpha.nodes[parent].linear.clone();
        for candidate in linear {
            if self.alpha.nodes[candidate].test == *test {
                return candidate;
            }
        }
        let child = self
            .alpha
            .nodes
            .insert(AlphaNode::new(Some(parent), test.clone()));
        self.alpha.nodes[parent].linear.push(child);
        child
    }

    /// Runs existing entities of `target` through a fresh path so a rule
    /// added mid-run sees the current working memory.
    fn backfill_memory(
        &mut self,
        atoms: &mut AtomTable,
        wm: &WorkingMemory,
        externals: &mut dyn ExternalDispatch,
        target: PatternTarget,
        tests: &[AlphaTest],
        mem: AlphaMemId,
    ) {
        let entities: Vec<EntityRef> = match target {
            PatternTarget::Template(t) => wm.facts_of_template(t).map(EntityRef::Fact).collect(),
            PatternTarget::Class(c) => wm
                .instances_of_class(c)
                .into_iter()
                .map(EntityRef::Instance)
                .collect(),
        };
        for entity in entities {
            let mut markers = Vec::new();
            self.run_path(atoms, wm, externals, entity, tests, 0, &mut markers, mem);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn run_path(
        &mut self,
        atoms: &mut AtomTable,
        wm: &WorkingMemory,
        externals: &mut dyn ExternalDispatch,
        entity: EntityRef,
        tests: &[AlphaTest],
        index: usize,
        markers: &mut Vec<ChainMarkers>,
        mem: AlphaMemId,
    ) {
        if index == tests.len() {
            self.deposit(entity, markers.clone(), mem);
            return;
        }
        match &tests[index] {
            AlphaTest::Chain { slot, chain } => {
                let fields: Vec<AtomId> = match entity.slot_value(wm, *slot, false) {
                    Some(Value::Multi(mf)) => mf.iter().collect(),
                    _ => return,
                };
                let chain = chain.clone();
                let slot = *slot;
                for spans in chain.segmentations(atoms, &fields) {
                    markers.push(ChainMarkers { slot, spans });
                    self.run_path(atoms, wm, externals, entity, tests, index + 1, markers, mem);
                    markers.pop();
                }
            }
            test => {
                let test = test.clone();
                if self.single_test_passes(atoms, wm, externals, entity, &test, markers) {
                    self.run_path(atoms, wm, externals, entity, tests, index + 1, markers, mem);
                }
            }
        }
    }

    fn single_test_passes(
        &mut self,
        atoms: &mut AtomTable,
        wm: &WorkingMemory,
        externals: &mut dyn ExternalDispatch,
        entity: EntityRef,
        test: &AlphaTest,
        markers: &[ChainMarkers],
    ) -> bool {
        match test {
            AlphaTest::Root(_) => true,
            AlphaTest::SlotConstant { slot, atom } => {
                matches!(entity.slot_value(wm, *slot, false), Some(Value::Atom(a)) if a == atom)
            }
            AlphaTest::SlotType { slot, types } => {
                matches!(entity.slot_value(wm, *slot, false), Some(Value::Atom(a))
                    if types.contains(cascara_data::TypeMask::of_kind(atoms.kind(*a))))
            }
            AlphaTest::Length { slot, min, exact } => match entity.slot_value(wm, *slot, false) {
                Some(Value::Multi(mf)) => {
                    let len = mf.len() as u32;
                    len >= *min && exact.map_or(true, |e| len == e)
                }
                _ => false,
            },
            AlphaTest::Chain { .. } => unreachable!("chains branch in the caller"),
            AlphaTest::Predicate(expr) => {
                let bindings = SelfBindings { entity, markers, wm };
                match eval(expr, atoms, &bindings, externals) {
                    Ok(v) => is_truthy(&v),
                    Err(_) => false,
                }
            }
        }
    }

    /// Attaches (or reuses) a join. Terminal joins are never shared.
    pub fn attach_join(
        &mut self,
        atoms: &mut AtomTable,
        wm: &WorkingMemory,
        externals: &mut dyn ExternalDispatch,
        spec: JoinSpec,
        terminal: Option<(RuleId, u16)>,
    ) -> JoinId {
        if terminal.is_none() {
            if let Some(existing) = self.find_shared(&spec) {
                self.joins[existing].use_count += 1;
                return existing;
            }
        }
        let join = self.joins.insert(JoinNode {
            parent: spec.parent,
            right: spec.right,
            depth: spec.depth,
            right_pattern: spec.right_pattern,
            left_key: spec.left_key,
            right_key: spec.right_key,
            tests: spec.tests,
            negated: spec.negated,
            exists: spec.exists,
            from_right: spec.from_right,
            has_logical: spec.has_logical,
            terminal,
            children: Vec::new(),
            right_readers: Vec::new(),
            use_count: 1,
            left_index: FxHashMap::default(),
            right_index: FxHashMap::default(),
            out: Vec::new(),
            neg: FxHashMap::default(),
        });
        match spec.parent {
            Some(parent) => self.joins[parent].children.push(join),
            None => self.first_joins.push(join),
        }
        match spec.right {
            RightInput::Alpha(mem) => self.alpha.memories[mem].readers.push(join),
            RightInput::Join(sub) => self.joins[sub].right_readers.push(join),
        }
        self.backfill_join(atoms, wm, externals, join);
        join
    }

    fn find_shared(&self, spec: &JoinSpec) -> Option<JoinId> {
        let candidates = match spec.parent {
            Some(parent) => &self.joins[parent].children,
            None => &self.first_joins,
        };
        candidates.iter().copied().find(|&j| {
            let join = &self.joins[j];
            join.terminal.is_none()
                && join.right == spec.right
                && join.right_pattern == spec.right_pattern
                && join.depth == spec.depth
                && join.left_key == spec.left_key
                && join.right_key == spec.right_key
                && join.tests == spec.tests
                && join.negated == spec.negated
                && join.exists == spec.exists
                && join.from_right == spec.from_right
                && join.has_logical == spec.has_logical
        })
    }

    /// Seeds a fresh join from existing memories: index the right side,
    /// then run every left token through it.
    fn backfill_join(
        &mut self,
        atoms: &mut AtomTable,
        wm: &WorkingMemory,
        externals: &mut dyn ExternalDispatch,
        join: JoinId,
    ) {
        let elems: Vec<RightElem> = match self.joins[join].right {
            RightInput::Alpha(mem) => self.alpha.memories[mem]
                .matches
                .iter()
                .map(|&am| RightElem::Match(am))
                .collect(),
            RightInput::Join(sub) => self.joins[sub]
                .out
                .iter()
                .map(|&t| RightElem::Token(t))
                .collect(),
        };
        for elem in elems {
            let hash = self.right_hash(atoms, wm, join, elem);
            self.joins[join]
                .right_index
                .entry(hash)
                .or_default()
                .push(elem);
        }
        let lefts: Vec<TokenId> = match self.joins[join].parent {
            Some(parent) => self.joins[parent].out.clone(),
            None => vec![self.root_token],
        };
        for left in lefts {
            self.left_insert(atoms, wm, externals, join, left);
        }
    }

    // ==================================================================
    // Whole-change operations
    // ==================================================================

    /// Propagates a newly asserted (or re-matched) entity through the
    /// network. Fully propagated on return; activation changes are in
    /// the event queue.
    pub fn assert_entity(
        &mut self,
        atoms: &mut AtomTable,
        wm: &WorkingMemory,
        externals: &mut dyn ExternalDispatch,
        entity: EntityRef,
    ) {
        self.join_depth += 1;
        let roots = self.roots_for(wm, entity);
        for root in roots {
            let mut markers = Vec::new();
            self.descend(atoms, wm, externals, root, entity, &mut markers);
        }
        self.join_depth -= 1;
    }

    /// Withdraws every alpha match of a retracted entity, cascading
    /// through the joins. Activation removals are queued before return.
    pub fn retract_entity(
        &mut self,
        atoms: &mut AtomTable,
        wm: &WorkingMemory,
        externals: &mut dyn ExternalDispatch,
        entity: EntityRef,
    ) {
        self.join_depth += 1;
        let ams = self.alpha.entity_matches.remove(&entity).unwrap_or_default();
        for am in ams {
            self.remove_amatch(atoms, wm, externals, am);
        }
        self.support.entity_gone(entity);
        self.join_depth -= 1;
    }

    fn roots_for(&self, wm: &WorkingMemory, entity: EntityRef) -> Vec<AlphaNodeId> {
        match entity {
            EntityRef::Fact(id) => {
                let template = wm.facts[id].template;
                self.alpha
                    .template_roots
                    .get(&template)
                    .copied()
                    .into_iter()
                    .collect()
            }
            EntityRef::Instance(id) => {
                let class = wm.instances[id].class;
                let mut roots: Vec<(cascara_data::ClassId, AlphaNodeId)> = self
                    .alpha
                    .class_roots
                    .iter()
                    .filter(|(pattern_class, _)| {
                        wm.classes[**pattern_class].subclasses.contains(&class)
                    })
                    .map(|(c, n)| (*c, *n))
                    .collect();
                roots.sort_by_key(|(c, _)| c.index());
                roots.into_iter().map(|(_, n)| n).collect()
            }
        }
    }

    fn descend(
        &mut self,
        atoms: &mut AtomTable,
        wm: &WorkingMemory,
        externals: &mut dyn ExternalDispatch,
        node_id: AlphaNodeId,
        entity: EntityRef,
        markers: &mut Vec<ChainMarkers>,
    ) {
        enum Step {
            Plain(bool),
            Chain(cascara_data::SlotId, crate::alpha::FieldChain),
        }
        let step = match &self.alpha.nodes[node_id].test {
            AlphaTest::Chain { slot, chain } => Step::Chain(*slot, chain.clone()),
            test => {
                let test = test.clone();
                Step::Plain(self.single_test_passes(atoms, wm, externals, entity, &test, markers))
            }
        };
        match step {
            Step::Plain(false) => {}
            Step::Plain(true) => {
                self.descend_children(atoms, wm, externals, node_id, entity, markers);
            }
            Step::Chain(slot, chain) => {
                let fields: Vec<AtomId> = match entity.slot_value(wm, slot, false) {
                    Some(Value::Multi(mf)) => mf.iter().collect(),
                    _ => return,
                };
                for spans in chain.segmentations(atoms, &fields) {
                    markers.push(ChainMarkers { slot, spans });
                    self.descend_children(atoms, wm, externals, node_id, entity, markers);
                    markers.pop();
                }
            }
        }
    }

    fn descend_children(
        &mut self,
        atoms: &mut AtomTable,
        wm: &WorkingMemory,
        externals: &mut dyn ExternalDispatch,
        node_id: AlphaNodeId,
        entity: EntityRef,
        markers: &mut Vec<ChainMarkers>,
    ) {
        if let Some(mem) = self.alpha.nodes[node_id].memory {
            let am = self.deposit(entity, markers.clone(), mem);
            let readers = self.alpha.memories[mem].readers.clone();
            for reader in readers {
                self.right_insert(atoms, wm, externals, reader, RightElem::Match(am));
            }
        }
        let hashed_slots = self.alpha.nodes[node_id].hashed_slots.clone();
        for slot in hashed_slots {
            if let Some(Value::Atom(atom)) = entity.slot_value(wm, slot, false).cloned() {
                if let Some(&child) = self.alpha.nodes[node_id].hashed.get(&(slot, atom)) {
                    self.descend(atoms, wm, externals, child, entity, markers);
                }
            }
        }
        let linear = self.alpha.nodes[node_id].linear.clone();
        for child in linear {
            self.descend(atoms, wm, externals, child, entity, markers);
        }
    }

    fn deposit(
        &mut self,
        entity: EntityRef,
        markers: Vec<ChainMarkers>,
        mem: AlphaMemId,
    ) -> AlphaMatchId {
        let am = self.alpha.matches.insert(AlphaMatch {
            entity,
            markers,
            memory: mem,
            dependents: Vec::new(),
            blocking: Vec::new(),
        });
        self.alpha.memories[mem].matches.push(am);
        self.alpha.entity_matches.entry(entity).or_default().push(am);
        am
    }

    // ==================================================================
    // Join propagation
    // ==================================================================

    fn key_hash(&self, atoms: &AtomTable, values: &[Option<Value>]) -> u64 {
        if !self.hashing_enabled {
            return 0;
        }
        let mut h: u64 = 0;
        for value in values {
            let vh = value.as_ref().map_or(0, |v| v.hash_with(atoms));
            h = h.rotate_left(13) ^ vh;
        }
        h
    }

    fn left_key_values(
        &self,
        wm: &WorkingMemory,
        join: JoinId,
        token: TokenId,
    ) -> Vec<Option<Value>> {
        let bindings = JoinBindings {
            tokens: &self.tokens,
            amatches: &self.alpha.matches,
            wm,
            left: token,
            right: None,
        };
        self.joins[join]
            .left_key
            .iter()
            .map(|desc| bindings.fetch(desc))
            .collect()
    }

    fn right_key_values(
        &self,
        wm: &WorkingMemory,
        join: JoinId,
        elem: RightElem,
    ) -> Vec<Option<Value>> {
        let right_pattern = self.joins[join].right_pattern;
        let bindings = JoinBindings {
            tokens: &self.tokens,
            amatches: &self.alpha.matches,
            wm,
            left: self.root_token,
            right: Some((right_pattern, elem)),
        };
        self.joins[join]
            .right_key
            .iter()
            .map(|desc| bindings.fetch(desc))
            .collect()
    }

    fn left_hash(&self, atoms: &AtomTable, wm: &WorkingMemory, join: JoinId, token: TokenId) -> u64 {
        self.key_hash(atoms, &self.left_key_values(wm, join, token))
    }

    fn right_hash(&self, atoms: &AtomTable, wm: &WorkingMemory, join: JoinId, elem: RightElem) -> u64 {
        self.key_hash(atoms, &self.right_key_values(wm, join, elem))
    }

    /// Key equality plus residual tests for one candidate pair.
    fn passes(
        &mut self,
        atoms: &mut AtomTable,
        wm: &WorkingMemory,
        externals: &mut dyn ExternalDispatch,
        join: JoinId,
        left: TokenId,
        elem: RightElem,
    ) -> bool {
        let right_pattern = self.joins[join].right_pattern;
        let left_vals = self.left_key_values(wm, join, left);
        let right_vals = self.right_key_values(wm, join, elem);
        for (l, r) in left_vals.iter().zip(right_vals.iter()) {
            match (l, r) {
                (Some(l), Some(r)) if values_equal(atoms, l, r) => {}
                _ => return false,
            }
        }
        let tests = self.joins[join].tests.clone();
        for test in &tests {
            let bindings = JoinBindings {
                tokens: &self.tokens,
                amatches: &self.alpha.matches,
                wm,
                left,
                right: Some((right_pattern, elem)),
            };
            let ok = match test {
                JoinCond::Eq { left: l, right: r, negate } => {
                    let lv = bindings.fetch(l);
                    let rv = bindings.fetch(r);
                    match (lv, rv) {
                        (Some(lv), Some(rv)) => values_equal(atoms, &lv, &rv) != *negate,
                        _ => false,
                    }
                }
                JoinCond::Expr(expr) => match eval(expr, atoms, &bindings, externals) {
                    Ok(v) => is_truthy(&v),
                    Err(_) => false,
                },
            };
            if !ok {
                return false;
            }
        }
        true
    }

    fn right_insert(
        &mut self,
        atoms: &mut AtomTable,
        wm: &WorkingMemory,
        externals: &mut dyn ExternalDispatch,
        join: JoinId,
        elem: RightElem,
    ) {
        let hash = self.right_hash(atoms, wm, join, elem);
        self.joins[join].right_index.entry(hash).or_default().push(elem);
        let lefts: Vec<TokenId> = self.joins[join]
            .left_index
            .get(&hash)
            .cloned()
            .unwrap_or_default();
        let (negated, exists) = {
            let j = &self.joins[join];
            (j.negated, j.exists)
        };
        for left in lefts {
            if !self.tokens.contains(left) {
                continue;
            }
            if !self.passes(atoms, wm, externals, join, left, elem) {
                continue;
            }
            if negated || exists {
                self.add_blocker(atoms, wm, externals, join, left, elem);
            } else {
                self.make_token(atoms, wm, externals, join, left, Some(elem));
            }
        }
    }

    fn right_remove(&mut self, atoms: &AtomTable, wm: &WorkingMemory, join: JoinId, elem: RightElem) {
        let hash = self.right_hash(atoms, wm, join, elem);
        let mut empty = false;
        if let Some(bucket) = self.joins[join].right_index.get_mut(&hash) {
            bucket.retain(|e| *e != elem);
            empty = bucket.is_empty();
        }
        if empty {
            self.joins[join].right_index.remove(&hash);
        }
    }

    fn left_insert(
        &mut self,
        atoms: &mut AtomTable,
        wm: &WorkingMemory,
        externals: &mut dyn ExternalDispatch,
        join: JoinId,
        left: TokenId,
    ) {
        let hash = self.left_hash(atoms, wm, join, left);
        self.joins[join].left_index.entry(hash).or_default().push(left);
        let elems: Vec<RightElem> = self.joins[join]
            .right_index
            .get(&hash)
            .cloned()
            .unwrap_or_default();
        let (negated, exists) = {
            let j = &self.joins[join];
            (j.negated, j.exists)
        };
        if negated || exists {
            let mut blockers = Vec::new();
            for elem in elems {
                if self.passes(atoms, wm, externals, join, left, elem) {
                    blockers.push(elem);
                }
            }
            for &elem in &blockers {
                self.record_blocking(join, left, elem);
            }
            let produce = if negated { blockers.is_empty() } else { !blockers.is_empty() };
            self.joins[join].neg.insert(left, NegState { blockers, out: None });
            if produce {
                let out = self.make_token(atoms, wm, externals, join, left, None);
                self.joins[join].neg.get_mut(&left).expect("neg state").out = Some(out);
            }
        } else {
            for elem in elems {
                if self.passes(atoms, wm, externals, join, left, elem) {
                    self.make_token(atoms, wm, externals, join, left, Some(elem));
                }
            }
        }
    }

    fn record_blocking(&mut self, join: JoinId, left: TokenId, elem: RightElem) {
        match elem {
            RightElem::Match(am) => self.alpha.matches[am].blocking.push((join, left)),
            RightElem::Token(t) => self.tokens[t].blocking.push((join, left)),
        }
    }

    /// A right element newly satisfies a negated/exists join against a
    /// left token.
    fn add_blocker(
        &mut self,
        atoms: &mut AtomTable,
        wm: &WorkingMemory,
        externals: &mut dyn ExternalDispatch,
        join: JoinId,
        left: TokenId,
        elem: RightElem,
    ) {
        let (negated, first_blocker, existing_out) = {
            let state = self.joins[join].neg.entry(left).or_default();
            state.blockers.push(elem);
            (
                self.joins[join].negated,
                self.joins[join].neg[&left].blockers.len() == 1,
                self.joins[join].neg[&left].out,
            )
        };
        self.record_blocking(join, left, elem);
        if negated {
            // The first blocker withdraws the dummy output.
            if let Some(out) = existing_out {
                self.joins[join].neg.get_mut(&left).expect("neg state").out = None;
                self.remove_token(atoms, wm, externals, out);
            }
        } else if first_blocker && existing_out.is_none() {
            let out = self.make_token(atoms, wm, externals, join, left, None);
            self.joins[join].neg.get_mut(&left).expect("neg state").out = Some(out);
        }
    }

    /// A blocker's right element went away.
    fn drop_blocker(
        &mut self,
        atoms: &mut AtomTable,
        wm: &WorkingMemory,
        externals: &mut dyn ExternalDispatch,
        join: JoinId,
        left: TokenId,
        elem: RightElem,
    ) {
        if !self.joins.contains(join) || !self.tokens.contains(left) {
            return;
        }
        let (negated, now_empty, existing_out) = {
            let state = match self.joins[join].neg.get_mut(&left) {
                Some(s) => s,
                None => return,
            };
            state.blockers.retain(|e| *e != elem);
            (
                self.joins[join].negated,
                self.joins[join].neg[&left].blockers.is_empty(),
                self.joins[join].neg[&left].out,
            )
        };
        if negated {
            if now_empty && existing_out.is_none() {
                let out = self.make_token(atoms, wm, externals, join, left, None);
                self.joins[join].neg.get_mut(&left).expect("neg state").out = Some(out);
            }
        } else if now_empty {
            if let Some(out) = existing_out {
                self.joins[join].neg.get_mut(&left).expect("neg state").out = None;
                self.remove_token(atoms, wm, externals, out);
            }
        }
    }

    /// Extends `left` into this join's output and propagates downstream.
    fn make_token(
        &mut self,
        atoms: &mut AtomTable,
        wm: &WorkingMemory,
        externals: &mut dyn ExternalDispatch,
        join: JoinId,
        left: TokenId,
        elem: Option<RightElem>,
    ) -> TokenId {
        let (depth, right_pattern, terminal) = {
            let j = &self.joins[join];
            (j.depth as usize, j.right_pattern as usize, j.terminal)
        };
        let mut binds: Vec<Option<AlphaMatchId>> = self.tokens[left].binds.to_vec();
        if binds.len() < depth {
            binds.resize(depth, None);
        }
        let mut right_match = None;
        let mut right_parent = None;
        match elem {
            Some(RightElem::Match(am)) => {
                binds[right_pattern] = Some(am);
                right_match = Some(am);
            }
            Some(RightElem::Token(rt)) => {
                let sub_binds: Vec<Option<AlphaMatchId>> = self.tokens[rt].binds.to_vec();
                for (i, b) in sub_binds.into_iter().enumerate() {
                    if b.is_some() && i < binds.len() {
                        binds[i] = b;
                    }
                }
                right_parent = Some(rt);
            }
            None => {}
        }
        let token = self.tokens.insert(Token {
            binds: binds.into_boxed_slice(),
            owner: Some(join),
            parent: Some(left),
            right_parent,
            right_match,
            children: Vec::new(),
            right_dependents: Vec::new(),
            blocking: Vec::new(),
        });
        self.tokens[left].children.push(token);
        if let Some(am) = right_match {
            self.alpha.matches[am].dependents.push(token);
        }
        if let Some(rt) = right_parent {
            self.tokens[rt].right_dependents.push(token);
        }
        self.joins[join].out.push(token);
        if let Some((rule, disjunct)) = terminal {
            self.events.push_back(MatchEvent::Activate { rule, disjunct, token });
        }
        let children = self.joins[join].children.clone();
        for child in children {
            self.left_insert(atoms, wm, externals, child, token);
        }
        let right_readers = self.joins[join].right_readers.clone();
        for reader in right_readers {
            self.right_insert(atoms, wm, externals, reader, RightElem::Token(token));
        }
        token
    }

    /// Dissolves a token and everything built on it.
    fn remove_token(
        &mut self,
        atoms: &mut AtomTable,
        wm: &WorkingMemory,
        externals: &mut dyn ExternalDispatch,
        token: TokenId,
    ) {
        if !self.tokens.contains(token) || token == self.root_token {
            return;
        }
        let (owner, parent, right_parent, right_match) = {
            let t = &self.tokens[token];
            (t.owner, t.parent, t.right_parent, t.right_match)
        };
        let owner = owner.expect("only the root token has no owner");

        // Unlink from producers first so reentrant removals skip us.
        if let Some(p) = parent {
            if self.tokens.contains(p) {
                self.tokens[p].children.retain(|c| *c != token);
            }
        }
        if let Some(rp) = right_parent {
            if self.tokens.contains(rp) {
                self.tokens[rp].right_dependents.retain(|c| *c != token);
            }
        }
        if let Some(am) = right_match {
            if self.alpha.matches.contains(am) {
                self.alpha.matches[am].dependents.retain(|c| *c != token);
            }
        }

        // Everything downstream dissolves before this token's own
        // bookkeeping disappears.
        let children = std::mem::take(&mut self.tokens[token].children);
        for child in children {
            self.remove_token(atoms, wm, externals, child);
        }
        let right_dependents = std::mem::take(&mut self.tokens[token].right_dependents);
        for dependent in right_dependents {
            self.remove_token(atoms, wm, externals, dependent);
        }

        // Withdraw from consumer indices.
        let consumer_children = self.joins[owner].children.clone();
        for child in consumer_children {
            let hash = self.left_hash(atoms, wm, child, token);
            if let Some(bucket) = self.joins[child].left_index.get_mut(&hash) {
                bucket.retain(|t| *t != token);
            }
            if let Some(state) = self.joins[child].neg.remove(&token) {
                for elem in state.blockers {
                    match elem {
                        RightElem::Match(am) => {
                            if self.alpha.matches.contains(am) {
                                self.alpha.matches[am]
                                    .blocking
                                    .retain(|(j, t)| !(*j == child && *t == token));
                            }
                        }
                        RightElem::Token(bt) => {
                            if self.tokens.contains(bt) {
                                self.tokens[bt]
                                    .blocking
                                    .retain(|(j, t)| !(*j == child && *t == token));
                            }
                        }
                    }
                }
            }
        }
        let right_readers = self.joins[owner].right_readers.clone();
        for reader in right_readers {
            if self.joins.contains(reader) {
                self.right_remove(atoms, wm, reader, RightElem::Token(token));
            }
        }

        // Negated joins this token was blocking may now produce.
        let blocking = std::mem::take(&mut self.tokens[token].blocking);
        for (join, blocked_left) in blocking {
            self.drop_blocker(atoms, wm, externals, join, blocked_left, RightElem::Token(token));
        }

        // If this token is a dummy output, clear the back-pointer.
        if self.joins[owner].negated || self.joins[owner].exists {
            if let Some(left) = parent {
                if let Some(state) = self.joins[owner].neg.get_mut(&left) {
                    if state.out == Some(token) {
                        state.out = None;
                    }
                }
            }
        }

        if let Some((rule, disjunct)) = self.joins[owner].terminal {
            self.events.push_back(MatchEvent::Deactivate { rule, disjunct, token });
        }
        if self.support.is_supporter(token) {
            let orphaned = self.support.supporter_gone(token);
            self.pending_logical.extend(orphaned);
        }
        self.joins[owner].out.retain(|t| *t != token);
        self.tokens.remove(token);
    }

    fn remove_amatch(
        &mut self,
        atoms: &mut AtomTable,
        wm: &WorkingMemory,
        externals: &mut dyn ExternalDispatch,
        am: AlphaMatchId,
    ) {
        if !self.alpha.matches.contains(am) {
            return;
        }
        let mem = self.alpha.matches[am].memory;
        // Withdraw from reader right indices before anything dissolves so
        // no reader re-finds this match mid-removal.
        let readers = self.alpha.memories[mem].readers.clone();
        for reader in &readers {
            self.right_remove(atoms, wm, *reader, RightElem::Match(am));
        }
        let dependents = std::mem::take(&mut self.alpha.matches[am].dependents);
        for token in dependents {
            self.remove_token(atoms, wm, externals, token);
        }
        let blocking = std::mem::take(&mut self.alpha.matches[am].blocking);
        for (join, left) in blocking {
            self.drop_blocker(atoms, wm, externals, join, left, RightElem::Match(am));
        }
        let entity = self.alpha.matches[am].entity;
        self.alpha.memories[mem].matches.retain(|m| *m != am);
        if let Some(list) = self.alpha.entity_matches.get_mut(&entity) {
            list.retain(|m| *m != am);
            if list.is_empty() {
                self.alpha.entity_matches.remove(&entity);
            }
        }
        self.alpha.matches.remove(am);
    }

    // ==================================================================
    // Detachment
    // ==================================================================

    fn detach_join(&mut self, join: JoinId) {
        if !self.joins.contains(join) {
            return;
        }
        self.joins[join].use_count -= 1;
        let (parent, right) = {
            let j = &self.joins[join];
            (j.parent, j.right)
        };
        if self.joins[join].use_count == 0 {
            let out = std::mem::take(&mut self.joins[join].out);
            for token in out {
                self.remove_token_for_detach(token);
            }
            match right {
                RightInput::Alpha(mem) => {
                    if self.alpha.memories.contains(mem) {
                        self.alpha.memories[mem].readers.retain(|r| *r != join);
                    }
                }
                RightInput::Join(sub) => {
                    if self.joins.contains(sub) {
                        self.joins[sub].right_readers.retain(|r| *r != join);
                    }
                }
            }
            match parent {
                Some(p) => {
                    if self.joins.contains(p) {
                        self.joins[p].children.retain(|c| *c != join);
                    }
                }
                None => self.first_joins.retain(|j| *j != join),
            }
            // Release blocker back-references held by surviving elements.
            let neg: Vec<NegState> = self.joins[join].neg.drain().map(|(_, s)| s).collect();
            for state in neg {
                for elem in state.blockers {
                    match elem {
                        RightElem::Match(m) => {
                            if self.alpha.matches.contains(m) {
                                self.alpha.matches[m].blocking.retain(|(j, _)| *j != join);
                            }
                        }
                        RightElem::Token(t) => {
                            if self.tokens.contains(t) {
                                self.tokens[t].blocking.retain(|(j, _)| *j != join);
                            }
                        }
                    }
                }
            }
            self.joins.remove(join);
        }
        match right {
            RightInput::Alpha(mem) => self.detach_alpha(mem),
            RightInput::Join(sub) => self.detach_join(sub),
        }
        if let Some(p) = parent {
            self.detach_join(p);
        }
    }

    /// Token removal during rule detachment. The dying join's own
    /// indices are being discarded wholesale, and a join only dies once
    /// every consumer is already gone, so no index maintenance is
    /// needed beyond producer links and terminal events.
    fn remove_token_for_detach(&mut self, token: TokenId) {
        if !self.tokens.contains(token) || token == self.root_token {
            return;
        }
        let (owner, parent, right_parent, right_match) = {
            let t = &self.tokens[token];
            (t.owner, t.parent, t.right_parent, t.right_match)
        };
        let children = std::mem::take(&mut self.tokens[token].children);
        for child in children {
            self.remove_token_for_detach(child);
        }
        let right_dependents = std::mem::take(&mut self.tokens[token].right_dependents);
        for dependent in right_dependents {
            self.remove_token_for_detach(dependent);
        }
        if let Some(p) = parent {
            if self.tokens.contains(p) {
                self.tokens[p].children.retain(|c| *c != token);
            }
        }
        if let Some(rp) = right_parent {
            if self.tokens.contains(rp) {
                self.tokens[rp].right_dependents.retain(|c| *c != token);
            }
        }
        if let Some(am) = right_match {
            if self.alpha.matches.contains(am) {
                self.alpha.matches[am].dependents.retain(|c| *c != token);
            }
        }
        if let Some(owner) = owner {
            if self.joins.contains(owner) {
                if let Some((rule, disjunct)) = self.joins[owner].terminal {
                    self.events.push_back(MatchEvent::Deactivate { rule, disjunct, token });
                }
                self.joins[owner].out.retain(|t| *t != token);
            }
        }
        if self.support.is_supporter(token) {
            let orphaned = self.support.supporter_gone(token);
            self.pending_logical.extend(orphaned);
        }
        self.tokens.remove(token);
    }

    fn detach_alpha(&mut self, mem: AlphaMemId) {
        if !self.alpha.memories.contains(mem) {
            return;
        }
        self.alpha.memories[mem].use_count -= 1;
        let leaf = self.alpha.memories[mem].node;
        if self.alpha.memories[mem].use_count == 0 {
            let matches = std::mem::take(&mut self.alpha.memories[mem].matches);
            for am in matches {
                let entity = self.alpha.matches[am].entity;
                if let Some(list) = self.alpha.entity_matches.get_mut(&entity) {
                    list.retain(|m| *m != am);
                    if list.is_empty() {
                        self.alpha.entity_matches.remove(&entity);
                    }
                }
                self.alpha.matches.remove(am);
            }
            self.alpha.nodes[leaf].memory = None;
            self.alpha.memories.remove(mem);
        }
        // Decrement the whole path; prune nodes that drop to zero.
        let mut current = Some(leaf);
        while let Some(node_id) = current {
            let parent = self.alpha.nodes[node_id].parent;
            self.alpha.nodes[node_id].use_count -= 1;
            if self.alpha.nodes[node_id].use_count == 0 {
                let test = self.alpha.nodes[node_id].test.clone();
                if let Some(p) = parent {
                    match &test {
                        AlphaTest::SlotConstant { slot, atom } => {
                            self.alpha.nodes[p].hashed.remove(&(*slot, *atom));
                            let still_used =
                                self.alpha.nodes[p].hashed.keys().any(|(s, _)| s == slot);
                            if !still_used {
                                self.alpha.nodes[p].hashed_slots.retain(|s| s != slot);
                            }
                        }
                        _ => {
                            self.alpha.nodes[p].linear.retain(|c| *c != node_id);
                        }
                    }
                } else if let AlphaTest::Root(target) = &test {
                    match target {
                        PatternTarget::Template(t) => {
                            self.alpha.template_roots.remove(t);
                        }
                        PatternTarget::Class(c) => {
                            self.alpha.class_roots.remove(c);
                        }
                    }
                }
                self.alpha.nodes.remove(node_id);
            }
            current = parent;
        }
    }

    // ==================================================================
    // Introspection helpers
    // ==================================================================

    /// True when no partial matches (beyond the root) or alpha matches
    /// remain anywhere.
    pub fn is_quiescent(&self) -> bool {
        self.tokens.len() == 1 && self.alpha.matches.is_empty() && self.support.is_empty()
    }

    /// Detaches a token's binding data so a firing can keep reading it
    /// after the token itself dissolves.
    pub fn detach_token(&self, token: TokenId) -> crate::bindings::DetachedBinds {
        let entries = self.tokens[token]
            .binds
            .iter()
            .map(|b| {
                b.map(|am| {
                    let amatch = &self.alpha.matches[am];
                    (amatch.entity, amatch.markers.clone())
                })
            })
            .collect();
        crate::bindings::DetachedBinds { entries }
    }

    /// Fetches a bound value out of a token, as firing bindings would.
    pub fn fetch_from_token(
        &self,
        wm: &WorkingMemory,
        token: TokenId,
        desc: &FetchDesc,
    ) -> Option<Value> {
        let t = self.tokens.get(token)?;
        let am = (*t.binds.get(desc.pattern as usize)?)?;
        let amatch = self.alpha.matches.get(am)?;
        read_entity(amatch.entity, &amatch.markers, wm, desc, false)
    }
}

impl Default for Network {
    fn default() -> Self {
        Self::new()
    }
}
