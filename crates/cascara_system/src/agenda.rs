//! The agenda: salience-ordered activations with pluggable strategies.
//!
//! Each module owns one agenda. Activations are kept fully sorted:
//! descending salience first, then the configured strategy's key, then
//! insertion order (ties are deterministic by construction). Insertion
//! is an ordered scan, which keeps the common small-agenda case simple
//! and allocation-free.
//!
//! Refraction is structural: a partial match fires at most once while it
//! exists. The fired set records (rule, disjunct, token); entries leave
//! when the token dissolves, so a match that is genuinely re-derived
//! (its facts retracted and re-asserted) activates again, while a match
//! that merely persists does not re-enter the agenda.

use crate::config::Strategy;
use cascara_kernel::{RuleId, TokenId};
use rustc_hash::FxHashSet;
use std::cmp::Ordering;

/// One ready-to-fire rule instantiation.
#[derive(Clone, Debug)]
pub struct Activation {
    pub rule: RuleId,
    pub disjunct: u16,
    pub token: TokenId,
    pub salience: i32,
    /// Timestamps of the partial match's entities, newest first.
    pub time_tags: Vec<u64>,
    /// Timestamp of the first pattern's entity (the mea strategy).
    pub first_tag: u64,
    pub complexity: u32,
    /// Drawn at activation time for the random strategy.
    pub random_tag: u64,
    /// Insertion order, the universal tie-break.
    pub seq: u64,
}

/// `Less` fires first.
fn compare(a: &Activation, b: &Activation, strategy: Strategy) -> Ordering {
    b.salience
        .cmp(&a.salience)
        .then_with(|| strategy_key(a, b, strategy))
        .then_with(|| a.seq.cmp(&b.seq))
}

fn strategy_key(a: &Activation, b: &Activation, strategy: Strategy) -> Ordering {
    match strategy {
        Strategy::Depth => lex_newer_first(&a.time_tags, &b.time_tags),
        Strategy::Breadth => lex_newer_first(&a.time_tags, &b.time_tags).reverse(),
        Strategy::Lex => lex_newer_first(&a.time_tags, &b.time_tags),
        Strategy::Mea => b
            .first_tag
            .cmp(&a.first_tag)
            .then_with(|| lex_newer_first(&a.time_tags, &b.time_tags)),
        Strategy::Simplicity => a.complexity.cmp(&b.complexity),
        Strategy::Complexity => b.complexity.cmp(&a.complexity),
        Strategy::Random => a.random_tag.cmp(&b.random_tag),
    }
}

/// Lexicographic over descending-sorted tag vectors; larger (newer)
/// tags win, a longer vector winning an equal prefix.
fn lex_newer_first(a: &[u64], b: &[u64]) -> Ordering {
    for (x, y) in a.iter().zip(b.iter()) {
        match y.cmp(x) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    b.len().cmp(&a.len())
}

/// One module's agenda.
#[derive(Default)]
pub struct Agenda {
    items: Vec<Activation>,
    fired: FxHashSet<(RuleId, u16, TokenId)>,
    next_seq: u64,
}

impl Agenda {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts unless refraction or duplication suppresses it.
    pub fn insert(&mut self, mut activation: Activation, strategy: Strategy) -> bool {
        let key = (activation.rule, activation.disjunct, activation.token);
        if self.fired.contains(&key) {
            return false;
        }
        if self
            .items
            .iter()
            .any(|a| (a.rule, a.disjunct, a.token) == key)
        {
            return false;
        }
        activation.seq = self.next_seq;
        self.next_seq += 1;
        let at = self
            .items
            .partition_point(|existing| compare(existing, &activation, strategy) != Ordering::Greater);
        self.items.insert(at, activation);
        true
    }

    /// Removes the activation for a dissolved partial match. Clears any
    /// refraction entry as well: a re-derived match may fire again.
    pub fn remove_token(&mut self, rule: RuleId, disjunct: u16, token: TokenId) -> Option<Activation> {
        self.fired.remove(&(rule, disjunct, token));
        let index = self
            .items
            .iter()
            .position(|a| a.rule == rule && a.disjunct == disjunct && a.token == token)?;
        Some(self.items.remove(index))
    }

    /// Pops the best activation and records it as fired.
    pub fn pop_best(&mut self) -> Option<Activation> {
        if self.items.is_empty() {
            return None;
        }
        let activation = self.items.remove(0);
        self.fired
            .insert((activation.rule, activation.disjunct, activation.token));
        Some(activation)
    }

    pub fn peek_best(&self) -> Option<&Activation> {
        self.items.first()
    }

    /// Re-sorts in place (strategy change, every-cycle salience).
    pub fn resort(&mut self, strategy: Strategy) {
        self.items
            .sort_by(|a, b| compare(a, b, strategy));
    }

    /// Applies freshly evaluated saliences, then re-sorts.
    pub fn update_salience(&mut self, strategy: Strategy, mut salience_of: impl FnMut(&Activation) -> i32) {
        for item in &mut self.items {
            item.salience = salience_of(item);
        }
        self.resort(strategy);
    }

    /// Forgets that a rule's surviving matches fired, letting them
    /// re-activate; returns the cleared tokens.
    pub fn refresh_rule(&mut self, rule: RuleId) -> Vec<(u16, TokenId)> {
        let cleared: Vec<(u16, TokenId)> = self
            .fired
            .iter()
            .filter(|(r, _, _)| *r == rule)
            .map(|(_, d, t)| (*d, *t))
            .collect();
        self.fired.retain(|(r, _, _)| *r != rule);
        cleared
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Activation> {
        self.items.iter()
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.fired.clear();
    }
}
