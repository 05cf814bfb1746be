//! The beta side of the network: two-input joins and partial matches.
//!
//! A rule with N patterns compiles to a chain of N joins (the first
//! join's left input is the permanent empty token). Each join keeps a
//! hashed index over its left input (the parent's output tokens) and a
//! hashed index over its right input (an alpha memory, or a subnetwork
//! join for joins-from-the-right), keyed by the compiled equi-join
//! expressions; propagation only visits the opposite same-hash bucket
//! and re-verifies key equality plus any residual tests per candidate
//! pair.
//!
//! Negated joins keep per-left-token blocker sets: the dummy output
//! token exists exactly while the set is empty. Exists joins are the
//! counted complement. All cross-references are arena ids, so sharing a
//! join across rules is a use-count, not an ownership question.

use crate::alpha::{AlphaMatchId, AlphaMemId};
use crate::rule::RuleId;
use cascara_base::ArenaId;
use cascara_data::{Expr, FetchDesc};
use rustc_hash::FxHashMap;

pub type JoinId = ArenaId<JoinNode>;
pub type TokenId = ArenaId<Token>;

/// A join's right input.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RightInput {
    /// An alpha memory (ordinary patterns).
    Alpha(AlphaMemId),
    /// Another join's output (joins-from-the-right for nested groups).
    Join(JoinId),
}

/// One element arriving on a join's right input.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum RightElem {
    Match(AlphaMatchId),
    Token(TokenId),
}

/// A residual join condition evaluated per candidate pair.
#[derive(Clone, PartialEq, Debug)]
pub enum JoinCond {
    /// Variable equality (or inequality) between a left and a right
    /// binding that did not factor into the hash keys.
    Eq {
        left: FetchDesc,
        right: FetchDesc,
        negate: bool,
    },
    /// A general expression: predicate joins and test CEs.
    Expr(Expr),
}

/// Per-left-token state of a negated or exists join.
#[derive(Debug, Default)]
pub struct NegState {
    /// Right elements currently satisfying the join test against this
    /// left token.
    pub blockers: Vec<RightElem>,
    /// The dummy output token, present while the blocker set is empty
    /// (negated) or non-empty (exists).
    pub out: Option<TokenId>,
}

/// A two-input join node.
#[derive(Debug)]
pub struct JoinNode {
    /// Left input: the parent join's output, or the empty token for
    /// first joins.
    pub parent: Option<JoinId>,
    pub right: RightInput,
    /// Output token size: last bound pattern position + 1.
    pub depth: u16,
    /// Absolute pattern position the right input binds. For
    /// joins-from-the-right this is the subnetwork's first position;
    /// right fetches still address absolute positions.
    pub right_pattern: u16,
    /// Equi-join key into the left token; empty means one bucket.
    pub left_key: Vec<FetchDesc>,
    /// Equi-join key into the right element.
    pub right_key: Vec<FetchDesc>,
    /// Residual conditions beyond the keys.
    pub tests: Vec<JoinCond>,
    pub negated: bool,
    pub exists: bool,
    pub from_right: bool,
    /// Outputs of this join carry logical-support boundaries.
    pub has_logical: bool,
    /// Set on the last join of a disjunct.
    pub terminal: Option<(RuleId, u16)>,
    /// Child joins in registration order.
    pub children: Vec<JoinId>,
    /// Joins consuming this join's output as their right input.
    pub right_readers: Vec<JoinId>,
    /// Rules sharing this join.
    pub use_count: u32,
    /// Left input tokens bucketed by left-key hash.
    pub left_index: FxHashMap<u64, Vec<TokenId>>,
    /// Right input elements bucketed by right-key hash.
    pub right_index: FxHashMap<u64, Vec<RightElem>>,
    /// Output tokens in creation order.
    pub out: Vec<TokenId>,
    /// Negated/exists bookkeeping per left token.
    pub neg: FxHashMap<TokenId, NegState>,
}

impl JoinNode {
    pub fn is_first(&self) -> bool {
        self.parent.is_none()
    }
}

/// A partial match: one entity assignment per pattern position covered
/// so far.
#[derive(Debug)]
pub struct Token {
    /// Indexed by absolute pattern position; `None` for positions a
    /// negated pattern or a gap covers.
    pub binds: Box<[Option<AlphaMatchId>]>,
    /// The join whose output this token is; `None` only for the
    /// permanent root token.
    pub owner: Option<JoinId>,
    /// Left parent.
    pub parent: Option<TokenId>,
    /// Right parent when the right input was a subnetwork token.
    pub right_parent: Option<TokenId>,
    /// The alpha match this token extended with, if any.
    pub right_match: Option<AlphaMatchId>,
    /// Downstream tokens whose left parent is this token.
    pub children: Vec<TokenId>,
    /// Downstream tokens whose right parent is this token.
    pub right_dependents: Vec<TokenId>,
    /// Negated joins where this token (as a subnetwork output) blocks a
    /// left token.
    pub blocking: Vec<(JoinId, TokenId)>,
}

impl Token {
    /// The permanent empty token first joins use as their left input.
    pub fn root() -> Self {
        Token {
            binds: Box::from([]),
            owner: None,
            parent: None,
            right_parent: None,
            right_match: None,
            children: Vec::new(),
            right_dependents: Vec::new(),
            blocking: Vec::new(),
        }
    }
}
