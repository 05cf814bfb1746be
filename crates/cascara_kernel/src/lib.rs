//! # cascara-kernel
//!
//! The match network of the cascara rule engine: everything between a
//! working-memory change and an agenda change.
//!
//! - [`alpha`] — per-pattern discrimination trees with hashed constant
//!   children, multifield segmentation, and alpha memories
//! - [`beta`] — two-input joins with hashed left/right memories,
//!   negated/exists variants, and joins-from-the-right
//! - [`logical`] — the support graph behind `(logical ...)` groups
//! - [`network`] — the facade owning every arena and driving whole-change
//!   propagation
//! - [`rule`] — compiled rules and RHS actions
//!
//! The kernel is deterministic and total over its inputs: a change either
//! produces match events or it does not; evaluation errors inside join
//! tests simply fail the test. Firing, conflict resolution, and I/O live
//! a layer up, in `cascara-system`.

pub mod alpha;
pub mod beta;
pub mod bindings;
pub mod entity;
pub mod events;
pub mod logical;
pub mod network;
pub mod rule;

pub use alpha::{
    AlphaMatch, AlphaMatchId, AlphaMemId, AlphaMemory, AlphaNet, AlphaNode, AlphaNodeId,
    AlphaTest, ChainItem, ChainMarkers, FieldChain, PatternTarget,
};
pub use beta::{JoinCond, JoinId, JoinNode, RightElem, RightInput, Token, TokenId};
pub use bindings::{DetachedBinds, FiringBindings, JoinBindings, SelfBindings, SELF_PATTERN};
pub use entity::EntityRef;
pub use events::MatchEvent;
pub use logical::LogicalSupport;
pub use network::{JoinSpec, Network};
pub use rule::{Action, ActionSlot, CompiledRule, Disjunct, RuleId};
