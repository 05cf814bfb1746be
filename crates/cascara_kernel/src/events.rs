//! Match events handed from the network to the agenda.

use crate::beta::TokenId;
use crate::rule::RuleId;

/// Emitted by terminal joins as partial matches complete or dissolve.
///
/// The network queues events in propagation order; the system layer
/// drains them into the agenda at each change boundary, before any
/// retracted storage is released.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum MatchEvent {
    /// A terminal join produced a complete match.
    Activate {
        rule: RuleId,
        disjunct: u16,
        token: TokenId,
    },
    /// A complete match dissolved before firing.
    Deactivate {
        rule: RuleId,
        disjunct: u16,
        token: TokenId,
    },
}
