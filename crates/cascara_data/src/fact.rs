//! Facts: template-based working memory records.

use crate::template::TemplateId;
use cascara_base::{ArenaId, Value};

/// Stable handle to a fact; the raw index doubles as the external
/// fact number.
pub type FactId = ArenaId<Fact>;

/// A template-based record in working memory.
#[derive(Debug)]
pub struct Fact {
    pub template: TemplateId,
    /// One value per template slot, canonicalized at assert time.
    pub slots: Vec<Value>,
    /// Assertion timestamp; greater means more recent.
    pub time_tag: u64,
    /// Set on retract; storage is released once nothing references it.
    pub garbage: bool,
    /// Pre-modify slot values retained while a firing that matched the
    /// old shape is still running.
    pub basis: Option<Vec<Value>>,
    /// Alpha matches plus in-flight firings referencing this fact.
    pub busy: u32,
    /// Content hash over (template, slots) used for duplicate detection.
    pub content_hash: u64,
}

impl Fact {
    /// Slot values as a rule firing should observe them: the basis
    /// snapshot when one is pinned, the live values otherwise.
    pub fn visible_slots(&self, use_basis: bool) -> &[Value] {
        match (&self.basis, use_basis) {
            (Some(basis), true) => basis,
            _ => &self.slots,
        }
    }
}
