//! Logical support: derived entities withdraw with their justification.
//!
//! A supporter is the partial-match prefix at a rule's logical join,
//! captured when an RHS assert runs. Each supported entity keeps its
//! supporter set and each supporter its supported set; the graph is
//! acyclic by construction because supporters always predate what they
//! justify. When a supporter token dissolves, entities left with no
//! supporter are queued for retraction, processed after the current join
//! cycle so memories are never mutated mid-walk.

use crate::beta::TokenId;
use crate::entity::EntityRef;
use rustc_hash::FxHashMap;

#[derive(Default)]
pub struct LogicalSupport {
    by_supporter: FxHashMap<TokenId, Vec<EntityRef>>,
    by_supported: FxHashMap<EntityRef, Vec<TokenId>>,
}

impl LogicalSupport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `supporter` as a justification for `entity`.
    pub fn add(&mut self, supporter: TokenId, entity: EntityRef) {
        let supported = self.by_supporter.entry(supporter).or_default();
        if !supported.contains(&entity) {
            supported.push(entity);
        }
        let supporters = self.by_supported.entry(entity).or_default();
        if !supporters.contains(&supporter) {
            supporters.push(supporter);
        }
    }

    /// An unconditional assert of an already-supported entity strips its
    /// supporters: it no longer withdraws with anything.
    pub fn make_unconditional(&mut self, entity: EntityRef) {
        if let Some(supporters) = self.by_supported.remove(&entity) {
            for supporter in supporters {
                if let Some(supported) = self.by_supporter.get_mut(&supporter) {
                    supported.retain(|e| *e != entity);
                    if supported.is_empty() {
                        self.by_supporter.remove(&supporter);
                    }
                }
            }
        }
    }

    /// True when the entity has at least one supporter.
    pub fn is_supported(&self, entity: EntityRef) -> bool {
        self.by_supported.contains_key(&entity)
    }

    /// Drops a dissolving supporter, returning entities that just lost
    /// their last justification and must be retracted.
    pub fn supporter_gone(&mut self, supporter: TokenId) -> Vec<EntityRef> {
        let mut orphaned = Vec::new();
        if let Some(supported) = self.by_supporter.remove(&supporter) {
            for entity in supported {
                if let Some(supporters) = self.by_supported.get_mut(&entity) {
                    supporters.retain(|s| *s != supporter);
                    if supporters.is_empty() {
                        self.by_supported.remove(&entity);
                        orphaned.push(entity);
                    }
                }
            }
        }
        orphaned
    }

    /// Forgets a retracted entity's remaining support links.
    pub fn entity_gone(&mut self, entity: EntityRef) {
        if let Some(supporters) = self.by_supported.remove(&entity) {
            for supporter in supporters {
                if let Some(supported) = self.by_supporter.get_mut(&supporter) {
                    supported.retain(|e| *e != entity);
                    if supported.is_empty() {
                        self.by_supporter.remove(&supporter);
                    }
                }
            }
        }
    }

    pub fn is_supporter(&self, token: TokenId) -> bool {
        self.by_supporter.contains_key(&token)
    }

    pub fn is_empty(&self) -> bool {
        self.by_supporter.is_empty() && self.by_supported.is_empty()
    }

    pub fn clear(&mut self) {
        self.by_supporter.clear();
        self.by_supported.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cascara_data::FactId;

    fn fact(n: usize) -> EntityRef {
        EntityRef::Fact(FactId::from_index(n))
    }

    fn token(n: usize) -> TokenId {
        TokenId::from_index(n)
    }

    #[test]
    fn last_supporter_gone_orphans_the_entity() {
        let mut support = LogicalSupport::new();
        support.add(token(1), fact(10));
        support.add(token(2), fact(10));
        assert!(support.supporter_gone(token(1)).is_empty());
        assert_eq!(support.supporter_gone(token(2)), vec![fact(10)]);
        assert!(support.is_empty());
    }

    #[test]
    fn unconditional_assert_strips_support() {
        let mut support = LogicalSupport::new();
        support.add(token(1), fact(10));
        support.make_unconditional(fact(10));
        assert!(!support.is_supported(fact(10)));
        assert!(support.supporter_gone(token(1)).is_empty());
    }

    #[test]
    fn one_supporter_may_justify_many() {
        let mut support = LogicalSupport::new();
        support.add(token(1), fact(10));
        support.add(token(1), fact(11));
        let mut orphaned = support.supporter_gone(token(1));
        orphaned.sort_by_key(|e| match e {
            EntityRef::Fact(id) => id.index(),
            EntityRef::Instance(id) => id.index(),
        });
        assert_eq!(orphaned, vec![fact(10), fact(11)]);
    }
}
