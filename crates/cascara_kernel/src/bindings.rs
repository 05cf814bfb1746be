//! Binding contexts the kernel presents to the expression evaluator.
//!
//! The compiler rewrites every variable reference into a [`FetchDesc`]
//! naming a pattern position, a slot, and a field part. At evaluation
//! time one of the contexts here resolves that descriptor against live
//! match data, consulting basis snapshots while a join operation is in
//! progress so in-flight firings keep consistent bindings.

use crate::alpha::{AlphaMatch, ChainMarkers};
use crate::beta::{RightElem, Token, TokenId};
use crate::entity::EntityRef;
use cascara_base::{Arena, AtomId, Value};
use cascara_data::{Bindings, FetchDesc, FieldRef, WorkingMemory};

/// The self-pattern convention used by alpha-network residual tests:
/// a fetch with this pattern index reads the entity under examination,
/// whatever pattern position it later binds. This is what lets alpha
/// nodes be shared across rules that place the pattern differently.
pub const SELF_PATTERN: u16 = u16::MAX;

/// Resolves a fetch against one entity and its chain markers.
pub(crate) fn read_entity(
    entity: EntityRef,
    markers: &[ChainMarkers],
    wm: &WorkingMemory,
    desc: &FetchDesc,
    use_basis: bool,
) -> Option<Value> {
    if desc.which == FieldRef::Entity {
        return Some(Value::Handle(entity.to_handle()));
    }
    let slot_value = entity.slot_value(wm, desc.slot, use_basis)?;
    match desc.which {
        FieldRef::Entity => unreachable!(),
        FieldRef::Slot => Some(slot_value.clone()),
        FieldRef::Item { chain, item, multi } => {
            let set = markers.get(chain as usize)?;
            debug_assert_eq!(set.slot, desc.slot);
            let (begin, len) = *set.spans.get(item as usize)?;
            let mf = slot_value.as_multi()?;
            if multi {
                Some(Value::Multi(mf.sub(begin as usize, len as usize)))
            } else {
                debug_assert_eq!(len, 1);
                mf.get(begin as usize).map(Value::Atom)
            }
        }
    }
}

/// Bindings for alpha-network residuals: the entity under examination
/// plus the markers accumulated along the discrimination path.
pub struct SelfBindings<'a> {
    pub entity: EntityRef,
    pub markers: &'a [ChainMarkers],
    pub wm: &'a WorkingMemory,
}

impl Bindings for SelfBindings<'_> {
    fn fetch(&self, desc: &FetchDesc) -> Option<Value> {
        debug_assert_eq!(desc.pattern, SELF_PATTERN);
        // The matcher always tests current slot values; basis snapshots
        // are for firings only.
        read_entity(self.entity, self.markers, self.wm, desc, false)
    }
}

/// Bindings over a partial match, optionally extended with a candidate
/// right element that has not been merged into a token yet.
pub struct JoinBindings<'a> {
    pub tokens: &'a Arena<Token>,
    pub amatches: &'a Arena<AlphaMatch>,
    pub wm: &'a WorkingMemory,
    /// The left token; the root token for first joins.
    pub left: TokenId,
    /// The right element under test and the position it would bind.
    pub right: Option<(u16, RightElem)>,
}

impl JoinBindings<'_> {
    fn amatch_for(&self, pattern: u16) -> Option<&AlphaMatch> {
        if let Some((right_pattern, elem)) = self.right {
            match elem {
                RightElem::Match(am) if pattern == right_pattern => {
                    return Some(&self.amatches[am]);
                }
                RightElem::Token(t) if pattern >= right_pattern => {
                    // A subnetwork token binds the positions from
                    // right_pattern onward.
                    let token = &self.tokens[t];
                    if let Some(Some(am)) = token.binds.get(pattern as usize) {
                        return Some(&self.amatches[*am]);
                    }
                }
                _ => {}
            }
        }
        let token = &self.tokens[self.left];
        match token.binds.get(pattern as usize) {
            Some(Some(am)) => Some(&self.amatches[*am]),
            _ => None,
        }
    }
}

impl Bindings for JoinBindings<'_> {
    fn fetch(&self, desc: &FetchDesc) -> Option<Value> {
        let amatch = self.amatch_for(desc.pattern)?;
        read_entity(amatch.entity, &amatch.markers, self.wm, desc, false)
    }
}

/// A firing's snapshot of its activation's bindings.
///
/// A rule's own actions can retract or modify the facts it matched,
/// dissolving the token mid-firing. The engine therefore detaches the
/// binding data (entity plus markers per pattern position) before the
/// first action runs; the entities' storage stays alive through busy
/// counts until the firing completes.
#[derive(Clone, Debug)]
pub struct DetachedBinds {
    pub entries: Vec<Option<(EntityRef, Vec<ChainMarkers>)>>,
}

/// Bindings for a firing: the detached partial match plus RHS locals
/// and engine globals layered on by the system.
pub struct FiringBindings<'a> {
    pub binds: &'a DetachedBinds,
    pub wm: &'a WorkingMemory,
    pub locals: &'a [Option<Value>],
    pub globals: &'a dyn Fn(AtomId) -> Option<Value>,
}

impl Bindings for FiringBindings<'_> {
    fn fetch(&self, desc: &FetchDesc) -> Option<Value> {
        let (entity, markers) = self
            .binds
            .entries
            .get(desc.pattern as usize)?
            .as_ref()?;
        read_entity(*entity, markers, self.wm, desc, true)
    }

    fn local(&self, index: u16) -> Option<Value> {
        self.locals.get(index as usize)?.clone()
    }

    fn global(&self, name: AtomId) -> Option<Value> {
        (self.globals)(name)
    }
}
