//! Patternable entities: the fact/instance dispatch seam.
//!
//! Facts and instances are the two things the network can match. Rather
//! than trait objects, an [`EntityRef`] is a small sum type dispatching
//! to the working memory, which keeps entity references `Copy` and lets
//! memories hold them directly.

use cascara_base::{Handle, HandleKind, Value};
use cascara_data::{FactId, InstanceId, SlotId, WorkingMemory};

/// A reference to one patternable working-memory entity.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum EntityRef {
    Fact(FactId),
    Instance(InstanceId),
}

impl EntityRef {
    /// The entity's change timestamp.
    pub fn time_tag(self, wm: &WorkingMemory) -> u64 {
        match self {
            EntityRef::Fact(id) => wm.facts[id].time_tag,
            EntityRef::Instance(id) => wm.instances[id].time_tag,
        }
    }

    /// True once the entity has been retracted.
    pub fn is_garbage(self, wm: &WorkingMemory) -> bool {
        match self {
            EntityRef::Fact(id) => wm.facts.get(id).map_or(true, |f| f.garbage),
            EntityRef::Instance(id) => wm.instances.get(id).map_or(true, |i| i.garbage),
        }
    }

    /// True while storage still exists for the entity.
    pub fn is_live(self, wm: &WorkingMemory) -> bool {
        match self {
            EntityRef::Fact(id) => wm.facts.contains(id),
            EntityRef::Instance(id) => wm.instances.contains(id),
        }
    }

    pub fn busy_increment(self, wm: &mut WorkingMemory) {
        match self {
            EntityRef::Fact(id) => wm.facts[id].busy += 1,
            EntityRef::Instance(id) => wm.instances[id].busy += 1,
        }
    }

    pub fn busy_decrement(self, wm: &mut WorkingMemory) {
        match self {
            EntityRef::Fact(id) => {
                let fact = &mut wm.facts[id];
                debug_assert!(fact.busy > 0);
                fact.busy = fact.busy.saturating_sub(1);
            }
            EntityRef::Instance(id) => {
                let instance = &mut wm.instances[id];
                debug_assert!(instance.busy > 0);
                instance.busy = instance.busy.saturating_sub(1);
            }
        }
    }

    pub fn busy(self, wm: &WorkingMemory) -> u32 {
        match self {
            EntityRef::Fact(id) => wm.facts[id].busy,
            EntityRef::Instance(id) => wm.instances[id].busy,
        }
    }

    /// Reads one slot as a firing or join test should see it: the basis
    /// snapshot when one is pinned and `use_basis` is set.
    pub fn slot_value(self, wm: &WorkingMemory, slot: SlotId, use_basis: bool) -> Option<&Value> {
        match self {
            EntityRef::Fact(id) => {
                wm.facts.get(id)?.visible_slots(use_basis).get(slot.index())
            }
            EntityRef::Instance(id) => {
                wm.instances.get(id)?.visible_slots(use_basis).get(slot.index())
            }
        }
    }

    /// The address-value form of this entity.
    pub fn to_handle(self) -> Handle {
        match self {
            EntityRef::Fact(id) => Handle {
                kind: HandleKind::Fact,
                index: id.index() as u64,
            },
            EntityRef::Instance(id) => Handle {
                kind: HandleKind::Instance,
                index: id.index() as u64,
            },
        }
    }

    pub fn from_handle(handle: Handle) -> Option<EntityRef> {
        match handle.kind {
            HandleKind::Fact => Some(EntityRef::Fact(FactId::from_index(handle.index as usize))),
            HandleKind::Instance => Some(EntityRef::Instance(InstanceId::from_index(
                handle.index as usize,
            ))),
            HandleKind::External => None,
        }
    }
}
