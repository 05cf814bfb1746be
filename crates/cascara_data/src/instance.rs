//! Instances: class-based working memory entities.

use crate::class::ClassId;
use cascara_base::{ArenaId, AtomId, Value};

/// Stable handle to an instance.
pub type InstanceId = ArenaId<Instance>;

/// A class-based entity in working memory.
///
/// Unlike facts, instances are modified in place: a slot update bumps the
/// time tag and pins the pre-modify values in `basis` so rules already
/// activated against the old shape keep consistent bindings while the
/// current firing completes.
#[derive(Debug)]
pub struct Instance {
    /// The instance name atom, unique across the engine.
    pub name: AtomId,
    pub class: ClassId,
    pub slots: Vec<Value>,
    pub time_tag: u64,
    pub garbage: bool,
    pub basis: Option<Vec<Value>>,
    pub busy: u32,
}

impl Instance {
    pub fn visible_slots(&self, use_basis: bool) -> &[Value] {
        match (&self.basis, use_basis) {
            (Some(basis), true) => basis,
            _ => &self.slots,
        }
    }
}
