//! # cascara-data
//!
//! Schema and working-memory state for the cascara rule engine:
//!
//! - [`ConstraintRecord`] — per-slot type/value/range/cardinality lattice
//! - [`Template`]/[`SlotSpec`] — fact schemas, including implied ordered
//!   templates
//! - [`Class`]/[`Instance`] — the object side of working memory
//! - [`WorkingMemory`] — fact/instance stores, indices, duplicate
//!   detection, and the global change timestamp
//! - [`Expr`] — compiled expression trees evaluated at match and firing
//!   time through the [`Bindings`] and [`ExternalDispatch`] seams
//!
//! This crate knows nothing about the match network. Retraction here only
//! marks entities; the kernel decides when storage is actually released,
//! after propagation has finished with it.

pub mod class;
pub mod constraint;
pub mod expr;
pub mod fact;
pub mod instance;
pub mod store;
pub mod template;

pub use class::{Class, ClassId};
pub use constraint::{Cardinality, ConstraintCheck, ConstraintRecord, NumericRange, TypeMask};
pub use expr::{
    eval, flatten_to_multifield, is_truthy, values_equal, ArithOp, Bindings, CmpOp, EmptyBindings,
    EvalError, EvalResult, Expr, ExternalDispatch, FetchDesc, FieldRef, NoExternals,
};
pub use fact::{Fact, FactId};
pub use instance::{Instance, InstanceId};
pub use store::{fact_content_hash, AssertError, DefineError, WorkingMemory};
pub use template::{
    DefaultSpec, SlotAccess, SlotId, SlotSpec, Template, TemplateId, IMPLIED_SLOT,
};

/// Identifies a module (namespace). Modules themselves are managed by the
/// system layer; schema records carry the id so name lookup can respect
/// imports.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
pub struct ModuleId(pub u16);

/// The default `MAIN` module every engine starts with.
pub const MAIN_MODULE: ModuleId = ModuleId(0);
