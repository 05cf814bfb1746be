//! # cascara-base
//!
//! Pure structural atoms for the cascara rule engine.
//!
//! This crate provides the foundational types every other cascara crate
//! builds on:
//!
//! - [`AtomTable`]/[`AtomId`] — interned, reference-counted primitive values
//! - [`Value`]/[`Multifield`] — tagged slot values and flat sequences
//! - [`Arena`]/[`ArenaId`] — slab storage with stable typed indices
//!
//! # Design Principles
//!
//! This crate has **no knowledge of rules, facts, or I/O**. It provides
//! only generic, reusable infrastructure that higher-level crates build
//! upon, so the match network can hold plain indices instead of ownership
//! webs.

pub mod arena;
pub mod intern;
pub mod value;

pub use arena::{Arena, ArenaId};
pub use intern::{
    AtomId, AtomKind, AtomTable, DisplayAtom, EMPTY_SYMBOL, FALSE_ATOM, NIL_ATOM, TRUE_ATOM,
};
pub use value::{
    compare_values, deinstall_value, install_value, DisplayValue, Handle, HandleKind, Multifield,
    Value,
};
