//! Analysis errors raised during rule installation.
//!
//! Every error here aborts the install and leaves the engine unchanged:
//! nothing is attached to the network until the whole rule has analyzed
//! cleanly.

use std::fmt;

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum AnalysisError {
    /// A variable is used on the RHS or in a test without a binding
    /// occurrence on the LHS.
    UnboundVariable(String),
    /// A variable bound inside a not/exists group is referenced outside
    /// that group's scope.
    CrossScopeVariable(String),
    /// One name is used both as a single-field and a multifield
    /// variable.
    MixedCardinality(String),
    /// Two patterns bind the same fact-address variable, or an address
    /// variable collides with a field variable.
    DuplicatePatternVariable(String),
    /// Constraint intersection for a variable came out unsatisfiable.
    UnmatchableConstraint { variable: String },
    /// A type restriction allows nothing the slot did not already allow.
    RedundantTypeRestriction { slot: String },
    /// A literal restriction violates the slot's declared constraints.
    LiteralConstraintViolation { slot: String },
    /// A test CE references a variable bound by a later pattern.
    UseBeforeBind(String),
    NoSuchTemplate(String),
    NoSuchClass(String),
    NoSuchSlot { target: String, slot: String },
    /// A single-field slot was given a multifield binding or a chain.
    SlotCardinality { slot: String },
    /// `or` may not appear under not/exists/logical.
    OrInsideGroup,
    /// Logical groups must precede every other conditional element.
    LogicalOutOfOrder,
    /// A rule needs at least one pattern CE.
    EmptyLhs,
    /// Modify/duplicate need a fact-address variable bound to a
    /// template pattern.
    BadModifyTarget,
    /// A rule with this name already exists in the module.
    DuplicateRuleName(String),
}

impl fmt::Display for AnalysisError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnalysisError::UnboundVariable(name) => {
                write!(f, "variable ?{} is used before it is bound", name)
            }
            AnalysisError::CrossScopeVariable(name) => {
                write!(
                    f,
                    "variable ?{} is bound inside a not/exists group and cannot be referenced outside it",
                    name
                )
            }
            AnalysisError::MixedCardinality(name) => {
                write!(
                    f,
                    "variable ?{} is used as both a single-field and a multifield variable",
                    name
                )
            }
            AnalysisError::DuplicatePatternVariable(name) => {
                write!(f, "pattern-address variable ?{} is bound more than once", name)
            }
            AnalysisError::UnmatchableConstraint { variable } => {
                write!(
                    f,
                    "the constraints on variable ?{} cannot be satisfied by any value",
                    variable
                )
            }
            AnalysisError::RedundantTypeRestriction { slot } => {
                write!(
                    f,
                    "the type restriction on slot '{}' excludes nothing the slot allows",
                    slot
                )
            }
            AnalysisError::LiteralConstraintViolation { slot } => {
                write!(f, "a literal restriction violates the constraints of slot '{}'", slot)
            }
            AnalysisError::UseBeforeBind(name) => {
                write!(f, "test expression references ?{} before any pattern binds it", name)
            }
            AnalysisError::NoSuchTemplate(name) => {
                write!(f, "template '{}' is not defined", name)
            }
            AnalysisError::NoSuchClass(name) => write!(f, "class '{}' is not defined", name),
            AnalysisError::NoSuchSlot { target, slot } => {
                write!(f, "'{}' has no slot named '{}'", target, slot)
            }
            AnalysisError::SlotCardinality { slot } => {
                write!(f, "slot '{}' cannot hold the given field pattern", slot)
            }
            AnalysisError::OrInsideGroup => {
                write!(f, "an 'or' conditional element cannot appear inside not/exists/logical")
            }
            AnalysisError::LogicalOutOfOrder => {
                write!(f, "logical conditional elements must precede all others")
            }
            AnalysisError::EmptyLhs => write!(f, "a rule needs at least one pattern"),
            AnalysisError::BadModifyTarget => {
                write!(f, "modify/duplicate require a fact-address variable from a template pattern")
            }
            AnalysisError::DuplicateRuleName(name) => {
                write!(f, "a rule named '{}' already exists", name)
            }
        }
    }
}

impl std::error::Error for AnalysisError {}

pub type AnalysisResult<T> = Result<T, AnalysisError>;
