//! Expression trees and their evaluator.
//!
//! Everything the engine needs to compute at match or firing time is an
//! [`Expr`]: alpha-network residual tests, join residual tests, test-CE
//! conditions, dynamic salience, dynamic slot defaults, and RHS action
//! arguments. Variable references have already been rewritten by the rule
//! compiler into [`FetchDesc`] descriptors that read from a partial match,
//! so evaluation needs no name environment.
//!
//! Evaluation is exception-free: every path returns
//! `Result<Value, EvalError>`. Host functions plug in through
//! [`ExternalDispatch`]; binding contexts plug in through [`Bindings`],
//! which the kernel implements for partial matches (consulting basis
//! snapshots while a join operation is in progress).

use crate::template::SlotId;
use cascara_base::{AtomId, AtomTable, Multifield, Value, FALSE_ATOM, TRUE_ATOM};
use std::fmt;

/// Which part of a matched slot a fetch reads.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FieldRef {
    /// The whole slot value.
    Slot,
    /// One item of a segmented field chain: `chain` selects the slot's
    /// marker set within the pattern, `item` the chain position. Reads
    /// an atom for single-field items, a multifield span otherwise.
    Item { chain: u16, item: u16, multi: bool },
    /// The matched entity's own address (pattern-address variables);
    /// the slot component is ignored.
    Entity,
}

/// A compiled variable reference: pattern position, slot, field part.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct FetchDesc {
    /// Absolute pattern position within the rule's LHS.
    pub pattern: u16,
    pub slot: SlotId,
    pub which: FieldRef,
}

/// Comparison operators.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CmpOp {
    Eq,
    Neq,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Arithmetic operators with integer/float promotion.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
}

/// A compiled expression.
#[derive(Clone, PartialEq, Debug)]
pub enum Expr {
    Const(Value),
    /// Read a bound variable out of the partial match.
    Fetch(FetchDesc),
    /// Read an RHS-local binding created by a `bind` action.
    Local(u16),
    /// Read a named engine global.
    Global(AtomId),
    Not(Box<Expr>),
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Cmp(CmpOp, Box<Expr>, Box<Expr>),
    Arith(ArithOp, Box<Expr>, Box<Expr>),
    /// Length of a multifield operand.
    Length(Box<Expr>),
    /// Host function call through [`ExternalDispatch`].
    Call { name: AtomId, args: Vec<Expr> },
}

impl Expr {
    pub fn integer(atoms: &mut AtomTable, n: i64) -> Expr {
        Expr::Const(Value::Atom(atoms.integer(n)))
    }

    pub fn symbol(atoms: &mut AtomTable, text: &str) -> Expr {
        Expr::Const(Value::Atom(atoms.intern_symbol(text)))
    }

    /// Every atom this expression references, for install bookkeeping.
    pub fn each_atom(&self, f: &mut impl FnMut(AtomId)) {
        match self {
            Expr::Const(Value::Atom(id)) => f(*id),
            Expr::Const(Value::Multi(mf)) => {
                for atom in mf.iter() {
                    f(atom);
                }
            }
            Expr::Const(Value::Handle(_)) | Expr::Fetch(_) | Expr::Local(_) => {}
            Expr::Global(name) => f(*name),
            Expr::Not(inner) | Expr::Length(inner) => inner.each_atom(f),
            Expr::And(items) | Expr::Or(items) => {
                for item in items {
                    item.each_atom(f);
                }
            }
            Expr::Cmp(_, a, b) | Expr::Arith(_, a, b) => {
                a.each_atom(f);
                b.each_atom(f);
            }
            Expr::Call { name, args } => {
                f(*name);
                for arg in args {
                    arg.each_atom(f);
                }
            }
        }
    }
}

/// Evaluation failures.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum EvalError {
    /// A fetch or local read had no value to produce.
    UnboundVariable,
    NoSuchGlobal(String),
    TypeMismatch { operation: &'static str },
    DivideByZero,
    UnknownFunction(String),
    /// A host function reported failure.
    External(String),
}

impl fmt::Display for EvalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvalError::UnboundVariable => write!(f, "variable is unbound in this context"),
            EvalError::NoSuchGlobal(name) => write!(f, "global '{}' is not defined", name),
            EvalError::TypeMismatch { operation } => {
                write!(f, "operand type mismatch for '{}'", operation)
            }
            EvalError::DivideByZero => write!(f, "division by zero"),
            EvalError::UnknownFunction(name) => write!(f, "function '{}' is not defined", name),
            EvalError::External(message) => write!(f, "external function failed: {}", message),
        }
    }
}

impl std::error::Error for EvalError {}

/// Alias for expression evaluation results.
pub type EvalResult = Result<Value, EvalError>;

/// Where fetches, locals, and globals read from.
pub trait Bindings {
    /// Reads a bound variable; `None` when the descriptor has no value
    /// in this context.
    fn fetch(&self, desc: &FetchDesc) -> Option<Value>;

    fn local(&self, _index: u16) -> Option<Value> {
        None
    }

    fn global(&self, _name: AtomId) -> Option<Value> {
        None
    }
}

/// A context with no bindings at all (salience at definition, defaults).
pub struct EmptyBindings;

impl Bindings for EmptyBindings {
    fn fetch(&self, _desc: &FetchDesc) -> Option<Value> {
        None
    }
}

/// Host-provided function dispatch.
pub trait ExternalDispatch {
    fn call(&mut self, atoms: &mut AtomTable, name: &str, args: &[Value]) -> EvalResult;
}

/// A dispatcher that knows no functions.
pub struct NoExternals;

impl ExternalDispatch for NoExternals {
    fn call(&mut self, _atoms: &mut AtomTable, name: &str, _args: &[Value]) -> EvalResult {
        Err(EvalError::UnknownFunction(name.to_string()))
    }
}

/// Everything except the symbol `FALSE` counts as true.
pub fn is_truthy(value: &Value) -> bool {
    !matches!(value, Value::Atom(id) if *id == FALSE_ATOM)
}

/// Numeric-aware equality: two numeric atoms compare by value, anything
/// else compares structurally (interned identity for atoms).
pub fn values_equal(atoms: &AtomTable, a: &Value, b: &Value) -> bool {
    if let (Value::Atom(x), Value::Atom(y)) = (a, b) {
        if let (Some(nx), Some(ny)) = (atoms.numeric(*x), atoms.numeric(*y)) {
            return nx == ny;
        }
    }
    a == b
}

/// Evaluates an expression.
pub fn eval(
    expr: &Expr,
    atoms: &mut AtomTable,
    bindings: &dyn Bindings,
    externals: &mut dyn ExternalDispatch,
) -> EvalResult {
    match expr {
        Expr::Const(value) => Ok(value.clone()),
        Expr::Fetch(desc) => bindings.fetch(desc).ok_or(EvalError::UnboundVariable),
        Expr::Local(index) => bindings.local(*index).ok_or(EvalError::UnboundVariable),
        Expr::Global(name) => bindings.global(*name).ok_or_else(|| {
            EvalError::NoSuchGlobal(atoms.text(*name).unwrap_or_default().to_string())
        }),
        Expr::Not(inner) => {
            let v = eval(inner, atoms, bindings, externals)?;
            Ok(Value::Atom(if is_truthy(&v) { FALSE_ATOM } else { TRUE_ATOM }))
        }
        Expr::And(items) => {
            for item in items {
                let v = eval(item, atoms, bindings, externals)?;
                if !is_truthy(&v) {
                    return Ok(Value::Atom(FALSE_ATOM));
                }
            }
            Ok(Value::Atom(TRUE_ATOM))
        }
        Expr::Or(items) => {
            for item in items {
                let v = eval(item, atoms, bindings, externals)?;
                if is_truthy(&v) {
                    return Ok(Value::Atom(TRUE_ATOM));
                }
            }
            Ok(Value::Atom(FALSE_ATOM))
        }
        Expr::Cmp(op, lhs, rhs) => {
            let a = eval(lhs, atoms, bindings, externals)?;
            let b = eval(rhs, atoms, bindings, externals)?;
            eval_cmp(*op, atoms, &a, &b)
        }
        Expr::Arith(op, lhs, rhs) => {
            let a = eval(lhs, atoms, bindings, externals)?;
            let b = eval(rhs, atoms, bindings, externals)?;
            eval_arith(*op, atoms, &a, &b)
        }
        Expr::Length(inner) => {
            let v = eval(inner, atoms, bindings, externals)?;
            match v {
                Value::Multi(mf) => Ok(Value::Atom(atoms.integer(mf.len() as i64))),
                _ => Err(EvalError::TypeMismatch { operation: "length" }),
            }
        }
        Expr::Call { name, args } => {
            let mut evaluated = Vec::with_capacity(args.len());
            for arg in args {
                evaluated.push(eval(arg, atoms, bindings, externals)?);
            }
            let text = atoms
                .text(*name)
                .unwrap_or_default()
                .to_string();
            externals.call(atoms, &text, &evaluated)
        }
    }
}

fn eval_cmp(op: CmpOp, atoms: &mut AtomTable, a: &Value, b: &Value) -> EvalResult {
    let result = match op {
        CmpOp::Eq => values_equal(atoms, a, b),
        CmpOp::Neq => !values_equal(atoms, a, b),
        CmpOp::Lt | CmpOp::Le | CmpOp::Gt | CmpOp::Ge => {
            let (x, y) = numeric_pair(atoms, a, b, "compare")?;
            match op {
                CmpOp::Lt => x < y,
                CmpOp::Le => x <= y,
                CmpOp::Gt => x > y,
                CmpOp::Ge => x >= y,
                _ => unreachable!(),
            }
        }
    };
    Ok(Value::Atom(if result { TRUE_ATOM } else { FALSE_ATOM }))
}

fn eval_arith(op: ArithOp, atoms: &mut AtomTable, a: &Value, b: &Value) -> EvalResult {
    let ints = both_integers(atoms, a, b);
    match op {
        ArithOp::Add | ArithOp::Sub | ArithOp::Mul => {
            if let Some((x, y)) = ints {
                let n = match op {
                    ArithOp::Add => x.wrapping_add(y),
                    ArithOp::Sub => x.wrapping_sub(y),
                    ArithOp::Mul => x.wrapping_mul(y),
                    ArithOp::Div => unreachable!(),
                };
                Ok(Value::Atom(atoms.integer(n)))
            } else {
                let (x, y) = numeric_pair(atoms, a, b, "arithmetic")?;
                let n = match op {
                    ArithOp::Add => x + y,
                    ArithOp::Sub => x - y,
                    ArithOp::Mul => x * y,
                    ArithOp::Div => unreachable!(),
                };
                Ok(Value::Atom(atoms.float(n)))
            }
        }
        ArithOp::Div => {
            if let Some((x, y)) = ints {
                if y == 0 {
                    return Err(EvalError::DivideByZero);
                }
                if x % y == 0 {
                    return Ok(Value::Atom(atoms.integer(x / y)));
                }
            }
            let (x, y) = numeric_pair(atoms, a, b, "arithmetic")?;
            if y == 0.0 {
                return Err(EvalError::DivideByZero);
            }
            Ok(Value::Atom(atoms.float(x / y)))
        }
    }
}

fn both_integers(atoms: &AtomTable, a: &Value, b: &Value) -> Option<(i64, i64)> {
    match (a, b) {
        (Value::Atom(x), Value::Atom(y)) => {
            Some((atoms.as_integer(*x)?, atoms.as_integer(*y)?))
        }
        _ => None,
    }
}

fn numeric_pair(
    atoms: &AtomTable,
    a: &Value,
    b: &Value,
    operation: &'static str,
) -> Result<(f64, f64), EvalError> {
    let x = a
        .as_atom()
        .and_then(|id| atoms.numeric(id))
        .ok_or(EvalError::TypeMismatch { operation })?;
    let y = b
        .as_atom()
        .and_then(|id| atoms.numeric(id))
        .ok_or(EvalError::TypeMismatch { operation })?;
    Ok((x, y))
}

/// Builds a multifield by flattening atom and multifield values.
///
/// Handles cannot be spliced into a multifield; the caller reports this
/// against the originating slot.
pub fn flatten_to_multifield(values: &[Value]) -> Option<Multifield> {
    let mut atoms_out = Vec::new();
    for value in values {
        match value {
            Value::Atom(id) => atoms_out.push(*id),
            Value::Multi(mf) => atoms_out.extend(mf.iter()),
            Value::Handle(_) => return None,
        }
    }
    Some(Multifield::from_atoms(atoms_out))
}
