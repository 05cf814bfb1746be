//! The rule AST the frontend hands to the compiler.
//!
//! The surface syntax is someone else's problem: whatever parses rule
//! text is expected to produce this tree. Literals are plain Rust values
//! (interned during compilation), variables are names, and slot/template
//! references are names resolved against the working memory's schemas at
//! install time.
//!
//! Builder methods keep hand-construction terse, since embedders and
//! tests assemble rules programmatically:
//!
//! ```
//! use cascara_compile::ast::*;
//!
//! let rule = RuleDef::new("grandparent")
//!     .pattern(Pattern::ordered("parent", vec![field_var("p"), field_var("c")]))
//!     .pattern(Pattern::ordered("parent", vec![field_var("c"), field_var("g")]))
//!     .action(RhsAction::assert_ordered(
//!         "grandparent",
//!         vec![PatternExpr::var("p"), PatternExpr::var("g")],
//!     ));
//! ```

use cascara_data::{ArithOp, CmpOp, TypeMask};

/// A source-level literal, interned at compile time.
#[derive(Clone, PartialEq, Debug)]
pub enum Literal {
    Int(i64),
    Float(f64),
    Symbol(String),
    Str(String),
    InstanceName(String),
}

impl Literal {
    pub fn sym(text: &str) -> Literal {
        Literal::Symbol(text.to_string())
    }
}

/// An expression over named variables, globals, and literals.
#[derive(Clone, PartialEq, Debug)]
pub enum PatternExpr {
    Lit(Literal),
    /// `?x` or `$?xs` (the binding decides which).
    Var(String),
    /// `?*name*` engine global.
    Global(String),
    Not(Box<PatternExpr>),
    And(Vec<PatternExpr>),
    Or(Vec<PatternExpr>),
    Cmp(CmpOp, Box<PatternExpr>, Box<PatternExpr>),
    Arith(ArithOp, Box<PatternExpr>, Box<PatternExpr>),
    Length(Box<PatternExpr>),
    Call { name: String, args: Vec<PatternExpr> },
}

impl PatternExpr {
    pub fn var(name: &str) -> PatternExpr {
        PatternExpr::Var(name.to_string())
    }

    pub fn int(n: i64) -> PatternExpr {
        PatternExpr::Lit(Literal::Int(n))
    }

    pub fn sym(text: &str) -> PatternExpr {
        PatternExpr::Lit(Literal::sym(text))
    }

    pub fn add(a: PatternExpr, b: PatternExpr) -> PatternExpr {
        PatternExpr::Arith(ArithOp::Add, Box::new(a), Box::new(b))
    }

    pub fn cmp(op: CmpOp, a: PatternExpr, b: PatternExpr) -> PatternExpr {
        PatternExpr::Cmp(op, Box::new(a), Box::new(b))
    }
}

/// What one field position binds or requires.
#[derive(Clone, PartialEq, Debug)]
pub enum FieldBinding {
    /// `?x`
    Var(String),
    /// `$?xs`
    MultiVar(String),
    /// `?`
    Wildcard,
    /// `$?`
    MultiWildcard,
    /// A literal constant.
    Literal(Literal),
}

/// One field position of a pattern slot.
#[derive(Clone, PartialEq, Debug)]
pub struct FieldPattern {
    pub binding: FieldBinding,
    /// `~value` exclusions and-ed onto the binding.
    pub not_values: Vec<Literal>,
    /// Allowed primitive tags, when the frontend restricts them.
    pub types: Option<TypeMask>,
    /// `&:(expr)` predicate constraints.
    pub tests: Vec<PatternExpr>,
}

/// `?x`
pub fn field_var(name: &str) -> FieldPattern {
    FieldPattern {
        binding: FieldBinding::Var(name.to_string()),
        not_values: Vec::new(),
        types: None,
        tests: Vec::new(),
    }
}

/// `$?xs`
pub fn field_multi_var(name: &str) -> FieldPattern {
    FieldPattern {
        binding: FieldBinding::MultiVar(name.to_string()),
        not_values: Vec::new(),
        types: None,
        tests: Vec::new(),
    }
}

/// A literal constant field.
pub fn field_lit(lit: Literal) -> FieldPattern {
    FieldPattern {
        binding: FieldBinding::Literal(lit),
        not_values: Vec::new(),
        types: None,
        tests: Vec::new(),
    }
}

/// `?` (anonymous single field)
pub fn field_wild() -> FieldPattern {
    FieldPattern {
        binding: FieldBinding::Wildcard,
        not_values: Vec::new(),
        types: None,
        tests: Vec::new(),
    }
}

/// `$?` (anonymous span)
pub fn field_multi_wild() -> FieldPattern {
    FieldPattern {
        binding: FieldBinding::MultiWildcard,
        not_values: Vec::new(),
        types: None,
        tests: Vec::new(),
    }
}

impl FieldPattern {
    pub fn with_test(mut self, test: PatternExpr) -> FieldPattern {
        self.tests.push(test);
        self
    }

    pub fn excluding(mut self, lit: Literal) -> FieldPattern {
        self.not_values.push(lit);
        self
    }
}

/// One slot of a pattern. Single-field slots carry exactly one field
/// pattern; multifield slots carry a field chain.
#[derive(Clone, PartialEq, Debug)]
pub struct SlotPattern {
    pub slot: String,
    pub fields: Vec<FieldPattern>,
}

/// What the pattern matches against.
#[derive(Clone, PartialEq, Debug)]
pub enum TargetRef {
    Template(String),
    Class(String),
}

/// A pattern conditional element.
#[derive(Clone, PartialEq, Debug)]
pub struct Pattern {
    pub target: TargetRef,
    /// `?f <- (pattern)` fact-address binding.
    pub address_var: Option<String>,
    pub slots: Vec<SlotPattern>,
}

impl Pattern {
    pub fn new(template: &str) -> Pattern {
        Pattern {
            target: TargetRef::Template(template.to_string()),
            address_var: None,
            slots: Vec::new(),
        }
    }

    pub fn of_class(class: &str) -> Pattern {
        Pattern {
            target: TargetRef::Class(class.to_string()),
            address_var: None,
            slots: Vec::new(),
        }
    }

    /// An ordered-fact pattern: the implied multifield slot gets the
    /// whole field chain.
    pub fn ordered(template: &str, fields: Vec<FieldPattern>) -> Pattern {
        Pattern {
            target: TargetRef::Template(template.to_string()),
            address_var: None,
            slots: vec![SlotPattern {
                slot: "__fields".to_string(),
                fields,
            }],
        }
    }

    pub fn slot(mut self, name: &str, field: FieldPattern) -> Pattern {
        self.slots.push(SlotPattern {
            slot: name.to_string(),
            fields: vec![field],
        });
        self
    }

    pub fn multi_slot(mut self, name: &str, fields: Vec<FieldPattern>) -> Pattern {
        self.slots.push(SlotPattern {
            slot: name.to_string(),
            fields,
        });
        self
    }

    pub fn bound_to(mut self, var: &str) -> Pattern {
        self.address_var = Some(var.to_string());
        self
    }
}

/// A conditional element of the LHS.
#[derive(Clone, PartialEq, Debug)]
pub enum CondElem {
    Pattern(Pattern),
    /// `(test <expr>)` — attaches to the preceding pattern's join.
    Test(PatternExpr),
    Not(Vec<CondElem>),
    And(Vec<CondElem>),
    Or(Vec<CondElem>),
    Exists(Vec<CondElem>),
    /// `(logical ...)` — everything matched inside supports RHS asserts.
    Logical(Vec<CondElem>),
}

/// A right-hand-side action with named variables.
#[derive(Clone, PartialEq, Debug)]
pub enum RhsAction {
    Assert {
        template: String,
        slots: Vec<(String, Vec<PatternExpr>)>,
    },
    Retract(PatternExpr),
    Modify {
        target: PatternExpr,
        sets: Vec<(String, Vec<PatternExpr>)>,
    },
    Duplicate {
        target: PatternExpr,
        sets: Vec<(String, Vec<PatternExpr>)>,
    },
    Bind { var: String, value: PatternExpr },
    Halt,
    Eval(PatternExpr),
}

impl RhsAction {
    /// Assert an ordered fact: the field list lands in the implied slot.
    pub fn assert_ordered(template: &str, fields: Vec<PatternExpr>) -> RhsAction {
        RhsAction::Assert {
            template: template.to_string(),
            slots: vec![("__fields".to_string(), fields)],
        }
    }

    pub fn assert_slots(template: &str, slots: Vec<(&str, PatternExpr)>) -> RhsAction {
        RhsAction::Assert {
            template: template.to_string(),
            slots: slots
                .into_iter()
                .map(|(name, e)| (name.to_string(), vec![e]))
                .collect(),
        }
    }
}

/// A complete rule definition.
#[derive(Clone, PartialEq, Debug)]
pub struct RuleDef {
    pub name: String,
    pub salience: i32,
    pub dynamic_salience: Option<PatternExpr>,
    pub auto_focus: bool,
    pub lhs: Vec<CondElem>,
    pub rhs: Vec<RhsAction>,
}

impl RuleDef {
    pub fn new(name: &str) -> RuleDef {
        RuleDef {
            name: name.to_string(),
            salience: 0,
            dynamic_salience: None,
            auto_focus: false,
            lhs: Vec::new(),
            rhs: Vec::new(),
        }
    }

    pub fn salience(mut self, salience: i32) -> RuleDef {
        self.salience = salience;
        self
    }

    pub fn auto_focus(mut self) -> RuleDef {
        self.auto_focus = true;
        self
    }

    pub fn pattern(mut self, pattern: Pattern) -> RuleDef {
        self.lhs.push(CondElem::Pattern(pattern));
        self
    }

    pub fn cond(mut self, ce: CondElem) -> RuleDef {
        self.lhs.push(ce);
        self
    }

    pub fn action(mut self, action: RhsAction) -> RuleDef {
        self.rhs.push(action);
        self
    }
}
