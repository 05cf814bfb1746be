//! # cascara-system
//!
//! The execution layer of the cascara rule engine: everything between a
//! completed partial match and an observable effect.
//!
//! - [`Engine`] — the single context object owning every subsystem
//! - [`agenda`] — salience-ordered conflict resolution with pluggable
//!   strategies and structural refraction
//! - [`module`] — namespaces, each with its own agenda
//! - [`router`] — named text sinks for traces, errors, and dialog
//! - [`config`] — strategy, salience evaluation, duplicate and error
//!   policies
//! - [`globals`] — engine-level named values readable from expressions
//!
//! ```
//! use cascara_system::Engine;
//! use cascara_compile::ast::*;
//!
//! let mut engine = Engine::new();
//! let point = engine.define_ordered_template("point").unwrap();
//!
//! engine
//!     .add_rule(
//!         &RuleDef::new("greet")
//!             .pattern(Pattern::ordered("point", vec![field_var("x")]))
//!             .action(RhsAction::Halt),
//!     )
//!     .unwrap();
//!
//! let three = engine.atoms.integer(3);
//! engine.assert_ordered(point, vec![three.into()]).unwrap();
//! assert_eq!(engine.run(None), 1);
//! ```

pub mod agenda;
pub mod config;
pub mod engine;
pub mod globals;
pub mod module;
pub mod router;
pub mod watch;

pub use agenda::{Activation, Agenda};
pub use config::{EngineConfig, ErrorPolicy, SalienceEval, Strategy};
pub use engine::{ActivationSnapshot, Engine, FactSnapshot};
pub use globals::Globals;
pub use module::{Module, ModuleRegistry};
pub use router::{BufferSink, Router, RouterSink, WDIALOG, WDISPLAY, WERROR, WTRACE};
pub use watch::{WatchFlags, WatchItem};
