//! The router: named text sinks for everything the engine prints.
//!
//! The engine never writes to stdout directly. Every trace, error, and
//! dialog line goes to a logical route name; the host decides which
//! physical sink each name reaches. Four names are wired by default:
//!
//! | route | default sink |
//! |-------|--------------|
//! | `werror` | stderr |
//! | `wtrace` | stdout |
//! | `wdialog` | stdout |
//! | `wdisplay` | stdout |

use rustc_hash::FxHashMap;
use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;

pub const WERROR: &str = "werror";
pub const WTRACE: &str = "wtrace";
pub const WDIALOG: &str = "wdialog";
pub const WDISPLAY: &str = "wdisplay";

/// A physical text destination.
pub trait RouterSink {
    fn write(&mut self, text: &str);
}

/// Stdout, line-buffered by the standard library.
pub struct StdoutSink;

impl RouterSink for StdoutSink {
    fn write(&mut self, text: &str) {
        let _ = std::io::stdout().write_all(text.as_bytes());
    }
}

pub struct StderrSink;

impl RouterSink for StderrSink {
    fn write(&mut self, text: &str) {
        let _ = std::io::stderr().write_all(text.as_bytes());
    }
}

/// An in-memory sink sharing its buffer with the host; handy for tests
/// and embedders that surface engine output in their own UI.
#[derive(Clone, Default)]
pub struct BufferSink {
    buffer: Rc<RefCell<String>>,
}

impl BufferSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> String {
        self.buffer.borrow().clone()
    }

    pub fn clear(&self) {
        self.buffer.borrow_mut().clear();
    }
}

impl RouterSink for BufferSink {
    fn write(&mut self, text: &str) {
        self.buffer.borrow_mut().push_str(text);
    }
}

/// Routes logical names to sinks.
pub struct Router {
    sinks: Vec<Box<dyn RouterSink>>,
    routes: FxHashMap<String, usize>,
}

impl Router {
    /// A router with the standard four routes wired to stdout/stderr.
    pub fn new() -> Self {
        let mut router = Router {
            sinks: Vec::new(),
            routes: FxHashMap::default(),
        };
        let out = router.add_sink(Box::new(StdoutSink));
        let err = router.add_sink(Box::new(StderrSink));
        router.route(WDISPLAY, out);
        router.route(WDIALOG, out);
        router.route(WTRACE, out);
        router.route(WERROR, err);
        router
    }

    /// Registers a sink and returns its handle for routing.
    pub fn add_sink(&mut self, sink: Box<dyn RouterSink>) -> usize {
        self.sinks.push(sink);
        self.sinks.len() - 1
    }

    /// Points a logical route at a sink.
    pub fn route(&mut self, name: &str, sink: usize) {
        self.routes.insert(name.to_string(), sink);
    }

    /// Writes to a route; unrouted names are dropped silently.
    pub fn print(&mut self, route: &str, text: &str) {
        if let Some(&idx) = self.routes.get(route) {
            self.sinks[idx].write(text);
        }
    }

    pub fn println(&mut self, route: &str, text: &str) {
        self.print(route, text);
        self.print(route, "\n");
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}
