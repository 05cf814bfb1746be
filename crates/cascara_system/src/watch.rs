//! Watch flags: one-line traces per engine event category.

/// A watchable category.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum WatchItem {
    Facts,
    Rules,
    Activations,
    Compilations,
    Statistics,
}

/// Which categories currently emit traces through the router.
#[derive(Clone, Copy, Default, Debug)]
pub struct WatchFlags {
    pub facts: bool,
    pub rules: bool,
    pub activations: bool,
    pub compilations: bool,
    pub statistics: bool,
}

impl WatchFlags {
    pub fn set(&mut self, item: WatchItem, on: bool) {
        match item {
            WatchItem::Facts => self.facts = on,
            WatchItem::Rules => self.rules = on,
            WatchItem::Activations => self.activations = on,
            WatchItem::Compilations => self.compilations = on,
            WatchItem::Statistics => self.statistics = on,
        }
    }

    pub fn set_all(&mut self, on: bool) {
        for item in [
            WatchItem::Facts,
            WatchItem::Rules,
            WatchItem::Activations,
            WatchItem::Compilations,
            WatchItem::Statistics,
        ] {
            self.set(item, on);
        }
    }
}
