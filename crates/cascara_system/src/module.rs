//! Modules: namespaces with per-module agendas.
//!
//! Every engine starts with `MAIN`. A module sees its own constructs
//! plus those of the modules it imports (when they export); the focus
//! stack in the engine decides whose agenda fires next.

use cascara_base::AtomId;
use cascara_data::ModuleId;
use rustc_hash::FxHashMap;

#[derive(Debug)]
pub struct Module {
    pub name: AtomId,
    pub imports: Vec<ModuleId>,
    /// Whether this module's constructs are visible to importers.
    pub exports: bool,
}

pub struct ModuleRegistry {
    modules: Vec<Module>,
    by_name: FxHashMap<AtomId, ModuleId>,
}

impl ModuleRegistry {
    /// A registry holding only `MAIN`.
    pub fn new(main_name: AtomId) -> Self {
        let mut registry = ModuleRegistry {
            modules: Vec::new(),
            by_name: FxHashMap::default(),
        };
        registry.modules.push(Module {
            name: main_name,
            imports: Vec::new(),
            exports: true,
        });
        registry.by_name.insert(main_name, ModuleId(0));
        registry
    }

    pub fn define(&mut self, name: AtomId, imports: Vec<ModuleId>) -> Option<ModuleId> {
        if self.by_name.contains_key(&name) {
            return None;
        }
        let id = ModuleId(self.modules.len() as u16);
        self.modules.push(Module {
            name,
            imports,
            exports: true,
        });
        self.by_name.insert(name, id);
        Some(id)
    }

    pub fn by_name(&self, name: AtomId) -> Option<ModuleId> {
        self.by_name.get(&name).copied()
    }

    pub fn get(&self, id: ModuleId) -> &Module {
        &self.modules[id.0 as usize]
    }

    pub fn count(&self) -> usize {
        self.modules.len()
    }

    /// The modules whose constructs `from` can see: itself first, then
    /// exporting imports in declaration order.
    pub fn visible_from(&self, from: ModuleId) -> Vec<ModuleId> {
        let mut out = vec![from];
        for &import in &self.get(from).imports {
            if self.get(import).exports {
                out.push(import);
            }
        }
        out
    }
}
