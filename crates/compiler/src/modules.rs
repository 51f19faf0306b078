//! Module registry
//!
//! A module is a single source file. The registry records every
//! module's top-level bindings with their visibility, plus its imports,
//! keyed by module name. Both the type checker (name resolution) and
//! the visibility checker (access validation) read it; they never read
//! each other's state, keeping the two regimes independent.

use crate::ast::{ImportFilter, Visibility};
use crate::types::{ClassId, EnumId, TypeId};
use limit_core::source::FileId;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingKind {
    Var,
    Fn,
    Class(ClassId),
    Enum(EnumId),
    TypeAlias,
}

#[derive(Debug, Clone)]
pub struct ModuleBinding {
    pub vis: Visibility,
    pub kind: BindingKind,
    pub ty: TypeId,
}

#[derive(Debug, Clone)]
pub struct ImportedModule {
    pub target: String,
    pub alias: Option<String>,
    pub filter: Option<ImportFilter>,
}

#[derive(Debug)]
pub struct ModuleInfo {
    pub name: String,
    pub file: FileId,
    pub bindings: HashMap<String, ModuleBinding>,
    pub imports: Vec<ImportedModule>,
}

impl ModuleInfo {
    /// Resolve a name used inside this module to the imported module it
    /// refers to, honoring aliases
    pub fn imported_module(&self, name: &str) -> Option<&ImportedModule> {
        self.imports.iter().find(|import| {
            match &import.alias {
                Some(alias) => alias == name,
                None => import.target == name,
            }
        })
    }

    /// Does this module's import of `name` allow seeing `member`?
    /// (show/hide filters; unrelated to visibility)
    pub fn import_allows(&self, import: &ImportedModule, member: &str) -> bool {
        match &import.filter {
            None => true,
            Some(ImportFilter::Show(names)) => names.iter().any(|n| n == member),
            Some(ImportFilter::Hide(names)) => !names.iter().any(|n| n == member),
        }
    }
}

#[derive(Debug, Default)]
pub struct ModuleRegistry {
    modules: Vec<ModuleInfo>,
    by_name: HashMap<String, usize>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        ModuleRegistry::default()
    }

    pub fn declare(&mut self, name: &str, file: FileId) {
        if self.by_name.contains_key(name) {
            return;
        }
        self.by_name.insert(name.to_string(), self.modules.len());
        self.modules.push(ModuleInfo {
            name: name.to_string(),
            file,
            bindings: HashMap::new(),
            imports: Vec::new(),
        });
    }

    pub fn get(&self, name: &str) -> Option<&ModuleInfo> {
        self.by_name.get(name).map(|i| &self.modules[*i])
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut ModuleInfo> {
        let index = *self.by_name.get(name)?;
        Some(&mut self.modules[index])
    }

    pub fn binding(&self, module: &str, name: &str) -> Option<&ModuleBinding> {
        self.get(module)?.bindings.get(name)
    }

    pub fn modules(&self) -> impl Iterator<Item = &ModuleInfo> {
        self.modules.iter()
    }
}
