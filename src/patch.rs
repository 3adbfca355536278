//! Interception of allocator entry points imported by foreign modules.
//!
//! A module is anything exposing an [`ImportTable`]: a set of rebindable
//! slots through which its code reaches imported functions. Patching stores
//! the replacement thunk in the slot and remembers the original so the thunk
//! can forward to it and the binding can be restored later.

#[cfg(unix)]
pub mod crt;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::error::{Error, Result};

/// One interceptable import.
#[derive(Debug)]
pub struct ModulePatchEntry {
    /// Module exporting the function, as named by the importer.
    pub export_module: &'static str,
    pub symbol: &'static str,
    /// Where the original function is recorded. Read by the replacement.
    pub original: &'static AtomicUsize,
    /// Address of the replacement, with the same signature as the original.
    pub replacement: usize,
}

impl ModulePatchEntry {
    pub fn new(
        export_module: &'static str,
        symbol: &'static str,
        original: &'static AtomicUsize,
        replacement: usize,
    ) -> Self {
        Self {
            export_module,
            symbol,
            original,
            replacement,
        }
    }
}

/// The import bindings of one loaded module.
pub trait ImportTable: Send + Sync {
    /// Name of the module, unique among loaded modules.
    fn name(&self) -> &str;

    /// Slot holding the current target of `symbol` imported from
    /// `export_module`, or `None` when the module does not import it.
    fn binding(&self, export_module: &str, symbol: &str) -> Option<&AtomicUsize>;
}

/// An in-memory import table.
///
/// Code of the module calls imports through [`ModuleImports::target`], so a
/// rebinding is visible to the next call on any thread.
#[derive(Debug, Default)]
pub struct ModuleImports {
    name: String,
    imports: Vec<Import>,
}

#[derive(Debug)]
struct Import {
    export_module: String,
    symbol: String,
    slot: AtomicUsize,
}

impl ModuleImports {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            imports: Vec::new(),
        }
    }

    /// Adds an import of `symbol` from `export_module` currently bound to `address`.
    pub fn with_import(
        mut self,
        export_module: impl Into<String>,
        symbol: impl Into<String>,
        address: usize,
    ) -> Self {
        self.imports.push(Import {
            export_module: export_module.into(),
            symbol: symbol.into(),
            slot: AtomicUsize::new(address),
        });
        self
    }

    /// Current target of an import.
    pub fn target(&self, export_module: &str, symbol: &str) -> Option<usize> {
        self.binding(export_module, symbol)
            .map(|slot| slot.load(Ordering::Acquire))
    }
}

impl ImportTable for ModuleImports {
    fn name(&self) -> &str {
        &self.name
    }

    fn binding(&self, export_module: &str, symbol: &str) -> Option<&AtomicUsize> {
        self.imports
            .iter()
            .find(|import| import.export_module == export_module && import.symbol == symbol)
            .map(|import| &import.slot)
    }
}

/// Notification from the host's module loader.
pub enum ModuleEvent {
    Loaded(Arc<dyn ImportTable>),
    Unloaded(String),
}

struct PatchedModule {
    module: Arc<dyn ImportTable>,
    /// `(entry index, binding before patching)`
    restores: Vec<(usize, usize)>,
}

/// Installs and removes the patch table over modules.
///
/// Patching and restoring are serialized under one lock; calls through the
/// patched slots never take it.
pub struct Interceptor {
    entries: Vec<ModulePatchEntry>,
    ignored: Vec<String>,
    patched: Mutex<Vec<PatchedModule>>,
}

impl Interceptor {
    pub fn new(entries: Vec<ModulePatchEntry>, ignored: Vec<String>) -> Self {
        Self {
            entries,
            ignored,
            patched: Mutex::new(Vec::new()),
        }
    }

    pub fn entries(&self) -> &[ModulePatchEntry] {
        &self.entries
    }

    /// Rebinds every import of `module` matching the patch table.
    ///
    /// Returns the number of imports patched; `0` when the module uses none
    /// of the intercepted functions or is already patched.
    pub fn patch_module(&self, module: Arc<dyn ImportTable>) -> Result<usize> {
        let name = module.name().to_string();
        if self.ignored.iter().any(|ignored| *ignored == name) {
            return Err(Error::ModuleIgnored(name));
        }

        let mut patched = self.patched.lock();
        if patched.iter().any(|p| p.module.name() == name) {
            return Ok(0);
        }

        let mut restores = Vec::new();
        for (index, entry) in self.entries.iter().enumerate() {
            match patch_import(module.as_ref(), entry) {
                Ok(Some(previous)) => restores.push((index, previous)),
                Ok(None) => {}
                Err(err) => tracing::trace!("{err}"),
            }
        }

        let count = restores.len();
        if count > 0 {
            tracing::debug!(module = %name, imports = count, "module patched");
            patched.push(PatchedModule { module, restores });
        }
        Ok(count)
    }

    /// Restores the original bindings of a module. Does nothing if it is not patched.
    pub fn restore_module(&self, name: &str) -> bool {
        let mut patched = self.patched.lock();
        let Some(position) = patched.iter().position(|p| p.module.name() == name) else {
            return false;
        };
        let module = patched.swap_remove(position);
        self.restore(&module);
        true
    }

    /// Restores every patched module.
    pub fn restore_all(&self) {
        let mut patched = self.patched.lock();
        for module in patched.drain(..) {
            self.restore(&module);
        }
    }

    pub fn is_patched(&self, name: &str) -> bool {
        self.patched.lock().iter().any(|p| p.module.name() == name)
    }

    /// Names of the currently patched modules.
    pub fn patched_modules(&self) -> Vec<String> {
        self.patched
            .lock()
            .iter()
            .map(|p| p.module.name().to_string())
            .collect()
    }

    /// Patches arriving modules and restores departing ones.
    pub fn handle(&self, event: ModuleEvent) {
        match event {
            ModuleEvent::Loaded(module) => {
                if let Err(err) = self.patch_module(module) {
                    tracing::debug!("module not patched: {err}");
                }
            }
            ModuleEvent::Unloaded(name) => {
                self.restore_module(&name);
            }
        }
    }

    fn restore(&self, patched: &PatchedModule) {
        for &(index, previous) in &patched.restores {
            let entry = &self.entries[index];
            if let Some(slot) = patched.module.binding(entry.export_module, entry.symbol) {
                // someone else may have rebound the slot since; leave theirs alone
                let _ = slot.compare_exchange(
                    entry.replacement,
                    previous,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
            }
        }
        tracing::debug!(module = %patched.module.name(), "module restored");
    }
}

/// Points one import at its replacement, returning the previous binding.
///
/// `Ok(None)` means the import already resolves to the replacement.
fn patch_import(module: &dyn ImportTable, entry: &ModulePatchEntry) -> Result<Option<usize>> {
    let slot = module
        .binding(entry.export_module, entry.symbol)
        .ok_or_else(|| Error::ImportNotFound {
            module: module.name().to_string(),
            symbol: entry.symbol,
        })?;

    let current = slot.load(Ordering::Acquire);
    if current == entry.replacement {
        return Ok(None);
    }
    // the first original seen is the one the replacement forwards to
    let _ = entry
        .original
        .compare_exchange(0, current, Ordering::AcqRel, Ordering::Acquire);
    slot.store(entry.replacement, Ordering::Release);
    Ok(Some(current))
}
