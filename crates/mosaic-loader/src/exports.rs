use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// A value stored in an export slot.
pub type ExportValue = Arc<dyn Any + Send + Sync>;

/// A module's export object.
///
/// Shared by identity: every require that resolves to the same module
/// observes the same `Arc<Exports>`, including cyclic requires that run
/// while the owning factory is still executing. A slot that has not been
/// assigned yet reads as `None`.
#[derive(Default)]
pub struct Exports {
    slots: Mutex<BTreeMap<String, ExportValue>>,
}

impl Exports {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, key: impl Into<String>, value: impl Any + Send + Sync) {
        self.slots().insert(key.into(), Arc::new(value));
    }

    /// Store an already-shared value without rewrapping it.
    pub fn set_shared(&self, key: impl Into<String>, value: ExportValue) {
        self.slots().insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<ExportValue> {
        self.slots().get(key).cloned()
    }

    /// Typed read of a slot; `None` when absent or of another type.
    pub fn get_as<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.get(key)?.downcast::<T>().ok()
    }

    pub fn keys(&self) -> Vec<String> {
        self.slots().keys().cloned().collect()
    }

    fn slots(&self) -> MutexGuard<'_, BTreeMap<String, ExportValue>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Exports {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Exports").field("keys", &self.keys()).finish()
    }
}

/// One instantiated module.
///
/// Created on first require, before the factory runs; `loaded` flips to
/// true exactly once, after the factory returns.
pub struct ModuleInstance {
    pub id: String,
    pub exports: Arc<Exports>,
    loaded: AtomicBool,
}

impl ModuleInstance {
    pub(crate) fn new(id: String) -> Arc<Self> {
        Arc::new(Self {
            id,
            exports: Arc::new(Exports::new()),
            loaded: AtomicBool::new(false),
        })
    }

    pub fn loaded(&self) -> bool {
        self.loaded.load(Ordering::Acquire)
    }

    pub(crate) fn mark_loaded(&self) {
        self.loaded.store(true, Ordering::Release);
    }
}

impl fmt::Debug for ModuleInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleInstance")
            .field("id", &self.id)
            .field("loaded", &self.loaded())
            .finish()
    }
}
