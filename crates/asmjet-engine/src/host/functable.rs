//! Host function table: the process-wide funcid registry.
//!
//! Compiled functions are installed behind opaque numeric handles. The
//! runner dispatches on those handles; the backend only reserves, installs,
//! replaces, aliases and frees them. This in-memory registry stores the
//! source text per handle so tests can inspect what was installed.

use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::AssembleError;

/// Opaque handle into the host's compiled-function table.
pub type FuncId = u32;

/// Mutex-protected registry of compiled function sources.
pub struct FuncTable {
    inner: Mutex<TableInner>,
}

struct TableInner {
    next_id: FuncId,
    free_ids: Vec<FuncId>,
    sources: FxHashMap<FuncId, Arc<str>>,
}

impl FuncTable {
    pub fn new() -> Self {
        FuncTable {
            inner: Mutex::new(TableInner {
                // Id 0 is never handed out; a zero funcid in the frame's
                // next-call word means "return to the interpreter".
                next_id: 1,
                free_ids: Vec::new(),
                sources: FxHashMap::default(),
            }),
        }
    }

    /// Allocate an unused handle. No code is installed yet.
    pub fn reserve(&self) -> FuncId {
        let mut inner = self.inner.lock();
        if let Some(id) = inner.free_ids.pop() {
            return id;
        }
        let id = inner.next_id;
        inner.next_id += 1;
        id
    }

    /// Install a fresh function at a reserved handle.
    pub fn compile(&self, id: FuncId, source: &str) {
        self.inner.lock().sources.insert(id, Arc::from(source));
    }

    /// Replace the function at `id` atomically.
    pub fn recompile(&self, id: FuncId, source: &str) {
        self.compile(id, source)
    }

    /// Make invoking `dst` execute the same code as `src`.
    pub fn copy(&self, src: FuncId, dst: FuncId) -> Result<(), AssembleError> {
        let mut inner = self.inner.lock();
        let source = inner
            .sources
            .get(&src)
            .cloned()
            .ok_or(AssembleError::UnknownFuncId(src))?;
        inner.sources.insert(dst, source);
        Ok(())
    }

    /// Release a handle back to the pool.
    pub fn free(&self, id: FuncId) {
        let mut inner = self.inner.lock();
        inner.sources.remove(&id);
        inner.free_ids.push(id);
    }

    /// The source currently installed at `id`, if any.
    pub fn source(&self, id: FuncId) -> Option<Arc<str>> {
        self.inner.lock().sources.get(&id).cloned()
    }

    /// Number of installed functions.
    pub fn installed_count(&self) -> usize {
        self.inner.lock().sources.len()
    }
}

impl Default for FuncTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_is_unique_and_nonzero() {
        let table = FuncTable::new();
        let a = table.reserve();
        let b = table.reserve();
        assert_ne!(a, 0);
        assert_ne!(a, b);
    }

    #[test]
    fn test_compile_and_recompile() {
        let table = FuncTable::new();
        let id = table.reserve();
        table.compile(id, "function jitted(label, frame) {}");
        assert!(table.source(id).unwrap().contains("jitted"));
        table.recompile(id, "// v2");
        assert_eq!(&*table.source(id).unwrap(), "// v2");
    }

    #[test]
    fn test_copy_aliases_source() {
        let table = FuncTable::new();
        let a = table.reserve();
        let b = table.reserve();
        table.compile(a, "// original");
        table.copy(a, b).unwrap();
        assert_eq!(table.source(b).as_deref(), Some("// original"));
    }

    #[test]
    fn test_copy_unknown_source_fails() {
        let table = FuncTable::new();
        let b = table.reserve();
        assert!(matches!(
            table.copy(999, b),
            Err(AssembleError::UnknownFuncId(999))
        ));
    }

    #[test]
    fn test_free_recycles_id() {
        let table = FuncTable::new();
        let a = table.reserve();
        table.compile(a, "// gone soon");
        table.free(a);
        assert!(table.source(a).is_none());
        assert_eq!(table.reserve(), a);
    }
}
