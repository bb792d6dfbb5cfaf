//! Symbol model and provider interface
//!
//! The capture pipeline never parses object files itself; it consumes a
//! [`SymbolProvider`]. Function records live in flat per-module vectors and
//! are referenced by `(module, index)` pairs, never by pointers back into
//! other records. Providers are read-only while a capture runs.

pub mod elf;

use std::path::PathBuf;

use crate::domain::Pid;

pub use elf::ElfSymbolProvider;

/// Index of a module within one provider's snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleId(pub usize);

/// A loaded object in the target's address space. The range is half open
/// and never overlaps another module of the same process.
#[derive(Debug, Clone)]
pub struct Module {
    pub id: ModuleId,
    pub name: String,
    pub full_path: PathBuf,
    pub start: u64,
    pub end: u64,
    pub build_id: Option<Vec<u8>>,
    pub symbols_loaded: bool,
}

impl Module {
    #[must_use]
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end
    }
}

/// An immutable function record. `(module, module_offset)` is unique within
/// a capture.
#[derive(Debug, Clone)]
pub struct Function {
    pub module: ModuleId,
    /// Address of the function relative to its module's load address.
    pub module_offset: u64,
    pub size: u64,
    pub mangled_name: String,
    pub demangled_name: String,
    /// Probe spec understood by the tracer, when instrumentable.
    pub probe_name: Option<String>,
    pub file: Option<String>,
    pub line: Option<u32>,
}

/// Reference to a function without a back-pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FunctionRef {
    pub module: ModuleId,
    pub index: usize,
}

/// Result of placing an address inside a function.
#[derive(Debug, Clone)]
pub struct ResolvedSymbol {
    /// Start of the containing function in the target's address space.
    pub start: u64,
    pub name: String,
    pub function: FunctionRef,
}

/// Source of modules, function tables and address resolution for one target
/// process. Implementations must be safe to share across the capture's
/// threads; they are never mutated while a capture runs.
pub trait SymbolProvider: Send + Sync {
    /// Snapshot of the target's loaded modules.
    fn modules(&self, pid: Pid) -> Vec<Module>;

    /// Function table of one module, flat and immutable.
    fn functions(&self, module: ModuleId) -> Vec<Function>;

    /// Place a virtual address inside a function, if any is known.
    fn resolve(&self, addr: u64) -> Option<ResolvedSymbol>;

    /// Best-effort source location for an address.
    fn line_info(&self, _addr: u64) -> Option<(String, u32)> {
        None
    }
}

/// Provider over a fixed function table, for embedding and tests.
pub struct StaticSymbolProvider {
    /// Sorted by start address.
    functions: Vec<(u64, u64, String)>,
}

impl StaticSymbolProvider {
    /// Build from `(start, size, name)` triples.
    #[must_use]
    pub fn new(mut functions: Vec<(u64, u64, &str)>) -> Self {
        functions.sort_by_key(|&(start, _, _)| start);
        Self {
            functions: functions
                .into_iter()
                .map(|(start, size, name)| (start, size, name.to_string()))
                .collect(),
        }
    }

    /// A provider that resolves nothing.
    #[must_use]
    pub fn empty() -> Self {
        Self { functions: Vec::new() }
    }
}

impl SymbolProvider for StaticSymbolProvider {
    fn modules(&self, _pid: Pid) -> Vec<Module> {
        Vec::new()
    }

    fn functions(&self, module: ModuleId) -> Vec<Function> {
        self.functions
            .iter()
            .enumerate()
            .map(|(index, (start, size, name))| Function {
                module,
                module_offset: *start,
                size: *size,
                mangled_name: name.clone(),
                demangled_name: name.clone(),
                probe_name: None,
                file: None,
                line: None,
            })
            .collect()
    }

    fn resolve(&self, addr: u64) -> Option<ResolvedSymbol> {
        let idx = match self.functions.binary_search_by_key(&addr, |&(start, _, _)| start) {
            Ok(idx) => idx,
            Err(0) => return None,
            Err(idx) => idx - 1,
        };
        let (start, size, name) = &self.functions[idx];
        if addr < start + size {
            Some(ResolvedSymbol {
                start: *start,
                name: name.clone(),
                function: FunctionRef { module: ModuleId(0), index: idx },
            })
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_contains() {
        let module = Module {
            id: ModuleId(0),
            name: "libfoo.so".into(),
            full_path: "/usr/lib/libfoo.so".into(),
            start: 0x1000,
            end: 0x2000,
            build_id: None,
            symbols_loaded: true,
        };
        assert!(module.contains(0x1000));
        assert!(module.contains(0x1fff));
        assert!(!module.contains(0x2000));
        assert!(!module.contains(0xfff));
    }

    #[test]
    fn test_static_provider_resolution() {
        let provider =
            StaticSymbolProvider::new(vec![(0x100, 0x10, "alpha"), (0x200, 0x20, "beta")]);
        assert_eq!(provider.resolve(0x100).unwrap().start, 0x100);
        assert_eq!(provider.resolve(0x10f).unwrap().name, "alpha");
        assert_eq!(provider.resolve(0x21f).unwrap().name, "beta");
        assert!(provider.resolve(0x110).is_none());
        assert!(provider.resolve(0x50).is_none());
    }
}
