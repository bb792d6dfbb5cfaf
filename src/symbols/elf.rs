//! ELF-backed symbol provider
//!
//! Builds per-module function tables from the target's memory map and the
//! ELF symbol tables of the mapped objects. Source locations are resolved
//! from DWARF at load time when requested; the finished tables are plain
//! data, so the provider can be shared freely across capture threads.

use std::borrow::Cow;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use addr2line::Context;
use gimli::{EndianRcSlice, RunTimeEndian};
use log::{debug, warn};
use object::{Object, ObjectKind, ObjectSection, ObjectSymbol, SymbolKind};
use rustc_demangle::demangle;

use crate::domain::{CaptureError, Pid};
use crate::inspect;
use crate::probes::SelectedProbe;
use crate::symbols::{
    Function, FunctionRef, Module, ModuleId, ResolvedSymbol, SymbolProvider,
};

struct ModuleTable {
    functions: Vec<Function>,
    /// `(absolute start, function index)`, sorted by start.
    starts: Vec<(u64, usize)>,
    /// File offset of each function, for uprobe placement.
    file_offsets: Vec<u64>,
}

pub struct ElfSymbolProvider {
    /// Sorted by load address.
    modules: Vec<Module>,
    tables: Vec<ModuleTable>,
}

impl ElfSymbolProvider {
    /// Snapshot the target's modules and load their symbol tables.
    ///
    /// Modules whose objects cannot be read or parsed stay in the snapshot
    /// with `symbols_loaded == false`; only the target process vanishing is
    /// an error.
    ///
    /// # Errors
    /// `ProcessGone` when the memory map cannot be read.
    pub fn for_process(pid: Pid, find_file_and_line: bool) -> Result<Self, CaptureError> {
        let maps = inspect::read_maps(pid)?;

        // Group file-backed mappings by path, spanning min start to max end.
        let mut spans: Vec<(PathBuf, u64, u64)> = Vec::new();
        for entry in &maps {
            let Some(path) = &entry.path else { continue };
            if path.to_string_lossy().starts_with('[') {
                continue;
            }
            match spans.iter_mut().find(|(p, _, _)| p == path) {
                Some((_, start, end)) => {
                    *start = (*start).min(entry.start);
                    *end = (*end).max(entry.end);
                }
                None => spans.push((path.clone(), entry.start, entry.end)),
            }
        }
        spans.sort_by_key(|&(_, start, _)| start);

        let mut modules = Vec::new();
        let mut tables = Vec::new();
        for (index, (path, start, end)) in spans.into_iter().enumerate() {
            let id = ModuleId(index);
            let name = path
                .file_name()
                .map_or_else(|| path.to_string_lossy().into_owned(), |n| {
                    n.to_string_lossy().into_owned()
                });
            let mut module = Module {
                id,
                name,
                full_path: path,
                start,
                end,
                build_id: None,
                symbols_loaded: false,
            };

            let table = match load_module_table(&mut module, find_file_and_line) {
                Ok(table) => {
                    // Publish the finished table before flipping the flag.
                    module.symbols_loaded = true;
                    table
                }
                Err(err) => {
                    debug!("no symbols for {}: {err}", module.full_path.display());
                    ModuleTable { functions: Vec::new(), starts: Vec::new(), file_offsets: Vec::new() }
                }
            };
            modules.push(module);
            tables.push(table);
        }

        Ok(Self { modules, tables })
    }

    fn module_for(&self, addr: u64) -> Option<usize> {
        let idx = match self.modules.binary_search_by_key(&addr, |m| m.start) {
            Ok(idx) => idx,
            Err(0) => return None,
            Err(idx) => idx - 1,
        };
        self.modules[idx].contains(addr).then_some(idx)
    }

    fn function_at(&self, addr: u64) -> Option<(usize, usize)> {
        let module_idx = self.module_for(addr)?;
        let table = &self.tables[module_idx];
        let idx = match table.starts.binary_search_by_key(&addr, |&(start, _)| start) {
            Ok(idx) => idx,
            Err(0) => return None,
            Err(idx) => idx - 1,
        };
        let (start, function_idx) = table.starts[idx];
        let function = &table.functions[function_idx];
        (addr < start + function.size.max(1)).then_some((module_idx, function_idx))
    }

    /// Selected-probe records for every function whose demangled name
    /// contains one of the patterns. Used to translate operator selections.
    #[must_use]
    pub fn probes_matching(&self, patterns: &[String]) -> Vec<SelectedProbe> {
        let mut probes = Vec::new();
        for (module_idx, table) in self.tables.iter().enumerate() {
            let module = &self.modules[module_idx];
            for (function_idx, function) in table.functions.iter().enumerate() {
                if !patterns.iter().any(|p| function.demangled_name.contains(p)) {
                    continue;
                }
                let start = table
                    .starts
                    .iter()
                    .find(|&&(_, idx)| idx == function_idx)
                    .map(|&(start, _)| start);
                let Some(vaddr) = start else { continue };
                probes.push(SelectedProbe {
                    vaddr,
                    probe_name: function.probe_name.clone(),
                    module_path: module.full_path.clone(),
                    module_offset: table.file_offsets[function_idx],
                });
            }
        }
        probes
    }
}

impl SymbolProvider for ElfSymbolProvider {
    fn modules(&self, _pid: Pid) -> Vec<Module> {
        self.modules.clone()
    }

    fn functions(&self, module: ModuleId) -> Vec<Function> {
        self.tables.get(module.0).map(|t| t.functions.clone()).unwrap_or_default()
    }

    fn resolve(&self, addr: u64) -> Option<ResolvedSymbol> {
        let (module_idx, function_idx) = self.function_at(addr)?;
        let table = &self.tables[module_idx];
        let function = &table.functions[function_idx];
        let start = table
            .starts
            .iter()
            .find(|&&(_, idx)| idx == function_idx)
            .map(|&(start, _)| start)?;
        Some(ResolvedSymbol {
            start,
            name: function.demangled_name.clone(),
            function: FunctionRef { module: ModuleId(module_idx), index: function_idx },
        })
    }

    fn line_info(&self, addr: u64) -> Option<(String, u32)> {
        let (module_idx, function_idx) = self.function_at(addr)?;
        let function = &self.tables[module_idx].functions[function_idx];
        Some((function.file.clone()?, function.line?))
    }
}

type DwarfReader = EndianRcSlice<RunTimeEndian>;

fn load_module_table(
    module: &mut Module,
    find_file_and_line: bool,
) -> Result<ModuleTable, CaptureError> {
    let binary_data = fs::read(&module.full_path)?;
    let obj = object::File::parse(&*binary_data)
        .map_err(|err| CaptureError::Io(std::io::Error::other(err.to_string())))?;

    module.build_id = obj.build_id().ok().flatten().map(<[u8]>::to_vec);

    // Position-independent objects are linked at zero and rebased to the
    // mapping start; fixed executables keep their link-time addresses.
    let bias = match obj.kind() {
        ObjectKind::Dynamic => module.start,
        _ => 0,
    };

    let line_ctx = if find_file_and_line { dwarf_context(&obj) } else { None };

    let mut functions = Vec::new();
    let mut starts = Vec::new();
    let mut file_offsets = Vec::new();
    let mut seen = HashSet::new();

    for sym in obj.symbols().chain(obj.dynamic_symbols()) {
        if sym.kind() != SymbolKind::Text || sym.size() == 0 {
            continue;
        }
        let Ok(mangled) = sym.name() else { continue };
        if mangled.is_empty() || !seen.insert(sym.address()) {
            continue;
        }

        let file_offset = symbol_file_offset(&obj, &sym).unwrap_or(sym.address());
        let (file, line) = line_ctx
            .as_ref()
            .and_then(|ctx| find_location(ctx, sym.address()))
            .map_or((None, None), |(f, l)| (Some(f), Some(l)));

        let index = functions.len();
        starts.push((bias + sym.address(), index));
        file_offsets.push(file_offset);
        functions.push(Function {
            module: module.id,
            module_offset: sym.address(),
            size: sym.size(),
            mangled_name: mangled.to_string(),
            demangled_name: format!("{:#}", demangle(mangled)),
            probe_name: Some(format!("{}:{mangled}", module.full_path.display())),
            file,
            line,
        });
    }

    starts.sort_by_key(|&(start, _)| start);
    if functions.is_empty() {
        warn!("{} has no usable text symbols", module.full_path.display());
    }
    Ok(ModuleTable { functions, starts, file_offsets })
}

fn symbol_file_offset(obj: &object::File, sym: &object::Symbol) -> Option<u64> {
    let section = obj.section_by_index(sym.section_index()?).ok()?;
    let (file_start, _) = section.file_range()?;
    Some(file_start + (sym.address() - section.address()))
}

fn dwarf_context(obj: &object::File) -> Option<Context<DwarfReader>> {
    let endian = if obj.is_little_endian() { RunTimeEndian::Little } else { RunTimeEndian::Big };

    let load_section = |id: gimli::SectionId| -> Result<DwarfReader, gimli::Error> {
        let data = obj
            .section_by_name(id.name())
            .and_then(|section| section.uncompressed_data().ok())
            .unwrap_or(Cow::Borrowed(&[][..]));
        Ok(EndianRcSlice::new(Rc::from(&*data), endian))
    };

    let dwarf = gimli::Dwarf::load(&load_section).ok()?;
    Context::from_dwarf(dwarf).ok()
}

fn find_location(ctx: &Context<DwarfReader>, addr: u64) -> Option<(String, u32)> {
    let location = ctx.find_location(addr).ok()??;
    Some((location.file?.to_string(), location.line?))
}

/// Load a provider for a single object file mapped at `start`, mostly for
/// offline inspection and tests.
///
/// # Errors
/// Propagates read and parse failures.
pub fn provider_for_file(
    path: &Path,
    start: u64,
    end: u64,
    find_file_and_line: bool,
) -> Result<ElfSymbolProvider, CaptureError> {
    let mut module = Module {
        id: ModuleId(0),
        name: path
            .file_name()
            .map_or_else(String::new, |n| n.to_string_lossy().into_owned()),
        full_path: path.to_path_buf(),
        start,
        end,
        build_id: None,
        symbols_loaded: false,
    };
    let table = load_module_table(&mut module, find_file_and_line)?;
    module.symbols_loaded = true;
    Ok(ElfSymbolProvider { modules: vec![module], tables: vec![table] })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_for_self() {
        // The test binary is an ELF with at least some text symbols.
        let exe = std::env::current_exe().unwrap();
        let provider = provider_for_file(&exe, 0, u64::MAX, false).unwrap();
        let modules = provider.modules(Pid(0));
        assert_eq!(modules.len(), 1);
        assert!(modules[0].symbols_loaded);
        assert!(!provider.functions(ModuleId(0)).is_empty());
    }

    #[test]
    fn test_for_process_self() {
        #[allow(clippy::cast_possible_wrap)]
        let pid = Pid(std::process::id() as i32);
        let provider = ElfSymbolProvider::for_process(pid, false).unwrap();
        assert!(!provider.modules(pid).is_empty());
    }

    #[test]
    fn test_probe_matching_on_self() {
        let exe = std::env::current_exe().unwrap();
        let provider = provider_for_file(&exe, 0, u64::MAX, false).unwrap();
        // Every probe record must name its module and carry a file offset.
        let probes = provider.probes_matching(&["main".to_string()]);
        for probe in probes {
            assert_eq!(probe.module_path, exe);
            assert!(probe.probe_name.is_some());
        }
    }
}
