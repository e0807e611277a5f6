//! symbol cache: every loaded module's symbols, rebased and indexed both
//! by name (per module, load order) and by address (flat, sorted).

use std::collections::HashMap;
use std::io::{Error, ErrorKind, Result};
use std::path::Path;

use log::{debug, warn};
use nix::unistd::Pid;

use crate::elf::ElfFile;
use crate::linkmap;
use crate::proc::AuxVec;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymbolRange {
    pub start: u64,
    pub end: u64,
}

/// one record of the address-sorted reverse index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolInfo {
    pub start: u64,
    pub end: u64,
    pub module: String,
    pub name: String,
}

#[derive(Debug)]
pub struct SymbolCache {
    // load order matters: address_of takes the first match
    modules: Vec<(String, HashMap<String, SymbolRange>)>,
    sorted: Vec<SymbolInfo>,
}

impl SymbolCache {
    /// eagerly index every link-map entry whose soname names a readable
    /// file. objects that vanished from disk or fail to parse are skipped.
    pub fn new(pid: Pid, auxv: &AuxVec) -> Result<SymbolCache> {
        let link_map = linkmap::load_link_map(pid, auxv)?;
        let mut modules: Vec<(String, HashMap<String, SymbolRange>)> =
            Vec::new();
        let mut sorted: Vec<SymbolInfo> = Vec::new();

        for entry in link_map {
            let soname = match entry.soname {
                Some(s) => s,
                None => continue,
            };
            if !Path::new(&soname).exists() {
                debug!("[symbols] {} not on disk, skipping", soname);
                continue;
            }
            let elf = match ElfFile::open(&soname) {
                Ok(elf) => elf,
                Err(e) => {
                    warn!("[symbols] cannot open {}: {}", soname, e);
                    continue;
                }
            };
            let syms = match elf.load_symbols(entry.load_bias) {
                Ok(syms) => syms,
                Err(e) => {
                    warn!("[symbols] cannot read symbols of {}: {}", soname, e);
                    continue;
                }
            };
            debug!(
                "[symbols] {} @ {:x}: {} symbols",
                soname,
                entry.load_bias,
                syms.len()
            );
            let mut by_name: HashMap<String, SymbolRange> = HashMap::new();
            for sym in syms {
                let range = SymbolRange {
                    start: sym.start,
                    end: sym.end,
                };
                sorted.push(SymbolInfo {
                    start: sym.start,
                    end: sym.end,
                    module: soname.clone(),
                    name: sym.name.clone(),
                });
                // duplicate names within a module: the later entry wins
                by_name.insert(sym.name, range);
            }
            modules.push((soname, by_name));
        }

        sorted.sort_by(|a, b| {
            a.start
                .cmp(&b.start)
                .then(a.end.cmp(&b.end))
                .then(a.name.cmp(&b.name))
        });
        sorted.dedup();

        Ok(SymbolCache { modules, sorted })
    }

    pub fn module_count(&self) -> usize {
        self.modules.len()
    }

    pub fn module_names(&self) -> impl Iterator<Item = &str> {
        self.modules.iter().map(|(name, _)| name.as_str())
    }

    /// first match across modules in load order.
    pub fn address_of(&self, name: &str) -> Result<SymbolRange> {
        self.modules
            .iter()
            .filter_map(|(_, syms)| syms.get(name))
            .next()
            .cloned()
            .ok_or_else(|| {
                Error::new(
                    ErrorKind::NotFound,
                    format!("symbol {:?} not found in any module", name),
                )
            })
    }

    /// lookup scoped to one module.
    pub fn address_of_in(&self, module: &str, name: &str) -> Result<SymbolRange> {
        self.modules
            .iter()
            .find(|(m, _)| m == module)
            .and_then(|(_, syms)| syms.get(name))
            .cloned()
            .ok_or_else(|| {
                Error::new(
                    ErrorKind::NotFound,
                    format!("symbol {:?} not found in module {:?}", name, module),
                )
            })
    }

    /// reverse lookup: the entry whose `[start, end)` contains `addr`.
    pub fn symbol_for(&self, addr: u64) -> Result<&SymbolInfo> {
        // locate the last entry with start <= addr; entries sharing that
        // start are adjacent and sorted by end, so it has the widest range.
        let idx = match self
            .sorted
            .binary_search_by(|probe| probe.start.cmp(&addr))
        {
            Ok(mut i) => {
                while i + 1 < self.sorted.len()
                    && self.sorted[i + 1].start == addr
                {
                    i += 1;
                }
                i
            }
            Err(0) => return Err(no_symbol_for(addr)),
            Err(i) => i - 1,
        };
        let entry = &self.sorted[idx];
        if entry.start <= addr && addr < entry.end {
            Ok(entry)
        } else {
            Err(no_symbol_for(addr))
        }
    }

    pub fn reverse_index(&self) -> &[SymbolInfo] {
        &self.sorted
    }
}

fn no_symbol_for(addr: u64) -> Error {
    Error::new(
        ErrorKind::NotFound,
        format!("no symbol covers address {:x}", addr),
    )
}
