//! on-disk ELF access: header validation, class dispatch, and rebased
//! symbol extraction for the symbol cache.

use std::fs::File;
use std::io::{Error, ErrorKind, Read, Result};
use std::path::{Path, PathBuf};

use goblin::elf::Elf;
use log::warn;

const ELF_MAGIC: &'static [u8] = b"\x7fELF";
const ELFCLASS32: u8 = 1;
const ELFCLASS64: u8 = 2;
const SHENTSIZE_32: u16 = 40;
const SHENTSIZE_64: u16 = 64;

/// a symbol rebased into the tracee's address space:
/// `start = st_value + bias`, `end = start + st_size`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    pub name: String,
    pub start: u64,
    pub end: u64,
}

/// a validated ELF file opened from disk.
#[derive(Debug)]
pub struct ElfFile {
    path: PathBuf,
    bytes: Vec<u8>,
    is64: bool,
}

fn malformed(path: &Path, reason: &str) -> Error {
    Error::new(
        ErrorKind::InvalidData,
        format!("{}: {}", path.display(), reason),
    )
}

impl ElfFile {
    /// open and validate: ELF magic, a known `EI_CLASS`, and a section
    /// header entry size matching the class.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<ElfFile> {
        let path = path.as_ref().to_path_buf();
        let mut bytes: Vec<u8> = Vec::new();
        File::open(&path)?.read_to_end(&mut bytes)?;

        if bytes.len() < 16 || &bytes[..4] != ELF_MAGIC {
            return Err(malformed(&path, "bad ELF magic"));
        }
        let is64 = match bytes[4] {
            ELFCLASS64 => true,
            ELFCLASS32 => false,
            other => {
                return Err(malformed(
                    &path,
                    &format!("unknown EI_CLASS {}", other),
                ))
            }
        };

        let file = ElfFile { path, bytes, is64 };
        let elf = file.parse()?;
        let expected = if is64 { SHENTSIZE_64 } else { SHENTSIZE_32 };
        if elf.header.e_shnum > 0 && elf.header.e_shentsize != expected {
            return Err(malformed(
                &file.path,
                &format!(
                    "e_shentsize {} != {} for class",
                    elf.header.e_shentsize, expected
                ),
            ));
        }
        Ok(file)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_elf64(&self) -> bool {
        self.is64
    }

    pub fn header(&self) -> Result<goblin::elf::Header> {
        Ok(self.parse()?.header)
    }

    pub fn section_count(&self) -> Result<usize> {
        Ok(self.parse()?.section_headers.len())
    }

    /// the `i`-th section header; `i` is checked against `e_shnum`.
    pub fn section_header(
        &self,
        i: usize,
    ) -> Result<goblin::elf::SectionHeader> {
        let elf = self.parse()?;
        elf.section_headers.get(i).cloned().ok_or_else(|| {
            malformed(
                &self.path,
                &format!(
                    "section index {} out of range ({} sections)",
                    i,
                    elf.section_headers.len()
                ),
            )
        })
    }

    fn parse(&self) -> Result<Elf> {
        Elf::parse(self.bytes.as_slice())
            .map_err(|e| malformed(&self.path, &format!("{}", e)))
    }

    /// collect symbols from `SHT_SYMTAB` and `SHT_DYNSYM`, rebased by
    /// `bias`. symbols that are undefined, zero-valued, or zero-sized
    /// carry no address range and are dropped.
    pub fn load_symbols(&self, bias: u64) -> Result<Vec<Symbol>> {
        let elf = self.parse()?;

        // goblin leaves `syms`/`dynsyms` empty when the corresponding
        // SHT_SYMTAB/SHT_DYNSYM section is absent.
        let all = elf
            .syms
            .iter()
            .map(|sym| (sym, &elf.strtab))
            .chain(elf.dynsyms.iter().map(|sym| (sym, &elf.dynstrtab)));

        let mut res: Vec<Symbol> = Vec::new();
        for (sym, strtab) in all {
            if sym.st_shndx == 0 || sym.st_value == 0 || sym.st_size == 0 {
                continue;
            }
            let name = match strtab.get(sym.st_name) {
                Some(Ok(s)) if !s.is_empty() => String::from(s),
                Some(Err(_)) => {
                    warn!(
                        "[elf] {}: non-utf8 symbol name at strtab {:x}",
                        self.path.display(),
                        sym.st_name
                    );
                    continue;
                }
                _ => continue,
            };
            res.push(Symbol {
                name,
                start: sym.st_value + bias,
                end: sym.st_value + sym.st_size + bias,
            });
        }
        Ok(res)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn can_open_own_executable() -> Result<()> {
        let exe = ElfFile::open("/proc/self/exe")?;
        assert!(exe.is_elf64());
        assert!(exe.section_count()? > 0);
        assert_eq!(exe.header()?.e_shentsize, 64);
        assert!(exe.section_header(0).is_ok());
        assert!(exe.section_header(usize::max_value()).is_err());
        Ok(())
    }

    #[test]
    fn rejects_non_elf_file() {
        let err = ElfFile::open("/proc/self/cmdline").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }

    #[test]
    fn symbols_have_nonempty_ranges() -> Result<()> {
        let exe = ElfFile::open("/proc/self/exe")?;
        let syms = exe.load_symbols(0)?;
        assert!(syms.len() > 0);
        for sym in &syms {
            assert!(sym.start < sym.end, "{:?}", sym);
            assert!(!sym.name.is_empty());
        }
        Ok(())
    }

    #[test]
    fn bias_shifts_every_symbol() -> Result<()> {
        let exe = ElfFile::open("/proc/self/exe")?;
        let flat = exe.load_symbols(0)?;
        let biased = exe.load_symbols(0x1000_0000)?;
        assert_eq!(flat.len(), biased.len());
        for (a, b) in flat.iter().zip(biased.iter()) {
            assert_eq!(a.start + 0x1000_0000, b.start);
            assert_eq!(a.end + 0x1000_0000, b.end);
        }
        Ok(())
    }
}
