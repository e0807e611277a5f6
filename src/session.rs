//! the per-target session: owns the ptrace attachment and every derived
//! resource (executable ELF, auxv, symbol cache).
//!
//! the tracee is stopped for the whole lifetime of the session, because
//! pages injected for heap walking must stay valid between operations;
//! dropping the session detaches and lets it run again.

use std::io::{Error, ErrorKind, Result};

use log::info;
use nix::unistd::Pid;

use crate::elf::ElfFile;
use crate::heap;
use crate::linkmap::{self, LinkMapEntry};
use crate::proc::{self, AuxVec, ProcMapsEntry};
use crate::remote::{self, RemotePtr};
use crate::symbols::{SymbolCache, SymbolInfo};
use crate::tracer::Tracer;

#[derive(Debug)]
pub struct Session {
    pid: Pid,
    tracer: Tracer,
    exe: ElfFile,
    auxv: AuxVec,
    // built on first symbol query; construction walks the link map and
    // reads every module from disk
    symbols: Option<SymbolCache>,
}

impl Session {
    /// attach to `pid` and gather the target's startup state. the target
    /// stays stopped until the session is dropped.
    pub fn new(pid: Pid) -> Result<Session> {
        let tracer = Tracer::attach(pid)?;
        let exe = ElfFile::open(format!("/proc/{}/exe", pid))?;
        if !exe.is_elf64() {
            return Err(Error::new(
                ErrorKind::Other,
                format!("pid {} is a 32-bit process, not supported", pid),
            ));
        }
        let auxv = proc::read_auxv(pid)?;
        info!("[session] attached to {}", pid);
        Ok(Session {
            pid,
            tracer,
            exe,
            auxv,
            symbols: None,
        })
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn process_name(&self) -> Result<String> {
        proc::process_name(self.pid)
    }

    pub fn exe(&self) -> &ElfFile {
        &self.exe
    }

    pub fn auxv(&self) -> &AuxVec {
        &self.auxv
    }

    pub fn memory_map(&self) -> Result<Vec<ProcMapsEntry>> {
        proc::decode_proc_maps(self.pid)
    }

    pub fn modules(&self) -> Result<Vec<LinkMapEntry>> {
        linkmap::load_link_map(self.pid, &self.auxv)
    }

    pub fn symbols(&mut self) -> Result<&SymbolCache> {
        if self.symbols.is_none() {
            self.symbols = Some(SymbolCache::new(self.pid, &self.auxv)?);
        }
        Ok(self.symbols.as_ref().expect("just built"))
    }

    /// tracee-side address of `name`, first match in module load order.
    pub fn address_of(&mut self, name: &str) -> Result<u64> {
        self.symbols()?.address_of(name).map(|range| range.start)
    }

    /// symbol covering the tracee-side address `addr`.
    pub fn symbol_for(&mut self, addr: u64) -> Result<SymbolInfo> {
        self.symbols()?.symbol_for(addr).map(|info| info.clone())
    }

    pub fn read_bytes(&self, addr: u64, len: usize) -> Result<Vec<u8>> {
        remote::peek_bytes(self.pid, RemotePtr::try_from_addr(addr)?, len)
    }

    pub fn read_string(&self, addr: u64) -> Result<String> {
        remote::peek_cstring(self.pid, RemotePtr::try_from_addr(addr)?)
    }

    pub fn write_mem(&self, addr: u64, bytes: &[u8]) -> Result<()> {
        remote::poke_bytes(self.pid, RemotePtr::try_from_addr(addr)?, bytes)
    }

    /// enumerate live heap allocations; see [`heap::heap_iterate`].
    pub fn heap_iterate(
        &mut self,
        emit: &mut dyn FnMut(u64, u64),
    ) -> Result<u64> {
        heap::heap_iterate(&mut self.tracer, emit)
    }

    pub fn tracer_mut(&mut self) -> &mut Tracer {
        &mut self.tracer
    }
}
