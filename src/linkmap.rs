//! reconstruction of the tracee's shared-object list by walking the
//! dynamic linker's `DT_DEBUG -> r_debug -> link_map` chain.

use std::io::{Error, ErrorKind, Result};

use goblin::elf::dynamic::{DT_DEBUG, DT_NULL};
use goblin::elf::program_header::{PT_DYNAMIC, PT_LOAD};
use goblin::elf64::dynamic::Dyn;
use goblin::elf64::header::SIZEOF_EHDR;
use goblin::elf64::program_header::ProgramHeader;
use log::debug;
use nix::unistd::Pid;

use crate::proc::AuxVec;
use crate::remote::{peek_array, peek_cstring, peek_struct, RemotePtr};

/// one loaded shared object, in load order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkMapEntry {
    pub load_bias: u64,
    pub soname: Option<String>,
}

/// the dynamic linker's `struct r_debug` (ELF64 layout).
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct RDebug {
    r_version: i32,
    r_map: u64,
    r_brk: u64,
    r_state: i32,
    r_ldbase: u64,
}

/// the dynamic linker's `struct link_map` (ELF64 layout, public prefix).
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct LinkMap64 {
    l_addr: u64,
    l_name: u64,
    l_ld: u64,
    l_next: u64,
    l_prev: u64,
}

// a corrupt list must terminate the walk, not hang it
const MAX_LINK_MAP_NODES: usize = 4096;

/// walk the tracee's link map. requires `AT_PHDR`/`AT_PHENT`/`AT_PHNUM`
/// in the auxiliary vector; only 64-bit tracees are supported.
pub fn load_link_map(pid: Pid, auxv: &AuxVec) -> Result<Vec<LinkMapEntry>> {
    let at_phdr = auxv.require(libc::AT_PHDR)?;
    let at_phent = auxv.require(libc::AT_PHENT)?;
    let at_phnum = auxv.require(libc::AT_PHNUM)?;

    let phent_64 = std::mem::size_of::<ProgramHeader>() as u64;
    if at_phent != phent_64 {
        return Err(Error::new(
            ErrorKind::Other,
            format!(
                "pid {}: AT_PHENT is {} (expected {}); \
                 32-bit tracees are not supported",
                pid, at_phent, phent_64
            ),
        ));
    }

    let phdrs: Vec<ProgramHeader> = peek_array(
        pid,
        RemotePtr::try_from_addr(at_phdr)?,
        at_phnum as usize,
    )?;
    if phdrs.len() != at_phnum as usize {
        return Err(Error::new(
            ErrorKind::InvalidData,
            format!(
                "pid {}: short phdr table read ({} of {})",
                pid,
                phdrs.len(),
                at_phnum
            ),
        ));
    }

    let base_load = phdrs
        .iter()
        .filter(|ph| ph.p_type == PT_LOAD)
        .min_by_key(|ph| ph.p_vaddr)
        .ok_or_else(|| {
            Error::new(
                ErrorKind::InvalidData,
                format!("pid {}: no PT_LOAD segment", pid),
            )
        })?;

    let mut dynamics = phdrs.iter().filter(|ph| ph.p_type == PT_DYNAMIC);
    let dynamic = dynamics.next().ok_or_else(|| {
        Error::new(
            ErrorKind::InvalidData,
            format!("pid {}: no PT_DYNAMIC segment (static binary?)", pid),
        )
    })?;
    if dynamics.next().is_some() {
        return Err(Error::new(
            ErrorKind::InvalidData,
            format!("pid {}: multiple PT_DYNAMIC segments", pid),
        ));
    }

    // the phdr table sits directly after the ELF header in the mapped image
    let load_addr = at_phdr - SIZEOF_EHDR as u64;
    let base_addr = load_addr.wrapping_sub(base_load.p_vaddr);
    let dyn_addr = base_addr.wrapping_add(dynamic.p_vaddr);
    debug!(
        "[linkmap] pid {} load {:x} base {:x} dynamic {:x}",
        pid, load_addr, base_addr, dyn_addr
    );

    let dyn_count = (dynamic.p_memsz as usize)
        / std::mem::size_of::<Dyn>();
    let dyns: Vec<Dyn> =
        peek_array(pid, RemotePtr::try_from_addr(dyn_addr)?, dyn_count)?;
    let r_debug_addr = dyns
        .iter()
        .take_while(|d| d.d_tag != DT_NULL)
        .find(|d| d.d_tag == DT_DEBUG)
        .map(|d| d.d_val)
        .ok_or_else(|| {
            Error::new(
                ErrorKind::NotFound,
                format!("pid {}: no DT_DEBUG in dynamic segment", pid),
            )
        })?;
    if r_debug_addr == 0 {
        return Err(Error::new(
            ErrorKind::Other,
            format!("pid {}: DT_DEBUG not yet filled by the linker", pid),
        ));
    }

    let r_debug: RDebug =
        peek_struct(pid, RemotePtr::try_from_addr(r_debug_addr)?)?;
    debug!(
        "[linkmap] pid {} r_debug v{} map {:x}",
        pid, r_debug.r_version, r_debug.r_map
    );

    let mut res: Vec<LinkMapEntry> = Vec::new();
    let mut node = r_debug.r_map;
    while node != 0 {
        if res.len() >= MAX_LINK_MAP_NODES {
            return Err(Error::new(
                ErrorKind::InvalidData,
                format!("pid {}: link map exceeds {} nodes", pid, res.len()),
            ));
        }
        let lm: LinkMap64 = peek_struct(pid, RemotePtr::try_from_addr(node)?)?;
        let soname = if lm.l_name != 0 {
            let name = peek_cstring(pid, RemotePtr::try_from_addr(lm.l_name)?)?;
            if name.is_empty() {
                None
            } else {
                Some(name)
            }
        } else {
            None
        };
        res.push(LinkMapEntry {
            load_bias: lm.l_addr,
            soname,
        });
        node = lm.l_next;
    }
    Ok(res)
}
