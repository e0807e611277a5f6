//! locating libc functions inside the tracee.
//!
//! ASLR forbids sharing addresses between processes, but both sides map
//! the same library files. resolve the symbol locally with the dynamic
//! linker, find the local map region that contains it, find the tracee's
//! structurally equivalent region (same pathname, length, permissions),
//! and reuse the intra-region offset.

use std::ffi::{CStr, CString};
use std::io::{Error, ErrorKind, Result};

use log::debug;
use nix::unistd::{self, Pid};

use crate::proc::decode_proc_maps;

fn dlerror_string() -> String {
    let msg = unsafe { libc::dlerror() };
    if msg.is_null() {
        String::from("unknown dl error")
    } else {
        unsafe { CStr::from_ptr(msg) }.to_string_lossy().into_owned()
    }
}

/// resolve `func_name` in `lib_name` within the tracer itself.
pub fn local_dlsym(lib_name: &str, func_name: &str) -> Result<u64> {
    let lib_c = CString::new(lib_name)
        .map_err(|e| Error::new(ErrorKind::InvalidInput, e))?;
    let handle = unsafe { libc::dlopen(lib_c.as_ptr(), libc::RTLD_LAZY) };
    if handle.is_null() {
        return Err(Error::new(
            ErrorKind::NotFound,
            format!("dlopen({}) failed: {}", lib_name, dlerror_string()),
        ));
    }
    let func_c = CString::new(func_name)
        .map_err(|e| Error::new(ErrorKind::InvalidInput, e))?;
    let func = unsafe { libc::dlsym(handle, func_c.as_ptr()) };
    if func.is_null() {
        return Err(Error::new(
            ErrorKind::NotFound,
            format!(
                "dlsym({}, {}) failed: {}",
                lib_name,
                func_name,
                dlerror_string()
            ),
        ));
    }
    Ok(func as u64)
}

/// translate a tracer-side address into the tracee by matching map
/// regions. the local region must be executable and file-backed;
/// ambiguity resolves to the tracee's first match in map order.
pub fn find_equivalent_remote_addr(pid: Pid, local_addr: u64) -> Result<u64> {
    let self_maps = decode_proc_maps(unistd::getpid())?;
    let local_entry = self_maps
        .iter()
        .find(|e| e.contains(local_addr))
        .ok_or_else(|| {
            Error::new(
                ErrorKind::NotFound,
                format!("no local map region contains {:x}", local_addr),
            )
        })?;
    if !local_entry.is_exec() || !local_entry.is_file_backed() {
        return Err(Error::new(
            ErrorKind::Other,
            format!(
                "local region {:?} holding {:x} is not executable file-backed",
                local_entry, local_addr
            ),
        ));
    }

    let remote_maps = decode_proc_maps(pid)?;
    let remote_entry = remote_maps
        .iter()
        .find(|e| {
            e.pathname == local_entry.pathname
                && e.len() == local_entry.len()
                && e.perms == local_entry.perms
        })
        .ok_or_else(|| {
            Error::new(
                ErrorKind::NotFound,
                format!(
                    "pid {} maps no region equivalent to {:?}",
                    pid, local_entry
                ),
            )
        })?;

    let offset = local_addr - local_entry.start;
    debug!(
        "[dlsym] {:x} = {:?} + {:x} -> remote {:x}",
        local_addr,
        local_entry.pathname,
        offset,
        remote_entry.start + offset
    );
    Ok(remote_entry.start + offset)
}

/// address of `lib_name`:`func_name` inside the tracee.
pub fn remote_dlsym(pid: Pid, lib_name: &str, func_name: &str) -> Result<u64> {
    let local = local_dlsym(lib_name, func_name)?;
    find_equivalent_remote_addr(pid, local)
}
