//! C-ABI callbacks consumed by the external reflection library.
//!
//! the library drives target inspection through five callbacks, each
//! receiving an opaque context pointer; here that context is a
//! `*mut Session`. buffers returned by `read_bytes` are allocated with
//! `libc::malloc` and ownership passes to the library, which hands them
//! back through `free_bytes`.

use std::os::raw::{c_char, c_int, c_void};

use log::trace;

use crate::session::Session;

pub const QUERY_POINTER_SIZE: u32 = 0;
pub const QUERY_SIZE_SIZE: u32 = 1;
pub const QUERY_LEAST_VALID_POINTER: u32 = 2;

/// lowest address the library should treat as a plausible pointer; the
/// zero page is never mapped.
pub const LEAST_VALID_POINTER: u64 = 0x1000;

/// answer a data-layout query; returns 1 on success, 0 for unknown kinds.
pub unsafe extern "C" fn query_data_layout(
    _context: *mut c_void,
    kind: u32,
    _in_buffer: *mut c_void,
    out_buffer: *mut c_void,
) -> c_int {
    match kind {
        QUERY_POINTER_SIZE | QUERY_SIZE_SIZE => {
            *(out_buffer as *mut u8) = std::mem::size_of::<u64>() as u8;
            1
        }
        QUERY_LEAST_VALID_POINTER => {
            *(out_buffer as *mut u64) = LEAST_VALID_POINTER;
            1
        }
        _ => 0,
    }
}

/// copy `size` bytes from the tracee into a fresh malloc'd buffer; null
/// on any failure (including a short read).
pub unsafe extern "C" fn read_bytes(
    context: *mut c_void,
    addr: u64,
    size: u64,
    _out_context: *mut *mut c_void,
) -> *mut c_void {
    let session = &mut *(context as *mut Session);
    trace!("[reflection] read {} bytes at {:x}", size, addr);
    let bytes = match session.read_bytes(addr, size as usize) {
        Ok(bytes) => bytes,
        Err(_) => return std::ptr::null_mut(),
    };
    if bytes.len() != size as usize {
        return std::ptr::null_mut();
    }
    let buffer = libc::malloc(size as usize);
    if buffer.is_null() {
        return std::ptr::null_mut();
    }
    std::ptr::copy_nonoverlapping(
        bytes.as_ptr(),
        buffer as *mut u8,
        size as usize,
    );
    buffer
}

/// release a buffer previously handed out by [`read_bytes`].
pub unsafe extern "C" fn free_bytes(
    _context: *mut c_void,
    bytes: *mut c_void,
    _free_context: *mut c_void,
) {
    libc::free(bytes);
}

/// length in bytes of the NUL-terminated string at `addr`; 0 on failure
/// (including a zero `addr`, the ABI's own failure sentinel).
pub unsafe extern "C" fn get_string_length(
    context: *mut c_void,
    addr: u64,
) -> u64 {
    let session = &mut *(context as *mut Session);
    session
        .read_string(addr)
        .map(|s| s.len() as u64)
        .unwrap_or(0)
}

/// resolve a (not necessarily NUL-terminated) symbol name of `len` bytes
/// to a tracee address via the symbol cache; 0 on failure.
pub unsafe extern "C" fn get_symbol_address(
    context: *mut c_void,
    name: *const c_char,
    len: u64,
) -> u64 {
    let session = &mut *(context as *mut Session);
    let raw = std::slice::from_raw_parts(name as *const u8, len as usize);
    let name = match std::str::from_utf8(raw) {
        Ok(s) => s,
        Err(_) => return 0,
    };
    trace!("[reflection] resolve symbol {:?}", name);
    session.address_of(name).unwrap_or(0)
}

/// the callback table handed to the reflection library, bundled with the
/// session context pointer it expects.
#[repr(C)]
pub struct ReflectionCallbacks {
    pub context: *mut c_void,
    pub query_data_layout: unsafe extern "C" fn(
        *mut c_void,
        u32,
        *mut c_void,
        *mut c_void,
    ) -> c_int,
    pub free_bytes:
        unsafe extern "C" fn(*mut c_void, *mut c_void, *mut c_void),
    pub read_bytes: unsafe extern "C" fn(
        *mut c_void,
        u64,
        u64,
        *mut *mut c_void,
    ) -> *mut c_void,
    pub get_string_length: unsafe extern "C" fn(*mut c_void, u64) -> u64,
    pub get_symbol_address:
        unsafe extern "C" fn(*mut c_void, *const c_char, u64) -> u64,
}

impl ReflectionCallbacks {
    /// the session must outlive the callback table and must not move
    /// while the library holds the context pointer.
    pub fn for_session(session: &mut Session) -> ReflectionCallbacks {
        ReflectionCallbacks {
            context: session as *mut Session as *mut c_void,
            query_data_layout,
            free_bytes,
            read_bytes,
            get_string_length,
            get_symbol_address,
        }
    }
}
