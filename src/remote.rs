//! tracee memory access over `process_vm_readv`/`process_vm_writev`.

use std::io::{Error, ErrorKind, Result};
use std::ptr::NonNull;

use nix::sys::uio;
use nix::unistd::Pid;

/// a pointer belonging to the tracee's address space.
#[derive(Debug)]
pub struct RemotePtr<T> {
    ptr: NonNull<T>,
}

impl<T> RemotePtr<T>
where
    T: Sized,
{
    /// `None` when `ptr` is null.
    pub fn new(ptr: *mut T) -> Option<Self> {
        NonNull::new(ptr).map(|ptr| RemotePtr { ptr })
    }
    /// `None` when `addr` is zero.
    pub fn from_addr(addr: u64) -> Option<Self> {
        RemotePtr::new(addr as *mut T)
    }
    /// checked constructor for caller-supplied addresses: a zero address
    /// is an error, not a panic.
    pub fn try_from_addr(addr: u64) -> Result<Self> {
        RemotePtr::from_addr(addr).ok_or_else(|| {
            Error::new(ErrorKind::InvalidInput, "null remote address")
        })
    }
    pub fn as_ptr(self) -> *mut T {
        self.ptr.as_ptr()
    }
    pub fn addr(self) -> u64 {
        self.ptr.as_ptr() as u64
    }
    pub fn cast<U>(self) -> RemotePtr<U> {
        RemotePtr {
            ptr: self.ptr.cast::<U>(),
        }
    }
    pub fn offset(self, count: isize) -> Self {
        let stride = std::mem::size_of::<T>() as i64;
        let addr = self.addr() as i64 + stride * count as i64;
        RemotePtr {
            // a nonzero base plus a struct-field offset cannot reach zero
            // without wrapping the whole address space
            ptr: NonNull::new(addr as *mut T)
                .expect("remote pointer arithmetic wrapped to null"),
        }
    }
}

impl<T> Clone for RemotePtr<T> {
    fn clone(&self) -> Self {
        RemotePtr { ptr: self.ptr }
    }
}

impl<T: Sized> Copy for RemotePtr<T> {}

// for reads that came back empty or below one element
fn read_failed(pid: Pid, addr: u64, size: usize, detail: &str) -> Error {
    Error::new(
        ErrorKind::UnexpectedEof,
        format!(
            "memory read of {} bytes at {:x} from pid {} failed: {}",
            size, addr, pid, detail
        ),
    )
}

/// read up to `size` bytes; a short read (the region may end early) returns
/// the successful prefix, zero bytes is an error.
pub fn peek_bytes(pid: Pid, addr: RemotePtr<u8>, size: usize) -> Result<Vec<u8>> {
    let mut res = vec![0u8; size];
    let remote_iov = &[uio::RemoteIoVec {
        base: addr.addr() as usize,
        len: size,
    }];
    let local_iov = &[uio::IoVec::from_mut_slice(res.as_mut_slice())];
    let nread =
        uio::process_vm_readv(pid, local_iov, remote_iov).map_err(|e| {
            Error::new(
                ErrorKind::Other,
                format!(
                    "memory read of {} bytes at {:x} from pid {} failed: {}",
                    size,
                    addr.addr(),
                    pid,
                    e
                ),
            )
        })?;
    if nread == 0 {
        return Err(read_failed(pid, addr.addr(), size, "0 bytes transferred"));
    }
    res.truncate(nread);
    Ok(res)
}

/// write all of `bytes`; a partial transfer is an error.
pub fn poke_bytes(pid: Pid, addr: RemotePtr<u8>, bytes: &[u8]) -> Result<()> {
    let remote_iov = &[uio::RemoteIoVec {
        base: addr.addr() as usize,
        len: bytes.len(),
    }];
    let local_iov = &[uio::IoVec::from_slice(bytes)];
    let nwritten = uio::process_vm_writev(pid, local_iov, remote_iov)
        .map_err(|e| {
            Error::new(
                ErrorKind::Other,
                format!(
                    "memory write of {} bytes at {:x} to pid {} failed: {}",
                    bytes.len(),
                    addr.addr(),
                    pid,
                    e
                ),
            )
        })?;
    if nwritten != bytes.len() {
        return Err(Error::new(
            ErrorKind::Other,
            format!(
                "memory write at {:x} to pid {}: only {} of {} bytes",
                addr.addr(),
                pid,
                nwritten,
                bytes.len()
            ),
        ));
    }
    Ok(())
}

/// read up to `up_to` elements of `T` in a single transfer, returning the
/// whole-element prefix that succeeded.
pub fn peek_array<T>(pid: Pid, addr: RemotePtr<T>, up_to: usize) -> Result<Vec<T>>
where
    T: Sized + Copy,
{
    let stride = std::mem::size_of::<T>();
    let bytes = peek_bytes(pid, addr.cast::<u8>(), up_to * stride)?;
    let count = bytes.len() / stride;
    if count == 0 {
        return Err(read_failed(
            pid,
            addr.addr(),
            up_to * stride,
            "short read below one element",
        ));
    }
    let mut res: Vec<T> = Vec::with_capacity(count);
    unsafe {
        std::ptr::copy_nonoverlapping(
            bytes.as_ptr(),
            res.as_mut_ptr() as *mut u8,
            count * stride,
        );
        res.set_len(count);
    }
    Ok(res)
}

pub fn peek_struct<T>(pid: Pid, addr: RemotePtr<T>) -> Result<T>
where
    T: Sized + Copy,
{
    let mut v = peek_array(pid, addr, 1)?;
    Ok(v.remove(0))
}

const STRING_CHUNK: usize = 64;

/// read a NUL-terminated string. reads in 64-byte chunks, halving the
/// chunk size on failure down to a single byte before giving up.
pub fn peek_cstring(pid: Pid, addr: RemotePtr<u8>) -> Result<String> {
    let mut collected: Vec<u8> = Vec::new();
    let mut cursor = addr;
    let mut chunk = STRING_CHUNK;
    loop {
        match peek_bytes(pid, cursor, chunk) {
            Ok(bytes) => {
                if let Some(nul) = bytes.iter().position(|&b| b == 0) {
                    collected.extend_from_slice(&bytes[..nul]);
                    return String::from_utf8(collected).map_err(|e| {
                        Error::new(
                            ErrorKind::InvalidData,
                            format!(
                                "non-utf8 string at {:x} in pid {}: {}",
                                addr.addr(),
                                pid,
                                e
                            ),
                        )
                    });
                }
                let len = bytes.len();
                collected.extend_from_slice(&bytes);
                cursor = cursor.offset(len as isize);
                chunk = STRING_CHUNK;
            }
            Err(e) => {
                if chunk == 1 {
                    return Err(e);
                }
                chunk /= 2;
            }
        }
    }
}

pub fn poke_struct<T>(pid: Pid, addr: RemotePtr<T>, value: &T) -> Result<()>
where
    T: Sized,
{
    let bytes: &[u8] = unsafe {
        std::slice::from_raw_parts(
            value as *const T as *const u8,
            std::mem::size_of::<T>(),
        )
    };
    poke_bytes(pid, addr.cast::<u8>(), bytes)
}
