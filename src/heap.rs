//! heap enumeration via bionic's `malloc_iterate`, driven remotely.
//!
//! two pages are mapped into the tracee: a data page holding a bounded
//! metadata buffer, and an rwx code page holding a small position
//! independent callback. `malloc_iterate` is then called remotely for
//! each allocator region; the callback appends `(base, length)` pairs to
//! the buffer and raises a software breakpoint when it is full, at which
//! point the tracer drains the buffer and resumes the call.

use std::io::{Error, ErrorKind, Result};

use log::{debug, warn};
use nix::unistd::Pid;

use crate::call::{call_remote_function, TrapHandler};
use crate::consts::*;
use crate::dlsym::remote_dlsym;
use crate::proc::{decode_proc_maps, ProcMapsEntry};
use crate::remote::{peek_array, poke_struct, poke_bytes, RemotePtr};
use crate::tracer::Tracer;

/// the injected callback, hand assembled. it may only use its three
/// arguments (base, length, buffer pointer), registers, and pc-relative
/// branches: no stack, no PLT, no other functions. the breakpoint is
/// followed by a nop so the tracer's fixed pc adjustment always lands on
/// a harmless instruction.
///
/// 0:  f9400443   ldr  x3, [x2, #8]        // cursor
/// 4:  f9400044   ldr  x4, [x2]            // capacity
/// 8:  eb04007f   cmp  x3, x4
/// c:  54000083   b.lo 1c <store>
/// 10: d4200000   brk  #0x0                // buffer full: handshake
/// 14: d503201f   nop
/// 18: 17fffffa   b    0 <recheck>
/// 1c: f8237840   str  x0, [x2, x3, lsl #3]
/// 20: 91000463   add  x3, x3, #1
/// 24: f8237841   str  x1, [x2, x3, lsl #3]
/// 28: 91000463   add  x3, x3, #1
/// 2c: f9000443   str  x3, [x2, #8]
/// 30: d65f03c0   ret
#[cfg(target_arch = "aarch64")]
pub const HEAP_CALLBACK: &'static [u8] = &[
    0x43, 0x04, 0x40, 0xf9, // ldr  x3, [x2, #8]
    0x44, 0x00, 0x40, 0xf9, // ldr  x4, [x2]
    0x7f, 0x00, 0x04, 0xeb, // cmp  x3, x4
    0x83, 0x00, 0x00, 0x54, // b.lo +0x10
    0x00, 0x00, 0x20, 0xd4, // brk  #0x0
    0x1f, 0x20, 0x03, 0xd5, // nop
    0xfa, 0xff, 0xff, 0x17, // b    -0x18
    0x40, 0x78, 0x23, 0xf8, // str  x0, [x2, x3, lsl #3]
    0x63, 0x04, 0x00, 0x91, // add  x3, x3, #1
    0x41, 0x78, 0x23, 0xf8, // str  x1, [x2, x3, lsl #3]
    0x63, 0x04, 0x00, 0x91, // add  x3, x3, #1
    0x43, 0x04, 0x00, 0xf9, // str  x3, [x2, #8]
    0xc0, 0x03, 0x5f, 0xd6, // ret
];

/// 0:  48 8b 42 08   mov  rax, [rdx+8]     // cursor
/// 4:  48 3b 02      cmp  rax, [rdx]       // capacity
/// 7:  72 04         jb   0xd <store>
/// 9:  cc            int3                  // buffer full: handshake
/// a:  90            nop
/// b:  eb f3         jmp  0x0 <recheck>
/// d:  48 89 3c c2   mov  [rdx+rax*8], rdi
/// 11: 48 ff c0      inc  rax
/// 14: 48 89 34 c2   mov  [rdx+rax*8], rsi
/// 18: 48 ff c0      inc  rax
/// 1b: 48 89 42 08   mov  [rdx+8], rax
/// 1f: c3            ret
#[cfg(target_arch = "x86_64")]
pub const HEAP_CALLBACK: &'static [u8] = &[
    0x48, 0x8b, 0x42, 0x08, // mov  rax, [rdx+8]
    0x48, 0x3b, 0x02, // cmp  rax, [rdx]
    0x72, 0x04, // jb   +0x04
    0xcc, // int3
    0x90, // nop
    0xeb, 0xf3, // jmp  -0x0d
    0x48, 0x89, 0x3c, 0xc2, // mov  [rdx+rax*8], rdi
    0x48, 0xff, 0xc0, // inc  rax
    0x48, 0x89, 0x34, 0xc2, // mov  [rdx+rax*8], rsi
    0x48, 0xff, 0xc0, // inc  rax
    0x48, 0x89, 0x42, 0x08, // mov  [rdx+8], rax
    0xc3, // ret
];

/// mmap in the tracee. anonymous private, tracee chooses the address.
pub fn remote_mmap(tracer: &mut Tracer, len: u64, prot: i32) -> Result<u64> {
    let mmap_addr = remote_dlsym(tracer.pid(), LIBC_SO, "mmap")?;
    let flags = libc::MAP_ANONYMOUS | libc::MAP_PRIVATE;
    let args = [
        0,
        len,
        prot as u64,
        flags as u64,
        -1i64 as u64, // fd
        0,            // offset
    ];
    let res = call_remote_function(tracer, mmap_addr, &args, None)?;
    if res as i64 == -1 || res == 0 {
        return Err(Error::new(
            ErrorKind::Other,
            format!("remote mmap of {} bytes in pid {} failed", len, tracer.pid()),
        ));
    }
    debug!("[heap] pid {} mmap({}, {:x}) -> {:x}", tracer.pid(), len, prot, res);
    Ok(res)
}

pub fn remote_munmap(tracer: &mut Tracer, addr: u64, len: u64) -> Result<()> {
    let munmap_addr = remote_dlsym(tracer.pid(), LIBC_SO, "munmap")?;
    let res =
        call_remote_function(tracer, munmap_addr, &[addr, len], None)?;
    if res as i64 == -1 {
        return Err(Error::new(
            ErrorKind::Other,
            format!(
                "remote munmap({:x}, {}) in pid {} failed",
                addr, len, tracer.pid()
            ),
        ));
    }
    Ok(())
}

fn remote_malloc_disable(tracer: &mut Tracer) -> Result<()> {
    let addr = remote_dlsym(tracer.pid(), LIBC_SO, "malloc_disable")?;
    call_remote_function(tracer, addr, &[], None).map(|_| ())
}

fn remote_malloc_enable(tracer: &mut Tracer) -> Result<()> {
    let addr = remote_dlsym(tracer.pid(), LIBC_SO, "malloc_enable")?;
    call_remote_function(tracer, addr, &[], None).map(|_| ())
}

fn remote_malloc_iterate(
    tracer: &mut Tracer,
    region_base: u64,
    region_len: u64,
    code_addr: u64,
    data_addr: u64,
    on_trap: &mut TrapHandler,
) -> Result<()> {
    let addr = remote_dlsym(tracer.pid(), LIBC_SO, "malloc_iterate")?;
    let args = [region_base, region_len, code_addr, data_addr];
    call_remote_function(tracer, addr, &args, Some(on_trap)).map(|_| ())
}

/// is this map entry one of bionic's allocator arenas?
fn is_heap_region(entry: &ProcMapsEntry) -> bool {
    if !entry.is_read() {
        return false;
    }
    match entry.pathname.as_ref() {
        Some(name) => {
            name == HEAP_REGION_LIBC_MALLOC
                || name.starts_with(HEAP_REGION_SCUDO_PREFIX)
                || name.starts_with(HEAP_REGION_GWP_ASAN_PREFIX)
        }
        None => false,
    }
}

/// read the buffer's pairs, feed them to `emit`, reset the cursor to the
/// start. returns the number of pairs drained.
fn drain_remote_buffer(
    pid: Pid,
    data_addr: u64,
    emit: &mut dyn FnMut(u64, u64),
) -> Result<u64> {
    let header: Vec<u64> =
        peek_array(pid, RemotePtr::try_from_addr(data_addr)?, 2)?;
    let capacity = header[HEAP_DATA_MAX_VALID_IDX];
    let cursor = header[HEAP_DATA_NEXT_FREE_IDX];

    if cursor < HEAP_DATA_HEADER_CELLS
        || cursor > capacity
        || (cursor - HEAP_DATA_HEADER_CELLS) % 2 != 0
    {
        return Err(Error::new(
            ErrorKind::InvalidData,
            format!(
                "heap buffer at {:x} corrupt: capacity {} cursor {}",
                data_addr, capacity, cursor
            ),
        ));
    }
    if cursor == HEAP_DATA_HEADER_CELLS {
        return Ok(0);
    }

    let cells: Vec<u64> = peek_array(
        pid,
        RemotePtr::<u64>::try_from_addr(data_addr)?.offset(2),
        (cursor - HEAP_DATA_HEADER_CELLS) as usize,
    )?;
    for pair in cells.chunks_exact(2) {
        emit(pair[0], pair[1]);
    }

    let reset: u64 = HEAP_DATA_HEADER_CELLS;
    poke_struct(
        pid,
        RemotePtr::<u64>::try_from_addr(data_addr)?.offset(1),
        &reset,
    )?;
    Ok(cells.len() as u64 / 2)
}

/// enumerate every live allocation of the tracee's malloc heap, calling
/// `emit(base, length)` once per block. returns the number of blocks.
///
/// the allocator is frozen with `malloc_disable` for the duration;
/// `malloc_enable` and the unmapping of both injected pages run on the
/// error paths too.
pub fn heap_iterate(
    tracer: &mut Tracer,
    emit: &mut dyn FnMut(u64, u64),
) -> Result<u64> {
    let pid = tracer.pid();
    let page = *PAGE_SIZE as u64;

    let data_addr =
        remote_mmap(tracer, page, libc::PROT_READ | libc::PROT_WRITE)?;
    let header: [u64; 2] = [page / 8, HEAP_DATA_HEADER_CELLS];
    poke_struct(pid, RemotePtr::try_from_addr(data_addr)?, &header)?;

    let code_addr = remote_mmap(
        tracer,
        page,
        libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
    )?;
    poke_bytes(pid, RemotePtr::try_from_addr(code_addr)?, HEAP_CALLBACK)?;

    let result = iterate_regions(tracer, data_addr, code_addr, emit);

    // re-enable allocations and release the injected pages no matter how
    // the iteration went
    if let Err(e) = remote_malloc_enable(tracer) {
        warn!("[heap] pid {} malloc_enable failed: {}", pid, e);
    }
    if let Err(e) = remote_munmap(tracer, data_addr, page) {
        warn!("[heap] pid {} munmap(data) failed: {}", pid, e);
    }
    if let Err(e) = remote_munmap(tracer, code_addr, page) {
        warn!("[heap] pid {} munmap(code) failed: {}", pid, e);
    }

    result
}

fn iterate_regions(
    tracer: &mut Tracer,
    data_addr: u64,
    code_addr: u64,
    emit: &mut dyn FnMut(u64, u64),
) -> Result<u64> {
    remote_malloc_disable(tracer)?;

    let pid = tracer.pid();
    let mut total: u64 = 0;
    let regions: Vec<ProcMapsEntry> = decode_proc_maps(pid)?
        .into_iter()
        .filter(is_heap_region)
        .collect();
    debug!("[heap] pid {} has {} allocator regions", pid, regions.len());

    for region in &regions {
        debug!(
            "[heap] pid {} iterating {:x}-{:x} {:?}",
            pid, region.start, region.end, region.pathname
        );
        {
            let mut on_trap = |tr: &mut Tracer| -> Result<bool> {
                let drained =
                    drain_remote_buffer(tr.pid(), data_addr, &mut *emit)?;
                total += drained;
                debug!("[heap] pid {} overflow drain: {} blocks", pid, drained);
                Ok(true)
            };
            if let Err(e) = remote_malloc_iterate(
                tracer,
                region.start,
                region.len(),
                code_addr,
                data_addr,
                &mut on_trap,
            ) {
                warn!(
                    "[heap] pid {} malloc_iterate over {:x}-{:x} failed: {}",
                    pid, region.start, region.end, e
                );
            }
        }
        total += drain_remote_buffer(pid, data_addr, &mut *emit)?;
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd;

    #[test]
    fn payload_fits_one_page() {
        assert!(HEAP_CALLBACK.len() < 4096);
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn payload_has_one_breakpoint_followed_by_nop() {
        let traps: Vec<usize> = HEAP_CALLBACK
            .iter()
            .enumerate()
            .filter(|(_, &b)| b == 0xcc)
            .map(|(i, _)| i)
            .collect();
        assert_eq!(traps.len(), 1);
        assert_eq!(HEAP_CALLBACK[traps[0] + 1], 0x90);
        // ends in ret
        assert_eq!(*HEAP_CALLBACK.last().unwrap(), 0xc3);
    }

    #[cfg(target_arch = "aarch64")]
    #[test]
    fn payload_has_one_breakpoint_followed_by_nop() {
        assert_eq!(HEAP_CALLBACK.len() % 4, 0);
        let words: Vec<u32> = HEAP_CALLBACK
            .chunks_exact(4)
            .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]))
            .collect();
        let traps: Vec<usize> = words
            .iter()
            .enumerate()
            .filter(|(_, &w)| w == 0xd420_0000)
            .map(|(i, _)| i)
            .collect();
        assert_eq!(traps.len(), 1);
        assert_eq!(words[traps[0] + 1], 0xd503_201f); // nop
        assert_eq!(*words.last().unwrap(), 0xd65f_03c0); // ret
    }

    fn region(perms: &str, pathname: Option<&str>) -> ProcMapsEntry {
        ProcMapsEntry {
            start: 0x1000,
            end: 0x2000,
            perms: String::from(perms),
            offset: 0,
            dev: 0,
            inode: 0,
            pathname: pathname.map(String::from),
        }
    }

    #[test]
    fn heap_region_matcher_covers_all_allocators() {
        assert!(is_heap_region(&region("rw-p", Some("[anon:libc_malloc]"))));
        assert!(is_heap_region(&region(
            "rw-p",
            Some("[anon:scudo:primary]")
        )));
        assert!(is_heap_region(&region(
            "rw-p",
            Some("[anon:GWP-ASanGuardPage]")
        )));
        assert!(!is_heap_region(&region("rw-p", Some("[anon:.bss]"))));
        assert!(!is_heap_region(&region("rw-p", Some("/usr/lib/libc.so"))));
        assert!(!is_heap_region(&region("rw-p", None)));
        // unreadable arenas are skipped
        assert!(!is_heap_region(&region("--xp", Some("[anon:libc_malloc]"))));
    }

    // the drain logic runs against the test process itself: a local buffer
    // stands in for the injected data page.
    #[test]
    fn drain_emits_pairs_and_resets_cursor() -> std::io::Result<()> {
        let mut buf: Vec<u64> = vec![0; 512];
        buf[0] = 512;
        buf[1] = 6;
        buf[2] = 0x7000_0000;
        buf[3] = 32;
        buf[4] = 0x7000_1000;
        buf[5] = 64;

        let mut got: Vec<(u64, u64)> = Vec::new();
        let n = drain_remote_buffer(
            unistd::getpid(),
            buf.as_ptr() as u64,
            &mut |base, len| got.push((base, len)),
        )?;
        assert_eq!(n, 2);
        assert_eq!(got, vec![(0x7000_0000, 32), (0x7000_1000, 64)]);
        assert_eq!(buf[1], HEAP_DATA_HEADER_CELLS);
        Ok(())
    }

    #[test]
    fn drain_of_empty_buffer_is_a_no_op() -> std::io::Result<()> {
        let buf: Vec<u64> = {
            let mut b = vec![0u64; 16];
            b[0] = 16;
            b[1] = 2;
            b
        };
        let n = drain_remote_buffer(
            unistd::getpid(),
            buf.as_ptr() as u64,
            &mut |_, _| panic!("nothing to emit"),
        )?;
        assert_eq!(n, 0);
        Ok(())
    }

    #[test]
    fn drain_rejects_corrupt_cursor() {
        let mut buf: Vec<u64> = vec![0; 16];
        buf[0] = 16;
        buf[1] = 17; // cursor beyond capacity
        let err = drain_remote_buffer(
            unistd::getpid(),
            buf.as_ptr() as u64,
            &mut |_, _| {},
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);

        buf[1] = 5; // odd pair count
        let err = drain_remote_buffer(
            unistd::getpid(),
            buf.as_ptr() as u64,
            &mut |_, _| {},
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }
}
