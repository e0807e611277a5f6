
/// name under which the tracee's C library is resolved by the dynamic
/// linker. bionic maps plain `libc.so`; glibc uses a versioned soname.
#[cfg(target_os = "android")]
pub const LIBC_SO: &'static str = "libc.so";
#[cfg(not(target_os = "android"))]
pub const LIBC_SO: &'static str = "libc.so.6";

/// layout of the remote heap-metadata buffer, an array of u64 cells:
/// cell 0 holds the capacity (in cells), cell 1 the write cursor,
/// cells 2.. hold (base, length) pairs appended by the injected callback.
pub const HEAP_DATA_MAX_VALID_IDX: usize = 0;
pub const HEAP_DATA_NEXT_FREE_IDX: usize = 1;
pub const HEAP_DATA_HEADER_CELLS: u64 = 2;

/// map-entry names bionic gives its allocator arenas.
pub const HEAP_REGION_LIBC_MALLOC: &'static str = "[anon:libc_malloc]";
pub const HEAP_REGION_SCUDO_PREFIX: &'static str = "[anon:scudo:";
pub const HEAP_REGION_GWP_ASAN_PREFIX: &'static str = "[anon:GWP-ASan";

/// byte length of the software breakpoint instruction the injected
/// callback executes on buffer overflow (`brk #0` / `int3`).
#[cfg(target_arch = "aarch64")]
pub const BREAKPOINT_INSN_SIZE: u64 = 4;
#[cfg(target_arch = "x86_64")]
pub const BREAKPOINT_INSN_SIZE: u64 = 1;

lazy_static! {
    pub static ref PAGE_SIZE: usize =
        unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize };
}

#[test]
fn page_size_sanity_check() {
    assert!(*PAGE_SIZE >= 4096);
    assert_eq!(*PAGE_SIZE % 4096, 0);
}
