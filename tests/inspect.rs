//! end-to-end tests against a live child process.
//!
//! each test spawns a quiescent sleeper, attaches, and inspects it. on
//! kernels that restrict ptrace (yama ptrace_scope > 1) the tests skip
//! rather than fail.

use std::io::ErrorKind;
use std::process::{Child, Command};
use std::time::Duration;

use nix::unistd::Pid;

use procscope::call;
use procscope::consts::LIBC_SO;
use procscope::dlsym;
use procscope::heap;
use procscope::reflection::ReflectionCallbacks;
use procscope::session::Session;

struct Sleeper {
    child: Child,
}

impl Sleeper {
    fn spawn() -> Sleeper {
        let child = Command::new("sleep")
            .arg("30")
            .spawn()
            .expect("spawn sleep");
        // wait for the exec to settle so /proc reflects the sleeper
        std::thread::sleep(Duration::from_millis(200));
        Sleeper { child }
    }

    fn pid(&self) -> Pid {
        Pid::from_raw(self.child.id() as i32)
    }
}

impl Drop for Sleeper {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// attach, or None when the environment forbids ptrace.
fn try_session(pid: Pid) -> Option<Session> {
    match Session::new(pid) {
        Ok(session) => Some(session),
        Err(ref e) if e.kind() == ErrorKind::PermissionDenied => {
            eprintln!("skipping: ptrace not permitted here ({})", e);
            None
        }
        Err(e) => panic!("attach to {} failed: {}", pid, e),
    }
}

#[test]
fn session_reads_startup_state_of_child() {
    let sleeper = Sleeper::spawn();
    let mut session = match try_session(sleeper.pid()) {
        Some(s) => s,
        None => return,
    };

    let name = session.process_name().unwrap();
    assert!(name.contains("sleep"), "process name was {:?}", name);

    let maps = session.memory_map().unwrap();
    assert!(maps.len() > 0);
    for ent in &maps {
        assert!(ent.start < ent.end);
        assert_eq!(ent.perms.len(), 4);
    }

    let at_phdr = session.auxv().require(libc::AT_PHDR).unwrap();
    assert!(at_phdr != 0);

    // the ELF header sits one header-size below the phdr table
    let load_addr = at_phdr - 64;
    let magic = session.read_bytes(load_addr, 4).unwrap();
    assert_eq!(magic.as_slice(), b"\x7fELF");

    // AT_EXECFN points at the exec path string inside the tracee
    if let Some(execfn) = session.auxv().get(libc::AT_EXECFN) {
        let path = session.read_string(execfn).unwrap();
        assert!(path.contains("sleep"), "execfn was {:?}", path);

        let callbacks = ReflectionCallbacks::for_session(&mut session);
        let strlen = unsafe {
            (callbacks.get_string_length)(callbacks.context, execfn)
        };
        assert_eq!(strlen, path.len() as u64);
    }
}

#[test]
fn reflection_read_bytes_round_trips_elf_magic() {
    let sleeper = Sleeper::spawn();
    let mut session = match try_session(sleeper.pid()) {
        Some(s) => s,
        None => return,
    };
    let at_phdr = session.auxv().require(libc::AT_PHDR).unwrap();
    let load_addr = at_phdr - 64;

    let callbacks = ReflectionCallbacks::for_session(&mut session);
    let buf = unsafe {
        (callbacks.read_bytes)(
            callbacks.context,
            load_addr,
            4,
            std::ptr::null_mut(),
        )
    };
    assert!(!buf.is_null());
    let magic = unsafe { std::slice::from_raw_parts(buf as *const u8, 4) };
    assert_eq!(magic, b"\x7fELF");
    unsafe {
        (callbacks.free_bytes)(callbacks.context, buf, std::ptr::null_mut())
    };
}

#[test]
fn registers_round_trip_byte_identical() {
    let sleeper = Sleeper::spawn();
    let mut session = match try_session(sleeper.pid()) {
        Some(s) => s,
        None => return,
    };
    let tracer = session.tracer_mut();
    let regs = tracer.getregs().unwrap();
    tracer.setregs(&regs).unwrap();
    let again = tracer.getregs().unwrap();
    assert_eq!(regs, again);
}

#[test]
fn symbol_cache_resolves_malloc_inside_libc() {
    let sleeper = Sleeper::spawn();
    let mut session = match try_session(sleeper.pid()) {
        Some(s) => s,
        None => return,
    };

    let modules = session.modules().unwrap();
    assert!(modules.len() > 0, "link map is empty");

    let malloc = session.address_of("malloc").unwrap();
    assert!(malloc != 0);

    let maps = session.memory_map().unwrap();
    let holder = maps
        .iter()
        .find(|e| e.contains(malloc))
        .expect("malloc address not in any mapped region");
    let path = holder.pathname.as_ref().expect("malloc region unnamed");
    assert!(path.contains("libc"), "malloc resolved into {:?}", path);

    let info = session.symbol_for(malloc).unwrap();
    assert!(info.start <= malloc && malloc < info.end);
}

#[test]
fn remote_call_returns_value_and_restores_registers() {
    let sleeper = Sleeper::spawn();
    let pid = sleeper.pid();
    let mut session = match try_session(pid) {
        Some(s) => s,
        None => return,
    };

    let getpid_addr = dlsym::remote_dlsym(pid, LIBC_SO, "getpid").unwrap();
    let tracer = session.tracer_mut();
    let before = tracer.getregs().unwrap();

    let ret =
        call::call_remote_function(tracer, getpid_addr, &[], None).unwrap();
    assert_eq!(ret as i32, pid.as_raw());

    let after = tracer.getregs().unwrap();
    assert_eq!(before, after);
}

#[test]
fn injected_page_round_trips_and_unmaps() {
    let sleeper = Sleeper::spawn();
    let pid = sleeper.pid();
    let mut session = match try_session(pid) {
        Some(s) => s,
        None => return,
    };

    let page = {
        let tracer = session.tracer_mut();
        heap::remote_mmap(tracer, 4096, libc::PROT_READ | libc::PROT_WRITE)
            .unwrap()
    };

    let pattern: Vec<u8> = (0u8..16).collect();
    session.write_mem(page, &pattern).unwrap();
    let back = session.read_bytes(page, 16).unwrap();
    assert_eq!(back, pattern);

    let maps = session.memory_map().unwrap();
    assert!(maps.iter().any(|e| e.contains(page)));

    heap::remote_munmap(session.tracer_mut(), page, 4096).unwrap();
    let maps = session.memory_map().unwrap();
    assert!(!maps.iter().any(|e| e.contains(page)));
}

#[test]
fn heap_iterate_finds_allocations_on_bionic() {
    // malloc_iterate is a bionic extension; elsewhere there is nothing to
    // drive and the test degrades to the resolution failure path.
    if dlsym::local_dlsym(LIBC_SO, "malloc_iterate").is_err() {
        eprintln!("skipping: libc has no malloc_iterate (not bionic)");
        return;
    }

    let sleeper = Sleeper::spawn();
    let mut session = match try_session(sleeper.pid()) {
        Some(s) => s,
        None => return,
    };

    let mut blocks: Vec<(u64, u64)> = Vec::new();
    let total = session
        .heap_iterate(&mut |base, len| blocks.push((base, len)))
        .unwrap();
    assert_eq!(total as usize, blocks.len());
    for (base, len) in &blocks {
        assert!(*base != 0);
        assert!(*len > 0);
    }
}

#[test]
fn dropping_the_session_resumes_the_tracee() {
    let sleeper = Sleeper::spawn();
    let pid = sleeper.pid();
    let session = match try_session(pid) {
        Some(s) => s,
        None => return,
    };
    drop(session);

    // /proc/<pid>/stat field 3 is the run state; 't' means traced-stopped
    let mut state = 't';
    for _ in 0..50 {
        let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid))
            .unwrap_or_default();
        state = stat
            .rsplit(") ")
            .next()
            .and_then(|rest| rest.chars().next())
            .unwrap_or('?');
        if state != 't' && state != 'T' {
            break;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    assert!(
        state != 't' && state != 'T',
        "tracee still stopped after detach (state {})",
        state
    );
}
